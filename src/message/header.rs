use chrono::{ DateTime, TimeZone, Utc };

use super::mime::{ encode_word, format_address, Header };
use crate::store::{ Address, Message, FLAG_REPLIED, FLAG_REPLIED_ALL, STARRED_LABEL };

pub const INTERNAL_ID_DOMAIN: &str = "lightbridge.internalid";
pub const INTERNAL_ID_HEADER: &str = "X-Lb-Internal-Id";
pub const EXTERNAL_ID_HEADER: &str = "X-Lb-External-Id";
pub const DATE_HEADER: &str = "X-Lb-Date";

/// Knobs for how a message is rendered. IMAP fetches turn all of them on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct JobOptions {
    pub ignore_decryption_errors: bool,
    pub sanitize_date: bool,
    pub add_internal_id: bool,
    pub add_external_id: bool,
    pub add_message_date: bool,
    pub add_message_id_reference: bool,
}

impl JobOptions {
    pub fn imap() -> Self {
        Self {
            ignore_decryption_errors: true,
            sanitize_date: true,
            add_internal_id: true,
            add_external_id: true,
            add_message_date: true,
            add_message_id_reference: true,
        }
    }
}

/// Fallback for messages that do not know when they were sent.
pub fn fallback_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1982, 8, 13, 0, 0, 0).single().unwrap_or_default()
}

/// Message time as a date IMAP clients accept: never before the epoch.
pub fn sanitize_message_date(time: i64) -> DateTime<Utc> {
    if time <= 0 {
        return fallback_date();
    }
    Utc.timestamp_opt(time, 0).single().unwrap_or_else(fallback_date)
}

pub fn internal_reference(id: &str) -> String {
    format!("<{}@{}>", id, INTERNAL_ID_DOMAIN)
}

/// Message id carried by an internal reference, if `reference` is one.
pub fn parse_internal_reference(reference: &str) -> Option<String> {
    let inner = reference.trim().strip_prefix('<')?.strip_suffix('>')?;
    let (id, domain) = inner.rsplit_once('@')?;
    if domain != INTERNAL_ID_DOMAIN || id.is_empty() {
        return None;
    }
    Some(id.to_string())
}

fn address_list(addresses: &[Address]) -> String {
    addresses
        .iter()
        .map(|a| format_address(&a.name, &a.address))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Top-level header of a built message: the stored original header,
/// overridden by the metadata the store knows better.
pub fn message_header(message: &Message, opts: &JobOptions) -> Header {
    let mut header = message.header.clone();

    header.set("Subject", &encode_word(&message.subject));
    if !message.sender.address.is_empty() {
        header.set("From", &format_address(&message.sender.name, &message.sender.address));
    }
    if !message.reply_tos.is_empty() {
        header.set("Reply-To", &address_list(&message.reply_tos));
    }
    if !message.to_list.is_empty() {
        header.set("To", &address_list(&message.to_list));
    }
    if !message.cc_list.is_empty() {
        header.set("Cc", &address_list(&message.cc_list));
    }
    if !message.bcc_list.is_empty() {
        header.set("Bcc", &address_list(&message.bcc_list));
    }

    if !header.has("Message-Id") {
        let id = if message.external_id.is_empty() {
            internal_reference(&message.id)
        } else {
            format!("<{}>", message.external_id.trim_start_matches('<').trim_end_matches('>'))
        };
        header.set("Message-Id", &id);
    }

    if opts.sanitize_date {
        let original = header.get("Date").map(str::to_string);
        let parsed = original.as_deref().and_then(|d| DateTime::parse_from_rfc2822(d).ok());
        let valid = parsed.map(|d| d.timestamp() >= 0).unwrap_or(false);
        if !valid {
            header.set("Date", &sanitize_message_date(message.time).to_rfc2822());
            if let Some(original) = original {
                header.set("X-Original-Date", &original);
            }
        }
    }

    if opts.add_internal_id {
        header.set(INTERNAL_ID_HEADER, &message.id);
    }
    if opts.add_external_id && !message.external_id.is_empty() {
        header.set(EXTERNAL_ID_HEADER, &message.external_id);
    }
    if opts.add_message_date && message.time > 0 {
        header.set(DATE_HEADER, &sanitize_message_date(message.time).to_rfc2822());
    }
    if opts.add_message_id_reference {
        let reference = internal_reference(&message.id);
        let references = match header.get("References") {
            Some(existing) if existing.contains(&reference) => existing.to_string(),
            Some(existing) if !existing.is_empty() => format!("{} {}", existing, reference),
            _ => reference,
        };
        header.set("References", &references);
    }

    if !header.has("Mime-Version") {
        header.set("Mime-Version", "1.0");
    }

    header
}

/// IMAP system flags for the stored message state. `\Deleted` lives per
/// mailbox and is added by the caller.
pub fn imap_flags(message: &Message) -> Vec<String> {
    let mut flags = Vec::new();
    if !message.unread {
        flags.push("\\Seen".to_string());
    }
    if message.has_label(STARRED_LABEL) {
        flags.push("\\Flagged".to_string());
    }
    if message.flags & (FLAG_REPLIED | FLAG_REPLIED_ALL) != 0 {
        flags.push("\\Answered".to_string());
    }
    if message.is_draft() {
        flags.push("\\Draft".to_string());
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FLAG_RECEIVED;

    fn sample() -> Message {
        Message {
            id: "msg-1".to_string(),
            subject: "Hello".to_string(),
            sender: Address::new("Bob", "bob@example.com"),
            to_list: vec![Address::new("", "alice@example.com")],
            time: 1_600_000_000,
            flags: FLAG_RECEIVED,
            ..Message::default()
        }
    }

    #[test]
    fn test_header_from_metadata() {
        let header = message_header(&sample(), &JobOptions::imap());
        assert_eq!(header.get("Subject"), Some("Hello"));
        assert!(header.get("From").unwrap().ends_with("Bob\" <bob@example.com>"));
        assert_eq!(header.get("To"), Some("<alice@example.com>"));
        assert_eq!(header.get("Message-Id"), Some("<msg-1@lightbridge.internalid>"));
        assert_eq!(header.get(INTERNAL_ID_HEADER), Some("msg-1"));
        assert_eq!(header.get("References"), Some("<msg-1@lightbridge.internalid>"));
        assert!(header.get("Date").unwrap().contains("2020"));
    }

    #[test]
    fn test_bad_date_is_sanitized() {
        let mut message = sample();
        message.time = 0;
        message.header.set("Date", "not a date");

        let header = message_header(&message, &JobOptions::imap());
        assert_eq!(header.get("Date"), Some("Fri, 13 Aug 1982 00:00:00 +0000"));
        assert_eq!(header.get("X-Original-Date"), Some("not a date"));

        let untouched = message_header(&message, &JobOptions::default());
        assert_eq!(untouched.get("Date"), Some("not a date"));
    }

    #[test]
    fn test_references_are_extended_once() {
        let mut message = sample();
        message.header.set("References", "<a@b>");
        let header = message_header(&message, &JobOptions::imap());
        assert_eq!(header.get("References"), Some("<a@b> <msg-1@lightbridge.internalid>"));

        message.header = header;
        let again = message_header(&message, &JobOptions::imap());
        assert_eq!(again.get("References"), Some("<a@b> <msg-1@lightbridge.internalid>"));
    }

    #[test]
    fn test_parse_internal_reference() {
        assert_eq!(parse_internal_reference("<abc@lightbridge.internalid>"), Some("abc".to_string()));
        assert_eq!(parse_internal_reference("<abc@example.com>"), None);
        assert_eq!(parse_internal_reference("abc@lightbridge.internalid"), None);
    }

    #[test]
    fn test_imap_flags() {
        let mut message = sample();
        message.unread = true;
        assert!(imap_flags(&message).is_empty());

        message.unread = false;
        message.label_ids.push(STARRED_LABEL.to_string());
        message.flags |= FLAG_REPLIED;
        assert_eq!(imap_flags(&message), vec!["\\Seen", "\\Flagged", "\\Answered"]);

        message.flags = 0;
        assert!(imap_flags(&message).contains(&"\\Draft".to_string()));
    }
}
