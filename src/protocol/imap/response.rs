use chrono::{ DateTime, Utc };
use mail_parser::{ Address, MessageParser };

use crate::message::header::sanitize_message_date;
use crate::message::mime::{ encode_word, Header };
use crate::message::section::ImapBodyStructure;

/// IMAP quoted string.
pub fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Quoted string, or a literal when the text cannot be quoted.
pub fn string(text: &str) -> String {
    if !text.is_ascii() || text.contains(['\r', '\n']) {
        return format!("{{{}}}\r\n{}", text.len(), text);
    }
    quote(text)
}

pub fn nstring(text: Option<&str>) -> String {
    match text {
        Some(text) => string(text),
        None => "NIL".to_string(),
    }
}

fn is_atom_char(c: char) -> bool {
    c.is_ascii_graphic() && !matches!(c, '(' | ')' | '{' | '%' | '*' | '"' | '\\' | ']')
}

/// Atom when possible, quoted string otherwise.
pub fn astring(text: &str) -> String {
    if !text.is_empty() && text.chars().all(is_atom_char) {
        return text.to_string();
    }
    string(text)
}

/// `{n}` literal header followed by the data.
pub fn write_literal(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(format!("{{{}}}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
}

pub fn flag_list(flags: &[String]) -> String {
    format!("({})", flags.join(" "))
}

pub fn internal_date(date: DateTime<Utc>) -> String {
    quote(&date.format("%d-%b-%Y %H:%M:%S %z").to_string())
}

/** ---------------------------------------------------------------
 * ---------------------------- Envelope ---------------------------
 * --------------------------------------------------------------- */

fn address_list(address: Option<&Address>) -> String {
    let Some(address) = address else {
        return "NIL".to_string();
    };

    let mut rendered = String::new();
    for addr in address.iter() {
        let email = addr.address().unwrap_or_default();
        let (mailbox, host) = match email.rsplit_once('@') {
            Some((mailbox, host)) => (Some(mailbox), Some(host)),
            None if email.is_empty() => (None, None),
            None => (Some(email), None),
        };
        let name = addr
            .name()
            .filter(|n| !n.is_empty())
            .map(encode_word);
        rendered.push_str(
            &format!("({} NIL {} {})", nstring(name.as_deref()), nstring(mailbox), nstring(host))
        );
    }

    if rendered.is_empty() {
        return "NIL".to_string();
    }
    format!("({})", rendered)
}

/// ENVELOPE structure of a header block. `time` stands in for a missing
/// Date field.
pub fn envelope(header: &Header, time: i64) -> String {
    let bytes = header.to_bytes();
    let parsed = MessageParser::default().parse(&bytes);

    let date = match header.get("Date") {
        Some(date) => date.to_string(),
        None => sanitize_message_date(time).to_rfc2822(),
    };
    let subject = header.get("Subject");

    let (from, sender, reply_to, to, cc, bcc) = match &parsed {
        Some(message) => {
            let from = address_list(message.from());
            let sender = match message.sender() {
                Some(sender) => address_list(Some(sender)),
                None => from.clone(),
            };
            let reply_to = match message.reply_to() {
                Some(reply_to) => address_list(Some(reply_to)),
                None => from.clone(),
            };
            (
                from,
                sender,
                reply_to,
                address_list(message.to()),
                address_list(message.cc()),
                address_list(message.bcc()),
            )
        }
        None => {
            let nil = "NIL".to_string();
            (nil.clone(), nil.clone(), nil.clone(), nil.clone(), nil.clone(), nil)
        }
    };

    format!(
        "({} {} {} {} {} {} {} {} {} {})",
        string(&date),
        nstring(subject),
        from,
        sender,
        reply_to,
        to,
        cc,
        bcc,
        nstring(header.get("In-Reply-To")),
        nstring(header.get("Message-Id"))
    )
}

/** ---------------------------------------------------------------
 * ------------------------- Body structure ------------------------
 * --------------------------------------------------------------- */

fn param_list(params: &std::collections::BTreeMap<String, String>) -> String {
    if params.is_empty() {
        return "NIL".to_string();
    }
    let pairs: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{} {}", string(&k.to_ascii_uppercase()), string(v)))
        .collect();
    format!("({})", pairs.join(" "))
}

const EMPTY_ENVELOPE: &str = "(NIL NIL NIL NIL NIL NIL NIL NIL NIL NIL)";
const EMPTY_BODY: &str = "(\"TEXT\" \"PLAIN\" NIL NIL NIL \"7BIT\" 0 0)";

/// BODY (`extended == false`) or BODYSTRUCTURE rendering of a part.
pub fn body_structure(part: &ImapBodyStructure, extended: bool) -> String {
    if part.mime_type.eq_ignore_ascii_case("multipart") {
        let children: String = part.parts
            .iter()
            .map(|child| body_structure(child, extended))
            .collect();
        if children.is_empty() {
            return EMPTY_BODY.to_string();
        }
        let mut rendered = format!("({} {}", children, string(&part.mime_subtype.to_ascii_uppercase()));
        if extended {
            rendered.push_str(&format!(" {} {} NIL NIL", param_list(&part.params), disposition(part)));
        }
        rendered.push(')');
        return rendered;
    }

    let mut rendered = format!(
        "({} {} {} {} {} {} {}",
        string(&part.mime_type.to_ascii_uppercase()),
        string(&part.mime_subtype.to_ascii_uppercase()),
        param_list(&part.params),
        nstring(part.id.as_deref()),
        nstring(part.description.as_deref()),
        string(&part.encoding.as_deref().unwrap_or("7BIT").to_ascii_uppercase()),
        part.size
    );

    let is_message =
        part.mime_type.eq_ignore_ascii_case("message") && part.mime_subtype.eq_ignore_ascii_case("rfc822");
    if is_message {
        // Embedded messages are not indexed further.
        let inner = match part.parts.first() {
            Some(inner) => body_structure(inner, extended),
            None => EMPTY_BODY.to_string(),
        };
        rendered.push_str(&format!(" {} {} {}", EMPTY_ENVELOPE, inner, part.lines));
    } else if part.mime_type.eq_ignore_ascii_case("text") {
        rendered.push_str(&format!(" {}", part.lines));
    }

    if extended {
        rendered.push_str(&format!(" NIL {} NIL NIL", disposition(part)));
    }
    rendered.push(')');
    rendered
}

fn disposition(part: &ImapBodyStructure) -> String {
    match &part.disposition {
        Some((kind, params)) if !kind.is_empty() => {
            format!("({} {})", string(&kind.to_ascii_uppercase()), param_list(params))
        }
        _ => "NIL".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::mime::parse_header;
    use crate::message::section::BodyStructure;
    use chrono::TimeZone;

    #[test]
    fn test_strings() {
        assert_eq!(quote("a \"b\" \\c"), "\"a \\\"b\\\" \\\\c\"");
        assert_eq!(astring("INBOX"), "INBOX");
        assert_eq!(astring("All Mail"), "\"All Mail\"");
        assert_eq!(astring(""), "\"\"");
        assert_eq!(string("naïve"), "{6}\r\nnaïve");
        assert_eq!(nstring(None), "NIL");
    }

    #[test]
    fn test_internal_date() {
        let date = Utc.with_ymd_and_hms(2020, 9, 13, 12, 26, 40).unwrap();
        assert_eq!(internal_date(date), "\"13-Sep-2020 12:26:40 +0000\"");
    }

    #[test]
    fn test_envelope() {
        let (header, _) = parse_header(
            b"Date: Sun, 13 Sep 2020 12:26:40 +0000\r\nSubject: Hello\r\nFrom: \"Bob\" <bob@example.com>\r\nTo: <alice@example.com>, carol@example.org\r\nMessage-Id: <m1@example.com>\r\n\r\n"
        );
        let rendered = envelope(&header, 0);
        assert_eq!(
            rendered,
            "(\"Sun, 13 Sep 2020 12:26:40 +0000\" \"Hello\" ((\"Bob\" NIL \"bob\" \"example.com\")) ((\"Bob\" NIL \"bob\" \"example.com\")) ((\"Bob\" NIL \"bob\" \"example.com\")) ((NIL NIL \"alice\" \"example.com\")(NIL NIL \"carol\" \"example.org\")) NIL NIL NIL \"<m1@example.com>\")"
        );
    }

    #[test]
    fn test_envelope_without_date_uses_time() {
        let header = Header::new();
        let rendered = envelope(&header, 1_600_000_000);
        assert!(rendered.starts_with("(\"Sun, 13 Sep 2020 12:26:40 +0000\" NIL NIL"));
    }

    #[test]
    fn test_body_structure_of_simple_message() {
        let literal = b"Content-Type: text/plain; charset=utf-8\r\n\r\nline one\r\nline two\r\n";
        let structure = BodyStructure::parse(literal).unwrap().imap_body_structure(&[]).unwrap();
        let body = body_structure(&structure, false);
        assert_eq!(body, "(\"TEXT\" \"PLAIN\" (\"CHARSET\" \"utf-8\") NIL NIL \"7BIT\" 20 2)");
    }

    #[test]
    fn test_body_structure_of_multipart() {
        let literal =
            b"Content-Type: multipart/mixed; boundary=x\r\n\r\n--x\r\nContent-Type: text/plain\r\n\r\nhi\r\n--x\r\nContent-Type: application/pdf; name=a.pdf\r\nContent-Disposition: attachment; filename=a.pdf\r\nContent-Transfer-Encoding: base64\r\n\r\nAAAA\r\n--x--\r\n";
        let structure = BodyStructure::parse(literal).unwrap().imap_body_structure(&[]).unwrap();

        let body = body_structure(&structure, false);
        assert!(body.starts_with("((\"TEXT\" \"PLAIN\" NIL NIL NIL \"7BIT\" "));
        assert!(body.contains(")(\"APPLICATION\" \"PDF\" (\"NAME\" \"a.pdf\") NIL NIL \"BASE64\" "));
        assert!(body.ends_with(" \"MIXED\")"));

        let extended = body_structure(&structure, true);
        assert!(extended.contains("(\"ATTACHMENT\" (\"FILENAME\" \"a.pdf\"))"));
        assert!(extended.ends_with("\"MIXED\" (\"BOUNDARY\" \"x\") NIL NIL NIL)"));
    }
}
