use std::sync::Arc;

use anyhow::{ bail, Result };
use chrono::{ DateTime, Utc };
use mail_parser::{ Address as MailAddress, MessageParser };
use tracing::{ debug, info };

use super::mailbox::Mailbox;
use super::uidplus::{ append_response, OrderedSeq };
use crate::message::encrypt::encrypt_rfc822;
use crate::message::header::{ parse_internal_reference, INTERNAL_ID_HEADER };
use crate::message::mime::{ parse_header, Header };
use crate::store::{
    Address,
    ImportRequest,
    StoreMailbox,
    ALL_MAIL_LABEL,
    ARCHIVE_LABEL,
    DRAFT_LABEL,
    FLAG_RECEIVED,
    FLAG_REPLIED,
    FLAG_SENT,
    SENT_LABEL,
    STARRED_LABEL,
};

fn addresses(address: Option<&MailAddress>) -> Vec<Address> {
    let Some(address) = address else {
        return Vec::new();
    };
    address
        .iter()
        .filter_map(|addr| {
            let email = addr.address()?;
            Some(Address::new(addr.name().unwrap_or_default(), email))
        })
        .collect()
}

fn has_flag(flags: &[String], wanted: &str) -> bool {
    flags.iter().any(|f| f.eq_ignore_ascii_case(wanted))
}

impl Mailbox {
    /// APPEND. Returns the UIDPLUS status text.
    pub async fn create_message(
        &self,
        flags: &[String],
        date: Option<DateTime<Utc>>,
        literal: &[u8]
    ) -> Result<String> {
        let limit = self.user.append_limit().await;
        if limit > 0 && literal.len() > (limit as usize) {
            bail!("message is larger than the append limit of {} bytes", limit);
        }

        let _lock = self.user.append_expunge_lock.lock().await;
        let (header, _) = parse_header(literal);
        let label_id = self.label_id();

        // Clients that MOVE with APPEND + EXPUNGE re-send messages they got
        // from us; those are re-labelled instead of imported twice.
        if let Some(id) = self.internal_id(&header).await {
            debug!(msg_id = %id, mailbox = %self.name(), "Appended message already exists");
            if label_id != ALL_MAIL_LABEL {
                self.store.label_messages(&[id.clone()]).await?;
            }
            self.store.mark_messages_undeleted(&[id.clone()]).await?;
            return self.appended(&id).await;
        }

        let external_id = header.get("Message-Id").unwrap_or_default().to_string();
        if label_id == SENT_LABEL && !external_id.is_empty() {
            let uid = self.store.uid_by_external_id(&external_id).await?;
            if uid > 0 {
                info!(mailbox = %self.name(), uid, "Sent message already exists");
                let uid_validity = self.store.uid_validity().await?;
                return Ok(append_response(uid_validity, &OrderedSeq::from_iter([uid])));
            }
        }

        let request = self.import_request(flags, date, literal, external_id).await?;
        let id = if label_id == DRAFT_LABEL {
            self.store.create_draft(request).await?
        } else if label_id == ALL_MAIL_LABEL {
            // All Mail is a view; its messages have to live somewhere.
            let archive: Arc<dyn StoreMailbox> = self.user.system_mailbox(ARCHIVE_LABEL).await?;
            archive.import_message(request).await?
        } else {
            self.store.import_message(request).await?
        };

        info!(msg_id = %id, mailbox = %self.name(), size = literal.len(), "Message appended");
        self.appended(&id).await
    }

    /// Message of this address a re-appended literal was built from.
    async fn internal_id(&self, header: &Header) -> Option<String> {
        let candidate = header
            .get(INTERNAL_ID_HEADER)
            .map(|id| id.trim().to_string())
            .or_else(|| {
                header
                    .get("References")
                    .and_then(|refs| refs.split_whitespace().rev().find_map(parse_internal_reference))
            })?;

        match self.user.client().get_message(&candidate).await {
            Ok(message) if message.address_id == self.user.address().id() => Some(candidate),
            Ok(_) => None,
            Err(err) => {
                debug!(msg_id = %candidate, error = %err, "Referenced message not found");
                None
            }
        }
    }

    async fn import_request(
        &self,
        flags: &[String],
        date: Option<DateTime<Utc>>,
        literal: &[u8],
        external_id: String
    ) -> Result<ImportRequest> {
        let parsed = MessageParser::default().parse(literal);
        let (subject, sender, to_list, cc_list, bcc_list) = match &parsed {
            Some(message) => (
                message.subject().unwrap_or_default().to_string(),
                addresses(message.from()).into_iter().next().unwrap_or_default(),
                addresses(message.to()),
                addresses(message.cc()),
                addresses(message.bcc()),
            ),
            None => Default::default(),
        };

        let key_ring = self.user.client().key_ring_for_address(&self.user.address().id()).await?;
        let encrypted = encrypt_rfc822(key_ring.as_ref(), literal)?;

        let mut message_flags = if encrypted.header.has("Received") { FLAG_RECEIVED } else { FLAG_SENT };
        if has_flag(flags, "\\Draft") {
            message_flags = 0;
        }
        if has_flag(flags, "\\Answered") {
            message_flags |= FLAG_REPLIED;
        }

        let mut label_ids = vec![self.label_id()];
        if has_flag(flags, "\\Flagged") {
            label_ids.push(STARRED_LABEL.to_string());
        }

        let time = date
            .or_else(|| {
                encrypted.header
                    .get("Date")
                    .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
                    .map(|d| d.with_timezone(&Utc))
            })
            .unwrap_or_else(Utc::now)
            .timestamp();

        Ok(ImportRequest {
            label_ids,
            unread: !has_flag(flags, "\\Seen"),
            flags: message_flags,
            time,
            external_id,
            subject,
            sender,
            to_list,
            cc_list,
            bcc_list,
            header: encrypted.header,
            mime_type: encrypted.mime_type,
            body: encrypted.body,
            size: literal.len() as i64,
        })
    }

    async fn appended(&self, id: &str) -> Result<String> {
        let uids: OrderedSeq = self.store.uid_list(&[id.to_string()]).await?.into_iter().collect();
        let uid_validity = self.store.uid_validity().await?;
        Ok(append_response(uid_validity, &uids))
    }
}
