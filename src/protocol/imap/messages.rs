use anyhow::Result;
use chrono::{ DateTime, NaiveDate };
use tracing::{ debug, info, warn };

use super::command::state::{ SearchCriteria, SequenceRange, SequenceSet, StoreOperation };
use super::mailbox::{ Mailbox, MailboxError };
use super::response::flag_list;
use super::uidplus::{ CopyUids, OrderedSeq };
use super::updates::Operation;
use crate::message::header::{ imap_flags, message_header, sanitize_message_date, JobOptions };
use crate::store::{
    StoreMessage,
    ALL_MAIL_LABEL,
    FLAG_REPLIED,
    FLAG_REPLIED_ALL,
    INBOX_LABEL,
    SENT_LABEL,
    SPAM_LABEL,
};

/// Which system flags a STORE names.
#[derive(Debug, Default)]
struct FlagSet {
    seen: bool,
    flagged: bool,
    deleted: bool,
    junk: bool,
    non_junk: bool,
}

impl FlagSet {
    fn from_flags(flags: &[String]) -> Self {
        let mut set = FlagSet::default();
        for flag in flags {
            match flag.to_ascii_lowercase().as_str() {
                "\\seen" => {
                    set.seen = true;
                }
                "\\flagged" => {
                    set.flagged = true;
                }
                "\\deleted" => {
                    set.deleted = true;
                }
                "$junk" | "junk" => {
                    set.junk = true;
                }
                "nonjunk" | "$notjunk" => {
                    set.non_junk = true;
                }
                // \Answered and \Draft follow the store, \Recent is server-only.
                other => debug!(flag = other, "Ignoring flag"),
            }
        }
        set
    }
}

impl Mailbox {
    /// STORE and UID STORE.
    pub async fn update_messages_flags(
        &self,
        uid: bool,
        set: &SequenceSet,
        operation: StoreOperation,
        silent: bool,
        flags: &[String],
        out: &mut Vec<u8>
    ) -> Result<()> {
        let _block = self.user.shared.updates.block(self.user.email(), self.name(), Operation::UpdateMessage);

        let ids = self.resolve_ids(set, uid).await?;
        if ids.is_empty() {
            return Ok(());
        }
        let wanted = FlagSet::from_flags(flags);
        debug!(mailbox = %self.name(), ?operation, ?wanted, count = ids.len(), "Updating flags");

        let store = self.store.as_ref();
        match operation {
            StoreOperation::Add => {
                if wanted.seen {
                    store.mark_messages_read(&ids).await?;
                }
                if wanted.flagged {
                    store.mark_messages_starred(&ids).await?;
                }
                if wanted.deleted {
                    store.mark_messages_deleted(&ids).await?;
                }
            }
            StoreOperation::Remove => {
                if wanted.seen {
                    store.mark_messages_unread(&ids).await?;
                }
                if wanted.flagged {
                    store.mark_messages_unstarred(&ids).await?;
                }
                if wanted.deleted {
                    store.mark_messages_undeleted(&ids).await?;
                }
            }
            StoreOperation::Replace => {
                if wanted.seen {
                    store.mark_messages_read(&ids).await?;
                } else {
                    store.mark_messages_unread(&ids).await?;
                }
                if wanted.flagged {
                    store.mark_messages_starred(&ids).await?;
                } else {
                    store.mark_messages_unstarred(&ids).await?;
                }
                if wanted.deleted {
                    store.mark_messages_deleted(&ids).await?;
                } else {
                    store.mark_messages_undeleted(&ids).await?;
                }
            }
        }

        // Junk toggling moves the message instead of tagging it.
        if wanted.junk {
            let spam = self.user.system_mailbox(SPAM_LABEL).await?;
            if operation == StoreOperation::Remove {
                spam.unlabel_messages(&ids).await?;
            } else {
                spam.label_messages(&ids).await?;
                if self.label_id() == INBOX_LABEL {
                    self.store.unlabel_messages(&ids).await?;
                }
            }
        }
        if wanted.non_junk && operation != StoreOperation::Remove {
            let inbox = self.user.system_mailbox(INBOX_LABEL).await?;
            inbox.label_messages(&ids).await?;
            if self.label_id() == SPAM_LABEL {
                self.store.unlabel_messages(&ids).await?;
            }
        }

        if silent {
            return Ok(());
        }
        for id in &ids {
            // Junk moves can take the message out of this mailbox.
            let Ok(stored) = self.store.message(id).await else {
                continue;
            };
            let mut flags = imap_flags(stored.message());
            if stored.is_marked_deleted() {
                flags.push("\\Deleted".to_string());
            }
            let mut line = format!("* {} FETCH (FLAGS {}", stored.sequence_number(), flag_list(&flags));
            if uid {
                line.push_str(&format!(" UID {}", stored.uid()));
            }
            line.push_str(")\r\n");
            out.extend_from_slice(line.as_bytes());
        }
        Ok(())
    }

    /// COPY and MOVE, plus their UID forms.
    pub async fn copy_messages(&self, uid: bool, set: &SequenceSet, target: &str, moving: bool) -> Result<CopyUids> {
        let target = self.user.get_mailbox(target).await?;
        let (from, to) = (self.label_id(), target.label_id());

        let inbox_sent =
            (from == INBOX_LABEL && to == SENT_LABEL) || (from == SENT_LABEL && to == INBOX_LABEL);
        if inbox_sent {
            return Err(MailboxError::InboxSentMove.into());
        }
        if moving && from == ALL_MAIL_LABEL {
            return Err(MailboxError::MoveFromAllMail.into());
        }

        let ids = self.resolve_ids(set, uid).await?;
        if ids.is_empty() {
            return Ok(CopyUids::default());
        }
        let source_uids: OrderedSeq = self.store.uid_list(&ids).await?.into_iter().collect();

        let mut deleted = Vec::new();
        for id in &ids {
            match self.store.message(id).await {
                Ok(stored) if stored.is_marked_deleted() => deleted.push(id.clone()),
                Ok(_) => {}
                Err(err) => debug!(msg_id = %id, error = %err, "Message gone before it could be copied"),
            }
        }

        target.store.label_messages(&ids).await?;
        if moving {
            // EXPUNGE pushes of the source must reach the client before the
            // tagged response.
            let _block = self.user.shared.updates.block(self.user.email(), self.name(), Operation::DeleteMessage);
            self.store.unlabel_messages(&ids).await?;
        }
        if !deleted.is_empty() {
            target.store.mark_messages_deleted(&deleted).await?;
        }

        let target_uids: OrderedSeq = target.store.uid_list(&ids).await?.into_iter().collect();
        let uid_validity = target.store.uid_validity().await?;
        info!(from = %self.name(), to = %target.name(), count = ids.len(), moving, "Messages copied");
        Ok(CopyUids { uid_validity, source: source_uids, target: target_uids })
    }

    /// SEARCH and UID SEARCH. Writes the untagged SEARCH response to `out`.
    pub async fn search_messages(&self, uid: bool, criteria: &[SearchCriteria], out: &mut Vec<u8>) -> Result<()> {
        if criteria.iter().any(is_unsupported) {
            return Err(MailboxError::Unsupported("unsupported search query".to_string()).into());
        }

        let all = SequenceSet { ranges: vec![SequenceRange { start: 1, stop: 0 }] };
        let ids = self.resolve_ids(&all, false).await?;
        let mut messages = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.store.message(id).await {
                Ok(stored) => messages.push(stored),
                Err(err) => debug!(msg_id = %id, error = %err, "Message gone before it could be searched"),
            }
        }

        let last = Bounds {
            seq: messages.len() as u32,
            uid: messages.iter().map(|m| m.uid()).max().unwrap_or(0),
        };
        let mut found = Vec::new();
        for stored in &messages {
            if criteria.iter().all(|c| matches_criteria(stored.as_ref(), c, &last)) {
                found.push(if uid { stored.uid() } else { stored.sequence_number() });
            }
        }

        debug!(mailbox = %self.name(), uid, found = found.len(), "Search done");
        let mut line = String::from("* SEARCH");
        for n in found {
            line.push_str(&format!(" {}", n));
        }
        line.push_str("\r\n");
        out.extend_from_slice(line.as_bytes());
        Ok(())
    }
}

fn is_unsupported(criteria: &SearchCriteria) -> bool {
    match criteria {
        SearchCriteria::Not(_) | SearchCriteria::Or(..) => true,
        SearchCriteria::And(inner) => inner.iter().any(is_unsupported),
        _ => false,
    }
}

/// Values `*` stands for.
struct Bounds {
    seq: u32,
    uid: u32,
}

fn matches_criteria(stored: &dyn StoreMessage, criteria: &SearchCriteria, last: &Bounds) -> bool {
    let message = stored.message();
    let answered = message.flags & (FLAG_REPLIED | FLAG_REPLIED_ALL) != 0;
    let starred = imap_flags(message).iter().any(|f| f == "\\Flagged");
    let internal = sanitize_message_date(message.time).date_naive();

    match criteria {
        SearchCriteria::All | SearchCriteria::Old => true,
        SearchCriteria::New | SearchCriteria::Recent => false,
        SearchCriteria::SequenceSet(set) => set.contains(stored.sequence_number(), last.seq),
        SearchCriteria::Uid(set) => set.contains(stored.uid(), last.uid),
        SearchCriteria::Seen => !message.unread,
        SearchCriteria::Unseen => message.unread,
        SearchCriteria::Flagged => starred,
        SearchCriteria::Unflagged => !starred,
        SearchCriteria::Deleted => stored.is_marked_deleted(),
        SearchCriteria::Undeleted => !stored.is_marked_deleted(),
        SearchCriteria::Draft => message.is_draft(),
        SearchCriteria::Undraft => !message.is_draft(),
        SearchCriteria::Answered => answered,
        SearchCriteria::Unanswered => !answered,
        SearchCriteria::Before(date) => internal < *date,
        SearchCriteria::On(date) => internal == *date,
        SearchCriteria::Since(date) => internal >= *date,
        SearchCriteria::SentBefore(date) => sent_date(stored).map(|d| d < *date).unwrap_or(false),
        SearchCriteria::SentOn(date) => sent_date(stored).map(|d| d == *date).unwrap_or(false),
        SearchCriteria::SentSince(date) => sent_date(stored).map(|d| d >= *date).unwrap_or(false),
        SearchCriteria::Larger(n) => message.size > 0 && message.size > i64::from(*n),
        SearchCriteria::Smaller(n) => message.size > 0 && message.size < i64::from(*n),
        SearchCriteria::Subject(text) => contains(&message.subject, text),
        SearchCriteria::From(text) => header_contains(stored, "From", text),
        SearchCriteria::To(text) => header_contains(stored, "To", text),
        SearchCriteria::Cc(text) => header_contains(stored, "Cc", text),
        SearchCriteria::Bcc(text) => header_contains(stored, "Bcc", text),
        SearchCriteria::Header(name, text) => header_contains(stored, name, text),
        SearchCriteria::Keyword(keyword) => has_keyword(stored, keyword),
        SearchCriteria::Unkeyword(keyword) => !has_keyword(stored, keyword),
        SearchCriteria::Body(_) | SearchCriteria::Text(_) => {
            warn!("Body search is not supported, ignoring key");
            true
        }
        SearchCriteria::And(inner) => inner.iter().all(|c| matches_criteria(stored, c, last)),
        SearchCriteria::Not(_) | SearchCriteria::Or(..) => false,
    }
}

fn contains(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn header_contains(stored: &dyn StoreMessage, name: &str, text: &str) -> bool {
    let header = message_header(stored.message(), &JobOptions::imap());
    let found = header.get_all(name).any(|value| contains(value, text));
    found
}

fn has_keyword(stored: &dyn StoreMessage, keyword: &str) -> bool {
    imap_flags(stored.message())
        .iter()
        .any(|f| f.eq_ignore_ascii_case(keyword))
}

/// Day of the Date header, falling back to the internal date.
fn sent_date(stored: &dyn StoreMessage) -> Option<NaiveDate> {
    let message = stored.message();
    let parsed = message.header
        .get("Date")
        .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
        .map(|d| d.date_naive());
    parsed.or_else(|| Some(sanitize_message_date(message.time).date_naive()))
}
