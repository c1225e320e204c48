use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tracing::{ debug, info };

use super::command::state::SequenceSet;
use super::updates::Operation;
use super::user::User;
use crate::store::{
    StoreMailbox,
    ALL_MAIL_LABEL,
    ARCHIVE_LABEL,
    DRAFT_LABEL,
    SENT_LABEL,
    SPAM_LABEL,
    TRASH_LABEL,
};

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("no such mailbox: {0}")]
    NoSuchMailbox(String),

    #[error("move from Inbox to Sent or from Sent to Inbox is not allowed")]
    InboxSentMove,

    #[error("move from All Mail is not allowed")]
    MoveFromAllMail,

    #[error("no mailbox selected")]
    NoSelectedMailbox,

    #[error("{0}")]
    Unsupported(String),
}

/// Flags offered by SELECT and STATUS. The upper-case twins are there for
/// clients that compare case-sensitively.
pub const MAILBOX_FLAGS: [&str; 11] = [
    "\\Seen",
    "\\SEEN",
    "\\Flagged",
    "\\FLAGGED",
    "\\Deleted",
    "\\DELETED",
    "\\Draft",
    "\\DRAFT",
    "$Junk",
    "Junk",
    "NonJunk",
];

/// LIST attributes of a mailbox.
pub fn mailbox_attributes(mailbox: &dyn StoreMailbox) -> Vec<String> {
    let mut attributes = Vec::new();
    if !mailbox.is_folder() || mailbox.is_system() {
        attributes.push("\\Noinferiors".to_string());
    }

    let special = match mailbox.label_id().as_str() {
        SENT_LABEL => Some("\\Sent"),
        TRASH_LABEL => Some("\\Trash"),
        SPAM_LABEL => Some("\\Junk"),
        ARCHIVE_LABEL => Some("\\Archive"),
        ALL_MAIL_LABEL => Some("\\All"),
        DRAFT_LABEL => Some("\\Drafts"),
        _ => None,
    };
    attributes.extend(special.map(str::to_string));
    attributes
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    pub messages: u32,
    pub unseen: u32,
    /// Sequence number of the first unseen message, 0 if there is none.
    pub first_unseen: u32,
    pub uid_next: u32,
    pub uid_validity: u32,
}

/// A mailbox as one user sees it.
pub struct Mailbox {
    pub(super) user: Arc<User>,
    pub(super) store: Arc<dyn StoreMailbox>,
    name: String,
    storage_id: String,
}

impl Mailbox {
    pub fn new(user: Arc<User>, store: Arc<dyn StoreMailbox>) -> Self {
        let name = store.name();
        let storage_id = store.storage_id();
        Self { user, store, name, storage_id }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label_id(&self) -> String {
        self.store.label_id()
    }

    /// Key of the mailbox in the expunge barrier map.
    pub fn storage_id(&self) -> &str {
        &self.storage_id
    }

    pub fn attributes(&self) -> Vec<String> {
        mailbox_attributes(self.store.as_ref())
    }

    pub async fn status(&self) -> Result<MailboxStatus> {
        let counts = self.store.counts().await?;
        let status = MailboxStatus {
            messages: counts.total,
            unseen: counts.unread,
            first_unseen: counts.unread_seq,
            uid_next: self.store.next_uid().await?,
            uid_validity: self.store.uid_validity().await?,
        };
        debug!(mailbox = %self.name, ?status, "Mailbox status");
        Ok(status)
    }

    pub async fn set_subscribed(&self, subscribed: bool) -> Result<()> {
        self.user.set_subscribed(&self.label_id(), subscribed).await
    }

    /// Message ids a sequence set names, by UID or by sequence number.
    pub async fn resolve_ids(&self, set: &SequenceSet, uid: bool) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();

        for range in &set.ranges {
            let found = if range.start == 0 && range.stop == 0 {
                self.store.latest_api_id().await?.into_iter().collect()
            } else if range.start == 0 {
                self.store.api_ids(uid, range.stop, 0).await?
            } else {
                self.store.api_ids(uid, range.start, range.stop).await?
            };

            for id in found {
                if seen.insert(id.clone()) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    fn destroys_on_expunge(&self) -> bool {
        matches!(self.label_id().as_str(), TRASH_LABEL | SPAM_LABEL)
    }

    /// Removes the messages marked `\Deleted`, all of them or, for UID
    /// EXPUNGE, only those in `uids`.
    pub async fn expunge(&self, uids: Option<&SequenceSet>) -> Result<()> {
        let shared = &self.user.shared;
        let _block = shared.updates.block(self.user.email(), &self.name, Operation::DeleteMessage);

        let _lock = if self.destroys_on_expunge() {
            Some(self.user.append_expunge_lock.lock().await)
        } else {
            None
        };

        let ids = match uids {
            Some(set) => Some(self.resolve_ids(set, true).await?),
            None => None,
        };

        let (allowed, wait) = shared.updates.can_delete(&self.storage_id);
        if !allowed {
            if let Some(wait) = wait {
                wait.wait().await;
            }
        }

        self.store.remove_deleted(ids.as_deref()).await?;
        info!(mailbox = %self.name, "Mailbox expunged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::backend::test_support::*;
    use super::*;
    use crate::protocol::imap::command::state::SequenceRange;
    use std::sync::atomic::{ AtomicBool, Ordering };
    use std::time::Duration;
    use tokio::time::sleep;

    fn range(start: u32, stop: u32) -> SequenceSet {
        SequenceSet { ranges: vec![SequenceRange { start, stop }] }
    }

    #[tokio::test]
    async fn test_status_and_attributes() {
        let fixture = fixture().await;
        let first = fixture.deliver("one", "1").await;
        fixture.deliver("two", "2").await;
        let user = fixture.login().await;

        let inbox = user.get_mailbox("inbox").await.unwrap();
        assert_eq!(inbox.name(), "INBOX");
        assert!(inbox.attributes().contains(&"\\Noinferiors".to_string()));

        inbox.store.mark_messages_read(&[first]).await.unwrap();
        let status = inbox.status().await.unwrap();
        assert_eq!(status.messages, 2);
        assert_eq!(status.unseen, 1);
        assert_eq!(status.first_unseen, 2);
        assert_eq!(status.uid_next, 3);
        assert!(status.uid_validity > 0);

        let trash = user.get_mailbox("Trash").await.unwrap();
        assert_eq!(trash.attributes(), vec!["\\Noinferiors".to_string(), "\\Trash".to_string()]);
    }

    #[tokio::test]
    async fn test_resolve_ids() {
        let fixture = fixture().await;
        let a = fixture.deliver("a", "a").await;
        let b = fixture.deliver("b", "b").await;
        let c = fixture.deliver("c", "c").await;
        let user = fixture.login().await;
        let inbox = user.get_mailbox("INBOX").await.unwrap();

        assert_eq!(inbox.resolve_ids(&range(2, 0), false).await.unwrap(), vec![b.clone(), c.clone()]);
        assert_eq!(inbox.resolve_ids(&range(0, 0), true).await.unwrap(), vec![c.clone()]);
        assert_eq!(inbox.resolve_ids(&range(9, 0), true).await.unwrap(), vec![c.clone()]);

        let set = SequenceSet {
            ranges: vec![SequenceRange { start: 1, stop: 2 }, SequenceRange { start: 2, stop: 2 }],
        };
        assert_eq!(inbox.resolve_ids(&set, true).await.unwrap(), vec![a, b]);
    }

    #[tokio::test]
    async fn test_uid_expunge_only_touches_listed_uids() {
        let fixture = fixture().await;
        let a = fixture.deliver("a", "a").await;
        let b = fixture.deliver("b", "b").await;
        let user = fixture.login().await;
        let inbox = user.get_mailbox("INBOX").await.unwrap();

        inbox.store.mark_messages_deleted(&[a.clone(), b.clone()]).await.unwrap();
        inbox.expunge(Some(&SequenceSet::single(1))).await.unwrap();

        let remaining = inbox.resolve_ids(&range(1, 0), true).await.unwrap();
        assert_eq!(remaining, vec![b]);
        // Expunging a label only detaches it.
        assert!(fixture.store.peek_message(&a).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_expunge_waits_for_running_fetch() {
        let fixture = fixture().await;
        let a = fixture.deliver("a", "a").await;
        let user = fixture.login().await;
        let inbox = user.get_mailbox("INBOX").await.unwrap();
        inbox.store.mark_messages_deleted(&[a]).await.unwrap();

        let barrier = user.shared.updates.forbid_expunge(inbox.storage_id());
        let done = Arc::new(AtomicBool::new(false));
        let task = {
            let inbox = inbox.clone();
            let done = done.clone();
            tokio::spawn(async move {
                inbox.expunge(None).await.unwrap();
                done.store(true, Ordering::SeqCst);
            })
        };

        sleep(Duration::from_millis(100)).await;
        assert!(!done.load(Ordering::SeqCst));
        drop(barrier);
        task.await.unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(inbox.status().await.unwrap().messages, 0);
    }
}
