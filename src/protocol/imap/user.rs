use std::sync::Arc;

use anyhow::{ bail, Result };
use tokio::sync::Mutex;
use tracing::{ debug, info, warn };

use super::backend::Shared;
use super::client_cache::SUBSCRIPTION_EXCEPTION;
use super::mailbox::{ mailbox_attributes, Mailbox, MailboxError };
use crate::store::{ Client, StoreAddress, StoreMailbox, StoreUser, SYSTEM_LABELS };

const FOLDERS_ROOT: &str = "Folders";
const LABELS_ROOT: &str = "Labels";

/// One entry of a LIST or LSUB response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxInfo {
    pub name: String,
    pub attributes: Vec<String>,
}

/// A logged in address.
pub struct User {
    pub(super) shared: Arc<Shared>,
    address: Arc<dyn StoreAddress>,
    store_user: Arc<dyn StoreUser>,
    email: String,
    /// Held by APPEND and by expunges in Trash and Spam, so a message being
    /// re-imported is never destroyed halfway.
    pub(super) append_expunge_lock: Mutex<()>,
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User").field("email", &self.email).finish_non_exhaustive()
    }
}

impl User {
    pub fn new(shared: Arc<Shared>, address: Arc<dyn StoreAddress>) -> Self {
        let store_user = address.user();
        let email = address.address();
        Self { shared, address, store_user, email, append_expunge_lock: Mutex::new(()) }
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn user_id(&self) -> String {
        self.store_user.id()
    }

    pub fn address(&self) -> &Arc<dyn StoreAddress> {
        &self.address
    }

    pub fn client(&self) -> Arc<dyn Client> {
        self.store_user.client()
    }

    pub async fn list_mailboxes(&self, subscribed_only: bool) -> Result<Vec<MailboxInfo>> {
        let mailboxes = self.address.list_mailboxes().await?;
        let exceptions = if subscribed_only {
            self.shared.imap_cache.get_list(&self.user_id(), SUBSCRIPTION_EXCEPTION).await
        } else {
            Vec::new()
        };

        let mut infos: Vec<MailboxInfo> = mailboxes
            .iter()
            .filter(|m| !exceptions.contains(&m.label_id()))
            .map(|m| MailboxInfo { name: m.name(), attributes: mailbox_attributes(m.as_ref()) })
            .collect();

        for root in [FOLDERS_ROOT, LABELS_ROOT] {
            infos.push(MailboxInfo { name: root.to_string(), attributes: vec!["\\Noselect".to_string()] });
        }

        debug!(address = %self.email, count = infos.len(), subscribed_only, "Listed mailboxes");
        Ok(infos)
    }

    pub async fn get_mailbox(self: &Arc<Self>, name: &str) -> Result<Arc<Mailbox>> {
        let store = match self.address.get_mailbox(name).await {
            Ok(store) => store,
            Err(err) => {
                debug!(mailbox = name, error = %err, "Mailbox lookup failed");
                return Err(MailboxError::NoSuchMailbox(name.to_string()).into());
            }
        };
        Ok(Arc::new(Mailbox::new(self.clone(), store)))
    }

    /// Store view of a system mailbox, by label id.
    pub async fn system_mailbox(&self, label_id: &str) -> Result<Arc<dyn StoreMailbox>> {
        let Some((_, name)) = SYSTEM_LABELS.iter().find(|(id, _)| *id == label_id) else {
            bail!("label {} is not a system label", label_id);
        };
        self.address.get_mailbox(name).await
    }

    pub async fn create_mailbox(&self, name: &str) -> Result<()> {
        if is_root(name) {
            bail!("mailbox {} already exists", name);
        }
        self.address.create_mailbox(name).await?;
        info!(address = %self.email, mailbox = name, "Mailbox created");
        Ok(())
    }

    pub async fn delete_mailbox(self: &Arc<Self>, name: &str) -> Result<()> {
        if is_root(name) {
            bail!("cannot delete {}", name);
        }
        let mailbox = self.get_mailbox(name).await?;
        mailbox.store.delete().await?;
        info!(address = %self.email, mailbox = name, "Mailbox deleted");
        Ok(())
    }

    pub async fn rename_mailbox(self: &Arc<Self>, from: &str, to: &str) -> Result<()> {
        if is_root(from) || is_root(to) {
            bail!("cannot rename {}", from);
        }
        let mailbox = self.get_mailbox(from).await?;
        mailbox.store.rename(to).await?;
        info!(address = %self.email, from, to, "Mailbox renamed");
        Ok(())
    }

    /// Every mailbox is subscribed unless it is listed as an exception.
    pub async fn is_subscribed(&self, label_id: &str) -> bool {
        !self.shared.imap_cache
            .get_list(&self.user_id(), SUBSCRIPTION_EXCEPTION).await
            .iter()
            .any(|l| l == label_id)
    }

    pub async fn set_subscribed(&self, label_id: &str, subscribed: bool) -> Result<()> {
        let user_id = self.user_id();
        if subscribed {
            self.shared.imap_cache.remove_from_list(&user_id, SUBSCRIPTION_EXCEPTION, label_id).await
        } else {
            self.shared.imap_cache.add_to_list(&user_id, SUBSCRIPTION_EXCEPTION, label_id).await
        }
    }

    /// Used and maximum storage in KB.
    pub async fn quota(&self) -> Result<(i64, i64)> {
        let (used, max) = self.store_user.space().await?;
        Ok((used / 1000, max / 1000))
    }

    /// Largest message APPEND accepts, 0 when unknown.
    pub async fn append_limit(&self) -> u32 {
        match self.store_user.max_upload().await {
            Ok(limit) => u32::try_from(limit.max(0)).unwrap_or(u32::MAX),
            Err(err) => {
                warn!(error = %err, "Cannot get APPENDLIMIT");
                0
            }
        }
    }
}

fn is_root(name: &str) -> bool {
    name.eq_ignore_ascii_case(FOLDERS_ROOT) || name.eq_ignore_ascii_case(LABELS_ROOT)
}

#[cfg(test)]
mod tests {
    use super::super::backend::test_support::*;
    use crate::store::INBOX_LABEL;

    #[tokio::test]
    async fn test_list_mailboxes() {
        let fixture = fixture().await;
        let user = fixture.login().await;

        let all = user.list_mailboxes(false).await.unwrap();
        let names: Vec<&str> = all
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert!(names.contains(&"INBOX"));
        assert!(names.contains(&"All Mail"));
        assert!(names.contains(&"Folders"));

        let sent = all
            .iter()
            .find(|m| m.name == "Sent")
            .unwrap();
        assert_eq!(sent.attributes, vec!["\\Noinferiors".to_string(), "\\Sent".to_string()]);
        let folders = all
            .iter()
            .find(|m| m.name == "Folders")
            .unwrap();
        assert_eq!(folders.attributes, vec!["\\Noselect".to_string()]);
    }

    #[tokio::test]
    async fn test_debug_shows_only_the_address() {
        let fixture = fixture().await;
        let user = fixture.login().await;
        let rendered = format!("{:?}", user);
        assert!(rendered.contains(EMAIL), "{}", rendered);
        assert!(!rendered.contains(PASSWORD));
    }

    #[tokio::test]
    async fn test_subscriptions() {
        let fixture = fixture().await;
        let user = fixture.login().await;
        assert!(user.is_subscribed(INBOX_LABEL).await);

        user.set_subscribed(INBOX_LABEL, false).await.unwrap();
        assert!(!user.is_subscribed(INBOX_LABEL).await);
        let subscribed = user.list_mailboxes(true).await.unwrap();
        assert!(!subscribed.iter().any(|m| m.name == "INBOX"));

        user.set_subscribed(INBOX_LABEL, true).await.unwrap();
        assert!(user.is_subscribed(INBOX_LABEL).await);
    }

    #[tokio::test]
    async fn test_create_rename_delete() {
        let fixture = fixture().await;
        let user = fixture.login().await;

        assert!(user.create_mailbox("Work").await.is_err());
        assert!(user.create_mailbox("Folders").await.is_err());
        user.create_mailbox("Folders/Work").await.unwrap();
        user.rename_mailbox("Folders/Work", "Folders/Job").await.unwrap();
        assert!(user.get_mailbox("Folders/Work").await.is_err());

        let job = user.get_mailbox("Folders/Job").await.unwrap();
        assert_eq!(job.name(), "Folders/Job");
        user.delete_mailbox("Folders/Job").await.unwrap();
        assert!(user.get_mailbox("Folders/Job").await.is_err());
        assert!(user.delete_mailbox("INBOX").await.is_err());
    }

    #[tokio::test]
    async fn test_quota_and_append_limit() {
        let fixture = fixture().await;
        let user = fixture.login().await;
        let (used, max) = user.quota().await.unwrap();
        assert_eq!(used, 0);
        assert_eq!(max, 1024 * 1024 * 1024 / 1000);
        assert_eq!(user.append_limit().await, 25 * 1024 * 1024);
    }
}
