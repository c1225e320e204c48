use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{ Path, PathBuf };

use anyhow::{ Context, Result };
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{ debug, warn };

/// Cache label listing the mailboxes a user unsubscribed from.
pub const SUBSCRIPTION_EXCEPTION: &str = "SubscriptionException";

const SEPARATOR: char = ';';

type Document = BTreeMap<String, BTreeMap<String, String>>;

/// Small per-user state persisted as JSON: user id -> label -> values
/// joined by `;`. Every call reads the file and every change writes it
/// back.
pub struct ImapCache {
    path: PathBuf,
    lock: RwLock<()>,
}

impl ImapCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: RwLock::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Document> {
        match fs::read_to_string(&self.path).await {
            Ok(text) if text.trim().is_empty() => Ok(Document::new()),
            Ok(text) => {
                serde_json
                    ::from_str(&text)
                    .with_context(|| format!("cannot parse IMAP cache {}", self.path.display()))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Document::new()),
            Err(err) => Err(err).with_context(|| format!("cannot read IMAP cache {}", self.path.display())),
        }
    }

    async fn save(&self, document: &Document) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let text = serde_json::to_string(document)?;
        fs::write(&self.path, text).await.with_context(|| format!("cannot write IMAP cache {}", self.path.display()))
    }

    /// Values stored under `label` for the user. A cache that cannot be
    /// read counts as empty.
    pub async fn get_list(&self, user_id: &str, label: &str) -> Vec<String> {
        let _guard = self.lock.read().await;
        let document = match self.load().await {
            Ok(document) => document,
            Err(err) => {
                warn!(error = %err, "Cannot load IMAP cache");
                return Vec::new();
            }
        };

        document
            .get(user_id)
            .and_then(|labels| labels.get(label))
            .map(|joined| {
                joined
                    .split(SEPARATOR)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn add_to_list(&self, user_id: &str, label: &str, value: &str) -> Result<()> {
        self.update_list(user_id, label, |values| {
            if !values.iter().any(|v| v == value) {
                values.push(value.to_string());
            }
        }).await
    }

    pub async fn remove_from_list(&self, user_id: &str, label: &str, value: &str) -> Result<()> {
        self.update_list(user_id, label, |values| values.retain(|v| v != value)).await
    }

    async fn update_list<F>(&self, user_id: &str, label: &str, change: F) -> Result<()>
        where F: FnOnce(&mut Vec<String>)
    {
        let _guard = self.lock.write().await;
        let mut document = self.load().await?;

        let labels = document.entry(user_id.to_string()).or_default();
        let mut values: Vec<String> = labels
            .get(label)
            .map(|joined| {
                joined
                    .split(SEPARATOR)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        change(&mut values);
        labels.insert(label.to_string(), values.join(&SEPARATOR.to_string()));

        debug!(user_id, label, count = values.len(), "IMAP cache updated");
        self.save(&document).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache() -> (TempDir, ImapCache) {
        let dir = TempDir::new().unwrap();
        let cache = ImapCache::new(dir.path().join("imap_cache.json"));
        (dir, cache)
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let (_dir, cache) = cache();
        assert!(cache.get_list("user-1", SUBSCRIPTION_EXCEPTION).await.is_empty());
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let (_dir, cache) = cache();
        cache.add_to_list("user-1", SUBSCRIPTION_EXCEPTION, "label-a").await.unwrap();
        cache.add_to_list("user-1", SUBSCRIPTION_EXCEPTION, "label-b").await.unwrap();
        cache.add_to_list("user-1", SUBSCRIPTION_EXCEPTION, "label-a").await.unwrap();
        cache.add_to_list("user-2", SUBSCRIPTION_EXCEPTION, "label-c").await.unwrap();

        assert_eq!(cache.get_list("user-1", SUBSCRIPTION_EXCEPTION).await, vec!["label-a", "label-b"]);
        assert_eq!(cache.get_list("user-2", SUBSCRIPTION_EXCEPTION).await, vec!["label-c"]);

        cache.remove_from_list("user-1", SUBSCRIPTION_EXCEPTION, "label-a").await.unwrap();
        assert_eq!(cache.get_list("user-1", SUBSCRIPTION_EXCEPTION).await, vec!["label-b"]);
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_serialized() {
        let (_dir, cache) = cache();
        let labels: Vec<String> = (0..20).map(|n| format!("label-{n}")).collect();
        futures::future::join_all(
            labels.iter().map(|label| cache.add_to_list("user-1", SUBSCRIPTION_EXCEPTION, label))
        ).await
            .into_iter()
            .collect::<Result<Vec<_>>>()
            .unwrap();

        let mut stored = cache.get_list("user-1", SUBSCRIPTION_EXCEPTION).await;
        stored.sort();
        let mut expected = labels.clone();
        expected.sort();
        assert_eq!(stored, expected);
    }

    #[tokio::test]
    async fn test_file_format() {
        let (_dir, cache) = cache();
        cache.add_to_list("user-1", SUBSCRIPTION_EXCEPTION, "a").await.unwrap();
        cache.add_to_list("user-1", SUBSCRIPTION_EXCEPTION, "b").await.unwrap();

        let text = fs::read_to_string(cache.path()).await.unwrap();
        let document: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(document["user-1"][SUBSCRIPTION_EXCEPTION], "a;b");

        let reopened = ImapCache::new(cache.path());
        assert_eq!(reopened.get_list("user-1", SUBSCRIPTION_EXCEPTION).await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_corrupt_file_reads_as_empty_and_refuses_writes() {
        let (_dir, cache) = cache();
        fs::write(cache.path(), "{not json").await.unwrap();
        assert!(cache.get_list("user-1", SUBSCRIPTION_EXCEPTION).await.is_empty());
        assert!(cache.add_to_list("user-1", SUBSCRIPTION_EXCEPTION, "a").await.is_err());
    }
}
