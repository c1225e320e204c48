use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{ AtomicU64, Ordering };
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError, RwLock };
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{ debug, info, warn };

use super::cache::{ MessageCache, DEFAULT_SIZE_LIMIT, DEFAULT_TTL };
use super::client_cache::ImapCache;
use super::updates::{ Update, UpdateCoordinator };
use super::user::User;
use crate::message::builder::Builder;
use crate::store::{ AuthError, ChangeNotifier, Store };
use crate::utils::config::Config;

const DEFAULT_FETCH_WORKERS: usize = 20;
const DEFAULT_LOGIN_FAILURE_DELAY: Duration = Duration::from_secs(10);

/// Tunables of the IMAP backend.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub fetch_workers: usize,
    pub login_failure_delay: Duration,
    pub cache_path: PathBuf,
    pub cache_ttl: Duration,
    pub cache_size_limit: usize,
    pub pipeline_fetch_workers: usize,
    pub pipeline_build_workers: usize,
    pub pipeline_attachment_workers: usize,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            fetch_workers: DEFAULT_FETCH_WORKERS,
            login_failure_delay: DEFAULT_LOGIN_FAILURE_DELAY,
            cache_path: PathBuf::from("imap_cache.json"),
            cache_ttl: DEFAULT_TTL,
            cache_size_limit: DEFAULT_SIZE_LIMIT,
            pipeline_fetch_workers: 16,
            pipeline_build_workers: 16,
            pipeline_attachment_workers: 4,
        }
    }
}

impl BackendSettings {
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        let delay_ms = config.get_int(
            "imap",
            "login_failure_delay_ms",
            defaults.login_failure_delay.as_millis() as i32
        );

        Self {
            fetch_workers: config.get_usize("imap", "fetch_workers", defaults.fetch_workers),
            login_failure_delay: Duration::from_millis(delay_ms.max(0) as u64),
            cache_path: config
                .get_value("imap", "cache_path")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_path),
            cache_ttl: Duration::from_secs(
                config.get_usize("cache", "ttl_secs", defaults.cache_ttl.as_secs() as usize) as u64
            ),
            cache_size_limit: config.get_usize("cache", "size_limit", defaults.cache_size_limit),
            pipeline_fetch_workers: config.get_usize("pipeline", "fetch_workers", defaults.pipeline_fetch_workers),
            pipeline_build_workers: config.get_usize("pipeline", "build_workers", defaults.pipeline_build_workers),
            pipeline_attachment_workers: config.get_usize(
                "pipeline",
                "attachment_workers",
                defaults.pipeline_attachment_workers
            ),
        }
    }
}

/// Process-wide pieces every user and mailbox works with.
pub struct Shared {
    pub updates: Arc<UpdateCoordinator>,
    pub cache: MessageCache,
    pub builder: Builder,
    pub imap_cache: ImapCache,
    pub fetch_workers: usize,
}

struct Connection {
    email: String,
    selected: Arc<RwLock<Option<String>>>,
    sender: mpsc::UnboundedSender<Update>,
}

/// Entry point of the IMAP side: logs users in, keeps one `User` per
/// address and fans pushes out to the connections.
pub struct Backend {
    store: Arc<dyn Store>,
    shared: Arc<Shared>,
    login_failure_delay: Duration,
    users: Mutex<HashMap<String, Arc<User>>>,
    connections: Mutex<HashMap<u64, Connection>>,
    next_connection: AtomicU64,
    last_client: Mutex<Option<(String, String)>>,
}

impl Backend {
    /// Creates the backend together with the receiving end of its update
    /// channel, which `dispatch_updates` has to drain.
    pub fn new(store: Arc<dyn Store>, settings: BackendSettings) -> (Arc<Self>, mpsc::Receiver<Update>) {
        let (sender, receiver) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            updates: Arc::new(UpdateCoordinator::new(Some(sender))),
            cache: MessageCache::new(settings.cache_ttl, settings.cache_size_limit),
            builder: Builder::new(
                settings.pipeline_fetch_workers,
                settings.pipeline_build_workers,
                settings.pipeline_attachment_workers
            ),
            imap_cache: ImapCache::new(settings.cache_path.clone()),
            fetch_workers: settings.fetch_workers,
        });

        let backend = Arc::new(Self {
            store,
            shared,
            login_failure_delay: settings.login_failure_delay,
            users: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            last_client: Mutex::new(None),
        });
        (backend, receiver)
    }

    /// The coordinator, to be installed as the store's change notifier.
    pub fn notifier(&self) -> Arc<dyn ChangeNotifier> {
        self.shared.updates.clone()
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    fn users(&self) -> MutexGuard<'_, HashMap<String, Arc<User>>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<u64, Connection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Arc<User>, AuthError> {
        let address = match self.store.authenticate(username, password).await {
            Ok(address) => address,
            Err(err) => {
                warn!(username, error = %err, "Cannot authenticate user");
                // Slows down clients that retry wrong passwords in a loop.
                sleep(self.login_failure_delay).await;
                return Err(err);
            }
        };

        let key = address.address().to_lowercase();
        let mut users = self.users();
        if let Some(user) = users.get(&key) {
            debug!(address = %key, "Reusing logged in user");
            return Ok(user.clone());
        }

        let user = Arc::new(User::new(self.shared.clone(), address));
        users.insert(key, user.clone());
        info!(address = %user.email(), "User logged in");
        Ok(user)
    }

    pub fn logout(&self, user: &User) {
        if self.users().remove(&user.email().to_lowercase()).is_some() {
            info!(address = %user.email(), "User logged out");
        }
    }

    pub fn is_logged_in(&self, email: &str) -> bool {
        self.users().contains_key(&email.to_lowercase())
    }

    /// Remembers the mail client announced through ID.
    pub fn set_client(&self, name: &str, version: &str) {
        let mut last = self.last_client.lock().unwrap_or_else(PoisonError::into_inner);
        let changed = last
            .as_ref()
            .map(|(n, v)| n != name || v != version)
            .unwrap_or(true);
        if changed {
            info!(client = name, version, "Mail client changed");
            *last = Some((name.to_string(), version.to_string()));
        }
    }

    pub fn last_client(&self) -> Option<(String, String)> {
        self.last_client.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Subscribes a connection to the pushes of `email`.
    pub fn register(self: &Arc<Self>, email: &str) -> Registration {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        let selected = Arc::new(RwLock::new(None));

        self.connections().insert(id, Connection {
            email: email.to_lowercase(),
            selected: selected.clone(),
            sender,
        });
        debug!(connection = id, address = email, "Connection registered for updates");

        Registration { backend: self.clone(), id, receiver, selected }
    }

    fn unregister(&self, id: u64) {
        self.connections().remove(&id);
        debug!(connection = id, "Connection unregistered");
    }

    /// Fans updates out to the connections they concern. An update counts
    /// as delivered once every copy handed out here has been dropped.
    pub async fn dispatch_updates(self: Arc<Self>, mut updates: mpsc::Receiver<Update>) {
        while let Some(update) = updates.recv().await {
            let address = update.address.to_lowercase();
            let connections = self.connections();
            let mut receivers = 0;

            for connection in connections.values() {
                if connection.email != address {
                    continue;
                }
                if !update.mailbox.is_empty() {
                    let selected = connection.selected.read().unwrap_or_else(PoisonError::into_inner);
                    let matches = selected
                        .as_deref()
                        .map(|name| same_mailbox(name, &update.mailbox))
                        .unwrap_or(false);
                    if !matches {
                        continue;
                    }
                }
                if connection.sender.send(update.clone()).is_ok() {
                    receivers += 1;
                }
            }
            drop(connections);

            if receivers == 0 {
                debug!(address = %update.address, mailbox = %update.mailbox, "Update has no receiver");
            }
        }
        debug!("Update channel closed");
    }
}

fn same_mailbox(a: &str, b: &str) -> bool {
    a == b || (a.eq_ignore_ascii_case("INBOX") && b.eq_ignore_ascii_case("INBOX"))
}

/// A connection's subscription to pushes; dropping it unsubscribes.
pub struct Registration {
    backend: Arc<Backend>,
    id: u64,
    receiver: mpsc::UnboundedReceiver<Update>,
    selected: Arc<RwLock<Option<String>>>,
}

impl Registration {
    pub fn set_selected(&self, mailbox: Option<String>) {
        *self.selected.write().unwrap_or_else(PoisonError::into_inner) = mailbox;
    }

    pub async fn recv(&mut self) -> Option<Update> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Update> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.backend.unregister(self.id);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{ Address, Message, FLAG_RECEIVED, INBOX_LABEL };
    use tempfile::TempDir;

    pub struct Fixture {
        pub store: Arc<MemoryStore>,
        pub backend: Arc<Backend>,
        pub address_id: String,
        pub _dir: TempDir,
    }

    pub const EMAIL: &str = "alice@example.com";
    pub const PASSWORD: &str = "secret";

    /// Backend over a memory store holding one user with one address.
    /// Updates are dispatched in the background.
    pub async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let user = store.add_user(PASSWORD, 1024 * 1024);
        let address_id = store.add_address(&user, EMAIL, "Alice").unwrap();

        let settings = BackendSettings {
            login_failure_delay: Duration::ZERO,
            cache_path: dir.path().join("imap_cache.json"),
            ..BackendSettings::default()
        };
        let (backend, updates) = Backend::new(store.clone(), settings);
        store.set_notifier(backend.notifier());
        tokio::spawn(backend.clone().dispatch_updates(updates));

        Fixture { store, backend, address_id, _dir: dir }
    }

    pub fn incoming(subject: &str) -> Message {
        Message {
            subject: subject.to_string(),
            sender: Address::new("Bob", "bob@example.com"),
            to_list: vec![Address::new("Alice", EMAIL)],
            label_ids: vec![INBOX_LABEL.to_string()],
            unread: true,
            flags: FLAG_RECEIVED,
            time: 1_600_000_000,
            mime_type: "text/plain".to_string(),
            ..Message::default()
        }
    }

    impl Fixture {
        pub async fn deliver(&self, subject: &str, body: &str) -> String {
            self.store.deliver(&self.address_id, incoming(subject), body.as_bytes(), Vec::new()).await.unwrap()
        }

        pub async fn login(&self) -> Arc<User> {
            self.backend.login(EMAIL, PASSWORD).await.unwrap()
        }
    }
}
