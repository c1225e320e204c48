use std::sync::{ Arc, Mutex, PoisonError };

use anyhow::{ anyhow, Context, Result };
use tokio::sync::mpsc;
use tracing::{ error, info };

use crate::protocol;
use crate::protocol::imap::backend::{ Backend, BackendSettings };
use crate::protocol::imap::updates::Update;
use crate::store::memory::MemoryStore;
use crate::utils::config::Config;

const DEFAULT_QUOTA_KB: i64 = 1024 * 1024;

pub struct Runtime {
    pub config: Arc<Config>,
    pub store: Arc<MemoryStore>,
    pub backend: Arc<Backend>,
    updates: Mutex<Option<mpsc::Receiver<Update>>>,
}

impl Runtime {
    /// Runtime over a fresh local store seeded with the `[account.*]`
    /// sections of the configuration.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let store = MemoryStore::new();
        seed_accounts(&config, &store)?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: Arc<Config>, store: Arc<MemoryStore>) -> Self {
        let settings = BackendSettings::from_config(&config);
        let (backend, updates) = Backend::new(store.clone(), settings);
        store.set_notifier(backend.notifier());
        Self { config, store, backend, updates: Mutex::new(Some(updates)) }
    }

    /// Starts the task that fans updates out to connections. Only the first
    /// call has any effect.
    pub fn spawn_dispatcher(&self) -> Option<tokio::task::JoinHandle<()>> {
        let updates = self.updates.lock().unwrap_or_else(PoisonError::into_inner).take()?;
        Some(tokio::spawn(self.backend.clone().dispatch_updates(updates)))
    }

    pub async fn run(self: Arc<Self>, tasks: &mut Vec<tokio::task::JoinHandle<()>>) -> Result<()> {
        if let Some(dispatcher) = self.spawn_dispatcher() {
            tasks.push(dispatcher);
        }

        if self.config.is_section_exists("imap") {
            let rt = Arc::clone(&self);
            tasks.push(
                tokio::spawn(async move {
                    if let Err(e) = protocol::imap::run_imap(rt).await {
                        error!(error = %e, "IMAP server stopped");
                    }
                })
            );
        } else {
            info!("No [imap] section, IMAP server disabled");
        }

        Ok(())
    }
}

fn seed_accounts(config: &Config, store: &MemoryStore) -> Result<()> {
    for name in config.sections_with_prefix("account.") {
        let section = format!("account.{}", name);
        let address = config
            .get_value(&section, "address")
            .ok_or_else(|| anyhow!("[{}] has no address", section))?;
        let password = config
            .get_value(&section, "password")
            .ok_or_else(|| anyhow!("[{}] has no password", section))?;
        let quota_kb = config
            .get_value(&section, "quota_kb")
            .map(|v| v.parse::<i64>())
            .transpose()
            .with_context(|| format!("[{}] quota_kb", section))?
            .unwrap_or(DEFAULT_QUOTA_KB);
        let display_name = config.get_value(&section, "name").unwrap_or(name.as_str());

        let user_id = store.add_user(password, quota_kb);
        store.add_address(&user_id, address, display_name)?;
        info!(account = %name, address, "Account seeded");
    }
    Ok(())
}
