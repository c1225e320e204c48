use std::collections::{ HashMap, HashSet };
use std::fmt;
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError };
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{ mpsc, oneshot };
use tokio::time::timeout;
use tracing::{ debug, info, warn };

use crate::message::header::imap_flags;
use crate::store::{ ChangeNotifier, Counts, Message };
use crate::utils::panic;

const SEND_TIMEOUT: Duration = Duration::from_secs(1);
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Kind of change a handler can ask to have pushed synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    UpdateMessage,
    DeleteMessage,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Operation::UpdateMessage => "store",
            Operation::DeleteMessage => "expunge",
        }
    }
}

fn blocking_key(address: &str, mailbox: &str, op: Operation) -> String {
    format!("{}_{}_{}", address, mailbox, op.as_str()).to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateKind {
    Notice(String),
    Message {
        uid: u32,
        seq: u32,
        flags: Vec<String>,
    },
    Expunge {
        seq: u32,
    },
    MailboxCreated {
        name: String,
    },
    MailboxStatus {
        total: u32,
        unread: u32,
        unread_seq: u32,
    },
}

struct AckInner(Option<oneshot::Sender<()>>);

impl Drop for AckInner {
    fn drop(&mut self) {
        if let Some(done) = self.0.take() {
            let _ = done.send(());
        }
    }
}

/// Fires once the last copy of an update has been written or queued.
#[derive(Clone)]
pub struct Ack(Arc<AckInner>);

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Ack")
    }
}

/// One change pushed to the connections of `address`. An empty `mailbox`
/// concerns every connection of the user; otherwise only connections with
/// that mailbox selected.
#[derive(Debug, Clone)]
pub struct Update {
    pub address: String,
    pub mailbox: String,
    pub kind: UpdateKind,
    ack: Ack,
}

impl Update {
    pub fn new(address: &str, mailbox: &str, kind: UpdateKind) -> (Self, oneshot::Receiver<()>) {
        let (done, receiver) = oneshot::channel();
        let update = Self {
            address: address.to_string(),
            mailbox: mailbox.to_string(),
            kind,
            ack: Ack(Arc::new(AckInner(Some(done)))),
        };
        (update, receiver)
    }

    pub fn is_expunge(&self) -> bool {
        matches!(self.kind, UpdateKind::Expunge { .. })
    }

    /// Untagged response line(s) for the update.
    pub fn render(&self) -> String {
        match &self.kind {
            UpdateKind::Notice(text) => format!("* OK [ALERT] {}\r\n", text),
            UpdateKind::Message { uid, seq, flags } => {
                format!("* {} FETCH (FLAGS ({}) UID {})\r\n", seq, flags.join(" "), uid)
            }
            UpdateKind::Expunge { seq } => format!("* {} EXPUNGE\r\n", seq),
            UpdateKind::MailboxCreated { name } => {
                format!("* LIST (\\Noinferiors) \"/\" {}\r\n", super::response::quote(name))
            }
            UpdateKind::MailboxStatus { total, .. } => format!("* {} EXISTS\r\n", total),
        }
    }
}

#[derive(Default)]
struct Barrier {
    holders: usize,
    waiters: Vec<oneshot::Sender<()>>,
}

#[derive(Default)]
struct CoordinatorState {
    blocking: HashSet<String>,
    delayed_expunges: HashMap<String, Barrier>,
}

/// Serializes pushes against running commands.
///
/// Handlers flag (address, mailbox, operation) keys around multi-step
/// changes so that the pushes those changes cause are delivered before the
/// handler answers, and non-UID FETCHes hold an expunge barrier on their
/// mailbox so that sequence numbers stay valid while they list messages.
pub struct UpdateCoordinator {
    state: Mutex<CoordinatorState>,
    sender: Option<mpsc::Sender<Update>>,
}

impl UpdateCoordinator {
    pub fn new(sender: Option<mpsc::Sender<Update>>) -> Self {
        Self { state: Mutex::new(CoordinatorState::default()), sender }
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes pushes for the key synchronous until the guard is dropped.
    pub fn block(&self, address: &str, mailbox: &str, op: Operation) -> BlockGuard<'_> {
        let key = blocking_key(address, mailbox, op);
        self.state().blocking.insert(key.clone());
        BlockGuard { coordinator: self, key }
    }

    fn unblock(&self, key: &str) {
        self.state().blocking.remove(key);
    }

    pub fn is_blocking(&self, address: &str, mailbox: &str, op: Operation) -> bool {
        self.state().blocking.contains(&blocking_key(address, mailbox, op))
    }

    /// Holds expunges of `mailbox_id` back until the guard is dropped.
    /// Barriers nest: expunges resume when the last holder lets go.
    pub fn forbid_expunge(&self, mailbox_id: &str) -> ExpungeGuard<'_> {
        self.state().delayed_expunges.entry(mailbox_id.to_string()).or_default().holders += 1;
        ExpungeGuard { coordinator: self, mailbox_id: mailbox_id.to_string() }
    }

    fn allow_expunge(&self, mailbox_id: &str) {
        let mut state = self.state();
        let Some(barrier) = state.delayed_expunges.get_mut(mailbox_id) else {
            return;
        };
        barrier.holders = barrier.holders.saturating_sub(1);
        if barrier.holders > 0 {
            return;
        }
        if let Some(barrier) = state.delayed_expunges.remove(mailbox_id) {
            for waiter in barrier.waiters {
                let _ = waiter.send(());
            }
        }
    }

    /// Whether an expunge may run right away. When it may not, the returned
    /// handle resolves once the mailbox's barrier is lifted.
    pub fn can_delete(&self, mailbox_id: &str) -> (bool, Option<ExpungeWait>) {
        let mut state = self.state();
        let Some(barrier) = state.delayed_expunges.get_mut(mailbox_id) else {
            return (true, None);
        };

        let (release, released) = oneshot::channel();
        barrier.waiters.push(release);
        (false, Some(ExpungeWait { mailbox_id: mailbox_id.to_string(), released }))
    }

    async fn send_update(&self, update: Update, done: oneshot::Receiver<()>, blocking: bool) {
        let Some(sender) = self.sender.clone() else {
            info!(address = %update.address, mailbox = %update.mailbox, "IMAP IDLE unavailable");
            return;
        };

        let address = update.address.clone();
        let mailbox = update.mailbox.clone();
        panic::spawn("imap update send", async move {
            match timeout(SEND_TIMEOUT, sender.send(update)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => debug!("IMAP update channel closed"),
                Err(_) => warn!(address = %address, mailbox = %mailbox, "IMAP update could not be sent (timeout)"),
            }
        });

        if !blocking {
            return;
        }
        if timeout(DELIVERY_TIMEOUT, done).await.is_err() {
            warn!(blocking, "IMAP update could not be delivered (timeout)");
        }
    }
}

pub struct BlockGuard<'a> {
    coordinator: &'a UpdateCoordinator,
    key: String,
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.unblock(&self.key);
    }
}

pub struct ExpungeGuard<'a> {
    coordinator: &'a UpdateCoordinator,
    mailbox_id: String,
}

impl Drop for ExpungeGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.allow_expunge(&self.mailbox_id);
    }
}

/// Pending permission to expunge.
pub struct ExpungeWait {
    mailbox_id: String,
    released: oneshot::Receiver<()>,
}

impl ExpungeWait {
    pub async fn wait(self) {
        debug!(mailbox = %self.mailbox_id, "Expunge operations paused");
        let _ = self.released.await;
        debug!(mailbox = %self.mailbox_id, "Expunge operations unpaused");
    }
}

#[async_trait]
impl ChangeNotifier for UpdateCoordinator {
    async fn notice(&self, address: &str, text: &str) {
        info!(address, "Notice");
        let (update, done) = Update::new(address, "", UpdateKind::Notice(text.to_string()));
        self.send_update(update, done, false).await;
    }

    async fn update_message(
        &self,
        address: &str,
        mailbox: &str,
        uid: u32,
        seq: u32,
        message: &Message,
        marked_deleted: bool
    ) {
        let mut flags = imap_flags(message);
        if marked_deleted {
            flags.push("\\Deleted".to_string());
        }
        debug!(address, mailbox, seq, uid, ?flags, "IDLE update");

        let blocking = self.is_blocking(address, mailbox, Operation::UpdateMessage);
        let (update, done) = Update::new(address, mailbox, UpdateKind::Message { uid, seq, flags });
        self.send_update(update, done, blocking).await;
    }

    async fn delete_message(&self, address: &str, mailbox: &str, seq: u32) {
        debug!(address, mailbox, seq, "IDLE delete");
        let blocking = self.is_blocking(address, mailbox, Operation::DeleteMessage);
        let (update, done) = Update::new(address, mailbox, UpdateKind::Expunge { seq });
        self.send_update(update, done, blocking).await;
    }

    async fn mailbox_created(&self, address: &str, mailbox: &str) {
        debug!(address, mailbox, "IDLE mailbox info");
        let kind = UpdateKind::MailboxCreated { name: mailbox.to_string() };
        let (update, done) = Update::new(address, "", kind);
        self.send_update(update, done, false).await;
    }

    async fn mailbox_status(&self, address: &str, mailbox: &str, counts: Counts) {
        debug!(address, mailbox, total = counts.total, unread = counts.unread, "IDLE status");
        let kind = UpdateKind::MailboxStatus {
            total: counts.total,
            unread: counts.unread,
            unread_seq: counts.unread_seq,
        };
        let (update, done) = Update::new(address, mailbox, kind);
        self.send_update(update, done, true).await;
    }
}
