use std::collections::{ BTreeMap, BTreeSet, HashMap, HashSet };
use std::sync::{ Arc, Mutex, MutexGuard, PoisonError, Weak };
use std::sync::atomic::{ AtomicUsize, Ordering };

use anyhow::{ anyhow, bail, Result };
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{ debug, info };

use super::{
    Attachment,
    AuthError,
    ChangeNotifier,
    Client,
    Counts,
    ImportRequest,
    KeyRing,
    Message,
    Signature,
    Store,
    StoreAddress,
    StoreMailbox,
    StoreMessage,
    StoreUser,
    ALL_DRAFTS_LABEL,
    ALL_MAIL_LABEL,
    DRAFT_LABEL,
    SPAM_LABEL,
    SYSTEM_LABELS,
    TRASH_LABEL,
};
use crate::message::encrypt::{ armor, dearmor, CryptoError };
use crate::message::section::BodyStructure;
use crate::utils::{ generate_uidvalidity, uuid7 };

const FOLDERS_PREFIX: &str = "Folders/";
const LABELS_PREFIX: &str = "Labels/";

/** ---------------------------------------------------------------
 * ------------------------- Test keyring --------------------------
 * --------------------------------------------------------------- */

/// Reversible stand-in for a PGP keyring: payloads are XOR-scrambled with
/// a per-address key and wrapped in ASCII armor that names the key.
#[derive(Debug, Clone)]
pub struct MemoryKeyRing {
    key_id: u8,
}

impl MemoryKeyRing {
    pub fn new(key_id: u8) -> Self {
        Self { key_id }
    }

    fn scramble(&self, data: &[u8]) -> Vec<u8> {
        let key = self.key_id.wrapping_mul(31).wrapping_add(7);
        data.iter().map(|b| b ^ key).collect()
    }

    fn check_key(&self, key_id: Option<&str>) -> Result<(), CryptoError> {
        match key_id.and_then(|id| id.parse::<u8>().ok()) {
            Some(id) if id == self.key_id => Ok(()),
            Some(_) => Err(CryptoError::IncorrectKey),
            None => Err(CryptoError::Malformed("missing key id".to_string())),
        }
    }

    /// Encrypts `plain` and carries a detached signature along with it.
    pub fn encrypt_signed(&self, plain: &[u8], signature: &Signature) -> String {
        let sig = format!("{}:{}", signature.hash, STANDARD.encode(&signature.data));
        let key_id = self.key_id.to_string();
        armor("MESSAGE", &[("Key-Id", &key_id), ("Signature", &sig)], &self.scramble(plain))
    }

    /// Key packets and data packet of an encrypted attachment.
    pub fn encrypt_attachment(&self, data: &[u8]) -> (String, Vec<u8>) {
        let packets = STANDARD.encode(format!("key:{}", self.key_id));
        (packets, self.scramble(data))
    }
}

impl KeyRing for MemoryKeyRing {
    fn decrypt_message(&self, armored: &str) -> Result<Vec<u8>, CryptoError> {
        let (headers, data) = dearmor(armored)?;
        let key_id = headers.iter().find(|(name, _)| name == "Key-Id").map(|(_, v)| v.as_str());
        self.check_key(key_id)?;
        Ok(self.scramble(&data))
    }

    fn decrypt_attachment(&self, key_packets: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let packets = String::from_utf8_lossy(key_packets);
        let key_id = packets.strip_prefix("key:");
        self.check_key(key_id)?;
        Ok(self.scramble(data))
    }

    fn extract_signatures(&self, message: &Message) -> Result<Vec<Signature>, CryptoError> {
        let (headers, _) = dearmor(&message.body)?;
        let mut signatures = Vec::new();
        for (_, value) in headers.iter().filter(|(name, _)| name == "Signature") {
            let (hash, data) = value
                .split_once(':')
                .ok_or_else(|| CryptoError::Malformed("bad signature header".to_string()))?;
            let data = STANDARD.decode(data).map_err(|e| CryptoError::Malformed(e.to_string()))?;
            signatures.push(Signature { hash: hash.to_string(), data });
        }
        Ok(signatures)
    }

    fn encrypt(&self, plain: &[u8]) -> Result<String, CryptoError> {
        Ok(armor("MESSAGE", &[("Key-Id", &self.key_id.to_string())], &self.scramble(plain)))
    }
}

/** ---------------------------------------------------------------
 * -------------------------- Store state --------------------------
 * --------------------------------------------------------------- */

struct UserRecord {
    password: String,
    max_upload: i64,
    max_space: i64,
}

struct AddressRecord {
    user_id: String,
    email: String,
    display_name: String,
    key_id: u8,
}

#[derive(Clone)]
struct LabelRecord {
    id: String,
    name: String,
    folder: bool,
    system: bool,
}

struct MailboxIndex {
    uid_validity: u32,
    next_uid: u32,
    uids: BTreeMap<u32, String>,
    by_id: HashMap<String, u32>,
    deleted: HashSet<String>,
}

impl MailboxIndex {
    fn new() -> Self {
        Self {
            uid_validity: generate_uidvalidity(),
            next_uid: 1,
            uids: BTreeMap::new(),
            by_id: HashMap::new(),
            deleted: HashSet::new(),
        }
    }

    fn seq_of(&self, uid: u32) -> u32 {
        self.uids.range(..=uid).count() as u32
    }

    fn uid_at(&self, seq: u32) -> Option<u32> {
        if seq == 0 {
            return None;
        }
        self.uids
            .keys()
            .nth((seq - 1) as usize)
            .copied()
    }
}

struct StoredMessage {
    meta: Message,
    structure: Option<Vec<u8>>,
    header: Option<Vec<u8>>,
}

enum Event {
    Update {
        address: String,
        mailbox: String,
        uid: u32,
        seq: u32,
        message: Message,
        deleted: bool,
    },
    Delete {
        address: String,
        mailbox: String,
        seq: u32,
    },
    Status {
        address: String,
        mailbox: String,
        counts: Counts,
    },
    Created {
        address: String,
        mailbox: String,
    },
}

type MailboxKey = (String, String);

#[derive(Default)]
struct State {
    users: HashMap<String, UserRecord>,
    addresses: HashMap<String, AddressRecord>,
    labels: HashMap<String, Vec<LabelRecord>>,
    mailboxes: HashMap<MailboxKey, MailboxIndex>,
    messages: HashMap<String, StoredMessage>,
    attachments: HashMap<String, Vec<u8>>,
    next_id: u64,
}

impl State {
    fn new_id(&mut self, kind: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", kind, self.next_id)
    }

    fn email(&self, address_id: &str) -> String {
        self.addresses
            .get(address_id)
            .map(|a| a.email.clone())
            .unwrap_or_default()
    }

    fn label(&self, address_id: &str, label_id: &str) -> Option<&LabelRecord> {
        self.labels.get(address_id).and_then(|labels| labels.iter().find(|l| l.id == label_id))
    }

    fn mailbox_name(&self, address_id: &str, label_id: &str) -> String {
        self.label(address_id, label_id)
            .map(|l| l.name.clone())
            .unwrap_or_default()
    }

    fn counts(&self, key: &MailboxKey) -> Counts {
        let Some(index) = self.mailboxes.get(key) else {
            return Counts::default();
        };

        let mut counts = Counts { total: index.uids.len() as u32, ..Counts::default() };
        for (position, id) in index.uids.values().enumerate() {
            let unread = self.messages.get(id).map(|m| m.meta.unread).unwrap_or(false);
            if unread {
                counts.unread += 1;
                if counts.unread_seq == 0 {
                    counts.unread_seq = (position as u32) + 1;
                }
            }
        }
        counts
    }

    fn status_event(&self, key: &MailboxKey) -> Event {
        Event::Status {
            address: self.email(&key.0),
            mailbox: self.mailbox_name(&key.0, &key.1),
            counts: self.counts(key),
        }
    }

    /// Adds `label_id` to the message and gives it a UID in that mailbox.
    fn attach(&mut self, id: &str, label_id: &str, events: &mut Vec<Event>) {
        let Some(stored) = self.messages.get_mut(id) else {
            return;
        };
        if !stored.meta.has_label(label_id) {
            stored.meta.label_ids.push(label_id.to_string());
        }
        let address_id = stored.meta.address_id.clone();
        let message = stored.meta.clone();

        let key = (address_id.clone(), label_id.to_string());
        let Some(index) = self.mailboxes.get_mut(&key) else {
            return;
        };
        if index.by_id.contains_key(id) {
            return;
        }

        let uid = index.next_uid;
        index.next_uid += 1;
        index.uids.insert(uid, id.to_string());
        index.by_id.insert(id.to_string(), uid);
        let seq = index.seq_of(uid);

        events.push(self.status_event(&key));
        events.push(Event::Update {
            address: self.email(&address_id),
            mailbox: self.mailbox_name(&address_id, label_id),
            uid,
            seq,
            message,
            deleted: false,
        });
    }

    /// Removes `label_id` from the message and drops it from that mailbox.
    fn detach(&mut self, id: &str, label_id: &str, events: &mut Vec<Event>, touched: &mut BTreeSet<MailboxKey>) {
        let Some(stored) = self.messages.get_mut(id) else {
            return;
        };
        stored.meta.label_ids.retain(|l| l != label_id);
        let address_id = stored.meta.address_id.clone();

        let key = (address_id.clone(), label_id.to_string());
        let Some(index) = self.mailboxes.get_mut(&key) else {
            return;
        };
        let Some(uid) = index.by_id.remove(id) else {
            return;
        };
        let seq = index.seq_of(uid);
        index.uids.remove(&uid);
        index.deleted.remove(id);

        events.push(Event::Delete {
            address: self.email(&address_id),
            mailbox: self.mailbox_name(&address_id, label_id),
            seq,
        });
        touched.insert(key);
    }

    /// Removes a message from every mailbox and forgets it.
    fn destroy(&mut self, id: &str, events: &mut Vec<Event>, touched: &mut BTreeSet<MailboxKey>) {
        let labels = self.messages
            .get(id)
            .map(|m| m.meta.label_ids.clone())
            .unwrap_or_default();
        for label in labels {
            self.detach(id, &label, events, touched);
        }
        if let Some(stored) = self.messages.remove(id) {
            for attachment in stored.meta.attachments {
                self.attachments.remove(&attachment.id);
            }
        }
    }

    /// Flag updates for every mailbox that shows the message.
    fn announce(&self, id: &str, events: &mut Vec<Event>, touched: &mut BTreeSet<MailboxKey>) {
        let Some(stored) = self.messages.get(id) else {
            return;
        };
        let address_id = &stored.meta.address_id;
        for label in &stored.meta.label_ids {
            let key = (address_id.clone(), label.clone());
            let Some(index) = self.mailboxes.get(&key) else {
                continue;
            };
            let Some(&uid) = index.by_id.get(id) else {
                continue;
            };
            events.push(Event::Update {
                address: self.email(address_id),
                mailbox: self.mailbox_name(address_id, label),
                uid,
                seq: index.seq_of(uid),
                message: stored.meta.clone(),
                deleted: index.deleted.contains(id),
            });
            touched.insert(key);
        }
    }

    fn insert_message(&mut self, mut message: Message, events: &mut Vec<Event>) -> String {
        let id = self.new_id("msg");
        message.id = id.clone();
        if !message.has_label(ALL_MAIL_LABEL) {
            message.label_ids.push(ALL_MAIL_LABEL.to_string());
        }
        for attachment in message.attachments.iter_mut() {
            attachment.message_id = id.clone();
        }
        let labels = message.label_ids.clone();

        self.messages.insert(id.clone(), StoredMessage { meta: message, structure: None, header: None });
        for label in labels {
            self.attach(&id, &label, events);
        }
        id
    }
}

/** ---------------------------------------------------------------
 * ------------------------- Memory store --------------------------
 * --------------------------------------------------------------- */

/// Remote-call counters, for asserting that builds are deduplicated.
#[derive(Debug, Default)]
pub struct CallCounters {
    pub get_message: AtomicUsize,
    pub get_attachment: AtomicUsize,
    pub key_ring: AtomicUsize,
}

/// In-process mail store. It plays both the remote API and the local
/// metadata database.
pub struct MemoryStore {
    me: Weak<MemoryStore>,
    state: Mutex<State>,
    notifier: Mutex<Option<Arc<dyn ChangeNotifier>>>,
    pub calls: CallCounters,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state: Mutex::new(State::default()),
            notifier: Mutex::new(None),
            calls: CallCounters::default(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arc(&self) -> Result<Arc<MemoryStore>> {
        self.me.upgrade().ok_or_else(|| anyhow!("store has been shut down"))
    }

    pub fn set_notifier(&self, notifier: Arc<dyn ChangeNotifier>) {
        *self.notifier.lock().unwrap_or_else(PoisonError::into_inner) = Some(notifier);
    }

    async fn emit(&self, events: Vec<Event>) {
        let notifier = self.notifier.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(notifier) = notifier else {
            return;
        };

        for event in events {
            match event {
                Event::Update { address, mailbox, uid, seq, message, deleted } => {
                    notifier.update_message(&address, &mailbox, uid, seq, &message, deleted).await;
                }
                Event::Delete { address, mailbox, seq } => {
                    notifier.delete_message(&address, &mailbox, seq).await;
                }
                Event::Status { address, mailbox, counts } => {
                    notifier.mailbox_status(&address, &mailbox, counts).await;
                }
                Event::Created { address, mailbox } => {
                    notifier.mailbox_created(&address, &mailbox).await;
                }
            }
        }
    }

    /// Registers a user. `password` is either plain text or a bcrypt hash.
    pub fn add_user(&self, password: &str, quota_kb: i64) -> String {
        let mut state = self.lock();
        let id = state.new_id("user");
        state.users.insert(id.clone(), UserRecord {
            password: password.to_string(),
            max_upload: 25 * 1024 * 1024,
            max_space: quota_kb * 1024,
        });
        id
    }

    /// Registers an address with the system mailboxes.
    pub fn add_address(&self, user_id: &str, email: &str, display_name: &str) -> Result<String> {
        let mut state = self.lock();
        if !state.users.contains_key(user_id) {
            bail!("no such user {}", user_id);
        }
        let taken = state.addresses.values().any(|a| a.email.eq_ignore_ascii_case(email));
        if taken {
            bail!("address {} already exists", email);
        }

        let id = state.new_id("addr");
        let key_id = (state.addresses.len() as u8).wrapping_add(1);
        state.addresses.insert(id.clone(), AddressRecord {
            user_id: user_id.to_string(),
            email: email.to_string(),
            display_name: display_name.to_string(),
            key_id,
        });

        let labels: Vec<LabelRecord> = SYSTEM_LABELS.iter()
            .map(|(label_id, name)| LabelRecord {
                id: label_id.to_string(),
                name: name.to_string(),
                folder: true,
                system: true,
            })
            .collect();
        for label in &labels {
            state.mailboxes.insert((id.clone(), label.id.clone()), MailboxIndex::new());
        }
        state.labels.insert(id.clone(), labels);

        info!(address = %email, "Address registered");
        Ok(id)
    }

    pub fn key_ring(&self, address_id: &str) -> Result<MemoryKeyRing> {
        let state = self.lock();
        let address = state.addresses.get(address_id).ok_or_else(|| anyhow!("no such address {}", address_id))?;
        Ok(MemoryKeyRing::new(address.key_id))
    }

    /// Stores a message as if it had been delivered by the remote side.
    /// `plain_body` and the attachment data are encrypted on the way in.
    pub async fn deliver(
        &self,
        address_id: &str,
        mut message: Message,
        plain_body: &[u8],
        attachments: Vec<(Attachment, Vec<u8>)>
    ) -> Result<String> {
        let key_ring = self.key_ring(address_id)?;
        message.address_id = address_id.to_string();
        if message.body.is_empty() {
            message.body = key_ring.encrypt(plain_body)?;
        }
        if message.size == 0 {
            message.size = plain_body.len() as i64;
        }

        let mut events = Vec::new();
        let id = {
            let mut state = self.lock();
            message.attachments.clear();
            for (mut attachment, data) in attachments {
                let (packets, encrypted) = key_ring.encrypt_attachment(&data);
                attachment.id = state.new_id("att");
                attachment.key_packets = packets;
                state.attachments.insert(attachment.id.clone(), encrypted);
                message.attachments.push(attachment);
            }
            state.insert_message(message, &mut events)
        };

        self.emit(events).await;
        debug!(msg_id = %id, "Message delivered");
        Ok(id)
    }

    pub async fn notice(&self, address: &str, text: &str) {
        let notifier = self.notifier.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(notifier) = notifier {
            notifier.notice(address, text).await;
        }
    }

    /// Message metadata without going through the counted client calls.
    pub fn peek_message(&self, id: &str) -> Option<Message> {
        self.lock()
            .messages
            .get(id)
            .map(|m| m.meta.clone())
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }

    fn address_handle(&self, address_id: &str) -> Result<Arc<dyn StoreAddress>> {
        Ok(Arc::new(MemoryAddress { store: self.arc()?, address_id: address_id.to_string() }))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn authenticate(&self, login: &str, password: &str) -> Result<Arc<dyn StoreAddress>, AuthError> {
        let (address_id, stored_password) = {
            let state = self.lock();
            let Some((address_id, address)) = state.addresses
                .iter()
                .find(|(_, a)| a.email.eq_ignore_ascii_case(login)) else {
                return Err(AuthError::InvalidCredentials);
            };
            let user = state.users.get(&address.user_id).ok_or(AuthError::InvalidCredentials)?;
            (address_id.clone(), user.password.clone())
        };

        let valid = if stored_password.starts_with("$2") {
            bcrypt::verify(password, &stored_password)?
        } else {
            stored_password == password
        };
        if !valid {
            return Err(AuthError::InvalidCredentials);
        }

        Ok(self.address_handle(&address_id)?)
    }
}

#[async_trait]
impl Client for MemoryStore {
    async fn get_message(&self, id: &str) -> Result<Message> {
        self.calls.get_message.fetch_add(1, Ordering::SeqCst);
        self.peek_message(id).ok_or_else(|| anyhow!("no such message {}", id))
    }

    async fn get_attachment(&self, id: &str) -> Result<Vec<u8>> {
        self.calls.get_attachment.fetch_add(1, Ordering::SeqCst);
        self.lock()
            .attachments
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("no such attachment {}", id))
    }

    async fn key_ring_for_address(&self, address_id: &str) -> Result<Arc<dyn KeyRing>> {
        self.calls.key_ring.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.key_ring(address_id)?))
    }
}

/** ---------------------------------------------------------------
 * ----------------------- Trait object views ----------------------
 * --------------------------------------------------------------- */

struct MemoryUser {
    store: Arc<MemoryStore>,
    user_id: String,
}

#[async_trait]
impl StoreUser for MemoryUser {
    fn id(&self) -> String {
        self.user_id.clone()
    }

    fn client(&self) -> Arc<dyn Client> {
        self.store.clone()
    }

    async fn max_upload(&self) -> Result<i64> {
        let state = self.store.lock();
        let user = state.users.get(&self.user_id).ok_or_else(|| anyhow!("no such user"))?;
        Ok(user.max_upload)
    }

    async fn space(&self) -> Result<(i64, i64)> {
        let state = self.store.lock();
        let user = state.users.get(&self.user_id).ok_or_else(|| anyhow!("no such user"))?;
        let used = state.messages
            .values()
            .filter(|m| {
                state.addresses
                    .get(&m.meta.address_id)
                    .map(|a| a.user_id == self.user_id)
                    .unwrap_or(false)
            })
            .map(|m| m.meta.size.max(0))
            .sum();
        Ok((used, user.max_space))
    }
}

struct MemoryAddress {
    store: Arc<MemoryStore>,
    address_id: String,
}

impl MemoryAddress {
    fn mailbox_handle(&self, label: &LabelRecord) -> Arc<dyn StoreMailbox> {
        Arc::new(MemoryMailbox {
            store: self.store.clone(),
            address_id: self.address_id.clone(),
            label_id: label.id.clone(),
            name: label.name.clone(),
            folder: label.folder,
            system: label.system,
        })
    }
}

#[async_trait]
impl StoreAddress for MemoryAddress {
    fn id(&self) -> String {
        self.address_id.clone()
    }

    fn address(&self) -> String {
        self.store.lock().email(&self.address_id)
    }

    fn display_name(&self) -> String {
        self.store
            .lock()
            .addresses.get(&self.address_id)
            .map(|a| a.display_name.clone())
            .unwrap_or_default()
    }

    fn user(&self) -> Arc<dyn StoreUser> {
        let user_id = self.store
            .lock()
            .addresses.get(&self.address_id)
            .map(|a| a.user_id.clone())
            .unwrap_or_default();
        Arc::new(MemoryUser { store: self.store.clone(), user_id })
    }

    async fn list_mailboxes(&self) -> Result<Vec<Arc<dyn StoreMailbox>>> {
        let labels = self.store
            .lock()
            .labels.get(&self.address_id)
            .cloned()
            .unwrap_or_default();
        Ok(
            labels
                .iter()
                .map(|l| self.mailbox_handle(l))
                .collect()
        )
    }

    async fn get_mailbox(&self, name: &str) -> Result<Arc<dyn StoreMailbox>> {
        let label = {
            let state = self.store.lock();
            state.labels
                .get(&self.address_id)
                .and_then(|labels| {
                    labels
                        .iter()
                        .find(|l| {
                            l.name == name || (l.id == super::INBOX_LABEL && name.eq_ignore_ascii_case("INBOX"))
                        })
                        .cloned()
                })
        };
        match label {
            Some(label) => Ok(self.mailbox_handle(&label)),
            None => Err(anyhow!("no such mailbox {}", name)),
        }
    }

    async fn create_mailbox(&self, name: &str) -> Result<()> {
        let folder = if name.starts_with(FOLDERS_PREFIX) {
            true
        } else if name.starts_with(LABELS_PREFIX) {
            false
        } else {
            bail!("mailbox names must start with {} or {}", FOLDERS_PREFIX, LABELS_PREFIX);
        };

        let mut events = Vec::new();
        {
            let mut state = self.store.lock();
            let exists = state.labels
                .get(&self.address_id)
                .map(|labels| labels.iter().any(|l| l.name == name))
                .unwrap_or(false);
            if exists {
                bail!("mailbox {} already exists", name);
            }

            let label_id = format!("label-{}", uuid7());
            state.mailboxes.insert((self.address_id.clone(), label_id.clone()), MailboxIndex::new());
            state.labels.entry(self.address_id.clone()).or_default().push(LabelRecord {
                id: label_id,
                name: name.to_string(),
                folder,
                system: false,
            });
            events.push(Event::Created { address: state.email(&self.address_id), mailbox: name.to_string() });
        }

        self.store.emit(events).await;
        Ok(())
    }
}

struct MemoryMailbox {
    store: Arc<MemoryStore>,
    address_id: String,
    label_id: String,
    name: String,
    folder: bool,
    system: bool,
}

impl MemoryMailbox {
    fn key(&self) -> MailboxKey {
        (self.address_id.clone(), self.label_id.clone())
    }

    /// Applies `change` to each message that belongs to this address, then
    /// announces the new flags.
    async fn update_messages<F>(&self, ids: &[String], mut change: F) -> Result<()>
        where F: FnMut(&mut State, &str) + Send
    {
        let mut events = Vec::new();
        {
            let mut state = self.store.lock();
            let mut touched = BTreeSet::new();
            for id in ids {
                let owned = state.messages
                    .get(id)
                    .map(|m| m.meta.address_id == self.address_id)
                    .unwrap_or(false);
                if !owned {
                    continue;
                }
                change(&mut state, id);
                state.announce(id, &mut events, &mut touched);
            }
            for key in &touched {
                events.push(state.status_event(key));
            }
        }
        self.store.emit(events).await;
        Ok(())
    }

    fn new_message(&self, request: ImportRequest) -> Message {
        Message {
            id: String::new(),
            address_id: self.address_id.clone(),
            external_id: request.external_id,
            label_ids: request.label_ids,
            unread: request.unread,
            flags: request.flags,
            time: request.time,
            size: request.size,
            subject: request.subject,
            sender: request.sender,
            to_list: request.to_list,
            cc_list: request.cc_list,
            bcc_list: request.bcc_list,
            reply_tos: Vec::new(),
            header: request.header,
            mime_type: request.mime_type,
            body: request.body,
            attachments: Vec::new(),
        }
    }
}

#[async_trait]
impl StoreMailbox for MemoryMailbox {
    fn label_id(&self) -> String {
        self.label_id.clone()
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn address_id(&self) -> String {
        self.address_id.clone()
    }

    fn is_folder(&self) -> bool {
        self.folder
    }

    fn is_system(&self) -> bool {
        self.system
    }

    async fn uid_validity(&self) -> Result<u32> {
        let state = self.store.lock();
        let index = state.mailboxes.get(&self.key()).ok_or_else(|| anyhow!("mailbox {} is gone", self.name))?;
        Ok(index.uid_validity)
    }

    async fn next_uid(&self) -> Result<u32> {
        let state = self.store.lock();
        let index = state.mailboxes.get(&self.key()).ok_or_else(|| anyhow!("mailbox {} is gone", self.name))?;
        Ok(index.next_uid)
    }

    async fn counts(&self) -> Result<Counts> {
        Ok(self.store.lock().counts(&self.key()))
    }

    async fn api_ids(&self, uid: bool, start: u32, stop: u32) -> Result<Vec<String>> {
        let state = self.store.lock();
        let index = state.mailboxes.get(&self.key()).ok_or_else(|| anyhow!("mailbox {} is gone", self.name))?;

        if index.uids.is_empty() {
            return Ok(Vec::new());
        }

        let (low, high) = if uid {
            let last = index.uids.keys().next_back().copied().unwrap_or(0);
            let stop = if stop == 0 { last } else { stop };
            (start.min(stop), start.max(stop))
        } else {
            let total = index.uids.len() as u32;
            let stop = if stop == 0 { total } else { stop };
            let (low, high) = (start.min(stop), start.max(stop).min(total));
            match (index.uid_at(low), index.uid_at(high)) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Ok(Vec::new());
                }
            }
        };

        Ok(
            index.uids
                .range(low..=high)
                .map(|(_, id)| id.clone())
                .collect()
        )
    }

    async fn latest_api_id(&self) -> Result<Option<String>> {
        let state = self.store.lock();
        Ok(
            state.mailboxes
                .get(&self.key())
                .and_then(|index| index.uids.values().next_back().cloned())
        )
    }

    async fn uid_list(&self, ids: &[String]) -> Result<Vec<u32>> {
        let state = self.store.lock();
        let index = state.mailboxes.get(&self.key()).ok_or_else(|| anyhow!("mailbox {} is gone", self.name))?;
        Ok(
            ids
                .iter()
                .map(|id| index.by_id.get(id).copied().unwrap_or(0))
                .collect()
        )
    }

    async fn uid_by_external_id(&self, external_id: &str) -> Result<u32> {
        let wanted = external_id.trim().trim_start_matches('<').trim_end_matches('>');
        if wanted.is_empty() {
            return Ok(0);
        }

        let state = self.store.lock();
        let Some(index) = state.mailboxes.get(&self.key()) else {
            return Ok(0);
        };
        for (uid, id) in &index.uids {
            let matches = state.messages
                .get(id)
                .map(|m| m.meta.external_id.trim_start_matches('<').trim_end_matches('>') == wanted)
                .unwrap_or(false);
            if matches {
                return Ok(*uid);
            }
        }
        Ok(0)
    }

    async fn message(&self, id: &str) -> Result<Arc<dyn StoreMessage>> {
        let state = self.store.lock();
        let index = state.mailboxes.get(&self.key()).ok_or_else(|| anyhow!("mailbox {} is gone", self.name))?;
        let uid = *index.by_id.get(id).ok_or_else(|| anyhow!("no such message {} in {}", id, self.name))?;
        let stored = state.messages.get(id).ok_or_else(|| anyhow!("no such message {}", id))?;

        Ok(
            Arc::new(MemoryMessage {
                store: self.store.clone(),
                meta: stored.meta.clone(),
                uid,
                seq: index.seq_of(uid),
                deleted: index.deleted.contains(id),
            })
        )
    }

    async fn label_messages(&self, ids: &[String]) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.store.lock();
            for id in ids {
                let owned = state.messages
                    .get(id)
                    .map(|m| m.meta.address_id == self.address_id)
                    .unwrap_or(false);
                if owned {
                    state.attach(id, &self.label_id, &mut events);
                }
            }
        }
        self.store.emit(events).await;
        Ok(())
    }

    async fn unlabel_messages(&self, ids: &[String]) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.store.lock();
            let mut touched = BTreeSet::new();
            for id in ids {
                state.detach(id, &self.label_id, &mut events, &mut touched);
            }
            for key in &touched {
                events.push(state.status_event(key));
            }
        }
        self.store.emit(events).await;
        Ok(())
    }

    async fn mark_messages_read(&self, ids: &[String]) -> Result<()> {
        self.update_messages(ids, |state, id| {
            if let Some(m) = state.messages.get_mut(id) {
                m.meta.unread = false;
            }
        }).await
    }

    async fn mark_messages_unread(&self, ids: &[String]) -> Result<()> {
        self.update_messages(ids, |state, id| {
            if let Some(m) = state.messages.get_mut(id) {
                m.meta.unread = true;
            }
        }).await
    }

    async fn mark_messages_starred(&self, ids: &[String]) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.store.lock();
            for id in ids {
                state.attach(id, super::STARRED_LABEL, &mut events);
            }
        }
        self.store.emit(events).await;
        self.update_messages(ids, |_, _| {}).await
    }

    async fn mark_messages_unstarred(&self, ids: &[String]) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.store.lock();
            let mut touched = BTreeSet::new();
            for id in ids {
                state.detach(id, super::STARRED_LABEL, &mut events, &mut touched);
            }
            for key in &touched {
                events.push(state.status_event(key));
            }
        }
        self.store.emit(events).await;
        self.update_messages(ids, |_, _| {}).await
    }

    async fn mark_messages_deleted(&self, ids: &[String]) -> Result<()> {
        let key = self.key();
        self.update_messages(ids, move |state, id| {
            if let Some(index) = state.mailboxes.get_mut(&key) {
                if index.by_id.contains_key(id) {
                    index.deleted.insert(id.to_string());
                }
            }
        }).await
    }

    async fn mark_messages_undeleted(&self, ids: &[String]) -> Result<()> {
        let key = self.key();
        self.update_messages(ids, move |state, id| {
            if let Some(index) = state.mailboxes.get_mut(&key) {
                index.deleted.remove(id);
            }
        }).await
    }

    async fn remove_deleted(&self, ids: Option<&[String]>) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.store.lock();
            let key = self.key();
            let Some(index) = state.mailboxes.get(&key) else {
                bail!("mailbox {} is gone", self.name);
            };

            // In UID order so every reported sequence number is current.
            let mut targets: Vec<(u32, String)> = index.deleted
                .iter()
                .filter(|id| ids.map(|ids| ids.contains(*id)).unwrap_or(true))
                .filter_map(|id| index.by_id.get(id).map(|uid| (*uid, id.clone())))
                .collect();
            targets.sort();

            let destroy = [TRASH_LABEL, SPAM_LABEL, DRAFT_LABEL, ALL_DRAFTS_LABEL].contains(&self.label_id.as_str());
            let mut touched = BTreeSet::new();
            for (_, id) in targets {
                if destroy {
                    state.destroy(&id, &mut events, &mut touched);
                } else if self.label_id == ALL_MAIL_LABEL {
                    let labels = state.messages
                        .get(&id)
                        .map(|m| m.meta.label_ids.clone())
                        .unwrap_or_default();
                    for label in labels.iter().filter(|l| l.as_str() != ALL_MAIL_LABEL) {
                        state.detach(&id, label, &mut events, &mut touched);
                    }
                    state.attach(&id, TRASH_LABEL, &mut events);
                    if let Some(index) = state.mailboxes.get_mut(&key) {
                        index.deleted.remove(&id);
                    }
                } else {
                    state.detach(&id, &self.label_id, &mut events, &mut touched);
                }
            }
            for key in &touched {
                events.push(state.status_event(key));
            }
        }
        self.store.emit(events).await;
        Ok(())
    }

    async fn import_message(&self, mut request: ImportRequest) -> Result<String> {
        if !request.label_ids.contains(&self.label_id) {
            request.label_ids.push(self.label_id.clone());
        }
        let message = self.new_message(request);

        let mut events = Vec::new();
        let id = self.store.lock().insert_message(message, &mut events);
        self.store.emit(events).await;

        debug!(msg_id = %id, mailbox = %self.name, "Message imported");
        Ok(id)
    }

    async fn create_draft(&self, mut request: ImportRequest) -> Result<String> {
        request.flags = 0;
        request.unread = false;
        request.label_ids = vec![DRAFT_LABEL.to_string(), ALL_DRAFTS_LABEL.to_string()];
        let message = self.new_message(request);

        let mut events = Vec::new();
        let id = self.store.lock().insert_message(message, &mut events);
        self.store.emit(events).await;

        debug!(msg_id = %id, "Draft created");
        Ok(id)
    }

    async fn rename(&self, name: &str) -> Result<()> {
        if self.system {
            bail!("cannot rename system mailbox {}", self.name);
        }
        let prefix = if self.folder { FOLDERS_PREFIX } else { LABELS_PREFIX };
        if !name.starts_with(prefix) {
            bail!("mailbox {} must stay under {}", self.name, prefix);
        }

        let mut state = self.store.lock();
        let taken = state.labels
            .get(&self.address_id)
            .map(|labels| labels.iter().any(|l| l.name == name))
            .unwrap_or(false);
        if taken {
            bail!("mailbox {} already exists", name);
        }
        let label = state.labels
            .get_mut(&self.address_id)
            .and_then(|labels| labels.iter_mut().find(|l| l.id == self.label_id))
            .ok_or_else(|| anyhow!("mailbox {} is gone", self.name))?;
        label.name = name.to_string();
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        if self.system {
            bail!("cannot delete system mailbox {}", self.name);
        }

        let mut state = self.store.lock();
        state.mailboxes.remove(&self.key());
        if let Some(labels) = state.labels.get_mut(&self.address_id) {
            labels.retain(|l| l.id != self.label_id);
        }
        for stored in state.messages.values_mut() {
            stored.meta.label_ids.retain(|l| l != &self.label_id);
        }
        Ok(())
    }
}

struct MemoryMessage {
    store: Arc<MemoryStore>,
    meta: Message,
    uid: u32,
    seq: u32,
    deleted: bool,
}

#[async_trait]
impl StoreMessage for MemoryMessage {
    fn id(&self) -> String {
        self.meta.id.clone()
    }

    fn uid(&self) -> u32 {
        self.uid
    }

    fn sequence_number(&self) -> u32 {
        self.seq
    }

    fn message(&self) -> &Message {
        &self.meta
    }

    fn is_marked_deleted(&self) -> bool {
        self.deleted
    }

    async fn set_size(&self, size: i64) -> Result<()> {
        if let Some(stored) = self.store.lock().messages.get_mut(&self.meta.id) {
            stored.meta.size = size;
        }
        Ok(())
    }

    async fn body_structure(&self) -> Result<Option<BodyStructure>> {
        let encoded = self.store
            .lock()
            .messages.get(&self.meta.id)
            .and_then(|m| m.structure.clone());
        match encoded {
            Some(bytes) => Ok(Some(BodyStructure::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_body_structure(&self, structure: &BodyStructure) -> Result<()> {
        let encoded = structure.encode()?;
        if let Some(stored) = self.store.lock().messages.get_mut(&self.meta.id) {
            stored.structure = Some(encoded);
        }
        Ok(())
    }

    async fn header(&self) -> Result<Option<Vec<u8>>> {
        Ok(
            self.store
                .lock()
                .messages.get(&self.meta.id)
                .and_then(|m| m.header.clone())
        )
    }

    async fn set_header(&self, header: &[u8]) -> Result<()> {
        if let Some(stored) = self.store.lock().messages.get_mut(&self.meta.id) {
            stored.header = Some(header.to_vec());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ Address, INBOX_LABEL, SENT_LABEL, FLAG_RECEIVED };

    async fn seeded() -> (Arc<MemoryStore>, String) {
        let store = MemoryStore::new();
        let user = store.add_user("secret", 1024);
        let address = store.add_address(&user, "alice@example.com", "Alice").unwrap();
        (store, address)
    }

    fn incoming(subject: &str) -> Message {
        Message {
            subject: subject.to_string(),
            sender: Address::new("Bob", "bob@example.com"),
            label_ids: vec![INBOX_LABEL.to_string()],
            unread: true,
            flags: FLAG_RECEIVED,
            time: 1_700_000_000,
            mime_type: "text/plain".to_string(),
            ..Message::default()
        }
    }

    #[test]
    fn test_keyring_round_trip_and_wrong_key() {
        let kr = MemoryKeyRing::new(1);
        let armored = kr.encrypt(b"hello").unwrap();
        assert_eq!(kr.decrypt_message(&armored).unwrap(), b"hello");
        assert!(matches!(MemoryKeyRing::new(2).decrypt_message(&armored), Err(CryptoError::IncorrectKey)));

        let (packets, data) = kr.encrypt_attachment(b"file");
        let packets = STANDARD.decode(packets).unwrap();
        assert_eq!(kr.decrypt_attachment(&packets, &data).unwrap(), b"file");
    }

    #[tokio::test]
    async fn test_authenticate() {
        let (store, _) = seeded().await;
        assert!(store.authenticate("ALICE@example.com", "secret").await.is_ok());
        assert!(matches!(
            store.authenticate("alice@example.com", "wrong").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(store.authenticate("nobody@example.com", "secret").await.is_err());

        let hashed = bcrypt::hash("pw", 4).unwrap();
        let user = store.add_user(&hashed, 10);
        store.add_address(&user, "carol@example.com", "").unwrap();
        assert!(store.authenticate("carol@example.com", "pw").await.is_ok());
    }

    #[tokio::test]
    async fn test_uids_and_sequence_ranges() {
        let (store, address_id) = seeded().await;
        let mut ids = Vec::new();
        for n in 0..4 {
            ids.push(store.deliver(&address_id, incoming(&format!("m{}", n)), b"body", vec![]).await.unwrap());
        }

        let address = store.address_handle(&address_id).unwrap();
        let inbox = address.get_mailbox("inbox").await.unwrap();
        assert_eq!(inbox.next_uid().await.unwrap(), 5);
        assert_eq!(inbox.api_ids(true, 2, 3).await.unwrap(), ids[1..3].to_vec());
        assert_eq!(inbox.api_ids(false, 3, 0).await.unwrap(), ids[2..].to_vec());
        assert_eq!(inbox.latest_api_id().await.unwrap(), Some(ids[3].clone()));

        inbox.unlabel_messages(&ids[..1]).await.unwrap();
        assert_eq!(inbox.api_ids(false, 1, 1).await.unwrap(), vec![ids[1].clone()]);
        assert_eq!(inbox.uid_list(&ids[1..]).await.unwrap(), vec![2, 3, 4]);

        let counts = inbox.counts().await.unwrap();
        assert_eq!(counts, Counts { total: 3, unread: 3, unread_seq: 1 });
    }

    #[tokio::test]
    async fn test_expunge_in_trash_destroys() {
        let (store, address_id) = seeded().await;
        let mut message = incoming("old");
        message.label_ids = vec![TRASH_LABEL.to_string()];
        let id = store.deliver(&address_id, message, b"x", vec![]).await.unwrap();

        let address = store.address_handle(&address_id).unwrap();
        let trash = address.get_mailbox("Trash").await.unwrap();
        trash.mark_messages_deleted(&[id.clone()]).await.unwrap();
        assert!(trash.message(&id).await.unwrap().is_marked_deleted());

        trash.remove_deleted(None).await.unwrap();
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_import_and_external_id_lookup() {
        let (store, address_id) = seeded().await;
        let address = store.address_handle(&address_id).unwrap();
        let sent = address.get_mailbox("Sent").await.unwrap();

        let id = sent
            .import_message(ImportRequest {
                external_id: "abc@host".to_string(),
                label_ids: vec![SENT_LABEL.to_string()],
                ..ImportRequest::default()
            }).await
            .unwrap();

        assert_eq!(sent.uid_by_external_id("<abc@host>").await.unwrap(), 1);
        assert_eq!(sent.uid_by_external_id("<other@host>").await.unwrap(), 0);
        assert!(store.peek_message(&id).unwrap().has_label(ALL_MAIL_LABEL));
    }

    #[tokio::test]
    async fn test_create_rename_delete_mailbox() {
        let (store, address_id) = seeded().await;
        let address = store.address_handle(&address_id).unwrap();

        assert!(address.create_mailbox("Projects").await.is_err());
        address.create_mailbox("Folders/Projects").await.unwrap();
        let folder = address.get_mailbox("Folders/Projects").await.unwrap();
        assert!(folder.is_folder() && !folder.is_system());

        folder.rename("Folders/Work").await.unwrap();
        assert!(address.get_mailbox("Folders/Work").await.is_ok());
        assert!(address.get_mailbox("Trash").await.unwrap().rename("Folders/Bin").await.is_err());

        address.get_mailbox("Folders/Work").await.unwrap().delete().await.unwrap();
        assert!(address.get_mailbox("Folders/Work").await.is_err());
    }

    #[tokio::test]
    async fn test_cached_structure_and_header() {
        let (store, address_id) = seeded().await;
        let id = store.deliver(&address_id, incoming("s"), b"b", vec![]).await.unwrap();
        let inbox = store.address_handle(&address_id).unwrap().get_mailbox("INBOX").await.unwrap();

        let message = inbox.message(&id).await.unwrap();
        assert!(message.body_structure().await.unwrap().is_none());

        let structure = BodyStructure::parse(b"Subject: s\r\n\r\nb\r\n").unwrap();
        message.set_body_structure(&structure).await.unwrap();
        message.set_header(b"Subject: s\r\n\r\n").await.unwrap();
        message.set_size(17).await.unwrap();

        let again = inbox.message(&id).await.unwrap();
        assert_eq!(again.body_structure().await.unwrap(), Some(structure));
        assert_eq!(again.header().await.unwrap().as_deref(), Some(&b"Subject: s\r\n\r\n"[..]));
        assert_eq!(again.message().size, 17);
    }
}
