pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{ Deserialize, Serialize };
use thiserror::Error;

use crate::message::encrypt::CryptoError;
use crate::message::mime::Header;
use crate::message::section::BodyStructure;

pub const INBOX_LABEL: &str = "0";
pub const ALL_DRAFTS_LABEL: &str = "1";
pub const ALL_SENT_LABEL: &str = "2";
pub const TRASH_LABEL: &str = "3";
pub const SPAM_LABEL: &str = "4";
pub const ALL_MAIL_LABEL: &str = "5";
pub const ARCHIVE_LABEL: &str = "6";
pub const SENT_LABEL: &str = "7";
pub const DRAFT_LABEL: &str = "8";
pub const STARRED_LABEL: &str = "10";

pub const FLAG_RECEIVED: i64 = 1;
pub const FLAG_SENT: i64 = 2;
pub const FLAG_INTERNAL: i64 = 4;
pub const FLAG_E2E: i64 = 8;
pub const FLAG_AUTO: i64 = 16;
pub const FLAG_REPLIED: i64 = 32;
pub const FLAG_REPLIED_ALL: i64 = 64;
pub const FLAG_FORWARDED: i64 = 128;

/// Labels that exist for every address and cannot be renamed or removed.
pub const SYSTEM_LABELS: [(&str, &str); 8] = [
    (INBOX_LABEL, "INBOX"),
    (DRAFT_LABEL, "Drafts"),
    (SENT_LABEL, "Sent"),
    (STARRED_LABEL, "Starred"),
    (ARCHIVE_LABEL, "Archive"),
    (SPAM_LABEL, "Spam"),
    (TRASH_LABEL, "Trash"),
    (ALL_MAIL_LABEL, "All Mail"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: String,
    pub address: String,
}

impl Address {
    pub fn new(name: &str, address: &str) -> Self {
        Self { name: name.to_string(), address: address.to_string() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub message_id: String,
    pub name: String,
    pub mime_type: String,
    /// `attachment` or `inline`.
    pub disposition: String,
    /// Base64 of the session key packets; the data packet is fetched
    /// separately.
    pub key_packets: String,
    pub header: BTreeMap<String, String>,
}

/// Message metadata as the remote store reports it. `body` is the armored
/// ciphertext of the decrypted content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub address_id: String,
    pub external_id: String,
    pub label_ids: Vec<String>,
    pub unread: bool,
    pub flags: i64,
    /// Unix seconds.
    pub time: i64,
    pub size: i64,
    pub subject: String,
    pub sender: Address,
    pub to_list: Vec<Address>,
    pub cc_list: Vec<Address>,
    pub bcc_list: Vec<Address>,
    pub reply_tos: Vec<Address>,
    pub header: Header,
    pub mime_type: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn has(&self, flag: i64) -> bool {
        self.flags & flag == flag
    }

    pub fn has_label(&self, label_id: &str) -> bool {
        self.label_ids.iter().any(|l| l == label_id)
    }

    /// Neither sent nor received means the message is still a draft.
    pub fn is_draft(&self) -> bool {
        self.flags & (FLAG_SENT | FLAG_RECEIVED) == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature {
    pub hash: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub total: u32,
    pub unread: u32,
    /// Sequence number of the first unread message, 0 when all are read.
    pub unread_seq: u32,
}

/// Everything needed to create a message from an appended literal.
#[derive(Debug, Clone, Default)]
pub struct ImportRequest {
    pub label_ids: Vec<String>,
    pub unread: bool,
    pub flags: i64,
    pub time: i64,
    pub external_id: String,
    pub subject: String,
    pub sender: Address,
    pub to_list: Vec<Address>,
    pub cc_list: Vec<Address>,
    pub bcc_list: Vec<Address>,
    pub header: Header,
    pub mime_type: String,
    pub body: String,
    pub size: i64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("password hash error: {0}")]
    Crypto(#[from] bcrypt::BcryptError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Decryption keys of one address.
pub trait KeyRing: Send + Sync {
    fn decrypt_message(&self, armored: &str) -> Result<Vec<u8>, CryptoError>;
    fn decrypt_attachment(&self, key_packets: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn extract_signatures(&self, message: &Message) -> Result<Vec<Signature>, CryptoError>;
    fn encrypt(&self, plain: &[u8]) -> Result<String, CryptoError>;
}

/// Network side of the store: ciphertext retrieval.
#[async_trait]
pub trait Client: Send + Sync {
    async fn get_message(&self, id: &str) -> Result<Message>;
    async fn get_attachment(&self, id: &str) -> Result<Vec<u8>>;
    async fn key_ring_for_address(&self, address_id: &str) -> Result<Arc<dyn KeyRing>>;
}

/// Push hook the store drives when mailbox contents change.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    async fn notice(&self, address: &str, text: &str);
    async fn update_message(
        &self,
        address: &str,
        mailbox: &str,
        uid: u32,
        seq: u32,
        message: &Message,
        marked_deleted: bool
    );
    async fn delete_message(&self, address: &str, mailbox: &str, seq: u32);
    async fn mailbox_created(&self, address: &str, mailbox: &str);
    async fn mailbox_status(&self, address: &str, mailbox: &str, counts: Counts);
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Resolves a login to the address it names.
    async fn authenticate(&self, login: &str, password: &str) -> Result<Arc<dyn StoreAddress>, AuthError>;
}

#[async_trait]
pub trait StoreUser: Send + Sync {
    fn id(&self) -> String;
    fn client(&self) -> Arc<dyn Client>;
    async fn max_upload(&self) -> Result<i64>;
    /// Used and maximum space in bytes.
    async fn space(&self) -> Result<(i64, i64)>;
}

#[async_trait]
pub trait StoreAddress: Send + Sync {
    fn id(&self) -> String;
    fn address(&self) -> String;
    fn display_name(&self) -> String;
    fn user(&self) -> Arc<dyn StoreUser>;
    async fn list_mailboxes(&self) -> Result<Vec<Arc<dyn StoreMailbox>>>;
    async fn get_mailbox(&self, name: &str) -> Result<Arc<dyn StoreMailbox>>;
    async fn create_mailbox(&self, name: &str) -> Result<()>;
}

#[async_trait]
pub trait StoreMailbox: Send + Sync {
    fn label_id(&self) -> String;
    fn name(&self) -> String;
    fn address_id(&self) -> String;
    fn is_folder(&self) -> bool;
    fn is_system(&self) -> bool;
    /// Unique per address and label.
    fn storage_id(&self) -> String {
        format!("{}/{}", self.address_id(), self.label_id())
    }

    async fn uid_validity(&self) -> Result<u32>;
    async fn next_uid(&self) -> Result<u32>;
    async fn counts(&self) -> Result<Counts>;

    /// Message ids in `start..=stop`, by UID or sequence number; a `stop`
    /// of 0 means the last message.
    async fn api_ids(&self, uid: bool, start: u32, stop: u32) -> Result<Vec<String>>;
    async fn latest_api_id(&self) -> Result<Option<String>>;
    async fn uid_list(&self, ids: &[String]) -> Result<Vec<u32>>;
    async fn uid_by_external_id(&self, external_id: &str) -> Result<u32>;
    async fn message(&self, id: &str) -> Result<Arc<dyn StoreMessage>>;

    async fn label_messages(&self, ids: &[String]) -> Result<()>;
    async fn unlabel_messages(&self, ids: &[String]) -> Result<()>;
    async fn mark_messages_read(&self, ids: &[String]) -> Result<()>;
    async fn mark_messages_unread(&self, ids: &[String]) -> Result<()>;
    async fn mark_messages_starred(&self, ids: &[String]) -> Result<()>;
    async fn mark_messages_unstarred(&self, ids: &[String]) -> Result<()>;
    async fn mark_messages_deleted(&self, ids: &[String]) -> Result<()>;
    async fn mark_messages_undeleted(&self, ids: &[String]) -> Result<()>;
    /// Removes messages marked deleted; `ids` narrows the set for UID EXPUNGE.
    async fn remove_deleted(&self, ids: Option<&[String]>) -> Result<()>;

    async fn import_message(&self, request: ImportRequest) -> Result<String>;
    async fn create_draft(&self, request: ImportRequest) -> Result<String>;

    async fn rename(&self, name: &str) -> Result<()>;
    async fn delete(&self) -> Result<()>;
}

#[async_trait]
pub trait StoreMessage: Send + Sync {
    fn id(&self) -> String;
    fn uid(&self) -> u32;
    fn sequence_number(&self) -> u32;
    fn message(&self) -> &Message;
    fn is_marked_deleted(&self) -> bool;

    async fn set_size(&self, size: i64) -> Result<()>;
    async fn body_structure(&self) -> Result<Option<BodyStructure>>;
    async fn set_body_structure(&self, structure: &BodyStructure) -> Result<()>;
    /// Full raw header, if a build already stored it.
    async fn header(&self) -> Result<Option<Vec<u8>>>;
    async fn set_header(&self, header: &[u8]) -> Result<()>;
}
