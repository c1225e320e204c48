use chrono::NaiveDate;

/// IMAP command as the bridge understands it (RFC 3501 plus IDLE, MOVE,
/// UIDPLUS, QUOTA, ID and UNSELECT).
#[derive(Debug, Clone, PartialEq)]
pub enum ImapCommand {
    // Any state
    Capability,
    Noop,
    Logout,
    StartTls,
    Id {
        params: Vec<(String, Option<String>)>,
    },

    // Not authenticated state
    Login {
        username: String,
        password: String,
    },

    // Authenticated state
    Select {
        mailbox: String,
    },
    Examine {
        mailbox: String,
    },
    Create {
        mailbox: String,
    },
    Delete {
        mailbox: String,
    },
    Rename {
        from: String,
        to: String,
    },
    List {
        reference: String,
        pattern: String,
    },
    Lsub {
        reference: String,
        pattern: String,
    },
    Subscribe {
        mailbox: String,
    },
    Unsubscribe {
        mailbox: String,
    },
    Status {
        mailbox: String,
        items: Vec<StatusItem>,
    },
    Append {
        mailbox: String,
        flags: Vec<String>,
        date_time: Option<String>,
        message: Vec<u8>,
    },
    GetQuota {
        root: String,
    },
    GetQuotaRoot {
        mailbox: String,
    },
    Idle,

    // Selected state
    Check,
    Close,
    Expunge,
    Unselect,
    Search {
        criteria: Vec<SearchCriteria>,
        charset: Option<String>,
    },
    Fetch {
        sequence_set: SequenceSet,
        items: Vec<FetchItem>,
    },
    Store {
        sequence_set: SequenceSet,
        operation: StoreOperation,
        silent: bool,
        flags: Vec<String>,
    },
    Copy {
        sequence_set: SequenceSet,
        mailbox: String,
    },
    Move {
        sequence_set: SequenceSet,
        mailbox: String,
    },
    Uid {
        command: Box<UidCommand>,
    },

    Unknown {
        command: String,
    },
}

impl ImapCommand {
    /// Commands during which EXPUNGE responses must not be sent.
    pub fn holds_expunges(&self) -> bool {
        matches!(self, ImapCommand::Fetch { .. } | ImapCommand::Store { .. } | ImapCommand::Search { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UidCommand {
    Fetch {
        sequence_set: SequenceSet,
        items: Vec<FetchItem>,
    },
    Search {
        criteria: Vec<SearchCriteria>,
        charset: Option<String>,
    },
    Store {
        sequence_set: SequenceSet,
        operation: StoreOperation,
        silent: bool,
        flags: Vec<String>,
    },
    Copy {
        sequence_set: SequenceSet,
        mailbox: String,
    },
    Move {
        sequence_set: SequenceSet,
        mailbox: String,
    },
    Expunge {
        sequence_set: SequenceSet,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchCriteria {
    All,
    Answered,
    Bcc(String),
    Before(NaiveDate),
    Body(String),
    Cc(String),
    Deleted,
    Draft,
    Flagged,
    From(String),
    Header(String, String),
    Keyword(String),
    Larger(u32),
    New,
    Not(Box<SearchCriteria>),
    Old,
    On(NaiveDate),
    Or(Box<SearchCriteria>, Box<SearchCriteria>),
    Recent,
    Seen,
    SentBefore(NaiveDate),
    SentOn(NaiveDate),
    SentSince(NaiveDate),
    Since(NaiveDate),
    Smaller(u32),
    Subject(String),
    Text(String),
    To(String),
    Uid(SequenceSet),
    Unanswered,
    Undeleted,
    Undraft,
    Unflagged,
    Unkeyword(String),
    Unseen,
    SequenceSet(SequenceSet),
    /// Parenthesized group; its keys all have to match.
    And(Vec<SearchCriteria>),
}

/// Sequence set (e.g. "1", "1:3", "4:*", "1,3:5").
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceSet {
    pub ranges: Vec<SequenceRange>,
}

/// `start:stop`, where `0` stands for `*`. A single number has
/// `start == stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceRange {
    pub start: u32,
    pub stop: u32,
}

impl SequenceRange {
    /// Bounds with `*` resolved against the largest number in use.
    pub fn bounds(&self, last: u32) -> (u32, u32) {
        let resolve = |n: u32| if n == 0 { last } else { n };
        let (a, b) = (resolve(self.start), resolve(self.stop));
        (a.min(b), a.max(b))
    }
}

impl SequenceSet {
    pub fn single(n: u32) -> Self {
        Self { ranges: vec![SequenceRange { start: n, stop: n }] }
    }

    /// Whether the set refers to `*`.
    pub fn is_dynamic(&self) -> bool {
        self.ranges.iter().any(|r| r.start == 0 || r.stop == 0)
    }

    pub fn contains(&self, n: u32, last: u32) -> bool {
        self.ranges.iter().any(|r| {
            let (low, high) = r.bounds(last);
            low <= n && n <= high
        })
    }
}

/// Part specifier of a BODY[...] item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Specifier {
    Entire,
    Header,
    HeaderFields(Vec<String>),
    HeaderFieldsNot(Vec<String>),
    Text,
    Mime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub path: Vec<usize>,
    pub specifier: Specifier,
}

impl Section {
    pub fn entire() -> Self {
        Self { path: Vec::new(), specifier: Specifier::Entire }
    }

    /// Section text as it is echoed back, e.g. `1.2.HEADER.FIELDS (TO)`.
    pub fn name(&self) -> String {
        let mut parts: Vec<String> = self.path
            .iter()
            .map(|n| n.to_string())
            .collect();
        let specifier = match &self.specifier {
            Specifier::Entire => None,
            Specifier::Header => Some("HEADER".to_string()),
            Specifier::HeaderFields(fields) => Some(format!("HEADER.FIELDS ({})", fields.join(" "))),
            Specifier::HeaderFieldsNot(fields) => Some(format!("HEADER.FIELDS.NOT ({})", fields.join(" "))),
            Specifier::Text => Some("TEXT".to_string()),
            Specifier::Mime => Some("MIME".to_string()),
        };
        parts.extend(specifier);
        parts.join(".")
    }

    pub fn is_header(&self) -> bool {
        matches!(
            self.specifier,
            Specifier::Header | Specifier::HeaderFields(_) | Specifier::HeaderFieldsNot(_)
        )
    }
}

/// Fetch items; ALL, FAST and FULL are expanded while parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchItem {
    Body,
    BodyStructure,
    Envelope,
    Flags,
    InternalDate,
    Rfc822,
    Rfc822Header,
    Rfc822Size,
    Rfc822Text,
    Uid,
    BodySection {
        section: Section,
        partial: Option<(u32, u32)>,
        peek: bool,
    },
}

impl FetchItem {
    /// Whether serving the item marks the message as read.
    pub fn sets_seen(&self) -> bool {
        match self {
            FetchItem::Rfc822 | FetchItem::Rfc822Text => true,
            FetchItem::BodySection { peek, .. } => !peek,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    /// FLAGS
    Replace,
    /// +FLAGS
    Add,
    /// -FLAGS
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusItem {
    Messages,
    Recent,
    UidNext,
    UidValidity,
    Unseen,
}

impl StatusItem {
    pub fn name(&self) -> &'static str {
        match self {
            StatusItem::Messages => "MESSAGES",
            StatusItem::Recent => "RECENT",
            StatusItem::UidNext => "UIDNEXT",
            StatusItem::UidValidity => "UIDVALIDITY",
            StatusItem::Unseen => "UNSEEN",
        }
    }
}
