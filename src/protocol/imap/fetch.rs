use std::sync::Arc;

use anyhow::Result;
use tracing::{ debug, trace, warn };

use super::cache::message_key;
use super::command::state::{ FetchItem, Section, SequenceSet, Specifier };
use super::mailbox::Mailbox;
use super::response::{ body_structure, envelope, flag_list, internal_date, write_literal };
use crate::message::header::{ imap_flags, message_header, sanitize_message_date, JobOptions };
use crate::message::section::{ BodyStructure, SectionError };
use crate::store::{ StoreMessage, DRAFT_LABEL };
use crate::utils::parallel::run_parallel;

type Literal = (Arc<Vec<u8>>, Arc<BodyStructure>);

/// Rendered FETCH response of one message, plus its id when the fetch read
/// the body of an unread message.
struct Fetched {
    response: Vec<u8>,
    mark_read: Option<String>,
}

impl Mailbox {
    /// FETCH and UID FETCH. Untagged responses are appended to `out` in
    /// request order.
    pub async fn list_messages(
        self: &Arc<Self>,
        uid: bool,
        set: &SequenceSet,
        items: &[FetchItem],
        out: &mut Vec<u8>
    ) -> Result<()> {
        let shared = self.user.shared.clone();
        // Sequence numbers must not shift under a non-UID FETCH.
        let _barrier = if uid { None } else { Some(shared.updates.forbid_expunge(self.storage_id())) };

        let ids = self.resolve_ids(set, uid).await?;
        let mut items = items.to_vec();
        if uid && !items.contains(&FetchItem::Uid) {
            items.insert(0, FetchItem::Uid);
        }
        debug!(mailbox = %self.name(), uid, count = ids.len(), "Fetching messages");

        let mailbox = self.clone();
        let items = Arc::new(items);
        let mut mark_read = Vec::new();

        run_parallel(
            shared.fetch_workers,
            ids,
            move |id: String| {
                let mailbox = mailbox.clone();
                let items = items.clone();
                async move { mailbox.fetch_message(&id, &items).await }
            },
            |_, fetched: Fetched| {
                out.extend_from_slice(&fetched.response);
                mark_read.extend(fetched.mark_read);
                Ok(())
            }
        ).await?;

        if !mark_read.is_empty() {
            self.store.mark_messages_read(&mark_read).await?;
        }
        Ok(())
    }

    async fn fetch_message(&self, id: &str, items: &[FetchItem]) -> Result<Fetched> {
        let stored = match self.store.message(id).await {
            Ok(stored) => stored,
            Err(err) => {
                debug!(msg_id = id, error = %err, "Message gone before it could be fetched");
                return Ok(Fetched { response: Vec::new(), mark_read: None });
            }
        };
        let message = stored.message();

        let mut flags = imap_flags(message);
        if stored.is_marked_deleted() {
            flags.push("\\Deleted".to_string());
        }
        let mark_read = message.unread && items.iter().any(FetchItem::sets_seen);
        if mark_read {
            flags.insert(0, "\\Seen".to_string());
        }

        let mut literal: Option<Literal> = None;
        let mut parts: Vec<Vec<u8>> = Vec::with_capacity(items.len());

        for item in items {
            let mut part = Vec::new();
            match item {
                FetchItem::Flags => {
                    part.extend_from_slice(format!("FLAGS {}", flag_list(&flags)).as_bytes());
                }
                FetchItem::Uid => {
                    part.extend_from_slice(format!("UID {}", stored.uid()).as_bytes());
                }
                FetchItem::InternalDate => {
                    let date = internal_date(sanitize_message_date(message.time));
                    part.extend_from_slice(format!("INTERNALDATE {}", date).as_bytes());
                }
                FetchItem::Rfc822Size => {
                    let size = if message.size > 0 {
                        message.size as usize
                    } else {
                        self.cached_literal(stored.as_ref(), &mut literal).await?.0.len()
                    };
                    part.extend_from_slice(format!("RFC822.SIZE {}", size).as_bytes());
                }
                FetchItem::Envelope => {
                    let header = message_header(message, &JobOptions::imap());
                    part.extend_from_slice(format!("ENVELOPE {}", envelope(&header, message.time)).as_bytes());
                }
                FetchItem::Body | FetchItem::BodyStructure => {
                    let extended = matches!(item, FetchItem::BodyStructure);
                    let structure = self.structure(stored.as_ref(), &mut literal).await?;
                    let rendered = body_structure(&structure.imap_body_structure(&[])?, extended);
                    let name = if extended { "BODYSTRUCTURE" } else { "BODY" };
                    part.extend_from_slice(format!("{} {}", name, rendered).as_bytes());
                }
                FetchItem::BodySection { section, partial, .. } => {
                    let data = self.section(stored.as_ref(), section, &mut literal).await?;
                    let (data, origin) = apply_partial(&data, *partial);
                    let origin = origin.map(|o| format!("<{}>", o)).unwrap_or_default();
                    part.extend_from_slice(format!("BODY[{}]{} ", section.name(), origin).as_bytes());
                    write_literal(&mut part, data);
                }
                FetchItem::Rfc822 => {
                    let (data, _) = self.cached_literal(stored.as_ref(), &mut literal).await?;
                    part.extend_from_slice(b"RFC822 ");
                    write_literal(&mut part, &data);
                }
                FetchItem::Rfc822Header => {
                    let header = Section { path: Vec::new(), specifier: Specifier::Header };
                    let data = self.section(stored.as_ref(), &header, &mut literal).await?;
                    part.extend_from_slice(b"RFC822.HEADER ");
                    write_literal(&mut part, &data);
                }
                FetchItem::Rfc822Text => {
                    let text = Section { path: Vec::new(), specifier: Specifier::Text };
                    let data = self.section(stored.as_ref(), &text, &mut literal).await?;
                    part.extend_from_slice(b"RFC822.TEXT ");
                    write_literal(&mut part, &data);
                }
            }
            parts.push(part);
        }

        let mut response = format!("* {} FETCH (", stored.sequence_number()).into_bytes();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                response.push(b' ');
            }
            response.extend_from_slice(part);
        }
        response.extend_from_slice(b")\r\n");

        trace!(msg_id = id, seq = stored.sequence_number(), "Message fetched");
        Ok(Fetched { response, mark_read: mark_read.then(|| id.to_string()) })
    }

    /// The built literal, from `slot`, the build cache or a fresh build.
    async fn cached_literal(&self, stored: &dyn StoreMessage, slot: &mut Option<Literal>) -> Result<Literal> {
        if let Some(literal) = slot {
            return Ok(literal.clone());
        }
        let literal = self.build_literal(stored).await?;
        *slot = Some(literal.clone());
        Ok(literal)
    }

    async fn build_literal(&self, stored: &dyn StoreMessage) -> Result<Literal> {
        let shared = &self.user.shared;
        let id = stored.id();
        let key = message_key(&self.user.user_id(), &id);

        let _lock = shared.cache.build_lock(&key).await;
        if let Some(cached) = shared.cache.lookup(&key) {
            trace!(msg_id = %id, "Build cache hit");
            return Ok((cached.data, cached.structure));
        }

        let literal = shared.builder.build(self.user.client(), &id, JobOptions::imap()).await?;
        let structure = BodyStructure::parse(&literal)?;

        if let Err(err) = stored.set_size(literal.len() as i64).await {
            warn!(msg_id = %id, error = %err, "Cannot store message size");
        }

        // Drafts change, so nothing about them is kept.
        let message = stored.message();
        let draft = message.has_label(DRAFT_LABEL) || message.is_draft();
        if !draft {
            if let Err(err) = stored.set_body_structure(&structure).await {
                warn!(msg_id = %id, error = %err, "Cannot store body structure");
            }
            match structure.get_mail_header_bytes(&literal) {
                Ok(header) => {
                    if let Err(err) = stored.set_header(header).await {
                        warn!(msg_id = %id, error = %err, "Cannot store message header");
                    }
                }
                Err(err) => warn!(msg_id = %id, error = %err, "Cannot extract message header"),
            }
            shared.cache.store(&key, literal.clone(), structure.clone());
        }

        Ok((Arc::new(literal), Arc::new(structure)))
    }

    async fn structure(&self, stored: &dyn StoreMessage, slot: &mut Option<Literal>) -> Result<Arc<BodyStructure>> {
        if slot.is_none() {
            match stored.body_structure().await {
                Ok(Some(structure)) => {
                    return Ok(Arc::new(structure));
                }
                Ok(None) => {}
                Err(err) => warn!(msg_id = %stored.id(), error = %err, "Cannot load stored body structure"),
            }
        }
        Ok(self.cached_literal(stored, slot).await?.1)
    }

    async fn section(&self, stored: &dyn StoreMessage, section: &Section, slot: &mut Option<Literal>) -> Result<Vec<u8>> {
        // A top-level header request is served from the stored header.
        if section.path.is_empty() && section.is_header() && slot.is_none() {
            if let Ok(Some(header)) = stored.header().await {
                return Ok(filter_header(&header, &section.specifier));
            }
        }

        let (literal, structure) = self.cached_literal(stored, slot).await?;
        let path = section.path.as_slice();
        let data = match &section.specifier {
            Specifier::Entire if path.is_empty() => Ok(literal.as_slice()),
            Specifier::Entire | Specifier::Text => structure.get_section_content(&literal, path),
            Specifier::Mime => structure.get_section_header_bytes(&literal, path),
            Specifier::Header | Specifier::HeaderFields(_) | Specifier::HeaderFieldsNot(_) => {
                if path.is_empty() {
                    structure.get_mail_header_bytes(&literal)
                } else {
                    structure.get_section_header_bytes(&literal, path)
                }
            }
        };

        match data {
            Ok(data) => Ok(filter_header(data, &section.specifier)),
            Err(SectionError::InvalidLength { path, length }) => {
                debug!(path = %path, length, "Empty section");
                Ok(Vec::new())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Keeps the header fields a HEADER.FIELDS or HEADER.FIELDS.NOT request
/// asks for; other specifiers pass `data` through.
fn filter_header(data: &[u8], specifier: &Specifier) -> Vec<u8> {
    let (fields, keep) = match specifier {
        Specifier::HeaderFields(fields) => (fields, true),
        Specifier::HeaderFieldsNot(fields) => (fields, false),
        _ => {
            return data.to_vec();
        }
    };

    let mut out = Vec::new();
    let mut wanted = false;
    for line in data.split_inclusive(|&c| c == b'\n') {
        let content = line.strip_suffix(b"\n").unwrap_or(line);
        let content = content.strip_suffix(b"\r").unwrap_or(content);
        if content.is_empty() {
            break;
        }

        let continuation = matches!(content.first(), Some(b' ') | Some(b'\t'));
        if !continuation {
            let name = content
                .iter()
                .position(|&c| c == b':')
                .map(|end| String::from_utf8_lossy(&content[..end]).trim().to_ascii_uppercase())
                .unwrap_or_default();
            wanted = fields.iter().any(|f| f.eq_ignore_ascii_case(&name)) == keep;
        }
        if wanted {
            out.extend_from_slice(content);
            out.extend_from_slice(b"\r\n");
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Cuts `<origin.length>` out of `data`.
fn apply_partial(data: &[u8], partial: Option<(u32, u32)>) -> (&[u8], Option<u32>) {
    let Some((origin, length)) = partial else {
        return (data, None);
    };
    let start = (origin as usize).min(data.len());
    let end = start.saturating_add(length as usize).min(data.len());
    (&data[start..end], Some(origin))
}

#[cfg(test)]
mod tests {
    use super::super::backend::test_support::*;
    use super::super::command::parse_command_line;
    use super::super::command::state::ImapCommand;
    use super::*;
    use std::sync::atomic::Ordering;

    fn fetch_args(line: &str) -> (SequenceSet, Vec<FetchItem>) {
        match parse_command_line(line.as_bytes()).unwrap().1 {
            ImapCommand::Fetch { sequence_set, items } => (sequence_set, items),
            other => panic!("not a fetch: {:?}", other),
        }
    }

    #[test]
    fn test_filter_header() {
        let header = b"From: bob@example.com\r\nSubject: a\r\n long subject\r\nTo: alice@example.com\r\n\r\n";
        let only = filter_header(header, &Specifier::HeaderFields(vec!["SUBJECT".to_string()]));
        assert_eq!(only, b"Subject: a\r\n long subject\r\n\r\n");
        let not = filter_header(header, &Specifier::HeaderFieldsNot(vec!["SUBJECT".to_string()]));
        assert_eq!(not, b"From: bob@example.com\r\nTo: alice@example.com\r\n\r\n");
        assert_eq!(filter_header(header, &Specifier::Header), header.to_vec());
    }

    #[test]
    fn test_apply_partial() {
        assert_eq!(apply_partial(b"0123456789", Some((2, 3))), (&b"234"[..], Some(2)));
        assert_eq!(apply_partial(b"0123456789", Some((8, 10))), (&b"89"[..], Some(8)));
        assert_eq!(apply_partial(b"0123", Some((10, 1))), (&b""[..], Some(10)));
        assert_eq!(apply_partial(b"0123", None), (&b"0123"[..], None));
    }

    #[tokio::test]
    async fn test_fetch_flags_and_uid() {
        let fixture = fixture().await;
        fixture.deliver("one", "hello").await;
        let user = fixture.login().await;
        let inbox = user.get_mailbox("INBOX").await.unwrap();

        let (set, items) = fetch_args("a FETCH 1 (FLAGS UID)");
        let mut out = Vec::new();
        inbox.list_messages(false, &set, &items, &mut out).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "* 1 FETCH (FLAGS () UID 1)\r\n");

        let mut out = Vec::new();
        inbox.list_messages(true, &set, &[FetchItem::Flags], &mut out).await.unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "* 1 FETCH (UID 1 FLAGS ())\r\n");
    }

    #[tokio::test]
    async fn test_body_fetch_marks_read_and_peek_does_not() {
        let fixture = fixture().await;
        let id = fixture.deliver("one", "hello world").await;
        let user = fixture.login().await;
        let inbox = user.get_mailbox("INBOX").await.unwrap();

        let (set, items) = fetch_args("a FETCH 1 (BODY.PEEK[TEXT])");
        let mut out = Vec::new();
        inbox.list_messages(false, &set, &items, &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("* 1 FETCH (BODY[TEXT] {"), "{}", text);
        assert!(text.contains("hello world"));
        assert!(fixture.store.peek_message(&id).unwrap().unread);

        let (set, items) = fetch_args("a FETCH 1 (FLAGS BODY[HEADER.FIELDS (SUBJECT)])");
        let mut out = Vec::new();
        inbox.list_messages(false, &set, &items, &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("* 1 FETCH (FLAGS (\\Seen) BODY[HEADER.FIELDS (SUBJECT)] {16}\r\nSubject: one\r\n\r\n)"), "{}", text);
        assert!(!fixture.store.peek_message(&id).unwrap().unread);
    }

    #[tokio::test]
    async fn test_build_stores_size_structure_and_header() {
        let fixture = fixture().await;
        let id = fixture.deliver("one", "hello").await;
        let user = fixture.login().await;
        let inbox = user.get_mailbox("INBOX").await.unwrap();

        let (set, items) = fetch_args("a FETCH 1 (RFC822 BODYSTRUCTURE)");
        let mut out = Vec::new();
        inbox.list_messages(false, &set, &items, &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("BODYSTRUCTURE (\"TEXT\" \"PLAIN\""), "{}", text);

        let stored = inbox.store.message(&id).await.unwrap();
        assert!(stored.body_structure().await.unwrap().is_some());
        assert!(stored.header().await.unwrap().is_some());
        let size = fixture.store.peek_message(&id).unwrap().size;
        assert!(text.contains(&format!("RFC822 {{{}}}\r\n", size)), "{}", text);
        assert_eq!(user.shared.cache.len(), 1);
    }

    #[tokio::test]
    async fn test_partial_section() {
        let fixture = fixture().await;
        fixture.deliver("one", "hello").await;
        let user = fixture.login().await;
        let inbox = user.get_mailbox("INBOX").await.unwrap();

        let (set, items) = fetch_args("a FETCH 1 BODY.PEEK[]<0.4>");
        let mut out = Vec::new();
        inbox.list_messages(false, &set, &items, &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("* 1 FETCH (BODY[]<0> {4}\r\n"), "{}", text);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_builds_fetch_once() {
        let fixture = fixture().await;
        let id = fixture.deliver("one", "the same body for everyone").await;
        let user = fixture.login().await;
        let inbox = user.get_mailbox("INBOX").await.unwrap();
        let before = fixture.store.calls.get_message.load(Ordering::SeqCst);

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let inbox = inbox.clone();
            let id = id.clone();
            tasks.push(
                tokio::spawn(async move {
                    let stored = inbox.store.message(&id).await.unwrap();
                    let mut slot = None;
                    let (literal, _) = inbox.cached_literal(stored.as_ref(), &mut slot).await.unwrap();
                    literal.as_ref().clone()
                })
            );
        }

        let mut outputs = Vec::new();
        for task in tasks {
            outputs.push(task.await.unwrap());
        }
        assert_eq!(fixture.store.calls.get_message.load(Ordering::SeqCst) - before, 1);
        assert!(outputs.iter().all(|o| o == &outputs[0]));
        assert!(!outputs[0].is_empty());
    }
}
