use std::future::pending;
use std::sync::Arc;

use anyhow::{ anyhow, bail, Result };
use chrono::{ DateTime, Utc };
use tokio::io::{ AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter };
use tokio::sync::Mutex;
use tracing::{ debug, error, info, warn };

use super::backend::Registration;
use super::command::state::{
    FetchItem,
    ImapCommand,
    SearchCriteria,
    SequenceSet,
    StatusItem,
    StoreOperation,
    UidCommand,
};
use super::command::{ literal_suffix, parse_command_line };
use super::mailbox::{ Mailbox, MailboxError, MAILBOX_FLAGS };
use super::response::quote;
use super::state::{ ImapSession, ImapState };
use super::updates::{ Update, UpdateKind };
use super::user::User;
use crate::runtime::Runtime;
use crate::utils::panic;

const CAPABILITIES: &str = "IMAP4rev1 IDLE MOVE UIDPLUS QUOTA ID UNSELECT";
const MAX_LITERAL_SIZE: usize = 64 * 1024 * 1024;
const DELIMITER: &str = "/";

/// A push held back until the client may see it. Pushes with the same key
/// replace each other; expunges have no key and are never merged.
struct HeldPush {
    mailbox: String,
    key: Option<String>,
    line: String,
}

impl HeldPush {
    fn new(update: &Update) -> Self {
        let line = update.render();
        let key = match &update.kind {
            UpdateKind::Expunge { .. } => None,
            UpdateKind::MailboxStatus { .. } => Some("status".to_string()),
            UpdateKind::Message { uid, .. } => Some(format!("uid {}", uid)),
            UpdateKind::Notice(_) | UpdateKind::MailboxCreated { .. } => Some(line.clone()),
        };
        Self { mailbox: update.mailbox.clone(), key, line }
    }
}

/// Push side of one connection: its registration with the backend and the
/// pushes it holds back until the client may see them.
struct Pushes {
    registration: Option<Registration>,
    selected: Option<String>,
    pending: Vec<HeldPush>,
}

impl Pushes {
    fn new() -> Self {
        Self { registration: None, selected: None, pending: Vec::new() }
    }

    fn concerns(&self, update: &Update) -> bool {
        if update.mailbox.is_empty() {
            return true;
        }
        match &self.selected {
            Some(name) => name == &update.mailbox || (name.eq_ignore_ascii_case("INBOX") && update.mailbox.eq_ignore_ascii_case("INBOX")),
            None => false,
        }
    }

    fn queue(&mut self, update: Update) {
        if !self.concerns(&update) {
            return;
        }
        let push = HeldPush::new(&update);

        // Sequence numbers shift at an expunge, so merging stops there.
        let barrier = self.pending
            .iter()
            .rposition(|held| held.key.is_none())
            .map_or(0, |i| i + 1);
        if push.key.is_some() {
            let replaced = self.pending[barrier..]
                .iter()
                .position(|held| held.mailbox == push.mailbox && held.key == push.key);
            if let Some(i) = replaced {
                self.pending.remove(barrier + i);
            }
        }
        self.pending.push(push);
    }

    async fn deliver(
        &mut self,
        update: Update,
        hold_expunges: bool,
        writer: &mut BufWriter<impl AsyncWriteExt + Unpin>
    ) -> Result<()> {
        if !self.concerns(&update) {
            return Ok(());
        }
        let held = hold_expunges && (update.is_expunge() || matches!(update.kind, UpdateKind::MailboxStatus { .. }));
        if held {
            self.queue(update);
            return Ok(());
        }
        writer.write_all(update.render().as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn flush(&mut self, writer: &mut BufWriter<impl AsyncWriteExt + Unpin>) -> Result<()> {
        for held in self.pending.drain(..) {
            writer.write_all(held.line.as_bytes()).await?;
        }
        Ok(())
    }

    fn select(&mut self, mailbox: Option<String>) {
        if self.selected == mailbox {
            return;
        }
        // Held pushes of the previous mailbox are stale now.
        self.pending.retain(|held| held.mailbox.is_empty());
        if let Some(registration) = &self.registration {
            registration.set_selected(mailbox.clone());
        }
        self.selected = mailbox;
    }
}

/// Next push for the connection; never resolves while nobody is logged in.
async fn next_update(registration: &mut Option<Registration>) -> Update {
    if let Some(registration) = registration {
        if let Some(update) = registration.recv().await {
            return update;
        }
    }
    pending().await
}

fn trim_line(mut line: Vec<u8>) -> Vec<u8> {
    if line.ends_with(b"\n") {
        line.pop();
    }
    if line.ends_with(b"\r") {
        line.pop();
    }
    line
}

fn send_ok(out: &mut Vec<u8>, tag: &str, msg: &str) {
    out.extend_from_slice(format!("{} OK {}\r\n", tag, msg).as_bytes());
}

fn send_error(out: &mut Vec<u8>, tag: &str, kind: &str, msg: &str) {
    out.extend_from_slice(format!("{} {} {}\r\n", tag, kind, msg).as_bytes());
}

fn untagged(out: &mut Vec<u8>, text: &str) {
    out.extend_from_slice(format!("* {}\r\n", text).as_bytes());
}

/// Appends the output of a finished command. A command that panicked
/// loses its partial output and answers BAD.
fn finish_command(tag: &str, outcome: Result<Result<()>>, written: Vec<u8>, out: &mut Vec<u8>) {
    match outcome {
        Ok(result) => {
            out.extend_from_slice(&written);
            if let Err(err) = result {
                warn!(tag, error = %err, "Command failed");
                send_error(out, tag, "NO", &err.to_string());
            }
        }
        Err(err) => {
            error!(tag, error = %err, "Command aborted");
            send_error(out, tag, "BAD", "Internal server error");
        }
    }
}

/// LIST wildcard match: `*` spans anything, `%` anything but the hierarchy
/// delimiter.
fn list_matches(name: &[u8], pattern: &[u8]) -> bool {
    match pattern.split_first() {
        None => name.is_empty(),
        Some((b'*', rest)) => (0..=name.len()).any(|i| list_matches(&name[i..], rest)),
        Some((b'%', rest)) => {
            let limit = name
                .iter()
                .position(|&c| c == b'/')
                .unwrap_or(name.len());
            (0..=limit).any(|i| list_matches(&name[i..], rest))
        }
        Some((&c, rest)) => {
            match name.split_first() {
                Some((&n, name_rest)) => n.eq_ignore_ascii_case(&c) && list_matches(name_rest, rest),
                None => false,
            }
        }
    }
}

fn mailbox_matches(name: &str, reference: &str, pattern: &str) -> bool {
    let full = format!("{}{}", reference, pattern);
    list_matches(name.as_bytes(), full.as_bytes())
}

fn parse_internal_date(value: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_str(value.trim(), "%d-%b-%Y %H:%M:%S %z").map_err(|e|
        anyhow!("invalid date {}: {}", value, e)
    )?;
    Ok(parsed.with_timezone(&Utc))
}

pub struct ImapHandler {
    runtime: Arc<Runtime>,
    session: Arc<Mutex<ImapSession>>,
}

impl ImapHandler {
    pub fn new(runtime: Arc<Runtime>, session: Arc<Mutex<ImapSession>>) -> Self {
        Self { runtime, session }
    }

    pub async fn handle_connection<T>(&self, stream: T) -> Result<()>
        where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);
        let mut pushes = Pushes::new();

        self.send_greeting(&mut writer).await?;

        let mut buf = Vec::new();
        loop {
            tokio::select! {
                read = reader.read_until(b'\n', &mut buf) => {
                    if read? == 0 {
                        debug!("Client disconnected");
                        break;
                    }
                }
                update = next_update(&mut pushes.registration) => {
                    pushes.queue(update);
                    continue;
                }
            }

            let mut line = std::mem::take(&mut buf);
            if !self.read_literals(&mut line, &mut reader, &mut writer).await? {
                break;
            }
            let line = trim_line(line);
            if line.is_empty() {
                continue;
            }

            let (tag, command) = match parse_command_line(&line) {
                Ok(parsed) => parsed,
                Err(tag) => {
                    let tag = tag.unwrap_or_else(|| "*".to_string());
                    warn!(tag = %tag, line = %String::from_utf8_lossy(&line), "Command parse error");
                    writer.write_all(format!("{} BAD Command parse error\r\n", tag).as_bytes()).await?;
                    writer.flush().await?;
                    continue;
                }
            };

            if command == ImapCommand::Idle {
                if !self.handle_idle(&tag, &mut reader, &mut writer, &mut pushes).await? {
                    break;
                }
                continue;
            }

            self.execute(&tag, command, &mut writer, &mut pushes).await?;

            if self.session.lock().await.state == ImapState::Logout {
                info!("Logout requested, closing connection");
                break;
            }
        }

        Ok(())
    }

    /// Completes `line` with the literals it announces. Returns false when
    /// the connection has to be closed.
    async fn read_literals<R>(
        &self,
        line: &mut Vec<u8>,
        reader: &mut R,
        writer: &mut BufWriter<impl AsyncWriteExt + Unpin>
    ) -> Result<bool>
        where R: AsyncBufRead + Unpin
    {
        while let Some((size, synchronizing)) = literal_suffix(line) {
            if size > MAX_LITERAL_SIZE {
                warn!(size, "Literal too large");
                writer.write_all(b"* BYE Literal too large\r\n").await?;
                writer.flush().await?;
                return Ok(false);
            }
            if synchronizing {
                writer.write_all(b"+ Ready for literal data\r\n").await?;
                writer.flush().await?;
            }

            let start = line.len();
            line.resize(start + size, 0);
            reader.read_exact(&mut line[start..]).await?;
            if reader.read_until(b'\n', line).await? == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Runs one command while writing the pushes that arrive meanwhile.
    async fn execute(
        &self,
        tag: &str,
        command: ImapCommand,
        writer: &mut BufWriter<impl AsyncWriteExt + Unpin>,
        pushes: &mut Pushes
    ) -> Result<()> {
        pushes.flush(writer).await?;
        if matches!(command, ImapCommand::Close | ImapCommand::Unselect) {
            pushes.select(None);
        }

        let hold_expunges = command.holds_expunges();
        let mut out = Vec::new();
        {
            let run = self.process_command(tag, command, &mut out);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    _ = &mut run => {
                        break;
                    }
                    update = next_update(&mut pushes.registration) => {
                        pushes.deliver(update, hold_expunges, writer).await?;
                    }
                }
            }
        }

        writer.write_all(&out).await?;
        writer.flush().await?;
        self.sync_pushes(pushes).await;
        Ok(())
    }

    /// Follows login, logout and selection changes of the session.
    async fn sync_pushes(&self, pushes: &mut Pushes) {
        let (user, selected) = {
            let session = self.session.lock().await;
            (session.user.clone(), session.selected_name())
        };
        let registered = pushes.registration.is_some();
        match user {
            Some(user) if !registered => {
                pushes.registration = Some(self.runtime.backend.register(user.email()));
                pushes.selected = None;
            }
            None if registered => {
                pushes.registration = None;
            }
            _ => {}
        }
        pushes.select(selected);
    }

    async fn send_greeting(&self, writer: &mut BufWriter<impl AsyncWriteExt + Unpin>) -> Result<()> {
        let hostname = self.runtime.config.get_value("imap", "hostname").unwrap_or("localhost");
        let greeting = format!("* OK [CAPABILITY {}] {} IMAP server ready\r\n", CAPABILITIES, hostname);
        writer.write_all(greeting.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn capabilities(&self) -> String {
        match self.user().await {
            Some(user) => format!("{} APPENDLIMIT={}", CAPABILITIES, user.append_limit().await),
            None => CAPABILITIES.to_string(),
        }
    }

    async fn user(&self) -> Option<Arc<User>> {
        self.session.lock().await.user.clone()
    }

    async fn require_user(&self) -> Result<Arc<User>> {
        self.user().await.ok_or_else(|| anyhow!("Authentication required"))
    }

    /// The selected mailbox and whether it was opened read-only.
    async fn require_selected(&self) -> Result<(Arc<Mailbox>, bool)> {
        let session = self.session.lock().await;
        match &session.selected {
            Some(mailbox) => Ok((mailbox.clone(), session.read_only)),
            None => Err(MailboxError::NoSelectedMailbox.into()),
        }
    }

    async fn require_writable(&self) -> Result<Arc<Mailbox>> {
        let (mailbox, read_only) = self.require_selected().await?;
        if read_only {
            bail!("Mailbox is read-only");
        }
        Ok(mailbox)
    }

    async fn process_command(&self, tag: &str, command: ImapCommand, out: &mut Vec<u8>) {
        debug!(tag, ?command, "IMAP command received");

        let mut written = Vec::new();
        let run = self.dispatch_command(tag, command, &mut written);
        let outcome = panic::recover("IMAP command", async { Ok(run.await) }).await;
        finish_command(tag, outcome, written, out);
    }

    async fn dispatch_command(&self, tag: &str, command: ImapCommand, out: &mut Vec<u8>) -> Result<()> {
        match command {
            ImapCommand::Capability => self.handle_capability(tag, out).await,
            ImapCommand::Noop => {
                send_ok(out, tag, "NOOP completed");
                Ok(())
            }
            ImapCommand::Check => {
                self.require_selected().await.map(|_| send_ok(out, tag, "CHECK completed"))
            }
            ImapCommand::Logout => self.handle_logout(tag, out).await,
            ImapCommand::StartTls => {
                send_error(out, tag, "NO", "STARTTLS is not supported, connect with TLS instead");
                Ok(())
            }
            ImapCommand::Id { params } => self.handle_id(tag, params, out),
            ImapCommand::Login { username, password } => self.handle_login(tag, &username, &password, out).await,
            ImapCommand::Select { mailbox } => self.handle_select(tag, &mailbox, false, out).await,
            ImapCommand::Examine { mailbox } => self.handle_select(tag, &mailbox, true, out).await,
            ImapCommand::Create { mailbox } => self.handle_create(tag, &mailbox, out).await,
            ImapCommand::Delete { mailbox } => self.handle_delete(tag, &mailbox, out).await,
            ImapCommand::Rename { from, to } => self.handle_rename(tag, &from, &to, out).await,
            ImapCommand::List { reference, pattern } => self.handle_list(tag, &reference, &pattern, false, out).await,
            ImapCommand::Lsub { reference, pattern } => self.handle_list(tag, &reference, &pattern, true, out).await,
            ImapCommand::Subscribe { mailbox } => self.handle_subscribe(tag, &mailbox, true, out).await,
            ImapCommand::Unsubscribe { mailbox } => self.handle_subscribe(tag, &mailbox, false, out).await,
            ImapCommand::Status { mailbox, items } => self.handle_status(tag, &mailbox, &items, out).await,
            ImapCommand::Append { mailbox, flags, date_time, message } => {
                self.handle_append(tag, &mailbox, &flags, date_time.as_deref(), &message, out).await
            }
            ImapCommand::GetQuota { root } => self.handle_get_quota(tag, &root, out).await,
            ImapCommand::GetQuotaRoot { mailbox } => self.handle_get_quota_root(tag, &mailbox, out).await,
            ImapCommand::Close => self.handle_close(tag, true, out).await,
            ImapCommand::Unselect => self.handle_close(tag, false, out).await,
            ImapCommand::Expunge => self.handle_expunge(tag, None, out).await,
            ImapCommand::Search { criteria, .. } => self.handle_search(tag, &criteria, false, out).await,
            ImapCommand::Fetch { sequence_set, items } => {
                self.handle_fetch(tag, &sequence_set, items, false, out).await
            }
            ImapCommand::Store { sequence_set, operation, silent, flags } => {
                self.handle_store(tag, &sequence_set, operation, silent, &flags, false, out).await
            }
            ImapCommand::Copy { sequence_set, mailbox } => {
                self.handle_copy(tag, &sequence_set, &mailbox, false, false, out).await
            }
            ImapCommand::Move { sequence_set, mailbox } => {
                self.handle_copy(tag, &sequence_set, &mailbox, true, false, out).await
            }
            ImapCommand::Uid { command } =>
                match *command {
                    UidCommand::Fetch { sequence_set, items } => {
                        self.handle_fetch(tag, &sequence_set, items, true, out).await
                    }
                    UidCommand::Search { criteria, .. } => self.handle_search(tag, &criteria, true, out).await,
                    UidCommand::Store { sequence_set, operation, silent, flags } => {
                        self.handle_store(tag, &sequence_set, operation, silent, &flags, true, out).await
                    }
                    UidCommand::Copy { sequence_set, mailbox } => {
                        self.handle_copy(tag, &sequence_set, &mailbox, false, true, out).await
                    }
                    UidCommand::Move { sequence_set, mailbox } => {
                        self.handle_copy(tag, &sequence_set, &mailbox, true, true, out).await
                    }
                    UidCommand::Expunge { sequence_set } => {
                        self.handle_expunge(tag, Some(&sequence_set), out).await
                    }
                }
            // Handled by the connection loop.
            ImapCommand::Idle => Ok(()),
            ImapCommand::Unknown { command } => {
                warn!(command = %command, "Unknown command");
                send_error(out, tag, "BAD", "Unknown command");
                Ok(())
            }
        }
    }

    /** ---------------------------------------------------------------
     * ------------------------- Any state -----------------------------
     * --------------------------------------------------------------- */

    async fn handle_capability(&self, tag: &str, out: &mut Vec<u8>) -> Result<()> {
        untagged(out, &format!("CAPABILITY {}", self.capabilities().await));
        send_ok(out, tag, "CAPABILITY completed");
        Ok(())
    }

    async fn handle_logout(&self, tag: &str, out: &mut Vec<u8>) -> Result<()> {
        let user = self.session.lock().await.logout();
        if let Some(user) = user {
            self.runtime.backend.logout(&user);
        }
        untagged(out, "BYE IMAP server logging out");
        send_ok(out, tag, "LOGOUT completed");
        Ok(())
    }

    fn handle_id(&self, tag: &str, params: Vec<(String, Option<String>)>, out: &mut Vec<u8>) -> Result<()> {
        let field = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .and_then(|(_, v)| v.clone())
        };
        if let Some(name) = field("name") {
            self.runtime.backend.set_client(&name, &field("version").unwrap_or_default());
        }

        untagged(
            out,
            &format!("ID (\"name\" \"lightbridge\" \"version\" {})", quote(env!("CARGO_PKG_VERSION")))
        );
        send_ok(out, tag, "ID completed");
        Ok(())
    }

    /** ---------------------------------------------------------------
     * ---------------------- Not authenticated ------------------------
     * --------------------------------------------------------------- */

    async fn handle_login(&self, tag: &str, username: &str, password: &str, out: &mut Vec<u8>) -> Result<()> {
        if self.session.lock().await.state != ImapState::NotAuthenticated {
            send_error(out, tag, "BAD", "Already authenticated");
            return Ok(());
        }

        match self.runtime.backend.login(username, password).await {
            Ok(user) => {
                let mut session = self.session.lock().await;
                info!(client = %session.client_id, address = %user.email(), tls = session.tls_active, "IMAP login");
                session.login(user);
                drop(session);
                send_ok(out, tag, &format!("[CAPABILITY {}] LOGIN completed", self.capabilities().await));
            }
            Err(err) => {
                send_error(out, tag, "NO", &format!("[AUTHENTICATIONFAILED] {}", err));
            }
        }
        Ok(())
    }

    /** ---------------------------------------------------------------
     * ------------------------ Authenticated --------------------------
     * --------------------------------------------------------------- */

    async fn handle_select(&self, tag: &str, name: &str, read_only: bool, out: &mut Vec<u8>) -> Result<()> {
        let user = self.require_user().await?;
        // A failed SELECT leaves no mailbox selected.
        self.session.lock().await.unselect();

        let mailbox = user.get_mailbox(name).await?;
        let status = mailbox.status().await?;
        let flags = MAILBOX_FLAGS.join(" ");

        untagged(out, &format!("FLAGS ({})", flags));
        untagged(out, &format!("{} EXISTS", status.messages));
        untagged(out, "0 RECENT");
        if status.first_unseen > 0 {
            untagged(out, &format!("OK [UNSEEN {}] First unseen", status.first_unseen));
        }
        untagged(out, &format!("OK [UIDVALIDITY {}] UIDs valid", status.uid_validity));
        untagged(out, &format!("OK [UIDNEXT {}] Predicted next UID", status.uid_next));
        untagged(out, &format!("OK [PERMANENTFLAGS ({})] Permanent flags", flags));

        let (mode, command) = if read_only { ("READ-ONLY", "EXAMINE") } else { ("READ-WRITE", "SELECT") };
        send_ok(out, tag, &format!("[{}] {} completed", mode, command));

        info!(mailbox = %mailbox.name(), exists = status.messages, uid_next = status.uid_next, mode, "Mailbox selected");
        self.session.lock().await.select(mailbox, read_only);
        Ok(())
    }

    async fn handle_create(&self, tag: &str, name: &str, out: &mut Vec<u8>) -> Result<()> {
        self.require_user().await?.create_mailbox(name).await?;
        send_ok(out, tag, "CREATE completed");
        Ok(())
    }

    async fn handle_delete(&self, tag: &str, name: &str, out: &mut Vec<u8>) -> Result<()> {
        self.require_user().await?.delete_mailbox(name).await?;
        send_ok(out, tag, "DELETE completed");
        Ok(())
    }

    async fn handle_rename(&self, tag: &str, from: &str, to: &str, out: &mut Vec<u8>) -> Result<()> {
        self.require_user().await?.rename_mailbox(from, to).await?;
        send_ok(out, tag, "RENAME completed");
        Ok(())
    }

    async fn handle_list(
        &self,
        tag: &str,
        reference: &str,
        pattern: &str,
        subscribed_only: bool,
        out: &mut Vec<u8>
    ) -> Result<()> {
        let user = self.require_user().await?;
        let command = if subscribed_only { "LSUB" } else { "LIST" };

        if pattern.is_empty() {
            untagged(out, &format!("{} (\\Noselect) {} \"\"", command, quote(DELIMITER)));
        } else {
            for mailbox in user.list_mailboxes(subscribed_only).await? {
                if !mailbox_matches(&mailbox.name, reference, pattern) {
                    continue;
                }
                untagged(
                    out,
                    &format!(
                        "{} ({}) {} {}",
                        command,
                        mailbox.attributes.join(" "),
                        quote(DELIMITER),
                        quote(&mailbox.name)
                    )
                );
            }
        }

        send_ok(out, tag, &format!("{} completed", command));
        Ok(())
    }

    async fn handle_subscribe(&self, tag: &str, name: &str, subscribe: bool, out: &mut Vec<u8>) -> Result<()> {
        let mailbox = self.require_user().await?.get_mailbox(name).await?;
        mailbox.set_subscribed(subscribe).await?;
        send_ok(out, tag, if subscribe { "SUBSCRIBE completed" } else { "UNSUBSCRIBE completed" });
        Ok(())
    }

    async fn handle_status(&self, tag: &str, name: &str, items: &[StatusItem], out: &mut Vec<u8>) -> Result<()> {
        let mailbox = self.require_user().await?.get_mailbox(name).await?;
        let status = mailbox.status().await?;

        let values: Vec<String> = items
            .iter()
            .map(|item| {
                let value = match item {
                    StatusItem::Messages => status.messages,
                    StatusItem::Recent => 0,
                    StatusItem::UidNext => status.uid_next,
                    StatusItem::UidValidity => status.uid_validity,
                    StatusItem::Unseen => status.unseen,
                };
                format!("{} {}", item.name(), value)
            })
            .collect();

        untagged(out, &format!("STATUS {} ({})", quote(mailbox.name()), values.join(" ")));
        send_ok(out, tag, "STATUS completed");
        Ok(())
    }

    async fn handle_append(
        &self,
        tag: &str,
        name: &str,
        flags: &[String],
        date_time: Option<&str>,
        message: &[u8],
        out: &mut Vec<u8>
    ) -> Result<()> {
        let user = self.require_user().await?;
        let date = match date_time {
            Some(value) => Some(parse_internal_date(value)?),
            None => None,
        };

        let mailbox = match user.get_mailbox(name).await {
            Ok(mailbox) => mailbox,
            Err(err) => {
                send_error(out, tag, "NO", &format!("[TRYCREATE] {}", err));
                return Ok(());
            }
        };

        let response = mailbox.create_message(flags, date, message).await?;
        send_ok(out, tag, &response);
        Ok(())
    }

    async fn handle_get_quota(&self, tag: &str, root: &str, out: &mut Vec<u8>) -> Result<()> {
        let user = self.require_user().await?;
        if !root.is_empty() {
            bail!("No such quota root: {}", root);
        }
        let (used, max) = user.quota().await?;
        untagged(out, &format!("QUOTA \"\" (STORAGE {} {})", used, max));
        send_ok(out, tag, "GETQUOTA completed");
        Ok(())
    }

    async fn handle_get_quota_root(&self, tag: &str, name: &str, out: &mut Vec<u8>) -> Result<()> {
        let user = self.require_user().await?;
        let mailbox = user.get_mailbox(name).await?;
        let (used, max) = user.quota().await?;
        untagged(out, &format!("QUOTAROOT {} \"\"", quote(mailbox.name())));
        untagged(out, &format!("QUOTA \"\" (STORAGE {} {})", used, max));
        send_ok(out, tag, "GETQUOTAROOT completed");
        Ok(())
    }

    /// Waits for DONE while writing pushes as they come. Returns false when
    /// the client went away.
    async fn handle_idle<R>(
        &self,
        tag: &str,
        reader: &mut R,
        writer: &mut BufWriter<impl AsyncWriteExt + Unpin>,
        pushes: &mut Pushes
    ) -> Result<bool>
        where R: AsyncBufRead + Unpin
    {
        if self.user().await.is_none() {
            writer.write_all(format!("{} NO Authentication required\r\n", tag).as_bytes()).await?;
            writer.flush().await?;
            return Ok(true);
        }

        writer.write_all(b"+ idling\r\n").await?;
        pushes.flush(writer).await?;
        writer.flush().await?;
        debug!(tag, "Idling");

        let mut buf = Vec::new();
        loop {
            tokio::select! {
                read = reader.read_until(b'\n', &mut buf) => {
                    if read? == 0 {
                        return Ok(false);
                    }
                    let line = trim_line(std::mem::take(&mut buf));
                    let response = if line.eq_ignore_ascii_case(b"DONE") {
                        format!("{} OK IDLE terminated\r\n", tag)
                    } else {
                        format!("{} BAD Expected DONE\r\n", tag)
                    };
                    writer.write_all(response.as_bytes()).await?;
                    writer.flush().await?;
                    return Ok(true);
                }
                update = next_update(&mut pushes.registration) => {
                    pushes.deliver(update, false, writer).await?;
                }
            }
        }
    }

    /** ---------------------------------------------------------------
     * --------------------------- Selected ----------------------------
     * --------------------------------------------------------------- */

    async fn handle_close(&self, tag: &str, expunge: bool, out: &mut Vec<u8>) -> Result<()> {
        let (mailbox, read_only) = self.require_selected().await?;
        self.session.lock().await.unselect();

        if expunge && !read_only {
            if let Err(err) = mailbox.expunge(None).await {
                error!(mailbox = %mailbox.name(), error = %err, "Expunge on CLOSE failed");
            }
        }
        send_ok(out, tag, if expunge { "CLOSE completed" } else { "UNSELECT completed" });
        Ok(())
    }

    async fn handle_expunge(&self, tag: &str, uids: Option<&SequenceSet>, out: &mut Vec<u8>) -> Result<()> {
        let mailbox = self.require_writable().await?;
        mailbox.expunge(uids).await?;
        send_ok(out, tag, "EXPUNGE completed");
        Ok(())
    }

    async fn handle_search(
        &self,
        tag: &str,
        criteria: &[SearchCriteria],
        uid: bool,
        out: &mut Vec<u8>
    ) -> Result<()> {
        let (mailbox, _) = self.require_selected().await?;
        mailbox.search_messages(uid, criteria, out).await?;
        send_ok(out, tag, "SEARCH completed");
        Ok(())
    }

    async fn handle_fetch(
        &self,
        tag: &str,
        set: &SequenceSet,
        mut items: Vec<FetchItem>,
        uid: bool,
        out: &mut Vec<u8>
    ) -> Result<()> {
        let (mailbox, read_only) = self.require_selected().await?;
        if read_only {
            for item in items.iter_mut() {
                if let FetchItem::BodySection { peek, .. } = item {
                    *peek = true;
                }
            }
        }

        // Untagged data goes out only when the whole fetch succeeded.
        let mut data = Vec::new();
        mailbox.list_messages(uid, set, &items, &mut data).await?;
        out.extend_from_slice(&data);
        send_ok(out, tag, "FETCH completed");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_store(
        &self,
        tag: &str,
        set: &SequenceSet,
        operation: StoreOperation,
        silent: bool,
        flags: &[String],
        uid: bool,
        out: &mut Vec<u8>
    ) -> Result<()> {
        let mailbox = self.require_writable().await?;
        let mut data = Vec::new();
        mailbox.update_messages_flags(uid, set, operation, silent, flags, &mut data).await?;
        out.extend_from_slice(&data);
        send_ok(out, tag, "STORE completed");
        Ok(())
    }

    async fn handle_copy(
        &self,
        tag: &str,
        set: &SequenceSet,
        target: &str,
        moving: bool,
        uid: bool,
        out: &mut Vec<u8>
    ) -> Result<()> {
        let mailbox = if moving { self.require_writable().await? } else { self.require_selected().await?.0 };

        let uids = match mailbox.copy_messages(uid, set, target, moving).await {
            Ok(uids) => uids,
            Err(err) => {
                let missing = matches!(err.downcast_ref::<MailboxError>(), Some(MailboxError::NoSuchMailbox(_)));
                let text = if missing { format!("[TRYCREATE] {}", err) } else { err.to_string() };
                send_error(out, tag, "NO", &text);
                return Ok(());
            }
        };

        if moving {
            if let Some(code) = uids.code() {
                untagged(out, &format!("OK {} Moved", code));
            }
            send_ok(out, tag, "MOVE completed");
        } else {
            send_ok(out, tag, &uids.response());
        }
        Ok(())
    }
}
