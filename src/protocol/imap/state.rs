use std::sync::Arc;

use super::mailbox::Mailbox;
use super::user::User;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImapState {
    NotAuthenticated,
    Authenticated,
    Selected,
    Logout,
}

/// Per-connection state.
pub struct ImapSession {
    pub client_id: String,
    pub state: ImapState,
    pub tls_active: bool,
    pub user: Option<Arc<User>>,
    pub selected: Option<Arc<Mailbox>>,
    pub read_only: bool,
}

impl ImapSession {
    pub fn new(client_id: String) -> Self {
        Self {
            client_id,
            state: ImapState::NotAuthenticated,
            tls_active: false,
            user: None,
            selected: None,
            read_only: false,
        }
    }

    pub fn login(&mut self, user: Arc<User>) {
        self.user = Some(user);
        self.state = ImapState::Authenticated;
    }

    pub fn select(&mut self, mailbox: Arc<Mailbox>, read_only: bool) {
        self.selected = Some(mailbox);
        self.read_only = read_only;
        self.state = ImapState::Selected;
    }

    pub fn unselect(&mut self) {
        self.selected = None;
        self.read_only = false;
        if self.state == ImapState::Selected {
            self.state = ImapState::Authenticated;
        }
    }

    pub fn logout(&mut self) -> Option<Arc<User>> {
        self.selected = None;
        self.state = ImapState::Logout;
        self.user.take()
    }

    pub fn selected_name(&self) -> Option<String> {
        self.selected.as_ref().map(|m| m.name().to_string())
    }
}
