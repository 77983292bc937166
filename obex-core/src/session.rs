//! Client session state: lifecycle, negotiated MTU, connection id.

use crate::error::ObexError;
use crate::protocol::DEFAULT_MTU;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Closed,
    Connecting,
    Connected,
    Operating,
    Disconnecting,
}

impl ClientState {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientState::Closed => "closed",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Operating => "operating",
            ClientState::Disconnecting => "disconnecting",
        }
    }
}

/// Per-session bookkeeping. Transitions that do not fit the lifecycle
/// `Closed → Connecting → Connected ⇄ Operating, Connected → Disconnecting → Closed`
/// fail with `InvalidState`.
#[derive(Debug, Clone)]
pub struct SessionState {
    state: ClientState,
    local_mtu: u16,
    mtu: u16,
    connection_id: Option<u32>,
    authorized: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(DEFAULT_MTU)
    }
}

impl SessionState {
    pub fn new(local_mtu: u16) -> Self {
        Self {
            state: ClientState::Closed,
            local_mtu,
            mtu: local_mtu,
            connection_id: None,
            authorized: false,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Packet size offered at CONNECT.
    pub fn local_mtu(&self) -> u16 {
        self.local_mtu
    }

    /// Negotiated packet size.
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn connection_id(&self) -> Option<u32> {
        self.connection_id
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    pub fn set_authorized(&mut self, authorized: bool) {
        self.authorized = authorized;
    }

    fn invalid(&self, action: &'static str) -> ObexError {
        ObexError::InvalidState {
            from: self.state.as_str(),
            action,
        }
    }

    pub fn begin_connect(&mut self) -> Result<(), ObexError> {
        match self.state {
            ClientState::Closed | ClientState::Connected => {
                self.state = ClientState::Connecting;
                Ok(())
            }
            _ => Err(self.invalid("connect")),
        }
    }

    /// CONNECT accepted. A connection id from the reply replaces any previous one.
    pub fn connected(&mut self, mtu: u16, connection_id: Option<u32>) -> Result<(), ObexError> {
        if self.state != ClientState::Connecting {
            return Err(self.invalid("complete connect"));
        }
        self.mtu = mtu;
        if connection_id.is_some() {
            self.connection_id = connection_id;
        }
        self.state = ClientState::Connected;
        Ok(())
    }

    pub fn require_connected(&self, action: &'static str) -> Result<(), ObexError> {
        if self.state == ClientState::Connected {
            Ok(())
        } else {
            Err(self.invalid(action))
        }
    }

    pub fn begin_operation(&mut self) -> Result<(), ObexError> {
        self.require_connected("start an operation")?;
        self.state = ClientState::Operating;
        Ok(())
    }

    /// No-op unless an operation is running.
    pub fn end_operation(&mut self) {
        if self.state == ClientState::Operating {
            self.state = ClientState::Connected;
        }
    }

    pub fn begin_disconnect(&mut self) -> Result<(), ObexError> {
        self.require_connected("disconnect")?;
        self.state = ClientState::Disconnecting;
        Ok(())
    }

    /// Back to a fresh, unconnected session.
    pub fn close(&mut self) {
        self.state = ClientState::Closed;
        self.mtu = self.local_mtu;
        self.connection_id = None;
        self.authorized = false;
    }
}
