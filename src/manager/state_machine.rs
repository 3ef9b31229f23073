//! Pure transition table for the connection lifecycle
//!
//! The manager feeds every lifecycle input through [`transition`] while
//! holding its lock, then executes the returned actions in order. Nothing
//! here performs I/O, so the whole recovery protocol can be tested without a
//! session.
//!
//! The recovery branch: a disconnect marks `disconnect_pending`. The next
//! successful connect then notifies the caller, tears the session down and
//! builds a brand-new one. The flag is cleared in that same transition, so
//! the replacement session's own connect never triggers another rebuild.

use crate::transport::ResultCode;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No session, or the session was stopped by `disconnect()`
    #[default]
    Disconnected,
    /// A session is starting, reconnecting or being rebuilt
    Connecting,
    /// The live session has a broker connection
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Lifecycle inputs, from the caller or the live session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    ConnectRequested,
    DisconnectRequested,
    SessionConnected(ResultCode),
    SessionDisconnected(ResultCode),
}

/// Side effects the manager performs, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Issue a fresh token and construct a new session
    BuildSession,
    /// Start the session built by the preceding `BuildSession`
    StartSession,
    /// Stop and discard the current session
    StopSession,
    /// Log a refused or failed connect
    ReportConnectFailure(ResultCode),
    /// Log an abnormal termination
    ReportAbnormalDisconnect(ResultCode),
    NotifyConnected,
    NotifyDisconnected,
}

/// The lifecycle facts a transition depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub state: ConnectionState,
    pub disconnect_pending: bool,
    pub has_session: bool,
}

/// Result of applying one input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: ConnectionState,
    pub disconnect_pending: bool,
    pub actions: Vec<Action>,
}

impl Transition {
    fn unchanged(snapshot: Snapshot) -> Self {
        Self {
            state: snapshot.state,
            disconnect_pending: snapshot.disconnect_pending,
            actions: Vec::new(),
        }
    }

    /// True if executing this transition replaces the session
    pub fn rebuilds(&self) -> bool {
        self.actions.contains(&Action::StopSession) && self.actions.contains(&Action::BuildSession)
    }
}

/// Compute the next state, flag and actions for an input
pub fn transition(snapshot: Snapshot, input: Input) -> Transition {
    match input {
        Input::ConnectRequested if snapshot.has_session => Transition::unchanged(snapshot),
        Input::ConnectRequested => Transition {
            state: ConnectionState::Connecting,
            disconnect_pending: snapshot.disconnect_pending,
            actions: vec![Action::BuildSession, Action::StartSession],
        },

        // disconnect() never clears the pending flag
        Input::DisconnectRequested => Transition {
            state: ConnectionState::Disconnected,
            disconnect_pending: snapshot.disconnect_pending,
            actions: if snapshot.has_session {
                vec![Action::StopSession]
            } else {
                Vec::new()
            },
        },

        Input::SessionConnected(code) if !code.is_success() => Transition {
            actions: vec![Action::ReportConnectFailure(code)],
            ..Transition::unchanged(snapshot)
        },
        Input::SessionConnected(_) if snapshot.disconnect_pending => Transition {
            state: ConnectionState::Connecting,
            disconnect_pending: false,
            actions: vec![
                Action::NotifyConnected,
                Action::StopSession,
                Action::BuildSession,
                Action::StartSession,
            ],
        },
        Input::SessionConnected(_) => Transition {
            state: ConnectionState::Connected,
            disconnect_pending: false,
            actions: vec![Action::NotifyConnected],
        },

        Input::SessionDisconnected(code) => {
            let mut actions = Vec::with_capacity(2);
            if !code.is_success() {
                actions.push(Action::ReportAbnormalDisconnect(code));
            }
            actions.push(Action::NotifyDisconnected);
            Transition {
                // The session's transport keeps reconnecting on its own
                state: ConnectionState::Connecting,
                disconnect_pending: true,
                actions,
            }
        }
    }
}
