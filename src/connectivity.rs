//! Connectivity tracking.
//!
//! Mirrors the platform's online/offline signal. The engine consults
//! this before every direct remote write: while offline no remote call
//! is attempted at all, so the underlying client never hangs in a retry
//! loop — everything routes through the outbox instead.

/// Network connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Online,
    Offline,
}

/// State change produced by feeding a new platform signal in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Offline → Online: re-enable the remote network layer and flush
    /// the outbox
    CameOnline,
    /// Online → Offline: suspend the remote network layer
    WentOffline,
}

/// Tracks the platform online/offline signal and detects transitions.
#[derive(Debug, Clone, Copy)]
pub struct Connectivity {
    state: NetworkState,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Connectivity {
            state: if online {
                NetworkState::Online
            } else {
                NetworkState::Offline
            },
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == NetworkState::Online
    }

    /// Feed in the platform signal; returns the transition if the state
    /// actually changed.
    pub fn set_online(&mut self, online: bool) -> Option<Transition> {
        let next = if online {
            NetworkState::Online
        } else {
            NetworkState::Offline
        };
        if next == self.state {
            return None;
        }
        self.state = next;
        Some(match next {
            NetworkState::Online => Transition::CameOnline,
            NetworkState::Offline => Transition::WentOffline,
        })
    }
}
