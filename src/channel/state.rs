/// Progress of the close handshake.
///
/// Each side's close frame is recorded once: `Open` moves to `CloseSent` or `CloseReceived`,
/// and the other frame moves it to `Closed`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CloseState {
    #[default]
    Open,
    CloseSent,
    CloseReceived,
    Closed,
}

/// An event that advances the handshake.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum CloseEvent {
    /// A close frame was queued by this end.
    Send,
    /// The peer's close frame was decoded.
    Receive,
}

impl CloseState {
    /// Returns the next state, or `None` if the event already happened.
    pub(crate) fn transition(self, event: CloseEvent) -> Option<CloseState> {
        match (self, event) {
            (CloseState::Open, CloseEvent::Send) => Some(CloseState::CloseSent),
            (CloseState::Open, CloseEvent::Receive) => Some(CloseState::CloseReceived),
            (CloseState::CloseSent, CloseEvent::Receive) => Some(CloseState::Closed),
            (CloseState::CloseReceived, CloseEvent::Send) => Some(CloseState::Closed),
            _ => None,
        }
    }

    pub fn is_close_sent(self) -> bool {
        matches!(self, CloseState::CloseSent | CloseState::Closed)
    }

    pub fn is_close_received(self) -> bool {
        matches!(self, CloseState::CloseReceived | CloseState::Closed)
    }
}

/// Close handshake bookkeeping of a connection.
#[derive(Debug, Default)]
pub(crate) struct CloseHandshake {
    pub(crate) state: CloseState,
    /// The peer's close frame arrived before ours was queued.
    pub(crate) peer_initiated: bool,
    pub(crate) code: Option<u16>,
    pub(crate) reason: Option<String>,
}

impl CloseHandshake {
    /// Records a locally queued close frame. Returns `false` if one was already queued.
    pub(crate) fn on_send(&mut self) -> bool {
        match self.state.transition(CloseEvent::Send) {
            Some(next) => {
                self.state = next;
                true
            }
            None => false,
        }
    }

    /// Records the peer's close frame. Returns `false` if one was already received.
    pub(crate) fn on_receive(&mut self, code: u16, reason: String) -> bool {
        let Some(next) = self.state.transition(CloseEvent::Receive) else {
            return false;
        };
        if self.state == CloseState::Open {
            self.peer_initiated = true;
        }
        self.state = next;
        self.code = Some(code);
        self.reason = Some(reason);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_side_once() {
        let mut hs = CloseHandshake::default();
        assert!(hs.on_send());
        assert!(!hs.on_send());
        assert_eq!(hs.state, CloseState::CloseSent);

        assert!(hs.on_receive(1000, String::new()));
        assert!(!hs.on_receive(1000, String::new()));
        assert_eq!(hs.state, CloseState::Closed);
        assert!(!hs.peer_initiated);
    }

    #[test]
    fn test_peer_initiated() {
        let mut hs = CloseHandshake::default();
        assert!(hs.on_receive(1001, "bye".into()));
        assert!(hs.peer_initiated);
        assert!(hs.state.is_close_received());
        assert!(!hs.state.is_close_sent());

        assert!(hs.on_send());
        assert_eq!(hs.state, CloseState::Closed);
        assert_eq!(hs.code, Some(1001));
        assert_eq!(hs.reason.as_deref(), Some("bye"));
    }

    #[test]
    fn test_transition_table() {
        use CloseEvent::*;
        use CloseState::*;

        assert_eq!(Open.transition(Send), Some(CloseSent));
        assert_eq!(Open.transition(Receive), Some(CloseReceived));
        assert_eq!(CloseSent.transition(Send), None);
        assert_eq!(CloseReceived.transition(Receive), None);
        assert_eq!(Closed.transition(Send), None);
        assert_eq!(Closed.transition(Receive), None);
    }
}
