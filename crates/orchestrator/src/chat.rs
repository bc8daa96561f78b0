//! Chat relay registration: a first-class, independently testable piece of
//! state rather than a branch buried in the `SERVER_INFO` handler.

use crate::instance::SysAddr;

/// The single transport address of the currently-registered chat relay, if
/// any.
#[derive(Default)]
pub struct ChatPeer {
    addr: Option<SysAddr>,
}

impl ChatPeer {
    /// No chat relay registered yet.
    pub fn new() -> ChatPeer {
        ChatPeer::default()
    }

    /// The currently registered chat relay, if any.
    pub fn addr(&self) -> Option<SysAddr> {
        self.addr
    }

    /// `SERVER_INFO` from a peer whose `serverType` is `Chat`: remembers it.
    pub fn register(&mut self, addr: SysAddr) {
        self.addr = Some(addr);
    }

    /// Handles a transport disconnect. Returns `true` if the lost peer was
    /// the remembered chat relay and a respawn should be attempted, unless
    /// universe shutdown is already in progress. Master has no command line
    /// to construct for a chat relay, so the caller can only log and wait
    /// for the relay to reconnect with a fresh `SERVER_INFO`; this method
    /// still clears the stale address so a later registration isn't mistaken
    /// for the same connection.
    pub fn handle_disconnect(&mut self, lost: SysAddr, universe_shutdown: bool) -> bool {
        if self.addr != Some(lost) {
            return false;
        }

        self.addr = None;
        !universe_shutdown
    }
}
