//! Session-Key Registry.
//!
//! A true global: a process-wide session-key/username mapping, mutated only
//! from the control loop's own thread, so no internal locking is needed.

use std::collections::HashMap;

/// Session-key ↔ username mapping with displace-on-collision semantics.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<u32, String>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> SessionRegistry {
        SessionRegistry::default()
    }

    /// `SET_SESSION_KEY`: inserts `(key, username)`, first displacing any
    /// existing entry for the same username.
    ///
    /// Returns the displaced key if a prior login existed — the caller
    /// broadcasts `NEW_SESSION_ALERT(key, username)` for it. The
    /// authoritative login event has already happened upstream; master's job
    /// is only to announce and invalidate.
    pub fn set(&mut self, key: u32, username: &str) -> Option<u32> {
        let displaced = self.sessions.iter().find(|(_, u)| u.as_str() == username).map(|(&k, _)| k);

        if let Some(displaced_key) = displaced {
            self.sessions.remove(&displaced_key);
        }

        self.sessions.insert(key, username.to_owned());
        displaced
    }

    /// `REQUEST_SESSION_KEY`: the first session key registered for `username`,
    /// if any.
    pub fn query(&self, username: &str) -> Option<u32> {
        self.sessions.iter().find(|(_, u)| u.as_str() == username).map(|(&k, _)| k)
    }

    /// Number of registered sessions, for diagnostics.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry has no entries.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_with_no_prior_session_does_not_displace() {
        let mut registry = SessionRegistry::new();
        assert_eq!(registry.set(100, "alice"), None);
        assert_eq!(registry.query("alice"), Some(100));
    }

    #[test]
    fn second_login_displaces_first_and_exactly_one_entry_remains() {
        let mut registry = SessionRegistry::new();
        registry.set(100, "alice");

        let displaced = registry.set(200, "alice");

        assert_eq!(displaced, Some(100));
        assert_eq!(registry.query("alice"), Some(200));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn distinct_usernames_do_not_interfere() {
        let mut registry = SessionRegistry::new();
        registry.set(100, "alice");
        registry.set(101, "bob");

        assert_eq!(registry.query("alice"), Some(100));
        assert_eq!(registry.query("bob"), Some(101));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn query_for_unknown_username_returns_none() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.query("nobody"), None);
    }
}
