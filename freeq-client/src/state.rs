//! Our own identity, and the seam to an external state tracker.

use serde::Deserialize;

/// Who we are on this connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Identity {
    pub nick: String,
    pub ident: String,
    /// Real name sent in USER.
    pub name: String,
    /// Host as seen by the server; empty until RPL_WELCOME.
    pub host: String,
}

/// A long-lived user/channel state tracker.
///
/// When one is attached to a connection it owns our identity: the
/// connection's own copy is refreshed from [`StateTracker::me`] and never
/// written directly. Implementations serialize their own mutations.
pub trait StateTracker: Send + Sync {
    fn me(&self) -> Identity;

    /// Record ident/host/name for `nick`.
    fn nick_info(&self, nick: &str, ident: &str, host: &str, name: &str);

    /// Rename `old` to `new`, returning our identity afterwards.
    fn re_nick(&self, old: &str, new: &str) -> Identity;
}
