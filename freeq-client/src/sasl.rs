//! SASL authentication during capability negotiation.
//!
//! Arming creates a single-use result channel and registers the handlers
//! that drive the exchange:
//!
//! ```text
//! S: CAP * ACK :sasl
//! C: AUTHENTICATE PLAIN
//! S: AUTHENTICATE +
//! C: AUTHENTICATE <base64 response>
//! S: 903 nick :SASL authentication successful
//! ```
//!
//! Exactly one outcome is delivered: success on 903, failure on 902/904/905/906,
//! on `CAP NAK :sasl`, when the server's listing lacks `sasl`, or when the
//! mechanism can't answer a challenge. The waiting side enforces the timeout.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::oneshot;

use crate::cap::{self, CapLine};
use crate::conn::Conn;
use crate::error::HandshakeError;
use crate::handler::HandlerGuard;
use crate::irc::{self, Line};

/// Capability name that carries SASL.
pub const SASL_CAP: &str = "sasl";

/// AUTHENTICATE payloads are split into chunks of this many bytes.
const CHUNK_LEN: usize = 400;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SaslError {
    /// The server reported failure; carries its text.
    #[error("{0}")]
    Server(String),
    #[error("server does not offer sasl")]
    NotOffered,
    #[error("server rejected the sasl capability")]
    Rejected,
    #[error("malformed challenge from server")]
    BadChallenge,
    #[error("mechanism error: {0}")]
    Mechanism(String),
}

/// A SASL mechanism.
pub trait Authenticator: Send + Sync {
    /// Name sent in `AUTHENTICATE <MECHANISM>`.
    fn mechanism(&self) -> &str;

    /// Answer a (decoded) server challenge. The first challenge is empty.
    fn respond(&self, challenge: &[u8]) -> Result<Vec<u8>, SaslError>;
}

/// Credentials for the PLAIN mechanism.
#[derive(Clone, Deserialize)]
pub struct SaslCredentials {
    pub user: String,
    pub password: String,
    /// Identity to act as; defaults to `user`.
    #[serde(default)]
    pub authzid: Option<String>,
}

impl fmt::Debug for SaslCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("authzid", &self.authzid)
            .finish()
    }
}

/// SASL PLAIN (RFC 4616).
pub struct Plain {
    creds: SaslCredentials,
}

impl Plain {
    pub fn new(creds: SaslCredentials) -> Self {
        Self { creds }
    }
}

impl Authenticator for Plain {
    fn mechanism(&self) -> &str {
        "PLAIN"
    }

    fn respond(&self, _challenge: &[u8]) -> Result<Vec<u8>, SaslError> {
        let authzid = self.creds.authzid.as_deref().unwrap_or(&self.creds.user);
        Ok(format!("{authzid}\0{}\0{}", self.creds.user, self.creds.password).into_bytes())
    }
}

type Outcome = Result<(), SaslError>;

/// Delivers the outcome at most once, whichever handler gets there first.
#[derive(Clone)]
struct ResultSlot(Arc<Mutex<Option<oneshot::Sender<Outcome>>>>);

impl ResultSlot {
    fn deliver(&self, outcome: Outcome) {
        if let Some(tx) = self.0.lock().take() {
            match outcome {
                Ok(()) => tracing::info!("SASL authentication succeeded"),
                Err(ref e) => tracing::warn!(error = %e, "SASL authentication failed"),
            }
            let _ = tx.send(outcome);
        }
    }
}

/// An armed authentication exchange. Its handlers stay registered while
/// this value lives.
pub(crate) struct PendingAuth {
    result: oneshot::Receiver<Outcome>,
    _handlers: Vec<HandlerGuard>,
}

impl PendingAuth {
    /// Wait for the outcome for at most `limit`.
    pub(crate) async fn wait(self, limit: Duration) -> Result<(), HandshakeError> {
        match tokio::time::timeout(limit, self.result).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(HandshakeError::AuthFailed(e)),
            Ok(Err(_)) => Err(HandshakeError::Disconnected),
            Err(_) => Err(HandshakeError::AuthTimeout),
        }
    }
}

/// Register the SASL handlers on `conn` and return the pending outcome.
pub(crate) fn arm(conn: &Conn, auth: Arc<dyn Authenticator>) -> PendingAuth {
    let (tx, result) = oneshot::channel();
    let slot = ResultSlot(Arc::new(Mutex::new(Some(tx))));
    let mut handlers = Vec::with_capacity(8);

    handlers.push(conn.handle_scoped(irc::CAP, {
        let slot = slot.clone();
        let auth = Arc::clone(&auth);
        let offered = Mutex::new(false);
        move |conn: &Conn, line: &Line| match CapLine::parse(line) {
            Some(CapLine::Ls { caps, more }) => {
                let mut offered = offered.lock();
                *offered |= caps.iter().any(|c| cap::cap_name(c) == SASL_CAP);
                if !more && !*offered {
                    slot.deliver(Err(SaslError::NotOffered));
                }
            }
            Some(CapLine::Ack(caps)) if caps.contains(&SASL_CAP) => {
                conn.send(irc::AUTHENTICATE, vec![auth.mechanism()]);
            }
            Some(CapLine::Nak(caps)) if caps.contains(&SASL_CAP) => {
                slot.deliver(Err(SaslError::Rejected));
            }
            _ => {}
        }
    }));

    handlers.push(conn.handle_scoped(irc::AUTHENTICATE, {
        let slot = slot.clone();
        let buffered = Mutex::new(String::new());
        move |conn: &Conn, line: &Line| {
            let Some(chunk) = line.arg(0) else {
                return;
            };
            let encoded = {
                let mut buf = buffered.lock();
                if chunk != "+" {
                    buf.push_str(chunk);
                }
                if chunk.len() == CHUNK_LEN {
                    // More to come.
                    return;
                }
                std::mem::take(&mut *buf)
            };
            let challenge = match STANDARD.decode(encoded.as_bytes()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::debug!(error = %e, "undecodable AUTHENTICATE challenge");
                    conn.send(irc::AUTHENTICATE, vec!["*"]);
                    slot.deliver(Err(SaslError::BadChallenge));
                    return;
                }
            };
            match auth.respond(&challenge) {
                Ok(response) => send_response(conn, &response),
                Err(e) => {
                    conn.send(irc::AUTHENTICATE, vec!["*"]);
                    slot.deliver(Err(e));
                }
            }
        }
    }));

    // 900 is informational; the outcome still waits for 903 or a failure.
    handlers.push(conn.handle_scoped(irc::RPL_LOGGEDIN, |_: &Conn, line: &Line| {
        tracing::info!(account = line.arg(2).unwrap_or(""), "logged in");
    }));

    handlers.push(conn.handle_scoped(irc::RPL_SASLSUCCESS, {
        let slot = slot.clone();
        move |_: &Conn, _: &Line| slot.deliver(Ok(()))
    }));

    for numeric in [
        irc::ERR_NICKLOCKED,
        irc::ERR_SASLFAIL,
        irc::ERR_SASLTOOLONG,
        irc::ERR_SASLABORTED,
    ] {
        let slot = slot.clone();
        handlers.push(conn.handle_scoped(numeric, move |_: &Conn, line: &Line| {
            slot.deliver(Err(SaslError::Server(line.text().to_string())));
        }));
    }

    PendingAuth {
        result,
        _handlers: handlers,
    }
}

/// Send `response` base64-encoded in 400-byte AUTHENTICATE chunks. An empty
/// response, or one that ends exactly on a chunk boundary, is terminated
/// with `AUTHENTICATE +`.
fn send_response(conn: &Conn, response: &[u8]) {
    let encoded = STANDARD.encode(response);
    // base64 output is ASCII, so any byte offset is a char boundary.
    let mut rest = encoded.as_str();
    while !rest.is_empty() {
        let (chunk, tail) = rest.split_at(rest.len().min(CHUNK_LEN));
        conn.send(irc::AUTHENTICATE, vec![chunk]);
        rest = tail;
    }
    if encoded.len() % CHUNK_LEN == 0 {
        conn.send(irc::AUTHENTICATE, vec!["+"]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::conn::Outgoing;

    fn creds() -> SaslCredentials {
        SaslCredentials {
            user: "bob".to_string(),
            password: "secret".to_string(),
            authzid: None,
        }
    }

    fn drain(out: &mut Outgoing) -> Vec<String> {
        std::iter::from_fn(|| out.try_recv()).collect()
    }

    fn feed(conn: &Conn, raw: &str) {
        conn.dispatch(&Line::parse(raw).unwrap());
    }

    #[test]
    fn plain_response_layout() {
        let plain = Plain::new(creds());
        assert_eq!(plain.respond(b"").unwrap(), b"bob\0bob\0secret");

        let plain = Plain::new(SaslCredentials {
            authzid: Some("admin".to_string()),
            ..creds()
        });
        assert_eq!(plain.respond(b"").unwrap(), b"admin\0bob\0secret");
    }

    #[test]
    fn credentials_debug_hides_password() {
        assert!(!format!("{:?}", creds()).contains("secret"));
    }

    #[tokio::test]
    async fn plain_exchange_succeeds() {
        let (conn, mut out) = Conn::new(Config::new("bob"));
        let pending = arm(&conn, Arc::new(Plain::new(creds())));

        feed(&conn, ":srv CAP * LS :sasl=PLAIN multi-prefix");
        feed(&conn, ":srv CAP * ACK :sasl");
        feed(&conn, "AUTHENTICATE +");
        feed(&conn, ":srv 903 bob :SASL authentication successful");

        assert_eq!(pending.wait(Duration::from_secs(15)).await, Ok(()));
        assert_eq!(
            drain(&mut out),
            vec![
                "AUTHENTICATE PLAIN".to_string(),
                format!("AUTHENTICATE {}", STANDARD.encode("bob\0bob\0secret")),
            ]
        );
    }

    #[tokio::test]
    async fn server_failure_carries_text() {
        let (conn, _out) = Conn::new(Config::new("bob"));
        let pending = arm(&conn, Arc::new(Plain::new(creds())));
        feed(&conn, ":srv 904 bob :SASL authentication failed");
        // A later success must not override the first outcome.
        feed(&conn, ":srv 903 bob :SASL authentication successful");

        assert_eq!(
            pending.wait(Duration::from_secs(15)).await,
            Err(HandshakeError::AuthFailed(SaslError::Server(
                "SASL authentication failed".to_string()
            )))
        );
    }

    #[tokio::test]
    async fn missing_from_listing_fails_fast() {
        let (conn, _out) = Conn::new(Config::new("bob"));
        let pending = arm(&conn, Arc::new(Plain::new(creds())));
        feed(&conn, ":srv CAP * LS * :multi-prefix");
        feed(&conn, ":srv CAP * LS :away-notify");

        assert_eq!(
            pending.wait(Duration::from_secs(15)).await,
            Err(HandshakeError::AuthFailed(SaslError::NotOffered))
        );
    }

    #[tokio::test]
    async fn nak_fails() {
        let (conn, _out) = Conn::new(Config::new("bob"));
        let pending = arm(&conn, Arc::new(Plain::new(creds())));
        feed(&conn, ":srv CAP * NAK :sasl");

        assert_eq!(
            pending.wait(Duration::from_secs(15)).await,
            Err(HandshakeError::AuthFailed(SaslError::Rejected))
        );
    }

    #[tokio::test]
    async fn logged_in_alone_is_not_an_outcome() {
        let (conn, _out) = Conn::new(Config::new("bob"));
        let pending = arm(&conn, Arc::new(Plain::new(creds())));
        let line = Line::parse(":srv 900 bob bob!b@h bob :You are now logged in as bob").unwrap();
        assert_eq!(conn.dispatch(&line), 1);
        feed(&conn, ":srv 904 bob :SASL authentication failed");

        assert_eq!(
            pending.wait(Duration::from_secs(15)).await,
            Err(HandshakeError::AuthFailed(SaslError::Server(
                "SASL authentication failed".to_string()
            )))
        );
        assert_eq!(conn.dispatch(&line), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out() {
        let (conn, _out) = Conn::new(Config::new("bob"));
        let pending = arm(&conn, Arc::new(Plain::new(creds())));
        assert_eq!(
            pending.wait(Duration::from_secs(15)).await,
            Err(HandshakeError::AuthTimeout)
        );
    }

    #[tokio::test]
    async fn handlers_removed_with_pending() {
        let (conn, _out) = Conn::new(Config::new("bob"));
        let before = conn.dispatch(&Line::new(irc::RPL_SASLSUCCESS));
        let pending = arm(&conn, Arc::new(Plain::new(creds())));
        assert_eq!(conn.dispatch(&Line::new(irc::RPL_SASLSUCCESS)), before + 1);
        drop(pending);
        assert_eq!(conn.dispatch(&Line::new(irc::RPL_SASLSUCCESS)), before);
    }

    #[test]
    fn long_response_is_chunked() {
        let (conn, mut out) = Conn::new(Config::new("bob"));
        // 300 bytes encode to exactly 400 base64 chars.
        send_response(&conn, &[b'x'; 300]);
        let sent = drain(&mut out);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].len(), "AUTHENTICATE ".len() + CHUNK_LEN);
        assert_eq!(sent[1], "AUTHENTICATE +");

        send_response(&conn, b"");
        assert_eq!(drain(&mut out), vec!["AUTHENTICATE +".to_string()]);
    }
}
