//! Connection registration core for IRC clients.
//!
//! A [`Conn`] owns one connection's identity, handler registry and
//! outbound queue. [`Conn::run`] pumps lines between a transport and the
//! handlers; the built-in handlers register with the server as soon as
//! the pump starts:
//!
//! 1. `PASS` (if configured)
//! 2. `CAP LS`, one `CAP REQ` per wanted capability the server lists,
//!    SASL if credentials are configured, then `CAP END`
//! 3. `NICK` and `USER`
//!
//! Nick collisions, `PING`, and CTCP `VERSION`/`PING` are answered
//! automatically for the life of the connection.
//!
//! ```rust,no_run
//! use freeq_client::{Config, Conn, irc};
//! use tokio::io::BufReader;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let tcp = tokio::net::TcpStream::connect("irc.freeq.at:6667").await?;
//! let (reader, writer) = tokio::io::split(tcp);
//!
//! let (conn, outgoing) = Conn::new(Config::new("bob"));
//! conn.handle(irc::CONNECTED, |conn: &Conn, _: &irc::Line| conn.raw("JOIN #freeq"));
//! conn.run(BufReader::new(reader), writer, outgoing).await
//! # }
//! ```

pub mod cap;
pub mod config;
pub mod conn;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod irc;
pub mod sasl;
pub mod state;

pub use config::Config;
pub use conn::{Conn, FloodGuard, Outgoing};
pub use error::{ConfigError, HandshakeError};
pub use handler::{Handler, HandlerGuard, HandlerId};
pub use irc::Line;
pub use sasl::{Authenticator, Plain, SaslCredentials, SaslError};
pub use state::{Identity, StateTracker};
