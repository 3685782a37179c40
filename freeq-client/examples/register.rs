//! Connect, register, and idle until the server hangs up.
//!
//! Usage:
//!   cargo run --example register -- --server irc.freeq.at:6667 --nick bob \
//!     --cap away-notify --cap server-time --channel "#freeq"
//!
//! With `--config`, identity, caps and SASL credentials come from a TOML
//! file instead (see `freeq_client::config`).

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use freeq_client::{Config, Conn, SaslCredentials, irc};
use tokio::io::BufReader;

#[derive(Parser)]
#[command(name = "register", about = "Register with an IRC server and stay connected")]
struct Args {
    /// IRC server address (host:port)
    #[arg(long, default_value = "irc.freeq.at:6667")]
    server: String,

    #[arg(long, default_value = "freeq")]
    nick: String,

    /// Capability to request; repeatable
    #[arg(long = "cap")]
    caps: Vec<String>,

    /// Channel to join once registered
    #[arg(long)]
    channel: Option<String>,

    /// Server password
    #[arg(long, env = "IRC_PASS")]
    pass: Option<String>,

    /// SASL PLAIN account
    #[arg(long)]
    sasl_user: Option<String>,

    #[arg(long, env = "IRC_SASL_PASSWORD")]
    sasl_password: Option<String>,

    /// TOML config; overrides the identity flags above
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        if let Some(ref path) = self.config {
            return Config::load(path);
        }
        let sasl = match (self.sasl_user, self.sasl_password) {
            (Some(user), Some(password)) => Some(SaslCredentials {
                user,
                password,
                authzid: None,
            }),
            _ => None,
        };
        Ok(Config {
            caps: self.caps,
            pass: self.pass,
            sasl,
            ..Config::new(&self.nick)
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs with FREEQ_LOG_JSON=1, human-readable otherwise
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "freeq_client=debug,register=info".into());
    if std::env::var("FREEQ_LOG_JSON").unwrap_or_default() == "1" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let args = Args::parse();
    let server = args.server.clone();
    let channel = args.channel.clone();
    let cfg = args.into_config()?;

    tracing::info!(server = %server, nick = %cfg.me.nick, caps = ?cfg.caps, "connecting");
    let tcp = tokio::net::TcpStream::connect(&server).await?;
    let (reader, writer) = tokio::io::split(tcp);

    let (conn, outgoing) = Conn::new(cfg);
    conn.handle(irc::CONNECTED, move |conn: &Conn, _: &irc::Line| {
        tracing::info!(me = ?conn.me(), caps = ?conn.acknowledged_caps(), "registered");
        if let Some(ref channel) = channel {
            conn.send("JOIN", vec![channel.as_str()]);
        }
    });
    conn.handle(irc::DISCONNECTED, |_: &Conn, _: &irc::Line| {
        tracing::info!("disconnected");
    });

    tokio::spawn({
        let conn = conn.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                conn.close();
            }
        }
    });

    conn.run(BufReader::new(reader), writer, outgoing).await
}
