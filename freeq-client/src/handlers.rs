//! Built-in handlers that every connection needs to stay registered and
//! alive: registration, welcome, nick collisions, keepalive, CTCP.

use crate::cap;
use crate::conn::Conn;
use crate::irc::{self, Line};

pub(crate) fn add_internal(conn: &Conn) {
    conn.handle(irc::REGISTER, h_register);
    conn.handle(irc::RPL_WELCOME, h_001);
    conn.handle(irc::ERR_NICKNAMEINUSE, h_433);
    conn.handle(irc::CTCP, h_ctcp);
    conn.handle(irc::NICK, h_nick);
    conn.handle(irc::PING, h_ping);
}

fn h_ping(conn: &Conn, line: &Line) {
    if let Some(token) = line.arg(0) {
        conn.pong(token);
    }
}

/// Registration waits on lines that arrive through this same dispatch
/// path, so it runs on its own task.
fn h_register(conn: &Conn, _line: &Line) {
    let conn = conn.clone();
    tokio::spawn(async move { register(&conn).await });
}

/// Send PASS, negotiate capabilities, then claim our nick and ident.
///
/// Flood control is off for the duration. If negotiation fails the
/// connection is closed; the caller reconnects to try again.
pub async fn register(conn: &Conn) {
    let _flood = conn.suspend_flood_control();

    let cfg = conn.config();
    if let Some(ref pass) = cfg.pass {
        conn.pass(pass);
    }

    if let Err(e) = cap::negotiate(conn).await {
        if !conn.is_closed() {
            tracing::error!(error = %e, "capability negotiation failed");
            conn.close();
        }
        return;
    }

    let me = &cfg.me;
    tracing::info!(nick = %me.nick, "registering");
    conn.nick(&me.nick);
    conn.user(&me.ident, &me.name);
}

/// RPL_WELCOME: we're registered. The last word of the text is usually
/// our full `nick!ident@host`; learn the host from it.
fn h_001(conn: &Conn, line: &Line) {
    conn.set_connected(true);
    conn.dispatch(&Line {
        cmd: irc::CONNECTED.to_string(),
        ..line.clone()
    });

    let Some(mask) = line.text().rsplit(' ').next() else {
        return;
    };
    let Some((_, host)) = mask.split_once('@') else {
        return;
    };
    if let Some(st) = conn.tracker() {
        let me = st.me();
        st.nick_info(&me.nick, &me.ident, host, &me.name);
    } else {
        conn.update_me(|me| me.host = host.to_string());
    }
    tracing::info!(host, "registered with server");
}

/// ERR_NICKNAMEINUSE: `433 <us> <rejected> :Nickname is already in use`.
fn h_433(conn: &Conn, line: &Line) {
    let me = conn.me();
    let rejected = line.arg(1);
    let candidate = (conn.config().new_nick)(rejected.unwrap_or(&me.nick));
    tracing::debug!(rejected = ?rejected, candidate = %candidate, "nick in use");
    conn.nick(&candidate);

    // Before registration completes there is no NICK echo to confirm a
    // change, so the rename has to be recorded here.
    if rejected != Some(me.nick.as_str()) {
        return;
    }
    match conn.tracker() {
        Some(st) => {
            st.re_nick(&me.nick, &candidate);
        }
        None => conn.update_me(|me| me.nick = candidate),
    }
}

/// CTCP queries: args are `[command, target, payload?]`.
fn h_ctcp(conn: &Conn, line: &Line) {
    match line.arg(0) {
        Some(irc::VERSION) => {
            conn.ctcp_reply(&line.nick, irc::VERSION, Some(conn.config().version.as_str()));
        }
        Some(irc::PING) => {
            if let Some(payload) = line.arg(2) {
                conn.ctcp_reply(&line.nick, irc::PING, Some(payload));
            }
        }
        _ => {}
    }
}

/// Track our own nick changes when nothing else owns identity.
fn h_nick(conn: &Conn, line: &Line) {
    if conn.tracker().is_some() {
        return;
    }
    let Some(new_nick) = line.arg(0) else {
        return;
    };
    conn.update_me(|me| {
        if line.nick == me.nick {
            me.nick = new_nick.to_string();
        }
    });
}
