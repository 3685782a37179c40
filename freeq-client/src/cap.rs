//! CAP capability negotiation.
//!
//! ```text
//! C: CAP LS
//! S: CAP * LS * :away-notify batch          (more to come)
//! S: CAP * LS :sasl server-time             (final chunk)
//! C: CAP REQ :away-notify                   (one REQ per listed cap we want)
//! S: CAP * ACK :away-notify
//! C: CAP END                                (once nothing is outstanding)
//! ```
//!
//! A requested capability missing from the final listing chunk is treated
//! as resolved, so a server that never lists it can't stall registration.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::conn::Conn;
use crate::error::HandshakeError;
use crate::irc::{self, Line};
use crate::sasl::{self, SASL_CAP};

/// How long to wait for SASL to finish once negotiation has started.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(15);

/// A CAP line we know how to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CapLine<'a> {
    /// A listing chunk. `more` is set on all but the last chunk.
    Ls { caps: Vec<&'a str>, more: bool },
    Ack(Vec<&'a str>),
    Nak(Vec<&'a str>),
}

impl<'a> CapLine<'a> {
    /// `CAP <target> <sub> [*] :<caps>`. Anything shorter is ignored.
    pub(crate) fn parse(line: &'a Line) -> Option<CapLine<'a>> {
        if line.cmd != irc::CAP || line.args.len() < 3 {
            return None;
        }
        let more = line.args.len() > 3 && line.args[2] == "*";
        let caps: Vec<&str> = line.text().split(' ').filter(|c| !c.is_empty()).collect();
        match line.args[1].to_ascii_uppercase().as_str() {
            "LS" => Some(CapLine::Ls { caps, more }),
            "ACK" => Some(CapLine::Ack(caps)),
            "NAK" => Some(CapLine::Nak(caps)),
            _ => None,
        }
    }
}

/// Name part of a listing entry (`sasl=PLAIN,EXTERNAL` -> `sasl`).
pub(crate) fn cap_name(entry: &str) -> &str {
    entry.split_once('=').map_or(entry, |(name, _)| name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the final listing chunk.
    Requesting,
    /// Listing seen; waiting for ACK/NAK of what we asked for.
    WaitingForAcks,
    Complete,
}

/// Bookkeeping for one negotiation. Does no I/O: callers send what it
/// returns.
#[derive(Debug)]
struct Negotiation {
    phase: Phase,
    requested: Vec<String>,
    outstanding: HashSet<String>,
    req_sent: HashSet<String>,
    drained: Option<oneshot::Sender<()>>,
}

impl Negotiation {
    fn new(requested: Vec<String>) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let negotiation = Self {
            phase: Phase::Requesting,
            outstanding: requested.iter().cloned().collect(),
            requested,
            req_sent: HashSet::new(),
            drained: Some(tx),
        };
        (negotiation, rx)
    }

    /// Handle a listing chunk; returns the caps to REQ now.
    fn on_listing(&mut self, caps: &[&str], more: bool) -> Vec<String> {
        let listed: HashSet<&str> = caps.iter().map(|c| cap_name(c)).collect();
        let mut to_request = Vec::new();
        for cap in &self.requested {
            if listed.contains(cap.as_str())
                && self.outstanding.contains(cap)
                && self.req_sent.insert(cap.clone())
            {
                to_request.push(cap.clone());
            }
        }

        if !more && self.phase == Phase::Requesting {
            // Whatever was never listed won't be ACKed or NAKed.
            let unlisted: Vec<String> = self
                .outstanding
                .iter()
                .filter(|cap| !self.req_sent.contains(*cap))
                .cloned()
                .collect();
            for cap in unlisted {
                tracing::debug!(cap = %cap, "requested capability not offered by server");
                self.outstanding.remove(&cap);
            }
            self.phase = Phase::WaitingForAcks;
            self.check_drained();
        }
        to_request
    }

    /// Handle ACK/NAK; each named cap stops being outstanding.
    fn on_reply(&mut self, caps: &[&str]) {
        for cap in caps {
            self.outstanding.remove(*cap);
        }
        self.check_drained();
    }

    fn check_drained(&mut self) {
        if self.phase != Phase::WaitingForAcks || !self.outstanding.is_empty() {
            return;
        }
        self.phase = Phase::Complete;
        if let Some(tx) = self.drained.take() {
            let _ = tx.send(());
        }
    }
}

fn on_cap(state: &Mutex<Negotiation>, conn: &Conn, line: &Line) {
    let Some(cap_line) = CapLine::parse(line) else {
        tracing::trace!(raw = %line.raw, "ignoring CAP line");
        return;
    };
    match cap_line {
        CapLine::Ls { caps, more } => {
            let to_request = state.lock().on_listing(&caps, more);
            for cap in to_request {
                conn.raw(&format!("CAP REQ :{cap}"));
            }
        }
        CapLine::Ack(caps) => {
            for cap in &caps {
                conn.record_ack(cap);
            }
            state.lock().on_reply(&caps);
        }
        CapLine::Nak(caps) => {
            tracing::debug!(caps = ?caps, "capabilities rejected");
            state.lock().on_reply(&caps);
        }
    }
}

/// Collapse duplicates, keeping the first occurrence's position.
fn dedup(caps: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    caps.iter()
        .filter(|cap| seen.insert(cap.as_str()))
        .cloned()
        .collect()
}

/// Run capability negotiation (and SASL, if configured) to completion.
///
/// Sends `CAP END` only on success. Returns immediately, sending nothing,
/// when there is nothing to request and no authentication.
pub async fn negotiate(conn: &Conn) -> Result<(), HandshakeError> {
    let cfg = conn.config();
    let mut requested = dedup(&cfg.caps);
    let authenticator = cfg.authenticator();
    if authenticator.is_some() && !requested.iter().any(|c| c == SASL_CAP) {
        requested.push(SASL_CAP.to_string());
    }
    if requested.is_empty() {
        return Ok(());
    }

    // Armed before anything is sent, so no SASL reply can be missed.
    let pending_auth = authenticator.map(|auth| sasl::arm(conn, auth));

    let (negotiation, drained) = Negotiation::new(requested);
    tracing::debug!(caps = ?negotiation.requested, "negotiating capabilities");
    let state = Arc::new(Mutex::new(negotiation));
    let _cap_handler = conn.handle_scoped(irc::CAP, {
        let state = Arc::clone(&state);
        move |conn: &Conn, line: &Line| on_cap(&state, conn, line)
    });

    conn.raw("CAP LS");

    if let Some(pending) = pending_auth {
        tokio::select! {
            outcome = pending.wait(AUTH_TIMEOUT) => outcome?,
            _ = conn.closed() => return Err(HandshakeError::Disconnected),
        }
    }

    tokio::select! {
        res = drained => res.map_err(|_| HandshakeError::Disconnected)?,
        _ = conn.closed() => return Err(HandshakeError::Disconnected),
    }

    conn.raw("CAP END");
    tracing::debug!(acked = ?conn.acknowledged_caps(), "capability negotiation complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(list: &[&str]) -> Vec<String> {
        list.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn parse_cap_lines() {
        let line = Line::parse(":srv CAP * LS * :a b=1").unwrap();
        assert_eq!(
            CapLine::parse(&line),
            Some(CapLine::Ls { caps: vec!["a", "b=1"], more: true })
        );

        let line = Line::parse(":srv CAP bob ACK :a  b ").unwrap();
        assert_eq!(CapLine::parse(&line), Some(CapLine::Ack(vec!["a", "b"])));

        let line = Line::parse(":srv CAP bob NAK").unwrap();
        assert_eq!(CapLine::parse(&line), None);

        let line = Line::parse(":srv CAP bob NEW :c").unwrap();
        assert_eq!(CapLine::parse(&line), None);
    }

    #[test]
    fn listed_caps_requested_once_unlisted_resolved() {
        let (mut n, mut drained) = Negotiation::new(caps(&["sasl", "away-notify"]));
        assert_eq!(n.on_listing(&["away-notify", "batch"], false), caps(&["away-notify"]));
        assert!(!n.outstanding.contains("sasl"));
        assert!(drained.try_recv().is_err());

        // A repeated listing doesn't produce a second REQ.
        assert!(n.on_listing(&["away-notify"], false).is_empty());

        n.on_reply(&["away-notify"]);
        assert_eq!(n.phase, Phase::Complete);
        assert!(drained.try_recv().is_ok());
    }

    #[test]
    fn absence_judged_on_final_chunk_only() {
        let (mut n, _drained) = Negotiation::new(caps(&["a", "b"]));
        assert_eq!(n.on_listing(&["a"], true), caps(&["a"]));
        assert!(n.outstanding.contains("b"));
        assert_eq!(n.on_listing(&["b=x"], false), caps(&["b"]));
        assert_eq!(n.phase, Phase::WaitingForAcks);
        assert_eq!(n.outstanding.len(), 2);
    }

    #[test]
    fn nothing_listed_drains_immediately() {
        let (mut n, mut drained) = Negotiation::new(caps(&["a", "b"]));
        assert!(n.on_listing(&[], false).is_empty());
        assert_eq!(n.phase, Phase::Complete);
        assert!(drained.try_recv().is_ok());
    }

    #[test]
    fn replies_before_listing_do_not_complete() {
        let (mut n, mut drained) = Negotiation::new(caps(&["a"]));
        n.on_reply(&["a"]);
        assert!(drained.try_recv().is_err());
        // The set never regrows, so the listing finds nothing left to do.
        assert!(n.on_listing(&["a"], false).is_empty());
        assert!(drained.try_recv().is_ok());
    }

    #[test]
    fn duplicates_collapse() {
        assert_eq!(dedup(&caps(&["a", "b", "a", "c", "b"])), caps(&["a", "b", "c"]));
    }

    #[test]
    fn cap_name_strips_value() {
        assert_eq!(cap_name("sasl=PLAIN,EXTERNAL"), "sasl");
        assert_eq!(cap_name("batch"), "batch");
    }
}
