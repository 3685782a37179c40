//! A single IRC connection: identity, handlers, outbound queue, line pump.
//!
//! [`Conn`] is a cheap handle; clones share the same connection. Handlers
//! receive it by reference and may send lines, register handlers, or close
//! the connection from any task.
//!
//! Outbound lines go through an unbounded queue drained by a writer task
//! that applies flood control unless it was disabled when the line was
//! queued (see [`Conn::suspend_flood_control`]).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::config::Config;
use crate::handler::{Handler, HandlerGuard, HandlerId, Registry};
use crate::handlers;
use crate::irc::{self, Line, Message};
use crate::state::{Identity, StateTracker};

#[derive(Clone)]
pub struct Conn {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: Config,
    /// Our identity when no tracker is attached.
    me: Mutex<Identity>,
    tracker: Option<Arc<dyn StateTracker>>,
    /// True while outbound lines bypass the throttle.
    flood: AtomicBool,
    connected: AtomicBool,
    acked_caps: Mutex<Vec<String>>,
    registry: Arc<Registry>,
    out_tx: mpsc::UnboundedSender<Queued>,
    closed: watch::Sender<bool>,
}

/// An outbound line and whether it skips the throttle.
#[derive(Debug)]
struct Queued {
    line: String,
    unthrottled: bool,
}

/// Receiving end of the outbound queue, handed to [`Conn::run`].
pub struct Outgoing(mpsc::UnboundedReceiver<Queued>);

impl Outgoing {
    pub async fn recv(&mut self) -> Option<String> {
        self.0.recv().await.map(|q| q.line)
    }

    /// Next queued line without waiting.
    pub fn try_recv(&mut self) -> Option<String> {
        self.0.try_recv().ok().map(|q| q.line)
    }
}

impl Conn {
    /// Create a connection with the built-in handlers registered.
    pub fn new(cfg: Config) -> (Conn, Outgoing) {
        Self::build(cfg, None)
    }

    /// Like [`Conn::new`], with `tracker` owning our identity.
    ///
    /// The tracker is brought in line with the configured identity first,
    /// since that is what registration claims.
    pub fn with_tracker(cfg: Config, tracker: Arc<dyn StateTracker>) -> (Conn, Outgoing) {
        let current = tracker.me();
        if current.nick != cfg.me.nick {
            tracker.re_nick(&current.nick, &cfg.me.nick);
        }
        tracker.nick_info(&cfg.me.nick, &cfg.me.ident, &cfg.me.host, &cfg.me.name);
        Self::build(cfg, Some(tracker))
    }

    fn build(cfg: Config, tracker: Option<Arc<dyn StateTracker>>) -> (Conn, Outgoing) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let conn = Conn {
            inner: Arc::new(Inner {
                me: Mutex::new(cfg.me.clone()),
                flood: AtomicBool::new(cfg.flood),
                cfg,
                tracker,
                connected: AtomicBool::new(false),
                acked_caps: Mutex::new(Vec::new()),
                registry: Arc::new(Registry::new()),
                out_tx,
                closed,
            }),
        };
        handlers::add_internal(&conn);
        (conn, Outgoing(out_rx))
    }

    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }

    // ── Identity ──

    /// Our current identity, from the tracker if one is attached.
    pub fn me(&self) -> Identity {
        match self.inner.tracker {
            Some(ref st) => st.me(),
            None => self.inner.me.lock().clone(),
        }
    }

    pub(crate) fn tracker(&self) -> Option<&Arc<dyn StateTracker>> {
        self.inner.tracker.as_ref()
    }

    /// Mutate the locally held identity. Callers check for a tracker first.
    pub(crate) fn update_me(&self, f: impl FnOnce(&mut Identity)) {
        f(&mut self.inner.me.lock());
    }

    /// Whether RPL_WELCOME has been received on this connection.
    pub fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::Release);
    }

    // ── Capabilities ──

    /// Capabilities the server acknowledged, in order.
    pub fn acknowledged_caps(&self) -> Vec<String> {
        self.inner.acked_caps.lock().clone()
    }

    pub fn has_cap(&self, cap: &str) -> bool {
        self.inner.acked_caps.lock().iter().any(|c| c == cap)
    }

    pub(crate) fn record_ack(&self, cap: &str) {
        let mut acked = self.inner.acked_caps.lock();
        if !acked.iter().any(|c| c == cap) {
            acked.push(cap.to_string());
        }
    }

    // ── Flood control ──

    /// True while outbound lines bypass the throttle.
    pub fn flood(&self) -> bool {
        self.inner.flood.load(Ordering::Acquire)
    }

    /// Disable flood control until the returned guard is dropped, then
    /// restore whatever setting was in place before.
    pub fn suspend_flood_control(&self) -> FloodGuard {
        let prev = self.inner.flood.swap(true, Ordering::AcqRel);
        FloodGuard {
            conn: self.clone(),
            prev,
        }
    }

    // ── Handlers ──

    pub fn handle(&self, name: &str, handler: impl Handler) -> HandlerId {
        self.inner.registry.add(name, handler)
    }

    /// Register a handler that lives as long as the returned guard.
    pub fn handle_scoped(&self, name: &str, handler: impl Handler) -> HandlerGuard {
        let id = self.inner.registry.add(name, handler);
        HandlerGuard::new(&self.inner.registry, name, id)
    }

    pub fn remove_handler(&self, name: &str, id: HandlerId) -> bool {
        self.inner.registry.remove(name, id)
    }

    /// Route `line` to its handlers. Returns how many ran.
    pub fn dispatch(&self, line: &Line) -> usize {
        self.inner.registry.dispatch(self, line)
    }

    // ── Sending ──

    /// Queue a raw line (without CRLF). Dropped once the connection is closed.
    ///
    /// Lines queued while flood control is suspended are never delayed,
    /// even if they are written after the suspension ends.
    pub fn raw(&self, line: &str) {
        if self.is_closed() {
            tracing::debug!(line, "connection closed, dropping line");
            return;
        }
        tracing::debug!("-> {line}");
        let queued = Queued {
            line: line.to_string(),
            unthrottled: self.flood(),
        };
        if self.inner.out_tx.send(queued).is_err() {
            tracing::debug!(line, "outbound queue gone, dropping line");
        }
    }

    pub fn send(&self, command: &str, params: Vec<&str>) {
        self.raw(&Message::new(command, params).to_string());
    }

    pub fn pass(&self, password: &str) {
        self.send(irc::PASS, vec![password]);
    }

    pub fn nick(&self, nick: &str) {
        self.send(irc::NICK, vec![nick]);
    }

    pub fn user(&self, ident: &str, name: &str) {
        self.send(irc::USER, vec![ident, "0", "*", name]);
    }

    pub fn pong(&self, token: &str) {
        self.send(irc::PONG, vec![token]);
    }

    /// Send a CTCP reply (a NOTICE framed with `\x01`).
    pub fn ctcp_reply(&self, target: &str, cmd: &str, arg: Option<&str>) {
        let body = irc::ctcp_quote(cmd, arg);
        self.raw(&format!("{} {target} :{body}", irc::NOTICE));
    }

    // ── Lifecycle ──

    /// Tear the connection down. Idempotent.
    pub fn close(&self) {
        let was_closed = self.inner.closed.send_replace(true);
        if !was_closed {
            tracing::debug!("closing connection");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once [`Conn::close`] has been called.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Pump lines between the transport and the handlers until EOF, a
    /// read error, or [`Conn::close`].
    ///
    /// Dispatches [`irc::REGISTER`] once the writer is running and
    /// [`irc::DISCONNECTED`] on the way out.
    pub async fn run<R, W>(&self, mut reader: R, writer: W, outgoing: Outgoing) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer_task = tokio::spawn(write_loop(self.clone(), writer, outgoing));
        self.dispatch(&Line::new(irc::REGISTER));

        let mut buf = String::new();
        let result: Result<()> = loop {
            buf.clear();
            tokio::select! {
                read = reader.read_line(&mut buf) => match read {
                    Ok(0) => break Ok(()),
                    Ok(_) => match Line::parse(&buf) {
                        Some(line) => {
                            tracing::debug!("<- {}", line.raw);
                            self.dispatch(&line);
                        }
                        None => tracing::trace!(raw = buf.trim_end(), "ignoring unparseable line"),
                    },
                    Err(e) => break Err(e.into()),
                },
                _ = self.closed() => break Ok(()),
            }
        };

        self.close();
        self.set_connected(false);
        match writer_task.await {
            Ok(Err(e)) => tracing::debug!(error = %e, "writer stopped with error"),
            Err(e) => tracing::warn!(error = %e, "writer task failed"),
            Ok(Ok(())) => {}
        }
        self.dispatch(&Line::new(irc::DISCONNECTED));
        result
    }
}

/// Restores the previous flood-control setting on drop.
#[must_use = "flood control is restored as soon as the guard is dropped"]
pub struct FloodGuard {
    conn: Conn,
    prev: bool,
}

impl Drop for FloodGuard {
    fn drop(&mut self) {
        self.conn.inner.flood.store(self.prev, Ordering::Release);
    }
}

async fn write_loop<W>(conn: Conn, mut writer: W, mut outgoing: Outgoing) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut throttle = Throttle::default();
    loop {
        let queued = tokio::select! {
            biased;
            queued = outgoing.0.recv() => match queued {
                Some(queued) => queued,
                None => break,
            },
            _ = conn.closed() => {
                // Flush what was queued before the close.
                while let Some(line) = outgoing.try_recv() {
                    writer.write_all(format!("{line}\r\n").as_bytes()).await?;
                }
                break;
            }
        };
        if !queued.unthrottled {
            let delay = throttle.delay(queued.line.len(), Instant::now());
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        writer.write_all(format!("{}\r\n", queued.line).as_bytes()).await?;
        writer.flush().await?;
    }
    writer.flush().await?;
    let _ = writer.shutdown().await;
    Ok(())
}

/// Line-based flood control: each line costs 2s plus 1/120s per byte.
/// Once the accumulated cost runs more than 10s ahead of the wall clock,
/// every line waits out its own cost before being sent.
#[derive(Debug, Default)]
struct Throttle {
    badness: Duration,
    last_sent: Option<Instant>,
}

impl Throttle {
    const BASE: Duration = Duration::from_secs(2);
    const LIMIT: Duration = Duration::from_secs(10);

    fn delay(&mut self, chars: usize, now: Instant) -> Duration {
        let line_time = Self::BASE + Duration::from_millis(chars as u64 * 1000 / 120);
        let elapsed = self.last_sent.map_or(Duration::ZERO, |t| now.saturating_duration_since(t));
        self.badness = (self.badness + line_time).saturating_sub(elapsed);
        self.last_sent = Some(now);
        if self.badness > Self::LIMIT {
            line_time
        } else {
            Duration::ZERO
        }
    }
}
