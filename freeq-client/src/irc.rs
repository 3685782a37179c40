//! IRC line parsing and formatting.
//!
//! [`Message`] is the wire-level form (tags, prefix, command, params) used
//! for both directions. [`Line`] is what handlers receive: a parsed message
//! with the source split into nick/ident/host, a timestamp, and CTCP
//! queries unwrapped into their own command.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};

// ── Commands and numerics ──

/// Synthetic event dispatched once when the transport is up.
pub const REGISTER: &str = "REGISTER";
/// Synthetic event dispatched on RPL_WELCOME.
pub const CONNECTED: &str = "CONNECTED";
/// Synthetic event dispatched when the read loop ends.
pub const DISCONNECTED: &str = "DISCONNECTED";
/// A CTCP query unwrapped from a PRIVMSG.
pub const CTCP: &str = "CTCP";
/// A CTCP reply unwrapped from a NOTICE.
pub const CTCPREPLY: &str = "CTCPREPLY";

pub const AUTHENTICATE: &str = "AUTHENTICATE";
pub const CAP: &str = "CAP";
pub const NICK: &str = "NICK";
pub const NOTICE: &str = "NOTICE";
pub const PASS: &str = "PASS";
pub const PING: &str = "PING";
pub const PONG: &str = "PONG";
pub const PRIVMSG: &str = "PRIVMSG";
pub const USER: &str = "USER";
pub const VERSION: &str = "VERSION";

pub const RPL_WELCOME: &str = "001";
pub const ERR_NICKNAMEINUSE: &str = "433";
pub const RPL_LOGGEDIN: &str = "900";
pub const ERR_NICKLOCKED: &str = "902";
pub const RPL_SASLSUCCESS: &str = "903";
pub const ERR_SASLFAIL: &str = "904";
pub const ERR_SASLTOOLONG: &str = "905";
pub const ERR_SASLABORTED: &str = "906";

const CTCP_DELIM: char = '\x01';

// ── Wire message ──

/// A single IRC protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tags: HashMap<String, String>,
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    pub fn new(command: &str, params: Vec<&str>) -> Self {
        Self {
            tags: HashMap::new(),
            prefix: None,
            command: command.to_string(),
            params: params.into_iter().map(str::to_string).collect(),
        }
    }

    /// Parse a raw line (with or without the trailing CRLF).
    ///
    /// Returns `None` for empty lines or a missing command.
    pub fn parse(line: &str) -> Option<Message> {
        let mut rest = line.trim_end_matches(['\r', '\n']);

        let mut tags = HashMap::new();
        if let Some(stripped) = rest.strip_prefix('@') {
            let (raw_tags, after) = stripped.split_once(' ')?;
            for tag in raw_tags.split(';').filter(|t| !t.is_empty()) {
                let (key, value) = tag.split_once('=').unwrap_or((tag, ""));
                tags.insert(key.to_string(), unescape_tag_value(value));
            }
            rest = after.trim_start_matches(' ');
        }

        let mut prefix = None;
        if let Some(stripped) = rest.strip_prefix(':') {
            let (p, after) = stripped.split_once(' ')?;
            prefix = Some(p.to_string());
            rest = after.trim_start_matches(' ');
        }

        let (command, mut rest) = rest.split_once(' ').unwrap_or((rest, ""));
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, after)) => {
                    params.push(param.to_string());
                    rest = after;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Some(Message {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            let mut tags: Vec<_> = self.tags.iter().collect();
            tags.sort();
            let rendered: Vec<String> = tags
                .into_iter()
                .map(|(k, v)| {
                    if v.is_empty() {
                        k.clone()
                    } else {
                        format!("{k}={}", escape_tag_value(v))
                    }
                })
                .collect();
            write!(f, "@{} ", rendered.join(";"))?;
        }
        if let Some(ref prefix) = self.prefix {
            write!(f, ":{prefix} ")?;
        }
        f.write_str(&self.command)?;
        if let Some((last, init)) = self.params.split_last() {
            for param in init {
                write!(f, " {param}")?;
            }
            if last.is_empty() || last.contains(' ') || last.starts_with(':') {
                write!(f, " :{last}")?;
            } else {
                write!(f, " {last}")?;
            }
        }
        Ok(())
    }
}

fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

/// Wrap a CTCP command and optional argument in `\x01` delimiters.
pub fn ctcp_quote(cmd: &str, arg: Option<&str>) -> String {
    match arg {
        Some(arg) if !arg.is_empty() => format!("{CTCP_DELIM}{cmd} {arg}{CTCP_DELIM}"),
        _ => format!("{CTCP_DELIM}{cmd}{CTCP_DELIM}"),
    }
}

// ── Dispatched line ──

/// A parsed line as seen by handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub tags: HashMap<String, String>,
    /// Source nick (empty for server-originated lines without `!`).
    pub nick: String,
    pub ident: String,
    pub host: String,
    /// The full source prefix.
    pub src: String,
    /// Command or numeric, upper-cased. CTCP queries/replies become
    /// [`CTCP`]/[`CTCPREPLY`] with args `[command, target, payload?]`.
    pub cmd: String,
    pub raw: String,
    pub args: Vec<String>,
    /// Server-time tag if present, otherwise the time we parsed the line.
    pub time: DateTime<Utc>,
}

impl Line {
    /// Build a synthetic line carrying only a command.
    pub fn new(cmd: &str) -> Self {
        Self {
            tags: HashMap::new(),
            nick: String::new(),
            ident: String::new(),
            host: String::new(),
            src: String::new(),
            cmd: cmd.to_string(),
            raw: String::new(),
            args: Vec::new(),
            time: Utc::now(),
        }
    }

    pub fn parse(raw: &str) -> Option<Line> {
        let msg = Message::parse(raw)?;
        let time = msg
            .tags
            .get("time")
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let src = msg.prefix.unwrap_or_default();
        let (nick, ident, host) = split_source(&src);

        let mut line = Line {
            tags: msg.tags,
            nick,
            ident,
            host,
            src,
            cmd: msg.command,
            raw: raw.trim_end_matches(['\r', '\n']).to_string(),
            args: msg.params,
            time,
        };
        line.unwrap_ctcp();
        Some(line)
    }

    /// Argument `idx`, if present.
    pub fn arg(&self, idx: usize) -> Option<&str> {
        self.args.get(idx).map(String::as_str)
    }

    /// The last argument, or `""` when there are none.
    pub fn text(&self) -> &str {
        self.args.last().map(String::as_str).unwrap_or("")
    }

    fn unwrap_ctcp(&mut self) {
        let cmd = match self.cmd.as_str() {
            PRIVMSG => CTCP,
            NOTICE => CTCPREPLY,
            _ => return,
        };
        if self.args.len() != 2 {
            return;
        }
        let Some(inner) = self.args[1].strip_prefix(CTCP_DELIM) else {
            return;
        };
        let inner = inner.strip_suffix(CTCP_DELIM).unwrap_or(inner);
        let (query, payload) = inner.split_once(' ').unwrap_or((inner, ""));
        if query.is_empty() {
            return;
        }

        let target = self.args[0].clone();
        let mut args = vec![query.to_ascii_uppercase(), target];
        if !payload.is_empty() {
            args.push(payload.to_string());
        }
        self.cmd = cmd.to_string();
        self.args = args;
    }
}

fn split_source(src: &str) -> (String, String, String) {
    match src.split_once('!') {
        Some((nick, rest)) => {
            let (ident, host) = rest.split_once('@').unwrap_or((rest, ""));
            (nick.to_string(), ident.to_string(), host.to_string())
        }
        None => match src.split_once('@') {
            Some((nick, host)) => (nick.to_string(), String::new(), host.to_string()),
            None if !src.contains('.') => (src.to_string(), String::new(), String::new()),
            None => (String::new(), String::new(), String::new()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_prefix_and_trailing() {
        let line = Line::parse(":alice!al@example.org PRIVMSG #freeq :hello there\r\n").unwrap();
        assert_eq!(line.nick, "alice");
        assert_eq!(line.ident, "al");
        assert_eq!(line.host, "example.org");
        assert_eq!(line.cmd, "PRIVMSG");
        assert_eq!(line.args, vec!["#freeq", "hello there"]);
        assert_eq!(line.text(), "hello there");
    }

    #[test]
    fn server_source_has_no_nick() {
        let line = Line::parse(":irc.freeq.at 001 bob :Welcome bob!b@host").unwrap();
        assert_eq!(line.src, "irc.freeq.at");
        assert!(line.nick.is_empty());
        assert_eq!(line.cmd, RPL_WELCOME);
    }

    #[test]
    fn parse_tags_and_server_time() {
        let line = Line::parse("@time=2024-01-02T03:04:05.000Z;msgid=a\\sb :srv NOTICE * :hi").unwrap();
        assert_eq!(line.tags.get("msgid").map(String::as_str), Some("a b"));
        assert_eq!(line.time.to_rfc3339(), "2024-01-02T03:04:05+00:00");
    }

    #[test]
    fn empty_line_is_rejected() {
        assert!(Message::parse("\r\n").is_none());
        assert!(Message::parse(":only-a-prefix").is_none());
    }

    #[test]
    fn ctcp_query_is_unwrapped() {
        let line = Line::parse(":bob!b@h PRIVMSG me :\x01PING 123\x01").unwrap();
        assert_eq!(line.cmd, CTCP);
        assert_eq!(line.args, vec!["PING", "me", "123"]);

        let line = Line::parse(":bob!b@h PRIVMSG me :\x01version\x01").unwrap();
        assert_eq!(line.args, vec!["VERSION", "me"]);

        let line = Line::parse(":bob!b@h NOTICE me :\x01VERSION freeq\x01").unwrap();
        assert_eq!(line.cmd, CTCPREPLY);
    }

    #[test]
    fn format_adds_colon_only_when_needed() {
        assert_eq!(Message::new("NICK", vec!["Bob_"]).to_string(), "NICK Bob_");
        assert_eq!(Message::new("PONG", vec!["abc"]).to_string(), "PONG abc");
        assert_eq!(
            Message::new("USER", vec!["bob", "0", "*", "Bob Smith"]).to_string(),
            "USER bob 0 * :Bob Smith"
        );
        assert_eq!(Message::new("PONG", vec![":x"]).to_string(), "PONG ::x");
    }

    #[test]
    fn ctcp_quote_framing() {
        assert_eq!(ctcp_quote("PING", Some("123")), "\x01PING 123\x01");
        assert_eq!(ctcp_quote("VERSION", None), "\x01VERSION\x01");
    }
}
