//! Expect-style session over a [`Link`].
//!
//! [`Session`] buffers everything the interpreter sends and lets callers
//! block until a literal or regex [`Pattern`] shows up. A successful match
//! consumes the buffer up to and including the matched text, so each
//! `expect` moves the read position forward irreversibly.
//!
//! ```no_run
//! # use watch_repl::link::ProcessLink;
//! # use watch_repl::session::Session;
//! # fn example() -> Result<(), watch_repl::ReplError> {
//! let link = ProcessLink::spawn("pynus", &[])?;
//! let mut session = Session::new(Box::new(link));
//! session.expect("Connect")?;
//! session.send(&[0x03])?;
//! session.expect(">>> ")?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::io::{self, Write};
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, trace, warn};

use crate::error::ReplError;
use crate::link::{Link, Recv};
use crate::protocol::LINE_END;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// What a [`ReplError::Closed`] raised by [`Session::send`] was waiting for.
const SEND_EXPECTATION: &str = "the link to accept input";

fn is_hangup(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

/// What to wait for in the incoming stream.
#[derive(Debug, Clone)]
pub enum Pattern {
    Literal(String),
    Regex(Regex),
}

impl Pattern {
    pub fn regex(pattern: &str) -> Result<Self, ReplError> {
        Ok(Pattern::Regex(Regex::new(pattern)?))
    }

    /// Byte range of the first match in `haystack`.
    fn find(&self, haystack: &str) -> Option<(usize, usize)> {
        match self {
            Pattern::Literal(needle) => haystack
                .find(needle.as_str())
                .map(|start| (start, start + needle.len())),
            Pattern::Regex(re) => re.find(haystack).map(|m| (m.start(), m.end())),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Literal(s) => write!(f, "{s}"),
            Pattern::Regex(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

impl From<&str> for Pattern {
    fn from(s: &str) -> Self {
        Pattern::Literal(s.to_string())
    }
}

impl From<String> for Pattern {
    fn from(s: String) -> Self {
        Pattern::Literal(s)
    }
}

impl From<Regex> for Pattern {
    fn from(re: Regex) -> Self {
        Pattern::Regex(re)
    }
}

/// Text consumed by a successful expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    /// Everything received ahead of the match.
    pub before: String,
    /// The matched text itself.
    pub matched: String,
}

impl Match {
    /// Everything consumed, match included.
    pub fn text(&self) -> String {
        format!("{}{}", self.before, self.matched)
    }
}

/// Outcome of waiting for a pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    Matched(Match),
    Timeout,
    Closed,
}

pub struct Session {
    link: Box<dyn Link>,
    pending: String,
    /// Tail of an incomplete UTF-8 sequence waiting for its remaining bytes.
    partial: Vec<u8>,
    mirror: Option<Box<dyn Write + Send>>,
    muted: bool,
    timeout: Duration,
    closed: bool,
}

impl Session {
    pub fn new(link: Box<dyn Link>) -> Self {
        Self {
            link,
            pending: String::new(),
            partial: Vec::new(),
            mirror: None,
            muted: false,
            timeout: DEFAULT_TIMEOUT,
            closed: false,
        }
    }

    /// Copy every byte read to `mirror` as well.
    pub fn with_mirror(mut self, mirror: Box<dyn Write + Send>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn set_mirror(&mut self, mirror: Option<Box<dyn Write + Send>>) {
        self.mirror = mirror;
    }

    /// Suspend (or resume) the mirror. Returns the previous setting.
    pub fn set_muted(&mut self, muted: bool) -> bool {
        std::mem::replace(&mut self.muted, muted)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Write `data` to the link.
    ///
    /// A link that has already closed, or whose far end hangs up during the
    /// write, is reported as [`ReplError::Closed`].
    pub fn send(&mut self, data: &[u8]) -> Result<(), ReplError> {
        debug!(data = %String::from_utf8_lossy(data).escape_debug(), "send");
        let closed = || ReplError::Closed {
            expected: SEND_EXPECTATION.to_string(),
        };
        if self.closed {
            return Err(closed());
        }
        match self.link.send(data) {
            Ok(()) => Ok(()),
            Err(e) if is_hangup(&e) => {
                warn!(error = %e, "transport closed during send");
                self.closed = true;
                Err(closed())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send `text` followed by the interpreter's line terminator.
    pub fn send_line(&mut self, text: &str) -> Result<(), ReplError> {
        self.send(format!("{text}{LINE_END}").as_bytes())
    }

    /// Wait for `pattern` using the session timeout.
    pub fn expect(&mut self, pattern: impl Into<Pattern>) -> Result<Match, ReplError> {
        let timeout = self.timeout;
        self.expect_within(pattern, timeout)
    }

    /// Wait for `pattern`, failing with [`ReplError::Timeout`] or
    /// [`ReplError::Closed`].
    pub fn expect_within(
        &mut self,
        pattern: impl Into<Pattern>,
        timeout: Duration,
    ) -> Result<Match, ReplError> {
        let pattern = pattern.into();
        match self.expect_outcome(&pattern, timeout)? {
            Expectation::Matched(m) => Ok(m),
            Expectation::Timeout => {
                warn!(expected = %pattern, ?timeout, "expect timed out");
                Err(ReplError::Timeout {
                    expected: pattern.to_string(),
                    buffered: self.pending.clone(),
                })
            }
            Expectation::Closed => {
                warn!(expected = %pattern, "transport closed during expect");
                Err(ReplError::Closed {
                    expected: pattern.to_string(),
                })
            }
        }
    }

    /// Block until `pattern` appears, the deadline passes or the link closes.
    ///
    /// Only transport I/O failures are returned as `Err`; timeouts and
    /// closure are ordinary outcomes. Unmatched text stays buffered.
    pub fn expect_outcome(
        &mut self,
        pattern: &Pattern,
        timeout: Duration,
    ) -> Result<Expectation, ReplError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((start, end)) = pattern.find(&self.pending) {
                let rest = self.pending.split_off(end);
                let matched = self.pending.split_off(start);
                let before = std::mem::replace(&mut self.pending, rest);
                debug!(expected = %pattern, skipped = before.len(), "matched");
                return Ok(Expectation::Matched(Match { before, matched }));
            }
            if self.closed {
                return Ok(Expectation::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Expectation::Timeout);
            }
            match self.link.recv(deadline - now)? {
                Recv::Data(bytes) => self.absorb(&bytes)?,
                Recv::Idle => {}
                Recv::Closed => self.closed = true,
            }
        }
    }

    /// Receive once without matching anything; the data bypasses the buffer.
    ///
    /// Used when the session is handed to an interactive console.
    pub fn recv_raw(&mut self, wait: Duration) -> Result<Recv, ReplError> {
        if self.closed {
            return Ok(Recv::Closed);
        }
        let recv = self.link.recv(wait)?;
        if recv == Recv::Closed {
            self.closed = true;
        }
        Ok(recv)
    }

    /// Take everything received but not yet consumed.
    pub fn drain_pending(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }

    fn absorb(&mut self, bytes: &[u8]) -> Result<(), ReplError> {
        trace!(len = bytes.len(), "recv");
        if !self.muted {
            if let Some(mirror) = self.mirror.as_mut() {
                mirror.write_all(bytes)?;
                mirror.flush()?;
            }
        }

        self.partial.extend_from_slice(bytes);
        let mut carry = Vec::new();
        let mut rest: &[u8] = &self.partial;
        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    self.pending.push_str(s);
                    rest = &[];
                }
                Err(e) => {
                    let (good, bad) = rest.split_at(e.valid_up_to());
                    self.pending.push_str(&String::from_utf8_lossy(good));
                    match e.error_len() {
                        Some(n) => {
                            self.pending.push(char::REPLACEMENT_CHARACTER);
                            rest = &bad[n..];
                        }
                        None => {
                            carry = bad.to_vec();
                            rest = &[];
                        }
                    }
                }
            }
        }
        self.partial = carry;
        Ok(())
    }
}
