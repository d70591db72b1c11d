use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::protocol::{
    COMMAND_PROMPT, CONNECT_BANNER, CONSOLE_BANNER, DETACH, END_OF_INPUT, ENTER_PASTE, INTERRUPT,
    PASTE_PROMPT, RESUME_COMMAND, RUNNING_BANNER,
};

use super::{Link, Recv};

const PASTE_BANNER: &str = "paste mode; Ctrl-C to cancel, Ctrl-D to finish";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    /// The foreground task owns the device; only Ctrl-C gets through.
    Running,
    Command,
    Paste,
    /// Receiving a file for the storage helper.
    Upload(String),
}

#[derive(Debug)]
struct SimState {
    mode: Mode,
    line: String,
    pasted: Vec<String>,
    outbox: VecDeque<u8>,
    closed: bool,
    echo_prints: bool,
    detached: bool,
    units: Vec<Vec<String>>,
    commands: Vec<String>,
    files: BTreeMap<String, String>,
    rtc: Option<[i64; 8]>,
}

impl SimState {
    fn new() -> Self {
        Self {
            mode: Mode::Running,
            line: String::new(),
            pasted: Vec::new(),
            outbox: VecDeque::new(),
            closed: false,
            echo_prints: true,
            detached: false,
            units: Vec::new(),
            commands: Vec::new(),
            files: BTreeMap::new(),
            rtc: None,
        }
    }

    fn out(&mut self, text: &str) {
        self.outbox.extend(text.as_bytes());
    }

    fn prompt(&mut self) {
        self.mode = Mode::Command;
        self.out(COMMAND_PROMPT);
    }

    fn feed(&mut self, byte: u8) {
        if self.closed {
            return;
        }
        match self.mode.clone() {
            Mode::Running => {
                if byte == INTERRUPT {
                    self.detached = false;
                    self.out("\r\nTraceback (most recent call last):\r\nKeyboardInterrupt: \r\n");
                    self.prompt();
                } else if byte == DETACH {
                    self.detached = true;
                }
            }
            Mode::Command => match byte {
                INTERRUPT => {
                    self.line.clear();
                    self.out("\r\nKeyboardInterrupt: \r\n");
                    self.prompt();
                }
                ENTER_PASTE => {
                    self.line.clear();
                    self.pasted.clear();
                    self.mode = Mode::Paste;
                    self.out(&format!("\r\n{PASTE_BANNER}\r\n{PASTE_PROMPT}"));
                }
                b'\r' => {
                    self.out("\r\n");
                    let line = std::mem::take(&mut self.line);
                    self.run_command(&line);
                }
                b'\n' => {}
                _ => {
                    self.line.push(byte as char);
                    self.outbox.push_back(byte);
                }
            },
            Mode::Paste | Mode::Upload(_) => match byte {
                INTERRUPT => {
                    self.line.clear();
                    self.pasted.clear();
                    self.out("\r\n");
                    self.prompt();
                }
                END_OF_INPUT => {
                    if !self.line.is_empty() {
                        let line = std::mem::take(&mut self.line);
                        self.pasted.push(line);
                    }
                    self.out("\r\n");
                    let lines = std::mem::take(&mut self.pasted);
                    self.finish_paste(lines);
                }
                b'\r' => {
                    let line = std::mem::take(&mut self.line);
                    self.pasted.push(line);
                    self.out(&format!("\r\n{PASTE_PROMPT}"));
                }
                b'\n' => {}
                _ => {
                    self.line.push(byte as char);
                    self.outbox.push_back(byte);
                }
            },
        }
    }

    fn finish_paste(&mut self, lines: Vec<String>) {
        if let Mode::Upload(name) = self.mode.clone() {
            let mut body = lines.join("\n");
            if !body.is_empty() {
                body.push('\n');
            }
            self.files.insert(name, body);
            self.prompt();
            return;
        }

        self.units.push(lines.clone());
        if lines.iter().any(|l| l.trim() == "machine.reset()") {
            // The device reboots and the link drops before any prompt.
            self.closed = true;
            return;
        }
        for line in &lines {
            if line.starts_with(char::is_whitespace) {
                continue;
            }
            let out = self.run_statement(line.trim());
            self.out(&out);
        }
        self.prompt();
    }

    fn run_command(&mut self, line: &str) {
        let line = line.trim();
        self.commands.push(line.to_string());
        if line == RESUME_COMMAND {
            self.mode = Mode::Running;
            self.out(&format!("{RUNNING_BANNER}\r\n"));
            return;
        }
        if let Some(name) = parse_upload_call(line) {
            self.pasted.clear();
            self.mode = Mode::Upload(name);
            self.out(PASTE_PROMPT);
            return;
        }
        let out = self.run_statement(line);
        self.out(&out);
        self.prompt();
    }

    /// Output produced by one top-level statement.
    fn run_statement(&mut self, stmt: &str) -> String {
        if stmt.is_empty() || stmt == "from shell import upload" || stmt.starts_with("import ") {
            return String::new();
        }
        if let Some(args) = call_args(stmt, "watch.rtc.set_localtime") {
            return match parse_tuple(args) {
                Some(t) => {
                    self.rtc = Some(t);
                    String::new()
                }
                None => "TypeError: expected 8-tuple\r\n".to_string(),
            };
        }
        if let Some(args) = call_args(stmt, "print") {
            if !self.echo_prints {
                return String::new();
            }
            if args == "watch.rtc.get_localtime()" {
                let t = self.rtc.unwrap_or([2000, 1, 1, 0, 0, 0, 5, 1]);
                return format!(
                    "({}, {}, {}, {}, {}, {}, {}, {})\r\n",
                    t[0], t[1], t[2], t[3], t[4], t[5], t[6], t[7]
                );
            }
            return match eval(args) {
                Some(Value::Str(s)) => format!("{s}\r\n"),
                Some(Value::Int(i)) => format!("{i}\r\n"),
                None => name_error(args),
            };
        }
        if stmt.starts_with("class ") || stmt.starts_with("def ") || stmt.contains('=') {
            return String::new();
        }
        match eval(stmt) {
            Some(Value::Str(s)) => format!("'{s}'\r\n"),
            Some(Value::Int(i)) => format!("{i}\r\n"),
            None => name_error(stmt),
        }
    }
}

enum Value {
    Str(String),
    Int(i64),
}

/// Adjacent string literals or a sum of integers; enough for what the
/// client sends.
fn eval(expr: &str) -> Option<Value> {
    let expr = expr.trim();
    if expr.starts_with('"') || expr.starts_with('\'') {
        let mut out = String::new();
        let mut rest = expr;
        while let Some(quote) = rest.chars().next() {
            if quote != '"' && quote != '\'' {
                return None;
            }
            let end = rest[1..].find(quote)? + 1;
            out.push_str(&rest[1..end]);
            rest = rest[end + 1..].trim_start();
        }
        return Some(Value::Str(out));
    }
    let mut total = 0i64;
    for term in expr.split('+') {
        total = total.checked_add(term.trim().parse::<i64>().ok()?)?;
    }
    Some(Value::Int(total))
}

fn name_error(expr: &str) -> String {
    format!(
        "Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\nNameError: name '{}' isn't defined\r\n",
        expr.split(|c: char| !c.is_alphanumeric() && c != '_')
            .next()
            .unwrap_or(expr)
    )
}

fn call_args<'a>(stmt: &'a str, func: &str) -> Option<&'a str> {
    stmt.strip_prefix(func)?
        .strip_prefix('(')?
        .strip_suffix(')')
}

fn parse_upload_call(line: &str) -> Option<String> {
    let arg = call_args(line, "upload")?.trim();
    let name = arg
        .strip_prefix('"')
        .and_then(|a| a.strip_suffix('"'))
        .or_else(|| arg.strip_prefix('\'').and_then(|a| a.strip_suffix('\'')))?;
    Some(name.to_string())
}

fn parse_tuple(args: &str) -> Option<[i64; 8]> {
    let inner = args.trim().strip_prefix('(')?.strip_suffix(')')?;
    let values = inner
        .split(',')
        .map(|v| v.trim().parse::<i64>().ok())
        .collect::<Option<Vec<_>>>()?;
    values.try_into().ok()
}

/// An in-memory interpreter speaking the watch's prompt protocol.
///
/// It starts the way a real device does: the transport banner is queued
/// and the foreground task is running, so a client has to interrupt it
/// before it gets a prompt. Everything the client pastes is recorded and
/// can be inspected afterwards.
///
/// ```
/// # use watch_repl::link::SimulatedWatch;
/// let watch = SimulatedWatch::new();
/// let link = watch.link();
/// # drop(link);
/// assert!(watch.units().is_empty());
/// ```
#[derive(Clone)]
pub struct SimulatedWatch {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedWatch {
    /// A device behind a bridge that has just printed its startup banner.
    pub fn new() -> Self {
        let watch = Self::silent();
        watch.push_output(&format!(
            "Connect to watch ...\r\n{CONNECT_BANNER}ed\r\n{CONSOLE_BANNER}\r\n"
        ));
        watch
    }

    /// A running device with nothing queued.
    pub fn silent() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panic while holding the lock only happens in a failing test.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn link(&self) -> SimLink {
        SimLink {
            state: Arc::clone(&self.state),
        }
    }

    /// Queue output as if the device had printed it earlier.
    pub fn push_output(&self, text: &str) {
        self.lock().out(text);
    }

    /// When disabled, `print` statements produce no output.
    pub fn set_echo_prints(&self, enabled: bool) {
        self.lock().echo_prints = enabled;
    }

    /// Drop the link, as if the device went out of range.
    pub fn disconnect(&self) {
        self.lock().closed = true;
    }

    /// Every compilation unit received through paste mode, in order.
    pub fn units(&self) -> Vec<Vec<String>> {
        self.lock().units.clone()
    }

    /// Lines entered at the command prompt, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Contents of a file written through the storage helper.
    pub fn file(&self, name: &str) -> Option<String> {
        self.lock().files.get(name).cloned()
    }

    pub fn rtc(&self) -> Option<[i64; 8]> {
        self.lock().rtc
    }

    pub fn is_running(&self) -> bool {
        self.lock().mode == Mode::Running
    }

    pub fn is_detached(&self) -> bool {
        self.lock().detached
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// The client's end of a [`SimulatedWatch`].
pub struct SimLink {
    state: Arc<Mutex<SimState>>,
}

impl Link for SimLink {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device gone"));
        }
        for &byte in data {
            state.feed(byte);
        }
        Ok(())
    }

    fn recv(&mut self, wait: Duration) -> io::Result<Recv> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !state.outbox.is_empty() {
                return Ok(Recv::Data(state.outbox.drain(..).collect()));
            }
            if state.closed {
                return Ok(Recv::Closed);
            }
        }
        thread::sleep(wait.min(Duration::from_millis(2)));
        Ok(Recv::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(link: &mut SimLink) -> String {
        let mut out = String::new();
        while let Ok(Recv::Data(bytes)) = link.recv(Duration::ZERO) {
            out.push_str(&String::from_utf8_lossy(&bytes));
        }
        out
    }

    #[test]
    fn running_device_ignores_input_until_interrupted() {
        let watch = SimulatedWatch::silent();
        let mut link = watch.link();
        link.send(b"print(1)\r").unwrap();
        assert_eq!(drain(&mut link), "");
        link.send(&[INTERRUPT]).unwrap();
        assert!(drain(&mut link).ends_with(COMMAND_PROMPT));
        assert!(!watch.is_running());
    }

    #[test]
    fn command_mode_echoes_and_prints() {
        let watch = SimulatedWatch::silent();
        let mut link = watch.link();
        link.send(&[INTERRUPT]).unwrap();
        drain(&mut link);
        link.send(b"print(\"AB\"\"CD\")\r").unwrap();
        assert_eq!(drain(&mut link), "print(\"AB\"\"CD\")\r\nABCD\r\n>>> ");
    }

    #[test]
    fn paste_mode_records_units() {
        let watch = SimulatedWatch::silent();
        let mut link = watch.link();
        link.send(&[INTERRUPT, ENTER_PASTE]).unwrap();
        link.send(b"x = 1\r    y = 2\r").unwrap();
        link.send(&[END_OF_INPUT]).unwrap();
        assert!(drain(&mut link).ends_with("=== \r\n>>> "));
        assert_eq!(watch.units(), vec![vec!["x = 1".to_string(), "    y = 2".to_string()]]);
    }

    #[test]
    fn machine_reset_closes_link() {
        let watch = SimulatedWatch::silent();
        let mut link = watch.link();
        link.send(&[INTERRUPT, ENTER_PASTE]).unwrap();
        link.send(b"import machine\rmachine.reset()\r").unwrap();
        link.send(&[END_OF_INPUT]).unwrap();
        drain(&mut link);
        assert_eq!(link.recv(Duration::ZERO).unwrap(), Recv::Closed);
        assert!(link.send(b"x").is_err());
    }

    #[test]
    fn eval_handles_literals_and_sums() {
        assert!(matches!(eval("1+1"), Some(Value::Int(2))));
        assert!(matches!(eval("\"ab\"'cd'"), Some(Value::Str(s)) if s == "abcd"));
        assert!(eval("foo()").is_none());
    }
}
