pub mod clock;
pub mod paste;
pub mod source;
pub mod sync;

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ReplError;
use crate::protocol::{COMMAND_PROMPT, END_OF_INPUT, PASTE_PROMPT};
use crate::session::Session;

use paste::{UploadContext, UploadReport};
use source::SourceDocument;
use sync::{Synchronizer, TokenSource};

#[derive(Debug, Clone)]
pub struct ReplConfig {
    pub expect_timeout: Duration,
    pub sync_timeout: Duration,
    pub banner_timeout: Duration,
    pub verbose: bool,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            expect_timeout: Duration::from_secs(10),
            sync_timeout: Duration::from_secs(5),
            // BLE bridges can take a while to find the device.
            banner_timeout: Duration::from_secs(30),
            verbose: false,
        }
    }
}

/// Outcome of one operation, as reported by the CLI's `--json` mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpResponse {
    pub ok: bool,
    pub output: String,
    pub error: Option<String>,
}

impl OpResponse {
    /// Failed operations carry no output.
    pub fn from_result(result: &Result<String, ReplError>) -> Self {
        match result {
            Ok(output) => Self {
                ok: true,
                output: output.clone(),
                error: None,
            },
            Err(e) => Self {
                ok: false,
                output: String::new(),
                error: Some(e.to_string()),
            },
        }
    }
}

/// Runs operations against the interpreter over one [`Session`].
///
/// Every operation starts with a fresh [`Synchronizer::sync`]; operations
/// take `&mut self` and therefore never overlap.
pub struct ReplClient {
    session: Session,
    sync: Synchronizer,
    cfg: ReplConfig,
    output_mirror: Option<Box<dyn Write + Send>>,
}

impl ReplClient {
    pub fn new(mut session: Session, tokens: Box<dyn TokenSource>, cfg: ReplConfig) -> Self {
        session.set_timeout(cfg.expect_timeout);
        Self {
            session,
            sync: Synchronizer::new(tokens, cfg.sync_timeout),
            cfg,
            output_mirror: None,
        }
    }

    /// Stream program output here while `execute` runs.
    pub fn set_output_mirror(&mut self, mirror: Option<Box<dyn Write + Send>>) {
        self.output_mirror = mirror;
    }

    /// Wait for the transport's startup banner.
    pub fn connect(&mut self) -> Result<(), ReplError> {
        self.sync
            .await_banner(&mut self.session, self.cfg.banner_timeout)
    }

    pub fn sync(&mut self) -> Result<(), ReplError> {
        self.sync.sync(&mut self.session)
    }

    /// Hand the device back to its foreground task.
    pub fn release(&mut self) -> Result<(), ReplError> {
        self.sync.unsync(&mut self.session)
    }

    /// Give up the session, e.g. for an interactive console.
    pub fn into_session(self) -> Session {
        self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Evaluate one line and return what it printed.
    pub fn evaluate(&mut self, expression: &str) -> Result<String, ReplError> {
        info!(expression, "evaluate");
        self.sync()?;
        paste::enter_paste_mode(&mut self.session)?;
        paste::send_line(&mut self.session, expression)?;
        let output = paste::exit_paste_mode(&mut self.session)?;
        Ok(output.trim().to_string())
    }

    /// Run a program, one top-level class per compilation unit.
    pub fn execute(&mut self, doc: &SourceDocument) -> Result<String, ReplError> {
        info!(lines = doc.len(), "execute");
        let report = self.execute_report(doc)?;
        Ok(report.output)
    }

    /// Like [`execute`](Self::execute), with transfer statistics.
    pub fn execute_report(&mut self, doc: &SourceDocument) -> Result<UploadReport, ReplError> {
        self.sync()?;
        let mut ctx = Self::context_for(&mut self.output_mirror, &self.cfg, true);
        paste::upload_document(&mut self.session, doc, &mut ctx)
    }

    fn context_for<'a>(
        mirror: &'a mut Option<Box<dyn Write + Send>>,
        cfg: &ReplConfig,
        chunked: bool,
    ) -> UploadContext<'a> {
        let ctx = if chunked {
            UploadContext::chunked()
        } else {
            UploadContext::unchunked()
        };
        let mirror = mirror.as_mut().map(|m| &mut **m as &mut dyn Write);
        ctx.with_verbose(cfg.verbose).with_mirror(mirror)
    }

    pub fn execute_file(&mut self, path: &Path) -> Result<String, ReplError> {
        let doc = SourceDocument::from_path(path)?;
        self.execute(&doc)
    }

    /// Store `doc` on the device as `name`.
    ///
    /// The storage helper treats end-of-input as end-of-file, so the body is
    /// streamed as a single unit.
    pub fn upload(&mut self, doc: &SourceDocument, name: &str) -> Result<UploadReport, ReplError> {
        info!(name, lines = doc.len(), "upload");
        self.sync()?;
        self.session.send_line("from shell import upload")?;
        self.session.expect(COMMAND_PROMPT)?;
        self.session.send_line(&format!("upload(\"{name}\")"))?;
        self.session.expect(PASTE_PROMPT)?;

        let filtered = doc.filtered();
        let mut ctx = Self::context_for(&mut self.output_mirror, &self.cfg, false);
        let mut report = paste::paste_lines(&mut self.session, filtered.lines(), &mut ctx)?;
        report.output.push_str(&paste::exit_paste_mode(&mut self.session)?);
        Ok(report)
    }

    /// Upload a local file under its base name.
    pub fn upload_file(&mut self, path: &Path) -> Result<UploadReport, ReplError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ReplError::Source {
                path: path.display().to_string(),
                reason: "no usable file name".to_string(),
            })?
            .to_string();
        let doc = SourceDocument::from_path(path)?;
        self.upload(&doc, &name)
    }

    /// Reboot the device. No prompt follows; the link usually drops.
    pub fn reset(&mut self) -> Result<(), ReplError> {
        info!("reset");
        self.sync()?;
        paste::enter_paste_mode(&mut self.session)?;
        paste::send_line(&mut self.session, "import machine")?;
        paste::send_line(&mut self.session, "machine.reset()")?;
        self.session.send(&[END_OF_INPUT])?;
        Ok(())
    }

    /// Set the device clock from local time, on a second boundary.
    pub fn set_clock(&mut self) -> Result<NaiveDateTime, ReplError> {
        self.sync()?;
        let now = clock::next_second();
        self.send_clock(&now)?;
        Ok(now)
    }

    pub fn set_clock_to(&mut self, t: &NaiveDateTime) -> Result<(), ReplError> {
        self.sync()?;
        self.send_clock(t)
    }

    fn send_clock(&mut self, t: &NaiveDateTime) -> Result<(), ReplError> {
        info!(time = %t, "set clock");
        self.session.send_line(&clock::set_localtime_command(t))?;
        self.session.expect(COMMAND_PROMPT)?;
        Ok(())
    }

    pub fn read_clock(&mut self) -> Result<NaiveDateTime, ReplError> {
        self.sync()?;
        let re = Regex::new(clock::LOCALTIME_PATTERN)?;
        self.session.send_line(clock::GET_LOCALTIME)?;
        let m = self.session.expect(re.clone())?;
        self.session.expect(COMMAND_PROMPT)?;
        let caps = re
            .captures(&m.matched)
            .ok_or_else(|| ReplError::Protocol(format!("unreadable clock {:?}", m.matched)))?;
        clock::parse_localtime(&caps)
    }
}
