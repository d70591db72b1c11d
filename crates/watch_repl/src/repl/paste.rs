//! Paste-mode transfer of program text.
//!
//! In paste mode the interpreter accepts lines verbatim (no auto-indent)
//! and prints the `=== ` banner after every accepted line. Waiting for that
//! banner before sending the next line gives us back-pressure for free.

use std::io::Write;

use tracing::{debug, info};

use crate::error::ReplError;
use crate::protocol::{
    COMMAND_PROMPT, END_OF_INPUT, ENTER_PASTE, PASTE_LINE_PROMPT, PASTE_PROMPT,
};
use crate::session::Session;

use super::source::{is_class_boundary, SourceDocument};

/// Decides whether a line starts a new compilation unit.
pub type ChunkPredicate = fn(&str) -> bool;

/// Settings threaded through one upload.
pub struct UploadContext<'a> {
    /// When set, a matching line flushes the current unit first.
    pub chunk_boundary: Option<ChunkPredicate>,
    /// Log every line at info level instead of debug.
    pub verbose: bool,
    /// Receives program output as each unit finishes.
    pub mirror: Option<&'a mut dyn Write>,
}

impl<'a> UploadContext<'a> {
    /// Split at top-level classes.
    pub fn chunked() -> Self {
        Self {
            chunk_boundary: Some(is_class_boundary),
            verbose: false,
            mirror: None,
        }
    }

    pub fn unchunked() -> Self {
        Self {
            chunk_boundary: None,
            verbose: false,
            mirror: None,
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_mirror(mut self, mirror: Option<&'a mut dyn Write>) -> Self {
        self.mirror = mirror;
        self
    }

    fn emit(&mut self, output: &str) -> Result<(), ReplError> {
        if let Some(mirror) = self.mirror.as_mut() {
            if !output.is_empty() {
                mirror.write_all(output.as_bytes())?;
                mirror.flush()?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Paste-mode enter/exit cycles, i.e. compilation units.
    pub cycles: usize,
    pub lines_sent: usize,
    /// Program output captured when units were compiled and run.
    pub output: String,
}

pub fn enter_paste_mode(session: &mut Session) -> Result<(), ReplError> {
    session.send(&[ENTER_PASTE])?;
    session.expect(PASTE_PROMPT)?;
    Ok(())
}

/// Send one line and wait until the interpreter has taken it.
pub fn send_line(session: &mut Session, text: &str) -> Result<(), ReplError> {
    session.send_line(text)?;
    session.expect(PASTE_LINE_PROMPT)?;
    Ok(())
}

/// Leave paste mode, returning whatever the pasted code printed.
pub fn exit_paste_mode(session: &mut Session) -> Result<String, ReplError> {
    session.send(&[END_OF_INPUT])?;
    let m = session.expect(COMMAND_PROMPT)?;
    Ok(m.before)
}

/// Stream `lines` into an already active paste session.
///
/// Paste mode is still active on return. With chunking enabled, a boundary
/// line first flushes the unit collected so far (exit and re-enter), unless
/// nothing has been sent since the last entry.
pub fn paste_lines(
    session: &mut Session,
    lines: &[String],
    ctx: &mut UploadContext<'_>,
) -> Result<UploadReport, ReplError> {
    let mut report = UploadReport {
        cycles: 1,
        ..UploadReport::default()
    };
    let mut in_unit = 0usize;

    for line in lines {
        let boundary = ctx.chunk_boundary.is_some_and(|is_boundary| is_boundary(line));
        if boundary && in_unit > 0 {
            info!(lines = in_unit, "flushing unit");
            let output = exit_paste_mode(session)?;
            ctx.emit(&output)?;
            report.output.push_str(&output);
            enter_paste_mode(session)?;
            report.cycles += 1;
            in_unit = 0;
        }

        if ctx.verbose {
            info!(line = %line, "paste");
        } else {
            debug!(line = %line, "paste");
        }
        send_line(session, line)?;
        report.lines_sent += 1;
        in_unit += 1;
    }

    Ok(report)
}

/// Filter `doc` and paste it as one or more units.
pub fn upload_document(
    session: &mut Session,
    doc: &SourceDocument,
    ctx: &mut UploadContext<'_>,
) -> Result<UploadReport, ReplError> {
    let filtered = doc.filtered();
    debug!(
        raw = doc.len(),
        filtered = filtered.len(),
        "uploading document"
    );

    enter_paste_mode(session)?;
    let mut report = paste_lines(session, filtered.lines(), ctx)?;
    let output = exit_paste_mode(session)?;
    ctx.emit(&output)?;
    report.output.push_str(&output);

    info!(
        cycles = report.cycles,
        lines = report.lines_sent,
        "upload complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::SimulatedWatch;
    use crate::protocol::INTERRUPT;
    use pretty_assertions::assert_eq;

    fn at_prompt() -> (SimulatedWatch, Session) {
        let watch = SimulatedWatch::silent();
        let mut session = Session::new(Box::new(watch.link()));
        session.send(&[INTERRUPT]).unwrap();
        session.expect(COMMAND_PROMPT).unwrap();
        (watch, session)
    }

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    #[test]
    fn unchunked_upload_is_one_unit() {
        let (watch, mut session) = at_prompt();
        let doc = SourceDocument::from_text("class A:\n    x = 1\nclass B:\n    y = 2\n");
        let report =
            upload_document(&mut session, &doc, &mut UploadContext::unchunked()).unwrap();
        assert_eq!(report.cycles, 1);
        assert_eq!(report.lines_sent, 4);
        assert_eq!(watch.units().len(), 1);
    }

    #[test]
    fn boundary_at_start_does_not_flush_empty_unit() {
        let (watch, mut session) = at_prompt();
        enter_paste_mode(&mut session).unwrap();
        let report = paste_lines(
            &mut session,
            &lines("class A:\n    pass"),
            &mut UploadContext::chunked(),
        )
        .unwrap();
        exit_paste_mode(&mut session).unwrap();
        assert_eq!(report.cycles, 1);
        assert_eq!(watch.units(), vec![lines("class A:\n    pass")]);
    }

    #[test]
    fn n_boundaries_give_n_plus_one_cycles() {
        for n in 0..4 {
            let (watch, mut session) = at_prompt();
            let mut text = String::from("import wasp\n");
            for i in 0..n {
                text.push_str(&format!("class C{i}:\n    def f(self):\n        return {i}\n"));
            }
            let doc = SourceDocument::from_text(&text);
            let report =
                upload_document(&mut session, &doc, &mut UploadContext::chunked()).unwrap();
            assert_eq!(report.cycles, n + 1);
            assert_eq!(watch.units().len(), n + 1);
        }
    }

    #[test]
    fn mirror_receives_each_units_output() {
        let (_watch, mut session) = at_prompt();
        let doc = SourceDocument::from_text("print(\"one\")\nclass A:\n    pass\nprint(\"two\")\n");
        let mut out = Vec::new();
        let mut ctx = UploadContext::chunked().with_mirror(Some(&mut out as &mut dyn Write));
        let report = upload_document(&mut session, &doc, &mut ctx).unwrap();
        assert_eq!(report.cycles, 2);
        let seen = String::from_utf8(out).unwrap();
        assert!(seen.contains("one"), "{seen:?}");
        assert!(seen.contains("two"), "{seen:?}");
        assert_eq!(seen, report.output);
    }

    #[test]
    fn line_containing_prompt_text_waits_for_real_prompt() {
        let (watch, mut session) = at_prompt();
        enter_paste_mode(&mut session).unwrap();
        send_line(&mut session, "x = '=== '").unwrap();
        // The echo and the prompt after it were both consumed.
        assert_eq!(session.drain_pending(), "");
        send_line(&mut session, "print(\"done\")").unwrap();
        let output = exit_paste_mode(&mut session).unwrap();
        assert_eq!(output.trim(), "done");
        assert_eq!(watch.units(), vec![lines("x = '=== '\nprint(\"done\")")]);
    }

    #[test]
    fn closed_link_aborts_upload() {
        let (watch, mut session) = at_prompt();
        enter_paste_mode(&mut session).unwrap();
        watch.disconnect();
        let err = send_line(&mut session, "x = 1").unwrap_err();
        assert!(matches!(err, ReplError::Closed { .. }), "{err:?}");
    }
}
