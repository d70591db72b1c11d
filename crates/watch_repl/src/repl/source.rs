use std::path::Path;

use crate::error::ReplError;

const DOCSTRING_MARKERS: [&str; 2] = ["\"\"\"", "'''"];

/// Program text to be pasted, one entry per line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceDocument {
    lines: Vec<String>,
}

impl SourceDocument {
    pub fn from_text(text: &str) -> Self {
        Self {
            lines: text.lines().map(str::to_string).collect(),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ReplError> {
        let text = std::fs::read_to_string(path).map_err(|e| ReplError::Source {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_text(&text))
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Newline-joined text with a trailing newline (empty for no lines).
    pub fn to_text(&self) -> String {
        let mut text = self.lines.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        text
    }

    /// Drop what the interpreter does not need to see.
    ///
    /// Blank lines, comment-only lines and docstring blocks are removed and
    /// trailing whitespace is trimmed. Indentation is left untouched. The
    /// scan is line based and does not understand string literals, so a
    /// `#` or `"""` at the start of a line inside a multi-line string is
    /// treated as a comment or docstring too.
    pub fn filtered(&self) -> SourceDocument {
        let mut lines = Vec::with_capacity(self.lines.len());
        let mut docstring: Option<&str> = None;

        for raw in &self.lines {
            let line = raw.trim_end();
            let trimmed = line.trim_start();

            if let Some(marker) = docstring {
                if line.ends_with(marker) {
                    docstring = None;
                }
                continue;
            }
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Some(marker) = DOCSTRING_MARKERS.into_iter().find(|m| trimmed.starts_with(m)) {
                let rest = &trimmed[marker.len()..];
                if !rest.ends_with(marker) {
                    docstring = Some(marker);
                }
                continue;
            }
            lines.push(line.to_string());
        }

        SourceDocument { lines }
    }
}

/// Whether `line` opens a new top-level class.
///
/// Purely textual: any unindented line beginning with `class` counts.
pub fn is_class_boundary(line: &str) -> bool {
    line.starts_with("class")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn filter(text: &str) -> Vec<String> {
        SourceDocument::from_text(text).filtered().lines().to_vec()
    }

    #[test]
    fn drops_blanks_and_comments() {
        let text = "import watch\n\n# a comment\n    # indented comment\nx = 1  \n";
        assert_eq!(filter(text), vec!["import watch", "x = 1"]);
    }

    #[test]
    fn drops_multiline_docstring() {
        let text = r#"class App:
    """An application.

    More words here.
    """
    NAME = 'app'
"#;
        assert_eq!(filter(text), vec!["class App:", "    NAME = 'app'"]);
    }

    #[test]
    fn drops_single_line_and_single_quoted_docstrings() {
        let text = "def f():\n    \"\"\"One line.\"\"\"\n    '''\n    other\n    '''\n    return 1\n";
        assert_eq!(filter(text), vec!["def f():", "    return 1"]);
    }

    #[test]
    fn docstring_closing_on_text_line() {
        let text = "\"\"\"Module docs\nspanning lines.\"\"\"\nimport wasp\n";
        assert_eq!(filter(text), vec!["import wasp"]);
    }

    #[test]
    fn indentation_is_preserved() {
        let text = "if True:\n\tif True:\n\t\tpass\n";
        assert_eq!(filter(text), vec!["if True:", "\tif True:", "\t\tpass"]);
    }

    #[test]
    fn filtering_is_idempotent() {
        let docs = [
            "",
            "\n\n\n",
            "x = '''\n'''\ny = 2\n",
            "class A:\n    \"\"\"doc\"\"\"\n    # c\n    def f(self):\n        return 1\n\nclass B:\n    pass\n",
            "\"\"\"unterminated\nstill docs\n",
            "a = 1\r\n  \r\nb = 2\r\n",
        ];
        for text in docs {
            let once = SourceDocument::from_text(text).filtered();
            let twice = once.filtered();
            assert_eq!(once, twice, "not idempotent for {text:?}");
        }
    }

    #[test]
    fn crlf_input_is_handled() {
        assert_eq!(filter("a = 1\r\n\r\nb = 2\r\n"), vec!["a = 1", "b = 2"]);
    }

    #[test]
    fn to_text_round_trips_lines() {
        let doc = SourceDocument::from_text("a\n  b\n");
        assert_eq!(doc.to_text(), "a\n  b\n");
        assert_eq!(SourceDocument::default().to_text(), "");
    }

    #[test]
    fn class_boundary_is_textual() {
        assert!(is_class_boundary("class Foo:"));
        assert!(is_class_boundary("class Foo(Base):"));
        assert!(!is_class_boundary("    class Inner:"));
        assert!(!is_class_boundary("def f():"));
        // Known limitation: not a class, still matches.
        assert!(is_class_boundary("classes = []"));
    }

    #[test]
    fn missing_file_is_source_error() {
        let err = SourceDocument::from_path(Path::new("/nonexistent/app.py")).unwrap_err();
        assert!(matches!(err, ReplError::Source { .. }));
    }
}
