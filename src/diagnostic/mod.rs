pub mod ansi;
pub mod json;
mod source_map;

pub use source_map::SourceMap;

/// Byte range into the original source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
    #[allow(dead_code)] // forward infrastructure for lint-style diagnostics
    Warning,
}

#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
}

/// A renderer-independent report: compile errors carry a primary span into
/// the source; runtime errors carry the stack trace as notes.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub label: Option<Label>,
    pub notes: Vec<String>,
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            message: message.into(),
            label: None,
            notes: Vec::new(),
            source: None,
        }
    }

    pub fn with_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.label = Some(Label {
            span,
            message: label.into(),
        });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl From<&crate::vm::RuntimeError> for Diagnostic {
    fn from(e: &crate::vm::RuntimeError) -> Self {
        let mut d = Diagnostic::error(&e.message);
        for frame in &e.trace {
            d = d.with_note(format!("[line {}] in {}", frame.line, frame.name));
        }
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_attaches_span_and_notes() {
        let d = Diagnostic::error("Expect expression.")
            .with_span(Span { start: 3, end: 4 }, "here")
            .with_note("while parsing a statement");
        assert_eq!(d.message, "Expect expression.");
        assert_eq!(d.label.as_ref().unwrap().span.start, 3);
        assert_eq!(d.notes.len(), 1);
    }
}
