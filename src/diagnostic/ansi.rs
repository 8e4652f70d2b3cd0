use super::{Diagnostic, Severity, SourceMap};

pub struct AnsiRenderer {
    pub use_color: bool,
}

impl AnsiRenderer {
    fn bold(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[1m{s}\x1b[0m") } else { s.to_string() }
    }

    fn bold_red(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[1;31m{s}\x1b[0m") } else { s.to_string() }
    }

    fn cyan(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[36m{s}\x1b[0m") } else { s.to_string() }
    }

    fn dim(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[2m{s}\x1b[0m") } else { s.to_string() }
    }

    pub fn render(&self, d: &Diagnostic) -> String {
        let mut out = String::new();

        let severity_label = match d.severity {
            Severity::Error => self.bold_red("error"),
            Severity::Warning => self.bold(&self.cyan("warning")),
        };
        out.push_str(&format!("{}: {}\n", severity_label, self.bold(&d.message)));

        // Primary label with a source snippet, when the source is attached.
        if let (Some(label), Some(source)) = (&d.label, &d.source) {
            let map = SourceMap::new(source);
            let (line, col) = map.position(label.span.start);
            let line_text = map.line_text(source, line);

            out.push_str(&format!("  {} {}:{}\n", self.cyan("-->"), line, col));

            let gutter = line.to_string().len();
            let pipe = self.cyan("|");
            let pad = " ".repeat(gutter);

            out.push_str(&format!("{pad} {pipe}\n"));

            let line_num = self.cyan(&format!("{line:>gutter$}"));
            out.push_str(&format!("{line_num} {pipe} {line_text}\n"));

            let span_len = (label.span.end.saturating_sub(label.span.start)).max(1);
            let carets = self.bold_red(&"^".repeat(span_len));
            let indent = " ".repeat(col.saturating_sub(1));
            if label.message.is_empty() {
                out.push_str(&format!("{pad} {pipe} {indent}{carets}\n"));
            } else {
                out.push_str(&format!(
                    "{pad} {pipe} {indent}{carets} {}\n",
                    self.bold_red(&label.message)
                ));
            }

            out.push_str(&format!("{pad} {pipe}\n"));
        }

        for note in &d.notes {
            out.push_str(&format!("  {} {}\n", self.dim("="), note));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::Span;

    fn make_diag(source: &str, start: usize, end: usize) -> Diagnostic {
        Diagnostic::error("Expect ';' after value.")
            .with_span(Span { start, end }, "here")
            .with_source(source.to_string())
    }

    #[test]
    fn render_contains_error_and_message() {
        let r = AnsiRenderer { use_color: false };
        let out = r.render(&make_diag("print 1", 6, 7));
        assert!(out.contains("error:"), "missing 'error:' in:\n{out}");
        assert!(out.contains("Expect ';' after value."), "missing message in:\n{out}");
    }

    #[test]
    fn render_contains_location_and_snippet() {
        let r = AnsiRenderer { use_color: false };
        let out = r.render(&make_diag("print 1", 6, 7));
        assert!(out.contains("--> 1:7"), "missing location in:\n{out}");
        assert!(out.contains("print 1"), "missing source line in:\n{out}");
        assert!(out.contains('^'), "missing caret in:\n{out}");
    }

    #[test]
    fn caret_length_matches_span() {
        let r = AnsiRenderer { use_color: false };
        let d = Diagnostic::error("Undefined variable 'abc'.")
            .with_span(Span { start: 6, end: 9 }, "")
            .with_source("print abc;".to_string());
        let out = r.render(&d);
        assert!(out.contains("^^^"), "expected 3 carets in:\n{out}");
    }

    #[test]
    fn render_notes_for_stack_trace() {
        let r = AnsiRenderer { use_color: false };
        let d = Diagnostic::error("Operands must be numbers.")
            .with_note("[line 2] in inner")
            .with_note("[line 5] in script");
        let out = r.render(&d);
        assert!(out.contains("[line 2] in inner"), "missing trace note in:\n{out}");
        assert!(out.contains("[line 5] in script"), "missing trace note in:\n{out}");
    }

    #[test]
    fn render_no_source_still_works() {
        let r = AnsiRenderer { use_color: false };
        let out = r.render(&Diagnostic::error("Stack overflow."));
        assert!(out.contains("error: Stack overflow."));
        assert!(!out.contains("-->"));
    }

    #[test]
    fn color_toggle_controls_ansi_codes() {
        let d = make_diag("print 1", 6, 7);
        let with = AnsiRenderer { use_color: true }.render(&d);
        let without = AnsiRenderer { use_color: false }.render(&d);
        assert!(with.contains("\x1b["));
        assert!(!without.contains("\x1b["));
    }

    #[test]
    fn multiline_source_reports_correct_line() {
        let source = "var a = 1;\nvar b = ;";
        let r = AnsiRenderer { use_color: false };
        let d = Diagnostic::error("Expect expression.")
            .with_span(Span { start: 19, end: 20 }, "here")
            .with_source(source.to_string());
        let out = r.render(&d);
        assert!(out.contains("--> 2:"), "expected line 2 in:\n{out}");
        assert!(out.contains("var b = ;"), "expected second line in:\n{out}");
    }
}
