use super::{Diagnostic, Severity, SourceMap};

/// Renders a diagnostic as a single JSON object (one line, NDJSON-friendly).
pub fn render(d: &Diagnostic) -> String {
    let severity = match d.severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
    };

    let mut obj = serde_json::json!({
        "severity": severity,
        "message": d.message,
        "notes": d.notes,
    });

    if let Some(label) = &d.label {
        let mut l = serde_json::json!({
            "start": label.span.start,
            "end": label.span.end,
            "message": label.message,
        });
        if let Some(source) = &d.source {
            let (line, col) = SourceMap::new(source).position(label.span.start);
            l["line"] = serde_json::Value::from(line);
            l["col"] = serde_json::Value::from(col);
        }
        obj["label"] = l;
    }

    serde_json::to_string(&obj).unwrap_or_else(|_| {
        r#"{"severity":"error","message":"internal error serializing diagnostic"}"#.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::Span;

    fn parse_json(s: &str) -> serde_json::Value {
        serde_json::from_str(s).expect("valid JSON")
    }

    #[test]
    fn render_basic_error() {
        let out = render(&Diagnostic::error("Undefined variable 'a'."));
        let v = parse_json(&out);
        assert_eq!(v["severity"], "error");
        assert_eq!(v["message"], "Undefined variable 'a'.");
        assert!(v.get("label").is_none());
    }

    #[test]
    fn render_with_span_and_source() {
        let d = Diagnostic::error("Expect expression.")
            .with_span(Span { start: 8, end: 9 }, "here")
            .with_source("var x = ;".to_string());
        let v = parse_json(&render(&d));
        assert_eq!(v["label"]["start"], 8);
        assert_eq!(v["label"]["end"], 9);
        assert_eq!(v["label"]["line"], 1);
        assert_eq!(v["label"]["col"], 9);
    }

    #[test]
    fn render_label_without_source_has_no_line_col() {
        let d = Diagnostic::error("bad").with_span(Span { start: 5, end: 8 }, "here");
        let v = parse_json(&render(&d));
        assert!(v["label"].get("line").is_none());
        assert!(v["label"].get("col").is_none());
    }

    #[test]
    fn render_notes_preserved_in_order() {
        let d = Diagnostic::error("Operands must be numbers.")
            .with_note("[line 3] in f")
            .with_note("[line 9] in script");
        let v = parse_json(&render(&d));
        let notes = v["notes"].as_array().unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0], "[line 3] in f");
    }

    #[test]
    fn render_is_single_line() {
        let d = Diagnostic::error("x")
            .with_span(Span { start: 0, end: 1 }, "here")
            .with_source("line one\nline two".to_string());
        assert!(!render(&d).contains('\n'));
    }
}
