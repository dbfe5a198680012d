//! Prometheus text exposition line parser.
//!
//! Supports the sample shapes found in scrape payloads:
//!
//! - `name value [timestamp]`
//! - `name{label="value",...} value [timestamp]`
//! - `{label="value",...,__name__="name"} value [timestamp]`
//!
//! Comments (`#`) and blank lines yield `Ok(None)`. Anything after the
//! timestamp (exemplars, for instance) is ignored.
//!
//! The scanner walks the line by byte index through a small state machine,
//! allocating only for the returned sample. Every malformed input, including
//! truncated lines, produces a [`ParseError`].

use std::fmt;

use thiserror::Error;

use crate::sample::{Labels, METRIC_NAME_LABEL, Sample};

/// Reason a line could not be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// No metric name, neither before the label block nor as `__name__`.
    MissingName,
    /// A label entry starts with a delimiter instead of a name.
    EmptyLabelName,
    /// A label name is not followed by `=`.
    MissingEquals,
    /// A label value does not start with a double quote.
    MissingQuote,
    /// A quoted label value runs to the end of the line.
    UnterminatedValue,
    /// A label value is followed by something other than `,` or `}`.
    MissingDelimiter,
    /// The label block is never closed, or a brace appears outside of it.
    UnbalancedBraces,
    /// No value token after the name or label block.
    MissingValue,
    /// The value token is not a float.
    InvalidValue,
    /// The timestamp token is not an integer.
    InvalidTimestamp,
    /// The line is not valid UTF-8.
    InvalidUtf8,
}

impl ParseErrorKind {
    /// Short description used in error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingName => "missing metric name",
            Self::EmptyLabelName => "empty label name",
            Self::MissingEquals => "invalid labelName",
            Self::MissingQuote => "invalid labelValue",
            Self::UnterminatedValue => "unterminated labelValue",
            Self::MissingDelimiter => "invalid labelDelim",
            Self::UnbalancedBraces => "unbalanced braces",
            Self::MissingValue => "missing value",
            Self::InvalidValue => "invalid value",
            Self::InvalidTimestamp => "invalid timestamp",
            Self::InvalidUtf8 => "invalid utf-8",
        }
    }
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A malformed exposition line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {line}")]
pub struct ParseError {
    /// What went wrong.
    pub kind: ParseErrorKind,
    /// The offending raw line.
    pub line: String,
}

impl ParseError {
    fn new(kind: ParseErrorKind, line: &str) -> Self {
        Self {
            kind,
            line: line.to_string(),
        }
    }
}

/// Scanner states, in the order a well-formed line visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Name,
    LabelBlock,
    LabelName,
    LabelValue,
    Value,
    Timestamp,
}

/// Byte cursor over a trimmed line.
struct Scanner<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    /// Advance while `accept` holds and return the consumed slice.
    ///
    /// Stops only on ASCII bytes, so the slice bounds are char boundaries.
    fn take_while(&mut self, accept: impl Fn(u8) -> bool) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(&accept) {
            self.pos += 1;
        }
        &self.src[start..self.pos]
    }

    /// Metric name before an optional label block.
    fn take_metric_name(&mut self) -> &'a str {
        self.take_while(|b| !b.is_ascii_whitespace() && !matches!(b, b'{' | b'}'))
    }

    /// Label name inside a label block.
    fn take_label_name(&mut self) -> &'a str {
        self.take_while(|b| {
            !b.is_ascii_whitespace() && !matches!(b, b'=' | b',' | b'{' | b'}' | b'"')
        })
    }

    /// Body of a quoted value; the opening quote is already consumed.
    ///
    /// A backslash escapes the following byte, so `\"` never terminates the
    /// value. The body is returned verbatim, escapes included.
    fn take_quoted(&mut self) -> Option<&'a str> {
        let bytes = self.src.as_bytes();
        let start = self.pos;
        let mut i = start;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' => i += 2,
                b'"' => {
                    self.pos = i + 1;
                    return Some(&self.src[start..i]);
                }
                _ => i += 1,
            }
        }
        self.pos = bytes.len();
        None
    }

    /// Next whitespace-delimited token, empty at end of line.
    fn take_token(&mut self) -> &'a str {
        self.skip_whitespace();
        self.take_while(|b| !b.is_ascii_whitespace())
    }
}

/// Parse one exposition line.
///
/// Returns `Ok(None)` for blank lines and comments.
pub fn parse_line(line: &str) -> Result<Option<Sample>, ParseError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let err = |kind| ParseError::new(kind, line);
    let mut scanner = Scanner::new(trimmed);
    let mut state = State::Name;

    let mut name = "";
    let mut label_name = "";
    let mut labels = Labels::new();
    let mut value = 0.0;
    let mut timestamp_ms = None;

    loop {
        match state {
            State::Name => {
                name = scanner.take_metric_name();
                scanner.skip_whitespace();
                match scanner.peek() {
                    Some(b'{') => {
                        scanner.bump();
                        state = State::LabelBlock;
                    }
                    Some(b'}') => return Err(err(ParseErrorKind::UnbalancedBraces)),
                    _ => state = State::Value,
                }
            }
            State::LabelBlock => {
                scanner.skip_whitespace();
                match scanner.peek() {
                    Some(b'}') => {
                        scanner.bump();
                        state = State::Value;
                    }
                    Some(_) => state = State::LabelName,
                    None => return Err(err(ParseErrorKind::UnbalancedBraces)),
                }
            }
            State::LabelName => {
                label_name = scanner.take_label_name();
                if label_name.is_empty() {
                    return Err(err(ParseErrorKind::EmptyLabelName));
                }
                scanner.skip_whitespace();
                if scanner.peek() != Some(b'=') {
                    return Err(err(ParseErrorKind::MissingEquals));
                }
                scanner.bump();
                scanner.skip_whitespace();
                state = State::LabelValue;
            }
            State::LabelValue => {
                if scanner.peek() != Some(b'"') {
                    return Err(err(ParseErrorKind::MissingQuote));
                }
                scanner.bump();
                let label_value = scanner
                    .take_quoted()
                    .ok_or_else(|| err(ParseErrorKind::UnterminatedValue))?;

                if label_name == METRIC_NAME_LABEL {
                    name = label_value;
                } else {
                    labels.insert(label_name.to_string(), label_value.to_string());
                }

                scanner.skip_whitespace();
                match scanner.peek() {
                    Some(b',') => {
                        scanner.bump();
                        state = State::LabelBlock;
                    }
                    Some(b'}') => {
                        scanner.bump();
                        state = State::Value;
                    }
                    Some(_) => return Err(err(ParseErrorKind::MissingDelimiter)),
                    None => return Err(err(ParseErrorKind::UnbalancedBraces)),
                }
            }
            State::Value => {
                let token = scanner.take_token();
                if token.is_empty() {
                    return Err(err(ParseErrorKind::MissingValue));
                }
                if token.starts_with(['{', '}']) {
                    return Err(err(ParseErrorKind::UnbalancedBraces));
                }
                value = token
                    .parse::<f64>()
                    .map_err(|_| err(ParseErrorKind::InvalidValue))?;
                state = State::Timestamp;
            }
            State::Timestamp => {
                let token = scanner.take_token();
                if !token.is_empty() {
                    let ts = token
                        .parse::<i64>()
                        .map_err(|_| err(ParseErrorKind::InvalidTimestamp))?;
                    timestamp_ms = Some(ts);
                }
                break;
            }
        }
    }

    if name.is_empty() {
        return Err(err(ParseErrorKind::MissingName));
    }

    Ok(Some(Sample {
        name: name.to_string(),
        labels,
        value,
        timestamp_ms,
    }))
}

/// Parse a raw line that may not be valid UTF-8.
pub fn parse_line_bytes(line: &[u8]) -> Result<Option<Sample>, ParseError> {
    match std::str::from_utf8(line) {
        Ok(text) => parse_line(text),
        Err(_) => Err(ParseError::new(
            ParseErrorKind::InvalidUtf8,
            &String::from_utf8_lossy(line),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::canonical_key;

    fn parse(line: &str) -> Sample {
        parse_line(line)
            .unwrap_or_else(|e| panic!("failed to parse {line:?}: {e}"))
            .unwrap_or_else(|| panic!("{line:?} parsed as a comment"))
    }

    fn parse_err(line: &str) -> ParseErrorKind {
        match parse_line(line) {
            Err(e) => {
                assert_eq!(e.line, line);
                e.kind
            }
            Ok(s) => panic!("expected error for {line:?}, got {s:?}"),
        }
    }

    #[test]
    fn test_blank_and_comment_lines() {
        assert_eq!(parse_line(""), Ok(None));
        assert_eq!(parse_line("   "), Ok(None));
        assert_eq!(parse_line("# HELP metric help text"), Ok(None));
        assert_eq!(parse_line(" \t# TYPE metric counter"), Ok(None));
    }

    #[test]
    fn test_bare_name() {
        let s = parse("metric1 10");
        assert_eq!(s.name, "metric1");
        assert!(s.labels.is_empty());
        assert_eq!(s.value, 10.0);
        assert_eq!(s.timestamp_ms, None);
    }

    #[test]
    fn test_bare_name_with_timestamp() {
        let s = parse("metric2 10 1751041454000");
        assert_eq!(s.value, 10.0);
        assert_eq!(s.timestamp_ms, Some(1751041454000));
    }

    #[test]
    fn test_extra_whitespace() {
        let s = parse("metric3  10 ");
        assert_eq!(s.name, "metric3");
        assert_eq!(s.value, 10.0);
        assert_eq!(s.timestamp_ms, None);
    }

    #[test]
    fn test_label_block() {
        let s = parse(r#"metric4{code="200", method="GET"} 10"#);
        assert_eq!(s.name, "metric4");
        assert_eq!(canonical_key(&s.labels), r#"{code="200",method="GET"}"#);
    }

    #[test]
    fn test_spaces_around_label_tokens() {
        let s = parse(r#"metric5 { method = "GET", code = "200" } 10"#);
        assert_eq!(s.name, "metric5");
        assert_eq!(canonical_key(&s.labels), r#"{code="200",method="GET"}"#);
        assert_eq!(s.value, 10.0);
    }

    #[test]
    fn test_trailing_comma_and_exemplar() {
        let s = parse(r#"metric6{code="200", method="GET",}  10  1751041454000 # exemplar"#);
        assert_eq!(canonical_key(&s.labels), r#"{code="200",method="GET"}"#);
        assert_eq!(s.value, 10.0);
        assert_eq!(s.timestamp_ms, Some(1751041454000));
    }

    #[test]
    fn test_delimiters_inside_quoted_values() {
        let s = parse(r#"metric7{b="b", a="a,b,c" ,d="a=b", C="{\nA\"B"} 10"#);
        assert_eq!(s.name, "metric7");
        assert_eq!(
            canonical_key(&s.labels),
            r#"{C="{\nA\"B",a="a,b,c",b="b",d="a=b"}"#
        );
    }

    #[test]
    fn test_embedded_metric_name() {
        let s = parse(r#"{method="GET",code="200",__name__="metric8", foo=""} 10"#);
        assert_eq!(s.name, "metric8");
        assert!(!s.labels.contains_key("__name__"));
        assert_eq!(s.labels.get("foo"), Some(&String::new()));
        assert_eq!(canonical_key(&s.labels), r#"{code="200",method="GET"}"#);
    }

    #[test]
    fn test_embedded_name_wins() {
        let s = parse(r#"plain{__name__="embedded"} 1"#);
        assert_eq!(s.name, "embedded");
    }

    #[test]
    fn test_empty_label_block() {
        let s = parse("metric9{} 10");
        assert_eq!(s.name, "metric9");
        assert!(s.labels.is_empty());
    }

    #[test]
    fn test_escaped_backslash_before_closing_quote() {
        let s = parse(r#"m{path="C:\\"} 1"#);
        assert_eq!(s.labels.get("path").map(String::as_str), Some(r"C:\\"));
    }

    #[test]
    fn test_special_float_values() {
        assert_eq!(parse("m +Inf").value, f64::INFINITY);
        assert_eq!(parse("m -Inf").value, f64::NEG_INFINITY);
        assert!(parse("m NaN").value.is_nan());
        assert_eq!(parse("m 1.5e3").value, 1500.0);
        assert_eq!(parse("m -0.25").value, -0.25);
    }

    #[test]
    fn test_non_ascii_label_value() {
        let s = parse(r#"m{city="Zürich"} 1"#);
        assert_eq!(s.labels.get("city").map(String::as_str), Some("Zürich"));
    }

    #[test]
    fn test_malformed_corpus() {
        let cases = [
            (
                r#"nginx_ingress_controller_orphan_ingress{controller_class="k8s.io/nginx",controller_namespace="ingress-nginx",ingress="cm-acme-http-solver-chgl4"#,
                ParseErrorKind::UnterminatedValue,
            ),
            ("metric{label=", ParseErrorKind::MissingQuote),
            ("metric{label=   ", ParseErrorKind::MissingQuote),
            ("metric{label", ParseErrorKind::MissingEquals),
            ("metric{label=value} 10", ParseErrorKind::MissingQuote),
            (r#"metric{a="b" c="d"} 10"#, ParseErrorKind::MissingDelimiter),
            (r#"metric{a="b""#, ParseErrorKind::UnbalancedBraces),
            (r#"metric{a="b","#, ParseErrorKind::UnbalancedBraces),
            ("metric{", ParseErrorKind::UnbalancedBraces),
            (r#"metric{,a="b"} 1"#, ParseErrorKind::EmptyLabelName),
            (r#"metric{a="b"}} 1"#, ParseErrorKind::UnbalancedBraces),
            (r#"metric{a="b"} {1"#, ParseErrorKind::UnbalancedBraces),
            ("metric} 1", ParseErrorKind::UnbalancedBraces),
            ("}metric 1", ParseErrorKind::UnbalancedBraces),
            (r#"met}ric{a="b"} 1"#, ParseErrorKind::UnbalancedBraces),
            ("metric }", ParseErrorKind::UnbalancedBraces),
            (r#"metric{a="b\"} 1"#, ParseErrorKind::UnterminatedValue),
            (r#"metric{a="b\"#, ParseErrorKind::UnterminatedValue),
            ("metric", ParseErrorKind::MissingValue),
            (r#"metric{a="b"}"#, ParseErrorKind::MissingValue),
            ("metric ten", ParseErrorKind::InvalidValue),
            ("metric 10 soon", ParseErrorKind::InvalidTimestamp),
            ("metric 10 1.5", ParseErrorKind::InvalidTimestamp),
            (r#"{a="b"} 10"#, ParseErrorKind::MissingName),
        ];

        for (line, kind) in cases {
            assert_eq!(parse_err(line), kind, "line: {line}");
        }
    }

    #[test]
    fn test_every_truncation_is_handled() {
        let line = r#"http_requests_total{method="POST",path="/a\"b",code="200"} 1027 1395066363000"#;
        for end in 0..line.len() {
            if line.is_char_boundary(end) {
                // Must return, never panic.
                let _ = parse_line(&line[..end]);
            }
        }
    }

    #[test]
    fn test_invalid_utf8() {
        let err = parse_line_bytes(b"metric{a=\"\xff\"} 1").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::InvalidUtf8);
        assert!(parse_line_bytes(b"metric 1").unwrap().is_some());
    }

    #[test]
    fn test_error_message_carries_line() {
        let err = parse_line("metric ten").unwrap_err();
        assert_eq!(err.to_string(), "invalid value: metric ten");
    }
}
