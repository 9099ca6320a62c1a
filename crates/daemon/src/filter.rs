//! Output filtering applied to session output before it is recorded or fanned out.
//!
//! The filter is an ordered table of literal rules. Rules run in declaration
//! order and each rule sees the output of the previous one, so a later rule
//! may match text introduced by an earlier rule.

use serde::{Deserialize, Serialize};

/// A single filtering rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterRule {
    /// Replace every occurrence of `from` with `to`.
    Replace { from: String, to: String },
    /// Remove every span that starts with `start` and ends with `end`
    /// (both inclusive). An unterminated span is left untouched.
    StripBetween { start: String, end: String },
}

impl FilterRule {
    /// Convenience constructor for a replacement rule.
    pub fn replace(from: impl Into<String>, to: impl Into<String>) -> Self {
        FilterRule::Replace {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Convenience constructor for a span-stripping rule.
    pub fn strip_between(start: impl Into<String>, end: impl Into<String>) -> Self {
        FilterRule::StripBetween {
            start: start.into(),
            end: end.into(),
        }
    }

    fn apply(&self, input: &str) -> String {
        match self {
            FilterRule::Replace { from, to } => {
                if from.is_empty() {
                    return input.to_string();
                }
                input.replace(from.as_str(), to)
            }
            FilterRule::StripBetween { start, end } => strip_spans(input, start, end),
        }
    }
}

fn strip_spans(input: &str, start: &str, end: &str) -> String {
    if start.is_empty() || end.is_empty() {
        return input.to_string();
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(begin) = rest.find(start) {
        let after_start = &rest[begin + start.len()..];
        match after_start.find(end) {
            Some(stop) => {
                out.push_str(&rest[..begin]);
                rest = &after_start[stop + end.len()..];
            }
            None => break,
        }
    }

    out.push_str(rest);
    out
}

/// The rule table used when the configuration does not provide one.
///
/// 1. drop carriage returns
/// 2. turn newlines into `<br>` for HTML observers
/// 3. turn the literal `\x1b` marker into a real ESC byte
/// 4. strip window-title sequences (`ESC ] 0 ;` and `ESC ] 2 ;` up to BEL)
///
/// Rule 4 must come after rule 3: title sequences written with the literal
/// marker only become strippable once the marker is converted.
pub fn default_rules() -> Vec<FilterRule> {
    vec![
        FilterRule::replace("\r", ""),
        FilterRule::replace("\n", "<br>"),
        FilterRule::replace("\\x1b", "\x1b"),
        FilterRule::strip_between("\x1b]0;", "\x07"),
        FilterRule::strip_between("\x1b]2;", "\x07"),
    ]
}

/// An ordered, immutable set of output rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFilter {
    rules: Vec<FilterRule>,
}

impl OutputFilter {
    /// Creates a filter that applies `rules` in the given order.
    pub fn new(rules: Vec<FilterRule>) -> Self {
        Self { rules }
    }

    /// A filter that passes output through unchanged.
    pub fn passthrough() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    /// Applies every rule in order.
    pub fn apply(&self, chunk: &str) -> String {
        let mut output = chunk.to_string();
        for rule in &self.rules {
            if output.is_empty() {
                break;
            }
            output = rule.apply(&output);
        }
        output
    }
}

impl Default for OutputFilter {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_chunk_stays_empty() {
        let filter = OutputFilter::default();
        assert_eq!(filter.apply(""), "");
    }

    #[test]
    fn test_crlf_becomes_br() {
        let filter = OutputFilter::new(vec![
            FilterRule::replace("\r", ""),
            FilterRule::replace("\n", "<br>"),
        ]);
        assert_eq!(filter.apply("hi\r\n"), "hi<br>");
    }

    #[test]
    fn test_deterministic() {
        let filter = OutputFilter::default();
        let input = "line one\r\n\\x1b[32mgreen\\x1b[0m\r\n";
        assert_eq!(filter.apply(input), filter.apply(input));
    }

    #[test]
    fn test_escape_marker_converted() {
        let filter = OutputFilter::default();
        assert_eq!(filter.apply("\\x1b[1mbold"), "\x1b[1mbold");
    }

    #[test]
    fn test_window_title_stripped() {
        let filter = OutputFilter::default();
        let input = "\x1b]0;user@host: ~\x07$ ls";
        assert_eq!(filter.apply(input), "$ ls");
    }

    #[test]
    fn test_title_written_with_marker_is_stripped() {
        // Only works because the marker rule runs before the title rule.
        let filter = OutputFilter::default();
        let input = "\\x1b]2;build\x07done";
        assert_eq!(filter.apply(input), "done");
    }

    #[test]
    fn test_rule_order_matters() {
        let forward = OutputFilter::new(vec![
            FilterRule::replace("a", "b"),
            FilterRule::replace("b", "c"),
        ]);
        let reverse = OutputFilter::new(vec![
            FilterRule::replace("b", "c"),
            FilterRule::replace("a", "b"),
        ]);
        assert_eq!(forward.apply("ab"), "cc");
        assert_eq!(reverse.apply("ab"), "bc");
    }

    #[test]
    fn test_unterminated_span_is_kept() {
        let filter = OutputFilter::new(vec![FilterRule::strip_between("[[", "]]")]);
        assert_eq!(filter.apply("a[[b]]c[[d"), "ac[[d");
    }

    #[test]
    fn test_multiple_spans_stripped() {
        let filter = OutputFilter::new(vec![FilterRule::strip_between("<", ">")]);
        assert_eq!(filter.apply("<x>1<y>2<z>"), "12");
    }

    #[test]
    fn test_empty_pattern_is_noop() {
        let filter = OutputFilter::new(vec![
            FilterRule::replace("", "x"),
            FilterRule::strip_between("", "]"),
        ]);
        assert_eq!(filter.apply("abc]"), "abc]");
    }

    #[test]
    fn test_passthrough() {
        let filter = OutputFilter::passthrough();
        assert_eq!(filter.apply("a\r\nb"), "a\r\nb");
        assert!(filter.rules().is_empty());
    }

    #[test]
    fn test_rules_deserialize_from_toml() {
        #[derive(Deserialize)]
        struct Table {
            rules: Vec<FilterRule>,
        }

        let table: Table = toml::from_str(
            r#"
[[rules]]
kind = "replace"
from = "\r"
to = ""

[[rules]]
kind = "strip_between"
start = "<"
end = ">"
"#,
        )
        .unwrap();

        assert_eq!(
            table.rules,
            vec![
                FilterRule::replace("\r", ""),
                FilterRule::strip_between("<", ">"),
            ]
        );
    }
}
