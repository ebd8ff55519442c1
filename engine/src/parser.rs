//! Tool-Call Parser (§4.3).
//!
//! Extracts `<tool id="NAME" k="v" ...>CONTENT</tool>` elements from
//! assistant text, interleaved with arbitrary non-XML text. Lenient:
//! malformed elements are skipped with a warning rather than raised.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedToolCall {
    pub id: String,
    pub name: String,
    pub attributes: HashMap<String, String>,
    pub content: String,
}

/// Parses every `<tool ...>...</tool>` element out of `text`. Never panics;
/// unparseable fragments are skipped and scanning continues from the next
/// byte after the offending token.
pub fn parse_tool_calls(text: &str) -> Vec<ParsedToolCall> {
    let mut out = Vec::new();
    let mut rest = text;
    let mut index = 0usize;

    loop {
        let Some(open_start) = rest.find("<tool") else {
            break;
        };
        // Require a tag boundary: "<tool" followed by whitespace or '>'.
        let after_tag = &rest[open_start + 5..];
        if !after_tag
            .chars()
            .next()
            .map(|c| c.is_whitespace() || c == '>')
            .unwrap_or(false)
        {
            rest = &rest[open_start + 5..];
            continue;
        }

        let Some(rel_open_end) = after_tag.find('>') else {
            tracing::warn!("tool-call parser: unmatched open tag, giving up on remainder");
            break;
        };
        let attrs_str = &after_tag[..rel_open_end];
        let after_open = &after_tag[rel_open_end + 1..];

        let Some(close_rel) = after_open.find("</tool>") else {
            tracing::warn!("tool-call parser: missing closing tag, skipping element");
            rest = after_open;
            continue;
        };
        let content = after_open[..close_rel].trim().to_string();
        rest = &after_open[close_rel + "</tool>".len()..];

        let attributes = parse_attributes(attrs_str);
        let Some(name) = attributes.get("id").cloned() else {
            let fragment: String = attrs_str.chars().take(200).collect();
            tracing::warn!("tool-call parser: tool element missing id attribute: {fragment}");
            continue;
        };

        let mut filtered = attributes;
        filtered.remove("id");

        out.push(ParsedToolCall {
            id: format!("{name}-{index}"),
            name,
            attributes: filtered,
            content,
        });
        index += 1;
    }

    out
}

/// Parses `k1="v1" k2="v2"` style attributes. Tolerates any order and extra
/// whitespace; attributes it can't parse are dropped silently.
fn parse_attributes(s: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let key_start = i;
        while i < bytes.len() && bytes[i] != b'=' && !bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if key_start == i {
            break;
        }
        let key = &s[key_start..i];
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] != b'=' {
            continue;
        }
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] != b'"' {
            continue;
        }
        i += 1;
        let val_start = i;
        while i < bytes.len() && bytes[i] != b'"' {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let val = &s[val_start..i];
        i += 1;
        map.insert(key.to_string(), val.to_string());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_tool_call() {
        let calls = parse_tool_calls(r#"<tool id="list_files" path="/tmp">ignored</tool>"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "list_files-0");
        assert_eq!(calls[0].name, "list_files");
        assert_eq!(calls[0].attributes.get("path").unwrap(), "/tmp");
        assert_eq!(calls[0].content, "ignored");
    }

    #[test]
    fn indexes_multiple_calls_in_order() {
        let calls = parse_tool_calls(
            r#"pre <tool id="a">1</tool> mid <tool id="b">2</tool> post"#,
        );
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "a-0");
        assert_eq!(calls[1].id, "b-1");
    }

    #[test]
    fn skips_element_missing_id_attribute() {
        let calls = parse_tool_calls(r#"<tool path="/tmp">x</tool><tool id="ok">y</tool>"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "ok");
    }

    #[test]
    fn tolerates_unmatched_open_tag() {
        let calls = parse_tool_calls(r#"<tool id="a">unterminated"#);
        assert!(calls.is_empty());
    }

    #[test]
    fn tolerates_interleaved_free_text() {
        let calls = parse_tool_calls("Let me check that.\n<tool id=\"x\">body</tool>\nDone.");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].content, "body");
    }

    #[test]
    fn empty_text_yields_no_calls() {
        assert!(parse_tool_calls("").is_empty());
        assert!(parse_tool_calls("just plain text").is_empty());
    }

    #[test]
    fn attribute_order_does_not_matter() {
        let calls = parse_tool_calls(r#"<tool path="/tmp" id="x">c</tool>"#);
        assert_eq!(calls[0].name, "x");
        assert_eq!(calls[0].attributes.get("path").unwrap(), "/tmp");
    }
}
