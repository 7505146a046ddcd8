//! Content preprocessing for embedding generation and keyword matching.
//!
//! Question bodies are stored either as legacy HTML or as block-editor JSON:
//!
//! ```json
//! {"blocks": [{"type": "paragraph", "data": {"text": "Hello <b>there</b>"}}]}
//! ```
//!
//! Both are flattened to plain text, one line per block.

use scraper::Html;
use serde_json::Value;

/// Flattens stored question content to plain text.
///
/// Block JSON is tried first, then HTML. Non-blank input never produces an
/// empty string.
pub fn extract_text(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if let Some(text) = extract_blocks(trimmed) {
        if !text.is_empty() {
            return text;
        }
    }

    let stripped = strip_html(trimmed);
    if !stripped.is_empty() {
        return stripped;
    }

    collapse_whitespace(trimmed)
}

/// Provider input for a question: title and body separated by a blank line.
/// Returns `None` if both are empty after trimming.
pub fn embedding_input(title: &str, content: &str) -> Option<String> {
    let title = title.trim();
    let body = extract_text(content);

    match (title.is_empty(), body.is_empty()) {
        (true, true) => None,
        (false, true) => Some(title.to_string()),
        (true, false) => Some(body),
        (false, false) => Some(format!("{title}\n\n{body}")),
    }
}

/// First `max_chars` characters of `text`. Never splits a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Short plain-text preview of stored content.
pub fn excerpt(content: &str, max_chars: usize) -> String {
    let text = extract_text(content).replace('\n', " ");
    let cut = truncate_chars(&text, max_chars);
    if cut.len() < text.len() {
        format!("{}...", cut.trim_end())
    } else {
        text
    }
}

fn extract_blocks(raw: &str) -> Option<String> {
    if !raw.starts_with('{') && !raw.starts_with('[') {
        return None;
    }

    let value: Value = serde_json::from_str(raw).ok()?;
    let blocks = match &value {
        Value::Array(blocks) => blocks,
        Value::Object(doc) => doc.get("blocks")?.as_array()?,
        _ => return None,
    };

    let lines = blocks
        .iter()
        .filter_map(block_text)
        .map(|text| normalize_lines(&text))
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>();

    Some(lines.join("\n"))
}

fn block_text(block: &Value) -> Option<String> {
    let kind = block.get("type")?.as_str()?;
    let data = block.get("data")?;
    let text = |key: &str| data.get(key).and_then(Value::as_str).map(strip_html);

    let out = match kind {
        "paragraph" | "header" => text("text")?,
        "quote" => join_present([text("text"), text("caption")], "\n"),
        "list" | "checklist" => data
            .get("items")
            .and_then(Value::as_array)
            .map(|items| list_items(items))?,
        // verbatim, identifiers and comments stay searchable
        "code" => data.get("code")?.as_str()?.to_string(),
        "linkTool" | "link" => {
            let meta = data.get("meta");
            let meta_text = |key: &str| {
                meta.and_then(|m| m.get(key))
                    .and_then(Value::as_str)
                    .map(strip_html)
            };
            join_present(
                [
                    data.get("link").and_then(Value::as_str).map(str::to_string),
                    meta_text("title"),
                    meta_text("description"),
                ],
                "\n",
            )
        }
        "table" => data
            .get("content")
            .and_then(Value::as_array)?
            .iter()
            .filter_map(Value::as_array)
            .map(|row| {
                row.iter()
                    .filter_map(Value::as_str)
                    .map(strip_html)
                    .filter(|cell| !cell.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .filter(|row| !row.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => text("text")?,
    };

    Some(out)
}

fn list_items(items: &[Value]) -> String {
    let mut lines = Vec::new();
    for item in items {
        match item {
            Value::String(s) => lines.push(strip_html(s)),
            Value::Object(obj) => {
                if let Some(s) = obj
                    .get("content")
                    .or_else(|| obj.get("text"))
                    .and_then(Value::as_str)
                {
                    lines.push(strip_html(s));
                }
                if let Some(nested) = obj.get("items").and_then(Value::as_array) {
                    lines.push(list_items(nested));
                }
            }
            _ => {}
        }
    }
    lines.retain(|line| !line.is_empty());
    lines.join("\n")
}

fn join_present<const N: usize>(parts: [Option<String>; N], sep: &str) -> String {
    parts
        .into_iter()
        .flatten()
        .filter(|p| !p.trim().is_empty())
        .collect::<Vec<_>>()
        .join(sep)
}

/// Drops tags and decodes entities. Text nodes are joined with spaces.
fn strip_html(html: &str) -> String {
    if !html.contains('<') && !html.contains('&') {
        return normalize_lines(html);
    }

    let fragment = Html::parse_fragment(html);
    let text = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    normalize_lines(&text)
}

/// Collapses whitespace inside each line and drops blank lines.
fn normalize_lines(text: &str) -> String {
    text.lines()
        .map(collapse_whitespace)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_input() {
        assert_eq!(extract_text(""), "");
        assert_eq!(extract_text("  \n\t "), "");
    }

    #[test]
    fn test_plain_text_passes_through() {
        assert_eq!(extract_text("  How   do I\n\n enrol? "), "How do I\nenrol?");
    }

    #[test]
    fn test_html_is_stripped() {
        let text = extract_text("<p>Where is the <b>library</b>?</p><p>Fish &amp; chips</p>");
        assert!(text.contains("library"));
        assert!(text.contains("Fish & chips"));
        assert!(!text.contains('<'));
    }

    #[test]
    fn test_blocks_object() {
        let content = r#"{
            "time": 1700000000,
            "blocks": [
                {"type": "header", "data": {"text": "Housing", "level": 2}},
                {"type": "paragraph", "data": {"text": "Can I <i>switch</i> rooms?"}},
                {"type": "quote", "data": {"text": "Rules apply", "caption": "Handbook"}},
                {"type": "code", "data": {"code": "fn main() { let x = 1; }"}}
            ]
        }"#;

        let text = extract_text(content);
        assert_eq!(
            text,
            "Housing\nCan I switch rooms?\nRules apply\nHandbook\nfn main() { let x = 1; }"
        );
    }

    #[test]
    fn test_bare_block_array() {
        let content = r#"[{"type":"paragraph","data":{"text":"just this"}}]"#;
        assert_eq!(extract_text(content), "just this");
    }

    #[test]
    fn test_lists_nested_and_checklist() {
        let content = r#"{"blocks":[
            {"type":"list","data":{"style":"unordered","items":["one", {"content":"two","items":[{"content":"two.a","items":[]}]}]}},
            {"type":"checklist","data":{"items":[{"text":"done","checked":true}]}}
        ]}"#;
        assert_eq!(extract_text(content), "one\ntwo\ntwo.a\ndone");
    }

    #[test]
    fn test_link_and_table() {
        let content = r#"{"blocks":[
            {"type":"linkTool","data":{"link":"https://uni.example/fees","meta":{"title":"Fees","description":"Tuition table"}}},
            {"type":"table","data":{"content":[["Term","Fee"],["Fall","<b>1200</b>"]]}}
        ]}"#;
        assert_eq!(
            extract_text(content),
            "https://uni.example/fees\nFees\nTuition table\nTerm Fee\nFall 1200"
        );
    }

    #[test]
    fn test_unknown_block_uses_text() {
        let content = r#"{"blocks":[{"type":"warning","data":{"text":"Careful","title":"x"}},{"type":"image","data":{"url":"a.png"}}]}"#;
        assert_eq!(extract_text(content), "Careful");
    }

    #[test]
    fn test_empty_blocks_fall_back_to_raw() {
        let content = r#"{"blocks":[]}"#;
        assert_eq!(extract_text(content), content);
    }

    #[test]
    fn test_non_block_json_is_kept() {
        assert_eq!(extract_text(r#"{"a": 1}"#), r#"{"a": 1}"#);
    }

    #[test]
    fn test_markup_only_keeps_raw() {
        assert_eq!(extract_text("<br/>"), "<br/>");
    }

    #[test]
    fn test_embedding_input() {
        assert_eq!(embedding_input("", "  "), None);
        assert_eq!(embedding_input(" Title ", ""), Some("Title".to_string()));
        assert_eq!(
            embedding_input("Title", "<p>Body</p>"),
            Some("Title\n\nBody".to_string())
        );
        assert_eq!(embedding_input("", "<p>Body</p>"), Some("Body".to_string()));
    }

    #[test]
    fn test_truncate_chars_respects_code_points() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
        assert_eq!(truncate_chars("日本語", 0), "");
    }

    #[test]
    fn test_excerpt() {
        assert_eq!(excerpt("<p>short</p>", 20), "short");
        assert_eq!(excerpt("one two three", 7), "one two...");
    }
}
