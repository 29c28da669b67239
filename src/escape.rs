//! Escaping for the three embedding contexts a fragment passes through:
//! CDATA sections, HTML text and HTML attribute values.
//!
//! Every function here is total. None of them is safe to apply twice to
//! the same text; call each exactly once per context transition.

const CDATA_OPEN: &str = "<![CDATA[";
const CDATA_CLOSE: &str = "]]>";

/// Split `text` into CDATA section contents, none of which contains `]]>`.
///
/// Each terminator is cut after its `]]`, so the `>` starts the next
/// section. Concatenating the result yields `text` again. Always returns at
/// least one (possibly empty) section.
pub fn cdata_sections(text: &str) -> Vec<&str> {
    let mut sections = Vec::new();
    let mut start = 0;
    while let Some(pos) = text[start..].find(CDATA_CLOSE) {
        let split = start + pos + 2;
        sections.push(&text[start..split]);
        start = split;
    }
    sections.push(&text[start..]);
    sections
}

/// Escape `text` for placement between `<![CDATA[` and `]]>`.
///
/// `]]>` becomes `]]]]><![CDATA[>`: the open section is closed after `]]`
/// and a fresh one is opened in front of `>`.
pub fn escape_for_cdata(text: &str) -> String {
    cdata_sections(text).join(concat!("]]>", "<![CDATA["))
}

/// Wrap `text` as one logical CDATA payload (possibly several sections).
pub fn wrap_cdata(text: &str) -> String {
    format!("{CDATA_OPEN}{}{CDATA_CLOSE}", escape_for_cdata(text))
}

/// Concatenate the contents of a run of adjacent CDATA sections.
///
/// Whitespace between sections is ignored. Returns `None` if `raw` holds
/// anything other than CDATA sections, or none at all.
pub fn unwrap_cdata(raw: &str) -> Option<String> {
    let mut rest = raw.trim();
    if rest.is_empty() {
        return None;
    }
    let mut out = String::with_capacity(rest.len());
    while !rest.is_empty() {
        let body = rest.strip_prefix(CDATA_OPEN)?;
        let end = body.find(CDATA_CLOSE)?;
        out.push_str(&body[..end]);
        rest = body[end + CDATA_CLOSE.len()..].trim_start();
    }
    Some(out)
}

/// Escape text for an HTML text node.
pub fn escape_for_html_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Escape text for a quoted HTML attribute value.
pub fn escape_for_html_attribute(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}
