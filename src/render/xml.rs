//! Minimal XML encoding of JSON values.
//!
//! The document root is `<response>`. Object keys become elements, array
//! items become `<item>` elements, and an array under an object key repeats
//! that key once per item. Characters that cannot appear in an element name
//! are replaced with `_`.

use serde_json::Value;

const HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;
const ROOT: &str = "response";

/// Encodes `value` as an XML document.
///
/// ```
/// use serde_json::json;
///
/// let xml = webx::render::xml::encode(&json!({"user": {"name": "ann", "tags": ["a", "b"]}}));
/// assert!(xml.ends_with(
///     "<response><user><name>ann</name><tags>a</tags><tags>b</tags></user></response>"
/// ));
/// ```
pub fn encode(value: &Value) -> String {
    let mut out = String::from(HEADER);
    element(&mut out, ROOT, value);
    out
}

fn element(out: &mut String, name: &str, value: &Value) {
    let name = element_name(name);
    match value {
        Value::Null => {
            out.push('<');
            out.push_str(&name);
            out.push_str("/>");
        }
        Value::Object(map) => {
            open(out, &name);
            for (key, child) in map {
                match child {
                    Value::Array(items) => {
                        for item in items {
                            element(out, key, item);
                        }
                    }
                    other => element(out, key, other),
                }
            }
            close(out, &name);
        }
        Value::Array(items) => {
            open(out, &name);
            for item in items {
                element(out, "item", item);
            }
            close(out, &name);
        }
        Value::String(s) => {
            open(out, &name);
            escape_into(out, s);
            close(out, &name);
        }
        scalar => {
            open(out, &name);
            out.push_str(&scalar.to_string());
            close(out, &name);
        }
    }
}

fn open(out: &mut String, name: &str) {
    out.push('<');
    out.push_str(name);
    out.push('>');
}

fn close(out: &mut String, name: &str) {
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn element_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .enumerate()
        .map(|(i, c)| {
            let valid = c.is_alphabetic()
                || c == '_'
                || (i > 0 && (c.is_ascii_digit() || c == '-' || c == '.'));
            if valid { c } else { '_' }
        })
        .collect();
    if name.is_empty() {
        name.push('_');
    }
    name
}

fn escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\t' | '\n' | '\r' => out.push(c),
            // Not allowed anywhere in an XML 1.0 document.
            '\u{0}'..='\u{1f}' | '\u{fffe}' | '\u{ffff}' => out.push(char::REPLACEMENT_CHARACTER),
            c => out.push(c),
        }
    }
}
