//! Server-sent events encoding.

use std::io;

use serde_json::Value;

use super::Renderer;
use crate::context::Context;
use crate::error::Result;

const EVENT_FIELDS: [&str; 4] = ["event", "id", "retry", "data"];

/// Writes `text/event-stream` frames.
///
/// The template name is used as the event name. If `data` is an object with
/// a `data` key and no keys other than `event`, `id`, `retry` and `data`, its
/// fields become the frame fields. An array writes one frame per element.
/// Non-string data is sent as JSON; multi-line strings become several `data:`
/// lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct SseRenderer;

impl Renderer for SseRenderer {
    fn render(&self, out: &mut dyn io::Write, name: &str, data: &Value, _ctx: &Context) -> Result<()> {
        match data {
            Value::Array(frames) => {
                for frame in frames {
                    write_frame(out, name, frame)?;
                }
                Ok(())
            }
            frame => write_frame(out, name, frame),
        }
    }

    fn content_type(&self) -> &'static str {
        "text/event-stream"
    }
}

fn write_frame(out: &mut dyn io::Write, name: &str, frame: &Value) -> Result<()> {
    let fields = frame.as_object().filter(|map| {
        map.contains_key("data") && map.keys().all(|k| EVENT_FIELDS.contains(&k.as_str()))
    });

    let (event, id, retry, data) = match fields {
        Some(map) => (
            map.get("event").and_then(Value::as_str).unwrap_or(name),
            map.get("id").map(field_text),
            map.get("retry").and_then(Value::as_u64),
            map.get("data").unwrap_or(&Value::Null),
        ),
        None => (name, None, None, frame),
    };

    if let Some(id) = id {
        writeln!(out, "id: {}", single_line(&id))?;
    }
    if !event.is_empty() {
        writeln!(out, "event: {}", single_line(event))?;
    }
    if let Some(retry) = retry {
        writeln!(out, "retry: {retry}")?;
    }
    for line in field_text(data).split('\n') {
        writeln!(out, "data: {}", line.trim_end_matches('\r'))?;
    }
    writeln!(out)?;
    Ok(())
}

fn field_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn single_line(text: &str) -> String {
    text.replace(['\r', '\n'], "")
}
