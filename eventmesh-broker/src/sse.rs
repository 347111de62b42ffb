use async_trait::async_trait;
use serde_json::Value;

use eventmesh_core::Result;

use crate::event::Event;

/// Transport seam for [`crate::Broker::run_stream`]: anything that can push
/// one wire frame to the client. HTTP handlers implement this over their
/// response body writer.
#[async_trait]
pub trait EventSink: Send {
    async fn send(&mut self, frame: String) -> Result<()>;
}

/// Render an event as one Server-Sent Events frame.
///
/// String payloads are written raw; everything else is compact JSON.
/// Multi-line payloads become one `data:` line each, per the SSE spec, so
/// the client-side parser reassembles them unchanged.
#[must_use]
pub fn format_event(event: &Event) -> String {
    let mut frame = String::new();

    if let Some(retry) = event.retry {
        frame.push_str(&format!("retry: {retry}\n"));
    }
    frame.push_str(&format!("event: {}\n", event.event_type));

    let data = match &event.data {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    for line in data.split('\n') {
        frame.push_str(&format!("data: {line}\n"));
    }

    frame.push('\n');
    frame
}
