//! Scanner for server-sent event streams.
//!
//! Network chunks do not align with event boundaries, so the scanner keeps
//! a byte buffer between feeds and only emits events for complete lines.

use std::collections::VecDeque;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SseEvent {
    /// Content fragment from a `data:` payload.
    Content(String),
    /// The `[DONE]` sentinel ending the stream.
    Done,
}

#[derive(Debug, Default)]
pub(crate) struct SseScanner {
    buffer: Vec<u8>,
}

impl SseScanner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and collect the events completed by this chunk.
    /// A trailing partial line stays buffered for the next feed, and only
    /// complete lines are decoded, so a multi-byte character split across
    /// chunks comes out intact.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = parse_line(line.trim_end_matches(['\r', '\n'])) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    // Unparseable payloads are skipped rather than failing the stream.
    let chunk: StreamChunk = serde_json::from_str(data).ok()?;
    let content = chunk.choices.into_iter().next()?.delta.content?;
    if content.is_empty() {
        return None;
    }
    Some(SseEvent::Content(content))
}

/// Drain scanner output into a fragment queue, reporting whether the
/// `[DONE]` sentinel was seen.
pub(crate) fn collect_fragments(
    scanner: &mut SseScanner,
    chunk: &[u8],
    pending: &mut VecDeque<String>,
) -> bool {
    let mut done = false;
    for event in scanner.feed(chunk) {
        match event {
            SseEvent::Content(text) => pending.push_back(text),
            SseEvent::Done => done = true,
        }
    }
    done
}
