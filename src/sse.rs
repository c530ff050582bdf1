// ===============================
// src/sse.rs
// ===============================
//
// Incremental text/event-stream decoder.
// Bytes come in arbitrary chunks (a line, or even a UTF-8 char, may be
// split across two chunks), so we buffer raw bytes and only cut on line
// terminators. Handles LF, CRLF and bare CR.
// A leading UTF-8 BOM is skipped; a line longer than MAX_LINE is discarded.
//
use tracing::warn;

/// Longest line kept in the buffer before it is thrown away.
pub const MAX_LINE: usize = 1 << 20;

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// One dispatched server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    // previous chunk ended on '\r'; a leading '\n' in the next one belongs to it
    skip_lf: bool,
    // current line went past MAX_LINE; drop everything up to its terminator
    oversized: bool,
    seen_line: bool,
    event: Option<String>,
    id: Option<String>,
    // last id handed out, so an id-only event is reported once
    reported_id: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self { Self::default() }

    /// Feed one chunk; returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut out = Vec::new();
        let mut bytes = chunk;
        if self.skip_lf {
            if let Some(b'\n') = bytes.first() {
                bytes = &bytes[1..];
            }
            self.skip_lf = false;
        }
        let mut start = 0;
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'\n' | b'\r' => {
                    self.buf.extend_from_slice(&bytes[start..i]);
                    let line = std::mem::take(&mut self.buf);
                    let oversized = std::mem::take(&mut self.oversized) || line.len() > MAX_LINE;
                    if bytes[i] == b'\r' {
                        if i + 1 < bytes.len() {
                            if bytes[i + 1] == b'\n' {
                                i += 1;
                            }
                        } else {
                            self.skip_lf = true;
                        }
                    }
                    if oversized {
                        warn!(limit = MAX_LINE, "event-stream line too long, discarded");
                    } else if let Some(ev) = self.line(&line) {
                        out.push(ev);
                    }
                    start = i + 1;
                }
                _ => {}
            }
            i += 1;
        }
        self.buf.extend_from_slice(&bytes[start..]);
        if self.buf.len() > MAX_LINE {
            self.buf = Vec::new();
            self.oversized = true;
        }
        out
    }

    fn line(&mut self, mut raw: &[u8]) -> Option<SseEvent> {
        if !self.seen_line {
            self.seen_line = true;
            raw = raw.strip_prefix(BOM).unwrap_or(raw);
        }
        if raw.is_empty() {
            return self.dispatch();
        }
        let line = String::from_utf8_lossy(raw);
        if line.starts_with(':') {
            return None; // comment / keep-alive
        }
        let (name, value) = match line.find(':') {
            Some(p) => {
                let v = &line[p + 1..];
                (&line[..p], v.strip_prefix(' ').unwrap_or(v))
            }
            None => (&line[..], ""),
        };
        match name {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "id" if !value.contains('\0') => self.id = Some(value.to_string()),
            _ => {} // retry and unknown fields are ignored
        }
        None
    }

    /// Blank line. An event without data is only reported when it carries a
    /// new id, with empty `data`, so the caller can still resume from it.
    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            if self.id.is_none() || self.id == self.reported_id {
                return None;
            }
            self.reported_id = self.id.clone();
            return Some(SseEvent { event, id: self.id.clone(), data: String::new() });
        }
        let data = std::mem::take(&mut self.data).join("\n");
        self.reported_id = self.id.clone();
        Some(SseEvent { event, id: self.id.clone(), data })
    }
}
