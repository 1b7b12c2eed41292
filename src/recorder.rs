//! The Recorder collaborator: opportunistic request/response persistence.
//! The core calls this interface but never depends on a concrete backend.

use serde::Serialize;
use time::OffsetDateTime;

/// A snapshot of one request/response exchange, emitted once headers (and
/// status) are known. Body bytes are reported separately via
/// [`Recorder::emit_update_body`] as they stream.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub id: u64,
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    pub is_https: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

/// Receives opportunistic updates about in-flight exchanges. A null
/// recorder disables recording entirely; the core must never treat the
/// absence of a recorder as an error.
pub trait Recorder: Send + Sync {
    fn emit_update(&self, record: &RequestRecord);
    fn emit_update_body(&self, id: u64, chunk: &[u8]);
}

/// The recorder used when no collaborator is configured. Every call is a
/// no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecorder;

impl Recorder for NullRecorder {
    fn emit_update(&self, _record: &RequestRecord) {}
    fn emit_update_body(&self, _id: u64, _chunk: &[u8]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_recorder_accepts_any_record_without_panicking() {
        let recorder = NullRecorder;
        let record = RequestRecord {
            id: 1,
            method: "GET".to_owned(),
            url: "http://example.invalid/".to_owned(),
            status: Some(200),
            is_https: false,
            started_at: OffsetDateTime::UNIX_EPOCH,
        };
        recorder.emit_update(&record);
        recorder.emit_update_body(1, b"hi");
    }
}
