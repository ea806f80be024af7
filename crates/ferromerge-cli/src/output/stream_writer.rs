use std::io::Write;

use ferromerge_core::UtcDateTime;
use serde::Serialize;
use serde_json::Value;

use crate::error::CliError;

/// Event kinds emitted by long-running commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    Start,
    Status,
    Report,
    End,
}

#[derive(Debug, Serialize)]
struct StreamEvent<'a> {
    event: StreamEventType,
    seq: u64,
    ts: UtcDateTime,
    data: &'a Value,
}

/// Writes one JSON event per line and flushes after each.
pub struct NdjsonStreamWriter<W: Write> {
    writer: W,
    next_seq: u64,
}

impl<W: Write> NdjsonStreamWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            next_seq: 1,
        }
    }

    pub fn emit(&mut self, event: StreamEventType, data: &Value) -> Result<(), CliError> {
        let event = StreamEvent {
            event,
            seq: self.next_seq,
            ts: UtcDateTime::now(),
            data,
        };
        self.next_seq += 1;

        let payload = serde_json::to_string(&event)?;
        self.writer.write_all(payload.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
