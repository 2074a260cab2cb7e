//! Newline-delimited JSON
//!
//! One JSON value per line, `\n` terminated. Used for envelopes on the wire
//! and for requests read off a socket.
//!
//! # Limits
//!
//! - Records larger than [`MAX_RECORD_SIZE`] are refused by the encoder
//! - The decoder reports an oversized line as one error and resynchronizes
//!   at the next newline, without buffering the rest of it

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{EnvelopeSink, StreamEnvelope, TransportError};
use crate::store::LineParseError;

/// Maximum encoded record size (10 MiB)
pub const MAX_RECORD_SIZE: usize = 10 * 1024 * 1024;

const MIN_BUFFER_CAPACITY: usize = 4096;

/// Encode a value as one `\n`-terminated line
///
/// # Errors
///
/// Returns `TransportError::Encode` if serialization fails and
/// `TransportError::RecordTooLarge` past [`MAX_RECORD_SIZE`].
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    let mut line = serde_json::to_vec(value)?;
    if line.len() > MAX_RECORD_SIZE {
        return Err(TransportError::RecordTooLarge {
            size: line.len(),
            max: MAX_RECORD_SIZE,
        });
    }
    line.push(b'\n');
    Ok(line)
}

/// Incremental line decoder
///
/// Feed bytes with [`push`](Self::push) as they arrive and pull decoded lines
/// with [`next_line`](Self::next_line). Blank lines are skipped but counted.
#[derive(Debug)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
    read_pos: usize,
    line: usize,
    max_line: usize,
    /// Inside an oversized line, discarding until the next newline
    discarding: bool,
}

impl Default for NdjsonDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl NdjsonDecoder {
    /// Decoder with the default line limit
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line(MAX_RECORD_SIZE)
    }

    /// Decoder refusing lines longer than `max_line` bytes
    #[must_use]
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            line: 0,
            max_line,
            discarding: false,
        }
    }

    /// Append received bytes
    pub fn push(&mut self, data: &[u8]) {
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet decoded
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Lines consumed so far, blank and malformed ones included
    #[must_use]
    pub fn lines_seen(&self) -> usize {
        self.line
    }

    /// Decode the next complete line
    ///
    /// Returns `None` when more data is needed.
    pub fn next_line(&mut self) -> Option<Result<Value, LineParseError>> {
        loop {
            let pending = &self.buffer[self.read_pos..];
            let Some(newline) = pending.iter().position(|&b| b == b'\n') else {
                if !self.discarding && pending.len() > self.max_line {
                    self.discarding = true;
                    self.line += 1;
                    self.read_pos = self.buffer.len();
                    return Some(Err(self.oversized()));
                }
                if self.discarding {
                    self.read_pos = self.buffer.len();
                }
                return None;
            };

            let start = self.read_pos;
            self.read_pos += newline + 1;
            if self.discarding {
                self.discarding = false;
                continue;
            }
            self.line += 1;
            if newline > self.max_line {
                return Some(Err(self.oversized()));
            }
            let raw = self.buffer[start..start + newline].trim_ascii();
            if raw.is_empty() {
                continue;
            }
            return Some(self.parse(raw));
        }
    }

    /// Decode a trailing line left without a terminator at end of input
    pub fn finish(&mut self) -> Option<Result<Value, LineParseError>> {
        if self.discarding {
            self.discarding = false;
            self.read_pos = self.buffer.len();
            return None;
        }
        let raw = self.buffer[self.read_pos..].trim_ascii().to_vec();
        self.read_pos = self.buffer.len();
        if raw.is_empty() {
            return None;
        }
        self.line += 1;
        Some(self.parse(&raw))
    }

    fn parse(&self, raw: &[u8]) -> Result<Value, LineParseError> {
        serde_json::from_slice(raw).map_err(|error| LineParseError {
            line: self.line,
            message: error.to_string(),
        })
    }

    fn oversized(&self) -> LineParseError {
        LineParseError {
            line: self.line,
            message: format!("line exceeds {} bytes", self.max_line),
        }
    }
}

/// [`EnvelopeSink`] writing NDJSON to any async writer
///
/// Flushes after every envelope so each one reaches the consumer as soon as
/// it is emitted.
#[derive(Debug)]
pub struct NdjsonWriter<W> {
    inner: W,
}

impl<W> NdjsonWriter<W> {
    /// Wrap a writer
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Unwrap the writer
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin + Send> NdjsonWriter<W> {
    /// Write any serializable record as one line
    ///
    /// # Errors
    ///
    /// Returns encode or write failures.
    pub async fn write_record<T: Serialize + Sync>(
        &mut self,
        record: &T,
    ) -> Result<(), TransportError> {
        let line = encode(record)?;
        self.inner.write_all(&line).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + Sync> EnvelopeSink for NdjsonWriter<W> {
    async fn send(&mut self, envelope: StreamEnvelope) -> Result<(), TransportError> {
        self.write_record(&envelope).await
    }
}
