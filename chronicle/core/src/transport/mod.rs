//! Streaming Transport
//!
//! Wraps a producer of [`StreamItem`]s into the envelope protocol:
//!
//! ```text
//! start ─▶ data* ─▶ end     (producer finished)
//!                 └▶ error  (producer failed, or the stream timed out)
//! ```
//!
//! Exactly one `start` and exactly one terminal envelope per stream. Data
//! envelopes pass a per-stream token bucket ([`rate_limit`]) that delays
//! rather than drops. When the sink goes away the producer is dropped, which
//! halts whatever feeds it. A consumer that stops reading without going away
//! is given until the stream deadline (plus [`TERMINAL_GRACE`] for the
//! terminal envelope) before the stream is abandoned the same way.

pub mod ndjson;
pub mod rate_limit;

pub use ndjson::{NdjsonDecoder, NdjsonWriter, MAX_RECORD_SIZE};
pub use rate_limit::{EnvelopeRateLimiter, RateLimitConfig, RateLimitResult, RateLimitStats};

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::ErrorKind;

/// Extra time the terminal envelope gets past the stream deadline
pub const TERMINAL_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Errors
// ============================================================================

/// Streaming Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// The consumer went away
    #[error("stream consumer disconnected")]
    SinkClosed,

    /// A record exceeded the encoder limit
    #[error("record of {size} bytes exceeds the {max} byte limit")]
    RecordTooLarge {
        /// Encoded size
        size: usize,
        /// Limit
        max: usize,
    },

    /// Serialization failed
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    /// Writing to the consumer failed
    #[error("stream write failed: {0}")]
    Io(#[from] std::io::Error),

    /// The consumer stopped reading until the deadline passed
    #[error("stream consumer stopped reading after {envelopes} envelopes")]
    Stalled {
        /// Envelopes delivered before the stall
        envelopes: u64,
    },
}

// ============================================================================
// Envelopes
// ============================================================================

/// Envelope discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// First envelope of a stream
    Start,
    /// One produced item
    Data,
    /// Terminal, on failure
    Error,
    /// Terminal, on success
    End,
}

impl EnvelopeKind {
    /// Whether the stream closes after this envelope
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error | Self::End)
    }
}

/// One unit of the streaming protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    /// Envelope kind
    pub kind: EnvelopeKind,
    /// Position in the stream, from 0
    pub seq: u64,
    /// When the envelope was emitted
    pub timestamp: DateTime<Utc>,
    /// Kind-specific content
    pub payload: Value,
}

impl StreamEnvelope {
    fn new(kind: EnvelopeKind, seq: u64, payload: Value) -> Self {
        Self {
            kind,
            seq,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// A producer failure, carried into the terminal `error` envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFault {
    /// Error category
    pub kind: ErrorKind,
    /// Message
    pub message: String,
    /// Diagnostic output, such as a stderr excerpt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StreamFault {
    /// Build a fault
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    /// Attach diagnostic output
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl From<&crate::error::EngineError> for StreamFault {
    fn from(error: &crate::error::EngineError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            detail: error.detail().map(str::to_string),
        }
    }
}

/// What a producer yields
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// Becomes a `data` envelope
    Data(Value),
    /// Finish successfully; the value is merged into the `end` payload
    Finish(Value),
    /// Finish with an `error` envelope
    Fail(StreamFault),
}

/// Totals for one stream, reported in the terminal envelope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Envelopes emitted, terminal included
    pub envelopes: u64,
    /// Data envelopes delayed by the rate limiter
    pub throttled: u64,
}

// ============================================================================
// Sinks
// ============================================================================

/// Destination for envelopes
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    /// Deliver one envelope
    async fn send(&mut self, envelope: StreamEnvelope) -> Result<(), TransportError>;

    /// Resolves when the consumer has gone away
    ///
    /// The default never resolves; sinks that can observe disconnection
    /// override it.
    async fn closed(&self) {
        futures::future::pending::<()>().await;
    }
}

#[async_trait]
impl EnvelopeSink for mpsc::Sender<StreamEnvelope> {
    async fn send(&mut self, envelope: StreamEnvelope) -> Result<(), TransportError> {
        mpsc::Sender::send(self, envelope)
            .await
            .map_err(|_| TransportError::SinkClosed)
    }

    async fn closed(&self) {
        mpsc::Sender::closed(self).await;
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Transport settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Per-stream token bucket
    pub rate_limit: RateLimitConfig,
    /// Overall budget for one stream
    pub stream_timeout: Duration,
    /// Capacity of the envelope channel used by [`StreamTransport::spawn`]
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            stream_timeout: Duration::from_secs(600),
            channel_capacity: 64,
        }
    }
}

/// Channel-backed stream of envelopes from [`StreamTransport::spawn`]
///
/// Dropping it stops the transport task and the producer behind it.
#[derive(Debug)]
pub struct EnvelopeStream {
    envelopes: mpsc::Receiver<StreamEnvelope>,
}

impl Stream for EnvelopeStream {
    type Item = StreamEnvelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.envelopes.poll_recv(cx)
    }
}

struct Emitter<'a, S: ?Sized> {
    sink: &'a mut S,
    limiter: EnvelopeRateLimiter,
    seq: u64,
    started: Instant,
}

impl<S: EnvelopeSink + ?Sized> Emitter<'_, S> {
    /// Deliver one envelope, giving up at `by`
    async fn emit(
        &mut self,
        kind: EnvelopeKind,
        payload: Value,
        by: Instant,
    ) -> Result<(), TransportError> {
        match tokio::time::timeout_at(by, self.deliver(kind, payload)).await {
            Ok(delivered) => delivered,
            Err(_) => {
                tracing::warn!(envelopes = self.seq, kind = ?kind, "Stream consumer stalled");
                Err(TransportError::Stalled {
                    envelopes: self.seq,
                })
            }
        }
    }

    async fn deliver(&mut self, kind: EnvelopeKind, payload: Value) -> Result<(), TransportError> {
        if kind == EnvelopeKind::Data {
            self.limiter.acquire().await;
        }
        let envelope = StreamEnvelope::new(kind, self.seq, payload);
        self.sink.send(envelope).await?;
        self.seq += 1;
        Ok(())
    }

    /// Stats as they will stand once the terminal envelope is out
    fn closing_stats(&self) -> StreamStats {
        StreamStats {
            duration_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            envelopes: self.seq + 1,
            throttled: self.limiter.stats().throttled,
        }
    }
}

fn end_payload(summary: Value, stats: StreamStats) -> Value {
    let stats = json!(stats);
    match summary {
        Value::Object(mut map) => {
            map.insert("stats".to_string(), stats);
            Value::Object(map)
        }
        Value::Null => json!({ "stats": stats }),
        other => json!({ "summary": other, "stats": stats }),
    }
}

fn error_payload(fault: &StreamFault, stats: StreamStats) -> Value {
    json!({
        "kind": fault.kind,
        "message": fault.message,
        "retryable": fault.kind.is_retryable(),
        "detail": fault.detail,
        "stats": stats,
    })
}

async fn finish<S: EnvelopeSink + ?Sized>(
    emitter: &mut Emitter<'_, S>,
    summary: Value,
    by: Instant,
) -> Result<StreamStats, TransportError> {
    let stats = emitter.closing_stats();
    emitter
        .emit(EnvelopeKind::End, end_payload(summary, stats), by)
        .await?;
    tracing::debug!(
        envelopes = stats.envelopes,
        duration_ms = stats.duration_ms,
        "Stream ended"
    );
    Ok(stats)
}

/// Streaming Transport service
#[derive(Debug, Clone, Default)]
pub struct StreamTransport {
    config: Arc<TransportConfig>,
}

impl StreamTransport {
    /// Create a transport
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Drive `producer` into `sink` until a terminal envelope is written
    ///
    /// `start` becomes the payload of the `start` envelope. The producer is
    /// not polled again after it yields `Finish` or `Fail`, and it is dropped
    /// when this returns.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` when the sink fails, disconnects or stalls;
    /// no terminal envelope can be delivered in that case.
    pub async fn run<P, S>(
        &self,
        start: Value,
        producer: P,
        sink: &mut S,
    ) -> Result<StreamStats, TransportError>
    where
        P: Stream<Item = StreamItem> + Send,
        S: EnvelopeSink + ?Sized,
    {
        let started = Instant::now();
        let deadline = started + self.config.stream_timeout;
        let mut producer = std::pin::pin!(producer);
        let mut emitter = Emitter {
            sink,
            limiter: EnvelopeRateLimiter::new(self.config.rate_limit.clone()),
            seq: 0,
            started,
        };

        let terminal_by = || deadline.max(Instant::now() + TERMINAL_GRACE);

        emitter.emit(EnvelopeKind::Start, start, deadline).await?;

        loop {
            let next = tokio::select! {
                () = emitter.sink.closed() => {
                    tracing::debug!(envelopes = emitter.seq, "Stream consumer went away");
                    return Err(TransportError::SinkClosed);
                }
                next = tokio::time::timeout_at(deadline, producer.next()) => next,
            };

            match next {
                Ok(Some(StreamItem::Data(value))) => {
                    emitter.emit(EnvelopeKind::Data, value, deadline).await?;
                }
                Ok(Some(StreamItem::Finish(summary))) => {
                    return finish(&mut emitter, summary, terminal_by()).await;
                }
                Ok(None) => return finish(&mut emitter, Value::Null, terminal_by()).await,
                Ok(Some(StreamItem::Fail(fault))) => {
                    let stats = emitter.closing_stats();
                    tracing::warn!(kind = %fault.kind, message = %fault.message, "Stream failed");
                    let payload = error_payload(&fault, stats);
                    emitter.emit(EnvelopeKind::Error, payload, terminal_by()).await?;
                    return Ok(stats);
                }
                Err(_) => {
                    let stats = emitter.closing_stats();
                    let fault = StreamFault::new(
                        ErrorKind::StreamTimeout,
                        format!(
                            "stream exceeded its {}s timeout",
                            self.config.stream_timeout.as_secs()
                        ),
                    );
                    tracing::warn!(envelopes = emitter.seq, "Stream timed out");
                    let payload = error_payload(&fault, stats);
                    emitter.emit(EnvelopeKind::Error, payload, terminal_by()).await?;
                    return Ok(stats);
                }
            }
        }
    }

    /// Run the transport on its own task, returning the envelope stream
    pub fn spawn<P>(&self, start: Value, producer: P) -> EnvelopeStream
    where
        P: Stream<Item = StreamItem> + Send + 'static,
    {
        let (mut tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let transport = self.clone();
        tokio::spawn(async move {
            if let Err(error) = transport.run(start, producer, &mut tx).await {
                tracing::debug!(error = %error, "Stream stopped early");
            }
        });
        EnvelopeStream { envelopes: rx }
    }
}
