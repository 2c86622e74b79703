//! Downstream destinations for decoded events.
//!
//! The cycle hands each event to the sink as soon as it is decoded and
//! calls [`EventSink::flush`] before a blob's checkpoint is written, so a
//! checkpoint never covers events still sitting in a buffer.

use async_trait::async_trait;
use snafu::prelude::*;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, mpsc};

use crate::codec::Event;
use crate::config::{SinkConfig, SinkKind};
use crate::error::{ClosedSnafu, SerializeSnafu, SinkError, WriteSnafu};

/// A reference-counted event sink.
pub type EventSinkRef = Arc<dyn EventSink>;

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Accept one event.
    async fn accept(&self, event: Event) -> Result<(), SinkError>;

    /// Make everything accepted so far durable downstream.
    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Build the sink selected in configuration.
pub async fn from_config(config: &SinkConfig) -> Result<EventSinkRef, SinkError> {
    match (&config.kind, &config.path) {
        (SinkKind::File, Some(path)) => Ok(Arc::new(FileSink::open(path).await?)),
        // Validation guarantees file sinks carry a path.
        _ => Ok(Arc::new(StdoutSink::new())),
    }
}

/// Hands events to an in-process consumer over a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Event>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end of a channel with `capacity` slots.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn accept(&self, event: Event) -> Result<(), SinkError> {
        self.tx.send(event).await.ok().context(ClosedSnafu)
    }
}

/// Newline-delimited JSON over any async writer.
struct NdjsonWriter<W> {
    inner: Mutex<BufWriter<W>>,
}

impl<W: AsyncWrite + Unpin + Send> NdjsonWriter<W> {
    fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(BufWriter::new(writer)),
        }
    }

    async fn write(&self, event: &Event) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(event).context(SerializeSnafu)?;
        line.push(b'\n');
        self.inner
            .lock()
            .await
            .write_all(&line)
            .await
            .context(WriteSnafu)
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.inner.lock().await.flush().await.context(WriteSnafu)
    }
}

/// Writes events to standard output as NDJSON.
pub struct StdoutSink {
    writer: NdjsonWriter<tokio::io::Stdout>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            writer: NdjsonWriter::new(tokio::io::stdout()),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for StdoutSink {
    async fn accept(&self, event: Event) -> Result<(), SinkError> {
        self.writer.write(&event).await
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.writer.flush().await
    }
}

/// Appends events to a file as NDJSON.
pub struct FileSink {
    writer: NdjsonWriter<tokio::fs::File>,
}

impl FileSink {
    /// Open `path` for appending, creating it if needed.
    pub async fn open(path: &Path) -> Result<Self, SinkError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .context(WriteSnafu)?;
        Ok(Self {
            writer: NdjsonWriter::new(file),
        })
    }
}

#[async_trait]
impl EventSink for FileSink {
    async fn accept(&self, event: Event) -> Result<(), SinkError> {
        self.writer.write(&event).await
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.writer.flush().await?;
        self.writer
            .inner
            .lock()
            .await
            .get_ref()
            .sync_data()
            .await
            .context(WriteSnafu)
    }
}
