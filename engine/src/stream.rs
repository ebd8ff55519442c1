//! Streaming Writer (§4.7): a push sink bound to one subscriber, delivering
//! incremental LLM bytes and named lifecycle events with keepalive and
//! disconnect detection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::EngineError;

/// One frame on the wire: `event: NAME\n` (optional) followed by `data:
/// STRING\n\n` (§6 "Streaming wire format").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub event: Option<&'static str>,
    pub data: String,
}

impl Frame {
    pub fn to_wire(&self) -> String {
        match self.event {
            Some(name) => format!("event: {name}\ndata: {}\n\n", self.data),
            None => format!("data: {}\n\n", self.data),
        }
    }
}

#[derive(Serialize)]
struct ChunkPayload<'a> {
    chunk: &'a str,
}

/// Push sink over a bounded channel. `done` flips to true on subscriber
/// disconnect (receiver dropped, or explicit `close`); both the driver loop
/// and the keepalive task observe it to exit promptly.
pub struct StreamingWriter {
    tx: mpsc::Sender<Frame>,
    done: Arc<AtomicBool>,
    first_write: Arc<AtomicBool>,
    first_write_notify: Arc<tokio::sync::Notify>,
}

impl StreamingWriter {
    /// Creates a writer/receiver pair. The receiver is the subscriber's
    /// handle; dropping it marks the writer `done`.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(buffer);
        let writer = StreamingWriter {
            tx,
            done: Arc::new(AtomicBool::new(false)),
            first_write: Arc::new(AtomicBool::new(false)),
            first_write_notify: Arc::new(tokio::sync::Notify::new()),
        };
        (writer, rx)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn mark_done(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    /// Emits a named event to the subscriber. Fails with a cancellation-class
    /// error if the subscriber is gone.
    pub async fn send_event(&self, name: &'static str, data: String) -> Result<(), EngineError> {
        if self.is_done() {
            return Err(EngineError::Cancellation);
        }
        let frame = Frame {
            event: Some(name),
            data,
        };
        self.tx.send(frame).await.map_err(|_| {
            self.mark_done();
            EngineError::Cancellation
        })
    }

    /// Writes raw bytes as a `message` event, JSON-wrapped as `{"chunk":
    /// "..."}`. Returns the byte count written. The first successful write
    /// per writer closes the first-write latch (§4.2 "First-byte state
    /// commit").
    pub async fn write(&self, bytes: &[u8]) -> Result<usize, EngineError> {
        if self.is_done() {
            return Err(EngineError::Cancellation);
        }
        let text = String::from_utf8_lossy(bytes);
        let payload = ChunkPayload { chunk: &text };
        let data = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
        let frame = Frame {
            event: Some("message"),
            data,
        };
        self.tx.send(frame).await.map_err(|_| {
            self.mark_done();
            EngineError::Cancellation
        })?;
        if !self.first_write.swap(true, Ordering::SeqCst) {
            self.first_write_notify.notify_waiters();
        }
        Ok(bytes.len())
    }

    /// Resolves once the first byte has actually been forwarded, or the
    /// writer is marked done (so waiters also unblock on cancellation).
    pub async fn wait_for_first_write(&self) {
        if self.first_write.load(Ordering::SeqCst) || self.is_done() {
            return;
        }
        self.first_write_notify.notified().await;
    }

    /// Runs a background keepalive timer until the subscriber disconnects.
    /// Spawns its own task; the returned handle can be aborted early.
    pub fn keepalive(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let writer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if writer.is_done() {
                    break;
                }
                if writer.tx.send(Frame { event: None, data: String::new() }).await.is_err() {
                    writer.mark_done();
                    break;
                }
            }
        })
    }

    pub fn close(&self) {
        self.mark_done();
    }
}

/// Renders a keepalive token per the wire format (`: keepalive\n\n`), used
/// by the transport layer when translating an empty-event `Frame` from
/// `keepalive()`.
pub fn keepalive_wire() -> &'static str {
    ": keepalive\n\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_with_event_renders_sse_format() {
        let frame = Frame {
            event: Some("state"),
            data: "{\"status\":\"WORKING\"}".to_string(),
        };
        assert_eq!(
            frame.to_wire(),
            "event: state\ndata: {\"status\":\"WORKING\"}\n\n"
        );
    }

    #[test]
    fn frame_without_event_omits_event_line() {
        let frame = Frame {
            event: None,
            data: "x".to_string(),
        };
        assert_eq!(frame.to_wire(), "data: x\n\n");
    }

    #[tokio::test]
    async fn write_wraps_bytes_as_chunk_json() {
        let (writer, mut rx) = StreamingWriter::channel(4);
        writer.write(b"hi").await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, Some("message"));
        assert_eq!(frame.data, "{\"chunk\":\"hi\"}");
    }

    #[tokio::test]
    async fn send_event_fails_after_subscriber_drops_receiver() {
        let (writer, rx) = StreamingWriter::channel(1);
        drop(rx);
        let err = writer.send_event("state", "x".into()).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancellation));
        assert!(writer.is_done());
    }

    #[tokio::test]
    async fn first_write_latch_fires_once() {
        let (writer, mut rx) = StreamingWriter::channel(4);
        let waiter = {
            let writer = Arc::new(writer);
            let w2 = Arc::clone(&writer);
            let handle = tokio::spawn(async move {
                w2.wait_for_first_write().await;
            });
            writer.write(b"a").await.unwrap();
            handle.await.unwrap();
            writer
        };
        rx.recv().await.unwrap();
        assert!(waiter.first_write.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn close_marks_done_and_rejects_further_writes() {
        let (writer, _rx) = StreamingWriter::channel(4);
        writer.close();
        let err = writer.write(b"x").await.unwrap_err();
        assert!(matches!(err, EngineError::Cancellation));
    }
}
