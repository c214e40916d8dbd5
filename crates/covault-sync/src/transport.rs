//! Connection abstraction for the peer transport.
//!
//! A connection moves opaque text frames. Implementations may use
//! WebSockets, TCP with line framing, or anything else that preserves
//! frame boundaries and order. The sink reports how many bytes it has
//! accepted but the other side has not consumed yet, which drives
//! backpressure in the outgoing queue.

use async_trait::async_trait;

use crate::error::Result;

/// Sending half of a connection.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Send one frame.
    async fn send(&self, frame: String) -> Result<()>;

    /// Bytes sent but not yet consumed by the other side.
    fn buffered_amount(&self) -> usize;

    fn is_open(&self) -> bool;

    /// Close the connection. Frames already sent are still delivered.
    async fn close(&self);
}

/// Receiving half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// The next frame, or `None` once the connection is closed.
    async fn next_frame(&mut self) -> Option<String>;
}

/// Both halves of a connection.
pub struct Connection {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

/// An in-memory connection pair for tests and same-process nodes.
///
/// Uses channels to simulate a socket.
pub mod memory {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    use crate::error::SyncError;

    /// Counters shared by one direction of the pair.
    #[derive(Default)]
    struct InFlight {
        bytes: AtomicUsize,
        frames: AtomicUsize,
    }

    /// Sending half of an in-memory connection.
    pub struct MemorySink {
        tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
        in_flight: Arc<InFlight>,
    }

    /// Receiving half of an in-memory connection.
    pub struct MemorySource {
        rx: mpsc::UnboundedReceiver<String>,
        in_flight: Arc<InFlight>,
    }

    impl MemorySource {
        /// Frames sent by the other side and not read yet.
        pub fn queued_frames(&self) -> usize {
            self.in_flight.frames.load(Ordering::SeqCst)
        }
    }

    fn direction() -> (MemorySink, MemorySource) {
        let (tx, rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(InFlight::default());
        (
            MemorySink {
                tx: Mutex::new(Some(tx)),
                in_flight: in_flight.clone(),
            },
            MemorySource { rx, in_flight },
        )
    }

    /// Raw halves of a connected pair: `(a_sink, a_source, b_sink, b_source)`.
    pub fn raw_pair() -> (MemorySink, MemorySource, MemorySink, MemorySource) {
        let (a_sink, b_source) = direction();
        let (b_sink, a_source) = direction();
        (a_sink, a_source, b_sink, b_source)
    }

    /// Two connected ends.
    pub fn pair() -> (Connection, Connection) {
        let (a_sink, a_source, b_sink, b_source) = raw_pair();
        (
            Connection {
                sink: Box::new(a_sink),
                source: Box::new(a_source),
            },
            Connection {
                sink: Box::new(b_sink),
                source: Box::new(b_source),
            },
        )
    }

    #[async_trait]
    impl FrameSink for MemorySink {
        async fn send(&self, frame: String) -> Result<()> {
            let guard = self
                .tx
                .lock()
                .map_err(|e| SyncError::Transport(format!("lock poisoned: {}", e)))?;
            let Some(tx) = guard.as_ref() else {
                return Err(SyncError::Disconnected("connection closed".into()));
            };

            let len = frame.len();
            self.in_flight.bytes.fetch_add(len, Ordering::SeqCst);
            self.in_flight.frames.fetch_add(1, Ordering::SeqCst);
            tx.send(frame).map_err(|_| {
                self.in_flight.bytes.fetch_sub(len, Ordering::SeqCst);
                self.in_flight.frames.fetch_sub(1, Ordering::SeqCst);
                SyncError::Disconnected("peer dropped the connection".into())
            })
        }

        fn buffered_amount(&self) -> usize {
            self.in_flight.bytes.load(Ordering::SeqCst)
        }

        fn is_open(&self) -> bool {
            self.tx
                .lock()
                .map(|tx| tx.as_ref().is_some_and(|tx| !tx.is_closed()))
                .unwrap_or(false)
        }

        async fn close(&self) {
            if let Ok(mut tx) = self.tx.lock() {
                tx.take();
            }
        }
    }

    #[async_trait]
    impl FrameSource for MemorySource {
        async fn next_frame(&mut self) -> Option<String> {
            let frame = self.rx.recv().await?;
            self.in_flight.bytes.fetch_sub(frame.len(), Ordering::SeqCst);
            self.in_flight.frames.fetch_sub(1, Ordering::SeqCst);
            Some(frame)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory;
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_send_recv() {
        let (a, mut b) = memory::pair();
        a.sink.send("one".into()).await.unwrap();
        a.sink.send("two".into()).await.unwrap();
        assert_eq!(a.sink.buffered_amount(), 6);

        assert_eq!(b.source.next_frame().await.as_deref(), Some("one"));
        assert_eq!(a.sink.buffered_amount(), 3);
        assert_eq!(b.source.next_frame().await.as_deref(), Some("two"));
        assert_eq!(a.sink.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn test_close_delivers_then_ends() {
        let (a, mut b) = memory::pair();
        a.sink.send("last".into()).await.unwrap();
        a.sink.close().await;
        assert!(!a.sink.is_open());
        assert!(a.sink.send("late".into()).await.is_err());

        assert_eq!(b.source.next_frame().await.as_deref(), Some("last"));
        assert_eq!(b.source.next_frame().await, None);
    }
}
