//! Batched, priority-ordered, backpressure-aware outgoing channel.
//!
//! Messages pushed through an [`OutgoingHandle`] are serialized by a
//! worker task that owns the connection's sink. The first message after an
//! idle period goes out immediately. Messages that pile up while the worker
//! is busy are sent in priority order and, once batching is on, joined with
//! `\n` into frames of at most `max_batch_bytes`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::messages::{ping_frame, SyncMessage};
use crate::queue::PriorityQueue;
use crate::transport::FrameSink;

enum Command {
    Message(SyncMessage),
    Close,
}

/// Cheap handle for queueing messages to one peer.
#[derive(Clone)]
pub struct OutgoingHandle {
    tx: mpsc::UnboundedSender<Command>,
    batching: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl OutgoingHandle {
    /// Queue a message. Returns `false` if the channel is closed.
    pub fn push(&self, msg: SyncMessage) -> bool {
        !self.is_closed() && self.tx.send(Command::Message(msg)).is_ok()
    }

    /// Send what is queued, then close the connection.
    pub fn close(&self) {
        if self.tx.send(Command::Close).is_err() {
            debug!("outgoing worker already stopped");
        }
    }

    pub fn set_batching(&self, enabled: bool) {
        if !self.batching.swap(enabled, Ordering::SeqCst) && enabled {
            debug!("peer batches, enabling outgoing batching");
        }
    }

    pub fn is_batching(&self) -> bool {
        self.batching.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.is_closed()
    }
}

/// Start the worker that owns `sink`.
pub fn spawn_outgoing(
    sink: Arc<dyn FrameSink>,
    config: TransportConfig,
) -> (OutgoingHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let batching = Arc::new(AtomicBool::new(config.batching_by_default));
    let closed = Arc::new(AtomicBool::new(false));

    let worker = OutgoingWorker {
        sink,
        config,
        rx,
        queue: PriorityQueue::new(),
        backlog: String::new(),
        batching: batching.clone(),
        closed: closed.clone(),
        close_requested: false,
    };
    let task = tokio::spawn(worker.run());

    (
        OutgoingHandle {
            tx,
            batching,
            closed,
        },
        task,
    )
}

struct OutgoingWorker {
    sink: Arc<dyn FrameSink>,
    config: TransportConfig,
    rx: mpsc::UnboundedReceiver<Command>,
    queue: PriorityQueue,
    backlog: String,
    batching: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    close_requested: bool,
}

async fn tick(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl OutgoingWorker {
    async fn run(mut self) {
        let mut ping = self.config.ping_interval().map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        while !self.close_requested {
            let command = tokio::select! {
                command = self.rx.recv() => command,
                _ = tick(&mut ping) => {
                    self.send_ping().await;
                    continue;
                }
            };

            match command {
                Some(Command::Message(msg)) => {
                    self.process(msg).await;
                    self.flush().await;
                    self.pump().await;
                }
                Some(Command::Close) | None => self.close_requested = true,
            }
        }

        self.drain_and_close().await;
    }

    /// Move everything waiting in the channel into the priority queue.
    fn collect(&mut self) {
        while let Ok(command) = self.rx.try_recv() {
            match command {
                Command::Message(msg) => self.queue.push(msg),
                Command::Close => self.close_requested = true,
            }
        }
    }

    /// Send queued messages until the queue stays empty for a batch delay.
    async fn pump(&mut self) {
        loop {
            self.collect();
            if self.close_requested {
                return;
            }

            if self.queue.is_empty() {
                match tokio::time::timeout(self.config.batch_delay(), self.rx.recv()).await {
                    Ok(Some(Command::Message(msg))) => {
                        self.queue.push(msg);
                        continue;
                    }
                    Ok(Some(Command::Close)) | Ok(None) => {
                        self.close_requested = true;
                        return;
                    }
                    Err(_) => {
                        self.flush().await;
                        return;
                    }
                }
            }

            self.wait_for_buffer().await;
            if self.close_requested {
                return;
            }
            if let Some(msg) = self.queue.pull() {
                self.process(msg).await;
            }
        }
    }

    /// Hold sends while the connection has too much unconsumed data. New
    /// messages keep landing in the queue so priorities still apply once
    /// the buffer drains.
    async fn wait_for_buffer(&mut self) {
        let mut waited = false;
        while self.sink.is_open() && self.sink.buffered_amount() > self.config.buffer_limit {
            if !waited {
                debug!(
                    buffered = self.sink.buffered_amount(),
                    queued = self.queue.len(),
                    "outgoing buffer full, deferring"
                );
                waited = true;
            }
            tokio::time::sleep(self.config.buffer_poll_interval()).await;
            self.collect();
            if self.close_requested {
                return;
            }
        }
    }

    async fn process(&mut self, msg: SyncMessage) {
        let line = match msg.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(co = %msg.id(), error = %e, "failed to serialize outgoing message");
                return;
            }
        };

        if !self.batching.load(Ordering::SeqCst) {
            self.send_frame(line).await;
            return;
        }

        let max = self.config.max_batch_bytes;
        if !self.backlog.is_empty() && self.backlog.len() + 1 + line.len() > max {
            self.flush().await;
        }
        if !self.backlog.is_empty() {
            self.backlog.push('\n');
        }
        let oversized = line.len() >= max;
        self.backlog.push_str(&line);

        // Oversized messages travel alone, right after whatever was pending.
        if oversized {
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        if self.backlog.is_empty() {
            return;
        }
        let frame = std::mem::take(&mut self.backlog);
        self.send_frame(frame).await;
    }

    async fn send_frame(&mut self, frame: String) {
        if let Err(e) = self.sink.send(frame).await {
            debug!(error = %e, "dropping outgoing frame");
        }
    }

    async fn send_ping(&mut self) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as i64);
        self.send_frame(ping_frame(now)).await;
    }

    /// Send everything still queued, then close the sink.
    async fn drain_and_close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.collect();
        let remaining = self.queue.len();
        while let Some(msg) = self.queue.pull() {
            self.process(msg).await;
        }
        self.flush().await;
        self.sink.close().await;
        debug!(remaining, "outgoing channel closed");
    }
}
