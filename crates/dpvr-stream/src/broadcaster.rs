use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// A sink that can no longer accept frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Output destination for published frames, typically one open connection.
pub trait Sink: Send + Sync {
    /// Hand over one frame without blocking.
    fn send(&self, frame: Bytes) -> Result<(), SinkClosed>;
}

/// Frames a channel subscriber may fall behind by before it is dropped.
pub const SUBSCRIBER_QUEUE: usize = 256;

/// A full queue counts as a failed write: the reader stopped keeping up.
impl Sink for mpsc::Sender<Bytes> {
    fn send(&self, frame: Bytes) -> Result<(), SinkClosed> {
        self.try_send(frame).map_err(|_| SinkClosed)
    }
}

/// Identifies one registered sink. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SinkHandle(u64);

/// A registered channel sink and the receiving end of its frames.
pub struct Subscription {
    pub handle: SinkHandle,
    pub frames: mpsc::Receiver<Bytes>,
}

/// Encode one server-sent event frame: `data: <json>\n\n`.
pub fn encode_frame<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Bytes> {
    let mut frame = b"data: ".to_vec();
    serde_json::to_writer(&mut frame, value)?;
    frame.extend_from_slice(b"\n\n");
    Ok(Bytes::from(frame))
}

/// Fans published values out to every registered sink.
///
/// Cheap to clone; clones share one registry. Sinks are keyed by a monotonically
/// increasing id, so iteration follows subscription order and removal never
/// disturbs other entries.
#[derive(Clone, Default)]
pub struct Broadcaster {
    sinks: Arc<RwLock<BTreeMap<u64, Arc<dyn Sink>>>>,
    next_id: Arc<AtomicU64>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel-backed sink holding up to [`SUBSCRIBER_QUEUE`] frames.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let handle = self.register(Arc::new(tx));
        Subscription { handle, frames: rx }
    }

    /// Register an arbitrary sink.
    pub fn register(&self, sink: Arc<dyn Sink>) -> SinkHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
        sinks.insert(id, sink);
        tracing::debug!(id, subscribers = sinks.len(), "Sink registered");
        SinkHandle(id)
    }

    /// Remove a sink. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, handle: SinkHandle) -> bool {
        let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
        let removed = sinks.remove(&handle.0).is_some();
        if removed {
            tracing::debug!(id = handle.0, subscribers = sinks.len(), "Sink removed");
        }
        removed
    }

    /// Serialize `value` once and send the frame to every sink registered now.
    ///
    /// Sinks that fail are dropped from the registry; the others still get the
    /// frame. Returns how many sinks accepted it.
    pub fn publish<T: Serialize + ?Sized>(&self, value: &T) -> serde_json::Result<usize> {
        let frame = encode_frame(value)?;
        Ok(self.publish_frame(frame))
    }

    /// Send an already encoded frame to every sink registered now.
    pub fn publish_frame(&self, frame: Bytes) -> usize {
        let snapshot: Vec<(u64, Arc<dyn Sink>)> = {
            let sinks = self.sinks.read().unwrap_or_else(|e| e.into_inner());
            sinks.iter().map(|(id, sink)| (*id, sink.clone())).collect()
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, sink) in snapshot {
            match sink.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(SinkClosed) => failed.push(id),
            }
        }

        if !failed.is_empty() {
            let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
            for id in &failed {
                sinks.remove(id);
            }
            tracing::warn!(dropped = failed.len(), subscribers = sinks.len(), "Dropped closed sinks");
        }

        delivered
    }

    /// Remove every sink. Channel subscribers see their stream end.
    pub fn close_all(&self) {
        let mut sinks = self.sinks.write().unwrap_or_else(|e| e.into_inner());
        if !sinks.is_empty() {
            tracing::info!(subscribers = sinks.len(), "Closing all sinks");
        }
        sinks.clear();
    }

    pub fn len(&self) -> usize {
        self.sinks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
