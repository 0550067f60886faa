//! Persistent priority queue of time-scheduled events.
//!
//! Events are kept in an ordered store keyed by the big-endian `(at,
//! counter)` pair, so the smallest key is always the next due event, keys
//! are unique even for identical timestamps, and equal-timestamp events
//! dispatch in push order. A single scheduler task dispatches due events to
//! a caller-supplied handler and parks on a re-armed timer, a
//! buffered-by-one wake signal and the cancellation context in between.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use bytes::{BufMut, BytesMut};
use serde_derive::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use crate::codec::bin::BinCodec;
use crate::codec::Typed;
use crate::error::{CResult, Error};
use crate::storage::ordered::OrderedStore;
use crate::storage::Options;

/// Nanoseconds since the Unix epoch, adjusted by a per-queue offset.
pub type Timestamp = u64;

/// The scheduled call an event delivers to its object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub name: String,
    pub tag: String,
    pub message: String,
}

/// A scheduled event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// When the event is due.
    pub at: Timestamp,
    /// The object the call is delivered to.
    pub object: String,
    pub call: Call,
    /// The tree key, assigned by `create_key` before insertion.
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
}

/// Process-wide monotonic counter making event keys unique within a process
/// lifetime. It resets on restart, but `at` advances under ordinary
/// wall-clock monotonicity, so keys stay unique across restarts too.
static EVENT_COUNTER: AtomicU64 = AtomicU64::new(0);

impl Event {
    /// Assigns the tree key: 8 bytes big-endian `at` followed by 8 bytes
    /// big-endian counter. Strictly ordered even for identical timestamps.
    pub fn create_key(&mut self) {
        let mut key = BytesMut::with_capacity(16);
        key.put_u64(self.at);
        key.put_u64(EVENT_COUNTER.fetch_add(1, Ordering::SeqCst));
        self.key = key.to_vec();
    }
}

/// A persistent priority queue of timestamped events over an ordered store.
pub struct EventQueue {
    tree: Typed<OrderedStore, BinCodec<Event>>,
    /// Restart alignment, in nanoseconds: the queue's clock is the wall
    /// clock plus this offset.
    offset: AtomicI64,
    wake: Notify,
}

impl EventQueue {
    /// Opens the queue over `<path>.tkt`.
    pub fn open(path: impl Into<PathBuf>) -> CResult<Self> {
        let tree = OrderedStore::open(path.into(), Options::ordered())?;
        Ok(Self {
            tree: Typed::new(tree, BinCodec::new()),
            offset: AtomicI64::new(0),
            wake: Notify::new(),
        })
    }

    fn wall_now() -> CResult<i64> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|err| Error::Internal(err.to_string()))?
            .as_nanos();
        i64::try_from(nanos)
            .map_err(|_| Error::Invalid("wall clock outside the signed nanosecond range".to_string()))
    }

    /// The queue's current time.
    pub fn now(&self) -> CResult<Timestamp> {
        let now = Self::wall_now()? + self.offset.load(Ordering::SeqCst);
        Ok(now.max(0) as u64)
    }

    /// The timestamp `d` from now. Rejects delays that overflow the signed
    /// nanosecond range.
    pub fn after(&self, d: Duration) -> CResult<Timestamp> {
        let nanos = i64::try_from(d.as_nanos())
            .map_err(|_| Error::Invalid("delay overflows the timestamp range".to_string()))?;
        let at = (self.now()? as i64)
            .checked_add(nanos)
            .ok_or_else(|| Error::Invalid("timestamp overflows the signed nanosecond range".to_string()))?;
        Ok(at as u64)
    }

    /// The timestamp of a wall-clock instant, adjusted by the queue offset.
    pub fn at(&self, t: SystemTime) -> CResult<Timestamp> {
        let nanos = t
            .duration_since(UNIX_EPOCH)
            .map_err(|err| Error::Invalid(err.to_string()))?
            .as_nanos();
        let at = i64::try_from(nanos)
            .map_err(|_| Error::Invalid("instant outside the signed nanosecond range".to_string()))?
            .checked_add(self.offset.load(Ordering::SeqCst))
            .ok_or_else(|| Error::Invalid("timestamp overflows the signed nanosecond range".to_string()))?;
        Ok(at.max(0) as u64)
    }

    /// Assigns the event its key, persists it, and wakes the scheduler
    /// without blocking. A duplicate key surfaces as `AlreadyExists`.
    pub fn push(&self, event: &mut Event) -> CResult<()> {
        event.create_key();
        let key = event.key.clone();
        self.tree.set(&key, event, false)?;
        self.wake.notify_one();
        Ok(())
    }

    /// Runs the scheduler until the context is cancelled (returning
    /// `Cancelled`) or the handler fails. A handler error is returned
    /// verbatim and the event stays in the tree for the next startup; any
    /// tree failure is fatal to the loop.
    pub async fn start<H>(&self, ctx: CancellationToken, mut handler: H) -> CResult<()>
    where
        H: FnMut(&Event) -> CResult<()>,
    {
        // Align the clock so persisted past-due events fire immediately and
        // in submission order; pushes within this session share the offset,
        // preserving relative order.
        match self.tree.first() {
            Ok((_, event)) => {
                let wall = Self::wall_now()?;
                if (event.at as i64) < wall {
                    self.offset.store(event.at as i64 - wall, Ordering::SeqCst);
                }
            }
            Err(Error::NotFound) => {}
            Err(err) => return Err(err),
        }
        log::info!("event queue scheduler started");

        loop {
            // Dispatch everything due, in key order. Events are deleted only
            // after the handler succeeds.
            let next = loop {
                let (key, event) = match self.tree.first() {
                    Ok(first) => first,
                    Err(Error::NotFound) => break None,
                    Err(err) => return Err(err),
                };
                if event.at > self.now()? {
                    break Some(event);
                }
                handler(&event)?;
                self.tree.del(&key)?;
            };

            let delay = match &next {
                Some(event) => {
                    let remaining = event.at.saturating_sub(self.now()?);
                    if remaining == 0 {
                        continue;
                    }
                    Duration::from_nanos(remaining)
                }
                None => Duration::ZERO, // unused; the timer branch is disabled
            };

            // Park until the next event is due, a push wakes us, or the
            // context is cancelled. A wake drops the armed timer and
            // re-reads first.
            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Cancelled),
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(delay), if next.is_some() => {}
            }
        }
    }

    /// Fsyncs the backing tree.
    pub fn flush(&self) -> CResult<()> {
        self.tree.flush()
    }

    /// Flushes and closes the backing tree.
    pub fn close(&self) -> CResult<()> {
        self.tree.close()
    }
}
