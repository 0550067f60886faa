//! Write-behind cache of live records.
//!
//! The cache keeps one canonical in-memory instance of each hot mutable
//! record so that every caller sees the same [`Live`] handle. Mutations go
//! through the handle's write guard; dropping the guard fires a release hook
//! that marks the key dirty, and a background flusher pushes dirty records
//! and pending deletions to the backing store in one atomic batch.
//!
//! Lock order is `stage` then `pending` then the backing store; the release
//! hook path takes only `pending`.

use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::codec::{Codec, Typed, TypedEach};
use crate::error::{CResult, Error};
use crate::storage::store::{Proc, Store};

/// Interval between background flush cycles when the store is healthy.
const FLUSH_BASE: Duration = Duration::from_secs(1);
/// Upper bound on the flush backoff interval.
const FLUSH_MAX: Duration = Duration::from_secs(30);

/// A record that can live in the cache: it names its own key. The id must
/// not change after construction, since the cache stages the record under
/// it.
pub trait Identified {
    fn id(&self) -> &str;
}

type ReleaseHook = Box<dyn Fn() + Send + Sync>;

/// The canonical in-memory instance of a hot mutable record: the value body
/// behind its own reader/writer lock, plus an optional release hook fired
/// after a write guard is dropped.
pub struct Live<T> {
    body: RwLock<T>,
    hook: Mutex<Option<ReleaseHook>>,
}

impl<T> Live<T> {
    pub fn new(body: T) -> Self {
        Self { body: RwLock::new(body), hook: Mutex::new(None) }
    }

    /// Locks the body for reading.
    pub fn read(&self) -> CResult<RwLockReadGuard<'_, T>> {
        Ok(self.body.read()?)
    }

    /// Locks the body for writing. Dropping the guard releases the lock and
    /// then fires the release hook, if one is installed.
    pub fn write(&self) -> CResult<LiveWriteGuard<'_, T>> {
        Ok(LiveWriteGuard { guard: Some(self.body.write()?), live: self })
    }

    /// Installs the release hook. At most one hook may ever be installed on
    /// an instance.
    pub fn set_release_hook(&self, hook: ReleaseHook) -> CResult<()> {
        let mut slot = self.hook.lock()?;
        if slot.is_some() {
            return Err(Error::AlreadyExists);
        }
        *slot = Some(hook);
        Ok(())
    }

    /// Clones the body under its read lock: a consistent snapshot carrying
    /// no hook. Used for encoding during a flush and then discarded; it must
    /// not be handed to callers.
    fn snapshot(&self) -> CResult<T>
    where
        T: Clone,
    {
        Ok(self.body.read()?.clone())
    }

    fn fire(&self) {
        // The hook only marks a key dirty; a poisoned slot just skips it.
        if let Ok(slot) = self.hook.lock() {
            if let Some(hook) = slot.as_ref() {
                hook();
            }
        }
    }
}

/// Write access to a live record. The release hook fires on drop, after the
/// body lock is released.
pub struct LiveWriteGuard<'a, T> {
    guard: Option<RwLockWriteGuard<'a, T>>,
    live: &'a Live<T>,
}

impl<'a, T> Deref for LiveWriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().expect("write guard accessed after drop")
    }
}

impl<'a, T> DerefMut for LiveWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("write guard accessed after drop")
    }
}

impl<'a, T> Drop for LiveWriteGuard<'a, T> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.live.fire();
    }
}

/// Health of the background flusher, readable as a snapshot at any time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlushHealth {
    pub last_success_at: Option<SystemTime>,
    pub last_error_at: Option<SystemTime>,
    pub last_error: Option<String>,
    pub consecutive_errors: u64,
    pub current_backoff: Duration,
}

impl FlushHealth {
    /// Healthy means the most recent cycle succeeded, or none has run yet.
    pub fn healthy(&self) -> bool {
        self.last_error.is_none()
    }
}

/// A typed in-memory transaction operation for [`LiveCache::proc`]: the
/// function receives the current value (`None` when absent or pending
/// deletion) and returns the replacement, `None` to delete, or an error to
/// abort the whole batch.
pub struct CacheProc<'a, V> {
    key: String,
    apply: Box<dyn FnMut(Option<&V>) -> CResult<Option<V>> + Send + 'a>,
}

impl<'a, V> CacheProc<'a, V> {
    pub fn new<F>(key: impl Into<String>, apply: F) -> Self
    where
        F: FnMut(Option<&V>) -> CResult<Option<V>> + Send + 'a,
    {
        Self { key: key.into(), apply: Box::new(apply) }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn apply(&mut self, current: Option<&V>) -> CResult<Option<V>> {
        (self.apply)(current)
    }
}

#[derive(Default)]
struct Pending {
    updates: HashSet<String>,
    deletes: HashSet<String>,
    health: FlushHealth,
}

struct CacheInner<S: Store, C: Codec> {
    store: Typed<S, C>,
    stage: RwLock<HashMap<String, Arc<Live<C::Value>>>>,
    pending: Mutex<Pending>,
    closed: AtomicBool,
}

/// A write-behind cache of mutable typed records over a backing store.
///
/// `get` returns the staged instance when one exists, loading and staging it
/// otherwise; `set` stages and writes through immediately; mutations through
/// a [`LiveWriteGuard`] mark the key dirty via the release hook; `del`
/// tombstones in memory. The background flusher (or an explicit `flush`)
/// pushes dirty encodings and pending deletions to the store in one atomic
/// batch, backing off exponentially while the store is failing.
pub struct LiveCache<S, C>
where
    S: Store + 'static,
    C: Codec + 'static,
    C::Value: Identified + Clone + Send + Sync + 'static,
{
    inner: Arc<CacheInner<S, C>>,
    token: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl<S, C> LiveCache<S, C>
where
    S: Store + 'static,
    C: Codec + 'static,
    C::Value: Identified + Clone + Send + Sync + 'static,
{
    /// Opens the cache over a typed store and starts the background flusher.
    /// The flusher runs until `ctx` is cancelled, after which `close` runs a
    /// final flush. Must be called inside a tokio runtime.
    pub fn open(ctx: CancellationToken, store: Typed<S, C>) -> Self {
        let inner = Arc::new(CacheInner {
            store,
            stage: RwLock::new(HashMap::new()),
            pending: Mutex::new(Pending::default()),
            closed: AtomicBool::new(false),
        });
        let flusher = tokio::spawn(flusher(ctx.clone(), Arc::clone(&inner)));
        Self { inner, token: ctx, flusher: Mutex::new(Some(flusher)) }
    }

    /// The backing typed store, bypassing the cache. Intended for reads;
    /// writing through it would bypass the staged state.
    pub fn store(&self) -> &Typed<S, C> {
        &self.inner.store
    }

    /// Returns the staged instance of a record, loading and staging it from
    /// the store if needed. Every caller gets the same instance until the
    /// record is deleted or replaced.
    pub fn get(&self, key: &str) -> CResult<Arc<Live<C::Value>>> {
        self.inner.get(key)
    }

    /// Stages a record as its canonical instance and writes it through to
    /// the store immediately. Later mutations through the returned handle
    /// use the normal dirty path.
    pub fn set(&self, value: C::Value) -> CResult<Arc<Live<C::Value>>> {
        self.inner.set(value)
    }

    /// Returns the existing record under the value's id, or stages and
    /// writes through the given value if there is none. Membership is
    /// checked optimistically under the shared lock first, then re-checked
    /// under the exclusive lock before inserting.
    pub fn set_if_missing(&self, value: C::Value) -> CResult<Arc<Live<C::Value>>> {
        self.inner.set_if_missing(value)
    }

    /// Whether the record exists, staged or stored, and is not pending
    /// deletion.
    pub fn has(&self, key: &str) -> CResult<bool> {
        self.inner.has(key)
    }

    /// Deletes a record that exists in the stage or the store. The store
    /// deletion is deferred to the next flush; until then the key reads as
    /// absent and a late release hook cannot resurrect it.
    pub fn del(&self, key: &str) -> CResult<()> {
        self.inner.del(key)
    }

    /// Gets several records at once. Unlike the byte-level call this is
    /// all-or-nothing: any missing key fails with `NotFound`.
    pub fn get_multi(&self, keys: &[&str]) -> CResult<HashMap<String, Arc<Live<C::Value>>>> {
        self.inner.get_multi(keys)
    }

    /// Runs an in-memory transaction over the stage: phase one computes a
    /// replacement for every key from the staged or stored value, phase two
    /// applies all of them to the stage and pending sets atomically. The
    /// store is untouched until the next flush.
    pub fn proc(&self, ops: Vec<CacheProc<'_, C::Value>>) -> CResult<()> {
        self.inner.proc(ops)
    }

    /// Pushes every dirty record and pending deletion to the store in one
    /// atomic batch.
    pub fn flush(&self) -> CResult<()> {
        self.inner.flush()
    }

    /// Flushes, then iterates the backing store directly; the cache is
    /// bypassed.
    pub fn each(&self) -> CResult<TypedEach<'_, S, C>> {
        self.inner.flush()?;
        self.inner.store.each()
    }

    /// A snapshot of the background flusher's health.
    pub fn health(&self) -> CResult<FlushHealth> {
        Ok(self.inner.pending.lock()?.health.clone())
    }

    /// Stops the background flusher, runs a final flush and closes the
    /// backing store.
    pub async fn close(&self) -> CResult<()> {
        self.token.cancel();
        let handle = self.flusher.lock()?.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.inner.flush_unchecked()?;
        self.inner.store.close()
    }
}

/// The background flush loop: sleep, flush, and on failure double the
/// interval up to the cap; one success resets it to the base.
async fn flusher<S, C>(ctx: CancellationToken, inner: Arc<CacheInner<S, C>>)
where
    S: Store + 'static,
    C: Codec + 'static,
    C::Value: Identified + Clone + Send + Sync + 'static,
{
    let mut interval = FLUSH_BASE;
    loop {
        tokio::select! {
            _ = ctx.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        match inner.flush() {
            Ok(()) => interval = FLUSH_BASE,
            Err(err) => {
                interval = (interval * 2).clamp(FLUSH_BASE, FLUSH_MAX);
                log::warn!("background flush failed, next attempt in {:?}: {}", interval, err);
                inner.note_failure(err, interval);
                continue;
            }
        }
        inner.note_success(interval);
    }
}

impl<S, C> CacheInner<S, C>
where
    S: Store + 'static,
    C: Codec + 'static,
    C::Value: Identified + Clone + Send + Sync + 'static,
{
    fn check_open(&self) -> CResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// The release hook for a staged key: a weak back reference, so values
    /// owned by the cache do not keep the cache alive through their hooks.
    fn hook_for(self: &Arc<Self>, key: &str) -> ReleaseHook {
        let weak: Weak<CacheInner<S, C>> = Arc::downgrade(self);
        let key = key.to_string();
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.mark_updated(&key);
            }
        })
    }

    fn mark_updated(&self, key: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            // A pending delete wins over a late release.
            if !pending.deletes.contains(key) {
                pending.updates.insert(key.to_string());
            }
        }
    }

    fn get(self: &Arc<Self>, key: &str) -> CResult<Arc<Live<C::Value>>> {
        self.check_open()?;
        {
            let stage = self.stage.read()?;
            if self.pending.lock()?.deletes.contains(key) {
                return Err(Error::NotFound);
            }
            if let Some(live) = stage.get(key) {
                return Ok(Arc::clone(live));
            }
        }

        // Load and stage under the exclusive lock, re-checking for a racing
        // loader.
        let mut stage = self.stage.write()?;
        if self.pending.lock()?.deletes.contains(key) {
            return Err(Error::NotFound);
        }
        if let Some(live) = stage.get(key) {
            return Ok(Arc::clone(live));
        }
        let value = self.store.get(key.as_bytes())?;
        let live = Arc::new(Live::new(value));
        live.set_release_hook(self.hook_for(key))?;
        stage.insert(key.to_string(), Arc::clone(&live));
        Ok(live)
    }

    fn set(self: &Arc<Self>, value: C::Value) -> CResult<Arc<Live<C::Value>>> {
        self.check_open()?;
        let key = value.id().to_string();
        let bytes = self.store.codec().to_bytes(&value)?;
        let live = Arc::new(Live::new(value));
        live.set_release_hook(self.hook_for(&key))?;

        let mut stage = self.stage.write()?;
        {
            let mut pending = self.pending.lock()?;
            pending.deletes.remove(&key);
            pending.updates.remove(&key);
        }
        stage.insert(key.clone(), Arc::clone(&live));
        self.store.store().set(key.as_bytes(), &bytes, true)?;
        Ok(live)
    }

    fn set_if_missing(self: &Arc<Self>, value: C::Value) -> CResult<Arc<Live<C::Value>>> {
        self.check_open()?;
        let key = value.id().to_string();
        {
            let stage = self.stage.read()?;
            let deleted = self.pending.lock()?.deletes.contains(&key);
            if !deleted {
                if let Some(live) = stage.get(&key) {
                    return Ok(Arc::clone(live));
                }
                if self.store.has(key.as_bytes())? {
                    drop(stage);
                    return self.get(&key);
                }
            }
        }

        let mut stage = self.stage.write()?;
        let deleted = self.pending.lock()?.deletes.contains(&key);
        if !deleted {
            if let Some(live) = stage.get(&key) {
                return Ok(Arc::clone(live));
            }
            if self.store.has(key.as_bytes())? {
                let loaded = self.store.get(key.as_bytes())?;
                let live = Arc::new(Live::new(loaded));
                live.set_release_hook(self.hook_for(&key))?;
                stage.insert(key.clone(), Arc::clone(&live));
                return Ok(live);
            }
        }

        let bytes = self.store.codec().to_bytes(&value)?;
        let live = Arc::new(Live::new(value));
        live.set_release_hook(self.hook_for(&key))?;
        {
            let mut pending = self.pending.lock()?;
            pending.deletes.remove(&key);
            pending.updates.remove(&key);
        }
        stage.insert(key.clone(), Arc::clone(&live));
        self.store.store().set(key.as_bytes(), &bytes, true)?;
        Ok(live)
    }

    fn has(&self, key: &str) -> CResult<bool> {
        self.check_open()?;
        let stage = self.stage.read()?;
        if self.pending.lock()?.deletes.contains(key) {
            return Ok(false);
        }
        if stage.contains_key(key) {
            return Ok(true);
        }
        self.store.has(key.as_bytes())
    }

    fn del(&self, key: &str) -> CResult<()> {
        self.check_open()?;
        let mut stage = self.stage.write()?;
        let mut pending = self.pending.lock()?;
        if pending.deletes.contains(key) {
            return Err(Error::NotFound);
        }
        if !stage.contains_key(key) && !self.store.has(key.as_bytes())? {
            return Err(Error::NotFound);
        }
        stage.remove(key);
        pending.updates.remove(key);
        pending.deletes.insert(key.to_string());
        Ok(())
    }

    fn get_multi(self: &Arc<Self>, keys: &[&str]) -> CResult<HashMap<String, Arc<Live<C::Value>>>> {
        let mut result = HashMap::with_capacity(keys.len());
        for &key in keys {
            result.insert(key.to_string(), self.get(key)?);
        }
        Ok(result)
    }

    fn proc(self: &Arc<Self>, mut ops: Vec<CacheProc<'_, C::Value>>) -> CResult<()> {
        self.check_open()?;
        let mut stage = self.stage.write()?;
        let mut pending = self.pending.lock()?;

        // Phase one: compute every replacement from the current staged or
        // stored value, treating pending deletes as absent. Any failure
        // aborts with no state changed.
        let mut results = Vec::with_capacity(ops.len());
        for op in ops.iter_mut() {
            let current = if pending.deletes.contains(op.key()) {
                None
            } else if let Some(live) = stage.get(op.key()) {
                Some(live.snapshot()?)
            } else {
                match self.store.get(op.key().as_bytes()) {
                    Ok(value) => Some(value),
                    Err(Error::NotFound) => None,
                    Err(err) => return Err(err),
                }
            };
            results.push(op.apply(current.as_ref())?);
        }

        // Phase two: apply the remembered results to the stage and pending
        // sets.
        for (op, result) in ops.iter().zip(results) {
            match result {
                Some(value) => {
                    let live = Arc::new(Live::new(value));
                    live.set_release_hook(self.hook_for(op.key()))?;
                    stage.insert(op.key().to_string(), live);
                    pending.updates.insert(op.key().to_string());
                    pending.deletes.remove(op.key());
                }
                None => {
                    stage.remove(op.key());
                    pending.updates.remove(op.key());
                    pending.deletes.insert(op.key().to_string());
                }
            }
        }
        Ok(())
    }

    fn flush(&self) -> CResult<()> {
        self.check_open()?;
        self.flush_unchecked()
    }

    /// The flush body, also run by `close` after the closed flag is set.
    fn flush_unchecked(&self) -> CResult<()> {
        // Drain the pending sets while snapshotting the dirty values, then
        // write outside the cache locks.
        let (writes, deletes) = {
            let stage = self.stage.read()?;
            let mut pending = self.pending.lock()?;
            let mut writes = Vec::new();
            for key in pending.updates.iter() {
                if pending.deletes.contains(key) {
                    continue;
                }
                if let Some(live) = stage.get(key) {
                    writes.push((key.clone(), live.snapshot()?));
                }
            }
            let deletes: Vec<String> = pending.deletes.drain().collect();
            pending.updates.clear();
            (writes, deletes)
        };
        if writes.is_empty() && deletes.is_empty() {
            return Ok(());
        }

        let result = self.flush_batch(&writes, &deletes);
        if result.is_err() {
            // Put the drained work back so the retry loop can make
            // progress. Deletes recorded in the meantime keep winning.
            if let Ok(mut pending) = self.pending.lock() {
                for key in &deletes {
                    pending.updates.remove(key);
                    pending.deletes.insert(key.clone());
                }
                for (key, _) in &writes {
                    if !pending.deletes.contains(key) {
                        pending.updates.insert(key.clone());
                    }
                }
            }
        }
        result
    }

    fn flush_batch(&self, writes: &[(String, C::Value)], deletes: &[String]) -> CResult<()> {
        let mut pairs = Vec::with_capacity(writes.len() + deletes.len());
        for (key, value) in writes {
            let bytes = self.store.codec().to_bytes(value)?;
            pairs.push(Proc::new(key.as_bytes().to_vec(), move |_, _| Ok(Some(bytes.clone()))));
        }
        for key in deletes {
            pairs.push(Proc::new(key.as_bytes().to_vec(), |_, _| Ok(None)));
        }
        self.store.store().proc(pairs, true)
    }

    fn note_success(&self, interval: Duration) {
        if let Ok(mut pending) = self.pending.lock() {
            let health = &mut pending.health;
            health.last_success_at = Some(SystemTime::now());
            health.last_error = None;
            health.consecutive_errors = 0;
            health.current_backoff = interval;
        }
    }

    fn note_failure(&self, err: Error, interval: Duration) {
        if let Ok(mut pending) = self.pending.lock() {
            let health = &mut pending.health;
            health.last_error_at = Some(SystemTime::now());
            health.last_error = Some(err.to_string());
            health.consecutive_errors += 1;
            health.current_backoff = interval;
        }
    }
}
