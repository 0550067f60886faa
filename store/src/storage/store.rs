use std::collections::HashMap;
use crate::error::CResult;
use crate::storage::Status;

/// One read-modify-write operation inside a `proc` transaction: a record key
/// paired with the function that computes its replacement.
///
/// The function receives the key and the current stored bytes (`None` when
/// the record is absent) and returns the new bytes, `None` to delete, or an
/// error to abort the whole transaction. Returning bytes equal to the current
/// value appends nothing, which keeps the append-only files bounded.
pub struct Proc<'a> {
    key: Vec<u8>,
    apply: Box<dyn FnMut(&[u8], Option<&[u8]>) -> CResult<Option<Vec<u8>>> + Send + 'a>,
}

impl<'a> Proc<'a> {
    pub fn new<F>(key: impl Into<Vec<u8>>, apply: F) -> Self
    where
        F: FnMut(&[u8], Option<&[u8]>) -> CResult<Option<Vec<u8>>> + Send + 'a,
    {
        Self { key: key.into(), apply: Box::new(apply) }
    }

    /// The exact record key this operation targets.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub(crate) fn apply(&mut self, current: Option<&[u8]>) -> CResult<Option<Vec<u8>>> {
        let key = std::mem::take(&mut self.key);
        let result = (self.apply)(&key, current);
        self.key = key;
        result
    }
}

/// The byte-level key/value store contract shared by the unordered and the
/// ordered store. Keys and values are arbitrary byte strings; a record either
/// exists with a value or does not exist. All methods are safe for concurrent
/// use: a single writer-excluding lock wraps every mutating call and a shared
/// lock wraps every reader call.
pub trait Store: Send + Sync {
    /// The cursor returned by each(). Holds the store's shared lock for its
    /// whole lifetime, so the store must not be mutated from the same thread
    /// that is iterating.
    type Each<'a>: Iterator<Item = CResult<(Vec<u8>, Vec<u8>)>> + 'a
    where
        Self: 'a;

    /// Gets a value for a key, or `NotFound`.
    fn get(&self, key: &[u8]) -> CResult<Vec<u8>>;

    /// Sets a value for a key. With `overwrite` false, an existing record
    /// fails with `AlreadyExists` and is left untouched.
    fn set(&self, key: &[u8], value: &[u8], overwrite: bool) -> CResult<()>;

    /// Deletes a key, or `NotFound` if it does not exist.
    fn del(&self, key: &[u8]) -> CResult<()>;

    /// Whether the key exists.
    fn has(&self, key: &[u8]) -> CResult<bool>;

    /// Gets several keys in one atomic snapshot. Missing keys are omitted
    /// from the result rather than failing the call.
    fn get_multi(&self, keys: &[&[u8]]) -> CResult<HashMap<Vec<u8>, Vec<u8>>>;

    /// Returns a lazy cursor over all records. Each call creates a fresh
    /// cursor.
    fn each(&self) -> CResult<Self::Each<'_>>;

    /// Atomically runs a batch of read-modify-write operations. Phase one
    /// computes every replacement against a consistent snapshot; if any
    /// apply function fails the transaction returns that error without
    /// writing anything. Phase two commits the remembered results. With
    /// `write` false any required mutation fails the transaction.
    fn proc(&self, pairs: Vec<Proc<'_>>, write: bool) -> CResult<()>;

    /// Flushes buffered data to disk (fsync).
    fn flush(&self) -> CResult<()>;

    /// Flushes, fsyncs and marks the store closed. Subsequent operations
    /// fail with `Closed`.
    fn close(&self) -> CResult<()>;

    /// Returns store status.
    fn status(&self) -> CResult<Status>;
}

/// The extra contract of a lexically-ordered store: `each()` yields keys in
/// ascending lexicographic order, and the smallest record is addressable
/// directly.
pub trait Ordered: Store {
    /// Returns the record with the lexicographically smallest key, or
    /// `NotFound` in an empty store.
    fn first(&self) -> CResult<(Vec<u8>, Vec<u8>)>;
}
