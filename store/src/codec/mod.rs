pub mod bin;
pub mod json;

use std::collections::HashMap;
use crate::error::CResult;
use crate::storage::store::{Ordered, Proc, Store};

/// A deterministic serializer between in-memory values and record bytes.
///
/// `encode(decode(b))` must reproduce `b` for any bytes the serializer
/// produced, and `decode(encode(v))` must be semantically equal to `v`. The
/// encoded size is declared up front so encoding into a pre-sized buffer
/// never reallocates.
pub trait Codec: Send + Sync {
    type Value;

    /// The exact encoded size of `value` in bytes.
    fn size(&self, value: &Self::Value) -> CResult<usize>;

    /// Encodes `value` into `buf`, which the caller has reserved to
    /// `size(value)`.
    fn encode(&self, value: &Self::Value, buf: &mut Vec<u8>) -> CResult<()>;

    /// Decodes a value, or `Corrupt` for malformed bytes.
    fn decode(&self, bytes: &[u8]) -> CResult<Self::Value>;

    /// Encodes into a fresh buffer sized up front.
    fn to_bytes(&self, value: &Self::Value) -> CResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size(value)?);
        self.encode(value, &mut buf)?;
        Ok(buf)
    }
}

/// A typed read-modify-write operation, the value-level counterpart of
/// [`Proc`]: the function receives the decoded current value (`None` when
/// the record is absent) and returns the replacement, `None` to delete, or
/// an error to abort the whole transaction.
pub struct SProc<'a, V> {
    key: Vec<u8>,
    apply: Box<dyn FnMut(Option<V>) -> CResult<Option<V>> + Send + 'a>,
}

impl<'a, V> SProc<'a, V> {
    pub fn new<F>(key: impl Into<Vec<u8>>, apply: F) -> Self
    where
        F: FnMut(Option<V>) -> CResult<Option<V>> + Send + 'a,
    {
        Self { key: key.into(), apply: Box::new(apply) }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub(crate) fn apply(&mut self, current: Option<V>) -> CResult<Option<V>> {
        (self.apply)(current)
    }
}

/// A typed façade over a byte-level store: every operation encodes and
/// decodes records with the configured serializer. Adds no locking of its
/// own; concurrency comes entirely from the underlying store.
pub struct Typed<S, C> {
    store: S,
    codec: C,
}

impl<S: Store, C: Codec> Typed<S, C> {
    pub fn new(store: S, codec: C) -> Self {
        Self { store, codec }
    }

    /// The underlying byte-level store, for cache-bypass access.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn codec(&self) -> &C {
        &self.codec
    }

    pub fn get(&self, key: &[u8]) -> CResult<C::Value> {
        self.codec.decode(&self.store.get(key)?)
    }

    pub fn set(&self, key: &[u8], value: &C::Value, overwrite: bool) -> CResult<()> {
        self.store.set(key, &self.codec.to_bytes(value)?, overwrite)
    }

    pub fn del(&self, key: &[u8]) -> CResult<()> {
        self.store.del(key)
    }

    pub fn has(&self, key: &[u8]) -> CResult<bool> {
        self.store.has(key)
    }

    /// Gets several keys in one atomic snapshot, omitting missing keys. Any
    /// corrupt record aborts the whole call.
    pub fn get_multi(&self, keys: &[&[u8]]) -> CResult<HashMap<Vec<u8>, C::Value>> {
        let mut result = HashMap::new();
        for (key, bytes) in self.store.get_multi(keys)? {
            result.insert(key, self.codec.decode(&bytes)?);
        }
        Ok(result)
    }

    /// A lazy cursor over all records. A record that fails to decode yields
    /// a `Corrupt` item; the cursor continues past it.
    pub fn each(&self) -> CResult<TypedEach<'_, S, C>> {
        Ok(TypedEach { inner: self.store.each()?, codec: &self.codec })
    }

    /// Runs a typed transaction: decode on entry, apply, encode on exit.
    /// Returning `None` from an apply function deletes the key.
    pub fn proc(&self, ops: Vec<SProc<'_, C::Value>>, write: bool) -> CResult<()> {
        let codec = &self.codec;
        let pairs = ops
            .into_iter()
            .map(|mut op| {
                Proc::new(op.key.clone(), move |_, current: Option<&[u8]>| {
                    let current = current.map(|bytes| codec.decode(bytes)).transpose()?;
                    match op.apply(current)? {
                        Some(value) => Ok(Some(codec.to_bytes(&value)?)),
                        None => Ok(None),
                    }
                })
            })
            .collect();
        self.store.proc(pairs, write)
    }

    pub fn flush(&self) -> CResult<()> {
        self.store.flush()
    }

    pub fn close(&self) -> CResult<()> {
        self.store.close()
    }
}

impl<S: Ordered, C: Codec> Typed<S, C> {
    /// Decodes the record with the smallest key.
    pub fn first(&self) -> CResult<(Vec<u8>, C::Value)> {
        let (key, bytes) = self.store.first()?;
        Ok((key, self.codec.decode(&bytes)?))
    }
}

/// A typed cursor: lazily decodes each record, surfacing per-item decode
/// failures without aborting the iteration.
pub struct TypedEach<'a, S: Store + 'a, C> {
    inner: S::Each<'a>,
    codec: &'a C,
}

impl<'a, S: Store, C: Codec> Iterator for TypedEach<'a, S, C> {
    type Item = CResult<(Vec<u8>, C::Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next()? {
            Ok((key, bytes)) => Some(self.codec.decode(&bytes).map(|value| (key, value))),
            Err(err) => Some(Err(err)),
        }
    }
}
