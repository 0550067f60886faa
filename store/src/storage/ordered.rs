use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard};
use crate::error::{CResult, Error};
use crate::storage::store::{Ordered, Proc, Store};
use crate::storage::{Core, Options, Status, TreeKeydir, ORDERED_SUFFIX};

/// A thread-safe byte-level store backed by a lexically-ordered tree file:
/// the same append-only log as the record store, with an ordered keydir that
/// gives ascending lexicographic iteration and a `first` operation.
///
/// Lives in `<name>.tkt`.
pub struct OrderedStore {
    core: RwLock<Core<TreeKeydir>>,
}

impl OrderedStore {
    /// Opens or creates an ordered store at `<path>.tkt`.
    pub fn open(path: impl Into<PathBuf>, opts: Options) -> CResult<Self> {
        let core = Core::open(path.into(), ORDERED_SUFFIX, opts, "ordered")?;
        log::info!("opened ordered store at {}", core.path().display());
        Ok(Self { core: RwLock::new(core) })
    }
}

impl std::fmt::Display for OrderedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ordered")
    }
}

impl Store for OrderedStore {
    type Each<'a> = OrderedEach<'a> where Self: 'a;

    fn get(&self, key: &[u8]) -> CResult<Vec<u8>> {
        self.core.read()?.get(key)
    }

    fn set(&self, key: &[u8], value: &[u8], overwrite: bool) -> CResult<()> {
        self.core.write()?.set(key, value, overwrite)
    }

    fn del(&self, key: &[u8]) -> CResult<()> {
        self.core.write()?.del(key)
    }

    fn has(&self, key: &[u8]) -> CResult<bool> {
        self.core.read()?.has(key)
    }

    fn get_multi(&self, keys: &[&[u8]]) -> CResult<HashMap<Vec<u8>, Vec<u8>>> {
        self.core.read()?.get_multi(keys)
    }

    fn each(&self) -> CResult<OrderedEach<'_>> {
        let core = self.core.read()?;
        core.check_open()?;
        let entries = core.entries();
        Ok(OrderedEach { core, entries, pos: 0, jumps: 0 })
    }

    fn proc(&self, pairs: Vec<Proc<'_>>, write: bool) -> CResult<()> {
        self.core.write()?.proc(pairs, write)
    }

    fn flush(&self) -> CResult<()> {
        self.core.read()?.flush()
    }

    fn close(&self) -> CResult<()> {
        self.core.write()?.close()
    }

    fn status(&self) -> CResult<Status> {
        self.core.read()?.status()
    }
}

impl Ordered for OrderedStore {
    fn first(&self) -> CResult<(Vec<u8>, Vec<u8>)> {
        let core = self.core.read()?;
        core.check_open()?;
        match core.keydir().first() {
            Some((key, (pos, len))) => {
                let key = key.clone();
                Ok((key, core.read_at(pos, len)?))
            }
            None => Err(Error::NotFound),
        }
    }
}

/// A cursor over an ordered store, yielding records in ascending key order.
/// Holds the store's shared lock for its whole lifetime, reads values lazily,
/// and can be repositioned with `jump`.
pub struct OrderedEach<'a> {
    core: RwLockReadGuard<'a, Core<TreeKeydir>>,
    entries: Vec<(Vec<u8>, u64, u32)>,
    pos: usize,
    pub(crate) jumps: usize,
}

impl<'a> OrderedEach<'a> {
    /// Repositions the cursor at the first record whose key is greater than
    /// or equal to `key`.
    pub fn jump(&mut self, key: &[u8]) {
        self.jumps += 1;
        self.pos = self.entries.partition_point(|(k, _, _)| k.as_slice() < key);
    }

    /// The key the cursor is positioned at, without advancing.
    pub fn peek_key(&self) -> Option<&[u8]> {
        self.entries.get(self.pos).map(|(k, _, _)| k.as_slice())
    }
}

impl<'a> Iterator for OrderedEach<'a> {
    type Item = CResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, pos, len) = {
            let (key, pos, len) = self.entries.get(self.pos)?;
            (key.clone(), *pos, *len)
        };
        self.pos += 1;
        Some(self.core.read_at(pos, len).map(|value| (key, value)))
    }
}
