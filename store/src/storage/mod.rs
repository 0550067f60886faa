mod log;
pub mod store;
pub mod record;
pub mod ordered;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use serde_derive::{Deserialize, Serialize};
use crate::error::{CResult, Error};
use crate::storage::log::Log;
use crate::storage::store::Proc;

/// File suffix of unordered record stores.
pub const RECORD_SUFFIX: &str = "tkh";
/// File suffix of ordered stores.
pub const ORDERED_SUFFIX: &str = "tkt";

/// Open options for a store, carried as opaque strings. The engine interprets
/// the keys it understands and passes the rest through verbatim, so callers
/// may extend the map with engine-specific options as long as the documented
/// values are preserved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Options {
    entries: BTreeMap<String, String>,
}

impl Options {
    /// Options for an unordered record store.
    pub fn record() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert("update_mode".to_string(), "UPDATE_APPENDING".to_string());
        entries.insert("record_comp_mode".to_string(), "RECORD_COMP_NONE".to_string());
        entries.insert(
            "restore_mode".to_string(),
            "RESTORE_SYNC|RESTORE_NO_SHORTCUTS|RESTORE_WITH_HARDSYNC".to_string(),
        );
        Self { entries }
    }

    /// Options for an ordered store.
    pub fn ordered() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert("page_update_mode".to_string(), "PAGE_UPDATE_WRITE".to_string());
        entries.insert("record_comp_mode".to_string(), "RECORD_COMP_NONE".to_string());
        entries.insert("key_comparator".to_string(), "LexicalKeyComparator".to_string());
        Self { entries }
    }

    /// Adds or replaces an option.
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.entries.insert(key.to_string(), value.to_string());
        self
    }

    /// Looks up an option value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|v| v.as_str())
    }

    /// Rejects option values this engine cannot honor. Records are stored
    /// uncompressed and keys compare bytewise; everything else passes
    /// through.
    fn verify(&self) -> CResult<()> {
        if let Some(mode) = self.get("record_comp_mode") {
            if mode != "RECORD_COMP_NONE" {
                return Err(Error::Invalid(format!("unsupported record_comp_mode {mode}")));
            }
        }
        if let Some(cmp) = self.get("key_comparator") {
            if cmp != "LexicalKeyComparator" {
                return Err(Error::Invalid(format!("unsupported key_comparator {cmp}")));
            }
        }
        Ok(())
    }
}

/// Store status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The name of the store kind.
    pub name: String,

    /// The number of live keys in the store.
    pub keys: u64,

    /// The logical size of live key/value pairs.
    pub size: u64,

    /// The on-disk size of all data, live and garbage.
    pub total_disk_size: u64,

    /// The on-disk size of live data.
    pub live_disk_size: u64,

    /// The on-disk size of garbage data.
    pub garbage_disk_size: u64,
}

/// The in-memory map from key to value position and length in the log,
/// always pointing at the latest version of each key. The map shape decides
/// the store's iteration contract: a hash map for the unordered store, an
/// ordered map for the ordered store.
pub(crate) trait Keydir: Default + Send + Sync {
    fn get(&self, key: &[u8]) -> Option<(u64, u32)>;
    fn insert(&mut self, key: Vec<u8>, entry: (u64, u32));
    fn remove(&mut self, key: &[u8]);
    fn contains(&self, key: &[u8]) -> bool;
    fn len(&self) -> usize;
    /// Snapshots all entries for a cursor. The ordered keydir yields them in
    /// ascending key order.
    fn entries(&self) -> Vec<(Vec<u8>, u64, u32)>;
}

#[derive(Default)]
pub(crate) struct HashKeydir(HashMap<Vec<u8>, (u64, u32)>);

impl Keydir for HashKeydir {
    fn get(&self, key: &[u8]) -> Option<(u64, u32)> {
        self.0.get(key).copied()
    }
    fn insert(&mut self, key: Vec<u8>, entry: (u64, u32)) {
        self.0.insert(key, entry);
    }
    fn remove(&mut self, key: &[u8]) {
        self.0.remove(key);
    }
    fn contains(&self, key: &[u8]) -> bool {
        self.0.contains_key(key)
    }
    fn len(&self) -> usize {
        self.0.len()
    }
    fn entries(&self) -> Vec<(Vec<u8>, u64, u32)> {
        self.0.iter().map(|(k, (pos, len))| (k.clone(), *pos, *len)).collect()
    }
}

#[derive(Default)]
pub(crate) struct TreeKeydir(BTreeMap<Vec<u8>, (u64, u32)>);

impl TreeKeydir {
    pub(crate) fn first(&self) -> Option<(&Vec<u8>, (u64, u32))> {
        self.0.iter().next().map(|(k, e)| (k, *e))
    }
}

impl Keydir for TreeKeydir {
    fn get(&self, key: &[u8]) -> Option<(u64, u32)> {
        self.0.get(key).copied()
    }
    fn insert(&mut self, key: Vec<u8>, entry: (u64, u32)) {
        self.0.insert(key, entry);
    }
    fn remove(&mut self, key: &[u8]) {
        self.0.remove(key);
    }
    fn contains(&self, key: &[u8]) -> bool {
        self.0.contains_key(key)
    }
    fn len(&self) -> usize {
        self.0.len()
    }
    fn entries(&self) -> Vec<(Vec<u8>, u64, u32)> {
        self.0.iter().map(|(k, (pos, len))| (k.clone(), *pos, *len)).collect()
    }
}

/// The store core shared by both keydir shapes: an append-only log plus the
/// keydir over it. The owning store wraps this in a reader/writer lock; every
/// method here runs under one acquisition of it.
pub(crate) struct Core<K: Keydir> {
    log: Log,
    keydir: K,
    name: &'static str,
    closed: bool,
}

impl<K: Keydir> Core<K> {
    pub fn open(path: PathBuf, suffix: &str, opts: Options, name: &'static str) -> CResult<Self> {
        opts.verify()?;
        let mut path = path;
        path.set_extension(suffix);
        let mut log = Log::new(path)?;
        let mut keydir = K::default();
        log.replay(|key, entry| match entry {
            Some(entry) => keydir.insert(key, entry),
            None => keydir.remove(&key),
        })?;
        Ok(Self { log, keydir, name, closed: false })
    }

    pub fn check_open(&self) -> CResult<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.log.path
    }

    pub fn get(&self, key: &[u8]) -> CResult<Vec<u8>> {
        self.check_open()?;
        match self.keydir.get(key) {
            Some((pos, len)) => self.log.read_value(pos, len),
            None => Err(Error::NotFound),
        }
    }

    pub fn set(&mut self, key: &[u8], value: &[u8], overwrite: bool) -> CResult<()> {
        self.check_open()?;
        if !overwrite && self.keydir.contains(key) {
            return Err(Error::AlreadyExists);
        }
        self.write(key, value)
    }

    pub fn del(&mut self, key: &[u8]) -> CResult<()> {
        self.check_open()?;
        if !self.keydir.contains(key) {
            return Err(Error::NotFound);
        }
        self.remove(key)
    }

    pub fn has(&self, key: &[u8]) -> CResult<bool> {
        self.check_open()?;
        Ok(self.keydir.contains(key))
    }

    pub fn get_multi(&self, keys: &[&[u8]]) -> CResult<HashMap<Vec<u8>, Vec<u8>>> {
        self.check_open()?;
        let mut result = HashMap::with_capacity(keys.len());
        for &key in keys {
            if let Some((pos, len)) = self.keydir.get(key) {
                result.insert(key.to_vec(), self.log.read_value(pos, len)?);
            }
        }
        Ok(result)
    }

    pub fn proc(&mut self, mut pairs: Vec<Proc<'_>>, write: bool) -> CResult<()> {
        self.check_open()?;

        // Phase one: compute every replacement against the current bytes.
        // The first failure aborts the transaction before anything is
        // written.
        let mut currents = Vec::with_capacity(pairs.len());
        let mut results = Vec::with_capacity(pairs.len());
        for pair in pairs.iter_mut() {
            let current = match self.keydir.get(pair.key()) {
                Some((pos, len)) => Some(self.log.read_value(pos, len)?),
                None => None,
            };
            let result = pair.apply(current.as_deref())?;
            currents.push(current);
            results.push(result);
        }

        // Phase two: commit the remembered results. Bytes equal to the
        // current value append nothing; an absent result deletes the key.
        for (i, pair) in pairs.iter().enumerate() {
            match &results[i] {
                Some(value) => {
                    if currents[i].as_deref() == Some(value.as_slice()) {
                        continue;
                    }
                    if !write {
                        return Err(Error::Invalid("mutation in read-only proc".to_string()));
                    }
                    self.write(pair.key(), value)?;
                }
                None => {
                    if currents[i].is_none() {
                        continue;
                    }
                    if !write {
                        return Err(Error::Invalid("mutation in read-only proc".to_string()));
                    }
                    self.remove(pair.key())?;
                }
            }
        }
        Ok(())
    }

    pub fn flush(&self) -> CResult<()> {
        self.check_open()?;
        self.log.sync()
    }

    pub fn close(&mut self) -> CResult<()> {
        self.check_open()?;
        self.log.sync()?;
        self.log.unlock()?;
        self.closed = true;
        Ok(())
    }

    pub fn status(&self) -> CResult<Status> {
        self.check_open()?;
        let keys = self.keydir.len() as u64;
        let size = self
            .keydir
            .entries()
            .iter()
            .fold(0, |size, (key, _, len)| size + key.len() as u64 + *len as u64);
        let total_disk_size = self.log.disk_size()?;
        let live_disk_size = size + 8 * keys; // account for length prefixes
        let garbage_disk_size = total_disk_size - live_disk_size;
        Ok(Status {
            name: self.name.to_string(),
            keys,
            size,
            total_disk_size,
            live_disk_size,
            garbage_disk_size,
        })
    }

    pub fn entries(&self) -> Vec<(Vec<u8>, u64, u32)> {
        self.keydir.entries()
    }

    pub fn read_at(&self, pos: u64, len: u32) -> CResult<Vec<u8>> {
        self.log.read_value(pos, len)
    }

    pub(crate) fn keydir(&self) -> &K {
        &self.keydir
    }

    fn write(&mut self, key: &[u8], value: &[u8]) -> CResult<()> {
        let (pos, len) = self.log.write_entry(key, Some(value))?;
        let value_len = value.len() as u32;
        self.keydir.insert(key.to_vec(), (pos + len as u64 - value_len as u64, value_len));
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> CResult<()> {
        self.log.write_entry(key, None)?;
        self.keydir.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {

    /// Generates the shared contract tests for any Store implementation. The
    /// setup expression must evaluate to `(guard, store)` where the guard
    /// keeps the backing directory alive for the duration of the test.
    macro_rules! test_store {
        ($setup:expr) => {
            /// Tests point operations: get, set, del, has.
            #[test]
            fn point_ops() -> CResult<()> {
                let (_dir, s) = $setup;

                // Getting or deleting a missing key is a domain outcome, not
                // a failure.
                assert_eq!(s.get(b"a"), Err(Error::NotFound));
                assert_eq!(s.del(b"a"), Err(Error::NotFound));
                assert_eq!(s.has(b"a")?, false);

                s.set(b"a", &[1], true)?;
                assert_eq!(s.get(b"a")?, vec![1]);
                assert_eq!(s.has(b"a")?, true);

                s.set(b"b", &[2], true)?;
                assert_eq!(s.get(b"b")?, vec![2]);
                assert_eq!(s.get(b"a")?, vec![1]);

                // Replacing a value.
                s.set(b"a", &[0], true)?;
                assert_eq!(s.get(b"a")?, vec![0]);

                s.del(b"a")?;
                assert_eq!(s.get(b"a"), Err(Error::NotFound));
                assert_eq!(s.get(b"b")?, vec![2]);
                assert_eq!(s.del(b"a"), Err(Error::NotFound));

                Ok(())
            }

            /// Empty keys and values are as valid as any other.
            #[test]
            fn point_ops_empty() -> CResult<()> {
                let (_dir, s) = $setup;
                assert_eq!(s.get(b""), Err(Error::NotFound));
                s.set(b"", &[], true)?;
                assert_eq!(s.get(b"")?, Vec::<u8>::new());
                s.del(b"")?;
                assert_eq!(s.get(b""), Err(Error::NotFound));
                Ok(())
            }

            /// set with overwrite=false refuses to clobber and leaves the
            /// record untouched.
            #[test]
            fn no_overwrite() -> CResult<()> {
                let (_dir, s) = $setup;
                s.set(b"k", b"v", true)?;
                assert_eq!(s.set(b"k", b"v2", false), Err(Error::AlreadyExists));
                assert_eq!(s.get(b"k")?, b"v".to_vec());
                // overwrite=false on a missing key is an ordinary insert.
                s.set(b"k2", b"v2", false)?;
                assert_eq!(s.get(b"k2")?, b"v2".to_vec());
                Ok(())
            }

            /// get_multi omits missing keys and reads one atomic snapshot.
            #[test]
            fn get_multi() -> CResult<()> {
                let (_dir, s) = $setup;
                s.set(b"a", &[1], true)?;
                s.set(b"b", &[2], true)?;
                s.set(b"c", &[3], true)?;

                let result = s.get_multi(&[b"a", b"c", b"x"])?;
                assert_eq!(result.len(), 2);
                assert_eq!(result.get(b"a".as_slice()), Some(&vec![1]));
                assert_eq!(result.get(b"c".as_slice()), Some(&vec![3]));
                assert_eq!(result.get(b"x".as_slice()), None);

                assert_eq!(s.get_multi(&[])?.len(), 0);
                Ok(())
            }

            /// each() yields every live record, and every call creates a
            /// fresh cursor.
            #[test]
            fn each_restartable() -> CResult<()> {
                let (_dir, s) = $setup;
                s.set(b"a", &[1], true)?;
                s.set(b"b", &[2], true)?;
                s.set(b"c", &[3], true)?;
                s.del(b"b")?;

                let mut rows = s.each()?.collect::<CResult<Vec<_>>>()?;
                rows.sort();
                assert_eq!(rows, vec![(b"a".to_vec(), vec![1]), (b"c".to_vec(), vec![3])]);

                // A second cursor starts over.
                let mut again = s.each()?.collect::<CResult<Vec<_>>>()?;
                again.sort();
                assert_eq!(again, rows);
                Ok(())
            }

            /// A successful proc commits every pair at once.
            #[test]
            fn proc_commit() -> CResult<()> {
                let (_dir, s) = $setup;
                s.set(b"a", &[1], true)?;

                s.proc(
                    vec![
                        Proc::new(b"a".to_vec(), |_, current| {
                            assert_eq!(current, Some([1].as_slice()));
                            Ok(Some(vec![10]))
                        }),
                        Proc::new(b"b".to_vec(), |_, current| {
                            assert_eq!(current, None);
                            Ok(Some(vec![20]))
                        }),
                    ],
                    true,
                )?;

                assert_eq!(s.get(b"a")?, vec![10]);
                assert_eq!(s.get(b"b")?, vec![20]);
                Ok(())
            }

            /// Any apply error aborts the whole transaction; no key changes.
            #[test]
            fn proc_abort() -> CResult<()> {
                let (_dir, s) = $setup;
                s.set(b"a", &[1], true)?;

                let result = s.proc(
                    vec![
                        Proc::new(b"a".to_vec(), |_, _| Ok(Some(vec![10]))),
                        Proc::new(b"b".to_vec(), |_, _| {
                            Err(Error::Invalid("nope".to_string()))
                        }),
                    ],
                    true,
                );
                assert_eq!(result, Err(Error::Invalid("nope".to_string())));

                assert_eq!(s.get(b"a")?, vec![1]);
                assert_eq!(s.get(b"b"), Err(Error::NotFound));
                Ok(())
            }

            /// An apply returning the current bytes appends nothing.
            #[test]
            fn proc_no_churn() -> CResult<()> {
                let (_dir, s) = $setup;
                s.set(b"a", &[1], true)?;
                let before = s.status()?.total_disk_size;

                s.proc(
                    vec![Proc::new(b"a".to_vec(), |_, current| {
                        Ok(current.map(|c| c.to_vec()))
                    })],
                    true,
                )?;

                assert_eq!(s.status()?.total_disk_size, before);
                assert_eq!(s.get(b"a")?, vec![1]);
                Ok(())
            }

            /// An absent apply result deletes the key; deleting an absent
            /// key is a no-op.
            #[test]
            fn proc_delete() -> CResult<()> {
                let (_dir, s) = $setup;
                s.set(b"a", &[1], true)?;

                s.proc(
                    vec![
                        Proc::new(b"a".to_vec(), |_, _| Ok(None)),
                        Proc::new(b"b".to_vec(), |_, _| Ok(None)),
                    ],
                    true,
                )?;
                assert_eq!(s.get(b"a"), Err(Error::NotFound));
                assert_eq!(s.get(b"b"), Err(Error::NotFound));
                Ok(())
            }

            /// write=false permits reads but fails on any required mutation.
            #[test]
            fn proc_read_only() -> CResult<()> {
                let (_dir, s) = $setup;
                s.set(b"a", &[1], true)?;

                // Pure read: echo the current bytes back.
                s.proc(
                    vec![Proc::new(b"a".to_vec(), |_, current| {
                        Ok(current.map(|c| c.to_vec()))
                    })],
                    false,
                )?;

                let result = s.proc(
                    vec![Proc::new(b"a".to_vec(), |_, _| Ok(Some(vec![9])))],
                    false,
                );
                assert!(matches!(result, Err(Error::Invalid(_))));
                assert_eq!(s.get(b"a")?, vec![1]);
                Ok(())
            }

            /// Operations on a closed store fail with Closed.
            #[test]
            fn closed() -> CResult<()> {
                let (_dir, s) = $setup;
                s.set(b"a", &[1], true)?;
                s.close()?;

                assert_eq!(s.get(b"a"), Err(Error::Closed));
                assert_eq!(s.set(b"a", &[2], true), Err(Error::Closed));
                assert_eq!(s.del(b"a"), Err(Error::Closed));
                assert_eq!(s.has(b"a"), Err(Error::Closed));
                assert_eq!(s.flush(), Err(Error::Closed));
                assert_eq!(s.close(), Err(Error::Closed));
                Ok(())
            }

            /// Implementation-independent aspects of Status.
            #[test]
            fn status() -> CResult<()> {
                let (_dir, s) = $setup;
                s.set(b"foo", &[1, 2, 3], true)?;
                s.set(b"bar", &[1], true)?;
                s.del(b"bar")?;
                s.set(b"baz", &[1], true)?;
                s.set(b"baz", &[2], true)?;
                s.set(b"baz", &[3], true)?;

                let status = s.status()?;
                assert!(status.name.len() > 0);
                assert_eq!(status.keys, 2);
                assert_eq!(status.size, 10);
                assert!(status.total_disk_size >= status.live_disk_size);
                Ok(())
            }

            /// Runs random operations against both the store and a
            /// known-good BTreeMap, comparing each result and the final
            /// state.
            #[test]
            fn random_ops() -> CResult<()> {
                const NUM_OPS: u64 = 1000;

                use rand::{seq::SliceRandom, Rng, RngCore};
                let seed: u64 = rand::thread_rng().gen();
                let mut rng: rand::rngs::StdRng = rand::SeedableRng::seed_from_u64(seed);
                println!("seed = {}", seed);

                let (_dir, s) = $setup;
                let mut keys: Vec<Vec<u8>> = Vec::new();
                let mut m = std::collections::BTreeMap::new();

                // Pick an already-used key with 80% probability, or generate
                // a new key.
                let mut random_key = |mut rng: &mut rand::rngs::StdRng| -> Vec<u8> {
                    if rng.gen::<f64>() < 0.8 && !keys.is_empty() {
                        keys.choose(&mut rng).unwrap().clone()
                    } else {
                        let mut key = vec![0; rng.gen_range(0..=16)];
                        rng.fill_bytes(&mut key);
                        keys.push(key.clone());
                        key
                    }
                };

                let random_value = |rng: &mut rand::rngs::StdRng| -> Vec<u8> {
                    let mut value = vec![0; rng.gen_range(0..=16)];
                    rng.fill_bytes(&mut value);
                    value
                };

                for _ in 0..NUM_OPS {
                    match rng.gen_range(0..=3) {
                        0 => {
                            let key = random_key(&mut rng);
                            let value = random_value(&mut rng);
                            s.set(&key, &value, true)?;
                            m.insert(key, value);
                        }
                        1 => {
                            let key = random_key(&mut rng);
                            match m.remove(&key) {
                                Some(_) => s.del(&key)?,
                                None => assert_eq!(s.del(&key), Err(Error::NotFound)),
                            }
                        }
                        2 => {
                            let key = random_key(&mut rng);
                            match m.get(&key) {
                                Some(value) => assert_eq!(&s.get(&key)?, value),
                                None => assert_eq!(s.get(&key), Err(Error::NotFound)),
                            }
                        }
                        3 => {
                            let key = random_key(&mut rng);
                            assert_eq!(s.has(&key)?, m.contains_key(&key));
                        }
                        _ => unreachable!(),
                    }
                }

                // Compare the final states.
                let mut state = s.each()?.collect::<CResult<Vec<_>>>()?;
                state.sort();
                let expect = m.into_iter().collect::<Vec<_>>();
                assert_eq!(state, expect);

                Ok(())
            }
        };
    }

    pub(super) use test_store; // export for use in submodules
}
