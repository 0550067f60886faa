use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard};
use crate::error::CResult;
use crate::storage::store::{Proc, Store};
use crate::storage::{Core, HashKeydir, Options, Status, RECORD_SUFFIX};

/// A thread-safe unordered key/value store backed by a hash-organised file:
/// an append-only log with an in-memory hash keydir rebuilt on open. Lookup
/// is O(1) average and iteration order is unspecified.
///
/// Lives in `<name>.tkh`; opening creates the file if missing and takes an
/// exclusive file lock, closing flushes and fsyncs.
pub struct RecordStore {
    core: RwLock<Core<HashKeydir>>,
}

impl RecordStore {
    /// Opens or creates a record store at `<path>.tkh`.
    pub fn open(path: impl Into<PathBuf>, opts: Options) -> CResult<Self> {
        let core = Core::open(path.into(), RECORD_SUFFIX, opts, "record")?;
        log::info!("opened record store at {}", core.path().display());
        Ok(Self { core: RwLock::new(core) })
    }
}

impl std::fmt::Display for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "record")
    }
}

impl Store for RecordStore {
    type Each<'a> = RecordEach<'a> where Self: 'a;

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

    fn each(&self) -> CResult<RecordEach<'_>> {
        let core = self.core.read()?;
        core.check_open()?;
        let entries = core.entries();
        Ok(RecordEach { core, entries, pos: 0 })
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

/// A cursor over a record store. Holds the store's shared lock for its whole
/// lifetime and reads values lazily from the log.
pub struct RecordEach<'a> {
    core: RwLockReadGuard<'a, Core<HashKeydir>>,
    entries: Vec<(Vec<u8>, u64, u32)>,
    pos: usize,
}

impl<'a> Iterator for RecordEach<'a> {
    type Item = CResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.entries.len() {
            return None;
        }
        let (key, pos, len) = {
            let entry = &mut self.entries[self.pos];
            (std::mem::take(&mut entry.0), entry.1, entry.2)
        };
        self.pos += 1;
        Some(self.core.read_at(pos, len).map(|value| (key, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn setup() -> CResult<(tempdir::TempDir, RecordStore)> {
        let dir = tempdir::TempDir::new("record")?;
        let store = RecordStore::open(dir.path().join("store"), Options::record())?;
        Ok((dir, store))
    }

    super::super::tests::test_store!(setup()?);

    /// A read-modify-write of a big-endian counter commits exactly one new
    /// entry.
    #[test]
    fn proc_increment() -> CResult<()> {
        let (_dir, s) = setup()?;
        s.set(b"n", &7u32.to_be_bytes(), true)?;
        let before = s.status()?.total_disk_size;

        s.proc(
            vec![Proc::new(b"n".to_vec(), |_, current| {
                let current = current.ok_or(Error::NotFound)?;
                let n = u32::from_be_bytes(
                    current.try_into().map_err(|_| Error::Corrupt("bad counter width".to_string()))?,
                );
                Ok(Some((n + 1).to_be_bytes().to_vec()))
            })],
            true,
        )?;

        assert_eq!(s.get(b"n")?, 8u32.to_be_bytes().to_vec());
        // One entry: 8 bytes of header, 1 byte of key, 4 bytes of value.
        assert_eq!(s.status()?.total_disk_size, before + 13);
        Ok(())
    }

    /// Reopening a store rebuilds the keydir from the log, including
    /// deletions.
    #[test]
    fn reopen_recovers() -> CResult<()> {
        let dir = tempdir::TempDir::new("record")?;
        let path = dir.path().join("store");

        let store = RecordStore::open(&path, Options::record())?;
        store.set(b"a", &[1], true)?;
        store.set(b"b", &[2], true)?;
        store.del(b"a")?;
        store.close()?;

        let store = RecordStore::open(&path, Options::record())?;
        assert_eq!(store.get(b"a"), Err(Error::NotFound));
        assert_eq!(store.get(b"b")?, vec![2]);
        Ok(())
    }

    /// The store file carries the documented suffix.
    #[test]
    fn file_suffix() -> CResult<()> {
        let dir = tempdir::TempDir::new("record")?;
        let store = RecordStore::open(dir.path().join("objects"), Options::record())?;
        store.set(b"a", &[1], true)?;
        assert!(dir.path().join("objects.tkh").exists());
        Ok(())
    }

    /// Unsupported option values are rejected at open.
    #[test]
    fn rejects_unsupported_options() -> CResult<()> {
        let dir = tempdir::TempDir::new("record")?;
        let opts = Options::record().with("record_comp_mode", "RECORD_COMP_ZSTD");
        assert!(matches!(
            RecordStore::open(dir.path().join("store"), opts),
            Err(Error::Invalid(_))
        ));
        Ok(())
    }
}
