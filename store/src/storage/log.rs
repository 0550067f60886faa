use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt as OsFileExt;
use std::path::PathBuf;
use fs4::FileExt;
use crate::error::CResult;

/// An append-only log file, containing a sequence of key/value entries encoded as follows:
///
/// - Key length as big-endian u32.
/// - Value length as big-endian i32, or -1 for tombstones.
/// - Key as raw bytes (max 2 GB).
/// - Value as raw bytes (max 2 GB).
///
/// Writes go through the keydir owner's exclusive lock; value reads are
/// positioned (`read_at`) so cursors can read through a shared lock.
pub(crate) struct Log {
    /// Path to the log file.
    pub(crate) path: PathBuf,
    /// The opened file containing the log.
    pub(crate) file: std::fs::File,
}

impl Log {
    /// Opens a log file, or creates one if it does not exist.
    /// Takes out an exclusive lock on the file until it is closed, or errors if the lock is already held.
    pub fn new(path: PathBuf) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let file = std::fs::OpenOptions::new()
                            .read(true)
                            .write(true)
                            .create(true)
                            .open(&path)?;

        file.try_lock_exclusive()?;

        Ok(Self { path, file })
    }

    /// Replays the log from the start, invoking `apply` for every entry with
    /// the key and the value position/length, or `None` for tombstones. Used
    /// to rebuild the keydir when a store is opened.
    ///
    /// If an incomplete entry is found at the end of the file it is assumed
    /// to be a torn write and the file is truncated to the last whole entry.
    pub fn replay(&mut self, mut apply: impl FnMut(Vec<u8>, Option<(u64, u32)>)) -> CResult<()> {
        let mut len_buf = [0u8; 4];
        let file_len = self.file.metadata()?.len();
        let mut r = BufReader::new(&mut self.file);
        let mut pos = r.seek(SeekFrom::Start(0))?;

        while pos < file_len {
            // Read the next entry from the file, returning the key, value
            // position, and value length or None for tombstones.
            let mut result = || -> Result<(Vec<u8>, u64, Option<u32>), std::io::Error> {
                r.read_exact(&mut len_buf)?;
                let key_len = u32::from_be_bytes(len_buf);
                r.read_exact(&mut len_buf)?;
                let value_len_or_tombstone = match i32::from_be_bytes(len_buf) {
                    l if l >= 0 => Some(l as u32),
                    _ => None, // -1 for tombstones
                };
                let value_pos = pos + 4 + 4 + key_len as u64;

                let mut key = vec![0; key_len as usize];
                r.read_exact(&mut key)?;

                if let Some(value_len) = value_len_or_tombstone {
                    if value_pos + value_len as u64 > file_len {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "value extends beyond end of file",
                        ));
                    }
                    r.seek_relative(value_len as i64)?; // avoids discarding buffer
                }

                Ok((key, value_pos, value_len_or_tombstone))
            };

            match result() {
                Ok((key, value_pos, Some(value_len))) => {
                    pos = value_pos + value_len as u64;
                    apply(key, Some((value_pos, value_len)));
                }
                Ok((key, value_pos, None)) => {
                    pos = value_pos;
                    apply(key, None);
                }

                // If an incomplete entry was found at the end of the file, assume an
                // incomplete write and truncate the file.
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::error!("Found incomplete entry at offset {}, truncating file", pos);
                    self.file.set_len(pos)?;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }

    /// Reads a value from the given position. Positioned, so it works through
    /// a shared reference while a cursor holds the store's read lock.
    pub fn read_value(&self, value_pos: u64, value_len: u32) -> CResult<Vec<u8>> {
        let mut value = vec![0; value_len as usize];
        self.file.read_exact_at(&mut value, value_pos)?;
        Ok(value)
    }

    /// Appends a key/value entry to the log file, using a None value for
    /// tombstones. Returns the position and length of the entry.
    pub fn write_entry(&mut self, key: &[u8], value: Option<&[u8]>) -> CResult<(u64, u32)> {
        let key_len = key.len() as u32;
        let value_len = value.map_or(0, |v| v.len() as u32);
        let value_len_or_tombstone = value.map_or(-1, |v| v.len() as i32);
        let len = 4 + 4 + key_len + value_len;

        let pos = self.file.seek(SeekFrom::End(0))?;
        let mut w = BufWriter::with_capacity(len as usize, &mut self.file);
        w.write_all(&key_len.to_be_bytes())?;
        w.write_all(&value_len_or_tombstone.to_be_bytes())?;
        w.write_all(key)?;
        if let Some(value) = value {
            w.write_all(value)?;
        }
        w.flush()?;

        Ok((pos, len))
    }

    /// Fsyncs the log file.
    pub fn sync(&self) -> CResult<()> {
        Ok(self.file.sync_all()?)
    }

    /// Total size of the log file in bytes.
    pub fn disk_size(&self) -> CResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Releases the file lock. Called on close; dropping the file would also
    /// release it, but close should not depend on drop order.
    pub fn unlock(&self) -> CResult<()> {
        Ok(self.file.unlock()?)
    }
}
