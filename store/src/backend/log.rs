//! Append-only log file backing a single bucket. Adapted from the
//! single-file log-structured engine used elsewhere in this crate: every
//! mutation is appended as a length-prefixed entry, and the full bucket
//! contents are rebuilt by replaying the file from the start on open.
//!
//! The structure of a log entry is:
//!
//! - Key length as big-endian u32.
//! - Value length as big-endian i32, or -1 for tombstones.
//! - Key as raw bytes.
//! - Value as raw bytes (absent for tombstones).

use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use fs4::FileExt;

use crate::error::{CResult, Error};

pub struct Log {
    pub(crate) path: PathBuf,
    pub(crate) file: std::fs::File,
}

impl Log {
    /// Opens a log file, creating it if missing, and takes out an exclusive
    /// lock on it until it is closed.
    pub fn open(path: PathBuf) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|err| Error::Io(format!("{}: {:?}", err, dir)))?;
        }

        let file = std::fs::OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        file.try_lock_exclusive()
            .map_err(|err| Error::Io(format!("failed to lock {:?}: {}", path, err)))?;

        Ok(Self { path, file })
    }

    /// Replays the log from the start, rebuilding the bucket's live contents.
    /// An incomplete trailing entry (as from a crash mid-write) is discarded
    /// and the file truncated to the last complete entry.
    pub fn replay(&mut self) -> CResult<BTreeMap<Vec<u8>, Vec<u8>>> {
        let mut data = BTreeMap::new();
        let file_len = self.file.metadata()?.len();
        let mut r = BufReader::new(&mut self.file);
        let mut len_buf = [0u8; 4];
        let mut pos = r.seek(SeekFrom::Start(0))?;

        while pos < file_len {
            let mut read_entry = || -> Result<(Vec<u8>, Option<Vec<u8>>, u64), std::io::Error> {
                r.read_exact(&mut len_buf)?;
                let key_len = u32::from_be_bytes(len_buf);
                r.read_exact(&mut len_buf)?;
                let value_len = match i32::from_be_bytes(len_buf) {
                    l if l >= 0 => Some(l as u32),
                    _ => None,
                };

                let mut key = vec![0; key_len as usize];
                r.read_exact(&mut key)?;

                let value = match value_len {
                    Some(len) => {
                        let mut v = vec![0; len as usize];
                        r.read_exact(&mut v)?;
                        Some(v)
                    }
                    None => None,
                };

                let next = pos + 4 + 4 + key_len as u64 + value_len.unwrap_or(0) as u64;
                Ok((key, value, next))
            };

            match read_entry() {
                Ok((key, Some(value), next)) => {
                    data.insert(key, value);
                    pos = next;
                }
                Ok((key, None, next)) => {
                    data.remove(&key);
                    pos = next;
                }
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::warn!("truncating incomplete entry at offset {} in {:?}", pos, self.path);
                    self.file.set_len(pos)?;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(data)
    }

    /// Appends a key/value entry, using `None` for a tombstone.
    pub fn append(&mut self, key: &[u8], value: Option<&[u8]>) -> CResult<()> {
        let key_len = key.len() as u32;
        let value_len_or_tombstone = value.map_or(-1, |v| v.len() as i32);
        let len = 4 + 4 + key_len as usize + value.map_or(0, |v| v.len());

        self.file.seek(SeekFrom::End(0))?;
        let mut w = BufWriter::with_capacity(len, &mut self.file);
        w.write_all(&key_len.to_be_bytes())?;
        w.write_all(&value_len_or_tombstone.to_be_bytes())?;
        w.write_all(key)?;
        if let Some(value) = value {
            w.write_all(value)?;
        }
        w.flush()?;
        Ok(())
    }

    pub fn force_sync(&self) -> CResult<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn replay_rebuilds_live_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bucket.log");

        let mut log = Log::open(path.clone()).unwrap();
        log.append(b"a", Some(b"1")).unwrap();
        log.append(b"b", Some(b"2")).unwrap();
        log.append(b"a", Some(b"3")).unwrap();
        log.append(b"b", None).unwrap();
        drop(log);

        let mut log = Log::open(path).unwrap();
        let data = log.replay().unwrap();
        assert_eq!(data.get(b"a".as_slice()), Some(&b"3".to_vec()));
        assert_eq!(data.get(b"b".as_slice()), None);
    }

    #[test]
    fn truncates_incomplete_trailing_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bucket.log");

        let mut log = Log::open(path.clone()).unwrap();
        log.append(b"a", Some(b"1")).unwrap();
        let good_len = log.file.metadata().unwrap().len();
        log.append(b"bbbbbbbb", Some(b"2")).unwrap();
        drop(log);

        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(good_len + 3).unwrap();
        drop(f);

        let mut log = Log::open(path).unwrap();
        let data = log.replay().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data.get(b"a".as_slice()), Some(&b"1".to_vec()));
    }
}
