//! Atomic persistence of a single record through two alternating files.
//!
//! Each write goes to the file holding the older copy, stamped with a
//! sequence number one higher than the newest copy. On load both files are
//! read and the valid copy with the higher sequence number wins, so a torn
//! write only ever damages the copy that was already stale.
//!
//! # File format
//!
//! ```text
//! magic "ABPB" | seq: u64 LE | len: u32 LE | crc32(seq || payload): u32 LE | payload
//! ```
//!
//! The payload is the bincode encoding of the record. A zero-length file
//! has never been written.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::common::{Error, Result, ResultExt};

const MAGIC: [u8; 4] = *b"ABPB";
const HEADER_LEN: usize = 4 + 8 + 4 + 4;

const SCRATCH_FILE: &str = ".write_check";

/// Checks that `dir` exists and is a directory this process can create
/// files in.
pub fn check_state_dir(dir: &Path) -> Result<()> {
    let meta = fs::metadata(dir).context(format!("state directory {}", dir.display()))?;
    if !meta.is_dir() {
        return Err(Error::Config(format!("{} is not a directory", dir.display())));
    }
    let scratch = dir.join(SCRATCH_FILE);
    File::create(&scratch)
        .and_then(|_| fs::remove_file(&scratch))
        .map_err(|e| Error::Config(format!("{} is not writable: {e}", dir.display())))
}

/// Fsyncs a directory so entries created in it survive a crash.
pub fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .context(format!("syncing directory {}", dir.display()))
}

pub(crate) fn encode_record<T: Serialize>(seq: u64, value: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(value)?;
    let mut crc = crc32fast::Hasher::new();
    crc.update(&seq.to_le_bytes());
    crc.update(&payload);

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc.finalize().to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

pub(crate) fn decode_record<T: DeserializeOwned>(buf: &[u8]) -> Result<(u64, T)> {
    if buf.len() < HEADER_LEN {
        return Err(Error::Codec(format!("record too short: {} bytes", buf.len())));
    }
    if buf[0..4] != MAGIC {
        return Err(Error::Codec("bad magic".into()));
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[4..12]);
    let seq = u64::from_le_bytes(word);
    let mut half = [0u8; 4];
    half.copy_from_slice(&buf[12..16]);
    let len = u32::from_le_bytes(half) as usize;
    half.copy_from_slice(&buf[16..20]);
    let expected = u32::from_le_bytes(half);

    let payload = &buf[HEADER_LEN..];
    if payload.len() != len {
        return Err(Error::Codec(format!("payload is {} bytes, header says {len}", payload.len())));
    }
    let mut crc = crc32fast::Hasher::new();
    crc.update(&seq.to_le_bytes());
    crc.update(payload);
    let actual = crc.finalize();
    if actual != expected {
        return Err(Error::Codec(format!("checksum mismatch: expected {expected:08x}, got {actual:08x}")));
    }
    Ok((seq, bincode::deserialize(payload)?))
}

/// Writes `bytes` to an existing file and flushes it to stable storage.
pub(crate) fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

enum Slot<T> {
    Empty,
    Valid(u64, T),
    Invalid(Error),
}

fn read_slot<T: DeserializeOwned>(path: &Path) -> Result<Slot<T>> {
    let mut buf = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut buf))
        .context(format!("reading {}", path.display()))?;
    if buf.is_empty() {
        return Ok(Slot::Empty);
    }
    Ok(match decode_record(&buf) {
        Ok((seq, value)) => Slot::Valid(seq, value),
        Err(e) => Slot::Invalid(e),
    })
}

/// A record persisted atomically through `<name>_a.pb` and `<name>_b.pb`.
pub struct Persister<T> {
    paths: [PathBuf; 2],
    /// Sequence number of the newest good copy on disk.
    seq: u64,
    /// Slot the next write goes to: the one not holding the newest copy.
    next_slot: usize,
    _record: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> Persister<T> {
    /// Opens the pair in `dir`, creating empty files if missing, and
    /// returns the newest persisted value, if any.
    pub fn open(dir: &Path, name: &str) -> Result<(Self, Option<T>)> {
        check_state_dir(dir)?;
        let paths = [dir.join(format!("{name}_a.pb")), dir.join(format!("{name}_b.pb"))];

        let mut created = false;
        for path in &paths {
            if !path.exists() {
                File::create(path)
                    .and_then(|f| f.sync_all())
                    .context(format!("creating {}", path.display()))?;
                created = true;
            }
        }
        if created {
            sync_dir(dir)?;
        }

        let a = read_slot::<T>(&paths[0])?;
        let b = read_slot::<T>(&paths[1])?;
        let (seq, slot, value) = match (a, b) {
            (Slot::Empty, Slot::Empty) => (0, None, None),
            (Slot::Valid(sa, _), Slot::Valid(sb, _)) if sa == sb => {
                return Err(Error::Corrupt(format!("{name}: both copies carry sequence number {sa}")));
            }
            (Slot::Valid(sa, va), Slot::Valid(sb, vb)) => {
                if sa > sb {
                    (sa, Some(0), Some(va))
                } else {
                    (sb, Some(1), Some(vb))
                }
            }
            (Slot::Valid(s, v), other) => {
                Self::tolerate(name, &paths[1], other);
                (s, Some(0), Some(v))
            }
            (other, Slot::Valid(s, v)) => {
                Self::tolerate(name, &paths[0], other);
                (s, Some(1), Some(v))
            }
            // Copy b is only ever written after a good copy a, so this is a
            // torn first write: nothing based on it ever left the process.
            (Slot::Invalid(e), Slot::Empty) => {
                warn!(name, error = %e, "first write never completed, starting fresh");
                (0, None, None)
            }
            (Slot::Invalid(e), _) | (_, Slot::Invalid(e)) => {
                return Err(Error::Corrupt(format!("{name}: no readable copy: {e}")));
            }
        };
        debug!(name, seq, "opened persisted record");

        let persister = Persister {
            paths,
            seq,
            next_slot: slot.map_or(0, |s| 1 - s),
            _record: PhantomData,
        };
        Ok((persister, value))
    }

    fn tolerate(name: &str, path: &Path, slot: Slot<T>) {
        if let Slot::Invalid(e) = slot {
            warn!(name, path = %path.display(), error = %e, "ignoring unreadable copy");
        }
    }

    /// Durably replaces the record with `value`.
    pub fn persist(&mut self, value: &T) -> Result<()> {
        let seq = self.seq + 1;
        let bytes = encode_record(seq, value)?;
        let path = &self.paths[self.next_slot];
        write_synced(path, &bytes).context(format!("writing {}", path.display()))?;
        self.seq = seq;
        self.next_slot = 1 - self.next_slot;
        Ok(())
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        view: u64,
        note: String,
    }

    fn record(view: u64) -> Record {
        Record { view, note: format!("view {view}") }
    }

    fn corrupt(path: &Path) {
        let mut bytes = fs::read(path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_fresh_dir_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (p, value) = Persister::<Record>::open(dir.path(), "inner").unwrap();
        assert!(value.is_none());
        assert_eq!(p.seq(), 0);
        assert!(dir.path().join("inner_a.pb").exists());
        assert!(dir.path().join("inner_b.pb").exists());
    }

    #[test]
    fn test_persist_twice_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (mut p, _) = Persister::open(dir.path(), "inner").unwrap();
        p.persist(&record(3)).unwrap();
        p.persist(&record(3)).unwrap();

        let (p, value) = Persister::<Record>::open(dir.path(), "inner").unwrap();
        assert_eq!(value, Some(record(3)));
        assert_eq!(p.seq(), 2);
    }

    #[test]
    fn test_newest_copy_wins() {
        let dir = tempfile::tempdir().unwrap();
        let (mut p, _) = Persister::open(dir.path(), "inner").unwrap();
        for view in 1..=5 {
            p.persist(&record(view)).unwrap();
        }
        let (_, value) = Persister::<Record>::open(dir.path(), "inner").unwrap();
        assert_eq!(value, Some(record(5)));
    }

    #[test]
    fn test_one_corrupt_copy_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let (mut p, _) = Persister::open(dir.path(), "inner").unwrap();
        p.persist(&record(1)).unwrap(); // slot a
        p.persist(&record(2)).unwrap(); // slot b
        corrupt(&dir.path().join("inner_b.pb"));

        let (mut p, value) = Persister::<Record>::open(dir.path(), "inner").unwrap();
        assert_eq!(value, Some(record(1)));

        // The next write overwrites the damaged copy, not the good one.
        p.persist(&record(3)).unwrap();
        let (_, value) = Persister::<Record>::open(dir.path(), "inner").unwrap();
        assert_eq!(value, Some(record(3)));
        corrupt(&dir.path().join("inner_b.pb"));
        let (_, value) = Persister::<Record>::open(dir.path(), "inner").unwrap();
        assert_eq!(value, Some(record(1)));
    }

    #[test]
    fn test_torn_first_write_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let (mut p, _) = Persister::open(dir.path(), "inner").unwrap();
        p.persist(&record(1)).unwrap();
        let path = dir.path().join("inner_a.pb");
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        let (mut p, value) = Persister::<Record>::open(dir.path(), "inner").unwrap();
        assert!(value.is_none());
        assert_eq!(p.seq(), 0);

        p.persist(&record(2)).unwrap();
        let (_, value) = Persister::<Record>::open(dir.path(), "inner").unwrap();
        assert_eq!(value, Some(record(2)));
    }

    #[test]
    fn test_torn_second_write_keeps_first_copy() {
        let dir = tempfile::tempdir().unwrap();
        let (mut p, _) = Persister::open(dir.path(), "inner").unwrap();
        p.persist(&record(1)).unwrap();
        p.persist(&record(2)).unwrap();
        let path = dir.path().join("inner_b.pb");
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        let (_, value) = Persister::<Record>::open(dir.path(), "inner").unwrap();
        assert_eq!(value, Some(record(1)));
    }

    #[test]
    fn test_state_dir_check_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        check_state_dir(dir.path()).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

        let file = dir.path().join("plain");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(check_state_dir(&file), Err(Error::Config(_))));
    }

    #[test]
    fn test_both_corrupt_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (mut p, _) = Persister::open(dir.path(), "inner").unwrap();
        p.persist(&record(1)).unwrap();
        p.persist(&record(2)).unwrap();
        corrupt(&dir.path().join("inner_a.pb"));
        corrupt(&dir.path().join("inner_b.pb"));

        let err = Persister::<Record>::open(dir.path(), "inner").err().unwrap();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_equal_sequence_numbers_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (mut p, _) = Persister::open(dir.path(), "inner").unwrap();
        p.persist(&record(1)).unwrap();
        fs::copy(dir.path().join("inner_a.pb"), dir.path().join("inner_b.pb")).unwrap();

        let err = Persister::<Record>::open(dir.path(), "inner").err().unwrap();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_missing_dir_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(Persister::<Record>::open(&missing, "inner").is_err());
        assert!(!missing.exists());
    }
}
