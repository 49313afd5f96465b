//! Commit journal for the local store.
//!
//! Every local write appends one [`CommitEntry`] so the local backend keeps
//! the same audit trail as a remote commit history. The file is a short
//! header followed by length-prefixed MessagePack entries, each trailed by a
//! CRC32 of its body. A torn tail left by a crash is cut off when found.
//!
//! Several stores, in one process or many, may share a journal. Every
//! operation holds an exclusive lock on a sidecar `.lock` file and reopens
//! the journal, so sequence numbers come from the file itself. The header
//! carries a generation that each rewrite bumps; together with the file
//! length it tells an instance whether its cached cursor is still current.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::locks::FileLock;
use crate::error::{Result, StoreError};
use crate::types::{Timestamp, Version};

/// Magic bytes for the journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"RDJ\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Magic, format version and a `u64` generation.
const HEADER_LEN: u64 = 13;

/// Largest entry accepted when reading.
const MAX_ENTRY_LEN: usize = 16 * 1024 * 1024;

/// Why an entry was recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitKind {
    /// A document write.
    Write,
    /// A survivor of history compaction.
    Compacted,
}

/// One recorded commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub seq: u64,
    pub kind: CommitKind,
    pub path: String,
    pub version: Version,
    pub message: String,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
}

/// Summary of a [`CommitJournal::rewrite`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rewrite {
    pub entries_before: u64,
    /// Sequence number of the newest entry before the rewrite.
    pub previous_head: u64,
    pub kept: u64,
}

/// Where the file stood when this instance last held the lock.
#[derive(Clone, Copy, Debug)]
struct Cursor {
    generation: u64,
    len: u64,
    next_seq: u64,
}

/// Append-only commit log.
pub struct CommitJournal {
    path: PathBuf,
    lock_path: PathBuf,
    cursor: Mutex<Option<Cursor>>,
}

impl std::fmt::Debug for CommitJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitJournal")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl CommitJournal {
    /// Create or open a journal file, truncating any torn tail.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let journal = Self {
            lock_path: path.with_extension("lock"),
            path,
            cursor: Mutex::new(None),
        };
        journal.with_file(|_, _| Ok(()))?;
        Ok(journal)
    }

    /// Record a write and make it durable.
    pub fn append(&self, path: &str, version: &Version, message: &str) -> Result<CommitEntry> {
        self.with_file(|file, cursor| {
            let entry = CommitEntry {
                seq: cursor.next_seq,
                kind: CommitKind::Write,
                path: path.to_string(),
                version: version.clone(),
                message: message.to_string(),
                timestamp: Timestamp::now().as_secs(),
            };

            let mut writer = BufWriter::new(file);
            let written = Self::write_entry(&mut writer, &entry)?;
            writer.flush()?;
            drop(writer);
            file.sync_data()?;

            cursor.len += written;
            cursor.next_seq += 1;
            Ok(entry)
        })
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> Result<Vec<CommitEntry>> {
        self.with_file(|file, _| {
            let (_, mut reader) = Self::reader(file)?;
            Ok(Self::scan(&mut reader)?.0)
        })
    }

    /// Sequence number of the newest entry, or 0 when empty.
    pub fn head(&self) -> Result<u64> {
        self.with_file(|_, cursor| Ok(cursor.next_seq - 1))
    }

    /// Replace the journal with one `Compacted` entry per surviving path.
    ///
    /// `survivors` runs while the journal is locked, so an append that
    /// races with it lands after the rewrite instead of being dropped. The
    /// new file is written beside the old one and renamed over it.
    pub fn rewrite(
        &self,
        message: &str,
        survivors: impl FnOnce() -> Result<Vec<(String, Version)>>,
    ) -> Result<Rewrite> {
        self.with_file(|file, cursor| {
            let (_, mut reader) = Self::reader(file)?;
            let (before, _) = Self::scan(&mut reader)?;

            let timestamp = Timestamp::now().as_secs();
            let entries: Vec<CommitEntry> = survivors()?
                .into_iter()
                .enumerate()
                .map(|(i, (path, version))| CommitEntry {
                    seq: i as u64 + 1,
                    kind: CommitKind::Compacted,
                    path,
                    version,
                    message: message.to_string(),
                    timestamp,
                })
                .collect();

            let generation = cursor.generation + 1;
            let tmp = self.path.with_extension("log.tmp");
            Self::write_fresh(&tmp, generation, &entries)?;
            fs::rename(&tmp, &self.path)?;

            let rewrite = Rewrite {
                entries_before: before.len() as u64,
                previous_head: cursor.next_seq - 1,
                kept: entries.len() as u64,
            };
            *cursor = Cursor {
                generation,
                len: fs::metadata(&self.path)?.len(),
                next_seq: entries.len() as u64 + 1,
            };
            Ok(rewrite)
        })
    }

    /// Run `work` on the journal file with both locks held and the cursor
    /// brought up to date with whatever other instances wrote.
    fn with_file<T>(&self, work: impl FnOnce(&File, &mut Cursor) -> Result<T>) -> Result<T> {
        let mut cached = self.cursor.lock();
        let _lock = FileLock::acquire_blocking(&self.lock_path)?;

        if !self.path.exists() {
            Self::write_fresh(&self.path, 1, &[])?;
        }
        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        let mut cursor = self.sync_cursor(&file, *cached)?;

        let result = work(&file, &mut cursor);
        *cached = result.is_ok().then_some(cursor);
        result
    }

    fn sync_cursor(&self, file: &File, cached: Option<Cursor>) -> Result<Cursor> {
        let len = file.metadata()?.len();
        let (generation, mut reader) = Self::reader(file)?;
        if let Some(cursor) = cached.filter(|c| c.generation == generation && c.len == len) {
            return Ok(cursor);
        }

        let (entries, valid_len) = Self::scan(&mut reader)?;
        if valid_len < len {
            warn!(
                journal = %self.path.display(),
                dropped_bytes = len - valid_len,
                "Truncating torn journal tail"
            );
            file.set_len(valid_len)?;
        }

        Ok(Cursor {
            generation,
            len: valid_len,
            next_seq: entries.last().map_or(1, |e| e.seq + 1),
        })
    }

    /// A reader positioned after the header, and the file's generation.
    fn reader(file: &File) -> Result<(u64, BufReader<&File>)> {
        let mut handle = file;
        handle.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(file);
        let generation = Self::read_header(&mut reader)?;
        Ok((generation, reader))
    }

    fn write_fresh(path: &Path, generation: u64, entries: &[CommitEntry]) -> Result<()> {
        let mut writer = BufWriter::new(
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
        );

        writer.write_all(JOURNAL_MAGIC)?;
        writer.write_all(&[JOURNAL_VERSION])?;
        writer.write_all(&generation.to_le_bytes())?;
        for entry in entries {
            Self::write_entry(&mut writer, entry)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    fn read_header(reader: &mut impl Read) -> Result<u64> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }

        let mut generation = [0u8; 8];
        reader.read_exact(&mut generation)?;
        Ok(u64::from_le_bytes(generation))
    }

    /// Read entries until EOF or the first damaged one.
    ///
    /// Returns the entries and the file length they account for.
    fn scan(reader: &mut impl Read) -> Result<(Vec<CommitEntry>, u64)> {
        let mut entries = Vec::new();
        let mut valid_len = HEADER_LEN;

        loop {
            match Self::read_entry(reader) {
                Ok(Some((entry, frame_len))) => {
                    valid_len += frame_len;
                    entries.push(entry);
                }
                Ok(None) => break,
                Err(StoreError::Corruption(reason)) => {
                    warn!(%reason, "Stopping at damaged journal entry");
                    break;
                }
                Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
        }

        Ok((entries, valid_len))
    }

    /// Write one framed entry, returning its length on disk.
    fn write_entry(writer: &mut impl Write, entry: &CommitEntry) -> Result<u64> {
        let encoded = rmp_serde::to_vec(entry)?;

        let len = encoded.len() as u32;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&encoded)?;
        writer.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;

        Ok(4 + encoded.len() as u64 + 4)
    }

    /// One framed entry, or `None` at a clean end of file.
    fn read_entry(reader: &mut impl Read) -> Result<Option<(CommitEntry, u64)>> {
        let mut len_bytes = [0u8; 4];
        match reader.read(&mut len_bytes[..1])? {
            0 => return Ok(None),
            _ => reader.read_exact(&mut len_bytes[1..])?,
        }
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_ENTRY_LEN {
            return Err(StoreError::Corruption("Journal entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        if u32::from_le_bytes(checksum_bytes) != crc32fast::hash(&encoded) {
            return Err(StoreError::Corruption("Journal checksum mismatch".into()));
        }

        let entry = rmp_serde::from_slice(&encoded)?;
        Ok(Some((entry, 4 + len as u64 + 4)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn version(tag: &str) -> Version {
        Version::new(format!("{:0>64}", tag))
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let journal = CommitJournal::open(dir.path().join("commits.log")).unwrap();

        let first = journal.append("db/a.json", &version("1"), "create a").unwrap();
        let second = journal.append("db/b.json", &version("2"), "create b").unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);

        let entries = journal.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].message, "create b");
        assert_eq!(journal.head().unwrap(), 2);
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commits.log");

        {
            let journal = CommitJournal::open(&path).unwrap();
            journal.append("db/a.json", &version("1"), "one").unwrap();
            journal.append("db/a.json", &version("2"), "two").unwrap();
        }

        let journal = CommitJournal::open(&path).unwrap();
        let entry = journal.append("db/a.json", &version("3"), "three").unwrap();
        assert_eq!(entry.seq, 3);
        assert_eq!(journal.entries().unwrap().len(), 3);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commits.log");

        {
            let journal = CommitJournal::open(&path).unwrap();
            journal.append("db/a.json", &version("1"), "one").unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();

        // Simulate a crash halfway through the next frame.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
        drop(file);

        let journal = CommitJournal::open(&path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);
        assert_eq!(journal.entries().unwrap().len(), 1);
        assert_eq!(journal.append("db/a.json", &version("2"), "two").unwrap().seq, 2);
    }

    #[test]
    fn test_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commits.log");
        fs::write(&path, b"NOPE\x01").unwrap();

        let err = CommitJournal::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::InvalidFormat(_)));
    }

    #[test]
    fn test_rewrite() {
        let dir = TempDir::new().unwrap();
        let journal = CommitJournal::open(dir.path().join("commits.log")).unwrap();
        for i in 0..10 {
            journal.append("db/a.json", &version(&i.to_string()), "edit").unwrap();
        }

        let rewrite = journal
            .rewrite("compact", || Ok(vec![("db/a.json".to_string(), version("9"))]))
            .unwrap();
        assert_eq!(
            rewrite,
            Rewrite {
                entries_before: 10,
                previous_head: 10,
                kept: 1,
            }
        );

        let entries = journal.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, CommitKind::Compacted);
        assert_eq!(entries[0].version, version("9"));

        let next = journal.append("db/a.json", &version("10"), "after").unwrap();
        assert_eq!(next.seq, 2);
    }

    #[test]
    fn test_instances_share_sequence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commits.log");
        let first = CommitJournal::open(&path).unwrap();
        let second = CommitJournal::open(&path).unwrap();

        let mut seqs = Vec::new();
        for i in 0..6 {
            let journal = if i % 2 == 0 { &first } else { &second };
            seqs.push(journal.append("db/a.json", &version(&i.to_string()), "edit").unwrap().seq);
        }

        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(first.head().unwrap(), 6);
        assert_eq!(second.entries().unwrap().len(), 6);
    }

    #[test]
    fn test_append_after_other_instance_rewrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commits.log");
        let writer = CommitJournal::open(&path).unwrap();
        let compactor = CommitJournal::open(&path).unwrap();

        writer.append("db/a.json", &version("1"), "a1").unwrap();
        compactor
            .rewrite("compact", || Ok(vec![("db/a.json".to_string(), version("1"))]))
            .unwrap();
        let late = writer.append("db/a.json", &version("2"), "a2").unwrap();
        assert_eq!(late.seq, 2);

        let reopened = CommitJournal::open(&path).unwrap();
        let messages: Vec<_> = reopened
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, vec!["compact", "a2"]);
    }

    #[test]
    fn test_append_racing_rewrite_is_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commits.log");
        let journal = CommitJournal::open(&path).unwrap();
        let other = CommitJournal::open(&path).unwrap();
        journal.append("db/a.json", &version("1"), "a1").unwrap();

        // Another instance appends while the survivors are being gathered.
        let mut racer = None;
        journal
            .rewrite("compact", || {
                racer = Some(std::thread::spawn(move || {
                    other.append("db/a.json", &version("2"), "a2").unwrap()
                }));
                std::thread::sleep(std::time::Duration::from_millis(50));
                Ok(vec![("db/a.json".to_string(), version("1"))])
            })
            .unwrap();
        let raced = racer.unwrap().join().unwrap();

        let entries = journal.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1], raced);
        assert_eq!(raced.seq, 2);
    }
}
