//! The durable store: state, log, and snapshot files.
//!
//! Three files live in the node's data directory, all little-endian and
//! packed:
//!
//! * `raft_state.dat` — a fixed 28-byte record of the node's hard state:
//!   `magic, version, crc32, current_term, voted_for, pad`. The CRC covers
//!   `current_term ++ voted_for`.
//! * `raft_log.dat` — a 24-byte header `magic, version, base_index,
//!   base_term` followed by append-only records `record_len, crc32, term,
//!   index, kind, cmd_len, command`. The CRC covers everything after the
//!   crc32 field.
//! * `raft_snapshot.dat` — a 40-byte header `magic, version, crc32, pad,
//!   last_index, last_term, state_len` followed by the opaque state bytes.
//!   The CRC covers `last_index ++ last_term`.
//!
//! State and snapshot writes go through a temp file and an atomic rename, so
//! a crash mid-write leaves the previous file intact. Log appends are plain
//! O(1) writes at the end of the file. All writes are optionally fsynced.

use std::convert::TryInto;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::BufReader;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::PathBuf;

use crc32fast::Hasher;
use serde::Deserialize;
use serde::Serialize;

use crate::error::RaftError;
use crate::error::RaftResult;
use crate::raft::Entry;
use crate::raft::EntryKind;
use crate::NodeId;

/// File name of the hard-state record.
pub const STATE_FILE: &str = "raft_state.dat";
/// File name of the log.
pub const LOG_FILE: &str = "raft_log.dat";
/// File name of the snapshot.
pub const SNAPSHOT_FILE: &str = "raft_snapshot.dat";

const STATE_MAGIC: u32 = 0x5241_4654; // "RAFT"
const LOG_MAGIC: u32 = 0x524C_4F47; // "RLOG"
const SNAPSHOT_MAGIC: u32 = 0x5253_4E50; // "RSNP"
const FORMAT_VERSION: u32 = 1;

const STATE_FILE_LEN: usize = 28;
const LOG_HEADER_LEN: u64 = 24;
const SNAPSHOT_HEADER_LEN: usize = 40;
/// Fixed portion of a log record after the `record_len` field.
const LOG_RECORD_FIXED: u32 = 28;

/// Sentinel stored in the state file when no vote has been cast.
const NO_VOTE: u32 = u32::MAX;

/// A record holding the hard state of a Raft node.
///
/// This must be durable before any RPC reply that observes a term change or
/// a granted vote.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    /// The last recorded term observed by this node.
    pub current_term: u64,
    /// The ID of the node voted for in `current_term`.
    pub voted_for: Option<NodeId>,
}

/// Metadata identifying a snapshot: the last log position it covers.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct SnapshotMeta {
    /// The index of the last entry folded into the snapshot.
    pub last_index: u64,
    /// The term of that entry.
    pub last_term: u64,
}

/// Handle to a node's durable directory.
///
/// Owned exclusively by one node; opened at node creation and closed at
/// drop. The log write handle stays open across appends; state and snapshot
/// files are rewritten whole.
pub struct DurableStore {
    dir: PathBuf,
    sync_writes: bool,
    log_file: File,
    log_base_index: u64,
    log_base_term: u64,
    /// Byte offset of each live record, in index order.
    log_offsets: Vec<u64>,
    /// Offset of the first byte past the last record.
    log_end: u64,
}

impl DurableStore {
    /// Open (creating if needed) the durable files under `dir`.
    pub fn open(dir: impl Into<PathBuf>, sync_writes: bool) -> RaftResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let log_path = dir.join(LOG_FILE);
        let mut log_file = OpenOptions::new().read(true).write(true).create(true).open(&log_path)?;

        let len = log_file.metadata()?.len();
        if len == 0 {
            let header = encode_log_header(0, 0);
            log_file.write_all(&header)?;
            if sync_writes {
                log_file.sync_data()?;
            }
        }

        let mut store = DurableStore {
            dir,
            sync_writes,
            log_file,
            log_base_index: 0,
            log_base_term: 0,
            log_offsets: Vec::new(),
            log_end: LOG_HEADER_LEN,
        };
        // Establish the base and record offsets so truncation works even if
        // the caller never reads the log back (fresh node).
        store.read_log()?;
        Ok(store)
    }

    /// `(base_index, base_term, count)` of the on-disk log.
    pub fn log_info(&self) -> (u64, u64, u64) {
        (self.log_base_index, self.log_base_term, self.log_offsets.len() as u64)
    }

    /// Load the hard state, or `None` when the node is fresh.
    pub fn load_hard_state(&self) -> RaftResult<Option<HardState>> {
        let path = self.dir.join(STATE_FILE);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut buf = [0u8; STATE_FILE_LEN];
        file.read_exact(&mut buf)?;

        let magic = read_u32(&buf, 0);
        let version = read_u32(&buf, 4);
        let crc = read_u32(&buf, 8);
        let current_term = read_u64(&buf, 12);
        let voted_for = read_u32(&buf, 20);

        if magic != STATE_MAGIC {
            return Err(RaftError::Corruption("state file magic mismatch".into()));
        }
        if version != FORMAT_VERSION {
            return Err(RaftError::Corruption(format!("unsupported state file version {}", version)));
        }

        let mut hasher = Hasher::new();
        hasher.update(&buf[12..24]);
        if hasher.finalize() != crc {
            return Err(RaftError::Corruption("state file crc mismatch".into()));
        }

        Ok(Some(HardState {
            current_term,
            voted_for: if voted_for == NO_VOTE { None } else { Some(voted_for) },
        }))
    }

    /// Durably replace the hard state via temp file + rename.
    pub fn save_hard_state(&self, hs: &HardState) -> RaftResult<()> {
        let mut buf = [0u8; STATE_FILE_LEN];
        write_u32(&mut buf, 0, STATE_MAGIC);
        write_u32(&mut buf, 4, FORMAT_VERSION);
        write_u64(&mut buf, 12, hs.current_term);
        write_u32(&mut buf, 20, hs.voted_for.unwrap_or(NO_VOTE));
        // buf[24..28] stays zero padding.

        let mut hasher = Hasher::new();
        hasher.update(&buf[12..24]);
        write_u32(&mut buf, 8, hasher.finalize());

        self.write_atomic(STATE_FILE, &buf)
    }

    /// Read every log record in index order, rebuilding the offset table.
    ///
    /// Fails with `Corruption` at the first CRC or layout mismatch; a record
    /// cut short by a crash surfaces the underlying I/O error.
    pub fn read_log(&mut self) -> RaftResult<Vec<Entry>> {
        self.log_file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut self.log_file);

        let mut header = [0u8; LOG_HEADER_LEN as usize];
        reader.read_exact(&mut header)?;
        let (base_index, base_term) = decode_log_header(&header)?;

        let mut entries = Vec::new();
        let mut offsets = Vec::new();
        let mut offset = LOG_HEADER_LEN;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }
            let record_len = u32::from_le_bytes(len_buf);
            if record_len < LOG_RECORD_FIXED {
                return Err(RaftError::Corruption("log record shorter than fixed fields".into()));
            }

            let mut record = vec![0u8; record_len as usize];
            reader.read_exact(&mut record)?;

            let crc = read_u32(&record, 0);
            let mut hasher = Hasher::new();
            hasher.update(&record[4..]);
            if hasher.finalize() != crc {
                return Err(RaftError::Corruption("log record crc mismatch".into()));
            }

            let term = read_u64(&record, 4);
            let index = read_u64(&record, 12);
            let kind = read_u32(&record, 20);
            let cmd_len = read_u32(&record, 24);
            if cmd_len as usize != record.len() - LOG_RECORD_FIXED as usize {
                return Err(RaftError::Corruption("log record length mismatch".into()));
            }
            let kind = EntryKind::from_u8(kind as u8)
                .ok_or_else(|| RaftError::Corruption(format!("unknown log entry kind {}", kind)))?;

            entries.push(Entry {
                term,
                index,
                kind,
                payload: record[LOG_RECORD_FIXED as usize..].to_vec(),
            });
            offsets.push(offset);
            offset += 4 + record_len as u64;
        }

        self.log_base_index = base_index;
        self.log_base_term = base_term;
        self.log_offsets = offsets;
        self.log_end = offset;
        Ok(entries)
    }

    /// Append one entry at the end of the log file.
    pub fn append_entry(&mut self, entry: &Entry) -> RaftResult<()> {
        let record = encode_log_record(entry);
        self.log_file.seek(SeekFrom::Start(self.log_end))?;
        self.log_file.write_all(&record)?;
        if self.sync_writes {
            self.log_file.sync_data()?;
        }
        self.log_offsets.push(self.log_end);
        self.log_end += record.len() as u64;
        Ok(())
    }

    /// Drop every record with `index > after`, preserving the header.
    pub fn truncate_log_after(&mut self, after: u64) -> RaftResult<()> {
        let keep = after.saturating_sub(self.log_base_index).min(self.log_offsets.len() as u64) as usize;
        if keep == self.log_offsets.len() {
            return Ok(());
        }
        let new_end = self.log_offsets[keep];
        self.log_file.set_len(new_end)?;
        if self.sync_writes {
            self.log_file.sync_data()?;
        }
        self.log_offsets.truncate(keep);
        self.log_end = new_end;
        Ok(())
    }

    /// Rewrite the log with a new base and the given remaining entries.
    ///
    /// Used after a snapshot: the prefix folded into the snapshot is
    /// dropped and the header's `(base_index, base_term)` advances. Goes
    /// through a temp file + rename so a crash cannot lose the suffix.
    pub fn compact_log(&mut self, base_index: u64, base_term: u64, remaining: &[Entry]) -> RaftResult<()> {
        let mut buf = Vec::with_capacity(LOG_HEADER_LEN as usize);
        buf.extend_from_slice(&encode_log_header(base_index, base_term));
        let mut offsets = Vec::with_capacity(remaining.len());
        for entry in remaining {
            offsets.push(buf.len() as u64);
            buf.extend_from_slice(&encode_log_record(entry));
        }

        self.write_atomic(LOG_FILE, &buf)?;

        // The rename replaced the inode behind our append handle.
        self.log_file = OpenOptions::new().read(true).write(true).open(self.dir.join(LOG_FILE))?;
        self.log_base_index = base_index;
        self.log_base_term = base_term;
        self.log_end = buf.len() as u64;
        self.log_offsets = offsets;
        Ok(())
    }

    /// Discard the whole log, restarting it just after the given base.
    pub fn reset_log(&mut self, base_index: u64, base_term: u64) -> RaftResult<()> {
        self.compact_log(base_index, base_term, &[])
    }

    /// Durably replace the snapshot via temp file + fsync + rename.
    pub fn save_snapshot(&self, meta: &SnapshotMeta, state: &[u8]) -> RaftResult<()> {
        let mut buf = Vec::with_capacity(SNAPSHOT_HEADER_LEN + state.len());
        buf.extend_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
        buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());

        let mut covered = [0u8; 16];
        covered[..8].copy_from_slice(&meta.last_index.to_le_bytes());
        covered[8..].copy_from_slice(&meta.last_term.to_le_bytes());
        let mut hasher = Hasher::new();
        hasher.update(&covered);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // pad
        buf.extend_from_slice(&covered);
        buf.extend_from_slice(&(state.len() as u64).to_le_bytes());
        buf.extend_from_slice(state);

        self.write_atomic(SNAPSHOT_FILE, &buf)
    }

    /// Load the snapshot, or `None` when no snapshot has been taken.
    pub fn load_snapshot(&self) -> RaftResult<Option<(SnapshotMeta, Vec<u8>)>> {
        let path = self.dir.join(SNAPSHOT_FILE);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut header = [0u8; SNAPSHOT_HEADER_LEN];
        file.read_exact(&mut header)?;

        if read_u32(&header, 0) != SNAPSHOT_MAGIC {
            return Err(RaftError::Corruption("snapshot file magic mismatch".into()));
        }
        let version = read_u32(&header, 4);
        if version != FORMAT_VERSION {
            return Err(RaftError::Corruption(format!("unsupported snapshot version {}", version)));
        }
        let crc = read_u32(&header, 8);
        let last_index = read_u64(&header, 16);
        let last_term = read_u64(&header, 24);
        let state_len = read_u64(&header, 32);

        let mut hasher = Hasher::new();
        hasher.update(&header[16..32]);
        if hasher.finalize() != crc {
            return Err(RaftError::Corruption("snapshot file crc mismatch".into()));
        }

        let mut state = vec![0u8; state_len as usize];
        file.read_exact(&mut state)?;

        Ok(Some((SnapshotMeta { last_index, last_term }, state)))
    }

    /// Metadata of the current snapshot without keeping the state bytes.
    pub fn snapshot_meta(&self) -> RaftResult<Option<SnapshotMeta>> {
        Ok(self.load_snapshot()?.map(|(meta, _)| meta))
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> RaftResult<()> {
        let tmp = self.dir.join(format!("{}.tmp", name));
        let path = self.dir.join(name);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            if self.sync_writes {
                file.sync_all()?;
            }
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn encode_log_header(base_index: u64, base_term: u64) -> [u8; LOG_HEADER_LEN as usize] {
    let mut buf = [0u8; LOG_HEADER_LEN as usize];
    write_u32(&mut buf, 0, LOG_MAGIC);
    write_u32(&mut buf, 4, FORMAT_VERSION);
    write_u64(&mut buf, 8, base_index);
    write_u64(&mut buf, 16, base_term);
    buf
}

fn decode_log_header(buf: &[u8; LOG_HEADER_LEN as usize]) -> RaftResult<(u64, u64)> {
    if read_u32(buf, 0) != LOG_MAGIC {
        return Err(RaftError::Corruption("log file magic mismatch".into()));
    }
    let version = read_u32(buf, 4);
    if version != FORMAT_VERSION {
        return Err(RaftError::Corruption(format!("unsupported log file version {}", version)));
    }
    Ok((read_u64(buf, 8), read_u64(buf, 16)))
}

fn encode_log_record(entry: &Entry) -> Vec<u8> {
    let record_len = LOG_RECORD_FIXED + entry.payload.len() as u32;
    let mut buf = Vec::with_capacity(4 + record_len as usize);
    buf.extend_from_slice(&record_len.to_le_bytes());
    buf.extend_from_slice(&[0u8; 4]); // crc placeholder
    buf.extend_from_slice(&entry.term.to_le_bytes());
    buf.extend_from_slice(&entry.index.to_le_bytes());
    buf.extend_from_slice(&(entry.kind.as_u8() as u32).to_le_bytes());
    buf.extend_from_slice(&(entry.payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&entry.payload);

    let mut hasher = Hasher::new();
    hasher.update(&buf[8..]);
    let crc = hasher.finalize();
    buf[4..8].copy_from_slice(&crc.to_le_bytes());
    buf
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

fn write_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}
