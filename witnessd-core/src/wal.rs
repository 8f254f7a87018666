use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use crate::crypto;

type HmacSha256 = Hmac<Sha256>;

const HMAC_SIZE: usize = 32;
const ENTRY_HEADER_SIZE: usize = 8 + 1 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    SessionStart = 1,
    DocumentHash = 2,
    KeystrokeBatch = 3,
    JitterSample = 4,
    Checkpoint = 5,
    Heartbeat = 6,
    SessionEnd = 7,
}

impl TryFrom<u8> for EntryKind {
    type Error = WalError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(EntryKind::SessionStart),
            2 => Ok(EntryKind::DocumentHash),
            3 => Ok(EntryKind::KeystrokeBatch),
            4 => Ok(EntryKind::JitterSample),
            5 => Ok(EntryKind::Checkpoint),
            6 => Ok(EntryKind::Heartbeat),
            7 => Ok(EntryKind::SessionEnd),
            _ => Err(WalError::InvalidEntryKind(value)),
        }
    }
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal: corrupted entry")]
    CorruptedEntry,
    #[error("wal: sequence number gap detected")]
    SequenceGap,
    #[error("wal: entry HMAC mismatch")]
    HmacMismatch,
    #[error("wal: invalid entry kind {0}")]
    InvalidEntryKind(u8),
    #[error("wal: log is closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub sequence: u64,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
    pub hmac: [u8; 32],
}

/// Per-session write-ahead log. Each entry carries its own HMAC under a
/// key derived from the session id, so a reader rejects both tampering
/// and entries spliced in from another session.
pub struct Wal {
    inner: Mutex<WalState>,
}

struct WalState {
    path: PathBuf,
    file: File,
    hmac_key: [u8; 32],
    next_sequence: u64,
    entry_count: u64,
    /// End of the last valid entry. Appends land here, which both
    /// overwrites any torn tail left by a crash and stays correct when
    /// the verify path moves the shared cursor.
    end_offset: u64,
    closed: bool,
}

#[derive(Debug)]
pub struct WalVerification {
    pub valid: bool,
    pub entries: u64,
    pub error: Option<WalError>,
}

/// Outcome of replaying a WAL after a crash. Tampered entries are counted
/// and excluded, never silently accepted.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub entries_recovered: u64,
    pub keystrokes_recovered: u64,
    pub jitter_samples_recovered: u64,
    pub last_checkpoint_seq: Option<u64>,
    pub tampered_entries: u64,
    pub clean_shutdown: bool,
}

impl Wal {
    pub fn open(
        wal_dir: impl AsRef<Path>,
        session_id: &str,
    ) -> Result<Self, WalError> {
        let dir = wal_dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{session_id}.wal"));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut state = WalState {
            path,
            file,
            hmac_key: crypto::derive_wal_hmac_key(session_id),
            next_sequence: 0,
            entry_count: 0,
            end_offset: 0,
            closed: false,
        };
        scan_to_end(&mut state)?;

        Ok(Self {
            inner: Mutex::new(state),
        })
    }

    pub fn append(&self, kind: EntryKind, payload: &[u8]) -> Result<u64, WalError> {
        let mut state = self.inner.lock().unwrap();
        if state.closed {
            return Err(WalError::Closed);
        }

        let sequence = state.next_sequence;
        let data = serialize_entry(&state.hmac_key, sequence, kind, payload);
        let at = state.end_offset;
        state.file.seek(SeekFrom::Start(at))?;
        state.file.write_all(&data)?;
        state.file.sync_all()?;

        state.end_offset += data.len() as u64;
        state.next_sequence += 1;
        state.entry_count += 1;
        Ok(sequence)
    }

    /// Walk every entry checking sequence continuity and HMACs.
    pub fn verify(&self) -> Result<WalVerification, WalError> {
        let state = self.inner.lock().unwrap();
        let mut file = state.file.try_clone()?;
        file.seek(SeekFrom::Start(0))?;

        let mut expected_sequence = 0u64;
        let mut count = 0u64;

        loop {
            let entry = match read_entry(&mut file)? {
                Some(entry) => entry,
                None => break,
            };

            if entry.sequence != expected_sequence {
                return Ok(WalVerification {
                    valid: false,
                    entries: count,
                    error: Some(WalError::SequenceGap),
                });
            }
            if !entry_hmac_valid(&state.hmac_key, &entry) {
                return Ok(WalVerification {
                    valid: false,
                    entries: count,
                    error: Some(WalError::HmacMismatch),
                });
            }

            expected_sequence += 1;
            count += 1;
        }

        Ok(WalVerification {
            valid: true,
            entries: count,
            error: None,
        })
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.lock().unwrap().entry_count
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().unwrap().path.clone()
    }

    /// Clear the log after a clean shutdown; everything it guarded has
    /// been committed elsewhere.
    pub fn truncate(&self) -> Result<(), WalError> {
        let mut state = self.inner.lock().unwrap();
        state.file.set_len(0)?;
        state.file.seek(SeekFrom::Start(0))?;
        state.file.sync_all()?;
        state.next_sequence = 0;
        state.entry_count = 0;
        state.end_offset = 0;
        Ok(())
    }

    pub fn close(&self) -> Result<(), WalError> {
        let mut state = self.inner.lock().unwrap();
        if state.closed {
            return Ok(());
        }
        state.file.sync_all()?;
        state.closed = true;
        Ok(())
    }
}

/// Replay a WAL file in sequence order, counting what survives. Entries
/// with a bad HMAC are excluded; a sequence gap ends the replay since
/// nothing past it can be trusted to be complete.
pub fn recover(path: impl AsRef<Path>, session_id: &str) -> Result<RecoveryReport, WalError> {
    let hmac_key = crypto::derive_wal_hmac_key(session_id);
    let mut file = File::open(path.as_ref())?;

    let mut report = RecoveryReport::default();
    let mut expected_sequence = 0u64;

    loop {
        let entry = match read_entry(&mut file)? {
            Some(entry) => entry,
            None => break,
        };

        if entry.sequence != expected_sequence {
            break;
        }
        expected_sequence += 1;

        if !entry_hmac_valid(&hmac_key, &entry) {
            report.tampered_entries += 1;
            continue;
        }

        report.entries_recovered += 1;
        match entry.kind {
            EntryKind::KeystrokeBatch => {
                // Count-only payload; no key values are ever present.
                if entry.payload.len() >= 4 {
                    let count = u32::from_be_bytes(entry.payload[0..4].try_into().unwrap());
                    report.keystrokes_recovered += count as u64;
                }
            }
            EntryKind::JitterSample => report.jitter_samples_recovered += 1,
            EntryKind::Checkpoint => report.last_checkpoint_seq = Some(entry.sequence),
            EntryKind::SessionEnd => report.clean_shutdown = true,
            _ => {}
        }
    }

    Ok(report)
}

fn serialize_entry(key: &[u8; 32], sequence: u64, kind: EntryKind, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ENTRY_HEADER_SIZE + payload.len() + HMAC_SIZE);
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.push(kind as u8);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);

    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(&buf);
    buf.extend_from_slice(&mac.finalize().into_bytes());
    buf
}

fn entry_hmac_valid(key: &[u8; 32], entry: &Entry) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(&entry.sequence.to_be_bytes());
    mac.update(&[entry.kind as u8]);
    mac.update(&(entry.payload.len() as u32).to_be_bytes());
    mac.update(&entry.payload);

    let expected: [u8; 32] = mac.finalize().into_bytes().into();
    expected == entry.hmac
}

/// Read one entry, or None at a clean end of file. A torn tail (partial
/// entry from a crash mid-write) also ends the stream.
fn read_entry(file: &mut File) -> Result<Option<Entry>, WalError> {
    let mut header = [0u8; ENTRY_HEADER_SIZE];
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let sequence = u64::from_be_bytes(header[0..8].try_into().unwrap());
    let kind = EntryKind::try_from(header[8])?;
    let payload_len = u32::from_be_bytes(header[9..13].try_into().unwrap()) as usize;

    let mut payload = vec![0u8; payload_len];
    if file.read_exact(&mut payload).is_err() {
        return Ok(None);
    }
    let mut hmac = [0u8; 32];
    if file.read_exact(&mut hmac).is_err() {
        return Ok(None);
    }

    Ok(Some(Entry {
        sequence,
        kind,
        payload,
        hmac,
    }))
}

fn scan_to_end(state: &mut WalState) -> Result<(), WalError> {
    state.file.seek(SeekFrom::Start(0))?;
    let mut offset = 0u64;

    loop {
        let entry = match read_entry(&mut state.file) {
            Ok(Some(entry)) => entry,
            _ => break,
        };
        state.next_sequence = entry.sequence + 1;
        state.entry_count += 1;
        offset += (ENTRY_HEADER_SIZE + entry.payload.len() + HMAC_SIZE) as u64;
    }

    // Drop any torn tail so later reads never see half an entry.
    if state.file.metadata()?.len() > offset {
        state.file.set_len(offset)?;
    }

    state.end_offset = offset;
    state.file.seek(SeekFrom::Start(offset))?;
    Ok(())
}
