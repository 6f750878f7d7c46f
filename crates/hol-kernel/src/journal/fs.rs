use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use hol_cbor::{Hash, to_canonical_cbor};

use super::{DiskRecord, Journal, JournalEntry, JournalError, JournalSeq, OwnedJournalEntry};

const LEDGER_DIR: &str = "ledger";
const LOG_NAME: &str = "journal.log";
const DIGEST_LEN: usize = 32;

/// Append-only journal file under `<root>/ledger/`. Each frame is
/// `len: u32 LE | canonical CBOR | sha256(cbor)`.
///
/// A frame cut short at the end of the file is a write that never completed;
/// `open` drops it. Anything else that fails to decode is corruption.
#[derive(Debug)]
pub struct FsJournal {
    path: PathBuf,
    next_seq: JournalSeq,
}

impl FsJournal {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, JournalError> {
        let dir = root.as_ref().join(LEDGER_DIR);
        fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_NAME);
        OpenOptions::new().create(true).append(true).open(&path)?;

        let scan = scan_frames(&path)?;
        if let Some(torn_at) = scan.torn_at {
            log::warn!(
                "dropping incomplete journal frame at byte {torn_at} of {}",
                path.display()
            );
            OpenOptions::new().write(true).open(&path)?.set_len(torn_at)?;
        }
        let next_seq = scan.entries.last().map_or(0, |entry| entry.seq + 1);
        Ok(Self { path, next_seq })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Journal for FsJournal {
    fn append(&mut self, entry: JournalEntry<'_>) -> Result<JournalSeq, JournalError> {
        let seq = self.next_seq;
        let body = to_canonical_cbor(&DiskRecord {
            seq,
            kind: entry.kind,
            payload: entry.payload,
        })?;
        let len = u32::try_from(body.len())
            .map_err(|_| JournalError::Corrupt(format!("record {seq} does not fit a frame")))?;

        let mut frame = Vec::with_capacity(4 + body.len() + DIGEST_LEN);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&body);
        frame.extend_from_slice(Hash::of_bytes(&body).as_bytes());

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(&frame)?;
        file.sync_data()?;
        self.next_seq += 1;
        Ok(seq)
    }

    fn load_from(&self, from: JournalSeq) -> Result<Vec<OwnedJournalEntry>, JournalError> {
        let mut entries = scan_frames(&self.path)?.entries;
        entries.retain(|entry| entry.seq >= from);
        Ok(entries)
    }

    fn next_seq(&self) -> JournalSeq {
        self.next_seq
    }
}

struct Scan {
    entries: Vec<OwnedJournalEntry>,
    /// Offset of a trailing frame that ends before its declared length.
    torn_at: Option<u64>,
}

fn scan_frames(path: &Path) -> Result<Scan, JournalError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut entries: Vec<OwnedJournalEntry> = Vec::new();
    let mut offset = 0u64;
    loop {
        let mut header = [0u8; 4];
        match fill(&mut reader, &mut header)? {
            0 => return Ok(Scan { entries, torn_at: None }),
            n if n < header.len() => return Ok(Scan { entries, torn_at: Some(offset) }),
            _ => {}
        }
        let len = u32::from_le_bytes(header) as usize;
        let mut body = vec![0u8; len + DIGEST_LEN];
        if fill(&mut reader, &mut body)? < body.len() {
            return Ok(Scan { entries, torn_at: Some(offset) });
        }
        let (cbor, digest) = body.split_at(len);
        if Hash::of_bytes(cbor).as_bytes()[..] != digest[..] {
            return Err(JournalError::Corrupt(format!("digest mismatch in frame at byte {offset}")));
        }
        let entry: OwnedJournalEntry = serde_cbor::from_slice(cbor)?;
        let expected = entries.len() as JournalSeq;
        if entry.seq != expected {
            return Err(JournalError::Corrupt(format!(
                "frame at byte {offset} has seq {}, expected {expected}",
                entry.seq
            )));
        }
        entries.push(entry);
        offset += (4 + len + DIGEST_LEN) as u64;
    }
}

/// Read until `buf` is full or the file ends; returns the bytes read.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize, JournalError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(filled)
}
