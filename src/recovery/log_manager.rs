//! Sequential log manager. LSNs are byte offsets of frames in the log file;
//! appends are totally ordered under one mutex, so LSNs increase
//! monotonically. The master record lives in a fixed-size slot at offset 0
//! and is rewritten in place; ordinary records start at `LOG_BASE_LSN`.
//!
//! Frame layout: `[kind u8][body_len u32][body][crc32 u32]`, checksum over
//! kind + length + body, in the same spirit as a WAL page frame.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};

use crc32fast::Hasher;
use log::warn;
use parking_lot::Mutex;

use crate::config::LogConfig;
use crate::error::{VellumError, VellumResult};
use crate::recovery::log_record::{LogRecord, LogRecordType};
use crate::recovery::Lsn;

const FRAME_HEADER_LEN: usize = 1 + 4;
const FRAME_CRC_LEN: usize = 4;

/// Slot reserved for the master record. A master frame is 17 bytes; the
/// slot is padded so ordinary records start at a stable offset.
pub const LOG_BASE_LSN: Lsn = 24;

struct LogFileState {
    file: File,
    next_lsn: Lsn,
}

pub struct LogManager {
    state: Mutex<LogFileState>,
    flushed_lsn: AtomicU64,
    sync_on_flush: bool,
}

impl LogManager {
    pub fn open(config: &LogConfig) -> VellumResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&config.path)?;
        let len = file.metadata()?.len();
        let next_lsn = len.max(LOG_BASE_LSN);
        Ok(LogManager {
            state: Mutex::new(LogFileState { file, next_lsn }),
            flushed_lsn: AtomicU64::new(next_lsn),
            sync_on_flush: config.sync_on_flush,
        })
    }

    /// Append a record, returning its LSN.
    pub fn append(&self, record: &LogRecord) -> VellumResult<Lsn> {
        let frame = encode_frame(record);
        let mut state = self.state.lock();
        let lsn = state.next_lsn;
        state.file.write_all_at(&frame, lsn)?;
        state.next_lsn += frame.len() as Lsn;
        Ok(lsn)
    }

    /// Make the log durable through at least `lsn`.
    pub fn flush_to(&self, lsn: Lsn) -> VellumResult<()> {
        if self.flushed_lsn.load(Ordering::SeqCst) > lsn {
            return Ok(());
        }
        let state = self.state.lock();
        if self.sync_on_flush {
            state.file.sync_data()?;
        }
        self.flushed_lsn.store(state.next_lsn, Ordering::SeqCst);
        Ok(())
    }

    pub fn flush_all(&self) -> VellumResult<()> {
        let state = self.state.lock();
        if self.sync_on_flush {
            state.file.sync_data()?;
        }
        self.flushed_lsn.store(state.next_lsn, Ordering::SeqCst);
        Ok(())
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn.load(Ordering::SeqCst)
    }

    /// LSN one past the last appended record.
    pub fn next_lsn(&self) -> Lsn {
        self.state.lock().next_lsn
    }

    /// Overwrite the master record slot and make it durable immediately.
    pub fn rewrite_master(&self, checkpoint_lsn: Lsn) -> VellumResult<()> {
        let frame = encode_frame(&LogRecord::Master { checkpoint_lsn });
        debug_assert!(frame.len() as Lsn <= LOG_BASE_LSN);
        let state = self.state.lock();
        state.file.write_all_at(&frame, 0)?;
        state.file.sync_data()?;
        Ok(())
    }

    /// Read the master record. A missing or corrupt master is fatal.
    pub fn read_master(&self) -> VellumResult<Lsn> {
        match self.fetch(0)? {
            LogRecord::Master { checkpoint_lsn } => Ok(checkpoint_lsn),
            other => Err(VellumError::Recovery(format!(
                "expected master record at offset 0, found {:?}",
                other.record_type()
            ))),
        }
    }

    /// Fetch the record at `lsn`. Errors on any malformed frame: a fetch
    /// always targets a known record position.
    pub fn fetch(&self, lsn: Lsn) -> VellumResult<LogRecord> {
        match self.read_frame_at(lsn)? {
            Some((record, _)) => Ok(record),
            None => Err(VellumError::Recovery(format!(
                "no log record at LSN {}",
                lsn
            ))),
        }
    }

    /// Iterate records from `lsn` to the end of the log. The scan stops at
    /// the first torn or corrupt frame, which is treated as the end of the
    /// durable log.
    pub fn scan_from(&self, lsn: Lsn) -> LogScan<'_> {
        LogScan {
            manager: self,
            cursor: lsn.max(LOG_BASE_LSN),
            end: self.next_lsn(),
        }
    }

    fn read_frame_at(&self, lsn: Lsn) -> VellumResult<Option<(LogRecord, usize)>> {
        let state = self.state.lock();
        let mut header = [0u8; FRAME_HEADER_LEN];
        if read_exact_at(&state.file, &mut header, lsn)?.is_none() {
            return Ok(None);
        }
        let kind = LogRecordType::try_from(header[0])?;
        let body_len = u32::from_le_bytes(header[1..5].try_into().unwrap()) as usize;
        let mut rest = vec![0u8; body_len + FRAME_CRC_LEN];
        if read_exact_at(&state.file, &mut rest, lsn + FRAME_HEADER_LEN as Lsn)?.is_none() {
            return Ok(None);
        }
        drop(state);

        let body = &rest[..body_len];
        let expected_crc = u32::from_le_bytes(rest[body_len..].try_into().unwrap());
        let mut hasher = Hasher::new();
        hasher.update(&header);
        hasher.update(body);
        if hasher.finalize() != expected_crc {
            return Err(VellumError::Recovery(format!(
                "CRC mismatch in log frame at LSN {}",
                lsn
            )));
        }
        let record = LogRecord::decode(kind, body)?;
        Ok(Some((record, FRAME_HEADER_LEN + body_len + FRAME_CRC_LEN)))
    }
}

fn encode_frame(record: &LogRecord) -> Vec<u8> {
    let body = record.encode();
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len() + FRAME_CRC_LEN);
    frame.push(record.record_type() as u8);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    let mut hasher = Hasher::new();
    hasher.update(&frame);
    frame.extend_from_slice(&hasher.finalize().to_le_bytes());
    frame
}

/// `read_at` wrapper distinguishing clean EOF (None) from IO errors.
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> VellumResult<Option<()>> {
    let mut read = 0;
    while read < buf.len() {
        let n = file.read_at(&mut buf[read..], offset + read as u64)?;
        if n == 0 {
            return Ok(None);
        }
        read += n;
    }
    Ok(Some(()))
}

pub struct LogScan<'a> {
    manager: &'a LogManager,
    cursor: Lsn,
    end: Lsn,
}

impl Iterator for LogScan<'_> {
    type Item = (Lsn, LogRecord);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.end {
            return None;
        }
        match self.manager.read_frame_at(self.cursor) {
            Ok(Some((record, len))) => {
                let lsn = self.cursor;
                self.cursor += len as Lsn;
                Some((lsn, record))
            }
            Ok(None) => None,
            Err(e) => {
                warn!("log scan stopped at LSN {}: {}", self.cursor, e);
                None
            }
        }
    }
}
