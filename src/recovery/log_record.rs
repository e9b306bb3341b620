//! Typed log records and their wire codec. Records are framed by the log
//! manager (`[kind u8][len u32][body][crc32 u32]`); this module owns the kind
//! tags and the little-endian body layouts, one per record type.

use bytes::Bytes;

use crate::buffer::{PageId, EFFECTIVE_PAGE_SIZE};
use crate::error::{VellumError, VellumResult};
use crate::recovery::Lsn;
use crate::transaction::{TransactionId, TransactionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LogRecordType {
    Master = 1,
    BeginCheckpoint = 2,
    EndCheckpoint = 3,
    CommitTxn = 4,
    AbortTxn = 5,
    EndTxn = 6,
    UpdatePage = 7,
    AllocPart = 8,
    FreePart = 9,
    AllocPage = 10,
    FreePage = 11,
    UndoUpdatePage = 12,
    UndoAllocPart = 13,
    UndoFreePart = 14,
    UndoAllocPage = 15,
    UndoFreePage = 16,
}

impl TryFrom<u8> for LogRecordType {
    type Error = VellumError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use LogRecordType::*;
        Ok(match value {
            1 => Master,
            2 => BeginCheckpoint,
            3 => EndCheckpoint,
            4 => CommitTxn,
            5 => AbortTxn,
            6 => EndTxn,
            7 => UpdatePage,
            8 => AllocPart,
            9 => FreePart,
            10 => AllocPage,
            11 => FreePage,
            12 => UndoUpdatePage,
            13 => UndoAllocPart,
            14 => UndoFreePart,
            15 => UndoAllocPage,
            16 => UndoFreePage,
            other => {
                return Err(VellumError::Recovery(format!(
                    "unknown log record kind: {}",
                    other
                )))
            }
        })
    }
}

/// One log record. LSNs are assigned by the log manager on append; records
/// themselves only carry the chain links (`prev_lsn`, and `undo_next_lsn` on
/// CLRs).
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    /// Rewritten in place at a fixed location; points at the last successful
    /// begin-checkpoint record.
    Master { checkpoint_lsn: Lsn },
    BeginCheckpoint,
    EndCheckpoint {
        /// (page id, recLSN) pairs.
        dpt: Vec<(PageId, Lsn)>,
        /// (transaction id, status, lastLSN) triples.
        txn_table: Vec<(TransactionId, TransactionStatus, Lsn)>,
    },
    CommitTxn {
        txn_id: TransactionId,
        prev_lsn: Lsn,
    },
    AbortTxn {
        txn_id: TransactionId,
        prev_lsn: Lsn,
    },
    EndTxn {
        txn_id: TransactionId,
        prev_lsn: Lsn,
    },
    UpdatePage {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        page_id: PageId,
        offset: u16,
        before: Bytes,
        after: Bytes,
    },
    AllocPart {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        part_num: u32,
    },
    FreePart {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        part_num: u32,
    },
    AllocPage {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        page_id: PageId,
    },
    FreePage {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        page_id: PageId,
    },
    /// CLR for UpdatePage: restores `image` (the before-image) on redo.
    UndoUpdatePage {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
        page_id: PageId,
        offset: u16,
        image: Bytes,
    },
    UndoAllocPart {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
        part_num: u32,
    },
    UndoFreePart {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
        part_num: u32,
    },
    UndoAllocPage {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
        page_id: PageId,
    },
    UndoFreePage {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
        page_id: PageId,
    },
}

impl LogRecord {
    pub fn record_type(&self) -> LogRecordType {
        use LogRecord::*;
        match self {
            Master { .. } => LogRecordType::Master,
            BeginCheckpoint => LogRecordType::BeginCheckpoint,
            EndCheckpoint { .. } => LogRecordType::EndCheckpoint,
            CommitTxn { .. } => LogRecordType::CommitTxn,
            AbortTxn { .. } => LogRecordType::AbortTxn,
            EndTxn { .. } => LogRecordType::EndTxn,
            UpdatePage { .. } => LogRecordType::UpdatePage,
            AllocPart { .. } => LogRecordType::AllocPart,
            FreePart { .. } => LogRecordType::FreePart,
            AllocPage { .. } => LogRecordType::AllocPage,
            FreePage { .. } => LogRecordType::FreePage,
            UndoUpdatePage { .. } => LogRecordType::UndoUpdatePage,
            UndoAllocPart { .. } => LogRecordType::UndoAllocPart,
            UndoFreePart { .. } => LogRecordType::UndoFreePart,
            UndoAllocPage { .. } => LogRecordType::UndoAllocPage,
            UndoFreePage { .. } => LogRecordType::UndoFreePage,
        }
    }

    pub fn txn_id(&self) -> Option<TransactionId> {
        use LogRecord::*;
        match self {
            CommitTxn { txn_id, .. }
            | AbortTxn { txn_id, .. }
            | EndTxn { txn_id, .. }
            | UpdatePage { txn_id, .. }
            | AllocPart { txn_id, .. }
            | FreePart { txn_id, .. }
            | AllocPage { txn_id, .. }
            | FreePage { txn_id, .. }
            | UndoUpdatePage { txn_id, .. }
            | UndoAllocPart { txn_id, .. }
            | UndoFreePart { txn_id, .. }
            | UndoAllocPage { txn_id, .. }
            | UndoFreePage { txn_id, .. } => Some(*txn_id),
            Master { .. } | BeginCheckpoint | EndCheckpoint { .. } => None,
        }
    }

    pub fn prev_lsn(&self) -> Option<Lsn> {
        use LogRecord::*;
        match self {
            CommitTxn { prev_lsn, .. }
            | AbortTxn { prev_lsn, .. }
            | EndTxn { prev_lsn, .. }
            | UpdatePage { prev_lsn, .. }
            | AllocPart { prev_lsn, .. }
            | FreePart { prev_lsn, .. }
            | AllocPage { prev_lsn, .. }
            | FreePage { prev_lsn, .. }
            | UndoUpdatePage { prev_lsn, .. }
            | UndoAllocPart { prev_lsn, .. }
            | UndoFreePart { prev_lsn, .. }
            | UndoAllocPage { prev_lsn, .. }
            | UndoFreePage { prev_lsn, .. } => Some(*prev_lsn),
            Master { .. } | BeginCheckpoint | EndCheckpoint { .. } => None,
        }
    }

    pub fn undo_next_lsn(&self) -> Option<Lsn> {
        use LogRecord::*;
        match self {
            UndoUpdatePage { undo_next_lsn, .. }
            | UndoAllocPart { undo_next_lsn, .. }
            | UndoFreePart { undo_next_lsn, .. }
            | UndoAllocPage { undo_next_lsn, .. }
            | UndoFreePage { undo_next_lsn, .. } => Some(*undo_next_lsn),
            _ => None,
        }
    }

    pub fn page_id(&self) -> Option<PageId> {
        use LogRecord::*;
        match self {
            UpdatePage { page_id, .. }
            | AllocPage { page_id, .. }
            | FreePage { page_id, .. }
            | UndoUpdatePage { page_id, .. }
            | UndoAllocPage { page_id, .. }
            | UndoFreePage { page_id, .. } => Some(*page_id),
            _ => None,
        }
    }

    pub fn part_num(&self) -> Option<u32> {
        use LogRecord::*;
        match self {
            AllocPart { part_num, .. }
            | FreePart { part_num, .. }
            | UndoAllocPart { part_num, .. }
            | UndoFreePart { part_num, .. } => Some(*part_num),
            _ => None,
        }
    }

    /// Whether this record's effect can be compensated. CLRs themselves are
    /// redo-only.
    pub fn is_undoable(&self) -> bool {
        use LogRecordType::*;
        matches!(
            self.record_type(),
            UpdatePage | AllocPart | FreePart | AllocPage | FreePage
        )
    }

    pub fn is_redoable(&self) -> bool {
        use LogRecordType::*;
        matches!(
            self.record_type(),
            UpdatePage
                | AllocPart
                | FreePart
                | AllocPage
                | FreePage
                | UndoUpdatePage
                | UndoAllocPart
                | UndoFreePart
                | UndoAllocPage
                | UndoFreePage
        )
    }

    /// Build the compensation record that undoes this one. `clr_prev_lsn` is
    /// the writing transaction's current lastLSN; the CLR's undo-next pointer
    /// is this record's prevLSN, so a re-crash skips over work already
    /// undone. Returns `None` for records that are not undoable.
    pub fn undo(&self, clr_prev_lsn: Lsn) -> Option<LogRecord> {
        use LogRecord::*;
        match self {
            UpdatePage {
                txn_id,
                prev_lsn,
                page_id,
                offset,
                before,
                ..
            } => Some(UndoUpdatePage {
                txn_id: *txn_id,
                prev_lsn: clr_prev_lsn,
                undo_next_lsn: *prev_lsn,
                page_id: *page_id,
                offset: *offset,
                image: before.clone(),
            }),
            AllocPart {
                txn_id,
                prev_lsn,
                part_num,
            } => Some(UndoAllocPart {
                txn_id: *txn_id,
                prev_lsn: clr_prev_lsn,
                undo_next_lsn: *prev_lsn,
                part_num: *part_num,
            }),
            FreePart {
                txn_id,
                prev_lsn,
                part_num,
            } => Some(UndoFreePart {
                txn_id: *txn_id,
                prev_lsn: clr_prev_lsn,
                undo_next_lsn: *prev_lsn,
                part_num: *part_num,
            }),
            AllocPage {
                txn_id,
                prev_lsn,
                page_id,
            } => Some(UndoAllocPage {
                txn_id: *txn_id,
                prev_lsn: clr_prev_lsn,
                undo_next_lsn: *prev_lsn,
                page_id: *page_id,
            }),
            FreePage {
                txn_id,
                prev_lsn,
                page_id,
            } => Some(UndoFreePage {
                txn_id: *txn_id,
                prev_lsn: clr_prev_lsn,
                undo_next_lsn: *prev_lsn,
                page_id: *page_id,
            }),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        use LogRecord::*;
        let mut buf = Vec::new();
        match self {
            Master { checkpoint_lsn } => {
                buf.extend_from_slice(&checkpoint_lsn.to_le_bytes());
            }
            BeginCheckpoint => {}
            EndCheckpoint { dpt, txn_table } => {
                buf.extend_from_slice(&(dpt.len() as u32).to_le_bytes());
                for (page_id, rec_lsn) in dpt {
                    buf.extend_from_slice(&page_id.to_le_bytes());
                    buf.extend_from_slice(&rec_lsn.to_le_bytes());
                }
                buf.extend_from_slice(&(txn_table.len() as u32).to_le_bytes());
                for (txn_id, status, last_lsn) in txn_table {
                    buf.extend_from_slice(&txn_id.to_le_bytes());
                    buf.push(status.as_u8());
                    buf.extend_from_slice(&last_lsn.to_le_bytes());
                }
            }
            CommitTxn { txn_id, prev_lsn }
            | AbortTxn { txn_id, prev_lsn }
            | EndTxn { txn_id, prev_lsn } => {
                buf.extend_from_slice(&txn_id.to_le_bytes());
                buf.extend_from_slice(&prev_lsn.to_le_bytes());
            }
            UpdatePage {
                txn_id,
                prev_lsn,
                page_id,
                offset,
                before,
                after,
            } => {
                buf.extend_from_slice(&txn_id.to_le_bytes());
                buf.extend_from_slice(&prev_lsn.to_le_bytes());
                buf.extend_from_slice(&page_id.to_le_bytes());
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(&(before.len() as u16).to_le_bytes());
                buf.extend_from_slice(before);
                buf.extend_from_slice(after);
            }
            AllocPart {
                txn_id,
                prev_lsn,
                part_num,
            }
            | FreePart {
                txn_id,
                prev_lsn,
                part_num,
            } => {
                buf.extend_from_slice(&txn_id.to_le_bytes());
                buf.extend_from_slice(&prev_lsn.to_le_bytes());
                buf.extend_from_slice(&part_num.to_le_bytes());
            }
            AllocPage {
                txn_id,
                prev_lsn,
                page_id,
            }
            | FreePage {
                txn_id,
                prev_lsn,
                page_id,
            } => {
                buf.extend_from_slice(&txn_id.to_le_bytes());
                buf.extend_from_slice(&prev_lsn.to_le_bytes());
                buf.extend_from_slice(&page_id.to_le_bytes());
            }
            UndoUpdatePage {
                txn_id,
                prev_lsn,
                undo_next_lsn,
                page_id,
                offset,
                image,
            } => {
                buf.extend_from_slice(&txn_id.to_le_bytes());
                buf.extend_from_slice(&prev_lsn.to_le_bytes());
                buf.extend_from_slice(&undo_next_lsn.to_le_bytes());
                buf.extend_from_slice(&page_id.to_le_bytes());
                buf.extend_from_slice(&offset.to_le_bytes());
                buf.extend_from_slice(&(image.len() as u16).to_le_bytes());
                buf.extend_from_slice(image);
            }
            UndoAllocPart {
                txn_id,
                prev_lsn,
                undo_next_lsn,
                part_num,
            }
            | UndoFreePart {
                txn_id,
                prev_lsn,
                undo_next_lsn,
                part_num,
            } => {
                buf.extend_from_slice(&txn_id.to_le_bytes());
                buf.extend_from_slice(&prev_lsn.to_le_bytes());
                buf.extend_from_slice(&undo_next_lsn.to_le_bytes());
                buf.extend_from_slice(&part_num.to_le_bytes());
            }
            UndoAllocPage {
                txn_id,
                prev_lsn,
                undo_next_lsn,
                page_id,
            }
            | UndoFreePage {
                txn_id,
                prev_lsn,
                undo_next_lsn,
                page_id,
            } => {
                buf.extend_from_slice(&txn_id.to_le_bytes());
                buf.extend_from_slice(&prev_lsn.to_le_bytes());
                buf.extend_from_slice(&undo_next_lsn.to_le_bytes());
                buf.extend_from_slice(&page_id.to_le_bytes());
            }
        }
        buf
    }

    pub fn decode(kind: LogRecordType, body: &[u8]) -> VellumResult<LogRecord> {
        let mut cursor = Cursor::new(body);
        let record = match kind {
            LogRecordType::Master => LogRecord::Master {
                checkpoint_lsn: cursor.u64()?,
            },
            LogRecordType::BeginCheckpoint => LogRecord::BeginCheckpoint,
            LogRecordType::EndCheckpoint => {
                let dpt_len = cursor.u32()? as usize;
                let mut dpt = Vec::with_capacity(dpt_len);
                for _ in 0..dpt_len {
                    let page_id = cursor.u64()?;
                    let rec_lsn = cursor.u64()?;
                    dpt.push((page_id, rec_lsn));
                }
                let txn_len = cursor.u32()? as usize;
                let mut txn_table = Vec::with_capacity(txn_len);
                for _ in 0..txn_len {
                    let txn_id = cursor.u64()?;
                    let status = TransactionStatus::from_u8(cursor.u8()?).ok_or_else(|| {
                        VellumError::Recovery("invalid transaction status in checkpoint".to_string())
                    })?;
                    let last_lsn = cursor.u64()?;
                    txn_table.push((txn_id, status, last_lsn));
                }
                LogRecord::EndCheckpoint { dpt, txn_table }
            }
            LogRecordType::CommitTxn => LogRecord::CommitTxn {
                txn_id: cursor.u64()?,
                prev_lsn: cursor.u64()?,
            },
            LogRecordType::AbortTxn => LogRecord::AbortTxn {
                txn_id: cursor.u64()?,
                prev_lsn: cursor.u64()?,
            },
            LogRecordType::EndTxn => LogRecord::EndTxn {
                txn_id: cursor.u64()?,
                prev_lsn: cursor.u64()?,
            },
            LogRecordType::UpdatePage => {
                let txn_id = cursor.u64()?;
                let prev_lsn = cursor.u64()?;
                let page_id = cursor.u64()?;
                let offset = cursor.u16()?;
                let len = cursor.u16()? as usize;
                let before = cursor.bytes(len)?;
                let after = cursor.bytes(len)?;
                LogRecord::UpdatePage {
                    txn_id,
                    prev_lsn,
                    page_id,
                    offset,
                    before,
                    after,
                }
            }
            LogRecordType::AllocPart => LogRecord::AllocPart {
                txn_id: cursor.u64()?,
                prev_lsn: cursor.u64()?,
                part_num: cursor.u32()?,
            },
            LogRecordType::FreePart => LogRecord::FreePart {
                txn_id: cursor.u64()?,
                prev_lsn: cursor.u64()?,
                part_num: cursor.u32()?,
            },
            LogRecordType::AllocPage => LogRecord::AllocPage {
                txn_id: cursor.u64()?,
                prev_lsn: cursor.u64()?,
                page_id: cursor.u64()?,
            },
            LogRecordType::FreePage => LogRecord::FreePage {
                txn_id: cursor.u64()?,
                prev_lsn: cursor.u64()?,
                page_id: cursor.u64()?,
            },
            LogRecordType::UndoUpdatePage => {
                let txn_id = cursor.u64()?;
                let prev_lsn = cursor.u64()?;
                let undo_next_lsn = cursor.u64()?;
                let page_id = cursor.u64()?;
                let offset = cursor.u16()?;
                let len = cursor.u16()? as usize;
                let image = cursor.bytes(len)?;
                LogRecord::UndoUpdatePage {
                    txn_id,
                    prev_lsn,
                    undo_next_lsn,
                    page_id,
                    offset,
                    image,
                }
            }
            LogRecordType::UndoAllocPart => LogRecord::UndoAllocPart {
                txn_id: cursor.u64()?,
                prev_lsn: cursor.u64()?,
                undo_next_lsn: cursor.u64()?,
                part_num: cursor.u32()?,
            },
            LogRecordType::UndoFreePart => LogRecord::UndoFreePart {
                txn_id: cursor.u64()?,
                prev_lsn: cursor.u64()?,
                undo_next_lsn: cursor.u64()?,
                part_num: cursor.u32()?,
            },
            LogRecordType::UndoAllocPage => LogRecord::UndoAllocPage {
                txn_id: cursor.u64()?,
                prev_lsn: cursor.u64()?,
                undo_next_lsn: cursor.u64()?,
                page_id: cursor.u64()?,
            },
            LogRecordType::UndoFreePage => LogRecord::UndoFreePage {
                txn_id: cursor.u64()?,
                prev_lsn: cursor.u64()?,
                undo_next_lsn: cursor.u64()?,
                page_id: cursor.u64()?,
            },
        };
        Ok(record)
    }

    /// Whether an end-checkpoint record with `n_dpt` DPT entries and `n_txn`
    /// transaction entries still fits in one effective page. Bounds how the
    /// checkpoint streams its tables into multiple records.
    pub fn fits_in_one_record(n_dpt: usize, n_txn: usize) -> bool {
        // frame overhead: kind + len + crc, plus the two table counts.
        const OVERHEAD: usize = 1 + 4 + 4 + 4 + 4;
        const DPT_ENTRY: usize = 8 + 8;
        const TXN_ENTRY: usize = 8 + 1 + 8;
        OVERHEAD + n_dpt * DPT_ENTRY + n_txn * TXN_ENTRY <= EFFECTIVE_PAGE_SIZE
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> VellumResult<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(VellumError::Recovery(
                "log record body truncated".to_string(),
            ));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> VellumResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> VellumResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> VellumResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> VellumResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes(&mut self, len: usize) -> VellumResult<Bytes> {
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }
}
