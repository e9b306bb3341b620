//! ARIES recovery manager: write-ahead logging during forward processing,
//! fuzzy checkpoints, and analysis/redo/undo restart recovery over the
//! in-memory dirty page table (DPT) and transaction table.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use log::debug;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::buffer::{BufferManager, PageId, EFFECTIVE_PAGE_SIZE};
use crate::error::{VellumError, VellumResult};
use crate::recovery::log_manager::LogManager;
use crate::recovery::log_record::{LogRecord, LogRecordType};
use crate::recovery::Lsn;
use crate::storage::disk_manager::{DiskSpaceManager, LOG_PARTITION};
use crate::transaction::{Transaction, TransactionId, TransactionStatus};

pub type TransactionFactory = Box<dyn Fn(TransactionId) -> Arc<Transaction> + Send + Sync>;

pub struct TransactionTableEntry {
    pub transaction: Arc<Transaction>,
    pub last_lsn: Lsn,
    pub touched_pages: HashSet<PageId>,
    savepoints: HashMap<String, Lsn>,
}

impl TransactionTableEntry {
    fn new(transaction: Arc<Transaction>) -> Self {
        TransactionTableEntry {
            transaction,
            last_lsn: 0,
            touched_pages: HashSet::new(),
            savepoints: HashMap::new(),
        }
    }
}

pub struct RecoveryManager {
    log: Arc<LogManager>,
    disk: OnceCell<Arc<DiskSpaceManager>>,
    buffer: OnceCell<Arc<BufferManager>>,
    /// Creates a transaction handle for a transaction number discovered
    /// during restart.
    new_transaction: TransactionFactory,
    /// page id -> recLSN of the earliest update that dirtied it.
    dirty_page_table: DashMap<PageId, Lsn>,
    transaction_table: DashMap<TransactionId, TransactionTableEntry>,
    /// Gates `disk_io_hook` DPT removal so the redo pass does not lose
    /// recLSN information mid-scan.
    redo_complete: AtomicBool,
    /// Serializes checkpoint and restart against each other.
    op_mutex: Mutex<()>,
}

impl RecoveryManager {
    pub fn new(log: Arc<LogManager>, new_transaction: TransactionFactory) -> Self {
        RecoveryManager {
            log,
            disk: OnceCell::new(),
            buffer: OnceCell::new(),
            new_transaction,
            dirty_page_table: DashMap::new(),
            transaction_table: DashMap::new(),
            redo_complete: AtomicBool::new(false),
            op_mutex: Mutex::new(()),
        }
    }

    /// Wire the disk and buffer managers. Separate from the constructor
    /// because the buffer manager holds a back-reference to this recovery
    /// manager for its flush hooks.
    pub fn set_managers(&self, disk: Arc<DiskSpaceManager>, buffer: Arc<BufferManager>) {
        let _ = self.disk.set(disk);
        let _ = self.buffer.set(buffer);
    }

    fn disk(&self) -> &Arc<DiskSpaceManager> {
        self.disk.get().expect("set_managers not called")
    }

    fn buffer(&self) -> &Arc<BufferManager> {
        self.buffer.get().expect("set_managers not called")
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log
    }

    /// First-time setup: write the master record and take an initial
    /// checkpoint.
    pub fn initialize(&self) -> VellumResult<()> {
        self.log.rewrite_master(0)?;
        self.checkpoint()
    }

    // Forward processing ///////////////////////////////////////////////////

    pub fn start_transaction(&self, transaction: Arc<Transaction>) {
        let _guard = self.op_mutex.lock();
        self.transaction_table.insert(
            transaction.trans_num(),
            TransactionTableEntry::new(transaction),
        );
    }

    /// Append a commit record, flush the log through it, and mark the
    /// transaction COMMITTING.
    pub fn commit(&self, txn_id: TransactionId) -> VellumResult<Lsn> {
        let prev_lsn = self.last_lsn(txn_id)?;
        let lsn = self.log.append(&LogRecord::CommitTxn { txn_id, prev_lsn })?;
        self.with_entry(txn_id, |entry| {
            entry.transaction.set_status(TransactionStatus::Committing);
            entry.last_lsn = lsn;
        })?;
        self.log.flush_to(lsn)?;
        Ok(lsn)
    }

    /// Append an abort record and mark the transaction ABORTING. No rollback
    /// happens here; that is deferred to `end`.
    pub fn abort(&self, txn_id: TransactionId) -> VellumResult<Lsn> {
        let prev_lsn = self.last_lsn(txn_id)?;
        let lsn = self.log.append(&LogRecord::AbortTxn { txn_id, prev_lsn })?;
        self.with_entry(txn_id, |entry| {
            entry.transaction.set_status(TransactionStatus::Aborting);
            entry.last_lsn = lsn;
        })?;
        Ok(lsn)
    }

    /// Finish a transaction. An aborting transaction is first rolled back to
    /// the beginning of its chain, CLR by CLR.
    pub fn end(&self, txn_id: TransactionId) -> VellumResult<Lsn> {
        let status = self
            .transaction_table
            .get(&txn_id)
            .map(|e| e.transaction.status())
            .ok_or_else(|| {
                VellumError::Recovery(format!("transaction {} not in transaction table", txn_id))
            })?;
        if matches!(
            status,
            TransactionStatus::Aborting | TransactionStatus::RecoveryAborting
        ) {
            self.rollback_to_lsn(txn_id, 0)?;
        }
        let prev_lsn = self.last_lsn(txn_id)?;
        let lsn = self.log.append(&LogRecord::EndTxn { txn_id, prev_lsn })?;
        if let Some((_, entry)) = self.transaction_table.remove(&txn_id) {
            entry.transaction.set_status(TransactionStatus::Complete);
        }
        Ok(lsn)
    }

    /// Log a page write. `before` and `after` must have equal length, at most
    /// half the effective page size. Dirties the page in the DPT if it was
    /// clean.
    pub fn log_page_write(
        &self,
        txn_id: TransactionId,
        page_id: PageId,
        offset: u16,
        before: &[u8],
        after: &[u8],
    ) -> VellumResult<Lsn> {
        if before.len() != after.len() {
            return Err(VellumError::Recovery(
                "page write before/after images differ in length".to_string(),
            ));
        }
        if before.len() > EFFECTIVE_PAGE_SIZE / 2 {
            return Err(VellumError::Recovery(format!(
                "page write image of {} bytes exceeds half a page",
                before.len()
            )));
        }
        let prev_lsn = self.last_lsn(txn_id)?;
        let lsn = self.log.append(&LogRecord::UpdatePage {
            txn_id,
            prev_lsn,
            page_id,
            offset,
            before: Bytes::copy_from_slice(before),
            after: Bytes::copy_from_slice(after),
        })?;
        self.with_entry(txn_id, |entry| {
            entry.last_lsn = lsn;
            entry.touched_pages.insert(page_id);
        })?;
        self.dirty_page_table.entry(page_id).or_insert(lsn);
        Ok(lsn)
    }

    /// Log a partition allocation and flush: the change is visible on disk
    /// as soon as this returns. Returns `None` for the log partition.
    pub fn log_alloc_part(
        &self,
        txn_id: TransactionId,
        part_num: u32,
    ) -> VellumResult<Option<Lsn>> {
        if part_num == LOG_PARTITION {
            return Ok(None);
        }
        let prev_lsn = self.last_lsn(txn_id)?;
        let lsn = self.log.append(&LogRecord::AllocPart {
            txn_id,
            prev_lsn,
            part_num,
        })?;
        self.with_entry(txn_id, |entry| entry.last_lsn = lsn)?;
        self.log.flush_to(lsn)?;
        Ok(Some(lsn))
    }

    pub fn log_free_part(&self, txn_id: TransactionId, part_num: u32) -> VellumResult<Option<Lsn>> {
        if part_num == LOG_PARTITION {
            return Ok(None);
        }
        let prev_lsn = self.last_lsn(txn_id)?;
        let lsn = self.log.append(&LogRecord::FreePart {
            txn_id,
            prev_lsn,
            part_num,
        })?;
        self.with_entry(txn_id, |entry| entry.last_lsn = lsn)?;
        self.log.flush_to(lsn)?;
        Ok(Some(lsn))
    }

    pub fn log_alloc_page(
        &self,
        txn_id: TransactionId,
        page_id: PageId,
    ) -> VellumResult<Option<Lsn>> {
        if DiskSpaceManager::part_num(page_id) == LOG_PARTITION {
            return Ok(None);
        }
        let prev_lsn = self.last_lsn(txn_id)?;
        let lsn = self.log.append(&LogRecord::AllocPage {
            txn_id,
            prev_lsn,
            page_id,
        })?;
        self.with_entry(txn_id, |entry| entry.last_lsn = lsn)?;
        self.log.flush_to(lsn)?;
        Ok(Some(lsn))
    }

    /// Like `log_alloc_page`, and additionally drops the freed page from the
    /// DPT: there is nothing left to redo on it.
    pub fn log_free_page(
        &self,
        txn_id: TransactionId,
        page_id: PageId,
    ) -> VellumResult<Option<Lsn>> {
        if DiskSpaceManager::part_num(page_id) == LOG_PARTITION {
            return Ok(None);
        }
        let prev_lsn = self.last_lsn(txn_id)?;
        let lsn = self.log.append(&LogRecord::FreePage {
            txn_id,
            prev_lsn,
            page_id,
        })?;
        self.with_entry(txn_id, |entry| entry.last_lsn = lsn)?;
        self.dirty_page_table.remove(&page_id);
        self.log.flush_to(lsn)?;
        Ok(Some(lsn))
    }

    /// Record a savepoint at the transaction's current lastLSN. A savepoint
    /// with the same name overwrites the old one.
    pub fn savepoint(&self, txn_id: TransactionId, name: &str) -> VellumResult<()> {
        self.with_entry(txn_id, |entry| {
            let lsn = entry.last_lsn;
            entry.savepoints.insert(name.to_string(), lsn);
        })
    }

    pub fn release_savepoint(&self, txn_id: TransactionId, name: &str) -> VellumResult<()> {
        self.with_entry(txn_id, |entry| {
            entry.savepoints.remove(name);
        })
    }

    /// Undo everything the transaction did after the savepoint, in reverse
    /// order, emitting CLRs. Status is unchanged.
    pub fn rollback_to_savepoint(&self, txn_id: TransactionId, name: &str) -> VellumResult<()> {
        let target = self
            .transaction_table
            .get(&txn_id)
            .and_then(|entry| entry.savepoints.get(name).copied())
            .ok_or_else(|| {
                VellumError::Recovery(format!("no savepoint {} for transaction {}", name, txn_id))
            })?;
        self.rollback_to_lsn(txn_id, target)
    }

    /// WAL hook: called before a page reaches disk; the log must be durable
    /// through the page's LSN first.
    pub fn page_flush_hook(&self, page_lsn: Lsn) -> VellumResult<()> {
        self.log.flush_to(page_lsn)
    }

    /// Called after a page has been written to disk; the page is clean, so
    /// it leaves the DPT. Suppressed during the redo pass.
    pub fn disk_io_hook(&self, page_id: PageId) {
        if self.redo_complete.load(Ordering::SeqCst) {
            self.dirty_page_table.remove(&page_id);
        }
    }

    /// Insert-if-absent with min-merge: a later log record can race an
    /// earlier one to the insertion, and the earlier recLSN must win.
    pub fn dirty_page(&self, page_id: PageId, lsn: Lsn) {
        self.dirty_page_table
            .entry(page_id)
            .and_modify(|rec_lsn| *rec_lsn = (*rec_lsn).min(lsn))
            .or_insert(lsn);
    }

    pub fn flush_to_lsn(&self, lsn: Lsn) -> VellumResult<()> {
        self.log.flush_to(lsn)
    }

    /// Fuzzy checkpoint: begin record, then the DPT and transaction table
    /// streamed into as many end records as it takes (a final one is written
    /// even if empty), then the master record is repointed.
    pub fn checkpoint(&self) -> VellumResult<()> {
        let _guard = self.op_mutex.lock();
        let begin_lsn = self.log.append(&LogRecord::BeginCheckpoint)?;

        let mut chkpt_dpt: Vec<(PageId, Lsn)> = Vec::new();
        let mut chkpt_txns: Vec<(TransactionId, TransactionStatus, Lsn)> = Vec::new();

        for entry in self.dirty_page_table.iter() {
            if !LogRecord::fits_in_one_record(chkpt_dpt.len() + 1, 0) {
                self.log.append(&LogRecord::EndCheckpoint {
                    dpt: std::mem::take(&mut chkpt_dpt),
                    txn_table: Vec::new(),
                })?;
            }
            chkpt_dpt.push((*entry.key(), *entry.value()));
        }

        for entry in self.transaction_table.iter() {
            if !LogRecord::fits_in_one_record(chkpt_dpt.len(), chkpt_txns.len() + 1) {
                self.log.append(&LogRecord::EndCheckpoint {
                    dpt: std::mem::take(&mut chkpt_dpt),
                    txn_table: std::mem::take(&mut chkpt_txns),
                })?;
            }
            chkpt_txns.push((
                *entry.key(),
                entry.transaction.status(),
                entry.last_lsn,
            ));
        }

        let end_lsn = self.log.append(&LogRecord::EndCheckpoint {
            dpt: chkpt_dpt,
            txn_table: chkpt_txns,
        })?;
        self.log.flush_to(end_lsn)?;
        self.log.rewrite_master(begin_lsn)?;
        Ok(())
    }

    pub fn close(&self) -> VellumResult<()> {
        self.checkpoint()?;
        self.log.flush_all()
    }

    // Rollback /////////////////////////////////////////////////////////////

    /// Undo the transaction's actions strictly after `target`, appending a
    /// CLR and applying its effect for each undoable record on the chain.
    fn rollback_to_lsn(&self, txn_id: TransactionId, target: Lsn) -> VellumResult<()> {
        let last_lsn = self.last_lsn(txn_id)?;
        if last_lsn == 0 {
            return Ok(());
        }
        let last_record = self.log.fetch(last_lsn)?;
        // If the chain already ends in a CLR, skip straight past the work it
        // compensated.
        let mut current = last_record.undo_next_lsn().unwrap_or(last_lsn);
        while current > target {
            let record = self.log.fetch(current)?;
            if record.is_undoable() {
                let clr_prev = self.last_lsn(txn_id)?;
                let clr = record
                    .undo(clr_prev)
                    .ok_or_else(|| VellumError::Recovery("undoable record with no CLR".into()))?;
                let clr_lsn = self.log.append(&clr)?;
                self.with_entry(txn_id, |entry| entry.last_lsn = clr_lsn)?;
                self.redo_record(clr_lsn, &clr)?;
            }
            current = record
                .undo_next_lsn()
                .or_else(|| record.prev_lsn())
                .unwrap_or(0);
        }
        Ok(())
    }

    /// Apply the physical effect of a redoable record.
    fn redo_record(&self, lsn: Lsn, record: &LogRecord) -> VellumResult<()> {
        match record {
            LogRecord::UpdatePage {
                page_id,
                offset,
                after,
                ..
            } => self.redo_page_bytes(lsn, *page_id, *offset, after),
            LogRecord::UndoUpdatePage {
                page_id,
                offset,
                image,
                ..
            } => self.redo_page_bytes(lsn, *page_id, *offset, image),
            LogRecord::AllocPart { part_num, .. } | LogRecord::UndoFreePart { part_num, .. } => {
                self.ignore_already_applied(self.disk().alloc_part_with_num(*part_num))
            }
            LogRecord::FreePart { part_num, .. } | LogRecord::UndoAllocPart { part_num, .. } => {
                self.ignore_already_applied(self.disk().free_part(*part_num))
            }
            LogRecord::AllocPage { page_id, .. } | LogRecord::UndoFreePage { page_id, .. } => {
                self.ignore_already_applied(self.disk().alloc_page_with_id(*page_id))
            }
            LogRecord::FreePage { page_id, .. } | LogRecord::UndoAllocPage { page_id, .. } => {
                self.buffer().discard_page(*page_id);
                self.dirty_page_table.remove(page_id);
                self.ignore_already_applied(self.disk().free_page(*page_id))
            }
            other => Err(VellumError::Recovery(format!(
                "record {:?} is not redoable",
                other.record_type()
            ))),
        }
    }

    fn redo_page_bytes(
        &self,
        lsn: Lsn,
        page_id: PageId,
        offset: u16,
        data: &[u8],
    ) -> VellumResult<()> {
        let page = self.buffer().fetch_page(page_id)?;
        page.write_data(offset as usize, data)?;
        page.set_page_lsn(lsn);
        drop(page);
        self.dirty_page(page_id, lsn);
        Ok(())
    }

    /// Allocation redo is idempotent: a partition or page that already
    /// reached its target state reports a storage error we deliberately
    /// swallow.
    fn ignore_already_applied(&self, result: VellumResult<()>) -> VellumResult<()> {
        match result {
            Err(VellumError::Storage(_)) => Ok(()),
            other => other,
        }
    }

    // Restart recovery /////////////////////////////////////////////////////

    /// Run the three recovery passes, prune the DPT of pages the buffer
    /// manager no longer considers dirty, and finish with a checkpoint. New
    /// transactions may start once this returns.
    pub fn restart(&self) -> VellumResult<()> {
        let _guard = self.op_mutex.lock();
        self.redo_complete.store(false, Ordering::SeqCst);
        self.restart_analysis()?;
        self.restart_redo()?;
        self.redo_complete.store(true, Ordering::SeqCst);
        self.clean_dpt();
        self.restart_undo()?;
        drop(_guard);
        self.checkpoint()
    }

    /// Analysis: reconstruct the transaction table and DPT by scanning
    /// forward from the last successful begin-checkpoint.
    fn restart_analysis(&self) -> VellumResult<()> {
        let checkpoint_lsn = self.log.read_master()?;
        let mut ended: HashSet<TransactionId> = HashSet::new();

        for (lsn, record) in self.log.scan_from(checkpoint_lsn) {
            if let Some(txn_id) = record.txn_id() {
                self.ensure_table_entry(txn_id);
                self.with_entry(txn_id, |entry| entry.last_lsn = lsn)?;
                match record.record_type() {
                    LogRecordType::CommitTxn => {
                        self.set_status(txn_id, TransactionStatus::Committing)?;
                    }
                    LogRecordType::AbortTxn => {
                        self.set_status(txn_id, TransactionStatus::RecoveryAborting)?;
                    }
                    LogRecordType::EndTxn => {
                        if let Some((_, entry)) = self.transaction_table.remove(&txn_id) {
                            entry.transaction.cleanup();
                            entry.transaction.set_status(TransactionStatus::Complete);
                        }
                        ended.insert(txn_id);
                    }
                    _ => {}
                }
            }

            if let Some(page_id) = record.page_id() {
                match record.record_type() {
                    LogRecordType::UpdatePage | LogRecordType::UndoUpdatePage => {
                        self.dirty_page_table.entry(page_id).or_insert(lsn);
                    }
                    LogRecordType::FreePage | LogRecordType::UndoAllocPage => {
                        // Changes hit the disk immediately; nothing to redo.
                        self.log.flush_to(lsn)?;
                        self.dirty_page_table.remove(&page_id);
                    }
                    _ => {}
                }
            }

            if let LogRecord::EndCheckpoint { dpt, txn_table } = &record {
                for (page_id, rec_lsn) in dpt {
                    self.dirty_page_table.insert(*page_id, *rec_lsn);
                }
                for (txn_id, status, last_lsn) in txn_table {
                    if ended.contains(txn_id) {
                        continue;
                    }
                    self.ensure_table_entry(*txn_id);
                    self.with_entry(*txn_id, |entry| {
                        entry.last_lsn = entry.last_lsn.max(*last_lsn);
                    })?;
                    let table_status = self
                        .transaction_table
                        .get(txn_id)
                        .map(|e| e.transaction.status())
                        .unwrap_or(TransactionStatus::Complete);
                    // Promote only along legal transitions; never regress.
                    if table_status == TransactionStatus::Running {
                        match status {
                            TransactionStatus::Committing => {
                                self.set_status(*txn_id, TransactionStatus::Committing)?;
                            }
                            TransactionStatus::Aborting
                            | TransactionStatus::RecoveryAborting => {
                                self.set_status(*txn_id, TransactionStatus::RecoveryAborting)?;
                            }
                            _ => {}
                        }
                    }
                }
            }
        }

        // Settle every surviving table entry.
        let txn_ids: Vec<TransactionId> =
            self.transaction_table.iter().map(|e| *e.key()).collect();
        for txn_id in txn_ids {
            let status = match self.transaction_table.get(&txn_id) {
                Some(entry) => entry.transaction.status(),
                None => continue,
            };
            match status {
                TransactionStatus::Committing => {
                    let prev_lsn = self.last_lsn(txn_id)?;
                    self.log.append(&LogRecord::EndTxn { txn_id, prev_lsn })?;
                    if let Some((_, entry)) = self.transaction_table.remove(&txn_id) {
                        entry.transaction.cleanup();
                        entry.transaction.set_status(TransactionStatus::Complete);
                    }
                }
                TransactionStatus::Running => {
                    self.set_status(txn_id, TransactionStatus::RecoveryAborting)?;
                    let prev_lsn = self.last_lsn(txn_id)?;
                    let lsn = self.log.append(&LogRecord::AbortTxn { txn_id, prev_lsn })?;
                    self.with_entry(txn_id, |entry| entry.last_lsn = lsn)?;
                }
                _ => {}
            }
        }
        debug!(
            "analysis complete: {} live transaction(s), {} dirty page(s)",
            self.transaction_table.len(),
            self.dirty_page_table.len()
        );
        Ok(())
    }

    /// Redo: scan from the smallest recLSN, replaying allocation records
    /// unconditionally and page modifications only where the DPT and the
    /// on-disk pageLSN say the effect is missing.
    fn restart_redo(&self) -> VellumResult<()> {
        let start = self
            .dirty_page_table
            .iter()
            .map(|entry| *entry.value())
            .min()
            .unwrap_or_else(|| self.log.next_lsn());

        for (lsn, record) in self.log.scan_from(start) {
            if !record.is_redoable() {
                continue;
            }
            match record.record_type() {
                LogRecordType::AllocPart
                | LogRecordType::FreePart
                | LogRecordType::UndoAllocPart
                | LogRecordType::UndoFreePart
                | LogRecordType::AllocPage
                | LogRecordType::UndoFreePage => {
                    self.redo_record(lsn, &record)?;
                }
                LogRecordType::UpdatePage
                | LogRecordType::UndoUpdatePage
                | LogRecordType::FreePage
                | LogRecordType::UndoAllocPage => {
                    let page_id = record.page_id().expect("page-modifying record");
                    let rec_lsn = match self.dirty_page_table.get(&page_id) {
                        Some(rec_lsn) => *rec_lsn,
                        None => continue,
                    };
                    if lsn < rec_lsn {
                        continue;
                    }
                    let page = match self.buffer().fetch_page(page_id) {
                        Ok(page) => page,
                        // Freed on disk already; the free record's effect is
                        // present.
                        Err(_) => continue,
                    };
                    let apply = page.page_lsn() < lsn;
                    drop(page);
                    if apply {
                        self.redo_record(lsn, &record)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Drop DPT entries for pages the buffer manager does not actually have
    /// dirty, keeping the recLSN of the survivors.
    fn clean_dpt(&self) {
        let mut actually_dirty: HashSet<PageId> = HashSet::new();
        self.buffer().iter_pages(|page_id, dirty| {
            if dirty {
                actually_dirty.insert(page_id);
            }
        });
        self.dirty_page_table
            .retain(|page_id, _| actually_dirty.contains(page_id));
    }

    /// Undo: repeatedly take the loser transaction with the greatest
    /// lastLSN, compensate its record, and follow its chain down to zero.
    fn restart_undo(&self) -> VellumResult<()> {
        let mut heap: BinaryHeap<(Lsn, TransactionId)> = self
            .transaction_table
            .iter()
            .map(|entry| (entry.last_lsn, *entry.key()))
            .collect();

        while let Some((lsn, txn_id)) = heap.pop() {
            let record = self.log.fetch(lsn)?;
            if record.is_undoable() {
                let clr_prev = self.last_lsn(txn_id)?;
                let clr = record
                    .undo(clr_prev)
                    .ok_or_else(|| VellumError::Recovery("undoable record with no CLR".into()))?;
                let clr_lsn = self.log.append(&clr)?;
                self.with_entry(txn_id, |entry| entry.last_lsn = clr_lsn)?;
                self.redo_record(clr_lsn, &clr)?;
            }
            let next = record
                .undo_next_lsn()
                .or_else(|| record.prev_lsn())
                .unwrap_or(0);
            if next == 0 {
                let prev_lsn = self.last_lsn(txn_id)?;
                self.log.append(&LogRecord::EndTxn { txn_id, prev_lsn })?;
                if let Some((_, entry)) = self.transaction_table.remove(&txn_id) {
                    entry.transaction.cleanup();
                    entry.transaction.set_status(TransactionStatus::Complete);
                }
            } else {
                heap.push((next, txn_id));
            }
        }
        Ok(())
    }

    // Introspection ////////////////////////////////////////////////////////

    pub fn dpt_snapshot(&self) -> Vec<(PageId, Lsn)> {
        let mut entries: Vec<_> = self
            .dirty_page_table
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect();
        entries.sort_unstable();
        entries
    }

    pub fn active_transactions(&self) -> Vec<TransactionId> {
        let mut ids: Vec<_> = self.transaction_table.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn transaction_last_lsn(&self, txn_id: TransactionId) -> Option<Lsn> {
        self.transaction_table.get(&txn_id).map(|e| e.last_lsn)
    }

    // Helpers //////////////////////////////////////////////////////////////

    fn last_lsn(&self, txn_id: TransactionId) -> VellumResult<Lsn> {
        self.transaction_table
            .get(&txn_id)
            .map(|entry| entry.last_lsn)
            .ok_or_else(|| {
                VellumError::Recovery(format!("transaction {} not in transaction table", txn_id))
            })
    }

    fn with_entry(
        &self,
        txn_id: TransactionId,
        f: impl FnOnce(&mut TransactionTableEntry),
    ) -> VellumResult<()> {
        match self.transaction_table.get_mut(&txn_id) {
            Some(mut entry) => {
                f(&mut entry);
                Ok(())
            }
            None => Err(VellumError::Recovery(format!(
                "transaction {} not in transaction table",
                txn_id
            ))),
        }
    }

    fn set_status(&self, txn_id: TransactionId, status: TransactionStatus) -> VellumResult<()> {
        self.with_entry(txn_id, |entry| entry.transaction.set_status(status))
    }

    fn ensure_table_entry(&self, txn_id: TransactionId) {
        if !self.transaction_table.contains_key(&txn_id) {
            let transaction = (self.new_transaction)(txn_id);
            self.transaction_table
                .insert(txn_id, TransactionTableEntry::new(transaction));
        }
    }
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("dirty_pages", &self.dirty_page_table.len())
            .field("transactions", &self.transaction_table.len())
            .field("redo_complete", &self.redo_complete.load(Ordering::SeqCst))
            .finish()
    }
}
