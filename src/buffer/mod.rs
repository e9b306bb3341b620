//! Buffer manager: pinned page frames over the disk space manager, with
//! dirty tracking and the two WAL hooks (log flushed before a dirty page
//! reaches disk, dirty-page-table maintenance after it does).

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use once_cell::sync::OnceCell;

use crate::error::{VellumError, VellumResult};
use crate::recovery::{Lsn, RecoveryManager};
use crate::storage::DiskSpaceManager;

pub type PageId = u64;

pub const PAGE_SIZE: usize = 4096;
/// The first 8 bytes of every page hold its pageLSN.
const PAGE_LSN_SIZE: usize = 8;
pub const EFFECTIVE_PAGE_SIZE: usize = PAGE_SIZE - PAGE_LSN_SIZE;

struct Frame {
    data: Vec<u8>,
    dirty: bool,
    pin_count: u32,
}

pub struct BufferManager {
    disk: Arc<DiskSpaceManager>,
    frames: DashMap<PageId, Frame>,
    recovery: OnceCell<Weak<RecoveryManager>>,
}

impl BufferManager {
    pub fn new(disk: Arc<DiskSpaceManager>) -> Self {
        BufferManager {
            disk,
            frames: DashMap::new(),
            recovery: OnceCell::new(),
        }
    }

    /// Wire up the recovery manager. Held weakly: recovery owns the buffer
    /// manager, not the other way around.
    pub fn set_recovery_manager(&self, recovery: Weak<RecoveryManager>) {
        let _ = self.recovery.set(recovery);
    }

    fn recovery(&self) -> Option<Arc<RecoveryManager>> {
        self.recovery.get().and_then(Weak::upgrade)
    }

    pub fn disk_manager(&self) -> &Arc<DiskSpaceManager> {
        &self.disk
    }

    /// Fetch and pin a page, loading it from disk on first touch. The
    /// returned guard unpins on drop.
    pub fn fetch_page(self: &Arc<Self>, page_id: PageId) -> VellumResult<Page> {
        if !self.frames.contains_key(&page_id) {
            let data = self.disk.read_page(page_id)?.to_vec();
            self.frames.entry(page_id).or_insert(Frame {
                data,
                dirty: false,
                pin_count: 0,
            });
        }
        let mut frame = self
            .frames
            .get_mut(&page_id)
            .ok_or_else(|| VellumError::Internal(format!("page {} not buffered", page_id)))?;
        frame.pin_count += 1;
        drop(frame);
        Ok(Page {
            buffer: self.clone(),
            page_id,
        })
    }

    /// Write one dirty page back to disk, honoring WAL: the log is flushed
    /// through the page's LSN first, and the DPT hook runs after the write.
    pub fn flush_page(&self, page_id: PageId) -> VellumResult<()> {
        let (data, page_lsn) = {
            let Some(frame) = self.frames.get(&page_id) else {
                return Ok(());
            };
            if !frame.dirty {
                return Ok(());
            }
            (frame.data.clone(), read_page_lsn(&frame.data))
        };
        if let Some(recovery) = self.recovery() {
            recovery.page_flush_hook(page_lsn)?;
        }
        self.disk.write_page(page_id, &data)?;
        if let Some(mut frame) = self.frames.get_mut(&page_id) {
            frame.dirty = false;
        }
        if let Some(recovery) = self.recovery() {
            recovery.disk_io_hook(page_id);
        }
        Ok(())
    }

    pub fn flush_all_pages(&self) -> VellumResult<()> {
        let page_ids: Vec<PageId> = self.frames.iter().map(|e| *e.key()).collect();
        for page_id in page_ids {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Drop a cached frame without writing it back (page freed on disk).
    pub fn discard_page(&self, page_id: PageId) {
        self.frames.remove(&page_id);
    }

    /// Visit every buffered page with its dirty flag.
    pub fn iter_pages(&self, mut f: impl FnMut(PageId, bool)) {
        for entry in self.frames.iter() {
            f(*entry.key(), entry.dirty);
        }
    }

    pub fn is_dirty(&self, page_id: PageId) -> bool {
        self.frames.get(&page_id).map(|f| f.dirty).unwrap_or(false)
    }

    fn unpin(&self, page_id: PageId, dirty: bool) {
        if let Some(mut frame) = self.frames.get_mut(&page_id) {
            frame.pin_count = frame.pin_count.saturating_sub(1);
            if dirty {
                frame.dirty = true;
            }
        }
    }
}

fn read_page_lsn(data: &[u8]) -> Lsn {
    Lsn::from_le_bytes(data[..PAGE_LSN_SIZE].try_into().expect("8-byte prefix"))
}

/// Pinned page guard. Offsets are relative to the effective data area that
/// follows the pageLSN prefix.
pub struct Page {
    buffer: Arc<BufferManager>,
    page_id: PageId,
}

impl Page {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn page_lsn(&self) -> Lsn {
        self.buffer
            .frames
            .get(&self.page_id)
            .map(|f| read_page_lsn(&f.data))
            .unwrap_or(0)
    }

    pub fn set_page_lsn(&self, lsn: Lsn) {
        if let Some(mut frame) = self.buffer.frames.get_mut(&self.page_id) {
            frame.data[..PAGE_LSN_SIZE].copy_from_slice(&lsn.to_le_bytes());
            frame.dirty = true;
        }
    }

    pub fn read_data(&self, offset: usize, len: usize) -> VellumResult<Vec<u8>> {
        let frame = self
            .buffer
            .frames
            .get(&self.page_id)
            .ok_or_else(|| VellumError::Internal(format!("page {} not buffered", self.page_id)))?;
        let start = PAGE_LSN_SIZE + offset;
        if start + len > PAGE_SIZE {
            return Err(VellumError::Internal(format!(
                "read past end of page {}: offset {} len {}",
                self.page_id, offset, len
            )));
        }
        Ok(frame.data[start..start + len].to_vec())
    }

    /// Release the pin, optionally marking the page dirty first.
    pub fn unpin(self, dirty: bool) {
        if dirty {
            if let Some(mut frame) = self.buffer.frames.get_mut(&self.page_id) {
                frame.dirty = true;
            }
        }
    }

    pub fn write_data(&self, offset: usize, data: &[u8]) -> VellumResult<()> {
        let mut frame = self
            .buffer
            .frames
            .get_mut(&self.page_id)
            .ok_or_else(|| VellumError::Internal(format!("page {} not buffered", self.page_id)))?;
        let start = PAGE_LSN_SIZE + offset;
        if start + data.len() > PAGE_SIZE {
            return Err(VellumError::Internal(format!(
                "write past end of page {}: offset {} len {}",
                self.page_id,
                offset,
                data.len()
            )));
        }
        frame.data[start..start + data.len()].copy_from_slice(data);
        frame.dirty = true;
        Ok(())
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        self.buffer.unpin(self.page_id, false);
    }
}
