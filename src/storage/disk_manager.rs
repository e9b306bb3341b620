//! In-memory disk space manager: partitions of fixed-size pages addressed by
//! `(partition, index)` packed into a single page id. The recovery manager
//! drives it through the same alloc/free/read/write contract a file-backed
//! implementation would expose.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::buffer::{PageId, PAGE_SIZE};
use crate::error::{VellumError, VellumResult};

pub type PartitionId = u32;

/// Partition 0 is reserved for the log; page writes there are never logged.
pub const LOG_PARTITION: PartitionId = 0;

#[derive(Default)]
struct Partition {
    pages: HashMap<u32, Bytes>,
    next_index: u32,
}

pub struct DiskSpaceManager {
    partitions: Mutex<HashMap<PartitionId, Partition>>,
    next_partition: AtomicU32,
}

impl DiskSpaceManager {
    pub fn new() -> Self {
        DiskSpaceManager {
            partitions: Mutex::new(HashMap::new()),
            next_partition: AtomicU32::new(LOG_PARTITION + 1),
        }
    }

    pub fn part_num(page_id: PageId) -> PartitionId {
        (page_id >> 32) as PartitionId
    }

    pub fn page_index(page_id: PageId) -> u32 {
        page_id as u32
    }

    pub fn page_id(part: PartitionId, index: u32) -> PageId {
        ((part as PageId) << 32) | index as PageId
    }

    pub fn alloc_part(&self) -> VellumResult<PartitionId> {
        let part = self.next_partition.fetch_add(1, Ordering::SeqCst);
        self.alloc_part_with_num(part)?;
        Ok(part)
    }

    /// Allocate a specific partition number; used by redo to reproduce the
    /// original allocation.
    pub fn alloc_part_with_num(&self, part: PartitionId) -> VellumResult<()> {
        let mut partitions = self.partitions.lock();
        if partitions.contains_key(&part) {
            return Err(VellumError::Storage(format!(
                "partition {} already allocated",
                part
            )));
        }
        partitions.insert(part, Partition::default());
        self.next_partition.fetch_max(part + 1, Ordering::SeqCst);
        Ok(())
    }

    pub fn free_part(&self, part: PartitionId) -> VellumResult<()> {
        let mut partitions = self.partitions.lock();
        if partitions.remove(&part).is_none() {
            return Err(VellumError::Storage(format!(
                "partition {} not allocated",
                part
            )));
        }
        Ok(())
    }

    pub fn alloc_page(&self, part: PartitionId) -> VellumResult<PageId> {
        let mut partitions = self.partitions.lock();
        let partition = partitions
            .get_mut(&part)
            .ok_or_else(|| VellumError::Storage(format!("partition {} not allocated", part)))?;
        let index = partition.next_index;
        partition.next_index += 1;
        partition
            .pages
            .insert(index, Bytes::from(vec![0u8; PAGE_SIZE]));
        Ok(Self::page_id(part, index))
    }

    /// Allocate a specific page id; used by redo.
    pub fn alloc_page_with_id(&self, page_id: PageId) -> VellumResult<()> {
        let part = Self::part_num(page_id);
        let index = Self::page_index(page_id);
        let mut partitions = self.partitions.lock();
        let partition = partitions
            .get_mut(&part)
            .ok_or_else(|| VellumError::Storage(format!("partition {} not allocated", part)))?;
        if partition.pages.contains_key(&index) {
            return Err(VellumError::Storage(format!(
                "page {} already allocated",
                page_id
            )));
        }
        partition.pages.insert(index, Bytes::from(vec![0u8; PAGE_SIZE]));
        partition.next_index = partition.next_index.max(index + 1);
        Ok(())
    }

    pub fn free_page(&self, page_id: PageId) -> VellumResult<()> {
        let part = Self::part_num(page_id);
        let index = Self::page_index(page_id);
        let mut partitions = self.partitions.lock();
        let partition = partitions
            .get_mut(&part)
            .ok_or_else(|| VellumError::Storage(format!("partition {} not allocated", part)))?;
        if partition.pages.remove(&index).is_none() {
            return Err(VellumError::Storage(format!("page {} not allocated", page_id)));
        }
        Ok(())
    }

    pub fn page_exists(&self, page_id: PageId) -> bool {
        let partitions = self.partitions.lock();
        partitions
            .get(&Self::part_num(page_id))
            .map(|p| p.pages.contains_key(&Self::page_index(page_id)))
            .unwrap_or(false)
    }

    pub fn read_page(&self, page_id: PageId) -> VellumResult<Bytes> {
        let partitions = self.partitions.lock();
        partitions
            .get(&Self::part_num(page_id))
            .and_then(|p| p.pages.get(&Self::page_index(page_id)))
            .cloned()
            .ok_or_else(|| VellumError::Storage(format!("page {} not allocated", page_id)))
    }

    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> VellumResult<()> {
        if data.len() != PAGE_SIZE {
            return Err(VellumError::Storage(format!(
                "page write must be {} bytes, got {}",
                PAGE_SIZE,
                data.len()
            )));
        }
        let mut partitions = self.partitions.lock();
        let partition = partitions
            .get_mut(&Self::part_num(page_id))
            .ok_or_else(|| {
                VellumError::Storage(format!(
                    "partition {} not allocated",
                    Self::part_num(page_id)
                ))
            })?;
        let index = Self::page_index(page_id);
        if !partition.pages.contains_key(&index) {
            return Err(VellumError::Storage(format!("page {} not allocated", page_id)));
        }
        partition.pages.insert(index, Bytes::copy_from_slice(data));
        Ok(())
    }
}

impl Default for DiskSpaceManager {
    fn default() -> Self {
        Self::new()
    }
}
