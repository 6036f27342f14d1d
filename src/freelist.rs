//! Page reclamation.
//!
//! The freelist keeps two populations: ids that are reusable right now, and
//! ids released by a transaction that must stay untouched until every reader
//! with an older snapshot has closed. The serialized form is the union of
//! both, so a reopened database (which by definition has no readers) sees
//! everything as reusable.

use std::collections::BTreeMap;

use crate::error::{BurrowError, Result};
use crate::page::{PageHeader, PageKind, PAGE_HEADER_SIZE};
use crate::types::{PageId, TxId};

#[derive(Debug, Default, Clone)]
pub struct Freelist {
    /// Reusable page ids, sorted ascending.
    free: Vec<PageId>,
    /// Pages released per transaction, awaiting reader drain.
    pending: BTreeMap<TxId, Vec<PageId>>,
}

impl Freelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids(mut ids: Vec<PageId>) -> Self {
        ids.sort_unstable();
        Self {
            free: ids,
            pending: BTreeMap::new(),
        }
    }

    /// Number of ids in the free set.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Number of ids awaiting release.
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Find the lowest run of `n` contiguous ids, remove it and return its
    /// first id. Returns `None` when no such run exists.
    pub fn allocate(&mut self, n: u64) -> Option<PageId> {
        if n == 0 || self.free.is_empty() {
            return None;
        }
        let n = n as usize;
        let mut run_start = 0;
        for i in 0..self.free.len() {
            if i > run_start && self.free[i].0 != self.free[i - 1].0 + 1 {
                run_start = i;
            }
            if i - run_start + 1 == n {
                let first = self.free[run_start];
                self.free.drain(run_start..=i);
                return Some(first);
            }
        }
        None
    }

    /// Record that `start..start+span` was released by `txid`.
    pub fn free(&mut self, txid: TxId, start: PageId, span: u64) {
        let entry = self.pending.entry(txid).or_default();
        for off in 0..span {
            entry.push(PageId(start.0 + off));
        }
    }

    /// Move every pending entry with txid ≤ `min` into the free set.
    pub fn release(&mut self, min: TxId) {
        let keep = self.pending.split_off(&TxId(min.0.saturating_add(1)));
        for (_, mut ids) in std::mem::replace(&mut self.pending, keep) {
            self.free.append(&mut ids);
        }
        self.free.sort_unstable();
    }

    /// Undo a writer: drop its pending entry and put back the ids it had
    /// taken out of the free set.
    pub fn rollback(&mut self, txid: TxId, reallocated: &[(PageId, u64)]) {
        self.pending.remove(&txid);
        for &(start, span) in reallocated {
            for off in 0..span {
                self.free.push(PageId(start.0 + off));
            }
        }
        self.free.sort_unstable();
    }

    /// All ids, free and pending, sorted — the serialized population.
    pub fn all_ids(&self) -> Vec<PageId> {
        let mut ids = self.free.clone();
        for pending in self.pending.values() {
            ids.extend_from_slice(pending);
        }
        ids.sort_unstable();
        ids
    }

    /// Physical pages needed to serialize `count` ids.
    pub fn pages_for(count: usize, page_size: usize) -> u64 {
        let bytes = PAGE_HEADER_SIZE + count * 8;
        bytes.div_ceil(page_size) as u64
    }

    /// Serialize into `buf`, which must span enough pages for the current
    /// population.
    pub fn write(&self, buf: &mut [u8], id: PageId, page_size: usize) -> Result<()> {
        let ids = self.all_ids();
        let count = u16::try_from(ids.len())
            .map_err(|_| BurrowError::corruption("freelist exceeds page element count"))?;
        let span = Self::pages_for(ids.len(), page_size);
        if buf.len() < (span as usize) * page_size {
            return Err(BurrowError::corruption("freelist buffer too small"));
        }
        buf.fill(0);
        PageHeader::new(id, PageKind::Freelist, count, (span - 1) as u32).encode(buf)?;
        for (i, pgid) in ids.iter().enumerate() {
            let off = PAGE_HEADER_SIZE + i * 8;
            buf[off..off + 8].copy_from_slice(&pgid.0.to_le_bytes());
        }
        Ok(())
    }

    /// Deserialize the free set out of a freelist page buffer.
    pub fn read(buf: &[u8]) -> Result<Self> {
        let header = PageHeader::decode(buf)?;
        if header.kind != PageKind::Freelist {
            return Err(BurrowError::corruption("freelist page kind mismatch"));
        }
        let count = header.count as usize;
        if PAGE_HEADER_SIZE + count * 8 > buf.len() {
            return Err(BurrowError::corruption("freelist page truncated"));
        }
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let off = PAGE_HEADER_SIZE + i * 8;
            ids.push(PageId(u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())));
        }
        Ok(Self::from_ids(ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u64]) -> Vec<PageId> {
        raw.iter().copied().map(PageId).collect()
    }

    #[test]
    fn allocate_prefers_lowest_contiguous_run() {
        let mut fl = Freelist::from_ids(ids(&[3, 4, 6, 7, 8, 12]));
        assert_eq!(fl.allocate(3), Some(PageId(6)));
        assert_eq!(fl.all_ids(), ids(&[3, 4, 12]));
        assert_eq!(fl.allocate(2), Some(PageId(3)));
        assert_eq!(fl.allocate(2), None);
        assert_eq!(fl.allocate(1), Some(PageId(12)));
        assert_eq!(fl.allocate(1), None);
    }

    #[test]
    fn pending_pages_are_not_allocatable_until_released() {
        let mut fl = Freelist::new();
        fl.free(TxId(5), PageId(10), 2);
        assert_eq!(fl.allocate(1), None);
        assert_eq!(fl.pending_count(), 2);

        fl.release(TxId(4));
        assert_eq!(fl.allocate(1), None, "txid 5 must stay pending");

        fl.release(TxId(5));
        assert_eq!(fl.allocate(2), Some(PageId(10)));
    }

    #[test]
    fn release_moves_everything_at_or_below_the_mark() {
        let mut fl = Freelist::new();
        fl.free(TxId(3), PageId(30), 1);
        fl.free(TxId(4), PageId(40), 1);
        fl.free(TxId(7), PageId(70), 1);
        fl.release(TxId(4));
        assert_eq!(fl.free_count(), 2);
        assert_eq!(fl.pending_count(), 1);
        assert_eq!(fl.allocate(1), Some(PageId(30)));
    }

    #[test]
    fn rollback_restores_taken_ids_and_drops_pending() {
        let mut fl = Freelist::from_ids(ids(&[5, 6]));
        let got = fl.allocate(2).unwrap();
        assert_eq!(got, PageId(5));
        fl.free(TxId(9), PageId(20), 1);

        fl.rollback(TxId(9), &[(PageId(5), 2)]);
        assert_eq!(fl.pending_count(), 0);
        assert_eq!(fl.all_ids(), ids(&[5, 6]));
    }

    #[test]
    fn serialization_merges_free_and_pending() {
        let mut fl = Freelist::from_ids(ids(&[9]));
        fl.free(TxId(2), PageId(4), 2);

        let page_size = 4096;
        let mut buf = vec![0u8; page_size];
        fl.write(&mut buf, PageId(3), page_size).unwrap();

        let read = Freelist::read(&buf).unwrap();
        assert_eq!(read.all_ids(), ids(&[4, 5, 9]));
        assert_eq!(read.pending_count(), 0);
    }

    #[test]
    fn pages_for_accounts_for_header() {
        assert_eq!(Freelist::pages_for(0, 4096), 1);
        assert_eq!(Freelist::pages_for(510, 4096), 1);
        assert_eq!(Freelist::pages_for(511, 4096), 2);
    }
}
