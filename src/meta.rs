//! Meta page codec.
//!
//! Two meta slots alternate at pages 0 and 1; a commit writes slot
//! `txid % 2`, so a crash before the meta write leaves the previous slot
//! authoritative. The valid slot with the greater txid is the current root
//! state of the database.

use std::ops::Range;

use crate::error::{BurrowError, Result};
use crate::page::{PageHeader, PageKind, PAGE_HEADER_SIZE};
use crate::types::{PageId, TxId, FORMAT_VERSION, MAGIC};

const META_MAGIC: Range<usize> = PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 4;
const META_VERSION: Range<usize> = PAGE_HEADER_SIZE + 4..PAGE_HEADER_SIZE + 8;
const META_PAGE_SIZE: Range<usize> = PAGE_HEADER_SIZE + 8..PAGE_HEADER_SIZE + 12;
const META_NEXT_PGID: Range<usize> = PAGE_HEADER_SIZE + 12..PAGE_HEADER_SIZE + 20;
const META_FREELIST_PGID: Range<usize> = PAGE_HEADER_SIZE + 20..PAGE_HEADER_SIZE + 28;
const META_BUCKETS_PGID: Range<usize> = PAGE_HEADER_SIZE + 28..PAGE_HEADER_SIZE + 36;
const META_TXID: Range<usize> = PAGE_HEADER_SIZE + 36..PAGE_HEADER_SIZE + 44;

/// Root state of the database as described by one meta page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Meta {
    /// Size of each page in bytes.
    pub page_size: u32,
    /// First page id past the allocated region.
    pub next_pgid: PageId,
    /// Page holding the serialized freelist.
    pub freelist_pgid: PageId,
    /// Page holding the bucket catalog.
    pub buckets_pgid: PageId,
    /// Transaction that committed this meta.
    pub txid: TxId,
}

impl Meta {
    /// Meta slot this state belongs to (0 or 1).
    pub fn slot(&self) -> PageId {
        PageId(self.txid.0 % 2)
    }
}

/// Serialize `meta` into a full page buffer addressed as page `slot`.
pub fn write_meta_page(buf: &mut [u8], meta: &Meta, slot: PageId) -> Result<()> {
    if buf.len() < META_TXID.end {
        return Err(BurrowError::corruption("meta buffer too small"));
    }
    buf.fill(0);
    PageHeader::new(slot, PageKind::Meta, 0, 0).encode(buf)?;
    buf[META_MAGIC].copy_from_slice(&MAGIC.to_le_bytes());
    buf[META_VERSION].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf[META_PAGE_SIZE].copy_from_slice(&meta.page_size.to_le_bytes());
    buf[META_NEXT_PGID].copy_from_slice(&meta.next_pgid.0.to_le_bytes());
    buf[META_FREELIST_PGID].copy_from_slice(&meta.freelist_pgid.0.to_le_bytes());
    buf[META_BUCKETS_PGID].copy_from_slice(&meta.buckets_pgid.0.to_le_bytes());
    buf[META_TXID].copy_from_slice(&meta.txid.0.to_le_bytes());
    Ok(())
}

/// Decode and validate one meta page.
///
/// Fails with `InvalidDatabase` on a magic mismatch and `VersionMismatch`
/// when the format version differs from this build.
pub fn read_meta_page(buf: &[u8]) -> Result<Meta> {
    if buf.len() < META_TXID.end {
        return Err(BurrowError::corruption("meta page truncated"));
    }
    let magic = u32::from_le_bytes(buf[META_MAGIC].try_into().unwrap());
    if magic != MAGIC {
        return Err(BurrowError::InvalidDatabase);
    }
    let version = u32::from_le_bytes(buf[META_VERSION].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(BurrowError::VersionMismatch);
    }
    let header = PageHeader::decode(buf)?;
    if header.kind != PageKind::Meta {
        return Err(BurrowError::InvalidDatabase);
    }
    let page_size = u32::from_le_bytes(buf[META_PAGE_SIZE].try_into().unwrap());
    let next_pgid = PageId(u64::from_le_bytes(buf[META_NEXT_PGID].try_into().unwrap()));
    let freelist_pgid = PageId(u64::from_le_bytes(
        buf[META_FREELIST_PGID].try_into().unwrap(),
    ));
    let buckets_pgid = PageId(u64::from_le_bytes(
        buf[META_BUCKETS_PGID].try_into().unwrap(),
    ));
    let txid = TxId(u64::from_le_bytes(buf[META_TXID].try_into().unwrap()));
    Ok(Meta {
        page_size,
        next_pgid,
        freelist_pgid,
        buckets_pgid,
        txid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Meta {
        Meta {
            page_size: 4096,
            next_pgid: PageId(12),
            freelist_pgid: PageId(5),
            buckets_pgid: PageId(7),
            txid: TxId(9),
        }
    }

    #[test]
    fn meta_roundtrip() {
        let meta = sample();
        let mut buf = vec![0u8; 4096];
        write_meta_page(&mut buf, &meta, meta.slot()).unwrap();
        assert_eq!(read_meta_page(&buf).unwrap(), meta);
    }

    #[test]
    fn slot_alternates_with_txid() {
        let mut meta = sample();
        assert_eq!(meta.slot(), PageId(1));
        meta.txid = TxId(10);
        assert_eq!(meta.slot(), PageId(0));
    }

    #[test]
    fn bad_magic_is_invalid_database() {
        let mut buf = vec![0u8; 4096];
        write_meta_page(&mut buf, &sample(), PageId(1)).unwrap();
        buf[META_MAGIC.start] ^= 0xFF;
        assert!(matches!(
            read_meta_page(&buf),
            Err(BurrowError::InvalidDatabase)
        ));
    }

    #[test]
    fn future_version_is_version_mismatch() {
        let mut buf = vec![0u8; 4096];
        write_meta_page(&mut buf, &sample(), PageId(1)).unwrap();
        buf[META_VERSION].copy_from_slice(&2u32.to_le_bytes());
        assert!(matches!(
            read_meta_page(&buf),
            Err(BurrowError::VersionMismatch)
        ));
    }
}
