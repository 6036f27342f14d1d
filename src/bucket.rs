//! Named buckets and the catalog page that indexes them.
//!
//! The catalog is a single `buckets`-kind page mapping bucket name to the
//! root page of that bucket's tree. It is deliberately bounded to one page:
//! creation fails rather than growing it.

use std::collections::BTreeMap;

use crate::cursor::Cursor;
use crate::error::{BurrowError, Result};
use crate::page::{PageHeader, PageKind, PAGE_HEADER_SIZE};
use crate::tx::Tx;
use crate::types::PageId;

const CATALOG_RECORD_OVERHEAD: usize = 8 + 1;

/// In-memory bucket catalog: name → root page id.
#[derive(Clone, Debug, Default)]
pub(crate) struct Catalog {
    pub buckets: BTreeMap<Vec<u8>, PageId>,
}

impl Catalog {
    /// Decode the catalog out of its page buffer.
    pub fn read(buf: &[u8]) -> Result<Self> {
        let header = PageHeader::decode(buf)?;
        if header.kind != PageKind::Buckets {
            return Err(BurrowError::corruption("catalog page kind mismatch"));
        }
        let mut buckets = BTreeMap::new();
        let mut off = PAGE_HEADER_SIZE;
        for _ in 0..header.count {
            if off + CATALOG_RECORD_OVERHEAD > buf.len() {
                return Err(BurrowError::corruption("catalog record truncated"));
            }
            let root = PageId(u64::from_le_bytes(buf[off..off + 8].try_into().unwrap()));
            let name_len = buf[off + 8] as usize;
            off += CATALOG_RECORD_OVERHEAD;
            if off + name_len > buf.len() {
                return Err(BurrowError::corruption("catalog name truncated"));
            }
            buckets.insert(buf[off..off + name_len].to_vec(), root);
            off += name_len;
        }
        Ok(Self { buckets })
    }

    /// Serialized size of the catalog, including the page header.
    pub fn size(&self) -> usize {
        PAGE_HEADER_SIZE
            + self
                .buckets
                .keys()
                .map(|name| CATALOG_RECORD_OVERHEAD + name.len())
                .sum::<usize>()
    }

    /// Size the catalog would have with `name` added.
    pub fn size_with(&self, name: &[u8]) -> usize {
        self.size() + CATALOG_RECORD_OVERHEAD + name.len()
    }

    /// Serialize into a single page buffer addressed as `id`.
    pub fn write(&self, buf: &mut [u8], id: PageId) -> Result<()> {
        if self.size() > buf.len() {
            return Err(BurrowError::CatalogFull);
        }
        let count = u16::try_from(self.buckets.len())
            .map_err(|_| BurrowError::CatalogFull)?;
        buf.fill(0);
        PageHeader::new(id, PageKind::Buckets, count, 0).encode(buf)?;
        let mut off = PAGE_HEADER_SIZE;
        for (name, root) in &self.buckets {
            buf[off..off + 8].copy_from_slice(&root.0.to_le_bytes());
            buf[off + 8] = name.len() as u8;
            off += CATALOG_RECORD_OVERHEAD;
            buf[off..off + name.len()].copy_from_slice(name);
            off += name.len();
        }
        Ok(())
    }
}

/// Handle to one bucket, valid for the lifetime of its transaction borrow.
pub struct Bucket<'a, 'db> {
    tx: &'a Tx<'db>,
    name: Vec<u8>,
}

impl<'a, 'db> Bucket<'a, 'db> {
    pub(crate) fn new(tx: &'a Tx<'db>, name: Vec<u8>) -> Self {
        Self { tx, name }
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Look up the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let root = self.tx.bucket_root(&self.name)?;
        self.tx.tree_get(root, key)
    }

    /// Insert `key` → `value`, replacing any existing value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let root = self.tx.bucket_root(&self.name)?;
        let new_root = self
            .tx
            .tree_put(root, key, value)
            .map_err(|e| self.tx.fatalize(e))?;
        if new_root != root {
            self.tx.set_bucket_root(&self.name, new_root);
        }
        Ok(())
    }

    /// Remove `key`. Deleting a missing key is a successful no-op.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let root = self.tx.bucket_root(&self.name)?;
        let new_root = self
            .tx
            .tree_delete(root, key)
            .map_err(|e| self.tx.fatalize(e))?;
        if new_root != root {
            self.tx.set_bucket_root(&self.name, new_root);
        }
        Ok(())
    }

    /// Open an ordered cursor over this bucket.
    pub fn cursor(&self) -> Result<Cursor<'a, 'db>> {
        let root = self.tx.bucket_root(&self.name)?;
        Ok(Cursor::new(self.tx, root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_roundtrip_is_sorted_by_name() {
        let mut catalog = Catalog::default();
        catalog.buckets.insert(b"zebra".to_vec(), PageId(9));
        catalog.buckets.insert(b"apple".to_vec(), PageId(4));

        let mut buf = vec![0u8; 4096];
        catalog.write(&mut buf, PageId(3)).unwrap();

        let read = Catalog::read(&buf).unwrap();
        assert_eq!(read.buckets.len(), 2);
        assert_eq!(read.buckets[b"apple".as_slice()], PageId(4));
        assert_eq!(read.buckets[b"zebra".as_slice()], PageId(9));

        let first_name_off = PAGE_HEADER_SIZE + CATALOG_RECORD_OVERHEAD;
        assert_eq!(&buf[first_name_off..first_name_off + 5], b"apple");
    }

    #[test]
    fn oversized_catalog_reports_full() {
        let mut catalog = Catalog::default();
        for i in 0..40u8 {
            let mut name = vec![b'a' + (i % 26); 120];
            name.push(i);
            catalog.buckets.insert(name, PageId(u64::from(i) + 10));
        }
        let mut buf = vec![0u8; 4096];
        assert!(matches!(
            catalog.write(&mut buf, PageId(3)),
            Err(BurrowError::CatalogFull)
        ));
    }

    #[test]
    fn empty_catalog_roundtrip() {
        let catalog = Catalog::default();
        let mut buf = vec![0u8; 4096];
        catalog.write(&mut buf, PageId(3)).unwrap();
        assert!(Catalog::read(&buf).unwrap().buckets.is_empty());
    }
}
