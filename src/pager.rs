//! File lifecycle and page resolution.
//!
//! Reads go through a read-only memory mapping sized well past the end of
//! the file, so ordinary growth never remaps; writes bypass the mapping and
//! go through positioned I/O on two handles — one for batched data pages,
//! one reserved for the meta page so the final write of a commit carries
//! synchronous semantics.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};
use parking_lot::RwLock;
use tracing::info;

use crate::db::Options;
use crate::error::{BurrowError, Result};
use crate::freelist::Freelist;
use crate::io::{FileIo, StdFileIo};
use crate::meta::{self, Meta};
use crate::page::{PageHeader, PageKind};
use crate::types::{PageId, TxId, MIN_PAGE_SIZE};

/// Initial mapping length; the map is only rebuilt if the file outgrows it.
pub const INITIAL_MMAP_SIZE: u64 = 2 << 30;

/// Read-only view over the database file.
pub struct MapRegion {
    mmap: Mmap,
}

impl MapRegion {
    fn map(file: &std::fs::File, len: u64) -> Result<Self> {
        // Safety: the mapping is read-only and the engine never mutates
        // file ranges referenced by a live snapshot.
        let mmap = unsafe {
            MmapOptions::new()
                .len(len as usize)
                .map(file)
                .map_err(BurrowError::from)?
        };
        Ok(Self { mmap })
    }

    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn slice(&self, off: u64, len: u64) -> Result<&[u8]> {
        let end = off
            .checked_add(len)
            .ok_or_else(|| BurrowError::corruption("page offset overflow"))?;
        if end > self.len() {
            return Err(BurrowError::corruption("page beyond mapped region"));
        }
        Ok(&self.mmap[off as usize..end as usize])
    }
}

pub struct Pager {
    data: StdFileIo,
    meta_io: Option<StdFileIo>,
    pub(crate) map: RwLock<MapRegion>,
    page_size: usize,
    no_sync: bool,
    no_metasync: bool,
}

impl Pager {
    /// Open the file at `path`, initializing it when empty, and return the
    /// pager together with the current meta.
    pub fn open(path: &Path, opts: &Options) -> Result<(Self, Meta)> {
        let mut open_opts = OpenOptions::new();
        open_opts.read(true);
        if !opts.read_only {
            open_opts.write(true).create(true).truncate(false);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                open_opts.mode(opts.mode);
            }
        }
        let data = StdFileIo::new(open_opts.open(path)?);

        let page_size = if data.is_empty()? {
            if opts.read_only {
                return Err(BurrowError::InvalidDatabase);
            }
            let page_size = os_page_size();
            init_file(&data, page_size)?;
            info!(path = %path.display(), page_size, "created database file");
            page_size
        } else {
            discover_page_size(&data)?
        };

        let file_len = data.len()?;
        if file_len < 2 * page_size as u64 {
            return Err(BurrowError::corruption("file smaller than two meta pages"));
        }

        let meta_io = if opts.read_only {
            None
        } else {
            let mut meta_opts = OpenOptions::new();
            meta_opts.read(true).write(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                meta_opts.custom_flags(libc::O_SYNC);
            }
            Some(StdFileIo::new(meta_opts.open(path)?))
        };

        let region = MapRegion::map(data.file(), file_len.max(INITIAL_MMAP_SIZE))?;
        let current = load_current_meta(&region, page_size)?;

        Ok((
            Self {
                data,
                meta_io,
                map: RwLock::new(region),
                page_size,
                no_sync: opts.no_sync,
                no_metasync: opts.no_metasync,
            },
            current,
        ))
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn file_len(&self) -> Result<u64> {
        self.data.len()
    }

    /// Read the freelist referenced by `meta` out of the mapping.
    pub fn load_freelist(&self, meta: &Meta) -> Result<Freelist> {
        let region = self.map.read();
        let psize = self.page_size as u64;
        let off = meta.freelist_pgid.0 * psize;
        let header = PageHeader::decode(region.slice(off, psize)?)?;
        if header.kind != PageKind::Freelist {
            return Err(BurrowError::corruption("meta does not point at a freelist"));
        }
        Freelist::read(region.slice(off, header.span() * psize)?)
    }

    /// Write one dirty page buffer at its assigned offset.
    pub fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()> {
        let off = id
            .0
            .checked_mul(self.page_size as u64)
            .ok_or_else(|| BurrowError::corruption("page offset overflow"))?;
        self.data.write_at(off, buf)
    }

    /// Grow the file to `len` so every allocated page is backed by storage.
    pub fn ensure_file_len(&self, len: u64) -> Result<()> {
        if self.data.len()? < len {
            self.data.set_len(len)?;
        }
        Ok(())
    }

    /// Flush data pages written so far, honoring `no_sync`.
    pub fn sync_data(&self) -> Result<()> {
        if self.no_sync {
            return Ok(());
        }
        self.data.sync_data()
    }

    /// Flush everything to stable storage.
    pub fn sync_all(&self) -> Result<()> {
        self.data.sync_all()
    }

    /// Durably write `meta` to its slot through the synchronous handle.
    pub fn write_meta(&self, meta: &Meta) -> Result<()> {
        let meta_io = self.meta_io.as_ref().ok_or(BurrowError::TxReadOnly)?;
        let mut buf = vec![0u8; self.page_size];
        meta::write_meta_page(&mut buf, meta, meta.slot())?;
        meta_io.write_at(meta.slot().0 * self.page_size as u64, &buf)?;
        if !self.no_sync && !self.no_metasync {
            meta_io.sync_data()?;
        }
        Ok(())
    }

    /// Rebuild `region` to cover at least `needed` bytes. The caller must
    /// hold the map lock exclusively.
    pub fn grow_region(&self, region: &mut MapRegion, needed: u64) -> Result<()> {
        let new_len = needed.max(region.len().saturating_mul(2));
        *region = MapRegion::map(self.data.file(), new_len)?;
        Ok(())
    }
}

/// Page size reported by the host, clamped to the supported minimum.
fn os_page_size() -> usize {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size >= MIN_PAGE_SIZE as i64 && (size as usize).is_power_of_two() {
            return size as usize;
        }
    }
    MIN_PAGE_SIZE
}

/// Lay out a fresh database: meta slots at 0 and 1, an empty freelist at 2,
/// an empty bucket catalog at 3.
fn init_file(data: &StdFileIo, page_size: usize) -> Result<()> {
    let mut buf = vec![0u8; page_size * 4];
    for txid in 0..2u64 {
        let m = Meta {
            page_size: page_size as u32,
            next_pgid: PageId(4),
            freelist_pgid: PageId(2),
            buckets_pgid: PageId(3),
            txid: TxId(txid),
        };
        let off = txid as usize * page_size;
        meta::write_meta_page(&mut buf[off..off + page_size], &m, PageId(txid))?;
    }
    Freelist::new().write(
        &mut buf[2 * page_size..3 * page_size],
        PageId(2),
        page_size,
    )?;
    PageHeader::new(PageId(3), PageKind::Buckets, 0, 0)
        .encode(&mut buf[3 * page_size..4 * page_size])?;
    data.write_at(0, &buf)?;
    data.sync_all()
}

/// Learn the page size from meta slot 0, falling back to slot 1 at the host
/// page size when slot 0 does not validate.
fn discover_page_size(data: &StdFileIo) -> Result<usize> {
    let mut probe = vec![0u8; MIN_PAGE_SIZE];
    data.read_at(0, &mut probe)?;
    match meta::read_meta_page(&probe) {
        Ok(m) => Ok(m.page_size as usize),
        Err(first) => {
            let fallback = os_page_size();
            let mut alt = vec![0u8; fallback];
            if data.read_at(fallback as u64, &mut alt).is_ok() {
                if let Ok(m) = meta::read_meta_page(&alt) {
                    return Ok(m.page_size as usize);
                }
            }
            Err(first)
        }
    }
}

/// Validate both meta slots and return the authoritative one.
fn load_current_meta(region: &MapRegion, page_size: usize) -> Result<Meta> {
    let psize = page_size as u64;
    let meta0 = meta::read_meta_page(region.slice(0, psize)?);
    let meta1 = meta::read_meta_page(region.slice(psize, psize)?);
    match (meta0, meta1) {
        (Ok(a), Ok(b)) => Ok(if a.txid >= b.txid { a } else { b }),
        (Ok(a), Err(_)) => Ok(a),
        (Err(_), Ok(b)) => Ok(b),
        (Err(BurrowError::VersionMismatch), Err(_)) | (Err(_), Err(BurrowError::VersionMismatch)) => {
            Err(BurrowError::VersionMismatch)
        }
        (Err(_), Err(_)) => Err(BurrowError::InvalidDatabase),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_and_reopen_keeps_meta() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pager.db");

        let (pager, meta) = Pager::open(&path, &Options::default()).unwrap();
        assert_eq!(meta.txid, TxId(1));
        assert_eq!(meta.next_pgid, PageId(4));
        assert_eq!(meta.freelist_pgid, PageId(2));
        assert_eq!(meta.buckets_pgid, PageId(3));
        assert!(pager.page_size() >= MIN_PAGE_SIZE);
        drop(pager);

        let (pager, reopened) = Pager::open(&path, &Options::default()).unwrap();
        assert_eq!(reopened, meta);
        let freelist = pager.load_freelist(&reopened).unwrap();
        assert_eq!(freelist.free_count(), 0);
    }

    #[test]
    fn read_only_open_of_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.db");
        let opts = Options {
            read_only: true,
            ..Options::default()
        };
        assert!(Pager::open(&path, &opts).is_err());
    }

    #[test]
    fn meta_write_lands_in_its_slot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pager.db");
        let (pager, mut meta) = Pager::open(&path, &Options::default()).unwrap();
        meta.txid = TxId(2);
        pager.write_meta(&meta).unwrap();
        drop(pager);

        let (_, current) = Pager::open(&path, &Options::default()).unwrap();
        assert_eq!(current.txid, TxId(2));
        assert_eq!(current.slot(), PageId(0));
    }
}
