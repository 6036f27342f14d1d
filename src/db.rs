//! Database façade.
//!
//! A `Db` owns the pager and the shared state every transaction hangs off:
//! the authoritative meta, the freelist (owned by at most one writer at a
//! time), and the set of open readers that hold released pages alive.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{BurrowError, Result};
use crate::freelist::Freelist;
use crate::meta::Meta;
use crate::pager::Pager;
use crate::tx::Tx;
use crate::types::TxId;

const MAX_BATCH_ATTEMPTS: usize = 3;

/// Open-time configuration. There are no other knobs.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Permission bits for a newly created database file (Unix only).
    pub mode: u32,
    /// Skip every fsync. Only acceptable for tests; a crash may lose or
    /// corrupt data.
    pub no_sync: bool,
    /// Skip the fsync after the meta write. Unsafe: a crash can roll the
    /// database back to an earlier transaction.
    pub no_metasync: bool,
    /// Disallow write transactions.
    pub read_only: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            mode: 0o600,
            no_sync: false,
            no_metasync: false,
            read_only: false,
        }
    }
}

struct Reader {
    token: u64,
    txid: TxId,
}

struct Shared {
    meta: Meta,
    freelist: Option<Freelist>,
    readers: Vec<Reader>,
    next_token: u64,
}

/// An open database file.
pub struct Db {
    path: PathBuf,
    options: Options,
    pager: Pager,
    state: Mutex<Shared>,
    write_lock: Mutex<()>,
    /// Set when a writer trips a structural invariant; the engine never
    /// repairs in place, so the value must be reopened.
    poisoned: AtomicBool,
}

impl Db {
    /// Open the database at `path`, creating and initializing the file if
    /// it does not exist.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (pager, meta) = Pager::open(&path, &options)?;
        let freelist = pager.load_freelist(&meta)?;
        info!(
            path = %path.display(),
            txid = meta.txid.0,
            page_size = pager.page_size(),
            "opened database"
        );
        Ok(Self {
            path,
            options,
            pager,
            state: Mutex::new(Shared {
                meta,
                freelist: Some(freelist),
                readers: Vec::new(),
                next_token: 1,
            }),
            write_lock: Mutex::new(()),
            poisoned: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.pager.page_size()
    }

    pub(crate) fn pager(&self) -> &Pager {
        &self.pager
    }

    /// Begin a transaction: a shared snapshot, or the exclusive writer.
    ///
    /// A writer first releases every pending freelist entry no open reader
    /// can still observe.
    pub fn begin(&self, write: bool) -> Result<Tx<'_>> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(BurrowError::DatabaseNotOpen);
        }
        if !write {
            let (meta, token) = {
                let mut shared = self.state.lock();
                let token = shared.next_token;
                shared.next_token += 1;
                let meta = shared.meta.clone();
                shared.readers.push(Reader {
                    token,
                    txid: meta.txid,
                });
                (meta, token)
            };
            let map = self.pager.map.read();
            return Tx::new_read(self, meta, map, token);
        }

        if self.options.read_only {
            return Err(BurrowError::TxReadOnly);
        }
        let write_guard = self.write_lock.lock();
        let (meta, freelist) = {
            let mut shared = self.state.lock();
            let mut meta = shared.meta.clone();
            meta.txid = TxId(meta.txid.0 + 1);
            let mut freelist = shared
                .freelist
                .take()
                .ok_or_else(|| BurrowError::corruption("writer freelist missing"))?;
            match shared.readers.iter().map(|r| r.txid).min() {
                Some(min) => freelist.release(TxId(min.0.saturating_sub(1))),
                None => freelist.release(TxId(u64::MAX)),
            }
            (meta, freelist)
        };
        let map = self.pager.map.upgradable_read();
        Tx::new_write(self, meta, map, write_guard, freelist)
    }

    /// Run `f` inside a read-only transaction.
    pub fn view<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let mut tx = self.begin(false)?;
        match f(&tx) {
            Ok(value) => {
                tx.close()?;
                Ok(value)
            }
            Err(err) => {
                let _ = tx.close();
                Err(err)
            }
        }
    }

    /// Run `f` inside a write transaction and commit it, retrying the whole
    /// closure when the commit itself fails on a transient I/O error.
    /// Errors returned by `f` roll back and propagate unchanged.
    pub fn batch<T>(&self, f: impl Fn(&Tx<'_>) -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut tx = self.begin(true)?;
            match f(&tx) {
                Ok(value) => match tx.commit() {
                    Ok(()) => return Ok(value),
                    Err(BurrowError::Io(err)) if attempt < MAX_BATCH_ATTEMPTS => {
                        warn!(attempt, error = %err, "batch commit failed; retrying");
                    }
                    Err(err) => return Err(err),
                },
                Err(err) => {
                    let _ = tx.rollback();
                    return Err(err);
                }
            }
        }
    }

    /// Stream a consistent copy of the database under a reader snapshot,
    /// so referenced pages cannot be reclaimed while copying. Returns the
    /// number of bytes written.
    pub fn copy<W: Write>(&self, w: &mut W) -> Result<u64> {
        let mut tx = self.begin(false)?;
        let result = tx.copy_to(w);
        let _ = tx.close();
        result
    }

    /// Copy the database into a new file at `path`.
    pub fn copy_file(&self, path: impl AsRef<Path>) -> Result<u64> {
        let mut file = File::create(path)?;
        let written = self.copy(&mut file)?;
        file.sync_all()?;
        Ok(written)
    }

    /// Verify the invariants of the current committed state.
    pub fn check(&self) -> Result<()> {
        self.view(|tx| tx.check())
    }

    /// Flush the data file to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.pager.sync_all()
    }

    /// Close the database, releasing the file and the mapping.
    pub fn close(self) {}

    pub(crate) fn publish_commit(&self, meta: Meta, freelist: Freelist) {
        let mut shared = self.state.lock();
        shared.meta = meta;
        shared.freelist = Some(freelist);
    }

    pub(crate) fn return_freelist(&self, freelist: Freelist) {
        self.state.lock().freelist = Some(freelist);
    }

    pub(crate) fn remove_reader(&self, token: u64) {
        self.state.lock().readers.retain(|r| r.token != token);
    }

    pub(crate) fn poison(&self) {
        warn!(path = %self.path.display(), "database poisoned; reopen required");
        self.poisoned.store(true, Ordering::Release);
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "closing database");
    }
}
