//! Transactions.
//!
//! A transaction captures the current meta at begin and resolves every page
//! through that snapshot. Readers share the mmap lock and register
//! themselves so the freelist knows which released pages are still visible.
//! The single writer additionally owns a dirty-page map and the freelist;
//! every page it touches is decoded, rewritten into freshly allocated pages
//! and the old run released under the writer's txid, so no reader ever
//! observes a partially updated tree.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::time::Instant;

use parking_lot::{
    MutexGuard, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard,
};
use tracing::{debug, info, warn};

use crate::bucket::{Bucket, Catalog};
use crate::check;
use crate::db::Db;
use crate::error::{BurrowError, Result};
use crate::freelist::Freelist;
use crate::meta::{self, Meta};
use crate::node::{Inode, Node};
use crate::page::{self, PageHeader, PageKind};
use crate::pager::MapRegion;
use crate::types::{PageId, TxId, MAX_BUCKET_NAME_SIZE, MAX_KEY_SIZE, MAX_VALUE_SIZE};

const MAX_TREE_DEPTH: usize = 64;

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    RolledBack,
}

/// Hold on the mmap region for the lifetime of the transaction. The writer
/// takes the upgradable side so it can grow the mapping during commit.
enum MapGuard<'db> {
    Read(RwLockReadGuard<'db, MapRegion>),
    Upgradable(RwLockUpgradableReadGuard<'db, MapRegion>),
    Empty,
}

impl<'db> MapGuard<'db> {
    fn region(&self) -> Result<&MapRegion> {
        match self {
            MapGuard::Read(guard) => Ok(guard),
            MapGuard::Upgradable(guard) => Ok(guard),
            MapGuard::Empty => Err(BurrowError::corruption("mmap guard released")),
        }
    }
}

struct WriteState {
    dirty: HashMap<PageId, Vec<u8>>,
    freelist: Freelist,
    realloc: Vec<(PageId, u64)>,
}

struct TxInner {
    meta: Meta,
    catalog: Catalog,
    catalog_dirty: bool,
    write: Option<WriteState>,
}

/// A read-only snapshot or the exclusive writer over a database.
pub struct Tx<'db> {
    db: &'db Db,
    inner: RefCell<TxInner>,
    map: MapGuard<'db>,
    write_guard: Option<MutexGuard<'db, ()>>,
    reader_token: Option<u64>,
    writable: bool,
    state: TxState,
    start: Instant,
}

impl<'db> Tx<'db> {
    pub(crate) fn new_read(
        db: &'db Db,
        meta: Meta,
        map: RwLockReadGuard<'db, MapRegion>,
        token: u64,
    ) -> Result<Self> {
        let tx = Self {
            db,
            inner: RefCell::new(TxInner {
                meta,
                catalog: Catalog::default(),
                catalog_dirty: false,
                write: None,
            }),
            map: MapGuard::Read(map),
            write_guard: None,
            reader_token: Some(token),
            writable: false,
            state: TxState::Active,
            start: Instant::now(),
        };
        tx.load_catalog()?;
        debug!(txid = tx.id().0, "read transaction started");
        Ok(tx)
    }

    pub(crate) fn new_write(
        db: &'db Db,
        meta: Meta,
        map: RwLockUpgradableReadGuard<'db, MapRegion>,
        write_guard: MutexGuard<'db, ()>,
        freelist: Freelist,
    ) -> Result<Self> {
        let tx = Self {
            db,
            inner: RefCell::new(TxInner {
                meta,
                catalog: Catalog::default(),
                catalog_dirty: false,
                write: Some(WriteState {
                    dirty: HashMap::new(),
                    freelist,
                    realloc: Vec::new(),
                }),
            }),
            map: MapGuard::Upgradable(map),
            write_guard: Some(write_guard),
            reader_token: None,
            writable: true,
            state: TxState::Active,
            start: Instant::now(),
        };
        tx.load_catalog()?;
        debug!(txid = tx.id().0, "write transaction started");
        Ok(tx)
    }

    fn load_catalog(&self) -> Result<()> {
        let buckets_pgid = self.inner.borrow().meta.buckets_pgid;
        let catalog = self.with_page(buckets_pgid, Catalog::read)?;
        self.inner.borrow_mut().catalog = catalog;
        Ok(())
    }

    /// Transaction id: for readers, the snapshot's committing transaction.
    pub fn id(&self) -> TxId {
        self.inner.borrow().meta.txid
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            TxState::Active => Ok(()),
            _ => Err(BurrowError::TxClosed),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_active()?;
        if !self.writable {
            return Err(BurrowError::TxReadOnly);
        }
        Ok(())
    }

    /// A structural invariant tripped by a writer is fatal: the database
    /// must be reopened before it accepts another transaction.
    pub(crate) fn fatalize(&self, err: BurrowError) -> BurrowError {
        if self.writable && matches!(err, BurrowError::Corruption(_)) {
            self.db.poison();
        }
        err
    }

    // ------------------------------------------------------------------
    // Page access
    // ------------------------------------------------------------------

    /// Run `f` over the bytes of logical page `id`, dirty version first.
    /// The view lives only for the closure, so no mapped bytes can escape
    /// the transaction.
    pub(crate) fn with_page<T>(
        &self,
        id: PageId,
        f: impl FnOnce(&[u8]) -> Result<T>,
    ) -> Result<T> {
        self.ensure_active()?;
        let inner = self.inner.borrow();
        if id >= inner.meta.next_pgid {
            return Err(BurrowError::corruption(format!(
                "page {id} beyond allocated region"
            )));
        }
        if let Some(ws) = &inner.write {
            if let Some(buf) = ws.dirty.get(&id) {
                return f(buf);
            }
        }
        let psize = self.db.page_size() as u64;
        let off = id
            .0
            .checked_mul(psize)
            .ok_or_else(|| BurrowError::corruption("page offset overflow"))?;
        let region = self.map.region()?;
        let header = PageHeader::decode(region.slice(off, psize)?)?;
        if PageId(id.0 + header.overflow as u64) >= inner.meta.next_pgid {
            return Err(BurrowError::corruption(format!(
                "page {id} overflow spills past allocated region"
            )));
        }
        f(region.slice(off, header.span() * psize)?)
    }

    pub(crate) fn page_header(&self, id: PageId) -> Result<PageHeader> {
        self.with_page(id, |buf| PageHeader::decode(buf))
    }

    pub(crate) fn page_info(&self, id: PageId) -> Result<(PageKind, usize)> {
        let header = self.page_header(id)?;
        Ok((header.kind, header.count as usize))
    }

    pub(crate) fn leaf_pair(&self, id: PageId, idx: usize) -> Result<(Vec<u8>, Vec<u8>)> {
        self.with_page(id, |buf| {
            let header = PageHeader::decode(buf)?;
            if idx >= header.count as usize {
                return Err(BurrowError::corruption("leaf element index out of range"));
            }
            let (key, value) = page::leaf_element(buf, idx)?;
            Ok((key.to_vec(), value.to_vec()))
        })
    }

    pub(crate) fn branch_entry(&self, id: PageId, idx: usize) -> Result<(Vec<u8>, PageId)> {
        self.with_page(id, |buf| {
            let header = PageHeader::decode(buf)?;
            if idx >= header.count as usize {
                return Err(BurrowError::corruption("branch element index out of range"));
            }
            let (key, child) = page::branch_element(buf, idx)?;
            Ok((key.to_vec(), child))
        })
    }

    pub(crate) fn branch_child(&self, id: PageId, idx: usize) -> Result<PageId> {
        Ok(self.branch_entry(id, idx)?.1)
    }

    /// Index of the first leaf element ≥ `key`, plus whether it is an exact
    /// match.
    pub(crate) fn leaf_search(&self, id: PageId, key: &[u8]) -> Result<(usize, bool)> {
        self.with_page(id, |buf| {
            let header = PageHeader::decode(buf)?;
            let count = header.count as usize;
            let mut lo = 0;
            let mut hi = count;
            while lo < hi {
                let mid = (lo + hi) / 2;
                let (mid_key, _) = page::leaf_element(buf, mid)?;
                if mid_key < key {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            let exact = lo < count && page::leaf_element(buf, lo)?.0 == key;
            Ok((lo, exact))
        })
    }

    /// Slot whose child subtree covers `key`: the greatest separator ≤ key,
    /// clamped to the first slot.
    pub(crate) fn branch_search(&self, id: PageId, key: &[u8]) -> Result<usize> {
        self.with_page(id, |buf| {
            let header = PageHeader::decode(buf)?;
            let count = header.count as usize;
            let mut lo = 0;
            let mut hi = count;
            while lo < hi {
                let mid = (lo + hi) / 2;
                let (mid_key, _) = page::branch_element(buf, mid)?;
                if mid_key <= key {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            Ok(lo.saturating_sub(1))
        })
    }

    fn read_node(&self, id: PageId) -> Result<Node> {
        self.with_page(id, |buf| Node::read(buf, id))
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    fn allocate(&self, count: u64) -> Result<PageId> {
        let mut inner = self.inner.borrow_mut();
        let TxInner { meta, write, .. } = &mut *inner;
        let ws = write.as_mut().ok_or(BurrowError::TxReadOnly)?;
        if let Some(id) = ws.freelist.allocate(count) {
            ws.realloc.push((id, count));
            return Ok(id);
        }
        let id = meta.next_pgid;
        meta.next_pgid = PageId(id.0 + count);
        Ok(id)
    }

    fn free_page(&self, id: PageId) -> Result<()> {
        let span = {
            let inner = self.inner.borrow();
            let ws = inner.write.as_ref().ok_or(BurrowError::TxReadOnly)?;
            match ws.dirty.get(&id) {
                Some(buf) => (buf.len() / self.db.page_size()) as u64,
                None => {
                    let psize = self.db.page_size() as u64;
                    let off = id
                        .0
                        .checked_mul(psize)
                        .ok_or_else(|| BurrowError::corruption("page offset overflow"))?;
                    let region = self.map.region()?;
                    PageHeader::decode(region.slice(off, psize)?)?.span()
                }
            }
        };
        let mut inner = self.inner.borrow_mut();
        let txid = inner.meta.txid;
        let ws = inner.write.as_mut().ok_or(BurrowError::TxReadOnly)?;
        ws.dirty.remove(&id);
        ws.freelist.free(txid, id, span);
        Ok(())
    }

    /// Release the node's source page, split as needed, and write every
    /// part into freshly allocated pages. Returns `(first key, page id)`
    /// per written part, in order.
    fn write_node(&self, node: Node) -> Result<Vec<(Vec<u8>, PageId)>> {
        let psize = self.db.page_size();
        if node.pgid.0 != 0 {
            self.free_page(node.pgid)?;
        }
        let parts = node.split(psize);
        let mut out = Vec::with_capacity(parts.len());
        for part in parts {
            let count = part.page_count(psize);
            let id = self.allocate(count)?;
            let mut buf = vec![0u8; count as usize * psize];
            part.write(&mut buf, id, psize)?;
            let mut inner = self.inner.borrow_mut();
            let ws = inner.write.as_mut().ok_or(BurrowError::TxReadOnly)?;
            ws.dirty.insert(id, buf);
            out.push((part.first_key(), id));
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Tree operations
    // ------------------------------------------------------------------

    /// Descend from `root` to the leaf position for `key`, recording
    /// `(page id, element index)` per level.
    fn search_path(&self, root: PageId, key: &[u8]) -> Result<Vec<(PageId, usize)>> {
        let mut path = Vec::new();
        let mut id = root;
        loop {
            if path.len() >= MAX_TREE_DEPTH {
                return Err(BurrowError::corruption("tree deeper than supported"));
            }
            let (kind, count) = self.page_info(id)?;
            match kind {
                PageKind::Branch => {
                    if count == 0 {
                        return Err(BurrowError::corruption("branch page with no elements"));
                    }
                    let idx = self.branch_search(id, key)?;
                    path.push((id, idx));
                    id = self.branch_child(id, idx)?;
                }
                PageKind::Leaf => {
                    let (idx, _) = self.leaf_search(id, key)?;
                    path.push((id, idx));
                    return Ok(path);
                }
                _ => return Err(BurrowError::corruption("unexpected page kind in tree")),
            }
        }
    }

    pub(crate) fn tree_get(&self, root: PageId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ensure_active()?;
        let mut id = root;
        let mut depth = 0;
        loop {
            depth += 1;
            if depth > MAX_TREE_DEPTH {
                return Err(BurrowError::corruption("tree deeper than supported"));
            }
            let (kind, count) = self.page_info(id)?;
            match kind {
                PageKind::Branch => {
                    if count == 0 {
                        return Err(BurrowError::corruption("branch page with no elements"));
                    }
                    let idx = self.branch_search(id, key)?;
                    id = self.branch_child(id, idx)?;
                }
                PageKind::Leaf => {
                    let (idx, exact) = self.leaf_search(id, key)?;
                    if !exact {
                        return Ok(None);
                    }
                    return Ok(Some(self.leaf_pair(id, idx)?.1));
                }
                _ => return Err(BurrowError::corruption("unexpected page kind in tree")),
            }
        }
    }

    pub(crate) fn tree_put(&self, root: PageId, key: &[u8], value: &[u8]) -> Result<PageId> {
        self.ensure_writable()?;
        if key.is_empty() {
            return Err(BurrowError::KeyRequired);
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(BurrowError::KeyTooLarge);
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(BurrowError::ValueTooLarge);
        }

        let path = self.search_path(root, key)?;
        let (leaf_id, leaf_idx) = *path
            .last()
            .ok_or_else(|| BurrowError::corruption("empty descent path"))?;

        let mut node = self.read_node(leaf_id)?;
        match node.inodes.get(leaf_idx) {
            Some(inode) if inode.key == key => {
                node.inodes[leaf_idx].value = value.to_vec();
            }
            _ => node
                .inodes
                .insert(leaf_idx, Inode::leaf(key.to_vec(), value.to_vec())),
        }

        let mut children = self.write_node(node)?;
        for &(branch_id, child_idx) in path[..path.len() - 1].iter().rev() {
            let mut pnode = self.read_node(branch_id)?;
            if child_idx >= pnode.inodes.len() {
                return Err(BurrowError::corruption("branch slot out of range"));
            }
            let replacements: Vec<Inode> = children
                .drain(..)
                .map(|(k, id)| Inode::branch(k, id))
                .collect();
            pnode
                .inodes
                .splice(child_idx..child_idx + 1, replacements);
            children = self.write_node(pnode)?;
        }
        self.finish_root(children)
    }

    pub(crate) fn tree_delete(&self, root: PageId, key: &[u8]) -> Result<PageId> {
        self.ensure_writable()?;
        if key.is_empty() {
            return Ok(root);
        }

        let path = self.search_path(root, key)?;
        let (leaf_id, leaf_idx) = *path
            .last()
            .ok_or_else(|| BurrowError::corruption("empty descent path"))?;
        let exact = self.with_page(leaf_id, |buf| {
            let header = PageHeader::decode(buf)?;
            if leaf_idx >= header.count as usize {
                return Ok(false);
            }
            Ok(page::leaf_element(buf, leaf_idx)?.0 == key)
        })?;
        if !exact {
            return Ok(root);
        }

        let psize = self.db.page_size();
        let mut carry = self.read_node(leaf_id)?;
        carry.inodes.remove(leaf_idx);

        for &(branch_id, child_idx) in path[..path.len() - 1].iter().rev() {
            let mut pnode = self.read_node(branch_id)?;
            if child_idx >= pnode.inodes.len() {
                return Err(BurrowError::corruption("branch slot out of range"));
            }
            let child = carry;
            let (start, removed, children) = if child.inodes.is_empty() {
                if child.pgid.0 != 0 {
                    self.free_page(child.pgid)?;
                }
                (child_idx, 1, Vec::new())
            } else if child.underflow(psize) && pnode.inodes.len() > 1 {
                let sib_slot = if child_idx > 0 { child_idx - 1 } else { child_idx + 1 };
                let sibling = self.read_node(pnode.inodes[sib_slot].pgid)?;
                if sibling.pgid.0 != 0 {
                    self.free_page(sibling.pgid)?;
                }
                if child.pgid.0 != 0 {
                    self.free_page(child.pgid)?;
                }
                let (mut left, right, start) = if sib_slot < child_idx {
                    (sibling, child, sib_slot)
                } else {
                    (child, sibling, child_idx)
                };
                left.inodes.extend(right.inodes);
                let merged = Node {
                    pgid: PageId(0),
                    kind: left.kind,
                    inodes: left.inodes,
                };
                (start, 2, self.write_node(merged)?)
            } else {
                (child_idx, 1, self.write_node(child)?)
            };
            pnode.inodes.splice(
                start..start + removed,
                children.into_iter().map(|(k, id)| Inode::branch(k, id)),
            );
            carry = pnode;
        }

        if carry.kind == PageKind::Branch {
            if carry.inodes.len() == 1 {
                // A root branch with a single child collapses into it.
                let new_root = carry.inodes[0].pgid;
                if carry.pgid.0 != 0 {
                    self.free_page(carry.pgid)?;
                }
                return Ok(new_root);
            }
            if carry.inodes.is_empty() {
                if carry.pgid.0 != 0 {
                    self.free_page(carry.pgid)?;
                }
                carry = Node::leaf();
            }
        }
        let children = self.write_node(carry)?;
        self.finish_root(children)
    }

    /// Collapse a child list into a single root, adding levels if a split
    /// propagated past the old root.
    fn finish_root(&self, mut children: Vec<(Vec<u8>, PageId)>) -> Result<PageId> {
        while children.len() > 1 {
            let inodes: Vec<Inode> = children
                .drain(..)
                .map(|(k, id)| Inode::branch(k, id))
                .collect();
            children = self.write_node(Node::branch(inodes))?;
        }
        children
            .first()
            .map(|(_, id)| *id)
            .ok_or_else(|| BurrowError::corruption("tree rewrite produced no root"))
    }

    /// Release every page of the tree rooted at `id`.
    fn tree_free(&self, id: PageId) -> Result<()> {
        let (kind, count) = self.page_info(id)?;
        match kind {
            PageKind::Leaf => self.free_page(id),
            PageKind::Branch => {
                let children: Vec<PageId> = (0..count)
                    .map(|idx| self.branch_child(id, idx))
                    .collect::<Result<_>>()?;
                self.free_page(id)?;
                for child in children {
                    self.tree_free(child)?;
                }
                Ok(())
            }
            _ => Err(BurrowError::corruption("unexpected page kind in tree")),
        }
    }

    // ------------------------------------------------------------------
    // Buckets
    // ------------------------------------------------------------------

    pub(crate) fn bucket_root(&self, name: &[u8]) -> Result<PageId> {
        self.ensure_active()?;
        self.inner
            .borrow()
            .catalog
            .buckets
            .get(name)
            .copied()
            .ok_or(BurrowError::BucketNotFound)
    }

    pub(crate) fn set_bucket_root(&self, name: &[u8], root: PageId) {
        let mut inner = self.inner.borrow_mut();
        inner.catalog.buckets.insert(name.to_vec(), root);
        inner.catalog_dirty = true;
    }

    /// Retrieve a handle to the named bucket.
    pub fn bucket<'a>(&'a self, name: &str) -> Result<Bucket<'a, 'db>> {
        self.ensure_active()?;
        let bytes = name.as_bytes();
        if !self.inner.borrow().catalog.buckets.contains_key(bytes) {
            return Err(BurrowError::BucketNotFound);
        }
        Ok(Bucket::new(self, bytes.to_vec()))
    }

    /// Create a new, empty bucket.
    pub fn create_bucket(&self, name: &str) -> Result<()> {
        self.ensure_writable()?;
        let bytes = name.as_bytes();
        if bytes.is_empty() {
            return Err(BurrowError::BucketNameInvalid("name is empty"));
        }
        if bytes.len() > MAX_BUCKET_NAME_SIZE {
            return Err(BurrowError::BucketNameInvalid("name exceeds 255 bytes"));
        }
        {
            let inner = self.inner.borrow();
            if inner.catalog.buckets.contains_key(bytes) {
                return Err(BurrowError::BucketExists);
            }
            if inner.catalog.size_with(bytes) > self.db.page_size() {
                return Err(BurrowError::CatalogFull);
            }
        }
        let children = self.write_node(Node::leaf()).map_err(|e| self.fatalize(e))?;
        let root = children
            .first()
            .map(|(_, id)| *id)
            .ok_or_else(|| BurrowError::corruption("bucket root allocation failed"))?;
        let mut inner = self.inner.borrow_mut();
        inner.catalog.buckets.insert(bytes.to_vec(), root);
        inner.catalog_dirty = true;
        debug!(txid = inner.meta.txid.0, bucket = name, "created bucket");
        Ok(())
    }

    /// Delete a bucket and release every page of its tree.
    pub fn delete_bucket(&self, name: &str) -> Result<()> {
        self.ensure_writable()?;
        let bytes = name.as_bytes();
        let root = self.bucket_root(bytes)?;
        self.tree_free(root).map_err(|e| self.fatalize(e))?;
        let mut inner = self.inner.borrow_mut();
        inner.catalog.buckets.remove(bytes);
        inner.catalog_dirty = true;
        debug!(txid = inner.meta.txid.0, bucket = name, "deleted bucket");
        Ok(())
    }

    /// Names of every bucket, in lexicographic order.
    pub fn bucket_names(&self) -> Result<Vec<String>> {
        self.ensure_active()?;
        Ok(self
            .inner
            .borrow()
            .catalog
            .buckets
            .keys()
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .collect())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Durably apply this writer's changes.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active()?;
        if !self.writable {
            return Err(BurrowError::TxReadOnly);
        }
        match self.commit_inner() {
            Ok(dirty_pages) => {
                self.state = TxState::Committed;
                self.write_guard = None;
                info!(
                    txid = self.inner.borrow().meta.txid.0,
                    dirty_pages,
                    duration_ms = self.start.elapsed().as_millis() as u64,
                    "transaction committed"
                );
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "commit failed; rolling back");
                self.rollback_inner();
                self.state = TxState::RolledBack;
                Err(self.fatalize(err))
            }
        }
    }

    fn commit_inner(&mut self) -> Result<usize> {
        let psize = self.db.page_size();

        // Catalog first: its replacement page must make it into the
        // freelist serialized below.
        if self.inner.borrow().catalog_dirty {
            let old = self.inner.borrow().meta.buckets_pgid;
            self.free_page(old)?;
            let id = self.allocate(1)?;
            let mut buf = vec![0u8; psize];
            self.inner.borrow().catalog.write(&mut buf, id)?;
            let mut inner = self.inner.borrow_mut();
            let TxInner { meta, write, .. } = &mut *inner;
            let ws = write.as_mut().ok_or(BurrowError::TxReadOnly)?;
            ws.dirty.insert(id, buf);
            meta.buckets_pgid = id;
        }

        // Freelist: release the previous page, then serialize free and
        // pending together so a reopen never leaks pages.
        {
            let old = self.inner.borrow().meta.freelist_pgid;
            self.free_page(old)?;
            let ids = {
                let inner = self.inner.borrow();
                let ws = inner.write.as_ref().ok_or(BurrowError::TxReadOnly)?;
                ws.freelist.free_count() + ws.freelist.pending_count()
            };
            let span = Freelist::pages_for(ids, psize);
            let id = self.allocate(span)?;
            let mut buf = vec![0u8; span as usize * psize];
            let mut inner = self.inner.borrow_mut();
            let TxInner { meta, write, .. } = &mut *inner;
            let ws = write.as_mut().ok_or(BurrowError::TxReadOnly)?;
            ws.freelist.write(&mut buf, id, psize)?;
            ws.dirty.insert(id, buf);
            meta.freelist_pgid = id;
        }

        // Data pages, lowest id first.
        let mut pages: Vec<(PageId, Vec<u8>)> = {
            let mut inner = self.inner.borrow_mut();
            let ws = inner.write.as_mut().ok_or(BurrowError::TxReadOnly)?;
            ws.dirty.drain().collect()
        };
        pages.sort_by_key(|(id, _)| id.0);
        let dirty_pages = pages.len();
        for (id, buf) in &pages {
            self.db.pager().write_page(*id, buf)?;
        }

        let next_pgid = self.inner.borrow().meta.next_pgid;
        self.db.pager().ensure_file_len(next_pgid.0 * psize as u64)?;
        self.db.pager().sync_data()?;

        let file_len = self.db.pager().file_len()?;
        if file_len > self.map.region()?.len() {
            self.grow_map(file_len)?;
        }

        let meta = self.inner.borrow().meta.clone();
        self.db.pager().write_meta(&meta)?;

        let ws = self
            .inner
            .borrow_mut()
            .write
            .take()
            .ok_or(BurrowError::TxReadOnly)?;
        self.db.publish_commit(meta, ws.freelist);
        Ok(dirty_pages)
    }

    fn grow_map(&mut self, needed: u64) -> Result<()> {
        match std::mem::replace(&mut self.map, MapGuard::Empty) {
            MapGuard::Upgradable(guard) => {
                let mut wguard = RwLockUpgradableReadGuard::upgrade(guard);
                let result = self.db.pager().grow_region(&mut wguard, needed);
                self.map = MapGuard::Upgradable(RwLockWriteGuard::downgrade_to_upgradable(wguard));
                result
            }
            other => {
                self.map = other;
                Err(BurrowError::corruption("cannot grow map without writer"))
            }
        }
    }

    /// Discard this transaction's changes.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_active()?;
        let txid = self.id();
        self.rollback_inner();
        self.state = TxState::RolledBack;
        if self.writable {
            warn!(txid = txid.0, "transaction rolled back");
        } else {
            debug!(txid = txid.0, "read transaction closed");
        }
        Ok(())
    }

    fn rollback_inner(&mut self) {
        let txid = self.inner.borrow().meta.txid;
        let ws = self.inner.borrow_mut().write.take();
        if let Some(mut ws) = ws {
            ws.freelist.rollback(txid, &ws.realloc);
            self.db.return_freelist(ws.freelist);
        }
        if let Some(token) = self.reader_token.take() {
            self.db.remove_reader(token);
        }
        self.write_guard = None;
    }

    /// Finish the transaction: a rollback when still active, a no-op
    /// otherwise.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            TxState::Active => self.rollback(),
            _ => Ok(()),
        }
    }

    /// Verify the reachability and ordering invariants of this snapshot.
    pub fn check(&self) -> Result<()> {
        self.ensure_active()?;
        check::run(self)
    }

    // ------------------------------------------------------------------
    // Maintenance plumbing
    // ------------------------------------------------------------------

    pub(crate) fn meta_snapshot(&self) -> Meta {
        self.inner.borrow().meta.clone()
    }

    pub(crate) fn bucket_roots(&self) -> Vec<(Vec<u8>, PageId)> {
        self.inner
            .borrow()
            .catalog
            .buckets
            .iter()
            .map(|(name, root)| (name.clone(), *root))
            .collect()
    }

    /// Ids currently considered free, from the live freelist for a writer
    /// and from the snapshot's freelist page for a reader.
    pub(crate) fn freelist_snapshot_ids(&self) -> Result<Vec<PageId>> {
        {
            let inner = self.inner.borrow();
            if let Some(ws) = &inner.write {
                return Ok(ws.freelist.all_ids());
            }
        }
        let freelist_pgid = self.inner.borrow().meta.freelist_pgid;
        self.with_page(freelist_pgid, |buf| Ok(Freelist::read(buf)?.all_ids()))
    }

    /// Stream a byte-identical snapshot of the database. Both meta slots in
    /// the output carry this snapshot's meta, so the copy opens at exactly
    /// this committed state even while a writer is active.
    pub(crate) fn copy_to(&self, w: &mut dyn Write) -> Result<u64> {
        self.ensure_active()?;
        let psize = self.db.page_size() as u64;
        let meta = self.meta_snapshot();
        let mut buf = vec![0u8; psize as usize];
        for slot in 0..2u64 {
            meta::write_meta_page(&mut buf, &meta, PageId(slot))?;
            w.write_all(&buf)?;
        }
        let region = self.map.region()?;
        let end = meta.next_pgid.0 * psize;
        let mut off = 2 * psize;
        while off < end {
            let chunk = (end - off).min(1 << 20);
            w.write_all(region.slice(off, chunk)?)?;
            off += chunk;
        }
        Ok(end)
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            if self.writable {
                warn!(
                    txid = self.inner.borrow().meta.txid.0,
                    "active write transaction dropped; rolling back"
                );
            }
            self.rollback_inner();
            self.state = TxState::RolledBack;
        }
    }
}
