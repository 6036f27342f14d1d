//! Ordered traversal over one bucket's tree.
//!
//! A cursor is nothing but a stack of `(page id, element index)` pairs from
//! the root down to the current leaf position; siblings are reached by
//! unwinding the stack, never through parent pointers. Yields are owned
//! key/value pairs, so nothing borrowed from a page outlives the
//! transaction.

use smallvec::SmallVec;

use crate::error::{BurrowError, Result};
use crate::page::PageKind;
use crate::tx::Tx;
use crate::types::PageId;

#[derive(Clone, Copy, Debug)]
struct ElemRef {
    pgid: PageId,
    index: usize,
}

/// Stateful position within a bucket, valid while its transaction lives.
pub struct Cursor<'a, 'db> {
    tx: &'a Tx<'db>,
    root: PageId,
    stack: SmallVec<[ElemRef; 8]>,
}

impl<'a, 'db> Cursor<'a, 'db> {
    pub(crate) fn new(tx: &'a Tx<'db>, root: PageId) -> Self {
        Self {
            tx,
            root,
            stack: SmallVec::new(),
        }
    }

    /// Position at the first entry.
    pub fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.stack.clear();
        self.descend_edge(self.root, false)?;
        self.current_or_next_leaf()
    }

    /// Position at the last entry.
    pub fn last(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.stack.clear();
        self.descend_edge(self.root, true)?;
        self.current()
    }

    /// Position at the smallest entry with key ≥ `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.stack.clear();
        let mut id = self.root;
        loop {
            let (kind, count) = self.tx.page_info(id)?;
            match kind {
                PageKind::Branch => {
                    if count == 0 {
                        return Err(BurrowError::corruption("branch page with no elements"));
                    }
                    let index = self.tx.branch_search(id, key)?;
                    self.stack.push(ElemRef { pgid: id, index });
                    id = self.tx.branch_child(id, index)?;
                }
                PageKind::Leaf => {
                    let (index, _) = self.tx.leaf_search(id, key)?;
                    self.stack.push(ElemRef { pgid: id, index });
                    return self.current_or_next_leaf();
                }
                _ => return Err(BurrowError::corruption("unexpected page kind in tree")),
            }
        }
    }

    /// Advance to the next entry. Past the end this keeps returning `None`.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.stack.is_empty() {
            return Ok(None);
        }
        let last = self.stack.len() - 1;
        self.stack[last].index += 1;
        self.current_or_next_leaf()
    }

    /// Step back to the previous entry. Before the start this keeps
    /// returning `None`.
    pub fn prev(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.stack.is_empty() {
            return Ok(None);
        }
        let last = self.stack.len() - 1;
        if self.stack[last].index > 0 {
            self.stack[last].index -= 1;
            return self.current();
        }
        if self.move_to_prev_leaf()? {
            self.current()
        } else {
            Ok(None)
        }
    }

    /// Push the leftmost (or rightmost) descent from `id` onto the stack.
    fn descend_edge(&mut self, mut id: PageId, rightmost: bool) -> Result<()> {
        loop {
            let (kind, count) = self.tx.page_info(id)?;
            match kind {
                PageKind::Leaf => {
                    let index = if rightmost { count.saturating_sub(1) } else { 0 };
                    self.stack.push(ElemRef { pgid: id, index });
                    return Ok(());
                }
                PageKind::Branch => {
                    if count == 0 {
                        return Err(BurrowError::corruption("branch page with no elements"));
                    }
                    let index = if rightmost { count - 1 } else { 0 };
                    self.stack.push(ElemRef { pgid: id, index });
                    id = self.tx.branch_child(id, index)?;
                }
                _ => return Err(BurrowError::corruption("unexpected page kind in tree")),
            }
        }
    }

    fn current(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let Some(&ElemRef { pgid, index }) = self.stack.last() else {
            return Ok(None);
        };
        let (_, count) = self.tx.page_info(pgid)?;
        if index >= count {
            return Ok(None);
        }
        Ok(Some(self.tx.leaf_pair(pgid, index)?))
    }

    /// Current entry, skipping forward over exhausted leaves.
    fn current_or_next_leaf(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            let Some(&ElemRef { pgid, index }) = self.stack.last() else {
                return Ok(None);
            };
            let (_, count) = self.tx.page_info(pgid)?;
            if index < count {
                return Ok(Some(self.tx.leaf_pair(pgid, index)?));
            }
            if !self.move_to_next_leaf()? {
                return Ok(None);
            }
        }
    }

    fn move_to_next_leaf(&mut self) -> Result<bool> {
        self.stack.pop();
        loop {
            let Some(&ElemRef { pgid, index }) = self.stack.last() else {
                return Ok(false);
            };
            let (_, count) = self.tx.page_info(pgid)?;
            if index + 1 < count {
                let last = self.stack.len() - 1;
                self.stack[last].index += 1;
                let child = self.tx.branch_child(pgid, index + 1)?;
                self.descend_edge(child, false)?;
                return Ok(true);
            }
            self.stack.pop();
        }
    }

    fn move_to_prev_leaf(&mut self) -> Result<bool> {
        self.stack.pop();
        loop {
            let Some(&ElemRef { pgid, index }) = self.stack.last() else {
                return Ok(false);
            };
            if index > 0 {
                let last = self.stack.len() - 1;
                self.stack[last].index -= 1;
                let child = self.tx.branch_child(pgid, index - 1)?;
                self.descend_edge(child, true)?;
                return Ok(true);
            }
            self.stack.pop();
        }
    }
}
