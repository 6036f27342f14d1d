//! Consistency verification.
//!
//! Walks one snapshot end to end and verifies that every page below
//! `next_pgid` is owned exactly once — by a meta slot, the catalog, a
//! bucket tree, the freelist page itself or the free set — and that every
//! branch and leaf keeps its keys strictly increasing within the bounds
//! inherited from its parent. Findings are collected rather than aborting
//! on the first problem.

use std::collections::HashMap;

use tracing::warn;

use crate::error::{BurrowError, Result};
use crate::page::PageKind;
use crate::tx::Tx;
use crate::types::PageId;

const MAX_FINDINGS: usize = 32;

struct Checker<'a, 'db> {
    tx: &'a Tx<'db>,
    next_pgid: PageId,
    owners: HashMap<u64, String>,
    findings: Vec<String>,
}

impl<'a, 'db> Checker<'a, 'db> {
    fn finding(&mut self, message: String) {
        if self.findings.len() < MAX_FINDINGS {
            self.findings.push(message);
        }
    }

    fn claim(&mut self, id: PageId, span: u64, owner: &str) {
        for off in 0..span {
            let page = id.0 + off;
            if PageId(page) >= self.next_pgid {
                self.finding(format!("{owner}: page {page} beyond allocated region"));
                continue;
            }
            if let Some(previous) = self.owners.insert(page, owner.to_string()) {
                self.finding(format!(
                    "page {page} owned by both {previous} and {owner}"
                ));
            }
        }
    }

    fn claim_spanned(&mut self, id: PageId, owner: &str) -> Result<()> {
        let span = self.tx.page_header(id)?.span();
        self.claim(id, span, owner);
        Ok(())
    }

    /// Walk one tree, checking ordering and key-range containment.
    fn walk(
        &mut self,
        id: PageId,
        lo: Option<Vec<u8>>,
        hi: Option<Vec<u8>>,
        bucket: &str,
    ) -> Result<()> {
        self.claim_spanned(id, bucket)?;
        let (kind, count) = self.tx.page_info(id)?;
        match kind {
            PageKind::Leaf => {
                let mut prev: Option<Vec<u8>> = None;
                for idx in 0..count {
                    let (key, _) = self.tx.leaf_pair(id, idx)?;
                    self.check_order(id, &key, &prev, &lo, &hi, bucket);
                    prev = Some(key);
                }
            }
            PageKind::Branch => {
                if count == 0 {
                    self.finding(format!("{bucket}: branch page {id} has no elements"));
                    return Ok(());
                }
                let mut entries = Vec::with_capacity(count);
                let mut prev: Option<Vec<u8>> = None;
                for idx in 0..count {
                    let (key, child) = self.tx.branch_entry(id, idx)?;
                    self.check_order(id, &key, &prev, &lo, &hi, bucket);
                    prev = Some(key.clone());
                    entries.push((key, child));
                }
                for (idx, (key, child)) in entries.iter().enumerate() {
                    let child_hi = entries
                        .get(idx + 1)
                        .map(|(next_key, _)| next_key.clone())
                        .or_else(|| hi.clone());
                    self.walk(*child, Some(key.clone()), child_hi, bucket)?;
                }
            }
            other => {
                self.finding(format!(
                    "{bucket}: page {id} has kind {other:?}, expected branch or leaf"
                ));
            }
        }
        Ok(())
    }

    fn check_order(
        &mut self,
        id: PageId,
        key: &[u8],
        prev: &Option<Vec<u8>>,
        lo: &Option<Vec<u8>>,
        hi: &Option<Vec<u8>>,
        bucket: &str,
    ) {
        if let Some(prev) = prev {
            if prev.as_slice() >= key {
                self.finding(format!("{bucket}: keys out of order on page {id}"));
            }
        }
        if let Some(lo) = lo {
            if key < lo.as_slice() {
                self.finding(format!("{bucket}: key below parent bound on page {id}"));
            }
        }
        if let Some(hi) = hi {
            if key >= hi.as_slice() {
                self.finding(format!("{bucket}: key above parent bound on page {id}"));
            }
        }
    }
}

/// Run the full consistency check over `tx`'s snapshot.
pub(crate) fn run(tx: &Tx<'_>) -> Result<()> {
    let meta = tx.meta_snapshot();
    let mut checker = Checker {
        tx,
        next_pgid: meta.next_pgid,
        owners: HashMap::new(),
        findings: Vec::new(),
    };

    checker.claim(PageId(0), 1, "meta slot 0");
    checker.claim(PageId(1), 1, "meta slot 1");
    if let Err(err) = checker.claim_spanned(meta.freelist_pgid, "freelist page") {
        checker.finding(format!("freelist page unreadable: {err}"));
    }
    if let Err(err) = checker.claim_spanned(meta.buckets_pgid, "bucket catalog") {
        checker.finding(format!("bucket catalog unreadable: {err}"));
    }

    for (name, root) in tx.bucket_roots() {
        let bucket = format!("bucket {}", String::from_utf8_lossy(&name));
        if let Err(err) = checker.walk(root, None, None, &bucket) {
            checker.finding(format!("{bucket}: walk failed: {err}"));
        }
    }

    match tx.freelist_snapshot_ids() {
        Ok(ids) => {
            for id in ids {
                checker.claim(id, 1, "free set");
            }
        }
        Err(err) => checker.finding(format!("freelist unreadable: {err}")),
    }

    for page in 2..meta.next_pgid.0 {
        if !checker.owners.contains_key(&page) {
            checker.finding(format!("page {page} unreachable and not free"));
        }
    }

    if checker.findings.is_empty() {
        return Ok(());
    }
    for finding in &checker.findings {
        warn!(finding = finding.as_str(), "consistency check failed");
    }
    Err(BurrowError::Corruption(checker.findings.join("; ")))
}
