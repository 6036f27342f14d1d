//! In-memory form of a branch or leaf page.
//!
//! Writers never mutate mapped bytes: a page touched by a mutation is
//! decoded into a `Node`, edited, and serialized into freshly allocated
//! pages, while the source page id goes to the freelist. Split and merge
//! arithmetic lives here so the transaction layer only moves nodes around.

use crate::error::{BurrowError, Result};
use crate::page::{
    self, PageHeader, PageKind, BRANCH_ELEMENT_SIZE, LEAF_ELEMENT_SIZE, PAGE_HEADER_SIZE,
};
use crate::types::{PageId, MIN_KEYS_PER_PAGE};

/// One entry of a decoded page: `value` is set on leaves, `pgid` on branches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inode {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub pgid: PageId,
}

impl Inode {
    pub fn leaf(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            pgid: PageId(0),
        }
    }

    pub fn branch(key: Vec<u8>, pgid: PageId) -> Self {
        Self {
            key,
            value: Vec::new(),
            pgid,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Node {
    /// Page the node was decoded from; 0 when the node is fresh.
    pub pgid: PageId,
    pub kind: PageKind,
    pub inodes: Vec<Inode>,
}

impl Node {
    pub fn leaf() -> Self {
        Self {
            pgid: PageId(0),
            kind: PageKind::Leaf,
            inodes: Vec::new(),
        }
    }

    pub fn branch(inodes: Vec<Inode>) -> Self {
        Self {
            pgid: PageId(0),
            kind: PageKind::Branch,
            inodes,
        }
    }

    /// Decode a full page buffer into an owned node.
    pub fn read(buf: &[u8], id: PageId) -> Result<Self> {
        let header = PageHeader::decode(buf)?;
        let count = header.count as usize;
        let mut inodes = Vec::with_capacity(count);
        match header.kind {
            PageKind::Leaf => {
                for idx in 0..count {
                    let (key, value) = page::leaf_element(buf, idx)?;
                    inodes.push(Inode::leaf(key.to_vec(), value.to_vec()));
                }
            }
            PageKind::Branch => {
                for idx in 0..count {
                    let (key, child) = page::branch_element(buf, idx)?;
                    inodes.push(Inode::branch(key.to_vec(), child));
                }
            }
            _ => return Err(BurrowError::corruption("unexpected page kind in tree")),
        }
        Ok(Self {
            pgid: id,
            kind: header.kind,
            inodes,
        })
    }

    fn element_size(&self) -> usize {
        match self.kind {
            PageKind::Leaf => LEAF_ELEMENT_SIZE,
            _ => BRANCH_ELEMENT_SIZE,
        }
    }

    fn inode_size(&self, inode: &Inode) -> usize {
        match self.kind {
            PageKind::Leaf => LEAF_ELEMENT_SIZE + inode.key.len() + inode.value.len(),
            _ => BRANCH_ELEMENT_SIZE + inode.key.len(),
        }
    }

    /// Serialized size including the page header.
    pub fn size(&self) -> usize {
        PAGE_HEADER_SIZE + self.inodes.iter().map(|i| self.inode_size(i)).sum::<usize>()
    }

    /// Physical pages needed for this node.
    pub fn page_count(&self, page_size: usize) -> u64 {
        self.size().div_ceil(page_size) as u64
    }

    /// A non-root node this small must merge with a sibling.
    pub fn underflow(&self, page_size: usize) -> bool {
        self.inodes.len() < MIN_KEYS_PER_PAGE || self.size() < page_size / 4
    }

    /// Split index minimizing the size difference between the halves while
    /// keeping both at or above the minimum fill.
    fn split_index(&self) -> usize {
        let total: usize = self.inodes.iter().map(|i| self.inode_size(i)).sum();
        let mut left = 0usize;
        let mut best = MIN_KEYS_PER_PAGE;
        let mut best_diff = usize::MAX;
        for (idx, inode) in self.inodes.iter().enumerate() {
            left += self.inode_size(inode);
            let split = idx + 1;
            if split < MIN_KEYS_PER_PAGE {
                continue;
            }
            if split > self.inodes.len() - MIN_KEYS_PER_PAGE {
                break;
            }
            let diff = left.abs_diff(total - left);
            if diff < best_diff {
                best_diff = diff;
                best = split;
            }
        }
        best
    }

    /// Split into pieces that each fit one page where the entry count
    /// permits; a piece too small to split spans overflow pages instead.
    pub fn split(self, page_size: usize) -> Vec<Node> {
        if self.size() <= page_size || self.inodes.len() < 2 * MIN_KEYS_PER_PAGE {
            return vec![self];
        }
        let at = self.split_index();
        let mut left = self;
        let right_inodes = left.inodes.split_off(at);
        let right = Node {
            pgid: PageId(0),
            kind: left.kind,
            inodes: right_inodes,
        };
        left.pgid = PageId(0);
        let mut parts = left.split(page_size);
        parts.extend(right.split(page_size));
        parts
    }

    /// Serialize into `buf` as page `id`; the buffer must already span
    /// `page_count` physical pages.
    pub fn write(&self, buf: &mut [u8], id: PageId, page_size: usize) -> Result<()> {
        let count = u16::try_from(self.inodes.len())
            .map_err(|_| BurrowError::corruption("too many entries for one page"))?;
        let span = self.page_count(page_size);
        if buf.len() < (span as usize) * page_size {
            return Err(BurrowError::corruption("node buffer too small"));
        }
        buf.fill(0);
        PageHeader::new(id, self.kind, count, (span - 1) as u32).encode(buf)?;

        let elem_size = self.element_size();
        let mut payload_off = PAGE_HEADER_SIZE + self.inodes.len() * elem_size;
        for (idx, inode) in self.inodes.iter().enumerate() {
            let elem_off = PAGE_HEADER_SIZE + idx * elem_size;
            let pos = u32::try_from(payload_off - elem_off)
                .map_err(|_| BurrowError::corruption("element offset exceeds u32"))?;
            let ksize = u32::try_from(inode.key.len())
                .map_err(|_| BurrowError::corruption("key length exceeds u32"))?;
            match self.kind {
                PageKind::Leaf => {
                    let vsize = u32::try_from(inode.value.len())
                        .map_err(|_| BurrowError::corruption("value length exceeds u32"))?;
                    page::write_leaf_element(buf, idx, pos, ksize, vsize);
                    buf[payload_off..payload_off + inode.key.len()].copy_from_slice(&inode.key);
                    payload_off += inode.key.len();
                    buf[payload_off..payload_off + inode.value.len()]
                        .copy_from_slice(&inode.value);
                    payload_off += inode.value.len();
                }
                _ => {
                    page::write_branch_element(buf, idx, pos, ksize, inode.pgid);
                    buf[payload_off..payload_off + inode.key.len()].copy_from_slice(&inode.key);
                    payload_off += inode.key.len();
                }
            }
        }
        Ok(())
    }

    /// First key, used as the separator for this node in its parent.
    pub fn first_key(&self) -> Vec<u8> {
        self.inodes.first().map(|i| i.key.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_with(pairs: &[(&[u8], &[u8])]) -> Node {
        let mut node = Node::leaf();
        for (k, v) in pairs {
            node.inodes.push(Inode::leaf(k.to_vec(), v.to_vec()));
        }
        node
    }

    #[test]
    fn leaf_roundtrip() {
        let node = leaf_with(&[(b"alpha", b"1"), (b"beta", b"2"), (b"gamma", b"3")]);
        let mut buf = vec![0u8; 4096];
        node.write(&mut buf, PageId(11), 4096).unwrap();

        let read = Node::read(&buf, PageId(11)).unwrap();
        assert_eq!(read.kind, PageKind::Leaf);
        assert_eq!(read.inodes, node.inodes);
        assert_eq!(read.pgid, PageId(11));
    }

    #[test]
    fn branch_roundtrip() {
        let node = Node::branch(vec![
            Inode::branch(b"a".to_vec(), PageId(4)),
            Inode::branch(b"m".to_vec(), PageId(5)),
        ]);
        let mut buf = vec![0u8; 4096];
        node.write(&mut buf, PageId(12), 4096).unwrap();

        let read = Node::read(&buf, PageId(12)).unwrap();
        assert_eq!(read.kind, PageKind::Branch);
        assert_eq!(read.inodes, node.inodes);
    }

    #[test]
    fn oversized_entry_spans_overflow_pages() {
        let value = vec![0xABu8; 10_000];
        let node = leaf_with(&[(b"big", &value)]);
        assert_eq!(node.page_count(4096), 3);

        let parts = node.clone().split(4096);
        assert_eq!(parts.len(), 1, "single entry cannot split");

        let mut buf = vec![0u8; 3 * 4096];
        node.write(&mut buf, PageId(20), 4096).unwrap();
        let header = PageHeader::decode(&buf).unwrap();
        assert_eq!(header.overflow, 2);
        let read = Node::read(&buf, PageId(20)).unwrap();
        assert_eq!(read.inodes[0].value, value);
    }

    #[test]
    fn split_balances_sizes_and_keeps_minimum_fill() {
        let value = vec![0u8; 400];
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0..20)
            .map(|i| (format!("key-{i:02}").into_bytes(), value.clone()))
            .collect();
        let mut node = Node::leaf();
        for (k, v) in &pairs {
            node.inodes.push(Inode::leaf(k.clone(), v.clone()));
        }
        assert!(node.size() > 4096);

        let parts = node.split(4096);
        assert!(parts.len() >= 2);
        let total: usize = parts.iter().map(|p| p.inodes.len()).sum();
        assert_eq!(total, 20);
        for part in &parts {
            assert!(part.inodes.len() >= MIN_KEYS_PER_PAGE);
            assert!(part.size() <= 4096);
        }
    }

    #[test]
    fn underflow_thresholds() {
        let small = leaf_with(&[(b"a", b"1")]);
        assert!(small.underflow(4096), "below minimum entry count");

        let two = leaf_with(&[(b"a", b"1"), (b"b", b"2")]);
        assert!(two.underflow(4096), "below the low-water size");

        let value = vec![0u8; 600];
        let filled = leaf_with(&[(b"a", &value), (b"b", &value)]);
        assert!(!filled.underflow(4096));
    }

    #[test]
    fn read_rejects_non_tree_pages() {
        let mut buf = vec![0u8; 4096];
        PageHeader::new(PageId(2), PageKind::Freelist, 0, 0)
            .encode(&mut buf)
            .unwrap();
        assert!(matches!(
            Node::read(&buf, PageId(2)),
            Err(BurrowError::Corruption(_))
        ));
    }
}
