use std::fmt;

/// Identifier of a fixed-size page inside the database file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u64);

/// Monotonically increasing transaction identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TxId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Marker bytes identifying a database file.
pub const MAGIC: u32 = 0xDEAD_C0DE;

/// On-disk format version understood by this build.
pub const FORMAT_VERSION: u32 = 1;

/// Smallest supported page size; also the probe size used when opening a
/// file whose page size is not yet known.
pub const MIN_PAGE_SIZE: usize = 4096;

/// Maximum length of a bucket name in bytes.
pub const MAX_BUCKET_NAME_SIZE: usize = 255;

/// Maximum length of a key in bytes.
pub const MAX_KEY_SIZE: usize = 32768;

/// Maximum length of a value in bytes.
pub const MAX_VALUE_SIZE: usize = u32::MAX as usize;

/// Minimum number of entries on a non-root branch or leaf page.
pub const MIN_KEYS_PER_PAGE: usize = 2;
