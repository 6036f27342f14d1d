//! Embedded single-file B+tree key/value store.
//!
//! A database is one memory-mapped file interpreted as an array of
//! fixed-size pages. Named buckets each back an ordered map from byte key
//! to byte value with their own B+tree. Access is transactional: any
//! number of readers share an immutable snapshot while a single writer
//! builds the next one with copy-on-write pages, published atomically by
//! alternating meta pages. Space is reclaimed through a freelist that
//! holds released pages back until every reader that can still see them
//! has closed.
//!
//! ```no_run
//! use burrow::{Db, Options};
//!
//! # fn main() -> burrow::Result<()> {
//! let db = Db::open("app.db", Options::default())?;
//! db.batch(|tx| {
//!     tx.create_bucket("widgets")?;
//!     tx.bucket("widgets")?.put(b"foo", b"bar")
//! })?;
//! db.view(|tx| {
//!     assert_eq!(tx.bucket("widgets")?.get(b"foo")?.as_deref(), Some(&b"bar"[..]));
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

mod bucket;
mod check;
mod cursor;
mod db;
mod error;
mod freelist;
mod io;
mod meta;
mod node;
mod page;
mod pager;
mod tx;
mod types;

pub use bucket::Bucket;
pub use cursor::Cursor;
pub use db::{Db, Options};
pub use error::{BurrowError, Result};
pub use tx::{Tx, TxState};
pub use types::{PageId, TxId, MAX_BUCKET_NAME_SIZE, MAX_KEY_SIZE, MAX_VALUE_SIZE};
