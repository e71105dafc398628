//! Record Fetcher: paginated, filtered reads from the system of record.
//!
//! - `traits` defines the `RecordSource` seam and the `RecordQuery` filter set
//! - `fetcher` resolves owners and drives cursor pagination under a hard cap
//! - `normalize` turns raw source payloads into normalized `Record`s

pub mod fetcher;
pub mod normalize;
pub mod traits;

pub use fetcher::{fetch_all, resolve_owner_id};
pub use traits::{fetch, RecordPage, RecordQuery, RecordSource};
