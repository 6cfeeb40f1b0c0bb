pub mod row_cache;
pub mod windows;

pub use row_cache::{CacheLookup, CacheStats, PutOutcome, RowCache};
