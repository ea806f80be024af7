//! Domain types shared by collectors, the staging cache and the materializer.

mod entity;
mod record;
mod timestamp;

pub use entity::EntityKey;
pub use ferromerge_warehouse::SourceType;
pub use record::{CacheKey, SourceRecord};
pub use timestamp::{normalize_date, UtcDateTime};
