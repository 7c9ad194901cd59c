mod cursor;
mod index;
mod source;
mod stats;

pub use cursor::MemoryCursor;
pub use index::IndexInfo;
pub use source::MemorySource;
pub use stats::SourceStats;
