mod aggregate;
mod error;
mod expression;
mod projection;
mod sort;
mod source;
mod update;
mod values;

pub use error::StoreError;
pub use expression::filter_matches;
pub use source::{
    CountOptions, DataSource, FindAndModifyOptions, FindOptions, ReadPreference, ReturnDocument,
    UpdateResult,
};

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "memory")]
pub use memory::{IndexInfo, MemoryCursor, MemorySource, SourceStats};
