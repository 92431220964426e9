mod bucket;
pub mod byte_store;
pub mod error;
pub mod layout;
pub mod map;
mod store;

pub use bucket::TABLE_SIZE;
pub use byte_store::{ByteStore, MMapFile};
pub use error::{LinHashError, Result};
pub use layout::Options;
pub use map::LinHashMap;
