//! Durable signature index
//!
//! - `store` - JSON file layout, load/reset rules, atomic save
//! - `index` - in-memory forward and reverse maps over the store

mod index;
mod store;

pub use index::{IndexStats, IndexView, Observation, SignatureIndex, SignatureRecord};
pub use store::{SignatureFile, StoredSignature};
