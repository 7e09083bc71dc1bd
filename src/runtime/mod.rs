//! Runtime support shared by the mapping engine and the transformers.

pub mod context;

pub use context::{ExtractionContext, ELEMENT_KEY, INDEX_KEY};
