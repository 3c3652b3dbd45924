//! Append-only chunked journals and their controller.

mod chunk;
mod controller;
mod iterator;
#[allow(clippy::module_inception)]
mod journal;
mod reader;
mod sync;

pub use controller::{Controller, JournalInfo, TruncateResult};
pub use iterator::JournalIterator;
pub use journal::{ChunkMeta, Journal, JournalMeta};
pub use reader::JournalReader;
pub use sync::sync_journals;
