//! # Kplr
//!
//! The server-side engine of a log aggregation system. Agents ship log
//! lines over a binary protocol; this crate persists them into per-source
//! append-only journals, indexes their tags, and serves ordered, filtered
//! reads through cursors driven by a small query language (KQL).
//!
//! ## Pieces
//!
//! - [`journal::Controller`]: owns the journals, routes writes, rotates
//!   oldest chunks out by size
//! - [`index::TagIndex`]: maps tag lines to synthetic groups and groups to
//!   the chunks holding them, used to pre-select journals for a query
//! - [`kql`]: query compilation into a journal filter and a record filter
//! - [`cursor::Cursor`]: ordered merge over one or more journals with a
//!   streaming, optionally blocking reader
//! - [`journal::sync_journals`]: rebuilds the index from the chunks after
//!   a crash
//!
//! ## A minimal flow
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kplr::{Config, Controller, TagIndex, TagLine, WritePacket};
//!
//! # async fn demo() -> kplr::Result<()> {
//! let cfg = Config::default();
//! let index = Arc::new(TagIndex::open(&cfg.journals_dir));
//! let ctrl = Controller::new(cfg, index.clone())?;
//! kplr::journal::sync_journals(&ctrl).await?;
//! ctrl.start_rotation();
//!
//! let mut packet = WritePacket::assemble(
//!     "svc-a",
//!     &TagLine::from("|env=prod|"),
//!     &[(1, b"hello".as_slice())],
//! )?;
//! ctrl.write(&mut packet).await?;
//!
//! let query = Arc::new(kplr::kql::compile("SELECT WHERE env=prod LIMIT 10", &index)?);
//! let cursor = ctrl.cursor_for_query("cur-1", &query).await?;
//! let mut reader = cursor.into_reader(query.limit(), false);
//! let data = reader.read_to_end().await?;
//! # let _ = data;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod cursor;
pub mod error;
pub mod idgen;
pub mod index;
pub mod journal;
pub mod kql;
pub mod pool;
pub mod stream;
pub mod tags;
pub mod wire;

pub use codec::LogEvent;
pub use config::{Config, RecordId};
pub use cursor::{Cursor, CursorPosition, CursorReader, CursorRegistry, CursorSettings};
pub use error::{Error, Result};
pub use index::TagIndex;
pub use journal::{Controller, JournalInfo, TruncateResult};
pub use kql::Query;
pub use tags::{TagLine, TagMap, Tags};
pub use wire::WritePacket;
