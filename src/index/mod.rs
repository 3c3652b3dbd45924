//! Persistent mapping between tag lines, synthetic group ids and the
//! journal chunks where each group appears.
//!
//! The index is consulted during query planning to pre-select journals
//! and pruned when chunks are rotated out. Its persisted form,
//! `tidx.state`, is only a cache: the chunk synchronizer can rebuild the
//! whole index from the journals themselves.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RecordId;
use crate::error::{Error, Result};
use crate::idgen::next_id64;
use crate::tags::{TagLine, Tags};

pub const STATE_FILE_NAME: &str = "tidx.state";

/// Per-chunk state of one tag group: the last record of the group known
/// to live in the chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDesc {
    #[serde(rename = "lastRecord")]
    pub last_record: RecordId,
}

/// Everything the index knows about one tag group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagsDesc {
    pub tags: Tags,
    pub journals: HashMap<String, HashMap<u32, ChunkDesc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexState {
    #[serde(rename = "tagLines")]
    tag_lines: HashMap<TagLine, i64>,
    #[serde(rename = "tagTable")]
    tag_table: HashMap<i64, TagsDesc>,
}

pub struct TagIndex {
    state_file: PathBuf,
    state: Mutex<IndexState>,
}

impl TagIndex {
    /// Creates the index, loading `tidx.state` from `dir` when present.
    /// An absent or unreadable state file yields an empty index; the chunk
    /// synchronizer repopulates it.
    pub fn open(dir: &Path) -> TagIndex {
        let state_file = dir.join(STATE_FILE_NAME);
        let state = match std::fs::read(&state_file) {
            Ok(raw) => match serde_json::from_slice::<IndexState>(&raw) {
                Ok(state) => {
                    info!(
                        tag_lines = state.tag_lines.len(),
                        groups = state.tag_table.len(),
                        "tag index state loaded"
                    );
                    state
                }
                Err(err) => {
                    warn!(file = %state_file.display(), %err, "cannot decode tag index state, starting empty");
                    IndexState::default()
                }
            },
            Err(_) => {
                info!(file = %state_file.display(), "no tag index state file, starting empty");
                IndexState::default()
            }
        };
        TagIndex {
            state_file,
            state: Mutex::new(state),
        }
    }

    /// Returns the tags for the line, creating a new group with a fresh id
    /// on first sight. The line is parsed strictly, so a malformed line is
    /// rejected here rather than written anywhere.
    pub fn upsert_tags(&self, line: &TagLine) -> Result<Tags> {
        let mut state = self.state.lock();
        if let Some(gid) = state.tag_lines.get(line) {
            let gid = *gid;
            return Ok(state
                .tag_table
                .get(&gid)
                .expect("tag_lines and tag_table agree")
                .tags
                .clone());
        }

        let gid = next_id64();
        let tags = line.new_tags(gid)?;
        debug!(%gid, %line, "new tag group");
        state.tag_lines.insert(line.clone(), gid);
        state.tag_table.insert(
            gid,
            TagsDesc {
                tags: tags.clone(),
                journals: HashMap::new(),
            },
        );
        Ok(tags)
    }

    /// Notes the last record written for the group in the given journal
    /// chunk, creating intermediate entries as needed.
    pub fn on_records(&self, gid: i64, journal: &str, last: RecordId) -> Result<()> {
        let mut state = self.state.lock();
        let desc = state
            .tag_table
            .get_mut(&gid)
            .ok_or_else(|| Error::not_found(format!("tag group {gid}")))?;
        let chunks = desc.journals.entry(journal.to_string()).or_default();
        chunks.entry(last.chunk_id).or_default().last_record = last;
        Ok(())
    }

    /// Prunes the chunk from every group; a group with no remaining chunks
    /// is dropped entirely.
    pub fn on_delete(&self, journal: &str, chunk_id: u32) {
        let mut state = self.state.lock();
        let mut emptied = Vec::new();
        for (gid, desc) in state.tag_table.iter_mut() {
            if let Some(chunks) = desc.journals.get_mut(journal) {
                if chunks.remove(&chunk_id).is_some() && chunks.is_empty() {
                    desc.journals.remove(journal);
                }
            }
            if desc.journals.is_empty() {
                emptied.push(*gid);
            }
        }
        for gid in emptied {
            if let Some(desc) = state.tag_table.remove(&gid) {
                debug!(%gid, line = %desc.tags.line(), "dropping tag group, no chunks reference it");
                state.tag_lines.remove(desc.tags.line());
            }
        }
    }

    /// All journals referenced by any group, sorted.
    pub fn get_all_journals(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut set: Vec<String> = state
            .tag_table
            .values()
            .flat_map(|d| d.journals.keys().cloned())
            .collect();
        set.sort_unstable();
        set.dedup();
        set
    }

    pub fn get_tags_desc(&self, gid: i64) -> Option<TagsDesc> {
        self.state.lock().tag_table.get(&gid).cloned()
    }

    /// Visits every group until the visitor returns false.
    pub fn visit<F>(&self, mut visitor: F)
    where
        F: FnMut(&TagsDesc) -> bool,
    {
        let state = self.state.lock();
        for desc in state.tag_table.values() {
            if !visitor(desc) {
                return;
            }
        }
    }

    /// Spawns a task that checkpoints the state file every `period` until
    /// the token fires. The shutdown save still runs; this only narrows
    /// the window the synchronizer has to cover after a crash.
    pub fn start_checkpoint_loop(
        self: std::sync::Arc<Self>,
        period: std::time::Duration,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = cancel.cancelled() => return,
                }
                if let Err(err) = self.save() {
                    warn!(%err, "tag index checkpoint failed");
                }
            }
        });
    }

    /// Writes the state file. Called at shutdown; the synchronizer covers
    /// crashes in between.
    pub fn save(&self) -> Result<()> {
        let data = {
            let state = self.state.lock();
            serde_json::to_vec(&*state)
                .map_err(|err| Error::corruption(format!("cannot encode tag index state: {err}")))?
        };
        std::fs::write(&self.state_file, data)?;
        info!(file = %self.state_file.display(), "tag index state saved");
        Ok(())
    }
}
