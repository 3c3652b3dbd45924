//! Reconciles the tag index with what is actually stored in the chunks.
//!
//! Runs after the index and controller are up. Journals whose sidecar
//! matches their chunk files are seeded from the sidecar; anything else
//! is walked record by record, which both repopulates the index and
//! rewrites the sidecar. This is the recovery path after a crash, since
//! the persisted index state is only a checkpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::codec::LogEvent;
use crate::config::RecordId;
use crate::error::Result;
use crate::index::TagIndex;
use crate::tags::TagLine;

use super::controller::Controller;
use super::iterator::JournalIterator;
use super::journal::{ChunkMeta, Journal, JournalMeta};
use super::reader::JournalReader;

/// Synchronizes every journal known to the controller.
pub async fn sync_journals(ctrl: &Controller) -> Result<()> {
    let jids = ctrl.journal_list();
    info!(journals = jids.len(), "chunk synchronizer running");
    for jid in &jids {
        match ctrl.journal(jid).await {
            Ok(journal) => {
                if let Err(err) = sync_one(ctrl.index(), &journal, ctrl) {
                    warn!(journal = %jid, %err, "journal synchronization failed");
                }
            }
            Err(err) => warn!(journal = %jid, %err, "cannot open journal for synchronization"),
        }
    }
    info!("chunk synchronizer done");
    Ok(())
}

/// Synchronizes one journal into the index.
pub(crate) fn sync_one(
    index: &Arc<TagIndex>,
    journal: &Arc<Journal>,
    ctrl: &Controller,
) -> Result<()> {
    if journal.is_meta_consistent()? {
        seed_from_meta(index, journal)?;
        return Ok(());
    }
    warn!(journal = journal.id(), "sidecar is inconsistent, walking the chunks");
    rebuild_from_chunks(index, journal, ctrl)
}

/// Fast path: the sidecar matches the chunk files, its tag sets and last
/// records go straight into the index.
fn seed_from_meta(index: &Arc<TagIndex>, journal: &Arc<Journal>) -> Result<()> {
    let meta = journal.meta_snapshot();
    for cm in meta.chunks.values() {
        for line in &cm.tags {
            let tags = index.upsert_tags(line)?;
            index.on_records(tags.gid(), journal.id(), cm.last_record)?;
        }
    }
    Ok(())
}

/// Slow path: decode every record, track tag-line runs, and rebuild both
/// the index entries and the sidecar.
fn rebuild_from_chunks(
    index: &Arc<TagIndex>,
    journal: &Arc<Journal>,
    ctrl: &Controller,
) -> Result<()> {
    let reader = JournalReader::new(journal.clone(), ctrl.pool().clone());
    let mut it = JournalIterator::new(journal.id().to_string(), reader);

    let mut new_meta = JournalMeta::default();
    let mut cur_chunk: Option<u32> = None;
    // run state: the tag line in effect and the last record it covered
    let mut cur_tag = TagLine::default();
    let mut last_rec = RecordId::MIN;
    // per-chunk accumulation of run ends
    let mut runs: BTreeMap<TagLine, RecordId> = BTreeMap::new();
    let mut records = 0u64;

    let mut ev = LogEvent::default();
    while !it.end() {
        it.get(&mut ev)?;
        let rid = it.pos();

        if cur_chunk.is_some() && cur_chunk != Some(rid.chunk_id) {
            // the chunk ended: close the open run and flush
            if !cur_tag.is_empty() {
                runs.insert(cur_tag.clone(), last_rec);
            }
            flush_chunk(
                index,
                journal,
                &mut new_meta,
                cur_chunk.unwrap(),
                last_rec,
                &mut runs,
            )?;
        }
        cur_chunk = Some(rid.chunk_id);

        if !ev.tag_line.is_empty() {
            // a declared tag line begins a new run
            if !cur_tag.is_empty() {
                runs.insert(cur_tag.clone(), last_rec);
            }
            cur_tag = TagLine::from(ev.tag_line_str().as_ref());
        }

        last_rec = rid;
        records += 1;
        it.next();
    }

    if let Some(cid) = cur_chunk {
        if !cur_tag.is_empty() {
            runs.insert(cur_tag.clone(), last_rec);
        }
        flush_chunk(index, journal, &mut new_meta, cid, last_rec, &mut runs)?;
    }
    it.close();

    journal.replace_meta(new_meta);
    journal.save_meta()?;
    info!(
        journal = journal.id(),
        records, "index entries rebuilt from chunks"
    );
    Ok(())
}

fn flush_chunk(
    index: &Arc<TagIndex>,
    journal: &Arc<Journal>,
    meta: &mut JournalMeta,
    chunk_id: u32,
    chunk_last: RecordId,
    runs: &mut BTreeMap<TagLine, RecordId>,
) -> Result<()> {
    let mut cm = ChunkMeta {
        last_record: chunk_last,
        tags: Default::default(),
    };
    for (line, rid) in runs.iter() {
        let tags = index.upsert_tags(line)?;
        index.on_records(tags.gid(), journal.id(), *rid)?;
        cm.tags.insert(line.clone());
    }
    meta.chunks.insert(chunk_id, cm);
    runs.clear();
    Ok(())
}
