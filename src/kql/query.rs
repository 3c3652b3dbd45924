use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::LogEvent;
use crate::error::{Error, Result};
use crate::index::TagIndex;
use crate::stream::FilterFn;
use crate::tags::Tags;

use super::eval::{evaluate, EvalCtx, ExprFunc, IgnoreFlags};
use super::parser::{parse, Select};

/// Cached planning decision for one tag group.
struct TagGroupDesc {
    /// Result of the tag-only predicate for the group.
    keep: bool,
    tags: Arc<Tags>,
}

/// A compiled query.
///
/// Compilation walks the WHERE expression twice: once with record-level
/// operands ignored, which produces the predicate used to pre-select
/// journals through the tag index, and once in full, which produces the
/// per-record filter. The per-group outcome of the tag-only predicate is
/// cached, so the record filter pays the tag check once per group.
pub struct Query {
    sel: Select,
    tag_func: ExprFunc,
    rec_func: ExprFunc,
    group_cache: Mutex<HashMap<i64, Arc<TagGroupDesc>>>,
    sources: Vec<String>,
    index: Arc<TagIndex>,
}

/// Compiles the query text against the tag index and derives the set of
/// journals it can possibly touch.
pub fn compile(text: &str, index: &Arc<TagIndex>) -> Result<Query> {
    let sel = parse(text)?;
    let tag_func = evaluate(sel.where_expr.as_ref(), IgnoreFlags::RECORD_OPERANDS)?;
    let rec_func = evaluate(sel.where_expr.as_ref(), IgnoreFlags::NONE)?;

    let mut query = Query {
        sel,
        tag_func,
        rec_func,
        group_cache: Mutex::new(HashMap::new()),
        sources: Vec::new(),
        index: index.clone(),
    };
    query.sources = query.select_sources();
    Ok(query)
}

impl Query {
    /// Journals the query can possibly touch. The tag-only predicate runs
    /// against every known group; a FROM clause further restricts the
    /// outcome.
    fn select_sources(&self) -> Vec<String> {
        let mut selected: Vec<String> = if self.tag_func.ignore {
            self.index.get_all_journals()
        } else {
            let mut cache = self.group_cache.lock();
            let mut set = std::collections::BTreeSet::new();
            self.index.visit(|desc| {
                let tags = Arc::new(desc.tags.clone());
                let keep = (self.tag_func.f)(&EvalCtx {
                    ts: 0,
                    msg: b"",
                    tags: Some(&tags),
                });
                if keep {
                    set.extend(desc.journals.keys().cloned());
                }
                cache.insert(tags.gid(), Arc::new(TagGroupDesc { keep, tags }));
                true
            });
            set.into_iter().collect()
        };

        if !self.sel.from.is_empty() {
            selected.retain(|j| self.sel.from.iter().any(|f| f == j));
        }
        selected
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Fails when the journal selection exceeds the configured cap.
    pub fn check_source_limit(&self, limit: usize) -> Result<()> {
        if self.sources.len() > limit {
            return Err(Error::TooManySources {
                selected: self.sources.len(),
                limit,
            });
        }
        Ok(())
    }

    pub fn limit(&self) -> i64 {
        self.sel.limit
    }

    pub fn offset(&self) -> i64 {
        self.sel.offset
    }

    pub fn position(&self) -> Option<&str> {
        self.sel.position.as_deref()
    }

    pub fn format(&self) -> Option<&str> {
        self.sel.format.as_deref()
    }

    fn group_desc(&self, gid: i64) -> Option<Arc<TagGroupDesc>> {
        let mut cache = self.group_cache.lock();
        if let Some(desc) = cache.get(&gid) {
            return Some(desc.clone());
        }
        let td = self.index.get_tags_desc(gid)?;
        let tags = Arc::new(td.tags);
        let keep = (self.tag_func.f)(&EvalCtx {
            ts: 0,
            msg: b"",
            tags: Some(&tags),
        });
        let desc = Arc::new(TagGroupDesc { keep, tags });
        cache.insert(gid, desc.clone());
        Some(desc)
    }

    /// Whether the event must be disregarded by the cursor.
    pub fn filter(&self, ev: &LogEvent) -> bool {
        let group = self.group_desc(ev.tgid);

        if let Some(group) = &group {
            if !self.tag_func.ignore && !group.keep {
                return true;
            }
        }

        let tags = group.as_ref().map(|g| g.tags.as_ref());
        let keep = (self.rec_func.f)(&EvalCtx {
            ts: ev.ts,
            msg: &ev.msg,
            tags,
        });
        !keep
    }

    /// The record filter as an installable predicate.
    pub fn filter_fn(self: Arc<Self>) -> FilterFn {
        Arc::new(move |ev: &LogEvent| self.filter(ev))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecordId;
    use crate::tags::TagLine;
    use tempfile::TempDir;

    fn index_with_groups() -> (TempDir, Arc<TagIndex>, i64, i64) {
        let dir = TempDir::new().unwrap();
        let idx = Arc::new(TagIndex::open(dir.path()));
        let prod = idx.upsert_tags(&TagLine::from("|env=prod|svc=api|")).unwrap();
        idx.on_records(prod.gid(), "svc-a", RecordId::new(1, 16)).unwrap();
        let dev = idx.upsert_tags(&TagLine::from("|env=dev|svc=api|")).unwrap();
        idx.on_records(dev.gid(), "svc-b", RecordId::new(1, 16)).unwrap();
        (dir, idx, prod.gid(), dev.gid())
    }

    #[test]
    fn empty_where_selects_all_journals() {
        let (_d, idx, _, _) = index_with_groups();
        let q = compile("SELECT LIMIT 10", &idx).unwrap();
        assert_eq!(q.sources(), &["svc-a".to_string(), "svc-b".to_string()]);
    }

    #[test]
    fn tag_condition_prunes_journals() {
        let (_d, idx, _, _) = index_with_groups();
        let q = compile("SELECT WHERE env=prod LIMIT 10", &idx).unwrap();
        assert_eq!(q.sources(), &["svc-a".to_string()]);

        let q = compile("SELECT WHERE env=staging LIMIT 10", &idx).unwrap();
        assert!(q.sources().is_empty());
    }

    #[test]
    fn record_conditions_do_not_prune_journals() {
        let (_d, idx, _, _) = index_with_groups();
        let q = compile("SELECT WHERE msg CONTAINS x LIMIT 10", &idx).unwrap();
        assert_eq!(q.sources().len(), 2);
    }

    #[test]
    fn from_clause_restricts_selection() {
        let (_d, idx, _, _) = index_with_groups();
        let q = compile("SELECT FROM svc-b LIMIT 10", &idx).unwrap();
        assert_eq!(q.sources(), &["svc-b".to_string()]);

        let q = compile("SELECT FROM svc-b WHERE env=prod LIMIT 10", &idx).unwrap();
        assert!(q.sources().is_empty(), "FROM intersects the tag selection");
    }

    #[test]
    fn source_limit_is_enforced() {
        let (_d, idx, _, _) = index_with_groups();
        let q = compile("SELECT LIMIT 10", &idx).unwrap();
        assert!(q.check_source_limit(2).is_ok());
        assert!(matches!(
            q.check_source_limit(1),
            Err(Error::TooManySources { selected: 2, limit: 1 })
        ));
    }

    #[test]
    fn filter_combines_group_and_record_checks() {
        let (_d, idx, prod_gid, dev_gid) = index_with_groups();
        let q = Arc::new(compile("SELECT WHERE env=prod AND msg CONTAINS keep LIMIT 10", &idx).unwrap());

        let mut ev = LogEvent::new(5, &b"please keep me"[..]);
        ev.tgid = prod_gid;
        assert!(!q.filter(&ev));

        let mut ev = LogEvent::new(5, &b"drop me"[..]);
        ev.tgid = prod_gid;
        assert!(q.filter(&ev));

        let mut ev = LogEvent::new(5, &b"please keep me"[..]);
        ev.tgid = dev_gid;
        assert!(q.filter(&ev), "wrong group is filtered before the record check");
    }

    #[test]
    fn planner_soundness_over_groups() {
        // whenever the tag-only predicate rejects a group, the full
        // predicate rejects every record of that group
        let (_d, idx, prod_gid, dev_gid) = index_with_groups();
        let q = Arc::new(compile("SELECT WHERE env=dev AND ts > 0 LIMIT 10", &idx).unwrap());
        for gid in [prod_gid, dev_gid] {
            let rejected_by_planner = !q.group_desc(gid).unwrap().keep;
            for msg in [&b"a"[..], &b"b"[..]] {
                let mut ev = LogEvent::new(1, msg);
                ev.tgid = gid;
                if rejected_by_planner {
                    assert!(q.filter(&ev));
                }
            }
        }
    }

    #[test]
    fn unknown_group_falls_back_to_empty_tags() {
        let (_d, idx, _, _) = index_with_groups();
        let q = Arc::new(compile("SELECT WHERE env=prod LIMIT 10", &idx).unwrap());
        let mut ev = LogEvent::new(5, &b"x"[..]);
        ev.tgid = 999_999;
        assert!(q.filter(&ev), "unknown group cannot match env=prod");
    }
}
