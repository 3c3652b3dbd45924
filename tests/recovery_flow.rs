//! Restart and recovery: index rebuilds from chunks, torn tails, and
//! size-based rotation.

mod common;

use std::sync::Arc;

use tempfile::TempDir;
use tokio::runtime::Runtime;

use kplr::journal::sync_journals;
use kplr::{kql, Controller, TagIndex};

use common::{setup, test_config, write_lines};

fn line_count(data: &[u8]) -> usize {
    data.split(|b| *b == b'\n').filter(|l| !l.is_empty()).count()
}

#[test]
fn index_rebuilds_from_chunks_after_a_crash() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let dir = TempDir::new().unwrap();
        {
            let (ctrl, _index) = setup(&dir);
            let recs: Vec<(i64, String)> = (0..100).map(|i| (i as i64 + 1, format!("r{i}"))).collect();
            let refs: Vec<(i64, &str)> = recs.iter().map(|(ts, m)| (*ts, m.as_str())).collect();
            write_lines(&ctrl, "ja", "|env=prod|svc=api|", &refs).await;
            ctrl.shutdown();
            // the index checkpoint never happened and the sidecar is gone,
            // which is what an unclean kill leaves behind
            std::fs::remove_file(dir.path().join("ja/ja/journal.meta")).unwrap();
        }

        let (ctrl, index) = setup(&dir);
        assert_eq!(ctrl.journal_list(), vec!["ja".to_string()]);
        sync_journals(&ctrl).await.unwrap();

        let query = Arc::new(kql::compile("SELECT LIMIT 1000", &index).unwrap());
        assert_eq!(query.sources(), &["ja".to_string()]);
        let cursor = ctrl.cursor_for_query("rebuilt", &query).await.unwrap();
        let mut reader = cursor.into_reader(query.limit(), false);
        let data = reader.read_to_end().await.unwrap();
        assert_eq!(line_count(&data), 100);

        // the rebuild also restored the sidecar
        let info = ctrl.journal_info("ja").await.unwrap();
        assert_eq!(info.tags, vec![kplr::TagLine::from("|env=prod|svc=api|")]);
        ctrl.shutdown();
    });
}

#[test]
fn consistent_sidecar_seeds_the_index_without_a_walk() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let dir = TempDir::new().unwrap();
        {
            let (ctrl, _index) = setup(&dir);
            write_lines(&ctrl, "jb", "|env=dev|", &[(1, "m1"), (2, "m2")]).await;
            // clean shutdown persists journal.meta but the index state is
            // deliberately not checkpointed
            ctrl.shutdown();
        }

        let (ctrl, index) = setup(&dir);
        sync_journals(&ctrl).await.unwrap();

        let query = Arc::new(kql::compile("SELECT WHERE env=dev LIMIT 10", &index).unwrap());
        assert_eq!(query.sources(), &["jb".to_string()]);
        ctrl.shutdown();
    });
}

#[test]
fn torn_tail_is_dropped_on_restart() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let dir = TempDir::new().unwrap();
        {
            let (ctrl, _index) = setup(&dir);
            write_lines(&ctrl, "jc", "|env=prod|", &[(1, "m1"), (2, "m2"), (3, "m3")]).await;
            ctrl.shutdown();
        }
        // tear the last record
        let chunk = dir.path().join("jc/jc/0000000001.dat");
        let len = std::fs::metadata(&chunk).unwrap().len();
        let f = std::fs::OpenOptions::new().write(true).open(&chunk).unwrap();
        f.set_len(len - 3).unwrap();
        drop(f);

        let (ctrl, index) = setup(&dir);
        sync_journals(&ctrl).await.unwrap();

        let query = Arc::new(kql::compile("SELECT LIMIT 10", &index).unwrap());
        let cursor = ctrl.cursor_for_query("after-tear", &query).await.unwrap();
        let mut reader = cursor.into_reader(query.limit(), false);
        let data = String::from_utf8(reader.read_to_end().await.unwrap()).unwrap();
        assert_eq!(data, "m1\nm2\n");
        ctrl.shutdown();
    });
}

#[test]
fn rotation_keeps_journals_under_their_cap() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(&dir);
        cfg.max_journal_size = 150 * 1024;
        let index = Arc::new(TagIndex::open(dir.path()));
        let ctrl = Controller::new(cfg, index.clone()).unwrap();

        // roughly four 64 KiB chunks worth of data
        let payload = "x".repeat(30 * 1024);
        for i in 0..8 {
            write_lines(&ctrl, "jr", "|env=prod|", &[(i, payload.as_str())]).await;
        }
        let before = ctrl.journal_info("jr").await.unwrap();
        assert!(before.size > 150 * 1024);

        ctrl.start_rotation();
        tokio::time::sleep(std::time::Duration::from_millis(600)).await;

        let after = ctrl.journal_info("jr").await.unwrap();
        assert!(
            after.size <= 150 * 1024,
            "size {} still above the cap",
            after.size
        );
        assert!(after.chunks < before.chunks);
        ctrl.shutdown();
    });
}

#[test]
fn checkpoint_loop_writes_the_index_state() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let dir = TempDir::new().unwrap();
        let (ctrl, index) = setup(&dir);
        write_lines(&ctrl, "jp", "|env=prod|", &[(1, "m1")]).await;

        let cancel = tokio_util::sync::CancellationToken::new();
        index
            .clone()
            .start_checkpoint_loop(std::time::Duration::from_millis(50), cancel.clone());
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        cancel.cancel();

        let state = dir.path().join("tidx.state");
        assert!(state.exists(), "the checkpoint loop persists tidx.state");
        // a fresh index picks the checkpoint up without a walk
        let reloaded = TagIndex::open(dir.path());
        assert_eq!(reloaded.get_all_journals(), vec!["jp".to_string()]);
        ctrl.shutdown();
    });
}

#[test]
fn truncation_prunes_the_index() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let dir = TempDir::new().unwrap();
        let (ctrl, index) = setup(&dir);

        let payload = "y".repeat(60 * 1024);
        // two chunks, each holding one record of its own tag group
        write_lines(&ctrl, "jt", "|gen=old|", &[(1, payload.as_str())]).await;
        write_lines(&ctrl, "jt", "|gen=new|", &[(2, payload.as_str())]).await;
        assert_eq!(ctrl.journal_info("jt").await.unwrap().chunks, 2);

        let res = ctrl.truncate("jt", 70 * 1024).await.unwrap();
        assert_eq!(res.chunks_removed, 1);

        // the old generation lost its only chunk, so its group is gone
        let query = Arc::new(kql::compile("SELECT WHERE gen=old LIMIT 10", &index).unwrap());
        assert!(query.sources().is_empty());
        let query = Arc::new(kql::compile("SELECT WHERE gen=new LIMIT 10", &index).unwrap());
        assert_eq!(query.sources(), &["jt".to_string()]);
        ctrl.shutdown();
    });
}
