//! End-to-end flows through the write path, query compilation and
//! cursor reads.

mod common;

use std::sync::Arc;

use tempfile::TempDir;
use tokio::runtime::Runtime;

use kplr::{kql, Error};

use common::{setup, write_lines};

#[test]
fn tagged_records_come_back_in_append_order() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let dir = TempDir::new().unwrap();
        let (ctrl, index) = setup(&dir);

        write_lines(
            &ctrl,
            "svcA",
            "|env=prod|svc=api|",
            &[(1, "one"), (2, "two"), (3, "three")],
        )
        .await;

        let query = Arc::new(kql::compile("SELECT WHERE env=prod LIMIT 10", &index).unwrap());
        assert_eq!(query.sources(), &["svcA".to_string()]);

        let cursor = ctrl.cursor_for_query("c1", &query).await.unwrap();
        let mut reader = cursor.into_reader(query.limit(), false);
        let data = reader.read_to_end().await.unwrap();
        assert_eq!(String::from_utf8(data).unwrap(), "one\ntwo\nthree\n");

        ctrl.shutdown();
    });
}

#[test]
fn non_matching_tags_select_no_journals() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let dir = TempDir::new().unwrap();
        let (ctrl, index) = setup(&dir);

        write_lines(&ctrl, "svcA", "|env=prod|svc=api|", &[(1, "one")]).await;

        let query = Arc::new(kql::compile("SELECT WHERE env=dev LIMIT 10", &index).unwrap());
        assert!(query.sources().is_empty());
        assert!(matches!(
            ctrl.cursor_for_query("c2", &query).await,
            Err(Error::NotFound(_))
        ));

        ctrl.shutdown();
    });
}

#[test]
fn position_tail_returns_the_trailing_records_in_order() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let dir = TempDir::new().unwrap();
        let (ctrl, index) = setup(&dir);

        write_lines(
            &ctrl,
            "svcA",
            "|env=prod|",
            &[(1, "m1"), (2, "m2"), (3, "m3"), (4, "m4"), (5, "m5")],
        )
        .await;

        let query = Arc::new(kql::compile("SELECT POSITION TAIL LIMIT 2", &index).unwrap());
        let cursor = ctrl.cursor_for_query("c3", &query).await.unwrap();
        let mut reader = cursor.into_reader(query.limit(), false);
        let data = reader.read_to_end().await.unwrap();
        assert_eq!(String::from_utf8(data).unwrap(), "m4\nm5\n");

        ctrl.shutdown();
    });
}

#[test]
fn two_journals_merge_by_timestamp() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let dir = TempDir::new().unwrap();
        let (ctrl, index) = setup(&dir);

        write_lines(&ctrl, "j1", "|src=j1|", &[(10, "m10"), (30, "m30")]).await;
        write_lines(&ctrl, "j2", "|src=j2|", &[(20, "m20"), (40, "m40")]).await;

        let query = Arc::new(kql::compile("SELECT FROM j1,j2 LIMIT 10", &index).unwrap());
        let mut sources = query.sources().to_vec();
        sources.sort();
        assert_eq!(sources, vec!["j1".to_string(), "j2".to_string()]);

        let cursor = ctrl.cursor_for_query("c4", &query).await.unwrap();
        let mut reader = cursor.into_reader(query.limit(), false);
        let data = String::from_utf8(reader.read_to_end().await.unwrap()).unwrap();
        assert_eq!(data, "[j1]: m10\n[j2]: m20\n[j1]: m30\n[j2]: m40\n");

        ctrl.shutdown();
    });
}

#[test]
fn offsets_move_the_cursor_both_ways() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let dir = TempDir::new().unwrap();
        let (ctrl, index) = setup(&dir);

        write_lines(
            &ctrl,
            "svcA",
            "|env=prod|",
            &[(1, "m1"), (2, "m2"), (3, "m3"), (4, "m4"), (5, "m5")],
        )
        .await;

        let query = Arc::new(kql::compile("SELECT OFFSET 3 LIMIT 1", &index).unwrap());
        let cursor = ctrl.cursor_for_query("c5", &query).await.unwrap();
        let mut reader = cursor.into_reader(query.limit(), false);
        let data = String::from_utf8(reader.read_to_end().await.unwrap()).unwrap();
        assert_eq!(data, "m4\n");

        // a negative offset walks back from the record about to be served
        let mut cursor = reader.into_cursor();
        cursor.offset(-3);
        let mut reader = cursor.into_reader(2, false);
        let data = String::from_utf8(reader.read_to_end().await.unwrap()).unwrap();
        assert_eq!(data, "m2\nm3\n");

        ctrl.shutdown();
    });
}

#[test]
fn record_level_filters_apply_per_record() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let dir = TempDir::new().unwrap();
        let (ctrl, index) = setup(&dir);

        write_lines(
            &ctrl,
            "svcA",
            "|env=prod|",
            &[(1, "keep one"), (2, "drop"), (3, "keep two")],
        )
        .await;

        let query =
            Arc::new(kql::compile("SELECT WHERE msg PREFIX keep LIMIT 10", &index).unwrap());
        let cursor = ctrl.cursor_for_query("c6", &query).await.unwrap();
        let mut reader = cursor.into_reader(query.limit(), false);
        let data = String::from_utf8(reader.read_to_end().await.unwrap()).unwrap();
        assert_eq!(data, "keep one\nkeep two\n");

        ctrl.shutdown();
    });
}

#[test]
fn format_clause_shapes_the_output() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let dir = TempDir::new().unwrap();
        let (ctrl, index) = setup(&dir);

        write_lines(&ctrl, "svcA", "|env=prod|", &[(1, "hello")]).await;

        let query = Arc::new(
            kql::compile("SELECT FORMAT 'env={env} msg={msg};' LIMIT 10", &index).unwrap(),
        );
        let cursor = ctrl.cursor_for_query("c7", &query).await.unwrap();
        let mut reader = cursor.into_reader(query.limit(), false);
        let data = String::from_utf8(reader.read_to_end().await.unwrap()).unwrap();
        assert_eq!(data, "env=prod msg=hello;");

        ctrl.shutdown();
    });
}

#[test]
fn too_many_sources_is_rejected() {
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let dir = TempDir::new().unwrap();
        let mut cfg = common::test_config(&dir);
        cfg.max_cursor_sources = 1;
        let index = Arc::new(kplr::TagIndex::open(dir.path()));
        let ctrl = kplr::Controller::new(cfg, index.clone()).unwrap();

        write_lines(&ctrl, "j1", "|src=j1|", &[(1, "a")]).await;
        write_lines(&ctrl, "j2", "|src=j2|", &[(2, "b")]).await;

        let query = Arc::new(kql::compile("SELECT LIMIT 10", &index).unwrap());
        assert!(matches!(
            ctrl.cursor_for_query("c8", &query).await,
            Err(Error::TooManySources { selected: 2, limit: 1 })
        ));

        ctrl.shutdown();
    });
}
