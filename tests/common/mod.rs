use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use kplr::{Config, Controller, TagIndex, TagLine, WritePacket};

/// Small sizes and short periods suitable for tests.
pub fn test_config(dir: &TempDir) -> Config {
    Config {
        journals_dir: dir.path().to_path_buf(),
        max_chunk_size: 64 * 1024,
        max_journal_size: 1024 * 1024,
        rotation_period: Duration::from_millis(200),
        cursor_ttl: Duration::from_millis(300),
        ..Config::default()
    }
}

pub fn setup(dir: &TempDir) -> (Controller, Arc<TagIndex>) {
    let cfg = test_config(dir);
    let index = Arc::new(TagIndex::open(dir.path()));
    let ctrl = Controller::new(cfg, index.clone()).expect("controller");
    (ctrl, index)
}

pub async fn write_lines(ctrl: &Controller, jid: &str, tag_line: &str, recs: &[(i64, &str)]) {
    let events: Vec<(i64, &[u8])> = recs.iter().map(|(ts, m)| (*ts, m.as_bytes())).collect();
    let mut packet = WritePacket::assemble(jid, &TagLine::from(tag_line), &events).expect("packet");
    ctrl.write(&mut packet).await.expect("write");
}
