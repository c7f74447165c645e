//! Client-local cookie files: resolved meta entries persisted across client
//! restarts.
//!
//! Cookies are opportunistic. A stale or wrong entry routes one request to
//! the wrong server, which answers `KeyNotInRange`, and the stale-detection
//! path re-fetches; nothing depends on cookie correctness.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::meta::TabletMeta;

#[derive(Debug, Serialize, Deserialize)]
struct CookieFile {
    table: String,
    dumped_at_ms: u64,
    entries: Vec<TabletMeta>,
}

/// `<table>-<createtime>-<clusterhash>` under the cookie directory.
pub fn cookie_path(dir: &Path, table: &str, create_time_ms: u64, cluster_id: &str) -> PathBuf {
    let mut hasher = DefaultHasher::new();
    cluster_id.hash(&mut hasher);
    dir.join(format!("{table}-{create_time_ms}-{:08x}", hasher.finish() as u32))
}

/// Atomically (write + rename) dump resolved entries.
pub fn dump_cookie(path: &Path, table: &str, entries: Vec<TabletMeta>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("create cookie dir")?;
    }
    let file = CookieFile {
        table: table.to_string(),
        dumped_at_ms: crate::unix_time_ms(),
        entries,
    };
    let data = serde_json::to_vec(&file).context("serialize cookie")?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data).context("write cookie tmp")?;
    std::fs::rename(&tmp, path).context("rename cookie")?;
    Ok(())
}

/// Restore entries; a missing or undecodable file restores nothing.
pub fn restore_cookie(path: &Path, table: &str) -> Vec<TabletMeta> {
    let Ok(data) = std::fs::read(path) else {
        return Vec::new();
    };
    match serde_json::from_slice::<CookieFile>(&data) {
        Ok(file) if file.table == table => file.entries,
        Ok(_) => {
            tracing::warn!(path = %path.display(), "cookie belongs to another table");
            Vec::new()
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "cookie decode failed");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{KeyRange, TabletStatus};

    fn entry(start: &[u8], end: &[u8]) -> TabletMeta {
        TabletMeta {
            table_name: "t".into(),
            path: "t/tablet00000001".into(),
            key_range: KeyRange::new(start, end),
            server_addr: "ts1:1".into(),
            status: TabletStatus::Ready,
            ..Default::default()
        }
    }

    #[test]
    fn dump_and_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = cookie_path(dir.path(), "t", 123, "cluster-a");
        let entries = vec![entry(b"", b"m"), entry(b"m", b"")];
        dump_cookie(&path, "t", entries.clone()).unwrap();
        assert_eq!(restore_cookie(&path, "t"), entries);
    }

    #[test]
    fn corrupt_cookie_restores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = cookie_path(dir.path(), "t", 123, "cluster-a");
        std::fs::write(&path, b"not json").unwrap();
        assert!(restore_cookie(&path, "t").is_empty());
        // Wrong table name is rejected too.
        dump_cookie(&path, "other", vec![entry(b"", b"")]).unwrap();
        assert!(restore_cookie(&path, "t").is_empty());
    }

    #[test]
    fn path_separates_clusters() {
        let dir = tempfile::tempdir().unwrap();
        assert_ne!(
            cookie_path(dir.path(), "t", 1, "a"),
            cookie_path(dir.path(), "t", 1, "b")
        );
    }
}
