//! End-to-end control-plane tests over a single-process cluster: table
//! lifecycle, client routing, split/merge/move, failover, safe mode, and
//! dead-tablet reclamation.

use std::time::Duration;

use strata_store::master::MasterConfig;
use strata_store::meta::{tablet_path, TableSchema, TableStatus};
use strata_store::user_manager::user_token;
use strata_store::{ClusterOptions, EmbeddedCluster, StatusCode};

fn key(i: u64) -> Vec<u8> {
    format!("{i:011}").into_bytes()
}

fn root_token() -> String {
    user_token("root", "root")
}

fn fast_options(dir: &std::path::Path, nodes: usize) -> ClusterOptions {
    let mut options = ClusterOptions::new(dir).with_nodes(nodes);
    options.master = MasterConfig {
        root_dir: dir.to_path_buf(),
        query_interval: Duration::from_millis(100),
        balance_interval: Duration::from_millis(500),
        gc_interval: Duration::from_millis(300),
        availability_interval: Duration::from_millis(200),
        ..Default::default()
    };
    options
}

async fn start_cluster(dir: &std::path::Path, nodes: usize) -> EmbeddedCluster {
    EmbeddedCluster::start(fast_options(dir, nodes))
        .await
        .expect("cluster start")
}

#[tokio::test(flavor = "multi_thread")]
async fn create_write_read_delete_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = start_cluster(dir.path(), 2).await;
    let master = cluster.master();

    master
        .create_table(&root_token(), TableSchema::kv("orders"), vec![])
        .await
        .unwrap();
    assert!(cluster.wait_table_ready("orders", Duration::from_secs(5)).await);

    let client = cluster.client();
    let table = client.open_table("orders").await;
    table.put(b"555", b"value of 555").await.unwrap();
    assert_eq!(
        table.get(b"555").await.unwrap(),
        Some(b"value of 555".to_vec())
    );

    // Overwrite wins.
    table.put(b"555", b"B").await.unwrap();
    assert_eq!(table.get(b"555").await.unwrap(), Some(b"B".to_vec()));

    // Delete then read back NotFound.
    table.delete(b"555").await.unwrap();
    assert_eq!(table.get(b"555").await.unwrap(), None);
    assert_eq!(table.get(b"never-written").await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_table_and_permission_errors() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = start_cluster(dir.path(), 1).await;
    let master = cluster.master();

    master
        .create_table(&root_token(), TableSchema::kv("t"), vec![])
        .await
        .unwrap();
    assert_eq!(
        master
            .create_table(&root_token(), TableSchema::kv("t"), vec![])
            .await
            .unwrap_err(),
        StatusCode::TableExist
    );
    assert_eq!(
        master
            .create_table("bogus-token", TableSchema::kv("t2"), vec![])
            .await
            .unwrap_err(),
        StatusCode::NotPermission
    );
    assert_eq!(
        master
            .disable_table(&root_token(), "missing")
            .await
            .unwrap_err(),
        StatusCode::TableNotFound
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn split_then_merge_restores_the_original_range() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = start_cluster(dir.path(), 2).await;
    let master = cluster.master();
    master
        .create_table(&root_token(), TableSchema::kv("t"), vec![])
        .await
        .unwrap();
    assert!(cluster.wait_table_ready("t", Duration::from_secs(5)).await);

    let client = cluster.client();
    let table = client.open_table("t").await;
    for i in 0..500u64 {
        table.put(&key(i), &key(i)).await.unwrap();
    }

    master.split_tablet_cmd("t", &key(0)).unwrap();
    assert!(
        cluster
            .wait_tablet_count("t", 2, Duration::from_secs(10))
            .await,
        "split did not produce two ready tablets"
    );

    // Both halves cover ["", "") with no gap.
    let catalog = master.tablet_manager().find_table("t").unwrap();
    assert!(master.tablet_manager().check_table_coverage(&catalog).is_ok());

    // Every key reads back across the split (stale routes self-heal).
    for i in 0..500u64 {
        assert_eq!(table.get(&key(i)).await.unwrap(), Some(key(i)), "key {i}");
    }

    // Merge the halves back together.
    master.merge_tablet_cmd("t", &key(0)).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let tablets = master.tablet_manager().find_table("t").unwrap().tablets();
        if tablets.len() == 1 && tablets[0].key_range().is_whole() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "merge did not restore a single whole-range tablet"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(cluster.wait_table_ready("t", Duration::from_secs(5)).await);
    for i in (0..500u64).step_by(17) {
        assert_eq!(table.get(&key(i)).await.unwrap(), Some(key(i)));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn move_relocates_a_tablet_and_keeps_it_readable() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = start_cluster(dir.path(), 2).await;
    let master = cluster.master();
    master
        .create_table(&root_token(), TableSchema::kv("t"), vec![])
        .await
        .unwrap();
    assert!(cluster.wait_table_ready("t", Duration::from_secs(5)).await);

    let client = cluster.client();
    let table = client.open_table("t").await;
    for i in 0..50u64 {
        table.put(&key(i), b"v").await.unwrap();
    }

    let catalog = master.tablet_manager().find_table("t").unwrap();
    let tablet = catalog.tablets().pop().unwrap();
    let source = tablet.server_addr();
    let target = cluster
        .node_addrs()
        .into_iter()
        .find(|addr| addr != &source)
        .unwrap();
    master.move_tablet_cmd("t", &key(0), Some(target.clone())).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let tablet = master
            .tablet_manager()
            .find_table("t")
            .unwrap()
            .tablets()
            .pop()
            .unwrap();
        if tablet.server_addr() == target
            && tablet.status() == strata_store::meta::TabletStatus::Ready
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "move never finished");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    for i in 0..50u64 {
        assert_eq!(table.get(&key(i)).await.unwrap(), Some(b"v".to_vec()));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn node_crash_reloads_tablets_elsewhere() {
    let dir = tempfile::tempdir().unwrap();
    let mut cluster = start_cluster(dir.path(), 2).await;
    let master = cluster.master().clone();
    master
        .create_table(&root_token(), TableSchema::kv("t"), vec![])
        .await
        .unwrap();
    assert!(cluster.wait_table_ready("t", Duration::from_secs(5)).await);

    let client = cluster.client();
    let table = client.open_table("t").await;
    for i in 0..50u64 {
        table.put(&key(i), &key(i)).await.unwrap();
    }

    let victim = master
        .tablet_manager()
        .find_table("t")
        .unwrap()
        .tablets()
        .pop()
        .unwrap()
        .server_addr();
    cluster.crash_node(&victim);

    assert!(
        cluster.wait_table_ready("t", Duration::from_secs(10)).await,
        "tablet did not recover on the surviving node"
    );
    for i in 0..50u64 {
        assert_eq!(table.get(&key(i)).await.unwrap(), Some(key(i)), "key {i}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn safe_mode_blocks_placement_actions() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = start_cluster(dir.path(), 2).await;
    let master = cluster.master();
    master
        .create_table(&root_token(), TableSchema::kv("t"), vec![])
        .await
        .unwrap();
    assert!(cluster.wait_table_ready("t", Duration::from_secs(5)).await);

    let client = cluster.client();
    let table = client.open_table("t").await;
    for i in 0..100u64 {
        table.put(&key(i), b"v").await.unwrap();
    }

    master.enter_safe_mode().unwrap();
    master.split_tablet_cmd("t", &key(0)).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        master.tablet_manager().find_table("t").unwrap().tablet_count(),
        1,
        "split must not run in safe mode"
    );
    // Data plane keeps serving.
    table.put(b"during-safemode", b"v").await.unwrap();
    assert_eq!(
        table.get(b"during-safemode").await.unwrap(),
        Some(b"v".to_vec())
    );

    master.leave_safe_mode().unwrap();
    master.split_tablet_cmd("t", &key(0)).unwrap();
    assert!(
        cluster
            .wait_tablet_count("t", 2, Duration::from_secs(10))
            .await,
        "split should run after leaving safe mode"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn disable_drop_removes_table_and_records() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = start_cluster(dir.path(), 1).await;
    let master = cluster.master();
    master
        .create_table(&root_token(), TableSchema::kv("t"), vec![])
        .await
        .unwrap();
    assert!(cluster.wait_table_ready("t", Duration::from_secs(5)).await);

    // Dropping an enabled table is refused.
    assert_eq!(
        master.drop_table(&root_token(), "t").await.unwrap_err(),
        StatusCode::TableNotEnabled
    );

    master.disable_table(&root_token(), "t").await.unwrap();
    assert_eq!(
        master
            .tablet_manager()
            .find_table("t")
            .unwrap()
            .status(),
        TableStatus::Disable
    );
    master.drop_table(&root_token(), "t").await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while master.tablet_manager().find_table("t").is_some() {
        assert!(tokio::time::Instant::now() < deadline, "table never removed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn gc_reclaims_split_parent_after_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = start_cluster(dir.path(), 1).await;
    let master = cluster.master();
    master
        .create_table(&root_token(), TableSchema::kv("t"), vec![])
        .await
        .unwrap();
    assert!(cluster.wait_table_ready("t", Duration::from_secs(5)).await);

    let client = cluster.client();
    let table = client.open_table("t").await;
    for i in 0..300u64 {
        table.put(&key(i), &key(i)).await.unwrap();
    }

    master.split_tablet_cmd("t", &key(0)).unwrap();
    assert!(
        cluster
            .wait_tablet_count("t", 2, Duration::from_secs(10))
            .await
    );
    let parent_dir = dir.path().join(tablet_path("t", 1));
    assert!(parent_dir.exists(), "parent dir should await GC");

    // Children still inherit: GC must not reclaim the parent.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(parent_dir.exists(), "claimed parent must survive GC");

    // Compaction migrates the children off the parent's files.
    master.compact_table(&root_token(), "t").await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while parent_dir.exists() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "parent dir never reclaimed after compaction"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Data still fully readable from the children.
    for i in (0..300u64).step_by(11) {
        assert_eq!(table.get(&key(i)).await.unwrap(), Some(key(i)));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn user_management_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = start_cluster(dir.path(), 1).await;
    let master = cluster.master();
    let root = root_token();

    master.create_user(&root, "alice", "pw").await.unwrap();
    master.add_user_to_group(&root, "alice", "writers").await.unwrap();
    assert!(master
        .show_users()
        .iter()
        .any(|u| u.name == "alice" && u.groups == vec!["writers"]));

    // Alice can create tables with her token; a stranger cannot.
    let alice = user_token("alice", "pw");
    master
        .create_table(&alice, TableSchema::kv("hers"), vec![])
        .await
        .unwrap();
    assert_eq!(
        master
            .create_user(&alice, "bob", "pw")
            .await
            .unwrap_err(),
        StatusCode::NotPermission
    );

    master.change_password(&root, "alice", "pw2").await.unwrap();
    assert_eq!(
        master
            .create_table(&alice, TableSchema::kv("stale"), vec![])
            .await
            .unwrap_err(),
        StatusCode::NotPermission
    );
    master.delete_user(&root, "alice").await.unwrap();
    assert!(!master.show_users().iter().any(|u| u.name == "alice"));
}

#[tokio::test(flavor = "multi_thread")]
async fn pre_split_table_covers_the_keyspace() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = start_cluster(dir.path(), 2).await;
    let master = cluster.master();
    master
        .create_table(
            &root_token(),
            TableSchema::kv("t"),
            vec![b"g".to_vec(), b"p".to_vec()],
        )
        .await
        .unwrap();
    assert!(
        cluster
            .wait_tablet_count("t", 3, Duration::from_secs(10))
            .await
    );
    let table = master.tablet_manager().find_table("t").unwrap();
    assert!(master.tablet_manager().check_table_coverage(&table).is_ok());

    let client = cluster.client();
    let handle = client.open_table("t").await;
    for row in [&b"a"[..], b"g", b"k", b"p", b"zz"] {
        handle.put(row, b"v").await.unwrap();
        assert_eq!(handle.get(row).await.unwrap(), Some(b"v".to_vec()));
    }
    let rows = handle.scan(b"", b"").await.unwrap();
    assert_eq!(rows.len(), 5);
}
