//! End-to-end shard split: seed a keyspace on `-80`/`80-`, split `80-` into
//! `80-c0`/`c0-` via snapshot + restore + filtered replication, verify with
//! a split diff, migrate rdonly → replica → master (with a reverse along the
//! way), and decommission the source shard, all while background writers
//! keep hitting the source.

use std::time::{Duration, Instant};

use tessel_common::{
    KeyspaceId, KeyspaceIdType, ReshardingConfig, TabletId, TabletType,
};
use tessel_resharding::{InsertLoad, LagMonitor, ReshardingAdmin, RestoreStrategy};

const KS: &str = "test_keyspace";
const CELL: &str = "test_nj";
const TABLE: &str = "resharding1";

// initial shards
// range "" - 80
const SHARD_0_MASTER: TabletId = TabletId(1);
const SHARD_0_REPLICA: TabletId = TabletId(2);
// range 80 - ""
const SHARD_1_MASTER: TabletId = TabletId(10);
const SHARD_1_SLAVE1: TabletId = TabletId(11);
const SHARD_1_SLAVE2: TabletId = TabletId(12);
const SHARD_1_RDONLY: TabletId = TabletId(13);
// split shards
// range 80 - C0
const SHARD_2_MASTER: TabletId = TabletId(20);
const SHARD_2_REPLICA1: TabletId = TabletId(21);
const SHARD_2_REPLICA2: TabletId = TabletId(22);
// range C0 - ""
const SHARD_3_MASTER: TabletId = TabletId(30);
const SHARD_3_REPLICA: TabletId = TabletId(31);
const SHARD_3_RDONLY: TabletId = TabletId(32);

fn insert_value(admin: &ReshardingAdmin, tablet: TabletId, id: u64, msg: &str, ksid: u64) {
    use tessel_tablet::{ChangeOp, Row, RowChange};
    admin
        .tablet_engine(tablet)
        .unwrap()
        .execute_txn(vec![RowChange {
            op: ChangeOp::Insert,
            table: TABLE.into(),
            row: Row::new(id, msg, KeyspaceId::from_u64(ksid)),
        }])
        .unwrap();
}

fn check_value(
    admin: &ReshardingAdmin,
    tablet: TabletId,
    id: u64,
    msg: &str,
    ksid: u64,
    should_be_here: bool,
) {
    let row = admin.tablet_engine(tablet).unwrap().store().get(TABLE, id);
    match (row, should_be_here) {
        (Some(row), true) => {
            assert_eq!(row.msg, msg, "bad row on {tablet} for id={id}");
            assert_eq!(row.keyspace_id, KeyspaceId::from_u64(ksid));
        }
        (Some(_), false) => panic!("extra row on {tablet} for id={id}"),
        (None, true) => panic!("missing row on {tablet} for id={id}"),
        (None, false) => {}
    }
}

fn insert_lots(admin: &ReshardingAdmin, count: u64, base: u64) {
    for i in 0..count {
        insert_value(
            admin,
            SHARD_1_MASTER,
            10000 + base + i,
            &format!("msg-range1-{i}"),
            0xA000000000000000 + base + i,
        );
        insert_value(
            admin,
            SHARD_1_MASTER,
            20000 + base + i,
            &format!("msg-range2-{i}"),
            0xE000000000000000 + base + i,
        );
    }
}

/// Percentage of the inserted batch visible on the correct destinations.
fn check_lots(admin: &ReshardingAdmin, count: u64, base: u64) -> u64 {
    let low = admin.tablet_engine(SHARD_2_REPLICA2).unwrap();
    let high = admin.tablet_engine(SHARD_3_REPLICA).unwrap();
    let mut found = 0u64;
    for i in 0..count {
        if low.store().get(TABLE, 10000 + base + i).is_some() {
            found += 1;
        }
        if high.store().get(TABLE, 20000 + base + i).is_some() {
            found += 1;
        }
    }
    found * 100 / count / 2
}

fn check_lots_timeout(admin: &ReshardingAdmin, count: u64, threshold: u64, timeout: Duration, base: u64) {
    let deadline = Instant::now() + timeout;
    loop {
        let percent = check_lots(admin, count, base);
        if percent >= threshold {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timeout waiting for {threshold}% of the data, at {percent}%"
        );
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// No row of the batch may ever land on the sibling destination.
fn check_lots_not_present(admin: &ReshardingAdmin, count: u64, base: u64) {
    let low = admin.tablet_engine(SHARD_2_REPLICA2).unwrap();
    let high = admin.tablet_engine(SHARD_3_REPLICA).unwrap();
    for i in 0..count {
        assert!(
            high.store().get(TABLE, 10000 + base + i).is_none(),
            "low-range row on the high shard"
        );
        assert!(
            low.store().get(TABLE, 20000 + base + i).is_none(),
            "high-range row on the low shard"
        );
    }
}

fn wait_for_player_count(admin: &ReshardingAdmin, tablet: TabletId, expected: u64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let count = admin.binlog_player_count(tablet).unwrap();
        if count == expected {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timeout waiting for player count {expected} on {tablet}, at {count}"
        );
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_resharding() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let admin = ReshardingAdmin::new(ReshardingConfig::default());
    let convergence = admin.config().convergence.clone();

    // keyspace starts with a bad sharding definition; fixing it requires force
    admin
        .create_keyspace(KS, Some("bad_column"), Some(KeyspaceIdType::Bytes))
        .unwrap();
    let err = admin
        .set_keyspace_sharding_info(KS, "keyspace_id", KeyspaceIdType::Uint64, false)
        .unwrap_err();
    assert_eq!(err.code(), "config");
    admin
        .set_keyspace_sharding_info(KS, "keyspace_id", KeyspaceIdType::Uint64, true)
        .unwrap();

    // initial serving shards
    admin.init_tablet(SHARD_0_MASTER, CELL, TabletType::Master, KS, "-80").unwrap();
    admin.init_tablet(SHARD_0_REPLICA, CELL, TabletType::Replica, KS, "-80").unwrap();
    admin.init_tablet(SHARD_1_MASTER, CELL, TabletType::Master, KS, "80-").unwrap();
    admin.init_tablet(SHARD_1_SLAVE1, CELL, TabletType::Replica, KS, "80-").unwrap();
    admin.init_tablet(SHARD_1_SLAVE2, CELL, TabletType::Spare, KS, "80-").unwrap();
    admin.init_tablet(SHARD_1_RDONLY, CELL, TabletType::Rdonly, KS, "80-").unwrap();
    admin.rebuild_keyspace_graph(KS).unwrap();

    admin.reparent_shard(KS, "-80", SHARD_0_MASTER, true).unwrap();
    admin.reparent_shard(KS, "80-", SHARD_1_MASTER, true).unwrap();

    insert_value(&admin, SHARD_0_MASTER, 1, "msg1", 0x1000000000000000);
    insert_value(&admin, SHARD_1_MASTER, 2, "msg2", 0x9000000000000000);
    insert_value(&admin, SHARD_1_MASTER, 3, "msg3", 0xD000000000000000);

    // the split shards, still importing from their parent
    admin.init_tablet(SHARD_2_MASTER, CELL, TabletType::Master, KS, "80-c0").unwrap();
    admin.init_tablet(SHARD_2_REPLICA1, CELL, TabletType::Spare, KS, "80-c0").unwrap();
    admin.init_tablet(SHARD_2_REPLICA2, CELL, TabletType::Spare, KS, "80-c0").unwrap();
    admin.init_tablet(SHARD_3_MASTER, CELL, TabletType::Master, KS, "c0-").unwrap();
    admin.init_tablet(SHARD_3_REPLICA, CELL, TabletType::Spare, KS, "c0-").unwrap();
    admin.init_tablet(SHARD_3_RDONLY, CELL, TabletType::Rdonly, KS, "c0-").unwrap();
    admin.reparent_shard(KS, "80-c0", SHARD_2_MASTER, true).unwrap();
    admin.reparent_shard(KS, "c0-", SHARD_3_MASTER, true).unwrap();

    admin.rebuild_keyspace_graph(KS).unwrap();
    assert_eq!(
        admin.srv_keyspace(CELL, KS).unwrap(),
        "Partitions(master): -80 80-\n\
         Partitions(rdonly): -80 80-\n\
         Partitions(replica): -80 80-\n\
         TabletTypes: master,rdonly,replica"
    );

    // snapshot the source for the split
    admin.multi_snapshot(SHARD_1_SLAVE1, &["80-c0", "c0-"]).unwrap();
    let vars = admin.status_vars(SHARD_1_SLAVE1).unwrap();
    assert_eq!(vars["BinlogServerState"], "Enabled");

    // restore both children; checkpoints are populated and players start
    admin
        .shard_multi_restore(KS, "80-c0", SHARD_1_SLAVE1, RestoreStrategy::PopulateCheckpoint)
        .unwrap();
    admin
        .shard_multi_restore(KS, "c0-", SHARD_1_SLAVE1, RestoreStrategy::PopulateCheckpoint)
        .unwrap();

    // startup values landed on the right children only
    check_value(&admin, SHARD_2_MASTER, 2, "msg2", 0x9000000000000000, true);
    check_value(&admin, SHARD_2_REPLICA1, 2, "msg2", 0x9000000000000000, true);
    check_value(&admin, SHARD_2_REPLICA2, 2, "msg2", 0x9000000000000000, true);
    check_value(&admin, SHARD_3_MASTER, 2, "msg2", 0x9000000000000000, false);
    check_value(&admin, SHARD_3_REPLICA, 2, "msg2", 0x9000000000000000, false);
    check_value(&admin, SHARD_3_RDONLY, 2, "msg2", 0x9000000000000000, false);
    check_value(&admin, SHARD_2_MASTER, 3, "msg3", 0xD000000000000000, false);
    check_value(&admin, SHARD_3_MASTER, 3, "msg3", 0xD000000000000000, true);

    wait_for_player_count(&admin, SHARD_2_MASTER, 1);
    wait_for_player_count(&admin, SHARD_3_MASTER, 1);

    let vars = admin.status_vars(SHARD_1_SLAVE1).unwrap();
    assert!(vars.get("UpdateStreamKeyRangeStatements").is_some());
    assert!(vars.get("UpdateStreamKeyRangeTransactions").is_some());

    // filtered replication: most of a burst arrives quickly, all of it
    // eventually, none of it on the wrong sibling
    insert_lots(&admin, 1000, 0);
    check_lots_timeout(&admin, 1000, 80, convergence.quick_timeout, 0);
    check_lots_timeout(&admin, 1000, 100, convergence.full_timeout, 0);
    check_lots_not_present(&admin, 1000, 0);

    // independent verification
    admin.split_diff(KS, "c0-").unwrap();
    admin.split_diff(KS, "80-c0").unwrap();
    admin.change_slave_type(SHARD_1_RDONLY, TabletType::Rdonly).unwrap();
    admin.change_slave_type(SHARD_3_RDONLY, TabletType::Rdonly).unwrap();

    // background load on the source, lag monitors on the destinations
    let insert_low = InsertLoad::start(
        admin.tablet_engine(SHARD_1_MASTER).unwrap(),
        "timestamps",
        10000,
        KeyspaceId::from_u64(0x9000000000000000),
        Duration::from_millis(20),
    )
    .unwrap();
    let insert_high = InsertLoad::start(
        admin.tablet_engine(SHARD_1_MASTER).unwrap(),
        "timestamps",
        10001,
        KeyspaceId::from_u64(0xD000000000000000),
        Duration::from_millis(20),
    )
    .unwrap();
    let monitor_low = LagMonitor::start(
        admin.tablet_engine(SHARD_2_REPLICA2).unwrap(),
        "timestamps",
        10000,
        Duration::from_millis(50),
    )
    .unwrap();
    let monitor_high = LagMonitor::start(
        admin.tablet_engine(SHARD_3_REPLICA).unwrap(),
        "timestamps",
        10001,
        Duration::from_millis(50),
    )
    .unwrap();

    // fail over source serving to a different replica
    admin.change_slave_type(SHARD_1_SLAVE2, TabletType::Replica).unwrap();
    admin.change_slave_type(SHARD_1_SLAVE1, TabletType::Spare).unwrap();

    // data still flows after the failover
    insert_lots(&admin, 1000, 1000);
    check_lots_timeout(&admin, 1000, 80, convergence.quick_timeout, 1000);

    // the master cannot move before the other roles
    let err = admin
        .migrate_served_types(KS, "80-", TabletType::Master, false)
        .unwrap_err();
    assert_eq!(err.code(), "precondition");

    // rdonly first
    admin.migrate_served_types(KS, "80-", TabletType::Rdonly, false).unwrap();
    assert_eq!(
        admin.srv_keyspace(CELL, KS).unwrap(),
        "Partitions(master): -80 80-\n\
         Partitions(rdonly): -80 80-c0 c0-\n\
         Partitions(replica): -80 80-\n\
         TabletTypes: master,rdonly,replica"
    );

    // then replica
    admin.migrate_served_types(KS, "80-", TabletType::Replica, false).unwrap();
    assert_eq!(
        admin.srv_keyspace(CELL, KS).unwrap(),
        "Partitions(master): -80 80-\n\
         Partitions(rdonly): -80 80-c0 c0-\n\
         Partitions(replica): -80 80-c0 c0-\n\
         TabletTypes: master,rdonly,replica"
    );

    // move replica back and forth
    admin.migrate_served_types(KS, "80-", TabletType::Replica, true).unwrap();
    assert_eq!(
        admin.srv_keyspace(CELL, KS).unwrap(),
        "Partitions(master): -80 80-\n\
         Partitions(rdonly): -80 80-c0 c0-\n\
         Partitions(replica): -80 80-\n\
         TabletTypes: master,rdonly,replica"
    );
    admin.migrate_served_types(KS, "80-", TabletType::Replica, false).unwrap();
    assert_eq!(
        admin.srv_keyspace(CELL, KS).unwrap(),
        "Partitions(master): -80 80-\n\
         Partitions(rdonly): -80 80-c0 c0-\n\
         Partitions(replica): -80 80-c0 c0-\n\
         TabletTypes: master,rdonly,replica"
    );

    // reparent a destination shard mid-stream and check data still flows
    admin.reparent_shard(KS, "80-c0", SHARD_2_REPLICA1, true).unwrap();
    insert_lots(&admin, 1000, 2000);
    check_lots_timeout(&admin, 1000, 80, convergence.quick_timeout, 2000);
    check_lots_timeout(&admin, 1000, 100, convergence.full_timeout, 2000);

    // stop the load and collect the delays before the final verification
    // and cutover
    let low_writes = insert_low.stop_and_join();
    let high_writes = insert_high.stop_and_join();
    let low_stats = monitor_low.stop_and_join();
    let high_stats = monitor_high.stop_and_join();

    // verify again before the cutover
    admin.split_diff(KS, "c0-").unwrap();
    assert!(low_writes > 0 && high_writes > 0);
    assert!(low_stats.samples > 0, "low monitor never saw the row");
    assert!(high_stats.samples > 0, "high monitor never saw the row");
    assert!(low_stats.avg_lag_ms <= low_stats.max_lag_ms);
    tracing::info!(
        max_lag_ms = low_stats.max_lag_ms,
        avg_lag_ms = low_stats.avg_lag_ms,
        "delay insert_low",
    );
    tracing::info!(
        max_lag_ms = high_stats.max_lag_ms,
        avg_lag_ms = high_stats.avg_lag_ms,
        "delay insert_high",
    );

    // the cutover: drain, flip master, stop the streams
    admin.migrate_served_types(KS, "80-", TabletType::Master, false).unwrap();
    assert_eq!(
        admin.srv_keyspace(CELL, KS).unwrap(),
        "Partitions(master): -80 80-c0 c0-\n\
         Partitions(rdonly): -80 80-c0 c0-\n\
         Partitions(replica): -80 80-c0 c0-\n\
         TabletTypes: master,rdonly,replica"
    );
    wait_for_player_count(&admin, SHARD_2_MASTER, 0);
    wait_for_player_count(&admin, SHARD_3_MASTER, 0);
    for child in ["80-c0", "c0-"] {
        let record = admin.get_shard(KS, child).unwrap();
        assert_eq!(record["source_shards"].as_array().unwrap().len(), 0);
    }

    // decommission the source shard
    for tablet in [SHARD_1_MASTER, SHARD_1_SLAVE1, SHARD_1_SLAVE2, SHARD_1_RDONLY] {
        admin.scrap_tablet(tablet).unwrap();
    }
    admin.rebuild_keyspace_graph(KS).unwrap();

    // -80 still serves, so its cell cannot be removed
    let err = admin.remove_shard_cell(KS, "-80", CELL).unwrap_err();
    assert_eq!(err.code(), "precondition");
    admin.remove_shard_cell(KS, "80-", CELL).unwrap();
    let record = admin.get_shard(KS, "80-").unwrap();
    assert_eq!(
        record["cells"].as_array().unwrap().len(),
        0,
        "non-empty cells record for shard: {record}"
    );

    admin.delete_shard(KS, "80-").unwrap();
    assert_eq!(admin.get_shard(KS, "80-").unwrap_err().code(), "precondition");
}
