//! End-to-end gateway scenarios.
//!
//! | Scenario                         | Checks                                          |
//! |----------------------------------|-------------------------------------------------|
//! | Live migration under load        | No failed queries, traffic lands on new shard   |
//! | Exec sentinel                    | Unsupported exec values come back as i32::MIN   |
//! | Drain timeout                    | Route unchanged, gate reopened                  |
//! | Remove during migration          | Cutover rejected, key stays removed             |
//! | Failed catch-up                  | Cutover rejected, route kept, gate reopened     |
//! | SQLite migration                 | Only the key's rows move, ids stay shard-local  |
//! | Fatal probe                      | `serve` returns the unreachable shard as cause  |
//! | Bind failure                     | `run` stops through the supervisor              |

#[cfg(test)]
mod tests {
    use crate::config::{MigrationConfig, ProbeConfig, ShardConfig};
    use crate::error::{Error, FatalError, MigrationError};
    use crate::gateway::Gateway;
    use crate::migration::MigrationPhase;
    use crate::testing::{memory_config, memory_gateway, orders_partition, wait_for};
    use crate::types::{Value, EXEC_UNSUPPORTED_SENTINEL};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_live_migration_has_no_failed_queries() {
        let (gateway, connector) = memory_gateway(memory_config(&["shardA", "shardB"]));
        gateway.register_key("tenant1", "shardA").await.unwrap();
        connector.shard("shardA").seed_partition(orders_partition("tenant1", 50));
        for shard in ["shardA", "shardB"] {
            connector
                .shard(shard)
                .set_query_delay(Some(Duration::from_millis(2)));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let failures = Arc::new(AtomicU64::new(0));
        let mut workers = Vec::new();
        for _ in 0..8 {
            let gateway = Arc::clone(&gateway);
            let stop = Arc::clone(&stop);
            let failures = Arc::clone(&failures);
            workers.push(tokio::spawn(async move {
                let mut ok = 0u64;
                while !stop.load(Ordering::SeqCst) {
                    match gateway.query("tenant1", "SELECT * FROM orders").await {
                        Ok(_) => ok += 1,
                        Err(_) => {
                            failures.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
                ok
            }));
        }

        tokio::time::sleep(Duration::from_millis(30)).await;
        let report = gateway.migrate_shard("tenant1", "shardB").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        stop.store(true, Ordering::SeqCst);

        let mut succeeded = 0;
        for worker in workers {
            succeeded += worker.await.unwrap();
        }

        assert_eq!(failures.load(Ordering::SeqCst), 0);
        assert!(succeeded > 0);
        assert_eq!(report.rows_copied, 50);
        assert_eq!(gateway.shard_for(&"tenant1".into()), Some("shardB".into()));
        assert_eq!(
            connector.shard("shardB").partition(&"tenant1".into()),
            Some(orders_partition("tenant1", 50))
        );

        let rows = gateway.query("tenant1", "SELECT 1").await.unwrap();
        assert_eq!(rows.get(0, "shard"), Some(&Value::from("shardB")));

        assert!(gateway.gate().is_open());
        assert_eq!(gateway.gate().in_flight(), 0);

        let snapshot = gateway.metrics_snapshot();
        assert_eq!(snapshot.queries_failed, 0);
        assert_eq!(snapshot.migrations_completed, 1);
        assert_eq!(snapshot.migrations_active, 0);
    }

    #[tokio::test]
    async fn test_exec_unsupported_values_use_sentinel() {
        let (gateway, connector) = memory_gateway(memory_config(&["shardA"]));
        gateway.register_key("tenant1", "shardA").await.unwrap();
        connector.shard("shardA").set_exec_capabilities(false, false);

        let outcome = gateway.exec("tenant1", "UPDATE t SET x = 1").await.unwrap();
        assert_eq!(outcome.rows_affected, None);
        assert_eq!(outcome.rows_affected_or_sentinel(), -2147483648);
        assert_eq!(outcome.last_insert_id_or_sentinel(), EXEC_UNSUPPORTED_SENTINEL);
    }

    #[tokio::test]
    async fn test_concurrent_requests_on_many_keys() {
        let (gateway, connector) = memory_gateway(memory_config(&["shardA", "shardB"]));
        for i in 0..20 {
            let shard = if i % 2 == 0 { "shardA" } else { "shardB" };
            gateway.register_key(format!("tenant{}", i), shard).await.unwrap();
        }

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let gateway = Arc::clone(&gateway);
                tokio::spawn(async move {
                    let rows = gateway
                        .query(format!("tenant{}", i), "SELECT 1")
                        .await
                        .unwrap();
                    (i, rows)
                })
            })
            .collect();

        for task in tasks {
            let (i, rows) = task.await.unwrap();
            let expected = if i % 2 == 0 { "shardA" } else { "shardB" };
            assert_eq!(rows.get(0, "shard"), Some(&Value::from(expected)));
        }

        assert_eq!(connector.shard("shardA").query_count(), 10);
        assert_eq!(connector.shard("shardB").query_count(), 10);
        assert_eq!(gateway.metrics_snapshot().routes, 20);
    }

    #[tokio::test]
    async fn test_drain_timeout_leaves_route_unchanged() {
        let config = memory_config(&["shardA", "shardB"]).with_migration_config(
            MigrationConfig::default().with_drain_timeout(Some(Duration::from_millis(50))),
        );
        let (gateway, connector) = memory_gateway(config);
        gateway.register_key("tenant1", "shardA").await.unwrap();
        connector
            .shard("shardA")
            .set_query_delay(Some(Duration::from_millis(500)));

        let slow = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.query("tenant1", "SELECT 1").await })
        };
        assert!(wait_for(|| gateway.gate().in_flight() == 1, Duration::from_secs(1)).await);

        let err = gateway.migrate_shard("tenant1", "shardB").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Migration(MigrationError::DrainTimeout { .. })
        ));

        assert_eq!(gateway.shard_for(&"tenant1".into()), Some("shardA".into()));
        assert!(gateway.gate().is_open());
        assert!(slow.await.unwrap().is_ok());

        let history = gateway.orchestrator().history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].phase, MigrationPhase::Failed);
    }

    #[tokio::test]
    async fn test_remove_during_migration_rejects_cutover() {
        let config = memory_config(&["shardA", "shardB"])
            .with_migration_config(MigrationConfig::default().with_drain_timeout(None));
        let (gateway, connector) = memory_gateway(config);
        gateway.register_key("tenant1", "shardA").await.unwrap();
        connector
            .shard("shardA")
            .set_query_delay(Some(Duration::from_millis(200)));

        let slow = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.query("tenant1", "SELECT 1").await })
        };
        assert!(wait_for(|| gateway.gate().in_flight() == 1, Duration::from_secs(1)).await);

        let migration = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.migrate_shard("tenant1", "shardB").await })
        };
        assert!(wait_for(|| !gateway.gate().is_open(), Duration::from_secs(1)).await);

        // Route changes bypass the gate.
        gateway.remove_key("tenant1").await.unwrap();

        let err = migration.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Migration(MigrationError::CutoverRejected { .. })
        ));
        assert_eq!(gateway.shard_for(&"tenant1".into()), None);
        assert!(gateway.gate().is_open());
        assert!(slow.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_failed_catch_up_keeps_route_and_reopens_gate() {
        let config = memory_config(&["shardA", "shardB"])
            .with_migration_config(MigrationConfig::default().with_drain_timeout(None));
        let (gateway, connector) = memory_gateway(config);
        gateway.register_key("tenant1", "shardA").await.unwrap();
        let source = connector.shard("shardA");
        source.seed_partition(orders_partition("tenant1", 3));
        source.set_query_delay(Some(Duration::from_millis(200)));

        let slow = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.query("tenant1", "SELECT 1").await })
        };
        assert!(wait_for(|| gateway.gate().in_flight() == 1, Duration::from_secs(1)).await);

        let migration = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.migrate_shard("tenant1", "shardB").await })
        };
        assert!(wait_for(|| !gateway.gate().is_open(), Duration::from_secs(1)).await);

        // The copy is done; the source goes away before the final sync.
        source.set_reachable(false);

        let err = migration.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Migration(MigrationError::CutoverRejected { .. })
        ));
        assert!(slow.await.unwrap().is_ok());

        assert_eq!(gateway.shard_for(&"tenant1".into()), Some("shardA".into()));
        assert!(gateway.gate().is_open());
        assert_eq!(gateway.gate().in_flight(), 0);

        source.set_reachable(true);
        source.set_query_delay(None);
        let rows = gateway.query("tenant1", "SELECT 1").await.unwrap();
        assert_eq!(rows.get(0, "shard"), Some(&Value::from("shardA")));

        let history = gateway.orchestrator().history();
        assert_eq!(history[0].phase, MigrationPhase::Failed);
    }

    #[tokio::test]
    async fn test_requests_wait_while_gate_closed() {
        let (gateway, _) = memory_gateway(memory_config(&["shardA"]));
        gateway.register_key("tenant1", "shardA").await.unwrap();

        let closed = gateway.gate().quiesce();
        let waiting = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.query("tenant1", "SELECT 1").await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiting.is_finished());

        drop(closed);
        assert!(waiting.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_sqlite_migration_moves_only_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let config = memory_config(&[])
            .with_shard(ShardConfig::sqlite("shardA", dir.path().join("a.db")))
            .with_shard(ShardConfig::sqlite("shardB", dir.path().join("b.db")));
        let gateway = Gateway::new(config).unwrap();

        gateway.register_key("tenant1", "shardA").await.unwrap();
        gateway.register_key("tenant2", "shardA").await.unwrap();

        gateway
            .exec(
                "tenant1",
                "CREATE TABLE orders (id INTEGER PRIMARY KEY, routing_key TEXT, item TEXT)",
            )
            .await
            .unwrap();
        for (key, item) in [("tenant1", "apple"), ("tenant1", "pear"), ("tenant2", "plum")] {
            let outcome = gateway
                .exec(
                    key,
                    &format!(
                        "INSERT INTO orders (routing_key, item) VALUES ('{}', '{}')",
                        key, item
                    ),
                )
                .await
                .unwrap();
            assert_eq!(outcome.rows_affected, Some(1));
        }

        // shardB already holds another key under the same ids.
        gateway.register_key("tenant3", "shardB").await.unwrap();
        gateway
            .exec(
                "tenant3",
                "CREATE TABLE orders (id INTEGER PRIMARY KEY, routing_key TEXT, item TEXT)",
            )
            .await
            .unwrap();
        gateway
            .exec(
                "tenant3",
                "INSERT INTO orders (routing_key, item) VALUES ('tenant3', 'fig'), ('tenant3', 'kiwi')",
            )
            .await
            .unwrap();

        let report = gateway.migrate_shard("tenant1", "shardB").await.unwrap();
        assert_eq!(report.rows_copied, 2);

        let rows = gateway
            .query(
                "tenant3",
                "SELECT item FROM orders WHERE routing_key = 'tenant3' ORDER BY id",
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.get(0, "item"), Some(&Value::from("fig")));

        let rows = gateway
            .query(
                "tenant1",
                "SELECT item FROM orders WHERE routing_key = 'tenant1' ORDER BY id",
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.get(0, "item"), Some(&Value::from("apple")));
        assert_eq!(rows.get(1, "item"), Some(&Value::from("pear")));

        // tenant2 never moved.
        let rows = gateway
            .query("tenant1", "SELECT COUNT(*) AS n FROM orders WHERE routing_key = 'tenant2'")
            .await
            .unwrap();
        assert_eq!(rows.get(0, "n"), Some(&Value::from(0)));

        let rows = gateway
            .query("tenant2", "SELECT item FROM orders WHERE routing_key = 'tenant2'")
            .await
            .unwrap();
        assert_eq!(rows.get(0, "item"), Some(&Value::from("plum")));

        let err = gateway
            .query("tenant1", "SELECT * FROM no_such_table")
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::Query(m) if m.contains("no_such_table")));
    }

    #[tokio::test]
    async fn test_unreachable_shard_stops_serve() {
        let config = memory_config(&["shardA", "shardB"]).with_probe_config(
            ProbeConfig::default()
                .with_interval(Duration::from_millis(10))
                .with_timeout(Duration::from_millis(50))
                .with_failure_threshold(1),
        );
        let (gateway, connector) = memory_gateway(config);
        gateway.register_key("tenant1", "shardA").await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let serving = tokio::spawn(Arc::clone(&gateway).serve(listener));

        tokio::time::sleep(Duration::from_millis(30)).await;
        connector.shard("shardA").set_reachable(false);

        let result = tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .expect("serve should stop on a fatal probe failure")
            .unwrap();

        match result {
            Err(Error::Fatal(FatalError::ShardUnreachable { shard, failures, .. })) => {
                assert_eq!(shard.as_str(), "shardA");
                assert_eq!(failures, 2);
            }
            other => panic!("unexpected serve result: {:?}", other),
        }

        // Connections are closed and not rebuilt once serve returns.
        assert!(gateway.registry().connections().is_empty());
        assert!(gateway.registry().connect(&"shardB".into()).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let (occupied, addr) = crate::testing::local_listener().await;
        let mut config = memory_config(&["shardA"]);
        config.listen_addr = addr;
        let (gateway, _) = memory_gateway(config);
        gateway.register_key("tenant1", "shardA").await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), Arc::clone(&gateway).run())
            .await
            .expect("run should stop when the address is taken");
        match result {
            Err(Error::Fatal(FatalError::ListenerFailed(reason))) => {
                assert!(reason.contains(&addr.to_string()), "{}", reason);
            }
            other => panic!("unexpected run result: {:?}", other),
        }

        // The same teardown as any fatal failure.
        assert!(gateway.registry().connections().is_empty());
        assert!(gateway.registry().connect(&"shardA".into()).await.is_err());
        drop(occupied);
    }

    #[tokio::test]
    async fn test_shutdown_stops_serve_cleanly() {
        let (gateway, _) = memory_gateway(memory_config(&["shardA"]));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let serving = tokio::spawn(Arc::clone(&gateway).serve(listener));

        tokio::time::sleep(Duration::from_millis(20)).await;
        gateway.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
