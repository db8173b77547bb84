//! Read-surface behavior: single-flight coordination, truncated views,
//! dry-run overload, bulk checkpointing, and the pure queries.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cueval::api::Cu;
use cueval::model::MemoryPayload;
use cueval::ordinate::{Ordinate, SortOrder};
use cueval::pipeline::{ErrorKind, ReadTarget};

use common::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_readers_share_one_pipeline_run() {
    let harness = harness(HarnessOptions::default()).await;
    seed_process(&harness).await;
    harness
        .su
        .set_messages(PROCESS_ID, vec![message(1), message(2), message(3)]);
    *harness.su.per_message_delay.lock() = Duration::from_millis(30);

    let cu = Arc::new(Cu::from_deps(harness.deps.clone()));
    let mut joins = Vec::new();
    for _ in 0..6 {
        let cu = cu.clone();
        joins.push(tokio::spawn(async move {
            cu.read_state(PROCESS_ID, ReadTarget::Ordinate(Ordinate::from_int(3)))
                .await
        }));
    }

    for join in joins {
        let result = join.await.unwrap().unwrap();
        assert_eq!(result.origin.ordinate, Ordinate::from_int(3));
    }
    // Six callers, one stream.
    assert_eq!(harness.su.stream_opens(), 1);
    assert!(cu.pending_read_states().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn joiner_with_smaller_target_gets_a_truncated_view() {
    let harness = harness(HarnessOptions::default()).await;
    seed_process(&harness).await;
    harness.su.set_messages(
        PROCESS_ID,
        vec![message(1), message(2), message(3), message(4), message(5)],
    );
    *harness.su.per_message_delay.lock() = Duration::from_millis(40);

    let cu = Arc::new(Cu::from_deps(harness.deps.clone()));
    let leader = {
        let cu = cu.clone();
        tokio::spawn(async move {
            cu.read_state(PROCESS_ID, ReadTarget::Ordinate(Ordinate::from_int(5)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(cu.pending_read_states().len(), 1);

    let joined = cu
        .read_state(PROCESS_ID, ReadTarget::Ordinate(Ordinate::from_int(2)))
        .await
        .unwrap();
    assert_eq!(joined.origin.ordinate, Ordinate::from_int(2));
    assert_eq!(
        joined.evaluation.unwrap().ordinate,
        Ordinate::from_int(2)
    );

    let led = leader.await.unwrap().unwrap();
    assert_eq!(led.origin.ordinate, Ordinate::from_int(5));
    // Both targets were served by the single run.
    assert_eq!(harness.su.stream_opens(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dry_run_overload_surfaces_as_429() {
    let (runtime, release) = StubRuntime::gated();
    let harness = harness(HarnessOptions {
        runtime: Some(runtime),
        dry_run_workers: 1,
        dry_run_max_queue: Some(0),
        ..HarnessOptions::default()
    })
    .await;
    seed_process(&harness).await;
    // A warm cache entry lets dry runs skip the scheduler entirely.
    harness.deps.cache.set(
        PROCESS_ID,
        cueval::model::ProcessMemory {
            memory: MemoryPayload::Loaded(expected_memory(2)),
            module_id: MODULE_ID.into(),
            origin: cueval::model::MemoryOrigin {
                ordinate: Ordinate::from_int(2),
                ..cueval::model::MemoryOrigin::cold_start(PROCESS_ID)
            },
            gas_used: 0,
        },
    );

    let pipeline = harness.pipeline();
    let target = cueval::checkpoint::MemoryTarget::latest();

    let first = {
        let pipeline = pipeline.clone();
        let target = target.clone();
        tokio::spawn(async move {
            pipeline
                .dry_run(PROCESS_ID, &target, message(99))
                .await
        })
    };
    // Wait until the only worker is actually busy.
    for _ in 0..100 {
        if harness.deps.dry_run_pool.stats().active == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let err = pipeline
        .dry_run(PROCESS_ID, &target, message(100))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Overloaded);

    release.send(()).unwrap();
    let output = first.await.unwrap().unwrap();
    assert!(output.error.is_none());
    // Nothing persisted, nothing cached beyond what we seeded.
    assert!(
        harness
            .deps
            .store
            .find_evaluations(PROCESS_ID, &Default::default())
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        harness.deps.cache.get(PROCESS_ID).unwrap().origin.ordinate,
        Ordinate::from_int(2)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn checkpoint_all_walks_the_cache_once() {
    let harness = harness(HarnessOptions {
        checkpoint_throttle: Duration::from_secs(3600),
        ..HarnessOptions::default()
    })
    .await;
    for (pid, ord) in [("proc-a", 3), ("proc-b", 7)] {
        harness.deps.cache.set(
            pid,
            cueval::model::ProcessMemory {
                memory: MemoryPayload::Loaded(expected_memory(ord)),
                module_id: MODULE_ID.into(),
                origin: cueval::model::MemoryOrigin {
                    ordinate: Ordinate::from_int(ord),
                    ..cueval::model::MemoryOrigin::cold_start(pid)
                },
                gas_used: 0,
            },
        );
    }

    let cu = Arc::new(Cu::from_deps(harness.deps.clone()));
    // Concurrent invocations share one pass; the throttle would flag any
    // double visit as "throttled".
    let (a, b) = tokio::join!(
        {
            let cu = cu.clone();
            async move { cu.checkpoint_all().await }
        },
        cu.checkpoint_all()
    );
    let _ = (a, b);

    for pid in ["proc-a", "proc-b"] {
        assert!(
            harness
                .deps
                .store
                .find_checkpoint_record_before(pid, &Ordinate::upper_bound())
                .await
                .unwrap()
                .is_some()
        );
    }
    assert_eq!(
        harness
            .deps
            .metrics
            .checkpoints
            .with_label_values(&["recorded"])
            .get(),
        2
    );
    assert_eq!(
        harness
            .deps
            .metrics
            .checkpoints
            .with_label_values(&["throttled"])
            .get(),
        0
    );
}

#[tokio::test]
async fn standalone_historical_read_matches_the_forward_run() {
    let harness = harness(HarnessOptions::default()).await;
    seed_process(&harness).await;
    harness.su.set_messages(
        PROCESS_ID,
        vec![message(1), message(2), message(3), message(4)],
    );

    let cu = Cu::from_deps(harness.deps.clone());
    cu.read_state(PROCESS_ID, ReadTarget::Ordinate(Ordinate::from_int(4)))
        .await
        .unwrap();
    let forward_row = harness
        .deps
        .store
        .find_evaluation(PROCESS_ID, &Ordinate::from_int(2), None)
        .await
        .unwrap()
        .unwrap();

    // A fresh single-flight run strictly behind the advanced state, with
    // no checkpoint covering it, must answer from the persisted rows.
    let result = cu
        .read_state(PROCESS_ID, ReadTarget::Ordinate(Ordinate::from_int(2)))
        .await
        .unwrap();
    assert_eq!(result.origin.ordinate, Ordinate::from_int(2));
    assert_eq!(result.evaluation.unwrap(), forward_row);
    assert_eq!(
        harness
            .deps
            .store
            .find_evaluations(PROCESS_ID, &Default::default())
            .await
            .unwrap()
            .len(),
        4
    );
}

#[tokio::test]
async fn read_result_resolves_message_position() {
    let harness = harness(HarnessOptions::default()).await;
    seed_process(&harness).await;
    harness
        .su
        .set_messages(PROCESS_ID, vec![message(1), message(2), message(3)]);

    let cu = Cu::from_deps(harness.deps.clone());
    let evaluation = cu.read_result(PROCESS_ID, "msg-2").await.unwrap();
    assert_eq!(evaluation.ordinate, Ordinate::from_int(2));
    // Advancing to message 2 must not have evaluated message 3.
    assert_eq!(
        harness
            .deps
            .store
            .find_evaluations(PROCESS_ID, &Default::default())
            .await
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn read_results_and_cron_results_are_pure_queries() {
    let harness = harness(HarnessOptions::default()).await;
    seed_process(&harness).await;
    harness.su.set_messages(
        PROCESS_ID,
        vec![
            message(1),
            cron_message(2, "1-hour"),
            message(3),
            cron_message(4, "1-hour"),
        ],
    );
    let cu = Cu::from_deps(harness.deps.clone());
    cu.read_state(PROCESS_ID, ReadTarget::Ordinate(Ordinate::from_int(4)))
        .await
        .unwrap();
    let opens = harness.su.stream_opens();

    let page = cu
        .read_results(
            PROCESS_ID,
            Some(Ordinate::from_int(1)),
            Some(Ordinate::from_int(4)),
            Some(2),
            SortOrder::Ascending,
        )
        .await
        .unwrap();
    // `from` is exclusive, `to` inclusive, limit applies in order.
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].ordinate, Ordinate::from_int(2));
    assert_eq!(page[1].ordinate, Ordinate::from_int(3));

    let cron = cu
        .read_cron_results(PROCESS_ID, None, None, None)
        .await
        .unwrap();
    assert_eq!(cron.len(), 2);
    assert!(cron.iter().all(|e| e.cron.is_some()));

    // Pure lookups never reopened the message stream.
    assert_eq!(harness.su.stream_opens(), opens);
}

#[tokio::test]
async fn healthcheck_reports_the_wallet_address() {
    let without = harness(HarnessOptions::default()).await;
    let cu = Cu::from_deps(without.deps.clone());
    assert_eq!(cu.healthcheck().address, None);

    let with = harness(HarnessOptions {
        wallet: true,
        ..HarnessOptions::default()
    })
    .await;
    let cu = Cu::from_deps(with.deps.clone());
    let address = cu.healthcheck().address.expect("wallet address");
    assert_eq!(address.len(), 64);
}

#[tokio::test]
async fn stats_reflect_pools_and_cache() {
    let harness = harness(HarnessOptions::default()).await;
    harness.deps.cache.set(
        PROCESS_ID,
        cueval::model::ProcessMemory {
            memory: MemoryPayload::Loaded(expected_memory(1)),
            module_id: MODULE_ID.into(),
            origin: cueval::model::MemoryOrigin::cold_start(PROCESS_ID),
            gas_used: 0,
        },
    );
    let cu = Cu::from_deps(harness.deps.clone());

    let stats = cu.stats();
    assert_eq!(stats.primary.idle, 2);
    assert_eq!(stats.primary.active, 0);
    assert_eq!(stats.cache_entries, 1);
    assert_eq!(stats.cache_resident_bytes, 1);

    let text = cu.metrics();
    assert!(text.contains("cu_process_memory_cache_entries 1"));
    assert!(text.contains("cu_workers"));
}
