//! Scenario tests for the operation executor.
//!
//! These tests drive real operation threads and calling threads against each
//! other:
//! - Partition exclusion with caller-runs under contention
//! - Nested call rules for bound runners
//! - Routing, priority ordering and shutdown

#[cfg(test)]
mod tests {
    use crossbeam::channel::{bounded, unbounded};
    use parking_lot::Mutex;
    use rand::Rng;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::config::ExecutorConfig;
    use crate::error::{Error, Result};
    use crate::executor::{
        HandlerRunnerFactory, LiveOperation, LocalOperationHandler, Operation, OperationExecutor,
        OperationHandler, OutOfMemoryHandler, PartitionRunnable, RunOutcome, Task, ThreadRole,
    };
    use crate::network::Packet;
    use crate::testing::utils::{started_executor, started_executor_with};
    use crate::testing::{FnOperation, OverlapProbe, ProbeOperation, TestAssertions};
    use crate::types::{PartitionIdSet, Response, GENERIC_PARTITION_ID};

    const WAIT: Duration = Duration::from_secs(10);

    #[test]
    fn test_partition_exclusion_under_caller_runs() {
        const PARTITIONS: usize = 8;
        const CALLERS: usize = 4;
        const PER_CALLER: usize = 400;

        let executor = started_executor(PARTITIONS, 2);
        let probe = OverlapProbe::new(PARTITIONS);
        let inline = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..CALLERS {
                let executor = &executor;
                let probe = &probe;
                let inline = &inline;
                s.spawn(move || {
                    let ctx = executor.caller_context();
                    let mut rng = rand::rng();
                    for i in 0..PER_CALLER {
                        let pid = rng.random_range(0..PARTITIONS as i32);
                        let op = ProbeOperation::new(pid, probe.clone()).hold(Duration::from_micros(50));
                        if i % 3 == 0 {
                            executor.execute_operation(op).unwrap();
                        } else if let RunOutcome::Completed(_) = ctx.run_or_execute(Box::new(op)).unwrap() {
                            inline.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        let total = (CALLERS * PER_CALLER) as u64;
        TestAssertions::assert_eventually(
            || probe.executions() == total,
            WAIT,
            "every probe operation should execute",
        );
        assert_eq!(probe.violations(), 0, "a partition ran on two threads at once");

        // Every caller-runs attempt either ran inline or counted a conflict.
        let attempts = CALLERS * (PER_CALLER - PER_CALLER.div_ceil(3));
        assert_eq!(
            inline.load(Ordering::SeqCst) + executor.conflict_count() as usize,
            attempts
        );
        assert!(executor.shutdown());
    }

    #[test]
    fn test_nested_calls_from_caller_bound_runner() {
        let executor = started_executor(8, 2);
        let ctx = executor.caller_context();

        let outcome = ctx
            .run_or_execute(Box::new(FnOperation::new(3, |ctx| {
                assert_eq!(ctx.bound_partition(), Some(3));

                let same = ctx.run(Box::new(FnOperation::new(3, |_| {
                    Ok(Response::value(&b"inner"[..]))
                })))?;
                assert_eq!(same, Response::value(&b"inner"[..]));

                let same_or_execute =
                    ctx.run_or_execute(Box::new(FnOperation::new(3, |_| Ok(Response::Empty))))?;
                assert_eq!(same_or_execute, RunOutcome::Completed(Response::Empty));

                let other = ctx.run_or_execute(Box::new(FnOperation::new(5, |_| Ok(Response::Empty))));
                assert!(other.unwrap_err().is_illegal_thread_state());
                let other = ctx.run(Box::new(FnOperation::new(5, |_| Ok(Response::Empty))));
                assert!(other.unwrap_err().is_illegal_thread_state());

                let generic = ctx.run(Box::new(FnOperation::new(GENERIC_PARTITION_ID, |_| {
                    Ok(Response::Empty)
                })));
                assert!(generic.unwrap_err().is_illegal_thread_state());
                let generic = ctx.run_or_execute(Box::new(FnOperation::new(GENERIC_PARTITION_ID, |_| {
                    Ok(Response::Empty)
                })));
                assert!(generic.unwrap_err().is_illegal_thread_state());

                Ok(Response::value(&b"outer"[..]))
            })))
            .unwrap();

        assert_eq!(outcome, RunOutcome::Completed(Response::value(&b"outer"[..])));
        assert_eq!(ctx.bound_partition(), None);
        assert_eq!(executor.conflict_count(), 0);
    }

    #[test]
    fn test_nested_calls_from_partition_thread() {
        let executor = started_executor(8, 2);
        let (tx, rx) = unbounded();

        executor
            .execute_operation(FnOperation::new(2, move |ctx| {
                let role = ctx.role();
                let same = ctx.run(Box::new(FnOperation::new(2, |_| Ok(Response::Empty))));
                // Partition 6 lives on the same thread but is not the bound partition.
                let sibling = ctx.run_or_execute(Box::new(FnOperation::new(6, |_| Ok(Response::Empty))));
                let generic = ctx.run(Box::new(FnOperation::new(GENERIC_PARTITION_ID, |_| {
                    Ok(Response::Empty)
                })));
                let _ = tx.send((
                    role,
                    same.is_ok(),
                    sibling.map_err(|e| e.is_illegal_thread_state()).err(),
                    generic.map_err(|e| e.is_illegal_thread_state()).err(),
                ));
                Ok(Response::Empty)
            }))
            .unwrap();

        let (role, same_ok, sibling, generic) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(role, ThreadRole::PartitionOperation { thread_id: 0 });
        assert!(same_ok);
        assert_eq!(sibling, Some(true));
        assert_eq!(generic, Some(true));
    }

    #[test]
    fn test_generic_operations() {
        let executor = started_executor(8, 2);
        let ctx = executor.caller_context();

        // Unbound application threads may run generic work inline.
        let response = ctx
            .run(Box::new(FnOperation::new(GENERIC_PARTITION_ID, |ctx| {
                assert!(!ctx.is_nested());
                Ok(Response::value(&b"generic"[..]))
            })))
            .unwrap();
        assert_eq!(response, Response::value(&b"generic"[..]));
        assert_eq!(
            ctx.run_or_execute(Box::new(FnOperation::new(GENERIC_PARTITION_ID, |_| Ok(Response::Empty))))
                .unwrap(),
            RunOutcome::Completed(Response::Empty)
        );

        // Queued generic work lands on a generic thread, which may not run partition work.
        let (tx, rx) = unbounded();
        executor
            .execute_operation(FnOperation::new(GENERIC_PARTITION_ID, move |ctx| {
                let partition = ctx.run(Box::new(FnOperation::new(4, |_| Ok(Response::Empty))));
                let _ = tx.send((ctx.role(), partition.is_err()));
                Ok(Response::Empty)
            }))
            .unwrap();
        let (role, rejected) = rx.recv_timeout(WAIT).unwrap();
        assert!(matches!(role, ThreadRole::GenericOperation { .. }));
        assert!(rejected);
    }

    #[test]
    fn test_io_context_only_queues() {
        let executor = started_executor(8, 2);
        let probe = OverlapProbe::new(8);
        let ctx = executor.io_context();

        let err = ctx
            .run_or_execute(Box::new(ProbeOperation::new(1, probe.clone())))
            .unwrap_err();
        assert!(err.is_illegal_thread_state());
        assert!(err.is_retryable());
        assert!(ctx.run(Box::new(ProbeOperation::new(1, probe.clone()))).is_err());
        assert!(!executor.is_run_allowed(&ctx, 1));
        assert!(!executor.is_invocation_allowed(&ctx, 1, true));

        ctx.execute(Task::operation(ProbeOperation::new(1, probe.clone()))).unwrap();
        TestAssertions::assert_eventually(|| probe.executions() == 1, WAIT, "queued probe should run");
    }

    #[test]
    fn test_context_of_other_executor_is_rejected() {
        let a = started_executor(4, 1);
        let b = started_executor(4, 1);
        let ctx = a.caller_context();

        let err = b
            .run_or_execute(&ctx, Box::new(FnOperation::new(0, |_| Ok(Response::Empty))))
            .unwrap_err();
        assert!(err.is_illegal_thread_state());
        assert!(!b.is_run_allowed(&ctx, 0));
    }

    #[test]
    fn test_routing_is_deterministic() {
        const PARTITIONS: usize = 16;
        let executor = started_executor(PARTITIONS, 4);
        let probe = OverlapProbe::new(PARTITIONS);

        for round in 0..10 {
            for pid in 0..PARTITIONS as i32 {
                let op = ProbeOperation::new(pid, probe.clone());
                if round % 2 == 0 {
                    executor.execute_operation(op).unwrap();
                } else {
                    executor.execute(Task::operation(op)).unwrap();
                }
            }
        }
        TestAssertions::assert_eventually(
            || probe.executions() == 10 * PARTITIONS as u64,
            WAIT,
            "all routed operations should execute",
        );

        for (pid, threads) in probe.threads_by_partition() {
            let expected = format!("test-partition-operation-{}", pid as usize % 4);
            assert_eq!(threads.into_iter().collect::<Vec<_>>(), vec![expected]);
            assert_eq!(executor.partition_thread_index(pid), pid as usize % 4);
        }
    }

    #[test]
    fn test_urgent_operations_overtake_queued_work() {
        let executor = started_executor(4, 1);
        let probe = OverlapProbe::new(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        let (started_tx, started_rx) = bounded(1);
        let (release_tx, release_rx) = bounded::<()>(1);

        executor
            .execute_operation(FnOperation::new(0, move |_| {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
                Ok(Response::Empty)
            }))
            .unwrap();
        started_rx.recv_timeout(WAIT).unwrap();

        for (tag, pid) in [(1, 1), (2, 2), (3, 1)] {
            executor
                .execute_operation(ProbeOperation::new(pid, probe.clone()).logged(tag, log.clone()))
                .unwrap();
        }
        executor
            .execute_operation(ProbeOperation::new(3, probe.clone()).urgent().logged(99, log.clone()))
            .unwrap();
        release_tx.send(()).unwrap();

        TestAssertions::assert_eventually(|| log.lock().len() == 4, WAIT, "all tagged operations should run");
        assert_eq!(*log.lock(), vec![99, 1, 2, 3]);
    }

    #[test]
    fn test_conflict_offloads_to_partition_thread() {
        let executor = started_executor(4, 2);
        let probe = OverlapProbe::new(4);
        let (started_tx, started_rx) = bounded(1);
        let (release_tx, release_rx) = bounded::<()>(1);

        executor
            .execute_operation(FnOperation::new(2, move |_| {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
                Ok(Response::Empty)
            }))
            .unwrap();
        started_rx.recv_timeout(WAIT).unwrap();

        let ctx = executor.caller_context();
        let busy = ctx.run_or_execute(Box::new(ProbeOperation::new(2, probe.clone()))).unwrap();
        assert!(busy.is_offloaded());
        assert_eq!(executor.conflict_count(), 1);

        let free = ctx.run_or_execute(Box::new(ProbeOperation::new(3, probe.clone()))).unwrap();
        assert_eq!(free.into_response(), Some(Response::value(0u64.to_be_bytes().to_vec())));
        assert_eq!(executor.conflict_count(), 1);

        release_tx.send(()).unwrap();
        TestAssertions::assert_eventually(|| probe.executions() == 2, WAIT, "offloaded probe should run");
        assert_eq!(executor.metrics().conflict_count, 1);
    }

    #[test]
    fn test_caller_runs_disabled_always_offloads() {
        let config = ExecutorConfig::new()
            .with_partition_count(4)
            .with_partition_threads(1)
            .with_generic_threads(2)
            .with_caller_runs(false);
        let executor = started_executor_with(config);
        let probe = OverlapProbe::new(4);
        let ctx = executor.caller_context();

        for pid in 0..4 {
            let outcome = ctx.run_or_execute(Box::new(ProbeOperation::new(pid, probe.clone()))).unwrap();
            assert_eq!(outcome, RunOutcome::Offloaded);
        }
        TestAssertions::assert_eventually(|| probe.executions() == 4, WAIT, "offloaded probes should run");
        assert_eq!(executor.conflict_count(), 0);
    }

    #[test]
    fn test_scan_live_operations_skips_backups() {
        let executor = started_executor(8, 2);
        let caller: SocketAddr = "10.0.0.7:5701".parse().unwrap();
        let (started_tx, started_rx) = bounded(2);
        let (release_tx, release_rx) = bounded::<()>(2);

        let primary_started = started_tx.clone();
        let primary_release = release_rx.clone();
        executor
            .execute_operation(
                FnOperation::new(5, move |_| {
                    let _ = primary_started.send(());
                    let _ = primary_release.recv();
                    Ok(Response::Empty)
                })
                .with_call(42, caller),
            )
            .unwrap();
        executor
            .execute_operation(
                FnOperation::new(6, move |_| {
                    let _ = started_tx.send(());
                    let _ = release_rx.recv();
                    Ok(Response::Empty)
                })
                .backup(),
            )
            .unwrap();
        started_rx.recv_timeout(WAIT).unwrap();
        started_rx.recv_timeout(WAIT).unwrap();

        let live = executor.scan_live_operations();
        assert_eq!(
            live,
            vec![LiveOperation {
                partition_id: 5,
                caller: Some(caller),
                call_id: 42,
            }]
        );
        assert_eq!(executor.metrics().running_count, 2);

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        TestAssertions::assert_eventually(
            || executor.scan_live_operations().is_empty(),
            WAIT,
            "operations should finish",
        );
    }

    #[test]
    fn test_execute_on_partitions_binds_each_runnable() {
        let executor = started_executor(8, 3);
        let (tx, rx) = unbounded();
        let partitions: PartitionIdSet = [1, 3, 5, 7].into_iter().collect();

        executor
            .execute_on_partitions(&partitions, |pid| {
                let tx = tx.clone();
                PartitionRunnable::new(pid, move |ctx| {
                    let _ = tx.send((pid, ctx.bound_partition()));
                })
            })
            .unwrap();

        let mut seen: Vec<_> = (0..4).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        seen.sort();
        assert_eq!(
            seen,
            vec![(1, Some(1)), (3, Some(3)), (5, Some(5)), (7, Some(7))]
        );
    }

    #[test]
    fn test_execute_on_partition_threads_runs_once_per_thread() {
        let executor = started_executor(8, 3);
        let (tx, rx) = unbounded();
        executor
            .execute_on_partition_threads(move |ctx| {
                let _ = tx.send(ctx.role());
            })
            .unwrap();

        let mut roles: Vec<_> = (0..3)
            .map(|_| match rx.recv_timeout(WAIT).unwrap() {
                ThreadRole::PartitionOperation { thread_id } => thread_id,
                other => panic!("ran on {other}"),
            })
            .collect();
        roles.sort();
        assert_eq!(roles, vec![0, 1, 2]);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_invalid_partition_is_rejected() {
        let executor = started_executor(4, 1);
        let probe = OverlapProbe::new(4);
        let err = executor
            .execute_operation(ProbeOperation::new(4, probe.clone()))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidPartition {
                partition_id: 4,
                partition_count: 4
            }
        ));
        assert!(executor.partition_runner(4).is_none());
        assert!(executor.partition_runner(-1).is_none());
    }

    #[test]
    fn test_shutdown_rejects_new_work() {
        let executor = started_executor(4, 2);
        let probe = OverlapProbe::new(4);
        let (started_tx, started_rx) = bounded(1);
        let (release_tx, release_rx) = bounded::<()>(1);

        executor
            .execute_operation(FnOperation::new(0, move |_| {
                let _ = started_tx.send(());
                let _ = release_rx.recv_timeout(Duration::from_millis(200));
                Ok(Response::Empty)
            }))
            .unwrap();
        started_rx.recv_timeout(WAIT).unwrap();
        // Queued behind the blocked operation; dropped by shutdown.
        executor.execute_operation(ProbeOperation::new(2, probe.clone())).unwrap();

        assert!(executor.shutdown());
        assert!(executor.shutdown());
        drop(release_tx);

        let err = executor
            .execute_operation(ProbeOperation::new(1, probe.clone()))
            .unwrap_err();
        assert!(matches!(err, Error::Shutdown));
        assert!(executor.execute_on_partition_threads(|_| {}).is_err());
        assert_eq!(probe.executions(), 0);
    }

    #[test]
    fn test_metrics_track_completed_tasks() {
        let executor = started_executor(4, 2);
        let probe = OverlapProbe::new(4);
        for pid in 0..4 {
            executor.execute_operation(ProbeOperation::new(pid, probe.clone())).unwrap();
        }
        executor
            .execute_operation(FnOperation::new(1, |_| Err(Error::OperationFailed("boom".into()))))
            .unwrap();

        TestAssertions::assert_eventually(
            || executor.metrics().completed_count >= 5,
            WAIT,
            "completed counters should include every task",
        );
        let metrics = executor.metrics();
        assert_eq!(metrics.partition_threads.len(), 2);
        assert_eq!(metrics.generic_threads.len(), 2);
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.partition_count, 4);
    }

    /// Decodes every packet into an operation for partition 3.
    struct PartitionThreeHandler {
        ran: Arc<AtomicUsize>,
    }

    impl OperationHandler for PartitionThreeHandler {
        fn decode(&self, _packet: &Packet) -> Result<Box<dyn Operation>> {
            let ran = self.ran.clone();
            Ok(Box::new(FnOperation::new(3, move |ctx| {
                assert_eq!(ctx.bound_partition(), Some(3));
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(Response::Empty)
            })))
        }
    }

    #[test]
    fn test_generic_packet_cannot_run_partition_operation() {
        let ran = Arc::new(AtomicUsize::new(0));
        let executor = OperationExecutor::with_handler(
            ExecutorConfig::new()
                .with_partition_count(8)
                .with_partition_threads(2)
                .with_generic_threads(2)
                .with_priority_generic_threads(1)
                .with_shutdown_timeout(Duration::from_secs(5)),
            Arc::new(PartitionThreeHandler { ran: ran.clone() }),
        )
        .unwrap();
        executor.start().unwrap();

        executor
            .execute(Task::Packet(Packet::operation(&b"x"[..], GENERIC_PARTITION_ID)))
            .unwrap();
        TestAssertions::assert_eventually(
            || executor.metrics().error_count == 1,
            WAIT,
            "mismatched packet should fail on the generic thread",
        );
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        // The same operation arriving on its own partition runs.
        executor.execute(Task::Packet(Packet::operation(&b"x"[..], 3))).unwrap();
        TestAssertions::assert_eventually(
            || ran.load(Ordering::SeqCst) == 1,
            WAIT,
            "partition packet should run",
        );
        assert_eq!(executor.metrics().error_count, 1);
        executor.shutdown();
    }

    #[derive(Default)]
    struct RecordingOutOfMemoryHandler {
        seen: Mutex<Vec<(String, String)>>,
    }

    impl OutOfMemoryHandler for RecordingOutOfMemoryHandler {
        fn on_out_of_memory(&self, thread_name: &str, error: &Error) {
            self.seen.lock().push((thread_name.to_string(), error.to_string()));
        }
    }

    #[test]
    fn test_out_of_memory_goes_to_handler() {
        let oom = Arc::new(RecordingOutOfMemoryHandler::default());
        let executor = OperationExecutor::with_out_of_memory_handler(
            ExecutorConfig::new()
                .with_partition_count(4)
                .with_partition_threads(2)
                .with_generic_threads(2)
                .with_priority_generic_threads(1)
                .with_thread_name_prefix("oom")
                .with_shutdown_timeout(Duration::from_secs(5)),
            &HandlerRunnerFactory::new(Arc::new(LocalOperationHandler)),
            oom.clone(),
        )
        .unwrap();
        executor.start().unwrap();

        executor
            .execute_operation(FnOperation::new(2, |_| Err(Error::OutOfMemory("heap exhausted".into()))))
            .unwrap();
        TestAssertions::assert_eventually(|| oom.seen.lock().len() == 1, WAIT, "handler invoked");
        {
            let seen = oom.seen.lock();
            assert_eq!(seen[0].0, format!("oom-partition-operation-{}", executor.partition_thread_index(2)));
            assert!(seen[0].1.contains("heap exhausted"));
        }

        // The worker keeps serving its partitions.
        let (tx, rx) = bounded(1);
        executor
            .execute_operation(FnOperation::new(2, move |_| {
                tx.send(()).unwrap();
                Ok(Response::Empty)
            }))
            .unwrap();
        rx.recv_timeout(WAIT).unwrap();
        assert_eq!(oom.seen.lock().len(), 1);
        assert_eq!(executor.metrics().error_count, 1);
        executor.shutdown();
    }
}
