//! Benchmarks the worker loop's critical path: enqueue a pending run, claim
//! it, complete it (spec.md §4.8). Grounded in the teacher's
//! `benches/task_claiming.rs`, adapted from `TaskDefinition`/`claim_task` to
//! this port's `RunRecord`/[`Ledger::claim_pending`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use spine_durable::ledger::{InMemoryLedger, Ledger};
use spine_durable::model::{EventType, RunRecord, RunStatus, WorkSpec};

async fn seed(ledger: &InMemoryLedger, count: u64) {
    for i in 0..count {
        let spec = WorkSpec::task(format!("bench-task-{i}"));
        ledger.create_run(&RunRecord::new(spec)).await.unwrap();
    }
}

fn bench_claim_single(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("task_claiming/single");
    group.throughput(Throughput::Elements(1));

    for batch_size in [1u32, 5, 10] {
        group.bench_with_input(BenchmarkId::new("batch", batch_size), &batch_size, |b, &batch_size| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let ledger = InMemoryLedger::new();
                let task_count = (iters * batch_size as u64).max(100);
                seed(&ledger, task_count).await;

                let start = Instant::now();
                let mut claimed_total = 0u64;
                while claimed_total < task_count {
                    let claimed = ledger.claim_pending(batch_size, "bench-worker").await.unwrap();
                    claimed_total += claimed.len() as u64;
                    for run in claimed {
                        ledger
                            .update_status(run.run_id, RunStatus::Completed, Some(serde_json::json!({})), None)
                            .await
                            .unwrap();
                    }
                }
                start.elapsed()
            });
        });
    }

    group.finish();
}

fn bench_claim_concurrent(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("task_claiming/concurrent");
    group.sample_size(20);

    for workers in [2u32, 4, 8] {
        let task_count = 5000u64;
        group.throughput(Throughput::Elements(task_count));
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            b.to_async(&rt).iter(|| async move {
                let ledger = Arc::new(InMemoryLedger::new());
                seed(&ledger, task_count).await;

                let claimed_total = Arc::new(AtomicU64::new(0));
                let mut handles = Vec::new();
                for worker_id in 0..workers {
                    let ledger = ledger.clone();
                    let claimed_total = claimed_total.clone();
                    handles.push(tokio::spawn(async move {
                        let worker_name = format!("worker-{worker_id}");
                        loop {
                            if claimed_total.load(Ordering::Relaxed) >= task_count {
                                break;
                            }
                            let claimed = ledger.claim_pending(1, &worker_name).await.unwrap();
                            if claimed.is_empty() {
                                tokio::task::yield_now().await;
                                continue;
                            }
                            for run in claimed {
                                ledger
                                    .update_status(run.run_id, RunStatus::Completed, Some(serde_json::json!({})), None)
                                    .await
                                    .unwrap();
                                claimed_total.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }));
                }
                for handle in handles {
                    handle.await.unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_record_event(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("task_claiming/record_event");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let ledger = InMemoryLedger::new();
            let run = RunRecord::new(WorkSpec::task("bench-task"));
            ledger.create_run(&run).await.unwrap();

            let start = Instant::now();
            for _ in 0..iters {
                ledger
                    .record_event(run.run_id, EventType::StepStarted, serde_json::json!({}))
                    .await
                    .unwrap();
            }
            start.elapsed()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_claim_single, bench_claim_concurrent, bench_record_event);
criterion_main!(benches);
