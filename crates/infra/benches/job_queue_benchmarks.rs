use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use serde_json::json;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use viewforge_core::SourceSlug;
use viewforge_infra::jobs::{CoalescingEnqueuer, InMemoryJobStore, JobStore, JobType};
use viewforge_infra::sources::InMemorySourceStore;

fn runtime() -> Runtime {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn seeded_sources(count: usize) -> (Arc<InMemorySourceStore>, Vec<SourceSlug>) {
    let sources = InMemorySourceStore::arc();
    let slugs = (0..count)
        .map(|i| {
            let slug = SourceSlug::new(format!("source-{i}")).expect("valid slug");
            sources.upsert(slug.clone(), json!({ "views": [] }));
            slug
        })
        .collect();
    (sources, slugs)
}

/// Repeated edits to one source collapse into a single queued row.
fn bench_coalesced_burst(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("coalesced_burst");

    for burst in [1usize, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*burst as u64));
        group.bench_with_input(BenchmarkId::from_parameter(burst), burst, |b, &burst| {
            b.iter(|| {
                let jobs = InMemoryJobStore::arc();
                let (sources, slugs) = seeded_sources(1);
                let enqueuer = CoalescingEnqueuer::new(jobs.clone(), sources);
                rt.block_on(async {
                    for _ in 0..burst {
                        black_box(enqueuer.enqueue(&slugs[0], Vec::new()).await.expect("enqueue"));
                    }
                });
                jobs
            });
        });
    }

    group.finish();
}

/// Enqueue, claim and complete across distinct sources.
fn bench_claim_complete_cycle(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_complete_cycle");

    for sources_count in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*sources_count as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(sources_count),
            sources_count,
            |b, &sources_count| {
                b.iter(|| {
                    let jobs = InMemoryJobStore::arc();
                    let (sources, slugs) = seeded_sources(sources_count);
                    let enqueuer = CoalescingEnqueuer::new(jobs.clone(), sources);
                    rt.block_on(async {
                        for slug in &slugs {
                            enqueuer.enqueue(slug, Vec::new()).await.expect("enqueue");
                        }
                        while let Some(job) =
                            jobs.claim_next(JobType::RefreshViews).await.expect("claim")
                        {
                            jobs.complete(&job, None).await.expect("complete");
                        }
                    });
                    black_box(jobs)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_coalesced_burst, bench_claim_complete_cycle);
criterion_main!(benches);
