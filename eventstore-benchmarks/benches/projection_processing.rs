use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use eventstore::handler::{
    new_create_statement, AggregateReducer, Column, EventReducer, Projection, ProjectionHandler,
};
use eventstore::{
    BaseEvent, BulkLimit, Command, EventCommand, Eventstore, HandlerConfig, InstanceId,
};
use eventstore_benchmarks::user_added;
use eventstore_memory::{InMemoryProjectionStore, InMemoryRepository};
use std::hint::black_box;
use std::sync::Arc;
use tokio::runtime::Runtime;

struct UsersProjection;

impl Projection for UsersProjection {
    fn name(&self) -> &str {
        "users"
    }

    fn reducers(&self) -> Vec<AggregateReducer> {
        vec![AggregateReducer::new(
            "user",
            vec![EventReducer::new("user.added", |event| {
                Ok(new_create_statement(
                    event,
                    vec![
                        Column::new("id", &event.aggregate().id),
                        Column::new("sequence", event.sequence()),
                    ],
                ))
            })],
        )]
    }
}

/// Benchmark a full catch-up over a populated log for several bulk limits
fn bench_catch_up(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let eventstore = Arc::new(Eventstore::new(Arc::new(InMemoryRepository::new())));
    eventstore.register_filter_event_mapper("user.added", BaseEvent::mapper());
    let event_count = 1_000_u64;
    rt.block_on(async {
        let commands: Vec<EventCommand> = (0..event_count)
            .map(|i| user_added("bench", &format!("u{i}")))
            .collect();
        let commands: Vec<&dyn Command> =
            commands.iter().map(|command| command as &dyn Command).collect();
        eventstore.push(&commands).await.unwrap();
    });
    let instance = InstanceId::from("bench");

    let mut group = c.benchmark_group("projection_catch_up");
    group.throughput(Throughput::Elements(event_count));
    group.sample_size(20);
    for bulk_limit in [50_u64, 200, 1_000] {
        group.bench_with_input(
            BenchmarkId::new("bulk_limit", bulk_limit),
            &bulk_limit,
            |b, &bulk_limit| {
                b.to_async(&rt).iter(|| async {
                    let handler = ProjectionHandler::new(
                        &UsersProjection,
                        Arc::clone(&eventstore),
                        Arc::new(InMemoryProjectionStore::new()),
                        HandlerConfig::default()
                            .with_bulk_limit(BulkLimit::try_new(bulk_limit).unwrap()),
                    );
                    black_box(handler.trigger(&instance).await.unwrap())
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_catch_up);
criterion_main!(benches);
