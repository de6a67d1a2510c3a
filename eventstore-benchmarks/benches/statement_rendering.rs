use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use eventstore::handler::{
    add_create_statement, add_delete_statement, add_update_statement, new_array_append_col,
    new_create_statement, new_multi_statement, new_upsert_statement, Column, Condition,
};
use eventstore::{Aggregate, BaseEvent, Columns, Event, RawEvent, SearchQueryBuilder};
use rand::Rng;
use std::hint::black_box;

fn event(sequence: u64, aggregate_type: &str, event_type: &str) -> BaseEvent {
    BaseEvent::from_raw(RawEvent {
        aggregate: Aggregate::new(format!("a{sequence}"), aggregate_type, "v1")
            .with_instance_id("instance")
            .with_resource_owner("org"),
        event_type: event_type.into(),
        sequence,
        previous_aggregate_sequence: 0,
        previous_aggregate_type_sequence: sequence.saturating_sub(1),
        creation_date: Utc::now(),
        editor_user: "editor".to_string(),
        editor_service: "bench".to_string(),
        payload: None,
    })
}

/// Benchmark rendering of the statement kinds projections produce most
fn bench_render(c: &mut Criterion) {
    let event = event(42, "user", "user.added");
    let mut group = c.benchmark_group("statement_render");

    let create = new_create_statement(
        &event,
        vec![
            Column::new("id", &event.aggregate().id),
            Column::new("instance_id", &event.aggregate().instance_id),
            Column::new("sequence", event.sequence()),
            Column::new("username", "ada"),
        ],
    );
    group.bench_function("create", |b| {
        b.iter(|| black_box(create.render("projections.users").unwrap()));
    });

    let upsert = new_upsert_statement(
        &event,
        &[Column::named("instance_id"), Column::named("id")],
        vec![
            Column::new("instance_id", &event.aggregate().instance_id),
            Column::new("id", &event.aggregate().id),
            Column::new("username", "ada"),
        ],
    );
    group.bench_function("upsert", |b| {
        b.iter(|| black_box(upsert.render("projections.users").unwrap()));
    });

    for operations in [2_usize, 8, 32] {
        let multi = new_multi_statement(
            &event,
            (0..operations)
                .map(|i| match i % 3 {
                    0 => add_create_statement(vec![Column::new("id", format!("id-{i}"))]),
                    1 => add_update_statement(
                        vec![new_array_append_col("roles", format!("role-{i}"))],
                        vec![Condition::equals("id", format!("id-{i}"))],
                    ),
                    _ => add_delete_statement(vec![Condition::equals("id", format!("id-{i}"))]),
                })
                .collect(),
        );
        group.throughput(Throughput::Elements(operations as u64));
        group.bench_with_input(BenchmarkId::new("multi", operations), &multi, |b, multi| {
            b.iter(|| black_box(multi.render("projections.users").unwrap()));
        });
    }
    group.finish();
}

/// Benchmark evaluating subscription searches against pushed events
fn bench_search_matches(c: &mut Criterion) {
    let mut rng = rand::rng();
    let events: Vec<BaseEvent> = (1..=1_000)
        .map(|sequence| {
            let aggregate_type = if rng.random_range(0..4) == 0 { "org" } else { "user" };
            event(sequence, aggregate_type, &format!("{aggregate_type}.changed"))
        })
        .collect();

    let mut group = c.benchmark_group("search_matches");
    group.throughput(Throughput::Elements(events.len() as u64));
    for groups in [1_usize, 4, 16] {
        let mut builder = SearchQueryBuilder::new(Columns::Event).add_query();
        for i in 1..groups {
            builder = builder
                .aggregate_types([format!("type-{i}")])
                .event_types([format!("type-{i}.changed")])
                .or();
        }
        let search = builder
            .aggregate_types(["user"])
            .event_types(["user.changed"])
            .builder();

        group.bench_with_input(BenchmarkId::new("or_groups", groups), &search, |b, search| {
            b.iter(|| {
                events
                    .iter()
                    .filter(|event| search.matches(*event, 0))
                    .count()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_render, bench_search_matches);
criterion_main!(benches);
