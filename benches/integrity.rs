//! Performance benchmarks for audit-pipeline
//!
//! Run with: cargo bench

use audit_pipeline::{
    integrity, AuditEvent, DataClassification, DurableQueue, EventStatus, MemoryQueue,
};
use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::Arc;

fn sample_event() -> AuditEvent {
    AuditEvent::new(
        "2026-03-01T10:15:00Z",
        "fhir.patient.read",
        EventStatus::Success,
    )
    .with_principal("user-42")
    .with_organization("org-acme")
    .with_target("Patient", "pat-100")
    .with_classification(DataClassification::Phi)
    .with_detail("recordCount", serde_json::json!(1))
    .with_detail("endpoint", serde_json::json!("/fhir/Patient/pat-100"))
}

fn bench_event_creation(c: &mut Criterion) {
    c.bench_function("AuditEvent::new", |b| {
        b.iter(|| {
            AuditEvent::new(
                "2026-03-01T10:15:00Z",
                "auth.login.success",
                EventStatus::Success,
            )
        });
    });

    c.bench_function("AuditEvent builder chain", |b| {
        b.iter(sample_event);
    });
}

fn bench_event_serialization(c: &mut Criterion) {
    let event = sample_event();

    c.bench_function("AuditEvent serialize", |b| {
        b.iter(|| serde_json::to_vec(&event).unwrap());
    });

    let bytes = serde_json::to_vec(&event).unwrap();
    c.bench_function("AuditEvent deserialize", |b| {
        b.iter(|| serde_json::from_slice::<AuditEvent>(&bytes).unwrap());
    });
}

fn bench_integrity(c: &mut Criterion) {
    let event = sample_event();

    c.bench_function("generate_event_hash", |b| {
        b.iter(|| integrity::generate_event_hash(&event).unwrap());
    });

    let sealed = integrity::seal_event(sample_event()).unwrap();
    let hash = sealed.hash.clone().unwrap();
    c.bench_function("verify_event_hash", |b| {
        b.iter(|| integrity::verify_event_hash(&sealed, &hash).unwrap());
    });

    c.bench_function("seal_event", |b| {
        b.iter(|| integrity::seal_event(sample_event()).unwrap());
    });
}

fn bench_seal_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("seal_throughput");
    for count in [10, 100, 1000] {
        group.bench_function(format!("{} events", count), |b| {
            b.iter(|| {
                for i in 0..count {
                    let event = sample_event().with_detail("i", serde_json::json!(i));
                    integrity::seal_event(event).unwrap();
                }
            });
        });
    }
    group.finish();
}

fn bench_queue_cycle(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let queue = Arc::new(MemoryQueue::with_defaults());

    c.bench_function("enqueue/dequeue/ack cycle", |b| {
        b.to_async(&rt).iter(|| {
            let queue = queue.clone();
            async move {
                let event = sample_event();
                queue.enqueue("bench", &event).await.unwrap();
                let delivery = queue.dequeue("bench").await.unwrap().unwrap();
                queue.ack("bench", &delivery.token).await.unwrap();
            }
        });
    });
}

criterion_group!(
    benches,
    bench_event_creation,
    bench_event_serialization,
    bench_integrity,
    bench_seal_throughput,
    bench_queue_cycle,
);
criterion_main!(benches);
