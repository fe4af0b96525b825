//! Hot path benchmarks for the credit ledger.
//!
//! Run with: `cargo bench --bench ledger_paths`
//!
//! Measures the synchronous core every request and response passes through:
//! accept, settle, action parsing and model conformance stepping.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use credit_flow::model::ConformanceMonitor;
use credit_flow::protocol::{Command, GrantMode, ProtocolAction, RequestId, ResponseStatus};
use credit_flow::server::Ledger;
use credit_flow::CreditFlowModel;

/// Active ledger holding `credits` spare ids.
fn active_ledger(mode: GrantMode, credits: u32, journal: bool) -> Ledger {
    let mut ledger = Ledger::new(mode.build(7), journal);
    let entry = ledger
        .accept(Command::Setup, RequestId(0), credits)
        .expect("setup accepted");
    ledger
        .settle(RequestId(0), entry.sequence, ResponseStatus::Completed)
        .expect("setup settled");
    ledger
}

/// One Work request accepted and completed, recycling the credit it used.
fn bench_accept_settle(c: &mut Criterion) {
    let mut group = c.benchmark_group("accept_settle");
    group.throughput(Throughput::Elements(1));

    for (name, mode) in [("full", GrantMode::Full), ("clamped", GrantMode::Clamped)] {
        for journal in [false, true] {
            group.bench_function(format!("{}_journal_{}", name, journal), |b| {
                let mut ledger = active_ledger(mode, 1, journal);
                b.iter(|| {
                    let id = ledger.snapshot().window.first().copied().expect("credit");
                    let entry = ledger.accept(Command::Work, id, 1).expect("accepted");
                    black_box(
                        ledger
                            .settle(id, entry.sequence, ResponseStatus::Completed)
                            .expect("settled"),
                    );
                    if journal {
                        ledger.take_journal();
                    }
                })
            });
        }
    }

    group.finish();
}

/// Cancel marking and the losing side of the race.
fn bench_cancel_race(c: &mut Criterion) {
    let mut group = c.benchmark_group("cancel_race");
    group.throughput(Throughput::Elements(1));

    group.bench_function("cancel_then_stale_complete", |b| {
        let mut ledger = active_ledger(GrantMode::Full, 1, false);
        b.iter(|| {
            let id = ledger.snapshot().window.first().copied().expect("credit");
            let entry = ledger.accept(Command::Work, id, 1).expect("accepted");
            ledger.mark_cancel_requested(id).expect("marked");
            ledger
                .settle(id, entry.sequence, ResponseStatus::Cancelled)
                .expect("cancelled");
            black_box(
                ledger
                    .settle(id, entry.sequence, ResponseStatus::Completed)
                    .expect("stale"),
            );
        })
    });

    group.finish();
}

fn bench_parse_action(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_action");
    group.throughput(Throughput::Elements(1));

    for line in ["ReqWork(42,3)", "ResSetup(0,3,Completed)", "Cancel(7)"] {
        group.bench_function(line, |b| {
            b.iter(|| black_box(line).parse::<ProtocolAction>().expect("valid"))
        });
    }

    group.finish();
}

/// Monitor replay of a journal captured from a busy session.
fn bench_conformance_replay(c: &mut Criterion) {
    let mut ledger = active_ledger(GrantMode::Full, 1, true);
    for _ in 0..256 {
        let id = ledger.snapshot().window.first().copied().expect("credit");
        let entry = ledger.accept(Command::Work, id, 1).expect("accepted");
        ledger
            .settle(id, entry.sequence, ResponseStatus::Completed)
            .expect("settled");
    }
    let journal = ledger.take_journal();

    let mut group = c.benchmark_group("conformance");
    group.throughput(Throughput::Elements(journal.len() as u64));
    group.bench_function("replay_journal", |b| {
        b.iter(|| {
            let mut monitor = ConformanceMonitor::new(CreditFlowModel::new());
            monitor.replay(black_box(&journal)).expect("conforms");
            black_box(monitor.steps())
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_accept_settle,
    bench_cancel_race,
    bench_parse_action,
    bench_conformance_replay
);
criterion_main!(benches);
