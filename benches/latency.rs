//! Latency benchmarks for the signal hot path.
//!
//! Run with: `cargo bench --bench latency`

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rust_decimal::Decimal;
use serde_json::json;

use risk_manager::{evaluate, RiskLimits, TradeContext};
use signal_core::types::{
    IdempotencyKey, ModeState, RiskState, Signal, SignalAction, SignalSource,
};
use trading_engine::{parse_signal, RecentSignalCache};

fn sample_signal(symbol: &str) -> Signal {
    Signal::new(
        SignalSource::Webhook,
        symbol,
        SignalAction::Buy,
        Decimal::new(15050, 2),
        Decimal::ONE,
        "Test",
        Utc::now(),
        serde_json::Value::Null,
        60,
    )
}

/// Benchmark idempotency key derivation (SHA-256 over the signal identity).
fn bench_idempotency_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("idempotency_key");
    let now = Utc::now();

    for strategy_len in [4, 32, 256].iter() {
        let strategy = "s".repeat(*strategy_len);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::new("derive", strategy_len),
            &strategy,
            |b, strategy| {
                b.iter(|| {
                    black_box(IdempotencyKey::derive(
                        SignalSource::Webhook,
                        black_box("AAPL"),
                        SignalAction::Buy,
                        black_box(strategy),
                        now,
                        60,
                    ))
                })
            },
        );
    }

    group.finish();
}

/// Benchmark payload normalization into a Signal.
fn bench_payload_normalization(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload_normalization");
    let now = Utc::now();

    let numeric = json!({
        "symbol": "AAPL",
        "action": "BUY",
        "price": 150.50,
        "strategy": "Test"
    });
    let stringly = json!({
        "symbol": " aapl ",
        "action": "buy",
        "price": "150.50",
        "strategy": "Test",
        "confidence": "0.8"
    });

    group.throughput(Throughput::Elements(1));
    group.bench_function("numeric_price", |b| {
        b.iter(|| black_box(parse_signal(black_box(&numeric), SignalSource::Webhook, now, 60)))
    });
    group.bench_function("string_fields", |b| {
        b.iter(|| black_box(parse_signal(black_box(&stringly), SignalSource::Webhook, now, 60)))
    });

    group.finish();
}

/// Benchmark pure risk evaluation against a ledger with open holdings.
fn bench_risk_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("risk_evaluation");
    let limits = RiskLimits::default();
    let mode = ModeState::default();
    let signal = sample_signal("AAPL");

    let ctx = TradeContext {
        quantity: Decimal::new(13289, 4),
        notional: Decimal::new(13289, 4) * Decimal::new(15050, 2),
        available_capital: Decimal::from(10_000),
        market_price: Some(Decimal::new(15040, 2)),
        position_quantity: Decimal::ZERO,
    };

    for exposure in [0i64, 10, 24].iter() {
        let mut state = RiskState::new(Decimal::from(10_000), Utc::now().date_naive());
        state.open_exposure_pct = Decimal::from(*exposure);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::new("entry", exposure),
            &state,
            |b, state| {
                b.iter(|| {
                    black_box(evaluate(
                        black_box(&signal),
                        black_box(state),
                        &mode,
                        &ctx,
                        &limits,
                    ))
                })
            },
        );
    }

    group.finish();
}

/// Benchmark the dedup cache check on fresh and repeated keys.
fn bench_dedup_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup_cache");
    let cache = RecentSignalCache::new(300, 10_000);
    let repeated = IdempotencyKey::from_raw("repeated");
    let now = Utc::now();
    cache.check_and_insert(&repeated, now);

    group.bench_function("repeated_key", |b| {
        b.iter(|| black_box(cache.check_and_insert(black_box(&repeated), now)))
    });

    let mut n = 0u64;
    group.bench_function("fresh_key", |b| {
        b.iter(|| {
            n += 1;
            let key = IdempotencyKey::from_raw(format!("key-{}", n));
            black_box(cache.check_and_insert(&key, now))
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_idempotency_key,
    bench_payload_normalization,
    bench_risk_evaluation,
    bench_dedup_cache,
);

criterion_main!(benches);
