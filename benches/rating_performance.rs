//! Performance benchmarks for rating calculations and queue scans

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use pairing_room::clock::SystemClock;
use pairing_room::config::AppConfig;
use pairing_room::questions::UnassignedQuestionBank;
use pairing_room::queue::compatibility::is_compatible;
use pairing_room::rating::rate_participant;
use pairing_room::service::{AppState, Dependencies};
use pairing_room::store::InMemoryCoordinationStore;
use pairing_room::types::{Difficulty, JoinRequest, ParticipantMetrics, UserEloInfo, WaitEntry};
use std::sync::Arc;

const CATEGORIES: [&str; 4] = ["arrays", "graphs", "dp", "strings"];

fn wait_entries(count: usize) -> Vec<WaitEntry> {
    let now = Utc::now();
    (0..count)
        .map(|i| WaitEntry {
            user_id: format!("user-{}", i),
            category: CATEGORIES[i % CATEGORIES.len()].to_string(),
            difficulty: Difficulty::Medium,
            accept_any_category: i % 7 == 0,
            elo_rating: 1200.0 + (i % 60) as f64 * 10.0,
            enqueued_at: now,
        })
        .collect()
}

fn bench_rating_calculations(c: &mut Criterion) {
    let player = UserEloInfo {
        user_id: "player".to_string(),
        elo_rating: 1580.0,
        sessions_completed: 12,
    };
    let opponent = UserEloInfo {
        user_id: "opponent".to_string(),
        elo_rating: 1490.0,
        sessions_completed: 2,
    };
    let metrics = ParticipantMetrics {
        voice_used: true,
        voice_duration_sec: 900,
        code_changes: 42,
        messages_exchanged: 18,
    };

    c.bench_function("rate_participant", |b| {
        b.iter(|| {
            black_box(rate_participant(
                black_box(&player),
                black_box(&opponent),
                black_box(&metrics),
                1800,
                "hard",
            ))
        })
    });
}

fn bench_compatibility_scan(c: &mut Criterion) {
    let entries = wait_entries(500);

    c.bench_function("compatibility_scan_500", |b| {
        b.iter(|| {
            let mut compatible = 0usize;
            for candidate in &entries {
                for stage in 1..=4u8 {
                    if entries
                        .iter()
                        .any(|other| is_compatible(candidate, other, stage))
                    {
                        compatible += 1;
                        break;
                    }
                }
            }
            black_box(compatible)
        })
    });
}

fn bench_matchmaking_tick(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("matchmaking_tick_200_users", |b| {
        b.iter_batched(
            || {
                rt.block_on(async {
                    let state = AppState::with_dependencies(
                        AppConfig::default(),
                        Dependencies {
                            store: Arc::new(InMemoryCoordinationStore::new()),
                            clock: Arc::new(SystemClock),
                            question_bank: Arc::new(UnassignedQuestionBank),
                            rating_mirror: None,
                            amqp_connection: None,
                        },
                    )
                    .unwrap();
                    for i in 0..200 {
                        state
                            .queue()
                            .enqueue(JoinRequest {
                                user_id: format!("user-{}", i),
                                category: CATEGORIES[i % CATEGORIES.len()].to_string(),
                                difficulty: Difficulty::Medium,
                                accept_any_category: false,
                            })
                            .await
                            .unwrap();
                    }
                    state.matchmaking_loop()
                })
            },
            |matchmaker| rt.block_on(async { black_box(matchmaker.tick().await.unwrap()) }),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_rating_calculations,
    bench_compatibility_scan,
    bench_matchmaking_tick
);
criterion_main!(benches);
