//! End-to-end pipeline throughput and latency benchmark.
//!
//! Two synthetic listeners feed one dispatch loop through SPSC queues.
//!
//! Usage:
//!     cargo run --release --bin pipeline_bench
//!     cargo run --release --features tracing --bin pipeline_bench
//!
//! Environment variables:
//!     LISTENER_CPU=0     Pin the listener thread (default: auto placement)
//!     DISPATCH_CPU=2     Pin the dispatch thread (default: auto placement)
//!     WEIR_EVENTS=N      Events per listener (default: 4194304)

use std::env;
use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use minstant::Instant;
use weir::sync::spsc::{self, Consumer, Producer};
use weir::topology::CpuConfig;
use weir::{
    DispatchConfig, DispatchLoop, EventScheduler, Listener, Message, MessageHandler,
    SchedulerConfig,
};

const QUEUE_SIZE: usize = 1 << 12;
const LISTENERS: usize = 2;
const BURST: u64 = 64;
const DEFAULT_EVENTS: u64 = 1 << 22;

#[derive(Debug, Default)]
struct Tick {
    seq: u64,
    source: usize,
    sent: Option<Instant>,
}

impl Message for Tick {
    fn set_source(&mut self, index: usize) {
        self.source = index;
    }

    fn safe_to_reclaim(&self) -> bool {
        true
    }
}

/// Emits `remaining` ticks in bursts, as fast as the queue accepts them.
struct Generator {
    tx: Producer<Tick, QUEUE_SIZE>,
    next: u64,
    remaining: u64,
}

impl Listener for Generator {
    fn timeout(&self) -> Duration {
        Duration::from_millis(1)
    }

    fn poll(&mut self) -> usize {
        let mut pushed = 0;
        while pushed < BURST && self.remaining > 0 {
            let tick = Tick {
                seq: self.next,
                source: usize::MAX,
                sent: Some(Instant::now()),
            };
            if self.tx.push(tick).is_err() {
                break;
            }
            self.next += 1;
            self.remaining -= 1;
            pushed += 1;
        }
        pushed as usize
    }

    fn poll_timeout(&mut self, timeout: Duration) -> usize {
        let pushed = self.poll();
        if pushed == 0 && self.remaining == 0 {
            thread::sleep(timeout);
        }
        pushed
    }
}

struct Meter {
    expected: [u64; LISTENERS],
    latency_ns: u128,
    received: Arc<AtomicU64>,
}

impl MessageHandler<Tick> for Meter {
    fn handle(&mut self, msg: &mut Tick) {
        let expected = &mut self.expected[msg.source];
        if msg.seq != *expected {
            panic!("queue {}: expected {}, got {}", msg.source, expected, msg.seq);
        }
        *expected += 1;

        if let Some(sent) = msg.sent {
            self.latency_ns += sent.elapsed().as_nanos();
        }
        self.received.fetch_add(1, Ordering::Release);
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.parse().ok())
}

fn cpu_config() -> CpuConfig {
    let listener_core = env_parse("LISTENER_CPU");
    let dispatch_core = env_parse("DISPATCH_CPU");
    if listener_core.is_none() && dispatch_core.is_none() {
        CpuConfig::Auto
    } else {
        CpuConfig::Manual {
            listener_core,
            dispatch_core,
        }
    }
}

fn main() {
    weir::init_tracing();

    let events: u64 = env_parse("WEIR_EVENTS").unwrap_or(DEFAULT_EVENTS);
    let placement = cpu_config().resolve();
    println!(
        "weir pipeline (listeners={}, queue={}, events/listener={}, placement={} {:?}/{:?}):",
        LISTENERS, QUEUE_SIZE, events, placement.strategy, placement.listener_core,
        placement.dispatch_core
    );

    let received = Arc::new(AtomicU64::new(0));
    let mut dispatch: DispatchLoop<Tick, Consumer<Tick, QUEUE_SIZE>, Meter> =
        DispatchLoop::with_handshake(
            LISTENERS,
            Meter {
                expected: [0; LISTENERS],
                latency_ns: 0,
                received: Arc::clone(&received),
            },
            weir::ParkingHandshake::new(),
            DispatchConfig {
                core: placement.dispatch_core,
                ..DispatchConfig::default()
            },
        );
    let handshake = dispatch.handshake();

    let mut scheduler = EventScheduler::with_config(
        LISTENERS,
        SchedulerConfig {
            core: placement.listener_core,
            ..SchedulerConfig::default()
        },
    );
    for index in 0..LISTENERS {
        let (tx, rx) = spsc::channel::<Tick, QUEUE_SIZE>();
        dispatch.register(index, rx);
        scheduler.register(
            index,
            Generator {
                tx,
                next: 0,
                remaining: events,
            },
            Arc::clone(&handshake),
        );
    }

    dispatch.start().expect("failed to start dispatch loop");
    let start = Instant::now();
    scheduler.start().expect("failed to start scheduler");

    let total = events * LISTENERS as u64;
    while received.load(Ordering::Acquire) < total {
        hint::spin_loop();
        thread::yield_now();
    }
    let elapsed = start.elapsed();

    scheduler.stop().expect("scheduler thread panicked");
    dispatch.stop().expect("dispatch thread panicked");

    let meter = dispatch.handler().expect("dispatch loop stopped");
    let ops_per_ms = u128::from(total) * 1_000_000 / elapsed.as_nanos().max(1);
    let mean_latency = meter.latency_ns / u128::from(total.max(1));
    println!("{ops_per_ms} msgs/ms");
    println!("{mean_latency} ns mean enqueue-to-handle latency");

    if let Some(stats) = scheduler.stats() {
        println!("listener: {stats:?}");
    }
    if let Some(stats) = dispatch.stats() {
        println!("dispatch: {stats:?}");
    }
}
