//! End-to-end tests: listener thread -> SPSC queues -> dispatch thread.
//!
//! # Running with tracing
//!
//! ```bash
//! cargo test --features tracing --test pipeline -- --nocapture
//! RUST_LOG=weir=debug cargo test --features tracing --test pipeline -- --nocapture
//! ```

use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use weir::sync::spsc::{self, Consumer, Producer};
use weir::{DispatchLoop, EventScheduler, Listener, Message, MessageHandler};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        weir::init_tracing();
    });
}

#[derive(Debug, Default)]
struct Item {
    seq: u64,
    source: usize,
    /// `false` only for the retained-slot sentinel.
    live: bool,
}

impl Message for Item {
    fn set_source(&mut self, index: usize) {
        self.source = index;
    }

    fn safe_to_reclaim(&self) -> bool {
        self.live
    }
}

/// Emits sequence numbers up to whatever the test has released so far.
struct Feed<const N: usize> {
    tx: Producer<Item, N>,
    next: u64,
    released: Arc<AtomicU64>,
}

impl<const N: usize> Feed<N> {
    fn new(tx: Producer<Item, N>, released: &Arc<AtomicU64>) -> Self {
        Self {
            tx,
            next: 0,
            released: Arc::clone(released),
        }
    }
}

impl<const N: usize> Listener for Feed<N> {
    fn timeout(&self) -> Duration {
        Duration::from_millis(2)
    }

    fn poll(&mut self) -> usize {
        let limit = self.released.load(Ordering::Acquire);
        let mut pushed = 0;
        while self.next < limit && pushed < 32 {
            let item = Item {
                seq: self.next,
                source: usize::MAX,
                live: true,
            };
            if self.tx.push(item).is_err() {
                break;
            }
            self.next += 1;
            pushed += 1;
        }
        pushed
    }

    fn poll_timeout(&mut self, timeout: Duration) -> usize {
        let pushed = self.poll();
        if pushed > 0 {
            return pushed;
        }
        thread::sleep(timeout);
        self.poll()
    }
}

/// Checks per-source FIFO and counts what it saw.
struct Ledger {
    next: Vec<u64>,
    reclaimed: u64,
    received: Arc<AtomicU64>,
}

impl Ledger {
    fn new(sources: usize, received: &Arc<AtomicU64>) -> Self {
        Self {
            next: vec![0; sources],
            reclaimed: 0,
            received: Arc::clone(received),
        }
    }
}

impl MessageHandler<Item> for Ledger {
    fn handle(&mut self, msg: &mut Item) {
        assert_eq!(msg.seq, self.next[msg.source], "source {} out of order", msg.source);
        self.next[msg.source] += 1;
        self.received.fetch_add(1, Ordering::Release);
    }

    fn reclaim(&mut self, _msg: Item) {
        self.reclaimed += 1;
    }
}

fn wait_for(counter: &AtomicU64, target: u64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while counter.load(Ordering::Acquire) < target {
        assert!(
            Instant::now() < deadline,
            "stalled at {} of {target}",
            counter.load(Ordering::Acquire)
        );
        thread::sleep(Duration::from_millis(1));
    }
}

struct Pipeline<const N: usize> {
    scheduler: EventScheduler<Feed<N>>,
    dispatch: DispatchLoop<Item, Consumer<Item, N>, Ledger>,
    released: Vec<Arc<AtomicU64>>,
    received: Arc<AtomicU64>,
}

impl<const N: usize> Pipeline<N> {
    fn build(sources: usize) -> Self {
        let received = Arc::new(AtomicU64::new(0));
        let mut dispatch = DispatchLoop::new(sources, Ledger::new(sources, &received));
        let handshake = dispatch.handshake();
        let mut scheduler = EventScheduler::new(sources);

        let mut released = Vec::new();
        for index in 0..sources {
            let (tx, rx) = spsc::channel::<Item, N>();
            let budget = Arc::new(AtomicU64::new(0));
            dispatch.register(index, rx);
            scheduler.register(index, Feed::new(tx, &budget), Arc::clone(&handshake));
            released.push(budget);
        }

        Self {
            scheduler,
            dispatch,
            released,
            received,
        }
    }

    fn start(&mut self) {
        self.dispatch.start().unwrap();
        self.scheduler.start().unwrap();
    }

    /// Lets every source emit `count` more items.
    fn release(&self, count: u64) {
        for budget in &self.released {
            budget.fetch_add(count, Ordering::Release);
        }
    }

    fn stop(&mut self) {
        self.scheduler.stop().unwrap();
        self.dispatch.stop().unwrap();
    }
}

#[test]
fn per_source_order_survives_the_pipeline() {
    init_test_tracing();

    const PER_SOURCE: u64 = 50_000;
    let mut pipeline = Pipeline::<256>::build(3);
    pipeline.start();
    pipeline.release(PER_SOURCE);
    wait_for(&pipeline.received, 3 * PER_SOURCE);
    pipeline.stop();

    let stats = pipeline.dispatch.stats().unwrap();
    assert_eq!(stats.dispatched, 3 * PER_SOURCE);

    let ledger = pipeline.dispatch.handler().unwrap();
    assert_eq!(ledger.next, vec![PER_SOURCE; 3]);
    // the last message of each source stays retained
    assert_eq!(ledger.reclaimed, 3 * PER_SOURCE - 3);

    let listener = pipeline.scheduler.stats().unwrap();
    assert_eq!(listener.events, 3 * PER_SOURCE);
}

#[test]
fn dispatch_parks_between_bursts_and_wakes_for_the_next() {
    init_test_tracing();

    const BURST: u64 = 200;
    const BURSTS: u64 = 5;
    let mut pipeline = Pipeline::<64>::build(2);
    pipeline.start();

    for burst in 1..=BURSTS {
        pipeline.release(BURST);
        wait_for(&pipeline.received, 2 * BURST * burst);
        thread::sleep(Duration::from_millis(20));
    }
    pipeline.stop();

    let stats = pipeline.dispatch.stats().unwrap();
    assert_eq!(stats.dispatched, 2 * BURST * BURSTS);
    assert!(stats.parks >= BURSTS, "parks: {}", stats.parks);

    let ledger = pipeline.dispatch.handler().unwrap();
    assert_eq!(ledger.next, vec![BURST * BURSTS; 2]);
}

#[test]
fn small_queues_apply_backpressure_without_loss() {
    init_test_tracing();

    const PER_SOURCE: u64 = 2_000;
    let mut pipeline = Pipeline::<8>::build(2);
    pipeline.start();
    pipeline.release(PER_SOURCE);
    wait_for(&pipeline.received, 2 * PER_SOURCE);
    pipeline.stop();

    let ledger = pipeline.dispatch.handler().unwrap();
    assert_eq!(ledger.next, vec![PER_SOURCE; 2]);
}

#[test]
fn idle_pipeline_stops_promptly() {
    init_test_tracing();

    let mut pipeline = Pipeline::<16>::build(2);
    pipeline.start();
    thread::sleep(Duration::from_millis(30));

    let started = Instant::now();
    pipeline.stop();
    assert!(started.elapsed() < Duration::from_secs(1));

    let listener = pipeline.scheduler.stats().unwrap();
    assert_eq!(listener.events, 0);
    assert!(listener.timed_polls > 0);
    assert_eq!(pipeline.dispatch.stats().unwrap().dispatched, 0);
}
