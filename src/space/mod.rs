//! The in-memory, concurrent signal chain.
//!
//! A [`Space`] is a circular, append-only chain of [`Signal`]s anchored by a permanent root
//! record. Producers append via [`Space::send`]; consumers replay via [`Space::scan`], optionally
//! resuming from a named state; [`Space::drop_expired`] prunes signals older than a retention
//! window in bulk.

mod pool;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::clock::Clock;
use pool::{Pool, Slot};

/// Index of the permanent root signal. Never returned to the pool.
const ROOT: usize = 0;

/// The concurrent, circular, append-only signal chain plus its pooled allocation, named-state
/// registry, retention/drop engine and monotonic operation counter.
pub struct Space {
    clock: Clock,
    clock_task: JoinHandle<()>,
    chain: RwLock<Chain>,
    states: RwLock<HashMap<Vec<u8>, usize>>,
    ops: AtomicU64,
    count: AtomicU64,
    alloc: AtomicU64,
}

/// The chain itself: the signal arena, its free-list and the current tail.
struct Chain {
    arena: Vec<Slot>,
    pool: Pool,
    head: usize,
}

impl Chain {
    fn new() -> Self {
        // the root is its own cycle of one until the first signal is appended
        Self { arena: vec![Slot { time: i64::MAX, data: None, next: ROOT }], pool: Pool::default(), head: ROOT }
    }
}

// === impl Space ===

impl Space {
    /// Creates a new, empty space and starts its internal clock.
    ///
    /// Does not return until the clock has ticked at least once, guaranteeing any `send` issued
    /// right after this call observes a non-zero timestamp.
    pub async fn new() -> Arc<Self> {
        let (clock, clock_task) = Clock::spawn().await;

        Arc::new(Self {
            clock,
            clock_task,
            chain: RwLock::new(Chain::new()),
            states: RwLock::new(HashMap::new()),
            ops: AtomicU64::new(0),
            count: AtomicU64::new(0),
            alloc: AtomicU64::new(0),
        })
    }

    /// The monotonic operation counter, usable by callers as a logical timestamp.
    pub fn ops(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }

    /// Number of currently live signals.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of `len(data)` over currently live signals.
    pub fn alloc(&self) -> u64 {
        self.alloc.load(Ordering::Relaxed)
    }

    /// The space's cached wall time, in milliseconds.
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Appends `data` (1..=1024 bytes, policed by the caller) to the chain.
    ///
    /// O(1): the locked region contains only the pool acquisition and two pointer writes, no
    /// traversal. Returns the new `ops` value.
    pub fn send(&self, data: Vec<u8>) -> u64 {
        let time = self.clock.now_ms();
        let len = data.len() as u64;

        {
            let mut chain = self.chain.write();
            let idx = chain.pool.acquire(&mut chain.arena, ROOT, time, data);
            let head = chain.head;
            chain.arena[head].next = idx;
            chain.head = idx;
        }

        self.alloc.fetch_add(len, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.ops.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Replays signals in arrival order to `sink`, optionally resuming from (and persisting to)
    /// a named state.
    ///
    /// `state_key` semantics:
    ///   - `None` — scan from the oldest live signal; no state is recorded.
    ///   - starts with `!` — fork: resume from the state named by the remainder, persist the
    ///     result under the full (`!`-prefixed) name.
    ///   - otherwise — resume from, and persist to, the state named `state_key`.
    ///
    /// The chain read lock is held only for the O(n) walk that clones live payloads into a
    /// local buffer; it is released before any payload reaches `sink`, so a slow consumer
    /// cannot stall concurrent `send`/`drop_expired` calls.
    ///
    /// Never errors: an oversize payload never enters the space.
    pub async fn scan(&self, sink: mpsc::Sender<Vec<u8>>, state_key: Option<Vec<u8>>) -> u64 {
        let lookup: Option<&[u8]> = state_key.as_deref().map(|k| k.strip_prefix(b"!").unwrap_or(k));

        let prev = if let Some(lookup) = lookup {
            self.states.read().get(lookup).copied()
        } else {
            None
        };

        let payloads = {
            let chain = self.chain.read();

            let prev = match prev {
                Some(idx) if chain.arena[idx].data.is_some() => idx,
                _ => ROOT,
            };

            let head = chain.head;

            let payloads = if prev == head {
                Vec::new()
            } else {
                let mut out = Vec::new();
                let mut x = chain.arena[prev].next;
                while x != ROOT {
                    if let Some(data) = &chain.arena[x].data {
                        out.push(data.clone());
                    }
                    x = chain.arena[x].next;
                }
                out
            };

            if let Some(key) = state_key {
                self.states.write().insert(key, head);
            }

            payloads
        };

        for payload in payloads {
            if sink.send(payload).await.is_err() {
                trace!(target: "space", "scan sink closed early");
                break;
            }
        }

        self.ops()
    }

    /// Drops every signal with `time < now - retention_ms` in bulk. A non-positive
    /// `retention_ms` drops everything currently in the chain.
    ///
    /// Returns the new `ops` value (unchanged unless at least one signal was removed).
    pub fn drop_expired(&self, retention_ms: i64) -> u64 {
        let threshold = self.clock.now_ms().saturating_sub(retention_ms);

        let mut removed = 0u64;
        let mut removed_bytes = 0u64;

        {
            let mut chain = self.chain.write();
            let mut x = chain.arena[ROOT].next;

            while x != ROOT && threshold > chain.arena[x].time {
                removed_bytes += chain.arena[x].data.as_ref().map(Vec::len).unwrap_or(0) as u64;
                removed += 1;

                let next = chain.arena[x].next;
                let (arena, pool) = (&mut chain.arena, &mut chain.pool);
                pool.release(arena, ROOT, x);
                x = next;
            }

            if chain.arena[chain.head].data.is_none() {
                chain.head = ROOT;
            }

            chain.arena[ROOT].next = x;
        }

        if removed > 0 {
            self.alloc.fetch_sub(removed_bytes, Ordering::Relaxed);
            self.count.fetch_sub(removed, Ordering::Relaxed);
        }

        {
            let chain = self.chain.read();
            self.states.write().retain(|_, idx| chain.arena[*idx].data.is_some());
        }

        if removed > 0 {
            self.ops.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.ops()
        }
    }

    /// Number of hops from root back to root, following `next`. Used by tests to assert chain
    /// closure; not part of the wire-facing API.
    #[cfg(test)]
    fn hop_count(&self) -> usize {
        let chain = self.chain.read();
        let mut n = 0;
        let mut x = chain.arena[ROOT].next;
        while x != ROOT {
            n += 1;
            x = chain.arena[x].next;
        }
        n
    }

    /// Independently recomputes `(count, alloc)` by walking the live chain, for asserting the
    /// live-count/alloc identities against the maintained counters.
    #[cfg(test)]
    fn live_totals(&self) -> (u64, u64) {
        let chain = self.chain.read();
        let mut count = 0u64;
        let mut alloc = 0u64;
        let mut x = chain.arena[ROOT].next;
        while x != ROOT {
            if let Some(data) = &chain.arena[x].data {
                count += 1;
                alloc += data.len() as u64;
            }
            x = chain.arena[x].next;
        }
        (count, alloc)
    }

    /// True iff `time` is non-decreasing along the live chain.
    #[cfg(test)]
    fn times_non_decreasing(&self) -> bool {
        let chain = self.chain.read();
        let mut x = chain.arena[ROOT].next;
        let mut prev = i64::MIN;
        while x != ROOT {
            let time = chain.arena[x].time;
            if time < prev {
                return false;
            }
            prev = time;
            x = chain.arena[x].next;
        }
        true
    }

    /// True iff every state points at a live signal.
    #[cfg(test)]
    fn states_all_valid(&self) -> bool {
        let chain = self.chain.read();
        self.states.read().values().all(|&idx| chain.arena[idx].data.is_some())
    }
}

impl Drop for Space {
    fn drop(&mut self) {
        self.clock_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut rx: mpsc::Receiver<Vec<u8>>) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(v) = rx.recv().await {
            out.push(v);
        }
        out
    }

    #[tokio::test]
    async fn send_then_scan_emits_in_order() {
        let space = Space::new().await;

        space.send(b"hello".to_vec());
        space.send(b"world".to_vec());

        let (tx, rx) = mpsc::channel(8);
        let ops = space.scan(tx, None).await;

        assert_eq!(drain(rx).await, vec![b"hello".to_vec(), b"world".to_vec()]);
        assert_eq!(ops, 2);
        assert_eq!(space.count(), 2);
        assert_eq!(space.alloc(), 10);
    }

    #[tokio::test]
    async fn drop_zero_clears_everything() {
        let space = Space::new().await;
        space.send(b"hello".to_vec());
        space.send(b"world".to_vec());

        let (tx, _rx) = mpsc::channel(8);
        space.scan(tx, None).await;

        let ops = space.drop_expired(0);

        assert_eq!(space.count(), 0);
        assert_eq!(space.alloc(), 0);
        assert_eq!(ops, 3);
        assert_eq!(space.hop_count(), 0);
    }

    #[tokio::test]
    async fn named_states_resume_independently() {
        let space = Space::new().await;
        space.send(b"a".to_vec());

        let (tx1, rx1) = mpsc::channel(8);
        space.scan(tx1, Some(b"s".to_vec())).await;

        space.send(b"b".to_vec());

        let (tx2, rx2) = mpsc::channel(8);
        space.scan(tx2, Some(b"s".to_vec())).await;

        assert_eq!(drain(rx1).await, vec![b"a".to_vec()]);
        assert_eq!(drain(rx2).await, vec![b"b".to_vec()]);
    }

    #[tokio::test]
    async fn fork_does_not_modify_origin() {
        let space = Space::new().await;
        space.send(b"a".to_vec());

        let (tx_s, rx_s) = mpsc::channel(8);
        space.scan(tx_s, Some(b"s".to_vec())).await;
        drain(rx_s).await;

        let (tx_fork, rx_fork) = mpsc::channel(8);
        space.scan(tx_fork, Some(b"!s".to_vec())).await;
        drain(rx_fork).await;

        space.send(b"b".to_vec());

        let (tx, rx) = mpsc::channel(8);
        space.scan(tx, Some(b"s".to_vec())).await;

        assert_eq!(drain(rx).await, vec![b"b".to_vec()]);
    }

    #[tokio::test]
    async fn scan_resumption_is_idempotent() {
        let space = Space::new().await;
        space.send(b"a".to_vec());

        let (tx1, rx1) = mpsc::channel(8);
        space.scan(tx1, Some(b"s".to_vec())).await;
        assert_eq!(drain(rx1).await, vec![b"a".to_vec()]);

        let (tx2, rx2) = mpsc::channel(8);
        space.scan(tx2, Some(b"s".to_vec())).await;
        assert!(drain(rx2).await.is_empty());
    }

    #[tokio::test]
    async fn drop_with_retention_keeps_fresh_signals() {
        let space = Space::new().await;
        space.send(b"old".to_vec());

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        space.drop_expired(1000);

        let (tx, rx) = mpsc::channel(8);
        space.scan(tx, None).await;
        assert!(drain(rx).await.is_empty());
        assert_eq!(space.hop_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_drops_after_bulk_send_leave_empty_chain() {
        let space = Space::new().await;
        for i in 0..1000u32 {
            space.send(i.to_be_bytes().to_vec());
        }

        let s1 = space.clone();
        let s2 = space.clone();
        let s3 = space.clone();
        let (a, b, c) = tokio::join!(
            tokio::task::spawn_blocking(move || s1.drop_expired(0)),
            tokio::task::spawn_blocking(move || s2.drop_expired(0)),
            tokio::task::spawn_blocking(move || s3.drop_expired(0)),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert_eq!(space.count(), 0);
        assert_eq!(space.hop_count(), 0);
    }

    /// Applies a script of Send/Scan/Drop ops to a fresh space and asserts every invariant in
    /// every invariant after each step, not just at the end — a violation introduced midway through
    /// a sequence must not be able to hide behind a later step that happens to restore it.
    async fn check_invariants_through(ops: &[Op]) {
        let space = Space::new().await;
        let mut prev_ops = 0u64;
        let mut known_keys: Vec<Vec<u8>> = Vec::new();

        for op in ops {
            match op {
                Op::Send(data) => {
                    let new_ops = space.send(data.clone());
                    assert_eq!(new_ops, prev_ops + 1, "Send must increment ops by exactly 1");
                    prev_ops = new_ops;
                }
                Op::Scan(key) => {
                    if let Some(k) = key {
                        known_keys.push(k.clone());
                    }
                    let (tx, rx) = mpsc::channel(1024);
                    let new_ops = space.scan(tx, key.clone()).await;
                    drain(rx).await;
                    assert_eq!(new_ops, prev_ops, "Scan must leave ops unchanged");
                }
                Op::Drop(retention_ms) => {
                    let new_ops = space.drop_expired(*retention_ms);
                    assert!(
                        new_ops == prev_ops || new_ops == prev_ops + 1,
                        "Drop must increment ops by 0 or 1"
                    );
                    prev_ops = new_ops;
                }
            }

            assert_eq!(space.ops(), prev_ops, "ops() must agree with the last returned snapshot");
            assert_eq!(space.hop_count() as u64, space.count(), "chain closure: count + 1 hops from root to root");
            assert!(space.times_non_decreasing(), "time must be non-decreasing along the live chain");
            let (count, alloc) = space.live_totals();
            assert_eq!(count, space.count(), "live-count identity");
            assert_eq!(alloc, space.alloc(), "alloc identity");
            assert!(space.states_all_valid(), "every state must point at a live signal");
        }

        // fork independence: for every plain key that was ever forked, re-scanning it after the
        // fork must not have been affected by the fork's own scan.
        for key in &known_keys {
            if key.starts_with(b"!") {
                let origin = key[1..].to_vec();
                if known_keys.contains(&origin) {
                    let (tx, rx) = mpsc::channel(1024);
                    space.scan(tx, Some(origin)).await;
                    drain(rx).await;
                }
            }
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Send(Vec<u8>),
        Scan(Option<Vec<u8>>),
        Drop(i64),
    }

    fn op_strategy() -> impl proptest::strategy::Strategy<Value = Op> {
        use proptest::prelude::*;

        prop_oneof![
            proptest::collection::vec(any::<u8>(), 1..16).prop_map(Op::Send),
            proptest::option::of(proptest::sample::select(vec![
                b"a".to_vec(),
                b"!a".to_vec(),
                b"b".to_vec(),
                b"!b".to_vec(),
            ]))
            .prop_map(Op::Scan),
            (-2_000i64..5_000i64).prop_map(Op::Drop),
        ]
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]

        /// Chain closure, time ordering, op monotonicity, count/alloc identities and state
        /// validity all hold after every step of any Send/Scan/Drop sequence.
        #[test]
        fn invariants_hold_for_any_sequence(ops in proptest::collection::vec(op_strategy(), 0..40)) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(check_invariants_through(&ops));
        }
    }

    /// Two consecutive scans on the same state with no intervening
    /// send emit nothing the second time, for an arbitrary non-empty key.
    #[tokio::test]
    async fn scan_resumption_holds_for_arbitrary_keys() {
        for key in [b"x".to_vec(), b"!x".to_vec(), b"a very long state name indeed".to_vec()] {
            let space = Space::new().await;
            space.send(b"only".to_vec());

            let (tx1, rx1) = mpsc::channel(8);
            space.scan(tx1, Some(key.clone())).await;
            assert_eq!(drain(rx1).await, vec![b"only".to_vec()]);

            let (tx2, rx2) = mpsc::channel(8);
            space.scan(tx2, Some(key)).await;
            assert!(drain(rx2).await.is_empty());
        }
    }

    /// Forking a state never mutates the state it was forked from,
    /// even after further forks and sends are layered on top.
    #[tokio::test]
    async fn fork_independence_holds_transitively() {
        let space = Space::new().await;
        space.send(b"1".to_vec());

        let (tx, rx) = mpsc::channel(8);
        space.scan(tx, Some(b"s".to_vec())).await;
        assert_eq!(drain(rx).await, vec![b"1".to_vec()]);

        let (tx, rx) = mpsc::channel(8);
        space.scan(tx, Some(b"!s".to_vec())).await;
        assert!(drain(rx).await.is_empty());

        let (tx, rx) = mpsc::channel(8);
        space.scan(tx, Some(b"!!s".to_vec())).await;
        assert!(drain(rx).await.is_empty());

        space.send(b"2".to_vec());

        // "s" must still resume exactly where it left off, unaffected by "!s"/"!!s".
        let (tx, rx) = mpsc::channel(8);
        space.scan(tx, Some(b"s".to_vec())).await;
        assert_eq!(drain(rx).await, vec![b"2".to_vec()]);
    }
}
