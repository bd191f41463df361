//! Free-list backed signal pool
//!
//! Signal records live in the arena `Vec` owned by [`super::Chain`]; a [`Pool`] only tracks
//! which arena slots are free. This amortizes allocation across `Send`/`Drop` cycles the same
//! way the original `sync.Pool` free-list did, without needing raw pointers: a "pointer" here
//! is just the record's index in the arena.

/// A single signal record as stored in the arena.
///
/// `data == None` marks a tombstoned record: either the permanent root sentinel (index
/// [`super::ROOT`]) or a dropped signal awaiting reuse.
#[derive(Debug)]
pub(crate) struct Slot {
    pub time: i64,
    pub data: Option<Vec<u8>>,
    pub next: usize,
}

/// Reusable free-list of arena indices.
#[derive(Debug, Default)]
pub(crate) struct Pool {
    free: Vec<usize>,
}

// === impl Pool ===

impl Pool {
    /// Acquires a record, reusing a freed slot if one is available, pre-initialized with
    /// `next = root` so a freshly appended tail correctly closes the cycle.
    pub fn acquire(&mut self, arena: &mut Vec<Slot>, root: usize, time: i64, data: Vec<u8>) -> usize {
        if let Some(idx) = self.free.pop() {
            let slot = &mut arena[idx];
            slot.time = time;
            slot.data = Some(data);
            slot.next = root;
            idx
        } else {
            arena.push(Slot { time, data: Some(data), next: root });
            arena.len() - 1
        }
    }

    /// Returns a record to the pool. The slot's `data` and `next` are reset so any stale
    /// external reference (a state still pointing at it) resolves to the anchor rather than a
    /// dangling value.
    pub fn release(&mut self, arena: &mut [Slot], root: usize, idx: usize) {
        let slot = &mut arena[idx];
        slot.data = None;
        slot.next = root;
        self.free.push(idx);
    }
}
