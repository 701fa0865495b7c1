//! Monotonic timer engine
//!
//! A min-heap keyed by absolute deadline, backed by a generation-tagged
//! slot table so that double-free and use-after-destroy are impossible
//! by construction.
//!
//! The engine itself is a plain, synchronous, single-owner data
//! structure with no locking -- the timer queue is exclusive to the
//! event loop; the event loop wraps it with `tokio::time::sleep_until`
//! to turn "next deadline" into an awaitable.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

/// Timer priority tier. HIGH timers run before NORMAL timers expiring
/// in the same tick; used by the watchdog kicker and the
/// IPHB resume timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimerPriority {
    High = 0,
    Normal = 1,
}

/// What a fired timer is *for*. The event loop's core dispatch matches
/// on this rather than invoking a boxed callback -- a typed side effect
/// the loop consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    ShutdownGrace,
    UserTimer,
    ActdeadTimer,
    OverheatDebounce,
    ChargerDisconnectDebounce,
    BatteryEmptyDebounce,
    MalfShutdown,
    AlarmSnooze,
    AlarmHold,
    PowerkeyLongpress,
    WatchdogKick,
    IphbResume,
    LifeguardRebootRetry,
    RunlevelRetry,
}

/// Opaque, cancellable handle to a scheduled timer. Equality/generation
/// checked by [`TimerEngine::destroy`]; a destroyed or already-fired
/// handle is safe to pass again (treated as a no-op).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    slot: usize,
    generation: u64,
}

struct Slot {
    generation: u64,
    alive: bool,
    kind: TimerKind,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct HeapKey {
    deadline: Instant,
    priority: TimerPriority,
    seq: u64,
    slot: usize,
    generation: u64,
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline
        // (and, on ties, HIGH before NORMAL, then insertion order) pops
        // first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.priority.cmp(&self.priority).reverse())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A fired timer, returned by [`TimerEngine::run_expired`].
#[derive(Debug, Clone, Copy)]
pub struct Fired {
    pub handle: TimerHandle,
    pub kind: TimerKind,
}

/// Monotonic single-threaded timer engine.
pub struct TimerEngine {
    heap: BinaryHeap<HeapKey>,
    slots: Vec<Slot>,
    free: Vec<usize>,
    next_seq: u64,
}

impl TimerEngine {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            next_seq: 0,
        }
    }

    /// Schedule `kind` to fire `after` from now at the given priority.
    pub fn create(&mut self, after: std::time::Duration, kind: TimerKind, priority: TimerPriority) -> TimerHandle {
        let deadline = Instant::now() + after;
        let slot_idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx].generation += 1;
                self.slots[idx].alive = true;
                self.slots[idx].kind = kind;
                idx
            }
            None => {
                let idx = self.slots.len();
                self.slots.push(Slot { generation: 0, alive: true, kind });
                idx
            }
        };
        let generation = self.slots[slot_idx].generation;
        let seq = self.next_seq;
        self.next_seq += 1;

        self.heap.push(HeapKey { deadline, priority, seq, slot: slot_idx, generation });

        TimerHandle { slot: slot_idx, generation }
    }

    /// Cancel a timer. Safe to call from within another callback, and a
    /// no-op if the handle already fired, was already destroyed, or is
    /// stale (generation mismatch). Destroying a timer from within its
    /// own callback is also a no-op (it's already been popped off the
    /// heap by the time the callback runs).
    pub fn destroy(&mut self, handle: TimerHandle) -> bool {
        if let Some(slot) = self.slots.get_mut(handle.slot) {
            if slot.alive && slot.generation == handle.generation {
                slot.alive = false;
                self.free.push(handle.slot);
                return true;
            }
        }
        false
    }

    /// Deadline of the next live timer, if any. Lazily discards stale
    /// heap entries left behind by `destroy`.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.purge_dead();
        self.heap.peek().map(|k| k.deadline)
    }

    /// Pop and return every timer whose deadline has passed as of `now`,
    /// in the order they should be dispatched: earliest deadline first,
    /// and among equal deadlines, HIGH priority before NORMAL, then
    /// registration order.
    pub fn run_expired(&mut self, now: Instant) -> Vec<Fired> {
        let mut fired = Vec::new();
        loop {
            match self.heap.peek() {
                Some(top) if top.deadline <= now => {
                    let key = self.heap.pop().unwrap();
                    let slot = &mut self.slots[key.slot];
                    if slot.alive && slot.generation == key.generation {
                        slot.alive = false;
                        self.free.push(key.slot);
                        fired.push(Fired {
                            handle: TimerHandle { slot: key.slot, generation: key.generation },
                            kind: slot.kind,
                        });
                    }
                    // else: stale entry from a destroyed timer, discard.
                }
                _ => break,
            }
        }
        fired
    }

    fn purge_dead(&mut self) {
        while let Some(top) = self.heap.peek() {
            let slot = &self.slots[top.slot];
            if slot.alive && slot.generation == top.generation {
                break;
            }
            self.heap.pop();
        }
    }

    /// True if a handle still refers to a live, unfired timer.
    pub fn is_live(&self, handle: TimerHandle) -> bool {
        self.slots
            .get(handle.slot)
            .map(|s| s.alive && s.generation == handle.generation)
            .unwrap_or(false)
    }
}

impl Default for TimerEngine {
    fn default() -> Self {
        Self::new()
    }
}
