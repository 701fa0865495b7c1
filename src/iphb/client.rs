//! IPHB client table and coalescing wake-pass scheduling
//!
//! The scheduling math is kept pure and `now`-parameterized, the same
//! way `engine::bits::select_state` and the agtmux `SupervisorTracker`
//! are, so it is unit-testable without a real clock or socket.

use std::time::Duration;

/// A registered IPHB client. `wait_started = None` means idle (not
/// currently waiting); `Some(t)` means waiting since `t` (seconds since
/// an arbitrary test/process epoch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IphbClient {
    pub id: u64,
    pub pid: u32,
    pub wait_started: Option<u64>,
    pub mintime: u16,
    pub maxtime: u16,
}

impl IphbClient {
    pub fn new(id: u64, pid: u32) -> Self {
        Self { id, pid, wait_started: None, mintime: 0, maxtime: 0 }
    }

    pub fn is_waiting(&self) -> bool {
        self.wait_started.is_some()
    }

    /// Seconds remaining until `maxtime` elapses, saturating to 0 if
    /// `now` is already past the deadline. Grounds Open Question #3:
    /// the legacy `send_stats` used unsigned arithmetic that wrapped on
    /// a negative `wait_started + maxtime - now`; we saturate instead.
    pub fn remaining_until_maxtime(&self, now: u64) -> Option<u64> {
        self.wait_started.map(|started| {
            let deadline = started.saturating_add(self.maxtime as u64);
            deadline.saturating_sub(now)
        })
    }

    pub fn mintime_elapsed(&self, now: u64) -> bool {
        self.wait_started.map(|s| now >= s.saturating_add(self.mintime as u64)).unwrap_or(false)
    }

    pub fn maxtime_elapsed(&self, now: u64) -> bool {
        self.wait_started.map(|s| now >= s.saturating_add(self.maxtime as u64)).unwrap_or(false)
    }

    /// `waited` seconds to report in the wake response.
    pub fn waited_secs(&self, now: u64) -> u32 {
        self.wait_started.map(|s| now.saturating_sub(s) as u32).unwrap_or(0)
    }
}

/// Misbehaving-window check: warn (but still accept) if
/// `mintime / (maxtime - mintime) < 5` and `mintime > 0`.
pub fn is_misbehaving_window(mintime: u16, maxtime: u16, ratio_threshold: f64) -> bool {
    if mintime == 0 || maxtime <= mintime {
        return false;
    }
    let ratio = mintime as f64 / (maxtime - mintime) as f64;
    ratio < ratio_threshold
}

/// Table of registered clients plus the two-pass coalescing wake logic.
#[derive(Debug, Default)]
pub struct ClientTable {
    clients: Vec<IphbClient>,
    next_id: u64,
}

impl ClientTable {
    pub fn new() -> Self {
        Self { clients: Vec::new(), next_id: 0 }
    }

    pub fn register(&mut self, pid: u32) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.clients.push(IphbClient::new(id, pid));
        id
    }

    pub fn remove(&mut self, id: u64) {
        self.clients.retain(|c| c.id != id);
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut IphbClient> {
        self.clients.iter_mut().find(|c| c.id == id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn waiting_count(&self) -> usize {
        self.clients.iter().filter(|c| c.is_waiting()).count()
    }

    /// Run the two coalescing passes and return the `(id, waited_secs)`
    /// of every client woken, clearing their `wait_started`. Pass 1:
    /// every client whose maxtime elapsed. Pass 2 (only if pass 1 woke
    /// someone): every remaining waiting client whose mintime elapsed.
    /// `waited_secs` is captured before `wait_started` is cleared so
    /// the caller can report a real elapsed-wait value back to the
    /// client instead of a placeholder.
    pub fn run_wake_passes(&mut self, now: u64) -> Vec<(u64, u32)> {
        let mut woken = Vec::new();

        for client in self.clients.iter_mut() {
            if client.is_waiting() && client.maxtime_elapsed(now) {
                woken.push((client.id, client.waited_secs(now)));
                client.wait_started = None;
            }
        }

        if !woken.is_empty() {
            for client in self.clients.iter_mut() {
                if client.is_waiting() && client.mintime_elapsed(now) {
                    woken.push((client.id, client.waited_secs(now)));
                    client.wait_started = None;
                }
            }
        }

        woken
    }

    /// `sleep_time = min over waiting clients of (wait_started+maxtime -
    /// now)`, default 3600s.
    pub fn next_sleep(&self, now: u64, default_secs: u64) -> Duration {
        let min = self
            .clients
            .iter()
            .filter_map(|c| c.remaining_until_maxtime(now))
            .min();
        Duration::from_secs(min.unwrap_or(default_secs))
    }
}
