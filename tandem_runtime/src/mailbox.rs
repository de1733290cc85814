//! The blocking two-channel mailbox owned by every node.
//!
//! Producers append to a push-side vector guarded by its own lock; the
//! consumer drains a pull-side vector and swaps the two under both locks only
//! when the pull side runs dry, so an ordinary push contends only with other
//! pushes. Priority items live in a separate channel on the pull side and are
//! always returned ahead of every normal item.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Condvar, Mutex,
    },
    time::{Duration, Instant},
};

/// Granularity of the blocking-wait re-check loop.
const WAIT_SLICE: Duration = Duration::from_millis(10);

struct PullSide<T> {
    /// Drained from the back; reversed at swap time so the oldest pops first.
    pull: Vec<T>,
    /// Priority channel, FIFO among itself.
    priority: VecDeque<T>,
}

/// Single-consumer, multi-producer blocking mailbox with a priority channel.
pub struct Mailbox<T> {
    push_side: Mutex<Vec<T>>,
    pull_side: Mutex<PullSide<T>>,
    /// Both sides were observed empty by the last pop.
    empty: AtomicBool,
    not_empty: Condvar,
    /// High-water mark on the normal channel; pushes beyond it block until
    /// the consumer drains. Nothing is ever dropped.
    high_water: usize,
    backlog: std::sync::atomic::AtomicUsize,
    not_full: Condvar,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self::with_high_water(usize::MAX)
    }

    /// A mailbox whose normal channel blocks producers past `high_water`
    /// queued items.
    pub fn with_high_water(high_water: usize) -> Self {
        Self {
            push_side: Mutex::new(Vec::new()),
            pull_side: Mutex::new(PullSide {
                pull: Vec::new(),
                priority: VecDeque::new(),
            }),
            empty: AtomicBool::new(true),
            not_empty: Condvar::new(),
            high_water,
            backlog: std::sync::atomic::AtomicUsize::new(0),
            not_full: Condvar::new(),
        }
    }

    /// Append to the normal channel, blocking while the backlog is at the
    /// high-water mark.
    pub fn push(&self, value: T) {
        while self.backlog.load(Ordering::Acquire) >= self.high_water {
            let guard = self.push_side.lock().unwrap();
            if self.backlog.load(Ordering::Acquire) < self.high_water {
                break;
            }
            let _guard = self.not_full.wait_timeout(guard, WAIT_SLICE).unwrap();
        }
        self.backlog.fetch_add(1, Ordering::AcqRel);
        let mut push = self.push_side.lock().unwrap();
        if !push.is_empty() {
            push.push(value);
            return;
        }
        if self
            .empty
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // The consumer may be asleep; deliver straight to the pull side.
            drop(push);
            let mut pull = self.pull_side.lock().unwrap();
            if pull.pull.is_empty() && pull.priority.is_empty() {
                pull.pull.push(value);
                self.not_empty.notify_all();
            } else {
                drop(pull);
                self.push_side.lock().unwrap().push(value);
            }
        } else {
            push.push(value);
            drop(push);
            // The consumer can observe empty between our first check and the
            // push; wake it if it just went to sleep.
            if self
                .empty
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.not_empty.notify_all();
            }
        }
    }

    /// Insert ahead of every element on the normal channel. Priority items
    /// drain in FIFO order among themselves.
    pub fn push_priority(&self, value: T) {
        let mut pull = self.pull_side.lock().unwrap();
        pull.priority.push_back(value);
        self.empty.store(false, Ordering::Release);
        self.not_empty.notify_all();
    }

    fn note_normal_pop(&self) {
        self.backlog.fetch_sub(1, Ordering::AcqRel);
        self.not_full.notify_all();
    }

    /// Non-blocking pop; priority items first.
    pub fn try_pop(&self) -> Option<T> {
        let mut pull = self.pull_side.lock().unwrap();
        if let Some(value) = pull.priority.pop_front() {
            return Some(value);
        }
        if let Some(value) = pull.pull.pop() {
            self.note_normal_pop();
            return Some(value);
        }
        // The pull side ran dry; rotate the push side in.
        let mut push = self.push_side.lock().unwrap();
        if push.is_empty() {
            self.empty.store(true, Ordering::Release);
            return None;
        }
        std::mem::swap(&mut *push, &mut pull.pull);
        drop(push);
        pull.pull.reverse();
        let value = pull.pull.pop();
        if value.is_some() {
            self.note_normal_pop();
        }
        value
    }

    /// Non-blocking peek at the element the next pop would return.
    pub fn try_peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let mut pull = self.pull_side.lock().unwrap();
        if let Some(value) = pull.priority.front() {
            return Some(value.clone());
        }
        if let Some(value) = pull.pull.last() {
            return Some(value.clone());
        }
        let mut push = self.push_side.lock().unwrap();
        if push.is_empty() {
            return None;
        }
        std::mem::swap(&mut *push, &mut pull.pull);
        drop(push);
        pull.pull.reverse();
        pull.pull.last().cloned()
    }

    /// Block until an item is available.
    pub fn pop(&self) -> T {
        loop {
            if let Some(value) = self.try_pop() {
                return value;
            }
            let guard = self.pull_side.lock().unwrap();
            if guard.priority.is_empty() && guard.pull.is_empty() {
                let _guard = self.not_empty.wait_timeout(guard, WAIT_SLICE).unwrap();
            }
        }
    }

    /// Block for at most `timeout`; `None` if nothing arrived in time.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self.try_pop() {
                return Some(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let guard = self.pull_side.lock().unwrap();
            if guard.priority.is_empty() && guard.pull.is_empty() {
                let wait = (deadline - now).min(WAIT_SLICE);
                let _guard = self.not_empty.wait_timeout(guard, wait).unwrap();
            }
        }
    }

    /// Block until an item is available, invoking `on_empty` each time the
    /// mailbox is observed empty before waiting. Used to drive pull-based
    /// transports from the mailbox wait.
    pub fn pop_with_callback(&self, mut on_empty: impl FnMut()) -> T {
        loop {
            if let Some(value) = self.try_pop() {
                return value;
            }
            on_empty();
            if let Some(value) = self.pop_timeout(WAIT_SLICE) {
                return value;
            }
        }
    }

    /// True when both channels were observed empty.
    pub fn is_empty(&self) -> bool {
        let pull = self.pull_side.lock().unwrap();
        pull.priority.is_empty() && pull.pull.is_empty() && self.push_side.lock().unwrap().is_empty()
    }
}
