//! Blocking priority queue over caller-provided shared memory.
//!
//! The region is split `priority | push | pull`. Producers append to the
//! push region under the push lock; the consumer drains the pull region,
//! and when it empties the two regions are swapped under both locks and the
//! index reversed so the oldest record pops first. Priority pushes always
//! serialize on the pull lock, as consumers read priority records first.
//! Back-pressure is signalled through the `not_full`/`not_empty` condition
//! variables.

use std::{
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

use super::StackBuffer;

/// Share of the block dedicated to the priority region.
const PRIORITY_DIVISOR: usize = 16;
const PRIORITY_MIN: usize = 64;

struct PullSide<'a> {
    pull: StackBuffer<'a>,
    priority: StackBuffer<'a>,
}

struct QueueFlags {
    empty: bool,
    full: bool,
}

/// Two-channel blocking queue whose storage lives in one caller-provided
/// memory region.
pub struct IpcRingQueue<'a> {
    push_side: Mutex<StackBuffer<'a>>,
    pull_side: Mutex<PullSide<'a>>,
    flags: Mutex<QueueFlags>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<'a> IpcRingQueue<'a> {
    /// Lay the three regions out over `region` and initialize an empty
    /// queue.
    pub fn new(region: &'a mut [u8]) -> Self {
        let priority_size = (region.len() / PRIORITY_DIVISOR).max(PRIORITY_MIN);
        let (priority_region, rest) = region.split_at_mut(priority_size);
        let half = rest.len() / 2;
        let (push_region, pull_region) = rest.split_at_mut(half);
        Self {
            push_side: Mutex::new(StackBuffer::new(push_region)),
            pull_side: Mutex::new(PullSide {
                pull: StackBuffer::new(pull_region),
                priority: StackBuffer::new(priority_region),
            }),
            flags: Mutex::new(QueueFlags {
                empty: true,
                full: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn empty(&self) -> bool {
        let pull = self.pull_side.lock().unwrap();
        pull.pull.is_empty()
            && pull.priority.is_empty()
            && self.push_side.lock().unwrap().is_empty()
    }

    fn mark_not_empty(&self) {
        self.flags.lock().unwrap().empty = false;
        self.not_empty.notify_all();
    }

    fn mark_not_full(&self) {
        self.flags.lock().unwrap().full = false;
        self.not_full.notify_all();
    }

    /// Append a record; false when no space is available.
    pub fn try_push(&self, data: &[u8]) -> bool {
        let mut push = self.push_side.lock().unwrap();
        if !push.is_empty() {
            let ok = push.push(data);
            if ok {
                self.mark_not_empty();
            }
            return ok;
        }
        // The push region is empty; if the consumer side is drained too,
        // deliver straight to the pull region.
        drop(push);
        let mut pull = self.pull_side.lock().unwrap();
        if pull.pull.is_empty() && pull.priority.is_empty() {
            let ok = pull.pull.push(data);
            if ok {
                self.mark_not_empty();
            }
            return ok;
        }
        drop(pull);
        let ok = self.push_side.lock().unwrap().push(data);
        if ok {
            self.mark_not_empty();
        }
        ok
    }

    /// Blocking push with a bound on the wait for space.
    pub fn push_timeout(&self, timeout: Duration, data: &[u8]) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_push(data) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let mut flags = self.flags.lock().unwrap();
            flags.full = true;
            let wait = (deadline - now).min(Duration::from_millis(10));
            let _unused = self.not_full.wait_timeout(flags, wait).unwrap();
        }
    }

    /// Append to the priority channel; false when the priority region is
    /// full.
    pub fn try_push_priority(&self, data: &[u8]) -> bool {
        let mut pull = self.pull_side.lock().unwrap();
        let ok = pull.priority.push(data);
        if ok {
            self.mark_not_empty();
        }
        ok
    }

    pub fn push_priority_timeout(&self, timeout: Duration, data: &[u8]) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_push_priority(data) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let mut flags = self.flags.lock().unwrap();
            flags.full = true;
            let wait = (deadline - now).min(Duration::from_millis(10));
            let _unused = self.not_full.wait_timeout(flags, wait).unwrap();
        }
    }

    /// Pop the next record into `dest`: priority records first, then the
    /// pull region, rotating the push region in when the pull side drains.
    pub fn try_pop(&self, dest: &mut [u8]) -> Option<usize> {
        let mut pull = self.pull_side.lock().unwrap();
        if !pull.priority.is_empty() {
            let size = pull.priority.pop(dest);
            self.mark_not_full();
            return Some(size);
        }
        if !pull.pull.is_empty() {
            let size = pull.pull.pop(dest);
            self.mark_not_full();
            return Some(size);
        }
        let mut push = self.push_side.lock().unwrap();
        if push.is_empty() {
            self.flags.lock().unwrap().empty = true;
            return None;
        }
        std::mem::swap(&mut *push, &mut pull.pull);
        drop(push);
        pull.pull.reverse();
        let size = pull.pull.pop(dest);
        self.mark_not_full();
        Some(size)
    }

    /// Blocking pop.
    pub fn pop(&self, dest: &mut [u8]) -> usize {
        loop {
            if let Some(size) = self.try_pop(dest) {
                return size;
            }
            let flags = self.flags.lock().unwrap();
            if flags.empty {
                let _unused = self
                    .not_empty
                    .wait_timeout(flags, Duration::from_millis(10))
                    .unwrap();
            }
        }
    }

    /// Pop with a bound on the wait; 0 when nothing arrived in time.
    pub fn pop_timeout(&self, timeout: Duration, dest: &mut [u8]) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(size) = self.try_pop(dest) {
                return size;
            }
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            let flags = self.flags.lock().unwrap();
            let wait = (deadline - now).min(Duration::from_millis(10));
            let _unused = self.not_empty.wait_timeout(flags, wait).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The 4 KiB three-stage scenario: records pushed 571/249/393 come back
    /// in FIFO order across the region rotation.
    #[test]
    fn ring_three_stage_fifo() {
        let mut block = vec![0u8; 4096];
        let queue = IpcRingQueue::new(&mut block);

        assert!(queue.try_push(&vec![b'a'; 571]));
        assert!(queue.try_push(&vec![b'b'; 249]));
        assert!(queue.try_push(&vec![b'c'; 393]));

        let mut out = vec![0u8; 1024];
        assert_eq!(queue.try_pop(&mut out), Some(571));
        assert!(out[..571].iter().all(|b| *b == b'a'));

        assert_eq!(queue.try_pop(&mut out), Some(249));
        assert!(out[..249].iter().all(|b| *b == b'b'));

        assert_eq!(queue.try_pop(&mut out), Some(393));
        assert!(out[..393].iter().all(|b| *b == b'c'));

        assert!(queue.empty());
        assert_eq!(queue.try_pop(&mut out), None);
    }

    #[test]
    fn rotation_preserves_order_across_batches() {
        let mut block = vec![0u8; 10_192];
        let queue = IpcRingQueue::new(&mut block);
        let data = vec![b'a'; 500];

        assert!(queue.try_push(&data[..400]));
        assert!(queue.try_push(&data[..401]));
        assert!(queue.try_push(&data[..402]));
        assert!(queue.try_push(&data[..403]));

        let mut out = vec![0u8; 500];
        assert_eq!(queue.try_pop(&mut out), Some(400));
        assert_eq!(queue.try_pop(&mut out), Some(401));

        assert!(queue.try_push(&data[..404]));
        assert!(queue.try_push(&data[..405]));
        assert!(queue.try_push(&data[..406]));

        for expected in [402, 403, 404, 405, 406] {
            assert_eq!(queue.try_pop(&mut out), Some(expected));
        }
        assert!(queue.empty());
    }

    #[test]
    fn priority_records_pop_first() {
        let mut block = vec![0u8; 10_192];
        let queue = IpcRingQueue::new(&mut block);
        let data = vec![b'a'; 500];

        assert!(queue.try_push(&data[..400]));
        assert!(queue.try_push(&data[..401]));

        let mut out = vec![0u8; 500];
        assert_eq!(queue.try_pop(&mut out), Some(400));

        assert!(queue.try_push_priority(&data[..417]));
        assert_eq!(queue.try_pop(&mut out), Some(417));
        assert_eq!(queue.try_pop(&mut out), Some(401));

        assert!(queue.try_push(&data[..404]));
        assert!(queue.try_push_priority(&data[..420]));
        assert!(queue.try_push_priority(&data[..421]));
        assert!(queue.try_push(&data[..405]));

        assert_eq!(queue.try_pop(&mut out), Some(420));
        assert_eq!(queue.try_pop(&mut out), Some(421));
        assert_eq!(queue.try_pop(&mut out), Some(404));
        assert_eq!(queue.try_pop(&mut out), Some(405));
        assert!(queue.empty());
    }

    #[test]
    fn full_queue_blocks_until_timeout() {
        let mut block = vec![0u8; 4096];
        let queue = IpcRingQueue::new(&mut block);
        let data = vec![b'a'; 500];

        // priority region: 256 bytes; push/pull regions: 1920 bytes each.
        assert!(queue.try_push(&data[..420])); // straight to pull
        for _ in 0..4 {
            assert!(queue.try_push(&data[..420])); // push region
        }
        assert!(!queue.try_push(&data[..420]));
        assert!(!queue.push_timeout(Duration::from_millis(50), &data[..420]));

        // Draining far enough to rotate the regions frees space again.
        let mut out = vec![0u8; 500];
        assert_eq!(queue.try_pop(&mut out), Some(420));
        assert_eq!(queue.try_pop(&mut out), Some(420));
        assert!(queue.push_timeout(Duration::from_millis(50), &data[..420]));
    }

    #[test]
    fn blocking_pop_wakes_on_push() {
        let mut block = vec![0u8; 4096];
        let queue = IpcRingQueue::new(&mut block);

        std::thread::scope(|scope| {
            let consumer = scope.spawn(|| {
                let mut out = vec![0u8; 64];
                let size = queue.pop(&mut out);
                (size, out)
            });
            std::thread::sleep(Duration::from_millis(30));
            assert!(queue.try_push(b"wake up"));
            let (size, out) = consumer.join().unwrap();
            assert_eq!(&out[..size], b"wake up");
        });
    }
}
