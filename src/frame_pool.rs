// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::VecDeque;

use crate::frame::Frame;

/// The queues a frame can sit in. A frame is always in exactly one queue of
/// its owning pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueId {
    Free,
    Request,
    Process,
    Complete,
    Late,
}

impl QueueId {
    pub const ALL: [QueueId; 5] = [
        QueueId::Free,
        QueueId::Request,
        QueueId::Process,
        QueueId::Complete,
        QueueId::Late,
    ];

    pub fn name(self) -> &'static str {
        match self {
            QueueId::Free => "free",
            QueueId::Request => "request",
            QueueId::Process => "process",
            QueueId::Complete => "complete",
            QueueId::Late => "late",
        }
    }

    fn index(self) -> usize {
        match self {
            QueueId::Free => 0,
            QueueId::Request => 1,
            QueueId::Process => 2,
            QueueId::Complete => 3,
            QueueId::Late => 4,
        }
    }
}

/// Fixed-capacity pool of frames for one hardware stage.
///
/// Frames are created once at open time and only ever move between queues by
/// value, so they can be neither leaked nor duplicated; the total across all
/// queues equals the capacity for the pool's whole lifetime. Callers access
/// the pool through the stage's exclusive lock.
pub struct FramePool {
    name: &'static str,
    capacity: usize,
    queues: [VecDeque<Frame>; 5],
}

impl FramePool {
    pub fn new(name: &'static str, capacity: usize) -> FramePool {
        let mut free = VecDeque::with_capacity(capacity);
        for i in 0..capacity {
            free.push_back(Frame::new(i));
        }
        FramePool {
            name,
            capacity,
            queues: [
                free,
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self, queue: QueueId) -> usize {
        self.queues[queue.index()].len()
    }

    pub fn is_empty(&self, queue: QueueId) -> bool {
        self.queues[queue.index()].is_empty()
    }

    /// Total frame count across every queue. Always equals capacity.
    pub fn total(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    /// Remove and return the head of `queue`.
    pub fn acquire(&mut self, queue: QueueId) -> Option<Frame> {
        self.queues[queue.index()].pop_front()
    }

    /// Append `frame` to the tail of `queue`. Queue order is submission
    /// order.
    pub fn release(&mut self, frame: Frame, queue: QueueId) {
        self.queues[queue.index()].push_back(frame);
        // A frame coming from outside this pool means double accounting.
        if self.total() > self.capacity {
            panic!(
                "framemgr {}: {} frames in {} slots, frame accounting broken",
                self.name,
                self.total(),
                self.capacity
            );
        }
    }

    /// Put a frame back at the head of `queue`, preserving its position
    /// relative to frames behind it.
    pub fn requeue_front(&mut self, frame: Frame, queue: QueueId) {
        self.queues[queue.index()].push_front(frame);
        if self.total() > self.capacity {
            panic!(
                "framemgr {}: {} frames in {} slots, frame accounting broken",
                self.name,
                self.total(),
                self.capacity
            );
        }
    }

    /// Non-removing read of the head of `queue`.
    pub fn peek(&self, queue: QueueId) -> Option<&Frame> {
        self.queues[queue.index()].front()
    }

    /// Mutable access to the head of `queue` without moving it.
    pub fn peek_mut(&mut self, queue: QueueId) -> Option<&mut Frame> {
        self.queues[queue.index()].front_mut()
    }

    /// Linear scan of `queue` for a frame matching `pred`. Used to locate a
    /// stale frame by fcount when a hardware event lags or leads the head.
    pub fn find<P>(&self, queue: QueueId, pred: P) -> Option<&Frame>
    where
        P: Fn(&Frame) -> bool,
    {
        self.queues[queue.index()].iter().find(|f| pred(f))
    }

    /// Remove and return the first frame of `queue` matching `pred`.
    pub fn take_if<P>(&mut self, queue: QueueId, pred: P) -> Option<Frame>
    where
        P: Fn(&Frame) -> bool,
    {
        let q = &mut self.queues[queue.index()];
        let pos = q.iter().position(|f| pred(f))?;
        q.remove(pos)
    }

    /// True if any queue other than Free holds a frame.
    pub fn has_pending(&self) -> bool {
        self.len(QueueId::Free) != self.capacity
    }

    pub fn pending(&self) -> usize {
        self.capacity - self.len(QueueId::Free)
    }

    /// Zero frame contents and collapse everything back into Free. Only
    /// valid at close time, after the owner has drained its obligations.
    pub fn flush(&mut self) {
        let mut frames: Vec<Frame> = Vec::with_capacity(self.capacity);
        for q in self.queues.iter_mut() {
            while let Some(f) = q.pop_front() {
                frames.push(f);
            }
        }
        frames.sort_by_key(|f| f.slot_index);
        for mut f in frames {
            f.reset();
            self.queues[QueueId::Free.index()].push_back(f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conserved(pool: &FramePool) -> bool {
        pool.total() == pool.capacity()
    }

    #[test]
    fn starts_with_all_frames_free() {
        let pool = FramePool::new("t", 4);
        assert_eq!(pool.len(QueueId::Free), 4);
        for q in [QueueId::Request, QueueId::Process, QueueId::Complete, QueueId::Late] {
            assert_eq!(pool.len(q), 0);
        }
        assert!(conserved(&pool));
    }

    #[test]
    fn frames_move_between_queues_fifo() {
        let mut pool = FramePool::new("t", 3);
        let mut a = pool.acquire(QueueId::Free).unwrap();
        a.fcount = 1;
        pool.release(a, QueueId::Request);
        let mut b = pool.acquire(QueueId::Free).unwrap();
        b.fcount = 2;
        pool.release(b, QueueId::Request);
        assert!(conserved(&pool));

        // FIFO: first released comes out first.
        let head = pool.acquire(QueueId::Request).unwrap();
        assert_eq!(head.fcount, 1);
        pool.release(head, QueueId::Process);
        assert_eq!(pool.peek(QueueId::Request).unwrap().fcount, 2);
        assert!(conserved(&pool));
    }

    #[test]
    fn acquire_empty_queue_returns_none() {
        let mut pool = FramePool::new("t", 1);
        assert!(pool.acquire(QueueId::Process).is_none());
        let f = pool.acquire(QueueId::Free).unwrap();
        assert!(pool.acquire(QueueId::Free).is_none());
        pool.release(f, QueueId::Free);
    }

    #[test]
    fn find_and_take_locate_stale_frames() {
        let mut pool = FramePool::new("t", 4);
        for fcount in 1..=3 {
            let mut f = pool.acquire(QueueId::Free).unwrap();
            f.fcount = fcount;
            pool.release(f, QueueId::Complete);
        }
        assert!(pool.find(QueueId::Complete, |f| f.fcount == 2).is_some());
        assert!(pool.find(QueueId::Complete, |f| f.fcount == 9).is_none());

        // Take out-of-order; remaining order is preserved.
        let f = pool.take_if(QueueId::Complete, |f| f.fcount == 2).unwrap();
        assert_eq!(f.fcount, 2);
        pool.release(f, QueueId::Free);
        assert_eq!(pool.peek(QueueId::Complete).unwrap().fcount, 1);
        assert!(conserved(&pool));
    }

    #[test]
    #[should_panic(expected = "frame accounting broken")]
    fn foreign_frame_release_is_fatal() {
        let mut pool = FramePool::new("t", 2);
        pool.release(Frame::new(99), QueueId::Free);
    }

    #[test]
    fn flush_returns_everything_to_free_zeroed() {
        let mut pool = FramePool::new("t", 3);
        let mut f = pool.acquire(QueueId::Free).unwrap();
        f.fcount = 7;
        pool.release(f, QueueId::Process);
        let mut f = pool.acquire(QueueId::Free).unwrap();
        f.fcount = 8;
        pool.release(f, QueueId::Late);

        pool.flush();
        assert_eq!(pool.len(QueueId::Free), 3);
        assert!(pool.find(QueueId::Free, |f| f.fcount != 0).is_none());
    }
}
