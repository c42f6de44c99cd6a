//! Frame pacing.
//!
//! Every frame owns a generation number equal to its index. Slot `frame % N`
//! keeps the fence of the frame's last submission. Before the CPU moves on to
//! frame `F + 1` it waits for the fence of frame `F + 1 - N`, whose slot is
//! about to be reused, which bounds the CPU lead to `N` frames.

use std::sync::Arc;

use crate::config::MAX_FRAMES_IN_FLIGHT;
use crate::error::Result;

/// A fence the pacer can block on.
pub trait FrameFence: Send + Sync {
    /// Block until signaled.
    fn wait(&self) -> Result<()>;
    fn is_signaled(&self) -> bool;
}

/// Tracks frame generations and the fences that retire them.
pub struct FramePacer<F> {
    frame: u64,
    slots: [Option<Arc<F>>; MAX_FRAMES_IN_FLIGHT],
    last_submitted: Option<Arc<F>>,
}

impl<F: FrameFence> Default for FramePacer<F> {
    fn default() -> Self {
        Self {
            frame: 0,
            slots: std::array::from_fn(|_| None),
            last_submitted: None,
        }
    }
}

impl<F: FrameFence> FramePacer<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation of the frame being recorded.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Slot of the frame being recorded.
    pub fn slot(&self) -> usize {
        slot_of(self.frame)
    }

    /// Record a submission of the current frame. Queue order makes the last
    /// one cover every earlier submission.
    pub fn on_submit(&mut self, fence: Arc<F>) {
        let slot = self.slot();
        self.slots[slot] = Some(fence.clone());
        self.last_submitted = Some(fence);
    }

    /// Close the current frame and block until the slot the next frame reuses
    /// is free. Returns the generation retired by the wait, if any.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn end_frame(&mut self) -> Result<Option<u64>> {
        let slot = self.slot();
        if self.slots[slot].is_none() {
            // No work this frame: it completes with the last earlier submission.
            self.slots[slot].clone_from(&self.last_submitted);
        }

        let next = self.frame + 1;
        let next_slot = slot_of(next);
        if let Some(fence) = &self.slots[next_slot] {
            fence.wait()?;
        }
        self.slots[next_slot] = None;
        self.frame = next;

        Ok(next.checked_sub(MAX_FRAMES_IN_FLIGHT as u64))
    }

    /// Frames whose fences are known and still unsignaled.
    pub fn frames_in_flight(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|fence| !fence.is_signaled())
            .count()
    }

    /// Block until every submitted frame has completed.
    pub fn wait_all(&mut self) -> Result<()> {
        if let Some(fence) = &self.last_submitted {
            fence.wait()?;
        }
        for slot in &mut self.slots {
            *slot = None;
        }
        Ok(())
    }
}

pub(crate) fn slot_of(frame: u64) -> usize {
    (frame % MAX_FRAMES_IN_FLIGHT as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::{Condvar, Mutex};

    #[derive(Default)]
    struct FakeFence {
        signaled: Mutex<bool>,
        condvar: Condvar,
        waits: AtomicUsize,
    }

    impl FakeFence {
        fn signal(&self) {
            *self.signaled.lock() = true;
            self.condvar.notify_all();
        }
    }

    impl FrameFence for FakeFence {
        fn wait(&self) -> Result<()> {
            self.waits.fetch_add(1, Ordering::SeqCst);
            let mut signaled = self.signaled.lock();
            while !*signaled {
                self.condvar.wait(&mut signaled);
            }
            Ok(())
        }

        fn is_signaled(&self) -> bool {
            *self.signaled.lock()
        }
    }

    #[test]
    fn first_frames_do_not_wait() {
        let mut pacer = FramePacer::<FakeFence>::new();
        let fences: Vec<_> = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| Arc::new(FakeFence::default()))
            .collect();

        for (frame, fence) in fences.iter().enumerate().take(MAX_FRAMES_IN_FLIGHT - 1) {
            pacer.on_submit(fence.clone());
            assert_eq!(pacer.end_frame().unwrap(), None);
            assert_eq!(pacer.frame(), frame as u64 + 1);
        }
        assert!(fences.iter().all(|f| f.waits.load(Ordering::SeqCst) == 0));
        assert_eq!(pacer.frames_in_flight(), MAX_FRAMES_IN_FLIGHT - 1);
    }

    #[test]
    fn frame_past_the_limit_blocks_on_oldest_fence() {
        let mut pacer = FramePacer::<FakeFence>::new();
        let fences: Vec<_> = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| Arc::new(FakeFence::default()))
            .collect();

        for fence in &fences[..MAX_FRAMES_IN_FLIGHT - 1] {
            pacer.on_submit(fence.clone());
            pacer.end_frame().unwrap();
        }
        pacer.on_submit(fences[MAX_FRAMES_IN_FLIGHT - 1].clone());
        assert_eq!(pacer.frames_in_flight(), MAX_FRAMES_IN_FLIGHT);

        let released = Arc::new(AtomicBool::new(false));
        let signaler = {
            let fence = fences[0].clone();
            let released = released.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                released.store(true, Ordering::SeqCst);
                fence.signal();
            })
        };

        let retired = pacer.end_frame().unwrap();
        assert!(released.load(Ordering::SeqCst), "end_frame returned early");
        assert_eq!(retired, Some(0));
        assert_eq!(fences[0].waits.load(Ordering::SeqCst), 1);
        assert_eq!(fences[1].waits.load(Ordering::SeqCst), 0);
        signaler.join().unwrap();
    }

    #[test]
    fn in_flight_frames_never_exceed_limit() {
        let mut pacer = FramePacer::<FakeFence>::new();
        let mut submitted = Vec::new();

        for frame in 0..20u64 {
            let fence = Arc::new(FakeFence::default());
            pacer.on_submit(fence.clone());
            submitted.push(fence);
            assert!(pacer.frames_in_flight() <= MAX_FRAMES_IN_FLIGHT);

            // The GPU retires the frame that the next end_frame waits on.
            if let Some(oldest) = (frame + 1).checked_sub(MAX_FRAMES_IN_FLIGHT as u64) {
                submitted[oldest as usize].signal();
            }
            pacer.end_frame().unwrap();
        }
    }

    #[test]
    fn empty_frame_inherits_last_submission() {
        let mut pacer = FramePacer::<FakeFence>::new();
        let fence = Arc::new(FakeFence::default());
        pacer.on_submit(fence.clone());
        pacer.end_frame().unwrap();

        // Frames 1 and 2 submit nothing.
        pacer.end_frame().unwrap();
        fence.signal();
        pacer.end_frame().unwrap();
        assert_eq!(pacer.frame(), 3);

        // Frame 3 reuses slot 0, frame 4 reuses the slot of frame 1.
        assert_eq!(pacer.end_frame().unwrap(), Some(1));
        assert!(fence.waits.load(Ordering::SeqCst) >= 1);
        assert_eq!(pacer.frames_in_flight(), 0);
    }

    #[test]
    fn wait_all_blocks_on_last_submission() {
        let mut pacer = FramePacer::<FakeFence>::new();
        let fence = Arc::new(FakeFence::default());
        pacer.on_submit(fence.clone());
        fence.signal();
        pacer.wait_all().unwrap();
        assert_eq!(fence.waits.load(Ordering::SeqCst), 1);
        assert_eq!(pacer.frames_in_flight(), 0);
    }
}
