//! The per-thread lock owner tag
//!
//! A thread does not own a lock of its own. Whichever queue holds the
//! thread owns it, and the thread carries an atomic tag naming that owner:
//! a CPU queue, the sleep queue, or the shared `blocked` sentinel used for
//! the hand-off window between two CPUs. A CPU that chose a thread whose
//! tag still reads `blocked` spins until the previous owner publishes the
//! new tag with a release store; the spin is bounded by the other CPU
//! finishing its switch.

#[cfg(not(loom))]
use core::sync::atomic::{AtomicU32, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicU32, Ordering};

const UNOWNED: u32 = u32::MAX;
const BLOCKED: u32 = u32::MAX - 1;
const SLEEPQ: u32 = u32::MAX - 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOwner {
    /// Not attached to any queue (freshly created or exiting)
    Unowned,
    /// Mid hand-off between CPUs
    Blocked,
    /// Held by the sleep queue of whatever the thread is waiting on
    SleepQueue,
    /// Held by the given CPU's queue
    CpuQueue(u8),
}

impl LockOwner {
    fn encode(self) -> u32 {
        match self {
            Self::Unowned => UNOWNED,
            Self::Blocked => BLOCKED,
            Self::SleepQueue => SLEEPQ,
            Self::CpuQueue(cpu) => u32::from(cpu),
        }
    }

    fn decode(raw: u32) -> Self {
        match raw {
            UNOWNED => Self::Unowned,
            BLOCKED => Self::Blocked,
            SLEEPQ => Self::SleepQueue,
            cpu => {
                #[allow(clippy::cast_possible_truncation, reason = "CPU tags are below 256")]
                let cpu = cpu as u8;

                Self::CpuQueue(cpu)
            }
        }
    }
}

pub struct TdLock(AtomicU32);

impl TdLock {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicU32::new(UNOWNED))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicU32::new(UNOWNED))
    }

    pub fn owner(&self) -> LockOwner {
        LockOwner::decode(self.0.load(Ordering::Acquire))
    }

    /// Publish a new owner
    pub fn set(&self, owner: LockOwner) {
        self.0.store(owner.encode(), Ordering::Release);
    }

    /// Swap in the blocked sentinel and return the previous owner
    pub fn block(&self) -> LockOwner {
        LockOwner::decode(self.0.swap(BLOCKED, Ordering::AcqRel))
    }

    /// Spin until the hand-off completes, returning the new owner
    pub fn spin_until_unblocked(&self) -> LockOwner {
        loop {
            let owner = LockOwner::decode(self.0.load(Ordering::Acquire));

            if owner != LockOwner::Blocked {
                return owner;
            }

            #[cfg(not(loom))]
            core::hint::spin_loop();

            #[cfg(loom)]
            loom::thread::yield_now();
        }
    }
}

#[cfg(not(loom))]
impl Default for TdLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "No need to be so rigid in tests")]
mod tests {
    use super::*;

    #[test]
    #[cfg(not(loom))]
    fn test_owner_round_trip() {
        let lock = TdLock::new();
        assert_eq!(lock.owner(), LockOwner::Unowned);

        lock.set(LockOwner::CpuQueue(3));
        assert_eq!(lock.owner(), LockOwner::CpuQueue(3));

        lock.set(LockOwner::SleepQueue);
        assert_eq!(lock.owner(), LockOwner::SleepQueue);

        assert_eq!(lock.block(), LockOwner::SleepQueue);
        assert_eq!(lock.owner(), LockOwner::Blocked);

        lock.set(LockOwner::CpuQueue(0));
        assert_eq!(lock.spin_until_unblocked(), LockOwner::CpuQueue(0));
    }

    #[test]
    #[cfg(loom)]
    fn test_handoff_publishes_owner() {
        // One CPU blocks the thread, hands it to CPU 1 and publishes the
        // tag; the other CPU spins until the tag leaves the sentinel. The
        // release/acquire pair must also publish the data written before
        // the hand-off.
        use loom::sync::atomic::{AtomicU32 as Payload, Ordering as PayloadOrdering};
        use std::sync::Arc;

        loom::model(|| {
            let lock = Arc::new(TdLock::new());
            let payload = Arc::new(Payload::new(0));

            lock.set(LockOwner::CpuQueue(0));

            let giver = loom::thread::spawn({
                let lock = Arc::clone(&lock);
                let payload = Arc::clone(&payload);

                move || {
                    assert_eq!(lock.block(), LockOwner::CpuQueue(0));
                    payload.store(42, PayloadOrdering::Relaxed);
                    lock.set(LockOwner::CpuQueue(1));
                }
            });

            let taker = loom::thread::spawn({
                let lock = Arc::clone(&lock);
                let payload = Arc::clone(&payload);

                move || {
                    let owner = lock.spin_until_unblocked();

                    // Either we observed the state before the hand-off
                    // started or the completed hand-off, never the sentinel
                    match owner {
                        LockOwner::CpuQueue(0) => {}
                        LockOwner::CpuQueue(1) => {
                            assert_eq!(payload.load(PayloadOrdering::Relaxed), 42);
                        }
                        owner => panic!("unexpected owner {owner:?}"),
                    }
                }
            });

            giver.join().unwrap();
            taker.join().unwrap();
        });
    }
}
