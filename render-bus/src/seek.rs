//! Exclusive seek sessions.
//!
//! Repositioning the demuxer and then draining the decoder until a frame shows
//! up must never interleave with another session doing the same, so every such
//! sequence runs while holding a [`SeekGuard`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

#[derive(Default)]
struct LockState {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// FIFO async mutex without protected data.
#[derive(Clone, Default)]
pub struct SeekLock {
    inner: Arc<Mutex<LockState>>,
}

impl SeekLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves immediately when the lock is free, otherwise queues behind
    /// earlier callers.
    pub async fn acquire(&self) -> SeekGuard {
        loop {
            let rx = {
                let mut state = lock_state(&self.inner);
                if !state.locked {
                    state.locked = true;
                    return SeekGuard::new(self.inner.clone());
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                log::trace!("seek lock busy, {} waiting", state.waiters.len());
                rx
            };

            let mut pending = PendingAcquire {
                lock: &self.inner,
                rx: Some(rx),
            };
            let woken = match pending.rx.as_mut() {
                Some(rx) => rx.await.is_ok(),
                None => false,
            };
            pending.rx = None;
            if woken {
                return SeekGuard::new(self.inner.clone());
            }
        }
    }

    /// Non-blocking variant of [`acquire`](Self::acquire).
    pub fn try_acquire(&self) -> Option<SeekGuard> {
        let mut state = lock_state(&self.inner);
        if state.locked {
            return None;
        }
        state.locked = true;
        Some(SeekGuard::new(self.inner.clone()))
    }

    pub fn is_locked(&self) -> bool {
        lock_state(&self.inner).locked
    }

    pub fn waiting(&self) -> usize {
        lock_state(&self.inner).waiters.len()
    }
}

fn lock_state(inner: &Mutex<LockState>) -> MutexGuard<'_, LockState> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

/// Clears the held flag, or hands the lock straight to the oldest live waiter.
fn release(inner: &Mutex<LockState>) {
    let mut state = lock_state(inner);
    while let Some(waiter) = state.waiters.pop_front() {
        if waiter.send(()).is_ok() {
            return;
        }
    }
    state.locked = false;
}

// A waiter dropped after being handed the lock must pass it on.
struct PendingAcquire<'a> {
    lock: &'a Mutex<LockState>,
    rx: Option<oneshot::Receiver<()>>,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                release(self.lock);
            }
        }
    }
}

/// Holds the seek lock; dropping it releases.
pub struct SeekGuard {
    lock: Option<Arc<Mutex<LockState>>>,
}

impl SeekGuard {
    fn new(lock: Arc<Mutex<LockState>>) -> Self {
        Self { lock: Some(lock) }
    }

    pub fn release(mut self) {
        if let Some(lock) = self.lock.take() {
            release(&lock);
        }
    }
}

impl Drop for SeekGuard {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            release(&lock);
        }
    }
}

#[cfg(test)]
#[path = "seek_test.rs"]
mod seek_test;
