//! Credit-based flow-control primitive.
//!
//! A [`Window`] is a monotonically-nonnegative `u32` counter guarded by a
//! mutex, with a [`tokio::sync::Notify`] standing in for the condition
//! variable a blocking implementation would use: `add` grants credit and
//! wakes waiters, `reserve` blocks while the counter is zero and debits on
//! success, and `close` wakes every waiter with a closed indication so a
//! torn-down session doesn't leave writers blocked forever.

use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::{Error, Result};

#[derive(Debug)]
struct State {
    available: u32,
    closed: bool,
}

/// See the module docs.
#[derive(Debug)]
pub(crate) struct Window {
    state: Mutex<State>,
    notify: Notify,
}

impl Window {
    pub(crate) fn new(initial: u32) -> Self {
        Window {
            state: Mutex::new(State {
                available: initial,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Grant `n` additional bytes of credit and wake any blocked `reserve`.
    ///
    /// Errors if `available + n` would overflow `u32` — this is a protocol
    /// violation, not a transient condition.
    pub(crate) fn add(&self, n: u32) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        {
            let mut state = self.state.lock().expect("window mutex poisoned");
            state.available = state
                .available
                .checked_add(n)
                .ok_or(Error::WindowOverflow)?;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Block while the counter is zero and the window isn't closed; once
    /// credit is available, debit `min(available, max)` and return it.
    /// Returns `None` if the window was closed before or while waiting.
    pub(crate) async fn reserve(&self, max: u32) -> Option<u32> {
        loop {
            // Register for a wakeup *before* re-checking state, so an
            // add()/close() that lands between our check and the `.await`
            // below is never missed.
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("window mutex poisoned");
                if state.closed {
                    return None;
                }
                if state.available > 0 {
                    let n = state.available.min(max);
                    state.available -= n;
                    return Some(n);
                }
            }
            notified.await;
        }
    }

    /// Non-blocking debit used on the receive side, where the peer (not us)
    /// decides how much to send: returns `false` without modifying state if
    /// `n` exceeds the available credit, otherwise subtracts `n` and
    /// returns `true`. Unlike `reserve`, never waits and never caps `n`.
    pub(crate) fn debit_checked(&self, n: u32) -> bool {
        let mut state = self.state.lock().expect("window mutex poisoned");
        if n > state.available {
            return false;
        }
        state.available -= n;
        true
    }

    /// Mark the window closed and wake every blocked `reserve` so shutdown
    /// doesn't leave writers stuck.
    pub(crate) fn close(&self) {
        self.state.lock().expect("window mutex poisoned").closed = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn reserve_returns_immediately_when_credit_available() {
        let w = Window::new(100);
        assert_eq!(w.reserve(40).await, Some(40));
        assert_eq!(w.reserve(1000).await, Some(60));
    }

    #[tokio::test]
    async fn reserve_blocks_until_add_grants_credit() {
        let w = Arc::new(Window::new(0));
        let w2 = w.clone();
        let task = tokio::spawn(async move { w2.reserve(50).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        w.add(30).unwrap();
        let n = task.await.unwrap();
        assert_eq!(n, Some(30));
    }

    #[tokio::test]
    async fn close_unblocks_waiters_with_none() {
        let w = Arc::new(Window::new(0));
        let w2 = w.clone();
        let task = tokio::spawn(async move { w2.reserve(10).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        w.close();
        assert_eq!(task.await.unwrap(), None);

        // Reserve after close also returns None, never blocks.
        assert_eq!(w.reserve(10).await, None);
    }

    #[tokio::test]
    async fn add_overflow_is_rejected() {
        let w = Window::new(u32::MAX);
        assert!(matches!(w.add(1), Err(Error::WindowOverflow)));
    }

    #[test]
    fn debit_checked_rejects_amounts_over_available() {
        let w = Window::new(10);
        assert!(!w.debit_checked(11));
        assert!(w.debit_checked(10));
        assert!(!w.debit_checked(1));
    }
}
