//! Per-session message counters: the send counter and the receive replay window.

use crate::error::{Error, Result};

/// Number of counters below the highest received one that are tracked individually.
pub const WINDOW_SIZE: u32 = 32;

const INITIAL_SEND_MAX: u32 = 1 << 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterCheck {
    Accept,
    RejectDuplicate,
    RejectTooOld,
}

/// Snapshot of the receive side, used to carry a window across a suspend/resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveWindow {
    pub max: u32,
    pub bitmap: u32,
}

#[derive(Debug)]
pub struct SessionMessageCounter {
    next_send: u32,
    rx_max: Option<u32>,
    /// Bit `i` set means counter `rx_max - 1 - i` has been received.
    rx_bitmap: u32,
}

impl Default for SessionMessageCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMessageCounter {
    pub fn new() -> Self {
        Self::with_send_counter(rand::random::<u32>() % INITIAL_SEND_MAX + 1)
    }

    pub fn with_send_counter(next_send: u32) -> Self {
        Self {
            next_send,
            rx_max: None,
            rx_bitmap: 0,
        }
    }

    /// Returns the counter for the next outgoing message. Once the counter space is used up
    /// every call fails and the session has to be re-established.
    pub fn next_send_counter(&mut self) -> Result<u32> {
        if self.next_send == u32::MAX {
            return Err(Error::CounterExhausted);
        }
        let current = self.next_send;
        self.next_send += 1;
        Ok(current)
    }

    pub fn peek_send_counter(&self) -> u32 {
        self.next_send
    }

    /// Classifies `counter` without touching the window.
    pub fn check(&self, counter: u32) -> CounterCheck {
        let max = match self.rx_max {
            None => return CounterCheck::Accept,
            Some(max) => max,
        };
        if counter > max {
            return CounterCheck::Accept;
        }
        if counter == max {
            return CounterCheck::RejectDuplicate;
        }
        let offset = max - counter - 1;
        if offset >= WINDOW_SIZE {
            return CounterCheck::RejectTooOld;
        }
        if self.rx_bitmap & (1 << offset) != 0 {
            CounterCheck::RejectDuplicate
        } else {
            CounterCheck::Accept
        }
    }

    /// Marks `counter` as received. Only call after the message authenticated.
    pub fn commit(&mut self, counter: u32) {
        match self.rx_max {
            None => {
                self.rx_max = Some(counter);
                self.rx_bitmap = 0;
            }
            Some(max) if counter > max => {
                let shift = counter - max;
                self.rx_bitmap = if shift > WINDOW_SIZE {
                    0
                } else {
                    // the old max becomes bit shift-1
                    (((self.rx_bitmap as u64) << shift) | (1u64 << (shift - 1))) as u32
                };
                self.rx_max = Some(counter);
            }
            Some(max) if counter < max => {
                let offset = max - counter - 1;
                if offset < WINDOW_SIZE {
                    self.rx_bitmap |= 1 << offset;
                }
            }
            Some(_) => {}
        }
    }

    /// Check and commit in one step, for callers that have already authenticated.
    pub fn validate_received(&mut self, counter: u32) -> CounterCheck {
        let result = self.check(counter);
        if result == CounterCheck::Accept {
            self.commit(counter);
        }
        result
    }

    pub fn receive_window(&self) -> Option<ReceiveWindow> {
        self.rx_max.map(|max| ReceiveWindow {
            max,
            bitmap: self.rx_bitmap,
        })
    }

    pub fn restore_receive_window(&mut self, window: Option<ReceiveWindow>) {
        self.rx_max = window.map(|w| w.max);
        self.rx_bitmap = window.map(|w| w.bitmap).unwrap_or(0);
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_counter_starts_in_range_and_increments_by_one() -> Result<()> {
        for _ in 0..64 {
            let mut c = SessionMessageCounter::new();
            let first = c.next_send_counter()?;
            assert!((1..=INITIAL_SEND_MAX).contains(&first));
            assert_eq!(c.next_send_counter()?, first + 1);
            assert_eq!(c.next_send_counter()?, first + 2);
        }
        Ok(())
    }

    #[test]
    fn send_counter_exhaustion_never_wraps() -> Result<()> {
        let mut c = SessionMessageCounter::with_send_counter(u32::MAX - 2);
        assert_eq!(c.next_send_counter()?, u32::MAX - 2);
        assert_eq!(c.next_send_counter()?, u32::MAX - 1);
        assert!(matches!(c.next_send_counter(), Err(Error::CounterExhausted)));
        assert!(matches!(c.next_send_counter(), Err(Error::CounterExhausted)));
        Ok(())
    }

    #[test]
    fn duplicates_and_old_counters_rejected() {
        let mut c = SessionMessageCounter::new();
        assert_eq!(c.validate_received(100), CounterCheck::Accept);
        assert_eq!(c.validate_received(100), CounterCheck::RejectDuplicate);
        assert_eq!(c.validate_received(102), CounterCheck::Accept);
        // reordered but inside the window
        assert_eq!(c.validate_received(101), CounterCheck::Accept);
        assert_eq!(c.validate_received(101), CounterCheck::RejectDuplicate);
        assert_eq!(c.validate_received(100), CounterCheck::RejectDuplicate);

        assert_eq!(c.validate_received(200), CounterCheck::Accept);
        assert_eq!(c.check(200 - WINDOW_SIZE), CounterCheck::Accept);
        assert_eq!(c.check(200 - WINDOW_SIZE - 1), CounterCheck::RejectTooOld);
        assert_eq!(c.check(102), CounterCheck::RejectTooOld);
    }

    #[test]
    fn check_does_not_mutate() {
        let mut c = SessionMessageCounter::new();
        c.commit(10);
        assert_eq!(c.check(11), CounterCheck::Accept);
        assert_eq!(c.check(11), CounterCheck::Accept);
        c.commit(11);
        assert_eq!(c.check(11), CounterCheck::RejectDuplicate);
        assert_eq!(c.check(10), CounterCheck::RejectDuplicate);
    }

    #[test]
    fn window_shift_keeps_history() {
        let mut c = SessionMessageCounter::new();
        for n in [1, 3, 5] {
            c.commit(n);
        }
        c.commit(5 + WINDOW_SIZE);
        // 5 is now the oldest tracked counter, 3 fell off the window
        assert_eq!(c.check(5), CounterCheck::RejectDuplicate);
        assert_eq!(c.check(6), CounterCheck::Accept);
        assert_eq!(c.check(3), CounterCheck::RejectTooOld);

        c.commit(1000);
        assert_eq!(c.receive_window(), Some(ReceiveWindow { max: 1000, bitmap: 0 }));
    }

    #[test]
    fn restore_window_and_reset() {
        let mut c = SessionMessageCounter::new();
        c.restore_receive_window(Some(ReceiveWindow {
            max: 50,
            bitmap: 1,
        }));
        assert_eq!(c.check(49), CounterCheck::RejectDuplicate);
        assert_eq!(c.check(48), CounterCheck::Accept);
        c.reset();
        assert_eq!(c.receive_window(), None);
        assert_eq!(c.check(49), CounterCheck::Accept);
    }
}
