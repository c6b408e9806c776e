// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Sliding replay window over RPC sequence numbers.
//!
//! With window size `W` and highest accepted number `H`, a number `s` is
//! accepted iff `s > H`, or `H - W < s <= H` and `s` was not seen before.
//! Accepting `s > H` moves the high edge to `s`.

use crate::domain::errors::GssError;

/// Default window for server-side contexts.
pub const GSS_SEQ_WIN: u32 = 2048;

#[derive(Debug, Clone)]
pub struct SequenceWindow {
    size: u32,
    highest: u32,
    started: bool,
    bits: Vec<u64>,
}

impl SequenceWindow {
    pub fn new(size: u32) -> Self {
        let size = size.max(1);
        Self {
            size,
            highest: 0,
            started: false,
            bits: vec![0; size.div_ceil(64) as usize],
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn highest(&self) -> u32 {
        self.highest
    }

    /// Checks `seq` and records it when accepted.
    pub fn accept(&mut self, seq: u32) -> Result<(), GssError> {
        if !self.started || seq > self.highest {
            self.advance(seq);
            self.mark(seq);
            return Ok(());
        }

        if self.highest - seq >= self.size || self.is_marked(seq) {
            return Err(GssError::ReplayRejected { seq });
        }

        self.mark(seq);
        Ok(())
    }

    fn advance(&mut self, seq: u32) {
        if !self.started || seq - self.highest >= self.size {
            self.bits.iter_mut().for_each(|word| *word = 0);
        } else {
            for stale in (self.highest + 1)..=seq {
                self.clear(stale);
            }
        }
        self.started = true;
        self.highest = seq;
    }

    fn slot(&self, seq: u32) -> (usize, u64) {
        let pos = seq % self.size;
        ((pos / 64) as usize, 1u64 << (pos % 64))
    }

    fn mark(&mut self, seq: u32) {
        let (word, mask) = self.slot(seq);
        self.bits[word] |= mask;
    }

    fn clear(&mut self, seq: u32) {
        let (word, mask) = self.slot(seq);
        self.bits[word] &= !mask;
    }

    fn is_marked(&self, seq: u32) -> bool {
        let (word, mask) = self.slot(seq);
        self.bits[word] & mask != 0
    }
}

impl Default for SequenceWindow {
    fn default() -> Self {
        Self::new(GSS_SEQ_WIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(size: u32, seqs: &[u32]) -> Vec<bool> {
        let mut window = SequenceWindow::new(size);
        seqs.iter().map(|s| window.accept(*s).is_ok()).collect()
    }

    #[test]
    fn test_late_number_outside_small_window_is_rejected() {
        assert_eq!(run(2, &[1, 2, 5, 3]), vec![true, true, true, false]);
    }

    #[test]
    fn test_late_number_inside_window_is_accepted() {
        assert_eq!(run(4, &[1, 2, 5, 3]), vec![true, true, true, true]);
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let mut window = SequenceWindow::new(8);
        window.accept(10).unwrap();
        window.accept(7).unwrap();
        assert_eq!(
            window.accept(7),
            Err(GssError::ReplayRejected { seq: 7 })
        );
        assert_eq!(
            window.accept(10),
            Err(GssError::ReplayRejected { seq: 10 })
        );
    }

    #[test]
    fn test_advance_clears_reused_positions() {
        let mut window = SequenceWindow::new(4);
        window.accept(1).unwrap();
        window.accept(2).unwrap();
        // 5 reuses the bit position of 1
        window.accept(5).unwrap();
        assert!(window.accept(3).is_ok());
        assert!(window.accept(4).is_ok());
        assert!(window.accept(1).is_err());
        assert_eq!(window.highest(), 5);
    }

    #[test]
    fn test_large_jump_resets_window() {
        let mut window = SequenceWindow::new(GSS_SEQ_WIN);
        window.accept(1).unwrap();
        window.accept(100_000).unwrap();
        assert!(window.accept(1).is_err());
        assert!(window.accept(100_000 - 10).is_ok());
    }
}
