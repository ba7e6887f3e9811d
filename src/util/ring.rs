//! Fixed-capacity byte rings connecting interrupt handlers to the
//! background loop.
//!
//! Each ring is single-producer/single-consumer: exactly one side pushes
//! (advancing `head`) and exactly one side pops (advancing `tail`). With
//! that discipline, release/acquire pairing on the two indices is enough;
//! no interrupt masking is needed even when one side is an ISR.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Ring capacity in bytes. One slot is sacrificed to distinguish full from
/// empty, so a ring holds at most `RING_LEN - 1` bytes.
pub const RING_LEN: usize = 128;

pub struct Ring {
    head: AtomicUsize,
    tail: AtomicUsize,
    buf: UnsafeCell<[u8; RING_LEN]>,
}

// Safety: index handoff is release/acquire; each buffer slot is written by
// the producer strictly before the release store that publishes it, and not
// touched again until the consumer retires it.
unsafe impl Sync for Ring {}

impl Ring {
    pub const fn new() -> Self {
        Ring {
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            buf: UnsafeCell::new([0; RING_LEN]),
        }
    }

    /// Number of bytes waiting in the ring.
    pub fn used(&self) -> usize {
        let h = self.head.load(Ordering::Acquire);
        let t = self.tail.load(Ordering::Acquire);
        (h + RING_LEN - t) % RING_LEN
    }

    /// Number of bytes that can be pushed before the ring fills.
    pub fn free(&self) -> usize {
        RING_LEN - 1 - self.used()
    }

    /// Producer side. Returns `false` (byte dropped) when full.
    pub fn push_byte(&self, byte: u8) -> bool {
        let h = self.head.load(Ordering::Relaxed);
        let next = (h + 1) % RING_LEN;
        if next == self.tail.load(Ordering::Acquire) {
            return false;
        }
        // Safety: SPSC discipline; this slot is outside the published
        // region and only the producer writes it.
        unsafe {
            (*self.buf.get())[h] = byte;
        }
        self.head.store(next, Ordering::Release);
        true
    }

    /// Producer side. Pushes as much of `data` as fits; returns the count.
    pub fn push(&self, data: &[u8]) -> usize {
        for (i, &b) in data.iter().enumerate() {
            if !self.push_byte(b) {
                return i;
            }
        }
        data.len()
    }

    /// Consumer side.
    pub fn pop_byte(&self) -> Option<u8> {
        let t = self.tail.load(Ordering::Relaxed);
        if t == self.head.load(Ordering::Acquire) {
            return None;
        }
        // Safety: slot was published by the producer's release store.
        let byte = unsafe { (*self.buf.get())[t] };
        self.tail.store((t + 1) % RING_LEN, Ordering::Release);
        Some(byte)
    }

    /// Consumer side. Pops up to `out.len()` bytes; returns the count.
    pub fn pop(&self, out: &mut [u8]) -> usize {
        for i in 0..out.len() {
            match self.pop_byte() {
                Some(b) => out[i] = b,
                None => return i,
            }
        }
        out.len()
    }

    /// Consumer side: copies waiting bytes into `out` without retiring
    /// them. Pair with [`Ring::consume`] once the bytes are truly gone
    /// (e.g. accepted by a USB write).
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let mut t = self.tail.load(Ordering::Relaxed);
        let h = self.head.load(Ordering::Acquire);
        let mut n = 0;
        while t != h && n < out.len() {
            // Safety: published region, consumer side.
            out[n] = unsafe { (*self.buf.get())[t] };
            t = (t + 1) % RING_LEN;
            n += 1;
        }
        n
    }

    /// Consumer side: retires `n` previously peeked bytes.
    pub fn consume(&self, n: usize) {
        let t = self.tail.load(Ordering::Relaxed);
        let avail = self.used();
        let n = n.min(avail);
        self.tail.store((t + n) % RING_LEN, Ordering::Release);
    }

    /// Consumer side: discards everything waiting.
    pub fn clear(&self) {
        let h = self.head.load(Ordering::Acquire);
        self.tail.store(h, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fifo_order() {
        let r = Ring::new();
        assert!(r.push_byte(1));
        assert!(r.push_byte(2));
        assert!(r.push_byte(3));
        assert_eq!(r.pop_byte(), Some(1));
        assert_eq!(r.pop_byte(), Some(2));
        assert_eq!(r.pop_byte(), Some(3));
        assert_eq!(r.pop_byte(), None);
    }

    #[test]
    fn fills_at_len_minus_one() {
        let r = Ring::new();
        for i in 0..RING_LEN - 1 {
            assert!(r.push_byte(i as u8), "filled early at {}", i);
        }
        assert!(!r.push_byte(0xAA));
        assert_eq!(r.used(), RING_LEN - 1);
        assert_eq!(r.free(), 0);
    }

    #[test]
    fn peek_then_consume() {
        let r = Ring::new();
        r.push(&[10, 20, 30]);
        let mut out = [0u8; 8];
        assert_eq!(r.peek(&mut out), 3);
        assert_eq!(&out[..3], &[10, 20, 30]);
        // Peek doesn't retire.
        assert_eq!(r.used(), 3);
        r.consume(2);
        assert_eq!(r.pop_byte(), Some(30));
    }

    proptest! {
        #[test]
        fn free_plus_used_is_capacity(ops in proptest::collection::vec(any::<Option<u8>>(), 0..400)) {
            let r = Ring::new();
            for op in ops {
                match op {
                    Some(b) => { r.push_byte(b); }
                    None => { r.pop_byte(); }
                }
                prop_assert_eq!(r.free() + r.used(), RING_LEN - 1);
            }
        }

        #[test]
        fn push_pop_preserves_content(data in proptest::collection::vec(any::<u8>(), 0..(RING_LEN - 1))) {
            let r = Ring::new();
            prop_assert_eq!(r.push(&data), data.len());
            let mut out = vec![0u8; data.len()];
            prop_assert_eq!(r.pop(&mut out), data.len());
            prop_assert_eq!(out, data);
        }
    }
}
