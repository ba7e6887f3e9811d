//! Binary framing: EOC delimiting with ESC stuffing.
//!
//! Packets on the wire are byte streams terminated by [`EOC`]; a literal
//! `EOC` or [`ESC`] inside a packet is preceded by `ESC`. The receive side
//! de-stuffs into a bounded buffer; a frame that outgrows it is truncated
//! (the dropped tail makes the command fail its own checksum, which is the
//! error the host sees).

use arrayvec::ArrayVec;

/// End-of-command delimiter.
pub const EOC: u8 = 0xF1;
/// Escape prefix.
pub const ESC: u8 = 0xF2;

/// Per-session command buffer size.
pub const CMD_BUF_LEN: usize = 200;

/// True if `b` must be escaped on the wire.
pub fn needs_escape(b: u8) -> bool {
    b == EOC || b == ESC
}

/// Receive-side de-stuffer.
pub struct Destuffer {
    buf: ArrayVec<u8, CMD_BUF_LEN>,
    escaped: bool,
}

impl Destuffer {
    pub const fn new() -> Self {
        Destuffer {
            buf: ArrayVec::new_const(),
            escaped: false,
        }
    }

    /// Feeds one wire byte. Returns `true` when an EOC completed a frame;
    /// the payload is in [`frame`](Self::frame) until [`reset`](Self::reset).
    pub fn push(&mut self, byte: u8) -> bool {
        if self.escaped {
            self.escaped = false;
            let _ = self.buf.try_push(byte);
            return false;
        }
        match byte {
            ESC => {
                self.escaped = true;
                false
            }
            EOC => true,
            _ => {
                let _ = self.buf.try_push(byte);
                false
            }
        }
    }

    pub fn frame(&self) -> &[u8] {
        &self.buf
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.escaped = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stuff(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for &b in payload {
            if needs_escape(b) {
                out.push(ESC);
            }
            out.push(b);
        }
        out.push(EOC);
        out
    }

    #[test]
    fn plain_frame() {
        let mut d = Destuffer::new();
        for &b in &[1u8, 2, 3] {
            assert!(!d.push(b));
        }
        assert!(d.push(EOC));
        assert_eq!(d.frame(), &[1, 2, 3]);
        d.reset();
        assert_eq!(d.frame(), &[] as &[u8]);
    }

    #[test]
    fn escaped_specials_come_through() {
        // ESC EOC ESC ESC AA EOC -> payload [EOC, ESC, AA]
        let mut d = Destuffer::new();
        for &b in &[ESC, EOC, ESC, ESC, 0xAA] {
            assert!(!d.push(b));
        }
        assert!(d.push(EOC));
        assert_eq!(d.frame(), &[EOC, ESC, 0xAA]);
    }

    #[test]
    fn oversize_frame_truncates() {
        let mut d = Destuffer::new();
        for i in 0..CMD_BUF_LEN + 40 {
            assert!(!d.push(i as u8 & 0x7F));
        }
        assert!(d.push(EOC));
        assert_eq!(d.frame().len(), CMD_BUF_LEN);
    }

    proptest! {
        /// destuff(stuff(S)) == S for any S, and the stuffed stream holds
        /// no unescaped EOC before its terminator.
        #[test]
        fn roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..CMD_BUF_LEN)) {
            let wire = stuff(&payload);

            let body = &wire[..wire.len() - 1];
            let mut prev_esc = false;
            for &b in body {
                prop_assert!(!(b == EOC && !prev_esc), "unescaped EOC in body");
                prev_esc = b == ESC && !prev_esc;
            }

            let mut d = Destuffer::new();
            let mut done = false;
            for &b in &wire {
                prop_assert!(!done, "frame ended early");
                done = d.push(b);
            }
            prop_assert!(done);
            prop_assert_eq!(d.frame(), &payload[..]);
        }
    }
}
