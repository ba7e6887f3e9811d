//! Host-facing command sessions.
//!
//! One session per transport (UART, USB CDC-ACM), each owning its receive
//! de-stuffer, command buffer, and send cursor. The dispatcher itself is
//! transport-agnostic; a session just moves bytes. Sessions are polled
//! from the background loop only (the high-priority tick never touches
//! them) and never block: the send path emits what the transmit buffer
//! will take and resumes on the next poll.

pub mod dispatch;
pub mod frame;

pub use dispatch::Image;

use dispatch::process;
use frame::{needs_escape, Destuffer, CMD_BUF_LEN, EOC, ESC};

/// Byte-level transport underneath a session.
pub trait Transport {
    /// Next received byte, if any.
    fn recv_byte(&mut self) -> Option<u8>;
    /// Queues one byte; `false` means the transmit side is full and the
    /// byte was not taken.
    fn send_byte(&mut self, byte: u8) -> bool;
    /// Space available for queuing, in bytes.
    fn tx_free(&self) -> usize;
}

enum SessionState {
    Receiving,
    Sending,
}

pub struct Session<T> {
    transport: T,
    image: Image,
    rx: Destuffer,
    buf: [u8; CMD_BUF_LEN],
    state: SessionState,
    rsp_len: usize,
    rsp_ndx: usize,
    /// EOC still owed after the response body.
    eoc_pending: bool,
}

impl<T: Transport> Session<T> {
    pub const fn new(transport: T, image: Image) -> Self {
        Session {
            transport,
            image,
            rx: Destuffer::new(),
            buf: [0; CMD_BUF_LEN],
            state: SessionState::Receiving,
            rsp_len: 0,
            rsp_ndx: 0,
            eoc_pending: false,
        }
    }

    /// Advances the session as far as the transport allows right now.
    pub fn poll(&mut self) {
        match self.state {
            SessionState::Receiving => self.poll_receive(),
            SessionState::Sending => self.poll_send(),
        }
    }

    fn poll_receive(&mut self) {
        while let Some(byte) = self.transport.recv_byte() {
            if !self.rx.push(byte) {
                continue;
            }

            let frame = self.rx.frame();
            let len = frame.len();
            self.buf[..len].copy_from_slice(frame);
            self.rx.reset();

            self.rsp_len = process(&mut self.buf, len, self.image);
            self.rsp_ndx = 0;
            if self.rsp_len > 0 {
                self.eoc_pending = true;
                self.state = SessionState::Sending;
            }
            return;
        }
    }

    /// Injects a ready-to-send response, bypassing dispatch.
    #[cfg(test)]
    fn force_response(&mut self, data: &[u8]) {
        self.buf[..data.len()].copy_from_slice(data);
        self.rsp_len = data.len();
        self.rsp_ndx = 0;
        self.eoc_pending = true;
        self.state = SessionState::Sending;
    }

    fn poll_send(&mut self) {
        while self.rsp_ndx < self.rsp_len {
            let byte = self.buf[self.rsp_ndx];
            if needs_escape(byte) {
                // Only take the pair when both halves fit, so we never
                // strand a lone ESC across polls.
                if self.transport.tx_free() < 2 {
                    return;
                }
                self.transport.send_byte(ESC);
                self.transport.send_byte(byte);
            } else if !self.transport.send_byte(byte) {
                return;
            }
            self.rsp_ndx += 1;
        }

        if self.eoc_pending {
            if !self.transport.send_byte(EOC) {
                return;
            }
            self.eoc_pending = false;
        }
        self.state = SessionState::Receiving;
    }
}

#[cfg(test)]
mod tests {
    use super::dispatch::{CMD_GET, CMD_SET, CMD_STATE};
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Default)]
    struct MockInner {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
        tx_room: usize,
    }

    /// Shared handle so a test can inspect the wire while the session
    /// holds the transport.
    #[derive(Clone)]
    struct Mock(Rc<RefCell<MockInner>>);

    impl Mock {
        fn new() -> Self {
            let m = Mock(Rc::new(RefCell::new(MockInner::default())));
            m.0.borrow_mut().tx_room = usize::MAX;
            m
        }

        fn feed_packet(&self, opcode: u8, payload: &[u8]) {
            let mut pkt = vec![opcode, 0];
            pkt.extend_from_slice(payload);
            let x: u8 = pkt.iter().fold(0, |a, &b| a ^ b);
            pkt[1] = x ^ 0x55;
            let mut inner = self.0.borrow_mut();
            for b in pkt {
                if needs_escape(b) {
                    inner.rx.push_back(ESC);
                }
                inner.rx.push_back(b);
            }
            inner.rx.push_back(EOC);
        }

        fn tx(&self) -> Vec<u8> {
            self.0.borrow().tx.clone()
        }

        fn set_room(&self, n: usize) {
            let mut inner = self.0.borrow_mut();
            inner.tx_room = inner.tx.len() + n;
        }
    }

    impl Transport for Mock {
        fn recv_byte(&mut self) -> Option<u8> {
            self.0.borrow_mut().rx.pop_front()
        }
        fn send_byte(&mut self, byte: u8) -> bool {
            let mut inner = self.0.borrow_mut();
            if inner.tx.len() < inner.tx_room {
                inner.tx.push(byte);
                true
            } else {
                false
            }
        }
        fn tx_free(&self) -> usize {
            let inner = self.0.borrow();
            inner.tx_room.saturating_sub(inner.tx.len())
        }
    }

    fn run_to_idle(session: &mut Session<Mock>) {
        for _ in 0..10_000 {
            session.poll();
        }
    }

    /// De-stuffs one response and strips its trailing EOC.
    fn destuff(wire: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut esc = false;
        for &b in wire {
            if esc {
                out.push(b);
                esc = false;
            } else if b == ESC {
                esc = true;
            } else if b == EOC {
                break;
            } else {
                out.push(b);
            }
        }
        out
    }

    #[test]
    fn state_command_end_to_end() {
        let t = Mock::new();
        t.feed_packet(CMD_STATE, &[]);
        let mut s = Session::new(t.clone(), Image::Application);
        run_to_idle(&mut s);

        let tx = t.tx();
        assert_eq!(*tx.last().unwrap(), EOC);
        assert_eq!(destuff(&tx), vec![0x00, 0x55, 0x00]);
    }

    #[test]
    fn back_to_back_commands_each_get_an_eoc() {
        let t = Mock::new();
        crate::trace::init().ok();
        t.feed_packet(CMD_SET, &[3, 0, 0x09, 0x00]); // trace_var1 = 9
        t.feed_packet(CMD_GET, &[3, 0]);
        let mut s = Session::new(t.clone(), Image::Application);
        run_to_idle(&mut s);

        let tx = t.tx();
        let eocs = tx
            .iter()
            .enumerate()
            .filter(|&(i, &b)| b == EOC && (i == 0 || tx[i - 1] != ESC))
            .count();
        assert_eq!(eocs, 2);
        assert_eq!(destuff(&tx), vec![0x00, 0x55]); // SET: OK, no data
    }

    #[test]
    fn send_path_survives_tiny_tx_windows() {
        let t = Mock::new();
        t.feed_packet(CMD_GET, &[49, 0]); // unknown var -> 2-byte error rsp
        t.set_room(0);
        let mut s = Session::new(t.clone(), Image::Application);

        // Open the window one byte at a time.
        for _ in 0..16 {
            s.poll();
            t.set_room(1);
        }
        run_to_idle(&mut s);
        let rsp = destuff(&t.tx());
        assert_eq!(rsp[0], crate::error::Error::UnknownVar.code());
        let x: u8 = rsp.iter().fold(0, |a, &b| a ^ b);
        assert_eq!(x, 0x55);
    }

    #[test]
    fn stuffing_escapes_specials_on_the_wire() {
        // Payload [F1, F2, AA] must leave as [ESC F1 ESC F2 AA EOC].
        let t = Mock::new();
        let mut s = Session::new(t.clone(), Image::Application);
        s.force_response(&[0xF1, 0xF2, 0xAA]);
        run_to_idle(&mut s);
        assert_eq!(t.tx(), vec![ESC, 0xF1, ESC, 0xF2, 0xAA, EOC]);
    }

    #[test]
    fn escape_pairs_never_split_across_polls() {
        let t = Mock::new();
        let mut s = Session::new(t.clone(), Image::Application);
        s.force_response(&[0xF1, 0x01]);

        // One free slot: the ESC pair must wait rather than half-send.
        t.set_room(1);
        s.poll();
        assert!(t.tx().is_empty());

        t.set_room(2);
        s.poll();
        assert_eq!(t.tx(), vec![ESC, 0xF1]);

        t.set_room(8);
        run_to_idle(&mut s);
        assert_eq!(t.tx(), vec![ESC, 0xF1, 0x01, EOC]);
    }
}
