//! The hardware UART transport: USART1 at 115200 8N1.
//!
//! Receive and transmit each run through a ring. The ISR fills the
//! receive ring and drains the transmit ring; transmit interrupts are
//! enabled only while there's something to send. The background side
//! masks interrupts just around the register-plus-ring handoff in
//! `send_byte`, the one place both tiers touch the same state pair.
//!
//! After [`init`] the USART1 registers belong to this module; both tiers
//! reach them through the peripheral pointer.

use crate::armv7m;
use crate::clock::CPU_HZ;
use crate::cmd::Transport;
use crate::device;
use crate::device::interrupt;
use crate::util::ring::Ring;

const BAUDRATE: u32 = 115_200;

static RX: Ring = Ring::new();
static TX: Ring = Ring::new();

fn regs() -> &'static device::usart1::RegisterBlock {
    // Safety: the module owns USART1 after init; see module docs.
    unsafe { &*device::USART1::ptr() }
}

/// Configures the UART and its interrupt. PA9/PA10 routing is board
/// init's job; the USART1 singleton is consumed here to mark ownership.
pub fn init(usart: device::USART1, nvic: &mut cortex_m::peripheral::NVIC) {
    usart
        .brr
        .write(|w| unsafe { w.bits(CPU_HZ / BAUDRATE) });
    // UE | RE | TE | RXNEIE.
    usart.cr1.write(|w| unsafe { w.bits(0x0000_002D) });

    armv7m::set_irq_priority(nvic, device::Interrupt::USART1, 3);
    armv7m::enable_irq(device::Interrupt::USART1);
}

/// Queues one byte, starting the transmitter if it's idle. Returns false
/// when the transmit ring is full.
pub fn send_byte(byte: u8) -> bool {
    armv7m::masked(|| {
        let reg = regs();
        // Idle transmitter (ring empty, TXE interrupts off): write the
        // data register directly and let the ISR continue from the ring.
        if TX.used() == 0 && reg.cr1.read().txeie().bit_is_clear() {
            reg.tdr.write(|w| unsafe { w.tdr().bits(byte as u16) });
            reg.cr1.modify(|_, w| w.txeie().set_bit());
            true
        } else {
            TX.push_byte(byte)
        }
    })
}

/// Queues as much of `data` as fits; returns the count taken.
pub fn send(data: &[u8]) -> usize {
    for (i, &b) in data.iter().enumerate() {
        if !send_byte(b) {
            return i;
        }
    }
    data.len()
}

/// Next received byte, if any.
pub fn recv_byte() -> Option<u8> {
    RX.pop_byte()
}

/// Transmit-ring space.
pub fn tx_free() -> usize {
    TX.free()
}

pub fn rx_used() -> usize {
    RX.used()
}

pub fn flush_rx() {
    RX.clear();
}

fn uart_isr() {
    let reg = regs();
    let isr = reg.isr.read();

    // Drop overrun noise so RXNE keeps working.
    if isr.ore().bit_is_set() {
        reg.icr.write(|w| w.orecf().set_bit());
    }

    if isr.rxne().bit_is_set() {
        let byte = reg.rdr.read().bits() as u8;
        // Full ring: the byte is lost, same as any overrun.
        let _ = RX.push_byte(byte);
    }

    if isr.txe().bit_is_set() && reg.cr1.read().txeie().bit_is_set() {
        match TX.pop_byte() {
            Some(byte) => reg.tdr.write(|w| unsafe { w.tdr().bits(byte as u16) }),
            // Nothing left; quiet the transmit interrupt.
            None => reg.cr1.modify(|_, w| w.txeie().clear_bit()),
        }
    }
}

#[interrupt]
fn USART1() {
    uart_isr();
}

/// The UART as a command-session transport.
pub struct UartTransport;

impl Transport for UartTransport {
    fn recv_byte(&mut self) -> Option<u8> {
        recv_byte()
    }
    fn send_byte(&mut self, byte: u8) -> bool {
        send_byte(byte)
    }
    fn tx_free(&self) -> usize {
        tx_free()
    }
}
