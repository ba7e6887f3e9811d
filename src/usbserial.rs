//! The USB CDC-ACM transport.
//!
//! Enumeration, descriptors, and endpoint bookkeeping all live inside
//! `usb-device`/`usbd-serial`/`stm32-usbd`; this module binds the L4
//! device block for them and adapts the class to the same byte-pipe
//! contract the UART offers. The whole thing is background-polled; the
//! loop spins fast enough to stand in for the USB interrupt.

use usb_device::bus::UsbBusAllocator;
use usb_device::prelude::*;
use usbd_serial::SerialPort;

use stm32_usbd::{UsbBus, UsbPeripheral};

use crate::cmd::Transport;
use crate::device;
use crate::util::ring::Ring;
use crate::util::spin_lock::SpinLock;

/// The L4 USB device block, as `stm32-usbd` wants it described.
pub struct UsbHw;

unsafe impl UsbPeripheral for UsbHw {
    const REGISTERS: *const () = 0x4000_6800 as *const ();
    /// The part drives D+ pull-up from the peripheral itself (BCDR.DPPU).
    const DP_PULL_UP_FEATURE: bool = true;
    /// 1 KiB of packet memory, 2x16-bit access scheme.
    const EP_MEMORY: *const () = 0x4000_6C00 as *const ();
    const EP_MEMORY_SIZE: usize = 1024;
    const EP_MEMORY_ACCESS_2X16: bool = true;

    fn enable() {
        // Clocked (and the transceiver powered) during board bring-up;
        // nothing more to switch on here.
    }

    fn startup_delay() {
        // Analog transceiver startup. The datasheet gives 1 µs; stretch it.
        cortex_m::asm::delay(1000);
    }
}

static RX: Ring = Ring::new();
static TX: Ring = Ring::new();

struct Port {
    dev: UsbDevice<'static, UsbBus<UsbHw>>,
    serial: SerialPort<'static, UsbBus<UsbHw>>,
}

static PORT: SpinLock<Option<Port>> = SpinLock::new(None);

/// The allocator must outlive the class and device, so it parks in a
/// static. Written once during init, before the port exists.
static mut USB_BUS: Option<UsbBusAllocator<UsbBus<UsbHw>>> = None;

/// Builds the bus, class, and device. The USB singleton is consumed to
/// mark ownership; PA11/PA12 are in their reset (USB-capable) state.
pub fn init(_usb: device::USB) {
    // Safety: single write before any use, background tier.
    let bus = unsafe {
        USB_BUS = Some(UsbBus::new(UsbHw));
        match USB_BUS.as_ref() {
            Some(b) => b,
            None => return,
        }
    };

    let serial = SerialPort::new(bus);
    let dev = UsbDeviceBuilder::new(bus, UsbVidPid(0x0483, 0x5740))
        .manufacturer("flowsense")
        .product("flow sensor")
        .serial_number("0001")
        .device_class(usbd_serial::USB_CLASS_CDC)
        .build();

    *PORT.lock() = Some(Port { dev, serial });
}

/// Background pump: runs the device state machine and moves bytes between
/// the class and the rings.
pub fn poll() {
    let mut guard = PORT.lock();
    let port = match guard.as_mut() {
        Some(p) => p,
        None => return,
    };

    port.dev.poll(&mut [&mut port.serial]);

    // Drain the class into the receive ring.
    let mut buf = [0u8; 64];
    loop {
        match port.serial.read(&mut buf) {
            Ok(n) if n > 0 => {
                RX.push(&buf[..n]);
                if n < buf.len() {
                    break;
                }
            }
            _ => break,
        }
    }

    // Feed pending transmit bytes; only retire what the class took.
    let n = TX.peek(&mut buf);
    if n > 0 {
        if let Ok(written) = port.serial.write(&buf[..n]) {
            TX.consume(written);
        }
    }
}

pub fn send_byte(byte: u8) -> bool {
    TX.push_byte(byte)
}

pub fn send(data: &[u8]) -> usize {
    TX.push(data)
}

pub fn recv_byte() -> Option<u8> {
    RX.pop_byte()
}

pub fn tx_free() -> usize {
    TX.free()
}

/// The CDC-ACM port as a command-session transport.
pub struct UsbTransport;

impl Transport for UsbTransport {
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
