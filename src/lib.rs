//! Control firmware core for a battery-powered respiratory flow sensor.
//!
//! Two gauge pressure sensors hang off a shared SPI bus; their difference,
//! run through a piecewise-linear calibration, is the flow estimate. Results
//! land on a small OLED and are served to a host over a framed binary
//! protocol on both a UART and a USB CDC-ACM port.
//!
//! Execution is split across three tiers:
//!
//! 1. a 1 kHz timer interrupt (the *tick*) that drives acquisition, drift
//!    compensation, and the trace sampler;
//! 2. peripheral completion interrupts (SPI word received, display transfer
//!    done, UART bytes) that advance their owning state machines;
//! 3. the background loop, which polls the command sessions, flushes
//!    pending flash writes, and repaints the display.
//!
//! Modules that do not touch hardware are architecture-independent so the
//! test suite can exercise them on the host.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub use stm32l4::stm32l4x2 as device;

pub mod armv7m;
pub mod util;

pub mod error;

pub mod adc;
pub mod autooffset;
pub mod calc;
pub mod clock;
pub mod cmd;
pub mod crc32;
pub mod display;
pub mod filter;
pub mod flash;
pub mod fwupdate;
pub mod pressure;
pub mod scratch;
pub mod store;
pub mod tick;
pub mod timebase;
pub mod trace;
pub mod uart;
pub mod ui;
pub mod usbserial;
pub mod vars;
