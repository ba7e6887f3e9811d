//! Flash geometry and the programming seam.
//!
//! Geometry constants are parameters of this build (an L4x2 part), not
//! invariants: 2 KiB pages, programmed as aligned 64-bit double words. The
//! [`Flash`] trait is the seam between flash consumers (the persistent
//! store, firmware update) and the controller, so the same logic runs
//! against simulated flash on the host.
//!
//! All erases and programs happen on the background tier; nothing here is
//! called from an interrupt.

use crate::device;
use crate::error::Error;
use crate::util::spin_lock::SpinLock;

pub const FLASH_BASE: u32 = 0x0800_0000;
pub const FLASH_SIZE: u32 = 512 * 1024;
pub const FLASH_END: u32 = FLASH_BASE + FLASH_SIZE;
pub const PAGE_LEN: u32 = 2048;

/// The loader image occupies the first 32 KiB.
pub const LOADER_START: u32 = FLASH_BASE;
pub const MAIN_FW_START: u32 = FLASH_BASE + 0x8000;
/// End of the main image region; its last 8 bytes are the `{length, crc}`
/// tail.
pub const MAIN_FW_END: u32 = STORE_START;

/// The persistent store ping-pongs across the last two pages.
pub const STORE_START: u32 = FLASH_END - 2 * PAGE_LEN;

/// Erase/program/read operations over a byte-addressed flash array.
pub trait Flash {
    /// Erases the page starting at `addr` (must be page-aligned and inside
    /// the array).
    fn erase_page(&mut self, addr: u32) -> Result<(), Error>;

    /// Programs `data` at `addr`. Both must be 8-byte aligned; `data` is
    /// written as consecutive 64-bit double words.
    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), Error>;

    /// Copies `out.len()` bytes starting at `addr` into `out`.
    fn read(&self, addr: u32, out: &mut [u8]);
}

fn check_program_args(addr: u32, len: usize) -> Result<(), Error> {
    if addr < FLASH_BASE || addr as u64 + len as u64 > FLASH_END as u64 {
        return Err(Error::Range);
    }
    if addr & 7 != 0 || len & 7 != 0 {
        return Err(Error::Range);
    }
    Ok(())
}

fn check_erase_args(addr: u32) -> Result<(), Error> {
    if addr < FLASH_BASE || addr >= FLASH_END {
        return Err(Error::Range);
    }
    if addr & (PAGE_LEN - 1) != 0 {
        return Err(Error::Range);
    }
    Ok(())
}

/// The L4 flash controller.
pub struct FlashCtrl {
    flash: device::FLASH,
}

/// Error bits in FLASH_SR: everything except EOP and BSY.
const SR_ERRORS: u32 = 0x0000_C3FA;
/// EOP plus the error bits, for clearing status before an operation.
const SR_CLEAR: u32 = 0x0000_C3FB;

impl FlashCtrl {
    /// Takes the controller. Call after [`crate::clock::init`] has finished
    /// with the ACR register.
    pub fn new(flash: device::FLASH) -> Self {
        FlashCtrl { flash }
    }

    fn unlock(&self) {
        self.flash.sr.write(|w| unsafe { w.bits(SR_CLEAR) });
        self.flash.keyr.write(|w| unsafe { w.bits(0x4567_0123) });
        self.flash.keyr.write(|w| unsafe { w.bits(0xCDEF_89AB) });
    }

    fn lock(&self) {
        self.flash.cr.write(|w| w.lock().set_bit());
    }

    fn wait_not_busy(&self) {
        while self.flash.sr.read().bsy().bit_is_set() {}
    }

    fn status(&self) -> Result<(), Error> {
        if self.flash.sr.read().bits() & SR_ERRORS != 0 {
            Err(Error::Flash)
        } else {
            Ok(())
        }
    }
}

impl Flash for FlashCtrl {
    fn erase_page(&mut self, addr: u32) -> Result<(), Error> {
        check_erase_args(addr)?;

        self.unlock();
        let page = (addr - FLASH_BASE) / PAGE_LEN;
        self.flash
            .cr
            .write(|w| unsafe { w.per().set_bit().pnb().bits(page as u8) });
        self.flash.cr.modify(|_, w| w.start().set_bit());
        self.wait_not_busy();
        let result = self.status();
        self.lock();
        result
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        check_program_args(addr, data.len())?;

        self.unlock();
        self.flash.cr.write(|w| w.pg().set_bit());

        let mut dest = addr as *mut u32;
        for pair in data.chunks_exact(8) {
            let lo = u32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
            let hi = u32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
            // Safety: range-checked above; the controller requires exactly
            // two word writes per double word while PG is set.
            unsafe {
                core::ptr::write_volatile(dest, lo);
                core::ptr::write_volatile(dest.add(1), hi);
                dest = dest.add(2);
            }
            self.wait_not_busy();
            if self.status().is_err() {
                break;
            }
            // Retire EOP for the next double word.
            self.flash.sr.write(|w| unsafe { w.bits(1) });
        }

        let result = self.status();
        self.lock();
        result
    }

    fn read(&self, addr: u32, out: &mut [u8]) {
        // Flash is memory-mapped for reads.
        for (i, b) in out.iter_mut().enumerate() {
            // Safety: reads within the flash address window.
            *b = unsafe { core::ptr::read_volatile((addr as usize + i) as *const u8) };
        }
    }
}

/// The one flash device, behind a lock because two background paths (store
/// updates, firmware update commands) share it.
pub enum FlashDev {
    Ctrl(FlashCtrl),
    #[cfg(any(test, feature = "std"))]
    Sim(sim::SimFlash),
}

impl Flash for FlashDev {
    fn erase_page(&mut self, addr: u32) -> Result<(), Error> {
        match self {
            FlashDev::Ctrl(c) => c.erase_page(addr),
            #[cfg(any(test, feature = "std"))]
            FlashDev::Sim(s) => s.erase_page(addr),
        }
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        match self {
            FlashDev::Ctrl(c) => c.program(addr, data),
            #[cfg(any(test, feature = "std"))]
            FlashDev::Sim(s) => s.program(addr, data),
        }
    }

    fn read(&self, addr: u32, out: &mut [u8]) {
        match self {
            FlashDev::Ctrl(c) => c.read(addr, out),
            #[cfg(any(test, feature = "std"))]
            FlashDev::Sim(s) => s.read(addr, out),
        }
    }
}

static DEVICE: SpinLock<Option<FlashDev>> = SpinLock::new(None);

/// Installs the flash device. Once, at boot.
pub fn init_device(dev: FlashDev) {
    *DEVICE.lock() = Some(dev);
}

/// Runs `f` against the flash device. Background tier only.
pub fn with_device<R>(
    f: impl FnOnce(&mut FlashDev) -> Result<R, Error>,
) -> Result<R, Error> {
    let mut guard = DEVICE.lock();
    match guard.as_mut() {
        Some(dev) => f(dev),
        None => Err(Error::Flash),
    }
}

/// RAM-backed flash with the same geometry and failure injection, for the
/// host test suite.
#[cfg(any(test, feature = "std"))]
pub mod sim {
    use super::*;

    pub struct SimFlash {
        mem: std::vec::Vec<u8>,
        /// Remaining flash operations before simulated power loss. The
        /// operation that hits zero is applied partially (erase: half the
        /// page; program: half the data) and fails; everything after fails
        /// outright.
        pub ops_left: Option<u32>,
    }

    impl SimFlash {
        pub fn new() -> Self {
            SimFlash {
                mem: std::vec![0xFF; FLASH_SIZE as usize],
                ops_left: None,
            }
        }

        fn take_op(&mut self) -> Result<bool, Error> {
            match self.ops_left {
                None => Ok(false),
                Some(0) => Err(Error::Flash),
                Some(1) => {
                    self.ops_left = Some(0);
                    Ok(true) // this op dies halfway through
                }
                Some(n) => {
                    self.ops_left = Some(n - 1);
                    Ok(false)
                }
            }
        }
    }

    impl Flash for SimFlash {
        fn erase_page(&mut self, addr: u32) -> Result<(), Error> {
            check_erase_args(addr)?;
            let partial = self.take_op()?;
            let start = (addr - FLASH_BASE) as usize;
            let len = if partial {
                PAGE_LEN as usize / 2
            } else {
                PAGE_LEN as usize
            };
            for b in &mut self.mem[start..start + len] {
                *b = 0xFF;
            }
            if partial {
                Err(Error::Flash)
            } else {
                Ok(())
            }
        }

        fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
            check_program_args(addr, data.len())?;
            let partial = self.take_op()?;
            let start = (addr - FLASH_BASE) as usize;
            let len = if partial { data.len() / 2 & !7 } else { data.len() };
            for (i, &b) in data[..len].iter().enumerate() {
                // NOR behavior: programming can only clear bits.
                self.mem[start + i] &= b;
            }
            if partial {
                Err(Error::Flash)
            } else {
                Ok(())
            }
        }

        fn read(&self, addr: u32, out: &mut [u8]) {
            let start = (addr - FLASH_BASE) as usize;
            out.copy_from_slice(&self.mem[start..start + out.len()]);
        }
    }
}
