//! Firmware update commands and image integrity.
//!
//! The main image region ends with an 8-byte tail, `{length, crc32}`,
//! little-endian. The loader checks it at boot: a plausible length whose
//! CRC matches means the application is intact and gets the CPU. The
//! FW_ERASE / FW_WRITE / FW_CRC commands (normally issued to the loader)
//! rebuild the region and finally the tail.
//!
//! All three handlers run on the background tier through the shared flash
//! device; FW_WRITE range-checks against the tail so an update can't
//! clobber its own bookkeeping before FW_CRC seals it.

use byteorder::{ByteOrder, LittleEndian};

use crate::crc32::CRC32;
use crate::error::Error;
use crate::flash::{self, Flash, MAIN_FW_END, MAIN_FW_START, PAGE_LEN};

/// Erases the whole main image region, page by page.
pub fn handle_erase() -> Result<(), Error> {
    flash::with_device(|f| {
        let mut addr = MAIN_FW_START;
        while addr < MAIN_FW_END {
            f.erase_page(addr)?;
            addr += PAGE_LEN;
        }
        Ok(())
    })
}

/// FW_WRITE payload: `<addr:u32> <data...>`. Address and length must be
/// multiples of 8 (the flash programs 64 bits at a time) and stay clear of
/// the tail.
pub fn handle_write(cmd: &[u8]) -> Result<(), Error> {
    // Header, address, and at least one double word.
    if cmd.len() < 14 {
        return Err(Error::MissingData);
    }
    let addr = LittleEndian::read_u32(&cmd[2..6]);
    let data = &cmd[6..];
    validate_write(addr, data.len())?;

    flash::with_device(|f| f.program(addr, data))
}

fn validate_write(addr: u32, len: usize) -> Result<(), Error> {
    if addr & 7 != 0 || len & 7 != 0 {
        return Err(Error::Range);
    }
    if addr < MAIN_FW_START {
        return Err(Error::Range);
    }
    if addr as u64 + len as u64 >= (MAIN_FW_END - 8) as u64 {
        return Err(Error::Range);
    }
    Ok(())
}

/// FW_CRC payload: `<length:u32> <crc:u32>`. Writes the tail record the
/// loader inspects.
pub fn handle_crc(cmd: &[u8]) -> Result<(), Error> {
    if cmd.len() < 10 {
        return Err(Error::MissingData);
    }
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&cmd[2..10]);
    flash::with_device(|f| f.program(MAIN_FW_END - 8, &tail))
}

/// Verifies the main image against its tail. Called by the loader at boot.
pub fn check_main_image<F: Flash>(f: &F) -> bool {
    let mut tail = [0u8; 8];
    f.read(MAIN_FW_END - 8, &mut tail);
    let length = LittleEndian::read_u32(&tail[0..4]);
    let want = LittleEndian::read_u32(&tail[4..8]);

    let region = MAIN_FW_END - MAIN_FW_START;
    if length >= region - 8 {
        return false;
    }

    let mut digest = CRC32.digest();
    let mut buf = [0u8; 256];
    let mut addr = MAIN_FW_START;
    let mut left = length as usize;
    while left > 0 {
        let n = left.min(buf.len());
        f.read(addr, &mut buf[..n]);
        digest.update(&buf[..n]);
        addr += n as u32;
        left -= n;
    }
    digest.finalize() == want
}

/// Jumps into the main image: stack pointer and reset vector from its
/// vector table, VTOR pointed at it first.
#[cfg(target_os = "none")]
pub fn jump_to_main() -> ! {
    unsafe {
        let vectors = MAIN_FW_START as *const u32;
        let sp = core::ptr::read_volatile(vectors);
        let reset = core::ptr::read_volatile(vectors.add(1));
        (*cortex_m::peripheral::SCB::PTR).vtor.write(MAIN_FW_START);
        cortex_m::asm::bootstrap(sp as *const u32, reset as *const u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::sim::SimFlash;

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn full_update_cycle_validates() {
        let mut f = SimFlash::new();

        // Nothing there yet: blank flash fails the check.
        assert!(!check_main_image(&f));

        let img = image(4096);
        let mut addr = MAIN_FW_START;
        while addr < MAIN_FW_START + img.len() as u32 {
            f.erase_page(addr).unwrap();
            addr += PAGE_LEN;
        }
        f.program(MAIN_FW_START, &img).unwrap();

        let crc = crate::crc32::checksum(&img);
        let mut tail = [0u8; 8];
        LittleEndian::write_u32(&mut tail[0..4], img.len() as u32);
        LittleEndian::write_u32(&mut tail[4..8], crc);
        // Tail page is far above the image; erase it before programming.
        f.erase_page((MAIN_FW_END - 8) & !(PAGE_LEN - 1)).unwrap();
        f.program(MAIN_FW_END - 8, &tail).unwrap();

        assert!(check_main_image(&f));

        // A flipped byte breaks it.
        f.erase_page(MAIN_FW_START).unwrap();
        assert!(!check_main_image(&f));
    }

    #[test]
    fn absurd_length_rejected_without_reading() {
        let mut f = SimFlash::new();
        let mut tail = [0u8; 8];
        LittleEndian::write_u32(&mut tail[0..4], 0xFFFF_FFFF);
        f.erase_page((MAIN_FW_END - 8) & !(PAGE_LEN - 1)).unwrap();
        f.program(MAIN_FW_END - 8, &tail).unwrap();
        assert!(!check_main_image(&f));
    }

    #[test]
    fn write_alignment_and_range_rules() {
        assert_eq!(validate_write(MAIN_FW_START, 8), Ok(()));
        // Misaligned address.
        assert_eq!(validate_write(MAIN_FW_START + 4, 8), Err(Error::Range));
        // Ragged length.
        assert_eq!(validate_write(MAIN_FW_START, 12), Err(Error::Range));
        // Below the region.
        assert_eq!(validate_write(MAIN_FW_START - 8, 8), Err(Error::Range));
        // Into the tail.
        assert_eq!(validate_write(MAIN_FW_END - 8, 8), Err(Error::Range));
        assert_eq!(validate_write(MAIN_FW_END - 16, 8), Err(Error::Range));

        // Short command bails before the argument checks.
        let cmd = [0u8; 13];
        assert_eq!(handle_write(&cmd), Err(Error::MissingData));
    }
}
