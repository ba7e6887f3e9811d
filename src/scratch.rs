//! The debug scratch region.
//!
//! The first 128 bytes of RAM are reserved by the linker script and never
//! touched by program data. They exist for live instrumentation: the
//! PEEK/POKE commands treat addresses below 0x80 as offsets into this
//! region, the trace recorder can sample its first four half-words, the UI
//! reads its screen selector here, and the last word is the loader swap
//! flag. All accesses are volatile so pokes from the host are seen.

pub const SCRATCH_BASE: usize = 0x2000_0000;
pub const SCRATCH_LEN: usize = 0x80;

/// Half-word slots usable as trace sources 1..=4.
pub const DBG_WORDS: usize = SCRATCH_LEN / 2;

/// Byte offset of the UI screen selector.
pub const SCREEN_SELECT: usize = 0x08;

/// Word index of the loader swap flag (the last word of the region), and
/// the value that means "stay in the loader".
pub const SWAP_FLAG_WORD: usize = SCRATCH_LEN / 4 - 1;
pub const SWAP_MAGIC: u32 = 0x5F4C_4452;

/// Zeroes the whole region. Called once at boot, before interrupts.
pub fn clear() {
    for i in 0..SCRATCH_LEN / 4 {
        write_u32(i, 0);
    }
}

pub fn read_u8(ndx: usize) -> u8 {
    if ndx >= SCRATCH_LEN {
        return 0;
    }
    unsafe { core::ptr::read_volatile((SCRATCH_BASE + ndx) as *const u8) }
}

pub fn read_u16(ndx: usize) -> u16 {
    if ndx >= DBG_WORDS {
        return 0;
    }
    unsafe { core::ptr::read_volatile((SCRATCH_BASE + ndx * 2) as *const u16) }
}

pub fn read_u32(ndx: usize) -> u32 {
    if ndx >= SCRATCH_LEN / 4 {
        return 0;
    }
    unsafe { core::ptr::read_volatile((SCRATCH_BASE + ndx * 4) as *const u32) }
}

pub fn write_u8(ndx: usize, val: u8) {
    if ndx < SCRATCH_LEN {
        unsafe { core::ptr::write_volatile((SCRATCH_BASE + ndx) as *mut u8, val) }
    }
}

pub fn write_u16(ndx: usize, val: u16) {
    if ndx < DBG_WORDS {
        unsafe {
            core::ptr::write_volatile((SCRATCH_BASE + ndx * 2) as *mut u16, val)
        }
    }
}

pub fn write_u32(ndx: usize, val: u32) {
    if ndx < SCRATCH_LEN / 4 {
        unsafe {
            core::ptr::write_volatile((SCRATCH_BASE + ndx * 4) as *mut u32, val)
        }
    }
}

/// True if the application parked us here on purpose (set by the host poking
/// [`SWAP_MAGIC`] into the flag word before resetting into the loader).
pub fn swap_requested() -> bool {
    read_u32(SWAP_FLAG_WORD) == SWAP_MAGIC
}

pub fn clear_swap_flag() {
    write_u32(SWAP_FLAG_WORD, 0);
}
