//! Non-volatile parameter storage.
//!
//! A fixed 256-byte record ping-pongs across the two reserved flash pages.
//! On startup every 256-byte slot is scanned for a good mark and matching
//! CRC. There should be exactly one valid copy; if a power loss during an
//! update left two, the one with the (modularly) higher counter wins and
//! the other is invalidated.
//!
//! An update writes the patched record to the *next* slot first, verifies
//! it byte for byte, and only then corrupts the old copy, so a valid
//! record stays reachable at every instant in between.

use byteorder::{ByteOrder, LittleEndian};
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::crc32;
use crate::error::Error;
use crate::flash::{self, Flash, PAGE_LEN, STORE_START};
use crate::util::spin_lock::SpinLock;

pub const STORE_DATA_SIZE: usize = 256;

/// Slots across the two pages.
const SLOT_COUNT: u32 = 2 * PAGE_LEN / STORE_DATA_SIZE as u32;

/// Mark byte of a valid record. Anything but 0x00 (invalidated) or 0xFF
/// (erased); the value itself is arbitrary.
pub const GOOD_MARK: u8 = 0x55;

pub const CAL_POINTS: usize = 20;

/// The record layout, exactly as it sits in flash (little-endian).
#[derive(Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct StoreData {
    /// CRC-32 of everything after this field.
    pub crc: u32,
    /// Incremented (mod 256) on each write; the recency tiebreak.
    pub count: u8,
    /// [`GOOD_MARK`] when valid.
    pub mark: u8,
    /// Bit-mapped info about the record, currently always 0.
    pub info: u16,
    /// Pressure sensor offsets.
    pub p_off: [i32; 2],
    /// Flow calibration curve.
    pub pcal: [f32; CAL_POINTS],
    /// Reserved, kept zeroed.
    pub rsvd: [u32; 40],
}

const_assert_eq!(core::mem::size_of::<StoreData>(), STORE_DATA_SIZE);

/// Byte offsets of the patchable fields, used with [`update_field`].
pub const OFF_POFF: usize = 8;
pub const OFF_PCAL: usize = 16;

impl StoreData {
    fn body_crc(&self) -> u32 {
        crc32::checksum(&self.as_bytes()[4..])
    }

    fn is_valid(&self) -> bool {
        self.mark == GOOD_MARK && self.crc == self.body_crc()
    }

    fn seal(&mut self) {
        self.mark = GOOD_MARK;
        self.crc = self.body_crc();
    }
}

/// Bookkeeping for the store: which slot currently holds the live record.
pub struct Store {
    current: u32,
}

fn read_record<F: Flash>(f: &F, addr: u32) -> StoreData {
    let mut rec = StoreData::new_zeroed();
    f.read(addr, rec.as_mut_bytes());
    rec
}

/// Corrupts the record at `addr` by zeroing its first 8 bytes (CRC, count,
/// mark, info). Zero can always be programmed over live flash.
fn invalidate<F: Flash>(f: &mut F, addr: u32) -> Result<(), Error> {
    f.program(addr, &[0u8; 8])
}

fn save_block<F: Flash>(f: &mut F, rec: &StoreData, addr: u32) -> Result<(), Error> {
    if addr & (PAGE_LEN - 1) == 0 {
        f.erase_page(addr)?;
    }
    f.program(addr, rec.as_bytes())?;

    let back = read_record(f, addr);
    if back.as_bytes() != rec.as_bytes() {
        return Err(Error::Verify);
    }
    Ok(())
}

impl Store {
    /// Scans the reserved pages for the live record, resolving duplicate
    /// survivors of an interrupted update. If nothing valid exists (first
    /// boot, or both pages scrambled) a zeroed record is created.
    pub fn init<F: Flash>(f: &mut F) -> Result<Store, Error> {
        let mut current: Option<u32> = None;

        for slot in 0..SLOT_COUNT {
            let addr = STORE_START + slot * STORE_DATA_SIZE as u32;
            let rec = read_record(f, addr);
            if !rec.is_valid() {
                continue;
            }

            match current {
                None => current = Some(addr),
                Some(cur) => {
                    // Two valid copies: power died between the new-slot
                    // write and the old-slot invalidation. The modular
                    // counter compare survives the 255 -> 0 wrap.
                    let a = read_record(f, cur);
                    let diff = rec.count.wrapping_sub(a.count) as i8;
                    if diff > 0 {
                        let _ = invalidate(f, cur);
                        current = Some(addr);
                    } else {
                        let _ = invalidate(f, addr);
                    }
                }
            }
        }

        if let Some(addr) = current {
            return Ok(Store { current: addr });
        }

        let mut blank = StoreData::new_zeroed();
        blank.seal();
        f.erase_page(STORE_START)?;
        f.program(STORE_START, blank.as_bytes())?;
        Ok(Store {
            current: STORE_START,
        })
    }

    /// Address of the live slot.
    pub fn current_addr(&self) -> u32 {
        self.current
    }

    /// Copy of the live record.
    pub fn record<F: Flash>(&self, f: &F) -> StoreData {
        read_record(f, self.current)
    }

    /// Patches `bytes` into the record at `offset`, then writes the result
    /// to the next slot and invalidates the old one. The leading 8 bytes
    /// (CRC, counter, mark, info) are not patchable.
    pub fn update<F: Flash>(
        &mut self,
        f: &mut F,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), Error> {
        if offset < 8 || offset + bytes.len() > STORE_DATA_SIZE {
            return Err(Error::Range);
        }

        let mut rec = self.record(f);
        rec.as_mut_bytes()[offset..offset + bytes.len()].copy_from_slice(bytes);
        for r in rec.rsvd.iter_mut() {
            *r = 0;
        }
        rec.count = rec.count.wrapping_add(1);
        rec.seal();

        // Next slot up; crossing into the other page triggers its erase
        // inside save_block.
        let mut addr = self.current + STORE_DATA_SIZE as u32;

        let mut result = if addr + STORE_DATA_SIZE as u32 <= flash::FLASH_END {
            save_block(f, &rec, addr)
        } else {
            Err(Error::Range)
        };

        // That shouldn't really fail, but if it does, retry at the first
        // slot of the *other* page, which erases before writing.
        if result.is_err() {
            addr = if self.current < STORE_START + PAGE_LEN {
                STORE_START + PAGE_LEN
            } else {
                STORE_START
            };
            result = save_block(f, &rec, addr);
        }
        result?;

        // Best effort: if the old copy survives, it loses the counter
        // tiebreak at the next scan anyway.
        let _ = invalidate(f, self.current);
        self.current = addr;
        Ok(())
    }
}

static STORE: SpinLock<Option<Store>> = SpinLock::new(None);

/// Scans flash and installs the global store. Once, at boot, after
/// [`flash::init_device`]. Returns a copy of the live record so modules can
/// load their persisted state.
pub fn init_global() -> Result<StoreData, Error> {
    flash::with_device(|f| {
        let store = Store::init(f)?;
        let rec = store.record(f);
        *STORE.lock() = Some(store);
        Ok(rec)
    })
}

/// Patches a field of the persistent record. Background tier only (set
/// hooks, deferred persistence).
pub fn update_field(offset: usize, bytes: &[u8]) -> Result<(), Error> {
    flash::with_device(|f| {
        let mut guard = STORE.lock();
        match guard.as_mut() {
            Some(store) => store.update(f, offset, bytes),
            None => Err(Error::Flash),
        }
    })
}

/// Copy of the live record, or `None` before [`init_global`].
pub fn record() -> Option<StoreData> {
    flash::with_device(|f| {
        let guard = STORE.lock();
        match guard.as_ref() {
            Some(store) => Ok(store.record(f)),
            None => Err(Error::Flash),
        }
    })
    .ok()
}

/// Little-endian encoding helpers for the patchable fields.
pub fn encode_offsets(p_off: &[i32; 2], out: &mut [u8; 8]) {
    LittleEndian::write_i32_into(p_off, out);
}

pub fn encode_cal(pcal: &[f32; CAL_POINTS], out: &mut [u8; CAL_POINTS * 4]) {
    LittleEndian::write_f32_into(pcal, out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::sim::SimFlash;
    use proptest::prelude::*;

    fn valid_slots(f: &SimFlash) -> Vec<(u32, StoreData)> {
        let mut out = Vec::new();
        for slot in 0..SLOT_COUNT {
            let addr = STORE_START + slot * STORE_DATA_SIZE as u32;
            let rec = read_record(f, addr);
            if rec.is_valid() {
                out.push((addr, rec));
            }
        }
        out
    }

    #[test]
    fn first_boot_creates_blank_record() {
        let mut f = SimFlash::new();
        let store = Store::init(&mut f).unwrap();
        let rec = store.record(&f);
        assert!(rec.is_valid());
        assert_eq!(rec.count, 0);
        assert_eq!(rec.p_off, [0, 0]);
        assert_eq!(valid_slots(&f).len(), 1);
    }

    #[test]
    fn update_moves_to_next_slot_and_invalidates() {
        let mut f = SimFlash::new();
        let mut store = Store::init(&mut f).unwrap();
        let first = store.current_addr();

        let mut bytes = [0u8; 8];
        encode_offsets(&[0x1234_5678, -5], &mut bytes);
        store.update(&mut f, OFF_POFF, &bytes).unwrap();

        assert_eq!(store.current_addr(), first + STORE_DATA_SIZE as u32);
        let rec = store.record(&f);
        assert_eq!(rec.p_off, [0x1234_5678, -5]);
        assert_eq!(rec.count, 1);
        // Exactly one valid slot remains.
        assert_eq!(valid_slots(&f).len(), 1);
    }

    #[test]
    fn update_rejects_header_and_out_of_range() {
        let mut f = SimFlash::new();
        let mut store = Store::init(&mut f).unwrap();
        assert_eq!(store.update(&mut f, 0, &[0; 4]), Err(Error::Range));
        assert_eq!(store.update(&mut f, 4, &[0; 4]), Err(Error::Range));
        assert_eq!(
            store.update(&mut f, STORE_DATA_SIZE - 2, &[0; 4]),
            Err(Error::Range)
        );
    }

    #[test]
    fn wraps_through_both_pages() {
        let mut f = SimFlash::new();
        let mut store = Store::init(&mut f).unwrap();

        // Enough updates to lap the two pages twice.
        for i in 0..(SLOT_COUNT * 2 + 3) {
            let mut bytes = [0u8; 8];
            encode_offsets(&[i as i32, -(i as i32)], &mut bytes);
            store.update(&mut f, OFF_POFF, &bytes).unwrap();
            assert_eq!(valid_slots(&f).len(), 1);
        }
        let rec = store.record(&f);
        assert_eq!(rec.p_off[0] as u32, SLOT_COUNT * 2 + 2);
    }

    #[test]
    fn counter_wrap_tiebreak() {
        // Forge two valid slots with counters 255 and 0; 0 is newer.
        let mut f = SimFlash::new();
        f.erase_page(STORE_START).unwrap();
        f.erase_page(STORE_START + PAGE_LEN).unwrap();

        let mut old = StoreData::new_zeroed();
        old.count = 255;
        old.p_off = [1, 1];
        old.seal();
        f.program(STORE_START, old.as_bytes()).unwrap();

        let mut new = StoreData::new_zeroed();
        new.count = 0;
        new.p_off = [2, 2];
        new.seal();
        f.program(STORE_START + STORE_DATA_SIZE as u32, new.as_bytes())
            .unwrap();

        let store = Store::init(&mut f).unwrap();
        assert_eq!(store.record(&f).p_off, [2, 2]);
        assert_eq!(valid_slots(&f).len(), 1);
    }

    proptest! {
        /// Power loss at any flash operation leaves the store recoverable:
        /// after "reboot" (a fresh scan) a CRC-valid record exists and its
        /// contents are either the pre-update or post-update values, with
        /// the highest counter among valid slots winning.
        #[test]
        fn durability_across_power_loss(
            updates in proptest::collection::vec(any::<(i32, i32)>(), 1..6),
            die_at in 0u32..40,
        ) {
            let mut f = SimFlash::new();
            let mut store = Store::init(&mut f).unwrap();

            let mut committed = store.record(&f).p_off;
            let mut attempted = committed;

            f.ops_left = Some(die_at);
            for (a, b) in updates {
                attempted = [a, b];
                let mut bytes = [0u8; 8];
                encode_offsets(&attempted, &mut bytes);
                match store.update(&mut f, OFF_POFF, &bytes) {
                    Ok(()) => committed = attempted,
                    Err(_) => break,
                }
            }

            // Reboot: power is back, the scan must resolve.
            f.ops_left = None;
            let store = Store::init(&mut f).unwrap();
            let rec = store.record(&f);
            prop_assert!(rec.is_valid());
            prop_assert!(
                rec.p_off == committed || rec.p_off == attempted,
                "recovered {:?}, expected {:?} or {:?}",
                rec.p_off, committed, attempted
            );
            prop_assert_eq!(valid_slots(&f).len(), 1);
        }
    }
}
