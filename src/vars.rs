//! The variable registry.
//!
//! Variables are the main way a host reads and writes sensor state: a flat
//! table of typed cells indexed by a 16-bit id, accessed by the binary GET
//! and SET commands. Each cell binds accessor functions at registration;
//! most use plain typed load/store semantics, but a cell may install hooks
//! with side effects (recomputing offsets, persisting to flash).
//!
//! Accessors are a tagged enum of function pointers rather than trait
//! objects; everything stays in statics and nothing allocates. Read-only
//! cells are built with the `deny_*` setters so a stray set fails even
//! before the registry's own flag check; both layers return `ReadOnly`.
//!
//! Wire format: little-endian integers; floats travel as their IEEE-754
//! bit pattern in the same order.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::Error;
use crate::util::spin_lock::SpinLock;

/// Highest variable id plus one. The table is indexed directly by id.
pub const VAR_MAX: usize = 50;

/// Longest variable payload (the 20-point calibration array).
pub const VAR_BYTES_MAX: usize = 80;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct VarFlags: u8 {
        const READ_ONLY = 0x01;
    }
}

/// Typed accessor pair for a cell.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Accessors {
    I16 {
        get: fn() -> i16,
        set: fn(i16) -> Result<(), Error>,
    },
    I32 {
        get: fn() -> i32,
        set: fn(i32) -> Result<(), Error>,
    },
    F32 {
        get: fn() -> f32,
        set: fn(f32) -> Result<(), Error>,
    },
    /// Fixed-length array of `i32`, element getter plus whole-array setter.
    I32Array {
        get: fn(usize) -> i32,
        set: fn(&[i32]) -> Result<(), Error>,
        len: usize,
    },
    /// Fixed-length array of `f32`, element getter plus whole-array setter.
    F32Array {
        get: fn(usize) -> f32,
        set: fn(&[f32]) -> Result<(), Error>,
        len: usize,
    },
}

/// One registry cell. Declared as a `static` by the owning module and
/// handed to [`register`] during init.
#[derive(Debug, PartialEq)]
pub struct VarDef {
    pub id: u16,
    /// Human-readable name, for hosts that enumerate.
    pub name: &'static str,
    pub flags: VarFlags,
    pub access: Accessors,
}

impl VarDef {
    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        match self.access {
            Accessors::I16 { .. } => 2,
            Accessors::I32 { .. } | Accessors::F32 { .. } => 4,
            Accessors::I32Array { len, .. } | Accessors::F32Array { len, .. } => 4 * len,
        }
    }
}

/// Always-failing setters for read-only cells.
pub fn deny_i16(_: i16) -> Result<(), Error> {
    Err(Error::ReadOnly)
}
pub fn deny_i32(_: i32) -> Result<(), Error> {
    Err(Error::ReadOnly)
}
pub fn deny_f32(_: f32) -> Result<(), Error> {
    Err(Error::ReadOnly)
}

pub struct Registry {
    cells: [Option<&'static VarDef>; VAR_MAX],
}

impl Registry {
    pub const fn new() -> Self {
        Registry {
            cells: [None; VAR_MAX],
        }
    }

    pub fn register(&mut self, def: &'static VarDef) -> Result<(), Error> {
        let ndx = def.id as usize;
        if ndx >= VAR_MAX || def.size() > VAR_BYTES_MAX {
            return Err(Error::Range);
        }
        if self.cells[ndx].is_some() {
            return Err(Error::AlreadyDefined);
        }
        self.cells[ndx] = Some(def);
        Ok(())
    }

    pub fn lookup(&self, id: u16) -> Result<&'static VarDef, Error> {
        self.cells
            .get(id as usize)
            .and_then(|c| *c)
            .ok_or(Error::UnknownVar)
    }

    pub fn find(&self, name: &str) -> Option<&'static VarDef> {
        self.cells
            .iter()
            .filter_map(|c| *c)
            .find(|d| d.name == name)
    }

    /// Reads cell `id` into `out`, returning the byte count.
    pub fn get_bytes(&self, id: u16, out: &mut [u8]) -> Result<usize, Error> {
        let def = self.lookup(id)?;
        let n = def.size();
        if out.len() < n {
            return Err(Error::MissingData);
        }
        match def.access {
            Accessors::I16 { get, .. } => LittleEndian::write_i16(out, get()),
            Accessors::I32 { get, .. } => LittleEndian::write_i32(out, get()),
            Accessors::F32 { get, .. } => {
                LittleEndian::write_u32(out, get().to_bits())
            }
            Accessors::I32Array { get, len, .. } => {
                for i in 0..len {
                    LittleEndian::write_i32(&mut out[4 * i..], get(i));
                }
            }
            Accessors::F32Array { get, len, .. } => {
                for i in 0..len {
                    LittleEndian::write_u32(&mut out[4 * i..], get(i).to_bits());
                }
            }
        }
        Ok(n)
    }

    /// Writes cell `id` from `data` through its setter.
    pub fn set_bytes(&self, id: u16, data: &[u8]) -> Result<(), Error> {
        let def = self.lookup(id)?;
        if def.flags.contains(VarFlags::READ_ONLY) {
            return Err(Error::ReadOnly);
        }
        if data.len() < def.size() {
            return Err(Error::MissingData);
        }
        match def.access {
            Accessors::I16 { set, .. } => set(LittleEndian::read_i16(data)),
            Accessors::I32 { set, .. } => set(LittleEndian::read_i32(data)),
            Accessors::F32 { set, .. } => {
                set(f32::from_bits(LittleEndian::read_u32(data)))
            }
            Accessors::I32Array { set, len, .. } => {
                let mut vals = [0i32; VAR_BYTES_MAX / 4];
                for i in 0..len {
                    vals[i] = LittleEndian::read_i32(&data[4 * i..]);
                }
                set(&vals[..len])
            }
            Accessors::F32Array { set, len, .. } => {
                let mut vals = [0f32; VAR_BYTES_MAX / 4];
                for i in 0..len {
                    vals[i] = f32::from_bits(LittleEndian::read_u32(&data[4 * i..]));
                }
                set(&vals[..len])
            }
        }
    }
}

static REGISTRY: SpinLock<Registry> = SpinLock::new(Registry::new());

/// Adds a cell to the global registry. Init-time, background tier.
pub fn register(def: &'static VarDef) -> Result<(), Error> {
    REGISTRY.lock().register(def)
}

pub fn get_bytes(id: u16, out: &mut [u8]) -> Result<usize, Error> {
    REGISTRY.lock().get_bytes(id, out)
}

pub fn set_bytes(id: u16, data: &[u8]) -> Result<(), Error> {
    REGISTRY.lock().set_bytes(id, data)
}

/// Payload size of a registered cell.
pub fn size_of(id: u16) -> Result<usize, Error> {
    Ok(REGISTRY.lock().lookup(id)?.size())
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

    static CELL_I32: AtomicI32 = AtomicI32::new(0);
    static CELL_F32: AtomicU32 = AtomicU32::new(0);
    static CELL_ARY: SpinLock<[i32; 3]> = SpinLock::new([0; 3]);

    fn get_i32() -> i32 {
        CELL_I32.load(Ordering::Relaxed)
    }
    fn set_i32(v: i32) -> Result<(), Error> {
        CELL_I32.store(v, Ordering::Relaxed);
        Ok(())
    }
    fn get_f32() -> f32 {
        f32::from_bits(CELL_F32.load(Ordering::Relaxed))
    }
    fn set_f32(v: f32) -> Result<(), Error> {
        CELL_F32.store(v.to_bits(), Ordering::Relaxed);
        Ok(())
    }
    fn get_ary(i: usize) -> i32 {
        CELL_ARY.lock()[i]
    }
    fn set_ary(v: &[i32]) -> Result<(), Error> {
        CELL_ARY.lock().copy_from_slice(v);
        Ok(())
    }

    static V_INT: VarDef = VarDef {
        id: 1,
        name: "v_int",
        flags: VarFlags::empty(),
        access: Accessors::I32 {
            get: get_i32,
            set: set_i32,
        },
    };
    static V_FLT: VarDef = VarDef {
        id: 2,
        name: "v_flt",
        flags: VarFlags::empty(),
        access: Accessors::F32 {
            get: get_f32,
            set: set_f32,
        },
    };
    static V_RO: VarDef = VarDef {
        id: 3,
        name: "v_ro",
        flags: VarFlags::READ_ONLY,
        access: Accessors::I32 {
            get: get_i32,
            set: deny_i32,
        },
    };
    static V_ARY: VarDef = VarDef {
        id: 4,
        name: "v_ary",
        flags: VarFlags::empty(),
        access: Accessors::I32Array {
            get: get_ary,
            set: set_ary,
            len: 3,
        },
    };

    fn registry() -> Registry {
        let mut r = Registry::new();
        r.register(&V_INT).unwrap();
        r.register(&V_FLT).unwrap();
        r.register(&V_RO).unwrap();
        r.register(&V_ARY).unwrap();
        r
    }

    #[test]
    fn set_then_get_roundtrips_bytes() {
        let r = registry();
        let payload = [0x12, 0x34, 0x56, 0x78];
        r.set_bytes(1, &payload).unwrap();
        assert_eq!(CELL_I32.load(Ordering::Relaxed), 0x7856_3412);

        let mut out = [0u8; 4];
        assert_eq!(r.get_bytes(1, &mut out).unwrap(), 4);
        assert_eq!(out, payload);
    }

    #[test]
    fn float_travels_as_bit_pattern() {
        let r = registry();
        let bits = 1.5f32.to_bits().to_le_bytes();
        r.set_bytes(2, &bits).unwrap();
        assert_eq!(get_f32(), 1.5);
        let mut out = [0u8; 4];
        r.get_bytes(2, &mut out).unwrap();
        assert_eq!(out, bits);
    }

    #[test]
    fn array_cells() {
        let r = registry();
        let mut data = [0u8; 12];
        LittleEndian::write_i32_into(&[7, -8, 9], &mut data);
        r.set_bytes(4, &data).unwrap();
        assert_eq!(*CELL_ARY.lock(), [7, -8, 9]);
        let mut out = [0u8; 12];
        assert_eq!(r.get_bytes(4, &mut out).unwrap(), 12);
        assert_eq!(out, data);
    }

    #[test]
    fn read_only_rejected() {
        let r = registry();
        assert_eq!(r.set_bytes(3, &[0; 4]), Err(Error::ReadOnly));
        // The deny setter holds the line even if called directly.
        assert_eq!(deny_i32(5), Err(Error::ReadOnly));
    }

    #[test]
    fn registration_errors() {
        let mut r = registry();
        assert_eq!(r.register(&V_INT), Err(Error::AlreadyDefined));
        assert_eq!(r.lookup(40), Err(Error::UnknownVar));

        static V_BIG: VarDef = VarDef {
            id: VAR_MAX as u16,
            name: "v_big",
            flags: VarFlags::empty(),
            access: Accessors::I32 {
                get: get_i32,
                set: set_i32,
            },
        };
        assert_eq!(r.register(&V_BIG), Err(Error::Range));
    }

    #[test]
    fn short_buffers_rejected() {
        let r = registry();
        let mut out = [0u8; 2];
        assert_eq!(r.get_bytes(1, &mut out), Err(Error::MissingData));
        assert_eq!(r.set_bytes(1, &[1, 2]), Err(Error::MissingData));
    }

    #[test]
    fn find_by_name() {
        let r = registry();
        assert_eq!(r.find("v_flt").map(|d| d.id), Some(2));
        assert!(r.find("nope").is_none());
    }
}
