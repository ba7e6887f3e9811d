//! The error taxonomy shared by every command path.
//!
//! Each variant has a fixed one-byte wire encoding; the response header of a
//! binary command carries exactly one of these (or [`ERR_OK`]). Nothing in
//! the firmware throws past this set: ISR-level surprises degrade their
//! state machine to idle instead.

/// Success code in a response header. Success is modeled as `Ok(_)` in Rust
/// code; this constant only exists for the wire.
pub const ERR_OK: u8 = 0;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Error {
    /// Packet XOR didn't come out to 0x55.
    Cksum = 1,
    /// Packet missing its required header.
    ShortCmd = 2,
    /// Unknown opcode.
    BadCmd = 3,
    /// Payload too short for the opcode or variable.
    MissingData = 4,
    /// Variable declared with an unsupported type.
    UnknownType = 5,
    /// Argument or target address outside the permitted range.
    Range = 6,
    /// Variable id registered twice.
    AlreadyDefined = 7,
    /// Variable id not registered.
    UnknownVar = 8,
    /// Set attempted on a read-only cell.
    ReadOnly = 9,
    /// Flash erase/program failure.
    Flash = 10,
    /// Post-write flash compare mismatch.
    Verify = 11,
}

impl Error {
    /// Wire encoding of this error.
    pub fn code(self) -> u8 {
        self as u8
    }
}
