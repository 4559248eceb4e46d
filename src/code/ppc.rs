//! 32-bit PowerPC branch encoding.
//!
//! Patch sites only ever need the I-form unconditional branch (`b`/`bl`), the
//! canonical nop, and recognition of `blr` when scanning for exit points.
//! Field layout follows the PowerPC ISA: primary opcode in bits 0-5, the
//! 24-bit LI displacement field in bits 6-29 (word-granular, so a ±32 MiB
//! byte range), AA in bit 30 and LK in bit 31.

use thiserror::Error;

/// `ori r0, r0, 0`, the canonical no-op
pub const NOP: u32 = 0x6000_0000;

/// `blr`, the unconditional return
pub const BLR: u32 = 0x4E80_0020;

/// Primary opcode for the I-form branch
const OPCD_BRANCH: u32 = 18;

/// Mask of the LI displacement field (bits 6-29)
const LI_MASK: u32 = 0x03FF_FFFC;

/// AA bit: absolute rather than relative addressing. Patch branches are
/// always relative, so this is only ever checked, never set.
const AA: u32 = 0x2;

/// LK bit: save the return address in the link register
const LK: u32 = 0x1;

/// Most negative encodable byte displacement
pub const MIN_DISPLACEMENT: i64 = -0x0200_0000;

/// Most positive encodable byte displacement
pub const MAX_DISPLACEMENT: i64 = 0x01FF_FFFC;

/// Errors when encoding a branch
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    /// Site or target is not word aligned
    #[error("branch from {at:#010x} to {target:#010x} is not word aligned")]
    MisalignedBranch {
        /// Address being overwritten
        at: u32,
        /// Branch destination
        target: u32,
    },
    /// Displacement does not fit the 24-bit LI field.
    ///
    /// Never silently truncated: a truncated displacement lands the branch in
    /// unrelated code.
    #[error("branch from {at:#010x} to {target:#010x} exceeds the ±32 MiB displacement range")]
    BranchOutOfRange {
        /// Address being overwritten
        at: u32,
        /// Branch destination
        target: u32,
    },
}

/// Encodes a relative `b` (or `bl` when `link`) at `at` reaching `target`.
pub fn encode_branch(at: u32, target: u32, link: bool) -> Result<u32, EncodeError> {
    if (at | target) & 3 != 0 {
        return Err(EncodeError::MisalignedBranch { at, target });
    }

    let displacement = i64::from(target) - i64::from(at);
    if !(MIN_DISPLACEMENT..=MAX_DISPLACEMENT).contains(&displacement) {
        return Err(EncodeError::BranchOutOfRange { at, target });
    }

    let li = (displacement as u32) & LI_MASK;
    Ok((OPCD_BRANCH << 26) | li | if link { LK } else { 0 })
}

/// Encodes the canonical no-op.
///
/// Takes no address: the nop's encoding is position independent.
pub fn encode_nop() -> u32 {
    NOP
}

/// A decoded relative branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Branch {
    /// Branch destination
    pub target: u32,
    /// Whether the return address is saved
    pub link: bool,
}

/// Decodes an I-form relative branch located at `at`.
///
/// Returns `None` for anything that is not a relative unconditional branch.
pub fn decode_branch(at: u32, word: u32) -> Option<Branch> {
    if word >> 26 != OPCD_BRANCH || word & AA != 0 {
        return None;
    }

    // sign-extend the 26-bit byte displacement
    let displacement = ((word & LI_MASK) << 6) as i32 >> 6;
    Some(Branch {
        target: at.wrapping_add(displacement as u32),
        link: word & LK != 0,
    })
}

/// Whether `word` is the unconditional return instruction
pub fn is_blr(word: u32) -> bool {
    word == BLR
}
