//! # Patch records
//!
//! This module covers the declarations handed in by the front end and the
//! resolved records they lower to

pub mod image;
pub mod verify;

use log::debug;
use thiserror::Error as ThisError;

use crate::addr::{resolve, AddrError, AddressExpr, SymbolTable};
use crate::code::ppc;
use crate::hook::HookDecl;
use crate::Error;

/// Errors when lowering a data write
#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum WriteError {
    /// The write address breaks the alignment rule for its width
    #[error("{width}-byte write at {at:#010x} is not {width}-byte aligned")]
    MisalignedWrite {
        /// Address being written
        at: u32,
        /// Width of the write in bytes
        width: u32,
    },
    /// A conditional write compared values of different widths or encodings
    #[error("conditional write at {at:#010x} compares values of different shapes")]
    MismatchedOperands {
        /// Address being written
        at: u32,
    },
}

/// The payload of a data write.
///
/// Pointer payloads are address expressions in their own right and resolve
/// through the symbol table like any patch site does.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteValue {
    /// One byte
    U8(u8),
    /// A halfword, 2-byte aligned
    U16(u16),
    /// A word, 4-byte aligned
    U32(u32),
    /// A word holding a float bit pattern, 4-byte aligned
    F32(f32),
    /// A word holding a resolved address, 4-byte aligned
    Pointer(AddressExpr),
}

impl WriteValue {
    /// Width of the write in bytes
    pub fn width(&self) -> u32 {
        match self {
            WriteValue::U8(_) => 1,
            WriteValue::U16(_) => 2,
            WriteValue::U32(_) | WriteValue::F32(_) | WriteValue::Pointer(_) => 4,
        }
    }

    /// Whether the payload is a float bit pattern
    fn is_float(&self) -> bool {
        matches!(self, WriteValue::F32(_))
    }

    /// Whether `other` may be compared against this payload in a conditional
    /// write. Widths must match, and floats only compare against floats:
    /// the comparison is a bit-pattern fingerprint, so the operand shapes
    /// have to agree.
    fn comparable(&self, other: &WriteValue) -> bool {
        self.width() == other.width() && self.is_float() == other.is_float()
    }

    /// Big-endian bytes of the payload, resolving pointer payloads
    fn to_be_bytes(&self, table: &SymbolTable) -> Result<Vec<u8>, AddrError> {
        Ok(match self {
            WriteValue::U8(value) => vec![*value],
            WriteValue::U16(value) => value.to_be_bytes().to_vec(),
            WriteValue::U32(value) => value.to_be_bytes().to_vec(),
            WriteValue::F32(value) => value.to_bits().to_be_bytes().to_vec(),
            WriteValue::Pointer(expr) => resolve(expr, table)?
                .finalized()?
                .to_be_bytes()
                .to_vec(),
        })
    }
}

/// One patch declaration as produced by the front end.
///
/// Declarations are consumed exactly once, during a single resolution pass.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchDecl {
    /// Redirect (`link` false) or call out from (`link` true) an instruction
    Branch {
        /// Instruction to overwrite
        at: AddressExpr,
        /// Where to go; zero means "no redirection requested"
        target: AddressExpr,
        /// Whether control returns via the link register
        link: bool,
    },
    /// Overwrite an instruction with the canonical no-op
    Nop {
        /// Instruction to overwrite
        at: AddressExpr,
    },
    /// Unconditional literal write
    Write {
        /// Address to write
        at: AddressExpr,
        /// Payload
        value: WriteValue,
    },
    /// Write performed only if the destination holds an expected prior value
    CondWrite {
        /// Address to write
        at: AddressExpr,
        /// Fingerprint the destination must currently hold
        expected: WriteValue,
        /// Payload written on a match
        value: WriteValue,
    },
    /// Install a hook-and-return trampoline
    Hook(HookDecl),
    /// Redirect every return instruction of a locally defined function
    ExitRedirect {
        /// Name of the function whose exits are rewritten
        function: String,
        /// Where each return should branch instead; zero leaves them alone
        return_at: AddressExpr,
    },
}

/// A loader-visible operation with its address already resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOp {
    /// Write these bytes unconditionally
    Write(Vec<u8>),
    /// Write `value` only if the destination currently holds `expected`
    CondWrite {
        /// Fingerprint bytes, compared exactly
        expected: Vec<u8>,
        /// Replacement bytes, same length as `expected`
        value: Vec<u8>,
    },
    /// Branch whose target is deferred to final link; the loader computes the
    /// displacement once the symbol's address is known
    RelocBranch {
        /// Deferred symbol the branch targets
        symbol: String,
        /// Provisional module-relative offset of the symbol
        offset: u32,
        /// Whether the branch saves the return address
        link: bool,
    },
}

/// One fully resolved patch record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPatch {
    /// Index of the declaration this record came from. Records sharing an
    /// origin belong to one expansion and may legally share addresses with
    /// each other, never with records from another origin.
    pub origin: usize,
    /// Resolved site address
    pub at: u32,
    /// The operation to perform there
    pub op: PatchOp,
}

/// Fails unless `at` is a multiple of `width`
fn check_alignment(at: u32, width: u32) -> Result<(), WriteError> {
    if width > 1 && at % width != 0 {
        return Err(WriteError::MisalignedWrite { at, width });
    }
    Ok(())
}

/// Lowers an unconditional write
pub(crate) fn lower_write(
    origin: usize,
    at: &AddressExpr,
    value: &WriteValue,
    table: &SymbolTable,
) -> Result<ResolvedPatch, Error> {
    let at = resolve(at, table)?.finalized()?;
    check_alignment(at, value.width())?;
    let bytes = value.to_be_bytes(table)?;
    debug!("write {} byte(s) at {at:#010x}", bytes.len());
    Ok(ResolvedPatch {
        origin,
        at,
        op: PatchOp::Write(bytes),
    })
}

/// Lowers a conditional write
pub(crate) fn lower_cond_write(
    origin: usize,
    at: &AddressExpr,
    expected: &WriteValue,
    value: &WriteValue,
    table: &SymbolTable,
) -> Result<ResolvedPatch, Error> {
    let at = resolve(at, table)?.finalized()?;
    if !expected.comparable(value) {
        return Err(WriteError::MismatchedOperands { at }.into());
    }
    check_alignment(at, value.width())?;
    debug!("conditional write of {} byte(s) at {at:#010x}", value.width());
    Ok(ResolvedPatch {
        origin,
        at,
        op: PatchOp::CondWrite {
            expected: expected.to_be_bytes(table)?,
            value: value.to_be_bytes(table)?,
        },
    })
}

/// Lowers a nop overwrite. The site is an instruction, so it must be word
/// aligned like any branch patch site.
pub(crate) fn lower_nop(
    origin: usize,
    at: &AddressExpr,
    table: &SymbolTable,
) -> Result<ResolvedPatch, Error> {
    let at = resolve(at, table)?.finalized()?;
    check_alignment(at, 4)?;
    Ok(ResolvedPatch {
        origin,
        at,
        op: PatchOp::Write(ppc::encode_nop().to_be_bytes().to_vec()),
    })
}
