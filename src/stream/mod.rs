//! # Patch stream
//!
//! This module covers the final artifact: an address-sorted, collision-free
//! sequence of operations for the runtime loader, and its packed binary form

use std::io::{self, Write};

use byteorder::{BigEndian, WriteBytesExt};
use log::debug;
use thiserror::Error;

use crate::patch::{PatchOp, ResolvedPatch};

/// Errors when combining resolved records into one stream
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmitError {
    /// Two independent declarations resolved to the same site. Records may
    /// only share an address inside one declaration's own expansion.
    #[error("two patch declarations both target {addr:#010x}")]
    OverlappingPatch {
        /// The contested address
        addr: u32,
    },
}

/// One loader-visible operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Where the operation applies
    pub address: u32,
    /// What to do there
    pub op: PatchOp,
}

/// The ordered patch stream, sole artifact handed to the runtime loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchStream {
    /// Entries in ascending address order
    entries: Vec<StreamEntry>,
}

/// Sorts the resolved records by address and checks for collisions.
///
/// Output is deterministic: any declaration order over the same records
/// produces byte-identical streams, because the sort key is the resolved
/// address and equal addresses across declarations are rejected outright.
pub fn emit(mut records: Vec<ResolvedPatch>) -> Result<PatchStream, EmitError> {
    records.sort_by_key(|record| (record.at, record.origin));

    for pair in records.windows(2) {
        if pair[0].at == pair[1].at && pair[0].origin != pair[1].origin {
            return Err(EmitError::OverlappingPatch { addr: pair[0].at });
        }
    }

    debug!("emitting {} patch operation(s)", records.len());
    Ok(PatchStream {
        entries: records
            .into_iter()
            .map(|record| StreamEntry {
                address: record.at,
                op: record.op,
            })
            .collect(),
    })
}

/// Loader command ids. The numbering is shared with the loader and encodes
/// the operation and its width in one byte.
mod cmd {
    /// Unconditional word write
    pub const WRITE_32: u8 = 32;
    /// Unconditional halfword write
    pub const WRITE_16: u8 = 33;
    /// Unconditional byte write
    pub const WRITE_8: u8 = 34;
    /// Unconditional write of an arbitrary byte run
    pub const WRITE_BLOB: u8 = 35;
    /// Conditional word write
    pub const COND_WRITE_32: u8 = 37;
    /// Conditional halfword write
    pub const COND_WRITE_16: u8 = 38;
    /// Conditional byte write
    pub const COND_WRITE_8: u8 = 39;
    /// Branch to a deferred target, displacement computed at load time
    pub const BRANCH: u8 = 64;
    /// Linked branch to a deferred target
    pub const BRANCH_LINK: u8 = 65;
}

/// Marker in the low 24 bits of a command word meaning "absolute address
/// follows as a separate word"
const ABSOLUTE_ADDR_MARKER: u32 = 0x00FF_FFFE;

impl PatchStream {
    /// The entries in ascending address order
    pub fn entries(&self) -> &[StreamEntry] {
        &self.entries
    }

    /// Packs the stream into its binary form.
    ///
    /// Each entry is a big-endian command word (`id << 24 | 0xFFFFFE`), the
    /// absolute address, then the command's arguments. No version or magic
    /// prefix: container framing belongs to the loader's build layer.
    pub fn pack(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        // writing to a Vec cannot fail
        self.pack_into(&mut buffer).unwrap();
        buffer
    }

    /// Packs the stream into an arbitrary writer
    pub fn pack_into<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        for entry in &self.entries {
            let id = command_id(&entry.op);
            writer.write_u32::<BigEndian>(u32::from(id) << 24 | ABSOLUTE_ADDR_MARKER)?;
            writer.write_u32::<BigEndian>(entry.address)?;

            match &entry.op {
                PatchOp::Write(bytes) => match bytes.len() {
                    1 | 2 | 4 => writer.write_u32::<BigEndian>(be_value(bytes))?,
                    _ => {
                        writer.write_u32::<BigEndian>(bytes.len() as u32)?;
                        writer.write_all(bytes)?;
                    }
                },
                PatchOp::CondWrite { expected, value } => {
                    writer.write_u32::<BigEndian>(be_value(value))?;
                    writer.write_u32::<BigEndian>(be_value(expected))?;
                }
                PatchOp::RelocBranch { offset, .. } => {
                    writer.write_u32::<BigEndian>(*offset)?;
                }
            }
        }
        Ok(())
    }
}

/// Command id for one operation
fn command_id(op: &PatchOp) -> u8 {
    match op {
        PatchOp::Write(bytes) => match bytes.len() {
            4 => cmd::WRITE_32,
            2 => cmd::WRITE_16,
            1 => cmd::WRITE_8,
            _ => cmd::WRITE_BLOB,
        },
        PatchOp::CondWrite { value, .. } => match value.len() {
            4 => cmd::COND_WRITE_32,
            2 => cmd::COND_WRITE_16,
            _ => cmd::COND_WRITE_8,
        },
        PatchOp::RelocBranch { link: true, .. } => cmd::BRANCH_LINK,
        PatchOp::RelocBranch { .. } => cmd::BRANCH,
    }
}

/// Zero-extends up to four big-endian bytes into a word
fn be_value(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0, |acc, &byte| acc << 8 | u32::from(byte))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An unconditional word write record
    fn write32(origin: usize, at: u32, value: u32) -> ResolvedPatch {
        ResolvedPatch {
            origin,
            at,
            op: PatchOp::Write(value.to_be_bytes().to_vec()),
        }
    }

    #[test]
    /// Entries come out sorted by address regardless of declaration order
    fn test_sorted_output() {
        let stream = emit(vec![
            write32(0, 0x8000_0200, 1),
            write32(1, 0x8000_0000, 2),
            write32(2, 0x8000_0100, 3),
        ])
        .unwrap();

        assert_eq!(
            stream
                .entries()
                .iter()
                .map(|e| e.address)
                .collect::<Vec<_>>(),
            vec![0x8000_0000, 0x8000_0100, 0x8000_0200]
        );
    }

    #[test]
    /// Any permutation of the same records packs to identical bytes
    fn test_deterministic() {
        let records = vec![
            write32(0, 0x8000_0200, 1),
            write32(1, 0x8000_0000, 2),
            write32(2, 0x8000_0100, 3),
        ];
        let mut reversed = records.clone();
        reversed.reverse();

        let a = emit(records).unwrap();
        let b = emit(reversed).unwrap();
        assert_eq!(a.pack(), b.pack());
    }

    #[test]
    /// Independent declarations may not share an address
    fn test_overlap_rejected() {
        let err = emit(vec![
            write32(0, 0x8000_0000, 1),
            write32(1, 0x8000_0000, 2),
        ])
        .unwrap_err();
        assert_eq!(err, EmitError::OverlappingPatch { addr: 0x8000_0000 });
    }

    #[test]
    /// Records from one expansion may share an address with each other
    fn test_same_origin_allowed() {
        let stream = emit(vec![
            write32(3, 0x8000_0000, 1),
            write32(3, 0x8000_0000, 2),
        ])
        .unwrap();
        assert_eq!(stream.entries().len(), 2);
    }

    #[test]
    /// Packed form: command word, address, then arguments, all big endian
    fn test_pack_layout() {
        let stream = emit(vec![
            write32(0, 0x8000_0000, 0x4800_0004),
            ResolvedPatch {
                origin: 1,
                at: 0x8000_0100,
                op: PatchOp::CondWrite {
                    expected: vec![0x11, 0x11, 0x11, 0x11],
                    value: vec![0x22, 0x22, 0x22, 0x22],
                },
            },
            ResolvedPatch {
                origin: 2,
                at: 0x8000_0320,
                op: PatchOp::Write(vec![0x33]),
            },
        ])
        .unwrap();

        #[rustfmt::skip]
        let expected: Vec<u8> = vec![
            // Write32 @ 0x80000000 = 0x48000004
            0x20, 0xFF, 0xFF, 0xFE, 0x80, 0x00, 0x00, 0x00, 0x48, 0x00, 0x00, 0x04,
            // CondWrite32 @ 0x80000100: value then expected
            0x25, 0xFF, 0xFF, 0xFE, 0x80, 0x00, 0x01, 0x00,
            0x22, 0x22, 0x22, 0x22, 0x11, 0x11, 0x11, 0x11,
            // Write8 @ 0x80000320, zero-extended
            0x22, 0xFF, 0xFF, 0xFE, 0x80, 0x00, 0x03, 0x20, 0x00, 0x00, 0x00, 0x33,
        ];
        assert_eq!(stream.pack(), expected);
    }

    #[test]
    /// Deferred branches pack their provisional offset for the loader
    fn test_pack_reloc() {
        let stream = emit(vec![ResolvedPatch {
            origin: 0,
            at: 0x8000_0000,
            op: PatchOp::RelocBranch {
                symbol: "lateSym".into(),
                offset: 0x140,
                link: true,
            },
        }])
        .unwrap();

        assert_eq!(
            stream.pack(),
            vec![0x41, 0xFF, 0xFF, 0xFE, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x40]
        );
    }
}
