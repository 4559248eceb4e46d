#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod addr;
pub mod code;
pub mod hook;
pub mod patch;
pub mod stream;

use thiserror::Error;

use addr::{AddrError, SymbolTable};
use code::ppc::EncodeError;
use hook::exit::FnBodies;
use hook::{HookError, HookLinkage};
use patch::{PatchDecl, ResolvedPatch, WriteError};
use stream::{EmitError, PatchStream};

/// Any error that aborts a resolution pass.
///
/// Every variant is fatal to the whole pass: patches are all-or-nothing per
/// build, and a pass that fails emits nothing.
#[derive(Debug, Error)]
pub enum Error {
    /// A symbolic address failed to resolve
    #[error("{0}")]
    Addr(#[from] AddrError),
    /// A branch could not be encoded
    #[error("{0}")]
    Encode(#[from] EncodeError),
    /// A hook or exit-point declaration was invalid
    #[error("{0}")]
    Hook(#[from] HookError),
    /// A data write declaration was invalid
    #[error("{0}")]
    Write(#[from] WriteError),
    /// The resolved records could not be combined into one stream
    #[error("{0}")]
    Emit(#[from] EmitError),
}

/// Output of [`lower`]: the resolved patch records plus the hook linkage
/// information the external body compiler needs to finish each trampoline.
#[derive(Debug)]
pub struct Lowered {
    /// Every resolved record, in declaration order
    pub records: Vec<ResolvedPatch>,
    /// One entry per hook declaration, in declaration order
    pub links: Vec<HookLinkage>,
}

/// Resolves every declaration against `table` and expands it into concrete
/// patch records.
///
/// `bodies` supplies the compiled instruction words of locally defined
/// functions, which exit-point declarations need in order to locate return
/// instructions. Resolution is pure per declaration; the first failure aborts
/// the pass.
pub fn lower(
    decls: &[PatchDecl],
    table: &SymbolTable,
    bodies: &FnBodies,
) -> Result<Lowered, Error> {
    let mut records = Vec::with_capacity(decls.len());
    let mut links = Vec::new();

    for (origin, decl) in decls.iter().enumerate() {
        match decl {
            PatchDecl::Branch { at, target, link } => {
                records.push(hook::branch::expand_branch(origin, at, target, *link, table)?);
            }
            PatchDecl::Nop { at } => {
                records.push(patch::lower_nop(origin, at, table)?);
            }
            PatchDecl::Write { at, value } => {
                records.push(patch::lower_write(origin, at, value, table)?);
            }
            PatchDecl::CondWrite {
                at,
                expected,
                value,
            } => {
                records.push(patch::lower_cond_write(origin, at, expected, value, table)?);
            }
            PatchDecl::Hook(decl) => {
                let (record, link) = hook::branch::expand_hook(origin, decl, table)?;
                records.push(record);
                links.push(link);
            }
            PatchDecl::ExitRedirect {
                function,
                return_at,
            } => {
                records.extend(hook::exit::expand_exit_redirect(
                    origin, function, return_at, table, bodies,
                )?);
            }
        }
    }

    Ok(Lowered { records, links })
}

/// Runs the whole pipeline: [`lower`] every declaration, then [`stream::emit`]
/// the sorted, collision-checked patch stream.
pub fn build(
    decls: &[PatchDecl],
    table: &SymbolTable,
    bodies: &FnBodies,
) -> Result<(PatchStream, Vec<HookLinkage>), Error> {
    let lowered = lower(decls, table, bodies)?;
    let stream = stream::emit(lowered.records)?;
    Ok((stream, lowered.links))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{AddressExpr, SymbolEntry};
    use crate::code::ppc;
    use crate::hook::exit::FnBody;
    use crate::patch::image::Image;
    use crate::patch::verify::{self, Outcome};
    use crate::patch::{PatchOp, WriteValue};

    /// A build with a local function, an external symbol, and one of each
    /// declaration kind
    fn fixture() -> (Vec<PatchDecl>, SymbolTable, FnBodies) {
        let mut table = SymbolTable::new();
        table.insert(
            "localFunc01",
            SymbolEntry {
                address: 0x8020_0000,
                defined_here: true,
                deferred: false,
            },
        );
        table.insert(
            "externalSym",
            SymbolEntry {
                address: 0x8000_2000,
                defined_here: false,
                deferred: false,
            },
        );

        let mut bodies = FnBodies::new();
        bodies.insert(
            "localFunc01",
            FnBody {
                start: 0x8020_0000,
                words: vec![0x3860_0001, ppc::BLR],
            },
        );

        let decls = vec![
            PatchDecl::Branch {
                at: AddressExpr::Absolute(0x8000_0000),
                target: AddressExpr::Absolute(0x8000_0004),
                link: false,
            },
            PatchDecl::Branch {
                at: AddressExpr::Absolute(0x8000_0010),
                target: AddressExpr::external("externalSym"),
                link: true,
            },
            PatchDecl::CondWrite {
                at: AddressExpr::Absolute(0x8000_0100),
                expected: WriteValue::U32(0x1111_1111),
                value: WriteValue::U32(0x2222_2222),
            },
            PatchDecl::ExitRedirect {
                function: "localFunc01".into(),
                return_at: AddressExpr::Absolute(0x8000_0000),
            },
        ];

        (decls, table, bodies)
    }

    #[test]
    /// The whole pipeline resolves, encodes, and sorts the fixture
    fn test_build_pipeline() {
        let (decls, table, bodies) = fixture();
        let (stream, links) = build(&decls, &table, &bodies).unwrap();

        let addresses: Vec<u32> = stream.entries().iter().map(|e| e.address).collect();
        assert_eq!(
            addresses,
            vec![0x8000_0000, 0x8000_0010, 0x8000_0100, 0x8020_0004]
        );
        assert!(links.is_empty());

        // the redirect at the head of the stream is the worked 4-byte branch
        assert_eq!(
            stream.entries()[0].op,
            PatchOp::Write(vec![0x48, 0x00, 0x00, 0x04])
        );
    }

    #[test]
    /// One failing declaration aborts the pass before anything is emitted
    fn test_all_or_nothing() {
        let (mut decls, table, bodies) = fixture();
        decls.push(PatchDecl::Branch {
            at: AddressExpr::Absolute(0x8000_0020),
            target: AddressExpr::external("missing"),
            link: false,
        });

        assert!(matches!(
            build(&decls, &table, &bodies),
            Err(Error::Addr(AddrError::UnresolvedExternalSymbol(_)))
        ));
    }

    #[test]
    /// Two declarations landing on one address fail emission
    fn test_independent_overlap() {
        let (mut decls, table, bodies) = fixture();
        decls.push(PatchDecl::Nop {
            at: AddressExpr::Absolute(0x8000_0000),
        });

        assert!(matches!(
            build(&decls, &table, &bodies),
            Err(Error::Emit(EmitError::OverlappingPatch { addr: 0x8000_0000 }))
        ));
    }

    #[test]
    /// Lowered records apply against a snapshot with per-record outcomes
    fn test_apply_against_snapshot() {
        let (decls, table, bodies) = fixture();
        let lowered = lower(&decls, &table, &bodies).unwrap();

        // snapshot covering the first two patch sites and the fingerprinted
        // word, holding the expected prior value
        let mut data = vec![0u8; 0x104];
        data[0x100..0x104].copy_from_slice(&0x1111_1111u32.to_be_bytes());
        let mut image = Image::new(0x8000_0000, data);

        let outcomes = verify::apply_all(&lowered.records, &mut image);
        assert_eq!(
            outcomes,
            vec![
                Outcome::Applied,
                Outcome::Applied,
                Outcome::Applied,
                Outcome::Deferred, // exit branch lies outside this snapshot
            ]
        );
        assert_eq!(image.read_u32(0x8000_0100), Some(0x2222_2222));
        assert_eq!(image.read_u32(0x8000_0000), Some(0x4800_0004));
    }
}
