//! Branch and call injection.
//!
//! A branch declaration overwrites one instruction with a relative `b`
//! (redirect, control never comes back) or `bl` (call, control returns via
//! the link register). A hook declaration is the same entry branch pointed
//! at an externally compiled body instead of an authored address.

use log::debug;

use crate::addr::{resolve, AddressExpr, Resolved, SymbolTable};
use crate::code::ppc;
use crate::patch::{PatchOp, ResolvedPatch};
use crate::Error;

use super::{HookDecl, HookError, HookLinkage};

/// Expands a branch or call declaration into one record.
///
/// A resolved target of zero means the front end's macros had no target to
/// give (the declarations are written generically, and an address can be
/// conditionally absent); the site is overwritten with a nop instead of a
/// branch. A deferred target becomes a relocation entry for the loader.
pub(crate) fn expand_branch(
    origin: usize,
    at: &AddressExpr,
    target: &AddressExpr,
    link: bool,
    table: &SymbolTable,
) -> Result<ResolvedPatch, Error> {
    let site = resolve(at, table)?.finalized()?;

    let op = match resolve(target, table)? {
        Resolved::Final(0) => {
            require_aligned(site)?;
            debug!("branch at {site:#010x} has no target, writing nop");
            PatchOp::Write(ppc::encode_nop().to_be_bytes().to_vec())
        }
        Resolved::Final(target) => {
            let word = ppc::encode_branch(site, target, link)?;
            PatchOp::Write(word.to_be_bytes().to_vec())
        }
        Resolved::Deferred { symbol, offset } => {
            require_aligned(site)?;
            debug!("branch at {site:#010x} targets deferred symbol `{symbol}`");
            PatchOp::RelocBranch {
                symbol,
                offset,
                link,
            }
        }
    };

    Ok(ResolvedPatch {
        origin,
        at: site,
        op,
    })
}

/// Expands a hook declaration into its entry branch plus the linkage the
/// body compiler needs to emit the trailing branch back.
pub(crate) fn expand_hook(
    origin: usize,
    decl: &HookDecl,
    table: &SymbolTable,
) -> Result<(ResolvedPatch, HookLinkage), Error> {
    let site = resolve(&decl.hook_at, table)?.finalized()?;
    let body = resolve(&decl.body.address, table)?.finalized()?;
    let return_at = resolve(&decl.return_at, table)?.finalized()?;

    if return_at != 0 && return_at & 3 != 0 {
        return Err(HookError::MisalignedReturn(return_at).into());
    }

    // entry branches never link: the body resumes flow through its own
    // trailing branch, not the link register
    let word = ppc::encode_branch(site, body, false)?;
    debug!("hook at {site:#010x} enters body {body:#010x}, resumes at {return_at:#010x}");

    Ok((
        ResolvedPatch {
            origin,
            at: site,
            op: PatchOp::Write(word.to_be_bytes().to_vec()),
        },
        HookLinkage { body, return_at },
    ))
}

/// Fails unless the patch site is word aligned
fn require_aligned(site: u32) -> Result<(), ppc::EncodeError> {
    if site & 3 != 0 {
        return Err(ppc::EncodeError::MisalignedBranch {
            at: site,
            target: 0,
        });
    }
    Ok(())
}
