//! Function exit-point redirection.
//!
//! Rewrites every natural return point of a locally defined function so that
//! instead of returning to its caller, control branches to a chosen address.
//! The function's compiled instruction words come from the external body
//! compiler; this module only scans them for `blr`.

use std::collections::HashMap;

use log::debug;

use crate::addr::{resolve, AddressExpr, Resolved, SymbolTable};
use crate::code::ppc;
use crate::patch::{PatchOp, ResolvedPatch};
use crate::Error;

use super::HookError;

/// Compiled contents of one locally defined function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FnBody {
    /// Address of the first instruction
    pub start: u32,
    /// Instruction words in program order
    pub words: Vec<u32>,
}

/// Compiled function bodies by symbol name, supplied by the external
/// compiler alongside the symbol table
#[derive(Debug, Default)]
pub struct FnBodies {
    /// Name to body map
    bodies: HashMap<String, FnBody>,
}

impl FnBodies {
    /// Creates an empty lookup
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a compiled body, replacing any previous one with the same name
    pub fn insert(&mut self, name: impl Into<String>, body: FnBody) {
        self.bodies.insert(name.into(), body);
    }

    /// Looks up a body by function name
    pub fn get(&self, name: &str) -> Option<&FnBody> {
        self.bodies.get(name)
    }
}

/// Expands an exit-point declaration into one branch record per return
/// instruction found in the function.
///
/// A function with no return instruction is an error; so is naming a
/// function that is not defined in this module (its body cannot be
/// enumerated). A resolved target of zero leaves the returns in place and
/// expands to nothing, so generic front-end macros can pass an absent
/// address harmlessly.
pub(crate) fn expand_exit_redirect(
    origin: usize,
    function: &str,
    return_at: &AddressExpr,
    table: &SymbolTable,
    bodies: &FnBodies,
) -> Result<Vec<ResolvedPatch>, Error> {
    let defined = table
        .get(function)
        .is_some_and(|entry| entry.defined_here);
    if !defined {
        return Err(HookError::ExitPointOnExternalSymbol(function.to_owned()).into());
    }
    let body = bodies
        .get(function)
        .ok_or_else(|| HookError::ExitPointOnExternalSymbol(function.to_owned()))?;

    let exits: Vec<u32> = body
        .words
        .iter()
        .enumerate()
        .filter(|&(_, &word)| ppc::is_blr(word))
        .map(|(index, _)| body.start + 4 * index as u32)
        .collect();
    if exits.is_empty() {
        return Err(HookError::NoExitPointFound(function.to_owned()).into());
    }
    debug!("`{function}` has {} exit point(s)", exits.len());

    match resolve(return_at, table)? {
        Resolved::Final(0) => Ok(Vec::new()),
        Resolved::Final(target) => exits
            .iter()
            .map(|&at| {
                let word = ppc::encode_branch(at, target, false)?;
                Ok(ResolvedPatch {
                    origin,
                    at,
                    op: PatchOp::Write(word.to_be_bytes().to_vec()),
                })
            })
            .collect(),
        Resolved::Deferred { symbol, offset } => Ok(exits
            .iter()
            .map(|&at| ResolvedPatch {
                origin,
                at,
                op: PatchOp::RelocBranch {
                    symbol: symbol.clone(),
                    offset,
                    link: false,
                },
            })
            .collect()),
    }
}
