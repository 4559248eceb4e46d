//! # Hooks
//!
//! This module covers the expansion of control-flow declarations (branch
//! and call injections, hook-and-return trampolines, and function exit-point
//! redirections) into concrete patch records

pub mod branch;
pub mod exit;

use thiserror::Error;

use crate::addr::AddressExpr;

/// Errors when expanding a hook or exit-point declaration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HookError {
    /// An exit patch scanned a function body and found no return instruction
    #[error("exit patch on `{0}` found no return instruction to redirect")]
    NoExitPointFound(String),
    /// An exit patch named a function whose body this module cannot enumerate
    #[error("exit patch target `{0}` is not a function defined in this module")]
    ExitPointOnExternalSymbol(String),
    /// A hook's resumption point is not a legal instruction address
    #[error("hook return address {0:#010x} is not word aligned")]
    MisalignedReturn(u32),
}

/// How a hook body was authored.
///
/// The body itself is compiled and placed by external collaborators; the
/// engine only carries the signature through for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyKind {
    /// Raw assembly; the author controls every instruction, including the
    /// trailing branch back
    Raw,
    /// A typed body with a known signature; the body compiler appends the
    /// trailing branch
    Typed {
        /// Return type name, as spelled by the author
        ret: String,
        /// Argument type names, in order
        args: Vec<String>,
    },
}

/// Handle to a hook body already compiled and placed by the external
/// allocator
#[derive(Debug, Clone, PartialEq)]
pub struct CodeHandle {
    /// Where the allocator placed the compiled body
    pub address: AddressExpr,
    /// Signature information for the body compiler
    pub kind: BodyKind,
}

/// A hook-and-return declaration: overwrite the instruction at `hook_at`
/// with a branch into the body, which resumes original flow at `return_at`
#[derive(Debug, Clone, PartialEq)]
pub struct HookDecl {
    /// Instruction overwritten with the entry branch
    pub hook_at: AddressExpr,
    /// Where the body resumes original flow; zero for a full replacement
    /// that never returns
    pub return_at: AddressExpr,
    /// The compiled body
    pub body: CodeHandle,
}

/// Linkage the external body compiler needs to finish one trampoline: the
/// body placed at `body` must end by branching to `return_at` (zero when the
/// body never resumes original flow)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookLinkage {
    /// Resolved address of the compiled body
    pub body: u32,
    /// Resolved resumption address, or zero
    pub return_at: u32,
}
