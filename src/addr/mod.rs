//! # Address resolution
//!
//! This module covers symbolic address expressions and their resolution
//! against the symbol table supplied by the surrounding build

use std::collections::HashMap;

use log::trace;
use thiserror::Error;

/// Errors when resolving an address expression
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrError {
    /// A local reference named a symbol that is not defined in this module
    #[error("local symbol `{0}` is not defined in this module")]
    UnresolvedLocalSymbol(String),
    /// An external reference named a symbol absent from the table entirely
    #[error("external symbol `{0}` is not present in the symbol table")]
    UnresolvedExternalSymbol(String),
    /// A provisional address was used somewhere only a final address works
    #[error("symbol `{0}` has no final address until link time")]
    DeferredAddress(String),
}

/// Visibility of a symbol reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// Must be defined in the module being built
    Local,
    /// May live anywhere the final link can see
    External,
}

/// A symbolic address as written in a patch declaration.
///
/// `Absolute(0)` is a legal sentinel meaning "no target"; see the branch
/// expansion in [`crate::hook::branch`] for how zero targets degrade to nops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressExpr {
    /// A literal address, already concrete
    Absolute(u32),
    /// A reference to a named symbol
    Symbol {
        /// Identifier to look up in the table
        name: String,
        /// Whether the reference requires a local definition
        kind: SymbolKind,
    },
}

impl AddressExpr {
    /// Shorthand for a local symbol reference
    pub fn local(name: impl Into<String>) -> Self {
        Self::Symbol {
            name: name.into(),
            kind: SymbolKind::Local,
        }
    }

    /// Shorthand for an external symbol reference
    pub fn external(name: impl Into<String>) -> Self {
        Self::Symbol {
            name: name.into(),
            kind: SymbolKind::External,
        }
    }
}

/// One symbol table entry.
///
/// For a deferred symbol, `address` holds the provisional module-relative
/// offset the final link will rebase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolEntry {
    /// Concrete address, or provisional offset when `deferred`
    pub address: u32,
    /// Whether the symbol is defined in the module being built
    pub defined_here: bool,
    /// Whether the address is only known at final link time
    pub deferred: bool,
}

/// Immutable symbol table snapshot for one resolution pass.
///
/// Built by the external object-parsing stage; the engine only reads it.
#[derive(Debug, Default)]
pub struct SymbolTable {
    /// Identifier to entry map
    entries: HashMap<String, SymbolEntry>,
}

impl SymbolTable {
    /// Creates an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry, replacing any previous one with the same name
    pub fn insert(&mut self, name: impl Into<String>, entry: SymbolEntry) {
        self.entries.insert(name.into(), entry);
    }

    /// Looks up an entry by name
    pub fn get(&self, name: &str) -> Option<&SymbolEntry> {
        self.entries.get(name)
    }
}

/// A resolved address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// A concrete 32-bit address
    Final(u32),
    /// An external whose address is fixed at final link time; carried through
    /// to the emitter as a relocation instead of failing the pass
    Deferred {
        /// Name of the deferred symbol
        symbol: String,
        /// Provisional module-relative offset from the table
        offset: u32,
    },
}

impl Resolved {
    /// Returns the concrete address, failing if it is still provisional
    pub fn finalized(&self) -> Result<u32, AddrError> {
        match self {
            Resolved::Final(addr) => Ok(*addr),
            Resolved::Deferred { symbol, .. } => Err(AddrError::DeferredAddress(symbol.clone())),
        }
    }
}

/// Resolves one address expression against the table.
///
/// Pure function of its inputs: absolutes resolve to themselves (including
/// zero), local references require a definition in this module, external
/// references accept any table entry and turn deferred entries into
/// [`Resolved::Deferred`].
pub fn resolve(expr: &AddressExpr, table: &SymbolTable) -> Result<Resolved, AddrError> {
    match expr {
        AddressExpr::Absolute(value) => Ok(Resolved::Final(*value)),
        AddressExpr::Symbol { name, kind } => {
            let entry = table.get(name).ok_or_else(|| match kind {
                SymbolKind::Local => AddrError::UnresolvedLocalSymbol(name.clone()),
                SymbolKind::External => AddrError::UnresolvedExternalSymbol(name.clone()),
            })?;

            if *kind == SymbolKind::Local && !entry.defined_here {
                return Err(AddrError::UnresolvedLocalSymbol(name.clone()));
            }

            if entry.deferred {
                trace!("`{name}` is deferred to final link, offset {:#x}", entry.address);
                return Ok(Resolved::Deferred {
                    symbol: name.clone(),
                    offset: entry.address,
                });
            }

            Ok(Resolved::Final(entry.address))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a table with one local and one external symbol
    fn table() -> SymbolTable {
        let mut table = SymbolTable::new();
        table.insert(
            "localSym",
            SymbolEntry {
                address: 0x8000_1000,
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
        table
    }

    #[test]
    /// Absolute expressions resolve to themselves, zero included
    fn test_absolute() {
        let table = SymbolTable::new();
        assert_eq!(
            resolve(&AddressExpr::Absolute(0x8000_0000), &table),
            Ok(Resolved::Final(0x8000_0000))
        );
        assert_eq!(
            resolve(&AddressExpr::Absolute(0), &table),
            Ok(Resolved::Final(0))
        );
    }

    #[test]
    /// Local references need a definition in this module
    fn test_local_resolution() {
        let table = table();
        assert_eq!(
            resolve(&AddressExpr::local("localSym"), &table),
            Ok(Resolved::Final(0x8000_1000))
        );
        assert_eq!(
            resolve(&AddressExpr::local("externalSym"), &table),
            Err(AddrError::UnresolvedLocalSymbol("externalSym".into()))
        );
        assert_eq!(
            resolve(&AddressExpr::local("missing"), &table),
            Err(AddrError::UnresolvedLocalSymbol("missing".into()))
        );
    }

    #[test]
    /// External references accept local definitions too
    fn test_external_resolution() {
        let table = table();
        assert_eq!(
            resolve(&AddressExpr::external("externalSym"), &table),
            Ok(Resolved::Final(0x8000_2000))
        );
        assert_eq!(
            resolve(&AddressExpr::external("localSym"), &table),
            Ok(Resolved::Final(0x8000_1000))
        );
        assert_eq!(
            resolve(&AddressExpr::external("missing"), &table),
            Err(AddrError::UnresolvedExternalSymbol("missing".into()))
        );
    }

    #[test]
    /// Deferred entries propagate as provisional addresses instead of failing
    fn test_deferred_resolution() {
        let mut table = table();
        table.insert(
            "lateSym",
            SymbolEntry {
                address: 0x140,
                defined_here: false,
                deferred: true,
            },
        );

        let resolved = resolve(&AddressExpr::external("lateSym"), &table).unwrap();
        assert_eq!(
            resolved,
            Resolved::Deferred {
                symbol: "lateSym".into(),
                offset: 0x140,
            }
        );
        assert_eq!(
            resolved.finalized(),
            Err(AddrError::DeferredAddress("lateSym".into()))
        );
    }
}
