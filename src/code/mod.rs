//! # Instruction encoding
//!
//! This module covers raw opcode construction for the target architecture

pub mod ppc;
