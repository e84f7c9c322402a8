//! ActionScript Bytecode (ABC) data model.
//!
//! This crate defines the input-side vocabulary of the abclift compiler: the
//! AVM2 opcode set with its operand shapes, namespaces and multinames, the
//! class/trait model the semantic analyzer resolves against, and the
//! collaborator traits through which a real ABC parser and class registry are
//! consumed. A `dummy` environment backed by in-memory tables is provided so
//! the middle-end can be exercised without either collaborator.
//!
//! Nothing in this crate parses `.abc` files; that job belongs to the driver.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub mod asm;
pub mod class;
pub mod env;
pub mod name;
pub mod opcode;

pub use crate::class::{
    Builtin, Class, ClassId, MethodSignature, TraitEntry, TraitHeader, TraitKind, TypeRef,
};
pub use crate::env::{AbcEnvironment, ClassRegistry, ExceptionRecord};
pub use crate::name::{Multiname, MultinameKind, Namespace, NsKind};
pub use crate::opcode::{Op, OperandShape};
