//! Ahead-of-time middle-end for AVM2 method bodies.
//!
//! One [`MethodCompilation`](compilation::MethodCompilation) owns the arenas
//! for a single method and runs the pass pipeline over them:
//!
//! 1. [`decode`] — bytes to normalized instructions;
//! 2. [`flowgraph`] — basic blocks, exit edges, predecessor sets;
//! 3. [`exceptions`] — the nested try-region forest and per-block handlers;
//! 4. [`domtree`] — postorder numbering and immediate dominators;
//! 5. [`dataflow`] — stack/scope/local lifting into data nodes with phis;
//! 6. [`semantics`] — property resolution and type inference;
//! 7. [`codegen`] — typed IL emission through an [`il::IlBuilder`].
//!
//! The ABC parser, the class registry, and the back-end emitter live behind
//! the collaborator traits in `abclift_abc` and [`il`]; this crate never
//! performs I/O.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub mod codegen;
pub mod compilation;
pub mod dataflow;
pub mod decode;
pub mod domtree;
pub mod error;
pub mod exceptions;
pub mod flowgraph;
pub mod il;
pub mod ir;
pub mod mangle;
pub mod semantics;
pub mod settings;
pub mod timing;

pub use crate::compilation::MethodCompilation;
pub use crate::error::{CompileError, CompileResult, ErrorCode};
pub use crate::settings::Settings;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
