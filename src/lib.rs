//! # relift
//!
//! A static binary rewriter for x86-64 PE images.
//!
//! ## Overview
//!
//! relift ingests a compiled PE file, decomposes its code into basic blocks
//! linked by symbolic references, and re-emits the program into
//! caller-provided memory regions at new virtual addresses:
//!
//! 1. Recursive disassembly from the exception directory and the entry
//!    point produces basic blocks whose relative operands reference symbols
//!    instead of numeric offsets.
//! 2. Non-executable sections become data blocks and are written first, so
//!    data and import targets always have known addresses.
//! 3. Code blocks are emitted in discovery order; branches and RIP-relative
//!    accesses are re-encoded against their targets' final addresses, with
//!    forward references patched once the target block lands — including
//!    across gaps between discontiguous output regions.
//!
//! The rewritten program exists only in the provided regions; no file is
//! written.

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod block;
pub mod disasm;
pub mod emit;
pub mod error;
pub mod memory;
pub mod pe;
pub mod session;
pub mod symbol;

pub use block::{BasicBlock, BlockId, BlockStore, DataBlock, DataBlockId, Instr, InstrCategory};
pub use disasm::{Diagnostic, DisasmConfig};
pub use error::{Error, RegionKind, Result};
pub use memory::OwnedRegion;
pub use pe::PeParser;
pub use session::Session;
pub use symbol::{Symbol, SymbolId, SymbolKind, SymbolTable};
