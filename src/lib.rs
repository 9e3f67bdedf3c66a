/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Main file / top-level module for the dex-regalloc library.
//!
//! A linear scan register allocator for methods lowered to SSA form over a
//! control-flow graph, targeting the DEX register model: 4-, 8- and 16-bit
//! register fields, arguments in the method's top registers, ranged invokes
//! reading consecutive register blocks, and a family of register-selection
//! workarounds for buggy interpreters.
//!
//! Clients implement [`interface::Function`] over their IR, construct a
//! [`LinearScanRegisterAllocator`] with an [`interface::Options`] value and
//! call `allocate_registers`; the register mapping, the scheduled spill and
//! resolution moves, and the reconstructed debug locals are then queryable.

mod analysis;
mod data_structures;
mod debug_info;
mod inst_stream;
pub mod interface;
mod linear_scan;

pub use crate::interface::*;
pub use crate::linear_scan::LinearScanRegisterAllocator;
