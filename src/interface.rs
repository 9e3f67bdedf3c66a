/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The top level interface for the dex-regalloc library.
//!
//! The allocator consumes a read-only [`Function`] façade over the client's
//! SSA IR and an [`Options`] value describing the target, and produces a
//! register assignment, a schedule of spill and resolution moves keyed by
//! gap position, and (in debug mode) the reconstructed local-variable scope
//! changes.  The client IR is never mutated.

use std::collections::BTreeMap;
use std::fmt;

pub use crate::data_structures::{
  LiveIntervalsUse, LiveRange, INSTRUCTION_NUMBER_DELTA, U16BIT_MAX,
  U4BIT_MAX, U8BIT_MAX,
};

/// A basic block of the client CFG.  Identifiers must be dense indices in
/// `0..num_blocks()`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

/// An instruction of the client IR.  Identifiers must be dense indices in
/// `0..num_instructions()`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstId(pub u32);

/// An SSA value of the client IR.  Identifiers must be dense indices in
/// `0..num_values()`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(pub u32);

/// An opaque local-variable descriptor carried by values with debug info.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalId(pub u32);

impl fmt::Debug for BlockId {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "b{}", self.0)
  }
}

impl fmt::Debug for InstId {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "i{}", self.0)
  }
}

impl fmt::Debug for ValueId {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "v{}", self.0)
  }
}

impl fmt::Debug for LocalId {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "local{}", self.0)
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ArithmeticOp {
  Add,
  Sub,
  Mul,
  Div,
  Rem,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LogicalOp {
  Or,
  Xor,
  And,
}

/// The instruction shapes the allocator cares about.  Everything the
/// allocator does not need to distinguish is `Other`.
#[derive(Clone, Copy, Debug)]
pub enum InstDesc<'a> {
  /// A formal-argument definition at the top of the entry block.
  Argument,
  /// A side-effect-free constant load; eligible for rematerialization.
  ConstNumber,
  Move {
    src: ValueId,
  },
  CheckCast {
    object: ValueId,
  },
  ArithmeticBinop {
    left: ValueId,
    right: ValueId,
    op: ArithmeticOp,
    commutative: bool,
    is_long: bool,
  },
  LogicalBinop {
    left: ValueId,
    right: ValueId,
    op: LogicalOp,
    is_long: bool,
  },
  Cmp {
    left: ValueId,
    right: ValueId,
    operands_are_wide: bool,
  },
  NumberConversion {
    src: ValueId,
    is_long_to_int: bool,
  },
  ArrayGet {
    array: ValueId,
    result_is_wide: bool,
  },
  Invoke {
    arguments: &'a [ValueId],
  },
  MoveException,
  Goto,
  Other,
}

/// Access to the client's SSA IR.
///
/// Preconditions the allocator relies on:
///
/// * `blocks()` lists blocks in emission order with the entry block first;
///   this is the order instructions are numbered in.  The entry block starts
///   with the method's `Argument` instructions.
/// * critical edges are split, and a block with an exceptional predecessor
///   starting in `move-exception` has that instruction first;
/// * the operands of an invoke that needs a consecutive register block are
///   pairwise distinct values (the lowering inserts moves where needed).
pub trait Function {
  /// Identifier of the method, used in diagnostics.
  fn method_name(&self) -> &str;
  fn method_is_static(&self) -> bool;

  fn num_values(&self) -> u32;
  fn num_instructions(&self) -> u32;
  fn num_blocks(&self) -> u32;

  /// All blocks in emission (numbering) order; the entry block is first.
  fn blocks(&self) -> &[BlockId];
  /// All blocks in a topological order of the forward CFG.
  fn topologically_sorted_blocks(&self) -> &[BlockId];
  fn block_instructions(&self, block: BlockId) -> &[InstId];
  /// All successors, exceptional ones included.
  fn block_successors(&self, block: BlockId) -> &[BlockId];
  fn block_predecessors(&self, block: BlockId) -> &[BlockId];
  /// The subset of `block_successors` reached on exceptional flow.
  fn block_catch_successors(&self, block: BlockId) -> &[BlockId];
  fn block_phis(&self, block: BlockId) -> &[ValueId];
  /// The method's formal arguments in declaration order.
  fn arguments(&self) -> &[ValueId];

  fn inst_desc(&self, inst: InstId) -> InstDesc<'_>;
  fn inst_out_value(&self, inst: InstId) -> Option<ValueId>;
  fn inst_in_values(&self, inst: InstId) -> &[ValueId];
  /// End-of-scope annotations for local variables (debug builds).
  fn inst_debug_values(&self, inst: InstId) -> &[ValueId];
  fn inst_can_throw(&self, inst: InstId) -> bool;
  /// The largest register encodable for this instruction's inputs.
  fn max_in_value_register(&self, inst: InstId) -> u32;
  /// The largest register encodable for this instruction's output.
  fn max_out_value_register(&self, inst: InstId) -> u32;

  fn value_is_phi(&self, value: ValueId) -> bool;
  /// The defining instruction; `None` for phis.
  fn value_definition(&self, value: ValueId) -> Option<InstId>;
  fn phi_block(&self, value: ValueId) -> BlockId;
  /// Operands in predecessor order of `phi_block`.
  fn phi_operands(&self, value: ValueId) -> &[ValueId];
  fn value_needs_register(&self, value: ValueId) -> bool;
  fn value_is_argument(&self, value: ValueId) -> bool;
  /// 1 for single-slot values, 2 for wide (long/double) values.
  fn value_required_registers(&self, value: ValueId) -> u32;
  fn value_local_info(&self, value: ValueId) -> Option<LocalId>;
  /// The distinct instructions using this value.
  fn value_users(&self, value: ValueId) -> &[InstId];
  /// The distinct phis using this value as an operand.
  fn value_phi_users(&self, value: ValueId) -> &[ValueId];
  /// True when the value is the object of a monitor-enter instruction.
  fn value_used_as_monitor(&self, value: ValueId) -> bool;

  // Conveniences with default implementations.

  fn value_is_wide(&self, value: ValueId) -> bool {
    self.value_required_registers(value) == 2
  }

  /// True when any instruction or phi (debug uses included) reads the value.
  fn value_is_used(&self, value: ValueId) -> bool {
    !self.value_users(value).is_empty()
      || !self.value_phi_users(value).is_empty()
  }

  fn value_is_const_number(&self, value: ValueId) -> bool {
    self
      .value_definition(value)
      .map_or(false, |d| matches!(self.inst_desc(d), InstDesc::ConstNumber))
  }

  fn inst_is_argument(&self, inst: InstId) -> bool {
    matches!(self.inst_desc(inst), InstDesc::Argument)
  }

  fn inst_is_move_exception(&self, inst: InstId) -> bool {
    matches!(self.inst_desc(inst), InstDesc::MoveException)
  }

  fn inst_is_goto(&self, inst: InstId) -> bool {
    matches!(self.inst_desc(inst), InstDesc::Goto)
  }

  fn entry_block(&self) -> BlockId {
    self.blocks()[0]
  }

  /// Register words needed to pass the given values as invoke arguments.
  fn required_argument_registers(&self, arguments: &[ValueId]) -> u32 {
    arguments.iter().map(|&a| self.value_required_registers(a)).sum()
  }
}

//=============================================================================
// Options

/// Test-only knobs, mirroring the switches the production driver exposes for
/// exercising the pessimistic allocation paths.
#[derive(Clone, Debug)]
pub struct TestingOptions {
  /// Force the ladder to escalate past its first successful mode.
  pub always_pessimistic_register_allocation: bool,
  /// Allow the 8-bit refinement pass that reuses 4-bit-safe argument
  /// registers.
  pub enable_register_allocation_8bit_refinement: bool,
  /// Allow evicting the single active interval blocking a hint register.
  pub enable_register_hints_for_blocked_registers: bool,
  /// Place the dedicated move-exception register in the last local register
  /// instead of the first.
  pub enable_use_last_local_register_as_move_exception_register: bool,
}

impl Default for TestingOptions {
  fn default() -> Self {
    Self {
      always_pessimistic_register_allocation: false,
      enable_register_allocation_8bit_refinement: true,
      enable_register_hints_for_blocked_registers: true,
      enable_use_last_local_register_as_move_exception_register: false,
    }
  }
}

/// Target and compilation-mode predicates consulted by the allocator.  The
/// `can_have_*` flags encode interpreter bugs on old targets that the
/// register selection must work around.
#[derive(Clone, Debug)]
pub struct Options {
  /// Compile for debugging: locals are kept alive for their whole scope and
  /// the receiver stays in its incoming register.
  pub debug: bool,
  /// The target allows `aget-wide` with the same array and result register.
  pub can_use_same_array_and_result_register_in_array_get_wide: bool,
  pub can_have_cmp_long_bug: bool,
  pub can_have_long_to_int_bug: bool,
  pub can_have_overlapping_long_register_bug: bool,
  pub can_have_this_type_verifier_bug: bool,
  pub can_have_this_jit_code_debugging_bug: bool,
  pub testing: TestingOptions,
}

impl Default for Options {
  fn default() -> Self {
    Self {
      debug: false,
      can_use_same_array_and_result_register_in_array_get_wide: true,
      can_have_cmp_long_bug: false,
      can_have_long_to_int_bug: false,
      can_have_overlapping_long_register_bug: false,
      can_have_this_type_verifier_bug: false,
      can_have_this_jit_code_debugging_bug: false,
      testing: TestingOptions::default(),
    }
  }
}

//=============================================================================
// Errors

/// Errors surfaced to the compiler driver.  Mode failures are recovered
/// internally by the retry ladder and never escape.
#[derive(Clone, Debug)]
pub enum RegAllocError {
  /// `get_register_for_value` was asked about a value that was never given
  /// live intervals.
  ValueWithoutIntervals { value: ValueId, method: String },
  /// An internal invariant did not hold; a compiler bug.
  Internal { message: String, method: String },
}

impl fmt::Display for RegAllocError {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      RegAllocError::ValueWithoutIntervals { value, method } => write!(
        fmt,
        "unexpected attempt to get register for {:?} without live intervals \
         in method `{}`",
        value, method
      ),
      RegAllocError::Internal { message, method } => {
        write!(fmt, "register allocation of `{}` failed: {}", method, message)
      }
    }
  }
}

impl std::error::Error for RegAllocError {}

//=============================================================================
// Outputs

/// The source of a scheduled move.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MoveSource {
  /// Copy from another register (the low half for wide moves).
  Register(u32),
  /// Rematerialize the given constant value instead of reading a spill
  /// register.
  Constant(ValueId),
}

/// One move of the final schedule.  Moves at the same gap position execute
/// in list order; register cycles have already been broken with temporaries.
#[derive(Clone, Copy, Debug)]
pub struct ScheduledMove {
  /// The gap position the move is inserted at.  A move at gap `p` executes
  /// between instructions `p - 1` and `p + 1`; moves belonging to a catch
  /// handler entry are anchored at the gap after the `move-exception`
  /// instruction.
  pub position: u32,
  /// Destination register (the low half for wide moves).
  pub dest: u32,
  pub src: MoveSource,
  pub is_wide: bool,
}

/// A change of the set of live local variables, to be emitted just before
/// the instruction at `position`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugLocalsChangeAt {
  pub position: u32,
  pub ending: BTreeMap<u32, LocalId>,
  pub starting: BTreeMap<u32, LocalId>,
}
