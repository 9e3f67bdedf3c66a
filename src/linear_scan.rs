/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Implementation of the linear scan allocator algorithm.
//!
//! This follows the approach suggested by:
//!   Linear Scan Register Allocation in the Context of SSA Form and Register
//!     Constraints, by Moessenboeck and Pfeiffer, 2002
//!   Linear Scan Register Allocation on SSA Form, by Wimmer et al., 2010
//!
//! adapted to the DEX constraint model: opcodes address 4-, 8- or 16-bit
//! register numbers, arguments must end up in the method's top registers,
//! and ranged invokes read a consecutive ascending register block.

use log::{debug, info, trace};
use rustc_hash::FxHashSet as HashSet;
use smallvec::SmallVec;

use std::collections::{BTreeMap, BTreeSet};

use crate::analysis::{
  compute_live_at_entry_sets, compute_live_ranges, number_instructions,
  LiveAtEntrySets, Numbering,
};
use crate::data_structures::{
  to_gap_position, to_instruction_position, IntervalIx, Intervals, LiveRange,
  RegisterPositions, RegisterType, EXCEPTION_INTERVALS_OVERLAP_CUTOFF,
  INSTRUCTION_NUMBER_DELTA, MIN_CONSTANT_FREE_FOR_POSITIONS, U16BIT_MAX,
  U4BIT_MAX, U8BIT_MAX,
};
use crate::debug_info::compute_debug_info;
use crate::inst_stream::SpillMoveSet;
use crate::interface::{
  BlockId, DebugLocalsChangeAt, Function, InstDesc, InstId, LocalId,
  MoveSource, Options, RegAllocError, ScheduledMove, ValueId,
};

/// The retry ladder.  Each mode either succeeds within its register budget
/// or escalates to the next one; 16-bit allocation always succeeds.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ArgumentReuseMode {
  AllowArgumentReuse4Bit,
  AllowArgumentReuse8Bit,
  AllowArgumentReuse8BitRefinement,
  AllowArgumentReuse8BitRetry,
  AllowArgumentReuse16Bit,
}

impl ArgumentReuseMode {
  pub(crate) fn is_4bit(self) -> bool {
    self == ArgumentReuseMode::AllowArgumentReuse4Bit
  }

  pub(crate) fn is_8bit(self) -> bool {
    matches!(
      self,
      ArgumentReuseMode::AllowArgumentReuse8Bit
        | ArgumentReuseMode::AllowArgumentReuse8BitRefinement
        | ArgumentReuseMode::AllowArgumentReuse8BitRetry
    )
  }

  pub(crate) fn is_8bit_refinement(self) -> bool {
    self == ArgumentReuseMode::AllowArgumentReuse8BitRefinement
  }

  pub(crate) fn is_16bit(self) -> bool {
    self == ArgumentReuseMode::AllowArgumentReuse16Bit
  }

  /// Whether a use with the given register limit forces a copy into a low
  /// register in this mode.
  pub(crate) fn has_register_constraint_limit(self, limit: u32) -> bool {
    match self {
      ArgumentReuseMode::AllowArgumentReuse4Bit => false,
      ArgumentReuseMode::AllowArgumentReuse8Bit
      | ArgumentReuseMode::AllowArgumentReuse8BitRefinement
      | ArgumentReuseMode::AllowArgumentReuse8BitRetry => limit == U4BIT_MAX,
      ArgumentReuseMode::AllowArgumentReuse16Bit => limit != U16BIT_MAX,
    }
  }
}

/// Linear scan register allocator for one method body in SSA form.
///
/// `allocate_registers` runs the full pipeline; afterwards the register
/// mapping, the scheduled moves and the debug locals can be queried.
pub struct LinearScanRegisterAllocator<'a, F: Function> {
  pub(crate) function: &'a F,
  pub(crate) options: &'a Options,
  pub(crate) numbering: Numbering,
  pub(crate) live_at_entry: Vec<LiveAtEntrySets>,
  pub(crate) intervals: Intervals,
  pub(crate) value_intervals: Vec<Option<IntervalIx>>,
  /// Top-level intervals in creation order; split children are reached
  /// through their parents.
  pub(crate) live_intervals: Vec<IntervalIx>,
  initial_interval_count: usize,
  number_of_argument_registers: u32,
  number_of_4bit_argument_registers: u32,
  pub(crate) mode: ArgumentReuseMode,
  free_registers: BTreeSet<u32>,
  /// One past the highest register number handed out so far.
  register_count: u32,
  unhandled: BTreeSet<(u32, IntervalIx)>,
  active: Vec<IntervalIx>,
  inactive: Vec<IntervalIx>,
  /// Registers that expired exactly at the current position; they cannot be
  /// used as spill targets for this iteration.
  expired_here: SmallVec<[u32; 4]>,
  move_exception_intervals: Vec<IntervalIx>,
  first_parallel_move_temporary: Option<u32>,
  /// For each local register, the count of unused local registers at or
  /// below it; used to compact spill slots that were rematerialized away.
  unused_registers: Option<Vec<u32>>,
  /// Scheduled moves in allocation numbering.
  pub(crate) raw_moves: Vec<ScheduledMove>,
  scheduled_moves: Vec<ScheduledMove>,
  pub(crate) debug_locals: Vec<DebugLocalsChangeAt>,
  pub(crate) locals_at_entry: Vec<Option<BTreeMap<u32, LocalId>>>,
  allocated: bool,
}

impl<'a, F: Function> LinearScanRegisterAllocator<'a, F> {
  pub fn new(function: &'a F, options: &'a Options) -> Self {
    let numbering = number_instructions(function);
    let live_at_entry = compute_live_at_entry_sets(function, options);
    let number_of_argument_registers =
      function.required_argument_registers(function.arguments());
    let num_blocks = function.num_blocks() as usize;
    Self {
      function,
      options,
      numbering,
      live_at_entry,
      intervals: Intervals::new(),
      value_intervals: vec![None; function.num_values() as usize],
      live_intervals: Vec::new(),
      initial_interval_count: 0,
      number_of_argument_registers,
      number_of_4bit_argument_registers: 0,
      mode: ArgumentReuseMode::AllowArgumentReuse4Bit,
      free_registers: BTreeSet::new(),
      register_count: 0,
      unhandled: BTreeSet::new(),
      active: Vec::new(),
      inactive: Vec::new(),
      expired_here: SmallVec::new(),
      move_exception_intervals: Vec::new(),
      first_parallel_move_temporary: None,
      unused_registers: None,
      raw_moves: Vec::new(),
      scheduled_moves: Vec::new(),
      debug_locals: Vec::new(),
      locals_at_entry: vec![None; num_blocks],
      allocated: false,
    }
  }

  fn internal_error(&self, message: &str) -> RegAllocError {
    RegAllocError::Internal {
      message: message.to_string(),
      method: self.function.method_name().to_string(),
    }
  }

  //===========================================================================
  // Pipeline

  /// Runs liveness, the mode ladder, move insertion and (in debug mode) the
  /// locals reconstruction.
  pub fn allocate_registers(&mut self) -> Result<(), RegAllocError> {
    self.constrain_argument_intervals();
    self.compute_liveness_information();
    self.initial_interval_count = self.intervals.len();
    self.perform_allocation()?;
    if self.options.debug {
      let (changes, locals_at_entry) = compute_debug_info(self)?;
      self.debug_locals = changes;
      self.locals_at_entry = locals_at_entry;
    }
    self.finalize_moves();
    self.allocated = true;
    info!(
      "allocated `{}`: {} registers used, mode {:?}",
      self.function.method_name(),
      self.registers_used(),
      self.mode
    );
    Ok(())
  }

  /// Record the constraint that incoming arguments are in consecutive
  /// registers: pre-seeded intervals starting at position zero, linked into
  /// a chain.
  fn constrain_argument_intervals(&mut self) {
    let mut index = 0;
    let mut previous: Option<IntervalIx> = None;
    for &argument in self.function.arguments() {
      let ix = self.intervals.push(
        argument,
        self.function.value_is_wide(argument),
        true,
        false,
        self.function.value_used_as_monitor(argument),
      );
      // A live range up to the argument instruction, so dead arguments
      // still get an interval.  This may be empty, which is fine.
      self.intervals.get_mut(ix).add_range(LiveRange::new(0, index));
      self.value_intervals[argument.0 as usize] = Some(ix);
      self.live_intervals.push(ix);
      if let Some(previous) = previous {
        self.intervals.get_mut(previous).next_consecutive = Some(ix);
        self.intervals.get_mut(ix).previous_consecutive = Some(previous);
      }
      previous = Some(ix);
      index += INSTRUCTION_NUMBER_DELTA;
    }
  }

  fn compute_liveness_information(&mut self) {
    compute_live_ranges(
      self.function,
      self.options,
      &self.numbering,
      &self.live_at_entry,
      &mut self.intervals,
      &mut self.value_intervals,
      &mut self.live_intervals,
    );
    // Art VMs with the this-verifier or JIT-debugging bug assume the
    // receiver register never changes; block it for the whole method.
    if (self.options.can_have_this_type_verifier_bug
      || self.options.can_have_this_jit_code_debugging_bug)
      && !self.function.method_is_static()
    {
      if let Some(&receiver) = self.function.arguments().first() {
        if let Some(ix) = self.value_intervals[receiver.0 as usize] {
          let end = self.numbering.next_instruction_number();
          let entry = self.intervals.get_mut(ix);
          entry.ranges.clear();
          entry.add_range(LiveRange::new(0, end));
          for set in self.live_at_entry.iter_mut() {
            set.live_values.insert(receiver);
          }
        }
      }
    }
  }

  fn perform_allocation(&mut self) -> Result<(), RegAllocError> {
    let initial_mode =
      if self.number_of_argument_registers <= U4BIT_MAX {
        ArgumentReuseMode::AllowArgumentReuse4Bit
      } else {
        ArgumentReuseMode::AllowArgumentReuse8Bit
      };
    self.perform_allocation_in_mode(initial_mode, false)
  }

  fn perform_allocation_in_mode(
    &mut self, mode: ArgumentReuseMode, retry: bool,
  ) -> Result<(), RegAllocError> {
    debug_assert!(
      self.number_of_4bit_argument_registers == 0 || mode.is_8bit_refinement()
    );
    self.mode = mode;
    debug!("allocation attempt in mode {:?}", mode);

    if retry {
      self.clear_register_assignments();
    }

    self.pin_argument_registers();

    let succeeded = self.perform_linear_scan()?;
    if succeeded {
      self.insert_moves()?;
      // Now that the max register number is known we may find that every
      // argument split can simply use the incoming register; redo move
      // insertion without the argument moves.
      if self.unsplit_arguments() {
        self.insert_moves()?;
      }
      self.compute_unused_registers();
    } else {
      debug_assert!(mode.is_4bit());
    }

    let pessimistic =
      self.options.testing.always_pessimistic_register_allocation;
    match mode {
      ArgumentReuseMode::AllowArgumentReuse4Bit => {
        if !succeeded
          || self.highest_used_register() > U4BIT_MAX
          || pessimistic
        {
          self.perform_allocation_in_mode(
            ArgumentReuseMode::AllowArgumentReuse8Bit,
            true,
          )?;
        }
      }
      ArgumentReuseMode::AllowArgumentReuse8Bit => {
        if self.highest_used_register() > U8BIT_MAX || pessimistic {
          // This always succeeds.
          self.unused_registers = None;
          self.perform_allocation_in_mode(
            ArgumentReuseMode::AllowArgumentReuse16Bit,
            true,
          )?;
        } else if self.retry_8bit_allocation_with_4bit_argument_registers() {
          // Refine using the knowledge that a prefix of the argument
          // registers fits in 4 bits.
          self.unused_registers = None;
          self.perform_allocation_in_mode(
            ArgumentReuseMode::AllowArgumentReuse8BitRefinement,
            true,
          )?;
        }
      }
      ArgumentReuseMode::AllowArgumentReuse8BitRefinement => {
        if self.highest_used_register() > U8BIT_MAX
          || self.number_of_4bit_argument_registers
            > self.compute_number_of_4bit_argument_registers()
        {
          // The refinement regressed; redo without it.
          self.number_of_4bit_argument_registers = 0;
          self.unused_registers = None;
          self.perform_allocation_in_mode(
            ArgumentReuseMode::AllowArgumentReuse8BitRetry,
            true,
          )?;
        }
      }
      ArgumentReuseMode::AllowArgumentReuse8BitRetry => {
        debug_assert!(self.highest_used_register() <= U8BIT_MAX);
      }
      ArgumentReuseMode::AllowArgumentReuse16Bit => {
        debug_assert!(self.highest_used_register() <= U16BIT_MAX);
      }
    }
    Ok(())
  }

  /// Restores the allocator to its pre-scan state: assignments and spill
  /// moves are dropped and intervals return to unsplit form.  Liveness and
  /// the argument chain survive.
  fn clear_register_assignments(&mut self) {
    self.free_registers.clear();
    self.register_count = 0;
    self.active.clear();
    self.expired_here.clear();
    self.inactive.clear();
    self.unhandled.clear();
    self.move_exception_intervals.clear();
    self.first_parallel_move_temporary = None;
    self.raw_moves.clear();
    for i in 0..self.live_intervals.len() {
      let ix = self.live_intervals[i];
      self.intervals.undo_splits(ix);
      let entry = self.intervals.get_mut(ix);
      if entry.has_register() {
        entry.spilled = false;
      }
      entry.clear_register_assignment();
      entry.is_invoke_range = false;
      entry.hint = None;
      entry.rematerializable = false;
    }
    self.intervals.truncate(self.initial_interval_count);
  }

  fn pin_argument_registers(&mut self) {
    if self.number_of_argument_registers == 0 {
      return;
    }
    self.increase_capacity(self.number_of_argument_registers - 1, true);
    let mut register = 0;
    for i in 0..self.function.arguments().len() {
      let argument = self.function.arguments()[i];
      if let Some(ix) = self.value_intervals[argument.0 as usize] {
        self.assign_register(ix, register);
        register += self.intervals.get(ix).required_registers();
      }
    }
  }

  //===========================================================================
  // Main loop

  fn perform_linear_scan(&mut self) -> Result<bool, RegAllocError> {
    for i in 0..self.live_intervals.len() {
      let ix = self.live_intervals[i];
      self.unhandled_insert(ix);
    }

    self.process_argument_live_intervals();
    let has_invoke_range = self.split_live_intervals_for_invoke_range();
    self.allocate_registers_for_move_exception_intervals(has_invoke_range);

    while let Some(&first) = self.unhandled.iter().next() {
      debug_assert!(self.invariants_hold());
      self.unhandled.remove(&first);
      let unhandled_interval = first.1;
      trace!(
        "processing {:?} [{}, {})",
        unhandled_interval,
        self.intervals.get(unhandled_interval).start(),
        self.intervals.get(unhandled_interval).end()
      );
      self.set_hint_for_dest_reg_of_check_cast(unhandled_interval);
      self.set_hint_to_promote_2addr_instruction(unhandled_interval);

      // If this value flows into a ranged invoke, fix the registers for the
      // whole consecutive chain now and propagate hints backwards.
      self.allocate_registers_for_invoke_range_splits(unhandled_interval)?;
      if self.intervals.get(unhandled_interval).has_register() {
        continue;
      }

      self.advance_state_to_live_intervals(unhandled_interval);

      if !self.allocate_single_interval(unhandled_interval)? {
        return Ok(false);
      }
      self.expired_here.clear();
    }
    debug_assert!(self.invariants_hold());
    Ok(true)
  }

  fn unhandled_insert(&mut self, ix: IntervalIx) {
    let start = self.intervals.get(ix).start();
    self.unhandled.insert((start, ix));
  }

  fn unhandled_remove(&mut self, ix: IntervalIx) {
    let start = self.intervals.get(ix).start();
    self.unhandled.remove(&(start, ix));
  }

  fn process_argument_live_intervals(&mut self) {
    for i in 0..self.function.arguments().len() {
      let argument = self.function.arguments()[i];
      let ix = match self.value_intervals[argument.0 as usize] {
        Some(ix) => ix,
        None => continue,
      };
      debug_assert!(self.intervals.get(ix).has_register());
      self.unhandled_remove(ix);
      let limit = self.intervals.get(ix).register_limit();
      let register = self.intervals.get(ix).register();
      let required = self.intervals.get(ix).required_registers();
      if !self.mode.has_register_constraint_limit(limit) {
        // Argument intervals start out active in their incoming registers.
        self.active.push(ix);
      } else if self.mode.is_8bit_refinement()
        && register + required <= self.number_of_4bit_argument_registers
      {
        self.active.push(ix);
      } else {
        // Treat the argument as spilled; constrained uses will load it into
        // a low register on demand.
        self.inactive.push(ix);
        if self.intervals.get(ix).uses.len() > 1 {
          if let Some(constrained_use) =
            self.intervals.get(ix).first_use_with_constraint()
          {
            let split_position =
              if self.intervals.get(ix).number_of_uses_with_constraint() == 1 {
                // A single constrained use: split right before it.
                constrained_use.position
              } else {
                // Several constrained uses: split right after the
                // definition so the argument tends to start out in a usable
                // register.
                let definition = self.function.value_definition(argument);
                definition
                  .map(|d| self.numbering.number(d) + 1)
                  .unwrap_or(constrained_use.position)
              };
            if let Some(split) = self.try_split_before(ix, split_position) {
              self.unhandled_insert(split);
            }
          }
        }
        self.free_occupied_registers_for_intervals(ix);
      }
    }
  }

  /// Catch handlers must start with their move-exception instruction and no
  /// spill moves can precede it, so all move-exception values are pinned to
  /// one dedicated register placed right after the arguments.
  fn allocate_registers_for_move_exception_intervals(
    &mut self, has_invoke_range_live_intervals: bool,
  ) {
    if self.mode.is_4bit() && !has_invoke_range_live_intervals {
      // Without splitting there is nothing to protect the handler entry
      // from; no dedicated register is needed.
      return;
    }
    for &block in self.function.blocks() {
      let entry_inst = self.function.block_instructions(block)[0];
      if !self.function.inst_is_move_exception(entry_inst) {
        continue;
      }
      let out = match self.function.inst_out_value(entry_inst) {
        Some(out) => out,
        None => continue,
      };
      if let Some(ix) = self.value_intervals[out.0 as usize] {
        self.unhandled_remove(ix);
        self.move_exception_intervals.push(ix);
        let register = self.number_of_argument_registers;
        self.intervals.get_mut(ix).set_register(register);
      }
    }
    if self.has_dedicated_move_exception_register() {
      let register = self.get_move_exception_register();
      debug_assert!(register == self.register_count);
      self.increase_capacity(register, true);
    }
    // Split right after the definition so normal uses compete for some
    // other register.
    for i in 0..self.move_exception_intervals.len() {
      let ix = self.move_exception_intervals[i];
      if self.intervals.get(ix).uses.len() > 1 {
        let position = self.intervals.get(ix).first_use_position()
          + INSTRUCTION_NUMBER_DELTA;
        if let Some(split) = self.try_split_before(ix, position) {
          self.unhandled_insert(split);
        }
      }
    }
  }

  fn needs_invoke_range_live_intervals(&self, inst: InstId) -> bool {
    let arguments = match self.function.inst_desc(inst) {
      InstDesc::Invoke { arguments } => arguments,
      _ => return false,
    };
    if self.function.required_argument_registers(arguments) <= 5 {
      return false;
    }
    if crate::analysis::arguments_are_already_linked(self.function, arguments)
      && arguments.iter().all(|&argument| {
        self.value_intervals[argument.0 as usize]
          .map_or(false, |ix| self.is_pinned_argument_register(ix))
      })
    {
      return false;
    }
    true
  }

  /// Splits each ranged-invoke operand precisely around the call: one split
  /// starting at the gap before the invoke, and one after it when the value
  /// lives on.
  fn split_live_intervals_for_invoke_range(&mut self) -> bool {
    let mut has_invoke_range_live_intervals = false;
    for i in 0..self.live_intervals.len() {
      let ix = self.live_intervals[i];
      let value = self.intervals.get(ix).value;
      let users: Vec<InstId> = self
        .function
        .value_users(value)
        .iter()
        .copied()
        .filter(|&user| self.needs_invoke_range_live_intervals(user))
        .collect();
      for invoke in users {
        let number = self.numbering.number(invoke);
        let overlapping = self.intervals.split_covering(ix, number);
        let invoke_range_intervals = if self.intervals.get(overlapping).start()
          == to_gap_position(number)
        {
          overlapping
        } else {
          let split = self.intervals.split_before(overlapping, number);
          self.unhandled_insert(split);
          split
        };
        self.intervals.get_mut(invoke_range_intervals).is_invoke_range = true;
        if number + 1 < self.intervals.get(invoke_range_intervals).end() {
          let successor =
            self.intervals.split_before(invoke_range_intervals, number + 2);
          self.unhandled_insert(successor);
        }
        has_invoke_range_live_intervals = true;
      }
    }
    has_invoke_range_live_intervals
  }

  /// Moves intervals between the active and inactive sets as the scan
  /// position advances to the start of the next unhandled interval.
  fn advance_state_to_live_intervals(&mut self, unhandled_interval: IntervalIx) {
    let start = self.intervals.get(unhandled_interval).start();

    let active = std::mem::replace(&mut self.active, Vec::new());
    for ix in active {
      let end = self.intervals.get(ix).end();
      if start >= end {
        self.free_occupied_registers_for_intervals(ix);
        if start == end {
          let (register, is_wide) = {
            let entry = self.intervals.get(ix);
            (entry.register(), entry.is_wide)
          };
          self.expired_here.push(register);
          if is_wide {
            self.expired_here.push(register + 1);
          }
        }
      } else if !self.intervals.get(ix).overlaps_position(start) {
        debug_assert!(self.intervals.get(ix).has_register());
        self.inactive.push(ix);
        self.free_occupied_registers_for_intervals(ix);
      } else {
        self.active.push(ix);
      }
    }

    let inactive = std::mem::replace(&mut self.inactive, Vec::new());
    for ix in inactive {
      let end = self.intervals.get(ix).end();
      if start >= end {
        if start == end {
          let (register, is_wide) = {
            let entry = self.intervals.get(ix);
            (entry.register(), entry.is_wide)
          };
          self.expired_here.push(register);
          if is_wide {
            self.expired_here.push(register + 1);
          }
        }
      } else if self.intervals.get(ix).overlaps_position(start) {
        debug_assert!(self.intervals.get(ix).has_register());
        self.active.push(ix);
        self.take_free_registers_for_intervals(ix);
      } else {
        self.inactive.push(ix);
      }
    }
  }

  //===========================================================================
  // Hints

  fn set_hint(&mut self, target: IntervalIx, hint: IntervalIx) {
    self.intervals.get_mut(target).hint = Some(hint);
  }

  /// A check-cast whose source and destination do not overlap and share
  /// debug-local info copies in place when both get the same register.
  fn set_hint_for_dest_reg_of_check_cast(&mut self, unhandled: IntervalIx) {
    if self.intervals.get(unhandled).hint.is_some() {
      return;
    }
    let value = self.intervals.get(unhandled).value;
    let definition = match self.function.value_definition(value) {
      Some(definition) => definition,
      None => return,
    };
    if let InstDesc::CheckCast { object } = self.function.inst_desc(definition)
    {
      if let Some(object_ix) = self.value_intervals[object.0 as usize] {
        if !self.intervals.overlaps(object_ix, unhandled)
          && self.function.value_local_info(object)
            == self.function.value_local_info(value)
        {
          self.set_hint(unhandled, object_ix);
        }
      }
    }
  }

  /// Bias an arithmetic binop result toward an operand register so the
  /// 2-address instruction form applies.
  fn set_hint_to_promote_2addr_instruction(&mut self, unhandled: IntervalIx) {
    if self.intervals.get(unhandled).hint.is_some() {
      return;
    }
    let value = self.intervals.get(unhandled).value;
    let definition = match self.function.value_definition(value) {
      Some(definition) => definition,
      None => return,
    };
    if let InstDesc::ArithmeticBinop { left, right, commutative, .. } =
      self.function.inst_desc(definition)
    {
      if let Some(left_ix) = self.value_intervals[left.0 as usize] {
        if !self.intervals.overlaps(left_ix, unhandled) {
          self.set_hint(unhandled, left_ix);
          return;
        }
      }
      if commutative {
        if let Some(right_ix) = self.value_intervals[right.0 as usize] {
          if !self.intervals.overlaps(right_ix, unhandled) {
            self.set_hint(unhandled, right_ix);
          }
        }
      }
    }
  }

  fn update_register_hints(&mut self, ix: IntervalIx) {
    let value = self.intervals.get(ix).value;
    // Propagate to phis this value flows into, and their other operands.
    for i in 0..self.function.value_phi_users(value).len() {
      let phi = self.function.value_phi_users(value)[i];
      let phi_ix = match self.value_intervals[phi.0 as usize] {
        Some(phi_ix) => phi_ix,
        None => continue,
      };
      if self.intervals.get(phi_ix).hint.is_some() {
        continue;
      }
      self.set_hint(phi_ix, ix);
      let block = self.function.phi_block(phi);
      for (operand_index, &operand) in
        self.function.phi_operands(phi).iter().enumerate()
      {
        if let Some(operand_ix) = self.value_intervals[operand.0 as usize] {
          let predecessor =
            self.function.block_predecessors(block)[operand_index];
          let covering = self
            .intervals
            .split_covering(operand_ix, self.numbering.exit(predecessor));
          if self.intervals.get(covering).hint.is_none() {
            self.set_hint(covering, ix);
          }
        }
      }
    }
    // A phi that just got its register wants as many operands as possible
    // in the same register to avoid phi moves.
    if self.function.value_is_phi(value) && self.intervals.is_split_parent(ix)
    {
      let block = self.function.phi_block(value);
      for (operand_index, &operand) in
        self.function.phi_operands(value).iter().enumerate()
      {
        if let Some(operand_ix) = self.value_intervals[operand.0 as usize] {
          let predecessor =
            self.function.block_predecessors(block)[operand_index];
          let covering = self
            .intervals
            .split_covering(operand_ix, self.numbering.exit(predecessor));
          self.set_hint(covering, ix);
        }
      }
    }
  }

  //===========================================================================
  // Invoke-range planning

  /// Look-ahead allocation for linked invoke-range chains: when processing
  /// the first chain member, give the whole chain consecutive registers and
  /// park every member in the inactive set.
  fn allocate_registers_for_invoke_range_splits(
    &mut self, unhandled: IntervalIx,
  ) -> Result<(), RegAllocError> {
    let value = self.intervals.get(unhandled).value;
    let users: Vec<InstId> = self
      .function
      .value_users(value)
      .iter()
      .copied()
      .filter(|&user| self.needs_invoke_range_live_intervals(user))
      .collect();
    for invoke in users {
      let number = self.numbering.number(invoke);
      let parent = self.intervals.split_parent(unhandled);
      let overlapping = self.intervals.split_covering(parent, number);
      if self.intervals.get(overlapping).has_register() {
        // The whole chain already got registers.
        continue;
      }
      let arguments: Vec<ValueId> = match self.function.inst_desc(invoke) {
        InstDesc::Invoke { arguments } => arguments.to_vec(),
        _ => continue,
      };
      let mut chain: Vec<IntervalIx> = Vec::with_capacity(arguments.len());
      for &argument in &arguments {
        let argument_ix = self.value_intervals[argument.0 as usize]
          .ok_or_else(|| self.internal_error("invoke operand without intervals"))?;
        let covering = self.intervals.split_covering(argument_ix, number);
        debug_assert!(!self.intervals.get(covering).has_register());
        debug_assert!(self.intervals.get(covering).start() == number - 1);
        chain.push(covering);
      }

      // Save the free-set snapshot.
      let saved_free_registers = self.free_registers.clone();
      let saved_register_count = self.register_count;

      // Treat overlapping actives as blocked; allow argument-register reuse
      // for overlap-free argument intervals (bridge methods forwarding
      // their arguments benefit).
      let active = self.active.clone();
      for active_ix in active {
        if chain.iter().any(|&c| self.intervals.overlaps(active_ix, c)) {
          self.exclude_registers_for_interval(active_ix);
        } else if self.intervals.is_argument_interval(active_ix) {
          self.free_occupied_registers_for_intervals(active_ix);
        }
      }

      for &member in &chain {
        self.unhandled_remove(member);
      }
      self.allocate_linked_intervals(&chain, invoke);

      // Restore the free-set snapshot, keeping any capacity growth.
      self.free_registers = saved_free_registers;
      for register in saved_register_count..self.register_count {
        self.free_registers.insert(register);
      }
      for &member in &chain {
        self.inactive.push(member);
      }
    }
    Ok(())
  }

  fn allocate_linked_intervals(&mut self, chain: &[IntervalIx], invoke: InstId) {
    let start = chain[0];
    let consecutive_arguments = chain.windows(2).all(|pair| {
      let previous_parent = self.intervals.split_parent(pair[0]);
      let current_parent = self.intervals.split_parent(pair[1]);
      self.intervals.get(current_parent).previous_consecutive
        == Some(previous_parent)
    }) && self
      .intervals
      .is_argument_interval(self.intervals.split_parent(start));
    let consecutive_pinned_arguments = consecutive_arguments
      && chain.iter().all(|&c| self.is_pinned_argument_register(c));

    let mut next_register;
    if consecutive_pinned_arguments {
      // Use the arguments straight from their input registers.
      let parent = self.intervals.split_parent(start);
      next_register = self.intervals.get(parent).register();
    } else {
      let number_of_registers: u32 =
        chain.iter().map(|&c| self.intervals.get(c).required_registers()).sum();
      let number_of_out_registers = self
        .function
        .inst_out_value(invoke)
        .map_or(0, |out| self.function.value_required_registers(out));
      // Reserve room at the bottom for the result when the chain would push
      // it out of the 4-bit range.
      if number_of_out_registers > 0
        && number_of_registers + number_of_out_registers - 1 > U4BIT_MAX
      {
        let mut first_local_register = self.number_of_argument_registers;
        if self.has_dedicated_move_exception_register()
          && self.is_dedicated_move_exception_register_in_first_local_register()
        {
          first_local_register += 1;
        }
        self.ensure_capacity(first_local_register + number_of_out_registers - 1);
        for i in 0..number_of_out_registers {
          self.free_registers.remove(&(first_local_register + i));
        }
      }

      let inactive = self.inactive.clone();
      for inactive_ix in inactive {
        if chain.iter().any(|&c| self.intervals.overlaps(inactive_ix, c)) {
          self.exclude_registers_for_interval(inactive_ix);
        }
      }

      let start_parent = self.intervals.split_parent(start);
      if consecutive_arguments
        && self.register_range_is_free(
          self.intervals.get(start_parent).register(),
          number_of_registers,
        )
      {
        next_register = self.intervals.get(start_parent).register();
      } else {
        // Exclude pinned argument registers with a split overlapping any
        // chain member.
        for i in 0..self.function.arguments().len() {
          let argument = self.function.arguments()[i];
          if let Some(argument_ix) = self.value_intervals[argument.0 as usize]
          {
            if self.is_pinned_argument_register(argument_ix)
              && self.live_intervals_overlapping_any_of(argument_ix, chain)
            {
              self.exclude_registers_for_interval(argument_ix);
            }
          }
        }
        if self.has_dedicated_move_exception_register() {
          let can_use_move_exception_register = self
            .is_dedicated_move_exception_register_in_first_local_register()
            && !self.overlaps_move_exception_interval(start);
          if !can_use_move_exception_register {
            let register = self.get_move_exception_register();
            self.free_registers.remove(&register);
          }
        }
        next_register =
          self.get_free_consecutive_registers(number_of_registers, false);
      }
    }

    for &member in chain {
      self.intervals.get_mut(member).set_register(next_register);
      debug_assert!(
        self.verify_register_assignment_not_conflicting_with_argument(member)
      );
      next_register += self.intervals.get(member).required_registers();
    }

    // Hints: pull the rest of each value toward the chain register.
    for &member in chain {
      let parent = self.intervals.split_parent(member);
      self.set_hint(parent, member);
      let siblings = self.intervals.get(parent).split_children.clone();
      for sibling in siblings {
        if sibling != member && !self.intervals.get(sibling).has_register() {
          self.set_hint(sibling, member);
        }
      }
      let value = self.intervals.get(member).value;
      if let Some(definition) = self.function.value_definition(value) {
        if let InstDesc::Move { src } = self.function.inst_desc(definition) {
          if let Some(src_ix) = self.value_intervals[src.0 as usize] {
            self.set_hint(src_ix, member);
          }
        }
      }
    }
  }

  /// True when any split of the given parent overlaps one of the chain
  /// members.
  fn live_intervals_overlapping_any_of(
    &self, parent: IntervalIx, chain: &[IntervalIx],
  ) -> bool {
    debug_assert!(self.intervals.is_split_parent(parent));
    self.intervals.get(parent).split_children.iter().any(|&split| {
      chain.iter().any(|&member| self.intervals.overlaps(split, member))
    })
  }

  fn verify_register_assignment_not_conflicting_with_argument(
    &self, ix: IntervalIx,
  ) -> bool {
    debug_assert!(self.intervals.get(ix).has_register());
    for i in 0..self.function.arguments().len() {
      let argument = self.function.arguments()[i];
      if let Some(argument_ix) = self.value_intervals[argument.0 as usize] {
        debug_assert!(
          self.intervals.split_parent(ix) == argument_ix
            || !self.is_pinned_argument_register(argument_ix)
            || !self
              .intervals
              .get(ix)
              .has_conflicting_registers(self.intervals.get(argument_ix))
            || !self.intervals.any_split_overlaps(argument_ix, ix)
        );
      }
    }
    true
  }

  //===========================================================================
  // Spill register selection

  fn get_new_spill_register(&mut self, ix: IntervalIx) -> u32 {
    if self.intervals.is_argument_interval(ix) {
      // Arguments always sit in their incoming registers; spill there.
      let parent = self.intervals.split_parent(ix);
      return self.intervals.get(parent).register();
    }
    let register = self.register_count;
    let required = self.intervals.get(ix).required_registers();
    self.increase_capacity(register + required - 1, false);
    register
  }

  fn get_spill_register(
    &mut self, ix: IntervalIx, excluded_registers: &[u32],
  ) -> u32 {
    if self.intervals.is_argument_interval(ix) {
      let parent = self.intervals.split_parent(ix);
      return self.intervals.get(parent).register();
    }

    let previous_free_registers = self.free_registers.clone();
    let previous_register_count = self.register_count;
    for i in 0..self.expired_here.len() {
      let register = self.expired_here[i];
      self.free_registers.remove(&register);
    }
    for &register in excluded_registers {
      self.free_registers.remove(&register);
    }

    let is_wide = self.intervals.get(ix).is_wide;
    // Reuse a register already used by a sibling split when possible; that
    // saves resolution moves.
    let mut register = None;
    let parent = self.intervals.split_parent(ix);
    let siblings = self.intervals.get(parent).split_children.clone();
    for sibling in siblings {
      if let Some(candidate) = self.intervals.get(sibling).register {
        if self.registers_are_free_and_consecutive(candidate, is_wide)
          && self.may_spill_live_intervals_to_register(
            ix,
            candidate,
            previous_register_count,
          )
        {
          register = Some(candidate);
          break;
        }
      }
    }

    let register = match register {
      Some(register) => register,
      None => loop {
        // A 4-bit next use wants a small register so no move is needed
        // there.
        let prioritize_small_registers = self
          .intervals
          .get(ix)
          .first_use()
          .map_or(false, |first| first.limit == U4BIT_MAX);
        let required = self.intervals.get(ix).required_registers();
        let candidate = self
          .get_free_consecutive_registers(required, prioritize_small_registers);
        if self.may_spill_live_intervals_to_register(
          ix,
          candidate,
          previous_register_count,
        ) {
          break candidate;
        }
      },
    };

    self.free_registers = previous_free_registers;
    for r in previous_register_count..self.register_count {
      self.free_registers.insert(r);
    }
    debug_assert!(self.registers_are_free(register, is_wide));
    register
  }

  /// Checks a spill candidate against pinned arguments, overlapping
  /// inactive intervals and the move-exception interval.  Rejected
  /// candidates are removed from the free set so the search progresses.
  fn may_spill_live_intervals_to_register(
    &mut self, ix: IntervalIx, register: u32, previous_register_count: u32,
  ) -> bool {
    if register >= previous_register_count {
      // A fresh register is always fine.
      return true;
    }

    let is_wide = self.intervals.get(ix).is_wide;
    if register < self.number_of_argument_registers {
      // Walk the argument chain to the arguments occupying this register.
      let mut argument_ix = self
        .function
        .arguments()
        .first()
        .and_then(|&a| self.value_intervals[a.0 as usize]);
      while let Some(current) = argument_ix {
        if self.intervals.get(current).uses_register(register, is_wide) {
          break;
        }
        argument_ix = self.intervals.get(current).next_consecutive;
      }
      while let Some(current) = argument_ix {
        if !self.intervals.get(current).uses_register(register, is_wide) {
          break;
        }
        if self.intervals.any_split_overlaps(current, ix) {
          self.free_registers.remove(&register);
          if register == self.intervals.get(current).register()
            && self.intervals.get(current).is_wide
          {
            self.free_registers.remove(&(register + 1));
          }
          return false;
        }
        argument_ix = self.intervals.get(current).next_consecutive;
      }
    }

    for i in 0..self.inactive.len() {
      let inactive_ix = self.inactive[i];
      if self.intervals.get(inactive_ix).uses_register(register, is_wide)
        && self.intervals.overlaps(ix, inactive_ix)
      {
        self.free_registers.remove(&register);
        if register == self.intervals.get(inactive_ix).register()
          && self.intervals.get(inactive_ix).is_wide
        {
          self.free_registers.remove(&(register + 1));
        }
        return false;
      }
    }

    if self.has_dedicated_move_exception_register() {
      let move_exception_register = self.get_move_exception_register();
      let overlaps = (register == move_exception_register
        || (is_wide && register + 1 == move_exception_register))
        && self.overlaps_move_exception_interval(ix);
      if overlaps {
        self.free_registers.remove(&register);
        return false;
      }
    }

    true
  }

  //===========================================================================
  // Target workarounds

  /// Art had a bug (arm32, Android N/O) where `aget-wide vA, vA, vB` with an
  /// out-of-bounds index threw the wrong exception.  Keep the array and
  /// result registers distinct.
  fn needs_array_get_wide_workaround(&self, ix: IntervalIx) -> bool {
    if self
      .options
      .can_use_same_array_and_result_register_in_array_get_wide
    {
      return false;
    }
    let entry = self.intervals.get(ix);
    if !entry.is_wide {
      return false;
    }
    if self.function.value_is_phi(entry.value) {
      // Phis are written by moves, not by the aget-wide itself.
      return false;
    }
    if !self.intervals.is_split_parent(ix) {
      return false;
    }
    match self.function.value_definition(entry.value) {
      Some(definition) => matches!(
        self.function.inst_desc(definition),
        InstDesc::ArrayGet { result_is_wide: true, .. }
      ),
      None => false,
    }
  }

  fn is_array_get_array_register(&self, ix: IntervalIx, register: u32) -> bool {
    debug_assert!(self.needs_array_get_wide_workaround(ix));
    let value = self.intervals.get(ix).value;
    let array = match self
      .function
      .value_definition(value)
      .map(|d| self.function.inst_desc(d))
    {
      Some(InstDesc::ArrayGet { array, .. }) => array,
      _ => return false,
    };
    self
      .operand_register_at(array, self.intervals.get(ix).start())
      .map_or(false, |array_register| array_register == register)
  }

  /// `cmp-long` and `long-to-int` on some targets write their single result
  /// before fully reading the long operands.
  fn needs_single_result_overlapping_long_operands_workaround(
    &self, ix: IntervalIx,
  ) -> bool {
    if !self.options.can_have_cmp_long_bug
      && !self.options.can_have_long_to_int_bug
    {
      return false;
    }
    let entry = self.intervals.get(ix);
    if entry.is_wide {
      return false;
    }
    if self.function.value_is_phi(entry.value) {
      return false;
    }
    if !self.intervals.is_split_parent(ix) {
      return false;
    }
    match self
      .function
      .value_definition(entry.value)
      .map(|d| self.function.inst_desc(d))
    {
      Some(InstDesc::Cmp { operands_are_wide, .. }) => operands_are_wide,
      Some(InstDesc::NumberConversion { is_long_to_int, .. }) => is_long_to_int,
      _ => false,
    }
  }

  fn single_overlapping_long(register: u32, long_register: u32) -> bool {
    register == long_register || register == long_register + 1
  }

  fn is_single_result_overlapping_long_operands(
    &self, ix: IntervalIx, register: u32,
  ) -> bool {
    debug_assert!(
      self.needs_single_result_overlapping_long_operands_workaround(ix)
    );
    let entry = self.intervals.get(ix);
    let start = entry.start();
    match self
      .function
      .value_definition(entry.value)
      .map(|d| self.function.inst_desc(d))
    {
      Some(InstDesc::Cmp { left, right, .. }) => {
        let left_register = self.operand_register_at(left, start);
        let right_register = self.operand_register_at(right, start);
        left_register
          .map_or(false, |l| Self::single_overlapping_long(register, l))
          || right_register
            .map_or(false, |r| Self::single_overlapping_long(register, r))
      }
      Some(InstDesc::NumberConversion { src, .. }) => {
        self.operand_register_at(src, start) == Some(register)
      }
      _ => false,
    }
  }

  /// The dalvik jit wrote the first half of a long add/sub/or/xor/and
  /// result before reading the second half of the inputs; a half-overlapping
  /// result pair computes garbage.
  fn needs_long_result_overlapping_long_operands_workaround(
    &self, ix: IntervalIx,
  ) -> bool {
    if !self.options.can_have_overlapping_long_register_bug {
      return false;
    }
    let entry = self.intervals.get(ix);
    if !entry.is_wide {
      return false;
    }
    if self.function.value_is_phi(entry.value) {
      return false;
    }
    if !self.intervals.is_split_parent(ix) {
      return false;
    }
    match self
      .function
      .value_definition(entry.value)
      .map(|d| self.function.inst_desc(d))
    {
      Some(InstDesc::ArithmeticBinop { op, is_long, .. }) => {
        is_long
          && matches!(
            op,
            crate::interface::ArithmeticOp::Add
              | crate::interface::ArithmeticOp::Sub
          )
      }
      Some(InstDesc::LogicalBinop { is_long, .. }) => is_long,
      _ => false,
    }
  }

  fn long_half_overlapping_long(register1: u32, register2: u32) -> bool {
    register1 == register2 + 1 || register1 + 1 == register2
  }

  fn is_long_result_overlapping_long_operands(
    &self, ix: IntervalIx, register: u32,
  ) -> bool {
    debug_assert!(
      self.needs_long_result_overlapping_long_operands_workaround(ix)
    );
    let entry = self.intervals.get(ix);
    let start = entry.start();
    let (left, right) = match self
      .function
      .value_definition(entry.value)
      .map(|d| self.function.inst_desc(d))
    {
      Some(InstDesc::ArithmeticBinop { left, right, .. }) => (left, right),
      Some(InstDesc::LogicalBinop { left, right, .. }) => (left, right),
      _ => return false,
    };
    // The original bug only concerns overlap with the second operand, but
    // some vendor optimizations have been seen to need the conservative
    // check against both.
    let left_register = self.operand_register_at(left, start);
    let right_register = self.operand_register_at(right, start);
    left_register
      .map_or(false, |l| Self::long_half_overlapping_long(register, l))
      || right_register
        .map_or(false, |r| Self::long_half_overlapping_long(register, r))
  }

  fn operand_register_at(&self, value: ValueId, position: u32) -> Option<u32> {
    let ix = self.value_intervals[value.0 as usize]?;
    let covering = self.intervals.split_covering(ix, position);
    self.intervals.get(covering).register
  }

  /// Spill and restore moves always go after a move-exception instruction,
  /// so a value overlapping any move-exception interval can never share the
  /// dedicated register.
  fn overlaps_move_exception_interval(&self, ix: IntervalIx) -> bool {
    if !self.has_dedicated_move_exception_register() {
      return false;
    }
    if self.move_exception_intervals.len() > EXCEPTION_INTERVALS_OVERLAP_CUTOFF
    {
      return true;
    }
    self
      .move_exception_intervals
      .iter()
      .any(|&mei| self.intervals.any_split_overlaps(ix, mei))
  }

  //===========================================================================
  // Single interval allocation

  fn allocate_single_interval(
    &mut self, unhandled: IntervalIx,
  ) -> Result<bool, RegAllocError> {
    let mut register_constraint = self.intervals.get(unhandled).register_limit();
    debug_assert!(register_constraint <= U16BIT_MAX);
    debug_assert!(self.intervals.get(unhandled).required_registers() <= 2);
    let needs_register_pair = self.intervals.get(unhandled).is_wide;

    // An argument split without a register constraint can just use the
    // incoming argument register; no move needed.
    if self.is_pinned_argument_register(unhandled) {
      if register_constraint == U16BIT_MAX
        || (self.mode.is_8bit() && register_constraint == U8BIT_MAX)
      {
        let parent = self.intervals.split_parent(unhandled);
        let argument_register = self.intervals.get(parent).register();
        self.assign_free_register_to_unhandled_interval(
          unhandled,
          argument_register,
        );
        return Ok(true);
      }
    }

    if !self.mode.is_4bit() && register_constraint < U16BIT_MAX {
      // The argument/temporary swap after allocation frees this many more
      // encodable registers, and the move-exception/local swap one more.
      register_constraint += self.number_of_argument_registers;
      register_constraint += self.get_move_exception_offset_for_local_registers();
    }

    let mut free_positions =
      self.compute_free_positions(unhandled, register_constraint);

    if self.use_register_hint(
      unhandled,
      register_constraint,
      &mut free_positions,
      needs_register_pair,
    ) {
      return Ok(true);
    }

    // Take the register that is free the longest.
    let candidate = self.get_largest_valid_candidate(
      unhandled,
      register_constraint,
      needs_register_pair,
      &mut free_positions,
      RegisterType::Any,
    );

    let mut largest_free_position = 0;
    if let Some(candidate) = candidate {
      largest_free_position = free_positions.get(candidate);
      if needs_register_pair {
        largest_free_position =
          largest_free_position.min(free_positions.get(candidate + 1));
      }
    }

    if largest_free_position == 0 {
      // Nothing is free.
      if self.mode.is_4bit() {
        // No spilling in this mode; bail out and restart without argument
        // reuse.
        return Ok(false);
      }
      debug_assert!(self.intervals.get(unhandled).has_uses());
      let first_use = self.intervals.get(unhandled).first_use();
      let first_use_unconstrained =
        first_use.map_or(true, |u| !u.has_constraint());
      if first_use_unconstrained {
        // Spill this interval up to its first constrained use instead of
        // displacing somebody else.
        let next_constrained_position = self
          .intervals
          .get(unhandled)
          .uses
          .iter()
          .find(|u| self.mode.has_register_constraint_limit(u.limit))
          .map(|u| u.position);
        let register = self.get_spill_register(unhandled, &[]);
        if let Some(position) = next_constrained_position {
          if let Some(split) = self.try_split_before(unhandled, position) {
            self.unhandled_insert(split);
          }
        }
        self.assign_free_register_to_unhandled_interval(unhandled, register);
      } else {
        self.allocate_blocked_register(unhandled, register_constraint)?;
      }
    } else {
      let candidate = match candidate {
        Some(candidate) => candidate,
        None => return Err(self.internal_error("missing register candidate")),
      };
      let candidate_end =
        candidate + self.intervals.get(unhandled).required_registers() - 1;
      if largest_free_position >= self.intervals.get(unhandled).end() {
        // Free for the whole interval.
        self.ensure_capacity(candidate_end);
        self.assign_free_register_to_unhandled_interval(unhandled, candidate);
      } else if self.mode.is_4bit() {
        // No splitting in this mode.
        return Ok(false);
      } else {
        // Use the candidate for as long as it is free.
        let constraint_before_split =
          self.intervals.get(unhandled).register_limit();
        let split =
          self.intervals.split_before(unhandled, largest_free_position);
        debug_assert!(split != unhandled);
        self.unhandled_insert(split);

        // The split may have shed the constrained uses; rerunning can then
        // find a better register, notably for pinned arguments.
        if self.intervals.get(unhandled).register_limit()
          != constraint_before_split
        {
          return self.allocate_single_interval(unhandled);
        }

        self.ensure_capacity(candidate_end);
        self.assign_free_register_to_unhandled_interval(unhandled, candidate);
      }
    }
    Ok(true)
  }

  fn compute_free_positions(
    &self, unhandled: IntervalIx, register_constraint: u32,
  ) -> RegisterPositions {
    let mut free_positions =
      RegisterPositions::new(register_constraint as usize + 1);

    if self.options.debug && !self.function.method_is_static() {
      // The debugger expects to find the receiver in its input register.
      debug_assert!(self.number_of_argument_registers > 0);
      free_positions.set_blocked(0);
    }

    if self.mode.is_4bit() {
      // Only a pinned receiver blocks its register; the other argument
      // registers are reusable.
      if let Some(&first) = self.function.arguments().first() {
        if let Some(first_ix) = self.value_intervals[first.0 as usize] {
          if self.is_pinned_argument_register(first_ix) {
            for register in self.intervals.get(first_ix).registers() {
              if register <= register_constraint {
                free_positions.set_blocked(register);
              }
            }
          }
        }
      }
    } else {
      let mut i = 0;
      if self.mode.is_8bit_refinement() {
        debug_assert!(self.number_of_4bit_argument_registers > 0);
        let mut remaining =
          self.number_of_4bit_argument_registers as i64;
        for argument_index in 0..self.function.arguments().len() {
          let argument = self.function.arguments()[argument_index];
          let required =
            self.function.value_required_registers(argument);
          remaining -= required as i64;
          if remaining < 0 {
            break;
          }
          // A 4-bit-safe argument register is reusable unless the two live
          // ranges overlap.
          if let Some(argument_ix) = self.value_intervals[argument.0 as usize]
          {
            if self.intervals.any_split_overlaps(argument_ix, unhandled) {
              for j in 0..required {
                if i + j <= register_constraint {
                  free_positions.set_blocked(i + j);
                }
              }
            }
          }
          i += required;
        }
      }
      while i < self.number_of_argument_registers && i <= register_constraint {
        free_positions.set_blocked(i);
        i += 1;
      }
    }

    if self.has_dedicated_move_exception_register() {
      let move_exception_register = self.get_move_exception_register();
      if self.intervals.get(unhandled).register_limit() == U4BIT_MAX
        && self.is_dedicated_move_exception_register_in_last_local_register()
      {
        if move_exception_register <= register_constraint {
          free_positions.set_blocked(move_exception_register);
        }
      } else if self.overlaps_move_exception_interval(unhandled)
        && move_exception_register <= register_constraint
      {
        free_positions.set_blocked(move_exception_register);
      }
    }

    // Active intervals block their registers outright.
    for &active_ix in &self.active {
      let entry = self.intervals.get(active_ix);
      let active_register = entry.register();
      if active_register <= register_constraint {
        for i in 0..entry.required_registers() {
          if active_register + i <= register_constraint {
            free_positions.set_blocked(active_register + i);
          }
        }
      }
    }

    // Inactive intervals that overlap are free until the next overlap.
    for &inactive_ix in &self.inactive {
      let entry = self.intervals.get(inactive_ix);
      let inactive_register = entry.register();
      if inactive_register <= register_constraint
        && self.intervals.overlaps(unhandled, inactive_ix)
      {
        let next_overlap = self
          .intervals
          .get(unhandled)
          .next_overlap(entry)
          .unwrap_or(u32::max_value());
        for i in 0..entry.required_registers() {
          let register = inactive_register + i;
          if register <= register_constraint
            && !free_positions.is_blocked(register)
          {
            let unhandled_start =
              to_instruction_position(self.intervals.get(unhandled).start());
            if next_overlap == unhandled_start {
              // Free only until the next instruction is no use; this
              // happens when the unhandled interval starts at a gap.
              free_positions.set_blocked(register);
            } else if next_overlap < free_positions.get(register) {
              free_positions.set(
                register,
                next_overlap,
                self.register_type_of(inactive_ix),
              );
            }
          }
        }
      }
    }
    free_positions
  }

  fn register_type_of(&self, ix: IntervalIx) -> RegisterType {
    let entry = self.intervals.get(ix);
    if entry.is_const_number {
      RegisterType::ConstNumber
    } else if entry.used_as_monitor {
      RegisterType::Monitor
    } else {
      RegisterType::Other
    }
  }

  //===========================================================================
  // Hint-driven selection

  /// Try the hint register, then the previous and next split's registers,
  /// then (for phis) the operand registers by descending frequency.
  fn use_register_hint(
    &mut self, unhandled: IntervalIx, register_constraint: u32,
    free_positions: &mut RegisterPositions, needs_register_pair: bool,
  ) -> bool {
    let mut tried_hints: SmallVec<[u32; 4]> = SmallVec::new();

    if let Some(hint_ix) = self.intervals.get(unhandled).hint {
      // A hint target that lost its register again contributes nothing.
      if let Some(register) = self.intervals.get(hint_ix).register {
        if !tried_hints.contains(&register) {
          tried_hints.push(register);
          if self.try_hint(
            unhandled,
            register_constraint,
            free_positions,
            needs_register_pair,
            register,
          ) {
            return true;
          }
        }
      }
    }

    if let Some(previous_split) = self.intervals.previous_split(unhandled) {
      if let Some(register) = self.intervals.get(previous_split).register {
        if !tried_hints.contains(&register) {
          tried_hints.push(register);
          if self.try_hint(
            unhandled,
            register_constraint,
            free_positions,
            needs_register_pair,
            register,
          ) {
            return true;
          }
        }
      }
    }

    if let Some(next_split) = self.intervals.next_split(unhandled) {
      if let Some(register) = self.intervals.get(next_split).register {
        if !tried_hints.contains(&register) {
          tried_hints.push(register);
          if self.try_hint(
            unhandled,
            register_constraint,
            free_positions,
            needs_register_pair,
            register,
          ) {
            return true;
          }
        }
      }
    }

    // For phis, try the operand registers by descending frequency.
    let value = self.intervals.get(unhandled).value;
    if self.function.value_is_phi(value) {
      let block = self.function.phi_block(value);
      let mut counts: Vec<(u32, u32)> = Vec::new();
      for (operand_index, &operand) in
        self.function.phi_operands(value).iter().enumerate()
      {
        let operand_ix = match self.value_intervals[operand.0 as usize] {
          Some(operand_ix) => operand_ix,
          None => continue,
        };
        let covering = if self.intervals.has_splits(operand_ix) {
          let predecessor =
            self.function.block_predecessors(block)[operand_index];
          self
            .intervals
            .split_covering(operand_ix, self.numbering.exit(predecessor))
        } else {
          operand_ix
        };
        if let Some(register) = self.intervals.get(covering).register {
          match counts.iter_mut().find(|(r, _)| *r == register) {
            Some((_, count)) => *count += 1,
            None => counts.push((register, 1)),
          }
        }
      }
      counts.sort_by(|left, right| {
        right.1.cmp(&left.1).then(left.0.cmp(&right.0))
      });
      for (register, _) in counts {
        if self.try_hint(
          unhandled,
          register_constraint,
          free_positions,
          needs_register_pair,
          register,
        ) {
          return true;
        }
      }
    }

    false
  }

  fn try_hint(
    &mut self, unhandled: IntervalIx, register_constraint: u32,
    free_positions: &RegisterPositions, needs_register_pair: bool,
    register: u32,
  ) -> bool {
    let register_end = register + if needs_register_pair { 1 } else { 0 };
    if register_end > register_constraint {
      return false;
    }
    if free_positions.is_blocked_with_pair(register, needs_register_pair) {
      return self.try_allocate_blocked_hint(unhandled, register);
    }
    let mut free_position = free_positions.get(register);
    if needs_register_pair {
      free_position = free_position.min(free_positions.get(register + 1));
    }
    if free_position < self.intervals.get(unhandled).end() {
      return false;
    }
    if self.needs_long_result_overlapping_long_operands_workaround(unhandled)
      && self.is_long_result_overlapping_long_operands(unhandled, register)
    {
      return false;
    }
    if self.needs_array_get_wide_workaround(unhandled)
      && self.is_array_get_array_register(unhandled, register)
    {
      return false;
    }
    self.assign_free_register_to_unhandled_interval(unhandled, register);
    true
  }

  /// The only path that steals a register from an active interval: when the
  /// hint register is the next split's register and is blocked by a single
  /// unconstrained active interval, evict it.
  fn try_allocate_blocked_hint(
    &mut self, unhandled: IntervalIx, candidate: u32,
  ) -> bool {
    if !self.options.testing.enable_register_hints_for_blocked_registers {
      return false;
    }
    let alternative_hint = self
      .intervals
      .next_split(unhandled)
      .and_then(|next| self.intervals.get(next).register);
    if alternative_hint != Some(candidate) {
      return false;
    }
    if self.needs_array_get_wide_workaround(unhandled)
      || self.needs_long_result_overlapping_long_operands_workaround(unhandled)
    {
      return false;
    }
    if self.is_argument_register(candidate) {
      for &argument in self.function.arguments() {
        if self.is_pinned_argument(argument) {
          return false;
        }
      }
    }
    if self.is_dedicated_move_exception_register(candidate) {
      return false;
    }
    let inactive_with_register = self.get_live_intervals_with_register(
      &self.inactive,
      unhandled,
      candidate,
      |allocator, ix| allocator.intervals.overlaps(unhandled, ix),
    );
    if !inactive_with_register.is_empty() {
      return false;
    }
    let blocking_intervals = self.get_live_intervals_with_register(
      &self.active,
      unhandled,
      candidate,
      |_, _| true,
    );
    debug_assert!(!blocking_intervals.is_empty());
    if blocking_intervals.len() != 1 {
      return false;
    }
    let blocking = blocking_intervals[0];
    if self.intervals.get(unhandled).is_wide {
      // The low half could be blocked by an inactive interval; be
      // conservative.
      if self.intervals.get(blocking).register() != candidate
        || !self.intervals.get(blocking).is_wide
      {
        return false;
      }
    }
    if self.is_argument_register(candidate)
      && self.is_pinned_argument_register(blocking)
    {
      return false;
    }
    let blocking_start = self.intervals.get(blocking).start();
    let unhandled_start = self.intervals.get(unhandled).start();
    if to_instruction_position(blocking_start)
      == to_instruction_position(unhandled_start)
    {
      return false;
    }
    if self.has_constrained_use_in_range(
      blocking,
      unhandled_start,
      self.intervals.get(unhandled).end(),
    ) {
      return false;
    }
    if !self.expired_here.is_empty() {
      return false;
    }
    let split = match self.try_split_before(blocking, unhandled_start) {
      Some(split) => split,
      None => return false,
    };
    let blocking_register = self.intervals.get(blocking).register();
    self.free_occupied_registers_for_intervals(blocking);
    self
      .assign_free_register_to_unhandled_interval(unhandled, blocking_register);
    self.active.retain(|&active_ix| active_ix != blocking);
    self.unhandled_insert(split);
    true
  }

  fn get_live_intervals_with_register(
    &self, list: &[IntervalIx], unhandled: IntervalIx, register: u32,
    predicate: impl Fn(&Self, IntervalIx) -> bool,
  ) -> SmallVec<[IntervalIx; 2]> {
    let is_wide = self.intervals.get(unhandled).is_wide;
    let mut intervals_with_register: Option<IntervalIx> = None;
    for &ix in list {
      if !self.intervals.get(ix).uses_register(register, is_wide)
        || !predicate(self, ix)
      {
        continue;
      }
      if !is_wide
        || self.intervals.get(ix).uses_both_registers(register, register + 1)
      {
        let mut result = SmallVec::new();
        result.push(ix);
        return result;
      }
      if let Some(other) = intervals_with_register {
        let mut result = SmallVec::new();
        result.push(ix);
        result.push(other);
        return result;
      }
      intervals_with_register = Some(ix);
    }
    let mut result = SmallVec::new();
    if let Some(ix) = intervals_with_register {
      result.push(ix);
    }
    result
  }

  fn has_constrained_use_in_range(
    &self, ix: IntervalIx, start: u32, end: u32,
  ) -> bool {
    self.intervals.get(ix).uses.iter().any(|u| {
      self.mode.has_register_constraint_limit(u.limit)
        && start < u.position
        && u.position < end
    })
  }

  //===========================================================================
  // Candidate selection

  fn assign_register(&mut self, ix: IntervalIx, register: u32) {
    debug_assert!(
      register + self.intervals.get(ix).required_registers()
        <= self.register_count
    );
    self.intervals.get_mut(ix).set_register(register);
    self.update_register_hints(ix);
  }

  fn assign_free_register_to_unhandled_interval(
    &mut self, unhandled: IntervalIx, register: u32,
  ) {
    self.assign_register(unhandled, register);
    self.take_free_registers_for_intervals(unhandled);
    self.active.push(unhandled);
    debug!(
      "{:?} ({:?}) <- r{}",
      unhandled,
      self.intervals.get(unhandled).value,
      register
    );
  }

  fn get_largest_candidate(
    &self, unhandled: IntervalIx, register_constraint: u32,
    free_positions: &RegisterPositions, needs_register_pair: bool,
    ty: RegisterType,
  ) -> Option<u32> {
    let mut candidate = None;
    let mut largest: Option<u32> = None;
    let first_use = self.intervals.get(unhandled).first_use_position();
    let has_uses = self.intervals.get(unhandled).has_uses();

    for i in 0..=register_constraint {
      if free_positions.is_blocked_with_pair(i, needs_register_pair)
        || !free_positions.has_type(i, ty)
      {
        continue;
      }
      let mut use_position = free_positions.get(i);
      if needs_register_pair {
        if self.number_of_argument_registers > 0
          && i == self.number_of_argument_registers - 1
        {
          // The last argument register does not survive the argument swap
          // as the low half of a pair.
          continue;
        }
        if self.has_dedicated_move_exception_register()
          && self.is_dedicated_move_exception_register_in_last_local_register()
          && i == self.get_move_exception_register()
        {
          continue;
        }
        if i >= register_constraint {
          break;
        }
        use_position = use_position.min(free_positions.get(i + 1));
      }
      if has_uses && use_position == first_use {
        // This register is read at the very instruction we allocate for.
        continue;
      }
      if largest.map_or(true, |l| use_position > l) {
        candidate = Some(i);
        largest = Some(use_position);
        if use_position == u32::max_value() {
          break;
        }
      }
    }
    candidate
  }

  /// Largest candidate with the target workarounds applied; registers they
  /// reject are blacklisted for this call only.
  fn get_largest_valid_candidate(
    &self, unhandled: IntervalIx, register_constraint: u32,
    needs_register_pair: bool, positions: &mut RegisterPositions,
    ty: RegisterType,
  ) -> Option<u32> {
    positions.clear_temporary_blocks();
    let mut candidate = self.get_largest_candidate(
      unhandled,
      register_constraint,
      positions,
      needs_register_pair,
      ty,
    )?;

    if self.needs_long_result_overlapping_long_operands_workaround(unhandled) {
      candidate = self.handle_workaround(
        |allocator, ix, register| {
          allocator.is_long_result_overlapping_long_operands(ix, register)
        },
        candidate,
        unhandled,
        register_constraint,
        needs_register_pair,
        positions,
        ty,
      )?;
    }
    if self.needs_single_result_overlapping_long_operands_workaround(unhandled)
    {
      candidate = self.handle_workaround(
        |allocator, ix, register| {
          allocator.is_single_result_overlapping_long_operands(ix, register)
        },
        candidate,
        unhandled,
        register_constraint,
        needs_register_pair,
        positions,
        ty,
      )?;
    }
    if self.needs_array_get_wide_workaround(unhandled) {
      candidate = self.handle_workaround(
        |allocator, ix, register| {
          allocator.is_array_get_array_register(ix, register)
        },
        candidate,
        unhandled,
        register_constraint,
        needs_register_pair,
        positions,
        ty,
      )?;
    }
    Some(candidate)
  }

  fn handle_workaround(
    &self, workaround_needed_for_candidate: impl Fn(&Self, IntervalIx, u32) -> bool,
    mut candidate: u32, unhandled: IntervalIx, register_constraint: u32,
    needs_register_pair: bool, positions: &mut RegisterPositions,
    ty: RegisterType,
  ) -> Option<u32> {
    let mut last_candidate = candidate;
    while workaround_needed_for_candidate(self, unhandled, candidate) {
      // Blacklist the unusable register and retry.
      positions.set_blocked_temporarily(candidate);
      match self.get_largest_candidate(
        unhandled,
        register_constraint,
        positions,
        needs_register_pair,
        ty,
      ) {
        None => return None,
        Some(next) => {
          if next == last_candidate {
            debug_assert!(false, "workaround retried a blocked register");
            return None;
          }
          last_candidate = next;
          candidate = next;
        }
      }
    }
    Some(candidate)
  }

  //===========================================================================
  // Blocked-register allocation

  /// Every candidate is occupied but the interval has a constrained use
  /// that cannot wait: displace the occupant with the furthest next use,
  /// preferring rematerializable constants and avoiding monitor objects.
  fn allocate_blocked_register(
    &mut self, unhandled: IntervalIx, register_constraint: u32,
  ) -> Result<(), RegAllocError> {
    let mut use_positions =
      RegisterPositions::new(register_constraint as usize + 1);
    let mut blocked_positions =
      RegisterPositions::new(register_constraint as usize + 1);
    let unhandled_start = self.intervals.get(unhandled).start();

    for &active_ix in &self.active {
      let entry = self.intervals.get(active_ix);
      let active_register = entry.register();
      if active_register <= register_constraint {
        let first_use = entry.first_use_after(unhandled_start);
        for i in 0..entry.required_registers() {
          if active_register + i <= register_constraint {
            use_positions.set(
              active_register + i,
              first_use,
              self.register_type_of(active_ix),
            );
          }
        }
      }
    }

    for &inactive_ix in &self.inactive {
      let entry = self.intervals.get(inactive_ix);
      let inactive_register = entry.register();
      if inactive_register <= register_constraint
        && self.intervals.overlaps(inactive_ix, unhandled)
      {
        let first_use = entry.first_use_after(unhandled_start);
        for i in 0..entry.required_registers() {
          if inactive_register + i <= register_constraint
            && first_use < use_positions.get(inactive_register + i)
          {
            use_positions.set(
              inactive_register + i,
              first_use,
              self.register_type_of(inactive_ix),
            );
          }
        }
      }
    }

    // Argument registers are never reused here.
    for i in 0..self.number_of_argument_registers.min(register_constraint + 1)
    {
      use_positions.set_blocked(i);
    }

    if self.has_dedicated_move_exception_register() {
      let move_exception_register = self.get_move_exception_register();
      if move_exception_register <= register_constraint {
        if (self.intervals.get(unhandled).register_limit() == U4BIT_MAX
          && self.is_dedicated_move_exception_register_in_last_local_register())
          || self.overlaps_move_exception_interval(unhandled)
        {
          use_positions.set_blocked(move_exception_register);
        }
      }
    }

    // Invoke-range pinned intervals must not be displaced past their use.
    self.block_invoke_range_intervals(
      unhandled,
      register_constraint,
      &use_positions,
      &mut blocked_positions,
    );

    let needs_register_pair = self.intervals.get(unhandled).is_wide;

    // Prefer a candidate that can be rematerialized.
    let const_candidate = self.get_largest_valid_candidate(
      unhandled,
      register_constraint,
      needs_register_pair,
      &mut use_positions,
      RegisterType::ConstNumber,
    );
    let other_candidate = self.get_largest_valid_candidate(
      unhandled,
      register_constraint,
      needs_register_pair,
      &mut use_positions,
      RegisterType::Other,
    );
    let mut candidate = match (const_candidate, other_candidate) {
      (Some(const_candidate), Some(other_candidate)) => {
        let largest_const_use_position = self.get_largest_position(
          &use_positions,
          const_candidate,
          needs_register_pair,
        );
        if largest_const_use_position
          .saturating_sub(MIN_CONSTANT_FREE_FOR_POSITIONS)
          < unhandled_start
        {
          // The constant's live range is too short to be worth it.
          Some(other_candidate)
        } else {
          Some(const_candidate)
        }
      }
      (Some(const_candidate), None) => Some(const_candidate),
      (None, other_candidate) => other_candidate,
    };

    // Monitor objects are a last resort; displacing one can trip Art's lock
    // verification.
    if candidate.is_none() {
      candidate = self.get_largest_valid_candidate(
        unhandled,
        register_constraint,
        needs_register_pair,
        &mut use_positions,
        RegisterType::Monitor,
      );
    }
    let candidate = candidate
      .ok_or_else(|| self.internal_error("no candidate for blocked register"))?;

    let largest_use_position =
      self.get_largest_position(&use_positions, candidate, needs_register_pair);
    let blocked_position = self.get_largest_position(
      &blocked_positions,
      candidate,
      needs_register_pair,
    );

    if largest_use_position
      < self.intervals.get(unhandled).first_use_position()
    {
      // Everybody is used before this interval; spill it instead.
      let split_position = self.intervals.get(unhandled).first_use_position();
      let split = self
        .try_split_before(unhandled, split_position)
        .ok_or_else(|| self.internal_error("degenerate self-spill split"))?;
      // A fresh register measures better than reusing the candidate.
      let register_number = self.get_new_spill_register(unhandled);
      self
        .assign_free_register_to_unhandled_interval(unhandled, register_number);
      self.intervals.get_mut(unhandled).spilled = true;
      self.unhandled_insert(split);
    } else {
      let candidate_end =
        candidate + self.intervals.get(unhandled).required_registers() - 1;
      self.ensure_capacity(candidate_end);

      if blocked_position > self.intervals.get(unhandled).end() {
        // Spilling frees the register for the entire interval.
        self.assign_register_and_spill(
          unhandled,
          candidate,
          needs_register_pair,
        )?;
      } else {
        // Only the prefix fits; the tail competes again.
        let split = self
          .try_split_before(unhandled, blocked_position)
          .ok_or_else(|| self.internal_error("degenerate blocked split"))?;
        self.unhandled_insert(split);
        self.assign_register_and_spill(
          unhandled,
          candidate,
          needs_register_pair,
        )?;
      }
    }
    Ok(())
  }

  fn get_largest_position(
    &self, positions: &RegisterPositions, register: u32,
    needs_register_pair: bool,
  ) -> u32 {
    let position = positions.get(register);
    if needs_register_pair {
      position.min(positions.get(register + 1))
    } else {
      position
    }
  }

  // TODO: index invoke-range intervals by instruction number so this does
  // not have to scan all of active and inactive.
  fn block_invoke_range_intervals(
    &self, unhandled: IntervalIx, register_constraint: u32,
    use_positions: &RegisterPositions, blocked_positions: &mut RegisterPositions,
  ) {
    for &ix in self.active.iter().chain(self.inactive.iter()) {
      let entry = self.intervals.get(ix);
      if !entry.is_invoke_range {
        continue;
      }
      let register_start = entry.register();
      if register_start <= register_constraint
        && self.intervals.overlaps(ix, unhandled)
      {
        let first_use =
          entry.first_use_after(self.intervals.get(unhandled).start());
        for register in entry.registers() {
          if register <= register_constraint
            && first_use < blocked_positions.get(register)
          {
            blocked_positions.set(register, first_use, RegisterType::Other);
            debug_assert!(
              use_positions.is_blocked(register)
                || use_positions.get(register)
                  <= blocked_positions.get(register)
            );
          }
        }
      }
    }
  }

  //===========================================================================
  // Split-and-spill

  /// Splits at the gap preceding `position` unless the split would be
  /// degenerate (empty prefix).
  fn try_split_before(
    &mut self, ix: IntervalIx, position: u32,
  ) -> Option<IntervalIx> {
    let split_position = to_gap_position(position);
    let entry = self.intervals.get(ix);
    if split_position <= entry.start() || split_position >= entry.end() {
      return None;
    }
    Some(self.intervals.split_before(ix, position))
  }

  fn assign_register_and_spill(
    &mut self, unhandled: IntervalIx, candidate: u32,
    candidate_is_wide: bool,
  ) -> Result<(), RegAllocError> {
    self.spill_overlapping_active_intervals(
      unhandled,
      candidate,
      candidate_is_wide,
    )?;
    self.assign_register(unhandled, candidate);
    self.take_free_registers_for_intervals(unhandled);
    self.active.push(unhandled);
    // Overlapping inactive intervals must pick up a fresh register when
    // they reactivate.
    self.split_overlapping_inactive_intervals(
      unhandled,
      candidate,
      candidate_is_wide,
    );
    Ok(())
  }

  fn split_overlapping_inactive_intervals(
    &mut self, unhandled: IntervalIx, candidate: u32, candidate_is_wide: bool,
  ) {
    let mut new_inactive: Vec<IntervalIx> = Vec::new();
    let inactive = std::mem::replace(&mut self.inactive, Vec::new());
    for ix in inactive {
      let overlapping = self
        .intervals
        .get(ix)
        .uses_register(candidate, candidate_is_wide)
        && self.intervals.overlaps(ix, unhandled);
      if !overlapping {
        self.inactive.push(ix);
        continue;
      }
      let unhandled_start = self.intervals.get(unhandled).start();
      if self.intervals.get(ix).is_invoke_range
        && !self.intervals.is_argument_interval(ix)
      {
        // A pinned interval needs the same register again at its next use.
        let next_use_position =
          self.intervals.get(ix).first_use_after(unhandled_start);
        if next_use_position != u32::max_value() {
          let register = self.intervals.get(ix).register();
          if let Some(split) = self.try_split_before(ix, next_use_position) {
            self.intervals.get_mut(split).set_register(register);
            new_inactive.push(split);
          }
        }
      }
      if self.intervals.get(ix).start() > unhandled_start {
        // Not started yet: back to unhandled for reassignment.
        self.intervals.get_mut(ix).clear_register_assignment();
        self.unhandled_insert(ix);
      } else {
        // In a hole: keep the prefix, the tail competes again.
        let position = if to_gap_position(unhandled_start)
          > self.intervals.get(ix).start()
        {
          unhandled_start
        } else {
          self
            .intervals
            .get(unhandled)
            .next_overlap(self.intervals.get(ix))
            .unwrap_or(unhandled_start)
        };
        if let Some(split) = self.try_split_before(ix, position) {
          self.unhandled_insert(split);
        }
        self.inactive.push(ix);
      }
    }
    self.inactive.extend(new_inactive);
  }

  fn spill_overlapping_active_intervals(
    &mut self, unhandled: IntervalIx, candidate: u32, candidate_is_wide: bool,
  ) -> Result<(), RegAllocError> {
    debug_assert!(!self.intervals.get(unhandled).has_register());
    let mut excluded_registers: SmallVec<[u32; 4]> = SmallVec::new();
    excluded_registers.push(candidate);
    if candidate_is_wide {
      excluded_registers.push(candidate + 1);
    }
    if self.intervals.is_argument_interval(unhandled)
      && !self.intervals.is_split_parent(unhandled)
    {
      // This interval becomes active in its argument register and the
      // candidate simultaneously.
      let parent = self.intervals.split_parent(unhandled);
      for register in self.intervals.get(parent).registers() {
        excluded_registers.push(register);
      }
    }

    let mut new_active: Vec<IntervalIx> = Vec::new();
    let active = std::mem::replace(&mut self.active, Vec::new());
    for ix in active {
      if !self.intervals.get(ix).uses_register(candidate, candidate_is_wide) {
        self.active.push(ix);
        continue;
      }
      debug_assert!(self.registers_for_intervals_are_taken(ix));
      // The spill register must be chosen before freeing, or we might
      // spill onto the registers being vacated.
      let register_number = self.get_spill_register(ix, &excluded_registers);
      self.free_occupied_registers_for_intervals(ix);
      let unhandled_start = self.intervals.get(unhandled).start();
      let split_child = self
        .try_split_before(ix, unhandled_start)
        .ok_or_else(|| self.internal_error("degenerate active spill split"))?;
      self.assign_register(split_child, register_number);
      self.intervals.get_mut(split_child).spilled = true;
      self.take_free_registers_for_intervals(split_child);
      debug_assert!(self.intervals.get(split_child).has_register());
      debug_assert!(self.intervals.get(ix).has_register());
      new_active.push(split_child);
      // A constant split before its first real use can be dropped entirely
      // if it rematerializes.
      if self.intervals.get(ix).is_const_number {
        let definition_number = self
          .function
          .value_definition(self.intervals.get(ix).value)
          .map(|d| self.numbering.number(d));
        if Some(self.intervals.get(ix).start()) == definition_number
          && self.intervals.get(ix).uses.len() == 1
        {
          self.intervals.get_mut(ix).spilled = true;
        }
      }
      if self.intervals.get(split_child).has_uses() {
        if self.intervals.get(ix).is_invoke_range
          && !self.intervals.is_argument_interval(ix)
        {
          // Spilling a pinned register: move back at the next use.
          let first_use =
            self.intervals.get(split_child).first_use_position();
          let pinned_register = self.intervals.get(ix).register();
          if let Some(split_of_split) =
            self.try_split_before(split_child, first_use)
          {
            self.intervals.get_mut(split_of_split).set_register(pinned_register);
            self.inactive.push(split_of_split);
          }
        } else if self.intervals.get(ix).is_const_number {
          self.split_ranges_for_spilled_constant(split_child, register_number);
        } else if self.intervals.is_argument_interval(ix) {
          self.split_ranges_for_spilled_argument(split_child);
        } else {
          self.split_ranges_for_spilled_interval(split_child, register_number);
        }
      }
    }
    self.active.extend(new_active);
    debug_assert!(self.registers_are_free(candidate, candidate_is_wide));
    Ok(())
  }

  fn split_ranges_for_spilled_argument(&mut self, spilled: IntervalIx) {
    debug_assert!(self.intervals.get(spilled).spilled);
    debug_assert!(self.intervals.is_argument_interval(spilled));
    // Arguments spill to their incoming register; split before the next use
    // to get a usable register there.
    if self.intervals.get(spilled).has_uses() {
      let position = self.intervals.get(spilled).first_use_position();
      if let Some(split) = self.try_split_before(spilled, position) {
        self.unhandled_insert(split);
      }
    }
  }

  fn split_ranges_for_spilled_interval(
    &mut self, spilled: IntervalIx, register_number: u32,
  ) {
    // A non-pinned, non-rematerializable value stays in the spill register
    // as long as its uses allow, to avoid further moves.
    debug_assert!(self.intervals.get(spilled).spilled);
    debug_assert!(!self.intervals.get(spilled).is_const_number);
    let mut register_number = register_number;
    let is_spilling_to_argument_register =
      self.intervals.is_argument_interval(spilled)
        || register_number < self.number_of_argument_registers;
    if is_spilling_to_argument_register {
      register_number =
        if self.mode.is_8bit() { U8BIT_MAX } else { U16BIT_MAX };
    }
    let highest_register_number =
      register_number + self.intervals.get(spilled).required_registers() - 1;
    let mut first_use_with_lower_limit = None;
    let mut has_uses_before_first_use_with_lower_limit = false;
    for use_ in self.intervals.get(spilled).uses.clone() {
      if highest_register_number > use_.limit {
        first_use_with_lower_limit = Some(use_);
        break;
      } else {
        has_uses_before_first_use_with_lower_limit = true;
      }
    }
    if has_uses_before_first_use_with_lower_limit {
      self.intervals.get_mut(spilled).spilled = false;
    }
    if let Some(use_) = first_use_with_lower_limit {
      if let Some(split) = self.try_split_before(spilled, use_.position) {
        self.unhandled_insert(split);
      }
    }
  }

  /// A spilled constant rematerializes instead of staying live in its spill
  /// register: split aggressively at every inter-use gap longer than the
  /// rematerialization threshold.
  fn split_ranges_for_spilled_constant(
    &mut self, spilled: IntervalIx, spill_register: u32,
  ) {
    debug_assert!(self.intervals.get(spilled).spilled);
    debug_assert!(self.intervals.get(spilled).is_const_number);
    let max_gap_size = 11 * INSTRUCTION_NUMBER_DELTA;
    if !self.intervals.get(spilled).has_uses() {
      return;
    }
    let first_use = self.intervals.get(spilled).first_use_position();
    let mut split = match self.try_split_before(spilled, first_use) {
      Some(split) => split,
      None => return,
    };
    self.unhandled_insert(split);
    let mut changed = true;
    while changed {
      changed = false;
      let mut previous_use = self.intervals.get(split).start();
      for use_ in self.intervals.get(split).uses.clone() {
        if use_.position - previous_use > max_gap_size {
          // Split after the previous use; the gap parks in the spill
          // register and the next use rematerializes.
          self.unhandled_remove(split);
          let next = match self
            .try_split_before(split, previous_use + INSTRUCTION_NUMBER_DELTA)
          {
            Some(next) => next,
            None => {
              self.unhandled_insert(split);
              return;
            }
          };
          self.unhandled_insert(split);
          split = next;
          if to_gap_position(use_.position)
            > self.intervals.get(split).start()
          {
            self.assign_register(split, spill_register);
            self.intervals.get_mut(split).spilled = true;
            self.inactive.push(split);
            split = match self.try_split_before(split, use_.position) {
              Some(next) => next,
              None => return,
            };
          }
          self.unhandled_insert(split);
          changed = true;
          break;
        }
        previous_use = use_.position;
      }
    }
  }

  //===========================================================================
  // Move insertion and control-flow resolution

  fn compute_rematerializable_bits(&mut self) {
    for i in 0..self.live_intervals.len() {
      let ix = self.live_intervals[i];
      let rematerializable = self.intervals.get(ix).is_const_number;
      self.intervals.get_mut(ix).rematerializable = rematerializable;
    }
  }

  fn insert_moves(&mut self) -> Result<(), RegAllocError> {
    self.compute_rematerializable_bits();

    let mut block_entry_numbers: HashSet<u32> = HashSet::default();
    let mut move_exception_numbers: HashSet<u32> = HashSet::default();
    for &block in self.function.blocks() {
      let entry_number = self.numbering.entry(block);
      block_entry_numbers.insert(entry_number);
      let entry_inst = self.function.block_instructions(block)[0];
      if self.function.inst_is_move_exception(entry_inst) {
        move_exception_numbers.insert(entry_number);
      }
    }
    let mut spill_moves =
      SpillMoveSet::new(block_entry_numbers, move_exception_numbers);

    // A copy at every split boundary.
    for i in 0..self.live_intervals.len() {
      let parent = self.live_intervals[i];
      if !self.intervals.has_splits(parent) {
        continue;
      }
      let mut current = parent;
      let children = self.intervals.get(parent).split_children.clone();
      for split in children {
        let position = self.intervals.get(split).start();
        if !self.can_skip_argument_move(split) {
          spill_moves.add_spill_or_restore_move(
            to_gap_position(position),
            split,
            current,
          );
        }
        current = split;
      }
    }

    self.resolve_control_flow(&mut spill_moves);

    self.first_parallel_move_temporary = Some(self.register_count);
    let (moves, temps) =
      spill_moves.schedule_and_insert_moves(&self.intervals, self.register_count);
    self.register_count += temps;
    self.raw_moves = moves;
    Ok(())
  }

  /// Inserts moves on CFG edges where a value's covering split differs
  /// between the predecessor's exit and the successor's entry, plus the phi
  /// moves on each incoming edge.
  fn resolve_control_flow(&mut self, spill_moves: &mut SpillMoveSet) {
    for &block in self.function.blocks() {
      let instructions = self.function.block_instructions(block);
      let exit_inst = instructions[instructions.len() - 1];
      for &successor in self.function.block_successors(block) {
        let mut from_instruction = self.numbering.exit(block);
        let is_catch =
          self.function.block_catch_successors(block).contains(&successor);
        if is_catch {
          // On an exception edge the transfer happens at the throwing
          // instruction, not the block exit.
          for &inst in instructions {
            if self.function.inst_can_throw(inst) {
              from_instruction = self.numbering.number(inst);
              break;
            }
          }
        }
        let to_instruction = self.numbering.entry(successor);

        for &value in self.live_at_entry[successor.0 as usize].live_values.iter()
        {
          let parent = match self.value_intervals[value.0 as usize] {
            Some(parent) => parent,
            None => continue,
          };
          let from_intervals =
            self.intervals.split_covering(parent, from_instruction);
          let to_intervals =
            self.intervals.split_covering(parent, to_instruction);
          if self.can_skip_argument_move(to_intervals) {
            continue;
          }
          if from_intervals != to_intervals {
            debug_assert!(from_instruction > 0 && to_instruction > 0);
            if self.function.inst_is_goto(exit_inst) && !is_catch {
              spill_moves.add_out_resolution_move(
                from_instruction - 1,
                to_intervals,
                from_intervals,
              );
            } else {
              spill_moves.add_in_resolution_move(
                to_instruction - 1,
                to_intervals,
                from_intervals,
              );
            }
          }
        }

        let pred_index = self
          .function
          .block_predecessors(successor)
          .iter()
          .position(|&pred| pred == block)
          .unwrap_or(0);
        for &phi in self.function.block_phis(successor) {
          let phi_parent = match self.value_intervals[phi.0 as usize] {
            Some(parent) => parent,
            None => continue,
          };
          let to_intervals =
            self.intervals.split_covering(phi_parent, to_instruction);
          let operand = self.function.phi_operands(phi)[pred_index];
          let operand_parent = match self.value_intervals[operand.0 as usize] {
            Some(parent) => parent,
            None => continue,
          };
          let from_intervals =
            self.intervals.split_covering(operand_parent, from_instruction);
          if from_intervals != to_intervals
            && !self.intervals.is_argument_interval(to_intervals)
          {
            debug_assert!(self.function.block_successors(block).len() == 1);
            spill_moves.add_phi_move(
              from_instruction - 1,
              to_intervals,
              from_intervals,
            );
          }
        }
      }
    }
  }

  /// After allocation, check whether every split of every argument can use
  /// the incoming register after all; if so, drop the splits' assignments
  /// so move insertion produces no argument moves.
  // TODO: this unsplits an argument's intervals entirely or not at all;
  // partially unsplitting could save some of the remaining moves.
  fn unsplit_arguments(&mut self) -> bool {
    if self.mode.is_4bit() {
      return false;
    }
    let mut argument_register_unsplit = false;
    for i in 0..self.function.arguments().len() {
      let argument = self.function.arguments()[i];
      let parent = match self.value_intervals[argument.0 as usize] {
        Some(parent) => parent,
        None => continue,
      };
      let mut can_use_argument_register = true;
      let mut could_use_argument_register = true;
      let children = self.intervals.get(parent).split_children.clone();
      for &child in &children {
        if self.intervals.get(child).is_invoke_range {
          can_use_argument_register = false;
          break;
        }
        let register_constraint = self.intervals.get(child).register_limit();
        if register_constraint < U16BIT_MAX {
          could_use_argument_register = false;
          if register_constraint < self.highest_used_register() {
            can_use_argument_register = false;
            break;
          }
        }
      }
      // Only redo move insertion when a constrained use turned out to be
      // satisfiable by the argument register itself.
      if can_use_argument_register && !could_use_argument_register {
        argument_register_unsplit = true;
        let register = self.intervals.get(parent).register();
        for child in children {
          let entry = self.intervals.get_mut(child);
          entry.clear_register_assignment();
          entry.set_register(register);
          entry.spilled = false;
        }
      }
    }
    argument_register_unsplit
  }

  //===========================================================================
  // Register set bookkeeping

  fn ensure_capacity(&mut self, new_max_register: u32) {
    if new_max_register >= self.register_count {
      self.increase_capacity(new_max_register, false);
    }
  }

  fn increase_capacity(&mut self, new_max_register: u32, take_registers: bool) {
    for register in self.register_count..=new_max_register {
      if !take_registers {
        self.free_registers.insert(register);
      }
    }
    self.register_count = self.register_count.max(new_max_register + 1);
  }

  /// Ascending scan of the free set for a run of `number_of_registers`
  /// consecutive registers that does not straddle the argument boundary,
  /// growing capacity if needed.
  fn get_free_consecutive_registers(
    &mut self, number_of_registers: u32, prioritize_small_registers: bool,
  ) -> u32 {
    let old_register_count = self.register_count;
    let ordered: Vec<u32> = if prioritize_small_registers {
      let mut ordered: Vec<u32> = self
        .free_registers
        .iter()
        .copied()
        .filter(|&r| !self.is_argument_register(r))
        .collect();
      ordered.extend(
        self.free_registers.iter().copied().filter(|&r| {
          self.is_argument_register(r)
        }),
      );
      ordered
    } else {
      self.free_registers.iter().copied().collect()
    };

    fn next_free(
      ordered: &[u32], cursor: &mut usize, register_count: &mut u32,
    ) -> u32 {
      if *cursor < ordered.len() {
        let register = ordered[*cursor];
        *cursor += 1;
        register
      } else {
        let register = *register_count;
        *register_count += 1;
        register
      }
    }

    let mut cursor = 0;
    let mut first = next_free(&ordered, &mut cursor, &mut self.register_count);
    let mut current = first;
    while current - first + 1 != number_of_registers {
      for _ in 0..number_of_registers - 1 {
        let next = next_free(&ordered, &mut cursor, &mut self.register_count);
        // A run crossing into the argument registers would break apart
        // when the argument swap renumbers them.
        if next != current + 1 || next == self.number_of_argument_registers {
          first = next;
          current = first;
          break;
        }
        current += 1;
      }
    }
    for register in old_register_count..self.register_count {
      let was_added = self.free_registers.insert(register);
      debug_assert!(was_added);
    }
    debug_assert!(
      (first < self.number_of_argument_registers
        && first + number_of_registers <= self.number_of_argument_registers)
        || first >= self.number_of_argument_registers
    );
    first
  }

  fn registers_are_free_and_consecutive(
    &self, register: u32, register_is_wide: bool,
  ) -> bool {
    if !self.free_registers.contains(&register) {
      return false;
    }
    if register_is_wide {
      if !self.free_registers.contains(&(register + 1)) {
        return false;
      }
      if self.number_of_argument_registers > 0
        && register == self.number_of_argument_registers - 1
      {
        // Not consecutive after the argument/temporary reorder.
        return false;
      }
    }
    true
  }

  fn exclude_registers_for_interval(&mut self, ix: IntervalIx) {
    debug_assert!(self.intervals.get(ix).has_register());
    for register in self.intervals.get(ix).registers() {
      self.free_registers.remove(&register);
    }
    if self.is_pinned_argument_register(ix) && !self.intervals.is_split_parent(ix)
    {
      let parent = self.intervals.split_parent(ix);
      debug_assert!(self.intervals.get(parent).has_register());
      if self.intervals.get(parent).register()
        != self.intervals.get(ix).register()
      {
        for register in self.intervals.get(parent).registers() {
          self.free_registers.remove(&register);
        }
      }
    }
  }

  fn free_occupied_registers_for_intervals(&mut self, ix: IntervalIx) {
    debug_assert!(self.registers_for_intervals_are_taken(ix));
    let entry = self.intervals.get(ix);
    let register = entry.register();
    debug_assert!(register + entry.required_registers() <= self.register_count);
    let is_wide = entry.is_wide;
    self.free_registers.insert(register);
    if is_wide {
      self.free_registers.insert(register + 1);
    }
    if self.is_pinned_argument_register(ix)
      && !self.intervals.is_split_parent(ix)
    {
      let parent = self.intervals.split_parent(ix);
      if self.intervals.get(parent).register() != register {
        self.free_occupied_registers_for_intervals(parent);
      }
    }
  }

  fn take_free_registers_for_intervals(&mut self, ix: IntervalIx) {
    let entry = self.intervals.get(ix);
    let register = entry.register();
    let is_wide = entry.is_wide;
    debug_assert!(self.registers_are_free(register, is_wide));
    self.free_registers.remove(&register);
    if is_wide {
      self.free_registers.remove(&(register + 1));
    }
    if self.is_pinned_argument_register(ix)
      && !self.intervals.is_split_parent(ix)
    {
      let parent = self.intervals.split_parent(ix);
      if self.intervals.get(parent).register() != register {
        self.take_free_registers_for_intervals(parent);
      }
    }
  }

  fn register_is_free(&self, register: u32) -> bool {
    self.free_registers.contains(&register)
      || self.is_dedicated_move_exception_register(register)
  }

  fn register_range_is_free(&self, register: u32, required_registers: u32) -> bool {
    for i in 0..required_registers {
      debug_assert!(!self.is_dedicated_move_exception_register(register + i));
      if !self.free_registers.contains(&(register + i)) {
        return false;
      }
    }
    true
  }

  fn registers_are_free(&self, register: u32, is_wide: bool) -> bool {
    self.register_is_free(register)
      && (!is_wide || self.register_is_free(register + 1))
  }

  fn registers_for_intervals_are_taken(&self, ix: IntervalIx) -> bool {
    let entry = self.intervals.get(ix);
    debug_assert!(entry.has_register());
    let register = entry.register();
    !self.free_registers.contains(&register)
      && (!entry.is_wide || !self.free_registers.contains(&(register + 1)))
  }

  //===========================================================================
  // Pinning predicates and move-exception placement

  pub(crate) fn is_pinned_argument(&self, value: ValueId) -> bool {
    self.function.value_is_argument(value)
      && self.value_intervals[value.0 as usize]
        .map_or(false, |ix| self.is_pinned_argument_register(ix))
  }

  pub(crate) fn is_pinned_argument_register(&self, ix: IntervalIx) -> bool {
    if !self.intervals.is_argument_interval(ix) {
      return false;
    }
    let parent = self.intervals.split_parent(ix);
    debug_assert!(self.intervals.get(parent).has_register());
    if self.mode.is_4bit() {
      // Argument registers are reusable in this mode, except a receiver
      // that must stay put.
      if self.options.debug
        || self.options.can_have_this_type_verifier_bug
        || self.options.can_have_this_jit_code_debugging_bug
      {
        let value = self.intervals.get(parent).value;
        return !self.function.method_is_static()
          && self.function.arguments().first() == Some(&value);
      }
      return false;
    }
    true
  }

  fn is_argument_register(&self, register: u32) -> bool {
    register < self.number_of_argument_registers
  }

  pub(crate) fn can_skip_argument_move(&self, ix: IntervalIx) -> bool {
    if !self.is_pinned_argument_register(ix) {
      return false;
    }
    debug_assert!(self.intervals.get(ix).has_register());
    let register = self.intervals.get(ix).register();
    if register >= self.number_of_argument_registers {
      return false;
    }
    // An argument register could still be a copy in another argument's
    // register.
    let parent = self.intervals.split_parent(ix);
    register == self.intervals.get(parent).register()
  }

  fn has_dedicated_move_exception_register(&self) -> bool {
    !self.move_exception_intervals.is_empty()
  }

  /// The dedicated register sits right after the arguments in allocation
  /// numbering.
  fn get_move_exception_register(&self) -> u32 {
    debug_assert!(self.has_dedicated_move_exception_register());
    self.number_of_argument_registers
  }

  fn is_dedicated_move_exception_register(&self, register: u32) -> bool {
    self.has_dedicated_move_exception_register()
      && register == self.get_move_exception_register()
  }

  fn is_dedicated_move_exception_register_in_first_local_register(
    &self,
  ) -> bool {
    debug_assert!(self.has_dedicated_move_exception_register());
    if self.mode.is_4bit() || self.mode.is_16bit() {
      return true;
    }
    if self.mode.is_8bit_refinement() {
      debug_assert!(self.number_of_4bit_argument_registers > 0);
      return true;
    }
    !self
      .options
      .testing
      .enable_use_last_local_register_as_move_exception_register
  }

  fn is_dedicated_move_exception_register_in_last_local_register(&self) -> bool {
    !self.is_dedicated_move_exception_register_in_first_local_register()
  }

  fn get_move_exception_offset_for_local_registers(&self) -> u32 {
    (self.has_dedicated_move_exception_register()
      && self.is_dedicated_move_exception_register_in_last_local_register())
      as u32
  }

  //===========================================================================
  // 8-bit refinement

  fn retry_8bit_allocation_with_4bit_argument_registers(&mut self) -> bool {
    debug_assert!(self.mode.is_8bit());
    debug_assert!(self.number_of_4bit_argument_registers == 0);
    if !self.options.testing.enable_register_allocation_8bit_refinement
      || self.function.arguments().is_empty()
    {
      return false;
    }
    self.number_of_4bit_argument_registers =
      self.compute_number_of_4bit_argument_registers();
    self.number_of_4bit_argument_registers > 0
  }

  /// The argument registers land at the top after the swap; count how many
  /// of them still fit in 4 bits there.
  fn compute_number_of_4bit_argument_registers(&self) -> u32 {
    let mut number_of_4bit_argument_registers = 0;
    let mut current_argument_register_start =
      self.registers_used() - self.number_of_argument_registers;
    for &argument in self.function.arguments() {
      let required_registers = self.function.value_required_registers(argument);
      let next_argument_register_start =
        current_argument_register_start + required_registers;
      let current_argument_register_end = next_argument_register_start - 1;
      if current_argument_register_end <= U4BIT_MAX {
        current_argument_register_start = next_argument_register_start;
        number_of_4bit_argument_registers += required_registers;
      } else {
        if current_argument_register_start <= U4BIT_MAX {
          number_of_4bit_argument_registers += 1;
        }
        break;
      }
    }
    number_of_4bit_argument_registers
  }

  //===========================================================================
  // Unused-register compaction and final numbering

  fn compute_unused_registers(&mut self) {
    if self.mode.is_4bit() || self.register_count == 0 {
      return;
    }
    let used_registers = self.compute_used_registers();
    self.unused_registers =
      Some(self.compute_unused_registers_from_used_registers(&used_registers));
  }

  fn compute_used_registers(&self) -> HashSet<u32> {
    let mut used_registers: HashSet<u32> = HashSet::default();
    for &parent in &self.live_intervals {
      self.add_registers_if_used(&mut used_registers, parent);
      for &child in &self.intervals.get(parent).split_children {
        self.add_registers_if_used(&mut used_registers, child);
      }
    }
    // The parallel-move temporaries are used as well.
    if let Some(first_temp) = self.first_parallel_move_temporary {
      for register in first_temp..self.register_count {
        used_registers.insert(register);
      }
    }
    used_registers
  }

  fn add_registers_if_used(&self, used: &mut HashSet<u32>, ix: IntervalIx) {
    if self.intervals.is_spilled_and_rematerializable(ix) {
      return;
    }
    for register in self.intervals.get(ix).registers() {
      used.insert(register);
    }
  }

  fn compute_unused_registers_from_used_registers(
    &self, used_registers: &HashSet<u32>,
  ) -> Vec<u32> {
    let first_local_register = self.number_of_argument_registers
      + self.get_move_exception_offset_for_local_registers();
    let number_of_parallel_move_temporary_registers = self.register_count
      - self.first_parallel_move_temporary.unwrap_or(self.register_count);
    let number_of_local_registers = self
      .register_count
      .saturating_sub(first_local_register)
      .saturating_sub(number_of_parallel_move_temporary_registers);
    let mut unused = 0;
    let mut unused_registers = Vec::with_capacity(number_of_local_registers as usize);
    for i in 0..number_of_local_registers {
      if !used_registers.contains(&(first_local_register + i)) {
        unused += 1;
      }
      unused_registers.push(unused);
    }
    unused_registers
  }

  /// Swap arguments to the top and the last-local move-exception register
  /// into place.
  fn unadjusted_real_register_from_allocated(&self, allocated: u32) -> u32 {
    debug_assert!(allocated < self.register_count);
    if allocated < self.number_of_argument_registers {
      (self.register_count - 1)
        - (self.number_of_argument_registers - allocated - 1)
    } else if self.has_dedicated_move_exception_register()
      && self.is_dedicated_move_exception_register_in_last_local_register()
      && allocated == self.get_move_exception_register()
    {
      (self.register_count - 1) - self.number_of_argument_registers
    } else {
      allocated
        - self.number_of_argument_registers
        - self.get_move_exception_offset_for_local_registers()
    }
  }

  /// Slide register numbers down over unused local slots.
  pub(crate) fn real_register_number_from_allocated(&self, allocated: u32) -> u32 {
    let register = self.unadjusted_real_register_from_allocated(allocated);
    if let Some(unused_registers) = &self.unused_registers {
      if (register as usize) < unused_registers.len() {
        register - unused_registers[register as usize]
      } else {
        register - unused_registers.last().copied().unwrap_or(0)
      }
    } else {
      register
    }
  }

  fn finalize_moves(&mut self) {
    self.scheduled_moves = self
      .raw_moves
      .iter()
      .map(|raw| ScheduledMove {
        position: raw.position,
        dest: self.real_register_number_from_allocated(raw.dest),
        src: match raw.src {
          MoveSource::Register(register) => {
            MoveSource::Register(self.real_register_number_from_allocated(register))
          }
          MoveSource::Constant(value) => MoveSource::Constant(value),
        },
        is_wide: raw.is_wide,
      })
      .collect();
  }

  //===========================================================================
  // Public queries

  /// The number of registers in the final numbering, unused-slot
  /// compaction included.
  pub fn registers_used(&self) -> u32 {
    match &self.unused_registers {
      Some(unused_registers) => {
        self.register_count - unused_registers.last().copied().unwrap_or(0)
      }
      None => self.register_count,
    }
  }

  pub fn highest_used_register(&self) -> u32 {
    self.registers_used().saturating_sub(1)
  }

  /// The final physical register of `value` at `instruction_number`.
  pub fn get_register_for_value(
    &self, value: ValueId, instruction_number: u32,
  ) -> Result<u32, RegAllocError> {
    let ix = self
      .value_intervals
      .get(value.0 as usize)
      .copied()
      .flatten()
      .ok_or_else(|| RegAllocError::ValueWithoutIntervals {
        value,
        method: self.function.method_name().to_string(),
      })?;
    let ix = if self.intervals.has_splits(ix) {
      self.intervals.split_covering(ix, instruction_number)
    } else {
      ix
    };
    match self.intervals.get(ix).register {
      Some(register) => Ok(self.real_register_number_from_allocated(register)),
      None => Err(self.internal_error("queried value has no register")),
    }
  }

  pub fn get_argument_or_allocate_register_for_value(
    &self, value: ValueId, instruction_number: u32,
  ) -> Result<u32, RegAllocError> {
    if self.is_pinned_argument(value) {
      return self.get_argument_register_for_value(value);
    }
    self.get_register_for_value(value, instruction_number)
  }

  /// The incoming register of an argument value, fixed for the whole
  /// method.
  pub fn get_argument_register_for_value(
    &self, value: ValueId,
  ) -> Result<u32, RegAllocError> {
    debug_assert!(self.function.value_is_argument(value));
    let ix = self
      .value_intervals
      .get(value.0 as usize)
      .copied()
      .flatten()
      .ok_or_else(|| RegAllocError::ValueWithoutIntervals {
        value,
        method: self.function.method_name().to_string(),
      })?;
    let parent = self.intervals.split_parent(ix);
    match self.intervals.get(parent).register {
      Some(register) => Ok(self.real_register_number_from_allocated(register)),
      None => Err(self.internal_error("argument has no register")),
    }
  }

  /// The scheduled spill, phi and resolution moves, in ascending gap
  /// position, with final register numbers.
  pub fn spill_moves(&self) -> &[ScheduledMove] {
    debug_assert!(self.allocated);
    &self.scheduled_moves
  }

  /// The first register used as a parallel-move temporary, if any move
  /// scheduling needed one.
  pub fn first_parallel_move_temporary(&self) -> Option<u32> {
    let first_temp = self.first_parallel_move_temporary?;
    if first_temp < self.register_count {
      Some(self.real_register_number_from_allocated(first_temp))
    } else {
      None
    }
  }

  /// The reconstructed local-variable scope changes (debug mode only).
  pub fn debug_locals_changes(&self) -> &[DebugLocalsChangeAt] {
    &self.debug_locals
  }

  /// The register-to-local map at entry to a block (debug mode only).
  pub fn locals_at_entry(
    &self, block: BlockId,
  ) -> Option<&BTreeMap<u32, LocalId>> {
    self.locals_at_entry.get(block.0 as usize)?.as_ref()
  }

  /// Equality of the entry-locals maps of two blocks, for block merging.
  pub fn has_equal_types_at_entry(&self, first: BlockId, second: BlockId) -> bool {
    self.locals_at_entry(first) == self.locals_at_entry(second)
  }

  //===========================================================================
  // Invariant audit

  /// Audits the interval-set state machine; run at loop-top in debug
  /// builds.
  fn invariants_hold(&self) -> bool {
    let mut computed_free_registers: BTreeSet<u32> =
      (0..self.register_count).collect();
    for &active_ix in &self.active {
      debug_assert!(self.registers_for_intervals_are_taken(active_ix));
      for register in self.intervals.get(active_ix).registers() {
        debug_assert!(computed_free_registers.contains(&register));
        computed_free_registers.remove(&register);
      }
    }
    // Pinned argument splits also hold their incoming register.
    for &active_ix in &self.active {
      if self.is_pinned_argument_register(active_ix) {
        let parent = self.intervals.split_parent(active_ix);
        if self.intervals.get(parent).register()
          != self.intervals.get(active_ix).register()
        {
          for register in self.intervals.get(parent).registers() {
            debug_assert!(computed_free_registers.contains(&register));
            computed_free_registers.remove(&register);
          }
        }
      }
    }
    let mut free_registers = self.free_registers.clone();
    if self.has_dedicated_move_exception_register() {
      // The move-exception register is not guaranteed to be occupied
      // if-and-only-if one of its intervals is active; relax the check.
      let register = self.get_move_exception_register();
      free_registers.remove(&register);
      computed_free_registers.remove(&register);
    }
    debug_assert!(self.expired_here.is_empty());
    debug_assert!(free_registers == computed_free_registers);
    true
  }
}
