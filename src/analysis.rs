/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Liveness analysis: instruction numbering, live-at-entry sets and the
//! construction of live intervals with their register-limit uses.

use log::trace;

use crate::data_structures::{
  IntervalIx, Intervals, LiveIntervalsUse, LiveRange, OrderedSet,
  INSTRUCTION_NUMBER_DELTA, U16BIT_MAX,
};
use crate::interface::{BlockId, Function, InstDesc, InstId, Options, ValueId};

//=============================================================================
// Instruction numbering

/// Even instruction numbers at stride 2 in block emission order.  The odd
/// number preceding an instruction is the gap where moves are inserted.
pub(crate) struct Numbering {
  inst_number: Vec<u32>,
  block_entry: Vec<u32>,
  block_exit: Vec<u32>,
  next_instruction_number: u32,
}

impl Numbering {
  pub(crate) fn number(&self, inst: InstId) -> u32 {
    self.inst_number[inst.0 as usize]
  }

  pub(crate) fn entry(&self, block: BlockId) -> u32 {
    self.block_entry[block.0 as usize]
  }

  pub(crate) fn exit(&self, block: BlockId) -> u32 {
    self.block_exit[block.0 as usize]
  }

  pub(crate) fn next_instruction_number(&self) -> u32 {
    self.next_instruction_number
  }
}

pub(crate) fn number_instructions<F: Function>(function: &F) -> Numbering {
  let mut inst_number = vec![0; function.num_instructions() as usize];
  let mut block_entry = vec![0; function.num_blocks() as usize];
  let mut block_exit = vec![0; function.num_blocks() as usize];
  let mut next = 0;
  for &block in function.blocks() {
    let instructions = function.block_instructions(block);
    debug_assert!(!instructions.is_empty());
    block_entry[block.0 as usize] = next;
    for &inst in instructions {
      inst_number[inst.0 as usize] = next;
      next += INSTRUCTION_NUMBER_DELTA;
    }
    block_exit[block.0 as usize] = next - INSTRUCTION_NUMBER_DELTA;
  }
  Numbering {
    inst_number,
    block_entry,
    block_exit,
    next_instruction_number: next,
  }
}

//=============================================================================
// Live-at-entry sets

/// The values live at entry to a block, in a deterministic insertion order,
/// together with the subset that carries local-variable info.
pub(crate) struct LiveAtEntrySets {
  pub(crate) live_values: OrderedSet<ValueId>,
  pub(crate) live_local_values: Vec<ValueId>,
}

fn same_members(
  left: &OrderedSet<ValueId>, right: &OrderedSet<ValueId>,
) -> bool {
  left.len() == right.len() && left.iter().all(|&value| right.contains(value))
}

/// Backward data-flow fixpoint over the CFG.  Phi outputs are live at entry
/// to their block; phi operands are live out of the corresponding
/// predecessor only.
pub(crate) fn compute_live_at_entry_sets<F: Function>(
  function: &F, options: &Options,
) -> Vec<LiveAtEntrySets> {
  let num_blocks = function.num_blocks() as usize;
  let mut live_sets: Vec<OrderedSet<ValueId>> =
    (0..num_blocks).map(|_| OrderedSet::new()).collect();

  let mut order: Vec<BlockId> = function.topologically_sorted_blocks().to_vec();
  order.reverse();

  loop {
    let mut changed = false;
    for &block in &order {
      let mut live = OrderedSet::new();
      for &successor in function.block_successors(block) {
        for &value in live_sets[successor.0 as usize].iter() {
          if function.value_is_phi(value)
            && function.phi_block(value) == successor
          {
            continue;
          }
          live.insert(value);
        }
        let pred_index = function
          .block_predecessors(successor)
          .iter()
          .position(|&pred| pred == block)
          .unwrap_or(0);
        for &phi in function.block_phis(successor) {
          let operand = function.phi_operands(phi)[pred_index];
          if function.value_needs_register(operand) {
            live.insert(operand);
          }
        }
      }
      for &inst in function.block_instructions(block).iter().rev() {
        if let Some(out) = function.inst_out_value(inst) {
          live.remove(out);
        }
        for &value in function.inst_in_values(inst) {
          if function.value_needs_register(value) {
            live.insert(value);
          }
        }
        if options.debug {
          for &value in function.inst_debug_values(inst) {
            live.insert(value);
          }
        }
      }
      if !same_members(&live, &live_sets[block.0 as usize]) {
        live_sets[block.0 as usize] = live;
        changed = true;
      }
    }
    if !changed {
      break;
    }
  }

  live_sets
    .into_iter()
    .map(|live_values| {
      let live_local_values = live_values
        .iter()
        .copied()
        .filter(|&value| function.value_local_info(value).is_some())
        .collect();
      LiveAtEntrySets { live_values, live_local_values }
    })
    .collect()
}

//=============================================================================
// Invoke-range classification

pub(crate) fn arguments_are_already_linked<F: Function>(
  function: &F, arguments: &[ValueId],
) -> bool {
  let formals = function.arguments();
  let mut previous: Option<usize> = None;
  for &argument in arguments {
    let index = match formals.iter().position(|&formal| formal == argument) {
      Some(index) => index,
      None => return false,
    };
    if let Some(previous) = previous {
      if index != previous + 1 {
        return false;
      }
    }
    previous = Some(index);
  }
  true
}

/// An invoke needs a consecutive register block when its arguments exceed
/// the register capacity of the non-range encodings, unless they are already
/// the method's consecutive incoming arguments.
pub(crate) fn is_invoke_range<F: Function>(function: &F, inst: InstId) -> bool {
  match function.inst_desc(inst) {
    InstDesc::Invoke { arguments } => {
      function.required_argument_registers(arguments) > 5
        && !arguments_are_already_linked(function, arguments)
    }
    _ => false,
  }
}

//=============================================================================
// Live range construction

struct LivenessBuilder<'a, F: Function> {
  function: &'a F,
  numbering: &'a Numbering,
  intervals: &'a mut Intervals,
  value_intervals: &'a mut Vec<Option<IntervalIx>>,
  live_intervals: &'a mut Vec<IntervalIx>,
}

impl<'a, F: Function> LivenessBuilder<'a, F> {
  fn interval_for(&mut self, value: ValueId) -> IntervalIx {
    if let Some(ix) = self.value_intervals[value.0 as usize] {
      return ix;
    }
    let function = self.function;
    let ix = self.intervals.push(
      value,
      function.value_is_wide(value),
      function.value_is_argument(value),
      function.value_is_const_number(value),
      function.value_used_as_monitor(value),
    );
    self.value_intervals[value.0 as usize] = Some(ix);
    self.live_intervals.push(ix);
    ix
  }

  fn add_live_range(&mut self, value: ValueId, block: BlockId, end: u32) {
    let first_in_block = self.numbering.entry(block);
    let instructions_size = self.function.block_instructions(block).len()
      as u32
      * INSTRUCTION_NUMBER_DELTA;
    let last_in_block =
      first_in_block + instructions_size - INSTRUCTION_NUMBER_DELTA;
    let is_phi = self.function.value_is_phi(value);
    let instruction_number = if is_phi {
      first_in_block
    } else {
      let definition = self.function.value_definition(value);
      debug_assert!(definition.is_some());
      definition.map_or(first_in_block, |d| self.numbering.number(d))
    };
    let ix = self.interval_for(value);
    if first_in_block <= instruction_number
      && instruction_number <= last_in_block
    {
      // Defined in this block.  Phis interfere with the moves inserted on
      // the incoming edges, so their range opens at the preceding gap.
      let start = if is_phi {
        instruction_number - 1
      } else {
        instruction_number
      };
      self.intervals.get_mut(ix).add_range(LiveRange::new(start, end));
      if !is_phi {
        let constraint = self
          .function
          .value_definition(value)
          .map_or(U16BIT_MAX, |d| self.function.max_out_value_register(d));
        self
          .intervals
          .get_mut(ix)
          .add_use(LiveIntervalsUse::new(instruction_number, constraint));
      }
    } else {
      debug_assert!(first_in_block > 0);
      self
        .intervals
        .get_mut(ix)
        .add_range(LiveRange::new(first_in_block - 1, end));
    }
  }
}

fn live_range_end_on_exceptional_flow<F: Function>(
  function: &F, numbering: &Numbering, inst: InstId, value: ValueId,
) -> u32 {
  let mut end = numbering.number(inst);
  // A `dst <- check-cast src` lowers to `move dst, src; check-cast dst`, so
  // an unrelated value live on the exceptional edge must survive one
  // position further or the move could clobber it.
  if let InstDesc::CheckCast { object } = function.inst_desc(inst) {
    if value != object {
      end += INSTRUCTION_NUMBER_DELTA;
    }
  }
  end
}

/// Computes live ranges and uses from the live-at-entry sets, scanning each
/// block backward from its exit.
pub(crate) fn compute_live_ranges<F: Function>(
  function: &F, options: &Options, numbering: &Numbering,
  live_at_entry_sets: &[LiveAtEntrySets], intervals: &mut Intervals,
  value_intervals: &mut Vec<Option<IntervalIx>>,
  live_intervals: &mut Vec<IntervalIx>,
) {
  let mut builder = LivenessBuilder {
    function,
    numbering,
    intervals,
    value_intervals,
    live_intervals,
  };
  for &block in function.topologically_sorted_blocks() {
    let mut live: OrderedSet<ValueId> = OrderedSet::new();
    let mut phi_operands: OrderedSet<ValueId> = OrderedSet::new();
    let mut live_at_throwing_instruction: OrderedSet<ValueId> =
      OrderedSet::new();
    let catch_successors = function.block_catch_successors(block);
    for &successor in function.block_successors(block) {
      // Values live at entry to an exceptional successor are live only
      // until the last throwing instruction of this block, unless normal
      // flow keeps them live as well.
      let is_exceptional = catch_successors.contains(&successor);
      if is_exceptional {
        live_at_throwing_instruction
          .extend_from(&live_at_entry_sets[successor.0 as usize].live_values);
        debug_assert!(function.block_phis(successor).is_empty());
      } else {
        live.extend_from(&live_at_entry_sets[successor.0 as usize].live_values);
      }
      let pred_index = function
        .block_predecessors(successor)
        .iter()
        .position(|&pred| pred == block)
        .unwrap_or(0);
      for &phi in function.block_phis(successor) {
        live.remove(phi);
        let operand = function.phi_operands(phi)[pred_index];
        if function.value_needs_register(operand) {
          phi_operands.insert(operand);
        }
      }
    }
    live.extend_from(&phi_operands);

    let instructions = function.block_instructions(block);
    let block_end = numbering.entry(block)
      + instructions.len() as u32 * INSTRUCTION_NUMBER_DELTA;
    let live_values: Vec<ValueId> = live.iter().copied().collect();
    for value in live_values {
      // Phi operand ranges stop at the gap before the successor entry so
      // they do not overlap the phi itself.
      let mut end = block_end;
      if phi_operands.contains(value) {
        end -= 1;
      }
      builder.add_live_range(value, block, end);
    }

    for &inst in instructions.iter().rev() {
      let number = numbering.number(inst);
      if let Some(definition) = function.inst_out_value(inst) {
        // Instructions with an unused result still occupy a register over
        // the instruction itself; they may have side effects.
        if !function.value_is_used(definition)
          && function.value_needs_register(definition)
        {
          builder.add_live_range(
            definition,
            block,
            number + INSTRUCTION_NUMBER_DELTA - 1,
          );
        }
        live.remove(definition);
      }
      for &value in function.inst_in_values(inst) {
        if !function.value_needs_register(value) {
          continue;
        }
        if !live.contains(value) {
          live.insert(value);
          builder.add_live_range(value, block, number);
        }
        let constraint = function.max_in_value_register(inst);
        // Arguments are kept in their incoming registers; unconstrained
        // argument uses are not recorded so the argument is not forced into
        // a scratch register at every call.  Ranged invokes do record the
        // use, since the operand block must be materialized.
        let is_unconstrained_argument_use = function.value_is_argument(value)
          && constraint == U16BIT_MAX
          && !is_invoke_range(function, inst);
        if !is_unconstrained_argument_use {
          let ix = builder.interval_for(value);
          builder
            .intervals
            .get_mut(ix)
            .add_use(LiveIntervalsUse::new(number, constraint));
        }
      }
      if function.inst_can_throw(inst) {
        let newly_live: Vec<ValueId> = live_at_throwing_instruction
          .iter()
          .copied()
          .filter(|&value| {
            function.value_needs_register(value) && !live.contains(value)
          })
          .collect();
        for value in newly_live {
          live.insert(value);
          let end = live_range_end_on_exceptional_flow(
            function, numbering, inst, value,
          );
          builder.add_live_range(value, block, end);
        }
      }
      if options.debug {
        // Keep local variables alive over their whole scope.
        let mut sorted_debug_values: Vec<ValueId> =
          function.inst_debug_values(inst).to_vec();
        sorted_debug_values.sort();
        for value in sorted_debug_values {
          debug_assert!(function.value_needs_register(value));
          if !live.contains(value) {
            live.insert(value);
            builder.add_live_range(value, block, number);
          }
        }
      }
    }
    trace!(
      "block {:?}: live ranges computed, {} values live at entry",
      block,
      live_at_entry_sets[block.0 as usize].live_values.len()
    );
  }
}
