/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Reconstruction of local-variable scope changes from the split live
//! intervals of values carrying debug info.
//!
//! Every live range of such a value becomes a (register, local, start, end)
//! tuple; walking the blocks in emission order with an open-range list then
//! yields a `DebugLocalsChange` before each instruction where the set of
//! live locals differs, plus the locals map at entry to each block.

use log::trace;
use rustc_hash::FxHashSet as HashSet;

use std::collections::BTreeMap;

use crate::data_structures::LiveRange;
use crate::interface::{
  BlockId, DebugLocalsChangeAt, Function, InstId, LocalId, RegAllocError,
  ValueId,
};
use crate::linear_scan::LinearScanRegisterAllocator;

#[derive(Clone, Copy)]
struct LocalRange {
  value: ValueId,
  local: LocalId,
  register: u32,
  start: u32,
  end: u32,
}

fn uses_value<F: Function>(function: &F, value: ValueId, inst: InstId) -> bool {
  function.inst_in_values(inst).contains(&value)
    || function.inst_debug_values(inst).contains(&value)
}

pub(crate) fn compute_debug_info<F: Function>(
  allocator: &LinearScanRegisterAllocator<F>,
) -> Result<
  (Vec<DebugLocalsChangeAt>, Vec<Option<BTreeMap<u32, LocalId>>>),
  RegAllocError,
> {
  let function = allocator.function;
  let numbering = &allocator.numbering;

  // Collect live ranges for all SSA values with local information.
  let mut ranges: Vec<LocalRange> = Vec::new();
  for &parent in &allocator.live_intervals {
    let value = allocator.intervals.get(parent).value;
    let local = match function.value_local_info(value) {
      Some(local) => local,
      None => continue,
    };
    let mut live_ranges: Vec<LiveRange> =
      allocator.intervals.get(parent).ranges.clone();
    for &child in &allocator.intervals.get(parent).split_children {
      live_ranges.extend_from_slice(&allocator.intervals.get(child).ranges);
    }
    live_ranges.sort_by_key(|range| range.start);
    for live_range in live_ranges {
      if live_range.start == live_range.end {
        continue;
      }
      let register = allocator
        .get_argument_or_allocate_register_for_value(value, live_range.start)?;
      ranges.push(LocalRange {
        value,
        local,
        register,
        start: live_range.start,
        end: live_range.end,
      });
    }
  }

  let num_blocks = function.num_blocks() as usize;
  let mut locals_at_entry: Vec<Option<BTreeMap<u32, LocalId>>> =
    vec![None; num_blocks];
  let mut changes: Vec<DebugLocalsChangeAt> = Vec::new();
  if ranges.is_empty() {
    return Ok((changes, locals_at_entry));
  }
  ranges.sort_by_key(|range| (range.start, range.end));

  let move_positions: HashSet<u32> =
    allocator.raw_moves.iter().map(|m| m.position).collect();

  let mut open_ranges: Vec<LocalRange> = Vec::new();
  let mut range_cursor = 1;
  let mut next_starting_range: Option<LocalRange> = Some(ranges[0]);
  let mut ending: BTreeMap<u32, LocalId> = BTreeMap::new();
  let mut starting: BTreeMap<u32, LocalId> = BTreeMap::new();

  let mut is_entry_block = true;
  for &block in function.blocks() {
    let instructions = function.block_instructions(block);
    let mut live_local_values: HashSet<ValueId> = allocator.live_at_entry
      [block.0 as usize]
      .live_local_values
      .iter()
      .copied()
      .collect();
    let mut first_index_in_block = 0;
    if is_entry_block {
      is_entry_block = false;
      debug_assert!(function.block_phis(block).is_empty());
      // Skip past arguments and open argument locals.
      while first_index_in_block < instructions.len()
        && function.inst_is_argument(instructions[first_index_in_block])
      {
        if let Some(out) =
          function.inst_out_value(instructions[first_index_in_block])
        {
          if function.value_local_info(out).is_some() {
            live_local_values.insert(out);
          }
        }
        first_index_in_block += 1;
      }
    } else {
      for &phi in function.block_phis(block) {
        if function.value_local_info(phi).is_some() {
          live_local_values.insert(phi);
        }
      }
    }
    // Locals close at the move-exception as part of the exceptional
    // transfer; skip past it to the first actual instruction.
    while first_index_in_block < instructions.len()
      && function.inst_is_move_exception(instructions[first_index_in_block])
    {
      first_index_in_block += 1;
    }
    debug_assert!(first_index_in_block < instructions.len());
    let first_instruction = instructions[first_index_in_block];
    let first_index = numbering.number(first_instruction);

    // Close ranges up-to but excluding the first instruction.
    open_ranges.retain(|open| {
      live_local_values.contains(&open.value)
        && local_live_at(function, first_instruction, first_index, open)
    });

    // Open ranges up-to but excluding the first instruction.
    while let Some(next_range) = next_starting_range {
      if next_range.start >= first_index {
        break;
      }
      if live_local_values.contains(&next_range.value)
        && local_live_at(function, first_instruction, first_index, &next_range)
      {
        open_ranges.push(next_range);
      }
      next_starting_range = if range_cursor < ranges.len() {
        let range = ranges[range_cursor];
        range_cursor += 1;
        Some(range)
      } else {
        None
      };
    }

    // Initialize current locals (registers after any entry spill moves).
    let mut current_locals: BTreeMap<u32, LocalId> = BTreeMap::new();
    for open in &open_ranges {
      if live_local_values.contains(&open.value) {
        current_locals.insert(open.register, open.local);
      }
    }

    set_locals_at_entry(
      allocator,
      block,
      first_index,
      &open_ranges,
      &current_locals,
      &move_positions,
      &mut locals_at_entry,
      &mut changes,
    )?;

    // Iterate the block instructions and emit locals-changed events.
    let mut index_in_block = first_index_in_block;
    while index_in_block < instructions.len() {
      let instruction = instructions[index_in_block];
      if index_in_block + 1 == instructions.len() {
        break;
      }

      // Explicit end markers close the local but keep the register; the
      // open range stays so the register is not reassigned.
      for &end_annotation in function.inst_debug_values(instruction) {
        if let Some(open) =
          open_ranges.iter().find(|open| open.value == end_annotation)
        {
          let register = open.register;
          let local = open.local;
          debug_assert!(current_locals.get(&register) == Some(&local));
          if current_locals.remove(&register).is_some() {
            ending.insert(register, local);
          }
        }
      }

      let next_instruction = instructions[index_in_block + 1];
      let index = numbering.number(next_instruction);

      open_ranges.retain(|open| {
        if !local_live_at(function, next_instruction, index, open) {
          // An explicit end may have closed the local already.
          if current_locals.remove(&open.register).is_some() {
            ending.insert(open.register, open.local);
          }
          false
        } else {
          true
        }
      });

      while let Some(next_range) = next_starting_range {
        if next_range.start >= index {
          break;
        }
        if local_live_at(function, next_instruction, index, &next_range) {
          debug_assert!(!current_locals.contains_key(&next_range.register));
          current_locals.insert(next_range.register, next_range.local);
          starting.insert(next_range.register, next_range.local);
          open_ranges.push(next_range);
        }
        next_starting_range = if range_cursor < ranges.len() {
          let range = ranges[range_cursor];
          range_cursor += 1;
          Some(range)
        } else {
          None
        };
      }

      if !ending.is_empty() || !starting.is_empty() {
        let finished_ending = std::mem::take(&mut ending);
        let finished_starting = std::mem::take(&mut starting);
        if let Some(change) =
          create_locals_change(finished_ending, finished_starting, index)
        {
          trace!("locals change at {}: {:?}", index, change);
          changes.push(change);
        }
      }
      index_in_block += 1;
    }
  }
  Ok((changes, locals_at_entry))
}

fn local_live_at<F: Function>(
  function: &F, inst: InstId, number: u32, range: &LocalRange,
) -> bool {
  debug_assert!(range.start < number);
  number < range.end
    || (number == range.end && uses_value(function, range.value, inst))
}

/// Sets the locals map at block entry.  When spill moves precede the first
/// instruction, entry locals are the predecessor's registers and a change
/// is emitted after the moves.
fn set_locals_at_entry<F: Function>(
  allocator: &LinearScanRegisterAllocator<F>, block: BlockId, first_index: u32,
  open_ranges: &[LocalRange], current_locals: &BTreeMap<u32, LocalId>,
  move_positions: &HashSet<u32>,
  locals_at_entry: &mut Vec<Option<BTreeMap<u32, LocalId>>>,
  changes: &mut Vec<DebugLocalsChangeAt>,
) -> Result<(), RegAllocError> {
  let function = allocator.function;
  let numbering = &allocator.numbering;
  let instructions = function.block_instructions(block);
  let entry_inst = instructions[0];
  let entry_number = numbering.entry(block);
  let entry_is_move_exception = function.inst_is_move_exception(entry_inst);
  let has_moves_before_first = (entry_number > 0
    && move_positions.contains(&(entry_number - 1)))
    || (entry_is_move_exception
      && move_positions.contains(&(entry_number + 1)));

  if function.block_predecessors(block).is_empty()
    || (!entry_is_move_exception
      && !has_moves_before_first
      && first_index == entry_number)
  {
    locals_at_entry[block.0 as usize] = Some(current_locals.clone());
    return Ok(());
  }

  // Entry locals are the registers of the predecessor, prior to the moves.
  let predecessor = function.block_predecessors(block)[0];
  let predecessor_exit_index = if entry_is_move_exception {
    let mut number = numbering.exit(predecessor);
    for &inst in function.block_instructions(predecessor) {
      if function.inst_can_throw(inst) {
        number = numbering.number(inst);
        break;
      }
    }
    number
  } else {
    numbering.exit(predecessor)
  };
  let mut initial_locals: BTreeMap<u32, LocalId> = BTreeMap::new();
  for open in open_ranges {
    let predecessor_value = if function.value_is_phi(open.value)
      && function.phi_block(open.value) == block
    {
      function.phi_operands(open.value)[0]
    } else {
      open.value
    };
    let predecessor_register = allocator
      .get_argument_or_allocate_register_for_value(
        predecessor_value,
        predecessor_exit_index,
      )?;
    initial_locals.insert(predecessor_register, open.local);
  }
  locals_at_entry[block.0 as usize] = Some(initial_locals.clone());

  // Emit the change in locals after the last entry move.
  let mut ending: BTreeMap<u32, LocalId> = BTreeMap::new();
  let mut starting: BTreeMap<u32, LocalId> = BTreeMap::new();
  for (&register, &local) in &initial_locals {
    if current_locals.get(&register) != Some(&local) {
      ending.insert(register, local);
    }
  }
  for (&register, &local) in current_locals {
    if initial_locals.get(&register) != Some(&local) {
      starting.insert(register, local);
    }
  }
  if let Some(change) = create_locals_change(ending, starting, first_index) {
    changes.push(change);
  }
  Ok(())
}

fn create_locals_change(
  mut ending: BTreeMap<u32, LocalId>, mut starting: BTreeMap<u32, LocalId>,
  position: u32,
) -> Option<DebugLocalsChangeAt> {
  if ending.is_empty() && starting.is_empty() {
    return None;
  }
  if !ending.is_empty() && !starting.is_empty() {
    // Suppress no-op pairs: the same local staying in the same register.
    let unneeded: Vec<u32> = ending
      .iter()
      .filter(|(register, local)| starting.get(register) == Some(local))
      .map(|(&register, _)| register)
      .collect();
    if unneeded.len() == ending.len() && unneeded.len() == starting.len() {
      return None;
    }
    for register in unneeded {
      ending.remove(&register);
      starting.remove(&register);
    }
  }
  Some(DebugLocalsChangeAt { position, ending, starting })
}
