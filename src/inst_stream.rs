/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Collection and scheduling of spill, restore, phi and resolution moves.
//!
//! Moves are gathered per gap position while the allocator walks split
//! boundaries and CFG edges, then scheduled into an ordered stream.  Moves
//! sharing a gap form parallel-move groups; register cycles are broken with
//! temporary registers allocated past the current maximum.

use log::{debug, trace};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use smallvec::SmallVec;

use crate::data_structures::{IntervalIx, Intervals};
use crate::interface::{MoveSource, ScheduledMove};

/// A move between two splits of the same value.  Registers are resolved at
/// schedule time so that late register clearing (argument unsplitting) is
/// reflected.
#[derive(Clone, Copy)]
pub(crate) struct SpillMove {
  pub(crate) to: IntervalIx,
  pub(crate) from: IntervalIx,
}

pub(crate) struct SpillMoveSet {
  /// Moves into the position's instruction: split boundaries and
  /// in-resolution moves of incoming edges.
  in_moves: HashMap<u32, Vec<SpillMove>>,
  /// Out-resolution moves belonging to the outgoing edge.
  out_moves: HashMap<u32, Vec<SpillMove>>,
  /// Phi moves, also belonging to the outgoing edge.
  phi_moves: HashMap<u32, Vec<SpillMove>>,
  /// Numbers of instructions that start a block.
  block_entry_numbers: HashSet<u32>,
  /// Numbers of move-exception instructions.
  move_exception_numbers: HashSet<u32>,
}

impl SpillMoveSet {
  pub(crate) fn new(
    block_entry_numbers: HashSet<u32>, move_exception_numbers: HashSet<u32>,
  ) -> Self {
    Self {
      in_moves: HashMap::default(),
      out_moves: HashMap::default(),
      phi_moves: HashMap::default(),
      block_entry_numbers,
      move_exception_numbers,
    }
  }

  /// Adds a move at a split boundary inside a block.  Splits that fall on a
  /// block boundary are already covered by the resolution moves of the
  /// incoming edges.
  pub(crate) fn add_spill_or_restore_move(
    &mut self, position: u32, to: IntervalIx, from: IntervalIx,
  ) {
    debug_assert!(position % 2 == 1);
    if self.block_entry_numbers.contains(&(position + 1)) {
      return;
    }
    self.in_moves.entry(position).or_default().push(SpillMove { to, from });
  }

  pub(crate) fn add_in_resolution_move(
    &mut self, position: u32, to: IntervalIx, from: IntervalIx,
  ) {
    debug_assert!(position % 2 == 1);
    self.in_moves.entry(position).or_default().push(SpillMove { to, from });
  }

  pub(crate) fn add_out_resolution_move(
    &mut self, position: u32, to: IntervalIx, from: IntervalIx,
  ) {
    debug_assert!(position % 2 == 1);
    self.out_moves.entry(position).or_default().push(SpillMove { to, from });
  }

  pub(crate) fn add_phi_move(
    &mut self, position: u32, to: IntervalIx, from: IntervalIx,
  ) {
    debug_assert!(position % 2 == 1);
    self.phi_moves.entry(position).or_default().push(SpillMove { to, from });
  }

  /// Schedules all collected moves.  Returns the scheduled stream in
  /// ascending position order (registers still in allocation numbering) and
  /// the number of temporary registers used, allocated from `first_temp`.
  pub(crate) fn schedule_and_insert_moves(
    &self, intervals: &Intervals, first_temp: u32,
  ) -> (Vec<ScheduledMove>, u32) {
    let mut positions: Vec<u32> = self
      .in_moves
      .keys()
      .chain(self.out_moves.keys())
      .chain(self.phi_moves.keys())
      .copied()
      .collect();
    positions.sort_unstable();
    positions.dedup();

    let mut out = Vec::new();
    let mut max_temps = 0;
    for position in positions {
      // A catch handler must start with its move-exception instruction, so
      // moves logically at the handler entry are anchored at the gap that
      // follows it.
      let emit_position =
        if self.move_exception_numbers.contains(&(position + 1)) {
          position + 2
        } else {
          position
        };

      // Incoming values arrive before the outgoing edge reads them.
      let incoming = self.resolve(intervals, self.in_moves.get(&position));
      let mut outgoing =
        self.resolve(intervals, self.out_moves.get(&position));
      outgoing.extend(self.resolve(intervals, self.phi_moves.get(&position)));
      outgoing.retain(|m| !incoming.contains(m));

      let mut scheduler = RegisterMoveScheduler::new(first_temp);
      scheduler.schedule_group(emit_position, incoming, &mut out);
      scheduler.schedule_group(emit_position, outgoing, &mut out);
      max_temps = max_temps.max(scheduler.temps_used());
    }
    debug!("scheduled {} moves, {} temps", out.len(), max_temps);
    (out, max_temps)
  }

  fn resolve(
    &self, intervals: &Intervals, moves: Option<&Vec<SpillMove>>,
  ) -> Vec<RegisterMove> {
    let mut resolved: Vec<RegisterMove> = Vec::new();
    for spill_move in moves.map(|v| v.as_slice()).unwrap_or(&[]) {
      // A spilled rematerializable constant never materializes its spill
      // register; restores from it reload the constant instead.
      if intervals.is_spilled_and_rematerializable(spill_move.to) {
        continue;
      }
      let to = intervals.get(spill_move.to);
      let from = intervals.get(spill_move.from);
      let src = if intervals.is_spilled_and_rematerializable(spill_move.from) {
        MoveSource::Constant(from.value)
      } else {
        MoveSource::Register(from.register())
      };
      if let MoveSource::Register(register) = src {
        if register == to.register() {
          continue;
        }
      }
      let register_move =
        RegisterMove { dest: to.register(), is_wide: to.is_wide, src };
      if !resolved.contains(&register_move) {
        resolved.push(register_move);
      }
    }
    resolved
  }
}

//=============================================================================
// Parallel move scheduling

#[derive(Clone, Copy, PartialEq, Eq)]
struct RegisterMove {
  dest: u32,
  is_wide: bool,
  src: MoveSource,
}

impl RegisterMove {
  fn dest_registers(&self) -> SmallVec<[u32; 2]> {
    registers_of(self.dest, self.is_wide)
  }

  fn src_registers(&self) -> SmallVec<[u32; 2]> {
    match self.src {
      MoveSource::Register(register) => registers_of(register, self.is_wide),
      MoveSource::Constant(_) => SmallVec::new(),
    }
  }

  fn reads_any(&self, registers: &[u32]) -> bool {
    self.src_registers().iter().any(|r| registers.contains(r))
  }
}

fn registers_of(register: u32, is_wide: bool) -> SmallVec<[u32; 2]> {
  let mut registers = SmallVec::new();
  registers.push(register);
  if is_wide {
    registers.push(register + 1);
  }
  registers
}

struct RegisterMoveScheduler {
  first_temp: u32,
  next_temp: u32,
}

impl RegisterMoveScheduler {
  fn new(first_temp: u32) -> Self {
    Self { first_temp, next_temp: first_temp }
  }

  fn temps_used(&self) -> u32 {
    self.next_temp - self.first_temp
  }

  /// Emits one parallel-move group.  A move may execute once no pending
  /// move still reads its destination; cycles are broken by parking the
  /// sources that read a contested destination in temporaries.
  fn schedule_group(
    &mut self, position: u32, moves: Vec<RegisterMove>,
    out: &mut Vec<ScheduledMove>,
  ) {
    let mut pending = moves;
    while !pending.is_empty() {
      let mut emitted = false;
      for index in 0..pending.len() {
        let dest_registers = pending[index].dest_registers();
        let blocked = pending
          .iter()
          .enumerate()
          .any(|(j, other)| j != index && other.reads_any(&dest_registers));
        if !blocked {
          let register_move = pending.remove(index);
          emit(position, &register_move, out);
          emitted = true;
          break;
        }
      }
      if emitted {
        continue;
      }
      // Every pending move's destination is still read by another move.
      // Park the sources overlapping the first contested destination in
      // fresh temporaries; sources at one program point are either equal or
      // disjoint per value, so a full-width save is always sound.
      let contested = pending[0].dest_registers();
      trace!("breaking move cycle at position {}", position);
      let mut parked: Vec<(MoveSource, bool, u32)> = Vec::new();
      for register_move in pending.iter_mut() {
        if !register_move.reads_any(&contested) {
          continue;
        }
        let src_register = match register_move.src {
          MoveSource::Register(register) => register,
          MoveSource::Constant(_) => continue,
        };
        let existing = parked.iter().find(|(src, wide, _)| {
          *src == register_move.src && *wide == register_move.is_wide
        });
        let temp = match existing {
          Some(&(_, _, temp)) => temp,
          None => {
            let temp = self.next_temp;
            self.next_temp += if register_move.is_wide { 2 } else { 1 };
            emit(
              position,
              &RegisterMove {
                dest: temp,
                is_wide: register_move.is_wide,
                src: MoveSource::Register(src_register),
              },
              out,
            );
            parked.push((register_move.src, register_move.is_wide, temp));
            temp
          }
        };
        register_move.src = MoveSource::Register(temp);
      }
      debug_assert!(!parked.is_empty());
    }
  }
}

fn emit(
  position: u32, register_move: &RegisterMove, out: &mut Vec<ScheduledMove>,
) {
  out.push(ScheduledMove {
    position,
    dest: register_move.dest,
    src: register_move.src,
    is_wide: register_move.is_wide,
  });
}

//=============================================================================
// Tests

#[cfg(test)]
mod tests {
  use super::*;
  use crate::interface::ValueId;

  fn run(moves: Vec<RegisterMove>, first_temp: u32) -> (Vec<ScheduledMove>, u32) {
    let mut scheduler = RegisterMoveScheduler::new(first_temp);
    let mut out = Vec::new();
    scheduler.schedule_group(1, moves, &mut out);
    (out, scheduler.temps_used())
  }

  fn reg_move(dest: u32, src: u32) -> RegisterMove {
    RegisterMove { dest, is_wide: false, src: MoveSource::Register(src) }
  }

  #[test]
  fn schedules_chain_without_temps() {
    // r2 <- r1, r1 <- r0: r2 must be written first.
    let (out, temps) = run(vec![reg_move(1, 0), reg_move(2, 1)], 10);
    assert_eq!(temps, 0);
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].dest, 2);
    assert_eq!(out[1].dest, 1);
  }

  #[test]
  fn breaks_swap_cycle_with_temp() {
    // r0 <-> r1 needs a temporary.
    let (out, temps) = run(vec![reg_move(0, 1), reg_move(1, 0)], 10);
    assert_eq!(temps, 1);
    assert_eq!(out.len(), 3);
    assert_eq!(out[0].dest, 10);
    assert_eq!(out[0].src, MoveSource::Register(0));
    // Both final moves read consistent sources.
    assert!(out
      .iter()
      .any(|m| m.dest == 1 && m.src == MoveSource::Register(10)));
    assert!(out
      .iter()
      .any(|m| m.dest == 0 && m.src == MoveSource::Register(1)));
  }

  #[test]
  fn breaks_three_cycle() {
    let (out, temps) =
      run(vec![reg_move(1, 0), reg_move(2, 1), reg_move(0, 2)], 20);
    assert_eq!(temps, 1);
    assert_eq!(out.len(), 4);
    // Every register ends up with its predecessor's value: simulate.
    let mut regs = vec![100, 101, 102, 0, 0];
    let mut file = std::collections::HashMap::new();
    for (i, &v) in regs.iter().enumerate() {
      file.insert(i as u32, v);
    }
    for m in &out {
      if let MoveSource::Register(src) = m.src {
        let v = file[&src];
        file.insert(m.dest, v);
      }
    }
    regs = vec![file[&0], file[&1], file[&2]];
    assert_eq!(regs, vec![102, 100, 101]);
  }

  #[test]
  fn wide_pair_dependencies_are_tracked() {
    // Wide (0,1) -> (2,3) while r2 -> r0 forms a cycle through the pair.
    let wide = RegisterMove {
      dest: 2,
      is_wide: true,
      src: MoveSource::Register(0),
    };
    let (out, temps) = run(vec![wide, reg_move(0, 2)], 30);
    assert!(temps >= 1);
    // Simulate and check values.
    let mut file = std::collections::HashMap::new();
    for r in 0..40u32 {
      file.insert(r, 100 + r as i32);
    }
    for m in &out {
      if let MoveSource::Register(src) = m.src {
        let lo = file[&src];
        file.insert(m.dest, lo);
        if m.is_wide {
          let hi = file[&(src + 1)];
          file.insert(m.dest + 1, hi);
        }
      }
    }
    assert_eq!(file[&2], 100);
    assert_eq!(file[&3], 101);
    assert_eq!(file[&0], 102);
  }

  #[test]
  fn constants_do_not_block() {
    let const_move = RegisterMove {
      dest: 0,
      is_wide: false,
      src: MoveSource::Constant(ValueId(7)),
    };
    let (out, temps) = run(vec![const_move, reg_move(1, 0)], 10);
    assert_eq!(temps, 0);
    // The register read of r0 happens before the constant clobbers it.
    assert_eq!(out[0].dest, 1);
    assert_eq!(out[1].src, MoveSource::Constant(ValueId(7)));
  }
}
