/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Core data structures for the allocator: program positions, live ranges,
//! the live interval arena with its split trees, and register position
//! tables.

use smallvec::SmallVec;
use std::fmt;

use crate::interface::ValueId;

/// Instruction numbers are assigned at this stride; the odd number preceding
/// an instruction is the gap where spill and resolution moves live.
pub const INSTRUCTION_NUMBER_DELTA: u32 = 2;

/// Largest register encodable in a 4-bit register field.
pub const U4BIT_MAX: u32 = 0xf;
/// Largest register encodable in an 8-bit register field.
pub const U8BIT_MAX: u32 = 0xff;
/// Largest register encodable in a 16-bit register field.
pub const U16BIT_MAX: u32 = 0xffff;

/// Minimum distance between the current position and the next use of a
/// rematerializable value for it to be worth displacing.
pub(crate) const MIN_CONSTANT_FREE_FOR_POSITIONS: u32 = 5;

/// Above this many move-exception intervals we give up on precise overlap
/// queries and conservatively report an overlap.
pub(crate) const EXCEPTION_INTERVALS_OVERLAP_CUTOFF: usize = 500;

pub(crate) fn to_instruction_position(position: u32) -> u32 {
  if position % 2 == 0 {
    position
  } else {
    position + 1
  }
}

pub(crate) fn to_gap_position(position: u32) -> u32 {
  debug_assert!(position > 0);
  if position % 2 == 1 {
    position
  } else {
    position - 1
  }
}

//=============================================================================
// Live ranges and uses

/// A half-open `[start, end)` pair of program positions.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
  pub start: u32,
  pub end: u32,
}

impl LiveRange {
  pub fn new(start: u32, end: u32) -> Self {
    Self { start, end }
  }

  pub fn contains(&self, position: u32) -> bool {
    self.start <= position && position < self.end
  }
}

impl fmt::Debug for LiveRange {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "[{}, {})", self.start, self.end)
  }
}

/// A use position together with the largest register number the using
/// instruction can encode for this operand.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LiveIntervalsUse {
  pub position: u32,
  pub limit: u32,
}

impl LiveIntervalsUse {
  pub fn new(position: u32, limit: u32) -> Self {
    Self { position, limit }
  }

  pub fn has_constraint(&self) -> bool {
    self.limit < U16BIT_MAX
  }
}

impl fmt::Debug for LiveIntervalsUse {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "use@{}(limit {})", self.position, self.limit)
  }
}

//=============================================================================
// Register position tables

/// Classification of the value occupying a register, used when choosing a
/// candidate to displace.  Constants are cheapest (rematerializable) and
/// monitor-holding objects are a last resort.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RegisterType {
  ConstNumber,
  Monitor,
  Other,
  Any,
}

/// Per-register table of free-until (or next-use) positions, with blocked
/// markers.  Temporary blocks let the target workarounds blacklist a
/// candidate for the duration of a single selection.
pub(crate) struct RegisterPositions {
  positions: Vec<u32>,
  blocked: Vec<bool>,
  temporarily_blocked: Vec<bool>,
  types: Vec<RegisterType>,
}

impl RegisterPositions {
  pub(crate) fn new(size: usize) -> Self {
    Self {
      positions: vec![u32::max_value(); size],
      blocked: vec![false; size],
      temporarily_blocked: vec![false; size],
      types: vec![RegisterType::Other; size],
    }
  }

  pub(crate) fn get(&self, register: u32) -> u32 {
    self.positions[register as usize]
  }

  pub(crate) fn set(&mut self, register: u32, position: u32, ty: RegisterType) {
    debug_assert!(!self.blocked[register as usize]);
    self.positions[register as usize] = position;
    self.types[register as usize] = ty;
  }

  pub(crate) fn set_blocked(&mut self, register: u32) {
    self.blocked[register as usize] = true;
  }

  pub(crate) fn set_blocked_temporarily(&mut self, register: u32) {
    self.temporarily_blocked[register as usize] = true;
  }

  pub(crate) fn clear_temporary_blocks(&mut self) {
    for flag in &mut self.temporarily_blocked {
      *flag = false;
    }
  }

  pub(crate) fn is_blocked(&self, register: u32) -> bool {
    let ix = register as usize;
    if ix >= self.blocked.len() {
      return true;
    }
    self.blocked[ix] || self.temporarily_blocked[ix]
  }

  pub(crate) fn is_blocked_with_pair(
    &self, register: u32, needs_register_pair: bool,
  ) -> bool {
    if self.is_blocked(register) {
      return true;
    }
    needs_register_pair && self.is_blocked(register + 1)
  }

  pub(crate) fn has_type(&self, register: u32, ty: RegisterType) -> bool {
    if let RegisterType::Any = ty {
      return true;
    }
    self.types[register as usize] == ty
  }
}

//=============================================================================
// Insertion-ordered sets

/// A set that iterates in insertion order.  Used wherever iteration order can
/// leak into the allocation result, notably the live-at-entry sets.
#[derive(Clone)]
pub(crate) struct OrderedSet<T> {
  items: Vec<T>,
  set: rustc_hash::FxHashSet<T>,
}

impl<T: Copy + Eq + std::hash::Hash> OrderedSet<T> {
  pub(crate) fn new() -> Self {
    Self { items: Vec::new(), set: rustc_hash::FxHashSet::default() }
  }

  pub(crate) fn insert(&mut self, item: T) -> bool {
    if self.set.insert(item) {
      self.items.push(item);
      true
    } else {
      false
    }
  }

  pub(crate) fn remove(&mut self, item: T) -> bool {
    if self.set.remove(&item) {
      let position = self.items.iter().position(|other| *other == item);
      self.items.remove(position.unwrap());
      true
    } else {
      false
    }
  }

  pub(crate) fn contains(&self, item: T) -> bool {
    self.set.contains(&item)
  }

  pub(crate) fn iter(&self) -> std::slice::Iter<T> {
    self.items.iter()
  }

  pub(crate) fn extend_from(&mut self, other: &OrderedSet<T>) {
    for &item in other.iter() {
      self.insert(item);
    }
  }

  pub(crate) fn len(&self) -> usize {
    self.items.len()
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}

impl<T: Copy + Eq + std::hash::Hash> std::iter::FromIterator<T>
  for OrderedSet<T>
{
  fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
    let mut set = OrderedSet::new();
    for item in iter {
      set.insert(item);
    }
    set
  }
}

//=============================================================================
// Live intervals

/// A unique identifier of a live interval in the arena.  Split children and
/// parents cross-reference each other by index; the arena owns every
/// interval.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct IntervalIx(pub(crate) u32);

impl fmt::Debug for IntervalIx {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "int{}", self.0)
  }
}

/// The live intervals of one SSA value, or one split thereof.  Split
/// children share the parent's value but carry independent register
/// assignments.
pub(crate) struct LiveIntervals {
  pub(crate) value: ValueId,
  pub(crate) is_wide: bool,
  pub(crate) is_argument: bool,
  pub(crate) is_const_number: bool,
  pub(crate) used_as_monitor: bool,
  /// The root of the split tree; equal to the own index for parents.
  pub(crate) parent: IntervalIx,
  /// Ordered by start position.  Only the split parent has children.
  pub(crate) split_children: Vec<IntervalIx>,
  /// Disjoint, ascending.
  pub(crate) ranges: Vec<LiveRange>,
  /// Ascending by position.
  pub(crate) uses: Vec<LiveIntervalsUse>,
  pub(crate) register: Option<u32>,
  pub(crate) hint: Option<IntervalIx>,
  pub(crate) spilled: bool,
  pub(crate) is_invoke_range: bool,
  /// Only meaningful on the split parent.
  pub(crate) rematerializable: bool,
  pub(crate) next_consecutive: Option<IntervalIx>,
  pub(crate) previous_consecutive: Option<IntervalIx>,
}

impl LiveIntervals {
  pub(crate) fn start(&self) -> u32 {
    self.ranges.first().map(|range| range.start).unwrap_or(0)
  }

  pub(crate) fn end(&self) -> u32 {
    self.ranges.last().map(|range| range.end).unwrap_or(0)
  }

  pub(crate) fn required_registers(&self) -> u32 {
    if self.is_wide {
      2
    } else {
      1
    }
  }

  pub(crate) fn has_register(&self) -> bool {
    self.register.is_some()
  }

  pub(crate) fn register(&self) -> u32 {
    debug_assert!(self.register.is_some());
    self.register.unwrap_or(0)
  }

  /// The last register this interval occupies.
  pub(crate) fn register_end(&self) -> u32 {
    self.register() + self.required_registers() - 1
  }

  pub(crate) fn registers(&self) -> SmallVec<[u32; 2]> {
    let mut registers = SmallVec::new();
    if let Some(register) = self.register {
      registers.push(register);
      if self.is_wide {
        registers.push(register + 1);
      }
    }
    registers
  }

  /// Appends a range, merging with the previous one when they touch.  Ranges
  /// must arrive with ascending starts.
  pub(crate) fn add_range(&mut self, range: LiveRange) {
    debug_assert!(range.start <= range.end);
    if let Some(last) = self.ranges.last_mut() {
      debug_assert!(range.start >= last.start);
      if range.start <= last.end {
        last.end = last.end.max(range.end);
        return;
      }
    }
    self.ranges.push(range);
  }

  pub(crate) fn add_use(&mut self, new_use: LiveIntervalsUse) {
    match self.uses.binary_search(&new_use) {
      Ok(_) => {}
      Err(index) => self.uses.insert(index, new_use),
    }
  }

  pub(crate) fn has_uses(&self) -> bool {
    !self.uses.is_empty()
  }

  pub(crate) fn first_use(&self) -> Option<LiveIntervalsUse> {
    self.uses.first().copied()
  }

  pub(crate) fn first_use_position(&self) -> u32 {
    self.first_use().map(|u| u.position).unwrap_or(u32::max_value())
  }

  pub(crate) fn first_use_after(&self, position: u32) -> u32 {
    self
      .uses
      .iter()
      .find(|u| u.position >= position)
      .map(|u| u.position)
      .unwrap_or(u32::max_value())
  }

  pub(crate) fn first_use_with_constraint(&self) -> Option<LiveIntervalsUse> {
    self.uses.iter().find(|u| u.has_constraint()).copied()
  }

  pub(crate) fn number_of_uses_with_constraint(&self) -> usize {
    self.uses.iter().filter(|u| u.has_constraint()).count()
  }

  /// The tightest register limit over all uses of this interval.
  pub(crate) fn register_limit(&self) -> u32 {
    self.uses.iter().map(|u| u.limit).min().unwrap_or(U16BIT_MAX)
  }

  pub(crate) fn overlaps_position(&self, position: u32) -> bool {
    self.ranges.iter().any(|range| range.contains(position))
  }

  /// The first position covered by both intervals, if any.
  pub(crate) fn next_overlap(&self, other: &LiveIntervals) -> Option<u32> {
    let mut result: Option<u32> = None;
    for range in &self.ranges {
      for other_range in &other.ranges {
        if range.start < other_range.end && other_range.start < range.end {
          let overlap = range.start.max(other_range.start);
          result = Some(result.map_or(overlap, |best| best.min(overlap)));
        }
      }
    }
    result
  }

  pub(crate) fn overlaps(&self, other: &LiveIntervals) -> bool {
    self.next_overlap(other).is_some()
  }

  /// Does this interval's register (pair) intersect the given register
  /// (pair)?
  pub(crate) fn uses_register(&self, register: u32, is_wide: bool) -> bool {
    let own = match self.register {
      Some(register) => register,
      None => return false,
    };
    let own_end = own + self.required_registers() - 1;
    let other_end = register + if is_wide { 1 } else { 0 };
    own <= other_end && register <= own_end
  }

  pub(crate) fn uses_both_registers(&self, first: u32, second: u32) -> bool {
    let registers = self.registers();
    registers.contains(&first) && registers.contains(&second)
  }

  pub(crate) fn has_conflicting_registers(
    &self, other: &LiveIntervals,
  ) -> bool {
    match other.register {
      Some(register) => self.uses_register(register, other.is_wide),
      None => false,
    }
  }

  pub(crate) fn set_register(&mut self, register: u32) {
    self.register = Some(register);
  }

  pub(crate) fn clear_register_assignment(&mut self) {
    self.register = None;
  }
}

//=============================================================================
// The interval arena

/// Owns every live interval.  Split trees, hints and argument chains are
/// index-based cross references into this arena.
pub(crate) struct Intervals {
  data: Vec<LiveIntervals>,
}

impl Intervals {
  pub(crate) fn new() -> Self {
    Self { data: Vec::new() }
  }

  pub(crate) fn push(
    &mut self, value: ValueId, is_wide: bool, is_argument: bool,
    is_const_number: bool, used_as_monitor: bool,
  ) -> IntervalIx {
    let ix = IntervalIx(self.data.len() as u32);
    self.data.push(LiveIntervals {
      value,
      is_wide,
      is_argument,
      is_const_number,
      used_as_monitor,
      parent: ix,
      split_children: Vec::new(),
      ranges: Vec::new(),
      uses: Vec::new(),
      register: None,
      hint: None,
      spilled: false,
      is_invoke_range: false,
      rematerializable: false,
      next_consecutive: None,
      previous_consecutive: None,
    });
    ix
  }

  pub(crate) fn len(&self) -> usize {
    self.data.len()
  }

  pub(crate) fn truncate(&mut self, len: usize) {
    self.data.truncate(len);
  }

  pub(crate) fn get(&self, ix: IntervalIx) -> &LiveIntervals {
    &self.data[ix.0 as usize]
  }

  pub(crate) fn get_mut(&mut self, ix: IntervalIx) -> &mut LiveIntervals {
    &mut self.data[ix.0 as usize]
  }

  pub(crate) fn split_parent(&self, ix: IntervalIx) -> IntervalIx {
    self.get(ix).parent
  }

  pub(crate) fn is_split_parent(&self, ix: IntervalIx) -> bool {
    self.get(ix).parent == ix
  }

  pub(crate) fn has_splits(&self, ix: IntervalIx) -> bool {
    !self.get(self.split_parent(ix)).split_children.is_empty()
  }

  /// The parent followed by its children in start order.
  pub(crate) fn family(&self, ix: IntervalIx) -> Vec<IntervalIx> {
    let parent = self.split_parent(ix);
    let mut family = Vec::with_capacity(
      1 + self.get(parent).split_children.len(),
    );
    family.push(parent);
    family.extend_from_slice(&self.get(parent).split_children);
    family
  }

  pub(crate) fn is_rematerializable(&self, ix: IntervalIx) -> bool {
    self.get(self.split_parent(ix)).rematerializable
  }

  pub(crate) fn is_spilled_and_rematerializable(&self, ix: IntervalIx) -> bool {
    self.get(ix).spilled && self.is_rematerializable(ix)
  }

  pub(crate) fn is_argument_interval(&self, ix: IntervalIx) -> bool {
    self.get(ix).is_argument
  }

  /// Splits the interval at the gap preceding `position`.  The receiver
  /// keeps the prefix; the returned child owns the suffix ranges and every
  /// use at or after the split position.  Children always attach to the
  /// split parent of the tree.
  pub(crate) fn split_before(
    &mut self, ix: IntervalIx, position: u32,
  ) -> IntervalIx {
    let split_position = to_gap_position(position);
    let parent = self.split_parent(ix);
    debug_assert!(split_position > self.get(ix).start());
    debug_assert!(split_position < self.get(ix).end());

    let mut child_ranges = Vec::new();
    {
      let entry = self.get_mut(ix);
      let mut kept = Vec::with_capacity(entry.ranges.len());
      for range in entry.ranges.drain(..) {
        if range.end <= split_position {
          kept.push(range);
        } else if range.start >= split_position {
          child_ranges.push(range);
        } else {
          kept.push(LiveRange::new(range.start, split_position));
          child_ranges.push(LiveRange::new(split_position, range.end));
        }
      }
      entry.ranges = kept;
    }
    let child_uses = {
      let entry = self.get_mut(ix);
      let index = entry
        .uses
        .iter()
        .position(|u| u.position >= split_position)
        .unwrap_or(entry.uses.len());
      entry.uses.split_off(index)
    };
    debug_assert!(!child_ranges.is_empty());

    let child = IntervalIx(self.data.len() as u32);
    let template = self.get(ix);
    let interval = LiveIntervals {
      value: template.value,
      is_wide: template.is_wide,
      is_argument: template.is_argument,
      is_const_number: template.is_const_number,
      used_as_monitor: template.used_as_monitor,
      parent,
      split_children: Vec::new(),
      ranges: child_ranges,
      uses: child_uses,
      register: None,
      hint: None,
      spilled: false,
      is_invoke_range: false,
      rematerializable: false,
      next_consecutive: None,
      previous_consecutive: None,
    };
    self.data.push(interval);

    let child_start = self.get(child).start();
    let insert_at = {
      let children = &self.get(parent).split_children;
      children
        .iter()
        .position(|&other| child_start < self.get(other).start())
        .unwrap_or(children.len())
    };
    self.get_mut(parent).split_children.insert(insert_at, child);
    child
  }

  /// The family member whose span covers `position`: the member with the
  /// largest start not after `position`, or the parent when `position`
  /// precedes every member.
  pub(crate) fn split_covering(
    &self, ix: IntervalIx, position: u32,
  ) -> IntervalIx {
    let parent = self.split_parent(ix);
    let mut best = parent;
    let mut best_start = self.get(parent).start();
    for &child in &self.get(parent).split_children {
      let start = self.get(child).start();
      if start <= position && (start >= best_start || best_start > position) {
        best = child;
        best_start = start;
      }
    }
    if best_start > position {
      parent
    } else {
      best
    }
  }

  pub(crate) fn previous_split(&self, ix: IntervalIx) -> Option<IntervalIx> {
    let family = self.family(ix);
    let position = family.iter().position(|&member| member == ix)?;
    if position == 0 {
      None
    } else {
      Some(family[position - 1])
    }
  }

  pub(crate) fn next_split(&self, ix: IntervalIx) -> Option<IntervalIx> {
    let family = self.family(ix);
    let position = family.iter().position(|&member| member == ix)?;
    family.get(position + 1).copied()
  }

  /// Does any member of the receiver's split tree overlap `other`?
  pub(crate) fn any_split_overlaps(
    &self, ix: IntervalIx, other: IntervalIx,
  ) -> bool {
    let other_entry = self.get(other);
    self
      .family(ix)
      .into_iter()
      .any(|member| self.get(member).overlaps(other_entry))
  }

  pub(crate) fn overlaps(&self, left: IntervalIx, right: IntervalIx) -> bool {
    self.get(left).overlaps(self.get(right))
  }

  /// Reabsorbs all split children into the parent, restoring the unsplit
  /// liveness.  The orphaned children stay in the arena until it is
  /// truncated.
  pub(crate) fn undo_splits(&mut self, parent: IntervalIx) {
    debug_assert!(self.is_split_parent(parent));
    let children = std::mem::replace(
      &mut self.get_mut(parent).split_children,
      Vec::new(),
    );
    if children.is_empty() {
      return;
    }
    let mut ranges = self.get(parent).ranges.clone();
    let mut uses = self.get(parent).uses.clone();
    for child in children {
      ranges.extend_from_slice(&self.get(child).ranges);
      uses.extend_from_slice(&self.get(child).uses);
    }
    ranges.sort_by_key(|range| range.start);
    let mut merged: Vec<LiveRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
      match merged.last_mut() {
        Some(last) if range.start <= last.end => {
          last.end = last.end.max(range.end)
        }
        _ => merged.push(range),
      }
    }
    uses.sort();
    uses.dedup();
    let entry = self.get_mut(parent);
    entry.ranges = merged;
    entry.uses = uses;
  }
}

//=============================================================================
// Tests

#[cfg(test)]
mod tests {
  use super::*;

  fn mk_interval(arena: &mut Intervals, ranges: &[(u32, u32)]) -> IntervalIx {
    let ix = arena.push(ValueId(0), false, false, false, false);
    for &(start, end) in ranges {
      arena.get_mut(ix).add_range(LiveRange::new(start, end));
    }
    ix
  }

  #[test]
  fn range_merging() {
    let mut arena = Intervals::new();
    let ix = mk_interval(&mut arena, &[(0, 0), (0, 6), (6, 10), (13, 20)]);
    assert_eq!(arena.get(ix).ranges, vec![
      LiveRange::new(0, 10),
      LiveRange::new(13, 20)
    ]);
    assert!(arena.get(ix).overlaps_position(9));
    assert!(!arena.get(ix).overlaps_position(10));
    assert!(!arena.get(ix).overlaps_position(12));
    assert!(arena.get(ix).overlaps_position(13));
  }

  #[test]
  fn next_overlap_respects_holes() {
    let mut arena = Intervals::new();
    let left = mk_interval(&mut arena, &[(0, 4), (10, 14)]);
    let right = mk_interval(&mut arena, &[(4, 9)]);
    assert_eq!(arena.get(left).next_overlap(arena.get(right)), None);
    let third = mk_interval(&mut arena, &[(8, 12)]);
    assert_eq!(arena.get(left).next_overlap(arena.get(third)), Some(10));
  }

  #[test]
  fn split_before_partitions_ranges_and_uses() {
    let mut arena = Intervals::new();
    let parent = mk_interval(&mut arena, &[(0, 20)]);
    arena.get_mut(parent).add_use(LiveIntervalsUse::new(4, U16BIT_MAX));
    arena.get_mut(parent).add_use(LiveIntervalsUse::new(12, U4BIT_MAX));
    let child = arena.split_before(parent, 10);
    assert_eq!(arena.get(parent).ranges, vec![LiveRange::new(0, 9)]);
    assert_eq!(arena.get(child).ranges, vec![LiveRange::new(9, 20)]);
    assert_eq!(arena.get(parent).uses.len(), 1);
    assert_eq!(arena.get(child).uses.len(), 1);
    assert_eq!(arena.get(child).register_limit(), U4BIT_MAX);
    assert_eq!(arena.split_parent(child), parent);

    // Splitting the child attaches the grandchild to the root parent.
    let grandchild = arena.split_before(child, 16);
    assert_eq!(arena.split_parent(grandchild), parent);
    assert_eq!(arena.get(parent).split_children, vec![child, grandchild]);
  }

  #[test]
  fn split_covering_handles_holes() {
    let mut arena = Intervals::new();
    let parent = mk_interval(&mut arena, &[(0, 8), (14, 30)]);
    let child = arena.split_before(parent, 20);
    assert_eq!(arena.split_covering(parent, 4), parent);
    assert_eq!(arena.split_covering(parent, 10), parent);
    assert_eq!(arena.split_covering(parent, 19), child);
    assert_eq!(arena.split_covering(parent, 24), child);
  }

  #[test]
  fn undo_splits_restores_liveness() {
    let mut arena = Intervals::new();
    let parent = mk_interval(&mut arena, &[(0, 8), (14, 30)]);
    arena.get_mut(parent).add_use(LiveIntervalsUse::new(6, U16BIT_MAX));
    arena.get_mut(parent).add_use(LiveIntervalsUse::new(28, U4BIT_MAX));
    arena.split_before(parent, 20);
    arena.undo_splits(parent);
    assert_eq!(arena.get(parent).ranges, vec![
      LiveRange::new(0, 8),
      LiveRange::new(14, 30)
    ]);
    assert_eq!(arena.get(parent).uses.len(), 2);
  }

  #[test]
  fn register_positions_blocking() {
    let mut positions = RegisterPositions::new(4);
    positions.set(1, 22, RegisterType::ConstNumber);
    positions.set_blocked(2);
    assert!(!positions.is_blocked(1));
    assert!(positions.is_blocked_with_pair(1, true));
    assert_eq!(positions.get(1), 22);
    assert!(positions.has_type(1, RegisterType::ConstNumber));
    assert!(positions.has_type(1, RegisterType::Any));
    assert!(!positions.has_type(1, RegisterType::Monitor));
    // Out-of-range registers count as blocked.
    assert!(positions.is_blocked(17));

    positions.set_blocked_temporarily(0);
    assert!(positions.is_blocked(0));
    positions.clear_temporary_blocks();
    assert!(!positions.is_blocked(0));
  }

  #[test]
  fn ordered_set_preserves_insertion_order() {
    let mut set = OrderedSet::new();
    set.insert(3u32);
    set.insert(1);
    set.insert(2);
    set.insert(1);
    assert_eq!(set.iter().copied().collect::<Vec<_>>(), vec![3, 1, 2]);
    set.remove(1);
    assert_eq!(set.iter().copied().collect::<Vec<_>>(), vec![3, 2]);
  }

  #[test]
  fn uses_register_accounts_for_pairs() {
    let mut arena = Intervals::new();
    let wide = arena.push(ValueId(1), true, false, false, false);
    arena.get_mut(wide).add_range(LiveRange::new(0, 10));
    arena.get_mut(wide).set_register(4);
    assert!(arena.get(wide).uses_register(5, false));
    assert!(arena.get(wide).uses_register(3, true));
    assert!(!arena.get(wide).uses_register(6, false));
    assert!(arena.get(wide).uses_both_registers(4, 5));
  }
}
