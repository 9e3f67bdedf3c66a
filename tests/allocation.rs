/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! End-to-end allocation scenarios over the mini IR.

mod framework;

use framework::{check_no_read_conflicts, init_logging, FunctionBuilder};

use dex_regalloc::{
  Function, LinearScanRegisterAllocator, LocalId, MoveSource, Options, ValueId,
};

fn allocate<'a>(
  function: &'a framework::TestFunction, options: &'a Options,
) -> LinearScanRegisterAllocator<'a, framework::TestFunction> {
  let mut allocator = LinearScanRegisterAllocator::new(function, options);
  allocator.allocate_registers().expect("allocation must succeed");
  allocator
}

// identity(x) -> x: one argument, no moves, everything fits in 4 bits.
#[test]
fn identity_uses_single_register() {
  init_logging();
  let mut b = FunctionBuilder::new("identity", true);
  let x = b.arg(false);
  b.ret(Some(x));
  let function = b.build();
  let options = Options::default();
  let allocator = allocate(&function, &options);

  assert_eq!(allocator.registers_used(), 1);
  assert_eq!(allocator.highest_used_register(), 0);
  assert!(allocator.spill_moves().is_empty());
  assert_eq!(allocator.get_register_for_value(x, 2).unwrap(), 0);
}

// add(a: long, b: long) -> a + b with the overlapping-long target bug: the
// result pair must not half-overlap either operand pair.
#[test]
fn add_long_result_avoids_half_overlap() {
  init_logging();
  let mut b = FunctionBuilder::new("add", true);
  let a = b.arg(true);
  let c = b.arg(true);
  let sum = b.add_long(a, c);
  b.ret(Some(sum));
  let function = b.build();
  let options = Options {
    can_have_overlapping_long_register_bug: true,
    ..Options::default()
  };
  let allocator = allocate(&function, &options);

  assert_eq!(allocator.registers_used(), 4);
  let sum_reg = allocator.get_register_for_value(sum, 4).unwrap();
  let a_reg = allocator.get_register_for_value(a, 4).unwrap();
  let c_reg = allocator.get_register_for_value(c, 4).unwrap();
  for &operand_reg in &[a_reg, c_reg] {
    assert_ne!(sum_reg, operand_reg + 1);
    assert_ne!(sum_reg + 1, operand_reg);
  }
  check_no_read_conflicts(&function, &allocator);
}

// Twenty live integers feeding one ranged invoke: the operands land in
// twenty consecutive ascending registers and the mode escalates to 8 bits.
#[test]
fn invoke_range_gets_consecutive_registers() {
  init_logging();
  let mut b = FunctionBuilder::new("ranged", true);
  let values: Vec<ValueId> = (0..20).map(|_| b.const_number(false)).collect();
  b.invoke(values.clone(), false);
  b.ret(None);
  let function = b.build();
  let options = Options::default();
  let allocator = allocate(&function, &options);

  let invoke_position = 20 * 2;
  let first = allocator
    .get_register_for_value(values[0], invoke_position)
    .unwrap();
  for (i, &value) in values.iter().enumerate() {
    let register = allocator
      .get_register_for_value(value, invoke_position)
      .unwrap();
    assert_eq!(register, first + i as u32, "operand {} not consecutive", i);
  }
  // Twenty live registers cannot have fit the 4-bit attempt.
  assert_eq!(allocator.registers_used(), 20);
  assert!(allocator.highest_used_register() > 15);
  // The hints pull every constant straight into its chain register.
  assert!(allocator.spill_moves().is_empty());
  check_no_read_conflicts(&function, &allocator);
}

// A catch handler: the exception lands in the dedicated move-exception
// register and no move precedes the move-exception instruction.
#[test]
fn move_exception_register_is_dedicated_and_unpreceded() {
  init_logging();
  let mut b = FunctionBuilder::new("catcher", true);
  let handler = b.block();
  let merge = b.block();
  let x = b.const_number(false);
  b.throwing_op();
  b.set_catch(handler);
  b.goto(merge);
  b.switch_to(merge);
  b.use_value(x, 255);
  b.ret(None);
  b.switch_to(handler);
  let e = b.move_exception();
  b.use_value(e, 255);
  b.use_value(x, 255);
  b.ret(None);
  let function = b.build();
  let options = Options {
    testing: dex_regalloc::TestingOptions {
      always_pessimistic_register_allocation: true,
      ..Default::default()
    },
    ..Options::default()
  };
  let allocator = allocate(&function, &options);

  // Block layout: b0 = [0,2,4], handler = [6,8,10,12], merge = [14,16].
  let handler_entry = 6;
  let e_entry_reg = allocator.get_register_for_value(e, handler_entry).unwrap();
  let x_reg = allocator.get_register_for_value(x, handler_entry).unwrap();
  assert_ne!(e_entry_reg, x_reg);
  // No spill or resolution move sits in the gap before the move-exception.
  assert!(allocator
    .spill_moves()
    .iter()
    .all(|m| m.position != handler_entry - 1));
}

// A phi whose operands arrive in different registers: the phi takes one of
// them and a single phi move fixes up the other edge.
#[test]
fn phi_move_on_mismatched_edge_only() {
  init_logging();
  let mut b = FunctionBuilder::new("phis", true);
  let left = b.block();
  let right = b.block();
  let join = b.block();
  let v1 = b.const_number(false);
  let v2 = b.const_number(false);
  b.branch(v1, left, right);
  b.switch_to(left);
  b.goto(join);
  b.switch_to(right);
  b.goto(join);
  b.switch_to(join);
  let p = b.phi(join, vec![v1, v2]);
  b.use_value(p, 255);
  b.ret(None);
  let function = b.build();
  let options = Options::default();
  let allocator = allocate(&function, &options);

  // Blocks: b0 = [0,2,4], left = [6], right = [8], join = [10,12].
  let p_reg = allocator.get_register_for_value(p, 10).unwrap();
  let v1_reg = allocator.get_register_for_value(v1, 6).unwrap();
  let v2_reg = allocator.get_register_for_value(v2, 8).unwrap();
  assert_ne!(v1_reg, v2_reg);
  // The phi coalesces with one operand; the other edge needs one move.
  assert!(p_reg == v1_reg || p_reg == v2_reg);
  assert_eq!(allocator.spill_moves().len(), 1);
  let phi_move = allocator.spill_moves()[0];
  let mismatched = if p_reg == v1_reg { v2_reg } else { v1_reg };
  assert_eq!(phi_move.dest, p_reg);
  assert_eq!(phi_move.src, MoveSource::Register(mismatched));
}

// A constant used only much later under register pressure: it is spilled,
// its use rematerializes it, and the spill slot compacts away.
#[test]
fn spilled_constant_rematerializes_and_compacts() {
  init_logging();
  let mut b = FunctionBuilder::new("remat", true);
  let k = b.const_number(false);
  let values: Vec<ValueId> = (0..16).map(|_| b.const_number(false)).collect();
  for &value in &values {
    b.use_value(value, 15);
  }
  b.use_value(k, 15);
  b.ret(None);
  let function = b.build();
  let options = Options::default();
  let allocator = allocate(&function, &options);

  // The displaced constant is reloaded, not read from a spill register.
  assert!(allocator
    .spill_moves()
    .iter()
    .any(|m| m.src == MoveSource::Constant(k)));
  // k's constrained use still sees a 4-bit register.
  let k_use_position = (1 + 16 + 16) * 2;
  assert!(allocator.get_register_for_value(k, k_use_position).unwrap() <= 15);
  // The parked spill slot was never materialized: 17 values, one of them
  // rematerialized, fit in 16 registers plus nothing.
  assert_eq!(allocator.registers_used(), 16);
  check_no_read_conflicts(&function, &allocator);
}

// aget-wide workaround: the result pair must not start at the array
// register.
#[test]
fn array_get_wide_avoids_array_register() {
  init_logging();
  let mut b = FunctionBuilder::new("agetw", true);
  let array = b.const_number(false);
  let index = b.const_number(false);
  let wide = b.array_get_wide(array, index);
  b.use_value(wide, 255);
  b.ret(None);
  let function = b.build();
  let options = Options {
    can_use_same_array_and_result_register_in_array_get_wide: false,
    ..Options::default()
  };
  let allocator = allocate(&function, &options);

  let def_position = 4;
  let array_reg = allocator.get_register_for_value(array, def_position).unwrap();
  let wide_reg = allocator.get_register_for_value(wide, def_position).unwrap();
  assert_ne!(wide_reg, array_reg);
}

// cmp-long workaround: the single result must not overlap either operand
// pair.
#[test]
fn cmp_long_result_avoids_operand_pairs() {
  init_logging();
  let mut b = FunctionBuilder::new("cmp", true);
  let a = b.arg(true);
  let c = b.arg(true);
  let result = b.cmp_long(a, c);
  b.ret(Some(result));
  let function = b.build();
  let options = Options { can_have_cmp_long_bug: true, ..Options::default() };
  let allocator = allocate(&function, &options);

  let def_position = 4;
  let result_reg = allocator.get_register_for_value(result, def_position).unwrap();
  let a_reg = allocator.get_register_for_value(a, def_position).unwrap();
  let c_reg = allocator.get_register_for_value(c, def_position).unwrap();
  for &operand in &[a_reg, c_reg] {
    assert_ne!(result_reg, operand);
    assert_ne!(result_reg, operand + 1);
  }
}

// Debug mode: an argument carrying local info shows up in the entry-locals
// map.
#[test]
fn debug_locals_open_at_entry() {
  init_logging();
  let mut b = FunctionBuilder::new("locals", false);
  let x = b.arg(false);
  b.set_local(x, LocalId(7));
  let y = b.const_number(false);
  b.use_value(y, 255);
  b.debug_use(x);
  b.ret(None);
  let function = b.build();
  let options = Options { debug: true, ..Options::default() };
  let allocator = allocate(&function, &options);

  let entry = function.blocks[0];
  let locals = allocator.locals_at_entry(entry).expect("entry locals");
  assert!(locals.values().any(|&local| local == LocalId(7)));
  assert!(allocator.has_equal_types_at_entry(entry, entry));
}

// Determinism: two runs over the same input produce identical results.
#[test]
fn allocation_is_deterministic() {
  init_logging();
  let build = || {
    let mut b = FunctionBuilder::new("det", true);
    let values: Vec<ValueId> = (0..12).map(|_| b.const_number(false)).collect();
    let sum = b.add_int(values[0], values[1]);
    b.invoke(values[2..10].to_vec(), true);
    b.use_value(sum, 15);
    for &value in &values {
      b.use_value(value, 15);
    }
    b.ret(None);
    b.build()
  };
  let f1 = build();
  let f2 = build();
  let options = Options::default();
  let a1 = allocate(&f1, &options);
  let a2 = allocate(&f2, &options);
  assert_eq!(a1.registers_used(), a2.registers_used());
  let moves1: Vec<_> = a1
    .spill_moves()
    .iter()
    .map(|m| (m.position, m.dest, m.src, m.is_wide))
    .collect();
  let moves2: Vec<_> = a2
    .spill_moves()
    .iter()
    .map(|m| (m.position, m.dest, m.src, m.is_wide))
    .collect();
  assert_eq!(moves1, moves2);
  for value in 0..f1.num_values() {
    for position in 0..f1.num_instructions() * 2 {
      let r1 = a1.get_register_for_value(ValueId(value), position);
      let r2 = a2.get_register_for_value(ValueId(value), position);
      assert_eq!(r1.ok(), r2.ok());
    }
  }
}

// A value without intervals is a compile error, not a crash.
#[test]
fn query_for_unknown_value_is_an_error() {
  init_logging();
  let mut b = FunctionBuilder::new("missing", true);
  let x = b.const_number(false);
  b.use_value(x, 255);
  b.ret(None);
  let function = b.build();
  let options = Options::default();
  let allocator = allocate(&function, &options);
  assert!(allocator.get_register_for_value(ValueId(999), 0).is_err());
}
