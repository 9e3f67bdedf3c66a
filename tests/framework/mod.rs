/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! A miniature DEX-flavoured IR and builder for driving the allocator in
//! tests.  Register-field limits follow the DEX instruction formats: consts
//! and most ops address 8-bit registers, non-range invokes 4-bit registers,
//! moves 16-bit registers.

use dex_regalloc::{
  ArithmeticOp, BlockId, Function, InstDesc, InstId, LinearScanRegisterAllocator,
  LocalId, LogicalOp, ValueId, U16BIT_MAX, U4BIT_MAX, U8BIT_MAX,
};

#[allow(dead_code)]
pub enum InstKind {
  Argument,
  ConstNumber,
  Move { src: ValueId },
  CheckCast { object: ValueId },
  ArithmeticBinop {
    left: ValueId,
    right: ValueId,
    op: ArithmeticOp,
    commutative: bool,
    is_long: bool,
  },
  LogicalBinop { left: ValueId, right: ValueId, op: LogicalOp, is_long: bool },
  Cmp { left: ValueId, right: ValueId, operands_are_wide: bool },
  NumberConversion { src: ValueId, is_long_to_int: bool },
  ArrayGet { array: ValueId, result_is_wide: bool },
  Invoke { args: Vec<ValueId> },
  MoveException,
  MonitorEnter,
  Goto,
  Other,
}

pub struct Inst {
  pub kind: InstKind,
  pub out: Option<ValueId>,
  pub ins: Vec<ValueId>,
  pub debug_values: Vec<ValueId>,
  pub can_throw: bool,
  pub max_in: u32,
  pub max_out: u32,
}

#[derive(Default)]
pub struct ValueData {
  pub is_phi: bool,
  pub phi_block: u32,
  pub phi_operands: Vec<ValueId>,
  pub definition: Option<InstId>,
  pub is_argument: bool,
  pub required_registers: u32,
  pub local: Option<LocalId>,
  pub users: Vec<InstId>,
  pub phi_users: Vec<ValueId>,
  pub used_as_monitor: bool,
}

pub struct TestFunction {
  pub name: String,
  pub is_static: bool,
  pub blocks: Vec<BlockId>,
  pub block_insts: Vec<Vec<InstId>>,
  pub block_succs: Vec<Vec<BlockId>>,
  pub block_preds: Vec<Vec<BlockId>>,
  pub block_catch: Vec<Vec<BlockId>>,
  pub block_phis: Vec<Vec<ValueId>>,
  pub arguments: Vec<ValueId>,
  pub insts: Vec<Inst>,
  pub values: Vec<ValueData>,
}

impl Function for TestFunction {
  fn method_name(&self) -> &str {
    &self.name
  }

  fn method_is_static(&self) -> bool {
    self.is_static
  }

  fn num_values(&self) -> u32 {
    self.values.len() as u32
  }

  fn num_instructions(&self) -> u32 {
    self.insts.len() as u32
  }

  fn num_blocks(&self) -> u32 {
    self.blocks.len() as u32
  }

  fn blocks(&self) -> &[BlockId] {
    &self.blocks
  }

  fn topologically_sorted_blocks(&self) -> &[BlockId] {
    &self.blocks
  }

  fn block_instructions(&self, block: BlockId) -> &[InstId] {
    &self.block_insts[block.0 as usize]
  }

  fn block_successors(&self, block: BlockId) -> &[BlockId] {
    &self.block_succs[block.0 as usize]
  }

  fn block_predecessors(&self, block: BlockId) -> &[BlockId] {
    &self.block_preds[block.0 as usize]
  }

  fn block_catch_successors(&self, block: BlockId) -> &[BlockId] {
    &self.block_catch[block.0 as usize]
  }

  fn block_phis(&self, block: BlockId) -> &[ValueId] {
    &self.block_phis[block.0 as usize]
  }

  fn arguments(&self) -> &[ValueId] {
    &self.arguments
  }

  fn inst_desc(&self, inst: InstId) -> InstDesc<'_> {
    match &self.insts[inst.0 as usize].kind {
      InstKind::Argument => InstDesc::Argument,
      InstKind::ConstNumber => InstDesc::ConstNumber,
      InstKind::Move { src } => InstDesc::Move { src: *src },
      InstKind::CheckCast { object } => {
        InstDesc::CheckCast { object: *object }
      }
      InstKind::ArithmeticBinop { left, right, op, commutative, is_long } => {
        InstDesc::ArithmeticBinop {
          left: *left,
          right: *right,
          op: *op,
          commutative: *commutative,
          is_long: *is_long,
        }
      }
      InstKind::LogicalBinop { left, right, op, is_long } => {
        InstDesc::LogicalBinop {
          left: *left,
          right: *right,
          op: *op,
          is_long: *is_long,
        }
      }
      InstKind::Cmp { left, right, operands_are_wide } => InstDesc::Cmp {
        left: *left,
        right: *right,
        operands_are_wide: *operands_are_wide,
      },
      InstKind::NumberConversion { src, is_long_to_int } => {
        InstDesc::NumberConversion {
          src: *src,
          is_long_to_int: *is_long_to_int,
        }
      }
      InstKind::ArrayGet { array, result_is_wide } => InstDesc::ArrayGet {
        array: *array,
        result_is_wide: *result_is_wide,
      },
      InstKind::Invoke { args } => InstDesc::Invoke { arguments: args },
      InstKind::MoveException => InstDesc::MoveException,
      InstKind::Goto => InstDesc::Goto,
      InstKind::MonitorEnter | InstKind::Other => InstDesc::Other,
    }
  }

  fn inst_out_value(&self, inst: InstId) -> Option<ValueId> {
    self.insts[inst.0 as usize].out
  }

  fn inst_in_values(&self, inst: InstId) -> &[ValueId] {
    &self.insts[inst.0 as usize].ins
  }

  fn inst_debug_values(&self, inst: InstId) -> &[ValueId] {
    &self.insts[inst.0 as usize].debug_values
  }

  fn inst_can_throw(&self, inst: InstId) -> bool {
    self.insts[inst.0 as usize].can_throw
  }

  fn max_in_value_register(&self, inst: InstId) -> u32 {
    self.insts[inst.0 as usize].max_in
  }

  fn max_out_value_register(&self, inst: InstId) -> u32 {
    self.insts[inst.0 as usize].max_out
  }

  fn value_is_phi(&self, value: ValueId) -> bool {
    self.values[value.0 as usize].is_phi
  }

  fn value_definition(&self, value: ValueId) -> Option<InstId> {
    self.values[value.0 as usize].definition
  }

  fn phi_block(&self, value: ValueId) -> BlockId {
    BlockId(self.values[value.0 as usize].phi_block)
  }

  fn phi_operands(&self, value: ValueId) -> &[ValueId] {
    &self.values[value.0 as usize].phi_operands
  }

  fn value_needs_register(&self, _value: ValueId) -> bool {
    true
  }

  fn value_is_argument(&self, value: ValueId) -> bool {
    self.values[value.0 as usize].is_argument
  }

  fn value_required_registers(&self, value: ValueId) -> u32 {
    self.values[value.0 as usize].required_registers
  }

  fn value_local_info(&self, value: ValueId) -> Option<LocalId> {
    self.values[value.0 as usize].local
  }

  fn value_users(&self, value: ValueId) -> &[InstId] {
    &self.values[value.0 as usize].users
  }

  fn value_phi_users(&self, value: ValueId) -> &[ValueId] {
    &self.values[value.0 as usize].phi_users
  }

  fn value_used_as_monitor(&self, value: ValueId) -> bool {
    self.values[value.0 as usize].used_as_monitor
  }
}

//=============================================================================
// Builder

pub struct FunctionBuilder {
  function: TestFunction,
  current_block: usize,
}

#[allow(dead_code)]
impl FunctionBuilder {
  pub fn new(name: &str, is_static: bool) -> Self {
    let mut builder = Self {
      function: TestFunction {
        name: name.to_string(),
        is_static,
        blocks: Vec::new(),
        block_insts: Vec::new(),
        block_succs: Vec::new(),
        block_preds: Vec::new(),
        block_catch: Vec::new(),
        block_phis: Vec::new(),
        arguments: Vec::new(),
        insts: Vec::new(),
        values: Vec::new(),
      },
      current_block: 0,
    };
    builder.block();
    builder
  }

  pub fn block(&mut self) -> BlockId {
    let id = BlockId(self.function.blocks.len() as u32);
    self.function.blocks.push(id);
    self.function.block_insts.push(Vec::new());
    self.function.block_succs.push(Vec::new());
    self.function.block_preds.push(Vec::new());
    self.function.block_catch.push(Vec::new());
    self.function.block_phis.push(Vec::new());
    id
  }

  pub fn switch_to(&mut self, block: BlockId) {
    self.current_block = block.0 as usize;
  }

  fn new_value(&mut self, required_registers: u32) -> ValueId {
    let id = ValueId(self.function.values.len() as u32);
    self.function.values.push(ValueData {
      required_registers,
      ..ValueData::default()
    });
    id
  }

  fn push_inst(
    &mut self, kind: InstKind, out: Option<ValueId>, ins: Vec<ValueId>,
    can_throw: bool, max_in: u32, max_out: u32,
  ) -> InstId {
    let id = InstId(self.function.insts.len() as u32);
    for &used in &ins {
      let users = &mut self.function.values[used.0 as usize].users;
      if !users.contains(&id) {
        users.push(id);
      }
    }
    if let Some(out) = out {
      self.function.values[out.0 as usize].definition = Some(id);
    }
    self.function.insts.push(Inst {
      kind,
      out,
      ins,
      debug_values: Vec::new(),
      can_throw,
      max_in,
      max_out,
    });
    self.function.block_insts[self.current_block].push(id);
    id
  }

  pub fn arg(&mut self, wide: bool) -> ValueId {
    let value = self.new_value(if wide { 2 } else { 1 });
    self.function.values[value.0 as usize].is_argument = true;
    self.function.arguments.push(value);
    self.push_inst(
      InstKind::Argument,
      Some(value),
      Vec::new(),
      false,
      U16BIT_MAX,
      U16BIT_MAX,
    );
    value
  }

  pub fn const_number(&mut self, wide: bool) -> ValueId {
    let value = self.new_value(if wide { 2 } else { 1 });
    self.push_inst(
      InstKind::ConstNumber,
      Some(value),
      Vec::new(),
      false,
      U16BIT_MAX,
      U8BIT_MAX,
    );
    value
  }

  pub fn move_of(&mut self, src: ValueId) -> ValueId {
    let wide = self.function.values[src.0 as usize].required_registers == 2;
    let value = self.new_value(if wide { 2 } else { 1 });
    self.push_inst(
      InstKind::Move { src },
      Some(value),
      vec![src],
      false,
      U16BIT_MAX,
      U16BIT_MAX,
    );
    value
  }

  pub fn check_cast(&mut self, object: ValueId) -> ValueId {
    let value = self.new_value(1);
    self.push_inst(
      InstKind::CheckCast { object },
      Some(value),
      vec![object],
      true,
      U8BIT_MAX,
      U8BIT_MAX,
    );
    value
  }

  pub fn add_int(&mut self, left: ValueId, right: ValueId) -> ValueId {
    let value = self.new_value(1);
    self.push_inst(
      InstKind::ArithmeticBinop {
        left,
        right,
        op: ArithmeticOp::Add,
        commutative: true,
        is_long: false,
      },
      Some(value),
      vec![left, right],
      false,
      U8BIT_MAX,
      U8BIT_MAX,
    );
    value
  }

  pub fn add_long(&mut self, left: ValueId, right: ValueId) -> ValueId {
    let value = self.new_value(2);
    self.push_inst(
      InstKind::ArithmeticBinop {
        left,
        right,
        op: ArithmeticOp::Add,
        commutative: true,
        is_long: true,
      },
      Some(value),
      vec![left, right],
      false,
      U8BIT_MAX,
      U8BIT_MAX,
    );
    value
  }

  pub fn or_long(&mut self, left: ValueId, right: ValueId) -> ValueId {
    let value = self.new_value(2);
    self.push_inst(
      InstKind::LogicalBinop { left, right, op: LogicalOp::Or, is_long: true },
      Some(value),
      vec![left, right],
      false,
      U8BIT_MAX,
      U8BIT_MAX,
    );
    value
  }

  pub fn cmp_long(&mut self, left: ValueId, right: ValueId) -> ValueId {
    let value = self.new_value(1);
    self.push_inst(
      InstKind::Cmp { left, right, operands_are_wide: true },
      Some(value),
      vec![left, right],
      false,
      U8BIT_MAX,
      U8BIT_MAX,
    );
    value
  }

  pub fn long_to_int(&mut self, src: ValueId) -> ValueId {
    let value = self.new_value(1);
    self.push_inst(
      InstKind::NumberConversion { src, is_long_to_int: true },
      Some(value),
      vec![src],
      false,
      U4BIT_MAX,
      U4BIT_MAX,
    );
    value
  }

  pub fn array_get_wide(&mut self, array: ValueId, index: ValueId) -> ValueId {
    let value = self.new_value(2);
    self.push_inst(
      InstKind::ArrayGet { array, result_is_wide: true },
      Some(value),
      vec![array, index],
      true,
      U8BIT_MAX,
      U8BIT_MAX,
    );
    value
  }

  /// A non-range invoke reads 4-bit registers; once the arguments need more
  /// than five words the range encoding with 16-bit registers applies.
  pub fn invoke(
    &mut self, args: Vec<ValueId>, has_out_value: bool,
  ) -> Option<ValueId> {
    let words: u32 = args
      .iter()
      .map(|&a| self.function.values[a.0 as usize].required_registers)
      .sum();
    let max_in = if words > 5 { U16BIT_MAX } else { U4BIT_MAX };
    let out = if has_out_value { Some(self.new_value(1)) } else { None };
    self.push_inst(
      InstKind::Invoke { args: args.clone() },
      out,
      args,
      true,
      max_in,
      U8BIT_MAX,
    );
    out
  }

  pub fn move_exception(&mut self) -> ValueId {
    let value = self.new_value(1);
    self.push_inst(
      InstKind::MoveException,
      Some(value),
      Vec::new(),
      false,
      U16BIT_MAX,
      U8BIT_MAX,
    );
    value
  }

  pub fn monitor_enter(&mut self, object: ValueId) {
    self.function.values[object.0 as usize].used_as_monitor = true;
    self.push_inst(
      InstKind::MonitorEnter,
      None,
      vec![object],
      true,
      U8BIT_MAX,
      U16BIT_MAX,
    );
  }

  /// A generic throwing instruction with no operands or result.
  pub fn throwing_op(&mut self) {
    self.push_inst(
      InstKind::Other,
      None,
      Vec::new(),
      true,
      U16BIT_MAX,
      U16BIT_MAX,
    );
  }

  /// A generic use of `value` with the given register-field limit.
  pub fn use_value(&mut self, value: ValueId, limit: u32) {
    self.push_inst(
      InstKind::Other,
      None,
      vec![value],
      false,
      limit,
      U16BIT_MAX,
    );
  }

  pub fn use_values(&mut self, values: &[ValueId], limit: u32) {
    self.push_inst(
      InstKind::Other,
      None,
      values.to_vec(),
      false,
      limit,
      U16BIT_MAX,
    );
  }

  pub fn goto(&mut self, target: BlockId) {
    self.push_inst(
      InstKind::Goto,
      None,
      Vec::new(),
      false,
      U16BIT_MAX,
      U16BIT_MAX,
    );
    self.add_edge(target);
  }

  pub fn branch(&mut self, condition: ValueId, then: BlockId, other: BlockId) {
    self.push_inst(
      InstKind::Other,
      None,
      vec![condition],
      false,
      U8BIT_MAX,
      U16BIT_MAX,
    );
    self.add_edge(then);
    self.add_edge(other);
  }

  pub fn ret(&mut self, value: Option<ValueId>) {
    let ins = value.into_iter().collect();
    self.push_inst(InstKind::Other, None, ins, false, U8BIT_MAX, U16BIT_MAX);
  }

  fn add_edge(&mut self, target: BlockId) {
    let current = BlockId(self.current_block as u32);
    self.function.block_succs[self.current_block].push(target);
    self.function.block_preds[target.0 as usize].push(current);
  }

  /// Marks `handler` as the exceptional successor of the current block.
  pub fn set_catch(&mut self, handler: BlockId) {
    let current = BlockId(self.current_block as u32);
    self.function.block_succs[self.current_block].push(handler);
    self.function.block_catch[self.current_block].push(handler);
    self.function.block_preds[handler.0 as usize].push(current);
  }

  /// Operands must be given in the order the incoming edges were created.
  pub fn phi(&mut self, block: BlockId, operands: Vec<ValueId>) -> ValueId {
    let wide = operands
      .first()
      .map(|&o| self.function.values[o.0 as usize].required_registers == 2)
      .unwrap_or(false);
    let value = self.new_value(if wide { 2 } else { 1 });
    {
      let data = &mut self.function.values[value.0 as usize];
      data.is_phi = true;
      data.phi_block = block.0;
      data.phi_operands = operands.clone();
    }
    for operand in operands {
      let phi_users = &mut self.function.values[operand.0 as usize].phi_users;
      if !phi_users.contains(&value) {
        phi_users.push(value);
      }
    }
    self.function.block_phis[block.0 as usize].push(value);
    value
  }

  pub fn set_local(&mut self, value: ValueId, local: LocalId) {
    self.function.values[value.0 as usize].local = Some(local);
  }

  /// Attaches `value` as a debug value of the most recent instruction,
  /// keeping the local alive there in debug builds.
  pub fn debug_use(&mut self, value: ValueId) {
    let last = InstId(self.function.insts.len() as u32 - 1);
    self.function.insts[last.0 as usize].debug_values.push(value);
    let users = &mut self.function.values[value.0 as usize].users;
    if !users.contains(&last) {
      users.push(last);
    }
  }

  pub fn build(self) -> TestFunction {
    self.function
  }
}

//=============================================================================
// Checks

/// At every instruction, the registers holding the distinct values it reads
/// must not collide (wide pairs included).
#[allow(dead_code)]
pub fn check_no_read_conflicts(
  function: &TestFunction,
  allocator: &LinearScanRegisterAllocator<TestFunction>,
) {
  let mut number = 0;
  for &block in &function.blocks {
    for &inst in &function.block_insts[block.0 as usize] {
      let mut occupied: Vec<(ValueId, u32)> = Vec::new();
      for &value in function.inst_in_values(inst) {
        if occupied.iter().any(|&(other, _)| other == value) {
          continue;
        }
        let register = allocator
          .get_register_for_value(value, number)
          .expect("read value must have a register");
        for i in 0..function.value_required_registers(value) {
          for &(other, other_register) in &occupied {
            assert!(
              other_register != register + i,
              "values {:?} and {:?} collide in r{} at {}",
              value,
              other,
              register + i,
              number
            );
          }
          occupied.push((value, register + i));
        }
      }
      number += 2;
    }
  }
}

#[allow(dead_code)]
pub fn init_logging() {
  let _ = pretty_env_logger::try_init();
}
