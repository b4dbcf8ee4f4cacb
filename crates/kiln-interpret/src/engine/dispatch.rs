use std::sync::Arc;

use kiln_core::ir::pretty::opcode_name;
use kiln_core::ir::{
    BlockId, FloatPredicate, FuncId, Function, InstKind, Instruction, IntPredicate, Operand,
    Program, RmwOp, Terminator, Ty,
};

use crate::engine::value::{ApInt, Value};
use crate::engine::{BlockExit, Control, Cursor, Interpreter};
use crate::error::EvalError;

impl Interpreter {
    /// Execute one function against the current frame, from its entry block.
    pub(crate) fn call_function(
        &mut self,
        program: &Program,
        func: &Function,
        func_id: FuncId,
        depth: usize,
    ) -> Result<BlockExit, EvalError> {
        if func.blocks.is_empty() {
            return Err(EvalError::CallToBodylessFunction(func.name.clone()));
        }
        if depth > self.limits.max_call_depth {
            return Err(EvalError::CallDepthExceeded(self.limits.max_call_depth));
        }
        self.run_blocks(program, func, func_id, Cursor { block: 0, instr: 0 }, depth)
    }

    /// The fetch-execute loop: walks basic blocks from `start` until a return,
    /// a suspension, or an error. Instructions within one block execute in
    /// program order; there is no reordering.
    pub(crate) fn run_blocks(
        &mut self,
        program: &Program,
        func: &Function,
        func_id: FuncId,
        start: Cursor,
        depth: usize,
    ) -> Result<BlockExit, EvalError> {
        let mark = self.memory.stack_mark();
        let mut prev_block: Option<BlockId> = None;
        let mut cursor = start;
        loop {
            let block = func.blocks.get(cursor.block).ok_or_else(|| {
                EvalError::Malformed(format!("instruction cursor outside @{}", func.name))
            })?;
            if let Some(inst) = block.instructions.get(cursor.instr) {
                self.bump_budget()?;
                match self.exec_instruction(program, func_id, inst, prev_block, cursor, depth)? {
                    Control::Next => cursor.instr += 1,
                    Control::Suspend => return Ok(BlockExit::Suspended),
                }
            } else {
                self.bump_budget()?;
                match &block.terminator {
                    Terminator::Ret(operand) => {
                        let value = match operand {
                            Some(operand) => self.operand_value(program, operand)?,
                            None => Value::Unit,
                        };
                        if let Some(handle) = self.frame.coroutine {
                            self.finish_coroutine(handle, value.clone())?;
                        }
                        self.memory.stack_truncate(mark);
                        return Ok(BlockExit::Return(value));
                    }
                    Terminator::Br(target) => {
                        prev_block = Some(block.id);
                        cursor = jump(func, *target)?;
                    }
                    Terminator::CondBr {
                        cond,
                        if_true,
                        if_false,
                    } => {
                        let cond = self.int_operand(program, cond, "conditional branch")?;
                        let target = if cond.as_bool() { *if_true } else { *if_false };
                        prev_block = Some(block.id);
                        cursor = jump(func, target)?;
                    }
                    Terminator::Switch {
                        value,
                        default,
                        cases,
                    } => {
                        let scrutinee = self.int_operand(program, value, "switch")?.as_u128();
                        let target = cases
                            .iter()
                            .find(|(case, _)| *case == scrutinee)
                            .map(|(_, target)| *target)
                            .unwrap_or(*default);
                        prev_block = Some(block.id);
                        cursor = jump(func, target)?;
                    }
                    Terminator::Unreachable => return Err(EvalError::UnreachableExecuted),
                }
            }
        }
    }

    fn bump_budget(&mut self) -> Result<(), EvalError> {
        self.retired += 1;
        if self.retired > self.limits.max_instructions {
            Err(EvalError::InstructionBudgetExceeded(
                self.limits.max_instructions,
            ))
        } else {
            Ok(())
        }
    }

    /// Resolve an operand to its runtime value. SSA registers come from the
    /// frame's result cache; constants are converted in place; globals
    /// materialize on first touch.
    pub(crate) fn operand_value(
        &mut self,
        program: &Program,
        operand: &Operand,
    ) -> Result<Value, EvalError> {
        match operand {
            Operand::Value(id) => self
                .frame
                .cache
                .get(id)
                .cloned()
                .ok_or_else(|| EvalError::Malformed(format!("use of undefined value %{}", id))),
            Operand::Const(constant) => self.const_to_value(program, constant),
            Operand::Global(id) => {
                let address = self.materialize_global(program, *id)?;
                Ok(Value::int(self.pointer_bits(), u128::from(address)))
            }
            Operand::FuncRef(_) => Err(EvalError::FunctionPointerUnsupported),
            Operand::NullPtr => Ok(Value::int(self.pointer_bits(), 0)),
        }
    }

    pub(crate) fn int_operand(
        &mut self,
        program: &Program,
        operand: &Operand,
        what: &str,
    ) -> Result<ApInt, EvalError> {
        self.operand_value(program, operand)?
            .as_int()
            .ok_or_else(|| {
                EvalError::UnsupportedInstruction(format!("{} on non-integer operand", what))
            })
    }

    pub(crate) fn address_operand(
        &mut self,
        program: &Program,
        operand: &Operand,
        what: &str,
    ) -> Result<u64, EvalError> {
        Ok(self.int_operand(program, operand, what)?.as_u64())
    }

    fn exec_instruction(
        &mut self,
        program: &Program,
        func_id: FuncId,
        inst: &Instruction,
        prev_block: Option<BlockId>,
        cursor: Cursor,
        depth: usize,
    ) -> Result<Control, EvalError> {
        let oracle = Arc::clone(&self.oracle);
        let pointer_bits = oracle.pointer_width();
        let value = match &inst.kind {
            InstKind::Alloca { ty } => {
                let size = oracle.size_of(ty);
                // Coroutine locals live on the heap so their addresses stay
                // stable across suspension.
                let address = if self.frame.is_coroutine {
                    self.memory.alloc_heap(size)?
                } else {
                    self.memory.alloc_stack(size)?
                };
                Value::int(pointer_bits, u128::from(address))
            }
            InstKind::Load { address } => {
                let address = self.address_operand(program, address, "load")?;
                self.memory.load(oracle.as_ref(), address, &inst.ty)?
            }
            InstKind::Store { value, address, ty } => {
                let value = self.operand_value(program, value)?;
                let address = self.address_operand(program, address, "store")?;
                self.memory.store(oracle.as_ref(), address, &value, ty)?;
                Value::Unit
            }
            InstKind::Gep {
                base,
                pointee,
                indices,
            } => self.build_gep(program, base, pointee, indices)?,
            InstKind::Phi { incoming } => {
                let prev = prev_block.ok_or_else(|| {
                    EvalError::Malformed("phi node in function entry block".to_string())
                })?;
                let chosen = incoming
                    .iter()
                    .find(|(_, block)| *block == prev)
                    .map(|(operand, _)| operand)
                    .ok_or(EvalError::MalformedPhi(prev))?;
                self.operand_value(program, chosen)?
            }
            InstKind::Select {
                cond,
                if_true,
                if_false,
            } => {
                let cond = self.int_operand(program, cond, "select")?;
                let chosen = if cond.as_bool() { if_true } else { if_false };
                self.operand_value(program, chosen)?
            }
            InstKind::ExtractValue { aggregate, indices } => {
                let mut value = self.operand_value(program, aggregate)?;
                for index in indices {
                    let Value::Aggregate(mut elements) = value else {
                        return Err(EvalError::UnsupportedInstruction(
                            "extractvalue on non-aggregate operand".to_string(),
                        ));
                    };
                    if *index as usize >= elements.len() {
                        return Err(EvalError::Malformed(format!(
                            "extractvalue index {} out of range",
                            index
                        )));
                    }
                    value = elements.swap_remove(*index as usize);
                }
                value
            }

            InstKind::Add(a, b) => self.int_binop(program, &inst.kind, a, b, |x, y| {
                Ok(x.wrapping_add(y))
            })?,
            InstKind::Sub(a, b) => self.int_binop(program, &inst.kind, a, b, |x, y| {
                Ok(x.wrapping_sub(y))
            })?,
            InstKind::Mul(a, b) => self.int_binop(program, &inst.kind, a, b, |x, y| {
                Ok(x.wrapping_mul(y))
            })?,
            InstKind::SDiv(a, b) => self.int_binop(program, &inst.kind, a, b, |x, y| {
                if y.is_zero() {
                    Err(EvalError::DivisionByZero)
                } else {
                    Ok(x.sdiv(y))
                }
            })?,
            InstKind::UDiv(a, b) => self.int_binop(program, &inst.kind, a, b, |x, y| {
                if y.is_zero() {
                    Err(EvalError::DivisionByZero)
                } else {
                    Ok(x.udiv(y))
                }
            })?,
            InstKind::SRem(a, b) => self.int_binop(program, &inst.kind, a, b, |x, y| {
                if y.is_zero() {
                    Err(EvalError::DivisionByZero)
                } else {
                    Ok(x.srem(y))
                }
            })?,
            InstKind::URem(a, b) => self.int_binop(program, &inst.kind, a, b, |x, y| {
                if y.is_zero() {
                    Err(EvalError::DivisionByZero)
                } else {
                    Ok(x.urem(y))
                }
            })?,
            InstKind::And(a, b) => self.int_binop(program, &inst.kind, a, b, |x, y| Ok(x.and(y)))?,
            InstKind::Or(a, b) => self.int_binop(program, &inst.kind, a, b, |x, y| Ok(x.or(y)))?,
            InstKind::Xor(a, b) => self.int_binop(program, &inst.kind, a, b, |x, y| Ok(x.xor(y)))?,
            InstKind::Shl(a, b) => self.int_binop(program, &inst.kind, a, b, |x, y| {
                Ok(x.shl(shift_amount(y)))
            })?,
            InstKind::LShr(a, b) => self.int_binop(program, &inst.kind, a, b, |x, y| {
                Ok(x.lshr(shift_amount(y)))
            })?,
            InstKind::AShr(a, b) => self.int_binop(program, &inst.kind, a, b, |x, y| {
                Ok(x.ashr(shift_amount(y)))
            })?,

            InstKind::FAdd(a, b) => self.float_binop(program, &inst.kind, a, b, |x, y| x + y)?,
            InstKind::FSub(a, b) => self.float_binop(program, &inst.kind, a, b, |x, y| x - y)?,
            InstKind::FMul(a, b) => self.float_binop(program, &inst.kind, a, b, |x, y| x * y)?,
            InstKind::FDiv(a, b) => self.float_binop(program, &inst.kind, a, b, |x, y| x / y)?,
            InstKind::FRem(a, b) => self.float_binop(program, &inst.kind, a, b, |x, y| x % y)?,
            InstKind::FNeg(a) => match self.operand_value(program, a)? {
                Value::F32(x) => Value::F32(-x),
                Value::F64(x) => Value::F64(-x),
                _ => {
                    return Err(EvalError::UnsupportedInstruction(
                        "fneg on non-float operand".to_string(),
                    ))
                }
            },

            InstKind::ICmp { pred, lhs, rhs } => {
                let x = self.int_operand(program, lhs, "icmp")?;
                let y = self.int_operand(program, rhs, "icmp")?;
                Value::bool(icmp(*pred, x, y))
            }
            InstKind::FCmp { pred, lhs, rhs } => {
                let x = self.operand_value(program, lhs)?;
                let y = self.operand_value(program, rhs)?;
                let (x, y) = match (x, y) {
                    (Value::F32(x), Value::F32(y)) => (f64::from(x), f64::from(y)),
                    (Value::F64(x), Value::F64(y)) => (x, y),
                    _ => {
                        return Err(EvalError::UnsupportedInstruction(
                            "fcmp on mismatched operands".to_string(),
                        ))
                    }
                };
                Value::bool(fcmp(*pred, x, y))
            }

            InstKind::SExt(a) => {
                let width = int_result_width(inst)?;
                Value::Int(self.int_operand(program, a, "sext")?.sext(width))
            }
            InstKind::ZExt(a) => {
                let width = int_result_width(inst)?;
                Value::Int(self.int_operand(program, a, "zext")?.zext(width))
            }
            InstKind::Trunc(a) => {
                let width = int_result_width(inst)?;
                Value::Int(self.int_operand(program, a, "trunc")?.trunc(width))
            }
            InstKind::FPExt(a) => match (self.operand_value(program, a)?, &inst.ty) {
                (Value::F32(x), Ty::F64) => Value::F64(f64::from(x)),
                (Value::F32(x), Ty::F32) => Value::F32(x),
                (Value::F64(x), Ty::F64) => Value::F64(x),
                _ => {
                    return Err(EvalError::UnsupportedInstruction(
                        "invalid floating point extension".to_string(),
                    ))
                }
            },
            InstKind::FPTrunc(a) => match (self.operand_value(program, a)?, &inst.ty) {
                (Value::F64(x), Ty::F32) => Value::F32(x as f32),
                (Value::F64(x), Ty::F64) => Value::F64(x),
                (Value::F32(x), Ty::F32) => Value::F32(x),
                _ => {
                    return Err(EvalError::UnsupportedInstruction(
                        "invalid floating point truncation".to_string(),
                    ))
                }
            },
            InstKind::SIToFP(a) => {
                let x = self.int_operand(program, a, "sitofp")?;
                match &inst.ty {
                    Ty::F32 => Value::F32(x.to_f32_signed()),
                    Ty::F64 => Value::F64(x.to_f64_signed()),
                    _ => {
                        return Err(EvalError::UnsupportedInstruction(
                            "sitofp to non-float type".to_string(),
                        ))
                    }
                }
            }
            InstKind::UIToFP(a) => {
                let x = self.int_operand(program, a, "uitofp")?;
                match &inst.ty {
                    Ty::F32 => Value::F32(x.to_f32_unsigned()),
                    Ty::F64 => Value::F64(x.to_f64_unsigned()),
                    _ => {
                        return Err(EvalError::UnsupportedInstruction(
                            "uitofp to non-float type".to_string(),
                        ))
                    }
                }
            }
            InstKind::FPToSI(a) => {
                let width = int_result_width(inst)?;
                let x = self.float_operand(program, a, "fptosi")?;
                Value::Int(ApInt::from_f64_signed(width, x))
            }
            InstKind::FPToUI(a) => {
                let width = int_result_width(inst)?;
                let x = self.float_operand(program, a, "fptoui")?;
                Value::Int(ApInt::from_f64_unsigned(width, x))
            }
            InstKind::PtrToInt(a) | InstKind::IntToPtr(a) => {
                let x = self.int_operand(program, a, opcode_name(&inst.kind))?;
                Value::Int(ApInt::new(pointer_bits, x.as_u128()))
            }
            InstKind::Bitcast(a) => {
                let x = self.operand_value(program, a)?;
                bitcast(x, &inst.ty, pointer_bits)?
            }

            InstKind::AtomicRmw { op, address, value } => {
                let address = self.address_operand(program, address, "atomicrmw")?;
                let operand = self.int_operand(program, value, "atomicrmw")?;
                let old = self.memory.load(oracle.as_ref(), address, &inst.ty)?;
                let old_int = old.as_int().ok_or_else(|| {
                    EvalError::UnsupportedInstruction("atomicrmw on non-integer memory".to_string())
                })?;
                let new = match op {
                    RmwOp::Xchg => operand,
                    RmwOp::Add => old_int.wrapping_add(operand),
                    RmwOp::Sub => old_int.wrapping_sub(operand),
                    RmwOp::And => old_int.and(operand),
                    RmwOp::Nand => old_int.and(operand).not(),
                    RmwOp::Or => old_int.or(operand),
                    RmwOp::Xor => old_int.xor(operand),
                };
                self.memory
                    .store(oracle.as_ref(), address, &Value::Int(new), &inst.ty)?;
                old
            }
            InstKind::CmpXchg {
                address,
                expected,
                replacement,
                ty,
            } => {
                let address = self.address_operand(program, address, "cmpxchg")?;
                let expected = self.int_operand(program, expected, "cmpxchg")?;
                let replacement = self.operand_value(program, replacement)?;
                let old = self.memory.load(oracle.as_ref(), address, ty)?;
                let success = old.as_int().map(|v| v.bits() == expected.bits()).unwrap_or(false);
                if success {
                    self.memory.store(oracle.as_ref(), address, &replacement, ty)?;
                }
                Value::Aggregate(vec![old, Value::bool(success)])
            }

            InstKind::Call { callee, args } => {
                return self.process_call(program, inst, *callee, args, depth)
            }
            InstKind::Intrinsic { op, args } => {
                return self.process_intrinsic(program, func_id, inst, *op, args, cursor, depth)
            }
        };

        if !inst.ty.is_void() {
            self.frame.cache.insert(inst.id, value);
        }
        Ok(Control::Next)
    }

    fn int_binop(
        &mut self,
        program: &Program,
        kind: &InstKind,
        a: &Operand,
        b: &Operand,
        op: impl FnOnce(ApInt, ApInt) -> Result<ApInt, EvalError>,
    ) -> Result<Value, EvalError> {
        let x = self.int_operand(program, a, opcode_name(kind))?;
        let y = self.int_operand(program, b, opcode_name(kind))?;
        if x.width() != y.width() {
            return Err(EvalError::Malformed(format!(
                "operand width mismatch in {}",
                opcode_name(kind)
            )));
        }
        op(x, y).map(Value::Int)
    }

    fn float_binop(
        &mut self,
        program: &Program,
        kind: &InstKind,
        a: &Operand,
        b: &Operand,
        op: impl FnOnce(f64, f64) -> f64,
    ) -> Result<Value, EvalError> {
        let x = self.operand_value(program, a)?;
        let y = self.operand_value(program, b)?;
        match (x, y) {
            (Value::F32(x), Value::F32(y)) => Ok(Value::F32(op(f64::from(x), f64::from(y)) as f32)),
            (Value::F64(x), Value::F64(y)) => Ok(Value::F64(op(x, y))),
            _ => Err(EvalError::UnsupportedInstruction(format!(
                "{} on non-float operands",
                opcode_name(kind)
            ))),
        }
    }

    fn float_operand(
        &mut self,
        program: &Program,
        operand: &Operand,
        what: &str,
    ) -> Result<f64, EvalError> {
        match self.operand_value(program, operand)? {
            Value::F32(x) => Ok(f64::from(x)),
            Value::F64(x) => Ok(x),
            _ => Err(EvalError::UnsupportedInstruction(format!(
                "{} on non-float operand",
                what
            ))),
        }
    }

    /// Resolve a chain of array/struct indices into one accumulated byte
    /// offset. The first index scales whole pointees; the rest walk into the
    /// aggregate with the layout oracle's offsets.
    fn build_gep(
        &mut self,
        program: &Program,
        base: &Operand,
        pointee: &Ty,
        indices: &[Operand],
    ) -> Result<Value, EvalError> {
        let oracle = Arc::clone(&self.oracle);
        let base_addr = self.int_operand(program, base, "getelementptr")?;
        let mut iter = indices.iter();
        let first = iter.next().ok_or_else(|| {
            EvalError::Malformed("element address computation needs at least one index".to_string())
        })?;
        let first = self.int_operand(program, first, "getelementptr")?;
        let mut offset = first.as_u64().wrapping_mul(oracle.size_of(pointee));
        let mut ty = pointee.clone();
        for operand in iter {
            let index = self.int_operand(program, operand, "getelementptr")?.as_u64();
            let next = match &ty {
                Ty::Array(elem, _) => {
                    offset = offset.wrapping_add(index.wrapping_mul(oracle.size_of(elem)));
                    (**elem).clone()
                }
                Ty::Struct { fields, .. } => {
                    let field = fields.get(index as usize).cloned().ok_or_else(|| {
                        EvalError::Malformed(format!("struct index {} out of range", index))
                    })?;
                    let field_offset = oracle.field_offset(&ty, index as usize).ok_or_else(|| {
                        EvalError::Malformed(format!("struct index {} out of range", index))
                    })?;
                    offset = offset.wrapping_add(field_offset);
                    field
                }
                _ => {
                    return Err(EvalError::UnsupportedInstruction(
                        "getelementptr into non-aggregate type".to_string(),
                    ))
                }
            };
            ty = next;
        }
        Ok(Value::Int(ApInt::new(
            oracle.pointer_width(),
            base_addr.as_u128().wrapping_add(u128::from(offset)),
        )))
    }
}

fn jump(func: &Function, target: BlockId) -> Result<Cursor, EvalError> {
    func.block_index(target)
        .map(|block| Cursor { block, instr: 0 })
        .ok_or_else(|| EvalError::Malformed(format!("branch to unknown block bb{}", target)))
}

fn shift_amount(v: ApInt) -> u32 {
    v.as_u128().min(u128::from(u32::MAX)) as u32
}

fn int_result_width(inst: &Instruction) -> Result<u32, EvalError> {
    inst.ty.int_width().ok_or_else(|| {
        EvalError::UnsupportedInstruction(format!(
            "{} to non-integer type",
            opcode_name(&inst.kind)
        ))
    })
}

fn icmp(pred: IntPredicate, x: ApInt, y: ApInt) -> bool {
    match pred {
        IntPredicate::Eq => x.bits() == y.bits(),
        IntPredicate::Ne => x.bits() != y.bits(),
        IntPredicate::Ugt => x.ugt(y),
        IntPredicate::Uge => x.uge(y),
        IntPredicate::Ult => x.ult(y),
        IntPredicate::Ule => x.ule(y),
        IntPredicate::Sgt => x.sgt(y),
        IntPredicate::Sge => x.sge(y),
        IntPredicate::Slt => x.slt(y),
        IntPredicate::Sle => x.sle(y),
    }
}

/// Every ordered/unordered predicate implemented distinctly; "unordered"
/// holds when either operand is NaN.
fn fcmp(pred: FloatPredicate, x: f64, y: f64) -> bool {
    let unordered = x.is_nan() || y.is_nan();
    match pred {
        FloatPredicate::False => false,
        FloatPredicate::True => true,
        FloatPredicate::Ord => !unordered,
        FloatPredicate::Uno => unordered,
        FloatPredicate::Oeq => x == y,
        FloatPredicate::Ueq => unordered || x == y,
        FloatPredicate::Ogt => x > y,
        FloatPredicate::Ugt => unordered || x > y,
        FloatPredicate::Oge => x >= y,
        FloatPredicate::Uge => unordered || x >= y,
        FloatPredicate::Olt => x < y,
        FloatPredicate::Ult => unordered || x < y,
        FloatPredicate::Ole => x <= y,
        FloatPredicate::Ule => unordered || x <= y,
        FloatPredicate::One => x < y || x > y,
        FloatPredicate::Une => unordered || x < y || x > y,
    }
}

fn bitcast(value: Value, ty: &Ty, pointer_bits: u32) -> Result<Value, EvalError> {
    match (value, ty) {
        (Value::Int(v), Ty::F32) if v.width() == 32 => {
            Ok(Value::F32(f32::from_bits(v.as_u64() as u32)))
        }
        (Value::Int(v), Ty::F64) if v.width() == 64 => Ok(Value::F64(f64::from_bits(v.as_u64()))),
        (Value::F32(x), Ty::I32) => Ok(Value::int(32, u128::from(x.to_bits()))),
        (Value::F64(x), Ty::I64) => Ok(Value::int(64, u128::from(x.to_bits()))),
        (Value::Int(v), Ty::Ptr) => Ok(Value::Int(ApInt::new(pointer_bits, v.as_u128()))),
        (Value::Int(v), _) if ty.is_integer() => {
            let width = ty.int_width().expect("integer type has a width");
            Ok(Value::Int(ApInt::new(width, v.as_u128())))
        }
        _ => Err(EvalError::UnsupportedInstruction(
            "invalid bit reinterpretation cast".to_string(),
        )),
    }
}
