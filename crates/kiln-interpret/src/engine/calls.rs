use kiln_core::ir::pretty::intrinsic_name;
use kiln_core::ir::{FuncId, Instruction, IntrinsicOp, Operand, Program};

use crate::engine::memory::HostMemory;
use crate::engine::value::{ApInt, Value};
use crate::engine::{BlockExit, Control, Cursor, Frame, Interpreter};
use crate::error::EvalError;

/// Bytes reserved in front of every heap allocation to record its size, so
/// reallocation can recover the old block length.
const HEAP_HEADER_SIZE: u64 = 8;

impl Interpreter {
    /// Resolve and execute a call. Bodyless callees are looked up in the host
    /// callback registry by name; anything else pushes a fresh frame and
    /// dispatches the body recursively.
    pub(crate) fn process_call(
        &mut self,
        program: &Program,
        inst: &Instruction,
        callee: FuncId,
        args: &[Operand],
        depth: usize,
    ) -> Result<Control, EvalError> {
        let func = program
            .function(callee)
            .ok_or_else(|| EvalError::Malformed(format!("call to unknown function @f{}", callee)))?;

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.operand_value(program, arg)?);
        }

        if func.blocks.is_empty() {
            if let Some(host) = self.host_fns.get(&func.name).cloned() {
                let view = HostMemory::new(&self.memory);
                let result = host.call(&view, &values).map_err(|abort| {
                    EvalError::HostAbortRequested {
                        name: func.name.clone(),
                        message: abort.message,
                    }
                })?;
                if !inst.ty.is_void() {
                    self.frame.cache.insert(inst.id, result);
                }
                return Ok(Control::Next);
            }
            return Err(EvalError::CallToBodylessFunction(func.name.clone()));
        }

        if values.len() != func.params.len() {
            return Err(EvalError::Malformed(format!(
                "@{} expects {} arguments, got {}",
                func.name,
                func.params.len(),
                values.len()
            )));
        }

        let mark = self.memory.stack_mark();
        let mut callee_frame = Frame {
            cache: func
                .params
                .iter()
                .map(|p| p.id)
                .zip(values)
                .collect(),
            is_coroutine: func.is_coroutine,
            coroutine: None,
        };

        std::mem::swap(&mut self.frame, &mut callee_frame);
        let result = self.call_function(program, func, callee, depth + 1);
        std::mem::swap(&mut self.frame, &mut callee_frame);
        let exit = result?;

        // Reclaim byval temporaries the callee left on the local stack.
        self.memory.stack_truncate(mark);

        let value = match exit {
            BlockExit::Return(value) => value,
            BlockExit::Suspended => match callee_frame.coroutine {
                Some(handle) => Value::int(self.pointer_bits(), u128::from(handle)),
                None => Value::Unit,
            },
        };
        if !inst.ty.is_void() {
            self.frame.cache.insert(inst.id, value);
        }
        Ok(Control::Next)
    }

    /// Built-in operations serviced inline, without a new call frame.
    pub(crate) fn process_intrinsic(
        &mut self,
        program: &Program,
        func_id: FuncId,
        inst: &Instruction,
        op: IntrinsicOp,
        args: &[Operand],
        cursor: Cursor,
        depth: usize,
    ) -> Result<Control, EvalError> {
        let value = match op {
            IntrinsicOp::MemCopy | IntrinsicOp::MemMove => {
                let dst = self.intrinsic_address(program, args, 0, op)?;
                let src = self.intrinsic_address(program, args, 1, op)?;
                let len = self.intrinsic_address(program, args, 2, op)?;
                self.memory.copy(dst, src, len)?;
                Value::Unit
            }

            IntrinsicOp::SAddOverflow => self.overflow_intrinsic(program, args, op, ApInt::sadd_ov)?,
            IntrinsicOp::UAddOverflow => self.overflow_intrinsic(program, args, op, ApInt::uadd_ov)?,
            IntrinsicOp::SSubOverflow => self.overflow_intrinsic(program, args, op, ApInt::ssub_ov)?,
            IntrinsicOp::USubOverflow => self.overflow_intrinsic(program, args, op, ApInt::usub_ov)?,
            IntrinsicOp::SMulOverflow => self.overflow_intrinsic(program, args, op, ApInt::smul_ov)?,
            IntrinsicOp::UMulOverflow => self.overflow_intrinsic(program, args, op, ApInt::umul_ov)?,

            IntrinsicOp::StackSave => {
                Value::int(self.pointer_bits(), self.memory.stack_mark() as u128)
            }
            IntrinsicOp::StackRestore => {
                let mark = self.intrinsic_address(program, args, 0, op)?;
                self.memory.stack_truncate(mark as usize);
                Value::Unit
            }

            IntrinsicOp::Malloc => {
                let size = self.intrinsic_address(program, args, 0, op)?;
                let address = self.heap_alloc(size)?;
                Value::int(self.pointer_bits(), u128::from(address))
            }
            IntrinsicOp::Realloc => {
                let address = self.intrinsic_address(program, args, 0, op)?;
                let size = self.intrinsic_address(program, args, 1, op)?;
                let new_address = self.heap_realloc(address, size)?;
                Value::int(self.pointer_bits(), u128::from(new_address))
            }
            // The heap is managed as a bump stack; freeing is a no-op.
            IntrinsicOp::Free => Value::Unit,

            IntrinsicOp::CoroCreate => {
                let promise = match args.first() {
                    Some(operand) => self.operand_value(program, operand)?,
                    None => Value::Unit,
                };
                self.coro_create(func_id, promise)?
            }
            IntrinsicOp::CoroSuspend => return self.coro_suspend(cursor),
            IntrinsicOp::CoroResume => {
                let handle = self.intrinsic_address(program, args, 0, op)?;
                self.coro_resume(program, handle, depth)?;
                Value::Unit
            }
            IntrinsicOp::CoroDestroy => {
                let handle = self.intrinsic_address(program, args, 0, op)?;
                self.coro_destroy(handle)?;
                Value::Unit
            }
            IntrinsicOp::CoroDone => {
                let handle = self.intrinsic_address(program, args, 0, op)?;
                self.coro_done(handle)?
            }
            IntrinsicOp::CoroPromise => {
                let handle = self.intrinsic_address(program, args, 0, op)?;
                self.coro_promise(handle)?
            }
        };

        if !inst.ty.is_void() {
            self.frame.cache.insert(inst.id, value);
        }
        Ok(Control::Next)
    }

    fn intrinsic_arg<'a>(
        &self,
        args: &'a [Operand],
        index: usize,
        op: IntrinsicOp,
    ) -> Result<&'a Operand, EvalError> {
        args.get(index).ok_or_else(|| {
            EvalError::Malformed(format!(
                "intrinsic {} expects at least {} arguments",
                intrinsic_name(op),
                index + 1
            ))
        })
    }

    fn intrinsic_address(
        &mut self,
        program: &Program,
        args: &[Operand],
        index: usize,
        op: IntrinsicOp,
    ) -> Result<u64, EvalError> {
        let operand = self.intrinsic_arg(args, index, op)?.clone();
        self.address_operand(program, &operand, intrinsic_name(op))
    }

    fn overflow_intrinsic(
        &mut self,
        program: &Program,
        args: &[Operand],
        op: IntrinsicOp,
        apply: impl FnOnce(ApInt, ApInt) -> (ApInt, bool),
    ) -> Result<Value, EvalError> {
        let a = self.intrinsic_arg(args, 0, op)?.clone();
        let b = self.intrinsic_arg(args, 1, op)?.clone();
        let x = self.int_operand(program, &a, intrinsic_name(op))?;
        let y = self.int_operand(program, &b, intrinsic_name(op))?;
        if x.width() != y.width() {
            return Err(EvalError::Malformed(format!(
                "operand width mismatch in {}",
                intrinsic_name(op)
            )));
        }
        let (result, overflowed) = apply(x, y);
        Ok(Value::Aggregate(vec![
            Value::Int(result),
            Value::bool(overflowed),
        ]))
    }

    fn heap_alloc(&mut self, size: u64) -> Result<u64, EvalError> {
        let base = self.memory.alloc_heap(size + HEAP_HEADER_SIZE)?;
        let header = size.to_le_bytes();
        self.memory.write_bytes(base, &header)?;
        Ok(base + HEAP_HEADER_SIZE)
    }

    fn heap_realloc(&mut self, address: u64, size: u64) -> Result<u64, EvalError> {
        let header_addr = address
            .checked_sub(HEAP_HEADER_SIZE)
            .ok_or(EvalError::OutOfBounds { address, size: 0 })?;
        let header = self.memory.read_bytes(header_addr, HEAP_HEADER_SIZE)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&header);
        let prev_size = u64::from_le_bytes(buf);

        // Shrinking reuses the existing block.
        if size <= prev_size {
            return Ok(address);
        }

        let new_address = self.heap_alloc(size)?;
        let data = self.memory.read_bytes(address, prev_size)?;
        self.memory.write_bytes(new_address, &data)?;
        Ok(new_address)
    }
}
