use std::collections::HashMap;
use std::sync::Arc;

use kiln_core::diagnostics::DiagnosticManager;
use kiln_core::ir::layout::LayoutOracle;
use kiln_core::ir::{ConstValue, FuncId, Function, Program, Ty, ValueId};
use serde::{Deserialize, Serialize};

use crate::error::{EvalError, HostAbort};

mod calls;
mod consts;
mod coroutine;
mod dispatch;
pub mod memory;
pub mod value;

pub use memory::{EngineLimits, HostMemory};

use coroutine::CoroutineTable;
use memory::Memory;
use value::Value;

const DIAGNOSTIC_CONTEXT: &str = "const-eval";

/// A function implemented by the embedder, registered by name and invocable
/// from interpreted code. Callbacks see argument [`Value`]s and a
/// range-checked read view of interpreter memory, never raw addresses.
pub trait HostFn: Send + Sync {
    fn call(&self, memory: &HostMemory<'_>, args: &[Value]) -> Result<Value, HostAbort>;
}

impl<F> HostFn for F
where
    F: Fn(&HostMemory<'_>, &[Value]) -> Result<Value, HostAbort> + Send + Sync,
{
    fn call(&self, memory: &HostMemory<'_>, args: &[Value]) -> Result<Value, HostAbort> {
        self(memory, args)
    }
}

/// Outcome of one top-level evaluation: either a value or the ordered list of
/// errors that stopped it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResult<T> {
    pub value: Option<T>,
    pub errors: Vec<EvalError>,
}

impl<T> EvalResult<T> {
    pub fn success(value: T) -> Self {
        Self {
            value: Some(value),
            errors: Vec::new(),
        }
    }

    pub fn failure(errors: Vec<EvalError>) -> Self {
        Self {
            value: None,
            errors,
        }
    }

    pub fn is_success(&self) -> bool {
        self.value.is_some() && self.errors.is_empty()
    }

    /// True when the evaluated program itself requested termination through a
    /// host callback, as opposed to being diagnosed as invalid.
    pub fn aborted(&self) -> bool {
        self.errors.iter().any(EvalError::is_abort)
    }

    pub fn into_result(self) -> Result<T, Vec<EvalError>> {
        match self.value {
            Some(value) if self.errors.is_empty() => Ok(value),
            _ => Err(self.errors),
        }
    }
}

/// Per-call evaluation state: the instruction result cache plus the coroutine
/// marker for frames whose locals must survive suspension.
#[derive(Debug, Default)]
pub(crate) struct Frame {
    pub cache: HashMap<ValueId, Value>,
    pub is_coroutine: bool,
    pub coroutine: Option<u64>,
}

/// Position of the next instruction to execute, as indices into the owning
/// function's block and instruction lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cursor {
    pub block: usize,
    pub instr: usize,
}

#[derive(Debug)]
pub(crate) enum BlockExit {
    Return(Value),
    Suspended,
}

#[derive(Debug)]
pub(crate) enum Control {
    Next,
    Suspend,
}

/// The compile-time execution engine: a small virtual machine over the
/// lowered SSA program representation, with its own sandboxed address space.
/// One instance serves one logical evaluation stream; concurrent evaluations
/// each need their own instance.
pub struct Interpreter {
    pub(crate) oracle: Arc<dyn LayoutOracle>,
    pub(crate) limits: EngineLimits,
    pub(crate) memory: Memory,
    pub(crate) const_addrs: HashMap<kiln_core::ir::GlobalId, u64>,
    pub(crate) host_fns: HashMap<String, Arc<dyn HostFn>>,
    pub(crate) coroutines: CoroutineTable,
    pub(crate) frame: Frame,
    pub(crate) retired: u64,
    diagnostics: Option<Arc<DiagnosticManager>>,
}

impl Interpreter {
    pub fn new(oracle: Arc<dyn LayoutOracle>) -> Self {
        let limits = EngineLimits::default();
        Self {
            oracle,
            limits,
            memory: Memory::new(limits),
            const_addrs: HashMap::new(),
            host_fns: HashMap::new(),
            coroutines: CoroutineTable::default(),
            frame: Frame::default(),
            retired: 0,
            diagnostics: None,
        }
    }

    pub fn with_limits(mut self, limits: EngineLimits) -> Self {
        self.limits = limits;
        self.memory = Memory::new(limits);
        self
    }

    pub fn with_diagnostics(mut self, manager: Arc<DiagnosticManager>) -> Self {
        self.diagnostics = Some(manager);
        self
    }

    pub fn register_host_fn(&mut self, name: impl Into<String>, function: Arc<dyn HostFn>) {
        self.host_fns.insert(name.into(), function);
    }

    /// Read raw bytes out of the engine's address space, range-checked.
    pub fn read_bytes(&self, address: u64, len: u64) -> Result<Vec<u8>, EvalError> {
        self.memory.read_bytes(address, len)
    }

    pub(crate) fn pointer_bits(&self) -> u32 {
        self.oracle.pointer_width()
    }

    /// Evaluate a call whose arguments are compile-time constants and express
    /// the result back in the constant representation. All engine state is
    /// discarded afterwards.
    pub fn evaluate_const(
        &mut self,
        program: &Program,
        func_id: FuncId,
        args: &[ConstValue],
    ) -> EvalResult<ConstValue> {
        let result = match self.evaluate_const_inner(program, func_id, args) {
            Ok(value) => EvalResult::success(value),
            Err(error) => {
                self.report(&error);
                EvalResult::failure(vec![error])
            }
        };
        self.frame = Frame::default();
        self.memory.reset_all();
        self.const_addrs.clear();
        self.coroutines.clear();
        result
    }

    fn evaluate_const_inner(
        &mut self,
        program: &Program,
        func_id: FuncId,
        args: &[ConstValue],
    ) -> Result<ConstValue, EvalError> {
        let func = self.resolve_function(program, func_id)?;
        tracing::debug!(target: DIAGNOSTIC_CONTEXT, "const-evaluating @{}", func.name);

        self.memory.reset_stack();
        self.retired = 0;

        if args.len() != func.sig.params.len() {
            return Err(EvalError::Malformed(format!(
                "@{} expects {} arguments, got {}",
                func.name,
                func.sig.params.len(),
                args.len()
            )));
        }

        let pointer_bits = self.pointer_bits();
        let mut frame = Frame {
            is_coroutine: func.is_coroutine,
            ..Frame::default()
        };

        let mut params = func.params.iter();
        let mut sret_ptr = 0u64;
        if let Some(sret_ty) = &func.sig.sret {
            let param = params.next().ok_or_else(|| {
                EvalError::Malformed(format!("@{} declares sret but has no parameters", func.name))
            })?;
            sret_ptr = self.memory.alloc_stack(self.oracle.size_of(sret_ty))?;
            frame
                .cache
                .insert(param.id, Value::int(pointer_bits, u128::from(sret_ptr)));
        }
        for (param, arg) in params.zip(args) {
            let value = if param.ty.is_pointer() {
                // By-reference argument: the constant is materialized into the
                // globals segment and its address passed instead.
                let address = self.materialize_const(program, arg)?;
                Value::int(pointer_bits, u128::from(address))
            } else {
                if param.ty != arg.ty() {
                    return Err(EvalError::Malformed(format!(
                        "argument type mismatch for @{}: expected {}, got {}",
                        func.name,
                        param.ty,
                        arg.ty()
                    )));
                }
                self.const_to_value(program, arg)?
            };
            frame.cache.insert(param.id, value);
        }

        self.frame = frame;
        let exit = self.call_function(program, func, func_id, 0)?;
        let result = match exit {
            BlockExit::Return(value) => value,
            BlockExit::Suspended => self.suspended_value(),
        };

        let result_ty = func.sig.result_ty();
        if result_ty.is_void() {
            Ok(ConstValue::Undef(Ty::Void))
        } else if func.sig.sret.is_some() {
            self.read_const_from_memory(result_ty, sret_ptr)
        } else if result_ty.is_pointer() {
            Err(EvalError::PointerReturnUnsupported)
        } else {
            self.value_to_const(&result, result_ty)
        }
    }

    /// Evaluate an arbitrary call with plain runtime values. Global and heap
    /// state persist across repeated calls in this mode; the local stack and
    /// the instruction caches are discarded after each call.
    pub fn evaluate_generic(
        &mut self,
        program: &Program,
        func_id: FuncId,
        args: Vec<Value>,
    ) -> EvalResult<Value> {
        let result = match self.evaluate_generic_inner(program, func_id, args) {
            Ok(value) => EvalResult::success(value),
            Err(error) => {
                self.report(&error);
                EvalResult::failure(vec![error])
            }
        };
        // Preserve globals, heap and materialized constants here.
        self.frame = Frame::default();
        self.memory.reset_stack();
        result
    }

    fn evaluate_generic_inner(
        &mut self,
        program: &Program,
        func_id: FuncId,
        args: Vec<Value>,
    ) -> Result<Value, EvalError> {
        let func = self.resolve_function(program, func_id)?;
        tracing::debug!(target: DIAGNOSTIC_CONTEXT, "interpreting @{}", func.name);

        self.memory.reset_stack();
        self.retired = 0;

        if args.len() != func.params.len() {
            return Err(EvalError::Malformed(format!(
                "@{} expects {} arguments, got {}",
                func.name,
                func.params.len(),
                args.len()
            )));
        }

        let mut frame = Frame {
            is_coroutine: func.is_coroutine,
            ..Frame::default()
        };
        for (param, arg) in func.params.iter().zip(args) {
            if param.ty.is_pointer() {
                return Err(EvalError::Malformed(format!(
                    "pointer parameter %{} of @{} is not supported in generic evaluation",
                    param.id, func.name
                )));
            }
            frame.cache.insert(param.id, arg);
        }

        self.frame = frame;
        let exit = self.call_function(program, func, func_id, 0)?;
        Ok(match exit {
            BlockExit::Return(value) => value,
            BlockExit::Suspended => self.suspended_value(),
        })
    }

    fn suspended_value(&self) -> Value {
        match self.frame.coroutine {
            Some(handle) => Value::int(self.pointer_bits(), u128::from(handle)),
            None => Value::Unit,
        }
    }

    fn resolve_function<'p>(
        &self,
        program: &'p Program,
        func_id: FuncId,
    ) -> Result<&'p Function, EvalError> {
        program
            .function(func_id)
            .ok_or_else(|| EvalError::Malformed(format!("unknown function @f{}", func_id)))
    }

    fn report(&self, error: &EvalError) {
        if let Some(manager) = &self.diagnostics {
            kiln_core::emit_error!(manager, DIAGNOSTIC_CONTEXT, "{}", error);
        }
    }
}
