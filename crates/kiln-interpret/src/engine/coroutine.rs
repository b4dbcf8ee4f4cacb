use std::collections::HashMap;

use kiln_core::ir::{FuncId, Program, ValueId};

use crate::engine::value::Value;
use crate::engine::{Control, Cursor, Frame, Interpreter};
use crate::error::EvalError;

/// Persisted evaluation state of one suspended coroutine. Locals allocated by
/// a coroutine frame live on the heap, so the saved result cache plus the
/// suspend cursor is everything needed to continue.
#[derive(Debug)]
pub(crate) struct CoroutineState {
    pub func: FuncId,
    pub cache: HashMap<ValueId, Value>,
    pub resume_at: Cursor,
    pub promise: Value,
    pub done: bool,
}

/// Table of live coroutines keyed by monotonically increasing opaque handle.
/// The handle, not the state, is what crosses the value boundary.
#[derive(Debug, Default)]
pub(crate) struct CoroutineTable {
    states: HashMap<u64, CoroutineState>,
    next_handle: u64,
}

impl CoroutineTable {
    fn create(&mut self, func: FuncId, promise: Value) -> u64 {
        self.next_handle += 1;
        let handle = self.next_handle;
        self.states.insert(
            handle,
            CoroutineState {
                func,
                cache: HashMap::new(),
                resume_at: Cursor { block: 0, instr: 0 },
                promise,
                done: false,
            },
        );
        handle
    }

    fn get(&self, handle: u64) -> Option<&CoroutineState> {
        self.states.get(&handle)
    }

    fn get_mut(&mut self, handle: u64) -> Option<&mut CoroutineState> {
        self.states.get_mut(&handle)
    }

    fn remove(&mut self, handle: u64) -> Option<CoroutineState> {
        self.states.remove(&handle)
    }

    pub fn clear(&mut self) {
        self.states.clear();
        self.next_handle = 0;
    }
}

impl Interpreter {
    /// Register the active frame as a coroutine and hand back its handle as a
    /// pointer-width integer.
    pub(crate) fn coro_create(
        &mut self,
        func_id: FuncId,
        promise: Value,
    ) -> Result<Value, EvalError> {
        let handle = self.coroutines.create(func_id, promise);
        self.frame.coroutine = Some(handle);
        self.frame.is_coroutine = true;
        tracing::debug!("created coroutine #{}", handle);
        Ok(Value::int(self.pointer_bits(), u128::from(handle)))
    }

    /// Persist the active frame into the coroutine state and unwind the
    /// activation back to the resumer. Execution continues at the instruction
    /// after the suspend point on the next resume.
    pub(crate) fn coro_suspend(&mut self, cursor: Cursor) -> Result<Control, EvalError> {
        let handle = self
            .frame
            .coroutine
            .ok_or_else(|| EvalError::Malformed("suspend outside a coroutine".to_string()))?;
        let state = self
            .coroutines
            .get_mut(handle)
            .ok_or(EvalError::InvalidCoroutine(handle))?;
        state.cache = self.frame.cache.clone();
        state.resume_at = Cursor {
            block: cursor.block,
            instr: cursor.instr + 1,
        };
        Ok(Control::Suspend)
    }

    /// Re-activate the persisted cache and continue dispatch from the saved
    /// suspend point. Resuming a destroyed or completed coroutine is an
    /// error.
    pub(crate) fn coro_resume(
        &mut self,
        program: &Program,
        handle: u64,
        depth: usize,
    ) -> Result<(), EvalError> {
        if depth + 1 > self.limits.max_call_depth {
            return Err(EvalError::CallDepthExceeded(self.limits.max_call_depth));
        }
        let (func_id, cache, resume_at) = {
            let state = self
                .coroutines
                .get(handle)
                .ok_or(EvalError::InvalidCoroutine(handle))?;
            if state.done {
                return Err(EvalError::InvalidCoroutine(handle));
            }
            (state.func, state.cache.clone(), state.resume_at)
        };
        let func = program
            .function(func_id)
            .ok_or_else(|| EvalError::Malformed(format!("unknown function @f{}", func_id)))?;
        tracing::debug!("resuming coroutine #{} in @{}", handle, func.name);

        let mut frame = Frame {
            cache,
            is_coroutine: true,
            coroutine: Some(handle),
        };
        std::mem::swap(&mut self.frame, &mut frame);
        let result = self.run_blocks(program, func, func_id, resume_at, depth + 1);
        std::mem::swap(&mut self.frame, &mut frame);
        result.map(|_| ())
    }

    /// Record completion: the returned value becomes the stored promise.
    pub(crate) fn finish_coroutine(&mut self, handle: u64, value: Value) -> Result<(), EvalError> {
        let state = self
            .coroutines
            .get_mut(handle)
            .ok_or(EvalError::InvalidCoroutine(handle))?;
        if !value.is_unit() {
            state.promise = value;
        }
        state.done = true;
        Ok(())
    }

    pub(crate) fn coro_destroy(&mut self, handle: u64) -> Result<(), EvalError> {
        self.coroutines
            .remove(handle)
            .map(|_| ())
            .ok_or(EvalError::InvalidCoroutine(handle))
    }

    pub(crate) fn coro_done(&mut self, handle: u64) -> Result<Value, EvalError> {
        let state = self
            .coroutines
            .get(handle)
            .ok_or(EvalError::InvalidCoroutine(handle))?;
        Ok(Value::bool(state.done))
    }

    pub(crate) fn coro_promise(&mut self, handle: u64) -> Result<Value, EvalError> {
        let state = self
            .coroutines
            .get(handle)
            .ok_or(EvalError::InvalidCoroutine(handle))?;
        Ok(state.promise.clone())
    }
}
