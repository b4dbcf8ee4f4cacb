use kiln_core::ir::BlockId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Everything that can stop an evaluation. Appending one of these to the
/// result's error list aborts the current top-level evaluation; the engine
/// never panics or invokes undefined behavior on malformed input programs.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum EvalError {
    #[error("executing unsupported instruction: {0}")]
    UnsupportedInstruction(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("executing unreachable instruction")]
    UnreachableExecuted,
    #[error("executing function \"{0}\" with no body")]
    CallToBodylessFunction(String),
    #[error("max call stack depth ({0}) reached")]
    CallDepthExceeded(usize),
    #[error("instruction budget ({0}) exhausted")]
    InstructionBudgetExceeded(u64),
    #[error("max data stack size ({0}) reached")]
    StackOverflow(usize),
    #[error("max globals segment size ({0}) reached")]
    GlobalsOverflow(usize),
    #[error("max heap size ({0}) reached")]
    HeapOverflow(usize),
    #[error("memory access out of bounds: address {address:#x}, size {size}")]
    OutOfBounds { address: u64, size: u64 },
    #[error("function pointers are not supported in constant data")]
    FunctionPointerUnsupported,
    #[error("returning a pointer from constant evaluation is not supported")]
    PointerReturnUnsupported,
    #[error("phi node has no incoming value for predecessor block bb{0}")]
    MalformedPhi(BlockId),
    #[error("coroutine handle {0} is invalid, destroyed or already completed")]
    InvalidCoroutine(u64),
    #[error("host function \"{name}\" requested abort: {message}")]
    HostAbortRequested { name: String, message: String },
    #[error("malformed program: {0}")]
    Malformed(String),
}

impl EvalError {
    /// The one condition callers are expected to branch on: the evaluated
    /// program asked to stop, as opposed to being diagnosed as invalid.
    pub fn is_abort(&self) -> bool {
        matches!(self, EvalError::HostAbortRequested { .. })
    }
}

/// Returned by a host callback to terminate the evaluation that invoked it.
/// Surfaces to the original caller as [`EvalError::HostAbortRequested`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostAbort {
    pub message: String,
}

impl HostAbort {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
