pub mod engine;
pub mod error;

pub use engine::{EngineLimits, EvalResult, HostFn, HostMemory, Interpreter};
pub use engine::value::{ApInt, Value};
pub use error::{EvalError, HostAbort};
