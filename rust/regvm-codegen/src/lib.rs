//! regvm native code generation via Cranelift.
//!
//! Compiles the call boundary of register bytecode: parameter staging, call
//! dispatch to script or native callees, return marshaling, tail calls and
//! abort propagation through the `CALL_UNWOUND` result code.

pub mod abi;
pub mod error;
pub mod jit;
pub(crate) mod lower;
pub mod marshal;
pub(crate) mod trampoline;

pub use error::{CodegenError, MarshalError};
pub use jit::{CodegenSettings, JitEngine, JitStats, OptLevel};
pub use marshal::{
    plan_function, CallKind, CallPlan, Callee, Dispatch, FunctionPlan, MarshalState, ParamSource,
    RetPlan, ReturnDescriptor, StagedParam, StagingBuffer, Step,
};
