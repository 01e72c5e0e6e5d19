//! regvm core: the register VM model consumed and produced by the JIT.
//!
//! - [`bytecode`]: instruction format and register-type encoding
//! - [`value`]: tagged value records, return descriptors, string handles
//! - [`function`]: function descriptors, constant pools, native arguments
//! - [`frame`]: register frames and their layouts
//! - [`context`]: the execution context and the unwind channel
//! - [`abort`]: VM aborts

pub mod abort;
pub mod bytecode;
pub mod context;
pub mod frame;
pub mod function;
pub mod value;

pub use abort::{AbortKind, VmAbort};
pub use bytecode::{regt, Instruction, Modifier, OpCode, RegType, ValueKind, RET_FINAL};
pub use context::{CycleClock, ExecContext, FrameStats, CALL_UNWOUND};
pub use frame::{Bank, FrameLayout, RegisterCounts, VmFrame};
pub use function::{
    ArgValue, Constant, ConstantPool, FunctionBody, NativeArgs, NativeFn, PointerConst,
    ScriptEntry, ScriptProto, VmFunction, FUNC_NATIVE,
};
pub use value::{float_type, ReturnBuffer, VmReturn, VmString, VmValue};
