//! Runtime helpers called from generated code.
//!
//! Each helper is registered as a JIT symbol and imported into every compiled
//! function. None of them lets a panic or an abort escape into generated
//! code: failures are parked in the context and reported through the
//! [`CALL_UNWOUND`] result code.

use std::slice;

use cranelift_codegen::ir::{Function, Signature, Type};
use cranelift_codegen::isa::CallConv;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};

use regvm_core::{
    AbortKind, ExecContext, VmAbort, VmFrame, VmFunction, VmReturn, VmString, VmValue,
    CALL_UNWOUND,
};

use crate::abi;
use crate::error::CodegenError;
use crate::lower::HelperRefs;

const PUSH_FRAME: &str = "regvm_push_frame";
const POP_FRAME: &str = "regvm_pop_frame";
const UNWIND_FRAME: &str = "regvm_unwind_frame";
const NATIVE_CALL: &str = "regvm_native_call";
const NULL_CALLEE: &str = "regvm_null_callee";
const STRING_ASSIGN: &str = "regvm_string_assign";

/// Register the helper addresses with the JIT linker.
pub(crate) fn register_symbols(builder: &mut JITBuilder) {
    builder.symbol(PUSH_FRAME, push_frame as *const u8);
    builder.symbol(POP_FRAME, pop_frame as *const u8);
    builder.symbol(UNWIND_FRAME, unwind_frame as *const u8);
    builder.symbol(NATIVE_CALL, native_call as *const u8);
    builder.symbol(NULL_CALLEE, null_callee as *const u8);
    builder.symbol(STRING_ASSIGN, string_assign as *const u8);
}

/// Helper imports declared once per module.
pub(crate) struct RuntimeHelpers {
    push_frame: FuncId,
    pop_frame: FuncId,
    unwind_frame: FuncId,
    native_call: FuncId,
    null_callee: FuncId,
    string_assign: FuncId,
}

impl RuntimeHelpers {
    pub(crate) fn declare(module: &mut JITModule) -> Result<Self, CodegenError> {
        let cc: CallConv = module.isa().default_call_conv();
        let ptr: Type = module.isa().pointer_type();
        let mut import = |name: &str, sig: Signature| {
            module
                .declare_function(name, Linkage::Import, &sig)
                .map_err(|e| CodegenError::Module(format!("declare_function({name}): {e}")))
        };
        Ok(Self {
            push_frame: import(PUSH_FRAME, abi::push_frame(cc, ptr))?,
            pop_frame: import(POP_FRAME, abi::pop_frame(cc, ptr))?,
            unwind_frame: import(UNWIND_FRAME, abi::unwind_frame(cc, ptr))?,
            native_call: import(NATIVE_CALL, abi::script_entry(cc, ptr))?,
            null_callee: import(NULL_CALLEE, abi::null_callee(cc, ptr))?,
            string_assign: import(STRING_ASSIGN, abi::string_assign(cc, ptr))?,
        })
    }

    /// Import every helper into `func`.
    pub(crate) fn refs(&self, module: &mut JITModule, func: &mut Function) -> HelperRefs {
        HelperRefs {
            push_frame: module.declare_func_in_func(self.push_frame, func),
            pop_frame: module.declare_func_in_func(self.pop_frame, func),
            unwind_frame: module.declare_func_in_func(self.unwind_frame, func),
            native_call: module.declare_func_in_func(self.native_call, func),
            null_callee: module.declare_func_in_func(self.null_callee, func),
            string_assign: module.declare_func_in_func(self.string_assign, func),
        }
    }
}

unsafe fn args<'a>(params: *const VmValue, count: i32) -> &'a [VmValue] {
    if params.is_null() || count <= 0 {
        &[]
    } else {
        slice::from_raw_parts(params, count as usize)
    }
}

unsafe fn returns<'a>(ret: *mut VmReturn, count: i32) -> &'a mut [VmReturn] {
    if ret.is_null() || count <= 0 {
        &mut []
    } else {
        slice::from_raw_parts_mut(ret, count as usize)
    }
}

/// Allocate the frame of a compiled function and fill its parameters.
/// Returns null with an abort pending on failure.
unsafe extern "C" fn push_frame(
    ctx: *mut ExecContext,
    func: *const VmFunction,
    params: *const VmValue,
    numparams: i32,
    regs: i64,
    caps: i64,
) -> *mut VmFrame {
    let (ctx, func) = (&mut *ctx, &*func);
    let layout = abi::unpack_layout(regs, caps);
    match ctx.push_frame(&layout, args(params, numparams)) {
        Ok(frame) => frame,
        Err(mut abort) => {
            abort.push_frame(func.name());
            ctx.raise(abort);
            std::ptr::null_mut()
        }
    }
}

unsafe extern "C" fn pop_frame(ctx: *mut ExecContext) {
    (*ctx).pop_frame();
}

/// Pop the frame of a function an abort is unwinding through.
unsafe extern "C" fn unwind_frame(ctx: *mut ExecContext, func: *const VmFunction) {
    let (ctx, func) = (&mut *ctx, &*func);
    ctx.pop_frame();
    let name = func.name();
    match ctx.take_exception() {
        Some(mut abort) => {
            abort.push_frame(name);
            ctx.raise(abort);
        }
        None => {
            tracing::error!(function = name, "unwinding without a pending abort");
            ctx.raise(VmAbort::new(
                AbortKind::Other,
                format!("{name}: callee unwound without an abort"),
            ));
        }
    }
}

/// Call a host function on behalf of generated code.
unsafe extern "C" fn native_call(
    ctx: *mut ExecContext,
    func: *const VmFunction,
    params: *const VmValue,
    numparams: i32,
    ret: *mut VmReturn,
    numret: i32,
) -> i32 {
    let (ctx, func) = (&mut *ctx, &*func);
    match ctx.call_native(func, args(params, numparams), returns(ret, numret)) {
        Ok(n) => n,
        Err(abort) => {
            ctx.raise(abort);
            CALL_UNWOUND
        }
    }
}

unsafe extern "C" fn null_callee(ctx: *mut ExecContext) -> i32 {
    (*ctx).raise(VmAbort::new(
        AbortKind::NullPointer,
        "call through a null function pointer",
    ));
    CALL_UNWOUND
}

unsafe extern "C" fn string_assign(dst: *mut VmString, src: *const VmString) {
    *dst = (*src).clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use regvm_core::{RegType, ReturnBuffer, ScriptProto};

    #[test]
    fn native_call_parks_aborts() {
        let f = VmFunction::native("Native.Fail", |_, _| {
            Err(VmAbort::new(AbortKind::BadArgument, "boom"))
        });
        let mut ctx = ExecContext::new();
        let r = unsafe { native_call(&mut ctx, &f, std::ptr::null(), 0, std::ptr::null_mut(), 0) };
        assert_eq!(r, CALL_UNWOUND);
        let abort = ctx.take_exception().unwrap();
        assert_eq!(abort.stacktrace, "boom\nCalled from Native.Fail\n");
    }

    #[test]
    fn native_call_passes_returns() {
        let f = VmFunction::native("Native.Seven", |_, rets| {
            rets[0].set_int(7);
            Ok(1)
        });
        let mut ctx = ExecContext::new();
        let mut out = ReturnBuffer::new(&[RegType::INT]);
        let rets = out.descriptors_mut();
        let r = unsafe { native_call(&mut ctx, &f, std::ptr::null(), 0, rets.as_mut_ptr(), 1) };
        assert_eq!(r, 1);
        assert_eq!(out.int(0), 7);
    }

    #[test]
    fn failed_push_returns_null() {
        let f = VmFunction::script("Script.Tiny", ScriptProto::default());
        let mut ctx = ExecContext::new();
        let params = [VmValue::int(1)];
        let (regs, caps) = abi::pack_layout(&Default::default());
        let frame = unsafe { push_frame(&mut ctx, &f, params.as_ptr(), 1, regs, caps) };
        assert!(frame.is_null());
        assert_eq!(ctx.depth(), 0);
        let abort = ctx.take_exception().unwrap();
        assert_eq!(abort.kind, AbortKind::TooManyParameters);
        assert!(abort.stacktrace.ends_with("Called from Script.Tiny\n"));
    }

    #[test]
    fn unwind_annotates_pending_abort() {
        let f = VmFunction::script("Script.Outer", ScriptProto::default());
        let mut ctx = ExecContext::new();
        ctx.push_frame(&Default::default(), &[]).unwrap();
        ctx.raise(VmAbort::new(AbortKind::Other, "inner"));
        unsafe { unwind_frame(&mut ctx, &f) };
        assert_eq!(ctx.depth(), 0);
        assert_eq!(
            ctx.exception().map(|a| a.stacktrace.as_str()),
            Some("inner\nCalled from Script.Outer\n")
        );
    }

    #[test]
    fn string_assign_clones_handle() {
        let src = VmString::new("copied");
        let mut dst = VmString::default();
        unsafe { string_assign(&mut dst, &src) };
        assert_eq!(dst, src);
    }
}
