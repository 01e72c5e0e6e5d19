//! Calling convention of generated code.
//!
//! | function         | params                                        | returns |
//! |------------------|-----------------------------------------------|---------|
//! | script entry     | ctx, callee, params, numparams, ret, numret   | i32     |
//! | native_call      | ctx, callee, params, numparams, ret, numret   | i32     |
//! | push_frame       | ctx, callee, params, numparams, regs, caps    | frame   |
//! | pop_frame        | ctx                                           | -       |
//! | unwind_frame     | ctx, callee                                   | -       |
//! | null_callee      | ctx                                           | i32     |
//! | string_assign    | dst, src                                      | -       |
//!
//! `regs` and `caps` are a [`FrameLayout`] packed into two 64-bit
//! immediates, so compiled code carries no pointer into engine memory.

use cranelift_codegen::ir::{types, AbiParam, Signature, Type};
use cranelift_codegen::isa::CallConv;

use regvm_core::{
    Bank, ExecContext, FrameLayout, RegisterCounts, VmFrame, VmFunction, VmReturn, VmValue,
};

/// Byte offsets read and written by generated code.
pub mod offsets {
    use super::*;

    pub const CALL_COUNT: i32 = ExecContext::CALL_COUNT_OFFSET as i32;
    pub const FUNC_FLAGS: i32 = VmFunction::FLAGS_OFFSET as i32;
    pub const FUNC_SCRIPT_CALL: i32 = VmFunction::SCRIPT_CALL_OFFSET as i32;
    pub const VALUE_PAYLOAD: i32 = VmValue::PAYLOAD_OFFSET as i32;
    pub const VALUE_TAG: i32 = VmValue::TAG_OFFSET as i32;
    pub const RETURN_LOCATION: i32 = VmReturn::LOCATION_OFFSET as i32;
    pub const RETURN_REG_TYPE: i32 = VmReturn::REG_TYPE_OFFSET as i32;
    pub const FRAME_PARAMS: i32 = VmFrame::PARAMS_OFFSET as i32;
    pub const FRAME_RETURNS: i32 = VmFrame::RETURNS_OFFSET as i32;

    pub fn frame_bank(bank: Bank) -> i32 {
        VmFrame::bank_offset(bank) as i32
    }
}

pub const VALUE_SIZE: i64 = VmValue::SIZE as i64;
pub const RETURN_SIZE: i64 = VmReturn::SIZE as i64;

/// Clif type of a register held in a variable. Strings stay in the frame.
pub fn register_type(bank: Bank, ptr: Type) -> Option<Type> {
    match bank {
        Bank::Int => Some(types::I32),
        Bank::Float => Some(types::F64),
        Bank::Pointer => Some(ptr),
        Bank::String => None,
    }
}

fn signature(call_conv: CallConv, params: &[Type], returns: &[Type]) -> Signature {
    let mut sig = Signature::new(call_conv);
    sig.params.extend(params.iter().map(|&t| AbiParam::new(t)));
    sig.returns.extend(returns.iter().map(|&t| AbiParam::new(t)));
    sig
}

/// Script entry points and the native-call trampoline.
pub fn script_entry(call_conv: CallConv, ptr: Type) -> Signature {
    signature(
        call_conv,
        &[ptr, ptr, ptr, types::I32, ptr, types::I32],
        &[types::I32],
    )
}

pub fn push_frame(call_conv: CallConv, ptr: Type) -> Signature {
    signature(
        call_conv,
        &[ptr, ptr, ptr, types::I32, types::I64, types::I64],
        &[ptr],
    )
}

pub fn pop_frame(call_conv: CallConv, ptr: Type) -> Signature {
    signature(call_conv, &[ptr], &[])
}

pub fn unwind_frame(call_conv: CallConv, ptr: Type) -> Signature {
    signature(call_conv, &[ptr, ptr], &[])
}

pub fn null_callee(call_conv: CallConv, ptr: Type) -> Signature {
    signature(call_conv, &[ptr], &[types::I32])
}

pub fn string_assign(call_conv: CallConv, ptr: Type) -> Signature {
    signature(call_conv, &[ptr, ptr], &[])
}

/// Pack a layout into the two immediates passed to `push_frame`.
pub fn pack_layout(layout: &FrameLayout) -> (i64, i64) {
    let r = &layout.registers;
    let regs = (r.ints as u64)
        | ((r.floats as u64) << 16)
        | ((r.strings as u64) << 32)
        | ((r.pointers as u64) << 48);
    let caps = (layout.params as u64) | ((layout.returns as u64) << 32);
    (regs as i64, caps as i64)
}

pub fn unpack_layout(regs: i64, caps: i64) -> FrameLayout {
    let (regs, caps) = (regs as u64, caps as u64);
    FrameLayout {
        registers: RegisterCounts::new(
            regs as u16,
            (regs >> 16) as u16,
            (regs >> 32) as u16,
            (regs >> 48) as u16,
        ),
        params: caps as u32,
        returns: (caps >> 32) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_packing_is_lossless() {
        let layout = FrameLayout {
            registers: RegisterCounts::new(3, 65535, 0, 9),
            params: 17,
            returns: u32::MAX,
        };
        let (regs, caps) = pack_layout(&layout);
        assert_eq!(unpack_layout(regs, caps), layout);
    }

    #[test]
    fn entry_signature_shape() {
        let sig = script_entry(CallConv::SystemV, types::I64);
        assert_eq!(sig.params.len(), 6);
        assert_eq!(sig.params[3].value_type, types::I32);
        assert_eq!(sig.returns.len(), 1);
        assert_eq!(sig.returns[0].value_type, types::I32);
    }

    #[test]
    fn only_strings_stay_in_the_frame() {
        assert_eq!(register_type(Bank::Float, types::I64), Some(types::F64));
        assert_eq!(register_type(Bank::String, types::I64), None);
    }
}
