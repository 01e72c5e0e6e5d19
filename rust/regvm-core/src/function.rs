//! Function descriptors: script bodies, native host functions and the entry
//! convention shared by both.

use std::ffi::c_void;
use std::fmt;
use std::mem::offset_of;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::abort::{AbortKind, VmAbort};
use crate::bytecode::{Instruction, ValueKind};
use crate::context::{ExecContext, CALL_UNWOUND};
use crate::frame::RegisterCounts;
use crate::value::{VmReturn, VmString, VmValue};

/// Flag bit: the function is implemented by the host.
pub const FUNC_NATIVE: u32 = 1;

/// Entry point of a script function.
///
/// `(ctx, callee, params, numparams, returns, numreturns)`. A non-negative
/// result is the number of return values written; [`CALL_UNWOUND`] means an
/// abort is pending in `ctx`.
pub type ScriptEntry = unsafe extern "C" fn(
    *mut ExecContext,
    *const VmFunction,
    *const VmValue,
    i32,
    *mut VmReturn,
    i32,
) -> i32;

/// Host function. Returns the number of return values written.
pub type NativeFn =
    Box<dyn Fn(&NativeArgs<'_>, &mut [VmReturn]) -> Result<i32, VmAbort> + Send + Sync>;

/// A constant value, used for default arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(i32),
    Float(f64),
    String(VmString),
    Pointer(usize),
}

/// Pointer constant-pool entry.
#[derive(Clone)]
pub enum PointerConst {
    Function(Arc<VmFunction>),
    Raw(usize),
}

impl PointerConst {
    pub fn address(&self) -> usize {
        match self {
            PointerConst::Function(f) => Arc::as_ptr(f) as usize,
            PointerConst::Raw(addr) => *addr,
        }
    }

    pub fn function(&self) -> Option<&Arc<VmFunction>> {
        match self {
            PointerConst::Function(f) => Some(f),
            PointerConst::Raw(_) => None,
        }
    }
}

impl fmt::Debug for PointerConst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointerConst::Function(func) => write!(f, "Function({})", func.name()),
            PointerConst::Raw(addr) => write!(f, "Raw({addr:#x})"),
        }
    }
}

/// Per-type constant pools of a script function.
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    pub ints: Vec<i32>,
    pub floats: Vec<f64>,
    pub strings: Vec<VmString>,
    pub pointers: Vec<PointerConst>,
}

/// A bytecode function body.
#[derive(Debug, Clone, Default)]
pub struct ScriptProto {
    pub code: Vec<Instruction>,
    pub constants: ConstantPool,
    pub registers: RegisterCounts,
}

impl ScriptProto {
    pub fn new(code: Vec<Instruction>, constants: ConstantPool, registers: RegisterCounts) -> Self {
        Self {
            code,
            constants,
            registers,
        }
    }
}

pub enum FunctionBody {
    Script(ScriptProto),
    Native(NativeFn),
}

/// Function descriptor.
///
/// `flags` and the script entry sit at fixed offsets; generated code reads
/// them to dispatch calls whose callee is only known at run time.
#[repr(C)]
pub struct VmFunction {
    flags: u32,
    script_call: AtomicPtr<u8>,
    name: String,
    defaults: Vec<Constant>,
    body: FunctionBody,
}

impl VmFunction {
    pub const FLAGS_OFFSET: usize = offset_of!(VmFunction, flags);
    pub const SCRIPT_CALL_OFFSET: usize = offset_of!(VmFunction, script_call);

    /// A script function. Its entry raises `NotCompiled` until a compiled
    /// entry is installed.
    pub fn script(name: impl Into<String>, proto: ScriptProto) -> Self {
        Self {
            flags: 0,
            script_call: AtomicPtr::new(unbound_script_entry as ScriptEntry as *mut u8),
            name: name.into(),
            defaults: Vec::new(),
            body: FunctionBody::Script(proto),
        }
    }

    pub fn native<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&NativeArgs<'_>, &mut [VmReturn]) -> Result<i32, VmAbort> + Send + Sync + 'static,
    {
        Self {
            flags: FUNC_NATIVE,
            script_call: AtomicPtr::new(std::ptr::null_mut()),
            name: name.into(),
            defaults: Vec::new(),
            body: FunctionBody::Native(Box::new(f)),
        }
    }

    pub fn with_defaults(mut self, defaults: Vec<Constant>) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn is_native(&self) -> bool {
        self.flags & FUNC_NATIVE != 0
    }

    pub fn defaults(&self) -> &[Constant] {
        &self.defaults
    }

    pub fn body(&self) -> &FunctionBody {
        &self.body
    }

    pub fn proto(&self) -> Option<&ScriptProto> {
        match &self.body {
            FunctionBody::Script(proto) => Some(proto),
            FunctionBody::Native(_) => None,
        }
    }

    pub fn native_fn(&self) -> Option<&NativeFn> {
        match &self.body {
            FunctionBody::Native(f) => Some(f),
            FunctionBody::Script(_) => None,
        }
    }

    /// Current script entry, `None` for native functions.
    pub fn script_entry(&self) -> Option<ScriptEntry> {
        let p = self.script_call.load(Ordering::Acquire);
        if p.is_null() {
            return None;
        }
        // SAFETY: only `ScriptEntry` pointers are ever stored.
        Some(unsafe { std::mem::transmute::<*mut u8, ScriptEntry>(p) })
    }

    pub fn is_compiled(&self) -> bool {
        let p = self.script_call.load(Ordering::Acquire);
        !p.is_null() && p != unbound_script_entry as ScriptEntry as *mut u8
    }

    /// Replace the script entry.
    ///
    /// # Safety
    /// `entry` must follow the [`ScriptEntry`] convention and stay valid for
    /// as long as this descriptor can be called.
    pub unsafe fn install_entry(&self, entry: *const u8) {
        self.script_call.store(entry as *mut u8, Ordering::Release);
    }
}

impl fmt::Debug for VmFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmFunction")
            .field("name", &self.name)
            .field("native", &self.is_native())
            .field("compiled", &self.is_compiled())
            .finish()
    }
}

unsafe extern "C" fn unbound_script_entry(
    ctx: *mut ExecContext,
    func: *const VmFunction,
    _params: *const VmValue,
    _numparams: i32,
    _returns: *mut VmReturn,
    _numreturns: i32,
) -> i32 {
    let name = func.as_ref().map(VmFunction::name).unwrap_or("<null>");
    let mut abort = VmAbort::new(AbortKind::NotCompiled, format!("{name} has not been compiled"));
    abort.push_frame(name);
    if let Some(ctx) = ctx.as_mut() {
        ctx.raise(abort);
    }
    CALL_UNWOUND
}

/// An argument as seen by a host function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgValue<'a> {
    Nil,
    Int(i32),
    Float(f64),
    String(&'a VmString),
    Pointer(*mut c_void),
}

/// Arguments of a native call, falling back to the callee's default table
/// for indices past the staged parameters.
pub struct NativeArgs<'a> {
    params: &'a [VmValue],
    defaults: &'a [Constant],
}

impl<'a> NativeArgs<'a> {
    pub fn new(params: &'a [VmValue], defaults: &'a [Constant]) -> Self {
        Self { params, defaults }
    }

    /// Number of staged parameters.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn raw(&self) -> &'a [VmValue] {
        self.params
    }

    pub fn get(&self, i: usize) -> Option<ArgValue<'a>> {
        if let Some(v) = self.params.get(i) {
            return match v.kind()? {
                ValueKind::Int => v.as_int().map(ArgValue::Int),
                ValueKind::Float => v.as_float().map(ArgValue::Float),
                // SAFETY: staged strings reference frame or pool slots that
                // outlive the call.
                ValueKind::String => unsafe { v.as_str() }.map(ArgValue::String),
                ValueKind::Pointer => v.as_pointer().map(ArgValue::Pointer),
                ValueKind::Nil => Some(ArgValue::Nil),
            };
        }
        self.defaults.get(i).map(|c| match c {
            Constant::Int(v) => ArgValue::Int(*v),
            Constant::Float(v) => ArgValue::Float(*v),
            Constant::String(s) => ArgValue::String(s),
            Constant::Pointer(p) => ArgValue::Pointer(*p as *mut c_void),
        })
    }

    pub fn int(&self, i: usize) -> Result<i32, VmAbort> {
        match self.get(i) {
            Some(ArgValue::Int(v)) => Ok(v),
            other => Err(bad_argument(i, "int", other)),
        }
    }

    pub fn float(&self, i: usize) -> Result<f64, VmAbort> {
        match self.get(i) {
            Some(ArgValue::Float(v)) => Ok(v),
            other => Err(bad_argument(i, "float", other)),
        }
    }

    pub fn string(&self, i: usize) -> Result<&'a VmString, VmAbort> {
        match self.get(i) {
            Some(ArgValue::String(s)) => Ok(s),
            other => Err(bad_argument(i, "string", other)),
        }
    }

    pub fn pointer(&self, i: usize) -> Result<*mut c_void, VmAbort> {
        match self.get(i) {
            Some(ArgValue::Pointer(p)) => Ok(p),
            other => Err(bad_argument(i, "pointer", other)),
        }
    }
}

fn bad_argument(i: usize, expected: &str, got: Option<ArgValue<'_>>) -> VmAbort {
    let got = match got {
        None => "nothing",
        Some(ArgValue::Nil) => "nil",
        Some(ArgValue::Int(_)) => "int",
        Some(ArgValue::Float(_)) => "float",
        Some(ArgValue::String(_)) => "string",
        Some(ArgValue::Pointer(_)) => "pointer",
    };
    VmAbort::new(
        AbortKind::BadArgument,
        format!("argument {i}: expected {expected}, got {got}"),
    )
}
