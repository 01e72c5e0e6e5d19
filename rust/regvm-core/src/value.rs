//! Tagged value records and return descriptors.
//!
//! These are the records exchanged across the VM/native boundary, so their
//! layout is fixed (`#[repr(C)]`) and generated code addresses their fields
//! by byte offset.

use std::ffi::c_void;
use std::fmt;
use std::mem::offset_of;
use std::sync::Arc;

use crate::bytecode::{Modifier, RegType, ValueKind};

/// Immutable, shared string handle. String registers hold these.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct VmString(Option<Arc<str>>);

impl VmString {
    pub fn new(s: &str) -> Self {
        if s.is_empty() {
            Self(None)
        } else {
            Self(Some(Arc::from(s)))
        }
    }

    pub fn as_str(&self) -> &str {
        self.0.as_deref().unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

impl From<&str> for VmString {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for VmString {
    fn from(s: String) -> Self {
        Self::new(&s)
    }
}

impl fmt::Debug for VmString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for VmString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy)]
#[repr(C)]
pub union Payload {
    pub i: i32,
    pub f: f64,
    pub a: *mut c_void,
    pub sp: *const VmString,
    pub bits: u64,
}

/// A tagged value: one parameter slot in a call.
///
/// Strings are carried by reference (`sp` points at a frame slot or a
/// constant-pool entry), never by value.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct VmValue {
    payload: Payload,
    tag: u8,
}

impl VmValue {
    pub const PAYLOAD_OFFSET: usize = offset_of!(VmValue, payload);
    pub const TAG_OFFSET: usize = offset_of!(VmValue, tag);
    pub const SIZE: usize = std::mem::size_of::<VmValue>();

    pub const fn nil() -> Self {
        Self {
            payload: Payload { bits: 0 },
            tag: ValueKind::Nil as u8,
        }
    }

    pub fn int(i: i32) -> Self {
        let mut payload = Payload { bits: 0 };
        payload.i = i;
        Self {
            payload,
            tag: ValueKind::Int as u8,
        }
    }

    pub fn float(f: f64) -> Self {
        Self {
            payload: Payload { f },
            tag: ValueKind::Float as u8,
        }
    }

    pub fn pointer(a: *mut c_void) -> Self {
        Self {
            payload: Payload { a },
            tag: ValueKind::Pointer as u8,
        }
    }

    /// Reference a string handle. The handle must outlive every read of the
    /// value.
    pub fn string(s: &VmString) -> Self {
        Self {
            payload: Payload {
                sp: s as *const VmString,
            },
            tag: ValueKind::String as u8,
        }
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    /// `None` for a tag outside the value kinds.
    pub fn kind(&self) -> Option<ValueKind> {
        ValueKind::from_tag(self.tag)
    }

    pub fn as_int(&self) -> Option<i32> {
        // SAFETY: the tag says the payload was written as `i`.
        (self.tag == ValueKind::Int as u8).then(|| unsafe { self.payload.i })
    }

    pub fn as_float(&self) -> Option<f64> {
        (self.tag == ValueKind::Float as u8).then(|| unsafe { self.payload.f })
    }

    pub fn as_pointer(&self) -> Option<*mut c_void> {
        (self.tag == ValueKind::Pointer as u8).then(|| unsafe { self.payload.a })
    }

    /// Read a string parameter.
    ///
    /// # Safety
    /// The referenced handle must still be alive.
    pub unsafe fn as_str(&self) -> Option<&VmString> {
        if self.tag != ValueKind::String as u8 {
            return None;
        }
        let sp = self.payload.sp;
        if sp.is_null() {
            None
        } else {
            Some(&*sp)
        }
    }

    /// Reinterpret a pointer parameter as a typed mutable reference (the
    /// callee side of an address-of parameter).
    ///
    /// # Safety
    /// The pointer must be valid and properly aligned for `T`.
    pub unsafe fn as_mut<T>(&self) -> Option<&mut T> {
        self.as_pointer().and_then(|p| (p as *mut T).as_mut())
    }
}

impl Default for VmValue {
    fn default() -> Self {
        Self::nil()
    }
}

impl fmt::Debug for VmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(ValueKind::Int) => write!(f, "Int({})", unsafe { self.payload.i }),
            Some(ValueKind::Float) => write!(f, "Float({})", unsafe { self.payload.f }),
            Some(ValueKind::String) => write!(f, "String({:p})", unsafe { self.payload.sp }),
            Some(ValueKind::Pointer) => write!(f, "Pointer({:p})", unsafe { self.payload.a }),
            Some(ValueKind::Nil) => f.write_str("Nil"),
            None => write!(f, "Invalid(tag={})", self.tag),
        }
    }
}

/// Return descriptor: where one return value of a call must be written.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct VmReturn {
    location: *mut c_void,
    reg_type: u8,
}

impl VmReturn {
    pub const LOCATION_OFFSET: usize = offset_of!(VmReturn, location);
    pub const REG_TYPE_OFFSET: usize = offset_of!(VmReturn, reg_type);
    pub const SIZE: usize = std::mem::size_of::<VmReturn>();

    pub const EMPTY: VmReturn = VmReturn {
        location: std::ptr::null_mut(),
        reg_type: ValueKind::Nil as u8,
    };

    /// # Safety
    /// `location` must point at writable storage matching `reg_type`
    /// (an `i32`, one to three `f64`s, a `VmString` or a pointer) for as long
    /// as the descriptor is used.
    pub unsafe fn new(location: *mut c_void, reg_type: RegType) -> Self {
        Self {
            location,
            reg_type: reg_type.bits(),
        }
    }

    pub fn location(&self) -> *mut c_void {
        self.location
    }

    pub fn reg_type(&self) -> Option<RegType> {
        RegType::from_bits(self.reg_type)
    }

    fn expects(&self, kind: ValueKind) -> bool {
        !self.location.is_null() && self.reg_type().is_some_and(|t| t.kind == kind)
    }

    pub fn set_int(&mut self, value: i32) {
        debug_assert!(self.expects(ValueKind::Int));
        if self.expects(ValueKind::Int) {
            // SAFETY: guaranteed by `VmReturn::new`.
            unsafe { *(self.location as *mut i32) = value };
        }
    }

    pub fn set_float(&mut self, value: f64) {
        debug_assert!(self.expects(ValueKind::Float));
        if self.expects(ValueKind::Float) {
            unsafe { *(self.location as *mut f64) = value };
        }
    }

    pub fn set_vector2(&mut self, value: [f64; 2]) {
        debug_assert!(self.float_width() >= 2);
        if self.expects(ValueKind::Float) && self.float_width() >= 2 {
            unsafe { *(self.location as *mut [f64; 2]) = value };
        }
    }

    pub fn set_vector3(&mut self, value: [f64; 3]) {
        debug_assert!(self.float_width() >= 3);
        if self.expects(ValueKind::Float) && self.float_width() >= 3 {
            unsafe { *(self.location as *mut [f64; 3]) = value };
        }
    }

    pub fn set_string(&mut self, value: &VmString) {
        debug_assert!(self.expects(ValueKind::String));
        if self.expects(ValueKind::String) {
            // Assignment drops the handle previously held by the slot.
            unsafe { *(self.location as *mut VmString) = value.clone() };
        }
    }

    pub fn set_pointer(&mut self, value: *mut c_void) {
        debug_assert!(self.expects(ValueKind::Pointer));
        if self.expects(ValueKind::Pointer) {
            unsafe { *(self.location as *mut *mut c_void) = value };
        }
    }

    fn float_width(&self) -> u8 {
        match self.reg_type() {
            Some(t) if t.kind == ValueKind::Float => t.components(),
            _ => 0,
        }
    }
}

impl Default for VmReturn {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for VmReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reg_type() {
            Some(t) => write!(f, "VmReturn({t} @ {:p})", self.location),
            None => write!(f, "VmReturn(?{} @ {:p})", self.reg_type, self.location),
        }
    }
}

#[derive(Default)]
struct ReturnSlot {
    int: i32,
    floats: [f64; 3],
    string: VmString,
    pointer: usize,
}

/// Owned storage behind a set of return descriptors, for callers outside
/// generated code.
pub struct ReturnBuffer {
    slots: Vec<ReturnSlot>,
    descriptors: Vec<VmReturn>,
}

impl ReturnBuffer {
    pub fn new(types: &[RegType]) -> Self {
        let mut slots: Vec<ReturnSlot> = types.iter().map(|_| ReturnSlot::default()).collect();
        let base = slots.as_mut_ptr();
        let descriptors = types
            .iter()
            .enumerate()
            .map(|(i, ty)| {
                // SAFETY: `slots` is never resized, so every field address
                // stays valid for the buffer's lifetime.
                unsafe {
                    let slot = base.add(i);
                    let location: *mut c_void = match ty.kind {
                        ValueKind::Int => std::ptr::addr_of_mut!((*slot).int).cast(),
                        ValueKind::Float => std::ptr::addr_of_mut!((*slot).floats).cast(),
                        ValueKind::String => std::ptr::addr_of_mut!((*slot).string).cast(),
                        ValueKind::Pointer => std::ptr::addr_of_mut!((*slot).pointer).cast(),
                        ValueKind::Nil => std::ptr::null_mut(),
                    };
                    VmReturn::new(location, *ty)
                }
            })
            .collect();
        Self { slots, descriptors }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptors_mut(&mut self) -> &mut [VmReturn] {
        &mut self.descriptors
    }

    pub fn int(&self, i: usize) -> i32 {
        self.slots[i].int
    }

    pub fn float(&self, i: usize) -> f64 {
        self.slots[i].floats[0]
    }

    pub fn vector(&self, i: usize) -> [f64; 3] {
        self.slots[i].floats
    }

    pub fn string(&self, i: usize) -> &VmString {
        &self.slots[i].string
    }

    pub fn pointer(&self, i: usize) -> *mut c_void {
        self.slots[i].pointer as *mut c_void
    }
}

impl fmt::Debug for ReturnBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.descriptors.iter()).finish()
    }
}

/// Helper for building multi-component float return types.
pub fn float_type(components: u8) -> RegType {
    let modifier = match components {
        2 => Modifier::Multi2,
        3 => Modifier::Multi3,
        _ => Modifier::None,
    };
    RegType::new(ValueKind::Float, modifier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_record_layout() {
        assert_eq!(VmValue::SIZE, 16);
        assert_eq!(VmValue::PAYLOAD_OFFSET, 0);
        assert_eq!(VmValue::TAG_OFFSET, 8);
        assert_eq!(VmReturn::LOCATION_OFFSET, 0);
        assert_eq!(VmReturn::REG_TYPE_OFFSET, 8);
    }

    #[test]
    fn tagged_accessors() {
        let v = VmValue::int(-3);
        assert_eq!(v.kind(), Some(ValueKind::Int));
        assert_eq!(v.as_int(), Some(-3));
        assert_eq!(v.as_float(), None);

        let s = VmString::new("hello");
        let v = VmValue::string(&s);
        assert_eq!(unsafe { v.as_str() }.map(VmString::as_str), Some("hello"));

        assert_eq!(VmValue::nil().kind(), Some(ValueKind::Nil));
    }

    #[test]
    fn return_buffer_setters() {
        let mut buf = ReturnBuffer::new(&[
            RegType::INT,
            float_type(3),
            RegType::STRING,
            RegType::POINTER,
        ]);
        let marker = 0x1000usize as *mut c_void;
        {
            let rets = buf.descriptors_mut();
            rets[0].set_int(42);
            rets[1].set_vector3([1.0, 2.0, 3.0]);
            rets[2].set_string(&VmString::new("out"));
            rets[3].set_pointer(marker);
        }
        assert_eq!(buf.int(0), 42);
        assert_eq!(buf.vector(1), [1.0, 2.0, 3.0]);
        assert_eq!(buf.string(2).as_str(), "out");
        assert_eq!(buf.pointer(3), marker);
    }

    #[test]
    fn empty_string_handle() {
        assert!(VmString::new("").is_empty());
        assert_eq!(VmString::default().as_str(), "");
    }
}
