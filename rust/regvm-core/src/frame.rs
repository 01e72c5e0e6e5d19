//! VM register frames.
//!
//! A frame owns four register banks plus the outgoing parameter array and
//! return-descriptor array of the calls made from it. Generated code reaches
//! every bank through the base pointers at the head of [`VmFrame`].

use std::ffi::c_void;
use std::fmt;
use std::mem::{offset_of, size_of};

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::abort::{AbortKind, VmAbort};
use crate::bytecode::ValueKind;
use crate::value::{VmReturn, VmString, VmValue};

/// One of the four register banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum Bank {
    #[strum(serialize = "int")]
    Int,
    #[strum(serialize = "float")]
    Float,
    #[strum(serialize = "string")]
    String,
    #[strum(serialize = "pointer")]
    Pointer,
}

impl Bank {
    /// Size in bytes of one register slot.
    pub fn slot_size(self) -> usize {
        match self {
            Bank::Int => size_of::<i32>(),
            Bank::Float => size_of::<f64>(),
            Bank::String => size_of::<VmString>(),
            Bank::Pointer => size_of::<*mut c_void>(),
        }
    }

    pub fn kind(self) -> ValueKind {
        match self {
            Bank::Int => ValueKind::Int,
            Bank::Float => ValueKind::Float,
            Bank::String => ValueKind::String,
            Bank::Pointer => ValueKind::Pointer,
        }
    }
}

/// Number of registers per bank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegisterCounts {
    pub ints: u16,
    pub floats: u16,
    pub strings: u16,
    pub pointers: u16,
}

impl RegisterCounts {
    pub fn new(ints: u16, floats: u16, strings: u16, pointers: u16) -> Self {
        Self {
            ints,
            floats,
            strings,
            pointers,
        }
    }

    pub fn get(&self, bank: Bank) -> u16 {
        match bank {
            Bank::Int => self.ints,
            Bank::Float => self.floats,
            Bank::String => self.strings,
            Bank::Pointer => self.pointers,
        }
    }
}

/// Everything needed to allocate a frame for one compiled function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameLayout {
    pub registers: RegisterCounts,
    /// Capacity of the outgoing parameter array.
    pub params: u32,
    /// Capacity of the return-descriptor array.
    pub returns: u32,
}

struct FrameStorage {
    ints: Box<[i32]>,
    floats: Box<[f64]>,
    strings: Box<[VmString]>,
    pointers: Box<[*mut c_void]>,
    params: Box<[VmValue]>,
    returns: Box<[VmReturn]>,
}

#[repr(C)]
pub struct VmFrame {
    ints: *mut i32,
    floats: *mut f64,
    strings: *mut VmString,
    pointers: *mut *mut c_void,
    params: *mut VmValue,
    returns: *mut VmReturn,
    storage: FrameStorage,
}

impl VmFrame {
    pub const INTS_OFFSET: usize = offset_of!(VmFrame, ints);
    pub const FLOATS_OFFSET: usize = offset_of!(VmFrame, floats);
    pub const STRINGS_OFFSET: usize = offset_of!(VmFrame, strings);
    pub const POINTERS_OFFSET: usize = offset_of!(VmFrame, pointers);
    pub const PARAMS_OFFSET: usize = offset_of!(VmFrame, params);
    pub const RETURNS_OFFSET: usize = offset_of!(VmFrame, returns);

    pub fn bank_offset(bank: Bank) -> usize {
        match bank {
            Bank::Int => Self::INTS_OFFSET,
            Bank::Float => Self::FLOATS_OFFSET,
            Bank::String => Self::STRINGS_OFFSET,
            Bank::Pointer => Self::POINTERS_OFFSET,
        }
    }

    pub fn new(layout: &FrameLayout) -> Box<Self> {
        let regs = &layout.registers;
        let mut storage = FrameStorage {
            ints: vec![0; regs.ints as usize].into_boxed_slice(),
            floats: vec![0.0; regs.floats as usize].into_boxed_slice(),
            strings: vec![VmString::default(); regs.strings as usize].into_boxed_slice(),
            pointers: vec![std::ptr::null_mut(); regs.pointers as usize].into_boxed_slice(),
            params: vec![VmValue::nil(); layout.params as usize].into_boxed_slice(),
            returns: vec![VmReturn::EMPTY; layout.returns as usize].into_boxed_slice(),
        };
        Box::new(Self {
            ints: storage.ints.as_mut_ptr(),
            floats: storage.floats.as_mut_ptr(),
            strings: storage.strings.as_mut_ptr(),
            pointers: storage.pointers.as_mut_ptr(),
            params: storage.params.as_mut_ptr(),
            returns: storage.returns.as_mut_ptr(),
            storage,
        })
    }

    /// Distribute incoming parameters to the first registers of their banks,
    /// in order. Nil parameters occupy no register.
    pub fn fill_params(&mut self, args: &[VmValue]) -> Result<(), VmAbort> {
        let mut next = [0usize; 4];
        for (i, arg) in args.iter().enumerate() {
            let bank = match arg.kind() {
                Some(ValueKind::Nil) => continue,
                Some(kind) => kind.bank(),
                None => None,
            };
            let Some(bank) = bank else {
                return Err(VmAbort::new(
                    AbortKind::BadArgument,
                    format!("parameter {i} has invalid tag {}", arg.tag()),
                ));
            };
            let slot = &mut next[bank as usize];
            let reg = *slot;
            let capacity = match bank {
                Bank::Int => self.storage.ints.len(),
                Bank::Float => self.storage.floats.len(),
                Bank::String => self.storage.strings.len(),
                Bank::Pointer => self.storage.pointers.len(),
            };
            if reg >= capacity {
                return Err(VmAbort::new(
                    AbortKind::TooManyParameters,
                    format!("too many {bank} parameters ({} registers)", capacity),
                ));
            }
            *slot += 1;
            match bank {
                Bank::Int => self.storage.ints[reg] = arg.as_int().unwrap_or_default(),
                Bank::Float => self.storage.floats[reg] = arg.as_float().unwrap_or_default(),
                Bank::String => {
                    // SAFETY: string parameters reference handles owned by the
                    // caller's frame or constant pool, alive for this call.
                    let s = unsafe { arg.as_str() }.cloned().unwrap_or_default();
                    self.storage.strings[reg] = s;
                }
                Bank::Pointer => {
                    self.storage.pointers[reg] = arg.as_pointer().unwrap_or(std::ptr::null_mut())
                }
            }
        }
        Ok(())
    }

    pub fn int(&self, reg: usize) -> i32 {
        self.storage.ints[reg]
    }

    pub fn float(&self, reg: usize) -> f64 {
        self.storage.floats[reg]
    }

    pub fn string(&self, reg: usize) -> &VmString {
        &self.storage.strings[reg]
    }

    pub fn pointer(&self, reg: usize) -> *mut c_void {
        self.storage.pointers[reg]
    }
}

impl fmt::Debug for VmFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmFrame")
            .field("ints", &self.storage.ints)
            .field("floats", &self.storage.floats)
            .field("strings", &self.storage.strings)
            .field("pointers", &self.storage.pointers.len())
            .field("params", &self.storage.params.len())
            .field("returns", &self.storage.returns.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(ints: u16, floats: u16, strings: u16, pointers: u16) -> FrameLayout {
        FrameLayout {
            registers: RegisterCounts::new(ints, floats, strings, pointers),
            params: 4,
            returns: 2,
        }
    }

    #[test]
    fn base_pointers_lead_the_frame() {
        assert_eq!(VmFrame::INTS_OFFSET, 0);
        assert_eq!(VmFrame::FLOATS_OFFSET, 8);
        assert_eq!(VmFrame::RETURNS_OFFSET, 40);
        assert_eq!(VmFrame::bank_offset(Bank::Pointer), 24);
    }

    #[test]
    fn params_fill_each_bank_in_order() {
        let mut frame = VmFrame::new(&layout(2, 2, 1, 1));
        let s = VmString::new("name");
        let marker = 0x40usize as *mut c_void;
        frame
            .fill_params(&[
                VmValue::int(5),
                VmValue::float(1.5),
                VmValue::nil(),
                VmValue::int(7),
                VmValue::string(&s),
                VmValue::pointer(marker),
            ])
            .unwrap();
        assert_eq!(frame.int(0), 5);
        assert_eq!(frame.int(1), 7);
        assert_eq!(frame.float(0), 1.5);
        assert_eq!(frame.float(1), 0.0);
        assert_eq!(frame.string(0).as_str(), "name");
        assert_eq!(frame.pointer(0), marker);
    }

    #[test]
    fn too_many_params_for_a_bank() {
        let mut frame = VmFrame::new(&layout(1, 0, 0, 0));
        let err = frame
            .fill_params(&[VmValue::int(1), VmValue::int(2)])
            .unwrap_err();
        assert_eq!(err.kind, AbortKind::TooManyParameters);

        let mut frame = VmFrame::new(&layout(0, 0, 0, 0));
        let err = frame.fill_params(&[VmValue::float(1.0)]).unwrap_err();
        assert_eq!(err.kind, AbortKind::TooManyParameters);
    }

    #[test]
    fn slot_sizes() {
        assert_eq!(Bank::Int.slot_size(), 4);
        assert_eq!(Bank::Float.slot_size(), 8);
        assert_eq!(Bank::Pointer.slot_size(), 8);
        assert_eq!(Bank::String.slot_size(), std::mem::size_of::<VmString>());
    }
}
