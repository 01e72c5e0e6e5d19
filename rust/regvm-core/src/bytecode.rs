//! Bytecode instruction format and register-type descriptors.
//!
//! 32-bit fixed-width instructions over four register banks (int, float,
//! string, pointer). The `B` operand of PARAM / RESULT / RET carries a
//! register type in the VM's bit encoding, decoded by [`RegType::from_bits`].

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};

use crate::frame::Bank;

/// Opcodes understood by the call-boundary compiler.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, IntoStaticStr,
)]
#[repr(u8)]
pub enum OpCode {
    #[strum(serialize = "NOP")]
    Nop = 0, // -
    #[strum(serialize = "LI")]
    Li = 1, // A, sBx: int[A] = sBx
    #[strum(serialize = "LK")]
    Lk = 2, // A, Bx: int[A] = KI[Bx]
    #[strum(serialize = "LKF")]
    Lkf = 3, // A, Bx: float[A] = KF[Bx]
    #[strum(serialize = "LKS")]
    Lks = 4, // A, Bx: string[A] = KS[Bx]
    #[strum(serialize = "LKP")]
    Lkp = 5, // A, Bx: ptr[A] = KP[Bx]
    #[strum(serialize = "MOVE")]
    Move = 6, // A, B: int[A] = int[B]
    #[strum(serialize = "MOVEF")]
    MoveF = 7, // A, B: float[A] = float[B]
    #[strum(serialize = "MOVEA")]
    MoveA = 8, // A, B: ptr[A] = ptr[B]
    #[strum(serialize = "ADD")]
    Add = 9, // A, B, C: int[A] = int[B] + int[C]
    #[strum(serialize = "ADDF")]
    AddF = 10, // A, B, C: float[A] = float[B] + float[C]
    #[strum(serialize = "PARAM")]
    Param = 11, // B = regtype, C = reg or konst
    #[strum(serialize = "PARAMI")]
    ParamI = 12, // sAx: stage int immediate
    #[strum(serialize = "CALL")]
    Call = 13, // A = ptr reg, B = args, C = results
    #[strum(serialize = "CALL_K")]
    CallK = 14, // A = ptr konst, B = args, C = results
    #[strum(serialize = "TAIL")]
    Tail = 15, // A = ptr reg, B = args
    #[strum(serialize = "TAIL_K")]
    TailK = 16, // A = ptr konst, B = args
    #[strum(serialize = "RESULT")]
    Result = 17, // B = regtype, C = reg
    #[strum(serialize = "RET")]
    Ret = 18, // A = slot | RET_FINAL, B = regtype, C = reg or konst
    #[strum(serialize = "RETI")]
    RetI = 19, // A = slot | RET_FINAL, sBx
}

/// Bit 7 of the `A` operand of RET / RETI: this is the last return value.
pub const RET_FINAL: u8 = 0x80;

/// A 32-bit instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: OpCode,
    pub a: u8,
    pub b: u8,
    pub c: u8,
}

impl Instruction {
    pub fn abc(op: OpCode, a: u8, b: u8, c: u8) -> Self {
        Self { op, a, b, c }
    }

    pub fn abx(op: OpCode, a: u8, bx: u16) -> Self {
        Self {
            op,
            a,
            b: (bx >> 8) as u8,
            c: (bx & 0xFF) as u8,
        }
    }

    pub fn asbx(op: OpCode, a: u8, sbx: i16) -> Self {
        Self::abx(op, a, sbx as u16)
    }

    pub fn ax(op: OpCode, ax: u32) -> Self {
        Self {
            op,
            a: ((ax >> 16) & 0xFF) as u8,
            b: ((ax >> 8) & 0xFF) as u8,
            c: (ax & 0xFF) as u8,
        }
    }

    /// 24-bit signed immediate, truncated to the instruction width.
    pub fn asx(op: OpCode, sax: i32) -> Self {
        Self::ax(op, (sax as u32) & 0x00FF_FFFF)
    }

    pub fn bx(&self) -> u16 {
        ((self.b as u16) << 8) | (self.c as u16)
    }

    pub fn sbx(&self) -> i16 {
        self.bx() as i16
    }

    pub fn ax_val(&self) -> u32 {
        ((self.a as u32) << 16) | ((self.b as u32) << 8) | (self.c as u32)
    }

    pub fn sax(&self) -> i32 {
        ((self.ax_val() << 8) as i32) >> 8
    }

    // Shorthands for the call protocol.

    pub fn param(ty: RegType, index: u8) -> Self {
        Self::abc(OpCode::Param, 0, ty.bits(), index)
    }

    pub fn param_imm(value: i32) -> Self {
        Self::asx(OpCode::ParamI, value)
    }

    pub fn call(callee_reg: u8, args: u8, results: u8) -> Self {
        Self::abc(OpCode::Call, callee_reg, args, results)
    }

    pub fn call_k(callee_konst: u8, args: u8, results: u8) -> Self {
        Self::abc(OpCode::CallK, callee_konst, args, results)
    }

    pub fn tail(callee_reg: u8, args: u8) -> Self {
        Self::abc(OpCode::Tail, callee_reg, args, 0)
    }

    pub fn tail_k(callee_konst: u8, args: u8) -> Self {
        Self::abc(OpCode::TailK, callee_konst, args, 0)
    }

    pub fn result(ty: RegType, reg: u8) -> Self {
        Self::abc(OpCode::Result, 0, ty.bits(), reg)
    }

    pub fn ret(slot: u8, last: bool, ty: RegType, index: u8) -> Self {
        let a = if last { slot | RET_FINAL } else { slot };
        Self::abc(OpCode::Ret, a, ty.bits(), index)
    }

    pub fn ret_imm(slot: u8, last: bool, value: i16) -> Self {
        let a = if last { slot | RET_FINAL } else { slot };
        Self::asbx(OpCode::RetI, a, value)
    }

    /// Return slot and final flag of a RET / RETI.
    pub fn ret_slot(&self) -> (u8, bool) {
        (self.a & !RET_FINAL, self.a & RET_FINAL != 0)
    }
}

/// Raw bit encoding of register types.
pub mod regt {
    pub const INT: u8 = 0;
    pub const FLOAT: u8 = 1;
    pub const STRING: u8 = 2;
    pub const POINTER: u8 = 3;
    pub const TYPE: u8 = 3;

    pub const KONST: u8 = 4;
    pub const MULTIREG2: u8 = 8;
    pub const MULTIREG3: u8 = 16;
    pub const MULTIREG: u8 = MULTIREG2 | MULTIREG3;
    pub const ADDROF: u8 = 32;
    pub const NIL: u8 = 128;
}

/// Value kind of a register, tagged value record or return slot.
///
/// The discriminants double as the tag byte of a `VmValue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[repr(u8)]
pub enum ValueKind {
    #[strum(serialize = "int")]
    Int = regt::INT,
    #[strum(serialize = "float")]
    Float = regt::FLOAT,
    #[strum(serialize = "string")]
    String = regt::STRING,
    #[strum(serialize = "pointer")]
    Pointer = regt::POINTER,
    #[strum(serialize = "nil")]
    Nil = regt::NIL,
}

impl ValueKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            regt::INT => Some(ValueKind::Int),
            regt::FLOAT => Some(ValueKind::Float),
            regt::STRING => Some(ValueKind::String),
            regt::POINTER => Some(ValueKind::Pointer),
            regt::NIL => Some(ValueKind::Nil),
            _ => None,
        }
    }

    /// Register bank backing this kind. Nil has none.
    pub fn bank(self) -> Option<Bank> {
        match self {
            ValueKind::Int => Some(Bank::Int),
            ValueKind::Float => Some(Bank::Float),
            ValueKind::String => Some(Bank::String),
            ValueKind::Pointer => Some(Bank::Pointer),
            ValueKind::Nil => None,
        }
    }
}

/// The single modifier a register type may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Modifier {
    #[default]
    None,
    /// Operand is a constant-pool index.
    Konst,
    /// Pass the address of the frame slot instead of the value.
    AddressOf,
    /// Float value spanning two consecutive registers.
    Multi2,
    /// Float value spanning three consecutive registers.
    Multi3,
}

impl Modifier {
    /// Number of consecutive registers the value occupies.
    pub fn components(self) -> u8 {
        match self {
            Modifier::Multi2 => 2,
            Modifier::Multi3 => 3,
            _ => 1,
        }
    }
}

/// A decoded register type: value kind plus modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegType {
    pub kind: ValueKind,
    pub modifier: Modifier,
}

impl RegType {
    pub const INT: RegType = RegType::plain(ValueKind::Int);
    pub const FLOAT: RegType = RegType::plain(ValueKind::Float);
    pub const STRING: RegType = RegType::plain(ValueKind::String);
    pub const POINTER: RegType = RegType::plain(ValueKind::Pointer);
    pub const NIL: RegType = RegType::plain(ValueKind::Nil);

    pub const fn new(kind: ValueKind, modifier: Modifier) -> Self {
        Self { kind, modifier }
    }

    pub const fn plain(kind: ValueKind) -> Self {
        Self::new(kind, Modifier::None)
    }

    pub const fn konst(kind: ValueKind) -> Self {
        Self::new(kind, Modifier::Konst)
    }

    pub const fn addr_of(kind: ValueKind) -> Self {
        Self::new(kind, Modifier::AddressOf)
    }

    pub fn bits(self) -> u8 {
        if self.kind == ValueKind::Nil {
            return regt::NIL;
        }
        let modifier = match self.modifier {
            Modifier::None => 0,
            Modifier::Konst => regt::KONST,
            Modifier::AddressOf => regt::ADDROF,
            Modifier::Multi2 => regt::MULTIREG2,
            Modifier::Multi3 => regt::MULTIREG3,
        };
        self.kind as u8 | modifier
    }

    /// Decode the VM bit encoding. Returns `None` for undefined bits or more
    /// than one modifier.
    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits == regt::NIL {
            return Some(RegType::NIL);
        }
        if bits & !(regt::TYPE | regt::KONST | regt::MULTIREG | regt::ADDROF) != 0 {
            return None;
        }
        let kind = ValueKind::from_tag(bits & regt::TYPE)?;
        let modifier = match bits & !regt::TYPE {
            0 => Modifier::None,
            regt::KONST => Modifier::Konst,
            regt::ADDROF => Modifier::AddressOf,
            regt::MULTIREG2 => Modifier::Multi2,
            regt::MULTIREG3 => Modifier::Multi3,
            _ => return None,
        };
        Some(Self { kind, modifier })
    }

    pub fn is_konst(self) -> bool {
        self.modifier == Modifier::Konst
    }

    pub fn is_addr_of(self) -> bool {
        self.modifier == Modifier::AddressOf
    }

    pub fn components(self) -> u8 {
        self.modifier.components()
    }
}

impl fmt::Display for RegType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.modifier {
            Modifier::None => write!(f, "{}", self.kind),
            Modifier::Konst => write!(f, "{}|konst", self.kind),
            Modifier::AddressOf => write!(f, "{}|addrof", self.kind),
            Modifier::Multi2 => write!(f, "{}|multi2", self.kind),
            Modifier::Multi3 => write!(f, "{}|multi3", self.kind),
        }
    }
}
