//! Call-site marshal planning.
//!
//! Walks a function's instruction stream once and works out, for every
//! instruction, what the call protocol needs: which staging slot each PARAM
//! writes, which window of staged parameters each CALL / TAIL consumes, and
//! the return descriptors built from the RESULT placeholders that follow a
//! call. Lowering consumes the resulting [`FunctionPlan`]; all consistency
//! checks on the call protocol happen here, before any code is emitted.

use std::collections::VecDeque;

use regvm_core::{
    Bank, FrameLayout, Instruction, Modifier, OpCode, RegType, RegisterCounts, ScriptProto,
    ValueKind,
};

use crate::error::MarshalError;

/// Where a staged parameter (or return value) comes from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamSource {
    Nil,
    Int(u8),
    IntConst(usize),
    IntImm(i32),
    Float(u8),
    FloatConst(usize),
    String(u8),
    StringConst(usize),
    Pointer(u8),
    PointerConst(usize),
    /// Address of a frame slot; staged with a pointer tag.
    AddressOf(Bank, u8),
}

impl ParamSource {
    /// Tag written into the staged value record.
    pub fn tag(&self) -> ValueKind {
        match self {
            ParamSource::Nil => ValueKind::Nil,
            ParamSource::Int(_) | ParamSource::IntConst(_) | ParamSource::IntImm(_) => {
                ValueKind::Int
            }
            ParamSource::Float(_) | ParamSource::FloatConst(_) => ValueKind::Float,
            ParamSource::String(_) | ParamSource::StringConst(_) => ValueKind::String,
            ParamSource::Pointer(_) | ParamSource::PointerConst(_) | ParamSource::AddressOf(..) => {
                ValueKind::Pointer
            }
        }
    }
}

/// One staged parameter and the instruction that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StagedParam {
    pub pc: usize,
    pub source: ParamSource,
}

/// The flat per-function parameter staging buffer.
///
/// An entry's position is also its slot in the frame's outgoing parameter
/// array, so a call's window is always contiguous.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagingBuffer {
    entries: Vec<StagedParam>,
    high_water: usize,
}

impl StagingBuffer {
    pub fn push(&mut self, param: StagedParam) {
        self.entries.push(param);
        self.high_water = self.high_water.max(self.entries.len());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[StagedParam] {
        &self.entries
    }

    /// Largest number of entries ever live at once.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Remove the `count` most recently staged entries, returning their first
    /// slot and the entries in staging order.
    pub fn take_window(
        &mut self,
        pc: usize,
        count: usize,
    ) -> Result<(usize, Vec<StagedParam>), MarshalError> {
        if count > self.entries.len() {
            return Err(MarshalError::ArgCountMismatch {
                pc,
                staged: self.entries.len(),
                declared: count,
            });
        }
        let start = self.entries.len() - count;
        Ok((start, self.entries.split_off(start)))
    }
}

/// Where one return value of a call lands in the caller's frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnDescriptor {
    /// The RESULT instruction this descriptor came from.
    pub pc: usize,
    pub reg_type: RegType,
    pub bank: Bank,
    pub reg: u8,
}

impl ReturnDescriptor {
    /// Registers covered: 2 or 3 for multi-component floats, else 1.
    pub fn width(&self) -> u8 {
        self.reg_type.components()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Call,
    Tail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callee {
    /// Pointer-constant index of a function known at compile time.
    Static { konst: usize, native: bool },
    /// Pointer register holding the callee at run time.
    Register(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Script,
    Native,
    Dynamic,
}

/// Everything lowering needs to emit one call site.
#[derive(Debug, Clone, PartialEq)]
pub struct CallPlan {
    pub pc: usize,
    pub kind: CallKind,
    pub callee: Callee,
    /// The consumed window, in staging order.
    pub args: Vec<StagedParam>,
    /// Parameter-array slot of the first argument.
    pub window_start: usize,
    /// Empty for tail calls: they forward the caller's descriptors.
    pub returns: Vec<ReturnDescriptor>,
}

impl CallPlan {
    pub fn dispatch(&self) -> Dispatch {
        match self.callee {
            Callee::Static { native: true, .. } => Dispatch::Native,
            Callee::Static { native: false, .. } => Dispatch::Script,
            Callee::Register(_) => Dispatch::Dynamic,
        }
    }

    /// Address-of arguments whose registers are flushed before the call and
    /// reloaded after it. Strings never live outside the frame.
    pub fn in_outs(&self) -> impl Iterator<Item = (Bank, u8)> + '_ {
        self.args.iter().filter_map(|p| match p.source {
            ParamSource::AddressOf(bank, reg) if bank != Bank::String => Some((bank, reg)),
            _ => None,
        })
    }
}

/// A RET / RETI.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetPlan {
    pub slot: u8,
    pub last: bool,
    pub source: ParamSource,
    /// Float components written (1 to 3).
    pub width: u8,
    pub reg_type: RegType,
}

/// What lowering does for one instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Not part of the call protocol.
    Plain,
    /// Stage parameters starting at `slot`.
    Stage {
        slot: usize,
        params: Vec<StagedParam>,
    },
    Call(CallPlan),
    /// Placeholder already folded into the preceding call.
    Result(ReturnDescriptor),
    Ret(RetPlan),
}

/// Marshal state after an instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct MarshalState {
    pub staged: Vec<StagedParam>,
    pub pending_returns: Vec<ReturnDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionPlan {
    pub steps: Vec<Step>,
    pub layout: FrameLayout,
    /// One snapshot per instruction.
    pub states: Vec<MarshalState>,
}

impl FunctionPlan {
    pub fn calls(&self) -> impl Iterator<Item = &CallPlan> {
        self.steps.iter().filter_map(|s| match s {
            Step::Call(plan) => Some(plan),
            _ => None,
        })
    }
}

/// Plan every call site of a script body.
pub fn plan_function(proto: &ScriptProto) -> Result<FunctionPlan, MarshalError> {
    let code = &proto.code;
    let check = Operands { proto };
    let mut staging = StagingBuffer::default();
    let mut pending: VecDeque<ReturnDescriptor> = VecDeque::new();
    let mut steps = Vec::with_capacity(code.len());
    let mut states = Vec::with_capacity(code.len());
    let mut max_returns = 0usize;

    for (pc, inst) in code.iter().enumerate() {
        let step = match inst.op {
            OpCode::Param => {
                let ty = decode(pc, inst.b)?;
                let slot = staging.len();
                let params = check.param(pc, ty, inst.c)?;
                for p in &params {
                    staging.push(*p);
                }
                Step::Stage { slot, params }
            }
            OpCode::ParamI => {
                let slot = staging.len();
                let param = StagedParam {
                    pc,
                    source: ParamSource::IntImm(inst.sax()),
                };
                staging.push(param);
                Step::Stage {
                    slot,
                    params: vec![param],
                }
            }
            OpCode::Call | OpCode::CallK | OpCode::Tail | OpCode::TailK => {
                let kind = match inst.op {
                    OpCode::Call | OpCode::CallK => CallKind::Call,
                    _ => CallKind::Tail,
                };
                let callee = check.callee(pc, inst)?;
                let (window_start, args) = staging.take_window(pc, inst.b as usize)?;
                let returns = match kind {
                    CallKind::Call => check.results(pc, inst.c as usize)?,
                    CallKind::Tail => Vec::new(),
                };
                max_returns = max_returns.max(returns.len());
                pending.extend(returns.iter().copied());
                let plan = CallPlan {
                    pc,
                    kind,
                    callee,
                    args,
                    window_start,
                    returns,
                };
                tracing::trace!(
                    pc,
                    kind = ?plan.kind,
                    dispatch = ?plan.dispatch(),
                    args = plan.args.len(),
                    returns = plan.returns.len(),
                    "planned call site"
                );
                Step::Call(plan)
            }
            OpCode::Result => match pending.pop_front() {
                Some(desc) if desc.pc == pc => Step::Result(desc),
                _ => return Err(MarshalError::StrayResult { pc }),
            },
            OpCode::Ret => Step::Ret(check.ret(pc, inst)?),
            OpCode::RetI => {
                let (slot, last) = inst.ret_slot();
                Step::Ret(RetPlan {
                    slot,
                    last,
                    source: ParamSource::IntImm(inst.sbx() as i32),
                    width: 1,
                    reg_type: RegType::INT,
                })
            }
            _ => {
                check.plain(pc, inst)?;
                Step::Plain
            }
        };
        steps.push(step);
        states.push(MarshalState {
            staged: staging.entries().to_vec(),
            pending_returns: pending.iter().copied().collect(),
        });
    }

    let layout = FrameLayout {
        registers: proto.registers,
        params: staging.high_water() as u32,
        returns: max_returns as u32,
    };
    Ok(FunctionPlan {
        steps,
        layout,
        states,
    })
}

fn decode(pc: usize, bits: u8) -> Result<RegType, MarshalError> {
    RegType::from_bits(bits).ok_or(MarshalError::UnknownRegType { pc, bits })
}

/// Operand validation against a prototype's register counts and pools.
struct Operands<'a> {
    proto: &'a ScriptProto,
}

impl Operands<'_> {
    fn counts(&self) -> &RegisterCounts {
        &self.proto.registers
    }

    fn reg(&self, pc: usize, bank: Bank, reg: usize) -> Result<(), MarshalError> {
        let count = self.counts().get(bank);
        // Operands address at most 256 registers per bank.
        if reg < count as usize && reg <= u8::MAX as usize {
            Ok(())
        } else {
            Err(MarshalError::RegisterOutOfRange {
                pc,
                bank,
                reg,
                count,
            })
        }
    }

    fn konst(&self, pc: usize, kind: ValueKind, index: usize) -> Result<(), MarshalError> {
        let pools = &self.proto.constants;
        let (pool, len) = match kind {
            ValueKind::Int => ("int", pools.ints.len()),
            ValueKind::Float => ("float", pools.floats.len()),
            ValueKind::String => ("string", pools.strings.len()),
            ValueKind::Pointer => ("pointer", pools.pointers.len()),
            ValueKind::Nil => ("nil", 0),
        };
        if index < len {
            Ok(())
        } else {
            Err(MarshalError::ConstantOutOfRange { pc, pool, index })
        }
    }

    /// Source of a plain register or constant operand of `kind`.
    fn value(
        &self,
        pc: usize,
        kind: ValueKind,
        konst: bool,
        index: u8,
    ) -> Result<ParamSource, MarshalError> {
        let i = index as usize;
        if konst {
            self.konst(pc, kind, i)?;
        } else if let Some(bank) = kind.bank() {
            self.reg(pc, bank, i)?;
        }
        Ok(match (kind, konst) {
            (ValueKind::Int, false) => ParamSource::Int(index),
            (ValueKind::Int, true) => ParamSource::IntConst(i),
            (ValueKind::Float, false) => ParamSource::Float(index),
            (ValueKind::Float, true) => ParamSource::FloatConst(i),
            (ValueKind::String, false) => ParamSource::String(index),
            (ValueKind::String, true) => ParamSource::StringConst(i),
            (ValueKind::Pointer, false) => ParamSource::Pointer(index),
            (ValueKind::Pointer, true) => ParamSource::PointerConst(i),
            (ValueKind::Nil, _) => ParamSource::Nil,
        })
    }

    /// Staged entries of one PARAM. Multi-component floats stage one plain
    /// float per component.
    fn param(&self, pc: usize, ty: RegType, index: u8) -> Result<Vec<StagedParam>, MarshalError> {
        let unsupported = || MarshalError::UnsupportedParam {
            pc,
            reg_type: ty.to_string(),
        };
        let staged = |source| StagedParam { pc, source };
        match (ty.kind, ty.modifier) {
            (ValueKind::Nil, Modifier::None) => Ok(vec![staged(ParamSource::Nil)]),
            (ValueKind::Nil, _) => Err(unsupported()),
            (kind, Modifier::None) => Ok(vec![staged(self.value(pc, kind, false, index)?)]),
            (kind, Modifier::Konst) => Ok(vec![staged(self.value(pc, kind, true, index)?)]),
            (kind, Modifier::AddressOf) => {
                let bank = kind.bank().ok_or_else(unsupported)?;
                self.reg(pc, bank, index as usize)?;
                Ok(vec![staged(ParamSource::AddressOf(bank, index))])
            }
            (ValueKind::Float, Modifier::Multi2 | Modifier::Multi3) => {
                let width = ty.components();
                self.reg(pc, Bank::Float, index as usize + width as usize - 1)?;
                Ok((0..width)
                    .map(|i| staged(ParamSource::Float(index + i)))
                    .collect())
            }
            _ => Err(unsupported()),
        }
    }

    fn callee(&self, pc: usize, inst: &Instruction) -> Result<Callee, MarshalError> {
        match inst.op {
            OpCode::Call | OpCode::Tail => {
                self.reg(pc, Bank::Pointer, inst.a as usize)?;
                Ok(Callee::Register(inst.a))
            }
            _ => {
                let konst = inst.a as usize;
                self.konst(pc, ValueKind::Pointer, konst)?;
                let func = self.proto.constants.pointers[konst]
                    .function()
                    .ok_or(MarshalError::CalleeNotFunction { pc, index: konst })?;
                Ok(Callee::Static {
                    konst,
                    native: func.is_native(),
                })
            }
        }
    }

    /// Return descriptors from the `count` RESULT instructions after `pc`.
    fn results(&self, pc: usize, count: usize) -> Result<Vec<ReturnDescriptor>, MarshalError> {
        let mut returns = Vec::with_capacity(count);
        for at in pc + 1..pc + 1 + count {
            let inst = match self.proto.code.get(at) {
                Some(inst) if inst.op == OpCode::Result => inst,
                _ => return Err(MarshalError::ResultMustFollowCall { pc: at }),
            };
            let ty = decode(at, inst.b)?;
            let unsupported = || MarshalError::UnsupportedResult {
                pc: at,
                reg_type: ty.to_string(),
            };
            match ty.modifier {
                Modifier::Konst => return Err(MarshalError::ConstantResult { pc: at }),
                Modifier::AddressOf => return Err(unsupported()),
                Modifier::Multi2 | Modifier::Multi3 if ty.kind != ValueKind::Float => {
                    return Err(unsupported())
                }
                _ => {}
            }
            let bank = ty.kind.bank().ok_or_else(unsupported)?;
            self.reg(at, bank, inst.c as usize + ty.components() as usize - 1)?;
            returns.push(ReturnDescriptor {
                pc: at,
                reg_type: ty,
                bank,
                reg: inst.c,
            });
        }
        Ok(returns)
    }

    fn ret(&self, pc: usize, inst: &Instruction) -> Result<RetPlan, MarshalError> {
        let (slot, last) = inst.ret_slot();
        let ty = decode(pc, inst.b)?;
        let unsupported = || MarshalError::UnsupportedReturn {
            pc,
            reg_type: ty.to_string(),
        };
        let (source, width) = match (ty.kind, ty.modifier) {
            (ValueKind::Nil, _) | (_, Modifier::AddressOf) => return Err(unsupported()),
            (kind, Modifier::None) => (self.value(pc, kind, false, inst.c)?, 1),
            (kind, Modifier::Konst) => (self.value(pc, kind, true, inst.c)?, 1),
            (ValueKind::Float, Modifier::Multi2 | Modifier::Multi3) => {
                let width = ty.components();
                self.reg(pc, Bank::Float, inst.c as usize + width as usize - 1)?;
                (ParamSource::Float(inst.c), width)
            }
            _ => return Err(unsupported()),
        };
        Ok(RetPlan {
            slot,
            last,
            source,
            width,
            reg_type: ty,
        })
    }

    fn plain(&self, pc: usize, inst: &Instruction) -> Result<(), MarshalError> {
        let (a, b, c) = (inst.a as usize, inst.b as usize, inst.c as usize);
        match inst.op {
            OpCode::Li => self.reg(pc, Bank::Int, a),
            OpCode::Lk => {
                self.reg(pc, Bank::Int, a)?;
                self.konst(pc, ValueKind::Int, inst.bx() as usize)
            }
            OpCode::Lkf => {
                self.reg(pc, Bank::Float, a)?;
                self.konst(pc, ValueKind::Float, inst.bx() as usize)
            }
            OpCode::Lks => {
                self.reg(pc, Bank::String, a)?;
                self.konst(pc, ValueKind::String, inst.bx() as usize)
            }
            OpCode::Lkp => {
                self.reg(pc, Bank::Pointer, a)?;
                self.konst(pc, ValueKind::Pointer, inst.bx() as usize)
            }
            OpCode::Move | OpCode::MoveF | OpCode::MoveA => {
                let bank = match inst.op {
                    OpCode::Move => Bank::Int,
                    OpCode::MoveF => Bank::Float,
                    _ => Bank::Pointer,
                };
                self.reg(pc, bank, a)?;
                self.reg(pc, bank, b)
            }
            OpCode::Add | OpCode::AddF => {
                let bank = if inst.op == OpCode::Add {
                    Bank::Int
                } else {
                    Bank::Float
                };
                self.reg(pc, bank, a)?;
                self.reg(pc, bank, b)?;
                self.reg(pc, bank, c)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use regvm_core::{float_type, regt, ConstantPool, PointerConst, VmFunction};

    use super::*;

    fn native(name: &str) -> PointerConst {
        PointerConst::Function(Arc::new(VmFunction::native(name, |_, _| Ok(0))))
    }

    fn proto(code: Vec<Instruction>) -> ScriptProto {
        ScriptProto::new(
            code,
            ConstantPool {
                ints: vec![5, 7],
                floats: vec![0.5],
                strings: vec!["s".into()],
                pointers: vec![native("Native.F"), native("Native.G"), PointerConst::Raw(8)],
            },
            RegisterCounts::new(4, 4, 2, 2),
        )
    }

    fn ik(k: u8) -> Instruction {
        Instruction::param(RegType::konst(ValueKind::Int), k)
    }

    #[test]
    fn call_takes_most_recent_window() {
        let plan = plan_function(&proto(vec![
            ik(0),
            ik(1),
            Instruction::param(RegType::INT, 2),
            Instruction::call_k(0, 1, 0),
            Instruction::call_k(1, 2, 0),
        ]))
        .unwrap();

        let calls: Vec<_> = plan.calls().collect();
        assert_eq!(calls[0].window_start, 2);
        assert_eq!(calls[0].args.len(), 1);
        assert_eq!(calls[0].args[0].source, ParamSource::Int(2));
        assert_eq!(plan.states[3].staged.len(), 2);

        assert_eq!(calls[1].window_start, 0);
        assert_eq!(
            calls[1].args.iter().map(|p| p.source).collect::<Vec<_>>(),
            vec![ParamSource::IntConst(0), ParamSource::IntConst(1)]
        );
        assert!(plan.states[4].staged.is_empty());
        assert_eq!(plan.layout.params, 3);
    }

    #[test]
    fn multi_component_float_stages_one_slot_per_component() {
        let plan = plan_function(&proto(vec![
            Instruction::param(RegType::new(ValueKind::Float, Modifier::Multi3), 1),
            Instruction::param(RegType::new(ValueKind::Float, Modifier::Multi2), 0),
            Instruction::call_k(0, 5, 0),
        ]))
        .unwrap();
        assert_eq!(
            plan.states[1].staged.iter().map(|p| p.source).collect::<Vec<_>>(),
            vec![
                ParamSource::Float(1),
                ParamSource::Float(2),
                ParamSource::Float(3),
                ParamSource::Float(0),
                ParamSource::Float(1),
            ]
        );
        assert!(plan.states[1]
            .staged
            .iter()
            .all(|p| p.source.tag() == ValueKind::Float));
        match &plan.steps[1] {
            Step::Stage { slot, params } => {
                assert_eq!(*slot, 3);
                assert_eq!(params.len(), 2);
            }
            other => panic!("expected stage, got {other:?}"),
        }
    }

    #[test]
    fn multi_component_past_the_bank_is_rejected() {
        let err = plan_function(&proto(vec![Instruction::param(
            RegType::new(ValueKind::Float, Modifier::Multi3),
            2,
        )]))
        .unwrap_err();
        assert!(matches!(
            err,
            MarshalError::RegisterOutOfRange {
                pc: 0,
                bank: Bank::Float,
                reg: 4,
                ..
            }
        ));
    }

    #[test]
    fn multi_component_past_operand_range_is_rejected() {
        let wide = ScriptProto::new(
            vec![Instruction::param(
                RegType::new(ValueKind::Float, Modifier::Multi3),
                254,
            )],
            ConstantPool::default(),
            RegisterCounts::new(0, 300, 0, 0),
        );
        let err = plan_function(&wide).unwrap_err();
        assert_eq!(
            err,
            MarshalError::RegisterOutOfRange {
                pc: 0,
                bank: Bank::Float,
                reg: 256,
                count: 300,
            }
        );

        let ret = ScriptProto::new(
            vec![Instruction::ret(0, true, float_type(2), 255)],
            ConstantPool::default(),
            RegisterCounts::new(0, 300, 0, 0),
        );
        assert!(matches!(
            plan_function(&ret).unwrap_err(),
            MarshalError::RegisterOutOfRange { reg: 256, .. }
        ));
    }

    #[test]
    fn too_few_staged_parameters() {
        let err = plan_function(&proto(vec![ik(0), Instruction::call_k(0, 2, 0)])).unwrap_err();
        assert_eq!(
            err,
            MarshalError::ArgCountMismatch {
                pc: 1,
                staged: 1,
                declared: 2
            }
        );
    }

    #[test]
    fn results_must_follow_the_call() {
        let err = plan_function(&proto(vec![
            Instruction::call_k(0, 0, 2),
            Instruction::result(RegType::INT, 0),
            Instruction::abc(OpCode::Nop, 0, 0, 0),
        ]))
        .unwrap_err();
        assert_eq!(err, MarshalError::ResultMustFollowCall { pc: 2 });

        let err = plan_function(&proto(vec![Instruction::call_k(0, 0, 1)])).unwrap_err();
        assert_eq!(err, MarshalError::ResultMustFollowCall { pc: 1 });
    }

    #[test]
    fn extra_result_is_stray() {
        let err = plan_function(&proto(vec![
            Instruction::call_k(0, 0, 1),
            Instruction::result(RegType::INT, 0),
            Instruction::result(RegType::INT, 1),
        ]))
        .unwrap_err();
        assert_eq!(err, MarshalError::StrayResult { pc: 2 });

        let err =
            plan_function(&proto(vec![Instruction::result(RegType::INT, 0)])).unwrap_err();
        assert_eq!(err, MarshalError::StrayResult { pc: 0 });
    }

    #[test]
    fn constant_result_is_rejected() {
        let err = plan_function(&proto(vec![
            Instruction::call_k(0, 0, 1),
            Instruction::result(RegType::konst(ValueKind::Int), 0),
        ]))
        .unwrap_err();
        assert_eq!(err, MarshalError::ConstantResult { pc: 1 });
    }

    #[test]
    fn unknown_register_type() {
        let err = plan_function(&proto(vec![Instruction::abc(
            OpCode::Param,
            0,
            regt::INT | regt::KONST | regt::ADDROF,
            0,
        )]))
        .unwrap_err();
        assert!(matches!(err, MarshalError::UnknownRegType { pc: 0, .. }));

        let err = plan_function(&proto(vec![Instruction::abc(
            OpCode::Param,
            0,
            regt::INT | regt::MULTIREG2,
            0,
        )]))
        .unwrap_err();
        assert!(matches!(err, MarshalError::UnsupportedParam { pc: 0, .. }));
    }

    #[test]
    fn pending_returns_drain_one_per_result() {
        let plan = plan_function(&proto(vec![
            Instruction::call_k(0, 0, 2),
            Instruction::result(RegType::INT, 1),
            Instruction::result(RegType::new(ValueKind::Float, Modifier::Multi2), 2),
        ]))
        .unwrap();
        assert_eq!(plan.states[0].pending_returns.len(), 2);
        assert_eq!(plan.states[1].pending_returns.len(), 1);
        assert_eq!(plan.states[1].pending_returns[0].width(), 2);
        assert!(plan.states[2].pending_returns.is_empty());
        assert_eq!(plan.layout.returns, 2);
    }

    #[test]
    fn address_of_params_are_in_outs() {
        let plan = plan_function(&proto(vec![
            Instruction::param(RegType::addr_of(ValueKind::Int), 3),
            Instruction::param(RegType::addr_of(ValueKind::String), 1),
            Instruction::param(RegType::addr_of(ValueKind::Float), 0),
            Instruction::call(1, 3, 0),
        ]))
        .unwrap();
        let call = plan.calls().next().unwrap();
        assert_eq!(call.dispatch(), Dispatch::Dynamic);
        assert_eq!(
            call.in_outs().collect::<Vec<_>>(),
            vec![(Bank::Int, 3), (Bank::Float, 0)]
        );
        assert!(call.args.iter().all(|p| p.source.tag() == ValueKind::Pointer));
    }

    #[test]
    fn tail_ignores_declared_results() {
        let plan = plan_function(&proto(vec![ik(0), Instruction::abc(OpCode::TailK, 1, 1, 3)]))
            .unwrap();
        let call = plan.calls().next().unwrap();
        assert_eq!(call.kind, CallKind::Tail);
        assert_eq!(call.dispatch(), Dispatch::Native);
        assert!(call.returns.is_empty());
        assert!(plan.states[1].pending_returns.is_empty());
    }

    #[test]
    fn raw_pointer_is_not_a_callee() {
        let err = plan_function(&proto(vec![Instruction::call_k(2, 0, 0)])).unwrap_err();
        assert_eq!(err, MarshalError::CalleeNotFunction { pc: 0, index: 2 });
    }

    #[test]
    fn planning_is_deterministic() {
        let p = proto(vec![
            ik(0),
            Instruction::param_imm(-9),
            Instruction::param(RegType::addr_of(ValueKind::Float), 1),
            Instruction::call_k(0, 2, 1),
            Instruction::result(RegType::FLOAT, 3),
            Instruction::call_k(1, 1, 0),
            Instruction::ret(0, true, RegType::FLOAT, 3),
        ]);
        let a = plan_function(&p).unwrap();
        let b = plan_function(&p).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.states.len(), p.code.len());
    }
}
