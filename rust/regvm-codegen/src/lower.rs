//! Lowering of a planned script function to Cranelift IR.
//!
//! Int, float and pointer registers live in Cranelift variables for the
//! whole function and are written back to the frame only where the call
//! protocol needs them there: address-of parameters around a call, and
//! return values the callee wrote directly into frame slots. String
//! registers never leave the frame.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, FuncRef, Function, InstBuilder, MemFlags, SigRef, Type, Value};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};

use regvm_core::{
    regt, Bank, Instruction, OpCode, RegisterCounts, ScriptProto, VmString, CALL_UNWOUND,
    FUNC_NATIVE,
};

use crate::abi::{self, offsets, RETURN_SIZE, VALUE_SIZE};
use crate::error::CodegenError;
use crate::marshal::{
    CallKind, CallPlan, Callee, FunctionPlan, ParamSource, RetPlan, ReturnDescriptor, StagedParam,
    Step,
};

/// Helper functions imported into the function being lowered.
pub(crate) struct HelperRefs {
    pub(crate) push_frame: FuncRef,
    pub(crate) pop_frame: FuncRef,
    pub(crate) unwind_frame: FuncRef,
    pub(crate) native_call: FuncRef,
    pub(crate) null_callee: FuncRef,
    pub(crate) string_assign: FuncRef,
}

/// Parameters of the entry signature.
struct EntryArgs {
    ctx: Value,
    func: Value,
    ret: Value,
    numret: Value,
}

/// Base pointers loaded from the frame once, in the entry block.
struct FrameBases {
    ints: Value,
    floats: Value,
    strings: Value,
    pointers: Value,
    params: Value,
    returns: Value,
}

impl FrameBases {
    fn bank(&self, bank: Bank) -> Value {
        match bank {
            Bank::Int => self.ints,
            Bank::Float => self.floats,
            Bank::String => self.strings,
            Bank::Pointer => self.pointers,
        }
    }
}

struct RegisterVars {
    ints: Vec<Variable>,
    floats: Vec<Variable>,
    pointers: Vec<Variable>,
}

impl RegisterVars {
    fn declare(builder: &mut FunctionBuilder<'_>, counts: &RegisterCounts, ptr: Type) -> Self {
        let mut next = 0u32;
        let mut bank = |count: u16, ty: Type| -> Vec<Variable> {
            (0..count)
                .map(|_| {
                    let var = Variable::from_u32(next);
                    next += 1;
                    builder.declare_var(var, ty);
                    var
                })
                .collect()
        };
        let ints = bank(counts.ints, types::I32);
        let floats = bank(counts.floats, types::F64);
        let pointers = bank(counts.pointers, ptr);
        Self {
            ints,
            floats,
            pointers,
        }
    }

    fn get(&self, bank: Bank, reg: usize) -> Option<Variable> {
        match bank {
            Bank::Int => self.ints.get(reg).copied(),
            Bank::Float => self.floats.get(reg).copied(),
            Bank::Pointer => self.pointers.get(reg).copied(),
            Bank::String => None,
        }
    }
}

struct Lowering<'a, 'f> {
    builder: FunctionBuilder<'f>,
    proto: &'a ScriptProto,
    ptr: Type,
    helpers: HelperRefs,
    script_sig: SigRef,
    vars: RegisterVars,
    entry: EntryArgs,
    frame: FrameBases,
}

/// Lower `proto` into `func`, whose signature must be the script entry
/// signature.
pub(crate) fn lower_function(
    func: &mut Function,
    fb_ctx: &mut FunctionBuilderContext,
    proto: &ScriptProto,
    plan: &FunctionPlan,
    helpers: HelperRefs,
    ptr: Type,
) -> Result<(), CodegenError> {
    let script_entry_sig = abi::script_entry(func.signature.call_conv, ptr);
    let script_sig = func.import_signature(script_entry_sig);
    let mut builder = FunctionBuilder::new(func, fb_ctx);
    let vars = RegisterVars::declare(&mut builder, &proto.registers, ptr);

    let entry_block = builder.create_block();
    builder.append_block_params_for_function_params(entry_block);
    builder.switch_to_block(entry_block);
    let params = builder.block_params(entry_block).to_vec();
    let &[ctx, callee, args, numargs, ret, numret] = params.as_slice() else {
        return Err(CodegenError::Lowering(format!(
            "entry block has {} parameters, expected 6",
            params.len()
        )));
    };

    // Frame push fills the registers from the incoming parameters.
    let (regs, caps) = abi::pack_layout(&plan.layout);
    let regs = builder.ins().iconst(types::I64, regs);
    let caps = builder.ins().iconst(types::I64, caps);
    let call = builder
        .ins()
        .call(helpers.push_frame, &[ctx, callee, args, numargs, regs, caps]);
    let frame = builder.inst_results(call)[0];

    let body = builder.create_block();
    let no_frame = builder.create_block();
    builder.ins().brif(frame, body, &[], no_frame, &[]);

    builder.switch_to_block(no_frame);
    let code = builder.ins().iconst(types::I32, CALL_UNWOUND as u32 as i64);
    builder.ins().return_(&[code]);

    builder.switch_to_block(body);
    let flags = MemFlags::trusted();
    let mut load_base = |offset: i32| builder.ins().load(ptr, flags, frame, offset);
    let bases = FrameBases {
        ints: load_base(offsets::frame_bank(Bank::Int)),
        floats: load_base(offsets::frame_bank(Bank::Float)),
        strings: load_base(offsets::frame_bank(Bank::String)),
        pointers: load_base(offsets::frame_bank(Bank::Pointer)),
        params: load_base(offsets::FRAME_PARAMS),
        returns: load_base(offsets::FRAME_RETURNS),
    };

    let mut lowering = Lowering {
        builder,
        proto,
        ptr,
        helpers,
        script_sig,
        vars,
        entry: EntryArgs {
            ctx,
            func: callee,
            ret,
            numret,
        },
        frame: bases,
    };
    lowering.load_registers()?;
    lowering.lower_body(plan)?;

    lowering.builder.seal_all_blocks();
    lowering.builder.finalize();
    Ok(())
}

impl Lowering<'_, '_> {
    fn var(&self, bank: Bank, reg: usize) -> Result<Variable, CodegenError> {
        self.vars.get(bank, reg).ok_or_else(|| {
            CodegenError::Lowering(format!("{bank} register {reg} has no variable"))
        })
    }

    fn use_reg(&mut self, bank: Bank, reg: usize) -> Result<Value, CodegenError> {
        let var = self.var(bank, reg)?;
        Ok(self.builder.use_var(var))
    }

    fn def_reg(&mut self, bank: Bank, reg: usize, v: Value) -> Result<(), CodegenError> {
        let var = self.var(bank, reg)?;
        self.builder.def_var(var, v);
        Ok(())
    }

    fn iconst_i32(&mut self, v: i32) -> Value {
        self.builder.ins().iconst(types::I32, v as u32 as i64)
    }

    fn iconst_ptr(&mut self, addr: usize) -> Value {
        self.builder.ins().iconst(self.ptr, addr as i64)
    }

    fn slot_offset(bank: Bank, reg: usize) -> i32 {
        (reg * bank.slot_size()) as i32
    }

    fn slot_addr(&mut self, bank: Bank, reg: usize) -> Value {
        let base = self.frame.bank(bank);
        self.builder
            .ins()
            .iadd_imm(base, Self::slot_offset(bank, reg) as i64)
    }

    /// Frame slot to variable.
    fn load_reg(&mut self, bank: Bank, reg: usize) -> Result<(), CodegenError> {
        let Some(ty) = abi::register_type(bank, self.ptr) else {
            return Ok(());
        };
        let var = self.var(bank, reg)?;
        let base = self.frame.bank(bank);
        let v = self.builder.ins().load(
            ty,
            MemFlags::trusted(),
            base,
            Self::slot_offset(bank, reg),
        );
        self.builder.def_var(var, v);
        Ok(())
    }

    /// Variable to frame slot.
    fn store_reg(&mut self, bank: Bank, reg: usize) -> Result<(), CodegenError> {
        if bank == Bank::String {
            return Ok(());
        }
        let var = self.var(bank, reg)?;
        let v = self.builder.use_var(var);
        let base = self.frame.bank(bank);
        self.builder
            .ins()
            .store(MemFlags::trusted(), v, base, Self::slot_offset(bank, reg));
        Ok(())
    }

    fn load_registers(&mut self) -> Result<(), CodegenError> {
        let counts = self.proto.registers;
        for bank in [Bank::Int, Bank::Float, Bank::Pointer] {
            for reg in 0..counts.get(bank) as usize {
                self.load_reg(bank, reg)?;
            }
        }
        Ok(())
    }

    fn lower_body(&mut self, plan: &FunctionPlan) -> Result<(), CodegenError> {
        let proto = self.proto;
        let mut terminated = false;
        for (inst, step) in proto.code.iter().zip(&plan.steps) {
            if terminated {
                continue;
            }
            match step {
                Step::Plain => self.lower_plain(inst)?,
                Step::Stage { slot, params } => {
                    for (i, param) in params.iter().enumerate() {
                        self.stage(slot + i, param)?;
                    }
                }
                Step::Call(call) => {
                    self.emit_call(call)?;
                    terminated = call.kind == CallKind::Tail;
                }
                Step::Result(_) => {}
                Step::Ret(ret) => {
                    self.emit_ret(ret)?;
                    terminated = ret.last;
                }
            }
        }
        if !terminated {
            let ctx = self.entry.ctx;
            self.builder.ins().call(self.helpers.pop_frame, &[ctx]);
            let zero = self.iconst_i32(0);
            self.builder.ins().return_(&[zero]);
        }
        Ok(())
    }

    fn lower_plain(&mut self, inst: &Instruction) -> Result<(), CodegenError> {
        let (a, b, c) = (inst.a as usize, inst.b as usize, inst.c as usize);
        let k = inst.bx() as usize;
        let proto = self.proto;
        let pools = &proto.constants;
        match inst.op {
            OpCode::Li => {
                let v = self.iconst_i32(inst.sbx() as i32);
                self.def_reg(Bank::Int, a, v)?;
            }
            OpCode::Lk => {
                let v = self.iconst_i32(pools.ints[k]);
                self.def_reg(Bank::Int, a, v)?;
            }
            OpCode::Lkf => {
                let v = self.builder.ins().f64const(pools.floats[k]);
                self.def_reg(Bank::Float, a, v)?;
            }
            OpCode::Lks => {
                let src = self.iconst_ptr(&pools.strings[k] as *const VmString as usize);
                let dst = self.slot_addr(Bank::String, a);
                self.builder
                    .ins()
                    .call(self.helpers.string_assign, &[dst, src]);
            }
            OpCode::Lkp => {
                let v = self.iconst_ptr(pools.pointers[k].address());
                self.def_reg(Bank::Pointer, a, v)?;
            }
            OpCode::Move | OpCode::MoveF | OpCode::MoveA => {
                let bank = match inst.op {
                    OpCode::Move => Bank::Int,
                    OpCode::MoveF => Bank::Float,
                    _ => Bank::Pointer,
                };
                let v = self.use_reg(bank, b)?;
                self.def_reg(bank, a, v)?;
            }
            OpCode::Add => {
                let x = self.use_reg(Bank::Int, b)?;
                let y = self.use_reg(Bank::Int, c)?;
                let v = self.builder.ins().iadd(x, y);
                self.def_reg(Bank::Int, a, v)?;
            }
            OpCode::AddF => {
                let x = self.use_reg(Bank::Float, b)?;
                let y = self.use_reg(Bank::Float, c)?;
                let v = self.builder.ins().fadd(x, y);
                self.def_reg(Bank::Float, a, v)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Value of a register, constant or immediate operand. Strings yield the
    /// address of their handle.
    fn source_value(&mut self, source: ParamSource) -> Result<Option<Value>, CodegenError> {
        let proto = self.proto;
        let pools = &proto.constants;
        let v = match source {
            ParamSource::Nil => None,
            ParamSource::Int(r) => Some(self.use_reg(Bank::Int, r as usize)?),
            ParamSource::IntConst(k) => Some(self.iconst_i32(pools.ints[k])),
            ParamSource::IntImm(v) => Some(self.iconst_i32(v)),
            ParamSource::Float(r) => Some(self.use_reg(Bank::Float, r as usize)?),
            ParamSource::FloatConst(k) => Some(self.builder.ins().f64const(pools.floats[k])),
            ParamSource::String(r) => Some(self.slot_addr(Bank::String, r as usize)),
            ParamSource::StringConst(k) => {
                Some(self.iconst_ptr(&pools.strings[k] as *const VmString as usize))
            }
            ParamSource::Pointer(r) => Some(self.use_reg(Bank::Pointer, r as usize)?),
            ParamSource::PointerConst(k) => Some(self.iconst_ptr(pools.pointers[k].address())),
            ParamSource::AddressOf(bank, r) => Some(self.slot_addr(bank, r as usize)),
        };
        Ok(v)
    }

    /// Write one tagged value record into the outgoing parameter array.
    fn stage(&mut self, slot: usize, param: &StagedParam) -> Result<(), CodegenError> {
        let base = self.frame.params;
        let at = (slot as i64 * VALUE_SIZE) as i32;
        let payload = match self.source_value(param.source)? {
            Some(v) => v,
            None => self.builder.ins().iconst(types::I64, 0),
        };
        let flags = MemFlags::trusted();
        self.builder
            .ins()
            .store(flags, payload, base, at + offsets::VALUE_PAYLOAD);
        let tag = self
            .builder
            .ins()
            .iconst(types::I8, param.source.tag() as u8 as i64);
        self.builder
            .ins()
            .store(flags, tag, base, at + offsets::VALUE_TAG);
        Ok(())
    }

    /// Registers an address-of argument covers. A float may be a scalar or
    /// a 2/3-vector, so up to three adjacent float registers go with it.
    fn in_out_registers(&self, bank: Bank, reg: u8) -> Vec<(Bank, usize)> {
        let reg = reg as usize;
        match bank {
            Bank::Float => {
                let count = self.proto.registers.floats as usize;
                (reg..(reg + 3).min(count)).map(|r| (bank, r)).collect()
            }
            _ => vec![(bank, reg)],
        }
    }

    fn store_in_outs(&mut self, call: &CallPlan) -> Result<(), CodegenError> {
        for (bank, reg) in call.in_outs() {
            for (bank, r) in self.in_out_registers(bank, reg) {
                self.store_reg(bank, r)?;
            }
        }
        Ok(())
    }

    fn load_in_outs(&mut self, call: &CallPlan) -> Result<(), CodegenError> {
        for (bank, reg) in call.in_outs() {
            for (bank, r) in self.in_out_registers(bank, reg) {
                self.load_reg(bank, r)?;
            }
        }
        Ok(())
    }

    /// Build the return-descriptor array for a call.
    fn fill_returns(&mut self, returns: &[ReturnDescriptor]) {
        let base = self.frame.returns;
        let flags = MemFlags::trusted();
        for (i, desc) in returns.iter().enumerate() {
            let at = (i as i64 * RETURN_SIZE) as i32;
            let location = self.slot_addr(desc.bank, desc.reg as usize);
            self.builder
                .ins()
                .store(flags, location, base, at + offsets::RETURN_LOCATION);
            let ty = self
                .builder
                .ins()
                .iconst(types::I8, desc.reg_type.bits() as i64);
            self.builder
                .ins()
                .store(flags, ty, base, at + offsets::RETURN_REG_TYPE);
        }
    }

    fn load_returns(&mut self, returns: &[ReturnDescriptor]) -> Result<(), CodegenError> {
        for desc in returns {
            for k in 0..desc.width() as usize {
                self.load_reg(desc.bank, desc.reg as usize + k)?;
            }
        }
        Ok(())
    }

    fn emit_call(&mut self, call: &CallPlan) -> Result<(), CodegenError> {
        self.store_in_outs(call)?;

        let (ret, numret) = match call.kind {
            CallKind::Call => {
                self.fill_returns(&call.returns);
                let n = self.iconst_i32(call.returns.len() as i32);
                (self.frame.returns, n)
            }
            CallKind::Tail => (self.entry.ret, self.entry.numret),
        };
        let params = self
            .builder
            .ins()
            .iadd_imm(self.frame.params, call.window_start as i64 * VALUE_SIZE);
        let nargs = self.iconst_i32(call.args.len() as i32);
        let args = [params, nargs, ret, numret];

        let result = match call.callee {
            Callee::Static { konst, native } => {
                let addr = self.proto.constants.pointers[konst].address();
                let callee = self.iconst_ptr(addr);
                if native {
                    self.native_call(callee, args)
                } else {
                    self.script_call(callee, args)
                }
            }
            Callee::Register(r) => {
                let callee = self.use_reg(Bank::Pointer, r as usize)?;
                self.dynamic_call(callee, args)
            }
        };

        let (ctx, func) = (self.entry.ctx, self.entry.func);
        let unwind = self.builder.create_block();
        let resume = self.builder.create_block();
        let failed = self.builder.ins().icmp_imm(IntCC::SignedLessThan, result, 0);
        self.builder.ins().brif(failed, unwind, &[], resume, &[]);

        self.builder.switch_to_block(unwind);
        self.builder
            .ins()
            .call(self.helpers.unwind_frame, &[ctx, func]);
        self.builder.ins().return_(&[result]);

        self.builder.switch_to_block(resume);
        match call.kind {
            CallKind::Call => {
                self.load_in_outs(call)?;
                self.load_returns(&call.returns)?;
            }
            // Not a true tail call: the callee ran on top of this frame.
            CallKind::Tail => {
                self.builder.ins().call(self.helpers.pop_frame, &[ctx]);
                self.builder.ins().return_(&[result]);
            }
        }
        Ok(())
    }

    fn script_call(&mut self, callee: Value, [params, nargs, ret, numret]: [Value; 4]) -> Value {
        let ctx = self.entry.ctx;
        let flags = MemFlags::trusted();
        let count = self
            .builder
            .ins()
            .load(types::I64, flags, ctx, offsets::CALL_COUNT);
        let count = self.builder.ins().iadd_imm(count, 1);
        self.builder
            .ins()
            .store(flags, count, ctx, offsets::CALL_COUNT);

        let entry = self
            .builder
            .ins()
            .load(self.ptr, flags, callee, offsets::FUNC_SCRIPT_CALL);
        let inst = self.builder.ins().call_indirect(
            self.script_sig,
            entry,
            &[ctx, callee, params, nargs, ret, numret],
        );
        self.builder.inst_results(inst)[0]
    }

    fn native_call(&mut self, callee: Value, [params, nargs, ret, numret]: [Value; 4]) -> Value {
        let ctx = self.entry.ctx;
        let inst = self.builder.ins().call(
            self.helpers.native_call,
            &[ctx, callee, params, nargs, ret, numret],
        );
        self.builder.inst_results(inst)[0]
    }

    /// Test the callee's native flag at run time and join both paths.
    fn dynamic_call(&mut self, callee: Value, args: [Value; 4]) -> Value {
        let null = self.builder.create_block();
        let check = self.builder.create_block();
        let native = self.builder.create_block();
        let script = self.builder.create_block();
        let join = self.builder.create_block();
        let result = self.builder.append_block_param(join, types::I32);

        self.builder.ins().brif(callee, check, &[], null, &[]);

        self.builder.switch_to_block(null);
        let ctx = self.entry.ctx;
        let inst = self.builder.ins().call(self.helpers.null_callee, &[ctx]);
        let r = self.builder.inst_results(inst)[0];
        self.builder.ins().jump(join, &[r]);

        self.builder.switch_to_block(check);
        let flags = self.builder.ins().load(
            types::I32,
            MemFlags::trusted(),
            callee,
            offsets::FUNC_FLAGS,
        );
        let is_native = self.builder.ins().band_imm(flags, FUNC_NATIVE as i64);
        self.builder.ins().brif(is_native, native, &[], script, &[]);

        self.builder.switch_to_block(native);
        let r = self.native_call(callee, args);
        self.builder.ins().jump(join, &[r]);

        self.builder.switch_to_block(script);
        let r = self.script_call(callee, args);
        self.builder.ins().jump(join, &[r]);

        self.builder.switch_to_block(join);
        result
    }

    /// RET / RETI: write the slot if the caller asked for it, and leave the
    /// function on the final one.
    fn emit_ret(&mut self, ret: &RetPlan) -> Result<(), CodegenError> {
        let write = self.builder.create_block();
        let after = self.builder.create_block();
        let numret = self.entry.numret;
        let wanted = self
            .builder
            .ins()
            .icmp_imm(IntCC::SignedGreaterThan, numret, ret.slot as i64);
        self.builder.ins().brif(wanted, write, &[], after, &[]);

        // The slot is written only when the caller declared the same kind.
        self.builder.switch_to_block(write);
        let flags = MemFlags::trusted();
        let at = (ret.slot as i64 * RETURN_SIZE) as i32;
        let declared = self.builder.ins().load(
            types::I8,
            flags,
            self.entry.ret,
            at + offsets::RETURN_REG_TYPE,
        );
        let kind = self.builder.ins().band_imm(declared, regt::TYPE as i64);
        let same_kind = self
            .builder
            .ins()
            .icmp_imm(IntCC::Equal, kind, ret.reg_type.kind as u8 as i64);
        let store = self.builder.create_block();
        self.builder.ins().brif(same_kind, store, &[], after, &[]);

        self.builder.switch_to_block(store);
        let dst = self
            .builder
            .ins()
            .load(self.ptr, flags, self.entry.ret, at + offsets::RETURN_LOCATION);
        match ret.source {
            ParamSource::Float(r) => {
                let v = self.use_reg(Bank::Float, r as usize)?;
                self.builder.ins().store(flags, v, dst, 0);
                // Extra components only go where the caller declared room.
                for k in 1..ret.width as usize {
                    let mask = if k == 1 { regt::MULTIREG } else { regt::MULTIREG3 };
                    let fits = self.builder.ins().band_imm(declared, mask as i64);
                    let extra = self.builder.create_block();
                    let next = self.builder.create_block();
                    self.builder.ins().brif(fits, extra, &[], next, &[]);

                    self.builder.switch_to_block(extra);
                    let v = self.use_reg(Bank::Float, r as usize + k)?;
                    self.builder.ins().store(flags, v, dst, (k * 8) as i32);
                    self.builder.ins().jump(next, &[]);

                    self.builder.switch_to_block(next);
                }
            }
            ParamSource::String(_) | ParamSource::StringConst(_) => {
                if let Some(src) = self.source_value(ret.source)? {
                    self.builder
                        .ins()
                        .call(self.helpers.string_assign, &[dst, src]);
                }
            }
            source => {
                if let Some(v) = self.source_value(source)? {
                    self.builder.ins().store(flags, v, dst, 0);
                }
            }
        }
        self.builder.ins().jump(after, &[]);

        self.builder.switch_to_block(after);
        if ret.last {
            let ctx = self.entry.ctx;
            self.builder.ins().call(self.helpers.pop_frame, &[ctx]);
            let n = self.iconst_i32(ret.slot as i32 + 1);
            let count = self.builder.ins().smin(n, numret);
            self.builder.ins().return_(&[count]);
        }
        Ok(())
    }
}
