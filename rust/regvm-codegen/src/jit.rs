//! In-process compilation of script functions.
//!
//! `JitEngine` owns one Cranelift `JITModule`. Compiling a script function
//! plans its call sites, lowers it, finalizes the code and installs the
//! resulting entry point in the function descriptor, so every later call
//! through the descriptor (from the embedder or from other compiled code)
//! runs native code.
//!
//! Compiled code is never freed; it lives as long as the process.

use cranelift_codegen::ir::UserFuncName;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::FunctionBuilderContext;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::Module;
use serde::{Deserialize, Serialize};
use target_lexicon::Triple;

use regvm_core::VmFunction;

use crate::abi;
use crate::error::CodegenError;
use crate::lower;
use crate::marshal::{plan_function, CallKind, Dispatch, FunctionPlan};
use crate::trampoline::{self, RuntimeHelpers};

// ---------------------------------------------------------------------------
// Optimisation level
// ---------------------------------------------------------------------------

/// Optimisation level for JIT compilation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptLevel {
    /// No optimisation (fastest compile, slowest code).
    None,
    /// Optimise for execution speed.
    #[default]
    Speed,
    /// Optimise for both speed and code size.
    SpeedAndSize,
}

impl OptLevel {
    fn flag(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

// ---------------------------------------------------------------------------
// Codegen settings
// ---------------------------------------------------------------------------

/// Settings controlling how the JIT engine compiles functions.
///
/// ```toml
/// opt_level = "speed_and_size"
/// verify = false
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodegenSettings {
    pub opt_level: OptLevel,
    /// Run the Cranelift IR verifier on every function.
    pub verify: bool,
}

impl Default for CodegenSettings {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::Speed,
            verify: true,
        }
    }
}

impl CodegenSettings {
    pub fn from_toml_str(text: &str) -> Result<Self, CodegenError> {
        toml::from_str(text).map_err(|e| CodegenError::Config(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// JIT statistics
// ---------------------------------------------------------------------------

/// Aggregated statistics about JIT compilation activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JitStats {
    pub functions_compiled: u64,
    /// Call sites compiled (including tail calls).
    pub call_sites: u64,
    pub tail_sites: u64,
    /// Call sites dispatched on the callee's native flag at run time.
    pub dynamic_sites: u64,
}

// ---------------------------------------------------------------------------
// JIT Engine
// ---------------------------------------------------------------------------

pub struct JitEngine {
    module: JITModule,
    helpers: RuntimeHelpers,
    fb_ctx: FunctionBuilderContext,
    settings: CodegenSettings,
    stats: JitStats,
}

impl JitEngine {
    /// Create an engine targeting the host.
    pub fn new(settings: CodegenSettings) -> Result<Self, CodegenError> {
        let mut flag_builder = settings::builder();
        let mut set = |name: &str, value: &str| {
            flag_builder
                .set(name, value)
                .map_err(|e| CodegenError::Target(format!("failed to set {name}: {e}")))
        };
        set("opt_level", settings.opt_level.flag())?;
        set("enable_verifier", if settings.verify { "true" } else { "false" })?;
        set("use_colocated_libcalls", "false")?;
        set("is_pic", "false")?;

        let isa_builder = cranelift_native::builder()
            .map_err(|msg| CodegenError::Target(format!("host machine is not supported: {msg}")))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| CodegenError::Target(format!("failed to build ISA: {e}")))?;

        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        trampoline::register_symbols(&mut builder);
        let mut module = JITModule::new(builder);
        let helpers = RuntimeHelpers::declare(&mut module)?;

        tracing::debug!(
            triple = %module.isa().triple(),
            opt_level = ?settings.opt_level,
            verify = settings.verify,
            "jit engine ready"
        );

        Ok(Self {
            module,
            helpers,
            fb_ctx: FunctionBuilderContext::new(),
            settings,
            stats: JitStats::default(),
        })
    }

    pub fn settings(&self) -> &CodegenSettings {
        &self.settings
    }

    pub fn stats(&self) -> &JitStats {
        &self.stats
    }

    pub fn target_triple(&self) -> &Triple {
        self.module.isa().triple()
    }

    /// Plan a function's call sites without generating code.
    pub fn plan(&self, func: &VmFunction) -> Result<FunctionPlan, CodegenError> {
        let proto = func
            .proto()
            .ok_or_else(|| CodegenError::NotScript(func.name().to_string()))?;
        Ok(plan_function(proto)?)
    }

    /// Compile a script function and install its entry point.
    pub fn compile(&mut self, func: &VmFunction) -> Result<(), CodegenError> {
        let proto = func
            .proto()
            .ok_or_else(|| CodegenError::NotScript(func.name().to_string()))?;
        let plan = plan_function(proto)?;

        let ptr = self.module.isa().pointer_type();
        let sig = abi::script_entry(self.module.isa().default_call_conv(), ptr);
        let func_id = self
            .module
            .declare_anonymous_function(&sig)
            .map_err(|e| CodegenError::Module(format!("declare({}): {e}", func.name())))?;

        let mut ctx = self.module.make_context();
        ctx.func.signature = sig;
        ctx.func.name = UserFuncName::user(0, func_id.as_u32());
        let helpers = self.helpers.refs(&mut self.module, &mut ctx.func);
        lower::lower_function(&mut ctx.func, &mut self.fb_ctx, proto, &plan, helpers, ptr)?;

        self.module
            .define_function(func_id, &mut ctx)
            .map_err(|e| CodegenError::Module(format!("define_function({}): {e:?}", func.name())))?;
        self.module.clear_context(&mut ctx);
        self.module
            .finalize_definitions()
            .map_err(|e| CodegenError::Module(format!("finalize_definitions failed: {e}")))?;

        let code = self.module.get_finalized_function(func_id);
        // SAFETY: the code was generated with the script entry signature and
        // the module never frees it.
        unsafe { func.install_entry(code) };

        let mut sites = 0;
        for call in plan.calls() {
            sites += 1;
            if call.kind == CallKind::Tail {
                self.stats.tail_sites += 1;
            }
            if call.dispatch() == Dispatch::Dynamic {
                self.stats.dynamic_sites += 1;
            }
        }
        self.stats.call_sites += sites;
        self.stats.functions_compiled += 1;

        tracing::debug!(
            function = func.name(),
            instructions = proto.code.len(),
            call_sites = sites,
            layout = ?plan.layout,
            "compiled"
        );
        Ok(())
    }

    /// Compile every script function in `funcs`, skipping natives. Returns
    /// the number compiled.
    pub fn compile_all<'a, I>(&mut self, funcs: I) -> Result<usize, CodegenError>
    where
        I: IntoIterator<Item = &'a VmFunction>,
    {
        let mut compiled = 0;
        for func in funcs {
            if func.is_native() {
                continue;
            }
            self.compile(func)?;
            compiled += 1;
        }
        Ok(compiled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regvm_core::{Instruction, RegType, RegisterCounts, ScriptProto};

    #[test]
    fn settings_from_toml() {
        let s = CodegenSettings::from_toml_str("opt_level = \"speed_and_size\"\nverify = false\n")
            .unwrap();
        assert_eq!(s.opt_level, OptLevel::SpeedAndSize);
        assert!(!s.verify);

        let s = CodegenSettings::from_toml_str("").unwrap();
        assert_eq!(s, CodegenSettings::default());

        let err = CodegenSettings::from_toml_str("opt_level = \"fastest\"").unwrap_err();
        assert!(matches!(err, CodegenError::Config(_)));
    }

    #[test]
    fn engine_targets_host() {
        let engine = JitEngine::new(CodegenSettings::default()).unwrap();
        assert_eq!(engine.target_triple(), &Triple::host());
        assert_eq!(engine.stats(), &JitStats::default());
    }

    #[test]
    fn natives_are_not_compiled() {
        let mut engine = JitEngine::new(CodegenSettings::default()).unwrap();
        let f = VmFunction::native("Native.Nop", |_, _| Ok(0));
        assert!(matches!(engine.compile(&f), Err(CodegenError::NotScript(_))));
        assert_eq!(engine.compile_all([&f]).unwrap(), 0);
    }

    #[test]
    fn compile_installs_entry() {
        let mut engine = JitEngine::new(CodegenSettings::default()).unwrap();
        let f = VmFunction::script(
            "Script.Answer",
            ScriptProto::new(
                vec![
                    Instruction::asbx(regvm_core::OpCode::Li, 0, 42),
                    Instruction::ret(0, true, RegType::INT, 0),
                ],
                Default::default(),
                RegisterCounts::new(1, 0, 0, 0),
            ),
        );
        assert!(!f.is_compiled());
        engine.compile(&f).unwrap();
        assert!(f.is_compiled());
        assert_eq!(engine.stats().functions_compiled, 1);
    }
}
