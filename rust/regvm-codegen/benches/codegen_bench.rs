//! Call-boundary benchmarks: compilation throughput and per-call cost.
//!
//! Uses simple `std::time::Instant` timing with multiple iterations. Run with:
//!
//! ```bash
//! cargo bench -p regvm-codegen
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use regvm_codegen::{CodegenSettings, JitEngine};
use regvm_core::{
    ConstantPool, ExecContext, Instruction, OpCode, PointerConst, RegType, RegisterCounts,
    ReturnBuffer, ScriptProto, ValueKind, VmFunction,
};

/// Number of iterations for each benchmark.
const ITERATIONS: u32 = 20;

/// Calls made per iteration of a call benchmark.
const CALLS: u32 = 10_000;

fn add_native() -> Arc<VmFunction> {
    Arc::new(VmFunction::native("Native.Add", |args, rets| {
        rets[0].set_int(args.int(0)? + args.int(1)?);
        Ok(1)
    }))
}

fn sum_script() -> Arc<VmFunction> {
    Arc::new(VmFunction::script(
        "Script.Sum",
        ScriptProto::new(
            vec![
                Instruction::abc(OpCode::Add, 2, 0, 1),
                Instruction::ret(0, true, RegType::INT, 2),
            ],
            ConstantPool::default(),
            RegisterCounts::new(3, 0, 0, 0),
        ),
    ))
}

/// A caller with `sites` consecutive two-argument call sites against `callee`.
fn caller(sites: usize, callee: Arc<VmFunction>) -> ScriptProto {
    let mut code = Vec::with_capacity(sites * 4 + 1);
    for _ in 0..sites {
        code.push(Instruction::param(RegType::konst(ValueKind::Int), 0));
        code.push(Instruction::param(RegType::INT, 0));
        code.push(Instruction::call_k(0, 2, 1));
        code.push(Instruction::result(RegType::INT, 0));
    }
    code.push(Instruction::ret(0, true, RegType::INT, 0));
    ScriptProto::new(
        code,
        ConstantPool {
            ints: vec![1],
            pointers: vec![PointerConst::Function(callee)],
            ..Default::default()
        },
        RegisterCounts::new(1, 0, 0, 0),
    )
}

fn report(name: &str, unit: &str, mut durations: Vec<Duration>) {
    durations.sort();
    let min = durations[0];
    let max = durations[durations.len() - 1];
    let mean: Duration = durations.iter().sum::<Duration>() / ITERATIONS;
    let median = durations[durations.len() / 2];

    println!("  {name}");
    println!("    iterations : {ITERATIONS} ({unit})");
    println!("    min        : {:.3} ms", min.as_secs_f64() * 1000.0);
    println!("    median     : {:.3} ms", median.as_secs_f64() * 1000.0);
    println!("    mean       : {:.3} ms", mean.as_secs_f64() * 1000.0);
    println!("    max        : {:.3} ms", max.as_secs_f64() * 1000.0);
    println!();
}

/// Compile the proto into a fresh engine, returning the elapsed time.
fn compile_once(proto: &ScriptProto) -> Duration {
    let start = Instant::now();
    let mut engine = JitEngine::new(CodegenSettings::default()).expect("host engine");
    let func = VmFunction::script("Bench.Caller", proto.clone());
    engine.compile(&func).expect("compile");
    start.elapsed()
}

fn bench_compile(name: &str, proto: &ScriptProto) {
    // Warm-up run (not counted).
    let _ = compile_once(proto);
    let durations = (0..ITERATIONS).map(|_| compile_once(proto)).collect();
    report(name, "one compile each", durations);
}

fn bench_calls(name: &str, callee: Arc<VmFunction>) {
    let mut engine = JitEngine::new(CodegenSettings::default()).expect("host engine");
    if !callee.is_native() {
        engine.compile(&callee).expect("compile callee");
    }
    let func = VmFunction::script("Bench.Caller", caller(1, callee));
    engine.compile(&func).expect("compile caller");

    let mut ctx = ExecContext::new();
    let mut out = ReturnBuffer::new(&[RegType::INT]);
    let mut run = || {
        let start = Instant::now();
        for _ in 0..CALLS {
            ctx.call(&func, &[], out.descriptors_mut()).expect("call");
        }
        start.elapsed()
    };

    let _ = run();
    let durations = (0..ITERATIONS).map(|_| run()).collect();
    report(name, &format!("{CALLS} calls each"), durations);
}

fn main() {
    println!();
    println!("=== regvm-codegen benchmarks ({ITERATIONS} iterations each) ===");
    println!();

    bench_compile("compile: 1 native call site", &caller(1, add_native()));
    bench_compile("compile: 64 native call sites", &caller(64, add_native()));
    bench_compile("compile: 64 script call sites", &caller(64, sum_script()));

    bench_calls("call: script -> native", add_native());
    bench_calls("call: script -> script", sum_script());
}
