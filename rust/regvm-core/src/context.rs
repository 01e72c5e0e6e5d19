//! Execution context: the per-thread state generated code runs against.
//!
//! One `ExecContext` is passed (as a raw pointer) into every compiled entry.
//! It owns the frame stack, the call counter incremented by script calls, the
//! cycle clock and the pending abort of the unwind channel.

use std::mem::offset_of;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use crate::abort::{AbortKind, VmAbort};
use crate::frame::{FrameLayout, VmFrame};
use crate::function::{NativeArgs, VmFunction};
use crate::value::{VmReturn, VmValue};

/// Entry result signalling that an abort is pending in the context.
pub const CALL_UNWOUND: i32 = -1;

/// Accumulates time spent running script code. Paused while host code runs.
#[derive(Debug, Default)]
pub struct CycleClock {
    started: Option<Instant>,
    total: Duration,
}

impl CycleClock {
    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    pub fn resume(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    /// Stop the clock; returns whether it was running.
    pub fn pause(&mut self) -> bool {
        match self.started.take() {
            Some(t) => {
                self.total += t.elapsed();
                true
            }
            None => false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.total + self.started.map(|t| t.elapsed()).unwrap_or_default()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub pushed: u64,
    pub popped: u64,
    pub max_depth: usize,
}

#[repr(C)]
pub struct ExecContext {
    call_count: u64,
    frames: Vec<Box<VmFrame>>,
    clock: CycleClock,
    pending: Option<VmAbort>,
    stats: FrameStats,
}

impl ExecContext {
    pub const CALL_COUNT_OFFSET: usize = offset_of!(ExecContext, call_count);

    pub fn new() -> Self {
        Self {
            call_count: 0,
            frames: Vec::new(),
            clock: CycleClock::default(),
            pending: None,
            stats: FrameStats::default(),
        }
    }

    /// Number of script calls made from generated code.
    pub fn call_count(&self) -> u64 {
        self.call_count
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn clock(&self) -> &CycleClock {
        &self.clock
    }

    pub fn raise(&mut self, abort: VmAbort) {
        if let Some(prev) = &self.pending {
            tracing::debug!(previous = %prev, "replacing pending abort");
        }
        self.pending = Some(abort);
    }

    pub fn exception(&self) -> Option<&VmAbort> {
        self.pending.as_ref()
    }

    pub fn take_exception(&mut self) -> Option<VmAbort> {
        self.pending.take()
    }

    /// Allocate a frame and fill its registers from `args`.
    pub fn push_frame(
        &mut self,
        layout: &FrameLayout,
        args: &[VmValue],
    ) -> Result<*mut VmFrame, VmAbort> {
        let mut frame = VmFrame::new(layout);
        frame.fill_params(args)?;
        let ptr: *mut VmFrame = &mut *frame;
        self.frames.push(frame);
        self.stats.pushed += 1;
        self.stats.max_depth = self.stats.max_depth.max(self.frames.len());
        Ok(ptr)
    }

    pub fn pop_frame(&mut self) {
        if self.frames.pop().is_some() {
            self.stats.popped += 1;
        } else {
            tracing::error!("frame stack underflow");
        }
    }

    /// Run a host function, translating aborts and panics into annotated
    /// `VmAbort`s.
    pub fn call_native(
        &mut self,
        func: &VmFunction,
        params: &[VmValue],
        returns: &mut [VmReturn],
    ) -> Result<i32, VmAbort> {
        let Some(native) = func.native_fn() else {
            return Err(VmAbort::new(
                AbortKind::BadArgument,
                format!("{} is not a native function", func.name()),
            ));
        };
        let args = NativeArgs::new(params, func.defaults());

        let running = self.clock.pause();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| native(&args, returns)));
        if running {
            self.clock.resume();
        }

        let mut abort = match outcome {
            Ok(Ok(n)) => return Ok(n.max(0)),
            Ok(Err(abort)) => abort,
            Err(payload) => VmAbort::from_panic(payload),
        };
        abort.maybe_print_message();
        abort.push_frame(func.name());
        Err(abort)
    }

    /// Call a function from outside generated code. A pending abort surfaces
    /// as `Err`.
    pub fn call(
        &mut self,
        func: &VmFunction,
        args: &[VmValue],
        returns: &mut [VmReturn],
    ) -> Result<i32, VmAbort> {
        let outermost = !self.clock.is_running();
        self.clock.resume();
        let result = self.dispatch(func, args, returns);
        if outermost {
            self.clock.pause();
        }
        result
    }

    fn dispatch(
        &mut self,
        func: &VmFunction,
        args: &[VmValue],
        returns: &mut [VmReturn],
    ) -> Result<i32, VmAbort> {
        if func.is_native() {
            return self.call_native(func, args, returns);
        }
        let Some(entry) = func.script_entry() else {
            return Err(VmAbort::new(
                AbortKind::NotCompiled,
                format!("{} has no entry", func.name()),
            ));
        };
        let depth = self.frames.len();
        // SAFETY: the entry follows the script convention; every pointer
        // passed here outlives the call.
        let r = unsafe {
            entry(
                self as *mut ExecContext,
                func as *const VmFunction,
                args.as_ptr(),
                args.len() as i32,
                returns.as_mut_ptr(),
                returns.len() as i32,
            )
        };
        if r >= 0 {
            return Ok(r);
        }
        // Frames left behind by an unwinding callee are discarded here.
        while self.frames.len() > depth {
            self.pop_frame();
        }
        Err(self.take_exception().unwrap_or_else(|| {
            VmAbort::new(AbortKind::Other, "call unwound without a pending abort")
        }))
    }
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecContext")
            .field("call_count", &self.call_count)
            .field("depth", &self.frames.len())
            .field("pending", &self.pending)
            .field("stats", &self.stats)
            .finish()
    }
}
