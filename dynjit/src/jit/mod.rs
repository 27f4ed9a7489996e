//! Public JIT facade.
//!
//! [`Jit`] is the only object a host talks to. It owns one guest context,
//! the block cache and the code runtime, and exposes the execution driver,
//! cache maintenance and guest register access. [`JitHandle`] carries halt
//! and invalidation requests to a JIT that may currently be running.

mod coordinator;
mod handle;

pub use handle::JitHandle;

use crate::backend::{BlockEmitter, CodeRuntime, Translator};
use crate::config::{UserCallbacks, UserConfig};
use crate::error::JitError;
use crate::location::LocationDescriptor;
use crate::state::{GuestState, Vector};
use crate::stats::JitStats;
use crate::trace::TraceBuffer;

use coordinator::Coordinator;

/// A dynamic binary translator for one guest execution context.
///
/// - `C`: host callbacks (code fetch, tick accounting)
/// - `T`: guest decoder producing IR
/// - `E`: block table and host code emitter
/// - `R`: code memory and the dispatcher that enters generated code
pub struct Jit<C, T, E, R> {
    inner: Coordinator<C, T, E, R>,
}

impl<C, T, E, R> Jit<C, T, E, R>
where
    C: UserCallbacks,
    T: Translator,
    R: CodeRuntime,
    E: BlockEmitter<R>,
{
    pub fn new(config: UserConfig<C>, translator: T, emitter: E, runtime: R) -> Result<Self, JitError> {
        Ok(Self {
            inner: Coordinator::new(config, translator, emitter, runtime)?,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Execution
    // ═══════════════════════════════════════════════════════════════════════

    /// Run guest code until the tick budget is exhausted or a halt is
    /// requested. Invalidation requested during the run is performed before
    /// this returns.
    ///
    /// # Panics
    ///
    /// If the JIT is already executing.
    pub fn run(&mut self) {
        self.inner.run();
    }

    /// Ask running code to return at its next safe point. Has no lasting
    /// effect when called while idle, since `run` clears the flag on entry.
    pub fn halt_execution(&self) {
        self.inner.halt_execution();
    }

    pub fn is_executing(&self) -> bool {
        self.inner.is_executing()
    }

    /// Handle usable from inside callbacks or other threads.
    pub fn handle(&self) -> JitHandle {
        self.inner.handle()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Cache maintenance
    // ═══════════════════════════════════════════════════════════════════════

    /// Discard all compiled code.
    pub fn clear_cache(&mut self) {
        self.inner.clear_cache();
    }

    /// Discard compiled code for blocks overlapping
    /// `[start_address, start_address + length)`.
    pub fn invalidate_cache_range(&mut self, start_address: u64, length: usize) {
        self.inner.invalidate_cache_range(start_address, length);
    }

    pub fn is_block_cached(&self, location: LocationDescriptor) -> bool {
        self.inner.is_block_cached(location)
    }

    /// Zero all guest state. Compiled code is kept.
    ///
    /// # Panics
    ///
    /// If the JIT is executing.
    pub fn reset(&mut self) {
        self.inner.reset();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Guest state
    // ═══════════════════════════════════════════════════════════════════════

    pub fn get_sp(&self) -> u64 {
        self.inner.state.sp
    }

    pub fn set_sp(&mut self, value: u64) {
        self.inner.state.sp = value;
    }

    pub fn get_pc(&self) -> u64 {
        self.inner.state.pc
    }

    pub fn set_pc(&mut self, value: u64) {
        self.inner.state.pc = value;
    }

    /// X0..X30; index 31 reads SP.
    pub fn get_register(&self, index: usize) -> Result<u64, JitError> {
        self.inner.state.get_register(index)
    }

    /// X0..X30; index 31 writes SP.
    pub fn set_register(&mut self, index: usize, value: u64) -> Result<(), JitError> {
        self.inner.state.set_register(index, value)
    }

    pub fn get_vector(&self, index: usize) -> Result<Vector, JitError> {
        self.inner.state.get_vector(index)
    }

    pub fn set_vector(&mut self, index: usize, value: Vector) -> Result<(), JitError> {
        self.inner.state.set_vector(index, value)
    }

    pub fn get_fpcr(&self) -> u32 {
        self.inner.state.get_fpcr()
    }

    pub fn set_fpcr(&mut self, value: u32) {
        self.inner.state.set_fpcr(value);
    }

    pub fn get_pstate(&self) -> u32 {
        self.inner.state.get_pstate()
    }

    pub fn set_pstate(&mut self, value: u32) {
        self.inner.state.set_pstate(value);
    }

    /// Context key the next lookup will use.
    pub fn location(&self) -> LocationDescriptor {
        self.inner.state.location()
    }

    pub fn state(&self) -> &GuestState {
        &self.inner.state
    }

    pub fn state_mut(&mut self) -> &mut GuestState {
        &mut self.inner.state
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Introspection
    // ═══════════════════════════════════════════════════════════════════════

    pub fn stats(&self) -> &JitStats {
        &self.inner.compiler.stats
    }

    /// Coordinator counters and trace summary as pretty-printed JSON.
    pub fn stats_json(&self) -> String {
        let report = serde_json::json!({
            "jit": self.stats(),
            "trace": self.trace().stats(),
        });
        serde_json::to_string_pretty(&report).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn trace(&self) -> &TraceBuffer {
        &self.inner.compiler.trace
    }

    pub fn trace_mut(&mut self) -> &mut TraceBuffer {
        &mut self.inner.compiler.trace
    }

    pub fn callbacks(&self) -> &C {
        &self.inner.compiler.callbacks
    }

    pub fn callbacks_mut(&mut self) -> &mut C {
        &mut self.inner.compiler.callbacks
    }

    pub fn translator(&self) -> &T {
        &self.inner.compiler.translator
    }

    pub fn emitter(&self) -> &E {
        &self.inner.compiler.emitter
    }

    pub fn runtime(&self) -> &R {
        &self.inner.runtime
    }
}
