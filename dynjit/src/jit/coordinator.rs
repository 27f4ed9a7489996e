//! Execution driver, lazy block lookup and deferred cache invalidation.
//!
//! Generated code calls back into [`BlockCompiler`] whenever it needs the
//! block for the current guest context. Invalidation requests made while
//! code runs cannot free that code underneath it, so they only raise the
//! halt flag; the pending work is performed once `run_code` has returned.

use std::sync::Arc;

use crate::backend::{BlockEmitter, CodePtr, CodeRuntime, RunCodeCallbacks, Translator};
use crate::config::{UserCallbacks, UserConfig};
use crate::error::JitError;
use crate::location::LocationDescriptor;
use crate::opt;
use crate::state::GuestState;
use crate::stats::JitStats;
use crate::trace::{TraceBuffer, TraceEvent};

use super::handle::{ExecutionGuard, JitHandle, Shared};

/// Everything the lookup callback needs while generated code holds the
/// runtime and guest state.
pub(crate) struct BlockCompiler<C, T, E> {
    pub(crate) callbacks: C,
    pub(crate) translator: T,
    pub(crate) emitter: E,
    pub(crate) shared: Arc<Shared>,
    low_water_mark: usize,
    pub(crate) stats: JitStats,
    pub(crate) trace: TraceBuffer,
}

impl<C: UserCallbacks, T: Translator, E> BlockCompiler<C, T, E> {
    /// Entry point for the block at the state's current location, compiling
    /// it on a miss.
    pub(crate) fn get_current_block<R>(&mut self, code: &mut R, state: &mut GuestState) -> CodePtr
    where
        R: CodeRuntime,
        E: BlockEmitter<R>,
    {
        let location = state.location();
        self.stats.lookups += 1;

        if let Some(block) = self.emitter.get_basic_block(location) {
            self.stats.cache_hits += 1;
            self.trace.record(TraceEvent::CacheLookup {
                pc: location.pc(),
                hit: true,
            });
            log::trace!("[JIT] Lookup hit at {}", location);
            return block.entrypoint;
        }

        self.stats.cache_misses += 1;
        self.trace.record(TraceEvent::CacheLookup {
            pc: location.pc(),
            hit: false,
        });

        let remaining = code.space_remaining();
        if remaining < self.low_water_mark {
            log::info!(
                "[JIT] Code memory low ({} bytes left, mark {}), clearing cache",
                remaining,
                self.low_water_mark
            );
            self.stats.pressure_evictions += 1;
            self.trace.record(TraceEvent::PressureEviction {
                remaining,
                low_water_mark: self.low_water_mark,
            });
            self.shared.pending().entire = true;
            self.perform_requested_cache_invalidation(code, state);
        }

        let callbacks = &mut self.callbacks;
        let mut block = self
            .translator
            .translate(location, &mut |vaddr| callbacks.memory_read_code(vaddr));
        opt::dead_code_elimination(&mut block);
        log::trace!("[JIT] IR for {}:\n{}", location, block);
        opt::verification_pass(&block);

        let descriptor = self.emitter.emit(code, &block);
        let guest_range = block.guest_range();
        self.stats.blocks_compiled += 1;
        self.trace.record(TraceEvent::BlockCompiled {
            pc: location.pc(),
            guest_range,
            host_size: descriptor.size,
            insts: block.live_len(),
        });
        log::debug!(
            "[JIT] Compiled {} guest=[{:#x}, {:#x}] ({} insts, {} cycles, {} bytes)",
            location,
            guest_range.0,
            guest_range.1,
            block.live_len(),
            block.cycle_count(),
            descriptor.size
        );

        descriptor.entrypoint
    }

    /// Carry out whatever invalidation is pending. Must not be called while
    /// generated code is on the stack, except from the lookup path before a
    /// new block is emitted.
    pub(crate) fn perform_requested_cache_invalidation<R>(
        &mut self,
        code: &mut R,
        state: &mut GuestState,
    ) where
        R: CodeRuntime,
        E: BlockEmitter<R>,
    {
        let mut pending = self.shared.pending();
        if pending.is_empty() {
            return;
        }

        state.rsb.reset();
        self.stats.rsb_resets += 1;

        if pending.entire {
            code.clear_cache();
            self.emitter.clear_cache();
            self.stats.full_clears += 1;
            self.trace.record(TraceEvent::CacheInvalidate {
                ranges: None,
                reason: "clear all",
            });
            log::info!("[JIT] Cleared entire code cache");
        } else {
            self.emitter.invalidate_cache_ranges(code, &pending.ranges);
            self.stats.range_invalidations += 1;
            self.trace.record(TraceEvent::CacheInvalidate {
                ranges: Some(pending.ranges.iter().collect()),
                reason: "guest ranges",
            });
            log::debug!("[JIT] Invalidated guest ranges {:?}", pending.ranges);
        }

        pending.clear();
    }
}

impl<C, T, E, R> RunCodeCallbacks<R> for BlockCompiler<C, T, E>
where
    C: UserCallbacks,
    T: Translator,
    R: CodeRuntime,
    E: BlockEmitter<R>,
{
    fn lookup_block(&mut self, code: &mut R, state: &mut GuestState) -> CodePtr {
        self.get_current_block(code, state)
    }

    fn add_ticks(&mut self, ticks: u64) {
        self.callbacks.add_ticks(ticks);
    }

    fn get_ticks_remaining(&mut self) -> u64 {
        self.callbacks.get_ticks_remaining()
    }
}

/// Owns the guest state, the code runtime and the lookup path.
pub(crate) struct Coordinator<C, T, E, R> {
    pub(crate) state: GuestState,
    pub(crate) runtime: R,
    pub(crate) compiler: BlockCompiler<C, T, E>,
}

impl<C, T, E, R> Coordinator<C, T, E, R>
where
    C: UserCallbacks,
    T: Translator,
    R: CodeRuntime,
    E: BlockEmitter<R>,
{
    pub(crate) fn new(
        config: UserConfig<C>,
        translator: T,
        emitter: E,
        runtime: R,
    ) -> Result<Self, JitError> {
        config.jit.validate()?;

        let trace = TraceBuffer::from_config(&config.jit);

        Ok(Self {
            state: GuestState::new(),
            runtime,
            compiler: BlockCompiler {
                callbacks: config.callbacks,
                translator,
                emitter,
                shared: Arc::new(Shared::default()),
                low_water_mark: config.jit.low_water_mark,
                stats: JitStats::default(),
                trace,
            },
        })
    }

    /// Execute guest code until a halt is requested or ticks run out.
    ///
    /// Panics if called while already executing.
    pub(crate) fn run(&mut self) {
        let executing = ExecutionGuard::enter(&self.compiler.shared);
        self.compiler.stats.runs += 1;

        // Requests made through a handle while idle.
        self.compiler
            .perform_requested_cache_invalidation(&mut self.runtime, &mut self.state);

        self.state.halt_flag().clear();
        self.compiler.trace.record(TraceEvent::RunEnter { pc: self.state.pc });
        log::trace!("[JIT] Run enter at {}", self.state.location());

        self.runtime.run_code(&mut self.state, &mut self.compiler);
        drop(executing);

        let halted = self.state.halt_flag().is_requested();
        self.compiler.trace.record(TraceEvent::RunExit {
            pc: self.state.pc,
            halted,
        });
        log::trace!("[JIT] Run exit at {} (halted={})", self.state.location(), halted);

        self.compiler
            .perform_requested_cache_invalidation(&mut self.runtime, &mut self.state);
    }

    pub(crate) fn clear_cache(&mut self) {
        self.compiler.shared.pending().entire = true;
        self.request_cache_invalidation("clear cache");
    }

    pub(crate) fn invalidate_cache_range(&mut self, start_address: u64, length: usize) {
        let recorded = self
            .compiler
            .shared
            .pending()
            .add_range(start_address, length as u64);
        if recorded {
            self.request_cache_invalidation("invalidate range");
        }
    }

    fn request_cache_invalidation(&mut self, reason: &'static str) {
        if self.compiler.shared.is_executing() {
            self.state.halt_flag().request();
            self.compiler.trace.record(TraceEvent::HaltRequested { reason });
            log::debug!("[JIT] Deferring invalidation until run returns ({})", reason);
            return;
        }
        self.compiler
            .perform_requested_cache_invalidation(&mut self.runtime, &mut self.state);
    }

    /// Zero the guest state. Compiled code is kept.
    pub(crate) fn reset(&mut self) {
        assert!(
            !self.compiler.shared.is_executing(),
            "reset called while the JIT is executing"
        );
        self.state.reset();
    }

    pub(crate) fn halt_execution(&self) {
        self.state.halt_flag().request();
    }

    pub(crate) fn is_executing(&self) -> bool {
        self.compiler.shared.is_executing()
    }

    pub(crate) fn handle(&self) -> JitHandle {
        JitHandle::new(
            Arc::clone(&self.compiler.shared),
            self.state.halt_flag().clone(),
        )
    }

    pub(crate) fn is_block_cached(&self, location: LocationDescriptor) -> bool {
        self.compiler.emitter.get_basic_block(location).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitConfig;
    use crate::ir::{self, Opcode, Value};
    use crate::testing::{self, TestEnv, ToyTranslator};
    use crate::threaded::{ThreadedEmitter, ThreadedRuntime};

    type TestCoordinator = Coordinator<TestEnv, ToyTranslator, ThreadedEmitter, ThreadedRuntime>;

    fn coordinator(env: TestEnv, config: JitConfig) -> TestCoordinator {
        testing::init_logging();
        let runtime = ThreadedRuntime::with_config(&config);
        Coordinator::new(
            UserConfig::with_config(env, config),
            ToyTranslator::default(),
            ThreadedEmitter::new(),
            runtime,
        )
        .unwrap()
    }

    fn lookup(jit: &mut TestCoordinator) -> CodePtr {
        jit.compiler.get_current_block(&mut jit.runtime, &mut jit.state)
    }

    fn loc(pc: u64) -> LocationDescriptor {
        LocationDescriptor::new(pc, 0)
    }

    #[test]
    fn test_lookup_compiles_once_then_hits() {
        let env = TestEnv::with_program(0x1000, &[testing::movz(1, 7), testing::b(0)]);
        let mut jit = coordinator(env, JitConfig::default());
        jit.state.pc = 0x1000;

        let first = lookup(&mut jit);
        let second = lookup(&mut jit);

        assert_eq!(first, second);
        assert_eq!(jit.compiler.translator.translations, vec![0x1000]);
        assert_eq!(jit.compiler.stats.cache_misses, 1);
        assert_eq!(jit.compiler.stats.cache_hits, 1);
    }

    #[test]
    fn test_lookup_keys_on_fpcr_as_well_as_pc() {
        let env = TestEnv::with_program(0x1000, &[testing::b(0)]);
        let mut jit = coordinator(env, JitConfig::default());
        jit.state.pc = 0x1000;
        lookup(&mut jit);
        jit.state.set_fpcr(0x0040_0000);
        lookup(&mut jit);
        assert_eq!(jit.compiler.translator.translations, vec![0x1000, 0x1000]);
    }

    #[test]
    fn test_pressure_clears_cache_before_compiling() {
        let config = JitConfig {
            code_cache_size: 4095,
            low_water_mark: 4096,
            trace_enabled: true,
            ..Default::default()
        };
        let env = TestEnv::with_program(0x1000, &[testing::b(0)]);
        let mut jit = coordinator(env, config);
        jit.state.pc = 0x1000;
        jit.state.rsb.push(0x42, Some(CodePtr(0)));

        let entry = lookup(&mut jit);
        assert_eq!(jit.compiler.stats.pressure_evictions, 1);
        assert_eq!(jit.compiler.stats.full_clears, 1);
        assert!(jit.state.rsb.is_clear());

        // The block compiled after the clear survives an immediate re-lookup.
        assert_eq!(lookup(&mut jit), entry);
        assert_eq!(jit.compiler.stats.pressure_evictions, 1);
        assert_eq!(jit.compiler.stats.cache_hits, 1);

        let kinds: Vec<_> = jit
            .compiler
            .trace
            .events()
            .map(|event| match event {
                TraceEvent::CacheLookup { hit: false, .. } => "miss",
                TraceEvent::CacheLookup { hit: true, .. } => "hit",
                TraceEvent::PressureEviction { .. } => "evict",
                TraceEvent::CacheInvalidate { ranges: None, .. } => "clear",
                TraceEvent::BlockCompiled { .. } => "compile",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["miss", "evict", "clear", "compile", "hit"]);
    }

    #[test]
    fn test_request_while_executing_only_halts() {
        let env = TestEnv::with_program(0x1000, &[testing::b(0)]);
        let mut jit = coordinator(env, JitConfig::default());
        jit.state.pc = 0x1000;
        lookup(&mut jit);

        jit.compiler.shared.force_executing(true);
        jit.clear_cache();
        jit.invalidate_cache_range(0x1000, 4);

        assert!(jit.state.halt_flag().is_requested());
        assert!(jit.is_block_cached(loc(0x1000)));
        assert_eq!(jit.compiler.stats.full_clears, 0);

        jit.compiler.shared.force_executing(false);
        jit.compiler
            .perform_requested_cache_invalidation(&mut jit.runtime, &mut jit.state);
        assert!(!jit.is_block_cached(loc(0x1000)));
        assert_eq!(jit.compiler.stats.full_clears, 1);
        assert!(jit.compiler.shared.pending().is_empty());
    }

    #[test]
    fn test_perform_with_nothing_pending_is_noop() {
        let mut jit = coordinator(TestEnv::new(), JitConfig::default());
        jit.state.rsb.push(0x10, None);
        jit.compiler
            .perform_requested_cache_invalidation(&mut jit.runtime, &mut jit.state);
        assert!(!jit.state.rsb.is_clear());
        assert_eq!(jit.compiler.stats.rsb_resets, 0);
    }

    #[test]
    fn test_zero_length_invalidation_does_nothing() {
        let env = TestEnv::with_program(0x1000, &[testing::b(0)]);
        let mut jit = coordinator(env, JitConfig::default());
        jit.state.pc = 0x1000;
        lookup(&mut jit);
        jit.state.rsb.push(0x10, None);

        jit.invalidate_cache_range(0x1000, 0);

        assert!(jit.is_block_cached(loc(0x1000)));
        assert!(!jit.state.rsb.is_clear());
    }

    #[test]
    #[should_panic(expected = "re-entrant run")]
    fn test_run_while_executing_panics() {
        let mut jit = coordinator(TestEnv::new(), JitConfig::default());
        jit.compiler.shared.force_executing(true);
        jit.run();
    }

    #[test]
    #[should_panic(expected = "reset called while the JIT is executing")]
    fn test_reset_while_executing_panics() {
        let mut jit = coordinator(TestEnv::new(), JitConfig::default());
        jit.compiler.shared.force_executing(true);
        jit.reset();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = JitConfig {
            code_cache_size: 0,
            ..Default::default()
        };
        let result = Coordinator::new(
            UserConfig::with_config(TestEnv::new(), config),
            ToyTranslator::default(),
            ThreadedEmitter::new(),
            ThreadedRuntime::new(4096, Default::default()),
        );
        assert!(matches!(result, Err(JitError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_low_water_mark_rejected() {
        let config = JitConfig {
            code_cache_size: 1024,
            low_water_mark: 0,
            ..Default::default()
        };
        let result = Coordinator::new(
            UserConfig::with_config(TestEnv::new(), config),
            ToyTranslator::default(),
            ThreadedEmitter::new(),
            ThreadedRuntime::new(1024, Default::default()),
        );
        assert!(matches!(result, Err(JitError::InvalidConfig(_))));
    }

    /// Produces blocks with no terminal.
    struct UnterminatedTranslator;

    impl Translator for UnterminatedTranslator {
        fn translate(
            &mut self,
            location: LocationDescriptor,
            _read_code: &mut dyn FnMut(u64) -> u32,
        ) -> ir::Block {
            let mut block = ir::Block::new(location);
            block.append(Opcode::SetPC, &[Value::Imm(location.pc())]);
            block
        }
    }

    #[test]
    #[should_panic(expected = "has no terminal")]
    fn test_malformed_translation_is_fatal() {
        let mut jit = Coordinator::new(
            UserConfig::new(TestEnv::new()),
            UnterminatedTranslator,
            ThreadedEmitter::new(),
            ThreadedRuntime::with_config(&JitConfig::default()),
        )
        .unwrap();
        jit.compiler.get_current_block(&mut jit.runtime, &mut jit.state);
    }
}
