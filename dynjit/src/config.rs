//! Host configuration bundle.

use serde::{Deserialize, Serialize};

use crate::error::JitError;

/// Smallest accepted `low_water_mark` (bytes). Every compiled block must fit
/// in this much code memory.
pub const MIN_LOW_WATER_MARK: usize = 4 * 1024;

/// Host callbacks consulted by the JIT.
pub trait UserCallbacks {
    /// Fetch a 32-bit guest code word for the translator.
    fn memory_read_code(&mut self, vaddr: u64) -> u32;

    /// Report ticks consumed by a `run` call.
    fn add_ticks(&mut self, ticks: u64);

    /// Tick budget available to the next `run` call.
    fn get_ticks_remaining(&mut self) -> u64;
}

/// When a block's cycle cost is charged against the tick budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickAccounting {
    /// Charge after the block has run; a run may overshoot its budget by at
    /// most one block.
    #[default]
    AfterBlock,
    /// Enter a block only if its cost fits the remaining budget. The first
    /// block of a run is always entered so every run makes progress.
    BeforeBlock,
}

/// JIT tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Code memory given to the runtime (bytes)
    pub code_cache_size: usize,

    /// Remaining code memory below which the whole cache is cleared before
    /// compiling another block. Must exceed the largest block and be at least
    /// [`MIN_LOW_WATER_MARK`].
    pub low_water_mark: usize,

    /// Tick budget semantics
    pub tick_accounting: TickAccounting,

    /// Record JIT events into the trace ring buffer
    pub trace_enabled: bool,

    /// Events kept in the trace ring buffer
    pub trace_capacity: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            code_cache_size: 16 * 1024 * 1024, // 16MB code memory
            low_water_mark: 1024 * 1024,       // clear all below 1MB
            tick_accounting: TickAccounting::AfterBlock,
            trace_enabled: false,
            trace_capacity: 1024,
        }
    }
}

impl JitConfig {
    pub fn validate(&self) -> Result<(), JitError> {
        if self.code_cache_size == 0 {
            return Err(JitError::InvalidConfig("code_cache_size must be non-zero"));
        }
        if self.low_water_mark < MIN_LOW_WATER_MARK {
            return Err(JitError::InvalidConfig(
                "low_water_mark is smaller than the largest block",
            ));
        }
        if self.trace_enabled && self.trace_capacity == 0 {
            return Err(JitError::InvalidConfig(
                "trace_capacity must be non-zero when tracing is enabled",
            ));
        }
        Ok(())
    }
}

/// Everything needed to construct a JIT instance.
pub struct UserConfig<C> {
    pub callbacks: C,
    pub jit: JitConfig,
}

impl<C: UserCallbacks> UserConfig<C> {
    pub fn new(callbacks: C) -> Self {
        Self {
            callbacks,
            jit: JitConfig::default(),
        }
    }

    pub fn with_config(callbacks: C, jit: JitConfig) -> Self {
        Self { callbacks, jit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = JitConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.low_water_mark < config.code_cache_size);
    }

    #[test]
    fn test_zero_cache_rejected() {
        let config = JitConfig {
            code_cache_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(JitError::InvalidConfig(_))));
    }

    #[test]
    fn test_low_water_mark_floor() {
        for low_water_mark in [0, 64, MIN_LOW_WATER_MARK - 1] {
            let config = JitConfig {
                code_cache_size: 1024,
                low_water_mark,
                ..Default::default()
            };
            assert!(matches!(config.validate(), Err(JitError::InvalidConfig(_))));
        }
        let config = JitConfig {
            low_water_mark: MIN_LOW_WATER_MARK,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_trace_capacity_rejected_only_when_enabled() {
        let mut config = JitConfig {
            trace_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        config.trace_enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: JitConfig =
            serde_json::from_str(r#"{"low_water_mark": 4096, "tick_accounting": "before_block"}"#)
                .unwrap();
        assert_eq!(config.low_water_mark, 4096);
        assert_eq!(config.tick_accounting, TickAccounting::BeforeBlock);
        assert_eq!(config.code_cache_size, JitConfig::default().code_cache_size);
    }
}
