/// Coordinator counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JitStats {
    /// Calls to `run`
    pub runs: u64,
    /// Block lookups requested by generated code
    pub lookups: u64,
    /// Lookups answered from the block table
    pub cache_hits: u64,
    /// Lookups that had to translate and compile
    pub cache_misses: u64,
    /// Blocks emitted
    pub blocks_compiled: u64,
    /// Full cache clears performed
    pub full_clears: u64,
    /// Selective (range) invalidations performed
    pub range_invalidations: u64,
    /// Full clears forced by low code memory
    pub pressure_evictions: u64,
    /// Return stack buffer resets
    pub rsb_resets: u64,
}

impl JitStats {
    pub fn hit_ratio(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.lookups as f64
        }
    }
}
