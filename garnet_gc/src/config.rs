//! Collector configuration.

/// Tunables for the heap and trigger policy.
///
/// Defaults match the reference behavior: check allocation pressure every
/// few hundred allocations and collect when less than a tenth of the heap
/// is free.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Blocks added to an allocator the first time it is used.
    pub initial_blocks_per_allocator: usize,
    /// Allocations between free-ratio checks.
    pub check_free_every: usize,
    /// Collect when `free_cells * 100 / total_cells` drops below this.
    pub min_percent_free: usize,
    /// Dump collection counters to stderr at each collection.
    pub print_stats: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            initial_blocks_per_allocator: 1,
            check_free_every: 512,
            min_percent_free: 10,
            print_stats: std::env::var_os("GARNET_GC_STATS").is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_sane() {
        let config = GcConfig::default();
        assert!(config.check_free_every > 0);
        assert!(config.min_percent_free < 100);
        assert!(config.initial_blocks_per_allocator > 0);
    }
}
