//! Kernel configuration
//!
//! A single typed struct with defaults and chained setters. Hosts that
//! enable the `serde` feature can load it from JSON or any other serde
//! format; missing fields fall back to the defaults.

use alloc::string::String;

use akern_memory_management::MemoryConfig;

/// Tunables of one kernel instance
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct KernelConfig {
    /// Simulated CPUs, one run queue each
    pub num_cpus: u32,
    /// DMA zone size in pages
    pub dma_pages: u64,
    /// DMA32 zone size in pages
    pub dma32_pages: u64,
    /// Normal zone size in pages
    pub normal_pages: u64,
    /// HighMem zone size in pages
    pub highmem_pages: u64,
    /// Movable zone size in pages
    pub movable_pages: u64,
    /// Device zone size in pages
    pub device_pages: u64,
    /// Swap slots
    pub swap_pages: u64,
    /// TLB entries
    pub tlb_capacity: usize,
    /// Pipe buffer size in bytes
    pub pipe_capacity: usize,
    /// Default message queue depth
    pub mq_max_messages: usize,
    /// Default message size limit in bytes
    pub mq_max_message_size: usize,
    /// Open descriptors per process
    pub max_fds_per_process: usize,
    /// Highest pid handed out before wrapping
    pub pid_max: u32,
    /// Kernel log ring capacity
    pub log_capacity: usize,
    /// Symlinks followed during one resolution
    pub max_symlink_depth: u32,
    /// Wakeup placement window below the queue's minimum vruntime
    pub sched_min_granularity_ns: u64,
    /// Round-robin time slice
    pub rr_timeslice_ns: u64,
    /// MLFQ levels
    pub mlfq_levels: usize,
    /// Quantum of the top MLFQ level; each lower level doubles it
    pub mlfq_base_quantum_ns: u64,
    /// Period of the global MLFQ priority boost
    pub mlfq_boost_interval_ns: u64,
    /// Lottery and stride tickets of a new task
    pub default_tickets: u32,
    /// Seed of the lottery generator
    pub lottery_seed: u64,
    /// Iterations a spinlock acquisition spins before giving up
    pub spin_limit: u32,
    /// Thread stack size when the caller passes zero
    pub default_stack_size: u64,
    /// Node name reported by `uname`
    pub hostname: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            num_cpus: 4,
            dma_pages: 1024,
            dma32_pages: 3072,
            normal_pages: 12288,
            highmem_pages: 0,
            movable_pages: 0,
            device_pages: 0,
            swap_pages: 4096,
            tlb_capacity: 64,
            pipe_capacity: 65536,
            mq_max_messages: 10,
            mq_max_message_size: 8192,
            max_fds_per_process: 1024,
            pid_max: 32768,
            log_capacity: 4096,
            max_symlink_depth: 8,
            sched_min_granularity_ns: 750_000,
            rr_timeslice_ns: 100_000_000,
            mlfq_levels: 4,
            mlfq_base_quantum_ns: 10_000_000,
            mlfq_boost_interval_ns: 1_000_000_000,
            default_tickets: 100,
            lottery_seed: 0x2545_f491_4f6c_dd1d,
            spin_limit: 1000,
            default_stack_size: 8 * 1024 * 1024,
            hostname: String::from("akern"),
        }
    }
}

impl KernelConfig {
    /// Sets the CPU count
    pub fn with_cpus(mut self, num_cpus: u32) -> Self {
        self.num_cpus = num_cpus;
        self
    }

    /// Sets the Normal zone size
    pub fn with_normal_pages(mut self, pages: u64) -> Self {
        self.normal_pages = pages;
        self
    }

    /// Sets every zone size at once, in DMA, DMA32, Normal, HighMem, Movable, Device order
    pub fn with_zone_pages(mut self, pages: [u64; 6]) -> Self {
        [
            self.dma_pages,
            self.dma32_pages,
            self.normal_pages,
            self.highmem_pages,
            self.movable_pages,
            self.device_pages,
        ] = pages;
        self
    }

    /// Sets the swap size
    pub fn with_swap_pages(mut self, pages: u64) -> Self {
        self.swap_pages = pages;
        self
    }

    /// Sets the TLB capacity
    pub fn with_tlb_capacity(mut self, entries: usize) -> Self {
        self.tlb_capacity = entries;
        self
    }

    /// Sets the pipe buffer size
    pub fn with_pipe_capacity(mut self, bytes: usize) -> Self {
        self.pipe_capacity = bytes;
        self
    }

    /// Sets message queue defaults
    pub fn with_message_queue_limits(mut self, max_messages: usize, max_size: usize) -> Self {
        self.mq_max_messages = max_messages;
        self.mq_max_message_size = max_size;
        self
    }

    /// Sets the per-process descriptor limit
    pub fn with_max_fds(mut self, max: usize) -> Self {
        self.max_fds_per_process = max;
        self
    }

    /// Sets the kernel log capacity
    pub fn with_log_capacity(mut self, entries: usize) -> Self {
        self.log_capacity = entries;
        self
    }

    /// Sets the round-robin slice
    pub fn with_rr_timeslice(mut self, ns: u64) -> Self {
        self.rr_timeslice_ns = ns;
        self
    }

    /// Sets MLFQ shape
    pub fn with_mlfq(mut self, levels: usize, base_quantum_ns: u64, boost_interval_ns: u64) -> Self {
        self.mlfq_levels = levels;
        self.mlfq_base_quantum_ns = base_quantum_ns;
        self.mlfq_boost_interval_ns = boost_interval_ns;
        self
    }

    /// Sets the lottery seed
    pub fn with_lottery_seed(mut self, seed: u64) -> Self {
        self.lottery_seed = seed;
        self
    }

    /// Sets the spinlock iteration limit
    pub fn with_spin_limit(mut self, limit: u32) -> Self {
        self.spin_limit = limit;
        self
    }

    /// Sets the node name
    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Memory manager settings derived from this configuration
    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            zone_pages: [
                self.dma_pages,
                self.dma32_pages,
                self.normal_pages,
                self.highmem_pages,
                self.movable_pages,
                self.device_pages,
            ],
            swap_pages: self.swap_pages,
            tlb_capacity: self.tlb_capacity,
            ..MemoryConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let config = KernelConfig::default()
            .with_cpus(2)
            .with_zone_pages([0, 0, 256, 0, 0, 0])
            .with_hostname("node1");
        assert_eq!(config.num_cpus, 2);
        assert_eq!(config.normal_pages, 256);
        assert_eq!(config.dma_pages, 0);
        assert_eq!(config.memory_config().zone_pages[2], 256);
        assert_eq!(config.hostname, "node1");
    }

    /// Missing fields fall back to the defaults
    #[cfg(feature = "serde")]
    #[test]
    fn test_partial_json_config() {
        let config: KernelConfig = serde_json::from_str(r#"{"num_cpus": 8, "hostname": "ci"}"#).unwrap();
        assert_eq!(config.num_cpus, 8);
        assert_eq!(config.hostname, "ci");
        assert_eq!(config.pipe_capacity, KernelConfig::default().pipe_capacity);

        let text = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<KernelConfig>(&text).unwrap(), config);
    }
}
