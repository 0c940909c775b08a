use std::sync::OnceLock;

use serde::Deserialize;

fn default_deadlock_timeout() -> f64 {
    600.0
}

fn default_heap_size() -> usize {
    256 * 1024 * 1024
}

fn default_block_size() -> usize {
    64 * 1024
}

fn default_cache_blocks() -> usize {
    512
}

fn default_vm_retry_max() -> usize {
    100
}

fn default_enable_shared_memory() -> bool {
    true
}

fn default_numa_enabled() -> bool {
    false
}

fn default_backend() -> String {
    "local".to_owned()
}

fn default_mapper() -> MapperKind {
    MapperKind::Block
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MapperKind {
    Block,
    Cyclic,
    ReverseBlock,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// A general timeout in seconds for operations which may indicate a deadlock
    /// (e.g. waiting for an evictable cache slot), default: 600.0 seconds
    #[serde(default = "default_deadlock_timeout")]
    pub deadlock_timeout: f64,

    /// Total size in bytes of the collectively reserved global address range, default: 256 MiB
    #[serde(default = "default_heap_size")]
    pub heap_size: usize,

    /// The coherence block size in bytes, a power of two, default: 64 KiB
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// The distribution policy used for new allocations, default: 'block'
    /// block         -- contiguous even partition across ranks
    /// cyclic        -- segments interleaved round-robin across ranks
    /// reverse_block -- block partition with owner order reflected
    #[serde(default = "default_mapper")]
    pub mapper: MapperKind,

    /// Segment size in bytes for the cyclic policy (multiple of block_size),
    /// default: block_size
    pub cyclic_seg_size: Option<usize>,

    /// Capacity of the remote-block cache in blocks, default: 512
    #[serde(default = "default_cache_blocks")]
    pub cache_blocks: usize,

    /// Map co-located ranks' home regions directly so local access bypasses the
    /// cache, default: true
    #[serde(default = "default_enable_shared_memory")]
    pub enable_shared_memory: bool,

    /// Apply NUMA bind/interleave policies to home regions, default: false
    #[serde(default = "default_numa_enabled")]
    pub numa_enabled: bool,

    /// Maximum number of attempts when collectively reserving the same virtual
    /// address range on every rank, default: 100
    #[serde(default = "default_vm_retry_max")]
    pub vm_retry_max: usize,

    /// The communication backend to use, default: 'local'
    /// local -- all ranks within a single process (also used by test harnesses)
    /// shmem -- multi process single node execution over POSIX shared memory
    #[serde(default = "default_backend")]
    pub backend: String,
}

/// Get the current environment variable configuration
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match envy::prefixed("TESSERA_").from_env::<Config>() {
        Ok(config) => config,
        Err(error) => panic!("{}", error),
    })
}
