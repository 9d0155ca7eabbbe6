use once_cell::sync::Lazy;

/// Default byte capacity of a pool-managed [`crate::data::ByteBlock`].
pub static DEFAULT_BLOCK_SIZE: Lazy<usize> =
	lazy_env_parse!("DISTFLOW_DEFAULT_BLOCK_SIZE", usize, 2 * 1024 * 1024);

/// Resident-byte threshold above which the block pool starts evicting unpinned
/// blocks to the spill directory.
pub static BLOCK_POOL_SOFT_LIMIT_BYTES: Lazy<usize> =
	lazy_env_parse!("DISTFLOW_BLOCK_POOL_SOFT_LIMIT_BYTES", usize, 512 * 1024 * 1024);

/// Resident-byte ceiling the pool will never exceed; allocations suspend until
/// eviction or a pin release frees enough room.
pub static BLOCK_POOL_HARD_LIMIT_BYTES: Lazy<usize> =
	lazy_env_parse!("DISTFLOW_BLOCK_POOL_HARD_LIMIT_BYTES", usize, 1024 * 1024 * 1024);

/// Directory spilled blocks are written into. Created lazily on first spill,
/// cleared on normal shutdown.
pub static SPILL_DIRECTORY: Lazy<String> = Lazy::new(|| {
	std::env::var("DISTFLOW_SPILL_DIRECTORY")
		.unwrap_or_else(|_| std::env::temp_dir().join("distflow-spill").to_string_lossy().into_owned())
});

/// Number of compute worker threads per host. Defaults to the available parallelism.
pub static WORKERS_PER_HOST: Lazy<usize> = Lazy::new(|| {
	std::env::var("DISTFLOW_WORKERS_PER_HOST")
		.ok()
		.and_then(|s| s.parse().ok())
		.unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
});

/// Whether the self-verify header (a type hash on every item, a size prefix on
/// every fixed-size send) is enabled. Off by default; meant for debug builds
/// and tests, per §6 of the specification.
pub static SELF_VERIFY: Lazy<bool> = lazy_env_parse!("DISTFLOW_SELF_VERIFY", bool, false);

/// Bound on the number of blocks buffered in a [`crate::data::BlockQueue`]
/// before the writer side awaits capacity.
pub const BLOCK_QUEUE_CAPACITY: usize = 64;

/// Bound on the number of jobs the dispatcher's cross-thread submission queue
/// will buffer before a submitter awaits capacity.
pub const DISPATCHER_JOB_QUEUE_CAPACITY: usize = 1024;

/// Batch size used when a source node pulls items from an external generator.
pub const GENERATE_BATCH_SIZE: usize = 1024;
