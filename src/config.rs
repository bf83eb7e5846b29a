use std::env;
use std::mem;

/// The native machine word, in bytes. All heap addresses are word aligned.
pub const WORD_SIZE: usize = mem::size_of::<usize>();

/// Allocation alignment in words. Every object starts on a boundary of
/// `ALLOCATION_ALIGNMENT` bytes, which is also the granularity of the
/// object metadata bytemap.
pub const ALLOCATION_ALIGNMENT_WORDS: usize = 2;
pub const ALLOCATION_ALIGNMENT: usize = ALLOCATION_ALIGNMENT_WORDS * WORD_SIZE;

/// The number of bytes in a single line.
pub const LINE_SIZE: usize = 128;
pub const WORDS_IN_LINE: usize = LINE_SIZE / WORD_SIZE;

/// The number of bytes in a block.
pub const BLOCK_SIZE: usize = 32 * 1024;
pub const WORDS_IN_BLOCK: usize = BLOCK_SIZE / WORD_SIZE;

/// The number of lines in a block.
pub const LINE_COUNT: usize = BLOCK_SIZE / LINE_SIZE;

/// Object metadata bytes covering one line / one block.
pub const METAS_PER_LINE: usize = WORDS_IN_LINE / ALLOCATION_ALIGNMENT_WORDS;
pub const METAS_PER_BLOCK: usize = WORDS_IN_BLOCK / ALLOCATION_ALIGNMENT_WORDS;

/// The minimum chunk handed out by the large allocator. Free chunks are
/// size-bucketed in `BLOCK_SIZE / MIN_CHUNK_SIZE - 1` free lists.
pub const MIN_CHUNK_SIZE: usize = 1024;
pub const FREE_LIST_COUNT: usize = BLOCK_SIZE / MIN_CHUNK_SIZE - 1;

/// Objects of at least this many bytes bypass the bump allocator and go
/// through the large allocator instead.
pub const LARGE_OBJECT_MIN: usize = 8 * 1024;

/// The number of object pointers a single grey packet can carry.
pub const GREY_PACKET_ITEMS: usize = 126;

/// Runtime-tunable knobs. Compile-time layout constants live above; the
/// values here may also be overridden from the environment, one
/// `GREYLINE_*` variable per field.
#[derive(Clone)]
pub struct Config {
    /// Committed heap size at startup, rounded up to whole blocks.
    pub initial_heap_size: usize,

    /// Upper bound the heap may grow to, rounded up to whole blocks.
    pub max_heap_size: usize,

    /// Soft cap on the number of young blocks handed out between young
    /// collections. `None` resolves to half the committed block count.
    pub max_young_blocks: Option<usize>,

    /// The number of collections a block must survive before it is
    /// promoted to the old generation.
    pub max_young_age: u8,

    /// Object arrays longer than this are traced in batches rather than
    /// inline.
    pub array_split_threshold: usize,

    /// The number of array fields covered by one refrange packet.
    pub array_split_batch: usize,

    /// A marker that traced more than this many fields while draining a
    /// single packet splits the remainder off for an idle worker.
    pub mark_max_work_per_packet: usize,

    /// Allocate large and explicitly pretenured objects directly into old
    /// blocks, skipping the promotion treadmill.
    pub pretenure: bool,

    /// The number of marker/sweeper worker threads. `None` resolves to
    /// the number of CPUs minus one (the collecting thread itself also
    /// marks and sweeps).
    pub gc_workers: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_heap_size: 4 * 1024 * 1024,
            max_heap_size: 128 * 1024 * 1024,
            max_young_blocks: None,
            max_young_age: 2,
            array_split_threshold: 1024,
            array_split_batch: 256,
            mark_max_work_per_packet: 4096,
            pretenure: false,
            gc_workers: None,
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|raw| raw.parse().ok())
}

impl Config {
    /// The default configuration with `GREYLINE_*` environment overrides
    /// applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(value) = env_usize("GREYLINE_INITIAL_HEAP_SIZE") {
            config.initial_heap_size = value;
        }

        if let Some(value) = env_usize("GREYLINE_MAX_HEAP_SIZE") {
            config.max_heap_size = value;
        }

        if let Some(value) = env_usize("GREYLINE_MAX_YOUNG_BLOCKS") {
            config.max_young_blocks = Some(value);
        }

        if let Some(value) = env_usize("GREYLINE_MAX_YOUNG_AGE") {
            config.max_young_age = value as u8;
        }

        if let Some(value) = env_usize("GREYLINE_ARRAY_SPLIT_THRESHOLD") {
            config.array_split_threshold = value;
        }

        if let Some(value) = env_usize("GREYLINE_ARRAY_SPLIT_BATCH") {
            config.array_split_batch = value;
        }

        if let Some(value) = env_usize("GREYLINE_MARK_MAX_WORK_PER_PACKET") {
            config.mark_max_work_per_packet = value;
        }

        if let Ok(raw) = env::var("GREYLINE_PRETENURE") {
            config.pretenure = raw == "1" || raw == "true";
        }

        if let Some(value) = env_usize("GREYLINE_GC_WORKERS") {
            config.gc_workers = Some(value);
        }

        config
    }

    pub fn verify(&self) {
        assert!(LINE_SIZE.is_power_of_two());
        assert!(BLOCK_SIZE.is_power_of_two());
        assert!(ALLOCATION_ALIGNMENT <= LINE_SIZE && LINE_SIZE <= BLOCK_SIZE);
        assert!(self.initial_heap_size >= 4 * BLOCK_SIZE);
        assert!(self.initial_heap_size <= self.max_heap_size);
        assert!(self.max_young_age >= 1);
        assert!(self.array_split_batch.is_power_of_two());
        assert!(self.array_split_batch >= 1);
    }

    pub fn worker_count(&self) -> usize {
        self.gc_workers
            .unwrap_or_else(|| num_cpus::get().saturating_sub(1))
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_constants() {
        assert_eq!(METAS_PER_LINE, 8);
        assert_eq!(LINE_COUNT, 256);
        assert_eq!(METAS_PER_BLOCK, LINE_COUNT * METAS_PER_LINE);
        assert_eq!(FREE_LIST_COUNT, 31);
    }

    #[test]
    fn test_default_config_is_valid() {
        Config::default().verify();
    }
}
