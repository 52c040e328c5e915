//! Heap and collector configuration.

use std::str::FromStr;

/// Default moving-space capacity.
pub const DEFAULT_MOVING_SPACE_CAPACITY: usize = 64 << 20;
/// Default non-moving-space capacity.
pub const DEFAULT_NON_MOVING_CAPACITY: usize = 16 << 20;
/// Default immune-space capacity.
pub const DEFAULT_IMMUNE_CAPACITY: usize = 1 << 20;
/// Default TLAB size.
pub const DEFAULT_TLAB_SIZE: usize = 32 << 10;
/// Default initial mark-stack capacity, in entries.
pub const DEFAULT_MARK_STACK_CAPACITY: usize = 1024;
/// Objects at least this many pages go to the large-object space.
pub const DEFAULT_LARGE_OBJECT_PAGES: usize = 3;

/// Size of the compaction worker pool.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub const DEFAULT_COMPACTION_WORKERS: usize = 4;
/// Size of the compaction worker pool.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const DEFAULT_COMPACTION_WORKERS: usize = 2;

/// Environment variable forcing a compaction mode.
pub const MODE_ENV: &str = "RUDO_COMPACT_MODE";
/// Environment variable overriding the worker count.
pub const WORKERS_ENV: &str = "RUDO_COMPACT_WORKERS";

/// How compacted pages reach the mutators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompactionMode {
    /// Compact into a private buffer and install it with a copy operation.
    Copy,
    /// Compact into a shadow mapping and install it with a continue
    /// operation.
    Minor,
    /// No fault interception: compact everything inside the pause.
    Fallback,
}

impl CompactionMode {
    /// Lowercase name, as accepted by [`FromStr`].
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Minor => "minor",
            Self::Fallback => "fallback",
        }
    }
}

impl FromStr for CompactionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "copy" => Ok(Self::Copy),
            "minor" => Ok(Self::Minor),
            "fallback" | "stw" => Ok(Self::Fallback),
            other => Err(format!("unknown compaction mode `{other}`")),
        }
    }
}

/// Where page faults come from in the concurrent modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultSourceKind {
    /// Use the kernel's userfaultfd when it is available, otherwise emulate.
    Auto,
    /// Require userfaultfd; downgrade to [`CompactionMode::Fallback`] if it
    /// is missing.
    Kernel,
    /// In-process fault queue: mutator accessors request pages explicitly.
    Emulated,
}

/// Collector configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcConfig {
    /// Bytes reserved for the moving (bump-pointer) space.
    pub moving_space_capacity: usize,
    /// Bytes reserved for the non-moving space.
    pub non_moving_capacity: usize,
    /// Bytes reserved for the immune space.
    pub immune_capacity: usize,
    /// TLAB size handed to mutators.
    pub tlab_size: usize,
    /// Initial mark-stack capacity.
    pub mark_stack_capacity: usize,
    /// Objects of at least this many pages are allocated as large objects.
    pub large_object_pages: usize,
    /// Number of fault-handling worker threads.
    pub compaction_workers: usize,
    /// Forced compaction mode, if any.
    pub mode: Option<CompactionMode>,
    /// Fault source policy for the concurrent modes.
    pub fault_source: FaultSourceKind,
    /// When false the pause compacts every page even if faults are
    /// available.
    pub concurrent_compaction: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            moving_space_capacity: DEFAULT_MOVING_SPACE_CAPACITY,
            non_moving_capacity: DEFAULT_NON_MOVING_CAPACITY,
            immune_capacity: DEFAULT_IMMUNE_CAPACITY,
            tlab_size: DEFAULT_TLAB_SIZE,
            mark_stack_capacity: DEFAULT_MARK_STACK_CAPACITY,
            large_object_pages: DEFAULT_LARGE_OBJECT_PAGES,
            compaction_workers: DEFAULT_COMPACTION_WORKERS,
            mode: None,
            fault_source: FaultSourceKind::Auto,
            concurrent_compaction: true,
        }
    }
}

impl GcConfig {
    /// Defaults with `RUDO_COMPACT_MODE` and `RUDO_COMPACT_WORKERS` applied.
    /// Unparsable values are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`, which maps a variable name to its
    /// value.
    #[must_use]
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(mode) = lookup(MODE_ENV).and_then(|v| v.parse().ok()) {
            self.mode = Some(mode);
        }
        if let Some(workers) = lookup(WORKERS_ENV).and_then(|v| v.trim().parse().ok()) {
            self.set_compaction_workers(workers);
        }
        self
    }

    /// Sets the moving-space capacity.
    #[must_use]
    pub const fn moving_space_capacity(mut self, bytes: usize) -> Self {
        self.moving_space_capacity = bytes;
        self
    }

    /// Sets the non-moving-space capacity.
    #[must_use]
    pub const fn non_moving_capacity(mut self, bytes: usize) -> Self {
        self.non_moving_capacity = bytes;
        self
    }

    /// Sets the immune-space capacity.
    #[must_use]
    pub const fn immune_capacity(mut self, bytes: usize) -> Self {
        self.immune_capacity = bytes;
        self
    }

    /// Sets the TLAB size.
    #[must_use]
    pub const fn tlab_size(mut self, bytes: usize) -> Self {
        self.tlab_size = bytes;
        self
    }

    /// Sets the initial mark-stack capacity.
    #[must_use]
    pub const fn mark_stack_capacity(mut self, entries: usize) -> Self {
        self.mark_stack_capacity = entries;
        self
    }

    /// Forces a compaction mode.
    #[must_use]
    pub const fn mode(mut self, mode: CompactionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Sets the fault source policy.
    #[must_use]
    pub const fn fault_source(mut self, source: FaultSourceKind) -> Self {
        self.fault_source = source;
        self
    }

    /// Enables or disables concurrent compaction.
    #[must_use]
    pub const fn concurrent_compaction(mut self, enabled: bool) -> Self {
        self.concurrent_compaction = enabled;
        self
    }

    /// Sets the worker count; at least one worker always runs.
    pub const fn set_compaction_workers(&mut self, workers: usize) {
        self.compaction_workers = if workers < 1 { 1 } else { workers };
    }

    /// Builder form of [`GcConfig::set_compaction_workers`].
    #[must_use]
    pub const fn compaction_workers(mut self, workers: usize) -> Self {
        self.set_compaction_workers(workers);
        self
    }
}
