//! Collector configuration.
//!
//! `GcConfig` is plain data with `with_*` setters. [`GcConfig::from_env`]
//! overlays the `GC_*` environment variables on the defaults.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::GcError;

/// Called when an allocation cannot be satisfied. Receives the requested
/// size; may return memory to hand out instead of failing.
pub type OomHandler = Arc<dyn Fn(usize) -> Option<NonNull<u8>> + Send + Sync>;

/// Default heap block size.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Number of marker threads used when nothing else is configured.
#[must_use]
pub fn default_markers() -> usize {
    std::thread::available_parallelism()
        .map_or(1, std::num::NonZeroUsize::get)
        .min(4)
}

/// Tunables for a [`Collector`](crate::Collector).
#[derive(Clone)]
pub struct GcConfig {
    /// Heap block size in bytes. Power of two, at least 256.
    pub block_size: usize,
    /// Bytes reserved when the collector is created.
    pub initial_heap_size: usize,
    /// Smallest chunk the heap grows by.
    pub min_heap_increment: usize,
    /// Largest chunk the heap grows by in one step (requests larger than this
    /// still get what they need).
    pub max_heap_increment: usize,
    /// Hard cap on the heap size. `None` means unbounded.
    pub max_heap_size: Option<usize>,
    /// Marker threads including the collecting thread. 1 disables helpers.
    pub markers: usize,
    /// How far past a run start the block placer looks for a clean
    /// (not black-listed) placement before preferring heap growth.
    pub black_list_slack: usize,
    /// log2 of the bit count of each black-list table.
    pub black_list_log_entries: u32,
    /// Collect once `heap_size / free_space_divisor` bytes were allocated.
    pub free_space_divisor: usize,
    /// Lower bound on the bytes allocated between automatic collections.
    pub min_bytes_between_collections: usize,
    /// Pad every request by one byte so one-past-the-end pointers stay
    /// inside the object.
    pub extra_byte: bool,
    /// Treat pointers into the middle of an object as references to it.
    pub interior_pointers: bool,
    /// Scan registered thread stacks and registers as roots.
    pub scan_stacks: bool,
    /// Decommit free block runs that stayed free for this many collections.
    /// 0 keeps them committed.
    pub unmap_after_collections: u32,
    /// Never collect, neither automatically nor on request.
    pub dont_gc: bool,
    /// Log a summary line after every collection.
    pub print_stats: bool,
    /// Invoked when an allocation fails.
    pub oom_handler: Option<OomHandler>,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            initial_heap_size: 256 * 1024,
            min_heap_increment: 64 * 1024,
            max_heap_increment: 64 * 1024 * 1024,
            max_heap_size: None,
            markers: default_markers(),
            black_list_slack: 64 * DEFAULT_BLOCK_SIZE,
            black_list_log_entries: 18,
            free_space_divisor: 3,
            min_bytes_between_collections: 64 * 1024,
            extra_byte: false,
            interior_pointers: true,
            scan_stacks: true,
            unmap_after_collections: 4,
            dont_gc: false,
            print_stats: false,
            oom_handler: None,
        }
    }
}

impl fmt::Debug for GcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcConfig")
            .field("block_size", &self.block_size)
            .field("initial_heap_size", &self.initial_heap_size)
            .field("min_heap_increment", &self.min_heap_increment)
            .field("max_heap_increment", &self.max_heap_increment)
            .field("max_heap_size", &self.max_heap_size)
            .field("markers", &self.markers)
            .field("black_list_slack", &self.black_list_slack)
            .field("black_list_log_entries", &self.black_list_log_entries)
            .field("free_space_divisor", &self.free_space_divisor)
            .field("min_bytes_between_collections", &self.min_bytes_between_collections)
            .field("extra_byte", &self.extra_byte)
            .field("interior_pointers", &self.interior_pointers)
            .field("scan_stacks", &self.scan_stacks)
            .field("unmap_after_collections", &self.unmap_after_collections)
            .field("dont_gc", &self.dont_gc)
            .field("print_stats", &self.print_stats)
            .field("oom_handler", &self.oom_handler.is_some())
            .finish()
    }
}

impl GcConfig {
    /// Defaults overlaid with the `GC_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::InvalidConfig`] if a variable does not parse or the
    /// resulting configuration is invalid.
    pub fn from_env() -> Result<Self, GcError> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Overlays variables obtained from `lookup` on `self`.
    ///
    /// Recognized: `GC_INITIAL_HEAP_SIZE`, `GC_MAXIMUM_HEAP_SIZE`,
    /// `GC_MARKERS`, `GC_FREE_SPACE_DIVISOR`, `GC_DONT_GC`,
    /// `GC_PRINT_STATS`, `GC_UNMAP_THRESHOLD`, `GC_BLACK_LIST_SLACK`.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::InvalidConfig`] on malformed values.
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, GcError> {
        if let Some(v) = lookup("GC_INITIAL_HEAP_SIZE") {
            self.initial_heap_size = parse_size("GC_INITIAL_HEAP_SIZE", &v)?;
        }
        if let Some(v) = lookup("GC_MAXIMUM_HEAP_SIZE") {
            self.max_heap_size = Some(parse_size("GC_MAXIMUM_HEAP_SIZE", &v)?);
        }
        if let Some(v) = lookup("GC_MARKERS") {
            self.markers = parse_count("GC_MARKERS", &v)?;
        }
        if let Some(v) = lookup("GC_FREE_SPACE_DIVISOR") {
            self.free_space_divisor = parse_count("GC_FREE_SPACE_DIVISOR", &v)?;
        }
        if let Some(v) = lookup("GC_UNMAP_THRESHOLD") {
            let n = parse_count("GC_UNMAP_THRESHOLD", &v)?;
            self.unmap_after_collections = u32::try_from(n)
                .map_err(|_| GcError::InvalidConfig(format!("GC_UNMAP_THRESHOLD={v} is too large")))?;
        }
        if let Some(v) = lookup("GC_BLACK_LIST_SLACK") {
            self.black_list_slack = parse_size("GC_BLACK_LIST_SLACK", &v)?;
        }
        if let Some(v) = lookup("GC_DONT_GC") {
            self.dont_gc = parse_flag(&v);
        }
        if let Some(v) = lookup("GC_PRINT_STATS") {
            self.print_stats = parse_flag(&v);
        }
        self.validate()?;
        Ok(self)
    }

    /// Checks ranges and relationships between fields.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<(), GcError> {
        let bad = |msg: String| Err(GcError::InvalidConfig(msg));
        if !self.block_size.is_power_of_two() || self.block_size < 256 {
            return bad(format!("block_size {} must be a power of two >= 256", self.block_size));
        }
        // Offset maps store granule offsets as u16.
        if self.block_size / crate::heap::GRANULE_BYTES >= usize::from(u16::MAX) {
            return bad(format!("block_size {} is too large", self.block_size));
        }
        if self.markers == 0 {
            return bad("markers must be at least 1".to_owned());
        }
        if self.free_space_divisor == 0 {
            return bad("free_space_divisor must be at least 1".to_owned());
        }
        if self.min_heap_increment == 0 || self.max_heap_increment < self.min_heap_increment {
            return bad(format!(
                "heap increments {}..{} are not a valid range",
                self.min_heap_increment, self.max_heap_increment
            ));
        }
        if !(8..=30).contains(&self.black_list_log_entries) {
            return bad(format!(
                "black_list_log_entries {} must be within 8..=30",
                self.black_list_log_entries
            ));
        }
        if let Some(max) = self.max_heap_size {
            if max < self.initial_heap_size {
                return bad(format!(
                    "max_heap_size {max} is below initial_heap_size {}",
                    self.initial_heap_size
                ));
            }
        }
        Ok(())
    }

    #[must_use]
    pub const fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_initial_heap_size(mut self, bytes: usize) -> Self {
        self.initial_heap_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_heap_increments(mut self, min: usize, max: usize) -> Self {
        self.min_heap_increment = min;
        self.max_heap_increment = max;
        self
    }

    #[must_use]
    pub const fn with_max_heap_size(mut self, bytes: Option<usize>) -> Self {
        self.max_heap_size = bytes;
        self
    }

    #[must_use]
    pub const fn with_markers(mut self, markers: usize) -> Self {
        self.markers = markers;
        self
    }

    #[must_use]
    pub const fn with_black_list_slack(mut self, bytes: usize) -> Self {
        self.black_list_slack = bytes;
        self
    }

    #[must_use]
    pub const fn with_free_space_divisor(mut self, divisor: usize) -> Self {
        self.free_space_divisor = divisor;
        self
    }

    #[must_use]
    pub const fn with_min_bytes_between_collections(mut self, bytes: usize) -> Self {
        self.min_bytes_between_collections = bytes;
        self
    }

    #[must_use]
    pub const fn with_extra_byte(mut self, enabled: bool) -> Self {
        self.extra_byte = enabled;
        self
    }

    #[must_use]
    pub const fn with_interior_pointers(mut self, enabled: bool) -> Self {
        self.interior_pointers = enabled;
        self
    }

    /// Disabling stack scanning leaves only explicit roots and
    /// uncollectable objects; useful for deterministic tests.
    #[must_use]
    pub const fn with_scan_stacks(mut self, enabled: bool) -> Self {
        self.scan_stacks = enabled;
        self
    }

    #[must_use]
    pub const fn with_unmap_after_collections(mut self, collections: u32) -> Self {
        self.unmap_after_collections = collections;
        self
    }

    #[must_use]
    pub const fn with_dont_gc(mut self, dont_gc: bool) -> Self {
        self.dont_gc = dont_gc;
        self
    }

    #[must_use]
    pub const fn with_print_stats(mut self, enabled: bool) -> Self {
        self.print_stats = enabled;
        self
    }

    #[must_use]
    pub fn with_oom_handler(
        mut self,
        handler: impl Fn(usize) -> Option<NonNull<u8>> + Send + Sync + 'static,
    ) -> Self {
        self.oom_handler = Some(Arc::new(handler));
        self
    }
}

/// Parses `4096`, `64k`, `16M` or `1G` (suffixes are powers of 1024).
fn parse_size(key: &str, value: &str) -> Result<usize, GcError> {
    let value = value.trim();
    let (digits, shift) = match value.as_bytes().last() {
        Some(b'k' | b'K') => (&value[..value.len() - 1], 10),
        Some(b'm' | b'M') => (&value[..value.len() - 1], 20),
        Some(b'g' | b'G') => (&value[..value.len() - 1], 30),
        _ => (value, 0),
    };
    digits
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(1usize << shift))
        .ok_or_else(|| GcError::InvalidConfig(format!("{key}={value} is not a size")))
}

fn parse_count(key: &str, value: &str) -> Result<usize, GcError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| GcError::InvalidConfig(format!("{key}={value} is not a number")))
}

/// Set-style flag: present and not `0`/`false`/`off`/empty.
fn parse_flag(value: &str) -> bool {
    !matches!(value.trim(), "" | "0" | "false" | "off" | "no")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_validate() {
        GcConfig::default().validate().unwrap();
        assert!(GcConfig::default().markers >= 1);
    }

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size("X", "4096").unwrap(), 4096);
        assert_eq!(parse_size("X", "64k").unwrap(), 64 * 1024);
        assert_eq!(parse_size("X", "16M").unwrap(), 16 << 20);
        assert_eq!(parse_size("X", "1G").unwrap(), 1 << 30);
        assert!(parse_size("X", "lots").is_err());
        assert!(parse_size("X", "").is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let config = GcConfig::default()
            .with_env_overrides(env(&[
                ("GC_INITIAL_HEAP_SIZE", "1M"),
                ("GC_MAXIMUM_HEAP_SIZE", "8M"),
                ("GC_MARKERS", "3"),
                ("GC_DONT_GC", "1"),
                ("GC_PRINT_STATS", "0"),
                ("GC_UNMAP_THRESHOLD", "0"),
            ]))
            .unwrap();
        assert_eq!(config.initial_heap_size, 1 << 20);
        assert_eq!(config.max_heap_size, Some(8 << 20));
        assert_eq!(config.markers, 3);
        assert!(config.dont_gc);
        assert!(!config.print_stats);
        assert_eq!(config.unmap_after_collections, 0);
    }

    #[test]
    fn env_rejects_garbage() {
        let err = GcConfig::default()
            .with_env_overrides(env(&[("GC_MARKERS", "many")]))
            .unwrap_err();
        assert!(matches!(err, GcError::InvalidConfig(_)));

        let err = GcConfig::default()
            .with_env_overrides(env(&[("GC_MARKERS", "0")]))
            .unwrap_err();
        assert!(matches!(err, GcError::InvalidConfig(_)));
    }

    #[test]
    fn validate_rejects_bad_geometry() {
        assert!(GcConfig::default().with_block_size(3000).validate().is_err());
        assert!(GcConfig::default().with_block_size(128).validate().is_err());
        assert!(GcConfig::default().with_block_size(1 << 16).validate().is_ok());
        assert!(GcConfig::default()
            .with_initial_heap_size(1 << 20)
            .with_max_heap_size(Some(1 << 16))
            .validate()
            .is_err());
    }
}
