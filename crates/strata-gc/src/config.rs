//! Heap configuration

use bitflags::bitflags;
use strata_alloc::AllocConfig;

/// Number of generations
pub const NUM_GENERATIONS: usize = 3;

/// Default collection thresholds for generations 0, 1 and 2
pub const DEFAULT_THRESHOLDS: [usize; NUM_GENERATIONS] = [2000, 10, 10];

/// Environment variable holding comma-separated thresholds, e.g. `700,10,10`
pub const ENV_THRESHOLDS: &str = "STRATA_GC_THRESHOLDS";
/// Environment variable disabling automatic collection when set to `1`
pub const ENV_DISABLE: &str = "STRATA_GC_DISABLE";
/// Environment variable holding debug flag names, e.g. `stats,saveall`
pub const ENV_DEBUG: &str = "STRATA_GC_DEBUG";

bitflags! {
    /// Collector diagnostics switches
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DebugFlags: u32 {
        /// Log a summary line per collection
        const STATS         = 1 << 0;
        /// Log every object found collectable
        const COLLECTABLE   = 1 << 1;
        /// Log every object quarantined
        const UNCOLLECTABLE = 1 << 2;
        /// Quarantine every unreachable object instead of freeing it
        const SAVEALL       = 1 << 5;
        /// Everything useful for hunting leaks
        const LEAK = Self::COLLECTABLE.bits() | Self::UNCOLLECTABLE.bits() | Self::SAVEALL.bits();
    }
}

impl DebugFlags {
    /// Parse a comma-separated list of flag names. Unknown names are skipped.
    pub fn parse(names: &str) -> Self {
        names.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .fold(Self::empty(), |flags, name| {
                flags
                    | match name.to_ascii_lowercase().as_str() {
                        "stats" => Self::STATS,
                        "collectable" => Self::COLLECTABLE,
                        "uncollectable" => Self::UNCOLLECTABLE,
                        "saveall" => Self::SAVEALL,
                        "leak" => Self::LEAK,
                        _ => Self::empty(),
                    }
            })
    }
}

/// Managed heap configuration
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Collection thresholds per generation; 0 disables that level
    pub thresholds: [usize; NUM_GENERATIONS],
    /// Whether tracking may trigger automatic collections (default: true)
    pub enabled: bool,
    /// Diagnostics switches
    pub debug: DebugFlags,
    /// Storage layer configuration
    pub alloc: AllocConfig,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            thresholds: DEFAULT_THRESHOLDS,
            enabled: true,
            debug: DebugFlags::empty(),
            alloc: AllocConfig::default(),
        }
    }
}

impl GcConfig {
    /// Default configuration overridden by `STRATA_GC_*` environment
    /// variables. Malformed values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = std::env::var(ENV_THRESHOLDS) {
            match parse_thresholds(&value) {
                Some(thresholds) => config.thresholds = thresholds,
                None => {
                    #[cfg(feature = "gc_logging")]
                    tracing::warn!(
                        target: "strata::gc",
                        value = value.as_str(),
                        "ignoring malformed {}", ENV_THRESHOLDS
                    );
                }
            }
        }
        if std::env::var(ENV_DISABLE).is_ok_and(|v| v.trim() == "1") {
            config.enabled = false;
        }
        if let Ok(value) = std::env::var(ENV_DEBUG) {
            config.debug = DebugFlags::parse(&value);
        }

        config
    }

    /// Replace the thresholds
    pub fn with_thresholds(mut self, t0: usize, t1: usize, t2: usize) -> Self {
        self.thresholds = [t0, t1, t2];
        self
    }

    /// Start with automatic collection disabled
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Replace the debug flags
    pub fn with_debug(mut self, debug: DebugFlags) -> Self {
        self.debug = debug;
        self
    }

    /// Replace the allocator configuration
    pub fn with_alloc(mut self, alloc: AllocConfig) -> Self {
        self.alloc = alloc;
        self
    }
}

/// `"700,10,10"` -> `[700, 10, 10]`. Missing trailing values keep defaults.
fn parse_thresholds(value: &str) -> Option<[usize; NUM_GENERATIONS]> {
    let mut thresholds = DEFAULT_THRESHOLDS;
    let mut parts = value.split(',');
    for slot in thresholds.iter_mut() {
        match parts.next() {
            Some(part) => *slot = part.trim().parse().ok()?,
            None => break,
        }
    }
    if parts.next().is_some() {
        return None;
    }
    Some(thresholds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GcConfig::default();
        assert_eq!(config.thresholds, [2000, 10, 10]);
        assert!(config.enabled);
        assert!(config.debug.is_empty());
    }

    #[test]
    fn test_parse_thresholds() {
        assert_eq!(parse_thresholds("700,5,3"), Some([700, 5, 3]));
        assert_eq!(parse_thresholds(" 100 "), Some([100, 10, 10]));
        assert_eq!(parse_thresholds("0,0,0"), Some([0, 0, 0]));
        assert_eq!(parse_thresholds("a,b"), None);
        assert_eq!(parse_thresholds("1,2,3,4"), None);
    }

    #[test]
    fn test_parse_debug_flags() {
        assert_eq!(DebugFlags::parse("stats"), DebugFlags::STATS);
        assert_eq!(
            DebugFlags::parse("Stats, saveall,bogus"),
            DebugFlags::STATS | DebugFlags::SAVEALL
        );
        assert!(DebugFlags::parse("leak").contains(DebugFlags::SAVEALL));
        assert!(DebugFlags::parse("").is_empty());
    }

    #[test]
    fn test_builders() {
        let config = GcConfig::default()
            .with_thresholds(1, 2, 3)
            .disabled()
            .with_debug(DebugFlags::STATS);
        assert_eq!(config.thresholds, [1, 2, 3]);
        assert!(!config.enabled);
        assert_eq!(config.debug, DebugFlags::STATS);
    }
}
