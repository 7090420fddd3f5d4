//! Host resources shared between engine processes.
//!
//! Every game runs its own engine, so the machine is split between `concurrency` engines.
//! [`ResourcesBuilder`] turns the host's CPUs and memory into the `Threads` and `Hash` UCI
//! options each engine receives, unless an engine configuration sets them itself.
//!
//! # Example
//!
//! ```no_run
//! use lichess_orchestrator::constraints::ResourcesBuilder;
//!
//! let resources = ResourcesBuilder::new()
//!     .with_total_ram(8_000)
//!     .with_threads_per_engine(2)
//!     .build(4)
//!     .unwrap();
//! ```

use std::collections::BTreeMap;
use std::env;

use anyhow::bail;
use tracing::warn;

const MIN_HASH_MB: usize = 16;

/// A builder for the resources given to each engine.
///
/// By default, available memory is read from the host and half of it is split between
/// engines, and physical CPUs are split evenly with at least one thread per engine.
#[derive(Debug, Default, Clone)]
pub struct ResourcesBuilder {
    total_ram: Option<usize>,
    hash_per_engine: Option<usize>,
    total_cpus: Option<usize>,
    threads_per_engine: Option<usize>,
}

impl ResourcesBuilder {
    /// Everything detected from the host.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder configured from environment variables.
    ///
    /// Read environment variables are:
    /// - `BOT_TOTAL_RAM` (usize): RAM in MB usable by all engines
    /// - `BOT_HASH_PER_ENGINE` (usize): `Hash` option in MB
    /// - `BOT_TOTAL_CPUS` (usize): CPUs usable by all engines
    /// - `BOT_THREADS_PER_ENGINE` (usize): `Threads` option
    #[must_use]
    pub fn from_env() -> Self {
        fn parse_usize(var: &str) -> Option<usize> {
            env::var(var).ok()?.parse().ok()
        }

        ResourcesBuilder {
            total_ram: parse_usize("BOT_TOTAL_RAM"),
            hash_per_engine: parse_usize("BOT_HASH_PER_ENGINE"),
            total_cpus: parse_usize("BOT_TOTAL_CPUS"),
            threads_per_engine: parse_usize("BOT_THREADS_PER_ENGINE"),
        }
    }

    /// Sets the RAM usable by all engines (in MB).
    #[must_use]
    pub fn with_total_ram(self, mb: usize) -> Self {
        Self {
            total_ram: Some(mb),
            ..self
        }
    }

    /// Sets the `Hash` option of each engine (in MB).
    #[must_use]
    pub fn with_hash_per_engine(self, mb: usize) -> Self {
        Self {
            hash_per_engine: Some(mb),
            ..self
        }
    }

    /// Sets the number of CPUs usable by all engines.
    #[must_use]
    pub fn with_total_cpus(self, count: usize) -> Self {
        Self {
            total_cpus: Some(count),
            ..self
        }
    }

    /// Sets the `Threads` option of each engine.
    #[must_use]
    pub fn with_threads_per_engine(self, count: usize) -> Self {
        Self {
            threads_per_engine: Some(count),
            ..self
        }
    }

    /// Splits the resources between `concurrency` engines.
    ///
    /// # Errors
    ///
    /// When the engines would need more memory than available, or `concurrency` is zero.
    pub fn build(self, concurrency: usize) -> anyhow::Result<Resources> {
        if concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        let total_ram = self.total_ram.unwrap_or_else(|| {
            let mut sys = sysinfo::System::new();
            sys.refresh_memory();
            (sys.available_memory() / 1_000_000) as usize / 2
        });

        // physical cores: hyperthreads slow every engine down
        let total_cpus = self.total_cpus.unwrap_or_else(num_cpus::get_physical);

        let threads = self
            .threads_per_engine
            .unwrap_or_else(|| (total_cpus / concurrency).max(1));
        if threads * concurrency > total_cpus {
            warn!(
                "{concurrency} engines with {threads} threads each exceed the {total_cpus} CPUs available"
            );
        }

        let hash_mb = match self.hash_per_engine {
            Some(hash) => hash,
            None => (total_ram / concurrency).max(MIN_HASH_MB),
        };
        if hash_mb * concurrency > total_ram.max(MIN_HASH_MB * concurrency) {
            bail!(
                "{concurrency} engines with {hash_mb}MB of hash exceed the {total_ram}MB available"
            );
        }

        Ok(Resources { threads, hash_mb })
    }
}

/// Obtained using [`ResourcesBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resources {
    /// `Threads` option.
    pub threads: usize,
    /// `Hash` option in MB.
    pub hash_mb: usize,
}

impl Resources {
    /// Adds `Threads` and `Hash` to `options` unless already set.
    pub(crate) fn apply(&self, options: &mut BTreeMap<String, String>) {
        options
            .entry("Threads".to_string())
            .or_insert_with(|| self.threads.to_string());
        options
            .entry("Hash".to_string())
            .or_insert_with(|| self.hash_mb.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_between_engines() {
        let resources = ResourcesBuilder::new()
            .with_total_ram(4_000)
            .with_total_cpus(8)
            .build(4)
            .unwrap();
        assert_eq!(
            resources,
            Resources {
                threads: 2,
                hash_mb: 1_000
            }
        );
    }

    #[test]
    fn at_least_one_thread_and_minimal_hash() {
        let resources = ResourcesBuilder::new()
            .with_total_ram(20)
            .with_total_cpus(2)
            .build(8)
            .unwrap();
        assert_eq!(resources.threads, 1);
        assert_eq!(resources.hash_mb, MIN_HASH_MB);
    }

    #[test]
    fn impossible_hash_is_rejected() {
        let result = ResourcesBuilder::new()
            .with_total_ram(1_000)
            .with_hash_per_engine(600)
            .build(2);
        assert!(result.is_err());
        assert!(ResourcesBuilder::new().with_total_ram(1_000).build(0).is_err());
    }

    #[test]
    fn explicit_options_are_kept() {
        let resources = Resources {
            threads: 3,
            hash_mb: 128,
        };
        let mut options = BTreeMap::new();
        options.insert("Hash".to_string(), "256".to_string());
        resources.apply(&mut options);
        assert_eq!(options["Hash"], "256");
        assert_eq!(options["Threads"], "3");
    }
}
