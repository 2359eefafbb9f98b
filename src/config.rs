//! Boot configuration: server options, storage layout and the retry /
//! concurrency policy.
//!
//! Every option is settable as a CLI flag or a `PICA_*` environment
//! variable. The per-source overrides (`PICA_FILE_RETRIES_JM`,
//! `PICA_FILE_CONCURRENT_EHENTAI`, ...) are read straight from the
//! environment at resolve time.
//!
//! [`Policy`] is an immutable record: the control plane mutates it by
//! building a modified copy and swapping the whole value behind the
//! scheduler's lock, so a running task observes one consistent policy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::Parser;

use crate::comic::Source;

/// Default per-file retry budget (attempts after the first).
pub const DEFAULT_FILE_RETRIES: u32 = 2;

/// Default per-source file fan-out width.
pub const DEFAULT_FILE_CONCURRENT: usize = 6;

/// Default worker-pool ceiling.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Worker-pool ceiling bounds.
pub const MAX_CONCURRENT_RANGE: (usize, usize) = (1, 20);

/// File fan-out bounds (matches the fan-out runner's clamp).
pub const FILE_CONCURRENT_RANGE: (usize, usize) = (1, 16);

/// Server process options.
#[derive(Debug, Clone, Parser)]
#[command(name = "pica-server", about = "Private comic library server")]
pub struct ServerOptions {
    /// Listen address.
    #[arg(long, env = "PICA_BIND", default_value = "127.0.0.1")]
    pub bind: String,

    /// Listen port.
    #[arg(long, env = "PICA_PORT", default_value_t = 3030)]
    pub port: u16,

    /// Storage root: holds library.db, tasks/ staging and comics/.
    #[arg(long, env = "PICA_STORAGE", default_value = "./storage")]
    pub storage: PathBuf,

    /// Require this value in the X-Api-Key header when set.
    #[arg(long, env = "PICA_API_KEY")]
    pub api_key: Option<String>,

    /// Per-file retry budget, unless overridden per source.
    #[arg(long, env = "PICA_FILE_RETRIES_DEFAULT", default_value_t = DEFAULT_FILE_RETRIES)]
    pub file_retries_default: u32,

    /// Per-source file fan-out width, unless overridden per source.
    #[arg(long, env = "PICA_FILE_CONCURRENT_DEFAULT", default_value_t = DEFAULT_FILE_CONCURRENT)]
    pub file_concurrent_default: usize,

    /// Initial worker-pool ceiling.
    #[arg(long, env = "PICA_MAX_CONCURRENT", default_value_t = DEFAULT_MAX_CONCURRENT)]
    pub max_concurrent: usize,

    /// Include the full error chain in failed-task messages.
    #[arg(
        long,
        env = "PICA_TASK_DEBUG",
        value_parser = parse_flag,
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "1"
    )]
    pub task_debug: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 3030,
            storage: PathBuf::from("./storage"),
            api_key: None,
            file_retries_default: DEFAULT_FILE_RETRIES,
            file_concurrent_default: DEFAULT_FILE_CONCURRENT,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            task_debug: false,
        }
    }
}

/// Accepts `1`/`true` (the documented forms) plus `0`/`false`.
fn parse_flag(value: &str) -> Result<bool, String> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" | "" => Ok(false),
        other => Err(format!("expected 1/0, got '{other}'")),
    }
}

/// Immutable retry/concurrency policy, resolved once at boot.
#[derive(Debug, Clone)]
pub struct Policy {
    file_retries_default: u32,
    file_retries: HashMap<Source, u32>,
    file_concurrent_default: usize,
    file_concurrent: HashMap<Source, usize>,
    max_concurrent: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            file_retries_default: DEFAULT_FILE_RETRIES,
            file_retries: HashMap::new(),
            file_concurrent_default: DEFAULT_FILE_CONCURRENT,
            file_concurrent: HashMap::new(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

impl Policy {
    /// Resolves the policy from options plus `PICA_FILE_RETRIES_{SOURCE}` /
    /// `PICA_FILE_CONCURRENT_{SOURCE}` environment overrides.
    #[must_use]
    pub fn resolve(options: &ServerOptions) -> Self {
        let mut file_retries = HashMap::new();
        let mut file_concurrent = HashMap::new();

        for source in Source::ALL {
            let suffix = source.as_str().to_uppercase();
            if let Some(value) = env_parse::<u32>(&format!("PICA_FILE_RETRIES_{suffix}")) {
                file_retries.insert(source, value);
            }
            if let Some(value) = env_parse::<usize>(&format!("PICA_FILE_CONCURRENT_{suffix}")) {
                file_concurrent.insert(source, value);
            }
        }

        Self {
            file_retries_default: options.file_retries_default,
            file_retries,
            file_concurrent_default: clamp_file_concurrent(options.file_concurrent_default),
            file_concurrent,
            max_concurrent: clamp_max_concurrent(options.max_concurrent),
        }
    }

    /// Per-file retry budget for `source`.
    #[must_use]
    pub fn file_retries(&self, source: Source) -> u32 {
        self.file_retries
            .get(&source)
            .copied()
            .unwrap_or(self.file_retries_default)
    }

    /// File fan-out width for `source`, clamped to the legal range.
    #[must_use]
    pub fn file_concurrent(&self, source: Source) -> usize {
        clamp_file_concurrent(
            self.file_concurrent
                .get(&source)
                .copied()
                .unwrap_or(self.file_concurrent_default),
        )
    }

    /// The default file fan-out width.
    #[must_use]
    pub fn file_concurrent_default(&self) -> usize {
        self.file_concurrent_default
    }

    /// Worker-pool ceiling.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Returns a copy with a new worker-pool ceiling.
    #[must_use]
    pub fn with_max_concurrent(mut self, value: usize) -> Self {
        self.max_concurrent = clamp_max_concurrent(value);
        self
    }

    /// Returns a copy with a new default file fan-out width.
    #[must_use]
    pub fn with_file_concurrent_default(mut self, value: usize) -> Self {
        self.file_concurrent_default = clamp_file_concurrent(value);
        self
    }
}

fn clamp_max_concurrent(value: usize) -> usize {
    value.clamp(MAX_CONCURRENT_RANGE.0, MAX_CONCURRENT_RANGE.1)
}

fn clamp_file_concurrent(value: usize) -> usize {
    value.clamp(FILE_CONCURRENT_RANGE.0, FILE_CONCURRENT_RANGE.1)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

/// On-disk layout under the storage root.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Creates the layout helper rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// SQLite database path.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.root.join("library.db")
    }

    /// Staging parent directory.
    #[must_use]
    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    /// One task's staging directory.
    #[must_use]
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join(task_id)
    }

    /// Committed-comics parent directory.
    #[must_use]
    pub fn comics_dir(&self) -> PathBuf {
        self.root.join("comics")
    }

    /// One committed comic's directory.
    #[must_use]
    pub fn comic_dir(&self, directory: &str) -> PathBuf {
        self.comics_dir().join(directory)
    }

    /// Creates the root, tasks and comics directories.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.tasks_dir())?;
        std::fs::create_dir_all(self.comics_dir())?;
        Ok(())
    }
}
