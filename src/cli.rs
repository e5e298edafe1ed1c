//! Command line interface, built using [`crate::clap` with `Derive`](https://docs.rs/clap/latest/clap/_derive/_tutorial/index.html)
use std::fmt;

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};

use crate::config::{Engine, SortConfig, DEFAULT_GROUP_SIZE};
use crate::distance::DistanceMetric;

/// Default first benchmark length
pub const DEFAULT_START_LEN: usize = 1_000;
/// Default number of doubling rounds
pub const DEFAULT_ROUNDS: usize = 8;
/// Default passes for the first length
pub const DEFAULT_PASSES: usize = 320;
/// Default number of elements for `check`
pub const DEFAULT_CHECK_LEN: usize = 10_000;
/// Default output directory
pub const DEFAULT_OUTPUT_DIR:    &str = "./";
/// Default output prefix
pub const DEFAULT_OUTPUT_PREFIX: &str = "cosort";

#[doc(hidden)]
fn valid_group_size(s: &str) -> Result<u32, String> {
    let g: u32 = s
        .parse()
        .map_err(|_| format!("`{s}` isn't a valid group size"))?;
    if g == 0 || g % 2 != 0 {
        Err("Group size must be a positive even number".to_string())
    } else {
        Ok(g)
    }
}

#[doc(hidden)]
fn valid_len(s: &str) -> Result<usize, String> {
    let n: usize = s
        .parse()
        .map_err(|_| format!("`{s}` isn't a valid length"))?;
    if n < 2 {
        Err("Length must be two or higher".to_string())
    } else {
        Ok(n)
    }
}

#[doc(hidden)]
fn valid_cpus(s: &str) -> Result<usize, String> {
    let threads: usize = s
        .parse()
        .map_err(|_| format!("`{s}` isn't a valid number of cores"))?;
    if threads < 1 {
        Err("Threads must be one or higher".to_string())
    } else {
        Ok(threads)
    }
}

/// Prints a warning if more threads than available have been requested
pub fn check_threads(threads: usize) {
    let max_threads = num_cpus::get();
    if threads > max_threads {
        log::warn!("{threads} threads is greater than available cores {max_threads}");
    }
}

/// Possible accelerators
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum DeviceType {
    /// Software accelerator on the CPU thread pool
    Host,
    /// wgpu compute shaders (needs the `gpu` feature)
    Gpu,
}

/// As text, for use in logging messages
impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Host => write!(f, "host"),
            Self::Gpu => write!(f, "gpu"),
        }
    }
}

/// Options that apply to all subcommands
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[doc(hidden)]
    #[command(subcommand)]
    pub command: Commands,

    /// Show progress messages
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Sorter options shared by the subcommands
#[derive(ClapArgs, Clone)]
pub struct SorterOpts {
    /// JSON configuration file; flags given on the command line override it
    #[arg(long)]
    pub config: Option<String>,

    /// Co-sort engine
    #[arg(long, value_enum)]
    pub engine: Option<Engine>,

    /// Group size of the network engine
    #[arg(long, value_parser = valid_group_size)]
    pub group_size: Option<u32>,

    /// Sort by descending distance
    #[arg(long, default_value_t = false)]
    pub descending: bool,

    /// Distance used as sort key
    #[arg(long, value_enum)]
    pub metric: Option<DistanceMetric>,

    /// Accelerator to run on
    #[arg(long, value_enum, default_value_t = DeviceType::Host)]
    pub device: DeviceType,

    /// Number of CPU threads
    #[arg(long, value_parser = valid_cpus, default_value_t = 1)]
    pub threads: usize,
}

impl SorterOpts {
    /// Configuration from the file (if any) with the command line flags on top
    pub fn sort_config(&self) -> crate::Result<SortConfig> {
        let mut config = match &self.config {
            Some(path) => SortConfig::from_file(path)?,
            None => SortConfig::default(),
        };
        if let Some(engine) = self.engine {
            config.engine = engine;
        }
        if let Some(group_size) = self.group_size {
            config.group_size = group_size;
        }
        if let Some(metric) = self.metric {
            config.metric = metric;
        }
        if self.descending {
            config.ascending = false;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Subcommands and their specific options
#[derive(Subcommand)]
pub enum Commands {
    /// Time device sorts against a CPU sort over doubling lengths
    Bench {
        /// Sorter options
        #[command(flatten)]
        sorter: SorterOpts,

        /// First length
        #[arg(long, value_parser = valid_len, default_value_t = DEFAULT_START_LEN)]
        start_len: usize,

        /// Number of doubling rounds
        #[arg(long, default_value_t = DEFAULT_ROUNDS)]
        rounds: usize,

        /// Passes at the first length, halved every round
        #[arg(long, default_value_t = DEFAULT_PASSES)]
        passes: usize,

        /// Output directory
        #[arg(long, default_value_t = DEFAULT_OUTPUT_DIR.to_string())]
        output_dir: String,

        /// Output prefix
        #[arg(long, default_value_t = DEFAULT_OUTPUT_PREFIX.to_string())]
        output_prefix: String,

        /// Do not write the JSON results
        #[arg(long, default_value_t = false)]
        no_save: bool,
    },
    /// Sort one random set of positions and validate the order
    Check {
        /// Sorter options
        #[command(flatten)]
        sorter: SorterOpts,

        /// Number of positions
        #[arg(short, long, value_parser = valid_len, default_value_t = DEFAULT_CHECK_LEN)]
        n: usize,

        /// Write the sorted distances here instead of only logging samples ("-" for stdout)
        #[arg(short, long)]
        output: Option<String>,
    },
}

/// Function to parse command line args into [`Args`] struct
pub fn cli_args() -> Args {
    Args::parse()
}
