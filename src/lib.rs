//! Key-value co-sorting on accelerators
//!
//! Sorts `N` (key, value) pairs with parallel passes over fixed-size execution
//! groups, for arbitrary `N`. Two interchangeable engines are provided:
//! - [`network`]: an in-group sorting network followed by an odd-even
//!   transposition merge at run granularity.
//! - [`radix`]: a device-wide LSD radix sort with ping-pong scratch buffers.
//!
//! Both run on any [`Device`]: the software [`HostDevice`] or, with the `gpu`
//! feature, `GpuDevice` on wgpu.
#![warn(missing_docs)]

#[cfg(feature = "basic")]
use std::time::Instant;

extern crate num_cpus;

/// Error and result types
pub mod error;

/// Key kinds and the ordering transform applied by every kernel
pub mod key;

/// Accelerator buffers and kernel dispatch
pub mod device;

/// Per-element distance keys
pub mod distance;

/// Padding of arbitrary lengths to the engine granularity
pub mod compensator;

/// Sorting network plus odd-even merge engine
pub mod network;

/// LSD radix engine
pub mod radix;

/// Engine selection and configuration
pub mod config;

/// The co-sort façade
pub mod cosort;

/// Sorting positioned items
pub mod spatial;

/// Output helpers
pub mod io_utils;

#[cfg(feature = "basic")]
pub mod cli;

/// Benchmark and validation runs
#[cfg(feature = "basic")]
pub mod bench;

pub use crate::config::{Engine, SortConfig};
pub use crate::cosort::{CoSorter, SorterStatus};
pub use crate::device::{Device, HostDevice};
#[cfg(feature = "gpu")]
pub use crate::device::GpuDevice;
pub use crate::distance::{DistanceMetric, Point3};
pub use crate::error::{Error, Result};
pub use crate::key::{KeyKind, SortKey};
pub use crate::spatial::{DistanceSorter, Positioned};

#[cfg(feature = "basic")]
use crate::cli::*;

/// Accelerator selected on the command line
#[cfg(feature = "basic")]
pub fn open_device(device: DeviceType) -> Result<Box<dyn Device>> {
    match device {
        DeviceType::Host => Ok(Box::new(HostDevice::new())),
        #[cfg(feature = "gpu")]
        DeviceType::Gpu => Ok(Box::new(GpuDevice::new()?)),
        #[cfg(not(feature = "gpu"))]
        DeviceType::Gpu => Err(Error::Device("built without the `gpu` feature".to_owned())),
    }
}

#[cfg(feature = "basic")]
fn setup(sorter: &SorterOpts) -> Result<CoSorter<Box<dyn Device>>> {
    check_threads(sorter.threads);
    log::info!("Checking requested threads and creating pool if needed");
    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(sorter.threads)
        .build_global()
    {
        log::warn!("Could not build the thread pool: {e}");
    }
    let config = sorter.sort_config()?;
    log::info!("Using the {} device", sorter.device);
    CoSorter::new(open_device(sorter.device)?, config)
}

#[cfg(feature = "basic")]
fn run(args: &Args) -> Result<bool> {
    match &args.command {
        Commands::Bench {
            sorter,
            start_len,
            rounds,
            passes,
            output_dir,
            output_prefix,
            no_save,
        } => {
            let mut cosorter = setup(sorter)?;
            let opts = bench::BenchOpts {
                start_len: *start_len,
                rounds:    *rounds,
                passes:    *passes,
                target:    Point3::ZERO,
                output:    (!*no_save).then(|| (output_dir.clone(), output_prefix.clone())),
            };
            let results = bench::run_benchmark(&mut cosorter, &opts)?;
            for r in &results {
                eprintln!(
                    "n = {:>9}: device {:>10.3} ms, cpu {:>10.3} ms, errors {}",
                    r.array_length, r.average_device_ms, r.average_cpu_ms, r.device_errors
                );
            }
            Ok(results.iter().all(|r| r.device_errors == 0))
        }
        Commands::Check { sorter, n, output } => {
            let mut cosorter = setup(sorter)?;
            let target = Point3::new(500.0, 500.0, 500.0);
            let report = bench::run_check(&mut cosorter, *n, target)?;
            if output.is_some() {
                use std::io::Write;
                let mut out = io_utils::set_ostream(output)?;
                for d in &report.distances {
                    writeln!(out, "{d}")?;
                }
                out.flush()?;
            }
            if !report.target_first {
                log::error!("The position on the target was not sorted to the front");
            }
            eprintln!("{} ordering errors in {} positions", report.error_indices.len(), n);
            Ok(report.error_indices.is_empty() && report.target_first)
        }
    }
}

#[doc(hidden)]
#[cfg(feature = "basic")]
pub fn main() {
    let args = cli_args();
    if args.verbose {
        simple_logger::init_with_level(log::Level::Info).unwrap();
    } else {
        simple_logger::init_with_level(log::Level::Warn).unwrap();
    }

    log::info!("Starting program!");
    eprintln!("cosort");
    let start = Instant::now();
    match run(&args) {
        Ok(true) => {}
        Ok(false) => {
            eprintln!("Sorted output failed validation");
            std::process::exit(1);
        }
        Err(e) => {
            log::error!("{e}");
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    }
    eprintln!("cosort done in {} s", start.elapsed().as_secs());
    log::info!("Finishing program!");
}
