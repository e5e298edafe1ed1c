//! Benchmark and validation runs: device distance sorts against a CPU sort.

use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{Engine, SortConfig};
use crate::cosort::CoSorter;
use crate::device::Device;
use crate::distance::Point3;
use crate::io_utils::{results_path, save_json, unix_seconds};
use crate::spatial::reorder;
use crate::Result;

/// Fewest passes run for any length
pub const MIN_PASSES: usize = 10;
/// Side of the cube random positions are drawn from
pub const POSITION_RANGE: f32 = 1000.0;
/// Distances are compared at this many decimals to ignore float noise
pub const VALIDATION_DECIMALS: i32 = 3;

/// Timings and validation of one pass
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkPass {
    /// Pass number within its length
    pub index:         usize,
    /// Device sort, including upload and read-back
    pub device_ms:     f64,
    /// `slice::sort_by` on the host
    pub cpu_ms:        f64,
    /// Adjacent out-of-order pairs in the device result
    pub device_errors: usize,
    /// Adjacent out-of-order pairs in the CPU result
    pub cpu_errors:    usize,
}

/// Summary for one length
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub array_length:      usize,
    pub engine:            Engine,
    pub group_size:        u32,
    pub device_name:       String,
    pub os:                String,
    pub cpu_count:         usize,
    pub average_device_ms: f64,
    pub average_cpu_ms:    f64,
    pub min_device_ms:     f64,
    pub max_device_ms:     f64,
    pub min_cpu_ms:        f64,
    pub max_cpu_ms:        f64,
    pub device_errors:     usize,
    pub passes:            Vec<BenchmarkPass>,
}

impl BenchmarkResult {
    fn new(array_length: usize, config: &SortConfig, device_name: String, passes: Vec<BenchmarkPass>) -> Self {
        let stats = |f: fn(&BenchmarkPass) -> f64| {
            let n = passes.len().max(1) as f64;
            let sum: f64 = passes.iter().map(f).sum();
            let min = passes.iter().map(f).fold(f64::INFINITY, f64::min);
            let max = passes.iter().map(f).fold(0.0, f64::max);
            (sum / n, if passes.is_empty() { 0.0 } else { min }, max)
        };
        let (average_device_ms, min_device_ms, max_device_ms) = stats(|p| p.device_ms);
        let (average_cpu_ms, min_cpu_ms, max_cpu_ms) = stats(|p| p.cpu_ms);
        Self {
            array_length,
            engine: config.engine,
            group_size: config.group_size,
            device_name,
            os: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            cpu_count: num_cpus::get(),
            average_device_ms,
            average_cpu_ms,
            min_device_ms,
            max_device_ms,
            min_cpu_ms,
            max_cpu_ms,
            device_errors: passes.iter().map(|p| p.device_errors).sum(),
            passes,
        }
    }
}

/// Benchmark run parameters
#[derive(Clone, Debug)]
pub struct BenchOpts {
    /// First length
    pub start_len:     usize,
    /// Doubling rounds
    pub rounds:        usize,
    /// Passes at `start_len`
    pub passes:        usize,
    /// Query point
    pub target:        Point3,
    /// Where to write results, `None` to skip saving
    pub output:        Option<(String, String)>,
}

/// Lengths and pass counts of every round: lengths double, passes halve down to [`MIN_PASSES`].
pub fn schedule(start_len: usize, rounds: usize, passes: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::with_capacity(rounds);
    let (mut len, mut count) = (start_len, passes);
    for _ in 0..rounds {
        out.push((len, count));
        len *= 2;
        count = (count / 2).max(MIN_PASSES);
    }
    out
}

#[inline]
fn round_to(x: f32, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (x as f64 * scale).round() / scale
}

/// Indices `i` where element `i + 1` is out of order with element `i`,
/// comparing at [`VALIDATION_DECIMALS`].
pub fn count_order_errors(distances: &[f32], ascending: bool) -> Vec<usize> {
    distances
        .windows(2)
        .enumerate()
        .filter(|(_, w)| {
            let (a, b) = (round_to(w[0], VALIDATION_DECIMALS), round_to(w[1], VALIDATION_DECIMALS));
            if ascending { b < a } else { b > a }
        })
        .map(|(i, _)| i)
        .collect()
}

/// `n` positions uniformly drawn from `[0, 1000)³`
pub fn random_positions<R: Rng>(rng: &mut R, n: usize) -> Vec<Point3> {
    (0..n)
        .map(|_| {
            Point3::new(
                rng.gen_range(0.0..POSITION_RANGE),
                rng.gen_range(0.0..POSITION_RANGE),
                rng.gen_range(0.0..POSITION_RANGE),
            )
        })
        .collect()
}

fn distances(points: &[Point3], target: Point3) -> Vec<f32> {
    points.iter().map(|p| p.distance_squared(target).sqrt()).collect()
}

fn run_pass<D: Device, R: Rng>(
    sorter: &mut CoSorter<D>,
    rng:    &mut R,
    index:  usize,
    len:    usize,
    target: Point3,
) -> Result<BenchmarkPass> {
    let ascending = sorter.config().ascending;
    let mut on_device = random_positions(rng, len);
    let mut on_cpu = on_device.clone();

    let start = Instant::now();
    let permutation = sorter.sort_by_distance(&on_device, target)?;
    reorder(&mut on_device, &permutation);
    let device_ms = start.elapsed().as_secs_f64() * 1000.0;

    let start = Instant::now();
    on_cpu.sort_by(|a, b| {
        let ord = a.distance_squared(target).total_cmp(&b.distance_squared(target));
        if ascending { ord } else { ord.reverse() }
    });
    let cpu_ms = start.elapsed().as_secs_f64() * 1000.0;

    let device_errors = count_order_errors(&distances(&on_device, target), ascending).len();
    let cpu_errors = count_order_errors(&distances(&on_cpu, target), ascending).len();
    log::debug!("Pass {index} of {len}: device {device_ms:.3} ms ({device_errors} errors), cpu {cpu_ms:.3} ms");

    Ok(BenchmarkPass { index, device_ms, cpu_ms, device_errors, cpu_errors })
}

/// Runs every round of the benchmark and saves one JSON file per length.
pub fn run_benchmark<D: Device>(sorter: &mut CoSorter<D>, opts: &BenchOpts) -> Result<Vec<BenchmarkResult>> {
    let mut rng = rand::thread_rng();
    let stamp = unix_seconds();
    let config = sorter.config().clone();
    let device_name = sorter.device().label();
    let rounds = schedule(opts.start_len, opts.rounds, opts.passes);

    let total: usize = rounds.iter().map(|(_, passes)| passes).sum();
    let progress = ProgressBar::new(total as u64);
    progress.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} passes ({msg}) {elapsed_precise}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let mut results = Vec::with_capacity(rounds.len());
    for (len, passes) in rounds {
        log::info!("Benchmarking {len} elements over {passes} passes");
        progress.set_message(format!("n = {len}"));
        sorter.init(len)?;

        let mut records = Vec::with_capacity(passes);
        for index in 0..passes {
            records.push(run_pass(sorter, &mut rng, index, len, opts.target)?);
            progress.inc(1);
        }
        let result = BenchmarkResult::new(len, &config, device_name.clone(), records);
        log::info!(
            "n = {}: device avg {:.3} ms (min {:.3}, max {:.3}), cpu avg {:.3} ms, {} device errors",
            len,
            result.average_device_ms,
            result.min_device_ms,
            result.max_device_ms,
            result.average_cpu_ms,
            result.device_errors
        );
        if let Some((dir, prefix)) = &opts.output {
            save_json(&results_path(dir, prefix, stamp, len), &result)?;
        }
        results.push(result);
    }
    progress.finish_and_clear();
    Ok(results)
}

/// Outcome of a [`run_check`]
#[derive(Clone, Debug)]
pub struct CheckReport {
    /// Distances in sorted order
    pub distances:     Vec<f32>,
    /// Indices of out-of-order neighbours
    pub error_indices: Vec<usize>,
    /// Whether the element placed on the target sorted to the front
    pub target_first:  bool,
}

/// Sorts `n` random positions once, the last one placed exactly on the target.
pub fn run_check<D: Device>(sorter: &mut CoSorter<D>, n: usize, target: Point3) -> Result<CheckReport> {
    let mut rng = rand::thread_rng();
    let mut positions = random_positions(&mut rng, n);
    if let Some(last) = positions.last_mut() {
        *last = target;
    }
    sorter.init(n)?;
    let permutation = sorter.sort_by_distance(&positions, target)?;
    reorder(&mut positions, &permutation);

    let ascending = sorter.config().ascending;
    let distances = distances(&positions, target);
    let step = (n / 8).max(1);
    for i in (0..n).step_by(step) {
        log::info!("i: {i}, distance: {}", distances[i]);
    }
    let error_indices = count_order_errors(&distances, ascending);
    let target_at = if ascending { permutation.first() } else { permutation.last() };
    let target_first = n.checked_sub(1).map(|i| i as u32) == target_at.copied();
    if error_indices.is_empty() {
        log::info!("No errors in {n} sorted positions");
    } else {
        log::warn!("{} ordering errors at {:?}", error_indices.len(), error_indices);
    }
    Ok(CheckReport { distances, error_indices, target_first })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;

    use pretty_assertions::assert_eq;

    #[test]
    fn test_schedule() {
        assert_eq!(
            schedule(64, 5, 40),
            vec![(64, 40), (128, 20), (256, 10), (512, 10), (1024, 10)]
        );
    }

    #[test]
    fn test_order_errors() {
        assert_eq!(count_order_errors(&[0.0, 1.0, 0.5, 2.0, 1.9], true), vec![1, 3]);
        assert_eq!(count_order_errors(&[3.0, 2.0, 2.5], false), vec![1]);
        // Rounded away
        assert!(count_order_errors(&[1.00001, 1.0], true).is_empty());
    }

    #[test]
    fn test_benchmark_round() {
        let config = SortConfig { group_size: 16, ..Default::default() };
        let mut sorter = CoSorter::new(HostDevice::new(), config).unwrap();
        let opts = BenchOpts { start_len: 100, rounds: 2, passes: 3, target: Point3::ZERO, output: None };
        let results = run_benchmark(&mut sorter, &opts).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].array_length, 200);
        assert_eq!(results[0].passes.len(), 3);
        assert_eq!(results[1].passes.len(), MIN_PASSES);
        assert!(results.iter().all(|r| r.device_errors == 0));
        assert!(results[0].min_device_ms <= results[0].max_device_ms);
    }

    #[test]
    fn test_check_run() {
        let config = SortConfig { engine: Engine::Radix, ..Default::default() };
        let mut sorter = CoSorter::new(HostDevice::new(), config).unwrap();
        let report = run_check(&mut sorter, 777, Point3::new(500.0, 500.0, 500.0)).unwrap();
        assert!(report.error_indices.is_empty());
        assert!(report.target_first);
        assert_eq!(report.distances[0], 0.0);
        assert_eq!(report.distances.len(), 777);
    }
}
