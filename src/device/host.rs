//! Software accelerator.
//!
//! Every kernel is executed group by group exactly as the device programs are
//! laid out: a dispatch of `g` groups touches at most `g` groups worth of
//! elements, and the groups of one dispatch run in parallel on the rayon pool.

use rayon::prelude::*;

use super::{Arena, BufferId, Device, Kernel};
use crate::distance::{DistanceMetric, Point3, EVAL_GROUP_SIZE};
use crate::key::KeyOrder;
use crate::network::MERGE_FACTOR;
use crate::radix::{RADIX_BUCKETS, RADIX_MASK, RADIX_TILE};
use crate::{Error, Result};

struct HostBuffer {
    label: String,
    words: Vec<u32>,
}

/// Buffers in host memory, kernels on the rayon pool
#[derive(Default)]
pub struct HostDevice {
    buffers:    Vec<Option<HostBuffer>>,
    dispatched: u64,
}

impl HostDevice {
    /// Empty device
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of dispatches executed so far
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Number of buffers currently acquired
    pub fn live_buffers(&self) -> usize {
        self.buffers.iter().filter(|b| b.is_some()).count()
    }

    fn read(&self, id: BufferId, needed: usize) -> Result<&[u32]> {
        let buf = self.buffers.get(id.0).and_then(Option::as_ref).ok_or(Error::UnknownBuffer(id))?;
        if buf.words.len() < needed {
            return Err(Error::BufferOverflow { buffer: id, capacity: buf.words.len(), requested: needed });
        }
        Ok(&buf.words)
    }

    fn take(&mut self, id: BufferId, needed: usize) -> Result<HostBuffer> {
        let slot = self.buffers.get_mut(id.0).ok_or(Error::UnknownBuffer(id))?;
        let buf = slot.take().ok_or(Error::UnknownBuffer(id))?;
        if buf.words.len() < needed {
            let capacity = buf.words.len();
            *slot = Some(buf);
            return Err(Error::BufferOverflow { buffer: id, capacity, requested: needed });
        }
        Ok(buf)
    }

    fn put(&mut self, id: BufferId, buf: HostBuffer) {
        self.buffers[id.0] = Some(buf);
    }

    /// Runs `f` with `id` checked out for writing while the rest of the device stays readable.
    fn with_buffer<F>(&mut self, id: BufferId, needed: usize, f: F) -> Result<()>
    where
        F: FnOnce(&Self, &mut [u32]) -> Result<()>,
    {
        let mut buf = self.take(id, needed)?;
        let result = f(self, &mut buf.words);
        self.put(id, buf);
        result
    }

    /// Same as [`HostDevice::with_buffer`] for a key/value pair.
    fn with_arena<F>(&mut self, arena: Arena, needed: usize, f: F) -> Result<()>
    where
        F: FnOnce(&Self, &mut [u32], &mut [u32]) -> Result<()>,
    {
        let mut keys = self.take(arena.keys, needed)?;
        let mut values = match self.take(arena.values, needed) {
            Ok(values) => values,
            Err(e) => {
                self.put(arena.keys, keys);
                return Err(e);
            }
        };
        let result = f(self, &mut keys.words, &mut values.words);
        self.put(arena.keys, keys);
        self.put(arena.values, values);
        result
    }
}

fn distinct(ids: &[BufferId]) -> Result<()> {
    for (i, a) in ids.iter().enumerate() {
        if ids[i + 1..].contains(a) {
            return Err(Error::AliasedBuffers(*a));
        }
    }
    Ok(())
}

impl Device for HostDevice {
    fn label(&self) -> String {
        format!("host ({} threads)", rayon::current_num_threads())
    }

    fn create_buffer(&mut self, label: &str, words: usize) -> Result<BufferId> {
        log::trace!("Allocating host buffer {label} ({words} words)");
        let buf = HostBuffer { label: label.to_owned(), words: vec![0; words] };
        let id = match self.buffers.iter().position(Option::is_none) {
            Some(free) => {
                self.buffers[free] = Some(buf);
                free
            }
            None => {
                self.buffers.push(Some(buf));
                self.buffers.len() - 1
            }
        };
        Ok(BufferId(id))
    }

    fn upload(&mut self, buffer: BufferId, data: &[u32]) -> Result<()> {
        self.with_buffer(buffer, data.len(), |_, words| {
            words[..data.len()].copy_from_slice(data);
            Ok(())
        })
    }

    fn download(&mut self, buffer: BufferId, words: usize) -> Result<Vec<u32>> {
        Ok(self.read(buffer, words)?[..words].to_vec())
    }

    fn release(&mut self, buffer: BufferId) {
        if let Some(slot) = self.buffers.get_mut(buffer.0) {
            if let Some(buf) = slot.take() {
                log::trace!("Released host buffer {}", buf.label);
            }
        }
    }

    fn dispatch(&mut self, kernel: &Kernel, groups: u32) -> Result<()> {
        log::trace!("host dispatch {} x{}", kernel.name(), groups);
        self.dispatched += 1;
        let groups = groups as usize;

        match *kernel {
            Kernel::Distance { positions, out, target, metric, len } => {
                distinct(&[positions, out.keys, out.values])?;
                let len = len as usize;
                self.with_arena(out, len, |dev, keys, values| {
                    let positions: &[Point3] = bytemuck::cast_slice(&dev.read(positions, 3 * len)?[..3 * len]);
                    distance(positions, &mut keys[..len], &mut values[..len], target, metric, groups);
                    Ok(())
                })
            }
            Kernel::LocalSort { data, len, group_size, order } => {
                distinct(&[data.keys, data.values])?;
                let len = len as usize;
                self.with_arena(data, len, |_, keys, values| {
                    local_sort(&mut keys[..len], &mut values[..len], group_size as usize, groups, order);
                    Ok(())
                })
            }
            Kernel::Merge { data, len, group_size, odd, order } => {
                distinct(&[data.keys, data.values])?;
                let len = len as usize;
                self.with_arena(data, len, |_, keys, values| {
                    merge(&mut keys[..len], &mut values[..len], group_size as usize, odd, groups, order);
                    Ok(())
                })
            }
            Kernel::RadixHistogram { src, histogram, len, shift, order } => {
                distinct(&[src.keys, histogram])?;
                let len = len as usize;
                let tiles = groups.min(len.div_ceil(RADIX_TILE));
                self.with_buffer(histogram, tiles * RADIX_BUCKETS, |dev, hist| {
                    let keys = &dev.read(src.keys, len)?[..len];
                    radix_histogram(keys, &mut hist[..tiles * RADIX_BUCKETS], shift, order);
                    Ok(())
                })
            }
            Kernel::RadixScan { histogram, totals, tiles } => {
                distinct(&[histogram, totals])?;
                if groups == 0 {
                    return Ok(());
                }
                let tiles = tiles as usize;
                let mut bases = self.take(totals, RADIX_BUCKETS)?;
                let result = self.with_buffer(histogram, tiles * RADIX_BUCKETS, |_, hist| {
                    radix_scan(&mut hist[..tiles * RADIX_BUCKETS], &mut bases.words[..RADIX_BUCKETS]);
                    Ok(())
                });
                self.put(totals, bases);
                result
            }
            Kernel::RadixScatter { src, dst, histogram, len, shift, order } => {
                distinct(&[src.keys, src.values, dst.keys, dst.values, histogram])?;
                let len = len as usize;
                let tiles = groups.min(len.div_ceil(RADIX_TILE));
                self.with_arena(dst, len, |dev, dst_keys, dst_values| {
                    let src_keys = &dev.read(src.keys, len)?[..len];
                    let src_values = &dev.read(src.values, len)?[..len];
                    let offsets = &dev.read(histogram, tiles * RADIX_BUCKETS)?[..tiles * RADIX_BUCKETS];
                    radix_scatter(src_keys, src_values, dst_keys, dst_values, offsets, tiles, shift, order)
                })
            }
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Kernels
// ──────────────────────────────────────────────────────────────────────────────

fn distance(
    positions: &[Point3],
    keys:      &mut [u32],
    values:    &mut [u32],
    target:    Point3,
    metric:    DistanceMetric,
    groups:    usize,
) {
    let covered = keys.len().min(groups * EVAL_GROUP_SIZE);
    keys[..covered]
        .par_chunks_mut(EVAL_GROUP_SIZE)
        .zip(values[..covered].par_chunks_mut(EVAL_GROUP_SIZE))
        .enumerate()
        .for_each(|(group, (keys, values))| {
            let base = group * EVAL_GROUP_SIZE;
            for (t, (key, value)) in keys.iter_mut().zip(values.iter_mut()).enumerate() {
                let i = base + t;
                *key = metric.measure(positions[i], target).to_bits();
                *value = i as u32;
            }
        });
}

#[inline]
fn compare_exchange(keys: &mut [u32], values: &mut [u32], a: usize, b: usize, order: KeyOrder) {
    if order.rank(keys[a]) > order.rank(keys[b]) {
        keys.swap(a, b);
        values.swap(a, b);
    }
}

/// Odd-even transposition network: `n` lockstep stages of disjoint compare-exchanges.
fn transposition_network(keys: &mut [u32], values: &mut [u32], order: KeyOrder) {
    let n = keys.len();
    for stage in 0..n {
        let mut i = stage & 1;
        while i + 1 < n {
            compare_exchange(keys, values, i, i + 1, order);
            i += 2;
        }
    }
}

fn local_sort(keys: &mut [u32], values: &mut [u32], group_size: usize, groups: usize, order: KeyOrder) {
    let covered = keys.len().min(groups * group_size);
    keys[..covered]
        .par_chunks_mut(group_size)
        .zip(values[..covered].par_chunks_mut(group_size))
        .for_each(|(keys, values)| transposition_network(keys, values, order));
}

/// Merges the sorted runs `[0, run)` and `[run, len)` of one window, lower run first on ties.
fn merge_runs(keys: &mut [u32], values: &mut [u32], run: usize, order: KeyOrder) {
    let n = keys.len();
    if n <= run {
        return;
    }
    let mut out_keys = Vec::with_capacity(n);
    let mut out_values = Vec::with_capacity(n);
    let (mut a, mut b) = (0, run);
    while a < run && b < n {
        if order.rank(keys[b]) < order.rank(keys[a]) {
            out_keys.push(keys[b]);
            out_values.push(values[b]);
            b += 1;
        } else {
            out_keys.push(keys[a]);
            out_values.push(values[a]);
            a += 1;
        }
    }
    out_keys.extend_from_slice(&keys[a..run]);
    out_values.extend_from_slice(&values[a..run]);
    out_keys.extend_from_slice(&keys[b..n]);
    out_values.extend_from_slice(&values[b..n]);
    keys.copy_from_slice(&out_keys);
    values.copy_from_slice(&out_values);
}

fn merge(keys: &mut [u32], values: &mut [u32], run: usize, odd: bool, groups: usize, order: KeyOrder) {
    let offset = if odd { run } else { 0 };
    let len = keys.len();
    if offset >= len {
        return;
    }
    let window = MERGE_FACTOR * run;
    let end = offset + (len - offset).min(groups * window);
    keys[offset..end]
        .par_chunks_mut(window)
        .zip(values[offset..end].par_chunks_mut(window))
        .for_each(|(keys, values)| merge_runs(keys, values, run, order));
}

fn radix_histogram(keys: &[u32], histogram: &mut [u32], shift: u32, order: KeyOrder) {
    histogram
        .par_chunks_mut(RADIX_BUCKETS)
        .zip(keys.par_chunks(RADIX_TILE))
        .for_each(|(counts, tile)| {
            counts.fill(0);
            for &key in tile {
                counts[order.digit(key, shift, RADIX_MASK)] += 1;
            }
        });
}

/// Column-wise exclusive scan: `histogram[t][d]` becomes the first output slot of
/// digit `d` from tile `t`, `totals[d]` the first slot of digit `d` overall.
fn radix_scan(histogram: &mut [u32], totals: &mut [u32]) {
    let tiles = histogram.len() / RADIX_BUCKETS;
    for (d, total) in totals.iter_mut().enumerate() {
        *total = (0..tiles).map(|t| histogram[t * RADIX_BUCKETS + d]).sum();
    }
    let mut base = 0;
    for total in totals.iter_mut() {
        let count = *total;
        *total = base;
        base += count;
    }
    for (d, &digit_base) in totals.iter().enumerate() {
        let mut running = digit_base;
        for t in 0..tiles {
            let count = histogram[t * RADIX_BUCKETS + d];
            histogram[t * RADIX_BUCKETS + d] = running;
            running += count;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn radix_scatter(
    src_keys:   &[u32],
    src_values: &[u32],
    dst_keys:   &mut [u32],
    dst_values: &mut [u32],
    offsets:    &[u32],
    tiles:      usize,
    shift:      u32,
    order:      KeyOrder,
) -> Result<()> {
    let covered = src_keys.len().min(tiles * RADIX_TILE);
    // Destinations per tile in parallel; within a tile equal digits keep input order.
    let destinations: Vec<Vec<u32>> = src_keys[..covered]
        .par_chunks(RADIX_TILE)
        .zip(offsets.par_chunks(RADIX_BUCKETS))
        .map(|(tile, offsets)| {
            let mut next = offsets.to_vec();
            tile.iter()
                .map(|&key| {
                    let d = order.digit(key, shift, RADIX_MASK);
                    let at = next[d];
                    next[d] += 1;
                    at
                })
                .collect()
        })
        .collect();

    for (i, &at) in destinations.iter().flatten().enumerate() {
        let at = at as usize;
        if at >= dst_keys.len() {
            return Err(Error::Device(format!("radix scatter slot {at} out of range {}", dst_keys.len())));
        }
        dst_keys[at] = src_keys[i];
        dst_values[at] = src_values[i];
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::{arena_with, read_arena};
    use crate::key::KeyKind;

    use pretty_assertions::assert_eq;

    const ASC: KeyOrder = KeyOrder { kind: KeyKind::Uint, ascending: true };

    #[test]
    fn test_buffer_lifecycle() {
        let mut dev = HostDevice::new();
        let a = dev.create_buffer("a", 4).unwrap();
        dev.upload(a, &[1, 2]).unwrap();
        assert_eq!(dev.download(a, 4).unwrap(), vec![1, 2, 0, 0]);
        assert!(matches!(dev.upload(a, &[0; 5]), Err(Error::BufferOverflow { .. })));

        dev.release(a);
        assert_eq!(dev.live_buffers(), 0);
        assert!(matches!(dev.download(a, 1), Err(Error::UnknownBuffer(_))));
        dev.release(a);

        // Freed slots are reused
        let b = dev.create_buffer("b", 1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_local_sort_only_touches_dispatched_groups() {
        let mut dev = HostDevice::new();
        let keys = [3, 2, 1, 0, 7, 6, 5, 4];
        let arena = arena_with(&mut dev, &keys, &[0, 1, 2, 3, 4, 5, 6, 7]);
        let kernel = Kernel::LocalSort { data: arena, len: 8, group_size: 4, order: ASC };

        dev.dispatch(&kernel, 1).unwrap();
        let (k, v) = read_arena(&mut dev, arena, 8);
        assert_eq!(k, vec![0, 1, 2, 3, 7, 6, 5, 4]);
        assert_eq!(v, vec![3, 2, 1, 0, 4, 5, 6, 7]);
    }

    #[test]
    fn test_merge_windows() {
        let mut dev = HostDevice::new();
        // Three sorted runs of 2
        let arena = arena_with(&mut dev, &[4, 5, 2, 3, 0, 1], &[0, 1, 2, 3, 4, 5]);

        let even = Kernel::Merge { data: arena, len: 6, group_size: 2, odd: false, order: ASC };
        dev.dispatch(&even, 2).unwrap();
        assert_eq!(read_arena(&mut dev, arena, 6).0, vec![2, 3, 4, 5, 0, 1]);

        let odd = Kernel::Merge { data: arena, len: 6, group_size: 2, odd: true, order: ASC };
        dev.dispatch(&odd, 2).unwrap();
        let (k, v) = read_arena(&mut dev, arena, 6);
        assert_eq!(k, vec![2, 3, 0, 1, 4, 5]);
        assert_eq!(v, vec![2, 3, 4, 5, 0, 1]);
    }

    #[test]
    fn test_aliased_arena_is_rejected() {
        let mut dev = HostDevice::new();
        let buf = dev.create_buffer("x", 4).unwrap();
        let arena = Arena { keys: buf, values: buf };
        let kernel = Kernel::LocalSort { data: arena, len: 4, group_size: 4, order: ASC };
        assert!(matches!(dev.dispatch(&kernel, 1), Err(Error::AliasedBuffers(_))));
        // Still usable afterwards
        assert_eq!(dev.download(buf, 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn test_radix_scan_offsets() {
        let mut hist = vec![0u32; 2 * RADIX_BUCKETS];
        // tile 0: two 1s, one 0; tile 1: one 0, one 3
        hist[0] = 1;
        hist[1] = 2;
        hist[RADIX_BUCKETS] = 1;
        hist[RADIX_BUCKETS + 3] = 1;
        let mut totals = vec![0u32; RADIX_BUCKETS];
        radix_scan(&mut hist, &mut totals);

        assert_eq!(&totals[..4], &[0, 2, 4, 4]);
        assert_eq!(hist[0], 0);
        assert_eq!(hist[RADIX_BUCKETS], 1);
        assert_eq!(hist[1], 2);
        assert_eq!(hist[RADIX_BUCKETS + 3], 4);
    }
}
