//! Device-wide LSD radix co-sort.
//!
//! Keys are sorted by their [`KeyOrder::rank`] one 8-bit digit at a time, least
//! significant digit first. Every digit pass is three dispatches:
//! `radix_histogram` counts digits per tile, `radix_scan` turns the counts into
//! global scatter offsets, `radix_scatter` moves every pair into the alternate
//! arena. Each pass is stable, so the whole sort is.

use crate::device::{group_count, Arena, BufferId, Device, Kernel};
use crate::key::KeyOrder;
use crate::network::MAX_DISPATCH_GROUPS;
use crate::{Error, Result};

/// Bits per digit
pub const RADIX_BITS: u32 = 8;
/// Digit values
pub const RADIX_BUCKETS: usize = 1 << RADIX_BITS;
/// Digit extraction mask
pub const RADIX_MASK: u32 = (RADIX_BUCKETS - 1) as u32;
/// Digit passes over a 32-bit key
pub const DIGIT_PASSES: u32 = u32::BITS / RADIX_BITS;
/// Elements per histogram / scatter group
pub const RADIX_TILE: usize = 256;

// An even number of ping-pong swaps leaves the result in the caller's arena.
const _: () = assert!(DIGIT_PASSES % 2 == 0);

/// The two arenas a radix sort alternates between.
#[derive(Clone, Copy, Debug)]
pub struct PingPong {
    arenas:  [Arena; 2],
    current: usize,
}

impl PingPong {
    /// Starts reading from `primary`
    pub fn new(primary: Arena, alternate: Arena) -> Self {
        Self { arenas: [primary, alternate], current: 0 }
    }

    /// Arena holding the data of the current pass
    pub fn src(&self) -> Arena {
        self.arenas[self.current]
    }

    /// Arena the current pass writes to
    pub fn dst(&self) -> Arena {
        self.arenas[1 - self.current]
    }

    /// Swaps source and destination
    pub fn flip(&mut self) {
        self.current = 1 - self.current;
    }

    /// `true` once an even number of flips happened
    pub fn at_primary(&self) -> bool {
        self.current == 0
    }
}

#[derive(Clone, Copy, Debug)]
struct RadixScratch {
    alternate: Arena,
    histogram: BufferId,
    totals:    BufferId,
}

impl RadixScratch {
    fn buffers(&self) -> [BufferId; 4] {
        [self.alternate.keys, self.alternate.values, self.histogram, self.totals]
    }
}

/// Radix engine for one job.
///
/// A sorter whose capacity cannot be tiled is *invalid*: it holds no buffers and
/// every [`RadixSorter::sort`] fails with [`Error::InvalidCapacity`].
#[derive(Debug)]
pub struct RadixSorter {
    capacity: usize,
    scratch:  Option<RadixScratch>,
    reason:   Option<String>,
}

/// Tiles needed for `len` elements
pub fn tile_count(len: usize) -> usize {
    len.div_ceil(RADIX_TILE)
}

/// Why `capacity` cannot be tiled, `None` when it can
pub fn untileable(capacity: usize) -> Option<String> {
    let tiles = tile_count(capacity);
    if capacity == 0 {
        Some("empty".to_owned())
    } else if tiles > MAX_DISPATCH_GROUPS {
        Some(format!("{tiles} tiles of {RADIX_TILE} exceed {MAX_DISPATCH_GROUPS} groups"))
    } else {
        None
    }
}

impl RadixSorter {
    /// Allocates the scratch buffers for `capacity` pairs.
    ///
    /// Only device failures are reported as errors. An untileable capacity
    /// yields an invalid sorter instead, check [`RadixSorter::is_valid`].
    pub fn new<D: Device>(device: &mut D, capacity: usize) -> Result<Self> {
        let tiles = tile_count(capacity);
        if let Some(reason) = untileable(capacity) {
            log::warn!("Radix sorter cannot handle {capacity} elements: {reason}");
            return Ok(Self { capacity, scratch: None, reason: Some(reason) });
        }

        let mut acquired: Vec<BufferId> = Vec::with_capacity(4);
        let sizes = [
            ("radix_alt_keys", capacity),
            ("radix_alt_values", capacity),
            ("radix_histogram", tiles * RADIX_BUCKETS),
            ("radix_totals", RADIX_BUCKETS),
        ];
        for (label, words) in sizes {
            match device.create_buffer(label, words) {
                Ok(id) => acquired.push(id),
                Err(e) => {
                    for id in acquired {
                        device.release(id);
                    }
                    return Err(e);
                }
            }
        }
        log::debug!("Radix sorter ready for {capacity} elements ({tiles} tiles)");
        let scratch = RadixScratch {
            alternate: Arena { keys: acquired[0], values: acquired[1] },
            histogram: acquired[2],
            totals:    acquired[3],
        };
        Ok(Self { capacity, scratch: Some(scratch), reason: None })
    }

    /// `false` when the capacity could not be tiled
    pub fn is_valid(&self) -> bool {
        self.scratch.is_some()
    }

    /// Largest length this sorter handles
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn invalid(&self, reason: String) -> Error {
        Error::InvalidCapacity { engine: "radix", capacity: self.capacity, reason }
    }

    /// Sorts the first `len` pairs of `primary` in place.
    pub fn sort<D: Device>(&self, device: &mut D, primary: Arena, len: usize, order: KeyOrder) -> Result<()> {
        let scratch = match &self.scratch {
            Some(scratch) => *scratch,
            None => return Err(self.invalid(self.reason.clone().unwrap_or_else(|| "released".to_owned()))),
        };
        if len > self.capacity {
            return Err(self.invalid(format!("length {len} exceeds the allocated capacity")));
        }
        if len == 0 {
            return Ok(());
        }

        let tiles = group_count(len, RADIX_TILE);
        let n = len as u32;
        let mut buffers = PingPong::new(primary, scratch.alternate);
        log::debug!("Radix sort of {len} elements: {DIGIT_PASSES} passes x {tiles} tiles");

        for pass in 0..DIGIT_PASSES {
            let shift = pass * RADIX_BITS;
            let (src, dst) = (buffers.src(), buffers.dst());
            log::trace!("Radix pass {pass} (shift {shift})");
            device.dispatch(
                &Kernel::RadixHistogram { src, histogram: scratch.histogram, len: n, shift, order },
                tiles,
            )?;
            device.dispatch(
                &Kernel::RadixScan { histogram: scratch.histogram, totals: scratch.totals, tiles },
                1,
            )?;
            device.dispatch(
                &Kernel::RadixScatter { src, dst, histogram: scratch.histogram, len: n, shift, order },
                tiles,
            )?;
            buffers.flip();
        }
        debug_assert!(buffers.at_primary());
        Ok(())
    }

    /// Releases the scratch buffers. The sorter becomes invalid.
    pub fn release<D: Device>(&mut self, device: &mut D) {
        if let Some(scratch) = self.scratch.take() {
            for id in scratch.buffers() {
                device.release(id);
            }
        }
    }
}
