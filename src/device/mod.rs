//! Accelerator abstraction: opaque word buffers and named kernel dispatches.
//!
//! The schedulers in [`crate::network`], [`crate::radix`] and [`crate::distance`]
//! only ever talk to a [`Device`]. Two implementations exist:
//! - [`HostDevice`]: a software accelerator running each group of a dispatch on
//!   the rayon pool. Always available, used by the tests.
//! - `GpuDevice` (feature `gpu`): the same kernels as wgpu compute shaders.

use std::fmt;

use crate::distance::{DistanceMetric, Point3};
use crate::key::KeyOrder;
use crate::Result;

pub mod host;
#[cfg(feature = "gpu")]
pub mod gpu;

pub use host::HostDevice;
#[cfg(feature = "gpu")]
pub use gpu::GpuDevice;

/// Handle to a fixed-capacity device array of 32-bit words
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub(crate) usize);

impl fmt::Debug for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Index-aligned key and value buffers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Arena {
    /// Key words
    pub keys:   BufferId,
    /// Value words (payload, in practice indices)
    pub values: BufferId,
}

/// The accelerator programs the schedulers invoke.
///
/// Each variant carries the buffers it binds and its scalar parameters. `len`
/// is always the number of valid elements; groups covering elements past `len`
/// do nothing.
#[derive(Clone, Debug)]
pub enum Kernel {
    /// Per-element distance to `target`, written as float key bits, and identity values.
    Distance {
        /// Positions, 3 words per element
        positions: BufferId,
        /// Output keys and values
        out:       Arena,
        /// Query point
        target:    Point3,
        /// Squared or Euclidean
        metric:    DistanceMetric,
        /// Elements to evaluate
        len:       u32,
    },
    /// Each group sorts its `group_size` slice with a compare-exchange network.
    LocalSort {
        /// Pairs to sort
        data:       Arena,
        /// Elements
        len:        u32,
        /// Local group size (`G_local`)
        group_size: u32,
        /// Comparison
        order:      KeyOrder,
    },
    /// One odd-even transposition step at run granularity.
    Merge {
        /// Pairs to merge
        data:       Arena,
        /// Elements
        len:        u32,
        /// Run length (`G_local`); windows are two runs wide
        group_size: u32,
        /// Shift the windows by one run
        odd:        bool,
        /// Comparison
        order:      KeyOrder,
    },
    /// Per-tile digit histogram.
    RadixHistogram {
        /// Pairs read
        src:       Arena,
        /// `tiles * RADIX_BUCKETS` counters
        histogram: BufferId,
        /// Elements
        len:       u32,
        /// Digit bit offset
        shift:     u32,
        /// Comparison
        order:     KeyOrder,
    },
    /// Turns tile histograms into global scatter offsets (single group).
    RadixScan {
        /// Counts in, offsets out
        histogram: BufferId,
        /// Exclusive digit bases out
        totals:    BufferId,
        /// Number of tiles
        tiles:     u32,
    },
    /// Stable scatter of every tile into the alternate arena.
    RadixScatter {
        /// Pairs read
        src:       Arena,
        /// Pairs written
        dst:       Arena,
        /// Offsets from [`Kernel::RadixScan`]
        histogram: BufferId,
        /// Elements
        len:       u32,
        /// Digit bit offset
        shift:     u32,
        /// Comparison
        order:     KeyOrder,
    },
}

impl Kernel {
    /// Program name, also the shader entry file name.
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::Distance { .. } => "distance",
            Kernel::LocalSort { .. } => "local_sort",
            Kernel::Merge { .. } => "merge",
            Kernel::RadixHistogram { .. } => "radix_histogram",
            Kernel::RadixScan { .. } => "radix_scan",
            Kernel::RadixScatter { .. } => "radix_scatter",
        }
    }
}

/// An accelerator with one in-order queue.
///
/// Dispatches execute in program order; each one observes the writes of the
/// previous one. `download` blocks until all prior work is done.
pub trait Device {
    /// Human readable adapter name
    fn label(&self) -> String;

    /// Acquire a zeroed buffer of `words` 32-bit words.
    fn create_buffer(&mut self, label: &str, words: usize) -> Result<BufferId>;

    /// Copy `data` into the front of `buffer`.
    fn upload(&mut self, buffer: BufferId, data: &[u32]) -> Result<()>;

    /// Read the first `words` words of `buffer` back to the host.
    fn download(&mut self, buffer: BufferId, words: usize) -> Result<Vec<u32>>;

    /// Release `buffer`. Unknown handles are ignored.
    fn release(&mut self, buffer: BufferId);

    /// Run `kernel` across `groups` execution groups.
    fn dispatch(&mut self, kernel: &Kernel, groups: u32) -> Result<()>;

    /// Largest network group size the kernels support, `None` for no limit.
    fn max_group_size(&self) -> Option<u32> {
        None
    }
}

impl<D: Device + ?Sized> Device for Box<D> {
    fn label(&self) -> String {
        (**self).label()
    }
    fn create_buffer(&mut self, label: &str, words: usize) -> Result<BufferId> {
        (**self).create_buffer(label, words)
    }
    fn upload(&mut self, buffer: BufferId, data: &[u32]) -> Result<()> {
        (**self).upload(buffer, data)
    }
    fn download(&mut self, buffer: BufferId, words: usize) -> Result<Vec<u32>> {
        (**self).download(buffer, words)
    }
    fn release(&mut self, buffer: BufferId) {
        (**self).release(buffer)
    }
    fn dispatch(&mut self, kernel: &Kernel, groups: u32) -> Result<()> {
        (**self).dispatch(kernel, groups)
    }
    fn max_group_size(&self) -> Option<u32> {
        (**self).max_group_size()
    }
}

/// `ceil(len / group)` as a dispatch group count
pub fn group_count(len: usize, group: usize) -> u32 {
    len.div_ceil(group) as u32
}
