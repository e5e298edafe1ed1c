//! Merge-network co-sort.
//!
//! 1. `local_sort`: one dispatch, every group of `G_local` pairs is fully sorted
//!    by an in-group compare-exchange network. The array becomes `R = N / G_local`
//!    sorted runs.
//! 2. `merge`: `R` dispatches of an odd-even transposition sort whose elements are
//!    whole runs. A merge window is `G_merge = 2 * G_local` wide and merges two
//!    adjacent runs (the lower half stays in the lower run). Even passes pair runs
//!    `(2k, 2k+1)`, odd passes `(2k+1, 2k+2)`.
//!
//! By the 0-1 principle applied to runs, a run can only move one position per
//! pass, so `R` passes are both required and sufficient. Fewer passes leave the
//! output partially sorted without any error.

use crate::device::{group_count, Arena, Device, Kernel};
use crate::key::KeyOrder;
use crate::{Error, Result};

/// Runs per merge window
pub const MERGE_FACTOR: usize = 2;

/// Upper bound on groups in a single dispatch
pub const MAX_DISPATCH_GROUPS: usize = 65_535;

/// Dispatch plan for one sort of `len` elements
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkSchedule {
    /// Physical elements
    pub len:          usize,
    /// `G_local`
    pub group_size:   usize,
    /// Groups of the local sort pass
    pub local_groups: u32,
    /// Groups of every merge pass
    pub merge_groups: u32,
    /// Number of merge passes
    pub pass_count:   usize,
}

impl NetworkSchedule {
    /// Schedule for `len` elements.
    ///
    /// # Errors
    /// - [`Error::Misaligned`] if `len` is not a multiple of `group_size`.
    pub fn new(len: usize, group_size: usize) -> Result<Self> {
        if group_size == 0 || len % group_size != 0 {
            return Err(Error::Misaligned { len, granularity: group_size });
        }
        Ok(Self {
            len,
            group_size,
            local_groups: group_count(len, group_size),
            merge_groups: group_count(len, MERGE_FACTOR * group_size),
            pass_count:   len / group_size,
        })
    }

    /// `G_merge`
    pub fn merge_width(&self) -> usize {
        MERGE_FACTOR * self.group_size
    }

    /// Same schedule with a different number of merge passes
    pub fn with_pass_count(self, pass_count: usize) -> Self {
        Self { pass_count, ..self }
    }

    /// Phase flag (`isOddDispatch`) of every merge pass: `false, true, false, …`
    pub fn phases(&self) -> impl Iterator<Item = bool> {
        (0..self.pass_count).map(|pass| pass % 2 == 1)
    }
}

/// Network engine for one job
#[derive(Clone, Copy, Debug)]
pub struct NetworkSorter {
    group_size: usize,
    capacity:   usize,
}

impl NetworkSorter {
    /// Engine for buffers of `capacity` elements.
    ///
    /// # Errors
    /// - [`Error::InvalidCapacity`] if `capacity` is zero, not a multiple of
    ///   `group_size`, or needs more groups than one dispatch can hold.
    pub fn new(capacity: usize, group_size: usize) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidCapacity { engine: "network", capacity, reason };
        if capacity == 0 {
            return Err(invalid("empty".to_owned()));
        }
        if group_size == 0 || capacity % group_size != 0 {
            return Err(invalid(format!("not a multiple of the group size {group_size}")));
        }
        if capacity / group_size > MAX_DISPATCH_GROUPS {
            return Err(invalid(format!("needs more than {MAX_DISPATCH_GROUPS} groups of {group_size}")));
        }
        Ok(Self { group_size, capacity })
    }

    /// `G_local`
    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Sorts the first `len` pairs of `data` in place.
    pub fn sort<D: Device>(&self, device: &mut D, data: Arena, len: usize, order: KeyOrder) -> Result<()> {
        if len > self.capacity {
            return Err(Error::BufferOverflow { buffer: data.keys, capacity: self.capacity, requested: len });
        }
        let schedule = NetworkSchedule::new(len, self.group_size)?;
        self.run(device, data, &schedule, order)
    }

    /// Executes an explicit schedule.
    pub fn run<D: Device>(
        &self,
        device:   &mut D,
        data:     Arena,
        schedule: &NetworkSchedule,
        order:    KeyOrder,
    ) -> Result<()> {
        if schedule.len == 0 {
            return Ok(());
        }
        log::debug!(
            "Network sort of {} elements: {} local groups, {} merge passes x {} groups",
            schedule.len,
            schedule.local_groups,
            schedule.pass_count,
            schedule.merge_groups
        );
        let len = schedule.len as u32;
        let group_size = schedule.group_size as u32;

        device.dispatch(&Kernel::LocalSort { data, len, group_size, order }, schedule.local_groups)?;

        for (pass, odd) in schedule.phases().enumerate() {
            log::trace!("Merge pass {pass} (odd: {odd})");
            device.dispatch(&Kernel::Merge { data, len, group_size, odd, order }, schedule.merge_groups)?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::{arena_with, is_permutation, read_arena, Recorder};
    use crate::device::HostDevice;
    use crate::key::KeyKind;

    use pretty_assertions::assert_eq;
    use rand::Rng;

    const ASC: KeyOrder = KeyOrder { kind: KeyKind::Uint, ascending: true };

    fn sort_keys(keys: &[u32], group_size: usize) -> (Vec<u32>, Vec<u32>) {
        let mut dev = HostDevice::new();
        let values: Vec<u32> = (0..keys.len() as u32).collect();
        let arena = arena_with(&mut dev, keys, &values);
        NetworkSorter::new(keys.len(), group_size).unwrap().sort(&mut dev, arena, keys.len(), ASC).unwrap();
        read_arena(&mut dev, arena, keys.len())
    }

    fn is_sorted(keys: &[u32]) -> bool {
        keys.windows(2).all(|w| w[0] <= w[1])
    }

    #[test]
    fn test_schedule_shape() {
        let s = NetworkSchedule::new(48, 8).unwrap();
        assert_eq!(s.local_groups, 6);
        assert_eq!(s.merge_groups, 3);
        assert_eq!(s.pass_count, 6);
        assert_eq!(s.merge_width(), 16);
        assert_eq!(s.phases().collect::<Vec<_>>(), vec![false, true, false, true, false, true]);

        assert!(matches!(NetworkSchedule::new(12, 8), Err(Error::Misaligned { len: 12, granularity: 8 })));
    }

    #[test]
    fn test_dispatch_sequence() {
        let mut dev = Recorder::default();
        let keys: Vec<u32> = (0..40).rev().collect();
        let values: Vec<u32> = (0..40).collect();
        let arena = arena_with(&mut dev, &keys, &values);
        NetworkSorter::new(40, 8).unwrap().sort(&mut dev, arena, 40, ASC).unwrap();

        assert_eq!(dev.calls.len(), 1 + 5);
        assert_eq!(dev.calls[0].name, "local_sort");
        assert_eq!(dev.calls[0].groups, 5);
        for (pass, call) in dev.calls[1..].iter().enumerate() {
            assert_eq!(call.name, "merge");
            assert_eq!(call.groups, 3);
            assert_eq!(call.odd, Some(pass % 2 == 1));
        }
    }

    #[test]
    fn test_full_sort_all_multiples() {
        let mut rng = rand::thread_rng();
        for runs in 1..=12 {
            let n = runs * 8;
            let reversed: Vec<u32> = (0..n as u32).rev().collect();
            let equal = vec![42u32; n];
            let random: Vec<u32> = (0..n).map(|_| rng.gen_range(0..50)).collect();
            for keys in [reversed, equal, random] {
                let (sorted, values) = sort_keys(&keys, 8);
                assert!(is_sorted(&sorted), "n={n}: {sorted:?}");
                assert!(is_permutation(&values));
                for (k, v) in sorted.iter().zip(&values) {
                    assert_eq!(*k, keys[*v as usize]);
                }
            }
        }
    }

    #[test]
    fn test_rotated_runs() {
        let keys: Vec<u32> = (8..16).chain(0..8).collect();
        let (sorted, values) = sort_keys(&keys, 8);
        assert_eq!(sorted, (0..16).collect::<Vec<_>>());
        assert_eq!(values, vec![8, 9, 10, 11, 12, 13, 14, 15, 0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_pass_count_is_tight() {
        // Reversed input: every run must travel the full width of the array.
        for runs in [3usize, 4, 5, 8] {
            let n = runs * 8;
            let keys: Vec<u32> = (0..n as u32).rev().collect();
            let values: Vec<u32> = (0..n as u32).collect();
            let sorter = NetworkSorter::new(n, 8).unwrap();
            let schedule = NetworkSchedule::new(n, 8).unwrap();

            let mut dev = HostDevice::new();
            let arena = arena_with(&mut dev, &keys, &values);
            sorter.run(&mut dev, arena, &schedule.with_pass_count(schedule.pass_count - 1), ASC).unwrap();
            let (short, _) = read_arena(&mut dev, arena, n);
            assert!(!is_sorted(&short), "{runs} runs sorted with one pass less");

            // The missing pass finishes the job
            sorter.run(&mut dev, arena, &schedule.with_pass_count(schedule.pass_count), ASC).unwrap();
            assert!(is_sorted(&read_arena(&mut dev, arena, n).0));
        }
    }

    #[test]
    fn test_extra_passes_are_harmless() {
        let keys: Vec<u32> = (0..32).rev().collect();
        let values: Vec<u32> = (0..32).collect();
        let mut dev = HostDevice::new();
        let arena = arena_with(&mut dev, &keys, &values);
        let schedule = NetworkSchedule::new(32, 8).unwrap();
        NetworkSorter::new(32, 8).unwrap().run(&mut dev, arena, &schedule.with_pass_count(9), ASC).unwrap();
        assert_eq!(read_arena(&mut dev, arena, 32).0, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_descending_floats() {
        let order = KeyOrder::new(KeyKind::Float, false);
        let keys: Vec<f32> = vec![0.5, -2.0, 8.0, -0.5, 3.0, 1.0, -9.0, 4.0];
        let bits: Vec<u32> = keys.iter().map(|k| k.to_bits()).collect();
        let mut dev = HostDevice::new();
        let arena = arena_with(&mut dev, &bits, &(0..8).collect::<Vec<_>>());
        NetworkSorter::new(8, 4).unwrap().sort(&mut dev, arena, 8, order).unwrap();
        let sorted: Vec<f32> = read_arena(&mut dev, arena, 8).0.into_iter().map(f32::from_bits).collect();
        assert_eq!(sorted, vec![8.0, 4.0, 3.0, 1.0, 0.5, -0.5, -2.0, -9.0]);
    }

    #[test]
    fn test_invalid_capacity() {
        assert!(matches!(NetworkSorter::new(0, 8), Err(Error::InvalidCapacity { .. })));
        assert!(matches!(NetworkSorter::new(12, 8), Err(Error::InvalidCapacity { .. })));
        assert!(matches!(NetworkSorter::new(8 * (MAX_DISPATCH_GROUPS + 1), 8), Err(Error::InvalidCapacity { .. })));
    }
}
