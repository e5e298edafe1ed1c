//! Sorting collections of positioned items by distance.

use crate::config::SortConfig;
use crate::cosort::CoSorter;
use crate::device::Device;
use crate::distance::Point3;
use crate::Result;

/// Anything with a position in space
pub trait Positioned {
    /// Current position
    fn position(&self) -> Point3;
}

impl Positioned for Point3 {
    fn position(&self) -> Point3 {
        *self
    }
}

impl Positioned for [f32; 3] {
    fn position(&self) -> Point3 {
        Point3::from(*self)
    }
}

/// Rearranges `items` so that `items[i] = old[permutation[i]]`.
///
/// # Panics
/// If an entry of `permutation` is not a valid index into `items`.
pub fn reorder<T: Clone>(items: &mut [T], permutation: &[u32]) {
    let old = items.to_vec();
    for (slot, &from) in items.iter_mut().zip(permutation) {
        *slot = old[from as usize].clone();
    }
}

/// A [`CoSorter`] with a host-side position cache.
pub struct DistanceSorter<D: Device> {
    sorter:    CoSorter<D>,
    positions: Vec<Point3>,
}

impl<D: Device> DistanceSorter<D> {
    /// Initialised sorter for `capacity` items
    pub fn new(device: D, config: SortConfig, capacity: usize) -> Result<Self> {
        let mut sorter = CoSorter::new(device, config)?;
        sorter.init(capacity)?;
        Ok(Self { sorter, positions: Vec::with_capacity(capacity) })
    }

    /// Sorts `items` in place by their distance to `target`.
    ///
    /// Returns the permutation that was applied.
    pub fn sort_by_distance<T>(&mut self, items: &mut [T], target: Point3) -> Result<Vec<u32>>
    where
        T: Positioned + Clone,
    {
        self.positions.clear();
        self.positions.extend(items.iter().map(Positioned::position));

        let permutation = self.sorter.sort_by_distance(&self.positions, target)?;
        reorder(items, &permutation);
        Ok(permutation)
    }

    /// The wrapped co-sorter
    pub fn inner(&mut self) -> &mut CoSorter<D> {
        &mut self.sorter
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Engine;
    use crate::device::HostDevice;

    use pretty_assertions::assert_eq;
    use rand::Rng;

    #[derive(Clone, Debug, PartialEq)]
    struct Unit {
        name: &'static str,
        at:   [f32; 3],
    }

    impl Positioned for Unit {
        fn position(&self) -> Point3 {
            self.at.position()
        }
    }

    #[test]
    fn test_reorder() {
        let mut items = vec!['a', 'b', 'c', 'd'];
        reorder(&mut items, &[2, 0, 3, 1]);
        assert_eq!(items, vec!['c', 'a', 'd', 'b']);
    }

    #[test]
    #[should_panic]
    fn test_reorder_out_of_range() {
        let mut items = vec![1, 2];
        reorder(&mut items, &[0, 2]);
    }

    #[test]
    fn test_sort_units() {
        let mut units = vec![
            Unit { name: "far", at: [10.0, 0.0, 0.0] },
            Unit { name: "near", at: [1.0, 1.0, 0.0] },
            Unit { name: "here", at: [0.0, 0.0, 0.0] },
            Unit { name: "mid", at: [0.0, 3.0, 4.0] },
        ];
        let mut sorter = DistanceSorter::new(HostDevice::new(), SortConfig { group_size: 4, ..Default::default() }, 4).unwrap();
        let permutation = sorter.sort_by_distance(&mut units, Point3::ZERO).unwrap();
        assert_eq!(permutation, vec![2, 1, 3, 0]);
        assert_eq!(units.iter().map(|u| u.name).collect::<Vec<_>>(), vec!["here", "near", "mid", "far"]);
    }

    #[test]
    fn test_growing_collection() {
        let mut rng = rand::thread_rng();
        let config = SortConfig { engine: Engine::Radix, ..Default::default() };
        let mut sorter = DistanceSorter::new(HostDevice::new(), config, 16).unwrap();
        let target = Point3::new(500.0, 500.0, 500.0);
        for n in [16usize, 40, 3] {
            let mut points: Vec<Point3> = (0..n)
                .map(|_| Point3::new(rng.gen_range(0.0..1000.0), rng.gen_range(0.0..1000.0), rng.gen_range(0.0..1000.0)))
                .collect();
            sorter.sort_by_distance(&mut points, target).unwrap();
            let d: Vec<f32> = points.iter().map(|p| p.distance_squared(target)).collect();
            assert!(d.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(sorter.inner().wrap().unwrap().logical_len, n);
        }
    }
}
