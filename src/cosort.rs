//! The co-sort façade.
//!
//! A [`CoSorter`] owns one accelerator and every buffer of one sorting job. It
//! pads arbitrary lengths for the selected engine, uploads the pairs, runs the
//! engine and hands back the permutation with the padding stripped.
//!
//! ```
//! use cosort::{CoSorter, HostDevice, SortConfig};
//!
//! let mut sorter = CoSorter::new(HostDevice::new(), SortConfig { group_size: 8, ..Default::default() }).unwrap();
//! sorter.init(5).unwrap();
//! let order = sorter.sort_indices(&[30u32, 10, 50, 20, 40]).unwrap();
//! assert_eq!(order, vec![1, 3, 0, 4, 2]);
//! ```

use crate::compensator::{LengthCompensator, Wrap};
use crate::config::{Engine, SortConfig};
use crate::device::{Arena, BufferId, Device};
use crate::distance::{DistanceEvaluator, Point3};
use crate::key::{KeyKind, KeyOrder, SortKey};
use crate::network::NetworkSorter;
use crate::radix::{untileable, RadixSorter};
use crate::{Error, Result};

/// Externally visible lifecycle of a [`CoSorter`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SorterStatus {
    /// Created, no buffers yet
    Uninitialized,
    /// Buffers acquired, sorts allowed
    Ready,
    /// Terminal
    Released,
}

enum EngineState {
    Network(NetworkSorter),
    Radix(RadixSorter),
}

struct Job {
    wrap:      Wrap,
    data:      Arena,
    positions: BufferId,
    engine:    EngineState,
    sorted:    bool,
}

enum SorterState {
    Uninitialized,
    Ready(Job),
    Released,
}

/// Sorts keys together with their values on one device.
pub struct CoSorter<D: Device> {
    device:      D,
    config:      SortConfig,
    compensator: LengthCompensator,
    state:       SorterState,
}

impl<D: Device> CoSorter<D> {
    /// New sorter on `device`. Buffers are only acquired by [`CoSorter::init`].
    ///
    /// # Errors
    /// - [`Error::InvalidConfig`] if the configuration does not validate, or the
    ///   network group size exceeds what `device` supports.
    pub fn new(device: D, config: SortConfig) -> Result<Self> {
        config.validate()?;
        if let (Engine::Network, Some(max)) = (config.engine, device.max_group_size()) {
            if config.group_size > max {
                return Err(Error::InvalidConfig(format!(
                    "group size {} exceeds the {max} supported by {}",
                    config.group_size,
                    device.label()
                )));
            }
        }
        let compensator = LengthCompensator::new(config.granularity());
        log::info!(
            "Co-sorter on {}: {} engine, group size {}, {}",
            device.label(),
            config.engine,
            config.group_size,
            if config.ascending { "ascending" } else { "descending" }
        );
        Ok(Self { device, config, compensator, state: SorterState::Uninitialized })
    }

    /// Current lifecycle state
    pub fn status(&self) -> SorterStatus {
        match self.state {
            SorterState::Uninitialized => SorterStatus::Uninitialized,
            SorterState::Ready(_) => SorterStatus::Ready,
            SorterState::Released => SorterStatus::Released,
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &SortConfig {
        &self.config
    }

    /// Underlying device
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Padding bookkeeping of the current job, if any
    pub fn wrap(&self) -> Option<Wrap> {
        match &self.state {
            SorterState::Ready(job) => Some(job.wrap),
            _ => None,
        }
    }

    /// Acquires every buffer for `capacity` logical elements.
    ///
    /// A sorter that is already initialised releases its job first.
    ///
    /// # Errors
    /// - [`Error::InvalidCapacity`] if the engine cannot handle the padded
    ///   capacity. Nothing stays allocated and the sorter stays uninitialised.
    /// - [`Error::Released`] after [`CoSorter::release`].
    pub fn init(&mut self, capacity: usize) -> Result<()> {
        match std::mem::replace(&mut self.state, SorterState::Uninitialized) {
            SorterState::Released => {
                self.state = SorterState::Released;
                return Err(Error::Released);
            }
            SorterState::Ready(job) => self.release_job(job),
            SorterState::Uninitialized => {}
        }
        let wrap = self.compensator.wrap(capacity);
        let job = self.acquire(wrap)?;
        log::info!(
            "Initialised {} sorter for {} elements ({} padded)",
            self.config.engine,
            wrap.logical_len,
            wrap.corrected_len
        );
        self.state = SorterState::Ready(job);
        Ok(())
    }

    fn engine(&mut self, capacity: usize) -> Result<EngineState> {
        match self.config.engine {
            Engine::Network => Ok(EngineState::Network(NetworkSorter::new(capacity, self.config.group_size as usize)?)),
            Engine::Radix => {
                let sorter = RadixSorter::new(&mut self.device, capacity)?;
                if !sorter.is_valid() {
                    return Err(Error::InvalidCapacity {
                        engine: "radix",
                        capacity,
                        reason: "no tiling for this capacity".to_owned(),
                    });
                }
                Ok(EngineState::Radix(sorter))
            }
        }
    }

    /// Rejects capacities the engine cannot tile, without allocating.
    fn check_capacity(&self, capacity: usize) -> Result<()> {
        match self.config.engine {
            Engine::Network => NetworkSorter::new(capacity, self.config.group_size as usize).map(|_| ()),
            Engine::Radix => match untileable(capacity) {
                Some(reason) => Err(Error::InvalidCapacity { engine: "radix", capacity, reason }),
                None => Ok(()),
            },
        }
    }

    /// Engine first, so an untileable capacity allocates nothing.
    fn acquire(&mut self, wrap: Wrap) -> Result<Job> {
        let capacity = wrap.corrected_len;
        let engine = match self.engine(capacity) {
            Ok(engine) => engine,
            Err(e) => {
                log::error!("Failed to initialise the {} engine: {e}", self.config.engine);
                return Err(e);
            }
        };

        let mut acquired = Vec::with_capacity(3);
        for (label, words) in [("keys", capacity), ("values", capacity), ("positions", 3 * capacity)] {
            match self.device.create_buffer(label, words) {
                Ok(id) => acquired.push(id),
                Err(e) => {
                    log::error!("Failed to allocate {label} for {capacity} elements: {e}");
                    for id in acquired {
                        self.device.release(id);
                    }
                    if let EngineState::Radix(mut sorter) = engine {
                        sorter.release(&mut self.device);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Job {
            wrap,
            data: Arena { keys: acquired[0], values: acquired[1] },
            positions: acquired[2],
            engine,
            sorted: false,
        })
    }

    fn release_job(&mut self, job: Job) {
        let Job { data, positions, engine, .. } = job;
        if let EngineState::Radix(mut sorter) = engine {
            sorter.release(&mut self.device);
        }
        for id in [data.keys, data.values, positions] {
            self.device.release(id);
        }
    }

    /// Re-sizes the job for `new_len` logical elements.
    ///
    /// Buffers are only reacquired when the padded capacity changes. A capacity
    /// the engine rejects leaves the current job untouched.
    ///
    /// # Errors
    /// - [`Error::InvalidCapacity`] if the engine cannot tile the new capacity.
    pub fn resize(&mut self, new_len: usize) -> Result<()> {
        let wrap = self.compensator.wrap(new_len);
        let job = match &mut self.state {
            SorterState::Uninitialized => return Err(Error::NotInitialized),
            SorterState::Released => return Err(Error::Released),
            SorterState::Ready(job) => job,
        };
        if wrap.corrected_len == job.wrap.corrected_len {
            log::debug!("Resize to {new_len} keeps the padded capacity {}", wrap.corrected_len);
            job.wrap = wrap;
            job.sorted = false;
            return Ok(());
        }
        let previous = job.wrap.corrected_len;
        if let Err(e) = self.check_capacity(wrap.corrected_len) {
            log::error!("Keeping the {previous} element buffers: {e}");
            return Err(e);
        }
        log::info!("Reallocating buffers: {previous} -> {} padded elements", wrap.corrected_len);
        if let SorterState::Ready(job) = std::mem::replace(&mut self.state, SorterState::Uninitialized) {
            self.release_job(job);
        }
        let job = self.acquire(wrap)?;
        self.state = SorterState::Ready(job);
        Ok(())
    }

    /// Checks the state and resizes when `len` differs from the cached length.
    fn prepare(&mut self, len: usize) -> Result<()> {
        let logical_len = match &self.state {
            SorterState::Uninitialized => return Err(Error::NotInitialized),
            SorterState::Released => return Err(Error::Released),
            SorterState::Ready(job) => job.wrap.logical_len,
        };
        if len != logical_len && len > 0 {
            log::warn!(
                "Input length changed from {logical_len} to {len}, resizing device buffers. \
                 This is expensive, use a second sorter for inputs of a different size"
            );
            self.resize(len)?;
        }
        Ok(())
    }

    fn job(&mut self) -> Result<(&mut D, &mut Job)> {
        match &mut self.state {
            SorterState::Ready(job) => Ok((&mut self.device, job)),
            SorterState::Uninitialized => Err(Error::NotInitialized),
            SorterState::Released => Err(Error::Released),
        }
    }

    fn order(&self, kind: KeyKind) -> KeyOrder {
        KeyOrder::new(kind, self.config.ascending)
    }

    /// Runs the engine on the uploaded job and reads back the logical permutation.
    fn run(&mut self, order: KeyOrder) -> Result<Vec<u32>> {
        let (device, job) = self.job()?;
        let len = job.wrap.corrected_len;
        match &job.engine {
            EngineState::Network(sorter) => sorter.sort(device, job.data, len, order)?,
            EngineState::Radix(sorter) => sorter.sort(device, job.data, len, order)?,
        }
        job.sorted = true;
        let physical = device.download(job.data.values, len)?;
        Ok(job.wrap.strip(&physical))
    }

    /// Permutation that sorts `keys`: element `i` of the result is the input
    /// index of the `i`-th smallest key (largest when descending).
    ///
    /// # Errors
    /// - [`Error::NotInitialized`] before [`CoSorter::init`].
    /// - [`Error::Released`] after [`CoSorter::release`].
    pub fn sort_indices<K: SortKey>(&mut self, keys: &[K]) -> Result<Vec<u32>> {
        self.prepare(keys.len())?;
        if keys.is_empty() {
            self.job()?.1.sorted = false;
            return Ok(Vec::new());
        }
        let order = self.order(K::KIND);
        let sentinel = [K::leading(self.config.ascending).to_bits()];
        let (device, job) = self.job()?;
        let wrap = job.wrap;
        let key_words = wrap.pad_words(&sentinel, keys.iter().map(|k| k.to_bits()));
        let identity: Vec<u32> = (0..wrap.corrected_len as u32).collect();
        device.upload(job.data.keys, &key_words)?;
        device.upload(job.data.values, &identity)?;
        self.run(order)
    }

    /// Sorts `values` by their `keys`.
    ///
    /// # Errors
    /// - [`Error::LengthMismatch`] if the slices differ in length.
    /// - Any error of [`CoSorter::sort_indices`].
    pub fn sort<K: SortKey, V: Clone>(&mut self, keys: &[K], values: &[V]) -> Result<Vec<V>> {
        if keys.len() != values.len() {
            return Err(Error::LengthMismatch { keys: keys.len(), values: values.len() });
        }
        let permutation = self.sort_indices(keys)?;
        Ok(permutation.iter().map(|&i| values[i as usize].clone()).collect())
    }

    /// Permutation ordering `positions` by their distance to `target`.
    pub fn sort_by_distance(&mut self, positions: &[Point3], target: Point3) -> Result<Vec<u32>> {
        self.prepare(positions.len())?;
        if positions.is_empty() {
            self.job()?.1.sorted = false;
            return Ok(Vec::new());
        }
        let order = self.order(KeyKind::Float);
        let evaluator = DistanceEvaluator::new(self.config.metric);
        let (device, job) = self.job()?;
        let wrap = job.wrap;
        // Padding sits on the target itself
        let words = wrap.pad_words(
            bytemuck::cast_slice(std::slice::from_ref(&target)),
            bytemuck::cast_slice::<Point3, u32>(positions).iter().copied(),
        );
        device.upload(job.positions, &words)?;
        evaluator.evaluate(device, job.positions, job.data, target, wrap.corrected_len)?;
        self.run(order)
    }

    /// Logical keys of the last sort, in sorted order. Empty before the first
    /// sort and after an empty one.
    pub fn sorted_keys<K: SortKey>(&mut self) -> Result<Vec<K>> {
        let (device, job) = self.job()?;
        if !job.sorted {
            return Ok(Vec::new());
        }
        let len = job.wrap.corrected_len;
        let keys = device.download(job.data.keys, len)?;
        let values = device.download(job.data.values, len)?;
        let pad = job.wrap.pad as u32;
        Ok(keys
            .into_iter()
            .zip(values)
            .filter(|&(_, v)| v >= pad)
            .map(|(k, _)| K::from_bits(k))
            .collect())
    }

    /// Releases every buffer. The sorter cannot be used afterwards.
    ///
    /// # Errors
    /// - [`Error::Released`] if called twice.
    pub fn release(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, SorterState::Released) {
            SorterState::Released => Err(Error::Released),
            SorterState::Uninitialized => Ok(()),
            SorterState::Ready(job) => {
                self.release_job(job);
                log::info!("Released co-sorter buffers");
                Ok(())
            }
        }
    }
}

impl<D: Device> Drop for CoSorter<D> {
    fn drop(&mut self) {
        if let SorterState::Ready(job) = std::mem::replace(&mut self.state, SorterState::Released) {
            self.release_job(job);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::{is_permutation, Recorder};
    use crate::device::HostDevice;
    use crate::distance::DistanceMetric;
    use crate::network::MAX_DISPATCH_GROUPS;
    use crate::radix::RADIX_TILE;

    use pretty_assertions::assert_eq;
    use rand::Rng;

    fn config(engine: Engine, group_size: u32) -> SortConfig {
        SortConfig { engine, group_size, ..Default::default() }
    }

    fn sorter(engine: Engine, group_size: u32, capacity: usize) -> CoSorter<HostDevice> {
        let mut s = CoSorter::new(HostDevice::new(), config(engine, group_size)).unwrap();
        s.init(capacity).unwrap();
        s
    }

    #[test]
    fn test_lifecycle_errors() {
        let mut s = CoSorter::new(HostDevice::new(), config(Engine::Network, 8)).unwrap();
        assert_eq!(s.status(), SorterStatus::Uninitialized);
        assert!(matches!(s.sort_indices(&[1u32, 2]), Err(Error::NotInitialized)));
        assert!(matches!(s.sort_by_distance(&[Point3::ZERO], Point3::ZERO), Err(Error::NotInitialized)));

        s.init(4).unwrap();
        assert_eq!(s.status(), SorterStatus::Ready);
        s.release().unwrap();
        assert_eq!(s.status(), SorterStatus::Released);
        assert_eq!(s.device().live_buffers(), 0);

        assert!(matches!(s.sort_indices(&[1u32]), Err(Error::Released)));
        assert!(matches!(s.init(4), Err(Error::Released)));
        assert!(matches!(s.release(), Err(Error::Released)));
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            CoSorter::new(HostDevice::new(), config(Engine::Network, 7)),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_five_keys_group_eight() {
        let mut s = sorter(Engine::Network, 8, 5);
        assert_eq!(s.wrap(), Some(Wrap { logical_len: 5, corrected_len: 8, pad: 3 }));

        let keys = [7u32, 3, 9, 1, 5];
        let order = s.sort_indices(&keys).unwrap();
        assert_eq!(order.len(), 5);
        assert!(order.iter().all(|&i| i < 5));
        assert_eq!(order, vec![3, 1, 4, 0, 2]);
        assert_eq!(s.sorted_keys::<u32>().unwrap(), vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_sentinel_ties() {
        // Real keys equal to the padding sentinel
        let mut s = sorter(Engine::Network, 8, 3);
        let order = s.sort_indices(&[0u32, 5, 0]).unwrap();
        assert_eq!(order.len(), 3);
        assert_eq!(order[2], 1);
        assert_eq!(s.sorted_keys::<u32>().unwrap(), vec![0, 0, 5]);
    }

    #[test]
    fn test_engines_agree() {
        let mut rng = rand::thread_rng();
        for n in [1usize, 13, 100, 517] {
            let keys: Vec<f32> = (0..n).map(|_| rng.gen_range(-1e3f32..1e3)).collect();
            let mut network = sorter(Engine::Network, 16, n);
            let mut radix = sorter(Engine::Radix, 16, n);
            let a = network.sort_indices(&keys).unwrap();
            let b = radix.sort_indices(&keys).unwrap();
            assert!(is_permutation(&a));
            let sorted_a: Vec<f32> = a.iter().map(|&i| keys[i as usize]).collect();
            let sorted_b: Vec<f32> = b.iter().map(|&i| keys[i as usize]).collect();
            assert_eq!(sorted_a, sorted_b);
            assert!(sorted_a.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn test_sort_values() {
        let mut s = sorter(Engine::Radix, 2, 4);
        let sorted = s.sort(&[3.0f32, -1.0, 2.0, 0.5], &["c", "a", "z", "b"]).unwrap();
        assert_eq!(sorted, vec!["a", "b", "z", "c"]);
        assert!(matches!(s.sort(&[1u32], &["a", "b"]), Err(Error::LengthMismatch { keys: 1, values: 2 })));
    }

    #[test]
    fn test_descending() {
        let cfg = SortConfig { group_size: 4, ascending: false, ..Default::default() };
        let mut s = CoSorter::new(HostDevice::new(), cfg).unwrap();
        s.init(6).unwrap();
        let sorted = s.sort(&[1u32, 6, 3, 2, 5, 4], &[1, 6, 3, 2, 5, 4]).unwrap();
        assert_eq!(sorted, vec![6, 5, 4, 3, 2, 1]);
        assert_eq!(s.sorted_keys::<u32>().unwrap(), vec![6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_transparent_resize() {
        let mut s = sorter(Engine::Network, 8, 10);
        let live = s.device().live_buffers();
        assert_eq!(s.sort_indices(&(0..10u32).rev().collect::<Vec<_>>()).unwrap().len(), 10);

        // Same padded capacity: bookkeeping only
        let order = s.sort_indices(&(0..12u32).rev().collect::<Vec<_>>()).unwrap();
        assert_eq!(order, (0..12u32).rev().collect::<Vec<_>>());
        assert_eq!(s.wrap(), Some(Wrap { logical_len: 12, corrected_len: 16, pad: 4 }));
        assert_eq!(s.device().live_buffers(), live);

        // Larger capacity: reallocation
        let order = s.sort_indices(&(0..30u32).rev().collect::<Vec<_>>()).unwrap();
        assert_eq!(order, (0..30u32).rev().collect::<Vec<_>>());
        assert_eq!(s.wrap().unwrap().corrected_len, 32);
        assert_eq!(s.device().live_buffers(), live);
    }

    #[test]
    fn test_empty_input_skips_device() {
        let mut s = CoSorter::new(Recorder::default(), config(Engine::Network, 8)).unwrap();
        s.init(8).unwrap();
        assert_eq!(s.sort_indices::<u32>(&[]).unwrap(), Vec::<u32>::new());
        assert_eq!(s.sort_by_distance(&[], Point3::ZERO).unwrap(), Vec::<u32>::new());
        assert!(s.device().calls.is_empty());
        assert_eq!(s.wrap().unwrap().logical_len, 8);
    }

    #[test]
    fn test_sort_by_distance() {
        let positions: Vec<Point3> = [5.0, -1.0, 3.0, 0.5, -4.0].iter().map(|&x| Point3::new(x, 0.0, 0.0)).collect();
        for engine in [Engine::Network, Engine::Radix] {
            let cfg = SortConfig { engine, group_size: 4, metric: DistanceMetric::Euclidean, ..Default::default() };
            let mut s = CoSorter::new(Recorder::default(), cfg).unwrap();
            s.init(positions.len()).unwrap();
            let order = s.sort_by_distance(&positions, Point3::new(1.0, 0.0, 0.0)).unwrap();
            assert_eq!(order, vec![3, 1, 2, 0, 4]);
            assert_eq!(s.device().calls[0].name, "distance");
            assert_eq!(s.sorted_keys::<f32>().unwrap(), vec![0.5, 2.0, 2.0, 4.0, 5.0]);
        }
    }

    #[test]
    fn test_rejected_resize_keeps_job() {
        let mut s = sorter(Engine::Network, 2, 4);
        assert_eq!(s.sort_indices(&[4u32, 3, 2, 1]).unwrap(), vec![3, 2, 1, 0]);
        let live = s.device().live_buffers();

        let too_many = vec![0u32; 2 * (MAX_DISPATCH_GROUPS + 1)];
        assert!(matches!(s.sort_indices(&too_many), Err(Error::InvalidCapacity { engine: "network", .. })));
        assert_eq!(s.status(), SorterStatus::Ready);
        assert_eq!(s.wrap(), Some(Wrap { logical_len: 4, corrected_len: 4, pad: 0 }));
        assert_eq!(s.device().live_buffers(), live);
        assert_eq!(s.sort_indices(&[4u32, 3, 2, 1]).unwrap(), vec![3, 2, 1, 0]);

        let mut r = sorter(Engine::Radix, 2, 10);
        assert!(matches!(r.resize(RADIX_TILE * (MAX_DISPATCH_GROUPS + 1)), Err(Error::InvalidCapacity { engine: "radix", .. })));
        assert_eq!(r.status(), SorterStatus::Ready);
        assert_eq!(r.sort_indices(&[2.0f32, -1.0]).unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_empty_sort_clears_sorted_keys() {
        let mut s = sorter(Engine::Radix, 2, 3);
        s.sort_indices(&[3u32, 1, 2]).unwrap();
        assert_eq!(s.sorted_keys::<u32>().unwrap(), vec![1, 2, 3]);
        assert_eq!(s.sort_indices::<u32>(&[]).unwrap(), Vec::<u32>::new());
        assert_eq!(s.sorted_keys::<u32>().unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn test_group_size_over_device_limit() {
        let limited = || Recorder { max_group_size: Some(64), ..Default::default() };
        assert!(matches!(
            CoSorter::new(limited(), config(Engine::Network, 128)),
            Err(Error::InvalidConfig(_))
        ));
        assert!(CoSorter::new(limited(), config(Engine::Network, 64)).is_ok());
        // Radix ignores the group size
        assert!(CoSorter::new(limited(), config(Engine::Radix, 128)).is_ok());
    }

    #[test]
    fn test_invalid_radix_capacity_allocates_nothing() {
        let mut s = CoSorter::new(HostDevice::new(), config(Engine::Radix, 2)).unwrap();
        assert!(matches!(s.init(0), Err(Error::InvalidCapacity { engine: "radix", .. })));
        assert_eq!(s.status(), SorterStatus::Uninitialized);
        assert_eq!(s.device().live_buffers(), 0);
    }

    #[test]
    fn test_reinit_releases_previous_job() {
        let mut s = sorter(Engine::Radix, 2, 100);
        let live = s.device().live_buffers();
        s.init(1000).unwrap();
        assert_eq!(s.device().live_buffers(), live);
        assert_eq!(s.sort_indices(&[2u32, 1]).unwrap(), vec![1, 0]);
    }
}
