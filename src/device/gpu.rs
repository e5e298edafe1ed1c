//! wgpu backend: the kernels as WGSL compute shaders.
//!
//! Each dispatch is encoded and submitted on its own, so the queue order is the
//! program order and every dispatch sees the writes of the previous one.
//! Shader constants (group size and friends) are generated per pipeline and
//! pipelines are cached by kernel and group size.

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use super::{BufferId, Device, Kernel};
use crate::distance::EVAL_GROUP_SIZE;
use crate::key::{KeyKind, KeyOrder};
use crate::network::MERGE_FACTOR;
use crate::radix::{RADIX_BUCKETS, RADIX_TILE};
use crate::{Error, Result};

/// Largest network group size the shaders support (one invocation per pair in `merge`)
pub const MAX_GROUP_SIZE: u32 = 256;

// ──────────────────────────────────────────────────────────────────────────────
// GPU-side data structures (must match WGSL structs exactly)
// ──────────────────────────────────────────────────────────────────────────────

/// `Params` in `key_order.wgsl` (16 bytes)
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Params {
    len:       u32,
    flag:      u32,
    kind:      u32,
    ascending: u32,
}

impl Params {
    fn new(len: u32, flag: u32, order: KeyOrder) -> Self {
        let kind = match order.kind {
            KeyKind::Uint => 0,
            KeyKind::Float => 1,
        };
        Self { len, flag, kind, ascending: order.ascending as u32 }
    }
}

/// `DistanceParams` in `distance.wgsl` (32 bytes, vec3 padded to 16)
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct DistanceParams {
    query:  [f32; 3],
    len:    u32,
    metric: u32,
    pad:    [u32; 3],
}

// ──────────────────────────────────────────────────────────────────────────────
// Shader sources
// ──────────────────────────────────────────────────────────────────────────────

const KEY_ORDER: &str = include_str!("../shaders/key_order.wgsl");

fn shader_body(kernel: &'static str) -> &'static str {
    match kernel {
        "distance" => include_str!("../shaders/distance.wgsl"),
        "local_sort" => include_str!("../shaders/local_sort.wgsl"),
        "merge" => include_str!("../shaders/merge.wgsl"),
        "radix_histogram" => include_str!("../shaders/radix_histogram.wgsl"),
        "radix_scan" => include_str!("../shaders/radix_scan.wgsl"),
        _ => include_str!("../shaders/radix_scatter.wgsl"),
    }
}

fn shader_source(kernel: &'static str, group_size: u32) -> String {
    let common = if kernel == "distance" { "" } else { KEY_ORDER };
    format!(
        "const GROUP_SIZE: u32 = {group_size}u;\n\
         const HALF_GROUP: u32 = {half}u;\n\
         const WINDOW: u32 = {window}u;\n\
         const RADIX_BUCKETS: u32 = {RADIX_BUCKETS}u;\n\
         const RADIX_TILE: u32 = {RADIX_TILE}u;\n\
         const EVAL_GROUP_SIZE: u32 = {EVAL_GROUP_SIZE}u;\n\
         {common}\n{body}",
        half = group_size / 2,
        window = group_size * MERGE_FACTOR as u32,
        body = shader_body(kernel),
    )
}

// ──────────────────────────────────────────────────────────────────────────────
// Device
// ──────────────────────────────────────────────────────────────────────────────

struct GpuBuffer {
    label:  String,
    words:  usize,
    buffer: wgpu::Buffer,
}

/// One wgpu adapter and its queue
pub struct GpuDevice {
    device:    wgpu::Device,
    queue:     wgpu::Queue,
    adapter:   String,
    buffers:   Vec<Option<GpuBuffer>>,
    pipelines: HashMap<(&'static str, u32), wgpu::ComputePipeline>,
}

/// A buffer bound at `binding`, with the words the kernel addresses
type Binding = (u32, BufferId, usize);

impl GpuDevice {
    /// Opens the default high-performance adapter.
    ///
    /// # Errors
    /// - [`Error::Device`] if no adapter or device is available.
    pub fn new() -> Result<Self> {
        pollster::block_on(Self::request())
    }

    async fn request() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Device(format!("no GPU adapter found: {e}")))?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("cosort_gpu"),
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Device(format!("failed to get GPU device: {e}")))?;

        let adapter = adapter.get_info().name;
        log::info!("GPU: {adapter}");
        Ok(Self { device, queue, adapter, buffers: Vec::new(), pipelines: HashMap::new() })
    }

    fn buffer(&self, id: BufferId, needed: usize) -> Result<&GpuBuffer> {
        let buf = self.buffers.get(id.0).and_then(Option::as_ref).ok_or(Error::UnknownBuffer(id))?;
        if buf.words < needed {
            return Err(Error::BufferOverflow { buffer: id, capacity: buf.words, requested: needed });
        }
        Ok(buf)
    }

    fn compile(&self, kernel: &'static str, group_size: u32) -> wgpu::ComputePipeline {
        log::debug!("Compiling {kernel} (group size {group_size})");
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label:  Some(kernel),
            source: wgpu::ShaderSource::Wgsl(shader_source(kernel, group_size).into()),
        });
        self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label:               Some(kernel),
            layout:              None,
            module:              &module,
            entry_point:         Some("main"),
            compilation_options: Default::default(),
            cache:               Default::default(),
        })
    }

    /// Binds `params` at 0 and `bindings` after it, then dispatches `groups` workgroups.
    fn run(
        &mut self,
        kernel:     &'static str,
        group_size: u32,
        params:     &[u8],
        bindings:   &[Binding],
        groups:     u32,
    ) -> Result<()> {
        for (i, &(_, id, needed)) in bindings.iter().enumerate() {
            self.buffer(id, needed)?;
            if bindings[i + 1..].iter().any(|&(_, other, _)| other == id) {
                return Err(Error::AliasedBuffers(id));
            }
        }
        if groups == 0 {
            return Ok(());
        }
        if !self.pipelines.contains_key(&(kernel, group_size)) {
            let pipeline = self.compile(kernel, group_size);
            self.pipelines.insert((kernel, group_size), pipeline);
        }
        let pipeline = &self.pipelines[&(kernel, group_size)];

        let uniform = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label:    Some("params"),
            contents: params,
            usage:    wgpu::BufferUsages::UNIFORM,
        });
        let mut entries = vec![wgpu::BindGroupEntry { binding: 0, resource: uniform.as_entire_binding() }];
        for &(binding, id, _) in bindings {
            entries.push(wgpu::BindGroupEntry { binding, resource: self.buffer(id, 0)?.buffer.as_entire_binding() });
        }
        let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label:   Some(kernel),
            layout:  &pipeline.get_bind_group_layout(0),
            entries: &entries,
        });

        let mut enc = self.device.create_command_encoder(&Default::default());
        {
            let mut pass = enc.begin_compute_pass(&Default::default());
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bg, &[]);
            pass.dispatch_workgroups(groups, 1, 1);
        }
        self.queue.submit([enc.finish()]);
        Ok(())
    }
}

fn check_group_size(group_size: u32) -> Result<()> {
    if group_size == 0 || group_size % 2 != 0 || group_size > MAX_GROUP_SIZE {
        return Err(Error::Device(format!(
            "group size {group_size} unsupported on the GPU (even, at most {MAX_GROUP_SIZE})"
        )));
    }
    Ok(())
}

impl Device for GpuDevice {
    fn label(&self) -> String {
        format!("{} (wgpu)", self.adapter)
    }

    fn max_group_size(&self) -> Option<u32> {
        Some(MAX_GROUP_SIZE)
    }

    fn create_buffer(&mut self, label: &str, words: usize) -> Result<BufferId> {
        log::trace!("Allocating GPU buffer {label} ({words} words)");
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label:              Some(label),
            size:               (words.max(1) * 4) as u64,
            usage:              wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let buf = GpuBuffer { label: label.to_owned(), words, buffer };
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
        let buf = self.buffer(buffer, data.len())?;
        if !data.is_empty() {
            self.queue.write_buffer(&buf.buffer, 0, bytemuck::cast_slice(data));
        }
        Ok(())
    }

    fn download(&mut self, buffer: BufferId, words: usize) -> Result<Vec<u32>> {
        let buf = self.buffer(buffer, words)?;
        if words == 0 {
            return Ok(Vec::new());
        }
        let size = (words * 4) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label:              Some("staging"),
            size,
            usage:              wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut enc = self.device.create_command_encoder(&Default::default());
        enc.copy_buffer_to_buffer(&buf.buffer, 0, &staging, 0, size);
        self.queue.submit([enc.finish()]);

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| Error::Device(format!("poll failed: {e}")))?;
        rx.recv()
            .map_err(|e| Error::Device(format!("map callback dropped: {e}")))?
            .map_err(|e| Error::Device(format!("failed to map {}: {e}", buf.label)))?;

        let data = slice.get_mapped_range();
        let result: Vec<u32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging.unmap();
        Ok(result)
    }

    fn release(&mut self, buffer: BufferId) {
        if let Some(buf) = self.buffers.get_mut(buffer.0).and_then(Option::take) {
            log::trace!("Released GPU buffer {}", buf.label);
            buf.buffer.destroy();
        }
    }

    fn dispatch(&mut self, kernel: &Kernel, groups: u32) -> Result<()> {
        log::trace!("gpu dispatch {} x{}", kernel.name(), groups);
        let name = kernel.name();
        match *kernel {
            Kernel::Distance { positions, out, target, metric, len } => {
                let n = len as usize;
                let params = DistanceParams {
                    query:  [target.x, target.y, target.z],
                    len,
                    metric: metric.code(),
                    pad:    [0; 3],
                };
                let bindings = [(1, positions, 3 * n), (2, out.keys, n), (3, out.values, n)];
                self.run(name, 0, bytemuck::bytes_of(&params), &bindings, groups)
            }
            Kernel::LocalSort { data, len, group_size, order } => {
                check_group_size(group_size)?;
                let n = len as usize;
                let params = Params::new(len, 0, order);
                let bindings = [(1, data.keys, n), (2, data.values, n)];
                self.run(name, group_size, bytemuck::bytes_of(&params), &bindings, groups)
            }
            Kernel::Merge { data, len, group_size, odd, order } => {
                check_group_size(group_size)?;
                let n = len as usize;
                let params = Params::new(len, odd as u32, order);
                let bindings = [(1, data.keys, n), (2, data.values, n)];
                self.run(name, group_size, bytemuck::bytes_of(&params), &bindings, groups)
            }
            Kernel::RadixHistogram { src, histogram, len, shift, order } => {
                let n = len as usize;
                let params = Params::new(len, shift, order);
                let bindings = [(1, src.keys, n), (2, histogram, groups as usize * RADIX_BUCKETS)];
                self.run(name, 0, bytemuck::bytes_of(&params), &bindings, groups)
            }
            Kernel::RadixScan { histogram, totals, tiles } => {
                let params = Params::new(tiles, 0, KeyOrder::new(KeyKind::Uint, true));
                let bindings = [(1, histogram, tiles as usize * RADIX_BUCKETS), (2, totals, RADIX_BUCKETS)];
                self.run(name, 0, bytemuck::bytes_of(&params), &bindings, groups.min(1))
            }
            Kernel::RadixScatter { src, dst, histogram, len, shift, order } => {
                let n = len as usize;
                let params = Params::new(len, shift, order);
                let bindings = [
                    (1, src.keys, n),
                    (2, src.values, n),
                    (3, dst.keys, n),
                    (4, dst.values, n),
                    (5, histogram, groups as usize * RADIX_BUCKETS),
                ];
                self.run(name, 0, bytemuck::bytes_of(&params), &bindings, groups)
            }
        }
    }
}
