//! GPU compute functor via wgpu.
//!
//! Runs the field-line kernel as a WGSL compute shader, one invocation per
//! line.
//!
//! # Precision
//!
//! WGSL has no portable f64 support, so the GPU functor is single precision
//! only (`ComputeFunctor<f32>`). Double-precision runs use the CPU functor.
//!
//! # Batching
//!
//! A partition is split into batches small enough for the output buffer to
//! fit the device's storage-binding limit and for the dispatch to fit its
//! workgroup-count limit. Buffers are allocated once, sized for the largest
//! batch, and reused. Each batch is read back into a host-side line-major
//! scratch buffer that `post_run` scatters into the shared field lines.

use std::borrow::Cow;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use bytemuck::{Pod, Zeroable};
use electromag_core::integrator::{CurvaturePolicy, DegeneracyPolicy, IntegratorConfig};
use electromag_core::perf::{bandwidth_mb_s, AggregatePerf, PerformanceRecorder};
use electromag_core::{FieldLines, Vec3};

use crate::backend::{
    batch_count, batch_local_range, report_non_finite, BindParams, ComputeError, ComputeFunctor,
    DeviceClass, DeviceDescriptor, DeviceFeatures, FunctorState, Lifecycle,
};
use crate::catalog::{Platform, PlatformProbe};

/// Invocations per workgroup; must match `@workgroup_size` in the shader.
const WORKGROUP_SIZE: u32 = 64;

const FLAG_CURVATURE: u32 = 1;
const FLAG_CURVATURE_TERMINATE: u32 = 2;
const FLAG_DEGENERATE_TERMINATE: u32 = 4;

/// Upper bound on lines per batch, so progress advances at a useful rate.
pub const MAX_BATCH_LINES: usize = 16384;

/// Uniform buffer parameters passed to the WGSL shader.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct ShaderParams {
    line_count: u32,
    steps: u32,
    charge_count: u32,
    flags: u32,
    resolution: f32,
    cos_max: f32,
    degenerate_field: f32,
    max_refinements: u32,
}

impl ShaderParams {
    fn new(config: &IntegratorConfig, line_count: usize, steps: usize, charge_count: usize) -> Self {
        let mut flags = 0;
        let mut max_refinements = 0;
        if config.curvature.enabled {
            flags |= FLAG_CURVATURE;
            match config.curvature.policy {
                CurvaturePolicy::Terminate => flags |= FLAG_CURVATURE_TERMINATE,
                CurvaturePolicy::Refine { max_refinements: n } => max_refinements = n,
            }
        }
        if config.degeneracy == DegeneracyPolicy::Terminate {
            flags |= FLAG_DEGENERATE_TERMINATE;
        }
        Self {
            line_count: line_count as u32,
            steps: steps as u32,
            charge_count: charge_count as u32,
            flags,
            resolution: config.resolution as f32,
            cos_max: config.curvature.max_angle.cos() as f32,
            degenerate_field: config.degenerate_field as f32,
            max_refinements,
        }
    }
}

fn instance() -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    })
}

/// Nominal compute units and clock for a device type; wgpu reports neither.
fn nominal_throughput(device_type: wgpu::DeviceType) -> (u32, u32) {
    match device_type {
        wgpu::DeviceType::DiscreteGpu => (32, 1500),
        wgpu::DeviceType::IntegratedGpu | wgpu::DeviceType::VirtualGpu => (8, 1000),
        wgpu::DeviceType::Cpu => (
            std::thread::available_parallelism().map_or(1, |n| n.get() as u32),
            1000,
        ),
        wgpu::DeviceType::Other => (1, 1000),
    }
}

/// Platform probe listing wgpu adapters, grouped by graphics API.
#[derive(Debug, Clone, Copy, Default)]
pub struct WgpuProbe;

impl PlatformProbe for WgpuProbe {
    fn query(&self) -> Result<Vec<Platform>, ComputeError> {
        let adapters = instance().enumerate_adapters(wgpu::Backends::all());
        let mut platforms: Vec<Platform> = Vec::new();

        for (index, adapter) in adapters.iter().enumerate() {
            let info = adapter.get_info();
            let limits = adapter.limits();
            let platform_name = format!("{:?}", info.backend);
            let (compute_units, clock_mhz) = nominal_throughput(info.device_type);

            let descriptor = DeviceDescriptor {
                id: 0,
                name: info.name.clone(),
                vendor: format!("{:#06x}", info.vendor),
                platform: platform_name.clone(),
                class: DeviceClass::Accelerator,
                compute_units,
                clock_mhz,
                vector_width: 4,
                memory_bytes: limits.max_buffer_size,
                max_work_group_size: limits.max_compute_invocations_per_workgroup,
                features: DeviceFeatures {
                    double_precision: adapter.features().contains(wgpu::Features::SHADER_F64),
                    unified_memory: matches!(
                        info.device_type,
                        wgpu::DeviceType::IntegratedGpu | wgpu::DeviceType::Cpu
                    ),
                },
                adapter_index: Some(index),
            };

            match platforms.iter_mut().find(|p| p.name == platform_name) {
                Some(p) => p.devices.push(descriptor),
                None => platforms.push(Platform {
                    name: platform_name,
                    vendor: String::new(),
                    version: info.driver_info.clone(),
                    devices: vec![descriptor],
                }),
            }
        }
        Ok(platforms)
    }
}

struct Binding {
    charges: Vec<[f32; 4]>,
    seeds: Vec<[f32; 4]>,
    range: Range<usize>,
    steps: usize,
    config: IntegratorConfig,
    monitor: Arc<AggregatePerf>,
}

/// Device objects and buffers; dropping this frees them.
struct Resources {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    seed_buffer: wgpu::Buffer,
    output_buffer: wgpu::Buffer,
    staging_buffer: wgpu::Buffer,
    params_buffer: wgpu::Buffer,
    batch_lines: usize,
    /// Line-major results for the whole partition.
    host: Vec<[f32; 4]>,
}

/// Functor that integrates its partition on one wgpu adapter.
pub struct GpuFunctor {
    descriptor: DeviceDescriptor,
    lifecycle: Lifecycle,
    binding: Option<Binding>,
    resources: Option<Resources>,
    recorder: PerformanceRecorder,
}

impl GpuFunctor {
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            descriptor,
            lifecycle: Lifecycle::new(),
            binding: None,
            resources: None,
            recorder: PerformanceRecorder::new(),
        }
    }

    /// True if this machine exposes at least one wgpu adapter.
    pub fn is_available() -> bool {
        !instance().enumerate_adapters(wgpu::Backends::all()).is_empty()
    }

    fn batch_lines(&self) -> usize {
        self.resources.as_ref().map_or(0, |r| r.batch_lines)
    }

    fn fail_with(&mut self, e: ComputeError) -> ComputeError {
        self.lifecycle.fail();
        log::error!("{}", e);
        e
    }

    /// Request the device, compile the kernel and allocate every buffer.
    fn create_resources(&self, binding: &Binding) -> Result<Resources, ComputeError> {
        let name = &self.descriptor.name;
        let adapter_index = self.descriptor.adapter_index.ok_or_else(|| {
            ComputeError::unavailable(format!("{}: no wgpu adapter index", name))
        })?;
        let adapter = instance()
            .enumerate_adapters(wgpu::Backends::all())
            .into_iter()
            .nth(adapter_index)
            .ok_or_else(|| {
                ComputeError::unavailable(format!("{}: adapter {} disappeared", name, adapter_index))
            })?;
        let limits = adapter.limits();

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("electromag-compute"),
                required_features: wgpu::Features::empty(),
                required_limits: limits.clone(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| {
            ComputeError::resource_exhausted(format!("{}: failed to create device: {}", name, e))
        })?;

        let bytes_per_line = (binding.steps * std::mem::size_of::<[f32; 4]>()) as u64;
        let by_binding = u64::from(limits.max_storage_buffer_binding_size) / bytes_per_line;
        let by_dispatch =
            u64::from(limits.max_compute_workgroups_per_dimension) * u64::from(WORKGROUP_SIZE);
        let batch_lines = by_binding
            .min(by_dispatch)
            .min(MAX_BATCH_LINES as u64)
            .min(binding.range.len().max(1) as u64) as usize;
        if batch_lines == 0 {
            return Err(ComputeError::resource_exhausted(format!(
                "{}: one line of {} steps exceeds the storage binding limit of {} bytes",
                name, binding.steps, limits.max_storage_buffer_binding_size
            )));
        }

        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("field_lines_shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("shaders/field_lines.wgsl"))),
        });

        let storage_entry = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("field_lines_bind_group_layout"),
            entries: &[
                // binding 0: charges, binding 1: seeds, binding 2: output
                storage_entry(0, true),
                storage_entry(1, true),
                storage_entry(2, false),
                // binding 3: params uniform
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("field_lines_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("field_lines_pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader_module,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        let vec4_size = std::mem::size_of::<[f32; 4]>() as u64;
        let output_size = batch_lines as u64 * bytes_per_line;

        let charge_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("charges"),
            size: binding.charges.len() as u64 * vec4_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let seed_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("seeds"),
            size: batch_lines as u64 * vec4_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let output_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("field_lines"),
            size: output_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size: output_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("params"),
            size: std::mem::size_of::<ShaderParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("field_lines_bind_group"),
            layout: &bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: charge_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: seed_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: output_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: params_buffer.as_entire_binding(),
                },
            ],
        });

        let validation = pollster::block_on(device.pop_error_scope());
        let out_of_memory = pollster::block_on(device.pop_error_scope());
        if let Some(e) = out_of_memory {
            return Err(ComputeError::resource_exhausted(format!(
                "{}: buffer allocation refused: {}",
                name, e
            )));
        }
        if let Some(e) = validation {
            return Err(ComputeError::resource_exhausted(format!(
                "{}: kernel build failed: {}",
                name, e
            )));
        }

        queue.write_buffer(&charge_buffer, 0, bytemuck::cast_slice(&binding.charges));

        let host_len = binding.range.len() * binding.steps;
        let mut host = Vec::new();
        host.try_reserve_exact(host_len).map_err(|_| {
            ComputeError::resource_exhausted(format!(
                "{}: cannot allocate {} bytes of host scratch",
                name,
                host_len as u64 * vec4_size
            ))
        })?;
        host.resize(host_len, [0.0; 4]);

        Ok(Resources {
            device,
            queue,
            pipeline,
            bind_group,
            seed_buffer,
            output_buffer,
            staging_buffer,
            params_buffer,
            batch_lines,
            host,
        })
    }
}

/// Integrate one batch and read it back into `res.host`.
///
/// Returns the number of bytes read back and the readback duration.
fn run_batch(
    res: &mut Resources,
    binding: &Binding,
    local: Range<usize>,
) -> Result<(usize, std::time::Duration), ComputeError> {
    let n = local.len();
    let steps = binding.steps;
    let bytes = n * steps * std::mem::size_of::<[f32; 4]>();

    res.queue.write_buffer(
        &res.seed_buffer,
        0,
        bytemuck::cast_slice(&binding.seeds[local.clone()]),
    );
    let params = ShaderParams::new(&binding.config, n, steps, binding.charges.len());
    res.queue
        .write_buffer(&res.params_buffer, 0, bytemuck::bytes_of(&params));

    let mut encoder = res
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("field_lines_encoder"),
        });
    {
        let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("field_lines_pass"),
            timestamp_writes: None,
        });
        cpass.set_pipeline(&res.pipeline);
        cpass.set_bind_group(0, &res.bind_group, &[]);
        cpass.dispatch_workgroups((n as u32).div_ceil(WORKGROUP_SIZE), 1, 1);
    }
    encoder.copy_buffer_to_buffer(&res.output_buffer, 0, &res.staging_buffer, 0, bytes as u64);
    res.queue.submit(std::iter::once(encoder.finish()));

    let readback = Instant::now();
    let staging_slice = res.staging_buffer.slice(..bytes as u64);
    let (sender, receiver) = std::sync::mpsc::channel();
    staging_slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    res.device.poll(wgpu::Maintain::Wait);

    receiver
        .recv()
        .map_err(|e| ComputeError::resource_exhausted(format!("map recv failed: {}", e)))?
        .map_err(|e| ComputeError::resource_exhausted(format!("buffer map failed: {}", e)))?;

    {
        let data = staging_slice.get_mapped_range();
        let points: &[[f32; 4]] = bytemuck::cast_slice(&data);
        res.host[local.start * steps..local.end * steps].copy_from_slice(points);
    }
    res.staging_buffer.unmap();

    Ok((bytes, readback.elapsed()))
}

impl ComputeFunctor<f32> for GpuFunctor {
    fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    fn state(&self) -> FunctorState {
        self.lifecycle.state()
    }

    fn bind_data(
        &mut self,
        lines: &FieldLines<f32>,
        params: BindParams<f32>,
    ) -> Result<(), ComputeError> {
        self.lifecycle.require("bind_data", &[FunctorState::Created])?;
        params.validate(lines)?;

        let pack = |v: Vec3<f32>, w: f32| [v.x, v.y, v.z, w];
        self.binding = Some(Binding {
            charges: params
                .charges
                .iter()
                .map(|c| pack(c.position, c.magnitude))
                .collect(),
            seeds: lines
                .seeds(params.range.clone())
                .into_iter()
                .map(|s| pack(s, 0.0))
                .collect(),
            range: params.range,
            steps: lines.steps(),
            config: params.config,
            monitor: params.monitor,
        });
        self.lifecycle
            .advance("bind_data", &[FunctorState::Created], FunctorState::Bound)
    }

    fn allocate_resources(&mut self) -> Result<(), ComputeError> {
        self.lifecycle.require("allocate_resources", &[FunctorState::Bound])?;
        let Some(binding) = self.binding.as_ref() else {
            return Err(ComputeError::precondition("allocate_resources without bound data"));
        };

        let start = Instant::now();
        let lines = binding.range.len();
        let resources = match self.create_resources(binding) {
            Ok(r) => r,
            Err(e) => return Err(self.fail_with(e)),
        };
        log::info!(
            "{}: {} lines in batches of {}",
            self.descriptor.name,
            lines,
            resources.batch_lines
        );
        self.lifecycle
            .set_batches(batch_count(lines, resources.batch_lines));
        self.resources = Some(resources);
        self.recorder
            .record_phase("device allocation", start.elapsed(), None);
        self.lifecycle.advance(
            "allocate_resources",
            &[FunctorState::Bound],
            FunctorState::ResourcesAllocated,
        )
    }

    fn batch_count(&self) -> usize {
        match (self.binding.as_ref(), self.resources.as_ref()) {
            (Some(b), Some(r)) => batch_count(b.range.len(), r.batch_lines),
            _ => 0,
        }
    }

    fn batch_range(&self, index: usize) -> Range<usize> {
        match self.binding.as_ref() {
            Some(b) => {
                let local = batch_local_range(b.range.len(), self.batch_lines(), index);
                b.range.start + local.start..b.range.start + local.end
            }
            None => 0..0,
        }
    }

    fn main_functor(&mut self, index: usize, device_index: usize) -> Result<(), ComputeError> {
        self.lifecycle.require(
            "main_functor",
            &[FunctorState::ResourcesAllocated, FunctorState::Running],
        )?;
        let (Some(binding), Some(res)) = (self.binding.as_ref(), self.resources.as_mut()) else {
            return Err(ComputeError::precondition("main_functor without resources"));
        };
        let batches = batch_count(binding.range.len(), res.batch_lines);
        if index >= batches {
            return Err(ComputeError::invalid_argument(format!(
                "batch {} out of range ({} batches)",
                index, batches
            )));
        }
        self.lifecycle.advance(
            "main_functor",
            &[FunctorState::ResourcesAllocated, FunctorState::Running],
            FunctorState::Running,
        )?;

        let start = Instant::now();
        let local = batch_local_range(binding.range.len(), res.batch_lines, index);
        match run_batch(res, binding, local.clone()) {
            Ok((bytes, readback)) => {
                binding.monitor.advance(local.len());
                let kernel = start.elapsed().saturating_sub(readback);
                self.recorder.record_phase(
                    format!("kernel batch {} (device {})", index, device_index),
                    kernel,
                    None,
                );
                self.recorder.record_phase(
                    format!("readback batch {}", index),
                    readback,
                    bandwidth_mb_s(bytes, readback),
                );
                Ok(())
            }
            Err(e) => {
                self.lifecycle.fail_batch(index);
                Err(ComputeError::new(
                    e.kind,
                    format!("{} batch {}: {}", self.descriptor.name, index, e.context),
                ))
            }
        }
    }

    fn aux_functor(&mut self) -> Result<(), ComputeError> {
        self.lifecycle.require(
            "aux_functor",
            &[FunctorState::ResourcesAllocated, FunctorState::Running],
        )?;
        if let Some(res) = self.resources.as_ref() {
            let non_finite = res
                .host
                .iter()
                .filter(|p| !p[..3].iter().all(|c| c.is_finite()))
                .count();
            report_non_finite(&self.descriptor, non_finite);
        }
        Ok(())
    }

    fn post_run(&mut self, lines: &mut FieldLines<f32>) -> Result<(), ComputeError> {
        self.lifecycle.require(
            "post_run",
            &[FunctorState::ResourcesAllocated, FunctorState::Running],
        )?;
        let (Some(binding), Some(res)) = (self.binding.as_ref(), self.resources.as_ref()) else {
            return Err(ComputeError::precondition("post_run without resources"));
        };
        if lines.steps() != binding.steps || lines.line_count() < binding.range.end {
            return Err(ComputeError::invalid_argument(format!(
                "post_run buffer is {} lines x {} steps, bound for lines {:?} x {} steps",
                lines.line_count(),
                lines.steps(),
                binding.range,
                binding.steps
            )));
        }

        let start = Instant::now();
        let steps = binding.steps;
        let mut points = Vec::with_capacity(steps);
        let mut written = 0;
        for (i, line) in res.host.chunks(steps).enumerate() {
            if self.lifecycle.batch_failed(i / res.batch_lines) {
                continue;
            }
            points.clear();
            points.extend(line.iter().map(|p| Vec3::new(p[0], p[1], p[2])));
            lines.write_line(binding.range.start + i, &points);
            written += 1;
        }
        let elapsed = start.elapsed();
        let bytes = written * steps * std::mem::size_of::<Vec3<f32>>();
        self.recorder
            .record_phase("result scatter", elapsed, bandwidth_mb_s(bytes, elapsed));

        self.lifecycle.advance(
            "post_run",
            &[FunctorState::ResourcesAllocated, FunctorState::Running],
            FunctorState::PostRun,
        )
    }

    fn release_resources(&mut self) {
        if let Some(res) = self.resources.take() {
            let start = Instant::now();
            res.output_buffer.destroy();
            res.staging_buffer.destroy();
            drop(res);
            self.recorder.record_phase("release", start.elapsed(), None);
        }
        self.lifecycle.release();
    }

    fn fail(&self) -> bool {
        self.lifecycle.is_failed()
    }

    fn fail_on_functor(&self, index: usize) -> bool {
        self.lifecycle.batch_failed(index)
    }

    fn recorder(&self) -> &PerformanceRecorder {
        &self.recorder
    }
}
