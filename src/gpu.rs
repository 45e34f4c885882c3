//! wgpu backend. Half precision values are stored two per 32-bit word so
//! that no optional shader feature is needed.
use crate::backend::{
    Backend, DeviceMatrix, EventTimer, GemmProblem, HostTimer, MatrixRole, MatrixShape,
};
use crate::error::{BenchError, Result};
use futures::{channel::oneshot, executor::block_on};
use half::f16;
use log::{debug, info, warn};
use std::{
    borrow::Cow::Borrowed,
    sync::{Arc, Mutex},
};
use wgpu::util::{BufferInitDescriptor, DeviceExt};
use wgpu::{
    AdapterInfo, Backends, BindGroup, BindGroupDescriptor, BindGroupEntry, Buffer,
    BufferDescriptor, BufferUsages, CommandEncoder, CommandEncoderDescriptor,
    ComputePassDescriptor, ComputePassTimestampWrites, ComputePipeline,
    ComputePipelineDescriptor, Device, DeviceDescriptor, Error, ErrorFilter, Features, Instance,
    InstanceDescriptor, Maintain, MapMode, PowerPreference, QuerySet, QuerySetDescriptor,
    QueryType, Queue, RequestAdapterOptions, ShaderModuleDescriptor, ShaderSource, QUERY_SIZE,
};
use zerocopy::{AsBytes, FromBytes};

const WORKGROUP_SIZE: u64 = 256;
const WORD_BYTES: u64 = 4;

lazy_static! {
    static ref CONTEXT: Result<GpuContext> = block_on(GpuContext::acquire());
}

/// The process-wide device and queue, with the compiled kernels.
pub struct GpuContext {
    info: AdapterInfo,
    device: Device,
    queue: Queue,
    timestamps: bool,
    gemm_pipeline: ComputePipeline,
    fill_pipeline: ComputePipeline,
    // first error raised by wgpu outside an error scope
    device_error: Arc<Mutex<Option<String>>>,
}

impl GpuContext {
    /// The shared context, acquired on first use.
    pub fn shared() -> Result<&'static GpuContext> {
        CONTEXT.as_ref().map_err(Clone::clone)
    }

    async fn acquire() -> Result<Self> {
        let instance = Instance::new(InstanceDescriptor {
            backends: Backends::PRIMARY,
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or(BenchError::NoAdapter)?;
        let info = adapter.get_info();
        info!("selected adapter {} ({:?})", info.name, info.backend);

        let timestamps = adapter.features().contains(Features::TIMESTAMP_QUERY);
        let required_features = if timestamps {
            Features::TIMESTAMP_QUERY
        } else {
            Features::empty()
        };
        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: Some("gemm-bench"),
                    required_features,
                    required_limits: adapter.limits(),
                },
                None,
            )
            .await
            .map_err(|e| BenchError::DeviceRequest(e.to_string()))?;

        let device_error = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&device_error);
        device.on_uncaptured_error(Box::new(move |err: Error| {
            let mut slot = match slot.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.get_or_insert_with(|| err.to_string());
        }));

        device.push_error_scope(ErrorFilter::Validation);
        let gemm_pipeline = get_pipeline(&device, "gemm", include_str!("../shaders/gemm.wgsl"));
        let fill_pipeline = get_pipeline(&device, "fill", include_str!("../shaders/fill.wgsl"));
        if let Some(err) = device.pop_error_scope().await {
            return Err(BenchError::Backend(format!("shader compilation failed: {}", err)));
        }

        Ok(GpuContext {
            info,
            device,
            queue,
            timestamps,
            gemm_pipeline,
            fill_pipeline,
            device_error,
        })
    }

    fn take_error(&self) -> Result<()> {
        let mut slot = match self.device_error.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        match slot.take() {
            Some(message) => Err(BenchError::Backend(message)),
            None => Ok(()),
        }
    }

    fn wait(&self) {
        let _ = self.device.poll(Maintain::Wait);
    }

    /// Copies `size` bytes of `source` into a mappable buffer, submits
    /// `encoder` and waits for the mapping.
    async fn read_buffer(
        &self,
        mut encoder: CommandEncoder,
        source: &Buffer,
        size: u64,
    ) -> Result<Vec<u8>> {
        let gpu_read_buffer = self.device.create_buffer(&BufferDescriptor {
            label: Some("GPU read buffer"),
            size,
            usage: BufferUsages::COPY_DST | BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        encoder.copy_buffer_to_buffer(source, 0, &gpu_read_buffer, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let buffer_slice = gpu_read_buffer.slice(..);
        let (sender, receiver) = oneshot::channel();
        buffer_slice.map_async(MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.wait();

        match receiver.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(BenchError::BufferMap(err.to_string())),
            Err(_) => return Err(BenchError::BufferMap("mapping callback dropped".into())),
        }
        let data = buffer_slice.get_mapped_range();
        let bytes = data.to_vec();
        // mapped views must be gone before unmapping
        drop(data);
        gpu_read_buffer.unmap();
        Ok(bytes)
    }

    fn encoder(&self, label: &str) -> CommandEncoder {
        self.device
            .create_command_encoder(&CommandEncoderDescriptor { label: Some(label) })
    }
}

fn get_pipeline(device: &Device, name: &str, source: &'static str) -> ComputePipeline {
    let module = device.create_shader_module(ShaderModuleDescriptor {
        label: Some(name),
        source: ShaderSource::Wgsl(Borrowed(source)),
    });
    device.create_compute_pipeline(&ComputePipelineDescriptor {
        label: Some(name),
        layout: None,
        module: &module,
        entry_point: "main",
    })
}

/// Workgroup counts covering `invocations`, folded into a second dimension
/// when one dimension would exceed `max_per_dimension`.
pub fn workgroup_grid(invocations: u64, max_per_dimension: u32) -> (u32, u32) {
    let groups = ((invocations + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE).max(1);
    let x = groups.min(u64::from(max_per_dimension.max(1)));
    let y = (groups + x - 1) / x;
    (x as u32, y as u32)
}

fn to_u32(what: &str, value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        BenchError::Backend(format!(
            "{} = {} exceeds the kernel's 32-bit indexing",
            what, value
        ))
    })
}

fn matrix_label(role: MatrixRole) -> &'static str {
    match role {
        MatrixRole::A => "matrix A",
        MatrixRole::B => "matrix B",
        MatrixRole::C => "matrix C",
    }
}

pub struct GpuMatrix {
    shape: MatrixShape,
    words: u64,
    buffer: Buffer,
}

impl DeviceMatrix for GpuMatrix {
    fn shape(&self) -> MatrixShape {
        self.shape
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes)]
struct FillParams {
    count: u32,
    words: u32,
    seed_lo: u32,
    seed_hi: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes)]
struct GemmParams {
    m: u32,
    n: u32,
    k: u32,
    total: u32,
    pair_count: u32,
    a_row_stride: u32,
    a_col_stride: u32,
    b_row_stride: u32,
    b_col_stride: u32,
    alpha: f32,
    beta: f32,
    _pad: u32,
}

/// The compute session bound to one runner's buffers.
pub struct GemmHandle {
    // kept alive for the bind group
    _params: Buffer,
    bind_group: BindGroup,
    grid: (u32, u32),
}

#[derive(Clone, Copy)]
pub struct GpuBackend {
    ctx: &'static GpuContext,
}

impl GpuBackend {
    pub fn new() -> Result<Self> {
        Ok(GpuBackend {
            ctx: GpuContext::shared()?,
        })
    }

    fn grid(&self, invocations: u64) -> (u32, u32) {
        let limit = self.ctx.device.limits().max_compute_workgroups_per_dimension;
        workgroup_grid(invocations, limit)
    }

    fn dispatch(
        &self,
        label: &str,
        pipeline: &ComputePipeline,
        bind_group: &BindGroup,
        grid: (u32, u32),
    ) {
        let mut encoder = self.ctx.encoder(label);
        {
            let mut cpass = encoder.begin_compute_pass(&ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            cpass.set_pipeline(pipeline);
            cpass.set_bind_group(0, bind_group, &[]);
            cpass.dispatch_workgroups(grid.0, grid.1, 1);
        }
        self.ctx.queue.submit(Some(encoder.finish()));
    }
}

impl Backend for GpuBackend {
    type Matrix = GpuMatrix;
    type Handle = GemmHandle;
    type Timer = GpuTimer;

    fn name(&self) -> String {
        format!("{} ({:?})", self.ctx.info.name, self.ctx.info.backend)
    }

    fn allocate(&self, shape: MatrixShape) -> Result<GpuMatrix> {
        let words = (shape.elements() as u64 + 1) / 2;
        let size = words * WORD_BYTES;
        let limits = self.ctx.device.limits();
        let max = limits
            .max_buffer_size
            .min(u64::from(limits.max_storage_buffer_binding_size));
        if size > max {
            return Err(BenchError::Allocation {
                role: shape.role,
                bytes: size,
                reason: format!("exceeds the device limit of {} bytes", max),
            });
        }

        let device = &self.ctx.device;
        device.push_error_scope(ErrorFilter::OutOfMemory);
        device.push_error_scope(ErrorFilter::Validation);
        let buffer = device.create_buffer(&BufferDescriptor {
            label: Some(matrix_label(shape.role)),
            size,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let invalid = block_on(device.pop_error_scope());
        let out_of_memory = block_on(device.pop_error_scope());
        if let Some(err) = out_of_memory.or(invalid) {
            return Err(BenchError::Allocation {
                role: shape.role,
                bytes: size,
                reason: err.to_string(),
            });
        }
        debug!("allocated {} ({} bytes)", matrix_label(shape.role), size);
        Ok(GpuMatrix {
            shape,
            words,
            buffer,
        })
    }

    fn fill_uniform(&self, matrix: &mut GpuMatrix, seed: u64) -> Result<()> {
        let params = FillParams {
            count: to_u32("element count", matrix.shape.elements())?,
            words: to_u32("word count", matrix.words as usize)?,
            seed_lo: seed as u32,
            seed_hi: (seed >> 32) as u32,
        };
        let uniform = self.ctx.device.create_buffer_init(&BufferInitDescriptor {
            label: Some("fill params"),
            contents: params.as_bytes(),
            usage: BufferUsages::UNIFORM,
        });
        let bind_group = self.ctx.device.create_bind_group(&BindGroupDescriptor {
            label: Some("fill bindings"),
            layout: &self.ctx.fill_pipeline.get_bind_group_layout(0),
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: matrix.buffer.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: uniform.as_entire_binding(),
                },
            ],
        });
        let grid = self.grid(matrix.words);
        self.dispatch("random fill", &self.ctx.fill_pipeline, &bind_group, grid);
        self.ctx.take_error()
    }

    fn read_back(&self, matrix: &GpuMatrix) -> Result<Vec<f16>> {
        let encoder = self.ctx.encoder("read back");
        let size = matrix.words * WORD_BYTES;
        let bytes = block_on(self.ctx.read_buffer(encoder, &matrix.buffer, size))?;
        let mut values: Vec<f16> = bytes
            .chunks_exact(WORD_BYTES as usize)
            .filter_map(u32::read_from)
            .flat_map(|word| [f16::from_bits(word as u16), f16::from_bits((word >> 16) as u16)])
            .collect();
        values.truncate(matrix.shape.elements());
        self.ctx.take_error()?;
        Ok(values)
    }

    fn create_handle(
        &self,
        problem: &GemmProblem,
        a: &GpuMatrix,
        b: &GpuMatrix,
        c: &GpuMatrix,
    ) -> Result<GemmHandle> {
        for (matrix, role) in [(a, MatrixRole::A), (b, MatrixRole::B), (c, MatrixRole::C)] {
            if matrix.len() != problem.shape(role).elements() {
                return Err(BenchError::Backend(format!(
                    "matrix {} holds {} elements, problem needs {}",
                    role,
                    matrix.len(),
                    problem.shape(role).elements()
                )));
            }
        }
        if problem.ldc != problem.m {
            return Err(BenchError::Backend(format!(
                "kernel writes C densely, ldc {} must equal m {}",
                problem.ldc, problem.m
            )));
        }
        let (a_row_stride, a_col_stride) = problem.strides(MatrixRole::A);
        let (b_row_stride, b_col_stride) = problem.strides(MatrixRole::B);
        let params = GemmParams {
            m: to_u32("m", problem.m)?,
            n: to_u32("n", problem.n)?,
            k: to_u32("k", problem.k)?,
            total: to_u32("m*n", c.len())?,
            pair_count: to_u32("word count", c.words as usize)?,
            a_row_stride: to_u32("lda", a_row_stride)?,
            a_col_stride: to_u32("lda", a_col_stride)?,
            b_row_stride: to_u32("ldb", b_row_stride)?,
            b_col_stride: to_u32("ldb", b_col_stride)?,
            alpha: problem.alpha,
            beta: problem.beta,
            _pad: 0,
        };
        let params_buffer = self.ctx.device.create_buffer_init(&BufferInitDescriptor {
            label: Some("MNK"),
            contents: params.as_bytes(),
            usage: BufferUsages::UNIFORM,
        });
        let bind_group = self.ctx.device.create_bind_group(&BindGroupDescriptor {
            label: Some("Binding Group"),
            layout: &self.ctx.gemm_pipeline.get_bind_group_layout(0),
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: a.buffer.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: b.buffer.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 2,
                    resource: c.buffer.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 3,
                    resource: params_buffer.as_entire_binding(),
                },
            ],
        });
        self.ctx.take_error()?;
        Ok(GemmHandle {
            _params: params_buffer,
            bind_group,
            grid: self.grid(c.words),
        })
    }

    fn gemm(
        &self,
        handle: &mut GemmHandle,
        _a: &GpuMatrix,
        _b: &GpuMatrix,
        _c: &mut GpuMatrix,
    ) -> Result<()> {
        self.dispatch("gemm", &self.ctx.gemm_pipeline, &handle.bind_group, handle.grid);
        self.ctx.take_error()
    }

    fn synchronize(&self) -> Result<()> {
        self.ctx.wait();
        self.ctx.take_error()
    }

    fn create_timer(&self) -> Result<GpuTimer> {
        let kind = if self.ctx.timestamps {
            let query_set = self.ctx.device.create_query_set(&QuerySetDescriptor {
                label: Some("gemm markers"),
                ty: QueryType::Timestamp,
                count: 2,
            });
            let resolve = self.ctx.device.create_buffer(&BufferDescriptor {
                label: Some("marker resolve"),
                size: 2 * QUERY_SIZE as u64,
                usage: BufferUsages::QUERY_RESOLVE | BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            });
            TimerKind::Timestamps { query_set, resolve }
        } else {
            warn!("adapter has no timestamp queries, timing with the host clock");
            TimerKind::Host(HostTimer::new())
        };
        Ok(GpuTimer { ctx: self.ctx, kind })
    }
}

enum TimerKind {
    Timestamps { query_set: QuerySet, resolve: Buffer },
    Host(HostTimer),
}

/// Timestamp markers written by empty compute passes on the GEMM queue,
/// or host clock readings around a blocking poll.
pub struct GpuTimer {
    ctx: &'static GpuContext,
    kind: TimerKind,
}

fn write_marker(
    ctx: &GpuContext,
    query_set: &QuerySet,
    index: u32,
    resolve: Option<&Buffer>,
) -> Result<()> {
    let mut encoder = ctx.encoder("timestamp marker");
    {
        let _marker = encoder.begin_compute_pass(&ComputePassDescriptor {
            label: Some("timestamp marker"),
            timestamp_writes: Some(ComputePassTimestampWrites {
                query_set,
                beginning_of_pass_write_index: Some(index),
                end_of_pass_write_index: None,
            }),
        });
    }
    if let Some(resolve) = resolve {
        encoder.resolve_query_set(query_set, 0..2, resolve, 0);
    }
    ctx.queue.submit(Some(encoder.finish()));
    ctx.take_error()
}

/// Converts a resolved marker pair into milliseconds. A zero start means
/// the query was never written; an empty interval is unusable as well.
fn ticks_to_ms(start: Option<u64>, stop: Option<u64>, period_ns: f32) -> Result<f32> {
    match (start, stop) {
        (Some(start), Some(stop)) if start != 0 && stop > start => {
            Ok(((stop - start) as f64 * f64::from(period_ns) / 1e6) as f32)
        }
        (start, stop) => Err(BenchError::Timer(format!(
            "unusable timestamps: start {:?}, stop {:?}",
            start, stop
        ))),
    }
}

impl EventTimer for GpuTimer {
    fn record_start(&mut self) -> Result<()> {
        let ctx = self.ctx;
        match &mut self.kind {
            TimerKind::Timestamps { query_set, .. } => write_marker(ctx, query_set, 0, None),
            TimerKind::Host(timer) => {
                ctx.wait();
                timer.record_start()
            }
        }
    }

    fn record_stop(&mut self) -> Result<()> {
        let ctx = self.ctx;
        match &mut self.kind {
            TimerKind::Timestamps { query_set, resolve } => {
                write_marker(ctx, query_set, 1, Some(&*resolve))
            }
            TimerKind::Host(timer) => {
                ctx.wait();
                timer.record_stop()
            }
        }
    }

    fn elapsed_ms(&mut self) -> Result<f32> {
        let ctx = self.ctx;
        match &mut self.kind {
            TimerKind::Timestamps { resolve, .. } => {
                let encoder = ctx.encoder("marker read back");
                let bytes = block_on(ctx.read_buffer(encoder, resolve, 2 * QUERY_SIZE as u64))?;
                let start = bytes.get(0..8).and_then(u64::read_from);
                let stop = bytes.get(8..16).and_then(u64::read_from);
                ticks_to_ms(start, stop, ctx.queue.get_timestamp_period())
            }
            TimerKind::Host(timer) => timer.elapsed_ms(),
        }
    }
}
