//! wgpu compute backend for the per-tick diffusion passes.
//!
//! Each of the three fields (food pheromone, danger pheromone, molecules)
//! owns a pair of device storage buffers; a ping bit selects the current
//! one and flips after every dispatch. Submissions are waited on before any
//! read, so results are deterministic with respect to the host loop. A
//! parity self-test against the CPU reference pass runs at construction;
//! numeric divergence beyond the documented tolerance rejects the backend.

use std::sync::mpsc;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, info};
use wgpu::util::DeviceExt;

use mycoswarm_core::{
    BackendError, DiffusionBackend, FieldParams, GridField, SimRng, diffuse_and_evaporate,
};

/// Self-test grid edge length.
const SELF_TEST_DIM: u32 = 16;
/// Self-test pass count.
const SELF_TEST_PASSES: usize = 5;
/// Maximum per-cell divergence from the CPU reference.
const SELF_TEST_TOLERANCE: f32 = 1e-3;

const WORKGROUP_DIM: u32 = 8;

/// Kernel source. Semantics match the CPU reference exactly: center keeps
/// `1 - d`, each in-bound orthogonal neighbour contributes `d / 4`, border
/// cells do not diffuse, evaporation and the zero floor apply last.
const DIFFUSE_WGSL: &str = r#"
struct Params {
  width: u32,
  height: u32,
  diffusion: f32,
  evaporation: f32,
};

@group(0) @binding(0) var<storage, read> src: array<f32>;
@group(0) @binding(1) var<storage, read_write> dst: array<f32>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
  let x = gid.x;
  let y = gid.y;
  if (x >= params.width || y >= params.height) {
    return;
  }
  let idx = y * params.width + x;
  let center = src[idx];
  var sum = center * (1.0 - params.diffusion);
  var count = 0u;
  if (x > 0u) {
    sum = sum + src[idx - 1u] * params.diffusion * 0.25;
    count = count + 1u;
  }
  if (x + 1u < params.width) {
    sum = sum + src[idx + 1u] * params.diffusion * 0.25;
    count = count + 1u;
  }
  if (y > 0u) {
    sum = sum + src[idx - params.width] * params.diffusion * 0.25;
    count = count + 1u;
  }
  if (y + 1u < params.height) {
    sum = sum + src[idx + params.width] * params.diffusion * 0.25;
    count = count + 1u;
  }
  var value = sum;
  if (count < 4u) {
    value = center;
  }
  value = value * (1.0 - params.evaporation);
  dst[idx] = max(value, 0.0);
}
"#;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct KernelParams {
    width: u32,
    height: u32,
    diffusion: f32,
    evaporation: f32,
}

/// One adapter visible to the runtime.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub index: usize,
    pub name: String,
    pub backend: String,
}

/// Enumerate adapters the way a host would list devices.
#[must_use]
pub fn list_adapters() -> Vec<AdapterInfo> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    instance
        .enumerate_adapters(wgpu::Backends::all())
        .into_iter()
        .enumerate()
        .map(|(index, adapter)| {
            let info = adapter.get_info();
            AdapterInfo {
                index,
                name: info.name,
                backend: format!("{:?}", info.backend),
            }
        })
        .collect()
}

struct PingPong {
    a: wgpu::Buffer,
    b: wgpu::Buffer,
    bind_a_to_b: wgpu::BindGroup,
    bind_b_to_a: wgpu::BindGroup,
    a_current: bool,
}

impl PingPong {
    fn current(&self) -> &wgpu::Buffer {
        if self.a_current { &self.a } else { &self.b }
    }

    fn dispatch_bind(&self) -> &wgpu::BindGroup {
        if self.a_current {
            &self.bind_a_to_b
        } else {
            &self.bind_b_to_a
        }
    }

    fn flip(&mut self) {
        self.a_current = !self.a_current;
    }
}

struct FieldSet {
    width: u32,
    height: u32,
    food: PingPong,
    danger: PingPong,
    molecules: PingPong,
    staging: wgpu::Buffer,
}

/// Compute backend with per-field double buffers.
pub struct WgpuDiffusion {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    bind_layout: wgpu::BindGroupLayout,
    uniform_pheromone: wgpu::Buffer,
    uniform_molecule: wgpu::Buffer,
    fields: Option<FieldSet>,
    adapter_name: String,
}

impl WgpuDiffusion {
    /// Acquire the adapter at `adapter_index`, build the kernel and run the
    /// CPU/GPU parity self-test. Any failure leaves the caller on the CPU
    /// path.
    pub fn new(adapter_index: usize) -> Result<Self, BackendError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let mut adapters = instance.enumerate_adapters(wgpu::Backends::all());
        if adapter_index >= adapters.len() {
            return Err(BackendError(format!(
                "adapter index {adapter_index} out of range ({} available)",
                adapters.len()
            )));
        }
        let adapter = adapters.swap_remove(adapter_index);
        let adapter_name = adapter.get_info().name;
        debug!(adapter = %adapter_name, "acquiring compute device");

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("mycoswarm.diffusion"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
            },
            None,
        ))
        .map_err(|err| BackendError(format!("device request failed: {err}")))?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("diffuse.wgsl"),
            source: wgpu::ShaderSource::Wgsl(DIFFUSE_WGSL.into()),
        });

        let bind_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("diffuse.bind_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: wgpu::BufferSize::new(
                            std::mem::size_of::<KernelParams>() as u64,
                        ),
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("diffuse.pipeline_layout"),
            bind_group_layouts: &[&bind_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("diffuse.pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "main",
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });

        let zero = KernelParams {
            width: 0,
            height: 0,
            diffusion: 0.0,
            evaporation: 0.0,
        };
        let uniform_pheromone = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("diffuse.params.pheromone"),
            contents: bytemuck::bytes_of(&zero),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let uniform_molecule = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("diffuse.params.molecule"),
            contents: bytemuck::bytes_of(&zero),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let mut runtime = Self {
            device,
            queue,
            pipeline,
            bind_layout,
            uniform_pheromone,
            uniform_molecule,
            fields: None,
            adapter_name,
        };
        runtime.self_test()?;
        info!(adapter = %runtime.adapter_name, "GPU diffusion self-test passed");
        Ok(runtime)
    }

    /// Adapter the runtime is bound to.
    #[must_use]
    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// Five CPU and GPU passes over the same random field; max-abs error
    /// beyond tolerance rejects the device.
    fn self_test(&mut self) -> Result<(), BackendError> {
        let mut rng = SimRng::new(0xD1FF_05E5);
        let mut reference = GridField::new(SELF_TEST_DIM, SELF_TEST_DIM, 0.0)
            .map_err(|err| BackendError(err.to_string()))?;
        for cell in reference.cells_mut() {
            *cell = rng.uniform(0.0, 1.0);
        }

        let params = FieldParams::new(0.2, 0.05);
        let mut gpu_food = reference.clone();
        let mut gpu_danger = reference.clone();
        let mut gpu_molecules = reference.clone();
        self.init_fields(&gpu_food, &gpu_danger, &gpu_molecules)?;
        for _ in 0..SELF_TEST_PASSES {
            self.step_diffuse(
                params,
                params,
                true,
                &mut gpu_food,
                &mut gpu_danger,
                &mut gpu_molecules,
            )?;
            diffuse_and_evaporate(&mut reference, params);
        }
        self.fields = None;

        let mut max_err = 0.0f32;
        for (gpu, cpu) in gpu_food.cells().iter().zip(reference.cells().iter()) {
            max_err = max_err.max((gpu - cpu).abs());
        }
        if max_err > SELF_TEST_TOLERANCE {
            return Err(BackendError(format!(
                "self-test divergence {max_err} exceeds {SELF_TEST_TOLERANCE}"
            )));
        }
        debug!(max_err, "parity self-test within tolerance");
        Ok(())
    }

    fn make_ping_pong(&self, field: &GridField, uniform: &wgpu::Buffer, label: &str) -> PingPong {
        let bytes: &[u8] = bytemuck::cast_slice(field.cells());
        let usage =
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC;
        let a = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&format!("{label}.a")),
            contents: bytes,
            usage,
        });
        let b = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{label}.b")),
            size: bytes.len() as u64,
            usage,
            mapped_at_creation: false,
        });

        let bind = |src: &wgpu::Buffer, dst: &wgpu::Buffer, suffix: &str| {
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&format!("{label}.{suffix}")),
                layout: &self.bind_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: src.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: dst.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: uniform.as_entire_binding(),
                    },
                ],
            })
        };
        let bind_a_to_b = bind(&a, &b, "a_to_b");
        let bind_b_to_a = bind(&b, &a, "b_to_a");
        PingPong {
            a,
            b,
            bind_a_to_b,
            bind_b_to_a,
            a_current: true,
        }
    }

    fn read_buffer(&self, buffer: &wgpu::Buffer, staging: &wgpu::Buffer, out: &mut GridField)
    -> Result<(), BackendError> {
        let bytes = (out.len() * std::mem::size_of::<f32>()) as u64;
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("diffuse.readback"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, staging, 0, bytes);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..bytes);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(BackendError(format!("buffer map failed: {err}"))),
            Err(_) => return Err(BackendError("buffer map callback dropped".into())),
        }
        {
            let view = slice.get_mapped_range();
            out.cells_mut().copy_from_slice(bytemuck::cast_slice(&view));
        }
        staging.unmap();
        Ok(())
    }

    fn write_uniforms(&self, pheromone: FieldParams, molecule: FieldParams, width: u32, height: u32) {
        let pher = KernelParams {
            width,
            height,
            diffusion: pheromone.diffusion,
            evaporation: pheromone.evaporation,
        };
        let mol = KernelParams {
            width,
            height,
            diffusion: molecule.diffusion,
            evaporation: molecule.evaporation,
        };
        self.queue
            .write_buffer(&self.uniform_pheromone, 0, bytemuck::bytes_of(&pher));
        self.queue
            .write_buffer(&self.uniform_molecule, 0, bytemuck::bytes_of(&mol));
    }

    fn check_shape(&self, field: &GridField) -> Result<(), BackendError> {
        let Some(fields) = self.fields.as_ref() else {
            return Err(BackendError("device buffers not initialised".into()));
        };
        if field.width() != fields.width || field.height() != fields.height {
            return Err(BackendError("host field size mismatch".into()));
        }
        Ok(())
    }
}

impl DiffusionBackend for WgpuDiffusion {
    fn kind(&self) -> &'static str {
        "wgpu"
    }

    fn init_fields(
        &mut self,
        food: &GridField,
        danger: &GridField,
        molecules: &GridField,
    ) -> Result<(), BackendError> {
        if food.width() != danger.width()
            || food.height() != danger.height()
            || food.width() != molecules.width()
            || food.height() != molecules.height()
        {
            return Err(BackendError("field sizes must match".into()));
        }

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("diffuse.staging"),
            size: (food.len() * std::mem::size_of::<f32>()) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        self.fields = Some(FieldSet {
            width: food.width(),
            height: food.height(),
            food: self.make_ping_pong(food, &self.uniform_pheromone, "diffuse.food"),
            danger: self.make_ping_pong(danger, &self.uniform_pheromone, "diffuse.danger"),
            molecules: self.make_ping_pong(molecules, &self.uniform_molecule, "diffuse.molecules"),
            staging,
        });
        Ok(())
    }

    fn upload_fields(
        &mut self,
        food: &GridField,
        danger: &GridField,
        molecules: &GridField,
    ) -> Result<(), BackendError> {
        self.check_shape(food)?;
        self.check_shape(danger)?;
        self.check_shape(molecules)?;
        let fields = self.fields.as_ref().expect("checked above");
        self.queue
            .write_buffer(fields.food.current(), 0, bytemuck::cast_slice(food.cells()));
        self.queue.write_buffer(
            fields.danger.current(),
            0,
            bytemuck::cast_slice(danger.cells()),
        );
        self.queue.write_buffer(
            fields.molecules.current(),
            0,
            bytemuck::cast_slice(molecules.cells()),
        );
        Ok(())
    }

    fn step_diffuse(
        &mut self,
        pheromone: FieldParams,
        molecule: FieldParams,
        copyback: bool,
        food: &mut GridField,
        danger: &mut GridField,
        molecules: &mut GridField,
    ) -> Result<(), BackendError> {
        self.check_shape(food)?;
        let (width, height) = {
            let fields = self.fields.as_ref().expect("checked above");
            (fields.width, fields.height)
        };
        self.write_uniforms(pheromone, molecule, width, height);

        let groups_x = width.div_ceil(WORKGROUP_DIM);
        let groups_y = height.div_ceil(WORKGROUP_DIM);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("diffuse.step"),
            });
        {
            let fields = self.fields.as_ref().expect("checked above");
            for pp in [&fields.food, &fields.danger, &fields.molecules] {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("diffuse.pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.pipeline);
                pass.set_bind_group(0, pp.dispatch_bind(), &[]);
                pass.dispatch_workgroups(groups_x, groups_y, 1);
            }
        }
        self.queue.submit(Some(encoder.finish()));
        let _ = self.device.poll(wgpu::Maintain::Wait);

        {
            let fields = self.fields.as_mut().expect("checked above");
            fields.food.flip();
            fields.danger.flip();
            fields.molecules.flip();
        }

        if copyback {
            self.copyback(food, danger, molecules)?;
        }
        Ok(())
    }

    fn copyback(
        &mut self,
        food: &mut GridField,
        danger: &mut GridField,
        molecules: &mut GridField,
    ) -> Result<(), BackendError> {
        self.check_shape(food)?;
        self.check_shape(danger)?;
        self.check_shape(molecules)?;
        // Sequential finish-on-read copies through one staging buffer.
        let fields = std::mem::take(&mut self.fields).expect("checked above");
        let result = (|| {
            self.read_buffer(fields.food.current(), &fields.staging, food)?;
            self.read_buffer(fields.danger.current(), &fields.staging, danger)?;
            self.read_buffer(fields.molecules.current(), &fields.staging, molecules)
        })();
        self.fields = Some(fields);
        result
    }

    fn is_available(&self) -> bool {
        self.fields.is_some()
    }
}
