use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use bytemuck::{bytes_of, Pod, Zeroable};
use glam::{Mat3, Mat4, Quat, Vec3, Vec4};
use log::{info, warn};
use wgpu::util::DeviceExt;

use super::shader::SHADER;
use crate::asset::{AnimationClip, AssetData, MeshData};
use crate::engine::{
    FrameState, GraphicsEngine, LightRig, ResourceHandle, ResourceKind, ShadowSettings,
    SurfaceId, SurfaceSize,
};
use crate::error::ViewerError;

const DEFAULT_COLOR: Vec4 = Vec4::new(0.8, 0.8, 0.8, 1.0);

/// Graphics engine backed by wgpu.
///
/// [`WgpuEngine::probe`] acquires an adapter and device before any surface
/// exists; if only a software adapter is available the engine reports no
/// hardware acceleration and never touches its surface target.
pub struct WgpuEngine {
    instance: wgpu::Instance,
    gpu: Option<Gpu>,
    target: Option<wgpu::SurfaceTarget<'static>>,
    surfaces: HashMap<SurfaceId, SurfaceState>,
    next_id: u64,
    next_asset: u64,
    meshes: HashMap<u64, GpuMesh>,
    materials: HashMap<u64, Vec4>,
    lights: HashMap<u64, LightSlot>,
    mixers: HashMap<u64, Mixer>,
    shadows: Option<ShadowSettings>,
}

impl WgpuEngine {
    /// Probes the GPU. `target` is the window or canvas the single render
    /// surface will be created on.
    pub async fn probe(target: impl Into<wgpu::SurfaceTarget<'static>>) -> Self {
        let backends = if cfg!(target_arch = "wasm32") {
            wgpu::Backends::GL
        } else {
            wgpu::Backends::PRIMARY
        };
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends,
            flags: wgpu::InstanceFlags::default(),
            memory_budget_thresholds: Default::default(),
            backend_options: Default::default(),
        });
        let gpu = match Gpu::request(&instance).await {
            Ok(gpu) => Some(gpu),
            Err(err) => {
                warn!("hardware-accelerated rendering unavailable: {err:#}");
                None
            }
        };
        Self {
            instance,
            gpu,
            target: Some(target.into()),
            surfaces: HashMap::new(),
            next_id: 0,
            next_asset: 0,
            meshes: HashMap::new(),
            materials: HashMap::new(),
            lights: HashMap::new(),
            mixers: HashMap::new(),
            shadows: None,
        }
    }

    pub fn adapter_name(&self) -> Option<String> {
        self.gpu.as_ref().map(|gpu| gpu.adapter.get_info().name)
    }

    pub fn shadow_settings(&self) -> Option<ShadowSettings> {
        self.shadows
    }

    fn allocate(&mut self, kind: ResourceKind) -> ResourceHandle {
        self.next_id += 1;
        ResourceHandle::new(kind, self.next_id)
    }

    fn gpu(&self) -> Result<&Gpu, ViewerError> {
        self.gpu.as_ref().ok_or(ViewerError::EnvironmentUnsupported)
    }

    fn globals(&self, frame: &FrameState) -> GlobalUniform {
        let mut globals = GlobalUniform {
            view_proj: frame.view_proj.to_cols_array_2d(),
            camera_position: frame.camera_position.extend(1.0).into(),
            key_direction: Vec4::new(1.0, 1.0, 1.0, 0.0).into(),
            key_color: [0.0; 4],
            fill_direction: Vec4::new(-1.0, 0.5, 1.0, 0.0).into(),
            fill_color: [0.0; 4],
            ambient: [0.3, 0.3, 0.3, 1.0],
        };
        let mut ambient = Vec3::ZERO;
        for light in self.lights.values() {
            match *light {
                LightSlot::Ambient(color) => ambient += color,
                LightSlot::Key { direction, color } => {
                    globals.key_direction = direction.extend(0.0).into();
                    globals.key_color = color.extend(1.0).into();
                }
                LightSlot::Fill { direction, color } => {
                    globals.fill_direction = direction.extend(0.0).into();
                    globals.fill_color = color.extend(1.0).into();
                }
            }
        }
        if !self.lights.is_empty() {
            globals.ambient = ambient.extend(1.0).into();
        }
        globals
    }

    /// Rotation baked into one mesh by the clips playing on its asset.
    fn animation_matrix(&self, mesh: &GpuMesh) -> Mat4 {
        let mut rotation = Quat::IDENTITY;
        for mixer in self.mixers.values().filter(|m| m.asset == mesh.asset) {
            rotation *= mixer.clip.rotation(mesh.mesh_index, mixer.time);
        }
        if rotation == Quat::IDENTITY {
            return Mat4::IDENTITY;
        }
        Mat4::from_translation(mesh.center)
            * Mat4::from_quat(rotation)
            * Mat4::from_translation(-mesh.center)
    }
}

impl GraphicsEngine for WgpuEngine {
    fn supports_hardware_acceleration(&self) -> bool {
        self.gpu.is_some()
    }

    fn create_surface(&mut self, size: SurfaceSize) -> Result<SurfaceId, ViewerError> {
        let gpu = self.gpu.as_ref().ok_or(ViewerError::EnvironmentUnsupported)?;
        let target = self
            .target
            .take()
            .ok_or_else(|| ViewerError::engine("render target already has a surface"))?;
        let surface = self
            .instance
            .create_surface(target)
            .map_err(ViewerError::engine)?;

        let caps = surface.get_capabilities(&gpu.adapter);
        let Some(&fallback_format) = caps.formats.first() else {
            return Err(ViewerError::engine("adapter cannot present to this surface"));
        };
        let format = caps
            .formats
            .iter()
            .find(|format| format.is_srgb())
            .copied()
            .unwrap_or(fallback_format);
        let alpha_mode = if caps
            .alpha_modes
            .contains(&wgpu::CompositeAlphaMode::PreMultiplied)
        {
            wgpu::CompositeAlphaMode::PreMultiplied
        } else {
            caps.alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto)
        };
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width,
            height: size.height,
            present_mode: wgpu::PresentMode::Fifo,
            desired_maximum_frame_latency: 2,
            alpha_mode,
            view_formats: vec![],
        };
        surface.configure(&gpu.device, &config);

        let state = SurfaceState {
            depth: DepthBuffer::create(&gpu.device, size.width, size.height),
            pipeline: gpu.pipeline(format),
            surface,
            config,
        };
        self.next_id += 1;
        let id = SurfaceId(self.next_id);
        self.surfaces.insert(id, state);
        info!("render surface {}x{} ({format:?})", size.width, size.height);
        Ok(id)
    }

    fn resize_surface(&mut self, surface: SurfaceId, size: SurfaceSize) {
        let (Some(gpu), Some(state)) = (self.gpu.as_ref(), self.surfaces.get_mut(&surface)) else {
            return;
        };
        state.config.width = size.width;
        state.config.height = size.height;
        state.surface.configure(&gpu.device, &state.config);
        state.depth = DepthBuffer::create(&gpu.device, size.width, size.height);
    }

    fn dispose_surface(&mut self, surface: SurfaceId) {
        self.surfaces.remove(&surface);
    }

    fn install_lights(&mut self, rig: &LightRig) -> Result<Vec<ResourceHandle>, ViewerError> {
        let slots = [
            LightSlot::Ambient(rig.ambient.color * rig.ambient.intensity),
            LightSlot::Key {
                direction: rig.key.position.normalize_or_zero(),
                color: rig.key.color * rig.key.intensity,
            },
            LightSlot::Fill {
                direction: rig.fill.position.normalize_or_zero(),
                color: rig.fill.color * rig.fill.intensity,
            },
        ];
        let mut handles = Vec::with_capacity(slots.len());
        for slot in slots {
            let handle = self.allocate(ResourceKind::Light);
            self.lights.insert(handle.id, slot);
            handles.push(handle);
        }
        Ok(handles)
    }

    fn upload_asset(&mut self, asset: &AssetData) -> Result<Vec<ResourceHandle>, ViewerError> {
        self.gpu()?;
        self.next_asset += 1;
        let asset_id = self.next_asset;
        let mut handles = Vec::new();

        let mut material_ids = Vec::with_capacity(asset.materials.len());
        for material in &asset.materials {
            let handle = self.allocate(ResourceKind::Material);
            self.materials.insert(handle.id, material.color.extend(1.0));
            material_ids.push(handle.id);
            handles.push(handle);
        }

        for (index, mesh) in asset.meshes.iter().enumerate() {
            if mesh.indices.is_empty() {
                continue;
            }
            let handle = self.allocate(ResourceKind::Geometry);
            let material = mesh.material.and_then(|m| material_ids.get(m).copied());
            let gpu = self.gpu()?;
            let buffers = GpuMesh::upload(gpu, mesh, asset_id, index, material);
            self.meshes.insert(handle.id, buffers);
            handles.push(handle);
        }
        Ok(handles)
    }

    fn create_mixer(&mut self, clip: &AnimationClip) -> Result<ResourceHandle, ViewerError> {
        let handle = self.allocate(ResourceKind::Mixer);
        self.mixers.insert(
            handle.id,
            Mixer {
                asset: self.next_asset,
                clip: clip.clone(),
                time: 0.0,
            },
        );
        Ok(handle)
    }

    fn advance_mixer(&mut self, mixer: ResourceHandle, delta_seconds: f32) {
        if let Some(mixer) = self.mixers.get_mut(&mixer.id) {
            mixer.time += delta_seconds;
        }
    }

    fn apply_shadow_settings(&mut self, settings: ShadowSettings) {
        if self.shadows != Some(settings) {
            info!(
                "shadows {} (map {}px)",
                if settings.enabled { "on" } else { "off" },
                settings.map_size
            );
        }
        self.shadows = Some(settings);
    }

    fn release(&mut self, resource: ResourceHandle) {
        match resource.kind {
            ResourceKind::Geometry => {
                if let Some(mesh) = self.meshes.remove(&resource.id) {
                    mesh.destroy();
                }
            }
            ResourceKind::Material => {
                self.materials.remove(&resource.id);
            }
            ResourceKind::Light => {
                self.lights.remove(&resource.id);
            }
            ResourceKind::Mixer => {
                self.mixers.remove(&resource.id);
            }
        }
    }

    fn render(&mut self, surface: SurfaceId, frame: &FrameState) -> Result<(), ViewerError> {
        let gpu = self.gpu()?;
        let state = self
            .surfaces
            .get(&surface)
            .ok_or_else(|| ViewerError::engine(format!("unknown surface {}", surface.0)))?;

        gpu.queue
            .write_buffer(&gpu.global_buffer, 0, bytes_of(&self.globals(frame)));

        let mut draw_list: Vec<&GpuMesh> = Vec::new();
        if let Some(model) = frame.model {
            let mut ids: Vec<&u64> = self.meshes.keys().collect();
            ids.sort();
            for id in ids {
                let mesh = &self.meshes[id];
                let world = model * self.animation_matrix(mesh);
                let normal = Mat3::from_mat4(world).inverse().transpose();
                let color = mesh
                    .material
                    .and_then(|m| self.materials.get(&m))
                    .copied()
                    .unwrap_or(DEFAULT_COLOR);
                let constants = ObjectConstants {
                    model: world.to_cols_array_2d(),
                    normal: mat3_to_3x4(normal),
                    color: color.into(),
                };
                gpu.queue
                    .write_buffer(&mesh.uniform, 0, bytes_of(&constants));
                draw_list.push(mesh);
            }
        }

        let output = match state.surface.get_current_texture() {
            Ok(output) => output,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                state.surface.configure(&gpu.device, &state.config);
                return Ok(());
            }
            Err(err) => return Err(ViewerError::engine(err)),
        };
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("viewer-encoder"),
            });

        let [r, g, b, a] = frame.clear_color;
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("viewer-pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color {
                        r: r * a,
                        g: g * a,
                        b: b * a,
                        a,
                    }),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &state.depth.view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        pass.set_pipeline(&state.pipeline);
        pass.set_bind_group(0, &gpu.global_bind_group, &[]);
        for mesh in draw_list {
            pass.set_vertex_buffer(0, mesh.vertex.slice(..));
            pass.set_index_buffer(mesh.indices.slice(..), wgpu::IndexFormat::Uint32);
            pass.set_bind_group(1, &mesh.bind_group, &[]);
            pass.draw_indexed(0..mesh.index_count, 0, 0..1);
        }

        drop(pass);
        gpu.queue.submit(std::iter::once(encoder.finish()));
        output.present();
        Ok(())
    }
}

/// Adapter, device and the layouts shared by every surface.
struct Gpu {
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    global_layout: wgpu::BindGroupLayout,
    object_layout: wgpu::BindGroupLayout,
    global_buffer: wgpu::Buffer,
    global_bind_group: wgpu::BindGroup,
}

impl Gpu {
    async fn request(instance: &wgpu::Instance) -> Result<Self> {
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .context("failed to acquire GPU adapter")?;
        let info = adapter.get_info();
        if info.device_type == wgpu::DeviceType::Cpu {
            bail!("only a software adapter is available ({})", info.name);
        }

        let device_descriptor = wgpu::DeviceDescriptor {
            label: Some("viewer-device"),
            required_features: wgpu::Features::empty(),
            required_limits: if cfg!(target_arch = "wasm32") {
                wgpu::Limits::downlevel_webgl2_defaults()
            } else {
                wgpu::Limits::default()
            },
            experimental_features: Default::default(),
            memory_hints: Default::default(),
            trace: Default::default(),
        };
        let (device, queue) = adapter
            .request_device(&device_descriptor)
            .await
            .context("failed to create GPU device")?;

        let global_layout = uniform_layout::<GlobalUniform>(&device, "global-bind-layout");
        let object_layout = uniform_layout::<ObjectConstants>(&device, "object-bind-layout");
        let global_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("global-uniform"),
            size: std::mem::size_of::<GlobalUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let global_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("global-bind-group"),
            layout: &global_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: global_buffer.as_entire_binding(),
            }],
        });

        info!("using GPU adapter {} ({:?})", info.name, info.backend);
        Ok(Self {
            adapter,
            device,
            queue,
            global_layout,
            object_layout,
            global_buffer,
            global_bind_group,
        })
    }

    fn pipeline(&self, format: wgpu::TextureFormat) -> wgpu::RenderPipeline {
        let shader = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("viewer-shader"),
                source: wgpu::ShaderSource::Wgsl(SHADER.into()),
            });
        let layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("viewer-pipeline-layout"),
                bind_group_layouts: &[&self.global_layout, &self.object_layout],
                push_constant_ranges: &[],
            });
        self.device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("viewer-pipeline"),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    compilation_options: Default::default(),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: (MeshData::STRIDE * std::mem::size_of::<f32>()) as u64,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &[
                            wgpu::VertexAttribute {
                                format: wgpu::VertexFormat::Float32x3,
                                offset: 0,
                                shader_location: 0,
                            },
                            wgpu::VertexAttribute {
                                format: wgpu::VertexFormat::Float32x3,
                                offset: (3 * std::mem::size_of::<f32>()) as u64,
                                shader_location: 1,
                            },
                        ],
                    }],
                },
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    ..Default::default()
                },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: DepthBuffer::FORMAT,
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::Less,
                    stencil: Default::default(),
                    bias: Default::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some("fs_main"),
                    compilation_options: Default::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format,
                        blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                multiview: None,
                cache: None,
            })
    }
}

fn uniform_layout<T>(device: &wgpu::Device, label: &str) -> wgpu::BindGroupLayout {
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &[wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: wgpu::BufferSize::new(std::mem::size_of::<T>() as u64),
            },
            count: None,
        }],
    })
}

struct SurfaceState {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    depth: DepthBuffer,
    pipeline: wgpu::RenderPipeline,
}

#[derive(Debug, Clone, Copy)]
enum LightSlot {
    Ambient(Vec3),
    Key { direction: Vec3, color: Vec3 },
    Fill { direction: Vec3, color: Vec3 },
}

struct Mixer {
    asset: u64,
    clip: AnimationClip,
    time: f32,
}

struct GpuMesh {
    asset: u64,
    mesh_index: usize,
    center: Vec3,
    material: Option<u64>,
    vertex: wgpu::Buffer,
    indices: wgpu::Buffer,
    index_count: u32,
    uniform: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

impl GpuMesh {
    fn upload(gpu: &Gpu, mesh: &MeshData, asset: u64, index: usize, material: Option<u64>) -> Self {
        let label = if mesh.name.is_empty() {
            format!("mesh-{index}")
        } else {
            mesh.name.clone()
        };
        let vertex = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&format!("{label}-vertices")),
                contents: bytemuck::cast_slice(&mesh.vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let index_buffer = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&format!("{label}-indices")),
                contents: bytemuck::cast_slice(&mesh.indices),
                usage: wgpu::BufferUsages::INDEX,
            });
        let uniform = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{label}-uniform")),
            size: std::mem::size_of::<ObjectConstants>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("{label}-bind-group")),
            layout: &gpu.object_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniform.as_entire_binding(),
            }],
        });
        Self {
            asset,
            mesh_index: index,
            center: mesh.bounds().map(|b| b.center()).unwrap_or(Vec3::ZERO),
            material,
            vertex,
            indices: index_buffer,
            index_count: mesh.indices.len() as u32,
            uniform,
            bind_group,
        }
    }

    fn destroy(self) {
        self.vertex.destroy();
        self.indices.destroy();
        self.uniform.destroy();
    }
}

struct DepthBuffer {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
}

impl DepthBuffer {
    const FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24Plus;

    fn create(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("depth-texture"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            _texture: texture,
            view,
        }
    }
}

fn mat3_to_3x4(matrix: Mat3) -> [[f32; 4]; 3] {
    let cols = matrix.to_cols_array();
    [
        [cols[0], cols[1], cols[2], 0.0],
        [cols[3], cols[4], cols[5], 0.0],
        [cols[6], cols[7], cols[8], 0.0],
    ]
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct GlobalUniform {
    view_proj: [[f32; 4]; 4],
    camera_position: [f32; 4],
    key_direction: [f32; 4],
    key_color: [f32; 4],
    fill_direction: [f32; 4],
    fill_color: [f32; 4],
    ambient: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ObjectConstants {
    model: [[f32; 4]; 4],
    normal: [[f32; 4]; 3],
    color: [f32; 4],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_layouts_match_wgsl_alignment() {
        assert_eq!(std::mem::size_of::<GlobalUniform>(), 64 + 6 * 16);
        assert_eq!(std::mem::size_of::<ObjectConstants>(), 64 + 48 + 16);
    }

    #[test]
    fn normal_matrix_rows_are_padded() {
        let padded = mat3_to_3x4(Mat3::IDENTITY);
        assert_eq!(padded[0], [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(padded[2], [0.0, 0.0, 1.0, 0.0]);
    }
}
