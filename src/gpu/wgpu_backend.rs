//! [`RenderBackend`] on a wgpu device.
//!
//! Commands are recorded into one encoder per frame. GL-style bind state
//! is tracked on the CPU side and resolved at draw time into a render
//! pass, a cached pipeline and a cached bind group. Uniforms go into a
//! per-frame ring buffer, one slot per draw, selected by dynamic offset.

use std::borrow::Cow;
use std::sync::{Arc, OnceLock};

use glam::Mat4;
use rustc_hash::FxHashMap;
use wgpu::util::DeviceExt;
use wgpu::{BufferAddress, DynamicOffset};

use super::backend::{
    ColorFormat, FramebufferAttachments, FramebufferHandle, MeshHandle,
    QuadVertex, RenderBackend, RenderbufferHandle, TextureHandle, Viewport,
};
use super::pipeline_helpers::{
    create_quad_pipeline, depth_texture_2d, filtering_sampler, linear_sampler,
    texture_2d, uniform_buffer,
};
use super::render_context::RenderContext;
use super::shader_composer::{program_source, ShaderComposer};
use super::shader_program::{Program, UniformSink, UniformValue};
use super::texture::OutputTexture;
use crate::error::{PostFxError, ResourceKind};

const HDR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
const LDR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
const TEXTURE_UNITS: usize = 8;
/// One texel padded to the copy row alignment.
const READBACK_ROW: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
const DEPTH_SAMPLER: &str = "texDepth";
/// Bytes of one [`PassUniforms`] block.
const UNIFORM_SIZE: BufferAddress = size_of::<PassUniforms>() as BufferAddress;
/// Uniform slots allocated up front; a frame of the full chain uses 13.
const UNIFORM_SLOTS: u32 = 32;
/// Error classes captured around resource creation.
const CAPTURED_ERRORS: [wgpu::ErrorFilter; 3] = [
    wgpu::ErrorFilter::Internal,
    wgpu::ErrorFilter::OutOfMemory,
    wgpu::ErrorFilter::Validation,
];

/// Mirrors `PassUniforms` in `modules/fullscreen.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct PassUniforms {
    projection: [[f32; 4]; 4],
    radius: f32,
    size: f32,
    exposure: f32,
    gamma: f32,
    threshold: f32,
    _pad: [f32; 3],
}

/// Uniform values and sampler-to-unit mapping of one program, kept across
/// binds the way GL keeps them in the program object.
#[derive(Debug, Clone, Copy)]
struct ProgramState {
    uniforms: PassUniforms,
    sampler_units: [u32; 4],
}

impl Default for ProgramState {
    fn default() -> Self {
        Self {
            uniforms: PassUniforms {
                projection: Mat4::IDENTITY.to_cols_array_2d(),
                radius: 0.0,
                size: 1.0,
                exposure: 1.0,
                gamma: 1.0,
                threshold: 0.0,
                _pad: [0.0; 3],
            },
            sampler_units: [0, 1, 2, 3],
        }
    }
}

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
}

impl GpuTexture {
    fn is_depth(&self) -> bool {
        self.format.is_depth_stencil_format()
    }
}

struct CompiledProgram {
    module: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: Option<Program>,
    color: wgpu::TextureFormat,
    depth: Option<wgpu::TextureFormat>,
}

/// Program plus the texture behind each of its samplers; `None` stands for
/// the fallback texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BindGroupKey {
    program: Option<Program>,
    textures: [Option<TextureHandle>; 4],
}

impl BindGroupKey {
    fn uses(&self, texture: TextureHandle) -> bool {
        self.textures.contains(&Some(texture))
    }
}

/// Hands out aligned slots of a fixed-size uniform ring.
#[derive(Debug, Clone, Copy)]
struct SlotCursor {
    stride: DynamicOffset,
    capacity: u32,
    next: u32,
}

impl SlotCursor {
    /// Slots of `UNIFORM_SIZE` bytes spaced to `alignment`.
    fn new(alignment: u32, capacity: u32) -> Self {
        let stride = UNIFORM_SIZE.next_multiple_of(u64::from(alignment.max(1)));
        Self {
            stride: DynamicOffset::try_from(stride).unwrap_or(DynamicOffset::MAX),
            capacity,
            next: 0,
        }
    }

    /// Offset of the next free slot, or `None` once the ring is full.
    const fn claim(&mut self) -> Option<DynamicOffset> {
        if self.next >= self.capacity {
            return None;
        }
        let Some(offset) = self.next.checked_mul(self.stride) else {
            return None;
        };
        self.next += 1;
        Some(offset)
    }

    const fn rewind(&mut self) {
        self.next = 0;
    }

    fn buffer_size(&self) -> BufferAddress {
        u64::from(self.stride) * u64::from(self.capacity)
    }
}

struct UniformRing {
    buffer: wgpu::Buffer,
    slots: SlotCursor,
}

impl UniformRing {
    fn new(
        device: &wgpu::Device,
        slots: SlotCursor,
    ) -> Result<Self, PostFxError> {
        let buffer = scoped(device, ResourceKind::BindGroup, || {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Pass Uniforms"),
                size: slots.buffer_size(),
                usage: wgpu::BufferUsages::UNIFORM
                    | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        })?;
        Ok(Self { buffer, slots })
    }
}

/// Attachments of the currently bound draw target.
struct ResolvedTarget {
    color: wgpu::TextureView,
    color_format: wgpu::TextureFormat,
    depth: Option<wgpu::TextureView>,
    width: u32,
    height: u32,
}

struct PendingReadback {
    buffer: wgpu::Buffer,
    format: wgpu::TextureFormat,
    mapped: Arc<OnceLock<Result<(), wgpu::BufferAsyncError>>>,
}

/// Executes the post-processing command stream on a wgpu device.
///
/// Call [`begin_frame`](Self::begin_frame) before and
/// [`end_frame`](Self::end_frame) after each frame's draws. Without a
/// surface the default framebuffer is an [`OutputTexture`].
pub struct WgpuBackend {
    context: RenderContext,
    programs: FxHashMap<Option<Program>, CompiledProgram>,
    pipelines: FxHashMap<PipelineKey, wgpu::RenderPipeline>,
    bind_groups: FxHashMap<BindGroupKey, wgpu::BindGroup>,
    uniforms: UniformRing,
    sampler: wgpu::Sampler,
    fallback_color: GpuTexture,
    fallback_depth: GpuTexture,
    next_id: u64,
    textures: FxHashMap<TextureHandle, GpuTexture>,
    depth_buffers: FxHashMap<RenderbufferHandle, GpuTexture>,
    framebuffers: FxHashMap<FramebufferHandle, FramebufferAttachments>,
    meshes: FxHashMap<MeshHandle, wgpu::Buffer>,
    framebuffer: Option<FramebufferHandle>,
    program: Option<Program>,
    viewport: Viewport,
    units: [Option<TextureHandle>; TEXTURE_UNITS],
    program_state: FxHashMap<Option<Program>, ProgramState>,
    pending_clear: bool,
    encoder: Option<wgpu::CommandEncoder>,
    frame: Option<(wgpu::SurfaceTexture, wgpu::TextureView)>,
    offscreen: Option<OutputTexture>,
    readback: Option<PendingReadback>,
}

impl WgpuBackend {
    /// Compose every program and set up shared resources on `context`.
    ///
    /// Programs that fail to compose or validate, or whose pipelines cannot
    /// be built for the HDR and output formats, are logged and reported as
    /// not ready; passes using them forward their input.
    ///
    /// Installs an uncaptured-error handler on the device that logs
    /// instead of panicking.
    ///
    /// # Errors
    ///
    /// [`PostFxError::CreationFailed`] if the shared shader module, the
    /// plain-texturing program or the uniform ring cannot be built.
    pub fn new(context: RenderContext) -> Result<Self, PostFxError> {
        let device = &context.device;
        device.on_uncaptured_error(Box::new(|e| {
            log::error!("uncaptured wgpu error: {e}");
        }));

        let mut composer = ShaderComposer::new()?;
        let mut programs = FxHashMap::default();
        for program in std::iter::once(None).chain(Program::ALL.map(Some)) {
            match compile_program(device, &mut composer, program) {
                Ok(compiled) => {
                    let _ = programs.insert(program, compiled);
                }
                Err(e) if program.is_none() => return Err(e),
                Err(e) => {
                    log::warn!("shader program '{}': {e}", label_of(program));
                }
            }
        }

        let sampler = linear_sampler(device, "Post-processing Sampler");
        let fallback_color = raw_texture(
            device,
            "Fallback Color",
            1,
            1,
            LDR_FORMAT,
            wgpu::TextureUsages::TEXTURE_BINDING,
        );
        let fallback_depth = raw_texture(
            device,
            "Fallback Depth",
            1,
            1,
            DEPTH_FORMAT,
            wgpu::TextureUsages::TEXTURE_BINDING,
        );

        let alignment = device.limits().min_uniform_buffer_offset_alignment;
        let uniforms =
            UniformRing::new(device, SlotCursor::new(alignment, UNIFORM_SLOTS))?;

        let (width, height) = context.size();
        let offscreen = (!context.has_surface()).then(|| {
            OutputTexture::new(device, width, height, context.format())
        });

        let mut backend = Self {
            context,
            programs,
            pipelines: FxHashMap::default(),
            bind_groups: FxHashMap::default(),
            uniforms,
            sampler,
            fallback_color,
            fallback_depth,
            next_id: 0,
            textures: FxHashMap::default(),
            depth_buffers: FxHashMap::default(),
            framebuffers: FxHashMap::default(),
            meshes: FxHashMap::default(),
            framebuffer: None,
            program: None,
            viewport: Viewport::new(width, height),
            units: [None; TEXTURE_UNITS],
            program_state: FxHashMap::default(),
            pending_clear: false,
            encoder: None,
            frame: None,
            offscreen,
            readback: None,
        };
        backend.warm_pipelines()?;

        log::info!(
            "wgpu backend ready: {width}x{height} {:?}, {} of {} programs",
            backend.context.format(),
            backend.programs.len() - 1,
            Program::ALL.len()
        );
        Ok(backend)
    }

    /// Headless backend on the default adapter, rendering into an
    /// `Rgba8Unorm` output texture.
    ///
    /// # Errors
    ///
    /// [`PostFxError::Gpu`] if no adapter or device is available, or any
    /// error from [`Self::new`].
    pub fn headless(width: u32, height: u32) -> Result<Self, PostFxError> {
        let context = pollster::block_on(RenderContext::new_headless(
            LDR_FORMAT, width, height,
        ))?;
        Self::new(context)
    }

    /// The device context.
    #[must_use]
    pub fn context(&self) -> &RenderContext {
        &self.context
    }

    /// View of a texture created through this backend, e.g. for the scene
    /// renderer to draw into the `scene` target.
    #[must_use]
    pub fn texture_view(
        &self,
        texture: TextureHandle,
    ) -> Option<&wgpu::TextureView> {
        self.textures.get(&texture).map(|t| &t.view)
    }

    /// The headless output texture (`None` when presenting to a surface).
    #[must_use]
    pub fn output_texture(&self) -> Option<&OutputTexture> {
        self.offscreen.as_ref()
    }

    /// Acquire the surface image that acts as the default framebuffer.
    ///
    /// # Errors
    ///
    /// [`PostFxError::Surface`] if the swapchain image cannot be acquired.
    pub fn begin_frame(&mut self) -> Result<(), PostFxError> {
        if self.context.has_surface() && self.frame.is_none() {
            let frame = self.context.get_next_frame()?;
            let view = frame
                .texture
                .create_view(&wgpu::TextureViewDescriptor::default());
            self.frame = Some((frame, view));
        }
        Ok(())
    }

    /// Submit recorded work and present the surface image.
    pub fn end_frame(&mut self) {
        self.flush_clear();
        self.submit_pending();
        if let Some((frame, _)) = self.frame.take() {
            frame.present();
        }
    }

    /// Reconfigure the output for a new window size. Zero sizes are
    /// ignored.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.context.resize(width, height);
        if self.offscreen.is_some() {
            self.offscreen = Some(OutputTexture::new(
                &self.context.device,
                width,
                height,
                self.context.format(),
            ));
        }
    }

    /// Build every program's pipeline for the formats the chain draws
    /// into, so a program that cannot run on this device is retired before
    /// its first frame.
    fn warm_pipelines(&mut self) -> Result<(), PostFxError> {
        let formats = [HDR_FORMAT, self.context.format()];
        let programs: Vec<_> = std::iter::once(None)
            .chain(Program::ALL.map(Some))
            .filter(|p| self.programs.contains_key(p))
            .collect();
        for program in programs {
            for color in formats {
                let key = PipelineKey {
                    program,
                    color,
                    depth: None,
                };
                match self.pipeline_for(key) {
                    Ok(_) => {}
                    Err(e) if program.is_none() => return Err(e),
                    Err(_) => break,
                }
            }
        }
        Ok(())
    }

    fn next_raw(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn create_texture(
        &self,
        label: &str,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        usage: wgpu::TextureUsages,
        resource: ResourceKind,
    ) -> Result<GpuTexture, PostFxError> {
        let max = self.context.device.limits().max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(PostFxError::creation(
                resource,
                format!("{width}x{height} outside 1..={max}"),
            ));
        }
        let device = &self.context.device;
        scoped(device, resource, || {
            raw_texture(device, label, width, height, format, usage)
        })
    }

    fn resolve_target(&self) -> Result<ResolvedTarget, PostFxError> {
        let Some(handle) = self.framebuffer else {
            return self.default_target();
        };
        let missing = |what: &str| {
            PostFxError::creation(
                ResourceKind::Framebuffer,
                format!("framebuffer {} has no live {what}", handle.raw()),
            )
        };
        let attachments =
            self.framebuffers.get(&handle).ok_or_else(|| missing("entry"))?;
        let color = self
            .textures
            .get(&attachments.color)
            .ok_or_else(|| missing("color attachment"))?;
        let depth = match (attachments.depth_texture, attachments.depth_buffer) {
            (Some(texture), _) => Some(
                self.textures
                    .get(&texture)
                    .ok_or_else(|| missing("depth texture"))?
                    .view
                    .clone(),
            ),
            (None, Some(buffer)) => Some(
                self.depth_buffers
                    .get(&buffer)
                    .ok_or_else(|| missing("depth buffer"))?
                    .view
                    .clone(),
            ),
            (None, None) => None,
        };
        Ok(ResolvedTarget {
            color: color.view.clone(),
            color_format: color.format,
            depth,
            width: color.texture.width(),
            height: color.texture.height(),
        })
    }

    fn default_target(&self) -> Result<ResolvedTarget, PostFxError> {
        if let Some(output) = &self.offscreen {
            let (width, height) = output.size();
            return Ok(ResolvedTarget {
                color: output.view.clone(),
                color_format: output.format(),
                depth: None,
                width,
                height,
            });
        }
        let (frame, view) = self.frame.as_ref().ok_or_else(|| {
            PostFxError::creation(
                ResourceKind::Framebuffer,
                "no surface image acquired; call begin_frame first",
            )
        })?;
        Ok(ResolvedTarget {
            color: view.clone(),
            color_format: frame.texture.format(),
            depth: None,
            width: frame.texture.width(),
            height: frame.texture.height(),
        })
    }

    fn pipeline_for(
        &mut self,
        key: PipelineKey,
    ) -> Result<wgpu::RenderPipeline, PostFxError> {
        if let Some(pipeline) = self.pipelines.get(&key) {
            return Ok(pipeline.clone());
        }
        let compiled = self.programs.get(&key.program).ok_or_else(|| {
            PostFxError::creation(
                ResourceKind::Program,
                format!("'{}' is not available", label_of(key.program)),
            )
        })?;
        let label = label_of(key.program);
        let device = &self.context.device;
        let built = scoped(device, ResourceKind::Program, || {
            create_quad_pipeline(
                device,
                label,
                &compiled.module,
                &compiled.pipeline_layout,
                key.color,
                key.depth,
            )
        });
        let pipeline = match built {
            Ok(pipeline) => pipeline,
            Err(e) => {
                if retire_program(&mut self.programs, key.program) {
                    log::warn!("retiring shader program '{label}': {e}");
                    self.pipelines.retain(|k, _| k.program != key.program);
                    self.bind_groups.retain(|k, _| k.program != key.program);
                }
                return Err(e);
            }
        };
        log::debug!(
            "created '{label}' pipeline for {:?} (depth {:?})",
            key.color,
            key.depth
        );
        let _ = self.pipelines.insert(key, pipeline.clone());
        Ok(pipeline)
    }

    /// Copy `uniforms` into the next ring slot, growing the ring when a
    /// frame outruns it.
    fn write_uniforms(
        &mut self,
        uniforms: &PassUniforms,
    ) -> Result<DynamicOffset, PostFxError> {
        let offset = match self.uniforms.slots.claim() {
            Some(offset) => offset,
            None => {
                let old = self.uniforms.slots;
                let capacity = old.capacity.saturating_mul(2);
                log::debug!("growing uniform ring to {capacity} slots");
                let slots = SlotCursor {
                    capacity,
                    next: 0,
                    ..old
                };
                self.uniforms = UniformRing::new(&self.context.device, slots)?;
                self.bind_groups.clear();
                self.uniforms.slots.claim().ok_or_else(|| {
                    PostFxError::creation(
                        ResourceKind::BindGroup,
                        "uniform ring is full",
                    )
                })?
            }
        };
        self.context.queue.write_buffer(
            &self.uniforms.buffer,
            BufferAddress::from(offset),
            bytemuck::bytes_of(uniforms),
        );
        Ok(offset)
    }

    /// Texture bound to `unit` if it is live and of the wanted kind.
    fn texture_on_unit(&self, unit: u32, depth: bool) -> Option<TextureHandle> {
        let handle = self.units.get(unit as usize).copied().flatten()?;
        let texture = self.textures.get(&handle)?;
        (texture.is_depth() == depth).then_some(handle)
    }

    fn bind_group_for(
        &mut self,
        program: Option<Program>,
        state: &ProgramState,
    ) -> Result<wgpu::BindGroup, PostFxError> {
        let mut key = BindGroupKey {
            program,
            textures: [None; 4],
        };
        for ((slot, &name), unit) in key
            .textures
            .iter_mut()
            .zip(samplers_of(program))
            .zip(state.sampler_units)
        {
            *slot = self.texture_on_unit(unit, name == DEPTH_SAMPLER);
        }
        if let Some(bind_group) = self.bind_groups.get(&key) {
            return Ok(bind_group.clone());
        }

        let compiled = self.programs.get(&program).ok_or_else(|| {
            PostFxError::creation(
                ResourceKind::Program,
                format!("'{}' is not available", label_of(program)),
            )
        })?;
        let views: Vec<&wgpu::TextureView> = samplers_of(program)
            .iter()
            .zip(key.textures)
            .map(|(&name, texture)| {
                match texture.and_then(|h| self.textures.get(&h)) {
                    Some(texture) => &texture.view,
                    None if name == DEPTH_SAMPLER => &self.fallback_depth.view,
                    None => &self.fallback_color.view,
                }
            })
            .collect();

        let mut entries = vec![
            wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &self.uniforms.buffer,
                    offset: 0,
                    size: wgpu::BufferSize::new(UNIFORM_SIZE),
                }),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::Sampler(&self.sampler),
            },
        ];
        entries.extend(views.iter().zip(2u32..).map(|(view, binding)| {
            wgpu::BindGroupEntry {
                binding,
                resource: wgpu::BindingResource::TextureView(view),
            }
        }));

        let device = &self.context.device;
        let bind_group = scoped(device, ResourceKind::BindGroup, || {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label_of(program)),
                layout: &compiled.bind_group_layout,
                entries: &entries,
            })
        })?;
        let _ = self.bind_groups.insert(key, bind_group.clone());
        Ok(bind_group)
    }

    /// Record a pass on the bound target that only clears it.
    fn flush_clear(&mut self) {
        if !self.pending_clear {
            return;
        }
        self.pending_clear = false;
        match self.resolve_target() {
            Ok(target) => {
                let context = &self.context;
                let encoder = self.encoder.get_or_insert_with(|| {
                    context.create_encoder("Post-processing Encoder")
                });
                drop(begin_pass(encoder, "Clear", &target, true));
            }
            Err(e) => log::warn!("dropping clear: {e}"),
        }
    }

    /// Submit the open encoder. Uniform writes made so far land before it
    /// runs, so the ring can be reused from the start.
    fn submit_pending(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.context.submit(encoder);
        }
        self.uniforms.slots.rewind();
    }

    /// Encode a copy of texel (0,0) of `texture` into a fresh staging
    /// buffer and submit everything recorded so far.
    fn submit_texel_copy(
        &mut self,
        texture: TextureHandle,
    ) -> Result<(wgpu::Buffer, wgpu::TextureFormat), PostFxError> {
        self.flush_clear();
        let source = self.textures.get(&texture).ok_or_else(|| {
            PostFxError::Readback(format!(
                "texture {} is not live",
                texture.raw()
            ))
        })?;
        let format = source.format;
        if texel_size(format).is_none() {
            return Err(PostFxError::Readback(format!(
                "cannot decode {format:?}"
            )));
        }
        let context = &self.context;
        let staging = context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Texel Readback"),
            size: READBACK_ROW as BufferAddress,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let encoder = self.encoder.get_or_insert_with(|| {
            context.create_encoder("Post-processing Encoder")
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &source.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(READBACK_ROW),
                    rows_per_image: Some(1),
                },
            },
            wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
        self.submit_pending();
        Ok((staging, format))
    }
}

impl UniformSink for WgpuBackend {
    fn set_uniform(&mut self, name: &'static str, value: UniformValue) {
        let program = self.program;
        let state = self.program_state.entry(program).or_default();
        match (name, value) {
            (_, UniformValue::Sampler(unit)) => {
                match samplers_of(program).iter().position(|s| *s == name) {
                    Some(slot) => state.sampler_units[slot] = unit,
                    None => log::trace!(
                        "'{}' has no sampler '{name}'",
                        label_of(program)
                    ),
                }
            }
            ("radius", UniformValue::Float(v)) => state.uniforms.radius = v,
            ("size", UniformValue::Float(v)) => state.uniforms.size = v,
            ("exposure", UniformValue::Float(v)) => state.uniforms.exposure = v,
            ("gamma", UniformValue::Float(v)) => state.uniforms.gamma = v,
            ("threshold", UniformValue::Float(v)) => {
                state.uniforms.threshold = v;
            }
            (_, UniformValue::Float(_)) => {
                log::trace!("'{}' has no uniform '{name}'", label_of(program));
            }
        }
    }
}

impl RenderBackend for WgpuBackend {
    fn create_color_texture(
        &mut self,
        width: u32,
        height: u32,
        format: ColorFormat,
    ) -> Result<TextureHandle, PostFxError> {
        let format = match format {
            ColorFormat::Hdr => HDR_FORMAT,
            ColorFormat::Ldr => LDR_FORMAT,
        };
        let texture = self.create_texture(
            "Color Target",
            width,
            height,
            format,
            wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            ResourceKind::ColorTexture,
        )?;
        let raw = self.next_raw();
        let handle = TextureHandle::from_raw(raw).ok_or_else(|| {
            PostFxError::creation(ResourceKind::ColorTexture, "id overflow")
        })?;
        let _ = self.textures.insert(handle, texture);
        Ok(handle)
    }

    fn create_depth_texture(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<TextureHandle, PostFxError> {
        let texture = self.create_texture(
            "Depth Target",
            width,
            height,
            DEPTH_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING,
            ResourceKind::DepthTexture,
        )?;
        let raw = self.next_raw();
        let handle = TextureHandle::from_raw(raw).ok_or_else(|| {
            PostFxError::creation(ResourceKind::DepthTexture, "id overflow")
        })?;
        let _ = self.textures.insert(handle, texture);
        Ok(handle)
    }

    fn create_depth_buffer(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<RenderbufferHandle, PostFxError> {
        let buffer = self.create_texture(
            "Depth Buffer",
            width,
            height,
            DEPTH_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT,
            ResourceKind::DepthBuffer,
        )?;
        let raw = self.next_raw();
        let handle = RenderbufferHandle::from_raw(raw).ok_or_else(|| {
            PostFxError::creation(ResourceKind::DepthBuffer, "id overflow")
        })?;
        let _ = self.depth_buffers.insert(handle, buffer);
        Ok(handle)
    }

    fn create_framebuffer(
        &mut self,
        attachments: &FramebufferAttachments,
    ) -> Result<FramebufferHandle, PostFxError> {
        let fail = |reason: &str| {
            Err(PostFxError::creation(ResourceKind::Framebuffer, reason))
        };
        let Some(color) = self.textures.get(&attachments.color) else {
            return fail("color attachment is not a live texture");
        };
        if color.is_depth() {
            return fail("color attachment has a depth format");
        }
        let size = (color.texture.width(), color.texture.height());
        let depth = match (attachments.depth_texture, attachments.depth_buffer)
        {
            (Some(t), _) => self.textures.get(&t),
            (None, Some(b)) => self.depth_buffers.get(&b),
            (None, None) => None,
        };
        let has_depth = attachments.depth_texture.is_some()
            || attachments.depth_buffer.is_some();
        match depth {
            None if has_depth => {
                return fail("depth attachment is not live");
            }
            Some(d)
                if !d.is_depth()
                    || (d.texture.width(), d.texture.height()) != size =>
            {
                return fail("depth attachment does not match color");
            }
            _ => {}
        }
        let raw = self.next_raw();
        let handle = FramebufferHandle::from_raw(raw).ok_or_else(|| {
            PostFxError::creation(ResourceKind::Framebuffer, "id overflow")
        })?;
        let _ = self.framebuffers.insert(handle, *attachments);
        Ok(handle)
    }

    fn create_quad_mesh(
        &mut self,
        vertices: &[QuadVertex; 4],
    ) -> Result<MeshHandle, PostFxError> {
        let device = &self.context.device;
        let buffer = scoped(device, ResourceKind::QuadMesh, || {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Full-screen Quad"),
                contents: bytemuck::cast_slice(vertices),
                usage: wgpu::BufferUsages::VERTEX,
            })
        })?;
        let raw = self.next_raw();
        let handle = MeshHandle::from_raw(raw).ok_or_else(|| {
            PostFxError::creation(ResourceKind::QuadMesh, "id overflow")
        })?;
        let _ = self.meshes.insert(handle, buffer);
        Ok(handle)
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        if self.textures.remove(&texture).is_some() {
            self.bind_groups.retain(|key, _| !key.uses(texture));
            for unit in &mut self.units {
                if *unit == Some(texture) {
                    *unit = None;
                }
            }
        }
    }

    fn delete_depth_buffer(&mut self, buffer: RenderbufferHandle) {
        let _ = self.depth_buffers.remove(&buffer);
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if self.framebuffers.remove(&framebuffer).is_some()
            && self.framebuffer == Some(framebuffer)
        {
            self.pending_clear = false;
            self.framebuffer = None;
        }
    }

    fn delete_quad_mesh(&mut self, mesh: MeshHandle) {
        let _ = self.meshes.remove(&mesh);
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferHandle>) {
        if self.framebuffer != framebuffer {
            self.flush_clear();
            self.framebuffer = framebuffer;
        }
    }

    fn bound_framebuffer(&self) -> Option<FramebufferHandle> {
        self.framebuffer
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn clear(&mut self) {
        self.pending_clear = true;
    }

    fn bind_program(&mut self, program: Option<Program>) {
        self.program = program;
    }

    fn bound_program(&self) -> Option<Program> {
        self.program
    }

    fn program_ready(&self, program: Program) -> bool {
        self.programs.contains_key(&Some(program))
    }

    fn bind_texture(&mut self, unit: u32, texture: Option<TextureHandle>) {
        match self.units.get_mut(unit as usize) {
            Some(slot) => *slot = texture,
            None => log::warn!("texture unit {unit} out of range"),
        }
    }

    fn draw_quad(
        &mut self,
        mesh: MeshHandle,
        projection: &Mat4,
    ) -> Result<(), PostFxError> {
        let target = self.resolve_target()?;
        let width = self.viewport.width.min(target.width);
        let height = self.viewport.height.min(target.height);
        if width == 0 || height == 0 {
            log::trace!("skipping draw with empty viewport");
            return Ok(());
        }

        let program = self.program;
        let vertices = self.meshes.get(&mesh).cloned().ok_or_else(|| {
            PostFxError::creation(
                ResourceKind::QuadMesh,
                format!("mesh {} is not live", mesh.raw()),
            )
        })?;
        let pipeline = self.pipeline_for(PipelineKey {
            program,
            color: target.color_format,
            depth: target.depth.as_ref().map(|_| DEPTH_FORMAT),
        })?;
        let mut state =
            self.program_state.get(&program).copied().unwrap_or_default();
        state.uniforms.projection = projection.to_cols_array_2d();
        let offset = self.write_uniforms(&state.uniforms)?;
        let bind_group = self.bind_group_for(program, &state)?;

        let clear = self.pending_clear;
        self.pending_clear = false;
        let context = &self.context;
        let encoder = self.encoder.get_or_insert_with(|| {
            context.create_encoder("Post-processing Encoder")
        });
        let mut pass = begin_pass(encoder, label_of(program), &target, clear);
        pass.set_viewport(0.0, 0.0, width as f32, height as f32, 0.0, 1.0);
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &bind_group, &[offset]);
        pass.set_vertex_buffer(0, vertices.slice(..));
        pass.draw(0..4, 0..1);
        Ok(())
    }

    fn read_texel(
        &mut self,
        texture: TextureHandle,
    ) -> Result<[f32; 4], PostFxError> {
        let (staging, format) = self.submit_texel_copy(texture)?;
        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = self
            .context
            .device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| PostFxError::Readback(e.to_string()))?;
        match receiver.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(PostFxError::Readback(e.to_string())),
            Err(e) => return Err(PostFxError::Readback(e.to_string())),
        }
        let texel = decode_texel(format, &slice.get_mapped_range());
        staging.unmap();
        texel
    }

    fn begin_texel_readback(
        &mut self,
        texture: TextureHandle,
    ) -> Result<(), PostFxError> {
        if self.readback.is_some() {
            return Ok(());
        }
        let (buffer, format) = self.submit_texel_copy(texture)?;
        let mapped = Arc::new(OnceLock::new());
        let signal = Arc::clone(&mapped);
        buffer.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            let _ = signal.set(result);
        });
        self.readback = Some(PendingReadback {
            buffer,
            format,
            mapped,
        });
        Ok(())
    }

    fn poll_texel_readback(&mut self) -> Result<Option<[f32; 4]>, PostFxError> {
        let Some(pending) = &self.readback else {
            return Ok(None);
        };
        let _ = self.context.device.poll(wgpu::PollType::Poll);
        let texel = match pending.mapped.get() {
            None => return Ok(None),
            Some(Ok(())) => {
                let texel = decode_texel(
                    pending.format,
                    &pending.buffer.slice(..).get_mapped_range(),
                );
                pending.buffer.unmap();
                texel
            }
            Some(Err(e)) => Err(PostFxError::Readback(e.to_string())),
        };
        self.readback = None;
        texel.map(Some)
    }

    fn display_size(&self) -> (u32, u32) {
        self.context.size()
    }

    fn output_is_srgb(&self) -> bool {
        self.context.format().is_srgb()
    }
}

fn label_of(program: Option<Program>) -> &'static str {
    program.map_or("passthrough", Program::name)
}

fn samplers_of(program: Option<Program>) -> &'static [&'static str] {
    match program {
        Some(program) => program.samplers(),
        None => &["texSource"],
    }
}

/// Run `create` inside one error scope per [`CAPTURED_ERRORS`] class and
/// report the first error caught.
fn scoped<T>(
    device: &wgpu::Device,
    resource: ResourceKind,
    create: impl FnOnce() -> T,
) -> Result<T, PostFxError> {
    for filter in CAPTURED_ERRORS {
        device.push_error_scope(filter);
    }
    let value = create();
    let mut caught = None;
    for _ in CAPTURED_ERRORS {
        caught = caught.or(pollster::block_on(device.pop_error_scope()));
    }
    match caught {
        Some(e) => Err(PostFxError::creation(resource, e.to_string())),
        None => Ok(value),
    }
}

/// Forget a program whose pipeline cannot be built, so it stops reporting
/// ready. Plain texturing has no fallback and is never retired.
fn retire_program<T>(
    programs: &mut FxHashMap<Option<Program>, T>,
    program: Option<Program>,
) -> bool {
    program.is_some() && programs.remove(&program).is_some()
}

fn raw_texture(
    device: &wgpu::Device,
    label: &str,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
    usage: wgpu::TextureUsages,
) -> GpuTexture {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    GpuTexture {
        texture,
        view,
        format,
    }
}

fn compile_program(
    device: &wgpu::Device,
    composer: &mut ShaderComposer,
    program: Option<Program>,
) -> Result<CompiledProgram, PostFxError> {
    let shader = program_source(program);
    let naga_module = composer.compose_naga(shader).map_err(|e| {
        PostFxError::creation(ResourceKind::Program, composer.describe(&e))
    })?;

    let mut entries =
        vec![uniform_buffer(0, UNIFORM_SIZE), filtering_sampler(1)];
    entries.extend(samplers_of(program).iter().zip(2u32..).map(
        |(&name, binding)| {
            if name == DEPTH_SAMPLER {
                depth_texture_2d(binding)
            } else {
                texture_2d(binding)
            }
        },
    ));

    let label = label_of(program);
    scoped(device, ResourceKind::Program, || {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(shader.file_path),
            source: wgpu::ShaderSource::Naga(Cow::Owned(naga_module)),
        });
        let bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries: &entries,
            });
        let pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });
        CompiledProgram {
            module,
            bind_group_layout,
            pipeline_layout,
        }
    })
}

fn begin_pass<'e>(
    encoder: &'e mut wgpu::CommandEncoder,
    label: &str,
    target: &ResolvedTarget,
    clear: bool,
) -> wgpu::RenderPass<'e> {
    let color_load = if clear {
        wgpu::LoadOp::Clear(wgpu::Color::BLACK)
    } else {
        wgpu::LoadOp::Load
    };
    let depth_load = if clear {
        wgpu::LoadOp::Clear(1.0)
    } else {
        wgpu::LoadOp::Load
    };
    encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some(label),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
            view: &target.color,
            depth_slice: None,
            resolve_target: None,
            ops: wgpu::Operations {
                load: color_load,
                store: wgpu::StoreOp::Store,
            },
        })],
        depth_stencil_attachment: target.depth.as_ref().map(|view| {
            wgpu::RenderPassDepthStencilAttachment {
                view,
                depth_ops: Some(wgpu::Operations {
                    load: depth_load,
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }
        }),
        timestamp_writes: None,
        occlusion_query_set: None,
    })
}

/// Bytes per texel of the formats texel readback can decode.
fn texel_size(format: wgpu::TextureFormat) -> Option<usize> {
    match format {
        HDR_FORMAT => Some(8),
        LDR_FORMAT => Some(4),
        _ => None,
    }
}

fn decode_texel(
    format: wgpu::TextureFormat,
    bytes: &[u8],
) -> Result<[f32; 4], PostFxError> {
    let size = texel_size(format).ok_or_else(|| {
        PostFxError::Readback(format!("cannot decode {format:?}"))
    })?;
    let bytes = bytes.get(..size).ok_or_else(|| {
        PostFxError::Readback(format!("short readback of {} bytes", bytes.len()))
    })?;
    let mut texel = [0.0; 4];
    match format {
        HDR_FORMAT => {
            for (out, pair) in texel.iter_mut().zip(bytes.chunks_exact(2)) {
                *out = half::f16::from_le_bytes([pair[0], pair[1]]).to_f32();
            }
        }
        _ => {
            for (out, &byte) in texel.iter_mut().zip(bytes) {
                *out = f32::from(byte) / 255.0;
            }
        }
    }
    Ok(texel)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Headless device on whatever adapter the machine has, if any.
    fn test_context() -> Option<RenderContext> {
        pollster::block_on(RenderContext::new_headless(LDR_FORMAT, 64, 64)).ok()
    }

    #[test]
    fn captured_errors_cover_every_filter() {
        for filter in [
            wgpu::ErrorFilter::Validation,
            wgpu::ErrorFilter::OutOfMemory,
            wgpu::ErrorFilter::Internal,
        ] {
            assert!(CAPTURED_ERRORS.contains(&filter), "{filter:?}");
        }
    }

    #[test]
    fn scoped_reports_creation_errors() {
        let Some(context) = test_context() else {
            return;
        };
        let device = &context.device;
        let bad = scoped(device, ResourceKind::ColorTexture, || {
            raw_texture(
                device,
                "Empty",
                0,
                0,
                HDR_FORMAT,
                wgpu::TextureUsages::TEXTURE_BINDING,
            )
        });
        assert!(matches!(
            bad,
            Err(PostFxError::CreationFailed {
                resource: ResourceKind::ColorTexture,
                ..
            })
        ));
        let good = scoped(device, ResourceKind::ColorTexture, || {
            raw_texture(
                device,
                "Texel",
                1,
                1,
                HDR_FORMAT,
                wgpu::TextureUsages::TEXTURE_BINDING,
            )
        });
        assert!(good.is_ok());
    }

    #[test]
    fn broken_pipelines_retire_their_program() {
        let mut programs: FxHashMap<Option<Program>, ()> = FxHashMap::default();
        let _ = programs.insert(None, ());
        let _ = programs.insert(Some(Program::Composite), ());

        assert!(retire_program(&mut programs, Some(Program::Composite)));
        assert!(!programs.contains_key(&Some(Program::Composite)));
        assert!(!retire_program(&mut programs, Some(Program::Composite)));

        assert!(!retire_program(&mut programs, None));
        assert!(programs.contains_key(&None));
    }

    #[test]
    fn uniform_slots_follow_offset_alignment() {
        let mut slots = SlotCursor::new(256, 3);
        assert_eq!(slots.buffer_size(), 768);
        assert_eq!(slots.claim(), Some(0));
        assert_eq!(slots.claim(), Some(256));
        assert_eq!(slots.claim(), Some(512));
        assert_eq!(slots.claim(), None);

        slots.rewind();
        assert_eq!(slots.claim(), Some(0));

        let mut tight = SlotCursor::new(32, 2);
        assert_eq!(tight.claim(), Some(0));
        assert_eq!(tight.claim(), Some(96));
    }

    #[test]
    fn bind_group_keys_track_their_textures() {
        let texture = TextureHandle::from_raw(7).unwrap();
        let other = TextureHandle::from_raw(8).unwrap();
        let key = BindGroupKey {
            program: Some(Program::Blur),
            textures: [Some(texture), None, None, None],
        };
        assert!(key.uses(texture));
        assert!(!key.uses(other));
    }

    #[test]
    fn headless_chain_renders_frames() {
        use crate::options::PostProcessingOptions;
        use crate::renderer::postprocess::post_process::PostProcessPipeline;

        let Some(context) = test_context() else {
            return;
        };
        let mut backend = WgpuBackend::new(context).unwrap();
        let mut pipeline = PostProcessPipeline::new(
            &mut backend,
            &PostProcessingOptions::default(),
        )
        .unwrap();
        // Slots and cached bind groups are reused across submits.
        for _ in 0..4 {
            backend.begin_frame().unwrap();
            pipeline.render_scene(&mut backend).unwrap();
            backend.end_frame();
        }
        assert_eq!(backend.uniforms.slots.next, 0);
        assert!(!backend.bind_groups.is_empty());
        pipeline.release(&mut backend);
    }

    #[test]
    fn uniform_block_matches_wgsl_layout() {
        assert_eq!(size_of::<PassUniforms>(), 96);
        assert_eq!(UNIFORM_SIZE, 96);
    }

    #[test]
    fn decodes_half_float_texel() {
        let mut bytes = Vec::new();
        for v in [0.5f32, 1.0, 2.0, 1.0] {
            bytes.extend_from_slice(&half::f16::from_f32(v).to_le_bytes());
        }
        bytes.resize(READBACK_ROW as usize, 0);
        assert_eq!(
            decode_texel(HDR_FORMAT, &bytes).unwrap(),
            [0.5, 1.0, 2.0, 1.0]
        );
    }

    #[test]
    fn decodes_unorm_texel() {
        let texel = decode_texel(LDR_FORMAT, &[255, 0, 51, 255]).unwrap();
        assert_eq!(texel, [1.0, 0.0, 0.2, 1.0]);
    }

    #[test]
    fn rejects_undecodable_formats() {
        assert!(decode_texel(DEPTH_FORMAT, &[0; 8]).is_err());
        assert!(decode_texel(HDR_FORMAT, &[0; 4]).is_err());
    }

    #[test]
    fn sampler_lists_match_programs() {
        assert_eq!(samplers_of(None), &["texSource"]);
        assert_eq!(
            samplers_of(Some(Program::Composite)).iter().position(|s| *s == DEPTH_SAMPLER),
            Some(2)
        );
        assert_eq!(label_of(Some(Program::Blur)), "blur");
    }
}
