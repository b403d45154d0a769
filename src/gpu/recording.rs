//! Device-free backend that records every command, for tests.

use glam::Mat4;
use rustc_hash::{FxHashMap, FxHashSet};

use super::backend::{
    ColorFormat, FramebufferAttachments, FramebufferHandle, MeshHandle,
    QuadVertex, RenderBackend, RenderbufferHandle, TextureHandle, Viewport,
};
use super::shader_program::{Program, UniformSink, UniformValue};
use crate::error::{PostFxError, ResourceKind};

pub(crate) const TEXTURE_UNITS: usize = 8;

/// A draw as observed by the backend.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DrawRecord {
    pub framebuffer: Option<FramebufferHandle>,
    pub program: Option<Program>,
    pub viewport: Viewport,
    pub textures: [Option<TextureHandle>; TEXTURE_UNITS],
    pub uniforms: Vec<(&'static str, UniformValue)>,
    pub projection: Mat4,
}

impl DrawRecord {
    pub fn uniform(&self, name: &str) -> Option<UniformValue> {
        self.uniforms
            .iter()
            .rev()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Command {
    CreateTexture(TextureHandle),
    DeleteTexture(TextureHandle),
    CreateDepthBuffer(RenderbufferHandle),
    DeleteDepthBuffer(RenderbufferHandle),
    CreateFramebuffer(FramebufferHandle),
    DeleteFramebuffer(FramebufferHandle),
    CreateMesh(MeshHandle),
    DeleteMesh(MeshHandle),
    BindFramebuffer(Option<FramebufferHandle>),
    Viewport(Viewport),
    Clear,
    BindProgram(Option<Program>),
    BindTexture(u32, Option<TextureHandle>),
    Draw(DrawRecord),
    ReadTexel(TextureHandle),
}

/// Which allocation should fail, for failure-path tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailOn {
    /// The n-th color texture (1-based) created from now on.
    ColorTexture(usize),
}

#[derive(Debug)]
pub(crate) struct RecordingBackend {
    pub commands: Vec<Command>,
    pub texel: [f32; 4],
    pub broken_programs: FxHashSet<Program>,
    pub fail_on: Option<FailOn>,
    pub display: (u32, u32),
    pub srgb: bool,
    next_id: u64,
    color_created: usize,
    textures: FxHashMap<TextureHandle, (u32, u32)>,
    depth_buffers: FxHashSet<RenderbufferHandle>,
    framebuffers: FxHashMap<FramebufferHandle, FramebufferAttachments>,
    meshes: FxHashSet<MeshHandle>,
    framebuffer: Option<FramebufferHandle>,
    viewport: Viewport,
    program: Option<Program>,
    units: [Option<TextureHandle>; TEXTURE_UNITS],
    uniforms: FxHashMap<Option<Program>, Vec<(&'static str, UniformValue)>>,
    pending_readback: Option<TextureHandle>,
}

impl RecordingBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            commands: Vec::new(),
            texel: [0.0; 4],
            broken_programs: FxHashSet::default(),
            fail_on: None,
            display: (width, height),
            srgb: true,
            next_id: 0,
            color_created: 0,
            textures: FxHashMap::default(),
            depth_buffers: FxHashSet::default(),
            framebuffers: FxHashMap::default(),
            meshes: FxHashSet::default(),
            framebuffer: None,
            viewport: Viewport::new(width, height),
            program: None,
            units: [None; TEXTURE_UNITS],
            uniforms: FxHashMap::default(),
            pending_readback: None,
        }
    }

    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Total number of live GPU objects of every kind.
    pub fn live_resources(&self) -> usize {
        self.textures.len()
            + self.depth_buffers.len()
            + self.framebuffers.len()
            + self.meshes.len()
    }

    pub fn texture_size(&self, texture: TextureHandle) -> Option<(u32, u32)> {
        self.textures.get(&texture).copied()
    }

    pub fn is_live(&self, texture: TextureHandle) -> bool {
        self.textures.contains_key(&texture)
    }

    pub fn draws(&self) -> Vec<&DrawRecord> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                Command::Draw(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    pub fn clear_log(&mut self) {
        self.commands.clear();
    }

    pub fn count(&self, pred: impl Fn(&Command) -> bool) -> usize {
        self.commands.iter().filter(|c| pred(c)).count()
    }
}

impl UniformSink for RecordingBackend {
    fn set_uniform(&mut self, name: &'static str, value: UniformValue) {
        self.uniforms
            .entry(self.program)
            .or_default()
            .push((name, value));
    }
}

impl RenderBackend for RecordingBackend {
    fn create_color_texture(
        &mut self,
        width: u32,
        height: u32,
        _format: ColorFormat,
    ) -> Result<TextureHandle, PostFxError> {
        self.color_created += 1;
        if self.fail_on == Some(FailOn::ColorTexture(self.color_created)) {
            return Err(PostFxError::creation(
                ResourceKind::ColorTexture,
                "injected failure",
            ));
        }
        let raw = self.next();
        let handle = TextureHandle::from_raw(raw).ok_or_else(|| {
            PostFxError::creation(ResourceKind::ColorTexture, "zero handle")
        })?;
        let _ = self.textures.insert(handle, (width, height));
        self.commands.push(Command::CreateTexture(handle));
        Ok(handle)
    }

    fn create_depth_texture(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<TextureHandle, PostFxError> {
        let raw = self.next();
        let handle = TextureHandle::from_raw(raw).ok_or_else(|| {
            PostFxError::creation(ResourceKind::DepthTexture, "zero handle")
        })?;
        let _ = self.textures.insert(handle, (width, height));
        self.commands.push(Command::CreateTexture(handle));
        Ok(handle)
    }

    fn create_depth_buffer(
        &mut self,
        _width: u32,
        _height: u32,
    ) -> Result<RenderbufferHandle, PostFxError> {
        let raw = self.next();
        let handle = RenderbufferHandle::from_raw(raw).ok_or_else(|| {
            PostFxError::creation(ResourceKind::DepthBuffer, "zero handle")
        })?;
        let _ = self.depth_buffers.insert(handle);
        self.commands.push(Command::CreateDepthBuffer(handle));
        Ok(handle)
    }

    fn create_framebuffer(
        &mut self,
        attachments: &FramebufferAttachments,
    ) -> Result<FramebufferHandle, PostFxError> {
        if !self.textures.contains_key(&attachments.color) {
            return Err(PostFxError::creation(
                ResourceKind::Framebuffer,
                "color attachment is not a live texture",
            ));
        }
        let raw = self.next();
        let handle = FramebufferHandle::from_raw(raw).ok_or_else(|| {
            PostFxError::creation(ResourceKind::Framebuffer, "zero handle")
        })?;
        let _ = self.framebuffers.insert(handle, *attachments);
        self.commands.push(Command::CreateFramebuffer(handle));
        Ok(handle)
    }

    fn create_quad_mesh(
        &mut self,
        _vertices: &[QuadVertex; 4],
    ) -> Result<MeshHandle, PostFxError> {
        let raw = self.next();
        let handle = MeshHandle::from_raw(raw).ok_or_else(|| {
            PostFxError::creation(ResourceKind::QuadMesh, "zero handle")
        })?;
        let _ = self.meshes.insert(handle);
        self.commands.push(Command::CreateMesh(handle));
        Ok(handle)
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        if self.textures.remove(&texture).is_some() {
            self.commands.push(Command::DeleteTexture(texture));
        }
    }

    fn delete_depth_buffer(&mut self, buffer: RenderbufferHandle) {
        if self.depth_buffers.remove(&buffer) {
            self.commands.push(Command::DeleteDepthBuffer(buffer));
        }
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if self.framebuffers.remove(&framebuffer).is_some() {
            self.commands.push(Command::DeleteFramebuffer(framebuffer));
        }
    }

    fn delete_quad_mesh(&mut self, mesh: MeshHandle) {
        if self.meshes.remove(&mesh) {
            self.commands.push(Command::DeleteMesh(mesh));
        }
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferHandle>) {
        self.framebuffer = framebuffer;
        self.commands.push(Command::BindFramebuffer(framebuffer));
    }

    fn bound_framebuffer(&self) -> Option<FramebufferHandle> {
        self.framebuffer
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
        self.commands.push(Command::Viewport(viewport));
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn clear(&mut self) {
        self.commands.push(Command::Clear);
    }

    fn bind_program(&mut self, program: Option<Program>) {
        self.program = program;
        self.commands.push(Command::BindProgram(program));
    }

    fn bound_program(&self) -> Option<Program> {
        self.program
    }

    fn program_ready(&self, program: Program) -> bool {
        !self.broken_programs.contains(&program)
    }

    fn bind_texture(&mut self, unit: u32, texture: Option<TextureHandle>) {
        if let Some(slot) = self.units.get_mut(unit as usize) {
            *slot = texture;
        }
        self.commands.push(Command::BindTexture(unit, texture));
    }

    fn draw_quad(
        &mut self,
        mesh: MeshHandle,
        projection: &Mat4,
    ) -> Result<(), PostFxError> {
        if !self.meshes.contains(&mesh) {
            return Err(PostFxError::creation(
                ResourceKind::QuadMesh,
                "draw with released mesh",
            ));
        }
        let record = DrawRecord {
            framebuffer: self.framebuffer,
            program: self.program,
            viewport: self.viewport,
            textures: self.units,
            uniforms: self
                .uniforms
                .get(&self.program)
                .cloned()
                .unwrap_or_default(),
            projection: *projection,
        };
        self.commands.push(Command::Draw(record));
        Ok(())
    }

    fn read_texel(
        &mut self,
        texture: TextureHandle,
    ) -> Result<[f32; 4], PostFxError> {
        if !self.textures.contains_key(&texture) {
            return Err(PostFxError::Readback(format!(
                "texture {} is not live",
                texture.raw()
            )));
        }
        self.commands.push(Command::ReadTexel(texture));
        Ok(self.texel)
    }

    fn begin_texel_readback(
        &mut self,
        texture: TextureHandle,
    ) -> Result<(), PostFxError> {
        if self.pending_readback.is_none() {
            self.pending_readback = Some(texture);
            self.commands.push(Command::ReadTexel(texture));
        }
        Ok(())
    }

    fn poll_texel_readback(&mut self) -> Result<Option<[f32; 4]>, PostFxError> {
        Ok(self.pending_readback.take().map(|_| self.texel))
    }

    fn display_size(&self) -> (u32, u32) {
        self.display
    }

    fn output_is_srgb(&self) -> bool {
        self.srgb
    }
}
