//! Named off-screen render targets and their GPU lifetime.
//!
//! Every fixed chain stage has a [`StageTarget`] variant; anything else
//! (debug captures, tool overlays) lives under [`TargetName::Named`].
//! A name owns at most one allocation: replacing it releases the old
//! color texture, depth texture, depth buffer and framebuffer first.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::error::{PostFxError, ResourceKind};
use crate::gpu::backend::{
    ColorFormat, FramebufferAttachments, FramebufferHandle, RenderBackend,
    RenderbufferHandle, TextureHandle, Viewport,
};

/// Side length of the bright-pass, bloom and blur targets.
pub const EFFECT_TARGET_SIZE: u32 = 1024;

/// Fixed targets of the post-processing chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageTarget {
    /// Primary full-resolution scene (HDR color + depth).
    Scene,
    /// Bright-pass output.
    HighPass,
    /// First wide-radius bloom stage.
    Bloom0,
    /// Second wide-radius bloom stage.
    Bloom1,
    /// First narrow-radius blur stage.
    Blur0,
    /// Second narrow-radius blur stage.
    Blur1,
    /// 64x64 luminance downsample.
    Down64,
    /// 32x32 luminance downsample.
    Down32,
    /// 16x16 luminance downsample.
    Down16,
    /// 8x8 luminance downsample.
    Down8,
    /// 4x4 luminance downsample.
    Down4,
    /// 2x2 luminance downsample.
    Down2,
    /// 1x1 luminance sample read back for exposure.
    Down1,
}

impl StageTarget {
    /// Every stage target in declaration order.
    pub const ALL: [Self; 13] = [
        Self::Scene,
        Self::HighPass,
        Self::Bloom0,
        Self::Bloom1,
        Self::Blur0,
        Self::Blur1,
        Self::Down64,
        Self::Down32,
        Self::Down16,
        Self::Down8,
        Self::Down4,
        Self::Down2,
        Self::Down1,
    ];

    /// Downsample stages, largest first.
    pub const DOWNSAMPLE: [Self; 7] = [
        Self::Down64,
        Self::Down32,
        Self::Down16,
        Self::Down8,
        Self::Down4,
        Self::Down2,
        Self::Down1,
    ];

    /// Conventional string name of the target.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Scene => "scene",
            Self::HighPass => "sceneHighPass",
            Self::Bloom0 => "sceneBloom0",
            Self::Bloom1 => "sceneBloom1",
            Self::Blur0 => "sceneBlur0",
            Self::Blur1 => "sceneBlur1",
            Self::Down64 => "scene64",
            Self::Down32 => "scene32",
            Self::Down16 => "scene16",
            Self::Down8 => "scene8",
            Self::Down4 => "scene4",
            Self::Down2 => "scene2",
            Self::Down1 => "scene1",
        }
    }

    /// Fixed square side length, or `None` for the viewport-sized scene.
    #[must_use]
    pub const fn fixed_size(self) -> Option<u32> {
        match self {
            Self::Scene => None,
            Self::HighPass
            | Self::Bloom0
            | Self::Bloom1
            | Self::Blur0
            | Self::Blur1 => Some(EFFECT_TARGET_SIZE),
            Self::Down64 => Some(64),
            Self::Down32 => Some(32),
            Self::Down16 => Some(16),
            Self::Down8 => Some(8),
            Self::Down4 => Some(4),
            Self::Down2 => Some(2),
            Self::Down1 => Some(1),
        }
    }

    /// Bloom stage `index` (0 or 1).
    #[must_use]
    pub const fn bloom(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Bloom0),
            1 => Some(Self::Bloom1),
            _ => None,
        }
    }

    /// Blur stage `index` (0 or 1).
    #[must_use]
    pub const fn blur(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Blur0),
            1 => Some(Self::Blur1),
            _ => None,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }
}

/// Registry key: a fixed stage or a free-form name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetName {
    /// One of the fixed chain targets.
    Stage(StageTarget),
    /// A dynamic target created outside the fixed chain.
    Named(String),
}

impl TargetName {
    /// String form of the name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Stage(stage) => stage.name(),
            Self::Named(name) => name,
        }
    }
}

impl From<StageTarget> for TargetName {
    fn from(stage: StageTarget) -> Self {
        Self::Stage(stage)
    }
}

impl From<&str> for TargetName {
    fn from(name: &str) -> Self {
        StageTarget::from_name(name)
            .map_or_else(|| Self::Named(name.to_owned()), Self::Stage)
    }
}

impl From<String> for TargetName {
    fn from(name: String) -> Self {
        StageTarget::from_name(&name).map_or(Self::Named(name), Self::Stage)
    }
}

impl fmt::Display for TargetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handles of one off-screen render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Color attachment.
    pub color: TextureHandle,
    /// Sampleable depth attachment.
    pub depth_texture: Option<TextureHandle>,
    /// Attachment-only depth storage.
    pub depth_buffer: Option<RenderbufferHandle>,
    /// Framebuffer combining the attachments.
    pub framebuffer: FramebufferHandle,
    /// Whether color is stored as 16-bit float.
    pub hdr: bool,
}

impl RenderTarget {
    /// Make this target the draw target.
    pub fn bind<B: RenderBackend + ?Sized>(&self, backend: &mut B) {
        backend.bind_framebuffer(Some(self.framebuffer));
    }

    /// Return drawing to the default framebuffer.
    pub fn unbind<B: RenderBackend + ?Sized>(&self, backend: &mut B) {
        backend.bind_framebuffer(None);
    }

    /// Bind the color texture to `unit`.
    pub fn bind_texture<B: RenderBackend + ?Sized>(
        &self,
        backend: &mut B,
        unit: u32,
    ) {
        backend.bind_texture(unit, Some(self.color));
    }

    /// Bind the depth texture to `unit` (unbinds the unit if the target
    /// has none).
    pub fn bind_depth_texture<B: RenderBackend + ?Sized>(
        &self,
        backend: &mut B,
        unit: u32,
    ) {
        backend.bind_texture(unit, self.depth_texture);
    }

    /// Clear `unit`.
    pub fn unbind_texture<B: RenderBackend + ?Sized>(
        &self,
        backend: &mut B,
        unit: u32,
    ) {
        backend.bind_texture(unit, None);
    }

    /// Pixel area of the viewport that covers this target.
    #[must_use]
    pub const fn viewport(&self) -> Viewport {
        Viewport::new(self.width, self.height)
    }

    fn release<B: RenderBackend + ?Sized>(&self, backend: &mut B) {
        backend.delete_framebuffer(self.framebuffer);
        if let Some(buffer) = self.depth_buffer {
            backend.delete_depth_buffer(buffer);
        }
        if let Some(depth) = self.depth_texture {
            backend.delete_texture(depth);
        }
        backend.delete_texture(self.color);
    }
}

/// Owns every off-screen render target by name.
#[derive(Debug, Default)]
pub struct RenderTargetRegistry {
    targets: FxHashMap<TargetName, RenderTarget>,
}

impl RenderTargetRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a target under `name`, releasing any previous allocation
    /// of that name first.
    ///
    /// # Errors
    ///
    /// [`PostFxError::CreationFailed`] if the size is zero or the backend
    /// rejects an allocation. Partially created resources are released and
    /// `name` is left absent.
    pub fn create_or_replace<B: RenderBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        name: impl Into<TargetName>,
        width: u32,
        height: u32,
        hdr_color: bool,
        with_depth: bool,
    ) -> Result<RenderTarget, PostFxError> {
        let name = name.into();
        self.destroy(backend, name.clone());

        if width == 0 || height == 0 {
            return Err(PostFxError::creation(
                ResourceKind::ColorTexture,
                format!("'{name}' has zero size {width}x{height}"),
            ));
        }

        let target =
            allocate(backend, width, height, hdr_color, with_depth)?;
        log::debug!(
            "created render target '{name}' {width}x{height} (hdr: \
             {hdr_color}, depth: {with_depth})"
        );
        let _ = self.targets.insert(name, target);
        Ok(target)
    }

    /// Look up a target.
    ///
    /// # Errors
    ///
    /// [`PostFxError::NotFound`] if nothing is registered under `name`.
    pub fn get(
        &self,
        name: impl Into<TargetName>,
    ) -> Result<RenderTarget, PostFxError> {
        let name = name.into();
        self.targets
            .get(&name)
            .copied()
            .ok_or(PostFxError::NotFound(name))
    }

    /// Whether a target is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: impl Into<TargetName>) -> bool {
        self.targets.contains_key(&name.into())
    }

    /// Release everything owned by `name`. No-op if absent.
    pub fn destroy<B: RenderBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        name: impl Into<TargetName>,
    ) {
        let name = name.into();
        if let Some(target) = self.targets.remove(&name) {
            target.release(backend);
            log::debug!("released render target '{name}'");
        }
    }

    /// Create the scene target if missing, or recreate it when the
    /// viewport size no longer matches. Returns whether it was
    /// (re)allocated.
    ///
    /// A zero-sized viewport (minimized window) keeps the current target.
    ///
    /// # Errors
    ///
    /// Propagates [`PostFxError::CreationFailed`] from the allocation.
    pub fn ensure_primary<B: RenderBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        width: u32,
        height: u32,
    ) -> Result<bool, PostFxError> {
        let current = self.targets.get(&TargetName::Stage(StageTarget::Scene));
        if width == 0 || height == 0 {
            if current.is_some() {
                return Ok(false);
            }
        } else if current.is_some_and(|t| t.width == width && t.height == height)
        {
            return Ok(false);
        }

        if let Some(old) = current {
            log::info!(
                "viewport changed {}x{} -> {width}x{height}, recreating scene \
                 target",
                old.width,
                old.height
            );
        }
        let _ = self.create_or_replace(
            backend,
            StageTarget::Scene,
            width,
            height,
            true,
            true,
        )?;
        Ok(true)
    }

    /// Release every target.
    pub fn release_all<B: RenderBackend + ?Sized>(&mut self, backend: &mut B) {
        for (name, target) in self.targets.drain() {
            target.release(backend);
            log::debug!("released render target '{name}'");
        }
    }

    /// Number of live targets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether no targets are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Names of the live targets, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<TargetName> {
        let mut names: Vec<_> = self.targets.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Allocate color, optional depth, and the framebuffer. On failure every
/// resource created so far is released again.
fn allocate<B: RenderBackend + ?Sized>(
    backend: &mut B,
    width: u32,
    height: u32,
    hdr_color: bool,
    with_depth: bool,
) -> Result<RenderTarget, PostFxError> {
    let color = backend.create_color_texture(
        width,
        height,
        ColorFormat::from_hdr(hdr_color),
    )?;

    let (depth_texture, depth_buffer) = if with_depth {
        let depth_texture = match backend.create_depth_texture(width, height) {
            Ok(t) => t,
            Err(e) => {
                backend.delete_texture(color);
                return Err(e);
            }
        };
        let depth_buffer = match backend.create_depth_buffer(width, height) {
            Ok(b) => b,
            Err(e) => {
                backend.delete_texture(depth_texture);
                backend.delete_texture(color);
                return Err(e);
            }
        };
        (Some(depth_texture), Some(depth_buffer))
    } else {
        (None, None)
    };

    let attachments = FramebufferAttachments {
        color,
        depth_texture,
        depth_buffer,
    };
    let framebuffer = match backend.create_framebuffer(&attachments) {
        Ok(fb) => fb,
        Err(e) => {
            if let Some(buffer) = depth_buffer {
                backend.delete_depth_buffer(buffer);
            }
            if let Some(depth) = depth_texture {
                backend.delete_texture(depth);
            }
            backend.delete_texture(color);
            return Err(e);
        }
    };

    Ok(RenderTarget {
        width,
        height,
        color,
        depth_texture,
        depth_buffer,
        framebuffer,
        hdr: hdr_color,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::recording::{Command, FailOn, RecordingBackend};

    #[test]
    fn created_target_reports_requested_size() {
        let mut backend = RecordingBackend::new(800, 600);
        let mut registry = RenderTargetRegistry::new();
        for (w, h) in [(1, 1), (7, 3), (1024, 1024), (1920, 1080)] {
            let created = registry
                .create_or_replace(&mut backend, "scratch", w, h, true, false)
                .unwrap();
            let fetched = registry.get("scratch").unwrap();
            assert_eq!(created, fetched);
            assert_eq!((fetched.width, fetched.height), (w, h));
            assert_eq!(backend.texture_size(fetched.color), Some((w, h)));
        }
    }

    #[test]
    fn replacing_releases_exactly_one_prior_allocation() {
        let mut backend = RecordingBackend::new(800, 600);
        let mut registry = RenderTargetRegistry::new();
        let first = registry
            .create_or_replace(&mut backend, "scene", 640, 480, true, true)
            .unwrap();
        // color + depth texture + depth buffer + framebuffer
        assert_eq!(backend.live_resources(), 4);

        let second = registry
            .create_or_replace(&mut backend, "scene", 800, 600, true, true)
            .unwrap();
        assert_eq!(backend.live_resources(), 4);
        assert_eq!(registry.len(), 1);
        assert!(!backend.is_live(first.color));
        assert!(backend.is_live(second.color));
        assert_eq!(
            backend.count(|c| matches!(c, Command::DeleteFramebuffer(_))),
            1
        );
    }

    #[test]
    fn unknown_name_is_not_found() {
        let registry = RenderTargetRegistry::new();
        let err = registry.get("sceneBloom7").unwrap_err();
        assert!(matches!(err, PostFxError::NotFound(TargetName::Named(n)) if n == "sceneBloom7"));
    }

    #[test]
    fn string_and_stage_names_share_entries() {
        let mut backend = RecordingBackend::new(800, 600);
        let mut registry = RenderTargetRegistry::new();
        let _ = registry
            .create_or_replace(&mut backend, "scene16", 16, 16, true, false)
            .unwrap();
        assert!(registry.contains(StageTarget::Down16));
        assert_eq!(
            TargetName::from("sceneBlur1"),
            TargetName::Stage(StageTarget::Blur1)
        );
    }

    #[test]
    fn destroy_is_noop_when_absent() {
        let mut backend = RecordingBackend::new(800, 600);
        let mut registry = RenderTargetRegistry::new();
        registry.destroy(&mut backend, "nothing");
        assert!(backend.commands.is_empty());
    }

    #[test]
    fn zero_size_fails_and_leaves_name_absent() {
        let mut backend = RecordingBackend::new(800, 600);
        let mut registry = RenderTargetRegistry::new();
        let err = registry
            .create_or_replace(&mut backend, "debug", 0, 64, false, false)
            .unwrap_err();
        assert!(matches!(err, PostFxError::CreationFailed { .. }));
        assert!(!registry.contains("debug"));
        assert_eq!(backend.live_resources(), 0);
    }

    #[test]
    fn failed_replacement_does_not_leak() {
        let mut backend = RecordingBackend::new(800, 600);
        let mut registry = RenderTargetRegistry::new();
        let _ = registry
            .create_or_replace(&mut backend, "debug", 32, 32, true, false)
            .unwrap();
        backend.fail_on = Some(FailOn::ColorTexture(2));
        assert!(registry
            .create_or_replace(&mut backend, "debug", 64, 64, true, false)
            .is_err());
        assert_eq!(backend.live_resources(), 0);
        assert!(!registry.contains("debug"));
    }

    #[test]
    fn ensure_primary_recreates_on_resize_only() {
        let mut backend = RecordingBackend::new(800, 600);
        let mut registry = RenderTargetRegistry::new();
        assert!(registry.ensure_primary(&mut backend, 800, 600).unwrap());
        let before = registry.get(StageTarget::Scene).unwrap();
        assert!(!registry.ensure_primary(&mut backend, 800, 600).unwrap());

        assert!(registry.ensure_primary(&mut backend, 1280, 720).unwrap());
        let after = registry.get(StageTarget::Scene).unwrap();
        assert_eq!((after.width, after.height), (1280, 720));
        assert!(after.depth_texture.is_some() && after.hdr);
        assert!(!backend.is_live(before.color));
        assert_eq!(backend.live_resources(), 4);
    }

    #[test]
    fn ensure_primary_ignores_zero_sized_viewport() {
        let mut backend = RecordingBackend::new(800, 600);
        let mut registry = RenderTargetRegistry::new();
        let _ = registry.ensure_primary(&mut backend, 800, 600).unwrap();
        assert!(!registry.ensure_primary(&mut backend, 0, 0).unwrap());
        assert_eq!(registry.get("scene").unwrap().width, 800);
    }

    #[test]
    fn release_all_frees_everything() {
        let mut backend = RecordingBackend::new(800, 600);
        let mut registry = RenderTargetRegistry::new();
        for stage in StageTarget::DOWNSAMPLE {
            let size = stage.fixed_size().unwrap();
            let _ = registry
                .create_or_replace(&mut backend, stage, size, size, true, false)
                .unwrap();
        }
        assert_eq!(registry.len(), 7);
        registry.release_all(&mut backend);
        assert!(registry.is_empty());
        assert_eq!(backend.live_resources(), 0);
    }

    #[test]
    fn bind_helpers_map_to_backend_state() {
        let mut backend = RecordingBackend::new(800, 600);
        let mut registry = RenderTargetRegistry::new();
        let target = registry
            .create_or_replace(&mut backend, "scene", 320, 200, true, true)
            .unwrap();
        let flat = registry
            .create_or_replace(&mut backend, "flat", 16, 16, false, false)
            .unwrap();
        backend.clear_log();

        target.bind(&mut backend);
        assert_eq!(backend.bound_framebuffer(), Some(target.framebuffer));
        target.bind_texture(&mut backend, 0);
        target.bind_depth_texture(&mut backend, 2);
        flat.bind_depth_texture(&mut backend, 3);
        target.unbind_texture(&mut backend, 0);
        target.unbind(&mut backend);

        assert_eq!(backend.bound_framebuffer(), None);
        assert_eq!(
            backend.commands,
            vec![
                Command::BindFramebuffer(Some(target.framebuffer)),
                Command::BindTexture(0, Some(target.color)),
                Command::BindTexture(2, target.depth_texture),
                Command::BindTexture(3, None),
                Command::BindTexture(0, None),
                Command::BindFramebuffer(None),
            ]
        );
        assert_eq!(target.viewport(), Viewport::new(320, 200));
    }
}
