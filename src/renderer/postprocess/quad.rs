//! The single full-screen quad every pass draws.

use glam::Mat4;

use crate::error::PostFxError;
use crate::gpu::backend::{MeshHandle, QuadVertex, RenderBackend};

/// NDC [-1,1]² with UV [0,1]², in triangle-strip order.
pub const QUAD_VERTICES: [QuadVertex; 4] = [
    QuadVertex {
        position: [-1.0, -1.0],
        uv: [0.0, 0.0],
    },
    QuadVertex {
        position: [1.0, -1.0],
        uv: [1.0, 0.0],
    },
    QuadVertex {
        position: [-1.0, 1.0],
        uv: [0.0, 1.0],
    },
    QuadVertex {
        position: [1.0, 1.0],
        uv: [1.0, 1.0],
    },
];

/// Lazily uploaded quad drawn with a fixed orthographic projection.
#[derive(Debug)]
pub struct FullScreenQuad {
    mesh: Option<MeshHandle>,
    projection: Mat4,
}

impl Default for FullScreenQuad {
    fn default() -> Self {
        Self::new()
    }
}

impl FullScreenQuad {
    /// A quad that has not been uploaded yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mesh: None,
            projection: Mat4::orthographic_rh(-1.0, 1.0, -1.0, 1.0, -1.0, 1.0),
        }
    }

    /// Projection passed with every draw. Maps the quad's NDC rectangle
    /// onto itself.
    #[must_use]
    pub fn projection(&self) -> Mat4 {
        self.projection
    }

    /// Draw the quad with the backend's current state, uploading it on
    /// first use.
    ///
    /// # Errors
    ///
    /// Propagates mesh creation or draw failures from the backend.
    pub fn render<B: RenderBackend + ?Sized>(
        &mut self,
        backend: &mut B,
    ) -> Result<(), PostFxError> {
        let mesh = match self.mesh {
            Some(mesh) => mesh,
            None => {
                let mesh = backend.create_quad_mesh(&QUAD_VERTICES)?;
                self.mesh = Some(mesh);
                mesh
            }
        };
        backend.draw_quad(mesh, &self.projection)
    }

    /// Delete the uploaded mesh, if any.
    pub fn release<B: RenderBackend + ?Sized>(&mut self, backend: &mut B) {
        if let Some(mesh) = self.mesh.take() {
            backend.delete_quad_mesh(mesh);
        }
    }
}
