// SPDX-License-Identifier: MIT OR Apache-2.0
//! The device trait the engine drives.
//!
//! Methods take `&self` the way graphics API device handles do. GPU state is
//! not thread-shareable: the engine calls a device only from the single
//! execution lane that owns it, and never from a parameter worker.

use crate::buffer::{Buffer, TextureId};
use crate::format::PixelFormat;
use crate::uniforms::Uniforms;

/// Handle to a loaded program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u32);

/// GPU-side failure
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GpuError {
    /// Texture does not exist on this device
    #[error("Unknown texture: {0:?}")]
    UnknownTexture(TextureId),

    /// Texture was released before use
    #[error("Texture was released: {0:?}")]
    ReleasedTexture(TextureId),

    /// Program does not exist on this device
    #[error("Unknown program: {0:?}")]
    UnknownProgram(ProgramId),

    /// Requested dimensions cannot be allocated
    #[error("Invalid texture size {width}x{height}")]
    InvalidSize {
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
    },
}

/// Opaque GPU capability consumed by the engine
pub trait GpuDevice {
    /// Allocate a texture
    fn create_texture(&self, width: u32, height: u32, format: PixelFormat) -> Result<Buffer, GpuError>;

    /// Free a texture and mark every handle to it as released
    fn release_texture(&self, buffer: &Buffer);

    /// Load a program by name; `None` when it fails to compile or is unknown
    fn load_program(&self, name: &str) -> Option<ProgramId>;

    /// Free a program
    fn release_program(&self, program: ProgramId);

    /// Draw a full-screen quad with `program` sampling `source` into `target`
    fn draw(
        &self,
        program: ProgramId,
        uniforms: &Uniforms,
        source: Option<&Buffer>,
        target: &Buffer,
    ) -> Result<(), GpuError>;

    /// Block until all issued work is done
    fn finish(&self);

    /// Read texels back as linear RGBA floats
    fn read_texels(&self, buffer: &Buffer) -> Result<Vec<[f32; 4]>, GpuError>;

    /// Read texels back as RGBA8, resampled to `width` x `height`
    fn read_rgba8(&self, buffer: &Buffer, width: u32, height: u32) -> Result<Vec<u8>, GpuError>;

    /// Number of textures allocated and not yet released
    fn live_textures(&self) -> usize;
}
