// SPDX-License-Identifier: MIT OR Apache-2.0
//! GPU abstraction for the texgraph engine.
//!
//! The engine never talks to a graphics API directly. It consumes the
//! [`GpuDevice`] trait, which exposes exactly what a texture graph needs:
//! - Texture allocation and explicit release
//! - Program (shader) loading, with failure reported as `None`
//! - Full-screen draws from a source texture into a target texture
//! - An explicit `finish` synchronization point and read-back
//!
//! [`SoftwareDevice`] implements the standard operator programs on the CPU.
//! It is deterministic, which makes it the device of choice for tests and
//! headless runs.

pub mod buffer;
pub mod device;
pub mod format;
pub mod software;
pub mod uniforms;

pub use buffer::{Buffer, TextureId};
pub use device::{GpuDevice, GpuError, ProgramId};
pub use format::PixelFormat;
pub use software::{DrawRecord, SoftwareDevice};
pub use uniforms::{UniformValue, Uniforms};
