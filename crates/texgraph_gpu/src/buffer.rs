// SPDX-License-Identifier: MIT OR Apache-2.0
//! Reference-counted texture buffers.
//!
//! A [`Buffer`] is a cheap handle: cloning it shares the same texture. The
//! node that produced a buffer is responsible for releasing it through the
//! device; every other holder only ever reads it. Once released, every clone
//! reports [`Buffer::is_valid`] as `false`, so a stale port reference can be
//! detected instead of sampled.

use crate::format::PixelFormat;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Device-side texture handle. Zero is never a real texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TextureId(pub u64);

impl TextureId {
    /// The "no data yet" sentinel
    pub const INVALID: Self = Self(0);

    /// Whether this id can refer to a texture
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

#[derive(Debug)]
struct BufferInner {
    id: TextureId,
    width: u32,
    height: u32,
    format: PixelFormat,
    released: AtomicBool,
}

/// Shared handle to a texture
#[derive(Debug, Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    /// Wrap a device texture. Called by [`GpuDevice`](crate::GpuDevice) implementations.
    pub fn new(id: TextureId, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                id,
                width,
                height,
                format,
                released: AtomicBool::new(false),
            }),
        }
    }

    /// A buffer that holds no texture
    pub fn invalid() -> Self {
        Self::new(TextureId::INVALID, 0, 0, PixelFormat::default())
    }

    /// Texture id
    pub fn id(&self) -> TextureId {
        self.inner.id
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.inner.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.inner.height
    }

    /// Pixel format
    pub fn format(&self) -> PixelFormat {
        self.inner.format
    }

    /// Whether the buffer refers to a live texture
    pub fn is_valid(&self) -> bool {
        self.inner.id.is_valid() && !self.inner.released.load(Ordering::Acquire)
    }

    /// Whether the texture was released by its owner
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Flag the texture as released for every clone of this handle.
    ///
    /// Devices call this from `release_texture`.
    pub fn mark_released(&self) {
        self.inner.released.store(true, Ordering::Release);
    }

    /// Whether this buffer matches the requested storage
    pub fn matches(&self, width: u32, height: u32, format: PixelFormat) -> bool {
        self.inner.width == width && self.inner.height == height && self.inner.format == format
    }

    /// Whether both handles share the same texture
    pub fn same_texture(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.same_texture(other)
    }
}

impl Eq for Buffer {}
