// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pixel formats for graph buffers.

use serde::{Deserialize, Serialize};

/// Storage format of a texture buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 16-bit float luminance
    Luminance16F,
    /// 32-bit float luminance
    Luminance32F,
    /// 8-bit RGB
    Rgb,
    /// 16-bit float RGB
    Rgb16F,
    /// 32-bit float RGB
    Rgb32F,
    /// 8-bit RGBA
    #[default]
    Rgba,
    /// 16-bit float RGBA
    Rgba16F,
    /// 32-bit float RGBA
    Rgba32F,
    /// Legacy 8-bit single channel, kept for reading old graphs
    Gray,
}

impl PixelFormat {
    /// Number of channels stored per texel
    pub fn channels(&self) -> u32 {
        match self {
            Self::Luminance16F | Self::Luminance32F | Self::Gray => 1,
            Self::Rgb | Self::Rgb16F | Self::Rgb32F => 3,
            Self::Rgba | Self::Rgba16F | Self::Rgba32F => 4,
        }
    }

    /// Whether the format may back a sub-graph instance.
    ///
    /// Older graphs could carry formats that instances never supported.
    pub fn is_instance_compatible(&self) -> bool {
        !matches!(self, Self::Gray)
    }

    /// Whether this is a single-channel format
    pub fn is_grayscale(&self) -> bool {
        self.channels() == 1
    }
}
