// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic CPU implementation of [`GpuDevice`].
//!
//! Every standard operator program is evaluated per texel with nearest
//! sampling. Results are bit-reproducible, and the device keeps a log of
//! draws so callers can check execution order and count live textures.

use crate::buffer::{Buffer, TextureId};
use crate::device::{GpuDevice, GpuError, ProgramId};
use crate::format::PixelFormat;
use crate::uniforms::Uniforms;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// One issued draw call
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    /// Name the program was loaded with
    pub program: String,
    /// Sampled texture, if any
    pub source: Option<TextureId>,
    /// Written texture
    pub target: TextureId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Program {
    UniformColor,
    Invert,
    Grayscale,
    Emboss,
    Levels,
    Normals,
}

impl Program {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "uniform_color" => Some(Self::UniformColor),
            "invert" => Some(Self::Invert),
            "grayscale" => Some(Self::Grayscale),
            "emboss" => Some(Self::Emboss),
            "levels" => Some(Self::Levels),
            "normals" => Some(Self::Normals),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::UniformColor => "uniform_color",
            Self::Invert => "invert",
            Self::Grayscale => "grayscale",
            Self::Emboss => "emboss",
            Self::Levels => "levels",
            Self::Normals => "normals",
        }
    }
}

struct Texture {
    width: u32,
    height: u32,
    texels: Vec<[f32; 4]>,
}

impl Texture {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            texels: vec![[0.0; 4]; (width * height) as usize],
        }
    }

    fn texel_wrapped(&self, x: i64, y: i64) -> [f32; 4] {
        let w = i64::from(self.width);
        let h = i64::from(self.height);
        let xi = x.rem_euclid(w) as usize;
        let yi = y.rem_euclid(h) as usize;
        self.texels[yi * self.width as usize + xi]
    }

    fn luminance(&self, x: i64, y: i64) -> f32 {
        let t = self.texel_wrapped(x, y);
        0.299 * t[0] + 0.587 * t[1] + 0.114 * t[2]
    }
}

#[derive(Default)]
struct State {
    next_texture: u64,
    next_program: u32,
    textures: HashMap<TextureId, Texture>,
    programs: HashMap<ProgramId, Program>,
    unavailable: HashSet<String>,
    draws: Vec<DrawRecord>,
    finishes: usize,
}

/// CPU device with deterministic output
#[derive(Default)]
pub struct SoftwareDevice {
    state: Mutex<State>,
}

impl SoftwareDevice {
    /// Create a device with every standard program available
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a program that fails to load
    pub fn without_program(self, name: &str) -> Self {
        self.state.lock().unavailable.insert(name.to_string());
        self
    }

    /// Make a program fail to load from now on
    pub fn disable_program(&self, name: &str) {
        self.state.lock().unavailable.insert(name.to_string());
    }

    /// Draws issued so far, oldest first
    pub fn draw_log(&self) -> Vec<DrawRecord> {
        self.state.lock().draws.clone()
    }

    /// Forget the draw log
    pub fn clear_draw_log(&self) {
        self.state.lock().draws.clear();
    }

    /// Number of `finish` calls
    pub fn finish_count(&self) -> usize {
        self.state.lock().finishes
    }

    /// Number of loaded programs
    pub fn program_count(&self) -> usize {
        self.state.lock().programs.len()
    }
}

impl GpuDevice for SoftwareDevice {
    fn create_texture(&self, width: u32, height: u32, format: PixelFormat) -> Result<Buffer, GpuError> {
        if width == 0 || height == 0 {
            return Err(GpuError::InvalidSize { width, height });
        }

        let mut state = self.state.lock();
        state.next_texture += 1;
        let id = TextureId(state.next_texture);
        state.textures.insert(id, Texture::new(width, height));
        tracing::trace!("software device allocated {:?} ({}x{})", id, width, height);
        Ok(Buffer::new(id, width, height, format))
    }

    fn release_texture(&self, buffer: &Buffer) {
        if buffer.is_released() {
            return;
        }
        buffer.mark_released();
        self.state.lock().textures.remove(&buffer.id());
    }

    fn load_program(&self, name: &str) -> Option<ProgramId> {
        let mut state = self.state.lock();
        if state.unavailable.contains(name) {
            tracing::warn!("Program '{}' failed to load", name);
            return None;
        }
        let program = Program::from_name(name)?;
        state.next_program += 1;
        let id = ProgramId(state.next_program);
        state.programs.insert(id, program);
        Some(id)
    }

    fn release_program(&self, program: ProgramId) {
        self.state.lock().programs.remove(&program);
    }

    fn draw(
        &self,
        program: ProgramId,
        uniforms: &Uniforms,
        source: Option<&Buffer>,
        target: &Buffer,
    ) -> Result<(), GpuError> {
        let mut state = self.state.lock();

        let kind = *state
            .programs
            .get(&program)
            .ok_or(GpuError::UnknownProgram(program))?;

        if target.is_released() {
            return Err(GpuError::ReleasedTexture(target.id()));
        }
        let (tw, th) = {
            let t = state
                .textures
                .get(&target.id())
                .ok_or(GpuError::UnknownTexture(target.id()))?;
            (t.width, t.height)
        };

        let source_tex = match source {
            Some(src) if src.is_released() => return Err(GpuError::ReleasedTexture(src.id())),
            Some(src) => Some(
                state
                    .textures
                    .get(&src.id())
                    .ok_or(GpuError::UnknownTexture(src.id()))?,
            ),
            None => None,
        };

        let tiling = uniforms.vec2("tiling").unwrap_or([1.0, 1.0]);
        let mut out = Vec::with_capacity((tw * th) as usize);

        for y in 0..th {
            for x in 0..tw {
                let (sx, sy) = match source_tex {
                    Some(src) => {
                        let u = ((x as f32 + 0.5) / tw as f32 * tiling[0]).fract();
                        let v = ((y as f32 + 0.5) / th as f32 * tiling[1]).fract();
                        (
                            ((u * src.width as f32) as i64).min(i64::from(src.width) - 1),
                            ((v * src.height as f32) as i64).min(i64::from(src.height) - 1),
                        )
                    }
                    None => (i64::from(x), i64::from(y)),
                };
                let texel = source_tex
                    .map(|src| src.texel_wrapped(sx, sy))
                    .unwrap_or([0.0; 4]);
                out.push(shade(kind, uniforms, texel, source_tex, sx, sy));
            }
        }

        if let Some(t) = state.textures.get_mut(&target.id()) {
            t.texels = out;
        }

        state.draws.push(DrawRecord {
            program: kind.name().to_string(),
            source: source.map(Buffer::id),
            target: target.id(),
        });
        Ok(())
    }

    fn finish(&self) {
        self.state.lock().finishes += 1;
    }

    fn read_texels(&self, buffer: &Buffer) -> Result<Vec<[f32; 4]>, GpuError> {
        if buffer.is_released() {
            return Err(GpuError::ReleasedTexture(buffer.id()));
        }
        let state = self.state.lock();
        let texture = state
            .textures
            .get(&buffer.id())
            .ok_or(GpuError::UnknownTexture(buffer.id()))?;
        Ok(texture.texels.clone())
    }

    fn read_rgba8(&self, buffer: &Buffer, width: u32, height: u32) -> Result<Vec<u8>, GpuError> {
        if width == 0 || height == 0 {
            return Err(GpuError::InvalidSize { width, height });
        }
        if buffer.is_released() {
            return Err(GpuError::ReleasedTexture(buffer.id()));
        }
        let state = self.state.lock();
        let texture = state
            .textures
            .get(&buffer.id())
            .ok_or(GpuError::UnknownTexture(buffer.id()))?;

        let mut bytes = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                let sx = u64::from(x) * u64::from(texture.width) / u64::from(width);
                let sy = u64::from(y) * u64::from(texture.height) / u64::from(height);
                let t = texture.texel_wrapped(sx as i64, sy as i64);
                bytes.extend(t.iter().map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8));
            }
        }
        Ok(bytes)
    }

    fn live_textures(&self) -> usize {
        self.state.lock().textures.len()
    }
}

fn shade(
    program: Program,
    uniforms: &Uniforms,
    texel: [f32; 4],
    source: Option<&Texture>,
    sx: i64,
    sy: i64,
) -> [f32; 4] {
    match program {
        Program::UniformColor => uniforms.vec4("color").unwrap_or([0.0, 0.0, 0.0, 1.0]),
        Program::Invert => {
            let flags = [
                uniforms.bool("invertRed").unwrap_or(true),
                uniforms.bool("invertGreen").unwrap_or(true),
                uniforms.bool("invertBlue").unwrap_or(true),
                uniforms.bool("invertAlpha").unwrap_or(false),
            ];
            let mut out = texel;
            for (c, flip) in out.iter_mut().zip(flags) {
                if flip {
                    *c = 1.0 - *c;
                }
            }
            out
        }
        Program::Grayscale => {
            let w = uniforms.vec4("weight").unwrap_or([1.0, 0.0, 0.0, 0.0]);
            let g = texel[0] * w[0] + texel[1] * w[1] + texel[2] * w[2] + texel[3] * w[3];
            [g, g, g, 1.0]
        }
        Program::Levels => {
            let min = uniforms.vec3("minValues").unwrap_or([0.0; 3]);
            let mid = uniforms.vec3("midValues").unwrap_or([0.5; 3]);
            let max = uniforms.vec3("maxValues").unwrap_or([1.0; 3]);
            let value = uniforms.vec2("value").unwrap_or([0.0, 1.0]);
            let mut out = texel;
            for i in 0..3 {
                let range = (max[i] - min[i]).max(f32::EPSILON);
                let t = ((texel[i] - min[i]) / range).clamp(0.0, 1.0);
                let gamma = (mid[i].clamp(0.01, 0.99)).ln() / 0.5f32.ln();
                out[i] = value[0] + t.powf(gamma) * (value[1] - value[0]);
            }
            out
        }
        Program::Emboss => {
            let Some(src) = source else {
                return texel;
            };
            let azimuth = uniforms.float("azimuth").unwrap_or(0.0).to_radians();
            let elevation = uniforms.float("elevation").unwrap_or(45.0).to_radians();
            let dx = src.luminance(sx + 1, sy) - src.luminance(sx - 1, sy);
            let dy = src.luminance(sx, sy + 1) - src.luminance(sx, sy - 1);
            let light = [
                azimuth.cos() * elevation.cos(),
                azimuth.sin() * elevation.cos(),
                elevation.sin(),
            ];
            let shade = (-dx * light[0] - dy * light[1] + light[2]).clamp(0.0, 1.0);
            [shade, shade, shade, texel[3]]
        }
        Program::Normals => {
            let Some(src) = source else {
                return texel;
            };
            let intensity = uniforms.float("intensity").unwrap_or(8.0);
            let reduce = uniforms.float("reduce").unwrap_or(0.0).max(0.0);
            let directx = uniforms.bool("directx").unwrap_or(false);
            let strength = intensity / (1.0 + reduce);
            let dx = (src.luminance(sx + 1, sy) - src.luminance(sx - 1, sy)) * strength;
            let mut dy = (src.luminance(sx, sy + 1) - src.luminance(sx, sy - 1)) * strength;
            if directx {
                dy = -dy;
            }
            let len = (dx * dx + dy * dy + 1.0).sqrt();
            [
                -dx / len * 0.5 + 0.5,
                -dy / len * 0.5 + 0.5,
                1.0 / len * 0.5 + 0.5,
                1.0,
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uniforms::UniformValue;

    fn fill(device: &SoftwareDevice, target: &Buffer, color: [f32; 4]) {
        let program = device.load_program("uniform_color").unwrap();
        let uniforms = Uniforms::new().with("color", UniformValue::Vec4(color));
        device.draw(program, &uniforms, None, target).unwrap();
    }

    #[test]
    fn test_texture_lifecycle() {
        let device = SoftwareDevice::new();
        let a = device.create_texture(4, 4, PixelFormat::Rgba).unwrap();
        let b = device.create_texture(4, 4, PixelFormat::Rgba).unwrap();
        assert_eq!(device.live_textures(), 2);
        assert_ne!(a.id(), b.id());

        device.release_texture(&a);
        assert_eq!(device.live_textures(), 1);
        assert!(!a.is_valid());

        // Releasing twice is harmless
        device.release_texture(&a);
        assert_eq!(device.live_textures(), 1);
    }

    #[test]
    fn test_zero_size_rejected() {
        let device = SoftwareDevice::new();
        assert!(matches!(
            device.create_texture(0, 4, PixelFormat::Rgba),
            Err(GpuError::InvalidSize { .. })
        ));
    }

    #[test]
    fn test_invert_program() {
        let device = SoftwareDevice::new();
        let src = device.create_texture(2, 2, PixelFormat::Rgba).unwrap();
        let dst = device.create_texture(2, 2, PixelFormat::Rgba).unwrap();
        fill(&device, &src, [0.25, 0.5, 1.0, 1.0]);

        let invert = device.load_program("invert").unwrap();
        let uniforms = Uniforms::new()
            .with("invertRed", UniformValue::Bool(true))
            .with("invertGreen", UniformValue::Bool(false))
            .with("invertBlue", UniformValue::Bool(true))
            .with("invertAlpha", UniformValue::Bool(false));
        device.draw(invert, &uniforms, Some(&src), &dst).unwrap();

        let texels = device.read_texels(&dst).unwrap();
        assert_eq!(texels[0], [0.75, 0.5, 0.0, 1.0]);
        assert_eq!(device.draw_log().len(), 2);
    }

    #[test]
    fn test_unavailable_program() {
        let device = SoftwareDevice::new().without_program("levels");
        assert!(device.load_program("levels").is_none());
        assert!(device.load_program("no_such_program").is_none());
        assert!(device.load_program("invert").is_some());
    }

    #[test]
    fn test_draw_from_released_source_fails() {
        let device = SoftwareDevice::new();
        let src = device.create_texture(2, 2, PixelFormat::Rgba).unwrap();
        let dst = device.create_texture(2, 2, PixelFormat::Rgba).unwrap();
        device.release_texture(&src);

        let invert = device.load_program("invert").unwrap();
        let result = device.draw(invert, &Uniforms::new(), Some(&src), &dst);
        assert_eq!(result, Err(GpuError::ReleasedTexture(src.id())));
    }

    #[test]
    fn test_read_rgba8() {
        let device = SoftwareDevice::new();
        let tex = device.create_texture(2, 2, PixelFormat::Rgba).unwrap();
        fill(&device, &tex, [1.0, 0.0, 0.5, 1.0]);
        let bytes = device.read_rgba8(&tex, 1, 1).unwrap();
        assert_eq!(bytes, vec![255, 0, 128, 255]);
    }
}
