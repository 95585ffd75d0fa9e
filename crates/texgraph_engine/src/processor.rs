// SPDX-License-Identifier: MIT OR Apache-2.0
//! GPU processors driving operator programs.
//!
//! A processor follows an explicit `process -> complete -> release`
//! lifecycle. `process` only issues work, `complete` is the synchronization
//! point callers must reach before reading results, and `release` frees the
//! program once the owning node goes away.

use crate::error::ProcessError;
use crate::operators::ImageOperator;
use texgraph_gpu::{Buffer, GpuDevice, ProgramId, UniformValue, Uniforms};

/// GPU operator contract
pub trait Processor {
    /// Issue the work writing `output` from `input`
    fn process(
        &mut self,
        device: &dyn GpuDevice,
        width: u32,
        height: u32,
        input: Option<&Buffer>,
        output: &Buffer,
    ) -> Result<(), ProcessError>;

    /// Wait for issued work
    fn complete(&mut self, device: &dyn GpuDevice);

    /// Free device resources; the processor is unusable afterwards
    fn release(&mut self, device: &dyn GpuDevice);
}

/// Processor drawing one program as a full-screen pass
#[derive(Debug)]
pub struct ShaderProcessor {
    name: &'static str,
    program: Option<ProgramId>,
    uniforms: Uniforms,
    /// Horizontal repetition of the input
    pub tile_x: f32,
    /// Vertical repetition of the input
    pub tile_y: f32,
}

impl ShaderProcessor {
    /// Load `name` on the device; `None` when the program is unavailable
    pub fn load(device: &dyn GpuDevice, name: &'static str) -> Option<Self> {
        let program = device.load_program(name)?;
        Some(Self {
            name,
            program: Some(program),
            uniforms: Uniforms::new(),
            tile_x: 1.0,
            tile_y: 1.0,
        })
    }

    /// Program name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Replace bound uniforms with the operator's values
    pub fn bind(&mut self, operator: &dyn ImageOperator) {
        self.uniforms = Uniforms::new();
        operator.bind(&mut self.uniforms);
    }

    /// Uniforms bound for the next draw
    pub fn uniforms(&self) -> &Uniforms {
        &self.uniforms
    }
}

impl Processor for ShaderProcessor {
    fn process(
        &mut self,
        device: &dyn GpuDevice,
        width: u32,
        height: u32,
        input: Option<&Buffer>,
        output: &Buffer,
    ) -> Result<(), ProcessError> {
        let program = self.program.ok_or(ProcessError::MissingProcessor(self.name))?;

        if let Some(input) = input {
            if !input.is_valid() {
                return Err(ProcessError::MalformedInput);
            }
            self.uniforms.set("MainTex", UniformValue::Int(0));
        }

        self.uniforms.set("tiling", UniformValue::Vec2([self.tile_x, self.tile_y]));
        self.uniforms.set("width", UniformValue::Float(width as f32));
        self.uniforms.set("height", UniformValue::Float(height as f32));

        device.draw(program, &self.uniforms, input, output)?;
        Ok(())
    }

    fn complete(&mut self, device: &dyn GpuDevice) {
        device.finish();
    }

    fn release(&mut self, device: &dyn GpuDevice) {
        if let Some(program) = self.program.take() {
            device.release_program(program);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::InvertNode;
    use texgraph_gpu::{PixelFormat, SoftwareDevice};

    #[test]
    fn test_lifecycle() {
        let device = SoftwareDevice::new();
        let mut processor = ShaderProcessor::load(&device, "invert").unwrap();
        processor.bind(&InvertNode::default());
        processor.tile_x = 2.0;

        let input = device.create_texture(4, 4, PixelFormat::Rgba).unwrap();
        let output = device.create_texture(4, 4, PixelFormat::Rgba).unwrap();
        processor.process(&device, 4, 4, Some(&input), &output).unwrap();
        processor.complete(&device);

        assert_eq!(processor.uniforms().vec2("tiling"), Some([2.0, 1.0]));
        assert_eq!(device.finish_count(), 1);

        processor.release(&device);
        assert_eq!(device.program_count(), 0);
        assert!(matches!(
            processor.process(&device, 4, 4, Some(&input), &output),
            Err(ProcessError::MissingProcessor("invert"))
        ));
    }

    #[test]
    fn test_malformed_input() {
        let device = SoftwareDevice::new();
        let mut processor = ShaderProcessor::load(&device, "invert").unwrap();
        let output = device.create_texture(4, 4, PixelFormat::Rgba).unwrap();
        let result = processor.process(&device, 4, 4, Some(&texgraph_gpu::Buffer::invalid()), &output);
        assert!(matches!(result, Err(ProcessError::MalformedInput)));
    }

    #[test]
    fn test_missing_program() {
        let device = SoftwareDevice::new().without_program("emboss");
        assert!(ShaderProcessor::load(&device, "emboss").is_none());
    }
}
