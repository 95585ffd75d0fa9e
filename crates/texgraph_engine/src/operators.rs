// SPDX-License-Identifier: MIT OR Apache-2.0
//! Image operator node kinds.
//!
//! Each operator is a thin parameter set over a device program: it lists its
//! promotable properties, accepts typed assignments, and binds its values as
//! uniforms before the full-screen draw.

use crate::params::ParamValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use texgraph_gpu::{UniformValue, Uniforms};

/// Failure assigning an operator property
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParamError {
    /// No property with that name
    #[error("unknown parameter")]
    Unknown,
    /// Value cannot be converted to the property type
    #[error("type mismatch")]
    TypeMismatch,
}

/// Parameters and uniform binding of one operator kind
pub trait ImageOperator: fmt::Debug + Send + Sync {
    /// Program drawn by the operator
    fn program(&self) -> &'static str;

    /// Promotable properties with their current values, in display order
    fn params(&self) -> Vec<(&'static str, ParamValue)>;

    /// Assign a property
    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<(), ParamError>;

    /// Bind property values as uniforms
    fn bind(&self, uniforms: &mut Uniforms);

    /// Whether the program samples an input image
    fn samples_input(&self) -> bool {
        true
    }

    /// Clone behind a box
    fn boxed_clone(&self) -> Box<dyn ImageOperator>;
}

fn to_bool(value: &ParamValue) -> Result<bool, ParamError> {
    value.as_bool().ok_or(ParamError::TypeMismatch)
}

fn to_float(value: &ParamValue) -> Result<f32, ParamError> {
    value.as_float().ok_or(ParamError::TypeMismatch)
}

/// Uniform color generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillNode {
    /// Fill color
    pub color: [f32; 4],
}

impl Default for FillNode {
    fn default() -> Self {
        Self {
            color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl ImageOperator for FillNode {
    fn program(&self) -> &'static str {
        "uniform_color"
    }

    fn params(&self) -> Vec<(&'static str, ParamValue)> {
        vec![("Color", ParamValue::Color(self.color))]
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<(), ParamError> {
        match name {
            "Color" => self.color = value.as_vector4().ok_or(ParamError::TypeMismatch)?,
            _ => return Err(ParamError::Unknown),
        }
        Ok(())
    }

    fn bind(&self, uniforms: &mut Uniforms) {
        uniforms.set("color", UniformValue::Vec4(self.color));
    }

    fn samples_input(&self) -> bool {
        false
    }

    fn boxed_clone(&self) -> Box<dyn ImageOperator> {
        Box::new(self.clone())
    }
}

/// Per-channel inversion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvertNode {
    /// Invert red
    pub red: bool,
    /// Invert green
    pub green: bool,
    /// Invert blue
    pub blue: bool,
    /// Invert alpha
    pub alpha: bool,
}

impl Default for InvertNode {
    fn default() -> Self {
        Self {
            red: true,
            green: true,
            blue: true,
            alpha: false,
        }
    }
}

impl ImageOperator for InvertNode {
    fn program(&self) -> &'static str {
        "invert"
    }

    fn params(&self) -> Vec<(&'static str, ParamValue)> {
        vec![
            ("Red", ParamValue::Bool(self.red)),
            ("Green", ParamValue::Bool(self.green)),
            ("Blue", ParamValue::Bool(self.blue)),
            ("Alpha", ParamValue::Bool(self.alpha)),
        ]
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<(), ParamError> {
        match name {
            "Red" => self.red = to_bool(value)?,
            "Green" => self.green = to_bool(value)?,
            "Blue" => self.blue = to_bool(value)?,
            "Alpha" => self.alpha = to_bool(value)?,
            _ => return Err(ParamError::Unknown),
        }
        Ok(())
    }

    fn bind(&self, uniforms: &mut Uniforms) {
        uniforms.set("invertRed", UniformValue::Bool(self.red));
        uniforms.set("invertGreen", UniformValue::Bool(self.green));
        uniforms.set("invertBlue", UniformValue::Bool(self.blue));
        uniforms.set("invertAlpha", UniformValue::Bool(self.alpha));
    }

    fn boxed_clone(&self) -> Box<dyn ImageOperator> {
        Box::new(self.clone())
    }
}

/// Weighted channel sum to gray
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrayscaleNode {
    /// Channel weights
    pub weight: [f32; 4],
}

impl Default for GrayscaleNode {
    fn default() -> Self {
        Self {
            weight: [1.0, 0.0, 0.0, 0.0],
        }
    }
}

impl ImageOperator for GrayscaleNode {
    fn program(&self) -> &'static str {
        "grayscale"
    }

    fn params(&self) -> Vec<(&'static str, ParamValue)> {
        vec![("Weight", ParamValue::Vector4(self.weight))]
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<(), ParamError> {
        match name {
            "Weight" => self.weight = value.as_vector4().ok_or(ParamError::TypeMismatch)?,
            _ => return Err(ParamError::Unknown),
        }
        Ok(())
    }

    fn bind(&self, uniforms: &mut Uniforms) {
        uniforms.set("weight", UniformValue::Vec4(self.weight));
    }

    fn boxed_clone(&self) -> Box<dyn ImageOperator> {
        Box::new(self.clone())
    }
}

/// Directional relief
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbossNode {
    /// Light direction around the surface, degrees
    pub azimuth: f32,
    /// Light height above the surface, degrees
    pub elevation: f32,
}

impl Default for EmbossNode {
    fn default() -> Self {
        Self {
            azimuth: 0.0,
            elevation: 45.0,
        }
    }
}

impl ImageOperator for EmbossNode {
    fn program(&self) -> &'static str {
        "emboss"
    }

    fn params(&self) -> Vec<(&'static str, ParamValue)> {
        vec![
            ("Azimuth", ParamValue::Float(self.azimuth)),
            ("Elevation", ParamValue::Float(self.elevation)),
        ]
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<(), ParamError> {
        match name {
            "Azimuth" => self.azimuth = to_float(value)?,
            "Elevation" => self.elevation = to_float(value)?,
            _ => return Err(ParamError::Unknown),
        }
        Ok(())
    }

    fn bind(&self, uniforms: &mut Uniforms) {
        uniforms.set("azimuth", UniformValue::Float(self.azimuth));
        uniforms.set("elevation", UniformValue::Float(self.elevation));
    }

    fn boxed_clone(&self) -> Box<dyn ImageOperator> {
        Box::new(self.clone())
    }
}

/// Input/output range remapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelsNode {
    /// Input black point per channel
    pub min: [f32; 3],
    /// Midtone per channel
    pub mid: [f32; 3],
    /// Input white point per channel
    pub max: [f32; 3],
    /// Output range
    pub value: [f32; 2],
}

impl Default for LevelsNode {
    fn default() -> Self {
        Self {
            min: [0.0; 3],
            mid: [0.5; 3],
            max: [1.0; 3],
            value: [0.0, 1.0],
        }
    }
}

impl ImageOperator for LevelsNode {
    fn program(&self) -> &'static str {
        "levels"
    }

    fn params(&self) -> Vec<(&'static str, ParamValue)> {
        vec![
            ("Min", ParamValue::Vector3(self.min)),
            ("Mid", ParamValue::Vector3(self.mid)),
            ("Max", ParamValue::Vector3(self.max)),
            ("Value", ParamValue::Vector2(self.value)),
        ]
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<(), ParamError> {
        let vec3 = || value.as_vector3().ok_or(ParamError::TypeMismatch);
        match name {
            "Min" => self.min = vec3()?,
            "Mid" => self.mid = vec3()?,
            "Max" => self.max = vec3()?,
            "Value" => self.value = value.as_vector2().ok_or(ParamError::TypeMismatch)?,
            _ => return Err(ParamError::Unknown),
        }
        Ok(())
    }

    fn bind(&self, uniforms: &mut Uniforms) {
        uniforms.set("minValues", UniformValue::Vec3(self.min));
        uniforms.set("midValues", UniformValue::Vec3(self.mid));
        uniforms.set("maxValues", UniformValue::Vec3(self.max));
        uniforms.set("value", UniformValue::Vec2(self.value));
    }

    fn boxed_clone(&self) -> Box<dyn ImageOperator> {
        Box::new(self.clone())
    }
}

/// Height to tangent-space normal map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalsNode {
    /// Slope multiplier
    pub intensity: f32,
    /// Flip green for DirectX conventions
    pub directx: bool,
    /// Damping applied to the slope
    pub noise_reduction: f32,
}

impl Default for NormalsNode {
    fn default() -> Self {
        Self {
            intensity: 8.0,
            directx: false,
            noise_reduction: 1.0,
        }
    }
}

impl ImageOperator for NormalsNode {
    fn program(&self) -> &'static str {
        "normals"
    }

    fn params(&self) -> Vec<(&'static str, ParamValue)> {
        vec![
            ("Intensity", ParamValue::Float(self.intensity)),
            ("DirectX", ParamValue::Bool(self.directx)),
            ("NoiseReduction", ParamValue::Float(self.noise_reduction)),
        ]
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<(), ParamError> {
        match name {
            "Intensity" => self.intensity = to_float(value)?,
            "DirectX" => self.directx = to_bool(value)?,
            "NoiseReduction" => self.noise_reduction = to_float(value)?,
            _ => return Err(ParamError::Unknown),
        }
        Ok(())
    }

    fn bind(&self, uniforms: &mut Uniforms) {
        uniforms.set("intensity", UniformValue::Float(self.intensity));
        uniforms.set("directx", UniformValue::Bool(self.directx));
        uniforms.set("reduce", UniformValue::Float(self.noise_reduction));
    }

    fn boxed_clone(&self) -> Box<dyn ImageOperator> {
        Box::new(self.clone())
    }
}

/// Role of a graph output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    /// Albedo
    #[default]
    BaseColor,
    /// Height
    Height,
    /// Ambient occlusion
    Occlusion,
    /// Roughness
    Roughness,
    /// Metallic
    Metallic,
    /// Normal map
    Normal,
    /// Thickness
    Thickness,
    /// Emission
    Emission,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invert_params() {
        let mut invert = InvertNode::default();
        assert_eq!(invert.params()[3], ("Alpha", ParamValue::Bool(false)));

        invert.set_param("Alpha", &ParamValue::Int(1)).unwrap();
        assert!(invert.alpha);
        assert_eq!(invert.set_param("Gamma", &ParamValue::Bool(true)), Err(ParamError::Unknown));
        assert_eq!(
            invert.set_param("Red", &ParamValue::Vector2([0.0, 0.0])),
            Err(ParamError::TypeMismatch)
        );

        let mut uniforms = Uniforms::new();
        invert.bind(&mut uniforms);
        assert_eq!(uniforms.bool("invertAlpha"), Some(true));
    }

    #[test]
    fn test_levels_binding() {
        let mut levels = LevelsNode::default();
        levels.set_param("Max", &ParamValue::Float(0.5)).unwrap();
        assert_eq!(levels.max, [0.5; 3]);

        let mut uniforms = Uniforms::new();
        levels.bind(&mut uniforms);
        assert_eq!(uniforms.vec3("maxValues"), Some([0.5; 3]));
        assert_eq!(uniforms.vec2("value"), Some([0.0, 1.0]));
    }

    #[test]
    fn test_fill_does_not_sample() {
        let fill = FillNode::default();
        assert!(!fill.samples_input());
        assert!(NormalsNode::default().samples_input());
    }

    #[test]
    fn test_output_type_serde() {
        let json = serde_json::to_string(&OutputType::BaseColor).unwrap();
        assert_eq!(json, "\"basecolor\"");
    }
}
