// SPDX-License-Identifier: MIT OR Apache-2.0
//! Uniform values bound to a program before a draw.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A single uniform value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum UniformValue {
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i32),
    /// Float
    Float(f32),
    /// 2D vector
    Vec2([f32; 2]),
    /// 3D vector
    Vec3([f32; 3]),
    /// 4D vector
    Vec4([f32; 4]),
}

/// Ordered set of named uniforms
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Uniforms {
    values: IndexMap<String, UniformValue>,
}

impl Uniforms {
    /// Create an empty uniform set
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a value, replacing any previous one
    pub fn set(&mut self, name: impl Into<String>, value: UniformValue) {
        self.values.insert(name.into(), value);
    }

    /// Builder form of [`Uniforms::set`]
    pub fn with(mut self, name: impl Into<String>, value: UniformValue) -> Self {
        self.set(name, value);
        self
    }

    /// Get a bound value
    pub fn get(&self, name: &str) -> Option<UniformValue> {
        self.values.get(name).copied()
    }

    /// Read a boolean, accepting ints as truthy
    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            UniformValue::Bool(b) => Some(b),
            UniformValue::Int(i) => Some(i != 0),
            _ => None,
        }
    }

    /// Read a float
    pub fn float(&self, name: &str) -> Option<f32> {
        match self.get(name)? {
            UniformValue::Float(f) => Some(f),
            UniformValue::Int(i) => Some(i as f32),
            _ => None,
        }
    }

    /// Read a 2D vector
    pub fn vec2(&self, name: &str) -> Option<[f32; 2]> {
        match self.get(name)? {
            UniformValue::Vec2(v) => Some(v),
            _ => None,
        }
    }

    /// Read a 3D vector
    pub fn vec3(&self, name: &str) -> Option<[f32; 3]> {
        match self.get(name)? {
            UniformValue::Vec3(v) => Some(v),
            _ => None,
        }
    }

    /// Read a 4D vector
    pub fn vec4(&self, name: &str) -> Option<[f32; 4]> {
        match self.get(name)? {
            UniformValue::Vec4(v) => Some(v),
            _ => None,
        }
    }

    /// Number of bound uniforms
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing is bound
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate in binding order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &UniformValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}
