// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed parameter values and graph-level parameter entries.
//!
//! A node property promoted into its graph is stored under a [`ParamKey`],
//! the pair of node id and property name written as `"<nodeId>.<name>"` in
//! persisted graphs. Entries may hold a constant or a [`ParamFunction`]
//! computed from other entries, custom parameters, and the graph seed.

use crate::node::NodeId;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Value of a node property or graph parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i32),
    /// Float
    Float(f32),
    /// 2D vector
    Vector2([f32; 2]),
    /// 3D vector
    Vector3([f32; 3]),
    /// 4D vector
    Vector4([f32; 4]),
    /// Color
    Color([f32; 4]),
    /// String
    String(String),
}

impl ParamValue {
    /// Short type name used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Vector2(_) => "vector2",
            Self::Vector3(_) => "vector3",
            Self::Vector4(_) => "vector4",
            Self::Color(_) => "color",
            Self::String(_) => "string",
        }
    }

    /// Read as a boolean; numbers are true when non-zero
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(i) => Some(*i != 0),
            Self::Float(f) => Some(*f != 0.0),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Read as a float
    pub fn as_float(&self) -> Option<f32> {
        match self {
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Int(i) => Some(*i as f32),
            Self::Float(f) => Some(*f),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Read as an integer, truncating floats
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Bool(b) => Some(i32::from(*b)),
            Self::Int(i) => Some(*i),
            Self::Float(f) => Some(*f as i32),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Read as a 2D vector
    pub fn as_vector2(&self) -> Option<[f32; 2]> {
        match self {
            Self::Vector2(v) => Some(*v),
            _ => self.as_float().map(|f| [f; 2]),
        }
    }

    /// Read as a 3D vector
    pub fn as_vector3(&self) -> Option<[f32; 3]> {
        match self {
            Self::Vector3(v) => Some(*v),
            _ => self.as_float().map(|f| [f; 3]),
        }
    }

    /// Read as a 4D vector; colors are accepted
    pub fn as_vector4(&self) -> Option<[f32; 4]> {
        match self {
            Self::Vector4(v) | Self::Color(v) => Some(*v),
            _ => self.as_float().map(|f| [f; 4]),
        }
    }

    /// Convert to the same variant as `template`
    pub fn coerce_like(&self, template: &ParamValue) -> Option<ParamValue> {
        Some(match template {
            Self::Bool(_) => Self::Bool(self.as_bool()?),
            Self::Int(_) => Self::Int(self.as_int()?),
            Self::Float(_) => Self::Float(self.as_float()?),
            Self::Vector2(_) => Self::Vector2(self.as_vector2()?),
            Self::Vector3(_) => Self::Vector3(self.as_vector3()?),
            Self::Vector4(_) => Self::Vector4(self.as_vector4()?),
            Self::Color(_) => Self::Color(self.as_vector4()?),
            Self::String(_) => match self {
                Self::String(s) => Self::String(s.clone()),
                _ => return None,
            },
        })
    }

    fn components(&self) -> Option<Vec<f32>> {
        match self {
            Self::Vector2(v) => Some(v.to_vec()),
            Self::Vector3(v) => Some(v.to_vec()),
            Self::Vector4(v) | Self::Color(v) => Some(v.to_vec()),
            _ => None,
        }
    }

    fn with_components(&self, c: &[f32]) -> Option<ParamValue> {
        Some(match (self, c) {
            (Self::Vector2(_), [x, y]) => Self::Vector2([*x, *y]),
            (Self::Vector3(_), [x, y, z]) => Self::Vector3([*x, *y, *z]),
            (Self::Vector4(_), [x, y, z, w]) => Self::Vector4([*x, *y, *z, *w]),
            (Self::Color(_), [x, y, z, w]) => Self::Color([*x, *y, *z, *w]),
            _ => return None,
        })
    }
}

/// Error parsing a `"<nodeId>.<name>"` key
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Invalid parameter key '{0}'")]
pub struct ParamKeyError(pub String);

/// Address of a promoted property: owning node id plus property name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParamKey {
    /// Node the property belongs to
    pub node: NodeId,
    /// Property name
    pub name: String,
}

impl ParamKey {
    /// Create a key
    pub fn new(node: NodeId, name: impl Into<String>) -> Self {
        Self {
            node,
            name: name.into(),
        }
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node.0, self.name)
    }
}

impl FromStr for ParamKey {
    type Err = ParamKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (node, name) = s.split_once('.').ok_or_else(|| ParamKeyError(s.to_string()))?;
        if name.is_empty() {
            return Err(ParamKeyError(s.to_string()));
        }
        let uuid = Uuid::parse_str(node).map_err(|_| ParamKeyError(s.to_string()))?;
        Ok(Self::new(NodeId(uuid), name))
    }
}

impl TryFrom<String> for ParamKey {
    type Error = ParamKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ParamKey> for String {
    fn from(key: ParamKey) -> Self {
        key.to_string()
    }
}

/// Lookup context for evaluating functions
pub trait ParamEnv {
    /// Effective value of another graph parameter
    fn parameter(&self, key: &ParamKey) -> Option<ParamValue>;
    /// Value of a custom parameter
    fn custom(&self, name: &str) -> Option<ParamValue>;
    /// Graph random seed
    fn seed(&self) -> i32;
}

const MAX_FUNCTION_DEPTH: usize = 32;

/// A parameter derived from other values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamFunction {
    /// Fixed value
    Constant(ParamValue),
    /// Another graph parameter
    Parameter(ParamKey),
    /// A custom parameter by name
    Custom(String),
    /// The graph random seed
    Seed,
    /// Sum of two values, componentwise for vectors
    Add(Box<ParamFunction>, Box<ParamFunction>),
    /// Product of two values, componentwise for vectors
    Mul(Box<ParamFunction>, Box<ParamFunction>),
    /// Boolean negation
    Not(Box<ParamFunction>),
}

impl ParamFunction {
    /// Evaluate against `env`; `None` when an operand is missing or mistyped
    pub fn evaluate(&self, env: &dyn ParamEnv) -> Option<ParamValue> {
        self.eval(env, 0)
    }

    /// Whether the function reads `key`
    pub fn references_parameter(&self, key: &ParamKey) -> bool {
        self.any(&|f| matches!(f, Self::Parameter(k) if k == key))
    }

    /// Whether the function reads the custom parameter `name`
    pub fn references_custom(&self, name: &str) -> bool {
        self.any(&|f| matches!(f, Self::Custom(n) if n == name))
    }

    /// Whether the function reads the graph seed
    pub fn references_seed(&self) -> bool {
        self.any(&|f| matches!(f, Self::Seed))
    }

    fn any(&self, pred: &dyn Fn(&ParamFunction) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        match self {
            Self::Add(a, b) | Self::Mul(a, b) => a.any(pred) || b.any(pred),
            Self::Not(a) => a.any(pred),
            _ => false,
        }
    }

    fn eval(&self, env: &dyn ParamEnv, depth: usize) -> Option<ParamValue> {
        if depth > MAX_FUNCTION_DEPTH {
            return None;
        }
        match self {
            Self::Constant(v) => Some(v.clone()),
            Self::Parameter(key) => env.parameter(key),
            Self::Custom(name) => env.custom(name),
            Self::Seed => Some(ParamValue::Int(env.seed())),
            Self::Add(a, b) => combine(&a.eval(env, depth + 1)?, &b.eval(env, depth + 1)?, |x, y| x + y),
            Self::Mul(a, b) => combine(&a.eval(env, depth + 1)?, &b.eval(env, depth + 1)?, |x, y| x * y),
            Self::Not(a) => Some(ParamValue::Bool(!a.eval(env, depth + 1)?.as_bool()?)),
        }
    }
}

fn combine(a: &ParamValue, b: &ParamValue, op: fn(f32, f32) -> f32) -> Option<ParamValue> {
    match (a, b) {
        (ParamValue::Int(x), ParamValue::Int(y)) => Some(ParamValue::Int(op(*x as f32, *y as f32) as i32)),
        _ => match (a.components(), b.components()) {
            (Some(x), Some(y)) if x.len() == y.len() => {
                let c: Vec<f32> = x.iter().zip(&y).map(|(p, q)| op(*p, *q)).collect();
                a.with_components(&c)
            }
            (Some(x), None) => {
                let s = b.as_float()?;
                a.with_components(&x.iter().map(|p| op(*p, s)).collect::<Vec<_>>())
            }
            (None, Some(y)) => {
                let s = a.as_float()?;
                b.with_components(&y.iter().map(|q| op(s, *q)).collect::<Vec<_>>())
            }
            (None, None) => Some(ParamValue::Float(op(a.as_float()?, b.as_float()?))),
            _ => None,
        },
    }
}

/// Named, typed value owned by a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphParameterValue {
    /// Display name
    pub name: String,
    /// Stored constant value; also the type template for assignments
    pub value: ParamValue,
    /// Function computing the value, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<ParamFunction>,
    /// Free-form description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl GraphParameterValue {
    /// Create a constant parameter
    pub fn new(name: impl Into<String>, value: ParamValue) -> Self {
        Self {
            name: name.into(),
            value,
            function: None,
            description: String::new(),
        }
    }

    /// Create a function-valued parameter; `template` fixes its type
    pub fn function(name: impl Into<String>, template: ParamValue, function: ParamFunction) -> Self {
        Self {
            name: name.into(),
            value: template,
            function: Some(function),
            description: String::new(),
        }
    }

    /// Whether the value is computed
    pub fn is_function(&self) -> bool {
        self.function.is_some()
    }

    /// Store a new constant, converted to the existing type.
    ///
    /// Returns whether the stored value changed.
    pub fn assign_value(&mut self, value: &ParamValue) -> Result<bool, crate::error::GraphError> {
        let converted = value
            .coerce_like(&self.value)
            .ok_or_else(|| crate::error::GraphError::TypeMismatch(self.name.clone()))?;
        let changed = converted != self.value;
        self.value = converted;
        Ok(changed)
    }

    /// Effective value: the function result when computable, else the constant
    pub fn resolve(&self, env: &dyn ParamEnv) -> ParamValue {
        self.function
            .as_ref()
            .and_then(|f| f.evaluate(env))
            .and_then(|v| v.coerce_like(&self.value))
            .unwrap_or_else(|| self.value.clone())
    }
}

/// Immutable snapshot of a graph's effective parameter values.
///
/// Built on the scheduling thread and shared with parameter workers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamScope {
    values: IndexMap<ParamKey, ParamValue>,
}

impl ParamScope {
    /// Create an empty scope
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a value
    pub fn insert(&mut self, key: ParamKey, value: ParamValue) {
        self.values.insert(key, value);
    }

    /// Look up a value
    pub fn get(&self, key: &ParamKey) -> Option<&ParamValue> {
        self.values.get(key)
    }

    /// Look up by node id and property name
    pub fn lookup(&self, node: NodeId, name: &str) -> Option<&ParamValue> {
        self.values.get(&ParamKey::new(node, name))
    }

    /// Whether the key has a value
    pub fn contains(&self, key: &ParamKey) -> bool {
        self.values.contains_key(key)
    }

    /// Iterate over entries
    pub fn iter(&self) -> impl Iterator<Item = (&ParamKey, &ParamValue)> {
        self.values.iter()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the scope is empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
