// SPDX-License-Identifier: MIT OR Apache-2.0
//! Port definitions for node inputs/outputs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use texgraph_gpu::Buffer;

/// Port direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortDirection {
    /// Input port
    Input,
    /// Output port
    Output,
}

/// Set of data kinds a port accepts
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DataKinds(u16);

impl DataKinds {
    /// No kinds
    pub const NONE: Self = Self(0);
    /// Color image
    pub const COLOR: Self = Self(1 << 0);
    /// Grayscale image
    pub const GRAY: Self = Self(1 << 1);
    /// Boolean value
    pub const BOOL: Self = Self(1 << 2);
    /// Float value
    pub const FLOAT: Self = Self(1 << 3);
    /// Integer value
    pub const INT: Self = Self(1 << 4);
    /// 2D vector
    pub const FLOAT2: Self = Self(1 << 5);
    /// 3D vector
    pub const FLOAT3: Self = Self(1 << 6);
    /// 4D vector
    pub const FLOAT4: Self = Self(1 << 7);
    /// Any image
    pub const IMAGE: Self = Self(Self::COLOR.0 | Self::GRAY.0);

    /// Whether every kind in `other` is in `self`
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the two sets share a kind
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether the set is empty
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for DataKinds {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for DataKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(DataKinds, &str); 8] = [
            (DataKinds::COLOR, "Color"),
            (DataKinds::GRAY, "Gray"),
            (DataKinds::BOOL, "Bool"),
            (DataKinds::FLOAT, "Float"),
            (DataKinds::INT, "Int"),
            (DataKinds::FLOAT2, "Float2"),
            (DataKinds::FLOAT3, "Float3"),
            (DataKinds::FLOAT4, "Float4"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(k, _)| self.contains(*k))
            .map(|(_, n)| *n)
            .collect();
        write!(f, "DataKinds({})", names.join(" | "))
    }
}

/// A port on a node
#[derive(Debug, Clone)]
pub struct Port {
    /// Port name
    pub name: String,
    /// Port direction
    pub direction: PortDirection,
    /// Kinds of data allowed through the port
    pub kinds: DataKinds,
    /// Published data; only outputs carry it
    pub(crate) data: Option<Buffer>,
}

impl Port {
    /// Create a new input port
    pub fn input(name: impl Into<String>, kinds: DataKinds) -> Self {
        Self {
            name: name.into(),
            direction: PortDirection::Input,
            kinds,
            data: None,
        }
    }

    /// Create a new output port
    pub fn output(name: impl Into<String>, kinds: DataKinds) -> Self {
        Self {
            name: name.into(),
            direction: PortDirection::Output,
            kinds,
            data: None,
        }
    }

    /// Check if a connection to another port is valid
    pub fn can_connect(&self, other: &Port) -> bool {
        // Must be opposite directions
        if self.direction == other.direction {
            return false;
        }

        self.kinds.intersects(other.kinds)
    }

    /// Currently published data
    pub fn data(&self) -> Option<&Buffer> {
        self.data.as_ref()
    }

    /// Whether the port holds a buffer that can be read
    pub fn has_data(&self) -> bool {
        self.data.as_ref().is_some_and(Buffer::is_valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let image = DataKinds::COLOR | DataKinds::GRAY;
        assert_eq!(image, DataKinds::IMAGE);
        assert!(image.contains(DataKinds::GRAY));
        assert!(!image.contains(DataKinds::BOOL));
        assert!(image.intersects(DataKinds::COLOR | DataKinds::FLOAT));
        assert!(DataKinds::NONE.is_empty());
        assert_eq!(format!("{:?}", image), "DataKinds(Color | Gray)");
    }

    #[test]
    fn test_can_connect() {
        let out = Port::output("Out", DataKinds::IMAGE);
        let gray_in = Port::input("In", DataKinds::GRAY);
        let bool_in = Port::input("Flag", DataKinds::BOOL);

        assert!(out.can_connect(&gray_in));
        assert!(gray_in.can_connect(&out));
        assert!(!out.can_connect(&bool_in));
        assert!(!out.can_connect(&out.clone()));
    }

    #[test]
    fn test_has_data() {
        let mut port = Port::output("Out", DataKinds::IMAGE);
        assert!(!port.has_data());
        port.data = Some(Buffer::invalid());
        assert!(!port.has_data());
    }
}
