//! Allocation shapes derived from buffer requests.

use serde::{Deserialize, Serialize};

/// Element type of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 1-byte boolean.
    Bool,
    /// 8-bit integer.
    Byte,
    /// 16-bit integer.
    Short,
    /// 16-bit float.
    Half,
    /// 32-bit integer.
    Int,
    /// 32-bit float.
    Float,
    /// 64-bit integer.
    Long,
    /// 64-bit float.
    Double,
}

impl DataType {
    /// Size of one element in bytes.
    #[must_use]
    pub const fn element_size(self) -> u32 {
        match self {
            Self::Bool | Self::Byte => 1,
            Self::Short | Self::Half => 2,
            Self::Int | Self::Float => 4,
            Self::Long | Self::Double => 8,
        }
    }
}

/// Shape query offered by the array runtime for a buffer.
pub trait BufferShape {
    /// Number of elements.
    fn length(&self) -> u64;

    /// Size of one element in bytes.
    fn element_size(&self) -> u32;
}

/// Minimal buffer description: element type and count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// Element type.
    pub data_type: DataType,
    /// Number of elements.
    pub length: u64,
}

impl BufferDescriptor {
    /// Describe a buffer of `length` elements of `data_type`.
    #[must_use]
    pub const fn new(data_type: DataType, length: u64) -> Self {
        Self { data_type, length }
    }
}

impl BufferShape for BufferDescriptor {
    fn length(&self) -> u64 {
        self.length
    }

    fn element_size(&self) -> u32 {
        self.data_type.element_size()
    }
}

/// Immutable size descriptor of one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationShape {
    length: u64,
    element_size: u32,
    total_bytes: u64,
}

impl AllocationShape {
    /// Build a shape of `length` elements of `element_size` bytes each.
    #[must_use]
    pub fn new(length: u64, element_size: u32) -> Self {
        Self {
            length,
            element_size,
            total_bytes: length.saturating_mul(u64::from(element_size)),
        }
    }

    /// Shape of a raw byte block.
    #[must_use]
    pub fn bytes(total_bytes: u64) -> Self {
        Self::new(total_bytes, 1)
    }

    /// Build the shape of a buffer reported by the array runtime.
    #[must_use]
    pub fn of<B: BufferShape + ?Sized>(buffer: &B) -> Self {
        Self::new(buffer.length(), buffer.element_size())
    }

    /// Number of elements.
    #[must_use]
    pub const fn length(&self) -> u64 {
        self.length
    }

    /// Size of one element in bytes.
    #[must_use]
    pub const fn element_size(&self) -> u32 {
        self.element_size
    }

    /// Total size in bytes.
    #[must_use]
    pub const fn number_of_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Whether the shape describes zero bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }
}
