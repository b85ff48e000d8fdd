use serde::{Deserialize, Serialize};
use std::fmt::Display;

pub type DimSize = u32;
pub type Shape = smallvec::SmallVec<[DimSize; 5]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Dtype {
    Float32,
}

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    pub fn size(&self) -> u8 {
        match &self {
            Dtype::Float32 => 4,
        }
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Float32 => write!(f, "f32"),
        }
    }
}

/// The number of elements in a tensor of the given shape.
pub fn volume(shape: &[DimSize]) -> usize {
    shape.iter().map(|&d| d as usize).product()
}
