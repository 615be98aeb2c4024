//! Common types for kiln.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::KilnError;

/// Numeric precision a model is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 32-bit floating point
    Float32,
    /// 16-bit floating point
    Float16,
    /// Brain floating point (16-bit)
    BFloat16,
    /// 64-bit floating point
    Float64,
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// 8-bit signed integer
    Int8,
    /// 8-bit unsigned integer
    UInt8,
    /// Boolean
    Bool,
}

impl Precision {
    /// Size in bytes of a single element.
    #[must_use]
    pub const fn size_bytes(&self) -> usize {
        match self {
            Self::Float32 | Self::Int32 => 4,
            Self::Float16 | Self::BFloat16 => 2,
            Self::Float64 | Self::Int64 => 8,
            Self::Int8 | Self::UInt8 | Self::Bool => 1,
        }
    }

    /// Canonical lowercase name, e.g. `"bfloat16"`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float16 => "float16",
            Self::BFloat16 => "bfloat16",
            Self::Float64 => "float64",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Int8 => "int8",
            Self::UInt8 => "uint8",
            Self::Bool => "bool",
        }
    }

    /// Stable one-byte tag used in canonical encodings.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Float32 => 0,
            Self::Float16 => 1,
            Self::BFloat16 => 2,
            Self::Float64 => 3,
            Self::Int32 => 4,
            Self::Int64 => 5,
            Self::Int8 => 6,
            Self::UInt8 => 7,
            Self::Bool => 8,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Precision {
    type Err = KilnError;

    /// Accepts canonical names, common aliases and `torch.`-prefixed names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        let name = name.strip_prefix("torch.").unwrap_or(name);
        match name.to_ascii_lowercase().as_str() {
            "float32" | "float" | "fp32" => Ok(Self::Float32),
            "float16" | "half" | "fp16" => Ok(Self::Float16),
            "bfloat16" | "bf16" => Ok(Self::BFloat16),
            "float64" | "double" | "fp64" => Ok(Self::Float64),
            "int32" | "int" => Ok(Self::Int32),
            "int64" | "long" => Ok(Self::Int64),
            "int8" => Ok(Self::Int8),
            "uint8" => Ok(Self::UInt8),
            "bool" => Ok(Self::Bool),
            _ => Err(KilnError::InvalidFormat(format!("unknown precision: {s}"))),
        }
    }
}

/// A single named weight tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    /// Shape of the tensor
    pub shape: Vec<usize>,
    /// Element precision
    pub precision: Precision,
    /// Raw little-endian element data
    pub data: Bytes,
}

impl Tensor {
    /// Create a new tensor.
    ///
    /// Fails if `data` does not hold exactly `numel * size_bytes` bytes.
    pub fn new(
        shape: Vec<usize>,
        precision: Precision,
        data: impl Into<Bytes>,
    ) -> crate::Result<Self> {
        let data = data.into();
        let expected = shape
            .iter()
            .try_fold(precision.size_bytes(), |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| {
                KilnError::InvalidFormat(format!(
                    "tensor of shape {shape:?} ({precision}) is too large"
                ))
            })?;
        if data.len() != expected {
            return Err(KilnError::InvalidFormat(format!(
                "tensor of shape {shape:?} ({precision}) needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            shape,
            precision,
            data,
        })
    }

    /// Number of elements in the tensor.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Magic prefix of the canonical state dict encoding.
const STATE_DICT_MAGIC: &[u8; 4] = b"KSD1";

/// Model weights keyed by parameter name.
///
/// Entries are kept in a `BTreeMap`, so iteration order (and therefore the
/// canonical encoding) only depends on the names, never on insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDict {
    tensors: BTreeMap<String, Tensor>,
}

impl StateDict {
    /// Create an empty state dict.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tensor, returning the previous one with that name.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(name.into(), tensor)
    }

    /// Look up a tensor by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Number of tensors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the dict holds no tensors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Iterate tensors in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Total payload size in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.tensors.values().map(|t| t.data.len()).sum()
    }

    /// Write the canonical encoding of the weights.
    ///
    /// Layout (all integers little-endian):
    /// `magic | u64 count | { u32 name_len | name | u8 precision | u32 rank | u64 dims.. | u64 data_len | data }*`
    pub fn write_canonical<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(STATE_DICT_MAGIC)?;
        writer.write_all(&(self.tensors.len() as u64).to_le_bytes())?;

        for (name, tensor) in &self.tensors {
            writer.write_all(&(name.len() as u32).to_le_bytes())?;
            writer.write_all(name.as_bytes())?;
            writer.write_all(&[tensor.precision.tag()])?;
            writer.write_all(&(tensor.shape.len() as u32).to_le_bytes())?;
            for &dim in &tensor.shape {
                writer.write_all(&(dim as u64).to_le_bytes())?;
            }
            writer.write_all(&(tensor.data.len() as u64).to_le_bytes())?;
            writer.write_all(&tensor.data)?;
        }

        Ok(())
    }

    /// Canonical encoding as an owned buffer.
    #[must_use]
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.total_bytes() + 16 * self.len() + 12);
        // Writing into a Vec cannot fail.
        let _ = self.write_canonical(&mut buf);
        buf
    }
}

impl FromIterator<(String, Tensor)> for StateDict {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_tensor(shape: Vec<usize>, fill: f32) -> Tensor {
        let numel: usize = shape.iter().product();
        let data: Vec<u8> = (0..numel).flat_map(|_| fill.to_le_bytes()).collect();
        Tensor::new(shape, Precision::Float32, data).unwrap()
    }

    #[test]
    fn test_precision_size() {
        assert_eq!(Precision::Float32.size_bytes(), 4);
        assert_eq!(Precision::BFloat16.size_bytes(), 2);
        assert_eq!(Precision::Int8.size_bytes(), 1);
    }

    #[test]
    fn test_precision_parse() {
        assert_eq!("float32".parse::<Precision>().unwrap(), Precision::Float32);
        assert_eq!("torch.bfloat16".parse::<Precision>().unwrap(), Precision::BFloat16);
        assert_eq!("fp16".parse::<Precision>().unwrap(), Precision::Float16);
        assert!("float8".parse::<Precision>().is_err());
    }

    #[test]
    fn test_precision_serde_lowercase() {
        let json = serde_json::to_string(&Precision::BFloat16).unwrap();
        assert_eq!(json, "\"bfloat16\"");
        let back: Precision = serde_json::from_str("\"uint8\"").unwrap();
        assert_eq!(back, Precision::UInt8);
        assert_eq!(Precision::UInt8.to_string(), "uint8");
    }

    #[test]
    fn test_tensor_size_checked() {
        assert!(Tensor::new(vec![2, 2], Precision::Float32, vec![0u8; 16]).is_ok());
        assert!(Tensor::new(vec![2, 2], Precision::Float32, vec![0u8; 15]).is_err());
    }

    #[test]
    fn test_tensor_size_overflow() {
        let result = Tensor::new(vec![usize::MAX, 2], Precision::Float32, vec![0u8; 8]);
        assert!(matches!(result, Err(KilnError::InvalidFormat(_))));
    }

    #[test]
    fn test_canonical_encoding_ignores_insertion_order() {
        let mut a = StateDict::new();
        a.insert("encoder.weight", f32_tensor(vec![4, 4], 1.0));
        a.insert("encoder.bias", f32_tensor(vec![4], 0.5));

        let mut b = StateDict::new();
        b.insert("encoder.bias", f32_tensor(vec![4], 0.5));
        b.insert("encoder.weight", f32_tensor(vec![4, 4], 1.0));

        assert_eq!(a.to_canonical_bytes(), b.to_canonical_bytes());
    }

    #[test]
    fn test_canonical_encoding_sensitive_to_content() {
        let mut a = StateDict::new();
        a.insert("w", f32_tensor(vec![2, 3], 1.0));

        let mut shape_changed = StateDict::new();
        shape_changed.insert("w", f32_tensor(vec![3, 2], 1.0));

        let mut data_changed = StateDict::new();
        data_changed.insert("w", f32_tensor(vec![2, 3], 2.0));

        let base = a.to_canonical_bytes();
        assert_ne!(base, shape_changed.to_canonical_bytes());
        assert_ne!(base, data_changed.to_canonical_bytes());
    }

    #[test]
    fn test_state_dict_accessors() {
        let dict: StateDict = vec![
            ("b".to_string(), f32_tensor(vec![2], 0.0)),
            ("a".to_string(), f32_tensor(vec![3], 0.0)),
        ]
        .into_iter()
        .collect();

        assert_eq!(dict.len(), 2);
        assert_eq!(dict.total_bytes(), 20);
        assert_eq!(dict.get("a").unwrap().numel(), 3);
        let names: Vec<_> = dict.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
