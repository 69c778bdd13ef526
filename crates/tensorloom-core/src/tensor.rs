use std::fmt;

use bytes::Bytes;
use smallvec::SmallVec;

/// Element type of a tensor. Wire and config files use the uppercase names
/// (`UINT8`, `FP32`, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DType {
    U8,
    F32,
    F16,
    I32,
    I64,
}

impl DType {
    pub fn byte_size(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::F16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::I64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::U8 => "UINT8",
            DType::F32 => "FP32",
            DType::F16 => "FP16",
            DType::I32 => "INT32",
            DType::I64 => "INT64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseDTypeError(pub String);

impl fmt::Display for ParseDTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown datatype `{}`", self.0)
    }
}

impl std::error::Error for ParseDTypeError {}

impl std::str::FromStr for DType {
    type Err = ParseDTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UINT8" => Ok(DType::U8),
            "FP32" => Ok(DType::F32),
            "FP16" => Ok(DType::F16),
            "INT32" => Ok(DType::I32),
            "INT64" => Ok(DType::I64),
            other => Err(ParseDTypeError(other.to_string())),
        }
    }
}

/// A fully resolved shape. Declared shapes with dynamic dims live in
/// [`crate::TensorSpec`]; by the time data flows, every dim is concrete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn numel(&self) -> usize {
        self.0.iter().product::<usize>().max(1)
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

#[derive(Clone, Debug)]
pub struct TensorDesc {
    pub dtype: DType,
    pub shape: Shape,
}

/// Owns the storage for a tensor. Host-only; device-resident storage belongs
/// to the engines behind the stage adapters.
#[derive(Clone, Debug)]
pub enum TensorStorage {
    Cpu(Bytes),
}

impl TensorStorage {
    pub fn bytes(&self) -> &Bytes {
        match self {
            TensorStorage::Cpu(b) => b,
        }
    }
}

/// An immutable value exchanged between stages. Element bytes are
/// little-endian; cloning is cheap (`Bytes` is reference-counted).
#[derive(Clone, Debug)]
pub struct Tensor {
    pub desc: TensorDesc,
    pub storage: TensorStorage,
    pub byte_len: usize,
}

impl Tensor {
    pub fn from_cpu_bytes(dtype: DType, shape: Shape, bytes: Bytes) -> Self {
        let byte_len = bytes.len();
        Self {
            desc: TensorDesc { dtype, shape },
            storage: TensorStorage::Cpu(bytes),
            byte_len,
        }
    }

    pub fn from_u8(shape: Shape, values: &[u8]) -> Self {
        Self::from_cpu_bytes(DType::U8, shape, Bytes::copy_from_slice(values))
    }

    pub fn from_f32(shape: Shape, values: &[f32]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Self::from_cpu_bytes(DType::F32, shape, Bytes::from(bytes))
    }

    pub fn from_i32(shape: Shape, values: &[i32]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Self::from_cpu_bytes(DType::I32, shape, Bytes::from(bytes))
    }

    pub fn from_i64(shape: Shape, values: &[i64]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 8);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Self::from_cpu_bytes(DType::I64, shape, Bytes::from(bytes))
    }

    pub fn bytes(&self) -> &Bytes {
        self.storage.bytes()
    }

    pub fn dtype(&self) -> DType {
        self.desc.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.desc.shape
    }

    /// Decoded f32 view, or `None` if the dtype or byte length disagree.
    pub fn as_f32(&self) -> Option<Vec<f32>> {
        if self.desc.dtype != DType::F32 || self.byte_len % 4 != 0 {
            return None;
        }
        Some(
            self.bytes()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        )
    }

    pub fn as_u8(&self) -> Option<Vec<u8>> {
        if self.desc.dtype != DType::U8 {
            return None;
        }
        Some(self.bytes().to_vec())
    }

    pub fn as_i32(&self) -> Option<Vec<i32>> {
        if self.desc.dtype != DType::I32 || self.byte_len % 4 != 0 {
            return None;
        }
        Some(
            self.bytes()
                .chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        )
    }

    pub fn as_i64(&self) -> Option<Vec<i64>> {
        if self.desc.dtype != DType::I64 || self.byte_len % 8 != 0 {
            return None;
        }
        Some(
            self.bytes()
                .chunks_exact(8)
                .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_roundtrip() {
        let t = Tensor::from_f32(Shape::from_slice(&[2, 2]), &[1.0, -2.5, 0.0, 4.25]);
        assert_eq!(t.byte_len, 16);
        assert_eq!(t.as_f32().unwrap(), vec![1.0, -2.5, 0.0, 4.25]);
        assert_eq!(t.as_i32(), None);
    }

    #[test]
    fn dtype_names_roundtrip() {
        for dt in [DType::U8, DType::F32, DType::F16, DType::I32, DType::I64] {
            assert_eq!(dt.as_str().parse::<DType>().unwrap(), dt);
        }
        assert!("FLOAT".parse::<DType>().is_err());
    }
}
