// This module defines the type system and target data layout of the kernel graph. Types
// are scalars (integers and floats of fixed width), pointers tagged with an address
// space, short vectors of scalars, fixed-size arrays and void. DataLayout answers the
// questions passes are not allowed to guess at: byte order and the size and alignment
// of every type, including pointers. Constant folding serializes initializers through
// it, so every size computed here is load-bearing for bit-exact folding results.

//! Kernel graph types and target data layout.

use std::fmt;

/// Scalar element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    I1,
    I8,
    I16,
    I32,
    I64,
    F16,
    F32,
    F64,
}

impl ScalarType {
    /// Width in bits.
    pub const fn bits(self) -> u32 {
        match self {
            ScalarType::I1 => 1,
            ScalarType::I8 => 8,
            ScalarType::I16 | ScalarType::F16 => 16,
            ScalarType::I32 | ScalarType::F32 => 32,
            ScalarType::I64 | ScalarType::F64 => 64,
        }
    }

    /// Bytes occupied in memory (`i1` is stored as a byte).
    pub const fn store_bytes(self) -> u64 {
        (self.bits() as u64).div_ceil(8)
    }

    pub const fn is_float(self) -> bool {
        matches!(self, ScalarType::F16 | ScalarType::F32 | ScalarType::F64)
    }

    /// Mask selecting the meaningful low bits of a raw constant.
    pub const fn mask(self) -> u64 {
        if self.bits() == 64 {
            u64::MAX
        } else {
            (1u64 << self.bits()) - 1
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ScalarType::I1 => "i1",
            ScalarType::I8 => "i8",
            ScalarType::I16 => "i16",
            ScalarType::I32 => "i32",
            ScalarType::I64 => "i64",
            ScalarType::F16 => "f16",
            ScalarType::F32 => "f32",
            ScalarType::F64 => "f64",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "i1" => ScalarType::I1,
            "i8" => ScalarType::I8,
            "i16" => ScalarType::I16,
            "i32" => ScalarType::I32,
            "i64" => ScalarType::I64,
            "f16" => ScalarType::F16,
            "f32" => ScalarType::F32,
            "f64" => ScalarType::F64,
            _ => return None,
        })
    }
}

/// Address spaces used by pointers.
pub mod addrspace {
    pub const PRIVATE: u32 = 0;
    pub const GLOBAL: u32 = 1;
    pub const CONSTANT: u32 = 2;
    pub const LOCAL: u32 = 3;
}

/// A first-class type of the kernel graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    Scalar(ScalarType),
    Ptr(u32),
    Vector(ScalarType, u32),
    Array(Box<Type>, u64),
}

impl Type {
    pub const I1: Type = Type::Scalar(ScalarType::I1);
    pub const I8: Type = Type::Scalar(ScalarType::I8);
    pub const I16: Type = Type::Scalar(ScalarType::I16);
    pub const I32: Type = Type::Scalar(ScalarType::I32);
    pub const I64: Type = Type::Scalar(ScalarType::I64);
    pub const F32: Type = Type::Scalar(ScalarType::F32);

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn as_scalar(&self) -> Option<ScalarType> {
        match self {
            Type::Scalar(s) => Some(*s),
            _ => None,
        }
    }

    pub fn address_space(&self) -> Option<u32> {
        match self {
            Type::Ptr(space) => Some(*space),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Scalar(s) => write!(f, "{}", s.name()),
            Type::Ptr(space) => write!(f, "ptr{space}"),
            Type::Vector(s, n) => write!(f, "<{n} x {}>", s.name()),
            Type::Array(elem, n) => write!(f, "[{n} x {elem}]"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    Little,
    Big,
}

/// Target data layout: byte order and pointer width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataLayout {
    pub endian: Endian,
    pub pointer_bits: u32,
}

impl Default for DataLayout {
    fn default() -> Self {
        Self { endian: Endian::Little, pointer_bits: 64 }
    }
}

impl DataLayout {
    pub fn new(endian: Endian, pointer_bits: u32) -> Self {
        Self { endian, pointer_bits }
    }

    /// Size of the type in bits, without padding.
    pub fn type_size_bits(&self, ty: &Type) -> u64 {
        match ty {
            Type::Void => 0,
            Type::Scalar(s) => s.bits() as u64,
            Type::Ptr(_) => self.pointer_bits as u64,
            Type::Vector(s, n) => s.bits() as u64 * *n as u64,
            Type::Array(elem, n) => self.alloc_size(elem) * 8 * n,
        }
    }

    /// Bytes written by a store of the type.
    pub fn store_size(&self, ty: &Type) -> u64 {
        self.type_size_bits(ty).div_ceil(8)
    }

    /// ABI alignment in bytes.
    pub fn abi_align(&self, ty: &Type) -> u64 {
        match ty {
            Type::Void => 1,
            Type::Array(elem, _) => self.abi_align(elem),
            _ => self.store_size(ty).next_power_of_two().max(1),
        }
    }

    /// Distance between consecutive elements of the type in an array.
    pub fn alloc_size(&self, ty: &Type) -> u64 {
        let align = self.abi_align(ty);
        self.store_size(ty).div_ceil(align) * align
    }

    /// Write the low `bytes` bytes of `raw` in target byte order.
    pub fn write_uint(&self, raw: u64, bytes: usize, out: &mut Vec<u8>) {
        let le = raw.to_le_bytes();
        match self.endian {
            Endian::Little => out.extend_from_slice(&le[..bytes]),
            Endian::Big => out.extend(le[..bytes].iter().rev()),
        }
    }

    /// Read `bytes.len()` bytes in target byte order.
    pub fn read_uint(&self, bytes: &[u8]) -> u64 {
        let mut raw = 0u64;
        match self.endian {
            Endian::Little => {
                for (i, b) in bytes.iter().enumerate() {
                    raw |= (*b as u64) << (8 * i);
                }
            }
            Endian::Big => {
                for b in bytes {
                    raw = (raw << 8) | *b as u64;
                }
            }
        }
        raw
    }
}
