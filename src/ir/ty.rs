//! Structured representations of IR types, grounded in
//! `spirq_core::ty` but generalized from a read-only reflection view to a
//! value type the builder can also construct and intern.
use std::fmt;

pub use spirv::{Dim, ImageFormat};

use crate::ir::Id;

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum AddressSpace {
    Function,
    Private,
    Workgroup,
    Uniform,
    UniformConstant,
    Storage,
    Input,
    Output,
    PushConstant,
}
impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            AddressSpace::Function => "function",
            AddressSpace::Private => "private",
            AddressSpace::Workgroup => "workgroup",
            AddressSpace::Uniform => "uniform",
            AddressSpace::UniformConstant => "uniform_constant",
            AddressSpace::Storage => "storage",
            AddressSpace::Input => "input",
            AddressSpace::Output => "output",
            AddressSpace::PushConstant => "push_constant",
        };
        f.write_str(s)
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum ScalarType {
    Bool,
    Int { bits: u32, is_signed: bool },
    Float { bits: u32 },
}
impl ScalarType {
    pub fn i32() -> Self {
        ScalarType::Int {
            bits: 32,
            is_signed: true,
        }
    }
    pub fn u32() -> Self {
        ScalarType::Int {
            bits: 32,
            is_signed: false,
        }
    }
    pub fn f32() -> Self {
        ScalarType::Float { bits: 32 }
    }
    pub fn f16() -> Self {
        ScalarType::Float { bits: 16 }
    }
    pub fn nbyte(&self) -> usize {
        match self {
            ScalarType::Bool => 1,
            ScalarType::Int { bits, .. } => (*bits / 8) as usize,
            ScalarType::Float { bits } => (*bits / 8) as usize,
        }
    }
    pub fn is_float(&self) -> bool {
        matches!(self, ScalarType::Float { .. })
    }
    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            ScalarType::Int {
                is_signed: true,
                ..
            } | ScalarType::Float { .. }
        )
    }
}
impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ScalarType::Bool => write!(f, "bool"),
            ScalarType::Int {
                bits,
                is_signed: true,
            } => write!(f, "i{bits}"),
            ScalarType::Int {
                bits,
                is_signed: false,
            } => write!(f, "u{bits}"),
            ScalarType::Float { bits } => write!(f, "f{bits}"),
        }
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum ImageDim {
    D1,
    D2,
    D3,
    Cube,
}
impl ImageDim {
    pub fn to_spv(self) -> Dim {
        match self {
            ImageDim::D1 => Dim::Dim1D,
            ImageDim::D2 => Dim::Dim2D,
            ImageDim::D3 => Dim::Dim3D,
            ImageDim::Cube => Dim::DimCube,
        }
    }
}
impl fmt::Display for ImageDim {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ImageDim::D1 => "1d",
            ImageDim::D2 => "2d",
            ImageDim::D3 => "3d",
            ImageDim::Cube => "cube",
        };
        f.write_str(s)
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum StorageAccess {
    Read,
    Write,
    ReadWrite,
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub struct TextureType {
    pub dim: ImageDim,
    pub arrayed: bool,
    pub multisampled: bool,
    pub sampled_ty: Id,
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub struct TextureStorageType {
    pub dim: ImageDim,
    pub format: TexelFormat,
    pub access: StorageAccess,
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum TexelFormat {
    Rgba8Unorm,
    Rgba8Snorm,
    Rgba16Float,
    R32Float,
    Rg32Float,
    Rgba32Float,
    R32Sint,
    R32Uint,
    Rgba32Uint,
    Rgba32Sint,
}
impl TexelFormat {
    pub fn to_spv(self) -> ImageFormat {
        match self {
            TexelFormat::Rgba8Unorm => ImageFormat::Rgba8,
            TexelFormat::Rgba8Snorm => ImageFormat::Rgba8Snorm,
            TexelFormat::Rgba16Float => ImageFormat::Rgba16f,
            TexelFormat::R32Float => ImageFormat::R32f,
            TexelFormat::Rg32Float => ImageFormat::Rg32f,
            TexelFormat::Rgba32Float => ImageFormat::Rgba32f,
            TexelFormat::R32Sint => ImageFormat::R32i,
            TexelFormat::R32Uint => ImageFormat::R32ui,
            TexelFormat::Rgba32Uint => ImageFormat::Rgba32ui,
            TexelFormat::Rgba32Sint => ImageFormat::Rgba32i,
        }
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub struct TextureDepthType {
    pub dim: ImageDim,
    pub arrayed: bool,
    pub multisampled: bool,
}

/// Structural key used by the interner. Struct types are intentionally
/// absent: their identity is nominal, per spec.
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub(crate) enum TypeKey {
    Void,
    Bool,
    Int { bits: u32, is_signed: bool },
    Float { bits: u32 },
    Vec { elem: Id, n: u32 },
    Mat { col: Id, cols: u32, rows: u32 },
    Array { elem: Id, len: u32, stride: Option<usize> },
    RuntimeArray { elem: Id },
    Ptr { pointee: Id, space: AddressSpace },
    Sampler,
    SamplerComparison,
    Texture(TextureType),
    TextureStorage(TextureStorageType),
    TextureDepth(TextureDepthType),
}

#[derive(Clone, Debug)]
pub struct StructMember {
    pub name: Option<String>,
    pub ty: Id,
    pub offset: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct StructType {
    pub name: Option<String>,
    pub members: Vec<StructMember>,
}

/// One entry in the tagged type union (spec.md §3).
#[derive(Clone, Debug)]
pub enum Type {
    Void,
    Scalar(ScalarType),
    Vector { elem: Id, size: u32 },
    Matrix { col: Id, cols: u32, rows: u32, stride: usize },
    Array { elem: Id, len: u32, stride: Option<usize> },
    RuntimeArray { elem: Id, stride: usize },
    Struct(StructType),
    Ptr { pointee: Id, space: AddressSpace },
    Sampler,
    SamplerComparison,
    Texture(TextureType),
    TextureStorage(TextureStorageType),
    TextureDepth(TextureDepthType),
}
impl Type {
    pub(crate) fn key(&self) -> Option<TypeKey> {
        Some(match self {
            Type::Void => TypeKey::Void,
            Type::Scalar(ScalarType::Bool) => TypeKey::Bool,
            Type::Scalar(ScalarType::Int { bits, is_signed }) => TypeKey::Int {
                bits: *bits,
                is_signed: *is_signed,
            },
            Type::Scalar(ScalarType::Float { bits }) => TypeKey::Float { bits: *bits },
            Type::Vector { elem, size } => TypeKey::Vec {
                elem: *elem,
                n: *size,
            },
            Type::Matrix { col, cols, rows } => TypeKey::Mat {
                col: *col,
                cols: *cols,
                rows: *rows,
            },
            Type::Array { elem, len, stride } => TypeKey::Array {
                elem: *elem,
                len: *len,
                stride: *stride,
            },
            Type::RuntimeArray { elem, .. } => TypeKey::RuntimeArray { elem: *elem },
            Type::Ptr { pointee, space } => TypeKey::Ptr {
                pointee: *pointee,
                space: *space,
            },
            Type::Sampler => TypeKey::Sampler,
            Type::SamplerComparison => TypeKey::SamplerComparison,
            Type::Texture(t) => TypeKey::Texture(*t),
            Type::TextureStorage(t) => TypeKey::TextureStorage(*t),
            Type::TextureDepth(t) => TypeKey::TextureDepth(*t),
            // Struct identity is nominal; never interned.
            Type::Struct(_) => return None,
        })
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Type::Scalar(_))
    }
    pub fn is_vector(&self) -> bool {
        matches!(self, Type::Vector { .. })
    }
    pub fn is_matrix(&self) -> bool {
        matches!(self, Type::Matrix { .. })
    }
    pub fn is_struct(&self) -> bool {
        matches!(self, Type::Struct(_))
    }
    pub fn is_ptr(&self) -> bool {
        matches!(self, Type::Ptr { .. })
    }
    pub fn as_scalar(&self) -> Option<ScalarType> {
        match self {
            Type::Scalar(s) => Some(*s),
            _ => None,
        }
    }
    pub fn as_ptr(&self) -> Option<(Id, AddressSpace)> {
        match self {
            Type::Ptr { pointee, space } => Some((*pointee, *space)),
            _ => None,
        }
    }
}
