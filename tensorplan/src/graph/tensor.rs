use std::collections::BTreeSet;

use crate::{
    Error,
    graph::{Fuid, Guid, OpId},
    runtime::Blob,
    shape::{Shape, element_count},
};

/// Element type of a tensor
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[allow(missing_docs)]
pub enum DataType {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Float16,
    Int32,
    UInt32,
    Float32,
    Int64,
    UInt64,
    Float64,
}

impl DataType {
    /// Size of a single element, in bytes
    pub fn size(&self) -> usize {
        match self {
            DataType::Bool | DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 | DataType::Float16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 8,
        }
    }
}

/// A typed, shaped value in a [`Graph`](crate::graph::Graph)
///
/// Tensors record the operator which produces them (`source`) and the
/// operators which consume them (`targets`); these links are maintained by
/// the graph and cannot be edited directly.
#[derive(Clone, Debug)]
pub struct Tensor {
    pub(crate) guid: Guid,
    pub(crate) fuid: Fuid,
    pub(crate) shape: Shape,
    pub(crate) dtype: DataType,
    pub(crate) source: Option<OpId>,
    pub(crate) targets: BTreeSet<OpId>,
    pub(crate) blob: Option<Blob>,
}

impl Tensor {
    pub(crate) fn new(shape: Shape, dtype: DataType) -> Self {
        Self {
            guid: Guid::next(),
            fuid: Fuid::next(),
            shape,
            dtype,
            source: None,
            targets: BTreeSet::new(),
            blob: None,
        }
    }

    /// Returns the globally unique id
    pub fn guid(&self) -> Guid {
        self.guid
    }

    /// Returns the functional id
    pub fn fuid(&self) -> Fuid {
        self.fuid
    }

    /// Returns the tensor's dimensions
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the number of dimensions
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Returns the element type
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Returns the number of bytes needed to store this tensor
    ///
    /// Returns an error if the size overflows a `usize`.
    pub fn bytes(&self) -> Result<usize, Error> {
        element_count(&self.shape)
            .and_then(|n| n.checked_mul(self.dtype.size()))
            .ok_or_else(|| Error::SizeOverflow(self.shape.clone()))
    }

    /// Returns the operator which produces this tensor, if any
    pub fn source(&self) -> Option<OpId> {
        self.source
    }

    /// Iterates over the operators which consume this tensor
    pub fn targets(&self) -> impl Iterator<Item = OpId> + '_ {
        self.targets.iter().cloned()
    }

    /// Returns the bound memory region, if memory has been allocated
    pub fn data_blob(&self) -> Option<Blob> {
        self.blob
    }

    pub(crate) fn set_data_blob(&mut self, blob: Blob) {
        self.blob = Some(blob);
    }
}
