//! Module containing the universal error type
use crate::graph::TensorId;
use thiserror::Error;

/// Universal error type for `tensorplan`
#[derive(Error, Debug)]
pub enum Error {
    /// Tensor is not present in this `Graph`
    #[error("tensor {0:?} is not present in this `Graph`")]
    BadTensor(TensorId),

    /// Tensor already has a producing operator
    #[error("tensor {0:?} already has a source operator")]
    MultipleSources(TensorId),

    /// Graph contains a cycle and cannot be sorted
    #[error("graph contains a cycle and cannot be topologically sorted")]
    CyclicGraph,

    /// Graph structure is invalid; see inner message for details
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    /// Operator kind could not infer its output shapes
    #[error("could not infer output shapes for {0}")]
    ShapeInference(String),

    /// Shape inference produced the wrong number of outputs
    #[error("operator produced {0} shapes for {1} outputs")]
    OutputCount(usize, usize),

    /// Wrong number of inputs for an operator kind
    #[error("{0} expects {1} inputs, got {2}")]
    InputCount(&'static str, usize, usize),

    /// Contraction dimensions of a matrix multiplication do not match
    #[error("mismatched contraction dimensions: {0} != {1}")]
    MismatchedDims(usize, usize),

    /// Shapes cannot be broadcast together
    #[error("cannot broadcast dimension {0} against {1}")]
    BadBroadcast(usize, usize),

    /// Operand rank is too small for this operator
    #[error("rank {0} is too small; expected at least {1}")]
    BadRank(usize, usize),

    /// Permutation is not a valid reordering of the tensor's axes
    #[error("{0:?} is not a permutation of {1} axes")]
    BadPermutation(Vec<usize>, usize),

    /// Tensor is too large to address
    #[error("tensor of shape {0:?} is too large to address")]
    SizeOverflow(Vec<usize>),

    /// Alignment must be a nonzero power of two
    #[error("alignment {0} is not a nonzero power of two")]
    BadAlignment(usize),

    /// Memory has already been bound to this graph's tensors
    #[error("graph memory has already been allocated")]
    AlreadyAllocated,

    /// IO error; see inner code for details
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}
