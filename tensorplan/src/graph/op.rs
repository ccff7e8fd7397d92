use std::collections::BTreeSet;
use std::sync::Arc;

use crate::{
    Error,
    graph::{Guid, OpId, TensorId},
    shape::{self, Shape},
};

/// A one-argument elementwise operation
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[derive(strum::Display)]
#[allow(missing_docs)]
pub enum UnaryOpcode {
    Relu,
    Sigmoid,
    Tanh,
    Abs,
    Neg,
}

/// A two-argument elementwise operation, with broadcasting
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[derive(strum::Display)]
#[allow(missing_docs)]
pub enum BinaryOpcode {
    Add,
    Sub,
    Mul,
    Div,
}

/// Shape inference for operator kinds defined outside this crate
///
/// Returning `None` signals that shapes cannot be inferred, which
/// [`Graph::shape_infer`](crate::graph::Graph::shape_infer) treats as an
/// error.
pub trait InferShape: Send + Sync + std::fmt::Debug {
    /// Name of the operator kind, used in dumps and errors
    fn name(&self) -> &str;

    /// Computes output shapes from input shapes
    fn infer_shape(&self, inputs: &[&[usize]]) -> Option<Vec<Shape>>;
}

/// Kind of an operator, along with its kind-specific attributes
#[derive(Clone, Debug, strum::EnumDiscriminants)]
#[strum_discriminants(
    name(OpType),
    derive(Hash, Ord, PartialOrd, strum::Display, strum::IntoStaticStr)
)]
pub enum OpKind {
    /// Reorders axes, so that `out.shape[i] = in.shape[perm[i]]`
    Transpose {
        /// Axis permutation
        perm: Vec<usize>,
    },
    /// (Batched) matrix multiplication, with optionally transposed operands
    MatMul {
        /// Treat the first operand's trailing two axes as swapped
        trans_a: bool,
        /// Treat the second operand's trailing two axes as swapped
        trans_b: bool,
    },
    /// Passes its input through unchanged
    Identity,
    /// Elementwise unary operation
    Unary(UnaryOpcode),
    /// Elementwise binary operation
    Binary(BinaryOpcode),
    /// Externally-defined operator kind
    Custom(Arc<dyn InferShape>),
}

impl OpKind {
    /// Returns the kind tag, without attributes
    pub fn op_type(&self) -> OpType {
        self.into()
    }

    /// Returns the number of inputs expected by this kind, if fixed
    fn arity(&self) -> Option<usize> {
        match self {
            OpKind::Transpose { .. } | OpKind::Identity | OpKind::Unary(..) => {
                Some(1)
            }
            OpKind::MatMul { .. } | OpKind::Binary(..) => Some(2),
            OpKind::Custom(..) => None,
        }
    }

    /// Checks that `n` inputs is acceptable for this kind
    pub fn check_input_count(&self, n: usize) -> Result<(), Error> {
        match self.arity() {
            Some(want) if want != n => {
                Err(Error::InputCount(self.op_type().into(), want, n))
            }
            _ => Ok(()),
        }
    }

    /// Computes output shapes from input shapes
    pub fn infer_shape(&self, inputs: &[&[usize]]) -> Result<Vec<Shape>, Error> {
        self.check_input_count(inputs.len())?;
        let out = match self {
            OpKind::Transpose { perm } => shape::transpose(inputs[0], perm)?,
            OpKind::MatMul { trans_a, trans_b } => {
                shape::matmul(inputs[0], inputs[1], *trans_a, *trans_b)?
            }
            OpKind::Identity | OpKind::Unary(..) => inputs[0].to_vec(),
            OpKind::Binary(..) => shape::broadcast(inputs[0], inputs[1])?,
            OpKind::Custom(c) => {
                return c
                    .infer_shape(inputs)
                    .ok_or_else(|| Error::ShapeInference(c.name().to_owned()));
            }
        };
        Ok(vec![out])
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Transpose { perm } => write!(f, "Transpose(perm={perm:?})"),
            OpKind::MatMul { trans_a, trans_b } => write!(
                f,
                "MatMul([{},{}])",
                if *trans_a { "A^T" } else { "A" },
                if *trans_b { "B^T" } else { "B" },
            ),
            OpKind::Identity => write!(f, "Identity"),
            OpKind::Unary(op) => write!(f, "{op}"),
            OpKind::Binary(op) => write!(f, "{op}"),
            OpKind::Custom(c) => write!(f, "{}", c.name()),
        }
    }
}

/// A node in a [`Graph`](crate::graph::Graph) which consumes and produces
/// tensors
///
/// Predecessor and successor links are derived from tensor links: operator
/// `A` precedes `B` if and only if one of `A`'s outputs is one of `B`'s
/// inputs.
#[derive(Clone, Debug)]
pub struct Operator {
    pub(crate) guid: Guid,
    pub(crate) kind: OpKind,
    pub(crate) inputs: Vec<TensorId>,
    pub(crate) outputs: Vec<TensorId>,
    pub(crate) predecessors: BTreeSet<OpId>,
    pub(crate) successors: BTreeSet<OpId>,
}

impl Operator {
    pub(crate) fn new(
        kind: OpKind,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> Self {
        Self {
            guid: Guid::next(),
            kind,
            inputs,
            outputs,
            predecessors: BTreeSet::new(),
            successors: BTreeSet::new(),
        }
    }

    /// Returns the globally unique id
    pub fn guid(&self) -> Guid {
        self.guid
    }

    /// Returns the operator's kind and attributes
    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    /// Returns the kind tag
    pub fn op_type(&self) -> OpType {
        self.kind.op_type()
    }

    /// Returns the ordered input tensors
    pub fn inputs(&self) -> &[TensorId] {
        &self.inputs
    }

    /// Returns the ordered output tensors
    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    /// Iterates over operators producing this operator's inputs
    pub fn predecessors(&self) -> impl Iterator<Item = OpId> + '_ {
        self.predecessors.iter().cloned()
    }

    /// Iterates over operators consuming this operator's outputs
    pub fn successors(&self) -> impl Iterator<Item = OpId> + '_ {
        self.successors.iter().cloned()
    }
}
