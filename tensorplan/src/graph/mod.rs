//! Infrastructure for representing tensor programs as graphs
//!
//! A [`Graph`] owns every [`Tensor`] and [`Operator`] in arena-style storage;
//! they refer to each other by [`TensorId`] and [`OpId`] handles.  Adding an
//! operator wires up all of its edges, in both directions:
//!
//! ```text
//!            source            targets
//!   Operator ------> Tensor ------------> Operator
//!      |                                     ^
//!      |------------- successors ------------|
//!      <------------ predecessors -----------|
//! ```
mod indexed;
mod memory;
mod op;
mod optimize;
mod tensor;
mod uid;

use indexed::{IndexSlab, define_index};
pub use op::{BinaryOpcode, InferShape, OpKind, OpType, Operator, UnaryOpcode};
pub use tensor::{DataType, Tensor};
pub use uid::{Fuid, Guid};

use crate::{Error, alloc::Allocator, runtime::Runtime, shape::Shape};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::sync::Arc;

define_index!(TensorId, "An index in the `Graph::tensors` arena");
define_index!(OpId, "An index in the `Graph::ops` arena");

/// A `Graph` holds a set of tensors and the operators which connect them,
/// along with the allocator which will eventually back their memory.
///
/// Distinct graphs may be built and planned on different threads, but a
/// single graph is not designed for concurrent access.
#[derive(Debug)]
pub struct Graph {
    tensors: IndexSlab<Tensor, TensorId>,
    ops: IndexSlab<Operator, OpId>,

    /// Tensors in insertion order
    tensor_order: Vec<TensorId>,

    /// Operators in insertion order, or topological order once sorted
    op_order: Vec<OpId>,

    sorted: bool,
    allocator: Allocator,
}

static_assertions::assert_impl_all!(Graph: Send);
static_assertions::assert_not_impl_any!(Graph: Sync);

#[cfg(feature = "cpu")]
impl Default for Graph {
    fn default() -> Self {
        Self::new(crate::runtime::CpuRuntime::shared())
    }
}

impl Graph {
    /// Builds an empty graph whose memory will come from `runtime`
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self::with_allocator(Allocator::new(runtime))
    }

    /// Builds an empty graph with a custom allocator alignment
    pub fn with_alignment(
        runtime: Arc<dyn Runtime>,
        alignment: usize,
    ) -> Result<Self, Error> {
        Ok(Self::with_allocator(Allocator::with_alignment(
            runtime, alignment,
        )?))
    }

    fn with_allocator(allocator: Allocator) -> Self {
        Self {
            tensors: IndexSlab::default(),
            ops: IndexSlab::default(),
            tensor_order: vec![],
            op_order: vec![],
            sorted: false,
            allocator,
        }
    }

    /// Returns the number of live tensors
    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    /// Returns the number of live operators
    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    /// Checks whether the operator list is in topological order
    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// Returns the graph's allocator
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Looks up a tensor, returning `None` if it has been removed
    pub fn tensor(&self, t: TensorId) -> Option<&Tensor> {
        self.tensors.get(t)
    }

    /// Looks up an operator, returning `None` if it has been removed
    pub fn operator(&self, op: OpId) -> Option<&Operator> {
        self.ops.get(op)
    }

    /// Finds the tensor with the given functional id
    pub fn get_tensor_by_fuid(&self, fuid: Fuid) -> Option<TensorId> {
        self.tensor_order
            .iter()
            .find(|t| self.tensors[**t].fuid == fuid)
            .cloned()
    }

    /// Iterates over tensors in insertion order
    pub fn tensors(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.tensor_order.iter().cloned()
    }

    /// Iterates over operators in list order (topological, once sorted)
    pub fn operators(&self) -> impl Iterator<Item = OpId> + '_ {
        self.op_order.iter().cloned()
    }

    /// Iterates over tensors with no source operator
    pub fn inputs(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.tensors().filter(|t| self.tensors[*t].source.is_none())
    }

    /// Iterates over tensors with no consuming operators
    pub fn outputs(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.tensors().filter(|t| self.tensors[*t].targets.is_empty())
    }

    /// Returns the single output of an operator
    ///
    /// Returns `None` if the operator is absent or has a different number of
    /// outputs.
    pub fn output(&self, op: OpId) -> Option<TensorId> {
        match self.ops.get(op)?.outputs.as_slice() {
            [t] => Some(*t),
            _ => None,
        }
    }

    fn check_tensor(&self, t: TensorId) -> Result<(), Error> {
        if self.tensors.contains(t) {
            Ok(())
        } else {
            Err(Error::BadTensor(t))
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Construction

    /// Adds a new tensor with no source and no targets
    ///
    /// The tensor must be connected to an operator before the graph is
    /// [checked](Self::check_valid).
    pub fn add_tensor(&mut self, shape: Shape, dtype: DataType) -> TensorId {
        let t = self.tensors.insert(Tensor::new(shape, dtype));
        self.tensor_order.push(t);
        t
    }

    /// Adds an operator, wiring up its tensor and operator edges
    ///
    /// Operators may be added in any order; edges to producers and consumers
    /// that are already present are connected in both directions.
    pub fn add_operator_and_connect(
        &mut self,
        kind: OpKind,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> Result<OpId, Error> {
        kind.check_input_count(inputs.len())?;
        for &t in inputs.iter().chain(&outputs) {
            self.check_tensor(t)?;
        }
        let mut seen = BTreeSet::new();
        for &t in &outputs {
            if self.tensors[t].source.is_some() || !seen.insert(t) {
                return Err(Error::MultipleSources(t));
            }
            if inputs.contains(&t) {
                return Err(Error::InvalidGraph(format!(
                    "operator consumes its own output {t:?}"
                )));
            }
        }

        let op = self.ops.insert(Operator::new(kind, inputs, outputs));
        self.op_order.push(op);
        self.sorted = false;

        for t in self.ops[op].inputs.clone() {
            let tensor = &mut self.tensors[t];
            tensor.targets.insert(op);
            if let Some(pred) = tensor.source {
                self.link(pred, op);
            }
        }
        for t in self.ops[op].outputs.clone() {
            let tensor = &mut self.tensors[t];
            tensor.source = Some(op);
            for succ in tensor.targets.clone() {
                self.link(op, succ);
            }
        }
        Ok(op)
    }

    /// Adds an operator along with freshly-created output tensors
    ///
    /// Output shapes are inferred from the inputs and the output element type
    /// matches the first input.  On error, the graph is left unchanged.
    pub fn add_op(
        &mut self,
        kind: OpKind,
        inputs: &[TensorId],
    ) -> Result<OpId, Error> {
        for &t in inputs {
            self.check_tensor(t)?;
        }
        let shapes = inputs
            .iter()
            .map(|t| self.tensors[*t].shape.as_slice())
            .collect::<Vec<_>>();
        let out_shapes = kind.infer_shape(&shapes)?;
        let dtype = inputs
            .first()
            .map(|t| self.tensors[*t].dtype)
            .unwrap_or(DataType::Float32);
        let outputs = out_shapes
            .into_iter()
            .map(|s| self.add_tensor(s, dtype))
            .collect();
        self.add_operator_and_connect(kind, inputs.to_vec(), outputs)
    }

    /// Adds a transpose of `input` with the given axis permutation
    pub fn add_transpose(
        &mut self,
        input: TensorId,
        perm: Vec<usize>,
    ) -> Result<OpId, Error> {
        self.add_op(OpKind::Transpose { perm }, &[input])
    }

    /// Adds a matrix multiplication of `a` and `b`
    pub fn add_matmul(
        &mut self,
        a: TensorId,
        b: TensorId,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<OpId, Error> {
        self.add_op(OpKind::MatMul { trans_a, trans_b }, &[a, b])
    }

    /// Adds an identity operation
    pub fn add_identity(&mut self, input: TensorId) -> Result<OpId, Error> {
        self.add_op(OpKind::Identity, &[input])
    }

    /// Adds an elementwise unary operation
    pub fn add_unary(
        &mut self,
        op: UnaryOpcode,
        input: TensorId,
    ) -> Result<OpId, Error> {
        self.add_op(OpKind::Unary(op), &[input])
    }

    /// Adds an elementwise binary operation with broadcasting
    pub fn add_binary(
        &mut self,
        op: BinaryOpcode,
        a: TensorId,
        b: TensorId,
    ) -> Result<OpId, Error> {
        self.add_op(OpKind::Binary(op), &[a, b])
    }

    ////////////////////////////////////////////////////////////////////////////
    // Edge maintenance

    fn link(&mut self, pred: OpId, succ: OpId) {
        self.ops[pred].successors.insert(succ);
        self.ops[succ].predecessors.insert(pred);
    }

    fn unlink(&mut self, pred: OpId, succ: OpId) {
        self.ops[pred].successors.remove(&succ);
        self.ops[succ].predecessors.remove(&pred);
    }

    /// Recomputes an operator's predecessors from the sources of its inputs
    fn rebuild_predecessors(&mut self, op: OpId) {
        let want = self.ops[op]
            .inputs
            .iter()
            .filter_map(|t| self.tensors[*t].source)
            .collect::<BTreeSet<_>>();
        let have = self.ops[op].predecessors.clone();
        for &p in have.difference(&want) {
            self.unlink(p, op);
        }
        for &p in want.difference(&have) {
            self.link(p, op);
        }
    }

    /// Points every use of `old` in `op`'s inputs at `new` instead
    pub(crate) fn replace_input(
        &mut self,
        op: OpId,
        old: TensorId,
        new: TensorId,
    ) {
        for t in self.ops[op].inputs.iter_mut().filter(|t| **t == old) {
            *t = new;
        }
        self.tensors[old].targets.remove(&op);
        self.tensors[new].targets.insert(op);
        self.rebuild_predecessors(op);
        self.sorted = false;
    }

    /// Removes an operator, first detaching every edge which refers to it
    pub(crate) fn remove_operator(&mut self, op: OpId) {
        let operator = &self.ops[op];
        let preds = operator.predecessors.clone();
        let succs = operator.successors.clone();
        let inputs = operator.inputs.clone();
        let outputs = operator.outputs.clone();
        for p in preds {
            self.unlink(p, op);
        }
        for s in succs {
            self.unlink(op, s);
        }
        for t in inputs {
            if let Some(tensor) = self.tensors.get_mut(t) {
                tensor.targets.remove(&op);
            }
        }
        for t in outputs {
            if let Some(tensor) = self.tensors.get_mut(t) {
                if tensor.source == Some(op) {
                    tensor.source = None;
                }
            }
        }
        self.ops.remove(op);
        self.op_order.retain(|o| *o != op);
    }

    /// Removes a tensor which no live operator refers to
    ///
    /// # Panics
    /// If the tensor still has a source or targets
    pub(crate) fn remove_tensor(&mut self, t: TensorId) {
        let tensor = &self.tensors[t];
        assert!(
            tensor.source.is_none() && tensor.targets.is_empty(),
            "cannot remove connected tensor {t:?}"
        );
        self.tensors.remove(t);
        self.tensor_order.retain(|o| *o != t);
    }

    ////////////////////////////////////////////////////////////////////////////
    // Sorting

    /// Sorts the operator list into topological order
    ///
    /// Operators are placed level by level: each round places every operator
    /// whose inputs are graph inputs or were produced by an operator placed in
    /// an earlier round.  Returns `false` if the graph contains a cycle, in
    /// which case the operator list is unchanged.
    pub fn topo_sort(&mut self) -> bool {
        if self.sorted {
            return true;
        }
        let mut sorted = Vec::with_capacity(self.op_order.len());
        let mut placed = BTreeSet::new();
        while sorted.len() < self.op_order.len() {
            let ready = self
                .op_order
                .iter()
                .filter(|op| {
                    !placed.contains(*op)
                        && self.ops[**op].inputs.iter().all(|t| {
                            self.tensors[*t]
                                .source
                                .is_none_or(|s| placed.contains(&s))
                        })
                })
                .cloned()
                .collect::<Vec<_>>();
            if ready.is_empty() {
                log::warn!(
                    "topological sort failed: {} of {} operators are in a cycle",
                    self.op_order.len() - sorted.len(),
                    self.op_order.len()
                );
                return false;
            }
            placed.extend(ready.iter().cloned());
            sorted.extend(ready);
        }
        self.op_order = sorted;
        self.sorted = true;
        true
    }

    ////////////////////////////////////////////////////////////////////////////
    // Validation

    /// Checks every structural invariant of the graph
    ///
    /// Returns a description of the first violation found.
    pub fn validate(&self) -> Result<(), Error> {
        let bad = |s: String| Err(Error::InvalidGraph(s));

        if self.tensor_order.len() != self.tensors.len() {
            return bad("tensor list is out of sync".to_owned());
        }
        if self.op_order.len() != self.ops.len() {
            return bad("operator list is out of sync".to_owned());
        }

        let mut fuids = BTreeMap::new();
        for &t in &self.tensor_order {
            let Some(tensor) = self.tensors.get(t) else {
                return bad(format!("tensor {t:?} has been removed"));
            };
            if tensor.source.is_none() && tensor.targets.is_empty() {
                return bad(format!("tensor {} is orphaned", tensor.guid));
            }
            if let Some(src) = tensor.source {
                match self.ops.get(src) {
                    Some(op) if op.outputs.contains(&t) => (),
                    _ => {
                        return bad(format!(
                            "tensor {} has a bad source",
                            tensor.guid
                        ));
                    }
                }
            }
            for &op in &tensor.targets {
                match self.ops.get(op) {
                    Some(o) if o.inputs.contains(&t) => (),
                    _ => {
                        return bad(format!(
                            "tensor {} has a bad target",
                            tensor.guid
                        ));
                    }
                }
            }
            if let Some(prev) = fuids.insert(tensor.fuid, tensor.guid) {
                return bad(format!(
                    "tensors {prev} and {} share fuid {}",
                    tensor.guid, tensor.fuid
                ));
            }
        }

        for &op in &self.op_order {
            let Some(operator) = self.ops.get(op) else {
                return bad(format!("operator {op:?} has been removed"));
            };
            if let Err(e) =
                operator.kind.check_input_count(operator.inputs.len())
            {
                return bad(format!("operator {}: {e}", operator.guid));
            }
            let mut preds = BTreeSet::new();
            for &t in &operator.inputs {
                let Some(tensor) = self.tensors.get(t) else {
                    return bad(format!(
                        "operator {} has a missing input",
                        operator.guid
                    ));
                };
                if !tensor.targets.contains(&op) {
                    return bad(format!(
                        "operator {} is not a target of its input {}",
                        operator.guid, tensor.guid
                    ));
                }
                preds.extend(tensor.source);
            }
            let mut succs = BTreeSet::new();
            for &t in &operator.outputs {
                let Some(tensor) = self.tensors.get(t) else {
                    return bad(format!(
                        "operator {} has a missing output",
                        operator.guid
                    ));
                };
                if tensor.source != Some(op) {
                    return bad(format!(
                        "operator {} is not the source of its output {}",
                        operator.guid, tensor.guid
                    ));
                }
                succs.extend(tensor.targets.iter().cloned());
            }
            if preds != operator.predecessors {
                return bad(format!(
                    "operator {} has inconsistent predecessors",
                    operator.guid
                ));
            }
            if succs != operator.successors {
                return bad(format!(
                    "operator {} has inconsistent successors",
                    operator.guid
                ));
            }
        }
        Ok(())
    }

    /// Checks every structural invariant of the graph
    ///
    /// # Panics
    /// If the graph is invalid; this indicates a bug in graph construction or
    /// rewriting.
    pub fn check_valid(&self) -> bool {
        if let Err(e) = self.validate() {
            panic!("{e}");
        }
        true
    }

    ////////////////////////////////////////////////////////////////////////////
    // Debug output

    fn guids<I: Iterator<Item = OpId>>(&self, ops: I) -> Vec<u64> {
        ops.map(|o| self.ops[o].guid.get()).collect()
    }

    fn tensor_guids(&self, ts: &[TensorId]) -> Vec<u64> {
        ts.iter().map(|t| self.tensors[*t].guid.get()).collect()
    }

    /// Converts the entire graph into a GraphViz drawing
    pub fn dot(&self) -> String {
        let mut out = "digraph mygraph{\n".to_owned();
        for &t in &self.tensor_order {
            let tensor = &self.tensors[t];
            writeln!(
                out,
                r#"t{} [label = "{:?} {}" shape="oval" color="green1"]"#,
                tensor.guid, tensor.shape, tensor.dtype
            )
            .unwrap();
        }
        for &op in &self.op_order {
            let operator = &self.ops[op];
            writeln!(
                out,
                r#"o{} [label = "{}" shape="box" color="goldenrod1"]"#,
                operator.guid, operator.kind
            )
            .unwrap();
            for t in &operator.inputs {
                writeln!(out, "t{} -> o{}", self.tensors[*t].guid, operator.guid)
                    .unwrap();
            }
            for t in &operator.outputs {
                writeln!(out, "o{} -> t{}", operator.guid, self.tensors[*t].guid)
                    .unwrap();
            }
        }
        out += "}\n";
        out
    }
}

impl std::fmt::Display for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Graph Tensors:")?;
        for &t in &self.tensor_order {
            let tensor = &self.tensors[t];
            write!(
                f,
                "Tensor {}, Fuid {}, shape {:?}, dtype {}, source ",
                tensor.guid, tensor.fuid, tensor.shape, tensor.dtype
            )?;
            match tensor.source {
                Some(op) => write!(f, "{}", self.ops[op].guid)?,
                None => write!(f, "None")?,
            }
            writeln!(f, ", targets {:?}", self.guids(tensor.targets()))?;
        }
        writeln!(f, "Graph operators:")?;
        for &op in &self.op_order {
            let operator = &self.ops[op];
            writeln!(
                f,
                "OP {}, pred {:?}, succ {:?}, {}, inputs {:?}, outputs {:?}",
                operator.guid,
                self.guids(operator.predecessors()),
                self.guids(operator.successors()),
                operator.kind,
                self.tensor_guids(&operator.inputs),
                self.tensor_guids(&operator.outputs),
            )?;
        }
        Ok(())
    }
}
