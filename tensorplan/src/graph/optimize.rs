//! Graph rewriting to a fixed point
use super::{Graph, OpId, OpKind, TensorId};
use crate::shape;

/// A single rewrite found by [`Graph::find_rewrite`]
#[derive(Copy, Clone, Debug)]
enum Rewrite {
    /// Two transposes which undo each other
    CancelTransposes { first: OpId, second: OpId },
    /// A trailing-axis swap absorbed into a matmul's flags
    FuseTransposeMatMul { transpose: OpId, matmul: OpId },
}

impl Graph {
    /// Rewrites the graph until no rule applies, returning the rewrite count
    ///
    /// Two rules are applied:
    /// - A pair of chained transposes whose permutations compose to the
    ///   identity is removed, and consumers of the second transpose read the
    ///   first transpose's input directly.
    /// - A transpose which swaps the two trailing axes of a matmul operand is
    ///   folded into the matmul's `trans_a` / `trans_b` flag.
    ///
    /// In both cases, the transpose's output must not be consumed by any other
    /// operator.  Every rewrite removes at least one operator, so this always
    /// terminates.
    ///
    /// ```
    /// # use tensorplan::graph::{Graph, DataType, OpKind};
    /// let mut g = Graph::default();
    /// let a = g.add_tensor(vec![4, 3], DataType::Float32);
    /// let b = g.add_tensor(vec![4, 5], DataType::Float32);
    /// let t = g.add_transpose(a, vec![1, 0])?;
    /// let at = g.output(t).unwrap();
    /// let m = g.add_matmul(at, b, false, false)?;
    ///
    /// assert_eq!(g.optimize(), 1);
    /// let mm = g.operator(m).unwrap();
    /// assert!(matches!(mm.kind(), OpKind::MatMul { trans_a: true, trans_b: false }));
    /// assert_eq!(mm.inputs(), &[a, b]);
    /// # Ok::<(), tensorplan::Error>(())
    /// ```
    pub fn optimize(&mut self) -> usize {
        let mut count = 0;
        while let Some(r) = self.find_rewrite() {
            log::debug!("applying {r:?}");
            self.apply_rewrite(r);
            debug_assert!(self.validate().is_ok(), "{:?}", self.validate());
            count += 1;
        }
        if count > 0 {
            log::debug!("optimizer applied {count} rewrites");
        }
        count
    }

    /// Returns the first rewrite which applies, in operator list order
    fn find_rewrite(&self) -> Option<Rewrite> {
        self.op_order.iter().find_map(|&op| {
            let OpKind::Transpose { perm } = &self.ops[op].kind else {
                return None;
            };
            let out = self.output(op)?;
            let mut targets = self.tensors[out].targets.iter();
            let (Some(&consumer), None) = (targets.next(), targets.next())
            else {
                return None;
            };
            match &self.ops[consumer].kind {
                OpKind::Transpose { perm: next } => {
                    let second_out = self.output(consumer)?;
                    (!self.tensors[second_out].targets.is_empty()
                        && shape::composes_to_identity(perm, next))
                    .then_some(Rewrite::CancelTransposes {
                        first: op,
                        second: consumer,
                    })
                }
                OpKind::MatMul { .. } => shape::swaps_trailing_axes(perm)
                    .then_some(Rewrite::FuseTransposeMatMul {
                        transpose: op,
                        matmul: consumer,
                    }),
                _ => None,
            }
        })
    }

    fn transpose_input(&self, op: OpId) -> TensorId {
        self.ops[op].inputs[0]
    }

    fn apply_rewrite(&mut self, r: Rewrite) {
        match r {
            Rewrite::CancelTransposes { first, second } => {
                let src = self.transpose_input(first);
                let mid = self.ops[first].outputs[0];
                let out = self.ops[second].outputs[0];
                for consumer in self.tensors[out].targets.clone() {
                    self.replace_input(consumer, out, src);
                }
                self.remove_operator(second);
                self.remove_operator(first);
                self.remove_tensor(out);
                self.remove_tensor(mid);
            }
            Rewrite::FuseTransposeMatMul { transpose, matmul } => {
                let src = self.transpose_input(transpose);
                let mid = self.ops[transpose].outputs[0];
                let flags = self.ops[matmul]
                    .inputs
                    .iter()
                    .map(|t| *t == mid)
                    .collect::<Vec<_>>();
                if let OpKind::MatMul { trans_a, trans_b } =
                    &mut self.ops[matmul].kind
                {
                    *trans_a ^= flags[0];
                    *trans_b ^= flags[1];
                }
                self.replace_input(matmul, mid, src);
                self.remove_operator(transpose);
                self.remove_tensor(mid);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::{BinaryOpcode, DataType, UnaryOpcode};
    use crate::runtime::CountingRuntime;
    use std::sync::Arc;

    fn graph() -> Graph {
        Graph::new(Arc::new(CountingRuntime::default()))
    }

    fn matmul_flags(g: &Graph, op: OpId) -> (bool, bool) {
        match g.operator(op).unwrap().kind() {
            OpKind::MatMul { trans_a, trans_b } => (*trans_a, *trans_b),
            k => panic!("expected MatMul, got {k}"),
        }
    }

    #[test]
    fn test_cancel_transposes() {
        let mut g = graph();
        let a = g.add_tensor(vec![2, 3], DataType::Float32);
        let p = g.add_transpose(a, vec![1, 0]).unwrap();
        let b = g.output(p).unwrap();
        let s = g.add_transpose(b, vec![1, 0]).unwrap();
        let c = g.output(s).unwrap();
        let i = g.add_identity(c).unwrap();
        let d = g.output(i).unwrap();

        assert_eq!(g.optimize(), 1);
        assert!(g.check_valid());
        assert_eq!(g.op_count(), 1);
        assert_eq!(g.tensor_count(), 2);
        assert!(g.operator(p).is_none());
        assert!(g.operator(s).is_none());
        assert!(g.tensor(b).is_none());
        assert!(g.tensor(c).is_none());

        let id = g.operator(i).unwrap();
        assert_eq!(id.inputs(), &[a]);
        assert_eq!(id.predecessors().count(), 0);
        assert_eq!(g.tensor(a).unwrap().targets().collect::<Vec<_>>(), [i]);
        assert_eq!(g.tensor(d).unwrap().shape(), &[2, 3]);
    }

    #[test]
    fn test_cancel_keeps_predecessor() {
        let mut g = graph();
        let x = g.add_tensor(vec![2, 3, 4], DataType::Float32);
        let r = g.add_unary(UnaryOpcode::Relu, x).unwrap();
        let a = g.output(r).unwrap();
        let p = g.add_transpose(a, vec![0, 2, 1]).unwrap();
        let b = g.output(p).unwrap();
        let s = g.add_transpose(b, vec![0, 2, 1]).unwrap();
        let c = g.output(s).unwrap();
        let n = g.add_unary(UnaryOpcode::Neg, c).unwrap();

        assert_eq!(g.optimize(), 1);
        assert!(g.check_valid());
        let neg = g.operator(n).unwrap();
        assert_eq!(neg.inputs(), &[a]);
        assert_eq!(neg.predecessors().collect::<Vec<_>>(), [r]);
        assert_eq!(
            g.operator(r).unwrap().successors().collect::<Vec<_>>(),
            [n]
        );
    }

    #[test]
    fn test_cancel_inverse_pair() {
        let mut g = graph();
        let a = g.add_tensor(vec![2, 3, 4], DataType::Float32);
        let p = g.add_transpose(a, vec![1, 2, 0]).unwrap();
        let b = g.output(p).unwrap();
        let s = g.add_transpose(b, vec![2, 0, 1]).unwrap();
        let c = g.output(s).unwrap();
        assert_eq!(g.tensor(c).unwrap().shape(), &[2, 3, 4]);
        g.add_identity(c).unwrap();

        assert_eq!(g.optimize(), 1);
        assert_eq!(g.op_count(), 1);
    }

    #[test]
    fn test_non_inverse_pair_untouched() {
        let mut g = graph();
        let a = g.add_tensor(vec![2, 3, 4], DataType::Float32);
        let p = g.add_transpose(a, vec![1, 2, 0]).unwrap();
        let b = g.output(p).unwrap();
        let s = g.add_transpose(b, vec![1, 2, 0]).unwrap();
        let c = g.output(s).unwrap();
        g.add_identity(c).unwrap();

        assert_eq!(g.optimize(), 0);
        assert_eq!(g.op_count(), 3);
    }

    #[test]
    fn test_cancel_skipped_for_shared_output() {
        let mut g = graph();
        let a = g.add_tensor(vec![2, 3], DataType::Float32);
        let p = g.add_transpose(a, vec![1, 0]).unwrap();
        let b = g.output(p).unwrap();
        let s = g.add_transpose(b, vec![1, 0]).unwrap();
        let c = g.output(s).unwrap();
        g.add_identity(c).unwrap();
        g.add_identity(b).unwrap();

        assert_eq!(g.optimize(), 0);
        assert_eq!(g.op_count(), 4);
    }

    #[test]
    fn test_cancel_skipped_for_graph_output() {
        let mut g = graph();
        let a = g.add_tensor(vec![2, 3], DataType::Float32);
        let p = g.add_transpose(a, vec![1, 0]).unwrap();
        let b = g.output(p).unwrap();
        g.add_transpose(b, vec![1, 0]).unwrap();

        assert_eq!(g.optimize(), 0);
        assert_eq!(g.op_count(), 2);
    }

    #[test]
    fn test_fuse_matmul_b() {
        let mut g = graph();
        let a = g.add_tensor(vec![2, 3, 4], DataType::Float32);
        let b = g.add_tensor(vec![2, 5, 4], DataType::Float32);
        let p = g.add_transpose(b, vec![0, 2, 1]).unwrap();
        let bt = g.output(p).unwrap();
        let m = g.add_matmul(a, bt, false, false).unwrap();
        let c = g.output(m).unwrap();
        assert_eq!(g.tensor(c).unwrap().shape(), &[2, 3, 5]);

        assert_eq!(g.optimize(), 1);
        assert!(g.check_valid());
        assert_eq!(matmul_flags(&g, m), (false, true));
        let mm = g.operator(m).unwrap();
        assert_eq!(mm.inputs(), &[a, b]);
        assert_eq!(mm.predecessors().count(), 0);
        assert!(g.tensor(bt).is_none());

        // The fused matmul still produces the same shape
        g.shape_infer().unwrap();
        assert_eq!(g.tensor(c).unwrap().shape(), &[2, 3, 5]);
    }

    #[test]
    fn test_fuse_both_inputs() {
        let mut g = graph();
        let a = g.add_tensor(vec![4, 3], DataType::Float32);
        let b = g.add_tensor(vec![5, 4], DataType::Float32);
        let pa = g.add_transpose(a, vec![1, 0]).unwrap();
        let pb = g.add_transpose(b, vec![1, 0]).unwrap();
        let at = g.output(pa).unwrap();
        let bt = g.output(pb).unwrap();
        let m = g.add_matmul(at, bt, false, false).unwrap();

        assert_eq!(g.optimize(), 2);
        assert!(g.check_valid());
        assert_eq!(matmul_flags(&g, m), (true, true));
        assert_eq!(g.operator(m).unwrap().inputs(), &[a, b]);
        assert_eq!(g.op_count(), 1);
    }

    #[test]
    fn test_fuse_toggles_existing_flag() {
        let mut g = graph();
        let a = g.add_tensor(vec![3, 4], DataType::Float32);
        let b = g.add_tensor(vec![4, 5], DataType::Float32);
        let p = g.add_transpose(a, vec![1, 0]).unwrap();
        let at = g.output(p).unwrap();
        let m = g.add_matmul(at, b, true, false).unwrap();

        assert_eq!(g.optimize(), 1);
        assert_eq!(matmul_flags(&g, m), (false, false));
    }

    #[test]
    fn test_full_reverse_not_fused() {
        let mut g = graph();
        let a = g.add_tensor(vec![2, 3, 4], DataType::Float32);
        let b = g.add_tensor(vec![5, 4, 2], DataType::Float32);
        let p = g.add_transpose(b, vec![2, 1, 0]).unwrap();
        let bt = g.output(p).unwrap();
        let m = g.add_matmul(a, bt, false, false).unwrap();

        assert_eq!(g.optimize(), 0);
        assert_eq!(matmul_flags(&g, m), (false, false));
        assert_eq!(g.op_count(), 2);
    }

    #[test]
    fn test_fuse_skipped_for_shared_output() {
        let mut g = graph();
        let a = g.add_tensor(vec![3, 4], DataType::Float32);
        let b = g.add_tensor(vec![3, 5], DataType::Float32);
        let p = g.add_transpose(a, vec![1, 0]).unwrap();
        let at = g.output(p).unwrap();
        g.add_matmul(at, b, false, false).unwrap();
        g.add_unary(UnaryOpcode::Abs, at).unwrap();

        assert_eq!(g.optimize(), 0);
    }

    #[test]
    fn test_chained_rewrites() {
        // relu -> T -> T -> T -> matmul: one pair cancels, then the last
        // transpose is fused.
        let mut g = graph();
        let x = g.add_tensor(vec![4, 3], DataType::Float32);
        let w = g.add_tensor(vec![4, 6], DataType::Float32);
        let r = g.add_unary(UnaryOpcode::Relu, x).unwrap();
        let mut t = g.output(r).unwrap();
        for _ in 0..3 {
            let op = g.add_transpose(t, vec![1, 0]).unwrap();
            t = g.output(op).unwrap();
        }
        let m = g.add_matmul(t, w, false, false).unwrap();
        let out = g.output(m).unwrap();
        g.add_binary(BinaryOpcode::Add, out, out).unwrap();

        assert_eq!(g.optimize(), 2);
        assert!(g.check_valid());
        assert_eq!(g.op_count(), 3);
        assert_eq!(matmul_flags(&g, m), (true, false));
        assert_eq!(
            g.operator(m).unwrap().predecessors().collect::<Vec<_>>(),
            [r]
        );
        assert!(g.topo_sort());
    }
}
