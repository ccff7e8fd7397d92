//! Shape inference and memory binding
use super::Graph;
use crate::{Error, runtime::Blob};

impl Graph {
    /// Recomputes every operator's output shapes, in operator list order
    ///
    /// Tensors whose stored shape disagrees with the inferred shape are
    /// updated.  Sort the graph first if downstream shapes depend on
    /// upstream updates.
    pub fn shape_infer(&mut self) -> Result<(), Error> {
        for &op in &self.op_order {
            let operator = &self.ops[op];
            let shapes = operator
                .inputs
                .iter()
                .map(|t| self.tensors[*t].shape.as_slice())
                .collect::<Vec<_>>();
            let out = operator.kind.infer_shape(&shapes)?;
            if out.len() != operator.outputs.len() {
                return Err(Error::OutputCount(
                    out.len(),
                    operator.outputs.len(),
                ));
            }
            for (t, shape) in operator.outputs.clone().into_iter().zip(out) {
                let tensor = &mut self.tensors[t];
                if tensor.shape != shape {
                    log::debug!(
                        "tensor {} shape {:?} -> {:?}",
                        tensor.guid,
                        tensor.shape,
                        shape
                    );
                    tensor.shape = shape;
                }
            }
        }
        Ok(())
    }

    /// Plans and binds memory for every tensor in the graph
    ///
    /// The graph is sorted, then each tensor receives an offset from the
    /// allocator; the arena is materialized once and every tensor is bound to
    /// its region.  Tensors are never freed, so no two regions overlap.
    ///
    /// If the runtime cannot provide the arena, every planned offset is
    /// returned to the allocator, so the call may be retried.
    pub fn data_malloc(&mut self) -> Result<(), Error> {
        if self.allocator.is_materialized() {
            return Err(Error::AlreadyAllocated);
        }
        if !self.topo_sort() {
            return Err(Error::CyclicGraph);
        }

        let sizes = self
            .tensor_order
            .iter()
            .map(|t| self.tensors[*t].bytes().map(|b| (*t, b)))
            .collect::<Result<Vec<_>, Error>>()?;
        let offsets = sizes
            .into_iter()
            .map(|(t, bytes)| (t, self.allocator.alloc(bytes), bytes))
            .collect::<Vec<_>>();

        let base = match self.allocator.get_ptr() {
            Ok(base) => base,
            Err(e) => {
                log::warn!("could not materialize arena: {e}");
                for &(_, offset, bytes) in offsets.iter().rev() {
                    self.allocator.free(offset, bytes);
                }
                return Err(e);
            }
        };
        for (t, offset, bytes) in offsets {
            // SAFETY: every offset lies within the `peak` bytes of the arena
            let ptr = unsafe { base.add(offset) };
            self.tensors[t].set_data_blob(Blob::new(ptr, bytes));
        }
        self.allocator.info();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::{
        Error,
        graph::{DataType, Graph, OpKind},
        runtime::CountingRuntime,
    };
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_shape_infer_fixes_stale_shape() {
        let mut g = Graph::new(Arc::new(CountingRuntime::default()));
        let a = g.add_tensor(vec![2, 3, 4], DataType::Float32);
        let b = g.add_tensor(vec![2, 4, 5], DataType::Float32);
        let c = g.add_tensor(vec![1], DataType::Float32);
        g.add_operator_and_connect(
            OpKind::MatMul {
                trans_a: false,
                trans_b: false,
            },
            vec![a, b],
            vec![c],
        )
        .unwrap();
        g.shape_infer().unwrap();
        assert_eq!(g.tensor(c).unwrap().shape(), &[2, 3, 5]);
    }

    #[test]
    fn test_shape_infer_errors() {
        let mut g = Graph::new(Arc::new(CountingRuntime::default()));
        let a = g.add_tensor(vec![3, 4], DataType::Float32);
        let b = g.add_tensor(vec![5, 6], DataType::Float32);
        let c = g.add_tensor(vec![3, 6], DataType::Float32);
        g.add_operator_and_connect(
            OpKind::MatMul {
                trans_a: false,
                trans_b: false,
            },
            vec![a, b],
            vec![c],
        )
        .unwrap();
        assert!(matches!(g.shape_infer(), Err(Error::MismatchedDims(4, 5))));

        let mut g = Graph::new(Arc::new(CountingRuntime::default()));
        let a = g.add_tensor(vec![3], DataType::Float32);
        let b = g.add_tensor(vec![3], DataType::Float32);
        let c = g.add_tensor(vec![3], DataType::Float32);
        g.add_operator_and_connect(OpKind::Identity, vec![a], vec![b, c])
            .unwrap();
        assert!(matches!(g.shape_infer(), Err(Error::OutputCount(1, 2))));
    }

    #[test]
    fn test_data_malloc_binds_every_tensor() {
        let rt = Arc::new(CountingRuntime::default());
        let mut g = Graph::new(rt.clone());
        let a = g.add_tensor(vec![2, 3], DataType::Float32);
        let t = g.add_transpose(a, vec![1, 0]).unwrap();
        let b = g.output(t).unwrap();
        let w = g.add_tensor(vec![2, 1], DataType::Float32);
        let m = g.add_matmul(b, w, false, false).unwrap();
        let out = g.output(m).unwrap();

        g.data_malloc().unwrap();
        assert_eq!(rt.allocs.load(Ordering::SeqCst), 1);

        let mut ranges = vec![];
        for t in [a, b, w, out] {
            let tensor = g.tensor(t).unwrap();
            let blob = tensor.data_blob().unwrap();
            assert_eq!(blob.len(), tensor.bytes().unwrap());
            assert_eq!(blob.as_ptr() as usize % 8, 0);
            ranges.push(blob.addr_range());
        }
        ranges.sort_by_key(|r| r.start);
        for w in ranges.windows(2) {
            assert!(w[0].end <= w[1].start);
        }
        let info = g.allocator().info();
        assert_eq!(info.used, info.peak);
        // The [3, 1] output rounds up from 12 to 16 bytes
        assert_eq!(info.peak, 24 + 24 + 8 + 16);

        assert!(matches!(g.data_malloc(), Err(Error::AlreadyAllocated)));
        assert_eq!(rt.allocs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_data_malloc_cycle() {
        let rt = Arc::new(CountingRuntime::default());
        let mut g = Graph::new(rt.clone());
        let a = g.add_tensor(vec![2], DataType::Float32);
        let b = g.add_tensor(vec![2], DataType::Float32);
        g.add_operator_and_connect(OpKind::Identity, vec![a], vec![b])
            .unwrap();
        g.add_operator_and_connect(OpKind::Identity, vec![b], vec![a])
            .unwrap();
        assert!(matches!(g.data_malloc(), Err(Error::CyclicGraph)));
        assert!(g.tensor(a).unwrap().data_blob().is_none());
        assert_eq!(rt.allocs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_data_malloc_runtime_failure() {
        let rt = Arc::new(CountingRuntime::default());
        let mut g = Graph::new(rt.clone());
        let a = g.add_tensor(vec![4, 4], DataType::Float32);
        g.add_identity(a).unwrap();

        rt.fail_next.store(true, Ordering::SeqCst);
        assert!(matches!(g.data_malloc(), Err(Error::IoError(_))));
        assert!(!g.allocator().is_materialized());
        assert!(g.tensor(a).unwrap().data_blob().is_none());
        let info = g.allocator().info();
        assert_eq!(info.used, 0);
        assert_eq!(info.peak, 128);
        assert_eq!(
            g.allocator().free_blocks().collect::<Vec<_>>(),
            vec![(0, 128)]
        );

        // Retrying reuses the planned space instead of growing the arena
        g.data_malloc().unwrap();
        let info = g.allocator().info();
        assert_eq!(info.used, 128);
        assert_eq!(info.peak, 128);
        assert_eq!(rt.allocs.load(Ordering::SeqCst), 1);
        for t in g.tensors() {
            assert!(g.tensor(t).unwrap().data_blob().is_some());
        }
    }

    #[test]
    fn test_data_malloc_size_overflow() {
        let rt = Arc::new(CountingRuntime::default());
        let mut g = Graph::new(rt.clone());
        let a = g.add_tensor(vec![usize::MAX / 2, 4], DataType::Float32);
        let b = g.add_tensor(vec![2], DataType::Float32);
        g.add_operator_and_connect(OpKind::Identity, vec![a], vec![b])
            .unwrap();
        assert!(matches!(g.data_malloc(), Err(Error::SizeOverflow(_))));
        assert_eq!(g.allocator().info(), Default::default());
        assert_eq!(rt.allocs.load(Ordering::SeqCst), 0);
    }
}
