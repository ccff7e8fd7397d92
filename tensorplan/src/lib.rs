//! `tensorplan` is the middle-end of a tensor compiler: it holds a computation
//! as a graph of tensors and operators, rewrites that graph, sorts it, and
//! plans a single memory arena for every tensor in it.
//!
//! # Graph construction
//! Graphs are built within a [`Graph`](crate::graph::Graph), which serves as
//! an arena for tensors and operators.  Adding an operator wires up its edges
//! in both directions, so operators may be added in any order.
//!
//! ```
//! use tensorplan::graph::{DataType, Graph};
//!
//! let mut g = Graph::default();
//! let x = g.add_tensor(vec![2, 4, 3], DataType::Float32);
//! let w = g.add_tensor(vec![2, 4, 5], DataType::Float32);
//! let t = g.add_transpose(x, vec![0, 2, 1])?;
//! let xt = g.output(t).unwrap();
//! let m = g.add_matmul(xt, w, false, false)?;
//!
//! let out = g.output(m).unwrap();
//! assert_eq!(g.tensor(out).unwrap().shape(), &[2, 3, 5]);
//! # Ok::<(), tensorplan::Error>(())
//! ```
//!
//! # Optimization
//! [`Graph::optimize`](crate::graph::Graph::optimize) rewrites the graph until
//! it reaches a fixed point.  Chained transposes which undo each other are
//! removed, and transposes which swap the trailing axes of a matrix
//! multiplication operand are folded into the multiplication itself:
//!
//! ```
//! # use tensorplan::graph::{DataType, Graph};
//! # let mut g = Graph::default();
//! # let x = g.add_tensor(vec![2, 4, 3], DataType::Float32);
//! # let w = g.add_tensor(vec![2, 4, 5], DataType::Float32);
//! # let t = g.add_transpose(x, vec![0, 2, 1])?;
//! # let xt = g.output(t).unwrap();
//! # let m = g.add_matmul(xt, w, false, false)?;
//! assert_eq!(g.op_count(), 2);
//! assert_eq!(g.optimize(), 1);
//! assert_eq!(g.op_count(), 1); // just the matmul, with `trans_a` set
//! # Ok::<(), tensorplan::Error>(())
//! ```
//!
//! # Memory planning
//! Every tensor is assigned an offset by the graph's
//! [`Allocator`](crate::alloc::Allocator).  Only once every offset is known is
//! a single arena requested from the [`Runtime`](crate::runtime::Runtime);
//! each tensor is then bound to its region of the arena.
//!
//! ```
//! # use tensorplan::graph::{DataType, Graph};
//! let mut g = Graph::default();
//! let x = g.add_tensor(vec![4, 4], DataType::Float32);
//! g.add_identity(x)?;
//! g.data_malloc()?;
//!
//! let info = g.allocator().info();
//! assert_eq!(info.peak, 128);
//! for t in g.tensors() {
//!     assert!(g.tensor(t).unwrap().data_blob().is_some());
//! }
//! # Ok::<(), tensorplan::Error>(())
//! ```
//!
//! # Feature flags
#![doc = document_features::document_features!()]
#![warn(missing_docs)]

pub mod alloc;
pub mod graph;
pub mod runtime;
pub mod shape;

mod error;
pub use error::Error;
