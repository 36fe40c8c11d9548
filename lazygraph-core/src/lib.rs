//! Lazygraph is a lazy dataflow-graph engine for tensor computation.
//!
//! Building a graph computes nothing. Every operator creates an [`Expr`] node and hands back a
//! [`Var`], a handle to one of its outputs. Reading a handle pulls the work: shapes are resolved
//! on demand, the not-yet-cached part of the graph is lowered into a [`ComputeCache`], and that
//! cache is run by the backend of the current [`Executor`].
//!
//! Caches are kept and reused. Changing the *content* of an input only re-runs the plans that read
//! it; changing its *shape* re-lowers them. Both kinds of staleness travel along weak consumer
//! back-references, so a graph never owns itself.
//!
//! ## A quick guide
//! - Create leaves with [`creator::input`], [`creator::constant`] and friends.
//! - Combine handles with `+ - * /`, [`Var::sum`], [`Var::mean`] or the [`creator`] functions.
//! - Read results with [`Var::read_map`]. Feed inputs with [`Var::write_map`] or [`Var::resize`].
//! - Persist a graph with [`io::save_to_bytes`] and bring it back with [`io::load_map_from_bytes`].
//!
//! ## What can you do with it?
//! ```
//! use lazygraph_core::{creator, ElementType};
//!
//! let x = creator::input(&[2, 2], ElementType::F32).unwrap();
//! let w = creator::constant(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
//! let y = &x * &w + creator::scalar(1.0f32).unwrap();
//!
//! x.write_map(&[1.0f32; 4]).unwrap();
//! assert_eq!(y.read_map::<f32>().unwrap(), vec![2.0, 3.0, 4.0, 5.0]);
//!
//! // Same shape, new values: the existing plan re-runs.
//! x.write_map(&[2.0f32; 4]).unwrap();
//! assert_eq!(y.read_map::<f32>().unwrap(), vec![3.0, 5.0, 7.0, 9.0]);
//! ```

mod backend;
mod config;
mod cpu_backend;
pub mod creator;
mod descriptor;
mod dtype;
mod error;
mod executor;
mod expr;
pub mod io;
mod op;
mod storage;
pub mod traversal;
mod variable;

pub use backend::{Backend, Executable, InfoInput, OpCost, Unit, UnitInput};
pub use config::{ExecutorConfig, ForwardType};
pub use cpu_backend::{BufferPool, CpuBackend, CpuProgram, PoolMetrics};
pub use descriptor::{Descriptor, Layout, PACK_ALIGN};
pub use dtype::{bytes_to_vec, vec_to_bytes, DType, ElementType};
pub use error::{Context, Error, Result};
pub use executor::{ComputeCache, Executor, ExecutorScope, GcFlag, OpProfile};
pub use expr::{Expr, ExprRef, LeafData, VarKind};
pub use op::{BinaryOpType, Op, ReduceType, Requirement, UnaryOpType};
pub use storage::{HostTensor, SharedBuffer};
pub use variable::Var;
