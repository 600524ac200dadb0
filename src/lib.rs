//! # dataweave
//!
//! Composable dataflow graphs for Rust: assemble directed graphs of
//! concurrent processing stages with first-class completion propagation,
//! fault propagation, backpressure, conditional routing, and a batched
//! transactional bulk sink.
//!
//! ## Building blocks
//!
//! - [`Flow`] — a graph node owning children (blocks or other nodes) and
//!   exposing a single completion future.
//! - [`InputFlow`] — a node with a strongly typed entry point and iterator
//!   drivers ([`process`](FlowInput::process),
//!   [`pull_from`](FlowInput::pull_from)).
//! - [`IoFlow`] — a node with a typed egress endpoint, predicate routing to
//!   downstream graphs, and leftover policies.
//! - [`DbBulkSink`] — a terminal node batching records and writing each
//!   batch to a tabular store inside one transaction.
//!
//! ## Example
//!
//! ```rust,no_run
//! use dataweave::{FlowGraph, FlowInput, FlowOptions, InputFlow, IoFlow};
//!
//! # async fn example() -> Result<(), dataweave::FlowError> {
//! let doubler = IoFlow::<i32, i32>::from_transform(FlowOptions::default(), |x| async move {
//!   Ok(x * 2)
//! });
//! let sink = InputFlow::<i32>::from_action(FlowOptions::default(), |x| async move {
//!   println!("{x}");
//!   Ok(())
//! });
//! doubler.link_to(&sink)?;
//! doubler.process(0..100, true).await?;
//! # Ok(())
//! # }
//! ```

#[cfg(test)]
mod block_test;
#[cfg(test)]
mod bulk_sink_test;
#[cfg(test)]
mod flow_test;
#[cfg(test)]
mod input_flow_test;

pub mod block;
pub mod bulk_sink;
pub mod completion;
pub mod dependency;
pub mod error;
pub mod flow;
pub mod input_flow;
pub mod io_flow;
pub mod options;
pub mod recorder;

pub use block::*;
pub use bulk_sink::*;
pub use completion::*;
pub use dependency::*;
pub use error::*;
pub use flow::*;
pub use input_flow::*;
pub use io_flow::*;
pub use options::*;
pub use recorder::*;
