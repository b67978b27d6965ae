//! Transparent micro-batching for async request handlers.
//!
//! A batch handler processes N inputs in one invocation; callers invoke it
//! one input at a time. The [`Batcher`] aggregates concurrent calls into a
//! batch under a size + timer policy ([`BatchingOptions`]), invokes the
//! handler once, and routes each output back to the caller that supplied the
//! matching input. [`StreamBatcher`] does the same for handlers that produce
//! a lazy sequence of result rows.
//!
//! ```
//! use anyhow::Result;
//! use async_trait::async_trait;
//! use microbatch::{ArgColumns, Batcher, BatchingOptions, CallArgs, Runner};
//!
//! struct Doubler;
//!
//! #[async_trait]
//! impl Runner for Doubler {
//!     type Value = i64;
//!     type Output = i64;
//!
//!     async fn run(&self, mut batch: ArgColumns<i64>) -> Result<Vec<i64>> {
//!         let values = batch.take_column(0, "value").unwrap();
//!         Ok(values.into_iter().map(|v| v * 2).collect())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let batcher = Batcher::new(Doubler, BatchingOptions::default())?;
//!     let doubled = batcher.run(CallArgs::positional([21])).await?;
//!     assert_eq!(doubled, 42);
//!     Ok(())
//! }
//! ```

mod args;
mod batching;
mod error;
mod options;
mod streaming;

pub use args::{ArgColumns, CallArgs};
pub use batching::{Batcher, Runner};
pub use error::ResidualError;
pub use options::BatchingOptions;
pub use streaming::{ResultStream, StreamBatcher, StreamRunner};
