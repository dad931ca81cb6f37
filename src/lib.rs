#![warn(clippy::cast_lossless)]
//! Load-testing harness adapter for a Llama 2 70B class model.
//!
//! Issued queries are queued as work units, a worker pool turns them into
//! completions using either an in-process model or a set of remote
//! endpoints, and results are reported back through a [`CompletionSink`].
//! In server mode the first generated token of every request is reported
//! ahead of the full response.

pub mod backend;
pub mod batch;
pub mod cache;
pub mod codec;
pub mod config;
mod dispatch;
pub mod error;
pub mod queue;
pub mod relay;
pub mod report;
pub mod request;
pub mod router;
pub mod spawner;
pub mod sut;

pub use backend::{Backend, GenerationParams, Generator, RetryPolicy, RpcClient, TokenObserver};
pub use codec::{HfTokenCodec, TokenCodec};
pub use config::{Mode, Protocol, SutConfig};
pub use error::{Result, SutError};
pub use report::{BarProgress, CompletionSink, LogProgress, ProgressEvent, ProgressObserver};
pub use request::{decode_token_ids, encode_token_ids, Request, ResponseId, TokenResult};
pub use sut::Sut;
