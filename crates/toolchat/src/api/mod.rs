//! Generation-service plumbing: streaming and retry.
//!
//! - [`streaming`]: NDJSON parser for incremental answer and thinking
//!   deltas. Produces [`StreamEvent`](streaming::StreamEvent) values.
//! - [`retry`]: transient error detection (429, 5xx, network timeouts) with
//!   configurable exponential backoff and jitter.

pub mod retry;
pub mod streaming;

pub use retry::{RetryConfig, retry_generation};
