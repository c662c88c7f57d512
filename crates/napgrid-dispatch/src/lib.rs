//! napgrid-dispatch — delivery of queued asynchronous invocations.
//!
//! The proxy answers `/async-function/...` calls with 202 and leaves a
//! serialized request in the function's queue. [`AsyncDispatcher`] pulls
//! those requests back out and forwards them, never holding more than
//! `number_parallel_request` forwards open per function.

pub mod dispatcher;

pub use dispatcher::{AsyncDispatcher, TickStats};
