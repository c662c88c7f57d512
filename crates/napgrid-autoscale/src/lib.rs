//! napgrid-autoscale — activity-driven replica scaling.
//!
//! Runs on the leader only. Each pass compares every function's idle time
//! with its `timeout_seconds_before_scale_to_min` and asks the
//! orchestrator for a new replica count.
//!
//! # Scaling Algorithm
//!
//! ```text
//! reference = start_with_any_function ? max(last call of any function)
//!                                     : last call of this function
//! idle      = reference + timeout < now        (never called → idle)
//!
//! if replicas unknown:
//!     NoChange
//! if idle and replicas > replicas_min:
//!     ScaleTo(replicas_min)                    // scale-to-zero when min = 0
//! if !idle and replicas == 0:
//!     ScaleTo(replicas_at_start)               // wake from zero
//! ```
//!
//! Non-zero counts below `replicas_at_start` are left alone so manual or
//! external scaling is not fought.

pub mod scaler;

pub use scaler::{Autoscaler, ScaleDecision, evaluate};
