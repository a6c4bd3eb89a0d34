//! Request pipeline
//!
//! Admission checks, hash prefetch, deferred verification and completion of
//! block read requests.

pub mod io;
pub mod target;
pub mod workqueue;

pub use io::{BlockRequest, BufferCursor, Direction, IoBuffer, IoState, IoVerificationContext};
pub use target::{StatusReport, TargetDevices, TargetOptions, VerityTarget};
pub use workqueue::VerifyQueue;
