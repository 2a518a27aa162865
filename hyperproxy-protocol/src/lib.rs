//! Wire types for the client-facing frame protocol and the agent transports.
//!
//! Lives in its own crate so both the daemon and any future out-of-process
//! test client can depend on a single definition of the wire shapes, the
//! same way `boxlite-shared` is split out from `boxlite` for host/guest
//! reuse.

pub mod frame;
pub mod payload;

pub use frame::{FrameHeader, FrameType, HEADER_LEN, IN_ERROR};
pub use payload::*;
