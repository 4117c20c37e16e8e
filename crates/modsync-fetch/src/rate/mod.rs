//! Rate control for block and direct transfers.

pub mod throttle;

pub use throttle::{BandwidthBroadcast, ThrottledStream};
