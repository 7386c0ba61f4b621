//! Constants shared between the daemon and its clients.

/// Default TCP endpoint of the bridge daemon.
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:5555";

/// TLV type carrying the 26-character hex form of one frame. Other
/// types are reserved and ignored.
pub const TLV_TYPE_MSG: u8 = 1;

/// Default per-response timeout on the client side, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 20;
