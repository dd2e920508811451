//! State store constants.

/// Resource version meaning "no precondition" on writes.
pub const UNCONDITIONAL_VERSION: u64 = 0;

/// Upper bound on accepted resource names (DNS-1123 label length).
pub const MAX_NAME_LEN: usize = 63;
