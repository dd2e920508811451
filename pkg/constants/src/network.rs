//! Network-related constants.

/// Default port for the replicore API server.
pub const DEFAULT_API_PORT: u16 = 7443;

/// Default bind address for the API server.
pub const DEFAULT_BIND_ADDR: [u8; 4] = [0, 0, 0, 0];

/// How long shutdown waits for open API connections (watch streams) to end.
pub const HTTP_DRAIN_TIMEOUT_SECS: u64 = 5;
