// -
// Election key layout

/// Separator between an election prefix and a candidate entry
pub(crate) const ELECTION_KEY_SEPARATOR: &str = "/";

// -
// Liveness probing

/// Key read by the observer probe; its existence is irrelevant
pub const DEFAULT_PROBE_KEY: &str = "observe-test";

/// Probe period is the heartbeat interval divided by this factor
pub(crate) const PROBE_DIVISOR: u64 = 5;

// -
// Session keepalive

/// Largest lease ttl the store accepts, in seconds
pub const MAX_LEASE_TTL_IN_SECS: i64 = 9_000_000_000;

/// Floor for the keepalive refresh period
pub(crate) const MIN_KEEPALIVE_INTERVAL_IN_MS: u64 = 500;

/// First handle id handed out by the registry; 0 is never a valid handle
pub(crate) const FIRST_HANDLE: u64 = 1;
