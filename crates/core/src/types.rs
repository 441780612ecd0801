/// Telemetry entities (GPUs, servers, sites) are addressed by opaque string ids,
/// e.g. `"gpu-1"` or `"dc-west-03"`.
pub type EntityId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
