//! Wire-level message type discriminators shared by the telemetry server
//! protocol and the REST refetch endpoints.

/// Push message type for GPU metric snapshots.
pub const MSG_TYPE_GPU_METRICS: &str = "gpu_metrics";

/// Push message type for carbon-capture / environmental snapshots.
pub const MSG_TYPE_CARBON_METRICS: &str = "carbon_metrics";

/// Push message type for host system snapshots.
pub const MSG_TYPE_SYSTEM_METRICS: &str = "system_metrics";

/// Control message asking the server to start pushing an entity.
pub const MSG_TYPE_SUBSCRIBE: &str = "subscribe";

/// Control message asking the server to stop pushing an entity.
pub const MSG_TYPE_UNSUBSCRIBE: &str = "unsubscribe";

/// Path segment of `GET /metrics/{kind}` for GPU metrics.
pub const PATH_GPU: &str = "gpu";

/// Path segment of `GET /metrics/{kind}` for carbon metrics.
pub const PATH_CARBON: &str = "carbon";

/// Path segment of `GET /metrics/{kind}` for system metrics.
pub const PATH_SYSTEM: &str = "system";
