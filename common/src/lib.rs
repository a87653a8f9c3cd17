pub mod ipc;
pub mod job;

pub use ipc::{Request, Response, StatsSnapshot};
pub use job::{Job, JobId, JobStatus, LabelRequest, Record, ValidationError, TEMPLATE_EXTENSION};

// Production paths (follow FHS - Filesystem Hierarchy Standard)
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/labelq/labelq.sock";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/labelq/config.yaml";
pub const DEFAULT_LOG_FILE: &str = "/var/log/labelq/daemon.log";

// Fallback paths for non-root users
pub const USER_SOCKET_PATH: &str = "/tmp/labelq.sock";
pub const USER_CONFIG_PATH: &str = "labelq-config.yaml";
