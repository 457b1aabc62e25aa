//! Filesystem-location defaults shared by the daemon and its CLI client, so
//! the two never silently drift apart from one another.

pub const DEFAULT_PID_FILE: &str = "/var/run/enforcerd/enforcerd.pid";
pub const DEFAULT_POLICY_DIR: &str = "/etc/enforcerd/policies";
pub const DEFAULT_STATE_FILE: &str = "/var/lib/enforcerd/state.toml";
pub const DEFAULT_COMMAND_SOCKET: &str = "/var/run/enforcerd/enforcerd.sock";
pub const DEFAULT_SIGNCONF_DIR: &str = "/var/lib/enforcerd/signconf";
