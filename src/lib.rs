pub mod collectors;
pub mod commands;
pub mod models;
pub mod monitor;
pub mod pool;
pub mod sysconfig;

/// External tool that creates/resets the storage pool.
pub const SETUP_TOOL: &str = "docker-storage-setup";

/// Service unit whose storage this tool manages.
pub const STORAGE_SERVICE: &str = "docker";

/// Sysconfig file consumed by the setup tool (DEVS / VG / STORAGE_DRIVER).
pub const SETUP_SYSCONFIG: &str = "/etc/sysconfig/docker-storage-setup";

/// Engine config holding the --storage-driver command line.
pub const STORAGE_CONFIG: &str = "/etc/sysconfig/docker-storage";

/// Root of the engine's image store.
pub const IMAGE_ROOT: &str = "/var/lib/docker";
