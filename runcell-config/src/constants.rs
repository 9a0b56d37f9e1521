//! Default values shared by the configuration sections.

pub mod defaults {
    pub const DEFAULT_PYTHON: &str = "python3";
    pub const DEFAULT_AUTO_RUN_LANGUAGE: &str = "python";
    pub const DEFAULT_INSTALL_TIMEOUT_SECS: u64 = 120;
    pub const DEFAULT_INIT_TIMEOUT_SECS: u64 = 60;
    pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 256 * 1024; // 256 KiB
    pub const DEFAULT_MOUNT_TIMEOUT_MS: u64 = 5_000;
    pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 30;
    pub const DEFAULT_SETTLE_DELAY_MS: u64 = 300;
    pub const DEFAULT_TRANSPORT_RETRIES: u32 = 0;
    pub const DEFAULT_TRACE_TARGETS: &[&str] = &["runcell", "runcell_core"];
}

pub mod paths {
    pub const CONFIG_FILE_NAME: &str = "runcell.toml";
    pub const HOME_CONFIG_DIR: &str = ".runcell";
    pub const CONFIG_PATH_ENV: &str = "RUNCELL_CONFIG_PATH";
}
