//! Well-known paths for the installed system.

/// The configured configuration directory
pub const CONFIGDIR: &str = "/etc/ddm-core";

#[macro_export]
macro_rules! DDM_RUN_DIR_M { () => ("/run/ddm-core") }

#[macro_export]
macro_rules! DDM_LOG_DIR_M { () => ("/var/log/ddm-core") }

#[macro_export]
macro_rules! DDM_WORKAREA_ROOT_M { () => ("/var/lib/ddm-core/work") }

/// namespaced directory for in-memory (tmpfs) run state
pub const DDM_RUN_DIR: &str = DDM_RUN_DIR_M!();

/// namespaced directory for persistent logging
pub const DDM_LOG_DIR: &str = DDM_LOG_DIR_M!();

/// root directory under which per-application work areas are allocated
pub const WORKAREA_ROOT: &str = DDM_WORKAREA_ROOT_M!();

/// the PID filename for the application server daemon
pub const SERVER_PID_FN: &str = concat!(DDM_RUN_DIR_M!(), "/ddm-serverd.pid");

/// Default application-server port (the spec calls for a single fixed port).
pub const APP_SERVER_PORT: u16 = 39626;

/// Prepend the configuration directory to a file name.
///
/// #### Example
/// ```
/// # #[macro_use] extern crate ddm_core;
/// let policy_path = configdir!("/detox.txt");
/// ```
#[macro_export]
macro_rules! configdir {
    ($subdir:expr) => {
        concat!("/etc/ddm-core", $subdir)
    };
}

/// Prepend the run directory to a file name.
#[macro_export]
macro_rules! rundir {
    ($subdir:expr) => {
        concat!(DDM_RUN_DIR_M!(), $subdir)
    };
}
