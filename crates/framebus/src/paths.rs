//! Centralized naming for shared memory segments and semaphores.
//!
//! A ring buffer called `camera_raw` owns these OS objects:
//! - `<shm_dir>/camera_raw_0`, `<shm_dir>/camera_raw_1`: the two frame slots
//! - `<shm_dir>/camera_raw_ctl`: the control block (write index, sequence, shape)
//! - `/<namespace>_camera_raw_lock`: cross-process mutex
//! - `/<namespace>_camera_raw_ready`: "new frame available" signal
//!
//! A metadata side-channel called `camera_raw` lives in `<shm_dir>/camera_raw_meta`
//! and is guarded by `/<namespace>_camera_raw_meta_lock`.

use crate::errors::BufferError;

/// Directory backing named shared memory on Linux.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

/// Prefix for semaphore names so unrelated programs don't collide.
pub const DEFAULT_NAMESPACE: &str = "framebus";

/// Well-known logical names probed by diagnostics when none are given.
pub const DEFAULT_PROBE_NAMES: [&str; 2] = ["camera_full_overlay", "camera_overlay"];

// POSIX semaphore names are limited to NAME_MAX - 4 characters.
const MAX_NAME_LEN: usize = 200;

pub fn slot_name(name: &str, index: usize) -> String {
    format!("{name}_{index}")
}

pub fn control_name(name: &str) -> String {
    format!("{name}_ctl")
}

pub fn metadata_name(name: &str) -> String {
    format!("{name}_meta")
}

pub fn lock_semaphore_name(namespace: &str, name: &str) -> String {
    format!("/{namespace}_{name}_lock")
}

pub fn ready_semaphore_name(namespace: &str, name: &str) -> String {
    format!("/{namespace}_{name}_ready")
}

pub fn metadata_lock_semaphore_name(namespace: &str, name: &str) -> String {
    format!("/{namespace}_{name}_meta_lock")
}

/// Conventional logical name for a camera view and pipeline stage,
/// e.g. `camera_name("full", "overlay") == "camera_full_overlay"`.
pub fn camera_name(view: &str, stage: &str) -> String {
    format!("camera_{view}_{stage}")
}

/// Reject names that would escape the shm directory or break semaphore naming.
pub fn validate_name(name: &str) -> Result<(), BufferError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.starts_with('.');

    if valid {
        Ok(())
    } else {
        Err(BufferError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_names() {
        assert_eq!(slot_name("cam", 0), "cam_0");
        assert_eq!(slot_name("cam", 1), "cam_1");
        assert_eq!(control_name("cam"), "cam_ctl");
        assert_eq!(metadata_name("cam"), "cam_meta");
    }

    #[test]
    fn test_semaphore_names_start_with_slash() {
        assert_eq!(lock_semaphore_name("fb", "cam"), "/fb_cam_lock");
        assert_eq!(ready_semaphore_name("fb", "cam"), "/fb_cam_ready");
        assert_eq!(metadata_lock_semaphore_name("fb", "cam"), "/fb_cam_meta_lock");
    }

    #[test]
    fn test_camera_name_convention() {
        assert_eq!(camera_name("full", "overlay"), "camera_full_overlay");
        assert_eq!(camera_name("top", "raw"), "camera_top_raw");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("camera_full_overlay").is_ok());
        assert!(validate_name("cam-1.raw").is_ok());

        assert!(validate_name("").is_err());
        assert!(validate_name("../etc/passwd").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }
}
