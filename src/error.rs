//! Error handling for the disk layout subsystem
//!
//! One `thiserror` enum covers the whole taxonomy: user-input errors that the
//! planners report and re-prompt on, external-tool failures that abort the
//! current installation attempt, unresolved partition paths, and mount/unmount
//! loops that never converge.

use std::path::Path;
use thiserror::Error;

/// Main error type for disk layout operations
#[derive(Error, Debug)]
pub enum LayoutError {
    /// IO errors (spawning tools, session files, terminal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors (lsblk, sfdisk, sessions)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A size string that is not an IEC-prefixed number
    #[error("Invalid size '{0}'")]
    InvalidSize(String),

    /// A mapper name that is not a lowercase identifier
    #[error("Invalid block name '{0}': use lowercase letters, digits, '-' or '_', starting with a letter")]
    InvalidBlockName(String),

    /// A format type outside {vfat, ext4, btrfs, xfs} or not allowed for a role
    #[error("Unsupported format type '{0}'")]
    UnsupportedFormat(String),

    /// Generic user-input validation failure
    #[error("Validation error: {0}")]
    Validation(String),

    /// A required partition is missing from the plan
    #[error("Missing partition: {0}")]
    MissingPartition(String),

    /// Block device inspection returned something unusable
    #[error("Inspection error: {0}")]
    Inspection(String),

    /// An external tool exited unsuccessfully
    #[error("`{command}` failed (exit code {code}): {stderr}")]
    Tool {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A planned partition was never mapped to a device path
    #[error("Partition #{index} has no resolved device path")]
    Unresolved { index: u32 },

    /// A mount or unmount pass did not converge. `last_error` keeps the
    /// final tool failure seen in the loop, if any.
    #[error(
        "{operation} did not converge after {attempts} attempts{}",
        last_error_suffix(.last_error)
    )]
    Timeout {
        operation: String,
        attempts: u32,
        last_error: Option<String>,
    },

    /// The plan has encrypted partitions but no passphrase was supplied
    #[error("A LUKS passphrase is required for the encrypted partitions in this plan")]
    PassphraseMissing,

    /// Prompt backend failure
    #[error("Prompt error: {0}")]
    Prompt(String),

    /// The session received SIGINT/SIGTERM/SIGHUP
    #[error("Interrupted by signal")]
    Interrupted,
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_deref()
        .map(|e| format!(" (last error: {})", e))
        .unwrap_or_default()
}

/// Result type alias for disk layout operations
pub type Result<T> = std::result::Result<T, LayoutError>;

impl LayoutError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a missing-partition error
    pub fn missing_partition(msg: impl Into<String>) -> Self {
        Self::MissingPartition(msg.into())
    }

    /// Create an inspection error
    pub fn inspection(msg: impl Into<String>) -> Self {
        Self::Inspection(msg.into())
    }

    /// Create a prompt error
    pub fn prompt(msg: impl Into<String>) -> Self {
        Self::Prompt(msg.into())
    }

    /// Create an inspection error naming the device that could not be read
    pub fn device_missing(path: &Path) -> Self {
        Self::Inspection(format!("{} not found in the block device tree", path.display()))
    }

    /// User-input errors are reported and re-prompted, never fatal.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidSize(_)
                | Self::InvalidBlockName(_)
                | Self::UnsupportedFormat(_)
                | Self::Validation(_)
                | Self::MissingPartition(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LayoutError::InvalidSize("12Q".to_string());
        assert_eq!(err.to_string(), "Invalid size '12Q'");

        let err = LayoutError::missing_partition("a ROOT partition is required");
        assert_eq!(err.to_string(), "Missing partition: a ROOT partition is required");

        let err = LayoutError::Tool {
            command: "mkfs.ext4 -F /dev/sda2".to_string(),
            code: 1,
            stderr: "device busy".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "`mkfs.ext4 -F /dev/sda2` failed (exit code 1): device busy"
        );

        let err = LayoutError::Timeout {
            operation: "mount".to_string(),
            attempts: 3,
            last_error: Some("bad superblock".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "mount did not converge after 3 attempts (last error: bad superblock)"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "lsblk not found");
        let err: LayoutError = io_err.into();
        assert!(matches!(err, LayoutError::Io(_)));
    }

    #[test]
    fn test_user_error_classification() {
        assert!(LayoutError::InvalidSize("x".into()).is_user_error());
        assert!(LayoutError::InvalidBlockName("Root".into()).is_user_error());
        assert!(LayoutError::validation("bad").is_user_error());
        assert!(LayoutError::missing_partition("ROOT").is_user_error());

        assert!(!LayoutError::Unresolved { index: 2 }.is_user_error());
        assert!(!LayoutError::Interrupted.is_user_error());
        assert!(
            !LayoutError::Timeout {
                operation: "mount".into(),
                attempts: 3,
                last_error: None,
            }
            .is_user_error()
        );
        assert!(!LayoutError::PassphraseMissing.is_user_error());
    }
}
