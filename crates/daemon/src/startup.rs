//! Startup checks for the portage daemon.
//!
//! Preflight verification that the external encoder is actually invokable
//! before the daemon starts accepting convert jobs. The daemon binary can
//! bypass these for test environments without ffmpeg.

use std::process::Command;
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Check if ffmpeg is available by running `ffmpeg -version`.
pub fn check_ffmpeg_available() -> Result<(), StartupError> {
    let output = Command::new("ffmpeg").arg("-version").output().map_err(|e| {
        StartupError::FfmpegUnavailable(format!(
            "ffmpeg -version failed; is ffmpeg installed and in PATH? Error: {}",
            e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::FfmpegUnavailable(
            "ffmpeg -version exited with failure; is ffmpeg installed and in PATH?".to_string(),
        ));
    }

    Ok(())
}

/// Run all startup checks in order.
pub fn run_startup_checks() -> Result<(), StartupError> {
    check_ffmpeg_available()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_names_the_tool() {
        let err = StartupError::FfmpegUnavailable("not found".to_string());
        assert!(err.to_string().contains("ffmpeg"));
    }
}
