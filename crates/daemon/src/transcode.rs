//! External transcoder and tag-editor invocation.
//!
//! Conversion is delegated to an external `ffmpeg` binary through the narrow
//! `Transcoder` and `TagEditor` capability traits, so the queue processor
//! never knows how audio is produced and tests can substitute fakes.
//!
//! A transcode writes into the scratch directory; the write serializer later
//! promotes the finished temp file to the destination device.

use portage_config::ProfileConfig;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Error type for transcode and tag operations
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// The requested profile is not configured.
    #[error("unknown transcode profile '{0}'")]
    UnknownProfile(String),

    /// Encoder process exited with non-zero status.
    #[error("encoder failed with exit code {0}")]
    EncoderFailed(i32),

    /// Encoder process was terminated by signal.
    #[error("encoder process was terminated by signal")]
    EncoderTerminated,

    /// Encoder reported success but the output file is missing.
    #[error("encoder produced no output at {0}")]
    MissingOutput(PathBuf),

    /// IO error around the encoder invocation.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// A resolved transcode profile.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    /// Identifier referenced by enqueue requests.
    pub name: String,
    /// Target container, doubling as the output extension.
    pub format: String,
    /// Extra encoder arguments.
    pub args: Vec<String>,
}

impl Profile {
    pub fn from_config(cfg: &ProfileConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            format: cfg.format.clone(),
            args: cfg.args.clone(),
        }
    }

    /// File extension of output produced with this profile.
    pub fn extension(&self) -> &str {
        &self.format
    }
}

/// Capability interface for format conversion.
pub trait Transcoder: Send + Sync {
    /// Transcode `src` into a fresh file under `temp_dir` using the named
    /// profile, returning the produced temp path.
    fn convert(
        &self,
        src: &Path,
        profile: &str,
        remove_art: bool,
        temp_dir: &Path,
    ) -> Result<PathBuf, TranscodeError>;
}

/// Capability interface for tag post-processing.
pub trait TagEditor: Send + Sync {
    /// Remove embedded album art from the file in place.
    fn strip_art(&self, path: &Path) -> Result<(), TranscodeError>;
}

/// Transcoder backed by the external `ffmpeg` binary.
pub struct FfmpegTranscoder {
    profiles: Vec<Profile>,
}

impl FfmpegTranscoder {
    pub fn new(profiles: Vec<Profile>) -> Self {
        Self { profiles }
    }

    /// Look up a profile by name.
    pub fn find_profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Build the ffmpeg command for one conversion.
    ///
    /// `-vn` drops embedded picture streams when art removal is requested;
    /// otherwise metadata is carried over as-is.
    pub fn build_command(
        src: &Path,
        profile: &Profile,
        remove_art: bool,
        output: &Path,
    ) -> Command {
        let mut cmd = Command::new("ffmpeg");

        cmd.arg("-y").arg("-hide_banner").arg("-loglevel").arg("error");
        cmd.arg("-i").arg(src);

        if remove_art {
            cmd.arg("-vn");
        }

        for arg in &profile.args {
            cmd.arg(arg);
        }

        cmd.arg(output);
        cmd
    }
}

impl Transcoder for FfmpegTranscoder {
    fn convert(
        &self,
        src: &Path,
        profile: &str,
        remove_art: bool,
        temp_dir: &Path,
    ) -> Result<PathBuf, TranscodeError> {
        let profile = self
            .find_profile(profile)
            .ok_or_else(|| TranscodeError::UnknownProfile(profile.to_string()))?;

        std::fs::create_dir_all(temp_dir)?;
        let output = temp_dir.join(format!(
            "{}.{}",
            Uuid::new_v4().simple(),
            profile.extension()
        ));

        debug!(src = %src.display(), profile = %profile.name, out = %output.display(), "transcoding");

        let status = Self::build_command(src, profile, remove_art, &output).status()?;

        if !status.success() {
            // Never leave a half-written temp file behind.
            let _ = std::fs::remove_file(&output);
            return match status.code() {
                Some(code) => Err(TranscodeError::EncoderFailed(code)),
                None => Err(TranscodeError::EncoderTerminated),
            };
        }

        if !output.exists() {
            return Err(TranscodeError::MissingOutput(output));
        }

        Ok(output)
    }
}

/// Tag editor backed by the external `ffmpeg` binary: rewrites the file
/// without picture streams and renames the result into place.
pub struct FfmpegTagEditor;

impl TagEditor for FfmpegTagEditor {
    fn strip_art(&self, path: &Path) -> Result<(), TranscodeError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        // Keep the real extension at the end so ffmpeg infers the container.
        let tmp = path.with_file_name(format!(".noart-{}", file_name));

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-y").arg("-hide_banner").arg("-loglevel").arg("error");
        cmd.arg("-i").arg(path);
        cmd.arg("-map").arg("0").arg("-map").arg("-0:v");
        cmd.arg("-c").arg("copy");
        cmd.arg(&tmp);

        let status = cmd.status()?;
        if !status.success() {
            let _ = std::fs::remove_file(&tmp);
            return match status.code() {
                Some(code) => Err(TranscodeError::EncoderFailed(code)),
                None => Err(TranscodeError::EncoderTerminated),
            };
        }

        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a: &OsStr| a.to_string_lossy().to_string())
            .collect()
    }

    fn mp3_profile() -> Profile {
        Profile::from_config(&ProfileConfig::builtin_mp3_v0())
    }

    #[test]
    fn test_build_command_basic_shape() {
        let profile = mp3_profile();
        let cmd = FfmpegTranscoder::build_command(
            Path::new("/music/fugue.flac"),
            &profile,
            false,
            Path::new("/tmp/out.mp3"),
        );

        assert_eq!(cmd.get_program().to_string_lossy(), "ffmpeg");
        let args = get_command_args(&cmd);

        let i_pos = args.iter().position(|a| a == "-i").expect("has -i");
        assert_eq!(args[i_pos + 1], "/music/fugue.flac");

        // Profile args appear between input and output.
        let q_pos = args.iter().position(|a| a == "-q:a").expect("has -q:a");
        assert_eq!(args[q_pos + 1], "0");
        assert!(q_pos > i_pos);

        // Output is the final argument.
        assert_eq!(args.last().unwrap(), "/tmp/out.mp3");

        // Overwrite and quiet flags are always present.
        assert!(args.contains(&"-y".to_string()));
        assert!(args.contains(&"-hide_banner".to_string()));
    }

    #[test]
    fn test_build_command_remove_art_adds_vn() {
        let profile = mp3_profile();

        let with = FfmpegTranscoder::build_command(
            Path::new("/music/a.flac"),
            &profile,
            true,
            Path::new("/tmp/out.mp3"),
        );
        assert!(get_command_args(&with).contains(&"-vn".to_string()));

        let without = FfmpegTranscoder::build_command(
            Path::new("/music/a.flac"),
            &profile,
            false,
            Path::new("/tmp/out.mp3"),
        );
        assert!(!get_command_args(&without).contains(&"-vn".to_string()));
    }

    #[test]
    fn test_profile_extension() {
        let profile = mp3_profile();
        assert_eq!(profile.extension(), "mp3");

        let ogg = Profile {
            name: "ogg-q6".to_string(),
            format: "ogg".to_string(),
            args: vec![],
        };
        assert_eq!(ogg.extension(), "ogg");
    }

    #[test]
    fn test_find_profile() {
        let transcoder = FfmpegTranscoder::new(vec![mp3_profile()]);
        assert!(transcoder.find_profile("mp3-v0").is_some());
        assert!(transcoder.find_profile("opus-128").is_none());
    }

    #[test]
    fn test_convert_unknown_profile_fails_before_spawning() {
        let transcoder = FfmpegTranscoder::new(vec![mp3_profile()]);
        let result = transcoder.convert(
            Path::new("/music/a.flac"),
            "no-such-profile",
            false,
            Path::new("/tmp/portage-test-scratch"),
        );
        assert!(matches!(result, Err(TranscodeError::UnknownProfile(_))));
    }
}
