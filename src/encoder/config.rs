//! Stream and encoder configuration

use std::ffi::OsString;
use std::path::PathBuf;

use crate::registry::CaptureSource;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("invalid {field} '{value}', expected digits with an optional k/M suffix")]
    InvalidRate { field: &'static str, value: String },
}

/// Per-session video parameters, fixed once the session is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Capture width in pixels
    pub width: u32,
    /// Capture height in pixels
    pub height: u32,
    /// Capture framerate
    pub framerate: u32,
    /// Target bitrate (e.g. "500k")
    pub bitrate: String,
    /// Peak bitrate (e.g. "800k")
    pub maxrate: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            framerate: 15,
            bitrate: "500k".into(),
            maxrate: "800k".into(),
        }
    }
}

impl StreamConfig {
    /// Create a config with the given resolution and default rates
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    /// Set the framerate
    pub fn framerate(mut self, fps: u32) -> Self {
        self.framerate = fps;
        self
    }

    /// Set the target bitrate
    pub fn bitrate(mut self, rate: impl Into<String>) -> Self {
        self.bitrate = rate.into();
        self
    }

    /// Set the peak bitrate
    pub fn maxrate(mut self, rate: impl Into<String>) -> Self {
        self.maxrate = rate.into();
        self
    }

    /// Resolution as `WxH`
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    /// Check every field
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("width", self.width),
            ("height", self.height),
            ("framerate", self.framerate),
        ] {
            if value == 0 {
                return Err(ConfigError::NotPositive { field });
            }
        }
        validate_rate("bitrate", &self.bitrate)?;
        validate_rate("maxrate", &self.maxrate)?;
        Ok(())
    }
}

fn validate_rate(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let digits = value
        .strip_suffix(|c: char| matches!(c, 'k' | 'K' | 'm' | 'M'))
        .unwrap_or(value);
    let valid = !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && digits.bytes().any(|b| b != b'0');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidRate {
            field,
            value: value.to_string(),
        })
    }
}

/// How the encoder process is launched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderConfig {
    /// ffmpeg capturing an X11 display with libx264
    Ffmpeg(FfmpegSettings),
    /// Any program that writes an Annex-B stream to stdout
    Custom {
        program: PathBuf,
        args: Vec<String>,
    },
}

impl Default for EncoderConfig {
    fn default() -> Self {
        EncoderConfig::Ffmpeg(FfmpegSettings::default())
    }
}

impl EncoderConfig {
    /// Launch an arbitrary program instead of ffmpeg
    pub fn custom<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        EncoderConfig::Custom {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Build the command for one session
    pub fn command(&self, stream: &StreamConfig, capture: &CaptureSource) -> EncoderCommand {
        match self {
            EncoderConfig::Ffmpeg(settings) => settings.command(stream, capture),
            EncoderConfig::Custom { program, args } => EncoderCommand {
                program: program.clone(),
                args: args.iter().map(OsString::from).collect(),
            },
        }
    }
}

/// libx264 low-latency settings
///
/// Defaults produce a baseline stream with a 10-frame GOP, which bounds the
/// late-join cache to about two seconds at 5 fps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegSettings {
    /// ffmpeg binary
    pub binary: PathBuf,
    /// Input device format
    pub input_format: String,
    pub preset: String,
    pub tune: String,
    pub profile: String,
    pub level: String,
    pub pix_fmt: String,
    /// Frames between IDR pictures
    pub gop_size: u32,
    /// Whether to draw the mouse cursor
    pub draw_mouse: bool,
}

impl Default for FfmpegSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
            input_format: "x11grab".into(),
            preset: "ultrafast".into(),
            tune: "zerolatency".into(),
            profile: "baseline".into(),
            level: "3.1".into(),
            pix_fmt: "yuv420p".into(),
            gop_size: 10,
            draw_mouse: false,
        }
    }
}

impl FfmpegSettings {
    /// Set the GOP length in frames
    pub fn gop_size(mut self, frames: u32) -> Self {
        self.gop_size = frames.max(1);
        self
    }

    /// Set the ffmpeg binary path
    pub fn binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary = path.into();
        self
    }

    pub fn command(&self, stream: &StreamConfig, capture: &CaptureSource) -> EncoderCommand {
        let gop = self.gop_size.to_string();
        let args: Vec<String> = vec![
            "-nostdin".into(),
            "-loglevel".into(),
            "warning".into(),
            "-f".into(),
            self.input_format.clone(),
            "-video_size".into(),
            stream.resolution(),
            "-framerate".into(),
            stream.framerate.to_string(),
            "-draw_mouse".into(),
            String::from(if self.draw_mouse { "1" } else { "0" }),
            "-i".into(),
            capture.id().to_string(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            self.preset.clone(),
            "-tune".into(),
            self.tune.clone(),
            "-profile:v".into(),
            self.profile.clone(),
            "-level".into(),
            self.level.clone(),
            "-pix_fmt".into(),
            self.pix_fmt.clone(),
            "-g".into(),
            gop.clone(),
            "-keyint_min".into(),
            gop,
            "-sc_threshold".into(),
            "0".into(),
            "-b:v".into(),
            stream.bitrate.clone(),
            "-maxrate".into(),
            stream.maxrate.clone(),
            "-bufsize".into(),
            stream.bitrate.clone(),
            "-f".into(),
            "h264".into(),
            "-".into(),
        ];

        EncoderCommand {
            program: self.binary.clone(),
            args: args.into_iter().map(OsString::from).collect(),
        }
    }
}

/// A fully resolved encoder invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl EncoderCommand {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl std::fmt::Display for EncoderCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg_after<'a>(cmd: &'a EncoderCommand, flag: &str) -> Option<&'a str> {
        let pos = cmd.args.iter().position(|a| a == flag)?;
        cmd.args.get(pos + 1).and_then(|a| a.to_str())
    }

    #[test]
    fn test_default_stream_config() {
        let config = StreamConfig::default();

        assert_eq!(config.resolution(), "1280x720");
        assert_eq!(config.framerate, 15);
        assert_eq!(config.bitrate, "500k");
        assert_eq!(config.maxrate, "800k");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_chaining() {
        let config = StreamConfig::new(640, 480)
            .framerate(5)
            .bitrate("300k")
            .maxrate("1M");

        assert_eq!(config.width, 640);
        assert_eq!(config.height, 480);
        assert_eq!(config.framerate, 5);
        assert_eq!(config.bitrate, "300k");
        assert_eq!(config.maxrate, "1M");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_fields() {
        let config = StreamConfig::new(0, 720);
        assert_eq!(
            config.validate(),
            Err(ConfigError::NotPositive { field: "width" })
        );

        let config = StreamConfig::default().framerate(0);
        assert_eq!(
            config.validate(),
            Err(ConfigError::NotPositive { field: "framerate" })
        );
    }

    #[test]
    fn test_validate_rates() {
        for ok in ["500k", "800K", "2M", "1500000"] {
            assert!(StreamConfig::default().bitrate(ok).validate().is_ok(), "{}", ok);
        }
        for bad in ["", "k", "fast", "5.5M", "0k", "-1k"] {
            assert!(
                matches!(
                    StreamConfig::default().bitrate(bad).validate(),
                    Err(ConfigError::InvalidRate { field: "bitrate", .. })
                ),
                "{}",
                bad
            );
        }
    }

    #[test]
    fn test_ffmpeg_command() {
        let stream = StreamConfig::new(800, 600).framerate(5).bitrate("400k");
        let capture = CaptureSource::new(":101");

        let cmd = EncoderConfig::default().command(&stream, &capture);

        assert_eq!(cmd.program, PathBuf::from("ffmpeg"));
        assert_eq!(arg_after(&cmd, "-video_size"), Some("800x600"));
        assert_eq!(arg_after(&cmd, "-framerate"), Some("5"));
        assert_eq!(arg_after(&cmd, "-i"), Some(":101"));
        assert_eq!(arg_after(&cmd, "-profile:v"), Some("baseline"));
        assert_eq!(arg_after(&cmd, "-g"), Some("10"));
        assert_eq!(arg_after(&cmd, "-keyint_min"), Some("10"));
        assert_eq!(arg_after(&cmd, "-b:v"), Some("400k"));
        assert_eq!(arg_after(&cmd, "-bufsize"), Some("400k"));
        assert_eq!(arg_after(&cmd, "-maxrate"), Some("800k"));
        // Raw elementary stream on stdout
        assert_eq!(cmd.args.last().and_then(|a| a.to_str()), Some("-"));
        assert!(cmd.to_string().contains("-f h264 -"));
    }

    #[test]
    fn test_ffmpeg_gop_size() {
        let settings = FfmpegSettings::default().gop_size(30).binary("/opt/ffmpeg");
        let cmd = EncoderConfig::Ffmpeg(settings)
            .command(&StreamConfig::default(), &CaptureSource::new(":99"));

        assert_eq!(cmd.program, PathBuf::from("/opt/ffmpeg"));
        assert_eq!(arg_after(&cmd, "-g"), Some("30"));
    }

    #[test]
    fn test_custom_command_ignores_stream() {
        let config = EncoderConfig::custom("sh", ["-c", "cat /tmp/stream.h264"]);
        let cmd = config.command(&StreamConfig::default(), &CaptureSource::new(":99"));

        assert_eq!(cmd.program, PathBuf::from("sh"));
        assert_eq!(cmd.args.len(), 2);
        assert_eq!(cmd.to_string(), "sh -c cat /tmp/stream.h264");
    }
}
