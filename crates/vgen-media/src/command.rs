//! FFmpeg command builder.

use std::path::{Path, PathBuf};

use crate::error::{MediaError, MediaResult};
use crate::runner::ProcessSpec;

#[derive(Debug, Clone)]
struct Input {
    args: Vec<String>,
    source: String,
}

/// Builder for FFmpeg commands.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    inputs: Vec<Input>,
    output: PathBuf,
    /// Output arguments (after the last -i)
    output_args: Vec<String>,
    overwrite: bool,
    log_level: String,
}

impl FfmpegCommand {
    /// Create a command with a single input.
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            inputs: vec![Input {
                args: Vec::new(),
                source: input.as_ref().to_string_lossy().to_string(),
            }],
            output: output.as_ref().to_path_buf(),
            output_args: Vec::new(),
            overwrite: true,
            log_level: "error".to_string(),
        }
    }

    /// Add arguments applying to the most recently added input.
    pub fn input_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(input) = self.inputs.last_mut() {
            input.args.extend(args.into_iter().map(Into::into));
        }
        self
    }

    /// Add another input.
    pub fn add_input(mut self, input: impl AsRef<Path>) -> Self {
        self.inputs.push(Input {
            args: Vec::new(),
            source: input.as_ref().to_string_lossy().to_string(),
        });
        self
    }

    /// Add an output argument.
    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    /// Add multiple output arguments.
    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set video codec.
    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:v").output_arg(codec)
    }

    /// Set audio codec.
    pub fn audio_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:a").output_arg(codec)
    }

    /// Set video filter.
    pub fn video_filter(self, filter: impl Into<String>) -> Self {
        self.output_arg("-vf").output_arg(filter)
    }

    /// Set pixel format.
    pub fn pixel_format(self, fmt: impl Into<String>) -> Self {
        self.output_arg("-pix_fmt").output_arg(fmt)
    }

    /// Extract single frame.
    pub fn single_frame(self) -> Self {
        self.output_arg("-frames:v").output_arg("1")
    }

    /// Stop at the end of the shortest input.
    pub fn shortest(self) -> Self {
        self.output_arg("-shortest")
    }

    /// Set log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Build the command arguments.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if self.overwrite {
            args.push("-y".to_string());
        }

        args.push("-v".to_string());
        args.push(self.log_level.clone());

        // Progress output to stderr
        args.push("-progress".to_string());
        args.push("pipe:2".to_string());
        args.push("-nostats".to_string());

        for input in &self.inputs {
            args.extend(input.args.iter().cloned());
            args.push("-i".to_string());
            args.push(input.source.clone());
        }

        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().to_string());

        args
    }

    /// Convert into a spec for the tracked process runner.
    pub fn into_spec(self) -> ProcessSpec {
        ProcessSpec::new("ffmpeg").args(self.build_args()).name("ffmpeg")
    }
}

/// Check if FFmpeg is available.
pub fn check_ffmpeg() -> MediaResult<PathBuf> {
    which::which("ffmpeg").map_err(|_| MediaError::BinaryNotFound("ffmpeg".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builder() {
        let cmd = FfmpegCommand::new("list.txt", "out.mp4")
            .input_args(["-f", "concat", "-safe", "0"])
            .add_input("voice.wav")
            .video_codec("libx264")
            .pixel_format("yuv420p")
            .shortest();

        let args = cmd.build_args();
        let concat = args.iter().position(|a| a == "concat").unwrap();
        let first_input = args.iter().position(|a| a == "list.txt").unwrap();
        let second_input = args.iter().position(|a| a == "voice.wav").unwrap();
        assert!(concat < first_input);
        assert!(first_input < second_input);
        assert_eq!(args.last().unwrap(), "out.mp4");
        assert!(args.contains(&"pipe:2".to_string()));
        assert!(args.contains(&"-shortest".to_string()));
    }

    #[test]
    fn test_into_spec() {
        let spec = FfmpegCommand::new("in.png", "out.png").single_frame().into_spec();
        assert_eq!(spec.program, "ffmpeg");
        assert_eq!(spec.name, "ffmpeg");
        assert!(spec.args.contains(&"-frames:v".to_string()));
    }
}
