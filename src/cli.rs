//! Command line surface.
//!
//! Without a subcommand the binary is the client: it transcribes one file,
//! through the background service by default or in-process with `--local`.
//! `serve` runs the background service itself and is what the client spawns.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::output::{kind_from_output_path, FormatOverrides};

#[derive(Debug, Parser)]
#[command(name = "whisper-relay", version, about = "Transcribe audio and video files with Whisper")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Configuration file (defaults to config.{json,toml,yaml} in the working directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Media file to transcribe; asked for on stdin when omitted
    #[arg(short, long)]
    pub input_file: Option<PathBuf>,

    /// Where to write the transcript; its extension selects the format
    #[arg(short, long)]
    pub output_file: Option<PathBuf>,

    /// Language code passed to the model
    #[arg(short, long)]
    pub language: Option<String>,

    /// Model size for --local runs
    #[arg(short, long)]
    pub model: Option<String>,

    /// Include segment timings (overrides the config file)
    #[arg(short = 't', long = "timestamp", value_name = "BOOL")]
    pub timestamps: Option<bool>,

    /// Include segment confidence (overrides the config file)
    #[arg(short, long, value_name = "BOOL")]
    pub confidence: Option<bool>,

    /// Print the transcript to stdout instead of writing a file
    #[arg(short, long)]
    pub print: bool,

    /// Ask the background service to exit
    #[arg(short, long, conflicts_with = "local")]
    pub stop: bool,

    /// Run the model in this process instead of using the background service
    #[arg(long)]
    pub local: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the background transcription service
    Serve,
}

impl Args {
    pub fn format_overrides(&self) -> FormatOverrides {
        FormatOverrides {
            kind: kind_from_output_path(self.output_file.as_deref()),
            include_timestamps: self.timestamps,
            include_confidence: self.confidence,
        }
    }

    /// Default log filter; `--print` keeps stderr quiet so stdout stays clean to pipe.
    pub fn default_log_filter(&self) -> &'static str {
        if self.print {
            "warn"
        } else {
            "whisper_relay=info,actix_web=info"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputKind;

    #[test]
    fn test_tristate_flags() {
        let args = Args::parse_from(["whisper-relay", "-i", "talk.mp3"]);
        assert_eq!(args.format_overrides(), FormatOverrides::default());

        let args = Args::parse_from(["whisper-relay", "-i", "talk.mp3", "-t", "false", "-c", "true"]);
        let overrides = args.format_overrides();
        assert_eq!(overrides.include_timestamps, Some(false));
        assert_eq!(overrides.include_confidence, Some(true));
    }

    #[test]
    fn test_output_extension_selects_kind() {
        let args = Args::parse_from(["whisper-relay", "-i", "talk.mp3", "-o", "talk.srt"]);
        assert_eq!(args.format_overrides().kind, Some(OutputKind::Srt));

        let args = Args::parse_from(["whisper-relay", "-i", "talk.mp3", "-o", "talk.notes"]);
        assert_eq!(args.format_overrides().kind, None);
    }

    #[test]
    fn test_serve_subcommand_accepts_config() {
        let args = Args::parse_from(["whisper-relay", "serve", "--config", "/etc/whisper/config.json"]);
        assert!(matches!(args.command, Some(Command::Serve)));
        assert_eq!(args.config, Some(PathBuf::from("/etc/whisper/config.json")));
    }

    #[test]
    fn test_stop_and_local_conflict() {
        assert!(Args::try_parse_from(["whisper-relay", "--stop", "--local"]).is_err());
    }

    #[test]
    fn test_print_quiets_logs() {
        let args = Args::parse_from(["whisper-relay", "-p"]);
        assert_eq!(args.default_log_filter(), "warn");
    }
}
