//! Where a rendered transcript ends up: a file next to the input, an explicit
//! output path, or stdout.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};
use crate::output::OutputKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Stdout,
    File(PathBuf),
}

/// Output kind implied by an explicit output path, if its extension is one we render.
pub fn kind_from_output_path(output: Option<&Path>) -> Option<OutputKind> {
    output
        .and_then(|path| path.extension())
        .and_then(|ext| ext.to_str())
        .and_then(OutputKind::parse)
}

/// The explicit path if given, otherwise the input path with the kind's extension.
pub fn resolve_output_path(input: &Path, output: Option<&Path>, kind: OutputKind) -> PathBuf {
    match output {
        Some(path) => path.to_path_buf(),
        None => input.with_extension(kind.extension()),
    }
}

/// Write `content` to `destination`.
///
/// When the file cannot be written the transcript is not lost: it is printed to
/// stdout before the `OutputWriteFailure` is returned.
pub fn deliver(content: &str, destination: &Destination) -> AppResult<()> {
    match destination {
        Destination::Stdout => print_content(content),
        Destination::File(path) => {
            tracing::info!(path = %path.display(), "Saving output");
            match std::fs::write(path, content) {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "Transcription saved");
                    Ok(())
                }
                Err(e) => {
                    tracing::warn!("Could not write output file, printing transcript instead");
                    print_content(content)?;
                    Err(AppError::OutputWriteFailure(format!("{}: {}", path.display(), e)))
                }
            }
        }
    }
}

fn print_content(content: &str) -> AppResult<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", content)?;
    stdout.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_output_path_replaces_extension() {
        let path = resolve_output_path(Path::new("/media/talk.mp3"), None, OutputKind::Srt);
        assert_eq!(path, PathBuf::from("/media/talk.srt"));
    }

    #[test]
    fn test_explicit_output_path_is_kept() {
        let explicit = Path::new("/out/transcript.json");
        let path = resolve_output_path(Path::new("/media/talk.mp3"), Some(explicit), OutputKind::Text);
        assert_eq!(path, explicit);
    }

    #[test]
    fn test_kind_from_output_extension() {
        assert_eq!(kind_from_output_path(Some(Path::new("a/b.srt"))), Some(OutputKind::Srt));
        assert_eq!(kind_from_output_path(Some(Path::new("a/b.JSON"))), Some(OutputKind::Json));
        assert_eq!(kind_from_output_path(Some(Path::new("a/b.docx"))), None);
        assert_eq!(kind_from_output_path(Some(Path::new("a/b"))), None);
        assert_eq!(kind_from_output_path(None), None);
    }

    #[test]
    fn test_deliver_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");

        deliver("hello", &Destination::File(path.clone())).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }

    #[test]
    fn test_deliver_reports_unwritable_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.txt");

        let err = deliver("hello", &Destination::File(path)).unwrap_err();
        assert_eq!(err.kind(), "output_write_failure");
    }
}
