//! FileBot wrapper
//!
//! FileBot identifies a video and moves it to its canonical library location.
//! The destination is only known from its console output, so the two patterns
//! below are the whole contract: an "already exists" report (consulted on a
//! non-zero exit) and the `[MOVE] from [..] to [..]` line. Anything else is a
//! failure, never a guess.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use super::command::{CommandOutput, CommandRequest, CommandRunner};
use super::file_utils::{move_or_replace, path_without_extension, to_two_letter_subtitle_path, with_suffix};

static ALREADY_EXISTS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"because \[(?P<dest>.*)\] already exists").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenameAction {
    #[default]
    Move,
    Copy,
    Test,
}

impl RenameAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenameAction::Move => "move",
            RenameAction::Copy => "copy",
            RenameAction::Test => "test",
        }
    }
}

impl fmt::Display for RenameAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RenameRequest {
    pub path: PathBuf,
    /// Library root the `{plex}` format is resolved under
    pub base_dest_path: PathBuf,
    pub action: RenameAction,
    /// Force a metadata database (`TheMovieDB`, `TheTVDB`, ...)
    pub db: Option<String>,
}

impl RenameRequest {
    pub fn new(path: impl Into<PathBuf>, base_dest_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            base_dest_path: base_dest_path.into(),
            action: RenameAction::default(),
            db: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RenameResult {
    pub succeeded: bool,
    pub dest_path: Option<PathBuf>,
    pub raw_command: String,
    pub output: CommandOutput,
    pub reason: String,
}

pub struct FilebotService {
    filebot_path: String,
    runner: Arc<dyn CommandRunner>,
}

impl FilebotService {
    pub fn new(filebot_path: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            filebot_path: filebot_path.into(),
            runner,
        }
    }

    /// Ask FileBot for the canonical location of `request.path`
    pub async fn rename(&self, request: &RenameRequest) -> RenameResult {
        let format = request.base_dest_path.join("{plex}");
        let mut command = CommandRequest::new(&self.filebot_path)
            .arg("-rename")
            .path_arg(&request.path)
            .arg("--format")
            .path_arg(&format)
            .arg("-non-strict")
            .arg("--action")
            .arg(request.action.as_str());
        if let Some(db) = &request.db {
            command = command.arg("--db").arg(db);
        }

        let mut result = RenameResult {
            raw_command: command.to_string(),
            ..RenameResult::default()
        };

        result.output = match self.runner.run(&command).await {
            Ok(output) => output,
            Err(e) => {
                warn!(path = %request.path.display(), error = %e, "FileBot could not run");
                result.reason = e.to_string();
                return result;
            }
        };

        debug!(
            exit_code = result.output.exit_code,
            stdout = %result.output.stdout,
            stderr = %result.output.stderr,
            "FileBot finished"
        );

        match parse_rename_output(&result.output, request.action) {
            Some((dest, reason)) => {
                info!(dest = %dest.display(), reason, "FileBot rename succeeded");
                result.dest_path = Some(dest);
                result.reason = reason.to_string();
                result.succeeded = true;
            }
            None => {
                warn!(path = %request.path.display(), "FileBot output has no destination");
                result.reason = "could not determine destination from output".to_string();
            }
        }

        result
    }

    /// Download subtitles for `video` in `lang` (three-letter code).
    ///
    /// FileBot exits with 0 whether or not it found anything, so success means
    /// `<video stem>.<lang>.srt` exists afterwards. The file is renamed to the
    /// two-letter code and its final path returned.
    pub async fn get_subtitles(&self, video: &Path, lang: &str, non_strict: bool) -> Option<PathBuf> {
        let mut command = CommandRequest::new(&self.filebot_path)
            .arg("-get-subtitles")
            .path_arg(video)
            .arg("--lang")
            .arg(lang);
        if non_strict {
            command = command.arg("-non-strict");
        }

        if let Err(e) = self.runner.run(&command).await {
            warn!(video = %video.display(), lang, error = %e, "FileBot subtitle fetch could not run");
            return None;
        }

        let expected = with_suffix(&path_without_extension(video), &format!(".{}.srt", lang));
        if !tokio::fs::try_exists(&expected).await.unwrap_or(false) {
            debug!(expected = %expected.display(), "No subtitle downloaded");
            return None;
        }

        let Some(two_letter) = to_two_letter_subtitle_path(&expected) else {
            return Some(expected);
        };

        match move_or_replace(&expected, &two_letter).await {
            Ok(()) => Some(two_letter),
            Err(e) => {
                warn!(subtitle = %expected.display(), error = %e, "Failed to rename subtitle");
                Some(expected)
            }
        }
    }
}

/// Destination and reason, or `None` when the output carries no destination
fn parse_rename_output(output: &CommandOutput, action: RenameAction) -> Option<(PathBuf, &'static str)> {
    if !output.success() {
        if let Some(caps) = ALREADY_EXISTS_PATTERN.captures(&output.stdout) {
            return Some((PathBuf::from(&caps["dest"]), "file already exists at destination"));
        }
    }

    let moved = Regex::new(&format!(
        r"\[{}\].*\[.*\] to \[(?P<dest>.*)\]",
        action.as_str().to_uppercase()
    ))
    .ok()?;

    moved
        .captures(&output.stdout)
        .map(|caps| (PathBuf::from(&caps["dest"]), "found"))
}
