//! Shared file utility functions
//!
//! Extension classification used by the ingestion pipeline, subtitle
//! language suffix handling, and the move-or-replace primitive every library
//! move goes through.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Video file extensions (lowercase)
pub const VIDEO_EXTENSIONS: &[&str] = &[".avi", ".mp4", ".mkv"];

/// Audio file extensions (lowercase)
pub const AUDIO_EXTENSIONS: &[&str] = &[".mp3", ".flac"];

/// Archive file extensions (lowercase)
pub const ARCHIVE_EXTENSIONS: &[&str] = &[".rar"];

/// ISO 639-2 (bibliographic and terminologic) codes and their ISO 639-1 equivalent
#[rustfmt::skip]
const LANGUAGE_CODES: &[(&str, &str)] = &[
    ("aar", "aa"), ("abk", "ab"), ("afr", "af"), ("aka", "ak"), ("alb", "sq"), ("amh", "am"),
    ("ara", "ar"), ("arg", "an"), ("arm", "hy"), ("asm", "as"), ("ava", "av"), ("ave", "ae"),
    ("aym", "ay"), ("aze", "az"), ("bak", "ba"), ("bam", "bm"), ("baq", "eu"), ("bel", "be"),
    ("ben", "bn"), ("bis", "bi"), ("bod", "bo"), ("bos", "bs"), ("bre", "br"), ("bul", "bg"),
    ("bur", "my"), ("cat", "ca"), ("ces", "cs"), ("cha", "ch"), ("che", "ce"), ("chi", "zh"),
    ("chu", "cu"), ("chv", "cv"), ("cor", "kw"), ("cos", "co"), ("cre", "cr"), ("cym", "cy"),
    ("cze", "cs"), ("dan", "da"), ("deu", "de"), ("div", "dv"), ("dut", "nl"), ("dzo", "dz"),
    ("ell", "el"), ("eng", "en"), ("epo", "eo"), ("est", "et"), ("eus", "eu"), ("ewe", "ee"),
    ("fao", "fo"), ("fas", "fa"), ("fij", "fj"), ("fin", "fi"), ("fra", "fr"), ("fre", "fr"),
    ("fry", "fy"), ("ful", "ff"), ("geo", "ka"), ("ger", "de"), ("gla", "gd"), ("gle", "ga"),
    ("glg", "gl"), ("glv", "gv"), ("gre", "el"), ("grn", "gn"), ("guj", "gu"), ("hat", "ht"),
    ("hau", "ha"), ("heb", "he"), ("her", "hz"), ("hin", "hi"), ("hmo", "ho"), ("hrv", "hr"),
    ("hun", "hu"), ("hye", "hy"), ("ibo", "ig"), ("ice", "is"), ("ido", "io"), ("iii", "ii"),
    ("iku", "iu"), ("ile", "ie"), ("ina", "ia"), ("ind", "id"), ("ipk", "ik"), ("isl", "is"),
    ("ita", "it"), ("jav", "jv"), ("jpn", "ja"), ("kal", "kl"), ("kan", "kn"), ("kas", "ks"),
    ("kat", "ka"), ("kau", "kr"), ("kaz", "kk"), ("khm", "km"), ("kik", "ki"), ("kin", "rw"),
    ("kir", "ky"), ("kom", "kv"), ("kon", "kg"), ("kor", "ko"), ("kua", "kj"), ("kur", "ku"),
    ("lao", "lo"), ("lat", "la"), ("lav", "lv"), ("lim", "li"), ("lin", "ln"), ("lit", "lt"),
    ("ltz", "lb"), ("lub", "lu"), ("lug", "lg"), ("mac", "mk"), ("mah", "mh"), ("mal", "ml"),
    ("mao", "mi"), ("mar", "mr"), ("may", "ms"), ("mkd", "mk"), ("mlg", "mg"), ("mlt", "mt"),
    ("mon", "mn"), ("mri", "mi"), ("msa", "ms"), ("mya", "my"), ("nau", "na"), ("nav", "nv"),
    ("nbl", "nr"), ("nde", "nd"), ("ndo", "ng"), ("nep", "ne"), ("nld", "nl"), ("nno", "nn"),
    ("nob", "nb"), ("nor", "no"), ("nya", "ny"), ("oci", "oc"), ("oji", "oj"), ("ori", "or"),
    ("orm", "om"), ("oss", "os"), ("pan", "pa"), ("per", "fa"), ("pli", "pi"), ("pol", "pl"),
    ("por", "pt"), ("pus", "ps"), ("que", "qu"), ("roh", "rm"), ("ron", "ro"), ("rum", "ro"),
    ("run", "rn"), ("rus", "ru"), ("sag", "sg"), ("san", "sa"), ("sin", "si"), ("slk", "sk"),
    ("slo", "sk"), ("slv", "sl"), ("sme", "se"), ("smo", "sm"), ("sna", "sn"), ("snd", "sd"),
    ("som", "so"), ("sot", "st"), ("spa", "es"), ("sqi", "sq"), ("srd", "sc"), ("srp", "sr"),
    ("ssw", "ss"), ("sun", "su"), ("swa", "sw"), ("swe", "sv"), ("tah", "ty"), ("tam", "ta"),
    ("tat", "tt"), ("tel", "te"), ("tgk", "tg"), ("tgl", "tl"), ("tha", "th"), ("tib", "bo"),
    ("tir", "ti"), ("ton", "to"), ("tsn", "tn"), ("tso", "ts"), ("tuk", "tk"), ("tur", "tr"),
    ("twi", "tw"), ("uig", "ug"), ("ukr", "uk"), ("urd", "ur"), ("uzb", "uz"), ("ven", "ve"),
    ("vie", "vi"), ("vol", "vo"), ("wel", "cy"), ("wln", "wa"), ("wol", "wo"), ("xho", "xh"),
    ("yid", "yi"), ("yor", "yo"), ("zha", "za"), ("zho", "zh"), ("zul", "zu"),
    // subtitle providers' code for Brazilian Portuguese
    ("pob", "pb"),
];

/// How the ingestion pipeline treats a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Archive,
    Other,
}

impl MediaKind {
    pub fn of(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if has_extension(&name, VIDEO_EXTENSIONS) {
            MediaKind::Video
        } else if has_extension(&name, AUDIO_EXTENSIONS) {
            MediaKind::Audio
        } else if has_extension(&name, ARCHIVE_EXTENSIONS) {
            MediaKind::Archive
        } else {
            MediaKind::Other
        }
    }
}

fn has_extension(lower_name: &str, extensions: &[&str]) -> bool {
    extensions.iter().any(|ext| lower_name.ends_with(ext))
}

/// Map a three-letter language code to its two-letter form
pub fn two_letter_language(code: &str) -> Option<&'static str> {
    let code = code.to_lowercase();
    LANGUAGE_CODES
        .iter()
        .find(|(three, _)| *three == code)
        .map(|(_, two)| *two)
}

/// Every subtitle suffix recognized next to a video: `.srt`, `.xx.srt`, `.xxx.srt`
pub fn subtitle_suffixes() -> Vec<String> {
    let mut suffixes = vec![".srt".to_string()];
    for (three, two) in LANGUAGE_CODES {
        suffixes.push(format!(".{}.srt", three));
        let two_letter = format!(".{}.srt", two);
        if !suffixes.contains(&two_letter) {
            suffixes.push(two_letter);
        }
    }
    suffixes
}

/// `/a/b/Show.eng.srt` -> `/a/b/Show.en.srt`; `None` when the file does not
/// carry a known three-letter language code
pub fn to_two_letter_subtitle_path(path: &Path) -> Option<PathBuf> {
    let file_name = path.file_name()?.to_str()?;
    let stem = file_name.strip_suffix(".srt")?;
    let (base, code) = stem.rsplit_once('.')?;
    if code.len() != 3 {
        return None;
    }
    let two = two_letter_language(code)?;
    Some(path.with_file_name(format!("{}.{}.srt", base, two)))
}

/// Path without its last extension: `/a/b/video.mkv` -> `/a/b/video`
pub fn path_without_extension(path: &Path) -> PathBuf {
    match path.file_stem() {
        Some(stem) => path.with_file_name(stem),
        None => path.to_path_buf(),
    }
}

/// Append a raw suffix to a path: (`/a/video`, `.en.srt`) -> `/a/video.en.srt`
pub fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut raw = base.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// Sanitize a string for use as a filename
pub fn sanitize_for_filename(name: &str) -> String {
    sanitize_filename::sanitize(name).trim().to_string()
}

/// Move a file, replacing whatever is at `dest`.
///
/// Parent directories of `dest` are created. Falls back to copy+delete when
/// `rename` fails (e.g. across filesystems).
pub async fn move_or_replace(src: &Path, dest: &Path) -> Result<()> {
    if src == dest {
        return Ok(());
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    if tokio::fs::try_exists(dest).await.unwrap_or(false) {
        debug!(dest = %dest.display(), "Replacing existing file");
        tokio::fs::remove_file(dest)
            .await
            .with_context(|| format!("Failed to remove existing {}", dest.display()))?;
    }

    match tokio::fs::rename(src, dest).await {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(
                src = %src.display(),
                dest = %dest.display(),
                error = %e,
                "Rename failed, falling back to copy"
            );
            tokio::fs::copy(src, dest)
                .await
                .with_context(|| format!("Failed to copy {} to {}", src.display(), dest.display()))?;
            tokio::fs::remove_file(src)
                .await
                .with_context(|| format!("Failed to remove {}", src.display()))?;
            Ok(())
        }
    }
}

/// Sum of the sizes of every file below `path`; 0 when it does not exist
pub fn dir_size(path: &Path) -> u64 {
    if !path.exists() {
        return 0;
    }

    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Every regular file below `path`, sorted for deterministic processing
pub fn list_files_recursive(path: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}
