use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use unicode_normalization::UnicodeNormalization as _;

use crate::model::VolumeMetadata;

pub const BOOK_EXTENSION: &str = "epub";

/// Everything except unreserved characters and `/` is escaped.
const CHAPTER_REF_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'[')
    .add(b']')
    .add(b'\\')
    .add(b'^')
    .add(b'|')
    .add(b'\'')
    .add(b'&')
    .add(b'+')
    .add(b',')
    .add(b';')
    .add(b'=')
    .add(b'@')
    .add(b':')
    .add(b'$')
    .add(b'!')
    .add(b'(')
    .add(b')')
    .add(b'*');

/// ASCII-only, separator-free file name component.
pub fn secure_filename(name: &str) -> String {
    let ascii = name
        .nfkd()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect::<String>();
    let joined = ascii.split_whitespace().collect::<Vec<_>>().join("_");
    joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect::<String>()
        .trim_matches(|c| c == '.' || c == '_')
        .to_string()
}

/// File stem for a chapter reference: its percent-decoded last path segment
/// with separators, traversal sequences and control characters removed.
pub fn chapter_file_stem(chapter_ref: &str) -> Option<String> {
    let decoded = percent_decode_str(chapter_ref.trim()).decode_utf8_lossy();
    let segment = decoded
        .split(['/', '\\'])
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .last()?;

    let mut stem = segment.replace("..", "");
    stem.retain(|c| !c.is_control());
    let stem = stem.trim().trim_start_matches('.').trim().to_string();
    if stem.is_empty() { None } else { Some(stem) }
}

/// True for path-like references (`/a`, `chapitres/7`) that resolve on the
/// upstream's own origin; absolute and scheme-relative URLs are not.
pub fn is_site_relative(chapter_ref: &str) -> bool {
    let trimmed = chapter_ref.trim();
    let scheme_relative = trimmed
        .chars()
        .take(2)
        .filter(|c| matches!(c, '/' | '\\'))
        .count()
        == 2;
    !scheme_relative && url::Url::parse(trimmed).is_err()
}

/// Title made safe to use as a single file name (keeps unicode).
pub fn book_file_name(title: &str) -> String {
    format!("{}.{BOOK_EXTENSION}", book_file_stem(title))
}

pub fn book_file_stem(title: &str) -> String {
    let mut name = title
        .chars()
        .map(|c| match c {
            '/' | '\\' => '-',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect::<String>()
        .replace("..", ".");
    name = name.trim().trim_start_matches('.').to_string();
    if name.is_empty() {
        name = "untitled".to_string();
    }
    name
}

/// Escapes a chapter reference for transport in a response body.
pub fn escape_chapter_ref(chapter_ref: &str) -> String {
    utf8_percent_encode(chapter_ref, CHAPTER_REF_ENCODE_SET).to_string()
}

/// `<root>/<collection>/<volume>` for a dump request. The path parameters are
/// used when the metadata does not name the collection or the volume.
pub fn volume_dir(root: &Path, novel: &str, volume: &str, metadata: &VolumeMetadata) -> PathBuf {
    let collection = metadata
        .collections
        .first()
        .map(|c| c.name.as_str())
        .unwrap_or(novel);
    let volume_name = metadata.volume_name.as_deref().unwrap_or(volume);
    root.join(non_empty_or(secure_filename(collection), novel))
        .join(non_empty_or(secure_filename(volume_name), volume))
}

fn non_empty_or(sanitized: String, fallback: &str) -> String {
    if sanitized.is_empty() {
        let fallback = secure_filename(fallback);
        if fallback.is_empty() {
            "untitled".to_string()
        } else {
            fallback
        }
    } else {
        sanitized
    }
}

pub fn chapter_book_path(folder: &Path, stem: &str) -> PathBuf {
    folder.join(format!("{stem}.{BOOK_EXTENSION}"))
}

/// Stems of the book files directly under `folder`; empty when it does not exist.
pub fn existing_book_stems(folder: &Path) -> anyhow::Result<HashSet<String>> {
    let entries = match std::fs::read_dir(folder) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("read dir: {}", folder.display()));
        }
    };

    let mut stems = HashSet::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("list dir: {}", folder.display()))?;
        let path = entry.path();
        if !is_book_file(&path) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            stems.insert(stem.to_string());
        }
    }
    Ok(stems)
}

pub fn is_book_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(BOOK_EXTENSION))
}
