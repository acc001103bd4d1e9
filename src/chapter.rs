use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use regex::Regex;

use crate::debounce::MergeScheduler;
use crate::epub::{Book, SaveOptions};
use crate::images::CoverSource;
use crate::model::{BookMetadata, VolumeMetadata};
use crate::paths::chapter_book_path;

pub const DEFAULT_CHAPTER_PATTERN: &str = r"(?i)\bchap(?:itre|ter)\s*(\d+)";

/// Injected ahead of every chapter page so scene breaks and images render
/// the same in every reader.
pub const CHAPTER_STYLESHEET: &str = r#"p {
  margin: 13px 0;
}

body, div, img {
  padding: 0pt;
  margin: 0pt;
  line-height: 125%;
}

body {
  text-align: left;
}

.line-break {
  display: block;
  width: 100%;
  height: 1em;
  position: relative;
}

.line-break::after {
  position: absolute;
  font-style: italic;
  content: "* * *";
  left: 50%;
  transform: translateX(-75%);
}

img {
  display: block;
  margin-left: auto;
  margin-right: auto;
  margin-bottom: 1em;
  max-width: 75%;
  max-height: 80%;
  object-fit: contain;
}
"#;

/// Finds the chapter index in a free-text chapter title.
pub trait ChapterNumbering: Send + Sync {
    fn chapter_index(&self, title: &str) -> Option<u32>;
}

/// Regex with one capture group holding the chapter index.
#[derive(Debug, Clone)]
pub struct ChapterMarker {
    pattern: Regex,
}

impl ChapterMarker {
    pub fn new(pattern: &str) -> anyhow::Result<Self> {
        let pattern =
            Regex::new(pattern).with_context(|| format!("invalid chapter pattern: {pattern}"))?;
        if pattern.captures_len() < 2 {
            anyhow::bail!("chapter pattern needs a capture group: {pattern}");
        }
        Ok(Self { pattern })
    }
}

impl Default for ChapterMarker {
    fn default() -> Self {
        Self {
            pattern: Regex::new(DEFAULT_CHAPTER_PATTERN).expect("valid chapter pattern"),
        }
    }
}

impl ChapterNumbering for ChapterMarker {
    fn chapter_index(&self, title: &str) -> Option<u32> {
        self.pattern
            .captures(title)
            .and_then(|cap| cap.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

/// Number of digits in `total`, at least one.
pub fn zfill_width(total: usize) -> usize {
    total.max(1).to_string().len()
}

/// `"<base>.<index zero-padded to the digit count of total>"`.
pub fn collection_number(base: &str, index: u32, total: usize) -> String {
    collection_number_with_width(base, index, zfill_width(total))
}

pub fn collection_number_with_width(base: &str, index: u32, width: usize) -> String {
    format!("{base}.{index:0width$}")
}

/// Integer part of the volume's own collection number, `"0"` when absent.
pub fn base_volume_number(metadata: &VolumeMetadata) -> String {
    metadata
        .collections
        .first()
        .and_then(|c| c.number.as_deref())
        .map(|n| integer_part(n).to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "0".to_string())
}

pub(crate) fn integer_part(number: &str) -> &str {
    let number = number.trim();
    number.split('.').next().unwrap_or(number)
}

/// Cleaned content of one chapter, ready to be packaged.
#[derive(Debug, Clone)]
pub struct ChapterContent {
    /// File stem, derived from the chapter reference.
    pub stem: String,
    /// Display title.
    pub title: String,
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Written(PathBuf),
    AlreadyExists(PathBuf),
}

pub struct ChapterBookBuilder {
    numbering: Arc<dyn ChapterNumbering>,
    scheduler: Arc<MergeScheduler>,
}

impl ChapterBookBuilder {
    pub fn new(numbering: Arc<dyn ChapterNumbering>, scheduler: Arc<MergeScheduler>) -> Self {
        Self {
            numbering,
            scheduler,
        }
    }

    pub fn numbering(&self) -> &dyn ChapterNumbering {
        self.numbering.as_ref()
    }

    pub fn chapter_number(&self, chapter: &ChapterContent, base: &str, total: usize) -> String {
        let index = self
            .numbering
            .chapter_index(&chapter.title)
            .or_else(|| self.numbering.chapter_index(&chapter.stem))
            .unwrap_or(0);
        collection_number(base, index, total)
    }

    pub fn build(
        &self,
        chapter: &ChapterContent,
        volume: &VolumeMetadata,
        total_chapters: usize,
        cover: &CoverSource,
    ) -> Book {
        let mut collections = volume.collections.clone();
        if let Some(first) = collections.first_mut() {
            first.number = Some(self.chapter_number(
                chapter,
                &base_volume_number(volume),
                total_chapters,
            ));
        }

        let metadata = BookMetadata {
            title: chapter.title.clone(),
            creators: volume.creators.clone(),
            contributors: volume.contributors.clone(),
            collections,
            description: volume.description.clone(),
            lang: volume.lang.clone(),
            rights: volume.rights.clone(),
            subjects: volume.subjects.clone(),
        };

        let mut book = Book::new(metadata);
        cover.apply(&mut book);
        book.add_stylesheet(CHAPTER_STYLESHEET);
        book.add_page(chapter.title.clone(), chapter.html.clone());
        book
    }

    /// Writes `<folder>/<stem>.epub` unless it already exists, then re-arms
    /// the merge timer for `folder`.
    pub async fn save(&self, book: Book, folder: &Path, stem: &str) -> anyhow::Result<SaveOutcome> {
        let path = chapter_book_path(folder, stem);
        if path.exists() {
            tracing::debug!(path = %path.display(), "chapter book already exists");
            return Ok(SaveOutcome::AlreadyExists(path));
        }

        let out = path.clone();
        tokio::task::spawn_blocking(move || {
            book.save(
                &out,
                SaveOptions {
                    visible_toc: false,
                    cover_as_first_page: false,
                    force: false,
                },
            )
        })
        .await
        .context("join chapter save task")??;

        tracing::info!(path = %path.display(), "saved chapter book");
        self.scheduler.arm(folder);
        Ok(SaveOutcome::Written(path))
    }
}
