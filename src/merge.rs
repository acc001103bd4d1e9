use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;

use crate::chapter::integer_part;
use crate::debounce::MergeAction;
use crate::epub::{Book, SaveOptions};
use crate::model::{BookMetadata, Person};
use crate::paths::{book_file_name, is_book_file};

/// Structural folder names that never make a good volume title.
pub const RESERVED_FOLDER_NAMES: [&str; 2] = ["Chapitres", "Volumes"];
pub const DEFAULT_MERGED_LANG: &str = "en";

/// Consolidates the chapter books of one folder into a single volume book
/// written next to the folder.
#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeMerger;

impl VolumeMerger {
    /// Returns the written path, or `None` when the folder holds no books.
    pub fn merge_folder(&self, folder: &Path) -> anyhow::Result<Option<PathBuf>> {
        let books = read_books_in_order(folder)?;
        if books.is_empty() {
            tracing::info!(folder = %folder.display(), "no chapter books to merge");
            return Ok(None);
        }

        let metadata = reconcile_metadata(folder, &books);
        let mut merged = Book::merge(metadata, &books);
        if let Some(cover) = books[0].cover() {
            merged.set_cover(cover.data.clone());
        }

        let parent = folder
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let out_path = parent.join(book_file_name(&merged.metadata().title));
        if out_path.exists() {
            fs::remove_file(&out_path)
                .with_context(|| format!("remove previous volume: {}", out_path.display()))?;
        }
        merged.save(
            &out_path,
            SaveOptions {
                visible_toc: true,
                cover_as_first_page: true,
                force: false,
            },
        )?;

        tracing::info!(
            folder = %folder.display(),
            path = %out_path.display(),
            chapters = books.len(),
            "merged volume"
        );
        Ok(Some(out_path))
    }

    /// Merges every directory under `root` that has no subdirectories.
    pub fn merge_tree(&self, root: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for folder in leaf_dirs(root)? {
            if let Some(path) = self.merge_folder(&folder)? {
                written.push(path);
            }
        }
        Ok(written)
    }
}

fn read_books_in_order(folder: &Path) -> anyhow::Result<Vec<Book>> {
    let mut paths = Vec::new();
    let entries =
        fs::read_dir(folder).with_context(|| format!("read dir: {}", folder.display()))?;
    for entry in entries {
        let path = entry
            .with_context(|| format!("list dir: {}", folder.display()))?
            .path();
        if is_book_file(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut keyed = Vec::with_capacity(paths.len());
    for path in paths {
        let book = Book::read(&path)?;
        let key = book
            .metadata()
            .first_collection()
            .map(|c| c.sort_key())
            .unwrap_or(0.0);
        keyed.push((key, book));
    }
    keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
    Ok(keyed.into_iter().map(|(_, book)| book).collect())
}

/// Metadata of the merged volume. `books` must already be in reading order.
pub fn reconcile_metadata(folder: &Path, books: &[Book]) -> BookMetadata {
    let first = books.first().map(Book::metadata);

    let mut collections = first.map(|m| m.collections.clone()).unwrap_or_default();
    if let Some(number) = collections.first_mut().and_then(|c| c.number.as_mut()) {
        *number = integer_part(number).to_string();
    }

    let mut description = Vec::<&str>::new();
    let mut subjects = Vec::<String>::new();
    let mut creators = Vec::<Person>::new();
    let mut contributors = Vec::<Person>::new();
    for metadata in books.iter().map(Book::metadata) {
        union_into(&mut creators, &metadata.creators);
        union_into(&mut contributors, &metadata.contributors);
        union_into(&mut subjects, &metadata.subjects);
        if let Some(text) = metadata.description.as_deref().filter(|d| !d.is_empty()) {
            if !description.contains(&text) {
                description.push(text);
            }
        }
    }

    BookMetadata {
        title: merged_title(folder, first),
        creators,
        contributors,
        collections,
        description: (!description.is_empty()).then(|| description.join("\n\n")),
        lang: Some(
            first
                .and_then(|m| m.lang.clone())
                .unwrap_or_else(|| DEFAULT_MERGED_LANG.to_string()),
        ),
        rights: Some(first.and_then(|m| m.rights.clone()).unwrap_or_default()),
        subjects,
    }
}

/// The folder's name, unless it is a structural placeholder: then the series
/// name of the first chapter, else the name of the enclosing folder.
fn merged_title(folder: &Path, first: Option<&BookMetadata>) -> String {
    let name = dir_name(folder);
    if !RESERVED_FOLDER_NAMES.contains(&name.as_str()) {
        return name;
    }
    first
        .and_then(BookMetadata::first_collection)
        .map(|c| c.name.clone())
        .filter(|n| !n.trim().is_empty())
        .or_else(|| folder.parent().map(dir_name))
        .unwrap_or(name)
}

fn dir_name(path: &Path) -> String {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    absolute
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn union_into<T: PartialEq + Clone>(acc: &mut Vec<T>, items: &[T]) {
    for item in items {
        if !acc.contains(item) {
            acc.push(item.clone());
        }
    }
}

fn leaf_dirs(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut leaves = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut children = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read dir: {}", dir.display()))? {
            let path = entry
                .with_context(|| format!("list dir: {}", dir.display()))?
                .path();
            if path.is_dir() {
                children.push(path);
            }
        }
        if children.is_empty() {
            leaves.push(dir);
        } else {
            stack.extend(children);
        }
    }
    leaves.sort();
    Ok(leaves)
}

/// Runs merges off the async workers, one at a time across the process.
pub struct VolumeMergeAction {
    merger: VolumeMerger,
    serial: tokio::sync::Mutex<()>,
}

impl VolumeMergeAction {
    pub fn new(merger: VolumeMerger) -> Self {
        Self {
            merger,
            serial: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl MergeAction for VolumeMergeAction {
    async fn run(&self, folder: PathBuf) {
        let _serial = self.serial.lock().await;
        let merger = self.merger;
        let task_folder = folder.clone();
        match tokio::task::spawn_blocking(move || merger.merge_folder(&task_folder)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                tracing::error!(folder = %folder.display(), ?err, "volume merge failed");
            }
            Err(err) => {
                tracing::error!(folder = %folder.display(), ?err, "volume merge task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Collection;

    fn chapter(title: &str, number: &str, creator: &str, description: &str) -> Book {
        let mut book = Book::new(BookMetadata {
            title: title.to_string(),
            creators: vec![Person {
                name: creator.to_string(),
                role: Some("aut".to_string()),
            }],
            collections: vec![Collection {
                name: "The Novel".to_string(),
                id: None,
                number: Some(number.to_string()),
                kind: Some("series".to_string()),
            }],
            description: Some(description.to_string()),
            subjects: vec!["Fantasy".to_string()],
            ..BookMetadata::default()
        });
        book.generate_cover();
        book.add_page(title, format!("<p>{title}</p>"));
        book
    }

    fn write(folder: &Path, file: &str, book: &Book) -> anyhow::Result<()> {
        book.save(&folder.join(file), SaveOptions::default())
    }

    #[test]
    fn merges_in_collection_number_order() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let folder = root.path().join("Tome_1");
        fs::create_dir_all(&folder)?;
        // File names sort opposite to reading order.
        write(&folder, "a.epub", &chapter("Trois", "1.00003", "A", "d"))?;
        write(&folder, "b.epub", &chapter("Deux", "1.00002", "B", "d"))?;
        write(&folder, "c.epub", &chapter("Un", "1.00001", "A", ""))?;

        let out = VolumeMerger.merge_folder(&folder)?.unwrap();
        assert_eq!(out, root.path().join("Tome_1.epub"));

        let merged = Book::read(&out)?;
        let titles = merged
            .pages()
            .iter()
            .map(|p| p.title.as_str())
            .collect::<Vec<_>>();
        assert_eq!(titles, vec!["Un", "Deux", "Trois"]);

        let metadata = merged.metadata();
        assert_eq!(metadata.title, "Tome_1");
        assert_eq!(
            metadata.creators.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            vec!["A", "B"]
        );
        assert_eq!(metadata.description.as_deref(), Some("d"));
        assert_eq!(metadata.subjects, vec!["Fantasy"]);
        assert_eq!(metadata.collections[0].number.as_deref(), Some("1"));
        assert_eq!(metadata.lang.as_deref(), Some("en"));
        assert_eq!(metadata.rights.as_deref(), Some(""));
        assert!(merged.cover().is_some());
        Ok(())
    }

    #[test]
    fn merge_replaces_previous_volume() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let folder = root.path().join("Bar");
        fs::create_dir_all(&folder)?;
        write(&folder, "1.epub", &chapter("Un", "2.1", "A", "d"))?;
        VolumeMerger.merge_folder(&folder)?;

        write(&folder, "2.epub", &chapter("Deux", "2.2", "A", "d"))?;
        let out = VolumeMerger.merge_folder(&folder)?.unwrap();
        assert_eq!(Book::read(&out)?.pages().len(), 2);
        Ok(())
    }

    #[test]
    fn reserved_folder_names_fall_back() {
        let books = vec![chapter("Un", "1.1", "A", "")];
        let meta = reconcile_metadata(Path::new("/out/Novel/Chapitres"), &books);
        assert_eq!(meta.title, "The Novel");

        let meta = reconcile_metadata(Path::new("/out/Novel/Volumes"), &[]);
        assert_eq!(meta.title, "Novel");

        let meta = reconcile_metadata(Path::new("/out/Novel/Tome 2"), &books);
        assert_eq!(meta.title, "Tome 2");
    }

    #[test]
    fn descriptions_are_deduplicated_and_joined() {
        let books = vec![
            chapter("Un", "1.1", "A", "first"),
            chapter("Deux", "1.2", "A", "second"),
            chapter("Trois", "1.3", "A", "first"),
        ];
        let meta = reconcile_metadata(Path::new("/out/N/V"), &books);
        assert_eq!(meta.description.as_deref(), Some("first\n\nsecond"));
        assert_eq!(meta.creators.len(), 1);
    }

    #[test]
    fn empty_folder_is_a_no_op() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        assert_eq!(VolumeMerger.merge_folder(root.path())?, None);
        Ok(())
    }

    #[test]
    fn merge_tree_visits_leaf_folders() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        for volume in ["Tome_1", "Tome_2"] {
            let folder = root.path().join("Novel").join(volume);
            fs::create_dir_all(&folder)?;
            write(&folder, "c.epub", &chapter("Un", "1.1", "A", ""))?;
        }
        let written = VolumeMerger.merge_tree(root.path())?;
        assert_eq!(
            written,
            vec![
                root.path().join("Novel").join("Tome_1.epub"),
                root.path().join("Novel").join("Tome_2.epub"),
            ]
        );
        Ok(())
    }
}
