use std::path::Path;

use novelpress::epub::{Book, SaveOptions};
use novelpress::model::{BookMetadata, Collection};
use predicates::prelude::*;

fn write_chapter(folder: &Path, stem: &str, title: &str, number: &str) {
    let mut book = Book::new(BookMetadata {
        title: title.to_string(),
        collections: vec![Collection {
            name: "Foo".to_string(),
            id: None,
            number: Some(number.to_string()),
            kind: None,
        }],
        ..BookMetadata::default()
    });
    book.add_page(title.to_string(), format!("<p>{title}</p>"));
    book.save(
        &folder.join(format!("{stem}.epub")),
        SaveOptions {
            visible_toc: false,
            cover_as_first_page: false,
            force: false,
        },
    )
    .expect("save chapter");
}

#[test]
fn merge_writes_one_book_per_leaf_directory() {
    let root = tempfile::tempdir().expect("tempdir");
    let folder = root.path().join("Foo").join("Tome 1");
    std::fs::create_dir_all(&folder).expect("mkdir");
    write_chapter(&folder, "c-10", "Chapitre 10", "1.10");
    write_chapter(&folder, "c-2", "Chapitre 2", "1.02");

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("novelpress");
    cmd.args(["merge"])
        .arg(root.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Tome 1.epub"));

    let merged = Book::read(&root.path().join("Foo").join("Tome 1.epub")).expect("read merged");
    let titles = merged
        .pages()
        .iter()
        .map(|p| p.title.as_str())
        .collect::<Vec<_>>();
    assert_eq!(titles, vec!["Chapitre 2", "Chapitre 10"]);
    assert_eq!(merged.metadata().collections[0].number.as_deref(), Some("1"));
}

#[test]
fn merge_of_missing_directory_fails() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("novelpress");
    cmd.args(["merge"])
        .arg(root.path().join("nope"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("merge"));
}

#[test]
fn rust_log_debug_emits_parsed_cli() {
    let root = tempfile::tempdir().expect("tempdir");
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("novelpress");
    cmd.env("RUST_LOG", "debug")
        .args(["merge"])
        .arg(root.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("parsed cli"));
}
