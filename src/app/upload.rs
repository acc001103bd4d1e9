//! `POST /`: builds one chapter book from an uploaded page.

use std::path::PathBuf;

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::app::server::{AppState, error_response};
use crate::chapter::{SaveOutcome, collection_number_with_width, integer_part, zfill_width};
use crate::epub::Book;
use crate::error::PipelineError;
use crate::images::resolve_cover;
use crate::model::UploadMetadata;
use crate::paths::{book_file_stem, chapter_book_path, secure_filename};

const CHAPTER_PART: &str = "chapter.html";
const METADATA_PART: &str = "metadata.json";
const DEFAULT_NUMBER_WIDTH: usize = 3;

struct Part {
    file_name: String,
    content_type: Option<String>,
    data: Vec<u8>,
}

pub async fn build_from_upload(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut parts = Vec::new();
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                let file_name = field
                    .file_name()
                    .or_else(|| field.name())
                    .unwrap_or_default()
                    .to_string();
                let content_type = field.content_type().map(str::to_string);
                match field.bytes().await {
                    Ok(data) => parts.push(Part {
                        file_name,
                        content_type,
                        data: data.to_vec(),
                    }),
                    Err(err) => return (StatusCode::BAD_REQUEST, err.body_text()).into_response(),
                }
            }
            Ok(None) => break,
            Err(err) => return (StatusCode::BAD_REQUEST, err.body_text()).into_response(),
        }
    }

    let html_parts = parts
        .iter()
        .filter(|p| p.file_name == CHAPTER_PART)
        .collect::<Vec<_>>();
    let json_parts = parts
        .iter()
        .filter(|p| p.file_name == METADATA_PART)
        .collect::<Vec<_>>();
    let [html_part] = html_parts.as_slice() else {
        return missing_parts();
    };
    let [json_part] = json_parts.as_slice() else {
        return missing_parts();
    };

    if !has_content_type(html_part, "text/html") || !has_content_type(json_part, "application/json")
    {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }
    let Ok(metadata) = serde_json::from_slice::<UploadMetadata>(&json_part.data) else {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    };

    let image_parts = parts
        .iter()
        .filter(|p| p.file_name.to_ascii_lowercase().ends_with(".png"))
        .collect::<Vec<_>>();
    if !image_parts.iter().all(|p| has_content_type(p, "image/png")) {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }
    let images = image_parts
        .into_iter()
        .map(|p| (p.file_name.clone(), p.data.clone()))
        .collect::<Vec<_>>();
    let html = String::from_utf8_lossy(&html_part.data).into_owned();

    match save_upload(&state, metadata, html, images).await {
        Ok(SaveOutcome::Written(path)) => {
            tracing::info!(path = %path.display(), "uploaded chapter saved");
            StatusCode::ACCEPTED.into_response()
        }
        Ok(SaveOutcome::AlreadyExists(_)) => StatusCode::ALREADY_REPORTED.into_response(),
        Err(err) => error_response(&err),
    }
}

fn missing_parts() -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        format!("Can't process files without exactly one '{CHAPTER_PART}' and one '{METADATA_PART}'"),
    )
        .into_response()
}

fn has_content_type(part: &Part, expected: &str) -> bool {
    part.content_type
        .as_deref()
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|ct| ct.trim().eq_ignore_ascii_case(expected))
}

/// `<root>[/<collection>][/<volume name>]`.
fn upload_dir(state: &AppState, metadata: &UploadMetadata) -> PathBuf {
    let mut dir = state.controller.root().to_path_buf();
    if let Some(collection) = metadata.book.collections.first() {
        let name = secure_filename(&collection.name);
        if !name.is_empty() {
            dir.push(name);
        }
    }
    if let Some(volume) = metadata.volume_name.as_deref() {
        let name = secure_filename(volume);
        if !name.is_empty() {
            dir.push(name);
        }
    }
    dir
}

async fn save_upload(
    state: &AppState,
    mut metadata: UploadMetadata,
    html: String,
    images: Vec<(String, Vec<u8>)>,
) -> anyhow::Result<SaveOutcome> {
    let controller = &state.controller;
    let folder = upload_dir(state, &metadata);
    let stem = book_file_stem(&metadata.book.title);
    let path = chapter_book_path(&folder, &stem);
    if path.exists() {
        return Ok(SaveOutcome::AlreadyExists(path));
    }

    let builder = controller.builder();
    let width = metadata
        .chapter_count
        .map(zfill_width)
        .unwrap_or(DEFAULT_NUMBER_WIDTH);
    let title = metadata.book.title.clone();
    if let Some(collection) = metadata.book.collections.first_mut() {
        let renumbered = collection
            .number
            .as_deref()
            .zip(builder.numbering().chapter_index(&title))
            .map(|(number, index)| {
                collection_number_with_width(integer_part(number), index, width)
            });
        if renumbered.is_some() {
            collection.number = renumbered;
        }
    }

    let cover = resolve_cover(metadata.cover.as_deref(), controller.upstream())
        .await
        .map_err(|err| PipelineError::Validation(format!("cover: {err}")))?;

    let mut book = Book::new(metadata.book);
    cover.apply(&mut book);
    book.add_page(title, html);
    for (name, data) in images {
        book.add_image(&name, data);
    }

    tokio::fs::create_dir_all(&folder)
        .await
        .map_err(PipelineError::from)?;
    builder.save(book, &folder, &stem).await
}
