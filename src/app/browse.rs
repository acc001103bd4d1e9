//! Read-only view of the output root: directory listings and raw files.

use std::path::{Component, Path as FsPath, PathBuf};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use chrono::{DateTime, Local};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use tokio_util::io::ReaderStream;

use crate::app::server::AppState;
use crate::epub::xml_escape;

const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    name: String,
    is_dir: bool,
    size: Option<String>,
    modified: String,
}

pub async fn browse_root(State(state): State<AppState>, method: Method) -> Response {
    browse(&state, method, "").await
}

pub async fn browse_path(
    State(state): State<AppState>,
    method: Method,
    Path(path): Path<String>,
) -> Response {
    browse(&state, method, &path).await
}

async fn browse(state: &AppState, method: Method, rel: &str) -> Response {
    let Some(target) = resolve(state.controller.root(), rel) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(meta) = tokio::fs::metadata(&target).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if meta.is_file() {
        if method != Method::GET {
            return StatusCode::FOUND.into_response();
        }
        return match serve_file(&target).await {
            Ok(resp) => resp,
            Err(status) => status.into_response(),
        };
    }

    if method != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    match list_dir(&target).await {
        Ok(entries) => Html(render_listing(rel, &entries)).into_response(),
        Err(err) => {
            tracing::warn!(path = %target.display(), ?err, "list dir failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Joins `rel` under `root`, refusing anything but plain names.
fn resolve(root: &FsPath, rel: &str) -> Option<PathBuf> {
    let mut out = root.to_path_buf();
    for segment in rel.split('/').filter(|s| !s.is_empty()) {
        let mut components = FsPath::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => out.push(name),
            _ => return None,
        }
    }
    Some(out)
}

async fn serve_file(path: &FsPath) -> Result<Response, StatusCode> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut resp = Response::new(body);
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(path)),
    );
    Ok(resp)
}

fn content_type_for(path: &FsPath) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "epub" => "application/epub+zip",
        "html" | "htm" => "text/html; charset=utf-8",
        "json" => "application/json",
        "css" => "text/css; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

async fn list_dir(dir: &FsPath) -> std::io::Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let meta = entry.metadata().await?;
        let modified = meta
            .modified()
            .map(|t| DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        entries.push(Entry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: meta.is_dir(),
            size: human_size(meta.len()),
            modified,
        });
    }
    entries.sort_by(|a, b| natord::compare(&a.name, &b.name));
    Ok(entries)
}

fn href_for(segments: &[&str]) -> String {
    let mut href = String::new();
    for segment in segments {
        href.push('/');
        href.extend(utf8_percent_encode(segment, PATH_SEGMENT));
    }
    if href.is_empty() {
        href.push('/');
    }
    href
}

fn render_listing(rel: &str, entries: &[Entry]) -> String {
    let segments = rel.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>();
    let title = format!("/{}", segments.join("/"));

    let mut out = String::new();
    out.push_str("<!doctype html>\n<html>\n<head>\n  <meta charset=\"utf-8\">\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(&title)));
    out.push_str("</head>\n<body>\n");
    out.push_str(&format!("  <h1>{}</h1>\n", xml_escape(&title)));
    if !segments.is_empty() {
        let parent = href_for(&segments[..segments.len() - 1]);
        out.push_str(&format!("  <p><a href=\"{}\">..</a></p>\n", xml_escape(&parent)));
    }
    out.push_str("  <table>\n");
    out.push_str("    <tr><th>Name</th><th>Size</th><th>Modified</th></tr>\n");
    for entry in entries {
        let mut path = segments.clone();
        path.push(&entry.name);
        let label = if entry.is_dir {
            format!("{}/", entry.name)
        } else {
            entry.name.clone()
        };
        out.push_str(&format!(
            "    <tr><td><a href=\"{}\">{}</a></td><td>{}</td><td>{}</td></tr>\n",
            xml_escape(&href_for(&path)),
            xml_escape(&label),
            if entry.is_dir {
                String::new()
            } else {
                entry.size.clone().unwrap_or_default()
            },
            xml_escape(&entry.modified)
        ));
    }
    out.push_str("  </table>\n</body>\n</html>\n");
    out
}

/// Binary-unit size with up to two decimals; `None` for empty files.
fn human_size(bytes: u64) -> Option<String> {
    const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];
    if bytes == 0 {
        return None;
    }
    let mut unit = 0;
    let mut value = bytes as f64;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = (value * 100.0).round() / 100.0;
    let number = if rounded.fract() == 0.0 {
        format!("{rounded:.1}")
    } else {
        format!("{rounded}")
    };
    Some(format!("{number} {}", UNITS[unit]))
}
