use std::io::Cursor;
use std::sync::{Arc, LazyLock};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use crate::deobfuscate::escape_attr;
use crate::epub::Book;
use crate::error::PipelineError;
use crate::fetch::Upstream;

static IMAGE_DATA_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^data:(image/[\w.+-]+)?;base64,(.*)$").expect("valid data url regex")
});

pub fn is_remote_url(value: &str) -> bool {
    Url::parse(value.trim()).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
}

pub fn is_image_data_url(value: &str) -> bool {
    IMAGE_DATA_URL.is_match(value.trim())
}

/// Bytes carried by a `data:image/...;base64,` URL.
pub fn decode_data_url(data_url: &str) -> Result<Vec<u8>, PipelineError> {
    let captures = IMAGE_DATA_URL
        .captures(data_url.trim())
        .ok_or_else(|| PipelineError::image("data url", "expected data:image/<type>;base64,<data>"))?;
    let payload = captures[2]
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>();
    BASE64_STANDARD
        .decode(payload)
        .map_err(|err| PipelineError::image("data url", format!("invalid base64: {err}")))
}

/// Decodes any supported raster format and re-encodes it as PNG.
pub fn normalize_to_png(bytes: &[u8], source_ref: &str) -> Result<Vec<u8>, PipelineError> {
    let decoded =
        image::load_from_memory(bytes).map_err(|err| PipelineError::image(source_ref, err))?;
    let mut out = Cursor::new(Vec::new());
    decoded
        .write_to(&mut out, image::ImageFormat::Png)
        .map_err(|err| PipelineError::image(source_ref, err))?;
    Ok(out.into_inner())
}

async fn png_off_runtime(bytes: Vec<u8>, source_ref: &str) -> Result<Vec<u8>, PipelineError> {
    let owned_ref = source_ref.to_string();
    tokio::task::spawn_blocking(move || normalize_to_png(&bytes, &owned_ref))
        .await
        .map_err(|err| PipelineError::image(source_ref, err))?
}

/// Replaces remote `<img>` sources with embedded PNG data URLs.
pub struct ImageInliner {
    upstream: Arc<dyn Upstream>,
}

impl ImageInliner {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self { upstream }
    }

    pub async fn inline(&self, html: &str) -> Result<String, PipelineError> {
        let mut out = html.to_string();
        for src in remote_image_sources(html) {
            let bytes = self
                .upstream
                .fetch_bytes(&src)
                .await
                .map_err(|err| PipelineError::image(src.as_str(), err))?;
            let png = png_off_runtime(bytes, &src).await?;
            tracing::debug!(src = %src, bytes = png.len(), "inline image");

            let mut original = String::from("src=\"");
            escape_attr(&src, &mut original);
            original.push('"');
            let embedded = format!("src=\"data:image/png;base64,{}\"", BASE64_STANDARD.encode(&png));
            out = out.replace(&original, &embedded);
        }
        Ok(out)
    }
}

// Parsed documents are not `Send`; keep them out of async bodies.
fn remote_image_sources(html: &str) -> Vec<String> {
    static IMG_SRC: LazyLock<Selector> =
        LazyLock::new(|| Selector::parse("img[src]").expect("valid img selector"));

    let fragment = Html::parse_fragment(html);
    let mut sources: Vec<String> = Vec::new();
    for src in fragment
        .select(&IMG_SRC)
        .filter_map(|img| img.value().attr("src"))
        .filter(|src| is_remote_url(src))
    {
        if !sources.iter().any(|seen| seen == src) {
            sources.push(src.to_string());
        }
    }
    sources
}

/// Cover image of a book, resolved once per job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverSource {
    Image(Vec<u8>),
    Generated,
}

impl CoverSource {
    pub fn apply(&self, book: &mut Book) {
        match self {
            Self::Image(bytes) => book.set_cover(bytes.clone()),
            Self::Generated => book.generate_cover(),
        }
    }
}

/// Remote URL: fetched and checked to decode. Data URL: decoded. Anything
/// else: a cover is generated from the title.
pub async fn resolve_cover(
    cover: Option<&str>,
    upstream: &dyn Upstream,
) -> Result<CoverSource, PipelineError> {
    let Some(cover) = cover.map(str::trim).filter(|c| !c.is_empty()) else {
        return Ok(CoverSource::Generated);
    };
    if is_remote_url(cover) {
        let bytes = upstream
            .fetch_bytes(cover)
            .await
            .map_err(|err| PipelineError::image(cover, err))?;
        let bytes = tokio::task::spawn_blocking(move || {
            image::load_from_memory(&bytes).map(|_| bytes)
        })
        .await
        .map_err(|err| PipelineError::image(cover, err))?
        .map_err(|err| PipelineError::image(cover, err))?;
        return Ok(CoverSource::Image(bytes));
    }
    if is_image_data_url(cover) {
        return decode_data_url(cover).map(CoverSource::Image);
    }
    Ok(CoverSource::Generated)
}
