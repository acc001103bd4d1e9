//! Single-file EPUB 3 books: build, save, read back and merge.
//!
//! Every saved book carries `META-INF/novelpress.json`, which lists the
//! metadata, pages, images, cover and stylesheet, so [`Book::read`] restores
//! exactly what [`Book::save`] wrote.

use std::fs::{self, File, OpenOptions};
use std::io::{Read as _, Write as _};
use std::path::Path;

use anyhow::Context as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use zip::write::SimpleFileOptions;

use crate::model::BookMetadata;

const MANIFEST_PATH: &str = "META-INF/novelpress.json";
const DEFAULT_LANG_TAG: &str = "und";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub title: String,
    /// XHTML body fragment.
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAsset {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cover {
    pub data: Vec<u8>,
    pub media_type: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    /// Put the navigation document in the reading order.
    pub visible_toc: bool,
    /// Open the book on a page showing the cover.
    pub cover_as_first_page: bool,
    /// Replace an existing file instead of failing.
    pub force: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Book {
    metadata: BookMetadata,
    pages: Vec<Page>,
    images: Vec<ImageAsset>,
    cover: Option<Cover>,
    stylesheet: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BookManifest {
    metadata: BookMetadata,
    pages: Vec<ManifestPage>,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    cover: Option<ManifestCover>,
    #[serde(default)]
    stylesheet: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestPage {
    title: String,
    href: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestCover {
    href: String,
    media_type: String,
}

impl Book {
    pub fn new(metadata: BookMetadata) -> Self {
        Self {
            metadata,
            ..Self::default()
        }
    }

    pub fn metadata(&self) -> &BookMetadata {
        &self.metadata
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn images(&self) -> &[ImageAsset] {
        &self.images
    }

    pub fn stylesheet(&self) -> Option<&str> {
        self.stylesheet.as_deref()
    }

    pub fn add_page(&mut self, title: impl Into<String>, html: impl Into<String>) {
        self.pages.push(Page {
            title: title.into(),
            html: html.into(),
        });
    }

    /// Adds an image reachable from pages as `images/<name>`.
    pub fn add_image(&mut self, name: &str, data: Vec<u8>) {
        let name = name.replace(['/', '\\'], "_");
        self.images.retain(|img| img.name != name);
        self.images.push(ImageAsset { name, data });
    }

    pub fn set_cover(&mut self, data: Vec<u8>) {
        let (media_type, _) = sniff_image_type(&data);
        self.cover = Some(Cover {
            data,
            media_type: media_type.to_string(),
        });
    }

    /// Replaces the cover with an SVG showing the title and first creator.
    pub fn generate_cover(&mut self) {
        let author = self
            .metadata
            .creators
            .first()
            .map(|c| c.name.as_str())
            .unwrap_or_default();
        let svg = render_generated_cover(&self.metadata.title, author);
        self.cover = Some(Cover {
            data: svg.into_bytes(),
            media_type: "image/svg+xml".to_string(),
        });
    }

    pub fn cover(&self) -> Option<&Cover> {
        self.cover.as_ref()
    }

    pub fn add_stylesheet(&mut self, css: &str) {
        match &mut self.stylesheet {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(css);
            }
            None => self.stylesheet = Some(css.to_string()),
        }
    }

    /// Concatenates the pages of `books` in order under new metadata.
    ///
    /// Images are renamed per source book so identical names from different
    /// chapters cannot collide; page references are rewritten to match.
    pub fn merge(metadata: BookMetadata, books: &[Book]) -> Book {
        let mut merged = Book::new(metadata);
        for (idx, book) in books.iter().enumerate() {
            let prefix = format!("{:03}-", idx + 1);
            for page in &book.pages {
                let mut html = page.html.clone();
                for image in &book.images {
                    html = html.replace(
                        &format!("images/{}", image.name),
                        &format!("images/{prefix}{}", image.name),
                    );
                }
                merged.add_page(page.title.clone(), html);
            }
            for image in &book.images {
                merged.add_image(&format!("{prefix}{}", image.name), image.data.clone());
            }
            if merged.stylesheet.is_none() {
                merged.stylesheet = book.stylesheet.clone();
            }
        }
        merged
    }

    pub fn read(path: &Path) -> anyhow::Result<Book> {
        let file = File::open(path).with_context(|| format!("open book: {}", path.display()))?;
        let mut zip = zip::ZipArchive::new(file)
            .with_context(|| format!("read book archive: {}", path.display()))?;

        let manifest: BookManifest = {
            let entry = zip
                .by_name(MANIFEST_PATH)
                .with_context(|| format!("book manifest missing: {}", path.display()))?;
            serde_json::from_reader(entry).context("parse book manifest")?
        };

        let mut pages = Vec::with_capacity(manifest.pages.len());
        for page in manifest.pages {
            let xhtml = read_entry_to_string(&mut zip, &format!("OEBPS/{}", page.href))?;
            pages.push(Page {
                title: page.title,
                html: extract_body(&xhtml).to_string(),
            });
        }

        let mut images = Vec::with_capacity(manifest.images.len());
        for name in manifest.images {
            let data = read_entry_to_vec(&mut zip, &format!("OEBPS/images/{name}"))?;
            images.push(ImageAsset { name, data });
        }

        let cover = match manifest.cover {
            Some(cover) => Some(Cover {
                data: read_entry_to_vec(&mut zip, &format!("OEBPS/{}", cover.href))?,
                media_type: cover.media_type,
            }),
            None => None,
        };

        Ok(Book {
            metadata: manifest.metadata,
            pages,
            images,
            cover,
            stylesheet: manifest.stylesheet,
        })
    }

    pub fn save(&self, out_path: &Path, options: SaveOptions) -> anyhow::Result<()> {
        if out_path.exists() && !options.force {
            anyhow::bail!("epub output already exists: {}", out_path.display());
        }
        if let Some(parent) = out_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create epub parent dir: {}", parent.display()))?;
        }

        let lang = self
            .metadata
            .lang
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(DEFAULT_LANG_TAG);
        let title = if self.metadata.title.trim().is_empty() {
            "Book"
        } else {
            self.metadata.title.as_str()
        };

        let layout = Layout::new(self, options);
        let uuid = uuid::Uuid::new_v4();
        let modified = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        let mut css = default_style_css();
        if let Some(extra) = &self.stylesheet {
            css.push('\n');
            css.push_str(extra);
        }

        let mut out_options = OpenOptions::new();
        out_options.write(true);
        if options.force {
            out_options.create(true).truncate(true);
        } else {
            out_options.create_new(true);
        }
        let out_file = out_options
            .open(out_path)
            .with_context(|| format!("open epub output: {}", out_path.display()))?;

        let mut zip = zip::ZipWriter::new(out_file);

        // `mimetype` must be the first entry and stored uncompressed.
        let mimetype_options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .unix_permissions(0o644);
        zip.start_file("mimetype", mimetype_options)
            .context("epub start_file mimetype")?;
        zip.write_all(b"application/epub+zip")
            .context("epub write mimetype")?;

        let deflated = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(0o644);

        let mut write_entry = |name: &str, bytes: &[u8]| -> anyhow::Result<()> {
            zip.start_file(name, deflated)
                .with_context(|| format!("epub start_file {name}"))?;
            zip.write_all(bytes)
                .with_context(|| format!("epub write {name}"))?;
            Ok(())
        };

        write_entry("META-INF/container.xml", render_container_xml().as_bytes())?;
        write_entry(
            "OEBPS/content.opf",
            render_content_opf(&self.metadata, title, lang, uuid, &modified, &layout).as_bytes(),
        )?;
        write_entry(
            "OEBPS/nav.xhtml",
            render_nav_xhtml(title, lang, &layout.pages).as_bytes(),
        )?;
        write_entry(
            "OEBPS/toc.ncx",
            render_toc_ncx(title, uuid, &layout.pages).as_bytes(),
        )?;
        write_entry("OEBPS/style.css", css.as_bytes())?;

        if let (Some(cover), Some(entry)) = (&self.cover, &layout.cover) {
            write_entry(&format!("OEBPS/{}", entry.href), &cover.data)?;
            if entry.page {
                write_entry(
                    "OEBPS/cover.xhtml",
                    wrap_xhtml_document(
                        title,
                        lang,
                        &format!(
                            "<div class=\"cover\"><img src=\"{}\" alt=\"cover\" /></div>",
                            xml_escape(&entry.href)
                        ),
                    )
                    .as_bytes(),
                )?;
            }
        }

        for (page, entry) in self.pages.iter().zip(&layout.pages) {
            let html = ensure_xhtml_void_tags(&xhtml_entities(&page.html));
            let xhtml = wrap_xhtml_document(&page.title, lang, &html);
            write_entry(&format!("OEBPS/{}", entry.href), xhtml.as_bytes())?;
        }

        for image in &self.images {
            write_entry(&format!("OEBPS/images/{}", image.name), &image.data)?;
        }

        let manifest = BookManifest {
            metadata: self.metadata.clone(),
            pages: layout
                .pages
                .iter()
                .map(|p| ManifestPage {
                    title: p.title.clone(),
                    href: p.href.clone(),
                })
                .collect(),
            images: self.images.iter().map(|img| img.name.clone()).collect(),
            cover: match (&self.cover, &layout.cover) {
                (Some(cover), Some(entry)) => Some(ManifestCover {
                    href: entry.href.clone(),
                    media_type: cover.media_type.clone(),
                }),
                _ => None,
            },
            stylesheet: self.stylesheet.clone(),
        };
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("serialize book manifest")?;
        write_entry(MANIFEST_PATH, &manifest_json)?;

        zip.finish().context("epub finish zip")?;
        Ok(())
    }
}

/// File names and reading order of one saved book.
struct Layout {
    pages: Vec<PageEntry>,
    cover: Option<CoverEntry>,
    image_names: Vec<String>,
    visible_toc: bool,
}

struct PageEntry {
    id: String,
    href: String,
    title: String,
}

struct CoverEntry {
    href: String,
    media_type: String,
    page: bool,
}

impl Layout {
    fn new(book: &Book, options: SaveOptions) -> Self {
        let pages = book
            .pages
            .iter()
            .enumerate()
            .map(|(idx, page)| PageEntry {
                id: format!("page-{:04}", idx + 1),
                href: format!("page-{:04}.xhtml", idx + 1),
                title: page.title.clone(),
            })
            .collect();
        let cover = book.cover.as_ref().map(|cover| CoverEntry {
            href: format!("images/cover.{}", extension_for_media_type(&cover.media_type)),
            media_type: cover.media_type.clone(),
            page: options.cover_as_first_page,
        });
        Self {
            pages,
            cover,
            image_names: book.images.iter().map(|img| img.name.clone()).collect(),
            visible_toc: options.visible_toc,
        }
    }
}

fn read_entry_to_vec(zip: &mut zip::ZipArchive<File>, name: &str) -> anyhow::Result<Vec<u8>> {
    let mut entry = zip
        .by_name(name)
        .with_context(|| format!("book entry missing: {name}"))?;
    let mut buf = Vec::new();
    entry
        .read_to_end(&mut buf)
        .with_context(|| format!("read book entry: {name}"))?;
    Ok(buf)
}

fn read_entry_to_string(zip: &mut zip::ZipArchive<File>, name: &str) -> anyhow::Result<String> {
    let bytes = read_entry_to_vec(zip, name)?;
    String::from_utf8(bytes).with_context(|| format!("book entry is not utf-8: {name}"))
}

fn extract_body(xhtml: &str) -> &str {
    let Some(start) = xhtml.find("<body>") else {
        return xhtml;
    };
    let start = start + "<body>".len();
    let end = xhtml[start..]
        .rfind("</body>")
        .map(|rel| start + rel)
        .unwrap_or(xhtml.len());
    let body = &xhtml[start..end];
    body.strip_prefix('\n').unwrap_or(body).trim_end_matches('\n')
}

/// Media type and file extension of an encoded image.
pub fn sniff_image_type(data: &[u8]) -> (&'static str, &'static str) {
    match image::guess_format(data) {
        Ok(image::ImageFormat::Png) => ("image/png", "png"),
        Ok(image::ImageFormat::Jpeg) => ("image/jpeg", "jpg"),
        Ok(image::ImageFormat::Gif) => ("image/gif", "gif"),
        Ok(image::ImageFormat::WebP) => ("image/webp", "webp"),
        _ => {
            let head = String::from_utf8_lossy(&data[..data.len().min(256)]);
            if head.contains("<svg") {
                ("image/svg+xml", "svg")
            } else {
                ("application/octet-stream", "bin")
            }
        }
    }
}

fn extension_for_media_type(media_type: &str) -> &'static str {
    match media_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        _ => "bin",
    }
}

fn media_type_for_asset(rel_path: &str) -> &'static str {
    let ext = Path::new(rel_path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

fn render_generated_cover(title: &str, author: &str) -> String {
    format!(
        r##"<?xml version="1.0" encoding="utf-8"?>
<svg xmlns="http://www.w3.org/2000/svg" width="600" height="800" viewBox="0 0 600 800">
  <rect width="600" height="800" fill="#2d3142"/>
  <rect x="30" y="30" width="540" height="740" fill="none" stroke="#bfc0c0" stroke-width="4"/>
  <text x="300" y="360" font-family="serif" font-size="40" fill="#ffffff" text-anchor="middle">{}</text>
  <text x="300" y="440" font-family="serif" font-size="26" fill="#bfc0c0" text-anchor="middle">{}</text>
</svg>
"##,
        xml_escape(title),
        xml_escape(author)
    )
}

fn render_container_xml() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#
    .to_string()
}

fn default_style_css() -> String {
    r#"@charset "utf-8";

html { font-family: serif; }
body { margin: 0; padding: 0 1.2em; line-height: 1.6; }
img { max-width: 100%; height: auto; }
.cover { text-align: center; }
.cover img { max-height: 100%; }
"#
    .to_string()
}

fn render_nav_xhtml(title: &str, lang: &str, pages: &[PageEntry]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str(&format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\" lang=\"{}\" xml:lang=\"{}\">\n",
        xml_escape(lang),
        xml_escape(lang)
    ));
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(title)));
    out.push_str("  <meta charset=\"utf-8\" />\n");
    out.push_str("  <link rel=\"stylesheet\" type=\"text/css\" href=\"style.css\" />\n");
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str(&format!("  <h1>{}</h1>\n", xml_escape(title)));
    out.push_str("  <nav epub:type=\"toc\" id=\"toc\">\n");
    out.push_str("    <ol>\n");
    for page in pages {
        out.push_str(&format!(
            "      <li><a href=\"{}\">{}</a></li>\n",
            xml_escape(&page.href),
            xml_escape(&page.title)
        ));
    }
    out.push_str("    </ol>\n");
    out.push_str("  </nav>\n");
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

fn render_toc_ncx(title: &str, uuid: uuid::Uuid, pages: &[PageEntry]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(
        "<!DOCTYPE ncx PUBLIC \"-//NISO//DTD ncx 2005-1//EN\" \"http://www.daisy.org/z3986/2005/ncx-2005-1.dtd\">\n",
    );
    out.push_str("<ncx xmlns=\"http://www.daisy.org/z3986/2005/ncx/\" version=\"2005-1\">\n");
    out.push_str("  <head>\n");
    out.push_str(&format!(
        "    <meta name=\"dtb:uid\" content=\"urn:uuid:{uuid}\" />\n"
    ));
    out.push_str("    <meta name=\"dtb:depth\" content=\"1\" />\n");
    out.push_str("    <meta name=\"dtb:totalPageCount\" content=\"0\" />\n");
    out.push_str("    <meta name=\"dtb:maxPageNumber\" content=\"0\" />\n");
    out.push_str("  </head>\n");
    out.push_str("  <docTitle><text>");
    out.push_str(&xml_escape(title));
    out.push_str("</text></docTitle>\n");
    out.push_str("  <navMap>\n");
    for (idx, page) in pages.iter().enumerate() {
        let play = idx + 1;
        out.push_str(&format!(
            "    <navPoint id=\"navPoint-{play}\" playOrder=\"{play}\">\n"
        ));
        out.push_str("      <navLabel><text>");
        out.push_str(&xml_escape(&page.title));
        out.push_str("</text></navLabel>\n");
        out.push_str(&format!(
            "      <content src=\"{}\" />\n",
            xml_escape(&page.href)
        ));
        out.push_str("    </navPoint>\n");
    }
    out.push_str("  </navMap>\n");
    out.push_str("</ncx>\n");
    out
}

fn render_content_opf(
    metadata: &BookMetadata,
    title: &str,
    lang: &str,
    uuid: uuid::Uuid,
    modified: &str,
    layout: &Layout,
) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(&format!(
        "<package xmlns=\"http://www.idpf.org/2007/opf\" unique-identifier=\"bookid\" version=\"3.0\" xml:lang=\"{}\">\n",
        xml_escape(lang)
    ));
    out.push_str("  <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\n");
    out.push_str(&format!(
        "    <dc:identifier id=\"bookid\">urn:uuid:{uuid}</dc:identifier>\n"
    ));
    out.push_str(&format!("    <dc:title>{}</dc:title>\n", xml_escape(title)));
    out.push_str(&format!(
        "    <dc:language>{}</dc:language>\n",
        xml_escape(lang)
    ));

    for (tag, prefix, people) in [
        ("dc:creator", "creator", &metadata.creators),
        ("dc:contributor", "contributor", &metadata.contributors),
    ] {
        for (idx, person) in people.iter().enumerate() {
            let id = format!("{prefix}-{}", idx + 1);
            out.push_str(&format!(
                "    <{tag} id=\"{id}\">{}</{tag}>\n",
                xml_escape(&person.name)
            ));
            if let Some(role) = &person.role {
                out.push_str(&format!(
                    "    <meta refines=\"#{id}\" property=\"role\" scheme=\"marc:relators\">{}</meta>\n",
                    xml_escape(role)
                ));
            }
        }
    }

    if let Some(description) = metadata.description.as_deref().filter(|d| !d.is_empty()) {
        out.push_str(&format!(
            "    <dc:description>{}</dc:description>\n",
            xml_escape(description)
        ));
    }
    if let Some(rights) = metadata.rights.as_deref().filter(|r| !r.is_empty()) {
        out.push_str(&format!("    <dc:rights>{}</dc:rights>\n", xml_escape(rights)));
    }
    for subject in &metadata.subjects {
        out.push_str(&format!(
            "    <dc:subject>{}</dc:subject>\n",
            xml_escape(subject)
        ));
    }
    for (idx, collection) in metadata.collections.iter().enumerate() {
        let id = format!("collection-{}", idx + 1);
        out.push_str(&format!(
            "    <meta property=\"belongs-to-collection\" id=\"{id}\">{}</meta>\n",
            xml_escape(&collection.name)
        ));
        if let Some(kind) = &collection.kind {
            out.push_str(&format!(
                "    <meta refines=\"#{id}\" property=\"collection-type\">{}</meta>\n",
                xml_escape(kind)
            ));
        }
        if let Some(number) = &collection.number {
            out.push_str(&format!(
                "    <meta refines=\"#{id}\" property=\"group-position\">{}</meta>\n",
                xml_escape(number)
            ));
        }
    }
    if layout.cover.is_some() {
        out.push_str("    <meta name=\"cover\" content=\"cover-image\" />\n");
    }
    out.push_str(&format!(
        "    <meta property=\"dcterms:modified\">{}</meta>\n",
        xml_escape(modified)
    ));
    out.push_str("  </metadata>\n");

    out.push_str("  <manifest>\n");
    out.push_str(
        "    <item id=\"nav\" href=\"nav.xhtml\" media-type=\"application/xhtml+xml\" properties=\"nav\" />\n",
    );
    out.push_str(
        "    <item id=\"ncx\" href=\"toc.ncx\" media-type=\"application/x-dtbncx+xml\" />\n",
    );
    out.push_str("    <item id=\"css\" href=\"style.css\" media-type=\"text/css\" />\n");
    if let Some(cover) = &layout.cover {
        out.push_str(&format!(
            "    <item id=\"cover-image\" href=\"{}\" media-type=\"{}\" properties=\"cover-image\" />\n",
            xml_escape(&cover.href),
            xml_escape(&cover.media_type)
        ));
        if cover.page {
            out.push_str(
                "    <item id=\"cover\" href=\"cover.xhtml\" media-type=\"application/xhtml+xml\" />\n",
            );
        }
    }
    for page in &layout.pages {
        out.push_str(&format!(
            "    <item id=\"{}\" href=\"{}\" media-type=\"application/xhtml+xml\" />\n",
            xml_escape(&page.id),
            xml_escape(&page.href)
        ));
    }
    for (idx, name) in layout.image_names.iter().enumerate() {
        let rel = format!("images/{name}");
        out.push_str(&format!(
            "    <item id=\"image-{}\" href=\"{}\" media-type=\"{}\" />\n",
            idx + 1,
            xml_escape(&rel),
            media_type_for_asset(&rel)
        ));
    }
    out.push_str("  </manifest>\n");

    out.push_str("  <spine toc=\"ncx\">\n");
    if layout.cover.as_ref().is_some_and(|c| c.page) {
        out.push_str("    <itemref idref=\"cover\" />\n");
    }
    if layout.visible_toc {
        out.push_str("    <itemref idref=\"nav\" />\n");
    }
    for page in &layout.pages {
        out.push_str(&format!(
            "    <itemref idref=\"{}\" />\n",
            xml_escape(&page.id)
        ));
    }
    out.push_str("  </spine>\n");
    out.push_str("</package>\n");
    out
}

fn wrap_xhtml_document(title: &str, lang: &str, body_html: &str) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<!DOCTYPE html>\n");
    out.push_str(&format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" lang=\"{}\" xml:lang=\"{}\">\n",
        xml_escape(lang),
        xml_escape(lang)
    ));
    out.push_str("<head>\n");
    out.push_str(&format!("  <title>{}</title>\n", xml_escape(title)));
    out.push_str("  <meta charset=\"utf-8\" />\n");
    out.push_str("  <link rel=\"stylesheet\" type=\"text/css\" href=\"style.css\" />\n");
    out.push_str("</head>\n");
    out.push_str("<body>\n");
    out.push_str(body_html);
    if !body_html.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("</body>\n");
    out.push_str("</html>\n");
    out
}

/// XHTML only knows the five XML entities.
fn xhtml_entities(html: &str) -> String {
    html.replace("&nbsp;", "&#160;")
}

fn ensure_xhtml_void_tags(html: &str) -> String {
    const VOID_TAGS: &[&str] = &[
        "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
        "source", "track", "wbr",
    ];

    let bytes = html.as_bytes();
    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;

    while let Some(rel_lt) = html[cursor..].find('<') {
        let lt = cursor + rel_lt;
        out.push_str(&html[cursor..lt]);

        let mut in_quote: Option<u8> = None;
        let mut gt = lt + 1;
        while gt < bytes.len() {
            let b = bytes[gt];
            if let Some(q) = in_quote {
                if b == q {
                    in_quote = None;
                }
                gt += 1;
                continue;
            }
            if b == b'"' || b == b'\'' {
                in_quote = Some(b);
                gt += 1;
                continue;
            }
            if b == b'>' {
                break;
            }
            gt += 1;
        }
        if gt >= bytes.len() {
            out.push_str(&html[lt..]);
            return out;
        }

        let raw_tag = &html[lt..=gt];
        if raw_tag
            .as_bytes()
            .get(1)
            .is_some_and(|b| matches!(b, b'!' | b'?' | b'/'))
        {
            out.push_str(raw_tag);
            cursor = gt + 1;
            continue;
        }

        let name_start = lt + 1;
        let mut name_end = name_start;
        while name_end < gt && (bytes[name_end] as char).is_ascii_alphabetic() {
            name_end += 1;
        }
        let tag_name = html[name_start..name_end].to_ascii_lowercase();
        if name_end == name_start || !VOID_TAGS.contains(&tag_name.as_str()) {
            out.push_str(raw_tag);
            cursor = gt + 1;
            continue;
        }

        let tag_without_gt = &html[lt..gt];
        if tag_without_gt.trim_end().ends_with('/') {
            out.push_str(raw_tag);
        } else {
            out.push_str(tag_without_gt);
            out.push_str(" />");
        }
        cursor = gt + 1;
    }

    out.push_str(&html[cursor..]);
    out
}

pub(crate) fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
