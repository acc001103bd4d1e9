use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, COOKIE, HeaderMap, HeaderValue, REFERER, USER_AGENT};
use scraper::{Html, Selector};
use url::Url;

use crate::error::PipelineError;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";
pub const DEFAULT_STYLESHEET_MARKER: &str = "chapitre";
pub const DEFAULT_TITLE_SELECTOR: &str = "main div div span:nth-of-type(2)";

/// One chapter page as served by the source site.
#[derive(Debug, Clone)]
pub struct RawChapter {
    pub url: Url,
    pub html: String,
    pub stylesheet: String,
    /// Chapter title shown on the page, if any.
    pub title: Option<String>,
}

/// The source site, as seen by the pipeline.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch_chapter(&self, chapter_ref: &str) -> Result<RawChapter, PipelineError>;

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, PipelineError>;
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub base_url: Url,
    pub user_agent: String,
    pub cookie: Option<String>,
    pub timeout: Duration,
    pub max_redirects: usize,
    pub stylesheet_marker: String,
    pub title_selector: String,
}

impl FetcherConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            cookie: None,
            timeout: Duration::from_secs(60),
            max_redirects: 5,
            stylesheet_marker: DEFAULT_STYLESHEET_MARKER.to_string(),
            title_selector: DEFAULT_TITLE_SELECTOR.to_string(),
        }
    }
}

/// HTTP client for the source site. One session is shared by every job.
///
/// The session headers (Referer, cookie) only go to the upstream origin;
/// images and covers hosted elsewhere are fetched without them.
#[derive(Debug, Clone)]
pub struct ChapterFetcher {
    client: reqwest::Client,
    base_url: Url,
    session: HeaderMap,
    stylesheet_marker: String,
    title_selector: Selector,
}

impl ChapterFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).context("invalid user agent")?,
        );
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml;q=0.9,*/*;q=0.8"),
        );

        let mut session = HeaderMap::new();
        session.insert(
            REFERER,
            HeaderValue::from_str(config.base_url.as_str()).context("invalid referer")?,
        );
        if let Some(cookie) = config.cookie.as_deref().filter(|c| !c.is_empty()) {
            let mut value = HeaderValue::from_str(cookie).context("invalid upstream cookie")?;
            value.set_sensitive(true);
            session.insert(COOKIE, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .context("build upstream http client")?;

        let title_selector = Selector::parse(&config.title_selector).map_err(|err| {
            anyhow::anyhow!("invalid title selector {:?}: {err}", config.title_selector)
        })?;

        Ok(Self {
            client,
            base_url: config.base_url,
            session,
            stylesheet_marker: config.stylesheet_marker,
            title_selector,
        })
    }

    /// Resolves a chapter reference against the upstream; references that
    /// land on another origin are rejected.
    pub fn chapter_url(&self, chapter_ref: &str) -> Result<Url, PipelineError> {
        let url = self
            .base_url
            .join(chapter_ref.trim())
            .map_err(|err| PipelineError::fetch(chapter_ref, format!("invalid chapter url: {err}")))?;
        if !self.is_upstream(&url) {
            return Err(PipelineError::Validation(format!(
                "chapter reference is not on {}: {chapter_ref:?}",
                self.base_url
            )));
        }
        Ok(url)
    }

    pub fn is_upstream(&self, url: &Url) -> bool {
        url.origin() == self.base_url.origin()
    }

    async fn get(&self, url: &Url) -> Result<reqwest::Response, PipelineError> {
        let mut request = self.client.get(url.clone());
        if self.is_upstream(url) {
            request = request.headers(self.session.clone());
        }
        let response = request
            .send()
            .await
            .map_err(|err| PipelineError::fetch(url.as_str(), err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::fetch(url.as_str(), format!("HTTP {status}")));
        }
        Ok(response)
    }

    async fn get_text(&self, url: &Url) -> Result<String, PipelineError> {
        self.get(url)
            .await?
            .text()
            .await
            .map_err(|err| PipelineError::fetch(url.as_str(), err))
    }
}

#[async_trait]
impl Upstream for ChapterFetcher {
    async fn fetch_chapter(&self, chapter_ref: &str) -> Result<RawChapter, PipelineError> {
        let url = self.chapter_url(chapter_ref)?;
        tracing::debug!(url = %url, "fetch chapter");
        let html = self.get_text(&url).await?;

        let page = inspect_page(&html, &self.stylesheet_marker, &self.title_selector);
        let href = page.stylesheet_href.ok_or_else(|| {
            PipelineError::fetch(
                url.as_str(),
                format!("no stylesheet link containing {:?}", self.stylesheet_marker),
            )
        })?;
        let stylesheet_url = url
            .join(&href)
            .map_err(|err| PipelineError::fetch(href.as_str(), err))?;
        let stylesheet = self.get_text(&stylesheet_url).await?;

        Ok(RawChapter {
            url,
            html,
            stylesheet,
            title: page.title,
        })
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, PipelineError> {
        let parsed = Url::parse(url).map_err(|err| PipelineError::fetch(url, err))?;
        let bytes = self
            .get(&parsed)
            .await?
            .bytes()
            .await
            .map_err(|err| PipelineError::fetch(url, err))?;
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct PageInfo {
    stylesheet_href: Option<String>,
    title: Option<String>,
}

// Parsed documents are not `Send`; keep them out of async bodies.
fn inspect_page(html: &str, stylesheet_marker: &str, title_selector: &Selector) -> PageInfo {
    static STYLESHEET_LINK: std::sync::LazyLock<Selector> = std::sync::LazyLock::new(|| {
        Selector::parse("link[rel=stylesheet][href]").expect("valid stylesheet selector")
    });

    let document = Html::parse_document(html);
    let stylesheet_href = document
        .select(&STYLESHEET_LINK)
        .filter_map(|link| link.value().attr("href"))
        .find(|href| href.contains(stylesheet_marker))
        .map(str::to_string);
    let title = document
        .select(title_selector)
        .map(|el| el.text().collect::<String>())
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
        .find(|text| !text.is_empty());

    PageInfo {
        stylesheet_href,
        title,
    }
}
