use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use url::Url;

use crate::chapter::DEFAULT_CHAPTER_PATTERN;
use crate::deobfuscate::DEFAULT_CONTENT_SELECTOR;
use crate::fetch::{DEFAULT_STYLESHEET_MARKER, DEFAULT_TITLE_SELECTOR, DEFAULT_USER_AGENT};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP server.
    Serve(ServeArgs),
    /// Merge every leaf directory under DIR into one volume book.
    Merge(MergeArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Listen address.
    #[arg(long, env = "NOVELPRESS_ADDR", default_value = "127.0.0.1:5000")]
    pub addr: SocketAddr,

    /// Output root for chapter and volume books.
    #[arg(long, env = "EPUB_ROOT_FOLDER", default_value = "./results")]
    pub root: PathBuf,

    /// Site chapter references are resolved against.
    #[arg(
        long,
        env = "NOVELPRESS_UPSTREAM_URL",
        default_value = "https://world-novel.fr/"
    )]
    pub upstream_url: Url,

    /// Session cookie sent with every upstream request.
    #[arg(long, env = "NOVELPRESS_UPSTREAM_COOKIE", hide_env_values = true)]
    pub upstream_cookie: Option<String>,

    #[arg(long, default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// Upstream request timeout.
    #[arg(long, default_value_t = 60)]
    pub request_timeout_secs: u64,

    #[arg(long, default_value_t = 5)]
    pub max_redirects: usize,

    /// Substring identifying the chapter stylesheet link.
    #[arg(long, default_value = DEFAULT_STYLESHEET_MARKER)]
    pub stylesheet_marker: String,

    /// CSS selector of the obfuscated chapter container.
    #[arg(long, default_value = DEFAULT_CONTENT_SELECTOR)]
    pub content_selector: String,

    /// CSS selector of the chapter title.
    #[arg(long, default_value = DEFAULT_TITLE_SELECTOR)]
    pub title_selector: String,

    /// Regex whose first capture group is the chapter index.
    #[arg(long, default_value = DEFAULT_CHAPTER_PATTERN)]
    pub chapter_pattern: String,

    /// Quiet period before a volume folder is merged.
    #[arg(long, env = "NOVELPRESS_MERGE_DELAY_SECS", default_value_t = 60)]
    pub merge_delay_secs: u64,
}

#[derive(Debug, Args)]
pub struct MergeArgs {
    pub dir: PathBuf,
}
