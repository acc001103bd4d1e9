use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};

use crate::error::PipelineError;

pub const DEFAULT_CONTENT_SELECTOR: &str = "#textContainer > .chapter-obf";

/// Length of the randomized class names the source site generates.
const OBFUSCATED_CLASS_LEN: usize = 8;

static CSS_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("valid css comment regex"));
static CLASS_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.(-?[_a-zA-Z][_a-zA-Z0-9-]*)").expect("valid css class regex")
});

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// Class names of every selector rule in `stylesheet` that are exactly eight
/// characters long.
pub fn noise_classes(stylesheet: &str) -> HashSet<String> {
    let stripped = CSS_COMMENT.replace_all(stylesheet, "");
    let mut classes = HashSet::new();
    let blocks = stripped.split('{').collect::<Vec<_>>();
    // Every segment but the last ends right before a `{`.
    for block in &blocks[..blocks.len().saturating_sub(1)] {
        let prelude = block
            .rsplit(['}', ';'])
            .next()
            .unwrap_or_default()
            .trim();
        if prelude.is_empty() || prelude.starts_with('@') {
            continue;
        }
        for cap in CLASS_TOKEN.captures_iter(prelude) {
            let name = &cap[1];
            if name.chars().count() == OBFUSCATED_CLASS_LEN {
                classes.insert(name.to_string());
            }
        }
    }
    classes
}

/// Rebuilds readable chapter HTML from an obfuscated page.
#[derive(Debug, Clone)]
pub struct Deobfuscator {
    container: Selector,
}

impl Deobfuscator {
    pub fn new(container_selector: &str) -> anyhow::Result<Self> {
        let container = Selector::parse(container_selector).map_err(|err| {
            anyhow::anyhow!("invalid content selector {container_selector:?}: {err}")
        })?;
        Ok(Self { container })
    }

    /// Drops decoy elements named by the stylesheet, extracts the chapter
    /// container and unwraps its eight-character class wrappers.
    pub fn clean(&self, raw_html: &str, stylesheet: &str) -> Result<String, PipelineError> {
        let noise = noise_classes(stylesheet);
        if noise.is_empty() {
            return Err(PipelineError::Deobfuscation(
                "stylesheet declares no eight-character classes".to_string(),
            ));
        }

        let document = Html::parse_document(raw_html);
        let container = document
            .select(&self.container)
            .find(|el| {
                !is_noise(*el, &noise)
                    && !el
                        .ancestors()
                        .filter_map(ElementRef::wrap)
                        .any(|a| is_noise(a, &noise))
            })
            .ok_or_else(|| {
                PipelineError::Deobfuscation("chapter container not found".to_string())
            })?;

        let mut out = String::with_capacity(raw_html.len() / 2);
        write_children(container, &noise, &mut out);
        Ok(out.trim().to_string())
    }
}

impl Default for Deobfuscator {
    fn default() -> Self {
        Self {
            container: Selector::parse(DEFAULT_CONTENT_SELECTOR)
                .expect("valid default content selector"),
        }
    }
}

fn class_attr(el: ElementRef<'_>) -> Option<&str> {
    el.value().attr("class").map(str::trim)
}

fn is_noise(el: ElementRef<'_>, noise: &HashSet<String>) -> bool {
    class_attr(el).is_some_and(|class| noise.contains(class))
}

fn is_wrapper(el: ElementRef<'_>) -> bool {
    class_attr(el).is_some_and(|class| {
        class.chars().count() == OBFUSCATED_CLASS_LEN && !class.contains(char::is_whitespace)
    })
}

fn write_children(parent: ElementRef<'_>, noise: &HashSet<String>, out: &mut String) {
    let raw_text = parent.value().name() == "style";
    for child in parent.children() {
        match child.value() {
            Node::Text(text) if raw_text => out.push_str(text),
            Node::Text(text) => escape_text(text, out),
            Node::Element(_) => {
                if let Some(el) = ElementRef::wrap(child) {
                    write_element(el, noise, out);
                }
            }
            _ => {}
        }
    }
}

fn write_element(el: ElementRef<'_>, noise: &HashSet<String>, out: &mut String) {
    if is_noise(el, noise) {
        return;
    }
    let name = el.value().name();
    if name == "script" {
        return;
    }
    if is_wrapper(el) {
        write_children(el, noise, out);
        return;
    }

    out.push('<');
    out.push_str(name);
    for (key, value) in el.value().attrs() {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        escape_attr(value, out);
        out.push('"');
    }
    if VOID_TAGS.contains(&name) {
        out.push_str(" />");
        return;
    }
    out.push('>');
    write_children(el, noise, out);
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\u{a0}' => out.push_str("&#160;"),
            c => out.push(c),
        }
    }
}

pub(crate) fn escape_attr(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
}
