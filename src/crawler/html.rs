//! Body cleanup and small string helpers for extracted markup.

use scraper::{ElementRef, Node};
use url::Url;

const DROPPED_TAGS: &[&str] = &[
    "script", "style", "nav", "header", "footer", "aside", "noscript", "form", "button",
    "iframe", "svg",
];

const CHROME_CLASS_HINTS: &[&str] = &[
    "nav", "menu", "breadcrumb", "sidebar", "search", "feedback", "subscribe", "footer", "header",
];

const KEPT_ATTRS: &[&str] = &[
    "class", "id", "href", "src", "alt", "title", "colspan", "rowspan", "target", "rel",
    "data-uniquefileid",
];

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];

const INVISIBLE: &[char] = &[
    '\u{200B}', '\u{200C}', '\u{200D}', '\u{200E}', '\u{200F}', '\u{202A}', '\u{202B}',
    '\u{202C}', '\u{202D}', '\u{202E}', '\u{2060}', '\u{FEFF}', '\u{00AD}', 'Â',
];

pub(crate) struct CleanBody {
    pub html: String,
    /// Absolute http(s) image URLs in document order, deduplicated.
    pub images: Vec<String>,
}

/// Serialize `container` without page chrome or scripts, keeping only a small
/// attribute set. Image sources are resolved against `base` in the output.
pub(crate) fn clean_body(container: ElementRef<'_>, base: &Url) -> CleanBody {
    let mut out = CleanBody {
        html: String::new(),
        images: Vec::new(),
    };
    write_element(container, base, &mut out, true);
    out.html = strip_invisible(&out.html);
    out
}

fn write_element(node: ElementRef<'_>, base: &Url, out: &mut CleanBody, root: bool) {
    let element = node.value();
    let name = element.name();
    if !root && is_chrome(name, element.classes()) {
        return;
    }

    out.html.push('<');
    out.html.push_str(name);
    for (attr, value) in element.attrs() {
        if !KEPT_ATTRS.contains(&attr) {
            continue;
        }
        let value = if name == "img" && attr == "src" {
            match resolve_http(base, value) {
                Some(absolute) => {
                    if !out.images.contains(&absolute) {
                        out.images.push(absolute.clone());
                    }
                    absolute
                }
                None => value.to_string(),
            }
        } else if attr == "href" {
            let href = value.trim();
            if href == "#" || href.to_ascii_lowercase().starts_with("javascript:") {
                continue;
            }
            if href.starts_with('#') {
                href.to_string()
            } else {
                resolve_http(base, href).unwrap_or_else(|| href.to_string())
            }
        } else {
            value.to_string()
        };
        out.html.push(' ');
        out.html.push_str(attr);
        out.html.push_str("=\"");
        out.html.push_str(&escape_attr(&value));
        out.html.push('"');
    }
    out.html.push('>');

    if VOID_TAGS.contains(&name) {
        return;
    }

    for child in node.children() {
        match child.value() {
            Node::Text(text) => out.html.push_str(&escape_text(text)),
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    write_element(child, base, out, false);
                }
            }
            _ => {}
        }
    }

    out.html.push_str("</");
    out.html.push_str(name);
    out.html.push('>');
}

fn is_chrome<'a>(tag: &str, mut classes: impl Iterator<Item = &'a str>) -> bool {
    if DROPPED_TAGS.contains(&tag) {
        return true;
    }
    classes.any(|class| {
        let class = class.to_ascii_lowercase();
        if class.contains("card-header") {
            return false;
        }
        CHROME_CLASS_HINTS.iter().any(|hint| class.contains(hint))
    })
}

fn resolve_http(base: &Url, src: &str) -> Option<String> {
    let src = src.trim();
    if src.is_empty() || src.starts_with("data:") {
        return None;
    }
    let url = base.join(src).ok()?;
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

pub(crate) fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub(crate) fn escape_attr(s: &str) -> String {
    escape_text(s).replace('"', "&quot;")
}

/// Point every `attr="from"` in serialized markup at `to`.
pub(crate) fn replace_attr_value(html: &str, attr: &str, from: &str, to: &str) -> String {
    let needle = format!("{}=\"{}\"", attr, escape_attr(from));
    let replacement = format!("{}=\"{}\"", attr, escape_attr(to));
    html.replace(&needle, &replacement)
}

pub(crate) fn strip_invisible(s: &str) -> String {
    s.chars().filter(|c| !INVISIBLE.contains(c)).collect()
}

/// Collapse runs of whitespace (including NBSP) to single spaces.
pub(crate) fn normalize_whitespace(s: &str) -> String {
    strip_invisible(s)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Truncate serialized markup without leaving a half-written tag at the end.
pub(crate) fn truncate_markup(html: &str, max: usize) -> String {
    let mut cut = truncate_chars(html, max);
    if cut.len() < html.len() {
        if let Some(lt) = cut.rfind('<') {
            if cut[lt..].find('>').is_none() {
                cut.truncate(lt);
            }
        }
    }
    cut
}
