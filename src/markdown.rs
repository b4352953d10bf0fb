// =============================================================================
// Harmony Matrix Client - Markdown & HTML Normalization Module
// =============================================================================
//
// Project: Harmony - Multi-account Matrix chat client
// Contributors: Harmony Development Team
// Date: 2024-12-11
// Version: 0.1.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Turns composer markdown and received message content into the HTML that
//   enters the display. Runs once per message, at enqueue time.
//
// Features:
//   • CommonMark with tables, strikethrough, task lists, fenced code
//   • Newlines become line breaks
//   • Raw HTML in markdown is escaped, never passed through
//   • Script/style/event-handler stripping for received HTML
//   • <del>/<strike> rewritten to <s>
//   • Bare URLs and e-mail addresses link-ified outside anchors and code
//
// =============================================================================

use std::sync::OnceLock;

use pulldown_cmark::{html, Event, Options, Parser};
use regex::{Captures, Regex};

/// Characters that end a sentence rather than a URL.
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', ')', '\'', '"'];

fn markdown_options() -> Options {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);
    options
}

/// Render composer markdown to HTML.
pub fn markdown_to_html(text: &str) -> String {
    let parser = Parser::new_ext(text, markdown_options()).map(|event| match event {
        Event::SoftBreak => Event::HardBreak,
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        other => other,
    });

    let mut out = String::with_capacity(text.len() * 3 / 2);
    html::push_html(&mut out, parser);
    out
}

/// Escape text for inclusion in HTML.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn strike_tags() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"(?i)(</?)\s*(?:del|strike)\s*>")
}

fn active_content() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(
        &RE,
        r"(?is)<(?:script|style|iframe|object|embed)\b.*?</\s*(?:script|style|iframe|object|embed)\s*>|<(?:script|style|iframe|object|embed)\b[^>]*>",
    )
}

fn tags() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"<[^>]+>")
}

fn tag_head() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"^<(/?)([A-Za-z][A-Za-z0-9:-]*)")
}

fn attributes() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r#"([^\s"'<>/=]+)(?:\s*=\s*("[^"]*"|'[^']*'|[^\s"'>]+))?"#)
}

fn char_references() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"(?i)&#(?:x([0-9a-f]+)|([0-9]+));?|&(colon|tab|newline);")
}

/// Segments that must be copied verbatim by [`linkify`].
fn protected_segments() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(
        &RE,
        r"(?is)<a\b.*?</a\s*>|<code\b.*?</code\s*>|<pre\b.*?</pre\s*>|<[^>]*>",
    )
}

fn link_candidates() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(
        &RE,
        r"(?i)\b(?:https?://[^\s<>]+|www\.[^\s<>]+|localhost(?::\d+)?(?:/[^\s<>]*)?|[a-z0-9._%+-]+@[a-z0-9-]+(?:\.[a-z0-9-]+)*\.[a-z]{2,})",
    )
}

/// Rewrite tags the display does not know (`<del>`, `<strike>`) to `<s>`.
pub fn filter_html(html: &str) -> String {
    match strike_tags() {
        Some(re) => re.replace_all(html, "${1}s>").into_owned(),
        None => html.to_owned(),
    }
}

/// Resolve numeric and the URL-relevant named character references.
fn decode_char_references(value: &str) -> String {
    let Some(re) = char_references() else {
        return value.to_owned();
    };
    re.replace_all(value, |caps: &Captures<'_>| {
        let code = match (caps.get(1), caps.get(2), caps.get(3)) {
            (Some(hex), _, _) => u32::from_str_radix(hex.as_str(), 16).ok(),
            (_, Some(dec), _) => dec.as_str().parse().ok(),
            (_, _, Some(name)) => match name.as_str().to_ascii_lowercase().as_str() {
                "colon" => Some(u32::from(':')),
                "tab" => Some(u32::from('\t')),
                _ => Some(u32::from('\n')),
            },
            _ => None,
        };
        code.and_then(char::from_u32).map(String::from).unwrap_or_default()
    })
    .into_owned()
}

/// Whether an attribute value would run code when followed.
fn is_script_url(value: &str) -> bool {
    let value = value.trim_matches(&['"', '\''][..]);
    let scheme: String = decode_char_references(value)
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .take(16)
        .collect::<String>()
        .to_ascii_lowercase();
    ["javascript:", "vbscript:", "data:text/html"]
        .iter()
        .any(|prefix| scheme.starts_with(prefix))
}

/// Rebuild one tag without event handlers and script URLs.
fn clean_tag(tag: &str) -> String {
    let (Some(head_re), Some(attr_re)) = (tag_head(), attributes()) else {
        return escape_html(tag);
    };
    // Comments, doctypes and stray `<` are not elements
    let Some(head) = head_re.captures(tag) else {
        return tag.to_owned();
    };
    let (closing, name) = (&head[1], &head[2]);
    let body = tag[head[0].len()..].strip_suffix('>').unwrap_or(&tag[head[0].len()..]);

    let mut out = format!("<{closing}{name}");
    for attr in attr_re.captures_iter(body) {
        let attr_name = attr[1].to_ascii_lowercase();
        if attr_name.starts_with("on") {
            continue;
        }
        match attr.get(2) {
            Some(value) if is_script_url(value.as_str()) => {
                out.push_str(&format!(" {}=\"#\"", &attr[1]));
            }
            _ => {
                out.push(' ');
                out.push_str(&attr[0]);
            }
        }
    }
    if body.trim_end().ends_with('/') {
        out.push_str(" /");
    }
    out.push('>');
    out
}

/// Remove executable content from HTML received from other clients.
pub fn sanitize_html(html: &str) -> String {
    let html = match active_content() {
        Some(re) => re.replace_all(html, "").into_owned(),
        None => html.to_owned(),
    };
    match tags() {
        Some(re) => re
            .replace_all(&html, |caps: &Captures<'_>| clean_tag(&caps[0]))
            .into_owned(),
        None => html,
    }
}

fn href_for(target: &str) -> String {
    let lower = target.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        target.to_owned()
    } else if lower.starts_with("localhost") {
        format!("http://{target}")
    } else if target.contains('@') && !target.contains('/') {
        format!("mailto:{target}")
    } else {
        format!("https://{target}")
    }
}

fn linkify_text(text: &str, out: &mut String) {
    let Some(re) = link_candidates() else {
        out.push_str(text);
        return;
    };
    let replaced = re.replace_all(text, |caps: &Captures<'_>| {
        let matched = &caps[0];
        let target = matched.trim_end_matches(TRAILING_PUNCTUATION);
        let trailing = &matched[target.len()..];
        format!("<a href=\"{}\">{target}</a>{trailing}", href_for(target))
    });
    out.push_str(&replaced);
}

/// Wrap bare URLs, `localhost` addresses and e-mail addresses in anchors.
///
/// Text already inside `<a>`, `<code>` or `<pre>` and the tags themselves
/// are left untouched.
pub fn linkify(html: &str) -> String {
    let Some(protected) = protected_segments() else {
        return html.to_owned();
    };
    let mut out = String::with_capacity(html.len());
    let mut last = 0;
    for segment in protected.find_iter(html) {
        linkify_text(&html[last..segment.start()], &mut out);
        out.push_str(segment.as_str());
        last = segment.end();
    }
    linkify_text(&html[last..], &mut out);
    out
}

/// Normalization shared by received messages and local echoes, so both
/// produce identical markup for the same content.
pub fn normalize_html(html: &str) -> String {
    filter_html(&linkify(&sanitize_html(html)))
        .trim_end()
        .to_owned()
}

/// Markdown of a message we are about to send, as the server will see it.
pub fn render_outgoing(markdown: &str) -> String {
    markdown_to_html(markdown.trim()).trim_end().to_owned()
}

/// Markup of a body that carries no `formatted_body`.
pub fn render_plain_body(body: &str) -> String {
    normalize_html(&markdown_to_html(body))
}
