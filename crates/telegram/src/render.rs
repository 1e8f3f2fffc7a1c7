use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};
use thiserror::Error;
use tracing::debug;

use ichigo_core::{Renderer, TextFormat};

/// Characters that must be backslash-escaped in MarkdownV2 text.
const SPECIAL: &[char] = &[
    '\\', '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("unbalanced markdown structure at {0}")]
    Unbalanced(&'static str),
}

/// Converts model output (CommonMark) to Telegram MarkdownV2. Falls back to
/// escaping the whole text when conversion fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct MarkdownV2Renderer;

impl Renderer for MarkdownV2Renderer {
    fn render(&self, raw: &str) -> String {
        to_markdown_v2(raw).unwrap_or_else(|error| {
            debug!(event_name = "render.fallback", error = %error, "escaping raw text");
            escape_text(raw)
        })
    }

    fn format(&self) -> TextFormat {
        TextFormat::Markdown
    }
}

pub fn escape_text(text: &str) -> String {
    escape_with(text, SPECIAL)
}

fn escape_code(text: &str) -> String {
    escape_with(text, &['\\', '`'])
}

fn escape_link(url: &str) -> String {
    escape_with(url, &['\\', ')'])
}

fn escape_with(text: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(text.len() + text.len() / 8);
    for ch in text.chars() {
        if special.contains(&ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Removes MarkdownV2 escapes so rendered text can be resent without a parse
/// mode.
pub fn strip_escapes(text: &str) -> String {
    let mut plain = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(next) = chars.peek().copied().filter(|next| SPECIAL.contains(next)) {
                plain.push(next);
                chars.next();
                continue;
            }
        }
        plain.push(ch);
    }
    plain
}

fn is_linkable(url: &str) -> bool {
    ["http://", "https://", "tg://", "mailto:"].iter().any(|scheme| url.starts_with(scheme))
}

#[derive(Debug)]
enum Open {
    Block,
    Inline,
    Link { url: Option<String> },
    CodeBlock,
    List { next: Option<u64> },
}

pub fn to_markdown_v2(raw: &str) -> Result<String, RenderError> {
    let parser = Parser::new_ext(raw, Options::ENABLE_STRIKETHROUGH);
    let mut out = String::with_capacity(raw.len() + raw.len() / 4);
    let mut stack: Vec<Open> = Vec::new();

    for event in parser {
        match event {
            Event::Start(tag) => {
                let open = match tag {
                    Tag::Heading { .. } => {
                        out.push('*');
                        Open::Block
                    }
                    Tag::Strong => {
                        out.push('*');
                        Open::Inline
                    }
                    Tag::Emphasis => {
                        out.push('_');
                        Open::Inline
                    }
                    Tag::Strikethrough => {
                        out.push('~');
                        Open::Inline
                    }
                    Tag::Link { dest_url, .. } | Tag::Image { dest_url, .. } => {
                        let url = is_linkable(&dest_url).then(|| dest_url.to_string());
                        if url.is_some() {
                            out.push('[');
                        }
                        Open::Link { url }
                    }
                    Tag::CodeBlock(kind) => {
                        out.push_str("```");
                        if let CodeBlockKind::Fenced(lang) = kind {
                            out.push_str(lang.split_whitespace().next().unwrap_or_default());
                        }
                        out.push('\n');
                        Open::CodeBlock
                    }
                    Tag::List(start) => Open::List { next: start },
                    Tag::Item => {
                        let marker = match stack.last_mut() {
                            Some(Open::List { next: Some(number) }) => {
                                let marker = format!("{number}\\. ");
                                *number += 1;
                                marker
                            }
                            _ => "• ".to_string(),
                        };
                        out.push_str(&marker);
                        Open::Block
                    }
                    _ => Open::Block,
                };
                stack.push(open);
            }
            Event::End(tag) => {
                let open = stack.pop().ok_or(RenderError::Unbalanced("end tag"))?;
                match (tag, open) {
                    (TagEnd::Heading(_), _) => out.push_str("*\n\n"),
                    (TagEnd::Strong, _) => out.push('*'),
                    (TagEnd::Emphasis, _) => out.push('_'),
                    (TagEnd::Strikethrough, _) => out.push('~'),
                    (TagEnd::Link | TagEnd::Image, Open::Link { url: Some(url) }) => {
                        out.push_str("](");
                        out.push_str(&escape_link(&url));
                        out.push(')');
                    }
                    (TagEnd::CodeBlock, _) => {
                        if !out.ends_with('\n') {
                            out.push('\n');
                        }
                        out.push_str("```\n\n");
                    }
                    (TagEnd::Paragraph, _) => out.push_str(
                        if matches!(stack.last(), Some(Open::Block)) { "\n" } else { "\n\n" },
                    ),
                    (TagEnd::Item, _) => {
                        if !out.ends_with('\n') {
                            out.push('\n');
                        }
                    }
                    (TagEnd::List(_), _) => out.push('\n'),
                    _ => {}
                }
            }
            Event::Text(text) => {
                if matches!(stack.last(), Some(Open::CodeBlock)) {
                    out.push_str(&escape_code(&text));
                } else {
                    out.push_str(&escape_text(&text));
                }
            }
            Event::Code(code) => {
                out.push('`');
                out.push_str(&escape_code(&code));
                out.push('`');
            }
            Event::Html(html) | Event::InlineHtml(html) => out.push_str(&escape_text(&html)),
            Event::SoftBreak | Event::HardBreak => out.push('\n'),
            Event::Rule => out.push_str("\\-\\-\\-\n\n"),
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(RenderError::Unbalanced("end of input"));
    }
    let trimmed = out.trim_end_matches('\n').len();
    out.truncate(trimmed);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use ichigo_core::Renderer;

    use super::{escape_text, strip_escapes, to_markdown_v2, MarkdownV2Renderer};

    #[test]
    fn special_characters_are_escaped() {
        assert_eq!(escape_text("v1.2 (beta)!"), "v1\\.2 \\(beta\\)\\!");
        assert_eq!(escape_text("a_b*c"), "a\\_b\\*c");
    }

    #[test]
    fn inline_styles_are_converted() {
        assert_eq!(
            to_markdown_v2("**bold**, *italic* and ~~gone~~.").as_deref(),
            Ok("*bold*, _italic_ and ~gone~\\.")
        );
    }

    #[test]
    fn headings_become_bold_lines() {
        assert_eq!(to_markdown_v2("# Title\n\nbody").as_deref(), Ok("*Title*\n\nbody"));
    }

    #[test]
    fn code_keeps_its_content() {
        assert_eq!(to_markdown_v2("use `a_b()` here").as_deref(), Ok("use `a_b()` here"));
        assert_eq!(
            to_markdown_v2("```rust\nlet x = 1;\n```").as_deref(),
            Ok("```rust\nlet x = 1;\n```")
        );
    }

    #[test]
    fn links_keep_valid_urls_only() {
        assert_eq!(
            to_markdown_v2("[docs](https://example.com/a_(b))").as_deref(),
            Ok("[docs](https://example.com/a_(b\\))")
        );
        assert_eq!(to_markdown_v2("[local](./file.md)").as_deref(), Ok("local"));
    }

    #[test]
    fn lists_get_markers() {
        assert_eq!(to_markdown_v2("- one\n- two").as_deref(), Ok("• one\n• two"));
        assert_eq!(to_markdown_v2("1. one\n2. two").as_deref(), Ok("1\\. one\n2\\. two"));
    }

    #[test]
    fn partial_stream_output_still_renders() {
        let rendered = MarkdownV2Renderer.render("**unfinished bold and a `tick");
        assert_eq!(rendered, "\\*\\*unfinished bold and a \\`tick");
    }

    #[test]
    fn stripping_escapes_restores_plain_text() {
        assert_eq!(strip_escapes("v1\\.2 \\(beta\\)\\!"), "v1.2 (beta)!");
        assert_eq!(strip_escapes("path\\q"), "path\\q");
    }
}
