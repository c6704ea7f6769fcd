//! Terminal rendering.
//!
//! Everything here returns styled strings instead of printing, so the REPL
//! decides where output goes.

use std::fmt::Write as _;

use apai_core::conversation::Turn;
use apai_core::{AgentInfo, ContextUsage};
use owo_colors::{OwoColorize, Style};
use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};

/// Styles a piece of model reasoning.
#[inline]
pub fn reasoning(text: &str) -> String {
    text.dimmed().magenta().to_string()
}

/// Styles a status message.
#[inline]
pub fn status(text: &str) -> String {
    text.green().to_string()
}

/// Styles an error message.
#[inline]
pub fn error(text: &str) -> String {
    text.red().to_string()
}

/// Styles a warning or a question to the user.
#[inline]
pub fn warning(text: &str) -> String {
    text.bold().yellow().to_string()
}

/// Renders the context usage line shown before each reply.
pub fn context_banner(usage: &ContextUsage) -> String {
    if usage.expired == 0 {
        format!("context: [{}|{}]", usage.used, usage.len)
            .cyan()
            .to_string()
    } else {
        format!(
            "context: [{}|{}] {} context(s) expired",
            usage.used, usage.len, usage.expired
        )
        .yellow()
        .to_string()
    }
}

/// Renders the heading of a speaker, such as the model id before a reply.
#[inline]
pub fn speaker(name: &str) -> String {
    format!("{name}:").bold().cyan().to_string()
}

/// Renders a question as it is echoed back before the reply. File content
/// is abbreviated.
pub fn question(text: &str, with_file: bool) -> String {
    let body = if with_file {
        format!("[file content]\n{text}")
    } else {
        text.to_owned()
    };
    format!("{}\n{}", "user:".bold().blue(), body.blue())
}

/// Renders a past exchange, dimmed, as shown after loading a save.
pub fn exchange(user: &Turn, assistant: &Turn) -> String {
    let mut out = String::new();
    for (turn, style) in [
        (user, Style::new().dimmed().blue()),
        (assistant, Style::new().dimmed().cyan()),
    ] {
        let _ = writeln!(out, "{}", turn.role.dimmed().bold());
        let _ = writeln!(out, "{}", turn.content.style(style));
    }
    out
}

/// Renders the settings of an agent as a small table.
pub fn info_table(info: &AgentInfo) -> String {
    let headers = ["Provider", "Model", "Instr Key", "Context Length"];
    let context_len = info.context_len.to_string();
    let values = [
        info.provider.as_str(),
        info.model_id.as_str(),
        info.instr_key.as_str(),
        context_len.as_str(),
    ];
    let widths: Vec<usize> = headers
        .iter()
        .zip(values)
        .map(|(h, v)| h.chars().count().max(v.chars().count()))
        .collect();

    let border = |left: &str, mid: &str, right: &str| {
        let segments: Vec<String> =
            widths.iter().map(|w| "─".repeat(w + 2)).collect();
        format!("{left}{}{right}", segments.join(mid))
    };
    let row = |cells: &[&str], style: Style| {
        let mut line = String::from("│");
        for (cell, &width) in cells.iter().zip(&widths) {
            let padded = format!(" {cell:<width$} ");
            let _ = write!(line, "{}│", padded.style(style));
        }
        line
    };

    [
        border("┌", "┬", "┐"),
        row(&headers[..], Style::new().bold().magenta()),
        border("├", "┼", "┤"),
        row(&values[..], Style::new()),
        border("└", "┴", "┘"),
    ]
    .join("\n")
}

/// Renders markdown as styled terminal text.
///
/// Headings are bold, emphasis and strikethrough keep their meaning, code
/// is colored, lists get bullets or numbers and block quotes a bar.
pub fn markdown(text: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);

    let mut writer = AnsiWriter::default();
    for event in Parser::new_ext(text, options) {
        writer.event(event);
    }
    let mut out = writer.out;
    out.truncate(out.trim_end().len());
    out
}

#[derive(Default)]
struct AnsiWriter {
    out: String,
    at_line_start: bool,
    strong: usize,
    emphasis: usize,
    strike: usize,
    heading: bool,
    code_block: bool,
    quote_depth: usize,
    lists: Vec<Option<u64>>,
    links: Vec<String>,
}

impl AnsiWriter {
    fn event(&mut self, event: Event<'_>) {
        match event {
            Event::Start(tag) => self.start(tag),
            Event::End(tag) => self.end(tag),
            Event::Text(text) => {
                let style = AnsiWriter::style(self);
                self.write(&text, style);
            }
            Event::Code(code) => {
                self.write(&code, Style::new().yellow());
            }
            Event::Html(html) | Event::InlineHtml(html) => {
                self.write(&html, Style::new());
            }
            Event::SoftBreak | Event::HardBreak => self.write("\n", Style::new()),
            Event::Rule => {
                self.newline();
                self.write(&"─".repeat(40), Style::new().dimmed());
                self.end_block();
            }
            Event::TaskListMarker(checked) => {
                let marker = if checked { "[x] " } else { "[ ] " };
                self.write(marker, Style::new().dimmed());
            }
            _ => {}
        }
    }

    fn start(&mut self, tag: Tag<'_>) {
        match tag {
            Tag::Heading { level, .. } => {
                self.newline();
                self.heading = true;
                let hashes = "#".repeat(level as usize);
                let style = AnsiWriter::style(self);
                self.write(&format!("{hashes} "), style);
            }
            Tag::BlockQuote { .. } => {
                self.newline();
                self.quote_depth += 1;
            }
            Tag::CodeBlock(kind) => {
                self.newline();
                self.code_block = true;
                let lang = match kind {
                    CodeBlockKind::Fenced(info) => info
                        .split_whitespace()
                        .next()
                        .unwrap_or_default()
                        .to_owned(),
                    CodeBlockKind::Indented => String::new(),
                };
                self.write(&format!("```{lang}\n"), Style::new().dimmed());
            }
            Tag::List(start) => {
                self.newline();
                self.lists.push(start);
            }
            Tag::Item => {
                self.newline();
                let indent = "  ".repeat(self.lists.len().saturating_sub(1));
                let bullet = match self.lists.last_mut() {
                    Some(Some(n)) => {
                        let bullet = format!("{indent}{n}. ");
                        *n += 1;
                        bullet
                    }
                    _ => format!("{indent}• "),
                };
                self.write(&bullet, Style::new().bold());
            }
            Tag::Emphasis => self.emphasis += 1,
            Tag::Strong => self.strong += 1,
            Tag::Strikethrough => self.strike += 1,
            Tag::Link { dest_url, .. } => self.links.push(dest_url.into_string()),
            _ => {}
        }
    }

    fn end(&mut self, tag: TagEnd) {
        match tag {
            TagEnd::Paragraph => {
                if self.lists.is_empty() {
                    self.end_block();
                } else {
                    self.newline();
                }
            }
            TagEnd::Heading(_) => {
                self.heading = false;
                self.end_block();
            }
            TagEnd::BlockQuote { .. } => {
                self.quote_depth = self.quote_depth.saturating_sub(1);
                self.newline();
            }
            TagEnd::CodeBlock => {
                self.newline();
                self.write("```", Style::new().dimmed());
                self.code_block = false;
                self.end_block();
            }
            TagEnd::List(_) => {
                self.lists.pop();
                if self.lists.is_empty() {
                    self.end_block();
                }
            }
            TagEnd::Emphasis => self.emphasis = self.emphasis.saturating_sub(1),
            TagEnd::Strong => self.strong = self.strong.saturating_sub(1),
            TagEnd::Strikethrough => self.strike = self.strike.saturating_sub(1),
            TagEnd::Link => {
                if let Some(url) = self.links.pop() {
                    self.write(&format!(" ({url})"), Style::new().dimmed());
                }
            }
            _ => {}
        }
    }

    fn style(&self) -> Style {
        let mut style = Style::new();
        if self.code_block {
            return style.green();
        }
        if self.heading {
            style = style.bold().bright_cyan();
        }
        if self.strong > 0 {
            style = style.bold();
        }
        if self.emphasis > 0 {
            style = style.italic();
        }
        if self.strike > 0 {
            style = style.strikethrough();
        }
        if !self.links.is_empty() {
            style = style.underline().blue();
        }
        if self.quote_depth > 0 {
            style = style.dimmed();
        }
        style
    }

    /// Writes text, putting the block quote bar in front of every new line.
    fn write(&mut self, text: &str, style: Style) {
        for (i, line) in text.split('\n').enumerate() {
            if i > 0 {
                self.out.push('\n');
                self.at_line_start = true;
            }
            if line.is_empty() {
                continue;
            }
            if self.at_line_start {
                for _ in 0..self.quote_depth {
                    let _ = write!(self.out, "{} ", "│".dimmed());
                }
                self.at_line_start = false;
            }
            let _ = write!(self.out, "{}", line.style(style));
        }
    }

    fn newline(&mut self) {
        if !self.out.is_empty() && !self.at_line_start {
            self.out.push('\n');
            self.at_line_start = true;
        }
    }

    fn end_block(&mut self) {
        self.newline();
        if !self.out.is_empty() && !self.out.ends_with("\n\n") {
            self.out.push('\n');
        }
    }
}
