//! Terminal theme & spinner helpers.
//!
//! Respects the `NO_COLOR` env-var and the `--no-color` flag.
//!
//! | Token     | Hex       | Usage                         |
//! |-----------|-----------|-------------------------------|
//! | prompt    | `#4C8DFF` | input prompt                  |
//! | assistant | `#2FBF71` | `Chat:` prefix                |
//! | user      | `#38BDF8` | `You:` echo                   |
//! | banner    | `#22D3EE` | welcome box                   |
//! | warn      | `#FFB020` | warnings                      |
//! | error     | `#E23D2D` | fatal errors                  |
//! | muted     | `#8B8B8B` | help text, metadata           |

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

// ── Global color toggle ─────────────────────────────────────────────────────

static COLOR_DISABLED: AtomicBool = AtomicBool::new(false);

pub fn disable_color() {
    COLOR_DISABLED.store(true, Ordering::Relaxed);
    colored::control::set_override(false);
}

/// Call once at startup, after argument parsing.
pub fn init_color(no_color_flag: bool) {
    if no_color_flag
        || std::env::var("NO_COLOR")
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    {
        disable_color();
    }
}

fn is_color() -> bool {
    !COLOR_DISABLED.load(Ordering::Relaxed)
}

pub mod palette {
    pub const PROMPT: (u8, u8, u8) = (0x4C, 0x8D, 0xFF);
    pub const ASSISTANT: (u8, u8, u8) = (0x2F, 0xBF, 0x71);
    pub const USER: (u8, u8, u8) = (0x38, 0xBD, 0xF8);
    pub const BANNER: (u8, u8, u8) = (0x22, 0xD3, 0xEE);
    pub const WARN: (u8, u8, u8) = (0xFF, 0xB0, 0x20);
    pub const ERROR: (u8, u8, u8) = (0xE2, 0x3D, 0x2D);
    pub const MUTED: (u8, u8, u8) = (0x8B, 0x8B, 0x8B);
}

fn apply(text: &str, rgb: (u8, u8, u8)) -> String {
    if is_color() {
        text.truecolor(rgb.0, rgb.1, rgb.2).to_string()
    } else {
        text.to_string()
    }
}

fn apply_bold(text: &str, rgb: (u8, u8, u8)) -> String {
    if is_color() {
        text.truecolor(rgb.0, rgb.1, rgb.2).bold().to_string()
    } else {
        text.to_string()
    }
}

pub fn prompt(text: &str) -> String {
    apply_bold(text, palette::PROMPT)
}

pub fn assistant(text: &str) -> String {
    apply_bold(text, palette::ASSISTANT)
}

pub fn user(text: &str) -> String {
    apply_bold(text, palette::USER)
}

pub fn banner(text: &str) -> String {
    apply(text, palette::BANNER)
}

pub fn warn(text: &str) -> String {
    apply(text, palette::WARN)
}

pub fn error(text: &str) -> String {
    apply(text, palette::ERROR)
}

pub fn muted(text: &str) -> String {
    apply(text, palette::MUTED)
}

pub fn bold(text: &str) -> String {
    if is_color() {
        text.bold().to_string()
    } else {
        text.to_string()
    }
}

// ── Composite icons ─────────────────────────────────────────────────────────

pub fn icon_fail(label: &str) -> String {
    format!("{} {}", error("✗"), label)
}

pub fn icon_warn(label: &str) -> String {
    format!("{} {}", warn("⚠"), label)
}

// ── Spinner ─────────────────────────────────────────────────────────────────

const SPINNER_CHARS: &[&str] = &["◒", "◐", "◓", "◑"];

/// Indeterminate spinner on stderr. Call `.finish_and_clear()` when done.
pub fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let template = if is_color() {
        "{spinner:.green}  {msg}"
    } else {
        "{spinner}  {msg}"
    };
    let style = ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(SPINNER_CHARS);
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

// ── Banner box ──────────────────────────────────────────────────────────────

/// Boxed title lines, padded to the widest display width.
pub fn banner_lines(title: &str) -> Vec<String> {
    use unicode_width::UnicodeWidthStr;

    let display_w = UnicodeWidthStr::width(title);
    let inner = (display_w + 4).max(32);
    let pad = inner - display_w;
    let left = pad / 2;
    let right = pad - left;
    vec![
        format!("╭{}╮", "─".repeat(inner)),
        format!("│{}{}{}│", " ".repeat(left), title, " ".repeat(right)),
        format!("╰{}╯", "─".repeat(inner)),
    ]
}

pub fn print_banner(title: &str) {
    println!();
    for line in banner_lines(title) {
        println!("{}", banner(&line));
    }
    println!();
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_color_output_is_plain() {
        COLOR_DISABLED.store(true, Ordering::Relaxed);
        colored::control::set_override(false);
        assert_eq!(prompt("> "), "> ");
        assert_eq!(assistant("Chat: "), "Chat: ");
        assert_eq!(icon_fail("bad"), "✗ bad");
        assert_eq!(icon_warn("careful"), "⚠ careful");
        colored::control::unset_override();
        COLOR_DISABLED.store(false, Ordering::Relaxed);
    }

    #[test]
    fn banner_is_evenly_boxed() {
        let lines = banner_lines("Chat with Me!");
        assert_eq!(lines.len(), 3);
        let widths: Vec<usize> = lines.iter().map(|l| l.chars().count()).collect();
        assert!(widths.iter().all(|w| *w == widths[0]));
        assert!(lines[1].contains("Chat with Me!"));
    }
}
