// src/ui.rs

use std::io::IsTerminal;

const CYAN: &str = "36";
const GREEN: &str = "32";
const YELLOW: &str = "33";
const RED: &str = "31";

/// Operator-facing status lines on stderr.
#[derive(Debug, Clone, Copy)]
pub struct Console {
    use_color: bool,
}

impl Console {
    pub fn detect() -> Self {
        Self {
            use_color: should_use_color(),
        }
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        eprintln!("{}", self.line("[INFO]", CYAN, msg.as_ref()));
    }

    pub fn success(&self, msg: impl AsRef<str>) {
        eprintln!("{}", self.line("[SUCCESS]", GREEN, msg.as_ref()));
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        eprintln!("{}", self.line("[WARN]", YELLOW, msg.as_ref()));
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        eprintln!("{}", self.line("[ERROR]", RED, msg.as_ref()));
    }

    fn line(&self, tag: &str, color: &str, msg: &str) -> String {
        format!("{} {}", paint(tag, color, self.use_color), msg)
    }
}

fn should_use_color() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    std::io::stderr().is_terminal()
}

fn paint(text: &str, color: &str, use_color: bool) -> String {
    if use_color {
        format!("\x1b[{}m{}\x1b[0m", color, text)
    } else {
        text.to_string()
    }
}
