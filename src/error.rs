use std::fmt::{self, Display, Formatter};

/// A runtime failure carrying the exception name shown in tracebacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub name: &'static str,
    pub message: String,
}

impl RuntimeError {
    pub fn new(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            message: message.into(),
        }
    }
}

impl Display for RuntimeError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// The three-line traceback printed for lex and parse errors.
pub fn format_syntax_error(
    file: &str,
    line: usize,
    context: &str,
    kind: &str,
    message: &str,
) -> String {
    format!(
        "Traceback (most recent call last):\n  File \"{}\", line {}, at '{}'\n{}: {}",
        file, line, context, kind, message
    )
}

pub fn report_syntax_error(file: &str, line: usize, context: &str, kind: &str, message: &str) {
    eprintln!("{}", format_syntax_error(file, line, context, kind, message));
}

/// One frame entry of a runtime traceback.
pub fn format_traceback_line(line: usize, file: &str) -> String {
    format!("  [line {} in {}]", line, file)
}
