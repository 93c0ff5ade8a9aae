//! Compile Errors
//!
//! Syntax and resolution errors bubble up as a `(file, line, message)`
//! triple composed into a single printable line.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("{file}({line}): {message}")]
pub struct CompileError {
    pub file: String,
    pub line: u32,
    pub message: String,
}

impl CompileError {
    pub fn new(file: &str, line: u32, message: &str) -> CompileError {
        CompileError {
            file: file.to_string(),
            line,
            message: message.to_string(),
        }
    }

    /// Attach the file name when it was unknown at the raise site.
    pub fn in_file(mut self, file: &str) -> CompileError {
        if self.file.is_empty() {
            self.file = file.to_string();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_format() {
        let e = CompileError::new("m.fix", 12, "expected ';'");
        assert_eq!(e.to_string(), "m.fix(12): expected ';'");
    }

    #[test]
    fn test_in_file_only_fills_empty() {
        let e = CompileError::new("", 3, "x").in_file("a.fix");
        assert_eq!(e.file, "a.fix");
        let e = CompileError::new("b.fix", 3, "x").in_file("a.fix");
        assert_eq!(e.file, "b.fix");
    }
}
