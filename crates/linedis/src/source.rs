//! Loading of the Python file a report is generated for.

use std::{fs, path::Path};

use crate::error::ReportError;

const UTF8_BOM: &str = "\u{feff}";

/// Source text split into lines, each keeping its terminator.
///
/// Line numbers are 1-based like the compiler's line table.
#[derive(Debug, Clone, Default)]
pub struct SourceFile {
    text: String,
    /// Byte range of each line within `text`.
    lines: Vec<(usize, usize)>,
}

impl SourceFile {
    /// Reads and decodes the file at `path`.
    ///
    /// # Errors
    /// `ReportError::FileNotFound` when the path cannot be opened as a file, `ReportError::Decode`
    /// when it is not valid UTF-8 and `ReportError::Io` for any other read failure.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReportError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|error| ReportError::io(path, error))?;
        let text = String::from_utf8(bytes).map_err(|error| ReportError::Decode {
            path: path.to_path_buf(),
            error: error.utf8_error(),
        })?;
        let source = Self::from_text(text);
        tracing::debug!(path = %path.display(), lines = source.len(), "loaded source");
        Ok(source)
    }

    /// Wraps source text that is already in memory.
    pub fn from_text(text: impl Into<String>) -> Self {
        let mut text = text.into();
        if text.starts_with(UTF8_BOM) {
            text.drain(..UTF8_BOM.len());
        }
        let mut lines = Vec::new();
        let mut start = 0;
        for (index, _) in text.match_indices('\n') {
            lines.push((start, index + 1));
            start = index + 1;
        }
        if start < text.len() {
            lines.push((start, text.len()));
        }
        Self { text, lines }
    }

    /// Line `number` with its terminator, `None` outside `1..=len()`.
    #[must_use]
    pub fn line(&self, number: u32) -> Option<&str> {
        let index = usize::try_from(number).ok()?.checked_sub(1)?;
        let &(start, end) = self.lines.get(index)?;
        Some(&self.text[start..end])
    }

    /// Line `number` without trailing whitespace, as shown in the report.
    #[must_use]
    pub fn trimmed_line(&self, number: u32) -> Option<&str> {
        self.line(number).map(str::trim_end)
    }

    /// Number of lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The whole source, as handed to the compiler.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Line numbers paired with their trimmed text, in order.
    pub fn numbered_lines(&self) -> impl Iterator<Item = (u32, &str)> + '_ {
        (1..).zip(self.lines.iter().map(|&(start, end)| self.text[start..end].trim_end()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_keep_terminators() {
        let source = SourceFile::from_text("a = 1\r\n\nb = 2");
        assert_eq!(source.len(), 3);
        assert_eq!(source.line(1), Some("a = 1\r\n"));
        assert_eq!(source.line(2), Some("\n"));
        assert_eq!(source.line(3), Some("b = 2"));
        assert_eq!(source.trimmed_line(1), Some("a = 1"));
    }

    #[test]
    fn out_of_range_lines_are_none() {
        let source = SourceFile::from_text("x\n");
        assert_eq!(source.line(0), None);
        assert_eq!(source.line(2), None);
        assert_eq!(source.len(), 1);
    }

    #[test]
    fn bom_is_stripped() {
        let source = SourceFile::from_text("\u{feff}x = 1\n");
        assert_eq!(source.text(), "x = 1\n");
    }

    #[test]
    fn empty_source_has_no_lines() {
        let source = SourceFile::from_text("");
        assert!(source.is_empty());
        assert_eq!(source.numbered_lines().count(), 0);
    }

    #[test]
    fn missing_file_is_reported() {
        let error = SourceFile::load("definitely/not/here.py").unwrap_err();
        assert!(matches!(error, ReportError::FileNotFound { .. }));
    }
}
