use std::{
    borrow::Cow,
    fmt, io,
    path::{Path, PathBuf},
    str::Utf8Error,
};

/// The Python exception CPython would raise for source that fails to compile here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum CompileErrorKind {
    /// The source is not valid Python, or breaks a rule the compiler enforces
    /// (`'return' outside function`, `'break' outside loop`, ...).
    SyntaxError,
    /// Valid Python that this compiler does not lower (`async def`, `match`, `yield from`, ...).
    NotImplementedError,
}

/// Error raised while parsing or compiling source code.
///
/// Displays like the `str()` of a Python `SyntaxError`: the message followed by the file name
/// and line number in parentheses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    kind: CompileErrorKind,
    message: Cow<'static, str>,
    line: u32,
    filename: Option<String>,
}

impl CompileError {
    pub(crate) fn syntax(message: impl Into<Cow<'static, str>>, line: u32) -> Self {
        Self {
            kind: CompileErrorKind::SyntaxError,
            message: message.into(),
            line,
            filename: None,
        }
    }

    /// Error for syntax this compiler deliberately does not lower.
    pub(crate) fn not_implemented(construct: &str, line: u32) -> Self {
        Self {
            kind: CompileErrorKind::NotImplementedError,
            message: format!("{construct} is not supported by the linedis compiler").into(),
            line,
            filename: None,
        }
    }

    /// Attaches the file name shown in the message.
    #[must_use]
    pub(crate) fn in_file(mut self, filename: &str) -> Self {
        self.filename = Some(filename.to_owned());
        self
    }

    #[must_use]
    pub fn kind(&self) -> CompileErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 1-based line the error was reported on.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filename {
            Some(filename) => write!(f, "{} ({filename}, line {})", self.message, self.line),
            None => write!(f, "{} (line {})", self.message, self.line),
        }
    }
}

impl std::error::Error for CompileError {}

/// Everything that can stop a report from being produced.
#[derive(Debug)]
pub enum ReportError {
    /// The input path does not name a readable file.
    FileNotFound { path: PathBuf },
    /// The file was read but is not valid UTF-8.
    Decode { path: PathBuf, error: Utf8Error },
    /// Any other I/O failure while reading the input.
    Io { path: PathBuf, error: io::Error },
    /// The source failed to parse or compile.
    Compile(CompileError),
    /// Writing into the report buffer failed.
    Format(fmt::Error),
}

impl ReportError {
    pub(crate) fn io(path: &Path, error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::IsADirectory | io::ErrorKind::PermissionDenied => {
                Self::FileNotFound {
                    path: path.to_path_buf(),
                }
            }
            _ => Self::Io {
                path: path.to_path_buf(),
                error,
            },
        }
    }
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileNotFound { path } => write!(f, "File '{}' not found.", path.display()),
            Self::Decode { path, error } => {
                write!(f, "'utf-8' codec can't decode {}: {error}", path.display())
            }
            Self::Io { path, error } => write!(f, "reading {}: {error}", path.display()),
            Self::Compile(error) => write!(f, "{error}"),
            Self::Format(error) => write!(f, "writing report: {error}"),
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::FileNotFound { .. } => None,
            Self::Decode { error, .. } => Some(error),
            Self::Io { error, .. } => Some(error),
            Self::Compile(error) => Some(error),
            Self::Format(error) => Some(error),
        }
    }
}

impl From<CompileError> for ReportError {
    fn from(error: CompileError) -> Self {
        Self::Compile(error)
    }
}

impl From<fmt::Error> for ReportError {
    fn from(error: fmt::Error) -> Self {
        Self::Format(error)
    }
}
