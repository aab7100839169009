//! Shell quoting for command lines that are handed to `sh -c` or to a remote login shell.

use std::borrow::Cow;
use std::path::Path;

/// Quotes `s` so that a POSIX shell treats it as a single word.
pub fn quote(s: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(s)).into_owned()
}

/// Quotes a path for shell interpolation.
pub fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}
