use std::path::Path;
use std::{fs, io};

use anyhow::{Context as _, Result};

/// Check if a file exists without treating "not found" as an error.
pub fn exists(path: impl AsRef<Path>) -> Result<bool> {
    match fs::metadata(path.as_ref()) {
        Ok(_) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => {
            Err(error).with_context(|| format!("Could not stat file {:?}", path.as_ref()))
        }
    }
}

/// First non-empty line of tool output, for one-line diagnostics.
pub fn first_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_line_skips_blanks() {
        assert_eq!(first_line("\n\n  error: boom\nmore"), "error: boom");
        assert_eq!(first_line(""), "");
        assert_eq!(first_line("   \n\t\n"), "");
    }
}
