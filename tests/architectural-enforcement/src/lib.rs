//! Architectural Enforcement Integration Tests
//!
//! Source scanners shared by the tests in `tests/`:
//! - No blocking I/O inside async functions
//! - No sleep calls in production code outside throttling
//!
//! The scanners are line based. They resolve the enclosing function by
//! scanning backwards and treat everything after a `#[cfg(test)]` module
//! marker as test code.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["chronicle/core/src", "chronicle/daemon/src"];

/// The workspace root
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// One violation found by a scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File, relative to the workspace root
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// What was found
    pub reason: &'static str,
    /// The offending line, trimmed
    pub code: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.reason,
            self.code
        )
    }
}

/// Kind of function enclosing a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnContext {
    /// `async fn`
    Async,
    /// Plain `fn`
    Sync,
    /// Outside any function
    None,
}

/// A loaded source file
pub struct SourceFile {
    /// Path relative to the workspace root
    pub path: PathBuf,
    lines: Vec<String>,
    /// Index of the first line of the trailing test module, if any
    test_start: Option<usize>,
}

impl SourceFile {
    /// Build from text
    #[must_use]
    pub fn from_text(path: impl Into<PathBuf>, text: &str) -> Self {
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        let test_start = find_test_module(&lines);
        Self {
            path: path.into(),
            lines,
            test_start,
        }
    }

    /// Number of lines
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the file is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Code on line `idx` with any line comment removed
    #[must_use]
    pub fn code(&self, idx: usize) -> &str {
        let line = &self.lines[idx];
        let trimmed = line.trim_start();
        if trimmed.starts_with("//") {
            return "";
        }
        line.split(" //").next().unwrap_or(line)
    }

    /// The raw line, trimmed
    #[must_use]
    pub fn raw(&self, idx: usize) -> &str {
        self.lines[idx].trim()
    }

    /// Whether line `idx` is test code
    #[must_use]
    pub fn is_test(&self, idx: usize) -> bool {
        if self.test_start.is_some_and(|start| idx >= start) {
            return true;
        }
        match self.enclosing_fn(idx) {
            Some(fn_idx) => self.has_test_attribute(fn_idx),
            None => false,
        }
    }

    /// Kind of function enclosing line `idx`
    #[must_use]
    pub fn fn_context(&self, idx: usize) -> FnContext {
        match self.enclosing_fn(idx).and_then(|i| fn_kind(&self.lines[i])) {
            Some(true) => FnContext::Async,
            Some(false) => FnContext::Sync,
            None => FnContext::None,
        }
    }

    /// Whether any of the `window` lines before `idx` contains `needle`
    #[must_use]
    pub fn context_contains(&self, idx: usize, window: usize, needle: &str) -> bool {
        let start = idx.saturating_sub(window);
        self.lines[start..=idx].iter().any(|l| l.contains(needle))
    }

    fn enclosing_fn(&self, idx: usize) -> Option<usize> {
        for i in (0..=idx).rev() {
            if fn_kind(&self.lines[i]).is_some() {
                return Some(i);
            }
            let line = self.lines[i].trim_start();
            if line.starts_with("mod ") || (line.starts_with("impl") && line.contains('{')) {
                return None;
            }
        }
        None
    }

    fn has_test_attribute(&self, fn_idx: usize) -> bool {
        for i in (0..fn_idx).rev() {
            let line = self.lines[i].trim();
            if line.starts_with("#[test]") || line.starts_with("#[tokio::test") {
                return true;
            }
            if !line.starts_with("#[") && !line.starts_with("///") {
                return false;
            }
        }
        false
    }
}

/// `Some(is_async)` when `line` opens a function
#[must_use]
pub fn fn_kind(line: &str) -> Option<bool> {
    let mut rest = line.trim_start();
    for prefix in ["pub(crate) ", "pub(super) ", "pub ", "const ", "unsafe "] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
        }
    }
    if rest.starts_with("async fn ") {
        Some(true)
    } else if rest.starts_with("fn ") {
        Some(false)
    } else {
        None
    }
}

fn find_test_module(lines: &[String]) -> Option<usize> {
    lines.iter().enumerate().find_map(|(i, line)| {
        if line.trim() != "#[cfg(test)]" {
            return None;
        }
        let next = lines[i + 1..].iter().find(|l| !l.trim().is_empty())?;
        next.trim_start().starts_with("mod ").then_some(i)
    })
}

/// Load every `.rs` file under the production directories
#[must_use]
pub fn production_sources() -> Vec<SourceFile> {
    let root = workspace_root();
    let mut files = Vec::new();
    for dir in PRODUCTION_DIRS {
        let base = root.join(dir);
        for entry in walkdir::WalkDir::new(&base)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        {
            let Ok(text) = fs::read_to_string(entry.path()) else {
                continue;
            };
            let relative = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_path_buf();
            files.push(SourceFile::from_text(relative, &text));
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(lines: &[&str]) -> SourceFile {
        SourceFile::from_text("x.rs", &lines.join("\n"))
    }

    #[test]
    fn test_async_function_detection() {
        let src = file(&[
            "pub async fn bad_function() {",
            "    let contents = std::fs::read_to_string(\"file.txt\")?;",
            "}",
        ]);
        assert_eq!(src.fn_context(1), FnContext::Async);
        assert!(!src.is_test(1));
    }

    #[test]
    fn test_sync_function_detection() {
        let src = file(&[
            "impl Foo {",
            "    pub(crate) fn load() {",
            "        let contents = std::fs::read_to_string(\"config.toml\")?;",
            "    }",
            "}",
        ]);
        assert_eq!(src.fn_context(2), FnContext::Sync);
    }

    #[test]
    fn test_test_module_detection() {
        let src = file(&[
            "fn prod() {}",
            "",
            "#[cfg(test)]",
            "mod tests {",
            "    async fn helper() {",
            "        std::fs::write(\"a\", \"b\").unwrap();",
            "    }",
            "}",
        ]);
        assert!(!src.is_test(0));
        assert!(src.is_test(5));
    }

    #[test]
    fn test_test_attribute_detection() {
        let src = file(&[
            "#[tokio::test]",
            "async fn test_something() {",
            "    let contents = std::fs::read_to_string(\"test.txt\")?;",
            "}",
        ]);
        assert!(src.is_test(2));
    }

    #[test]
    fn test_comments_are_ignored() {
        let src = file(&["    // std::fs::read", "    let x = 1; // std::fs::read"]);
        assert_eq!(src.code(0), "");
        assert!(!src.code(1).contains("std::fs"));
    }

    #[test]
    fn test_workspace_root_holds_production_dirs() {
        let root = workspace_root();
        for dir in PRODUCTION_DIRS {
            assert!(root.join(dir).is_dir(), "{dir} missing under {}", root.display());
        }
    }
}
