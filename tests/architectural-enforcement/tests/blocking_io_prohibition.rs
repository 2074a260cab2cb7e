//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: async functions in the core library and the daemon MUST NOT
//! use blocking I/O.
//! **Required**: `tokio::fs`, `tokio::net`, `tokio::process`.
//!
//! Blocking calls are acceptable in plain functions (configuration loading,
//! PID files before the server starts) and in test code.

use architectural_enforcement::{production_sources, FnContext, SourceFile, Violation};

/// Types under `std::fs` that perform no I/O themselves
const NON_IO_FS_ITEMS: &[&str] = &[
    "std::fs::Permissions",
    "std::fs::Metadata",
    "std::fs::FileType",
];

#[test]
fn test_no_blocking_io_in_async_functions() {
    let violations: Vec<Violation> = production_sources()
        .iter()
        .flat_map(find_blocking_io)
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ Blocking I/O calls found in async functions!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ REQUIRED async I/O:");
        eprintln!("  - tokio::fs::read().await, tokio::fs::write().await");
        eprintln!("  - tokio::net::UnixListener::bind()");
        eprintln!("  - tokio::process::Command::spawn()");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.",
            violations.len()
        );
    }
}

#[test]
fn test_scanner_flags_blocking_read_in_async_fn() {
    let src = SourceFile::from_text(
        "bad.rs",
        "async fn load() {\n    let s = std::fs::read_to_string(\"x\");\n}\n",
    );
    let found = find_blocking_io(&src);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].line, 2);
}

#[test]
fn test_scanner_allows_permission_types() {
    let src = SourceFile::from_text(
        "ok.rs",
        "async fn run() {\n    let p = std::fs::Permissions::from_mode(0o600);\n}\n",
    );
    assert!(find_blocking_io(&src).is_empty());
}

fn find_blocking_io(src: &SourceFile) -> Vec<Violation> {
    let mut violations = Vec::new();
    for idx in 0..src.len() {
        let code = src.code(idx);
        if code.is_empty() || src.is_test(idx) || src.fn_context(idx) != FnContext::Async {
            continue;
        }

        let reason = if code.contains("std::fs::")
            && !NON_IO_FS_ITEMS.iter().any(|item| code.contains(item))
        {
            Some("Blocking file I/O")
        } else if code.contains("std::net::") {
            Some("Blocking network I/O")
        } else if code.contains("std::process::Command") {
            Some("Blocking process I/O")
        } else if code.contains("std::io::stdin()") || code.contains("std::io::stdout()") {
            Some("Blocking stdin/stdout in async")
        } else {
            None
        };

        if let Some(reason) = reason {
            violations.push(Violation {
                path: src.path.clone(),
                line: idx + 1,
                reason,
                code: src.raw(idx).to_string(),
            });
        }
    }
    violations
}
