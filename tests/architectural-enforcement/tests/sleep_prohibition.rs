//! Integration Test: Sleep Prohibition
//!
//! **Policy**: production code MUST NOT sleep to wait for events.
//! **Exception**: the envelope rate limiter, whose throttle delay is the
//! point of the component.

use architectural_enforcement::{production_sources, SourceFile, Violation};

/// Files allowed to sleep, relative to the workspace root
const THROTTLE_FILES: &[&str] = &["chronicle/core/src/transport/rate_limit.rs"];

#[test]
fn test_no_sleep_in_production_code() {
    let violations: Vec<Violation> = production_sources()
        .iter()
        .filter(|src| !THROTTLE_FILES.iter().any(|f| src.path.ends_with(f)))
        .flat_map(find_sleeps)
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ ACCEPTABLE alternatives:");
        eprintln!("  - tokio::time::timeout() around the awaited operation");
        eprintln!("  - tokio::time::interval() for periodic work");
        eprintln!("  - CancellationToken / channels for coordination");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}

#[test]
fn test_scanner_ignores_sleep_in_tests() {
    let src = SourceFile::from_text(
        "x.rs",
        concat!(
            "fn prod() {}\n\n#[cfg(test)]\nmod tests {\n",
            "    async fn wait() {\n        tokio::time::sleep(d).await;\n    }\n}\n",
        ),
    );
    assert!(find_sleeps(&src).is_empty());

    let src = SourceFile::from_text(
        "y.rs",
        "async fn poll() {\n    tokio::time::sleep(d).await;\n}\n",
    );
    assert_eq!(find_sleeps(&src).len(), 1);
}

fn find_sleeps(src: &SourceFile) -> Vec<Violation> {
    (0..src.len())
        .filter(|&idx| {
            let code = src.code(idx);
            (code.contains("::sleep(") || code.contains(".sleep(")) && !src.is_test(idx)
        })
        .map(|idx| Violation {
            path: src.path.clone(),
            line: idx + 1,
            reason: "Sleep call",
            code: src.raw(idx).to_string(),
        })
        .collect()
}
