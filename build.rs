use std::path::{Path, PathBuf};
use std::process::Command;

const MAX_LINES: usize = 750;

const CHECKED_EXTENSIONS: &[&str] = &["rs", "md", "yaml", "toml"];

const EXCLUDED_DIRS: &[&str] = &["target", ".git", "examples"];

const EXCLUDED_FILES: &[&str] = &["Cargo.lock"];

type Violations = Vec<(PathBuf, Vec<(usize, String)>)>;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads/main");
    println!("cargo:rerun-if-changed=.git/packed-refs");

    let sha = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .and_then(|output| {
            if output.status.success() {
                String::from_utf8(output.stdout)
                    .ok()
                    .map(|s| s.trim().to_string())
            } else {
                None
            }
        })
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=WP_SYNC_GIT_SHA={}", sha);

    let root = PathBuf::from(
        std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR must be set"),
    );
    let files = collect_files_to_check(&root);
    for file in &files {
        println!("cargo:rerun-if-changed={}", file.display());
    }
    let rust_files: Vec<PathBuf> = files
        .iter()
        .filter(|p| {
            p.extension().and_then(|e| e.to_str()) == Some("rs")
                && p.file_name().and_then(|n| n.to_str()) != Some("build.rs")
        })
        .cloned()
        .collect();

    enforce_line_limits(&root, &files);
    enforce_no_dead_code_allows(&root, &rust_files);
    enforce_no_test_skips(&root, &rust_files);
    enforce_serial_for_env_mutations(&root, &rust_files);
}

fn enforce_line_limits(root: &Path, files: &[PathBuf]) {
    let mut violations = Vec::new();
    for file in files {
        match std::fs::read_to_string(file) {
            Ok(content) => {
                let line_count = content.lines().filter(|l| !l.trim().is_empty()).count();
                if line_count > MAX_LINES {
                    violations.push((relative(root, file), line_count));
                }
            }
            Err(e) => println!(
                "cargo:warning=Could not read file {}: {}",
                relative(root, file).display(),
                e
            ),
        }
    }

    if !violations.is_empty() {
        eprintln!("\n========================================");
        eprintln!("FILE LINE LIMIT EXCEEDED (max {} lines)", MAX_LINES);
        eprintln!("========================================");
        for (path, lines) in &violations {
            eprintln!(
                "  {} - {} lines (exceeds by {})",
                path.display(),
                lines,
                lines - MAX_LINES
            );
        }
        eprintln!("========================================\n");
        eprintln!("Please split these files into smaller modules.\n");
        panic!(
            "Build failed: {} file(s) exceed the {} line limit",
            violations.len(),
            MAX_LINES
        );
    }
}

fn collect_files_to_check(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    if let Ok(output) = Command::new("git")
        .args(["ls-files"])
        .current_dir(root)
        .output()
    {
        if output.status.success() {
            if let Ok(stdout) = String::from_utf8(output.stdout) {
                for line in stdout.lines() {
                    let path = root.join(line);
                    if should_check_file(&path, root) {
                        files.push(path);
                    }
                }
                return files;
            }
        }
    }

    walk_directory(root, root, &mut files);
    files
}

fn walk_directory(dir: &Path, root: &Path, files: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if EXCLUDED_DIRS.contains(&name) {
                    continue;
                }
            }
            walk_directory(&path, root, files);
        } else if should_check_file(&path, root) {
            files.push(path);
        }
    }
}

fn should_check_file(path: &Path, root: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    if !CHECKED_EXTENSIONS.contains(&ext) {
        return false;
    }

    if let Ok(rel_path) = path.strip_prefix(root) {
        let rel_str = rel_path.to_string_lossy();
        if EXCLUDED_FILES.iter().any(|excluded| rel_str == *excluded) {
            return false;
        }
        for component in rel_path.components() {
            if let Some(name) = component.as_os_str().to_str() {
                if EXCLUDED_DIRS.contains(&name) {
                    return false;
                }
            }
        }
    }

    true
}

fn relative(root: &Path, file: &Path) -> PathBuf {
    file.strip_prefix(root).unwrap_or(file).to_path_buf()
}

fn report(title: &str, violations: &Violations, advice: &[&str], summary: String) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n========================================");
    eprintln!("{}", title);
    eprintln!("========================================");
    eprintln!();
    for (path, lines) in violations {
        for (line_num, message) in lines {
            eprintln!("  {}:{}", path.display(), line_num);
            eprintln!("    {}", message.trim());
            eprintln!();
        }
    }
    eprintln!("========================================");
    for line in advice {
        eprintln!("{}", line);
    }
    eprintln!("========================================\n");
    panic!("{}", summary);
}

fn enforce_no_dead_code_allows(root: &Path, rust_files: &[PathBuf]) {
    let mut violations: Violations = Vec::new();

    for file in rust_files {
        let Ok(content) = std::fs::read_to_string(file) else {
            continue;
        };
        let file_violations: Vec<(usize, String)> = content
            .lines()
            .enumerate()
            .filter(|(_, line)| {
                let trimmed = line.trim();
                (trimmed.starts_with("#[allow(") || trimmed.starts_with("#![allow("))
                    && trimmed.contains("dead_code")
            })
            .map(|(i, line)| (i + 1, line.to_string()))
            .collect();
        if !file_violations.is_empty() {
            violations.push((relative(root, file), file_violations));
        }
    }

    let total: usize = violations.iter().map(|(_, v)| v.len()).sum();
    report(
        "#[allow(dead_code)] IS NOT ALLOWED",
        &violations,
        &[
            "Do NOT use #[allow(dead_code)] to silence warnings.",
            "  - DELETE unused code entirely",
            "  - If the code is for tests, use #[cfg(test)]",
        ],
        format!(
            "Build failed: {} #[allow(dead_code)] occurrence(s) found. Remove the dead code.",
            total
        ),
    );
}

/// A test function body located by a line scan.
struct TestFn {
    start: usize,
    name: String,
    serial: bool,
    lines: Vec<(i32, String)>,
}

/// Splits a file into its `#[test]`/`#[tokio::test]` bodies by brace depth.
fn test_functions(content: &str) -> Vec<TestFn> {
    let lines: Vec<&str> = content.lines().collect();
    let mut tests = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let trimmed = lines[i].trim();
        if trimmed != "#[test]" && !trimmed.starts_with("#[tokio::test") {
            i += 1;
            continue;
        }

        let start = i + 1;
        let mut serial = i > 0 && lines[i - 1].trim().contains("serial");
        let mut j = i + 1;
        while j < lines.len() && !lines[j].contains("fn ") {
            if lines[j].trim().contains("serial") {
                serial = true;
            }
            j += 1;
        }
        let name = lines
            .get(j)
            .and_then(|line| line.split_once("fn "))
            .and_then(|(_, rest)| rest.split_once('('))
            .map(|(name, _)| name.trim().to_string())
            .unwrap_or_default();

        let mut depth = 0i32;
        let mut body = Vec::new();
        let mut k = j;
        while k < lines.len() {
            body.push((depth, lines[k].to_string()));
            for c in lines[k].chars() {
                match c {
                    '{' => depth += 1,
                    '}' => depth -= 1,
                    _ => {}
                }
            }
            k += 1;
            if depth == 0 && body.iter().any(|(_, l)| l.contains('{')) {
                break;
            }
        }

        tests.push(TestFn {
            start,
            name,
            serial,
            lines: body,
        });
        i = k;
    }

    tests
}

/// Bans tests that silently skip instead of failing.
///
/// If a test can't run, it should FAIL, not silently pass.
fn enforce_no_test_skips(root: &Path, rust_files: &[PathBuf]) {
    let skip_patterns = ["Skipping test", "skipping test", "Test skipped", "test skipped"];
    let mut violations: Violations = Vec::new();

    for file in rust_files {
        let Ok(content) = std::fs::read_to_string(file) else {
            continue;
        };
        let mut file_violations = Vec::new();
        for test in test_functions(&content) {
            let skip = test.lines.iter().find_map(|(depth, line)| {
                if let Some(pattern) = skip_patterns.iter().find(|p| line.contains(*p)) {
                    Some(format!("contains skip pattern: {}", pattern))
                } else if line.trim() == "return;" && *depth > 1 {
                    Some("has conditional early return (silent skip)".to_string())
                } else {
                    None
                }
            });
            if let Some(reason) = skip {
                file_violations.push((test.start, format!("test `{}` {}", test.name, reason)));
            }
        }
        if !file_violations.is_empty() {
            violations.push((relative(root, file), file_violations));
        }
    }

    let total: usize = violations.iter().map(|(_, v)| v.len()).sum();
    report(
        "SILENT TEST SKIPS ARE NOT ALLOWED",
        &violations,
        &[
            "Tests must FAIL if they cannot run, not silently pass.",
            "  - Use assert!() to verify preconditions",
            "  - If truly optional, use #[ignore] with a reason",
        ],
        format!(
            "Build failed: {} silent test skip(s) found. Make tests fail instead of skip.",
            total
        ),
    );
}

/// Requires #[serial] for tests that mutate environment variables.
///
/// Environment variables are global state. Tests that modify them without
/// #[serial] cause flaky failures when running in parallel.
fn enforce_serial_for_env_mutations(root: &Path, rust_files: &[PathBuf]) {
    let mut violations: Violations = Vec::new();

    for file in rust_files {
        let Ok(content) = std::fs::read_to_string(file) else {
            continue;
        };
        let mut file_violations = Vec::new();
        for test in test_functions(&content) {
            let mutates = test.lines.iter().any(|(_, line)| {
                let trimmed = line.trim();
                !trimmed.starts_with("//")
                    && (trimmed.contains("env::set_var") || trimmed.contains("env::remove_var"))
            });
            if mutates && !test.serial {
                file_violations.push((
                    test.start,
                    format!("test `{}` mutates env without #[serial]", test.name),
                ));
            }
        }
        if !file_violations.is_empty() {
            violations.push((relative(root, file), file_violations));
        }
    }

    let total: usize = violations.iter().map(|(_, v)| v.len()).sum();
    report(
        "ENV MUTATIONS REQUIRE #[serial]",
        &violations,
        &[
            "Add #[serial] from the serial_test crate:",
            "",
            "    #[test]",
            "    #[serial]",
            "    fn test_with_env_var() { ... }",
        ],
        format!(
            "Build failed: {} test(s) mutate env vars without #[serial].",
            total
        ),
    );
}
