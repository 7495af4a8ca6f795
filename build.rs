use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Only the crate's own sources are policed; vendored or reference trees are left alone.
const SOURCE_ROOTS: [&str; 4] = ["sim", "cli", "tests", "benches"];

// Collects every offending line of a single file so the build error lists all of them.
struct ViolationCollector {
    violations: Vec<String>,
    file_path: PathBuf,
    label: &'static str,
    advice: &'static str,
    skip_comments_and_strings: bool,
}

impl ViolationCollector {
    fn new(
        file_path: &Path,
        label: &'static str,
        advice: &'static str,
        skip_comments_and_strings: bool,
    ) -> Self {
        Self {
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
            label,
            advice,
            skip_comments_and_strings,
        }
    }

    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.label,
            file_name
        );

        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", self.advice));

        Some(error_msg)
    }
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        if self.skip_comments_and_strings {
            let is_pure_comment = line_text.trim_start().starts_with("//");
            let mut is_in_string = false;
            if line_text.contains('"') {
                for (i, part) in line_text.split('"').enumerate() {
                    if i % 2 == 1 && part.contains('_') {
                        is_in_string = true;
                        break;
                    }
                }
            }
            if is_pure_comment || is_in_string {
                return Ok(true);
            }
        }

        self.violations.push(format!("{line_number}:{line_text}"));
        Ok(true)
    }
}

fn rust_sources() -> impl Iterator<Item = PathBuf> {
    SOURCE_ROOTS
        .iter()
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.path().to_path_buf())
}

fn scan(
    pattern: &str,
    label: &'static str,
    advice: &'static str,
    skip_comments_and_strings: bool,
) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(pattern)?;
    let mut searcher = Searcher::new();

    for path in rust_sources() {
        let mut collector = ViolationCollector::new(&path, label, advice, skip_comments_and_strings);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message() {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    let checks: [(&str, &'static str, &'static str, bool); 3] = [
        (
            r"\b(_[a-zA-Z0-9_]+)\b",
            "underscore-prefixed variables",
            "Underscore-prefixed variable names are not allowed. Use the variable or remove it.",
            true,
        ),
        (
            r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
            "#[allow(dead_code)] attributes",
            "#[allow(dead_code)] is not allowed. Use the code or remove it.",
            false,
        ),
        (
            r"(//|/\*).*(?:FIXED|CORRECTED|FIXES|CHANGED|MODIFIED|UPDATED)",
            "forbidden comment markers",
            "Comments narrating edits are not allowed. Describe what the code does instead.",
            false,
        ),
    ];

    for (pattern, label, advice, skip) in checks {
        if let Err(e) = scan(pattern, label, advice, skip) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
