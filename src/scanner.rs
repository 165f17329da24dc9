use crate::error::{PipelineError, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use log::{debug, warn};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Directories never descended into: dependencies, build output and VCS metadata.
const BUILTIN_IGNORED_DIRS: &[&str] = &[
    "node_modules",
    "target",
    ".git",
    "vendor",
    "dist",
    "build",
    "__pycache__",
    "venv",
];

/// File scanner for traversing repository directories.
///
/// Walks the root recursively and collects every file whose extension has a
/// registered grammar. Built-in dependency/build directories and hidden
/// directories are skipped, as is anything matching one of the configured
/// ignore globs (matched against the path relative to the root).
///
/// # Example
///
/// ```no_run
/// use openapi_synth::scanner::FileScanner;
/// use std::path::PathBuf;
///
/// let scanner = FileScanner::new(PathBuf::from("./my-project"), &[], &["py".to_string()]).unwrap();
/// let result = scanner.scan().unwrap();
/// println!("Found {} source files", result.files.len());
/// ```
pub struct FileScanner {
    root_path: PathBuf,
    ignore: GlobSet,
    extensions: BTreeSet<String>,
}

/// Result of directory scanning operation.
pub struct ScanResult {
    /// Matching files, sorted
    pub files: Vec<PathBuf>,
    /// Files skipped because no grammar handles their extension
    pub unsupported: usize,
    /// Inaccessible directories or files
    pub warnings: Vec<String>,
}

impl FileScanner {
    /// Creates a scanner for `root_path`.
    ///
    /// Fails with a configuration error if an ignore pattern is not a valid glob.
    pub fn new(root_path: PathBuf, ignore_patterns: &[String], extensions: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in ignore_patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                PipelineError::Config(format!("invalid ignore pattern {:?}: {}", pattern, e))
            })?;
            builder.add(glob);
        }
        let ignore = builder
            .build()
            .map_err(|e| PipelineError::Config(format!("invalid ignore patterns: {}", e)))?;

        Ok(Self {
            root_path,
            ignore,
            extensions: extensions.iter().cloned().collect(),
        })
    }

    pub fn scan(&self) -> Result<ScanResult> {
        if !self.root_path.is_dir() {
            return Err(PipelineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("not a directory: {}", self.root_path.display()),
            )));
        }

        let mut files = Vec::new();
        let mut unsupported = 0;
        let mut warnings = Vec::new();

        let walker = WalkDir::new(&self.root_path)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.path() == self.root_path || !self.is_ignored(e.path(), e.file_type().is_dir()));

        for entry in walker {
            match entry {
                Ok(entry) => {
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let supported = entry
                        .path()
                        .extension()
                        .and_then(|s| s.to_str())
                        .is_some_and(|ext| self.extensions.contains(ext));
                    if supported {
                        files.push(entry.into_path());
                    } else {
                        unsupported += 1;
                    }
                }
                Err(e) => {
                    let warning = format!("Failed to access path: {}", e);
                    warn!("{}", warning);
                    warnings.push(warning);
                }
            }
        }

        files.sort();
        debug!(
            "Scan of {}: {} source files, {} other files",
            self.root_path.display(),
            files.len(),
            unsupported
        );
        Ok(ScanResult {
            files,
            unsupported,
            warnings,
        })
    }

    fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        if is_dir {
            let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            if name.starts_with('.') || BUILTIN_IGNORED_DIRS.contains(&&*name) {
                return true;
            }
        }
        let relative = path.strip_prefix(&self.root_path).unwrap_or(path);
        self.ignore.is_match(relative)
    }
}
