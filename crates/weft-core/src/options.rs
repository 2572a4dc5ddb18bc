//! Kernel build options: preprocessor defines and include paths.

use std::fmt::{self, Display, Write as _};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Defines and include paths consumed when a kernel is built.
///
/// Entries are kept in insertion order and never deduplicated; conflicting
/// defines are resolved by the native compiler. A build call takes its own
/// copy, so later edits never reach an already-built kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelBuildOptions {
    defines: Vec<(String, String)>,
    includes: Vec<PathBuf>,
}

impl KernelBuildOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `#define macro value`. The value is rendered with `Display`.
    pub fn add_define(&mut self, macro_name: impl Into<String>, value: impl Display) -> &mut Self {
        self.defines.push((macro_name.into(), value.to_string()));
        self
    }

    pub fn add_include(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.includes.push(path.into());
        self
    }

    /// Builder-style [`KernelBuildOptions::add_define`].
    pub fn define(mut self, macro_name: impl Into<String>, value: impl Display) -> Self {
        self.add_define(macro_name, value);
        self
    }

    /// Builder-style [`KernelBuildOptions::add_include`].
    pub fn include(mut self, path: impl Into<PathBuf>) -> Self {
        self.add_include(path);
        self
    }

    pub fn defines(&self) -> &[(String, String)] {
        &self.defines
    }

    pub fn includes(&self) -> &[PathBuf] {
        &self.includes
    }

    /// Last value given for `macro_name`, which is what a C preprocessor
    /// would see after redefinition.
    pub fn define_value(&self, macro_name: &str) -> Option<&str> {
        self.defines
            .iter()
            .rev()
            .find(|(k, _)| k == macro_name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.defines.is_empty() && self.includes.is_empty()
    }

    /// Source prelude with one `#define` line per entry.
    pub fn header(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.defines {
            let _ = writeln!(out, "#define {k} {v}");
        }
        out
    }

    /// Compiler command-line fragments (`-I<path>` for each include).
    pub fn include_flags(&self) -> Vec<String> {
        self.includes
            .iter()
            .map(|p| format!("-I{}", p.display()))
            .collect()
    }

    /// Include paths that do not exist on disk.
    pub fn missing_includes(&self) -> Vec<&Path> {
        self.includes
            .iter()
            .map(PathBuf::as_path)
            .filter(|p| !p.exists())
            .collect()
    }
}

impl fmt::Display for KernelBuildOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.header())?;
        for flag in self.include_flags() {
            writeln!(f, "{flag}")?;
        }
        Ok(())
    }
}
