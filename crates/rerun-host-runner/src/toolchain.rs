use std::path::{Path, PathBuf};

use rerun_contracts::{CONSOLE_LAUNCHER_PREFIX, DEFAULT_JAVA_VERSION};

/// Where the external compiler and runtime come from, and which language level
/// sources are compiled for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub java_home: Option<PathBuf>,
    pub java_version: u32,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            java_home: None,
            java_version: DEFAULT_JAVA_VERSION,
        }
    }
}

impl Toolchain {
    /// Explicit override first, then a non-empty `JAVA_HOME`, else plain `PATH` lookup.
    pub fn resolve(java_home: Option<PathBuf>, java_version: u32) -> Self {
        let java_home = java_home.or_else(|| {
            std::env::var_os("JAVA_HOME")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        });
        Self {
            java_home,
            java_version,
        }
    }

    fn tool(&self, name: &str) -> PathBuf {
        match &self.java_home {
            Some(home) => home.join("bin").join(name),
            None => PathBuf::from(name),
        }
    }

    pub fn javac(&self) -> PathBuf {
        self.tool("javac")
    }

    pub fn java(&self) -> PathBuf {
        self.tool("java")
    }
}

fn is_console_launcher(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|n| n.starts_with(CONSOLE_LAUNCHER_PREFIX) && n.ends_with(".jar"))
}

fn list_jars(deps_dir: &Path) -> Vec<PathBuf> {
    let Ok(rd) = std::fs::read_dir(deps_dir) else {
        return Vec::new();
    };
    let mut out: Vec<PathBuf> = rd
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "jar"))
        .map(|p| std::path::absolute(&p).unwrap_or(p))
        .collect();
    out.sort();
    out
}

/// Every jar directly in `deps_dir`, sorted, as absolute paths. The console
/// launcher is left out when `exclude_launcher` is set.
pub fn classpath_jars(deps_dir: &Path, exclude_launcher: bool) -> Vec<PathBuf> {
    list_jars(deps_dir)
        .into_iter()
        .filter(|p| !(exclude_launcher && is_console_launcher(p)))
        .collect()
}

pub fn find_console_launcher(deps_dir: &Path) -> Option<PathBuf> {
    list_jars(deps_dir).into_iter().find(|p| is_console_launcher(p))
}

pub fn join_classpath(entries: &[PathBuf]) -> String {
    let sep = if cfg!(windows) { ";" } else { ":" };
    entries
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(sep)
}
