//! Data-directory resolution.
//!
//! Resolution order: `CLAUDE_MEM_DATA_DIR` env override, then the XDG data
//! home (`$XDG_DATA_HOME/claude-mem` or `~/.local/share/claude-mem`), then
//! the legacy dot-directory `~/.claude-mem` if it already exists.

use std::path::{Path, PathBuf};

/// Filesystem layout under the data directory.
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolve the data directory without creating it.
    pub fn resolve(env_override: Option<&str>) -> Self {
        if let Some(dir) = env_override.filter(|s| !s.is_empty()) {
            return Self::new(PathBuf::from(dir));
        }

        // A pre-existing legacy directory wins over a fresh XDG path so that
        // upgrades keep reading the same database.
        if let Some(home) = dirs::home_dir() {
            let legacy = home.join(".claude-mem");
            if legacy.is_dir() {
                return Self::new(legacy);
            }
        }

        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join("claude-mem"))
    }

    /// Create the directory tree (root + logs/ + chroma/).
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.chroma_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join("claude-mem.db")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn chroma_dir(&self) -> PathBuf {
        self.root.join("chroma")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join("settings.json")
    }

    pub fn env_file_path(&self) -> PathBuf {
        self.root.join(".env")
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.root.join("worker.pid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_wins() {
        let dir = DataDir::resolve(Some("/tmp/cm-test"));
        assert_eq!(dir.root(), Path::new("/tmp/cm-test"));
    }

    #[test]
    fn empty_override_is_ignored() {
        let dir = DataDir::resolve(Some(""));
        assert_ne!(dir.root(), Path::new(""));
    }

    #[test]
    fn layout_paths() {
        let dir = DataDir::new(PathBuf::from("/data/claude-mem"));
        assert_eq!(
            dir.database_path(),
            Path::new("/data/claude-mem/claude-mem.db")
        );
        assert_eq!(dir.pid_file_path(), Path::new("/data/claude-mem/worker.pid"));
        assert_eq!(dir.logs_dir(), Path::new("/data/claude-mem/logs"));
    }
}
