use std::io;
use std::path::{Path, PathBuf};

/// Directory layout under `<root>/data`.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn data_path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root.join("data").join(rel)
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.data_path("raw")
    }

    pub fn preprocessor_path(&self, name: &str) -> PathBuf {
        self.data_path("interim").join(format!("{name}.json"))
    }

    /// `data/log`, or `data/log/<sub>` when `sub` is not empty. Created if
    /// missing.
    pub fn log_dir(&self, sub: &str) -> io::Result<LogDir> {
        let mut dir = self.data_path("log");
        if !sub.is_empty() {
            dir = dir.join(sub);
        }
        std::fs::create_dir_all(&dir)?;
        Ok(LogDir { dir })
    }
}

/// Files produced by one training run.
#[derive(Debug, Clone)]
pub struct LogDir {
    dir: PathBuf,
}

impl LogDir {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join("model.safetensors")
    }

    pub fn model_config_path(&self) -> PathBuf {
        self.dir.join("model.json")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.dir.join("metrics.csv")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_live_under_data() {
        let storage = Storage::new("/tmp/wikilm_root");
        assert_eq!(storage.raw_dir(), PathBuf::from("/tmp/wikilm_root/data/raw"));
        assert_eq!(
            storage.preprocessor_path("preprocessor"),
            PathBuf::from("/tmp/wikilm_root/data/interim/preprocessor.json")
        );
    }

    #[test]
    fn log_dir_is_created() {
        let root = std::env::temp_dir().join("wikilm_storage_test");
        let _ = std::fs::remove_dir_all(&root);
        let storage = Storage::new(&root);
        let log = storage.log_dir("run1").unwrap();
        assert!(log.path().is_dir());
        assert_eq!(log.model_path(), root.join("data/log/run1/model.safetensors"));
        let base = storage.log_dir("").unwrap();
        assert_eq!(base.path(), root.join("data/log"));
        let _ = std::fs::remove_dir_all(&root);
    }
}
