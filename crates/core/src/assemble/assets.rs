use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AssetError {
    #[error("asset not found: {0}")]
    NotFound(String),

    #[error("failed to read asset {name}: {detail}")]
    Io { name: String, detail: String },
}

/// Supplies named audio assets such as chimes.
pub trait AssetProvider: Send + Sync {
    fn resolve<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Bytes, AssetError>>;
}

/// Serves files from a single directory. Names that would escape the
/// directory are treated as missing.
#[derive(Clone, Debug)]
pub struct DirectoryAssetProvider {
    root: PathBuf,
}

impl DirectoryAssetProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, name: &str) -> Option<PathBuf> {
        let candidate = Path::new(name);
        let mut components = candidate.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Some(self.root.join(candidate)),
            _ => None,
        }
    }

    /// File names available in the directory, sorted.
    pub async fn available(&self) -> Result<Vec<String>, AssetError> {
        let io_err = |e: std::io::Error| AssetError::Io {
            name: self.root.display().to_string(),
            detail: e.to_string(),
        };
        let mut dir = tokio::fs::read_dir(&self.root).await.map_err(io_err)?;
        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(io_err)? {
            if entry.file_type().await.map_err(io_err)?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

impl AssetProvider for DirectoryAssetProvider {
    fn resolve<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Bytes, AssetError>> {
        async move {
            let path = self
                .path_for(name)
                .ok_or_else(|| AssetError::NotFound(name.to_owned()))?;
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(Bytes::from(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(AssetError::NotFound(name.to_owned()))
                }
                Err(e) => Err(AssetError::Io {
                    name: name.to_owned(),
                    detail: e.to_string(),
                }),
            }
        }
        .boxed()
    }
}

/// In-memory assets, for hosts that bundle their sounds.
#[derive(Clone, Debug, Default)]
pub struct StaticAssetProvider {
    assets: HashMap<String, Bytes>,
}

impl StaticAssetProvider {
    pub fn with_asset(mut self, name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        self.assets.insert(name.into(), bytes.into());
        self
    }
}

impl AssetProvider for StaticAssetProvider {
    fn resolve<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Bytes, AssetError>> {
        let found = self.assets.get(name).cloned();
        async move { found.ok_or_else(|| AssetError::NotFound(name.to_owned())) }.boxed()
    }
}
