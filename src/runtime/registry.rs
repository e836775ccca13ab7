//! Model bundle retrieval.
//!
//! A registry holds many bundles side by side, one top-level directory per
//! model name. Retrieval is selective: only files under `<name>/` are
//! fetched. Downloads land in a local cache keyed by repository and
//! revision; files already present in the cache are not fetched again.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: Box<ureq::Error>,
    },
    #[error("failed to read registry response from {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed registry listing from {url}: {source}")]
    Listing {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("registry has no files under '{0}/'")]
    EmptySubtree(String),
    #[error("registry listed an unsafe path '{0}'")]
    UnsafePath(String),
    #[error("cache write {path}: {source}")]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Selective subtree retrieval.
pub trait ArtifactRegistry {
    /// Make every file under `<subtree>/` available locally and return the
    /// directory that contains `<subtree>/`.
    fn fetch_subtree(&self, subtree: &str) -> Result<PathBuf, RegistryError>;
}

/// Repository listing, as returned by `GET /api/models/{repo}/revision/{rev}`.
#[derive(Debug, Deserialize)]
struct RepoInfo {
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Debug, Deserialize)]
struct Sibling {
    rfilename: String,
}

/// HTTP model hub client.
#[derive(Clone, Debug)]
pub struct HubRegistry {
    endpoint: String,
    repo: String,
    revision: String,
    cache_dir: PathBuf,
    token: Option<String>,
}

impl HubRegistry {
    pub fn new(
        endpoint: impl Into<String>,
        repo: impl Into<String>,
        revision: impl Into<String>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            repo: repo.into(),
            revision: revision.into(),
            cache_dir: cache_dir.into(),
            token: None,
        }
    }

    /// The published bundle repository, cached under [`default_cache_dir`].
    /// Picks up `HF_TOKEN` for gated repositories.
    pub fn published() -> Self {
        let mut hub = Self::new(
            crate::config::REGISTRY_ENDPOINT,
            crate::config::REGISTRY_REPO,
            crate::config::REGISTRY_REVISION,
            default_cache_dir(),
        );
        hub.token = std::env::var("HF_TOKEN").ok().filter(|t| !t.is_empty());
        hub
    }

    /// Directory the repository snapshot is materialised in.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.cache_dir
            .join(format!("models--{}", self.repo.replace('/', "--")))
            .join(&self.revision)
    }

    fn listing_url(&self) -> String {
        format!(
            "{}/api/models/{}/revision/{}",
            self.endpoint, self.repo, self.revision
        )
    }

    fn file_url(&self, file: &str) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            self.endpoint, self.repo, self.revision, file
        )
    }

    fn get(&self, url: &str) -> Result<ureq::Response, RegistryError> {
        let mut req = ureq::get(url);
        if let Some(token) = &self.token {
            req = req.set("Authorization", &format!("Bearer {token}"));
        }
        req.call().map_err(|e| RegistryError::Http {
            url: url.to_string(),
            source: Box::new(e),
        })
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, RegistryError> {
        let mut bytes = Vec::new();
        self.get(url)?
            .into_reader()
            .read_to_end(&mut bytes)
            .map_err(|source| RegistryError::Body {
                url: url.to_string(),
                source,
            })?;
        Ok(bytes)
    }

    fn list_files(&self) -> Result<Vec<String>, RegistryError> {
        let url = self.listing_url();
        let body = self.fetch_bytes(&url)?;
        parse_listing(&body).map_err(|source| RegistryError::Listing { url, source })
    }
}

impl ArtifactRegistry for HubRegistry {
    fn fetch_subtree(&self, subtree: &str) -> Result<PathBuf, RegistryError> {
        let files = select_subtree(&self.list_files()?, subtree)?;
        let root = self.snapshot_dir();
        info!(
            "Fetching {} file(s) of '{}' from {}",
            files.len(),
            subtree,
            self.repo
        );

        for file in &files {
            let dest = root.join(file);
            if dest.exists() {
                debug!("cached: {}", dest.display());
                continue;
            }
            let bytes = self.fetch_bytes(&self.file_url(file))?;
            write_cache_file(&dest, &bytes)?;
            debug!("downloaded {} ({} bytes)", file, bytes.len());
        }
        Ok(root)
    }
}

/// Cache root: `$HF_HOME/worldplay`, else `~/.cache/huggingface/worldplay`.
pub fn default_cache_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("HF_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home).join("worldplay");
    }
    match std::env::var_os("HOME").filter(|v| !v.is_empty()) {
        Some(home) => PathBuf::from(home)
            .join(".cache")
            .join("huggingface")
            .join("worldplay"),
        None => PathBuf::from(".cache").join("worldplay"),
    }
}

fn parse_listing(body: &[u8]) -> Result<Vec<String>, serde_json::Error> {
    let info: RepoInfo = serde_json::from_slice(body)?;
    Ok(info.siblings.into_iter().map(|s| s.rfilename).collect())
}

/// Files under `<subtree>/`, rejecting any that would escape the snapshot.
fn select_subtree(files: &[String], subtree: &str) -> Result<Vec<String>, RegistryError> {
    let prefix = format!("{}/", subtree.trim_end_matches('/'));
    let mut selected = Vec::new();
    for file in files.iter().filter(|f| f.starts_with(&prefix)) {
        let safe = Path::new(file)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(RegistryError::UnsafePath(file.clone()));
        }
        selected.push(file.clone());
    }
    if selected.is_empty() {
        return Err(RegistryError::EmptySubtree(subtree.to_string()));
    }
    Ok(selected)
}

fn write_cache_file(path: &Path, bytes: &[u8]) -> Result<(), RegistryError> {
    let cache_err = |source| RegistryError::Cache {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(cache_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).map_err(cache_err)?;
    fs::rename(&tmp, path).map_err(cache_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_listing() {
        let body = br#"{"id":"x/y","siblings":[{"rfilename":"a/model/a.pt"},{"rfilename":"README.md"}]}"#;
        let files = parse_listing(body).unwrap();
        assert_eq!(files, names(&["a/model/a.pt", "README.md"]));
    }

    #[test]
    fn test_listing_without_siblings() {
        assert!(parse_listing(br#"{"id":"x/y"}"#).unwrap().is_empty());
        assert!(parse_listing(b"<html>").is_err());
    }

    #[test]
    fn test_select_only_named_subtree() {
        let files = names(&[
            "track-a/model/track-a.pt",
            "track-a/spawn/0.safetensors",
            "track-ab/model/track-ab.pt",
            "README.md",
        ]);
        let got = select_subtree(&files, "track-a").unwrap();
        assert_eq!(
            got,
            names(&["track-a/model/track-a.pt", "track-a/spawn/0.safetensors"])
        );
    }

    #[test]
    fn test_empty_subtree_is_an_error() {
        let files = names(&["other/model/other.pt"]);
        assert!(matches!(
            select_subtree(&files, "track-a"),
            Err(RegistryError::EmptySubtree(name)) if name == "track-a"
        ));
    }

    #[test]
    fn test_unsafe_path_is_rejected() {
        let files = names(&["track-a/../../etc/passwd"]);
        assert!(matches!(
            select_subtree(&files, "track-a"),
            Err(RegistryError::UnsafePath(_))
        ));
    }

    #[test]
    fn test_urls_and_snapshot_dir() {
        let hub = HubRegistry::new("https://hub.example/", "org/bundles", "main", "/tmp/cache");
        assert_eq!(
            hub.listing_url(),
            "https://hub.example/api/models/org/bundles/revision/main"
        );
        assert_eq!(
            hub.file_url("a/model/a.pt"),
            "https://hub.example/org/bundles/resolve/main/a/model/a.pt"
        );
        assert_eq!(
            hub.snapshot_dir(),
            PathBuf::from("/tmp/cache/models--org--bundles/main")
        );
    }

    #[test]
    fn test_cache_write_is_complete() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a").join("spawn").join("0.safetensors");
        write_cache_file(&dest, b"abc").unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"abc");
        assert!(!dest.with_extension("safetensors.part").exists());
    }
}
