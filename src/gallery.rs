//! Known-identity gallery.
//!
//! The gallery is built once before streaming starts and never mutated. All
//! feature vectors share one dimensionality; construction rejects anything
//! else.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::detect::{FaceBackend, FeatureVector};
use crate::storage::UNKNOWN_FILE_PREFIX;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub feature_vector: FeatureVector,
}

impl Identity {
    pub fn new(name: impl Into<String>, feature_vector: FeatureVector) -> Self {
        Self {
            name: name.into(),
            feature_vector,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Gallery {
    identities: Vec<Identity>,
}

impl Gallery {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_identities(identities: Vec<Identity>) -> Result<Self> {
        if let Some(first) = identities.first() {
            let dim = first.feature_vector.len();
            if dim == 0 {
                return Err(anyhow!("identity '{}' has an empty feature vector", first.name));
            }
            if let Some(bad) = identities.iter().find(|id| id.feature_vector.len() != dim) {
                return Err(anyhow!(
                    "identity '{}' has {} features; gallery dimensionality is {}",
                    bad.name,
                    bad.feature_vector.len(),
                    dim
                ));
            }
            if let Some(bad) = identities
                .iter()
                .find(|id| id.feature_vector.iter().any(|v| !v.is_finite()))
            {
                return Err(anyhow!("identity '{}' has non-finite features", bad.name));
            }
        }
        Ok(Self { identities })
    }

    /// Load a precomputed `[{"name": ..., "feature_vector": [...]}]` file.
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read gallery file {}: {}", path.display(), e))?;
        let identities: Vec<Identity> = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid gallery file {}: {}", path.display(), e))?;
        let gallery = Self::from_identities(identities)?;
        log::info!(
            "loaded {} known faces from {}",
            gallery.len(),
            path.display()
        );
        Ok(gallery)
    }

    /// Encode every face image in `dir`.
    ///
    /// The identity name is the file stem up to the first `_`
    /// (`alice_2.jpg` -> `alice`). Files written by the unknown-face sink are
    /// skipped, as are images without a detectable face. A missing directory
    /// is created; an unreadable one is an error.
    pub fn load_dir<P: AsRef<Path>>(dir: P, backend: &mut dyn FaceBackend) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.exists() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create faces directory {}", dir.display()))?;
            log::info!("created faces directory {}", dir.display());
        }

        let mut entries: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("read faces directory {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        entries.sort();

        let mut identities = Vec::new();
        for path in entries {
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if filename
                .to_lowercase()
                .starts_with(&UNKNOWN_FILE_PREFIX.to_lowercase())
            {
                log::info!("skipping unknown-face capture '{}'", filename);
                continue;
            }
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false);
            if !is_image {
                continue;
            }

            let name = identity_name(filename);
            match encode_first_face(&path, backend) {
                Ok(Some(encoding)) => {
                    log::debug!("loaded {} ({})", name, filename);
                    identities.push(Identity::new(name, encoding));
                }
                Ok(None) => log::debug!("no face found in {}", filename),
                Err(e) => log::error!("failed to process {}: {:#}", filename, e),
            }
        }

        let gallery = Self::from_identities(identities)?;
        log::info!("loaded {} known faces", gallery.len());
        log::debug!("known names: {:?}", gallery.names());
        Ok(gallery)
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn names(&self) -> Vec<&str> {
        self.identities.iter().map(|id| id.name.as_str()).collect()
    }

    /// Feature dimensionality, `None` for an empty gallery.
    pub fn dimension(&self) -> Option<usize> {
        self.identities.first().map(|id| id.feature_vector.len())
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

fn identity_name(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    match stem.split('_').next() {
        Some(prefix) if !prefix.is_empty() => prefix.to_string(),
        _ => crate::detect::UNKNOWN_LABEL.to_string(),
    }
}

fn encode_first_face(path: &Path, backend: &mut dyn FaceBackend) -> Result<Option<FeatureVector>> {
    let image = image::open(path)
        .with_context(|| format!("open {}", path.display()))?
        .into_rgb8();
    let faces = backend.locate(&image)?;
    let Some(first) = faces.first() else {
        return Ok(None);
    };
    let mut encodings = backend.encode(&image, std::slice::from_ref(first))?;
    Ok(encodings.pop())
}
