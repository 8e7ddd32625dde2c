//! Image metadata records

use serde::{Deserialize, Serialize};

use crate::blob::BlobRef;
use crate::digest::ContentDigest;
use crate::error::{RegistryError, RegistryResult};

const MAX_NAME_LEN: usize = 128;

/// Validate an image name.
///
/// Names are 1 to 128 characters of `[A-Za-z0-9._-]`, starting with an
/// alphanumeric character, so they are always a single safe path segment.
pub fn validate_name(name: &str) -> RegistryResult<()> {
    let mut chars = name.chars();
    let valid = name.len() <= MAX_NAME_LEN
        && chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(name.to_string()))
    }
}

/// Stored metadata for one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    /// Unique image name
    pub name: String,

    /// Free-form version string
    #[serde(default)]
    pub version: String,

    /// Free-form maintainer string
    #[serde(default)]
    pub maintainer: String,

    /// Free-form description
    #[serde(default)]
    pub description: String,

    /// Name of the image this one derives from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// Stored blob, once data is attached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<BlobRef>,

    /// Digest of the stored blob, present exactly when `file_name` is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<ContentDigest>,
}

impl ImageRecord {
    /// Attach blob information, replacing any previous blob.
    pub fn with_blob(mut self, file_name: BlobRef, digest: ContentDigest) -> Self {
        self.file_name = Some(file_name);
        self.digest = Some(digest);
        self
    }
}

/// Client input for metadata-only registration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewImage {
    /// Unique image name
    pub name: String,

    /// Free-form version string
    #[serde(default)]
    pub version: String,

    /// Free-form maintainer string
    #[serde(default)]
    pub maintainer: String,

    /// Free-form description
    #[serde(default)]
    pub description: String,

    /// Parent image name
    #[serde(default)]
    pub parent: Option<String>,
}

impl NewImage {
    /// A bare registration with only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: String::new(),
            maintainer: String::new(),
            description: String::new(),
            parent: None,
        }
    }

    /// Set the parent image.
    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Validate the input and build a record without blob data.
    pub fn into_record(self) -> RegistryResult<ImageRecord> {
        validate_name(&self.name)?;
        let parent = self.parent.filter(|parent| !parent.is_empty());
        if let Some(parent) = &parent {
            validate_name(parent)?;
            if *parent == self.name {
                return Err(RegistryError::InvalidRequest(format!(
                    "image \"{}\" cannot be its own parent",
                    self.name
                )));
            }
        }

        Ok(ImageRecord {
            name: self.name,
            version: self.version,
            maintainer: self.maintainer,
            description: self.description,
            parent,
            file_name: None,
            digest: None,
        })
    }
}
