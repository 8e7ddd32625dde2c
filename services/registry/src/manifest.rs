//! Image manifests embedded in uploaded archives

use serde::Deserialize;

use crate::error::{RegistryError, RegistryResult};
use crate::record::{ImageRecord, validate_name};

/// Name of the manifest entry inside an image archive.
pub const MANIFEST_ENTRY: &str = ".manifest";

/// The descriptor an image archive carries about itself.
///
/// ```json
/// { "name": "app", "from": "base", "version": "1.2" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Image name
    pub name: String,

    /// Parent image name
    #[serde(default, alias = "parent")]
    pub from: Option<String>,

    /// Free-form version string
    #[serde(default)]
    pub version: String,

    /// Free-form maintainer string
    #[serde(default)]
    pub maintainer: String,

    /// Free-form description
    #[serde(default)]
    pub description: String,
}

impl Manifest {
    /// Parse and validate manifest bytes.
    pub fn parse(data: &[u8]) -> RegistryResult<Self> {
        let mut manifest: Manifest = serde_json::from_slice(data)
            .map_err(|err| RegistryError::Malformed(format!("invalid manifest: {err}")))?;

        validate_name(&manifest.name)
            .map_err(|_| RegistryError::Malformed(format!("invalid name {:?}", manifest.name)))?;

        manifest.from = manifest.from.filter(|parent| !parent.is_empty());
        if let Some(parent) = &manifest.from {
            validate_name(parent)
                .map_err(|_| RegistryError::Malformed(format!("invalid parent {parent:?}")))?;
            if *parent == manifest.name {
                return Err(RegistryError::Malformed(format!(
                    "image \"{parent}\" cannot be its own parent"
                )));
            }
        }

        Ok(manifest)
    }

    /// The metadata record this manifest seeds, without blob data.
    pub fn into_record(self) -> ImageRecord {
        ImageRecord {
            name: self.name,
            version: self.version,
            maintainer: self.maintainer,
            description: self.description,
            parent: self.from,
            file_name: None,
            digest: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn malformed(data: &str) -> String {
        match Manifest::parse(data.as_bytes()) {
            Err(RegistryError::Malformed(reason)) => reason,
            other => panic!("expected malformed manifest, got {other:?}"),
        }
    }

    #[test]
    fn minimal_manifest() {
        let manifest = Manifest::parse(br#"{"name": "base"}"#).unwrap();
        assert_eq!(manifest.name, "base");
        assert_eq!(manifest.from, None);
    }

    #[test]
    fn parent_aliases() {
        let manifest = Manifest::parse(br#"{"name": "x", "from": "base"}"#).unwrap();
        assert_eq!(manifest.from.as_deref(), Some("base"));

        let manifest = Manifest::parse(br#"{"name": "x", "parent": "base"}"#).unwrap();
        assert_eq!(manifest.from.as_deref(), Some("base"));

        let manifest = Manifest::parse(br#"{"name": "x", "from": ""}"#).unwrap();
        assert_eq!(manifest.from, None);
    }

    #[test]
    fn seeds_record() {
        let record = Manifest::parse(
            br#"{"name": "x", "from": "base", "version": "3", "maintainer": "ops"}"#,
        )
        .unwrap()
        .into_record();
        assert_eq!(record.name, "x");
        assert_eq!(record.parent.as_deref(), Some("base"));
        assert_eq!(record.version, "3");
        assert_eq!(record.maintainer, "ops");
        assert!(record.file_name.is_none());
    }

    #[test]
    fn rejects_bad_manifests() {
        assert!(malformed("").contains("invalid manifest"));
        assert!(malformed("name: base").contains("invalid manifest"));
        assert!(malformed(r#"{"from": "base"}"#).contains("missing field"));
        assert!(malformed(r#"{"name": "x", "layers": []}"#).contains("unknown field"));
        assert!(malformed(r#"{"name": "../x"}"#).contains("invalid name"));
        assert!(malformed(r#"{"name": "x", "from": "a/b"}"#).contains("invalid parent"));
        assert!(malformed(r#"{"name": "x", "from": "x"}"#).contains("own parent"));
    }
}
