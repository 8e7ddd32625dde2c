//! Resolving an image's ancestry

use std::collections::HashSet;

use crate::error::{RegistryError, RegistryResult};
use crate::record::ImageRecord;
use crate::store::Snapshot;

/// The ancestors of `name`, root first and direct parent last.
///
/// A root image has an empty ancestry. A parent reference naming a missing
/// image, or a chain that revisits an image, is an error rather than a
/// truncated list.
pub fn ancestry(snapshot: &Snapshot, name: &str) -> RegistryResult<Vec<ImageRecord>> {
    let image = snapshot
        .get(name)
        .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

    let mut visited = HashSet::from([image.name.as_str()]);
    let mut chain = Vec::new();
    let mut current = image;

    while let Some(parent) = current.parent.as_deref() {
        if !visited.insert(parent) {
            return Err(RegistryError::LineageCycle {
                image: current.name.clone(),
                parent: parent.to_string(),
            });
        }

        let next = snapshot
            .get(parent)
            .ok_or_else(|| RegistryError::ParentNotFound {
                image: current.name.clone(),
                parent: parent.to_string(),
            })?;
        chain.push(next.clone());
        current = next;
    }

    chain.reverse();
    Ok(chain)
}
