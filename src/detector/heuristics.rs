// Update signals derived from registry metadata.

use chrono::{DateTime, Utc};

use crate::models::{ImageRef, UpdateSource, short_digest};
use crate::remote::ImageMetadata;

/// Leading numeric components of a version-like tag: optional `v`/`V`, then dot-separated
/// integers, stopping at the first other character. `v2` -> [2], `1.25-alpine` -> [1, 25].
pub fn parse_version(tag: &str) -> Option<Vec<u64>> {
    let rest = tag
        .strip_prefix('v')
        .or_else(|| tag.strip_prefix('V'))
        .unwrap_or(tag);
    let mut parts = Vec::new();
    for component in rest.split('.') {
        let digits: &str = match component.find(|c: char| !c.is_ascii_digit()) {
            Some(end) => &component[..end],
            None => component,
        };
        let Ok(n) = digits.parse::<u64>() else {
            break;
        };
        parts.push(n);
        if digits.len() != component.len() {
            break;
        }
    }
    if parts.is_empty() { None } else { Some(parts) }
}

/// Highest tag of the repository that orders above `current`, if any.
pub fn newer_tag<'a>(current: &str, tags: &'a [String]) -> Option<&'a str> {
    let current = parse_version(current)?;
    tags.iter()
        .filter_map(|t| parse_version(t).map(|v| (v, t)))
        .filter(|(v, _)| *v > current)
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, t)| t.as_str())
}

/// Registry-backed decision, in priority order: newer version tag, then image newer than
/// the running container.
pub fn decide(
    image: &ImageRef,
    meta: &ImageMetadata,
    container_created: Option<DateTime<Utc>>,
) -> (bool, UpdateSource) {
    if newer_tag(&image.tag, &meta.tags).is_some() {
        return (true, UpdateSource::MultiTag);
    }
    if let (Some(image_created), Some(container_created)) = (meta.created_at, container_created)
        && image_created > container_created
    {
        return (true, UpdateSource::CreationDate);
    }
    (false, UpdateSource::NoSignal)
}

/// Version the registry offers for the decision `source`: the newer tag, the short digest
/// of a rebuilt image, or the running tag itself when nothing newer was seen.
pub fn available_version(
    image: &ImageRef,
    meta: &ImageMetadata,
    source: UpdateSource,
) -> Option<String> {
    match source {
        UpdateSource::MultiTag => newer_tag(&image.tag, &meta.tags).map(str::to_string),
        UpdateSource::CreationDate => meta
            .digest
            .as_deref()
            .map(|d| format!("{} ({})", image.tag, short_digest(d))),
        UpdateSource::NoSignal => image.version_label(),
        UpdateSource::LatestTag | UpdateSource::Unchecked => None,
    }
}
