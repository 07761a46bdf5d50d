//! Source manifest parsing.
//!
//! A manifest is a JSON document describing the items to extract: either a
//! bare array of items or an object with an `items` key. Field names follow
//! the reference-manager export the manifest comes from, so serde aliases
//! absorb the variants (`key`/`itemKey`, `abstract`/`abstractNote`).

use std::path::Path;

use serde::Deserialize;

use crate::error::ExtractionError;

/// One item in the source manifest: metadata plus zero or more attachments.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceItem {
    #[serde(default, alias = "itemKey")]
    pub key: String,

    #[serde(default, rename = "itemType")]
    pub item_type: String,

    #[serde(default)]
    pub title: String,

    #[serde(default, alias = "abstractNote", rename = "abstract")]
    pub abstract_text: String,

    #[serde(default)]
    pub date: String,

    #[serde(default)]
    pub url: String,

    #[serde(default, alias = "DOI")]
    pub doi: String,

    #[serde(default)]
    pub creators: Vec<Creator>,

    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Creator {
    #[serde(default, rename = "firstName")]
    pub first_name: String,
    #[serde(default, rename = "lastName")]
    pub last_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub title: String,
}

impl SourceItem {
    /// Creators flattened to "Last First, Last First"; creators with neither
    /// name set are skipped.
    pub fn authors(&self) -> String {
        self.creators
            .iter()
            .filter(|c| !c.first_name.trim().is_empty() || !c.last_name.trim().is_empty())
            .map(|c| {
                format!("{} {}", c.last_name.trim(), c.first_name.trim())
                    .trim()
                    .to_string()
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Attachments that point at a PDF. Attachments with an empty path or a
    /// non-PDF extension are silently ignored.
    pub fn pdf_attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.attachments.iter().filter(|a| {
            let path = a.path.trim();
            !path.is_empty() && path.to_lowercase().ends_with(".pdf")
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestShape {
    Array(Vec<SourceItem>),
    Wrapped { items: Vec<SourceItem> },
}

/// Parse a manifest from JSON text.
pub fn parse_manifest(json: &str) -> Result<Vec<SourceItem>, ExtractionError> {
    match serde_json::from_str::<ManifestShape>(json) {
        Ok(ManifestShape::Array(items)) | Ok(ManifestShape::Wrapped { items }) => Ok(items),
        Err(_) => Err(ExtractionError::ManifestFormat),
    }
}

/// Read and parse a manifest file.
pub fn load_manifest(path: &Path) -> Result<Vec<SourceItem>, ExtractionError> {
    let json = std::fs::read_to_string(path).map_err(|source| ExtractionError::ManifestRead {
        path: path.display().to_string(),
        source,
    })?;
    parse_manifest(&json)
}
