use serde::{Deserialize, Deserializer, Serialize};

/// A creator or contributor, compared on every field when metadata is merged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// `"<volume>"` on a volume, `"<volume>.<paddedChapter>"` on a chapter.
    #[serde(
        default,
        deserialize_with = "number_or_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub number: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl Collection {
    /// Numeric value of `number` used for reading order; `0` when absent or unparsable.
    pub fn sort_key(&self) -> f64 {
        self.number
            .as_deref()
            .and_then(|n| n.trim().parse::<f64>().ok())
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookMetadata {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub creators: Vec<Person>,
    #[serde(default)]
    pub contributors: Vec<Person>,
    #[serde(default)]
    pub collections: Vec<Collection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rights: Option<String>,
    #[serde(default)]
    pub subjects: Vec<String>,
}

impl BookMetadata {
    pub fn first_collection(&self) -> Option<&Collection> {
        self.collections.first()
    }
}

/// Metadata shared by every chapter of one volume, as sent with a dump request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMetadata {
    #[serde(default)]
    pub creators: Vec<Person>,
    #[serde(default)]
    pub contributors: Vec<Person>,
    #[serde(default)]
    pub collections: Vec<Collection>,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Remote URL, `data:` URL, or absent for a generated cover.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rights: Option<String>,
}

/// Body of `POST /<novel>/<volume>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DumpRequest {
    #[serde(default)]
    pub chapters: Vec<String>,
    #[serde(flatten)]
    pub metadata: VolumeMetadata,
}

/// `metadata.json` part of a single-page upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata {
    #[serde(flatten)]
    pub book: BookMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_count: Option<usize>,
}

fn number_or_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
        Float(f64),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => None,
        Some(Raw::Text(text)) => Some(text),
        Some(Raw::Int(n)) => Some(n.to_string()),
        Some(Raw::Float(n)) => Some(n.to_string()),
    })
}
