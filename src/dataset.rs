//! Dataset definitions.
//!
//! Definitions reach the node in several historical shapes (hyphenated keys
//! from the catalog generator, camelCase keys from newer tooling, a `format`
//! name instead of a media type, titles and filters that may be absent).
//! They are all deserialized into `RawDatasetDefinition` and normalized once,
//! at catalog load, into a single `DatasetDefinition`.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::metrics::{export_name, TOTAL_DATASET};

/// Media type used when a definition names no recognizable format.
pub const DEFAULT_MEDIA_TYPE: &str = "application/octet-stream";

/// Maps a distribution format name to its media type.
#[must_use]
pub fn media_type_for_format(format: &str) -> Option<&'static str> {
    let media_type = match format.trim() {
        "BUFR" => "application/bufr",
        "CSV" => "text/csv",
        "GRIB2" => "application/grib",
        "GeoJSON" => "application/geo+json",
        "JSON" => "application/json",
        "TXT" => "text/plain",
        "XML" => "application/xml",
        _ => return None,
    };
    Some(media_type)
}

/// A dataset definition exactly as found in the catalog document.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawDatasetDefinition {
    #[serde(default, alias = "metadata-id", alias = "metadataId")]
    pub metadata_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "subtopicPattern")]
    pub subtopic: Option<String>,
    #[serde(default, alias = "regexFilters", alias = "regex_filters")]
    pub regexes: Option<Vec<String>>,
    #[serde(default, alias = "wis2-topic", alias = "wis2_topic")]
    pub topic: Option<String>,
    #[serde(default, alias = "media-type", alias = "mediaType")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default, alias = "cacheable")]
    pub cache: Option<bool>,
    #[serde(
        default,
        alias = "msc-filename-datetime-regex",
        alias = "datetimePattern"
    )]
    pub datetime_pattern: Option<String>,
}

/// One publishable data collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetDefinition {
    /// Identifier of the dataset's discovery metadata record.
    pub metadata_id: String,
    /// Human-readable title, when the record provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Dot-delimited broker subtopic (`#`/`*` wildcards) selecting files.
    pub subtopic_pattern: String,
    /// Additional regexes; a path must satisfy at least one if non-empty.
    #[serde(default)]
    pub regex_filters: Vec<String>,
    /// Broker topic suffix.
    pub topic: String,
    /// Content type of the files.
    pub media_type: String,
    /// Whether caches may keep copies of this dataset's files.
    #[serde(default = "default_cacheable")]
    pub cacheable: bool,
    /// Regex whose numeric groups yield the observation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime_pattern: Option<String>,
}

fn default_cacheable() -> bool {
    true
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(value: Option<String>, field: &str) -> Result<String, ConfigError> {
    non_blank(value).ok_or_else(|| ConfigError::MissingDatasetField {
        field: field.to_string(),
    })
}

impl DatasetDefinition {
    /// Normalizes a raw definition.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingDatasetField` if the metadata id,
    /// subtopic or topic is absent or blank, and
    /// `ConfigError::ReservedDatasetId` if the id would be metered as the
    /// process totals.
    pub fn from_raw(raw: RawDatasetDefinition) -> Result<Self, ConfigError> {
        let metadata_id = required(raw.metadata_id, "metadata-id")?;
        if export_name(&metadata_id) == TOTAL_DATASET {
            return Err(ConfigError::ReservedDatasetId { id: metadata_id });
        }
        let subtopic_pattern = required(raw.subtopic, "subtopic")?;
        let topic = required(raw.topic, "wis2-topic")?;

        let media_type = non_blank(raw.media_type)
            .or_else(|| {
                non_blank(raw.format)
                    .map(|f| media_type_for_format(&f).unwrap_or(DEFAULT_MEDIA_TYPE).to_string())
            })
            .ok_or_else(|| ConfigError::MissingDatasetField {
                field: "media-type".to_string(),
            })?;

        let regex_filters = raw
            .regexes
            .unwrap_or_default()
            .into_iter()
            .filter(|r| !r.trim().is_empty())
            .collect();

        Ok(Self {
            metadata_id,
            title: non_blank(raw.title),
            subtopic_pattern,
            regex_filters,
            topic: topic.trim_matches('/').to_string(),
            media_type,
            cacheable: raw.cache.unwrap_or(true),
            datetime_pattern: non_blank(raw.datetime_pattern),
        })
    }

    /// Short form of the metadata id (last `:`-separated segment).
    #[must_use]
    pub fn short_id(&self) -> &str {
        self.metadata_id
            .rsplit(':')
            .next()
            .unwrap_or(self.metadata_id.as_str())
    }
}

impl TryFrom<RawDatasetDefinition> for DatasetDefinition {
    type Error = ConfigError;

    fn try_from(raw: RawDatasetDefinition) -> Result<Self, Self::Error> {
        Self::from_raw(raw)
    }
}
