//! Dataset catalog.
//!
//! The catalog is loaded once at startup and is immutable afterwards; it is
//! shared across dispatch workers behind an `Arc` without locking.

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::dataset::{DatasetDefinition, RawDatasetDefinition};
use crate::error::ConfigError;

const CATALOG_TAG: &str = "Catalog:";

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    datasets: Vec<serde_json::Value>,
}

/// Ordered, immutable list of dataset definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    datasets: Vec<DatasetDefinition>,
}

impl Catalog {
    /// Creates a catalog from already-normalized definitions (declaration order kept).
    #[must_use]
    pub fn new(datasets: Vec<DatasetDefinition>) -> Self {
        Self { datasets }
    }

    /// Loads a catalog document from disk. Files ending in `.yml` or
    /// `.yaml` are read as YAML, anything else as JSON.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::CatalogUnreadable` if the file cannot be read and
    /// `ConfigError::CatalogMalformed` if it is not a catalog document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::CatalogUnreadable {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yml") || ext.eq_ignore_ascii_case("yaml"));
        let catalog = if is_yaml {
            Self::from_yaml_str(&text)?
        } else {
            Self::from_json_str(&text)?
        };
        info!(
            "{CATALOG_TAG} loaded {} dataset definitions from {}",
            catalog.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Parses a JSON catalog document.
    ///
    /// Entries that are not objects, have mistyped fields, or lack a required
    /// field are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::CatalogMalformed` if the document itself does not parse.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let doc: CatalogDocument =
            serde_json::from_str(text).map_err(|e| ConfigError::CatalogMalformed {
                message: e.to_string(),
            })?;
        Ok(Self::from_document(doc))
    }

    /// Parses a YAML catalog document, with the same entry handling as
    /// [`Catalog::from_json_str`].
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::CatalogMalformed` if the document itself does not parse.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let doc: CatalogDocument =
            serde_yaml::from_str(text).map_err(|e| ConfigError::CatalogMalformed {
                message: e.to_string(),
            })?;
        Ok(Self::from_document(doc))
    }

    fn from_document(doc: CatalogDocument) -> Self {
        let mut datasets = Vec::with_capacity(doc.datasets.len());
        for (idx, entry) in doc.datasets.into_iter().enumerate() {
            let raw: RawDatasetDefinition = match serde_json::from_value(entry) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("{CATALOG_TAG} skipping entry #{idx}: {e}");
                    continue;
                }
            };
            match DatasetDefinition::from_raw(raw) {
                Ok(def) => {
                    debug!("{CATALOG_TAG} entry #{idx} -> {}", def.metadata_id);
                    datasets.push(def);
                }
                Err(e) => warn!("{CATALOG_TAG} skipping entry #{idx}: {e}"),
            }
        }

        Self { datasets }
    }

    /// Definitions in declaration order.
    #[must_use]
    pub fn datasets(&self) -> &[DatasetDefinition] {
        &self.datasets
    }

    /// Iterates definitions in declaration order.
    pub fn iter(&self) -> std::slice::Iter<'_, DatasetDefinition> {
        self.datasets.iter()
    }

    /// Number of definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    /// Returns true if the catalog holds no definitions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// Finds a definition by metadata id, accepting either the full id or
    /// its last `:`-separated segment. Underscores in the definition's id
    /// also match hyphens, as metrics keys store them that way.
    #[must_use]
    pub fn find_by_metadata_id(&self, id: &str) -> Option<&DatasetDefinition> {
        self.datasets
            .iter()
            .find(|d| d.metadata_id == id)
            .or_else(|| self.datasets.iter().find(|d| d.short_id() == id))
            .or_else(|| {
                self.datasets
                    .iter()
                    .find(|d| d.short_id().replace('_', "-") == id)
            })
    }
}

impl<'a> IntoIterator for &'a Catalog {
    type Item = &'a DatasetDefinition;
    type IntoIter = std::slice::Iter<'a, DatasetDefinition>;

    fn into_iter(self) -> Self::IntoIter {
        self.datasets.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DOC: &str = r#"{
        "datasets": [
            {"metadata-id": "urn:wmo:md:ca-eccc-msc:swob", "title": "SWOB",
             "subtopic": "*.WXO-DD.observations.swob-ml.#",
             "wis2-topic": "data/core/weather/surface-based-observations/synop",
             "media-type": "application/xml"},
            {"metadata-id": "broken", "subtopic": "a.b"},
            "not an object",
            {"metadata-id": "citypage", "subtopic": "*.WXO-DD.citypage_weather.#",
             "wis2-topic": "data/core/weather/prediction/forecast", "format": "XML",
             "regexes": 42},
            {"metadata-id": "hydrometric", "subtopic": "*.WXO-DD.hydrometric.#",
             "wis2-topic": "data/core/hydrology", "format": "CSV"}
        ]
    }"#;

    #[test]
    fn malformed_entries_skipped() {
        let catalog = Catalog::from_json_str(DOC).unwrap();
        let ids: Vec<_> = catalog.iter().map(|d| d.metadata_id.as_str()).collect();
        assert_eq!(ids, vec!["urn:wmo:md:ca-eccc-msc:swob", "hydrometric"]);
    }

    #[test]
    fn malformed_document_is_fatal() {
        let err = Catalog::from_json_str("{ datasets: ").unwrap_err();
        assert!(matches!(err, ConfigError::CatalogMalformed { .. }));
    }

    #[test]
    fn find_by_full_or_short_id() {
        let catalog = Catalog::from_json_str(DOC).unwrap();
        assert!(catalog.find_by_metadata_id("urn:wmo:md:ca-eccc-msc:swob").is_some());
        assert_eq!(
            catalog.find_by_metadata_id("swob").map(|d| d.title.as_deref()),
            Some(Some("SWOB"))
        );
        assert!(catalog.find_by_metadata_id("nope").is_none());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DOC.as_bytes()).unwrap();
        let catalog = Catalog::load(file.path()).unwrap();
        assert_eq!(catalog.len(), 2);

        let err = Catalog::load("/nonexistent/datasets.json").unwrap_err();
        assert!(matches!(err, ConfigError::CatalogUnreadable { .. }));
    }

    const YAML_DOC: &str = r#"
datasets:
    -   metadata-id: urn:wmo:md:ca-eccc-msc:swob
        title: Surface weather observations
        subtopic: '*.WXO-DD.observations.swob-ml.#'
        wis2-topic: data/core/weather/surface-based-observations/synop
        media-type: application/xml
        regexes:
            - .*-AUTO-swob\.xml$
        cache: false
    -   metadata-id: broken
        subtopic: a.b
    -   metadata-id: urn:wmo:md:ca-eccc-msc:hydrometric
        subtopic: '*.WXO-DD.hydrometric.#'
        wis2-topic: data/core/hydrology
        format: CSV
"#;

    #[test]
    fn load_yaml_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        file.write_all(YAML_DOC.as_bytes()).unwrap();
        let catalog = Catalog::load(file.path()).unwrap();

        let ids: Vec<_> = catalog.iter().map(|d| d.metadata_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["urn:wmo:md:ca-eccc-msc:swob", "urn:wmo:md:ca-eccc-msc:hydrometric"]
        );
        let swob = &catalog.datasets()[0];
        assert!(!swob.cacheable);
        assert_eq!(swob.regex_filters, vec![r".*-AUTO-swob\.xml$".to_string()]);
        assert_eq!(catalog.datasets()[1].media_type, "text/csv");

        let mut json_named = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        json_named.write_all(YAML_DOC.as_bytes()).unwrap();
        let err = Catalog::load(json_named.path()).unwrap_err();
        assert!(matches!(err, ConfigError::CatalogMalformed { .. }));
    }

    #[test]
    fn malformed_yaml_is_fatal() {
        let err = Catalog::from_yaml_str("datasets: [unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::CatalogMalformed { .. }));
    }
}
