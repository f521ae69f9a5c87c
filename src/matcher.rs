//! Dataset matching.
//!
//! A dataset's subtopic is written in broker style (`.` separated levels,
//! `*` for one level, `#` for all remaining levels). It is turned into a
//! path pattern that is tested for containment within the file path, so
//! `*.WXO-DD.observations.swob-ml.#` selects any path containing
//! `/<level>/WXO-DD/observations/swob-ml`.

use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::dataset::DatasetDefinition;
use crate::error::FilterError;

const MATCHER_TAG: &str = "Matcher:";

/// How the matcher treats a definition whose subtopic matches but whose
/// regex filters reject the path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MatchMode {
    /// Keep scanning; return the first definition accepted by both its
    /// subtopic and its filters.
    #[default]
    FirstConfirmed,
    /// Stop at the first subtopic match and return it only if its filters
    /// accept the path.
    FirstSubtopic,
}

/// Converts a broker subtopic to the directory-path form it selects.
///
/// `a.b.c.#` becomes `/a/b/c`; trailing `#` and separators are stripped.
#[must_use]
pub fn subtopic_to_dirpath(subtopic: &str) -> String {
    let path = subtopic.trim().replace('.', "/");
    format!("/{}", path.trim_end_matches(['/', '#']))
}

/// Compiles a subtopic into an unanchored containment regex.
fn subtopic_regex(subtopic: &str) -> Result<Regex, regex::Error> {
    let dirpath = subtopic_to_dirpath(subtopic);
    let mut pattern = String::with_capacity(dirpath.len() * 2);
    let mut literal = [0u8; 4];
    for ch in dirpath.chars() {
        match ch {
            '*' => pattern.push_str("[^/]*"),
            '#' => pattern.push_str(".*"),
            other => pattern.push_str(&regex::escape(other.encode_utf8(&mut literal))),
        }
    }
    Regex::new(&pattern)
}

#[derive(Debug)]
struct CompiledDefinition {
    subtopic: Result<Regex, FilterError>,
    filters: Result<Vec<Regex>, FilterError>,
}

impl CompiledDefinition {
    fn compile(def: &DatasetDefinition) -> Self {
        let subtopic = subtopic_regex(&def.subtopic_pattern).map_err(|e| FilterError {
            metadata_id: def.metadata_id.clone(),
            pattern: def.subtopic_pattern.clone(),
            reason: e.to_string(),
        });
        let filters = def
            .regex_filters
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| FilterError {
                    metadata_id: def.metadata_id.clone(),
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })
            })
            .collect();
        Self { subtopic, filters }
    }

    fn degraded(&self) -> Option<&FilterError> {
        self.subtopic.as_ref().err().or(self.filters.as_ref().err())
    }
}

/// Result of identifying a path against the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identification<'a> {
    /// The matched definition, if any.
    pub dataset: Option<&'a DatasetDefinition>,
    /// Definitions that were skipped because a pattern failed to compile.
    pub degraded: Vec<FilterError>,
}

/// Matches file paths to catalog definitions.
///
/// Patterns are compiled once per matcher; definitions with a pattern that
/// fails to compile never match and are reported on every call they are
/// skipped in.
#[derive(Debug)]
pub struct Matcher {
    catalog: Arc<Catalog>,
    compiled: Vec<CompiledDefinition>,
    mode: MatchMode,
}

impl Matcher {
    /// Compiles the catalog's patterns using the default match mode.
    #[must_use]
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self::with_mode(catalog, MatchMode::default())
    }

    /// Compiles the catalog's patterns using `mode`.
    #[must_use]
    pub fn with_mode(catalog: Arc<Catalog>, mode: MatchMode) -> Self {
        let compiled: Vec<CompiledDefinition> =
            catalog.iter().map(CompiledDefinition::compile).collect();
        for err in compiled.iter().filter_map(CompiledDefinition::degraded) {
            warn!("{MATCHER_TAG} definition degraded: {err}");
        }
        Self {
            catalog,
            compiled,
            mode,
        }
    }

    /// The match mode in use.
    #[must_use]
    pub const fn mode(&self) -> MatchMode {
        self.mode
    }

    /// The catalog this matcher was compiled from.
    #[must_use]
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Finds the definition `path` belongs to.
    #[must_use]
    pub fn identify(&self, path: &str) -> Identification<'_> {
        let rooted = if path.starts_with('/') {
            std::borrow::Cow::Borrowed(path)
        } else {
            std::borrow::Cow::Owned(format!("/{path}"))
        };

        let mut degraded = Vec::new();
        for (def, compiled) in self.catalog.iter().zip(&self.compiled) {
            let subtopic = match &compiled.subtopic {
                Ok(re) => re,
                Err(e) => {
                    degraded.push(e.clone());
                    continue;
                }
            };
            if !subtopic.is_match(&rooted) {
                continue;
            }
            debug!("{MATCHER_TAG} subtopic {} matches {path}", def.subtopic_pattern);

            let confirmed = match &compiled.filters {
                Ok(filters) => filters.is_empty() || filters.iter().any(|re| re.is_match(path)),
                Err(e) => {
                    degraded.push(e.clone());
                    false
                }
            };

            if confirmed {
                debug!("{MATCHER_TAG} matched dataset {}", def.metadata_id);
                return Identification {
                    dataset: Some(def),
                    degraded,
                };
            }
            debug!("{MATCHER_TAG} filters of {} reject {path}", def.metadata_id);
            if self.mode == MatchMode::FirstSubtopic {
                break;
            }
        }

        debug!("{MATCHER_TAG} no dataset for {path}");
        Identification {
            dataset: None,
            degraded,
        }
    }
}

/// Finds the first definition in `datasets` that `path` belongs to.
///
/// Compiles patterns on every call; use `Matcher` on hot paths.
#[must_use]
pub fn identify<'a>(path: &str, datasets: &'a [DatasetDefinition]) -> Option<&'a DatasetDefinition> {
    let matcher = Matcher::new(Arc::new(Catalog::new(datasets.to_vec())));
    let idx = {
        let found = matcher.identify(path).dataset?;
        matcher.catalog.iter().position(|d| std::ptr::eq(d, found))?
    };
    datasets.get(idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: &str, subtopic: &str, regexes: &[&str]) -> DatasetDefinition {
        DatasetDefinition {
            metadata_id: id.to_string(),
            title: None,
            subtopic_pattern: subtopic.to_string(),
            regex_filters: regexes.iter().map(|r| (*r).to_string()).collect(),
            topic: format!("data/core/{id}"),
            media_type: "application/xml".to_string(),
            cacheable: true,
            datetime_pattern: None,
        }
    }

    fn matcher(defs: Vec<DatasetDefinition>) -> Matcher {
        Matcher::new(Arc::new(Catalog::new(defs)))
    }

    #[test]
    fn dirpath_strips_all_levels_marker() {
        assert_eq!(subtopic_to_dirpath("*.WXO-DD.observations.swob-ml.#"), "/*/WXO-DD/observations/swob-ml");
        assert_eq!(subtopic_to_dirpath("a.b"), "/a/b");
    }

    #[test]
    fn containment_match() {
        let m = matcher(vec![def("swob", "*.WXO-DD.observations.swob-ml.#", &[])]);
        let path = "/20240315/WXO-DD/observations/swob-ml/20240315/CYOW/2024-03-15-0600-CYOW-AUTO-swob.xml";
        assert_eq!(m.identify(path).dataset.map(|d| d.metadata_id.as_str()), Some("swob"));
        assert!(m.identify("/20240315/WXO-DD/citypage_weather/on/s0000430_e.xml").dataset.is_none());
    }

    #[test]
    fn relative_path_is_rooted() {
        let m = matcher(vec![def("swob", "WXO-DD.observations.#", &[])]);
        assert!(m.identify("WXO-DD/observations/x.xml").dataset.is_some());
    }

    #[test]
    fn single_level_wildcard_stays_in_level() {
        let m = matcher(vec![def("a", "model.*.grib2", &[])]);
        assert!(m.identify("/model/gdps/grib2/x").dataset.is_some());
        assert!(m.identify("/model/gdps/extra/grib2/x").dataset.is_none());
    }

    #[test]
    fn levels_map_to_path_segments() {
        let m = matcher(vec![def("a", "a.b", &[])]);
        assert!(m.identify("/a/b/file").dataset.is_some());
        assert!(m.identify("/aXb/file").dataset.is_none());
    }

    #[test]
    fn first_declared_wins() {
        let m = matcher(vec![
            def("first", "WXO-DD.observations.#", &[]),
            def("second", "WXO-DD.observations.swob-ml.#", &[]),
        ]);
        let id = m.identify("/WXO-DD/observations/swob-ml/x.xml");
        assert_eq!(id.dataset.map(|d| d.metadata_id.as_str()), Some("first"));
    }

    #[test]
    fn any_filter_confirms() {
        let m = matcher(vec![def("a", "obs.#", &["\\.csv$", "\\.xml$"])]);
        assert!(m.identify("/obs/x.xml").dataset.is_some());
        assert!(m.identify("/obs/x.csv").dataset.is_some());
        assert!(m.identify("/obs/x.bufr").dataset.is_none());
    }

    #[test]
    fn rejected_filters_fall_through_by_default() {
        let defs = vec![def("a", "obs.#", &["\\.csv$"]), def("b", "obs.#", &[])];
        let m = matcher(defs.clone());
        assert_eq!(m.identify("/obs/x.xml").dataset.map(|d| d.metadata_id.as_str()), Some("b"));

        let strict = Matcher::with_mode(Arc::new(Catalog::new(defs)), MatchMode::FirstSubtopic);
        assert!(strict.identify("/obs/x.xml").dataset.is_none());
        assert_eq!(strict.identify("/obs/x.csv").dataset.map(|d| d.metadata_id.as_str()), Some("a"));
    }

    #[test]
    fn malformed_filter_degrades_definition_only() {
        let m = matcher(vec![def("bad", "obs.#", &["(["]), def("good", "obs.#", &[])]);
        let id = m.identify("/obs/x.xml");
        assert_eq!(id.dataset.map(|d| d.metadata_id.as_str()), Some("good"));
        assert_eq!(id.degraded.len(), 1);
        assert_eq!(id.degraded[0].metadata_id, "bad");
    }

    #[test]
    fn empty_catalog_matches_nothing() {
        let m = matcher(Vec::new());
        assert!(m.identify("/anything").dataset.is_none());
        assert!(identify("/anything", &[]).is_none());
    }

    #[test]
    fn free_function_returns_caller_reference() {
        let defs = vec![def("a", "x.#", &[]), def("b", "y.#", &[])];
        let found = identify("/y/file", &defs).unwrap();
        assert!(std::ptr::eq(found, &defs[1]));
    }
}
