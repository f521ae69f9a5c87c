//! WIS2 notification messages.
//!
//! A `NotificationMessage` is a GeoJSON Feature announcing one file (or the
//! retraction of one discovery metadata record). The `MessageBuilder`
//! validates its inputs before producing a message; any failure aborts that
//! one message only.
//!
//! # Example
//! ```rust,ignore
//! let builder = MessageBuilder::new(config);
//! let message = builder.build(&dataset, "https://dd.example/obs/file.xml", "obs/file.xml", Some(512))?;
//! let payload = message.to_payload()?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use chrono::{NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::dataset::DatasetDefinition;
use crate::error::BuildError;

/// Conformance class of WIS2 notification messages.
pub const WNM_CONFORMANCE: &str = "http://wis.wmo.int/spec/wnm/1/conf/core";

/// Media type of discovery metadata records.
pub const METADATA_MEDIA_TYPE: &str = "application/geo+json";

/// Topic suffix for discovery metadata announcements.
pub const METADATA_TOPIC: &str = "metadata";

static REGEX_CACHE: OnceLock<RwLock<HashMap<String, regex::Regex>>> = OnceLock::new();
const REGEX_CACHE_MAX: usize = 256;

fn cached_regex(pattern: &str) -> Result<regex::Regex, BuildError> {
    let poisoned = || BuildError::MalformedTimestampPattern {
        pattern: pattern.to_string(),
        reason: "regex cache lock poisoned".to_string(),
    };
    let cache = REGEX_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    {
        let guard = cache.read().map_err(|_| poisoned())?;
        if let Some(re) = guard.get(pattern) {
            return Ok(re.clone());
        }
    }

    let compiled = regex::Regex::new(pattern).map_err(|e| BuildError::MalformedTimestampPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    let mut guard = cache.write().map_err(|_| poisoned())?;
    if guard.len() >= REGEX_CACHE_MAX {
        guard.clear();
    }
    guard
        .entry(pattern.to_string())
        .or_insert_with(|| compiled.clone());

    Ok(compiled)
}

/// Relation of a link to the announced resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkRel {
    /// Where the resource can be fetched.
    Canonical,
    /// The resource was announced before and may have changed.
    Update,
    /// The resource has been withdrawn.
    Deletion,
}

/// A link to the announced resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Link relation.
    pub rel: LinkRel,
    /// Media type of the target.
    #[serde(rename = "type")]
    pub media_type: String,
    /// Target URL.
    pub href: String,
    /// Size of the target in bytes, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

impl Link {
    /// Copy of this link with `rel` replaced.
    #[must_use]
    pub fn with_rel(&self, rel: LinkRel) -> Self {
        Self {
            rel,
            ..self.clone()
        }
    }
}

/// Feature properties of a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    /// Content address of the announced file.
    pub data_id: String,
    /// Discovery metadata record of the owning dataset.
    pub metadata_id: String,
    /// Publication instant (RFC 3339, UTC).
    pub pubtime: String,
    /// Observation date or timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime: Option<String>,
    /// Present (and false) only when caches must not keep copies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,
}

/// The unit sent to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    id: Uuid,
    #[serde(rename = "conformsTo")]
    conforms_to: Vec<String>,
    #[serde(rename = "type")]
    feature_type: String,
    geometry: Option<serde_json::Value>,
    properties: MessageProperties,
    links: Vec<Link>,
    #[serde(skip)]
    topic: String,
    #[serde(skip)]
    content_type: String,
}

impl NotificationMessage {
    fn new(topic: String, content_type: String, properties: MessageProperties, links: Vec<Link>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conforms_to: vec![WNM_CONFORMANCE.to_string()],
            feature_type: "Feature".to_string(),
            geometry: None,
            properties,
            links,
            topic,
            content_type,
        }
    }

    /// Message id, fresh per message.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Content address of the announced file.
    #[must_use]
    pub fn data_id(&self) -> &str {
        &self.properties.data_id
    }

    /// Discovery metadata record id.
    #[must_use]
    pub fn metadata_id(&self) -> &str {
        &self.properties.metadata_id
    }

    /// Fully qualified broker topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Content type of the announced file.
    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Observation date or timestamp, if extracted.
    #[must_use]
    pub fn observation_time(&self) -> Option<&str> {
        self.properties.datetime.as_deref()
    }

    /// Whether caches may keep copies.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.properties.cache.unwrap_or(true)
    }

    /// Feature properties.
    #[must_use]
    pub const fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    /// Links in announcement order.
    #[must_use]
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// The canonical link.
    #[must_use]
    pub fn canonical(&self) -> Option<&Link> {
        self.links.iter().find(|l| l.rel == LinkRel::Canonical)
    }

    /// Returns true if the message carries an `update` link.
    #[must_use]
    pub fn is_update(&self) -> bool {
        self.links.iter().any(|l| l.rel == LinkRel::Update)
    }

    /// Appends a copy of the canonical link with `rel = update`.
    ///
    /// Does nothing if an update link is already present.
    pub fn add_update_link(&mut self) {
        if self.is_update() {
            return;
        }
        if let Some(update) = self.canonical().map(|c| c.with_rel(LinkRel::Update)) {
            self.links.push(update);
        }
    }

    /// JSON payload for the broker.
    ///
    /// # Errors
    ///
    /// Returns `BuildError::Serialization` if encoding fails.
    pub fn to_payload(&self) -> Result<Vec<u8>, BuildError> {
        serde_json::to_vec(self).map_err(|e| BuildError::Serialization {
            message: e.to_string(),
        })
    }
}

/// Joins a base URL and a relative path with exactly one `/`.
#[must_use]
pub fn resolve_url(base_url: &str, relative_path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        relative_path.trim_start_matches('/')
    )
}

/// Derives the data id of a file published under `topic`.
///
/// The file name is appended unless it already is the topic's last level,
/// then the first two topic levels are dropped.
#[must_use]
pub fn data_id_for(topic: &str, basename: &str) -> String {
    let full = if basename.is_empty() || topic.rsplit('/').next() == Some(basename) {
        topic.to_string()
    } else {
        format!("{topic}/{basename}")
    };
    full.split('/').skip(2).collect::<Vec<_>>().join("/")
}

/// Qualifies a dataset id as a WMO metadata URN.
#[must_use]
pub fn metadata_id_for(centre_id: &str, id: &str) -> String {
    if id.starts_with("urn:") {
        id.to_string()
    } else {
        format!("urn:wmo:md:{centre_id}:{id}")
    }
}

/// Extracts an observation time from `haystack` with `pattern`.
///
/// The capture groups are read as `(year, month, day[, hour, minute, second])`.
/// Three groups give `YYYY-MM-DD`; four to six give `YYYY-MM-DDTHH:MM:SSZ`
/// with missing components set to zero. No match yields `None`.
///
/// # Errors
///
/// Returns `BuildError::MalformedTimestampPattern` if the pattern does not
/// compile, has fewer than 3 or more than 6 groups, or captures a non-integer.
/// Returns `BuildError::InvalidTimestamp` for an impossible date or time.
pub fn observation_time(pattern: &str, haystack: &str) -> Result<Option<String>, BuildError> {
    let re = cached_regex(pattern)?;
    let group_count = re.captures_len() - 1;
    if !(3..=6).contains(&group_count) {
        return Err(BuildError::MalformedTimestampPattern {
            pattern: pattern.to_string(),
            reason: format!("expected 3 to 6 capture groups, found {group_count}"),
        });
    }

    let Some(caps) = re.captures(haystack) else {
        return Ok(None);
    };

    let mut groups = Vec::with_capacity(group_count);
    for idx in 1..=group_count {
        let value = caps
            .get(idx)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .ok_or_else(|| BuildError::MalformedTimestampPattern {
                pattern: pattern.to_string(),
                reason: format!("group {idx} did not capture an integer"),
            })?;
        groups.push(value);
    }

    let invalid = || BuildError::InvalidTimestamp {
        groups: groups.clone(),
    };
    let year = i32::try_from(groups[0]).map_err(|_| invalid())?;
    let date = NaiveDate::from_ymd_opt(year, groups[1], groups[2]).ok_or_else(invalid)?;
    if group_count == 3 {
        return Ok(Some(date.format("%Y-%m-%d").to_string()));
    }

    let component = |idx: usize| groups.get(idx).copied().unwrap_or(0);
    let time = NaiveTime::from_hms_opt(component(3), component(4), component(5)).ok_or_else(invalid)?;
    Ok(Some(date.and_time(time).format("%Y-%m-%dT%H:%M:%SZ").to_string()))
}

fn require<'a>(value: &'a str, field: &str) -> Result<&'a str, BuildError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(BuildError::MissingField {
            field: field.to_string(),
        });
    }
    Ok(value)
}

/// Builds notification messages for one node configuration.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    config: Arc<NodeConfig>,
}

impl MessageBuilder {
    /// Creates a builder for `config`.
    #[must_use]
    pub fn new(config: Arc<NodeConfig>) -> Self {
        Self { config }
    }

    /// Node configuration in use.
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Builds the announcement of the file at `url` (relative `path`).
    ///
    /// The message carries a single canonical link; the duplicate check adds
    /// the update link.
    ///
    /// # Errors
    ///
    /// Returns `BuildError::MissingField` for a blank required dataset or
    /// configuration field, or any error from `observation_time`.
    pub fn build(
        &self,
        dataset: &DatasetDefinition,
        url: &str,
        path: &str,
        length: Option<u64>,
    ) -> Result<NotificationMessage, BuildError> {
        let centre_id = require(&self.config.centre_id, "centre_id")?;
        let metadata_id = require(&dataset.metadata_id, "metadata_id")?;
        let dataset_topic = require(&dataset.topic, "topic")?;
        let media_type = require(&dataset.media_type, "media_type")?;
        let url = require(url, "url")?;

        let topic = self.config.qualified_topic(dataset_topic.trim_matches('/'));
        let basename = path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();

        let datetime = match dataset.datetime_pattern.as_deref() {
            Some(pattern) => observation_time(pattern, url)?,
            None => None,
        };

        let properties = MessageProperties {
            data_id: data_id_for(&topic, basename),
            metadata_id: metadata_id_for(centre_id, metadata_id),
            pubtime: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            datetime,
            cache: (!dataset.cacheable).then_some(false),
        };

        let canonical = Link {
            rel: LinkRel::Canonical,
            media_type: media_type.to_string(),
            href: url.to_string(),
            length,
        };

        Ok(NotificationMessage::new(
            topic,
            media_type.to_string(),
            properties,
            vec![canonical],
        ))
    }

    /// Builds the withdrawal notice of discovery metadata record `identifier`.
    ///
    /// # Errors
    ///
    /// Returns `BuildError::MissingField` if the identifier, the centre id or
    /// the global discovery catalogue URL is blank.
    pub fn build_retraction(&self, identifier: &str) -> Result<NotificationMessage, BuildError> {
        let identifier = require(identifier, "identifier")?;
        require(&self.config.centre_id, "centre_id")?;
        let gdc_url = require(&self.config.gdc_url, "gdc_url")?;

        let topic = self.config.qualified_topic(METADATA_TOPIC);
        let href = format!("{}/{}", gdc_url.trim_end_matches('/'), identifier);
        let canonical = Link {
            rel: LinkRel::Canonical,
            media_type: METADATA_MEDIA_TYPE.to_string(),
            href,
            length: None,
        };
        let deletion = canonical.with_rel(LinkRel::Deletion);

        let properties = MessageProperties {
            data_id: topic.clone(),
            metadata_id: identifier.to_string(),
            pubtime: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            datetime: None,
            cache: None,
        };

        Ok(NotificationMessage::new(
            topic,
            METADATA_MEDIA_TYPE.to_string(),
            properties,
            vec![canonical, deletion],
        ))
    }
}
