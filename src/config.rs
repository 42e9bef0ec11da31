//! Engine configuration.
//!
//! Read-only after startup and shared by every entity worker. Durations
//! are (de)serialized as whole seconds.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::snapshot::{DEFAULT_SNAPSHOT_EVERY, SnapshotPolicy};

/// Default tombstone retention: 7 days.
pub const DEFAULT_CLEANUP_DELETED_ENTITY_AFTER: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default bound of each entity channel's inbound and outbound queues.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 32;

/// Settings consumed by the registry and the stream adapter.
///
/// # Examples
///
/// ```
/// use entity_stream::EngineConfig;
///
/// let config: EngineConfig = serde_json::from_str(
///     r#"{ "snapshot_every": 50, "entities": { "order": { "snapshot_every": -1 } } }"#,
/// ).unwrap();
/// assert_eq!(config.snapshot_every, 50);
/// assert_eq!(config.channel_capacity, 32);
/// assert!(!config.snapshot_policy_for("order").should_snapshot(50));
/// assert!(config.snapshot_policy_for("counter").should_snapshot(50));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Events between automatic snapshots. `0` selects the default,
    /// negative values disable snapshots.
    pub snapshot_every: i64,

    /// How long a deleted entity's identity is remembered.
    #[serde(with = "duration_secs")]
    pub cleanup_deleted_entity_after: Duration,

    pub channel_capacity: usize,

    /// Stop an entity worker after this long without inbound messages.
    #[serde(with = "opt_duration_secs")]
    pub passivation_timeout: Option<Duration>,

    /// Per entity type overrides, keyed by `Entity::ENTITY_TYPE`.
    pub entities: HashMap<String, EntityOptions>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_every: DEFAULT_SNAPSHOT_EVERY as i64,
            cleanup_deleted_entity_after: DEFAULT_CLEANUP_DELETED_ENTITY_AFTER,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            passivation_timeout: None,
            entities: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Effective `snapshot_every` for `entity_type`.
    pub fn snapshot_every_for(&self, entity_type: &str) -> i64 {
        self.entities
            .get(entity_type)
            .and_then(|o| o.snapshot_every)
            .unwrap_or(self.snapshot_every)
    }

    pub fn snapshot_policy_for(&self, entity_type: &str) -> SnapshotPolicy {
        SnapshotPolicy::from_setting(entity_type, self.snapshot_every_for(entity_type))
    }
}

/// Settings overridable per entity type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityOptions {
    pub snapshot_every: Option<i64>,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod opt_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|secs| secs.map(Duration::from_secs))
    }
}
