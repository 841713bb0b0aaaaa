//! Cyclic event definitions.
//!
//! A [`CyclicEventMetadata`] describes a recurring cluster event (a world boss
//! spawn or a global portal) as a repeating time window with optional random
//! jitter and a probability gate. Definitions are loaded once from the
//! time-event table and never mutated at runtime.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::OrchestratorError;
use crate::types::{EventKind, MetadataId};

/// Immutable description of a recurring cluster event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CyclicEventMetadata {
    pub id: MetadataId,
    /// Chance in percent (0-100) that a due occurrence actually runs.
    pub probability: u8,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Interval between occurrences. Zero means the event never repeats.
    #[serde(with = "duration_secs")]
    pub cycle: Duration,
    /// Upper bound (exclusive) of the random offset added to each occurrence.
    #[serde(default, with = "duration_secs")]
    pub random_jitter: Duration,
    /// How long a spawned instance stays live.
    #[serde(with = "duration_secs")]
    pub lifetime: Duration,
    pub payload: EventPayload,
}

/// Event-specific data forwarded to shards in the announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    WorldBoss(WorldBossPayload),
    GlobalPortal(GlobalPortalPayload),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldBossPayload {
    pub target_map_ids: Vec<i32>,
    #[serde(default)]
    pub spawn_point_ids: Vec<i32>,
    pub npc_ids: Vec<i32>,
    #[serde(default)]
    pub screen_notice: bool,
    #[serde(default)]
    pub chat_notice: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalPortalPayload {
    #[serde(default)]
    pub popup_message: String,
    #[serde(default)]
    pub sound_id: String,
    pub entries: Vec<PortalEntry>,
}

/// One destination offered by a global portal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortalEntry {
    pub name: String,
    pub map_id: i32,
    pub portal_id: i32,
}

impl CyclicEventMetadata {
    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::WorldBoss(_) => EventKind::WorldBoss,
            EventPayload::GlobalPortal(_) => EventKind::GlobalPortal,
        }
    }

    /// Whether the event repeats at all.
    pub fn is_cyclic(&self) -> bool {
        !self.cycle.is_zero()
    }

    /// Roll the probability gate for one due occurrence.
    pub fn roll<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        if self.probability >= 100 {
            return true;
        }
        rng.gen_range(0..100u8) < self.probability
    }

    /// Reject definitions the scheduler cannot reason about.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.probability > 100 {
            return Err(OrchestratorError::InvalidEvent {
                reason: format!(
                    "event {} probability {} is above 100",
                    self.id, self.probability
                ),
                source: None,
            });
        }
        if self.end_time < self.start_time {
            return Err(OrchestratorError::InvalidEvent {
                reason: format!("event {} ends before it starts", self.id),
                source: None,
            });
        }
        if self.is_cyclic() && self.random_jitter >= self.cycle {
            return Err(OrchestratorError::InvalidEvent {
                reason: format!(
                    "event {} jitter {:?} must be shorter than its cycle {:?}",
                    self.id, self.random_jitter, self.cycle
                ),
                source: None,
            });
        }
        Ok(())
    }
}

/// Parse a JSON time-event table (an array of definitions) and validate
/// every entry.
pub fn parse_table(json: &str) -> Result<Vec<CyclicEventMetadata>, OrchestratorError> {
    let events: Vec<CyclicEventMetadata> =
        serde_json::from_str(json).map_err(|e| OrchestratorError::InvalidEvent {
            reason: format!("malformed time-event table: {e}"),
            source: Some(Box::new(e)),
        })?;
    for event in &events {
        event.validate()?;
    }
    Ok(events)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const TABLE: &str = r#"[
        {
            "id": 21000001,
            "probability": 100,
            "start_time": "2026-01-01T00:00:00Z",
            "end_time": "2027-01-01T00:00:00Z",
            "cycle": 3600,
            "random_jitter": 300,
            "lifetime": 900,
            "payload": {
                "kind": "world_boss",
                "target_map_ids": [2000062],
                "npc_ids": [23000016]
            }
        },
        {
            "id": 1,
            "probability": 50,
            "start_time": "2026-01-01T12:00:00Z",
            "end_time": "2026-12-31T00:00:00Z",
            "cycle": 7200,
            "lifetime": 300,
            "payload": {
                "kind": "global_portal",
                "entries": [{"name": "Ludibrium", "map_id": 2000100, "portal_id": 4}]
            }
        }
    ]"#;

    #[test]
    fn parses_time_event_table() {
        let events = parse_table(TABLE).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), EventKind::WorldBoss);
        assert_eq!(events[0].random_jitter, Duration::from_secs(300));
        assert_eq!(events[1].kind(), EventKind::GlobalPortal);
        assert_eq!(events[1].random_jitter, Duration::ZERO);
        match &events[1].payload {
            EventPayload::GlobalPortal(portal) => assert_eq!(portal.entries[0].map_id, 2000100),
            other => panic!("expected global portal payload, got {other:?}"),
        }
    }

    #[test]
    fn malformed_table_is_invalid_event() {
        let err = parse_table("{not json").unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidEvent { .. }));
    }

    #[test]
    fn jitter_must_be_shorter_than_cycle() {
        let mut events = parse_table(TABLE).unwrap();
        let mut event = events.remove(0);
        event.random_jitter = event.cycle;
        let msg = event.validate().unwrap_err().to_string();
        assert!(msg.contains("jitter"), "got: {msg}");
    }

    #[test]
    fn roll_respects_extremes() {
        let mut event = parse_table(TABLE).unwrap().remove(0);
        let mut rng = StdRng::seed_from_u64(7);

        event.probability = 100;
        assert!((0..100).all(|_| event.roll(&mut rng)));

        event.probability = 0;
        assert!((0..100).all(|_| !event.roll(&mut rng)));
    }

    #[test]
    fn roll_is_roughly_proportional() {
        let mut event = parse_table(TABLE).unwrap().remove(1);
        event.probability = 50;
        let mut rng = StdRng::seed_from_u64(42);
        let hits = (0..10_000).filter(|_| event.roll(&mut rng)).count();
        assert!((4_000..6_000).contains(&hits), "hits = {hits}");
    }
}
