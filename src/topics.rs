//! Topic grammar for the gateway protocol.
//!
//! ```text
//! Parking/{parkingId}/Mezzi/{vehicleId}            status     gateway -> backend
//! Parking/{parkingId}/Comandi/{vehicleId}          command    backend -> gateway
//! Parking/{parkingId}/RisposteComandi/{vehicleId}  response   gateway -> backend
//! ```
//!
//! Everything here is pure: [`build`] and [`parse`] are inverse of each other
//! for valid inputs, and [`parse`] reports malformed topics as
//! [`ProtocolError`] instead of panicking.
//!
//! # Example
//!
//! ```
//! use ride_fleet::topics::{self, TopicKind};
//!
//! let topic = topics::build(TopicKind::Command, 4, 17);
//! assert_eq!(topic, "Parking/4/Comandi/17");
//!
//! let parsed = topics::parse(&topic).unwrap();
//! assert_eq!(parsed, (TopicKind::Command, 4, 17));
//!
//! // Backend subscribes once across all parkings
//! let filter = topics::filter(TopicKind::Status, None);
//! assert!(topics::matches(&filter, "Parking/9/Mezzi/3"));
//! ```

use crate::error::ProtocolError;

/// Root level of every topic.
pub const ROOT: &str = "Parking";

/// The three message kinds, one per topic family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// Vehicle status telemetry (`Mezzi`).
    Status,
    /// Commands to a vehicle (`Comandi`).
    Command,
    /// Responses to commands (`RisposteComandi`).
    Response,
}

impl TopicKind {
    /// Topic level for this kind.
    pub fn segment(self) -> &'static str {
        match self {
            TopicKind::Status => "Mezzi",
            TopicKind::Command => "Comandi",
            TopicKind::Response => "RisposteComandi",
        }
    }

    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "Mezzi" => Some(TopicKind::Status),
            "Comandi" => Some(TopicKind::Command),
            "RisposteComandi" => Some(TopicKind::Response),
            _ => None,
        }
    }
}

/// Build the concrete topic for one vehicle.
pub fn build(kind: TopicKind, parking_id: i64, vehicle_id: i64) -> String {
    format!("{}/{}/{}/{}", ROOT, parking_id, kind.segment(), vehicle_id)
}

/// Parse a concrete topic into `(kind, parking_id, vehicle_id)`.
pub fn parse(topic: &str) -> Result<(TopicKind, i64, i64), ProtocolError> {
    let levels: Vec<&str> = topic.split('/').collect();
    let [root, parking, kind, vehicle] = levels.as_slice() else {
        return Err(ProtocolError::MalformedTopic(topic.to_string()));
    };
    if *root != ROOT {
        return Err(ProtocolError::MalformedTopic(topic.to_string()));
    }

    let kind =
        TopicKind::from_segment(kind).ok_or_else(|| ProtocolError::UnknownKind(kind.to_string()))?;
    let parking_id = parse_id(parking, "parking id")?;
    let vehicle_id = parse_id(vehicle, "vehicle id")?;

    Ok((kind, parking_id, vehicle_id))
}

fn parse_id(level: &str, field: &'static str) -> Result<i64, ProtocolError> {
    level.parse().map_err(|_| ProtocolError::InvalidId {
        field,
        value: level.to_string(),
    })
}

/// Subscription filter for every vehicle of one parking, or of all parkings.
///
/// `filter(Command, Some(4))` is `Parking/4/Comandi/+`;
/// `filter(Status, None)` is `Parking/+/Mezzi/+`.
pub fn filter(kind: TopicKind, parking_id: Option<i64>) -> String {
    match parking_id {
        Some(id) => format!("{}/{}/{}/+", ROOT, id, kind.segment()),
        None => format!("{}/+/{}/+", ROOT, kind.segment()),
    }
}

/// Filter matching every message of every kind (`Parking/#`).
pub fn filter_all() -> String {
    format!("{}/#", ROOT)
}

/// MQTT topic filter matching.
///
/// `+` matches exactly one level, `#` (last level only) matches the parent
/// level and everything below it.
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
