use serde::{Deserialize, Serialize};

use crate::geo::Waypoint;
use crate::network::protocol::Tag;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Mission has no waypoints")]
    Empty,

    #[error("Could not decode mission: {0}")]
    DecodeError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// An ordered sequence of geodetic waypoints.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Mission {
    waypoints: Vec<Waypoint>,
}

impl Mission {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, waypoint: Waypoint) {
        self.waypoints.push(waypoint);
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Waypoint> {
        self.waypoints.iter()
    }

    /// Serializes the mission into a complete success line, tag included.
    pub fn to_wire(&self) -> Result<String> {
        if self.is_empty() {
            return Err(Error::Empty);
        }
        let payload = serde_json::to_string(self)?;
        Ok(format!("{}{}{}", Tag::RouteSuccess.as_str(), Tag::SEPARATOR, payload))
    }

    /// Parses the payload of a success line (the part after the tag).
    pub fn from_payload(payload: &str) -> Result<Self> {
        let mission: Mission = serde_json::from_str(payload)?;
        match mission.is_empty() {
            true => Err(Error::Empty),
            false => Ok(mission),
        }
    }

    pub fn print_summary(&self) {
        log::info!("Mission with {} waypoints", self.len());
        for (index, waypoint) in self.waypoints.iter().enumerate() {
            log::info!("  {:>3}: {}", index, waypoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mission() -> Mission {
        let mut mission = Mission::new();
        mission.push(Waypoint { lat: -22.005_912_345_678_9, lng: -47.898_6, alt: 10.0 });
        mission.push(Waypoint { lat: -22.0061, lng: -47.898_123_456_789_01, alt: 7.5 });
        mission.push(Waypoint { lat: 0.1 + 0.2, lng: 1e-9, alt: 0.0 });
        mission
    }

    #[test]
    fn wire_format_is_tagged_json() {
        let line = mission().to_wire().unwrap();
        assert!(line.starts_with("UAV_ROUTE_SUCCESS: {\"waypoints\":[{\"lat\":"));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn parse_inverts_serialize() {
        let mission = mission();
        let line = mission.to_wire().unwrap();
        let payload = &line["UAV_ROUTE_SUCCESS: ".len()..];
        assert_eq!(Mission::from_payload(payload).unwrap(), mission);
    }

    #[test]
    fn empty_mission_is_not_serialized() {
        assert!(matches!(Mission::new().to_wire(), Err(Error::Empty)));
        assert!(matches!(Mission::from_payload("{\"waypoints\":[]}"), Err(Error::Empty)));
    }
}
