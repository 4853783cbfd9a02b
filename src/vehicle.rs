use crate::geo::{self, PointGeo, Position3D, Waypoint};
use crate::network::protocol::ParseError;

/// Latest known state of the aircraft, as reported by telemetry updates.
///
/// Wire payload: `lat;lng;alt_rel;heading;groundspeed[;armed]`
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Telemetry {
    pub lat: f64,
    pub lng: f64,
    /// altitude relative to the take-off point (barometer)
    pub alt_rel: f64,
    /// aviation heading in degrees
    pub heading: f64,
    pub groundspeed: f64,
    pub armed: bool,
}

const FIELDS: [&str; 5] = ["lat", "lng", "alt_rel", "heading", "groundspeed"];

impl Telemetry {
    pub fn from_payload(payload: &str) -> Result<Self, ParseError> {
        let fields = payload.split(';').map(str::trim).collect::<Vec<_>>();
        let mut values = [0.0; 5];
        for (index, &name) in FIELDS.iter().enumerate() {
            let field = fields.get(index)
                .ok_or(ParseError::MissingField { index, name })?;
            values[index] = field.parse()
                .map_err(|_| ParseError::InvalidNumber { name, value: field.to_string() })?;
        }
        let armed = match fields.get(FIELDS.len()) {
            None => false,
            Some(field) => match field.to_lowercase().as_str() {
                "true" | "1" => true,
                "false" | "0" | "" => false,
                _ => return Err(ParseError::InvalidNumber { name: "armed", value: field.to_string() }),
            },
        };
        let [lat, lng, alt_rel, heading, groundspeed] = values;
        Ok(Telemetry { lat, lng, alt_rel, heading, groundspeed, armed })
    }

    /// Position of the aircraft in the local frame of `base`.
    pub fn position(&self, base: &PointGeo) -> Position3D {
        geo::to_local(base, &Waypoint { lat: self.lat, lng: self.lng, alt: self.alt_rel })
    }

    /// Start state written into replanner configuration files: `px py speed angle`, with
    /// the angle in radians, counter-clockwise from east.
    pub fn start_state(&self, base: &PointGeo) -> String {
        let position = self.position(base);
        /* the solvers expect an integral heading */
        let angle = geo::aviation_to_math(self.heading.trunc()).to_radians();
        format!("{} {} {} {}", position.x, position.y, self.groundspeed, angle)
    }
}
