use crate::mission::{self, Mission};
use crate::vehicle::Telemetry;

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("{0:?} message has no payload")]
    MissingPayload(Tag),

    #[error("Field {index} ({name}) is missing")]
    MissingField { index: usize, name: &'static str },

    #[error("Field {name} is not a number: {value:?}")]
    InvalidNumber { name: &'static str, value: String },

    #[error(transparent)]
    MissionError(#[from] mission::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
    Circle,
    Triangle,
    Rectangle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Mission,
    ChangeBehavior(Option<Shape>),
    GetPicture,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    Telemetry,
    Replan,
    RouteSuccess,
    RouteFailure,
    Command(CommandKind),
}

/* tags with a payload, in the order they are scanned for */
const TAGGED: &[Tag] = &[Tag::Telemetry, Tag::Replan, Tag::RouteSuccess, Tag::RouteFailure];

/* case-insensitive commands, longest first so that a prefix never shadows a longer command */
const COMMANDS: &[(&str, CommandKind)] = &[
    ("change_behavior_rectangle", CommandKind::ChangeBehavior(Some(Shape::Rectangle))),
    ("change_behavior_triangle", CommandKind::ChangeBehavior(Some(Shape::Triangle))),
    ("change_behavior_circle", CommandKind::ChangeBehavior(Some(Shape::Circle))),
    ("change_behavior", CommandKind::ChangeBehavior(None)),
    ("get_picture", CommandKind::GetPicture),
    ("mission", CommandKind::Mission),
];

impl Tag {
    /// Separator between a tag and its payload. The payload therefore starts at the fixed
    /// offset `tag.len() + 2`, which is what the peers slice at.
    pub const SEPARATOR: &'static str = ": ";

    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::Telemetry => "IFA_GCS_INFO",
            Tag::Replan => "IFA_GCS_REPLANNER",
            Tag::RouteSuccess => "UAV_ROUTE_SUCCESS",
            Tag::RouteFailure => "UAV_ROUTE_FAILURE",
            Tag::Command(kind) => COMMANDS.iter()
                .find(|(_, candidate)| candidate == kind)
                .map(|(name, _)| *name)
                .unwrap_or("mission"),
        }
    }
}

/// A line split into its tag and the tag-specific payload.
#[derive(Debug, PartialEq)]
pub struct Envelope<'a> {
    pub tag: Tag,
    pub payload: &'a str,
}

impl<'a> Envelope<'a> {
    /// Classifies a line by scanning for known tag substrings. Returns `None` for lines
    /// that carry no known tag.
    pub fn tokenize(line: &'a str) -> Option<Envelope<'a>> {
        for &tag in TAGGED {
            if let Some(start) = line.find(tag.as_str()) {
                let offset = start + tag.as_str().len() + Tag::SEPARATOR.len();
                let payload = line.get(offset..).unwrap_or("");
                return Some(Envelope { tag, payload });
            }
        }
        let lowercase = line.to_lowercase();
        COMMANDS.iter()
            .find(|(name, _)| lowercase.contains(name))
            .map(|&(_, kind)| Envelope { tag: Tag::Command(kind), payload: line })
    }
}

/// Parameters of a replanning or planning request, positional on the wire:
/// `algorithm;drone;working_dir;result_dir;extra...`
#[derive(Clone, Debug, PartialEq)]
pub struct ReplanRequest {
    pub algorithm: String,
    pub drone: String,
    pub working_dir: String,
    pub result_dir: String,
    pub extra: Vec<String>,
}

impl ReplanRequest {
    const FIELDS: [&'static str; 4] = ["algorithm", "drone", "working_dir", "result_dir"];

    pub fn from_payload(payload: &str) -> Result<Self, ParseError> {
        let mut fields = payload.split(';').map(str::to_owned);
        let mut next = |index: usize| fields.next()
            .filter(|field| index > 0 || !field.is_empty())
            .ok_or(ParseError::MissingField { index, name: Self::FIELDS[index] });
        let algorithm = next(0)?;
        let drone = next(1)?;
        let working_dir = next(2)?;
        let result_dir = next(3)?;
        Ok(ReplanRequest { algorithm, drone, working_dir, result_dir, extra: fields.collect() })
    }

    pub fn to_wire(&self) -> String {
        let mut fields = vec![
            self.algorithm.as_str(),
            self.drone.as_str(),
            self.working_dir.as_str(),
            self.result_dir.as_str(),
        ];
        fields.extend(self.extra.iter().map(String::as_str));
        format!("{}{}{}", Tag::Replan.as_str(), Tag::SEPARATOR, fields.join(";"))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// A mission sent by the ground station, kept as the received (lowercased) line.
    Mission(String),
    ChangeBehavior(Option<Shape>),
    GetPicture,
}

#[derive(Debug, PartialEq)]
pub enum Message {
    Telemetry(Telemetry),
    Replan(ReplanRequest),
    RouteSuccess(Mission),
    RouteFailure,
    Command(Command),
}

impl Message {
    /// Parses one line. `Ok(None)` means the line carries no known tag and is dropped.
    pub fn parse(line: &str) -> Result<Option<Message>, ParseError> {
        let envelope = match Envelope::tokenize(line) {
            Some(envelope) => envelope,
            None => return Ok(None),
        };
        let message = match envelope.tag {
            Tag::RouteFailure => Message::RouteFailure,
            Tag::Command(kind) => Message::Command(match kind {
                CommandKind::Mission => Command::Mission(envelope.payload.to_lowercase()),
                CommandKind::ChangeBehavior(shape) => Command::ChangeBehavior(shape),
                CommandKind::GetPicture => Command::GetPicture,
            }),
            tag if envelope.payload.trim().is_empty() => return Err(ParseError::MissingPayload(tag)),
            Tag::Telemetry => Message::Telemetry(Telemetry::from_payload(envelope.payload)?),
            Tag::Replan => Message::Replan(ReplanRequest::from_payload(envelope.payload)?),
            Tag::RouteSuccess => Message::RouteSuccess(Mission::from_payload(envelope.payload)?),
        };
        Ok(Some(message))
    }
}
