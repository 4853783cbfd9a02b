use std::{collections::HashMap, path::{Path, PathBuf}, str::FromStr, time::Duration};

use crate::geo::PointGeo;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not read configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration file was not valid XML")]
    ParseError(#[from] roxmltree::Error),

    #[error("Configuration is missing <{0}>")]
    MissingElement(&'static str),

    #[error("<{element}> is missing the {attribute} attribute")]
    MissingAttribute { element: String, attribute: &'static str },

    #[error("<{element} {attribute}=\"{value}\"> is not valid")]
    InvalidAttribute { element: String, attribute: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// How the target altitude changes along a generated route.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AltitudeDecay {
    Constant,
    Linear,
}

impl Default for AltitudeDecay {
    fn default() -> Self {
        AltitudeDecay::Constant
    }
}

impl FromStr for AltitudeDecay {
    type Err = ();

    fn from_str(value: &str) -> std::result::Result<Self, ()> {
        match value.to_uppercase().as_str() {
            "CONSTANT" => Ok(AltitudeDecay::Constant),
            "LINEAR" => Ok(AltitudeDecay::Linear),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Network {
    /// address of the replanning service dialled by the ground station
    pub ifa: String,
    /// port on which the onboard process waits for the ground station
    pub mosa_port: u16,
    pub retry: Duration,
}

impl Default for Network {
    fn default() -> Self {
        Network {
            ifa: "127.0.0.1:5555".to_owned(),
            mosa_port: 5556,
            retry: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Replanner {
    pub altitude_decay: AltitudeDecay,
    /// upper bound on a single solver run, unbounded if `None`
    pub timeout: Option<Duration>,
    /// forward solver output to the log instead of discarding it
    pub capture_output: bool,
}

/// Site-specific settings of an algorithm, merged into its builtin descriptor.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Algorithm {
    pub id: String,
    pub directory: Option<PathBuf>,
    pub command: Option<String>,
    pub params: HashMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub network: Network,
    pub base: PointGeo,
    pub replanner: Replanner,
    pub camera_dir: PathBuf,
    pub algorithms: Vec<Algorithm>,
}

fn attribute<T: FromStr>(node: &roxmltree::Node, name: &'static str) -> Result<Option<T>> {
    match node.attribute(name) {
        None => Ok(None),
        Some(value) => value.trim().parse().map(Some).map_err(|_| Error::InvalidAttribute {
            element: node.tag_name().name().to_owned(),
            attribute: name,
            value: value.to_owned(),
        }),
    }
}

fn required<T: FromStr>(node: &roxmltree::Node, name: &'static str) -> Result<T> {
    attribute(node, name)?.ok_or_else(|| Error::MissingAttribute {
        element: node.tag_name().name().to_owned(),
        attribute: name,
    })
}

fn child<'a, 'input>(node: &roxmltree::Node<'a, 'input>, name: &str) -> Option<roxmltree::Node<'a, 'input>> {
    node.children().find(|child| child.tag_name().name() == name)
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Config::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let document = roxmltree::Document::parse(contents)?;
        let root = document.root_element();
        /* network */
        let mut network = Network::default();
        if let Some(node) = child(&root, "network") {
            if let Some(retry) = attribute::<u64>(&node, "retry")? {
                network.retry = Duration::from_millis(retry);
            }
            if let Some(ifa) = child(&node, "ifa") {
                let host: String = required(&ifa, "host")?;
                let port: u16 = required(&ifa, "port")?;
                network.ifa = format!("{}:{}", host, port);
            }
            if let Some(mosa) = child(&node, "mosa") {
                network.mosa_port = required(&mosa, "port")?;
            }
        }
        /* geodetic origin of the local frame */
        let node = child(&root, "base").ok_or(Error::MissingElement("base"))?;
        let base = PointGeo {
            latitude: required(&node, "latitude")?,
            longitude: required(&node, "longitude")?,
            altitude: attribute(&node, "altitude")?.unwrap_or_default(),
        };
        /* replanning */
        let mut replanner = Replanner::default();
        if let Some(node) = child(&root, "replanner") {
            replanner.altitude_decay = attribute(&node, "altitude_decay")?.unwrap_or_default();
            replanner.timeout = attribute::<u64>(&node, "timeout")?.map(Duration::from_secs);
            replanner.capture_output = attribute(&node, "capture_output")?.unwrap_or(false);
        }
        let camera_dir = match child(&root, "camera") {
            Some(node) => required(&node, "directory")?,
            None => PathBuf::from("camera"),
        };
        /* algorithms */
        let algorithms = root.children()
            .filter(|node| node.tag_name().name() == "algorithm")
            .map(|node| -> Result<Algorithm> {
                let params = node.children()
                    .filter(|child| child.tag_name().name() == "param")
                    .map(|child| -> Result<(String, String)> {
                        Ok((required(&child, "name")?, required(&child, "value")?))
                    })
                    .collect::<Result<HashMap<String, String>>>()?;
                Ok(Algorithm {
                    id: required(&node, "id")?,
                    directory: attribute(&node, "directory")?,
                    command: attribute(&node, "command")?,
                    params,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Config { network, base, replanner, camera_dir, algorithms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        <configuration>
          <network retry="250">
            <ifa host="192.168.1.20" port="5555"/>
            <mosa port="6000"/>
          </network>
          <base latitude="-22.0059" longitude="-47.8986" altitude="870"/>
          <replanner altitude_decay="linear" timeout="30" capture_output="true"/>
          <algorithm id="GA4s" directory="../Modules-IFA/GA4s/" command="./ga4s -q">
            <param name="waypoints" value="30"/>
            <param name="delta" value="0.5"/>
          </algorithm>
          <algorithm id="AStar4m"/>
        </configuration>"#;

    #[test]
    fn parse_configuration() {
        let config = Config::parse(CONFIG).unwrap();
        assert_eq!(config.network, Network {
            ifa: "192.168.1.20:5555".into(),
            mosa_port: 6000,
            retry: Duration::from_millis(250),
        });
        assert_eq!(config.base, PointGeo { latitude: -22.0059, longitude: -47.8986, altitude: 870.0 });
        assert_eq!(config.replanner, Replanner {
            altitude_decay: AltitudeDecay::Linear,
            timeout: Some(Duration::from_secs(30)),
            capture_output: true,
        });
        assert_eq!(config.algorithms.len(), 2);
        assert_eq!(config.algorithms[0].command.as_deref(), Some("./ga4s -q"));
        assert_eq!(config.algorithms[0].params["delta"], "0.5");
        assert_eq!(config.algorithms[1].directory, None);
    }

    #[test]
    fn defaults() {
        let config = Config::parse(r#"<configuration><base latitude="0" longitude="0"/></configuration>"#)
            .unwrap();
        assert_eq!(config.network, Network::default());
        assert_eq!(config.replanner, Replanner::default());
        assert!(config.algorithms.is_empty());
    }

    #[test]
    fn invalid_configuration() {
        assert!(matches!(Config::parse("<configuration/>"), Err(Error::MissingElement("base"))));
        assert!(matches!(
            Config::parse(r#"<configuration><base latitude="north" longitude="0"/></configuration>"#),
            Err(Error::InvalidAttribute { attribute: "latitude", .. })));
        assert!(matches!(
            Config::parse(r#"<configuration><base latitude="0" longitude="0"/>
                             <replanner altitude_decay="exponential"/></configuration>"#),
            Err(Error::InvalidAttribute { attribute: "altitude_decay", .. })));
    }
}
