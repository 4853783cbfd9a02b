use std::{collections::HashMap, path::{Path, PathBuf}};

use crate::config::Config;
use crate::route::{GoalFormat, RouteLayout, Section};

#[derive(thiserror::Error, Debug)]
#[error("Algorithm {0:?} is not registered")]
pub struct UnknownAlgorithm(pub String);

/// Where the value written into a template line comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldSource {
    /// `px py speed angle` of the aircraft in the local frame
    StartState,
    /// a named parameter from the algorithm configuration
    Param(&'static str),
    /// a positional extra parameter of the request
    Extra(usize),
    /// number of waypoints of the current leg, derived from its length
    LegWaypoints,
    /// time horizon of the current leg, derived from its length
    LegHorizon,
    /// entry of a comma-separated parameter for the current leg, the last entry covers
    /// the remaining legs
    LegParam(&'static str),
}

/// A configuration file derived from a base template by replacing whole lines.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigFile {
    pub template: PathBuf,
    pub output: PathBuf,
    pub fields: Vec<(usize, FieldSource)>,
}

impl ConfigFile {
    fn new(template: &str, output: &str, fields: Vec<(usize, FieldSource)>) -> Self {
        ConfigFile { template: template.into(), output: output.into(), fields }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Legs {
    /// the solver plans the whole mission in one run
    Whole,
    /// the solver is run once per pair of consecutive mission waypoints
    Each { goal: PathBuf, format: GoalFormat },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Kind {
    /// computes a new route from the current state of the aircraft
    Replanner,
    /// computes the route of a mission read from the file given as first extra parameter
    Planner(Legs),
    /// runs every member and keeps the route of the member named in `winner_log`
    Composite { members: Vec<String>, winner_log: PathBuf },
}

#[derive(Clone, Debug, PartialEq)]
pub struct AlgorithmDescriptor {
    pub id: String,
    pub kind: Kind,
    pub working_dir: PathBuf,
    pub command: String,
    pub config_files: Vec<ConfigFile>,
    pub output_route: PathBuf,
    pub route_layout: RouteLayout,
    pub geo_route: PathBuf,
    pub params: HashMap<String, String>,
    /// extensions of stale files removed before each run
    pub cleanup: Vec<&'static str>,
}

impl AlgorithmDescriptor {
    pub fn new(id: &str, kind: Kind, working_dir: &str) -> Self {
        AlgorithmDescriptor {
            id: id.to_owned(),
            kind,
            working_dir: working_dir.into(),
            command: format!("./{}", id.to_lowercase()),
            config_files: Vec::new(),
            output_route: "route.txt".into(),
            route_layout: RouteLayout::default(),
            geo_route: "routeGeo.txt".into(),
            params: HashMap::new(),
            cleanup: vec!["log", "png"],
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    fn apply(&mut self, config: &crate::config::Algorithm) {
        if let Some(directory) = &config.directory {
            self.working_dir = directory.clone();
        }
        if let Some(command) = &config.command {
            self.command = command.clone();
        }
        self.params.extend(config.params.clone());
    }
}

/* the state, waypoint count and delta lines of the replanners' config.sgl */
fn replanner_config() -> ConfigFile {
    ConfigFile::new("config-base.sgl", "config.sgl", vec![
        (8, FieldSource::StartState),
        (20, FieldSource::Param("waypoints")),
        (26, FieldSource::Param("delta")),
    ])
}

fn replanner(id: &str, working_dir: &str) -> AlgorithmDescriptor {
    let mut descriptor = AlgorithmDescriptor::new(id, Kind::Replanner, working_dir);
    descriptor.config_files.push(replanner_config());
    descriptor
}

/// Descriptors of the algorithms known to the fleet, with the positions of their
/// template fields. Directories, commands and parameters are site specific and come
/// from the configuration.
pub fn builtin() -> Vec<AlgorithmDescriptor> {
    let mut ga = replanner("GA4s", "../Modules-IFA/GA4s/");
    ga.config_files.push(ConfigFile::new("instance-base", "instance", vec![
        (117, FieldSource::Param("time")),
    ]));

    let composite = AlgorithmDescriptor::new("GA_GH_4s", Kind::Composite {
        members: vec!["GA4s".to_owned(), "GH4s".to_owned()],
        winner_log: "output-simulation.log".into(),
    }, "../Modules-IFA/");

    let mut astar = AlgorithmDescriptor::new("AStar4m", Kind::Planner(Legs::Each {
        goal: "goals.txt".into(),
        format: GoalFormat::Points,
    }), "../Modules-Planner/AStar4m/");
    astar.output_route = "output.txt".into();
    astar.cleanup.push("err");

    let mut ccqsp = AlgorithmDescriptor::new("CCQSP4m", Kind::Planner(Legs::Whole),
        "../Modules-MOSA/CCQSP4m/");
    ccqsp.config_files = vec![
        ConfigFile::new("instance-base", "instance", vec![
            (177, FieldSource::Param("steps")),
            (189, FieldSource::Param("delta")),
            (234, FieldSource::Param("std_position")),
            (298, FieldSource::Param("waypoints")),
            (299, FieldSource::Param("time_horizon")),
        ]),
        ConfigFile::new("mission-ccqsp.sgl", "mission.sgl", vec![
            (5, FieldSource::Param("delta")),
            (10, FieldSource::Param("time_horizon")),
        ]),
    ];
    ccqsp.output_route = "output.txt".into();
    ccqsp.route_layout = RouteLayout { skip_lines: 1, section: None };
    ccqsp.cleanup.push("err");

    let mut hga = AlgorithmDescriptor::new("HGA4m", Kind::Planner(Legs::Each {
        goal: "mission-config.sgl".into(),
        format: GoalFormat::States { map: "Config2D-2.sgl" },
    }), "../Modules-MOSA/HGA4m/");
    hga.config_files.push(ConfigFile::new("ga-config-base", "ga-config", vec![
        (207, FieldSource::LegParam("time")),
        (304, FieldSource::Param("delta")),
        (425, FieldSource::LegWaypoints),
        (426, FieldSource::LegHorizon),
        (427, FieldSource::Param("max_velocity")),
        (428, FieldSource::Param("max_control")),
    ]));
    hga.output_route = "output-simulation.log".into();
    hga.route_layout = RouteLayout {
        skip_lines: 0,
        section: Some(Section { start: "[ states ]", end: "[ controls ]" }),
    };

    vec![
        ga,
        replanner("GH4s", "../Modules-IFA/GH4s/"),
        replanner("MPGA4s", "../Modules-IFA/MPGA4s/"),
        replanner("MS4s", "../Modules-IFA/MS4s/"),
        replanner("DE4s", "../Modules-IFA/DE4s/"),
        replanner("GPathReplanner4s", "../Modules-IFA/GPathReplanner4s/"),
        composite,
        astar,
        ccqsp,
        hga,
    ]
}

/// Maps request tags to algorithm descriptors. Populated once at start up.
#[derive(Debug, Default)]
pub struct Registry {
    algorithms: HashMap<String, AlgorithmDescriptor>,
}

impl Registry {
    pub fn from_descriptors<I: IntoIterator<Item = AlgorithmDescriptor>>(descriptors: I) -> Self {
        let algorithms = descriptors.into_iter()
            .map(|descriptor| (descriptor.id.clone(), descriptor))
            .collect();
        Registry { algorithms }
    }

    /// Builtin algorithms with the site settings of the configuration applied.
    pub fn new(config: &Config) -> Self {
        let mut registry = Registry::from_descriptors(builtin());
        for settings in &config.algorithms {
            match registry.algorithms.get_mut(&settings.id) {
                Some(descriptor) => descriptor.apply(settings),
                None => log::warn!("Ignoring configuration of unknown algorithm {}", settings.id),
            }
        }
        registry
    }

    pub fn resolve(&self, id: &str) -> Result<&AlgorithmDescriptor, UnknownAlgorithm> {
        self.algorithms.get(id).ok_or_else(|| UnknownAlgorithm(id.to_owned()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.algorithms.keys().map(String::as_str)
    }
}

/// Name of the per-leg variant of a file, `route.txt` becoming `route3.txt` for leg 3.
pub fn leg_file(path: &Path, leg: usize) -> PathBuf {
    let stem = path.file_stem().map(|stem| stem.to_string_lossy().into_owned()).unwrap_or_default();
    let name = match path.extension() {
        Some(extension) => format!("{}{}.{}", stem, leg, extension.to_string_lossy()),
        None => format!("{}{}", stem, leg),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_is_exact() {
        let registry = Registry::from_descriptors(builtin());
        assert_eq!(registry.resolve("GH4s").unwrap().id, "GH4s");
        assert!(registry.resolve("gh4s").is_err());
        assert!(registry.resolve("bogus").is_err());
        let composite = registry.resolve("GA_GH_4s").unwrap();
        if let Kind::Composite { members, .. } = &composite.kind {
            assert!(members.iter().all(|member| registry.resolve(member).is_ok()));
        }
        else {
            panic!("GA_GH_4s is not a composite");
        }
    }

    #[test]
    fn configuration_overrides_builtin_settings() {
        let config = Config::parse(r#"
            <configuration>
              <base latitude="0" longitude="0"/>
              <algorithm id="GA4s" directory="/opt/ga/" command="java -jar ga.jar">
                <param name="waypoints" value="25"/>
              </algorithm>
              <algorithm id="Unknown9"/>
            </configuration>"#).unwrap();
        let registry = Registry::new(&config);
        let ga = registry.resolve("GA4s").unwrap();
        assert_eq!(ga.working_dir, PathBuf::from("/opt/ga/"));
        assert_eq!(ga.command, "java -jar ga.jar");
        assert_eq!(ga.param("waypoints"), Some("25"));
        assert_eq!(ga.config_files.len(), 2);
        assert!(registry.resolve("Unknown9").is_err());
        assert_eq!(registry.resolve("GH4s").unwrap().command, "./gh4s");
    }

    #[test]
    fn per_leg_files() {
        assert_eq!(leg_file(Path::new("routeGeo.txt"), 2), PathBuf::from("routeGeo2.txt"));
        assert_eq!(leg_file(Path::new("out/route"), 0), PathBuf::from("out/route0"));
    }
}
