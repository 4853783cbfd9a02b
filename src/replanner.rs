use std::{path::{Path, PathBuf}, sync::atomic::{AtomicBool, Ordering}};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::algorithm::{self, AlgorithmDescriptor, FieldSource, Kind, Legs, Registry, UnknownAlgorithm};
use crate::config::{AltitudeDecay, Config};
use crate::geo::{self, PointGeo, Position3D};
use crate::mission::Mission;
use crate::network::protocol::ReplanRequest;
use crate::route::{self, GoalFormat, TemplateField};
use crate::solver::{Outcome, Runner};
use crate::vehicle::Telemetry;

/// Why a request did not produce a mission. Every failure is reported to the requesting
/// peer, none of them is fatal to the process.
#[derive(thiserror::Error, Debug)]
pub enum Failure {
    #[error("A replanning run is already in progress")]
    AlreadyRunning,

    #[error(transparent)]
    UnknownAlgorithm(#[from] UnknownAlgorithm),

    #[error("Could not write solver input: {0}")]
    ConfigWrite(route::Error),

    #[error("Solver {0}")]
    Solver(Outcome),

    #[error("Solver produced an empty route")]
    EmptyRoute,

    #[error("Solver produced a malformed route: {0}")]
    MalformedRoute(route::Error),

    #[error("Parameter {0} is not available")]
    MissingParameter(String),

    #[error("Could not read mission: {0}")]
    InvalidMission(route::Error),

    #[error("Could not write geodetic route: {0}")]
    OutputWrite(route::Error),
}

/* releases the run lock when dropped, on every exit path of execute */
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One pair of consecutive mission positions handled by a per-leg planner, with the
/// planar velocities the aircraft has at either end.
#[derive(Clone, Copy, Debug)]
struct Leg {
    index: usize,
    start: Position3D,
    goal: Position3D,
    start_velocity: (f64, f64),
    goal_velocity: (f64, f64),
}

impl Leg {
    /* leg length with a safety margin of two */
    fn span(&self) -> f64 {
        2.0 * (self.goal.x - self.start.x).hypot(self.goal.y - self.start.y)
    }
}

/* With a cruise speed (fixed-wing aircraft) each goal is reached heading from the start of
 * its leg towards the waypoint after the goal, and the next leg starts with that velocity.
 * Otherwise the aircraft is at rest at both ends of every leg. */
fn split_legs(positions: &[Position3D], cruise_speed: Option<f64>) -> Vec<Leg> {
    let mut legs = Vec::with_capacity(positions.len().saturating_sub(1));
    let mut start_velocity = (0.0, 0.0);
    for (index, pair) in positions.windows(2).enumerate() {
        let (start, goal) = (pair[0], pair[1]);
        let goal_velocity = match (cruise_speed, positions.get(index + 2)) {
            (Some(speed), Some(next)) => {
                let (dx, dy) = (next.x - start.x, next.y - start.y);
                let norm = dx.hypot(dy);
                if norm > 0.0 {
                    (dx * speed / norm, dy * speed / norm)
                }
                else {
                    (0.0, 0.0)
                }
            },
            _ => (0.0, 0.0),
        };
        legs.push(Leg { index, start, goal, start_velocity, goal_velocity });
        start_velocity = goal_velocity;
    }
    legs
}

/* the values available to the template fields of one solver run */
struct Fields<'a> {
    descriptor: &'a AlgorithmDescriptor,
    request: &'a ReplanRequest,
    state: &'a str,
    leg: Option<&'a Leg>,
}

impl Fields<'_> {
    fn value(&self, source: &FieldSource) -> Result<String, Failure> {
        let missing = |name: String| Failure::MissingParameter(name);
        match source {
            FieldSource::StartState => Ok(self.state.to_owned()),
            FieldSource::Param(name) => self.descriptor.param(name)
                .map(str::to_owned)
                .ok_or_else(|| missing(name.to_string())),
            FieldSource::Extra(index) => self.request.extra.get(*index)
                .cloned()
                .ok_or_else(|| missing(format!("extra {}", index))),
            FieldSource::LegWaypoints => self.leg
                .map(|leg| format!("{}", (leg.span() / 2.0) as i64))
                .ok_or_else(|| missing("leg waypoints".to_owned())),
            FieldSource::LegHorizon => self.leg
                .map(|leg| format!("{}", leg.span() as i64))
                .ok_or_else(|| missing("leg horizon".to_owned())),
            FieldSource::LegParam(name) => self.descriptor.param(name)
                .zip(self.leg)
                .and_then(|(values, leg)| {
                    let values = values.split(',').map(str::trim).collect::<Vec<_>>();
                    values.get(leg.index).or_else(|| values.last()).map(|value| value.to_string())
                })
                .ok_or_else(|| missing(name.to_string())),
        }
    }
}

/// Runs the registered solvers on behalf of replanning and planning requests and turns
/// their Cartesian routes into missions. At most one request runs at a time.
pub struct Replanner {
    base: PointGeo,
    altitude_decay: AltitudeDecay,
    registry: Registry,
    runner: Runner,
    running: AtomicBool,
}

impl Replanner {
    pub fn new(config: &Config) -> Self {
        let runner = Runner::new(config.replanner.timeout, config.replanner.capture_output);
        Replanner::with_registry(config.base, config.replanner.altitude_decay, Registry::new(config), runner)
    }

    pub fn with_registry(base: PointGeo, altitude_decay: AltitudeDecay, registry: Registry, runner: Runner) -> Self {
        Replanner { base, altitude_decay, registry, runner, running: AtomicBool::new(false) }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn lock(&self) -> Option<RunGuard<'_>> {
        self.running.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(&self.running))
    }

    /// Executes `request` against the latest state of the vehicle. A second request while
    /// one is in flight is rejected with [`Failure::AlreadyRunning`], it is never queued.
    pub async fn execute(&self, request: &ReplanRequest, vehicle: &Telemetry, cancel: &CancellationToken)
        -> Result<Mission, Failure> {
        let _guard = self.lock().ok_or(Failure::AlreadyRunning)?;
        let id = Uuid::new_v4();
        let descriptor = self.registry.resolve(&request.algorithm)?;
        log::info!("[{}] Running {} for drone {}", id, descriptor.id, request.drone);
        let working_dir = match request.working_dir.trim() {
            "" => descriptor.working_dir.clone(),
            dir => PathBuf::from(dir),
        };
        let result_dir = match request.result_dir.trim() {
            "" => working_dir.clone(),
            dir => PathBuf::from(dir),
        };
        let state = vehicle.start_state(&self.base);
        let result = match &descriptor.kind {
            Kind::Replanner =>
                self.replan(descriptor, &working_dir, request, &state, vehicle.alt_rel, cancel).await,
            Kind::Composite { members, winner_log } =>
                self.composite(members, &working_dir.join(winner_log), request, &state, vehicle, cancel).await,
            Kind::Planner(legs) => {
                let altitude = match descriptor.param("altitude") {
                    Some(value) => value.trim().parse()
                        .map_err(|_| Failure::MissingParameter("altitude".to_owned()))?,
                    None => vehicle.alt_rel,
                };
                self.plan(descriptor, legs, &working_dir, request, &state, altitude, cancel).await
            }
        };
        let mission = match result {
            Ok(mission) => mission,
            Err(failure) => {
                log::warn!("[{}] {} failed: {}", id, descriptor.id, failure);
                return Err(failure);
            }
        };
        route::write_geo_route(&result_dir.join(&descriptor.geo_route), mission.iter()).await
            .map_err(Failure::OutputWrite)?;
        log::info!("[{}] {} produced {} waypoints", id, descriptor.id, mission.len());
        Ok(mission)
    }

    /* template, run, read: one solver run in `working_dir` */
    async fn solve(&self, descriptor: &AlgorithmDescriptor, working_dir: &Path, fields: &Fields<'_>,
                   goal: Option<(&Path, &GoalFormat)>, cancel: &CancellationToken)
        -> Result<Vec<(f64, f64)>, Failure> {
        let outputs = [descriptor.output_route.as_path(), descriptor.geo_route.as_path()];
        route::clear_outputs(working_dir, &outputs, &descriptor.cleanup).await
            .map_err(Failure::ConfigWrite)?;
        for config_file in &descriptor.config_files {
            let values = config_file.fields.iter()
                .map(|(line, source)| fields.value(source)
                    .map(|value| TemplateField { line: *line, value }))
                .collect::<Result<Vec<_>, _>>()?;
            route::copy_template(&working_dir.join(&config_file.template),
                                 &working_dir.join(&config_file.output), &values).await
                .map_err(Failure::ConfigWrite)?;
        }
        if let (Some((path, format)), Some(leg)) = (goal, fields.leg) {
            route::write_goal(&working_dir.join(path), format, &leg.start, &leg.goal,
                              [leg.start_velocity, leg.goal_velocity]).await
                .map_err(Failure::ConfigWrite)?;
        }
        match self.runner.run(working_dir, &descriptor.command, cancel).await {
            Outcome::Success => {}
            outcome => return Err(Failure::Solver(outcome)),
        }
        let path = working_dir.join(&descriptor.output_route);
        match route::read_route(&path, &descriptor.route_layout).await {
            Ok(route) if route.is_empty() => Err(Failure::EmptyRoute),
            Ok(route) => Ok(route),
            /* a solver that gave up without writing its route */
            Err(route::Error::IoError { .. }) => Err(Failure::EmptyRoute),
            Err(error) => Err(Failure::MalformedRoute(error)),
        }
    }

    /// Geodetic mission of a Cartesian route starting at `altitude`, with the configured
    /// decay. Under linear decay waypoint `i` of `n` is at `altitude * (1 - i / (n - 1))`,
    /// a route of a single waypoint keeps the start altitude.
    pub fn to_mission(&self, route: &[(f64, f64)], altitude: f64) -> Mission {
        let count = route.len();
        let mut mission = Mission::new();
        for (index, &(x, y)) in route.iter().enumerate() {
            let altitude = match self.altitude_decay {
                AltitudeDecay::Linear if count > 1 =>
                    altitude * (1.0 - index as f64 / (count - 1) as f64),
                _ => altitude,
            };
            mission.push(geo::to_geo(&self.base, x, y, altitude));
        }
        mission
    }

    async fn replan(&self, descriptor: &AlgorithmDescriptor, working_dir: &Path, request: &ReplanRequest,
                    state: &str, altitude: f64, cancel: &CancellationToken) -> Result<Mission, Failure> {
        let fields = Fields { descriptor, request, state, leg: None };
        let route = self.solve(descriptor, working_dir, &fields, None, cancel).await?;
        Ok(self.to_mission(&route, altitude))
    }

    async fn composite(&self, members: &[String], winner_log: &Path, request: &ReplanRequest,
                       state: &str, vehicle: &Telemetry, cancel: &CancellationToken) -> Result<Mission, Failure> {
        let descriptors = members.iter()
            .map(|member| self.registry.resolve(member).map(|descriptor| (member, descriptor)))
            .collect::<Result<Vec<_>, _>>()?;
        route::clear_outputs(Path::new(""), &[winner_log], &[]).await.map_err(Failure::ConfigWrite)?;
        let mut missions = Vec::with_capacity(descriptors.len());
        for (member, descriptor) in descriptors {
            let mission = self.replan(descriptor, &descriptor.working_dir, request, state, vehicle.alt_rel, cancel)
                .await?;
            route::write_geo_route(&descriptor.working_dir.join(&descriptor.geo_route), mission.iter()).await
                .map_err(Failure::OutputWrite)?;
            missions.push((member, mission));
        }
        let winner = match route::find_winner(winner_log).await {
            Ok(Some(name)) => {
                let name = name.to_lowercase();
                let found = missions.iter()
                    .position(|(member, _)| member.to_lowercase().starts_with(&name));
                if found.is_none() {
                    log::warn!("Winner {} is not a member, using {}", name, members[0]);
                }
                found.unwrap_or(0)
            },
            _ => {
                log::info!("No winner reported in {}, using {}", winner_log.display(), members[0]);
                0
            }
        };
        if missions.is_empty() {
            return Err(Failure::EmptyRoute);
        }
        let (member, mission) = missions.swap_remove(winner);
        log::info!("Route of {} selected", member);
        Ok(mission)
    }

    #[allow(clippy::too_many_arguments)]
    async fn plan(&self, descriptor: &AlgorithmDescriptor, legs: &Legs, working_dir: &Path, request: &ReplanRequest,
                  state: &str, altitude: f64, cancel: &CancellationToken) -> Result<Mission, Failure> {
        let (goal, format) = match legs {
            Legs::Whole => {
                let fields = Fields { descriptor, request, state, leg: None };
                let route = self.solve(descriptor, working_dir, &fields, None, cancel).await?;
                return Ok(self.to_mission(&route, altitude));
            },
            Legs::Each { goal, format } => (goal, format),
        };
        let mission_file = request.extra.first()
            .ok_or_else(|| Failure::MissingParameter("mission file".to_owned()))?;
        let positions = route::read_positions(Path::new(mission_file)).await.map_err(Failure::InvalidMission)?;
        let cruise_speed = match descriptor.param("aircraft").map(str::trim) {
            Some(aircraft) if aircraft.eq_ignore_ascii_case("fixed_wing") => {
                let speed = descriptor.param("cruise_speed")
                    .and_then(|value| value.trim().parse::<f64>().ok())
                    .ok_or_else(|| Failure::MissingParameter("cruise_speed".to_owned()))?;
                Some(speed)
            },
            _ => None,
        };
        let legs = split_legs(&positions, cruise_speed);
        if legs.is_empty() {
            return Err(Failure::MissingParameter("mission with at least two waypoints".to_owned()));
        }
        let mut route = Vec::new();
        let mut lengths = Vec::with_capacity(legs.len());
        for (index, leg) in legs.iter().enumerate() {
            log::info!("Planning leg {} of {}", index + 1, legs.len());
            let fields = Fields { descriptor, request, state, leg: Some(leg) };
            let leg_route = self.solve(descriptor, working_dir, &fields, Some((goal.as_path(), format)), cancel)
                .await?;
            lengths.push(leg_route.len());
            route.extend(leg_route);
        }
        let mission = self.to_mission(&route, altitude);
        let mut offset = 0;
        for (index, length) in lengths.into_iter().enumerate() {
            let path = working_dir.join(algorithm::leg_file(&descriptor.geo_route, index));
            route::write_geo_route(&path, mission.iter().skip(offset).take(length)).await
                .map_err(Failure::OutputWrite)?;
            offset += length;
        }
        Ok(mission)
    }
}
