use regex::Regex;
use std::{io, path::{Path, PathBuf}};

use crate::geo::{Position3D, Waypoint};

lazy_static::lazy_static! {
    static ref REGEX_WINNER: Regex =
        Regex::new(r"Method:\s+(\S+)").unwrap();
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not access {}: {source}", .path.display())]
    IoError { path: PathBuf, source: io::Error },

    #[error("{} has {lines} lines, cannot substitute line {line}", .path.display())]
    TemplateOutOfRange { path: PathBuf, lines: usize, line: usize },

    #[error("{}:{line}: expected at least two numbers", .path.display())]
    Malformed { path: PathBuf, line: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> Error + '_ {
    move |source| Error::IoError { path: path.to_owned(), source }
}

/// Lines delimiting the part of a solver output file that holds the route.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Section {
    pub start: &'static str,
    pub end: &'static str,
}

/// Where the waypoints are inside a solver output file.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RouteLayout {
    /// header lines preceding the route
    pub skip_lines: usize,
    pub section: Option<Section>,
}

/* splits a line on any of the separators used by the solvers */
fn tokens(line: &str) -> impl Iterator<Item = &str> {
    line.split(|c: char| c == ';' || c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
}

fn numbers(line: &str, path: &Path, number: usize) -> Result<Vec<f64>> {
    tokens(line)
        .map(|token| token.parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .ok()
        .filter(|values| values.len() >= 2)
        .ok_or(Error::Malformed { path: path.to_owned(), line: number })
}

/// Parses the Cartesian route written by a solver. Each route line holds `x` and `y`
/// followed by optional auxiliary columns, which are ignored. Blank lines and lines
/// starting with `#` are skipped.
pub fn parse_route(contents: &str, layout: &RouteLayout, path: &Path) -> Result<Vec<(f64, f64)>> {
    let mut inside = layout.section.is_none();
    let mut route = Vec::new();
    for (index, line) in contents.lines().enumerate().skip(layout.skip_lines) {
        if let Some(section) = &layout.section {
            if !inside {
                inside = line.contains(section.start);
                continue;
            }
            if line.contains(section.end) {
                break;
            }
        }
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let values = numbers(line, path, index + 1)?;
        route.push((values[0], values[1]));
    }
    Ok(route)
}

pub async fn read_route(path: &Path, layout: &RouteLayout) -> Result<Vec<(f64, f64)>> {
    let contents = tokio::fs::read_to_string(path).await.map_err(io_error(path))?;
    parse_route(&contents, layout, path)
}

/// Reads a mission in the local frame, one `x;y[;altitude]` per line.
pub async fn read_positions(path: &Path) -> Result<Vec<Position3D>> {
    let contents = tokio::fs::read_to_string(path).await.map_err(io_error(path))?;
    contents.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .map(|(index, line)| numbers(line, path, index + 1)
            .map(|values| Position3D {
                x: values[0],
                y: values[1],
                altitude: values.get(2).cloned().unwrap_or_default(),
            }))
        .collect()
}

/// Writes a geodetic route, one `lat;lng;alt` per line.
pub async fn write_geo_route<'a, I>(path: &Path, waypoints: I) -> Result<()>
    where I: IntoIterator<Item = &'a Waypoint> {
    let contents = waypoints.into_iter()
        .map(|waypoint| format!("{}\n", waypoint))
        .collect::<String>();
    tokio::fs::write(path, contents).await.map_err(io_error(path))
}

/// A value substituted for a whole line of a configuration template. Lines are numbered
/// from one.
#[derive(Clone, Debug, PartialEq)]
pub struct TemplateField {
    pub line: usize,
    pub value: String,
}

pub fn apply_template(template: &str, fields: &[TemplateField], path: &Path) -> Result<String> {
    let mut lines = template.lines().collect::<Vec<_>>();
    for field in fields {
        match lines.get_mut(field.line.wrapping_sub(1)) {
            Some(line) => *line = &field.value,
            None => return Err(Error::TemplateOutOfRange {
                path: path.to_owned(),
                lines: lines.len(),
                line: field.line,
            }),
        }
    }
    let mut output = lines.join("\n");
    if template.ends_with('\n') {
        output.push('\n');
    }
    Ok(output)
}

/// Copies `template` to `output`, replacing the declared lines.
pub async fn copy_template(template: &Path, output: &Path, fields: &[TemplateField]) -> Result<()> {
    let contents = tokio::fs::read_to_string(template).await.map_err(io_error(template))?;
    let contents = apply_template(&contents, fields, template)?;
    tokio::fs::write(output, contents).await.map_err(io_error(output))
}

/// Layout of the file that tells a per-leg planner where a leg starts and ends.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GoalFormat {
    /// `#position start`, `x;y`, `#position goal`, `x;y`
    Points,
    /// start and end states `px,py,vx,vy` under banner lines, followed by the map name
    States { map: &'static str },
}

impl GoalFormat {
    /// `velocities` are the planar velocities at the start and at the goal, only the
    /// `States` layout carries them.
    pub fn render(&self, start: &Position3D, goal: &Position3D, velocities: [(f64, f64); 2]) -> String {
        let [(start_vx, start_vy), (goal_vx, goal_vy)] = velocities;
        match self {
            GoalFormat::Points => format!(
                "#position start\n{};{}\n#position goal\n{};{}\n",
                start.x, start.y, goal.x, goal.y),
            GoalFormat::States { map } => format!(
                "----------- start state (px py vx vy) -----------\n{},{},{:?},{:?}\n\
                 --------------- end point (px py)---------------\n{},{},{:?},{:?}\n\n\
                 <TrueName>\n{}\n",
                start.x, start.y, start_vx, start_vy, goal.x, goal.y, goal_vx, goal_vy, map),
        }
    }
}

pub async fn write_goal(path: &Path, format: &GoalFormat, start: &Position3D, goal: &Position3D,
                        velocities: [(f64, f64); 2]) -> Result<()> {
    tokio::fs::write(path, format.render(start, goal, velocities)).await.map_err(io_error(path))
}

/// Scans a solver log for the `Method: <name>` line naming the sub-method that won a
/// composite run.
pub async fn find_winner(path: &Path) -> Result<Option<String>> {
    let contents = tokio::fs::read_to_string(path).await.map_err(io_error(path))?;
    Ok(REGEX_WINNER.captures(&contents)
        .and_then(|captures| captures.get(1))
        .map(|capture| capture.as_str().to_owned()))
}

/// Removes the outputs of a previous run so that they cannot be mistaken for new ones.
pub async fn clear_outputs(dir: &Path, files: &[&Path], extensions: &[&str]) -> Result<()> {
    for file in files {
        let path = dir.join(file);
        match tokio::fs::remove_file(&path).await {
            Err(error) if error.kind() != io::ErrorKind::NotFound =>
                return Err(Error::IoError { path, source: error }),
            _ => {}
        }
    }
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(error) => return Err(Error::IoError { path: dir.to_owned(), source: error }),
    };
    while let Some(entry) = entries.next_entry().await.map_err(io_error(dir))? {
        let path = entry.path();
        let stale = path.extension()
            .and_then(|extension| extension.to_str())
            .map_or(false, |extension| extensions.contains(&extension));
        if stale {
            tokio::fs::remove_file(&path).await.map_err(io_error(&path))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> PathBuf {
        PathBuf::from("route.txt")
    }

    #[test]
    fn parse_routes_with_auxiliary_columns() {
        let plain = RouteLayout::default();
        assert_eq!(parse_route("0;0;10\n100;0;10\n\n100 100\n", &plain, &path()).unwrap(),
                   vec![(0.0, 0.0), (100.0, 0.0), (100.0, 100.0)]);
        let header = RouteLayout { skip_lines: 1, section: None };
        assert_eq!(parse_route("2\n1.5 2.5 0\n3 4 1\n", &header, &path()).unwrap(),
                   vec![(1.5, 2.5), (3.0, 4.0)]);
    }

    #[test]
    fn parse_route_section() {
        let layout = RouteLayout {
            skip_lines: 0,
            section: Some(Section { start: "[ states ]", end: "[ controls ]" }),
        };
        let log = "cost 12\n--- [ states ] ---\n1 2 0.1 0.2\n3 4 0.1 0.2\n--- [ controls ] ---\n9 9\n";
        assert_eq!(parse_route(log, &layout, &path()).unwrap(), vec![(1.0, 2.0), (3.0, 4.0)]);
        assert!(parse_route("1 2\n", &layout, &path()).unwrap().is_empty());
    }

    #[test]
    fn malformed_route_line() {
        assert!(matches!(parse_route("1;2\nnan-ish\n", &RouteLayout::default(), &path()),
                         Err(Error::Malformed { line: 2, .. })));
        assert!(matches!(parse_route("7\n", &RouteLayout::default(), &path()),
                         Err(Error::Malformed { line: 1, .. })));
    }

    #[test]
    fn template_replaces_declared_lines_only() {
        let template = "a\nb\nc\nd\n";
        let fields = [
            TemplateField { line: 2, value: "B".into() },
            TemplateField { line: 4, value: "1 2 3".into() },
        ];
        assert_eq!(apply_template(template, &fields, &path()).unwrap(), "a\nB\nc\n1 2 3\n");
        let out_of_range = [TemplateField { line: 5, value: "x".into() }];
        assert!(matches!(apply_template(template, &out_of_range, &path()),
                         Err(Error::TemplateOutOfRange { lines: 4, line: 5, .. })));
        let zero = [TemplateField { line: 0, value: "x".into() }];
        assert!(apply_template(template, &zero, &path()).is_err());
    }

    #[test]
    fn goal_files() {
        let start = Position3D { x: 1.0, y: 2.0, altitude: 0.0 };
        let goal = Position3D { x: 3.5, y: -4.0, altitude: 0.0 };
        let still = [(0.0, 0.0); 2];
        assert_eq!(GoalFormat::Points.render(&start, &goal, [(1.0, 1.0), (2.0, 2.0)]),
                   "#position start\n1;2\n#position goal\n3.5;-4\n");
        let states = GoalFormat::States { map: "Config2D-2.sgl" };
        assert!(states.render(&start, &goal, still)
            .ends_with("3.5,-4,0.0,0.0\n\n<TrueName>\nConfig2D-2.sgl\n"));
        let moving = states.render(&start, &goal, [(0.0, 0.0), (12.5, -3.0)]);
        assert_eq!(moving.lines().nth(1), Some("1,2,0.0,0.0"));
        assert_eq!(moving.lines().nth(3), Some("3.5,-4,12.5,-3.0"));
    }

    #[tokio::test]
    async fn winner_marker_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("output-simulation.log");
        tokio::fs::write(&log, "best cost 3.2\nMethod: GH time 1.2\n").await.unwrap();
        assert_eq!(find_winner(&log).await.unwrap().as_deref(), Some("GH"));

        tokio::fs::write(dir.path().join("route.txt"), "1 2\n").await.unwrap();
        tokio::fs::write(dir.path().join("plot.png"), "").await.unwrap();
        tokio::fs::write(dir.path().join("config.sgl"), "").await.unwrap();
        clear_outputs(dir.path(), &[Path::new("route.txt"), Path::new("routeGeo.txt")], &["log", "png"])
            .await.unwrap();
        assert!(!log.exists());
        assert!(!dir.path().join("route.txt").exists());
        assert!(!dir.path().join("plot.png").exists());
        assert!(dir.path().join("config.sgl").exists());
        assert_eq!(find_winner(&log).await.ok(), None);
    }

    #[tokio::test]
    async fn geo_route_and_positions_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routeGeo.txt");
        let waypoints = [Waypoint { lat: 1.5, lng: -2.25, alt: 10.0 }];
        write_geo_route(&path, &waypoints).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "1.5;-2.25;10\n");

        let mission = dir.path().join("waypoints.txt");
        tokio::fs::write(&mission, "#x;y;h\n0;0;10\n50;25\n").await.unwrap();
        assert_eq!(read_positions(&mission).await.unwrap(), vec![
            Position3D { x: 0.0, y: 0.0, altitude: 10.0 },
            Position3D { x: 50.0, y: 25.0, altitude: 0.0 },
        ]);
    }
}
