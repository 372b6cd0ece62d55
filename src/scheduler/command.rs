//! Command decoding and execution-time resolution.
//!
//! Arguments are positional (`SYNC abc`) or `key=value`
//! (`CAL delay_ms=7000 mode=LB`); list values are comma separated
//! (`tiles=a,b`). Names and enum values are case-insensitive.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::calibration::MeasurementMode;
use crate::radio::{Direction, HwTime};
use crate::sync::SessionId;
use crate::transport::InboundCommand;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    Unknown(String),

    #[error("{command}: missing argument '{arg}'")]
    MissingArgument { command: &'static str, arg: &'static str },

    #[error("{command}: invalid value '{value}' for '{arg}'")]
    InvalidArgument {
        command: &'static str,
        arg: String,
        value: String,
    },

    #[error("{command}: at_ms and delay_ms are mutually exclusive")]
    ConflictingTime { command: &'static str },

    #[error("execution time {at} is not in the future (now {now})")]
    Late { at: HwTime, now: HwTime },
}

impl CommandError {
    /// Short token for `NACK reason=`.
    pub fn reason(&self) -> String {
        match self {
            Self::Unknown(_) => "unknown-command".to_string(),
            Self::MissingArgument { arg, .. } => format!("missing-{arg}"),
            Self::InvalidArgument { arg, .. } => format!("invalid-{arg}"),
            Self::ConflictingTime { .. } => "conflicting-time".to_string(),
            Self::Late { .. } => "late".to_string(),
        }
    }
}

// ============================================================================
// Argument Helpers
// ============================================================================

/// Positional and keyed arguments of one command.
#[derive(Debug, Default)]
pub struct CommandArgs {
    command: &'static str,
    positional: Vec<String>,
    keyed: HashMap<String, String>,
}

impl CommandArgs {
    pub fn parse(command: &'static str, args: &[String]) -> Self {
        let mut parsed = Self {
            command,
            ..Self::default()
        };
        for arg in args {
            match arg.split_once('=') {
                Some((k, v)) => {
                    parsed.keyed.insert(k.to_ascii_lowercase(), v.to_string());
                }
                None => parsed.positional.push(arg.clone()),
            }
        }
        parsed
    }

    pub fn positional(&self, index: usize) -> Option<&str> {
        self.positional.get(index).map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.keyed.get(key).map(String::as_str)
    }

    fn invalid(&self, arg: &str, value: &str) -> CommandError {
        CommandError::InvalidArgument {
            command: self.command,
            arg: arg.to_string(),
            value: value.to_string(),
        }
    }

    pub fn millis(&self, key: &str) -> Result<Option<u64>, CommandError> {
        self.get(key)
            .map(|v| v.parse::<u64>().map_err(|_| self.invalid(key, v)))
            .transpose()
    }

    pub fn duration(&self, key: &str) -> Result<Option<Duration>, CommandError> {
        Ok(self.millis(key)?.map(Duration::from_millis))
    }

    pub fn tiles(&self, key: &str) -> TileSelector {
        self.get(key).map_or(TileSelector::All, TileSelector::parse)
    }

    fn keyword<T>(
        &self,
        key: &str,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Result<Option<T>, CommandError> {
        self.get(key)
            .map(|v| parse(&v.to_ascii_lowercase()).ok_or_else(|| self.invalid(key, v)))
            .transpose()
    }

    pub fn timing(&self) -> Result<TimingSpec, CommandError> {
        match (self.millis("at_ms")?, self.millis("delay_ms")?) {
            (Some(_), Some(_)) => Err(CommandError::ConflictingTime {
                command: self.command,
            }),
            (Some(at), None) => Ok(TimingSpec::Absolute(HwTime::from_millis(at))),
            (None, Some(delay)) => Ok(TimingSpec::Relative(Duration::from_millis(delay))),
            (None, None) => Ok(TimingSpec::Asap),
        }
    }
}

fn parse_direction(v: &str) -> Option<Direction> {
    match v {
        "tx" => Some(Direction::Tx),
        "rx" => Some(Direction::Rx),
        _ => None,
    }
}

// ============================================================================
// Timing
// ============================================================================

/// When a command executes, as given by the controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimingSpec {
    /// `at_ms`: absolute device time
    Absolute(HwTime),
    /// `delay_ms`: relative to the device time at receipt
    Relative(Duration),
    /// Neither given
    Asap,
}

impl TimingSpec {
    /// Resolve to an absolute device instant, which must lie in the future.
    ///
    /// "As soon as possible" still becomes a timed instant `asap_lead` ahead
    /// so every channel receives the same timed command.
    pub fn resolve(self, now: HwTime, asap_lead: Duration) -> Result<HwTime, CommandError> {
        let at = match self {
            Self::Absolute(at) => at,
            Self::Relative(delay) => now + delay,
            Self::Asap => now + asap_lead,
        };
        if at <= now {
            return Err(CommandError::Late { at, now });
        }
        Ok(at)
    }
}

// ============================================================================
// Selectors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileSelector {
    All,
    Named(Vec<String>),
}

impl TileSelector {
    pub fn parse(list: &str) -> Self {
        let names: Vec<String> = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() || names.iter().any(|n| n == "all" || n == "*") {
            Self::All
        } else {
            Self::Named(names)
        }
    }

    pub fn includes(&self, tile: &str) -> bool {
        match self {
            Self::All => true,
            Self::Named(names) => names.iter().any(|n| n == tile),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Runs until STOP or ABORT
    Continuous,
    /// Runs for `duration_ms`
    Burst,
}

/// Chains a STOP applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopScope {
    Tx,
    Rx,
    Both,
}

impl StopScope {
    pub fn covers(self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (Self::Both, _) | (Self::Tx, Direction::Tx) | (Self::Rx, Direction::Rx)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusQuery {
    Time,
    State,
    Setup,
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct StartCommand {
    pub timing: TimingSpec,
    pub mode: StartMode,
    pub direction: Option<Direction>,
    pub duration: Option<Duration>,
    pub tiles: TileSelector,
    pub waveform: Option<String>,
    pub weights: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalCommand {
    pub timing: TimingSpec,
    pub mode: MeasurementMode,
    pub duration: Option<Duration>,
    pub tiles: TileSelector,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PilotCommand {
    pub timing: TimingSpec,
    pub tx_tiles: TileSelector,
    pub rx_tiles: TileSelector,
    pub waveform: Option<String>,
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopCommand {
    pub timing: TimingSpec,
    pub scope: StopScope,
    pub tiles: TileSelector,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetupCommand {
    pub waveform: Option<String>,
    pub weights: Option<String>,
    pub direction: Option<Direction>,
    pub tiles: TileSelector,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Sync(SessionId),
    Start(StartCommand),
    Cal(CalCommand),
    Pilot(PilotCommand),
    Stop(StopCommand),
    Status { query: StatusQuery, tiles: TileSelector },
    Abort { tiles: TileSelector },
    Setup(SetupCommand),
}

impl Command {
    pub fn parse(inbound: &InboundCommand) -> Result<Self, CommandError> {
        let name = inbound.name.to_ascii_uppercase();
        match name.as_str() {
            "SYNC" => {
                let args = CommandArgs::parse("SYNC", &inbound.args);
                let session = args
                    .positional(0)
                    .or_else(|| args.get("session"))
                    .ok_or(CommandError::MissingArgument {
                        command: "SYNC",
                        arg: "session",
                    })?;
                Ok(Self::Sync(SessionId::new(session)))
            }
            "START" => {
                let args = CommandArgs::parse("START", &inbound.args);
                let mode = args
                    .keyword("mode", |v| match v {
                        "continuous" => Some(StartMode::Continuous),
                        "burst" => Some(StartMode::Burst),
                        _ => None,
                    })?
                    .unwrap_or(StartMode::Burst);
                Ok(Self::Start(StartCommand {
                    timing: args.timing()?,
                    mode,
                    direction: args.keyword("direction", parse_direction)?,
                    duration: args.duration("duration_ms")?,
                    tiles: args.tiles("tiles"),
                    waveform: args.get("waveform").map(str::to_string),
                    weights: args.get("weights").map(str::to_string),
                }))
            }
            "CAL" => {
                let args = CommandArgs::parse("CAL", &inbound.args);
                let mode = args
                    .keyword("mode", |v| (v == "lb").then_some(MeasurementMode::Loopback))?
                    .unwrap_or(MeasurementMode::Loopback);
                Ok(Self::Cal(CalCommand {
                    timing: args.timing()?,
                    mode,
                    duration: args.duration("duration_ms")?,
                    tiles: args.tiles("tiles"),
                }))
            }
            "PILOT" => {
                let args = CommandArgs::parse("PILOT", &inbound.args);
                let tx_tiles = args
                    .get("tx_tiles")
                    .map(TileSelector::parse)
                    .ok_or(CommandError::MissingArgument {
                        command: "PILOT",
                        arg: "tx_tiles",
                    })?;
                Ok(Self::Pilot(PilotCommand {
                    timing: args.timing()?,
                    tx_tiles,
                    rx_tiles: args.tiles("rx_tiles"),
                    waveform: args.get("waveform").map(str::to_string),
                    duration: args.duration("duration_ms")?,
                }))
            }
            "STOP" => {
                let args = CommandArgs::parse("STOP", &inbound.args);
                let scope = args
                    .keyword("direction", |v| match v {
                        "tx" => Some(StopScope::Tx),
                        "rx" => Some(StopScope::Rx),
                        "both" => Some(StopScope::Both),
                        _ => None,
                    })?
                    .unwrap_or(StopScope::Both);
                Ok(Self::Stop(StopCommand {
                    timing: args.timing()?,
                    scope,
                    tiles: args.tiles("tiles"),
                }))
            }
            "STATUS" => {
                let args = CommandArgs::parse("STATUS", &inbound.args);
                let parse_query = |v: &str| match v {
                    "time" => Some(StatusQuery::Time),
                    "state" => Some(StatusQuery::State),
                    "setup" => Some(StatusQuery::Setup),
                    _ => None,
                };
                let query = match args.positional(0) {
                    Some(v) => Some(
                        parse_query(&v.to_ascii_lowercase())
                            .ok_or_else(|| args.invalid("query", v))?,
                    ),
                    None => args.keyword("query", parse_query)?,
                };
                Ok(Self::Status {
                    query: query.unwrap_or(StatusQuery::State),
                    tiles: args.tiles("tiles"),
                })
            }
            "ABORT" => {
                let args = CommandArgs::parse("ABORT", &inbound.args);
                Ok(Self::Abort {
                    tiles: args.tiles("tiles"),
                })
            }
            "SETUP" => {
                let args = CommandArgs::parse("SETUP", &inbound.args);
                Ok(Self::Setup(SetupCommand {
                    waveform: args.get("waveform").map(str::to_string),
                    weights: args.get("weights").map(str::to_string),
                    direction: args.keyword("direction", parse_direction)?,
                    tiles: args.tiles("tiles"),
                }))
            }
            _ => Err(CommandError::Unknown(inbound.name.clone())),
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sync(_) => "SYNC",
            Self::Start(_) => "START",
            Self::Cal(_) => "CAL",
            Self::Pilot(_) => "PILOT",
            Self::Stop(_) => "STOP",
            Self::Status { .. } => "STATUS",
            Self::Abort { .. } => "ABORT",
            Self::Setup(_) => "SETUP",
        }
    }

    /// Whether this node is addressed. PILOT addresses transmitters and receivers.
    pub fn targets(&self, tile: &str) -> bool {
        match self {
            Self::Sync(_) => true,
            Self::Start(c) => c.tiles.includes(tile),
            Self::Cal(c) => c.tiles.includes(tile),
            Self::Pilot(c) => c.tx_tiles.includes(tile) || c.rx_tiles.includes(tile),
            Self::Stop(c) => c.tiles.includes(tile),
            Self::Status { tiles, .. } | Self::Abort { tiles } => tiles.includes(tile),
            Self::Setup(c) => c.tiles.includes(tile),
        }
    }
}

impl fmt::Display for StatusQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Time => write!(f, "TIME"),
            Self::State => write!(f, "STATE"),
            Self::Setup => write!(f, "SETUP"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<Command, CommandError> {
        Command::parse(&InboundCommand::parse_line(line).unwrap())
    }

    #[test]
    fn sync_takes_session_positionally() {
        assert_eq!(parse("SYNC abc").unwrap(), Command::Sync(SessionId::new("abc")));
        assert!(matches!(
            parse("sync"),
            Err(CommandError::MissingArgument { arg: "session", .. })
        ));
    }

    #[test]
    fn start_arguments() {
        let Command::Start(start) =
            parse("START delay_ms=500 mode=CONTINUOUS direction=tx tiles=a,b weights=c").unwrap()
        else {
            panic!("expected START");
        };
        assert_eq!(start.timing, TimingSpec::Relative(Duration::from_millis(500)));
        assert_eq!(start.mode, StartMode::Continuous);
        assert_eq!(start.direction, Some(Direction::Tx));
        assert!(start.tiles.includes("b"));
        assert!(!start.tiles.includes("c"));
        assert_eq!(start.weights.as_deref(), Some("c"));
    }

    #[test]
    fn absolute_and_relative_time_conflict() {
        let err = parse("CAL at_ms=9000 delay_ms=100 mode=LB").unwrap_err();
        assert_eq!(err, CommandError::ConflictingTime { command: "CAL" });
        assert_eq!(err.reason(), "conflicting-time");
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(matches!(
            parse("CAL mode=XX"),
            Err(CommandError::InvalidArgument { .. })
        ));
        assert!(matches!(
            parse("STOP direction=up"),
            Err(CommandError::InvalidArgument { .. })
        ));
        assert!(matches!(
            parse("START delay_ms=-5"),
            Err(CommandError::InvalidArgument { .. })
        ));
        assert!(matches!(parse("PILOT"), Err(CommandError::MissingArgument { .. })));
        assert_eq!(parse("FOO").unwrap_err().reason(), "unknown-command");
    }

    #[test]
    fn status_query_forms() {
        assert!(matches!(
            parse("STATUS TIME").unwrap(),
            Command::Status { query: StatusQuery::Time, .. }
        ));
        assert!(matches!(
            parse("STATUS query=setup").unwrap(),
            Command::Status { query: StatusQuery::Setup, .. }
        ));
        assert!(matches!(
            parse("STATUS").unwrap(),
            Command::Status { query: StatusQuery::State, .. }
        ));
    }

    #[test]
    fn resolution_rejects_past_and_present() {
        let now = HwTime::from_secs(10.0);
        let lead = Duration::from_millis(200);
        assert_eq!(
            TimingSpec::Relative(Duration::from_secs(7)).resolve(now, lead),
            Ok(HwTime::from_secs(17.0))
        );
        assert_eq!(TimingSpec::Asap.resolve(now, lead), Ok(HwTime::from_secs(10.2)));
        assert!(matches!(
            TimingSpec::Absolute(HwTime::from_secs(5.0)).resolve(now, lead),
            Err(CommandError::Late { .. })
        ));
        assert!(TimingSpec::Relative(Duration::ZERO).resolve(now, lead).is_err());
    }

    #[test]
    fn tile_targeting() {
        let cmd = parse("PILOT tx_tiles=a rx_tiles=b,c").unwrap();
        assert!(cmd.targets("a"));
        assert!(cmd.targets("c"));
        assert!(!cmd.targets("d"));
        assert_eq!(TileSelector::parse("all"), TileSelector::All);
    }
}
