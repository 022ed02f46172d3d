use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("Unknown active state: {0}")]
    UnknownActiveState(String),
    #[error("Unknown axis: {0}")]
    UnknownAxis(String),
    #[error("Status report is not an object")]
    MalformedStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for Axis {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "X" | "x" => Ok(Axis::X),
            "Y" | "y" => Ok(Axis::Y),
            "Z" | "z" => Ok(Axis::Z),
            other => Err(ModelError::UnknownAxis(other.to_string())),
        }
    }
}

/// Coerces a firmware value to a number. CNCJS forwards most numbers as
/// strings ("1000.000"); anything that does not parse reads as 0.
pub(crate) fn number(value: Option<&Value>) -> Option<f64> {
    let n = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        _ => return None,
    };
    n.is_finite().then_some(n)
}

#[derive(Default, Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// `None` unless the value is an object; missing components read as 0.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(Self {
            x: number(obj.get("x")).unwrap_or(0.0),
            y: number(obj.get("y")).unwrap_or(0.0),
            z: number(obj.get("z")).unwrap_or(0.0),
        })
    }

    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }
}

/// Machine operating mode. The firmware reports the first nine; `Empty`
/// means nothing has been reported since the last reset, and the two
/// `Homing*` members are synthesized by the state tracker.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ActiveState {
    #[default]
    Empty,
    Idle,
    Run,
    Hold,
    Jog,
    Alarm,
    Door,
    Check,
    Home,
    Sleep,
    HomingRequired,
    HomingInProgress,
}

impl ActiveState {
    /// Parses a firmware state name, dropping any `:n` sub-code (`Hold:0`).
    pub fn from_raw(raw: &str) -> Result<Self, ModelError> {
        let name = raw.split(':').next().unwrap_or_default().trim();
        match name {
            "" => Ok(ActiveState::Empty),
            "Idle" => Ok(ActiveState::Idle),
            "Run" => Ok(ActiveState::Run),
            "Hold" => Ok(ActiveState::Hold),
            "Jog" => Ok(ActiveState::Jog),
            "Alarm" => Ok(ActiveState::Alarm),
            "Door" => Ok(ActiveState::Door),
            "Check" => Ok(ActiveState::Check),
            "Home" => Ok(ActiveState::Home),
            "Sleep" => Ok(ActiveState::Sleep),
            _ => Err(ModelError::UnknownActiveState(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActiveState::Empty => "",
            ActiveState::Idle => "Idle",
            ActiveState::Run => "Run",
            ActiveState::Hold => "Hold",
            ActiveState::Jog => "Jog",
            ActiveState::Alarm => "Alarm",
            ActiveState::Door => "Door",
            ActiveState::Check => "Check",
            ActiveState::Home => "Home",
            ActiveState::Sleep => "Sleep",
            ActiveState::HomingRequired => "Homing Required",
            ActiveState::HomingInProgress => "Homing",
        }
    }
}

impl fmt::Display for ActiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Firmware `$` settings, coerced to numbers. Replaced wholesale on every
/// settings report.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct Settings {
    values: HashMap<String, f64>,
}

impl Settings {
    /// Accepts the CNCJS settings payload (`{"settings": {"$110": ...}}`) or
    /// a bare map of settings. Values that are not numeric are dropped.
    pub fn from_raw(raw: &Value) -> Self {
        let map = raw
            .get("settings")
            .and_then(Value::as_object)
            .or_else(|| raw.as_object());
        let values = map
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| number(Some(v)).map(|n| (k.clone(), n)))
                    .collect()
            })
            .unwrap_or_default();
        Self { values }
    }

    pub fn get(&self, name: &str) -> f64 {
        self.values.get(name).copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    // $110-$112
    pub fn max_feed(&self, axis: Axis) -> f64 {
        self.get(&format!("${}", 110 + axis.index()))
    }

    // $120-$122
    pub fn acceleration(&self, axis: Axis) -> f64 {
        self.get(&format!("${}", 120 + axis.index()))
    }

    // $130-$132
    pub fn max_travel(&self, axis: Axis) -> f64 {
        self.get(&format!("${}", 130 + axis.index()))
    }

    pub fn homing_enabled(&self) -> bool {
        self.get("$22") != 0.0
    }

    pub fn homing_pulloff(&self) -> f64 {
        self.get("$27")
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for Settings {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Synthesized view of one firmware status snapshot.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct MachineState {
    pub active_state: ActiveState,
    // Machine position, None until the firmware has reported one
    pub mpos: Option<Position>,
    // Work position
    pub wpos: Option<Position>,
    // Free planner blocks (Grbl `Bf:`); the queue is empty when this is at its maximum
    pub planner_free: Option<u32>,
    // Raw status sub-report, kept verbatim for deep comparison
    pub status: Value,
    // Raw parser state sub-report
    pub parser_state: Value,
}

impl MachineState {
    /// Parses a CNCJS `controller:state` payload. The active state is the
    /// raw firmware value; synthesis happens in the state tracker.
    pub fn from_raw(raw: &Value) -> Result<Self, ModelError> {
        let obj = raw.as_object().ok_or(ModelError::MalformedStatus)?;
        let status = obj.get("status").cloned().unwrap_or(Value::Null);
        let parser_state = obj.get("parserstate").cloned().unwrap_or(Value::Null);

        let active_state = match status.get("activeState") {
            None | Some(Value::Null) => ActiveState::Empty,
            Some(Value::String(s)) => ActiveState::from_raw(s)?,
            Some(other) => return Err(ModelError::UnknownActiveState(other.to_string())),
        };

        let mpos = status.get("mpos").and_then(Position::from_value);
        let wpos = status.get("wpos").and_then(Position::from_value);
        let planner_free = number(status.get("buf").and_then(|buf| buf.get("planner")))
            .filter(|n| *n >= 0.0)
            .map(|n| n as u32);

        Ok(Self {
            active_state,
            mpos,
            wpos,
            planner_free,
            status,
            parser_state,
        })
    }
}

/// Everything the transport and input collaborators can deliver to a session.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    Settings(Value),
    Status(Value),
    ConnectionClosed,
    // A line the transport wrote to the firmware
    CommandEcho(String),
    // A line the firmware answered with (`ok`, `error:n`, ...)
    CommandAck(String),
    ButtonDown(u8),
    ButtonUp(u8),
    Shuttle(i8),
    // One detent of the jog wheel, signed by direction
    Jog(i8),
}

/// Commands handed to the transport, fire-and-forget.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Outbound {
    Gcode { code: String },
    Jog { axis: Axis, distance: f64, feed: f64 },
    JogCancel,
    Feedhold,
    Reset,
}
