use std::{fs, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AppError;
use crate::validation;

pub const DEFAULT_CHIP: &str = "/dev/gpiochip0";

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    #[default]
    Low,
    High,
}

impl Level {
    pub fn as_u8(self) -> u8 {
        match self {
            Level::Low => 0,
            Level::High => 1,
        }
    }
}

impl TryFrom<u8> for Level {
    type Error = AppError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Level::Low),
            1 => Ok(Level::High),
            _ => Err(AppError::InvalidValue("Value must be 0 or 1".into())),
        }
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resistor {
    PudUp,
    PudDown,
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum EdgeDetect {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl EdgeDetect {
    pub fn matches(self, observed: EdgeDetect) -> bool {
        match self {
            EdgeDetect::None => false,
            EdgeDetect::Rising => observed == EdgeDetect::Rising,
            EdgeDetect::Falling => observed == EdgeDetect::Falling,
            EdgeDetect::Both => matches!(observed, EdgeDetect::Rising | EdgeDetect::Falling),
        }
    }
}

/// How pin identifiers in a configuration map onto chip line offsets.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Numbering {
    /// Broadcom SoC numbering, the identifier is the line offset.
    #[default]
    Bcm,
    /// Physical pin positions on the 40-pin header.
    Board,
}

// physical header position -> BCM line
const BOARD_TO_BCM: [(u32, u32); 28] = [
    (3, 2),
    (5, 3),
    (7, 4),
    (8, 14),
    (10, 15),
    (11, 17),
    (12, 18),
    (13, 27),
    (15, 22),
    (16, 23),
    (18, 24),
    (19, 10),
    (21, 9),
    (22, 25),
    (23, 11),
    (24, 8),
    (26, 7),
    (27, 0),
    (28, 1),
    (29, 5),
    (31, 6),
    (32, 12),
    (33, 13),
    (35, 19),
    (36, 16),
    (37, 26),
    (38, 20),
    (40, 21),
];

impl Numbering {
    /// Resolve a pin identifier to a line offset. `None` for header positions
    /// that are power, ground or otherwise not a GPIO.
    pub fn line(self, pin: u32) -> Option<u32> {
        match self {
            Numbering::Bcm => Some(pin),
            Numbering::Board => BOARD_TO_BCM
                .iter()
                .find(|(board, _)| *board == pin)
                .map(|(_, bcm)| *bcm),
        }
    }
}

/// Process-wide driver settings, passed explicitly to whatever needs them.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DriverOptions {
    pub chip: String,
    pub numbering: Numbering,
    pub warnings: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            chip: DEFAULT_CHIP.to_string(),
            numbering: Numbering::Bcm,
            warnings: false,
        }
    }
}

/// A validated pin definition. Fields can only be read once constructed.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct PinDefinition {
    pin: u32,
    #[serde(rename = "mode")]
    direction: Direction,
    initial: Level,
    resistor: Option<Resistor>,
    event: Option<EdgeDetect>,
    handler: Option<String>,
    bounce: u64,
}

impl PinDefinition {
    pub fn new(pin: u32, direction: Direction) -> Self {
        Self {
            pin,
            direction,
            initial: Level::Low,
            resistor: None,
            event: None,
            handler: None,
            bounce: 0,
        }
    }

    pub fn with_initial(mut self, initial: Level) -> Self {
        self.initial = initial;
        self
    }

    pub fn with_resistor(mut self, resistor: Resistor) -> Self {
        self.resistor = Some(resistor);
        self
    }

    pub fn with_event(mut self, event: EdgeDetect) -> Self {
        self.event = match event {
            EdgeDetect::None => None,
            edge => Some(edge),
        };
        self
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn with_bounce(mut self, bounce_ms: u64) -> Self {
        self.bounce = bounce_ms;
        self
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn initial(&self) -> Level {
        self.initial
    }

    pub fn resistor(&self) -> Option<Resistor> {
        self.resistor
    }

    pub fn event(&self) -> Option<EdgeDetect> {
        self.event
    }

    pub fn handler(&self) -> Option<&str> {
        self.handler.as_deref()
    }

    /// Debounce interval in milliseconds.
    pub fn bounce(&self) -> u64 {
        self.bounce
    }

    /// First of the fixed fields (mode, initial, resistor) that differs.
    pub(crate) fn conflicting_field(&self, other: &PinDefinition) -> Option<&'static str> {
        if self.direction != other.direction {
            Some("mode")
        } else if self.initial != other.initial {
            Some("initial")
        } else if self.resistor != other.resistor {
            Some("resistor")
        } else {
            None
        }
    }
}

/// Where a pin document comes from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    File(PathBuf),
    Value(Value),
}

impl ConfigSource {
    /// Read the raw document. It must be a mapping of pin id to pin entry.
    pub fn read(self) -> Result<Map<String, Value>, AppError> {
        let document = match self {
            ConfigSource::File(path) => {
                let contents = fs::read_to_string(&path).map_err(|e| {
                    AppError::Config(format!("Failed to read config {}: {e}", path.display()))
                })?;
                if is_yaml(&path) {
                    let document = serde_yaml::from_str::<serde_yaml::Value>(&contents)
                        .map_err(|e| AppError::Config(format!("Invalid config yaml: {e}")))?;
                    yaml_to_json(document)?
                } else {
                    serde_json::from_str::<Value>(&contents)
                        .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))?
                }
            }
            ConfigSource::Value(value) => value,
        };

        match document {
            Value::Object(map) => Ok(map),
            other => Err(AppError::Config(format!(
                "Config must be a mapping of pin number to pin settings, got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
}

/// YAML allows non-string mapping keys (`18:`); they become their text form.
fn yaml_to_json(value: serde_yaml::Value) -> Result<Value, AppError> {
    Ok(match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Value::from(u)
            } else if let Some(i) = n.as_i64() {
                Value::from(i)
            } else {
                n.as_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| AppError::Config(format!("Invalid number in config: {n}")))?
            }
        }
        serde_yaml::Value::String(s) => Value::String(s),
        serde_yaml::Value::Sequence(items) => Value::Array(
            items
                .into_iter()
                .map(yaml_to_json)
                .collect::<Result<_, _>>()?,
        ),
        serde_yaml::Value::Mapping(mapping) => {
            let mut map = Map::with_capacity(mapping.len());
            for (key, value) in mapping {
                let key = match key {
                    serde_yaml::Value::String(s) => s,
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    other => {
                        return Err(AppError::Config(format!(
                            "Unsupported mapping key in config: {other:?}"
                        )));
                    }
                };
                map.insert(key, yaml_to_json(value)?);
            }
            Value::Object(map)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(tagged.value)?,
    })
}

impl From<PathBuf> for ConfigSource {
    fn from(path: PathBuf) -> Self {
        ConfigSource::File(path)
    }
}

impl From<&Path> for ConfigSource {
    fn from(path: &Path) -> Self {
        ConfigSource::File(path.to_path_buf())
    }
}

impl From<Value> for ConfigSource {
    fn from(value: Value) -> Self {
        ConfigSource::Value(value)
    }
}

/// A loaded and validated pin document, ordered by pin id.
#[derive(Debug, Clone, Default)]
pub struct PinConfig {
    pins: Vec<PinDefinition>,
}

impl PinConfig {
    pub fn load(source: Option<ConfigSource>) -> Result<Self, AppError> {
        let source = source.ok_or_else(|| {
            AppError::Config("Either a config file or a config mapping is required".into())
        })?;
        let document = source.read()?;
        let pins = validation::validate_document(&document)?;
        Ok(Self { pins })
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        Self::load(Some(ConfigSource::File(path.as_ref().to_path_buf())))
    }

    pub fn from_value(value: Value) -> Result<Self, AppError> {
        Self::load(Some(ConfigSource::Value(value)))
    }

    pub fn pins(&self) -> &[PinDefinition] {
        &self.pins
    }

    pub fn get(&self, pin: u32) -> Option<&PinDefinition> {
        self.pins.iter().find(|d| d.pin == pin)
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}

impl IntoIterator for PinConfig {
    type Item = PinDefinition;
    type IntoIter = std::vec::IntoIter<PinDefinition>;

    fn into_iter(self) -> Self::IntoIter {
        self.pins.into_iter()
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}
