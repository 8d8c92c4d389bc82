//! Schema checks for pin documents.
//!
//! Every entry is checked field by field and all violations are collected,
//! so a broken document reports everything wrong with it at once.

use std::collections::BTreeMap;
use std::fmt;

use rustc_hash::FxHashSet;
use serde_json::{Map, Value};

use crate::config::{Direction, EdgeDetect, Level, PinDefinition, Resistor, json_kind};
use crate::error::AppError;

const KNOWN_FIELDS: [&str; 6] = ["mode", "initial", "resistor", "event", "handler", "bounce"];

/// Violations keyed by field name. Document-level checks key by `<pin>.<field>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(BTreeMap<String, Vec<String>>);

impl ValidationErrors {
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(message.into());
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of fields with at least one violation.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    fn absorb(&mut self, prefix: &str, other: ValidationErrors) {
        for (field, messages) in other.0 {
            self.0
                .entry(format!("{prefix}.{field}"))
                .or_default()
                .extend(messages);
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.0 {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            write!(f, "{field}: {}", messages.join(", "))?;
        }
        Ok(())
    }
}

/// Closed set of upper-case keywords accepted for an enumerated field.
trait Keyword: Copy + Sized + 'static {
    const CHOICES: &'static [(&'static str, Self)];

    fn from_keyword(word: &str) -> Option<Self> {
        Self::CHOICES
            .iter()
            .find(|(name, _)| *name == word)
            .map(|(_, v)| *v)
    }

    fn expected() -> String {
        let names: Vec<&str> = Self::CHOICES.iter().map(|(name, _)| *name).collect();
        format!("Must be one of: {}", names.join(", "))
    }
}

impl Keyword for Direction {
    const CHOICES: &'static [(&'static str, Self)] =
        &[("IN", Direction::In), ("OUT", Direction::Out)];
}

impl Keyword for Level {
    const CHOICES: &'static [(&'static str, Self)] = &[("LOW", Level::Low), ("HIGH", Level::High)];
}

impl Keyword for Resistor {
    const CHOICES: &'static [(&'static str, Self)] =
        &[("PUD_UP", Resistor::PudUp), ("PUD_DOWN", Resistor::PudDown)];
}

impl Keyword for EdgeDetect {
    const CHOICES: &'static [(&'static str, Self)] = &[
        ("RISING", EdgeDetect::Rising),
        ("FALLING", EdgeDetect::Falling),
        ("BOTH", EdgeDetect::Both),
    ];
}

fn keyword<T: Keyword>(errors: &mut ValidationErrors, field: &str, value: &Value) -> Option<T> {
    let parsed = value.as_str().and_then(T::from_keyword);
    if parsed.is_none() {
        errors.add(field, T::expected());
    }
    parsed
}

fn optional_keyword<T: Keyword>(
    errors: &mut ValidationErrors,
    fields: &Map<String, Value>,
    field: &str,
) -> Option<T> {
    fields.get(field).and_then(|v| keyword(errors, field, v))
}

/// Validate a single pin entry.
pub fn validate_entry(pin: u32, entry: &Value) -> Result<PinDefinition, ValidationErrors> {
    let mut errors = ValidationErrors::default();

    let Value::Object(fields) = entry else {
        errors.add("pin", format!("Must be a mapping, got {}", json_kind(entry)));
        return Err(errors);
    };

    if pin == 0 {
        errors.add("pin", "Must be a positive integer");
    }

    for key in fields.keys() {
        if !KNOWN_FIELDS.contains(&key.as_str()) {
            errors.add(key.as_str(), "Unknown field");
        }
    }

    let direction = match fields.get("mode") {
        Some(v) => keyword::<Direction>(&mut errors, "mode", v),
        None => {
            errors.add("mode", "Required field");
            None
        }
    };
    let initial = optional_keyword::<Level>(&mut errors, fields, "initial");
    let resistor = optional_keyword::<Resistor>(&mut errors, fields, "resistor");
    let event = optional_keyword::<EdgeDetect>(&mut errors, fields, "event");

    let handler = match fields.get("handler") {
        None => None,
        Some(Value::String(name)) => Some(name.clone()),
        Some(_) => {
            errors.add("handler", "Must be a string");
            None
        }
    };

    let bounce = match fields.get("bounce") {
        None => 0,
        Some(v) => v.as_u64().unwrap_or_else(|| {
            errors.add("bounce", "Must be a non-negative integer");
            0
        }),
    };

    if direction == Some(Direction::Out) && event.is_some() {
        errors.add("event", "Edge detection requires mode IN");
    }

    match direction {
        Some(direction) if errors.is_empty() => {
            let mut definition = PinDefinition::new(pin, direction)
                .with_initial(initial.unwrap_or_default())
                .with_bounce(bounce);
            if let Some(resistor) = resistor {
                definition = definition.with_resistor(resistor);
            }
            if let Some(event) = event {
                definition = definition.with_event(event);
            }
            if let Some(handler) = handler {
                definition = definition.with_handler(handler);
            }
            Ok(definition)
        }
        _ => Err(errors),
    }
}

/// Validate a whole document keyed by pin number. Definitions come back
/// ordered by pin.
pub fn validate_document(document: &Map<String, Value>) -> Result<Vec<PinDefinition>, AppError> {
    let mut errors = ValidationErrors::default();
    let mut definitions = Vec::with_capacity(document.len());
    let mut seen = FxHashSet::default();

    for (key, entry) in document {
        let Ok(pin) = key.trim().parse::<u32>() else {
            errors.add(format!("{key}.pin"), "Must be a positive integer");
            continue;
        };
        if !seen.insert(pin) {
            errors.add(
                format!("{key}.pin"),
                format!("Pin {pin} is defined more than once"),
            );
            continue;
        }
        match validate_entry(pin, entry) {
            Ok(definition) => definitions.push(definition),
            Err(entry_errors) => errors.absorb(key, entry_errors),
        }
    }

    if !errors.is_empty() {
        return Err(AppError::Validation(errors));
    }

    definitions.sort_by_key(PinDefinition::pin);
    Ok(definitions)
}
