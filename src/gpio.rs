use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{Direction, DriverOptions, EdgeDetect, Level, PinConfig, PinDefinition, Resistor};
use crate::error::AppError;
use crate::handlers::{EdgeCallback, HandlerSet};

#[derive(Debug, Clone, Serialize)]
pub struct EdgeEvent {
    pub pin_id: u32,
    pub edge: EdgeDetect,
    pub timestamp_ms: u64,
}

/// What the driver needs to claim and set up a single line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinSettings {
    pub line: u32,
    pub direction: Direction,
    pub initial: Level,
    pub resistor: Option<Resistor>,
    /// Edge to detect from setup on, if any.
    pub edge: Option<EdgeDetect>,
}

/// The GPIO driver boundary.
pub trait GpioBackend: Send + Sync {
    fn initialize(&self, options: &DriverOptions) -> Result<(), AppError>;
    fn setup(&self, pin_id: u32, settings: &PinSettings) -> Result<(), AppError>;
    fn read_value(&self, pin_id: u32) -> Result<u8, AppError>;
    fn write_value(&self, pin_id: u32, value: u8) -> Result<(), AppError>;
    fn add_event_detect(
        &self,
        pin_id: u32,
        edge: EdgeDetect,
        debounce_ms: u64,
        callback: EdgeCallback,
    ) -> Result<(), AppError>;
    /// Return the oldest buffered `edge` on the pin, blocking until one
    /// arrives or `timeout` passes (`Ok(None)`).
    ///
    /// Drivers buffer edges of a pin set up with `PinSettings::edge` from
    /// `setup` on, so edges that happen before the first call are not lost.
    /// Edges left over from a batch stay buffered for the next call.
    fn wait_for_edge(
        &self,
        pin_id: u32,
        edge: EdgeDetect,
        timeout: Duration,
    ) -> Result<Option<EdgeEvent>, AppError>;
    /// Release one pin, or every pin when `pin_id` is `None`.
    fn cleanup(&self, pin_id: Option<u32>) -> Result<(), AppError>;
}

/// Validated definitions keyed by pin id. Entries are never replaced.
#[derive(Debug, Default)]
pub struct PinRegistry {
    pins: BTreeMap<u32, PinDefinition>,
}

impl PinRegistry {
    pub fn get(&self, pin_id: u32) -> Result<&PinDefinition, AppError> {
        self.pins.get(&pin_id).ok_or(AppError::NotFoundPin(pin_id))
    }

    pub fn contains(&self, pin_id: u32) -> bool {
        self.pins.contains_key(&pin_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PinDefinition> {
        self.pins.values()
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    fn check_new(&self, definition: &PinDefinition) -> Result<(), AppError> {
        let pin = definition.pin();
        match self.pins.get(&pin) {
            None => Ok(()),
            Some(existing) => match existing.conflicting_field(definition) {
                Some(field) => Err(AppError::Immutable { pin, field }),
                None => Err(AppError::Config(format!(
                    "Pin {pin} is defined more than once"
                ))),
            },
        }
    }

    fn insert(&mut self, definition: PinDefinition) {
        self.pins.insert(definition.pin(), definition);
    }
}

struct PlannedPin {
    definition: PinDefinition,
    settings: PinSettings,
    callback: Option<(EdgeDetect, EdgeCallback)>,
}

/// Applies pin definitions through a [`GpioBackend`] and guards reads and
/// writes against the registry.
pub struct GpioManager<B: GpioBackend> {
    backend: Arc<B>,
    options: DriverOptions,
    handlers: HandlerSet,
    registry: PinRegistry,
}

impl<B: GpioBackend> GpioManager<B> {
    pub fn new(
        backend: Arc<B>,
        options: DriverOptions,
        handlers: HandlerSet,
    ) -> Result<Self, AppError> {
        backend.initialize(&options)?;
        debug!(
            "driver initialized on {} with {:?} numbering",
            options.chip, options.numbering
        );

        Ok(Self {
            backend,
            options,
            handlers,
            registry: PinRegistry::default(),
        })
    }

    /// Build a manager and configure every pin of `config`.
    pub fn from_config(
        backend: Arc<B>,
        options: DriverOptions,
        handlers: HandlerSet,
        config: PinConfig,
    ) -> Result<Self, AppError> {
        let mut manager = Self::new(backend, options, handlers)?;
        manager.configure(config)?;
        Ok(manager)
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    pub fn registry(&self) -> &PinRegistry {
        &self.registry
    }

    /// Set up each pin and register edge callbacks. Everything is checked
    /// before the driver is touched, and pins of a batch that fails halfway
    /// are released again.
    pub fn configure<I>(&mut self, definitions: I) -> Result<(), AppError>
    where
        I: IntoIterator<Item = PinDefinition>,
    {
        self.configure_with(definitions, true)
    }

    /// Like [`GpioManager::configure`], but no edge callbacks are registered
    /// and handler names are not resolved. Events stay available through
    /// [`GpioManager::wait_for_edge`].
    pub fn configure_without_callbacks<I>(&mut self, definitions: I) -> Result<(), AppError>
    where
        I: IntoIterator<Item = PinDefinition>,
    {
        self.configure_with(definitions, false)
    }

    fn configure_with<I>(&mut self, definitions: I, callbacks: bool) -> Result<(), AppError>
    where
        I: IntoIterator<Item = PinDefinition>,
    {
        let mut planned: Vec<PlannedPin> = Vec::new();
        let mut batch = PinRegistry::default();

        for definition in definitions {
            self.registry.check_new(&definition)?;
            batch.check_new(&definition)?;
            let plan = self.plan(&definition, callbacks)?;
            batch.insert(definition);
            planned.push(plan);
        }

        let mut applied: Vec<u32> = Vec::with_capacity(planned.len());
        for plan in &planned {
            let pin = plan.definition.pin();
            if let Err(e) = self.apply(plan, &mut applied) {
                warn!("configuring pin {pin} failed, releasing {} pins", applied.len());
                for released in applied {
                    if let Err(cleanup_err) = self.backend.cleanup(Some(released)) {
                        warn!("release of pin {released} failed: {cleanup_err}");
                    }
                }
                return Err(e);
            }
        }

        for plan in planned {
            info!(
                "pin {} configured as {:?} (line {})",
                plan.definition.pin(),
                plan.definition.direction(),
                plan.settings.line
            );
            self.registry.insert(plan.definition);
        }

        Ok(())
    }

    fn apply(&self, plan: &PlannedPin, applied: &mut Vec<u32>) -> Result<(), AppError> {
        let pin = plan.definition.pin();
        self.backend.setup(pin, &plan.settings)?;
        applied.push(pin);
        if let Some((edge, callback)) = &plan.callback {
            self.backend
                .add_event_detect(pin, *edge, plan.definition.bounce(), callback.clone())?;
        }
        Ok(())
    }

    fn plan(&self, definition: &PinDefinition, callbacks: bool) -> Result<PlannedPin, AppError> {
        let pin = definition.pin();
        if pin == 0 {
            return Err(AppError::Misconfigured(
                "pin must be a positive integer".into(),
            ));
        }
        if definition.event().is_some() && definition.direction() != Direction::In {
            return Err(AppError::Misconfigured(format!(
                "edge detection requires pin {pin} to be an input"
            )));
        }

        let line = self.options.numbering.line(pin).ok_or_else(|| {
            AppError::Misconfigured(format!(
                "pin {pin} is not a GPIO line in {:?} numbering",
                self.options.numbering
            ))
        })?;

        let callback = match (definition.event(), definition.handler()) {
            (Some(edge), Some(name)) if callbacks => {
                let callback = self.handlers.resolve(name).ok_or_else(|| {
                    AppError::Misconfigured(format!(
                        "handler '{name}' for pin {pin} is not registered"
                    ))
                })?;
                Some((edge, callback))
            }
            _ => None,
        };

        Ok(PlannedPin {
            definition: definition.clone(),
            settings: PinSettings {
                line,
                direction: definition.direction(),
                initial: definition.initial(),
                resistor: definition.resistor(),
                edge: definition.event(),
            },
            callback,
        })
    }

    pub fn get_config(&self, pin_id: u32) -> Result<PinDefinition, AppError> {
        self.registry.get(pin_id).cloned()
    }

    pub fn definitions(&self) -> Vec<PinDefinition> {
        self.registry.iter().cloned().collect()
    }

    pub fn read(&self, pin_id: u32) -> Result<u8, AppError> {
        self.registry.get(pin_id)?;
        self.backend.read_value(pin_id)
    }

    pub fn write(&self, pin_id: u32, value: u8) -> Result<(), AppError> {
        let level = Level::try_from(value)?;
        let definition = self.registry.get(pin_id)?;

        if definition.direction() != Direction::Out {
            return Err(AppError::Misconfigured(format!(
                "Pin {pin_id} not set as 'OUT' in configuration"
            )));
        }

        self.backend.write_value(pin_id, level.as_u8())
    }

    pub fn on(&self, pin_id: u32) -> Result<(), AppError> {
        self.write(pin_id, 1)
    }

    pub fn off(&self, pin_id: u32) -> Result<(), AppError> {
        self.write(pin_id, 0)
    }

    /// Return the oldest buffered edge of the pin's configured kind, or block
    /// until one arrives or `timeout` passes.
    pub fn wait_for_edge(
        &self,
        pin_id: u32,
        timeout: Duration,
    ) -> Result<Option<EdgeEvent>, AppError> {
        let definition = self.registry.get(pin_id)?;
        let edge = definition.event().ok_or_else(|| {
            AppError::Misconfigured(format!("Pin {pin_id} has no 'event' configured"))
        })?;
        self.backend.wait_for_edge(pin_id, edge, timeout)
    }

    pub fn cleanup(&self, pin_id: Option<u32>) -> Result<(), AppError> {
        if let Some(pin) = pin_id {
            self.registry.get(pin)?;
        }
        self.backend.cleanup(pin_id)?;
        match pin_id {
            Some(pin) => info!("pin {pin} released"),
            None => info!("all pins released"),
        }
        Ok(())
    }
}
