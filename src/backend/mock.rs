use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::config::{Direction, DriverOptions, EdgeDetect, Level};
use crate::error::AppError;
use crate::gpio::{EdgeEvent, GpioBackend, PinSettings};
use crate::handlers::EdgeCallback;

const MOCK_BACKEND_EVENT_BUFFER_CAPACITY: usize = 64;

/// In-memory driver. Inputs are driven from the outside with [`MockGpioBackend::drive`].
#[derive(Default)]
pub struct MockGpioBackend {
    state: Mutex<MockState>,
    edge_signal: Condvar,
}

#[derive(Default)]
struct MockState {
    options: Option<DriverOptions>,
    pins: FxHashMap<u32, MockPinState>, // keyed by pin id
}

struct MockPinState {
    settings: PinSettings,
    value: u8,
    listener: Option<MockListener>,
    pending: VecDeque<EdgeEvent>,
}

struct MockListener {
    edge: EdgeDetect,
    debounce_ms: u64,
    callback: EdgeCallback,
    last_event: Option<Instant>,
}

impl MockGpioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options passed by the last `initialize`, if any.
    pub fn options(&self) -> Option<DriverOptions> {
        self.state.lock().options.clone()
    }

    pub fn settings(&self, pin_id: u32) -> Option<PinSettings> {
        self.state
            .lock()
            .pins
            .get(&pin_id)
            .map(|p| p.settings.clone())
    }

    pub fn is_set_up(&self, pin_id: u32) -> bool {
        self.state.lock().pins.contains_key(&pin_id)
    }

    pub fn has_event_detect(&self, pin_id: u32) -> bool {
        self.state
            .lock()
            .pins
            .get(&pin_id)
            .is_some_and(|p| p.listener.is_some())
    }

    /// Number of edges buffered for `wait_for_edge` on the pin.
    pub fn pending_edges(&self, pin_id: u32) -> usize {
        self.state
            .lock()
            .pins
            .get(&pin_id)
            .map_or(0, |p| p.pending.len())
    }

    /// Simulate an external signal on an input pin.
    pub fn drive(&self, pin_id: u32, value: u8) -> Result<(), AppError> {
        let level = Level::try_from(value)?;
        let fired = {
            let mut state = self.state.lock();
            let pin = pin_entry(&mut state, pin_id)?;
            if pin.settings.direction != Direction::In {
                return Err(AppError::Misconfigured(format!(
                    "pin {pin_id} is not an input and cannot be driven"
                )));
            }
            transition(pin_id, pin, level.as_u8())
        };
        self.notify(pin_id, fired);
        Ok(())
    }

    fn notify(&self, pin_id: u32, fired: Option<Option<EdgeCallback>>) {
        let Some(callback) = fired else {
            return;
        };
        self.edge_signal.notify_all();
        if let Some(callback) = callback {
            // lock released, callbacks may call back into the driver
            callback(pin_id);
        }
    }
}

fn pin_entry(state: &mut MockState, pin_id: u32) -> Result<&mut MockPinState, AppError> {
    state
        .pins
        .get_mut(&pin_id)
        .ok_or_else(|| AppError::Misconfigured(format!("pin {pin_id} is not set up")))
}

/// Apply a new level. Returns `Some` when an edge happened, carrying the
/// callback to run if the listener accepted it.
fn transition(pin_id: u32, pin: &mut MockPinState, value: u8) -> Option<Option<EdgeCallback>> {
    let old = pin.value;
    pin.value = value;

    let edge_kind = match (old, value) {
        (0, 1) => EdgeDetect::Rising,
        (1, 0) => EdgeDetect::Falling,
        _ => return None,
    };

    // only the configured edge is buffered for wait_for_edge
    if pin.settings.edge.is_some_and(|edge| edge.matches(edge_kind)) {
        if pin.pending.len() >= MOCK_BACKEND_EVENT_BUFFER_CAPACITY {
            pin.pending.pop_front();
        }
        pin.pending.push_back(EdgeEvent {
            pin_id,
            edge: edge_kind,
            timestamp_ms: epoch_millis(),
        });
    }

    let callback = pin.listener.as_mut().and_then(|listener| {
        if !listener.edge.matches(edge_kind) {
            return None;
        }
        let now = Instant::now();
        let allow = listener
            .last_event
            .map(|t| now.duration_since(t).as_millis() >= listener.debounce_ms as u128)
            .unwrap_or(true);
        if !allow {
            return None;
        }
        listener.last_event = Some(now);
        Some(listener.callback.clone())
    });

    Some(callback)
}

impl GpioBackend for MockGpioBackend {
    fn initialize(&self, options: &DriverOptions) -> Result<(), AppError> {
        self.state.lock().options = Some(options.clone());
        Ok(())
    }

    fn setup(&self, pin_id: u32, settings: &PinSettings) -> Result<(), AppError> {
        let mut state = self.state.lock();
        let warnings = state.options.as_ref().is_some_and(|o| o.warnings);

        if state.pins.contains_key(&pin_id) && warnings {
            warn!("pin {pin_id} is already in use, continuing anyway");
        }

        state.pins.insert(
            pin_id,
            MockPinState {
                settings: settings.clone(),
                value: settings.initial.as_u8(),
                listener: None,
                pending: VecDeque::new(),
            },
        );
        debug!("mock pin {pin_id} set up: {settings:?}");
        Ok(())
    }

    fn read_value(&self, pin_id: u32) -> Result<u8, AppError> {
        let mut state = self.state.lock();
        Ok(pin_entry(&mut state, pin_id)?.value)
    }

    fn write_value(&self, pin_id: u32, value: u8) -> Result<(), AppError> {
        let level = Level::try_from(value)?;
        let fired = {
            let mut state = self.state.lock();
            let pin = pin_entry(&mut state, pin_id)?;
            if pin.settings.direction != Direction::Out {
                return Err(AppError::Misconfigured(
                    "pin must be in output mode to set value".into(),
                ));
            }
            transition(pin_id, pin, level.as_u8())
        };
        self.notify(pin_id, fired);
        Ok(())
    }

    fn add_event_detect(
        &self,
        pin_id: u32,
        edge: EdgeDetect,
        debounce_ms: u64,
        callback: EdgeCallback,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock();
        let pin = pin_entry(&mut state, pin_id)?;
        if pin.settings.direction != Direction::In {
            return Err(AppError::Misconfigured(format!(
                "edge detection requires pin {pin_id} to be an input"
            )));
        }
        pin.listener = Some(MockListener {
            edge,
            debounce_ms,
            callback,
            last_event: None,
        });
        Ok(())
    }

    fn wait_for_edge(
        &self,
        pin_id: u32,
        edge: EdgeDetect,
        timeout: Duration,
    ) -> Result<Option<EdgeEvent>, AppError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            let pin = pin_entry(&mut state, pin_id)?;
            while let Some(event) = pin.pending.pop_front() {
                if edge.matches(event.edge) {
                    return Ok(Some(event));
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            self.edge_signal.wait_until(&mut state, deadline);
        }
    }

    fn cleanup(&self, pin_id: Option<u32>) -> Result<(), AppError> {
        let mut state = self.state.lock();
        match pin_id {
            Some(pin) => {
                state.pins.remove(&pin);
            }
            None => state.pins.clear(),
        }
        self.edge_signal.notify_all();
        Ok(())
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
