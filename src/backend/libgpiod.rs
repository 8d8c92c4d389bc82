use log::{debug, warn};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, sleep, yield_now};
use std::time::{Duration, Instant};

use libgpiod::{chip::Chip, line, line::EventClock, request};
use parking_lot::{FairMutex, RwLock};
use rustc_hash::FxHashMap;

use crate::config::{Direction, DriverOptions, EdgeDetect, Level, Resistor};
use crate::error::AppError;
use crate::gpio::{EdgeEvent, GpioBackend, PinSettings};
use crate::handlers::EdgeCallback;

const LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY: usize = 64;
const LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS: Duration = Duration::from_millis(10);

pub struct LibgpiodBackend {
    options: RwLock<DriverOptions>,
    pins: RwLock<FxHashMap<u32, PinHandle>>, // keyed by pin id
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct EdgeSettings {
    edge: EdgeDetect,
    debounce_ms: u64,
}

struct PinHandle {
    settings: PinSettings,
    edge: Option<EdgeSettings>,
    gpiod_handle: Arc<FairMutex<GpiodHandle>>,
    listener: Option<EdgeListener>, // drop in reverse order
}

struct GpiodHandle {
    request: request::Request,
    pending: VecDeque<EdgeEvent>,
}

impl GpiodHandle {
    fn new(chip: &str, line_cfg: &line::Config) -> Result<Self, AppError> {
        let chip = Self::open_chip(chip)?;
        let request = Self::request_lines(&chip, line_cfg)?;
        Ok(Self {
            request,
            pending: VecDeque::new(),
        })
    }

    /// Read one batch from the request into `pending`. Returns how many
    /// edges were buffered.
    fn read_into_pending(
        &mut self,
        pin_id: u32,
        buffer: &mut request::Buffer,
    ) -> Result<usize, AppError> {
        let events: Vec<EdgeEvent> = self
            .request
            .read_edge_events(buffer)
            .map_err(|e| AppError::Gpio(format!("read edge events: {e}")))?
            .filter_map(Result::ok)
            .filter_map(|evt| {
                edge_kind(&evt).map(|edge| EdgeEvent {
                    pin_id,
                    edge,
                    timestamp_ms: evt.timestamp().as_millis() as u64,
                })
            })
            .collect();

        let count = events.len();
        for event in events {
            if self.pending.len() >= LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY {
                self.pending.pop_front();
            }
            self.pending.push_back(event);
        }
        Ok(count)
    }

    fn take_pending(&mut self, edge: EdgeDetect) -> Option<EdgeEvent> {
        while let Some(event) = self.pending.pop_front() {
            if edge.matches(event.edge) {
                return Some(event);
            }
        }
        None
    }

    fn open_chip(path: &str) -> Result<Chip, AppError> {
        let p = PathBuf::from(path);
        Chip::open(&p).map_err(|e| AppError::Gpio(format!("open chip {path}: {e}")))
    }

    fn request_lines(chip: &Chip, line_cfg: &line::Config) -> Result<request::Request, AppError> {
        let mut req_cfg =
            request::Config::new().map_err(|e| AppError::Gpio(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| AppError::Gpio(format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| AppError::Gpio(format!("request lines: {e}")))
    }
}

fn edge_kind(evt: &request::Event) -> Option<EdgeDetect> {
    match evt.event_type() {
        Ok(line::EdgeKind::Rising) => Some(EdgeDetect::Rising),
        Ok(line::EdgeKind::Falling) => Some(EdgeDetect::Falling),
        Err(_) => None,
    }
}

/// Background thread delivering edge events of one pin to its callback.
struct EdgeListener {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EdgeListener {
    fn new(
        pin_id: u32,
        gpiod_handle: Arc<FairMutex<GpiodHandle>>,
        callback: EdgeCallback,
    ) -> Result<Self, AppError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let mut buffer = request::Buffer::new(LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY)
            .map_err(|e| AppError::Gpio(format!("event buffer: {e}")))?;

        let handle = std::thread::spawn(move || {
            while !cancel_flag.load(Ordering::Relaxed) {
                let mut fired = 0usize;
                {
                    let mut hdl = gpiod_handle.lock();

                    let has_event =
                        match hdl.request.wait_edge_events(Some(LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS)) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!("wait edge events error for pin {pin_id}: {e}");
                                drop(hdl);
                                yield_now();
                                continue;
                            }
                        };
                    if !has_event {
                        continue;
                    }

                    match hdl.read_into_pending(pin_id, &mut buffer) {
                        Ok(count) => fired = count,
                        Err(e) => warn!("{e} for pin {pin_id}"),
                    }
                }

                // request unlocked, callbacks may read or write pins
                for _ in 0..fired {
                    callback(pin_id);
                }
            }
        });

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }
}

impl Drop for EdgeListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl LibgpiodBackend {
    pub fn new() -> Result<Self, AppError> {
        Ok(Self {
            options: RwLock::new(DriverOptions::default()),
            pins: RwLock::new(FxHashMap::default()),
        })
    }

    fn make_line_settings(
        settings: &PinSettings,
        edge: Option<EdgeSettings>,
    ) -> Result<line::Settings, AppError> {
        let mut ls =
            line::Settings::new().map_err(|e| AppError::Gpio(format!("libgpiod settings: {e}")))?;

        match settings.direction {
            Direction::Out => {
                ls.set_direction(line::Direction::Output)
                    .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
                ls.set_drive(line::Drive::PushPull)
                    .map_err(|e| AppError::Gpio(format!("set drive: {e}")))?;
                ls.set_output_value(match settings.initial {
                    Level::Low => line::Value::InActive,
                    Level::High => line::Value::Active,
                })
                .map_err(|e| AppError::Gpio(format!("set output value: {e}")))?;
            }
            Direction::In => {
                ls.set_direction(line::Direction::Input)
                    .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
            }
        }

        let bias = match settings.resistor {
            Some(Resistor::PudUp) => Some(line::Bias::PullUp),
            Some(Resistor::PudDown) => Some(line::Bias::PullDown),
            None => None,
        };
        ls.set_bias(bias)
            .map_err(|e| AppError::Gpio(format!("set bias: {e}")))?;

        if let Some(EdgeSettings { edge, debounce_ms }) = edge {
            let edge = match edge {
                EdgeDetect::None => None,
                EdgeDetect::Rising => Some(line::Edge::Rising),
                EdgeDetect::Falling => Some(line::Edge::Falling),
                EdgeDetect::Both => Some(line::Edge::Both),
            };
            ls.set_edge_detection(edge)
                .map_err(|e| AppError::Gpio(format!("set edge detection: {e}")))?;
            ls.set_event_clock(EventClock::Realtime)
                .map_err(|e| AppError::Gpio(format!("set event clock: {e}")))?;
            ls.set_debounce_period(Duration::from_millis(debounce_ms));
        }

        Ok(ls)
    }

    fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, AppError> {
        let mut cfg =
            line::Config::new().map_err(|e| AppError::Gpio(format!("line config: {e}")))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(|e| AppError::Gpio(format!("line config add settings: {e}")))?;
        Ok(cfg)
    }

    fn reconfigure(handle: &mut PinHandle, edge: Option<EdgeSettings>) -> Result<(), AppError> {
        let line_settings = Self::make_line_settings(&handle.settings, edge)?;
        let line_cfg = Self::make_line_config(handle.settings.line, line_settings)?;
        handle
            .gpiod_handle
            .lock()
            .request
            .reconfigure_lines(&line_cfg)
            .map_err(|e| AppError::Gpio(format!("reconfigure lines: {e}")))?;
        handle.edge = edge;
        Ok(())
    }
}

fn not_set_up(pin_id: u32) -> AppError {
    AppError::Misconfigured(format!("pin {pin_id} is not set up"))
}

impl GpioBackend for LibgpiodBackend {
    fn initialize(&self, options: &DriverOptions) -> Result<(), AppError> {
        // fail early on a missing or inaccessible chip
        GpiodHandle::open_chip(&options.chip)?;
        *self.options.write() = options.clone();
        Ok(())
    }

    fn setup(&self, pin_id: u32, settings: &PinSettings) -> Result<(), AppError> {
        let options = self.options.read().clone();

        let existing = self.pins.write().remove(&pin_id);
        if let Some(mut existing) = existing {
            if options.warnings {
                warn!("pin {pin_id} is already in use, continuing anyway");
            }
            // joined with the table unlocked, its callback may still read pins
            existing.listener.take();
        }

        let edge = settings.edge.map(|edge| EdgeSettings {
            edge,
            debounce_ms: 0,
        });
        let line_settings = Self::make_line_settings(settings, edge)?;
        let line_cfg = Self::make_line_config(settings.line, line_settings)?;
        let gpiod_handle = Arc::new(FairMutex::new(GpiodHandle::new(&options.chip, &line_cfg)?));

        self.pins.write().insert(
            pin_id,
            PinHandle {
                settings: settings.clone(),
                edge,
                gpiod_handle,
                listener: None,
            },
        );
        debug!("line {} requested for pin {pin_id}", settings.line);
        Ok(())
    }

    fn read_value(&self, pin_id: u32) -> Result<u8, AppError> {
        let pins = self.pins.read();
        let handle = pins.get(&pin_id).ok_or_else(|| not_set_up(pin_id))?;

        let value = handle
            .gpiod_handle
            .lock()
            .request
            .value(handle.settings.line)
            .map_err(|e| AppError::Gpio(format!("get value: {e}")))?;
        Ok(match value {
            line::Value::InActive => 0,
            line::Value::Active => 1,
        })
    }

    fn write_value(&self, pin_id: u32, value: u8) -> Result<(), AppError> {
        let level = Level::try_from(value)?;
        let pins = self.pins.read();
        let handle = pins.get(&pin_id).ok_or_else(|| not_set_up(pin_id))?;

        if handle.settings.direction != Direction::Out {
            return Err(AppError::Misconfigured(
                "pin must be in output mode to set value".into(),
            ));
        }

        handle
            .gpiod_handle
            .lock()
            .request
            .set_value(
                handle.settings.line,
                match level {
                    Level::Low => line::Value::InActive,
                    Level::High => line::Value::Active,
                },
            )
            .map_err(|e| AppError::Gpio(format!("set value: {e}")))?;
        Ok(())
    }

    fn add_event_detect(
        &self,
        pin_id: u32,
        edge: EdgeDetect,
        debounce_ms: u64,
        callback: EdgeCallback,
    ) -> Result<(), AppError> {
        let previous = {
            let mut pins = self.pins.write();
            let handle = pins.get_mut(&pin_id).ok_or_else(|| not_set_up(pin_id))?;

            if handle.settings.direction != Direction::In {
                return Err(AppError::Misconfigured(format!(
                    "edge detection requires pin {pin_id} to be an input"
                )));
            }
            handle.listener.take()
        };
        drop(previous);

        let mut pins = self.pins.write();
        let handle = pins.get_mut(&pin_id).ok_or_else(|| not_set_up(pin_id))?;
        Self::reconfigure(handle, Some(EdgeSettings { edge, debounce_ms }))?;
        handle.listener = Some(EdgeListener::new(
            pin_id,
            handle.gpiod_handle.clone(),
            callback,
        )?);
        Ok(())
    }

    fn wait_for_edge(
        &self,
        pin_id: u32,
        edge: EdgeDetect,
        timeout: Duration,
    ) -> Result<Option<EdgeEvent>, AppError> {
        let (gpiod_handle, listening) = {
            let mut pins = self.pins.write();
            let handle = pins.get_mut(&pin_id).ok_or_else(|| not_set_up(pin_id))?;

            let listening = handle.listener.is_some();
            if !listening && handle.edge.map(|e| e.edge) != Some(edge) {
                Self::reconfigure(
                    handle,
                    Some(EdgeSettings {
                        edge,
                        debounce_ms: 0,
                    }),
                )?;
            }
            (handle.gpiod_handle.clone(), listening)
        };

        let mut buffer = request::Buffer::new(LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY)
            .map_err(|e| AppError::Gpio(format!("event buffer: {e}")))?;
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            {
                let mut hdl = gpiod_handle.lock();
                if let Some(event) = hdl.take_pending(edge) {
                    return Ok(Some(event));
                }

                // a listener thread owns the request and fills `pending` for us
                if !listening {
                    let has_event = hdl
                        .request
                        .wait_edge_events(Some(remaining))
                        .map_err(|e| AppError::Gpio(format!("wait edge events: {e}")))?;
                    if has_event {
                        hdl.read_into_pending(pin_id, &mut buffer)?;
                        continue;
                    }
                    return Ok(None);
                }
            }

            if remaining.is_zero() {
                return Ok(None);
            }
            sleep(remaining.min(LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS));
        }
    }

    fn cleanup(&self, pin_id: Option<u32>) -> Result<(), AppError> {
        let released: Vec<PinHandle> = {
            let mut pins = self.pins.write();
            match pin_id {
                Some(pin) => pins.remove(&pin).into_iter().collect(),
                None => pins.drain().map(|(_, handle)| handle).collect(),
            }
        };
        // listeners are joined with the table unlocked, a running callback
        // may still read or write other pins
        drop(released);
        Ok(())
    }
}
