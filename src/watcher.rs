//! Blocking front-ends that keep a process alive while edges are handled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::Duration;

use log::{info, warn};
use tokio::task::JoinHandle;

use crate::config::{DriverOptions, PinConfig};
use crate::error::AppError;
use crate::gpio::{EdgeEvent, GpioBackend, GpioManager};
use crate::handlers::HandlerSet;

const WATCHER_IDLE_INTERVAL: Duration = Duration::from_millis(250);
const WATCHER_EDGE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cancellation flag shared between a watcher and whoever stops it.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Waits on a single pin and runs `action` once per matching edge.
pub struct SinglePinWatcher<B, F>
where
    B: GpioBackend,
    F: FnMut(&GpioManager<B>, &EdgeEvent) + Send,
{
    manager: GpioManager<B>,
    pin_id: u32,
    bounce: Duration,
    action: F,
}

impl<B, F> SinglePinWatcher<B, F>
where
    B: GpioBackend,
    F: FnMut(&GpioManager<B>, &EdgeEvent) + Send,
{
    pub fn new(
        backend: Arc<B>,
        options: DriverOptions,
        config: PinConfig,
        action: F,
    ) -> Result<Self, AppError> {
        let [definition] = config.pins() else {
            return Err(AppError::Misconfigured(
                "Only one pin can be defined for a SinglePinWatcher".into(),
            ));
        };
        if definition.event().is_none() {
            return Err(AppError::Misconfigured(
                "Pin config requires properties: mode, event".into(),
            ));
        }
        if definition.handler().is_some() {
            return Err(AppError::Misconfigured(
                "SinglePinWatcher runs its action, 'handler' is not allowed".into(),
            ));
        }

        let pin_id = definition.pin();
        let bounce = Duration::from_millis(definition.bounce());
        let manager = GpioManager::from_config(backend, options, HandlerSet::new(), config)?;

        Ok(Self {
            manager,
            pin_id,
            bounce,
            action,
        })
    }

    pub fn manager(&self) -> &GpioManager<B> {
        &self.manager
    }

    /// Block until `shutdown` fires, then release every pin.
    pub fn run(&mut self, shutdown: &Shutdown) -> Result<(), AppError> {
        info!("watching pin {}", self.pin_id);
        let result = self.watch(shutdown);
        self.manager.cleanup(None)?;
        result
    }

    fn watch(&mut self, shutdown: &Shutdown) -> Result<(), AppError> {
        while !shutdown.is_triggered() {
            let Some(event) = self
                .manager
                .wait_for_edge(self.pin_id, WATCHER_EDGE_POLL_INTERVAL)?
            else {
                continue;
            };

            (self.action)(&self.manager, &event);

            if !self.bounce.is_zero() {
                sleep(self.bounce);
                // edges seen while sleeping are bounces
                while self
                    .manager
                    .wait_for_edge(self.pin_id, Duration::ZERO)?
                    .is_some()
                {}
            }
        }
        Ok(())
    }
}

impl<B, F> SinglePinWatcher<B, F>
where
    B: GpioBackend + 'static,
    F: FnMut(&GpioManager<B>, &EdgeEvent) + Send + 'static,
{
    /// Run on a blocking task until Ctrl-C.
    pub async fn start(mut self) -> Result<(), AppError> {
        let shutdown = Shutdown::new();
        let flag = shutdown.clone();
        let worker = tokio::task::spawn_blocking(move || self.run(&flag));
        run_until_interrupted(worker, shutdown).await
    }
}

/// Registers a callback for every pin and idles while the driver delivers
/// edges on its own threads.
pub struct MultiPinWatcher<B: GpioBackend> {
    manager: GpioManager<B>,
}

impl<B: GpioBackend> MultiPinWatcher<B> {
    pub fn new(
        backend: Arc<B>,
        options: DriverOptions,
        config: PinConfig,
        handlers: HandlerSet,
    ) -> Result<Self, AppError> {
        for definition in config.pins() {
            if definition.event().is_none() || definition.handler().is_none() {
                return Err(AppError::Misconfigured(format!(
                    "Pin {} config requires properties: mode, event, handler",
                    definition.pin()
                )));
            }
        }

        let manager = GpioManager::from_config(backend, options, handlers, config)?;
        Ok(Self { manager })
    }

    pub fn manager(&self) -> &GpioManager<B> {
        &self.manager
    }

    /// Block until `shutdown` fires, then release every pin.
    pub fn run(&self, shutdown: &Shutdown) -> Result<(), AppError> {
        info!("watching {} pins", self.manager.registry().len());
        while !shutdown.is_triggered() {
            sleep(WATCHER_IDLE_INTERVAL);
        }
        self.manager.cleanup(None)
    }
}

impl<B: GpioBackend + 'static> MultiPinWatcher<B> {
    /// Run on a blocking task until Ctrl-C.
    pub async fn start(self) -> Result<(), AppError> {
        let shutdown = Shutdown::new();
        let flag = shutdown.clone();
        let worker = tokio::task::spawn_blocking(move || self.run(&flag));
        run_until_interrupted(worker, shutdown).await
    }
}

async fn run_until_interrupted(
    mut worker: JoinHandle<Result<(), AppError>>,
    shutdown: Shutdown,
) -> Result<(), AppError> {
    tokio::select! {
        joined = &mut worker => return flatten(joined),
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("failed to listen for interrupt: {e}");
            }
            info!("interrupted, releasing pins");
        }
    }

    shutdown.trigger();
    flatten(worker.await)
}

fn flatten(joined: Result<Result<(), AppError>, tokio::task::JoinError>) -> Result<(), AppError> {
    joined.map_err(|e| AppError::Gpio(format!("watcher task failed: {e}")))?
}
