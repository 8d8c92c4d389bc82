pub mod backend;
pub mod config;
mod error;
pub mod gpio;
mod handlers;
pub mod validation;
pub mod watcher;

pub use config::{
    ConfigSource, Direction, DriverOptions, EdgeDetect, Level, Numbering, PinConfig,
    PinDefinition, Resistor,
};
pub use error::AppError;
pub use gpio::{EdgeEvent, GpioBackend, GpioManager, PinRegistry, PinSettings};
pub use handlers::{EdgeCallback, HandlerSet};
pub use validation::ValidationErrors;
pub use watcher::{MultiPinWatcher, Shutdown, SinglePinWatcher};

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::MockGpioBackend;
