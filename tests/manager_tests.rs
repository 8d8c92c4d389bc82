use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::sleep;
use std::time::Duration;

use pinmgr::{
    AppError, Direction, DriverOptions, EdgeCallback, EdgeDetect, EdgeEvent, GpioBackend,
    GpioManager, HandlerSet, Level, MockGpioBackend, Numbering, PinConfig, PinDefinition,
    PinSettings, Resistor,
};
use serde_json::json;

fn sample_config() -> PinConfig {
    PinConfig::from_value(json!({
        "18": {
            "mode": "OUT",
            "initial": "LOW"
        },
        "23": {
            "mode": "IN",
            "resistor": "PUD_DOWN",
            "event": "RISING",
            "handler": "do_something",
            "bounce": 200
        },
        "24": {
            "mode": "IN",
            "initial": "HIGH",
            "resistor": "PUD_UP"
        }
    }))
    .expect("valid sample config")
}

fn counting_handlers() -> (HandlerSet, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let handlers = HandlerSet::new().with("do_something", move |pin| {
        assert_eq!(pin, 23);
        seen.fetch_add(1, Ordering::SeqCst);
    });
    (handlers, count)
}

fn sample_manager() -> (
    GpioManager<MockGpioBackend>,
    Arc<MockGpioBackend>,
    Arc<AtomicUsize>,
) {
    let backend = Arc::new(MockGpioBackend::default());
    let (handlers, count) = counting_handlers();
    let manager = GpioManager::from_config(
        backend.clone(),
        DriverOptions::default(),
        handlers,
        sample_config(),
    )
    .expect("manager configures");
    (manager, backend, count)
}

#[test]
fn read_after_configure_returns_initial_level() {
    let (manager, _, _) = sample_manager();
    assert_eq!(manager.read(18).unwrap(), 0);
    assert_eq!(manager.read(23).unwrap(), 0);
    assert_eq!(manager.read(24).unwrap(), 1);
}

#[test]
fn write_to_output_pin() {
    let (manager, _, _) = sample_manager();
    assert_eq!(manager.read(18).unwrap(), 0);

    manager.write(18, 1).expect("OUT pin is writable");
    assert_eq!(manager.read(18).unwrap(), 1);

    manager.off(18).unwrap();
    assert_eq!(manager.read(18).unwrap(), 0);
    manager.on(18).unwrap();
    assert_eq!(manager.read(18).unwrap(), 1);
}

#[test]
fn write_to_input_pin_is_misconfigured() {
    let (manager, _, _) = sample_manager();
    for level in [0, 1] {
        let err = manager.write(23, level).unwrap_err();
        assert!(matches!(err, AppError::Misconfigured(_)), "{err}");
    }
    assert!(matches!(
        manager.write(24, 1),
        Err(AppError::Misconfigured(_))
    ));
}

#[test]
fn write_rejects_levels_other_than_zero_or_one() {
    let (manager, _, _) = sample_manager();
    let err = manager.write(18, 2).unwrap_err();
    assert!(matches!(err, AppError::InvalidValue(_)), "{err}");
    assert_eq!(manager.read(18).unwrap(), 0);
}

#[test]
fn undefined_pins_are_not_defined() {
    let (manager, _, _) = sample_manager();
    for pin in [0, 1, 17, 21, 99, u32::MAX] {
        assert!(matches!(manager.read(pin), Err(AppError::NotFoundPin(p)) if p == pin));
        assert!(matches!(manager.write(pin, 1), Err(AppError::NotFoundPin(p)) if p == pin));
        assert!(matches!(manager.get_config(pin), Err(AppError::NotFoundPin(p)) if p == pin));
    }
}

#[test]
fn get_config_returns_validated_definition() {
    let (manager, _, _) = sample_manager();
    let button = manager.get_config(23).unwrap();

    assert_eq!(button.direction(), Direction::In);
    assert_eq!(button.resistor(), Some(Resistor::PudDown));
    assert_eq!(button.bounce(), 200);
    assert_eq!(button.handler(), Some("do_something"));

    let pins: Vec<u32> = manager.definitions().iter().map(|d| d.pin()).collect();
    assert_eq!(pins, vec![18, 23, 24]);
}

#[test]
fn fixed_fields_cannot_be_redefined() {
    let (mut manager, _, _) = sample_manager();

    let err = manager
        .configure([PinDefinition::new(18, Direction::In)])
        .unwrap_err();
    assert!(matches!(err, AppError::Immutable { pin: 18, field: "mode" }), "{err}");

    let err = manager
        .configure([PinDefinition::new(18, Direction::Out).with_initial(Level::High)])
        .unwrap_err();
    assert!(matches!(err, AppError::Immutable { pin: 18, field: "initial" }), "{err}");

    let err = manager
        .configure([PinDefinition::new(18, Direction::Out).with_resistor(Resistor::PudUp)])
        .unwrap_err();
    assert!(matches!(err, AppError::Immutable { pin: 18, field: "resistor" }), "{err}");

    let err = manager
        .configure([PinDefinition::new(18, Direction::Out)])
        .unwrap_err();
    assert!(matches!(err, AppError::Config(_)), "{err}");

    assert_eq!(manager.get_config(18).unwrap().direction(), Direction::Out);
    manager.write(18, 1).expect("still an output");
}

#[test]
fn pin_repeated_within_one_batch_is_rejected() {
    let backend = Arc::new(MockGpioBackend::default());
    let mut manager =
        GpioManager::new(backend.clone(), DriverOptions::default(), HandlerSet::new()).unwrap();

    let err = manager
        .configure([
            PinDefinition::new(5, Direction::Out),
            PinDefinition::new(5, Direction::In),
        ])
        .unwrap_err();
    assert!(matches!(err, AppError::Immutable { pin: 5, field: "mode" }), "{err}");
    assert!(!backend.is_set_up(5));
    assert!(manager.registry().is_empty());
}

#[test]
fn unknown_handler_is_rejected_before_any_pin_is_set_up() {
    let backend = Arc::new(MockGpioBackend::default());
    let config = PinConfig::from_value(json!({
        "18": { "mode": "OUT" },
        "23": { "mode": "IN", "event": "BOTH", "handler": "missing" }
    }))
    .unwrap();

    let err = GpioManager::from_config(
        backend.clone(),
        DriverOptions::default(),
        HandlerSet::new(),
        config,
    )
    .err()
    .expect("unknown handler must fail");

    assert!(matches!(err, AppError::Misconfigured(_)), "{err}");
    assert!(err.to_string().contains("missing"));
    assert!(!backend.is_set_up(18));
    assert!(!backend.is_set_up(23));
}

#[test]
fn edge_callback_follows_configured_edge_and_debounce() {
    let (_manager, backend, count) = sample_manager();
    assert!(backend.has_event_detect(23));
    assert!(!backend.has_event_detect(24));

    backend.drive(23, 1).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    // falling edge is not subscribed
    backend.drive(23, 0).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    // within the 200ms bounce window
    backend.drive(23, 1).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    backend.drive(23, 0).unwrap();
    sleep(Duration::from_millis(250));
    backend.drive(23, 1).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn event_without_handler_registers_no_callback() {
    let backend = Arc::new(MockGpioBackend::default());
    let config = PinConfig::from_value(json!({
        "23": { "mode": "IN", "event": "FALLING" }
    }))
    .unwrap();

    let manager = GpioManager::from_config(
        backend.clone(),
        DriverOptions::default(),
        HandlerSet::new(),
        config,
    )
    .unwrap();

    assert!(backend.is_set_up(23));
    assert!(!backend.has_event_detect(23));

    backend.drive(23, 1).unwrap();
    backend.drive(23, 0).unwrap();
    let event = manager
        .wait_for_edge(23, Duration::from_millis(10))
        .unwrap()
        .expect("falling edge was buffered");
    assert_eq!(event.pin_id, 23);
}

#[test]
fn wait_for_edge_requires_an_event() {
    let (manager, _, _) = sample_manager();
    let err = manager
        .wait_for_edge(24, Duration::from_millis(1))
        .unwrap_err();
    assert!(matches!(err, AppError::Misconfigured(_)), "{err}");
}

#[test]
fn wait_for_edge_times_out_without_edges() {
    let (manager, _, _) = sample_manager();
    let event = manager.wait_for_edge(23, Duration::from_millis(20)).unwrap();
    assert!(event.is_none());
}

#[test]
fn driver_is_initialized_with_options() {
    let backend = Arc::new(MockGpioBackend::default());
    let options = DriverOptions {
        chip: "/dev/gpiochip4".into(),
        numbering: Numbering::Board,
        warnings: true,
    };

    let _manager = GpioManager::new(backend.clone(), options, HandlerSet::new()).unwrap();

    let seen = backend.options().expect("initialized");
    assert_eq!(seen.chip, "/dev/gpiochip4");
    assert_eq!(seen.numbering, Numbering::Board);
    assert!(seen.warnings);
}

#[test]
fn board_numbering_resolves_lines() {
    let backend = Arc::new(MockGpioBackend::default());
    let options = DriverOptions {
        numbering: Numbering::Board,
        ..DriverOptions::default()
    };
    let mut manager = GpioManager::new(backend.clone(), options, HandlerSet::new()).unwrap();

    manager
        .configure([PinDefinition::new(12, Direction::Out)])
        .unwrap();
    assert_eq!(backend.settings(12).map(|s| s.line), Some(18));

    let err = manager
        .configure([PinDefinition::new(1, Direction::Out)])
        .unwrap_err();
    assert!(matches!(err, AppError::Misconfigured(_)), "{err}");
}

#[test]
fn cleanup_releases_pins() {
    let (manager, backend, _) = sample_manager();

    manager.cleanup(Some(18)).unwrap();
    assert!(!backend.is_set_up(18));
    assert!(backend.is_set_up(23));
    assert!(matches!(manager.read(18), Err(AppError::Misconfigured(_))));

    assert!(matches!(
        manager.cleanup(Some(21)),
        Err(AppError::NotFoundPin(21))
    ));

    manager.cleanup(None).unwrap();
    assert!(!backend.is_set_up(23));
    assert!(!backend.is_set_up(24));
}

/// Mock driver whose `setup` fails for one pin.
#[derive(Default)]
struct FailingSetup {
    inner: MockGpioBackend,
    broken_pin: u32,
}

impl GpioBackend for FailingSetup {
    fn initialize(&self, options: &DriverOptions) -> Result<(), AppError> {
        self.inner.initialize(options)
    }

    fn setup(&self, pin_id: u32, settings: &PinSettings) -> Result<(), AppError> {
        if pin_id == self.broken_pin {
            return Err(AppError::Gpio(format!("line {} is busy", settings.line)));
        }
        self.inner.setup(pin_id, settings)
    }

    fn read_value(&self, pin_id: u32) -> Result<u8, AppError> {
        self.inner.read_value(pin_id)
    }

    fn write_value(&self, pin_id: u32, value: u8) -> Result<(), AppError> {
        self.inner.write_value(pin_id, value)
    }

    fn add_event_detect(
        &self,
        pin_id: u32,
        edge: EdgeDetect,
        debounce_ms: u64,
        callback: EdgeCallback,
    ) -> Result<(), AppError> {
        self.inner.add_event_detect(pin_id, edge, debounce_ms, callback)
    }

    fn wait_for_edge(
        &self,
        pin_id: u32,
        edge: EdgeDetect,
        timeout: Duration,
    ) -> Result<Option<EdgeEvent>, AppError> {
        self.inner.wait_for_edge(pin_id, edge, timeout)
    }

    fn cleanup(&self, pin_id: Option<u32>) -> Result<(), AppError> {
        self.inner.cleanup(pin_id)
    }
}

#[test]
fn driver_failure_mid_batch_releases_earlier_pins() {
    let backend = Arc::new(FailingSetup {
        broken_pin: 25,
        ..FailingSetup::default()
    });
    let (handlers, _) = counting_handlers();
    let mut manager = GpioManager::new(backend.clone(), DriverOptions::default(), handlers).unwrap();

    let err = manager
        .configure([
            PinDefinition::new(18, Direction::Out),
            PinDefinition::new(23, Direction::In)
                .with_event(EdgeDetect::Rising)
                .with_handler("do_something"),
            PinDefinition::new(25, Direction::Out),
        ])
        .unwrap_err();

    assert!(matches!(err, AppError::Gpio(_)), "{err}");
    assert!(!backend.inner.is_set_up(18));
    assert!(!backend.inner.is_set_up(23));
    assert!(manager.registry().is_empty());

    // the same pins can be configured once the line is free again
    manager
        .configure([PinDefinition::new(18, Direction::Out)])
        .expect("pin 18 is free");
    assert!(backend.inner.is_set_up(18));
}

#[test]
fn edge_on_output_pin_is_rejected_before_setup() {
    let backend = Arc::new(MockGpioBackend::default());
    let (handlers, _) = counting_handlers();
    let mut manager = GpioManager::new(backend.clone(), DriverOptions::default(), handlers).unwrap();

    let err = manager
        .configure([
            PinDefinition::new(24, Direction::In),
            PinDefinition::new(18, Direction::Out)
                .with_event(EdgeDetect::Both)
                .with_handler("do_something"),
        ])
        .unwrap_err();

    assert!(matches!(err, AppError::Misconfigured(_)), "{err}");
    assert!(!backend.is_set_up(24));
    assert!(!backend.is_set_up(18));
    assert!(manager.registry().is_empty());
}

#[test]
fn pin_zero_is_rejected_before_setup() {
    let backend = Arc::new(MockGpioBackend::default());
    let mut manager =
        GpioManager::new(backend.clone(), DriverOptions::default(), HandlerSet::new()).unwrap();

    let err = manager
        .configure([
            PinDefinition::new(18, Direction::Out),
            PinDefinition::new(0, Direction::Out),
        ])
        .unwrap_err();

    assert!(matches!(err, AppError::Misconfigured(_)), "{err}");
    assert!(!backend.is_set_up(18));
    assert!(!backend.is_set_up(0));
}

#[test]
fn configure_without_callbacks_ignores_handler_names() {
    let backend = Arc::new(MockGpioBackend::default());
    let mut manager =
        GpioManager::new(backend.clone(), DriverOptions::default(), HandlerSet::new()).unwrap();

    manager
        .configure_without_callbacks(sample_config())
        .expect("handlers are not resolved");

    assert!(!backend.has_event_detect(23));
    assert_eq!(manager.read(24).unwrap(), 1);
    manager.on(18).unwrap();
    assert_eq!(manager.read(18).unwrap(), 1);

    backend.drive(23, 1).unwrap();
    let event = manager
        .wait_for_edge(23, Duration::from_millis(10))
        .unwrap()
        .expect("rising edge buffered");
    assert_eq!(event.edge, EdgeDetect::Rising);
}

#[test]
fn edges_are_buffered_from_setup_in_order() {
    let backend = Arc::new(MockGpioBackend::default());
    let config = PinConfig::from_value(json!({
        "23": { "mode": "IN", "event": "BOTH" }
    }))
    .unwrap();
    let manager = GpioManager::from_config(
        backend.clone(),
        DriverOptions::default(),
        HandlerSet::new(),
        config,
    )
    .unwrap();

    backend.drive(23, 1).unwrap();
    backend.drive(23, 0).unwrap();
    backend.drive(23, 1).unwrap();

    let edges: Vec<EdgeDetect> = (0..3)
        .map(|_| {
            manager
                .wait_for_edge(23, Duration::ZERO)
                .unwrap()
                .expect("edge buffered")
                .edge
        })
        .collect();
    assert_eq!(
        edges,
        vec![EdgeDetect::Rising, EdgeDetect::Falling, EdgeDetect::Rising]
    );
    assert!(manager.wait_for_edge(23, Duration::ZERO).unwrap().is_none());
}

#[test]
fn only_configured_edges_are_buffered() {
    let (manager, backend, _) = sample_manager();

    // pin 24 has no event, pin 23 only listens for rising edges
    backend.drive(24, 0).unwrap();
    backend.drive(24, 1).unwrap();
    assert_eq!(backend.pending_edges(24), 0);

    backend.drive(23, 1).unwrap();
    backend.drive(23, 0).unwrap();
    assert_eq!(backend.pending_edges(23), 1);

    let event = manager
        .wait_for_edge(23, Duration::ZERO)
        .unwrap()
        .expect("rising edge buffered");
    assert_eq!(event.edge, EdgeDetect::Rising);
    assert_eq!(backend.pending_edges(23), 0);
}

#[test]
fn callback_may_read_pins_while_pins_are_released() {
    let backend = Arc::new(MockGpioBackend::default());
    let reader = backend.clone();
    let reads = Arc::new(AtomicUsize::new(0));
    let seen = reads.clone();
    let handlers = HandlerSet::new().with("do_something", move |_| {
        if reader.read_value(18).is_ok() {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    });
    let manager = GpioManager::from_config(
        backend.clone(),
        DriverOptions::default(),
        handlers,
        sample_config(),
    )
    .unwrap();

    backend.drive(23, 1).unwrap();
    assert_eq!(reads.load(Ordering::SeqCst), 1);

    manager.cleanup(Some(18)).unwrap();
    backend.drive(23, 0).unwrap();
    sleep(Duration::from_millis(250));
    backend.drive(23, 1).unwrap();
    assert_eq!(reads.load(Ordering::SeqCst), 1);

    manager.cleanup(None).unwrap();
    assert!(!backend.is_set_up(23));
}
