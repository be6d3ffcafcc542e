//! Error reporting module.
//!
//! Provides the crate-level error type plus the [`ErrorBridge`], the
//! funnel through which low-level faults and payload panics become
//! structured events. Events below the ambient severity threshold are
//! dropped; the rest are offered to the payload first and then to any
//! registered handlers in registration order.

use std::collections::HashMap;

use crate::payload::Payload;

/// What a handler wants done with the rest of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFlow {
    /// Offer the event to the next handler.
    Continue,
    /// Swallow the event; no further handlers run.
    Stop,
}

/// Top-level error type aggregating the per-module failures.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    /// Invalid or incomplete configuration.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// Process-level failure (fork, identity switch).
    #[error(transparent)]
    Process(#[from] crate::process::ProcessError),

    /// Signal handler installation failure.
    #[error(transparent)]
    Signal(#[from] crate::signal::SignalError),
}

/// Severity of a reported event, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Diagnostic detail.
    Debug,
    /// Informational notice.
    Info,
    /// Recoverable problem.
    Warning,
    /// Operation failed.
    Error,
    /// The process cannot continue.
    Critical,
}

impl Severity {
    const fn bit(self) -> u8 {
        match self {
            Self::Debug => 1,
            Self::Info => 1 << 1,
            Self::Warning => 1 << 2,
            Self::Error => 1 << 3,
            Self::Critical => 1 << 4,
        }
    }

    /// Map a log filter string (the `loglevel` option) onto the ambient
    /// reporting threshold. Unknown directives fall back to `Warning`.
    #[must_use]
    pub fn from_filter(filter: &str) -> Self {
        match filter.to_ascii_lowercase().as_str() {
            "trace" | "debug" => Self::Debug,
            "info" => Self::Info,
            "error" => Self::Error,
            "critical" | "fatal" => Self::Critical,
            _ => Self::Warning,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A set of severities a handler subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeverityMask(u8);

impl SeverityMask {
    /// The empty mask. Matches nothing.
    pub const EMPTY: Self = Self(0);

    /// Matches every severity.
    pub const ALL: Self = Self(0x1f);

    /// Add one severity to the mask.
    #[must_use]
    pub const fn with(self, severity: Severity) -> Self {
        Self(self.0 | severity.bit())
    }

    /// Whether the mask includes the given severity.
    #[must_use]
    pub const fn contains(self, severity: Severity) -> bool {
        self.0 & severity.bit() != 0
    }
}

/// A structured event delivered through the bridge.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    /// How severe the fault is.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
    /// Source file, when known.
    pub file: Option<String>,
    /// Source line, when known.
    pub line: Option<u32>,
    /// Free-form context values.
    pub context: HashMap<String, String>,
}

impl ErrorEvent {
    /// Create an event with no location or context.
    #[must_use]
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            file: None,
            line: None,
            context: HashMap::new(),
        }
    }

    /// Attach a source location.
    #[must_use]
    pub fn with_location(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    /// Attach one context value.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Render the location as `file:line` when both parts are known.
    #[must_use]
    pub fn location(&self) -> Option<String> {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => Some(format!("{file}:{line}")),
            _ => None,
        }
    }
}

/// Build an [`ErrorEvent`] from the opaque payload of a caught panic.
#[must_use]
pub fn event_from_panic(panic: &(dyn std::any::Any + Send)) -> ErrorEvent {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "opaque panic payload".to_string());
    ErrorEvent::new(Severity::Error, message)
}

/// Identifier returned by [`ErrorBridge::add_handler`], used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// A registered handler callback.
pub type ErrorHandler = Box<dyn FnMut(&ErrorEvent) -> ErrorFlow>;

struct HandlerSlot {
    id: HandlerId,
    mask: SeverityMask,
    func: ErrorHandler,
}

/// Dispatches error events to the payload and to registered handlers.
///
/// Handlers run in registration order; a handler returning
/// [`ErrorFlow::Stop`] terminates the chain. Events whose severity is
/// below the ambient threshold are dropped before any dispatch.
pub struct ErrorBridge {
    threshold: Severity,
    handlers: Vec<HandlerSlot>,
    next_id: u64,
}

impl std::fmt::Debug for ErrorBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorBridge")
            .field("threshold", &self.threshold)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl ErrorBridge {
    /// Create a bridge with the given reporting threshold.
    #[must_use]
    pub const fn new(threshold: Severity) -> Self {
        Self {
            threshold,
            handlers: Vec::new(),
            next_id: 0,
        }
    }

    /// Change the ambient reporting threshold.
    pub const fn set_threshold(&mut self, threshold: Severity) {
        self.threshold = threshold;
    }

    /// Current reporting threshold.
    #[must_use]
    pub const fn threshold(&self) -> Severity {
        self.threshold
    }

    /// Register a handler for the severities in `mask`.
    pub fn add_handler(&mut self, mask: SeverityMask, func: ErrorHandler) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.handlers.push(HandlerSlot { id, mask, func });
        id
    }

    /// Remove a previously registered handler. Returns whether it existed.
    pub fn remove_handler(&mut self, id: HandlerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|slot| slot.id != id);
        self.handlers.len() != before
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Deliver one event.
    ///
    /// The payload's `on_error` hook runs first when a payload is
    /// supplied; registered handlers follow in registration order until
    /// one of them stops the chain.
    pub fn report(&mut self, event: &ErrorEvent, payload: Option<&dyn Payload>) {
        if event.severity < self.threshold {
            return;
        }

        if let Some(payload) = payload {
            if payload.on_error(event) == ErrorFlow::Stop {
                return;
            }
        }

        for slot in &mut self.handlers {
            if !slot.mask.contains(event.severity) {
                continue;
            }
            if (slot.func)(event) == ErrorFlow::Stop {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::payload::{ExitKind, WorkerConfig};

    struct RecordingPayload {
        seen: Arc<Mutex<Vec<String>>>,
        flow: ErrorFlow,
    }

    impl Payload for RecordingPayload {
        fn run(&self, _worker: Option<&WorkerConfig>) -> ExitKind {
            ExitKind::Halt
        }

        fn on_error(&self, event: &ErrorEvent) -> ErrorFlow {
            self.seen.lock().unwrap().push(event.message.clone());
            self.flow
        }
    }

    #[test]
    fn test_events_below_threshold_are_dropped() {
        let mut bridge = ErrorBridge::new(Severity::Warning);
        let hits = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&hits);
        bridge.add_handler(
            SeverityMask::ALL,
            Box::new(move |_| {
                *counter.borrow_mut() += 1;
                ErrorFlow::Continue
            }),
        );

        bridge.report(&ErrorEvent::new(Severity::Debug, "noise"), None);
        bridge.report(&ErrorEvent::new(Severity::Error, "real"), None);

        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn test_handlers_run_in_order_and_stop_terminates_chain() {
        let mut bridge = ErrorBridge::new(Severity::Debug);
        let order = Rc::new(RefCell::new(Vec::new()));

        let first = Rc::clone(&order);
        bridge.add_handler(
            SeverityMask::ALL,
            Box::new(move |_| {
                first.borrow_mut().push("first");
                ErrorFlow::Stop
            }),
        );
        let second = Rc::clone(&order);
        bridge.add_handler(
            SeverityMask::ALL,
            Box::new(move |_| {
                second.borrow_mut().push("second");
                ErrorFlow::Continue
            }),
        );

        bridge.report(&ErrorEvent::new(Severity::Error, "boom"), None);
        assert_eq!(*order.borrow(), vec!["first"]);
    }

    #[test]
    fn test_mask_filters_severities() {
        let mut bridge = ErrorBridge::new(Severity::Debug);
        let hits = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&hits);
        bridge.add_handler(
            SeverityMask::EMPTY.with(Severity::Critical),
            Box::new(move |_| {
                *counter.borrow_mut() += 1;
                ErrorFlow::Continue
            }),
        );

        bridge.report(&ErrorEvent::new(Severity::Error, "ignored"), None);
        bridge.report(&ErrorEvent::new(Severity::Critical, "matched"), None);

        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn test_payload_hook_runs_before_handlers_and_may_stop() {
        let mut bridge = ErrorBridge::new(Severity::Debug);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let payload = RecordingPayload {
            seen: Arc::clone(&seen),
            flow: ErrorFlow::Stop,
        };
        let hits = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&hits);
        bridge.add_handler(
            SeverityMask::ALL,
            Box::new(move |_| {
                *counter.borrow_mut() += 1;
                ErrorFlow::Continue
            }),
        );

        bridge.report(&ErrorEvent::new(Severity::Error, "boom"), Some(&payload));

        assert_eq!(*seen.lock().unwrap(), vec!["boom"]);
        assert_eq!(*hits.borrow(), 0, "payload stop must short-circuit handlers");
    }

    #[test]
    fn test_remove_handler() {
        let mut bridge = ErrorBridge::new(Severity::Debug);
        let id = bridge.add_handler(SeverityMask::ALL, Box::new(|_| ErrorFlow::Continue));
        assert_eq!(bridge.handler_count(), 1);
        assert!(bridge.remove_handler(id));
        assert!(!bridge.remove_handler(id));
        assert_eq!(bridge.handler_count(), 0);
    }

    #[test]
    fn test_severity_from_filter() {
        assert_eq!(Severity::from_filter("debug"), Severity::Debug);
        assert_eq!(Severity::from_filter("INFO"), Severity::Info);
        assert_eq!(Severity::from_filter("warn"), Severity::Warning);
        assert_eq!(Severity::from_filter("error"), Severity::Error);
        assert_eq!(Severity::from_filter("unintelligible"), Severity::Warning);
    }

    #[test]
    fn test_event_from_panic_extracts_message() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("worker fell over");
        let event = event_from_panic(boxed.as_ref());
        assert_eq!(event.message, "worker fell over");
        assert_eq!(event.severity, Severity::Error);

        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(event_from_panic(boxed.as_ref()).message, "owned");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(17_u32);
        assert_eq!(event_from_panic(boxed.as_ref()).message, "opaque panic payload");
    }

    #[test]
    fn test_event_location_rendering() {
        let event =
            ErrorEvent::new(Severity::Error, "x").with_location("src/worker.rs", 41);
        assert_eq!(event.location().as_deref(), Some("src/worker.rs:41"));
        assert!(ErrorEvent::new(Severity::Error, "x").location().is_none());
    }
}
