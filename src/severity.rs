//! Severity taxonomy and the notification stream
//!
//! Every component reports what it does as a [`Notification`]: a [`Severity`]
//! plus a formatted message. Notifications go through a [`Notifier`], which
//! filters them against the configured level, emits them as `tracing` events
//! and, when a tap is attached, copies them onto a channel.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// `tracing` target of every notification, whichever component emitted it
pub const NOTIFICATION_TARGET: &str = "gpsd_tcp::notification";

/// Message severity, most severe first
///
/// Numbering follows syslog (`Emergency` = 0 .. `Debug` = 7). `Unknown` sorts
/// after `Debug` and is used for severities a module reports that fall outside
/// that range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Information,
    Debug,
    Unknown,
}

impl Severity {
    /// All severities in order, most severe first
    pub const ALL: [Severity; 9] = [
        Severity::Emergency,
        Severity::Alert,
        Severity::Critical,
        Severity::Error,
        Severity::Warning,
        Severity::Notice,
        Severity::Information,
        Severity::Debug,
        Severity::Unknown,
    ];

    /// Syslog level number (`Unknown` is 8)
    pub fn level(self) -> u8 {
        self as u8
    }

    /// Map a syslog level number to a severity
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0..=7 => Some(Self::ALL[level as usize]),
            _ => None,
        }
    }

    /// Human-readable name
    pub fn name(self) -> &'static str {
        match self {
            Severity::Emergency => "emergency",
            Severity::Alert => "alarm",
            Severity::Critical => "critical",
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Notice => "notice",
            Severity::Information => "information",
            Severity::Debug => "debug",
            Severity::Unknown => "unknown",
        }
    }

    /// Parse a configured log level
    ///
    /// Accepts syslog numbers `0`..`7` and names, case-insensitive, including
    /// the common short forms (`emerg`, `crit`, `err`, `warn`, `info`).
    pub fn parse_level(requested: &str) -> Option<Self> {
        let requested = requested.trim();
        if let Ok(level) = requested.parse::<u8>() {
            return Self::from_level(level);
        }

        match requested.to_ascii_lowercase().as_str() {
            "emergency" | "emerg" | "panic" => Some(Severity::Emergency),
            "alert" | "alarm" => Some(Severity::Alert),
            "critical" | "crit" => Some(Severity::Critical),
            "error" | "err" => Some(Severity::Error),
            "warning" | "warn" => Some(Severity::Warning),
            "notice" => Some(Severity::Notice),
            "information" | "info" => Some(Severity::Information),
            "debug" => Some(Severity::Debug),
            _ => None,
        }
    }

    /// Resolve a log level request, falling back to `Information`
    ///
    /// When the request is not recognised the returned notification records
    /// the fallback; the caller emits it once its notifier exists.
    pub fn from_request(requested: &str) -> (Self, Option<Notification>) {
        match Self::parse_level(requested) {
            Some(severity) => (severity, None),
            None => (
                Severity::Information,
                Some(Notification::new(
                    Severity::Warning,
                    format!(
                        "Loglevel {} are invalid, using level info for now.",
                        requested
                    ),
                )),
            ),
        }
    }

    /// `tracing` filter directive that lets this severity through
    pub fn tracing_directive(self) -> &'static str {
        match self {
            Severity::Emergency | Severity::Alert | Severity::Critical | Severity::Error => "error",
            Severity::Warning => "warn",
            Severity::Notice | Severity::Information => "info",
            Severity::Debug | Severity::Unknown => "debug",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A severity-tagged message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub severity: Severity,
    pub message: String,
}

impl Notification {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }

    fn trace(&self) {
        let severity = self.severity.name();
        match self.severity {
            Severity::Emergency | Severity::Alert | Severity::Critical | Severity::Error => {
                error!(target: NOTIFICATION_TARGET, severity, "{}", self.message)
            }
            Severity::Warning => warn!(target: NOTIFICATION_TARGET, severity, "{}", self.message),
            Severity::Notice | Severity::Information => {
                info!(target: NOTIFICATION_TARGET, severity, "{}", self.message)
            }
            Severity::Debug | Severity::Unknown => {
                debug!(target: NOTIFICATION_TARGET, severity, "{}", self.message)
            }
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.message)
    }
}

/// Handle onto the notification stream
///
/// Cheap to clone; every component holds its own copy.
#[derive(Debug, Clone)]
pub struct Notifier {
    threshold: Severity,
    tap: Option<mpsc::UnboundedSender<Notification>>,
}

impl Notifier {
    /// Notifier that passes everything at least as severe as `threshold`
    pub fn new(threshold: Severity) -> Self {
        Self {
            threshold,
            tap: None,
        }
    }

    /// Notifier with a tap receiving a copy of every accepted notification
    pub fn with_tap(threshold: Severity) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                threshold,
                tap: Some(tx),
            },
            rx,
        )
    }

    pub fn threshold(&self) -> Severity {
        self.threshold
    }

    /// Whether a notification of this severity would be emitted
    ///
    /// Lets hot paths skip formatting messages that would be dropped.
    pub fn enabled(&self, severity: Severity) -> bool {
        severity <= self.threshold
    }

    pub fn emit(&self, notification: Notification) {
        if !self.enabled(notification.severity) {
            return;
        }
        notification.trace();
        if let Some(ref tap) = self.tap {
            // The tap owner may have gone away; logging must not fail because of it
            let _ = tap.send(notification);
        }
    }

    pub fn notify(&self, severity: Severity, message: impl Into<String>) {
        if self.enabled(severity) {
            self.emit(Notification::new(severity, message));
        }
    }

    pub fn error(&self, message: impl Into<String>) {
        self.notify(Severity::Error, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.notify(Severity::Warning, message);
    }

    pub fn notice(&self, message: impl Into<String>) {
        self.notify(Severity::Notice, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.notify(Severity::Information, message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.notify(Severity::Debug, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifications_share_one_target() {
        use std::sync::{Arc, Mutex};
        use tracing_subscriber::layer::{Context, SubscriberExt};

        struct Targets(Arc<Mutex<Vec<String>>>);

        impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Targets {
            fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
                self.0
                    .lock()
                    .unwrap()
                    .push(event.metadata().target().to_string());
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(Targets(Arc::clone(&seen)));
        tracing::subscriber::with_default(subscriber, || {
            let notifier = Notifier::new(Severity::Debug);
            notifier.warning("Port number 99999 are invalid.");
            notifier.error("No service could be started.");
        });

        assert_eq!(
            *seen.lock().unwrap(),
            vec![NOTIFICATION_TARGET.to_string(); 2]
        );
    }

    #[test]
    fn test_severity_ordering() {
        for pair in Severity::ALL.windows(2) {
            assert!(pair[0] < pair[1], "{} should sort before {}", pair[0], pair[1]);
        }
        assert!(Severity::Emergency < Severity::Debug);
    }

    #[test]
    fn test_severity_levels_round_trip_syslog_numbers() {
        for level in 0..=7u8 {
            let severity = Severity::from_level(level).unwrap();
            assert_eq!(severity.level(), level);
        }
        assert_eq!(Severity::from_level(8), None);
        assert_eq!(Severity::Unknown.level(), 8);
    }

    #[test]
    fn test_parse_level_names_and_numbers() {
        assert_eq!(Severity::parse_level("debug"), Some(Severity::Debug));
        assert_eq!(Severity::parse_level("DEBUG"), Some(Severity::Debug));
        assert_eq!(Severity::parse_level(" warn "), Some(Severity::Warning));
        assert_eq!(Severity::parse_level("crit"), Some(Severity::Critical));
        assert_eq!(Severity::parse_level("3"), Some(Severity::Error));
        assert_eq!(Severity::parse_level("6"), Some(Severity::Information));
        assert_eq!(Severity::parse_level("9"), None);
        assert_eq!(Severity::parse_level("unknown"), None);
        assert_eq!(Severity::parse_level("loud"), None);
    }

    #[test]
    fn test_from_request_falls_back_to_information() {
        let (severity, fallback) = Severity::from_request("verbose");
        assert_eq!(severity, Severity::Information);
        let fallback = fallback.unwrap();
        assert_eq!(fallback.severity, Severity::Warning);
        assert!(fallback.message.contains("verbose"));

        let (severity, fallback) = Severity::from_request("notice");
        assert_eq!(severity, Severity::Notice);
        assert!(fallback.is_none());
    }

    #[test]
    fn test_notifier_threshold_filters_tap() {
        let (notifier, mut rx) = Notifier::with_tap(Severity::Warning);
        notifier.debug("hidden");
        notifier.info("hidden too");
        notifier.warning("shown");
        notifier.error("shown as well");

        let first = rx.try_recv().unwrap();
        assert_eq!(first, Notification::new(Severity::Warning, "shown"));
        let second = rx.try_recv().unwrap();
        assert_eq!(second.severity, Severity::Error);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_notifier_survives_dropped_tap() {
        let (notifier, rx) = Notifier::with_tap(Severity::Debug);
        drop(rx);
        notifier.error("nobody is listening");
    }

    #[test]
    fn test_display_names() {
        assert_eq!(Severity::Alert.to_string(), "alarm");
        assert_eq!(
            Notification::new(Severity::Notice, "hello").to_string(),
            "[notice] hello"
        );
    }
}
