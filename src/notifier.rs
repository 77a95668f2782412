//! Alert notification delivery.
//!
//! Notifiers are fire-and-forget: a failure to display never reaches the store.

use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A fired price alert, ready for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertNotification {
    pub symbol: String,
    pub title: String,
    pub body: String,
    pub price: f64,
    pub alert_price: f64,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &AlertNotification);
}

/// Writes alerts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &AlertNotification) {
        info!(
            symbol = %notification.symbol,
            price = notification.price,
            alert_price = notification.alert_price,
            "{}: {}",
            notification.title,
            notification.body
        );
    }
}

/// Beep patterns for the terminal bell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSound {
    /// Single beep for regular alert
    Single,
    /// Double beep for high priority
    Double,
    /// Triple beep for critical alert
    Triple,
}

impl AlertSound {
    fn beeps(self) -> usize {
        match self {
            AlertSound::Single => 1,
            AlertSound::Double => 2,
            AlertSound::Triple => 3,
        }
    }
}

/// Rings the terminal bell (BEL, `\x07`) and prints the alert to stderr.
///
/// Runs on its own thread so the caller never waits on the beep delay.
#[derive(Debug, Clone, Copy)]
pub struct BellNotifier {
    sound: AlertSound,
}

impl BellNotifier {
    pub fn new(sound: AlertSound) -> Self {
        Self { sound }
    }
}

impl Notifier for BellNotifier {
    fn notify(&self, notification: &AlertNotification) {
        let beeps = self.sound.beeps();
        let line = format!("{}: {}", notification.title, notification.body);

        std::thread::spawn(move || {
            let mut stderr = std::io::stderr();
            for _ in 0..beeps {
                if write!(stderr, "\x07").and_then(|_| stderr.flush()).is_err() {
                    debug!("terminal bell unavailable");
                    return;
                }
                std::thread::sleep(Duration::from_millis(200));
            }
            let _ = writeln!(stderr, "{line}");
        });
    }
}

/// Fans one alert out to several notifiers.
#[derive(Clone, Default)]
pub struct CompositeNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl CompositeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }
}

impl Notifier for CompositeNotifier {
    fn notify(&self, notification: &AlertNotification) {
        for notifier in &self.notifiers {
            notifier.notify(notification);
        }
    }
}
