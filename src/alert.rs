//! Price alert evaluation.
//!
//! Alerts are edge-triggered: a notification fires on the transition into
//! `price >= alert_price` and the triggered flag then sticks until the alert
//! price is edited. A price falling back below the threshold does not re-arm it.

use crate::models::WatchedStock;
use crate::notifier::AlertNotification;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertOutcome {
    /// New value of the stock's triggered flag.
    pub triggered: bool,
    /// True only on the not-triggered to triggered transition.
    pub should_notify: bool,
}

/// Decide whether `new_price` triggers the stock's alert.
pub fn evaluate(stock: &WatchedStock, new_price: f64) -> AlertOutcome {
    if stock.is_alert_triggered {
        return AlertOutcome {
            triggered: true,
            should_notify: false,
        };
    }

    let crossed = new_price >= stock.alert_price;
    AlertOutcome {
        triggered: crossed,
        should_notify: crossed,
    }
}

/// Build the message handed to the notifier for a fired alert.
pub fn compose_notification(symbol: &str, price: f64, alert_price: f64) -> AlertNotification {
    AlertNotification {
        symbol: symbol.to_string(),
        title: format!("{symbol} price alert"),
        body: format!(
            "{symbol} is trading at ${price:.2}, at or above your alert price of ${alert_price:.2}"
        ),
        price,
        alert_price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stock(alert_price: f64, triggered: bool) -> WatchedStock {
        let mut stock = WatchedStock::new("AAPL", "Apple Inc.", alert_price);
        stock.is_alert_triggered = triggered;
        stock
    }

    #[test]
    fn test_below_threshold_does_not_trigger() {
        let outcome = evaluate(&stock(150.0, false), 149.99);
        assert!(!outcome.triggered);
        assert!(!outcome.should_notify);
    }

    #[test]
    fn test_crossing_notifies_once() {
        let outcome = evaluate(&stock(150.0, false), 150.0);
        assert!(outcome.triggered);
        assert!(outcome.should_notify);

        let again = evaluate(&stock(150.0, true), 160.0);
        assert!(again.triggered);
        assert!(!again.should_notify);
    }

    #[test]
    fn test_triggered_flag_sticks_when_price_drops() {
        let outcome = evaluate(&stock(150.0, true), 120.0);
        assert!(outcome.triggered);
        assert!(!outcome.should_notify);
    }

    #[test]
    fn test_compose_notification() {
        let n = compose_notification("AAPL", 155.0, 150.0);
        assert_eq!(n.title, "AAPL price alert");
        assert!(n.body.contains("$155.00"));
        assert!(n.body.contains("$150.00"));
    }
}
