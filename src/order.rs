//! Exchange-neutral order records and the order lifecycle state machine.
//!
//! Adapters translate broker responses into the simplified wire statuses
//! `open | filled | canceled`; the [`OrderTracker`] keeps the finer-grained
//! lifecycle for audit logging and idempotent fill handling.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
    /// Held locally until the stop trigger price is reached, then placed as
    /// a market order.
    Stop,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::Stop => "stop",
        }
    }
}

/// Simplified broker order status. Anything richer an exchange reports is
/// translated down to these three in its adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Filled,
    Canceled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
        }
    }
}

/// An order intent generated from a strategy signal or a stop/target hit.
#[derive(Debug, Clone)]
pub struct TradeRequest {
    pub product: String,
    pub side: Side,
    pub size: f64,
    pub fund: f64,
    pub order_type: OrderType,
    pub price: f64,
    /// Strategy-supplied stop price (0 = none).
    pub stop: f64,
    /// Strategy-supplied take-profit price (0 = none).
    pub profit: f64,
    /// For sells: the position this request closes.
    pub position_id: Option<String>,
}

/// Normalized broker order.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: String,
    pub product: String,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub request_size: f64,
    pub filled_size: f64,
    pub remaining_size: f64,
    pub price: f64,
    pub funds: f64,
    pub fees: f64,
    pub create_ts: u64,
    pub update_ts: u64,
    pub stop: f64,
    pub profit: f64,
    pub position_id: Option<String>,
}

impl Order {
    pub fn filled_value(&self) -> f64 {
        self.filled_size * self.price
    }
}

// ---------------------------------------------------------------------------
// Lifecycle state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    New,
    Submitted,
    Acked,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

#[derive(Debug, Clone)]
pub enum OrderEvent {
    Submit,
    Ack { exchange_id: String },
    Fill { fill_id: String, qty: f64 },
    CancelRequest,
    CancelAck,
    Reject { reason: String },
    Timeout,
}

#[derive(Debug, Clone)]
pub struct LifecycleError {
    pub msg: String,
}

#[derive(Debug, Clone)]
pub struct TrackedOrder {
    pub client_id: String,
    pub exchange_id: Option<String>,
    pub state: OrderState,
    pub qty: f64,
    pub filled_qty: f64,
    seen_fills: HashSet<String>,
}

impl TrackedOrder {
    pub fn new(client_id: String, qty: f64) -> Self {
        Self {
            client_id,
            exchange_id: None,
            state: OrderState::New,
            qty,
            filled_qty: 0.0,
            seen_fills: HashSet::new(),
        }
    }
}

pub fn apply_event(order: &mut TrackedOrder, event: OrderEvent) -> Result<(), LifecycleError> {
    match (&order.state, event) {
        (OrderState::New, OrderEvent::Submit) => {
            order.state = OrderState::Submitted;
            Ok(())
        }
        (OrderState::Submitted, OrderEvent::Ack { exchange_id }) => {
            order.exchange_id = Some(exchange_id);
            order.state = OrderState::Acked;
            Ok(())
        }
        (OrderState::Submitted, OrderEvent::Reject { .. }) => {
            order.state = OrderState::Rejected;
            Ok(())
        }
        (OrderState::Acked, OrderEvent::Fill { fill_id, qty })
        | (OrderState::PartiallyFilled, OrderEvent::Fill { fill_id, qty }) => {
            // fills are idempotent by fill id
            if order.seen_fills.contains(&fill_id) {
                return Ok(());
            }
            order.seen_fills.insert(fill_id);
            order.filled_qty += qty;
            if order.filled_qty + 1e-9 >= order.qty {
                order.state = OrderState::Filled;
            } else {
                order.state = OrderState::PartiallyFilled;
            }
            Ok(())
        }
        (OrderState::Acked, OrderEvent::CancelRequest)
        | (OrderState::PartiallyFilled, OrderEvent::CancelRequest) => {
            order.state = OrderState::Canceled;
            Ok(())
        }
        (OrderState::Canceled, OrderEvent::CancelAck) => Ok(()),
        (OrderState::Submitted, OrderEvent::Timeout) | (OrderState::Acked, OrderEvent::Timeout) => {
            order.state = OrderState::Canceled;
            Ok(())
        }
        (OrderState::Rejected, _) | (OrderState::Filled, _) => Ok(()),
        (_, OrderEvent::Reject { .. }) => {
            order.state = OrderState::Rejected;
            Ok(())
        }
        (_, OrderEvent::Ack { .. }) | (_, OrderEvent::Submit) => Err(LifecycleError {
            msg: "invalid lifecycle transition".to_string(),
        }),
        _ => Ok(()),
    }
}

#[derive(Debug, Default)]
pub struct OrderTracker {
    orders: HashMap<String, TrackedOrder>,
}

impl OrderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure(&mut self, client_id: &str, qty: f64) {
        self.orders
            .entry(client_id.to_string())
            .or_insert_with(|| TrackedOrder::new(client_id.to_string(), qty));
    }

    /// Apply a lifecycle event, returning (previous, next) state for logging.
    pub fn apply(
        &mut self,
        client_id: &str,
        event: OrderEvent,
    ) -> Result<(OrderState, OrderState), String> {
        let order = self
            .orders
            .get_mut(client_id)
            .ok_or_else(|| format!("unknown order {}", client_id))?;
        let prev = order.state;
        apply_event(order, event).map_err(|e| e.msg)?;
        Ok((prev, order.state))
    }

    pub fn get(&self, client_id: &str) -> Option<&TrackedOrder> {
        self.orders.get(client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(qty: f64) -> TrackedOrder {
        TrackedOrder::new("O-1".to_string(), qty)
    }

    #[test]
    fn happy_path_submit_ack_fill() {
        let mut o = order(1.0);
        apply_event(&mut o, OrderEvent::Submit).unwrap();
        assert_eq!(o.state, OrderState::Submitted);
        apply_event(&mut o, OrderEvent::Ack { exchange_id: "X-9".into() }).unwrap();
        assert_eq!(o.state, OrderState::Acked);
        apply_event(&mut o, OrderEvent::Fill { fill_id: "f1".into(), qty: 1.0 }).unwrap();
        assert_eq!(o.state, OrderState::Filled);
        assert_eq!(o.exchange_id.as_deref(), Some("X-9"));
    }

    #[test]
    fn partial_fills_accumulate_until_full() {
        let mut o = order(1.0);
        apply_event(&mut o, OrderEvent::Submit).unwrap();
        apply_event(&mut o, OrderEvent::Ack { exchange_id: "X".into() }).unwrap();
        apply_event(&mut o, OrderEvent::Fill { fill_id: "f1".into(), qty: 0.4 }).unwrap();
        assert_eq!(o.state, OrderState::PartiallyFilled);
        apply_event(&mut o, OrderEvent::Fill { fill_id: "f2".into(), qty: 0.6 }).unwrap();
        assert_eq!(o.state, OrderState::Filled);
        assert!((o.filled_qty - 1.0).abs() < 1e-9);
    }

    #[test]
    fn duplicate_fill_id_ignored() {
        let mut o = order(1.0);
        apply_event(&mut o, OrderEvent::Submit).unwrap();
        apply_event(&mut o, OrderEvent::Ack { exchange_id: "X".into() }).unwrap();
        apply_event(&mut o, OrderEvent::Fill { fill_id: "f1".into(), qty: 0.4 }).unwrap();
        apply_event(&mut o, OrderEvent::Fill { fill_id: "f1".into(), qty: 0.4 }).unwrap();
        assert!((o.filled_qty - 0.4).abs() < 1e-9);
        assert_eq!(o.state, OrderState::PartiallyFilled);
    }

    #[test]
    fn timeout_cancels_inflight_order() {
        let mut o = order(1.0);
        apply_event(&mut o, OrderEvent::Submit).unwrap();
        apply_event(&mut o, OrderEvent::Timeout).unwrap();
        assert_eq!(o.state, OrderState::Canceled);
    }

    #[test]
    fn reject_is_terminal() {
        let mut o = order(1.0);
        apply_event(&mut o, OrderEvent::Submit).unwrap();
        apply_event(&mut o, OrderEvent::Reject { reason: "insufficient funds".into() }).unwrap();
        assert_eq!(o.state, OrderState::Rejected);
        // further events are ignored, not errors
        apply_event(&mut o, OrderEvent::Fill { fill_id: "f".into(), qty: 1.0 }).unwrap();
        assert_eq!(o.state, OrderState::Rejected);
    }

    #[test]
    fn ack_before_submit_rejected() {
        let mut o = order(1.0);
        assert!(apply_event(&mut o, OrderEvent::Ack { exchange_id: "X".into() }).is_err());
    }

    #[test]
    fn tracker_round_trip() {
        let mut t = OrderTracker::new();
        t.ensure("O-1", 2.0);
        let (prev, next) = t.apply("O-1", OrderEvent::Submit).unwrap();
        assert_eq!(prev, OrderState::New);
        assert_eq!(next, OrderState::Submitted);
        assert!(t.apply("O-2", OrderEvent::Submit).is_err());
    }
}
