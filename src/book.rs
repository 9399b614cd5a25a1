//! Per-market position book.
//!
//! Tracks pending/traded orders, open and closed positions, and the
//! stop-loss / take-profit ladders. Ladders are `BTreeMap`s keyed by the
//! stop price quantized to 1e-4 so float prices become totally ordered
//! keys; positions store the exact price.
//!
//! The book is pure bookkeeping: it returns a [`BookEvent`] describing what
//! an order update did, and the market layer performs the fund/asset and
//! risk accounting that follows.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::order::{Order, OrderStatus, Side, TradeRequest};
use crate::position::Position;

pub fn price_key(price: f64) -> i64 {
    (price * 1e4).round() as i64
}

#[derive(Debug, Clone, PartialEq)]
pub enum BookEvent {
    BuyOpen,
    BuyFilled { position_id: String },
    BuyCanceled,
    SellOpen { position_id: Option<String> },
    SellFilled { position_id: String, profit: f64 },
    SellCanceled { reopened: Option<String> },
    /// Late or malformed update that changed nothing.
    Ignored,
}

#[derive(Default)]
pub struct PositionBook {
    pending_buy_orders: HashMap<String, Order>,
    pending_sell_orders: HashMap<String, Order>,
    traded_buy_orders: HashMap<String, Order>,
    traded_sell_orders: HashMap<String, Order>,
    pub total_order_count: u64,
    pub total_open_order_count: u64,

    positions: HashMap<String, Position>,
    open_ids: Vec<String>,
    close_pending_ids: HashSet<String>,
    closed_ids: Vec<String>,

    sl_ladder: BTreeMap<i64, Vec<String>>,
    tp_ladder: BTreeMap<i64, Vec<String>>,

    pending_trade_reqs: Vec<TradeRequest>,

    /// Times the duplicate-close-pending guard fired; surfaced in logs.
    pub dup_close_guards: u64,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    // -- position access ---------------------------------------------------

    pub fn position(&self, id: &str) -> Option<&Position> {
        self.positions.get(id)
    }

    pub fn open_count(&self) -> usize {
        self.open_ids.len() + self.close_pending_ids.len()
    }

    pub fn closed_count(&self) -> usize {
        self.closed_ids.len()
    }

    pub fn open_position_ids(&self) -> &[String] {
        &self.open_ids
    }

    /// Mark-to-market profit across all not-yet-closed positions.
    pub fn unrealized_total(&self, rate: f64) -> f64 {
        self.open_ids
            .iter()
            .chain(self.close_pending_ids.iter())
            .filter_map(|id| self.positions.get(id))
            .map(|p| p.unrealized(rate))
            .sum()
    }

    /// Open + close-pending inventory, in asset units.
    pub fn open_size_total(&self) -> f64 {
        self.open_ids
            .iter()
            .chain(self.close_pending_ids.iter())
            .filter_map(|id| self.positions.get(id))
            .map(|p| p.size())
            .sum()
    }

    /// Drain positions touched since the last persistence pass.
    pub fn take_dirty_positions(&mut self) -> Vec<Position> {
        let mut dirty = Vec::new();
        for pos in self.positions.values_mut() {
            if pos.dirty {
                pos.dirty = false;
                dirty.push(pos.clone());
            }
        }
        dirty
    }

    // -- ladders -----------------------------------------------------------

    pub fn arm_stop_loss(&mut self, id: &str, stop_price: f64) {
        if stop_price <= 0.0 {
            return;
        }
        if let Some(pos) = self.positions.get_mut(id) {
            pos.set_stop_loss(stop_price);
            self.sl_ladder.entry(price_key(stop_price)).or_default().push(id.to_string());
        }
    }

    pub fn arm_take_profit(&mut self, id: &str, tp_price: f64) {
        if tp_price <= 0.0 {
            return;
        }
        if let Some(pos) = self.positions.get_mut(id) {
            pos.set_take_profit(tp_price);
            self.tp_ladder.entry(price_key(tp_price)).or_default().push(id.to_string());
        }
    }

    fn remove_from_ladder(ladder: &mut BTreeMap<i64, Vec<String>>, key: i64, id: &str) {
        if let Some(ids) = ladder.get_mut(&key) {
            ids.retain(|x| x != id);
            if ids.is_empty() {
                ladder.remove(&key);
            }
        }
    }

    fn disarm(&mut self, id: &str) {
        if let Some(pos) = self.positions.get(id) {
            let (sl, tp) = (pos.stop_loss, pos.take_profit);
            if sl > 0.0 {
                Self::remove_from_ladder(&mut self.sl_ladder, price_key(sl), id);
            }
            if tp > 0.0 {
                Self::remove_from_ladder(&mut self.tp_ladder, price_key(tp), id);
            }
        }
    }

    /// Positions whose stop is at or above the market rate: the price fell
    /// through their stop. They are moved to close-pending and disarmed.
    pub fn stop_loss_hits(&mut self, rate: f64) -> Vec<String> {
        let keys: Vec<i64> = self.sl_ladder.range(price_key(rate)..).map(|(k, _)| *k).collect();
        self.collect_hits(keys, true)
    }

    /// Positions whose take-profit is at or below the market rate.
    pub fn take_profit_hits(&mut self, rate: f64) -> Vec<String> {
        let keys: Vec<i64> = self.tp_ladder.range(..=price_key(rate)).map(|(k, _)| *k).collect();
        self.collect_hits(keys, false)
    }

    fn collect_hits(&mut self, keys: Vec<i64>, from_sl: bool) -> Vec<String> {
        let mut hits = Vec::new();
        for key in keys {
            let ids = if from_sl {
                self.sl_ladder.remove(&key)
            } else {
                self.tp_ladder.remove(&key)
            }
            .unwrap_or_default();
            for id in ids {
                if self.close_pending_ids.contains(&id) {
                    self.dup_close_guards += 1;
                    continue;
                }
                self.open_ids.retain(|x| x != &id);
                self.close_pending_ids.insert(id.clone());
                // leave no entry in the sibling ladder
                if let Some(pos) = self.positions.get(&id) {
                    let (sl, tp) = (pos.stop_loss, pos.take_profit);
                    if from_sl && tp > 0.0 {
                        Self::remove_from_ladder(&mut self.tp_ladder, price_key(tp), &id);
                    }
                    if !from_sl && sl > 0.0 {
                        Self::remove_from_ladder(&mut self.sl_ladder, price_key(sl), &id);
                    }
                }
                hits.push(id);
            }
        }
        hits
    }

    /// Trailing ratchet: every armed stop strictly below `new_stop` is
    /// raised to it. Stops never move down.
    pub fn raise_stops(&mut self, new_stop: f64) -> usize {
        let new_key = price_key(new_stop);
        let keys: Vec<i64> = self.sl_ladder.range(..new_key).map(|(k, _)| *k).collect();
        let mut moved = 0;
        for key in keys {
            if let Some(ids) = self.sl_ladder.remove(&key) {
                for id in &ids {
                    if let Some(pos) = self.positions.get_mut(id) {
                        pos.set_stop_loss(new_stop);
                    }
                }
                moved += ids.len();
                self.sl_ladder.entry(new_key).or_default().extend(ids);
            }
        }
        moved
    }

    // -- closable selection ------------------------------------------------

    /// Pick a position for a signal-driven close: prefer the one with the
    /// lowest armed stop (deepest underwater), else the most recent open.
    /// The position moves to close-pending and leaves both ladders.
    pub fn closable_position(&mut self) -> Option<String> {
        let from_ladder = self
            .sl_ladder
            .iter()
            .next()
            .and_then(|(_, ids)| ids.last().cloned());
        let id = match from_ladder {
            Some(id) => id,
            None => self.open_ids.last().cloned()?,
        };
        if self.close_pending_ids.contains(&id) {
            self.dup_close_guards += 1;
            return None;
        }
        self.disarm(&id);
        self.open_ids.retain(|x| x != &id);
        self.close_pending_ids.insert(id.clone());
        Some(id)
    }

    /// A sell failed to place or was canceled: return the position to the
    /// open pool and re-arm its ladders from the stored prices.
    pub fn close_failed(&mut self, pos_id: &str) -> Option<String> {
        if !self.close_pending_ids.remove(pos_id) {
            return None;
        }
        let (sl, tp) = {
            let pos = self.positions.get_mut(pos_id)?;
            pos.detach_sell();
            (pos.stop_loss, pos.take_profit)
        };
        self.open_ids.push(pos_id.to_string());
        if sl > 0.0 {
            self.sl_ladder.entry(price_key(sl)).or_default().push(pos_id.to_string());
        }
        if tp > 0.0 {
            self.tp_ladder.entry(price_key(tp)).or_default().push(pos_id.to_string());
        }
        Some(pos_id.to_string())
    }

    // -- order updates -----------------------------------------------------

    /// Handle a normalized order update. Mirrors the simplified
    /// open/filled/canceled order machine; late updates for already-settled
    /// orders are ignored.
    pub fn apply_order_update(&mut self, mut order: Order) -> BookEvent {
        match order.side {
            Side::Buy => {
                if self.traded_buy_orders.contains_key(&order.id) {
                    return BookEvent::Ignored;
                }
                match order.status {
                    OrderStatus::Open => {
                        if let Some(prev) = self.pending_buy_orders.get(&order.id) {
                            order.stop = prev.stop;
                            order.profit = prev.profit;
                        } else {
                            self.total_open_order_count += 1;
                            self.total_order_count += 1;
                        }
                        self.pending_buy_orders.insert(order.id.clone(), order);
                        BookEvent::BuyOpen
                    }
                    OrderStatus::Filled | OrderStatus::Canceled => {
                        if let Some(prev) = self.pending_buy_orders.remove(&order.id) {
                            order.stop = prev.stop;
                            order.profit = prev.profit;
                            self.total_open_order_count =
                                self.total_open_order_count.saturating_sub(1);
                        } else {
                            self.total_order_count += 1;
                        }
                        let filled = order.status == OrderStatus::Filled;
                        self.traded_buy_orders.insert(order.id.clone(), order.clone());
                        if filled {
                            let id = order.id.clone();
                            self.positions.insert(id.clone(), Position::open(order));
                            self.open_ids.push(id.clone());
                            BookEvent::BuyFilled { position_id: id }
                        } else {
                            BookEvent::BuyCanceled
                        }
                    }
                }
            }
            Side::Sell => {
                if self.traded_sell_orders.contains_key(&order.id) {
                    return BookEvent::Ignored;
                }
                match order.status {
                    OrderStatus::Open => {
                        if !self.pending_sell_orders.contains_key(&order.id) {
                            self.total_open_order_count += 1;
                            self.total_order_count += 1;
                        }
                        let pos_id = order.position_id.clone();
                        if let Some(pid) = &pos_id {
                            if let Some(pos) = self.positions.get_mut(pid) {
                                if pos.sell.is_none() {
                                    pos.attach_sell(order.clone());
                                }
                            }
                        }
                        self.pending_sell_orders.insert(order.id.clone(), order);
                        BookEvent::SellOpen { position_id: pos_id }
                    }
                    OrderStatus::Filled => {
                        if self.pending_sell_orders.remove(&order.id).is_some() {
                            self.total_open_order_count =
                                self.total_open_order_count.saturating_sub(1);
                        } else {
                            self.total_order_count += 1;
                        }
                        let pos_id = match order.position_id.clone() {
                            Some(id) => id,
                            None => {
                                self.traded_sell_orders.insert(order.id.clone(), order);
                                return BookEvent::Ignored;
                            }
                        };
                        self.traded_sell_orders.insert(order.id.clone(), order.clone());
                        match self.positions.get_mut(&pos_id) {
                            Some(pos) => {
                                pos.attach_sell(order);
                                let profit = pos.mark_closed();
                                self.close_pending_ids.remove(&pos_id);
                                self.open_ids.retain(|x| x != &pos_id);
                                self.closed_ids.push(pos_id.clone());
                                BookEvent::SellFilled { position_id: pos_id, profit }
                            }
                            None => BookEvent::Ignored,
                        }
                    }
                    OrderStatus::Canceled => {
                        if self.pending_sell_orders.remove(&order.id).is_some() {
                            self.total_open_order_count =
                                self.total_open_order_count.saturating_sub(1);
                        }
                        self.traded_sell_orders.insert(order.id.clone(), order.clone());
                        let reopened =
                            order.position_id.as_deref().and_then(|pid| self.close_failed(pid));
                        BookEvent::SellCanceled { reopened }
                    }
                }
            }
        }
    }

    pub fn pending_orders(&self) -> Vec<&Order> {
        self.pending_buy_orders.values().chain(self.pending_sell_orders.values()).collect()
    }

    // -- stop-type trade requests -------------------------------------------

    pub fn add_pending_trade_req(&mut self, req: TradeRequest) {
        self.pending_trade_reqs.push(req);
    }

    pub fn pending_trade_req_count(&self) -> usize {
        self.pending_trade_reqs.len()
    }

    /// Pull out stop requests whose trigger price has been reached: a stop
    /// BUY fires when the market falls to the stop, a stop SELL when it
    /// rises to it.
    pub fn take_triggered_stop_reqs(&mut self, rate: f64) -> Vec<TradeRequest> {
        let mut triggered = Vec::new();
        let mut remaining = Vec::new();
        for req in self.pending_trade_reqs.drain(..) {
            let fires = match req.side {
                Side::Buy => req.stop >= rate,
                Side::Sell => req.stop <= rate,
            };
            if fires {
                triggered.push(req);
            } else {
                remaining.push(req);
            }
        }
        self.pending_trade_reqs = remaining;
        triggered
    }
}
