//! Position lifecycle record and fund/asset accounting.
//!
//! `Fund` and `Asset` implement hold/confirm/fail bookkeeping: placing an
//! order reserves value, a fill commits it, a failure or cancel releases it.
//! The invariant is that every hold is released exactly once, so the hold
//! counters return to zero whenever no orders are in flight.

use serde::{Deserialize, Serialize};

use crate::order::Order;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    ClosePending,
    Closed,
}

/// A long position: opened by a filled buy, closed by a filled sell.
#[derive(Debug, Clone)]
pub struct Position {
    pub id: String,
    pub buy: Order,
    pub sell: Option<Order>,
    pub profit: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub open_ts: u64,
    pub close_ts: u64,
    pub status: PositionStatus,
    pub dirty: bool,
}

impl Position {
    pub fn open(buy: Order) -> Self {
        let open_ts = buy.create_ts;
        Self {
            id: buy.id.clone(),
            buy,
            sell: None,
            profit: 0.0,
            stop_loss: 0.0,
            take_profit: 0.0,
            open_ts,
            close_ts: 0,
            status: PositionStatus::Open,
            dirty: true,
        }
    }

    pub fn attach_sell(&mut self, sell: Order) {
        self.close_ts = sell.create_ts;
        self.sell = Some(sell);
        self.status = PositionStatus::ClosePending;
        self.dirty = true;
    }

    pub fn detach_sell(&mut self) {
        self.sell = None;
        self.close_ts = 0;
        self.status = PositionStatus::Open;
        self.dirty = true;
    }

    /// Finalize the position. Profit is price delta times closed size; fees
    /// are accounted separately in [`Fund::fee_accrued`].
    pub fn mark_closed(&mut self) -> f64 {
        if let Some(sell) = &self.sell {
            self.profit = (sell.price - self.buy.price) * sell.filled_size;
            self.close_ts = sell.update_ts;
        }
        self.status = PositionStatus::Closed;
        self.dirty = true;
        self.profit
    }

    pub fn size(&self) -> f64 {
        self.buy.filled_size
    }

    pub fn unrealized(&self, rate: f64) -> f64 {
        match self.status {
            PositionStatus::Closed => 0.0,
            _ => (rate - self.buy.price) * self.buy.filled_size,
        }
    }

    pub fn set_stop_loss(&mut self, stop: f64) {
        self.stop_loss = stop;
        self.dirty = true;
    }

    pub fn set_take_profit(&mut self, tp: f64) {
        self.take_profit = tp;
        self.dirty = true;
    }
}

/// Quote-currency accounting for one market.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fund {
    pub initial_value: f64,
    pub current_value: f64,
    pub current_hold_value: f64,
    pub total_traded_value: f64,
    pub realized_profit: f64,
    pub unrealized_profit: f64,
    pub avg_buy_price: f64,
    pub latest_buy_price: f64,
    pub max_liquidity: f64,
    pub max_per_buy_value: f64,
    pub maker_fee_rate: f64,
    pub taker_fee_rate: f64,
    pub fee_accrued: f64,
}

impl Fund {
    pub fn set_initial_value(&mut self, value: f64) {
        self.initial_value = value;
        self.current_value = value;
    }

    pub fn total_profit(&self) -> f64 {
        self.realized_profit + self.unrealized_profit
    }

    pub fn equity(&self) -> f64 {
        self.initial_value + self.total_profit()
    }

    /// Reserve funds for `num_orders` buy slices. Returns 0.0 when spending
    /// would eat past the liquidity floor.
    pub fn take_for_buy(&mut self, num_orders: u32) -> f64 {
        let rock_bottom = self.initial_value - self.max_liquidity;
        let fund = self.max_per_buy_value * num_orders as f64;
        if self.current_value - (self.current_hold_value + fund) < rock_bottom {
            return 0.0;
        }
        self.current_hold_value += fund;
        fund
    }

    pub fn buy_confirm(&mut self, num_orders: u32, cost: f64, fees: f64) {
        self.current_hold_value -= self.max_per_buy_value * num_orders as f64;
        self.current_value -= cost;
        self.total_traded_value += cost;
        self.fee_accrued += fees;
    }

    pub fn sell_confirm(&mut self, proceeds: f64, fees: f64) {
        self.current_value += proceeds;
        self.total_traded_value += proceeds;
        self.fee_accrued += fees;
    }

    pub fn buy_fail(&mut self, num_orders: u32) {
        self.current_hold_value -= self.max_per_buy_value * num_orders as f64;
    }

    /// Maintain the volume-weighted average buy price across open inventory.
    pub fn update_avg_buy_price(&mut self, fill_price: f64, fill_cost: f64, prior_size: f64, fill_size: f64) {
        self.latest_buy_price = fill_price;
        let total = prior_size + fill_size;
        if total > 0.0 {
            self.avg_buy_price = (self.avg_buy_price * prior_size + fill_cost) / total;
        }
    }
}

/// Base-asset accounting for one market.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Asset {
    pub initial_size: f64,
    pub current_size: f64,
    pub current_hold_size: f64,
    pub hold_size: f64,
    pub latest_traded_size: f64,
    pub total_traded_size: f64,
    pub max_per_trade_size: f64,
    pub min_per_trade_size: f64,
}

impl Asset {
    pub fn set_initial_size(&mut self, size: f64) {
        self.initial_size = size;
        self.current_size = size;
    }

    /// Reserve `size` units for a sell. Returns 0.0 when not enough free
    /// inventory exists. Comparison is rounded to 1e-4 to absorb float dust
    /// from repeated partial trades.
    pub fn take_for_sell(&mut self, size: f64) -> f64 {
        let free = self.current_size - self.current_hold_size;
        if (free * 1e4).round() / 1e4 >= size {
            self.current_hold_size += size;
            size
        } else {
            0.0
        }
    }

    pub fn buy_confirm(&mut self, size: f64) {
        self.current_size += size;
        self.latest_traded_size = size;
        self.total_traded_size += size;
    }

    pub fn sell_confirm(&mut self, size: f64) {
        self.current_size -= size;
        self.current_hold_size -= size;
        self.latest_traded_size = size;
        self.total_traded_size += size;
    }

    pub fn sell_fail(&mut self, size: f64) {
        self.current_hold_size -= size;
    }
}
