//! Write-ahead log for order intents, fills and portfolio snapshots.
//!
//! One JSON entry per line, appended and flushed before the matching broker
//! call goes out. On startup [`Wal::recover`] rebuilds the last snapshot per
//! product, the fills recorded since it, and any order intents that never
//! saw a fill or cancel; those are surfaced for reconciliation.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub struct Wal {
    file: File,
    path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum WalEntry {
    PlaceOrder {
        ts: u64,
        order_id: String,
        product: String,
        side: String,
        size: f64,
        params_hash: String,
    },
    Fill {
        ts: u64,
        order_id: String,
        product: String,
        price: f64,
        size: f64,
        fees: f64,
    },
    Cancel {
        ts: u64,
        order_id: String,
    },
    Snapshot {
        ts: u64,
        product: String,
        fund_value: f64,
        asset_size: f64,
        realized_profit: f64,
        open_positions: u64,
    },
}

#[derive(Debug, Clone)]
pub struct PendingIntent {
    pub order_id: String,
    pub product: String,
    pub side: String,
    pub size: f64,
    pub ts: u64,
}

#[derive(Debug, Clone)]
pub struct SnapshotData {
    pub ts: u64,
    pub product: String,
    pub fund_value: f64,
    pub asset_size: f64,
    pub realized_profit: f64,
    pub open_positions: u64,
}

#[derive(Debug, Clone)]
pub struct FillData {
    pub ts: u64,
    pub order_id: String,
    pub product: String,
    pub price: f64,
    pub size: f64,
    pub fees: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryState {
    /// Intents with no fill or cancel on record; need broker reconciliation.
    pub pending_intents: Vec<PendingIntent>,
    pub snapshots_by_product: HashMap<String, SnapshotData>,
    /// Fills appended after the most recent snapshot.
    pub fills_since_snapshot: Vec<FillData>,
}

impl Wal {
    pub fn open(path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file, path: path.to_string() })
    }

    pub fn append_entry(&mut self, entry: &WalEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry).unwrap_or_else(|_| "{}".to_string());
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()
    }

    pub fn write_snapshot(
        &mut self,
        ts: u64,
        product: &str,
        fund_value: f64,
        asset_size: f64,
        realized_profit: f64,
        open_positions: u64,
    ) -> std::io::Result<()> {
        self.append_entry(&WalEntry::Snapshot {
            ts,
            product: product.to_string(),
            fund_value,
            asset_size,
            realized_profit,
            open_positions,
        })
    }

    pub fn replay(path: &str) -> std::io::Result<Vec<String>> {
        if !Path::new(path).exists() {
            return Ok(vec![]);
        }
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(BufReader::new(file).lines().map_while(Result::ok).collect())
    }

    pub fn recover(path: &str) -> std::io::Result<RecoveryState> {
        let mut state = RecoveryState::default();
        let mut settled: HashSet<String> = HashSet::new();

        for line in Self::replay(path)? {
            let entry = match serde_json::from_str::<WalEntry>(&line) {
                Ok(e) => e,
                Err(_) => continue, // torn tail line from a crash mid-append
            };
            match entry {
                WalEntry::PlaceOrder { ts, order_id, product, side, size, .. } => {
                    state.pending_intents.push(PendingIntent {
                        order_id,
                        product,
                        side,
                        size,
                        ts,
                    });
                }
                WalEntry::Fill { ts, order_id, product, price, size, fees } => {
                    settled.insert(order_id.clone());
                    state.fills_since_snapshot.push(FillData {
                        ts,
                        order_id,
                        product,
                        price,
                        size,
                        fees,
                    });
                }
                WalEntry::Cancel { order_id, .. } => {
                    settled.insert(order_id);
                }
                WalEntry::Snapshot {
                    ts,
                    product,
                    fund_value,
                    asset_size,
                    realized_profit,
                    open_positions,
                } => {
                    state.snapshots_by_product.insert(
                        product.clone(),
                        SnapshotData {
                            ts,
                            product,
                            fund_value,
                            asset_size,
                            realized_profit,
                            open_positions,
                        },
                    );
                    state.fills_since_snapshot.clear();
                }
            }
        }

        state.pending_intents.retain(|o| !settled.contains(&o.order_id));
        Ok(state)
    }

    /// Truncate after a successful durable checkpoint.
    pub fn truncate(&self) -> std::io::Result<()> {
        OpenOptions::new().write(true).truncate(true).open(&self.path)?;
        Ok(())
    }
}
