use std::collections::BTreeMap;

use ordered_float::OrderedFloat;

pub mod error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bid,
    Ask,
}

/// Local replica of a venue's L2 book, rebuilt on every (re)connect.
///
/// Price levels are keyed by numeric price so that the best bid is the last
/// bid key and the best ask is the first ask key. A level with size 0 is
/// removed rather than stored. `last_seq` carries the venue specific cursor
/// (`lastUpdateId`, `u`, `sequenceEnd`) of the last applied event.
#[derive(Debug, Default)]
pub struct LocalOrderBook {
    bids: BTreeMap<OrderedFloat<f64>, f64>,
    asks: BTreeMap<OrderedFloat<f64>, f64>,
    pub last_seq: Option<u64>,
}

impl LocalOrderBook {
    pub fn new() -> Self {
        LocalOrderBook::default()
    }

    /// Replaces the book contents with a snapshot at the given cursor.
    pub fn reset(&mut self, bids: &[[f64; 2]], asks: &[[f64; 2]], last_seq: Option<u64>) {
        self.bids.clear();
        self.asks.clear();
        for [price, size] in bids {
            self.apply_level(Side::Bid, *price, *size);
        }
        for [price, size] in asks {
            self.apply_level(Side::Ask, *price, *size);
        }
        self.last_seq = last_seq;
    }

    pub fn apply_level(&mut self, side: Side, price: f64, size: f64) {
        let levels = match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        };

        if size == 0.0 {
            levels.remove(&OrderedFloat(price));
        } else {
            levels.insert(OrderedFloat(price), size);
        }
    }

    pub fn apply_levels(&mut self, side: Side, levels: &[[f64; 2]]) {
        for [price, size] in levels {
            self.apply_level(side, *price, *size);
        }
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.keys().next_back().map(|price| price.0)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.keys().next().map(|price| price.0)
    }

    /// Both best levels, or `None` while either side is empty.
    pub fn best_levels(&self) -> Option<(f64, f64)> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid, ask)),
            _ => None,
        }
    }

    /// A book where the best bid has caught up to the best ask is desynced
    /// and must be rebuilt from a snapshot before publishing again.
    pub fn is_crossed(&self) -> bool {
        match self.best_levels() {
            Some((bid, ask)) => bid >= ask,
            None => false,
        }
    }

    /// Drops levels beyond `depth` per side, keeping the best ones.
    pub fn truncate_depth(&mut self, depth: usize) {
        while self.bids.len() > depth {
            self.bids.pop_first();
        }
        while self.asks.len() > depth {
            self.asks.pop_last();
        }
    }

    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }
}
