use std::collections::HashMap;

use tracing::debug;

use common::{InstrumentKind, Tick};

/// Per-cycle observation flags. All false after a cycle reset.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordFlags {
    /// The configured entry drop from the first observed price was seen.
    pub entry_drop_seen: bool,
    /// A local maximum followed by a configured retreat was detected.
    pub peak_and_fall: bool,
    /// The price came back up to the captured reference.
    pub reference_reached: bool,
    /// Trough tracking is frozen; `low_since_ref` no longer moves.
    pub low_frozen: bool,
}

/// Mutable observation record for one instrument within one cycle.
///
/// `Option` stands in for the source feed's "not yet observed" states —
/// a record never carries a sentinel price.
#[derive(Debug, Clone)]
pub struct InstrumentRecord {
    pub token: u32,
    pub symbol: String,
    pub kind: Option<InstrumentKind>,
    /// Price at the first tick of this cycle.
    pub first_price: f64,
    pub last_price: f64,
    /// Delta between the two most recent ticks.
    pub change: f64,
    /// Running maximum since peak tracking began.
    pub peak: Option<f64>,
    /// The peak that was rolled over when a higher one replaced it.
    pub prev_peak: Option<f64>,
    /// Captured baseline for trough tracking. Freezes once set elsewhere.
    pub reference_price: Option<f64>,
    /// Running minimum since the reference was captured.
    pub low_since_ref: Option<f64>,
    pub buy_price: Option<f64>,
    /// `last_price - buy_price` while a buy is on the books, else 0.
    pub change_since_buy: f64,
    pub flags: RecordFlags,
}

impl InstrumentRecord {
    fn from_tick(tick: &Tick) -> Self {
        Self {
            token: tick.token,
            symbol: tick.symbol.clone(),
            kind: InstrumentKind::from_symbol(&tick.symbol),
            first_price: tick.last_price,
            last_price: tick.last_price,
            change: 0.0,
            peak: None,
            prev_peak: None,
            reference_price: None,
            low_since_ref: None,
            buy_price: None,
            change_since_buy: 0.0,
            flags: RecordFlags::default(),
        }
    }

    /// How far the price has retreated from the running peak, if one exists.
    pub fn peak_retreat(&self) -> Option<f64> {
        self.peak.map(|p| p - self.last_price)
    }
}

/// All instrument records of the active cycle, keyed by token.
///
/// Owned exclusively by one strategy instance's controller; records are
/// created on the first tick of a cycle, mutated on every subsequent tick,
/// and discarded atomically at the cycle reset.
#[derive(Debug, Default)]
pub struct InstrumentLedger {
    records: HashMap<u32, InstrumentRecord>,
}

impl InstrumentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one tick: create the record if absent, otherwise update the
    /// last price, the tick delta, and the running extrema.
    ///
    /// Peak rule: `peak := max(peak, last)` once peak tracking has begun.
    /// Trough rule: `low_since_ref := min(low_since_ref, last)` only while a
    /// reference is captured and not frozen.
    pub fn upsert(&mut self, tick: &Tick) {
        let rec = self
            .records
            .entry(tick.token)
            .or_insert_with(|| InstrumentRecord::from_tick(tick));

        rec.change = tick.last_price - rec.last_price;
        rec.last_price = tick.last_price;

        if let Some(peak) = rec.peak {
            if tick.last_price > peak {
                rec.prev_peak = Some(peak);
                rec.peak = Some(tick.last_price);
            }
        }

        if rec.reference_price.is_some() && !rec.flags.low_frozen {
            let low = rec.low_since_ref.unwrap_or(tick.last_price);
            rec.low_since_ref = Some(low.min(tick.last_price));
        }

        if let Some(buy) = rec.buy_price {
            rec.change_since_buy = tick.last_price - buy;
        }
    }

    /// Record an executed buy: sets the buy price, zeroes the running
    /// change, and starts peak tracking from the buy price.
    pub fn mark_bought(&mut self, token: u32, price: f64) {
        if let Some(rec) = self.records.get_mut(&token) {
            rec.buy_price = Some(price);
            rec.change_since_buy = 0.0;
            rec.peak = Some(rec.peak.map_or(price, |p| p.max(price)));
            debug!(token, price, "Ledger marked bought");
        }
    }

    /// Re-basis the buy price once the real fill resolves. The running
    /// change is recomputed against the executed price.
    pub fn adjust_buy_price(&mut self, token: u32, executed: f64) {
        if let Some(rec) = self.records.get_mut(&token) {
            if rec.buy_price.is_some() {
                rec.buy_price = Some(executed);
                rec.change_since_buy = rec.last_price - executed;
                debug!(token, executed, "Buy price re-based on resolved fill");
            }
        }
    }

    /// Capture the current price as the trough-tracking reference.
    pub fn set_reference(&mut self, token: u32) {
        if let Some(rec) = self.records.get_mut(&token) {
            rec.reference_price = Some(rec.last_price);
            rec.low_since_ref = Some(rec.last_price);
            rec.flags.low_frozen = false;
        }
    }

    /// Freeze trough tracking. Later comparisons must use the frozen value,
    /// not a moving minimum.
    pub fn freeze_low(&mut self, token: u32) {
        if let Some(rec) = self.records.get_mut(&token) {
            rec.flags.low_frozen = true;
        }
    }

    pub fn mark_entry_drop(&mut self, token: u32) {
        if let Some(rec) = self.records.get_mut(&token) {
            rec.flags.entry_drop_seen = true;
        }
    }

    pub fn mark_peak_and_fall(&mut self, token: u32) {
        if let Some(rec) = self.records.get_mut(&token) {
            rec.flags.peak_and_fall = true;
        }
    }

    pub fn mark_reference_reached(&mut self, token: u32) {
        if let Some(rec) = self.records.get_mut(&token) {
            rec.flags.reference_reached = true;
        }
    }

    pub fn get(&self, token: u32) -> Option<&InstrumentRecord> {
        self.records.get(&token)
    }

    pub fn records(&self) -> impl Iterator<Item = &InstrumentRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Discard every record. Called only from the cycle reset.
    pub fn reset(&mut self) {
        self.records.clear();
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
