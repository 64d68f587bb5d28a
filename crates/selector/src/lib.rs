use std::collections::HashMap;

use tracing::{debug, info};

use common::{InstrumentKind, Tick};

/// Selection band and tie-break settings, snapshotted from the parameter
/// store for one attempt.
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Lower bound of the price band.
    pub base: f64,
    /// Band width; the upper bound is `base + width`.
    pub width: f64,
    /// Amount each retry widens the band on both ends.
    pub step: f64,
    /// The lower bound is never widened below this floor.
    pub floor: f64,
    /// Ties within a kind go to the least absolute deviation from this.
    pub target_premium: f64,
    /// Which kind becomes the main leg.
    pub main_kind: InstrumentKind,
}

/// One chosen instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedLeg {
    pub token: u32,
    pub symbol: String,
    pub kind: InstrumentKind,
    pub last_price: f64,
}

/// The instrument pair for one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub main: SelectedLeg,
    pub opposite: SelectedLeg,
}

/// Pick a main/opposite pair from a tick batch.
///
/// Partitions in-band tokens into call and put sets; when either set is
/// empty the band widens by `step` on both ends (the lower bound clamped at
/// `floor`) and the partition is retried. Once the lower bound sits at the
/// floor and a retry still comes up short, the batch yields nothing — the
/// caller just waits for the next one. Not an error.
pub fn select_pair(batch: &[Tick], cfg: &SelectorConfig) -> Option<Selection> {
    // Last observation wins when a token appears more than once in a batch.
    let mut latest: HashMap<u32, &Tick> = HashMap::new();
    for tick in batch {
        latest.insert(tick.token, tick);
    }

    let mut lower = cfg.base;
    let mut upper = cfg.base + cfg.width;

    loop {
        if let Some(selection) = try_band(&latest, lower, upper, cfg) {
            info!(
                main = %selection.main.symbol,
                opposite = %selection.opposite.symbol,
                lower,
                upper,
                "Instrument pair selected"
            );
            return Some(selection);
        }

        if lower <= cfg.floor {
            debug!(lower, upper, "Selection insufficient at band floor; waiting for next batch");
            return None;
        }
        lower = (lower - cfg.step).max(cfg.floor);
        upper += cfg.step;
        debug!(lower, upper, "Too few qualifying instruments; band widened");
    }
}

fn try_band(
    latest: &HashMap<u32, &Tick>,
    lower: f64,
    upper: f64,
    cfg: &SelectorConfig,
) -> Option<Selection> {
    let mut best: HashMap<InstrumentKind, &Tick> = HashMap::new();

    for tick in latest.values() {
        let Some(kind) = InstrumentKind::from_symbol(&tick.symbol) else {
            continue;
        };
        if tick.last_price < lower || tick.last_price > upper {
            continue;
        }
        let deviation = (tick.last_price - cfg.target_premium).abs();
        let better = best
            .get(&kind)
            .map_or(true, |cur| deviation < (cur.last_price - cfg.target_premium).abs());
        if better {
            best.insert(kind, tick);
        }
    }

    let main = best.get(&cfg.main_kind)?;
    let opposite = best.get(&cfg.main_kind.opposite())?;

    Some(Selection {
        main: leg(main, cfg.main_kind),
        opposite: leg(opposite, cfg.main_kind.opposite()),
    })
}

fn leg(tick: &Tick, kind: InstrumentKind) -> SelectedLeg {
    SelectedLeg {
        token: tick.token,
        symbol: tick.symbol.clone(),
        kind,
        last_price: tick.last_price,
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
