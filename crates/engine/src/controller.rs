use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use common::{
    Block, ControlUpdate, EngineEvent, Error, ExecutionGateway, InstrumentKind, OrderSide, Result,
    TickBatch,
};
use ledger::InstrumentLedger;
use params::ParameterStore;
use selector::{select_pair, Selection, SelectorConfig};

use crate::decision::{DecisionEngine, EngineDeps};
use crate::fills::FillUpdate;

/// The top-level state machine driving one strategy instance.
///
/// Owns its ledger and parameter store outright; separate instances share
/// no mutable state. One tokio task per controller: batches are processed
/// strictly in arrival order, and control updates and fill completions are
/// applied only between batches.
pub struct CycleController {
    block: Block,
    cycle: u64,
    ledger: InstrumentLedger,
    params: ParameterStore,
    decision: DecisionEngine,
    selection: Option<Selection>,
    deps: EngineDeps,
    fill_rx: mpsc::Receiver<FillUpdate>,
}

impl CycleController {
    pub fn new(
        params: ParameterStore,
        gateway: Arc<dyn ExecutionGateway>,
        event_tx: broadcast::Sender<EngineEvent>,
    ) -> Self {
        let (fill_tx, fill_rx) = mpsc::channel(64);
        Self {
            block: Block::Init,
            cycle: 1,
            ledger: InstrumentLedger::new(),
            params,
            decision: DecisionEngine::new(),
            selection: None,
            deps: EngineDeps {
                gateway,
                event_tx,
                fill_tx,
            },
            fill_rx,
        }
    }

    pub fn block(&self) -> Block {
        self.block
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn ledger(&self) -> &InstrumentLedger {
        &self.ledger
    }

    pub fn decision(&self) -> &DecisionEngine {
        &self.decision
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    /// Run the controller loop. Call from `tokio::spawn`.
    pub async fn run(
        mut self,
        mut batch_rx: mpsc::Receiver<TickBatch>,
        mut control_rx: mpsc::Receiver<ControlUpdate>,
    ) {
        info!(cycle = self.cycle, "CycleController running");
        loop {
            tokio::select! {
                batch = batch_rx.recv() => match batch {
                    Some(batch) => {
                        // Errors are confined to the batch: log, abandon it,
                        // keep the current block for the next delivery.
                        if let Err(e) = self.process_batch(&batch).await {
                            warn!(error = %e, block = %self.block, "Batch abandoned");
                        }
                    }
                    None => {
                        warn!("Tick channel closed — controller exiting");
                        return;
                    }
                },
                update = control_rx.recv() => match update {
                    Some(update) => self.apply_control(update),
                    None => {
                        warn!("Control channel closed — controller exiting");
                        return;
                    }
                },
                // Never yields None: the controller keeps a sender alive.
                Some(fill) = self.fill_rx.recv() => self.apply_fill(fill),
            }
        }
    }

    /// Process one tick batch. Every tick is ingested first; then whichever
    /// blocks are unlocked run, possibly several in a row — a condition
    /// satisfied mid-batch immediately unlocks the next block instead of
    /// waiting a delivery.
    pub async fn process_batch(&mut self, batch: &TickBatch) -> Result<()> {
        for tick in batch {
            self.ledger.upsert(tick);
        }

        loop {
            match self.block {
                Block::Init => {
                    let cfg = self.selector_config();
                    match select_pair(batch, &cfg) {
                        Some(sel) => {
                            self.selection = Some(sel);
                            self.transition(Block::Update);
                        }
                        None => break,
                    }
                }

                Block::Update => {
                    let Some(main_token) = self.selection.as_ref().map(|s| s.main.token) else {
                        return Err(Error::Other(
                            "update block reached without a selection".to_string(),
                        ));
                    };
                    if self.entry_triggered(main_token) {
                        self.ledger.mark_entry_drop(main_token);
                        self.transition(Block::Decision);
                    } else {
                        break;
                    }
                }

                Block::Decision => {
                    let Some(sel) = self.selection.clone() else {
                        return Err(Error::Other(
                            "decision block reached without a selection".to_string(),
                        ));
                    };
                    self.decision
                        .evaluate(&mut self.ledger, &self.params, &sel, self.cycle, &self.deps)
                        .await?;
                    if self.decision.bought_and_sold() {
                        self.transition(Block::NextCycle);
                    } else {
                        break;
                    }
                }

                Block::NextCycle => {
                    self.reset_cycle();
                    self.transition(Block::Init);
                    // Selection for the new cycle starts with the next batch.
                    break;
                }
            }
        }
        Ok(())
    }

    /// The decision phase opens once the main leg has fallen the configured
    /// percentage from its first observed price.
    fn entry_triggered(&self, main_token: u32) -> bool {
        let drop_pct = self.params.strategy().number("entry_drop_pct");
        self.ledger.get(main_token).map_or(false, |rec| {
            rec.last_price <= rec.first_price * (1.0 - drop_pct / 100.0)
        })
    }

    fn selector_config(&self) -> SelectorConfig {
        let strategy = self.params.strategy();
        let main_kind = match strategy.text("main_kind").as_str() {
            "PE" => InstrumentKind::Put,
            _ => InstrumentKind::Call,
        };
        SelectorConfig {
            base: strategy.number("select_base"),
            width: strategy.number("select_width"),
            step: strategy.number("select_step"),
            floor: strategy.number("select_floor"),
            target_premium: strategy.number("target_premium"),
            main_kind,
        }
    }

    /// Full per-cycle reset: all records discarded atomically, every done
    /// flag cleared, cycle-scoped parameter mutations restored.
    fn reset_cycle(&mut self) {
        self.ledger.reset();
        self.decision.reset();
        self.selection = None;
        self.cycle += 1;
        info!(cycle = self.cycle, "Cycle complete; state reset");
    }

    fn transition(&mut self, to: Block) {
        debug!(from = %self.block, to = %to, cycle = self.cycle, "Block transition");
        let _ = self.deps.event_tx.send(EngineEvent::BlockChanged {
            from: self.block,
            to,
            cycle: self.cycle,
        });
        self.block = to;
    }

    /// Apply a live parameter update. Runs only between batches.
    fn apply_control(&mut self, update: ControlUpdate) {
        let accepted = self
            .params
            .update(update.scope, &update.name, &update.value);
        if accepted {
            info!(scope = ?update.scope, name = %update.name, value = %update.value, "Parameter updated");
        } else {
            warn!(scope = ?update.scope, name = %update.name, value = %update.value, "Parameter update rejected");
        }
        if let Some(reply) = update.reply {
            let _ = reply.send(accepted);
        }
    }

    /// Apply a resolved fill. Buy fills re-basis the ledger's buy price so
    /// later change-from-buy comparisons use the executed price.
    fn apply_fill(&mut self, fill: FillUpdate) {
        // A fill resolving after its cycle was reset refers to a position
        // that no longer exists; the same token may already be re-bought.
        if fill.cycle != self.cycle {
            debug!(
                token = fill.token,
                order_id = %fill.order_id,
                fill_cycle = fill.cycle,
                cycle = self.cycle,
                "Stale fill from a finished cycle dropped"
            );
            return;
        }
        if fill.side == OrderSide::Buy {
            self.ledger.adjust_buy_price(fill.token, fill.executed_price);
        }
        debug!(
            token = fill.token,
            order_id = %fill.order_id,
            side = %fill.side,
            price = fill.executed_price,
            "Fill applied"
        );
    }
}
