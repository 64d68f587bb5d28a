use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::time::sleep;

use common::{
    Block, ControlUpdate, EngineEvent, Error, ExecutionGateway, OrderReceipt, OrderRequest,
    OrderSide, ParamScope, Result, Tick, TickBatch,
};
use engine::{fills, CycleController};
use params::default_store;

/// Records every placement; fills resolve to zero so the engine falls back
/// to the reference price.
struct RecordingGateway {
    calls: Mutex<Vec<OrderRequest>>,
}

impl RecordingGateway {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<OrderRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionGateway for RecordingGateway {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderReceipt> {
        let mut calls = self.calls.lock().unwrap();
        calls.push(order.clone());
        Ok(OrderReceipt {
            order_id: format!("ord-{}", calls.len()),
        })
    }

    async fn resolve_fill(&self, _order_id: &str) -> Result<f64> {
        Ok(0.0)
    }
}

/// Records placements like `RecordingGateway`, but the first order's fill
/// stays unresolved until released; later fills resolve to zero.
struct StallingGateway {
    calls: Mutex<Vec<OrderRequest>>,
    release: Notify,
}

impl StallingGateway {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            release: Notify::new(),
        })
    }

    fn calls(&self) -> Vec<OrderRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionGateway for StallingGateway {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderReceipt> {
        let mut calls = self.calls.lock().unwrap();
        calls.push(order.clone());
        Ok(OrderReceipt {
            order_id: format!("ord-{}", calls.len()),
        })
    }

    async fn resolve_fill(&self, order_id: &str) -> Result<f64> {
        if order_id == "ord-1" {
            self.release.notified().await;
            return Ok(150.0);
        }
        Ok(0.0)
    }
}

/// Accepts every order but fills it at 95.0 regardless of the reference.
struct RebasingGateway {
    calls: Mutex<Vec<OrderRequest>>,
}

impl RebasingGateway {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<OrderRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionGateway for RebasingGateway {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderReceipt> {
        let mut calls = self.calls.lock().unwrap();
        calls.push(order.clone());
        Ok(OrderReceipt {
            order_id: format!("ord-{}", calls.len()),
        })
    }

    async fn resolve_fill(&self, _order_id: &str) -> Result<f64> {
        Ok(95.0)
    }
}

/// Broker that is down: every placement and every history lookup fails.
struct BrokenGateway;

#[async_trait]
impl ExecutionGateway for BrokenGateway {
    async fn place_order(&self, _order: &OrderRequest) -> Result<OrderReceipt> {
        Err(Error::Broker("connection refused".to_string()))
    }

    async fn resolve_fill(&self, order_id: &str) -> Result<f64> {
        Err(Error::FillResolution {
            order_id: order_id.to_string(),
            reason: "history unavailable".to_string(),
        })
    }
}

fn tick(token: u32, symbol: &str, price: f64) -> Tick {
    Tick {
        token,
        symbol: symbol.to_string(),
        last_price: price,
        timestamp: Utc::now(),
    }
}

const CE: &str = "NIFTY25SEP24500CE";
const PE: &str = "NIFTY25SEP24500PE";

fn controller(gateway: Arc<RecordingGateway>) -> CycleController {
    let (event_tx, _) = broadcast::channel(256);
    CycleController::new(default_store(), gateway, event_tx)
}

/// Walks the controller to an open position in the main leg, bought at 100:
/// select CE/PE, then a 3% drop from 103.1 to 100 triggers the decision
/// phase and the initial buy.
async fn open_position(ctl: &mut CycleController) {
    let select: TickBatch = vec![tick(1, CE, 103.1), tick(2, PE, 95.0)];
    ctl.process_batch(&select).await.unwrap();
    assert_eq!(ctl.block(), Block::Update);

    let trigger: TickBatch = vec![tick(1, CE, 100.0)];
    ctl.process_batch(&trigger).await.unwrap();
    assert_eq!(ctl.block(), Block::Decision);
}

#[tokio::test]
async fn selection_widens_band_and_unlocks_update_block() {
    // CE at 95 is inside [20, 110]; PE at 113 only qualifies once the band
    // widens by one step to [15, 115].
    let gw = RecordingGateway::new();
    let mut ctl = controller(gw);

    let batch: TickBatch = vec![tick(1, CE, 95.0), tick(2, PE, 113.0)];
    ctl.process_batch(&batch).await.unwrap();

    assert_eq!(ctl.block(), Block::Update);
    let sel = ctl.selection().unwrap();
    assert_eq!(sel.main.token, 1);
    assert_eq!(sel.opposite.token, 2);
}

#[tokio::test]
async fn insufficient_selection_stays_in_init_without_error() {
    let gw = RecordingGateway::new();
    let mut ctl = controller(gw.clone());

    // Puts never show up; the controller just waits for the next batch.
    let batch: TickBatch = vec![tick(1, CE, 95.0)];
    ctl.process_batch(&batch).await.unwrap();

    assert_eq!(ctl.block(), Block::Init);
    assert!(gw.calls().is_empty());
}

#[tokio::test]
async fn one_batch_can_pass_through_several_blocks() {
    // The same delivery selects the pair (CE last prints in-band) and
    // carries the entry drop, so Init, Update and the initial buy all
    // happen in one batch.
    let gw = RecordingGateway::new();
    let mut ctl = controller(gw.clone());

    let batch: TickBatch = vec![
        tick(1, CE, 103.1),
        tick(2, PE, 95.0),
        tick(1, CE, 100.0),
    ];
    ctl.process_batch(&batch).await.unwrap();

    assert_eq!(ctl.block(), Block::Decision);
    let calls = gw.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].side, OrderSide::Buy);
    assert_eq!(calls[0].symbol, CE);
}

#[tokio::test]
async fn replaying_an_identical_batch_never_resubmits() {
    let gw = RecordingGateway::new();
    let mut ctl = controller(gw.clone());
    open_position(&mut ctl).await;
    assert_eq!(gw.calls().len(), 1);

    // Same delivery again: the initial-buy done flag holds.
    let replay: TickBatch = vec![tick(1, CE, 100.0)];
    ctl.process_batch(&replay).await.unwrap();
    ctl.process_batch(&replay).await.unwrap();

    assert_eq!(gw.calls().len(), 1);
}

#[tokio::test]
async fn profit_exit_arms_then_fires_and_resets_the_cycle() {
    let gw = RecordingGateway::new();
    let mut ctl = controller(gw.clone());
    open_position(&mut ctl).await;

    // 109.6 reaches target − ε (9.5) and arms the latch; nothing is sold.
    ctl.process_batch(&vec![tick(1, CE, 109.6)]).await.unwrap();
    assert_eq!(gw.calls().len(), 1);
    assert_eq!(ctl.block(), Block::Decision);

    // 111 lands within one unit of the target and fires the sell.
    ctl.process_batch(&vec![tick(1, CE, 111.0)]).await.unwrap();

    let calls = gw.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].side, OrderSide::Sell);
    assert_eq!(calls[1].reference_price, 111.0);
    assert_eq!(calls[1].quantity, 75);

    // Terminal flag resets everything for the next cycle.
    assert_eq!(ctl.block(), Block::Init);
    assert_eq!(ctl.cycle(), 2);
    assert!(ctl.ledger().is_empty());
    assert!(ctl.decision().done().all_clear());
    assert!(ctl.selection().is_none());
}

#[tokio::test]
async fn arming_tick_alone_never_sells() {
    let gw = RecordingGateway::new();
    let mut ctl = controller(gw.clone());
    open_position(&mut ctl).await;

    // Arm and immediately satisfy the fire band on the same tick: the
    // latch arms but the sell must wait for a later tick.
    ctl.process_batch(&vec![tick(1, CE, 109.6)]).await.unwrap();
    assert_eq!(gw.calls().len(), 1);
}

#[tokio::test]
async fn stop_loss_then_buy_back_closes_the_cycle() {
    let gw = RecordingGateway::new();
    let mut ctl = controller(gw.clone());
    open_position(&mut ctl).await;

    // Fall to 89: change −11 breaches the −10 stop.
    ctl.process_batch(&vec![tick(1, CE, 89.0)]).await.unwrap();
    {
        let calls = gw.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].side, OrderSide::Sell);
        assert_eq!(calls[1].symbol, CE);
    }
    assert_eq!(ctl.block(), Block::Decision);

    // Next batch: the put at 95 is the opposite-kind instrument nearest
    // below the 100 ceiling; the buy-back enters there.
    ctl.process_batch(&vec![tick(2, PE, 95.0)]).await.unwrap();
    {
        let calls = gw.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].side, OrderSide::Buy);
        assert_eq!(calls[2].symbol, PE);
        assert_eq!(calls[2].reference_price, 95.0);
    }

    // Rise to the buy-back target closes the leg and ends the cycle.
    ctl.process_batch(&vec![tick(2, PE, 105.0)]).await.unwrap();
    let calls = gw.calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[3].side, OrderSide::Sell);
    assert_eq!(calls[3].symbol, PE);

    assert_eq!(ctl.block(), Block::Init);
    assert_eq!(ctl.cycle(), 2);
    assert!(ctl.ledger().is_empty());
}

#[tokio::test]
async fn buy_back_picks_the_candidate_nearest_below_the_ceiling() {
    let gw = RecordingGateway::new();
    let mut ctl = controller(gw.clone());

    // Seed a second put so the buy-back has a choice.
    let select: TickBatch = vec![
        tick(1, CE, 103.1),
        tick(2, PE, 95.0),
        tick(3, "NIFTY25SEP24400PE", 60.0),
    ];
    ctl.process_batch(&select).await.unwrap();
    ctl.process_batch(&vec![tick(1, CE, 100.0)]).await.unwrap();
    ctl.process_batch(&vec![tick(1, CE, 89.0)]).await.unwrap();

    // 98 is nearer below the 100 ceiling than 60.
    ctl.process_batch(&vec![tick(2, PE, 98.0), tick(3, "NIFTY25SEP24400PE", 60.0)])
        .await
        .unwrap();

    let calls = gw.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2].symbol, PE);
    assert_eq!(calls[2].reference_price, 98.0);
}

#[tokio::test]
async fn rebuy_after_dip_and_recover_halves_target_and_doubles_quantity() {
    let gw = RecordingGateway::new();
    let mut ctl = controller(gw.clone());
    open_position(&mut ctl).await;

    // Dip 6 points below the reference, then recover past it. The dip is
    // deeper than rebuy_drop (5) and the peak retreat exceeds the margin.
    ctl.process_batch(&vec![tick(1, CE, 94.0)]).await.unwrap();
    ctl.process_batch(&vec![tick(1, CE, 100.5)]).await.unwrap();

    {
        let calls = gw.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].side, OrderSide::Buy);
        assert_eq!(calls[1].quantity, 75);
    }

    // The halved target (5) arms at 4.5 and fires inside the one-unit band,
    // selling the doubled position.
    ctl.process_batch(&vec![tick(1, CE, 105.2)]).await.unwrap();
    ctl.process_batch(&vec![tick(1, CE, 105.5)]).await.unwrap();

    let calls = gw.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2].side, OrderSide::Sell);
    assert_eq!(calls[2].quantity, 150);
    assert_eq!(ctl.block(), Block::Init);
}

#[tokio::test]
async fn rebuy_fires_at_most_once_per_cycle() {
    let gw = RecordingGateway::new();
    let mut ctl = controller(gw.clone());
    open_position(&mut ctl).await;

    ctl.process_batch(&vec![tick(1, CE, 94.0)]).await.unwrap();
    ctl.process_batch(&vec![tick(1, CE, 100.5)]).await.unwrap();
    assert_eq!(gw.calls().len(), 2);

    // A second dip-and-recover must not add again.
    ctl.process_batch(&vec![tick(1, CE, 93.0)]).await.unwrap();
    ctl.process_batch(&vec![tick(1, CE, 100.5)]).await.unwrap();
    assert_eq!(gw.calls().len(), 2);
}

#[tokio::test]
async fn disabling_trading_blocks_orders_but_not_observation() {
    let gw = RecordingGateway::new();
    let mut store = default_store();
    assert!(store.update(ParamScope::CrossCutting, "trading_enabled", &json!(false)));
    let (event_tx, _) = broadcast::channel(256);
    let mut ctl = CycleController::new(store, gw.clone(), event_tx);

    let select: TickBatch = vec![tick(1, CE, 103.1), tick(2, PE, 95.0)];
    ctl.process_batch(&select).await.unwrap();
    ctl.process_batch(&vec![tick(1, CE, 100.0)]).await.unwrap();

    // The machine still advanced to the decision block and the ledger kept
    // tracking, but nothing was submitted.
    assert_eq!(ctl.block(), Block::Decision);
    assert!(gw.calls().is_empty());
    assert_eq!(ctl.ledger().get(1).unwrap().last_price, 100.0);
}

#[tokio::test]
async fn block_transitions_are_published_on_telemetry() {
    let gw = RecordingGateway::new();
    let (event_tx, mut event_rx) = broadcast::channel(256);
    let mut ctl = CycleController::new(default_store(), gw, event_tx);

    let batch: TickBatch = vec![tick(1, CE, 95.0), tick(2, PE, 105.0)];
    ctl.process_batch(&batch).await.unwrap();

    match event_rx.try_recv().unwrap() {
        EngineEvent::BlockChanged { from, to, cycle } => {
            assert_eq!(from, Block::Init);
            assert_eq!(to, Block::Update);
            assert_eq!(cycle, 1);
        }
        other => panic!("expected a block transition, got {other:?}"),
    }
}

#[tokio::test]
async fn control_updates_are_answered_and_applied_between_batches() {
    let gw = RecordingGateway::new();
    let (event_tx, _) = broadcast::channel(256);
    let ctl = CycleController::new(default_store(), gw, event_tx);

    let (batch_tx, batch_rx) = mpsc::channel::<TickBatch>(8);
    let (control_tx, control_rx) = mpsc::channel::<ControlUpdate>(8);
    let handle = tokio::spawn(ctl.run(batch_rx, control_rx));

    let (reply_tx, reply_rx) = oneshot::channel();
    control_tx
        .send(ControlUpdate {
            scope: ParamScope::PerStrategy,
            name: "target".to_string(),
            value: json!(12.0),
            reply: Some(reply_tx),
        })
        .await
        .unwrap();
    assert!(reply_rx.await.unwrap());

    let (reply_tx, reply_rx) = oneshot::channel();
    control_tx
        .send(ControlUpdate {
            scope: ParamScope::PerStrategy,
            name: "target".to_string(),
            value: json!("not a number"),
            reply: Some(reply_tx),
        })
        .await
        .unwrap();
    assert!(!reply_rx.await.unwrap());

    drop(batch_tx);
    drop(control_tx);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await;
}

#[tokio::test]
async fn stale_fill_from_a_finished_cycle_never_touches_the_new_position() {
    let gw = StallingGateway::new();
    let (event_tx, _keep) = broadcast::channel(256);
    let ctl = CycleController::new(default_store(), gw.clone(), event_tx);

    let (batch_tx, batch_rx) = mpsc::channel::<TickBatch>(16);
    let (control_tx, control_rx) = mpsc::channel::<ControlUpdate>(4);
    let handle = tokio::spawn(ctl.run(batch_rx, control_rx));

    // Cycle 1: buy at 100 (this order's fill stays unresolved), take profit
    // at 111, reset. Cycle 2: the same token is selected and bought at 100
    // again.
    for batch in [
        vec![tick(1, CE, 103.1), tick(2, PE, 95.0)],
        vec![tick(1, CE, 100.0)],
        vec![tick(1, CE, 109.6)],
        vec![tick(1, CE, 111.0)],
        vec![tick(1, CE, 103.1), tick(2, PE, 95.0)],
        vec![tick(1, CE, 100.0)],
    ] {
        batch_tx.send(batch).await.unwrap();
    }
    sleep(Duration::from_millis(100)).await;
    assert_eq!(gw.calls().len(), 3);

    // The first buy's fill finally resolves, at 150. Were it applied to the
    // new position, the prints below would sit inside the arm-and-fire
    // window; against the true basis of 100 they are far past the fire band
    // and nothing may be sold.
    gw.release.notify_one();
    sleep(Duration::from_millis(100)).await;
    batch_tx.send(vec![tick(1, CE, 159.6)]).await.unwrap();
    batch_tx.send(vec![tick(1, CE, 161.0)]).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let calls = gw.calls();
    assert!(calls.iter().skip(3).all(|c| c.side != OrderSide::Sell));

    drop(batch_tx);
    drop(control_tx);
    let _ = handle.await;
}

#[tokio::test]
async fn resolved_buy_fill_rebases_the_position_between_batches() {
    let gw = RebasingGateway::new();
    let (event_tx, _keep) = broadcast::channel(256);
    let ctl = CycleController::new(default_store(), gw.clone(), event_tx);

    let (batch_tx, batch_rx) = mpsc::channel::<TickBatch>(16);
    let (control_tx, control_rx) = mpsc::channel::<ControlUpdate>(4);
    let handle = tokio::spawn(ctl.run(batch_rx, control_rx));

    batch_tx
        .send(vec![tick(1, CE, 103.1), tick(2, PE, 95.0)])
        .await
        .unwrap();
    batch_tx.send(vec![tick(1, CE, 100.0)]).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    // The broker filled the buy at 95, not the 100 reference. 104.6 is
    // +9.6 against the executed price and arms the latch; 106 is +11 and
    // fires. Neither would arm against the unadjusted reference.
    batch_tx.send(vec![tick(1, CE, 104.6)]).await.unwrap();
    batch_tx.send(vec![tick(1, CE, 106.0)]).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let calls = gw.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].side, OrderSide::Sell);
    assert_eq!(calls[1].reference_price, 106.0);

    drop(batch_tx);
    drop(control_tx);
    let _ = handle.await;
}

#[tokio::test]
async fn fill_resolution_failure_falls_back_to_the_reference_price() {
    let (fill_tx, mut fill_rx) = mpsc::channel(4);
    fills::track(
        Arc::new(BrokenGateway),
        1,
        "ord-9".to_string(),
        OrderSide::Buy,
        100.0,
        1,
        fill_tx,
    );

    let fill = fill_rx.recv().await.unwrap();
    assert_eq!(fill.executed_price, 100.0);
    assert_eq!(fill.cycle, 1);
}

#[tokio::test]
async fn zero_price_fill_falls_back_to_the_reference_price() {
    // RecordingGateway resolves every fill to zero.
    let (fill_tx, mut fill_rx) = mpsc::channel(4);
    fills::track(
        RecordingGateway::new(),
        2,
        "ord-1".to_string(),
        OrderSide::Sell,
        111.0,
        3,
        fill_tx,
    );

    let fill = fill_rx.recv().await.unwrap();
    assert_eq!(fill.executed_price, 111.0);
    assert_eq!(fill.cycle, 3);
}

#[tokio::test]
async fn placement_failure_degrades_to_paper_fill_and_the_cycle_completes() {
    let gw = Arc::new(BrokenGateway);
    let (event_tx, mut event_rx) = broadcast::channel(256);
    let mut ctl = CycleController::new(default_store(), gw, event_tx);

    open_position(&mut ctl).await;
    ctl.process_batch(&vec![tick(1, CE, 109.6)]).await.unwrap();
    ctl.process_batch(&vec![tick(1, CE, 111.0)]).await.unwrap();

    // The broker never accepted anything, but the machine traded through
    // on paper semantics and finished the cycle.
    assert_eq!(ctl.block(), Block::Init);
    assert_eq!(ctl.cycle(), 2);

    let mut trades = 0;
    while let Ok(ev) = event_rx.try_recv() {
        if matches!(ev, EngineEvent::Trade(_)) {
            trades += 1;
        }
    }
    assert_eq!(trades, 2);
}

#[tokio::test]
async fn update_block_holds_until_the_entry_drop() {
    let gw = RecordingGateway::new();
    let mut ctl = controller(gw.clone());

    let select: TickBatch = vec![tick(1, CE, 103.1), tick(2, PE, 95.0)];
    ctl.process_batch(&select).await.unwrap();
    assert_eq!(ctl.block(), Block::Update);

    // A 2% drop is short of the 3% trigger; the block holds and nothing
    // is bought.
    ctl.process_batch(&vec![tick(1, CE, 101.0)]).await.unwrap();
    assert_eq!(ctl.block(), Block::Update);
    assert!(gw.calls().is_empty());
}
