//! DLC perpetuals coordinator simulation.
//!
//! Runs the engine against an in-process trader and chain: channel opening,
//! resize, flip, close, collaborative revert, an externally funded opening and
//! a rollover.

use dlc_perps_core::*;
use rust_decimal_macros::dec;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

type SimResult = Result<(), Box<dyn Error>>;

struct Sim {
    engine: Engine,
    chain: Arc<MockChain>,
}

#[tokio::main]
async fn main() -> SimResult {
    init_logging();
    let settings = load_settings()?;

    let storage: Arc<dyn Storage> = match std::env::var("DLC_CORE_STORE") {
        Ok(path) => Arc::new(FileStorage::open(path)?),
        Err(_) => Arc::new(MemoryStorage::new()),
    };
    let trader_side = Arc::new(LoopbackTransport::default().with_revert_tx_weight(settings.collab_revert.tx_weight));
    let chain = Arc::new(MockChain::new());
    let feed = Arc::new(StaticPriceFeed::new());
    feed.set(ContractSymbol::BtcUsd, price(dec!(29990)), price(dec!(30010)), dec!(0.0001));

    let engine = Engine::new(settings, storage, trader_side, chain.clone())?;
    for handle in engine.start()? {
        handle.wait().await;
    }
    let _feed_loop = engine.follow_price_feed(feed, ContractSymbol::BtcUsd, Duration::from_secs(1));
    let _rollovers = engine.spawn_rollover_scheduler();
    engine.submit_price(ContractSymbol::BtcUsd, price(dec!(29990)), price(dec!(30010)), dec!(0.0001))?;

    println!("DLC Perpetuals Coordinator Simulation");
    println!("Loopback trader, mock chain, BTCUSD at 29990/30010\n");

    let sim = Sim { engine, chain };
    scenario_1_open_resize_flip_close(&sim).await?;
    scenario_2_collaborative_revert(&sim).await?;
    scenario_3_external_funding(&sim).await?;

    sim.engine.shutdown().await;
    println!("\nAll simulations completed successfully.");
    Ok(())
}

fn price(value: rust_decimal::Decimal) -> Price {
    Price::new_unchecked(value)
}

fn leverage(value: rust_decimal::Decimal) -> Leverage {
    Leverage::new(value).unwrap_or_else(Leverage::one)
}

async fn trade(sim: &Sim, trader: &PeerId, direction: Direction, quantity: rust_decimal::Decimal) -> SimResult {
    let submitted = sim
        .engine
        .submit_market_order(trader.clone(), ContractSymbol::BtcUsd, direction, quantity, leverage(dec!(2)));
    let result = match submitted {
        Ok(result) => result,
        Err(e) => {
            println!("  {direction} {quantity} -> rejected: {e}");
            return Ok(());
        }
    };
    let status = sim.engine.wait_for_task(result.task_id).await?;
    println!("  {direction} {quantity} -> {:?}, task {:?}", result.action, status);
    print_position(sim, trader)
}

fn print_position(sim: &Sim, trader: &PeerId) -> SimResult {
    match sim.engine.position(trader, ContractSymbol::BtcUsd)? {
        Some(p) => println!(
            "    position: {} {} @ {}, margin {}, liquidation {}",
            p.direction, p.quantity, p.average_entry_price, p.collateral, p.liquidation_price
        ),
        None => println!("    position: flat"),
    }
    Ok(())
}

/// A channel opened by the first order, then resized, flipped and closed.
async fn scenario_1_open_resize_flip_close(sim: &Sim) -> SimResult {
    println!("Scenario 1: Open, Resize, Flip, Close\n");
    let trader = PeerId::new("trader-1");

    trade(sim, &trader, Direction::Long, dec!(100)).await?;
    trade(sim, &trader, Direction::Long, dec!(20)).await?;
    trade(sim, &trader, Direction::Short, dec!(160)).await?;
    trade(sim, &trader, Direction::Long, dec!(40)).await?;

    if let Some(channel) = sim.engine.channel_with(&trader)? {
        println!(
            "  channel {:?}/{:?}, reserves {} / {}\n",
            channel.state, channel.subchannel, channel.trader_reserve, channel.coordinator_reserve
        );
    }
    for t in sim.engine.trades_for(&trader)? {
        println!("    trade {} @ {}, fee {}, pnl {:?}", t.quantity, t.price, t.fee, t.realized_pnl);
    }
    println!();
    Ok(())
}

/// Both peers sign a split of the funding output at the current mid.
async fn scenario_2_collaborative_revert(sim: &Sim) -> SimResult {
    println!("Scenario 2: Collaborative Revert\n");
    let trader = PeerId::new("trader-2");
    trade(sim, &trader, Direction::Short, dec!(200)).await?;

    let Some(channel) = sim.engine.channel_with(&trader)? else {
        return Ok(());
    };
    let handle = sim.engine.request_collaborative_revert(channel.channel_id, None)?;
    let status = handle.wait().await;
    println!("  revert task: {status:?}");

    if let Some(revert) = sim.engine.collaborative_revert(channel.channel_id)? {
        println!(
            "  split at {}: trader {}, coordinator {}, fee {}",
            revert.price, revert.trader_amount, revert.coordinator_amount, revert.fee
        );
    }
    println!("  broadcasts: {}\n", sim.chain.broadcasts().len());
    Ok(())
}

/// The trader funds the channel from outside; the order waits for it.
async fn scenario_3_external_funding(sim: &Sim) -> SimResult {
    println!("Scenario 3: Externally Funded Opening and Rollover\n");
    let trader = PeerId::new("trader-3");
    let reserves = ChannelReserves { trader: Sats::new(500_000), coordinator: Sats::new(500_000) };

    let opening = sim
        .engine
        .submit_channel_opening_order(
            trader.clone(),
            ContractSymbol::BtcUsd,
            Direction::Long,
            dec!(100),
            leverage(dec!(2)),
            reserves,
            FundingSource::External,
        )
        .await?;
    println!("  pay to {:?}", opening.funding_address);

    let result = sim.engine.notify_funding_received(opening.order_id, TxRef::new("trader-funding", 0))?;
    let status = sim.engine.wait_for_task(result.task_id).await?;
    println!("  opening task: {status:?}");
    print_position(sim, &trader)?;

    let rollover = sim.engine.request_rollover(opening.channel_id)?;
    println!("  rollover task: {:?}", rollover.wait().await);
    if let Some(params) = sim.engine.latest_rollover_params(opening.channel_id)? {
        println!("  rolled to {}, funding fee {}", params.expiry, params.funding_fee.amount);
    }
    Ok(())
}
