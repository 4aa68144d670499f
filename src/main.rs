use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tether::sim::SimEngine;
use tether::world::{AdditionSource, RemovalCause};
use tether::{
    BlockPos, EntityKind, GrowthState, OwnerId, Position, RuntimeConfig, StableId, TetherEvent,
    TetherRuntime, WorldEngine,
};
use uuid::Uuid;
use web_time::Instant;

const WORLD: &str = "overworld";

#[derive(Parser, Debug)]
#[command(about = "Runs a scripted tether scenario against the in-memory world engine")]
struct Args {
    /// JSON config file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    save_interval_secs: Option<u64>,
    #[arg(long)]
    max_backups: Option<usize>,
    #[arg(long)]
    sweep_interval_ms: Option<u64>,
}

fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(secs) = args.save_interval_secs {
        config.save_interval_secs = secs;
    }
    if let Some(max_backups) = args.max_backups {
        config.max_backups = max_backups;
    }
    if let Some(ms) = args.sweep_interval_ms {
        config.sweep_interval_ms = ms;
    }

    let engine = Arc::new(SimEngine::new());
    engine.add_world(WORLD)?;
    let handle: Arc<dyn WorldEngine> = engine.clone();
    let runtime = TetherRuntime::start(config, handle).map_err(std::io::Error::other)?;
    let events = runtime.tether().growth_handle().subscribe();

    let bessie = run_scenario(&runtime, &engine)?;

    for event in events.try_iter().filter(|event| event.stable_id() == bessie) {
        match event {
            TetherEvent::Relinked {
                stable_id,
                previous,
                transient,
            } => log::info!("event relinked {} {:?} -> {}", stable_id, previous, transient),
            other => log::info!("event {:?}", other),
        }
    }
    runtime.shutdown().map_err(std::io::Error::other)
}

/// Claim a cow, let it wander out of loaded range, walk back and watch the
/// sweep bring it back; then park it in a barn and let it out again.
fn run_scenario(runtime: &TetherRuntime, engine: &Arc<SimEngine>) -> std::io::Result<StableId> {
    let tether = Arc::clone(runtime.tether());
    let farmer = OwnerId(Uuid::new_v4());
    let pasture = Position::new(WORLD, 12.0, 64.0, -4.0, 90.0);

    let claim_tether = Arc::clone(&tether);
    let record = engine
        .run(WORLD, move |world| {
            let cow = world.spawn_wild("Cow", pasture);
            claim_tether.claim(
                world,
                cow.transient,
                farmer,
                Some("Bessie".to_string()),
                GrowthState(serde_json::json!({ "age": 0 })),
            )
        })
        .ok_or_else(|| std::io::Error::other("world thread stopped"))?
        .map_err(std::io::Error::other)?;
    log::info!("claimed {} as {}", record.name.as_deref().unwrap_or("?"), record.stable_id);

    let unload_tether = Arc::clone(&tether);
    let transient = record.transient;
    engine.run(WORLD, move |world| {
        let removed = transient.and_then(|t| world.take(t, RemovalCause::Unloaded))?;
        unload_tether.on_entity_removed(&removed, Instant::now()).ok()
    });

    let observer = Position::new(WORLD, 20.0, 64.0, 0.0, 0.0);
    engine.run(WORLD, move |world| world.add_observer(observer));
    tether.request_sweeps();
    engine.flush(WORLD);
    let respawned = tether.registry().get(record.stable_id);
    log::info!(
        "after sweep: state={:?} live={:?}",
        respawned.as_ref().map(|r| r.state),
        respawned.as_ref().and_then(|r| r.transient)
    );

    let barn = BlockPos::new(WORLD, 16, 64, 0);
    let barn_tether = Arc::clone(&tether);
    let stored_barn = barn.clone();
    let live = respawned.and_then(|r| r.transient);
    engine.run(WORLD, move |world| {
        let removed = live.and_then(|t| world.take(t, RemovalCause::EnteredContainer(stored_barn)))?;
        barn_tether.on_entity_removed(&removed, Instant::now()).ok()
    });

    let exit_tether = Arc::clone(&tether);
    let linked = engine.run(WORLD, move |world| {
        let added = world.emit(
            Some(EntityKind::from("Cow")),
            barn.center(),
            None,
            AdditionSource::ContainerExit(barn),
        );
        exit_tether.on_entity_added(world, &added).ok().flatten()
    });
    log::info!("left the barn as {:?}", linked.flatten());

    tether.save();
    Ok(record.stable_id)
}
