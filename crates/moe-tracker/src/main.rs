//! MoE Tracker - live Marks of Excellence tracking CLI
//!
//! The `moe-tracker` command turns a stream of observed combined-damage
//! readings into a live MoE percentage and keeps it honest against the
//! server-side statistics.
//!
//! ## Commands
//!
//! - `run`: track readings from stdin or a file, serve live snapshots
//! - `status`: show the restored snapshot of the stored session
//! - `history`: show the current session's battle log
//! - `verify`: check the stored EMA against a replay of the battle log
//! - `battles-to-target`: project battles needed to reach the target

mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use moe_core::{
    resolve_target, spawn_poller, BattlesToTarget, CachedThresholdProvider, ChannelSource,
    DamageReading, EmaCalculator, Engine, MoeCalculator, NullResultProvider, ReadingFilter,
    ResultProvider, TankSelection, TrackerConfig, WargamingClient, WargamingResultProvider,
};
use moe_state::{BattleRecord, EmaState, SessionStore, StoredState, SurrealSessionStore, TankId};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "moe-tracker")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Live Marks of Excellence tracker", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file
    #[arg(short, long, global = true, default_value = "moe-tracker.toml", env = "MOE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track damage readings and serve live snapshots
    Run {
        /// Read JSON-lines readings from this file instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Also print every snapshot to stdout
        #[arg(long)]
        echo: bool,

        #[command(flatten)]
        tank: TankArgs,
    },

    /// Show the snapshot the stored session restores to
    Status {
        #[command(flatten)]
        tank: TankArgs,
    },

    /// Show the current session's battle log
    History {
        /// Maximum number of battles to show (most recent last)
        #[arg(short, long)]
        limit: Option<usize>,

        /// Print the log as JSON
        #[arg(long)]
        as_json: bool,
    },

    /// Replay the battle log and compare it with the stored EMA
    Verify,

    /// How many battles at a given damage reach the target
    BattlesToTarget {
        /// Combined damage per battle
        #[arg(short, long)]
        damage: u64,

        #[command(flatten)]
        tank: TankArgs,
    },
}

#[derive(clap::Args, Debug, Default)]
struct TankArgs {
    /// Tank id (overrides [player].tank_id)
    #[arg(long)]
    tank_id: Option<u64>,

    /// Tank display name (overrides [player].tank_name)
    #[arg(long)]
    tank_name: Option<String>,

    /// Damage target (overrides cached thresholds)
    #[arg(long)]
    target: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    moe_core::init_tracing(cli.json, level);

    let mut config = TrackerConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;
    config
        .apply_env()
        .context("Invalid configuration override")?;

    match cli.command {
        Commands::Run { input, echo, tank } => cmd_run(&config, &tank, input.as_deref(), echo).await,
        Commands::Status { tank } => {
            let store = open_store(&config).await?;
            cmd_status(store.as_ref(), &config, &tank).await
        }
        Commands::History { limit, as_json } => {
            let store = open_store(&config).await?;
            cmd_history(store.as_ref(), limit, as_json).await
        }
        Commands::Verify => {
            let store = open_store(&config).await?;
            cmd_verify(store.as_ref(), &config).await
        }
        Commands::BattlesToTarget { damage, tank } => {
            let store = open_store(&config).await?;
            cmd_battles_to_target(store.as_ref(), &config, &tank, damage).await
        }
    }
}

// ---------------------------------------------------------------------------
// Setup helpers
// ---------------------------------------------------------------------------

async fn open_store(config: &TrackerConfig) -> Result<Arc<dyn SessionStore>> {
    let store = if config.store.is_memory() {
        SurrealSessionStore::in_memory()
            .await
            .context("Failed to start in-memory store")?
    } else {
        SurrealSessionStore::open(Path::new(&config.store.path))
            .await
            .with_context(|| format!("Failed to open store at {}", config.store.path))?
    };
    Ok(Arc::new(store))
}

fn threshold_cache(config: &TrackerConfig) -> CachedThresholdProvider {
    CachedThresholdProvider::new(&config.store.threshold_cache, config.player.marks_on_gun)
}

/// Target precedence: command line, then config override, then the cache.
async fn target_for(config: &TrackerConfig, tank: &TankArgs, tank_id: TankId) -> Result<f64> {
    let thresholds = threshold_cache(config);
    let explicit = tank.target.or(config.player.target_damage);
    if let Some(target) = explicit.filter(|t| *t > 0.0) {
        let name = configured_tank_name(config, tank).unwrap_or(UNKNOWN_TANK);
        thresholds
            .set_manual(tank_id, &name, target)
            .await
            .context("Failed to update threshold cache")?;
    }

    match resolve_target(explicit, &thresholds, tank_id).await {
        Some(target) => Ok(target),
        None => {
            warn!(tank_id = %tank_id, "no damage target known, MoE will read 0%");
            Ok(0.0)
        }
    }
}

/// API client, when an application id is configured.
fn api_client(config: &TrackerConfig) -> Result<Option<WargamingClient>> {
    let Some(application_id) = config.api.application_id.as_deref() else {
        return Ok(None);
    };
    let client = WargamingClient::new(application_id, config.api.platform)
        .context("Failed to build API client")?;
    Ok(Some(client))
}

async fn result_provider(
    config: &TrackerConfig,
    client: Option<&WargamingClient>,
) -> Result<Arc<dyn ResultProvider>> {
    let (Some(client), Some(gamertag)) = (client, config.player.gamertag.as_deref()) else {
        info!("no API credentials configured, estimates will not be corrected");
        return Ok(Arc::new(NullResultProvider));
    };

    let account_id = client
        .resolve_gamertag(gamertag)
        .await
        .with_context(|| format!("Failed to look up gamertag '{}'", gamertag))?
        .with_context(|| format!("No player named '{}'", gamertag))?;
    info!(gamertag, account_id, "resolved player");
    Ok(Arc::new(WargamingResultProvider::new(client.clone(), account_id)))
}

const UNKNOWN_TANK: &str = "Unknown";

fn configured_tank_name<'a>(config: &'a TrackerConfig, tank: &'a TankArgs) -> Option<&'a str> {
    tank.tank_name
        .as_deref()
        .or(config.player.tank_name.as_deref())
}

/// Name precedence: command line, then config, then the vehicle encyclopedia.
async fn tank_name_for(
    config: &TrackerConfig,
    tank: &TankArgs,
    tank_id: TankId,
    client: Option<&WargamingClient>,
) -> String {
    if let Some(name) = configured_tank_name(config, tank) {
        return name.to_string();
    }
    let Some(client) = client else {
        return UNKNOWN_TANK.to_string();
    };
    match client.vehicle_name(tank_id).await {
        Ok(Some(name)) => {
            info!(tank_id = %tank_id, tank = %name, "tank name from encyclopedia");
            name
        }
        Ok(None) => {
            warn!(tank_id = %tank_id, "tank not found in encyclopedia");
            UNKNOWN_TANK.to_string()
        }
        Err(err) => {
            warn!(tank_id = %tank_id, error = %err, "tank name lookup failed");
            UNKNOWN_TANK.to_string()
        }
    }
}

async fn tank_selection(
    config: &TrackerConfig,
    tank: &TankArgs,
    client: Option<&WargamingClient>,
) -> Result<TankSelection> {
    let tank_id = TankId(tank.tank_id.unwrap_or(config.player.tank_id));
    let tank_name = tank_name_for(config, tank, tank_id, client).await;
    let target = target_for(config, tank, tank_id).await?;
    Ok(TankSelection::new(tank_id, tank_name, target)
        .with_starting_moe(config.player.current_moe_percent))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_run(
    config: &TrackerConfig,
    tank: &TankArgs,
    input: Option<&Path>,
    echo: bool,
) -> Result<()> {
    let store = open_store(config).await?;
    let client = api_client(config)?;
    let provider = result_provider(config, client.as_ref()).await?;
    let selection = tank_selection(config, tank, client.as_ref()).await?;

    let (engine, engine_task) = Engine::spawn(store, provider, config, selection)
        .await
        .context("Failed to start tracking engine")?;

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind snapshot feed on {}", config.server.bind))?;
    let server_task = tokio::spawn(server::serve(listener, engine.clone()));

    let echo_task = echo.then(|| {
        let mut sub = engine.subscribe();
        tokio::spawn(async move {
            while let Some(snapshot) = sub.recv().await {
                if let Ok(line) = serde_json::to_string(&snapshot) {
                    println!("{}", line);
                }
            }
        })
    });

    let (tx, source) = ChannelSource::channel(256);
    let queued = tx.clone();
    let poller = spawn_poller(
        source,
        ReadingFilter::new(config.tracking.min_confidence),
        engine.clone(),
        config.sample_interval(),
    );
    let reader = tokio::spawn(read_readings(input.map(Path::to_path_buf), tx));

    tokio::select! {
        result = reader => {
            result.context("Reading task panicked")??;
            // Let the poller drain what was read before stopping.
            while queued.capacity() < queued.max_capacity() {
                tokio::time::sleep(config.sample_interval()).await;
            }
            tokio::time::sleep(config.sample_interval()).await;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
        }
    }

    let final_snapshot = engine.snapshot().await?;
    engine.shutdown().await?;
    engine_task.await.context("Engine task panicked")?;
    poller.abort();
    server_task.abort();
    if let Some(task) = echo_task {
        task.abort();
    }

    info!(
        tank = %final_snapshot.tank_name,
        moe_percent = final_snapshot.moe_percent,
        "tracking stopped"
    );
    Ok(())
}

/// Forward JSON-lines readings into the sampling channel.
async fn read_readings(input: Option<PathBuf>, tx: mpsc::Sender<DamageReading>) -> Result<()> {
    match input {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            forward_lines(BufReader::new(file), tx).await
        }
        None => forward_lines(BufReader::new(tokio::io::stdin()), tx).await,
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<DamageReading>) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await.context("Failed to read input")? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<DamageReading>(line) {
            Ok(reading) => {
                if tx.send(reading).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!(line = line_no, error = %err, "skipping malformed reading"),
        }
    }
    Ok(())
}

async fn cmd_status(store: &dyn SessionStore, config: &TrackerConfig, tank: &TankArgs) -> Result<()> {
    let Some(stored) = store.load().await.context("Failed to load session")? else {
        println!("No session recorded yet");
        return Ok(());
    };
    let target = target_for(config, tank, stored.session.tank_id).await?;
    let (calculator, _) = MoeCalculator::restore(config.ema()?, stored, target);
    println!("{}", serde_json::to_string_pretty(calculator.snapshot())?);
    Ok(())
}

/// One battle as shown by `history`.
#[derive(Debug, Serialize)]
struct HistoryEntry {
    seq: u32,
    ended_at: String,
    combined_damage: u64,
    estimated_damage: u64,
    source: &'static str,
}

impl From<&BattleRecord> for HistoryEntry {
    fn from(record: &BattleRecord) -> Self {
        Self {
            seq: record.seq,
            ended_at: record.ended_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            combined_damage: record.combined_damage,
            estimated_damage: record.estimated_damage,
            source: record.source.as_str(),
        }
    }
}

fn history_entries(stored: &StoredState, limit: Option<usize>) -> Vec<HistoryEntry> {
    let battles = &stored.battles;
    let skip = limit.map_or(0, |n| battles.len().saturating_sub(n));
    battles.iter().skip(skip).map(HistoryEntry::from).collect()
}

async fn cmd_history(store: &dyn SessionStore, limit: Option<usize>, as_json: bool) -> Result<()> {
    let Some(stored) = store.load().await.context("Failed to load session")? else {
        println!("No session recorded yet");
        return Ok(());
    };
    let entries = history_entries(&stored, limit);

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!(
        "session {} ({}, started {})",
        stored.session.session_id,
        stored.session.tank_name,
        stored.session.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if entries.is_empty() {
        println!("No battles recorded");
        return Ok(());
    }
    for entry in entries {
        let note = if entry.combined_damage != entry.estimated_damage {
            format!(" (estimated {})", entry.estimated_damage)
        } else {
            String::new()
        };
        println!(
            "#{:<4} {}  {:>6}  {}{}",
            entry.seq, entry.ended_at, entry.combined_damage, entry.source, note
        );
    }
    Ok(())
}

/// Outcome of replaying the log against the stored EMA.
#[derive(Debug, PartialEq)]
enum Verification {
    Consistent(EmaState),
    Mismatch { stored: Option<EmaState>, replayed: EmaState },
}

fn verify_state(stored: &StoredState, ema: &EmaCalculator) -> Verification {
    let replayed = ema.replay_from(
        stored.session.seed_average,
        stored.battles.iter().map(|b| b.combined_damage),
    );
    match stored.ema {
        Some(saved)
            if saved.battle_count == replayed.battle_count
                && saved.alpha == replayed.alpha
                && (saved.average - replayed.average).abs()
                    <= 1e-9 * saved.average.abs().max(1.0) =>
        {
            Verification::Consistent(replayed)
        }
        None if stored.battles.is_empty() => Verification::Consistent(replayed),
        saved => Verification::Mismatch {
            stored: saved,
            replayed,
        },
    }
}

async fn cmd_verify(store: &dyn SessionStore, config: &TrackerConfig) -> Result<()> {
    let Some(stored) = store.load().await.context("Failed to load session")? else {
        println!("No session recorded yet");
        return Ok(());
    };
    match verify_state(&stored, &config.ema()?) {
        Verification::Consistent(state) => {
            println!(
                "OK: {} battles, average {:.1} (alpha {:.4})",
                state.battle_count, state.average, state.alpha
            );
            Ok(())
        }
        Verification::Mismatch { stored, replayed } => {
            match stored {
                Some(saved) => println!(
                    "stored:   {} battles, average {:.3} (alpha {:.4})",
                    saved.battle_count, saved.average, saved.alpha
                ),
                None => println!("stored:   no EMA record"),
            }
            println!(
                "replayed: {} battles, average {:.3} (alpha {:.4})",
                replayed.battle_count, replayed.average, replayed.alpha
            );
            bail!("EMA state does not match the battle log; it is rebuilt on next run")
        }
    }
}

async fn cmd_battles_to_target(
    store: &dyn SessionStore,
    config: &TrackerConfig,
    tank: &TankArgs,
    damage: u64,
) -> Result<()> {
    let ema = config.ema()?;
    let stored = store.load().await.context("Failed to load session")?;
    let tank_id = match &stored {
        Some(stored) => stored.session.tank_id,
        None => TankId(tank.tank_id.unwrap_or(config.player.tank_id)),
    };
    let target = target_for(config, tank, tank_id).await?;
    if target <= 0.0 {
        bail!("No damage target known; pass --target or set [player].target_damage");
    }

    let (seed, state) = projection_start(&ema, stored.as_ref(), config, target);
    match ema.battles_to_target(seed, &state, target, damage) {
        BattlesToTarget::Reached(0) => println!(
            "Target {:.0} already reached (average {:.1})",
            target, state.average
        ),
        BattlesToTarget::Reached(n) => println!(
            "{} battle(s) at {} combined damage reach {:.0} (average now {:.1})",
            n, damage, target, state.average
        ),
        BattlesToTarget::Unreachable => println!(
            "{} combined damage per battle never reaches {:.0}",
            damage, target
        ),
    }
    Ok(())
}

/// Seed and EMA state a projection starts from: the stored session, or a
/// fresh one seeded from `[player].current_moe_percent`.
fn projection_start(
    ema: &EmaCalculator,
    stored: Option<&StoredState>,
    config: &TrackerConfig,
    target: f64,
) -> (Option<f64>, EmaState) {
    match stored {
        Some(stored) => {
            let seed = stored.session.seed_average;
            let state = ema.replay_from(seed, stored.battles.iter().map(|b| b.combined_damage));
            (seed, state)
        }
        None => {
            let seed = TankSelection::new(TankId(config.player.tank_id), UNKNOWN_TANK, target)
                .with_starting_moe(config.player.current_moe_percent)
                .seed_average();
            (seed, ema.start(seed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use httpmock::prelude::*;
    use moe_state::{BattleId, Session};
    use serde_json::json;

    async fn seeded_store(values: &[u64], ema: &EmaCalculator) -> (SurrealSessionStore, Session) {
        let store = SurrealSessionStore::in_memory().await.unwrap();
        let session = store.new_session(TankId(5137), "T-54").await.unwrap();
        let mut state = ema.empty();
        for (i, value) in values.iter().enumerate() {
            let record = BattleRecord::estimated(
                BattleId::new(),
                session.session_id.clone(),
                i as u32 + 1,
                *value,
                Utc::now(),
            );
            store.append_battle(&record).await.unwrap();
            state = ema.update(&state, *value);
        }
        store.save_ema(&session.session_id, &state).await.unwrap();
        (store, session)
    }

    #[tokio::test]
    async fn verify_accepts_consistent_state() {
        let ema = EmaCalculator::new(0.3).unwrap();
        let (store, _) = seeded_store(&[1000, 2000, 820], &ema).await;
        let stored = store.load().await.unwrap().unwrap();
        assert!(matches!(
            verify_state(&stored, &ema),
            Verification::Consistent(state) if state.battle_count == 3
        ));
    }

    #[tokio::test]
    async fn verify_flags_tampered_ema() {
        let ema = EmaCalculator::new(0.3).unwrap();
        let (store, session) = seeded_store(&[1000, 2000], &ema).await;
        let tampered = EmaState {
            average: 5000.0,
            battle_count: 2,
            alpha: 0.3,
        };
        store.save_ema(&session.session_id, &tampered).await.unwrap();

        let stored = store.load().await.unwrap().unwrap();
        match verify_state(&stored, &ema) {
            Verification::Mismatch { stored, replayed } => {
                assert_eq!(stored, Some(tampered));
                assert_eq!(replayed.average, 1300.0);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn verify_flags_alpha_change() {
        let (store, _) = seeded_store(&[1000, 2000], &EmaCalculator::new(0.3).unwrap()).await;
        let stored = store.load().await.unwrap().unwrap();
        assert!(matches!(
            verify_state(&stored, &EmaCalculator::new(0.5).unwrap()),
            Verification::Mismatch { .. }
        ));
    }

    #[tokio::test]
    async fn verify_replays_through_session_seed() {
        let ema = EmaCalculator::new(0.5).unwrap();
        let store = SurrealSessionStore::in_memory().await.unwrap();
        let session = store
            .new_session(TankId(5137), "T-54")
            .await
            .unwrap()
            .with_seed_average(Some(1600.0));
        store.update_session(&session).await.unwrap();
        let record =
            BattleRecord::estimated(BattleId::new(), session.session_id.clone(), 1, 1000, Utc::now());
        store.append_battle(&record).await.unwrap();
        let state = ema.update_from(Some(1600.0), &ema.start(Some(1600.0)), 1000);
        store.save_ema(&session.session_id, &state).await.unwrap();

        let stored = store.load().await.unwrap().unwrap();
        match verify_state(&stored, &ema) {
            Verification::Consistent(replayed) => assert_eq!(replayed.average, 1300.0),
            other => panic!("expected consistent, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn projection_starts_from_stored_or_configured_seed() {
        let ema = EmaCalculator::new(0.5).unwrap();
        let mut config = TrackerConfig::default();
        config.player.current_moe_percent = Some(80.0);

        let (seed, state) = projection_start(&ema, None, &config, 2000.0);
        assert_eq!(seed, Some(1600.0));
        assert_eq!(state.average, 1600.0);
        assert_eq!(state.battle_count, 0);
        assert_eq!(
            ema.battles_to_target(seed, &state, 1500.0, 0),
            BattlesToTarget::Reached(0)
        );

        // A stored session keeps its own seed, whatever the config says now.
        let (store, _) = seeded_store(&[1000, 2000], &ema).await;
        let stored = store.load().await.unwrap().unwrap();
        let (seed, state) = projection_start(&ema, Some(&stored), &config, 2000.0);
        assert_eq!(seed, None);
        assert_eq!(state.average, 1500.0);
    }

    #[tokio::test]
    async fn missing_tank_name_is_looked_up() {
        let server = MockServer::start_async().await;
        let lookup = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/encyclopedia/vehicles/")
                    .query_param("tank_id", "5137");
                then.status(200).json_body(json!({
                    "status": "ok",
                    "data": {"5137": {"short_name": "Tiger II", "tier": 8}}
                }));
            })
            .await;
        let client = WargamingClient::with_base_url("demo", server.base_url()).unwrap();
        let config = TrackerConfig::default();

        let name = tank_name_for(&config, &TankArgs::default(), TankId(5137), Some(&client)).await;
        assert_eq!(name, "Tiger II");
        lookup.assert_async().await;
    }

    #[tokio::test]
    async fn configured_tank_name_skips_lookup() {
        let server = MockServer::start_async().await;
        let lookup = server
            .mock_async(|when, then| {
                when.method(GET).path("/encyclopedia/vehicles/");
                then.status(200).json_body(json!({"status": "ok", "data": {}}));
            })
            .await;
        let client = WargamingClient::with_base_url("demo", server.base_url()).unwrap();
        let mut config = TrackerConfig::default();
        config.player.tank_name = Some("T-54".into());

        let name = tank_name_for(&config, &TankArgs::default(), TankId(5137), Some(&client)).await;
        assert_eq!(name, "T-54");
        let args = TankArgs {
            tank_name: Some("Leopard 1".into()),
            ..TankArgs::default()
        };
        assert_eq!(
            tank_name_for(&config, &args, TankId(5137), Some(&client)).await,
            "Leopard 1"
        );
        assert_eq!(lookup.hits_async().await, 0);
    }

    #[tokio::test]
    async fn unknown_tank_without_client_or_entry() {
        let config = TrackerConfig::default();
        assert_eq!(
            tank_name_for(&config, &TankArgs::default(), TankId(1), None).await,
            UNKNOWN_TANK
        );

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/encyclopedia/vehicles/");
                then.status(200).json_body(json!({"status": "ok", "data": {"1": null}}));
            })
            .await;
        let client = WargamingClient::with_base_url("demo", server.base_url()).unwrap();
        assert_eq!(
            tank_name_for(&config, &TankArgs::default(), TankId(1), Some(&client)).await,
            UNKNOWN_TANK
        );
    }

    #[tokio::test]
    async fn history_keeps_most_recent_battles() {
        let ema = EmaCalculator::new(0.3).unwrap();
        let (store, _) = seeded_store(&[100, 200, 300, 400], &ema).await;
        let stored = store.load().await.unwrap().unwrap();

        let entries = history_entries(&stored, Some(2));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 3);
        assert_eq!(entries[1].combined_damage, 400);
        assert_eq!(entries[1].source, "estimated");
        assert_eq!(history_entries(&stored, None).len(), 4);
    }

    #[tokio::test]
    async fn readings_are_parsed_and_malformed_lines_skipped() {
        let input = b"{\"value\": 150, \"confidence\": 0.9}\nnot json\n\n{\"value\": 400}\n";
        let (tx, mut rx) = mpsc::channel(8);
        forward_lines(BufReader::new(&input[..]), tx).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.value, 150);
        assert_eq!(first.confidence, 0.9);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.value, 400);
        assert_eq!(second.confidence, 1.0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn explicit_target_wins_and_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TrackerConfig::default();
        config.store.threshold_cache = dir.path().join("thresholds.json");

        let args = TankArgs {
            target: Some(2450.0),
            ..TankArgs::default()
        };
        assert_eq!(target_for(&config, &args, TankId(5137)).await.unwrap(), 2450.0);

        // Later runs without an explicit target fall back to the cache.
        let cached = target_for(&config, &TankArgs::default(), TankId(5137))
            .await
            .unwrap();
        assert_eq!(cached, 2450.0);
        assert_eq!(
            target_for(&config, &TankArgs::default(), TankId(1)).await.unwrap(),
            0.0
        );
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "moe-tracker",
            "--json",
            "run",
            "--input",
            "readings.jsonl",
            "--echo",
            "--tank-id",
            "5137",
            "--target",
            "2000",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run { input, echo, tank } => {
                assert_eq!(input, Some(PathBuf::from("readings.jsonl")));
                assert!(echo);
                assert_eq!(tank.tank_id, Some(5137));
                assert_eq!(tank.target, Some(2000.0));
            }
            _ => panic!("expected run"),
        }
    }
}
