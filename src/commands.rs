//! CLI command handlers.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use baton_core::{
    default_runners, BatonConfig, DeviceId, RaceState, Runner, TeamId, Timestamp,
};
use baton_events::{
    EventHandler, EventPattern, LoggingNotificationSink, Priority, PriorityEventBus, RaceEvent,
};
use baton_projection::{
    detect_and_repair_impossible_leg_states, is_major_exchange, validate_race_state,
    ValidationReport,
};
use baton_store::LocalRaceStore;
use baton_sync::{InMemoryRemoteStore, ReconciliationLoop, RemoteStore, SharedStore, SyncCoordinator};
use chrono::{DateTime, TimeZone, Utc};
use futures::future::try_join_all;
use itertools::Itertools;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::cli::{Cli, Commands};

/// Execute a CLI command.
///
/// # Errors
///
/// Returns an error when the config or an input file cannot be loaded, or
/// when the command itself fails.
pub async fn execute_command(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Schedule {
            start,
            roster,
            json,
        } => cmd_schedule(&config, &start, roster.as_deref(), json),
        Commands::Validate { state, json } => cmd_validate(&state, json),
        Commands::Simulate { devices } => cmd_simulate(&config, devices).await,
    }
}

/// Load and validate the config, or fall back to defaults when no path is given.
///
/// # Errors
///
/// Returns an error if the file cannot be read or fails validation.
pub fn load_config(path: Option<&Path>) -> Result<BatonConfig> {
    let config = match path {
        Some(path) => BatonConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => BatonConfig::default(),
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Parse an RFC 3339 start time into epoch milliseconds.
///
/// # Errors
///
/// Returns an error for anything that is not RFC 3339.
pub fn parse_start(start: &str) -> Result<Timestamp> {
    let parsed = DateTime::parse_from_rfc3339(start)
        .with_context(|| format!("Invalid start time '{start}', expected RFC 3339"))?;
    Ok(parsed.timestamp_millis())
}

fn format_time(ms: Timestamp) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map_or_else(|| ms.to_string(), |t| t.format("%a %H:%M").to_string())
}

// ==========================================================================
// schedule
// ==========================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleRow {
    pub leg: u32,
    pub runner: String,
    pub van: u8,
    pub distance: f64,
    pub projected_start: Timestamp,
    pub projected_finish: Timestamp,
    pub major_exchange: bool,
}

/// Materialize a race from `roster` (normalized) and project it from `start`.
///
/// # Errors
///
/// Returns an error for a non-positive start time.
pub fn build_schedule(config: &BatonConfig, start: Timestamp, roster: Vec<Runner>) -> Result<Vec<ScheduleRow>> {
    let mut store = LocalRaceStore::from_config(&config.race);
    store.set_race_data(Some(start), roster, Vec::new())?;
    store.complete_setup(start)?;

    let rows = store
        .legs()
        .iter()
        .map(|leg| ScheduleRow {
            leg: leg.id,
            runner: store
                .runner(leg.runner_id)
                .map_or_else(|| format!("#{}", leg.runner_id), |r| r.name.clone()),
            van: store.runner(leg.runner_id).map_or(0, |r| u8::from(r.van)),
            distance: leg.distance,
            projected_start: leg.projected_start,
            projected_finish: leg.projected_finish,
            major_exchange: is_major_exchange(store.legs(), store.runners(), leg.id),
        })
        .collect();
    Ok(rows)
}

fn load_roster(path: Option<&Path>) -> Result<Vec<Runner>> {
    let Some(path) = path else {
        return Ok(default_runners());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read roster {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid roster JSON in {}", path.display()))
}

fn cmd_schedule(config: &BatonConfig, start: &str, roster: Option<&Path>, json: bool) -> Result<()> {
    let start = parse_start(start)?;
    let rows = build_schedule(config, start, load_roster(roster)?)?;
    info!(legs = rows.len(), "Projected schedule");

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    println!("{:>3}  {:<16} {:>3} {:>6}  {:<10} {:<10}", "LEG", "RUNNER", "VAN", "MI", "START", "FINISH");
    for row in &rows {
        println!(
            "{:>3}  {:<16} {:>3} {:>6.1}  {:<10} {:<10}{}",
            row.leg,
            row.runner,
            row.van,
            row.distance,
            format_time(row.projected_start),
            format_time(row.projected_finish),
            if row.major_exchange { "  * van exchange" } else { "" }
        );
    }
    Ok(())
}

// ==========================================================================
// validate
// ==========================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ValidationSummary {
    pub before: ValidationReport,
    pub repairs: Vec<String>,
    pub unresolved: Vec<String>,
    pub after: ValidationReport,
}

/// Validate `state`, repair impossible leg states and validate again.
pub fn validate_state(state: &RaceState) -> ValidationSummary {
    let before = validate_race_state(&state.legs);
    let repair = detect_and_repair_impossible_leg_states(&state.legs);
    let after = validate_race_state(&repair.legs);
    ValidationSummary {
        before,
        repairs: repair.changes,
        unresolved: repair.unresolved,
        after,
    }
}

fn cmd_validate(path: &Path, json: bool) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read race state {}", path.display()))?;
    let state: RaceState = serde_json::from_str(&content)
        .with_context(|| format!("Invalid race state JSON in {}", path.display()))?;
    let summary = validate_state(&state);

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    if summary.before.is_valid {
        println!("Race state is valid ({} legs)", state.legs.len());
        return Ok(());
    }
    println!("Found {} issue(s):", summary.before.issues.len());
    for issue in &summary.before.issues {
        println!("  - {issue}");
    }
    println!("Repairs:");
    for change in &summary.repairs {
        println!("  - {change}");
    }
    if !summary.unresolved.is_empty() {
        println!("Needs a manual correction:");
        for item in &summary.unresolved {
            println!("  - {item}");
        }
    }
    if summary.after.is_valid {
        println!("State is valid after repair");
    } else {
        println!("Still invalid after repair:");
        for issue in &summary.after.issues {
            println!("  - {issue}");
        }
    }
    Ok(())
}

// ==========================================================================
// simulate
// ==========================================================================

/// One simulated phone: its own store, bus and coordinator.
struct SimDevice {
    store: SharedStore,
    bus: PriorityEventBus,
    sync: SyncCoordinator,
}

impl SimDevice {
    fn new(config: &BatonConfig, team: &TeamId, remote: &Arc<InMemoryRemoteStore>, index: u8) -> Self {
        let store: SharedStore = Arc::new(RwLock::new(
            LocalRaceStore::from_config(&config.race).with_team(team.clone()),
        ));
        let bus = PriorityEventBus::new(config.bus.clone());
        let remote: Arc<dyn RemoteStore> = Arc::clone(remote) as Arc<dyn RemoteStore>;
        let sync = SyncCoordinator::new(
            team.clone(),
            DeviceId::new(format!("device-{index}")),
            Arc::clone(&store),
            remote,
            bus.clone(),
            config.sync.clone(),
        );
        sync.attach();
        Self { store, bus, sync }
    }

    async fn edit(
        &self,
        f: impl FnOnce(&mut LocalRaceStore) -> baton_core::Result<Vec<RaceEvent>>,
    ) -> Result<()> {
        let events = {
            let mut store = self.store.write().await;
            f(&mut store)?
        };
        self.bus.publish_all(events);
        self.bus.wait_idle().await;
        Ok(())
    }

    /// Authored fields only; projections may legitimately differ.
    async fn fingerprint(&self) -> String {
        let store = self.store.read().await;
        let runners: Vec<(u32, &str, u32)> = store
            .runners()
            .iter()
            .map(|r| (r.id, r.name.as_str(), r.pace))
            .collect();
        let legs: Vec<(u32, u32, Option<Timestamp>, Option<Timestamp>, Option<u32>)> = store
            .legs()
            .iter()
            .map(|l| (l.id, l.runner_id, l.actual_start, l.actual_finish, l.pace_override))
            .collect();
        format!("{runners:?}|{legs:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationReport {
    pub devices: usize,
    pub handoffs: usize,
    pub queued_while_offline: usize,
    pub notifications: usize,
    pub converged: bool,
}

/// Run `devices` coordinators against one in-memory remote: setup on the
/// first device, a few handoffs recorded on rotating devices, one offline
/// edit on the last device, then a reconciliation pass everywhere.
///
/// # Errors
///
/// Returns an error if any step of the scripted race fails.
pub async fn run_simulation(config: &BatonConfig, devices: u8) -> Result<SimulationReport> {
    let team = TeamId::from("simulated-team");
    let remote = Arc::new(InMemoryRemoteStore::new());
    let fleet: Vec<SimDevice> = (0..devices)
        .map(|i| SimDevice::new(config, &team, &remote, i))
        .collect();
    let (Some(first), Some(last)) = (fleet.first(), fleet.last()) else {
        bail!("simulation needs at least one device");
    };

    let sink = Arc::new(LoggingNotificationSink::new());
    let handler: Arc<dyn EventHandler> = Arc::clone(&sink) as Arc<dyn EventHandler>;
    first
        .bus
        .subscribe(EventPattern::ByPriority(Priority::Low), handler);

    let start = Utc::now().timestamp_millis();
    first.edit(|s| s.complete_setup(start)).await?;
    try_join_all(fleet.iter().map(|device| device.sync.initial_sync())).await?;

    first.edit(|s| s.record_leg_start(1, start)).await?;
    let handoffs: u32 = 6;
    for leg in 1..=handoffs {
        let device = fleet
            .get(leg as usize % fleet.len())
            .unwrap_or(first);
        device.sync.fetch_legs().await?;
        let at = start + i64::from(leg) * 30 * 60 * 1000;
        device.edit(|s| s.record_leg_finish(leg, at)).await?;
        info!(leg, device = %device.sync.device(), "Recorded handoff");
    }

    last.sync.handle_offline();
    last.edit(|s| s.set_runner_pace(4, 450)).await?;
    let queued_while_offline = last.sync.pending_changes();
    last.sync.handle_online().await;

    for device in &fleet {
        let pass = ReconciliationLoop::new(device.sync.clone(), config.sync.reconcile_interval());
        pass.reconcile_once().await?;
        device.bus.wait_idle().await;
    }
    first.bus.wait_idle().await;

    let mut prints = Vec::with_capacity(fleet.len());
    for device in &fleet {
        prints.push(device.fingerprint().await);
        device.sync.shutdown();
    }
    let converged = prints.iter().all_equal();
    if !converged {
        warn!("Devices diverged");
    }

    Ok(SimulationReport {
        devices: fleet.len(),
        handoffs: usize::try_from(handoffs).unwrap_or_default(),
        queued_while_offline,
        notifications: sink.history().len(),
        converged,
    })
}

async fn cmd_simulate(config: &BatonConfig, devices: u8) -> Result<()> {
    let report = run_simulation(config, devices).await?;
    println!("Devices:               {}", report.devices);
    println!("Handoffs recorded:     {}", report.handoffs);
    println!("Queued while offline:  {}", report.queued_while_offline);
    println!("Notifications:         {}", report.notifications);
    println!("Converged:             {}", report.converged);
    if !report.converged {
        bail!("devices did not converge");
    }
    Ok(())
}
