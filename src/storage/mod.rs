//! Persistence layer.
//!
//! Saves and loads engine snapshots to/from a JSON file. The file is
//! written to a temporary sibling first and renamed into place, so a crash
//! mid-write leaves the previous snapshot intact.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, info};

use crate::engine::EngineSnapshot;
use crate::types::Fixture;

/// Default snapshot file path.
const DEFAULT_STATE_FILE: &str = "exchange_state.json";

/// Save an engine snapshot to a JSON file.
pub fn save_snapshot(snapshot: &EngineSnapshot, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    let json =
        serde_json::to_string_pretty(snapshot).context("Failed to serialise engine snapshot")?;

    let tmp = format!("{path}.tmp");
    std::fs::write(&tmp, &json).with_context(|| format!("Failed to write snapshot to {tmp}"))?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to move snapshot into {path}"))?;

    debug!(
        path,
        fixtures = snapshot.inventories.len(),
        positions = snapshot.positions.len(),
        "Snapshot saved"
    );
    Ok(())
}

/// Load an engine snapshot from a JSON file.
/// Returns None if the file doesn't exist (fresh start).
pub fn load_snapshot(path: Option<&str>) -> Result<Option<EngineSnapshot>> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);

    if !Path::new(path).exists() {
        info!(path, "No saved snapshot found, starting fresh");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapshot from {path}"))?;
    let snapshot: EngineSnapshot = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse snapshot from {path}"))?;

    info!(
        path,
        group_id = snapshot.group_id,
        fixtures = snapshot.inventories.len(),
        positions = snapshot.positions.len(),
        offers = snapshot.offers.len(),
        saved_at = %snapshot.saved_at,
        "Snapshot loaded from disk"
    );

    Ok(Some(snapshot))
}

/// Delete the snapshot file (for testing or reset).
pub fn delete_snapshot(path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_STATE_FILE);
    if Path::new(path).exists() {
        std::fs::remove_file(path).with_context(|| format!("Failed to delete snapshot {path}"))?;
    }
    Ok(())
}

/// Read a JSON list of fixtures to ingest.
pub fn load_fixtures(path: &str) -> Result<Vec<Fixture>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read fixtures from {path}"))?;
    let fixtures: Vec<Fixture> = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse fixtures from {path}"))?;
    debug!(path, count = fixtures.len(), "Fixtures loaded");
    Ok(fixtures)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
