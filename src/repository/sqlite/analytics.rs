//! Aggregate analytics queries for the SQLite store.
//!
//! These operate read-only over the full audit log: per-state duration
//! statistics, transition-pair frequencies, and whole-journey durations.
//! Duration statistics are computed over closed records only; open intervals
//! have no duration yet.

use rusqlite::params;
use std::collections::HashMap;

use super::super::{stats_for, PathCount, RepositoryError, StateStats};
use super::SqliteStore;
use crate::definition::{OpportunityState, ALL_STATES};

fn decode_state_name(s: &str, operation: &str) -> Result<OpportunityState, RepositoryError> {
    OpportunityState::parse(s)
        .ok_or_else(|| RepositoryError::storage(operation, format!("unknown stored state: {s}")))
}

impl SqliteStore {
    pub(super) async fn state_analytics_impl(&self) -> Result<Vec<StateStats>, RepositoryError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn
                .prepare(
                    "SELECT state, exited_at - entered_at
                     FROM lifecycle_records
                     WHERE exited_at IS NOT NULL",
                )
                .map_err(|e| RepositoryError::storage("state_analytics", e.to_string()))?;

            let rows = stmt
                .query_map([], |row| {
                    let state: String = row.get(0)?;
                    let duration: i64 = row.get(1)?;
                    Ok((state, duration))
                })
                .map_err(|e| RepositoryError::storage("state_analytics", e.to_string()))?;

            let mut by_state: HashMap<OpportunityState, Vec<i64>> = HashMap::new();
            for row in rows {
                let (state, duration) =
                    row.map_err(|e| RepositoryError::storage("state_analytics", e.to_string()))?;
                by_state
                    .entry(decode_state_name(&state, "state_analytics")?)
                    .or_default()
                    .push(duration);
            }

            Ok(ALL_STATES
                .iter()
                .filter_map(|&state| {
                    stats_for(state, by_state.remove(&state).unwrap_or_default())
                })
                .collect())
        })
        .await
        .map_err(|e| RepositoryError::storage("state_analytics", e.to_string()))?
    }

    pub(super) async fn common_paths_impl(
        &self,
        limit: usize,
    ) -> Result<Vec<PathCount>, RepositoryError> {
        let conn = self.conn.clone();
        let limit = limit as i64;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn
                .prepare(
                    "SELECT state, next_state, COUNT(*)
                     FROM lifecycle_records
                     WHERE next_state IS NOT NULL
                     GROUP BY state, next_state
                     ORDER BY COUNT(*) DESC, state ASC, next_state ASC
                     LIMIT ?1",
                )
                .map_err(|e| RepositoryError::storage("common_paths", e.to_string()))?;

            let rows = stmt
                .query_map(params![limit], |row| {
                    let from: String = row.get(0)?;
                    let to: String = row.get(1)?;
                    let count: i64 = row.get(2)?;
                    Ok((from, to, count))
                })
                .map_err(|e| RepositoryError::storage("common_paths", e.to_string()))?;

            let mut paths = Vec::new();
            for row in rows {
                let (from, to, count) =
                    row.map_err(|e| RepositoryError::storage("common_paths", e.to_string()))?;
                paths.push(PathCount {
                    from: decode_state_name(&from, "common_paths")?,
                    to: decode_state_name(&to, "common_paths")?,
                    count: count.max(0) as usize,
                });
            }
            Ok(paths)
        })
        .await
        .map_err(|e| RepositoryError::storage("common_paths", e.to_string()))?
    }

    pub(super) async fn average_journey_duration_impl(
        &self,
    ) -> Result<Option<f64>, RepositoryError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            // Journey duration: first entry to the (latest) arrival in CLOSED,
            // per opportunity; averaged over opportunities that got there.
            conn.query_row(
                "SELECT AVG(journey) FROM (
                     SELECT MAX(CASE WHEN state = 'CLOSED' THEN entered_at END)
                            - MIN(entered_at) AS journey
                     FROM lifecycle_records
                     GROUP BY opportunity_id
                     HAVING MAX(CASE WHEN state = 'CLOSED' THEN entered_at END) IS NOT NULL
                 )",
                [],
                |row| row.get::<_, Option<f64>>(0),
            )
            .map_err(|e| RepositoryError::storage("average_journey_duration", e.to_string()))
        })
        .await
        .map_err(|e| RepositoryError::storage("average_journey_duration", e.to_string()))?
    }
}
