//! Message-count watermarks for hook-based captures.
//!
//! Each `(agent_id, source_id)` pair tracks how many messages of that source
//! have already been processed. A newly observed count smaller than the
//! stored one means the transcript was compacted; processing restarts from
//! index zero.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

/// Stored capture progress for one `(agent_id, source_id)`.
#[derive(Debug, Clone)]
pub struct CaptureState {
    pub message_count: i64,
    pub capture_cycles: i64,
    pub last_capture: Option<String>,
}

/// Read the stored capture state, if any.
pub fn get_capture_state(
    conn: &Connection,
    agent_id: &str,
    source_id: &str,
) -> Result<Option<CaptureState>> {
    let row = conn
        .query_row(
            "SELECT message_count, capture_cycles, last_capture \
             FROM capture_state WHERE agent_id = ?1 AND source_id = ?2",
            params![agent_id, source_id],
            |row| {
                Ok(CaptureState {
                    message_count: row.get(0)?,
                    capture_cycles: row.get(1)?,
                    last_capture: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Index of the first unprocessed message given a freshly observed count.
///
/// Returns the stored count, or 0 on first sight — or 0 when the observed
/// count regressed below the stored count (transcript compaction).
pub fn resume_index(
    conn: &Connection,
    agent_id: &str,
    source_id: &str,
    observed_count: i64,
) -> Result<i64> {
    let Some(state) = get_capture_state(conn, agent_id, source_id)? else {
        return Ok(0);
    };

    if observed_count < state.message_count {
        tracing::warn!(
            agent_id,
            source_id,
            stored = state.message_count,
            observed = observed_count,
            "message count regressed, treating as compaction"
        );
        return Ok(0);
    }

    Ok(state.message_count)
}

/// Record a completed capture cycle: upsert the message count, bump the cycle
/// counter, stamp the capture time.
pub fn record_capture(
    conn: &Connection,
    agent_id: &str,
    source_id: &str,
    message_count: i64,
) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO capture_state (agent_id, source_id, message_count, capture_cycles, last_capture) \
         VALUES (?1, ?2, ?3, 1, ?4) \
         ON CONFLICT(agent_id, source_id) DO UPDATE SET \
             message_count = excluded.message_count, \
             capture_cycles = capture_cycles + 1, \
             last_capture = excluded.last_capture",
        params![agent_id, source_id, message_count, now],
    )?;
    Ok(())
}
