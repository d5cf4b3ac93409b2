//! Persisted Registry: SQLite-backed, all mutations run inside
//! an explicit transaction so every operation is observable atomically.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, instrument};

use crate::error::Result;
use crate::model::{CapacityCounter, InstanceFilter, InstanceRecord, ScalingState};

pub struct Registry {
    conn: Mutex<Connection>,
}

impl Registry {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// An in-memory registry, useful for tests and short-lived scenarios
    /// where persistence across restart is not required.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Idempotently creates tables/indices and seeds `CapacityCounter` with
    /// `current_count = COUNT(instances)`, `max_count = maxInstances`.
    #[instrument(skip(self))]
    pub fn migrate(&self, max_instances: i64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                name                    TEXT PRIMARY KEY,
                created_at              TEXT NOT NULL,
                active_requests         INTEGER NOT NULL DEFAULT 0,
                current_cpu             REAL NOT NULL DEFAULT 0,
                current_memory          REAL NOT NULL DEFAULT 0,
                current_disk            REAL NOT NULL DEFAULT 0,
                healthy                 INTEGER NOT NULL DEFAULT 1,
                health_check_failures   INTEGER NOT NULL DEFAULT 0,
                last_heartbeat          TEXT NOT NULL,
                last_request_at         TEXT,
                last_health_check       TEXT,
                draining                INTEGER NOT NULL DEFAULT 0,
                draining_since          TEXT,
                threshold_crossed_at    TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_instances_selection
                ON instances (healthy, active_requests, last_heartbeat);

            CREATE TABLE IF NOT EXISTS capacity_counter (
                id            INTEGER PRIMARY KEY CHECK (id = 0),
                current_count INTEGER NOT NULL,
                max_count     INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS scaling_state (
                id             INTEGER PRIMARY KEY CHECK (id = 0),
                last_scale_up   TEXT,
                last_scale_down TEXT
            );
            "#,
        )?;

        let count: i64 = tx.query_row("SELECT COUNT(*) FROM instances", [], |r| r.get(0))?;

        tx.execute(
            r#"
            INSERT INTO capacity_counter (id, current_count, max_count) VALUES (0, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET max_count = ?2
            "#,
            params![count, max_instances],
        )?;

        tx.execute(
            "INSERT OR IGNORE INTO scaling_state (id, last_scale_up, last_scale_down) VALUES (0, NULL, NULL)",
            [],
        )?;

        tx.commit()?;
        debug!(max_instances, count, "registry migrated");
        Ok(())
    }

    /// Upsert. On conflict, adds `initial_req` to `active_requests`, refreshes
    /// heartbeats, and updates `healthy`. Returns `previousRequests`.
    pub fn record_instance(
        &self,
        name: &str,
        initial_req: i64,
        healthy: bool,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let previous: Option<i64> = conn
            .query_row(
                "SELECT active_requests FROM instances WHERE name = ?1",
                params![name],
                |r| r.get(0),
            )
            .optional()?;

        match previous {
            Some(prev) => {
                conn.execute(
                    r#"UPDATE instances SET active_requests = active_requests + ?2,
                       last_heartbeat = ?3, healthy = ?4 WHERE name = ?1"#,
                    params![name, initial_req, now.to_rfc3339(), healthy],
                )?;
                Ok(prev)
            }
            None => {
                let rec = InstanceRecord::new(name, initial_req, healthy, now);
                insert_record(&conn, &rec)?;
                Ok(0)
            }
        }
    }

    pub fn increment_requests(&self, name: &str, now: DateTime<Utc>, healthy: bool, amount: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let previous: i64 = conn.query_row(
            "SELECT active_requests FROM instances WHERE name = ?1",
            params![name],
            |r| r.get(0),
        )?;
        conn.execute(
            r#"UPDATE instances SET active_requests = active_requests + ?2,
               last_request_at = ?3, last_heartbeat = ?3, healthy = ?4 WHERE name = ?1"#,
            params![name, amount, now.to_rfc3339(), healthy],
        )?;
        Ok(previous)
    }

    /// Clamps at zero rather than going negative.
    pub fn decrement_requests(&self, name: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"UPDATE instances SET active_requests = MAX(0, active_requests - 1),
               last_request_at = ?2 WHERE name = ?1"#,
            params![name, now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Ordered by `active_requests ASC, last_heartbeat DESC`.
    pub fn get_instances(&self, filter: InstanceFilter) -> Result<Vec<InstanceRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from("SELECT * FROM instances WHERE 1=1");
        if let Some(healthy) = filter.healthy {
            sql.push_str(if healthy { " AND healthy = 1" } else { " AND healthy = 0" });
        }
        if filter.not_draining {
            sql.push_str(" AND draining = 0");
        }
        if filter.below_capacity.is_some() {
            sql.push_str(" AND active_requests < ?1");
        }
        sql.push_str(" ORDER BY active_requests ASC, last_heartbeat DESC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = if let Some(cap) = filter.below_capacity {
            stmt.query_map(params![cap], row_to_record)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        } else {
            stmt.query_map([], row_to_record)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        Ok(rows)
    }

    pub fn get_instance_count(&self, healthy_only: bool) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let sql = if healthy_only {
            "SELECT COUNT(*) FROM instances WHERE healthy = 1"
        } else {
            "SELECT COUNT(*) FROM instances"
        };
        Ok(conn.query_row(sql, [], |r| r.get(0))?)
    }

    pub fn get_instance_by_name(&self, name: &str) -> Result<Option<InstanceRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM instances WHERE name = ?1", params![name], row_to_record)
            .optional()
            .map_err(Into::into)
    }

    /// Atomic conditional update: `current_count < max_count ⇒ current_count += 1`.
    /// A conditional write, never read-then-write, so concurrent callers
    /// can't both observe spare capacity and both reserve it.
    pub fn try_reserve_slot(&self) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE capacity_counter SET current_count = current_count + 1 \
             WHERE id = 0 AND current_count < max_count",
            [],
        )?;
        Ok(changed > 0)
    }

    pub fn release_slot(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE capacity_counter SET current_count = MAX(0, current_count - 1) WHERE id = 0",
            [],
        )?;
        Ok(())
    }

    pub fn sync_capacity(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE capacity_counter SET current_count = (SELECT COUNT(*) FROM instances) WHERE id = 0",
            [],
        )?;
        Ok(())
    }

    pub fn get_capacity(&self) -> Result<CapacityCounter> {
        let conn = self.conn.lock().unwrap();
        let (current_count, max_count) = conn.query_row(
            "SELECT current_count, max_count FROM capacity_counter WHERE id = 0",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(CapacityCounter { current_count, max_count })
    }

    pub fn mark_threshold_crossed(&self, name: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE instances SET threshold_crossed_at = ?2 WHERE name = ?1",
            params![name, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn update_metrics(&self, name: &str, cpu: f32, memory: f32, disk: f32) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE instances SET current_cpu = ?2, current_memory = ?3, current_disk = ?4 WHERE name = ?1",
            params![name, cpu, memory, disk],
        )?;
        Ok(())
    }

    pub fn update_health(&self, name: &str, healthy: bool, failures: i64, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"UPDATE instances SET healthy = ?2, health_check_failures = ?3,
               last_health_check = ?4 WHERE name = ?1"#,
            params![name, healthy, failures, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn update_heartbeat(&self, name: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE instances SET last_heartbeat = ?2 WHERE name = ?1",
            params![name, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn mark_draining(&self, name: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE instances SET draining = 1, draining_since = ?2 WHERE name = ?1",
            params![name, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn remove_instance(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM instances WHERE name = ?1", params![name])?;
        Ok(())
    }

    pub fn record_scale_up(&self, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scaling_state SET last_scale_up = ?1 WHERE id = 0",
            params![now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn record_scale_down(&self, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scaling_state SET last_scale_down = ?1 WHERE id = 0",
            params![now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_scaling_state(&self) -> Result<ScalingState> {
        let conn = self.conn.lock().unwrap();
        let (up, down): (Option<String>, Option<String>) = conn.query_row(
            "SELECT last_scale_up, last_scale_down FROM scaling_state WHERE id = 0",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(ScalingState {
            last_scale_up: up.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
            last_scale_down: down.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)),
        })
    }
}

fn insert_record(conn: &Connection, rec: &InstanceRecord) -> Result<()> {
    conn.execute(
        r#"INSERT INTO instances (
            name, created_at, active_requests, current_cpu, current_memory, current_disk,
            healthy, health_check_failures, last_heartbeat, last_request_at, last_health_check,
            draining, draining_since, threshold_crossed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"#,
        params![
            rec.name,
            rec.created_at.to_rfc3339(),
            rec.active_requests,
            rec.current_cpu,
            rec.current_memory,
            rec.current_disk,
            rec.healthy,
            rec.health_check_failures,
            rec.last_heartbeat.to_rfc3339(),
            rec.last_request_at.map(|t| t.to_rfc3339()),
            rec.last_health_check.map(|t| t.to_rfc3339()),
            rec.draining,
            rec.draining_since.map(|t| t.to_rfc3339()),
            rec.threshold_crossed_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<InstanceRecord> {
    let parse = |s: Option<String>| s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc));
    let created_at: String = row.get("created_at")?;
    let last_heartbeat: String = row.get("last_heartbeat")?;
    Ok(InstanceRecord {
        name: row.get("name")?,
        created_at: DateTime::parse_from_rfc3339(&created_at).unwrap().with_timezone(&Utc),
        active_requests: row.get("active_requests")?,
        current_cpu: row.get("current_cpu")?,
        current_memory: row.get("current_memory")?,
        current_disk: row.get("current_disk")?,
        healthy: row.get("healthy")?,
        health_check_failures: row.get("health_check_failures")?,
        last_heartbeat: DateTime::parse_from_rfc3339(&last_heartbeat).unwrap().with_timezone(&Utc),
        last_request_at: parse(row.get("last_request_at")?),
        last_health_check: parse(row.get("last_health_check")?),
        draining: row.get("draining")?,
        draining_since: parse(row.get("draining_since")?),
        threshold_crossed_at: parse(row.get("threshold_crossed_at")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let reg = Registry::open_in_memory().unwrap();
        reg.migrate(10).unwrap();
        reg.migrate(10).unwrap();
        assert_eq!(reg.get_capacity().unwrap(), CapacityCounter { current_count: 0, max_count: 10 });
    }

    #[test]
    fn migrate_resyncs_max_count() {
        let reg = Registry::open_in_memory().unwrap();
        reg.migrate(10).unwrap();
        reg.migrate(20).unwrap();
        assert_eq!(reg.get_capacity().unwrap().max_count, 20);
    }

    #[test]
    fn reserve_and_release_slot_is_a_noop_on_the_counter() {
        let reg = Registry::open_in_memory().unwrap();
        reg.migrate(2).unwrap();
        assert!(reg.try_reserve_slot().unwrap());
        reg.release_slot().unwrap();
        assert_eq!(reg.get_capacity().unwrap().current_count, 0);
    }

    #[test]
    fn reserve_fails_at_max_count() {
        let reg = Registry::open_in_memory().unwrap();
        reg.migrate(1).unwrap();
        assert!(reg.try_reserve_slot().unwrap());
        assert!(!reg.try_reserve_slot().unwrap());
    }

    #[test]
    fn record_then_k_decrements_returns_to_pre_call_value() {
        let reg = Registry::open_in_memory().unwrap();
        reg.migrate(10).unwrap();
        let now = Utc::now();
        reg.record_instance("inst-1", 0, true, now).unwrap();
        reg.increment_requests("inst-1", now, true, 5).unwrap();
        for _ in 0..5 {
            reg.decrement_requests("inst-1", now).unwrap();
        }
        let rec = reg.get_instance_by_name("inst-1").unwrap().unwrap();
        assert_eq!(rec.active_requests, 0);
    }

    #[test]
    fn decrement_clamps_at_zero() {
        let reg = Registry::open_in_memory().unwrap();
        reg.migrate(10).unwrap();
        let now = Utc::now();
        reg.record_instance("inst-1", 0, true, now).unwrap();
        reg.decrement_requests("inst-1", now).unwrap();
        let rec = reg.get_instance_by_name("inst-1").unwrap().unwrap();
        assert_eq!(rec.active_requests, 0);
    }

    #[test]
    fn get_instances_orders_by_load_then_recency() {
        let reg = Registry::open_in_memory().unwrap();
        reg.migrate(10).unwrap();
        let now = Utc::now();
        reg.record_instance("busy", 5, true, now).unwrap();
        reg.record_instance("idle", 0, true, now).unwrap();
        let instances = reg.get_instances(InstanceFilter::healthy_not_draining()).unwrap();
        assert_eq!(instances[0].name, "idle");
    }
}
