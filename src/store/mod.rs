//! Instance persistence
//!
//! The `Store` is the single source of truth for instance records. Nothing
//! else in the agent keeps a competing in-memory cache of instance state —
//! every `InstanceManager` call re-reads from here, so a restarted agent
//! picks up exactly where the database says it left off.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{AgentError, Result};

/// Lifecycle status of a contract instance. Serializes to the lowercase
/// strings the wire protocol and `original_source/src/hp_manager.hpp`'s
/// `CONTAINER_STATES` both use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Created,
    Running,
    Stopped,
    Destroyed,
    Exited,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Created => "created",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Destroyed => "destroyed",
            InstanceStatus::Exited => "exited",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(InstanceStatus::Created),
            "running" => Ok(InstanceStatus::Running),
            "stopped" => Ok(InstanceStatus::Stopped),
            "destroyed" => Ok(InstanceStatus::Destroyed),
            "exited" => Ok(InstanceStatus::Exited),
            other => Err(AgentError::PersistenceFailure(format!(
                "unknown instance status in store: {other}"
            ))),
        }
    }
}

/// A persisted contract instance row.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub container_name: String,
    pub owner_pubkey: String,
    pub contract_id: String,
    pub pubkey: String,
    pub ip: String,
    pub image: String,
    pub username: String,
    pub user_id: u32,
    pub peer_port: u16,
    pub user_port: u16,
    pub status: InstanceStatus,
    /// Side-channel status the Supervisor clears on a successful restart,
    /// distinct from `status`. Grounded on `hp_manager.cpp`'s
    /// `hp_monitor_loop`, which updates a separate `current_status` column
    /// rather than reverting `status` when a drifted container comes back.
    pub current_status: Option<InstanceStatus>,
    pub created_at: i64,
}

/// SQLite-backed instance store, WAL-journaled as the teacher's own
/// `Database::open` configures its connection.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init_schema(&conn)?;

        info!("instance store opened at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                container_name  TEXT PRIMARY KEY,
                owner_pubkey    TEXT NOT NULL,
                contract_id     TEXT NOT NULL,
                pubkey          TEXT NOT NULL,
                ip              TEXT NOT NULL,
                image           TEXT NOT NULL,
                username        TEXT NOT NULL,
                user_id         INTEGER NOT NULL,
                peer_port       INTEGER NOT NULL,
                user_port       INTEGER NOT NULL,
                status          TEXT NOT NULL,
                current_status  TEXT,
                created_at      INTEGER NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_instances_container_name
                ON instances(container_name);

            CREATE INDEX IF NOT EXISTS idx_instances_owner_pubkey
                ON instances(owner_pubkey);
            "#,
        )?;
        Ok(())
    }

    pub async fn insert_instance(&self, record: &InstanceRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO instances
                (container_name, owner_pubkey, contract_id, pubkey, ip, image,
                 username, user_id, peer_port, user_port, status, current_status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                record.container_name,
                record.owner_pubkey,
                record.contract_id,
                record.pubkey,
                record.ip,
                record.image,
                record.username,
                record.user_id,
                record.peer_port,
                record.user_port,
                record.status.as_str(),
                record.current_status.map(|s| s.as_str()),
                record.created_at,
            ],
        )?;
        Ok(())
    }

    pub async fn get_instance(&self, container_name: &str) -> Result<Option<InstanceRecord>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM instances WHERE container_name = ?1",
            [container_name],
            row_to_record,
        )
        .optional()
        .map_err(AgentError::from)
    }

    pub async fn update_status(
        &self,
        container_name: &str,
        status: InstanceStatus,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE instances SET status = ?1 WHERE container_name = ?2",
            params![status.as_str(), container_name],
        )?;
        Ok(())
    }

    /// Clears the side-channel `current_status` field. Used by the
    /// Supervisor after successfully restarting a drifted container, and
    /// never changes the main `status` column.
    pub async fn clear_current_status(&self, container_name: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE instances SET current_status = NULL WHERE container_name = ?1",
            [container_name],
        )?;
        Ok(())
    }

    pub async fn set_current_status(
        &self,
        container_name: &str,
        status: InstanceStatus,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE instances SET current_status = ?1 WHERE container_name = ?2",
            params![status.as_str(), container_name],
        )?;
        Ok(())
    }

    pub async fn delete_instance(&self, container_name: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM instances WHERE container_name = ?1",
            [container_name],
        )?;
        Ok(())
    }

    /// Instances with status `running`, polled by the Supervisor.
    pub async fn running_instances(&self) -> Result<Vec<InstanceRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM instances WHERE status = 'running'")?;
        let rows = stmt
            .query_map([], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn list_instances(&self) -> Result<Vec<InstanceRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT * FROM instances WHERE status != 'destroyed'")?;
        let rows = stmt
            .query_map([], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Count of instances that currently occupy a capacity slot (everything
    /// except `destroyed`), used to enforce invariant 3's global cap.
    pub async fn allocated_count(&self) -> Result<u32> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM instances WHERE status != 'destroyed'",
            [],
            |r| r.get(0),
        )?;
        Ok(count as u32)
    }

    /// Highest assigned `(peer_port, user_port)` pair across all instances
    /// ever created, `(0, 0)` for a fresh database. Feeds the counter branch
    /// of `PortAllocator`.
    pub async fn max_ports(&self) -> Result<(u16, u16)> {
        let conn = self.conn.lock().await;
        let row: Option<(i64, i64)> = conn
            .query_row(
                "SELECT peer_port, user_port FROM instances ORDER BY peer_port DESC LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(p, u)| (p as u16, u as u16)).unwrap_or((0, 0)))
    }

    /// Port pairs belonging to `destroyed` instances whose `user_port` is
    /// not claimed by any non-destroyed row, in insertion order, used to
    /// seed `PortAllocator`'s vacant stack at startup. The `NOT EXISTS`
    /// guard matters because records are never deleted: once a reclaimed
    /// pair is handed to a new instance, the original destroyed row with
    /// that same pair still sits in the table.
    pub async fn vacant_ports(&self) -> Result<Vec<(u16, u16)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT d.peer_port, d.user_port FROM instances d
            WHERE d.status = 'destroyed'
              AND NOT EXISTS (
                  SELECT 1 FROM instances live
                  WHERE live.status != 'destroyed' AND live.user_port = d.user_port
              )
            ORDER BY d.created_at ASC
            "#,
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok((r.get::<_, i64>(0)? as u16, r.get::<_, i64>(1)? as u16))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn row_to_record(row: &Row) -> rusqlite::Result<InstanceRecord> {
    let status_str: String = row.get("status")?;
    let current_status_str: Option<String> = row.get("current_status")?;

    Ok(InstanceRecord {
        container_name: row.get("container_name")?,
        owner_pubkey: row.get("owner_pubkey")?,
        contract_id: row.get("contract_id")?,
        pubkey: row.get("pubkey")?,
        ip: row.get("ip")?,
        image: row.get("image")?,
        username: row.get("username")?,
        user_id: row.get::<_, i64>("user_id")? as u32,
        peer_port: row.get::<_, i64>("peer_port")? as u16,
        user_port: row.get::<_, i64>("user_port")? as u16,
        status: InstanceStatus::parse(&status_str)
            .map_err(|_| rusqlite::Error::InvalidColumnName("status".into()))?,
        current_status: current_status_str
            .map(|s| InstanceStatus::parse(&s))
            .transpose()
            .map_err(|_| rusqlite::Error::InvalidColumnName("current_status".into()))?,
        created_at: row.get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, peer: u16, user: u16, status: InstanceStatus) -> InstanceRecord {
        InstanceRecord {
            container_name: name.to_string(),
            owner_pubkey: format!("ed{name}"),
            contract_id: uuid::Uuid::new_v4().to_string(),
            pubkey: format!("pub-{name}"),
            ip: "127.0.0.1".to_string(),
            image: "evernode/sashimono:1".to_string(),
            username: name.to_string(),
            user_id: 2000,
            peer_port: peer,
            user_port: user,
            status,
            current_status: None,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let rec = sample("sashi01", 22861, 26201, InstanceStatus::Created);
        store.insert_instance(&rec).await.unwrap();

        let fetched = store.get_instance("sashi01").await.unwrap().unwrap();
        assert_eq!(fetched.peer_port, 22861);
        assert_eq!(fetched.status, InstanceStatus::Created);
        assert!(fetched.current_status.is_none());
    }

    #[tokio::test]
    async fn max_ports_defaults_to_zero_on_empty_db() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.max_ports().await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn vacant_ports_only_returns_destroyed_rows() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_instance(&sample("a", 22861, 26201, InstanceStatus::Destroyed))
            .await
            .unwrap();
        store
            .insert_instance(&sample("b", 22863, 26203, InstanceStatus::Running))
            .await
            .unwrap();

        let vacant = store.vacant_ports().await.unwrap();
        assert_eq!(vacant, vec![(22861, 26201)]);
    }

    #[tokio::test]
    async fn current_status_side_channel_is_independent_of_status() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_instance(&sample("a", 22861, 26201, InstanceStatus::Running))
            .await
            .unwrap();

        store
            .set_current_status("a", InstanceStatus::Exited)
            .await
            .unwrap();
        let rec = store.get_instance("a").await.unwrap().unwrap();
        assert_eq!(rec.status, InstanceStatus::Running);
        assert_eq!(rec.current_status, Some(InstanceStatus::Exited));

        store.clear_current_status("a").await.unwrap();
        let rec = store.get_instance("a").await.unwrap().unwrap();
        assert!(rec.current_status.is_none());
    }

    #[tokio::test]
    async fn allocated_count_excludes_destroyed() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_instance(&sample("a", 1, 2, InstanceStatus::Running))
            .await
            .unwrap();
        store
            .insert_instance(&sample("b", 3, 4, InstanceStatus::Destroyed))
            .await
            .unwrap();
        assert_eq!(store.allocated_count().await.unwrap(), 1);
    }

    /// Full create -> destroy -> create cycle: the second create must
    /// reclaim the first instance's port pair from the vacant stack
    /// instead of advancing the counter, matching §4.B.4.
    #[tokio::test]
    async fn destroyed_instance_ports_are_reclaimed_by_the_next_create() {
        let store = Store::open_in_memory().unwrap();
        let mut ports = crate::ports::PortAllocator::load(&store, 22861, 26201)
            .await
            .unwrap();

        let first = ports.allocate(&store).await.unwrap();
        store
            .insert_instance(&sample(
                "sashi01",
                first.peer_port,
                first.user_port,
                InstanceStatus::Running,
            ))
            .await
            .unwrap();

        store.update_status("sashi01", InstanceStatus::Destroyed).await.unwrap();
        ports.release(first);

        let reused = ports.allocate(&store).await.unwrap();
        assert_eq!(reused, first);

        store
            .insert_instance(&sample(
                "sashi02",
                reused.peer_port,
                reused.user_port,
                InstanceStatus::Running,
            ))
            .await
            .unwrap();
        assert_eq!(store.allocated_count().await.unwrap(), 1);
        assert_eq!(store.get_instance("sashi02").await.unwrap().unwrap().peer_port, first.peer_port);
    }

    /// `InstanceManager::create`'s capacity check compares `allocated_count`
    /// against `max_instance_count` before provisioning anything; this
    /// exercises the same boundary at the Store layer a destroyed instance
    /// frees a slot the cap had closed.
    #[tokio::test]
    async fn allocated_count_boundary_frees_up_after_destroy() {
        let store = Store::open_in_memory().unwrap();
        let max_instance_count: u32 = 2;

        store.insert_instance(&sample("a", 1, 2, InstanceStatus::Running)).await.unwrap();
        store.insert_instance(&sample("b", 3, 4, InstanceStatus::Running)).await.unwrap();
        assert_eq!(store.allocated_count().await.unwrap(), max_instance_count);

        store.update_status("a", InstanceStatus::Destroyed).await.unwrap();
        assert!(store.allocated_count().await.unwrap() < max_instance_count);

        store.insert_instance(&sample("c", 5, 6, InstanceStatus::Running)).await.unwrap();
        assert_eq!(store.allocated_count().await.unwrap(), max_instance_count);
    }
}
