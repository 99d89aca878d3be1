//! SQLite-backed [`Store`] implementation.
//!
//! All statements run on a dedicated worker thread that owns the
//! [`Connection`]. Async callers submit closures over a channel and await the
//! reply, so the Tokio runtime never blocks on disk I/O.

use std::convert::TryFrom;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::{SendTransition, Store, StoreError, STALE_CLAIM_ERROR};
use crate::types::{
    BookingRecord, BookingStatus, CampaignConfig, ClientInfo, FormData, PendingSend, SendStatus,
    Tenant, TrackingEventKind,
};

const CURRENT_SCHEMA_VERSION: i32 = 1;

const TENANT_COLUMNS: &str = "id, owner_id, name, domain, tracking_id, created_at";

const BOOKING_COLUMNS: &str = "id, tracking_id, session_id, client_id, event, form_data, url, \
     timestamp, user_agent, status, created_at, updated_at";

const SEND_COLUMNS: &str = "id, booking_id, owner_id, recipient, subject, body, client_name, \
     client_domain, form_data, due_at, attempts, status, last_error, claimed_at, created_at, \
     updated_at";

/// How long a statement waits on another connection's write lock before
/// failing with `SQLITE_BUSY`. Several dispatchers may share one file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A unit of work run against the connection on the store thread.
type Job = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum WorkerMessage {
    Run(Job),
    Stop,
}

/// The thread that owns the connection. Stopped and joined on drop, once
/// the last [`SqliteStore`] clone is gone.
struct StoreWorker {
    jobs: mpsc::Sender<WorkerMessage>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreWorker {
    fn drop(&mut self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };

        if self.jobs.send(WorkerMessage::Stop).is_err() {
            error!("Recovery store thread already gone at shutdown");
        }
        if let Err(panic) = handle.join() {
            error!("Recovery store thread panicked: {panic:?}");
        }
    }
}

/// A durable [`Store`] backed by a single SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    worker: Arc<StoreWorker>,
    path: Arc<PathBuf>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and applies pending
    /// migrations before returning.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the file cannot be opened, the
    /// store thread cannot start, or the schema is newer than this build.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| {
                StoreError::Unavailable(format!(
                    "cannot create directory for recovery database {}: {err}",
                    parent.display()
                ))
            })?;
        }

        let (jobs_tx, jobs_rx) = mpsc::channel::<WorkerMessage>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), StoreError>>();
        let db_path = path.clone();

        let handle = thread::Builder::new()
            .name("recovery-db".into())
            .spawn(move || {
                let mut conn = match open_connection(&db_path) {
                    Ok(conn) => {
                        let _ = ready_tx.send(Ok(()));
                        conn
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                while let Ok(message) = jobs_rx.recv() {
                    match message {
                        WorkerMessage::Run(job) => job(&mut conn),
                        WorkerMessage::Stop => break,
                    }
                }

                debug!("Recovery store thread stopped");
            })
            .map_err(|err| {
                StoreError::Unavailable(format!("cannot start recovery store thread: {err}"))
            })?;

        ready_rx.recv().map_err(|_| {
            StoreError::Unavailable("recovery store thread exited during startup".into())
        })??;

        info!(path = %path.display(), "SQLite store opened");

        Ok(Self {
            worker: Arc::new(StoreWorker {
                jobs: jobs_tx,
                handle: Mutex::new(Some(handle)),
            }),
            path: Arc::new(path),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Runs `task` on the store thread and returns its result.
    async fn execute<F, T>(&self, task: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let job: Job = Box::new(move |conn| {
            if reply_tx.send(task(conn)).is_err() {
                debug!("Store caller went away before the reply");
            }
        });

        self.worker
            .jobs
            .send(WorkerMessage::Run(job))
            .map_err(|_| StoreError::Unavailable("recovery store thread is not running".into()))?;

        reply_rx
            .await
            .map_err(|_| StoreError::Unavailable("recovery store thread dropped the reply".into()))?
    }
}

/// Opens the connection, configures it and brings the schema up to date.
fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let mut conn = Connection::open(path).map_err(|err| {
        StoreError::Unavailable(format!(
            "cannot open recovery database {}: {err}",
            path.display()
        ))
    })?;

    conn.busy_timeout(BUSY_TIMEOUT)?;

    // WAL lets the management API read while the dispatcher writes.
    if let Err(err) =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
    {
        warn!("Recovery database is not in WAL mode: {err}");
    }
    conn.pragma_update(None, "foreign_keys", "ON")?;

    run_migrations(&mut conn)?;
    Ok(conn)
}

// ============================================================================
// Migrations
// ============================================================================

fn run_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    let mut version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::Unavailable(format!(
            "database version ({version}) is newer than supported schema ({CURRENT_SCHEMA_VERSION})"
        )));
    }

    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    while version < CURRENT_SCHEMA_VERSION {
        let next_version = version + 1;
        apply_migration(&tx, next_version)?;
        version = next_version;
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
    tx.commit()?;

    info!(version = CURRENT_SCHEMA_VERSION, "Database schema migrated");
    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> Result<(), StoreError> {
    match version {
        1 => {
            tx.execute_batch(include_str!("schemas/schema_v1.sql"))?;
            Ok(())
        }
        other => Err(StoreError::Unavailable(format!(
            "no migration defined for version {other}"
        ))),
    }
}

// ============================================================================
// Column helpers
// ============================================================================

/// Fixed-width RFC 3339 so that text comparison matches time order.
fn fmt_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("invalid {field} '{value}': {err}")))
}

fn parse_optional_datetime(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.map(|raw| parse_datetime(&raw, field)).transpose()
}

fn parse_enum<T: std::str::FromStr<Err = String>>(value: &str) -> Result<T, StoreError> {
    value.parse().map_err(StoreError::Corrupt)
}

fn to_u32(value: i64, field: &str) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("{field} contains out-of-range value {value}")))
}

fn encode_form(form: &FormData) -> Result<String, StoreError> {
    serde_json::to_string(form)
        .map_err(|err| StoreError::Corrupt(format!("failed to encode form data: {err}")))
}

fn decode_form(raw: &str) -> Result<FormData, StoreError> {
    serde_json::from_str(raw)
        .map_err(|err| StoreError::Corrupt(format!("failed to decode form data: {err}")))
}

fn tenant_from_row(row: &Row<'_>) -> Result<Tenant, StoreError> {
    Ok(Tenant {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        domain: row.get(3)?,
        tracking_id: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?, "tenants.created_at")?,
    })
}

fn booking_from_row(row: &Row<'_>) -> Result<BookingRecord, StoreError> {
    Ok(BookingRecord {
        id: row.get(0)?,
        tracking_id: row.get(1)?,
        session_id: row.get(2)?,
        client_id: row.get(3)?,
        event: parse_enum::<TrackingEventKind>(&row.get::<_, String>(4)?)?,
        form_data: decode_form(&row.get::<_, String>(5)?)?,
        url: row.get(6)?,
        timestamp: parse_datetime(&row.get::<_, String>(7)?, "bookings.timestamp")?,
        user_agent: row.get(8)?,
        status: parse_enum::<BookingStatus>(&row.get::<_, String>(9)?)?,
        created_at: parse_datetime(&row.get::<_, String>(10)?, "bookings.created_at")?,
        updated_at: parse_datetime(&row.get::<_, String>(11)?, "bookings.updated_at")?,
    })
}

fn send_from_row(row: &Row<'_>) -> Result<PendingSend, StoreError> {
    Ok(PendingSend {
        id: row.get(0)?,
        booking_id: row.get(1)?,
        owner_id: row.get(2)?,
        recipient: row.get(3)?,
        subject: row.get(4)?,
        body: row.get(5)?,
        client: ClientInfo {
            name: row.get(6)?,
            domain: row.get(7)?,
        },
        form_data: decode_form(&row.get::<_, String>(8)?)?,
        due_at: parse_datetime(&row.get::<_, String>(9)?, "pending_sends.due_at")?,
        attempts: to_u32(row.get(10)?, "pending_sends.attempts")?,
        status: parse_enum::<SendStatus>(&row.get::<_, String>(11)?)?,
        last_error: row.get(12)?,
        claimed_at: parse_optional_datetime(row.get(13)?, "pending_sends.claimed_at")?,
        created_at: parse_datetime(&row.get::<_, String>(14)?, "pending_sends.created_at")?,
        updated_at: parse_datetime(&row.get::<_, String>(15)?, "pending_sends.updated_at")?,
    })
}

fn load_booking(conn: &Connection, id: &str) -> Result<Option<BookingRecord>, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = ?1"))?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => booking_from_row(row).map(Some),
        None => Ok(None),
    }
}

fn load_send(conn: &Connection, id: &str) -> Result<Option<PendingSend>, StoreError> {
    let mut stmt =
        conn.prepare(&format!("SELECT {SEND_COLUMNS} FROM pending_sends WHERE id = ?1"))?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => send_from_row(row).map(Some),
        None => Ok(None),
    }
}

fn load_sends(conn: &Connection, ids: &[String]) -> Result<Vec<PendingSend>, StoreError> {
    let mut sends = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(send) = load_send(conn, id)? {
            sends.push(send);
        }
    }
    Ok(sends)
}

fn insert_send(tx: &Transaction<'_>, send: &PendingSend) -> Result<(), StoreError> {
    tx.execute(
        &format!(
            "INSERT INTO pending_sends ({SEND_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        ),
        params![
            send.id,
            send.booking_id,
            send.owner_id,
            send.recipient,
            send.subject,
            send.body,
            send.client.name,
            send.client.domain,
            encode_form(&send.form_data)?,
            fmt_datetime(&send.due_at),
            i64::from(send.attempts),
            send.status.as_str(),
            send.last_error,
            send.claimed_at.as_ref().map(fmt_datetime),
            fmt_datetime(&send.created_at),
            fmt_datetime(&send.updated_at),
        ],
    )?;
    Ok(())
}

/// Maps unique-constraint violations to [`StoreError::Conflict`].
fn conflict_or(err: rusqlite::Error, what: &str) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Conflict(format!("{what} already exists"))
        }
        other => StoreError::Database(other),
    }
}

// ============================================================================
// Store implementation
// ============================================================================

#[async_trait]
impl Store for SqliteStore {
    async fn insert_tenant(&self, tenant: Tenant) -> Result<(), StoreError> {
        self.execute(move |conn| {
            conn.execute(
                &format!("INSERT INTO tenants ({TENANT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                params![
                    tenant.id,
                    tenant.owner_id,
                    tenant.name,
                    tenant.domain,
                    tenant.tracking_id,
                    fmt_datetime(&tenant.created_at),
                ],
            )
            .map_err(|err| conflict_or(err, &format!("tenant {}", tenant.tracking_id)))?;
            Ok(())
        })
        .await
    }

    async fn tenant_by_tracking_id(
        &self,
        tracking_id: &str,
    ) -> Result<Option<Tenant>, StoreError> {
        let tracking_id = tracking_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TENANT_COLUMNS} FROM tenants WHERE tracking_id = ?1"
            ))?;
            let mut rows = stmt.query(params![tracking_id])?;
            match rows.next()? {
                Some(row) => tenant_from_row(row).map(Some),
                None => Ok(None),
            }
        })
        .await
    }

    async fn tenants_for_owner(&self, owner_id: &str) -> Result<Vec<Tenant>, StoreError> {
        let owner_id = owner_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TENANT_COLUMNS} FROM tenants
                 WHERE owner_id = ?1
                 ORDER BY created_at, id"
            ))?;
            let mut rows = stmt.query(params![owner_id])?;
            let mut tenants = Vec::new();
            while let Some(row) = rows.next()? {
                tenants.push(tenant_from_row(row)?);
            }
            Ok(tenants)
        })
        .await
    }

    async fn record_booking(
        &self,
        booking: BookingRecord,
        send: Option<PendingSend>,
    ) -> Result<(), StoreError> {
        self.execute(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                &format!(
                    "INSERT INTO bookings ({BOOKING_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    booking.id,
                    booking.tracking_id,
                    booking.session_id,
                    booking.client_id,
                    booking.event.as_str(),
                    encode_form(&booking.form_data)?,
                    booking.url,
                    fmt_datetime(&booking.timestamp),
                    booking.user_agent,
                    booking.status.as_str(),
                    fmt_datetime(&booking.created_at),
                    fmt_datetime(&booking.updated_at),
                ],
            )
            .map_err(|err| conflict_or(err, &format!("booking {}", booking.id)))?;

            if let Some(send) = &send {
                insert_send(&tx, send)
                    .map_err(|err| match err {
                        StoreError::Database(inner) => {
                            conflict_or(inner, &format!("send {}", send.id))
                        }
                        other => other,
                    })?;
            }

            // Dropping `tx` on any error above rolls back the booking insert.
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_booking(&self, id: &str) -> Result<Option<BookingRecord>, StoreError> {
        let id = id.to_string();
        self.execute(move |conn| load_booking(conn, &id)).await
    }

    async fn set_booking_status(
        &self,
        id: &str,
        status: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<BookingRecord>, StoreError> {
        let id = id.to_string();
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE bookings SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), fmt_datetime(&now), id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            load_booking(conn, &id)
        })
        .await
    }

    async fn bookings_for_tracking_id(
        &self,
        tracking_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<BookingRecord>, StoreError> {
        let tracking_id = tracking_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BOOKING_COLUMNS} FROM bookings
                 WHERE tracking_id = ?1 AND created_at >= ?2
                 ORDER BY created_at DESC, id DESC"
            ))?;
            let mut rows = stmt.query(params![tracking_id, fmt_datetime(&since)])?;
            let mut bookings = Vec::new();
            while let Some(row) = rows.next()? {
                bookings.push(booking_from_row(row)?);
            }
            Ok(bookings)
        })
        .await
    }

    async fn campaign_for_owner(
        &self,
        owner_id: &str,
    ) -> Result<Option<CampaignConfig>, StoreError> {
        let owner_id = owner_id.to_string();
        self.execute(move |conn| {
            let row = conn
                .query_row(
                    "SELECT subject, body, delay_minutes, is_active FROM campaigns
                     WHERE owner_id = ?1",
                    params![owner_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, bool>(3)?,
                        ))
                    },
                )
                .optional()?;

            row.map(|(subject, body, delay, is_active)| {
                Ok(CampaignConfig {
                    subject,
                    body,
                    delay_minutes: to_u32(delay, "campaigns.delay_minutes")?,
                    is_active,
                })
            })
            .transpose()
        })
        .await
    }

    async fn put_campaign(
        &self,
        owner_id: &str,
        campaign: CampaignConfig,
    ) -> Result<(), StoreError> {
        let owner_id = owner_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO campaigns (owner_id, subject, body, delay_minutes, is_active, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(owner_id) DO UPDATE SET
                     subject = excluded.subject,
                     body = excluded.body,
                     delay_minutes = excluded.delay_minutes,
                     is_active = excluded.is_active,
                     updated_at = excluded.updated_at",
                params![
                    owner_id,
                    campaign.subject,
                    campaign.body,
                    i64::from(campaign.delay_minutes),
                    campaign.is_active,
                    fmt_datetime(&Utc::now()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_send(&self, id: &str) -> Result<Option<PendingSend>, StoreError> {
        let id = id.to_string();
        self.execute(move |conn| load_send(conn, &id)).await
    }

    async fn sends_for_booking(&self, booking_id: &str) -> Result<Vec<PendingSend>, StoreError> {
        let booking_id = booking_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SEND_COLUMNS} FROM pending_sends
                 WHERE booking_id = ?1
                 ORDER BY created_at, id"
            ))?;
            let mut rows = stmt.query(params![booking_id])?;
            let mut sends = Vec::new();
            while let Some(row) = rows.next()? {
                sends.push(send_from_row(row)?);
            }
            Ok(sends)
        })
        .await
    }

    async fn claim_due_sends(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingSend>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.execute(move |conn| {
            let now = fmt_datetime(&now);
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let ids: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM pending_sends
                     WHERE status = 'pending' AND due_at <= ?1
                     ORDER BY due_at, id
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![now, limit], |row| row.get::<_, String>(0))?;
                rows.collect::<Result<_, _>>()?
            };

            let mut claimed_ids = Vec::with_capacity(ids.len());
            for id in ids {
                let changed = tx.execute(
                    "UPDATE pending_sends
                     SET status = 'sending',
                         claimed_at = ?1,
                         attempts = attempts + 1,
                         updated_at = ?1
                     WHERE id = ?2 AND status = 'pending'",
                    params![now, id],
                )?;
                if changed == 1 {
                    claimed_ids.push(id);
                }
            }

            let claimed = load_sends(&tx, &claimed_ids)?;
            tx.commit()?;
            Ok(claimed)
        })
        .await
    }

    async fn transition_send(
        &self,
        id: &str,
        transition: SendTransition,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.execute(move |conn| {
            let sources = transition.allowed_sources();
            let from_a = sources[0].as_str();
            let from_b = sources.last().map_or(from_a, |s| s.as_str());
            let due_at = transition.due_at().map(|at| fmt_datetime(&at));

            let changed = conn.execute(
                "UPDATE pending_sends
                 SET status = ?1,
                     last_error = COALESCE(?2, last_error),
                     due_at = COALESCE(?3, due_at),
                     claimed_at = CASE WHEN ?3 IS NULL THEN claimed_at ELSE NULL END,
                     attempts = MAX(attempts - ?4, 0),
                     updated_at = ?5
                 WHERE id = ?6 AND status IN (?7, ?8)",
                params![
                    transition.target().as_str(),
                    transition.error(),
                    due_at,
                    i64::from(transition.refunds_attempt()),
                    fmt_datetime(&now),
                    id,
                    from_a,
                    from_b,
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn expire_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<PendingSend>, StoreError> {
        self.execute(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let ids: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM pending_sends
                     WHERE status = 'sending' AND claimed_at < ?1",
                )?;
                let rows = stmt.query_map(params![fmt_datetime(&claimed_before)], |row| {
                    row.get::<_, String>(0)
                })?;
                rows.collect::<Result<_, _>>()?
            };

            for id in &ids {
                tx.execute(
                    "UPDATE pending_sends
                     SET status = 'failed', last_error = ?1, updated_at = ?2
                     WHERE id = ?3 AND status = 'sending'",
                    params![STALE_CLAIM_ERROR, fmt_datetime(&now), id],
                )?;
            }

            let expired = load_sends(&tx, &ids)?;
            tx.commit()?;
            Ok(expired)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fmt_datetime_is_fixed_width_and_sortable() {
        let early = DateTime::parse_from_rfc3339("2024-01-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2024-01-01T10:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);

        let a = fmt_datetime(&early);
        let b = fmt_datetime(&late);
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_datetime(&b, "t").unwrap(), late);
    }

    #[tokio::test]
    async fn open_creates_parent_directories_and_migrates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("recovery.db");

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.path(), path.as_path());

        let version: i32 = store
            .execute(|conn| Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn reopening_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("recovery.db");

        let store = SqliteStore::open(&path).unwrap();
        store
            .insert_tenant(Tenant::new("owner", "Salon", "salon.test"))
            .await
            .unwrap();
        drop(store);

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.tenants_for_owner("owner").await.unwrap().len(), 1);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("future.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION + 1)
                .unwrap();
        }

        let err = SqliteStore::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn duplicate_tracking_id_is_a_conflict() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path().join("recovery.db")).unwrap();

        let tenant = Tenant::new("owner", "Salon", "salon.test");
        let mut clash = Tenant::new("other", "Spa", "spa.test");
        clash.tracking_id = tenant.tracking_id.clone();

        store.insert_tenant(tenant).await.unwrap();
        let err = store.insert_tenant(clash).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    /// Stores an abandoned booking with one pending send due at `due_at`.
    async fn seed_send(store: &SqliteStore, due_at: DateTime<Utc>) -> PendingSend {
        let now = due_at - chrono::Duration::hours(1);
        let booking_id = crate::types::generate_booking_id();
        let booking = BookingRecord {
            id: booking_id.clone(),
            tracking_id: "track_abc".to_string(),
            session_id: "session_1".to_string(),
            client_id: "client_1".to_string(),
            event: TrackingEventKind::Abandonment,
            form_data: FormData::new(),
            url: None,
            timestamp: now,
            user_agent: None,
            status: BookingStatus::Abandoned,
            created_at: now,
            updated_at: now,
        };
        let send = PendingSend {
            id: crate::types::generate_send_id(),
            booking_id,
            owner_id: "owner".to_string(),
            recipient: "ana@example.com".to_string(),
            subject: "Come back".to_string(),
            body: "Hi".to_string(),
            client: ClientInfo {
                name: "Salon".to_string(),
                domain: "salon.test".to_string(),
            },
            form_data: FormData::new(),
            due_at,
            attempts: 0,
            status: SendStatus::Pending,
            last_error: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        };
        store.record_booking(booking, Some(send.clone())).await.unwrap();
        send
    }

    fn open_temp() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path().join("recovery.db")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn transition_send_requires_an_allowed_source() {
        let (_dir, store) = open_temp();
        let due = Utc::now();
        let send = seed_send(&store, due).await;

        // Not claimed yet, so it cannot be marked sent.
        assert!(!store
            .transition_send(&send.id, SendTransition::Sent, due)
            .await
            .unwrap());

        let claimed = store.claim_due_sends(due, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, SendStatus::Sending);
        assert_eq!(claimed[0].attempts, 1);

        assert!(store
            .transition_send(&send.id, SendTransition::Sent, due)
            .await
            .unwrap());
        let stored = store.get_send(&send.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SendStatus::Sent);
        assert_eq!(stored.attempts, 1);

        // Terminal: a second outcome is refused.
        let failed = SendTransition::Failed {
            error: "late".to_string(),
        };
        assert!(!store.transition_send(&send.id, failed, due).await.unwrap());
        assert!(!store
            .transition_send("send_missing", SendTransition::Sent, due)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn retry_and_release_reschedule_the_claim() {
        let (_dir, store) = open_temp();
        let due = Utc::now();
        let send = seed_send(&store, due).await;
        store.claim_due_sends(due, 10).await.unwrap();

        let retry_at = due + chrono::Duration::seconds(30);
        let retry = SendTransition::Retry {
            due_at: retry_at,
            error: "503".to_string(),
        };
        assert!(store.transition_send(&send.id, retry, due).await.unwrap());

        let stored = store.get_send(&send.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SendStatus::Pending);
        assert_eq!(stored.due_at, retry_at);
        assert_eq!(stored.attempts, 1);
        assert!(stored.claimed_at.is_none());
        assert_eq!(stored.last_error.as_deref(), Some("503"));

        store.claim_due_sends(retry_at, 10).await.unwrap();
        let release_at = retry_at + chrono::Duration::seconds(30);
        let release = SendTransition::Released {
            due_at: release_at,
            reason: "store unavailable".to_string(),
        };
        assert!(store.transition_send(&send.id, release, retry_at).await.unwrap());

        let stored = store.get_send(&send.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SendStatus::Pending);
        assert_eq!(stored.due_at, release_at);
        assert_eq!(stored.attempts, 1, "released claim is not an attempt");
        assert!(stored.claimed_at.is_none());
    }

    #[tokio::test]
    async fn cancel_applies_to_pending_sends() {
        let (_dir, store) = open_temp();
        let due = Utc::now();
        let send = seed_send(&store, due).await;

        let cancel = SendTransition::Cancelled {
            reason: "campaign inactive".to_string(),
        };
        assert!(store.transition_send(&send.id, cancel, due).await.unwrap());
        assert!(store.claim_due_sends(due, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expire_stale_claims_only_touches_old_claims() {
        let (_dir, store) = open_temp();
        let due = Utc::now();
        let old = seed_send(&store, due).await;
        let fresh = seed_send(&store, due + chrono::Duration::minutes(20)).await;
        let idle = seed_send(&store, due + chrono::Duration::hours(5)).await;

        store.claim_due_sends(due, 10).await.unwrap();
        let later = due + chrono::Duration::minutes(20);
        store.claim_due_sends(later, 10).await.unwrap();

        let cutoff = due + chrono::Duration::minutes(10);
        let expired = store.expire_stale_claims(cutoff, later).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, old.id);
        assert_eq!(expired[0].status, SendStatus::Failed);
        assert_eq!(expired[0].last_error.as_deref(), Some(STALE_CLAIM_ERROR));

        let fresh = store.get_send(&fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, SendStatus::Sending);
        let idle = store.get_send(&idle.id).await.unwrap().unwrap();
        assert_eq!(idle.status, SendStatus::Pending);

        assert!(store
            .expire_stale_claims(cutoff, later)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn two_handles_on_one_file_never_share_a_claim() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("recovery.db");
        let a = SqliteStore::open(&path).unwrap();
        let b = SqliteStore::open(&path).unwrap();

        let due = Utc::now();
        for _ in 0..20 {
            seed_send(&a, due).await;
        }

        let (from_a, from_b) = tokio::join!(a.claim_due_sends(due, 50), b.claim_due_sends(due, 50));
        let mut ids: Vec<String> = from_a
            .unwrap()
            .into_iter()
            .chain(from_b.unwrap())
            .map(|send| send.id)
            .collect();
        assert_eq!(ids.len(), 20);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 20);
    }
}
