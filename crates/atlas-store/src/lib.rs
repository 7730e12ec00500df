//! Postgres persistence for the Atlas sync engine: canonical inventory
//! tables, the durable job ledger, schedules, notifications and the
//! write-once location cache.

use atlas_core::{
    AssetRecord, DeviceRecord, JobState, NetworkClientRecord, Notification, RecordError,
    Schedule, Source, SyncJob, Trigger, ERROR_DETAIL_CAP,
};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "atlas-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("encoding json column: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Result of one batched upsert: rows written plus the records the batch
/// could not persist.
#[derive(Debug, Default)]
pub struct UpsertOutcome {
    pub written: u64,
    pub failed: Vec<RecordError>,
}

/// Terminal accounting for one job, applied by [`Store::complete_job`].
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub state: JobState,
    pub records_processed: i64,
    pub records_failed: i64,
    pub error_message: Option<String>,
    pub error_details: Vec<RecordError>,
}

/// Truncates per-record detail to the ledger cap, keeping the earliest
/// failures.
pub fn cap_error_details(mut details: Vec<RecordError>) -> Vec<RecordError> {
    details.truncate(ERROR_DETAIL_CAP);
    details
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Pool that defers connecting until first use.
    pub fn connect_lazy(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // -- inventory upserts --------------------------------------------------

    /// Batched merge-by-serial upsert. A failing batch is retried one record
    /// at a time so a single bad row cannot sink its neighbours.
    pub async fn upsert_assets(&self, batch: &[AssetRecord]) -> Result<UpsertOutcome, StoreError> {
        if batch.is_empty() {
            return Ok(UpsertOutcome::default());
        }
        match asset_insert(batch).build().execute(&self.pool).await {
            Ok(_) => Ok(UpsertOutcome {
                written: batch.len() as u64,
                failed: Vec::new(),
            }),
            Err(batch_err) => {
                debug!(error = %batch_err, "asset batch failed, isolating offenders");
                let mut outcome = UpsertOutcome::default();
                for record in batch {
                    match asset_insert(std::slice::from_ref(record))
                        .build()
                        .execute(&self.pool)
                        .await
                    {
                        Ok(_) => outcome.written += 1,
                        Err(err) => outcome
                            .failed
                            .push(RecordError::new(&record.serial_number, err)),
                    }
                }
                Ok(outcome)
            }
        }
    }

    pub async fn upsert_devices(&self, batch: &[DeviceRecord]) -> Result<UpsertOutcome, StoreError> {
        if batch.is_empty() {
            return Ok(UpsertOutcome::default());
        }
        match device_insert(batch).build().execute(&self.pool).await {
            Ok(_) => Ok(UpsertOutcome {
                written: batch.len() as u64,
                failed: Vec::new(),
            }),
            Err(batch_err) => {
                debug!(error = %batch_err, "device batch failed, isolating offenders");
                let mut outcome = UpsertOutcome::default();
                for record in batch {
                    match device_insert(std::slice::from_ref(record))
                        .build()
                        .execute(&self.pool)
                        .await
                    {
                        Ok(_) => outcome.written += 1,
                        Err(err) => outcome
                            .failed
                            .push(RecordError::new(&record.serial_number, err)),
                    }
                }
                Ok(outcome)
            }
        }
    }

    pub async fn upsert_network_clients(
        &self,
        batch: &[NetworkClientRecord],
    ) -> Result<UpsertOutcome, StoreError> {
        if batch.is_empty() {
            return Ok(UpsertOutcome::default());
        }
        match client_insert(batch).build().execute(&self.pool).await {
            Ok(_) => Ok(UpsertOutcome {
                written: batch.len() as u64,
                failed: Vec::new(),
            }),
            Err(batch_err) => {
                debug!(error = %batch_err, "network client batch failed, isolating offenders");
                let mut outcome = UpsertOutcome::default();
                for record in batch {
                    match client_insert(std::slice::from_ref(record))
                        .build()
                        .execute(&self.pool)
                        .await
                    {
                        Ok(_) => outcome.written += 1,
                        Err(err) => outcome
                            .failed
                            .push(RecordError::new(&record.mac_address, err)),
                    }
                }
                Ok(outcome)
            }
        }
    }

    // -- inventory reads ----------------------------------------------------

    pub async fn asset_by_serial(&self, serial: &str) -> Result<Option<AssetRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM assets WHERE serial_number = $1")
            .bind(serial)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| asset_from_row(&r)).transpose()
    }

    pub async fn asset_by_tag(&self, tag: &str) -> Result<Option<AssetRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM assets WHERE asset_tag = $1 LIMIT 1")
            .bind(tag)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| asset_from_row(&r)).transpose()
    }

    pub async fn device_by_serial(&self, serial: &str) -> Result<Option<DeviceRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM devices WHERE serial_number = $1")
            .bind(serial)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| device_from_row(&r)).transpose()
    }

    pub async fn network_client_by_mac(
        &self,
        mac: &str,
    ) -> Result<Option<NetworkClientRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM network_clients WHERE mac_address = $1")
            .bind(mac)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| client_from_row(&r)).transpose()
    }

    // -- location cache -----------------------------------------------------

    pub async fn cached_location(&self, location_id: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT name FROM location_cache WHERE location_id = $1")
            .bind(location_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("name")))
    }

    /// Write-once: an existing entry is never overwritten.
    pub async fn put_location(&self, location_id: &str, name: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO location_cache (location_id, name) VALUES ($1, $2)
             ON CONFLICT (location_id) DO NOTHING",
        )
        .bind(location_id)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- job ledger ---------------------------------------------------------

    /// Atomically opens a ledger row if and only if no run for the source is
    /// in flight. `None` means another run holds the slot.
    pub async fn start_job(
        &self,
        source: Source,
        trigger: Trigger,
    ) -> Result<Option<SyncJob>, StoreError> {
        let row = sqlx::query(
            "INSERT INTO sync_jobs (source, state, triggered_by)
             SELECT $1, 'running', $2
             WHERE NOT EXISTS (
                 SELECT 1 FROM sync_jobs WHERE source = $1 AND state = 'running'
             )
             RETURNING *",
        )
        .bind(source.as_str())
        .bind(trigger.as_str())
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(row) => row.map(|r| job_from_row(&r)).transpose(),
            // A concurrent insert can still trip the partial unique index.
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                warn!(%source, "lost start race for running slot");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn is_running(&self, source: Source) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS (
                 SELECT 1 FROM sync_jobs WHERE source = $1 AND state = 'running'
             ) AS running",
        )
        .bind(source.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("running"))
    }

    pub async fn running_job(&self, source: Source) -> Result<Option<SyncJob>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM sync_jobs WHERE source = $1 AND state = 'running' LIMIT 1",
        )
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Applies a terminal state. Rows already terminal are left untouched, so
    /// a cancel and a natural completion cannot both win.
    pub async fn complete_job(&self, job_id: i64, outcome: &JobOutcome) -> Result<bool, StoreError> {
        let details = serde_json::to_value(cap_error_details(outcome.error_details.clone()))?;
        let result = sqlx::query(
            "UPDATE sync_jobs
             SET state = $2, completed_at = NOW(), records_processed = $3,
                 records_failed = $4, error_message = $5, error_details = $6
             WHERE id = $1 AND state = 'running'",
        )
        .bind(job_id)
        .bind(outcome.state.as_str())
        .bind(outcome.records_processed)
        .bind(outcome.records_failed)
        .bind(&outcome.error_message)
        .bind(details)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Durably requests cancellation of the running job for a source.
    /// Returns the job id, or `None` when nothing is running.
    pub async fn request_cancel(&self, source: Source) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query(
            "UPDATE sync_jobs SET cancel_requested = TRUE
             WHERE source = $1 AND state = 'running'
             RETURNING id",
        )
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("id")))
    }

    /// Polled by the job runner between batches.
    pub async fn cancel_requested(&self, job_id: i64) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT cancel_requested FROM sync_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("cancel_requested")).unwrap_or(false))
    }

    /// Best-effort terminal transition for a cancelled job. Idempotent: a row
    /// that already reached a terminal state is left as is.
    pub async fn mark_cancelled(
        &self,
        job_id: i64,
        records_processed: i64,
        records_failed: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sync_jobs
             SET state = 'cancelled', completed_at = NOW(),
                 records_processed = $2, records_failed = $3,
                 error_message = 'cancelled by user'
             WHERE id = $1 AND state = 'running'",
        )
        .bind(job_id)
        .bind(records_processed)
        .bind(records_failed)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn job(&self, job_id: i64) -> Result<Option<SyncJob>, StoreError> {
        let row = sqlx::query("SELECT * FROM sync_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    pub async fn job_history(&self, limit: i64) -> Result<Vec<SyncJob>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sync_jobs ORDER BY started_at DESC LIMIT $1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn last_terminal_job(&self, source: Source) -> Result<Option<SyncJob>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM sync_jobs
             WHERE source = $1 AND state <> 'running'
             ORDER BY completed_at DESC NULLS LAST
             LIMIT 1",
        )
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    pub async fn last_success(&self, source: Source) -> Result<Option<SyncJob>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM sync_jobs
             WHERE source = $1 AND state = 'success'
             ORDER BY completed_at DESC NULLS LAST
             LIMIT 1",
        )
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Jobs that went error or partial within the trailing window, for the
    /// scheduler's failure notifier.
    pub async fn recent_failures(&self, window_minutes: i64) -> Result<Vec<SyncJob>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM sync_jobs
             WHERE state IN ('error', 'partial')
               AND completed_at >= NOW() - ($1 * INTERVAL '1 minute')
             ORDER BY completed_at DESC",
        )
        .bind(window_minutes)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Mean wall-clock seconds of the most recent completed runs (success or
    /// partial), used for next-run estimates.
    pub async fn average_recent_duration(
        &self,
        source: Source,
        last_n: i64,
    ) -> Result<Option<f64>, StoreError> {
        let row = sqlx::query(
            "SELECT AVG(seconds)::double precision AS avg_seconds FROM (
                 SELECT EXTRACT(EPOCH FROM completed_at - started_at)::double precision AS seconds
                 FROM sync_jobs
                 WHERE source = $1 AND state IN ('success', 'partial')
                   AND completed_at IS NOT NULL
                 ORDER BY completed_at DESC
                 LIMIT $2
             ) recent",
        )
        .bind(source.as_str())
        .bind(last_n)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<Option<f64>, _>("avg_seconds")?)
    }

    // -- schedules ----------------------------------------------------------

    pub async fn schedule(&self, source: Source) -> Result<Schedule, StoreError> {
        let row = sqlx::query("SELECT * FROM sync_schedules WHERE source = $1")
            .bind(source.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => schedule_from_row(&row),
            None => Ok(Schedule::disabled(source)),
        }
    }

    pub async fn all_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sync_schedules")
            .fetch_all(&self.pool)
            .await?;
        let mut stored: Vec<Schedule> = rows
            .iter()
            .map(schedule_from_row)
            .collect::<Result<_, _>>()?;
        // Every source answers, configured or not.
        for source in Source::ALL {
            if !stored.iter().any(|s| s.source == source) {
                stored.push(Schedule::disabled(source));
            }
        }
        Ok(stored)
    }

    pub async fn upsert_schedule(
        &self,
        source: Source,
        enabled: bool,
        hours: &[u8],
        updated_by: Option<&str>,
    ) -> Result<Schedule, StoreError> {
        let hours_json = serde_json::to_value(hours)?;
        let row = sqlx::query(
            "INSERT INTO sync_schedules (source, enabled, hours, updated_at, updated_by)
             VALUES ($1, $2, $3, NOW(), $4)
             ON CONFLICT (source) DO UPDATE
             SET enabled = EXCLUDED.enabled, hours = EXCLUDED.hours,
                 updated_at = NOW(), updated_by = EXCLUDED.updated_by
             RETURNING *",
        )
        .bind(source.as_str())
        .bind(enabled)
        .bind(hours_json)
        .bind(updated_by)
        .fetch_one(&self.pool)
        .await?;
        schedule_from_row(&row)
    }

    // -- notifications ------------------------------------------------------

    pub async fn notification_exists_for_job(&self, job_id: i64) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM sync_notifications WHERE job_id = $1) AS found",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("found"))
    }

    pub async fn create_notification(&self, job_id: i64) -> Result<i64, StoreError> {
        let row = sqlx::query("INSERT INTO sync_notifications (job_id) VALUES ($1) RETURNING id")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("id"))
    }

    /// Unacknowledged notifications from the trailing window, joined to their
    /// ledger rows, newest first.
    pub async fn unacknowledged_notifications(
        &self,
        window_hours: i64,
    ) -> Result<Vec<(Notification, SyncJob)>, StoreError> {
        let rows = sqlx::query(
            "SELECT n.id AS notification_id, n.job_id, n.acknowledged,
                    n.created_at AS notification_created_at, j.*
             FROM sync_notifications n
             JOIN sync_jobs j ON j.id = n.job_id
             WHERE NOT n.acknowledged
               AND n.created_at >= NOW() - ($1 * INTERVAL '1 hour')
             ORDER BY n.created_at DESC",
        )
        .bind(window_hours)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let notification = Notification {
                id: row.get("notification_id"),
                job_id: row.get("job_id"),
                acknowledged: row.get("acknowledged"),
                created_at: row.get("notification_created_at"),
            };
            out.push((notification, job_from_row(row)?));
        }
        Ok(out)
    }

    /// Returns false when the notification does not exist.
    pub async fn acknowledge_notification(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE sync_notifications SET acknowledged = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn acknowledge_all_notifications(&self) -> Result<u64, StoreError> {
        let result =
            sqlx::query("UPDATE sync_notifications SET acknowledged = TRUE WHERE NOT acknowledged")
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

// -- query builders ---------------------------------------------------------

fn asset_insert(batch: &[AssetRecord]) -> QueryBuilder<'_, Postgres> {
    let mut qb = QueryBuilder::new(
        "INSERT INTO assets (serial_number, external_id, asset_tag, model, model_category, \
         status, mac_address, assigned_user_email, assigned_user_name, assigned_user_role, \
         assigned_user_grade, assigned_user_sis_id, owner_external_id, owner_location, \
         location, open_tickets, fee_balance, fee_past_due, raw, last_updated) ",
    );
    qb.push_values(batch, |mut b, rec| {
        b.push_bind(&rec.serial_number)
            .push_bind(&rec.external_id)
            .push_bind(&rec.asset_tag)
            .push_bind(&rec.model)
            .push_bind(&rec.model_category)
            .push_bind(&rec.status)
            .push_bind(&rec.mac_address)
            .push_bind(&rec.assigned_user_email)
            .push_bind(&rec.assigned_user_name)
            .push_bind(&rec.assigned_user_role)
            .push_bind(&rec.assigned_user_grade)
            .push_bind(&rec.assigned_user_sis_id)
            .push_bind(&rec.owner_external_id)
            .push_bind(&rec.owner_location)
            .push_bind(&rec.location)
            .push_bind(rec.open_tickets)
            .push_bind(rec.fee_balance)
            .push_bind(rec.fee_past_due)
            .push_bind(&rec.raw)
            .push_bind(rec.last_updated);
    });
    qb.push(
        " ON CONFLICT (serial_number) DO UPDATE SET \
         external_id = EXCLUDED.external_id, asset_tag = EXCLUDED.asset_tag, \
         model = EXCLUDED.model, model_category = EXCLUDED.model_category, \
         status = EXCLUDED.status, mac_address = EXCLUDED.mac_address, \
         assigned_user_email = EXCLUDED.assigned_user_email, \
         assigned_user_name = EXCLUDED.assigned_user_name, \
         assigned_user_role = EXCLUDED.assigned_user_role, \
         assigned_user_grade = EXCLUDED.assigned_user_grade, \
         assigned_user_sis_id = EXCLUDED.assigned_user_sis_id, \
         owner_external_id = EXCLUDED.owner_external_id, \
         owner_location = EXCLUDED.owner_location, location = EXCLUDED.location, \
         open_tickets = EXCLUDED.open_tickets, fee_balance = EXCLUDED.fee_balance, \
         fee_past_due = EXCLUDED.fee_past_due, raw = EXCLUDED.raw, \
         last_updated = EXCLUDED.last_updated",
    );
    qb
}

fn device_insert(batch: &[DeviceRecord]) -> QueryBuilder<'_, Postgres> {
    let mut qb = QueryBuilder::new(
        "INSERT INTO devices (serial_number, directory_id, org_unit, annotated_asset_tag, \
         annotated_user, annotated_location, model, status, os_version, \
         auto_update_expiration, boot_mode, battery_health_percent, mac_address, \
         ethernet_mac_address, recent_users, last_sync, raw, last_updated) ",
    );
    qb.push_values(batch, |mut b, rec| {
        b.push_bind(&rec.serial_number)
            .push_bind(&rec.directory_id)
            .push_bind(&rec.org_unit)
            .push_bind(&rec.annotated_asset_tag)
            .push_bind(&rec.annotated_user)
            .push_bind(&rec.annotated_location)
            .push_bind(&rec.model)
            .push_bind(&rec.status)
            .push_bind(&rec.os_version)
            .push_bind(&rec.auto_update_expiration)
            .push_bind(&rec.boot_mode)
            .push_bind(rec.battery_health_percent)
            .push_bind(&rec.mac_address)
            .push_bind(&rec.ethernet_mac_address)
            .push_bind(Value::from(rec.recent_users.clone()))
            .push_bind(rec.last_sync)
            .push_bind(&rec.raw)
            .push_bind(rec.last_updated);
    });
    qb.push(
        " ON CONFLICT (serial_number) DO UPDATE SET \
         directory_id = EXCLUDED.directory_id, org_unit = EXCLUDED.org_unit, \
         annotated_asset_tag = EXCLUDED.annotated_asset_tag, \
         annotated_user = EXCLUDED.annotated_user, \
         annotated_location = EXCLUDED.annotated_location, model = EXCLUDED.model, \
         status = EXCLUDED.status, os_version = EXCLUDED.os_version, \
         auto_update_expiration = EXCLUDED.auto_update_expiration, \
         boot_mode = EXCLUDED.boot_mode, \
         battery_health_percent = EXCLUDED.battery_health_percent, \
         mac_address = EXCLUDED.mac_address, \
         ethernet_mac_address = EXCLUDED.ethernet_mac_address, \
         recent_users = EXCLUDED.recent_users, last_sync = EXCLUDED.last_sync, \
         raw = EXCLUDED.raw, last_updated = EXCLUDED.last_updated",
    );
    qb
}

fn client_insert(batch: &[NetworkClientRecord]) -> QueryBuilder<'_, Postgres> {
    let mut qb = QueryBuilder::new(
        "INSERT INTO network_clients (mac_address, client_id, network_id, ap_name, \
         ip_address, ssid, vlan, last_seen, raw, last_updated) ",
    );
    qb.push_values(batch, |mut b, rec| {
        b.push_bind(&rec.mac_address)
            .push_bind(&rec.client_id)
            .push_bind(&rec.network_id)
            .push_bind(&rec.ap_name)
            .push_bind(&rec.ip_address)
            .push_bind(&rec.ssid)
            .push_bind(rec.vlan)
            .push_bind(rec.last_seen)
            .push_bind(&rec.raw)
            .push_bind(rec.last_updated);
    });
    qb.push(
        " ON CONFLICT (mac_address) DO UPDATE SET \
         client_id = EXCLUDED.client_id, network_id = EXCLUDED.network_id, \
         ap_name = EXCLUDED.ap_name, ip_address = EXCLUDED.ip_address, \
         ssid = EXCLUDED.ssid, vlan = EXCLUDED.vlan, last_seen = EXCLUDED.last_seen, \
         raw = EXCLUDED.raw, last_updated = EXCLUDED.last_updated",
    );
    qb
}

// -- row mapping ------------------------------------------------------------

fn parse_source(row: &PgRow) -> Result<Source, StoreError> {
    let source: String = row.try_get("source")?;
    source
        .parse()
        .map_err(|err: atlas_core::UnknownSource| StoreError::Corrupt(err.to_string()))
}

fn job_from_row(row: &PgRow) -> Result<SyncJob, StoreError> {
    let state: String = row.try_get("state")?;
    let state: JobState = state.parse().map_err(StoreError::Corrupt)?;
    let triggered_by: String = row.try_get("triggered_by")?;
    let triggered_by = match triggered_by.as_str() {
        "manual" => Trigger::Manual,
        "scheduled" => Trigger::Scheduled,
        "cron" => Trigger::Cron,
        other => return Err(StoreError::Corrupt(format!("unknown trigger '{other}'"))),
    };
    let details: Value = row.try_get("error_details")?;
    let error_details: Vec<RecordError> = serde_json::from_value(details)?;

    Ok(SyncJob {
        id: row.try_get("id")?,
        source: parse_source(row)?,
        state,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        records_processed: row.try_get("records_processed")?,
        records_failed: row.try_get("records_failed")?,
        error_message: row.try_get("error_message")?,
        error_details,
        triggered_by,
        cancel_requested: row.try_get("cancel_requested")?,
    })
}

fn schedule_from_row(row: &PgRow) -> Result<Schedule, StoreError> {
    let hours: Value = row.try_get("hours")?;
    let hours: Vec<u8> = serde_json::from_value(hours)?;
    Ok(Schedule {
        source: parse_source(row)?,
        enabled: row.try_get("enabled")?,
        hours,
        updated_at: row.try_get("updated_at")?,
        updated_by: row.try_get("updated_by")?,
    })
}

fn asset_from_row(row: &PgRow) -> Result<AssetRecord, StoreError> {
    Ok(AssetRecord {
        serial_number: row.try_get("serial_number")?,
        external_id: row.try_get("external_id")?,
        asset_tag: row.try_get("asset_tag")?,
        model: row.try_get("model")?,
        model_category: row.try_get("model_category")?,
        status: row.try_get("status")?,
        mac_address: row.try_get("mac_address")?,
        assigned_user_email: row.try_get("assigned_user_email")?,
        assigned_user_name: row.try_get("assigned_user_name")?,
        assigned_user_role: row.try_get("assigned_user_role")?,
        assigned_user_grade: row.try_get("assigned_user_grade")?,
        assigned_user_sis_id: row.try_get("assigned_user_sis_id")?,
        owner_external_id: row.try_get("owner_external_id")?,
        owner_location: row.try_get("owner_location")?,
        location: row.try_get("location")?,
        open_tickets: row.try_get("open_tickets")?,
        fee_balance: row.try_get("fee_balance")?,
        fee_past_due: row.try_get("fee_past_due")?,
        raw: row.try_get("raw")?,
        last_updated: row.try_get("last_updated")?,
    })
}

fn device_from_row(row: &PgRow) -> Result<DeviceRecord, StoreError> {
    let recent_users: Value = row.try_get("recent_users")?;
    let recent_users: Vec<String> = serde_json::from_value(recent_users)?;
    Ok(DeviceRecord {
        serial_number: row.try_get("serial_number")?,
        directory_id: row.try_get("directory_id")?,
        org_unit: row.try_get("org_unit")?,
        annotated_asset_tag: row.try_get("annotated_asset_tag")?,
        annotated_user: row.try_get("annotated_user")?,
        annotated_location: row.try_get("annotated_location")?,
        model: row.try_get("model")?,
        status: row.try_get("status")?,
        os_version: row.try_get("os_version")?,
        auto_update_expiration: row.try_get("auto_update_expiration")?,
        boot_mode: row.try_get("boot_mode")?,
        battery_health_percent: row.try_get("battery_health_percent")?,
        mac_address: row.try_get("mac_address")?,
        ethernet_mac_address: row.try_get("ethernet_mac_address")?,
        recent_users,
        last_sync: row.try_get("last_sync")?,
        raw: row.try_get("raw")?,
        last_updated: row.try_get("last_updated")?,
    })
}

fn client_from_row(row: &PgRow) -> Result<NetworkClientRecord, StoreError> {
    Ok(NetworkClientRecord {
        mac_address: row.try_get("mac_address")?,
        client_id: row.try_get("client_id")?,
        network_id: row.try_get("network_id")?,
        ap_name: row.try_get("ap_name")?,
        ip_address: row.try_get("ip_address")?,
        ssid: row.try_get("ssid")?,
        vlan: row.try_get("vlan")?,
        last_seen: row.try_get("last_seen")?,
        raw: row.try_get("raw")?,
        last_updated: row.try_get("last_updated")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn error_details_are_capped_keeping_earliest() {
        let details: Vec<RecordError> = (0..80)
            .map(|i| RecordError::new(format!("SN{i}"), "boom"))
            .collect();
        let capped = cap_error_details(details);
        assert_eq!(capped.len(), ERROR_DETAIL_CAP);
        assert_eq!(capped[0].identifier, "SN0");
        assert_eq!(capped.last().map(|e| e.identifier.as_str()), Some("SN49"));
    }

    #[test]
    fn asset_insert_sql_merges_on_serial() {
        let record = AssetRecord {
            serial_number: "SN1".into(),
            external_id: None,
            asset_tag: None,
            model: None,
            model_category: None,
            status: None,
            mac_address: None,
            assigned_user_email: None,
            assigned_user_name: None,
            assigned_user_role: None,
            assigned_user_grade: None,
            assigned_user_sis_id: None,
            owner_external_id: None,
            owner_location: None,
            location: None,
            open_tickets: 0,
            fee_balance: None,
            fee_past_due: None,
            raw: Value::Null,
            last_updated: Utc::now(),
        };
        let batch = vec![record.clone(), record];
        let sql = asset_insert(&batch).into_sql();
        assert!(sql.starts_with("INSERT INTO assets"));
        assert!(sql.contains("ON CONFLICT (serial_number) DO UPDATE"));
        assert!(sql.contains("last_updated = EXCLUDED.last_updated"));
        // Two rows of placeholders.
        assert!(sql.contains("($1, "));
        assert!(sql.contains("($21, "));
    }

    #[test]
    fn client_insert_sql_merges_on_mac() {
        let record = NetworkClientRecord {
            mac_address: "646ee0170fa7".into(),
            client_id: None,
            network_id: None,
            ap_name: None,
            ip_address: None,
            ssid: None,
            vlan: None,
            last_seen: None,
            raw: Value::Null,
            last_updated: Utc::now(),
        };
        let sql = client_insert(std::slice::from_ref(&record)).into_sql();
        assert!(sql.contains("ON CONFLICT (mac_address) DO UPDATE"));
    }
}
