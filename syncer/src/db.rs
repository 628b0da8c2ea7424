use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{
    Channel, Device, DeviceFilter, DeviceStatus, Reading, StatisticKind, StatisticsSnapshot,
};
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{error, info, warn};

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    id: String,
    name: String,
    slug: String,
    status: String,
    last_seen: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    local_updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<DeviceRow> for Device {
    type Error = Error;

    fn try_from(row: DeviceRow) -> Result<Self> {
        Ok(Device {
            status: row.status.parse()?,
            id: row.id,
            name: row.name,
            slug: row.slug,
            last_seen: row.last_seen,
            updated_at: row.updated_at,
            local_updated_at: row.local_updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StatisticRow {
    device_id: String,
    channel: String,
    kind: String,
    value: f64,
    sample_size: i64,
    computed_at: DateTime<Utc>,
}

impl TryFrom<StatisticRow> for StatisticsSnapshot {
    type Error = Error;

    fn try_from(row: StatisticRow) -> Result<Self> {
        Ok(StatisticsSnapshot {
            channel: row.channel.parse::<Channel>()?,
            kind: row.kind.parse::<StatisticKind>()?,
            device_id: row.device_id,
            value: row.value,
            sample_size: row.sample_size.max(0) as u64,
            computed_at: row.computed_at,
        })
    }
}

/// PostgreSQL backed [`Store`]
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn find_devices(&self, filter: &DeviceFilter) -> Result<Vec<Device>> {
        let rows = sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT id, name, slug, status, last_seen, updated_at, local_updated_at
            FROM devices
            WHERE ($1::text[] IS NULL OR id = ANY($1))
              AND ($2::text IS NULL OR status = $2)
            ORDER BY id
            "#,
        )
        .bind(filter.ids.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Device::try_from).collect()
    }

    async fn upsert_device(&self, device: &Device) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (id, name, slug, status, last_seen, updated_at, local_updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                slug = EXCLUDED.slug,
                last_seen = COALESCE(EXCLUDED.last_seen, devices.last_seen),
                updated_at = EXCLUDED.updated_at,
                local_updated_at = EXCLUDED.local_updated_at
            "#,
        )
        .bind(&device.id)
        .bind(&device.name)
        .bind(&device.slug)
        .bind(device.status.as_str())
        .bind(device.last_seen)
        .bind(device.updated_at)
        .bind(device.local_updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_device_status(&self, id: &str, status: DeviceStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE devices SET status = $2, local_updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Device {}", id)));
        }
        Ok(())
    }

    async fn transition_device_status(
        &self,
        id: &str,
        from: DeviceStatus,
        to: DeviceStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE devices SET status = $3, local_updated_at = now() WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM devices WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            return Err(Error::NotFound(format!("Device {}", id)));
        }
        Ok(false)
    }

    async fn count_readings(&self, device_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM readings WHERE device_id = $1")
            .bind(device_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn bulk_insert_readings(&self, readings: &[Reading]) -> Result<u64> {
        if readings.is_empty() {
            return Ok(0);
        }

        let mut attempts = 0;
        let max_attempts = 5;

        loop {
            attempts += 1;
            match insert_readings_inner(&self.pool, readings).await {
                Ok(inserted) => return Ok(inserted),
                Err(e) => match &e {
                    Error::Database(db_err) => {
                        DB_FAILURES_TOTAL.inc();
                        if attempts >= max_attempts || !is_transient_error(db_err) {
                            error!(
                                "Readings insert failed permanently after {} attempts: {}",
                                attempts, e
                            );
                            return Err(e);
                        }

                        let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                        warn!(
                            "Readings insert failed (attempt {}/{}), retrying in {}ms: {}",
                            attempts, max_attempts, wait_ms, db_err
                        );
                        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                    }
                    _ => {
                        error!("Readings insert failed with non-database error: {}", e);
                        return Err(e);
                    }
                },
            }
        }
    }

    async fn find_readings(&self, device_id: &str, limit: Option<usize>) -> Result<Vec<Reading>> {
        let readings = sqlx::query_as::<_, Reading>(
            r#"
            SELECT id, device_id, measured_at, ingested_at, battery, iso1, iso2, loop1, loop2, temp
            FROM readings
            WHERE device_id = $1
            ORDER BY measured_at DESC
            LIMIT $2
            "#,
        )
        .bind(device_id)
        .bind(limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await?;

        Ok(readings)
    }

    async fn upsert_statistics(&self, snapshot: &StatisticsSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO statistics (device_id, channel, kind, value, sample_size, computed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (device_id, channel, kind) DO UPDATE SET
                value = EXCLUDED.value,
                sample_size = EXCLUDED.sample_size,
                computed_at = EXCLUDED.computed_at
            "#,
        )
        .bind(&snapshot.device_id)
        .bind(snapshot.channel.as_str())
        .bind(snapshot.kind.as_str())
        .bind(snapshot.value)
        .bind(snapshot.sample_size as i64)
        .bind(snapshot.computed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            DB_FAILURES_TOTAL.inc();
            Error::Database(e)
        })?;

        Ok(())
    }

    async fn find_statistics(&self, device_id: &str) -> Result<Vec<StatisticsSnapshot>> {
        let rows = sqlx::query_as::<_, StatisticRow>(
            r#"
            SELECT device_id, channel, kind, value, sample_size, computed_at
            FROM statistics
            WHERE device_id = $1
            ORDER BY channel, kind
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StatisticsSnapshot::try_from).collect()
    }

    async fn prune_statistics(&self, device_id: &str, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM statistics WHERE device_id = $1 AND computed_at < $2")
            .bind(device_id)
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                DB_FAILURES_TOTAL.inc();
                Error::Database(e)
            })?;
        Ok(result.rows_affected())
    }
}

async fn insert_readings_inner(pool: &PgPool, batch: &[Reading]) -> Result<u64> {
    let ids: Vec<&str> = batch.iter().map(|r| r.id.as_str()).collect();
    let device_ids: Vec<&str> = batch.iter().map(|r| r.device_id.as_str()).collect();
    let measured: Vec<DateTime<Utc>> = batch.iter().map(|r| r.measured_at).collect();
    let ingested: Vec<DateTime<Utc>> = batch.iter().map(|r| r.ingested_at).collect();
    let batteries: Vec<Option<f64>> = batch.iter().map(|r| r.battery).collect();
    let iso1: Vec<Option<f64>> = batch.iter().map(|r| r.iso1).collect();
    let iso2: Vec<Option<f64>> = batch.iter().map(|r| r.iso2).collect();
    let loop1: Vec<Option<f64>> = batch.iter().map(|r| r.loop1).collect();
    let loop2: Vec<Option<f64>> = batch.iter().map(|r| r.loop2).collect();
    let temps: Vec<Option<f64>> = batch.iter().map(|r| r.temp).collect();

    let query = r#"
        INSERT INTO readings (id, device_id, measured_at, ingested_at, battery, iso1, iso2, loop1, loop2, temp)
        SELECT * FROM UNNEST(
            $1::text[], $2::text[], $3::timestamptz[], $4::timestamptz[],
            $5::float8[], $6::float8[], $7::float8[], $8::float8[], $9::float8[], $10::float8[]
        )
        ON CONFLICT DO NOTHING
        "#;

    let result = sqlx::query(query)
        .bind(&ids)
        .bind(&device_ids)
        .bind(&measured)
        .bind(&ingested)
        .bind(&batteries)
        .bind(&iso1)
        .bind(&iso2)
        .bind(&loop1)
        .bind(&loop2)
        .bind(&temps)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

pub(crate) fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(is_transient_error(&sqlx::Error::PoolTimedOut));
        assert!(is_transient_error(&sqlx::Error::PoolClosed));
        assert!(!is_transient_error(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn test_device_row_conversion() {
        let row = DeviceRow {
            id: "dev-1".to_string(),
            name: "Tank".to_string(),
            slug: "tank".to_string(),
            status: "inactive".to_string(),
            last_seen: None,
            updated_at: Utc::now(),
            local_updated_at: None,
        };
        let device = Device::try_from(row).unwrap();
        assert_eq!(device.status, DeviceStatus::Inactive);

        let bad = DeviceRow {
            id: "dev-2".to_string(),
            name: "Tank".to_string(),
            slug: "tank".to_string(),
            status: "OK".to_string(),
            last_seen: None,
            updated_at: Utc::now(),
            local_updated_at: None,
        };
        assert!(Device::try_from(bad).is_err());
    }

    #[test]
    fn test_statistic_row_conversion() {
        let row = StatisticRow {
            device_id: "dev-1".to_string(),
            channel: "loop1".to_string(),
            kind: "std_dev".to_string(),
            value: 2.5,
            sample_size: 12,
            computed_at: Utc::now(),
        };
        let snapshot = StatisticsSnapshot::try_from(row).unwrap();
        assert_eq!(snapshot.channel, Channel::Loop1);
        assert_eq!(snapshot.kind, StatisticKind::StdDev);
        assert_eq!(snapshot.sample_size, 12);
    }
}
