//! Postgres-backed [`Store`](crate::Store) over sqlx.

use async_trait::async_trait;
use harvest_core::{ConfigMap, Frequency, Job, JobStatus, Schedule, Watermark, WatermarkKey};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::{
    dedupe_records, record_columns, validate_identifier, JobFilter, JobStore, RecordStore, ScheduleStore,
    StoreError, UpsertCounts, UpsertMode, UpsertTarget, WatermarkStore, WatermarkUpdate,
};

const JOB_COLUMNS: &str = "id, source, domain, status, config, created_at, started_at, completed_at, \
     records_processed, rows_inserted, rows_updated, records_failed, error_message, error_details, \
     attempt, retry_of, retried_by, retryable";

const SCHEDULE_COLUMNS: &str = "id, name, source, config, frequency, hour, day_of_week, day_of_month, \
     cron_expression, is_active, last_run_at, next_run_at, last_job_id, priority, created_at, updated_at";

const WATERMARK_COLUMNS: &str =
    "domain, source, region, last_collected_at, last_job_id, records_collected, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn quote_ident(ident: &str) -> String {
    ident
        .split('.')
        .map(|part| format!("\"{part}\""))
        .collect::<Vec<_>>()
        .join(".")
}

/// `INSERT ... SELECT FROM jsonb_populate_recordset(...) ON CONFLICT ...`
/// reporting per row whether it was inserted (`xmax = 0`) or updated.
/// Under `DO NOTHING` a conflicting row returns nothing and is not counted.
pub(crate) fn build_upsert_sql(
    target: &UpsertTarget<'_>,
    columns: &[String],
    update_columns: &[String],
) -> Result<String, StoreError> {
    validate_identifier(target.table)?;
    for column in columns
        .iter()
        .chain(update_columns)
        .map(String::as_str)
        .chain(target.unique_keys.iter().copied())
    {
        validate_identifier(column)?;
    }

    let table = quote_ident(target.table);
    let column_list = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    let conflict = target
        .unique_keys
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let action = if update_columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let sets = update_columns
            .iter()
            .map(|c| {
                let col = quote_ident(c);
                match target.mode {
                    UpsertMode::Overwrite => format!("{col} = EXCLUDED.{col}"),
                    UpsertMode::PreserveNonNull => format!("{col} = COALESCE(EXCLUDED.{col}, {table}.{col})"),
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("DO UPDATE SET {sets}")
    };

    Ok(format!(
        "INSERT INTO {table} ({column_list}) \
         SELECT {column_list} FROM jsonb_populate_recordset(NULL::{table}, $1::jsonb) \
         ON CONFLICT ({conflict}) {action} \
         RETURNING (xmax = 0) AS inserted"
    ))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn opt_u32(value: Option<i32>) -> Option<u32> {
    value.and_then(|v| u32::try_from(v).ok())
}

fn opt_i32(value: Option<u32>) -> Option<i32> {
    value.and_then(|v| i32::try_from(v).ok())
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let status: String = row.try_get("status")?;
    let config: Json<ConfigMap> = row.try_get("config")?;
    let error_details: Option<Json<ConfigMap>> = row.try_get("error_details")?;
    let attempt: i32 = row.try_get("attempt")?;
    Ok(Job {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        domain: row.try_get("domain")?,
        status: status.parse::<JobStatus>()?,
        config: config.0,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        records_processed: row.try_get::<i64, _>("records_processed")?.max(0) as u64,
        rows_inserted: row.try_get::<i64, _>("rows_inserted")?.max(0) as u64,
        rows_updated: row.try_get::<i64, _>("rows_updated")?.max(0) as u64,
        records_failed: row.try_get::<i64, _>("records_failed")?.max(0) as u64,
        error_message: row.try_get("error_message")?,
        error_details: error_details.map(|d| d.0),
        attempt: attempt.max(1) as u32,
        retry_of: row.try_get("retry_of")?,
        retried_by: row.try_get("retried_by")?,
        retryable: row.try_get("retryable")?,
    })
}

fn schedule_from_row(row: &PgRow) -> Result<Schedule, StoreError> {
    let config: Json<ConfigMap> = row.try_get("config")?;
    let frequency: String = row.try_get("frequency")?;
    Ok(Schedule {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        source: row.try_get("source")?,
        config: config.0,
        frequency: Frequency::from(frequency),
        hour: opt_u32(row.try_get("hour")?),
        day_of_week: opt_u32(row.try_get("day_of_week")?),
        day_of_month: opt_u32(row.try_get("day_of_month")?),
        cron_expression: row.try_get("cron_expression")?,
        is_active: row.try_get("is_active")?,
        last_run_at: row.try_get("last_run_at")?,
        next_run_at: row.try_get("next_run_at")?,
        last_job_id: row.try_get("last_job_id")?,
        priority: row.try_get("priority")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn watermark_from_row(row: &PgRow) -> Result<Watermark, StoreError> {
    Ok(Watermark {
        domain: row.try_get("domain")?,
        source: row.try_get("source")?,
        region: row.try_get("region")?,
        last_collected_at: row.try_get("last_collected_at")?,
        last_job_id: row.try_get("last_job_id")?,
        records_collected: row.try_get("records_collected")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl PgStore {
    /// Rows affected by a full job write, optionally guarded on the stored status.
    async fn write_job(&self, job: &Job, expected: Option<JobStatus>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_jobs
               SET status = $2,
                   started_at = $3,
                   completed_at = $4,
                   records_processed = $5,
                   rows_inserted = $6,
                   rows_updated = $7,
                   records_failed = $8,
                   error_message = $9,
                   error_details = $10,
                   retried_by = $11,
                   retryable = $12
             WHERE id = $1
               AND ($13::text IS NULL OR status = $13)
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(to_i64(job.records_processed))
        .bind(to_i64(job.rows_inserted))
        .bind(to_i64(job.rows_updated))
        .bind(to_i64(job.records_failed))
        .bind(&job.error_message)
        .bind(job.error_details.as_ref().map(Json))
        .bind(job.retried_by)
        .bind(job.retryable)
        .bind(expected.map(|s| s.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO ingestion_jobs ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
        ))
        .bind(job.id)
        .bind(&job.source)
        .bind(&job.domain)
        .bind(job.status.as_str())
        .bind(Json(&job.config))
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(to_i64(job.records_processed))
        .bind(to_i64(job.rows_inserted))
        .bind(to_i64(job.rows_updated))
        .bind(to_i64(job.records_failed))
        .bind(&job.error_message)
        .bind(job.error_details.as_ref().map(Json))
        .bind(i32::try_from(job.attempt).unwrap_or(i32::MAX))
        .bind(job.retry_of)
        .bind(job.retried_by)
        .bind(job.retryable)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        if self.write_job(job, None).await? == 0 {
            return Err(StoreError::NotFound {
                kind: "job",
                id: job.id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_job_if(&self, job: &Job, expected: JobStatus) -> Result<bool, StoreError> {
        if self.write_job(job, Some(expected)).await? > 0 {
            return Ok(true);
        }
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM ingestion_jobs WHERE id = $1)")
            .bind(job.id)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            return Err(StoreError::NotFound {
                kind: "job",
                id: job.id.to_string(),
            });
        }
        Ok(false)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM ingestion_jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM ingestion_jobs \
              WHERE ($1::text IS NULL OR status = $1) \
                AND ($2::text IS NULL OR source = $2) \
                AND ($4::boolean IS NULL OR retryable = $4) \
                AND (NOT $5::boolean OR retried_by IS NULL) \
                AND ($6::integer IS NULL OR attempt < $6) \
              ORDER BY created_at, id \
              LIMIT $3"
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(&filter.source)
        .bind(filter.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX)))
        .bind(filter.retryable)
        .bind(filter.unretried)
        .bind(opt_i32(filter.attempt_below))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }
}

#[async_trait]
impl ScheduleStore for PgStore {
    async fn insert_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO ingestion_schedules ({SCHEDULE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
        ))
        .bind(schedule.id)
        .bind(&schedule.name)
        .bind(&schedule.source)
        .bind(Json(&schedule.config))
        .bind(schedule.frequency.as_str())
        .bind(opt_i32(schedule.hour))
        .bind(opt_i32(schedule.day_of_week))
        .bind(opt_i32(schedule.day_of_month))
        .bind(&schedule.cron_expression)
        .bind(schedule.is_active)
        .bind(schedule.last_run_at)
        .bind(schedule.next_run_at)
        .bind(schedule.last_job_id)
        .bind(schedule.priority)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_schedules
               SET name = $2,
                   config = $3,
                   frequency = $4,
                   hour = $5,
                   day_of_week = $6,
                   day_of_month = $7,
                   cron_expression = $8,
                   is_active = $9,
                   last_run_at = $10,
                   next_run_at = $11,
                   last_job_id = $12,
                   priority = $13,
                   updated_at = $14
             WHERE id = $1
            "#,
        )
        .bind(schedule.id)
        .bind(&schedule.name)
        .bind(Json(&schedule.config))
        .bind(schedule.frequency.as_str())
        .bind(opt_i32(schedule.hour))
        .bind(opt_i32(schedule.day_of_week))
        .bind(opt_i32(schedule.day_of_month))
        .bind(&schedule.cron_expression)
        .bind(schedule.is_active)
        .bind(schedule.last_run_at)
        .bind(schedule.next_run_at)
        .bind(schedule.last_job_id)
        .bind(schedule.priority)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "schedule",
                id: schedule.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM ingestion_schedules WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn list_schedules(&self, active_only: bool) -> Result<Vec<Schedule>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM ingestion_schedules \
              WHERE (NOT $1 OR is_active) \
              ORDER BY created_at, id"
        ))
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM ingestion_schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl WatermarkStore for PgStore {
    async fn get_watermark(&self, key: &WatermarkKey) -> Result<Option<Watermark>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {WATERMARK_COLUMNS} FROM collection_watermarks \
              WHERE domain = $1 AND source = $2 AND region IS NOT DISTINCT FROM $3"
        ))
        .bind(&key.domain)
        .bind(&key.source)
        .bind(&key.region)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(watermark_from_row).transpose()
    }

    async fn upsert_watermark(&self, update: &WatermarkUpdate) -> Result<Watermark, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO collection_watermarks ({WATERMARK_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $4, $4) \
             ON CONFLICT (domain, source, (COALESCE(region, ''))) DO UPDATE \
                SET last_collected_at = EXCLUDED.last_collected_at, \
                    last_job_id = EXCLUDED.last_job_id, \
                    records_collected = EXCLUDED.records_collected, \
                    updated_at = EXCLUDED.updated_at \
             RETURNING {WATERMARK_COLUMNS}"
        ))
        .bind(&update.key.domain)
        .bind(&update.key.source)
        .bind(&update.key.region)
        .bind(update.collected_at)
        .bind(update.job_id)
        .bind(update.records_collected)
        .fetch_one(&self.pool)
        .await?;
        watermark_from_row(&row)
    }

    async fn clear_watermark(&self, key: &WatermarkKey) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM collection_watermarks \
              WHERE domain = $1 AND source = $2 AND region IS NOT DISTINCT FROM $3",
        )
        .bind(&key.domain)
        .bind(&key.source)
        .bind(&key.region)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_watermarks(&self) -> Result<Vec<Watermark>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {WATERMARK_COLUMNS} FROM collection_watermarks ORDER BY domain, source, region"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(watermark_from_row).collect()
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn upsert_records(
        &self,
        target: UpsertTarget<'_>,
        records: &[ConfigMap],
    ) -> Result<UpsertCounts, StoreError> {
        let records = dedupe_records(records, target.unique_keys)?;
        if records.is_empty() {
            return Ok(UpsertCounts::default());
        }
        let columns = record_columns(&records);
        let update_columns = target.update_columns(&records);
        let sql = build_upsert_sql(&target, &columns, &update_columns)?;

        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(&sql)
            .bind(Json(&records))
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut counts = UpsertCounts::default();
        for row in rows {
            if row.try_get::<bool, _>("inserted")? {
                counts.inserted += 1;
            } else {
                counts.updated += 1;
            }
        }
        debug!(table = target.table, inserted = counts.inserted, updated = counts.updated, "pg upsert");
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_sql_updates_from_excluded() {
        let keys = ["award_id"];
        let target = UpsertTarget {
            table: "grants",
            unique_keys: &keys,
            update_keys: None,
            mode: UpsertMode::Overwrite,
        };
        let columns = vec!["amount".to_string(), "award_id".to_string()];
        let sql = build_upsert_sql(&target, &columns, &["amount".to_string()]).unwrap();
        assert!(sql.contains("jsonb_populate_recordset(NULL::\"grants\", $1::jsonb)"));
        assert!(sql.contains("ON CONFLICT (\"award_id\") DO UPDATE SET \"amount\" = EXCLUDED.\"amount\""));
        assert!(sql.ends_with("RETURNING (xmax = 0) AS inserted"));
    }

    #[test]
    fn null_preserving_sql_coalesces_with_stored_value() {
        let keys = ["award_id"];
        let target = UpsertTarget {
            table: "public.grants",
            unique_keys: &keys,
            update_keys: None,
            mode: UpsertMode::PreserveNonNull,
        };
        let sql = build_upsert_sql(&target, &["title".to_string()], &["title".to_string()]).unwrap();
        assert!(sql.contains("\"title\" = COALESCE(EXCLUDED.\"title\", \"public\".\"grants\".\"title\")"));
    }

    #[test]
    fn no_update_columns_means_do_nothing() {
        let keys = ["award_id"];
        let target = UpsertTarget {
            table: "grants",
            unique_keys: &keys,
            update_keys: Some(&[]),
            mode: UpsertMode::Overwrite,
        };
        let sql = build_upsert_sql(&target, &["award_id".to_string()], &[]).unwrap();
        assert!(sql.contains("DO NOTHING"));
    }

    #[test]
    fn hostile_update_keys_are_rejected() {
        let keys = ["award_id"];
        let updates = ["amount\" = 0, \"award_id"];
        let target = UpsertTarget {
            table: "grants",
            unique_keys: &keys,
            update_keys: Some(&updates),
            mode: UpsertMode::Overwrite,
        };
        let update_columns = target.update_columns(&[]);
        let err = build_upsert_sql(&target, &["award_id".to_string()], &update_columns).unwrap_err();
        assert!(matches!(err, StoreError::InvalidIdentifier(c) if c.starts_with("amount")));
    }

    #[test]
    fn hostile_column_names_are_rejected() {
        let keys = ["award_id"];
        let target = UpsertTarget {
            table: "grants",
            unique_keys: &keys,
            update_keys: None,
            mode: UpsertMode::Overwrite,
        };
        let err = build_upsert_sql(&target, &["a\"; drop".to_string()], &[]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidIdentifier(_)));
    }
}
