use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use ticket_map_citation_models::{CitationRecord, Subscription};

use crate::{BulkUpsertOutcome, CitationStore, StoreError};

/// Embedded SQLite store. The crawler runs a single worker, so a plain
/// mutex around the connection is enough to satisfy the single-writer
/// requirement.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS citations (
    citation_number INTEGER PRIMARY KEY,
    location TEXT,
    plate_state TEXT,
    plate_number TEXT,
    vin TEXT,
    issue_date TEXT,
    due_date TEXT,
    status TEXT,
    amount_due REAL,
    more_info_url TEXT,
    issuing_agency TEXT,
    comments TEXT,
    violations TEXT,
    image_urls TEXT,
    officer_badge TEXT,
    officer_name TEXT,
    officer_beat TEXT,
    latitude REAL,
    longitude REAL,
    geocoded_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_citations_location ON citations(location);

CREATE TABLE IF NOT EXISTS subscriptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    plate_state TEXT,
    plate_number TEXT,
    target TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS scrape_attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    citation_number INTEGER NOT NULL,
    attempted_at TEXT NOT NULL,
    success INTEGER NOT NULL,
    error TEXT
);
";

const UPSERT_SQL: &str = "
INSERT INTO citations (
    citation_number, location, plate_state, plate_number, vin,
    issue_date, due_date, status, amount_due, more_info_url,
    issuing_agency, comments, violations, image_urls,
    officer_badge, officer_name, officer_beat,
    latitude, longitude, geocoded_at
) VALUES (
    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
    ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20
)
ON CONFLICT(citation_number) DO UPDATE SET
    location = COALESCE(excluded.location, location),
    plate_state = COALESCE(excluded.plate_state, plate_state),
    plate_number = COALESCE(excluded.plate_number, plate_number),
    vin = COALESCE(excluded.vin, vin),
    issue_date = COALESCE(excluded.issue_date, issue_date),
    due_date = COALESCE(excluded.due_date, due_date),
    status = COALESCE(excluded.status, status),
    amount_due = COALESCE(excluded.amount_due, amount_due),
    more_info_url = COALESCE(excluded.more_info_url, more_info_url),
    issuing_agency = COALESCE(excluded.issuing_agency, issuing_agency),
    comments = COALESCE(excluded.comments, comments),
    violations = COALESCE(excluded.violations, violations),
    image_urls = COALESCE(excluded.image_urls, image_urls),
    officer_badge = COALESCE(excluded.officer_badge, officer_badge),
    officer_name = COALESCE(excluded.officer_name, officer_name),
    officer_beat = COALESCE(excluded.officer_beat, officer_beat),
    latitude = COALESCE(excluded.latitude, latitude),
    longitude = COALESCE(excluded.longitude, longitude),
    geocoded_at = COALESCE(excluded.geocoded_at, geocoded_at)
";

impl SqliteStore {
    /// # Errors
    ///
    /// * If the database file cannot be opened or the schema cannot be applied
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// # Errors
    ///
    /// * If the schema cannot be applied
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn db_id(id: u64) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| StoreError::IdOutOfRange(id))
}

fn db_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn timestamp(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|x| x.to_rfc3339())
}

fn list_json(values: &[String]) -> Result<Option<String>, StoreError> {
    if values.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(values)?))
    }
}

fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .as_deref()
        .and_then(|x| DateTime::parse_from_rfc3339(x).ok())
        .map(|x| x.with_timezone(&Utc))
}

fn parse_list(value: Option<String>) -> Vec<String> {
    value
        .as_deref()
        .and_then(|x| serde_json::from_str(x).ok())
        .unwrap_or_default()
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<CitationRecord> {
    let citation_number: i64 = row.get("citation_number")?;
    Ok(CitationRecord {
        citation_number: citation_number.unsigned_abs(),
        location: row.get("location")?,
        plate_state: row.get("plate_state")?,
        plate_number: row.get("plate_number")?,
        vin: row.get("vin")?,
        issue_date: parse_timestamp(row.get("issue_date")?),
        due_date: parse_timestamp(row.get("due_date")?),
        status: row.get("status")?,
        amount_due: row.get("amount_due")?,
        more_info_url: row.get("more_info_url")?,
        issuing_agency: row.get("issuing_agency")?,
        comments: row.get("comments")?,
        violations: parse_list(row.get("violations")?),
        image_urls: parse_list(row.get("image_urls")?),
        officer_badge: row.get("officer_badge")?,
        officer_name: row.get("officer_name")?,
        officer_beat: row.get("officer_beat")?,
        latitude: row.get("latitude")?,
        longitude: row.get("longitude")?,
        geocoded_at: parse_timestamp(row.get("geocoded_at")?),
    })
}

fn execute_upsert(conn: &Connection, record: &CitationRecord) -> Result<(), StoreError> {
    // Coordinates only persist as a pair so a half-written point can never
    // coalesce into an existing row.
    let (latitude, longitude) = match (record.latitude, record.longitude) {
        (Some(lat), Some(lon)) => (Some(lat), Some(lon)),
        _ => (None, None),
    };
    conn.execute(
        UPSERT_SQL,
        params![
            db_id(record.citation_number)?,
            record.location,
            record.plate_state,
            record.plate_number,
            record.vin,
            timestamp(record.issue_date),
            timestamp(record.due_date),
            record.status,
            record.amount_due,
            record.more_info_url,
            record.issuing_agency,
            record.comments,
            list_json(&record.violations)?,
            list_json(&record.image_urls)?,
            record.officer_badge,
            record.officer_name,
            record.officer_beat,
            latitude,
            longitude,
            timestamp(record.geocoded_at),
        ],
    )?;
    Ok(())
}

#[async_trait]
impl CitationStore for SqliteStore {
    async fn upsert_citation(&self, record: &CitationRecord) -> Result<(), StoreError> {
        execute_upsert(&self.lock(), record)
    }

    async fn bulk_upsert_citations(
        &self,
        records: &[CitationRecord],
    ) -> Result<BulkUpsertOutcome, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut outcome = BulkUpsertOutcome::default();
        for record in records {
            match execute_upsert(&tx, record) {
                Ok(()) => outcome.success_count += 1,
                Err(e) => {
                    log::warn!(
                        "bulk upsert failed for citation {}: {e:?}",
                        record.citation_number
                    );
                    outcome.failed_count += 1;
                    outcome.errors.push((record.citation_number, e.to_string()));
                }
            }
        }
        tx.commit()?;
        Ok(outcome)
    }

    async fn existing_ids_in_range(
        &self,
        min: u64,
        max: u64,
    ) -> Result<BTreeSet<u64>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT citation_number FROM citations
             WHERE citation_number BETWEEN ?1 AND ?2",
        )?;
        let ids = stmt
            .query_map(params![db_id(min)?, db_id(max)?], |row| {
                row.get::<_, i64>(0)
            })?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids.into_iter().map(i64::unsigned_abs).collect())
    }

    async fn max_id_in_range(&self, min: u64, max: u64) -> Result<Option<u64>, StoreError> {
        let conn = self.lock();
        let result: Option<i64> = conn.query_row(
            "SELECT MAX(citation_number) FROM citations
             WHERE citation_number BETWEEN ?1 AND ?2",
            params![db_id(min)?, db_id(max)?],
            |row| row.get(0),
        )?;
        Ok(result.map(i64::unsigned_abs))
    }

    async fn cached_coordinates_for_location(
        &self,
        location: &str,
    ) -> Result<Option<(f64, f64)>, StoreError> {
        let conn = self.lock();
        let result = conn
            .query_row(
                "SELECT latitude, longitude FROM citations
                 WHERE location = ?1
                   AND latitude IS NOT NULL
                   AND longitude IS NOT NULL
                 ORDER BY geocoded_at
                 LIMIT 1",
                params![location],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(result)
    }

    async fn update_coordinates(
        &self,
        citation_number: u64,
        latitude: f64,
        longitude: f64,
    ) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE citations
             SET latitude = ?2, longitude = ?3, geocoded_at = ?4
             WHERE citation_number = ?1",
            params![
                db_id(citation_number)?,
                latitude,
                longitude,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn ungeocoded_locations(
        &self,
        limit: usize,
    ) -> Result<Vec<(u64, String)>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT citation_number, location FROM citations
             WHERE location IS NOT NULL AND latitude IS NULL
             ORDER BY citation_number
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![db_limit(limit)], |row| {
                Ok((row.get::<_, i64>(0)?.unsigned_abs(), row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn citations_missing_officer_info(
        &self,
        limit: usize,
    ) -> Result<Vec<CitationRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM citations
             WHERE image_urls IS NOT NULL
               AND officer_badge IS NULL
               AND officer_name IS NULL
             ORDER BY citation_number
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![db_limit(limit)], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn active_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, plate_state, plate_number, target FROM subscriptions
             WHERE active = 1",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        drop(conn);

        let mut subscriptions = Vec::with_capacity(rows.len());
        for (id, plate_state, plate_number, target) in rows {
            subscriptions.push(Subscription {
                id,
                plate_state,
                plate_number,
                target: serde_json::from_str(&target)?,
            });
        }
        Ok(subscriptions)
    }

    async fn log_scrape_attempt(
        &self,
        citation_number: u64,
        success: bool,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO scrape_attempts (citation_number, attempted_at, success, error)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                db_id(citation_number)?,
                Utc::now().to_rfc3339(),
                success,
                error,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone as _, Utc};
    use ticket_map_citation_models::{CitationRecord, NotifyTarget};

    use super::SqliteStore;
    use crate::CitationStore as _;

    fn record(id: u64) -> CitationRecord {
        let mut record = CitationRecord::new(id);
        record.location = Some("200 E Washington St".into());
        record.plate_state = Some("MI".into());
        record.plate_number = Some("ABC1234".into());
        record.amount_due = Some(25.0);
        record.issue_date = Some(Utc.with_ymd_and_hms(2024, 7, 9, 18, 12, 0).unwrap());
        record
    }

    #[tokio::test]
    async fn upsert_then_rescan_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_citation(&record(1_123_100)).await.unwrap();
        store.upsert_citation(&record(1_123_100)).await.unwrap();

        let ids = store
            .existing_ids_in_range(1_123_000, 1_123_200)
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert!(ids.contains(&1_123_100));
    }

    #[tokio::test]
    async fn sparse_rescan_does_not_erase_enrichment() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut enriched = record(42);
        enriched.officer_badge = Some("1217".into());
        enriched.violations = vec!["EXPIRED METER".into()];
        store.upsert_citation(&enriched).await.unwrap();

        let mut sparse = CitationRecord::new(42);
        sparse.status = Some("Paid".into());
        store.upsert_citation(&sparse).await.unwrap();

        let rows = store.citations_missing_officer_info(10).await.unwrap();
        assert!(rows.is_empty(), "officer fields must survive a sparse rescan");
    }

    #[tokio::test]
    async fn range_queries_are_inclusive() {
        let store = SqliteStore::open_in_memory().unwrap();
        for id in [100, 150, 200] {
            store.upsert_citation(&record(id)).await.unwrap();
        }

        let ids = store.existing_ids_in_range(100, 200).await.unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(store.max_id_in_range(100, 200).await.unwrap(), Some(200));
        assert_eq!(store.max_id_in_range(201, 300).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cached_coordinates_require_exact_location_match() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_citation(&record(7)).await.unwrap();
        store.update_coordinates(7, 42.2808, -83.7430).await.unwrap();

        let hit = store
            .cached_coordinates_for_location("200 E Washington St")
            .await
            .unwrap();
        assert_eq!(hit, Some((42.2808, -83.7430)));

        let miss = store
            .cached_coordinates_for_location("200 E WASHINGTON ST")
            .await
            .unwrap();
        assert_eq!(miss, None);
    }

    #[tokio::test]
    async fn ungeocoded_locations_excludes_resolved_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_citation(&record(1)).await.unwrap();
        store.upsert_citation(&record(2)).await.unwrap();
        store.update_coordinates(1, 42.28, -83.74).await.unwrap();

        let pending = store.ungeocoded_locations(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, 2);
    }

    #[tokio::test]
    async fn subscriptions_round_trip_through_json_target() {
        let store = SqliteStore::open_in_memory().unwrap();
        {
            let conn = store.lock();
            conn.execute(
                "INSERT INTO subscriptions (plate_state, plate_number, target)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    "MI",
                    "ABC1234",
                    serde_json::to_string(&NotifyTarget::Webhook {
                        url: "https://hooks.example.test/tickets".into(),
                    })
                    .unwrap(),
                ],
            )
            .unwrap();
        }

        let subscriptions = store.active_subscriptions().await.unwrap();
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[0].plate_number.as_deref(), Some("ABC1234"));
    }
}
