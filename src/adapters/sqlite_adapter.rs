//! SQLite storage: bar history plus the persisted engine state.
//!
//! Tables:
//! - `ohlcv` keyed by `(instrument, timestamp)`
//! - `current_state`, a single row holding the JSON snapshot
//! - `transitions`, the append-only log keyed by sequence number

use crate::domain::error::CycleError;
use crate::domain::ohlcv::OhlcvBar;
use crate::domain::state_store::{StateSnapshot, TransitionRecord};
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::DataPort;
use crate::ports::persistence_port::PersistencePort;
use chrono::NaiveDateTime;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{OptionalExtension, params};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct SqliteAdapter {
    pool: Pool<SqliteConnectionManager>,
}

fn pool_error(e: r2d2::Error) -> CycleError {
    CycleError::Persistence {
        reason: e.to_string(),
    }
}

fn query_error(e: rusqlite::Error) -> CycleError {
    CycleError::Persistence {
        reason: e.to_string(),
    }
}

impl SqliteAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, CycleError> {
        let db_path =
            config
                .get_string("sqlite", "path")
                .ok_or_else(|| CycleError::ConfigMissing {
                    section: "sqlite".into(),
                    key: "path".into(),
                })?;

        let pool_size = config.get_int("sqlite", "pool_size", 4).max(1) as u32;

        let manager = SqliteConnectionManager::file(&db_path);
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(pool_error)?;

        let adapter = Self { pool };
        adapter.initialize_schema()?;
        Ok(adapter)
    }

    pub fn in_memory() -> Result<Self, CycleError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(pool_error)?;

        let adapter = Self { pool };
        adapter.initialize_schema()?;
        Ok(adapter)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, CycleError> {
        self.pool.get().map_err(pool_error)
    }

    pub fn initialize_schema(&self) -> Result<(), CycleError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ohlcv (
                instrument TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume INTEGER NOT NULL,
                PRIMARY KEY (instrument, timestamp)
            );
            CREATE TABLE IF NOT EXISTS current_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                tick INTEGER NOT NULL,
                snapshot TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS transitions (
                seq INTEGER PRIMARY KEY,
                tick INTEGER NOT NULL,
                instrument TEXT NOT NULL,
                kind TEXT NOT NULL,
                record TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transitions_instrument ON transitions(instrument);",
        )
        .map_err(query_error)?;

        Ok(())
    }

    pub fn insert_bars(&self, bars: &[OhlcvBar]) -> Result<(), CycleError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(query_error)?;

        for bar in bars {
            tx.execute(
                "INSERT OR REPLACE INTO ohlcv (instrument, timestamp, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    bar.instrument,
                    bar.timestamp.format(TIMESTAMP_FORMAT).to_string(),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume
                ],
            )
            .map_err(query_error)?;
        }

        tx.commit().map_err(query_error)?;
        Ok(())
    }
}

impl DataPort for SqliteAdapter {
    fn fetch_bars(
        &self,
        instrument: &str,
        after: Option<NaiveDateTime>,
    ) -> Result<Vec<OhlcvBar>, CycleError> {
        let conn = self.conn()?;
        let after_str = after
            .map(|a| a.format(TIMESTAMP_FORMAT).to_string())
            .unwrap_or_default();

        let mut stmt = conn
            .prepare(
                "SELECT instrument, timestamp, open, high, low, close, volume
                 FROM ohlcv
                 WHERE instrument = ?1 AND timestamp > ?2
                 ORDER BY timestamp ASC",
            )
            .map_err(query_error)?;

        let rows = stmt
            .query_map(params![instrument.to_uppercase(), after_str], |row| {
                let ts_str: String = row.get(1)?;
                let timestamp =
                    NaiveDateTime::parse_from_str(&ts_str, TIMESTAMP_FORMAT).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            1,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?;
                Ok(OhlcvBar {
                    instrument: row.get(0)?,
                    timestamp,
                    open: row.get(2)?,
                    high: row.get(3)?,
                    low: row.get(4)?,
                    close: row.get(5)?,
                    volume: row.get(6)?,
                })
            })
            .map_err(query_error)?;

        let mut bars = Vec::new();
        for row in rows {
            bars.push(row.map_err(query_error)?);
        }
        Ok(bars)
    }

    fn list_instruments(&self) -> Result<Vec<String>, CycleError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT instrument FROM ohlcv ORDER BY instrument")
            .map_err(query_error)?;
        let rows = stmt.query_map([], |row| row.get(0)).map_err(query_error)?;

        let mut instruments = Vec::new();
        for row in rows {
            instruments.push(row.map_err(query_error)?);
        }
        Ok(instruments)
    }
}

impl PersistencePort for SqliteAdapter {
    fn read_last_state(&self) -> Result<Option<StateSnapshot>, CycleError> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row("SELECT snapshot FROM current_state WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(query_error)?;
        json.map(|j| StateSnapshot::from_json(&j)).transpose()
    }

    fn append_transition(&self, record: &TransitionRecord) -> Result<(), CycleError> {
        let json = serde_json::to_string(record).map_err(|e| CycleError::Persistence {
            reason: format!("encode transition: {}", e),
        })?;
        let conn = self.conn()?;
        // A rerun after a failed snapshot write reuses sequence numbers.
        conn.execute(
            "INSERT OR REPLACE INTO transitions (seq, tick, instrument, kind, record)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.seq as i64,
                record.tick as i64,
                record.instrument,
                record.kind.to_string(),
                json
            ],
        )
        .map_err(query_error)?;
        Ok(())
    }

    fn overwrite_current_state(&self, snapshot: &StateSnapshot) -> Result<(), CycleError> {
        let json = snapshot.to_json()?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO current_state (id, tick, snapshot) VALUES (1, ?1, ?2)",
            params![snapshot.tick as i64, json],
        )
        .map_err(query_error)?;
        Ok(())
    }

    fn read_transitions(&self, limit: usize) -> Result<Vec<TransitionRecord>, CycleError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT record FROM transitions ORDER BY seq DESC LIMIT ?1")
            .map_err(query_error)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))
            .map_err(query_error)?;

        let mut records = Vec::new();
        for row in rows {
            let json = row.map_err(query_error)?;
            let record: TransitionRecord =
                serde_json::from_str(&json).map_err(|e| CycleError::Persistence {
                    reason: format!("decode transition: {}", e),
                })?;
            records.push(record);
        }
        records.reverse();
        Ok(records)
    }
}
