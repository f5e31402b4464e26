use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use uphill_core::{ExecutionRecord, Routine, RoutineEvaluation, RoutineUpdate, UserProfile};

pub const UPHILL_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// SQLite-backed store for the per-user routine/execution partitions.
///
/// Every query is scoped by `owner_id`; callers pass an already
/// authenticated user id and can never reach another user's rows.
pub struct RoutineStore {
    conn: Connection,
}

impl RoutineStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > UPHILL_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: UPHILL_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_uphill_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn upsert_user(&self, user: &UserProfile) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO users (uid, email, name, picture, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(uid) DO UPDATE SET
                email=excluded.email,
                name=excluded.name,
                picture=excluded.picture
            ",
            params![
                user.uid,
                user.email,
                user.name,
                user.picture,
                user.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn user(&self, uid: &str) -> Result<Option<UserProfile>, StorageError> {
        let user = self
            .conn
            .query_row(
                "SELECT uid, email, name, picture, created_at FROM users WHERE uid = ?1",
                [uid],
                |row| {
                    Ok(UserProfile {
                        uid: row.get(0)?,
                        email: row.get(1)?,
                        name: row.get(2)?,
                        picture: row.get(3)?,
                        created_at: timestamp_column(row, 4)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    pub fn insert_routine(&self, routine: &Routine) -> Result<(), StorageError> {
        let days_json = routine
            .days
            .as_ref()
            .map(|days| {
                serde_json::to_string(days)
                    .map_err(|err| StorageError::Serialization(err.to_string()))
            })
            .transpose()?;

        self.conn.execute(
            "
            INSERT INTO routines (
                routine_id,
                owner_id,
                title,
                time_of_day,
                category,
                color,
                days_json,
                created_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            params![
                routine.id,
                routine.owner_id,
                routine.title,
                routine.time_of_day,
                routine.category,
                routine.color,
                days_json,
                routine.created_at.to_rfc3339(),
                routine.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// All routines for one owner, sorted by time of day ascending.
    pub fn routines_for_owner(&self, owner_id: &str) -> Result<Vec<Routine>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT routine_id, owner_id, title, time_of_day, category, color, days_json,
                   created_at, updated_at
            FROM routines
            WHERE owner_id = ?1
            ORDER BY time_of_day ASC, created_at ASC
            ",
        )?;
        let rows = stmt.query_map([owner_id], routine_from_row)?;
        let mut routines = Vec::new();
        for row in rows {
            routines.push(row?);
        }
        Ok(routines)
    }

    pub fn routine(&self, owner_id: &str, routine_id: &str) -> Result<Option<Routine>, StorageError> {
        let routine = self
            .conn
            .query_row(
                "
                SELECT routine_id, owner_id, title, time_of_day, category, color, days_json,
                       created_at, updated_at
                FROM routines
                WHERE owner_id = ?1 AND routine_id = ?2
                ",
                [owner_id, routine_id],
                routine_from_row,
            )
            .optional()?;
        Ok(routine)
    }

    pub fn routine_exists(&self, owner_id: &str, routine_id: &str) -> Result<bool, StorageError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM routines WHERE owner_id = ?1 AND routine_id = ?2",
                [owner_id, routine_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Applies a partial update and returns the stored row, or `None` when
    /// the routine does not exist for this owner.
    pub fn update_routine(
        &self,
        owner_id: &str,
        routine_id: &str,
        update: &RoutineUpdate,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Routine>, StorageError> {
        let Some(mut routine) = self.routine(owner_id, routine_id)? else {
            return Ok(None);
        };

        if let Some(title) = &update.title {
            routine.title = title.clone();
        }
        if let Some(time_of_day) = &update.time_of_day {
            routine.time_of_day = time_of_day.clone();
        }
        if let Some(category) = &update.category {
            routine.category = category.clone();
        }
        if let Some(color) = &update.color {
            routine.color = Some(color.clone());
        }
        if let Some(days) = &update.days {
            routine.days = Some(days.clone());
        }
        routine.updated_at = updated_at;

        let days_json = routine
            .days
            .as_ref()
            .map(|days| {
                serde_json::to_string(days)
                    .map_err(|err| StorageError::Serialization(err.to_string()))
            })
            .transpose()?;

        self.conn.execute(
            "
            UPDATE routines SET
                title = ?3,
                time_of_day = ?4,
                category = ?5,
                color = ?6,
                days_json = ?7,
                updated_at = ?8
            WHERE owner_id = ?1 AND routine_id = ?2
            ",
            params![
                owner_id,
                routine_id,
                routine.title,
                routine.time_of_day,
                routine.category,
                routine.color,
                days_json,
                routine.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(Some(routine))
    }

    pub fn delete_routine(&self, owner_id: &str, routine_id: &str) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "DELETE FROM routines WHERE owner_id = ?1 AND routine_id = ?2",
            [owner_id, routine_id],
        )?;
        Ok(changes > 0)
    }

    pub fn insert_execution(&self, execution: &ExecutionRecord) -> Result<(), StorageError> {
        let duration_seconds = i64::try_from(execution.duration_seconds).map_err(|_| {
            StorageError::Serialization(format!(
                "duration {} exceeds the storable range",
                execution.duration_seconds
            ))
        })?;
        self.conn.execute(
            "
            INSERT INTO executions (
                execution_id,
                owner_id,
                routine_id,
                routine_title,
                started_at,
                ended_at,
                duration_seconds,
                date,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            params![
                execution.id,
                execution.owner_id,
                execution.routine_id,
                execution.routine_title,
                execution.started_at,
                execution.ended_at,
                duration_seconds,
                execution.date,
                execution.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Every execution one owner logged on one derived date, ordered by
    /// `started_at` ascending. The order is load-bearing for feedback
    /// generation downstream.
    pub fn executions_for_date(
        &self,
        owner_id: &str,
        date: &str,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT execution_id, owner_id, routine_id, routine_title, started_at, ended_at,
                   duration_seconds, date, created_at
            FROM executions
            WHERE owner_id = ?1 AND date = ?2
            ORDER BY started_at ASC
            ",
        )?;
        let rows = stmt.query_map([owner_id, date], execution_from_row)?;
        let mut executions = Vec::new();
        for row in rows {
            executions.push(row?);
        }
        Ok(executions)
    }

    pub fn insert_evaluation(&self, evaluation: &RoutineEvaluation) -> Result<(), StorageError> {
        let steps_json = serde_json::to_string(&evaluation.steps)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.conn.execute(
            "
            INSERT INTO evaluations (
                evaluation_id,
                name,
                goal,
                steps_json,
                score,
                summary,
                risk,
                tip,
                raw_feedback,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                evaluation.id,
                evaluation.name,
                evaluation.goal,
                steps_json,
                evaluation.score,
                evaluation.summary,
                evaluation.risk,
                evaluation.tip,
                evaluation.raw_feedback,
                evaluation.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn evaluations(&self) -> Result<Vec<RoutineEvaluation>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT evaluation_id, name, goal, steps_json, score, summary, risk, tip,
                   raw_feedback, created_at
            FROM evaluations
            ORDER BY created_at ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            let steps_json: String = row.get(3)?;
            let steps: Vec<String> = serde_json::from_str(&steps_json).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?;
            Ok(RoutineEvaluation {
                id: row.get(0)?,
                name: row.get(1)?,
                goal: row.get(2)?,
                steps,
                score: row.get(4)?,
                summary: row.get(5)?,
                risk: row.get(6)?,
                tip: row.get(7)?,
                raw_feedback: row.get(8)?,
                created_at: timestamp_column(row, 9)?,
            })
        })?;
        let mut evaluations = Vec::new();
        for row in rows {
            evaluations.push(row?);
        }
        Ok(evaluations)
    }
}

fn routine_from_row(row: &Row<'_>) -> rusqlite::Result<Routine> {
    let days_json: Option<String> = row.get(6)?;
    let days = days_json
        .map(|json| {
            serde_json::from_str::<Vec<u8>>(&json).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    6,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })
        })
        .transpose()?;
    Ok(Routine {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        title: row.get(2)?,
        time_of_day: row.get(3)?,
        category: row.get(4)?,
        color: row.get(5)?,
        days,
        created_at: timestamp_column(row, 7)?,
        updated_at: timestamp_column(row, 8)?,
    })
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    Ok(ExecutionRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        routine_id: row.get(2)?,
        routine_title: row.get(3)?,
        started_at: row.get(4)?,
        ended_at: row.get(5)?,
        duration_seconds: row.get::<_, i64>(6)? as u64,
        date: row.get(7)?,
        created_at: timestamp_column(row, 8)?,
    })
}

fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                index,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}
