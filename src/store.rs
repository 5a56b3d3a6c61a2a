//! Data-access contract for the clubhouse: settings, activity, roster and
//! the honor roll. `db::PgAgitStore` is the Postgres implementation.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::models::{
    ActivityEvent, ActivityKind, ClassAgitSettings, HonorRollEntry, RankingEntry, SeasonSnapshot,
    Student,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("class {0} has no clubhouse settings")]
    SettingsNotFound(Uuid),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("{0} has not ended yet")]
    DayNotClosed(NaiveDate),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait AgitStore: Send + Sync {
    async fn load_settings(&self, class_id: Uuid) -> StoreResult<Option<ClassAgitSettings>>;

    /// Overwrites the whole settings object.
    async fn save_settings(&self, class_id: Uuid, settings: &ClassAgitSettings) -> StoreResult<()>;

    /// Activity of one kind in `[start, end)`.
    async fn fetch_activity(
        &self,
        class_id: Uuid,
        kind: ActivityKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<ActivityEvent>>;

    async fn fetch_roster(&self, class_id: Uuid) -> StoreResult<Vec<Student>>;

    /// Students on the honor roll for `date`, optionally only those recorded
    /// at or after `recorded_since`.
    async fn fetch_honor_roll(
        &self,
        class_id: Uuid,
        date: NaiveDate,
        recorded_since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Uuid>>;

    /// Returns `false` when the student is already recorded for the date in
    /// the current window. An entry recorded before `window_start` (a season
    /// reset happened in between) is re-stamped instead.
    async fn record_honor_roll(
        &self,
        entry: &HonorRollEntry,
        window_start: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Adds `mission_count` to the class temperature once per date. Returns
    /// the new temperature, or `None` if the date was already settled.
    async fn apply_settlement(
        &self,
        class_id: Uuid,
        date: NaiveDate,
        mission_count: i32,
    ) -> StoreResult<Option<i32>>;

    /// Dates before `before` that have honor-roll entries recorded since
    /// `since` but no settlement yet, oldest first.
    async fn unsettled_dates(
        &self,
        class_id: Uuid,
        before: NaiveDate,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<NaiveDate>>;

    /// Honor-roll totals per student since `since` (whole history if `None`).
    async fn season_ranking(
        &self,
        class_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<RankingEntry>>;

    /// Snapshots settings and ranking, then zeroes the temperature and
    /// stamps `last_reset_at = now`.
    async fn archive_and_reset(
        &self,
        class_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<SeasonSnapshot>;

    async fn season_history(&self, class_id: Uuid) -> StoreResult<Vec<SeasonSnapshot>>;
}
