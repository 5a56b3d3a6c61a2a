use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Row};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::models::{
    ActivityEvent, ActivityGoals, ActivityKind, ClassAgitSettings, HonorRollEntry, RankingEntry,
    SeasonSnapshot, Student,
};
use crate::store::{AgitStore, StoreError, StoreResult};

pub const SEED_CLASS_ID: &str = "5b0f6c1e-8d3a-4c52-9e61-2f4b7a9c0d13";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn goal_to_db(goal: u32) -> i32 {
    i32::try_from(goal).unwrap_or(i32::MAX)
}

fn goal_from_db(goal: i32) -> u32 {
    u32::try_from(goal).unwrap_or(0)
}

fn settings_from_row(row: &PgRow) -> Result<ClassAgitSettings, sqlx::Error> {
    Ok(ClassAgitSettings {
        is_enabled: row.try_get("is_enabled")?,
        target_score: row.try_get("target_score")?,
        current_temperature: row.try_get("current_temperature")?,
        last_reset_at: row.try_get("last_reset_at")?,
        activity_goals: ActivityGoals {
            post: goal_from_db(row.try_get("goal_post")?),
            comment: goal_from_db(row.try_get("goal_comment")?),
            reaction: goal_from_db(row.try_get("goal_reaction")?),
        },
        surprise_gift: row.try_get("surprise_gift")?,
    })
}

fn snapshot_from_row(row: &PgRow) -> StoreResult<SeasonSnapshot> {
    let settings: Json<ClassAgitSettings> = row.try_get("settings")?;
    let ranking: Json<Vec<RankingEntry>> = row.try_get("ranking")?;
    Ok(SeasonSnapshot {
        id: row.try_get("id")?,
        class_id: row.try_get("class_id")?,
        archived_at: row.try_get("archived_at")?,
        settings: settings.0,
        ranking: ranking.0,
    })
}

async fn ranking<'e, E: PgExecutor<'e>>(
    executor: E,
    class_id: Uuid,
    since: Option<DateTime<Utc>>,
) -> StoreResult<Vec<RankingEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT s.id AS student_id, s.name, COUNT(h.student_id) AS achieved_days
        FROM class_agit.students s
        LEFT JOIN class_agit.honor_roll h
            ON h.student_id = s.id
           AND h.class_id = s.class_id
           AND ($2::timestamptz IS NULL OR h.recorded_at >= $2)
        WHERE s.class_id = $1
        GROUP BY s.id, s.name
        ORDER BY achieved_days DESC, s.name
        "#,
    )
    .bind(class_id)
    .bind(since)
    .fetch_all(executor)
    .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        entries.push(RankingEntry {
            student_id: row.try_get("student_id")?,
            name: row.try_get("name")?,
            achieved_days: row.try_get("achieved_days")?,
        });
    }
    Ok(entries)
}

#[derive(Clone)]
pub struct PgAgitStore {
    pool: PgPool,
}

impl PgAgitStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AgitStore for PgAgitStore {
    #[instrument(skip(self))]
    async fn load_settings(&self, class_id: Uuid) -> StoreResult<Option<ClassAgitSettings>> {
        let row = sqlx::query(
            r#"
            SELECT is_enabled, target_score, current_temperature, last_reset_at,
                   goal_post, goal_comment, goal_reaction, surprise_gift
            FROM class_agit.agit_settings
            WHERE class_id = $1
            "#,
        )
        .bind(class_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(settings_from_row).transpose()?)
    }

    #[instrument(skip(self, settings))]
    async fn save_settings(&self, class_id: Uuid, settings: &ClassAgitSettings) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO class_agit.agit_settings
            (class_id, is_enabled, target_score, current_temperature, last_reset_at,
             goal_post, goal_comment, goal_reaction, surprise_gift, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now())
            ON CONFLICT (class_id) DO UPDATE
            SET is_enabled = EXCLUDED.is_enabled,
                target_score = EXCLUDED.target_score,
                current_temperature = EXCLUDED.current_temperature,
                last_reset_at = EXCLUDED.last_reset_at,
                goal_post = EXCLUDED.goal_post,
                goal_comment = EXCLUDED.goal_comment,
                goal_reaction = EXCLUDED.goal_reaction,
                surprise_gift = EXCLUDED.surprise_gift,
                updated_at = now()
            "#,
        )
        .bind(class_id)
        .bind(settings.is_enabled)
        .bind(settings.target_score)
        .bind(settings.current_temperature)
        .bind(settings.last_reset_at)
        .bind(goal_to_db(settings.activity_goals.post))
        .bind(goal_to_db(settings.activity_goals.comment))
        .bind(goal_to_db(settings.activity_goals.reaction))
        .bind(&settings.surprise_gift)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fetch_activity(
        &self,
        class_id: Uuid,
        kind: ActivityKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<ActivityEvent>> {
        let query = format!(
            "SELECT student_id, created_at FROM class_agit.{} \
             WHERE class_id = $1 AND created_at >= $2 AND created_at < $3",
            kind.table()
        );
        let rows = sqlx::query(&query)
            .bind(class_id)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            events.push(ActivityEvent {
                kind,
                student_id: row.try_get("student_id")?,
                class_id,
                occurred_at: row.try_get("created_at")?,
            });
        }
        Ok(events)
    }

    #[instrument(skip(self))]
    async fn fetch_roster(&self, class_id: Uuid) -> StoreResult<Vec<Student>> {
        let rows = sqlx::query(
            "SELECT id, class_id, name FROM class_agit.students WHERE class_id = $1 ORDER BY name",
        )
        .bind(class_id)
        .fetch_all(&self.pool)
        .await?;

        let mut students = Vec::with_capacity(rows.len());
        for row in rows {
            students.push(Student {
                id: row.try_get("id")?,
                class_id: row.try_get("class_id")?,
                name: row.try_get("name")?,
            });
        }
        Ok(students)
    }

    #[instrument(skip(self))]
    async fn fetch_honor_roll(
        &self,
        class_id: Uuid,
        date: NaiveDate,
        recorded_since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT student_id FROM class_agit.honor_roll
            WHERE class_id = $1 AND achieved_date = $2
              AND ($3::timestamptz IS NULL OR recorded_at >= $3)
            "#,
        )
        .bind(class_id)
        .bind(date)
        .bind(recorded_since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get("student_id").map_err(StoreError::from))
            .collect()
    }

    #[instrument(skip(self))]
    async fn record_honor_roll(
        &self,
        entry: &HonorRollEntry,
        window_start: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO class_agit.honor_roll (student_id, class_id, achieved_date)
            VALUES ($1, $2, $3)
            ON CONFLICT (student_id, achieved_date) DO UPDATE
            SET recorded_at = now()
            WHERE class_agit.honor_roll.recorded_at < $4
            "#,
        )
        .bind(entry.student_id)
        .bind(entry.class_id)
        .bind(entry.achieved_date)
        .bind(window_start)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() > 0),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(skip(self))]
    async fn apply_settlement(
        &self,
        class_id: Uuid,
        date: NaiveDate,
        mission_count: i32,
    ) -> StoreResult<Option<i32>> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO class_agit.day_settlements (class_id, settled_date, mission_count)
            VALUES ($1, $2, $3)
            ON CONFLICT (class_id, settled_date) DO NOTHING
            "#,
        )
        .bind(class_id)
        .bind(date)
        .bind(mission_count)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let row = sqlx::query(
            r#"
            UPDATE class_agit.agit_settings
            SET current_temperature = LEAST(target_score, current_temperature + $2),
                updated_at = now()
            WHERE class_id = $1
            RETURNING current_temperature
            "#,
        )
        .bind(class_id)
        .bind(mission_count)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(StoreError::SettingsNotFound(class_id));
        };
        let temperature: i32 = row.try_get("current_temperature")?;
        tx.commit().await?;
        Ok(Some(temperature))
    }

    #[instrument(skip(self))]
    async fn unsettled_dates(
        &self,
        class_id: Uuid,
        before: NaiveDate,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<NaiveDate>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT h.achieved_date
            FROM class_agit.honor_roll h
            LEFT JOIN class_agit.day_settlements d
                ON d.class_id = h.class_id AND d.settled_date = h.achieved_date
            WHERE h.class_id = $1
              AND h.achieved_date < $2
              AND ($3::timestamptz IS NULL OR h.recorded_at >= $3)
              AND d.settled_date IS NULL
            ORDER BY h.achieved_date
            "#,
        )
        .bind(class_id)
        .bind(before)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get("achieved_date").map_err(StoreError::from))
            .collect()
    }

    #[instrument(skip(self))]
    async fn season_ranking(
        &self,
        class_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<RankingEntry>> {
        ranking(&self.pool, class_id, since).await
    }

    #[instrument(skip(self))]
    async fn archive_and_reset(
        &self,
        class_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<SeasonSnapshot> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT is_enabled, target_score, current_temperature, last_reset_at,
                   goal_post, goal_comment, goal_reaction, surprise_gift
            FROM class_agit.agit_settings
            WHERE class_id = $1
            FOR UPDATE
            "#,
        )
        .bind(class_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Err(StoreError::SettingsNotFound(class_id));
        };
        let settings = settings_from_row(&row)?;
        let standings = ranking(&mut *tx, class_id, settings.last_reset_at).await?;

        let snapshot = SeasonSnapshot {
            id: Uuid::new_v4(),
            class_id,
            archived_at: now,
            settings,
            ranking: standings,
        };

        sqlx::query(
            r#"
            INSERT INTO class_agit.season_history (id, class_id, archived_at, settings, ranking)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(snapshot.id)
        .bind(class_id)
        .bind(now)
        .bind(Json(&snapshot.settings))
        .bind(Json(&snapshot.ranking))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE class_agit.agit_settings
            SET current_temperature = 0, last_reset_at = $2, updated_at = now()
            WHERE class_id = $1
            "#,
        )
        .bind(class_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(snapshot)
    }

    #[instrument(skip(self))]
    async fn season_history(&self, class_id: Uuid) -> StoreResult<Vec<SeasonSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT id, class_id, archived_at, settings, ranking
            FROM class_agit.season_history
            WHERE class_id = $1
            ORDER BY archived_at DESC
            "#,
        )
        .bind(class_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(snapshot_from_row).collect()
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<Uuid> {
    let class_id = Uuid::parse_str(SEED_CLASS_ID)?;

    sqlx::query(
        r#"
        INSERT INTO class_agit.classes (id, name)
        VALUES ($1, $2)
        ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name
        "#,
    )
    .bind(class_id)
    .bind("햇살반")
    .execute(pool)
    .await?;

    let students = vec![
        (
            Uuid::parse_str("a1d3c7e2-41b5-4f0a-8c2e-6b9d0f1e2a34")?,
            "김하늘",
            "SUN-0101",
        ),
        (
            Uuid::parse_str("b7e2f9c4-62a1-4d3b-9f4e-1c8a5d6b7e90")?,
            "이바다",
            "SUN-0102",
        ),
        (
            Uuid::parse_str("c4a8b1d6-93e7-45c2-a1b3-7d2e9f0c4b56")?,
            "박구름",
            "SUN-0103",
        ),
    ];

    for (id, name, login_code) in students.iter().copied() {
        sqlx::query(
            r#"
            INSERT INTO class_agit.students (id, class_id, name, login_code)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (login_code) DO UPDATE SET name = EXCLUDED.name
            "#,
        )
        .bind(id)
        .bind(class_id)
        .bind(name)
        .bind(login_code)
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO class_agit.agit_settings
            (class_id, is_enabled, target_score, current_temperature, surprise_gift)
        VALUES ($1, true, 100, 37, $2)
        ON CONFLICT (class_id) DO NOTHING
        "#,
    )
    .bind(class_id)
    .bind("금요일 체육 시간 10분 추가")
    .execute(pool)
    .await?;

    // First student completes today's mission, second falls one comment short.
    let plan = [
        (students[0].0, "sun-0101", [1usize, 5, 5]),
        (students[1].0, "sun-0102", [1, 4, 5]),
        (students[2].0, "sun-0103", [0, 2, 1]),
    ];
    let base = Utc::now() - Duration::minutes(90);

    for (student_id, prefix, counts) in plan {
        for (kind, count) in ActivityKind::ALL.into_iter().zip(counts) {
            for n in 0..count {
                let query = format!(
                    "INSERT INTO class_agit.{} (id, class_id, student_id, source_key, created_at) \
                     VALUES ($1, $2, $3, $4, $5) ON CONFLICT (source_key) DO NOTHING",
                    kind.table()
                );
                sqlx::query(&query)
                    .bind(Uuid::new_v4())
                    .bind(class_id)
                    .bind(student_id)
                    .bind(format!("seed-{}-{prefix}-{kind}-{n}", base.date_naive()))
                    .bind(base + Duration::minutes(n as i64))
                    .execute(pool)
                    .await?;
            }
        }
    }

    Ok(class_id)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportStats {
    pub inserted: usize,
    pub duplicates: usize,
    pub unknown_students: usize,
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<ImportStats> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        login_code: String,
        kind: String,
        occurred_at: DateTime<Utc>,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut stats = ImportStats::default();

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result?;
        let kind: ActivityKind = row
            .kind
            .parse()
            .map_err(|err: String| anyhow::anyhow!("row {}: {err}", line + 1))?;

        let student =
            sqlx::query("SELECT id, class_id FROM class_agit.students WHERE login_code = $1")
                .bind(&row.login_code)
                .fetch_optional(pool)
                .await?;
        let Some(student) = student else {
            warn!(login_code = %row.login_code, "skipping activity for unknown student");
            stats.unknown_students += 1;
            continue;
        };
        let student_id: Uuid = student.try_get("id")?;
        let class_id: Uuid = student.try_get("class_id")?;

        let source_key = row
            .source_key
            .filter(|key| !key.trim().is_empty())
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        let query = format!(
            "INSERT INTO class_agit.{} (id, class_id, student_id, source_key, created_at) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (source_key) DO NOTHING",
            kind.table()
        );
        let result = sqlx::query(&query)
            .bind(Uuid::new_v4())
            .bind(class_id)
            .bind(student_id)
            .bind(source_key)
            .bind(row.occurred_at)
            .execute(pool)
            .await?;

        if result.rows_affected() > 0 {
            stats.inserted += 1;
        } else {
            stats.duplicates += 1;
        }
    }

    Ok(stats)
}
