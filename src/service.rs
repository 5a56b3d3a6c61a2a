use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregate;
use crate::models::{
    ActivityEvent, ActivityKind, AgitSummary, ClassAgitSettings, HonorRollEntry, SeasonSnapshot,
    Settings,
};
use crate::store::{AgitStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct Refresh {
    pub settings: Settings,
    pub summary: AgitSummary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Settled {
        date: NaiveDate,
        mission_count: i32,
        temperature: i32,
    },
    AlreadySettled(NaiveDate),
    NotConfigured,
}

pub async fn load_settings<S: AgitStore + ?Sized>(store: &S, class_id: Uuid) -> Settings {
    match store.load_settings(class_id).await {
        Ok(settings) => Settings::from(settings),
        Err(err) => {
            warn!(%class_id, error = %err, "settings unavailable, using defaults");
            Settings::Default
        }
    }
}

async fn load_events<S: AgitStore + ?Sized>(
    store: &S,
    class_id: Uuid,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<ActivityEvent> {
    let mut events = Vec::new();
    for kind in ActivityKind::ALL {
        match store.fetch_activity(class_id, kind, start, end).await {
            Ok(batch) => events.extend(batch),
            Err(err) => {
                warn!(%class_id, %kind, error = %err, "activity unavailable, counting as zero")
            }
        }
    }
    events
}

/// Settles every closed day of the season that still has unsettled honor-roll
/// entries. Returns whether the baseline moved.
async fn settle_closed_days<S: AgitStore + ?Sized>(
    store: &S,
    class_id: Uuid,
    settings: &Settings,
    today: NaiveDate,
) -> bool {
    let Settings::Configured(configured) = settings else {
        return false;
    };

    let dates = match store
        .unsettled_dates(class_id, today, configured.last_reset_at)
        .await
    {
        Ok(dates) => dates,
        Err(err) => {
            warn!(%class_id, error = %err, "could not list unsettled days");
            return false;
        }
    };

    let mut moved = false;
    for date in dates {
        match settle_day(store, class_id, date, today).await {
            Ok(Settlement::Settled { .. }) => moved = true,
            Ok(Settlement::AlreadySettled(_) | Settlement::NotConfigured) => {}
            Err(err) => warn!(%class_id, %date, error = %err, "day settlement failed"),
        }
    }
    moved
}

/// Recomputes the clubhouse state from scratch and records new achievers.
/// Closed days that were never settled are folded into the baseline first.
///
/// Never fails: unavailable sources degrade to defaults or empty sets.
pub async fn refresh<S: AgitStore + ?Sized>(
    store: &S,
    class_id: Uuid,
    now: DateTime<FixedOffset>,
) -> Refresh {
    let mut settings = load_settings(store, class_id).await;
    if settle_closed_days(store, class_id, &settings, now.date_naive()).await {
        settings = load_settings(store, class_id).await;
    }
    let resolved = settings.resolve();
    let window = aggregate::aggregation_window(now, resolved.last_reset_at);

    let events = load_events(store, class_id, window.start, window.end).await;
    let roster = store.fetch_roster(class_id).await.unwrap_or_else(|err| {
        warn!(%class_id, error = %err, "roster unavailable");
        Vec::new()
    });
    let honored = store
        .fetch_honor_roll(class_id, window.date, Some(window.start))
        .await
        .unwrap_or_else(|err| {
            warn!(%class_id, error = %err, "honor roll unavailable");
            Vec::new()
        });

    let summary = aggregate::aggregate(&resolved, &window, &events, &roster, &honored);
    debug!(
        %class_id,
        events = events.len(),
        achieved = summary.today_mission_count,
        temperature = summary.temperature,
        stage = summary.stage_level,
        "recomputed clubhouse"
    );

    if resolved.is_enabled {
        record_achievers(store, class_id, &summary, &honored).await;
    }

    Refresh { settings, summary }
}

async fn record_achievers<S: AgitStore + ?Sized>(
    store: &S,
    class_id: Uuid,
    summary: &AgitSummary,
    honored: &[Uuid],
) {
    for student_id in summary.achieved_students.iter().filter(|id| !honored.contains(id)) {
        let entry = HonorRollEntry {
            student_id: *student_id,
            class_id,
            achieved_date: summary.window.date,
        };
        match store.record_honor_roll(&entry, summary.window.start).await {
            Ok(true) => {
                info!(%class_id, %student_id, date = %entry.achieved_date, "added to honor roll")
            }
            Ok(false) => {}
            Err(err) => warn!(%class_id, %student_id, error = %err, "failed to record honor roll"),
        }
    }
}

/// Folds a finished day's honor roll into the baseline temperature.
pub async fn settle_day<S: AgitStore + ?Sized>(
    store: &S,
    class_id: Uuid,
    date: NaiveDate,
    today: NaiveDate,
) -> StoreResult<Settlement> {
    if date >= today {
        return Err(StoreError::DayNotClosed(date));
    }

    let Some(settings) = store.load_settings(class_id).await? else {
        return Ok(Settlement::NotConfigured);
    };

    let honored = store
        .fetch_honor_roll(class_id, date, settings.last_reset_at)
        .await?;
    let mission_count = i32::try_from(honored.len()).unwrap_or(i32::MAX);

    match store.apply_settlement(class_id, date, mission_count).await? {
        Some(temperature) => {
            info!(%class_id, %date, mission_count, temperature, "settled day");
            Ok(Settlement::Settled {
                date,
                mission_count,
                temperature,
            })
        }
        None => Ok(Settlement::AlreadySettled(date)),
    }
}

pub fn validate_settings(settings: &ClassAgitSettings) -> StoreResult<()> {
    if settings.target_score <= 0 {
        return Err(StoreError::InvalidSettings(format!(
            "target score must be positive, got {}",
            settings.target_score
        )));
    }
    if settings.current_temperature < 0 || settings.current_temperature > settings.target_score {
        return Err(StoreError::InvalidSettings(format!(
            "temperature {} must lie within 0..={}",
            settings.current_temperature, settings.target_score
        )));
    }
    Ok(())
}

pub async fn update_settings<S: AgitStore + ?Sized>(
    store: &S,
    class_id: Uuid,
    settings: &ClassAgitSettings,
) -> StoreResult<()> {
    validate_settings(settings)?;
    store.save_settings(class_id, settings).await?;
    info!(
        %class_id,
        enabled = settings.is_enabled,
        target = settings.target_score,
        "saved clubhouse settings"
    );
    Ok(())
}

/// Starts a new season: archives the old one and zeroes the temperature.
pub async fn reset_season<S: AgitStore + ?Sized>(
    store: &S,
    class_id: Uuid,
    now: DateTime<Utc>,
) -> StoreResult<SeasonSnapshot> {
    let snapshot = store.archive_and_reset(class_id, now).await?;
    info!(
        %class_id,
        archived_temperature = snapshot.settings.current_temperature,
        ranked = snapshot.ranking.len(),
        "season archived and reset"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::models::{ActivityGoals, Student};
    use crate::store::memory::MemoryStore;

    fn kst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    fn local(day: u32, hour: u32) -> DateTime<FixedOffset> {
        kst().with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    fn complete_mission(
        class_id: Uuid,
        student_id: Uuid,
        at: DateTime<FixedOffset>,
    ) -> Vec<ActivityEvent> {
        let goals = ActivityGoals::default();
        let mut events = Vec::new();
        for (kind, count) in [
            (ActivityKind::Post, goals.post),
            (ActivityKind::Comment, goals.comment),
            (ActivityKind::Reaction, goals.reaction),
        ] {
            for _ in 0..count {
                events.push(ActivityEvent {
                    kind,
                    student_id,
                    class_id,
                    occurred_at: at.with_timezone(&Utc),
                });
            }
        }
        events
    }

    fn class_with_students(names: &[&str]) -> (MemoryStore, Uuid, Vec<Student>) {
        let store = MemoryStore::new();
        let class_id = Uuid::new_v4();
        store.put_settings(
            class_id,
            ClassAgitSettings {
                is_enabled: true,
                current_temperature: 10,
                ..ClassAgitSettings::default()
            },
        );
        store.set_clock(local(9, 12).with_timezone(&Utc));
        let students: Vec<Student> = names
            .iter()
            .map(|name| Student {
                id: Uuid::new_v4(),
                class_id,
                name: (*name).to_string(),
            })
            .collect();
        for student in &students {
            store.add_student(student.clone());
        }
        (store, class_id, students)
    }

    #[tokio::test]
    async fn refresh_records_each_achiever_once() {
        let (store, class_id, students) = class_with_students(&["김하늘", "이바다"]);
        store.add_events(complete_mission(class_id, students[0].id, local(9, 9)));

        let first = refresh(&store, class_id, local(9, 12)).await;
        assert_eq!(first.summary.temperature, 11);
        assert_eq!(store.honor_roll_len(), 1);

        let second = refresh(&store, class_id, local(9, 13)).await;
        assert_eq!(first.summary, second.summary);
        assert_eq!(second.summary.temperature, 11);
        assert_eq!(store.honor_roll_len(), 1);
    }

    #[tokio::test]
    async fn missing_settings_fall_back_to_defaults() {
        let store = MemoryStore::new();
        let class_id = Uuid::new_v4();
        store.add_events(complete_mission(class_id, Uuid::new_v4(), local(9, 9)));

        let result = refresh(&store, class_id, local(9, 12)).await;
        assert_eq!(result.settings, Settings::Default);
        assert_eq!(result.summary.temperature, 1);
        assert_eq!(store.honor_roll_len(), 0, "disabled clubhouse keeps no honor roll");
    }

    #[tokio::test]
    async fn unavailable_settings_degrade_instead_of_failing() {
        let (store, class_id, students) = class_with_students(&["김하늘"]);
        store.add_events(complete_mission(class_id, students[0].id, local(9, 9)));
        store.fail_settings();

        let result = refresh(&store, class_id, local(9, 12)).await;
        assert!(!result.settings.is_configured());
        assert_eq!(result.summary.temperature, 1);
    }

    #[tokio::test]
    async fn unavailable_event_source_counts_as_zero() {
        let (store, class_id, students) = class_with_students(&["김하늘"]);
        store.add_events(complete_mission(class_id, students[0].id, local(9, 9)));
        store.fail_kind(ActivityKind::Reaction);
        store.fail_roster();

        let result = refresh(&store, class_id, local(9, 12)).await;
        assert_eq!(result.summary.today_mission_count, 0);
        assert_eq!(result.summary.temperature, 10);
        assert_eq!(result.summary.per_student_status[0].counts.reaction, 0);
        assert_eq!(result.summary.per_student_status[0].counts.comment, 5);
    }

    #[tokio::test]
    async fn raising_goals_keeps_recorded_credit() {
        let (store, class_id, students) = class_with_students(&["김하늘"]);
        store.add_events(complete_mission(class_id, students[0].id, local(9, 9)));
        assert_eq!(refresh(&store, class_id, local(9, 10)).await.summary.temperature, 11);

        let mut settings = store.settings(class_id).unwrap();
        settings.activity_goals = ActivityGoals { post: 3, comment: 10, reaction: 10 };
        store.put_settings(class_id, settings);

        assert_eq!(refresh(&store, class_id, local(9, 11)).await.summary.temperature, 11);
    }

    #[tokio::test]
    async fn settlement_folds_day_into_baseline_once() {
        let (store, class_id, students) = class_with_students(&["김하늘", "이바다"]);
        for student in &students {
            store.add_events(complete_mission(class_id, student.id, local(9, 9)));
        }
        refresh(&store, class_id, local(9, 12)).await;

        let day = local(9, 0).date_naive();
        let next = local(10, 0).date_naive();
        let settled = settle_day(&store, class_id, day, next).await.unwrap();
        assert_eq!(
            settled,
            Settlement::Settled {
                date: day,
                mission_count: 2,
                temperature: 12
            }
        );
        assert_eq!(
            settle_day(&store, class_id, day, next).await.unwrap(),
            Settlement::AlreadySettled(day)
        );

        let tomorrow = refresh(&store, class_id, local(10, 8)).await;
        assert_eq!(tomorrow.summary.temperature, 12);
        assert_eq!(tomorrow.summary.today_mission_count, 0);
    }

    #[tokio::test]
    async fn settling_an_open_day_is_rejected() {
        let (store, class_id, _) = class_with_students(&[]);
        let today = local(9, 0).date_naive();
        let err = settle_day(&store, class_id, today, today).await.unwrap_err();
        assert!(matches!(err, StoreError::DayNotClosed(d) if d == today));
    }

    #[tokio::test]
    async fn reset_mid_day_only_counts_later_activity() {
        let (store, class_id, students) = class_with_students(&["김하늘", "이바다"]);
        store.set_clock(local(9, 10).with_timezone(&Utc));
        store.add_events(complete_mission(class_id, students[0].id, local(9, 10)));
        assert_eq!(refresh(&store, class_id, local(9, 11)).await.summary.temperature, 11);

        let snapshot = reset_season(&store, class_id, local(9, 14).with_timezone(&Utc))
            .await
            .unwrap();
        assert_eq!(snapshot.settings.current_temperature, 10);
        assert_eq!(snapshot.ranking[0].name, "김하늘");
        assert_eq!(snapshot.ranking[0].achieved_days, 1);

        store.set_clock(local(9, 15).with_timezone(&Utc));
        store.add_events(complete_mission(class_id, students[1].id, local(9, 15)));
        let after = refresh(&store, class_id, local(9, 16)).await;
        assert_eq!(after.summary.temperature, 1);
        assert_eq!(after.summary.achieved_students, vec![students[1].id]);

        let day = local(9, 0).date_naive();
        let settled = settle_day(&store, class_id, day, local(10, 0).date_naive())
            .await
            .unwrap();
        assert!(matches!(
            settled,
            Settlement::Settled { mission_count: 1, temperature: 1, .. }
        ));
    }

    #[tokio::test]
    async fn same_student_achieving_again_after_reset_is_restamped() {
        let (store, class_id, students) = class_with_students(&["김하늘", "이바다"]);
        let student = students[0].id;
        store.set_clock(local(9, 10).with_timezone(&Utc));
        store.add_events(complete_mission(class_id, student, local(9, 10)));
        assert_eq!(refresh(&store, class_id, local(9, 11)).await.summary.temperature, 11);

        reset_season(&store, class_id, local(9, 14).with_timezone(&Utc))
            .await
            .unwrap();
        assert_eq!(refresh(&store, class_id, local(9, 14)).await.summary.temperature, 0);

        store.set_clock(local(9, 15).with_timezone(&Utc));
        store.add_events(complete_mission(class_id, student, local(9, 15)));
        let after = refresh(&store, class_id, local(9, 16)).await;
        assert_eq!(after.summary.temperature, 1);
        assert_eq!(after.summary.achieved_students, vec![student]);
        assert_eq!(store.honor_roll_len(), 1);

        let since = store.settings(class_id).unwrap().last_reset_at;
        let ranking = store.season_ranking(class_id, since).await.unwrap();
        assert_eq!(ranking[0].student_id, student);
        assert_eq!(ranking[0].achieved_days, 1);

        let day = local(9, 0).date_naive();
        let settled = settle_day(&store, class_id, day, local(10, 0).date_naive())
            .await
            .unwrap();
        assert_eq!(
            settled,
            Settlement::Settled {
                date: day,
                mission_count: 1,
                temperature: 1
            }
        );
    }

    #[tokio::test]
    async fn refresh_settles_days_nobody_settled() {
        let (store, class_id, students) = class_with_students(&["김하늘"]);
        store.add_events(complete_mission(class_id, students[0].id, local(9, 9)));
        assert_eq!(refresh(&store, class_id, local(9, 12)).await.summary.temperature, 11);

        // Nothing runs on day 10; the next refresh happens on day 11.
        let later = refresh(&store, class_id, local(11, 8)).await;
        assert_eq!(later.summary.temperature, 11);
        assert_eq!(later.summary.today_mission_count, 0);
        assert_eq!(store.settings(class_id).unwrap().current_temperature, 11);

        let day = local(9, 0).date_naive();
        assert_eq!(
            settle_day(&store, class_id, day, local(11, 0).date_naive())
                .await
                .unwrap(),
            Settlement::AlreadySettled(day)
        );
        assert_eq!(refresh(&store, class_id, local(11, 9)).await.summary.temperature, 11);
    }

    #[tokio::test]
    async fn first_refresh_after_midnight_keeps_yesterday() {
        let (store, class_id, students) = class_with_students(&["김하늘", "이바다"]);
        for student in &students {
            store.add_events(complete_mission(class_id, student.id, local(9, 9)));
        }
        assert_eq!(refresh(&store, class_id, local(9, 23)).await.summary.temperature, 12);

        let after_midnight = local(10, 0) + Duration::minutes(1);
        let result = refresh(&store, class_id, after_midnight).await;
        assert_eq!(result.summary.temperature, 12);
        assert_eq!(result.summary.window.date, local(10, 0).date_naive());
    }

    #[tokio::test]
    async fn catch_up_ignores_days_from_before_a_reset() {
        let (store, class_id, students) = class_with_students(&["김하늘"]);
        store.add_events(complete_mission(class_id, students[0].id, local(9, 9)));
        refresh(&store, class_id, local(9, 12)).await;

        reset_season(&store, class_id, local(10, 8).with_timezone(&Utc))
            .await
            .unwrap();
        let result = refresh(&store, class_id, local(11, 8)).await;
        assert_eq!(result.summary.temperature, 0);
        assert_eq!(store.settings(class_id).unwrap().current_temperature, 0);
    }

    #[tokio::test]
    async fn reset_without_settings_is_an_error() {
        let store = MemoryStore::new();
        let class_id = Uuid::new_v4();
        let err = reset_season(&store, class_id, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::SettingsNotFound(id) if id == class_id));
    }

    #[tokio::test]
    async fn invalid_settings_are_not_saved() {
        let (store, class_id, _) = class_with_students(&[]);
        let bad = ClassAgitSettings {
            target_score: 50,
            current_temperature: 60,
            ..ClassAgitSettings::default()
        };
        assert!(update_settings(&store, class_id, &bad).await.is_err());
        assert_eq!(store.settings(class_id).unwrap().current_temperature, 10);

        let zero_target = ClassAgitSettings {
            target_score: 0,
            ..ClassAgitSettings::default()
        };
        assert!(validate_settings(&zero_target).is_err());
    }

    #[tokio::test]
    async fn history_lists_latest_season_first() {
        let (store, class_id, _) = class_with_students(&["김하늘"]);
        let first = local(9, 14).with_timezone(&Utc);
        reset_season(&store, class_id, first).await.unwrap();
        reset_season(&store, class_id, first + Duration::days(7)).await.unwrap();

        let history = store.season_history(class_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].archived_at > history[1].archived_at);
        assert_eq!(history[0].settings.last_reset_at, Some(first));
    }
}
