use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use uuid::Uuid;

use crate::models::{
    ActivityCounts, ActivityEvent, AggregationWindow, AgitSummary, ClassAgitSettings,
    DailyAchievement, Student,
};

pub const EMPTY_BOARD_MESSAGE: &str =
    "아직 오늘의 미션을 달성한 친구가 없어요. 첫 번째 주인공이 되어 보세요!";

/// Instant at which `date` begins in the given offset.
pub fn start_of_day(date: NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    let local_midnight = date.and_time(NaiveTime::MIN);
    let shift = Duration::seconds(i64::from(offset.local_minus_utc()));
    Utc.from_utc_datetime(&(local_midnight - shift))
}

/// Today's window, shortened to start at `last_reset_at` when a season was
/// reset earlier the same day.
pub fn aggregation_window(
    now: DateTime<FixedOffset>,
    last_reset_at: Option<DateTime<Utc>>,
) -> AggregationWindow {
    let date = now.date_naive();
    let day_start = start_of_day(date, *now.offset());
    let end = day_start + Duration::days(1);

    let start = match last_reset_at {
        Some(reset_at) if reset_at > day_start => reset_at,
        _ => day_start,
    };

    AggregationWindow { date, start, end }
}

pub fn tally(
    events: &[ActivityEvent],
    window: &AggregationWindow,
) -> HashMap<Uuid, ActivityCounts> {
    let mut counts: HashMap<Uuid, ActivityCounts> = HashMap::new();

    for event in events {
        if !window.contains(event.occurred_at) {
            continue;
        }
        counts.entry(event.student_id).or_default().bump(event.kind);
    }

    counts
}

pub fn temperature(baseline: i32, target_score: i32, mission_count: i32) -> i32 {
    baseline.saturating_add(mission_count).min(target_score)
}

pub fn stage_level(temperature: i32, target_score: i32) -> u8 {
    if target_score <= 0 {
        return 5;
    }

    let scaled = i64::from(temperature) * 4;
    let target = i64::from(target_score);
    match scaled {
        s if s >= target * 4 => 5,
        s if s >= target * 3 => 4,
        s if s >= target * 2 => 3,
        s if s >= target => 2,
        _ => 1,
    }
}

pub fn board_message(student_name: &str) -> String {
    format!(
        "{student_name} 학생이 오늘의 글쓰기 미션을 달성했어요! 아지트 온도가 1도 올라갔어요."
    )
}

/// Derives the class summary for one window.
///
/// `already_honored` lists students recorded on the honor roll for this
/// window; their credit stands even when the live tally no longer meets the
/// goals, so a goal change never lowers the temperature mid-day.
pub fn aggregate(
    settings: &ClassAgitSettings,
    window: &AggregationWindow,
    events: &[ActivityEvent],
    roster: &[Student],
    already_honored: &[Uuid],
) -> AgitSummary {
    let counts = tally(events, window);
    let honored: HashSet<Uuid> = already_honored.iter().copied().collect();
    let names: HashMap<Uuid, &str> = roster.iter().map(|s| (s.id, s.name.as_str())).collect();

    let mut student_ids: Vec<Uuid> = roster.iter().map(|s| s.id).collect();
    let mut seen: HashSet<Uuid> = student_ids.iter().copied().collect();
    for id in counts.keys().chain(honored.iter()) {
        if seen.insert(*id) {
            student_ids.push(*id);
        }
    }

    let mut per_student_status: Vec<DailyAchievement> = student_ids
        .into_iter()
        .map(|student_id| {
            let student_counts = counts.get(&student_id).copied().unwrap_or_default();
            let earned =
                student_counts.total() > 0 && settings.activity_goals.is_met_by(&student_counts);
            DailyAchievement {
                student_id,
                student_name: names
                    .get(&student_id)
                    .map_or_else(|| student_id.to_string(), |name| (*name).to_string()),
                counts: student_counts,
                is_achieved: earned || honored.contains(&student_id),
            }
        })
        .collect();
    per_student_status.sort_by(|a, b| {
        a.student_name
            .cmp(&b.student_name)
            .then_with(|| a.student_id.cmp(&b.student_id))
    });

    let achieved: Vec<&DailyAchievement> =
        per_student_status.iter().filter(|s| s.is_achieved).collect();
    let today_mission_count = i32::try_from(achieved.len()).unwrap_or(i32::MAX);
    let achieved_students = achieved.iter().map(|s| s.student_id).collect();

    let mut board_messages: Vec<String> =
        achieved.iter().map(|s| board_message(&s.student_name)).collect();
    if board_messages.is_empty() {
        board_messages.push(EMPTY_BOARD_MESSAGE.to_string());
    }

    let temperature = temperature(
        settings.current_temperature,
        settings.target_score,
        today_mission_count,
    );

    AgitSummary {
        window: *window,
        temperature,
        stage_level: stage_level(temperature, settings.target_score),
        today_mission_count,
        per_student_status,
        achieved_students,
        board_messages,
    }
}
