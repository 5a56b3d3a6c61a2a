use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Post,
    Comment,
    Reaction,
}

impl ActivityKind {
    pub const ALL: [ActivityKind; 3] = [Self::Post, Self::Comment, Self::Reaction];

    /// Table holding this kind of activity.
    pub fn table(self) -> &'static str {
        match self {
            Self::Post => "posts",
            Self::Comment => "comments",
            Self::Reaction => "reactions",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Post => "post",
            Self::Comment => "comment",
            Self::Reaction => "reaction",
        };
        f.write_str(label)
    }
}

impl FromStr for ActivityKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "post" | "posts" => Ok(Self::Post),
            "comment" | "comments" => Ok(Self::Comment),
            "reaction" | "reactions" => Ok(Self::Reaction),
            other => Err(format!("unknown activity kind `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEvent {
    pub kind: ActivityKind,
    pub student_id: Uuid,
    pub class_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCounts {
    pub post: u32,
    pub comment: u32,
    pub reaction: u32,
}

impl ActivityCounts {
    pub fn bump(&mut self, kind: ActivityKind) {
        let slot = match kind {
            ActivityKind::Post => &mut self.post,
            ActivityKind::Comment => &mut self.comment,
            ActivityKind::Reaction => &mut self.reaction,
        };
        *slot = slot.saturating_add(1);
    }

    pub fn total(&self) -> u32 {
        self.post
            .saturating_add(self.comment)
            .saturating_add(self.reaction)
    }
}

/// Per-activity counts a student must reach in one window to complete the mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityGoals {
    pub post: u32,
    pub comment: u32,
    pub reaction: u32,
}

impl Default for ActivityGoals {
    fn default() -> Self {
        Self {
            post: 1,
            comment: 5,
            reaction: 5,
        }
    }
}

impl ActivityGoals {
    /// All three thresholds must be reached; there is no partial credit.
    pub fn is_met_by(&self, counts: &ActivityCounts) -> bool {
        counts.post >= self.post
            && counts.comment >= self.comment
            && counts.reaction >= self.reaction
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassAgitSettings {
    pub is_enabled: bool,
    pub target_score: i32,
    pub current_temperature: i32,
    pub last_reset_at: Option<DateTime<Utc>>,
    pub activity_goals: ActivityGoals,
    pub surprise_gift: String,
}

impl Default for ClassAgitSettings {
    fn default() -> Self {
        Self {
            is_enabled: false,
            target_score: 100,
            current_temperature: 0,
            last_reset_at: None,
            activity_goals: ActivityGoals::default(),
            surprise_gift: String::new(),
        }
    }
}

/// Settings as read from the store. A class without a settings row runs on
/// the built-in defaults instead of failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settings {
    Configured(ClassAgitSettings),
    Default,
}

impl Settings {
    pub fn resolve(&self) -> ClassAgitSettings {
        match self {
            Self::Configured(settings) => settings.clone(),
            Self::Default => ClassAgitSettings::default(),
        }
    }

    pub fn is_configured(&self) -> bool {
        matches!(self, Self::Configured(_))
    }
}

impl From<Option<ClassAgitSettings>> for Settings {
    fn from(value: Option<ClassAgitSettings>) -> Self {
        value.map_or(Self::Default, Self::Configured)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Student {
    pub id: Uuid,
    pub class_id: Uuid,
    pub name: String,
}

/// Half-open interval `[start, end)` of one local calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationWindow {
    pub date: NaiveDate,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl AggregationWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyAchievement {
    pub student_id: Uuid,
    pub student_name: String,
    pub counts: ActivityCounts,
    pub is_achieved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgitSummary {
    pub window: AggregationWindow,
    pub temperature: i32,
    pub stage_level: u8,
    pub today_mission_count: i32,
    pub per_student_status: Vec<DailyAchievement>,
    pub achieved_students: Vec<Uuid>,
    pub board_messages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HonorRollEntry {
    pub student_id: Uuid,
    pub class_id: Uuid,
    pub achieved_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingEntry {
    pub student_id: Uuid,
    pub name: String,
    pub achieved_days: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeasonSnapshot {
    pub id: Uuid,
    pub class_id: Uuid,
    pub archived_at: DateTime<Utc>,
    pub settings: ClassAgitSettings,
    pub ranking: Vec<RankingEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_activity_kinds_loosely() {
        assert_eq!("Post".parse::<ActivityKind>(), Ok(ActivityKind::Post));
        assert_eq!(" comments ".parse::<ActivityKind>(), Ok(ActivityKind::Comment));
        assert_eq!("reaction".parse::<ActivityKind>(), Ok(ActivityKind::Reaction));
        assert!("like".parse::<ActivityKind>().is_err());
    }

    #[test]
    fn missing_settings_resolve_to_defaults() {
        let settings = Settings::from(None);
        assert!(!settings.is_configured());

        let resolved = settings.resolve();
        assert!(!resolved.is_enabled);
        assert_eq!(resolved.target_score, 100);
        assert_eq!(resolved.current_temperature, 0);
        assert_eq!(resolved.activity_goals, ActivityGoals { post: 1, comment: 5, reaction: 5 });
    }

    #[test]
    fn goals_require_every_threshold() {
        let goals = ActivityGoals::default();
        let short_comment = ActivityCounts { post: 1, comment: 4, reaction: 5 };
        let exact = ActivityCounts { post: 1, comment: 5, reaction: 5 };

        assert!(!goals.is_met_by(&short_comment));
        assert!(goals.is_met_by(&exact));
    }

    #[test]
    fn settings_serialize_in_camel_case() {
        let json = serde_json::to_value(ClassAgitSettings::default()).unwrap();
        assert_eq!(json["targetScore"], 100);
        assert_eq!(json["activityGoals"]["comment"], 5);
        assert!(json["lastResetAt"].is_null());
    }
}
