use std::fmt::Write;

use crate::models::{AgitSummary, RankingEntry, SeasonSnapshot, Settings};

const STAGE_NAMES: [&str; 5] = ["빈 터", "텐트", "오두막", "나무집", "비밀 아지트"];

pub fn stage_name(stage_level: u8) -> &'static str {
    let index = usize::from(stage_level.clamp(1, 5)) - 1;
    STAGE_NAMES[index]
}

pub fn build_report(
    class_label: &str,
    settings: &Settings,
    summary: &AgitSummary,
    ranking: &[RankingEntry],
    history: &[SeasonSnapshot],
) -> String {
    let resolved = settings.resolve();
    let mut output = String::new();

    let _ = writeln!(output, "# Clubhouse Report");
    let _ = writeln!(
        output,
        "Generated for {} on {} (counting activity since {})",
        class_label,
        summary.window.date,
        summary.window.start.format("%Y-%m-%d %H:%M UTC")
    );
    if !settings.is_configured() {
        let _ = writeln!(output);
        let _ = writeln!(output, "_No clubhouse settings saved for this class; defaults shown._");
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "## Temperature");
    let _ = writeln!(
        output,
        "- {} / {} degrees, stage {} ({})",
        summary.temperature,
        resolved.target_score,
        summary.stage_level,
        stage_name(summary.stage_level)
    );
    let _ = writeln!(
        output,
        "- Daily goals: {} post(s), {} comment(s), {} reaction(s)",
        resolved.activity_goals.post,
        resolved.activity_goals.comment,
        resolved.activity_goals.reaction
    );
    if !resolved.surprise_gift.is_empty() {
        let _ = writeln!(
            output,
            "- Surprise gift at {} degrees: {}",
            resolved.target_score, resolved.surprise_gift
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Today's Missions");
    if summary.per_student_status.is_empty() {
        let _ = writeln!(output, "No students or activity for this window.");
    } else {
        for status in &summary.per_student_status {
            let _ = writeln!(
                output,
                "- [{}] {}: {} post(s), {} comment(s), {} reaction(s)",
                if status.is_achieved { "x" } else { " " },
                status.student_name,
                status.counts.post,
                status.counts.comment,
                status.counts.reaction
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Board");
    for message in &summary.board_messages {
        let _ = writeln!(output, "- {message}");
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Season Honor Roll");
    let ranked: Vec<&RankingEntry> = ranking.iter().filter(|r| r.achieved_days > 0).collect();
    if ranked.is_empty() {
        let _ = writeln!(output, "Nobody has completed a mission this season yet.");
    } else {
        for (place, entry) in ranked.iter().enumerate().take(10) {
            let _ = writeln!(
                output,
                "{}. {} - {} day(s)",
                place + 1,
                entry.name,
                entry.achieved_days
            );
        }
    }

    if !history.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Past Seasons");
        for season in history.iter().take(5) {
            let champion = season
                .ranking
                .iter()
                .find(|r| r.achieved_days > 0)
                .map_or("nobody", |r| r.name.as_str());
            let _ = writeln!(
                output,
                "- Archived {}: {} / {} degrees, top writer {}",
                season.archived_at.format("%Y-%m-%d"),
                season.settings.current_temperature,
                season.settings.target_score,
                champion
            );
        }
    }

    output
}
