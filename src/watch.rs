use std::time::Duration;

use chrono::{FixedOffset, NaiveDate, Utc};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::time::MissedTickBehavior;
use tracing::info;
use uuid::Uuid;

use crate::models::AgitSummary;
use crate::service;
use crate::store::AgitStore;

pub const CHANGE_CHANNEL: &str = "agit_changes";

const DEBOUNCE: Duration = Duration::from_millis(250);

/// Whether a change notification may affect `class_id`. Payloads that are
/// not a class id are treated as relevant.
pub fn concerns_class(payload: &str, class_id: Uuid) -> bool {
    match Uuid::parse_str(payload.trim()) {
        Ok(changed) => changed == class_id,
        Err(_) => true,
    }
}

/// Remembers the last local date seen by the watcher.
#[derive(Debug, Clone, Copy)]
pub struct DateRollover {
    current: NaiveDate,
}

impl DateRollover {
    pub fn new(today: NaiveDate) -> Self {
        Self { current: today }
    }

    /// Returns the day that just closed when `today` moved past it.
    pub fn observe(&mut self, today: NaiveDate) -> Option<NaiveDate> {
        if today > self.current {
            let closed = self.current;
            self.current = today;
            Some(closed)
        } else {
            None
        }
    }
}

pub fn status_line(summary: &AgitSummary) -> String {
    format!(
        "[{}] temperature {} / stage {} / {} mission(s) today",
        summary.window.date, summary.temperature, summary.stage_level, summary.today_mission_count
    )
}

async fn recompute<S: AgitStore + ?Sized>(store: &S, class_id: Uuid, offset: FixedOffset) {
    let refresh = service::refresh(store, class_id, Utc::now().with_timezone(&offset)).await;
    println!("{}", status_line(&refresh.summary));
}

/// Recomputes the clubhouse whenever its data changes or the day rolls over,
/// until Ctrl-C. Each recompute settles any closed day still pending.
pub async fn run<S: AgitStore + ?Sized>(
    pool: &PgPool,
    store: &S,
    class_id: Uuid,
    offset: FixedOffset,
    tick: Duration,
) -> anyhow::Result<()> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(CHANGE_CHANNEL).await?;

    let mut rollover = DateRollover::new(Utc::now().with_timezone(&offset).date_naive());
    recompute(store, class_id, offset).await;
    info!(%class_id, channel = CHANGE_CHANNEL, "watching for clubhouse changes");

    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            notification = listener.recv() => {
                let notification = notification?;
                if !concerns_class(notification.payload(), class_id) {
                    continue;
                }
                // Drain the rest of a burst before recomputing once.
                while let Ok(next) = tokio::time::timeout(DEBOUNCE, listener.recv()).await {
                    next?;
                }
                recompute(store, class_id, offset).await;
            }
            _ = interval.tick() => {
                let today = Utc::now().with_timezone(&offset).date_naive();
                if let Some(closed) = rollover.observe(today) {
                    info!(%class_id, %closed, %today, "date rolled over");
                    recompute(store, class_id, offset).await;
                }
            }
            _ = &mut shutdown => {
                info!("shutting down watcher");
                return Ok(());
            }
        }
    }
}
