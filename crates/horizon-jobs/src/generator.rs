//! Recurrence expansion and the stores it reads from and writes to.

use crate::error::{JobError, JobResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use horizon_core::{ItemId, TemplateId};
use serde::{Deserialize, Serialize};

/// A recurring task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringTemplate {
    pub id: TemplateId,
    pub title: String,

    /// First occurrence; later ones follow every `interval_secs`.
    pub anchor_at: DateTime<Utc>,
    pub interval_secs: i64,

    /// A sweep enqueues work once `generated_through` falls inside this
    /// many days from now.
    pub sync_horizon_days: u32,

    /// How far ahead of now generation runs when it is enqueued.
    pub generation_horizon_days: u32,

    /// Occurrences before this instant exist. Never moves backwards.
    pub generated_through: Option<DateTime<Utc>>,

    pub active: bool,
}

impl RecurringTemplate {
    /// Start of the not-yet-generated range.
    pub fn generation_cursor(&self) -> DateTime<Utc> {
        self.generated_through.unwrap_or(self.anchor_at)
    }

    /// Returns true if the generated range ends inside the sync horizon.
    /// A horizon past the end of representable time covers every cursor.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        self.active && days_after(now, self.sync_horizon_days).map_or(true, |horizon| self.generation_cursor() < horizon)
    }

    /// End of the range a sweep at `now` should cover.
    pub fn generation_target(&self, now: DateTime<Utc>) -> JobResult<DateTime<Utc>> {
        days_after(now, self.generation_horizon_days).ok_or_else(|| {
            JobError::Generation(format!(
                "template {} generation horizon of {} days is out of range",
                self.id, self.generation_horizon_days
            ))
        })
    }
}

fn days_after(now: DateTime<Utc>, days: u32) -> Option<DateTime<Utc>> {
    Duration::try_days(i64::from(days)).and_then(|d| now.checked_add_signed(d))
}

/// Per-occurrence override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskException {
    pub template_id: TemplateId,
    /// Original slot the exception applies to.
    pub occurs_at: DateTime<Utc>,
    pub kind: ExceptionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExceptionKind {
    /// No item for this slot.
    Skip,
    /// Item is due at `to` instead of the slot time.
    Reschedule { to: DateTime<Utc> },
}

/// A concrete occurrence produced by generation.
///
/// `(template_id, occurs_at)` is the natural key that makes inserts
/// idempotent across re-runs of the same window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: ItemId,
    pub template_id: TemplateId,
    pub title: String,
    pub occurs_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
}

/// Expands a template into occurrences over `[from, until)`.
///
/// Must be pure: the same inputs always yield the same slots.
pub trait TaskGenerator: Send + Sync {
    fn generate(
        &self,
        template: &RecurringTemplate,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        exceptions: &[TaskException],
    ) -> JobResult<Vec<TodoItem>>;
}

/// Fixed-interval recurrence: `anchor_at + k * interval_secs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntervalTaskGenerator;

impl TaskGenerator for IntervalTaskGenerator {
    fn generate(
        &self,
        template: &RecurringTemplate,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        exceptions: &[TaskException],
    ) -> JobResult<Vec<TodoItem>> {
        if template.interval_secs <= 0 {
            return Err(JobError::Generation(format!(
                "template {} has non-positive interval {}",
                template.id, template.interval_secs
            )));
        }
        if from >= until {
            return Ok(Vec::new());
        }

        let interval = template.interval_secs;
        let skipped = (from - template.anchor_at).num_seconds();
        // ceil division so the first slot is >= from
        let first_index = if skipped <= 0 {
            0
        } else {
            skipped / interval + i64::from(skipped % interval != 0)
        };

        let mut items = Vec::new();
        let mut index = first_index;
        // Slots only move forward, so one past representable time is past `until`.
        while let Some(slot) = slot_at(template, index) {
            if slot >= until {
                break;
            }
            if slot >= from {
                let exception = exceptions
                    .iter()
                    .find(|e| e.template_id == template.id && e.occurs_at == slot);
                match exception.map(|e| e.kind) {
                    Some(ExceptionKind::Skip) => {}
                    Some(ExceptionKind::Reschedule { to }) => items.push(item_for(template, slot, to)),
                    None => items.push(item_for(template, slot, slot)),
                }
            }
            index += 1;
        }

        Ok(items)
    }
}

fn slot_at(template: &RecurringTemplate, index: i64) -> Option<DateTime<Utc>> {
    let offset = index.checked_mul(template.interval_secs)?;
    template.anchor_at.checked_add_signed(Duration::try_seconds(offset)?)
}

fn item_for(template: &RecurringTemplate, occurs_at: DateTime<Utc>, due_at: DateTime<Utc>) -> TodoItem {
    TodoItem {
        id: ItemId::new(),
        template_id: template.id,
        title: template.title.clone(),
        occurs_at,
        due_at,
    }
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get_template(&self, id: TemplateId) -> JobResult<Option<RecurringTemplate>>;

    /// Active templates whose generated range ends inside their sync
    /// horizon, most behind first.
    async fn find_stale_templates(&self, now: DateTime<Utc>, limit: u32) -> JobResult<Vec<RecurringTemplate>>;

    /// Advances `generated_through`; a value behind the current one is ignored.
    async fn set_generated_through(&self, id: TemplateId, through: DateTime<Utc>) -> JobResult<()>;
}

#[async_trait]
pub trait ExceptionStore: Send + Sync {
    async fn find_exceptions(
        &self,
        template_id: TemplateId,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> JobResult<Vec<TaskException>>;
}

#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Inserts items, silently skipping any whose `(template_id, occurs_at)`
    /// already exists. Returns the number actually inserted.
    async fn batch_insert_ignore_conflict(&self, items: &[TodoItem]) -> JobResult<u64>;
}
