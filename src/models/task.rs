use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeSet;
use validator::{Validate, ValidationError};

use crate::error::AppError;

/// Calendar-date format accepted for `due_date`.
pub const DUE_DATE_FORMAT: &str = "%Y-%m-%d";

/// A task row as stored in `tasks`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, FromRow)]
pub struct Task {
    pub id: i32,
    pub title: String,
    pub description: String,
    pub due_date: Option<NaiveDate>,
    /// Free-form label, e.g. "High".
    pub priority: String,
    /// Location of the attachment, if any. Only the path is tracked here.
    pub file_path: Option<String>,
    /// User who created the task.
    pub created_by: i32,
}

/// One task-to-user edge from `tasks_users`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, FromRow)]
pub struct Assignment {
    pub task_id: i32,
    pub user_id: i32,
    /// User who created this particular edge. Fixed for the lifetime of the edge.
    pub sent_by: i32,
    pub assigned_at: DateTime<Utc>,
}

/// A task together with its current assignments.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TaskDetails {
    #[serde(flatten)]
    pub task: Task,
    pub user_ids: Vec<i32>,
    pub assignments: Vec<Assignment>,
}

impl TaskDetails {
    pub fn new(task: Task, mut assignments: Vec<Assignment>) -> Self {
        assignments.sort_by_key(|a| a.user_id);
        let user_ids = assignments.iter().map(|a| a.user_id).collect();
        Self {
            task,
            user_ids,
            assignments,
        }
    }
}

/// Validated scalar fields of a task, ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub due_date: Option<NaiveDate>,
    pub priority: String,
    pub file_path: Option<String>,
}

/// Payload for creating a task or replacing all of its attributes.
#[derive(Debug, Serialize, Deserialize, Clone, Validate)]
pub struct TaskInput {
    #[validate(length(min = 1, message = "Title is required"))]
    pub title: String,
    #[validate(length(min = 1, message = "Description is required"))]
    pub description: String,
    /// `YYYY-MM-DD`; empty or absent means no due date.
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub file_path: Option<String>,
    /// Desired recipients. Duplicates collapse.
    #[serde(default)]
    #[validate(custom = "validate_user_ids")]
    pub user_ids: Vec<i32>,
}

impl TaskInput {
    /// Validates the payload and splits it into the scalar row and the desired user set.
    pub fn into_parts(self) -> Result<(NewTask, BTreeSet<i32>), AppError> {
        self.validate()?;
        let due_date = parse_due_date(self.due_date.as_deref())?;
        let task = NewTask {
            title: self.title,
            description: self.description,
            due_date,
            priority: self.priority,
            file_path: self.file_path.filter(|path| !path.is_empty()),
        };
        Ok((task, self.user_ids.into_iter().collect()))
    }
}

/// A single scalar column change. The set of columns is closed; each variant names
/// exactly one column.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Title(String),
    Description(String),
    DueDate(Option<NaiveDate>),
    Priority(String),
    FilePath(Option<String>),
}

impl FieldUpdate {
    pub fn column(&self) -> &'static str {
        match self {
            FieldUpdate::Title(_) => "title",
            FieldUpdate::Description(_) => "description",
            FieldUpdate::DueDate(_) => "due_date",
            FieldUpdate::Priority(_) => "priority",
            FieldUpdate::FilePath(_) => "file_path",
        }
    }

    /// Applies the change to an in-memory row.
    pub fn apply(&self, task: &mut Task) {
        match self {
            FieldUpdate::Title(v) => task.title = v.clone(),
            FieldUpdate::Description(v) => task.description = v.clone(),
            FieldUpdate::DueDate(v) => task.due_date = *v,
            FieldUpdate::Priority(v) => task.priority = v.clone(),
            FieldUpdate::FilePath(v) => task.file_path = v.clone(),
        }
    }
}

/// Payload for a partial update. Absent fields are left unchanged; unknown keys are
/// rejected at deserialization.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    /// `YYYY-MM-DD`, or an empty string to clear the date.
    pub due_date: Option<String>,
    pub priority: Option<String>,
    /// Empty string clears the attachment path.
    pub file_path: Option<String>,
    /// Replaces the whole assignment set when present.
    pub user_ids: Option<Vec<i32>>,
}

impl TaskPatch {
    pub fn into_parts(self) -> Result<(Vec<FieldUpdate>, Option<BTreeSet<i32>>), AppError> {
        let mut updates = Vec::new();

        if let Some(title) = self.title {
            if title.is_empty() {
                return Err(AppError::ValidationError("Title is required".into()));
            }
            updates.push(FieldUpdate::Title(title));
        }
        if let Some(description) = self.description {
            if description.is_empty() {
                return Err(AppError::ValidationError("Description is required".into()));
            }
            updates.push(FieldUpdate::Description(description));
        }
        if let Some(due_date) = self.due_date {
            updates.push(FieldUpdate::DueDate(parse_due_date(Some(&due_date))?));
        }
        if let Some(priority) = self.priority {
            updates.push(FieldUpdate::Priority(priority));
        }
        if let Some(file_path) = self.file_path {
            updates.push(FieldUpdate::FilePath(Some(file_path).filter(|p| !p.is_empty())));
        }

        let user_ids = match self.user_ids {
            Some(ids) => {
                validate_user_ids(&ids).map_err(|_| {
                    AppError::ValidationError("Invalid user_ids format".into())
                })?;
                Some(ids.into_iter().collect())
            }
            None => None,
        };

        Ok((updates, user_ids))
    }
}

/// Parses an optional `YYYY-MM-DD` string. Empty input means "no date".
pub fn parse_due_date(raw: Option<&str>) -> Result<Option<NaiveDate>, AppError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => NaiveDate::parse_from_str(value, DUE_DATE_FORMAT)
            .map(Some)
            .map_err(|_| AppError::ValidationError("Invalid due date format".into())),
    }
}

fn validate_user_ids(user_ids: &Vec<i32>) -> Result<(), ValidationError> {
    if user_ids.iter().any(|id| *id <= 0) {
        let mut err = ValidationError::new("user_ids");
        err.message = Some("Invalid user_ids format".into());
        return Err(err);
    }
    Ok(())
}
