use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identifier of a record in the system of record.
///
/// This is the only key used to match rows across refreshes and stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("record id is empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Parse a cell from a stored ID column.
    ///
    /// Separator rows, placeholders and headers contain whitespace or
    /// punctuation and are rejected; IDs are `[A-Za-z0-9_-]+`.
    pub fn parse_cell(cell: &str) -> Option<Self> {
        let s = cell.trim();
        if s.is_empty() {
            return None;
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return None;
        }
        Some(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Who an entity store belongs to, as known by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRef {
    pub name: String,
    pub email: Option<String>,
    /// Pre-resolved identifier of the owner in the record source.
    pub crm_owner_id: Option<String>,
}

/// A record fetched from the system of record. Lives for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub owner_id: String,
    pub name: String,
    pub stage: String,
    /// Normalized scalar properties keyed by source property name.
    pub properties: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Record {
    /// Normalized property value, empty when absent.
    pub fn property(&self, name: &str) -> &str {
        self.properties.get(name).map(String::as_str).unwrap_or("")
    }
}

/// Cell color, stored as lowercase `#rrggbb`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Color(String);

impl Color {
    pub const WHITE: &'static str = "#ffffff";
    pub const BLACK: &'static str = "#000000";

    pub fn new(hex: impl AsRef<str>) -> Self {
        Self(hex.as_ref().trim().to_ascii_lowercase())
    }

    /// Default background for cells nobody has colored.
    pub fn neutral_background() -> Self {
        Self(Self::WHITE.to_string())
    }

    /// Default text color.
    pub fn neutral_foreground() -> Self {
        Self(Self::BLACK.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Human-set priority marker on a row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    #[default]
    None,
    Watch,
    Priority,
    Urgent,
    /// Anything a human typed that is not one of the known markers. Kept verbatim.
    Other(String),
}

impl Flag {
    pub fn parse_cell(cell: &str) -> Self {
        let s = cell.trim();
        match s.to_ascii_lowercase().as_str() {
            "" => Flag::None,
            "watch" => Flag::Watch,
            "priority" => Flag::Priority,
            "urgent" => Flag::Urgent,
            _ => Flag::Other(s.to_string()),
        }
    }

    pub fn as_cell(&self) -> String {
        match self {
            Flag::None => String::new(),
            Flag::Watch => "Watch".to_string(),
            Flag::Priority => "Priority".to_string(),
            Flag::Urgent => "Urgent".to_string(),
            Flag::Other(s) => s.clone(),
        }
    }
}

/// Human-authored data attached to a record id.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Annotation {
    /// Note slot name -> text.
    pub notes: BTreeMap<String, String>,
    pub flag: Flag,
    /// Per-column background colors of the row, in the layout the row was captured from.
    pub backgrounds: Vec<Color>,
    pub foregrounds: Vec<Color>,
}

/// One merged output row, ready to be written to a store.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub record: Record,
    pub cells: Vec<String>,
    pub backgrounds: Vec<Color>,
    pub foregrounds: Vec<Color>,
}

impl Row {
    pub fn record_id(&self) -> &RecordId {
        &self.record.id
    }
}

/// Caller identity for audit logging and access checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Actor {
    /// A person invoking an interactive command.
    User { email: String },
    /// Scheduler, CLI cron job, etc.
    System { name: String },
}

impl Actor {
    pub fn system(name: impl Into<String>) -> Self {
        Actor::System { name: name.into() }
    }

    pub fn user(email: impl Into<String>) -> Self {
        Actor::User {
            email: email.into(),
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::User { email } => write!(f, "user:{email}"),
            Actor::System { name } => write!(f, "system:{name}"),
        }
    }
}
