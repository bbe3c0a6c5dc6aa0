//! Core domain model for the designated materials registry.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "emreg-core";

/// Format of the inclusion date column published by the registry (`25.06.2020`).
pub const INCLUSION_DATE_FORMAT: &str = "%d.%m.%Y";

/// Store-assigned technical key of a material row.
pub type MaterialId = i32;

/// Local view of the registry: material name -> store identifier.
pub type LocalSnapshot = HashMap<String, MaterialId>;

/// Remote view of the registry: material name -> raw inclusion date text.
pub type RemoteSnapshot = HashMap<String, String>;

/// Persisted registry row. The name is the business key; `id` is only used to delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialRecord {
    pub id: MaterialId,
    pub name: String,
    pub inclusion_date: Option<NaiveDate>,
}

/// A row to be inserted; the store assigns the identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NewMaterial {
    pub name: String,
    pub inclusion_date: Option<NaiveDate>,
}

impl NewMaterial {
    /// Builds an insertable row from remote text. Empty or unparsable dates leave the date unset.
    pub fn from_remote(name: impl Into<String>, date_text: &str) -> Self {
        Self {
            name: name.into(),
            inclusion_date: parse_inclusion_date(date_text),
        }
    }
}

/// One parsed row of the published CSV, before it is folded into a [`RemoteSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    pub inclusion_date: String,
}

/// Parses `day.month.year`; returns `None` for empty or malformed text.
pub fn parse_inclusion_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(text, INCLUSION_DATE_FORMAT).ok()
}

/// Mutation computed by one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilePlan {
    pub to_create: Vec<NewMaterial>,
    pub to_delete: Vec<MaterialId>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_delete.is_empty()
    }
}
