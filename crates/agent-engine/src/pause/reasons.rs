//! Pause reason catalog
//!
//! Read-mostly set of the reasons an agent may pause under. The catalog is
//! seeded from the external configuration store; the built-in defaults match
//! a typical deployment and give tests a realistic baseline.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One pause reason an agent can select
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseReason {
    /// Stable code agents select by, e.g. `LUNCH`
    pub code: String,
    /// Human label pushed to the PBX as the queue pause reason
    pub label: String,
    pub description: String,
    /// Auto-unpause bound; `None` means the pause is open-ended
    pub max_duration_minutes: Option<u32>,
    /// Display hint for dashboards
    pub color: String,
    pub sort_order: i32,
    pub is_active: bool,
}

impl PauseReason {
    pub fn new(code: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            label: label.into(),
            description: String::new(),
            max_duration_minutes: None,
            color: "#6c757d".to_string(),
            sort_order: 0,
            is_active: true,
        }
    }

    pub fn with_max_minutes(mut self, minutes: u32) -> Self {
        self.max_duration_minutes = Some(minutes);
        self
    }
}

/// In-memory reason catalog
#[derive(Default)]
pub struct ReasonCatalog {
    reasons: RwLock<HashMap<String, PauseReason>>,
}

impl ReasonCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog seeded with the stock reason set
    pub fn with_defaults() -> Self {
        let catalog = Self::new();
        for (code, label, minutes, color, order) in [
            ("BREAK", "Short Break", Some(5), "#ffc107", 1),
            ("LUNCH", "Lunch Break", Some(60), "#28a745", 2),
            ("MEETING", "Meeting", Some(120), "#17a2b8", 3),
            ("TRAINING", "Training", Some(180), "#6f42c1", 4),
            ("PERSONAL", "Personal Time", Some(30), "#fd7e14", 5),
            ("TECHNICAL", "Technical Issue", None, "#dc3545", 6),
        ] {
            let mut reason = PauseReason::new(code, label);
            reason.max_duration_minutes = minutes;
            reason.color = color.to_string();
            reason.sort_order = order;
            catalog.upsert(reason);
        }
        catalog
    }

    /// Insert or replace a reason
    pub fn upsert(&self, reason: PauseReason) {
        self.reasons.write().insert(reason.code.clone(), reason);
    }

    pub fn remove(&self, code: &str) -> Option<PauseReason> {
        self.reasons.write().remove(code)
    }

    /// Look up an active reason by code
    pub fn get(&self, code: &str) -> Option<PauseReason> {
        self.reasons
            .read()
            .get(code)
            .filter(|r| r.is_active)
            .cloned()
    }

    /// All active reasons in display order
    pub fn list(&self) -> Vec<PauseReason> {
        let mut reasons: Vec<PauseReason> = self
            .reasons
            .read()
            .values()
            .filter(|r| r.is_active)
            .cloned()
            .collect();
        reasons.sort_by_key(|r| r.sort_order);
        reasons
    }
}
