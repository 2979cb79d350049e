//! Drift alerts.
//!
//! An [`Alert`] is opened when a cached aggregate disagrees with its
//! canonical recomputation, and resolved by the rebuild that closes the gap.

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EngineError, util::parse_uuid};

/// Reason recorded on alerts closed by a rebuild.
pub const REBUILD_AUTO_RESOLVE: &str = "REBUILD_AUTO_RESOLVE";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    BalanceDrift,
    DueDrift,
}

impl AlertType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BalanceDrift => "BALANCE_DRIFT",
            Self::DueDrift => "DUE_DRIFT",
        }
    }
}

impl TryFrom<&str> for AlertType {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "BALANCE_DRIFT" => Ok(Self::BalanceDrift),
            "DUE_DRIFT" => Ok(Self::DueDrift),
            other => Err(EngineError::InvalidEntry(format!(
                "invalid alert type: {other}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
        }
    }
}

impl TryFrom<&str> for AlertStatus {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "open" => Ok(Self::Open),
            "resolved" => Ok(Self::Resolved),
            other => Err(EngineError::InvalidEntry(format!(
                "invalid alert status: {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub management_id: String,
    pub unit_id: String,
    pub alert_type: AlertType,
    /// Unit id for balance drift, due id for due drift.
    pub target_id: String,
    pub status: AlertStatus,
    pub cached_minor: i64,
    pub canonical_minor: i64,
    /// `cached_minor - canonical_minor`.
    pub diff_minor: i64,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "alerts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub management_id: String,
    pub unit_id: String,
    pub alert_type: String,
    pub target_id: String,
    pub status: String,
    pub cached_minor: i64,
    pub canonical_minor: i64,
    pub diff_minor: i64,
    pub created_at: DateTimeUtc,
    pub resolved_at: Option<DateTimeUtc>,
    pub resolved_reason: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for Alert {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&model.id, "alert")?,
            alert_type: AlertType::try_from(model.alert_type.as_str())?,
            status: AlertStatus::try_from(model.status.as_str())?,
            management_id: model.management_id,
            unit_id: model.unit_id,
            target_id: model.target_id,
            cached_minor: model.cached_minor,
            canonical_minor: model.canonical_minor,
            diff_minor: model.diff_minor,
            created_at: model.created_at,
            resolved_at: model.resolved_at,
            resolved_reason: model.resolved_reason,
        })
    }
}
