use base64::Engine as _;
use chrono::{DateTime, Utc};
use sea_orm::{Condition, QueryFilter, QueryOrder, QuerySelect, prelude::*};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    Alert, AlertStatus, DueAllocation, EngineError, LedgerEntry, ResultEngine, alerts,
    ledger_entries,
};

use super::Engine;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct EntriesCursor {
    created_at: DateTime<Utc>,
    entry_id: String,
}

impl EntriesCursor {
    fn encode(&self) -> ResultEngine<String> {
        let bytes = serde_json::to_vec(self)
            .map_err(|_| EngineError::InvalidCursor("invalid entries cursor".to_string()))?;
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    fn decode(input: &str) -> ResultEngine<Self> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(input.as_bytes())
            .map_err(|_| EngineError::InvalidCursor("invalid entries cursor".to_string()))?;
        serde_json::from_slice::<Self>(&bytes)
            .map_err(|_| EngineError::InvalidCursor("invalid entries cursor".to_string()))
    }
}

impl Engine {
    /// Lists the entries of a unit with cursor-based pagination.
    ///
    /// Pagination is newest → older by `(created_at DESC, entry_id DESC)`.
    pub async fn list_unit_entries_page(
        &self,
        management_id: &str,
        unit_id: &str,
        limit: u64,
        cursor: Option<&str>,
    ) -> ResultEngine<(Vec<LedgerEntry>, Option<String>)> {
        self.require_unit(&self.database, management_id, unit_id).await?;

        let limit_plus_one = limit.saturating_add(1);
        let mut query = ledger_entries::Entity::find()
            .filter(ledger_entries::Column::ManagementId.eq(management_id.to_string()))
            .filter(ledger_entries::Column::UnitId.eq(unit_id.to_string()))
            .order_by_desc(ledger_entries::Column::CreatedAt)
            .order_by_desc(ledger_entries::Column::Id)
            .limit(limit_plus_one);

        if let Some(cursor) = cursor {
            let cursor = EntriesCursor::decode(cursor)?;
            query = query.filter(
                Condition::any()
                    .add(ledger_entries::Column::CreatedAt.lt(cursor.created_at))
                    .add(
                        Condition::all()
                            .add(ledger_entries::Column::CreatedAt.eq(cursor.created_at))
                            .add(ledger_entries::Column::Id.lt(cursor.entry_id)),
                    ),
            );
        }

        let rows: Vec<ledger_entries::Model> = query.all(&self.database).await?;
        let has_more = rows.len() as u64 > limit;

        let mut out: Vec<LedgerEntry> = Vec::with_capacity(rows.len());
        for model in rows.into_iter().take(limit as usize) {
            out.push(LedgerEntry::try_from(model)?);
        }

        let next_cursor = if has_more {
            out.last()
                .map(|entry| EntriesCursor {
                    created_at: entry.created_at,
                    entry_id: entry.id.to_string(),
                })
                .map(|c| c.encode())
                .transpose()?
        } else {
            None
        };

        Ok((out, next_cursor))
    }

    pub async fn allocations_for_due(
        &self,
        management_id: &str,
        due_id: Uuid,
    ) -> ResultEngine<Vec<DueAllocation>> {
        let due = self
            .require_entry(&self.database, management_id, &due_id.to_string())
            .await?;
        let rows = self.allocations_of_due(&self.database, &due.id).await?;
        rows.into_iter().map(DueAllocation::try_from).collect()
    }

    pub async fn allocations_for_payment(
        &self,
        management_id: &str,
        payment_entry_id: Uuid,
    ) -> ResultEngine<Vec<DueAllocation>> {
        let payment = self
            .require_entry(&self.database, management_id, &payment_entry_id.to_string())
            .await?;
        let rows = self.allocations_of_payment(&self.database, &payment.id).await?;
        rows.into_iter().map(DueAllocation::try_from).collect()
    }

    /// Open drift alerts of a management, oldest first.
    pub async fn open_alerts(&self, management_id: &str) -> ResultEngine<Vec<Alert>> {
        let models = alerts::Entity::find()
            .filter(alerts::Column::ManagementId.eq(management_id.to_string()))
            .filter(alerts::Column::Status.eq(AlertStatus::Open.as_str()))
            .order_by_asc(alerts::Column::CreatedAt)
            .order_by_asc(alerts::Column::Id)
            .all(&self.database)
            .await?;
        models.into_iter().map(Alert::try_from).collect()
    }

    /// Every alert raised for one target, newest first.
    pub async fn alerts_for_target(
        &self,
        management_id: &str,
        target_id: &str,
    ) -> ResultEngine<Vec<Alert>> {
        let models = alerts::Entity::find()
            .filter(alerts::Column::ManagementId.eq(management_id.to_string()))
            .filter(alerts::Column::TargetId.eq(target_id.to_string()))
            .order_by_desc(alerts::Column::CreatedAt)
            .order_by_desc(alerts::Column::Id)
            .all(&self.database)
            .await?;
        models.into_iter().map(Alert::try_from).collect()
    }
}
