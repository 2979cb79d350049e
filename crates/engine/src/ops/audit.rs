use sea_orm::{ConnectionTrait, QueryFilter, QueryOrder, prelude::*};
use serde_json::Value;

use crate::{
    Actor, AuditLogEntry, ResultEngine,
    audit_log::{self, AuditAction, AuditRecord, AuditTargetType},
};

use super::Engine;

impl Engine {
    /// Appends one audit record inside the caller's transaction.
    #[allow(clippy::too_many_arguments)]
    pub(super) async fn record_audit<C: ConnectionTrait>(
        &self,
        db_tx: &C,
        action: AuditAction,
        actor: &Actor,
        management_id: &str,
        target_type: AuditTargetType,
        target_id: &str,
        metadata: Value,
    ) -> ResultEngine<()> {
        let mut metadata = metadata;
        if let (Some(role), Value::Object(map)) = (actor.role.as_ref(), &mut metadata) {
            map.insert("actor_role".to_string(), Value::String(role.clone()));
        }

        let record = AuditRecord {
            action,
            actor_uid: actor.uid.clone(),
            target_id: target_id.to_string(),
            target_type,
            management_id: management_id.to_string(),
            at: self.now(),
            metadata,
        }
        .validate()?;
        audit_log::ActiveModel::from(&record).insert(db_tx).await?;
        Ok(())
    }

    /// Audit trail of one target, oldest first.
    pub async fn audit_log(
        &self,
        management_id: &str,
        target_id: &str,
    ) -> ResultEngine<Vec<AuditLogEntry>> {
        let models = audit_log::Entity::find()
            .filter(audit_log::Column::ManagementId.eq(management_id.to_string()))
            .filter(audit_log::Column::TargetId.eq(target_id.to_string()))
            .order_by_asc(audit_log::Column::At)
            .order_by_asc(audit_log::Column::Id)
            .all(&self.database)
            .await?;
        models.into_iter().map(AuditLogEntry::try_from).collect()
    }
}
