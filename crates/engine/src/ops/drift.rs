use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveValue, ConnectionTrait, DatabaseTransaction, QueryFilter, QueryOrder, QuerySelect,
    prelude::*, sea_query::Expr,
};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    Actor, AlertStatus, AlertType, BalanceDriftReport, DueAggregate, DueDriftReport,
    DueRebuildResult, EngineError, EntryType, REBUILD_AUTO_RESOLVE, RebuildResult, ResultEngine,
    SweepReport, alerts,
    audit_log::{AuditAction, AuditTargetType},
    ledger_entries, unit_balances,
    util::{normalize_required_id, parse_uuid},
};

use super::Engine;

/// Values recorded on a drift alert.
struct DriftObservation<'a> {
    alert_type: AlertType,
    unit_id: &'a str,
    target_id: &'a str,
    cached_minor: i64,
    canonical_minor: i64,
}

impl Engine {
    /// Opens an alert for the target, or refreshes the open one.
    async fn upsert_alert<C: ConnectionTrait>(
        &self,
        db_tx: &C,
        management_id: &str,
        seen: DriftObservation<'_>,
    ) -> ResultEngine<()> {
        let diff_minor = seen.cached_minor.saturating_sub(seen.canonical_minor);
        let open = alerts::Entity::find()
            .filter(alerts::Column::ManagementId.eq(management_id.to_string()))
            .filter(alerts::Column::AlertType.eq(seen.alert_type.as_str()))
            .filter(alerts::Column::TargetId.eq(seen.target_id.to_string()))
            .filter(alerts::Column::Status.eq(AlertStatus::Open.as_str()))
            .one(db_tx)
            .await?;

        match open {
            Some(alert) => {
                alerts::ActiveModel {
                    id: ActiveValue::Unchanged(alert.id),
                    cached_minor: ActiveValue::Set(seen.cached_minor),
                    canonical_minor: ActiveValue::Set(seen.canonical_minor),
                    diff_minor: ActiveValue::Set(diff_minor),
                    ..Default::default()
                }
                .update(db_tx)
                .await?;
            }
            None => {
                alerts::ActiveModel {
                    id: ActiveValue::Set(Uuid::new_v4().to_string()),
                    management_id: ActiveValue::Set(management_id.to_string()),
                    unit_id: ActiveValue::Set(seen.unit_id.to_string()),
                    alert_type: ActiveValue::Set(seen.alert_type.as_str().to_string()),
                    target_id: ActiveValue::Set(seen.target_id.to_string()),
                    status: ActiveValue::Set(AlertStatus::Open.as_str().to_string()),
                    cached_minor: ActiveValue::Set(seen.cached_minor),
                    canonical_minor: ActiveValue::Set(seen.canonical_minor),
                    diff_minor: ActiveValue::Set(diff_minor),
                    created_at: ActiveValue::Set(self.now()),
                    resolved_at: ActiveValue::Set(None),
                    resolved_reason: ActiveValue::Set(None),
                }
                .insert(db_tx)
                .await?;
            }
        }
        warn!(
            management_id,
            alert_type = seen.alert_type.as_str(),
            target_id = seen.target_id,
            cached_minor = seen.cached_minor,
            canonical_minor = seen.canonical_minor,
            diff_minor,
            "drift detected"
        );
        Ok(())
    }

    /// Resolves the open alerts of a target. Returns how many were closed.
    async fn resolve_alerts<C: ConnectionTrait>(
        &self,
        db_tx: &C,
        management_id: &str,
        alert_type: AlertType,
        target_id: &str,
    ) -> ResultEngine<u32> {
        let result = alerts::Entity::update_many()
            .col_expr(
                alerts::Column::Status,
                Expr::value(AlertStatus::Resolved.as_str()),
            )
            .col_expr(alerts::Column::ResolvedAt, Expr::value(Some(self.now())))
            .col_expr(
                alerts::Column::ResolvedReason,
                Expr::value(Some(REBUILD_AUTO_RESOLVE.to_string())),
            )
            .filter(alerts::Column::ManagementId.eq(management_id.to_string()))
            .filter(alerts::Column::AlertType.eq(alert_type.as_str()))
            .filter(alerts::Column::TargetId.eq(target_id.to_string()))
            .filter(alerts::Column::Status.eq(AlertStatus::Open.as_str()))
            .exec(db_tx)
            .await?;
        Ok(u32::try_from(result.rows_affected).unwrap_or(u32::MAX))
    }

    fn ensure_cooled_down(&self, last: Option<DateTime<Utc>>, target: &str) -> ResultEngine<()> {
        if let Some(last) = last {
            let cooldown = self.config.rebuild_cooldown();
            if self.now().signed_duration_since(last) < cooldown {
                return Err(EngineError::RebuildThrottled(format!(
                    "{target} was rebuilt at {last}, retry later or force"
                )));
            }
        }
        Ok(())
    }

    /// Compares the cached balance of a unit with the ledger. A mismatch
    /// opens (or refreshes) a `BALANCE_DRIFT` alert.
    pub async fn check_unit_balance_drift(
        &self,
        management_id: &str,
        unit_id: &str,
    ) -> ResultEngine<BalanceDriftReport> {
        let management_id = normalize_required_id(management_id, "management")?;
        let unit_id = normalize_required_id(unit_id, "unit")?;

        self.with_retry("check_unit_balance_drift", |engine, db_tx| {
            let (management_id, unit_id) = (management_id.clone(), unit_id.clone());
            Box::pin(async move {
                engine.require_unit(db_tx, &management_id, &unit_id).await?;
                let canonical = engine
                    .canonical_balance(db_tx, &management_id, &unit_id)
                    .await?;
                let cached = unit_balances::Entity::find_by_id((
                    management_id.clone(),
                    unit_id.clone(),
                ))
                .one(db_tx)
                .await?;

                let drifted = match &cached {
                    Some(cached) => crate::CanonicalBalance::from(cached) != canonical,
                    None => canonical.balance_minor != 0,
                };
                let cached_minor = cached.as_ref().map(|c| c.balance_minor);
                let report = BalanceDriftReport {
                    drifted,
                    cached_minor,
                    canonical_minor: canonical.balance_minor,
                    diff_minor: cached_minor
                        .unwrap_or(0)
                        .saturating_sub(canonical.balance_minor),
                };
                if drifted {
                    engine
                        .upsert_alert(
                            db_tx,
                            &management_id,
                            DriftObservation {
                                alert_type: AlertType::BalanceDrift,
                                unit_id: &unit_id,
                                target_id: &unit_id,
                                cached_minor: cached_minor.unwrap_or(0),
                                canonical_minor: canonical.balance_minor,
                            },
                        )
                        .await?;
                }
                Ok(report)
            })
        })
        .await
    }

    /// Overwrites the balance cache of a unit with the canonical sums and
    /// resolves its open `BALANCE_DRIFT` alerts.
    ///
    /// Without `force`, a rebuild inside the configured cooldown of the
    /// previous one fails with `RebuildThrottled`. Every rebuild is audited;
    /// one that finds the cache already canonical is recorded with
    /// `noop: true` and does not restart the cooldown.
    pub async fn rebuild_unit_balance(
        &self,
        management_id: &str,
        unit_id: &str,
        force: bool,
        actor: &Actor,
    ) -> ResultEngine<RebuildResult> {
        let management_id = normalize_required_id(management_id, "management")?;
        let unit_id = normalize_required_id(unit_id, "unit")?;

        self.with_retry("rebuild_unit_balance", |engine, db_tx| {
            let (management_id, unit_id) = (management_id.clone(), unit_id.clone());
            let actor = actor.clone();
            Box::pin(async move {
                engine
                    .rebuild_balance_in_tx(db_tx, &management_id, &unit_id, force, &actor)
                    .await
            })
        })
        .await
    }

    async fn rebuild_balance_in_tx(
        &self,
        db_tx: &DatabaseTransaction,
        management_id: &str,
        unit_id: &str,
        force: bool,
        actor: &Actor,
    ) -> ResultEngine<RebuildResult> {
        self.require_unit(db_tx, management_id, unit_id).await?;
        let cached =
            unit_balances::Entity::find_by_id((management_id.to_string(), unit_id.to_string()))
                .one(db_tx)
                .await?;
        if !force {
            self.ensure_cooled_down(cached.as_ref().and_then(|c| c.rebuilt_at), unit_id)?;
        }

        let canonical = self
            .canonical_balance(db_tx, management_id, unit_id)
            .await?;
        let before = cached.as_ref().map(crate::CanonicalBalance::from);
        let noop = before == Some(canonical);
        if !noop {
            let claim = match cached {
                Some(model) => model,
                None => self.claim_unit(db_tx, management_id, unit_id).await?,
            };
            self.commit_balance(db_tx, &claim, canonical, Some(&actor.uid))
                .await?;
        }

        let alerts_resolved = self
            .resolve_alerts(db_tx, management_id, AlertType::BalanceDrift, unit_id)
            .await?;
        self.record_audit(
            db_tx,
            AuditAction::RebuildBalance,
            actor,
            management_id,
            AuditTargetType::UnitBalance,
            unit_id,
            json!({
                "before_minor": before.map(|b| b.balance_minor),
                "balance_minor": canonical.balance_minor,
                "posted_debit_minor": canonical.posted_debit_minor,
                "posted_credit_minor": canonical.posted_credit_minor,
                "entry_count": canonical.entry_count,
                "forced": force,
                "noop": noop,
                "alerts_resolved": alerts_resolved,
            }),
        )
        .await?;

        info!(
            management_id,
            unit_id,
            balance_minor = canonical.balance_minor,
            noop,
            alerts_resolved,
            "unit balance rebuilt"
        );
        Ok(RebuildResult {
            balance_minor: canonical.balance_minor,
            posted_debit_minor: canonical.posted_debit_minor,
            posted_credit_minor: canonical.posted_credit_minor,
            entry_count: canonical.entry_count,
            alerts_resolved,
            noop,
        })
    }

    /// Replays the newest `sample_limit` dues of a management and opens a
    /// `DUE_DRIFT` alert for every due whose stored aggregate disagrees.
    pub async fn check_due_drift(
        &self,
        management_id: &str,
        sample_limit: u64,
    ) -> ResultEngine<DueDriftReport> {
        let management_id = normalize_required_id(management_id, "management")?;
        if sample_limit == 0 {
            return Ok(DueDriftReport::default());
        }

        self.with_retry("check_due_drift", |engine, db_tx| {
            let management_id = management_id.clone();
            Box::pin(async move {
                let dues = ledger_entries::Entity::find()
                    .filter(ledger_entries::Column::ManagementId.eq(management_id.clone()))
                    .filter(ledger_entries::Column::EntryType.eq(EntryType::Debit.as_str()))
                    .filter(ledger_entries::Column::DueTotalMinor.is_not_null())
                    .order_by_desc(ledger_entries::Column::CreatedAt)
                    .order_by_desc(ledger_entries::Column::Id)
                    .limit(sample_limit)
                    .all(db_tx)
                    .await?;

                let mut report = DueDriftReport {
                    checked: u32::try_from(dues.len()).unwrap_or(u32::MAX),
                    ..DueDriftReport::default()
                };
                for due in &dues {
                    let replayed = engine.replay_due(db_tx, due).await?;
                    if due.due_aggregate()? == Some(replayed) {
                        continue;
                    }
                    engine
                        .upsert_alert(
                            db_tx,
                            &management_id,
                            DriftObservation {
                                alert_type: AlertType::DueDrift,
                                unit_id: &due.unit_id,
                                target_id: &due.id,
                                cached_minor: due.due_allocated_minor.unwrap_or(0),
                                canonical_minor: replayed.allocated_minor,
                            },
                        )
                        .await?;
                    report.drifted = true;
                    report.due_ids.push(parse_uuid(&due.id, "due")?);
                }
                Ok(report)
            })
        })
        .await
    }

    /// Rewrites the derived fields of one due from its allocations and
    /// resolves its open `DUE_DRIFT` alerts.
    ///
    /// Throttling and auditing follow [`Engine::rebuild_unit_balance`].
    pub async fn rebuild_due_aggregates(
        &self,
        management_id: &str,
        due_id: Uuid,
        force: bool,
        actor: &Actor,
    ) -> ResultEngine<DueRebuildResult> {
        let management_id = normalize_required_id(management_id, "management")?;
        let due_id = due_id.to_string();

        self.with_retry("rebuild_due_aggregates", |engine, db_tx| {
            let (management_id, due_id) = (management_id.clone(), due_id.clone());
            let actor = actor.clone();
            Box::pin(async move {
                let due = engine
                    .find_entry(db_tx, &management_id, &due_id)
                    .await?
                    .filter(ledger_entries::Model::is_due)
                    .ok_or_else(|| EngineError::KeyNotFound("due not exists".to_string()))?;
                if !force {
                    engine.ensure_cooled_down(due.aggregates_rebuilt_at, &due_id)?;
                }

                let replayed: DueAggregate = engine.replay_due(db_tx, &due).await?;
                let before = due.due_aggregate()?;
                let noop = before == Some(replayed);
                if !noop {
                    engine.sync_due(db_tx, &due, Some(engine.now())).await?;
                }
                let alerts_resolved = engine
                    .resolve_alerts(db_tx, &management_id, AlertType::DueDrift, &due_id)
                    .await?;

                engine
                    .record_audit(
                        db_tx,
                        AuditAction::RebuildDue,
                        &actor,
                        &management_id,
                        AuditTargetType::LedgerEntry,
                        &due_id,
                        json!({
                            "unit_id": due.unit_id,
                            "before_allocated_minor": before.map(|b| b.allocated_minor),
                            "due_allocated_minor": replayed.allocated_minor,
                            "due_outstanding_minor": replayed.outstanding_minor,
                            "due_status": replayed.status.as_str(),
                            "forced": force,
                            "noop": noop,
                            "alerts_resolved": alerts_resolved,
                        }),
                    )
                    .await?;

                info!(
                    management_id,
                    due_id,
                    due_outstanding_minor = replayed.outstanding_minor,
                    noop,
                    alerts_resolved,
                    "due aggregates rebuilt"
                );
                Ok(DueRebuildResult {
                    due_allocated_minor: replayed.allocated_minor,
                    due_outstanding_minor: replayed.outstanding_minor,
                    due_status: replayed.status,
                    noop,
                    alerts_resolved,
                })
            })
        })
        .await
    }

    /// Checks every registered unit and a sample of dues, optionally
    /// rebuilding what drifted. Throttled rebuilds are skipped.
    pub async fn sweep_drift(
        &self,
        management_id: &str,
        sample_limit: u64,
        auto_rebuild: bool,
        actor: &Actor,
    ) -> ResultEngine<SweepReport> {
        let mut report = SweepReport::default();

        for unit in self.list_units(management_id).await? {
            report.units_checked += 1;
            let drift = self
                .check_unit_balance_drift(management_id, &unit.unit_id)
                .await?;
            if !drift.drifted {
                continue;
            }
            report.drifted_units.push(unit.unit_id.clone());
            if auto_rebuild {
                match self
                    .rebuild_unit_balance(management_id, &unit.unit_id, false, actor)
                    .await
                {
                    Ok(_) => report.rebuilt_units += 1,
                    Err(EngineError::RebuildThrottled(reason)) => {
                        warn!(management_id, unit_id = unit.unit_id, reason, "rebuild skipped");
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        let dues = self.check_due_drift(management_id, sample_limit).await?;
        report.dues_checked = dues.checked;
        for due_id in dues.due_ids {
            report.drifted_dues.push(due_id);
            if auto_rebuild {
                match self
                    .rebuild_due_aggregates(management_id, due_id, false, actor)
                    .await
                {
                    Ok(_) => report.rebuilt_dues += 1,
                    Err(EngineError::RebuildThrottled(reason)) => {
                        warn!(management_id, %due_id, reason, "rebuild skipped");
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        info!(
            management_id,
            units_checked = report.units_checked,
            drifted_units = report.drifted_units.len(),
            drifted_dues = report.drifted_dues.len(),
            "drift sweep finished"
        );
        Ok(report)
    }
}
