use chrono::NaiveDate;
use sea_orm::{ActiveValue, ConnectionTrait, DatabaseTransaction, prelude::*};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::{
    Actor, EngineError, EntrySource, EntryType, MonthlyDuesResult, PostEntryCmd, PostingResult,
    ResultEngine,
    audit_log::{AuditAction, AuditTargetType},
    idempotency_keys,
    ledger_entries::{self, EntryShape, NewEntry},
    plan::{OpenDue, plan_sweep},
    unit_balances::BalanceDelta,
    util::{
        normalize_metadata, normalize_optional_text, normalize_required_id,
        validate_positive_amount,
    },
};

use super::{Engine, aggregates::AllocationDraft};

/// A posting command after validation, ready to be replayed on retry.
#[derive(Clone, Debug)]
struct Posting {
    operation: &'static str,
    management_id: String,
    unit_id: String,
    amount_minor: i64,
    source: EntrySource,
    idempotency_key: Option<String>,
    related_due_id: Option<String>,
    description: Option<String>,
    metadata: Value,
}

impl Posting {
    fn validate(operation: &'static str, cmd: PostEntryCmd) -> ResultEngine<Self> {
        validate_positive_amount(cmd.amount_minor)?;
        if !cmd.source.is_client_source() {
            return Err(EngineError::InvalidEntry(format!(
                "source {} is reserved to the engine",
                cmd.source.as_str()
            )));
        }
        Ok(Self {
            operation,
            management_id: normalize_required_id(&cmd.management_id, "management")?,
            unit_id: normalize_required_id(&cmd.unit_id, "unit")?,
            amount_minor: cmd.amount_minor,
            source: cmd.source,
            idempotency_key: normalize_optional_text(cmd.idempotency_key.as_deref()),
            related_due_id: cmd.related_due_id.map(|id| id.to_string()),
            description: normalize_optional_text(cmd.description.as_deref()),
            metadata: normalize_metadata(cmd.metadata)?,
        })
    }

    /// Canonical JSON of the request. `serde_json` maps are sorted, so equal
    /// payloads always produce equal strings.
    fn fingerprint(&self) -> String {
        json!({
            "operation": self.operation,
            "unit_id": self.unit_id,
            "amount_minor": self.amount_minor,
            "source": self.source.as_str(),
            "related_due_id": self.related_due_id,
            "description": self.description,
            "metadata": self.metadata,
        })
        .to_string()
    }
}

impl Engine {
    /// Looks up a processed key. Returns the stored result id when the key
    /// was used with the same fingerprint.
    pub(super) async fn check_idempotency<C: ConnectionTrait>(
        &self,
        db_tx: &C,
        management_id: &str,
        key: &str,
        fingerprint: &str,
    ) -> ResultEngine<Option<String>> {
        let existing =
            idempotency_keys::Entity::find_by_id((management_id.to_string(), key.to_string()))
                .one(db_tx)
                .await?;
        match existing {
            Some(record) if record.fingerprint == fingerprint => Ok(Some(record.result_id)),
            Some(record) => Err(EngineError::IdempotencyKeyConflict(format!(
                "key {key} already used by {} with a different payload",
                record.operation
            ))),
            None => Ok(None),
        }
    }

    pub(super) async fn store_idempotency<C: ConnectionTrait>(
        &self,
        db_tx: &C,
        management_id: &str,
        key: &str,
        operation: &str,
        fingerprint: &str,
        result_id: &str,
    ) -> ResultEngine<()> {
        idempotency_keys::ActiveModel {
            management_id: ActiveValue::Set(management_id.to_string()),
            key: ActiveValue::Set(key.to_string()),
            operation: ActiveValue::Set(operation.to_string()),
            fingerprint: ActiveValue::Set(fingerprint.to_string()),
            result_id: ActiveValue::Set(result_id.to_string()),
            created_at: ActiveValue::Set(self.now()),
        }
        .insert(db_tx)
        .await?;
        Ok(())
    }

    /// Posts a DEBIT. A debit does not consume existing unapplied credit;
    /// that is what [`Engine::auto_settle_from_credit`] is for.
    pub async fn create_debit(&self, cmd: PostEntryCmd, actor: &Actor) -> ResultEngine<PostingResult> {
        if cmd.related_due_id.is_some() {
            return Err(EngineError::InvalidEntry(
                "related_due_id is only valid on credits".to_string(),
            ));
        }
        let posting = Posting::validate("create_debit", cmd)?;
        self.with_retry("create_debit", |engine, db_tx| {
            let posting = posting.clone();
            let actor = actor.clone();
            Box::pin(async move { engine.post_debit(db_tx, &posting, &actor).await })
        })
        .await
    }

    async fn post_debit(
        &self,
        db_tx: &DatabaseTransaction,
        posting: &Posting,
        actor: &Actor,
    ) -> ResultEngine<PostingResult> {
        self.require_unit(db_tx, &posting.management_id, &posting.unit_id)
            .await?;

        let fingerprint = posting.fingerprint();
        if let Some(key) = posting.idempotency_key.as_deref()
            && let Some(entry_id) = self
                .check_idempotency(db_tx, &posting.management_id, key, &fingerprint)
                .await?
        {
            debug!(key, entry_id, "debit replayed from idempotency key");
            let entry = self
                .require_entry(db_tx, &posting.management_id, &entry_id)
                .await?;
            return Ok(PostingResult {
                entry_id: crate::util::parse_uuid(&entry.id, "entry")?,
                created: false,
                applied_minor: None,
                unapplied_minor: None,
            });
        }

        let claim = self
            .claim_unit(db_tx, &posting.management_id, &posting.unit_id)
            .await?;
        let due = ledger_entries::ActiveModel::from(NewEntry {
            management_id: &posting.management_id,
            unit_id: &posting.unit_id,
            entry_type: EntryType::Debit,
            shape: EntryShape::Due,
            amount_minor: posting.amount_minor,
            source: posting.source,
            related_due_id: None,
            reversal_of: None,
            description: posting.description.as_deref(),
            metadata: &posting.metadata,
            created_at: self.now(),
            created_by: &actor.uid,
        })
        .insert(db_tx)
        .await?;
        let balance = self
            .apply_delta(db_tx, &claim, BalanceDelta::post(&due))
            .await?;

        if let Some(key) = posting.idempotency_key.as_deref() {
            self.store_idempotency(
                db_tx,
                &posting.management_id,
                key,
                posting.operation,
                &fingerprint,
                &due.id,
            )
            .await?;
        }
        self.record_audit(
            db_tx,
            AuditAction::CreateDebit,
            actor,
            &posting.management_id,
            AuditTargetType::LedgerEntry,
            &due.id,
            json!({
                "unit_id": posting.unit_id,
                "amount_minor": posting.amount_minor,
                "source": posting.source.as_str(),
                "idempotency_key": posting.idempotency_key,
            }),
        )
        .await?;

        info!(
            management_id = posting.management_id,
            unit_id = posting.unit_id,
            entry_id = due.id,
            amount_minor = posting.amount_minor,
            balance_minor = balance.balance_minor,
            "debit posted"
        );
        Ok(PostingResult {
            entry_id: crate::util::parse_uuid(&due.id, "entry")?,
            created: true,
            applied_minor: None,
            unapplied_minor: None,
        })
    }

    /// Posts a CREDIT (payment) and sweeps it into open dues: the related
    /// due first when given, then oldest first. Leftover credit stays
    /// unapplied.
    pub async fn create_credit(
        &self,
        cmd: PostEntryCmd,
        actor: &Actor,
    ) -> ResultEngine<PostingResult> {
        let posting = Posting::validate("create_credit", cmd)?;
        self.with_retry("create_credit", |engine, db_tx| {
            let posting = posting.clone();
            let actor = actor.clone();
            Box::pin(async move { engine.post_credit(db_tx, &posting, &actor).await })
        })
        .await
    }

    async fn post_credit(
        &self,
        db_tx: &DatabaseTransaction,
        posting: &Posting,
        actor: &Actor,
    ) -> ResultEngine<PostingResult> {
        self.require_unit(db_tx, &posting.management_id, &posting.unit_id)
            .await?;

        let fingerprint = posting.fingerprint();
        if let Some(key) = posting.idempotency_key.as_deref()
            && let Some(entry_id) = self
                .check_idempotency(db_tx, &posting.management_id, key, &fingerprint)
                .await?
        {
            debug!(key, entry_id, "credit replayed from idempotency key");
            let payment = self
                .require_entry(db_tx, &posting.management_id, &entry_id)
                .await?;
            return Ok(PostingResult {
                entry_id: crate::util::parse_uuid(&payment.id, "entry")?,
                created: false,
                applied_minor: payment.applied_minor,
                unapplied_minor: payment.unapplied_minor,
            });
        }

        if let Some(due_id) = posting.related_due_id.as_deref() {
            let due = self
                .require_posted_due(db_tx, &posting.management_id, due_id)
                .await?;
            if due.unit_id != posting.unit_id {
                return Err(EngineError::InvalidEntry(
                    "related due belongs to another unit".to_string(),
                ));
            }
        }

        let claim = self
            .claim_unit(db_tx, &posting.management_id, &posting.unit_id)
            .await?;
        let payment = ledger_entries::ActiveModel::from(NewEntry {
            management_id: &posting.management_id,
            unit_id: &posting.unit_id,
            entry_type: EntryType::Credit,
            shape: EntryShape::Payment,
            amount_minor: posting.amount_minor,
            source: posting.source,
            related_due_id: posting.related_due_id.as_deref(),
            reversal_of: None,
            description: posting.description.as_deref(),
            metadata: &posting.metadata,
            created_at: self.now(),
            created_by: &actor.uid,
        })
        .insert(db_tx)
        .await?;
        let balance = self
            .apply_delta(db_tx, &claim, BalanceDelta::post(&payment))
            .await?;

        let (payment, swept) = self
            .allocate_in_tx(db_tx, payment, posting.related_due_id.as_deref(), actor)
            .await?;

        if let Some(key) = posting.idempotency_key.as_deref() {
            self.store_idempotency(
                db_tx,
                &posting.management_id,
                key,
                posting.operation,
                &fingerprint,
                &payment.id,
            )
            .await?;
        }
        self.record_audit(
            db_tx,
            AuditAction::CreateCredit,
            actor,
            &posting.management_id,
            AuditTargetType::LedgerEntry,
            &payment.id,
            json!({
                "unit_id": posting.unit_id,
                "amount_minor": posting.amount_minor,
                "source": posting.source.as_str(),
                "related_due_id": posting.related_due_id,
                "idempotency_key": posting.idempotency_key,
                "allocations": swept
                    .iter()
                    .map(|(due_id, amount)| json!({ "due_id": due_id, "amount_minor": amount }))
                    .collect::<Vec<_>>(),
            }),
        )
        .await?;

        info!(
            management_id = posting.management_id,
            unit_id = posting.unit_id,
            entry_id = payment.id,
            amount_minor = posting.amount_minor,
            applied_minor = payment.applied_minor,
            balance_minor = balance.balance_minor,
            "credit posted"
        );
        Ok(PostingResult {
            entry_id: crate::util::parse_uuid(&payment.id, "entry")?,
            created: true,
            applied_minor: payment.applied_minor,
            unapplied_minor: payment.unapplied_minor,
        })
    }

    /// Spends the unapplied credit of `payment` on the unit's open dues.
    ///
    /// Returns the refreshed payment and the `(due_id, amount)` pairs written.
    pub(super) async fn allocate_in_tx(
        &self,
        db_tx: &DatabaseTransaction,
        payment: ledger_entries::Model,
        preferred_due_id: Option<&str>,
        actor: &Actor,
    ) -> ResultEngine<(ledger_entries::Model, Vec<(String, i64)>)> {
        let open = self
            .open_dues(db_tx, &payment.management_id, &payment.unit_id)
            .await?;
        let candidates: Vec<OpenDue> = open
            .iter()
            .map(|due| OpenDue {
                id: due.id.clone(),
                created_at: due.created_at,
                outstanding_minor: due.due_outstanding(),
            })
            .collect();
        let plan = plan_sweep(payment.unapplied(), preferred_due_id, &candidates);
        if plan.is_empty() {
            return Ok((payment, plan));
        }

        for (due_id, amount_minor) in &plan {
            let Some(due) = open.iter().find(|due| &due.id == due_id) else {
                continue;
            };
            self.insert_allocation(
                db_tx,
                AllocationDraft {
                    due,
                    payment: &payment,
                    settlement_entry_id: None,
                    amount_minor: *amount_minor,
                    created_by: &actor.uid,
                },
            )
            .await?;
            self.sync_due(db_tx, due, None).await?;
        }
        let payment = self.sync_payment(db_tx, &payment).await?;
        debug!(
            payment_id = payment.id,
            dues = plan.len(),
            unapplied_minor = payment.unapplied(),
            "payment swept into open dues"
        );
        Ok((payment, plan))
    }

    /// Posts one `dues` debit per registered unit for `period` (`YYYY-MM`).
    ///
    /// Each unit posting is keyed `dues:<period>:<unit>` and runs in its own
    /// transaction; a run marker makes the whole call a no-op once a period
    /// has completed.
    pub async fn generate_monthly_dues(
        &self,
        management_id: &str,
        period: &str,
        amount_minor: i64,
        actor: &Actor,
    ) -> ResultEngine<MonthlyDuesResult> {
        let management_id = normalize_required_id(management_id, "management")?;
        validate_positive_amount(amount_minor)?;
        let period = period.trim().to_string();
        NaiveDate::parse_from_str(&format!("{period}-01"), "%Y-%m-%d").map_err(|_| {
            EngineError::InvalidEntry(format!("invalid period {period}, expected YYYY-MM"))
        })?;

        let marker = format!("monthly-dues:{period}");
        let marker_fingerprint = json!({
            "operation": "generate_monthly_dues",
            "period": period,
            "amount_minor": amount_minor,
        })
        .to_string();

        let already = idempotency_keys::Entity::find_by_id((management_id.clone(), marker.clone()))
            .one(&self.database)
            .await?;
        if already.is_some() {
            info!(management_id, period, "monthly dues already generated");
            return Ok(MonthlyDuesResult {
                period,
                created: 0,
                skipped: 0,
                already_ran: true,
            });
        }

        let mut result = MonthlyDuesResult {
            period: period.clone(),
            ..MonthlyDuesResult::default()
        };
        for unit in self.list_units(&management_id).await? {
            let cmd = PostEntryCmd::new(
                management_id.clone(),
                unit.unit_id.clone(),
                amount_minor,
                EntrySource::Dues,
            )
            .idempotency_key(format!("dues:{period}:{}", unit.unit_id))
            .description(format!("Dues {period}"))
            .metadata(json!({ "period": period }));

            match self.create_debit(cmd, actor).await {
                Ok(posting) if posting.created => result.created += 1,
                Ok(_) => result.skipped += 1,
                Err(EngineError::IdempotencyKeyConflict(reason)) => {
                    warn!(
                        management_id,
                        unit_id = unit.unit_id,
                        reason,
                        "dues key reused, skipping unit"
                    );
                    result.skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }

        let summary = result.clone();
        self.with_retry("generate_monthly_dues", |engine, db_tx| {
            let (management_id, marker, marker_fingerprint) =
                (management_id.clone(), marker.clone(), marker_fingerprint.clone());
            let (actor, summary) = (actor.clone(), summary.clone());
            let amount_minor = amount_minor;
            Box::pin(async move {
                let existing =
                    idempotency_keys::Entity::find_by_id((management_id.clone(), marker.clone()))
                        .one(db_tx)
                        .await?;
                if existing.is_some() {
                    return Ok(());
                }
                engine
                    .store_idempotency(
                        db_tx,
                        &management_id,
                        &marker,
                        "generate_monthly_dues",
                        &marker_fingerprint,
                        &summary.period,
                    )
                    .await?;
                engine
                    .record_audit(
                        db_tx,
                        AuditAction::GenerateMonthlyDues,
                        &actor,
                        &management_id,
                        AuditTargetType::Management,
                        &management_id,
                        json!({
                            "period": summary.period,
                            "amount_minor": amount_minor,
                            "created": summary.created,
                            "skipped": summary.skipped,
                        }),
                    )
                    .await
            })
        })
        .await?;

        info!(
            management_id,
            period,
            created = result.created,
            skipped = result.skipped,
            "monthly dues generated"
        );
        Ok(result)
    }
}
