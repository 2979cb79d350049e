//! Pure planning for allocation sweeps and auto-settlement.
//!
//! The planners decide *what* to write; the ops layer writes it inside a
//! transaction. Keeping them free of I/O lets the ordering and capacity rules
//! be tested exhaustively.

use chrono::{DateTime, Utc};

/// An open due as seen by the planners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct OpenDue {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub outstanding_minor: i64,
}

/// A payment with unapplied credit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct OpenCredit {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub unapplied_minor: i64,
}

/// Oldest first, ties broken by id.
pub(crate) fn sort_dues(dues: &mut [OpenDue]) {
    dues.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

/// FIFO by payment creation, ties broken by id.
pub(crate) fn sort_credits(credits: &mut [OpenCredit]) {
    credits.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

/// Splits `available_minor` of one payment across open dues.
///
/// The `preferred` due (if open) is served first, then the remaining dues
/// oldest first. Returns `(due_id, amount)` pairs with positive amounts.
pub(crate) fn plan_sweep(
    available_minor: i64,
    preferred: Option<&str>,
    dues: &[OpenDue],
) -> Vec<(String, i64)> {
    let mut ordered: Vec<&OpenDue> = dues.iter().filter(|d| d.outstanding_minor > 0).collect();
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    if let Some(preferred) = preferred
        && let Some(pos) = ordered.iter().position(|d| d.id == preferred)
    {
        let due = ordered.remove(pos);
        ordered.insert(0, due);
    }

    let mut remaining = available_minor.max(0);
    let mut plan = Vec::new();
    for due in ordered {
        if remaining == 0 {
            break;
        }
        let amount = remaining.min(due.outstanding_minor);
        plan.push((due.id.clone(), amount));
        remaining -= amount;
    }
    plan
}

/// Credit drawn from one payment to close a due.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CreditDraw {
    pub payment_id: String,
    pub amount_minor: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct DueClosure {
    pub due_id: String,
    pub amount_minor: i64,
    pub draws: Vec<CreditDraw>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct SettlementPlan {
    pub closures: Vec<DueClosure>,
    pub total_settled_minor: i64,
    pub remaining_credit_minor: i64,
}

/// Closes as many open dues *in full* as the pooled unapplied credit allows.
///
/// Dues are scanned oldest first; a due is accepted when it still fits in the
/// remaining pool, otherwise it is skipped and scanning continues. Credit is
/// drawn from payments FIFO.
pub(crate) fn plan_settlement(credits: &[OpenCredit], dues: &[OpenDue]) -> SettlementPlan {
    let mut credits: Vec<OpenCredit> = credits
        .iter()
        .filter(|c| c.unapplied_minor > 0)
        .cloned()
        .collect();
    sort_credits(&mut credits);
    let mut dues: Vec<OpenDue> = dues
        .iter()
        .filter(|d| d.outstanding_minor > 0)
        .cloned()
        .collect();
    sort_dues(&mut dues);

    let total_unapplied = credits
        .iter()
        .fold(0i64, |acc, c| acc.saturating_add(c.unapplied_minor));
    let mut consumed = 0i64;
    let mut closures = Vec::new();
    let mut cursor = 0usize;

    for due in dues {
        if consumed.saturating_add(due.outstanding_minor) > total_unapplied {
            continue;
        }
        consumed += due.outstanding_minor;

        let mut needed = due.outstanding_minor;
        let mut draws = Vec::new();
        while needed > 0 && cursor < credits.len() {
            let credit = &mut credits[cursor];
            let take = needed.min(credit.unapplied_minor);
            if take > 0 {
                draws.push(CreditDraw {
                    payment_id: credit.id.clone(),
                    amount_minor: take,
                });
                credit.unapplied_minor -= take;
                needed -= take;
            }
            if credit.unapplied_minor == 0 {
                cursor += 1;
            }
        }

        closures.push(DueClosure {
            due_id: due.id,
            amount_minor: due.outstanding_minor,
            draws,
        });
    }

    SettlementPlan {
        closures,
        total_settled_minor: consumed,
        remaining_credit_minor: total_unapplied - consumed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_760_000_000 + secs, 0).unwrap()
    }

    fn due(id: &str, secs: i64, outstanding: i64) -> OpenDue {
        OpenDue {
            id: id.to_string(),
            created_at: at(secs),
            outstanding_minor: outstanding,
        }
    }

    fn credit(id: &str, secs: i64, unapplied: i64) -> OpenCredit {
        OpenCredit {
            id: id.to_string(),
            created_at: at(secs),
            unapplied_minor: unapplied,
        }
    }

    #[test]
    fn sweep_serves_oldest_due_first() {
        let dues = [due("b", 2, 500), due("a", 1, 300), due("c", 3, 1_000)];
        let plan = plan_sweep(1_000, None, &dues);
        assert_eq!(
            plan,
            vec![
                ("a".to_string(), 300),
                ("b".to_string(), 500),
                ("c".to_string(), 200)
            ]
        );
    }

    #[test]
    fn sweep_ties_broken_by_id() {
        let dues = [due("y", 1, 100), due("x", 1, 100)];
        let plan = plan_sweep(150, None, &dues);
        assert_eq!(plan, vec![("x".to_string(), 100), ("y".to_string(), 50)]);
    }

    #[test]
    fn sweep_serves_preferred_due_first() {
        let dues = [due("old", 1, 300), due("target", 5, 400)];
        let plan = plan_sweep(500, Some("target"), &dues);
        assert_eq!(
            plan,
            vec![("target".to_string(), 400), ("old".to_string(), 100)]
        );
    }

    #[test]
    fn sweep_leaves_leftover_unapplied() {
        let plan = plan_sweep(1_000, None, &[due("a", 1, 300)]);
        assert_eq!(plan, vec![("a".to_string(), 300)]);
        assert!(plan_sweep(1_000, None, &[]).is_empty());
        assert!(plan_sweep(0, None, &[due("a", 1, 300)]).is_empty());
    }

    #[test]
    fn settlement_closes_both_dues_fifo() {
        let credits = [credit("p1", 1, 100_000), credit("p2", 2, 60_000)];
        let dues = [due("d1", 3, 70_000), due("d2", 4, 90_000)];
        let plan = plan_settlement(&credits, &dues);

        assert_eq!(plan.total_settled_minor, 160_000);
        assert_eq!(plan.remaining_credit_minor, 0);
        assert_eq!(plan.closures.len(), 2);
        assert_eq!(
            plan.closures[0].draws,
            vec![CreditDraw {
                payment_id: "p1".to_string(),
                amount_minor: 70_000
            }]
        );
        assert_eq!(
            plan.closures[1].draws,
            vec![
                CreditDraw {
                    payment_id: "p1".to_string(),
                    amount_minor: 30_000
                },
                CreditDraw {
                    payment_id: "p2".to_string(),
                    amount_minor: 60_000
                },
            ]
        );
    }

    #[test]
    fn settlement_skips_dues_that_do_not_fit() {
        let credits = [credit("p1", 1, 500)];
        let dues = [due("big", 2, 800), due("small", 3, 400), due("tiny", 4, 200)];
        let plan = plan_settlement(&credits, &dues);
        let closed: Vec<&str> = plan.closures.iter().map(|c| c.due_id.as_str()).collect();
        assert_eq!(closed, vec!["small"]);
        assert_eq!(plan.total_settled_minor, 400);
        assert_eq!(plan.remaining_credit_minor, 100);
    }

    #[test]
    fn settlement_without_fitting_due_is_empty() {
        let plan = plan_settlement(&[credit("p1", 1, 100)], &[due("d1", 2, 101)]);
        assert!(plan.closures.is_empty());
        assert_eq!(plan.total_settled_minor, 0);
        assert_eq!(plan.remaining_credit_minor, 100);

        let empty = plan_settlement(&[], &[due("d1", 2, 101)]);
        assert_eq!(empty, SettlementPlan::default());
    }
}
