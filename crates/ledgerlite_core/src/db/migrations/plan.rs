//! Ledger/source reconciliation.
//!
//! Only the tail of applied history is ever mutated: the rollback scan walks
//! the ledger from the highest id down and stops at the first row that is
//! still backed by a file (and not forced). Ledger rows behind that point are
//! left alone even when their files vanished; `detect_drift` reports them.

use super::ledger::MigrationRecord;
use super::source::MigrationFile;
use crate::config::ForcePolicy;
use std::collections::BTreeSet;

/// Direction of one planned step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationAction {
    Apply,
    Rollback,
}

/// One step of a reconciliation plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedStep {
    /// Runs the ledger's stored down script and deletes the row.
    Rollback(MigrationRecord),
    /// Runs the file's up script and records it in the ledger.
    Apply(MigrationFile),
}

impl PlannedStep {
    pub fn action(&self) -> MigrationAction {
        match self {
            Self::Rollback(_) => MigrationAction::Rollback,
            Self::Apply(_) => MigrationAction::Apply,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Self::Rollback(record) => record.id,
            Self::Apply(file) => file.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Rollback(record) => &record.name,
            Self::Apply(file) => &file.name,
        }
    }
}

/// Ordered rollback-then-apply steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationPlan {
    pub steps: Vec<PlannedStep>,
}

impl ReconciliationPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn rollback_ids(&self) -> Vec<i64> {
        self.ids_for(MigrationAction::Rollback)
    }

    pub fn apply_ids(&self) -> Vec<i64> {
        self.ids_for(MigrationAction::Apply)
    }

    fn ids_for(&self, action: MigrationAction) -> Vec<i64> {
        self.steps
            .iter()
            .filter(|step| step.action() == action)
            .map(PlannedStep::id)
            .collect()
    }
}

/// Builds the plan for `ledger` (ascending by id) against `files`
/// (ascending by id).
pub fn reconcile(
    ledger: &[MigrationRecord],
    files: &[MigrationFile],
    force: ForcePolicy,
) -> ReconciliationPlan {
    let file_ids: BTreeSet<i64> = files.iter().map(|file| file.id).collect();
    let last_file_id = files.last().map(|file| file.id);

    let mut steps = Vec::new();
    let mut remaining = ledger.len();
    for record in ledger.iter().rev() {
        let missing = !file_ids.contains(&record.id);
        let forced = force == ForcePolicy::ReapplyLast && Some(record.id) == last_file_id;
        if !missing && !forced {
            break;
        }
        steps.push(PlannedStep::Rollback(record.clone()));
        remaining -= 1;
    }

    let highest_remaining = ledger[..remaining].last().map_or(0, |record| record.id);
    steps.extend(
        files
            .iter()
            .filter(|file| file.id > highest_remaining)
            .cloned()
            .map(PlannedStep::Apply),
    );

    ReconciliationPlan { steps }
}

/// Ledger/file mismatches that a plan leaves in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Drift {
    /// Ledger ids that stay applied although no file backs them.
    pub orphaned: Vec<i64>,
    /// File ids below the applied tail that will never be applied.
    pub unapplied: Vec<i64>,
}

impl Drift {
    pub fn is_empty(&self) -> bool {
        self.orphaned.is_empty() && self.unapplied.is_empty()
    }
}

/// Reports what remains inconsistent after `plan` is executed.
pub fn detect_drift(
    ledger: &[MigrationRecord],
    files: &[MigrationFile],
    plan: &ReconciliationPlan,
) -> Drift {
    let rolled_back: BTreeSet<i64> = plan.rollback_ids().into_iter().collect();
    let applied: BTreeSet<i64> = plan.apply_ids().into_iter().collect();
    let file_ids: BTreeSet<i64> = files.iter().map(|file| file.id).collect();
    let kept: BTreeSet<i64> = ledger
        .iter()
        .map(|record| record.id)
        .filter(|id| !rolled_back.contains(id))
        .collect();

    Drift {
        orphaned: kept
            .iter()
            .copied()
            .filter(|id| !file_ids.contains(id))
            .collect(),
        unapplied: file_ids
            .iter()
            .copied()
            .filter(|id| !kept.contains(id) && !applied.contains(id))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::{detect_drift, reconcile, MigrationAction, PlannedStep};
    use crate::config::ForcePolicy;
    use crate::db::migrations::{MigrationFile, MigrationRecord};

    fn files(ids: &[i64]) -> Vec<MigrationFile> {
        ids.iter()
            .map(|id| MigrationFile {
                id: *id,
                name: format!("m{id}"),
                up: format!("-- up {id}"),
                down: format!("-- disk down {id}"),
            })
            .collect()
    }

    fn ledger(ids: &[i64]) -> Vec<MigrationRecord> {
        ids.iter()
            .map(|id| MigrationRecord {
                id: *id,
                name: format!("m{id}"),
                up: format!("-- up {id}"),
                down: format!("-- ledger down {id}"),
            })
            .collect()
    }

    #[test]
    fn fresh_database_applies_everything_in_order() {
        let plan = reconcile(&[], &files(&[1, 2, 3]), ForcePolicy::None);
        assert_eq!(plan.apply_ids(), vec![1, 2, 3]);
        assert!(plan.rollback_ids().is_empty());
    }

    #[test]
    fn up_to_date_ledger_plans_nothing() {
        let plan = reconcile(&ledger(&[1, 2]), &files(&[1, 2]), ForcePolicy::None);
        assert!(plan.is_empty());
    }

    #[test]
    fn removed_tail_file_is_rolled_back() {
        let plan = reconcile(&ledger(&[1, 2, 3]), &files(&[1, 2]), ForcePolicy::None);
        assert_eq!(plan.rollback_ids(), vec![3]);
        assert!(plan.apply_ids().is_empty());
    }

    #[test]
    fn rollback_uses_ledger_down_script() {
        let plan = reconcile(&ledger(&[1, 2]), &files(&[1]), ForcePolicy::None);
        match &plan.steps[0] {
            PlannedStep::Rollback(record) => assert_eq!(record.down, "-- ledger down 2"),
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn rollback_scan_stops_at_first_backed_row() {
        // 2 is gone from disk but 3 is still backed, so nothing rolls back.
        let plan = reconcile(&ledger(&[1, 2, 3]), &files(&[1, 3]), ForcePolicy::None);
        assert!(plan.is_empty());
    }

    #[test]
    fn gap_in_ledger_is_not_surfaced() {
        let plan = reconcile(&ledger(&[1, 3]), &files(&[1, 2, 3]), ForcePolicy::None);
        assert!(plan.is_empty());
    }

    #[test]
    fn reapply_last_rolls_back_then_applies_highest() {
        let plan = reconcile(&ledger(&[1, 2]), &files(&[1, 2]), ForcePolicy::ReapplyLast);
        let shape: Vec<(MigrationAction, i64)> = plan
            .steps
            .iter()
            .map(|step| (step.action(), step.id()))
            .collect();
        assert_eq!(
            shape,
            vec![(MigrationAction::Rollback, 2), (MigrationAction::Apply, 2)]
        );
    }

    #[test]
    fn reapply_last_with_new_files_reapplies_nothing_extra() {
        // Highest file (3) is not in the ledger, so force only applies it.
        let plan = reconcile(&ledger(&[1, 2]), &files(&[1, 2, 3]), ForcePolicy::ReapplyLast);
        assert!(plan.rollback_ids().is_empty());
        assert_eq!(plan.apply_ids(), vec![3]);
    }

    #[test]
    fn removed_tail_and_new_file_rolls_back_then_applies() {
        let plan = reconcile(&ledger(&[1, 2, 5]), &files(&[1, 2, 3]), ForcePolicy::None);
        assert_eq!(plan.rollback_ids(), vec![5]);
        assert_eq!(plan.apply_ids(), vec![3]);
        assert_eq!(plan.steps[0].action(), MigrationAction::Rollback);
    }

    #[test]
    fn single_remaining_file_keeps_its_row_and_rolls_back_the_rest() {
        let plan = reconcile(&ledger(&[1, 2, 3]), &files(&[1]), ForcePolicy::None);
        assert_eq!(plan.rollback_ids(), vec![3, 2]);
        assert!(plan.apply_ids().is_empty());
    }

    #[test]
    fn drift_reports_gap_and_orphan() {
        let gap_ledger = ledger(&[1, 3]);
        let gap_files = files(&[1, 2, 3]);
        let plan = reconcile(&gap_ledger, &gap_files, ForcePolicy::None);
        let drift = detect_drift(&gap_ledger, &gap_files, &plan);
        assert_eq!(drift.unapplied, vec![2]);
        assert!(drift.orphaned.is_empty());

        let orphan_ledger = ledger(&[1, 2, 3]);
        let orphan_files = files(&[1, 3]);
        let plan = reconcile(&orphan_ledger, &orphan_files, ForcePolicy::None);
        let drift = detect_drift(&orphan_ledger, &orphan_files, &plan);
        assert_eq!(drift.orphaned, vec![2]);
        assert!(drift.unapplied.is_empty());
    }

    #[test]
    fn consistent_plan_has_no_drift() {
        let current = ledger(&[1, 2, 3]);
        let source = files(&[1, 2, 4]);
        let plan = reconcile(&current, &source, ForcePolicy::None);
        assert!(detect_drift(&current, &source, &plan).is_empty());
    }
}
