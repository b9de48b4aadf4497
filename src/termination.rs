//! Termination registry: the compile-time truth table mapping each
//! obligation-creating receipt type to the receipt types that legally
//! discharge it.
//!
//! Termination is type semantics (this table) composed with ledger evidence
//! (a child receipt whose `parents` references the obligation). The engine
//! never scans the ledger to infer termination; it checks this table and
//! probes for linked children.

use crate::models::ReceiptType;

/// Receipt types that legally discharge an obligation of the given type.
/// Empty slice means the type creates no obligation.
pub fn terminators_of(obligation_type: ReceiptType) -> &'static [ReceiptType] {
    match obligation_type {
        ReceiptType::TaskAssigned => &[
            ReceiptType::TaskCompleted,
            ReceiptType::TaskFailed,
            ReceiptType::TaskCanceled,
        ],
        _ => &[],
    }
}

/// True when receipts of this type create an obligation on the addressee.
pub fn is_obligation_type(receipt_type: ReceiptType) -> bool {
    !terminators_of(receipt_type).is_empty()
}

/// True when receipts of this type appear in any termination rule, i.e. can
/// discharge some obligation. Such receipts must carry non-empty parents.
pub fn is_terminal_type(receipt_type: ReceiptType) -> bool {
    matches!(
        receipt_type,
        ReceiptType::TaskCompleted | ReceiptType::TaskFailed | ReceiptType::TaskCanceled
    )
}

/// True when a child receipt of `child_type` legally terminates a parent of
/// `parent_type`. Principal identity is deliberately not part of this check:
/// different actors may discharge the same obligation.
pub fn can_terminate(child_type: ReceiptType, parent_type: ReceiptType) -> bool {
    terminators_of(parent_type).contains(&child_type)
}

/// The obligation-creating types, as wire strings for query predicates.
pub fn obligation_type_names() -> Vec<String> {
    ALL_TYPES
        .iter()
        .copied()
        .filter(|t| is_obligation_type(*t))
        .map(|t| t.to_string())
        .collect()
}

const ALL_TYPES: &[ReceiptType] = &[
    ReceiptType::TaskAssigned,
    ReceiptType::TaskProgress,
    ReceiptType::TaskCompleted,
    ReceiptType::TaskFailed,
    ReceiptType::TaskCanceled,
    ReceiptType::TaskResultReady,
    ReceiptType::LeaseExpired,
    ReceiptType::ReceiptAcknowledged,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnomalyKind;

    #[test]
    fn task_assigned_is_the_only_obligation_type() {
        assert!(is_obligation_type(ReceiptType::TaskAssigned));
        for t in [
            ReceiptType::TaskProgress,
            ReceiptType::TaskCompleted,
            ReceiptType::TaskFailed,
            ReceiptType::TaskCanceled,
            ReceiptType::TaskResultReady,
            ReceiptType::LeaseExpired,
            ReceiptType::ReceiptAcknowledged,
            ReceiptType::SystemAnomaly(AnomalyKind::LocatabilityMissing),
        ] {
            assert!(!is_obligation_type(t), "{t} should not create obligations");
        }
    }

    #[test]
    fn terminal_types_match_rule_ranges() {
        assert!(is_terminal_type(ReceiptType::TaskCompleted));
        assert!(is_terminal_type(ReceiptType::TaskFailed));
        assert!(is_terminal_type(ReceiptType::TaskCanceled));
        assert!(!is_terminal_type(ReceiptType::TaskAssigned));
        assert!(!is_terminal_type(ReceiptType::LeaseExpired));
        assert!(!is_terminal_type(ReceiptType::TaskProgress));
        assert!(!is_terminal_type(ReceiptType::ReceiptAcknowledged));
    }

    #[test]
    fn can_terminate_respects_the_table() {
        assert!(can_terminate(ReceiptType::TaskCompleted, ReceiptType::TaskAssigned));
        assert!(can_terminate(ReceiptType::TaskFailed, ReceiptType::TaskAssigned));
        assert!(can_terminate(ReceiptType::TaskCanceled, ReceiptType::TaskAssigned));

        // lease.expired is lost authority, never a discharge
        assert!(!can_terminate(ReceiptType::LeaseExpired, ReceiptType::TaskAssigned));
        // acknowledging an obligation receipt does not discharge it
        assert!(!can_terminate(ReceiptType::ReceiptAcknowledged, ReceiptType::TaskAssigned));
        // progress never terminates anything
        assert!(!can_terminate(ReceiptType::TaskProgress, ReceiptType::TaskAssigned));
        // nothing terminates a non-obligation type
        assert!(!can_terminate(ReceiptType::TaskCompleted, ReceiptType::TaskProgress));
    }

    #[test]
    fn obligation_type_names_are_wire_strings() {
        assert_eq!(obligation_type_names(), vec!["task.assigned".to_string()]);
    }
}
