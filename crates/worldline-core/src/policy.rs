//! # Class Policy Store
//!
//! Per-class legality tables: which phases exist, which transitions between
//! them are allowed, and which relationship types a worldline of the class
//! may originate.
//!
//! Classes are data, not code. Adding a class means adding a table entry;
//! the projector interprets it.

use crate::{ClassId, Phase, RegistryError, RelType, StructuralError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// CLASS POLICY
// =============================================================================

/// The legality table for one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassPolicy {
    pub id: ClassId,
    /// Legal lifecycle states, in declaration order.
    pub phases: Vec<Phase>,
    /// States a worldline may be created in. Empty means the first phase.
    #[serde(default)]
    pub initial: BTreeSet<Phase>,
    /// Legal `from -> to` pairs.
    #[serde(default)]
    pub transitions: BTreeSet<(Phase, Phase)>,
    /// Relationship types worldlines of this class may originate.
    #[serde(default)]
    pub rel_types: BTreeSet<RelType>,
}

impl ClassPolicy {
    /// Create a policy with the given phases and no transitions.
    #[must_use]
    pub fn new<P: Into<Phase>>(id: impl Into<ClassId>, phases: impl IntoIterator<Item = P>) -> Self {
        Self {
            id: id.into(),
            phases: phases.into_iter().map(Into::into).collect(),
            initial: BTreeSet::new(),
            transitions: BTreeSet::new(),
            rel_types: BTreeSet::new(),
        }
    }

    /// Declare an additional initial state.
    #[must_use]
    pub fn with_initial(mut self, phase: impl Into<Phase>) -> Self {
        self.initial.insert(phase.into());
        self
    }

    /// Declare a legal transition.
    #[must_use]
    pub fn with_transition(mut self, from: impl Into<Phase>, to: impl Into<Phase>) -> Self {
        self.transitions.insert((from.into(), to.into()));
        self
    }

    /// Declare a legal relationship type.
    #[must_use]
    pub fn with_rel_type(mut self, rel_type: impl Into<RelType>) -> Self {
        self.rel_types.insert(rel_type.into());
        self
    }

    /// Check internal consistency.
    ///
    /// Every initial state and every transition endpoint must be a declared
    /// phase, and phases must be unique and non-empty.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.id.is_empty() {
            return Err(RegistryError::Config("class id is empty".to_string()));
        }
        if self.phases.is_empty() {
            return Err(RegistryError::Config(format!(
                "class {} declares no phases",
                self.id
            )));
        }
        let declared: BTreeSet<&Phase> = self.phases.iter().collect();
        if declared.len() != self.phases.len() {
            return Err(RegistryError::Config(format!(
                "class {} declares a phase twice",
                self.id
            )));
        }
        if let Some(p) = self.initial.iter().find(|p| !declared.contains(p)) {
            return Err(RegistryError::Config(format!(
                "class {}: initial phase {} is not declared",
                self.id, p
            )));
        }
        for (from, to) in &self.transitions {
            if !declared.contains(from) || !declared.contains(to) {
                return Err(RegistryError::Config(format!(
                    "class {}: transition {} -> {} uses an undeclared phase",
                    self.id, from, to
                )));
            }
        }
        Ok(())
    }

    /// Check whether a phase is declared by this class.
    #[must_use]
    pub fn is_legal_phase(&self, phase: &Phase) -> bool {
        self.phases.contains(phase)
    }

    /// Initial states in declaration order.
    pub fn initial_phases(&self) -> impl Iterator<Item = &Phase> {
        let explicit = !self.initial.is_empty();
        self.phases
            .iter()
            .enumerate()
            .filter(move |(i, p)| if explicit { self.initial.contains(*p) } else { *i == 0 })
            .map(|(_, p)| p)
    }

    /// Pick the phase a new worldline starts in.
    ///
    /// With no request, the first declared initial state is used. A request
    /// for any other state is an illegal transition out of "no state".
    pub fn initial_phase(&self, requested: Option<&Phase>) -> Result<Phase, StructuralError> {
        match requested {
            None => self
                .initial_phases()
                .next()
                .cloned()
                .ok_or_else(|| StructuralError::UnknownClass(self.id.clone())),
            Some(p) if self.initial_phases().any(|i| i == p) => Ok(p.clone()),
            Some(p) => Err(StructuralError::InvalidTransition {
                class: self.id.clone(),
                from: None,
                to: p.clone(),
            }),
        }
    }

    /// Check a phase change. Staying in the same phase is not a change.
    pub fn check_transition(&self, from: &Phase, to: &Phase) -> Result<(), StructuralError> {
        if from == to && self.is_legal_phase(to) {
            return Ok(());
        }
        if self.transitions.contains(&(from.clone(), to.clone())) {
            Ok(())
        } else {
            Err(StructuralError::InvalidTransition {
                class: self.id.clone(),
                from: Some(from.clone()),
                to: to.clone(),
            })
        }
    }

    /// Check a relationship type.
    pub fn check_rel_type(&self, rel_type: &RelType) -> Result<(), StructuralError> {
        if self.rel_types.contains(rel_type) {
            Ok(())
        } else {
            Err(StructuralError::RelTypeNotAllowed {
                class: self.id.clone(),
                rel_type: rel_type.clone(),
            })
        }
    }
}

// =============================================================================
// POLICY STORE
// =============================================================================

/// Read-only lookup of class policies.
///
/// Implementations must be safe for concurrent reads; the registry never
/// mutates them.
pub trait ClassPolicyStore: Send + Sync {
    /// Get the policy of a class, if declared.
    fn get_class(&self, id: &ClassId) -> Option<&ClassPolicy>;
}

/// In-memory policy table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTable {
    classes: BTreeMap<ClassId, ClassPolicy>,
}

impl PolicyTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from policies, validating each.
    pub fn from_policies(
        policies: impl IntoIterator<Item = ClassPolicy>,
    ) -> Result<Self, RegistryError> {
        let mut table = Self::new();
        for policy in policies {
            table.insert(policy)?;
        }
        Ok(table)
    }

    /// Add a policy. Declaring a class twice is a configuration error.
    pub fn insert(&mut self, policy: ClassPolicy) -> Result<(), RegistryError> {
        policy.validate()?;
        if self.classes.contains_key(&policy.id) {
            return Err(RegistryError::Config(format!(
                "class {} declared twice",
                policy.id
            )));
        }
        self.classes.insert(policy.id.clone(), policy);
        Ok(())
    }

    /// All policies in class-id order.
    pub fn classes(&self) -> impl Iterator<Item = &ClassPolicy> {
        self.classes.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl ClassPolicyStore for PolicyTable {
    fn get_class(&self, id: &ClassId) -> Option<&ClassPolicy> {
        self.classes.get(id)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn gold_vault() -> ClassPolicy {
        ClassPolicy::new("GOLD_VAULT", ["ORIGINATED", "ONCHAIN_ACTIVE", "REDEEMED"])
            .with_transition("ORIGINATED", "ONCHAIN_ACTIVE")
            .with_transition("ONCHAIN_ACTIVE", "REDEEMED")
            .with_rel_type("COLLATERAL_FOR")
    }

    #[test]
    fn first_phase_is_default_initial() {
        let policy = gold_vault();
        assert_eq!(
            policy.initial_phase(None).expect("initial"),
            Phase::from("ORIGINATED")
        );
    }

    #[test]
    fn non_initial_create_phase_rejected() {
        let policy = gold_vault();
        let err = policy
            .initial_phase(Some(&Phase::from("REDEEMED")))
            .expect_err("must reject");
        assert!(matches!(err, StructuralError::InvalidTransition { from: None, .. }));
    }

    #[test]
    fn explicit_initial_set_respected() {
        let policy = gold_vault().with_initial("ONCHAIN_ACTIVE");
        assert_eq!(
            policy.initial_phase(None).expect("initial"),
            Phase::from("ONCHAIN_ACTIVE")
        );
        assert!(policy.initial_phase(Some(&Phase::from("ORIGINATED"))).is_err());
    }

    #[test]
    fn transitions_checked() {
        let policy = gold_vault();
        let originated = Phase::from("ORIGINATED");
        assert!(
            policy
                .check_transition(&originated, &Phase::from("ONCHAIN_ACTIVE"))
                .is_ok()
        );
        assert!(
            policy
                .check_transition(&originated, &Phase::from("REDEEMED"))
                .is_err()
        );
        assert!(policy.check_transition(&originated, &originated).is_ok());
    }

    #[test]
    fn rel_types_checked() {
        let policy = gold_vault();
        assert!(policy.check_rel_type(&RelType::from("COLLATERAL_FOR")).is_ok());
        assert!(policy.check_rel_type(&RelType::from("OWNS")).is_err());
    }

    #[test]
    fn validate_rejects_undeclared_transition_phase() {
        let policy = gold_vault().with_transition("ORIGINATED", "BURNED");
        assert!(policy.validate().is_err());
    }

    #[test]
    fn table_rejects_duplicate_class() {
        let result = PolicyTable::from_policies([gold_vault(), gold_vault()]);
        assert!(matches!(result, Err(RegistryError::Config(_))));
    }

    #[test]
    fn table_lookup() {
        let table = PolicyTable::from_policies([gold_vault()]).expect("table");
        assert!(table.get_class(&ClassId::from("GOLD_VAULT")).is_some());
        assert!(table.get_class(&ClassId::from("SILVER")).is_none());
        assert_eq!(table.len(), 1);
    }
}
