use maestro_core::{MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Progress of a plan entry. Ordered: a status never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
}

/// `(step, substep)`; `None` sorts before every substep of the same step.
pub type StepId = (u32, Option<u32>);

/// One entry of a hierarchical plan. Top-level steps have `substep == None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub step: u32,
    #[serde(default)]
    pub substep: Option<u32>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_status")]
    pub status: StepStatus,
    #[serde(default)]
    pub assigned_agent: Option<String>,
    /// Capability tags an agent should have for this entry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<String>,
}

fn default_status() -> StepStatus {
    StepStatus::Pending
}

impl PlanStep {
    pub fn new(step: u32, description: impl Into<String>) -> Self {
        Self {
            step,
            substep: None,
            description: description.into(),
            status: StepStatus::Pending,
            assigned_agent: None,
            requirements: Vec::new(),
        }
    }

    pub fn substep(step: u32, substep: u32, description: impl Into<String>) -> Self {
        Self {
            substep: Some(substep),
            ..Self::new(step, description)
        }
    }

    pub fn with_requirements(mut self, requirements: Vec<String>) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn id(&self) -> StepId {
        (self.step, self.substep)
    }
}

/// A status change requested by evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub step: u32,
    #[serde(default)]
    pub substep: Option<u32>,
    pub status: StepStatus,
}

impl StatusUpdate {
    pub fn new(step: u32, substep: Option<u32>, status: StepStatus) -> Self {
        Self {
            step,
            substep,
            status,
        }
    }
}

/// The plan tracker. Pure data, no I/O.
///
/// Rules kept by every mutation:
/// - entries are unique by `(step, substep)` and kept sorted;
/// - a status only moves forward (`PENDING -> IN_PROGRESS -> COMPLETED`);
/// - a parent becomes IN_PROGRESS as soon as a substep starts or completes,
///   COMPLETED once every substep is, and completing a parent completes its
///   substeps;
/// - restructuring cannot introduce identities below the last dispatched one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    steps: Vec<PlanStep>,
    #[serde(default)]
    high_water: Option<StepId>,
}

impl Plan {
    /// A single PENDING step describing the whole task.
    pub fn initial(task: &str) -> Self {
        Self {
            steps: vec![PlanStep::new(1, task)],
            high_water: None,
        }
    }

    pub fn from_steps(steps: Vec<PlanStep>) -> MaestroResult<Self> {
        let mut plan = Self::default();
        plan.restructure(steps)?;
        Ok(plan)
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Last identity handed to an agent.
    pub fn high_water(&self) -> Option<StepId> {
        self.high_water
    }

    pub fn get(&self, step: u32, substep: Option<u32>) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id() == (step, substep))
    }

    /// The entry `id` if it can be dispatched now: present, not COMPLETED and
    /// not a parent whose work lives in substeps.
    pub fn actionable(&self, step: u32, substep: Option<u32>) -> Option<&PlanStep> {
        self.get(step, substep).filter(|s| {
            s.status != StepStatus::Completed
                && !(s.substep.is_none() && self.has_substeps(s.step))
        })
    }

    /// True once the plan is non-empty and every entry is COMPLETED.
    pub fn is_terminal(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }

    /// First open entry in `(step, substep)` order. A parent with substeps is
    /// never returned itself; its first open substep is.
    pub fn next_actionable(&self) -> Option<&PlanStep> {
        self.steps.iter().find(|s| {
            s.status != StepStatus::Completed
                && !(s.substep.is_none() && self.has_substeps(s.step))
        })
    }

    /// Apply status updates. Either every update applies or none does.
    ///
    /// Updates naming an unknown identity are rejected. Requests to move a
    /// status backwards are ignored.
    pub fn apply_status_updates(&mut self, updates: &[StatusUpdate]) -> MaestroResult<()> {
        for u in updates {
            if self.get(u.step, u.substep).is_none() {
                return Err(MaestroError::Plan(format!(
                    "status update for unknown step {}",
                    step_label((u.step, u.substep))
                )));
            }
        }
        for u in updates {
            if let Some(entry) = self.entry_mut((u.step, u.substep)) {
                entry.status = entry.status.max(u.status);
            }
        }
        self.normalize();
        Ok(())
    }

    /// Replace the plan with `new_steps`.
    ///
    /// Statuses of identities present in both plans never regress. COMPLETED
    /// entries omitted from `new_steps` are kept. New identities at or below
    /// the high-water mark are rejected, as are duplicate identities.
    pub fn restructure(&mut self, new_steps: Vec<PlanStep>) -> MaestroResult<()> {
        let mut incoming: BTreeMap<StepId, PlanStep> = BTreeMap::new();
        for step in new_steps {
            if step.step == 0 || step.substep == Some(0) {
                return Err(MaestroError::Plan(format!(
                    "step numbering is 1-based, got {}",
                    step_label(step.id())
                )));
            }
            if let Some(dup) = incoming.insert(step.id(), step) {
                return Err(MaestroError::Plan(format!(
                    "duplicate step {} in restructure",
                    step_label(dup.id())
                )));
            }
        }

        let existing: BTreeSet<StepId> = self.steps.iter().map(PlanStep::id).collect();
        if let Some(hw) = self.high_water {
            if let Some(id) = incoming.keys().find(|id| !existing.contains(id) && **id <= hw) {
                return Err(MaestroError::Plan(format!(
                    "cannot insert step {} before already dispatched step {}",
                    step_label(*id),
                    step_label(hw)
                )));
            }
        }

        for old in &self.steps {
            match incoming.get_mut(&old.id()) {
                Some(new) => {
                    new.status = new.status.max(old.status);
                    if new.assigned_agent.is_none() {
                        new.assigned_agent.clone_from(&old.assigned_agent);
                    }
                }
                None if old.status == StepStatus::Completed => {
                    incoming.insert(old.id(), old.clone());
                }
                None => {}
            }
        }

        self.steps = incoming.into_values().collect();
        self.normalize();
        Ok(())
    }

    /// Record that `id` was handed to `agent`: IN_PROGRESS, assigned, and the
    /// new high-water mark.
    pub fn mark_dispatched(
        &mut self,
        step: u32,
        substep: Option<u32>,
        agent: &str,
    ) -> MaestroResult<()> {
        let id = (step, substep);
        let entry = self.entry_mut(id).ok_or_else(|| {
            MaestroError::Plan(format!("cannot dispatch unknown step {}", step_label(id)))
        })?;
        entry.status = entry.status.max(StepStatus::InProgress);
        entry.assigned_agent = Some(agent.to_string());
        self.high_water = Some(self.high_water.map_or(id, |hw| hw.max(id)));
        self.normalize();
        Ok(())
    }

    fn has_substeps(&self, step: u32) -> bool {
        self.steps.iter().any(|s| s.step == step && s.substep.is_some())
    }

    fn entry_mut(&mut self, id: StepId) -> Option<&mut PlanStep> {
        self.steps.iter_mut().find(|s| s.id() == id)
    }

    fn normalize(&mut self) {
        self.steps.sort_by_key(PlanStep::id);

        let parents: Vec<u32> = self
            .steps
            .iter()
            .filter(|s| s.substep.is_none())
            .map(|s| s.step)
            .collect();

        for parent in parents {
            let subs: Vec<StepStatus> = self
                .steps
                .iter()
                .filter(|s| s.step == parent && s.substep.is_some())
                .map(|s| s.status)
                .collect();
            if subs.is_empty() {
                continue;
            }
            let parent_status = self
                .entry_mut((parent, None))
                .map_or(StepStatus::Pending, |p| p.status);

            let target = if parent_status == StepStatus::Completed
                || subs.iter().all(|s| *s == StepStatus::Completed)
            {
                StepStatus::Completed
            } else if subs.iter().any(|s| *s != StepStatus::Pending) {
                StepStatus::InProgress
            } else {
                parent_status
            };

            if let Some(p) = self.entry_mut((parent, None)) {
                p.status = p.status.max(target);
            }
            if target == StepStatus::Completed {
                for s in self
                    .steps
                    .iter_mut()
                    .filter(|s| s.step == parent && s.substep.is_some())
                {
                    s.status = StepStatus::Completed;
                }
            }
        }
    }
}

pub(crate) fn step_label((step, substep): StepId) -> String {
    match substep {
        Some(sub) => format!("{step}.{sub}"),
        None => step.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn nested() -> Plan {
        Plan::from_steps(vec![
            PlanStep::new(1, "research"),
            PlanStep::substep(1, 1, "find sources"),
            PlanStep::substep(1, 2, "summarize"),
            PlanStep::new(2, "write"),
        ])
        .unwrap()
    }

    #[test]
    fn test_initial_plan() {
        let plan = Plan::initial("add 1 and 1");
        assert_eq!(plan.steps().len(), 1);
        let step = &plan.steps()[0];
        assert_eq!((step.step, step.substep), (1, None));
        assert_eq!(step.status, StepStatus::Pending);
        assert!(!plan.is_terminal());
    }

    #[test]
    fn test_next_actionable_descends_into_substeps() {
        let mut plan = nested();
        assert_eq!(plan.next_actionable().unwrap().id(), (1, Some(1)));

        plan.apply_status_updates(&[StatusUpdate::new(1, Some(1), StepStatus::Completed)])
            .unwrap();
        assert_eq!(plan.next_actionable().unwrap().id(), (1, Some(2)));
        assert_eq!(plan.get(1, None).unwrap().status, StepStatus::InProgress);

        plan.apply_status_updates(&[StatusUpdate::new(1, Some(2), StepStatus::Completed)])
            .unwrap();
        assert_eq!(plan.get(1, None).unwrap().status, StepStatus::Completed);
        assert_eq!(plan.next_actionable().unwrap().id(), (2, None));
    }

    #[test]
    fn test_actionable_rejects_parents_completed_and_unknown_entries() {
        let mut plan = nested();
        assert!(plan.actionable(1, None).is_none());
        assert!(plan.actionable(9, None).is_none());
        assert_eq!(plan.actionable(2, None).unwrap().id(), (2, None));

        plan.apply_status_updates(&[StatusUpdate::new(1, Some(1), StepStatus::Completed)])
            .unwrap();
        assert!(plan.actionable(1, Some(1)).is_none());
        assert!(plan.actionable(1, Some(2)).is_some());
    }

    #[test]
    fn test_completing_parent_completes_substeps() {
        let mut plan = nested();
        plan.apply_status_updates(&[StatusUpdate::new(1, None, StepStatus::Completed)])
            .unwrap();
        assert!(plan
            .steps()
            .iter()
            .filter(|s| s.step == 1)
            .all(|s| s.status == StepStatus::Completed));
    }

    #[test]
    fn test_status_never_regresses() {
        let mut plan = Plan::initial("t");
        plan.apply_status_updates(&[StatusUpdate::new(1, None, StepStatus::Completed)])
            .unwrap();
        plan.apply_status_updates(&[StatusUpdate::new(1, None, StepStatus::Pending)])
            .unwrap();
        assert_eq!(plan.get(1, None).unwrap().status, StepStatus::Completed);
        assert!(plan.is_terminal());
    }

    #[test]
    fn test_unknown_step_update_is_rejected_atomically() {
        let mut plan = nested();
        let err = plan
            .apply_status_updates(&[
                StatusUpdate::new(2, None, StepStatus::Completed),
                StatusUpdate::new(9, None, StepStatus::Completed),
            ])
            .unwrap_err();
        assert_eq!(err.code(), "PlanError");
        assert_eq!(plan.get(2, None).unwrap().status, StepStatus::Pending);
    }

    #[test]
    fn test_restructure_preserves_completed_and_rejects_duplicates() {
        let mut plan = nested();
        plan.apply_status_updates(&[StatusUpdate::new(1, Some(1), StepStatus::Completed)])
            .unwrap();

        plan.restructure(vec![
            PlanStep::new(1, "research (revised)"),
            PlanStep::substep(1, 1, "find sources"),
            PlanStep::substep(1, 2, "summarize"),
            PlanStep::new(2, "write"),
            PlanStep::new(3, "review"),
        ])
        .unwrap();
        assert_eq!(plan.get(1, Some(1)).unwrap().status, StepStatus::Completed);
        assert_eq!(plan.get(1, None).unwrap().description, "research (revised)");
        assert_eq!(plan.steps().len(), 5);

        let err = plan
            .restructure(vec![PlanStep::new(4, "a"), PlanStep::new(4, "b")])
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_restructure_keeps_dropped_completed_entries() {
        let mut plan = nested();
        plan.apply_status_updates(&[StatusUpdate::new(1, None, StepStatus::Completed)])
            .unwrap();
        plan.restructure(vec![PlanStep::new(2, "write"), PlanStep::new(3, "publish")])
            .unwrap();
        assert!(plan.get(1, Some(2)).is_some());
        assert!(plan.get(3, None).is_some());
    }

    #[test]
    fn test_restructure_cannot_go_below_high_water() {
        let mut plan = Plan::from_steps(vec![PlanStep::new(2, "b"), PlanStep::new(3, "c")]).unwrap();
        plan.mark_dispatched(2, None, "A").unwrap();
        assert_eq!(plan.high_water(), Some((2, None)));

        let err = plan
            .restructure(vec![PlanStep::new(1, "sneaky"), PlanStep::new(2, "b")])
            .unwrap_err();
        assert_eq!(err.code(), "PlanError");

        // Substeps of the dispatched step sort after it and are allowed.
        plan.restructure(vec![
            PlanStep::new(2, "b"),
            PlanStep::substep(2, 1, "b.1"),
            PlanStep::new(3, "c"),
        ])
        .unwrap();
        assert_eq!(plan.get(2, None).unwrap().assigned_agent.as_deref(), Some("A"));
    }

    #[test]
    fn test_substep_progress_promotes_parent() {
        let mut plan = nested();
        plan.mark_dispatched(1, Some(1), "A").unwrap();
        assert_eq!(plan.get(1, None).unwrap().status, StepStatus::InProgress);
        assert_eq!(plan.get(1, Some(1)).unwrap().status, StepStatus::InProgress);
    }

    #[test]
    fn test_monotonic_under_random_updates() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let statuses = [StepStatus::Pending, StepStatus::InProgress, StepStatus::Completed];
        let ids: Vec<StepId> = nested().steps().iter().map(PlanStep::id).collect();

        for _ in 0..50 {
            let mut plan = nested();
            for _ in 0..30 {
                let before: BTreeMap<StepId, StepStatus> =
                    plan.steps().iter().map(|s| (s.id(), s.status)).collect();
                let id = ids[rng.gen_range(0..ids.len())];
                let status = statuses[rng.gen_range(0..statuses.len())];
                plan.apply_status_updates(&[StatusUpdate::new(id.0, id.1, status)])
                    .unwrap();

                let after: Vec<StepId> = plan.steps().iter().map(PlanStep::id).collect();
                assert!(after.windows(2).all(|w| w[0] < w[1]), "sorted and unique");
                for s in plan.steps() {
                    assert!(s.status >= before[&s.id()], "status regressed for {:?}", s.id());
                    if s.substep.is_some() && s.status == StepStatus::Completed {
                        assert!(plan.get(s.step, None).unwrap().status >= StepStatus::InProgress);
                    }
                }
            }
        }
    }
}
