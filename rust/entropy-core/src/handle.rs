//! Stamped references to contract slots.
//!
//! A [`ContractHandle`] is a cheap value: `(owner, index, generation)`. It
//! does not own the slot or its closure — copying a handle copies the stamp
//! and nothing else, and dropping one has no effect. Every operation
//! validates the stamp against the live slot, so handles naturally go stale
//! when the slot's generation advances (at the latest, the moment execution
//! begins).

use std::sync::Weak;

use crate::group::{ContractGroup, ScheduleResult, SlotState};

/// Sentinel index used by the null handle.
const NULL_INDEX: u32 = u32::MAX;

/// A value-semantic, generation-stamped reference to a contract slot.
#[derive(Clone)]
pub struct ContractHandle {
    owner: Weak<ContractGroup>,
    index: u32,
    generation: u32,
}

impl ContractHandle {
    pub(crate) fn new(owner: Weak<ContractGroup>, index: u32, generation: u32) -> Self {
        Self {
            owner,
            index,
            generation,
        }
    }

    /// The null handle: refers to nothing, every operation reports invalid.
    pub fn invalid() -> Self {
        Self {
            owner: Weak::new(),
            index: NULL_INDEX,
            generation: 0,
        }
    }

    /// Slot index within the owning group.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation stamped at creation (or selection).
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// `true` when `group` is the group this handle was stamped by.
    pub(crate) fn is_owned_by(&self, group: &ContractGroup) -> bool {
        self.index != NULL_INDEX && std::ptr::eq(self.owner.as_ptr(), group as *const _)
    }

    /// The owning group, if it is still alive.
    pub fn owner(&self) -> Option<std::sync::Arc<ContractGroup>> {
        self.owner.upgrade()
    }

    /// `true` when the handle still refers to a live allocation.
    pub fn valid(&self) -> bool {
        match self.owner.upgrade() {
            Some(group) => group.validate_handle(self),
            None => false,
        }
    }

    /// Schedule the contract. See [`ContractGroup::schedule`].
    pub fn schedule(&self) -> ScheduleResult {
        match self.owner.upgrade() {
            Some(group) => group.schedule(self),
            None => ScheduleResult::Invalid,
        }
    }

    /// Pull the contract back out of the ready set. See
    /// [`ContractGroup::unschedule`].
    pub fn unschedule(&self) -> ScheduleResult {
        match self.owner.upgrade() {
            Some(group) => group.unschedule(self),
            None => ScheduleResult::Invalid,
        }
    }

    /// Give the slot back without running the work. See
    /// [`ContractGroup::release`].
    pub fn release(&self) {
        if let Some(group) = self.owner.upgrade() {
            group.release(self);
        }
    }

    /// `true` while the contract sits in a ready set.
    pub fn is_scheduled(&self) -> bool {
        match self.owner.upgrade() {
            Some(group) => group.contract_state(self) == SlotState::Scheduled,
            None => false,
        }
    }

    /// `true` between selection and the start of execution.
    pub fn is_executing(&self) -> bool {
        match self.owner.upgrade() {
            Some(group) => group.contract_state(self) == SlotState::Executing,
            None => false,
        }
    }
}

impl std::fmt::Debug for ContractHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractHandle")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("owner_alive", &(self.owner.strong_count() > 0))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::ExecutionType;

    #[test]
    fn invalid_handle_reports_invalid_everywhere() {
        let h = ContractHandle::invalid();
        assert!(!h.valid());
        assert!(!h.is_scheduled());
        assert!(!h.is_executing());
        assert_eq!(h.schedule(), ScheduleResult::Invalid);
        assert_eq!(h.unschedule(), ScheduleResult::Invalid);
        h.release(); // no-op, must not panic
    }

    #[test]
    fn clone_copies_the_stamp_only() {
        let group = ContractGroup::new(2, "handles");
        let h = group.create_contract(Box::new(|| {}), ExecutionType::AnyThread);
        let alias = h.clone();
        assert_eq!(h.index(), alias.index());
        assert_eq!(h.generation(), alias.generation());
        assert!(alias.valid());

        // Releasing through one alias invalidates both.
        h.release();
        assert!(!h.valid());
        assert!(!alias.valid());
    }

    #[test]
    fn handle_dispatches_to_owner() {
        let group = ContractGroup::new(2, "dispatch");
        let h = group.create_contract(Box::new(|| {}), ExecutionType::AnyThread);
        assert_eq!(h.schedule(), ScheduleResult::Scheduled);
        assert!(h.is_scheduled());
        assert_eq!(h.unschedule(), ScheduleResult::NotScheduled);
        assert!(!h.is_scheduled());
    }

    #[test]
    fn handle_from_one_group_is_invalid_in_another() {
        let a = ContractGroup::new(2, "a");
        let b = ContractGroup::new(2, "b");
        let h = a.create_contract(Box::new(|| {}), ExecutionType::AnyThread);
        assert_eq!(b.schedule(&h), ScheduleResult::Invalid);
        assert_eq!(b.unschedule(&h), ScheduleResult::Invalid);
    }

    #[test]
    fn handle_outliving_group_is_invalid() {
        let h = {
            let group = ContractGroup::new(2, "short-lived");
            group.create_contract(Box::new(|| {}), ExecutionType::AnyThread)
        };
        assert!(!h.valid());
        assert_eq!(h.schedule(), ScheduleResult::Invalid);
    }
}
