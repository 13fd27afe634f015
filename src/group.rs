// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;

use crate::error::{HwError, HwResult};
use crate::hw_stage::HwSlot;

/// Physical pipeline slots a group can occupy. One group id maps to one
/// hardware slot; a stream's chain is a subset of these linked parent/child.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum GroupId {
    Taa0,
    Taa1,
    Isp0,
    Mcs0,
    Vra0,
}

impl GroupId {
    pub fn hw_slot(self) -> HwSlot {
        match self {
            GroupId::Taa0 => HwSlot::Taa0,
            GroupId::Taa1 => HwSlot::Taa1,
            GroupId::Isp0 => HwSlot::Isp0,
            GroupId::Mcs0 => HwSlot::Scaler,
            GroupId::Vra0 => HwSlot::Fd,
        }
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One stage's position in a stream's pipeline topology.
///
/// `child` points toward the sensor/DMA input, `parent` toward the output
/// side. The chain head (no child) is the leader: for OTF streams it is the
/// stage whose config-lock event paces the whole chain.
#[derive(Copy, Clone, Debug)]
pub struct Group {
    pub id: GroupId,
    pub instance: u32,
    pub parent: Option<GroupId>,
    pub child: Option<GroupId>,
    /// Stage consumes the previous stage's output through dedicated wiring
    /// rather than a memory round-trip.
    pub otf_input: bool,
}

impl Group {
    pub fn is_leader(&self) -> bool {
        self.child.is_none()
    }
}

/// Immutable parent/child topology for one stream instance. Built once at
/// stream configuration time; read-only afterwards, so it needs no locking.
#[derive(Clone, Debug)]
pub struct GroupChain {
    instance: u32,
    groups: Vec<Group>,
}

impl GroupChain {
    /// Build and validate a chain from an ordered child-to-parent slice of
    /// `(id, otf_input)` pairs. The first entry becomes the leader.
    pub fn build(instance: u32, members: &[(GroupId, bool)]) -> HwResult<GroupChain> {
        if members.is_empty() {
            return Err(HwError::InvalidGroup { instance });
        }
        let mut groups = Vec::with_capacity(members.len());
        for (i, (id, otf_input)) in members.iter().enumerate() {
            if members.iter().filter(|(other, _)| other == id).count() > 1 {
                return Err(HwError::InvalidGroup { instance });
            }
            groups.push(Group {
                id: *id,
                instance,
                child: if i == 0 { None } else { Some(members[i - 1].0) },
                parent: members.get(i + 1).map(|(id, _)| *id),
                otf_input: *otf_input,
            });
        }
        Ok(GroupChain { instance, groups })
    }

    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn get(&self, id: GroupId) -> HwResult<&Group> {
        self.groups
            .iter()
            .find(|g| g.id == id)
            .ok_or(HwError::GroupNotInChain {
                group: id,
                instance: self.instance,
            })
    }

    pub fn contains(&self, id: GroupId) -> bool {
        self.groups.iter().any(|g| g.id == id)
    }

    pub fn leader(&self) -> &Group {
        // build() guarantees a non-empty chain with the head at index 0.
        &self.groups[0]
    }

    /// Groups from the innermost child of `from` up through `from` itself,
    /// in dispatch order (child first, so earlier pipeline stages are
    /// committed before later ones).
    pub fn child_first_upto(&self, from: GroupId) -> HwResult<Vec<GroupId>> {
        let upto = self.get(from)?;
        let mut order: Vec<GroupId> = Vec::new();
        let mut cursor = Some(upto.id);
        while let Some(id) = cursor {
            order.push(id);
            cursor = self.get(id)?.child;
        }
        order.reverse();
        Ok(order)
    }

    pub fn members(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter()
    }

    /// True if any member consumes its input on the fly.
    pub fn has_otf_coupling(&self) -> bool {
        self.groups.iter().any(|g| g.otf_input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> GroupChain {
        GroupChain::build(
            0,
            &[(GroupId::Taa0, true), (GroupId::Isp0, true), (GroupId::Mcs0, true)],
        )
        .unwrap()
    }

    #[test]
    fn links_run_both_directions() {
        let c = chain();
        let taa = c.get(GroupId::Taa0).unwrap();
        assert!(taa.is_leader());
        assert_eq!(taa.parent, Some(GroupId::Isp0));

        let isp = c.get(GroupId::Isp0).unwrap();
        assert_eq!(isp.child, Some(GroupId::Taa0));
        assert_eq!(isp.parent, Some(GroupId::Mcs0));

        let mcs = c.get(GroupId::Mcs0).unwrap();
        assert_eq!(mcs.child, Some(GroupId::Isp0));
        assert_eq!(mcs.parent, None);
    }

    #[test]
    fn child_first_walk_reaches_the_sensor_side_first() {
        let c = chain();
        let order = c.child_first_upto(GroupId::Mcs0).unwrap();
        assert_eq!(order, vec![GroupId::Taa0, GroupId::Isp0, GroupId::Mcs0]);

        let order = c.child_first_upto(GroupId::Isp0).unwrap();
        assert_eq!(order, vec![GroupId::Taa0, GroupId::Isp0]);
    }

    #[test]
    fn duplicate_or_empty_membership_is_a_configuration_error() {
        assert!(GroupChain::build(0, &[]).is_err());
        assert!(GroupChain::build(
            0,
            &[(GroupId::Taa0, true), (GroupId::Taa0, false)]
        )
        .is_err());
    }

    #[test]
    fn unknown_group_lookup_fails() {
        let c = chain();
        assert_eq!(
            c.get(GroupId::Vra0).unwrap_err(),
            HwError::GroupNotInChain { group: GroupId::Vra0, instance: 0 }
        );
    }
}
