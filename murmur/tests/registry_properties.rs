use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use murmur::{Membership, MembershipUpdate, NodeState};
use proptest::prelude::*;

fn addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7946)
}

fn any_state() -> impl Strategy<Value = NodeState> {
    prop_oneof![
        Just(NodeState::Alive),
        Just(NodeState::Suspect),
        Just(NodeState::Dead),
        Just(NodeState::Left),
    ]
}

fn any_update() -> impl Strategy<Value = MembershipUpdate> {
    (0u64..6, any_state()).prop_map(|(incarnation, state)| MembershipUpdate {
        name: "node-a".to_string(),
        addr: addr(),
        incarnation,
        state,
        meta: Vec::new(),
    })
}

fn rank(state: NodeState) -> u8 {
    match state {
        NodeState::Alive => 0,
        NodeState::Suspect => 1,
        NodeState::Dead => 2,
        NodeState::Left => 3,
    }
}

fn final_record(updates: &[MembershipUpdate]) -> (u64, NodeState) {
    let membership = Membership::new();
    for update in updates {
        membership.merge(update);
    }
    let node = membership.get("node-a").expect("at least one update applied");
    (node.incarnation(), node.state())
}

proptest! {
    #[test]
    fn merge_order_does_not_matter(
        (updates, shuffled) in prop::collection::vec(any_update(), 1..24)
            .prop_flat_map(|updates| (Just(updates.clone()), Just(updates).prop_shuffle()))
    ) {
        prop_assert_eq!(final_record(&updates), final_record(&shuffled));
    }

    #[test]
    fn highest_incarnation_then_severity_wins(updates in prop::collection::vec(any_update(), 1..24)) {
        let expected = updates
            .iter()
            .map(|update| (update.incarnation, rank(update.state)))
            .max()
            .unwrap();
        let (incarnation, state) = final_record(&updates);
        prop_assert_eq!((incarnation, rank(state)), expected);
    }

    #[test]
    fn reapplying_an_update_is_a_no_op(updates in prop::collection::vec(any_update(), 1..12)) {
        let membership = Membership::new();
        for update in &updates {
            membership.merge(update);
            prop_assert!(!membership.upsert(update));
        }
    }

    #[test]
    fn alive_with_higher_incarnation_clears_suspicion(incarnation in 0u64..1000) {
        let membership = Membership::new();
        let suspect = MembershipUpdate {
            name: "node-a".to_string(),
            addr: addr(),
            incarnation,
            state: NodeState::Suspect,
            meta: Vec::new(),
        };
        let refuted = MembershipUpdate {
            incarnation: incarnation + 1,
            state: NodeState::Alive,
            ..suspect.clone()
        };

        membership.merge(&suspect);
        prop_assert!(membership.merge(&refuted).state_changed());
        prop_assert_eq!(membership.get("node-a").map(|node| node.state()), Some(NodeState::Alive));

        // the stale suspicion arriving late changes nothing
        prop_assert!(!membership.upsert(&suspect));
    }
}
