//! Property tests for change log classification and set algebra.

use proptest::prelude::*;
use std::collections::HashMap;
use treestate::{ChangeLog, ItemId, ItemState, NodeId, Operation, OperationKind};

const POOL: usize = 6;

#[derive(Clone, Copy, Debug)]
enum Action {
    Added(usize),
    Modified(usize),
    Deleted(usize),
    Operation(usize),
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Class {
    Added,
    Modified,
    Deleted,
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0..POOL).prop_map(Action::Added),
        (0..POOL).prop_map(Action::Modified),
        (0..POOL).prop_map(Action::Deleted),
        (0..POOL).prop_map(Action::Operation),
    ]
}

fn pool() -> Vec<NodeId> {
    (0..POOL)
        .map(|i| NodeId::from_name(&format!("node-{}", i)))
        .collect()
}

fn state(id: NodeId) -> ItemState {
    ItemState::new_node(id, "nt:base".into(), None)
}

fn target() -> ItemId {
    ItemId::Node(NodeId::from_name("target"))
}

fn apply(log: &mut ChangeLog<ItemState>, ids: &[NodeId], actions: &[Action]) {
    for action in actions {
        match *action {
            Action::Added(i) => log.added(state(ids[i])),
            Action::Modified(i) => log.modified(state(ids[i])),
            Action::Deleted(i) => log.deleted(state(ids[i])),
            Action::Operation(i) => {
                log.add_operation(Operation::new(OperationKind::SetMixins { node: ids[i] }));
            }
        }
    }
}

fn classify(log: &ChangeLog<ItemState>, id: &ItemId) -> Option<Class> {
    match (log.is_added(id), log.is_modified(id), log.is_deleted(id)) {
        (true, false, false) => Some(Class::Added),
        (false, true, false) => Some(Class::Modified),
        (false, false, true) => Some(Class::Deleted),
        (false, false, false) => None,
        overlap => panic!("{} is in more than one set: {:?}", id, overlap),
    }
}

fn snapshot(log: &ChangeLog<ItemState>, ids: &[NodeId]) -> Vec<Option<Class>> {
    ids.iter()
        .map(|id| classify(log, &ItemId::Node(*id)))
        .collect()
}

proptest! {
    #[test]
    fn classification_matches_model(actions in prop::collection::vec(action(), 0..40)) {
        let ids = pool();
        let mut log = ChangeLog::new(target());
        apply(&mut log, &ids, &actions);

        let mut model: HashMap<usize, Class> = HashMap::new();
        for action in &actions {
            match *action {
                Action::Added(i) => {
                    let next = match model.get(&i) {
                        Some(Class::Deleted) | Some(Class::Modified) => Class::Modified,
                        _ => Class::Added,
                    };
                    model.insert(i, next);
                }
                Action::Modified(i) => {
                    model.entry(i).or_insert(Class::Modified);
                }
                Action::Deleted(i) => {
                    if model.get(&i) == Some(&Class::Added) {
                        model.remove(&i);
                    } else {
                        model.insert(i, Class::Deleted);
                    }
                }
                Action::Operation(_) => {}
            }
        }

        for (i, id) in ids.iter().enumerate() {
            prop_assert_eq!(classify(&log, &ItemId::Node(*id)), model.get(&i).copied());
        }
        prop_assert_eq!(
            log.added_count() + log.modified_count() + log.deleted_count(),
            model.len()
        );
    }

    #[test]
    fn empty_iff_no_operation(actions in prop::collection::vec(action(), 0..30)) {
        let ids = pool();
        let mut log = ChangeLog::new(target());
        apply(&mut log, &ids, &actions);

        let any_operation = actions.iter().any(|a| matches!(a, Action::Operation(_)));
        prop_assert_eq!(log.is_empty(), !any_operation);
    }

    #[test]
    fn remove_all_is_idempotent(
        outer in prop::collection::vec(action(), 0..30),
        inner in prop::collection::vec(action(), 0..15),
    ) {
        let ids = pool();
        let mut log = ChangeLog::new(target());
        apply(&mut log, &ids, &outer);
        let mut sub = ChangeLog::new(target());
        apply(&mut sub, &ids, &inner);

        log.remove_all(&sub);
        let once = snapshot(&log, &ids);
        let ops_once = log.operation_count();

        log.remove_all(&sub);
        prop_assert_eq!(snapshot(&log, &ids), once);
        prop_assert_eq!(log.operation_count(), ops_once);

        for id in &ids {
            let id = ItemId::Node(*id);
            if sub.is_added(&id) {
                prop_assert!(!log.is_added(&id));
            }
            if sub.is_modified(&id) {
                prop_assert!(!log.is_modified(&id));
            }
            if sub.is_deleted(&id) {
                prop_assert!(!log.is_deleted(&id));
            }
        }
    }

    #[test]
    fn self_contained_iff_operations_in_scope(actions in prop::collection::vec(action(), 0..30)) {
        let ids = pool();
        let mut log = ChangeLog::new(target());
        apply(&mut log, &ids, &actions);

        let contained = log
            .operations()
            .all(|op| op.affected_items().iter().all(|id| log.has(id)));
        prop_assert_eq!(log.check_is_self_contained().is_ok(), contained);
    }
}

#[test]
fn test_modified_then_deleted() {
    let ids = pool();
    let mut log = ChangeLog::new(target());
    apply(
        &mut log,
        &ids,
        &[Action::Modified(0), Action::Deleted(0), Action::Added(1), Action::Deleted(1)],
    );
    assert_eq!(classify(&log, &ItemId::Node(ids[0])), Some(Class::Deleted));
    assert_eq!(classify(&log, &ItemId::Node(ids[1])), None);
}
