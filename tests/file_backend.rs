//! The manager over the directory-backed store.

use std::sync::Arc;
use tempfile::TempDir;
use treestate::{
    ChangeJournal, ChangeLog, ChangeSet, FilePersistenceConfig, FilePersistenceManager, ItemId,
    ItemState, ItemStatus, LocalItem, Name, NodeId, NodeReferences, NodeReferencesId, Operation,
    OperationKind, PersistenceManager, PropertyId, PropertyType, RepositoryConfig,
    SharedItemStateManager, StateError, StaticNodeTypeRegistry, Value,
};

fn backend_config(dir: &TempDir) -> FilePersistenceConfig {
    FilePersistenceConfig {
        path: dir.path().join("workspace"),
        create_if_missing: true,
        sync_writes: false,
    }
}

fn open_backend(dir: &TempDir) -> Arc<FilePersistenceManager> {
    Arc::new(FilePersistenceManager::open_or_create(backend_config(dir)).unwrap())
}

fn open_manager(backend: Arc<FilePersistenceManager>) -> SharedItemStateManager {
    SharedItemStateManager::new(
        RepositoryConfig::default(),
        backend,
        &StaticNodeTypeRegistry::default(),
    )
    .unwrap()
}

/// Commit a `title` string property on a new child node of the root.
fn commit_titled_child(manager: &SharedItemStateManager, child: NodeId, title: &str) {
    let root_id = manager.root_id();
    let root = manager.get_item_state(&ItemId::Node(root_id)).unwrap();
    let mut root_local = LocalItem::overlaying(&root);
    root_local
        .state_mut()
        .as_node_mut()
        .unwrap()
        .add_child_node_entry(Name::from("page"), child);

    let mut child_state = ItemState::new_node(child, "nt:unstructured".into(), Some(root_id));
    child_state
        .as_node_mut()
        .unwrap()
        .add_property_name(Name::from("title"));
    let mut prop = ItemState::new_property(PropertyId::new(child, "title"), PropertyType::String, false);
    prop.as_property_mut()
        .unwrap()
        .set_values(vec![Value::String(title.to_string())]);

    let mut log = ChangeLog::new(ItemId::Node(root_id));
    log.add_operation(Operation::new(OperationKind::AddNode {
        parent: root_id,
        node: child,
        name: Name::from("page"),
        node_type: Name::from("nt:unstructured"),
    }));
    log.modified(root_local);
    log.added(LocalItem::new(child_state));
    log.added(LocalItem::new(prop));
    manager.store(&mut log, None).unwrap();
}

#[test]
fn test_commit_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let child = NodeId::generate();

    {
        let manager = open_manager(open_backend(&dir));
        commit_titled_child(&manager, child, "Hello");
    }

    let manager = open_manager(open_backend(&dir));
    let root = manager.root().read();
    assert_eq!(root.as_node().unwrap().child_node_entries()[0].id, child);
    drop(root);

    let title = manager
        .get_item_state(&ItemId::Property(PropertyId::new(child, "title")))
        .unwrap();
    let title = title.read();
    assert_eq!(title.status(), ItemStatus::Existing);
    assert_eq!(
        title.as_property().unwrap().values(),
        &[Value::String("Hello".into())]
    );
}

#[test]
fn test_second_manager_on_same_directory_is_locked() {
    let dir = TempDir::new().unwrap();
    let _first = open_manager(open_backend(&dir));
    assert!(matches!(
        FilePersistenceManager::open_or_create(backend_config(&dir)),
        Err(StateError::Locked)
    ));
}

#[test]
fn test_unfinished_batch_replayed_on_open() {
    let dir = TempDir::new().unwrap();
    let orphan = NodeId::generate();

    // Workspace whose only batch was journaled but never applied.
    drop(FilePersistenceManager::create(backend_config(&dir)).unwrap());
    {
        let journal = ChangeJournal::open(dir.path().join("workspace").join("journal")).unwrap();
        journal
            .log(&ChangeSet {
                added: vec![ItemState::new_node(orphan, "nt:base".into(), None)],
                ..Default::default()
            })
            .unwrap();
    }

    let backend = open_backend(&dir);
    assert!(backend.exists(&ItemId::Node(orphan)).unwrap());

    let manager = open_manager(backend);
    let state = manager.get_item_state(&ItemId::Node(orphan)).unwrap();
    assert_eq!(state.read().status(), ItemStatus::Existing);
}

#[test]
fn test_references_persist_across_reopen() {
    let dir = TempDir::new().unwrap();
    let child = NodeId::generate();
    let link = PropertyId::new(NodeId::generate(), "link");

    {
        let manager = open_manager(open_backend(&dir));
        commit_titled_child(&manager, child, "target");

        let mut refs = NodeReferences::new(NodeReferencesId(child));
        refs.add_reference(link.clone());
        let mut log: ChangeLog<LocalItem> = ChangeLog::new(ItemId::Node(manager.root_id()));
        log.modified_refs(refs);
        manager.store(&mut log, None).unwrap();
    }

    let manager = open_manager(open_backend(&dir));
    let refs = manager
        .get_node_references(&NodeReferencesId(child))
        .unwrap();
    assert_eq!(refs.references(), &[link]);
}
