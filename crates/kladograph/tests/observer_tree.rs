// Completion-oracle behaviour over hand-built log trees: expected-children
// derivation, the numCopies override, delegated scatters, and monotonicity.

use std::sync::Arc;

use serde_json::json;

use kladograph::arke::{
    entity_types, predicates, AdditiveUpdate, ArkeConnection, MemStore, NewEntity, Relationship,
};
use kladograph::handoff::{Handoff, LogMessage, LogStatus, Received};
use kladograph::klados_log::LogWriter;
use kladograph::observer::Observer;

struct Fixture {
    store: Arc<MemStore>,
    conn: Arc<ArkeConnection>,
    writer: LogWriter,
}

impl Fixture {
    fn new() -> Self {
        let store = Arc::new(MemStore::new());
        let conn = Arc::new(ArkeConnection::Local(Arc::clone(&store)));
        let writer = LogWriter::new(Arc::clone(&conn));
        Self { store, conn, writer }
    }

    async fn collection_with_root(&self, klados_id: &str) -> (String, String) {
        let root = self
            .writer
            .create_log(klados_id, &[], Received::default())
            .await
            .expect("create root log");
        let collection = self
            .store
            .create(NewEntity::new(entity_types::SCATTER_JOB).with_prop("label", json!("job")));
        self.store.apply_additive(&[AdditiveUpdate::relate(
            &collection,
            vec![Relationship::typed(
                predicates::FIRST_LOG,
                &root,
                entity_types::KLADOS_LOG,
            )],
        )]);
        (collection, root)
    }

    async fn done_child(&self, parent: &str) -> String {
        let child = self
            .writer
            .create_log("kg-child", &[parent.to_string()], Received::default())
            .await
            .expect("create child log");
        self.writer
            .complete_log(&child, LogStatus::Done, None, vec![]);
        child
    }

    async fn is_complete(&self, collection: &str) -> bool {
        self.writer.flush().await;
        Observer::new(&self.conn)
            .is_complete(collection)
            .await
            .expect("observer must not error")
    }
}

#[tokio::test]
async fn running_leaf_blocks_completion() {
    let fx = Fixture::new();
    let (collection, root) = fx.collection_with_root("kg-scatter").await;
    assert!(!fx.is_complete(&collection).await, "running leaf");
    fx.writer.complete_log(&root, LogStatus::Done, None, vec![]);
    assert!(fx.is_complete(&collection).await, "empty terminal root");
}

#[tokio::test]
async fn scatter_outputs_set_the_expected_child_count() {
    let fx = Fixture::new();
    let (collection, root) = fx.collection_with_root("kg-scatter").await;
    fx.writer.set_handoffs(
        &root,
        &[Handoff::scatter(vec!["x".into(), "y".into()])],
    );
    fx.writer.complete_log(&root, LogStatus::Done, None, vec![]);
    assert!(
        !fx.is_complete(&collection).await,
        "two children expected, zero present"
    );
    fx.done_child(&root).await;
    assert!(!fx.is_complete(&collection).await, "one of two children");
    fx.done_child(&root).await;
    assert!(fx.is_complete(&collection).await);
}

#[tokio::test]
async fn num_copies_overrides_handoffs_even_without_a_handoff_list() {
    let fx = Fixture::new();
    let (collection, root) = fx.collection_with_root("kg-gather").await;
    // A gather log carrying only the numCopies message metadata.
    fx.writer.complete_log(
        &root,
        LogStatus::Done,
        None,
        vec![LogMessage {
            text: "gathered".into(),
            num_copies: Some(2),
        }],
    );
    fx.done_child(&root).await;
    assert!(
        !fx.is_complete(&collection).await,
        "numCopies=2 is authoritative"
    );
    fx.done_child(&root).await;
    assert!(fx.is_complete(&collection).await);
}

#[tokio::test]
async fn delegated_scatter_is_unknown_until_outputs_land() {
    let fx = Fixture::new();
    let (collection, root) = fx.collection_with_root("kg-scatter").await;
    fx.writer.set_handoffs(&root, &[Handoff::delegated_scatter()]);
    fx.writer.complete_log(&root, LogStatus::Done, None, vec![]);
    let child = fx.done_child(&root).await;
    assert!(
        !fx.is_complete(&collection).await,
        "delegated scatter keeps the tree unknown even with children present"
    );
    // The delegate writes the resolved outputs back onto the handoff.
    fx.writer
        .set_handoffs(&root, &[Handoff::scatter(vec![child])]);
    assert!(fx.is_complete(&collection).await);
}

#[tokio::test]
async fn error_status_is_terminal() {
    let fx = Fixture::new();
    let (collection, root) = fx.collection_with_root("kg-scatter").await;
    fx.writer
        .set_handoffs(&root, &[Handoff::scatter(vec!["x".into()])]);
    fx.writer.complete_log(&root, LogStatus::Done, None, vec![]);
    let child = fx
        .writer
        .create_log("kg-cluster", &[root.clone()], Received::default())
        .await
        .unwrap();
    fx.writer.complete_log(
        &child,
        LogStatus::Error,
        Some("entity not found".into()),
        vec![],
    );
    assert!(
        fx.is_complete(&collection).await,
        "a failed leaf still seals its subtree"
    );
}

#[tokio::test]
async fn completion_is_monotone_under_extra_children() {
    let fx = Fixture::new();
    let (collection, root) = fx.collection_with_root("kg-scatter").await;
    fx.writer
        .set_handoffs(&root, &[Handoff::scatter(vec!["x".into()])]);
    fx.writer.complete_log(&root, LogStatus::Done, None, vec![]);
    fx.done_child(&root).await;
    assert!(fx.is_complete(&collection).await);
    // `sent_to` is a lower bound: a straggler appended later cannot flip a
    // complete tree back to incomplete.
    fx.done_child(&root).await;
    assert!(fx.is_complete(&collection).await);
    assert!(fx.is_complete(&collection).await, "re-evaluation is stable");
}

#[tokio::test]
async fn invoke_pass_and_gather_each_expect_one_child() {
    let fx = Fixture::new();
    let (collection, root) = fx.collection_with_root("kg-mixed").await;
    fx.writer.set_handoffs(
        &root,
        &[
            Handoff::Invoke {
                outputs: vec!["a".into()],
            },
            Handoff::Pass {
                outputs: vec!["b".into()],
            },
            Handoff::Gather {
                outputs: vec!["c".into()],
            },
        ],
    );
    fx.writer.complete_log(&root, LogStatus::Done, None, vec![]);
    for _ in 0..2 {
        fx.done_child(&root).await;
    }
    assert!(!fx.is_complete(&collection).await, "three handoffs, two children");
    fx.done_child(&root).await;
    assert!(fx.is_complete(&collection).await);
}
