use proptest::prelude::*;
use snapfold_core::{Database, DocMerger, DocumentGroupKey, DocumentStore, YrsMerger};
use tokio::runtime::Runtime;
use yrs::{
    Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, updates::decoder::Decode,
};

/// One generated edit: where to insert (as a fraction of the current length),
/// what to insert, and whether a compaction pass runs right after it.
#[derive(Debug, Clone)]
struct Step {
    position: u8,
    chunk: String,
    compact_after: bool,
}

fn arb_step() -> impl Strategy<Value = Step> {
    (any::<u8>(), "[a-z ]{1,8}", any::<bool>()).prop_map(|(position, chunk, compact_after)| Step {
        position,
        chunk,
        compact_after,
    })
}

struct Editor {
    doc: Doc,
    state_vector: StateVector,
}

impl Editor {
    fn new() -> Self {
        Self {
            doc: Doc::with_client_id(42),
            state_vector: StateVector::default(),
        }
    }

    fn apply(&mut self, step: &Step) -> Vec<u8> {
        let text = self.doc.get_or_insert_text("content");
        let mut txn = self.doc.transact_mut();
        let len = text.len(&txn);
        let index = len * u32::from(step.position) / u32::from(u8::MAX);
        text.insert(&mut txn, index, &step.chunk);
        let update = txn.encode_state_as_update_v1(&self.state_vector);
        self.state_vector = txn.state_vector();
        update
    }

    fn text(&self) -> String {
        let text = self.doc.get_or_insert_text("content");
        text.get_string(&self.doc.transact())
    }
}

fn text_of(state: &[u8]) -> String {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        txn.apply_update(Update::decode_v1(state).expect("decode state"))
            .expect("apply state");
    }
    let text = doc.get_or_insert_text("content");
    text.get_string(&doc.transact())
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn interleaved_compaction_never_loses_updates(
        steps in prop::collection::vec(arb_step(), 1..24),
    ) {
        let runtime = runtime();
        let (resolved, from_identity, expected) = runtime.block_on(async {
            let store = DocumentStore::from_database(&Database::in_memory(), YrsMerger::shared());
            let key = DocumentGroupKey::new("ws-prop", "doc-prop");
            let mut editor = Editor::new();
            let mut updates = Vec::with_capacity(steps.len());

            for step in &steps {
                let update = editor.apply(step);
                store.append_update(&key, &update).await.expect("append");
                updates.push(update);
                if step.compact_after {
                    let report = store.compact_now().await;
                    assert_eq!(report.failed, 0);
                }
            }

            let resolved = store.resolve_state(&key).await.expect("resolve");
            let all: Vec<&[u8]> = updates.iter().map(Vec::as_slice).collect();
            let from_identity = YrsMerger::new().fold(None, &all).expect("fold from identity");
            (resolved, from_identity, editor.text())
        });

        prop_assert_eq!(text_of(&resolved), text_of(&from_identity));
        prop_assert_eq!(text_of(&resolved), expected);
    }

    #[test]
    fn repeated_compaction_is_stable(
        steps in prop::collection::vec(arb_step(), 1..12),
    ) {
        let runtime = runtime();
        let (first, second, pending) = runtime.block_on(async {
            let database = Database::in_memory();
            let store = DocumentStore::from_database(&database, YrsMerger::shared());
            let key = DocumentGroupKey::new("ws-prop", "doc-prop");
            let mut editor = Editor::new();
            for step in &steps {
                store.append_update(&key, &editor.apply(step)).await.expect("append");
            }

            store.compact_now().await;
            let first = database.snapshots().get(&key).await.expect("get").map(|s| s.state);
            store.compact_now().await;
            let second = database.snapshots().get(&key).await.expect("get").map(|s| s.state);
            let pending = store.pending_updates(&key).await.expect("pending").len();
            (first, second, pending)
        });

        prop_assert!(first.is_some());
        prop_assert_eq!(first, second);
        prop_assert_eq!(pending, 0);
    }
}
