//! Stateful property testing for the entity cache.
//!
//! Uses proptest-state-machine to check the fetch/invalidate/mutate contract
//! against a reference model: which calls reach the store, and what each
//! fetch returns.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use cutroom_store::{DocumentStore, MemoryStore, Project};
use cutroom_sync::{CacheState, CacheStore, SyncConfig};
use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use serde_json::{Value, json};
use tokio::runtime::Runtime;

/// Operations that can be performed on the project cache.
#[derive(Debug, Clone)]
pub enum CacheOperation {
    /// Add a project to the store behind the cache's back.
    SeedStore,
    /// `fetch(false)`.
    Fetch,
    /// `fetch(true)`.
    ForceFetch,
    /// A `fetch(false)` whose read fails. Only generated while unfetched.
    FailingFetch,
    /// `invalidate()`.
    Invalidate,
    /// `mutate` appending a locally built project.
    MutateAppend,
}

/// Reference model for one entity cache.
#[derive(Clone, Debug, Default)]
pub struct CacheModel {
    /// Ids in the store, oldest first.
    pub stored: Vec<String>,
    /// `None` while unfetched.
    pub cached: Option<Vec<String>>,
    /// Reads the store has served.
    pub reads: usize,
    /// Ids handed out so far, for uniqueness.
    pub next_id: usize,
    /// What the last fetch returned.
    pub last_fetch: Option<Vec<String>>,
}

impl CacheModel {
    /// The store's ordering: newest created first.
    fn read(&self) -> Vec<String> {
        self.stored.iter().rev().cloned().collect()
    }
}

impl ReferenceStateMachine for CacheModel {
    type State = Self;
    type Transition = CacheOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        prop_oneof![
            2 => Just(CacheOperation::SeedStore),
            4 => Just(CacheOperation::Fetch),
            1 => Just(CacheOperation::ForceFetch),
            1 => Just(CacheOperation::FailingFetch),
            2 => Just(CacheOperation::Invalidate),
            2 => Just(CacheOperation::MutateAppend),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        state.last_fetch = None;
        match transition {
            CacheOperation::SeedStore => {
                state.stored.push(format!("p{}", state.next_id));
                state.next_id += 1;
            }
            CacheOperation::Fetch => match &state.cached {
                Some(cached) => state.last_fetch = Some(cached.clone()),
                None => {
                    state.reads += 1;
                    let read = state.read();
                    state.cached = Some(read.clone());
                    state.last_fetch = Some(read);
                }
            },
            CacheOperation::ForceFetch => {
                state.reads += 1;
                let read = state.read();
                state.cached = Some(read.clone());
                state.last_fetch = Some(read);
            }
            CacheOperation::FailingFetch => {
                state.reads += 1;
                state.last_fetch = Some(Vec::new());
            }
            CacheOperation::Invalidate => {
                state.cached = None;
            }
            CacheOperation::MutateAppend => {
                let mut next = state.cached.take().unwrap_or_default();
                next.push(format!("local{}", state.next_id));
                state.next_id += 1;
                state.cached = Some(next);
            }
        }
        state
    }

    fn preconditions(state: &Self::State, transition: &Self::Transition) -> bool {
        // A failure armed while populated would leak into a later read.
        match transition {
            CacheOperation::FailingFetch => state.cached.is_none(),
            _ => true,
        }
    }
}

/// The cache under test with its backing store.
pub struct CacheTestHarness {
    runtime: Runtime,
    memory: MemoryStore,
    caches: CacheStore,
}

impl CacheTestHarness {
    fn new() -> Self {
        let runtime = Runtime::new().expect("Failed to create tokio runtime");
        let memory = MemoryStore::new();
        let store: Arc<dyn DocumentStore> = Arc::new(memory.clone());
        let caches = CacheStore::new(store, &SyncConfig::default());
        Self {
            runtime,
            memory,
            caches,
        }
    }

    fn ids(projects: &[Project]) -> Vec<String> {
        projects.iter().map(|p| p.id.clone()).collect()
    }

    fn apply_operation(&mut self, op: &CacheOperation, model: &CacheModel) {
        let fetched = self.runtime.block_on(async {
            match op {
                CacheOperation::SeedStore => {
                    let id = model.stored.last().expect("seeded id");
                    let created_at = Utc
                        .timestamp_opt(1_700_000_000 + model.stored.len() as i64, 0)
                        .unwrap()
                        .to_rfc3339();
                    if let Value::Object(data) =
                        json!({ "name": id, "createdAt": created_at })
                    {
                        self.memory.seed("projects", id, data);
                    }
                    None
                }
                CacheOperation::Fetch => Some(self.caches.projects.fetch(false).await),
                CacheOperation::ForceFetch => Some(self.caches.projects.fetch(true).await),
                CacheOperation::FailingFetch => {
                    self.memory.fail_next_reads(1);
                    Some(self.caches.projects.fetch(false).await)
                }
                CacheOperation::Invalidate => {
                    self.caches.projects.invalidate();
                    None
                }
                CacheOperation::MutateAppend => {
                    let id = format!("local{}", model.next_id - 1);
                    let local: Project =
                        serde_json::from_value(json!({ "id": id })).expect("project");
                    self.caches.projects.mutate(|prev| {
                        let mut next = prev.map(<[Project]>::to_vec).unwrap_or_default();
                        next.push(local);
                        next
                    });
                    None
                }
            }
        });

        assert_eq!(
            fetched.map(|projects| Self::ids(&projects)),
            model.last_fetch,
            "fetch result after {:?}",
            op
        );
    }
}

impl StateMachineTest for CacheTestHarness {
    type SystemUnderTest = Self;
    type Reference = CacheModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition, ref_state);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        // Every read the cache issued is one the model expected.
        assert_eq!(state.memory.read_count(), ref_state.reads);

        let cached = match state.caches.projects.state() {
            CacheState::Populated(projects) => Some(CacheTestHarness::ids(&projects)),
            CacheState::Unfetched => None,
            CacheState::Loading => panic!("no fetch is in flight between operations"),
        };
        assert_eq!(cached, ref_state.cached);
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 5000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn cache_state_machine_test(sequential 1..40 => CacheTestHarness);
}
