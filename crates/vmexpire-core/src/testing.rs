//! Test fixtures shared by the core unit tests

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use vmexpire_adapter_api::{MockDeleter, MockNotifier};
use vmexpire_api::{Task, VmRecord};
use vmexpire_config::{ExpirationPolicy, SchedulerConfig};
use vmexpire_store::{SqliteStore, Store};
use vmexpire_util::{ProjectId, VmId};

use crate::{
    EventSink, ExpirationEngine, InlineDispatcher, ManualClock, TaskDispatcher, TaskExecutor,
};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub notifier: MockNotifier,
    pub deleter: MockDeleter,
    pub clock: Arc<ManualClock>,
    pub events: EventSink,
    pub executor: Arc<TaskExecutor>,
    pub engine: Arc<ExpirationEngine>,
}

impl Harness {
    pub fn inline(policy: ExpirationPolicy) -> Self {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        Self::with_dispatcher(policy, store, |executor, _| {
            Arc::new(InlineDispatcher::new(executor))
        })
    }

    pub fn with_dispatcher(
        policy: ExpirationPolicy,
        store: Arc<SqliteStore>,
        make: impl FnOnce(Arc<TaskExecutor>, &EventSink) -> Arc<dyn TaskDispatcher>,
    ) -> Self {
        let notifier = MockNotifier::new();
        let deleter = MockDeleter::new();
        let clock = Arc::new(ManualClock::new(t0()));
        let events = EventSink::default();

        let executor = Arc::new(TaskExecutor::new(
            policy.clone(),
            store.clone(),
            Arc::new(notifier.clone()),
            Arc::new(deleter.clone()),
            Duration::from_millis(500),
            clock.clone(),
            events.clone(),
        ));
        let dispatcher = make(executor.clone(), &events);
        let engine = Arc::new(ExpirationEngine::new(
            policy,
            &SchedulerConfig::default(),
            store.clone(),
            dispatcher,
            events.clone(),
        ));

        Self {
            store,
            notifier,
            deleter,
            clock,
            events,
            executor,
            engine,
        }
    }

    /// Register a VM created at `t0` through the executor
    pub async fn register(&self, id: &str, project: &str) -> VmId {
        let vm_id = VmId::new(id);
        self.executor
            .execute(Task::RegisterCreated {
                vm_id: vm_id.clone(),
                project_id: ProjectId::new(project),
                created_at: t0(),
            })
            .await
            .unwrap();
        vm_id
    }

    pub fn record(&self, vm_id: &VmId) -> VmRecord {
        self.store.get_vm(vm_id).unwrap().unwrap()
    }
}
