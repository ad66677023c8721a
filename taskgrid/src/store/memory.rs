//! In-memory task store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use super::{Completion, TaskStore};
use crate::core::{NewTask, RunId, Task, TaskExecState, TaskId, TaskKey, WorkerId};
use crate::errors::StoreError;
use crate::utils::Timestamp;

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    tasks: BTreeMap<TaskId, Task>,
    by_key: HashMap<TaskKey, Vec<TaskId>>,
}

impl Inner {
    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task, StoreError> {
        self.tasks.get_mut(&id).ok_or(StoreError::UnknownTask(id))
    }
}

/// Task store backed by a mutex-protected map.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    inner: Mutex<Inner>,
}

impl InMemoryTaskStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_transition(task: &Task, to: TaskExecState) -> Result<(), StoreError> {
    if task.exec_state.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::IllegalTransition {
            task_id: task.id,
            from: task.exec_state,
            to,
        })
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: NewTask, now: Timestamp) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock();
        let key = TaskKey {
            run_id: task.params.run_id,
            process_code: task.params.process_code.clone(),
            sub_context_id: task.params.sub_context_id.clone(),
        };

        let live = inner
            .by_key
            .get(&key)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.tasks.get(id))
            .any(|t| t.exec_state != TaskExecState::Error);
        if live {
            return Err(StoreError::DuplicateTask {
                run_id: key.run_id,
                process_code: key.process_code,
                sub_context_id: key.sub_context_id,
            });
        }

        inner.next_id += 1;
        let id = TaskId::new(inner.next_id);
        let record = Task::from_new(id, task, now);
        inner.by_key.entry(key).or_default().push(id);
        inner.tasks.insert(id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.inner.lock().tasks.get(&id).cloned())
    }

    async fn list_run(&self, run_id: RunId) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .inner
            .lock()
            .tasks
            .values()
            .filter(|t| t.run_id() == run_id)
            .cloned()
            .collect())
    }

    async fn list_in_state(&self, state: TaskExecState) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .inner
            .lock()
            .tasks
            .values()
            .filter(|t| t.exec_state == state)
            .cloned()
            .collect())
    }

    async fn transition(&self, id: TaskId, from: TaskExecState, to: TaskExecState) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock();
        let task = inner.task_mut(id)?;
        if task.exec_state != from {
            return Err(StoreError::Conflict(id));
        }
        check_transition(task, to)?;
        task.exec_state = to;
        Ok(task.clone())
    }

    async fn assign(&self, id: TaskId, worker: WorkerId, at: Timestamp) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock();
        let task = inner.task_mut(id)?;
        if task.exec_state != TaskExecState::Assignable {
            return Err(StoreError::Conflict(id));
        }
        task.exec_state = TaskExecState::Assigned;
        task.assigned_worker = Some(worker);
        task.assigned_on = Some(at);
        Ok(task.clone())
    }

    async fn complete(&self, id: TaskId, completion: Completion) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock();
        let task = inner.task_mut(id)?;
        if task.exec_state != completion.from {
            return Err(StoreError::Conflict(id));
        }
        if completion.worker.is_some() && task.assigned_worker != completion.worker {
            return Err(StoreError::Conflict(id));
        }
        check_transition(task, completion.state)?;
        if !completion.state.is_terminal() {
            return Err(StoreError::IllegalTransition {
                task_id: id,
                from: task.exec_state,
                to: completion.state,
            });
        }
        task.exec_state = completion.state;
        task.result_received = completion.worker.is_some();
        task.result = Some(completion.result);
        task.completed_on = Some(completion.at);
        Ok(task.clone())
    }

    async fn reclaim(&self, id: TaskId, worker: WorkerId) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock();
        let task = inner.task_mut(id)?;
        if task.exec_state != TaskExecState::Assigned || task.assigned_worker != Some(worker) {
            return Err(StoreError::Conflict(id));
        }
        task.exec_state = TaskExecState::Assignable;
        task.assigned_worker = None;
        task.assigned_on = None;
        Ok(task.clone())
    }

    async fn delete_run(&self, run_id: RunId) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let before = inner.tasks.len();
        inner.tasks.retain(|_, t| t.run_id() != run_id);
        inner.by_key.retain(|k, _| k.run_id != run_id);
        Ok(before - inner.tasks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TaskParams, TaskResult};
    use crate::graph::FunctionRef;
    use crate::utils::now_utc;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn new_task(run: u64, code: &str) -> NewTask {
        NewTask {
            params: TaskParams {
                run_id: RunId::new(run),
                process_code: code.to_string(),
                sub_context_id: "1".into(),
                function: FunctionRef::new("fn"),
                pre_functions: Vec::new(),
                post_functions: Vec::new(),
                inputs: Vec::new(),
                outputs: Vec::new(),
                inline: BTreeMap::new(),
                timeout_secs: None,
            },
            state: TaskExecState::None,
            priority: 0,
            topo_index: 0,
            tag: None,
            cache_fingerprint: None,
        }
    }

    async fn assignable(store: &InMemoryTaskStore, run: u64, code: &str) -> Task {
        let task = store.insert(new_task(run, code), now_utc()).await.unwrap();
        store
            .transition(task.id, TaskExecState::None, TaskExecState::Assignable)
            .await
            .unwrap()
    }

    fn ok_from(worker: WorkerId) -> Completion {
        Completion {
            from: TaskExecState::Assigned,
            worker: Some(worker),
            state: TaskExecState::Ok,
            result: TaskResult::default(),
            at: now_utc(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_triple_is_rejected() {
        let store = InMemoryTaskStore::new();
        store.insert(new_task(1, "p1"), now_utc()).await.unwrap();
        let err = store.insert(new_task(1, "p1"), now_utc()).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateTask { .. }));

        store.insert(new_task(2, "p1"), now_utc()).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_errored_triple_may_be_produced_again() {
        let store = InMemoryTaskStore::new();
        let worker = WorkerId::new(1);
        let task = assignable(&store, 1, "p1").await;
        store.assign(task.id, worker, now_utc()).await.unwrap();
        store
            .complete(
                task.id,
                Completion {
                    state: TaskExecState::Error,
                    ..ok_from(worker)
                },
            )
            .await
            .unwrap();

        let again = store.insert(new_task(1, "p1"), now_utc()).await.unwrap();
        assert_ne!(again.id, task.id);
    }

    #[tokio::test]
    async fn test_assign_is_exclusive() {
        let store = Arc::new(InMemoryTaskStore::new());
        let id = assignable(&store, 1, "p1").await.id;

        let mut handles = Vec::new();
        for w in 1..=8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.assign(id, WorkerId::new(w), now_utc()).await.is_ok()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_complete_requires_holder() {
        let store = InMemoryTaskStore::new();
        let task = assignable(&store, 1, "p1").await;
        store.assign(task.id, WorkerId::new(1), now_utc()).await.unwrap();

        let err = store.complete(task.id, ok_from(WorkerId::new(2))).await.unwrap_err();
        assert_eq!(err, StoreError::Conflict(task.id));
        let current = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(current.exec_state, TaskExecState::Assigned);
        assert_eq!(current.assigned_worker, Some(WorkerId::new(1)));

        let done = store.complete(task.id, ok_from(WorkerId::new(1))).await.unwrap();
        assert_eq!(done.exec_state, TaskExecState::Ok);
        assert!(done.result_received);
        assert!(done.completed_on.is_some());

        let err = store.complete(task.id, ok_from(WorkerId::new(1))).await.unwrap_err();
        assert_eq!(err, StoreError::Conflict(task.id));
    }

    #[tokio::test]
    async fn test_illegal_transition() {
        let store = InMemoryTaskStore::new();
        let task = store.insert(new_task(1, "p1"), now_utc()).await.unwrap();
        let err = store
            .transition(task.id, TaskExecState::None, TaskExecState::Ok)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn test_reclaim_and_delete() {
        let store = InMemoryTaskStore::new();
        let task = assignable(&store, 7, "p1").await;
        store.assign(task.id, WorkerId::new(3), now_utc()).await.unwrap();

        assert!(store.reclaim(task.id, WorkerId::new(4)).await.is_err());
        let back = store.reclaim(task.id, WorkerId::new(3)).await.unwrap();
        assert_eq!(back.exec_state, TaskExecState::Assignable);
        assert_eq!(back.assigned_worker, None);

        assignable(&store, 8, "p1").await;
        assert_eq!(store.delete_run(RunId::new(7)).await.unwrap(), 1);
        assert!(store.list_run(RunId::new(7)).await.unwrap().is_empty());
        assert_eq!(store.list_in_state(TaskExecState::Assignable).await.unwrap().len(), 1);
    }
}
