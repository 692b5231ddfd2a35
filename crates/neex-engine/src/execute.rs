use std::sync::{Arc, Mutex};

use futures::{stream::FuturesUnordered, StreamExt};
use neex_graph_utils::Walker;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, trace};

use crate::{Built, Engine, TaskId};

/// A task handed to the visitor together with the callback it must answer
/// when the task finishes.
pub struct Message<T, U> {
    pub info: T,
    pub callback: oneshot::Sender<U>,
}

impl<T, U> Message<T, U> {
    pub fn new(info: T) -> (Self, oneshot::Receiver<U>) {
        let (callback, receiver) = oneshot::channel();
        (Self { info, callback }, receiver)
    }
}

/// Sentinel a visitor sends back to stop scheduling further tasks; running
/// tasks are the visitor's to cancel.
#[derive(Debug, Clone, Copy)]
pub struct StopExecution;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// When true, the concurrency limit is not enforced; persistent task
    /// runs use this so every dev server starts.
    pub parallel: bool,
    pub concurrency: usize,
}

impl ExecutionOptions {
    pub fn new(parallel: bool, concurrency: usize) -> Self {
        Self {
            parallel,
            concurrency: concurrency.max(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("concurrency semaphore closed while tasks were waiting")]
    Semaphore(#[from] tokio::sync::AcquireError),
    #[error("visitor closed its channel before the walk finished")]
    Visitor,
}

impl<U> From<mpsc::error::SendError<U>> for ExecuteError {
    fn from(_: mpsc::error::SendError<U>) -> Self {
        ExecuteError::Visitor
    }
}

impl Engine<Built> {
    /// Drive the task graph: emit each task to `visitor` as soon as its
    /// dependencies finish, bounded by the concurrency permit pool. The
    /// visitor answers through the message callback; answering with
    /// `StopExecution` cancels the walk.
    pub async fn execute(
        self: Arc<Self>,
        options: ExecutionOptions,
        visitor: mpsc::Sender<Message<TaskId, Result<(), StopExecution>>>,
    ) -> Result<(), ExecuteError> {
        let ExecutionOptions {
            parallel,
            concurrency,
        } = options;
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut in_flight: FuturesUnordered<tokio::task::JoinHandle<Result<(), ExecuteError>>> =
            FuturesUnordered::new();

        let (walk, mut ready) = Walker::walk(&self.task_graph);
        let walk = Arc::new(Mutex::new(walk));
        debug!(
            "executing {} tasks with concurrency {}",
            self.task_count(),
            if parallel { usize::MAX } else { concurrency }
        );

        while let Some((node_ix, done)) = ready.recv().await {
            let visitor = visitor.clone();
            let semaphore = semaphore.clone();
            let walk = walk.clone();
            let engine = self.clone();

            in_flight.push(tokio::spawn(async move {
                let task_id = engine
                    .task_graph
                    .node_weight(node_ix)
                    .expect("walker emits live nodes")
                    .clone();

                let _permit = if parallel {
                    None
                } else {
                    Some(semaphore.acquire().await?)
                };

                let (message, response) = Message::new(task_id);
                visitor.send(message).await?;

                let result = response.await.unwrap_or_else(|_| {
                    trace!("visitor dropped callback, assuming task completed");
                    Ok(())
                });
                if result.is_err() {
                    walk.lock().expect("walk lock").cancel();
                }
                if done.send(()).is_err() {
                    trace!("walk finished before task completion was recorded");
                }
                Ok(())
            }));
        }

        while let Some(joined) = in_flight.next().await {
            joined.expect("task future panicked")?;
        }

        let walk = Arc::into_inner(walk)
            .expect("all walk references released")
            .into_inner()
            .expect("walk lock");
        walk.wait().await;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Building, TaskDefinition};

    fn linear_engine() -> Arc<Engine<Built>> {
        // c -> b -> a (a first)
        let mut engine: Engine<Building> = Engine::new();
        let a = TaskId::new("a", "build");
        let b = TaskId::new("b", "build");
        let c = TaskId::new("c", "build");
        engine.add_dependency(&b, &a);
        engine.add_dependency(&c, &b);
        for id in [&a, &b, &c] {
            engine.add_definition(id.clone(), TaskDefinition::default());
        }
        Arc::new(engine.seal())
    }

    #[tokio::test]
    async fn test_visits_in_dependency_order() {
        let engine = linear_engine();
        let (tx, mut rx) = mpsc::channel(1);
        let run = tokio::spawn(
            engine.execute(ExecutionOptions::new(false, 2), tx),
        );

        let mut order = Vec::new();
        while let Some(message) = rx.recv().await {
            order.push(message.info.to_string());
            message.callback.send(Ok(())).unwrap();
        }
        run.await.unwrap().unwrap();
        assert_eq!(order, vec!["a:build", "b:build", "c:build"]);
    }

    #[tokio::test]
    async fn test_stop_execution_prevents_dependents() {
        let engine = linear_engine();
        let (tx, mut rx) = mpsc::channel(1);
        let run = tokio::spawn(
            engine.execute(ExecutionOptions::new(false, 2), tx),
        );

        let mut visited = Vec::new();
        while let Some(message) = rx.recv().await {
            visited.push(message.info.to_string());
            // fail the first task
            message.callback.send(Err(StopExecution)).unwrap();
        }
        run.await.unwrap().unwrap();
        assert_eq!(visited, vec!["a:build"]);
    }

    #[tokio::test]
    async fn test_concurrency_limit_respected() {
        // three independent tasks, limit 1: the second task is not offered
        // until the first one's callback is answered
        let mut engine: Engine<Building> = Engine::new();
        for pkg in ["a", "b", "c"] {
            let id = TaskId::new(pkg, "build");
            engine.get_index(&id);
            engine.add_definition(id, TaskDefinition::default());
        }
        let engine = Arc::new(engine.seal());

        let (tx, mut rx) = mpsc::channel(3);
        let run = tokio::spawn(
            engine.execute(ExecutionOptions::new(false, 1), tx),
        );

        let first = rx.recv().await.expect("first task offered");
        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv()).await;
        assert!(
            blocked.is_err(),
            "a second task was offered while the permit was held"
        );
        first.callback.send(Ok(())).unwrap();

        let mut remaining = 0;
        while let Some(message) = rx.recv().await {
            remaining += 1;
            message.callback.send(Ok(())).unwrap();
        }
        assert_eq!(remaining, 2);
        run.await.unwrap().unwrap();
    }
}
