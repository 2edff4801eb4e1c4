use std::future::Future;
use std::ops::ControlFlow;

use taskhost_types::exit::{EXIT_CLEAN, EXIT_WORKER_ERROR};
use taskhost_types::handler::WorkerConfig;
use taskhost_types::identity::Identity;
use taskhost_types::message::{CreatePayload, WorkerEvent, WorkerMessage, decode_line, encode_line};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    ErrorSeverity, ErrorSink, ModuleLoader, ModuleSource, TaskWorker, TaskWorkerError,
    TaskWorkerFactory, TaskWorkerSpec,
};

/// Control loop of a worker process.
///
/// Holds at most one task worker. Returns the process exit code from
/// [`run`](Self::run): `0` on IPC disconnect or shutdown, `3` when the task
/// worker reports a fatal error.
pub struct WorkerRuntime<L, F: TaskWorkerFactory> {
    loader: L,
    factory: F,
    engine_url: String,
    worker: Option<F::Worker>,
    /// Latest identity seen; used when the next worker is created.
    identity: Option<Identity>,
    /// Id of the last worker, kept across `restart`.
    worker_id: Option<String>,
    /// Bumped on every teardown; error reports tagged with an older value are stale.
    generation: u64,
}

impl<L, F> WorkerRuntime<L, F>
where
    L: ModuleLoader,
    F: TaskWorkerFactory,
{
    pub fn new(loader: L, factory: F, engine_url: impl Into<String>) -> Self {
        Self {
            loader,
            factory,
            engine_url: engine_url.into(),
            worker: None,
            identity: None,
            worker_id: None,
            generation: 0,
        }
    }

    /// Process messages from `input` until it closes, `shutdown` resolves or
    /// the task worker fails fatally.
    pub async fn run<R, W>(mut self, input: R, mut output: W, shutdown: impl Future<Output = ()>) -> i32
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        let (errors, mut errors_rx) = mpsc::unbounded_channel::<(u64, TaskWorkerError)>();
        tokio::pin!(shutdown);

        let code = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("termination requested");
                    break EXIT_CLEAN;
                }

                Some((generation, error)) = errors_rx.recv() => {
                    if generation != self.generation {
                        tracing::debug!(error = %error.message, "ignoring error from a replaced task worker");
                        continue;
                    }
                    if let ControlFlow::Break(code) = self.on_worker_error(error) {
                        break code;
                    }
                }

                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match decode_line::<WorkerMessage>(&line) {
                            Ok(message) => {
                                if let ControlFlow::Break(code) = self.handle(message, &mut output, &errors).await {
                                    break code;
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "ignoring malformed control message"),
                        }
                    }
                    Ok(None) => {
                        tracing::info!("supervisor disconnected");
                        break EXIT_CLEAN;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "control channel failed");
                        break EXIT_CLEAN;
                    }
                },
            }
        };

        self.teardown().await;
        code
    }

    async fn handle<W: AsyncWrite + Unpin>(
        &mut self,
        message: WorkerMessage,
        output: &mut W,
        errors: &mpsc::UnboundedSender<(u64, TaskWorkerError)>,
    ) -> ControlFlow<i32> {
        tracing::debug!(action = message.action(), "control message received");
        match message {
            WorkerMessage::Create(payload) => {
                // A second create replaces the running worker like a restart.
                let worker_id = payload.worker_id.clone().or_else(|| self.worker_id.clone());
                self.teardown().await;
                self.create(payload, worker_id, output, errors).await
            }
            WorkerMessage::Restart(payload) => {
                let worker_id = self.worker_id.clone();
                self.teardown().await;
                self.create(payload.into(), worker_id, output, errors).await
            }
            WorkerMessage::UpdateIdentity(payload) => {
                tracing::info!(user_id = %payload.identity.user_id, "identity updated");
                if let Some(worker) = self.worker.as_mut() {
                    worker.set_identity(payload.identity.clone());
                }
                self.identity = Some(payload.identity);
                ControlFlow::Continue(())
            }
        }
    }

    async fn create<W: AsyncWrite + Unpin>(
        &mut self,
        payload: CreatePayload,
        worker_id: Option<String>,
        output: &mut W,
        errors: &mpsc::UnboundedSender<(u64, TaskWorkerError)>,
    ) -> ControlFlow<i32> {
        let CreatePayload {
            topic,
            identity,
            module_text,
            source_path,
            ..
        } = payload;
        self.identity = Some(identity.clone());

        let source = ModuleSource {
            topic: topic.clone(),
            source_path,
            text: module_text,
        };
        let module = match self.loader.load(&source).await {
            Ok(module) => module,
            Err(e) => {
                tracing::error!(topic = %topic, source = %source.source_path.display(), error = %e, "failed to load handler module, waiting for new code");
                return ControlFlow::Continue(());
            }
        };

        let worker_id = worker_id.unwrap_or_else(|| Uuid::now_v7().to_string());
        let spec = TaskWorkerSpec {
            engine_url: self.engine_url.clone(),
            topic: topic.clone(),
            handler: module.handler,
            config: WorkerConfig::merge(module.config.as_ref(), identity, Some(worker_id.clone())),
            errors: ErrorSink::new(errors.clone(), self.generation),
        };

        let worker = match self.factory.create(spec) {
            Ok(worker) => worker,
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "failed to create task worker");
                return ControlFlow::Break(EXIT_WORKER_ERROR);
            }
        };
        self.worker_id = Some(worker.worker_id().to_string());
        self.worker = Some(worker);
        tracing::info!(topic = %topic, worker_id = ?self.worker_id, "task worker running");

        match encode_line(&WorkerEvent::CreateCompleted) {
            Ok(line) => {
                let written = async {
                    output.write_all(line.as_bytes()).await?;
                    output.flush().await
                };
                if let Err(e) = written.await {
                    tracing::warn!(error = %e, "supervisor unreachable");
                    return ControlFlow::Break(EXIT_CLEAN);
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode createCompleted"),
        }

        ControlFlow::Continue(())
    }

    fn on_worker_error(&mut self, error: TaskWorkerError) -> ControlFlow<i32> {
        match error.severity {
            ErrorSeverity::Task => {
                tracing::warn!(task_id = ?error.task_id, error = %error.message, "task failed");
                ControlFlow::Continue(())
            }
            ErrorSeverity::Fatal => {
                tracing::error!(error = %error.message, "task worker failed");
                ControlFlow::Break(EXIT_WORKER_ERROR)
            }
        }
    }

    async fn teardown(&mut self) {
        self.generation += 1;
        if let Some(mut worker) = self.worker.take() {
            worker.stop().await;
            worker.dispose();
            tracing::debug!(worker_id = ?self.worker_id, "task worker stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use futures_util::future::BoxFuture;
    use serde_json::Value;
    use taskhost_types::message::{RestartPayload, UpdateIdentityPayload};
    use tokio::io::{BufReader, DuplexStream, duplex};
    use tokio::sync::oneshot;
    use tokio_util::sync::CancellationToken;

    use crate::runtime::{Handler, LoadError, LoadedModule};
    use taskhost_types::handler::HandlerConfig;

    struct EchoHandler;

    impl Handler for EchoHandler {
        fn invoke(&self, payload: Value, _task: Value, _cancel: CancellationToken) -> BoxFuture<'_, anyhow::Result<Value>> {
            Box::pin(async move { Ok(payload) })
        }
    }

    /// Loads any module except ones containing `BROKEN`.
    struct FakeLoader;

    impl ModuleLoader for FakeLoader {
        async fn load(&self, source: &ModuleSource) -> Result<LoadedModule, LoadError> {
            if source.text.contains("BROKEN") {
                return Err(LoadError::MissingDefaultExport {
                    path: source.source_path.clone(),
                });
            }
            Ok(LoadedModule {
                handler: Arc::new(EchoHandler),
                config: Some(HandlerConfig {
                    lock_duration: Some(30_000),
                    ..HandlerConfig::default()
                }),
            })
        }
    }

    #[derive(Debug, Default)]
    struct Journal {
        created: Vec<(String, WorkerConfig)>,
        identities: Vec<Identity>,
        stopped: usize,
        disposed: usize,
    }

    #[derive(Clone, Default)]
    struct FakeFactory {
        journal: Arc<Mutex<Journal>>,
        sinks: Arc<Mutex<Vec<ErrorSink>>>,
    }

    struct FakeWorker {
        id: String,
        journal: Arc<Mutex<Journal>>,
    }

    impl TaskWorker for FakeWorker {
        fn worker_id(&self) -> &str {
            &self.id
        }

        async fn stop(&mut self) {
            self.journal.lock().unwrap().stopped += 1;
        }

        fn dispose(self) {
            self.journal.lock().unwrap().disposed += 1;
        }

        fn set_identity(&mut self, identity: Identity) {
            self.journal.lock().unwrap().identities.push(identity);
        }
    }

    impl TaskWorkerFactory for FakeFactory {
        type Worker = FakeWorker;

        fn create(&self, spec: TaskWorkerSpec) -> anyhow::Result<FakeWorker> {
            assert_eq!(spec.engine_url, "http://engine.test");
            let id = spec.config.worker_id.clone().unwrap_or_default();
            self.journal
                .lock()
                .unwrap()
                .created
                .push((spec.topic.clone(), spec.config));
            self.sinks.lock().unwrap().push(spec.errors);
            Ok(FakeWorker {
                id,
                journal: Arc::clone(&self.journal),
            })
        }
    }

    struct Harness {
        control: DuplexStream,
        events: BufReader<DuplexStream>,
        shutdown: Option<oneshot::Sender<()>>,
        factory: FakeFactory,
        exit: tokio::task::JoinHandle<i32>,
    }

    fn harness() -> Harness {
        let (control, child_in) = duplex(64 * 1024);
        let (child_out, events) = duplex(64 * 1024);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let factory = FakeFactory::default();

        let runtime = WorkerRuntime::new(FakeLoader, factory.clone(), "http://engine.test");
        let exit = tokio::spawn(runtime.run(BufReader::new(child_in), child_out, async move {
            let _ = shutdown_rx.await;
        }));

        Harness {
            control,
            events: BufReader::new(events),
            shutdown: Some(shutdown_tx),
            factory,
            exit,
        }
    }

    impl Harness {
        async fn send(&mut self, message: WorkerMessage) {
            let line = encode_line(&message).unwrap();
            self.control.write_all(line.as_bytes()).await.unwrap();
        }

        async fn next_event(&mut self) -> WorkerEvent {
            let mut line = String::new();
            self.events.read_line(&mut line).await.unwrap();
            decode_line(&line).unwrap()
        }

        fn journal(&self) -> std::sync::MutexGuard<'_, Journal> {
            self.factory.journal.lock().unwrap()
        }
    }

    fn create(text: &str) -> WorkerMessage {
        WorkerMessage::Create(CreatePayload {
            topic: "billing".to_string(),
            identity: Identity::new("tok-1", "svc"),
            module_text: text.to_string(),
            source_path: PathBuf::from("/app/billing/external_task.ts"),
            worker_id: None,
        })
    }

    fn restart(text: &str) -> WorkerMessage {
        WorkerMessage::Restart(RestartPayload {
            topic: "billing".to_string(),
            identity: Identity::new("tok-2", "svc"),
            module_text: text.to_string(),
            source_path: PathBuf::from("/app/billing/external_task.ts"),
        })
    }

    #[tokio::test]
    async fn test_create_builds_worker_and_acknowledges() {
        let mut h = harness();
        h.send(create("module.exports = {}")).await;

        assert_eq!(h.next_event().await, WorkerEvent::CreateCompleted);
        let journal = h.journal();
        assert_eq!(journal.created.len(), 1);
        let (topic, config) = &journal.created[0];
        assert_eq!(topic, "billing");
        assert_eq!(config.lock_duration, Some(30_000));
        assert_eq!(config.identity.token, "tok-1");
        assert!(config.worker_id.is_some());
    }

    #[tokio::test]
    async fn test_restart_preserves_worker_id() {
        let mut h = harness();
        h.send(create("v1")).await;
        h.next_event().await;
        h.send(restart("v2")).await;
        h.next_event().await;

        let journal = h.journal();
        assert_eq!(journal.created.len(), 2);
        assert_eq!(journal.created[0].1.worker_id, journal.created[1].1.worker_id);
        assert_eq!(journal.created[1].1.identity.token, "tok-2");
        assert_eq!(journal.stopped, 1);
        assert_eq!(journal.disposed, 1);
    }

    #[tokio::test]
    async fn test_update_identity_swaps_in_place() {
        let mut h = harness();
        h.send(create("v1")).await;
        h.next_event().await;

        h.send(WorkerMessage::UpdateIdentity(UpdateIdentityPayload {
            identity: Identity::new("tok-3", "svc"),
        }))
        .await;
        drop(h.control);

        assert_eq!(h.exit.await.unwrap(), EXIT_CLEAN);
        let journal = h.factory.journal.lock().unwrap();
        assert_eq!(journal.identities, vec![Identity::new("tok-3", "svc")]);
        assert_eq!(journal.created.len(), 1);
    }

    #[tokio::test]
    async fn test_load_failure_stays_idle_until_restart() {
        let mut h = harness();
        h.send(create("BROKEN")).await;
        h.send(restart("fixed")).await;

        assert_eq!(h.next_event().await, WorkerEvent::CreateCompleted);
        let journal = h.journal();
        assert_eq!(journal.created.len(), 1);
        assert_eq!(journal.created[0].1.identity.token, "tok-2");
        assert_eq!(journal.stopped, 0);
    }

    #[tokio::test]
    async fn test_disconnect_stops_and_exits_clean() {
        let mut h = harness();
        h.send(create("v1")).await;
        h.next_event().await;
        drop(h.control);

        assert_eq!(h.exit.await.unwrap(), EXIT_CLEAN);
        let journal = h.factory.journal.lock().unwrap();
        assert_eq!(journal.stopped, 1);
        assert_eq!(journal.disposed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_signal_exits_clean() {
        let mut h = harness();
        h.send(create("v1")).await;
        h.next_event().await;

        let _ = h.shutdown.take().unwrap().send(());
        assert_eq!(h.exit.await.unwrap(), EXIT_CLEAN);
        assert_eq!(h.factory.journal.lock().unwrap().disposed, 1);
    }

    #[tokio::test]
    async fn test_task_error_is_logged_fatal_error_exits_3() {
        let mut h = harness();
        h.send(create("v1")).await;
        h.next_event().await;

        let sink = h.factory.sinks.lock().unwrap()[0].clone();
        sink.report(TaskWorkerError::task("task-1", "handler threw"));
        sink.report(TaskWorkerError::fatal("engine rejected credentials"));

        assert_eq!(h.exit.await.unwrap(), EXIT_WORKER_ERROR);
        assert_eq!(h.factory.journal.lock().unwrap().stopped, 1);
    }

    #[tokio::test]
    async fn test_fatal_error_from_replaced_worker_is_ignored() {
        let mut h = harness();
        h.send(create("v1")).await;
        h.next_event().await;
        h.send(restart("v2")).await;
        h.next_event().await;

        let (stale, current) = {
            let sinks = h.factory.sinks.lock().unwrap();
            (sinks[0].clone(), sinks[1].clone())
        };
        stale.report(TaskWorkerError::fatal("late failure from the disposed worker"));
        current.report(TaskWorkerError::task("task-2", "handler threw"));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        h.send(WorkerMessage::UpdateIdentity(UpdateIdentityPayload {
            identity: Identity::new("tok-3", "svc"),
        }))
        .await;
        drop(h.control);

        // The runtime kept serving the new worker until the disconnect.
        assert_eq!(h.exit.await.unwrap(), EXIT_CLEAN);
        let journal = h.factory.journal.lock().unwrap();
        assert_eq!(journal.identities, vec![Identity::new("tok-3", "svc")]);
        assert_eq!(journal.disposed, 2);
    }

    #[tokio::test]
    async fn test_malformed_line_is_ignored() {
        let mut h = harness();
        h.control.write_all(b"not json\n\n").await.unwrap();
        h.send(create("v1")).await;

        assert_eq!(h.next_event().await, WorkerEvent::CreateCompleted);
    }
}
