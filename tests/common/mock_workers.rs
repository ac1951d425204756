//! Agent workers with scripted behavior for integration tests.

use async_trait::async_trait;
use conductor_core::models::Cost;
use conductor_core::orchestration::{
    AgentError, AgentOutput, AgentRequest, AgentWorker, InvocationContext,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Returns scripted results in order, then repeats the fallback forever
pub struct ScriptedWorker {
    script: Mutex<VecDeque<Result<AgentOutput, AgentError>>>,
    fallback: Result<AgentOutput, AgentError>,
    report_stages: bool,
    message: Option<String>,
    calls: AtomicU32,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedWorker {
    fn build(
        script: Vec<Result<AgentOutput, AgentError>>,
        fallback: Result<AgentOutput, AgentError>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            report_stages: false,
            message: None,
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always succeeds with `artifact` at `dollars`
    pub fn succeeding(artifact: &str, dollars: f64) -> Arc<Self> {
        Arc::new(Self::build(
            vec![],
            Ok(AgentOutput::new(artifact, Cost::from_dollars(dollars))),
        ))
    }

    /// Fails with each error in turn, then succeeds
    pub fn failing_then_succeeding(
        errors: Vec<AgentError>,
        artifact: &str,
        dollars: f64,
    ) -> Arc<Self> {
        Arc::new(Self::build(
            errors.into_iter().map(Err).collect(),
            Ok(AgentOutput::new(artifact, Cost::from_dollars(dollars))),
        ))
    }

    /// Always fails with `error`
    pub fn failing(error: AgentError) -> Arc<Self> {
        Arc::new(Self::build(vec![], Err(error)))
    }

    /// Reports the whole build chain and a progress message before returning
    pub fn building(artifact: &str, dollars: f64, message: &str) -> Arc<Self> {
        let output = AgentOutput::new(artifact, Cost::from_dollars(dollars));
        let mut worker = Self::build(vec![], Ok(output));
        worker.report_stages = true;
        worker.message = Some(message.to_string());
        Arc::new(worker)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl AgentWorker for ScriptedWorker {
    async fn invoke(
        &self,
        request: AgentRequest,
        context: InvocationContext,
    ) -> Result<AgentOutput, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);

        if self.report_stages {
            let reporter = context.reporter();
            reporter.deploying();
            reporter.testing();
            reporter.passed();
            reporter.committing();
        }
        if let Some(message) = &self.message {
            context.reporter().message(message);
        }

        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Blocks every invocation until [`BlockingWorker::release`] is called or the
/// execution is cancelled
pub struct BlockingWorker {
    release: watch::Sender<bool>,
    output: AgentOutput,
    calls: AtomicU32,
}

impl BlockingWorker {
    pub fn new(artifact: &str, dollars: f64) -> Arc<Self> {
        let (release, _) = watch::channel(false);
        Arc::new(Self {
            release,
            output: AgentOutput::new(artifact, Cost::from_dollars(dollars)),
            calls: AtomicU32::new(0),
        })
    }

    pub fn release(&self) {
        self.release.send_replace(true);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentWorker for BlockingWorker {
    async fn invoke(
        &self,
        _request: AgentRequest,
        context: InvocationContext,
    ) -> Result<AgentOutput, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut released = self.release.subscribe();
        while !*released.borrow_and_update() {
            tokio::select! {
                changed = released.changed() => {
                    if changed.is_err() {
                        return Err(AgentError::Unavailable("worker dropped".to_string()));
                    }
                }
                _ = context.cancelled() => return Err(AgentError::Cancelled),
            }
        }
        Ok(self.output.clone())
    }
}

/// Sleeps through cancellation and bills for the finished work
pub struct DelayedWorker {
    delay: Duration,
    output: AgentOutput,
    calls: AtomicU32,
}

impl DelayedWorker {
    pub fn new(delay: Duration, artifact: &str, dollars: f64) -> Arc<Self> {
        Arc::new(Self {
            delay,
            output: AgentOutput::new(artifact, Cost::from_dollars(dollars)),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentWorker for DelayedWorker {
    async fn invoke(
        &self,
        _request: AgentRequest,
        _context: InvocationContext,
    ) -> Result<AgentOutput, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.output.clone())
    }
}
