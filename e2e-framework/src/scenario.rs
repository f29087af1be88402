//! Scenario lifecycle
//!
//! A scenario owns ordered setup steps, test steps and teardown steps plus
//! a skip predicate and a time budget. Running it walks the state machine
//!
//! ```text
//! Pending -> Skipped
//! Pending -> SettingUp -> Running -> TearingDown -> Succeeded | Failed
//!                 \______________________/
//!                       (first failure)
//! ```
//!
//! Teardown always runs and is best-effort: every teardown step executes
//! even if an earlier one failed, and its errors are collected rather than
//! propagated.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{error, info, warn};

use crate::error::{E2eError, ErrorKind, Result};
use crate::metrics;

/// (suite, name) of a scenario.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScenarioId {
    pub suite: String,
    pub name: String,
}

impl fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.suite, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioState {
    Pending,
    SettingUp,
    Running,
    TearingDown,
    Succeeded,
    Failed,
    Skipped,
}

impl ScenarioState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScenarioState::Succeeded | ScenarioState::Failed | ScenarioState::Skipped
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition(self, next: ScenarioState) -> bool {
        use ScenarioState::*;
        matches!(
            (self, next),
            (Pending, Skipped)
                | (Pending, SettingUp)
                | (SettingUp, Running)
                | (SettingUp, TearingDown)
                | (Running, TearingDown)
                | (TearingDown, Succeeded)
                | (TearingDown, Failed)
        )
    }
}

impl fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScenarioState::Pending => "Pending",
            ScenarioState::SettingUp => "SettingUp",
            ScenarioState::Running => "Running",
            ScenarioState::TearingDown => "TearingDown",
            ScenarioState::Succeeded => "Succeeded",
            ScenarioState::Failed => "Failed",
            ScenarioState::Skipped => "Skipped",
        };
        write!(f, "{}", s)
    }
}

/// Which list a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Steps,
    Teardown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Setup => "setup",
            Phase::Steps => "step",
            Phase::Teardown => "teardown",
        };
        write!(f, "{}", s)
    }
}

pub type StepFuture<'a> = BoxFuture<'a, Result<()>>;
type StepAction<C> = Box<dyn for<'a> Fn(&'a mut C) -> StepFuture<'a> + Send + Sync>;
type SkipPredicate = Box<dyn Fn() -> Option<String> + Send + Sync>;

/// A described action over the scenario context.
pub struct Step<C> {
    description: String,
    action: StepAction<C>,
}

impl<C> Step<C> {
    pub fn new<F>(description: impl Into<String>, action: F) -> Self
    where
        F: for<'a> Fn(&'a mut C) -> StepFuture<'a> + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            action: Box::new(action),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl<C> fmt::Debug for Step<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("description", &self.description)
            .finish()
    }
}

/// Per-scenario environment: builds the context before setup, cleans up
/// after teardown, and gathers diagnostics on failure. Suite-wide
/// preparation (deploying the driver) happens in `prepare`/`release`.
#[async_trait]
pub trait ScenarioScope: Send + Sync {
    type Context: Send;

    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn release(&self) -> Vec<E2eError> {
        Vec::new()
    }

    async fn enter(&self, id: &ScenarioId) -> Result<Self::Context>;

    /// Remove whatever the scenario left behind.
    async fn leave(&self, ctx: &mut Self::Context) -> Vec<E2eError>;

    /// Pod logs, namespace dumps and similar, collected on failure.
    async fn diagnose(&self, _ctx: &mut Self::Context) -> Vec<String> {
        Vec::new()
    }
}

/// What happened during a run, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    State(ScenarioState),
    Skipped(String),
    StepStarted { phase: Phase, description: String },
    StepPassed { phase: Phase, description: String, elapsed: Duration },
    StepFailed { phase: Phase, description: String, kind: ErrorKind, message: String },
    Diagnostic(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// Offset from the scenario start.
    pub at: Duration,
    pub kind: EventKind,
}

/// Final record of one scenario.
#[derive(Debug)]
pub struct ScenarioReport {
    pub id: ScenarioId,
    pub state: ScenarioState,
    /// Description of the step that failed, if any.
    pub failed_step: Option<String>,
    pub error: Option<E2eError>,
    pub teardown_errors: Vec<E2eError>,
    pub diagnostics: Vec<String>,
    pub elapsed: Duration,
    pub events: Vec<ProgressEvent>,
}

impl ScenarioReport {
    pub fn failed(&self) -> bool {
        self.state == ScenarioState::Failed
    }

    pub fn skip_reason(&self) -> Option<&str> {
        self.events.iter().find_map(|e| match &e.kind {
            EventKind::Skipped(reason) => Some(reason.as_str()),
            _ => None,
        })
    }
}

struct Recorder {
    id: ScenarioId,
    start: Instant,
    state: ScenarioState,
    events: Vec<ProgressEvent>,
}

impl Recorder {
    fn new(id: ScenarioId) -> Self {
        Self {
            id,
            start: Instant::now(),
            state: ScenarioState::Pending,
            events: Vec::new(),
        }
    }

    fn push(&mut self, kind: EventKind) {
        self.events.push(ProgressEvent {
            at: self.start.elapsed(),
            kind,
        });
    }

    fn transition(&mut self, next: ScenarioState) {
        debug_assert!(self.state.can_transition(next), "{} -> {}", self.state, next);
        info!(scenario = %self.id, from = %self.state, to = %next, "Scenario state");
        self.state = next;
        self.push(EventKind::State(next));
    }

    fn step_started(&mut self, phase: Phase, description: &str) {
        info!(scenario = %self.id, phase = %phase, step = %description, "Step started");
        self.push(EventKind::StepStarted {
            phase,
            description: description.to_string(),
        });
    }

    fn step_passed(&mut self, phase: Phase, description: &str, elapsed: Duration) {
        info!(
            scenario = %self.id,
            phase = %phase,
            step = %description,
            elapsed_secs = elapsed.as_secs(),
            "Step passed"
        );
        self.push(EventKind::StepPassed {
            phase,
            description: description.to_string(),
            elapsed,
        });
    }

    fn step_failed(&mut self, phase: Phase, description: &str, e: &E2eError) {
        error!(
            scenario = %self.id,
            phase = %phase,
            step = %description,
            kind = %e.kind(),
            stderr = e.captured_stderr().unwrap_or(""),
            error = %e,
            "Step failed"
        );
        self.push(EventKind::StepFailed {
            phase,
            description: description.to_string(),
            kind: e.kind(),
            message: e.to_string(),
        });
    }

    fn diagnostic(&mut self, text: String) {
        warn!(scenario = %self.id, "Diagnostics:\n{}", text);
        self.push(EventKind::Diagnostic(text.clone()));
    }
}

/// Failure of setup or steps: where it happened and why.
struct Failure {
    phase: Phase,
    step: Option<String>,
    error: E2eError,
}

async fn run_list<C: Send>(
    phase: Phase,
    steps: &[Step<C>],
    ctx: &mut C,
    rec: &mut Recorder,
    current: &mut Option<(Phase, String)>,
) -> std::result::Result<(), Failure> {
    for step in steps {
        *current = Some((phase, step.description.clone()));
        rec.step_started(phase, &step.description);
        let started = Instant::now();
        match (step.action)(ctx).await {
            Ok(()) => rec.step_passed(phase, &step.description, started.elapsed()),
            Err(error) => {
                rec.step_failed(phase, &step.description, &error);
                return Err(Failure {
                    phase,
                    step: Some(step.description.clone()),
                    error,
                });
            }
        }
    }
    *current = None;
    Ok(())
}

/// A named test case.
pub struct Scenario<C> {
    id: ScenarioId,
    skip: Option<SkipPredicate>,
    setup: Vec<Step<C>>,
    steps: Vec<Step<C>>,
    teardown: Vec<Step<C>>,
    budget: Option<Duration>,
}

impl<C: Send> Scenario<C> {
    pub fn new(suite: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ScenarioId {
                suite: suite.into(),
                name: name.into(),
            },
            skip: None,
            setup: Vec::new(),
            steps: Vec::new(),
            teardown: Vec::new(),
            budget: None,
        }
    }

    pub fn id(&self) -> &ScenarioId {
        &self.id
    }

    /// Skip the scenario when `predicate` returns a reason.
    pub fn skip_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.skip = Some(Box::new(predicate));
        self
    }

    pub fn setup<F>(mut self, description: impl Into<String>, action: F) -> Self
    where
        F: for<'a> Fn(&'a mut C) -> StepFuture<'a> + Send + Sync + 'static,
    {
        self.setup.push(Step::new(description, action));
        self
    }

    pub fn step<F>(mut self, description: impl Into<String>, action: F) -> Self
    where
        F: for<'a> Fn(&'a mut C) -> StepFuture<'a> + Send + Sync + 'static,
    {
        self.steps.push(Step::new(description, action));
        self
    }

    pub fn teardown<F>(mut self, description: impl Into<String>, action: F) -> Self
    where
        F: for<'a> Fn(&'a mut C) -> StepFuture<'a> + Send + Sync + 'static,
    {
        self.teardown.push(Step::new(description, action));
        self
    }

    /// Bound setup plus steps; teardown is not counted.
    pub fn budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Execute the full lifecycle once.
    pub async fn run<S>(self, scope: &S) -> ScenarioReport
    where
        S: ScenarioScope<Context = C>,
    {
        let mut rec = Recorder::new(self.id.clone());

        if let Some(reason) = self.skip.as_ref().and_then(|p| p()) {
            info!(scenario = %self.id, reason = %reason, "Scenario skipped");
            rec.transition(ScenarioState::Skipped);
            rec.push(EventKind::Skipped(reason));
            return self.finish(rec, None, None, Vec::new(), Vec::new());
        }

        rec.transition(ScenarioState::SettingUp);
        let mut ctx = match scope.enter(&self.id).await {
            Ok(ctx) => ctx,
            Err(e) => {
                rec.step_failed(Phase::Setup, "enter scenario scope", &e);
                // A failed enter removes whatever it created itself
                rec.transition(ScenarioState::TearingDown);
                rec.transition(ScenarioState::Failed);
                let step = Some("enter scenario scope".to_string());
                return self.finish(rec, step, Some(E2eError::setup(e)), Vec::new(), Vec::new());
            }
        };

        let mut current: Option<(Phase, String)> = None;
        let body = async {
            run_list(Phase::Setup, &self.setup, &mut ctx, &mut rec, &mut current).await?;
            rec.transition(ScenarioState::Running);
            run_list(Phase::Steps, &self.steps, &mut ctx, &mut rec, &mut current).await
        };
        let outcome = match self.budget {
            Some(budget) => match tokio::time::timeout(budget, body).await {
                Ok(result) => result,
                Err(_) => {
                    let (phase, step) = match current.take() {
                        Some((phase, step)) => (phase, Some(step)),
                        None => (Phase::Steps, None),
                    };
                    let error = E2eError::BudgetExceeded(budget);
                    rec.step_failed(phase, step.as_deref().unwrap_or("-"), &error);
                    Err(Failure { phase, step, error })
                }
            },
            None => body.await,
        };

        let mut diagnostics = Vec::new();
        if outcome.is_err() {
            diagnostics = scope.diagnose(&mut ctx).await;
            for d in &diagnostics {
                rec.diagnostic(d.clone());
            }
        }

        rec.transition(ScenarioState::TearingDown);
        let mut teardown_errors = Vec::new();
        for step in &self.teardown {
            rec.step_started(Phase::Teardown, &step.description);
            let started = Instant::now();
            match (step.action)(&mut ctx).await {
                Ok(()) => rec.step_passed(Phase::Teardown, &step.description, started.elapsed()),
                Err(e) => {
                    rec.step_failed(Phase::Teardown, &step.description, &e);
                    teardown_errors.push(e);
                }
            }
        }
        for e in scope.leave(&mut ctx).await {
            rec.step_failed(Phase::Teardown, "leave scenario scope", &e);
            teardown_errors.push(e);
        }

        let (failed_step, error) = match outcome {
            Ok(()) if teardown_errors.is_empty() => (None, None),
            Ok(()) => {
                let more = scope.diagnose(&mut ctx).await;
                for d in &more {
                    rec.diagnostic(d.clone());
                }
                diagnostics.extend(more);
                (None, Some(E2eError::Teardown(std::mem::take(&mut teardown_errors))))
            }
            Err(Failure { phase, step, error }) => {
                let error = match phase {
                    Phase::Setup => E2eError::setup(error),
                    _ => error,
                };
                (step, Some(error))
            }
        };

        rec.transition(if error.is_some() {
            ScenarioState::Failed
        } else {
            ScenarioState::Succeeded
        });
        self.finish(rec, failed_step, error, teardown_errors, diagnostics)
    }

    fn finish(
        &self,
        rec: Recorder,
        failed_step: Option<String>,
        error: Option<E2eError>,
        teardown_errors: Vec<E2eError>,
        diagnostics: Vec<String>,
    ) -> ScenarioReport {
        let elapsed = rec.start.elapsed();
        metrics::record_scenario(&self.id.suite, &rec.state.to_string(), elapsed.as_secs_f64());
        ScenarioReport {
            id: self.id.clone(),
            state: rec.state,
            failed_step,
            error,
            teardown_errors,
            diagnostics,
            elapsed,
            events: rec.events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Trace {
        calls: Vec<String>,
    }

    /// Scope whose context is a call trace.
    #[derive(Default)]
    struct TraceScope {
        left: Mutex<Vec<Vec<String>>>,
        fail_enter: bool,
        leave_error: bool,
    }

    #[async_trait]
    impl ScenarioScope for TraceScope {
        type Context = Trace;

        async fn enter(&self, _id: &ScenarioId) -> Result<Trace> {
            if self.fail_enter {
                return Err(E2eError::Api("namespace quota exceeded".into()));
            }
            Ok(Trace::default())
        }

        async fn leave(&self, ctx: &mut Trace) -> Vec<E2eError> {
            ctx.calls.push("leave".into());
            self.left.lock().unwrap().push(ctx.calls.clone());
            if self.leave_error {
                vec![E2eError::mismatch("pvc/ns/x leaked")]
            } else {
                Vec::new()
            }
        }

        async fn diagnose(&self, ctx: &mut Trace) -> Vec<String> {
            ctx.calls.push("diagnose".into());
            vec!["namespace dump".into()]
        }
    }

    fn record(name: &'static str) -> impl for<'a> Fn(&'a mut Trace) -> StepFuture<'a> + Send + Sync {
        move |t: &mut Trace| {
            async move {
                t.calls.push(name.to_string());
                Ok(())
            }
            .boxed()
        }
    }

    fn fail(name: &'static str) -> impl for<'a> Fn(&'a mut Trace) -> StepFuture<'a> + Send + Sync {
        move |t: &mut Trace| {
            async move {
                t.calls.push(name.to_string());
                Err(E2eError::mismatch(format!("{} broke", name)))
            }
            .boxed()
        }
    }

    fn calls(scope: &TraceScope) -> Vec<String> {
        scope.left.lock().unwrap().last().cloned().unwrap_or_default()
    }

    fn states(report: &ScenarioReport) -> Vec<ScenarioState> {
        report
            .events
            .iter()
            .filter_map(|e| match e.kind {
                EventKind::State(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_success_runs_everything_in_order() {
        let scope = TraceScope::default();
        let report = Scenario::new("rbd", "ok")
            .setup("s1", record("s1"))
            .step("a", record("a"))
            .step("b", record("b"))
            .teardown("t1", record("t1"))
            .run(&scope)
            .await;

        assert_eq!(report.state, ScenarioState::Succeeded);
        assert!(report.error.is_none());
        assert_eq!(calls(&scope), vec!["s1", "a", "b", "t1", "leave"]);
        assert_eq!(
            states(&report),
            vec![
                ScenarioState::SettingUp,
                ScenarioState::Running,
                ScenarioState::TearingDown,
                ScenarioState::Succeeded
            ]
        );
        assert!(report.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn test_step_failure_short_circuits_but_tears_down() {
        let scope = TraceScope::default();
        let report = Scenario::new("rbd", "broken")
            .step("a", fail("a"))
            .step("b", record("b"))
            .teardown("t1", fail("t1"))
            .teardown("t2", record("t2"))
            .run(&scope)
            .await;

        assert_eq!(report.state, ScenarioState::Failed);
        assert_eq!(report.failed_step.as_deref(), Some("a"));
        assert_eq!(report.error.as_ref().unwrap().kind(), ErrorKind::ClusterMismatch);
        // Diagnostics run before teardown, every teardown step runs
        assert_eq!(calls(&scope), vec!["a", "diagnose", "t1", "t2", "leave"]);
        assert_eq!(report.teardown_errors.len(), 1);
        assert_eq!(report.diagnostics, vec!["namespace dump"]);
    }

    #[tokio::test]
    async fn test_setup_failure_is_wrapped() {
        let scope = TraceScope::default();
        let report = Scenario::new("rbd", "setup")
            .setup("s1", fail("s1"))
            .step("a", record("a"))
            .teardown("t1", record("t1"))
            .run(&scope)
            .await;

        assert_eq!(report.state, ScenarioState::Failed);
        assert_eq!(report.error.as_ref().unwrap().kind(), ErrorKind::SetupFailure);
        assert_eq!(calls(&scope), vec!["s1", "diagnose", "t1", "leave"]);
        assert!(!states(&report).contains(&ScenarioState::Running));
    }

    #[tokio::test]
    async fn test_teardown_failure_fails_a_passing_scenario() {
        let scope = TraceScope {
            leave_error: true,
            ..Default::default()
        };
        let report = Scenario::new("rbd", "leaky")
            .step("a", record("a"))
            .run(&scope)
            .await;

        assert_eq!(report.state, ScenarioState::Failed);
        assert!(report.failed_step.is_none());
        assert_eq!(report.error.as_ref().unwrap().kind(), ErrorKind::TeardownFailure);
        // Diagnostics after teardown when only teardown failed
        assert_eq!(report.diagnostics, vec!["namespace dump"]);
    }

    #[tokio::test]
    async fn test_skip_predicate() {
        let scope = TraceScope::default();
        let report = Scenario::new("rbd", "skipped")
            .skip_if(|| Some("rados namespace not configured".into()))
            .step("a", record("a"))
            .run(&scope)
            .await;

        assert_eq!(report.state, ScenarioState::Skipped);
        assert_eq!(report.skip_reason(), Some("rados namespace not configured"));
        assert!(scope.left.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enter_failure_fails_without_teardown() {
        let scope = TraceScope {
            fail_enter: true,
            ..Default::default()
        };
        let report = Scenario::new("rbd", "no-ns")
            .step("a", record("a"))
            .teardown("t1", record("t1"))
            .run(&scope)
            .await;

        assert_eq!(report.state, ScenarioState::Failed);
        assert_eq!(report.error.as_ref().unwrap().kind(), ErrorKind::SetupFailure);
        assert!(scope.left.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_budget_exceeded_names_running_step() {
        let scope = TraceScope::default();
        let report = Scenario::new("rbd", "slow")
            .budget(Duration::from_millis(20))
            .step("sleepy", |t: &mut Trace| {
                async move {
                    t.calls.push("sleepy".into());
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
                .boxed()
            })
            .teardown("t1", record("t1"))
            .run(&scope)
            .await;

        assert_eq!(report.state, ScenarioState::Failed);
        assert_eq!(report.failed_step.as_deref(), Some("sleepy"));
        assert!(matches!(report.error, Some(E2eError::BudgetExceeded(_))));
        assert_eq!(calls(&scope), vec!["sleepy", "diagnose", "t1", "leave"]);
    }

    #[test]
    fn test_transitions() {
        use ScenarioState::*;
        assert!(Pending.can_transition(SettingUp));
        assert!(SettingUp.can_transition(TearingDown));
        assert!(!Running.can_transition(Succeeded));
        assert!(!Succeeded.can_transition(Running));
        assert!(Skipped.is_terminal());
        assert!(!TearingDown.is_terminal());
    }
}
