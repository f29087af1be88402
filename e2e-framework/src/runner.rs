//! Sequential suite runner and result summary

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::E2eError;
use crate::scenario::{
    EventKind, Phase, ProgressEvent, Scenario, ScenarioId, ScenarioReport, ScenarioScope,
    ScenarioState,
};

/// Scenarios sharing one scope (one deployed driver).
pub struct Suite<S: ScenarioScope> {
    name: String,
    scope: S,
    scenarios: Vec<Scenario<S::Context>>,
}

impl<S: ScenarioScope> Suite<S> {
    pub fn new(name: impl Into<String>, scope: S) -> Self {
        Self {
            name: name.into(),
            scope,
            scenarios: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scenario(mut self, scenario: Scenario<S::Context>) -> Self {
        self.scenarios.push(scenario);
        self
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}

/// Type-erased suite so suites with different scopes share one run.
#[async_trait]
pub trait RunnableSuite: Send {
    fn name(&self) -> &str;

    async fn run(self: Box<Self>) -> Vec<ScenarioReport>;
}

fn synthetic_report(suite: &str, name: &str, state: ScenarioState, error: Option<E2eError>) -> ScenarioReport {
    let events = match &error {
        Some(e) => vec![ProgressEvent {
            at: Duration::ZERO,
            kind: EventKind::StepFailed {
                phase: Phase::Setup,
                description: name.to_string(),
                kind: e.kind(),
                message: e.to_string(),
            },
        }],
        None => vec![ProgressEvent {
            at: Duration::ZERO,
            kind: EventKind::Skipped(format!("{} setup failed", suite)),
        }],
    };
    ScenarioReport {
        id: ScenarioId {
            suite: suite.to_string(),
            name: name.to_string(),
        },
        state,
        failed_step: error.as_ref().map(|_| name.to_string()),
        error,
        teardown_errors: Vec::new(),
        diagnostics: Vec::new(),
        elapsed: Duration::ZERO,
        events,
    }
}

#[async_trait]
impl<S> RunnableSuite for Suite<S>
where
    S: ScenarioScope + 'static,
    S::Context: 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>) -> Vec<ScenarioReport> {
        let Suite {
            name,
            scope,
            scenarios,
        } = *self;
        let mut reports = Vec::with_capacity(scenarios.len() + 1);
        info!(suite = %name, scenarios = scenarios.len(), "Suite started");

        if let Err(e) = scope.prepare().await {
            error!(suite = %name, error = %e, "Suite setup failed");
            reports.push(synthetic_report(
                &name,
                "suite setup",
                ScenarioState::Failed,
                Some(E2eError::setup(e)),
            ));
            for scenario in &scenarios {
                reports.push(synthetic_report(
                    &name,
                    &scenario.id().name,
                    ScenarioState::Skipped,
                    None,
                ));
            }
        } else {
            for scenario in scenarios {
                reports.push(scenario.run(&scope).await);
            }
        }

        let errors = scope.release().await;
        if !errors.is_empty() {
            for e in &errors {
                warn!(suite = %name, error = %e, "Suite teardown error");
            }
            reports.push(synthetic_report(
                &name,
                "suite teardown",
                ScenarioState::Failed,
                Some(E2eError::Teardown(errors)),
            ));
        }
        info!(suite = %name, "Suite finished");
        reports
    }
}

/// Outcome of a whole run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub scenarios: Vec<ScenarioReport>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn count(&self, state: ScenarioState) -> usize {
        self.scenarios.iter().filter(|r| r.state == state).count()
    }

    /// True iff no scenario failed.
    pub fn success(&self) -> bool {
        self.count(ScenarioState::Failed) == 0
    }

    /// Process exit code: 0 iff every non-skipped scenario succeeded.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }

    /// Tabular summary followed by one block per failure.
    pub fn render(&self) -> String {
        let width = self
            .scenarios
            .iter()
            .map(|r| r.id.to_string().len())
            .max()
            .unwrap_or(8)
            .max(8);

        let mut out = String::new();
        let _ = writeln!(out, "{:<width$}  {:<9}  {:>8}", "SCENARIO", "RESULT", "TIME");
        for r in &self.scenarios {
            let _ = writeln!(
                out,
                "{:<width$}  {:<9}  {:>7}s",
                r.id.to_string(),
                r.state.to_string(),
                r.elapsed.as_secs()
            );
        }
        let _ = writeln!(
            out,
            "\n{} passed, {} failed, {} skipped in {}s",
            self.count(ScenarioState::Succeeded),
            self.count(ScenarioState::Failed),
            self.count(ScenarioState::Skipped),
            self.elapsed.as_secs()
        );

        for r in self.scenarios.iter().filter(|r| r.failed()) {
            let _ = writeln!(out, "\nFAILED {}", r.id);
            if let Some(step) = &r.failed_step {
                let _ = writeln!(out, "  step:    {}", step);
            }
            if let Some(e) = &r.error {
                let _ = writeln!(out, "  kind:    {}", e.kind());
                let _ = writeln!(out, "  error:   {}", e);
                if let Some(stderr) = e.captured_stderr() {
                    let _ = writeln!(out, "  stderr:  {}", stderr);
                }
            }
            for e in &r.teardown_errors {
                let _ = writeln!(out, "  cleanup: {}", e);
            }
            let _ = writeln!(out, "  elapsed: {}s", r.elapsed.as_secs());
        }
        out
    }
}

/// Runs suites one after another.
#[derive(Default)]
pub struct Runner {
    suites: Vec<Box<dyn RunnableSuite>>,
}

impl Runner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<S>(&mut self, suite: Suite<S>)
    where
        S: ScenarioScope + 'static,
        S::Context: 'static,
    {
        self.suites.push(Box::new(suite));
    }

    pub fn suite_names(&self) -> Vec<&str> {
        self.suites.iter().map(|s| s.name()).collect()
    }

    pub async fn run(self) -> RunReport {
        let start = Instant::now();
        let mut scenarios = Vec::new();
        for suite in self.suites {
            scenarios.extend(suite.run().await);
        }
        let report = RunReport {
            scenarios,
            elapsed: start.elapsed(),
        };
        info!(
            passed = report.count(ScenarioState::Succeeded),
            failed = report.count(ScenarioState::Failed),
            skipped = report.count(ScenarioState::Skipped),
            elapsed_secs = report.elapsed.as_secs(),
            "Run finished"
        );
        report
    }
}
