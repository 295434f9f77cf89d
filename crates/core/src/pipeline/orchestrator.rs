//! # Orchestrator
//!
//! Runs the stage plan for one goal: resolves each stage's inputs from
//! earlier results, renders the role prompt, invokes the capability provider
//! under a timeout and the caller's cancellation token, parses the reply and
//! applies the failure policy. The finished bundle is handed to the
//! recorder when one is configured.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bundle::{ResultBundle, StageResult};
use super::events::{PipelineEvent, PipelineEventKind};
use super::intent::{IntentClassifier, KeywordGate};
use super::output_parser;
use super::stage::{
    default_plan, validate_plan, PipelineRun, RunStatus, SelectorField, StageName, StageSpec,
};
use crate::capabilities::{CapabilityProvider, IntakeParser, PromptLibrary, PromptVars};
use crate::error::PipelineError;
use crate::state::RunRecorder;

/// What to do when a structured stage returns undecodable output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseFailurePolicy {
    /// Record the parse error and keep going
    #[default]
    DegradeAndContinue,
    /// Treat a parse error as fatal
    FailFast,
}

/// Orchestrator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Upper bound for a single stage invocation, in milliseconds
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
    #[serde(default)]
    pub parse_failure_policy: ParseFailurePolicy,
    /// Run the intake role on chat messages before a full run
    #[serde(default = "default_true")]
    pub intake_enabled: bool,
}

fn default_stage_timeout_ms() -> u64 {
    180_000
}

fn default_true() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_ms: default_stage_timeout_ms(),
            parse_failure_policy: ParseFailurePolicy::default(),
            intake_enabled: true,
        }
    }
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_policy(mut self, policy: ParseFailurePolicy) -> Self {
        self.parse_failure_policy = policy;
        self
    }

    pub fn with_intake(mut self, enabled: bool) -> Self {
        self.intake_enabled = enabled;
        self
    }
}

const GREETING_REPLY: &str = "你好！我是 ThinkTank AI 参谋团。告诉我你想做的项目，例如“开发一个在线教育平台”，我会为你完成需求分析、任务规划、市场调研、产品需求文档、工具推荐和综合评估。";

const MORE_DETAIL_REPLY: &str = "请更详细地描述你的项目：你想做什么产品、面向哪些用户、要解决什么问题？描述越具体，参谋团给出的方案越有针对性。";

fn greeting_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^\s*(你好|您好|嗨|哈喽|在吗|hi|hello|hey)([\s,，!！.。~]|$)")
            .expect("greeting regex is valid")
    })
}

/// Drives the stage plan
pub struct Orchestrator {
    config: PipelineConfig,
    plan: Vec<StageSpec>,
    provider: Arc<dyn CapabilityProvider>,
    prompts: PromptLibrary,
    classifier: Arc<dyn IntentClassifier>,
    recorder: Option<RunRecorder>,
    event_tx: Option<mpsc::Sender<PipelineEvent>>,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        provider: Arc<dyn CapabilityProvider>,
        prompts: PromptLibrary,
    ) -> Self {
        Self {
            config,
            plan: default_plan(),
            provider,
            prompts,
            classifier: Arc::new(KeywordGate),
            recorder: None,
            event_tx: None,
        }
    }

    /// Persist every full run through this recorder
    pub fn with_recorder(mut self, recorder: RunRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Set event channel for streaming events
    pub fn with_event_channel(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Replace the keyword gate
    pub fn with_classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Replace the stage plan; rejected if a selector looks forward
    pub fn with_plan(mut self, plan: Vec<StageSpec>) -> Result<Self, PipelineError> {
        validate_plan(&plan).map_err(PipelineError::InvalidInput)?;
        self.plan = plan;
        Ok(self)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn plan(&self) -> &[StageSpec] {
        &self.plan
    }

    async fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    async fn emit_for(&self, run_key: &str, event: PipelineEvent) {
        self.emit(event.with_run(run_key)).await;
    }

    /// Route a chat message to a full run or a canned reply
    pub async fn handle_message(&self, message: &str, cancel: &CancellationToken) -> ResultBundle {
        let decision = self.classifier.classify(message);
        debug!(full_pipeline = decision.full_pipeline, "handle_message: classified");

        if !decision.full_pipeline {
            return self.run_simple(message).await;
        }

        let (goal, context) = if self.config.intake_enabled {
            let parsed = IntakeParser::new(
                self.provider.as_ref(),
                &self.prompts,
                self.config.stage_timeout(),
            )
            .parse(message, cancel)
            .await;
            (parsed.goal, parsed.context)
        } else {
            (message.trim().to_string(), String::new())
        };

        self.run(&goal, Some(&context), cancel).await
    }

    /// Answer without running any stage; never persisted
    pub async fn run_simple(&self, message: &str) -> ResultBundle {
        let reply = if greeting_pattern().is_match(message) {
            GREETING_REPLY
        } else {
            MORE_DETAIL_REPLY
        };

        let run_key = uuid::Uuid::new_v4().to_string();
        self.emit_for(&run_key, PipelineEvent::new(PipelineEventKind::RunBypassed))
            .await;

        let mut bundle = ResultBundle::bypassed(&self.plan, reply);
        bundle.run_key = Some(run_key);
        bundle
    }

    /// Execute every stage of the plan for `goal`
    #[tracing::instrument(skip(self, goal, context, cancel), fields(goal_preview = %goal.chars().take(50).collect::<String>()))]
    pub async fn run(
        &self,
        goal: &str,
        context: Option<&str>,
        cancel: &CancellationToken,
    ) -> ResultBundle {
        if goal.trim().is_empty() {
            let err = PipelineError::InvalidInput("goal must not be empty".to_string());
            warn!("run: rejected before start: {}", err);
            return ResultBundle::rejected(&self.plan, &err);
        }

        let mut run = PipelineRun::new(goal.trim(), context);
        if let Err(e) = run.transition(RunStatus::Running) {
            warn!("run: {}", e);
        }

        info!(run_key = %run.key, stages = self.plan.len(), "run: started");
        self.emit_for(
            &run.key,
            PipelineEvent::new(PipelineEventKind::RunStarted)
                .with_data(json!({ "goal": run.goal, "context": run.context })),
        )
        .await;

        let mut results: Vec<StageResult> = Vec::new();
        let mut failure: Option<(Option<StageName>, PipelineError)> = None;

        for spec in &self.plan {
            if cancel.is_cancelled() {
                failure = Some((Some(spec.name), PipelineError::Cancelled { stage: spec.name }));
                break;
            }

            self.emit_for(
                &run.key,
                PipelineEvent::for_stage(PipelineEventKind::StageStarted, spec.name),
            )
            .await;

            let vars = self.resolve_inputs(&run, spec, &results);
            let prompt = self.prompts.render(spec.role, &vars);

            let raw = match self.invoke_stage(spec, &prompt, cancel).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(stage = %spec.name, reason = err.reason_tag(), "run: stage aborted: {}", err);
                    self.emit_for(
                        &run.key,
                        PipelineEvent::for_stage(PipelineEventKind::StageFailed, spec.name)
                            .with_data(json!({ "reason": err.reason_tag(), "message": err.to_string() })),
                    )
                    .await;
                    failure = Some((Some(spec.name), err));
                    break;
                }
            };

            let parsed = output_parser::parse(&raw, spec.shape);
            let result = StageResult {
                stage: spec.name,
                raw,
                parsed: parsed.parsed,
                ok: parsed.ok,
                error_detail: parsed.error_detail,
            };

            if result.ok {
                debug!(stage = %spec.name, raw_len = result.raw.len(), "run: stage completed");
                self.emit_for(
                    &run.key,
                    PipelineEvent::for_stage(PipelineEventKind::StageCompleted, spec.name),
                )
                .await;
                results.push(result);
                continue;
            }

            let detail = result.error_detail.clone().unwrap_or_default();
            results.push(result);

            match self.config.parse_failure_policy {
                ParseFailurePolicy::DegradeAndContinue => {
                    warn!(stage = %spec.name, "run: output undecodable, continuing degraded");
                    self.emit_for(
                        &run.key,
                        PipelineEvent::for_stage(PipelineEventKind::StageDegraded, spec.name)
                            .with_data(json!({ "error_detail": detail })),
                    )
                    .await;
                }
                ParseFailurePolicy::FailFast => {
                    let err = PipelineError::Parse {
                        stage: spec.name,
                        detail,
                    };
                    warn!(stage = %spec.name, "run: output undecodable, failing fast");
                    self.emit_for(
                        &run.key,
                        PipelineEvent::for_stage(PipelineEventKind::StageFailed, spec.name)
                            .with_data(json!({ "reason": err.reason_tag(), "message": err.to_string() })),
                    )
                    .await;
                    failure = Some((Some(spec.name), err));
                    break;
                }
            }
        }

        let final_status = if failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        if let Err(e) = run.transition(final_status) {
            warn!("run: {}", e);
        }

        let mut bundle = ResultBundle::assemble(&run.goal, &self.plan, results, failure);
        bundle.run_key = Some(run.key.clone());
        self.record(&run, &mut bundle).await;

        match &bundle.failure {
            None => {
                info!(run_id = ?bundle.run_id, "run: completed");
                self.emit_for(
                    &run.key,
                    PipelineEvent::new(PipelineEventKind::RunCompleted)
                        .with_data(json!({ "run_id": bundle.run_id })),
                )
                .await;
            }
            Some(failure) => {
                info!(run_id = ?bundle.run_id, reason = %failure.reason, "run: failed");
                self.emit_for(
                    &run.key,
                    PipelineEvent::new(PipelineEventKind::RunFailed).with_data(json!({
                        "run_id": bundle.run_id,
                        "stage": failure.stage,
                        "reason": failure.reason,
                    })),
                )
                .await;
            }
        }

        bundle
    }

    /// One provider call, bounded by the stage timeout and the cancel token
    async fn invoke_stage(
        &self,
        spec: &StageSpec,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError> {
        let after = self.config.stage_timeout();
        let call = tokio::time::timeout(after, self.provider.invoke(spec.role, prompt));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled { stage: spec.name }),
            outcome = call => match outcome {
                Err(_) => Err(PipelineError::StageTimeout { stage: spec.name, after }),
                Ok(Err(source)) => Err(PipelineError::Capability { role: spec.role, source }),
                Ok(Ok(raw)) => Ok(raw),
            },
        }
    }

    /// Bind every selector of `spec` to a template variable
    fn resolve_inputs(
        &self,
        run: &PipelineRun,
        spec: &StageSpec,
        results: &[StageResult],
    ) -> PromptVars {
        let mut vars = PromptVars::new();
        vars.insert("goal", run.goal.clone());
        vars.insert(
            "context",
            run.context.clone().unwrap_or_else(|| "无".to_string()),
        );

        for selector in &spec.selectors {
            let upstream = results.iter().find(|r| r.stage == selector.source);
            let value = match (upstream, selector.field) {
                (None, _) => placeholder(&format!("`{}` 阶段没有输出", selector.source)),
                (Some(result), _) if !result.ok || result.parsed.is_none() => {
                    result.raw.trim().to_string()
                }
                (Some(result), SelectorField::Whole) => {
                    render_value(result.parsed.as_ref().unwrap_or(&Value::Null))
                }
                (Some(result), SelectorField::Key(key)) => {
                    match result.parsed.as_ref().and_then(|v| v.get(key)) {
                        Some(value) => render_value(value),
                        None => placeholder(&format!("`{}` 中缺少 `{}` 字段", selector.source, key)),
                    }
                }
            };
            vars.insert(selector.binding, value);
        }

        vars
    }

    /// Store the run and note the outcome on the bundle
    async fn record(&self, run: &PipelineRun, bundle: &mut ResultBundle) {
        let Some(recorder) = &self.recorder else {
            return;
        };

        match recorder.save(run, bundle) {
            Ok(id) => bundle.run_id = Some(id),
            Err(err) => {
                warn!("run: result not persisted: {}", err);
                bundle
                    .warnings
                    .push(format!("{}: {}", err.reason_tag(), err));
                self.emit_for(
                    &run.key,
                    PipelineEvent::new(PipelineEventKind::PersistenceFailed)
                        .with_data(json!({ "reason": err.reason_tag(), "message": err.to_string() })),
                )
                .await;
            }
        }
    }
}

/// Strings verbatim, everything else pretty-printed
fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

fn placeholder(reason: &str) -> String {
    format!("（暂无：{}）", reason)
}
