//! Tool Dispatch Loop: routes one tool call at a time to its handler.
//!
//! Every failure a handler can hit comes back as a [`ToolError`] so the
//! conversation can react; nothing here ends the process. All domain state lives
//! in the engine's session and store; the dispatcher only tracks the per-turn
//! verification budget.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::verdict::VerdictStatus;
use crate::engine::PatchEngine;
use crate::error::ToolError;
use crate::files;
use crate::io::config::{Config, EnvSnapshot, FilesConfig};
use crate::io::git_apply::GitApply;
use crate::io::session::{RunSession, SessionInit};
use crate::io::signal::{FileSignalSink, NullSink, SignalSink};
use crate::io::verifier::{
    KaniDockerVerifier, Verifier, VerifyRequest, validate_harness, validate_kani_args,
};
use crate::io::workspace::Workspace;
use crate::review::{ApprovalGate, ReviewOutcome, review_latest};
use crate::tools::{RunKaniArgs, ToolCall, ToolCatalog, ToolName, normalize_project_dir};

pub struct Dispatcher {
    engine: PatchEngine,
    catalog: ToolCatalog,
    files: FilesConfig,
    verifier: Box<dyn Verifier>,
    max_verify_runs: u32,
    verify_runs: u32,
}

impl Dispatcher {
    pub fn new(
        engine: PatchEngine,
        catalog: ToolCatalog,
        files: FilesConfig,
        verifier: Box<dyn Verifier>,
        max_verify_runs: u32,
    ) -> Self {
        Self {
            engine,
            catalog,
            files,
            verifier,
            max_verify_runs,
            verify_runs: 0,
        }
    }

    /// Wire up the production stack. Failures here are fatal to the process.
    pub fn from_config(cfg: &Config, env: EnvSnapshot) -> Result<Self> {
        let workspace = Workspace::open(&cfg.sandbox_root)?;
        let signals: Arc<dyn SignalSink> = if cfg.signal_enabled(&env) {
            Arc::new(FileSignalSink::new(&cfg.signal.path, cfg.signal.max_bytes))
        } else {
            Arc::new(NullSink)
        };
        let session = RunSession::start(SessionInit {
            runs_root: &cfg.runs_root,
            sandbox_root: workspace.root(),
            model: &cfg.model,
            tag: cfg.run_tag.as_deref(),
            env,
        })
        .context("start run session")?;
        let engine = PatchEngine::new(
            workspace,
            session,
            Box::new(GitApply::new(&cfg.apply)),
            signals,
        );
        Ok(Self::new(
            engine,
            ToolCatalog::load()?,
            cfg.files.clone(),
            Box::new(KaniDockerVerifier::new(&cfg.verifier)),
            cfg.verifier.max_runs_per_turn,
        ))
    }

    pub fn engine(&self) -> &PatchEngine {
        &self.engine
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Start a new conversation turn; resets the verification budget.
    pub fn new_turn(&mut self) {
        debug!(used = self.verify_runs, "new turn");
        self.verify_runs = 0;
    }

    /// Route one tool call by name.
    #[instrument(skip_all, fields(tool = name))]
    pub fn dispatch(&mut self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        let tool = ToolName::parse(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        // Tools without required arguments may be called with none at all.
        let arguments = if arguments.is_null() { json!({}) } else { arguments };
        self.catalog
            .validate(tool, &arguments)
            .map_err(ToolError::InvalidArguments)?;
        let call = ToolCall::from_value(tool, arguments)
            .map_err(|err| ToolError::InvalidArguments(err.to_string()))?;

        let result = self.route(call);
        match &result {
            Ok(_) => info!("tool call succeeded"),
            Err(err) => info!(kind = err.kind(), err = %err, "tool call failed"),
        }
        result
    }

    fn route(&mut self, call: ToolCall) -> Result<Value, ToolError> {
        let ws = self.engine.workspace();
        match call {
            ToolCall::ReadFile(args) => to_value(files::read_file(ws, &self.files, &args.path)?),
            ToolCall::WriteFile(args) => to_value(files::write_file(
                ws,
                &self.files,
                self.engine.signals().as_ref(),
                &args.path,
                &args.content,
            )?),
            ToolCall::ListDir(args) => to_value(files::list_dir(ws, &args.path)?),
            ToolCall::ProposePatch(args) => to_value(self.engine.propose(&args.diff)?),
            ToolCall::InitRustCrate(args) => to_value(files::init_rust_crate(
                ws,
                self.engine.signals().as_ref(),
                &args,
            )?),
            ToolCall::RunKani(args) => self.run_kani(args),
        }
    }

    fn run_kani(&mut self, args: RunKaniArgs) -> Result<Value, ToolError> {
        let project = normalize_project_dir(&args.project_dir);
        let ws = self.engine.workspace();
        let dir = ws.resolve_dir(&project)?;
        if !dir.join("Cargo.toml").is_file() {
            return Err(ToolError::NotFound(if project.is_empty() {
                "Cargo.toml".to_string()
            } else {
                format!("{project}/Cargo.toml")
            }));
        }
        if let Some(harness) = &args.harness {
            validate_harness(harness).map_err(ToolError::InvalidArguments)?;
        }
        let extra = validate_kani_args(&args.args).map_err(ToolError::InvalidArguments)?;

        if self.verify_runs >= self.max_verify_runs {
            return Err(ToolError::VerificationBudgetExhausted {
                limit: self.max_verify_runs,
            });
        }
        self.verify_runs += 1;

        let request = VerifyRequest {
            workspace_root: ws.root().to_path_buf(),
            project: ws.relative(&dir),
            harness: args.harness,
            args: extra,
        };
        let report = self.verifier.verify(&request);
        let verdict = report.verdict;

        let log = format!(
            "project: {}\nharness: {}\nstatus: {:?}\nexit_code: {:?}\n\n{}\n\n{}",
            request.project,
            request.harness.as_deref().unwrap_or("(all)"),
            verdict.status,
            verdict.exit_code,
            verdict.diagnostics,
            report.transcript
        );
        match self.engine.session().write_verify_log(&log) {
            Ok(path) => debug!(path = %path.display(), "verification logged"),
            Err(err) => warn!(err = %format!("{err:#}"), "failed to write verification log"),
        }

        match verdict.status {
            VerdictStatus::Pass => Ok(json!({
                "status": "pass",
                "project_dir": request.project,
                "diagnostics": verdict.diagnostics,
                "exit_code": verdict.exit_code,
                "runs_left": self.max_verify_runs - self.verify_runs,
            })),
            VerdictStatus::Fail => Err(ToolError::VerificationFailure(verdict)),
            VerdictStatus::Error => Err(ToolError::VerificationError(verdict)),
        }
    }

    /// Put the latest valid patch in front of `gate`.
    pub fn review(&self, gate: &dyn ApprovalGate) -> Result<ReviewOutcome, ToolError> {
        review_latest(&self.engine, gate)
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, ToolError> {
    Ok(serde_json::to_value(value).context("serialize tool result")?)
}
