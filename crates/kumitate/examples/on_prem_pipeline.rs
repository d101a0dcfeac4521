//! Runs the on-prem target plus a custom step through a pipeline.
//!
//! Usage: `cargo run --example on_prem_pipeline [config.json] [state.json]`

use async_trait::async_trait;
use kumitate::prelude::*;
use kumitate::targets;
use std::sync::Arc;

/// Stamps a log directory into the runtime state.
#[derive(Debug)]
struct LogDirStep;

#[async_trait]
impl Step for LogDirStep {
    fn name(&self) -> StepName {
        StepName::new("LogDirStep")
    }

    fn labels(&self) -> &[&str] {
        &["on-prem"]
    }

    async fn configure(&mut self, _ctx: &RunContext, state: RuntimeState) -> PhaseResult {
        Ok(state)
    }

    async fn pre(&mut self, _ctx: &RunContext, state: RuntimeState) -> PhaseResult {
        Ok(state)
    }

    async fn run(&mut self, _ctx: &RunContext, mut state: RuntimeState) -> PhaseResult {
        if state.log_dir.is_empty() {
            state.log_dir = std::env::temp_dir().join("kumitate").display().to_string();
        }
        Ok(state)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => Config::from_path(path)?,
        None => {
            let mut config = Config::default();
            config.global.orch_name = "demo".to_string();
            config.global.action = "install".to_string();
            config
        }
    };
    let state_path = args.next();
    let initial = match &state_path {
        Some(path) if std::path::Path::new(path).exists() => RuntimeState::load(path)?,
        _ => RuntimeState::default(),
    };

    let cancel = CancellationToken::new();
    let ctx = RunContext::new(Arc::new(config))
        .with_cancellation(cancel.clone())
        .with_selector(LabelSelector::any(["on-prem"]));

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut stages = targets::on_prem::create_stages()?;
    stages.push(Box::new(
        StepStage::builder("Logging").add_step(LogDirStep).build()?,
    ));
    let mut pipeline = Pipeline::builder().add_stages(stages).build()?;

    let mut state = CanonicalState::new(initial);
    let report = pipeline.execute(&ctx, &mut state).await?;
    println!("{report}");

    if let Some(path) = state_path {
        state.state().save(path)?;
    }
    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
