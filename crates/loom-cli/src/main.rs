//! loom - 1 セッションを実行してメトリクスを表示する CLI
//!
//! 生成サービスにはオフラインの scaffold を使います。イベントは
//! JSON Lines で stderr に、最終メトリクスは stdout に出力します。

mod scaffold;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use loom_core::container::{ContainerHandle, ContainerState};
use loom_core::domain::SessionId;
use loom_core::impls::BroadcastEventSink;
use loom_core::{
    EngineConfig, InputMode, Orchestrator, OrchestratorBuilder, SessionConfig, SessionStatus,
};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use crate::scaffold::ScaffoldGenerator;

#[derive(Debug, Parser)]
#[command(name = "loom", about = "Generate a web app from a prompt and optionally preview it")]
struct Args {
    /// What to build.
    #[arg(short, long)]
    prompt: String,

    /// Engine config (TOML). Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seed the workspace from this template instead of starting empty.
    #[arg(short, long)]
    template: Option<String>,

    /// Run the planning step first.
    #[arg(long)]
    plan: bool,

    /// Validate the generated code.
    #[arg(long)]
    validate: bool,

    /// Refinement iterations after a failed validation.
    #[arg(long, default_value_t = 0)]
    max_iterations: u32,

    /// Start a preview container after a successful generation.
    #[arg(long)]
    preview: bool,

    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            enable_planning: self.plan,
            input_mode: match &self.template {
                Some(name) => InputMode::Template { name: name.clone() },
                None => InputMode::Scratch,
            },
            enable_validation: self.validate,
            max_iterations: self.max_iterations,
            preview: self.preview,
        }
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose {
        "loom_core=debug,loom=debug"
    } else {
        "loom_core=info,loom=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// The preview task registers its container shortly after the ticket resolves.
async fn wait_for_preview(orchestrator: &Orchestrator, session_id: SessionId) -> Option<ContainerHandle> {
    for _ in 0..100 {
        if let Some(handle) = orchestrator.container(session_id) {
            return Some(handle);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    // (A) 設定とイベントの購読
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let sink = BroadcastEventSink::default();
    let mut events = sink.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => eprintln!("{line}"),
                    Err(e) => tracing::warn!(error = %e, "event not printable"),
                },
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // (B) Orchestrator を組み立てる
    let orchestrator = OrchestratorBuilder::new(config)
        .generation(Arc::new(ScaffoldGenerator))
        .event_sink(Arc::new(sink))
        .build()
        .context("building orchestrator")?;

    // (C) セッション投入。Ctrl-C で abort
    let ticket = orchestrator
        .submit(args.prompt.as_str(), args.session_config())
        .await
        .context("starting session")?;
    let session_id = ticket.session_id;
    tracing::info!(%session_id, "session started");

    let wait = ticket.wait();
    tokio::pin!(wait);
    let metrics = loop {
        tokio::select! {
            result = &mut wait => break result.context("waiting for session")?,
            signal = tokio::signal::ctrl_c() => {
                signal.context("listening for ctrl-c")?;
                let outcome = orchestrator.abort(session_id)?;
                tracing::info!(?outcome, "abort requested");
            }
        }
    };
    println!("{}", serde_json::to_string_pretty(&metrics)?);

    // (D) プレビューは Ctrl-C まで動かし続ける
    if args.preview && metrics.status == SessionStatus::Completed {
        let record = match wait_for_preview(&orchestrator, session_id).await {
            Some(handle) => Some(handle.wait_until_running().await?),
            None => None,
        };
        if let Some(record) = record.filter(|r| r.state == ContainerState::Running) {
            if let Some(url) = record.preview_url() {
                tracing::info!(%url, "preview running; press Ctrl-C to stop");
            }
            tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;
        } else {
            tracing::warn!("preview did not reach running; see events above");
        }
    }

    // (E) 後片付け
    orchestrator.shutdown().await;
    drop(orchestrator);
    let _ = tokio::time::timeout(Duration::from_millis(200), printer).await;

    if metrics.status == SessionStatus::Completed {
        Ok(())
    } else {
        anyhow::bail!("session {session_id} ended as {}", metrics.status)
    }
}
