// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::{IsTerminal, Read, Write};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use nexora_core::{
    AgentEvent, AutoApprove, Coordinator, CoordinatorDeps, InMemoryMessageStore,
    InMemorySessionStore, RunOptions, RunOutcome, Session, SessionStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(cmd) = &cli.command {
        match cmd {
            Commands::ShowConfig => {
                let config = nexora_config::load(cli.config.as_deref())?;
                println!("{}", serde_yaml_string(&config));
                return Ok(());
            }
            Commands::ListProviders => {
                for meta in nexora_model::list_providers() {
                    println!("{:<14} {}", meta.id, meta.description);
                }
                return Ok(());
            }
            Commands::ListModels { provider } => {
                for entry in nexora_model::catalog::static_catalog() {
                    if provider.as_deref().is_some_and(|p| p != entry.provider) {
                        continue;
                    }
                    println!(
                        "{:<14} {:<44} ctx={:<9} out={}",
                        entry.provider, entry.id, entry.context_window, entry.max_output_tokens
                    );
                }
                return Ok(());
            }
        }
    }

    let mut config = nexora_config::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    let prompt = match &cli.prompt {
        Some(p) => p.clone(),
        None => {
            let mut stdin = std::io::stdin();
            if stdin.is_terminal() {
                anyhow::bail!("no prompt given; pass one as an argument or pipe it on stdin");
            }
            let mut buf = String::new();
            stdin.read_to_string(&mut buf).context("reading stdin")?;
            buf.trim().to_string()
        }
    };

    // The persistence repositories are external collaborators; the bundled
    // in-memory stores make the binary self-contained for one-shot runs.
    let sessions: Arc<InMemorySessionStore> = InMemorySessionStore::new();
    let deps = CoordinatorDeps {
        sessions: sessions.clone(),
        messages: InMemoryMessageStore::new(),
        permissions: Arc::new(AutoApprove),
        intrinsic_tools: vec![],
        mcp_tools: vec![],
    };
    let coordinator = Coordinator::new(config, deps)?;
    coordinator.start();

    let session = match &cli.session {
        Some(id) => sessions
            .get(id)
            .await?
            .with_context(|| format!("session not found: {id}"))?,
        None => sessions.create(Session::new()).await?,
    };

    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::TextDelta(delta) => {
                    let _ = write!(stdout, "{delta}");
                    let _ = stdout.flush();
                }
                AgentEvent::ToolCallStarted(call) => {
                    eprintln!("» {} {}", call.name, call.args);
                }
                AgentEvent::ToolCallFinished { tool_name, is_error, .. } => {
                    if is_error {
                        eprintln!("✗ {tool_name} failed");
                    }
                }
                AgentEvent::StuckDetected { reason } => {
                    eprintln!("! stuck: {reason}");
                }
                AgentEvent::Error(e) => eprintln!("! {e}"),
                _ => {}
            }
        }
    });

    let outcome = coordinator
        .run(&session.id, &prompt, vec![], RunOptions::default(), tx)
        .await;

    let exit = match outcome {
        Ok(RunOutcome::Completed(turn)) => {
            println!();
            tracing::debug!(
                prompt_tokens = turn.usage.prompt_tokens,
                completion_tokens = turn.usage.completion_tokens,
                cost = turn.cost,
                "turn complete"
            );
            if cli.summarize {
                let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
                tokio::spawn(async move { while rx.recv().await.is_some() {} });
                coordinator.summarize(&session.id, tx).await?;
            }
            Ok(())
        }
        Ok(RunOutcome::Queued { .. }) => Ok(()),
        Err(e) => Err(anyhow::anyhow!(e)),
    };

    coordinator.stop().await;
    printer.abort();
    exit
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "warn" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn serde_yaml_string(config: &nexora_config::Config) -> String {
    serde_yaml::to_string(config).unwrap_or_default()
}
