// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Nexora — core agent runtime for an interactive AI coding assistant.
///
/// With a prompt argument the agent runs one turn headlessly and streams
/// the response to stdout.  The terminal UI lives outside this crate and
/// drives the same coordinator surface.
#[derive(Parser, Debug)]
#[command(name = "nexora", version, about)]
pub struct Cli {
    /// The user prompt to run.  Reads stdin when omitted and stdin is piped.
    pub prompt: Option<String>,

    /// Path to an explicit config file (merged over the discovered layers).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Continue an existing session instead of creating a fresh one.
    #[arg(long, short = 's')]
    pub session: Option<String>,

    /// Model override: "provider/model" or a bare model name.
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// Auto-approve every tool invocation (yolo mode).
    #[arg(long)]
    pub yolo: bool,

    /// Summarise the session after the turn completes.
    #[arg(long)]
    pub summarize: bool,

    /// Log to stderr (RUST_LOG controls the filter).
    #[arg(long, short = 'v')]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the merged configuration and exit.
    ShowConfig,
    /// List all supported model providers.
    ListProviders,
    /// List the bundled model catalog.
    ListModels {
        /// Restrict the listing to one provider id.
        #[arg(long, short = 'p')]
        provider: Option<String>,
    },
}

impl Cli {
    /// Apply CLI overrides onto the loaded config.
    pub fn apply(&self, config: &mut nexora_config::Config) {
        if self.yolo {
            config.agent.yolo_mode = true;
        }
        if let Some(model) = &self.model {
            if let Some((provider, name)) = model.split_once('/') {
                config.model.provider = provider.to_string();
                config.model.name = name.to_string();
                // Credentials from the previous provider do not carry over.
                config.model.api_key = None;
                config.model.api_key_env = None;
            } else {
                config.model.name = model.clone();
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
