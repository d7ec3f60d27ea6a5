// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! System prompt assembly and the canned prompts used by side turns.

use std::fmt::Write as _;

/// Opt-in env var for expensive environment probes during prompt build.
pub const FULL_ENV_VAR: &str = "NEXORA_FULL_ENV";

const BASE_PROMPT: &str = "\
You are Nexora, an expert software engineering agent operating inside the \
user's repository through tool calls. Work autonomously: inspect before \
editing, prefer small verifiable changes, and report results concisely. \
Use the provided tools for every file or shell interaction; never invent \
tool output.";

/// Inputs that shape the system prompt.
#[derive(Debug, Default, Clone)]
pub struct PromptContext {
    pub working_dir: Option<String>,
    /// Extra instructions appended after the built-in prompt.
    pub append: Option<String>,
}

/// Build the system prompt.  `custom` replaces the built-in body entirely;
/// the context blocks are appended either way.
pub fn system_prompt(custom: Option<&str>, ctx: &PromptContext) -> String {
    let mut out = String::with_capacity(1024);
    out.push_str(custom.unwrap_or(BASE_PROMPT));

    let mut env = String::new();
    if let Some(dir) = &ctx.working_dir {
        let _ = writeln!(env, "working directory: {dir}");
    }
    let _ = writeln!(env, "os: {}", std::env::consts::OS);
    let _ = writeln!(env, "arch: {}", std::env::consts::ARCH);
    // Expensive probes are opt-in: enumerating the environment is cheap on a
    // laptop but not in constrained CI sandboxes with huge env blocks.
    if std::env::var(FULL_ENV_VAR).is_ok_and(|v| v == "1" || v == "true") {
        for key in ["SHELL", "LANG", "TERM", "HOME"] {
            if let Ok(value) = std::env::var(key) {
                let _ = writeln!(env, "{}: {value}", key.to_lowercase());
            }
        }
    }
    if !env.is_empty() {
        out.push_str("\n\n<environment>\n");
        out.push_str(&env);
        out.push_str("</environment>");
    }

    if let Some(append) = &ctx.append {
        if !append.is_empty() {
            out.push_str("\n\n");
            out.push_str(append);
        }
    }
    out
}

/// Prompt for the dedicated summarisation turn.  The model speaks in first
/// person so the recap reads as the assistant's own memory when it replaces
/// the early history.
pub const SUMMARIZE_PROMPT: &str = "\
Write a compact first-person recap of this session so far, as if reminding \
yourself what happened before continuing. Preserve: the user's goal and \
constraints, every file read or changed and why, key decisions with their \
reasons, commands run and their outcomes, and anything still unfinished. \
Be dense and factual; do not add pleasantries or next-step suggestions.";

/// Prompt used to produce a short session title after the first turn.
pub const TITLE_PROMPT: &str = "\
Produce a short title (at most 8 words) describing this conversation. \
Reply with the title only, no quotes or punctuation around it.";

// ─── Unit tests ──────────────────────────────────────────────────────────────
