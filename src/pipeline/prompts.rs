//! Stage Prompts
//!
//! Builds the per-model prompt for each stage:
//! - **Initial**: the caller's prompt, unchanged
//! - **PeerReview**: the model's own prior answer plus every *other*
//!   model's answer, each labeled by model id
//! - **Synthesis**: every input answer labeled by source model

use std::collections::BTreeMap;
use std::fmt::Write;

use super::types::StageRequest;
use crate::types::{ModelId, StageKind};

/// Prompt sent to `model` for the given stage request
pub fn build_stage_prompt(request: &StageRequest, model: &ModelId) -> String {
    match request.stage {
        StageKind::Initial => request.original_prompt.clone(),
        StageKind::PeerReview => {
            build_peer_review_prompt(&request.original_prompt, model, &request.prior_outputs)
        }
        StageKind::Synthesis => build_synthesis_prompt(&request.original_prompt, &request.prior_outputs),
    }
}

/// Revision prompt. Peers never include the reviewer's own answer.
pub fn build_peer_review_prompt(
    question: &str,
    reviewer: &ModelId,
    initial_outputs: &BTreeMap<ModelId, String>,
) -> String {
    let mut prompt = String::new();

    prompt.push_str(
        "You answered the question below. Other models answered the same question \
         independently. Review their responses, correct any mistakes in your own answer, \
         and write an improved answer.\n\n",
    );

    prompt.push_str("# Question\n\n");
    prompt.push_str(question.trim());
    prompt.push_str("\n\n");

    prompt.push_str("# Your Previous Answer\n\n");
    match initial_outputs.get(reviewer) {
        Some(own) => prompt.push_str(own.trim()),
        None => prompt.push_str("(no previous answer)"),
    }
    prompt.push_str("\n\n");

    prompt.push_str("# Peer Responses\n\n");
    let mut peers = 0;
    for (model, text) in initial_outputs.iter().filter(|(id, _)| *id != reviewer) {
        push_labeled(&mut prompt, model, text);
        peers += 1;
    }
    if peers == 0 {
        prompt.push_str("(no peer responses)\n\n");
    }

    prompt.push_str("# Instructions\n\n");
    prompt.push_str(
        "Respond with your revised answer only. Do not mention the other models \
         or this review process.\n",
    );

    prompt
}

/// Synthesis prompt over all labeled answers
pub fn build_synthesis_prompt(question: &str, outputs: &BTreeMap<ModelId, String>) -> String {
    let mut prompt = String::new();

    prompt.push_str(
        "Several models answered the question below. Combine their responses into a \
         single, accurate, self-contained answer. Where they disagree, prefer the \
         best-supported position.\n\n",
    );

    prompt.push_str("# Question\n\n");
    prompt.push_str(question.trim());
    prompt.push_str("\n\n");

    prompt.push_str("# Responses\n\n");
    for (model, text) in outputs {
        push_labeled(&mut prompt, model, text);
    }

    prompt.push_str("# Instructions\n\n");
    prompt.push_str("Respond with the final answer only.\n");

    prompt
}

fn push_labeled(prompt: &mut String, model: &ModelId, text: &str) {
    let _ = write!(prompt, "## Response from {}\n\n{}\n\n", model, text.trim());
}
