//! Streaming generation example
//!
//! Runs a session on the synthetic engine with a custom prompt format and
//! mirostat sampling, printing fragments as they arrive and stopping once the
//! output passes a length limit.

use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use llama_session::synthetic::{SyntheticBackend, SyntheticModel};
use llama_session::{
    init_tracing, PredictRequest, PromptFormat, SamplingParams, Session, SessionConfig,
    SharedSession,
};
use tracing::info;

const MAX_OUTPUT_LENGTH: usize = 48;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("llama_session=info");

    let mut model = SyntheticModel::with_pieces(&["Question:", "Answer:", "\n"]);
    for byte in b' '..=b'~' {
        model.add_piece([byte]);
    }
    model.script(&[
        "Answer:",
        " The",
        " context",
        " window",
        " rotates",
        " when",
        " it",
        " fills",
        " up",
        ",",
        " so",
        " the",
        " stream",
        " keeps",
        " going",
        ".",
    ]);
    let backend = SyntheticBackend::new(model);

    let config = SessionConfig {
        context_length: 256,
        n_batch: 32,
        prompt_format: PromptFormat::Custom,
        custom_prompt_format: Some("Question: {prompt}\nAnswer:".to_string()),
        sampling: SamplingParams {
            seed: 42,
            ..SamplingParams::mirostat_v2()
        },
        ..SessionConfig::new("synthetic.gguf")
    };

    let session = Session::load_with_progress(
        &backend,
        config,
        Some(Box::new(|p| {
            info!("Loading: {:.0}%", p * 100.0);
            true
        })),
    )?;
    info!("{}", session.system_info()?);
    let shared = SharedSession::new(session);

    println!("Response (streaming):");
    println!("{}", "=".repeat(60));

    let total = Arc::new(AtomicUsize::new(0));
    let seen = total.clone();
    let outcome = shared
        .predict(
            PredictRequest::new("What happens when the context is full?"),
            move |fragment, _elapsed| {
                print!("{}", fragment);
                let _ = io::stdout().flush();
                seen.fetch_add(fragment.len(), Ordering::Relaxed) + fragment.len()
                    > MAX_OUTPUT_LENGTH
            },
        )
        .await?;

    println!();
    println!("{}", "=".repeat(60));
    println!(
        "Finished ({}): {} tokens, {} bytes, {:.2}s",
        outcome.finish_reason,
        outcome.tokens.len(),
        total.load(Ordering::Relaxed),
        outcome.elapsed.as_secs_f64()
    );

    shared.save_state().await?;
    Ok(())
}
