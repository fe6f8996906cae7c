//! End-to-end prediction through a [`Session`] on the synthetic engine.

mod common;

use common::{arithmetic_backend, arithmetic_model, collect, greedy_config};
use llama_session::synthetic::{SyntheticBackend, SyntheticImageEvaluator, SyntheticModel, BOS, EOS};
use llama_session::{
    FinishReason, NativeBoundary, PredictRequest, PromptFormat, SamplingParams, Session,
    SessionConfig, SessionError, TokenId,
};

#[test_log::test]
fn test_greedy_arithmetic_completion() {
    let mut session = Session::load(&arithmetic_backend(), greedy_config()).unwrap();
    let mut fragments = Vec::new();

    let text = session
        .predict("2+2=", collect(&mut fragments), None, None)
        .unwrap();

    assert_eq!(text, " 4.");
    assert_eq!(fragments, vec![" 4", "."]);
    // <s> 2 + 2 = evaluated, then " 4" and "." fed back; the end token is not
    assert_eq!(session.n_past(), 7);
    assert_eq!(session.history().len(), 7);
}

#[test]
fn test_greedy_is_deterministic_across_sessions() {
    let run = || {
        let config = SessionConfig {
            sampling: SamplingParams {
                seed: 7,
                ..SamplingParams::greedy()
            },
            ..greedy_config()
        };
        let mut session = Session::load(&arithmetic_backend(), config).unwrap();
        session
            .predict_request(&PredictRequest::new("2+2="), |_, _| false)
            .unwrap()
    };
    let first = run();
    let second = run();
    assert_eq!(first.text, second.text);
    assert_eq!(first.tokens, second.tokens);
    assert_eq!(first.finish_reason, FinishReason::EndOfGeneration);
    assert_eq!(*first.tokens.last().unwrap(), EOS);
}

#[test]
fn test_callback_cancels_before_next_decode() {
    let mut session = Session::load(&arithmetic_backend(), greedy_config()).unwrap();
    let mut calls = 0;

    let outcome = session
        .predict_request(&PredictRequest::new("2+2="), |_, _| {
            calls += 1;
            true
        })
        .unwrap();

    assert_eq!(calls, 1);
    assert_eq!(outcome.finish_reason, FinishReason::Cancelled);
    assert_eq!(outcome.text, " 4");
    // only the prompt batch was decoded
    assert_eq!(session.engine().unwrap().decode_log().len(), 1);
    assert_eq!(session.n_past(), 5);
}

#[test]
fn test_elapsed_time_is_monotonic() {
    let mut session = Session::load(&arithmetic_backend(), greedy_config()).unwrap();
    let mut stamps = Vec::new();
    let record = |_: &str, elapsed: f64| {
        stamps.push(elapsed);
        false
    };
    session.predict("2+2=", record, None, None).unwrap();
    assert_eq!(stamps.len(), 2);
    assert!(stamps[0] >= 0.0);
    assert!(stamps[1] >= stamps[0]);
}

#[test]
fn test_max_output_bytes_stops_after_crossing_fragment() {
    let config = SessionConfig {
        max_output_bytes: Some(1),
        ..greedy_config()
    };
    let mut session = Session::load(&arithmetic_backend(), config).unwrap();
    let outcome = session
        .predict_request(&PredictRequest::new("2+2="), |_, _| false)
        .unwrap();
    assert_eq!(outcome.text, " 4");
    assert_eq!(outcome.finish_reason, FinishReason::MaxBytes);
}

#[test]
fn test_max_output_tokens() {
    let config = SessionConfig {
        max_output_tokens: Some(1),
        ..greedy_config()
    };
    let mut session = Session::load(&arithmetic_backend(), config).unwrap();
    let outcome = session
        .predict_request(&PredictRequest::new("2+2="), |_, _| false)
        .unwrap();
    assert_eq!(outcome.tokens.len(), 1);
    assert_eq!(outcome.finish_reason, FinishReason::MaxTokens);
    assert_eq!(session.n_past(), 5);
}

#[test]
fn test_skip_tokens_are_fed_but_not_emitted() {
    let mut model = SyntheticModel::with_pieces(&["2", "+", "="]);
    model.script(&["=", "<|sep|>", " 4", "."]);
    let sep = model.token("<|sep|>").unwrap();
    let config = SessionConfig {
        skip_tokens: vec!["<|sep|>".to_string()],
        ..greedy_config()
    };
    let mut session = Session::load(&SyntheticBackend::new(model), config).unwrap();

    let mut fragments = Vec::new();
    let text = session
        .predict("2+2=", collect(&mut fragments), None, None)
        .unwrap();

    assert_eq!(text, " 4.");
    assert!(fragments.iter().all(|f| !f.contains("<|sep|>")));
    assert!(session.engine().unwrap().decoded_tokens().contains(&sep));
    assert!(session.history().contains(&sep));
}

#[test]
fn test_system_prompt_precedes_prompt() {
    let mut session = Session::load(&arithmetic_backend(), greedy_config()).unwrap();
    let (two, plus, eq) = {
        let model = session.engine().unwrap().model();
        (
            model.token("2").unwrap(),
            model.token("+").unwrap(),
            model.token("=").unwrap(),
        )
    };

    let text = session
        .predict("2=", |_, _| false, Some("2+"), None)
        .unwrap();
    assert_eq!(text, " 4.");

    let batches: Vec<Vec<TokenId>> = session
        .engine()
        .unwrap()
        .decode_log()
        .iter()
        .map(|b| b.iter().map(|e| e.token).collect())
        .collect();
    assert_eq!(batches[0], vec![BOS, two, plus]);
    // the prompt continues the context, so no second begin marker
    assert_eq!(batches[1], vec![two, eq]);
}

#[test]
fn test_custom_template_embeds_system_prompt() {
    let config = SessionConfig {
        prompt_format: PromptFormat::Custom,
        custom_prompt_format: Some("{system_prompt}{prompt}".to_string()),
        ..greedy_config()
    };
    let mut session = Session::load(&arithmetic_backend(), config).unwrap();
    let text = session
        .predict("2=", |_, _| false, Some("2+"), None)
        .unwrap();
    assert_eq!(text, " 4.");
    // one prompt batch carrying "<s>2+2="
    assert_eq!(session.engine().unwrap().decode_log()[0].len(), 5);
}

#[test]
fn test_failed_evaluation_keeps_window_and_session_usable() {
    let mut session = Session::load(&arithmetic_backend(), greedy_config()).unwrap();
    session.engine_mut().unwrap().fail_decode_after(0, -3);

    let err = session
        .predict("2+2=", |_, _| false, None, None)
        .unwrap_err();
    assert!(matches!(err, SessionError::Evaluation { stage: "prompt", .. }));
    assert!(err.is_retriable());
    assert_eq!(session.n_past(), 0);
    assert!(session.history().is_empty());

    let text = session.predict("2+2=", |_, _| false, None, None).unwrap();
    assert_eq!(text, " 4.");
}

#[test]
fn test_failed_generated_token_leaves_n_past_at_prompt() {
    let mut session = Session::load(&arithmetic_backend(), greedy_config()).unwrap();
    session.engine_mut().unwrap().fail_decode_after(1, 2);

    let err = session
        .predict("2+2=", |_, _| false, None, None)
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Evaluation {
            stage: "generated token",
            ..
        }
    ));
    assert_eq!(session.n_past(), 5);
}

#[test]
fn test_empty_prompt_on_fresh_session() {
    let config = SessionConfig {
        add_bos_token: false,
        ..greedy_config()
    };
    let mut session = Session::load(&arithmetic_backend(), config).unwrap();
    let err = session.predict("", |_, _| false, None, None).unwrap_err();
    assert!(matches!(err, SessionError::EmptyPrompt));
    assert!(err.is_user_error());
}

#[test]
fn test_second_prediction_continues_context() {
    let mut session = Session::load(&arithmetic_backend(), greedy_config()).unwrap();
    session.predict("2+2=", |_, _| false, None, None).unwrap();
    let n_past = session.n_past();

    let text = session.predict("2+2=", |_, _| false, None, None).unwrap();
    assert_eq!(text, " 4.");
    // no begin marker the second time
    assert_eq!(session.n_past(), n_past + 4 + 2);
}

#[test]
fn test_image_occupies_positions_before_prompt() {
    let model = arithmetic_model();
    let image_token = model.token("+").unwrap();
    let mut session = Session::load(&SyntheticBackend::new(model), greedy_config())
        .unwrap()
        .with_image_evaluator(Box::new(SyntheticImageEvaluator::new(3, image_token)));

    let text = session
        .predict("2+2=", |_, _| false, None, Some(std::path::Path::new("cat.png")))
        .unwrap();
    assert_eq!(text, " 4.");

    let first = &session.engine().unwrap().decode_log()[0];
    assert_eq!(first.len(), 3);
    assert!(first.iter().all(|e| e.token == image_token));
    assert_eq!(first[0].position, 0);
    // 3 image positions, 4 prompt tokens (no begin marker after the image), 2 generated
    assert_eq!(session.n_past(), 9);
    assert_eq!(session.history().len(), 6);
}

#[test]
fn test_image_failures_are_reported() {
    let mut evaluator = SyntheticImageEvaluator::new(2, BOS);
    evaluator.fail = true;
    let mut session = Session::load(&arithmetic_backend(), greedy_config())
        .unwrap()
        .with_image_evaluator(Box::new(evaluator));
    let image = std::path::Path::new("missing.png");
    let err = session
        .predict("2+2=", |_, _| false, None, Some(image))
        .unwrap_err();
    assert!(matches!(err, SessionError::Image(_)));

    let mut evaluator = SyntheticImageEvaluator::new(2, BOS);
    evaluator.panic = true;
    session.set_image_evaluator(Some(Box::new(evaluator)));
    let err = session
        .predict("2+2=", |_, _| false, None, Some(image))
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::NativeFault {
            boundary: NativeBoundary::ImageEmbed,
            ..
        }
    ));
    assert_eq!(session.n_past(), 0);
}

#[test]
fn test_encoder_model_starts_decoder_from_start_token() {
    let mut model = arithmetic_model().with_encoder(None);
    model.link(BOS, model.token(" 4").unwrap());
    let mut session = Session::load(&SyntheticBackend::new(model), greedy_config()).unwrap();

    let text = session.predict("2+2=", |_, _| false, None, None).unwrap();
    assert_eq!(text, " 4.");
    let engine = session.engine().unwrap();
    assert_eq!(engine.encode_log().len(), 1);
    assert_eq!(engine.decode_log()[0][0].token, BOS);
}

#[test]
fn test_split_utf8_pieces_are_joined() {
    let mut model = SyntheticModel::with_pieces(&["q"]);
    let first = model.add_piece([0xC3u8]);
    let second = model.add_piece([0xA9u8]);
    let q = model.token("q").unwrap();
    model.link(q, first);
    model.link(first, second);
    let mut session = Session::load(&SyntheticBackend::new(model), greedy_config()).unwrap();

    let mut fragments = Vec::new();
    let text = session
        .predict("q", collect(&mut fragments), None, None)
        .unwrap();
    assert_eq!(text, "é");
    assert_eq!(fragments, vec!["é"]);
}

#[test]
fn test_stopped_token_is_evaluated_by_next_prediction() {
    let config = SessionConfig {
        max_output_tokens: Some(1),
        ..greedy_config()
    };
    let mut session = Session::load(&arithmetic_backend(), config).unwrap();
    let (four, dot) = {
        let model = session.engine().unwrap().model();
        (model.token(" 4").unwrap(), model.token(".").unwrap())
    };

    let text = session.predict("2+2=", |_, _| false, None, None).unwrap();
    assert_eq!(text, " 4");
    assert_eq!(session.n_past(), 5);
    assert_eq!(session.context_window().pending(), Some(four));

    // the second prediction continues after " 4" instead of repeating it
    let text = session.predict("", |_, _| false, None, None).unwrap();
    assert_eq!(text, ".");
    assert_eq!(session.n_past(), 6);
    assert_eq!(*session.history().last().unwrap(), four);
    assert_eq!(session.context_window().pending(), Some(dot));
}

#[test]
fn test_cancelled_prediction_resumes_without_gaps() {
    let expected_history = {
        let mut session = Session::load(&arithmetic_backend(), greedy_config()).unwrap();
        session.predict("2+2=", |_, _| false, None, None).unwrap();
        session.history().to_vec()
    };

    let mut session = Session::load(&arithmetic_backend(), greedy_config()).unwrap();
    let text = session.predict("2+2=", |_, _| true, None, None).unwrap();
    assert_eq!(text, " 4");
    // nothing is decoded after the callback cancels
    assert_eq!(session.engine().unwrap().decode_log().len(), 1);

    let text = session.predict("", |_, _| false, None, None).unwrap();
    assert_eq!(text, ".");
    assert_eq!(session.history(), expected_history.as_slice());
    assert_eq!(session.n_past(), 7);
    assert_eq!(session.context_window().pending(), None);
}

#[test]
fn test_rebuilt_chain_sees_pending_token() {
    let config = SessionConfig {
        max_output_tokens: Some(1),
        ..greedy_config()
    };
    let mut session = Session::load(&arithmetic_backend(), config).unwrap();
    session.predict("2+2=", |_, _| false, None, None).unwrap();
    let pending = session.context_window().pending().unwrap();

    session
        .rebuild_sampling(SamplingParams {
            penalty_last_n: 64,
            penalty_repeat: 1.1,
            ..SamplingParams::greedy()
        })
        .unwrap();
    let window = session.sampling_chain().penalty_window();
    assert_eq!(window.len(), session.history().len() + 1);
    assert_eq!(window.last(), Some(&pending));
}
