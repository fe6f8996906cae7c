//! Property-based tests for sampling, rotation arithmetic and UTF-8 streaming.

use llama_session::sampling::Candidates;
use llama_session::{ContextWindow, SamplingChain, SamplingParams, SessionError, Utf8Decoder};
use proptest::prelude::*;

fn logits_strategy() -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-20.0f32..20.0, 2..64)
}

proptest! {
    #[test]
    fn test_greedy_picks_argmax_for_any_seed(logits in logits_strategy(), seed in 0u32..u32::MAX) {
        let params = SamplingParams { seed, ..SamplingParams::greedy() };
        let mut chain = SamplingChain::build(logits.len(), &params);
        let expected = Candidates::from_logits(&logits).argmax().unwrap();
        prop_assert_eq!(chain.sample(&logits).unwrap(), expected);
    }

    #[test]
    fn test_thresholds_near_one_keep_every_candidate(
        logits in logits_strategy(),
        top_p in 0.9999f32..=1.0,
        typical_p in 0.9999f32..=1.0,
        min_p in 0.9999f32..=1.0,
    ) {
        let params = SamplingParams {
            penalty_last_n: 0,
            top_k: 0,
            top_p,
            typical_p,
            min_p,
            temperature: 1.0,
            seed: 1,
            ..Default::default()
        };
        let chain = SamplingChain::build(logits.len(), &params);
        prop_assert_eq!(chain.stage_names(), vec!["temperature", "distribution"]);
        prop_assert_eq!(chain.filtered(&logits).unwrap().len(), logits.len());
    }

    #[test]
    fn test_seeded_distribution_is_reproducible(logits in logits_strategy(), seed in 0u32..1000) {
        let params = SamplingParams { seed, ..Default::default() };
        let mut a = SamplingChain::build(logits.len(), &params);
        let mut b = SamplingChain::build(logits.len(), &params);
        for _ in 0..8 {
            prop_assert_eq!(a.sample(&logits).unwrap(), b.sample(&logits).unwrap());
        }
    }

    #[test]
    fn test_rotation_plan_halves_unprotected_positions(
        context_length in 4usize..256,
        protected in 0usize..256,
        incoming in 1usize..16,
    ) {
        let mut window = ContextWindow::new(context_length, protected);
        window.advance(context_length).unwrap();

        let p = protected.min(context_length / 2);
        let discarded = (context_length - p) / 2;
        match window.plan_rotation(incoming) {
            Ok(plan) => {
                prop_assert_eq!(plan.protected, p);
                prop_assert_eq!(plan.discarded, discarded);
                prop_assert_eq!(plan.n_past_after, context_length - discarded + 1);
                prop_assert!(plan.n_past_after < context_length);
            }
            Err(SessionError::RotationExhausted { .. }) => {
                prop_assert!(discarded < 2 || incoming + p + 1 > context_length);
            }
            Err(other) => prop_assert!(false, "unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_chunked_utf8_matches_whole_string(text in "\\PC{0,40}", cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8)) {
        let bytes = text.as_bytes();
        let mut points: Vec<usize> = cuts.iter().map(|c| c.index(bytes.len() + 1)).collect();
        points.push(0);
        points.push(bytes.len());
        points.sort_unstable();

        let mut decoder = Utf8Decoder::new();
        let mut streamed = String::new();
        for pair in points.windows(2) {
            streamed.push_str(&decoder.push(&bytes[pair[0]..pair[1]]));
        }
        prop_assert_eq!(decoder.finish(), 0);
        prop_assert_eq!(streamed, text);
    }
}
