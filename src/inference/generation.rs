use anyhow::{anyhow, bail, Result};
use candle::{Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
};
use tracing::debug;

use crate::config::{BeamSearchParams, DecodingStrategy, SamplingParams};

/// Decoder-side special token ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub decoder_start: u32,
    pub eos: u32,
}

/// One decoder step: next-token logits for every sequence in the batch.
///
/// All sequences in a call share the same length. The returned rows are in
/// the same order as `sequences`.
pub trait NextTokenLogits {
    fn next_token_logits(&mut self, sequences: &[Vec<u32>]) -> Result<Vec<Vec<f32>>>;
}

/// Runs the configured strategy from the decoder start token until EOS or
/// `max_length`. The returned sequence starts with the start token.
pub fn generate<S: NextTokenLogits>(
    strategy: &DecodingStrategy,
    special: SpecialTokens,
    step: &mut S,
) -> Result<Vec<u32>> {
    match strategy {
        DecodingStrategy::BeamSearch(params) => beam_search(params, special, step),
        DecodingStrategy::Sampling(params) => sample(params, special, step),
    }
}

// ---------------------------------------------------------
// Sampling
// ---------------------------------------------------------

fn sampling_mode(params: &SamplingParams) -> Sampling {
    let temperature = params.temperature;
    if temperature <= 0.0 {
        return Sampling::ArgMax;
    }
    let top_p = (params.top_p < 1.0).then_some(params.top_p);
    match (params.top_k, top_p) {
        (0, None) => Sampling::All { temperature },
        (0, Some(p)) => Sampling::TopP { p, temperature },
        (k, None) => Sampling::TopK { k, temperature },
        (k, Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
    }
}

fn sample<S: NextTokenLogits>(
    params: &SamplingParams,
    special: SpecialTokens,
    step: &mut S,
) -> Result<Vec<u32>> {
    let seed = params.seed.unwrap_or_else(rand::random);
    let mut processor = LogitsProcessor::from_sampling(seed, sampling_mode(params));

    let mut sequence = vec![special.decoder_start];
    while sequence.len() < params.max_length {
        let mut logits = step
            .next_token_logits(std::slice::from_ref(&sequence))?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("decoder returned no logits"))?;

        if sequence.len() < params.min_length {
            mask_token(&mut logits, special.eos);
        }

        let logits = Tensor::new(logits.as_slice(), &Device::Cpu)?;
        let next = processor.sample(&logits)?;
        sequence.push(next);

        if next == special.eos {
            break;
        }
    }

    debug!(seed, tokens = sequence.len(), "sampling finished");
    Ok(sequence)
}

// ---------------------------------------------------------
// Beam search
// ---------------------------------------------------------

#[derive(Debug, Clone)]
struct Beam {
    tokens: Vec<u32>,
    log_prob: f64,
}

#[derive(Debug)]
struct Hypothesis {
    score: f64,
    tokens: Vec<u32>,
}

impl PartialEq for Hypothesis {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Hypothesis {}

impl PartialOrd for Hypothesis {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hypothesis {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score.total_cmp(&other.score)
    }
}

/// The `num_beams` best finished sequences, worst on top of the heap.
struct Hypotheses {
    num_beams: usize,
    length_penalty: f64,
    early_stopping: bool,
    heap: BinaryHeap<Reverse<Hypothesis>>,
}

impl Hypotheses {
    fn new(params: &BeamSearchParams) -> Self {
        Self {
            num_beams: params.num_beams,
            length_penalty: params.length_penalty,
            early_stopping: params.early_stopping,
            heap: BinaryHeap::with_capacity(params.num_beams + 1),
        }
    }

    fn normalize(&self, log_prob: f64, len: usize) -> f64 {
        log_prob / (len as f64).powf(self.length_penalty)
    }

    fn worst_score(&self) -> Option<f64> {
        self.heap.peek().map(|h| h.0.score)
    }

    fn add(&mut self, tokens: Vec<u32>, log_prob: f64) {
        let score = self.normalize(log_prob, tokens.len());
        if self.heap.len() < self.num_beams {
            self.heap.push(Reverse(Hypothesis { score, tokens }));
        } else if let Some(mut worst) = self.heap.peek_mut() {
            if score > worst.0.score {
                *worst = Reverse(Hypothesis { score, tokens });
            }
        }
    }

    fn is_done(&self, best_log_prob: f64, current_len: usize) -> bool {
        if self.heap.len() < self.num_beams {
            return false;
        }
        if self.early_stopping {
            return true;
        }
        match self.worst_score() {
            Some(worst) => worst >= self.normalize(best_log_prob, current_len),
            None => false,
        }
    }

    fn best(self) -> Option<Vec<u32>> {
        self.heap
            .into_iter()
            .map(|h| h.0)
            .max()
            .map(|h| h.tokens)
    }
}

struct Candidate {
    beam: usize,
    token: u32,
    log_prob: f64,
}

fn beam_search<S: NextTokenLogits>(
    params: &BeamSearchParams,
    special: SpecialTokens,
    step: &mut S,
) -> Result<Vec<u32>> {
    if params.num_beams == 0 {
        bail!("beam search needs at least one beam");
    }
    let num_beams = params.num_beams;
    let mut hypotheses = Hypotheses::new(params);
    let mut beams = vec![Beam {
        tokens: vec![special.decoder_start],
        log_prob: 0.0,
    }];
    let mut done = false;
    let mut cur_len = 1;

    while cur_len < params.max_length {
        let sequences: Vec<Vec<u32>> = beams.iter().map(|b| b.tokens.clone()).collect();
        let rows = step.next_token_logits(&sequences)?;
        if rows.len() != beams.len() {
            bail!(
                "decoder returned {} logit rows for {} beams",
                rows.len(),
                beams.len()
            );
        }

        let mut candidates = Vec::with_capacity(beams.len() * 2 * num_beams);
        for (beam_idx, (beam, row)) in beams.iter().zip(rows).enumerate() {
            let mut scores = log_softmax(&row);
            if cur_len < params.min_length {
                mask_token(&mut scores, special.eos);
            }
            for (token, score) in top_k(&scores, 2 * num_beams) {
                if score == f32::NEG_INFINITY {
                    continue;
                }
                candidates.push(Candidate {
                    beam: beam_idx,
                    token,
                    log_prob: beam.log_prob + score as f64,
                });
            }
        }
        candidates.sort_by(|a, b| b.log_prob.total_cmp(&a.log_prob));
        candidates.truncate(2 * num_beams);

        let mut next_beams = Vec::with_capacity(num_beams);
        for (rank, candidate) in candidates.into_iter().enumerate() {
            let parent = &beams[candidate.beam];
            if candidate.token == special.eos {
                // EOS below the top `num_beams` would never have survived as a beam.
                if rank < num_beams {
                    hypotheses.add(parent.tokens.clone(), candidate.log_prob);
                }
            } else {
                let mut tokens = parent.tokens.clone();
                tokens.push(candidate.token);
                next_beams.push(Beam {
                    tokens,
                    log_prob: candidate.log_prob,
                });
            }
            if next_beams.len() == num_beams {
                break;
            }
        }

        cur_len += 1;
        beams = next_beams;

        let best = match beams.first() {
            Some(beam) => beam.log_prob,
            None => {
                done = true;
                break;
            }
        };
        if hypotheses.is_done(best, cur_len) {
            done = true;
            break;
        }
    }

    if !done {
        for beam in beams {
            hypotheses.add(beam.tokens, beam.log_prob);
        }
    }

    let best = hypotheses
        .best()
        .ok_or_else(|| anyhow!("beam search produced no hypothesis"))?;
    debug!(tokens = best.len(), num_beams, "beam search finished");
    Ok(best)
}

// ---------------------------------------------------------
// Helpers
// ---------------------------------------------------------

fn mask_token(logits: &mut [f32], token: u32) {
    if let Some(logit) = logits.get_mut(token as usize) {
        *logit = f32::NEG_INFINITY;
    }
}

fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return logits.to_vec();
    }
    let sum: f32 = logits.iter().map(|&x| (x - max).exp()).sum();
    let log_sum = max + sum.ln();
    logits.iter().map(|&x| x - log_sum).collect()
}

/// Highest `k` entries as `(token, score)`, best first.
fn top_k(scores: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = scores
        .iter()
        .enumerate()
        .map(|(idx, &score)| (idx as u32, score))
        .collect();
    let by_score = |a: &(u32, f32), b: &(u32, f32)| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0));
    if k < indexed.len() {
        indexed.select_nth_unstable_by(k, by_score);
        indexed.truncate(k);
    }
    indexed.sort_by(by_score);
    indexed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const START: u32 = 0;
    const EOS: u32 = 1;
    const A: u32 = 2;
    const B: u32 = 3;
    const C: u32 = 4;

    const SPECIAL: SpecialTokens = SpecialTokens {
        decoder_start: START,
        eos: EOS,
    };

    /// Next-token distribution keyed by the last token of each sequence.
    struct Scripted {
        table: HashMap<u32, Vec<f32>>,
        calls: Vec<usize>,
    }

    impl Scripted {
        fn new<const N: usize>(rows: &[(u32, [f32; N])]) -> Self {
            Self {
                table: rows.iter().map(|(last, probs)| (*last, probs.to_vec())).collect(),
                calls: Vec::new(),
            }
        }
    }

    impl NextTokenLogits for Scripted {
        fn next_token_logits(&mut self, sequences: &[Vec<u32>]) -> Result<Vec<Vec<f32>>> {
            self.calls.push(sequences.len());
            sequences
                .iter()
                .map(|seq| {
                    let last = *seq.last().ok_or_else(|| anyhow!("empty sequence"))?;
                    let probs = self
                        .table
                        .get(&last)
                        .ok_or_else(|| anyhow!("no row for token {last}"))?;
                    Ok(probs.iter().map(|p| p.ln()).collect())
                })
                .collect()
        }
    }

    struct Failing;

    impl NextTokenLogits for Failing {
        fn next_token_logits(&mut self, _: &[Vec<u32>]) -> Result<Vec<Vec<f32>>> {
            Err(anyhow!("device lost"))
        }
    }

    fn beam(num_beams: usize, max_length: usize, min_length: usize) -> DecodingStrategy {
        DecodingStrategy::BeamSearch(BeamSearchParams {
            num_beams,
            max_length,
            min_length,
            early_stopping: true,
            length_penalty: 1.0,
        })
    }

    fn open_beam(num_beams: usize, max_length: usize, length_penalty: f64) -> DecodingStrategy {
        DecodingStrategy::BeamSearch(BeamSearchParams {
            num_beams,
            max_length,
            min_length: 0,
            early_stopping: false,
            length_penalty,
        })
    }

    fn greedy(max_length: usize, min_length: usize) -> DecodingStrategy {
        DecodingStrategy::Sampling(SamplingParams {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            max_length,
            min_length,
            seed: Some(7),
        })
    }

    // Greedy takes A first, but the only likely completion runs through B.
    fn garden_path() -> Scripted {
        Scripted::new(&[
            (START, [1e-6, 1e-6, 0.55, 0.45]),
            (A, [1e-6, 0.30, 0.35, 0.35]),
            (B, [1e-6, 0.90, 0.05, 0.05]),
        ])
    }

    #[test]
    fn beam_search_beats_greedy_on_garden_path() {
        let out = generate(&beam(2, 10, 0), SPECIAL, &mut garden_path()).unwrap();
        assert_eq!(out, vec![START, B]);

        let greedy_out = generate(&greedy(10, 0), SPECIAL, &mut garden_path()).unwrap();
        assert_eq!(greedy_out[1], A);
    }

    // B finishes at step two. A only finishes well by way of C, one step later.
    fn late_finisher() -> Scripted {
        Scripted::new(&[
            (START, [1e-6, 1e-6, 0.6, 0.4, 1e-6]),
            (A, [1e-6, 0.5, 1e-6, 1e-6, 0.5]),
            (B, [1e-6, 0.95, 1e-6, 1e-6, 0.05]),
            (C, [1e-6, 0.999, 1e-6, 1e-6, 1e-6]),
        ])
    }

    #[test]
    fn early_stopping_keeps_first_finished_hypotheses() {
        let out = generate(&beam(2, 10, 0), SPECIAL, &mut late_finisher()).unwrap();
        assert_eq!(out, vec![START, B]);

        let mut step = late_finisher();
        let out = generate(&open_beam(2, 10, 1.0), SPECIAL, &mut step).unwrap();
        assert_eq!(out, vec![START, A, C]);
        assert_eq!(step.calls.len(), 3);
    }

    #[test]
    fn length_penalty_decides_between_finished_lengths() {
        // Raw log-probabilities favour the short hypothesis.
        let out = generate(&open_beam(2, 10, 0.0), SPECIAL, &mut late_finisher()).unwrap();
        assert_eq!(out, vec![START, B]);

        let out = generate(&open_beam(2, 10, 2.0), SPECIAL, &mut late_finisher()).unwrap();
        assert_eq!(out, vec![START, A, C]);
    }

    #[test]
    fn open_search_runs_to_max_length_while_beams_can_improve() {
        let mut step = Scripted::new(&[
            (START, [1e-6, 1e-6, 0.5, 0.5]),
            (A, [1e-6, 0.3, 0.35, 0.35]),
            (B, [1e-6, 0.3, 0.35, 0.35]),
        ]);
        let out = generate(&open_beam(2, 6, 2.0), SPECIAL, &mut step).unwrap();
        assert_eq!(out.len(), 6);
        assert!(!out.contains(&EOS));
        assert_eq!(step.calls.len(), 5);
    }

    #[test]
    fn beam_search_batches_live_beams() {
        let mut step = garden_path();
        generate(&beam(2, 10, 0), SPECIAL, &mut step).unwrap();
        assert_eq!(step.calls.first(), Some(&1));
        assert!(step.calls.iter().skip(1).all(|&n| n == 2));
    }

    #[test]
    fn beam_search_respects_min_length() {
        let out = generate(&beam(2, 10, 4), SPECIAL, &mut garden_path()).unwrap();
        assert!(out.len() >= 4, "got {out:?}");
        assert_eq!(out[0], START);
        assert!(!out.contains(&EOS));
    }

    #[test]
    fn beam_search_stops_at_max_length() {
        let mut step = Scripted::new(&[
            (START, [1e-6, 1e-6, 0.5, 0.5]),
            (A, [1e-6, 1e-6, 0.6, 0.4]),
            (B, [1e-6, 1e-6, 0.4, 0.6]),
        ]);
        let out = generate(&beam(3, 6, 0), SPECIAL, &mut step).unwrap();
        assert_eq!(out.len(), 6);
        assert_eq!(step.calls.len(), 5);
    }

    #[test]
    fn single_beam_is_greedy() {
        let out = generate(&beam(1, 10, 0), SPECIAL, &mut garden_path()).unwrap();
        assert_eq!(out[1], A);
    }

    #[test]
    fn sampling_respects_length_bounds() {
        let table = [
            (START, [1e-6, 0.9, 0.05, 0.05]),
            (A, [1e-6, 0.9, 0.05, 0.05]),
            (B, [1e-6, 0.9, 0.05, 0.05]),
        ];

        // EOS is the argmax everywhere, so the sequence ends as soon as it may.
        let out = generate(&greedy(10, 0), SPECIAL, &mut Scripted::new(&table)).unwrap();
        assert_eq!(out, vec![START, EOS]);

        let out = generate(&greedy(10, 4), SPECIAL, &mut Scripted::new(&table)).unwrap();
        assert_eq!(out.len(), 5);
        assert_eq!(out.last(), Some(&EOS));
        assert!(!out[..4].contains(&EOS));

        let out = generate(&greedy(3, 3), SPECIAL, &mut Scripted::new(&table)).unwrap();
        assert_eq!(out.len(), 3);
        assert!(!out.contains(&EOS));
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let strategy = DecodingStrategy::Sampling(SamplingParams {
            temperature: 1.0,
            top_k: 3,
            top_p: 0.95,
            max_length: 12,
            min_length: 0,
            seed: Some(1234),
        });
        let table = [
            (START, [1e-6, 0.2, 0.4, 0.4]),
            (A, [1e-6, 0.2, 0.4, 0.4]),
            (B, [1e-6, 0.2, 0.4, 0.4]),
        ];
        let first = generate(&strategy, SPECIAL, &mut Scripted::new(&table)).unwrap();
        let second = generate(&strategy, SPECIAL, &mut Scripted::new(&table)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn decoder_errors_propagate() {
        assert!(generate(&beam(2, 10, 0), SPECIAL, &mut Failing).is_err());
        assert!(generate(&greedy(10, 0), SPECIAL, &mut Failing).is_err());
    }

    #[test]
    fn sampling_mode_follows_filters() {
        let mut params = SamplingParams::default();
        assert!(matches!(
            sampling_mode(&params),
            Sampling::TopKThenTopP { k: 50, .. }
        ));
        params.top_p = 1.0;
        assert!(matches!(sampling_mode(&params), Sampling::TopK { k: 50, .. }));
        params.top_k = 0;
        assert!(matches!(sampling_mode(&params), Sampling::All { .. }));
        params.top_p = 0.9;
        assert!(matches!(sampling_mode(&params), Sampling::TopP { .. }));
        params.temperature = 0.0;
        assert!(matches!(sampling_mode(&params), Sampling::ArgMax));
    }

    #[test]
    fn top_k_orders_best_first() {
        let picked = top_k(&[0.1, 0.7, f32::NEG_INFINITY, 0.3], 2);
        assert_eq!(picked, vec![(1, 0.7), (3, 0.3)]);
        assert_eq!(top_k(&[0.5], 4), vec![(0, 0.5)]);
    }

    #[test]
    fn log_softmax_normalizes() {
        let out = log_softmax(&[1.0, 2.0, 3.0]);
        let total: f32 = out.iter().map(|x| x.exp()).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert!(out[2] > out[1] && out[1] > out[0]);
    }
}
