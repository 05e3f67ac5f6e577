//! Decoding loop: greedy, top-k sampling, beam search and beam sampling.
//!
//! Every strategy shares the same stopping rules. `max_length` bounds the
//! whole sequence (prompt included), EOS ends a row, and a prompt that
//! already reaches the bound produces no new tokens.

use rand::rngs::StdRng;
use rand::Rng;
use std::cmp::Ordering;

use crate::error::ServeError;

/// Score given to beams that exist only to keep the beam width constant.
const DEAD_BEAM_SCORE: f32 = -1.0e9;

/// A causal language model able to score the next token of each row.
pub trait CausalLm: Send + Sync {
    /// Next-token logits for the last position of every row.
    ///
    /// All rows have the same length. `attention_mask` has the shape of
    /// `rows`, with `1` for real tokens and `0` for padding.
    fn next_token_logits(
        &self,
        rows: &[Vec<u32>],
        attention_mask: &[Vec<u32>],
    ) -> Result<Vec<Vec<f32>>, ServeError>;

    /// Longest sequence the model accepts.
    fn max_positions(&self) -> usize {
        usize::MAX
    }

    fn name(&self) -> &str;
}

/// How the continuation is chosen. One policy covers every strategy the
/// service exposes; `strategy()` picks the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodingPolicy {
    pub num_beams: usize,
    /// `0` disables n-gram blocking.
    pub no_repeat_ngram_size: usize,
    pub do_sample: bool,
    /// `0` disables top-k truncation.
    pub top_k: usize,
    pub temperature: f32,
    /// Maximum total length in tokens, prompt included.
    pub max_length: usize,
    pub length_penalty: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Greedy,
    Sample,
    BeamSearch,
    BeamSample,
}

impl Default for DecodingPolicy {
    fn default() -> Self {
        Self::greedy(50)
    }
}

impl DecodingPolicy {
    pub fn greedy(max_length: usize) -> Self {
        Self {
            num_beams: 1,
            no_repeat_ngram_size: 0,
            do_sample: false,
            top_k: 0,
            temperature: 1.0,
            max_length,
            length_penalty: 1.0,
        }
    }

    /// Five beams, no repeated bigrams, sampling restricted to the top 50.
    pub fn beam_sample(max_length: usize) -> Self {
        Self {
            num_beams: 5,
            no_repeat_ngram_size: 2,
            do_sample: true,
            top_k: 50,
            temperature: 1.0,
            max_length,
            length_penalty: 1.0,
        }
    }

    pub fn strategy(&self) -> Strategy {
        match (self.num_beams > 1, self.do_sample) {
            (false, false) => Strategy::Greedy,
            (false, true) => Strategy::Sample,
            (true, false) => Strategy::BeamSearch,
            (true, true) => Strategy::BeamSample,
        }
    }

    pub fn validate(&self) -> Result<(), ServeError> {
        if self.num_beams == 0 {
            return Err(ServeError::InvalidPolicy("num_beams must be at least 1".into()));
        }
        if self.max_length == 0 {
            return Err(ServeError::InvalidPolicy("max_length must be at least 1".into()));
        }
        if self.do_sample && !(self.temperature > 0.0 && self.temperature.is_finite()) {
            return Err(ServeError::InvalidPolicy(format!(
                "temperature must be positive when sampling, got {}",
                self.temperature
            )));
        }
        Ok(())
    }
}

/// Output of one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct Generated {
    /// Prompt followed by the continuation.
    pub tokens: Vec<u32>,
    pub prompt_len: usize,
}

impl Generated {
    pub fn continuation(&self) -> &[u32] {
        &self.tokens[self.prompt_len..]
    }
}

/// Runs `policy` over `prompt` and returns the full sequence.
pub fn generate(
    model: &dyn CausalLm,
    prompt: &[u32],
    attention_mask: &[u32],
    policy: &DecodingPolicy,
    eos_token_id: Option<u32>,
    rng: &mut StdRng,
) -> Result<Generated, ServeError> {
    policy.validate()?;
    if prompt.len() > model.max_positions() {
        return Err(ServeError::ContextOverflow {
            len: prompt.len(),
            max: model.max_positions(),
        });
    }

    let limit = policy.max_length.min(model.max_positions());
    let tokens = match policy.strategy() {
        Strategy::Greedy | Strategy::Sample => {
            single_row(model, prompt, attention_mask, policy, limit, eos_token_id, rng)?
        }
        Strategy::BeamSearch | Strategy::BeamSample => {
            beam(model, prompt, attention_mask, policy, limit, eos_token_id, rng)?
        }
    };

    tracing::debug!(
        strategy = ?policy.strategy(),
        prompt_tokens = prompt.len(),
        generated_tokens = tokens.len() - prompt.len(),
        "Decoding finished"
    );

    Ok(Generated {
        tokens,
        prompt_len: prompt.len(),
    })
}

fn single_row(
    model: &dyn CausalLm,
    prompt: &[u32],
    attention_mask: &[u32],
    policy: &DecodingPolicy,
    limit: usize,
    eos_token_id: Option<u32>,
    rng: &mut StdRng,
) -> Result<Vec<u32>, ServeError> {
    let mut row = vec![prompt.to_vec()];
    let mut mask = vec![attention_mask.to_vec()];

    while row[0].len() < limit {
        let mut scores = first_row(model.next_token_logits(&row, &mask)?)?;
        block_repeated_ngrams(&mut scores, &row[0], policy.no_repeat_ngram_size);

        let choice = if policy.do_sample {
            warp(&mut scores, policy.temperature, policy.top_k);
            let mut probs = softmax(&scores);
            sample_without_replacement(&mut probs, 1, rng)
                .pop()
                .unwrap_or_else(|| argmax(&scores))
        } else {
            argmax(&scores)
        };
        let next = choice as u32;

        row[0].push(next);
        mask[0].push(1);
        if Some(next) == eos_token_id {
            break;
        }
    }

    Ok(row.swap_remove(0))
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    beam: usize,
    token: u32,
    score: f32,
}

fn beam(
    model: &dyn CausalLm,
    prompt: &[u32],
    attention_mask: &[u32],
    policy: &DecodingPolicy,
    limit: usize,
    eos_token_id: Option<u32>,
    rng: &mut StdRng,
) -> Result<Vec<u32>, ServeError> {
    let width = policy.num_beams;
    let prompt_len = prompt.len();

    let mut beams = vec![prompt.to_vec(); width];
    let mut masks = vec![attention_mask.to_vec(); width];
    // Only the first beam is live at the start so identical beams do not
    // produce duplicate candidates.
    let mut beam_scores = vec![DEAD_BEAM_SCORE; width];
    beam_scores[0] = 0.0;

    let mut finished = BeamHypotheses::new(width, policy.length_penalty);

    while beams[0].len() < limit {
        let logits = model.next_token_logits(&beams, &masks)?;
        if logits.len() != width {
            return Err(ServeError::Model(candle_core::Error::Msg(format!(
                "model returned {} rows for {} beams",
                logits.len(),
                width
            ))));
        }

        let mut rows: Vec<Vec<f32>> = Vec::with_capacity(width);
        for (idx, row_logits) in logits.iter().enumerate() {
            let mut scores = log_softmax(row_logits);
            block_repeated_ngrams(&mut scores, &beams[idx], policy.no_repeat_ngram_size);
            for s in scores.iter_mut() {
                *s += beam_scores[idx];
            }
            if policy.do_sample {
                warp(&mut scores, policy.temperature, policy.top_k);
            }
            rows.push(scores);
        }

        let vocab = rows[0].len();
        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        let take = 2 * width;
        let picked = if policy.do_sample {
            let mut probs = softmax(&flat);
            sample_without_replacement(&mut probs, take, rng)
        } else {
            top_indices(&flat, take)
        };

        let mut candidates: Vec<Candidate> = picked
            .into_iter()
            .filter(|&i| flat[i].is_finite())
            .map(|i| Candidate {
                beam: i / vocab,
                token: (i % vocab) as u32,
                score: flat[i],
            })
            .collect();
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

        let generated_len = beams[0].len() + 1 - prompt_len;
        let mut next: Vec<Candidate> = Vec::with_capacity(width);
        for (rank, cand) in candidates.iter().enumerate() {
            if Some(cand.token) == eos_token_id {
                // An EOS outside the top `width` would displace a better live beam.
                if rank < width {
                    let mut hyp = beams[cand.beam].clone();
                    hyp.push(cand.token);
                    finished.add(hyp, cand.score, generated_len);
                }
            } else {
                next.push(*cand);
            }
            if next.len() == width {
                break;
            }
        }

        if next.is_empty() {
            break;
        }
        // Keep the width constant with placeholders that can never win.
        let filler = Candidate {
            score: DEAD_BEAM_SCORE,
            ..next[0]
        };
        while next.len() < width {
            next.push(filler);
        }

        let best_running = next[0].score;
        beams = next
            .iter()
            .map(|c| {
                let mut seq = beams[c.beam].clone();
                seq.push(c.token);
                seq
            })
            .collect();
        masks = next
            .iter()
            .map(|c| {
                let mut m = masks[c.beam].clone();
                m.push(1);
                m
            })
            .collect();
        beam_scores = next.iter().map(|c| c.score).collect();

        if finished.is_done(best_running, generated_len) {
            break;
        }
    }

    let generated_len = beams[0].len() - prompt_len;
    for (seq, score) in beams.into_iter().zip(beam_scores) {
        if score > DEAD_BEAM_SCORE {
            finished.add(seq, score, generated_len.max(1));
        }
    }

    Ok(finished.best().unwrap_or_else(|| prompt.to_vec()))
}

/// Finished beam hypotheses, ranked by length-normalised log probability.
struct BeamHypotheses {
    capacity: usize,
    length_penalty: f32,
    entries: Vec<(f32, Vec<u32>)>,
}

impl BeamHypotheses {
    fn new(capacity: usize, length_penalty: f32) -> Self {
        Self {
            capacity,
            length_penalty,
            entries: Vec::with_capacity(capacity + 1),
        }
    }

    fn normalise(&self, sum_logprobs: f32, generated_len: usize) -> f32 {
        sum_logprobs / (generated_len.max(1) as f32).powf(self.length_penalty)
    }

    fn worst(&self) -> Option<f32> {
        self.entries.iter().map(|(s, _)| *s).reduce(f32::min)
    }

    fn add(&mut self, tokens: Vec<u32>, sum_logprobs: f32, generated_len: usize) {
        let score = self.normalise(sum_logprobs, generated_len);
        if self.entries.len() < self.capacity || self.worst().map_or(true, |w| score > w) {
            self.entries.push((score, tokens));
            if self.entries.len() > self.capacity {
                if let Some(pos) = self
                    .entries
                    .iter()
                    .enumerate()
                    .min_by(|a, b| a.1 .0.partial_cmp(&b.1 .0).unwrap_or(Ordering::Equal))
                    .map(|(i, _)| i)
                {
                    self.entries.remove(pos);
                }
            }
        }
    }

    /// True once no running beam can beat the worst finished hypothesis.
    fn is_done(&self, best_running: f32, generated_len: usize) -> bool {
        if self.entries.len() < self.capacity {
            return false;
        }
        match self.worst() {
            Some(worst) => worst >= self.normalise(best_running, generated_len),
            None => false,
        }
    }

    fn best(self) -> Option<Vec<u32>> {
        self.entries
            .into_iter()
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal))
            .map(|(_, tokens)| tokens)
    }
}

fn first_row(mut logits: Vec<Vec<f32>>) -> Result<Vec<f32>, ServeError> {
    if logits.is_empty() {
        return Err(ServeError::Model(candle_core::Error::Msg(
            "model returned no logits".into(),
        )));
    }
    Ok(logits.swap_remove(0))
}

/// Sets to `-inf` every token that would repeat an n-gram already in `seq`.
pub fn block_repeated_ngrams(scores: &mut [f32], seq: &[u32], ngram_size: usize) {
    if ngram_size == 0 || seq.len() + 1 < ngram_size {
        return;
    }
    let prefix = &seq[seq.len() + 1 - ngram_size..];
    for window in seq.windows(ngram_size) {
        if window[..ngram_size - 1] == *prefix {
            if let Some(s) = scores.get_mut(window[ngram_size - 1] as usize) {
                *s = f32::NEG_INFINITY;
            }
        }
    }
}

/// Temperature scaling followed by top-k truncation.
pub fn warp(scores: &mut [f32], temperature: f32, top_k: usize) {
    if temperature != 1.0 {
        let inv = 1.0 / temperature;
        for s in scores.iter_mut() {
            *s *= inv;
        }
    }
    if top_k > 0 && top_k < scores.len() {
        let mut sorted = scores.to_vec();
        sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
        let threshold = sorted[top_k - 1];
        for s in scores.iter_mut() {
            if *s < threshold {
                *s = f32::NEG_INFINITY;
            }
        }
    }
}

pub fn argmax(scores: &[f32]) -> usize {
    let mut best = 0;
    for (i, &s) in scores.iter().enumerate() {
        if s > scores[best] {
            best = i;
        }
    }
    best
}

fn top_indices(scores: &[f32], k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..scores.len()).collect();
    idx.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap_or(Ordering::Equal));
    idx.truncate(k);
    idx
}

pub fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![0.0; scores.len()];
    }
    let mut probs: Vec<f32> = scores.iter().map(|&s| (s - max).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }
    probs
}

pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![f32::NEG_INFINITY; logits.len()];
    }
    let log_sum = logits.iter().map(|&l| (l - max).exp()).sum::<f32>().ln() + max;
    logits.iter().map(|&l| l - log_sum).collect()
}

/// Draws up to `k` distinct indices proportionally to `weights`.
/// Drawn weights are zeroed; returns fewer than `k` once the mass runs out.
fn sample_without_replacement(weights: &mut [f32], k: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut picked = Vec::with_capacity(k);
    for _ in 0..k {
        let total: f32 = weights.iter().sum();
        if !(total > 0.0) {
            break;
        }
        let mut target = rng.gen::<f32>() * total;
        let mut choice = None;
        for (i, &w) in weights.iter().enumerate() {
            if w <= 0.0 {
                continue;
            }
            choice = Some(i);
            if target < w {
                break;
            }
            target -= w;
        }
        match choice {
            Some(i) => {
                weights[i] = 0.0;
                picked.push(i);
            }
            None => break,
        }
    }
    picked
}
