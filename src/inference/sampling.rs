//! Sampling utilities for generation.
//!
//! Temperature scaling, optional top-k filtering, and multinomial sampling over a logits row.

use rand::Rng;

/// Sample a token id from a logits vector.
///
/// `temperature <= 0` selects the argmax. `top_k == 0` keeps every token.
#[must_use]
pub fn sample_from_logits(logits: &[f32], temperature: f32, top_k: usize, rng: &mut impl Rng) -> u32 {
    if temperature <= 0.0 {
        return argmax(logits);
    }

    let mut scaled: Vec<f32> = logits.iter().map(|v| v / temperature).collect();
    if top_k > 0 && top_k < scaled.len() {
        keep_top_k(&mut scaled, top_k);
    }

    let probs = softmax(&scaled);
    if probs.iter().all(|p| *p == 0.0) {
        return argmax(logits);
    }
    sample_multinomial(&probs, rng)
}

#[must_use]
#[allow(clippy::cast_possible_truncation)]
fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map_or(0, |(i, _)| i as u32)
}

/// Mask everything below the k-th largest finite value to −∞.
fn keep_top_k(logits: &mut [f32], k: usize) {
    let mut finite: Vec<f32> = logits.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.len() <= k {
        return;
    }
    finite.sort_by(|a, b| b.total_cmp(a));
    let kth = finite[k - 1];
    for v in logits.iter_mut() {
        if *v < kth {
            *v = f32::NEG_INFINITY;
        }
    }
}

/// Softmax with max subtraction; non-finite entries get probability zero.
#[must_use]
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![0.0; logits.len()];
    }

    let exps: Vec<f32> = logits
        .iter()
        .map(|&v| if v.is_finite() { (v - max).exp() } else { 0.0 })
        .collect();
    let sum: f32 = exps.iter().sum();
    if sum == 0.0 {
        return vec![0.0; logits.len()];
    }
    exps.into_iter().map(|e| e / sum).collect()
}

#[must_use]
#[allow(clippy::cast_possible_truncation)]
fn sample_multinomial(probs: &[f32], rng: &mut impl Rng) -> u32 {
    let r: f32 = rng.r#gen();
    let mut cum = 0.0_f32;
    for (idx, &p) in probs.iter().enumerate() {
        cum += p;
        if r < cum {
            return idx as u32;
        }
    }
    // Rounding can leave cum slightly below 1.
    probs.iter().rposition(|p| *p > 0.0).unwrap_or(0) as u32
}
