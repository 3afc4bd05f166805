use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

#[derive(Debug, Copy, Clone)]
struct ProbIndex {
    prob: f32,
    index: u32,
}

/// Temperature / top-p sampling over a logit vector, with a seeded RNG so
/// decoding runs are reproducible.
///
/// Temperature 0 short-circuits to argmax; a top-p outside (0, 1) means
/// plain multinomial sampling.
pub struct Sampler {
    probindex: Vec<ProbIndex>,
    temperature: f32,
    top_p: f32,
    rng: ChaCha8Rng,
}

impl Sampler {
    pub fn new(temperature: f32, top_p: f32, seed: u64) -> Self {
        Self {
            probindex: Vec::new(),
            temperature,
            top_p,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Greedy decoding.
    pub fn argmax() -> Self {
        Self::new(0.0, 1.0, 0)
    }

    pub fn sample(&mut self, logits: &[f32]) -> u32 {
        assert!(!logits.is_empty(), "empty logits");

        if self.temperature == 0.0 {
            return sample_argmax(logits);
        }

        let mut probs = logits.to_vec();
        for logit in probs.iter_mut() {
            *logit /= self.temperature;
        }
        softmax(&mut probs);

        let rand: f32 = self.rng.gen();
        if self.top_p <= 0.0 || self.top_p >= 1.0 {
            sample_multinomial(&probs, rand)
        } else {
            self.sample_top_p(&probs, rand)
        }
    }

    fn sample_top_p(&mut self, probs: &[f32], rand: f32) -> u32 {
        self.probindex.clear();
        self.probindex
            .extend(probs.iter().enumerate().map(|(i, &p)| ProbIndex {
                prob: p,
                index: i as u32,
            }));
        self.probindex
            .sort_unstable_by(|a, b| b.prob.partial_cmp(&a.prob).unwrap());

        // Keep the smallest prefix whose mass reaches top_p.
        let mut cumulative = 0.0;
        let mut cutoff = self.probindex.len();
        for (i, pi) in self.probindex.iter().enumerate() {
            cumulative += pi.prob;
            if cumulative > self.top_p {
                cutoff = i + 1;
                break;
            }
        }

        let kept = &self.probindex[..cutoff];
        let total: f32 = kept.iter().map(|pi| pi.prob).sum();
        let scaled = rand * total;
        let mut cumulative = 0.0;
        for pi in kept {
            cumulative += pi.prob;
            if scaled < cumulative {
                return pi.index;
            }
        }
        kept[kept.len() - 1].index
    }
}

fn sample_argmax(values: &[f32]) -> u32 {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
        .map(|(index, _)| index as u32)
        .unwrap_or(0)
}

fn sample_multinomial(probs: &[f32], rand: f32) -> u32 {
    let mut cumulative = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if rand < cumulative {
            return i as u32;
        }
    }
    (probs.len() - 1) as u32
}

pub(crate) fn softmax(x: &mut [f32]) {
    let max_val = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for value in x.iter_mut() {
        *value = (*value - max_val).exp();
        sum += *value;
    }
    for value in x.iter_mut() {
        *value /= sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_temperature_is_argmax() {
        let mut sampler = Sampler::argmax();
        assert_eq!(sampler.sample(&[0.1, 2.0, -1.0, 1.9]), 1);
    }

    #[test]
    fn sampling_is_deterministic_under_a_seed() {
        let logits = vec![0.3f32, 0.5, 0.2, 0.7, 0.1];
        let mut a = Sampler::new(0.8, 0.9, 42);
        let mut b = Sampler::new(0.8, 0.9, 42);
        let picks_a: Vec<u32> = (0..16).map(|_| a.sample(&logits)).collect();
        let picks_b: Vec<u32> = (0..16).map(|_| b.sample(&logits)).collect();
        assert_eq!(picks_a, picks_b);
    }

    #[test]
    fn top_p_restricts_to_head_of_distribution() {
        // One dominant logit: top_p = 0.5 keeps only it.
        let logits = vec![10.0f32, 0.0, 0.0, 0.0];
        let mut sampler = Sampler::new(1.0, 0.5, 7);
        for _ in 0..32 {
            assert_eq!(sampler.sample(&logits), 0);
        }
    }

    #[test]
    fn softmax_normalizes() {
        let mut values = vec![1.0f32, 2.0, 3.0];
        softmax(&mut values);
        let sum: f32 = values.iter().sum();
        approx::assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-6);
        assert!(values[2] > values[1] && values[1] > values[0]);
    }
}
