use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use serde::{Deserialize, Serialize};

use crate::engine::EngineError;

/// 解码参数：对调用方固定，只能由运维通过配置覆盖
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// 输入 + 输出的总 token 上限
    pub max_length: usize,
    /// 0 表示不限制
    pub no_repeat_ngram_size: usize,
    /// None => greedy
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub seed: u64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_length: 100,
            no_repeat_ngram_size: 2,
            temperature: None,
            top_p: None,
            seed: 42,
        }
    }
}

/// 逐步产出 logits 的模型抽象，方便脱离真实权重测试解码循环
pub trait LogitsSource {
    /// `input` 为本步新喂入的 token，`index_pos` 为它们在序列中的起始位置。
    /// 返回形状为 (vocab,) 的 logits。
    fn next_logits(&mut self, input: &[u32], index_pos: usize) -> candle_core::Result<Tensor>;
}

/// 当前序列下会与已有 n-gram 重复、因此需要禁止的 token
pub fn banned_tokens(tokens: &[u32], n: usize) -> Vec<u32> {
    if n == 0 || tokens.len() + 1 < n {
        return Vec::new();
    }
    let prefix = &tokens[tokens.len() + 1 - n..];
    tokens
        .windows(n)
        .filter(|w| &w[..n - 1] == prefix)
        .map(|w| w[n - 1])
        .collect()
}

pub fn ban_repeated_ngrams(tokens: &[u32], n: usize, scores: &mut [f32]) {
    for id in banned_tokens(tokens, n) {
        if let Some(s) = scores.get_mut(id as usize) {
            *s = f32::NEG_INFINITY;
        }
    }
}

/// 完整的非流式解码：返回 prompt + 续写的全部 token。
/// prompt 已占满 `max_length` 时没有生成空间，直接报错。
pub fn generate_tokens<S: LogitsSource>(
    source: &mut S,
    prompt_tokens: &[u32],
    eos_tokens: &[u32],
    params: &GenerationParams,
) -> Result<Vec<u32>, EngineError> {
    if prompt_tokens.len() >= params.max_length {
        return Err(EngineError::PromptTooLong {
            tokens: prompt_tokens.len(),
            max_length: params.max_length,
        });
    }

    let mut tokens = prompt_tokens.to_vec();
    let mut logits_processor = LogitsProcessor::new(params.seed, params.temperature, params.top_p);
    let mut index_pos = 0;

    while tokens.len() < params.max_length {
        // 第一步喂整个 prompt（index_pos = 0 同时会重置 KV cache），之后每步只喂上一个 token
        let context = if index_pos == 0 {
            &tokens[..]
        } else {
            &tokens[tokens.len() - 1..]
        };
        let logits = source.next_logits(context, index_pos)?;
        index_pos += context.len();

        let mut scores = logits.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        ban_repeated_ngrams(&tokens, params.no_repeat_ngram_size, &mut scores);
        let logits = Tensor::new(scores.as_slice(), &Device::Cpu)?;

        let next_token = logits_processor.sample(&logits)?;
        tokens.push(next_token);
        if eos_tokens.contains(&next_token) {
            break;
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const VOCAB: usize = 16;

    /// 总是偏好同一组 token 的假模型，记录每次调用的参数
    struct Scripted {
        preferred: Vec<u32>,
        calls: Vec<(Vec<u32>, usize)>,
    }

    impl Scripted {
        fn new(preferred: &[u32]) -> Self {
            Self {
                preferred: preferred.to_vec(),
                calls: Vec::new(),
            }
        }
    }

    impl LogitsSource for Scripted {
        fn next_logits(&mut self, input: &[u32], index_pos: usize) -> candle_core::Result<Tensor> {
            self.calls.push((input.to_vec(), index_pos));
            // 未偏好的 token 按 id 递减，避免平分
            let mut scores: Vec<f32> = (0..VOCAB).map(|id| -(id as f32)).collect();
            for (rank, id) in self.preferred.iter().enumerate() {
                scores[*id as usize] = 100.0 - rank as f32;
            }
            Tensor::new(scores.as_slice(), &Device::Cpu)
        }
    }

    fn has_repeated_bigram(tokens: &[u32]) -> bool {
        let mut seen = std::collections::HashSet::new();
        tokens.windows(2).any(|w| !seen.insert((w[0], w[1])))
    }

    #[test]
    fn bans_token_completing_existing_bigram() {
        // 末尾为 3，序列中出现过 3->5 与 3->7
        assert_eq!(banned_tokens(&[3, 5, 1, 3, 7, 3], 2), vec![5, 7]);
    }

    #[test]
    fn no_bans_when_disabled_or_too_short() {
        assert!(banned_tokens(&[1, 1, 1], 0).is_empty());
        assert!(banned_tokens(&[1], 3).is_empty());
        assert!(banned_tokens(&[], 2).is_empty());
    }

    #[test]
    fn unigram_ban_covers_every_seen_token() {
        let mut banned = banned_tokens(&[4, 2, 4], 1);
        banned.sort();
        banned.dedup();
        assert_eq!(banned, vec![2, 4]);
    }

    #[test]
    fn out_of_vocab_ban_is_ignored() {
        let mut scores = vec![1.0f32; 4];
        ban_repeated_ngrams(&[9, 9], 2, &mut scores);
        assert_eq!(scores, vec![1.0; 4]);
    }

    #[test]
    fn total_length_is_capped() {
        let mut model = Scripted::new(&[7, 8, 9, 10, 11, 12]);
        let params = GenerationParams {
            max_length: 12,
            ..Default::default()
        };
        let out = generate_tokens(&mut model, &[1, 2, 3], &[], &params).unwrap();
        assert_eq!(out.len(), 12);
        assert_eq!(&out[..3], &[1, 2, 3]);
    }

    #[test]
    fn greedy_loop_never_repeats_a_bigram() {
        // 只偏好两个 token，若无约束会一直 7 8 7 8 ...
        let mut model = Scripted::new(&[7, 8]);
        let out = generate_tokens(&mut model, &[1], &[], &GenerationParams::default()).unwrap();
        assert!(out.len() <= 100);
        assert!(!has_repeated_bigram(&out), "repeated bigram in {out:?}");
    }

    #[test]
    fn stops_on_eos_and_keeps_it() {
        let mut model = Scripted::new(&[5]);
        let out = generate_tokens(&mut model, &[1, 2], &[5], &GenerationParams::default()).unwrap();
        assert_eq!(out, vec![1, 2, 5]);
    }

    #[test]
    fn prompt_filling_max_length_is_rejected() {
        let mut model = Scripted::new(&[7]);
        let prompt: Vec<u32> = (0..10).collect();
        let params = GenerationParams {
            max_length: 10,
            ..Default::default()
        };
        let err = generate_tokens(&mut model, &prompt, &[], &params).unwrap_err();
        assert!(
            matches!(
                err,
                EngineError::PromptTooLong {
                    tokens: 10,
                    max_length: 10
                }
            ),
            "{err:?}"
        );
        assert!(model.calls.is_empty());
    }

    #[test]
    fn prompt_one_short_of_max_length_gets_one_token() {
        let mut model = Scripted::new(&[7]);
        let prompt: Vec<u32> = (0..9).collect();
        let params = GenerationParams {
            max_length: 10,
            ..Default::default()
        };
        let out = generate_tokens(&mut model, &prompt, &[], &params).unwrap();
        assert_eq!(out.len(), 10);
        assert_eq!(model.calls.len(), 1);
    }

    #[test]
    fn prefill_then_single_token_steps() {
        let mut model = Scripted::new(&[7, 8, 9]);
        let params = GenerationParams {
            max_length: 6,
            ..Default::default()
        };
        generate_tokens(&mut model, &[1, 2, 3], &[], &params).unwrap();
        assert_eq!(model.calls[0], (vec![1, 2, 3], 0));
        assert_eq!(model.calls[1], (vec![7], 3));
        assert_eq!(model.calls[2].1, 4);
        assert_eq!(model.calls.len(), 3);
    }
}
