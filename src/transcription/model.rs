//! # Whisper Model
//!
//! Loads a Whisper checkpoint from the HuggingFace hub with Candle and runs
//! timestamped greedy decoding over a whole media file.
//!
//! ## Model Loading Process:
//! 1. Download `config.json`, `tokenizer.json` and `model.safetensors` (cached locally)
//! 2. Build the Slaney mel filter bank for the model's number of mel bins
//! 3. Memory-map the weights onto the selected device
//!
//! ## Decoding:
//! The log-mel spectrogram is walked in 30 second windows. Each window is
//! decoded greedily with timestamp tokens enabled; pairs of timestamp tokens
//! delimit segments, and a segment's confidence is the mean probability of its
//! text tokens.

use std::path::Path;

use anyhow::{anyhow, Result};
use candle_core::{Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use hf_hub::api::sync::ApiBuilder;
use tokenizers::Tokenizer;

use crate::transcription::audio;
use crate::transcription::engine::SpeechRecognizer;
use crate::transcription::{Segment, TranscriptionResult};

/// Seconds per timestamp token step.
const TIMESTAMP_STEP: f64 = 0.02;

/// Upper bound on sampled tokens per 30 second window.
const MAX_TOKENS_PER_WINDOW: usize = 224;

/// Available Whisper model sizes.
///
/// ## Trade-offs:
/// - **Size vs Accuracy**: Larger models are more accurate but slower
/// - **Memory**: `medium` and up want a GPU for anything longer than a few minutes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
    LargeV3,
}

impl ModelSize {
    /// HuggingFace repository holding the checkpoint.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
            ModelSize::LargeV3 => "openai/whisper-large-v3",
        }
    }

    /// Approximate download size in MB.
    pub fn size_mb(&self) -> u32 {
        match self {
            ModelSize::Tiny => 151,
            ModelSize::Base => 290,
            ModelSize::Small => 967,
            ModelSize::Medium => 3060,
            ModelSize::Large | ModelSize::LargeV3 => 6170,
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" | "large-v2" => Ok(ModelSize::Large),
            "large-v3" => Ok(ModelSize::LargeV3),
            _ => Err(anyhow!(
                "Unknown model size: {} (expected tiny, base, small, medium, large or large-v3)",
                s
            )),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
            ModelSize::LargeV3 => "large-v3",
        };
        f.write_str(name)
    }
}

/// Special token ids looked up from the tokenizer once at load time.
#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    /// First timestamp token, `<|0.00|>`, right after `<|notimestamps|>`
    timestamp_begin: u32,
}

impl SpecialTokens {
    fn from_tokenizer(tokenizer: &Tokenizer) -> Result<Self> {
        Ok(Self {
            sot: token_id(tokenizer, m::SOT_TOKEN)?,
            eot: token_id(tokenizer, m::EOT_TOKEN)?,
            transcribe: token_id(tokenizer, m::TRANSCRIBE_TOKEN)?,
            timestamp_begin: token_id(tokenizer, m::NO_TIMESTAMPS_TOKEN)? + 1,
        })
    }

    fn is_timestamp(&self, token: u32) -> bool {
        token >= self.timestamp_begin
    }
}

/// A loaded Whisper model ready for transcription.
///
/// Decoding mutates the decoder's cross-attention cache, so all methods that
/// run the model take `&mut self`.
pub struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    device: Device,
    size: ModelSize,
    tokenizer: Tokenizer,
    tokens: SpecialTokens,
    mel_filters: Vec<f32>,
}

impl WhisperModel {
    /// Load a Whisper model from HuggingFace.
    ///
    /// Blocking: downloads on first use and memory-maps the weights.
    pub fn load(size: ModelSize, device: Device) -> Result<Self> {
        tracing::info!(
            model = %size,
            repo = size.repo_name(),
            approx_mb = size.size_mb(),
            "Fetching Whisper checkpoint"
        );

        let mut builder = ApiBuilder::new().with_progress(false);
        if let Ok(token) = std::env::var("HF_TOKEN") {
            builder = builder.with_token(Some(token));
        }
        if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
            builder = builder.with_cache_dir(cache_dir.into());
        }
        let api = builder
            .build()
            .map_err(|e| anyhow!("HuggingFace API init failed: {}", e))?;
        let repo = api.model(size.repo_name().to_string());

        let config_path = repo
            .get("config.json")
            .map_err(|e| anyhow!("Failed to download config.json from {}: {}", size.repo_name(), e))?;
        let tokenizer_path = repo
            .get("tokenizer.json")
            .map_err(|e| anyhow!("Failed to download tokenizer.json from {}: {}", size.repo_name(), e))?;
        let weights_path = repo
            .get("model.safetensors")
            .map_err(|e| anyhow!("Failed to download model.safetensors from {}: {}", size.repo_name(), e))?;

        let config: Config = serde_json::from_reader(std::fs::File::open(config_path)?)?;
        tracing::debug!(mel_bins = config.num_mel_bins, "Model config loaded");

        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        let tokens = SpecialTokens::from_tokenizer(&tokenizer)?;

        let mel_filters = mel_filter_bank(
            config.num_mel_bins,
            m::N_FFT,
            m::SAMPLE_RATE as f64,
        );

        // SAFETY: safetensors files are memory-mapped read-only
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        Ok(Self {
            model,
            config,
            device,
            size,
            tokenizer,
            tokens,
            mel_filters,
        })
    }

    /// Transcribe 16 kHz mono PCM.
    pub fn transcribe_pcm(&mut self, pcm: &[f32], language: &str) -> Result<TranscriptionResult> {
        if pcm.is_empty() {
            return Ok(TranscriptionResult {
                text: String::new(),
                segments: Some(Vec::new()),
            });
        }

        let language_token = self.language_token(language)?;
        let prompt = [self.tokens.sot, language_token, self.tokens.transcribe];

        let mel = m::audio::pcm_to_mel(&self.config, pcm, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let total_frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, total_frames), &self.device)?;

        // Frames that carry real audio; the rest is spectrogram padding
        let content_frames = (pcm.len() / m::HOP_LENGTH).min(total_frames);
        let seconds_per_frame = m::HOP_LENGTH as f64 / m::SAMPLE_RATE as f64;

        let mut segments = Vec::new();
        let mut seek = 0;
        while seek < content_frames {
            let window = usize::min(content_frames - seek, m::N_FRAMES);
            let offset = seek as f64 * seconds_per_frame;
            let duration = window as f64 * seconds_per_frame;

            tracing::debug!(offset_secs = offset, duration_secs = duration, "Decoding window");
            let window_mel = mel.narrow(2, seek, window)?;
            let sampled = self.decode_window(&window_mel, &prompt)?;
            segments.extend(self.build_segments(&sampled, offset, duration)?);

            seek += window;
        }

        let text = segments.iter().map(|s| s.text.as_str()).collect::<String>().trim().to_string();
        Ok(TranscriptionResult {
            text,
            segments: Some(segments),
        })
    }

    /// Greedy decoding of one window. Returns sampled tokens with their probabilities.
    fn decode_window(&mut self, mel: &Tensor, prompt: &[u32]) -> Result<Vec<(u32, f32)>> {
        let audio_features = self.model.encoder.forward(mel, true)?;

        let mut tokens = prompt.to_vec();
        let mut sampled: Vec<(u32, f32)> = Vec::new();

        for step in 0..MAX_TOKENS_PER_WINDOW {
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = self.model.decoder.forward(&tokens_t, &audio_features, step == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let mut logits: Vec<f32> = logits.to_dtype(candle_core::DType::F32)?.to_vec1()?;

            let history: Vec<u32> = sampled.iter().map(|(t, _)| *t).collect();
            apply_timestamp_rules(&mut logits, &history, &self.tokens);

            let (next, probability) = argmax_with_probability(&logits)
                .ok_or_else(|| anyhow!("decoder produced no candidates"))?;

            if next == self.tokens.eot {
                break;
            }

            let text_history: Vec<u32> = history
                .iter()
                .copied()
                .filter(|t| !self.tokens.is_timestamp(*t))
                .collect();
            if !self.tokens.is_timestamp(next) && is_repetitive(&text_history, next) {
                tracing::warn!("Repetition detected, cutting window short");
                break;
            }

            tokens.push(next);
            sampled.push((next, probability));
        }

        self.model.reset_kv_cache();
        Ok(sampled)
    }

    fn build_segments(&self, sampled: &[(u32, f32)], offset: f64, duration: f64) -> Result<Vec<Segment>> {
        split_segments(sampled, &self.tokens, offset, duration)
            .into_iter()
            .map(|raw| {
                let text = self
                    .tokenizer
                    .decode(&raw.tokens, true)
                    .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;
                Ok(Segment {
                    start: raw.start,
                    end: raw.end,
                    text,
                    confidence: raw.confidence,
                })
            })
            .filter(|segment: &Result<Segment>| {
                segment.as_ref().map_or(true, |s| !s.text.trim().is_empty())
            })
            .collect()
    }

    fn language_token(&self, language: &str) -> Result<u32> {
        let token = format!("<|{}|>", language.trim().to_lowercase());
        self.tokenizer
            .token_to_id(&token)
            .ok_or_else(|| anyhow!("language '{}' is not supported by this model", language))
    }
}

impl SpeechRecognizer for WhisperModel {
    fn model_name(&self) -> String {
        self.size.to_string()
    }

    fn recognize(&mut self, path: &Path, language: &str) -> Result<TranscriptionResult> {
        let pcm = audio::decode_file(path)?;
        self.transcribe_pcm(&pcm, language)
    }
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow!("token not found in vocabulary: {}", token))
}

/// Mask logits so the sampled sequence stays a well-formed timestamped transcript.
///
/// - special tokens between `<|endoftext|>` and the first timestamp are never sampled
/// - the first sampled token is a timestamp
/// - timestamps come in pairs: after an opening one, text follows; after a closing
///   one, either a new opening timestamp or end of text
/// - timestamps never go backwards
fn apply_timestamp_rules(logits: &mut [f32], history: &[u32], tokens: &SpecialTokens) {
    let eot = tokens.eot as usize;
    let ts_begin = (tokens.timestamp_begin as usize).min(logits.len());

    for logit in logits.iter_mut().take(ts_begin).skip(eot + 1) {
        *logit = f32::NEG_INFINITY;
    }

    let suppress_text = |logits: &mut [f32]| {
        for logit in logits.iter_mut().take(eot) {
            *logit = f32::NEG_INFINITY;
        }
    };
    let suppress_timestamps = |logits: &mut [f32]| {
        for logit in logits.iter_mut().skip(ts_begin) {
            *logit = f32::NEG_INFINITY;
        }
    };

    let Some(&last) = history.last() else {
        suppress_text(logits);
        logits[eot] = f32::NEG_INFINITY;
        return;
    };

    if tokens.is_timestamp(last) {
        let penultimate_was_timestamp =
            history.len() < 2 || tokens.is_timestamp(history[history.len() - 2]);
        if penultimate_was_timestamp {
            suppress_timestamps(logits);
        } else {
            suppress_text(logits);
        }
    }

    if let Some(&last_ts) = history.iter().rev().find(|t| tokens.is_timestamp(**t)) {
        let floor = (last_ts as usize).min(logits.len());
        for logit in logits.iter_mut().take(floor).skip(ts_begin) {
            *logit = f32::NEG_INFINITY;
        }
    }
}

/// Index of the largest logit and its softmax probability.
fn argmax_with_probability(logits: &[f32]) -> Option<(u32, f32)> {
    let (index, &max) = logits
        .iter()
        .enumerate()
        .filter(|(_, l)| l.is_finite())
        .max_by(|a, b| a.1.total_cmp(b.1))?;
    let denominator: f32 = logits.iter().map(|l| (l - max).exp()).sum();
    Some((index as u32, 1.0 / denominator))
}

/// Check if a token sequence has started looping.
fn is_repetitive(tokens: &[u32], new_token: u32) -> bool {
    if tokens.len() < 6 {
        return false;
    }

    if tokens[tokens.len() - 3..] == [new_token, new_token, new_token] {
        return true;
    }

    let last_3 = &tokens[tokens.len() - 3..];
    let prev_3 = &tokens[tokens.len() - 6..tokens.len() - 3];
    last_3 == prev_3
}

#[derive(Debug, PartialEq)]
struct RawSegment {
    start: f64,
    end: f64,
    tokens: Vec<u32>,
    confidence: Option<f64>,
}

/// Cut a window's sampled tokens into segments at timestamp pairs.
///
/// Text left open when the window ends is closed at the end of the window.
fn split_segments(sampled: &[(u32, f32)], tokens: &SpecialTokens, offset: f64, duration: f64) -> Vec<RawSegment> {
    let mut segments = Vec::new();
    let mut start: Option<f64> = None;
    let mut text: Vec<u32> = Vec::new();
    let mut probabilities: Vec<f32> = Vec::new();

    let close = |start: f64, end: f64, text: &mut Vec<u32>, probabilities: &mut Vec<f32>| RawSegment {
        start,
        end: end.max(start),
        tokens: std::mem::take(text),
        confidence: mean(&std::mem::take(probabilities)),
    };

    for &(token, probability) in sampled {
        if tokens.is_timestamp(token) {
            let time = offset + (token - tokens.timestamp_begin) as f64 * TIMESTAMP_STEP;
            match start {
                Some(open) if !text.is_empty() => {
                    segments.push(close(open, time, &mut text, &mut probabilities));
                    start = None;
                }
                _ => start = Some(time),
            }
        } else if token < tokens.eot {
            text.push(token);
            probabilities.push(probability);
        }
    }

    if !text.is_empty() {
        let open = start.unwrap_or(offset);
        segments.push(close(open, offset + duration, &mut text, &mut probabilities));
    }

    segments
}

fn mean(values: &[f32]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().map(|v| *v as f64).sum::<f64>() / values.len() as f64)
}

/// Slaney-style mel filter bank, `n_mels` rows of `n_fft / 2 + 1` weights.
///
/// Same construction as librosa's default (`htk=False`, `norm="slaney"`),
/// which is what Whisper checkpoints were trained against.
pub fn mel_filter_bank(n_mels: usize, n_fft: usize, sample_rate: f64) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|i| i as f64 * sample_rate / n_fft as f64)
        .collect();

    let mel_max = hz_to_mel(sample_rate / 2.0);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_freqs];
    for m in 0..n_mels {
        let (lower, center, upper) = (mel_points[m], mel_points[m + 1], mel_points[m + 2]);
        let norm = 2.0 / (upper - lower);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            let weight = rising.min(falling).max(0.0);
            filters[m * n_freqs + k] = (weight * norm) as f32;
        }
    }
    filters
}

const MEL_F_SP: f64 = 200.0 / 3.0;
const MEL_MIN_LOG_HZ: f64 = 1000.0;
const MEL_MIN_LOG_MEL: f64 = MEL_MIN_LOG_HZ / MEL_F_SP;

fn mel_log_step() -> f64 {
    6.4f64.ln() / 27.0
}

fn hz_to_mel(hz: f64) -> f64 {
    if hz < MEL_MIN_LOG_HZ {
        hz / MEL_F_SP
    } else {
        MEL_MIN_LOG_MEL + (hz / MEL_MIN_LOG_HZ).ln() / mel_log_step()
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel < MEL_MIN_LOG_MEL {
        mel * MEL_F_SP
    } else {
        MEL_MIN_LOG_HZ * ((mel - MEL_MIN_LOG_MEL) * mel_log_step()).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Layout of the multilingual vocabulary around the special tokens
    const TOKENS: SpecialTokens = SpecialTokens {
        sot: 50258,
        eot: 50257,
        transcribe: 50359,
        timestamp_begin: 50364,
    };

    fn ts(seconds: f64) -> u32 {
        TOKENS.timestamp_begin + (seconds / TIMESTAMP_STEP).round() as u32
    }

    #[test]
    fn test_model_size_parsing() {
        assert_eq!("medium".parse::<ModelSize>().unwrap(), ModelSize::Medium);
        assert_eq!("LARGE".parse::<ModelSize>().unwrap(), ModelSize::Large);
        assert_eq!("large-v3".parse::<ModelSize>().unwrap(), ModelSize::LargeV3);
        assert!("huge".parse::<ModelSize>().is_err());
        assert_eq!(ModelSize::LargeV3.to_string(), "large-v3");
    }

    #[test]
    fn test_mel_filter_bank_shape_and_weights() {
        let filters = mel_filter_bank(80, 400, 16_000.0);
        assert_eq!(filters.len(), 80 * 201);
        assert!(filters.iter().all(|w| *w >= 0.0 && w.is_finite()));
        for row in filters.chunks(201) {
            assert!(row.iter().any(|w| *w > 0.0));
        }
    }

    #[test]
    fn test_mel_scale_round_trip() {
        for hz in [0.0, 440.0, 1000.0, 4000.0, 8000.0] {
            assert!((mel_to_hz(hz_to_mel(hz)) - hz).abs() < 1e-6);
        }
    }

    #[test]
    fn test_split_segments_on_timestamp_pairs() {
        let sampled = vec![
            (ts(0.0), 0.9),
            (10, 0.8),
            (11, 0.6),
            (ts(1.2), 0.9),
            (ts(1.2), 0.9),
            (12, 0.5),
            (ts(2.5), 0.9),
        ];
        let segments = split_segments(&sampled, &TOKENS, 30.0, 30.0);

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].tokens, vec![10, 11]);
        assert!((segments[0].start - 30.0).abs() < 1e-9);
        assert!((segments[0].end - 31.2).abs() < 1e-9);
        assert!((segments[0].confidence.unwrap() - 0.7).abs() < 1e-6);
        assert_eq!(segments[1].tokens, vec![12]);
        assert!((segments[1].start - 31.2).abs() < 1e-9);
    }

    #[test]
    fn test_unterminated_segment_closes_at_window_end() {
        let sampled = vec![(ts(4.0), 0.9), (10, 0.5)];
        let segments = split_segments(&sampled, &TOKENS, 0.0, 12.5);
        assert_eq!(segments.len(), 1);
        assert!((segments[0].start - 4.0).abs() < 1e-9);
        assert!((segments[0].end - 12.5).abs() < 1e-9);
    }

    #[test]
    fn test_first_token_must_be_timestamp() {
        let mut logits = vec![0.0f32; TOKENS.timestamp_begin as usize + 100];
        logits[42] = 10.0;
        apply_timestamp_rules(&mut logits, &[], &TOKENS);

        let (token, _) = argmax_with_probability(&logits).unwrap();
        assert!(TOKENS.is_timestamp(token));
    }

    #[test]
    fn test_text_follows_opening_timestamp() {
        let mut logits = vec![0.0f32; TOKENS.timestamp_begin as usize + 100];
        logits[ts(0.5) as usize] = 10.0;
        logits[7] = 1.0;
        apply_timestamp_rules(&mut logits, &[ts(0.0)], &TOKENS);

        let (token, _) = argmax_with_probability(&logits).unwrap();
        assert_eq!(token, 7);
    }

    #[test]
    fn test_timestamps_never_go_backwards() {
        let mut logits = vec![0.0f32; TOKENS.timestamp_begin as usize + 100];
        logits[ts(0.2) as usize] = 10.0;
        logits[ts(1.5) as usize] = 5.0;
        logits[7] = 20.0;
        apply_timestamp_rules(&mut logits, &[ts(0.0), 7, ts(1.0)], &TOKENS);

        // After a closing timestamp only a later timestamp or end of text may follow
        let (token, _) = argmax_with_probability(&logits).unwrap();
        assert_eq!(token, ts(1.5));
    }

    #[test]
    fn test_special_tokens_are_never_sampled() {
        let mut logits = vec![0.0f32; TOKENS.timestamp_begin as usize + 10];
        let no_timestamps = TOKENS.timestamp_begin - 1;
        logits[no_timestamps as usize] = 100.0;
        logits[TOKENS.sot as usize] = 100.0;
        apply_timestamp_rules(&mut logits, &[ts(0.0), 7], &TOKENS);

        let (token, _) = argmax_with_probability(&logits).unwrap();
        assert_ne!(token, no_timestamps);
        assert_ne!(token, TOKENS.sot);
    }

    #[test]
    fn test_argmax_probability_is_softmax() {
        let (index, probability) = argmax_with_probability(&[0.0, 0.0]).unwrap();
        assert!(index < 2);
        assert!((probability - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_is_repetitive() {
        assert!(!is_repetitive(&[1, 2, 3], 3));
        assert!(is_repetitive(&[1, 2, 3, 4, 4, 4], 4));
        assert!(is_repetitive(&[9, 1, 2, 3, 1, 2, 3], 8));
        assert!(!is_repetitive(&[1, 2, 3, 4, 5, 6], 7));
    }
}
