//! # Transcription Module
//!
//! Speech-to-text using Whisper models via the Candle framework.
//!
//! ## Key Components:
//! - **Types**: [`TranscriptionResult`] and [`Segment`], shared with the HTTP wire format
//! - **Engine**: the single-flight adapter every caller goes through
//! - **Model**: Whisper checkpoint loading and timestamped decoding
//! - **Audio**: media file decoding to 16 kHz mono PCM
//!
//! ## Whisper Model Sizes:
//! - **tiny** / **base**: fast, fine for testing
//! - **small**: balanced
//! - **medium**: the default, good with Ukrainian and technical vocabulary
//! - **large** / **large-v3**: best accuracy, wants a GPU

pub mod audio;
pub mod engine;
pub mod model;
mod types;

pub use engine::{SpeechRecognizer, TranscriptionEngine};
pub use model::ModelSize;
pub use types::{Segment, TranscriptionResult};
