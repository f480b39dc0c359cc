//! Subforge - resumable multi-language subtitle pipeline
//!
//! Transcribes a video, translates the transcript into every configured
//! language through an isolated worker process, and muxes all subtitle
//! tracks back into the container. Every stage leaves a checkpoint next to
//! the video so an interrupted run picks up where it stopped.

pub mod cli;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod media;
pub mod models;
pub mod process;
pub mod quality;
pub mod resume;
pub mod subtitle;
pub mod transcribe;
pub mod translate;
pub mod worker;
pub mod workflow;
