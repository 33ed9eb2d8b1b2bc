#![deny(warnings)]

pub mod assemble;
pub mod cache;
pub mod config;
pub mod fingerprint;
pub mod pipeline;
pub mod tts;
pub mod util;
