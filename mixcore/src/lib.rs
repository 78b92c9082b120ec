pub mod cache;
pub mod engine;
pub mod error;
pub mod format;
pub mod mixer;
pub mod resampler;
pub mod sample;
pub mod sink;
pub mod stream;

pub use self::cache::{Cache, CacheMode, InputCallback};
pub use self::engine::{Engine, EngineConfig, StreamId, StreamTable};
pub use self::error::{CacheError, CacheResult, EngineError, EngineResult, StreamError, StreamResult};
pub use self::format::FormatDescriptor;
pub use self::mixer::Mixer;
pub use self::resampler::{PassthroughResampler, Resampler};
pub use self::sample::{Sample, VOLUME_MAX};
pub use self::sink::{RingSink, Sink};
#[cfg(feature = "cpal-sink")]
pub use self::sink::CpalSink;
pub use self::stream::{
    CacheReadiness, EventCallback, PlayState, Stream, StatusKey, StatusValue, StreamEvent,
};
