// Framewise - Library Entry Point
//
// Two subsystems: the media pipeline that turns images, videos and live
// camera sources into a small set of distinct frames, and the timeline that
// stores analyzed events with their key frames.

pub mod config;
pub mod constants;
pub mod error;
pub mod jobs;
pub mod media;
pub mod timeline;
pub mod tools;

pub use config::Settings;
pub use error::{FramewiseError, Result};
pub use media::pipeline::{IngestOptions, IngestOutput, MediaInput, MediaPipeline};
pub use media::EncodedFrame;
pub use timeline::schema::Event;
pub use timeline::time::TimeInput;
pub use timeline::{EventFilter, EventUpdate, NewEvent, Timeline};
