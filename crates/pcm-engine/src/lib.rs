pub mod config;
pub mod cpal_sink;
pub mod error;
pub mod frame_buffer;
pub mod handle;
pub mod negotiate;
pub mod pcm;
pub mod producer;
pub mod scheduler;
pub mod session;
pub mod sim;
pub mod stats;

pub use config::{EngineConfig, FormatSpec, UnderrunPolicy};
pub use error::{EngineError, Stage};
pub use negotiate::{NegotiatedParams, open_and_configure};
pub use scheduler::{Scheduler, SchedulerOptions, StopReason, StopSignal};
