//! # molt-stream
//!
//! The upstream side of the gateway:
//!
//! - [`frame`]: incremental `event:` / `data:` frame parser
//! - [`upstream`]: the [`EventSource`] seam and its HTTP implementation

#![deny(unsafe_code)]

pub mod frame;
pub mod upstream;

pub use frame::{DEFAULT_EVENT, Frame, FrameParser, MAX_FRAME_LEN, parse_frame};
pub use upstream::{ByteStream, EventSource, HttpEventSource, UpstreamError};
