//! Camera image streaming over websocket.

pub mod stream;

pub use stream::{FrameKind, GallerySnapshot, ImageFrame, ImageStreamClient, ImageStreamError};
