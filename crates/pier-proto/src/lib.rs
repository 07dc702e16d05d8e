//! Protocol primitives shared by the pier server, client and local runner.
//!
//! Everything in here is transport agnostic: the key decoder and the control codec work
//! on plain byte/character slices, and the banner stage only decides what to prepend to
//! a chunk before it reaches whichever writer owns the stream.

pub mod banner;
pub mod control;
pub mod keys;

pub use banner::{BannerOutput, BannerSource, BannerStage, BannerState, BannerWriter, SharedBanner};
pub use control::{
    decode, encode, is_control_frame, ControlDecoder, ControlFrame, Decoded, ProtocolError,
};
pub use keys::KeyEvent;
