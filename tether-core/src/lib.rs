//! Tether Core
//!
//! This crate contains the runtime-agnostic kernel of the tether IPC
//! framework:
//! - Transport contract plus stdio / Unix-socket / named-pipe impls
//!   (`transport`, `uds`, `pipe`)
//! - Chunked read buffer and frame codecs (`buffer`, `framing`)
//! - Dynamic payload values and serialization codecs (`value`, `codec`)
//! - Backoff, cancellation, and endpoint naming (`backoff`, `cancel`,
//!   `socket_path`)
//! - Error taxonomy (`error`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod backoff;
pub mod buffer;
pub mod cancel;
pub mod codec;
pub mod error;
pub mod framing;
pub mod socket_path;
pub mod transport;
pub mod value;

#[cfg(unix)]
pub mod uds;

#[cfg(windows)]
pub mod pipe;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::backoff::{Backoff, BackoffState};
    pub use crate::cancel::CancelToken;
    pub use crate::codec::{default_registry, Codec, CodecRegistry, JsonCodec};
    pub use crate::error::{Error, Result, SupervisorKind, TimeoutKind};
    pub use crate::framing::Framing;
    pub use crate::transport::{Transport, TransportEvent, TransportState};
    pub use crate::value::{from_value, to_value, Value};
}
