//! MetaTrader terminal wire protocol.
//!
//! The EA running inside MT5 connects over TCP and exchanges newline-delimited
//! JSON objects with the bridge.

pub mod codec;
pub mod protocol;

pub use codec::{encode_response, CodecError, LineDecoder, DEFAULT_MAX_LINE_BYTES};
pub use protocol::{parse_envelope, Action, Envelope, Response};
