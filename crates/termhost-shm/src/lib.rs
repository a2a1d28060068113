//! termhost-shm: zero-copy output transport for termhost.
//!
//! PTY output leaves the host as length-prefixed packets written into ring
//! buffers that live in shared memory. The consumer (the renderer side) maps
//! the same region and drains it independently.
//!
//! # Architecture
//!
//! - [`framer`]: Encodes `(session id, payload)` pairs into self-delimiting frames.
//! - [`RingBuffer`]: Single-writer / single-reader byte ring over a memory map,
//!   coordinated only by atomic cursors in the region header.
//! - [`DataChannels`]: The visual and analysis rings currently attached to the host.

pub mod channels;
pub mod framer;
pub mod ring;

pub use channels::{Channel, DataChannels};
pub use framer::{frame, unframe, FrameError, Packet, MAX_ID_LEN, MAX_PAYLOAD_LEN};
pub use ring::{RingBuffer, RingError, HEADER_LEN};
