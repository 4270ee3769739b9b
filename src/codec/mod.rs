//! Codec module - structured payloads for dispatch handlers.
//!
//! Dispatch payloads are opaque bytes on the wire. Workers that exchange
//! structured data usually carry JSON; [`JsonCodec`] covers that case.
//!
//! # Example
//!
//! ```
//! use ygg_worker::codec::JsonCodec;
//!
//! let encoded = JsonCodec::encode(&vec![1, 2, 3]).unwrap();
//! let decoded: Vec<i32> = JsonCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, vec![1, 2, 3]);
//! ```

mod json;

pub use json::JsonCodec;
