//! The unit of work.
//!
//! A `Message` is built by the producer, encoded once at enqueue time, and
//! owned by the backend until a processor reserves it. After encoding the
//! `body` is authoritative; `args` is a convenience kept for in-process
//! queues and tests.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{self, ArgValue, Codec};
use crate::error::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    /// Backend-assigned opaque identifier. Empty before enqueue.
    pub id: String,

    /// Optional logical identity. When set, enqueues are deduplicated per
    /// `(queue, name)` within the dedup period.
    pub name: Option<String>,

    /// Ordered handler arguments.
    pub args: Vec<ArgValue>,

    /// Encoded `args`. Authoritative once non-empty.
    pub body: Vec<u8>,

    /// Whether `body` is gzip-compressed. Carried out-of-band.
    pub compressed: bool,

    /// Minimum time from enqueue before a consumer may observe the message.
    pub delay: Duration,

    /// Backend lease token for the current reservation.
    pub reservation_id: String,

    /// How many times the backend has handed this message out. At least 1
    /// while in flight.
    pub reserved_count: u32,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_args(args: Vec<ArgValue>) -> Self {
        Self {
            args,
            ..Self::default()
        }
    }

    /// Append a handler argument.
    pub fn arg(mut self, value: impl Into<ArgValue>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Encode `args` into `body` unless a body is already present.
    ///
    /// Re-adding a released message must not re-encode: the body a consumer
    /// saw is the body it keeps seeing.
    pub(crate) fn ensure_encoded(&mut self, codec: Codec, compress: bool) -> Result<(), Error> {
        if !self.body.is_empty() {
            return Ok(());
        }
        let body = codec.encode(&self.args)?;
        self.body = if compress {
            self.compressed = true;
            codec::compress(&body)?
        } else {
            body
        };
        Ok(())
    }

    /// Decode `body` back into positional args.
    pub(crate) fn decode_args(&self, codec: Codec) -> Result<Vec<ArgValue>, Error> {
        if self.compressed {
            let body = codec::decompress(&self.body)?;
            codec.decode(&body)
        } else {
            codec.decode(&self.body)
        }
    }
}
