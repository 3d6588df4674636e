//! Streamed RPC: many requests and/or responses per invocation.
//!
//! Shares the correlation-id mechanism with classical RPC but runs in its own
//! protocol version namespace, with all framing metadata carried in the
//! `__stream` user property.  Frames are delivered in receipt order; the
//! intended index is carried but never enforced.

pub mod executor;
pub mod invoker;

pub use executor::{StreamExecutor, StreamExecutorOptions, StreamOutput, StreamRequest};
pub use invoker::{
    ResponseStream, StreamInvokeOptions, StreamInvoker, StreamInvokerOptions, StreamResponse,
};

use crate::meta::{InboundMeta, RemoteFailure};
use mqrt_protocol::StreamFrame;

/// Per-stream lifecycle, tracked identically on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamPhase {
    Idle,
    Active,
    Cancelling,
    Expiring,
    Terminal,
}

impl StreamPhase {
    pub fn first_frame(self) -> StreamPhase {
        match self {
            StreamPhase::Idle => StreamPhase::Active,
            other => other,
        }
    }

    pub fn cancel(self) -> StreamPhase {
        match self {
            StreamPhase::Idle | StreamPhase::Active | StreamPhase::Cancelling => {
                StreamPhase::Cancelling
            }
            other => other,
        }
    }

    pub fn expire(self) -> StreamPhase {
        match self {
            StreamPhase::Terminal => StreamPhase::Terminal,
            _ => StreamPhase::Expiring,
        }
    }

    pub fn finish(self) -> StreamPhase {
        StreamPhase::Terminal
    }
}

/// Shape of an inbound stream frame once demarshalled.
#[derive(Debug)]
pub(crate) enum FrameKind {
    /// `(0, true, true)`: the other side wants the stream stopped.
    Cancel,
    /// Final frame carrying an error code.
    Failure(RemoteFailure),
    /// Payload-bearing frame.
    Data(StreamFrame),
    /// Empty closing frame.
    Terminator(StreamFrame),
}

/// Classify a frame, or `None` when the message carries no `__stream`
/// property at all.
pub(crate) fn classify(meta: &InboundMeta, payload_empty: bool) -> Option<FrameKind> {
    let frame = meta.stream?;
    if frame.cancel {
        return Some(FrameKind::Cancel);
    }
    if let Some(failure) = &meta.failure {
        return Some(FrameKind::Failure(failure.clone()));
    }
    if payload_empty && frame.is_last {
        return Some(FrameKind::Terminator(frame));
    }
    Some(FrameKind::Data(frame))
}
