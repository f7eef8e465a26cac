//! Caller request body with a validated first message.
//!
//! The front end reads only until the first message header is known, then
//! hands the chunks it already read to the backend ahead of the rest of the
//! stream. Every later chunk is still run through the frame decoder as it
//! passes; a framing fault aborts the forwarded stream.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use axum::body::Body;
use bytes::Bytes;
use http_body::{Body as HttpBody, Frame};
use http_body_util::BodyExt;
use thiserror::Error;

use crate::call::context::CallCounters;
use crate::grpc::framing::{FrameDecoder, FrameError};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Why the first message could not be read.
#[derive(Debug, Error)]
pub enum PeekError {
    #[error(transparent)]
    Malformed(#[from] FrameError),
    #[error("caller stream failed: {0}")]
    Caller(axum::Error),
}

/// Caller body: replayed prefix followed by the live remainder.
#[derive(Debug)]
pub struct CallBody {
    buffered: VecDeque<Frame<Bytes>>,
    inner: Option<Body>,
    decoder: FrameDecoder,
    counters: Arc<CallCounters>,
}

impl CallBody {
    /// Read `body` until the first message header has been seen (or the
    /// stream ends) and validate it.
    pub async fn peek(
        mut body: Body,
        max_message_len: usize,
        counters: Arc<CallCounters>,
    ) -> Result<CallBody, PeekError> {
        let mut decoder = FrameDecoder::new(max_message_len);
        let mut buffered = VecDeque::new();
        let mut ended = false;

        while decoder.first_message_len().is_none() {
            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        counters.add_in(data.len());
                        decoder.feed(data)?;
                    }
                    buffered.push_back(frame);
                }
                Some(Err(e)) => return Err(PeekError::Caller(e)),
                None => {
                    decoder.finish()?;
                    ended = true;
                    break;
                }
            }
        }

        Ok(CallBody {
            buffered,
            inner: (!ended).then_some(body),
            decoder,
            counters,
        })
    }

    /// Length prefix of the first message, if the call carried one.
    pub fn declared_size(&self) -> Option<u32> {
        self.decoder.first_message_len()
    }

    fn fail(&mut self, err: BoxError) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        self.inner = None;
        Poll::Ready(Some(Err(err)))
    }
}

impl HttpBody for CallBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if let Some(frame) = this.buffered.pop_front() {
            return Poll::Ready(Some(Ok(frame)));
        }
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match ready!(Pin::new(inner).poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.counters.add_in(data.len());
                    if let Err(e) = this.decoder.feed(data) {
                        this.counters.mark_malformed();
                        return this.fail(Box::new(e));
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(e)) => this.fail(Box::new(e)),
            None => {
                this.inner = None;
                if let Err(e) = this.decoder.finish() {
                    this.counters.mark_malformed();
                    return Poll::Ready(Some(Err(Box::new(e))));
                }
                tracing::trace!(messages = this.decoder.messages_seen(), "Request stream ended");
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.buffered.is_empty() && self.inner.is_none()
    }
}
