//! Backend response relay.
//!
//! Streams the backend's response body and trailers to the caller unchanged
//! and owns the call from then on. It finishes the call when the backend
//! stream ends, synthesizes trailers when the gateway has to end it (deadline,
//! backend failure before any data), and records a cancellation if the
//! caller goes away first.

use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use http_body::{Body as HttpBody, Frame};
use hyper::body::Incoming;
use tokio::time::{sleep_until, Sleep};

use crate::backend::StreamLease;
use crate::call::body::BoxError;
use crate::call::context::CallContext;
use crate::call::state::CallState;
use crate::error::GatewayError;
use crate::grpc::mapper::error_status;
use crate::grpc::{Code, Status};

#[derive(Debug)]
pub struct RelayBody {
    inner: Option<Incoming>,
    call: Option<CallContext>,
    lease: Option<StreamLease>,
    deadline: Pin<Box<Sleep>>,
    /// Status from the response headers, for trailers-only replies.
    header_code: Option<Code>,
    trailer_code: Option<Code>,
    delivered: bool,
    done: bool,
}

impl RelayBody {
    pub fn new(inner: Incoming, call: CallContext, lease: StreamLease, header_code: Option<Code>) -> Self {
        let deadline = Box::pin(sleep_until(call.deadline()));
        Self {
            inner: Some(inner),
            call: Some(call),
            lease: Some(lease),
            deadline,
            header_code,
            trailer_code: None,
            delivered: false,
            done: false,
        }
    }

    fn finish(&mut self, state: CallState, code: Code) {
        self.done = true;
        self.inner = None;
        self.lease = None;
        if let Some(call) = self.call.take() {
            call.finish(state, code);
        }
    }

    /// End the caller stream with a gateway status in a trailers frame.
    fn terminate(&mut self, status: Status) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        self.finish(CallState::Failed, status.code());
        Poll::Ready(Some(Ok(Frame::trailers(status.to_header_map()))))
    }

    fn call_id(&self) -> String {
        self.call.as_ref().map(|c| c.id().to_string()).unwrap_or_default()
    }
}

impl HttpBody for RelayBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if this.deadline.as_mut().poll(cx).is_ready() {
            tracing::debug!(call_id = %this.call_id(), "Deadline reached while streaming response");
            return this.terminate(error_status(&GatewayError::DeadlineExceeded));
        }

        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match ready!(Pin::new(inner).poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.delivered = true;
                    if let Some(call) = &this.call {
                        call.counters().add_out(data.len());
                    }
                } else if let Some(trailers) = frame.trailers_ref() {
                    this.trailer_code = Status::from_header_map(trailers).map(|s| s.code());
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(e)) => {
                let malformed = this.call.as_ref().is_some_and(|c| c.counters().is_malformed());
                tracing::debug!(
                    call_id = %this.call_id(),
                    error = %e,
                    malformed,
                    delivered = this.delivered,
                    "Backend stream failed"
                );
                if malformed {
                    this.terminate(error_status(&GatewayError::Malformed(
                        "malformed message in request stream".to_string(),
                    )))
                } else if !this.delivered {
                    if let Some(lease) = &this.lease {
                        if !lease.connection().is_healthy() {
                            tracing::debug!(connection_id = lease.connection().id(), "Backend connection lost");
                        }
                    }
                    let backend = this
                        .call
                        .as_ref()
                        .and_then(|c| c.backend())
                        .map(|b| b.backend.clone())
                        .unwrap_or_default();
                    this.terminate(error_status(&GatewayError::BackendStream {
                        backend,
                        reason: e.to_string(),
                    }))
                } else {
                    // Data already reached the caller; propagate the reset.
                    this.finish(CallState::Failed, Code::Unavailable);
                    Poll::Ready(Some(Err(Box::new(e))))
                }
            }
            None => {
                let code = this.trailer_code.or(this.header_code).unwrap_or(Code::Unknown);
                this.finish(CallState::Completed, code);
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done || self.inner.as_ref().is_some_and(|inner| inner.is_end_stream())
    }
}

impl Drop for RelayBody {
    fn drop(&mut self) {
        let Some(call) = self.call.take() else {
            return;
        };
        // A trailers-only reply is sent from the headers alone and never polled.
        if self.inner.as_ref().is_some_and(|inner| inner.is_end_stream()) {
            call.finish(CallState::Completed, self.header_code.unwrap_or(Code::Unknown));
        } else {
            call.finish(CallState::Failed, Code::Cancelled);
        }
    }
}
