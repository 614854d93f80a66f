//! An L1 transport that resends requests which failed to reach the node.
//!
//! Only transport failures are resent. A JSON-RPC error response, such as
//! a reverted call, comes back as a response and is left to the caller.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use alloy::{
    rpc::{
        client::{ClientBuilder, RpcClient},
        json_rpc::{RequestPacket, ResponsePacket},
    },
    transports::{http::ReqwestTransport, TransportError},
};
use tower::{Layer, Service};
use tracing::debug;

/// Capped exponential backoff between resends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_retries: u32,
}

impl Backoff {
    /// Delay before resend number `retry`, counting from zero.
    pub fn delay(&self, retry: u32) -> Duration {
        self.initial
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max)
    }
}

/// Wraps a transport in a [`RetryTransport`].
pub struct RetryLayer(Backoff);

impl<S> Layer<S> for RetryLayer {
    type Service = RetryTransport<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryTransport {
            inner,
            backoff: self.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetryTransport<S> {
    inner: S,
    backoff: Backoff,
}

impl<S> Service<RequestPacket> for RetryTransport<S>
where
    S: Service<RequestPacket, Response = ResponsePacket, Error = TransportError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = ResponsePacket;
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<ResponsePacket, TransportError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: RequestPacket) -> Self::Future {
        // The instance polled ready serves this request. The clone stays for
        // the next one.
        let fresh = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, fresh);
        let backoff = self.backoff;

        Box::pin(async move {
            let mut retry = 0;
            loop {
                match inner.call(request.clone()).await {
                    Err(error) if retry < backoff.max_retries => {
                        let delay = backoff.delay(retry);
                        debug!(%error, retry, ?delay, "l1 request failed, resending");
                        tokio::time::sleep(delay).await;
                        retry += 1;
                    }
                    result => return result,
                }
            }
        })
    }
}

/// An HTTP JSON-RPC client for `rpc_url` whose requests are resent with
/// `backoff`.
pub fn build_http_retry_client(
    rpc_url: url::Url,
    backoff: Backoff,
) -> RpcClient<RetryTransport<ReqwestTransport>> {
    ClientBuilder::default()
        .layer(RetryLayer(backoff))
        .http(rpc_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            max_retries: 10,
        };
        let delays: Vec<_> = (0..6).map(|retry| backoff.delay(retry).as_millis()).collect();
        assert_eq!(delays, [100, 200, 400, 800, 1000, 1000]);
        assert_eq!(backoff.delay(40), Duration::from_secs(1));
    }
}
