use super::types::{
    AccountInfoResponse, RpcRequest, RpcResponse, SignatureInfo, TransactionResponse,
};
use crate::clock::Clock;
use crate::error::{Result, SentinelError};
use crate::metrics::Metrics;
use crate::retry::{Retry, RetryPolicy};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_MAX_RETRIES: u32 = 3;
const RETRY_UNIT: Duration = Duration::from_millis(400);
const DEFAULT_SIGNATURE_LIMIT: usize = 100;
const MAX_SIGNATURE_LIMIT: usize = 1000;

/// JSON-RPC client for a Solana HTTP endpoint.
///
/// Transport failures and 5xx responses are retried with linear backoff; an
/// `error` object in the response is returned as `RemoteRejection` at once.
#[derive(Clone)]
pub struct RpcClient {
    url: String,
    http: reqwest::Client,
    retry: RetryPolicy,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<Arc<Metrics>>,
}

impl RpcClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            url: url.into(),
            http,
            retry: RetryPolicy::linear(DEFAULT_MAX_RETRIES, RETRY_UNIT),
            clock: None,
            metrics: None,
        })
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Issue `method` with `params` and decode the `result` field into `T`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let body = serde_json::to_vec(&RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params: &params,
        })?;

        let mut retry = Retry::new(self.retry.clone()).with_cancel(cancel.clone());
        if let Some(clock) = &self.clock {
            retry = retry.with_clock(clock.clone());
        }

        let outcome = retry
            .run(|attempt| {
                let body = body.clone();
                async move {
                    if attempt > 0 {
                        debug!("Retrying {} (attempt {})", method, attempt + 1);
                    }
                    self.send_once(method, body).await
                }
            })
            .await;

        if let Some(metrics) = &self.metrics {
            if !matches!(outcome, Err(SentinelError::Cancelled)) {
                metrics.record_rpc_call(outcome.is_err());
            }
        }

        let result = outcome?;
        serde_json::from_value(result).map_err(|e| {
            SentinelError::Protocol(format!("unexpected {} result shape: {}", method, e))
        })
    }

    async fn send_once(&self, method: &str, body: Vec<u8>) -> Result<Value> {
        let response = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| SentinelError::Transport(format!("{} request failed: {}", method, e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SentinelError::Transport(format!("rpc server {}", status)));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SentinelError::Transport(format!("{} body read failed: {}", method, e)))?;

        let envelope: RpcResponse = serde_json::from_slice(&bytes).map_err(|e| {
            SentinelError::Protocol(format!("invalid {} response (HTTP {}): {}", method, status, e))
        })?;

        if let Some(error) = envelope.error {
            return Err(SentinelError::RemoteRejection {
                code: error.code,
                message: error.message,
            });
        }

        Ok(envelope.result.unwrap_or(Value::Null))
    }

    pub async fn get_slot(&self, cancel: &CancellationToken) -> Result<u64> {
        self.call("getSlot", json!([]), cancel).await
    }

    /// Latest signatures touching `address`, newest first.
    ///
    /// `limit` outside `1..=1000` falls back to 100.
    pub async fn get_signatures_for_address(
        &self,
        address: &str,
        limit: usize,
        before: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SignatureInfo>> {
        let limit = if limit == 0 || limit > MAX_SIGNATURE_LIMIT {
            DEFAULT_SIGNATURE_LIMIT
        } else {
            limit
        };

        let mut options = json!({ "limit": limit });
        if let Some(before) = before.filter(|b| !b.is_empty()) {
            options["before"] = Value::String(before.to_string());
        }

        self.call("getSignaturesForAddress", json!([address, options]), cancel)
            .await
    }

    /// `None` when the node does not know the signature.
    pub async fn get_transaction(
        &self,
        signature: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<TransactionResponse>> {
        let params = json!([
            signature,
            {
                "encoding": "jsonParsed",
                "maxSupportedTransactionVersion": 0,
                "commitment": "confirmed",
            }
        ]);
        self.call("getTransaction", params, cancel).await
    }

    pub async fn get_account_info(
        &self,
        address: &str,
        cancel: &CancellationToken,
    ) -> Result<AccountInfoResponse> {
        let params = json!([
            address,
            {
                "encoding": "jsonParsed",
                "commitment": "confirmed",
            }
        ]);
        self.call("getAccountInfo", params, cancel).await
    }

    /// Quick liveness check
    pub async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        self.get_slot(cancel).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Minimal HTTP responder: one canned `(status, body)` per connection.
    async fn spawn_server(responses: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            let mut responses = responses.into_iter();
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                read_request(&mut socket).await;
                let (status, body) = responses.next().unwrap_or((500, "{}"));
                let reply = format!(
                    "HTTP/1.1 {} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}", addr), hits)
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let lower = line.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .and_then(|v| v.trim().parse::<usize>().ok())
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    return text;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    fn fast_client(url: &str) -> RpcClient {
        RpcClient::new(url)
            .unwrap()
            .with_retry_policy(RetryPolicy::linear(3, Duration::from_millis(5)))
    }

    #[tokio::test]
    async fn test_call_decodes_result() {
        let (url, hits) = spawn_server(vec![(200, r#"{"jsonrpc":"2.0","id":1,"result":4242}"#)]).await;
        let client = fast_client(&url);

        let slot = client.get_slot(&CancellationToken::new()).await.unwrap();

        assert_eq!(slot, 4242);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let (url, hits) = spawn_server(vec![
            (503, "unavailable"),
            (502, "bad gateway"),
            (200, r#"{"jsonrpc":"2.0","id":1,"result":7}"#),
        ])
        .await;
        let metrics = Metrics::shared();
        let client = fast_client(&url).with_metrics(metrics.clone());

        let slot = client.get_slot(&CancellationToken::new()).await.unwrap();

        assert_eq!(slot, 7);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.snapshot().rpc_failures, 0);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let (url, hits) = spawn_server(vec![(500, "x"), (500, "x"), (500, "x"), (500, "x"), (500, "x")]).await;
        let client = fast_client(&url);

        let result = client.get_slot(&CancellationToken::new()).await;

        assert!(matches!(result, Err(SentinelError::Transport(_))));
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_error_object_is_terminal() {
        let (url, hits) = spawn_server(vec![(
            200,
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"Invalid param: WrongSize"}}"#,
        )])
        .await;
        let client = fast_client(&url);

        let result = client
            .get_signatures_for_address("bad", 10, None, &CancellationToken::new())
            .await;

        match result {
            Err(SentinelError::RemoteRejection { code, message }) => {
                assert_eq!(code, -32602);
                assert!(message.contains("WrongSize"));
            }
            other => panic!("expected remote rejection, got {:?}", other),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_null_transaction_is_none() {
        let (url, _) = spawn_server(vec![(200, r#"{"jsonrpc":"2.0","id":1,"result":null}"#)]).await;
        let client = fast_client(&url);

        let tx = client
            .get_transaction("unknown", &CancellationToken::new())
            .await
            .unwrap();

        assert!(tx.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_abandons_in_flight_call() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = fast_client(&format!("http://{}", addr));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(2), client.get_slot(&cancel))
            .await
            .expect("cancellation should return promptly");

        assert!(matches!(result, Err(SentinelError::Cancelled)));
    }
}
