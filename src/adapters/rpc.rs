use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::events::SettlementPush;
use super::traits::*;
use crate::error::AdapterError;

/// JSON-RPC client configuration
#[derive(Debug, Clone)]
pub struct RpcAdapterConfig {
    pub rpc_url: String,
    pub stream_url: Option<String>,
    pub timeout: Duration,
    pub reconnect_backoff: Duration,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct StatusResult {
    #[serde(alias = "status")]
    state: String,
}

#[derive(Debug, Serialize)]
struct WithdrawalParams<'a> {
    withdrawal_id: String,
    asset: &'a str,
    amount: String,
    to_address: &'a str,
}

/// Settlement adapter speaking JSON-RPC 2.0 over HTTP, with settlement
/// pushes read from a newline-delimited JSON stream.
pub struct RpcSettlementAdapter {
    client: Client,
    config: RpcAdapterConfig,
    next_id: AtomicU64,
}

impl RpcSettlementAdapter {
    pub fn new(config: RpcAdapterConfig) -> Self {
        Self {
            client: Client::new(),
            config,
            next_id: AtomicU64::new(1),
        }
    }

    async fn call<P, R>(&self, method: &str, params: P) -> AdapterResult<R>
    where
        P: Serialize + Send,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!(method = %method, id, "Settlement RPC call");

        let response = self
            .client
            .post(&self.config.rpc_url)
            .timeout(self.config.timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AdapterError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let decoded: RpcResponse<R> = response
            .json()
            .await
            .map_err(|e| AdapterError::InvalidResponse(e.to_string()))?;

        if let Some(error) = decoded.error {
            return Err(AdapterError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        decoded
            .result
            .ok_or_else(|| AdapterError::InvalidResponse(format!("{} returned no result", method)))
    }
}

#[async_trait]
impl SettlementAdapter for RpcSettlementAdapter {
    fn name(&self) -> &'static str {
        "rpc"
    }

    async fn create_invoice(&self, request: InvoiceRequest) -> AdapterResult<CreatedInvoice> {
        self.call("invoice.create", &request).await
    }

    async fn get_invoice_status(&self, invoice: &str) -> AdapterResult<ObservedInvoiceState> {
        let result: StatusResult = self
            .call("invoice.status", json!({ "invoice": invoice }))
            .await?;
        Ok(ObservedInvoiceState::parse(&result.state))
    }

    async fn subscribe_settlements(
        &self,
        listener: Arc<dyn SettlementListener>,
    ) -> AdapterResult<SubscriptionHandle> {
        let stream_url = self
            .config
            .stream_url
            .clone()
            .ok_or_else(|| AdapterError::Transport("no settlement stream url configured".into()))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_stream(
            self.client.clone(),
            stream_url,
            self.config.reconnect_backoff,
            listener,
            shutdown_rx,
        ));

        Ok(SubscriptionHandle::new(shutdown_tx, task))
    }

    async fn execute_withdrawal(
        &self,
        request: WithdrawalRequest,
    ) -> AdapterResult<WithdrawalReceipt> {
        let params = WithdrawalParams {
            withdrawal_id: request.withdrawal_id.to_string(),
            asset: &request.asset,
            amount: request.amount.to_string(),
            to_address: &request.to_address,
        };
        self.call("withdrawal.execute", params).await
    }
}

/// Reads the push stream until shutdown, reconnecting after every
/// disconnect with a fixed backoff.
async fn run_stream(
    client: Client,
    url: String,
    backoff: Duration,
    listener: Arc<dyn SettlementListener>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            result = read_stream(&client, &url, listener.as_ref()) => {
                let error = match result {
                    Ok(()) => AdapterError::SubscriptionClosed,
                    Err(e) => e,
                };
                warn!(url = %url, "Settlement stream disconnected: {}", error);
                listener.on_error(error);
            }
            _ = shutdown.changed() => break,
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => break,
        }
    }

    info!(url = %url, "Settlement stream closed");
}

async fn read_stream(
    client: &Client,
    url: &str,
    listener: &dyn SettlementListener,
) -> Result<(), AdapterError> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(AdapterError::Http {
            status: status.as_u16(),
            message: format!("stream request to {} rejected", url),
        });
    }

    info!(url = %url, "Settlement stream connected");

    let mut buffer: Vec<u8> = Vec::new();
    let mut chunks = response.bytes_stream();

    while let Some(chunk) = chunks.next().await {
        buffer.extend_from_slice(&chunk?);

        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if !line.is_empty() {
                SettlementPush::from_line(line).dispatch(listener);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::error::FailureClass;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use uuid::Uuid;

    /// Serves a single canned HTTP response, after reading the full request
    async fn serve_once(status_line: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\nconnection: close\r\n\r\n{}",
                status_line, body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });

        format!("http://{}", addr)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..header_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        request.len() >= header_end + 4 + content_length
    }

    fn adapter(url: String) -> RpcSettlementAdapter {
        RpcSettlementAdapter::new(RpcAdapterConfig {
            rpc_url: url.clone(),
            stream_url: Some(url),
            timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_millis(50),
        })
    }

    #[tokio::test]
    async fn test_invoice_status_result() {
        let url = serve_once(
            "200 OK",
            r#"{"jsonrpc":"2.0","id":1,"result":{"state":"SETTLED"}}"#.to_string(),
        )
        .await;

        let state = adapter(url).get_invoice_status("inv-1").await.unwrap();
        assert_eq!(state, ObservedInvoiceState::Settled);
    }

    #[tokio::test]
    async fn test_rpc_error_is_terminal() {
        let url = serve_once(
            "200 OK",
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"no such method"}}"#
                .to_string(),
        )
        .await;

        let err = adapter(url).get_invoice_status("inv-1").await.unwrap_err();
        assert_eq!(
            err,
            AdapterError::Rpc {
                code: -32601,
                message: "no such method".into()
            }
        );
        assert_eq!(err.failure_class(), FailureClass::Terminal);
    }

    #[tokio::test]
    async fn test_http_503_is_transient() {
        let url = serve_once("503 Service Unavailable", "overloaded".to_string()).await;

        let request = WithdrawalRequest {
            withdrawal_id: Uuid::new_v4(),
            asset: "USDI".into(),
            amount: Amount::parse("1.5").unwrap(),
            to_address: "addr".into(),
        };
        let err = adapter(url).execute_withdrawal(request).await.unwrap_err();
        assert!(matches!(err, AdapterError::Http { status: 503, .. }));
        assert_eq!(err.failure_class(), FailureClass::Transient);
    }

    #[derive(Default)]
    struct Collector {
        settled: Mutex<Vec<String>>,
        errors: Mutex<Vec<AdapterError>>,
    }

    impl SettlementListener for Collector {
        fn on_settled(&self, invoice: String) {
            self.settled.lock().push(invoice);
        }

        fn on_error(&self, error: AdapterError) {
            self.errors.lock().push(error);
        }
    }

    #[tokio::test]
    async fn test_stream_dispatches_settlements() {
        let body = [
            r#"{"invoice":"inv-1","state":"SETTLED"}"#,
            r#"{"type":"heartbeat"}"#,
            r#"{"jsonrpc":"2.0","method":"invoice.settled","params":{"invoice":"inv-2"}}"#,
        ]
        .join("\n")
            + "\n";
        let url = serve_once("200 OK", body).await;

        let collector = Arc::new(Collector::default());
        let handle = adapter(url)
            .subscribe_settlements(collector.clone())
            .await
            .unwrap();

        for _ in 0..100 {
            if !collector.errors.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.close().await;

        assert_eq!(*collector.settled.lock(), vec!["inv-1".to_string(), "inv-2".to_string()]);
        assert_eq!(collector.errors.lock()[0], AdapterError::SubscriptionClosed);
    }
}
