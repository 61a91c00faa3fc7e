// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

// HTTP JSON-RPC implementation of the remote ledger interface.

use super::{LedgerClient, LedgerError, LedgerResult, RawLog};
use crate::event_pipeline::EventKind;
use crate::types::{FeeParameters, ResultHandle, TxRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Reverts and other logic failures are reported in the server-defined range
const REJECTED_CODE_MIN: i64 = -32099;
const REJECTED_CODE_MAX: i64 = -32000;

#[derive(Clone, Debug)]
pub struct JsonRpcLedgerClient {
    http_client: reqwest::Client,
    rpc_url: String,
    request_id: Arc<AtomicU64>,
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Vec<Value>,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

impl JsonRpcLedgerClient {
    pub fn new(rpc_url: impl Into<String>) -> LedgerResult<Self> {
        Self::with_timeout(rpc_url, Duration::from_secs(30))
    }

    pub fn with_timeout(rpc_url: impl Into<String>, timeout: Duration) -> LedgerResult<Self> {
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(16)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .connect_timeout(Duration::from_secs(2))
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Transport(e.to_string()))?;
        Ok(Self {
            http_client,
            rpc_url: rpc_url.into(),
            request_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> LedgerResult<Value> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.request_id.fetch_add(1, Ordering::SeqCst),
        };
        tracing::trace!("[RPC] >>> {} id={}", method, request.id);

        let response = self
            .http_client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LedgerError::RateLimited(format!("{} returned 429", method)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LedgerError::Transport(format!(
                "HTTP error: {} - {}",
                status, body
            )));
        }

        let body = response.text().await.map_err(map_transport_error)?;
        let rpc_response: JsonRpcResponse = serde_json::from_str(&body)
            .map_err(|e| LedgerError::InvalidResponse(format!("{}: {}", method, e)))?;

        if let Some(error) = rpc_response.error {
            tracing::debug!(
                "[RPC] <<< {} error {}: {}",
                method,
                error.code,
                error.message
            );
            return Err(map_rpc_error(error));
        }
        Ok(rpc_response.result.unwrap_or(Value::Null))
    }
}

fn map_transport_error(err: reqwest::Error) -> LedgerError {
    if err.is_timeout() {
        LedgerError::Timeout(err.to_string())
    } else {
        LedgerError::Transport(err.to_string())
    }
}

fn map_rpc_error(error: JsonRpcError) -> LedgerError {
    match error.code {
        // Some providers report throttling in-band
        -32005 | 429 => LedgerError::RateLimited(error.message),
        REJECTED_CODE_MIN..=REJECTED_CODE_MAX => LedgerError::Rejected(error.message),
        code => LedgerError::Rpc {
            code,
            message: error.message,
        },
    }
}

// Providers disagree on whether large integers are JSON numbers or strings
fn parse_u64(value: &Value, what: &str) -> LedgerResult<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => parse_int_str(s).and_then(|v| u64::try_from(v).ok()),
        _ => None,
    }
    .ok_or_else(|| LedgerError::InvalidResponse(format!("{}: expected integer, got {}", what, value)))
}

fn parse_u128(value: &Value, what: &str) -> LedgerResult<u128> {
    match value {
        Value::Number(n) => n.as_u64().map(u128::from),
        Value::String(s) => parse_int_str(s),
        _ => None,
    }
    .ok_or_else(|| LedgerError::InvalidResponse(format!("{}: expected integer, got {}", what, value)))
}

fn parse_int_str(s: &str) -> Option<u128> {
    match s.strip_prefix("0x") {
        Some(hex) => u128::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn to_param<T: Serialize>(value: &T) -> LedgerResult<Value> {
    serde_json::to_value(value).map_err(|e| LedgerError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl LedgerClient for JsonRpcLedgerClient {
    async fn get_current_height(&self) -> LedgerResult<u64> {
        let result = self.call("ledger_currentHeight", vec![]).await?;
        parse_u64(&result, "ledger_currentHeight")
    }

    async fn get_logs(
        &self,
        source_address: &str,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> LedgerResult<Vec<RawLog>> {
        let filter = json!({
            "address": source_address,
            "eventKind": kind.to_string(),
            "fromHeight": from,
            "toHeight": to,
        });
        let result = self.call("ledger_getLogs", vec![filter]).await?;
        if result.is_null() {
            return Ok(vec![]);
        }
        serde_json::from_value(result)
            .map_err(|e| LedgerError::InvalidResponse(format!("ledger_getLogs: {}", e)))
    }

    async fn read_authorization(
        &self,
        asset: &str,
        owner: &str,
        spender: &str,
    ) -> LedgerResult<u128> {
        let result = self
            .call("ledger_allowance", vec![json!(asset), json!(owner), json!(spender)])
            .await?;
        parse_u128(&result, "ledger_allowance")
    }

    async fn estimate_cost(&self, request: &TxRequest) -> LedgerResult<u64> {
        let result = self
            .call("ledger_estimateCost", vec![to_param(request)?])
            .await?;
        parse_u64(&result, "ledger_estimateCost")
    }

    async fn submit(&self, request: &TxRequest) -> LedgerResult<ResultHandle> {
        let result = self.call("ledger_submit", vec![to_param(request)?]).await?;
        match result {
            Value::String(handle) if !handle.is_empty() => Ok(ResultHandle(handle)),
            other => Err(LedgerError::InvalidResponse(format!(
                "ledger_submit: expected receipt id, got {}",
                other
            ))),
        }
    }

    async fn get_fee_parameters(&self) -> LedgerResult<FeeParameters> {
        let result = self.call("ledger_feeParameters", vec![]).await?;
        Ok(FeeParameters {
            max_fee_per_unit: parse_u128(&result["maxFeePerUnit"], "maxFeePerUnit")?,
            priority_fee_per_unit: parse_u128(
                &result["priorityFeePerUnit"],
                "priorityFeePerUnit",
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActionKind;
    use axum::{http::StatusCode, routing::post, Json, Router};

    async fn rpc_stub(Json(request): Json<Value>) -> (StatusCode, Json<Value>) {
        let id = request["id"].clone();
        let result = match request["method"].as_str().unwrap_or_default() {
            "ledger_currentHeight" => json!({"jsonrpc": "2.0", "id": id, "result": "0x10"}),
            "ledger_allowance" => {
                json!({"jsonrpc": "2.0", "id": id, "result": "340282366920938463463374607431768211455"})
            }
            "ledger_estimateCost" => json!({"jsonrpc": "2.0", "id": id, "result": 21000}),
            "ledger_feeParameters" => json!({"jsonrpc": "2.0", "id": id, "result": {
                "maxFeePerUnit": "30", "priorityFeePerUnit": 2
            }}),
            "ledger_getLogs" => json!({"jsonrpc": "2.0", "id": id, "result": [{
                "address": request["params"][0]["address"],
                "eventKind": "Borrow",
                "blockHeight": request["params"][0]["fromHeight"],
                "txHandle": "0xfeed",
                "logIndex": 0,
                "fields": {"owner": "alice"}
            }]}),
            "ledger_submit" => json!({"jsonrpc": "2.0", "id": id, "error": {
                "code": -32000, "message": "execution reverted"
            }}),
            _ => return (StatusCode::TOO_MANY_REQUESTS, Json(Value::Null)),
        };
        (StatusCode::OK, Json(result))
    }

    async fn start_stub() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/", post(rpc_stub));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_reads_against_stub_server() {
        let client = JsonRpcLedgerClient::new(start_stub().await).unwrap();

        assert_eq!(client.get_current_height().await.unwrap(), 16);
        assert_eq!(
            client.read_authorization("DAI", "alice", "pool").await.unwrap(),
            u128::MAX
        );
        let fees = client.get_fee_parameters().await.unwrap();
        assert_eq!(fees.max_fee_per_unit, 30);
        assert_eq!(fees.priority_fee_per_unit, 2);

        let logs = client
            .get_logs("0xpool", EventKind::Borrow, 7, 9)
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].address, "0xpool");
        assert_eq!(logs[0].block_height, 7);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let client = JsonRpcLedgerClient::new(start_stub().await).unwrap();
        let request = TxRequest::action(ActionKind::Repay, "alice", "pool", "DAI", 1);

        assert_eq!(client.estimate_cost(&request).await.unwrap(), 21000);
        assert_eq!(
            client.submit(&request).await.unwrap_err(),
            LedgerError::Rejected("execution reverted".to_string())
        );

        let err = client.call("ledger_unknown", vec![]).await.unwrap_err();
        assert_eq!(err.error_type(), "rate_limited");
    }

    #[test]
    fn test_parse_integers() {
        assert_eq!(parse_u64(&json!(5), "x").unwrap(), 5);
        assert_eq!(parse_u64(&json!("0xff"), "x").unwrap(), 255);
        assert!(parse_u64(&json!("-1"), "x").is_err());
        assert!(parse_u128(&json!(null), "x").is_err());
    }
}
