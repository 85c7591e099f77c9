//! HTTP Stage Client - 调用外部模型 HTTP 服务
//!
//! 实现 StageClientPort trait，每个阶段对应一个模型服务端点
//!
//! 外部模型服务 API:
//! POST {endpoint}
//! Request: {"task_id": "...", "stage": "...", "params": {...}, "payload": {...}}  (JSON)
//! Response: {"output": {...}} 或任意 JSON，整体作为下一阶段的 payload

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;
use std::time::Duration;

use crate::application::context::{CallContext, DoneReason};
use crate::application::ports::{
    StageClientPort, StageError, StageInput, StageMetadata, StageOutput,
};

/// HTTP 阶段客户端配置
#[derive(Debug, Clone)]
pub struct HttpStageClientConfig {
    /// 推理端点完整 URL
    pub endpoint: String,
    /// 独占类别
    pub exclusivity_class: String,
    /// 显存估算（字节）
    pub estimated_vram_bytes: u64,
    /// 请求超时时间
    pub timeout: Duration,
}

impl HttpStageClientConfig {
    pub fn new(endpoint: impl Into<String>, exclusivity_class: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            exclusivity_class: exclusivity_class.into(),
            estimated_vram_bytes: 0,
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_vram(mut self, bytes: u64) -> Self {
        self.estimated_vram_bytes = bytes;
        self
    }
}

/// HTTP 阶段客户端
pub struct HttpStageClient {
    client: Client,
    endpoint: Url,
    config: HttpStageClientConfig,
}

impl HttpStageClient {
    /// 创建新的 HTTP 阶段客户端
    pub fn new(config: HttpStageClientConfig) -> Result<Self, StageError> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            StageError::NetworkError(format!("Invalid endpoint {}: {}", config.endpoint, e))
        })?;

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StageError::NetworkError(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            config,
        })
    }

    /// 获取健康检查 URL（与端点同主机的 /health）
    fn health_url(&self) -> Option<Url> {
        self.endpoint.join("/health").ok()
    }

    async fn send(&self, input: &StageInput) -> Result<StageOutput, StageError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(input)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StageError::Timeout
                } else if e.is_connect() {
                    StageError::NetworkError(format!("Cannot connect to model service: {}", e))
                } else {
                    StageError::NetworkError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(StageError::ServiceError {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| StageError::InvalidResponse(format!("Failed to parse body: {}", e)))?;

        Ok(StageOutput {
            payload: unwrap_output(body),
        })
    }
}

/// `{"output": x}` 取 x，否则整个 body 作为输出
fn unwrap_output(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("output") => {
            map.remove("output").unwrap_or(Value::Null)
        }
        other => other,
    }
}

#[async_trait]
impl StageClientPort for HttpStageClient {
    fn metadata(&self) -> StageMetadata {
        StageMetadata {
            exclusivity_class: self.config.exclusivity_class.clone(),
            estimated_vram_bytes: self.config.estimated_vram_bytes,
            default_timeout: self.config.timeout,
        }
    }

    async fn invoke(&self, ctx: &CallContext, input: StageInput) -> Result<StageOutput, StageError> {
        tracing::debug!(
            url = %self.endpoint,
            task_id = %input.task_id,
            stage = %input.stage,
            "Sending stage request"
        );

        tokio::select! {
            biased;
            reason = ctx.done() => match reason {
                DoneReason::Cancelled => Err(StageError::Cancelled),
                DoneReason::DeadlineExceeded => Err(StageError::Timeout),
            },
            result = self.send(&input) => {
                if result.is_ok() {
                    tracing::debug!(task_id = %input.task_id, stage = %input.stage, "Stage request completed");
                }
                result
            }
        }
    }

    async fn health_check(&self) -> bool {
        let Some(url) = self.health_url() else {
            return false;
        };
        match self
            .client
            .get(url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_builder() {
        let config = HttpStageClientConfig::new("http://localhost:8101/infer", "yolo")
            .with_timeout(Duration::from_secs(30))
            .with_vram(1024);
        assert_eq!(config.endpoint, "http://localhost:8101/infer");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.estimated_vram_bytes, 1024);
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let result = HttpStageClient::new(HttpStageClientConfig::new("not a url", "yolo"));
        assert!(matches!(result, Err(StageError::NetworkError(_))));
    }

    #[test]
    fn test_health_url_derived_from_endpoint() {
        let client =
            HttpStageClient::new(HttpStageClientConfig::new("http://model:9000/v1/infer", "tts"))
                .unwrap();
        assert_eq!(
            client.health_url().unwrap().as_str(),
            "http://model:9000/health"
        );
        assert_eq!(client.metadata().exclusivity_class, "tts");
    }

    #[test]
    fn test_unwrap_output() {
        assert_eq!(unwrap_output(json!({"output": {"boxes": []}})), json!({"boxes": []}));
        assert_eq!(unwrap_output(json!({"mask": "m.png"})), json!({"mask": "m.png"}));
        assert_eq!(unwrap_output(json!([1, 2])), json!([1, 2]));
    }

    #[tokio::test]
    async fn test_cancelled_before_response() {
        // 不可路由地址，连接会一直挂起直到取消
        let client = HttpStageClient::new(HttpStageClientConfig::new(
            "http://10.255.255.1:81/infer",
            "yolo",
        ))
        .unwrap();
        let ctx = CallContext::background();
        ctx.cancel();

        let input = StageInput {
            task_id: crate::domain::task::TaskId::new(),
            stage: "detect_person".to_string(),
            params: Value::Null,
            payload: Value::Null,
        };
        let result = client.invoke(&ctx, input).await;
        assert!(matches!(result, Err(StageError::Cancelled)));
    }
}
