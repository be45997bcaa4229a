// ========================================
// 通信・ホスト環境
// ========================================
//
// サーバーとの通信（Transport）、リソースの読み込み（ResourceLoader）、
// ブラウザ側の副作用（Host: アラート、遷移、ストレージ、クリップボード）を
// トレイトとして切り出す。実行時は単一スレッドなので Send は要求しない。

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// サーバーへのリクエスト。成功時はレスポンスのJSON本文をそのまま返す
#[async_trait(?Send)]
pub trait Transport {
    async fn send(&self, method: Method, url: &str, body: &Value) -> Result<Value, TransportError>;
}

/// ブロックが要求するスクリプト・スタイルの読み込み
#[async_trait(?Send)]
pub trait ResourceLoader {
    async fn load_script(&self, url: &str) -> Result<(), TransportError> {
        log::debug!("script ready: {}", url);
        Ok(())
    }

    async fn load_style(&self, url: &str) -> Result<(), TransportError> {
        log::debug!("style ready: {}", url);
        Ok(())
    }
}

/// 何も読み込まないローダー（ドキュメントへの注入のみ）
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLoader;

#[async_trait(?Send)]
impl ResourceLoader for NoopLoader {}

// ========================================
// ホスト環境
// ========================================

/// アラートの内容（showAlert の options と同じ形）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

impl Alert {
    pub fn error(title: &str, description: &str) -> Self {
        Self {
            kind: "error".into(),
            title: title.to_string(),
            description: description.to_string(),
        }
    }

    /// 欠けているフィールドは空文字として扱う
    pub fn from_value(value: &Value) -> Self {
        let text = |key: &str| match value.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        Self {
            kind: text("type"),
            title: text("title"),
            description: text("description"),
        }
    }
}

/// ページの外側にある副作用
pub trait Host {
    fn show_alert(&self, alert: Alert);
    fn navigate(&self, url: &str, new_tab: bool);
    fn set_local_storage(&self, key: &str, value: &str);
    fn copy_to_clipboard(&self, text: &str);
    /// 任意スクリプトの実行。ホストが対応しない場合はエラーを返す
    fn run_script(&self, script: &str, event: &Value) -> Result<(), String>;
}

// ========================================
// レスポンスの解釈
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Success,
    Error,
    Redirect,
    Unknown,
}

impl RequestStatus {
    fn from_envelope(status: Option<&str>) -> Self {
        match status {
            Some("SUCCESS") => RequestStatus::Success,
            Some("ERROR") => RequestStatus::Error,
            Some("REDIRECT") => RequestStatus::Redirect,
            _ => RequestStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub data: Value,
    pub error: Option<String>,
    pub status: RequestStatus,
    pub message: String,
    pub transaction: Value,
}

impl Response {
    fn failed(error: String, message: String) -> Self {
        Self {
            data: Value::Null,
            error: Some(error),
            status: RequestStatus::Error,
            message,
            transaction: Value::Object(Default::default()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status != RequestStatus::Error
    }
}

/// リクエストを送り、{status, data, message, transaction} の封筒を解釈する
/// 失敗は Response.error に入り、呼び出し側へは伝播しない
pub async fn make_request(
    transport: &dyn Transport,
    host: &dyn Host,
    method: Method,
    url: &str,
    body: &Value,
) -> Response {
    let envelope = match transport.send(method, url, body).await {
        Ok(v) => v,
        Err(e) => {
            log::error!("Request failed: {} {} ({})", method, url, e);
            return Response::failed(e.to_string(), e.to_string());
        }
    };

    let status = RequestStatus::from_envelope(envelope.get("status").and_then(Value::as_str));
    let message = envelope
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let transaction = envelope.get("transaction").cloned().unwrap_or(Value::Null);
    let data = envelope.get("data").cloned().unwrap_or(Value::Null);

    match status {
        RequestStatus::Success => Response { data, error: None, status, message, transaction },
        RequestStatus::Redirect => {
            let target = data.get("url").and_then(Value::as_str).unwrap_or_default();
            let new_tab = data.get("target").and_then(Value::as_str) == Some("_blank");
            log::info!("↪️ Redirecting to {}", target);
            host.navigate(target, new_tab);
            Response { data, error: None, status, message, transaction }
        }
        RequestStatus::Error => Response {
            data: Value::Null,
            error: Some(message.clone()),
            status,
            message,
            transaction,
        },
        RequestStatus::Unknown => Response {
            data: envelope,
            error: None,
            status,
            message,
            transaction,
        },
    }
}

// ========================================
// HTTP 実装
// ========================================

#[cfg(feature = "native")]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

#[cfg(feature = "native")]
impl HttpTransport {
    pub fn new(base_url: &str, timeout_ms: u64) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| TransportError::Request {
                url: base_url.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[cfg(feature = "native")]
#[async_trait(?Send)]
impl Transport for HttpTransport {
    async fn send(&self, method: Method, url: &str, body: &Value) -> Result<Value, TransportError> {
        let full = format!("{}{}", self.base_url, url);
        let request = match method {
            Method::Get => self.client.get(&full),
            Method::Post => self.client.post(&full).json(body),
            Method::Put => self.client.put(&full).json(body),
            Method::Delete => self.client.delete(&full),
        };
        log::debug!("🌐 {} {}", method, full);

        let response = request.send().await.map_err(|e| TransportError::Request {
            url: full.clone(),
            message: e.to_string(),
        })?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(TransportError::Status {
                url: full,
                status: response.status().as_u16(),
            });
        }
        let text = response.text().await.map_err(|e| TransportError::Request {
            url: full.clone(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

// ========================================
// フィクスチャ実装（オフライン実行用）
// ========================================

/// URLパス → レスポンス本文。ディレクトリから読む場合は
/// "/query/runFlowQuery" → "query_runFlowQuery.json" の規則でファイルを探す
#[derive(Debug, Default, Clone)]
pub struct FixtureTransport {
    responses: HashMap<String, Value>,
    dir: Option<PathBuf>,
}

impl FixtureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            responses: HashMap::new(),
            dir: Some(dir.as_ref().to_path_buf()),
        }
    }

    pub fn with_response(mut self, url: &str, body: Value) -> Self {
        self.responses.insert(url.to_string(), body);
        self
    }

    pub fn insert(&mut self, url: &str, body: Value) {
        self.responses.insert(url.to_string(), body);
    }

    fn file_name(url: &str) -> String {
        let path = url.split('?').next().unwrap_or(url);
        format!("{}.json", path.trim_matches('/').replace('/', "_"))
    }

    fn lookup(&self, url: &str) -> Result<Value, TransportError> {
        if let Some(v) = self.responses.get(url) {
            return Ok(v.clone());
        }
        let Some(dir) = &self.dir else {
            return Err(TransportError::Fixture(url.to_string()));
        };
        let path = dir.join(Self::file_name(url));
        let text = std::fs::read_to_string(&path)
            .map_err(|_| TransportError::Fixture(path.display().to_string()))?;
        serde_json::from_str(&text).map_err(|e| TransportError::Decode(format!("{}: {}", path.display(), e)))
    }
}

#[async_trait(?Send)]
impl Transport for FixtureTransport {
    async fn send(&self, method: Method, url: &str, _body: &Value) -> Result<Value, TransportError> {
        log::debug!("📁 {} {} (fixture)", method, url);
        self.lookup(url)
    }
}

// ========================================
// コンソールホスト
// ========================================

/// 副作用を標準エラーに書き出すホスト
#[derive(Debug, Default)]
pub struct ConsoleHost;

#[cfg(feature = "native")]
impl Host for ConsoleHost {
    fn show_alert(&self, alert: Alert) {
        use colored::Colorize;
        let label = match alert.kind.as_str() {
            "error" => alert.kind.red().bold(),
            "warning" => alert.kind.yellow().bold(),
            "success" => alert.kind.green().bold(),
            _ => alert.kind.cyan().bold(),
        };
        eprintln!("[{}] {} {}", label, alert.title.bold(), alert.description);
    }

    fn navigate(&self, url: &str, new_tab: bool) {
        use colored::Colorize;
        let how = if new_tab { "open" } else { "navigate" };
        eprintln!("{} {}", how.blue().bold(), url);
    }

    fn set_local_storage(&self, key: &str, value: &str) {
        log::info!("localStorage[{}] = {}", key, value);
    }

    fn copy_to_clipboard(&self, text: &str) {
        log::info!("📋 clipboard: {}", text);
    }

    fn run_script(&self, _script: &str, _event: &Value) -> Result<(), String> {
        Err("script execution is not supported on this host".into())
    }
}

#[cfg(not(feature = "native"))]
impl Host for ConsoleHost {
    fn show_alert(&self, alert: Alert) {
        eprintln!("[{}] {} {}", alert.kind, alert.title, alert.description);
    }

    fn navigate(&self, url: &str, new_tab: bool) {
        eprintln!("navigate {} (new tab: {})", url, new_tab);
    }

    fn set_local_storage(&self, key: &str, value: &str) {
        log::info!("localStorage[{}] = {}", key, value);
    }

    fn copy_to_clipboard(&self, text: &str) {
        log::info!("clipboard: {}", text);
    }

    fn run_script(&self, _script: &str, _event: &Value) -> Result<(), String> {
        Err("script execution is not supported on this host".into())
    }
}

// ========================================
// テスト用の記録ホスト
// ========================================


#[cfg(test)]
mod tests {
    use super::testing::RecordingHost;
    use super::*;
    use serde_json::json;

    fn envelope(status: &str, data: Value) -> Value {
        json!({ "status": status, "data": data, "message": "msg", "transaction": { "id": 1 } })
    }

    #[tokio::test]
    async fn test_success_envelope() {
        let transport = FixtureTransport::new().with_response("/a", envelope("SUCCESS", json!([1, 2])));
        let host = RecordingHost::default();
        let res = make_request(&transport, &host, Method::Get, "/a", &Value::Null).await;
        assert_eq!(res.status, RequestStatus::Success);
        assert_eq!(res.data, json!([1, 2]));
        assert!(res.is_success());
        assert_eq!(res.transaction, json!({ "id": 1 }));
    }

    #[tokio::test]
    async fn test_error_envelope_and_transport_failure() {
        let transport = FixtureTransport::new().with_response("/a", envelope("ERROR", json!({ "x": 1 })));
        let host = RecordingHost::default();
        let res = make_request(&transport, &host, Method::Post, "/a", &json!({})).await;
        assert_eq!(res.status, RequestStatus::Error);
        assert_eq!(res.data, Value::Null);
        assert_eq!(res.error.as_deref(), Some("msg"));

        let res = make_request(&transport, &host, Method::Get, "/missing", &Value::Null).await;
        assert_eq!(res.status, RequestStatus::Error);
        assert!(!res.is_success());
        assert_eq!(res.error.as_deref(), Some("no fixture for /missing"));
    }

    #[tokio::test]
    async fn test_redirect_navigates() {
        let transport = FixtureTransport::new()
            .with_response("/a", envelope("REDIRECT", json!({ "url": "/login" })))
            .with_response("/b", envelope("REDIRECT", json!({ "url": "https://x.io", "target": "_blank" })));
        let host = RecordingHost::default();
        make_request(&transport, &host, Method::Get, "/a", &Value::Null).await;
        make_request(&transport, &host, Method::Get, "/b", &Value::Null).await;
        assert_eq!(
            *host.navigations.borrow(),
            vec![("/login".to_string(), false), ("https://x.io".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_unknown_envelope_returns_whole_body() {
        let transport = FixtureTransport::new().with_response("/a", json!({ "rows": [1] }));
        let host = RecordingHost::default();
        let res = make_request(&transport, &host, Method::Get, "/a", &Value::Null).await;
        assert_eq!(res.status, RequestStatus::Unknown);
        assert_eq!(res.data, json!({ "rows": [1] }));
    }

    #[test]
    fn test_fixture_file_names() {
        assert_eq!(FixtureTransport::file_name("/query/runFlowQuery"), "query_runFlowQuery.json");
        assert_eq!(FixtureTransport::file_name("/a/b?x=1"), "a_b.json");
    }

    #[test]
    fn test_alert_from_value() {
        let alert = Alert::from_value(&json!({ "type": "info", "title": "T", "description": 3 }));
        assert_eq!(alert.kind, "info");
        assert_eq!(alert.title, "T");
        assert_eq!(alert.description, "3");
        assert_eq!(Alert::from_value(&json!({})), Alert::default());
    }
}
