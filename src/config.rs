// ========================================
// ランタイム設定
// ========================================

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::error::RuntimeError;

/// サーバーのエンドポイント（パスのみ。base_url と連結して使う）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Endpoints {
    pub components: String,
    pub page_resource: String,
    pub queries: String,
    pub run_query: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            components: "/config/uiBuilder/data/block/getComponents".into(),
            page_resource: "/config/uiBuilder/data/pageResource/getPageResource".into(),
            queries: "/config/uiBuilder/data/queryObj/getAllFlowQuery".into(),
            run_query: "/query/runFlowQuery".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    pub base_url: String,
    pub page_id: String,
    /// リクエストのタイムアウト（ミリ秒）
    pub timeout_ms: u64,
    pub endpoints: Endpoints,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            page_id: String::new(),
            timeout_ms: 10_000,
            endpoints: Endpoints::default(),
        }
    }
}

impl RuntimeConfig {
    /// JSONファイルから読み込む。書かれていない項目は既定値
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RuntimeError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text).map_err(|e| RuntimeError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = RuntimeConfig::from_json(
            r#"{ "pageId": "p1", "endpoints": { "runQuery": "/q" } }"#,
        )
        .unwrap();
        assert_eq!(config.page_id, "p1");
        assert_eq!(config.timeout_ms, 10_000);
        assert_eq!(config.endpoints.run_query, "/q");
        assert_eq!(config.endpoints.components, Endpoints::default().components);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = RuntimeConfig::from_file("/nonexistent/pagebind.json").unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)));
    }
}
