// ========================================
// クエリ実行
// ========================================
//
// ページのクエリ一覧を取得し、variable / js / サーバークエリを実行して
// 結果を Source 名前空間に書き込む。失敗はアラートになり、他のクエリは止めない。

use std::rc::Rc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::engine::constants::ALL_QUERIES_EXECUTED;
use crate::engine::eval::to_number;
use crate::engine::runtime::Runtime;
use crate::engine::transport::{Alert, Method, make_request};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryCommon {
    #[serde(default)]
    pub run_behavior: String,
    #[serde(default)]
    pub run_periodically: bool,
    /// 秒数（文字列で来ることもある）
    #[serde(default)]
    pub run_periodically_interval: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryTransform {
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    #[serde(default)]
    pub query_id: Value,
    #[serde(default)]
    pub query_name: String,
    #[serde(default)]
    pub query_type: String,
    /// 古い形式ではトップレベルに置かれる
    #[serde(default)]
    pub run_behavior: String,
    #[serde(default)]
    pub common: QueryCommon,
    #[serde(default)]
    pub value_json: Value,
    #[serde(default)]
    pub transform: QueryTransform,
}

impl Query {
    pub fn run_behavior(&self) -> &str {
        if self.common.run_behavior.is_empty() {
            &self.run_behavior
        } else {
            &self.common.run_behavior
        }
    }

    pub fn is_variable(&self) -> bool {
        self.query_type == "variable"
    }

    pub fn is_js(&self) -> bool {
        self.query_type == "js"
    }

    pub fn is_automatic(&self) -> bool {
        self.run_behavior() == "automatic"
    }

    /// 定期実行の間隔（ミリ秒）。定期実行しない場合は None
    pub fn periodic_interval_ms(&self) -> Option<u64> {
        if !self.common.run_periodically {
            return None;
        }
        let seconds = to_number(&self.common.run_periodically_interval);
        if seconds.is_nan() || seconds <= 0.0 {
            return None;
        }
        Some((seconds * 1000.0) as u64)
    }
}

/// クエリ一覧のペイロードを読む（壊れたエントリは読み飛ばす）
pub fn parse_queries(data: &Value) -> Vec<Query> {
    let Some(items) = data.as_array() else {
        log::error!("No queries available to run.");
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<Query>(item.clone()) {
            Ok(q) => Some(q),
            Err(e) => {
                log::warn!("Skipping malformed query: {}", e);
                None
            }
        })
        .collect()
}

/// getAllFlowQuery を呼び、ページのクエリ一覧を置き換える
pub async fn load_queries(rt: &Runtime) -> bool {
    let host = rt.host();
    let response = make_request(
        rt.transport.as_ref(),
        host.as_ref(),
        Method::Post,
        &rt.config.endpoints.queries,
        &json!({}),
    )
    .await;
    if response.is_success() {
        let queries = parse_queries(&response.data);
        log::info!("📋 Loaded {} queries", queries.len());
        rt.page.borrow_mut().queries = queries;
        true
    } else {
        host.show_alert(Alert::error("OOPS! Something went wrong", &response.message));
        false
    }
}

/// サーバークエリを実行して結果を Source に書き込む
pub async fn execute_query(rt: &Runtime, query: &Query) {
    let host = rt.host();
    let body = json!({
        "queryId": query.query_id,
        "valueJson": query.value_json,
        "qParams": [],
    });
    let response = make_request(
        rt.transport.as_ref(),
        host.as_ref(),
        Method::Post,
        &rt.config.endpoints.run_query,
        &body,
    )
    .await;

    if response.is_success() {
        let mut page = rt.page.borrow_mut();
        let value = page.evaluator().transform_code(&query.transform.code, response.data);
        page.set_source(&query.query_name, value);
        log::info!("✅ Query {} executed successfully.", query.query_name);
    } else {
        let description = if response.message.is_empty() {
            "Unknown error occurred.".to_string()
        } else {
            response.message
        };
        log::error!("Query {} failed: {}", query.query_name, description);
        host.show_alert(Alert::error(&format!("Failed to run {}", query.query_name), &description));
    }
}

/// js クエリ: valueJson.code を式として評価する
pub fn execute_js_query(rt: &Runtime, query: &Query) {
    let mut page = rt.page.borrow_mut();
    let code = query.value_json.get("code").cloned().unwrap_or(Value::Null);
    let context = json!({
        "source": Value::Object(page.source.clone()),
        "component": page.components_value(),
    });

    let result = {
        let evaluator = page.evaluator();
        match evaluator.eval_value(&code, &context) {
            Value::String(s) => {
                let body = s.trim();
                let body = body
                    .strip_prefix("return")
                    .filter(|rest| rest.starts_with(char::is_whitespace) || rest.starts_with('('))
                    .unwrap_or(body)
                    .trim()
                    .trim_end_matches(';');
                evaluator.eval_expression(body, &context)
            }
            other => Ok(other),
        }
    };

    match result {
        Ok(value) => page.set_source(&query.query_name, value),
        Err(e) => {
            log::error!("JS query {} failed: {}", query.query_name, e);
            page.host.show_alert(Alert::error(
                &format!("Error running JS query {}", query.query_name),
                &e.to_string(),
            ));
        }
    }
}

/// variable / automatic のクエリを全て実行し、完了後に allQueriesExecuted を発行する
pub async fn run_queries(rt: &Runtime) {
    let queries = rt.page.borrow().queries.clone();
    let mut remote = Vec::new();

    for query in &queries {
        if query.is_variable() {
            let value = query.value_json.get("value").cloned().unwrap_or(Value::Null);
            rt.page.borrow_mut().set_source(&query.query_name, value);
        } else if query.is_automatic() {
            if query.is_js() {
                execute_js_query(rt, query);
            } else {
                remote.push(execute_query(rt, query));
            }
        }
    }

    join_all(remote).await;
    log::info!("🏁 {}", ALL_QUERIES_EXECUTED);
    rt.page.borrow_mut().page_events.push(ALL_QUERIES_EXECUTED.to_string());
}

/// 名前でクエリを実行する（controlQuery, submit）
pub async fn run_query_by_name(rt: &Runtime, name: &str) -> bool {
    let query = rt.page.borrow().queries.iter().find(|q| q.query_name == name).cloned();
    let Some(query) = query else {
        log::warn!("Query '{}' not found", name);
        return false;
    };
    if query.is_variable() {
        let value = query.value_json.get("value").cloned().unwrap_or(Value::Null);
        rt.page.borrow_mut().set_source(&query.query_name, value);
    } else if query.is_js() {
        execute_js_query(rt, &query);
    } else {
        execute_query(rt, &query).await;
    }
    true
}

// ========================================
// 定期実行
// ========================================

#[cfg(feature = "native")]
pub struct PeriodicQueries {
    stop: std::sync::Arc<std::sync::atomic::AtomicBool>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

#[cfg(feature = "native")]
impl PeriodicQueries {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn stop(&self) {
        self.stop.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(feature = "native")]
impl Drop for PeriodicQueries {
    fn drop(&mut self) {
        self.stop();
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// runPeriodically が有効なクエリを LocalSet 上で定期実行する
#[cfg(feature = "native")]
pub fn start_periodic_queries(rt: &Rc<Runtime>) -> PeriodicQueries {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    let stop = Arc::new(AtomicBool::new(false));
    let queries = rt.page.borrow().queries.clone();
    let mut handles = Vec::new();

    for query in queries {
        if query.is_variable() || query.is_js() {
            continue;
        }
        let Some(interval_ms) = query.periodic_interval_ms() else {
            continue;
        };
        log::info!("⏱️ Query {} runs every {}ms", query.query_name, interval_ms);

        let rt = Rc::clone(rt);
        let stop = Arc::clone(&stop);
        handles.push(tokio::task::spawn_local(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            // 最初のティックは即座に来るので読み捨てる
            interval.tick().await;
            loop {
                interval.tick().await;
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                execute_query(&rt, &query).await;
                rt.flush().await;
            }
        }));
    }

    PeriodicQueries { stop, handles }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::PendingWork;
    use crate::engine::transport::FixtureTransport;
    use crate::engine::runtime::testing::runtime_with;

    fn ok(data: Value) -> Value {
        json!({ "status": "SUCCESS", "data": data, "message": "" })
    }

    #[test]
    fn test_query_flags() {
        let q: Query = serde_json::from_value(json!({
            "queryName": "users", "queryType": "rest",
            "common": { "runBehavior": "automatic", "runPeriodically": true, "runPeriodicallyInterval": "2" }
        }))
        .unwrap();
        assert!(q.is_automatic());
        assert_eq!(q.periodic_interval_ms(), Some(2000));

        let legacy: Query = serde_json::from_value(json!({ "queryName": "a", "runBehavior": "automatic" })).unwrap();
        assert!(legacy.is_automatic());
        assert_eq!(legacy.periodic_interval_ms(), None);
    }

    #[test]
    fn test_parse_queries_skips_malformed() {
        let queries = parse_queries(&json!([{ "queryName": "a" }, { "queryName": 5 }, { "queryName": "b" }]));
        let names: Vec<_> = queries.iter().map(|q| q.query_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(parse_queries(&json!({ "x": 1 })).is_empty());
    }

    #[tokio::test]
    async fn test_run_queries_variable_js_and_remote() {
        let transport = FixtureTransport::new()
            .with_response("/query/runFlowQuery", ok(json!({ "rows": [{ "id": 1 }, { "id": 2 }] })));
        let (rt, host) = runtime_with("<div></div>", transport);
        rt.page.borrow_mut().queries = parse_queries(&json!([
            { "queryName": "limit", "queryType": "variable", "valueJson": { "value": 10 } },
            { "queryName": "double", "queryType": "js", "runBehavior": "automatic",
              "valueJson": { "code": "return {{ source.limit }} * 2;" } },
            { "queryName": "users", "queryType": "rest", "common": { "runBehavior": "automatic" },
              "transform": { "code": "return data.rows" } },
            { "queryName": "manual", "queryType": "rest", "common": { "runBehavior": "manual" } }
        ]));

        run_queries(&rt).await;

        let page = rt.page.borrow();
        assert_eq!(page.source["limit"], json!(10));
        assert_eq!(page.source["double"], json!(20));
        assert_eq!(page.source["users"], json!([{ "id": 1 }, { "id": 2 }]));
        assert!(!page.source.contains_key("manual"));
        assert_eq!(page.page_events, vec![ALL_QUERIES_EXECUTED.to_string()]);
        assert!(page.pending.contains(&PendingWork::SourceChanged("users".into())));
        assert!(host.alerts.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_failed_query_alerts_and_others_continue() {
        let transport = FixtureTransport::new().with_response(
            "/query/runFlowQuery",
            json!({ "status": "ERROR", "data": null, "message": "boom" }),
        );
        let (rt, host) = runtime_with("<div></div>", transport);
        rt.page.borrow_mut().queries = parse_queries(&json!([
            { "queryName": "users", "common": { "runBehavior": "automatic" } },
            { "queryName": "flag", "queryType": "variable", "valueJson": { "value": true } }
        ]));

        run_queries(&rt).await;

        assert_eq!(host.alerts.borrow()[0].title, "Failed to run users");
        assert_eq!(host.alerts.borrow()[0].description, "boom");
        let page = rt.page.borrow();
        assert_eq!(page.source["flag"], json!(true));
        assert_eq!(page.page_events.len(), 1);
    }

    #[tokio::test]
    async fn test_load_queries_and_run_by_name() {
        let transport = FixtureTransport::new()
            .with_response(
                "/config/uiBuilder/data/queryObj/getAllFlowQuery",
                ok(json!([{ "queryName": "users", "queryId": 7 }])),
            )
            .with_response("/query/runFlowQuery", ok(json!(["ann"])));
        let (rt, _) = runtime_with("<div></div>", transport);

        assert!(load_queries(&rt).await);
        assert_eq!(rt.page.borrow().queries.len(), 1);
        assert!(run_query_by_name(&rt, "users").await);
        assert_eq!(rt.page.borrow().source["users"], json!(["ann"]));
        assert!(!run_query_by_name(&rt, "nope").await);
    }

    #[tokio::test]
    async fn test_js_query_error_alerts() {
        let (rt, host) = runtime_with("<div></div>", FixtureTransport::new());
        let query: Query = serde_json::from_value(json!({
            "queryName": "bad", "queryType": "js", "valueJson": { "code": "return missing.x" }
        }))
        .unwrap();
        execute_js_query(&rt, &query);
        assert_eq!(host.alerts.borrow()[0].title, "Error running JS query bad");
        assert!(!rt.page.borrow().source.contains_key("bad"));
    }
}
