// src/engine/core/event.rs
// アクション記述子のコンパイルと実行

use std::collections::BTreeMap;
use std::rc::Rc;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engine::core::control::{ControlMethod, invoke_control};
use crate::engine::error::{ActionError, ResolutionError};
use crate::engine::eval::js_to_string;
use crate::engine::state::{EventHandlers, InstancePath, Page, PendingWork};
use crate::engine::transport::Alert;

/// `{event, action, targetComponent?, options?, method?, ...}` 形式の記述子
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDescriptor {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_component: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// アクション固有の引数（key, value, script, navigateUrl など）
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ActionDescriptor {
    pub fn arg(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// options[0][key]
    pub fn option(&self, key: &str) -> Option<&Value> {
        self.options.first().and_then(|o| o.get(key))
    }

    pub fn target(&self) -> Result<&str, ActionError> {
        self.target_component
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(ActionError::MissingOption("targetComponent"))
    }
}

/// ハンドラーに渡されるイベント
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPayload {
    /// 発火元インスタンス
    pub component: InstancePath,
    pub event_type: String,
    pub detail: Value,
}

/// コンパイル済みハンドラー
pub type Handler = Rc<dyn Fn(&mut Page, &EventPayload)>;

/// チャンネル → イベント種別 → 結合済みハンドラー
pub type CompiledEvents = BTreeMap<String, BTreeMap<String, Handler>>;

// ========================================
// アクションカタログ
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ControlQuery,
    RunScript,
    Navigate,
    ShowAlert,
    SetLocalStorage,
    CopyToClipboard,
    ControlComponent,
    SetVariable,
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "controlQuery" => Action::ControlQuery,
            "runScript" => Action::RunScript,
            "navigate" => Action::Navigate,
            "showAlert" => Action::ShowAlert,
            "setLocalStorage" => Action::SetLocalStorage,
            "copyToClipboard" => Action::CopyToClipboard,
            "controlComponent" => Action::ControlComponent,
            "setVariable" => Action::SetVariable,
            other => return Err(format!("unknown action '{}'", other)),
        })
    }
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::ControlQuery => "controlQuery",
            Action::RunScript => "runScript",
            Action::Navigate => "navigate",
            Action::ShowAlert => "showAlert",
            Action::SetLocalStorage => "setLocalStorage",
            Action::CopyToClipboard => "copyToClipboard",
            Action::ControlComponent => "controlComponent",
            Action::SetVariable => "setVariable",
        }
    }
}

// ========================================
// コンパイル
// ========================================

/// チャンネル → 記述子列 を チャンネル → {イベント種別 → 結合ハンドラー} に変換する
/// 未知のアクションはここで読み捨てる。同じ種別のハンドラーは登録順に実行される
pub fn compile_event_listeners(handlers: &EventHandlers) -> CompiledEvents {
    let mut compiled = CompiledEvents::new();

    for (channel, descriptors) in handlers {
        let mut by_type: BTreeMap<String, Vec<(Action, ActionDescriptor)>> = BTreeMap::new();
        for descriptor in descriptors {
            match descriptor.action.parse::<Action>() {
                Ok(action) => by_type
                    .entry(descriptor.event.clone())
                    .or_default()
                    .push((action, descriptor.clone())),
                Err(e) => log::debug!("Skipping handler on '{}': {}", channel, e),
            }
        }

        let combined: BTreeMap<String, Handler> = by_type
            .into_iter()
            .map(|(event_type, list)| {
                let handler: Handler = Rc::new(move |page: &mut Page, payload: &EventPayload| {
                    for (action, descriptor) in &list {
                        if let Err(e) = execute_action(page, *action, descriptor, payload) {
                            report_action_error(action.name(), descriptor, &e);
                        }
                    }
                });
                (event_type, handler)
            })
            .collect();

        compiled.insert(channel.clone(), combined);
    }

    compiled
}

/// 記述子列を順に実行する（watch / mounted フック用）
pub fn run_descriptors(page: &mut Page, descriptors: &[ActionDescriptor], payload: &EventPayload) {
    for descriptor in descriptors {
        let result = descriptor
            .action
            .parse::<Action>()
            .map_err(|message| ActionError::InvalidValue {
                action: descriptor.action.clone(),
                message,
            })
            .and_then(|action| execute_action(page, action, descriptor, payload));
        if let Err(e) = result {
            report_action_error(&descriptor.action, descriptor, &e);
        }
    }
}

fn report_action_error(name: &str, descriptor: &ActionDescriptor, error: &ActionError) {
    match error {
        ActionError::Resolution(_) => {
            log::warn!("Action '{}' skipped: {} ({:?})", name, error, descriptor)
        }
        _ => log::error!("Action '{}' failed: {} ({:?})", name, error, descriptor),
    }
}

// ========================================
// 実行
// ========================================

/// 記述子の引数を評価して返す
fn eval_arg(page: &Page, value: Option<&Value>, payload: &EventPayload) -> Value {
    match value {
        Some(v) => {
            let ctx = page.action_context(payload);
            page.evaluator().eval_value(v, &ctx)
        }
        None => Value::Null,
    }
}

fn eval_string_arg(
    page: &Page,
    descriptor: &ActionDescriptor,
    key: &'static str,
    payload: &EventPayload,
) -> Result<String, ActionError> {
    match eval_arg(page, descriptor.arg(key), payload) {
        Value::Null => Err(ActionError::MissingOption(key)),
        Value::String(s) => Ok(s),
        other => Ok(js_to_string(&other)),
    }
}

/// アクションを実行し、書き換えられた値の watch を予約する（失敗した場合も途中までの変更は拾う）
pub fn execute_action(
    page: &mut Page,
    action: Action,
    descriptor: &ActionDescriptor,
    payload: &EventPayload,
) -> Result<(), ActionError> {
    log::debug!("▶ {} {:?}", action.name(), descriptor.target_component);
    let result = apply_action(page, action, descriptor, payload);
    page.queue_watches();
    result
}

fn apply_action(
    page: &mut Page,
    action: Action,
    descriptor: &ActionDescriptor,
    payload: &EventPayload,
) -> Result<(), ActionError> {
    match action {
        Action::ControlQuery => {
            let name = eval_string_arg(page, descriptor, "queryName", payload)?;
            if !page.queries.iter().any(|q| q.query_name == name) {
                return Err(ResolutionError::Query(name).into());
            }
            page.pending.push_back(PendingWork::RunQuery(name));
            Ok(())
        }
        Action::RunScript => {
            let script = descriptor
                .arg("script")
                .and_then(Value::as_str)
                .ok_or(ActionError::MissingOption("script"))?;
            if let Err(message) = page.host.run_script(script, &payload.detail) {
                page.host.show_alert(Alert::error("OOPS! Something went wrong", &message));
            }
            Ok(())
        }
        Action::Navigate => {
            let path = eval_string_arg(page, descriptor, "navigateUrl", payload)?;
            let params = eval_arg(page, descriptor.arg("queryParams"), payload);
            let url = build_navigate_url(&path, &params);
            page.host.navigate(&url, false);
            Ok(())
        }
        Action::ShowAlert => {
            let args = Value::Object(descriptor.extra.clone());
            let evaluated = eval_arg(page, Some(&args), payload);
            page.host.show_alert(Alert::from_value(&evaluated));
            Ok(())
        }
        Action::SetLocalStorage => {
            let key = eval_string_arg(page, descriptor, "key", payload)?;
            let value = match eval_arg(page, descriptor.arg("value"), payload) {
                Value::String(s) => s,
                other => js_to_string(&other),
            };
            page.host.set_local_storage(&key, &value);
            Ok(())
        }
        Action::CopyToClipboard => {
            let text = eval_string_arg(page, descriptor, "value", payload)?;
            page.host.copy_to_clipboard(&text);
            Ok(())
        }
        Action::ControlComponent => {
            let name = descriptor
                .method
                .as_deref()
                .ok_or(ActionError::MissingOption("method"))?;
            let method = ControlMethod::from_name(name).ok_or_else(|| ActionError::InvalidValue {
                action: "controlComponent".into(),
                message: format!("unknown method '{}'", name),
            })?;
            invoke_control(page, method, descriptor, payload)
        }
        Action::SetVariable => {
            let key = eval_string_arg(page, descriptor, "key", payload)?;
            let value = eval_arg(page, descriptor.arg("value"), payload);
            page.set_source(&key, value);
            Ok(())
        }
    }
}

/// navigateUrl と queryParams [{key, value}] から遷移先を組み立てる
pub fn build_navigate_url(path: &str, params: &Value) -> String {
    let query: Vec<String> = params
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|p| {
                    let key = p.get("key").map(js_to_string)?;
                    let value = p.get("value").map(js_to_string).unwrap_or_default();
                    Some(format!("{}={}", key, value))
                })
                .collect()
        })
        .unwrap_or_default();

    if query.is_empty() {
        path.to_string()
    } else {
        format!("{}?{}", path, query.join("&"))
    }
}
