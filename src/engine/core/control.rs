// src/engine/core/control.rs
// controlComponent アクションの制御メソッド群

use serde_json::{Map, Value};

use crate::dom_renderer::{NodeId, Selector};
use crate::engine::constants::NAME;
use crate::engine::core::event::{ActionDescriptor, EventPayload};
use crate::engine::error::{ActionError, ResolutionError};
use crate::engine::eval::{to_number, truthy};
use crate::engine::state::{ComponentInstance, Page, PendingWork};

macro_rules! control_methods {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// 制御メソッドの一覧（閉じた集合）
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum ControlMethod {
            $($variant),+
        }

        impl ControlMethod {
            pub const ALL: &'static [ControlMethod] = &[$(ControlMethod::$variant),+];

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(ControlMethod::$variant),)+
                    _ => None,
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(ControlMethod::$variant => $name),+
                }
            }
        }
    };
}

control_methods! {
    SetValue => "setValue",
    ScrollIntoView => "scrollIntoView",
    ScrollToIndex => "scrollToIndex",
    SetHidden => "setHidden",
    SetDisabled => "setDisabled",
    Blur => "blur",
    Focus => "focus",
    ClearValue => "clearValue",
    ResetValue => "resetValue",
    Select => "select",
    Validate => "validate",
    ClearValidation => "clearValidation",
    Click => "click",
    SetData => "setData",
    ClearData => "clearData",
    Submit => "submit",
    Check => "check",
    Uncheck => "uncheck",
    Toggle => "toggle",
    Play => "play",
    Pause => "pause",
    SeekTo => "seekTo",
    Open => "open",
    Close => "close",
    SetFlipVertical => "setFlipVertical",
    SetFlipHorizontal => "setFlipHorizontal",
    SetImageUrl => "setImageUrl",
    SetPageUrl => "setPageUrl",
    Reload => "reload",
    Update => "update",
    Export => "export",
    AddRow => "addRow",
    RemoveRow => "removeRow",
    UpdateCell => "updateCell",
    SetContent => "setContent",
}

/// フォーカス可能な要素
fn focusable() -> Vec<Selector> {
    vec![
        Selector::tag("input"),
        Selector::tag("textarea"),
        Selector::tag("select"),
        Selector::tag("button"),
        Selector::tag("a").with_attr("href"),
        Selector::attr("tabindex").without_attr_eq("tabindex", "-1"),
    ]
}

/// クリック可能な要素
fn clickable() -> Vec<Selector> {
    vec![
        Selector::tag("button"),
        Selector::tag("a"),
        Selector::tag("input").with_attr_eq("type", "button"),
        Selector::tag("input").with_attr_eq("type", "submit"),
        Selector::attr("tabindex").without_attr_eq("tabindex", "-1"),
    ]
}

const DISABLEABLE: &[&str] = &["input", "textarea", "select", "button", "fieldset"];

fn invalid(method: ControlMethod, message: impl Into<String>) -> ActionError {
    ActionError::InvalidValue {
        action: method.name().to_string(),
        message: message.into(),
    }
}

/// data-name でドキュメント内の要素を探す
fn element(page: &Page, target: &str) -> Result<NodeId, ActionError> {
    page.document
        .find_by_attribute(NAME, target)
        .ok_or_else(|| ResolutionError::Element(target.to_string()).into())
}

/// options[0][key] を評価する
fn option_value(page: &Page, descriptor: &ActionDescriptor, key: &str, payload: &EventPayload) -> Value {
    match descriptor.option(key) {
        Some(v) => {
            let ctx = page.action_context(payload);
            page.evaluator().eval_value(v, &ctx)
        }
        None => Value::Null,
    }
}

/// 評価結果が文字列ならJSONとしての解釈を試みる（"5" -> 5, "[1]" -> [1]）
fn coerce_literal(value: Value) -> Value {
    match value {
        Value::String(s) => serde_json::from_str(s.trim()).unwrap_or(Value::String(s)),
        other => other,
    }
}

fn set_target_value(page: &mut Page, target: &str, value: Value) -> Result<(), ActionError> {
    page.set_value(&[target.to_string()], value)?;
    Ok(())
}

fn video_of(page: &Page, method: ControlMethod, target: &str) -> Result<NodeId, ActionError> {
    let el = element(page, target)?;
    page.document
        .query_selector(el, &[Selector::tag("video")])
        .ok_or_else(|| invalid(method, format!("no video element in {}=\"{}\"", NAME, target)))
}

pub fn invoke_control(
    page: &mut Page,
    method: ControlMethod,
    descriptor: &ActionDescriptor,
    payload: &EventPayload,
) -> Result<(), ActionError> {
    let target = descriptor.target()?.to_string();

    match method {
        ControlMethod::SetValue | ControlMethod::SetImageUrl | ControlMethod::SetPageUrl => {
            let value = coerce_literal(option_value(page, descriptor, "value", payload));
            set_target_value(page, &target, value)
        }

        ControlMethod::ScrollIntoView => {
            let el = element(page, &target)?;
            page.document.scroll_into_view(el);
            Ok(())
        }

        ControlMethod::ScrollToIndex => {
            let el = element(page, &target)?;
            let index = to_number(&option_value(page, descriptor, "value", payload));
            let children = page.document.element_children(el);
            if index.is_nan() || index < 0.0 || index as usize >= children.len() {
                return Err(invalid(method, format!("no child at index {}", index)));
            }
            page.document.scroll_into_view(children[index as usize]);
            Ok(())
        }

        ControlMethod::SetHidden => {
            let el = element(page, &target)?;
            let hidden = truthy(&option_value(page, descriptor, "value", payload));
            if let Some(node) = page.document.node_mut(el) {
                node.state.hidden = hidden;
            }
            Ok(())
        }

        ControlMethod::SetDisabled => {
            let el = element(page, &target)?;
            let disabled = truthy(&option_value(page, descriptor, "value", payload));
            let selectors: Vec<Selector> = DISABLEABLE.iter().map(|t| Selector::tag(t)).collect();
            let mut nodes = page.document.query_selector_all(el, &selectors);
            nodes.push(el);
            for node in nodes {
                if let Some(n) = page.document.node_mut(node) {
                    n.state.disabled = disabled;
                }
            }
            Ok(())
        }

        ControlMethod::Blur => {
            let el = element(page, &target)?;
            let node = page.document.query_selector(el, &focusable()).unwrap_or(el);
            if page.document.focused() == Some(node) {
                page.document.set_focus(None);
            }
            Ok(())
        }

        ControlMethod::Focus => {
            let el = element(page, &target)?;
            let node = page.document.query_selector(el, &focusable()).unwrap_or(el);
            page.document.set_focus(Some(node));
            Ok(())
        }

        ControlMethod::ClearValue => {
            let el = element(page, &target)?;
            let range = page
                .document
                .query_selector(el, &[Selector::tag("input").with_attr_eq("type", "range")]);
            let value = match range {
                Some(r) => match page.document.attribute(r, "min") {
                    Some(min) if !min.is_empty() => Value::String(min.to_string()),
                    _ => Value::from(0),
                },
                None => Value::String(String::new()),
            };
            set_target_value(page, &target, value)
        }

        ControlMethod::ResetValue => {
            element(page, &target)?;
            let default = page
                .components
                .get(&target)
                .and_then(|i| i.fields.get("defaultValue"))
                .cloned()
                .unwrap_or_else(|| Value::String(String::new()));
            let ctx = page.action_context(payload);
            let value = page.evaluator().eval_value(&default, &ctx);
            set_target_value(page, &target, value)
        }

        ControlMethod::Select => {
            let el = element(page, &target)?;
            let input = page
                .document
                .query_selector(el, &[Selector::tag("input"), Selector::tag("textarea")])
                .ok_or_else(|| invalid(method, format!("no input or textarea in {}=\"{}\"", NAME, target)))?;
            page.document.select(input);
            Ok(())
        }

        ControlMethod::Validate => {
            let instance = page.target_mut(&target)?;
            let valid = validate_instance(instance);
            log::debug!("validate {} -> {}", target, valid);
            Ok(())
        }

        ControlMethod::ClearValidation => {
            let instance = page.target_mut(&target)?;
            clear_validation(instance);
            Ok(())
        }

        ControlMethod::Click => {
            let el = element(page, &target)?;
            if page.document.query_selector(el, &clickable()).is_none() {
                log::debug!("No clickable descendant in {}, clicking the element itself", target);
            }
            page.pending.push_back(PendingWork::Click(target));
            Ok(())
        }

        ControlMethod::SetData => {
            let raw = option_value(page, descriptor, "value", payload);
            let value = match raw {
                Value::String(s) => serde_json::from_str::<Value>(&s)
                    .or_else(|_| page.evaluator().eval_expression(&s, &page.action_context(payload)))
                    .map_err(|e| invalid(method, e.to_string()))?,
                other => other,
            };
            let data = match value {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                other => return Err(invalid(method, format!("expected an object, got {}", other))),
            };
            let form = page.target_mut(&target)?;
            // 子が存在する項目は子の value へ（null は空文字）
            let data: Map<String, Value> = data
                .into_iter()
                .map(|(name, v)| {
                    if v.is_null() && form.components.contains_key(&name) {
                        (name, Value::String(String::new()))
                    } else {
                        (name, v)
                    }
                })
                .collect();
            for (name, v) in &data {
                if let Some(child) = form.components.get_mut(name) {
                    child.write_value(v.clone());
                }
            }
            form.replace_form_data(data);
            Ok(())
        }

        ControlMethod::ClearData => {
            let form = page.target_mut(&target)?;
            form.clear_form_data();
            Ok(())
        }

        ControlMethod::Submit => {
            let data_source = page.target_mut(&target)?.value_config.data_source.clone();
            if data_source.is_empty() {
                log::debug!("submit on {} has no data source", target);
            } else {
                page.pending.push_back(PendingWork::RunQuery(data_source));
            }
            Ok(())
        }

        ControlMethod::Check | ControlMethod::Uncheck => {
            element(page, &target)?;
            set_target_value(page, &target, Value::Bool(method == ControlMethod::Check))
        }

        ControlMethod::Toggle => {
            element(page, &target)?;
            let current = page.target_mut(&target)?.value.clone();
            set_target_value(page, &target, Value::Bool(!truthy(&current)))
        }

        ControlMethod::Play | ControlMethod::Pause => {
            let video = video_of(page, method, &target)?;
            if let Some(node) = page.document.node_mut(video) {
                node.state.media.playing = method == ControlMethod::Play;
            }
            Ok(())
        }

        ControlMethod::SeekTo => {
            let video = video_of(page, method, &target)?;
            let time = to_number(&option_value(page, descriptor, "value", payload));
            if time.is_nan() {
                return Err(invalid(method, "invalid time value"));
            }
            if let Some(node) = page.document.node_mut(video) {
                node.state.media.current_time = time;
            }
            Ok(())
        }

        ControlMethod::Open | ControlMethod::Close => {
            let modal = element(page, &target)?;
            set_modal_visible(page, modal, method == ControlMethod::Open);
            Ok(())
        }

        ControlMethod::SetFlipVertical | ControlMethod::SetFlipHorizontal => {
            let key = if method == ControlMethod::SetFlipVertical {
                "flipVertical"
            } else {
                "flipHorizontal"
            };
            let value = option_value(page, descriptor, key, payload);
            page.target_mut(&target)?.fields.insert(key.to_string(), value);
            Ok(())
        }

        ControlMethod::Reload => {
            let el = element(page, &target)?;
            match page.document.query_selector(el, &[Selector::tag("iframe")]) {
                Some(iframe) => {
                    let src = page.document.attribute(iframe, "src").unwrap_or("").to_string();
                    page.document.set_attribute(iframe, "src", &src);
                    if let Some(node) = page.document.node_mut(iframe) {
                        node.state.reload_count += 1;
                    }
                }
                None => log::debug!("No iframe to reload in {}", target),
            }
            Ok(())
        }

        ControlMethod::Update | ControlMethod::Export => {
            page.target_mut(&target)?;
            log::debug!("{} on {} has no runtime effect", method.name(), target);
            Ok(())
        }

        ControlMethod::AddRow => {
            let row = option_value(page, descriptor, "value", payload);
            let instance = page.target_mut(&target)?;
            let rows = match instance.value.clone() {
                Value::Array(mut rows) => {
                    rows.push(row);
                    rows
                }
                Value::Null => vec![row],
                _ => return Err(invalid(method, "value is not a list")),
            };
            instance.write_value(Value::Array(rows));
            Ok(())
        }

        ControlMethod::RemoveRow => {
            let index = to_number(&option_value(page, descriptor, "index", payload));
            let instance = page.target_mut(&target)?;
            let Value::Array(mut rows) = instance.value.clone() else {
                return Err(invalid(method, "value is not a list"));
            };
            if index.is_nan() || index < 0.0 || index as usize >= rows.len() {
                return Err(invalid(method, format!("no row at index {}", index)));
            }
            rows.remove(index as usize);
            instance.write_value(Value::Array(rows));
            Ok(())
        }

        ControlMethod::UpdateCell => {
            let index = to_number(&option_value(page, descriptor, "index", payload));
            let key = option_value(page, descriptor, "key", payload);
            let value = option_value(page, descriptor, "value", payload);
            let Some(key) = key.as_str().map(str::to_string) else {
                return Err(ActionError::MissingOption("key"));
            };
            let instance = page.target_mut(&target)?;
            let mut rows = match instance.value.clone() {
                Value::Array(rows) if !index.is_nan() && index >= 0.0 => rows,
                _ => return Err(invalid(method, format!("no row at index {}", index))),
            };
            match rows.get_mut(index as usize) {
                Some(Value::Object(cells)) => {
                    cells.insert(key, value);
                }
                _ => return Err(invalid(method, format!("no row at index {}", index))),
            }
            instance.write_value(Value::Array(rows));
            Ok(())
        }

        ControlMethod::SetContent => {
            let content = option_value(page, descriptor, "value", payload);
            page.target_mut(&target)?.fields.insert("content".into(), content);
            Ok(())
        }
    }
}

/// モーダルの表示切り替え（hidden クラスと aria-hidden）
pub fn set_modal_visible(page: &mut Page, modal: NodeId, visible: bool) {
    if visible {
        page.document.remove_class(modal, "hidden");
        page.document.set_attribute(modal, "aria-hidden", "false");
    } else {
        page.document.add_class(modal, "hidden");
        page.document.set_attribute(modal, "aria-hidden", "true");
    }
}

fn modal_node(page: &Page, name: &str) -> Result<NodeId, ResolutionError> {
    page.document
        .find_by_attribute(NAME, name)
        .ok_or_else(|| ResolutionError::Element(name.to_string()))
}

pub fn show_modal(page: &mut Page, name: &str) -> Result<(), ResolutionError> {
    let modal = modal_node(page, name)?;
    set_modal_visible(page, modal, true);
    Ok(())
}

pub fn hide_modal(page: &mut Page, name: &str) -> Result<(), ResolutionError> {
    let modal = modal_node(page, name)?;
    set_modal_visible(page, modal, false);
    Ok(())
}

pub fn toggle_modal(page: &mut Page, name: &str) -> Result<(), ResolutionError> {
    let modal = modal_node(page, name)?;
    page.document.toggle_class(modal, "hidden");
    Ok(())
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// required なのに空の値を invalid にする。子を持つ場合は子を検査する
fn validate_instance(instance: &mut ComponentInstance) -> bool {
    if !instance.components.is_empty() {
        let mut valid = true;
        for child in instance.components.values_mut() {
            valid &= validate_instance(child);
        }
        instance.fields.insert("invalid".into(), Value::Bool(!valid));
        return valid;
    }
    let required = instance.fields.get("required").map(truthy).unwrap_or(false);
    let valid = !(required && is_blank(&instance.value));
    instance.fields.insert("invalid".into(), Value::Bool(!valid));
    valid
}

fn clear_validation(instance: &mut ComponentInstance) {
    instance.fields.remove("invalid");
    for child in instance.components.values_mut() {
        clear_validation(child);
    }
}
