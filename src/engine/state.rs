// ========================================
// コンポーネントインスタンスとページ状態
// ========================================
//
// ページ上の全ての可変状態（ドキュメント、コンポーネントストア、Source名前空間、
// ページリソース）を一つの Page が所有する。グローバルなレジストリは持たない。

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};

use crate::dom_renderer::{Document, NodeId};
use crate::engine::core::event::{
    ActionDescriptor, CompiledEvents, EventPayload, compile_event_listeners, run_descriptors,
};
use crate::engine::error::ResolutionError;
use crate::engine::helper_call::HelperTable;
use crate::engine::query::Query;
use crate::engine::template::Evaluator;
use crate::engine::transport::Host;

/// 名前 → インスタンス（リスト・フォーム・コンポジットの子も同じ形）
pub type ComponentMap = BTreeMap<String, ComponentInstance>;

/// チャンネル → アクション記述子の列（登録順）
pub type EventHandlers = BTreeMap<String, Vec<ActionDescriptor>>;

/// ストア内のインスタンスへのパス（[リスト名, 行コンポーネント名] など）
pub type InstancePath = Vec<String>;

/// 文字列・数値どちらで来ても文字列として受け取る
pub fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let v = Value::deserialize(d)?;
    Ok(match v {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

// ========================================
// ページリソース
// ========================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockResources {
    #[serde(default)]
    pub scripts: Vec<String>,
    #[serde(default)]
    pub styles: Vec<String>,
}

/// コンポーネント定義（js はJSONの定義文書）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default)]
    pub js: String,
    #[serde(default)]
    pub resources: BlockResources,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositeComponent {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,
    /// 子キー → テンプレートとなるインスタンス（マウント時に深いコピーを取る）
    #[serde(default)]
    pub components: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResource {
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub composite_components: Vec<CompositeComponent>,
    #[serde(default)]
    pub assets: Map<String, Value>,
}

impl PageResource {
    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn composite(&self, id: &str) -> Option<&CompositeComponent> {
        self.composite_components.iter().find(|c| c.id == id)
    }

    /// 取得したペイロードを上書きマージする（Object.assign 相当）
    pub fn merge(&mut self, payload: &Value) {
        let Some(obj) = payload.as_object() else {
            return;
        };
        if let Some(blocks) = obj.get("blocks") {
            match serde_json::from_value(blocks.clone()) {
                Ok(blocks) => self.blocks = blocks,
                Err(e) => log::warn!("Ignoring malformed blocks payload: {}", e),
            }
        }
        if let Some(composites) = obj.get("compositeComponents") {
            match serde_json::from_value(composites.clone()) {
                Ok(composites) => self.composite_components = composites,
                Err(e) => log::warn!("Ignoring malformed compositeComponents payload: {}", e),
            }
        }
        if let Some(Value::Object(assets)) = obj.get("assets") {
            self.assets = assets.clone();
        }
    }
}

// ========================================
// コンポーネントインスタンス
// ========================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueConfig {
    #[serde(default, deserialize_with = "lenient_string")]
    pub data_source: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub data_source_type: String,
    /// 投影フィールド（value: "{{item.name}}" など）
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ValueConfig {
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|e| {
            log::warn!("Ignoring malformed valueConfig: {}", e);
            Self::default()
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// ページ上で生きているコンポーネントの状態
#[derive(Clone, Default)]
pub struct ComponentInstance {
    pub component_name: String,
    pub value: Value,
    pub value_config: ValueConfig,
    pub events: Value,
    event_handlers: EventHandlers,
    // event_handlers から導出される。直接は書き換えない
    event: CompiledEvents,
    pub components: ComponentMap,
    // data アクセサ: ここに含まれる名前は components[name].value を読み書きする
    form_fields: BTreeSet<String>,
    form_data: Map<String, Value>,
    /// データファクトリ由来の自由なフィールド（series, column, defaultValue など）
    pub fields: Map<String, Value>,
    pub watch: BTreeMap<String, Vec<ActionDescriptor>>,
    pub mounted: Vec<ActionDescriptor>,
    // 前回の queue_watches 以降に書き換えられたフィールド
    changed: BTreeSet<String>,
}

impl fmt::Debug for ComponentInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let compiled: BTreeMap<&String, Vec<&String>> =
            self.event.iter().map(|(k, v)| (k, v.keys().collect())).collect();
        f.debug_struct("ComponentInstance")
            .field("component_name", &self.component_name)
            .field("value", &self.value)
            .field("value_config", &self.value_config)
            .field("event_handlers", &self.event_handlers)
            .field("event", &compiled)
            .field("components", &self.components)
            .field("form_fields", &self.form_fields)
            .field("fields", &self.fields)
            .finish()
    }
}

impl ComponentInstance {
    pub fn new(component_name: &str) -> Self {
        Self {
            component_name: component_name.to_string(),
            ..Default::default()
        }
    }

    /// JSONオブジェクトからインスタンスを作る（オブジェクト以外は空のインスタンス）
    pub fn from_value(value: &Value) -> Self {
        let mut instance = Self::default();
        if let Value::Object(map) = value {
            instance.assign(map);
        }
        instance
    }

    /// フィールドを上書きする（Object.assign 相当）
    pub fn assign(&mut self, map: &Map<String, Value>) {
        for (key, value) in map {
            match key.as_str() {
                "componentName" => {
                    if let Some(s) = value.as_str() {
                        self.component_name = s.to_string();
                    }
                }
                "value" => self.write_value(value.clone()),
                "valueConfig" => self.value_config = ValueConfig::from_value(value),
                "events" => self.events = value.clone(),
                "eventHandlers" => self.set_event_handlers(parse_event_handlers(value)),
                "event" => {
                    log::debug!("Ignoring direct write to compiled 'event' of {}", self.component_name);
                }
                "components" => {
                    if let Value::Object(children) = value {
                        self.components = children
                            .iter()
                            .map(|(k, v)| (k.clone(), ComponentInstance::from_value(v)))
                            .collect();
                    }
                }
                "data" => {
                    if let Value::Object(data) = value {
                        for (k, v) in data {
                            self.form_data_set(k, v.clone());
                        }
                    }
                }
                _ => {
                    self.fields.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// JSON表現（コンパイル済みイベントはチャンネル → イベント種別名の一覧として出力）
    pub fn to_value(&self) -> Value {
        let mut map = self.fields.clone();
        map.insert("componentName".into(), Value::String(self.component_name.clone()));
        map.insert("value".into(), self.value.clone());
        map.insert("valueConfig".into(), self.value_config.to_value());
        map.insert(
            "events".into(),
            if self.events.is_null() { json!({}) } else { self.events.clone() },
        );
        map.insert(
            "eventHandlers".into(),
            serde_json::to_value(&self.event_handlers).unwrap_or_else(|_| json!({})),
        );
        let compiled: Map<String, Value> = self
            .event
            .iter()
            .map(|(channel, types)| (channel.clone(), json!(types.keys().collect::<Vec<_>>())))
            .collect();
        map.insert("event".into(), Value::Object(compiled));
        if !self.components.is_empty() {
            let children: Map<String, Value> = self
                .components
                .iter()
                .map(|(k, v)| (k.clone(), v.to_value()))
                .collect();
            map.insert("components".into(), Value::Object(children));
        }
        if !self.form_fields.is_empty() || !self.form_data.is_empty() {
            map.insert("data".into(), Value::Object(self.form_data()));
        }
        Value::Object(map)
    }

    /// value を書き換える。値が変わった場合は watch の対象として記録する
    pub fn write_value(&mut self, value: Value) {
        if self.value != value {
            self.changed.insert("value".into());
        }
        self.value = value;
    }

    /// 記録された変更を取り出す
    pub fn take_changes(&mut self) -> BTreeSet<String> {
        std::mem::take(&mut self.changed)
    }

    // ========================================
    // イベントハンドラー
    // ========================================

    pub fn event_handlers(&self) -> &EventHandlers {
        &self.event_handlers
    }

    /// コンパイル済みハンドラー（event_handlers の関数）
    pub fn event(&self) -> &CompiledEvents {
        &self.event
    }

    /// ハンドラー表を置き換え、即座に再コンパイルする
    pub fn set_event_handlers(&mut self, handlers: EventHandlers) {
        self.event = compile_event_listeners(&handlers);
        self.event_handlers = handlers;
    }

    pub fn push_event_handler(&mut self, channel: &str, descriptor: ActionDescriptor) {
        let mut handlers = std::mem::take(&mut self.event_handlers);
        handlers.entry(channel.to_string()).or_default().push(descriptor);
        self.set_event_handlers(handlers);
    }

    pub fn clear_event_handlers(&mut self) {
        self.set_event_handlers(EventHandlers::new());
    }

    // ========================================
    // フォームデータ
    // ========================================

    /// data[name] を components[name].value に結び付ける
    /// 子コンポーネントが存在しない場合は結び付けない
    pub fn bind_form_field(&mut self, name: &str) -> bool {
        if !self.components.contains_key(name) {
            return false;
        }
        self.form_data.remove(name);
        self.form_fields.insert(name.to_string());
        true
    }

    pub fn is_form_field(&self, name: &str) -> bool {
        self.form_fields.contains(name)
    }

    pub fn form_data_get(&self, name: &str) -> Option<Value> {
        if self.form_fields.contains(name) {
            return Some(
                self.components
                    .get(name)
                    .map(|c| c.value.clone())
                    .unwrap_or(Value::Null),
            );
        }
        self.form_data.get(name).cloned()
    }

    pub fn form_data_set(&mut self, name: &str, value: Value) {
        if self.form_fields.contains(name) {
            if let Some(child) = self.components.get_mut(name) {
                child.write_value(value);
                return;
            }
        }
        self.form_data.insert(name.to_string(), value);
    }

    /// data オブジェクト全体（アクセサの値は現在の子の値）
    pub fn form_data(&self) -> Map<String, Value> {
        let mut data = self.form_data.clone();
        for name in &self.form_fields {
            data.insert(name.clone(), self.form_data_get(name).unwrap_or(Value::Null));
        }
        data
    }

    /// data を置き換える（アクセサは残し、それ以外の値は捨てる）
    pub fn replace_form_data(&mut self, data: Map<String, Value>) {
        self.form_data.clear();
        for (k, v) in data {
            self.form_data_set(&k, v);
        }
    }

    pub fn clear_form_data(&mut self) {
        for child in self.components.values_mut() {
            child.write_value(Value::String(String::new()));
        }
        self.form_data.clear();
    }
}

fn collect_changes(map: &mut ComponentMap, prefix: &mut InstancePath, out: &mut Vec<(InstancePath, String)>) {
    for (name, instance) in map.iter_mut() {
        prefix.push(name.clone());
        for field in instance.take_changes() {
            if instance.watch.contains_key(&field) {
                out.push((prefix.clone(), field));
            }
        }
        collect_changes(&mut instance.components, prefix, out);
        prefix.pop();
    }
}

/// eventHandlers のJSONを読み取る（壊れた記述子は読み飛ばす）
pub fn parse_event_handlers(value: &Value) -> EventHandlers {
    let mut handlers = EventHandlers::new();
    let Some(channels) = value.as_object() else {
        return handlers;
    };
    for (channel, list) in channels {
        let descriptors = list
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match serde_json::from_value::<ActionDescriptor>(item.clone()) {
                        Ok(d) => Some(d),
                        Err(e) => {
                            log::warn!("Skipping malformed action descriptor on '{}': {}", channel, e);
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        handlers.insert(channel.clone(), descriptors);
    }
    handlers
}

// ========================================
// ページ状態
// ========================================

/// イベントハンドラーの外で処理する必要がある仕事
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWork {
    /// 名前付きクエリの実行（controlQuery, submit）
    RunQuery(String),
    /// Sourceのキーが書き換えられた（リストの再描画）
    SourceChanged(String),
    /// コンポーネントのクリックを発火
    Click(String),
    /// watch フックの実行
    Watch { path: InstancePath, field: String },
}

pub struct Page {
    pub document: Document,
    pub components: ComponentMap,
    pub source: Map<String, Value>,
    pub resources: PageResource,
    pub queries: Vec<Query>,
    pub helpers: Rc<HelperTable>,
    pub host: Rc<dyn Host>,
    /// ノード → マウントされているインスタンス
    pub mounts: HashMap<NodeId, InstancePath>,
    pub pending: VecDeque<PendingWork>,
    /// リストコンテナごとの描画世代（最後に始まった描画が勝つ）
    pub generations: HashMap<NodeId, u64>,
    /// リストコンテナ → 切り離して保持している行テンプレート
    pub list_templates: HashMap<NodeId, NodeId>,
    /// 注入済みのスクリプト・スタイルURL
    pub injected: HashSet<String>,
    /// 発行済みのページイベント
    pub page_events: Vec<String>,
}

impl Page {
    pub fn new(document: Document, host: Rc<dyn Host>) -> Self {
        Self {
            document,
            components: ComponentMap::new(),
            source: Map::new(),
            resources: PageResource::default(),
            queries: Vec::new(),
            helpers: Rc::new(HelperTable::with_builtins()),
            host,
            mounts: HashMap::new(),
            pending: VecDeque::new(),
            generations: HashMap::new(),
            list_templates: HashMap::new(),
            injected: HashSet::new(),
            page_events: Vec::new(),
        }
    }

    // ========================================
    // ストアへのアクセス
    // ========================================

    pub fn scope(&self, scope: &[String]) -> Option<&ComponentMap> {
        let mut map = &self.components;
        for key in scope {
            map = &map.get(key)?.components;
        }
        Some(map)
    }

    pub fn scope_mut(&mut self, scope: &[String]) -> Option<&mut ComponentMap> {
        let mut map = &mut self.components;
        for key in scope {
            map = &mut map.get_mut(key)?.components;
        }
        Some(map)
    }

    pub fn instance(&self, path: &[String]) -> Option<&ComponentInstance> {
        let (last, parent) = path.split_last()?;
        self.scope(parent)?.get(last)
    }

    pub fn instance_mut(&mut self, path: &[String]) -> Option<&mut ComponentInstance> {
        let (last, parent) = path.split_last()?;
        self.scope_mut(parent)?.get_mut(last)
    }

    /// トップレベルのインスタンス（アクションの targetComponent）
    pub fn target_mut(&mut self, name: &str) -> Result<&mut ComponentInstance, ResolutionError> {
        self.components
            .get_mut(name)
            .ok_or_else(|| ResolutionError::Component(name.to_string()))
    }

    /// ストアをJSONとして取得
    pub fn components_value(&self) -> Value {
        Value::Object(
            self.components
                .iter()
                .map(|(k, v)| (k.clone(), v.to_value()))
                .collect(),
        )
    }

    /// value を書き換え、watch に登録があれば実行を予約する
    pub fn set_value(&mut self, path: &[String], value: Value) -> Result<(), ResolutionError> {
        let name = path.last().cloned().unwrap_or_default();
        let instance = self
            .instance_mut(path)
            .ok_or_else(|| ResolutionError::Component(name))?;
        instance.write_value(value);
        self.queue_watches();
        Ok(())
    }

    /// 書き換えられたフィールドのうち watch に登録があるものの実行を予約する
    /// どの経路で書き換えても（set_value, data アクセサ, setData など）ここで拾われる
    pub fn queue_watches(&mut self) {
        let mut found = Vec::new();
        collect_changes(&mut self.components, &mut Vec::new(), &mut found);
        for (path, field) in found {
            let work = PendingWork::Watch { path, field };
            if !self.pending.contains(&work) {
                self.pending.push_back(work);
            }
        }
    }

    // ========================================
    // Source名前空間
    // ========================================

    /// Sourceを書き換え、依存するリストの再描画を予約する
    pub fn set_source(&mut self, key: &str, value: Value) {
        self.source.insert(key.to_string(), value);
        self.pending.push_back(PendingWork::SourceChanged(key.to_string()));
    }

    // ========================================
    // 評価
    // ========================================

    pub fn evaluator(&self) -> Evaluator<'_> {
        Evaluator::new(&self.helpers, &self.source)
    }

    /// アクションのオプション評価に使うコンテキスト
    pub fn action_context(&self, payload: &EventPayload) -> Value {
        json!({
            "source": Value::Object(self.source.clone()),
            "component": self.components_value(),
            "event": payload.detail.clone(),
        })
    }

    // ========================================
    // イベント発火
    // ========================================

    /// ノードにマウントされたインスタンスの event[channel][event_type] を呼び出す
    pub fn fire_path(&mut self, path: &[String], channel: &str, event_type: &str, detail: Value) -> bool {
        let handler = self
            .instance(path)
            .and_then(|i| i.event().get(channel))
            .and_then(|types| types.get(event_type))
            .cloned();
        let Some(handler) = handler else {
            return false;
        };
        let payload = EventPayload {
            component: path.to_vec(),
            event_type: event_type.to_string(),
            detail,
        };
        handler(self, &payload);
        true
    }

    /// 全チャンネルの click ハンドラーを呼び出す（click 制御メソッド）
    pub fn click(&mut self, name: &str) -> bool {
        let path = vec![name.to_string()];
        let channels: Vec<String> = self
            .instance(&path)
            .map(|i| {
                i.event()
                    .iter()
                    .filter(|(_, types)| types.contains_key("click"))
                    .map(|(c, _)| c.clone())
                    .collect()
            })
            .unwrap_or_default();
        for channel in &channels {
            self.fire_path(&path, channel, "click", Value::Null);
        }
        !channels.is_empty()
    }

    /// watch フックを実行する
    pub fn run_watch(&mut self, path: &[String], field: &str) {
        let Some(descriptors) = self.instance(path).and_then(|i| i.watch.get(field)).cloned() else {
            return;
        };
        let detail = self
            .instance(path)
            .map(|i| json!({ "field": field, "value": i.value }))
            .unwrap_or(Value::Null);
        let payload = EventPayload {
            component: path.to_vec(),
            event_type: "watch".into(),
            detail,
        };
        run_descriptors(self, &descriptors, &payload);
    }

    /// リスト描画の世代を進めて返す
    pub fn next_generation(&mut self, container: NodeId) -> u64 {
        let generation = self.generations.entry(container).or_insert(0);
        *generation += 1;
        *generation
    }

    pub fn is_current_generation(&self, container: NodeId, generation: u64) -> bool {
        self.generations.get(&container) == Some(&generation)
    }

    /// 取り除いた行のノードを解放し、それらを指していた情報を捨てる
    pub fn release_nodes(&mut self, nodes: &[NodeId]) {
        let mut released = Vec::new();
        for &node in nodes {
            released.extend(self.document.remove_subtree(node));
        }
        for node in &released {
            self.mounts.remove(node);
            self.generations.remove(node);
            // 入れ子のリストのテンプレートも一緒に解放する
            if let Some(template) = self.list_templates.remove(node) {
                self.document.remove_subtree(template);
            }
        }
    }

    /// ドキュメントから外れたノードのマウント情報を捨てる
    pub fn forget_detached_mounts(&mut self) {
        let document = &self.document;
        self.mounts.retain(|node, _| document.is_connected(*node));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::transport::testing::RecordingHost;

    fn descriptor(action: &str, event: &str) -> ActionDescriptor {
        serde_json::from_value(json!({ "action": action, "event": event, "key": "k", "value": "v" })).unwrap()
    }

    #[test]
    fn test_instance_from_value_compiles_events() {
        let instance = ComponentInstance::from_value(&json!({
            "componentName": "button1",
            "value": "",
            "valueConfig": { "dataSource": "users", "dataSourceType": "query", "value": "{{item.name}}" },
            "eventHandlers": { "onClick": [
                { "event": "click", "action": "setVariable", "key": "a", "value": "1" },
                { "event": "click", "action": "noSuchAction" }
            ] },
            "label": "Save"
        }));
        assert_eq!(instance.component_name, "button1");
        assert_eq!(instance.value_config.data_source, "users");
        assert_eq!(instance.value_config.extra["value"], json!("{{item.name}}"));
        assert_eq!(instance.fields["label"], json!("Save"));
        assert_eq!(instance.event_handlers()["onClick"].len(), 2);
        assert!(instance.event()["onClick"].contains_key("click"));
    }

    #[test]
    fn test_event_is_derived_from_handlers() {
        let mut instance = ComponentInstance::new("x");
        instance.push_event_handler("onChange", descriptor("setVariable", "change"));
        assert!(instance.event()["onChange"].contains_key("change"));

        instance.assign(json!({ "event": {} }).as_object().unwrap());
        assert!(instance.event()["onChange"].contains_key("change"));

        instance.clear_event_handlers();
        assert!(instance.event().is_empty());
    }

    #[test]
    fn test_form_accessor_reads_and_writes_child_value() {
        let mut form = ComponentInstance::new("form1");
        form.components.insert("email".into(), ComponentInstance::new("email"));
        assert!(form.bind_form_field("email"));
        assert!(!form.bind_form_field("missing"));

        form.form_data_set("email", json!("a@b.c"));
        assert_eq!(form.components["email"].value, json!("a@b.c"));

        form.components.get_mut("email").unwrap().value = json!("x@y.z");
        assert_eq!(form.form_data_get("email"), Some(json!("x@y.z")));

        form.form_data_set("note", json!("plain"));
        assert_eq!(form.form_data(), *json!({ "email": "x@y.z", "note": "plain" }).as_object().unwrap());

        form.replace_form_data(json!({ "email": "new" }).as_object().unwrap().clone());
        assert_eq!(form.components["email"].value, json!("new"));
        assert_eq!(form.form_data_get("note"), None);

        form.clear_form_data();
        assert_eq!(form.form_data_get("email"), Some(json!("")));
    }

    #[test]
    fn test_value_and_data_writes_both_queue_watch() {
        let mut page = Page::new(Document::new(), Rc::new(RecordingHost::default()));
        let mut form = ComponentInstance::new("form");
        let mut email = ComponentInstance::new("input");
        email.watch = parse_event_handlers(&json!({
            "value": [{ "action": "setVariable", "key": "seen", "value": true }]
        }));
        form.components.insert("email".into(), email);
        assert!(form.bind_form_field("email"));
        page.components.insert("form1".into(), form);

        let path = vec!["form1".to_string(), "email".to_string()];
        let watch = PendingWork::Watch { path: path.clone(), field: "value".into() };

        page.set_value(&path, json!("a")).unwrap();
        assert_eq!(page.pending.drain(..).collect::<Vec<_>>(), vec![watch.clone()]);

        page.components.get_mut("form1").unwrap().form_data_set("email", json!("b"));
        page.queue_watches();
        assert_eq!(page.pending.drain(..).collect::<Vec<_>>(), vec![watch]);

        page.components.get_mut("form1").unwrap().form_data_set("email", json!("b"));
        page.queue_watches();
        assert!(page.pending.is_empty());
    }

    #[test]
    fn test_scope_paths_reach_nested_instances() {
        let mut page = Page::new(Document::new(), Rc::new(RecordingHost::default()));
        let mut list = ComponentInstance::new("list1");
        list.components.insert("text100".into(), ComponentInstance::new("text100"));
        page.components.insert("list1".into(), list);

        let path = vec!["list1".to_string(), "text100".to_string()];
        assert!(page.instance(&path).is_some());
        page.set_value(&path, json!(3)).unwrap();
        assert_eq!(page.instance(&path).unwrap().value, json!(3));
        assert!(page.set_value(&["nope".to_string()], json!(1)).is_err());
    }

    #[test]
    fn test_set_source_queues_rerender() {
        let mut page = Page::new(Document::new(), Rc::new(RecordingHost::default()));
        page.set_source("users", json!([1]));
        assert_eq!(page.pending.pop_front(), Some(PendingWork::SourceChanged("users".into())));
        assert_eq!(page.source["users"], json!([1]));
    }

    #[test]
    fn test_page_resource_merge() {
        let mut resources = PageResource::default();
        resources.merge(&json!({ "blocks": [{ "id": 7, "js": "{}" }] }));
        resources.merge(&json!({ "compositeComponents": [{ "id": "c1", "components": { "a": {} } }], "assets": { "logo": "x.png" } }));
        assert_eq!(resources.block("7").map(|b| b.js.as_str()), Some("{}"));
        assert!(resources.composite("c1").is_some());
        assert_eq!(resources.assets["logo"], json!("x.png"));
    }
}
