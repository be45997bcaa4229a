// src/engine/core/component.rs
// コンポーネントのマウント（ブロック定義 → インスタンス → ノードへの紐付け）

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::dom_renderer::{NodeId, Selector};
use crate::engine::constants::{
    CHART, COMPONENT_ID, COMPONENT_NAME, COMPONENT_TYPE, COMPOSITE_CHILD, COMPOSITE_COMPONENT, NAME,
    TABLE,
};
use crate::engine::core::event::{ActionDescriptor, EventPayload, run_descriptors};
use crate::engine::error::{ResolutionError, RuntimeError};
use crate::engine::runtime::Runtime;
use crate::engine::state::{Block, ComponentInstance, InstancePath, Page, parse_event_handlers};

/// block.js の中身
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComponentDefinition {
    /// オブジェクトリテラル、またはオブジェクトを返す式
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub watch: Value,
    #[serde(default)]
    pub mounted: Vec<ActionDescriptor>,
}

impl ComponentDefinition {
    pub fn parse(block: &Block) -> Result<Self, RuntimeError> {
        serde_json::from_str(&block.js).map_err(|e| RuntimeError::Definition {
            block: block.id.clone(),
            message: e.to_string(),
        })
    }

    /// data の初期値を作る（式の場合は毎回評価するのでインスタンスごとに新しい値になる）
    pub fn data_object(&self, page: &Page) -> Map<String, Value> {
        match &self.data {
            Value::Object(map) => map.clone(),
            Value::String(code) => {
                let context = json!({
                    "source": Value::Object(page.source.clone()),
                    "component": page.components_value(),
                });
                match page.evaluator().eval_expression(code, &context) {
                    Ok(Value::Object(map)) => map,
                    Ok(other) => {
                        log::warn!("data factory returned a non-object: {}", other);
                        Map::new()
                    }
                    Err(e) => {
                        log::warn!("data factory '{}' failed: {}", code, e);
                        Map::new()
                    }
                }
            }
            Value::Null => Map::new(),
            other => {
                log::warn!("Ignoring non-object data definition: {}", other);
                Map::new()
            }
        }
    }
}

fn has_definition(block: &Block) -> bool {
    !block.js.trim().is_empty()
}

/// 新しいインスタンスを作ってノードに紐付ける（mountNewVueApp 相当）
/// data-component-name やブロック定義が無いノードは何もしない
pub fn attach_new(
    page: &mut Page,
    name: &str,
    scope: &[String],
    node: NodeId,
    block: Option<&Block>,
) -> Result<bool, RuntimeError> {
    let attrs = page.document.attributes(node);
    if !attrs.contains_key(COMPONENT_NAME) {
        return Ok(false);
    }
    let block = match block {
        Some(b) => Some(b.clone()),
        None => attrs
            .get(COMPONENT_ID)
            .and_then(|id| page.resources.block(id))
            .cloned(),
    };
    let Some(block) = block.filter(has_definition) else {
        log::debug!("No definition to mount for {}", name);
        return Ok(false);
    };
    let definition = ComponentDefinition::parse(&block)?;

    let mut instance = match attrs.get(COMPOSITE_CHILD) {
        Some(child_key) => composite_child(page, node, child_key)?,
        None => {
            let prior = page.scope(scope).and_then(|s| s.get(name));
            let mut map = definition.data_object(page);
            map.insert("componentName".into(), Value::String(name.to_string()));
            map.insert(
                "valueConfig".into(),
                prior
                    .map(|p| p.value_config.to_value())
                    .unwrap_or_else(|| json!({ "dataSource": "", "dataSourceType": "" })),
            );
            map.insert("events".into(), json!({}));
            map.insert("eventHandlers".into(), json!({}));

            let keep = |key: &str| prior.and_then(|p| p.fields.get(key)).cloned().unwrap_or_else(|| json!([]));
            match attrs.get(COMPONENT_TYPE).map(String::as_str) {
                Some(CHART) => {
                    map.insert("series".into(), keep("series"));
                    map.insert("seriesList".into(), keep("seriesList"));
                }
                Some(TABLE) => {
                    map.insert("column".into(), keep("column"));
                    map.insert("columnList".into(), keep("columnList"));
                }
                _ => {}
            }
            ComponentInstance::from_value(&Value::Object(map))
        }
    };
    instance.watch = parse_event_handlers(&definition.watch);
    instance.mounted = definition.mounted;
    // マウント前の書き込みは watch の対象外
    instance.take_changes();

    let target = page
        .scope_mut(scope)
        .ok_or_else(|| ResolutionError::Component(scope.join(".")))?;
    target.insert(name.to_string(), instance);

    let mut path: InstancePath = scope.to_vec();
    path.push(name.to_string());
    finish_mount(page, node, path);
    Ok(true)
}

/// コンポジットの子: 親テンプレートの子の深いコピー
fn composite_child(page: &Page, node: NodeId, child_key: &str) -> Result<ComponentInstance, ResolutionError> {
    let parent_id = page
        .document
        .closest(node, &Selector::attr(COMPOSITE_COMPONENT))
        .and_then(|parent| page.document.attribute(parent, COMPONENT_ID))
        .unwrap_or_default()
        .to_string();
    let composite = page
        .resources
        .composite(&parent_id)
        .ok_or_else(|| ResolutionError::Composite(parent_id.clone()))?;
    let template = composite
        .components
        .get(child_key)
        .ok_or_else(|| ResolutionError::Composite(format!("{}.{}", parent_id, child_key)))?;
    Ok(ComponentInstance::from_value(template))
}

/// ストアに既にあるインスタンスをノードに紐付ける（mountExistingVueApp 相当）
pub fn attach_existing(page: &mut Page, node: NodeId, scope: &[String]) -> Result<bool, RuntimeError> {
    let Some(name) = page.document.attribute(node, NAME).map(str::to_string) else {
        return Ok(false);
    };
    let block = page
        .document
        .attribute(node, COMPONENT_ID)
        .and_then(|id| page.resources.block(id))
        .cloned();
    let Some(block) = block.filter(has_definition) else {
        log::debug!("No definition to mount for {}", name);
        return Ok(false);
    };
    let definition = ComponentDefinition::parse(&block)?;

    let instance = page
        .scope_mut(scope)
        .and_then(|s| s.get_mut(&name))
        .ok_or_else(|| ResolutionError::Component(name.clone()))?;
    instance.watch = parse_event_handlers(&definition.watch);
    instance.mounted = definition.mounted;
    // マウント前の書き込みは watch の対象外
    instance.take_changes();

    let mut path: InstancePath = scope.to_vec();
    path.push(name);
    finish_mount(page, node, path);
    Ok(true)
}

/// ノードとの紐付けを記録し mounted フックを実行する（以前の紐付けは置き換える）
fn finish_mount(page: &mut Page, node: NodeId, path: InstancePath) {
    log::debug!("🔗 mounted {} on node {}", path.join("."), node);
    page.mounts.insert(node, path.clone());
    let mounted = page.instance(&path).map(|i| i.mounted.clone()).unwrap_or_default();
    if !mounted.is_empty() {
        let payload = EventPayload {
            component: path,
            event_type: "mounted".into(),
            detail: Value::Null,
        };
        run_descriptors(page, &mounted, &payload);
    }
}

pub fn report_mount_error(name: &str, error: &RuntimeError) {
    match error {
        RuntimeError::Resolution(_) => log::warn!("Mount of {} skipped: {}", name, error),
        _ => log::error!("Mount of {} failed: {}", name, error),
    }
}

// ========================================
// リソース注入と非同期マウント
// ========================================

/// ブロックのスクリプト・スタイルを head に注入する（同じURLはページごとに一度だけ）
pub async fn inject_block_resources(rt: &Runtime, block: &Block) {
    for script in &block.resources.scripts {
        let fresh = {
            let mut page = rt.page.borrow_mut();
            if page.injected.insert(script.clone()) {
                let head = page.document.head();
                let el = page.document.create_element("script");
                page.document.set_attribute(el, "src", script);
                page.document.append_child(head, el);
                true
            } else {
                false
            }
        };
        if fresh {
            if let Err(e) = rt.loader.load_script(script).await {
                log::error!("Failed to load script {}: {}", script, e);
            }
        }
    }

    for style in &block.resources.styles {
        let fresh = {
            let mut page = rt.page.borrow_mut();
            if page.injected.insert(style.clone()) {
                let head = page.document.head();
                let el = page.document.create_element("link");
                page.document.set_attribute(el, "rel", "stylesheet");
                page.document.set_attribute(el, "href", style);
                page.document.append_child(head, el);
                true
            } else {
                false
            }
        };
        if fresh {
            if let Err(e) = rt.loader.load_style(style).await {
                log::error!("Failed to load style {}: {}", style, e);
            }
        }
    }
}

fn block_for(rt: &Runtime, node: NodeId, block: Option<Block>) -> Option<Block> {
    block.or_else(|| {
        let page = rt.page.borrow();
        page.document
            .attribute(node, COMPONENT_ID)
            .and_then(|id| page.resources.block(id))
            .cloned()
    })
}

/// リソースを読み込んでから新しいインスタンスをマウントする
pub async fn mount_new(rt: &Runtime, name: &str, scope: &[String], node: NodeId, block: Option<Block>) -> bool {
    let block = block_for(rt, node, block);
    if let Some(b) = &block {
        inject_block_resources(rt, b).await;
    }
    let result = attach_new(&mut rt.page.borrow_mut(), name, scope, node, block.as_ref());
    match result {
        Ok(mounted) => mounted,
        Err(e) => {
            report_mount_error(name, &e);
            false
        }
    }
}

/// リソースを読み込んでから既存のインスタンスをマウントする
pub async fn mount_existing(rt: &Runtime, node: NodeId, scope: &[String]) -> bool {
    let block = block_for(rt, node, None);
    if let Some(b) = &block {
        inject_block_resources(rt, b).await;
    }
    let name = rt
        .page
        .borrow()
        .document
        .attribute(node, NAME)
        .unwrap_or_default()
        .to_string();
    let result = attach_existing(&mut rt.page.borrow_mut(), node, scope);
    match result {
        Ok(mounted) => mounted,
        Err(e) => {
            report_mount_error(&name, &e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::runtime::testing::runtime_with;
    use crate::engine::transport::FixtureTransport;
    use crate::engine::transport::testing::RecordingHost;
    use crate::parser::parse_markup;
    use std::rc::Rc;

    fn block(id: &str, js: Value) -> Block {
        Block {
            id: id.into(),
            js: js.to_string(),
            ..Default::default()
        }
    }

    fn page(markup: &str, blocks: Vec<Block>) -> Page {
        let mut page = Page::new(parse_markup(markup).unwrap(), Rc::new(RecordingHost::default()));
        page.resources.blocks = blocks;
        page
    }

    fn node(page: &Page, name: &str) -> NodeId {
        page.document.find_by_attribute(NAME, name).unwrap()
    }

    #[test]
    fn test_attach_new_merges_prior_state() {
        let mut p = page(
            r#"<div data-name="chart1" data-component-name="chart" data-component-id="b1" data-component-type="chart"></div>"#,
            vec![block("b1", json!({ "data": { "value": 0, "title": "Sales" } }))],
        );
        let mut prior = ComponentInstance::new("chart1");
        prior.value_config.data_source = "sales".into();
        prior.fields.insert("series".into(), json!([{ "name": "a" }]));
        prior.value = json!(99);
        p.components.insert("chart1".into(), prior);

        let n = node(&p, "chart1");
        assert!(attach_new(&mut p, "chart1", &[], n, None).unwrap());

        let inst = &p.components["chart1"];
        assert_eq!(inst.component_name, "chart1");
        assert_eq!(inst.value, json!(0));
        assert_eq!(inst.value_config.data_source, "sales");
        assert_eq!(inst.fields["series"], json!([{ "name": "a" }]));
        assert_eq!(inst.fields["seriesList"], json!([]));
        assert_eq!(inst.fields["title"], json!("Sales"));
        assert!(inst.event_handlers().is_empty());
        assert_eq!(p.mounts[&n], vec!["chart1".to_string()]);
    }

    #[test]
    fn test_data_factory_expression() {
        let mut p = page(
            r#"<div data-name="t" data-component-name="text" data-component-id="b1"></div>"#,
            vec![block("b1", json!({ "data": "{ value: source.greeting, count: 1 + 1 }" }))],
        );
        p.source.insert("greeting".into(), json!("hi"));
        let n = node(&p, "t");
        attach_new(&mut p, "t", &[], n, None).unwrap();
        assert_eq!(p.components["t"].value, json!("hi"));
        assert_eq!(p.components["t"].fields["count"], json!(2));
    }

    #[test]
    fn test_nodes_without_definition_are_skipped() {
        let mut p = page(
            r#"<div data-name="a"></div><div data-name="b" data-component-name="text" data-component-id="zz"></div>"#,
            vec![],
        );
        let a = node(&p, "a");
        let b = node(&p, "b");
        assert!(!attach_new(&mut p, "a", &[], a, None).unwrap());
        assert!(!attach_new(&mut p, "b", &[], b, None).unwrap());
        assert!(p.components.is_empty());
    }

    #[test]
    fn test_malformed_definition_is_an_error() {
        let mut p = page(
            r#"<div data-name="a" data-component-name="text" data-component-id="b1"></div>"#,
            vec![Block { id: "b1".into(), js: "{ data() { return {} } }".into(), ..Default::default() }],
        );
        let a = node(&p, "a");
        assert!(matches!(
            attach_new(&mut p, "a", &[], a, None),
            Err(RuntimeError::Definition { .. })
        ));
    }

    #[test]
    fn test_composite_child_is_deep_copy() {
        let mut p = page(
            r#"<div data-composite-component data-component-id="c1">
                 <div data-name="c1title" data-component-name="text" data-component-id="b1" data-composite-child="title"></div>
               </div>"#,
            vec![block("b1", json!({ "data": { "value": "ignored" } }))],
        );
        p.resources.merge(&json!({
            "compositeComponents": [{ "id": "c1", "components": { "title": { "componentName": "title", "value": "Hello" } } }]
        }));
        let n = node(&p, "c1title");
        attach_new(&mut p, "c1title", &[], n, None).unwrap();
        assert_eq!(p.components["c1title"].value, json!("Hello"));
        assert_eq!(p.components["c1title"].component_name, "title");

        p.components.get_mut("c1title").unwrap().value = json!("changed");
        let template = &p.resources.composite("c1").unwrap().components["title"];
        assert_eq!(template["value"], json!("Hello"));
    }

    #[test]
    fn test_attach_existing_runs_mounted_hook() {
        let mut p = page(
            r#"<div data-name="input1" data-component-name="input" data-component-id="b1"></div>"#,
            vec![block(
                "b1",
                json!({
                    "data": {},
                    "watch": { "value": [{ "action": "setVariable", "key": "changed", "value": true }] },
                    "mounted": [{ "action": "setVariable", "key": "ready", "value": "{{component.input1.value}}" }]
                }),
            )],
        );
        let mut inst = ComponentInstance::new("input");
        inst.value = json!("typed");
        p.components.insert("input1".into(), inst);

        let n = node(&p, "input1");
        assert!(attach_existing(&mut p, n, &[]).unwrap());
        assert_eq!(p.source["ready"], json!("typed"));
        assert!(p.components["input1"].watch.contains_key("value"));

        p.set_value(&["input1".to_string()], json!("new")).unwrap();
        let work = p.pending.iter().find(|w| matches!(w, crate::engine::state::PendingWork::Watch { .. })).cloned();
        assert!(work.is_some());
    }

    #[test]
    fn test_attach_existing_requires_instance() {
        let mut p = page(
            r#"<div data-name="ghost" data-component-name="text" data-component-id="b1"></div>"#,
            vec![block("b1", json!({ "data": {} }))],
        );
        let n = node(&p, "ghost");
        assert!(matches!(
            attach_existing(&mut p, n, &[]),
            Err(RuntimeError::Resolution(ResolutionError::Component(_)))
        ));
    }

    #[tokio::test]
    async fn test_resources_are_injected_once() {
        let (rt, _) = runtime_with(
            r#"<html><head></head><body><div data-name="a" data-component-name="text" data-component-id="b1"></div></body></html>"#,
            FixtureTransport::new(),
        );
        let mut b = block("b1", json!({ "data": {} }));
        b.resources.scripts = vec!["/lib.js".into()];
        b.resources.styles = vec!["/lib.css".into()];
        rt.page.borrow_mut().resources.blocks = vec![b.clone()];

        inject_block_resources(&rt, &b).await;
        inject_block_resources(&rt, &b).await;
        let n = rt.page.borrow().document.find_by_attribute(NAME, "a").unwrap();
        assert!(mount_new(&rt, "a", &[], n, None).await);

        let page = rt.page.borrow();
        let head = page.document.query_selector(page.document.root(), &[Selector::tag("head")]).unwrap();
        let html = page.document.inner_html(head);
        assert_eq!(html.matches("/lib.js").count(), 1);
        assert_eq!(html.matches("/lib.css").count(), 1);
        assert_eq!(page.injected.len(), 2);
    }
}
