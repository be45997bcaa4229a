// src/engine/core/render.rs
// リストビューとフォームの描画

use std::collections::HashMap;

use futures::future::join_all;
use serde_json::Value;

use crate::dom_renderer::{NodeId, Selector};
use crate::engine::constants::{
    COMPONENT_ID, COMPONENT_NAME, COMPONENT_TYPE, FORM, FORM_ITEM, LIST_VIEW_ITEM, NAME, is_form_input,
};
use crate::engine::core::component::{attach_new, inject_block_resources, mount_existing, report_mount_error};
use crate::engine::runtime::Runtime;
use crate::engine::state::{Block, ValueConfig};

/// 行ごとのマウント作業
struct RowJob {
    name: String,
    node: NodeId,
    block: Option<Block>,
    value_config: Option<ValueConfig>,
    item: Value,
}

/// リストビューを全て描き直す（テンプレート行の複製 → 行ごとのマウント → 値の投影）
/// マウントしたインスタンスの数を返す
pub async fn render_list_view(rt: &Runtime, container: NodeId) -> usize {
    let Some((list_name, generation, jobs)) = plan_list_view(rt, container) else {
        return 0;
    };

    let scope = vec![list_name];
    let results = join_all(jobs.into_iter().map(|job| {
        let scope = &scope;
        async move {
            if let Some(block) = &job.block {
                inject_block_resources(rt, block).await;
            }
            let mut page = rt.page.borrow_mut();
            // 後から始まった描画があればこの行は捨てる
            if !page.is_current_generation(container, generation) {
                log::debug!("Dropping stale row {} (generation {})", job.name, generation);
                return false;
            }
            match attach_new(&mut page, &job.name, scope, job.node, job.block.as_ref()) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    report_mount_error(&job.name, &e);
                    return false;
                }
            }
            if let Some(config) = &job.value_config {
                let evaluated = page.evaluator().eval_value(&config.to_value(), &job.item);
                let mut path = scope.clone();
                path.push(job.name.clone());
                if let (Value::Object(fields), Some(instance)) = (evaluated, page.instance_mut(&path)) {
                    instance.assign(&fields);
                }
            }
            true
        }
    }))
    .await;

    let mounted = results.into_iter().filter(|ok| *ok).count();
    log::debug!("📜 list {} rendered {} instances", scope[0], mounted);
    mounted
}

/// 同期部分: キャッシュの作成、行の複製、ドキュメントの置き換え
fn plan_list_view(rt: &Runtime, container: NodeId) -> Option<(String, u64, Vec<RowJob>)> {
    let mut page = rt.page.borrow_mut();
    let list_name = page.document.attribute(container, NAME)?.to_string();
    // 最初の描画で行テンプレートを切り離して保持する（0行の描画後も再描画できるように）
    let template = match page.list_templates.get(&container).copied() {
        Some(template) => template,
        None => {
            let Some(row) = page.document.query_selector(container, &[Selector::attr(LIST_VIEW_ITEM)]) else {
                log::debug!("List {} has no template row", list_name);
                return None;
            };
            let template = page.document.clone_subtree(row);
            page.list_templates.insert(container, template);
            template
        }
    };
    if !page.components.contains_key(&list_name) {
        log::warn!("List {} has no instance in the store", list_name);
        return None;
    }
    let generation = page.next_generation(container);

    // 描画前の状態をスナップショットする
    let mut data_cache: HashMap<String, ValueConfig> = HashMap::new();
    let mut block_cache: HashMap<String, Option<Block>> = HashMap::new();
    for child in page.document.query_selector_all(template, &[Selector::attr(NAME)]) {
        let attrs = page.document.attributes(child);
        let (Some(data_name), Some(comp_name)) = (attrs.get(NAME), attrs.get(COMPONENT_NAME)) else {
            continue;
        };
        if !data_cache.contains_key(data_name) {
            if let Some(instance) = page.components.get(data_name) {
                data_cache.insert(data_name.clone(), instance.value_config.clone());
            }
        }
        if !block_cache.contains_key(comp_name) {
            let block = attrs.get(COMPONENT_ID).and_then(|id| page.resources.block(id)).cloned();
            block_cache.insert(comp_name.clone(), block);
        }
    }

    let list = page.components.get_mut(&list_name)?;
    list.components.clear();
    let data_source = list.value_config.data_source.clone();
    let rows = match page.source.get(&data_source) {
        Some(Value::Array(rows)) => rows.clone(),
        Some(_) => {
            log::warn!("Data source {} of {} is not a list", data_source, list_name);
            Vec::new()
        }
        None => Vec::new(),
    };

    let clones: Vec<NodeId> = rows
        .iter()
        .map(|_| {
            let clone = page.document.clone_subtree(template);
            page.document.set_attribute(clone, "id", &uuid::Uuid::new_v4().to_string());
            for named in page.document.query_selector_all(clone, &[Selector::attr(NAME)]) {
                page.document.set_attribute(named, "id", &uuid::Uuid::new_v4().to_string());
            }
            clone
        })
        .collect();
    let removed = page.document.replace_children(container, &clones);
    page.release_nodes(&removed);
    page.forget_detached_mounts();

    let mut jobs = Vec::new();
    for (i, (row, item)) in clones.iter().zip(rows).enumerate() {
        let mut nodes = vec![*row];
        nodes.extend(page.document.query_selector_all(*row, &[Selector::attr(NAME)]));
        for (j, node) in nodes.into_iter().enumerate() {
            let attrs = page.document.attributes(node);
            let Some(comp_name) = attrs.get(COMPONENT_NAME) else {
                continue;
            };
            let block = match block_cache.get(comp_name) {
                Some(cached) => cached.clone(),
                None => attrs.get(COMPONENT_ID).and_then(|id| page.resources.block(id)).cloned(),
            };
            if block.is_none() {
                continue;
            }
            jobs.push(RowJob {
                name: format!("{}{}{}", comp_name, i, j),
                node,
                block,
                value_config: attrs.get(NAME).and_then(|n| data_cache.get(n)).cloned(),
                item: item.clone(),
            });
        }
    }

    Some((list_name, generation, jobs))
}

/// フォームの入力項目を data アクセサとして結び付け、各項目をマウントする
pub async fn render_form(rt: &Runtime, form_node: NodeId) -> usize {
    let (form_name, items) = {
        let mut page = rt.page.borrow_mut();
        let Some(form_name) = page.document.attribute(form_node, NAME).map(str::to_string) else {
            return 0;
        };
        if !page.components.contains_key(&form_name) {
            log::warn!("Form {} has no instance in the store", form_name);
            return 0;
        }

        let mut items = Vec::new();
        for item in page.document.query_selector_all(form_node, &[Selector::attr(FORM_ITEM)]) {
            let component_type = page.document.attribute(item, COMPONENT_TYPE).unwrap_or_default().to_string();
            let Some(name) = page.document.attribute(item, NAME).map(str::to_string) else {
                continue;
            };
            if component_type != FORM {
                page.document.set_attribute(item, FORM_ITEM, &form_name);
                if is_form_input(&component_type) {
                    let bound = page
                        .components
                        .get_mut(&form_name)
                        .map(|form| form.bind_form_field(&name))
                        .unwrap_or(false);
                    if !bound {
                        log::warn!("Form {} has no field instance {}", form_name, name);
                    }
                }
            }
            items.push(item);
        }
        (form_name, items)
    };

    let scope = vec![form_name];
    let results = join_all(items.iter().map(|item| mount_existing(rt, *item, &scope))).await;
    results.into_iter().filter(|ok| *ok).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::engine::error::TransportError;
    use crate::engine::runtime::testing::runtime_with;
    use crate::engine::state::ComponentInstance;
    use crate::engine::transport::testing::RecordingHost;
    use crate::engine::transport::{FixtureTransport, ResourceLoader};
    use crate::parser::parse_markup;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::rc::Rc;

    const LIST: &str = r#"<div data-name="list1" data-component-name="listView" data-component-id="bList">
  <div data-list-view-item data-name="row" data-component-name="container" data-component-id="bRow">
    <span data-name="title" data-component-name="text" data-component-id="bText"></span>
    <span data-name="price" data-component-name="text" data-component-id="bText"></span>
  </div>
</div>"#;

    fn blocks() -> Value {
        json!({ "blocks": [
            { "id": "bRow", "js": "{\"data\": {\"value\": null}}" },
            { "id": "bText", "js": "{\"data\": {\"value\": \"\"}}" },
            { "id": "bInput", "js": "{\"data\": {\"value\": \"\"}}" }
        ] })
    }

    fn seed_list(page: &mut crate::engine::state::Page, rows: Value) {
        page.resources.merge(&blocks());
        let mut list = ComponentInstance::new("listView");
        list.value_config.data_source = "users".into();
        page.components.insert("list1".into(), list);
        let mut title = ComponentInstance::new("text");
        title.value_config.extra.insert("value".into(), json!("{{item.name}}"));
        page.components.insert("title".into(), title);
        page.source.insert("users".into(), rows);
    }

    fn list_node(rt: &Runtime) -> NodeId {
        rt.page.borrow().document.find_by_attribute(NAME, "list1").unwrap()
    }

    #[tokio::test]
    async fn test_list_rows_get_unique_instances() {
        let (rt, _) = runtime_with(LIST, FixtureTransport::new());
        seed_list(&mut rt.page.borrow_mut(), json!([{ "name": "ann" }, { "name": "bob" }]));
        let container = list_node(&rt);

        assert_eq!(render_list_view(&rt, container).await, 6);

        let page = rt.page.borrow();
        let names: Vec<&String> = page.components["list1"].components.keys().collect();
        assert_eq!(
            names,
            vec!["container00", "container10", "text01", "text02", "text11", "text12"]
        );
        assert_eq!(page.components["list1"].components["text01"].value, json!("ann"));
        assert_eq!(page.components["list1"].components["text11"].value, json!("bob"));
        // price は投影設定を持たない
        assert_eq!(page.components["list1"].components["text02"].value, json!(""));

        let rows = page.document.element_children(container);
        assert_eq!(rows.len(), 2);
        let ids: HashSet<&str> = page
            .document
            .descendants(container)
            .into_iter()
            .filter_map(|n| page.document.attribute(n, "id"))
            .collect();
        assert_eq!(ids.len(), 6);
        assert_eq!(page.mounts.len(), 6);
    }

    const PLAIN_ROW_LIST: &str = r#"<div data-name="list1" data-component-name="listView" data-component-id="bList">
  <div data-list-view-item>
    <span data-name="title" data-component-name="text" data-component-id="bText"></span>
    <span data-name="price" data-component-name="text" data-component-id="bText"></span>
  </div>
</div>"#;

    #[tokio::test]
    async fn test_three_rows_of_two_components_give_six_instances() {
        let (rt, _) = runtime_with(PLAIN_ROW_LIST, FixtureTransport::new());
        seed_list(
            &mut rt.page.borrow_mut(),
            json!([{ "name": "ann" }, { "name": "bob" }, { "name": "cy" }]),
        );
        let container = list_node(&rt);

        assert_eq!(render_list_view(&rt, container).await, 6);

        let page = rt.page.borrow();
        let names: Vec<&String> = page.components["list1"].components.keys().collect();
        assert_eq!(names, vec!["text01", "text02", "text11", "text12", "text21", "text22"]);
        assert_eq!(page.components["list1"].components["text21"].value, json!("cy"));
        assert_eq!(page.document.element_children(container).len(), 3);
    }

    #[tokio::test]
    async fn test_empty_source_renders_nothing() {
        let (rt, _) = runtime_with(LIST, FixtureTransport::new());
        seed_list(&mut rt.page.borrow_mut(), json!([]));
        let container = list_node(&rt);

        assert_eq!(render_list_view(&rt, container).await, 0);
        let page = rt.page.borrow();
        assert!(page.document.element_children(container).is_empty());
        assert!(page.components["list1"].components.is_empty());
    }

    #[tokio::test]
    async fn test_rerender_replaces_rows() {
        let (rt, _) = runtime_with(LIST, FixtureTransport::new());
        seed_list(&mut rt.page.borrow_mut(), json!([{ "name": "ann" }, { "name": "bob" }]));
        let container = list_node(&rt);
        render_list_view(&rt, container).await;

        rt.page.borrow_mut().source.insert("users".into(), json!([{ "name": "cy" }]));
        assert_eq!(render_list_view(&rt, container).await, 3);
        let page = rt.page.borrow();
        assert_eq!(page.components["list1"].components.len(), 3);
        assert_eq!(page.components["list1"].components["text01"].value, json!("cy"));
        assert_eq!(page.document.element_children(container).len(), 1);
        assert_eq!(page.mounts.len(), 3);
    }

    #[tokio::test]
    async fn test_repeated_renders_reuse_document_slots() {
        let (rt, _) = runtime_with(LIST, FixtureTransport::new());
        seed_list(&mut rt.page.borrow_mut(), json!([{ "name": "ann" }, { "name": "bob" }]));
        let container = list_node(&rt);

        render_list_view(&rt, container).await;
        render_list_view(&rt, container).await;
        let slots = rt.page.borrow().document.slot_count();

        for _ in 0..200 {
            render_list_view(&rt, container).await;
        }

        let page = rt.page.borrow();
        assert_eq!(page.document.slot_count(), slots);
        assert_eq!(page.document.element_children(container).len(), 2);
        assert_eq!(page.mounts.len(), 6);
        assert!(page.mounts.keys().all(|node| page.document.is_connected(*node)));
    }

    struct YieldingLoader;

    #[async_trait(?Send)]
    impl ResourceLoader for YieldingLoader {
        async fn load_script(&self, _url: &str) -> Result<(), TransportError> {
            tokio::task::yield_now().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_overlapping_renders_last_wins() {
        let page = crate::engine::state::Page::new(parse_markup(LIST).unwrap(), Rc::new(RecordingHost::default()));
        let rt = Runtime::new(page, Rc::new(FixtureTransport::new()), Rc::new(YieldingLoader), RuntimeConfig::default());
        {
            let mut page = rt.page.borrow_mut();
            seed_list(&mut page, json!([{ "name": "ann" }, { "name": "bob" }]));
            page.resources.merge(&json!({ "blocks": [
                { "id": "bRow", "js": "{\"data\": {}}", "resources": { "scripts": ["/row.js"] } },
                { "id": "bText", "js": "{\"data\": {\"value\": \"\"}}" }
            ] }));
        }
        let container = list_node(&rt);

        let (_, second) = futures::join!(render_list_view(&rt, container), render_list_view(&rt, container));
        assert_eq!(second, 6);

        let page = rt.page.borrow();
        assert_eq!(page.components["list1"].components.len(), 6);
        assert_eq!(page.document.element_children(container).len(), 2);
        assert_eq!(page.mounts.len(), 6);
        for node in page.mounts.keys() {
            assert!(page.document.is_connected(*node));
        }
    }

    const FORM_MARKUP: &str = r#"<form data-name="form1" data-component-name="form" data-component-id="bForm">
  <div data-form-item data-name="email" data-component-name="input" data-component-type="input" data-component-id="bInput"></div>
  <div data-form-item data-name="note" data-component-name="text" data-component-type="text" data-component-id="bText"></div>
</form>"#;

    #[tokio::test]
    async fn test_form_accessors_round_trip() {
        let (rt, _) = runtime_with(FORM_MARKUP, FixtureTransport::new());
        {
            let mut page = rt.page.borrow_mut();
            page.resources.merge(&blocks());
            let mut form = ComponentInstance::new("form");
            form.components.insert("email".into(), ComponentInstance::new("input"));
            form.components.insert("note".into(), ComponentInstance::new("text"));
            page.components.insert("form1".into(), form);
        }
        let form_node = rt.page.borrow().document.find_by_attribute(NAME, "form1").unwrap();

        assert_eq!(render_form(&rt, form_node).await, 2);

        let mut page = rt.page.borrow_mut();
        let email_node = page.document.find_by_attribute(NAME, "email").unwrap();
        assert_eq!(page.document.attribute(email_node, FORM_ITEM), Some("form1"));
        assert_eq!(page.mounts[&email_node], vec!["form1".to_string(), "email".to_string()]);

        page.set_value(&["form1".to_string(), "email".to_string()], json!("a@b.c")).unwrap();
        let form = page.components.get_mut("form1").unwrap();
        assert_eq!(form.form_data_get("email"), Some(json!("a@b.c")));
        form.form_data_set("email", json!("x@y.z"));
        assert_eq!(form.components["email"].value, json!("x@y.z"));
        assert!(!form.is_form_field("note"));
    }
}
