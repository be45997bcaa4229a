// ========================================
// ページランタイム
// ========================================
//
// 起動シーケンス（handle_page_load → on_body_load）と、
// イベントハンドラーが予約した仕事（クエリ実行、リストの再描画、watch）の消化を行う。
// Page は RefCell の中にあり、await をまたいで借用しない。

use std::cell::RefCell;
use std::rc::Rc;

use futures::future::join_all;
use serde_json::{Map, Value, json};

use crate::config::RuntimeConfig;
use crate::dom_renderer::{NodeId, Selector};
use crate::engine::constants::{
    ALPINE_COMPONENT, COMPONENT_NAME, COMPOSITE_CHILD, COMPOSITE_COMPONENT, FORM, FORM_ITEM, LIST_VIEW,
    LIST_VIEW_ITEM, NAME,
};
use crate::engine::core::component::{mount_existing, mount_new};
use crate::engine::core::render::{render_form, render_list_view};
use crate::engine::error::RuntimeError;
use crate::engine::query::{load_queries, run_queries, run_query_by_name};
use crate::engine::state::{ComponentInstance, Page, PendingWork};
use crate::engine::transport::{Alert, Host, Method, ResourceLoader, Transport, make_request};

/// 一度の flush で処理する仕事の上限（ハンドラー同士が互いを呼び続ける場合の歯止め）
const FLUSH_LIMIT: usize = 1000;

pub struct Runtime {
    pub page: Rc<RefCell<Page>>,
    pub transport: Rc<dyn Transport>,
    pub loader: Rc<dyn ResourceLoader>,
    pub config: RuntimeConfig,
}

impl Runtime {
    pub fn new(
        page: Page,
        transport: Rc<dyn Transport>,
        loader: Rc<dyn ResourceLoader>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            page: Rc::new(RefCell::new(page)),
            transport,
            loader,
            config,
        }
    }

    pub fn host(&self) -> Rc<dyn Host> {
        Rc::clone(&self.page.borrow().host)
    }

    // ========================================
    // 起動シーケンス
    // ========================================

    /// コンポーネント・ページリソース・クエリを並行して取得し、
    /// クエリを実行してからページ全体をマウントする
    pub async fn handle_page_load(&self) -> Result<(), RuntimeError> {
        let host = self.host();
        let endpoints = &self.config.endpoints;
        log::info!("🚀 Loading page {}", self.config.page_id);

        let components_body = json!({ "pageId": self.config.page_id });
        let resource_body = json!({});
        let (components, resource, _) = futures::join!(
            make_request(
                self.transport.as_ref(),
                host.as_ref(),
                Method::Post,
                &endpoints.components,
                &components_body,
            ),
            make_request(
                self.transport.as_ref(),
                host.as_ref(),
                Method::Post,
                &endpoints.page_resource,
                &resource_body,
            ),
            load_queries(self),
        );

        let mut missing = false;
        for response in [&components, &resource] {
            if !response.is_success() || response.data.is_null() {
                host.show_alert(Alert::error("OOPS! Something went wrong", &response.message));
                missing = true;
            }
        }
        if missing {
            log::error!("Page load payload is missing, nothing will be rendered");
            return Err(RuntimeError::MissingPayload);
        }

        {
            let mut page = self.page.borrow_mut();
            apply_component_payload(&mut page, &components.data);
            page.resources.merge(&resource.data);
            log::info!(
                "📦 {} blocks, {} composite components, {} component instances",
                page.resources.blocks.len(),
                page.resources.composite_components.len(),
                page.components.len()
            );
        }

        run_queries(self).await;
        // リストは on_body_load で最新の Source から描画する
        self.page
            .borrow_mut()
            .pending
            .retain(|w| !matches!(w, PendingWork::SourceChanged(_)));

        self.on_body_load().await;
        self.flush().await;
        Ok(())
    }

    /// リスト・フォームを描画し、残りのコンポーネントをマウントする
    pub async fn on_body_load(&self) {
        let (lists, forms) = {
            let page = self.page.borrow();
            let root = page.document.root();
            (
                page.document
                    .query_selector_all(root, &[Selector::attr_eq(COMPONENT_NAME, LIST_VIEW)]),
                page.document
                    .query_selector_all(root, &[Selector::attr_eq(COMPONENT_NAME, FORM)]),
            )
        };

        futures::join!(
            join_all(lists.iter().map(|node| render_list_view(self, *node))),
            join_all(forms.iter().map(|node| render_form(self, *node))),
        );

        let remaining: Vec<(NodeId, Option<String>)> = {
            let page = self.page.borrow();
            let selector = Selector::attr(COMPONENT_NAME)
                .without_attr(COMPOSITE_COMPONENT)
                .without_attr(FORM_ITEM)
                .without_attr(ALPINE_COMPONENT);
            let row = Selector::attr(LIST_VIEW_ITEM);
            page.document
                .query_selector_all(page.document.root(), &[selector])
                .into_iter()
                .filter(|node| !page.mounts.contains_key(node))
                .filter(|node| page.document.closest(*node, &row).is_none())
                .map(|node| {
                    let composite_child = page
                        .document
                        .attribute(node, COMPOSITE_CHILD)
                        .and_then(|_| page.document.attribute(node, NAME))
                        .map(str::to_string);
                    (node, composite_child)
                })
                .collect()
        };

        let mounted = join_all(remaining.into_iter().map(|(node, composite_child)| async move {
            match composite_child {
                Some(name) => mount_new(self, &name, &[], node, None).await,
                None => mount_existing(self, node, &[]).await,
            }
        }))
        .await;
        log::info!(
            "✨ Body loaded: {} lists, {} forms, {} other components",
            lists.len(),
            forms.len(),
            mounted.into_iter().filter(|m| *m).count()
        );
    }

    // ========================================
    // 予約された仕事の消化
    // ========================================

    /// 予約された仕事が無くなるまで処理する
    pub async fn flush(&self) {
        let mut steps = 0;
        loop {
            let work = {
                let mut page = self.page.borrow_mut();
                // 描画やクエリで書き換えられた値の watch もここで拾う
                page.queue_watches();
                page.pending.pop_front()
            };
            let Some(work) = work else {
                break;
            };
            steps += 1;
            if steps > FLUSH_LIMIT {
                let mut page = self.page.borrow_mut();
                log::error!(
                    "Pending work did not settle after {} steps, dropping {} items",
                    FLUSH_LIMIT,
                    page.pending.len() + 1
                );
                page.pending.clear();
                break;
            }

            match work {
                PendingWork::RunQuery(name) => {
                    run_query_by_name(self, &name).await;
                }
                PendingWork::SourceChanged(key) => {
                    for list in self.lists_bound_to(&key) {
                        render_list_view(self, list).await;
                    }
                }
                PendingWork::Click(name) => {
                    self.page.borrow_mut().click(&name);
                }
                PendingWork::Watch { path, field } => {
                    self.page.borrow_mut().run_watch(&path, &field);
                }
            }
        }
    }

    /// dataSource が key のリストコンテナ
    fn lists_bound_to(&self, key: &str) -> Vec<NodeId> {
        let page = self.page.borrow();
        page.document
            .query_selector_all(page.document.root(), &[Selector::attr_eq(COMPONENT_NAME, LIST_VIEW)])
            .into_iter()
            .filter(|node| {
                page.document
                    .attribute(*node, NAME)
                    .and_then(|name| page.components.get(name))
                    .map(|list| list.value_config.data_source == key)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// トップレベルのコンポーネントにイベントを発火し、予約された仕事を消化する
    pub async fn dispatch(&self, name: &str, channel: &str, event_type: &str, detail: Value) -> bool {
        let fired = self
            .page
            .borrow_mut()
            .fire_path(&[name.to_string()], channel, event_type, detail);
        self.flush().await;
        fired
    }
}

/// getComponents のペイロードを取り込む
/// { blocks, components } の形、またはコンポーネントストアそのもの
fn apply_component_payload(page: &mut Page, data: &Value) {
    let store: Map<String, Value> = match data {
        Value::Object(obj) if obj.contains_key("blocks") || obj.contains_key("components") => {
            if let Some(blocks) = obj.get("blocks") {
                page.resources.merge(&json!({ "blocks": blocks }));
            }
            match obj.get("components") {
                Some(Value::Object(components)) => components.clone(),
                _ => Map::new(),
            }
        }
        Value::Object(obj) => obj.clone(),
        Value::Array(_) => {
            page.resources.merge(&json!({ "blocks": data }));
            Map::new()
        }
        _ => Map::new(),
    };
    for (name, value) in store {
        page.components.insert(name, ComponentInstance::from_value(&value));
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::engine::transport::testing::RecordingHost;
    use crate::engine::transport::{FixtureTransport, NoopLoader};
    use crate::parser::parse_markup;

    pub fn runtime_with(markup: &str, transport: FixtureTransport) -> (Rc<Runtime>, Rc<RecordingHost>) {
        let host = Rc::new(RecordingHost::default());
        let page = Page::new(parse_markup(markup).unwrap(), host.clone());
        let rt = Runtime::new(page, Rc::new(transport), Rc::new(NoopLoader), RuntimeConfig::default());
        (Rc::new(rt), host)
    }
}
