// ========================================
// DOM属性名・定数
// ========================================
//
// ビルダーが出力するマークアップと一致させる必要があるため変更不可。

pub const NAME: &str = "data-name";
pub const COMPONENT_NAME: &str = "data-component-name";
pub const COMPONENT_ID: &str = "data-component-id";
pub const COMPONENT_TYPE: &str = "data-component-type";
pub const COMPOSITE_COMPONENT: &str = "data-composite-component";
pub const COMPOSITE_CHILD: &str = "data-composite-child";
pub const UUID: &str = "data-uuid";
pub const EVENT_ID: &str = "data-event-id";

// リストビュー
pub const LIST_VIEW_COMPONENT: &str = "data-list-view-component";
pub const LIST_VIEW_MODE: &str = "data-list-view-mode";
pub const LIST_VIEW_ITEM: &str = "data-list-view-item";
pub const LIST_VIEW_STYLE: &str = "data-list-view-style";

// フォーム
pub const FORM_COMPONENT: &str = "data-form-component";
pub const FORM_ITEM: &str = "data-form-item";

pub const ALPINE_COMPONENT: &str = "data-alpine-component";

pub const TAB_ITEM: &str = "data-tab-item";
pub const TAB_CONTAINER: &str = "data-tab-container";

/// data-component-name の値
pub const LIST_VIEW: &str = "listView";
pub const FORM: &str = "form";

/// data-component-type の値（状態を引き継ぐ系列）
pub const CHART: &str = "chart";
pub const TABLE: &str = "table";

/// フォームのdataアクセサを持つ入力コンポーネント
pub const FORM_INPUT_COMPONENTS: &[&str] = &[
    "input",
    "select",
    "textarea",
    "checkbox",
    "radio",
    "range",
    "date",
    "dateRange",
    "dateTime",
    "time",
    "tags",
    "switch",
    "keyValueTable",
];

/// 全クエリ実行後にページへ発行されるイベント
pub const ALL_QUERIES_EXECUTED: &str = "allQueriesExecuted";

pub fn is_form_input(component_type: &str) -> bool {
    FORM_INPUT_COMPONENTS.contains(&component_type)
}
