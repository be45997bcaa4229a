// ========================================
// ヘルパーテーブル
// ========================================
//
// 式の中から `$name(args)` で呼び出せる関数の一覧。
// 式から到達できる名前は item（コンテキスト）とこのテーブルのみ。

use std::collections::HashMap;
use std::rc::Rc;

use serde_json::{Map, Value, json};

use crate::engine::error::ExprError;
use crate::engine::eval::js_to_string;

/// ヘルパーから参照できるページの状態
pub struct HelperScope<'a> {
    pub source: &'a Map<String, Value>,
}

impl<'a> HelperScope<'a> {
    pub fn new(source: &'a Map<String, Value>) -> Self {
        Self { source }
    }
}

/// 引数列を受け取るヘルパー関数型
pub type HelperFn = dyn Fn(&HelperScope, &[Value]) -> Result<Value, String>;

// ========================================
// 型付き引数変換トレイト
// ========================================

/// JSON値から各型への変換トレイト
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_f64()
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Option<Self> {
        value
            .as_i64()
            .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromValue for Vec<Value> {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_array().cloned()
    }
}

/// 関数の引数をJSON値の配列から変換するトレイト
pub trait FromValueArgs: Sized {
    fn from_value_args(args: &[Value]) -> Result<Self, String>;
}

/// 型付きヘルパーとして呼び出し可能な関数
pub trait CallableHelper<Args>: 'static {
    fn call(&self, args: Args) -> Value;
}

impl FromValueArgs for () {
    fn from_value_args(args: &[Value]) -> Result<Self, String> {
        if args.is_empty() {
            Ok(())
        } else {
            Err(format!("Expected 0 arguments, got {}", args.len()))
        }
    }
}

impl<F, R> CallableHelper<()> for F
where
    F: Fn() -> R + 'static,
    R: Into<Value>,
{
    fn call(&self, _args: ()) -> Value {
        self().into()
    }
}

macro_rules! impl_typed_helper {
    ($($T:ident),+) => {
        #[allow(non_snake_case)]
        impl<$($T: FromValue),+> FromValueArgs for ($($T,)+) {
            fn from_value_args(args: &[Value]) -> Result<Self, String> {
                let mut idx = 0;
                $(
                    let $T = $T::from_value(args.get(idx).ok_or_else(|| {
                        format!("Expected at least {} arguments, got {}", idx + 1, args.len())
                    })?)
                    .ok_or_else(|| format!("Failed to convert argument {}", idx + 1))?;
                    idx += 1;
                )+

                if args.len() != idx {
                    return Err(format!("Expected {} arguments, got {}", idx, args.len()));
                }

                Ok(($($T,)+))
            }
        }

        #[allow(non_snake_case)]
        impl<F, R, $($T),+> CallableHelper<($($T,)+)> for F
        where
            F: Fn($($T),+) -> R + 'static,
            R: Into<Value>,
        {
            fn call(&self, ($($T,)+): ($($T,)+)) -> Value {
                self($($T),+).into()
            }
        }
    };
}

impl_typed_helper!(T1);
impl_typed_helper!(T1, T2);
impl_typed_helper!(T1, T2, T3);
impl_typed_helper!(T1, T2, T3, T4);

// ========================================
// テーブル本体
// ========================================

/// ページごとに保持するヘルパーテーブル
#[derive(Clone, Default)]
pub struct HelperTable {
    helpers: HashMap<String, Rc<HelperFn>>,
}

impl std::fmt::Debug for HelperTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperTable")
            .field("helpers", &self.names())
            .finish()
    }
}

impl HelperTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 組み込みヘルパーを登録済みのテーブル
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        table.register("query", builtin_query);
        table.register("concatStrings", builtin_concat_strings);
        table.register("getType", builtin_get_type);
        table.register("fetchHierarchyData", builtin_fetch_hierarchy_data);
        table.register_typed("createSeriesData", create_series_data);
        table
    }

    /// 引数列とスコープを受け取るヘルパーを登録
    pub fn register<F>(&mut self, name: &str, func: F)
    where
        F: Fn(&HelperScope, &[Value]) -> Result<Value, String> + 'static,
    {
        self.helpers.insert(name.to_string(), Rc::new(func));
    }

    /// 型付き引数のヘルパーを登録
    ///
    /// ```ignore
    /// table.register_typed("double", |n: f64| n * 2.0);
    /// table.register_typed("greet", |name: String| format!("Hello, {}", name));
    /// ```
    pub fn register_typed<F, Args>(&mut self, name: &str, func: F)
    where
        Args: FromValueArgs,
        F: CallableHelper<Args>,
    {
        let wrapper = move |_: &HelperScope, args: &[Value]| {
            let converted = Args::from_value_args(args)?;
            Ok(func.call(converted))
        };
        self.helpers.insert(name.to_string(), Rc::new(wrapper));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.helpers.contains_key(name)
    }

    /// 登録されているヘルパー名の一覧（デバッグ用）
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.helpers.keys().cloned().collect();
        names.sort();
        names
    }

    /// ヘルパーを呼び出す
    pub fn call(&self, name: &str, scope: &HelperScope, args: &[Value]) -> Result<Value, ExprError> {
        let func = self
            .helpers
            .get(name)
            .ok_or_else(|| ExprError::UnknownHelper(name.to_string()))?;
        func(scope, args).map_err(|message| ExprError::Helper {
            name: name.to_string(),
            message,
        })
    }
}

// ========================================
// 組み込みヘルパー
// ========================================

/// $query(name): Sourceから最新値を取得
fn builtin_query(scope: &HelperScope, args: &[Value]) -> Result<Value, String> {
    match args.first() {
        Some(Value::String(name)) if !name.is_empty() => {
            Ok(scope.source.get(name).cloned().unwrap_or(Value::Null))
        }
        _ => Ok(Value::Null),
    }
}

/// $concatStrings(a, b, separator = "")
fn builtin_concat_strings(_: &HelperScope, args: &[Value]) -> Result<Value, String> {
    let part = |i: usize| args.get(i).map(js_to_string).unwrap_or_else(|| "undefined".into());
    let separator = args.get(2).map(js_to_string).unwrap_or_default();
    Ok(Value::String(format!("{}{}{}", part(0), separator, part(1))))
}

/// $getType(value)
fn builtin_get_type(_: &HelperScope, args: &[Value]) -> Result<Value, String> {
    let kind = match args.first() {
        None => "undefined",
        Some(Value::String(_)) => "string",
        Some(Value::Number(_)) => "number",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Array(_)) => "array",
        Some(Value::Null) => "null",
        Some(Value::Object(_)) => "object",
    };
    Ok(Value::String(kind.to_string()))
}

/// $createSeriesData(series, data): [{x, y}] の定義からチャート用の系列を作る
pub fn create_series_data(series: Value, data: Value) -> Value {
    let (Some(series), Some(rows)) = (series.as_array(), data.as_array()) else {
        return json!([]);
    };

    let field = |row: &Value, key: &str| row.get(key).cloned().unwrap_or(Value::Null);

    let mut series_data = Vec::new();
    for entry in series {
        let x = entry.get("x").and_then(Value::as_str).filter(|s| !s.is_empty());
        let y = entry.get("y").and_then(Value::as_str).filter(|s| !s.is_empty());
        let (Some(x), Some(y)) = (x, y) else {
            continue;
        };
        series_data.push(json!({
            "name": y,
            "data": rows.iter().map(|r| field(r, y)).collect::<Vec<_>>(),
            "xValues": rows.iter().map(|r| field(r, x)).collect::<Vec<_>>(),
        }));
    }

    let default_x = series
        .first()
        .and_then(|s| s.get("x"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());

    json!({
        "series": series_data,
        "x": default_x.map(|x| rows.iter().map(|r| field(r, x)).collect::<Vec<_>>()).unwrap_or_default(),
        "xName": default_x.unwrap_or(""),
    })
}

/// $fetchHierarchyData(data, path, aggregationKey): ドリルダウン用にパスを辿って集計値を取り出す
fn builtin_fetch_hierarchy_data(_: &HelperScope, args: &[Value]) -> Result<Value, String> {
    let data = args.first().cloned().unwrap_or(Value::Null);
    let path = args.get(1).and_then(Value::as_str).unwrap_or("");
    let aggregation_key = args.get(2).and_then(Value::as_str).unwrap_or("");
    Ok(fetch_hierarchy_data(&data, path, aggregation_key))
}

pub fn fetch_hierarchy_data(data: &Value, path: &str, aggregation_key: &str) -> Value {
    let path_parts: Vec<String> = if path.is_empty() {
        Vec::new()
    } else {
        path.to_lowercase().split('.').map(str::to_string).collect()
    };

    let empty = |parts: &[String]| {
        json!({ "x": [], "y": [], "xName": "unknown", "yName": aggregation_key, "drilldownPath": parts })
    };

    let mut level: &[Value] = match data.as_array() {
        Some(items) => items,
        None if path_parts.is_empty() => &[],
        None => return empty(&path_parts),
    };

    for part in &path_parts {
        let found = level.iter().find(|item| {
            item.get("label")
                .and_then(Value::as_str)
                .map(|l| l.to_lowercase() == *part)
                .unwrap_or(false)
        });
        match found.and_then(|f| f.get("children")).and_then(Value::as_array) {
            Some(children) => level = children,
            None => return empty(&path_parts),
        }
    }

    let x_name = level
        .first()
        .and_then(|first| first.get("dim"))
        .cloned()
        .unwrap_or_else(|| Value::String("unknown".into()));

    let x: Vec<Value> = level
        .iter()
        .map(|item| item.get("label").cloned().unwrap_or(Value::Null))
        .collect();
    let y: Vec<Value> = level
        .iter()
        .map(|item| {
            let raw = item
                .get("aggregations")
                .and_then(|a| a.get(aggregation_key))
                .and_then(|a| a.get("value"));
            let n = match raw {
                Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
                Some(Value::String(s)) => parse_leading_float(s),
                _ => 0.0,
            };
            json!(n)
        })
        .collect();

    json!({ "x": x, "y": y, "xName": x_name, "yName": aggregation_key, "drilldownPath": path_parts })
}

/// 先頭の数値部分のみを読む（"12.5kg" -> 12.5、読めなければ 0）
fn parse_leading_float(s: &str) -> f64 {
    let trimmed = s.trim_start();
    let mut end = 0;
    for (i, ch) in trimmed.char_indices() {
        let ok = ch.is_ascii_digit() || ch == '.' || ((ch == '-' || ch == '+') && i == 0);
        if !ok {
            break;
        }
        end = i + ch.len_utf8();
    }
    (0..=end)
        .rev()
        .find_map(|e| trimmed[..e].parse::<f64>().ok())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(table: &HelperTable, name: &str, args: &[Value]) -> Result<Value, ExprError> {
        let source = Map::new();
        table.call(name, &HelperScope::new(&source), args)
    }

    #[test]
    fn test_query_reads_source() {
        let table = HelperTable::with_builtins();
        let mut source = Map::new();
        source.insert("users".into(), json!([{ "id": 1 }]));
        let scope = HelperScope::new(&source);
        assert_eq!(table.call("query", &scope, &[json!("users")]).unwrap(), json!([{ "id": 1 }]));
        assert_eq!(table.call("query", &scope, &[json!("")]).unwrap(), Value::Null);
    }

    #[test]
    fn test_concat_strings_default_separator() {
        let table = HelperTable::with_builtins();
        assert_eq!(call(&table, "concatStrings", &[json!("a"), json!(1)]).unwrap(), json!("a1"));
        assert_eq!(
            call(&table, "concatStrings", &[json!("a"), json!("b"), json!("-")]).unwrap(),
            json!("a-b")
        );
    }

    #[test]
    fn test_typed_registration_checks_arity() {
        let mut table = HelperTable::new();
        table.register_typed("double", |n: f64| n * 2.0);
        assert_eq!(call(&table, "double", &[json!(4)]).unwrap(), json!(8.0));
        assert!(matches!(
            call(&table, "double", &[json!(1), json!(2)]),
            Err(ExprError::Helper { .. })
        ));
        assert!(matches!(call(&table, "nope", &[]), Err(ExprError::UnknownHelper(_))));
    }

    #[test]
    fn test_create_series_data() {
        let out = create_series_data(
            json!([{ "x": "month", "y": "sales" }, { "x": "", "y": "skip" }]),
            json!([{ "month": "Jan", "sales": 3 }, { "month": "Feb", "sales": 5 }]),
        );
        assert_eq!(
            out,
            json!({
                "series": [{ "name": "sales", "data": [3, 5], "xValues": ["Jan", "Feb"] }],
                "x": ["Jan", "Feb"],
                "xName": "month",
            })
        );
        assert_eq!(create_series_data(json!(null), json!([])), json!([]));
    }

    #[test]
    fn test_fetch_hierarchy_data_drilldown() {
        let data = json!([
            { "label": "Asia", "dim": "region", "aggregations": { "sum": { "value": "10" } },
              "children": [
                { "label": "Japan", "dim": "country", "aggregations": { "sum": { "value": 4 } } },
                { "label": "India", "dim": "country", "aggregations": {} }
              ] }
        ]);
        let top = fetch_hierarchy_data(&data, "", "sum");
        assert_eq!(top["x"], json!(["Asia"]));
        assert_eq!(top["y"], json!([10.0]));

        let asia = fetch_hierarchy_data(&data, "ASIA", "sum");
        assert_eq!(asia["x"], json!(["Japan", "India"]));
        assert_eq!(asia["y"], json!([4.0, 0.0]));
        assert_eq!(asia["xName"], json!("country"));
        assert_eq!(asia["drilldownPath"], json!(["asia"]));

        let missing = fetch_hierarchy_data(&data, "europe", "sum");
        assert_eq!(missing["xName"], json!("unknown"));
    }
}
