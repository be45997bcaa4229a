// ========================================
// テンプレート式評価モジュール
// ========================================
//
// 任意のJSON値の中に埋め込まれた {{expr}} と $ で始まる生の式を解決します。
// 失敗は呼び出し側へ伝播せず、元の {{expr}} テキストを残して警告ログを出します。

use regex::{Captures, Regex};
use serde_json::{Map, Value, json};

use crate::engine::error::ExprError;
use crate::engine::eval::{EvalContext, eval_expr, js_to_string};
use crate::engine::helper_call::HelperTable;
use crate::parser::parse::parse_expression;

lazy_static::lazy_static! {
    // 最短一致。式の中に改行があっても一つのスパンとして扱う
    static ref TEMPLATE_SPAN: Regex = Regex::new(r"(?s)\{\{(.*?)\}\}").expect("template span pattern");
}

/// 生の式であることを示す先頭文字
pub const RAW_MARKER: char = '$';

/// 式評価器（ヘルパーテーブルとSourceへの参照のみを持つ）
pub struct Evaluator<'a> {
    helpers: &'a HelperTable,
    source: &'a Map<String, Value>,
}

impl<'a> Evaluator<'a> {
    pub fn new(helpers: &'a HelperTable, source: &'a Map<String, Value>) -> Self {
        Self { helpers, source }
    }

    /// 単一の式をコンテキストに対して評価する（毎回パースする）
    pub fn eval_expression(&self, code: &str, context: &Value) -> Result<Value, ExprError> {
        let ast = parse_expression(code)?;
        let ctx = EvalContext {
            item: context,
            helpers: self.helpers,
            source: self.source,
        };
        eval_expr(&ast, &ctx)
    }

    /// 値の中の式を再帰的に解決する（evalExpression 相当）
    /// 配列は要素ごと、オブジェクトは値ごとに評価し、キーは評価しない
    pub fn eval_value(&self, value: &Value, context: &Value) -> Value {
        match value {
            Value::String(s) => self.eval_string(s, context),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.eval_value(v, context)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.eval_value(v, context)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn eval_string(&self, input: &str, context: &Value) -> Value {
        if input.starts_with(RAW_MARKER) {
            match self.eval_expression(input, context) {
                Ok(v) => return v,
                Err(e) => log::debug!("Raw expression '{}' did not evaluate: {}", input, e),
            }
        }

        let spans: Vec<_> = TEMPLATE_SPAN.find_iter(input).collect();
        if spans.is_empty() {
            return Value::String(input.to_string());
        }

        // 文字列全体が一つのスパンの場合は評価結果の型をそのまま返す
        if spans.len() == 1 && spans[0].start() == 0 && spans[0].end() == input.len() {
            let code = &input[2..input.len() - 2];
            return match self.eval_expression(code, context) {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("Evaluation error in '{}': {}", input, e);
                    Value::String(input.to_string())
                }
            };
        }

        let replaced = TEMPLATE_SPAN.replace_all(input, |caps: &Captures| {
            let code = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            match self.eval_expression(code, context) {
                Ok(Value::String(s)) => s,
                Ok(v @ (Value::Array(_) | Value::Object(_))) => v.to_string(),
                Ok(v) => js_to_string(&v),
                Err(e) => {
                    log::warn!("Evaluation error in '{}': {}", &caps[0], e);
                    caps[0].to_string()
                }
            }
        });
        Value::String(replaced.into_owned())
    }

    /// データオブジェクトに対して値を解決する（executeFunction 相当）
    /// $ も {{ も含まない文字列はデータのキーとして扱う
    pub fn execute_function(&self, value: &Value, data: &Value) -> Value {
        if let Value::String(s) = value {
            if !s.contains(RAW_MARKER) && !s.contains("{{") {
                return data.get(s.as_str()).cloned().unwrap_or(Value::Null);
            }
        }
        self.eval_value(value, data)
    }

    /// クエリ結果の変換コードを適用する
    /// "return" だけなら素通し。それ以外は data を参照できる式として評価し、
    /// 失敗した場合はエラーメッセージを結果とする
    pub fn transform_code(&self, code: &str, data: Value) -> Value {
        let trimmed = code.trim();
        if trimmed.is_empty() || trimmed == "return" {
            return data;
        }

        let body = trimmed
            .strip_prefix("return")
            .filter(|rest| rest.starts_with(char::is_whitespace) || rest.starts_with('('))
            .unwrap_or(trimmed)
            .trim()
            .trim_end_matches(';');

        match self.eval_expression(body, &json!({ "data": data })) {
            Ok(v) => v,
            Err(e) => {
                log::error!("Transform code execution error: {}", e);
                Value::String(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_evaluator<T>(f: impl FnOnce(&Evaluator) -> T) -> T {
        let helpers = HelperTable::with_builtins();
        let mut source = Map::new();
        source.insert("users".into(), json!([{ "name": "ann" }, { "name": "bob" }]));
        let evaluator = Evaluator::new(&helpers, &source);
        f(&evaluator)
    }

    #[test]
    fn test_values_without_expressions_are_unchanged() {
        with_evaluator(|ev| {
            for v in [
                json!(1),
                json!(true),
                json!(null),
                json!("plain text"),
                json!({ "a": [1, "b", { "c": null }] }),
            ] {
                assert_eq!(ev.eval_value(&v, &json!({ "x": 1 })), v);
            }
        });
    }

    #[test]
    fn test_standalone_keeps_native_type() {
        with_evaluator(|ev| {
            assert_eq!(ev.eval_value(&json!("{{1+1}}"), &json!({})), json!(2));
            assert_eq!(ev.eval_value(&json!("{{ item.rows }}"), &json!({ "rows": [1] })), json!([1]));
            assert_eq!(ev.eval_value(&json!("{{x > 1}}"), &json!({ "x": 5 })), json!(true));
        });
    }

    #[test]
    fn test_mixed_text_is_interpolated() {
        with_evaluator(|ev| {
            assert_eq!(ev.eval_value(&json!("total: {{1+1}}"), &json!({})), json!("total: 2"));
            assert_eq!(
                ev.eval_value(&json!("{{a}}-{{b}}"), &json!({ "a": "x", "b": [1, 2] })),
                json!("x-[1,2]")
            );
        });
    }

    #[test]
    fn test_failing_expression_returns_its_text() {
        with_evaluator(|ev| {
            assert_eq!(ev.eval_value(&json!("{{missing.value}}"), &json!({})), json!("{{missing.value}}"));
            assert_eq!(ev.eval_value(&json!("a {{1 +}} b {{2}}"), &json!({})), json!("a {{1 +}} b 2"));
        });
    }

    #[test]
    fn test_missing_row_field_is_null_not_text() {
        with_evaluator(|ev| {
            let config = json!({ "value": "{{item.name}}", "label": "{{item.tags[2]}}" });
            let out = ev.eval_value(&config, &json!({ "price": 3, "tags": [] }));
            assert_eq!(out, json!({ "value": null, "label": null }));
        });
    }

    #[test]
    fn test_recursive_evaluation() {
        with_evaluator(|ev| {
            let out = ev.eval_value(&json!({ "a": "{{1+1}}", "b": ["{{2+2}}", "{{x}}"] }), &json!({ "x": 5 }));
            assert_eq!(out, json!({ "a": 2, "b": [4, 5] }));
        });
    }

    #[test]
    fn test_keys_are_not_evaluated() {
        with_evaluator(|ev| {
            let out = ev.eval_value(&json!({ "{{x}}": "{{x}}" }), &json!({ "x": 1 }));
            assert_eq!(out, json!({ "{{x}}": 1 }));
        });
    }

    #[test]
    fn test_adjacent_spans_are_not_standalone() {
        with_evaluator(|ev| {
            assert_eq!(ev.eval_value(&json!("{{a}}{{b}}"), &json!({ "a": 1, "b": 2 })), json!("12"));
        });
    }

    #[test]
    fn test_raw_marker_evaluates_whole_string() {
        with_evaluator(|ev| {
            assert_eq!(ev.eval_value(&json!("$query('users')[0].name"), &json!({})), json!("ann"));
            assert_eq!(ev.eval_value(&json!("$5 off"), &json!({})), json!("$5 off"));
        });
    }

    #[test]
    fn test_execute_function_key_lookup() {
        with_evaluator(|ev| {
            let data = json!({ "name": "ann", "age": 3 });
            assert_eq!(ev.execute_function(&json!("name"), &data), json!("ann"));
            assert_eq!(ev.execute_function(&json!("{{age + 1}}"), &data), json!(4));
            assert_eq!(ev.execute_function(&json!("nope"), &data), Value::Null);
        });
    }

    #[test]
    fn test_transform_code() {
        with_evaluator(|ev| {
            let data = json!({ "rows": [1, 2, 3] });
            assert_eq!(ev.transform_code("return", data.clone()), data);
            assert_eq!(ev.transform_code("return data.rows;", data.clone()), json!([1, 2, 3]));
            assert_eq!(ev.transform_code("data.rows.length", data.clone()), json!(3));
            assert_eq!(
                ev.transform_code("return data.missing.x", data),
                json!("missing is not defined")
            );
        });
    }
}
