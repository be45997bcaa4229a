// ========================================
// 式言語パーサーモジュール
// ========================================
//
// Pestパーサーを使用して {{ }} 内の式をASTに変換します。

use pest::Parser;
use pest_derive::Parser;

use crate::engine::error::ExprError;
use crate::parser::ast::Expr;
use crate::parser::expr::parse_expr;

/// 式言語のパーサー
/// grammar.pestファイルで定義された構文規則を使用
#[derive(Parser)]
#[grammar = "parser/grammar.pest"]
pub struct ExprParser;

/// 式文字列を解析してASTを生成する
///
/// * `source` - 解析対象の式（{{ }} は含まない）
///
/// # 戻り値
/// * `Ok(Expr)` - 解析成功時のAST
/// * `Err(ExprError::Syntax)` - 構文エラー
pub fn parse_expression(source: &str) -> Result<Expr, ExprError> {
    let mut pairs = ExprParser::parse(Rule::expression, source.trim())
        .map_err(|e| ExprError::Syntax(e.to_string()))?;

    let expression = pairs
        .next()
        .ok_or_else(|| ExprError::Syntax("empty expression".into()))?;

    // expression = { SOI ~ expr ~ EOI }
    let expr_pair = expression
        .into_inner()
        .find(|p| p.as_rule() == Rule::expr)
        .ok_or_else(|| ExprError::Syntax("empty expression".into()))?;

    parse_expr(expr_pair)
}
