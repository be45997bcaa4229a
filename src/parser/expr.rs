// ========================================
// 式パーサーモジュール
// ========================================
//
// このモジュールは各層の式（三項演算、論理演算、比較、算術、メンバーアクセス、
// ヘルパー呼び出しなど）をPestのペアからASTへ変換します。

use pest::iterators::{Pair, Pairs};

use crate::engine::error::ExprError;
use crate::parser::ast::*;
use crate::parser::parse::Rule;
use crate::parser::utils::unquote;

/// 次のペアを取り出す（文法上必ず存在するが、念のためエラーにする）
fn next_pair<'a>(inner: &mut Pairs<'a, Rule>, what: &str) -> Result<Pair<'a, Rule>, ExprError> {
    inner
        .next()
        .ok_or_else(|| ExprError::Syntax(format!("missing {}", what)))
}

/// 式をパースする
pub fn parse_expr(pair: Pair<Rule>) -> Result<Expr, ExprError> {
    match pair.as_rule() {
        Rule::expr => {
            let mut inner = pair.into_inner();
            parse_expr(next_pair(&mut inner, "expr")?)
        }
        Rule::ternary => parse_ternary(pair),
        Rule::nullish
        | Rule::or_expr
        | Rule::and_expr
        | Rule::equality
        | Rule::comparison
        | Rule::additive
        | Rule::term => parse_binary_chain(pair),
        Rule::unary => parse_unary(pair),
        Rule::postfix => parse_postfix(pair),
        _ => parse_primary(pair),
    }
}

/// 三項演算子をパースする
fn parse_ternary(pair: Pair<Rule>) -> Result<Expr, ExprError> {
    let mut inner = pair.into_inner();
    let test = parse_expr(next_pair(&mut inner, "condition")?)?;

    match inner.next() {
        None => Ok(test),
        Some(consequent) => {
            let consequent = parse_expr(consequent)?;
            let alternate = parse_expr(next_pair(&mut inner, "alternate")?)?;
            Ok(Expr::Conditional {
                test: Box::new(test),
                consequent: Box::new(consequent),
                alternate: Box::new(alternate),
            })
        }
    }
}

/// 二項演算の連鎖を左結合でパースする
/// 例: a + b - c -> BinaryOp { BinaryOp { a + b } - c }
fn parse_binary_chain(pair: Pair<Rule>) -> Result<Expr, ExprError> {
    let mut inner = pair.into_inner();
    let mut left = parse_expr(next_pair(&mut inner, "operand")?)?;

    while let Some(op_pair) = inner.next() {
        let symbol = op_pair.as_str();
        let op = BinaryOperator::from_symbol(symbol)
            .ok_or_else(|| ExprError::Syntax(format!("不明な演算子: {}", symbol)))?;
        let right = parse_expr(next_pair(&mut inner, "right operand")?)?;

        left = Expr::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        };
    }

    Ok(left)
}

/// 単項演算子をパースする（右から順に適用）
fn parse_unary(pair: Pair<Rule>) -> Result<Expr, ExprError> {
    let mut ops = Vec::new();
    let mut operand = None;

    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::unary_op => ops.push(match p.as_str() {
                "!" => UnaryOperator::Not,
                _ => UnaryOperator::Neg,
            }),
            _ => operand = Some(parse_expr(p)?),
        }
    }

    let mut expr = operand.ok_or_else(|| ExprError::Syntax("missing operand".into()))?;
    for op in ops.into_iter().rev() {
        expr = Expr::Unary {
            op,
            operand: Box::new(expr),
        };
    }
    Ok(expr)
}

/// メンバーアクセス・添字アクセスをパースする
fn parse_postfix(pair: Pair<Rule>) -> Result<Expr, ExprError> {
    let mut inner = pair.into_inner();
    let mut expr = parse_primary(next_pair(&mut inner, "primary")?)?;

    for accessor in inner {
        expr = match accessor.as_rule() {
            Rule::member | Rule::optional_member => {
                let optional = accessor.as_rule() == Rule::optional_member;
                let mut it = accessor.into_inner();
                let property = next_pair(&mut it, "property")?.as_str().to_string();
                Expr::Member {
                    object: Box::new(expr),
                    property,
                    optional,
                }
            }
            Rule::index => {
                let mut it = accessor.into_inner();
                let index = parse_expr(next_pair(&mut it, "index")?)?;
                Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                }
            }
            other => {
                return Err(ExprError::Syntax(format!("unexpected accessor {:?}", other)));
            }
        };
    }

    Ok(expr)
}

/// プライマリをパースする
pub fn parse_primary(pair: Pair<Rule>) -> Result<Expr, ExprError> {
    match pair.as_rule() {
        Rule::number => {
            let text = pair.as_str();
            let v: f64 = text
                .parse()
                .map_err(|_| ExprError::Syntax(format!("invalid number: {}", text)))?;
            Ok(Expr::Number(v))
        }
        Rule::string => Ok(Expr::String(unquote(pair.as_str()))),
        Rule::bool => Ok(Expr::Bool(pair.as_str() == "true")),
        Rule::null => Ok(Expr::Null),
        Rule::ident => Ok(Expr::Ident(pair.as_str().to_string())),
        Rule::helper_call => {
            let mut inner = pair.into_inner();
            let name = next_pair(&mut inner, "helper name")?.as_str().to_string();
            let args = inner.map(parse_expr).collect::<Result<Vec<_>, _>>()?;
            Ok(Expr::FunctionCall { name, args })
        }
        Rule::array => {
            let xs = pair.into_inner().map(parse_expr).collect::<Result<Vec<_>, _>>()?;
            Ok(Expr::Array(xs))
        }
        Rule::object => {
            let mut kvs = Vec::new();
            for kv in pair.into_inner() {
                let mut it = kv.into_inner();
                let k_pair = next_pair(&mut it, "object key")?;

                // キーは識別子または文字列
                let k = match k_pair.as_rule() {
                    Rule::string => unquote(k_pair.as_str()),
                    _ => k_pair.as_str().to_string(),
                };

                let v = parse_expr(next_pair(&mut it, "object value")?)?;
                kvs.push((k, v));
            }
            Ok(Expr::Object(kvs))
        }
        Rule::expr => parse_expr(pair),
        other => Err(ExprError::Syntax(format!("unexpected rule {:?}", other))),
    }
}
