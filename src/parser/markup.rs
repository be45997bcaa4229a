// ========================================
// ページマークアップパーサーモジュール
// ========================================
//
// ビルダーが出力したHTMLを読み込み、Documentツリーを構築します。

use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;

use crate::dom_renderer::{Document, NodeId};
use crate::engine::error::RuntimeError;
use crate::parser::utils::decode_entities;

#[derive(Parser)]
#[grammar = "parser/markup.pest"]
pub struct MarkupParser;

/// マークアップ文字列を解析してDocumentを生成する
pub fn parse_markup(source: &str) -> Result<Document, RuntimeError> {
    let mut pairs = MarkupParser::parse(Rule::document, source)
        .map_err(|e| RuntimeError::Markup(e.to_string()))?;

    let document = pairs
        .next()
        .ok_or_else(|| RuntimeError::Markup("empty document".into()))?;

    let mut doc = Document::new();
    let root = doc.root();
    for pair in document.into_inner() {
        build_node(&mut doc, root, pair);
    }

    log::debug!("Parsed markup into {} top-level nodes", doc.element_children(root).len());
    Ok(doc)
}

fn build_node(doc: &mut Document, parent: NodeId, pair: Pair<Rule>) {
    match pair.as_rule() {
        Rule::element | Rule::void_element | Rule::raw_element => {
            let mut element = None;
            for inner in pair.into_inner() {
                match inner.as_rule() {
                    Rule::tag_name | Rule::void_tag | Rule::raw_tag => {
                        let id = doc.create_element(inner.as_str());
                        doc.append_child(parent, id);
                        element = Some(id);
                    }
                    Rule::attribute => {
                        if let Some(id) = element {
                            apply_attribute(doc, id, inner);
                        }
                    }
                    Rule::raw_text => {
                        if let Some(id) = element {
                            if !inner.as_str().is_empty() {
                                let text = doc.create_text(inner.as_str());
                                doc.append_child(id, text);
                            }
                        }
                    }
                    _ => {
                        if let Some(id) = element {
                            build_node(doc, id, inner);
                        }
                    }
                }
            }
        }
        Rule::text => {
            let raw = pair.as_str();
            // 空白のみのテキストは保持しない
            if raw.trim().is_empty() {
                return;
            }
            let text = doc.create_text(&decode_entities(raw));
            doc.append_child(parent, text);
        }
        // doctype・コメントは読み捨てる
        _ => {}
    }
}

fn apply_attribute(doc: &mut Document, element: NodeId, pair: Pair<Rule>) {
    let mut name = None;
    let mut value = String::new();
    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::attr_name => name = Some(part.as_str().to_string()),
            Rule::dq_value | Rule::sq_value | Rule::unquoted_value => {
                value = decode_entities(part.as_str());
            }
            _ => {}
        }
    }
    if let Some(name) = name {
        doc.set_attribute(element, &name, &value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom_renderer::Selector;

    #[test]
    fn test_parse_nested_elements_and_attributes() {
        let doc = parse_markup(
            r#"<!DOCTYPE html>
            <div data-name="list1" data-list-view-container class='x y'>
                <!-- row template -->
                <div data-list-view-item><span data-name="title">Hi &amp; bye</span></div>
            </div>"#,
        )
        .unwrap();

        let list = doc.find_by_attribute("data-name", "list1").unwrap();
        assert_eq!(doc.attribute(list, "class"), Some("x y"));
        assert_eq!(doc.attribute(list, "data-list-view-container"), Some(""));
        assert_eq!(doc.element_children(list).len(), 1);

        let title = doc.find_by_attribute("data-name", "title").unwrap();
        assert_eq!(doc.inner_html(title), "Hi &amp; bye");
    }

    #[test]
    fn test_void_and_self_closing_elements() {
        let doc = parse_markup(r#"<form><input data-name="email" type=text><br/><textarea data-name="memo"></textarea></form>"#).unwrap();
        let inputs = doc.query_selector_all(doc.root(), &[Selector::tag("input"), Selector::tag("textarea")]);
        assert_eq!(inputs.len(), 2);
        assert_eq!(doc.attribute(inputs[0], "type"), Some("text"));
    }

    #[test]
    fn test_script_content_is_raw() {
        let doc = parse_markup("<head><script>if (a < b) { x = '</div>'; }</script></head>").unwrap();
        let script = doc.query_selector(doc.root(), &[Selector::tag("script")]).unwrap();
        assert_eq!(doc.inner_html(script), "if (a < b) { x = '</div>'; }");
    }

    #[test]
    fn test_mismatched_tags_are_rejected() {
        assert!(matches!(parse_markup("<div><span></div>"), Err(RuntimeError::Markup(_))));
    }
}
