pub mod ast;
pub mod expr;
pub mod markup;
pub mod parse;
pub mod utils;

use std::fs;
use std::path::Path;

use crate::dom_renderer::Document;
use crate::engine::error::RuntimeError;

pub use markup::parse_markup;
pub use parse::parse_expression;

// ページのマークアップファイルを読み込んでDocumentを返す。
pub fn parse_page_file<P: AsRef<Path>>(path: P) -> Result<Document, RuntimeError> {
    let source = fs::read_to_string(path.as_ref())
        .map_err(|e| RuntimeError::Markup(format!("IO error: {}", e)))?;

    parse_markup(&source)
}
