// ========================================
// エラー定義
// ========================================
//
// ページ全体を止めるエラーは存在しない。各層で捕捉してログに残すのが基本方針。

use thiserror::Error;

/// 式の解析・評価エラー（呼び出し側では元の {{expr}} テキストに戻す）
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExprError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("{0} is not defined")]
    Undefined(String),

    #[error("cannot read property '{property}' of null")]
    NullAccess { property: String },

    #[error("${0} is not a registered helper")]
    UnknownHelper(String),

    #[error("helper ${name} failed: {message}")]
    Helper { name: String, message: String },
}

/// 対象コンポーネント・ブロック・データソースが見つからない
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResolutionError {
    #[error("component '{0}' not found")]
    Component(String),

    #[error("element with data-name=\"{0}\" not found")]
    Element(String),

    #[error("block '{0}' not found")]
    Block(String),

    #[error("composite component '{0}' not found")]
    Composite(String),

    #[error("query '{0}' not found")]
    Query(String),
}

/// アクション実行中のエラー（ディスパッチャで握りつぶす）
#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Expression(#[from] ExprError),

    #[error("missing option '{0}'")]
    MissingOption(&'static str),

    #[error("invalid value for {action}: {message}")]
    InvalidValue { action: String, message: String },
}

/// 通信エラー（ユーザーにアラートで通知する）
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("unexpected status code {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("invalid response body: {0}")]
    Decode(String),

    #[error("no fixture for {0}")]
    Fixture(String),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("invalid component definition in block '{block}': {message}")]
    Definition { block: String, message: String },

    #[error("page load payload is missing")]
    MissingPayload,

    #[error("markup error: {0}")]
    Markup(String),

    #[error("config error: {0}")]
    Config(String),
}
