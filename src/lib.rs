pub mod config;
pub mod dom_renderer;
pub mod engine;
pub mod parser;

use std::env;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::info;

pub use config::RuntimeConfig;
pub use engine::runtime::Runtime;
pub use engine::state::Page;
pub use engine::transport::{FixtureTransport, Host, ResourceLoader, Transport};

use engine::error::RuntimeError;

// ========================================
// コマンドライン引数構造体
// ========================================

/// コマンドライン引数の設定
#[derive(Debug)]
pub struct CliArgs {
    pub page: Option<PathBuf>,
    pub fixtures: Option<PathBuf>,
    pub server: Option<String>,
    pub config: Option<PathBuf>,
    pub page_id: Option<String>,
    pub print_store: bool,
    /// 定期実行クエリを動かしておく秒数（出力はその後）
    pub keep_alive_secs: Option<u64>,
    pub quiet: bool, // panic以外のログを抑制
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogLevel {
    Off,   // ログを一切表示しない（panicは除く）
    Error, // エラーレベルのみ
    Warn,  // 警告レベル以上
    Info,  // 情報レベル以上
    Debug, // デバッグレベル以上
    Trace, // 全てのログ
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            page: None,
            fixtures: None,
            server: None,
            config: None,
            page_id: None,
            print_store: true,
            keep_alive_secs: None,
            quiet: false,
            log_level: LogLevel::Info,
        }
    }
}

pub fn parse_args() -> CliArgs {
    let args: Vec<String> = env::args().collect();
    parse_args_from(&args[1.min(args.len())..])
}

pub fn parse_args_from(args: &[String]) -> CliArgs {
    let mut cli_args = CliArgs::default();

    for arg in args {
        match arg.as_str() {
            "--quiet" | "-q" => {
                cli_args.quiet = true;
                cli_args.log_level = LogLevel::Off;
            }
            "--log-level=off" => cli_args.log_level = LogLevel::Off,
            "--log-level=error" => cli_args.log_level = LogLevel::Error,
            "--log-level=warn" => cli_args.log_level = LogLevel::Warn,
            "--log-level=info" => cli_args.log_level = LogLevel::Info,
            "--log-level=debug" => cli_args.log_level = LogLevel::Debug,
            "--log-level=trace" => cli_args.log_level = LogLevel::Trace,
            "--no-store" => cli_args.print_store = false,
            "--help" | "-h" => {
                show_help();
                std::process::exit(0);
            }
            other => {
                if let Some(v) = other.strip_prefix("--page=") {
                    cli_args.page = Some(PathBuf::from(v));
                } else if let Some(v) = other.strip_prefix("--fixtures=") {
                    cli_args.fixtures = Some(PathBuf::from(v));
                } else if let Some(v) = other.strip_prefix("--server=") {
                    cli_args.server = Some(v.to_string());
                } else if let Some(v) = other.strip_prefix("--config=") {
                    cli_args.config = Some(PathBuf::from(v));
                } else if let Some(v) = other.strip_prefix("--page-id=") {
                    cli_args.page_id = Some(v.to_string());
                } else if let Some(v) = other.strip_prefix("--keep-alive=") {
                    match v.parse() {
                        Ok(secs) => cli_args.keep_alive_secs = Some(secs),
                        Err(_) => log::warn!("Invalid --keep-alive value: {}", v),
                    }
                } else {
                    log::warn!("Unknown argument: {}", other);
                }
            }
        }
    }
    cli_args
}

pub fn show_help() {
    info!("pagebind page runtime

USAGE:
    pagebind --page=FILE [OPTIONS]

OPTIONS:
    --page=FILE              Page markup to load
    --fixtures=DIR           Answer requests from JSON files in DIR
    --server=URL             Send requests to URL (overrides the config file)
    --config=FILE            Runtime config (JSON)
    --page-id=ID             Page id sent with getComponents
    --no-store               Do not print the component store
    --keep-alive=SECS        Keep periodic queries running for SECS before printing
    --quiet, -q              Suppress all logs except panics
    --log-level=LEVEL        Set log level (off/error/warn/info/debug/trace)
    --help, -h               Show this help");
}

/// ログレベルを初期化する関数
pub fn init_logger(log_level: &LogLevel) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::sync::Once;

    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let level = match log_level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        };

        let mut builder = Builder::from_default_env();

        if matches!(log_level, LogLevel::Off) {
            builder
                .filter_level(LevelFilter::Off)
                .format(|_, _| Ok(()))
                .try_init()
                .ok(); // エラーを無視
        } else {
            builder
                .filter_level(level)
                // HTTPクライアント関連のログを抑制
                .filter_module("reqwest", LevelFilter::Warn)
                .filter_module("hyper", LevelFilter::Warn)
                .filter_module("rustls", LevelFilter::Warn)
                .format_timestamp_secs()
                .try_init()
                .ok(); // エラーを無視
        }
    });
}

/// 引数と設定ファイルから実行時設定を組み立てる
pub fn resolve_config(cli_args: &CliArgs) -> Result<RuntimeConfig, RuntimeError> {
    let mut config = match &cli_args.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(server) = &cli_args.server {
        config.base_url = server.clone();
    }
    if let Some(page_id) = &cli_args.page_id {
        config.page_id = page_id.clone();
    }
    Ok(config)
}

/// ページのマークアップを読み込み、ランタイムを組み立てる
pub fn load_page<P: AsRef<Path>>(
    path: P,
    transport: Rc<dyn Transport>,
    loader: Rc<dyn ResourceLoader>,
    host: Rc<dyn Host>,
    config: RuntimeConfig,
) -> Result<Runtime, RuntimeError> {
    let document = parser::parse_page_file(&path)?;
    info!("📄 Loaded page {}", path.as_ref().display());
    Ok(Runtime::new(Page::new(document, host), transport, loader, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        let cli = parse_args_from(&args(&[
            "--page=index.html",
            "--fixtures=fx",
            "--server=http://api",
            "--log-level=debug",
            "--no-store",
            "--keep-alive=3",
        ]));
        assert_eq!(cli.page, Some(PathBuf::from("index.html")));
        assert_eq!(cli.fixtures, Some(PathBuf::from("fx")));
        assert_eq!(cli.server.as_deref(), Some("http://api"));
        assert_eq!(cli.log_level, LogLevel::Debug);
        assert!(!cli.print_store);
        assert_eq!(cli.keep_alive_secs, Some(3));
    }

    #[test]
    fn test_quiet_turns_logging_off() {
        let cli = parse_args_from(&args(&["-q"]));
        assert!(cli.quiet);
        assert_eq!(cli.log_level, LogLevel::Off);
    }

    #[test]
    fn test_resolve_config_overrides() {
        let mut cli = CliArgs::default();
        cli.server = Some("http://api".into());
        cli.page_id = Some("p9".into());
        let config = resolve_config(&cli).unwrap();
        assert_eq!(config.base_url, "http://api");
        assert_eq!(config.page_id, "p9");
    }
}
