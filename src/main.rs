use std::process::ExitCode;
use std::rc::Rc;

use colored::Colorize;
use log::{error, info};

use pagebind::engine::query::start_periodic_queries;
use pagebind::engine::transport::{ConsoleHost, HttpTransport, NoopLoader, Transport};
use pagebind::{FixtureTransport, init_logger, load_page, parse_args, resolve_config};

fn main() -> ExitCode {
    let cli_args = parse_args();
    init_logger(&cli_args.log_level);

    let Some(page_path) = cli_args.page.clone() else {
        eprintln!("{} --page=FILE is required (see --help)", "error:".red().bold());
        return ExitCode::FAILURE;
    };

    let config = match resolve_config(&cli_args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    let transport: Rc<dyn Transport> = match &cli_args.fixtures {
        Some(dir) => {
            info!("📁 Serving requests from {}", dir.display());
            Rc::new(FixtureTransport::from_dir(dir))
        }
        None => match HttpTransport::new(&config.base_url, config.timeout_ms) {
            Ok(t) => Rc::new(t),
            Err(e) => {
                eprintln!("{} {}", "error:".red().bold(), e);
                return ExitCode::FAILURE;
            }
        },
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{} failed to start the async runtime: {}", "error:".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, async move {
        let rt = match load_page(&page_path, transport, Rc::new(NoopLoader), Rc::new(ConsoleHost), config) {
            Ok(rt) => Rc::new(rt),
            Err(e) => {
                error!("{}", e);
                eprintln!("{} {}", "error:".red().bold(), e);
                return ExitCode::FAILURE;
            }
        };

        if let Err(e) = rt.handle_page_load().await {
            eprintln!("{} {}", "error:".red().bold(), e);
            return ExitCode::FAILURE;
        }

        if let Some(secs) = cli_args.keep_alive_secs {
            let periodic = start_periodic_queries(&rt);
            info!("⏱️ Keeping {} periodic queries alive for {}s", periodic.len(), secs);
            tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
            periodic.stop();
        }

        let page = rt.page.borrow();
        println!("{}", page.document.to_html());
        if cli_args.print_store {
            match serde_json::to_string_pretty(&page.components_value()) {
                Ok(json) => println!("{}", json),
                Err(e) => error!("Failed to serialize the component store: {}", e),
            }
        }
        ExitCode::SUCCESS
    })
}
