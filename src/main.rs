use cui_server::infra::{
    DB_FILE_NAME, HistoryIndexer, IN_MEMORY_DATA_DIR, SessionStore, resolve_data_dir,
    resolve_projects_dir,
};
use cui_server::server::broadcast::Broadcaster;
use cui_server::server::{AppState, run_http_server};
use cui_server::util::log_event;
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_PORT: u16 = 3001;

#[derive(Debug)]
struct ServeConfig {
    port: u16,
    projects_dir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
}

fn parse_args(argv: &[String]) -> Result<ServeConfig, String> {
    fn read_flag(args: &[String], name: &str) -> Option<String> {
        let idx = args.iter().position(|a| a == name)?;
        args.get(idx + 1).cloned()
    }

    let args = &argv[1..];
    if args.iter().any(|a| a == "--help" || a == "-h") {
        return Err(format!(
            "usage: {} [--port N] [--projects-dir PATH] [--data-dir PATH|:memory:]",
            argv.first().map(String::as_str).unwrap_or("cui-server")
        ));
    }

    let port = match read_flag(args, "--port") {
        Some(raw) => raw
            .parse::<u16>()
            .map_err(|_| format!("Invalid --port: {raw}"))?,
        None => DEFAULT_PORT,
    };

    Ok(ServeConfig {
        port,
        projects_dir: read_flag(args, "--projects-dir").map(PathBuf::from),
        data_dir: read_flag(args, "--data-dir").map(PathBuf::from),
    })
}

fn open_store(data_dir: &PathBuf) -> Result<SessionStore, String> {
    if data_dir.as_os_str() == IN_MEMORY_DATA_DIR {
        return SessionStore::open_in_memory().map_err(|error| error.to_string());
    }
    SessionStore::open(&data_dir.join(DB_FILE_NAME)).map_err(|error| error.to_string())
}

#[tokio::main]
async fn main() {
    let argv: Vec<String> = std::env::args().collect();
    let config = match parse_args(&argv) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };

    let projects_dir = match config.projects_dir.map(Ok).unwrap_or_else(|| {
        resolve_projects_dir().map_err(|error| error.to_string())
    }) {
        Ok(dir) => dir,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(1);
        }
    };

    let data_dir = match config.data_dir.map(Ok).unwrap_or_else(|| {
        resolve_data_dir().map_err(|error| error.to_string())
    }) {
        Ok(dir) => dir,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(1);
        }
    };

    let store = match open_store(&data_dir) {
        Ok(store) => Arc::new(store),
        Err(message) => {
            eprintln!("failed to open session store: {message}");
            std::process::exit(1);
        }
    };

    let broadcaster = Arc::new(Broadcaster::new());
    let indexer = HistoryIndexer::new(store.clone(), broadcaster.clone(), projects_dir.clone());
    indexer.start();

    let state = AppState {
        store,
        broadcaster,
        projects_dir: projects_dir.clone(),
    };

    log_event(
        "server.start",
        serde_json::json!({
            "port": config.port,
            "projects_dir": projects_dir.display().to_string(),
            "data_dir": data_dir.display().to_string(),
        }),
    );

    if let Err(message) = run_http_server(config.port, state).await {
        indexer.stop();
        eprintln!("{message}");
        std::process::exit(1);
    }
}
