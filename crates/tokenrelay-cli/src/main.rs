//! tokenrelay - command-line front end for the authenticated API client.
//!
//! Logs in, calls the backend through the request pipeline and shows what
//! the navigation guard would do with a given path.

use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokenrelay_core::api::Notifier;
use tokenrelay_core::auth::FileStore;
use tokenrelay_core::config::StorageKind;
use tokenrelay_core::router::Navigation;
use tokenrelay_core::{ApiClient, ApiError, ClientConfig, CredentialStore, Router};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

/// Set to `1` to also log to a daily file under the data directory
const ENV_LOG_FILE: &str = "TOKENRELAY_LOG_FILE";

const ENV_USERNAME: &str = "TOKENRELAY_USERNAME";
const ENV_PASSWORD: &str = "TOKENRELAY_PASSWORD";

const USAGE: &str = "\
Usage: tokenrelay <command> [args]

Commands:
  status                         Show whether a session is stored
  login [username]               Log in and store the session
  register <username>            Create an account
  logout                         End the session
  whoami                         Show the logged-in account
  sessions                       List analysis sessions
  upload <session_id> <file>     Upload a data file to a session
  analyze <session_id> <algo>    Run an analysis and print the result
  open <path>                    Show where navigating to <path> ends up
";

/// Prints the session-expired interrupt to the terminal
struct StderrNotifier;

impl Notifier for StderrNotifier {
    fn session_expired(&self, message: &str) {
        eprintln!("! {}", message);
    }
}

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let log_to_file = std::env::var(ENV_LOG_FILE).map(|v| v == "1").unwrap_or(false);
    let (file_layer, guard) = match ClientConfig::data_dir() {
        Ok(dir) if log_to_file => {
            let appender = tracing_appender::rolling::daily(dir.join("logs"), "tokenrelay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("status");
    if matches!(command, "help" | "--help" | "-h") {
        print!("{}", USAGE);
        return Ok(());
    }

    let config = ClientConfig::load().context("Failed to load configuration")?;
    debug!(base_url = %config.base_url, storage = ?config.storage, "Config loaded");

    let store = Arc::new(
        config
            .open_credentials()
            .context("Failed to open credential storage")?,
    );
    let router = Arc::new(Router::with_default_routes(Arc::clone(&store)));
    let client = ApiClient::new(&config, Arc::clone(&store), router.clone())?
        .with_notifier(Arc::new(StderrNotifier));

    let result = run(command, &args[args.len().min(1)..], &config, &store, &router, &client).await;

    if let Err(ref e) = result {
        if let Some(api_error) = e.downcast_ref::<ApiError>() {
            if api_error.requires_login() {
                if let Some(location) = router.current() {
                    eprintln!("-> {}", location);
                }
                eprintln!("Run `tokenrelay login` to start a new session.");
            }
        }
    }
    result
}

async fn run(
    command: &str,
    args: &[String],
    config: &ClientConfig,
    store: &CredentialStore,
    router: &Router,
    client: &ApiClient,
) -> Result<()> {
    match command {
        "status" => status(config, store),
        "login" => login(args.first().cloned(), router, client).await,
        "register" => {
            let username = args.first().context("register needs a username")?;
            let password = read_password()?;
            let user = client.register(username, &password).await?;
            println!("Registered {} (id {})", user.username, user.id);
            Ok(())
        }
        "logout" => {
            client.logout().await?;
            println!("Logged out");
            Ok(())
        }
        "whoami" => {
            let user = client.get_info().await?;
            println!("{} ({})", user.display_name(), user.username);
            Ok(())
        }
        "sessions" => {
            let sessions = client.get_sessions().await?;
            if sessions.is_empty() {
                println!("No sessions");
            }
            for session in sessions {
                println!("{}  {}", session.session_id, session.name);
            }
            Ok(())
        }
        "upload" => {
            let (session_id, file) = match args {
                [session_id, file, ..] => (session_id, Path::new(file)),
                _ => anyhow::bail!("upload needs <session_id> <file>"),
            };
            let bytes = std::fs::read(file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string());
            client.upload_file(session_id, &file_name, bytes).await?;
            println!("Uploaded {} to {}", file_name, session_id);
            Ok(())
        }
        "analyze" => {
            let (session_id, algorithm) = match args {
                [session_id, algorithm, ..] => (session_id, algorithm),
                _ => anyhow::bail!("analyze needs <session_id> <algorithm>"),
            };
            let result = client.analyze_predict(session_id, algorithm).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        "open" => {
            let path = args.first().map(String::as_str).unwrap_or("/");
            print_navigation(&router.push(path));
            Ok(())
        }
        other => {
            eprint!("{}", USAGE);
            anyhow::bail!("Unknown command: {}", other)
        }
    }
}

fn status(config: &ClientConfig, store: &CredentialStore) -> Result<()> {
    if store.is_authenticated() {
        println!("Logged in");
    } else {
        println!("Not logged in");
    }
    println!("Backend: {}", config.base_url);

    if config.storage == StorageKind::File {
        let path = config.token_file()?;
        let saved_at = FileStore::new(&path).saved_at().unwrap_or(None);
        match saved_at {
            Some(at) => println!("Tokens: {} (saved {})", path.display(), at.to_rfc3339()),
            None => println!("Tokens: {} (none)", path.display()),
        }
    } else {
        println!("Tokens: {:?} storage", config.storage);
    }
    Ok(())
}

async fn login(username: Option<String>, router: &Router, client: &ApiClient) -> Result<()> {
    let username = match username.or_else(|| std::env::var(ENV_USERNAME).ok()) {
        Some(name) => name,
        None => prompt_username()?,
    };
    let password = match std::env::var(ENV_PASSWORD) {
        Ok(password) => password,
        Err(_) => read_password()?,
    };

    router.push(tokenrelay_core::router::LOGIN_PATH);
    client
        .login(&username, &password)
        .await
        .context("Login failed")?;
    info!("Login successful");

    let navigation = router.complete_login();
    println!("Logged in as {}", username);
    print_navigation(&navigation);
    Ok(())
}

fn prompt_username() -> Result<String> {
    eprint!("Username: ");
    let mut username = String::new();
    io::stdin().read_line(&mut username)?;
    Ok(username.trim().to_string())
}

fn read_password() -> Result<String> {
    let password = rpassword::prompt_password("Password: ")?;
    Ok(password)
}

fn print_navigation(navigation: &Navigation) {
    let route = navigation.route.as_deref().unwrap_or("-");
    match navigation.redirected_from {
        Some(ref requested) => println!(
            "{} -> {} [{}] (login required)",
            requested, navigation.location, route
        ),
        None => println!("{} [{}]", navigation.location, route),
    }
}
