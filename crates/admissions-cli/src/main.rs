//! Admissions CLI - command-line access to the admissions portal API.
//!
//! Logs in once, keeps the session on disk (or in the OS keychain), and sends
//! authenticated requests, refreshing the access token as needed.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::broadcast::Receiver;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use admissions_core::api::{ApiRequest, SessionChange};
use admissions_core::{ApiClient, ApiError, Config, SessionStore};

const USAGE: &str = "\
Usage: admissions <command>

Commands:
  login [username]                 Log in and store the session
  logout                           Forget the stored session
  whoami                           Show the logged-in user
  get <path>                       GET a path and print the JSON response
  request <method> <path> [json]   Send any request and print the response
";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprint!("{}", USAGE);
        return Ok(());
    };

    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Failed to load config, using defaults");
            Config::default()
        }
    };

    let session = Arc::new(SessionStore::new(config.session_storage()?));
    session.initialize();

    let client = ApiClient::new(config.client_config(), session)?;
    let mut changes = client.subscribe_to_session_changes();
    info!(base_url = %client.config().base_url, "Admissions CLI starting");

    let result = match command.as_str() {
        "login" => login(&client, &mut config, args.get(1).cloned()).await,
        "logout" => {
            client.logout();
            println!("Logged out.");
            Ok(())
        }
        "whoami" => whoami(&client),
        "get" => match args.get(1) {
            Some(path) => send(&client, ApiRequest::get(path.as_str())).await,
            None => bail!("Missing path\n\n{}", USAGE),
        },
        "request" => match (args.get(1), args.get(2)) {
            (Some(method), Some(path)) => {
                let method = method
                    .to_uppercase()
                    .parse()
                    .with_context(|| format!("Invalid HTTP method: {}", method))?;
                let mut request = ApiRequest::new(method, path.as_str());
                if let Some(body) = args.get(3) {
                    let body: serde_json::Value =
                        serde_json::from_str(body).context("Request body is not valid JSON")?;
                    request = request.json(&body)?;
                }
                send(&client, request).await
            }
            _ => bail!("Missing method or path\n\n{}", USAGE),
        },
        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    };

    report_session_changes(&mut changes);
    result
}

async fn login(client: &ApiClient, config: &mut Config, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| std::env::var("ADMISSIONS_USERNAME").ok()) {
        Some(username) => username,
        None => prompt_username(config.last_username.as_deref())?,
    };
    let password = match std::env::var("ADMISSIONS_PASSWORD") {
        Ok(password) => password,
        Err(_) => rpassword::prompt_password("Password: ")?,
    };

    let identity = match client.login(&username, &password).await {
        Ok(identity) => identity,
        Err(ApiError::Unauthorized) => bail!("Invalid username or password"),
        Err(e) => return Err(e).context("Login failed"),
    };

    config.last_username = Some(username);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    println!("Logged in as {}.", identity.display_name());
    Ok(())
}

fn prompt_username(last: Option<&str>) -> Result<String> {
    match last {
        Some(last) => print!("Username [{}]: ", last),
        None => print!("Username: "),
    }
    io::stdout().flush()?;

    let mut username = String::new();
    io::stdin().read_line(&mut username)?;
    let username = username.trim();

    match (username.is_empty(), last) {
        (true, Some(last)) => Ok(last.to_string()),
        (true, None) => bail!("Username required"),
        (false, _) => Ok(username.to_string()),
    }
}

fn whoami(client: &ApiClient) -> Result<()> {
    let Some(identity) = client.session().identity() else {
        println!("Not logged in.");
        return Ok(());
    };

    println!("{} (user {})", identity.display_name(), identity.user_id);
    if let Some(ref email) = identity.email {
        println!("Email: {}", email);
    }
    let mut flags = Vec::new();
    if identity.is_superuser {
        flags.push("superuser".to_string());
    }
    if identity.is_staff {
        flags.push("staff".to_string());
    }
    flags.extend(identity.roles.iter().cloned());
    if !flags.is_empty() {
        println!("Roles: {}", flags.join(", "));
    }

    let now = Utc::now();
    if identity.time_until_expiry(now).num_seconds() > 0 {
        println!("Access token expires in {} min", identity.minutes_until_expiry(now));
    } else {
        println!("Access token expired; it will be refreshed on the next request");
    }
    Ok(())
}

async fn send(client: &ApiClient, request: ApiRequest) -> Result<()> {
    let response = match client.send(request).await {
        Ok(response) => response,
        Err(e) if e.is_session_expired() => {
            // Reported through the session change
            return Err(e.into());
        }
        Err(e) => return Err(e).context("Request failed"),
    };

    let status = response.status();
    let body = response.text().await.context("Failed to read response body")?;
    let rendered = match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(json) => serde_json::to_string_pretty(&json)?,
        Err(_) => body,
    };

    if status.is_success() {
        println!("{}", rendered);
        Ok(())
    } else {
        eprintln!("{}", rendered);
        bail!("Request failed with status {}", status)
    }
}

fn report_session_changes(changes: &mut Receiver<SessionChange>) {
    while let Ok(change) = changes.try_recv() {
        match change {
            SessionChange::Expired => {
                eprintln!("Your session has expired. Please log in again with `admissions login`.");
            }
            SessionChange::TokensRefreshed => info!("Session refreshed"),
            SessionChange::SignedIn | SessionChange::SignedOut => {}
        }
    }
}
