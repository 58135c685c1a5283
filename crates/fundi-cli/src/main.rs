//! Fundi CLI - command-line shell for the Fundi client core
//!
//! Exercises the shared session, access-cache, and dashboard logic against a
//! Fundi backend: sign in, inspect session state, check labour access, and
//! pull admin stats.

mod access_store;
mod token_store;

use std::io::{self, IsTerminal, Write};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use thiserror::Error;

use fundi_core::access::{LabourAccess, LabourAccessCache};
use fundi_core::auth::RefreshApi;
use fundi_core::config::ClientConfig;
use fundi_core::dashboard::{RefreshOutcome, StatsPanel, StatsSnapshot};
use fundi_core::{ApiClient, ApiError, AuthClient, SessionState, TokenManager};

use crate::access_store::FileAccessStore;
use crate::token_store::KeyringTokenStore;

#[derive(Parser)]
#[command(name = "fundi")]
#[command(about = "Fundi marketplace client shell")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Named credential profile (separate keychain entries per profile)
    #[arg(long, default_value = "default")]
    profile: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and store the issued token pair in the keychain
    Login {
        /// Account email; password is read from stdin
        email: String,
    },
    /// Show session state and cached labour access
    Status,
    /// Force a token refresh against the backend
    Refresh,
    /// Clear the stored session
    Logout,
    /// Check labour-access status (cached first, then reconciled)
    Access {
        /// Optimistically grant access locally for N days (test builds only)
        #[cfg(feature = "dev-bypass")]
        #[arg(long, value_name = "DAYS")]
        grant: Option<i64>,
    },
    /// Fetch admin dashboard stats
    Stats,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Password must not be empty")]
    PasswordRequired,
    #[error("Not signed in. Run `fundi login <email>` first.")]
    NotSignedIn,
}

impl CliError {
    /// Expected, already-classified failures are reported quietly instead of
    /// being treated as crashes.
    fn is_expected(&self) -> bool {
        matches!(self, Self::Api(error) if error.is_expected())
    }
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        if error.is_expected() {
            tracing::info!("Expected failure: {error}");
        } else {
            tracing::error!("Command failed: {error}");
        }
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fundi=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let context = build_context(&cli.profile)?;

    match cli.command {
        Commands::Login { email } => run_login(&context, &email).await?,
        Commands::Status => run_status(&context),
        Commands::Refresh => run_refresh(&context).await?,
        Commands::Logout => run_logout(&context)?,
        #[cfg(feature = "dev-bypass")]
        Commands::Access { grant: Some(days) } => run_grant(&context, days)?,
        #[cfg(feature = "dev-bypass")]
        Commands::Access { grant: None } => run_access(&context).await?,
        #[cfg(not(feature = "dev-bypass"))]
        Commands::Access {} => run_access(&context).await?,
        Commands::Stats => run_stats(&context).await?,
    }

    Ok(())
}

struct AppContext {
    auth: AuthClient,
    tokens: Arc<TokenManager>,
    access: Arc<LabourAccessCache>,
    api: Arc<ApiClient>,
}

fn build_context(profile: &str) -> Result<AppContext, CliError> {
    let config = ClientConfig::from_env();
    let auth = AuthClient::new(config.auth_base_url()?)?;
    let tokens = Arc::new(TokenManager::new(
        Arc::new(auth.clone()) as Arc<dyn RefreshApi>,
        Arc::new(KeyringTokenStore::new(profile)),
    ));
    tokens.restore()?;

    let api = Arc::new(ApiClient::new(config.api_base_url()?, Arc::clone(&tokens))?);
    let access = Arc::new(LabourAccessCache::new(
        Arc::clone(&api),
        Arc::new(FileAccessStore::new(FileAccessStore::default_path())),
    ));
    access.restore()?;

    Ok(AppContext {
        auth,
        tokens,
        access,
        api,
    })
}

async fn run_login(context: &AppContext, email: &str) -> Result<(), CliError> {
    let password = read_password()?;
    let pair = context.auth.sign_in(email, &password).await?;
    context.tokens.store_token_pair(pair)?;
    println!("Signed in as {email}");
    Ok(())
}

fn run_status(context: &AppContext) {
    println!("Session: {}", describe_session(context.tokens.session_state()));
    match context.access.cached() {
        Some(access) => println!("{}", format_access_line(&access)),
        None => println!("Labour access: unknown (run `fundi access`)"),
    }
}

async fn run_refresh(context: &AppContext) -> Result<(), CliError> {
    if context.tokens.session_state() == SessionState::Expired {
        return Err(CliError::NotSignedIn);
    }
    let current = context.tokens.get_valid_token().await?;
    context.tokens.force_refresh(&current).await?;
    println!("Session refreshed");
    Ok(())
}

fn run_logout(context: &AppContext) -> Result<(), CliError> {
    context.tokens.sign_out()?;
    println!("Signed out");
    Ok(())
}

async fn run_access(context: &AppContext) -> Result<(), CliError> {
    // An explicit check is a refresh trigger: wait for the reconcile rather
    // than leaving it on a background task the exiting process would abort.
    match context.access.reconcile().await? {
        Some(access) => println!("{}", format_access_line(&access)),
        None => println!("Labour access: no status available"),
    }
    Ok(())
}

#[cfg(feature = "dev-bypass")]
fn run_grant(context: &AppContext, days: i64) -> Result<(), CliError> {
    let access = context.access.grant_labour_access(days)?;
    println!("Granted locally (pending server confirmation)");
    println!("{}", format_access_line(&access));
    Ok(())
}

async fn run_stats(context: &AppContext) -> Result<(), CliError> {
    let panel = StatsPanel::new(Arc::clone(&context.api));
    match panel.refresh().await {
        Ok(RefreshOutcome::Fetched(_) | RefreshOutcome::CoolingDown) => {}
        Err(ApiError::Forbidden(message)) => {
            // Role mismatch: show the denial, never a zeroed dashboard.
            println!("Access denied: {message}");
            return Ok(());
        }
        Err(error) => return Err(error.into()),
    }

    for line in format_stats_lines(&panel.snapshot()) {
        println!("{line}");
    }
    Ok(())
}

const fn describe_session(state: SessionState) -> &'static str {
    match state {
        SessionState::Valid => "valid",
        SessionState::Refreshable => "stale (will refresh on next request)",
        SessionState::Expired => "expired (sign in required)",
    }
}

fn format_access_line(access: &LabourAccess) -> String {
    if access.has_access {
        format!(
            "Labour access: active, {} day(s) remaining",
            access.days_remaining()
        )
    } else {
        "Labour access: inactive".to_string()
    }
}

fn format_stats_lines(snapshot: &StatsSnapshot) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(stats) = &snapshot.stats {
        lines.push(format!("Customers:         {}", stats.total_customers));
        lines.push(format!("Providers:         {}", stats.total_providers));
        lines.push(format!("Active jobs:       {}", stats.active_jobs));
        lines.push(format!("Completed jobs:    {}", stats.completed_jobs));
        lines.push(format!("Pending requests:  {}", stats.pending_requests));
    }
    if let Some(error) = &snapshot.last_error {
        // Stale stats stay on screen; the failure is noted underneath.
        lines.push(format!("(last refresh failed: {error})"));
    }
    if lines.is_empty() {
        lines.push("No stats loaded yet".to_string());
    }
    lines
}

fn read_password() -> Result<String, CliError> {
    if io::stdin().is_terminal() {
        eprint!("Password: ");
        io::stderr().flush()?;
    }
    let mut buffer = String::new();
    io::stdin().read_line(&mut buffer)?;
    let password = buffer.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        Err(CliError::PasswordRequired)
    } else {
        Ok(password)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use fundi_core::dashboard::DashboardStats;

    use super::*;

    #[test]
    fn describe_session_covers_all_states() {
        assert_eq!(describe_session(SessionState::Valid), "valid");
        assert!(describe_session(SessionState::Refreshable).contains("stale"));
        assert!(describe_session(SessionState::Expired).contains("sign in"));
    }

    #[test]
    fn access_line_reports_days_remaining() {
        let access = LabourAccess {
            has_access: true,
            start_date: None,
            end_date: Some(Utc::now() + Duration::days(5) + Duration::hours(1)),
        };
        assert_eq!(
            format_access_line(&access),
            "Labour access: active, 5 day(s) remaining"
        );

        let inactive = LabourAccess {
            has_access: false,
            start_date: None,
            end_date: None,
        };
        assert_eq!(format_access_line(&inactive), "Labour access: inactive");
    }

    #[test]
    fn stats_lines_keep_stale_stats_next_to_the_error() {
        let snapshot = StatsSnapshot {
            stats: Some(DashboardStats {
                total_customers: 120,
                total_providers: 34,
                active_jobs: 17,
                completed_jobs: 900,
                pending_requests: 5,
            }),
            last_error: Some("Server error (HTTP 500): database timeout".to_string()),
            access_denied: false,
        };

        let lines = format_stats_lines(&snapshot);
        assert!(lines.iter().any(|line| line.contains("17")));
        assert!(lines.last().unwrap().contains("last refresh failed"));
    }

    #[test]
    fn stats_lines_handle_the_empty_state() {
        let lines = format_stats_lines(&StatsSnapshot::default());
        assert_eq!(lines, vec!["No stats loaded yet".to_string()]);
    }

    #[test]
    fn expected_api_errors_are_flagged_for_quiet_reporting() {
        assert!(CliError::Api(ApiError::SessionExpired).is_expected());
        assert!(!CliError::Api(ApiError::Forbidden("role mismatch".to_string())).is_expected());
        assert!(!CliError::PasswordRequired.is_expected());
    }
}
