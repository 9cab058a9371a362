//! IPC mailbox server binary
//!
//! Settings come from `NAME=value` command-line arguments and uppercased
//! environment variables, argument winning:
//!
//! ```bash
//! ipc-mailbox PORT=9163
//! ipc-mailbox PORT=9163 TOKEN=secret MAX_PAYLOAD=32768
//! PORT=9163 SSL=1 CERT_PATH=cert.pem KEY_PATH=key.pem ipc-mailbox
//! ```

use std::collections::HashMap;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ipc_mailbox::{MailboxServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "ipc-mailbox")]
#[command(about = "Coordination mailbox for cooperating database processes")]
#[command(version)]
struct Args {
    /// Settings of the form NAME=value (HOST, PORT, SSL, KEY_PATH,
    /// CERT_PATH, PFX_PATH, PASSPHRASE, TOKEN, MAX_PAYLOAD, DEV)
    #[arg(value_name = "NAME=value")]
    settings: Vec<String>,
}

/// Merge environment variables and command-line settings, uppercased;
/// arguments win.
fn gather_settings<E>(env: E, args: &[String]) -> HashMap<String, String>
where
    E: IntoIterator<Item = (String, String)>,
{
    let mut settings: HashMap<String, String> = env
        .into_iter()
        .map(|(name, value)| (name.to_uppercase(), value))
        .collect();
    for arg in args {
        if let Some((name, value)) = arg.split_once('=') {
            settings.insert(name.to_uppercase(), value.to_string());
        }
    }
    settings
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let settings = gather_settings(std::env::vars(), &args.settings);
    let config = ServerConfig::from_settings(&settings)?;

    let server = MailboxServer::new(config);
    let addr = server.start().await?;
    info!("IPC mailbox server started on {}", addr);

    // Under a process manager, announce readiness explicitly
    if std::env::var_os("NODE_APP_INSTANCE").is_some() && std::env::var_os("pm_id").is_some() {
        info!("ready");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_argument_wins_over_environment() {
        let args = vec!["port=9163".to_string(), "Token=abc".to_string()];
        let settings = gather_settings(env(&[("PORT", "80"), ("host", "example")]), &args);

        // Uppercasing happens on both sides
        assert_eq!(settings.get("PORT").map(String::as_str), Some("9163"));
        assert_eq!(settings.get("TOKEN").map(String::as_str), Some("abc"));
        assert_eq!(settings.get("HOST").map(String::as_str), Some("example"));
    }

    #[test]
    fn test_malformed_arguments_ignored() {
        let args = vec!["PORT".to_string()];
        let settings = gather_settings(env(&[]), &args);
        assert!(!settings.contains_key("PORT"));
    }
}
