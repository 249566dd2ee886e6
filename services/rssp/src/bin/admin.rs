//! RSSP Admin CLI
//!
//! Credential provisioning and access token minting against the same
//! configuration the service runs with.

use clap::{Parser, Subcommand};
use colored::Colorize;
use rssp::{Credential, Device, NewCredential, SigningService, SoftDevice};
use rssp_service::{DeviceKind, RsspConfig, bootstrap};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rssp-admin")]
#[command(about = "RSSP credential administration")]
struct Cli {
    /// Output as JSON
    #[arg(short, long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a key pair, certify it and store a new credential
    CreateCredential {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        alias: String,
        /// Certificate subject, e.g. "CN=Jane Doe"
        #[arg(long)]
        subject: String,
        /// ISO 3166 country code for the certificate
        #[arg(long)]
        country: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// List an owner's credentials
    List {
        #[arg(long)]
        owner: String,
    },
    /// Disable a credential so it can no longer be authorized
    Disable {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        alias: String,
    },
    /// Re-enable a disabled credential
    Enable {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        alias: String,
    },
    /// Delete a credential and its wrapped key
    Delete {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        alias: String,
    },
    /// Mint an access token for the CSC API
    Token {
        #[arg(long)]
        owner: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = RsspConfig::from_env()?;

    if let Commands::Token { owner } = &cli.command {
        return cmd_token(&config, owner, cli.json);
    }

    match config.device {
        DeviceKind::Software => {
            let service = bootstrap::signing_service(&config, Arc::new(SoftDevice::new()))?;
            execute(&service, cli.command, cli.json).await
        }
        #[cfg(feature = "pkcs11")]
        DeviceKind::Pkcs11 => {
            let device = bootstrap::open_pkcs11(&config)?;
            let service = bootstrap::signing_service(&config, Arc::new(device))?;
            execute(&service, cli.command, cli.json).await
        }
        #[cfg(not(feature = "pkcs11"))]
        DeviceKind::Pkcs11 => Err(anyhow::anyhow!("Built without PKCS#11 support")),
    }
}

async fn execute<D: Device>(
    service: &SigningService<D>,
    command: Commands,
    json: bool,
) -> anyhow::Result<()> {
    match command {
        Commands::CreateCredential {
            owner,
            alias,
            subject,
            country,
            description,
        } => {
            let credential = service
                .create_credential(NewCredential {
                    owner,
                    alias,
                    subject_dn: subject,
                    country,
                    description,
                })
                .await?;
            print_credential(&credential, json);
        }
        Commands::List { owner } => {
            let credentials = service.credentials_of(&owner).await?;
            if json {
                let summary: Vec<_> = credentials.iter().map(credential_json).collect();
                println!("{}", serde_json::json!(summary));
            } else if credentials.is_empty() {
                println!("{}", format!("No credentials for {}.", owner).yellow());
            } else {
                println!("{}", format!("Credentials of {}", owner).cyan().bold());
                println!("{}", "=".repeat(60));
                for credential in &credentials {
                    let state = if credential.enabled {
                        "enabled".green()
                    } else {
                        "disabled".red()
                    };
                    println!(
                        "  {} [{}] {}",
                        credential.alias.yellow(),
                        state,
                        credential.subject_dn
                    );
                }
            }
        }
        Commands::Disable { owner, alias } => {
            service.set_credential_enabled(&owner, &alias, false).await?;
            report(json, &alias, "disabled");
        }
        Commands::Enable { owner, alias } => {
            service.set_credential_enabled(&owner, &alias, true).await?;
            report(json, &alias, "enabled");
        }
        Commands::Delete { owner, alias } => {
            service.delete_credential(&owner, &alias).await?;
            report(json, &alias, "deleted");
        }
        Commands::Token { .. } => unreachable!("handled before device setup"),
    }
    Ok(())
}

fn cmd_token(config: &RsspConfig, owner: &str, json: bool) -> anyhow::Result<()> {
    let provider = bootstrap::access_tokens(config);
    let token = provider.issue(owner)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "access_token": token.raw,
                "expires_in": provider.lifetime_seconds(),
            })
        );
    } else {
        println!("{}", "Access Token".cyan().bold());
        println!("{}", "=".repeat(60));
        println!("  {}: {}", "Owner".cyan(), owner.yellow());
        println!("  {}: {}s", "Expires In".cyan(), provider.lifetime_seconds());
        println!("{}", token.raw);
    }
    Ok(())
}

fn credential_json(credential: &Credential) -> serde_json::Value {
    serde_json::json!({
        "id": credential.id,
        "owner": credential.owner,
        "alias": credential.alias,
        "enabled": credential.enabled,
        "subjectDN": credential.subject_dn,
        "issuerDN": credential.issuer_dn,
        "serialNumber": credential.serial_number,
        "validFrom": credential.valid_from,
        "validTo": credential.valid_to,
        "algorithms": credential.key_algorithm_oids,
    })
}

fn print_credential(credential: &Credential, json: bool) {
    if json {
        println!("{}", credential_json(credential));
        return;
    }
    println!("{}", "Credential Created".green().bold());
    println!("{}", "=".repeat(60));
    println!("  {}: {}", "ID".cyan(), credential.id);
    println!("  {}: {}", "Owner".cyan(), credential.owner);
    println!("  {}: {}", "Alias".cyan(), credential.alias.yellow());
    println!("  {}: {}", "Subject".cyan(), credential.subject_dn);
    println!("  {}: {}", "Issuer".cyan(), credential.issuer_dn);
    println!("  {}: {}", "Serial".cyan(), credential.serial_number);
    println!(
        "  {}: {} - {}",
        "Validity".cyan(),
        credential.valid_from,
        credential.valid_to
    );
}

fn report(json: bool, alias: &str, action: &str) {
    if json {
        println!("{}", serde_json::json!({ "alias": alias, "result": action }));
    } else {
        println!("Credential {} {}.", alias.yellow(), action);
    }
}
