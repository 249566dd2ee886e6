//! rssp-cli - sign PDF documents through a remote CSC signing service

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use rssp::{
    CertificatesMode, CredentialInfoRequest, CredentialsListRequest, PdfAdapter, RsspClient,
    sign_document,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_RSSP_URL: &str = "http://localhost:8080";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// RSSP server URL
    #[arg(short, long, env = "RSSP_URL", default_value = DEFAULT_RSSP_URL)]
    url: String,

    /// Bearer access token for the CSC API
    #[arg(short, long, env = "RSSP_ACCESS_TOKEN")]
    token: String,

    /// Output as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sign a PDF with a remote credential
    Sign {
        /// PDF to sign
        #[arg(short, long)]
        input: PathBuf,

        /// Where to write the signed PDF (default: <name>_signed.pdf next to the input)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Credential alias to sign with
        #[arg(short, long)]
        credential: String,

        /// Signer name recorded in the signature dictionary
        #[arg(long)]
        name: Option<String>,

        /// Reason recorded in the signature dictionary
        #[arg(long)]
        reason: Option<String>,
    },

    /// List the caller's credentials
    Credentials,

    /// Show one credential with its certificate details
    Credential {
        /// Credential alias
        alias: String,
    },

    /// Show service information
    Info,
}

fn signed_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    input.with_file_name(format!("{}_signed.pdf", stem))
}

async fn cmd_sign(
    cli: &Cli,
    input: &Path,
    output: Option<&Path>,
    credential: &str,
    name: Option<&str>,
    reason: Option<&str>,
) -> Result<()> {
    let output = output.map(Path::to_path_buf).unwrap_or_else(|| signed_path(input));
    let document = std::fs::read(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;

    if !cli.json {
        println!(
            "{}",
            format!("Signing {} with {}...", input.display(), credential).green()
        );
    }

    let mut adapter = PdfAdapter::new();
    if let Some(name) = name {
        adapter = adapter.with_name(name);
    }
    if let Some(reason) = reason {
        adapter = adapter.with_reason(reason);
    }
    let client = RsspClient::new(&cli.url, cli.token.as_str()).with_credential(credential);

    let signed = sign_document(&adapter, &client, &document)
        .await
        .context("Signing failed")?;

    std::fs::write(&output, &signed)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    if cli.json {
        println!(
            "{}",
            serde_json::json!({
                "input": input.display().to_string(),
                "output": output.display().to_string(),
                "credential": credential,
                "size": signed.len(),
            })
        );
    } else {
        println!("{}", "Document signed!".green().bold());
        println!("  Output: {}", output.display().to_string().cyan());
        println!("  Size:   {} bytes", signed.len());
    }
    Ok(())
}

async fn cmd_credentials(cli: &Cli) -> Result<()> {
    let client = RsspClient::new(&cli.url, cli.token.as_str());

    let mut aliases = Vec::new();
    let mut request = CredentialsListRequest::default();
    loop {
        let page = client
            .list_credentials(&request)
            .await
            .context("Failed to list credentials")?;
        aliases.extend(page.credential_ids);
        match page.next_page_token {
            Some(token) => request.page_token = Some(token),
            None => break,
        }
    }

    if cli.json {
        println!("{}", serde_json::json!(aliases));
        return Ok(());
    }

    if aliases.is_empty() {
        println!("{}", "No credentials.".yellow());
        return Ok(());
    }

    println!("{}", "Credentials:".cyan().bold());
    for alias in &aliases {
        println!("  {}", alias);
    }
    Ok(())
}

async fn cmd_credential(cli: &Cli, alias: &str) -> Result<()> {
    let client = RsspClient::new(&cli.url, cli.token.as_str());
    let info = client
        .credential_info(&CredentialInfoRequest {
            credential_id: Some(alias.to_string()),
            certificates: CertificatesMode::Single,
            cert_info: true,
            auth_info: false,
        })
        .await
        .with_context(|| format!("Failed to fetch credential {}", alias))?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let key_status = if info.key.status == "enabled" {
        info.key.status.green()
    } else {
        info.key.status.red()
    };
    println!("{}", format!("Credential {}", alias).cyan().bold());
    println!("{}", "=".repeat(60));
    println!("  {}: {}", "Key".cyan(), key_status);
    println!("  {}: {} bits", "Length".cyan(), info.key.len);
    println!("  {}: {}", "Algorithms".cyan(), info.key.algo.join(", "));
    if let Some(subject) = &info.cert.subject_dn {
        println!("  {}: {}", "Subject".cyan(), subject);
    }
    if let Some(issuer) = &info.cert.issuer_dn {
        println!("  {}: {}", "Issuer".cyan(), issuer);
    }
    if let (Some(from), Some(to)) = (&info.cert.valid_from, &info.cert.valid_to) {
        println!("  {}: {} - {}", "Validity".cyan(), from, to);
    }
    println!("  {}: {}", "Certificate".cyan(), info.cert.status);
    println!("  {}: {}", "Multisign".cyan(), info.multisign);
    Ok(())
}

async fn cmd_info(cli: &Cli) -> Result<()> {
    let client = RsspClient::new(&cli.url, cli.token.as_str());
    let info = client.info().await.context("Failed to fetch service info")?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("{}", info.name.cyan().bold());
    println!("{}", "=".repeat(60));
    println!("  {}: {}", "CSC".cyan(), info.specs);
    println!("  {}: {}", "Region".cyan(), info.region);
    println!("  {}: {}", "Auth".cyan(), info.auth_type.join(", "));
    println!("  {}:", "Methods".cyan());
    for method in &info.methods {
        println!("    {}", method);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Sign {
            input,
            output,
            credential,
            name,
            reason,
        } => {
            cmd_sign(
                &cli,
                input,
                output.as_deref(),
                credential,
                name.as_deref(),
                reason.as_deref(),
            )
            .await
        }
        Commands::Credentials => cmd_credentials(&cli).await,
        Commands::Credential { alias } => cmd_credential(&cli, alias).await,
        Commands::Info => cmd_info(&cli).await,
    }
}
