// Nutrio CLI - receipts, entitlements and coin balances from the terminal

mod client;
mod report;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;
use uuid::Uuid;

use client::{Client, Reply, DEFAULT_SERVER};
use report::Inspection;

/// Nutrio - payment reconciliation operator tool
#[derive(Parser)]
#[command(name = "nutrio")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Work with App Store receipts
    Receipt {
        #[command(subcommand)]
        action: ReceiptAction,
    },
    /// Check whether a user is entitled to a product right now
    Entitlement {
        user: Uuid,
        product: String,

        #[arg(short, long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Show a user's coin balance
    Balance {
        user: Uuid,

        #[arg(short, long, default_value = DEFAULT_SERVER)]
        server: String,
    },
}

#[derive(Subcommand)]
enum ReceiptAction {
    /// Parse a receipt offline and list its transactions
    Inspect {
        /// Path to a verifyReceipt response (JSON)
        path: PathBuf,
    },
    /// Submit a receipt to the server for a user
    Submit {
        path: PathBuf,

        #[arg(short, long)]
        user: Uuid,

        #[arg(short, long, default_value = DEFAULT_SERVER)]
        server: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Receipt { action } => handle_receipt(action),
        Commands::Entitlement {
            user,
            product,
            server,
        } => handle_entitlement(&Client::new(&server), user, &product),
        Commands::Balance { user, server } => handle_balance(&Client::new(&server), user),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn handle_receipt(action: ReceiptAction) -> anyhow::Result<()> {
    match action {
        ReceiptAction::Inspect { path } => {
            let raw = report::load_receipt(&path)?;
            match report::inspect(&raw) {
                Inspection::Valid { bundle_id, lines } => {
                    println!(
                        "{} {} ({} transaction(s))",
                        "✓".green().bold(),
                        bundle_id.as_deref().unwrap_or("unknown bundle").bold(),
                        lines.len()
                    );
                    for line in lines {
                        println!("  {}", line);
                    }
                }
                Inspection::Retry {
                    status,
                    description,
                } => {
                    println!(
                        "{} status {}: {} (retry later)",
                        "…".yellow().bold(),
                        status,
                        description
                    );
                }
                Inspection::Rejected { reason } => {
                    eprintln!("{} {}", "✗".red().bold(), reason.red());
                    std::process::exit(2);
                }
            }
            Ok(())
        }
        ReceiptAction::Submit { path, user, server } => {
            let raw = report::load_receipt(&path)?;
            let receipt: serde_json::Value = serde_json::from_str(&raw)?;
            let reply = Client::new(&server).submit_receipt(user, receipt)?;
            print_reply(&reply);

            if let Some(outcomes) = reply.body["outcomes"].as_array() {
                for outcome in outcomes {
                    let kind = outcome["outcome"].as_str().unwrap_or("unknown");
                    let external_id = outcome["order"]["externalId"].as_str().unwrap_or("-");
                    let label = match kind {
                        "processed" => kind.green(),
                        "already_processed" => kind.cyan(),
                        "retry_later" => kind.yellow(),
                        _ => kind.red(),
                    };
                    println!("  {} {}", label, external_id);
                }
            }
            exit_on_failure(&reply);
            Ok(())
        }
    }
}

fn handle_entitlement(client: &Client, user: Uuid, product: &str) -> anyhow::Result<()> {
    let reply = client.entitlement(user, product)?;
    ensure_success(&reply)?;

    let entitled = reply.body["entitled"].as_bool().unwrap_or(false);
    if entitled {
        println!(
            "{} {} is entitled to {} until {}",
            "✓".green().bold(),
            user,
            product,
            reply.body["expiresAt"].as_str().unwrap_or("-")
        );
    } else {
        println!("{} {} is not entitled to {}", "✗".red().bold(), user, product);
    }
    Ok(())
}

fn handle_balance(client: &Client, user: Uuid) -> anyhow::Result<()> {
    let reply = client.balance(user)?;
    ensure_success(&reply)?;
    println!(
        "{} coins",
        reply.body["balance"].as_i64().unwrap_or(0).to_string().bold()
    );
    Ok(())
}

fn print_reply(reply: &Reply) {
    let status = if reply.is_success() {
        reply.status.to_string().green()
    } else {
        reply.status.to_string().red()
    };
    match &reply.retry_after {
        Some(seconds) => println!("HTTP {} (retry after {}s)", status, seconds),
        None => println!("HTTP {}", status),
    }
}

fn exit_on_failure(reply: &Reply) {
    if !reply.is_success() {
        std::process::exit(1);
    }
}

fn ensure_success(reply: &Reply) -> anyhow::Result<()> {
    if reply.is_success() {
        return Ok(());
    }
    print_reply(reply);
    let message = match &reply.body {
        serde_json::Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other)?,
    };
    Err(anyhow::anyhow!(message))
}
