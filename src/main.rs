//! scanguard CLI entry point.
//!
//! `start` runs the session pulse monitor until Ctrl-C. The other
//! subcommands perform one control plane operation against the shared
//! database and print the result as JSON.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use scanguard::audit::{AuditQuery, Severity};
use scanguard::authz::{AuthorizationStatus, Decision, SubmitAuthorization, TargetType};
use scanguard::config::{self, Config};
use scanguard::logging;
use scanguard::service::{ActivateRequest, ControlPlane, DecideRequest, PreflightRequest};

/// scanguard: authorization and safety control plane for scan platforms.
#[derive(Parser)]
#[command(name = "scanguard", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the session pulse monitor until interrupted.
    Start,
    /// Platform emergency stop.
    Emergency {
        #[command(subcommand)]
        command: EmergencyCommand,
    },
    /// Per-target scan authorizations.
    Authz {
        #[command(subcommand)]
        command: AuthzCommand,
    },
    /// Tamper-evident audit trail.
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
}

#[derive(Subcommand)]
enum EmergencyCommand {
    /// Stop all scans and block new ones.
    Stop {
        /// Why the platform is being stopped.
        #[arg(long)]
        reason: String,
        /// Minutes until the stop lapses (configured default when omitted).
        #[arg(long)]
        minutes: Option<u32>,
        /// Operator performing the stop.
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Lift the stop.
    Resume {
        /// Operator lifting the stop.
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Show the current stop state.
    Status,
}

#[derive(Subcommand)]
enum AuthzCommand {
    /// Submit a signed authorization for review.
    Submit {
        /// Owning tenant.
        #[arg(long)]
        tenant: String,
        /// Target kind: ip, domain, cidr or url.
        #[arg(long = "type")]
        target_type: String,
        /// Target value.
        #[arg(long)]
        value: String,
        /// Reference to the signed document.
        #[arg(long)]
        document: String,
        /// Who signed the document.
        #[arg(long)]
        authorized_by: String,
        /// Start of the window (RFC 3339).
        #[arg(long)]
        from: DateTime<Utc>,
        /// End of the window (RFC 3339).
        #[arg(long)]
        until: DateTime<Utc>,
        /// Scope limitations noted on the document.
        #[arg(long)]
        scope: Option<String>,
        /// Operator submitting the record.
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// List a tenant's authorizations, newest first.
    List {
        /// Owning tenant.
        #[arg(long)]
        tenant: String,
        /// Only records with this status.
        #[arg(long)]
        status: Option<String>,
    },
    /// Approve or reject a pending authorization.
    Decide {
        /// Record id.
        #[arg(long)]
        id: Uuid,
        /// approve or reject.
        #[arg(long)]
        action: String,
        /// Required when rejecting.
        #[arg(long)]
        reason: Option<String>,
        /// Verifier performing the review.
        #[arg(long)]
        verifier: String,
    },
    /// Check whether a target is authorized right now.
    Check {
        /// Owning tenant.
        #[arg(long)]
        tenant: String,
        /// Target kind.
        #[arg(long = "type")]
        target_type: String,
        /// Target value.
        #[arg(long)]
        value: String,
    },
}

#[derive(Subcommand)]
enum AuditCommand {
    /// Export entries as JSON.
    Export {
        /// Inclusive lower bound (RFC 3339).
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        /// Exclusive upper bound (RFC 3339).
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        /// Only this actor.
        #[arg(long)]
        actor: Option<String>,
        /// Only this tenant.
        #[arg(long)]
        tenant: Option<String>,
        /// Only this action.
        #[arg(long)]
        action: Option<String>,
        /// Minimum severity.
        #[arg(long)]
        severity: Option<String>,
        /// Row cap.
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Replay the signature chain.
    Verify,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = config::runtime_paths()?;
    if paths.env_file.exists() {
        dotenvy::from_path(&paths.env_file)
            .with_context(|| format!("failed to load {}", paths.env_file.display()))?;
    }
    let config = Config::load().context("failed to load configuration")?;

    match cli.command {
        Command::Start => handle_start(config, &paths).await,
        Command::Emergency { command } => {
            logging::init_cli(&config.logging.level);
            handle_emergency(command, config).await
        }
        Command::Authz { command } => {
            logging::init_cli(&config.logging.level);
            handle_authz(command, config).await
        }
        Command::Audit { command } => {
            logging::init_cli(&config.logging.level);
            handle_audit(command, config).await
        }
    }
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to encode output")?
    );
    Ok(())
}

/// Run the pulse monitor until Ctrl-C.
async fn handle_start(config: Config, paths: &config::RuntimePaths) -> anyhow::Result<()> {
    let _logging_guard = logging::init_production(&paths.logs_dir, &config.logging.level)?;
    let plane = ControlPlane::from_config(config).await?;
    let status = plane.emergency_status().await?;
    if status.active {
        warn!(reason = ?status.reason, expires_at = ?status.expires_at, "starting while emergency stop is active");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = plane
        .http_pulse_monitor()
        .context("failed to build pulse monitor")?;
    let handle = match monitor {
        Some(monitor) => {
            let monitor = Arc::new(monitor);
            Some(tokio::spawn(async move { monitor.run(shutdown_rx).await }))
        }
        None => {
            info!("pulse monitor disabled: set [pulse] authority_url to enable");
            None
        }
    };

    info!("scanguard started");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("received shutdown signal");

    // Receivers may already be gone if the monitor exited.
    let _ = shutdown_tx.send(true);
    if let Some(handle) = handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "pulse monitor task failed");
        }
    }
    info!("scanguard stopped");
    Ok(())
}

async fn handle_emergency(command: EmergencyCommand, config: Config) -> anyhow::Result<()> {
    let plane = ControlPlane::from_config(config).await?;
    match command {
        EmergencyCommand::Stop {
            reason,
            minutes,
            actor,
        } => {
            let request = ActivateRequest {
                reason,
                duration_minutes: minutes,
            };
            print_json(&plane.activate_emergency_stop(&request, &actor).await?)
        }
        EmergencyCommand::Resume { actor } => {
            print_json(&plane.deactivate_emergency_stop(&actor).await?)
        }
        EmergencyCommand::Status => print_json(&plane.emergency_status().await?),
    }
}

async fn handle_authz(command: AuthzCommand, config: Config) -> anyhow::Result<()> {
    let plane = ControlPlane::from_config(config).await?;
    match command {
        AuthzCommand::Submit {
            tenant,
            target_type,
            value,
            document,
            authorized_by,
            from,
            until,
            scope,
            actor,
        } => {
            let request = SubmitAuthorization {
                target_type: TargetType::parse(&target_type)?,
                target_value: value,
                authorized_by,
                document_ref: document,
                valid_from: from,
                valid_until: until,
                scope_notes: scope,
            };
            print_json(&plane.submit_authorization(&tenant, &actor, request).await?)
        }
        AuthzCommand::List { tenant, status } => {
            let status = status
                .as_deref()
                .map(AuthorizationStatus::parse)
                .transpose()?;
            print_json(&plane.list_authorizations(&tenant, status).await?)
        }
        AuthzCommand::Decide {
            id,
            action,
            reason,
            verifier,
        } => {
            let request = DecideRequest {
                id,
                action: Decision::parse(&action)?,
                reason,
            };
            print_json(&plane.decide_authorization(request, &verifier).await?)
        }
        AuthzCommand::Check {
            tenant,
            target_type,
            value,
        } => {
            let request = PreflightRequest {
                target_type: TargetType::parse(&target_type)?,
                target_value: value,
            };
            print_json(&plane.preflight(&tenant, &request).await?)
        }
    }
}

async fn handle_audit(command: AuditCommand, config: Config) -> anyhow::Result<()> {
    let plane = ControlPlane::from_config(config).await?;
    match command {
        AuditCommand::Export {
            from,
            until,
            actor,
            tenant,
            action,
            severity,
            limit,
        } => {
            let query = AuditQuery {
                from,
                until,
                actor_id: actor,
                tenant_id: tenant,
                action,
                min_severity: severity.as_deref().map(Severity::parse).transpose()?,
                limit,
            };
            print_json(&plane.export_audit(&query).await?)
        }
        AuditCommand::Verify => {
            let report = plane.verify_audit_chain().await?;
            print_json(&report)?;
            if !report.intact {
                anyhow::bail!(
                    "audit chain broken at seq {}",
                    report.first_broken_seq.unwrap_or_default()
                );
            }
            Ok(())
        }
    }
}
