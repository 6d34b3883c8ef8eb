use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flow_core::{
    ActionGateway, CapabilityState, FlowController, FlowEvent, FlowOutcome, HttpActionGateway,
    Phase,
};
use shared::domain::ParticipantId;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, Overrides, Settings};

#[derive(Parser, Debug)]
#[command(about = "Run payment, trustline, and clearing flows against a credit-network backend")]
struct Cli {
    /// Config file; defaults to ./flowctl.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    server_url: Option<String>,
    #[arg(long, global = true)]
    equivalent: Option<String>,
    /// 1 routes over direct trustlines only.
    #[arg(long, global = true)]
    max_hops: Option<u8>,
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Participants,
    Trustlines,
    Targets {
        #[arg(long)]
        from: Option<String>,
    },
    Pay {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: String,
        amount: String,
    },
    #[command(subcommand)]
    Trustline(TrustlineCommand),
    Clearing,
}

#[derive(Subcommand, Debug)]
enum TrustlineCommand {
    Create {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: String,
        #[arg(long)]
        limit: String,
    },
    Update {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: String,
        #[arg(long)]
        limit: String,
    },
    Close {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: String,
        /// Confirm the close; without it the command only arms.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let overrides = Overrides {
        server_url: cli.server_url.clone(),
        equivalent: cli.equivalent.clone(),
        max_hops: cli.max_hops,
        request_timeout_ms: cli.timeout_ms,
    };
    let settings = load_settings(cli.config.as_deref(), &overrides)?;
    info!(
        server_url = %settings.server_url,
        equivalent = %settings.equivalent,
        max_hops = settings.max_hops,
        "flowctl starting"
    );

    let gateway: Arc<dyn ActionGateway> = Arc::new(HttpActionGateway::new(
        &settings.server_url,
        settings.request_timeout(),
    )?);
    let controller = FlowController::new(gateway, settings.flow_options());
    spawn_event_logger(&controller);

    match cli.command {
        Command::Participants => {
            controller
                .refresh_participants()
                .await
                .context("failed to load participants")?;
            for participant in controller.participants().await {
                println!("{}\t{}", participant.id, participant.display_name);
            }
        }
        Command::Trustlines => {
            controller
                .refresh_trustlines()
                .await
                .context("failed to load trustlines")?;
            for line in controller.trustlines().await {
                println!(
                    "{} -> {}\tlimit={} used={} available={} status={:?}",
                    line.from_id, line.to_id, line.limit, line.used, line.available, line.status
                );
            }
        }
        Command::Targets { from } => {
            let from = sender(from, &settings)?;
            expect_advanced(controller.start_payment_flow().await)?;
            controller.select_node(from.clone()).await;
            match controller.payment_targets().await {
                Some(CapabilityState::Known(targets)) if targets.is_empty() => {
                    println!("no recipients reachable from {from}");
                }
                Some(CapabilityState::Known(targets)) => {
                    for target in targets {
                        println!("{target}");
                    }
                }
                Some(CapabilityState::Degraded(message)) => {
                    bail!("payment targets unavailable: {message}")
                }
                Some(CapabilityState::Loading) | None => bail!("payment targets not loaded"),
            }
        }
        Command::Pay { from, to, amount } => {
            let from = sender(from, &settings)?;
            load_directory(&controller).await;
            expect_advanced(controller.start_payment_flow().await)?;
            controller.select_node(from).await;
            controller.payment_targets().await;
            expect_advanced(controller.select_node(ParticipantId::new(to)).await)?;

            controller.set_payment_amount(&amount).await;
            if let Some(warning) = controller.payment_check().await.and_then(|check| check.warning) {
                warn!("{warning}");
            }
            report(&controller, controller.confirm_payment(&amount).await).await?;
        }
        Command::Trustline(command) => run_trustline(&controller, &settings, command).await?,
        Command::Clearing => {
            expect_advanced(controller.start_clearing_flow().await)?;
            report(&controller, controller.confirm_clearing().await).await?;
            if let Some(clearing) = controller.selection().await.last_clearing {
                for (index, cycle) in clearing.cycles.iter().enumerate() {
                    let path = cycle
                        .edges
                        .iter()
                        .map(|edge| format!("{}->{}", edge.from_id, edge.to_id))
                        .collect::<Vec<_>>()
                        .join(", ");
                    println!("cycle {}: {} cleared over {path}", index + 1, cycle.cleared_amount);
                }
            }
            controller.acknowledge_clearing().await;
        }
    }

    Ok(())
}

async fn run_trustline(
    controller: &FlowController,
    settings: &Settings,
    command: TrustlineCommand,
) -> Result<()> {
    load_directory(controller).await;
    match command {
        TrustlineCommand::Create { from, to, limit } => {
            let from = sender(from, settings)?;
            expect_advanced(controller.start_trustline_flow().await)?;
            controller.select_node(from).await;
            expect_advanced(controller.select_node(ParticipantId::new(to)).await)?;
            if controller.phase().await == Phase::EditingTrustline {
                bail!("trustline already exists; use `trustline update`");
            }
            report(controller, controller.confirm_trustline_create(&limit).await).await
        }
        TrustlineCommand::Update { from, to, limit } => {
            let from = sender(from, settings)?;
            expect_advanced(
                controller
                    .select_trustline(from, ParticipantId::new(to))
                    .await,
            )?;
            report(controller, controller.confirm_trustline_update(&limit).await).await
        }
        TrustlineCommand::Close { from, to, yes } => {
            let from = sender(from, settings)?;
            expect_advanced(
                controller
                    .select_trustline(from, ParticipantId::new(to))
                    .await,
            )?;
            let outcome = controller.confirm_trustline_close().await;
            if outcome != FlowOutcome::Armed {
                return report(controller, outcome).await;
            }
            if !yes {
                println!("close armed; re-run with --yes to close the trustline");
                return Ok(());
            }
            report(controller, controller.confirm_trustline_close().await).await
        }
    }
}

fn sender(from: Option<String>, settings: &Settings) -> Result<ParticipantId> {
    from.map(ParticipantId::new)
        .or_else(|| settings.actor())
        .context("no sender given; pass --from or set FLOWCTL_ACTOR")
}

async fn load_directory(controller: &FlowController) {
    if let Err(err) = controller.refresh_participants().await {
        warn!("participants unavailable: {err}");
    }
    if let Err(err) = controller.refresh_trustlines().await {
        warn!("trustlines unavailable: {err}");
    }
}

fn expect_advanced(outcome: FlowOutcome) -> Result<()> {
    match outcome {
        FlowOutcome::Advanced => Ok(()),
        FlowOutcome::Rejected(message) => bail!("{message}"),
        other => bail!("unexpected flow state: {other:?}"),
    }
}

async fn report(controller: &FlowController, outcome: FlowOutcome) -> Result<()> {
    match outcome {
        FlowOutcome::Completed | FlowOutcome::Advanced => {
            if let Some(notice) = controller.snapshot().await.notice {
                println!("{}", notice.text);
            }
            Ok(())
        }
        FlowOutcome::Armed => Ok(()),
        FlowOutcome::Rejected(message) => bail!("rejected: {message}"),
        FlowOutcome::Failed(message) => bail!("backend error: {message}"),
        FlowOutcome::Ignored => bail!(
            "action not available in phase {}",
            controller.phase().await
        ),
    }
}

fn spawn_event_logger(controller: &FlowController) {
    let mut events = controller.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(FlowEvent::PhaseChanged { from, to }) => debug!(%from, %to, "event: phase"),
                Ok(FlowEvent::HistoryRecorded(entry)) => {
                    debug!(kind = entry.kind.label(), outcome = ?entry.outcome, "event: {}", entry.summary)
                }
                Ok(event) => debug!(?event, "event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
