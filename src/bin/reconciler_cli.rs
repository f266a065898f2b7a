use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use booking_reconciler::{
    config::{self, AppConfig},
    db::{self, DbPool},
    entities::payment_order,
    gateway::{phonepe::PhonePeClient, GatewayClient},
    handlers::AppServices,
    message_queue::{InMemoryMessageQueue, MessageQueue},
    notifications::{
        LoggingSink, NotificationDispatcher, NotificationWorker, QueueNotificationDispatcher,
    },
    services::{GatewayCheck, RetentionReport},
};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;

#[derive(Parser)]
#[command(
    name = "reconciler-cli",
    about = "Operator tooling for the payment-to-booking reconciler"
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON when available"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Run a single auto-completion pass over stale open payments
    PollOnce,
    /// Ask the gateway about one payment order and apply the answer
    Reconcile(ReconcileArgs),
    /// Enforce the per-user cart retention bound
    Retention(RetentionArgs),
    /// List payment orders flagged for manual review
    Review(ReviewArgs),
}

#[derive(Args)]
struct ReconcileArgs {
    /// Merchant order id, e.g. OKPUJA_0123456789AB
    merchant_order_id: String,
}

#[derive(Args)]
struct RetentionArgs {
    /// Limit to one user; all users otherwise
    #[arg(long)]
    user: Option<String>,
    /// Report what would be deleted without deleting
    #[arg(long, action = ArgAction::SetTrue)]
    dry_run: bool,
}

#[derive(Args)]
struct ReviewArgs {
    #[arg(long, default_value_t = 50)]
    limit: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let context = CliContext::initialize().await?;

    match cli.command {
        Commands::Migrate => {
            db::run_migrations(&context.db)
                .await
                .context("failed to run migrations")?;
            println!("Migrations applied");
        }
        Commands::PollOnce => {
            let report = context
                .services
                .poller
                .run_once()
                .await
                .context("poller pass failed")?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "examined {} • claimed {} • resolved {} • still pending {} • gateway errors {} • flagged {}",
                    report.examined,
                    report.claimed,
                    report.resolved,
                    report.still_pending,
                    report.gateway_errors,
                    report.flagged_for_review
                );
            }
        }
        Commands::Reconcile(args) => handle_reconcile(&context, args, cli.json).await?,
        Commands::Retention(args) => handle_retention(&context, args, cli.json).await?,
        Commands::Review(args) => {
            let orders = context
                .services
                .orders
                .list_needing_review(args.limit)
                .await
                .context("failed to load review queue")?;
            if cli.json {
                print_json(&orders)?;
            } else if orders.is_empty() {
                println!("Review queue is empty");
            } else {
                orders.iter().for_each(render_review_item);
            }
        }
    }

    context.flush_notifications().await
}

async fn handle_reconcile(context: &CliContext, args: ReconcileArgs, json: bool) -> Result<()> {
    let order = context
        .services
        .orders
        .get(&args.merchant_order_id)
        .await
        .with_context(|| format!("unknown payment order {}", args.merchant_order_id))?;

    let check = context
        .services
        .reconciler
        .refresh_from_gateway(&order)
        .await
        .context("reconciliation failed")?;

    let summary = match check {
        GatewayCheck::AlreadyTerminal(order) => ReconcileSummary {
            merchant_order_id: order.merchant_order_id,
            status: format!("{:?}", order.status).to_uppercase(),
            booking_id: None,
            note: Some("already terminal; gateway not called".into()),
        },
        GatewayCheck::Resolved(outcome) | GatewayCheck::StillPending(outcome) => {
            ReconcileSummary {
                merchant_order_id: outcome.merchant_order_id,
                status: format!("{:?}", outcome.status).to_uppercase(),
                booking_id: outcome.booking_id,
                note: None,
            }
        }
        GatewayCheck::Unavailable(e) => {
            return Err(anyhow!("gateway unavailable: {}", e));
        }
    };

    if json {
        print_json(&summary)?;
    } else {
        println!(
            "- {} • {} • booking {}{}",
            summary.merchant_order_id,
            summary.status,
            summary.booking_id.as_deref().unwrap_or("-"),
            summary
                .note
                .as_deref()
                .map(|n| format!(" ({})", n))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn handle_retention(context: &CliContext, args: RetentionArgs, json: bool) -> Result<()> {
    let retention = &context.services.retention;
    let reports: Vec<RetentionReport> = match (args.user, args.dry_run) {
        (Some(user), true) => vec![retention.preview(&user).await?],
        (Some(user), false) => vec![retention.enforce(&user).await?],
        (None, dry_run) => retention.sweep_all(dry_run).await?,
    };

    if json {
        return print_json(&reports);
    }

    let deleted: usize = reports.iter().map(|r| r.deleted_cart_ids.len()).sum();
    for report in reports.iter().filter(|r| !r.deleted_cart_ids.is_empty()) {
        println!(
            "- {} • {} {} • kept {}",
            report.user_id,
            if report.dry_run { "would delete" } else { "deleted" },
            report.deleted_cart_ids.join(", "),
            report.kept
        );
    }
    println!(
        "{} carts {} across {} users (keep {})",
        deleted,
        if args.dry_run { "eligible" } else { "deleted" },
        reports.len(),
        retention.keep()
    );
    Ok(())
}

#[derive(Serialize)]
struct ReconcileSummary {
    merchant_order_id: String,
    status: String,
    booking_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    note: Option<String>,
}

struct CliContext {
    _config: AppConfig,
    db: Arc<DbPool>,
    services: AppServices,
    queue: Arc<dyn MessageQueue>,
}

impl CliContext {
    async fn initialize() -> Result<Self> {
        let config = config::load_config().context("failed to load application config")?;
        config::init_tracing(config.log_level(), config.log_json);

        let db_pool = db::establish_connection_from_app_config(&config)
            .await
            .context("failed to connect to database")?;
        let db = Arc::new(db_pool);

        let gateway: Arc<dyn GatewayClient> = Arc::new(
            PhonePeClient::new(&config.gateway).context("failed to build gateway client")?,
        );
        let queue: Arc<dyn MessageQueue> = Arc::new(InMemoryMessageQueue::new());
        let dispatcher: Arc<dyn NotificationDispatcher> =
            Arc::new(QueueNotificationDispatcher::new(queue.clone()));

        let services = AppServices::new(db.clone(), &config, gateway, dispatcher);

        Ok(Self {
            _config: config,
            db,
            services,
            queue,
        })
    }

    /// Delivers confirmations enqueued by this run before the process exits
    async fn flush_notifications(&self) -> Result<()> {
        let delivered = NotificationWorker::new(self.queue.clone(), Arc::new(LoggingSink))
            .drain_once()
            .await
            .context("failed to deliver booking notifications")?;
        if delivered > 0 {
            println!("Delivered {} booking notification(s)", delivered);
        }
        Ok(())
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_review_item(order: &payment_order::Model) {
    println!(
        "- {} • user {} • cart {} • {:?} • {} {} • attempts {} • {}",
        order.merchant_order_id,
        order.user_id,
        order.cart_id.as_deref().unwrap_or("-"),
        order.status,
        order.amount,
        order.currency,
        order.check_attempts,
        order.review_reason.as_deref().unwrap_or("no reason recorded")
    );
}
