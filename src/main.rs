use std::net::SocketAddr;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use msp_automation::collaborators::Collaborators;
use msp_automation::{App, Config, crontab};

#[derive(Parser, Debug)]
#[command(name = "msp-automation", version, about = "Scheduler, automations and integration monitor")]
struct Cli {
    /// Admin API bind address
    #[arg(long, global = true, env = "HTTP_BIND")]
    bind: Option<SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run migrations, the scheduler and the admin API
    Serve,

    /// Apply database migrations and exit
    Migrate,

    /// Run one scheduled task now and print the recorded run
    RunTask {
        id: i64,
    },

    /// Deliver one batch of due webhook events
    ProcessWebhooks {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Print the next fire instants of a cron expression
    NextRun {
        expression: String,

        /// Reference instant (RFC 3339); defaults to now
        #[arg(long)]
        from: Option<DateTime<Utc>>,

        #[arg(long, default_value_t = 5)]
        count: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("msp_automation=info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();

    if let Command::NextRun {
        expression,
        from,
        count,
    } = &cli.command
    {
        let mut reference = from.unwrap_or_else(Utc::now);
        for _ in 0..*count {
            reference = crontab::next_after(expression, reference)?;
            println!("{}", reference.to_rfc3339());
        }
        return Ok(());
    }

    let mut config = Config::from_env().context("invalid configuration")?;
    if let Some(bind) = cli.bind {
        config.http_bind = bind;
    }

    let app = App::build(config, Collaborators::unconfigured())
        .await
        .context("failed to start services")?;

    match cli.command {
        Command::Migrate => {
            app.migrate().await.context("migrations failed")?;
            tracing::info!("Migrations applied");
        }
        Command::RunTask { id } => {
            match app.scheduler.run_now(id).await? {
                Some(run) => println!("{}", serde_json::to_string_pretty(&run)?),
                None => println!("Task {id} is running on another worker"),
            }
        }
        Command::ProcessWebhooks { limit } => {
            app.monitor.reap_stuck(app.config.scheduler.webhook_stuck_timeout).await?;
            let summary = app.monitor.process_pending(limit).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Serve => serve(app).await?,
        Command::NextRun { .. } => {}
    }
    Ok(())
}

async fn serve(app: App) -> anyhow::Result<()> {
    if let Err(e) = app.migrate().await {
        tracing::error!(error = %e, "Migrations failed; continuing with the existing schema");
    }

    let listener = app.start_background().await;

    let mut server = msp_automation::api::AdminServer::new(app.config.http_bind);
    server
        .start(app.router())
        .await
        .with_context(|| format!("failed to bind {}", app.config.http_bind))?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            tracing::info!("Shutdown requested");
        }
        _ = server.wait() => {
            tracing::warn!("Admin API stopped unexpectedly");
        }
    }

    server.shutdown().await;
    app.shutdown().await;
    if let Some(handle) = listener {
        handle.abort();
    }
    Ok(())
}
