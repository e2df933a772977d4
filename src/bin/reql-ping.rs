use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use reql_core::{
    CloseOptions, ConnectOptions, ConnectionEvent, Driver, DriverOptions, QueryOptions,
    QueryResult,
};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "reql-ping")]
#[command(about = "Connect to a ReQL server, print its info and optionally run a query", long_about = None)]
struct Args {
    /// Server host (falls back to REQL_HOST)
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Server port (falls back to REQL_PORT)
    #[arg(short = 'P', long)]
    port: Option<u16>,

    /// User name (falls back to REQL_USER)
    #[arg(short, long)]
    user: Option<String>,

    /// Password (falls back to REQL_PASSWORD)
    #[arg(short, long)]
    password: Option<String>,

    /// Default database for the query
    #[arg(short, long)]
    db: Option<String>,

    /// Raw query term as JSON, e.g. '[15, [[14, ["test"]]]]'
    #[arg(short, long)]
    query: Option<String>,

    /// Print sequence rows one by one as they arrive
    #[arg(long)]
    stream: bool,

    /// Attach the server profile
    #[arg(long)]
    profile: bool,

    /// Keepalive period in seconds
    #[arg(long)]
    ping_interval: Option<u64>,

    /// Stay connected for this many keepalive rounds before closing
    #[arg(long, default_value_t = 0)]
    rounds: u32,
}

impl Args {
    fn connect_options(&self) -> anyhow::Result<ConnectOptions> {
        let mut options = ConnectOptions::from_env().context("Invalid REQL_* environment")?;
        if let Some(host) = &self.host {
            options.host = host.clone();
        }
        if let Some(port) = self.port {
            options.port = port;
        }
        if let Some(user) = &self.user {
            options.user = user.clone();
        }
        if let Some(password) = &self.password {
            options.password = password.clone();
        }
        if let Some(db) = &self.db {
            options.db = Some(db.clone());
        }
        if let Some(secs) = self.ping_interval {
            options.ping_interval = Some(secs);
        }
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reql_core=info,reql_ping=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let options = args.connect_options()?;
    let driver = Driver::with_options(DriverOptions {
        stream: args.stream,
        ..Default::default()
    });

    let conn = driver
        .connect(options.clone())
        .await
        .with_context(|| format!("Could not connect to {}", options.address()))?;

    let mut events = conn.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConnectionEvent::Release => {}
                ConnectionEvent::Error(e) => tracing::warn!("Connection error: {}", e),
                other => tracing::info!("Connection event: {:?}", other),
            }
        }
    });

    let info = conn.server_info().await?;
    println!("{}", serde_json::to_string_pretty(&info)?);

    if let Some(raw) = &args.query {
        let term: Value = serde_json::from_str(raw).context("Query is not valid JSON")?;
        let mut query_options = QueryOptions::default();
        query_options.profile = args.profile;

        let response = conn
            .run(serde_json::json!([1, term, {}]), query_options)
            .await?;
        match response.result {
            QueryResult::Stream(mut rows) => {
                while let Some(row) = rows.next().await {
                    println!("{}", row?);
                }
            }
            QueryResult::Cursor(cursor) => {
                // Feeds never end on their own.
                while let Ok(row) = cursor.next().await {
                    println!("{}", row);
                }
            }
            other => println!("{}", serde_json::to_string_pretty(&other.into_value()?)?),
        }
        if let Some(profile) = response.profile {
            println!("profile: {}", profile);
        }
    }

    if args.rounds > 0 {
        let period = options.ping_period().unwrap_or(Duration::from_secs(1));
        for round in 1..=args.rounds {
            tokio::time::sleep(period).await;
            tracing::info!("Round {}: connection open = {}", round, conn.is_open());
        }
    }

    conn.close(CloseOptions::noreply_wait(true)).await?;
    Ok(())
}
