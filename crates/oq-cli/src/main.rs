//! # oq: command-line client for the query service
//!
//! - `oq run --who <id>`: Send a data query for one user.
//! - `oq parse <query>`: Check a query locally and print its model.
//! - `oq status`: Ping the service.

use clap::{Parser, Subcommand};
use tabled::{settings::Style, Table, Tabled};

use oq_core::{ParseError, Query};

const DEFAULT_QUERY: &str =
    "METAQUERY WHERE userid IS {who} QUERY TYPE IN {types} SORT BY time AS Timestamp REVERSED";
const DEFAULT_TYPES: &str = "cbg, smbg, bolus, wizard";
const DEFAULT_ENV: &str = "http://localhost:9220";
const TOKEN_HEADER: &str = "x-tidepool-session-token";

#[derive(Parser)]
#[command(name = "oq", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a data query against the service.
    Run {
        /// Who we are fetching data for (user id or email).
        #[arg(long, short = 'w')]
        who: String,

        /// Comma separated data types wanted.
        #[arg(long, short = 't', default_value = DEFAULT_TYPES)]
        types: String,

        /// Query template; `{who}` and `{types}` are substituted.
        #[arg(long, short = 'q', default_value = DEFAULT_QUERY)]
        query: String,

        /// Base url of the service, e.g. http://localhost:8009
        #[arg(long, short = 'e', default_value = DEFAULT_ENV)]
        env: String,

        /// Session token (falls back to OQ_TOKEN).
        #[arg(long)]
        token: Option<String>,
    },

    /// Parse a query locally and print the model.
    Parse { query: String },

    /// Check that the service and its store are reachable.
    Status {
        #[arg(long, short = 'e', default_value = DEFAULT_ENV)]
        env: String,
    },
}

#[derive(Tabled)]
struct ErrorRow {
    #[tabled(rename = "Code")]
    code: &'static str,
    #[tabled(rename = "Message")]
    message: String,
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Parse { query } => match Query::parse(&query) {
            Ok(parsed) => match serde_json::to_string_pretty(&parsed) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            },
            Err(errors) => {
                println!("{}", error_table(&errors));
                std::process::exit(1);
            }
        },

        Commands::Run {
            who,
            types,
            query,
            env,
            token,
        } => {
            let token = token.or_else(|| std::env::var("OQ_TOKEN").ok());
            block_on(run_query(&who, &types, &query, &env, token.as_deref()));
        }

        Commands::Status { env } => block_on(status(&env)),
    }
}

/// Drive a network command on a current-thread runtime; exit non-zero when it
/// reports failure.
fn block_on(command: impl std::future::Future<Output = bool>) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to build tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if !rt.block_on(command) {
        std::process::exit(1);
    }
}

async fn run_query(
    who: &str,
    types: &str,
    template: &str,
    env: &str,
    token: Option<&str>,
) -> bool {
    let client = reqwest::Client::new();
    let to_run = fill_template(template, who, types);
    eprintln!("for [{}] run [{}] in env [{}]", who, to_run, env);

    let url = format!("{}/query/data", env.trim_end_matches('/'));
    match post_request(&client, &url, token, to_run).await {
        Ok(resp) => {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            println!("Query [{}] {}", status, body);
            status.is_success()
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            false
        }
    }
}

async fn status(env: &str) -> bool {
    let url = format!("{}/status", env.trim_end_matches('/'));
    match reqwest::Client::new().get(&url).send().await {
        Ok(resp) => {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            println!("Status [{}] {}", status, body);
            status.is_success()
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            false
        }
    }
}

fn fill_template(template: &str, who: &str, types: &str) -> String {
    template.replace("{who}", who).replace("{types}", types)
}

fn error_table(errors: &[ParseError]) -> String {
    let rows: Vec<ErrorRow> = errors
        .iter()
        .map(|e| ErrorRow {
            code: e.code(),
            message: e.to_string(),
        })
        .collect();
    Table::new(&rows).with(Style::modern()).to_string()
}

async fn post_request(
    client: &reqwest::Client,
    url: &str,
    token: Option<&str>,
    body: String,
) -> Result<reqwest::Response, reqwest::Error> {
    let mut req = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body);
    if let Some(t) = token {
        req = req.header(TOKEN_HEADER, t);
    }
    req.send().await
}
