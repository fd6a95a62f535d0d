use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Command-line client for the queue gateway HTTP API", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:3000")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show broker connection and circuit state
    Health,
    /// Check readiness
    Ready,
    /// Publish a JSON message
    Publish {
        #[arg(short, long, default_value = "")]
        exchange: String,
        #[arg(short, long)]
        routing_key: String,
        /// Message body as JSON
        message: String,
        #[arg(long)]
        transient: bool,
    },
    /// Declare an exchange
    CreateExchange {
        name: String,
        #[arg(short = 't', long = "type", default_value = "direct")]
        kind: String,
    },
    /// Declare a queue
    CreateQueue {
        name: String,
        #[arg(long)]
        dead_letter_exchange: Option<String>,
    },
    /// Bind a queue to an exchange
    Bind {
        queue: String,
        exchange: String,
        #[arg(default_value = "")]
        routing_key: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let api = format!("{}/api/v1", cli.url.trim_end_matches('/'));

    let res = match cli.command {
        Commands::Health => client.get(format!("{}/healthz", cli.url)).send().await?,
        Commands::Ready => client.get(format!("{}/healthz/ready", cli.url)).send().await?,
        Commands::Publish {
            exchange,
            routing_key,
            message,
            transient,
        } => {
            let message: Value = serde_json::from_str(&message)?;
            client
                .post(format!("{}/publish", api))
                .json(&json!({
                    "exchange": exchange,
                    "routing_key": routing_key,
                    "message": message,
                    "options": { "persistent": !transient },
                }))
                .send()
                .await?
        }
        Commands::CreateExchange { name, kind } => {
            client
                .post(format!("{}/exchanges", api))
                .json(&json!({ "name": name, "type": kind }))
                .send()
                .await?
        }
        Commands::CreateQueue {
            name,
            dead_letter_exchange,
        } => {
            let mut options = json!({});
            if let Some(dlx) = dead_letter_exchange {
                options["dead_letter_exchange"] = Value::String(dlx);
            }
            client
                .post(format!("{}/queues", api))
                .json(&json!({ "name": name, "options": options }))
                .send()
                .await?
        }
        Commands::Bind {
            queue,
            exchange,
            routing_key,
        } => {
            client
                .post(format!("{}/bindings", api))
                .json(&json!({
                    "queue": queue,
                    "exchange": exchange,
                    "routing_key": routing_key,
                }))
                .send()
                .await?
        }
    };

    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;
    let body = match serde_json::from_str::<Value>(&text) {
        Ok(json) => serde_json::to_string_pretty(&json)?,
        Err(_) => text,
    };

    if status.is_success() {
        println!("{}", body);
    } else {
        eprintln!("Error: gateway returned status {}", status);
        eprintln!("{}", body);
        std::process::exit(1);
    }
    Ok(())
}
