use std::time::Duration;

use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;

use routeway::security::{AuthVerifier, AuthenticationToken};

#[derive(Parser)]
#[command(name = "routeway-cli")]
#[command(about = "Development CLI for a routeway server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    /// Token sent as `Authorization: Bearer <token>`.
    #[arg(short, long, env = "ROUTEWAY_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Query the health route
    Health,
    /// Call a route
    Call {
        /// HTTP method (GET, POST, PUT, PATCH, DELETE)
        method: String,
        /// Concrete path, e.g. /send/42
        path: String,
        /// JSON body
        #[arg(short, long)]
        data: Option<String>,
    },
    /// Sign a development token
    Token {
        #[arg(short, long, env = "ROUTEWAY_AUTH_SECRET_KEY")]
        secret: String,
        /// Roles to embed, repeatable
        #[arg(short, long)]
        role: Vec<String>,
        /// Extra claims as a JSON object
        #[arg(short, long)]
        claims: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    if let Some(token) = &cli.token {
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", token))?);
    }

    match cli.command {
        Commands::Health => {
            let res = client
                .get(format!("{}/health", cli.url))
                .headers(headers)
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Call { method, path, data } => {
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())?;
            let mut request = client
                .request(method, format!("{}{}", cli.url, path))
                .headers(headers);
            if let Some(data) = data {
                let body: Value = serde_json::from_str(&data)?;
                request = request.json(&body);
            }
            print_response(request.send().await?).await?;
        }
        Commands::Token { secret, role, claims } => {
            // Lifetime only matters when verifying.
            let verifier = AuthVerifier::new(&secret, Duration::from_secs(0));
            let mut token = AuthenticationToken::issue(role);
            if let Some(claims) = claims {
                match serde_json::from_str::<Value>(&claims)? {
                    Value::Object(claims) => {
                        for (name, value) in claims {
                            token = token.with_claim(name, value);
                        }
                    }
                    _ => return Err("claims must be a JSON object".into()),
                }
            }
            println!("{}", verifier.sign(&token)?);
        }
    }

    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    for name in ["x-request-id", "x-rate-limit-remaining", "x-rate-limit-wait", "retry-after"] {
        if let Some(value) = res.headers().get(name).and_then(|v| v.to_str().ok()) {
            eprintln!("{}: {}", name, value);
        }
    }

    let text = res.text().await?;
    if !status.is_success() {
        eprintln!("Error: server returned status {}", status);
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", text),
    }
    Ok(())
}
