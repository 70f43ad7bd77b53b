use std::time::Duration;

use clap::Parser;
use graft_reqwest::{ClientConfig, RefreshingClient};
use graft_tokens::{AccessToken, ClientId, CredentialPair, RefreshToken, TenantId};
use serde_json::Value;

#[derive(Debug, Parser)]
struct Opts {
    /// The access token to start with
    #[arg(long, env = "MS_GRAPH_ACCESS_TOKEN", hide_env_values = true)]
    access_token: String,

    /// The refresh token used to renew the access token
    #[arg(long, env = "MS_GRAPH_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: Option<String>,

    /// The tenant that issued the tokens
    #[arg(short, long, env = "MS_GRAPH_TENANT_ID", default_value = "common")]
    tenant: String,

    /// The client ID to identify to the authority when refreshing
    #[arg(short, long, env)]
    client_id: Option<String>,

    /// The API base URL
    #[arg(long, env = "MS_GRAPH_BASE_URL", default_value = graft_reqwest::config::DEFAULT_BASE_URL)]
    base_url: String,

    /// The path to request
    #[arg(default_value = "/me")]
    path: String,

    /// Request timeout, in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let mut config = ClientConfig::default()
        .with_base_url(opts.base_url)
        .with_tenant(TenantId::from(opts.tenant))
        .with_timeout(Duration::from_secs(opts.timeout));
    if let Some(client_id) = opts.client_id {
        config = config.with_client_id(ClientId::from(client_id));
    }

    let credentials = CredentialPair::new(
        AccessToken::from(opts.access_token),
        opts.refresh_token.map(RefreshToken::from),
    );
    let client = RefreshingClient::new(credentials, &config)?;

    match client.token_claims().await {
        Ok(claims) => tracing::info!(
            status = ?claims.status(),
            expires_at = claims.expires_at().0,
            until_expired = claims.time_until_expiry(),
            "loaded access token"
        ),
        Err(err) => tracing::warn!(error = %err, "access token cannot be inspected"),
    }

    let response: Value = client.get(&opts.path).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    Ok(())
}
