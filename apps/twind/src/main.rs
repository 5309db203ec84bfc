use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::EnvFilter;
use twin_kernel::GatewayBuilder;
use twin_protocol::{
    ActionHandler, AgentCallback, MessageType, Recipient, SnaFilter, SnaMessage, SubscribeRequest,
    SubscriptionId,
};
use twin_registry::{ProviderModel, ResourceModel, ServiceModel};

#[derive(Debug, Parser)]
#[command(name = "twind")]
#[command(about = "Twin gateway demo daemon")]
struct Cli {
    /// Namespace of this gateway; generated when omitted.
    #[arg(long)]
    namespace: Option<String>,
    #[arg(long, default_value = "45.2:5.7")]
    location: String,
    #[arg(long, default_value = "info")]
    log_filter: String,
    #[arg(long)]
    json_logs: bool,
}

struct LoggingAgent;

impl AgentCallback for LoggingAgent {
    fn register(&self, message: &SnaMessage) -> Result<()> {
        info!(
            path = %message.path,
            kind = ?message.kind,
            payload = %message.payload,
            "agent.message"
        );
        Ok(())
    }
}

struct LoggingRecipient;

impl Recipient for LoggingRecipient {
    fn callback(&self, subscription: &SubscriptionId, message: &SnaMessage) -> Result<()> {
        info!(%subscription, path = %message.path, value = ?message.value(), "subscription.update");
        Ok(())
    }
}

struct Calibrate;

impl ActionHandler for Calibrate {
    fn act(&self, arguments: &[Value]) -> Result<Value> {
        let offset = arguments.first().and_then(Value::as_f64).unwrap_or_default();
        Ok(json!({ "offset": offset }))
    }
}

fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_filter));
    if cli.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let mut builder = GatewayBuilder::new().default_location(cli.location.clone());
    if let Some(namespace) = &cli.namespace {
        builder = builder.namespace(namespace);
    }
    let gateway = builder.build()?;
    info!(namespace = gateway.namespace(), "gateway started");

    gateway.register_provider(
        ProviderModel::new("Thermometer")
            .service(
                ServiceModel::new("data").resource(
                    ResourceModel::data("temperature", json!(21.5)).attribute("unit", json!("C")),
                ),
            )
            .service(
                ServiceModel::new("control")
                    .resource(ResourceModel::action("calibrate", Arc::new(Calibrate))),
            ),
    )?;

    gateway
        .register_agent(
            "twind",
            Arc::new(LoggingAgent),
            SnaFilter::new("/Thermometer")
                .with_types([MessageType::Update, MessageType::Lifecycle]),
        )
        .await?;

    let session = gateway.anonymous_session();
    info!(token = %session.token(), public_key = %session.public_key(), "session opened");

    let subscribed = gateway
        .subscribe(
            &session,
            "Thermometer",
            "data",
            "temperature",
            SubscribeRequest::new(Arc::new(LoggingRecipient))
                .constraint(json!([{ "operator": ">", "operand": 22 }])),
        )
        .await;
    info!(response = %subscribed.to_json(), "subscribe");

    let reading = gateway
        .get(&session, "Thermometer", "data", "temperature", None)
        .await;
    info!(response = %reading.to_json(), "get");

    let unit = gateway
        .get(&session, "Thermometer", "data", "temperature", Some("unit"))
        .await;
    info!(response = %unit.to_json(), "get attribute");

    for value in [21.8, 22.4, 23.1] {
        gateway.push_update("Thermometer", "data", "temperature", json!(value), None)?;
    }

    let written = gateway
        .set(&session, "Thermometer", "data", "temperature", None, json!(19.0))
        .await;
    info!(response = %written.to_json(), "set");

    let acted = gateway
        .act(&session, "Thermometer", "control", "calibrate", vec![json!(0.5)])
        .await;
    info!(response = %acted.to_json(), "act");

    let listing = gateway.all(&session, None).await;
    info!(response = %listing.to_json(), "complete list");

    gateway.flush().await;
    gateway.close().await;
    Ok(())
}
