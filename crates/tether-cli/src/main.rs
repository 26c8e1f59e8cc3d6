//! Tether CLI: host the test services, or exercise a peer that hosts them.

mod cli;
mod config;
mod services;

use crate::cli::*;
use clap::Parser;
use std::sync::Arc;
use tether_runtime::{AnyObject, ObjectBuilder};
use tether_types::{DynamicValue, EndpointConfig, Error, Result};
use tether_wire::{Connection, Endpoint};
use tracing::info;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    let mut config = config::load_config(cli.config.as_deref());
    if let Some(name) = cli.name {
        config.name = name;
    }
    if cli.secret.is_some() {
        config.shared_secret = cli.secret;
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start the tokio runtime: {e}");
            std::process::exit(1);
        }
    };
    let outcome = rt.block_on(async move {
        match cli.command {
            Commands::Serve { listen } => cmd_serve(config, listen).await,
            Commands::Ping { url } => cmd_ping(config, url).await,
            Commands::Bench { url, count } => cmd_bench(config, url, count).await,
            Commands::Services { url } => cmd_services(config, url).await,
        }
    });
    if let Err(e) = outcome {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn cmd_serve(mut config: EndpointConfig, listen: Option<String>) -> Result<()> {
    if let Some(listen) = listen {
        config.listen = listen;
    }
    let url = config.listen.clone();
    let endpoint = Endpoint::new(config);
    endpoint.register_object(services::PING_PONG, &services::ping_pong()?)?;
    endpoint.register_object(
        services::REMOTE_PERFORMANCE,
        &services::remote_performance()?,
    )?;
    let addr = endpoint.listen(&url).await?;
    println!("Serving {} on tcp://{addr}", endpoint.registered_names().join(", "));

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, closing endpoint");
    endpoint.close();
    Ok(())
}

async fn connect(config: EndpointConfig, url: Option<String>) -> Result<(Arc<Endpoint>, Arc<Connection>)> {
    let url = url.unwrap_or_else(|| config.listen.clone());
    let endpoint = Endpoint::new(config);
    let conn = endpoint.connect(&url).await?;
    Ok((endpoint, conn))
}

/// A small object to hand to remote services.
fn probe() -> Result<AnyObject> {
    let mut b = ObjectBuilder::new();
    b.action0("ping", || Ok("pong".to_string()))?;
    b.action0("noop", || Ok(()))?;
    b.property("value", "i", DynamicValue::Int32(0))?;
    Ok(b.build())
}

async fn cmd_ping(config: EndpointConfig, url: Option<String>) -> Result<()> {
    let (_endpoint, conn) = connect(config, url).await?;
    let service = conn.get_object(services::PING_PONG).await?;
    let object = probe()?;

    service
        .call_named("give", vec![DynamicValue::from(object.clone())])
        .await?;
    let taken: AnyObject = service.call_typed("take", vec![]).await?;
    if !taken.ptr_eq(&object) {
        return Err(Error::Remote(format!(
            "took back {} instead of the object given ({})",
            taken.uid(),
            object.uid()
        )));
    }
    let answer: String = taken.call_typed("ping", vec![]).await?;
    println!("give/take round trip preserved identity ({}), ping -> {answer}", object.uid());
    conn.close();
    Ok(())
}

fn summarize(label: &str, durations: &[i64]) {
    if durations.is_empty() {
        println!("{label:<28} no samples");
        return;
    }
    let min = durations.iter().min().copied().unwrap_or_default();
    let max = durations.iter().max().copied().unwrap_or_default();
    let avg = durations.iter().sum::<i64>() / durations.len() as i64;
    println!(
        "{label:<28} n={:<4} min={:>8} us  avg={:>8} us  max={:>8} us",
        durations.len(),
        min / 1_000,
        avg / 1_000,
        max / 1_000
    );
}

async fn cmd_bench(config: EndpointConfig, url: Option<String>, count: i32) -> Result<()> {
    let (_endpoint, conn) = connect(config, url).await?;
    let service = conn.get_object(services::REMOTE_PERFORMANCE).await?;
    let object = probe()?;

    service
        .call_named("setObject", vec![DynamicValue::from(object.clone())])
        .await?;
    service
        .call_named("setMeasureCount", vec![DynamicValue::Int32(count)])
        .await?;

    let runs = [
        ("call noop()", "measureCallDuration", vec![DynamicValue::from("noop")]),
        ("call ping()", "measureCallDuration", vec![DynamicValue::from("ping")]),
        ("get property value", "measureGetPropertyDuration", vec![DynamicValue::from("value")]),
        ("set property value", "measureSetPropertyDuration", vec![DynamicValue::from("value")]),
    ];
    for (label, action, args) in runs {
        let durations: Vec<i64> = service.call_typed(action, args).await?;
        summarize(label, &durations);
    }

    service.call_named("clear", vec![]).await?;
    conn.close();
    Ok(())
}

async fn cmd_services(config: EndpointConfig, url: Option<String>) -> Result<()> {
    let (endpoint, conn) = connect(config, url).await?;
    let names = endpoint.services(&conn).await?;
    if names.is_empty() {
        println!("No services registered.");
    }
    for name in names {
        println!("{name}");
    }
    conn.close();
    Ok(())
}
