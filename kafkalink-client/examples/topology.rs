//! Topology explorer example using the kafkalink client
//!
//! Usage: cargo run --example topology -- [broker:port] [topic...]

use kafkalink_client::*;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let broker = args.next().unwrap_or_else(|| "localhost:9092".to_string());
    let topics: Vec<String> = args.collect();

    println!("🚀 Kafkalink - Topology Example");
    println!("================================");

    let config = ClientConfig::builder()
        .brokers(vec![broker])
        .client_id("kafkalink-topology-example")
        .connection_timeout(Duration::from_secs(5))
        .build();

    let client = KafkalinkClient::connect(config).await?;
    println!("✅ Connected, brokers in pool: {:?}", client.pool().keys());

    let mut events = client.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("📣 {:?}", event);
        }
    });

    if topics.is_empty() {
        client.refresh_all_topology().await?;
    } else {
        let missing = client.topic_exists(&topics).await?;
        if !missing.is_empty() {
            println!("⚠️  Unknown topics: {:?}", missing);
        }
    }

    for topic in client.topology().topics() {
        let partitions = client.partitions_for(&topic).unwrap_or_default();
        println!("📋 {} ({} partitions)", topic, partitions.len());
        for partition in partitions {
            match client.leader_for(&topic, partition) {
                Some(leader) => println!("   partition {} -> {}", partition, leader),
                None => println!("   partition {} -> no leader", partition),
            }
        }
    }

    let metrics = client.metrics();
    println!(
        "📊 requests: {}, responses: {}, avg latency: {:.1}µs",
        metrics.requests_sent, metrics.responses_received, metrics.average_response_latency_us
    );

    client.shutdown().await;
    println!("✅ Client shut down");
    Ok(())
}
