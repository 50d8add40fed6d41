use relq::{
    Delivery, EngineBuilder, Processor, QueueConfiguration, RelqConfig, Request, async_trait,
};
use tracing_subscriber::EnvFilter;

struct PrintProcessor;

#[async_trait]
impl Processor for PrintProcessor {
    async fn process(&self, delivery: &Delivery) -> anyhow::Result<()> {
        if delivery.payload.contains("boom") {
            anyhow::bail!("refusing {}", delivery.payload);
        }
        println!(
            "[{}] delivered '{}' (attempt {})",
            delivery.queue, delivery.payload, delivery.attempt
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relq=info")),
        )
        .try_init()
        .ok();

    let config = RelqConfig::default()
        .with_redis("localhost", 6379)
        .with_check_interval(2)
        .with_refresh_period(2)
        .with_processor_delay_max(200)
        .with_queue_configuration(QueueConfiguration::new("orders-.*", vec![2, 5, 10]))
        .with_memory_usage_limit_percent(90);

    let mut engine = EngineBuilder::new(config)
        .with_processor(PrintProcessor)
        .build()?;

    for message in ["first", "second", "boom"] {
        let reply = engine.handle(Request::enqueue("orders-eu", message)).await;
        println!("enqueue {message}: {}", serde_json::to_string(&reply)?);
    }

    let reply = engine
        .handle_json(r#"{"operation":"getQueueItemsCount","payload":{"queuename":"orders-eu"}}"#)
        .await;
    println!("count: {}", serde_json::to_string(&reply)?);

    engine.start()?;
    tokio::time::sleep(std::time::Duration::from_secs(10)).await;
    println!("stats: {}", serde_json::to_string_pretty(&engine.stats())?);

    engine.shutdown().await;
    Ok(())
}
