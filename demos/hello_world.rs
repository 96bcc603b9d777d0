// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Publishes a greeting and consumes it back through a local RabbitMQ.
//!
//! ```sh
//! docker run -d -p 5672:5672 rabbitmq:3
//! cargo run --example hello_world
//! ```

use amqp_suite::{handler_fn, AmqpClient, ConsumeOptions, Delivery, PublishOptions};
use serde::{Deserialize, Serialize};
use std::{error::Error, time::Duration};
use tracing::{info, Level};

const ROUTING_KEY: &str = "example.events.hello_world";

#[derive(Debug, Serialize, Deserialize)]
struct HelloWorld {
    id: u32,
    message: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let client = AmqpClient::new("amqp://localhost", "hello-exchange");
    client.connect(5, Duration::from_millis(2000)).await?;

    let handler = handler_fn(|msg: HelloWorld, delivery: Delivery| async move {
        info!(
            routing_key = %delivery.routing_key,
            "received message {}: {}", msg.id, msg.message
        );
        Ok(())
    });
    client
        .consume(
            "hello-queue",
            handler,
            ConsumeOptions::new().prefetch(10),
            ROUTING_KEY,
        )
        .await?;

    let msg = HelloWorld {
        id: 123,
        message: "Hello World!".to_owned(),
    };
    client
        .publish(ROUTING_KEY, &msg, PublishOptions::new())
        .await?;
    info!("message published");

    tokio::time::sleep(Duration::from_secs(1)).await;
    client.close().await;

    Ok(())
}
