// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definition
//!
//! The client publishes to a single exchange. It is declared on every
//! successful connection as a durable topic exchange, which is a no-op when
//! the broker already has a matching one.

/// Definition of the topic exchange as sent to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub name: String,
    pub durable: bool,
}

impl ExchangeDefinition {
    /// Creates a non-durable topic exchange definition.
    pub fn topic(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            durable: false,
        }
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_exchange_is_durable() {
        let def = ExchangeDefinition::topic("hello-exchange").durable();
        assert_eq!(def.name, "hello-exchange");
        assert!(def.durable);
        assert!(!ExchangeDefinition::topic("hello-exchange").durable);
    }
}
