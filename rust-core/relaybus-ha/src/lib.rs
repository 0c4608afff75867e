// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Relaybus HA client
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Keeps a relaybus client connected across server failures. `HaClient`
// picks endpoints through a `ServerChooser`, waits between attempts per a
// `ReconnectDelayStrategy`, logs on through an `Authenticator`, reissues
// tracked subscriptions from their bookmarks, and replays every publish the
// server has not acknowledged. Sockets and wire encoding stay behind the
// `Transport` and `Connection` traits.
//
// ## Usage
//
// ```no_run
// # async fn example(transport: std::sync::Arc<dyn relaybus_ha::Transport>) -> relaybus_ha::HaResult<()> {
// use relaybus_ha::{ClientConfig, HaClient, SubscribeRequest};
//
// let config = ClientConfig::from_file("/etc/relaybus/client.json")?;
// let client = HaClient::from_config(&config, transport).await?;
// let supervisor = client.spawn();
//
// let mut orders = client.subscribe(SubscribeRequest::new("orders").with_id("orders")).await?;
// client.publish(b"new order").await?;
// if let Some(delivery) = orders.recv().await {
//     client.discard(&delivery).await?;
// }
//
// client.close().await?;
// let _ = supervisor.await;
// # Ok(())
// # }
// ```

pub mod auth;
pub mod chooser;
pub mod client;
pub mod config;
pub mod delay;
pub mod error;
pub mod observer;
pub mod subscription;
pub mod transport;

pub use auth::{Authenticator, Credentials, DefaultAuthenticator, LogonOutcome};
pub use chooser::{ChooserPolicy, DefaultServerChooser, ServerChooser, ServerEntry};
pub use client::{HaClient, HaClientBuilder};
pub use config::{ClientConfig, DelayConfig};
pub use delay::{ExponentialDelayStrategy, FixedDelayStrategy, ReconnectDelayStrategy};
pub use error::{HaError, HaResult};
pub use observer::{ClientObserver, ConnectionState, ObserverList};
pub use subscription::{Delivery, ResubscribeReport, SubscribeRequest, Subscription};
pub use transport::{Connection, InboundEvent, Transport};
