//! Fleet API access: HTTP client, named resources, managed subscriptions.

mod client;
mod resources;

pub use client::ApiClient;
pub use resources::{FleetClient, Resource};
