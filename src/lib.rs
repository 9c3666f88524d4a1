pub mod broadcast;
pub mod config;
pub mod directory;
pub mod entitlements;
pub mod error;
pub mod leases;
pub mod notify;
pub mod payments;
pub mod routes;
pub mod scheduler;
pub mod sessions;
pub mod webhooks;
