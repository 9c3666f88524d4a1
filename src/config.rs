use once_cell::sync::Lazy;

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `5000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(5000)
});

/// Access token for the payment gateway. Must be set via `GATEWAY_ACCESS_TOKEN`.
pub static GATEWAY_ACCESS_TOKEN: Lazy<String> =
    Lazy::new(|| std::env::var("GATEWAY_ACCESS_TOKEN").expect("GATEWAY_ACCESS_TOKEN must be set"));

/// Base URL of the payment gateway API.
pub static GATEWAY_BASE_URL: Lazy<String> = Lazy::new(|| {
    std::env::var("GATEWAY_BASE_URL").unwrap_or_else(|_| "https://api.mercadopago.com".to_string())
});

/// Shared secret for verifying inbound webhook signatures. When unset,
/// signature verification is skipped.
pub static GATEWAY_WEBHOOK_SECRET: Lazy<Option<String>> = Lazy::new(|| {
    std::env::var("GATEWAY_WEBHOOK_SECRET")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
});

/// Base URL of the bot-API endpoint used for outbound user notifications.
pub static NOTIFY_BOT_URL: Lazy<Option<String>> = Lazy::new(|| {
    std::env::var("NOTIFY_BOT_URL")
        .ok()
        .map(|value| value.trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
});

/// Chat id of the operator group receiving sales/system notifications.
pub static NOTIFY_OPS_CHAT_ID: Lazy<Option<i64>> = Lazy::new(|| {
    std::env::var("NOTIFY_OPS_CHAT_ID")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
});

/// Base URL of the node agent invoked to provision leased resources.
pub static PROVISIONER_AGENT_URL: Lazy<Option<String>> = Lazy::new(|| {
    std::env::var("PROVISIONER_AGENT_URL")
        .ok()
        .map(|value| value.trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
});

/// JSON array describing the provisionable pool
/// (`[{"id": "...", "name": "...", "host": "...", "available": true}]`).
pub static POOL_MEMBERS: Lazy<Option<String>> = Lazy::new(|| {
    std::env::var("POOL_MEMBERS")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
});

/// Validity window of a payment intent, in minutes. Defaults to 30.
pub static INTENT_TTL_MINUTES: Lazy<i64> = Lazy::new(|| {
    std::env::var("INTENT_TTL_MINUTES")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(30)
});

/// Free-tier cooldown between lease grants, in hours. Defaults to 24.
pub static FREE_COOLDOWN_HOURS: Lazy<i64> = Lazy::new(|| {
    std::env::var("FREE_COOLDOWN_HOURS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(24)
});

/// Lifetime of a free trial lease, in hours. Defaults to 6.
pub static TRIAL_LEASE_HOURS: Lazy<i64> = Lazy::new(|| {
    std::env::var("TRIAL_LEASE_HOURS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(6)
});

/// Lifetime of a premium lease, in hours. Defaults to 720 (30 days).
pub static PREMIUM_LEASE_TTL_HOURS: Lazy<i64> = Lazy::new(|| {
    std::env::var("PREMIUM_LEASE_TTL_HOURS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(720)
});

/// Pause between broadcast deliveries, in milliseconds. Defaults to 100.
pub static BROADCAST_DELAY_MS: Lazy<u64> = Lazy::new(|| {
    std::env::var("BROADCAST_DELAY_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(100)
});

/// Timeout applied to a single outbound delivery, in seconds. Defaults to 10.
pub static DELIVERY_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("DELIVERY_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(10)
});

/// Interval between scheduler ticks, in seconds. Defaults to 60.
pub static REAPER_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("REAPER_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(60)
});

/// Days before premium expiry at which a reminder is sent. Defaults to 1.
pub static PREMIUM_REMINDER_DAYS: Lazy<i64> = Lazy::new(|| {
    std::env::var("PREMIUM_REMINDER_DAYS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(1)
});

/// Idle lifetime of a dialogue session, in minutes. Defaults to 30.
pub static SESSION_TTL_MINUTES: Lazy<i64> = Lazy::new(|| {
    std::env::var("SESSION_TTL_MINUTES")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(30)
});

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(false)
});
