//! Observability for the messaging core.
//!
//! # Privacy by Default
//!
//! Lifecycle entry points use `#[instrument(skip_all)]` with an explicit
//! field allow-list. Private session ids, auth payloads and socket data are
//! never logged.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `roomcast_connections_total` | Counter | `outcome` | Namespace connection attempts |
//! | `roomcast_sockets_active` | Gauge | none | Currently connected sockets |
//! | `roomcast_disconnections_total` | Counter | `reason` | Socket disconnections |
//! | `roomcast_namespaces_active` | Gauge | none | Registered namespaces |
//! | `roomcast_broadcasts_total` | Counter | `kind` | Adapter broadcasts |
//! | `roomcast_broadcast_recipients` | Histogram | none | Local recipients per broadcast |
//! | `roomcast_delivery_failures_total` | Counter | none | Failed per-recipient writes |
//! | `roomcast_ack_requests_total` | Counter | `outcome` | Ack request resolutions |
//! | `roomcast_sessions_total` | Counter | `event` | Recovery session lifecycle |
//! | `roomcast_missed_packets_total` | Counter | none | Packets buffered for disconnected sessions |
//! | `roomcast_session_restore_duration_seconds` | Histogram | none | Session restore latency |

pub mod metrics;
