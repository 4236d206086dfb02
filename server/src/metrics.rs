//! Server metrics.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "requests_received",
    description = "Total complete requests parsed"
)]
pub static REQUESTS: Counter = Counter::new();

#[metric(
    name = "responses_4xx",
    description = "Responses sent with a 4xx status"
)]
pub static RESPONSES_4XX: Counter = Counter::new();

#[metric(
    name = "responses_5xx",
    description = "Responses sent with a 5xx status"
)]
pub static RESPONSES_5XX: Counter = Counter::new();

#[metric(
    name = "parse_errors",
    description = "Requests rejected as malformed"
)]
pub static PARSE_ERRORS: Counter = Counter::new();
