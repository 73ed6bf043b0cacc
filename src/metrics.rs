use lazy_static::lazy_static;
use prometheus::{
    opts, register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

lazy_static! {
    pub static ref TOTAL_CHANNELS: IntCounter =
        register_int_counter!("channels_total", "Channels created").unwrap();
    pub static ref ACTIVE_CHANNELS: IntGauge =
        register_int_gauge!("channels_active", "Channels currently open").unwrap();
    pub static ref TOTAL_SESSIONS: IntCounter =
        register_int_counter!("sessions_total", "Sessions joined").unwrap();
    pub static ref ACTIVE_SESSIONS: IntGauge =
        register_int_gauge!("sessions_active", "Sessions currently open").unwrap();
    pub static ref AUTH_RESULTS: IntCounterVec = register_int_counter_vec!(
        opts!("auth_results_total", "Link handshake outcomes"),
        &["result"]
    )
    .unwrap();
    pub static ref SESSION_CLOSES: IntCounterVec = register_int_counter_vec!(
        opts!("session_closes_total", "Session closes by reason"),
        &["reason"]
    )
    .unwrap();
    pub static ref WORKER_RESPAWNS: IntCounter =
        register_int_counter!("worker_respawns_total", "Dead engine workers replaced").unwrap();
    pub static ref BUS_REQUESTS: IntCounterVec = register_int_counter_vec!(
        opts!("bus_requests_total", "Bus requests by outcome"),
        &["outcome"]
    )
    .unwrap();
}
