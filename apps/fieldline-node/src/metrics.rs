use std::sync::atomic::{AtomicU64, Ordering};

use fieldline_hub::Hub;

#[derive(Debug, Default)]
pub struct MetricsState {
    pub frames_accepted: AtomicU64,
    pub published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub tokens_issued: AtomicU64,
    pub token_rejections: AtomicU64,
    pub ws_connections_total: AtomicU64,
}

pub fn metrics_body(metrics: &MetricsState, hub: &Hub) -> String {
    format!(
        "fieldline_frames_accepted_total {}\nfieldline_published_total {}\nfieldline_publish_failures_total {}\nfieldline_tokens_issued_total {}\nfieldline_token_rejections_total {}\nfieldline_ws_connections_total {}\nfieldline_live_connections {}\nfieldline_fanout_delivered_total {}\nfieldline_fanout_evictions_total {}\n",
        metrics.frames_accepted.load(Ordering::Relaxed),
        metrics.published.load(Ordering::Relaxed),
        metrics.publish_failures.load(Ordering::Relaxed),
        metrics.tokens_issued.load(Ordering::Relaxed),
        metrics.token_rejections.load(Ordering::Relaxed),
        metrics.ws_connections_total.load(Ordering::Relaxed),
        hub.connection_count(),
        hub.delivered_total(),
        hub.evicted_total(),
    )
}
