//! Error-metric channel.
//!
//! Problems found while recording are counted in ordinary counter metrics:
//! category [`ERROR_CATEGORY`], name `<error_type>/<category>.<name>`,
//! `Ping` lifetime, sent in the offending metric's known pings. Problems
//! about the error counters themselves are only logged.

use tally_core::{CommonMetricData, ErrorType, DEFAULT_PING, ERROR_CATEGORY};

use crate::registry::PingRegistry;

/// Name of the counter tracking `error_type` for `meta`.
pub fn error_metric_name(error_type: ErrorType, meta: &CommonMetricData) -> String {
    format!("{}/{}", error_type.as_str(), meta.full_name())
}

/// Whether a problem with `meta` may itself be recorded.
pub(crate) fn is_reportable(meta: &CommonMetricData) -> bool {
    meta.category != ERROR_CATEGORY
}

/// Known pings among the metric's declared pings, or the default ping.
pub(crate) fn error_pings(meta: &CommonMetricData, pings: &PingRegistry) -> Vec<String> {
    let known: Vec<String> = meta
        .pings()
        .into_iter()
        .filter(|ping| pings.is_known(ping))
        .collect();
    if known.is_empty() {
        vec![DEFAULT_PING.to_string()]
    } else {
        known
    }
}
