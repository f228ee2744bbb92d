use std::net::IpAddr;

use rand::Rng as _;
use serde::{Deserialize, Serialize};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use crate::threat::ThreatCategory;

const DISPLAY_TIME_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

const ID_TIME_FORMAT: &[FormatItem<'static>] = format_description!("[year][month][day][hour][minute][second]");

/// One observation of the capture helper, enriched.
///
/// Never mutated once queued: delivery enriches its own copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficEvent {
    pub id: String,
    pub epoch: f64,
    pub time: String,
    pub room_no: String,
    pub src_ip: IpAddr,
    pub dst_ip: Option<IpAddr>,
    pub dst_port: Option<u16>,
    pub protocol: String,
    pub dns_query: Option<String>,
    pub http_host: Option<String>,
    pub http_uri: Option<String>,
    pub tls_sni: Option<String>,
    pub resolved_domain: Option<String>,
    pub threat_flag: Option<ThreatCategory>,
    pub asn: Option<u32>,
    pub asn_service: Option<String>,
    pub asn_category: Option<String>,
}

/// Converts a capture timestamp to a date time at the given offset.
pub fn epoch_to_datetime(epoch: f64, offset: UtcOffset) -> Option<OffsetDateTime> {
    if !epoch.is_finite() {
        return None;
    }

    let nanos = (epoch * 1_000_000_000.0) as i128;

    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()
        .map(|datetime| datetime.to_offset(offset))
}

/// `YYYY-MM-DD HH:MM:SS`
pub fn format_display_time(datetime: OffsetDateTime) -> String {
    datetime
        .format(DISPLAY_TIME_FORMAT)
        .unwrap_or_else(|_| datetime.unix_timestamp().to_string())
}

/// `{room}{yyyymmddhhmmss}-{4 random digits}`
pub fn event_id(room: &str, datetime: OffsetDateTime) -> String {
    let stamp = datetime.format(ID_TIME_FORMAT).unwrap_or_default();
    let suffix: u16 = rand::thread_rng().gen_range(0..10_000);
    format!("{room}{stamp}-{suffix:04}")
}
