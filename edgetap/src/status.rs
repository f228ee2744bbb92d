use serde::Serialize;
use time::OffsetDateTime;

use crate::asn::AsnStats;
use crate::classifier::ClassifierStats;
use crate::dns_cache::DnsCacheStats;
use crate::event_log::EventLogStats;
use crate::ptr::PtrStats;
use crate::threat::ThreatStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
}

/// Point-in-time view of the capture pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureStatus {
    pub state: CaptureState,
    pub running: bool,
    pub enabled: bool,
    pub dry_run: bool,
    pub interface: String,
    pub filter: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    pub queue_len: usize,
    pub queue_capacity: usize,
    pub display_len: usize,
    pub display_capacity: usize,
    pub sent_count: u64,
    /// Events evicted from the send queue before delivery
    pub drop_count: u64,
    pub display_drop_count: u64,
    pub delivery_failures: u64,
    pub lines_read: u64,
    pub malformed_lines: u64,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_send_ok_at: Option<OffsetDateTime>,
    pub dns_cache: DnsCacheStats,
    pub ptr: PtrStats,
    pub asn: AsnStats,
    pub threat: ThreatStats,
    pub classifier: ClassifierStats,
    pub event_log: EventLogStats,
}
