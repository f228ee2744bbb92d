use std::collections::BTreeMap;
use std::env;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tap::prelude::*;
use time::UtcOffset;
use time::format_description::FormatItem;
use time::macros::format_description;

use crate::rooms::RoomPolicy;

const DATA_DIR_ENV: &str = "EDGETAP_CONFIG_PATH";
const DEFAULT_DATA_DIR: &str = "/etc/edgetap";
const CONF_FILE_NAME: &str = "edgetap.json";

const UTC_OFFSET_FORMAT: &[FormatItem<'static>] =
    format_description!("[offset_hour sign:mandatory]:[offset_minute]");

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Conf {
    pub data_dir: Utf8PathBuf,
    pub log_file: Utf8PathBuf,
    pub verbosity_profile: dto::VerbosityProfile,
    pub rooms: RoomPolicy,
    pub capture: dto::CaptureConf,
    pub utc_offset: UtcOffset,
    pub delivery: dto::DeliveryConf,
    pub event_log: dto::EventLogConf,
    pub caches: dto::CacheConf,
    pub threat: dto::ThreatConf,
    pub service_rules_file: Utf8PathBuf,
    pub debug: dto::DebugConf,
}

impl Conf {
    pub fn from_conf_file(conf_file: &dto::ConfFile, data_dir: &Utf8Path) -> anyhow::Result<Self> {
        let log_file = conf_file
            .log_file
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from("edgetap"))
            .pipe_ref(|path| normalize_data_path(path, data_dir));

        let utc_offset = UtcOffset::parse(&conf_file.capture.utc_offset, UTC_OFFSET_FORMAT)
            .with_context(|| format!("invalid UTC offset: {}", conf_file.capture.utc_offset))?;

        if conf_file.delivery.batch_size == 0 || conf_file.delivery.max_batch == 0 {
            anyhow::bail!("delivery batch sizes must be greater than zero");
        }

        if let Some(endpoint) = &conf_file.delivery.endpoint {
            if !matches!(endpoint.scheme(), "http" | "https") {
                anyhow::bail!("unsupported delivery endpoint scheme: {}", endpoint.scheme());
            }
        }

        let mut event_log = conf_file.event_log.clone();
        event_log.directory = normalize_data_path(&event_log.directory, data_dir);

        // A single file must always fit twice in the retention budget.
        if event_log.max_total_bytes < event_log.max_file_bytes.saturating_mul(2) {
            warn!(
                max_file_bytes = event_log.max_file_bytes,
                max_total_bytes = event_log.max_total_bytes,
                "Event log total cap is too small for the per-file cap, raising it"
            );
            event_log.max_total_bytes = event_log.max_file_bytes.saturating_mul(2);
        }

        let mut caches = conf_file.caches.clone();
        caches.dns_file = normalize_data_path(&caches.dns_file, data_dir);
        caches.asn_file = normalize_data_path(&caches.asn_file, data_dir);

        let mut threat = conf_file.threat.clone();
        threat.directory = normalize_data_path(&threat.directory, data_dir);

        let service_rules_file = conf_file
            .service_rules_file
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from("service_rules.json"))
            .pipe_ref(|path| normalize_data_path(path, data_dir));

        Ok(Conf {
            data_dir: data_dir.to_owned(),
            log_file,
            verbosity_profile: conf_file.verbosity_profile.unwrap_or_default(),
            rooms: RoomPolicy::new(conf_file.rooms.clone()),
            capture: conf_file.capture.clone(),
            utc_offset,
            delivery: conf_file.delivery.clone(),
            event_log,
            caches,
            threat,
            service_rules_file,
            debug: conf_file.debug.clone().unwrap_or_default(),
        })
    }
}

/// Configuration Handle, source of truth for current configuration state
#[derive(Clone)]
pub struct ConfHandle {
    inner: Arc<ConfHandleInner>,
}

struct ConfHandleInner {
    data_dir: Utf8PathBuf,
    persist: bool,
    conf: parking_lot::RwLock<Arc<Conf>>,
    conf_file: parking_lot::RwLock<Arc<dto::ConfFile>>,
}

impl ConfHandle {
    /// Initializes configuration for this instance.
    ///
    /// It's best to call this only once to avoid inconsistencies.
    pub fn init() -> anyhow::Result<Self> {
        let data_dir = get_data_dir();
        let conf_file = load_conf_file_or_generate_new()?;
        Self::build(conf_file, data_dir, true)
    }

    /// Builds a handle from an in-memory JSON document, nothing is ever written to disk.
    pub fn from_json(json: &str, data_dir: &Utf8Path) -> anyhow::Result<Self> {
        let conf_file = serde_json::from_str::<dto::ConfFile>(json).context("invalid configuration")?;
        Self::build(conf_file, data_dir.to_owned(), false)
    }

    fn build(conf_file: dto::ConfFile, data_dir: Utf8PathBuf, persist: bool) -> anyhow::Result<Self> {
        let conf = Conf::from_conf_file(&conf_file, &data_dir).context("invalid configuration file")?;

        Ok(Self {
            inner: Arc::new(ConfHandleInner {
                data_dir,
                persist,
                conf: parking_lot::RwLock::new(Arc::new(conf)),
                conf_file: parking_lot::RwLock::new(Arc::new(conf_file)),
            }),
        })
    }

    /// Returns current configuration state (do not hold it forever as it may become outdated)
    pub fn get_conf(&self) -> Arc<Conf> {
        self.inner.conf.read().clone()
    }

    /// Returns current configuration file state (do not hold it forever as it may become outdated)
    pub fn get_conf_file(&self) -> Arc<dto::ConfFile> {
        self.inner.conf_file.read().clone()
    }

    /// Replaces the room mapping and persists it.
    ///
    /// The running capture keeps its filter until it is restarted.
    pub fn save_rooms(&self, rooms: BTreeMap<String, String>) -> anyhow::Result<()> {
        let mut new_conf_file = (*self.get_conf_file()).clone();
        new_conf_file.rooms = rooms;

        let new_conf = Conf::from_conf_file(&new_conf_file, &self.inner.data_dir)?;

        if self.inner.persist {
            save_config(&new_conf_file)?;
        }

        *self.inner.conf.write() = Arc::new(new_conf);
        *self.inner.conf_file.write() = Arc::new(new_conf_file);

        Ok(())
    }
}

fn save_config(conf: &dto::ConfFile) -> anyhow::Result<()> {
    let conf_file_path = get_conf_file_path();
    let json = serde_json::to_string_pretty(conf).context("failed JSON serialization of configuration")?;
    std::fs::write(&conf_file_path, json).with_context(|| format!("failed to write file at {conf_file_path}"))?;
    Ok(())
}

pub fn get_data_dir() -> Utf8PathBuf {
    env::var(DATA_DIR_ENV)
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|_| Utf8PathBuf::from(DEFAULT_DATA_DIR))
}

fn get_conf_file_path() -> Utf8PathBuf {
    get_data_dir().join(CONF_FILE_NAME)
}

fn normalize_data_path(path: &Utf8Path, data_dir: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        data_dir.join(path)
    }
}

fn load_conf_file(conf_path: &Utf8Path) -> anyhow::Result<Option<dto::ConfFile>> {
    match File::open(conf_path) {
        Ok(file) => BufReader::new(file)
            .pipe(serde_json::from_reader)
            .map(Some)
            .with_context(|| format!("invalid config file at {conf_path}")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::anyhow!(e).context(format!("couldn't open config file at {conf_path}"))),
    }
}

pub fn load_conf_file_or_generate_new() -> anyhow::Result<dto::ConfFile> {
    let conf_file_path = get_conf_file_path();

    let conf_file = match load_conf_file(&conf_file_path).context("failed to load configuration")? {
        Some(conf_file) => conf_file,
        None => {
            let defaults = dto::ConfFile::generate_new();
            println!("Write default configuration to disk…");
            std::fs::create_dir_all(get_data_dir()).context("failed to create data directory")?;
            save_config(&defaults).context("failed to save configuration")?;
            defaults
        }
    };

    Ok(conf_file)
}

pub mod dto {
    use super::*;

    use url::Url;

    /// Source of truth for edgetap configuration
    ///
    /// This struct represents the JSON file used for configuration as close as possible
    /// and is not trying to be too smart.
    #[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ConfFile {
        /// Monitored hosts: IP, `/32`, `/24` or legacy `a.b.c.0` mapped to a room identifier
        #[serde(default)]
        pub rooms: BTreeMap<String, String>,

        #[serde(default)]
        pub capture: CaptureConf,

        #[serde(default)]
        pub delivery: DeliveryConf,

        #[serde(default)]
        pub event_log: EventLogConf,

        #[serde(default)]
        pub caches: CacheConf,

        #[serde(default)]
        pub threat: ThreatConf,

        /// JSON file holding the domain → service rule table
        #[serde(skip_serializing_if = "Option::is_none")]
        pub service_rules_file: Option<Utf8PathBuf>,

        /// Verbosity profile
        #[serde(skip_serializing_if = "Option::is_none")]
        pub verbosity_profile: Option<VerbosityProfile>,

        /// (Unstable) Folder and prefix for log files
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_file: Option<Utf8PathBuf>,

        /// (Unstable) Unsafe debug options for developers
        #[serde(default, rename = "__debug__", skip_serializing_if = "Option::is_none")]
        pub debug: Option<DebugConf>,

        /// Other unofficial options.
        /// This field is useful so that we can deserialize
        /// and then losslessly serialize back all root keys of the config file.
        #[serde(flatten)]
        pub rest: serde_json::Map<String, serde_json::Value>,
    }

    impl ConfFile {
        pub fn generate_new() -> Self {
            Self {
                rooms: BTreeMap::new(),
                capture: CaptureConf::default(),
                delivery: DeliveryConf::default(),
                event_log: EventLogConf::default(),
                caches: CacheConf::default(),
                threat: ThreatConf::default(),
                service_rules_file: None,
                verbosity_profile: None,
                log_file: None,
                debug: None,
                rest: serde_json::Map::new(),
            }
        }
    }

    #[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase", default)]
    pub struct CaptureConf {
        pub enabled: bool,
        /// Events are produced and counted but never posted
        pub dry_run: bool,
        pub interface: String,
        pub snap_len: u32,
        pub buffer_size_mb: u32,
        /// Destination ports captured in verbose mode
        pub ports: Vec<u16>,
        /// Lightweight mode: TCP SYN + QUIC initial only
        pub syn_only: bool,
        pub helper_path: Utf8PathBuf,
        /// Arguments inserted before the generated ones
        pub helper_args: Vec<String>,
        /// Offset used for the human readable event time (e.g.: `+09:00`)
        pub utc_offset: String,
        pub send_queue_max: usize,
        pub display_buffer_max: usize,
    }

    impl Default for CaptureConf {
        fn default() -> Self {
            Self {
                enabled: true,
                dry_run: false,
                interface: "eth0".to_owned(),
                snap_len: 512,
                buffer_size_mb: 4,
                ports: vec![80, 443, 8080, 8443],
                syn_only: true,
                helper_path: Utf8PathBuf::from("tshark"),
                helper_args: Vec::new(),
                utc_offset: "+00:00".to_owned(),
                send_queue_max: 20_000,
                display_buffer_max: 500,
            }
        }
    }

    #[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase", default)]
    pub struct DeliveryConf {
        /// Collector URL; no endpoint means events are dequeued without being posted
        #[serde(skip_serializing_if = "Option::is_none")]
        pub endpoint: Option<Url>,
        pub gzip: bool,
        /// Extra HTTP headers (e.g.: authorization)
        pub headers: BTreeMap<String, String>,
        /// Queue length triggering an immediate flush
        pub batch_size: usize,
        pub flush_interval_secs: u64,
        /// Maximum number of events per request
        pub max_batch: usize,
        pub timeout_secs: u64,
        pub asn_enrichment: bool,
    }

    impl Default for DeliveryConf {
        fn default() -> Self {
            Self {
                endpoint: None,
                gzip: true,
                headers: BTreeMap::new(),
                batch_size: 200,
                flush_interval_secs: 10,
                max_batch: 1000,
                timeout_secs: 15,
                asn_enrichment: true,
            }
        }
    }

    #[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase", default)]
    pub struct EventLogConf {
        pub enabled: bool,
        pub directory: Utf8PathBuf,
        pub max_file_bytes: u64,
        pub max_total_bytes: u64,
    }

    impl Default for EventLogConf {
        fn default() -> Self {
            Self {
                enabled: true,
                directory: Utf8PathBuf::from("events"),
                max_file_bytes: 5_000_000,
                max_total_bytes: 100_000_000,
            }
        }
    }

    #[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase", default)]
    pub struct CacheConf {
        pub dns_max_entries: usize,
        pub dns_file: Utf8PathBuf,
        pub dns_persist_interval_secs: u64,
        pub ptr_queue_capacity: usize,
        pub ptr_timeout_ms: u64,
        pub asn_max_entries: usize,
        pub asn_ttl_secs: u64,
        /// Number of new ASN entries between two saves
        pub asn_persist_every: usize,
        pub asn_file: Utf8PathBuf,
        pub asn_timeout_ms: u64,
        pub classifier_cache_size: usize,
        pub unknown_domains_max: usize,
    }

    impl Default for CacheConf {
        fn default() -> Self {
            Self {
                dns_max_entries: 10_000,
                dns_file: Utf8PathBuf::from("dns_cache.json"),
                dns_persist_interval_secs: 300,
                ptr_queue_capacity: 100,
                ptr_timeout_ms: 2_000,
                asn_max_entries: 5_000,
                asn_ttl_secs: 7 * 24 * 60 * 60,
                asn_persist_every: 50,
                asn_file: Utf8PathBuf::from("asn_cache.json"),
                asn_timeout_ms: 2_000,
                classifier_cache_size: 5_000,
                unknown_domains_max: 1_000,
            }
        }
    }

    #[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase", default)]
    pub struct ThreatConf {
        pub enabled: bool,
        pub directory: Utf8PathBuf,
        /// Minimum delay between two non-forced refreshes
        pub min_refresh_secs: u64,
        /// How often the refresh task wakes up
        pub refresh_check_secs: u64,
        pub fetch_timeout_secs: u64,
        pub sources: ThreatSources,
    }

    impl Default for ThreatConf {
        fn default() -> Self {
            Self {
                enabled: true,
                directory: Utf8PathBuf::from("threat"),
                min_refresh_secs: 24 * 60 * 60,
                refresh_check_secs: 60 * 60,
                fetch_timeout_secs: 30,
                sources: ThreatSources::default(),
            }
        }
    }

    #[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase", default)]
    pub struct ThreatSources {
        pub malware: Option<Url>,
        pub adult: Option<Url>,
        pub gambling: Option<Url>,
        pub fakenews: Option<Url>,
        pub tor: Option<Url>,
    }

    impl Default for ThreatSources {
        fn default() -> Self {
            const HOSTS: &str = "https://raw.githubusercontent.com/StevenBlack/hosts/master";

            let url = |s: &str| Url::parse(s).ok();

            Self {
                malware: url(&format!("{HOSTS}/hosts")),
                adult: url(&format!("{HOSTS}/alternates/porn-only/hosts")),
                gambling: url(&format!("{HOSTS}/alternates/gambling-only/hosts")),
                fakenews: url(&format!("{HOSTS}/alternates/fakenews-only/hosts")),
                tor: url("https://check.torproject.org/torbulkexitlist"),
            }
        }
    }

    /// Verbosity profile (pre-defined tracing directives)
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize, Default)]
    pub enum VerbosityProfile {
        /// The default profile, mostly info records
        #[default]
        Default,
        /// Recommended profile for developers
        Debug,
        /// Show all traces
        All,
        /// Only show warnings and errors
        Quiet,
    }

    impl VerbosityProfile {
        pub fn to_log_filter(self) -> &'static str {
            match self {
                VerbosityProfile::Default => "info",
                VerbosityProfile::Debug => "info,edgetap=debug",
                VerbosityProfile::All => "trace",
                VerbosityProfile::Quiet => "warn",
            }
        }
    }

    /// Unsafe debug options that should only ever be used at development stage
    ///
    /// These options might change or get removed without further notice.
    #[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
    pub struct DebugConf {
        /// Directives string in the same form as the RUST_LOG environment variable
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub log_directives: Option<String>,
    }

    /// Manual Default trait implementation just to make sure default values are deliberates
    #[allow(clippy::derivable_impls)]
    impl Default for DebugConf {
        fn default() -> Self {
            Self { log_directives: None }
        }
    }

    impl DebugConf {
        pub fn is_default(&self) -> bool {
            Self::default().eq(self)
        }
    }
}
