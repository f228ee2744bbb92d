//! System DNS client shared by the reverse lookup worker and the ASN resolver.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context as _;
use trust_dns_resolver::TokioAsyncResolver;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};

#[derive(Clone)]
pub struct DnsClient {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl DnsClient {
    /// Uses the system configuration, falling back to public resolvers when it can't be read.
    pub fn from_system_conf(timeout: Duration) -> Self {
        let (config, mut opts) = match trust_dns_resolver::system_conf::read_system_conf() {
            Ok(conf) => conf,
            Err(error) => {
                warn!(%error, "Couldn't read system DNS configuration, using public resolvers");
                (ResolverConfig::google(), ResolverOpts::default())
            }
        };

        opts.timeout = timeout;
        opts.attempts = 1;

        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
            timeout,
        }
    }

    /// First PTR name of `ip`, if any.
    pub async fn reverse(&self, ip: IpAddr) -> anyhow::Result<Option<String>> {
        let lookup = tokio::time::timeout(self.timeout, self.resolver.reverse_lookup(ip))
            .await
            .context("reverse lookup timed out")?;

        match lookup {
            Ok(lookup) => Ok(lookup
                .into_iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_owned())),
            Err(error) if is_no_records(&error) => Ok(None),
            Err(error) => Err(anyhow::Error::new(error).context("reverse lookup failed")),
        }
    }

    /// Every TXT record of `name`, each one with its character strings concatenated.
    pub async fn txt(&self, name: &str) -> anyhow::Result<Vec<String>> {
        let lookup = tokio::time::timeout(self.timeout, self.resolver.txt_lookup(name))
            .await
            .context("TXT lookup timed out")?;

        match lookup {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|data| String::from_utf8_lossy(data).into_owned())
                        .collect::<String>()
                })
                .collect()),
            Err(error) if is_no_records(&error) => Ok(Vec::new()),
            Err(error) => Err(anyhow::Error::new(error).context("TXT lookup failed")),
        }
    }
}

fn is_no_records(error: &ResolveError) -> bool {
    matches!(error.kind(), ResolveErrorKind::NoRecordsFound { .. })
}
