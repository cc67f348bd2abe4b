//! Mail server discovery (spec §4.3): fan out over SRV, autoconfig XML, MX
//! heuristics, and provider aliases, then race TCP probes over the
//! deduplicated candidate set. DNS lookups go through `hickory-resolver`
//! (natively async); autoconfig XML is parsed with `quick-xml`.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::timeout;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const AUTOCONFIG_TIMEOUT: Duration = Duration::from_secs(5);

fn mx_aliases() -> &'static HashMap<&'static str, &'static [&'static str]> {
    use std::sync::OnceLock;
    static MAP: OnceLock<HashMap<&'static str, &'static [&'static str]>> = OnceLock::new();
    MAP.get_or_init(|| {
        HashMap::from([
            ("google.com", &["gmail.com"][..]),
            ("outlook.com", &["office365.com"][..]),
            ("protection.outlook.com", &["office365.com"][..]),
            ("microsoft.com", &["office365.com"][..]),
        ])
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    Srv,
    Autoconfig,
    Mx,
    Common,
}

impl Source {
    fn label(&self) -> &'static str {
        match self {
            Source::Srv => "srv",
            Source::Autoconfig => "autoconfig",
            Source::Mx => "mx",
            Source::Common => "common",
        }
    }

    fn priority(&self) -> u8 {
        match self {
            Source::Srv => 0,
            Source::Autoconfig => 1,
            Source::Mx => 2,
            Source::Common => 3,
        }
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    host: String,
    port: u16,
    priority: u8,
    source: Source,
}

#[derive(Debug, Default)]
struct CandidateSet {
    smtp: Vec<Candidate>,
    imap: Vec<Candidate>,
    mx_bases: HashSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imap_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imap_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imap_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct DiscoveryClient {
    http: reqwest::Client,
    resolver: TokioAsyncResolver,
}

impl DiscoveryClient {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(AUTOCONFIG_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Ok(Self { http, resolver })
    }

    /// Batch discovery: returns once every phase has completed.
    pub async fn discover(&self, email: &str) -> DiscoveryResult {
        let Some(domain) = domain_of(email) else {
            return DiscoveryResult {
                domain: String::new(),
                smtp_host: None,
                smtp_port: None,
                smtp_source: None,
                imap_host: None,
                imap_port: None,
                imap_source: None,
                error: Some("Invalid email address".to_string()),
            };
        };

        let mut set = CandidateSet::default();
        let (srv, mx) = tokio::join!(self.discover_srv(&domain), self.discover_mx(&domain));
        merge(&mut set, srv);
        merge(&mut set, mx);

        let autoconfig = self.discover_autoconfig(&domain).await;
        merge(&mut set, autoconfig);

        let alias_domains = self.alias_domains(&set.mx_bases, &domain);
        if !alias_domains.is_empty() {
            let alias_results = futures::future::join_all(
                alias_domains.iter().map(|d| self.discover_autoconfig(d)),
            )
            .await;
            for r in alias_results {
                merge(&mut set, r);
            }
            for alias in &alias_domains {
                append_mx_style(&mut set, alias);
            }
        }

        append_common(&mut set, &domain);

        let (smtp_best, imap_best) =
            tokio::join!(probe_best(&set.smtp), probe_best(&set.imap));

        DiscoveryResult {
            domain,
            smtp_host: smtp_best.as_ref().map(|c| c.host.clone()),
            smtp_port: smtp_best.as_ref().map(|c| c.port),
            smtp_source: smtp_best.as_ref().map(|c| c.source.label().to_string()),
            imap_host: imap_best.as_ref().map(|c| c.host.clone()),
            imap_port: imap_best.as_ref().map(|c| c.port),
            imap_source: imap_best.as_ref().map(|c| c.source.label().to_string()),
            error: None,
        }
    }

    /// Streaming discovery, emitting phases in strict order (spec §4.3).
    /// Consumers turn each `PhaseEvent` into an SSE frame at the HTTP edge.
    pub async fn discover_stream<F>(&self, email: &str, mut emit: F) -> DiscoveryResult
    where
        F: FnMut(PhaseEvent),
    {
        let Some(domain) = domain_of(email) else {
            let result = DiscoveryResult {
                domain: String::new(),
                smtp_host: None,
                smtp_port: None,
                smtp_source: None,
                imap_host: None,
                imap_port: None,
                imap_source: None,
                error: Some("Invalid email address".to_string()),
            };
            emit(PhaseEvent::Complete(result.clone()));
            return result;
        };

        let mut set = CandidateSet::default();

        emit(PhaseEvent::Phase {
            name: "dns",
            message: "Querying DNS records...".to_string(),
        });
        let (srv, mx) = tokio::join!(self.discover_srv(&domain), self.discover_mx(&domain));
        merge(&mut set, srv);
        merge(&mut set, mx);

        emit(PhaseEvent::Phase {
            name: "autoconfig",
            message: "Checking autoconfig...".to_string(),
        });
        let autoconfig = self.discover_autoconfig(&domain).await;
        merge(&mut set, autoconfig);

        let alias_domains = self.alias_domains(&set.mx_bases, &domain);
        if !alias_domains.is_empty() {
            let names: Vec<&str> = alias_domains.iter().map(String::as_str).collect();
            emit(PhaseEvent::Phase {
                name: "aliases",
                message: format!("Trying provider aliases: {}", names.join(", ")),
            });
            let alias_results = futures::future::join_all(
                alias_domains.iter().map(|d| self.discover_autoconfig(d)),
            )
            .await;
            for r in alias_results {
                merge(&mut set, r);
            }
            for alias in &alias_domains {
                append_mx_style(&mut set, alias);
            }
        }

        append_common(&mut set, &domain);

        emit(PhaseEvent::Phase {
            name: "probing",
            message: "Probing mail servers...".to_string(),
        });
        let (smtp_best, imap_best) =
            tokio::join!(probe_best(&set.smtp), probe_best(&set.imap));

        let result = DiscoveryResult {
            domain,
            smtp_host: smtp_best.as_ref().map(|c| c.host.clone()),
            smtp_port: smtp_best.as_ref().map(|c| c.port),
            smtp_source: smtp_best.as_ref().map(|c| c.source.label().to_string()),
            imap_host: imap_best.as_ref().map(|c| c.host.clone()),
            imap_port: imap_best.as_ref().map(|c| c.port),
            imap_source: imap_best.as_ref().map(|c| c.source.label().to_string()),
            error: None,
        };
        emit(PhaseEvent::Complete(result.clone()));
        result
    }

    fn alias_domains(&self, mx_bases: &HashSet<String>, domain: &str) -> Vec<String> {
        let mut aliases: HashSet<String> = HashSet::new();
        for base in mx_bases {
            aliases.insert(base.clone());
            if let Some(known) = mx_aliases().get(base.as_str()) {
                for alias in *known {
                    aliases.insert(alias.to_string());
                }
            }
        }
        aliases.remove(domain);
        aliases.into_iter().collect()
    }

    async fn discover_srv(&self, domain: &str) -> CandidateSet {
        let mut set = CandidateSet::default();

        for name in [
            format!("_submissions._tcp.{domain}"),
            format!("_submission._tcp.{domain}"),
        ] {
            if let Ok(answer) = self.resolver.srv_lookup(name).await {
                for srv in answer.iter() {
                    let host = srv.target().to_utf8().trim_end_matches('.').to_string();
                    if !host.is_empty() {
                        set.smtp.push(Candidate {
                            host,
                            port: srv.port(),
                            priority: Source::Srv.priority(),
                            source: Source::Srv,
                        });
                    }
                }
            }
        }

        if let Ok(answer) = self.resolver.srv_lookup(format!("_imaps._tcp.{domain}")).await {
            for srv in answer.iter() {
                let host = srv.target().to_utf8().trim_end_matches('.').to_string();
                if !host.is_empty() {
                    set.imap.push(Candidate {
                        host,
                        port: srv.port(),
                        priority: Source::Srv.priority(),
                        source: Source::Srv,
                    });
                }
            }
        }

        set
    }

    async fn discover_mx(&self, domain: &str) -> CandidateSet {
        let mut set = CandidateSet::default();

        let Ok(answer) = self.resolver.mx_lookup(domain).await else {
            return set;
        };

        for mx in answer.iter() {
            let host = mx.exchange().to_utf8().trim_end_matches('.').to_lowercase();
            let parts: Vec<&str> = host.split('.').collect();
            if parts.len() < 2 {
                continue;
            }
            let base = parts[parts.len() - 2..].join(".");
            set.mx_bases.insert(base.clone());
            for port in [465, 587] {
                set.smtp.push(Candidate {
                    host: format!("smtp.{base}"),
                    port,
                    priority: Source::Mx.priority(),
                    source: Source::Mx,
                });
                set.smtp.push(Candidate {
                    host: format!("mail.{base}"),
                    port,
                    priority: Source::Mx.priority(),
                    source: Source::Mx,
                });
            }
            set.imap.push(Candidate {
                host: format!("imap.{base}"),
                port: 993,
                priority: Source::Mx.priority(),
                source: Source::Mx,
            });
            set.imap.push(Candidate {
                host: format!("mail.{base}"),
                port: 993,
                priority: Source::Mx.priority(),
                source: Source::Mx,
            });
        }

        set
    }

    async fn discover_autoconfig(&self, domain: &str) -> CandidateSet {
        let mut set = CandidateSet::default();

        let urls = [
            format!("https://autoconfig.{domain}/mail/config-v1.1.xml"),
            format!("https://{domain}/.well-known/autoconfig/mail/config-v1.1.xml"),
            format!("https://autoconfig.thunderbird.net/v1.1/{domain}"),
        ];

        for url in urls {
            let Ok(resp) = self.http.get(&url).send().await else {
                continue;
            };
            if resp.status() != reqwest::StatusCode::OK {
                continue;
            }
            let Ok(body) = resp.text().await else {
                continue;
            };
            if body.trim().is_empty() {
                continue;
            }
            parse_autoconfig(&body, &mut set);
            if !set.smtp.is_empty() || !set.imap.is_empty() {
                break;
            }
        }

        set
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum PhaseEvent {
    Phase { name: &'static str, message: String },
    Complete(DiscoveryResult),
}

fn domain_of(email: &str) -> Option<String> {
    email.split_once('@').map(|(_, domain)| domain.to_lowercase())
}

fn merge(set: &mut CandidateSet, other: CandidateSet) {
    set.smtp.extend(other.smtp);
    set.imap.extend(other.imap);
    set.mx_bases.extend(other.mx_bases);
}

fn append_mx_style(set: &mut CandidateSet, alias: &str) {
    for port in [465, 587] {
        set.smtp.push(Candidate {
            host: format!("smtp.{alias}"),
            port,
            priority: Source::Mx.priority(),
            source: Source::Mx,
        });
    }
    set.imap.push(Candidate {
        host: format!("imap.{alias}"),
        port: 993,
        priority: Source::Mx.priority(),
        source: Source::Mx,
    });
}

fn append_common(set: &mut CandidateSet, domain: &str) {
    for host in [format!("smtp.{domain}"), format!("mail.{domain}")] {
        for port in [465, 587] {
            set.smtp.push(Candidate {
                host: host.clone(),
                port,
                priority: Source::Common.priority(),
                source: Source::Common,
            });
        }
    }
    for host in [format!("imap.{domain}"), format!("mail.{domain}")] {
        set.imap.push(Candidate {
            host,
            port: 993,
            priority: Source::Common.priority(),
            source: Source::Common,
        });
    }
}

fn parse_autoconfig(xml: &str, set: &mut CandidateSet) {
    use quick_xml::events::Event;
    use quick_xml::reader::Reader;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut in_outgoing = false;
    let mut in_incoming_imap = false;
    let mut hostname: Option<String> = None;
    let mut port: Option<u16> = None;
    let mut current_tag = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                match name.as_str() {
                    "outgoingServer" => {
                        in_outgoing = true;
                        hostname = None;
                        port = None;
                    }
                    "incomingServer" => {
                        let is_imap = e.attributes().flatten().any(|a| {
                            a.key.as_ref() == b"type" && a.value.as_ref() == b"imap"
                        });
                        in_incoming_imap = is_imap;
                        hostname = None;
                        port = None;
                    }
                    other => current_tag = other.to_string(),
                }
            }
            Ok(Event::Text(t)) => {
                if in_outgoing || in_incoming_imap {
                    let text = t.unescape().unwrap_or_default().trim().to_string();
                    match current_tag.as_str() {
                        "hostname" => hostname = Some(text),
                        "port" => port = text.parse().ok(),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if name == "outgoingServer" && in_outgoing {
                    if let (Some(h), Some(p)) = (hostname.take(), port.take()) {
                        set.smtp.push(Candidate {
                            host: h,
                            port: p,
                            priority: Source::Autoconfig.priority(),
                            source: Source::Autoconfig,
                        });
                    }
                    in_outgoing = false;
                } else if name == "incomingServer" {
                    if in_incoming_imap {
                        if let (Some(h), Some(p)) = (hostname.take(), port.take()) {
                            set.imap.push(Candidate {
                                host: h,
                                port: p,
                                priority: Source::Autoconfig.priority(),
                                source: Source::Autoconfig,
                            });
                        }
                    }
                    in_incoming_imap = false;
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }
}

async fn probe_best(candidates: &[Candidate]) -> Option<Candidate> {
    if candidates.is_empty() {
        return None;
    }

    let mut dedup: HashMap<(String, u16), Candidate> = HashMap::new();
    for candidate in candidates {
        let key = (candidate.host.clone(), candidate.port);
        match dedup.get(&key) {
            Some(existing) if existing.priority <= candidate.priority => {}
            _ => {
                dedup.insert(key, candidate.clone());
            }
        }
    }

    let probes = dedup.into_values().map(|candidate| async move {
        let addr = format!("{}:{}", candidate.host, candidate.port);
        match timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => Some(candidate),
            _ => None,
        }
    });

    let mut successes: Vec<Candidate> = futures::future::join_all(probes)
        .await
        .into_iter()
        .flatten()
        .collect();

    successes.sort_by_key(|c| c.priority);
    successes.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_extraction_rejects_missing_at_sign() {
        assert_eq!(domain_of("not-an-email"), None);
        assert_eq!(domain_of("user@Example.COM"), Some("example.com".to_string()));
    }

    #[test]
    fn dedup_keeps_lowest_priority_candidate() {
        let candidates = vec![
            Candidate { host: "mail.example.com".into(), port: 587, priority: 3, source: Source::Common },
            Candidate { host: "mail.example.com".into(), port: 587, priority: 0, source: Source::Srv },
        ];
        let mut dedup: HashMap<(String, u16), Candidate> = HashMap::new();
        for candidate in &candidates {
            let key = (candidate.host.clone(), candidate.port);
            match dedup.get(&key) {
                Some(existing) if existing.priority <= candidate.priority => {}
                _ => {
                    dedup.insert(key, candidate.clone());
                }
            }
        }
        let kept = dedup.into_values().next().unwrap();
        assert_eq!(kept.source, Source::Srv);
    }

    #[test]
    fn parses_autoconfig_xml() {
        let xml = r#"
        <clientConfig>
          <emailProvider>
            <outgoingServer type="smtp">
              <hostname>smtp.example.com</hostname>
              <port>587</port>
            </outgoingServer>
            <incomingServer type="imap">
              <hostname>imap.example.com</hostname>
              <port>993</port>
            </incomingServer>
            <incomingServer type="pop3">
              <hostname>pop.example.com</hostname>
              <port>995</port>
            </incomingServer>
          </emailProvider>
        </clientConfig>
        "#;
        let mut set = CandidateSet::default();
        parse_autoconfig(xml, &mut set);
        assert_eq!(set.smtp.len(), 1);
        assert_eq!(set.smtp[0].host, "smtp.example.com");
        assert_eq!(set.smtp[0].port, 587);
        assert_eq!(set.imap.len(), 1);
        assert_eq!(set.imap[0].host, "imap.example.com");
    }
}
