use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::addr::TargetAddress;
use crate::config::Settings;
use crate::error::{ProxyError, ProxyErrorKind};
use crate::monitor::AppMonitor;
use crate::proxy::direct::DirectClient;
use crate::proxy::socks5::{Socks5Client, Socks5Server};
use crate::proxy::{ProxyClient, ProxyRequest, ProxyServer};
use crate::relay;
use crate::rules::RuleMatcher;
use crate::transport;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// The assembled proxy: downstream servers plus the dispatcher they feed.
pub struct App {
    downstreams: Vec<(String, Box<dyn ProxyServer>)>,
    dispatcher: Arc<Dispatcher>,
}

struct Dispatcher {
    upstreams: HashMap<String, Arc<dyn ProxyClient>>,
    /// Fallback candidate set when no rule matches.
    upstream_names: Vec<String>,
    rules: RuleMatcher,
    connect_timeout: Duration,
    monitor: AppMonitor,
}

impl App {
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        if settings.downstreams.is_empty() {
            bail!("no downstream server defined");
        }
        if settings.upstreams.is_empty() {
            bail!("no upstream server defined");
        }

        let mut downstreams = Vec::new();
        for (name, ds) in &settings.downstreams {
            let transport = transport::from_settings(ds.transport.as_ref())
                .with_context(|| format!("failed to create downstream server: {name}"))?;
            let server: Box<dyn ProxyServer> = match ds.protocol.as_str() {
                "socks5" => Box::new(Socks5Server::new(name, &ds.listen, transport)),
                other => bail!("unknown protocol '{other}' in downstream server: {name}"),
            };
            downstreams.push((name.clone(), server));
        }

        let mut upstreams: HashMap<String, Arc<dyn ProxyClient>> = HashMap::new();
        let mut upstream_names = Vec::new();
        for (name, us) in &settings.upstreams {
            let transport = transport::from_settings(us.transport.as_ref())
                .with_context(|| format!("failed to create upstream client: {name}"))?;
            let client: Arc<dyn ProxyClient> = match us.protocol.as_str() {
                "direct" => Arc::new(DirectClient::new(transport)),
                "socks5" => {
                    let addr = us
                        .address
                        .as_deref()
                        .with_context(|| format!("upstream client '{name}' needs an address"))?;
                    Arc::new(Socks5Client::new(addr, transport))
                }
                other => bail!("unknown protocol '{other}' in upstream client: {name}"),
            };
            upstreams.insert(name.clone(), client);
            upstream_names.push(name.clone());
        }

        let rules = RuleMatcher::new(&settings.rules).context("failed to create rule matcher")?;
        for rule_upstream in rules.all_upstreams() {
            if !upstreams.contains_key(rule_upstream) {
                bail!("undefined upstream '{rule_upstream}' used in the rule set");
            }
        }

        let connect_timeout = settings
            .misc
            .connect_timeout
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        if connect_timeout.is_zero() {
            bail!("'connect_timeout' should be greater than 0");
        }

        let monitor = AppMonitor::new(settings.misc.enable_monitor);
        monitor.start(settings.misc.monitor_path.as_deref().unwrap_or("/debug/vars"));

        Ok(Self {
            downstreams,
            dispatcher: Arc::new(Dispatcher {
                upstreams,
                upstream_names,
                rules,
                connect_timeout,
                monitor,
            }),
        })
    }

    /// Starts every downstream server and blocks until `ctx` is cancelled
    /// and the dispatch loops have wound down.
    pub async fn run(mut self, ctx: CancellationToken) -> anyhow::Result<()> {
        let mut workers = JoinSet::new();
        for (name, mut server) in self.downstreams.drain(..) {
            let rx = server
                .start()
                .await
                .with_context(|| format!("failed to start downstream server: {name}"))?;
            let dispatcher = self.dispatcher.clone();
            let ctx = ctx.clone();
            workers.spawn(async move {
                info!(server = %name, "downstream server started");
                dispatcher.dispatch_loop(&ctx, &name, rx).await;
                server.stop().await;
                info!(server = %name, "downstream server stopped");
            });
        }
        info!("thestral app started");
        while workers.join_next().await.is_some() {}
        Ok(())
    }
}

impl Dispatcher {
    async fn dispatch_loop(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        ds_name: &str,
        mut requests: mpsc::Receiver<Box<dyn ProxyRequest>>,
    ) {
        loop {
            let request = tokio::select! {
                req = requests.recv() => match req {
                    Some(req) => req,
                    None => return,
                },
                _ = ctx.cancelled() => return,
            };
            let span = info_span!(
                "request",
                downstream = %ds_name,
                client = %request.peer_addr(),
                target = %request.target(),
            );
            span.in_scope(|| {
                info!(user_ids = ?request.peer_identifiers(), "request accepted");
            });
            let dispatcher = self.clone();
            let ctx = ctx.clone();
            let ds_name = ds_name.to_owned();
            tokio::spawn(
                dispatcher
                    .process_request(ctx, ds_name, request)
                    .instrument(span),
            );
        }
    }

    async fn process_request(
        self: Arc<Self>,
        ctx: CancellationToken,
        ds_name: String,
        request: Box<dyn ProxyRequest>,
    ) {
        // Classify the target against the rule set.
        let matched = match request.target() {
            TargetAddress::Ip4(sa) => self.rules.match_ip(IpAddr::V4(*sa.ip())),
            TargetAddress::Ip6(sa) => self.rules.match_ip(IpAddr::V6(*sa.ip())),
            TargetAddress::Domain(name, _) => self.rules.match_domain(name),
        };

        let (rule_name, candidates): (String, Vec<String>) = match matched {
            // No rule matched and no default rule: allow through any upstream.
            None => (String::new(), self.upstream_names.clone()),
            Some(m) if m.upstreams.is_empty() => {
                error!(rule = %m.rule, "request rejected by rule");
                request
                    .fail(ProxyError::from_kind(ProxyErrorKind::NotAllowed))
                    .await;
                return;
            }
            Some(m) => (m.rule.to_owned(), m.upstreams.to_vec()),
        };

        // Every candidate gets a non-zero chance; perfect uniformity is a
        // non-goal.
        let pick = rand::rng().random_range(0..candidates.len());
        let selected = candidates[pick].clone();
        debug!(rule = %rule_name, upstream = %selected, "upstream selected");
        let upstream = self
            .upstreams
            .get(&selected)
            .expect("BUG: selected upstream missing from the validated set")
            .clone();

        // Connect, bounded by the configured timeout.
        let connect_ctx = ctx.child_token();
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.connect_timeout,
            upstream.request(&connect_ctx, request.target()),
        )
        .await;
        let conn = match result {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => {
                error!(error = %err, kind = %err.kind(), upstream = %selected, "connection failed");
                request.fail(err).await;
                self.monitor.add_error(&selected);
                return;
            }
            Err(_) => {
                connect_ctx.cancel();
                let err = ProxyError::timeout("upstream connect timed out");
                error!(error = %err, upstream = %selected, "connection failed");
                request.fail(err).await;
                self.monitor.add_error(&selected);
                return;
            }
        };
        let connect_latency = started.elapsed();

        info!(
            bound = %conn.bound,
            upstream = %selected,
            server_ids = ?conn.peer_identifiers,
            "connection established"
        );
        let peer = request.peer_addr().to_string();
        let peer_ids = request.peer_identifiers().unwrap_or_default();
        let down = match request.success(&conn.bound).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "downstream handshake failed");
                return;
            }
        };

        let relay_ctx = ctx.child_token();
        let tunnel = self.monitor.open_tunnel_monitor(
            &rule_name,
            &ds_name,
            &selected,
            peer,
            peer_ids,
            conn.bound.to_string(),
            connect_latency,
            relay_ctx.clone(),
        );
        relay::relay(relay_ctx, tunnel, down, conn.stream).await;
    }
}
