//! Flow routing.
//!
//! The tunnel drains the inbound TCP and UDP queues, normalizes each flow's
//! metadata, picks an outbound (interception, operating mode or the rule
//! list) and connects the flow to it. UDP conversations keep one outbound
//! session in the [`NatTable`] with a relay task copying replies back.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::enhancer::Enhancer;
use crate::error::TunnelError;
use crate::lookup::Lookup;
use crate::metadata::{DnsMode, FlowType, Metadata, Network, PacketReply, TcpFlow, UdpPacket};
use crate::nat::{NatTable, Session};
use crate::outbound::{DIRECT, GLOBAL, Outbound, ProxyStream, REJECT, Reject};
use crate::process::{NoProcessFinder, ProcessFinder, process_name};
use crate::rule::Rule;
use crate::state::{Mode, RouterState, SharedState};
use crate::stats::TunnelStats;

/// Largest datagram relayed back to the client.
const UDP_BUFFER_SIZE: usize = 65535;

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub tcp_queue: usize,
    pub udp_queue: usize,
    pub udp_workers: usize,
    pub tcp_dial_timeout: Duration,
    /// Also bounds how long a packet waits for its session to be created.
    pub udp_dial_timeout: Duration,
    pub udp_idle_timeout: Duration,
    pub dns_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            tcp_queue: 200,
            udp_queue: 200,
            udp_workers: cpus.max(4),
            tcp_dial_timeout: Duration::from_secs(5),
            udp_dial_timeout: Duration::from_secs(5),
            udp_idle_timeout: Duration::from_secs(60),
            dns_timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of dispatching one flow.
#[derive(Clone)]
pub struct Route {
    pub outbound: Arc<dyn Outbound>,
    /// Rule that selected the outbound, in rule mode.
    pub rule: Option<Rule>,
    pub mode: Mode,
    pub intercepted: bool,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("outbound", &self.outbound.name())
            .field("rule", &self.rule)
            .field("mode", &self.mode)
            .field("intercepted", &self.intercepted)
            .finish()
    }
}

impl Route {
    fn new(outbound: Arc<dyn Outbound>, mode: Mode) -> Self {
        Self {
            outbound,
            rule: None,
            mode,
            intercepted: false,
        }
    }
}

/// Producer side of the inbound queues.
#[derive(Clone)]
pub struct Ingress {
    pub tcp: mpsc::Sender<TcpFlow>,
    pub udp: mpsc::Sender<UdpPacket>,
}

/// A datagram ready to be sent: preprocessed and resolved.
struct Outgoing {
    data: Bytes,
    metadata: Metadata,
    target: SocketAddr,
    key: String,
    reply: Arc<dyn PacketReply>,
    /// Fake address the client sent to, restored on replies.
    fake_addr: Option<IpAddr>,
}

pub struct Tunnel {
    state: Arc<SharedState>,
    lookup: Arc<Lookup>,
    enhancer: Arc<Enhancer>,
    process: Arc<dyn ProcessFinder>,
    nat: NatTable,
    stats: TunnelStats,
    config: TunnelConfig,
}

impl Tunnel {
    pub fn new(
        state: Arc<SharedState>,
        lookup: Arc<Lookup>,
        enhancer: Arc<Enhancer>,
        config: TunnelConfig,
    ) -> Self {
        Self {
            state,
            lookup,
            enhancer,
            process: Arc::new(NoProcessFinder),
            nat: NatTable::new(config.udp_dial_timeout),
            stats: TunnelStats::new(),
            config,
        }
    }

    pub fn with_process_finder(mut self, finder: Arc<dyn ProcessFinder>) -> Self {
        self.process = finder;
        self
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn nat(&self) -> &NatTable {
        &self.nat
    }

    pub fn stats(&self) -> &TunnelStats {
        &self.stats
    }

    /// Spawn the queue consumers and return the producer handles.
    ///
    /// TCP flows each get their own task; UDP packets are handled by a
    /// fixed pool of workers sharing one queue.
    pub fn start(self: &Arc<Self>) -> Ingress {
        let (tcp_tx, mut tcp_rx) = mpsc::channel::<TcpFlow>(self.config.tcp_queue);
        let (udp_tx, udp_rx) = mpsc::channel::<UdpPacket>(self.config.udp_queue);

        let udp_rx = Arc::new(Mutex::new(udp_rx));
        for _ in 0..self.config.udp_workers {
            let tunnel = self.clone();
            let udp_rx = udp_rx.clone();
            tokio::spawn(async move {
                loop {
                    let packet = udp_rx.lock().await.recv().await;
                    match packet {
                        Some(packet) => tunnel.handle_udp(packet).await,
                        None => break,
                    }
                }
            });
        }

        let tunnel = self.clone();
        tokio::spawn(async move {
            while let Some(flow) = tcp_rx.recv().await {
                let tunnel = tunnel.clone();
                tokio::spawn(async move { tunnel.handle_tcp(flow).await });
            }
        });

        info!(
            "[Tunnel] started with {} UDP workers, queues tcp={} udp={}",
            self.config.udp_workers, self.config.tcp_queue, self.config.udp_queue
        );

        Ingress {
            tcp: tcp_tx,
            udp: udp_tx,
        }
    }

    /// Normalize the destination: literal IPs move out of the host field
    /// and enhanced-mode addresses are turned back into host names.
    pub fn preprocess(&self, metadata: &mut Metadata) -> Result<(), TunnelError> {
        if let Ok(ip) = metadata.host.parse::<IpAddr>() {
            metadata.dst_ip = Some(ip);
            metadata.host.clear();
        }

        let Some(ip) = metadata.dst_ip else {
            return Ok(());
        };
        if !self.enhancer.mapping_enabled() || !metadata.host.is_empty() {
            return Ok(());
        }

        match self.enhancer.find_host_by_ip(ip) {
            Some(host) => {
                metadata.dns_mode = DnsMode::Mapping;
                if self.enhancer.fake_ip_enabled() {
                    metadata.dst_ip = None;
                    metadata.dns_mode = DnsMode::FakeIp;
                } else if let Some(mapped) = self.lookup.search_host(&host) {
                    metadata.dst_ip = Some(mapped);
                }
                metadata.host = host;
                Ok(())
            }
            None if self.enhancer.is_fake_ip(ip) => Err(TunnelError::FakeRecordMissing(ip)),
            None => Ok(()),
        }
    }

    /// Pick the outbound for a preprocessed flow against the current state.
    pub async fn dispatch(&self, metadata: &mut Metadata) -> Result<Route, TunnelError> {
        let state = self.state.snapshot();
        self.resolve_metadata(&state, metadata).await
    }

    async fn resolve_metadata(
        &self,
        state: &RouterState,
        metadata: &mut Metadata,
    ) -> Result<Route, TunnelError> {
        if let Some(interception) = self.interception(state, metadata) {
            return Ok(Route {
                intercepted: true,
                ..Route::new(interception, state.mode)
            });
        }

        match state.mode {
            Mode::Direct => fixed(state, DIRECT).map(|o| Route::new(o, Mode::Direct)),
            Mode::Global => fixed(state, GLOBAL).map(|o| Route::new(o, Mode::Global)),
            Mode::Script => self
                .match_script(state, metadata)
                .map(|o| Route::new(o, Mode::Script)),
            Mode::Rule => Ok(self.match_rules(state, metadata).await),
        }
    }

    fn interception(&self, state: &RouterState, metadata: &Metadata) -> Option<Arc<dyn Outbound>> {
        let outbound = state.interception.as_ref()?;
        if metadata.network != Network::Tcp || metadata.flow_type == FlowType::Interception {
            return None;
        }

        let rewritten = state
            .rewrite_hosts
            .as_ref()
            .is_some_and(|hosts| hosts.search(&metadata.destination()).is_some());
        (rewritten || metadata.dst_port == 80).then(|| outbound.clone())
    }

    fn match_script(
        &self,
        state: &RouterState,
        metadata: &mut Metadata,
    ) -> Result<Arc<dyn Outbound>, TunnelError> {
        if let Some(ip) = self.lookup.search_host(&metadata.host) {
            metadata.dst_ip = Some(ip);
        }

        let script = state
            .script
            .as_ref()
            .ok_or_else(|| TunnelError::Script("no script matcher configured".into()))?;
        let name = script.eval(metadata).map_err(TunnelError::Script)?;
        state
            .outbound(&name)
            .ok_or(TunnelError::OutboundNotFound(name))
    }

    /// Walk the rule list. The destination IP and the owning process are
    /// looked up at most once each, the first time a rule needs them.
    async fn match_rules(&self, state: &RouterState, metadata: &mut Metadata) -> Route {
        let mut resolved = false;
        let mut process_found = false;

        if let Some(ip) = self.lookup.search_host(&metadata.host) {
            metadata.dst_ip = Some(ip);
            resolved = true;
        }

        for rule in state.rules.iter() {
            if !resolved
                && rule.should_resolve_ip()
                && !metadata.host.is_empty()
                && metadata.dst_ip.is_none()
            {
                resolved = true;
                self.resolve_destination(metadata).await;
            }

            if !process_found && rule.should_find_process() {
                process_found = true;
                self.find_process(metadata);
            }

            if !rule.matches(metadata) {
                continue;
            }

            let Some(outbound) = state.outbound(rule.outbound()) else {
                continue;
            };
            if metadata.network == Network::Udp && !outbound.supports_udp() {
                debug!("{} UDP is not supported", outbound.name());
                continue;
            }

            return Route {
                rule: Some(rule.clone()),
                ..Route::new(outbound, Mode::Rule)
            };
        }

        let reject = state
            .outbound(REJECT)
            .unwrap_or_else(|| Arc::new(Reject));
        Route::new(reject, Mode::Rule)
    }

    async fn resolve_destination(&self, metadata: &mut Metadata) {
        let host = metadata.host.as_str();
        match tokio::time::timeout(self.config.dns_timeout, self.lookup.resolve_ip(host)).await {
            Ok(Ok(ip)) => {
                debug!("[DNS] {host} --> {ip}");
                metadata.dst_ip = Some(ip);
            }
            Ok(Err(err)) => debug!("[DNS] resolve {host} error: {err}"),
            Err(_) => debug!("[DNS] resolve {host} error: timed out"),
        }
    }

    fn find_process(&self, metadata: &mut Metadata) {
        let Some(src_ip) = metadata.src_ip else {
            return;
        };
        match self
            .process
            .find_process(metadata.network, src_ip, metadata.src_port)
        {
            Ok(path) => {
                debug!("[Process] {} from process {path}", metadata.source_address());
                metadata.process = process_name(&path);
                metadata.process_path = path;
            }
            Err(err) => debug!("[Process] find process {}: {err}", metadata.source_address()),
        }
    }

    pub async fn handle_tcp(&self, flow: TcpFlow) {
        let TcpFlow {
            mut conn,
            mut metadata,
        } = flow;
        self.stats.record_tcp();

        if !metadata.valid() {
            warn!("[Metadata] not valid: {metadata:?}");
            self.stats.record_dropped();
            return;
        }
        if let Err(err) = self.preprocess(&mut metadata) {
            debug!("[Metadata PreHandle] error: {err}");
            self.stats.record_dropped();
            return;
        }

        let route = match self.dispatch(&mut metadata).await {
            Ok(route) => route,
            Err(err) => {
                warn!("[Metadata] parse failed: {err}");
                self.stats.record_dropped();
                return;
            }
        };

        let mut remote = match self.dial_tcp(&route, &metadata).await {
            Ok(remote) => remote,
            Err(err) => {
                log_dial_failure("TCP", &route, &metadata, &err);
                self.stats.record_dropped();
                return;
            }
        };
        if route.outbound.name() == REJECT {
            self.stats.record_rejected();
        }
        log_route("TCP", &route, &metadata);

        if let Err(err) = tokio::io::copy_bidirectional(&mut conn, &mut remote).await {
            debug!("[TCP] {} relay ended: {err}", metadata.remote_address());
        }
    }

    async fn dial_tcp(
        &self,
        route: &Route,
        metadata: &Metadata,
    ) -> Result<Box<dyn ProxyStream>, TunnelError> {
        let timeout = self.config.tcp_dial_timeout;
        let pure = metadata.pure(route.intercepted);
        match tokio::time::timeout(timeout, route.outbound.dial(&pure)).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(source)) => Err(TunnelError::Dial {
                outbound: route.outbound.name().to_string(),
                source,
            }),
            Err(_) => Err(TunnelError::DialTimeout {
                outbound: route.outbound.name().to_string(),
                timeout,
            }),
        }
    }

    pub async fn handle_udp(self: &Arc<Self>, packet: UdpPacket) {
        self.stats.record_udp_packet();
        let Some(outgoing) = self.prepare_udp(packet).await else {
            self.stats.record_dropped();
            return;
        };

        if let Some(session) = self.nat.get(&outgoing.key) {
            send_packet(&session, &outgoing).await;
            return;
        }

        // Session creation may dial; keep the worker free for other flows.
        let tunnel = self.clone();
        tokio::spawn(async move {
            if let Err(err) = tunnel.deliver(&outgoing).await {
                debug!("[UDP] {} dropped: {err}", outgoing.metadata.remote_address());
                tunnel.stats.record_dropped();
            }
        });
    }

    async fn prepare_udp(&self, packet: UdpPacket) -> Option<Outgoing> {
        let UdpPacket {
            data,
            mut metadata,
            key,
            reply,
        } = packet;

        if !metadata.valid() {
            warn!("[Metadata] not valid: {metadata:?}");
            return None;
        }

        let fake_addr = metadata
            .dst_ip
            .filter(|ip| self.enhancer.is_exist_fake_ip(*ip));

        if let Err(err) = self.preprocess(&mut metadata) {
            debug!("[Metadata PreHandle] error: {err}");
            return None;
        }

        if !metadata.resolved() {
            let resolved = tokio::time::timeout(
                self.config.dns_timeout,
                self.lookup.resolve_first_ip(&metadata.host),
            )
            .await;
            match resolved {
                Ok(Ok(ip)) => metadata.dst_ip = Some(ip),
                Ok(Err(err)) => {
                    debug!("[UDP] resolve {} error: {err}", metadata.host);
                    return None;
                }
                Err(_) => {
                    debug!("[UDP] resolve {} error: timed out", metadata.host);
                    return None;
                }
            }
        }

        let target = metadata.udp_addr()?;
        Some(Outgoing {
            data,
            metadata,
            target,
            key,
            reply,
            fake_addr,
        })
    }

    /// Send through the conversation's session, creating it first if this
    /// packet is the one that claims creation.
    async fn deliver(self: &Arc<Self>, outgoing: &Outgoing) -> Result<(), TunnelError> {
        let (session, created) = self
            .nat
            .get_or_create(&outgoing.key, || self.create_session(outgoing.metadata.clone()))
            .await?;

        if created {
            self.stats.record_udp_session();
            let tunnel = self.clone();
            let relay = Relay {
                key: outgoing.key.clone(),
                session: session.clone(),
                reply: outgoing.reply.clone(),
                origin: outgoing.metadata.dst_ip,
                fake_addr: outgoing.fake_addr,
            };
            tokio::spawn(async move { tunnel.relay_to_local(relay).await });
        }

        send_packet(&session, outgoing).await;
        Ok(())
    }

    async fn create_session(&self, mut metadata: Metadata) -> Result<Session, TunnelError> {
        let route = self.dispatch(&mut metadata).await.inspect_err(|err| {
            warn!("[UDP] Parse metadata failed: {err}");
        })?;
        if !route.outbound.supports_udp() {
            let err = TunnelError::UnsupportedNetwork {
                outbound: route.outbound.name().to_string(),
                network: Network::Udp,
            };
            log_dial_failure("UDP", &route, &metadata, &err);
            return Err(err);
        }

        let timeout = self.config.udp_dial_timeout;
        let pure = metadata.pure(false);
        let session = match tokio::time::timeout(timeout, route.outbound.listen_packet(&pure)).await {
            Ok(Ok(session)) => session,
            Ok(Err(source)) => {
                let err = TunnelError::Dial {
                    outbound: route.outbound.name().to_string(),
                    source,
                };
                log_dial_failure("UDP", &route, &metadata, &err);
                return Err(err);
            }
            Err(_) => {
                let err = TunnelError::DialTimeout {
                    outbound: route.outbound.name().to_string(),
                    timeout,
                };
                log_dial_failure("UDP", &route, &metadata, &err);
                return Err(err);
            }
        };

        if route.outbound.name() == REJECT {
            self.stats.record_rejected();
        }
        log_route("UDP", &route, &metadata);
        Ok(session)
    }

    /// Copy replies from the outbound session back to the client until the
    /// session goes idle or fails, then drop it from the table.
    async fn relay_to_local(&self, relay: Relay) {
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        let idle = self.config.udp_idle_timeout;

        loop {
            let (n, mut from) = match tokio::time::timeout(idle, relay.session.recv_from(&mut buf)).await
            {
                Ok(Ok((n, from))) => (n, from),
                Err(_) => break,
                Ok(Err(err)) => {
                    if err.kind() != io::ErrorKind::UnexpectedEof {
                        debug!("[UDP] {} read error: {err}", relay.key);
                    }
                    break;
                }
            };

            if let (Some(fake), Some(origin)) = (relay.fake_addr, relay.origin) {
                if from.ip() == origin {
                    from.set_ip(fake);
                }
            }

            if let Err(err) = relay.reply.write_back(&buf[..n], from).await {
                debug!("[UDP] {} write back error: {err}", relay.key);
                break;
            }
        }

        self.nat.remove(&relay.key, &relay.session);
        relay.session.close();
    }
}

struct Relay {
    key: String,
    session: Session,
    reply: Arc<dyn PacketReply>,
    /// Real destination the session talks to.
    origin: Option<IpAddr>,
    fake_addr: Option<IpAddr>,
}

fn fixed(state: &RouterState, name: &str) -> Result<Arc<dyn Outbound>, TunnelError> {
    state
        .outbound(name)
        .ok_or_else(|| TunnelError::OutboundNotFound(name.to_string()))
}

async fn send_packet(session: &Session, outgoing: &Outgoing) {
    if let Err(err) = session.send_to(&outgoing.data, outgoing.target).await {
        debug!("[UDP] send to {} error: {err}", outgoing.target);
    }
}

fn log_route(network: &str, route: &Route, metadata: &Metadata) {
    if route.intercepted {
        return;
    }
    let src = metadata.source_address();
    let process = &metadata.process;
    let dst = metadata.remote_address();
    let outbound = route.outbound.name();

    match (&route.rule, route.mode) {
        (Some(rule), _) => info!(
            "[{network}] {src}({process}) --> {dst} match {}({}) using {outbound}",
            rule.kind(),
            rule.payload()
        ),
        (None, Mode::Script) => info!("[{network}] {src}({process}) --> {dst} using SCRIPT {outbound}"),
        (None, Mode::Global) => info!("[{network}] {src}({process}) --> {dst} using GLOBAL"),
        (None, Mode::Direct) => info!("[{network}] {src}({process}) --> {dst} using DIRECT"),
        (None, Mode::Rule) => {
            info!("[{network}] {src}({process}) --> {dst} doesn't match any rule using {outbound}")
        }
    }
}

fn log_dial_failure(network: &str, route: &Route, metadata: &Metadata, err: &TunnelError) {
    let outbound = route.outbound.name();
    let dst = metadata.remote_address();
    match &route.rule {
        Some(rule) => warn!(
            "[{network}] dial {outbound} (match {}/{}) to {dst} error: {err}",
            rule.kind(),
            rule.payload()
        ),
        None => warn!("[{network}] dial {outbound} to {dst} error: {err}"),
    }
}
