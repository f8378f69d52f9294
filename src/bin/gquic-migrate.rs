use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use gquic_migration::prelude::*;
use gquic_migration::MigrationRecord;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVER: &str = "203.0.113.10:443";
const SERVER_PREFERRED: &str = "203.0.113.20:443";
const CLIENT_WIFI: &str = "192.168.1.20:50000";
const CLIENT_CELLULAR: &str = "10.64.0.5:50000";
const NAT_PUBLIC: &str = "198.51.100.1:40000";
const NAT_REBOUND: &str = "198.51.100.1:40001";
const ISP_REASSIGNED: &str = "198.51.100.77:40000";

/// Delivery rounds before the simulated network is considered stuck
const MAX_ROUNDS: usize = 64;

#[derive(Parser)]
#[command(author, version, long_about = None)]
#[command(name = "gquic-migrate")]
#[command(about = "Replay QUIC connection migration scenarios between an in-process client and server")]
struct Cli {
    #[arg(value_enum, default_value = "all")]
    scenario: Scenario,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[arg(short, long)]
    config: Option<PathBuf>,

    /// One-way latency of the simulated network in milliseconds
    #[arg(long, default_value_t = 20)]
    latency_ms: u64,

    /// Print scenario reports as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
enum Scenario {
    /// NAT assigns the client a new port
    NatRebinding,
    /// Client moves from WiFi to cellular
    InterfaceSwitch,
    /// Client's ISP hands out a new public IP, client rotates its CID first
    IspReassignment,
    /// Client moves to the server's preferred address
    PreferredAddress,
    /// Client probes an interface that never answers
    ValidationFailure,
    All,
}

impl Scenario {
    const RUNNABLE: [Scenario; 5] = [
        Scenario::NatRebinding,
        Scenario::InterfaceSwitch,
        Scenario::IspReassignment,
        Scenario::PreferredAddress,
        Scenario::ValidationFailure,
    ];
}

#[derive(Debug, Serialize)]
struct ScenarioReport {
    scenario: Scenario,
    connection_alive: bool,
    client_active: PathKey,
    server_active: PathKey,
    client_migrations: Vec<MigrationRecord>,
    server_migrations: Vec<MigrationRecord>,
    events: Vec<String>,
}

fn addr(s: &str) -> SocketAddr {
    // Constants above are valid socket addresses
    s.parse().unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
}

/// Client and server connections joined by a simulated network with a NAT
struct Simulation {
    client: Connection,
    server: Connection,
    now: Instant,
    latency: Duration,
    grace: Duration,
    /// Client local address -> address the server observes
    nat: HashMap<SocketAddr, SocketAddr>,
    /// Client local addresses whose traffic is lost
    unreachable: HashSet<SocketAddr>,
    client_pn: u64,
    server_pn: u64,
    stream_offset: u64,
    events: Vec<String>,
}

impl Simulation {
    fn new(config: &MigrationConfig, latency: Duration, preferred: Option<SocketAddr>) -> Result<Self> {
        let now = Instant::now();
        let mut rng = rand::thread_rng();
        let client_cid = ConnectionId::generate(&mut rng, config.connection_id_length)?;
        let server_cid = ConnectionId::generate(&mut rng, config.connection_id_length)?;

        let client_params = TransportParameters {
            active_connection_id_limit: config.active_connection_id_limit,
            disable_active_migration: !config.migration_enabled,
            preferred_address: None,
        };
        let server_config = MigrationConfig { preferred_address: preferred, ..config.clone() };
        let server = Connection::new(
            Side::Server,
            server_config,
            addr(SERVER),
            addr(NAT_PUBLIC),
            server_cid.clone(),
            client_cid.clone(),
            client_params,
            now,
        )?;
        let client = Connection::new(
            Side::Client,
            config.clone(),
            addr(CLIENT_WIFI),
            addr(SERVER),
            client_cid,
            server_cid,
            server.local_transport_parameters(),
            now,
        )?;

        let mut sim = Self {
            client,
            server,
            now,
            latency,
            grace: config.cid_retirement_grace(),
            nat: HashMap::from([(addr(CLIENT_WIFI), addr(NAT_PUBLIC))]),
            unreachable: HashSet::new(),
            client_pn: 0,
            server_pn: 0,
            stream_offset: 0,
            events: Vec::new(),
        };
        sim.pump()?;
        Ok(sim)
    }

    /// Deliver queued datagrams in both directions until nothing is left to send
    fn pump(&mut self) -> Result<()> {
        for _ in 0..MAX_ROUNDS {
            let upstream: Vec<Transmit> = std::iter::from_fn(|| self.client.poll_transmit()).collect();
            let downstream: Vec<Transmit> = std::iter::from_fn(|| self.server.poll_transmit()).collect();
            self.collect_events();
            if upstream.is_empty() && downstream.is_empty() {
                return Ok(());
            }

            self.now += self.latency;
            for transmit in upstream {
                self.to_server(transmit)?;
            }
            for transmit in downstream {
                self.to_client(transmit)?;
            }
        }
        bail!("simulated network did not settle after {} rounds", MAX_ROUNDS)
    }

    fn to_server(&mut self, transmit: Transmit) -> Result<()> {
        let Some(dcid) = transmit.destination_cid else {
            warn!("Client datagram without destination connection ID");
            return Ok(());
        };
        if self.unreachable.contains(&transmit.path.local) {
            debug!("Lost datagram from unreachable {}", transmit.path.local);
            return Ok(());
        }
        let observed = self.nat.get(&transmit.path.local).copied().unwrap_or(transmit.path.local);

        self.client_pn += 1;
        let packet = IncomingPacket::new(transmit.path.remote, observed, dcid, self.client_pn, transmit.frames)
            .with_size(transmit.size);
        let disposition = self.server.on_packet_received(packet, self.now)?;
        debug!("Server <- {}: {:?}", observed, disposition);
        Ok(())
    }

    fn to_client(&mut self, transmit: Transmit) -> Result<()> {
        let Some(dcid) = transmit.destination_cid else {
            warn!("Server datagram without destination connection ID");
            return Ok(());
        };
        let Some(local) = self
            .nat
            .iter()
            .find(|(_, public)| **public == transmit.path.remote)
            .map(|(local, _)| *local)
        else {
            debug!("No NAT mapping for {}, datagram lost", transmit.path.remote);
            return Ok(());
        };
        if self.unreachable.contains(&local) {
            return Ok(());
        }

        self.server_pn += 1;
        let packet = IncomingPacket::new(local, transmit.path.local, dcid, self.server_pn, transmit.frames)
            .with_size(transmit.size);
        let disposition = self.client.on_packet_received(packet, self.now)?;
        debug!("Client <- {}: {:?}", transmit.path.local, disposition);
        Ok(())
    }

    fn send_data(&mut self, message: &str) -> Result<()> {
        let data = Bytes::copy_from_slice(message.as_bytes());
        let offset = self.stream_offset;
        self.stream_offset += data.len() as u64;
        self.client.send_on_active(vec![Frame::Stream { stream_id: 0, offset, data, fin: false }])?;
        self.pump()
    }

    /// Advance virtual time to `end`, firing every timer on the way
    fn run_until(&mut self, end: Instant) -> Result<()> {
        while let Some(next) = [self.client.poll_timeout(), self.server.poll_timeout()]
            .into_iter()
            .flatten()
            .min()
            .filter(|next| *next <= end)
        {
            self.now = self.now.max(next);
            self.client.handle_timeout(self.now);
            self.server.handle_timeout(self.now);
            self.pump()?;
        }
        self.now = self.now.max(end);
        Ok(())
    }

    /// Let retired connection IDs run out their grace window
    fn settle(&mut self) -> Result<()> {
        self.run_until(self.now + self.grace + Duration::from_millis(500))
    }

    fn collect_events(&mut self) {
        while let Some(event) = self.client.poll_event() {
            let line = format!("client: {}", describe(&event));
            info!("{}", line);
            self.events.push(line);
        }
        while let Some(event) = self.server.poll_event() {
            let line = format!("server: {}", describe(&event));
            info!("{}", line);
            self.events.push(line);
        }
    }

    fn report(self, scenario: Scenario) -> ScenarioReport {
        ScenarioReport {
            scenario,
            connection_alive: !self.client.is_closed() && !self.server.is_closed(),
            client_active: self.client.active_path(),
            server_active: self.server.active_path(),
            client_migrations: self.client.history().iter().cloned().collect(),
            server_migrations: self.server.history().iter().cloned().collect(),
            events: self.events,
        }
    }
}

fn describe(event: &ConnectionEvent) -> String {
    match event {
        ConnectionEvent::HandshakeCompleted { path } => format!("handshake completed on {}", path),
        ConnectionEvent::PathValidated { path, rtt } => format!("path {} validated (RTT {:?})", path, rtt),
        ConnectionEvent::MigrationCompleted { from, to, trigger, migration } => {
            format!("migration #{} {} -> {} ({})", migration, from, to, trigger)
        }
        ConnectionEvent::ValidationFailed { path, attempts } => {
            format!("validation of {} failed after {} attempts", path, attempts)
        }
        ConnectionEvent::StreamDataReceived { stream_id, data, path, .. } => {
            format!("stream {} received {} bytes on {}", stream_id, data.len(), path)
        }
    }
}

fn run_scenario(scenario: Scenario, config: &MigrationConfig, latency: Duration) -> Result<ScenarioReport> {
    info!("▶️  Scenario: {:?}", scenario);
    let preferred = (scenario == Scenario::PreferredAddress).then(|| addr(SERVER_PREFERRED));
    let mut sim = Simulation::new(config, latency, preferred)?;
    sim.send_data("hello from wifi")?;

    match scenario {
        Scenario::NatRebinding => {
            info!("🔀 NAT rebinding: {} now appears as {}", CLIENT_WIFI, NAT_REBOUND);
            sim.nat.insert(addr(CLIENT_WIFI), addr(NAT_REBOUND));
            sim.send_data("hello after rebinding")?;
        }
        Scenario::InterfaceSwitch => {
            info!("📶 Switching from WiFi to cellular ({})", CLIENT_CELLULAR);
            sim.nat.insert(addr(CLIENT_CELLULAR), addr(CLIENT_CELLULAR));
            let now = sim.now;
            sim.client.probe_path(addr(CLIENT_CELLULAR), addr(SERVER), now)?;
            sim.pump()?;
            sim.send_data("hello over cellular")?;
        }
        Scenario::IspReassignment => {
            let cid = sim.client.rotate_destination_cid()?;
            info!("🔑 Client switched to destination connection ID {}", cid);
            sim.pump()?;
            info!("🌐 ISP reassigned public address to {}", ISP_REASSIGNED);
            sim.nat.insert(addr(CLIENT_WIFI), addr(ISP_REASSIGNED));
            sim.send_data("hello from the new address")?;
        }
        Scenario::PreferredAddress => {
            let now = sim.now;
            let path = sim
                .client
                .on_preferred_address(addr(CLIENT_WIFI), now)?
                .context("server did not advertise a preferred address")?;
            info!("🎯 Probing server preferred address on {}", path);
            sim.pump()?;
            sim.send_data("hello preferred address")?;
        }
        Scenario::ValidationFailure => {
            info!("📵 Probing cellular interface without coverage");
            sim.nat.insert(addr(CLIENT_CELLULAR), addr(CLIENT_CELLULAR));
            sim.unreachable.insert(addr(CLIENT_CELLULAR));
            let now = sim.now;
            sim.client.probe_path(addr(CLIENT_CELLULAR), addr(SERVER), now)?;
            sim.pump()?;
            let deadline = sim.now + Duration::from_secs(10);
            sim.run_until(deadline)?;
            sim.send_data("still on wifi")?;
        }
        Scenario::All => bail!("'all' is not a single scenario"),
    }

    sim.settle()?;
    Ok(sim.report(scenario))
}

fn print_report(report: &ScenarioReport) {
    let status = if report.connection_alive { "✅ alive" } else { "❌ closed" };
    println!("== {:?} ({}) ==", report.scenario, status);
    println!("  client active path: {}", report.client_active);
    println!("  server active path: {}", report.server_active);
    for record in report.client_migrations.iter().chain(&report.server_migrations) {
        println!(
            "  migration #{}: {} -> {} ({}, +{}ms)",
            record.number, record.from, record.to, record.trigger, record.elapsed_ms
        );
    }
    for event in &report.events {
        println!("  {}", event);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::filter::LevelFilter::from_level(log_level))
        .init();

    info!("🚀 gquic-migrate v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = MigrationConfig::load(cli.config.as_deref()).context("loading migration config")?;
    let latency = Duration::from_millis(cli.latency_ms);

    let scenarios: Vec<Scenario> = match cli.scenario {
        Scenario::All => Scenario::RUNNABLE.to_vec(),
        scenario => vec![scenario],
    };

    let mut reports = Vec::with_capacity(scenarios.len());
    for scenario in scenarios {
        let report = run_scenario(scenario, &config, latency)
            .with_context(|| format!("scenario {:?}", scenario))?;
        reports.push(report);
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            print_report(report);
        }
    }

    Ok(())
}
