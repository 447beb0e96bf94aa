use std::net::IpAddr;
use std::process::ExitCode;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use hickory_proto::rr::RecordType;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use detour_router::dns::new_query;
use detour_router::enhancer::EnhancedMode;
use detour_router::error::{DnsError, ServiceError, TunnelError};
use detour_router::metadata::{Metadata, Network};
use detour_router::service::{Service, ServiceConfig};
use detour_router::state::Mode;
use detour_router::transport::NameServer;

#[derive(Parser)]
#[command(name = "detour-router")]
#[command(about = "Rule based traffic router", long_about = None)]
struct Args {
    /// Main nameserver, e.g. `8.8.8.8`, `tls://1.1.1.1` or `https://dns.google/dns-query`
    #[arg(short, long = "nameserver", default_value = "8.8.8.8", global = true)]
    nameservers: Vec<String>,

    /// Fallback nameserver raced against the main group
    #[arg(long = "fallback", global = true)]
    fallback: Vec<String>,

    /// Bootstrap nameserver used to resolve nameserver host names
    #[arg(long = "default-nameserver", global = true)]
    default_nameservers: Vec<String>,

    /// Nameserver used only for outbound server host names
    #[arg(long = "proxy-server-nameserver", global = true)]
    proxy_server_nameservers: Vec<String>,

    /// Answer AAAA questions
    #[arg(long, global = true)]
    ipv6: bool,

    /// Rule line, e.g. `DOMAIN-SUFFIX,google.com,DIRECT`
    #[arg(short, long = "rule", global = true)]
    rules: Vec<String>,

    #[arg(short, long, default_value = "rule", global = true)]
    mode: Mode,

    /// Static host entry as `name=ip`
    #[arg(long = "host-entry", global = true)]
    host_entries: Vec<String>,

    /// Answer address questions from the fake-ip pool
    #[arg(long, global = true)]
    fake_ip: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a host name to one address
    Resolve {
        host: String,
        /// Resolve the way outbound server names are resolved
        #[arg(long)]
        proxy_server: bool,
    },
    /// Send a DNS question through the resolver and print the answer
    Query {
        host: String,
        #[arg(short = 't', long = "type", default_value = "A")]
        record_type: String,
    },
    /// Show which outbound a flow would take
    Route {
        /// Destination host name or IP
        destination: String,
        #[arg(short, long, default_value_t = 443)]
        port: u16,
        #[arg(long)]
        udp: bool,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("invalid argument: {0}")]
    Argument(String),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

fn nameservers(inputs: &[String]) -> Result<Vec<NameServer>, CliError> {
    inputs
        .iter()
        .map(|s| NameServer::parse(s).map_err(CliError::from))
        .collect()
}

fn host_entry(input: &str) -> Result<(String, IpAddr), CliError> {
    let invalid = || CliError::Argument(format!("host entry {input:?}, expected name=ip"));
    let (name, ip) = input.split_once('=').ok_or_else(invalid)?;
    let ip = ip.trim().parse().map_err(|_| invalid())?;
    Ok((name.trim().to_string(), ip))
}

fn config(args: &Args) -> Result<ServiceConfig, CliError> {
    let mut config = ServiceConfig {
        rules: args.rules.clone(),
        mode: args.mode,
        hosts: args
            .host_entries
            .iter()
            .map(|e| host_entry(e))
            .collect::<Result<_, _>>()?,
        enhanced_mode: if args.fake_ip {
            EnhancedMode::FakeIp
        } else {
            EnhancedMode::Normal
        },
        ..Default::default()
    };
    config.resolver.main = nameservers(&args.nameservers)?;
    config.resolver.fallback = nameservers(&args.fallback)?;
    config.resolver.default = nameservers(&args.default_nameservers)?;
    config.resolver.proxy_server = nameservers(&args.proxy_server_nameservers)?;
    config.resolver.ipv6 = args.ipv6;
    Ok(config)
}

async fn run(args: Args) -> Result<(), CliError> {
    let service = Service::build(config(&args)?, Vec::new())?;

    match args.command {
        Command::Resolve { host, proxy_server } => {
            let ip = if proxy_server {
                service.proxy_server_lookup().resolve_ip(&host).await?
            } else {
                service.lookup().resolve_ip(&host).await?
            };
            println!("{ip}");
        }
        Command::Query { host, record_type } => {
            let record_type = RecordType::from_str(&record_type.to_ascii_uppercase())
                .map_err(|_| CliError::Argument(format!("record type {record_type}")))?;
            let response = service.exchange(&new_query(&host, record_type)?).await?;
            println!(";; {:?}", response.response_code());
            for record in response.answers() {
                println!("{record}");
            }
        }
        Command::Route {
            destination,
            port,
            udp,
        } => {
            let network = if udp { Network::Udp } else { Network::Tcp };
            let mut metadata = match destination.parse::<IpAddr>() {
                Ok(ip) => Metadata::new(network, "", port).with_dst_ip(ip),
                Err(_) => Metadata::new(network, destination, port),
            };
            let route = service.route(&mut metadata).await?;

            println!("outbound: {}", route.outbound.name());
            println!("mode:     {}", route.mode);
            match &route.rule {
                Some(rule) => println!("rule:     {}({})", rule.kind(), rule.payload()),
                None => println!("rule:     -"),
            }
            if let Some(ip) = metadata.dst_ip {
                println!("address:  {ip}");
            }
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::from)
        .and_then(|rt| rt.block_on(run(args)));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
