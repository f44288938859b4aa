use anyhow::Context;
use clap::Parser;
use etherparse::{EtherType, Ethernet2Header};
use ipnet::Ipv4Net;
use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tunport::{
    EtherAddress, Ifconfig, KernelTun, Output, PacketBuffer, Queue, Scheduler, SenderConfig,
    SystemOpener, ToDevice, TunConfig,
};

#[derive(Parser)]
#[command(name = "tunport")]
#[command(about = "Forward IP packets from a kernel tunnel out a raw link")]
struct Args {
    /// Near address and prefix of the tunnel interface
    #[arg(long, default_value = "10.0.0.1/24")]
    addr: Ipv4Net,

    /// Install a default route through this address
    #[arg(long)]
    gateway: Option<Ipv4Addr>,

    /// Interface name to ask the tunnel driver for
    #[arg(long)]
    dev_name: Option<String>,

    #[arg(long, default_value_t = tunport::config::DEFAULT_MTU)]
    mtu: usize,

    /// Hardware address of the tunnel interface (tap drivers only)
    #[arg(long)]
    ether: Option<EtherAddress>,

    /// Report only the first error of a run
    #[arg(long)]
    ignore_queue_overflows: bool,

    /// Link to send Ethernet frames out of
    #[arg(long)]
    link: String,

    /// Source MAC of frames sent on the link
    #[arg(long, default_value = "02:00:00:00:00:01")]
    src_mac: EtherAddress,

    /// Destination MAC of frames sent on the link
    #[arg(long, default_value = "ff:ff:ff:ff:ff:ff")]
    dst_mac: EtherAddress,

    /// Keep a frame for retry when the link queue is full
    #[arg(long)]
    use_q: bool,

    #[arg(long, default_value_t = 256)]
    queue_len: usize,
}

/// Prepends an Ethernet header and passes the frame on.
struct EtherEncap<O> {
    header: Ethernet2Header,
    next: O,
}

impl<O: Output> Output for EtherEncap<O> {
    fn push(&mut self, mut packet: PacketBuffer) {
        let mut header = self.header.clone();
        if packet.data().first().map(|b| b >> 4) == Some(6) {
            header.ether_type = EtherType::IPV6;
        }
        packet
            .push(Ethernet2Header::LEN)
            .copy_from_slice(&header.to_bytes());
        self.next.push(packet);
    }
}

/// Only a device that cannot be opened stops the process. A failed address
/// setup leaves the interface open, so forwarding carries on.
fn tolerate_unconfigured(setup: tunport::Result<()>) -> anyhow::Result<()> {
    match setup {
        Ok(()) => Ok(()),
        Err(e @ tunport::Error::Configuration { .. }) => {
            warn!(error = %e, "continuing with unconfigured interface");
            Ok(())
        }
        Err(e) => Err(e).context("failed to open tunnel device"),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut tun_config = TunConfig::new(args.addr.addr(), args.addr.netmask())?;
    tun_config.gateway = args.gateway;
    tun_config.dev_name = args.dev_name;
    tun_config.mtu = args.mtu;
    tun_config.ether = args.ether;
    tun_config.ignore_queue_overflows = args.ignore_queue_overflows;

    let mut tun = KernelTun::new(tun_config, Box::new(Ifconfig));
    tolerate_unconfigured(tun.initialize(&mut SystemOpener))?;
    info!(
        dev = tun.dev_name().unwrap_or(""),
        variant = %tun.variant().map(|v| v.to_string()).unwrap_or_default(),
        "tunnel interface up"
    );

    let queue = Queue::new(args.queue_len);
    tun.connect_output(Box::new(EtherEncap {
        header: Ethernet2Header {
            source: args.src_mac.octets(),
            destination: args.dst_mac.octets(),
            ether_type: EtherType::IPV4,
        },
        next: queue.clone(),
    }));

    let mut sender_config = SenderConfig::new(args.link.clone());
    sender_config.use_q = args.use_q;
    sender_config.ignore_queue_overflows = args.ignore_queue_overflows;
    let mut sender = ToDevice::open(sender_config)
        .with_context(|| format!("failed to open raw socket on {}", args.link))?;
    sender.connect_upstream(Box::new(queue));

    let mut scheduler = Scheduler::new();
    scheduler.add(Rc::new(RefCell::new(tun)));
    scheduler.add(Rc::new(RefCell::new(sender)));

    info!(link = %args.link, "forwarding");
    scheduler
        .run(64, Duration::from_millis(500))
        .context("scheduler failed")?;
    Ok(())
}
