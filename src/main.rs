use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clap_derive::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, Level};

use tftp_errsim::console::{Console, ConsoleAction};
use tftp_errsim::relay::RelaySession;
use tftp_errsim::relay_config::RelayConfig;
use tftp_errsim::socket::UdpDatagramSocket;

/// TFTP error simulator: relays a transfer between a client and a server, delaying,
///  duplicating or losing packets as instructed on the console
#[derive(Parser)]
struct Args {
    /// where clients send their initial request
    #[clap(long, default_value = "0.0.0.0:23")]
    listen: SocketAddr,

    /// the server's well-known address
    #[clap(long, default_value = "127.0.0.1:69")]
    server: SocketAddr,

    /// local address of the socket used for everything after the initial request
    #[clap(long, default_value = "0.0.0.0:0")]
    general_bind: SocketAddr,

    #[clap(long, default_value_t = 5000)]
    poll_interval_millis: u64,

    #[clap(long, default_value_t = 50)]
    duplicate_timeout_millis: u64,

    #[clap(long, default_value_t = 10)]
    max_recv_errors: u32,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
pub async fn main() {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let exit_code = match run(args).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = RelayConfig::new(args.server);
    config.client_listen_addr = args.listen;
    config.general_bind_addr = args.general_bind;
    config.poll_interval = Duration::from_millis(args.poll_interval_millis);
    config.duplicate_response_timeout = Duration::from_millis(args.duplicate_timeout_millis);
    config.max_consecutive_recv_errors = args.max_recv_errors;
    config.validate()?;

    // bind before taking commands so that an unavailable port is reported right away
    let client_socket = UdpDatagramSocket::bind(config.client_listen_addr).await?;
    let general_socket = UdpDatagramSocket::bind(config.general_bind_addr).await?;

    let mut console = Console::new(std::io::stdout());
    console.print_banner()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let Some(line) = lines.next_line().await? else {
            info!("console input closed - exiting");
            return Ok(());
        };

        match console.handle_line(&line)? {
            ConsoleAction::Continue => {}
            ConsoleAction::Close => return Ok(()),
            ConsoleAction::Run => break,
        }
    }

    let (fault_rules, verbose) = console.into_parts();
    config.verbose = verbose;

    let relay = RelaySession::new(Arc::new(config), Box::new(client_socket), Box::new(general_socket), fault_rules);
    info!("relaying from {} to {}", relay.client_socket_addr()?, args.server);
    relay.run().await
}
