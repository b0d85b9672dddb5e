use std::{
    error::Error,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
        mpsc,
    },
    thread,
};

use clap::Parser;
use log::{debug, info, warn};
use virtrpc::{
    protocol::{
        Client, ErrorCode, Message, Procedure, ProcedureTable, Program, ProtocolTransport,
        RpcError, RpcServer, TransportError,
    },
    thread::PoolConfig,
};

const HOST_PROGRAM: u32 = 0x2000_8086;
const HOST_VERSION: u32 = 1;

#[derive(Debug, Parser)]
#[command(version, about = "Serve the host RPC program over TCP", long_about = None)]
struct Cli {
    /// Listen for new connection at address
    address: SocketAddr,
    /// Regular workers started up front
    #[arg(long, default_value_t = 5)]
    min_workers: usize,
    /// Upper bound for regular workers
    #[arg(long, default_value_t = 20)]
    max_workers: usize,
    /// Workers reserved for priority calls
    #[arg(long, default_value_t = 5)]
    priority_workers: usize,
}

struct Host {
    calls: AtomicU64,
}

fn host_program() -> Program<Host> {
    let procedures = ProcedureTable::new()
        .register(
            Procedure::new("ping", |host: &Host, _, _, (): ()| {
                Ok::<_, RpcError>(host.calls.fetch_add(1, Ordering::Relaxed))
            })
            .without_auth()
            .with_priority(),
        )
        .register(
            Procedure::new("version", |_: &Host, _, _, (): ()| {
                Ok::<_, RpcError>(String::from(env!("CARGO_PKG_VERSION")))
            })
            .without_auth(),
        )
        .register(Procedure::new("echo", |host: &Host, _, _, text: String| {
            host.calls.fetch_add(1, Ordering::Relaxed);
            if text.is_empty() {
                return Err(RpcError::handler(ErrorCode::InvalidArg, "nothing to echo"));
            }
            Ok(text)
        }))
        .register(Procedure::new("reboot", |_: &Host, _, _, (): ()| {
            Err::<(), _>(
                RpcError::handler(ErrorCode::NoSupport, "reboot is not supported by this host")
                    .warning(),
            )
        }));
    Program::new(HOST_PROGRAM, HOST_VERSION, procedures)
}

/// Client whose replies are written straight to its socket.
struct TcpClient {
    peer: SocketAddr,
    writer: Mutex<ProtocolTransport<TcpStream>>,
}

impl Client for TcpClient {
    fn needs_auth(&self) -> bool {
        false
    }

    fn send_message(&self, message: Message) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().map_err(|_| TransportError::Closed)?;
        writer.write_message(&message)
    }

    fn close(&self) {
        if let Ok(writer) = self.writer.lock() {
            let _ = writer.get_ref().shutdown(Shutdown::Both);
        }
    }
}

fn handle_connection(server: &RpcServer<Host>, stream: TcpStream) -> Result<(), TransportError> {
    let peer = stream.peer_addr()?;
    let client = Arc::new(TcpClient {
        peer,
        writer: Mutex::new(ProtocolTransport::new(stream.try_clone()?)),
    });
    let mut transport = ProtocolTransport::new(stream);

    loop {
        let message = match transport.read_message() {
            Ok(message) => message,
            Err(TransportError::Closed) => {
                info!("client {} disconnected", client.peer);
                return Ok(());
            }
            Err(e) => {
                client.close();
                return Err(e);
            }
        };
        debug!("received {:?} from {}", message.header, client.peer);

        if let Err(e) = server.dispatch(client.clone(), message) {
            warn!("dropping client {}: {e}", client.peer);
            client.close();
            return Ok(());
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = PoolConfig {
        name: String::from("rpc-worker"),
        min_workers: cli.min_workers,
        max_workers: cli.max_workers,
        priority_workers: cli.priority_workers,
    };

    let mut server = RpcServer::new(Host { calls: AtomicU64::new(0) }, config)?;
    server.add_program(host_program());
    let server = Arc::new(server);

    let listener = TcpListener::bind(cli.address)?;
    info!("listening at {}", cli.address);

    let acceptor = Arc::clone(&server);
    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = Arc::clone(&acceptor);
                    thread::spawn(move || {
                        if let Err(e) = handle_connection(&server, stream) {
                            warn!("broken connection: {e}");
                        }
                    });
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
    });

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    let _ = rx.recv();

    info!("shutting down");
    server.shutdown();
    info!(
        "served {} calls",
        server.state().calls.load(Ordering::Relaxed)
    );
    Ok(())
}
