//! Example of a TCP echo service driven by the socket dispatcher

use std::{
    io::{self, Read, Write},
    sync::Arc,
    time::Duration,
};

use tracing_subscriber::{EnvFilter, FmtSubscriber};

use muxio::{DispatcherConfig, DispatcherHandle, Socket, SocketDispatcher, SocketHandler};

struct EchoHandler;

impl SocketHandler for EchoHandler {
    fn readable(&self, dispatcher: &DispatcherHandle, socket: &Socket) -> io::Result<bool> {
        let mut stream = socket;
        let mut buffer = [0u8; 1024];
        loop {
            match stream.read(&mut buffer) {
                Ok(0) => {
                    tracing::info!("peer closed {:?}", socket.peer_addr());
                    dispatcher.remove_socket(socket);
                    return Ok(false);
                }
                Ok(n) => stream.write_all(&buffer[..n])?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => {
                    dispatcher.close_socket(socket);
                    return Err(e);
                }
            }
        }
    }

    fn timeout(&self, dispatcher: &DispatcherHandle, socket: &Socket) -> io::Result<()> {
        tracing::info!("idle timeout, closing {:?}", socket.peer_addr());
        dispatcher.close_socket(socket);
        Ok(())
    }

    fn exception(&self, dispatcher: &DispatcherHandle, socket: &Socket) -> io::Result<()> {
        tracing::info!("exception condition, closing {:?}", socket.peer_addr());
        dispatcher.close_socket(socket);
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut dispatcher = SocketDispatcher::new(DispatcherConfig::default())?;
    let handler: Arc<EchoHandler> = Arc::new(EchoHandler);

    let listener = std::net::TcpListener::bind(("127.0.0.1", 3456))?;
    listener.set_nonblocking(true)?;
    tracing::info!("echo server listening on {:?}", listener.local_addr()?);

    let (shutdown_tx, shutdown_rx) = flume::unbounded();

    std::thread::spawn(move || {
        tracing::info!("Press ENTER to exit echo server loop");
        let _ = std::io::stdin().read(&mut [0]).unwrap();
        shutdown_tx.send(())
    });

    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                tracing::info!("accepted {peer_addr:?}");
                let socket = Socket::new(stream)?;
                dispatcher.add_socket(socket, handler.clone(), Duration::from_secs(30));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => tracing::error!("accept failure {e:}"),
        }

        if shutdown_rx.try_recv().is_ok() {
            tracing::info!("Shutdown notice received!");
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    dispatcher.stop();
    tracing::info!("Exiting");
    Ok(())
}
