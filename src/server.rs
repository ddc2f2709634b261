use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};

use crate::router::Router;

/// Binds `host:port` and serves one-shot client/peer connections forever:
/// accept, read one line, hand it to `router`, write one reply line, close.
/// Matches the wire contract in SPEC_FULL.md §6 — every request is its own
/// connection, so there is no per-connection state to keep between lines.
pub fn serve(host: &str, port: u16, router: Arc<Router>) -> std::io::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr)?;
    info!("listening on {addr}");
    for incoming in listener.incoming() {
        match incoming {
            Ok(stream) => {
                let router = Arc::clone(&router);
                thread::spawn(move || handle_connection(stream, router));
            }
            Err(e) => warn!("accept failed: {e}"),
        }
    }
    Ok(())
}

fn handle_connection(stream: TcpStream, router: Arc<Router>) {
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "unknown".to_string());
    let mut writer = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            error!("failed to clone stream for {peer}: {e}");
            return;
        }
    };
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    match reader.read_line(&mut line) {
        Ok(0) => debug!("{peer}: connection closed before a request was sent"),
        Ok(_) => {
            let trimmed = line.trim_end_matches('\n').trim_end_matches('\r');
            let reply = router.handle_line(trimmed);
            if let Err(e) = writeln!(writer, "{reply}") {
                warn!("{peer}: failed to write reply: {e}");
            }
        }
        Err(e) => warn!("{peer}: failed to read request: {e}"),
    }
}
