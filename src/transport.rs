use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

use log::{debug, warn};

/// Bound on retry attempts for `send_and_recv`. The spec only says "retries
/// on transient failure until a reply is obtained or a hard failure
/// occurs" without naming what's hard; DNS/connect failures here are
/// treated as transient up to this many attempts before giving up, which
/// keeps a genuinely dead peer from wedging the caller forever. Documented
/// in DESIGN.md.
const MAX_RETRIES: u32 = 8;
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// One-shot request/response over a fresh TCP connection: connect, write
/// `msg` terminated with `\n`, read one line back, close. Bounded end to
/// end by `timeout`. Returns `None` on any failure (connect, write, read,
/// or timeout), mirroring `utils.send_and_recv_no_retry` in the source.
pub fn send_and_recv_no_retry(msg: &str, host: &str, port: u16, timeout: Duration) -> Option<String> {
    let addr = format!("{host}:{port}");
    let mut stream = TcpStream::connect_timeout(&resolve(&addr)?, timeout).ok()?;
    stream.set_read_timeout(Some(timeout)).ok()?;
    stream.set_write_timeout(Some(timeout)).ok()?;
    stream.write_all(msg.as_bytes()).ok()?;
    stream.write_all(b"\n").ok()?;
    stream.flush().ok()?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    match reader.read_line(&mut line) {
        Ok(0) => None,
        Ok(_) => Some(line.trim_end_matches('\n').trim_end_matches('\r').to_string()),
        Err(e) => {
            debug!("send_and_recv_no_retry: read failed from {addr}: {e}");
            None
        }
    }
}

/// Retrying variant used for cross-shard forwarding, where the target is
/// expected to be reachable and a transient blip shouldn't surface as a
/// client-visible `ko`.
pub fn send_and_recv(msg: &str, host: &str, port: u16, per_attempt_timeout: Duration) -> Option<String> {
    for attempt in 0..MAX_RETRIES {
        if let Some(reply) = send_and_recv_no_retry(msg, host, port, per_attempt_timeout) {
            return Some(reply);
        }
        warn!("send_and_recv: attempt {attempt} to {host}:{port} failed, retrying");
        std::thread::sleep(RETRY_BACKOFF);
    }
    None
}

fn resolve(addr: &str) -> Option<std::net::SocketAddr> {
    use std::net::ToSocketAddrs;
    addr.to_socket_addrs().ok()?.next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn no_retry_round_trips_a_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 256];
            let n = stream.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"GET x 1\n");
            stream.write_all(b"1\n").unwrap();
        });
        let reply = send_and_recv_no_retry("GET x 1", "127.0.0.1", port, Duration::from_secs(1));
        assert_eq!(reply, Some("1".to_string()));
        handle.join().unwrap();
    }

    #[test]
    fn no_retry_returns_none_on_unreachable_port() {
        let reply = send_and_recv_no_retry("GET x 1", "127.0.0.1", 1, Duration::from_millis(200));
        assert_eq!(reply, None);
    }
}
