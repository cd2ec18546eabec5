//! A TCP echo server built directly on `FdHandler`.
//!
//! Unlike the coroutine-based echo servers this crate's ancestor shipped,
//! every connection here is driven by one plain, non-blocking callback —
//! there is no per-connection stack, just a `TcpStream` captured by a
//! closure and restarted on every readiness notification.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use reactora::{Config, EventMask, FdHandler, Loop};

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5555";

fn listen_addr() -> SocketAddr {
    SocketAddr::from_str(DEFAULT_LISTEN_ADDR).unwrap()
}

fn serve_connection(lp: &Loop, conn: TcpStream) {
    conn.set_nonblocking(true).expect("set_nonblocking");
    let fd = conn.as_raw_fd();
    let conn = Arc::new(Mutex::new(conn));

    // A connection's `FdHandler` needs to stop itself once the peer is
    // gone, so its own handle is stashed here once it exists.
    let self_handle: Arc<Mutex<Option<FdHandler>>> = Arc::new(Mutex::new(None));

    let lp_cb = lp.clone();
    let conn_cb = Arc::clone(&conn);
    let self_handle_cb = Arc::clone(&self_handle);
    let handler = FdHandler::new(fd, EventMask::READ, move || {
        let mut buf = [0u8; 16 * 1024];
        let mut stream = conn_cb.lock().unwrap();
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    if let Some(h) = self_handle_cb.lock().unwrap().take() {
                        let _ = h.stop(&lp_cb);
                    }
                    return;
                }
                Ok(n) => {
                    if stream.write_all(&buf[..n]).is_err() {
                        if let Some(h) = self_handle_cb.lock().unwrap().take() {
                            let _ = h.stop(&lp_cb);
                        }
                        return;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => {
                    if let Some(h) = self_handle_cb.lock().unwrap().take() {
                        let _ = h.stop(&lp_cb);
                    }
                    return;
                }
            }
        }
    });

    *self_handle.lock().unwrap() = Some(handler.clone());
    handler.start(lp).expect("failed to start connection handler");
}

fn main() {
    env_logger::init();

    let lp = Loop::new(Config::new()).expect("failed to build loop");
    let addr = listen_addr();
    let listener = TcpListener::bind(addr).expect("bind failed");
    listener.set_nonblocking(true).expect("set_nonblocking");
    println!("listening on {addr}");

    let listener_fd = listener.as_raw_fd();
    let lp_accept = lp.clone();
    let accept_handler = FdHandler::new(listener_fd, EventMask::READ, move || loop {
        match listener.accept() {
            Ok((conn, peer)) => {
                println!("accepted {peer}");
                serve_connection(&lp_accept, conn);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => {
                log::warn!("accept failed: {e}");
                break;
            }
        }
    });
    accept_handler
        .start(&lp)
        .expect("failed to start listener handler");

    lp.run();
}
