use std::{env, io, net::SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;

/// Create a TCP listener with address reuse enabled and the given backlog.
///
/// The socket is set non-blocking before being handed to tokio, so a bind
/// with port 0 can be used to get an OS-assigned port for tests.
pub(crate) fn new_reusable_tcp_listener(
    addr: SocketAddr,
    backlog: i32,
) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    TcpListener::from_std(std::net::TcpListener::from(socket))
}

/// Get the server listen port, either from environment or default 5064
pub fn get_default_server_port() -> u16 {
    env::var("BEAMSIM_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(5064u16)
}

/// Parse a protocol number: optional sign, digits, optional fraction and
/// exponent. Surrounding whitespace is tolerated; anything else trailing,
/// or a value that overflows a finite double, fails.
pub fn parse_number(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value: f64 = trimmed.parse().ok()?;
    value.is_finite().then_some(value)
}

/// Render a value the way `%.6g` would: up to six significant digits,
/// trailing zeros stripped, scientific notation outside [1e-4, 1e6).
pub fn format_value(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    if !value.is_finite() {
        return value.to_string();
    }
    // Round to six significant digits first so the notation choice sees
    // the rounded exponent (999999.5 prints as 1e+06, not 1000000).
    let sci = format!("{value:.5e}");
    let (mantissa, exponent) = sci.split_once('e').unwrap();
    let exponent: i32 = exponent.parse().unwrap();
    if (-4..6).contains(&exponent) {
        let precision = (5 - exponent).max(0) as usize;
        let fixed = format!("{value:.precision$}");
        if fixed.contains('.') {
            fixed.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            fixed
        }
    } else {
        let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
        format!("{mantissa}e{exponent:+03}")
    }
}
