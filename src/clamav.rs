use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::error::{ScanError, ScanResult};
use crate::net::{self, SocketAddress, Stream};
use crate::upstream::Upstream;

/// Replies are a single line echoing the scanned path.
const REPLY_CAPACITY: usize = 4096 + 10;

/// Name clamd echoes for data received over a stream connection.
const STREAM_PATH: &str = "stream";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "signature", rename_all = "lowercase")]
pub enum AvVerdict {
    Clean,
    Infected(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ClamavTimeouts {
    pub connect: Duration,
    pub port: Duration,
    pub data: Duration,
    pub results: Duration,
}

impl Default for ClamavTimeouts {
    fn default() -> Self {
        ClamavTimeouts {
            connect: Duration::from_millis(1000),
            port: Duration::from_millis(5000),
            data: Duration::from_millis(15000),
            results: Duration::from_millis(15000),
        }
    }
}

/// Submits `file` to one clamd upstream, with `SCAN <path>` over Unix sockets
/// and `STREAM` over TCP, and classifies its reply.
pub fn scan(upstream: &Upstream, file: &Path, timeouts: &ClamavTimeouts) -> ScanResult<AvVerdict> {
    let result = scan_inner(upstream, file, timeouts);
    if let Err(e) = &result {
        log::warn!("clamav: {} ({}): {e}", upstream.name, upstream.address);
    }
    result
}

fn scan_inner(upstream: &Upstream, file: &Path, timeouts: &ClamavTimeouts) -> ScanResult<AvVerdict> {
    let (mut control, echoed) = match &upstream.address {
        SocketAddress::Unix(_) => {
            let path = fs::canonicalize(file)
                .map_err(|e| ScanError::transport("resolving message path", e))?;
            let mut control = connect(&upstream.address, timeouts)?;
            control
                .write_all(format!("SCAN {}\n", path.display()).as_bytes())
                .map_err(|e| ScanError::transport("sending SCAN command", e))?;
            (control, path.display().to_string())
        }
        SocketAddress::Inet(addr) => {
            let mut control = connect(&upstream.address, timeouts)?;
            send_stream(&mut control, *addr, file, timeouts)?;
            (control, STREAM_PATH.to_string())
        }
    };

    let reply = net::read_reply(&mut control, timeouts.results, REPLY_CAPACITY)
        .map_err(|e| ScanError::net("waiting for scan results", e))?;
    drop(control);

    classify_reply(&String::from_utf8_lossy(&reply), &echoed)
}

fn connect(addr: &SocketAddress, timeouts: &ClamavTimeouts) -> ScanResult<Stream> {
    let stream = net::connect_with_timeout(addr, timeouts.connect)
        .map_err(|e| ScanError::net("connecting", e))?;
    stream
        .set_io_timeout(timeouts.results)
        .map_err(|e| ScanError::transport("configuring socket", e))?;
    Ok(stream)
}

/// Runs the `STREAM` handshake and ships the message over the data port
/// clamd hands out.
fn send_stream(
    control: &mut Stream,
    addr: SocketAddrV4,
    file: &Path,
    timeouts: &ClamavTimeouts,
) -> ScanResult<()> {
    control
        .write_all(b"STREAM\n")
        .map_err(|e| ScanError::transport("sending STREAM command", e))?;

    match net::wait_readable(control, timeouts.port) {
        Ok(0) => return Err(ScanError::Timeout("waiting for data port")),
        Ok(_) => {}
        Err(e) => return Err(ScanError::net("waiting for data port", e)),
    }
    let mut buf = [0u8; 256];
    let n = control
        .read(&mut buf)
        .map_err(|e| ScanError::transport("reading data port", e))?;
    let port = parse_port_reply(&buf[..n])?;

    let data_addr = SocketAddress::Inet(SocketAddrV4::new(*addr.ip(), port));
    let mut data = net::connect_with_timeout(&data_addr, timeouts.data)
        .map_err(|e| ScanError::net("connecting data port", e))?;
    data.set_io_timeout(timeouts.data)
        .map_err(|e| ScanError::transport("configuring socket", e))?;

    let mut message =
        File::open(file).map_err(|e| ScanError::transport("opening message", e))?;
    io::copy(&mut message, &mut data)
        .map_err(|e| ScanError::transport("sending message", e))?;

    match data.shutdown(Shutdown::Both) {
        Err(e) if e.kind() != io::ErrorKind::NotConnected => {
            Err(ScanError::transport("closing data port", e))
        }
        _ => Ok(()),
    }
}

/// Parses clamd's `PORT <n>` reply. Privileged ports are refused, which
/// also catches garbage that happens to start with the marker.
fn parse_port_reply(reply: &[u8]) -> ScanResult<u16> {
    let text = String::from_utf8_lossy(reply);
    let port = text
        .strip_prefix("PORT ")
        .map(|rest| {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u32>().unwrap_or(0)
        })
        .unwrap_or(0);

    if !(1024..=u32::from(u16::MAX)).contains(&port) {
        return Err(ScanError::Protocol(format!(
            "can't get port number for data stream, got: {}",
            text.trim_end()
        )));
    }
    Ok(port as u16)
}

/// Classifies a clamd reply for a submission named `path`.
pub fn classify_reply(reply: &str, path: &str) -> ScanResult<AvVerdict> {
    if reply.contains("OK\n") {
        return Ok(AvVerdict::Clean);
    }

    if let Some(found) = reply.find("FOUND\n") {
        let prefix_len = path.len() + 2;
        let echoed = reply.starts_with(path) && reply[path.len()..].starts_with(": ");
        if !echoed || found < prefix_len {
            return Err(ScanError::Protocol(format!(
                "paths differ: '{}' instead of '{path}'",
                reply.trim_end()
            )));
        }
        let signature = reply[prefix_len..found].trim();
        if signature.is_empty() {
            return Err(ScanError::Protocol(format!(
                "no signature name in '{}'",
                reply.trim_end()
            )));
        }
        return Ok(AvVerdict::Infected(signature.to_string()));
    }

    if let Some(error) = reply.find("ERROR\n") {
        return Err(ScanError::Protocol(format!(
            "clamd error: {}",
            reply[..error].trim_end()
        )));
    }

    Err(ScanError::UnexpectedReply(reply.trim_end().to_string()))
}
