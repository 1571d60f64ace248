//! Blocking SOCKS5 and HTTP CONNECT client handshakes for outbound dialing
//! through a local proxy. The NTCP2 handshake starts only after the tunnel
//! is up.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{IpAddr, TcpStream};

use log::debug;

use crate::error::Error;

/// No-auth SOCKS5 tunnel to `host:port`. Hostnames are unsupported: NTCP2
/// always dials published IP addresses.
pub fn socks5_connect(stream: &mut TcpStream, host: IpAddr, port: u16) -> Result<(), Error> {
	stream.write_all(&[0x05, 0x01, 0x00])?;
	let mut reply = [0u8; 2];
	stream.read_exact(&mut reply)?;
	if reply[0] != 0x05 || reply[1] != 0x00 {
		return Err(Error::Proxy(format!(
			"socks5 proxy rejected authentication: {:#04x}",
			reply[1]
		)));
	}
	let mut request = vec![0x05, 0x01, 0x00];
	match host {
		IpAddr::V4(v4) => {
			request.push(0x01);
			request.extend_from_slice(&v4.octets());
		}
		IpAddr::V6(v6) => {
			request.push(0x04);
			request.extend_from_slice(&v6.octets());
		}
	}
	request.extend_from_slice(&port.to_be_bytes());
	stream.write_all(&request)?;

	let mut reply = [0u8; 10];
	stream.read_exact(&mut reply)?;
	if reply[1] != 0x00 {
		return Err(Error::Proxy(format!("socks5 connect failed: {:#04x}", reply[1])));
	}
	debug!("NTCP2: socks5 tunnel to {}:{} established", host, port);
	Ok(())
}

/// HTTP/1.1 CONNECT tunnel to `host:port`; only a 200 response is accepted.
pub fn http_connect(stream: &mut TcpStream, host: IpAddr, port: u16) -> Result<(), Error> {
	let authority = match host {
		IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
		IpAddr::V4(v4) => format!("{}:{}", v4, port),
	};
	let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
	stream.write_all(request.as_bytes())?;

	let mut reader = BufReader::new(stream.try_clone()?);
	let mut status = String::new();
	reader.read_line(&mut status)?;
	if status.split_whitespace().nth(1) != Some("200") {
		return Err(Error::Proxy(format!(
			"http proxy rejected request: {}",
			status.trim()
		)));
	}
	loop {
		let mut line = String::new();
		if reader.read_line(&mut line)? == 0 {
			return Err(Error::Proxy("http proxy response truncated".to_string()));
		}
		if line == "\r\n" || line == "\n" {
			break;
		}
	}
	debug!("NTCP2: http tunnel to {} established", authority);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::{Ipv4Addr, TcpListener};
	use std::thread;

	fn with_mock_proxy<F>(server: F) -> TcpStream
	where
		F: FnOnce(TcpStream) + Send + 'static,
	{
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap();
		thread::spawn(move || {
			let (stream, _) = listener.accept().unwrap();
			server(stream);
		});
		TcpStream::connect(addr).unwrap()
	}

	#[test]
	fn socks5_tunnel_succeeds() {
		let mut client = with_mock_proxy(|mut stream| {
			let mut greeting = [0u8; 3];
			stream.read_exact(&mut greeting).unwrap();
			assert_eq!(greeting, [0x05, 0x01, 0x00]);
			stream.write_all(&[0x05, 0x00]).unwrap();

			let mut request = [0u8; 10];
			stream.read_exact(&mut request).unwrap();
			assert_eq!(&request[..4], &[0x05, 0x01, 0x00, 0x01]);
			assert_eq!(&request[4..8], &[10, 0, 0, 1]);
			assert_eq!(u16::from_be_bytes([request[8], request[9]]), 9001);
			stream
				.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
				.unwrap();
		});
		socks5_connect(&mut client, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 9001).unwrap();
	}

	#[test]
	fn socks5_connect_failure_is_an_error() {
		let mut client = with_mock_proxy(|mut stream| {
			let mut greeting = [0u8; 3];
			stream.read_exact(&mut greeting).unwrap();
			stream.write_all(&[0x05, 0x00]).unwrap();
			let mut request = [0u8; 10];
			stream.read_exact(&mut request).unwrap();
			// host unreachable
			stream
				.write_all(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
				.unwrap();
		});
		let err =
			socks5_connect(&mut client, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 9001).unwrap_err();
		assert!(matches!(err, Error::Proxy(_)));
	}

	#[test]
	fn http_tunnel_succeeds() {
		let mut client = with_mock_proxy(|stream| {
			let mut reader = BufReader::new(stream.try_clone().unwrap());
			let mut line = String::new();
			reader.read_line(&mut line).unwrap();
			assert!(line.starts_with("CONNECT 10.0.0.1:9001 HTTP/1.1"));
			loop {
				let mut header = String::new();
				reader.read_line(&mut header).unwrap();
				if header == "\r\n" {
					break;
				}
			}
			let mut stream = stream;
			stream
				.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
				.unwrap();
		});
		http_connect(&mut client, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 9001).unwrap();
	}

	#[test]
	fn http_rejection_is_an_error() {
		let mut client = with_mock_proxy(|mut stream| {
			let mut reader = BufReader::new(stream.try_clone().unwrap());
			let mut line = String::new();
			reader.read_line(&mut line).unwrap();
			stream
				.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
				.unwrap();
		});
		let err = http_connect(&mut client, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 9001)
			.unwrap_err();
		assert!(matches!(err, Error::Proxy(_)));
	}
}
