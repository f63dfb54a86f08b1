#![forbid(unsafe_code)]

pub mod endpoint {
	/// Parsed `ws://host:port[/path]` (or `wss://`) substrate endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct MeshEndpoint {
		pub secure: bool,
		pub host: String,
		pub port: u16,
		/// Request path including the leading `/`; empty when none was given.
		pub path: String,
	}

	impl MeshEndpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Full URL suitable for a websocket connect call.
		pub fn url(&self) -> String {
			let scheme = if self.secure { "wss" } else { "ws" };
			format!("{scheme}://{}{}", self.hostport(), self.path)
		}

		/// Parse a substrate endpoint string in the form `ws://host:port[/path]`.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected ws://host:port)".to_string());
			}

			let (secure, rest) = if let Some(rest) = s.strip_prefix("ws://") {
				(false, rest)
			} else if let Some(rest) = s.strip_prefix("wss://") {
				(true, rest)
			} else {
				return Err(format!("invalid endpoint (expected ws://host:port): {s}"));
			};

			if rest.contains('?') || rest.contains('#') {
				return Err(format!(
					"invalid endpoint (expected ws://host:port without query/fragment): {s}"
				));
			}

			let (authority, path) = match rest.find('/') {
				Some(idx) => (&rest[..idx], &rest[idx..]),
				None => (rest, ""),
			};

			let (host, port_str) = authority
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port, expected ws://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected ws://host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!(
					"invalid endpoint host (IPv6 must be bracketed like ws://[::1]:6787): {s}"
				));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			let path = if path == "/" { "" } else { path };

			Ok(Self {
				secure,
				host: host.to_string(),
				port,
				path: path.to_string(),
			})
		}
	}

}
